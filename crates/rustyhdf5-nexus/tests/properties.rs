//! Property tests: axis-value lookup and repeated lazy reads.

use proptest::prelude::*;
use rustyhdf5_nexus::selection::{convert_index, index_of};
use rustyhdf5_nexus::{load, Array, Coord, Group, Index};

fn ascending() -> impl Strategy<Value = Vec<f64>> {
    prop::collection::vec(0.1f64..10.0, 2..40).prop_map(|steps| {
        let mut total = 0.0;
        steps
            .into_iter()
            .map(|s| {
                total += s;
                total
            })
            .collect()
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Exact axis values map back to their own position.
    #[test]
    fn exact_values_find_themselves(axis in ascending(), pick in any::<prop::sample::Index>()) {
        let i = pick.index(axis.len());
        prop_assert_eq!(index_of(&axis, axis[i], false), i);
        prop_assert_eq!(index_of(&axis, axis[i], true), i);
    }

    /// Results stay inside the axis, whatever the value.
    #[test]
    fn positions_are_clipped(axis in ascending(), value in -100.0f64..500.0, max in any::<bool>()) {
        prop_assert!(index_of(&axis, value, max) < axis.len());
    }

    /// A decreasing axis gives the mirrored position of the increasing one.
    #[test]
    fn descending_axes_mirror(axis in ascending(), pick in any::<prop::sample::Index>()) {
        let i = pick.index(axis.len());
        let reversed: Vec<f64> = axis.iter().rev().copied().collect();
        prop_assert_eq!(index_of(&reversed, axis[i], false), axis.len() - 1 - i);
    }

    /// Position lookup is monotonic in the value on increasing axes.
    #[test]
    fn lookup_is_monotonic(axis in ascending(), a in 0.0f64..400.0, b in 0.0f64..400.0) {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        prop_assert!(index_of(&axis, lo, false) <= index_of(&axis, hi, false));
        prop_assert!(index_of(&axis, lo, true) <= index_of(&axis, hi, true));
    }

    /// Converted value ranges are integer ranges in axis order.
    #[test]
    fn converted_ranges_are_ordered(axis in ascending(), a in 0.0f64..400.0, b in 0.0f64..400.0) {
        let values = Array::from(axis.clone());
        let index = Index::range(Some(Coord::Real(a)), Some(Coord::Real(b)));
        match convert_index(&index, &values).unwrap() {
            Index::Range { start: Some(Coord::Int(start)), stop: Some(Coord::Int(stop)), .. } => {
                prop_assert!(start <= stop);
                prop_assert!(stop as usize <= axis.len());
            }
            Index::At(Coord::Int(i)) => prop_assert!((i as usize) < axis.len()),
            other => prop_assert!(false, "unexpected index {:?}", other),
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    /// Reading a stored field twice, by slab or whole, gives the same values.
    #[test]
    fn lazy_reads_are_idempotent(len in 1usize..3000, start in 0usize..3000, width in 1usize..50) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lazy.nxs");
        let values: Vec<f64> = (0..len).map(|i| (i as f64).sqrt()).collect();
        let entry = Group::entry();
        entry.set("values", values.clone()).unwrap();
        entry.save(&path, "w").unwrap();

        let root = load(&path, "r").unwrap();
        let field = root.field("entry/values").unwrap();
        let start = start % len;
        let stop = (start + width).min(len);
        let first = field.get(start..stop).unwrap().to_f64_vec().unwrap();
        let second = field.get(start..stop).unwrap().to_f64_vec().unwrap();
        prop_assert_eq!(&first, &second);
        prop_assert_eq!(&first[..], &values[start..stop]);
        prop_assert_eq!(field.to_f64_vec().unwrap(), values);
    }
}

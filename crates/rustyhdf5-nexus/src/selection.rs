//! Index expressions and their resolution to hyperslabs.
//!
//! A [`Selection`] is a list of per-dimension [`Index`] values, written with
//! plain integers and ranges (`(0, 1..3)`) or with the [`sel!`](crate::sel)
//! macro. Floating point coordinates select by axis value instead of
//! position and are converted against an axis with [`convert_index`] before
//! the selection is resolved against a shape.

use std::ops::{Range, RangeFrom, RangeFull, RangeTo};

use crate::array::Array;
use crate::error::{Error, Result};

/// A position: an array index or an axis value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Coord {
    Int(i64),
    Real(f64),
}

impl Coord {
    pub fn value(self) -> f64 {
        match self {
            Coord::Int(i) => i as f64,
            Coord::Real(v) => v,
        }
    }

    pub fn is_real(self) -> bool {
        matches!(self, Coord::Real(_))
    }
}

/// Selection along one dimension.
#[derive(Debug, Clone, PartialEq)]
pub enum Index {
    /// A single position; the dimension is dropped from the result.
    At(Coord),
    /// A half-open range with an optional step.
    Range {
        start: Option<Coord>,
        stop: Option<Coord>,
        step: Option<i64>,
    },
}

impl Index {
    /// The whole dimension.
    pub fn all() -> Index {
        Index::Range { start: None, stop: None, step: None }
    }

    pub fn range(start: Option<Coord>, stop: Option<Coord>) -> Index {
        Index::Range { start, stop, step: None }
    }

    pub fn with_step(self, step: i64) -> Index {
        match self {
            Index::Range { start, stop, .. } => Index::Range { start, stop, step: Some(step) },
            at => at,
        }
    }

    /// True if any bound is an axis value rather than a position.
    pub fn is_real(&self) -> bool {
        match self {
            Index::At(c) => c.is_real(),
            Index::Range { start, stop, .. } => {
                start.map_or(false, Coord::is_real) || stop.map_or(false, Coord::is_real)
            }
        }
    }
}

macro_rules! index_from_int {
    ($($t:ty),*) => {
        $(
            impl From<$t> for Coord {
                fn from(v: $t) -> Self {
                    Coord::Int(v as i64)
                }
            }
            impl From<$t> for Index {
                fn from(v: $t) -> Self {
                    Index::At(Coord::Int(v as i64))
                }
            }
            impl From<Range<$t>> for Index {
                fn from(r: Range<$t>) -> Self {
                    Index::range(Some(Coord::from(r.start)), Some(Coord::from(r.end)))
                }
            }
            impl From<RangeFrom<$t>> for Index {
                fn from(r: RangeFrom<$t>) -> Self {
                    Index::range(Some(Coord::from(r.start)), None)
                }
            }
            impl From<RangeTo<$t>> for Index {
                fn from(r: RangeTo<$t>) -> Self {
                    Index::range(None, Some(Coord::from(r.end)))
                }
            }
        )*
    };
}

macro_rules! index_from_real {
    ($($t:ty),*) => {
        $(
            impl From<$t> for Coord {
                fn from(v: $t) -> Self {
                    Coord::Real(v as f64)
                }
            }
            impl From<$t> for Index {
                fn from(v: $t) -> Self {
                    Index::At(Coord::Real(v as f64))
                }
            }
            impl From<Range<$t>> for Index {
                fn from(r: Range<$t>) -> Self {
                    Index::range(Some(Coord::from(r.start)), Some(Coord::from(r.end)))
                }
            }
            impl From<RangeFrom<$t>> for Index {
                fn from(r: RangeFrom<$t>) -> Self {
                    Index::range(Some(Coord::from(r.start)), None)
                }
            }
            impl From<RangeTo<$t>> for Index {
                fn from(r: RangeTo<$t>) -> Self {
                    Index::range(None, Some(Coord::from(r.end)))
                }
            }
        )*
    };
}

index_from_int!(i32, i64, usize);
index_from_real!(f32, f64);

impl From<RangeFull> for Index {
    fn from(_: RangeFull) -> Self {
        Index::all()
    }
}

/// One index per leading dimension; missing trailing dimensions are whole.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Selection(Vec<Index>);

impl Selection {
    pub fn new(indices: Vec<Index>) -> Selection {
        Selection(indices)
    }

    /// Everything.
    pub fn all() -> Selection {
        Selection(Vec::new())
    }

    pub fn indices(&self) -> &[Index] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn is_real(&self) -> bool {
        self.0.iter().any(Index::is_real)
    }

    /// Resolve integer indices against `shape`. Negative positions count
    /// from the end, range bounds are clipped.
    pub fn resolve(&self, shape: &[usize]) -> Result<Hyperslab> {
        if self.0.len() > shape.len() {
            return Err(Error::ShapeMismatch(format!(
                "too many indices: {} for {} dimensions",
                self.0.len(),
                shape.len()
            )));
        }
        let mut dims = Vec::with_capacity(shape.len());
        for (axis, &len) in shape.iter().enumerate() {
            let dim = match self.0.get(axis) {
                None => SlabDim::whole(len),
                Some(index) => resolve_dim(index, axis, len)?,
            };
            dims.push(dim);
        }
        Ok(Hyperslab { dims })
    }
}

impl From<Index> for Selection {
    fn from(index: Index) -> Self {
        Selection(vec![index])
    }
}

impl From<Vec<Index>> for Selection {
    fn from(indices: Vec<Index>) -> Self {
        Selection(indices)
    }
}

impl From<()> for Selection {
    fn from(_: ()) -> Self {
        Selection::all()
    }
}

macro_rules! selection_from {
    ($($t:ty),*) => {
        $(impl From<$t> for Selection {
            fn from(v: $t) -> Self {
                Selection(vec![Index::from(v)])
            }
        })*
    };
}

selection_from!(
    i32, i64, usize, f32, f64, RangeFull,
    Range<i32>, Range<i64>, Range<usize>, Range<f32>, Range<f64>,
    RangeFrom<i32>, RangeFrom<i64>, RangeFrom<usize>, RangeFrom<f64>,
    RangeTo<i32>, RangeTo<i64>, RangeTo<usize>, RangeTo<f64>
);

macro_rules! selection_from_tuple {
    ($($name:ident $var:ident),+) => {
        impl<$($name: Into<Index>),+> From<($($name,)+)> for Selection {
            fn from(($($var,)+): ($($name,)+)) -> Self {
                Selection(vec![$($var.into()),+])
            }
        }
    };
}

selection_from_tuple!(A a, B b);
selection_from_tuple!(A a, B b, C c);
selection_from_tuple!(A a, B b, C c, D d);

/// Build a [`Selection`] from a list of indices: `sel![0, 2.0..5.0, ..]`.
#[macro_export]
macro_rules! sel {
    () => { $crate::Selection::all() };
    ($($index:expr),+ $(,)?) => {
        $crate::Selection::new(vec![$($crate::Index::from($index)),+])
    };
}

fn resolve_dim(index: &Index, axis: usize, len: usize) -> Result<SlabDim> {
    let position = |c: Coord| match c {
        Coord::Int(i) => Ok(i),
        Coord::Real(v) => Err(Error::InvalidOperation(format!(
            "floating point index {v} needs an axis to be converted"
        ))),
    };
    let n = len as i64;
    match index {
        Index::At(c) => {
            let given = position(*c)?;
            let i = if given < 0 { given + n } else { given };
            if i < 0 || i >= n {
                return Err(Error::InvalidOperation(format!(
                    "index {given} is out of bounds for axis {axis} with size {len}"
                )));
            }
            Ok(SlabDim { start: i as usize, count: 1, step: 1, keep: false })
        }
        Index::Range { start, stop, step } => {
            let step = step.unwrap_or(1);
            if step == 0 {
                return Err(Error::InvalidOperation("slice step cannot be zero".into()));
            }
            let start = start.map(position).transpose()?;
            let stop = stop.map(position).transpose()?;
            let wrap = |i: i64| if i < 0 { i + n } else { i };
            let (first, count) = if step > 0 {
                let first = start.map_or(0, |i| wrap(i).clamp(0, n));
                let last = stop.map_or(n, |i| wrap(i).clamp(0, n));
                (first, (last - first + step - 1).div_euclid(step).max(0))
            } else {
                let first = start.map_or(n - 1, |i| wrap(i).clamp(-1, n - 1));
                let last = stop.map_or(-1, |i| wrap(i).clamp(-1, n - 1));
                (first, (first - last - step - 1).div_euclid(-step).max(0))
            };
            let start = if count == 0 { 0 } else { first as usize };
            Ok(SlabDim { start, count: count as usize, step: step as isize, keep: true })
        }
    }
}

/// Resolved selection along one dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlabDim {
    pub start: usize,
    pub count: usize,
    pub step: isize,
    /// False when the dimension was selected by a single position.
    pub keep: bool,
}

impl SlabDim {
    pub fn whole(len: usize) -> SlabDim {
        SlabDim { start: 0, count: len, step: 1, keep: true }
    }
}

/// A resolved, rectangular selection with one entry per dimension.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Hyperslab {
    dims: Vec<SlabDim>,
}

impl Hyperslab {
    pub fn new(dims: Vec<SlabDim>) -> Hyperslab {
        Hyperslab { dims }
    }

    pub fn full(shape: &[usize]) -> Hyperslab {
        Hyperslab { dims: shape.iter().map(|&n| SlabDim::whole(n)).collect() }
    }

    pub fn dims(&self) -> &[SlabDim] {
        &self.dims
    }

    /// Shape of the selected values.
    pub fn shape(&self) -> Vec<usize> {
        self.dims.iter().filter(|d| d.keep).map(|d| d.count).collect()
    }

    pub fn size(&self) -> usize {
        self.dims.iter().map(|d| d.count).product()
    }

    /// True if this covers every element of `shape` in order.
    pub fn is_full(&self, shape: &[usize]) -> bool {
        self.dims.len() == shape.len()
            && self
                .dims
                .iter()
                .zip(shape)
                .all(|(d, &n)| d.keep && d.start == 0 && d.count == n && d.step == 1)
    }
}

/// Position of `value` along the monotonic `axis`.
///
/// Without `max`, the lower index is returned unless `value` sits within 1%
/// of a step below the next point. With `max`, the upper index is returned
/// unless `value` lies within 1% of a step above the previous point. Works
/// for increasing and decreasing axes; the result is clipped to the axis.
pub fn index_of(axis: &[f64], value: f64, max: bool) -> usize {
    let n = axis.len() as i64;
    if n == 0 {
        return 0;
    }
    // Negative positions wrap around once, positions past the end are absent.
    let at = |i: i64| -> Option<f64> {
        let i = if i < 0 { i + n } else { i };
        if (0..n).contains(&i) {
            Some(axis[i as usize])
        } else {
            None
        }
    };
    let flipped = axis[axis.len() - 1] < axis[0];
    let mut idx;
    if max {
        let count = if flipped {
            axis.iter().filter(|&&x| x < value).count()
        } else {
            axis.iter().filter(|&&x| x > value).count()
        } as i64;
        idx = n - count - 1;
        if let (Some(here), Some(next)) = (at(idx), at(idx + 1)) {
            let diff = value - here;
            let step = next - here;
            if (diff / step).abs() > 0.01 {
                idx += 1;
            }
        }
    } else {
        idx = if flipped {
            axis.iter().filter(|&&x| x > value).count()
        } else {
            axis.iter().filter(|&&x| x < value).count()
        } as i64;
        if let (Some(prev), Some(here)) = (at(idx - 1), at(idx)) {
            let diff = value - prev;
            let step = here - prev;
            if (diff / step).abs() < 0.99 {
                idx -= 1;
            }
        }
    }
    idx.clamp(0, n - 1) as usize
}

fn isclose(a: f64, b: f64) -> bool {
    (a - b).abs() <= 1e-8 + 1e-5 * b.abs()
}

/// Convert axis-value bounds to positions along the one-dimensional `axis`.
///
/// Integer ranges of length zero or one collapse to their start, as does a
/// value range whose bounds coincide or land on a single point. Bounds given
/// in the opposite order to the axis are swapped.
pub fn convert_index(index: &Index, axis: &Array) -> Result<Index> {
    if index.is_real() && axis.ndim() > 1 {
        return Err(Error::InvalidOperation(
            "field must be one-dimensional for floating point slices".into(),
        ));
    }
    if axis.size() == 1 {
        return Ok(Index::At(Coord::Int(0)));
    }
    let converted = match index {
        Index::Range { start: Some(Coord::Int(a)), stop: Some(Coord::Int(b)), .. }
            if *b == *a || *b == *a + 1 =>
        {
            Index::At(Coord::Int(*a))
        }
        Index::Range { start, stop, step } if index.is_real() => {
            let values = axis.to_f64_vec()?;
            let reversed = values.len() > 1 && values[values.len() - 1] < values[0];
            let (mut start, mut stop) = (*start, *stop);
            if let (Some(a), Some(b)) = (start, stop) {
                if (reversed && a.value() < b.value()) || (!reversed && a.value() > b.value()) {
                    std::mem::swap(&mut start, &mut stop);
                }
            }
            let first = start.map(|c| index_of(&values, c.value(), false) as i64);
            let last = stop.map(|c| index_of(&values, c.value(), true) as i64 + 1);
            match (first, last, start, stop) {
                (Some(i), Some(j), Some(a), Some(b)) if j <= i + 1 || isclose(a.value(), b.value()) => {
                    Index::At(Coord::Int(i))
                }
                _ => Index::Range {
                    start: first.map(Coord::Int),
                    stop: last.map(Coord::Int),
                    step: *step,
                },
            }
        }
        Index::At(Coord::Real(v)) => {
            let values = axis.to_f64_vec()?;
            Index::At(Coord::Int(index_of(&values, *v, false) as i64))
        }
        other => other.clone(),
    };
    Ok(converted)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn axis() -> Vec<f64> {
        (0..=100).map(|i| 2.0 * i as f64).collect()
    }

    #[test]
    fn index_of_ascending_axis() {
        let x = axis();
        assert_eq!(index_of(&x, 10.0, false), 5);
        assert_eq!(index_of(&x, 11.0, false), 5);
        assert_eq!(index_of(&x, 11.0, true), 6);
        assert_eq!(index_of(&x, 12.0, true), 6);
        assert_eq!(index_of(&x, -5.0, false), 0);
        assert_eq!(index_of(&x, 500.0, true), 100);
    }

    #[test]
    fn index_of_descending_axis() {
        let x: Vec<f64> = axis().into_iter().rev().collect();
        assert_eq!(index_of(&x, 10.0, false), 95);
        assert_eq!(index_of(&x, 11.0, false), 94);
        assert_eq!(index_of(&x, 11.0, true), 95);
        assert_eq!(index_of(&x, 12.0, true), 94);
    }

    #[test]
    fn real_slices_convert_to_positions() {
        let x = Array::linspace(0.0, 10.0, 11);
        let idx = convert_index(&Index::from(2.0..5.0), &x).unwrap();
        assert_eq!(idx, Index::range(Some(Coord::Int(2)), Some(Coord::Int(6))));
        let narrow = convert_index(&Index::from(2.0..2.2), &x).unwrap();
        assert_eq!(narrow, Index::range(Some(Coord::Int(2)), Some(Coord::Int(4))));
        let point = convert_index(&Index::from(2.0..2.0), &x).unwrap();
        assert_eq!(point, Index::At(Coord::Int(2)));
    }

    #[test]
    fn reversed_bounds_are_swapped() {
        let x = Array::linspace(10.0, 0.0, 11);
        let idx = convert_index(&Index::from(2.0..5.0), &x).unwrap();
        assert_eq!(idx, Index::range(Some(Coord::Int(5)), Some(Coord::Int(9))));
    }

    #[test]
    fn short_integer_ranges_collapse() {
        let x = Array::arange(10);
        assert_eq!(convert_index(&Index::from(3..4), &x).unwrap(), Index::At(Coord::Int(3)));
        assert_eq!(convert_index(&Index::from(3..6), &x).unwrap(), Index::from(3..6));
        assert_eq!(convert_index(&Index::from(7.0), &Array::from(vec![1.0])).unwrap(), Index::At(Coord::Int(0)));
    }

    #[test]
    fn resolve_negative_and_clipped() {
        let slab = Selection::from((-1, 2..100)).resolve(&[4, 10]).unwrap();
        assert_eq!(slab.dims()[0], SlabDim { start: 3, count: 1, step: 1, keep: false });
        assert_eq!(slab.dims()[1], SlabDim { start: 2, count: 8, step: 1, keep: true });
        assert_eq!(slab.shape(), vec![8]);
    }

    #[test]
    fn resolve_steps() {
        let slab = Selection::from(Index::from(1..8).with_step(3)).resolve(&[10]).unwrap();
        assert_eq!(slab.dims()[0].count, 3);
        let back = Selection::from(Index::all().with_step(-1)).resolve(&[4]).unwrap();
        assert_eq!(back.dims()[0], SlabDim { start: 3, count: 4, step: -1, keep: true });
    }

    #[test]
    fn resolve_rejects_bad_indices() {
        assert!(Selection::from(5).resolve(&[5]).is_err());
        assert!(Selection::from((0, 0)).resolve(&[5]).is_err());
        assert!(Selection::from(1.5).resolve(&[5]).is_err());
    }

    #[test]
    fn macro_builds_selection() {
        let s = crate::sel![0, 3.0..12.0, ..];
        assert_eq!(s.len(), 3);
        assert!(s.is_real());
        assert!(crate::sel![].is_empty());
    }
}

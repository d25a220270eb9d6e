//! Integration tests: data groups read from files, entry arithmetic and
//! root-level file management.

use std::path::{Path, PathBuf};

use rustyhdf5_nexus::{load, sel, Error, Field, Group};

fn line() -> Group {
    let x: Vec<f64> = (0..=10).map(f64::from).collect();
    let y: Vec<f64> = (0..=10).map(|i| f64::from(i * i)).collect();
    let x = Field::builder().value(x).name("x").attr("units", "mm").build().unwrap();
    let y = Field::builder().value(y).name("y").build().unwrap();
    Group::data_with(Some(y), vec![x], None, None).unwrap()
}

fn saved_line(dir: &Path) -> PathBuf {
    let path = dir.join("line.nxs");
    let data = line();
    data.set_errors(Field::new(vec![1.0; 11])).unwrap();
    let entry = Group::entry();
    entry.set("data", data).unwrap();
    entry.set("title", "Parabola").unwrap();
    entry.save(&path, "w").unwrap();
    path
}

fn values(field: &Field) -> Vec<f64> {
    field.to_f64_vec().unwrap()
}

// ---------------------------------------------------------------------------
// Slicing
// ---------------------------------------------------------------------------

#[test]
fn slab_by_axis_value_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let root = load(saved_line(dir.path()), "r").unwrap();
    let data = root.group("entry/data").unwrap();
    let slab = data.get_slab(sel![2.0..5.0]).unwrap();
    assert_eq!(values(&slab.field("y").unwrap()), vec![4.0, 9.0, 16.0, 25.0]);
    assert_eq!(values(&slab.field("x").unwrap()), vec![2.0, 3.0, 4.0, 5.0]);
    assert_eq!(values(&slab.errors().unwrap().unwrap()).len(), 4);
    assert_eq!(slab.field("x").unwrap().attr_str("units").as_deref(), Some("mm"));
    assert_eq!(slab.title(), "Parabola");
}

#[test]
fn integer_slab_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let root = load(saved_line(dir.path()), "r").unwrap();
    let data = root.group("entry/data").unwrap();
    let slab = data.get_slab(sel![8..]).unwrap();
    assert_eq!(values(&slab.signal().unwrap().unwrap()), vec![64.0, 81.0, 100.0]);
}

#[test]
fn set_slab_writes_through() {
    let dir = tempfile::tempdir().unwrap();
    let path = saved_line(dir.path());
    {
        let root = load(&path, "rw").unwrap();
        root.group("entry/data").unwrap().set_slab(sel![0..2], vec![-1.0, -2.0]).unwrap();
    }
    let root = load(&path, "r").unwrap();
    let y = root.field("entry/data/y").unwrap();
    assert_eq!(&values(&y)[..3], &[-1.0, -2.0, 4.0]);
}

#[test]
fn summing_a_loaded_group() {
    let dir = tempfile::tempdir().unwrap();
    let root = load(saved_line(dir.path()), "r").unwrap();
    let data = root.group("entry/data").unwrap();
    let total: f64 = (0..=10).map(|i| f64::from(i * i)).sum();
    let summed = data.sum(None).unwrap();
    assert_eq!(summed.signal().unwrap().unwrap().item().unwrap().as_f64(), Some(total));
    let errors = summed.errors().unwrap().unwrap().item().unwrap().as_f64().unwrap();
    assert!((errors - 11f64.sqrt()).abs() < 1e-12);
    assert!((data.mean().unwrap() - 3025.0 / 385.0).abs() < 1e-9);
}

// ---------------------------------------------------------------------------
// Arithmetic
// ---------------------------------------------------------------------------

#[test]
fn adding_loaded_entries() {
    let dir = tempfile::tempdir().unwrap();
    let path = saved_line(dir.path());
    let first = load(&path, "r").unwrap();
    let second = load(&path, "r").unwrap();
    let a = first.group("entry").unwrap();
    let b = second.group("entry").unwrap();
    let total = (&a + &b).unwrap();
    assert_eq!(values(&total.field("data/y").unwrap())[3], 18.0);
    let errors = values(&total.field("data/y_errors").unwrap());
    assert!((errors[0] - 2f64.sqrt()).abs() < 1e-12);
    assert_eq!(total.field("title").unwrap().text().unwrap(), "Parabola");
    assert_eq!(values(&total.field("data/x").unwrap())[1], 1.0);
}

#[test]
fn result_of_arithmetic_can_be_saved() {
    let dir = tempfile::tempdir().unwrap();
    let root = load(saved_line(dir.path()), "r").unwrap();
    let data = root.group("entry/data").unwrap();
    let doubled = (&data * 2.0).unwrap();
    let out = dir.path().join("doubled.nxs");
    doubled.save(&out, "w").unwrap();
    let copy = load(&out, "r").unwrap();
    let y = copy.field("entry/data/y").unwrap();
    assert_eq!(values(&y)[10], 200.0);
}

#[test]
fn copying_into_another_tree_reads_source() {
    let dir = tempfile::tempdir().unwrap();
    let source = load(saved_line(dir.path()), "r").unwrap();
    let out = dir.path().join("copy.nxs");
    let target = Group::root();
    target.set("entry", Group::entry()).unwrap();
    target.save(&out, "w").unwrap();

    let target = load(&out, "rw").unwrap();
    target.set("entry/data", source.group("entry/data").unwrap()).unwrap();
    let copy = load(&out, "r").unwrap();
    assert_eq!(values(&copy.field("entry/data/y").unwrap())[5], 25.0);
    assert_eq!(copy.group("entry/data").unwrap().attr_str("signal").as_deref(), Some("y"));
}

// ---------------------------------------------------------------------------
// Root management
// ---------------------------------------------------------------------------

#[test]
fn locked_roots_refuse_changes_until_unlocked() {
    let dir = tempfile::tempdir().unwrap();
    let root = load(saved_line(dir.path()), "rw").unwrap();
    root.lock().unwrap();
    assert!(matches!(root.set("entry/note", "x"), Err(Error::ReadOnlyViolation(_))));
    root.unlock().unwrap();
    root.set("entry/note", "x").unwrap();
    assert!(root.contains("entry/note"));
}

#[test]
fn backup_and_restore() {
    let dir = tempfile::tempdir().unwrap();
    let path = saved_line(dir.path());
    let root = load(&path, "rw").unwrap();
    let backup = root.backup(None, Some(dir.path())).unwrap();
    assert!(backup.exists());
    let name = backup.file_name().unwrap().to_string_lossy().into_owned();
    assert!(name.starts_with("line_backup_"));
    assert!(name.ends_with(".nxs"));

    root.set("entry/note", "temporary").unwrap();
    assert!(root.contains("entry/note"));
    assert!(root.restore(None, false).is_err());
    root.restore(None, true).unwrap();
    assert!(!root.contains("entry/note"));
    assert!(load(&path, "r").unwrap().contains("entry/data/y"));
}

#[test]
fn backup_refuses_existing_name() {
    let dir = tempfile::tempdir().unwrap();
    let path = saved_line(dir.path());
    let root = load(&path, "r").unwrap();
    let named = root.backup(Some(Path::new("copy.nxs")), Some(dir.path())).unwrap();
    assert_eq!(named, dir.path().join("copy.nxs"));
    assert!(root.backup(Some(Path::new("copy.nxs")), Some(dir.path())).is_err());
}

#[test]
fn detached_roots_cannot_back_up() {
    let root = Group::root();
    assert!(root.backup(None, None).is_err());
    assert!(root.reload().is_err());
    assert!(!root.is_modified());
}

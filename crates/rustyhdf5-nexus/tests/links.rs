//! Integration tests: internal, external and broken links across files.

use std::path::{Path, PathBuf};

use rustyhdf5_nexus::{load, sel, Error, Group, Link, LinkState};

fn source_file(dir: &Path) -> PathBuf {
    let path = dir.join("source.nxs");
    let entry = Group::entry();
    entry.set("x", vec![1.0, 2.0, 3.0]).unwrap();
    let sample = Group::new("NXsample").unwrap();
    sample.set("temperature", 20.0).unwrap();
    entry.set("sample", sample).unwrap();
    entry.save(&path, "w").unwrap();
    path
}

// ---------------------------------------------------------------------------
// Internal links
// ---------------------------------------------------------------------------

#[test]
fn internal_link_survives_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("internal.nxs");
    let root = Group::root();
    root.set("entry", Group::entry()).unwrap();
    root.set("entry/x", vec![1.0, 2.0, 3.0]).unwrap();
    root.set("entry/data", Group::new("NXdata").unwrap()).unwrap();
    let target = root.get("entry/x").unwrap();
    root.group("entry/data").unwrap().make_link(&target, None, false).unwrap();
    root.save(&path, "w").unwrap();

    let root = load(&path, "r").unwrap();
    assert!(root.get("entry/x").unwrap().is_field());
    let link = root.link("entry/data/x").unwrap();
    assert_eq!(link.target(), "/entry/x");
    assert!(link.exists());
    assert_eq!(link.value().unwrap().to_f64_vec().unwrap(), vec![1.0, 2.0, 3.0]);
    assert_eq!(link.get(sel![1..]).unwrap().name(), "x");
}

#[test]
fn link_to_group_exposes_children() {
    let root = Group::root();
    root.set("entry", Group::entry()).unwrap();
    let sample = Group::new("NXsample").unwrap();
    sample.set("temperature", 20.0).unwrap();
    root.set("entry/sample", sample).unwrap();
    root.set("entry/alias", Link::new("/entry/sample")).unwrap();

    let alias = root.link("entry/alias").unwrap();
    assert!(matches!(alias.resolve(), LinkState::Group(_)));
    let temperature = root.field("entry/alias/temperature").unwrap();
    assert_eq!(temperature.item().unwrap().as_f64(), Some(20.0));
    assert!(temperature.is_linked());
    assert!(matches!(temperature.set(sel![..], 25.0), Err(Error::LinkedItemImmutable(_))));
}

#[test]
fn dangling_internal_link_is_broken() {
    let root = Group::root();
    root.set("entry", Group::entry()).unwrap();
    root.set("entry/nowhere", Link::new("/entry/missing")).unwrap();
    let link = root.link("entry/nowhere").unwrap();
    assert!(!link.exists());
    assert!(matches!(link.resolve(), LinkState::Broken));
    assert!(matches!(link.value(), Err(Error::BrokenLink(_))));
    assert!(link.attrs().is_empty());
}

// ---------------------------------------------------------------------------
// External links
// ---------------------------------------------------------------------------

#[test]
fn external_link_reads_other_file() {
    let dir = tempfile::tempdir().unwrap();
    let source = source_file(dir.path());
    let path = dir.path().join("outer.nxs");
    let entry = Group::entry();
    entry.set("ext", Link::external("/entry/x", &source)).unwrap();
    entry.save(&path, "w").unwrap();

    let root = load(&path, "r").unwrap();
    let link = root.link("entry/ext").unwrap();
    assert!(link.is_external());
    assert!(link.exists());
    assert_eq!(link.value().unwrap().to_f64_vec().unwrap(), vec![1.0, 2.0, 3.0]);
    assert!(matches!(link.set(sel![0], 9.0), Err(Error::ReadOnlyLink(_))));
}

#[test]
fn make_link_across_files_is_external() {
    let dir = tempfile::tempdir().unwrap();
    let source = load(source_file(dir.path()), "r").unwrap();
    let target = source.get("entry/sample").unwrap();

    let root = Group::root();
    root.set("entry", Group::entry()).unwrap();
    let entry = root.group("entry").unwrap();
    entry.make_link(&target, Some("borrowed"), true).unwrap();
    let link = entry.link("borrowed").unwrap();
    assert!(link.is_external());
    assert_eq!(link.target(), "/entry/sample");
    assert_eq!(entry.field("borrowed/temperature").unwrap().item().unwrap().as_f64(), Some(20.0));
}

#[test]
fn external_link_breaks_when_file_goes() {
    let dir = tempfile::tempdir().unwrap();
    let source = source_file(dir.path());
    let path = dir.path().join("outer.nxs");
    let entry = Group::entry();
    entry.set("ext", Link::external("/entry/x", &source)).unwrap();
    entry.save(&path, "w").unwrap();
    std::fs::remove_file(&source).unwrap();

    let root = load(&path, "r").unwrap();
    let link = root.link("entry/ext").unwrap();
    assert!(!link.exists());
    assert!(link.value().is_err());
    assert!(!root.get("entry/ext").unwrap().exists());
}

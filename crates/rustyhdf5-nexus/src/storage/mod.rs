//! Storage engine boundary.
//!
//! The tree never touches bytes directly: every group, dataset, attribute
//! and link operation goes through a [`StorageEngine`]. Paths are absolute,
//! `/`-separated and rooted at `/`.
//!
//! ```text
//! ┌───────────────────────────┐
//! │   Node / Field / Group    │
//! ├───────────────────────────┤
//! │        File (translator)  │
//! ├───────────────────────────┤
//! │      StorageEngine        │  ← trait defined here
//! ├─────────────┬─────────────┤
//! │ Hdf5Engine  │ NativeEngine│
//! │  (on disk)  │ (in memory) │
//! └─────────────┴─────────────┘
//! ```

pub mod filters;
pub mod hdf5;
pub mod native;

use std::fmt;
use std::io;

use crate::array::{Array, DType, Scalar};
use crate::attrs::AttrDict;
use crate::selection::Hyperslab;

pub use hdf5::Hdf5Engine;
pub use native::NativeEngine;

/// Error type for storage operations.
#[derive(Debug)]
pub enum StorageError {
    /// I/O error from the underlying file.
    Io(io::Error),
    /// No object at the path.
    NotFound(String),
    /// An object already exists at the path.
    Exists(String),
    /// Malformed file contents.
    Corrupt(String),
    /// Operation not valid for the object at the path.
    Invalid(String),
    /// The engine was opened read-only.
    ReadOnly,
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::Io(e) => write!(f, "I/O error: {e}"),
            StorageError::NotFound(path) => write!(f, "object not found: {path}"),
            StorageError::Exists(path) => write!(f, "object already exists: {path}"),
            StorageError::Corrupt(msg) => write!(f, "corrupt file: {msg}"),
            StorageError::Invalid(msg) => write!(f, "invalid operation: {msg}"),
            StorageError::ReadOnly => write!(f, "storage opened read-only"),
        }
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StorageError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for StorageError {
    fn from(e: io::Error) -> Self {
        StorageError::Io(e)
    }
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// What sits at a path before following a final link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry {
    Group,
    Dataset,
    /// Soft link to a path in the same container.
    Soft(String),
    /// Link to a path in another container file.
    External { file: String, path: String },
}

/// Kind of a resolved object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Group,
    Dataset,
}

/// Link to create with [`StorageEngine::link`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkSpec {
    /// Another name for an existing object.
    Hard(String),
    Soft(String),
    External { file: String, path: String },
}

/// Creation-time description of a dataset.
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetLayout {
    pub shape: Vec<usize>,
    pub dtype: DType,
    /// Per-dimension maximum; `None` is unbounded. Defaults to `shape`.
    pub maxshape: Option<Vec<Option<usize>>>,
    pub chunks: Option<Vec<usize>>,
    pub compression: Option<String>,
    pub compression_opts: Option<u32>,
    pub shuffle: bool,
    pub fletcher32: bool,
    pub fillvalue: Option<Scalar>,
    pub scaleoffset: Option<i32>,
}

impl DatasetLayout {
    pub fn new(dtype: DType, shape: &[usize]) -> Self {
        Self {
            shape: shape.to_vec(),
            dtype,
            maxshape: None,
            chunks: None,
            compression: None,
            compression_opts: None,
            shuffle: false,
            fletcher32: false,
            fillvalue: None,
            scaleoffset: None,
        }
    }

    /// Whether the dataset can take `shape` without exceeding its maximum.
    pub fn allows(&self, shape: &[usize]) -> bool {
        match &self.maxshape {
            None => shape == self.shape.as_slice(),
            Some(max) => {
                max.len() == shape.len()
                    && max.iter().zip(shape).all(|(m, &n)| m.map_or(true, |m| n <= m))
            }
        }
    }

    /// Value every unwritten element holds.
    pub fn fill(&self) -> Scalar {
        match &self.fillvalue {
            Some(v) => v.clone(),
            None if self.dtype.is_text() => Scalar::Text(String::new()),
            None => Scalar::Int(0),
        }
    }
}

/// Backend-agnostic container access.
pub trait StorageEngine {
    /// Connector name (e.g. "hdf5", "memory").
    fn name(&self) -> &str;

    /// Whether writes are accepted.
    fn writable(&self) -> bool;

    /// Object or link at `path`, without following a final link.
    fn entry(&self, path: &str) -> StorageResult<Entry>;

    /// Kind of the object at `path`, following soft links.
    fn kind(&self, path: &str) -> StorageResult<ObjectKind>;

    fn exists(&self, path: &str) -> bool {
        self.entry(path).is_ok()
    }

    /// Names of the members of the group at `path`, sorted.
    fn members(&self, path: &str) -> StorageResult<Vec<String>>;

    /// Create an empty group; the parent must exist.
    fn create_group(&mut self, path: &str) -> StorageResult<()>;

    /// Create a dataset filled with the layout's fill value.
    fn create_dataset(&mut self, path: &str, layout: &DatasetLayout) -> StorageResult<()>;

    fn layout(&self, path: &str) -> StorageResult<DatasetLayout>;

    fn read(&self, path: &str, slab: &Hyperslab) -> StorageResult<Array>;

    fn write(&mut self, path: &str, slab: &Hyperslab, value: &Array) -> StorageResult<()>;

    /// Change a dataset's shape, keeping overlapping elements.
    fn resize(&mut self, path: &str, shape: &[usize]) -> StorageResult<()>;

    fn attrs(&self, path: &str) -> StorageResult<AttrDict>;

    fn set_attr(&mut self, path: &str, name: &str, value: &Array) -> StorageResult<()>;

    fn delete_attr(&mut self, path: &str, name: &str) -> StorageResult<()>;

    /// Create a link at `path`.
    fn link(&mut self, path: &str, spec: &LinkSpec) -> StorageResult<()>;

    /// Remove the link at `path`; unreachable objects are dropped.
    fn delete(&mut self, path: &str) -> StorageResult<()>;

    fn rename(&mut self, from: &str, to: &str) -> StorageResult<()>;

    /// Persist pending changes.
    fn flush(&mut self) -> StorageResult<()> {
        Ok(())
    }

    /// Read a whole dataset.
    fn read_all(&self, path: &str) -> StorageResult<Array> {
        let layout = self.layout(path)?;
        self.read(path, &Hyperslab::full(&layout.shape))
    }
}

/// Join a parent path and a member name.
pub fn join(parent: &str, name: &str) -> String {
    if parent.is_empty() || parent == "/" {
        format!("/{name}")
    } else {
        format!("{}/{name}", parent.trim_end_matches('/'))
    }
}

/// Split a path into its parent and last component.
pub fn split(path: &str) -> (String, String) {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) => ("/".to_string(), trimmed[1..].to_string()),
        Some(i) => (trimmed[..i].to_string(), trimmed[i + 1..].to_string()),
        None => ("/".to_string(), trimmed.to_string()),
    }
}

/// Copy the object at `src_path` in `src` to `dst_path` in `dst`, with its
/// attributes and, for groups, every member. Links are copied as links.
pub fn copy_object(
    src: &dyn StorageEngine,
    src_path: &str,
    dst: &mut dyn StorageEngine,
    dst_path: &str,
) -> StorageResult<()> {
    match src.entry(src_path)? {
        Entry::Soft(target) => return dst.link(dst_path, &LinkSpec::Soft(target)),
        Entry::External { file, path } => {
            return dst.link(dst_path, &LinkSpec::External { file, path })
        }
        Entry::Group => {
            if !dst.exists(dst_path) {
                dst.create_group(dst_path)?;
            }
            for name in src.members(src_path)? {
                copy_object(src, &join(src_path, &name), dst, &join(dst_path, &name))?;
            }
        }
        Entry::Dataset => {
            let layout = src.layout(src_path)?;
            dst.create_dataset(dst_path, &layout)?;
            let value = src.read_all(src_path)?;
            dst.write(dst_path, &Hyperslab::full(&layout.shape), &value)?;
        }
    }
    for (name, value) in &src.attrs(src_path)? {
        dst.set_attr(dst_path, name, value)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_and_split() {
        assert_eq!(join("/", "entry"), "/entry");
        assert_eq!(join("/entry", "data"), "/entry/data");
        assert_eq!(split("/entry/data"), ("/entry".to_string(), "data".to_string()));
        assert_eq!(split("/entry"), ("/".to_string(), "entry".to_string()));
    }

    #[test]
    fn layout_limits() {
        let mut layout = DatasetLayout::new(DType::F64, &[10]);
        assert!(layout.allows(&[10]));
        assert!(!layout.allows(&[11]));
        layout.maxshape = Some(vec![None]);
        assert!(layout.allows(&[1000]));
        layout.maxshape = Some(vec![Some(20)]);
        assert!(!layout.allows(&[21]));
    }

    #[test]
    fn storage_error_display() {
        let err = StorageError::NotFound("/entry".into());
        assert!(err.to_string().contains("not found"));
        let err: StorageError = io::Error::new(io::ErrorKind::Other, "disk").into();
        assert!(err.to_string().contains("disk"));
    }

    #[test]
    fn copy_between_engines() {
        let mut src = NativeEngine::in_memory();
        src.create_group("/entry").unwrap();
        src.create_dataset("/entry/x", &DatasetLayout::new(DType::I32, &[3])).unwrap();
        src.write("/entry/x", &Hyperslab::full(&[3]), &Array::from(vec![1i32, 2, 3]))
            .unwrap();
        src.set_attr("/entry", "NX_class", &Array::from("NXentry")).unwrap();
        src.link("/entry/y", &LinkSpec::Soft("/entry/x".into())).unwrap();

        let mut dst = NativeEngine::in_memory();
        copy_object(&src, "/entry", &mut dst, "/copy").unwrap();
        assert_eq!(dst.kind("/copy/x").unwrap(), ObjectKind::Dataset);
        assert_eq!(dst.read_all("/copy/x").unwrap(), Array::from(vec![1i32, 2, 3]));
        assert_eq!(dst.entry("/copy/y").unwrap(), Entry::Soft("/entry/x".into()));
        assert_eq!(dst.attrs("/copy").unwrap().get_str("NX_class").as_deref(), Some("NXentry"));
    }
}

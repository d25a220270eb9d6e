//! NeXus trees over a hierarchical container format.
//!
//! A tree of [`Group`]s, [`Field`]s and [`Link`]s mirrors a NeXus file.
//! Trees can be built in memory and saved, or loaded from a file and read
//! lazily: field values and nested groups are only read when first used.
//! In read-write mode every change is written through to the file.
//!
//! # Reading
//!
//! ```no_run
//! use rustyhdf5_nexus::{load, sel};
//!
//! let root = load("scan.nxs", "r").unwrap();
//! let data = root.group("entry/data").unwrap();
//! let slab = data.get_slab(sel![2.0..5.0]).unwrap();
//! println!("{}", slab.tree());
//! ```
//!
//! # Writing
//!
//! ```no_run
//! use rustyhdf5_nexus::{Array, Group};
//!
//! let data = Group::data(vec![1.0, 4.0, 9.0], vec![Array::from(vec![1.0, 2.0, 3.0])]).unwrap();
//! let root = data.save("scan.nxs", "w").unwrap();
//! root.set("entry/title", "Test scan").unwrap();
//! ```

pub mod array;
pub mod attrs;
pub mod classes;
pub mod config;
mod data;
pub mod error;
pub mod field;
pub mod file;
pub mod group;
pub mod link;
pub mod lock;
pub mod node;
pub mod selection;
pub mod storage;
pub mod text;

use std::path::Path;

pub use array::{Array, DType, Scalar};
pub use attrs::AttrDict;
pub use config::Config;
pub use error::{Error, Result};
pub use field::{Field, FieldBuilder, FieldOptions};
pub use file::{File, FileScope, Mode};
pub use group::{Group, Item};
pub use link::{Link, LinkState};
pub use lock::Lock;
pub use node::{Node, NodeKind};
pub use selection::{Coord, Index, Selection};

/// Open `path` and read its tree. Modes are those of [`File::open`].
pub fn load(path: impl AsRef<Path>, mode: &str) -> Result<Group> {
    load_with(path, mode, &Config::default())
}

pub fn load_with(path: impl AsRef<Path>, mode: &str, config: &Config) -> Result<Group> {
    File::open_with(path, mode, config)?.read_tree()
}

/// Write `node` to a new file, wrapped in a root and entry as needed.
/// The mode is `w` to overwrite or `w-` to refuse an existing file.
pub fn save(node: &Node, path: impl AsRef<Path>, mode: &str) -> Result<Group> {
    node.save(path, mode)
}

pub fn save_with(node: &Node, path: impl AsRef<Path>, mode: &str, config: &Config) -> Result<Group> {
    node.save_with(path, mode, config)
}

//! File translator: the bridge between a container file and the node tree.
//!
//! A [`File`] is opened lazily. The container is only read into a storage
//! engine inside a scope, and scopes nest. The outermost scope acquires the
//! advisory lock and opens the engine; its exit flushes, closes and releases
//! the lock. Tree code reaches the engine through [`File::with`], which lends
//! it to a closure together with an [`Access`] context used to attach the
//! file name and mode to storage errors.
//!
//! Reading and writing recurse with the path passed explicitly, so there is
//! no cursor shared between calls. Same-file links are written in a second
//! pass once every group and dataset of the call exists.

use std::cell::RefCell;
use std::fmt;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::rc::{Rc, Weak};
use std::time::{Duration, SystemTime};

use tracing::{debug, warn};

use crate::array::Array;
use crate::attrs::AttrDict;
use crate::config::{Config, DEFAULT_LOCK_TIMEOUT};
use crate::error::{Error, Result};
use crate::field::{FieldData, FieldOptions, FieldState};
use crate::group::{Group, GroupData};
use crate::link::LinkData;
use crate::lock::{self, Lock};
use crate::node::{Kind, Node, NodeInner, NodeKind};
use crate::selection::Hyperslab;
use crate::storage::hdf5::LIBRARY_VERSION;
use crate::storage::{
    copy_object, join, split, DatasetLayout, Entry, Hdf5Engine, LinkSpec, NativeEngine, ObjectKind,
    StorageEngine, StorageResult,
};

/// Datasets with fewer elements are read when their group is loaded.
pub const EAGER_READ_LIMIT: usize = 1000;

/// Modes accepted by [`File::open_with`].
pub const MODES: [&str; 8] = ["r", "rw", "r+", "w", "w-", "w5", "x", "a"];

/// Access mode of an open file after normalisation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Read,
    ReadWrite,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Read => "r",
            Mode::ReadWrite => "rw",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct FileInner {
    filename: PathBuf,
    mode: Mode,
    config: Config,
    lock: Lock,
    engine: Option<Box<dyn StorageEngine>>,
    depth: usize,
    /// Modification time when this process last opened or closed the file.
    seen_mtime: Option<SystemTime>,
    root: Weak<RefCell<NodeInner>>,
    backup: Option<PathBuf>,
}

/// Handle on a container file. Clones share the same state.
#[derive(Clone)]
pub struct File {
    inner: Rc<RefCell<FileInner>>,
}

/// Error context for storage calls made inside [`File::with`].
pub(crate) struct Access {
    pub(crate) file: File,
    filename: String,
    mode: Mode,
}

impl Access {
    /// Map a storage failure at `path` to [`Error::StorageAccess`].
    pub(crate) fn check<T>(&self, path: &str, result: StorageResult<T>) -> Result<T> {
        result.map_err(|e| Error::storage(format!("{}:{path}", self.filename), self.mode.as_str(), e))
    }
}

/// Keeps a file open until dropped or closed.
pub struct FileScope {
    file: File,
    open: bool,
}

impl FileScope {
    pub fn file(&self) -> &File {
        &self.file
    }

    /// Leave the scope, reporting any flush failure.
    pub fn close(mut self) -> Result<()> {
        self.open = false;
        self.file.exit()
    }
}

impl Drop for FileScope {
    fn drop(&mut self) {
        if self.open {
            if let Err(e) = self.file.exit() {
                warn!(file = %self.file.filename().display(), error = %e, "failed to close file scope");
            }
        }
    }
}

struct PendingLink {
    path: String,
    target: String,
    soft: bool,
}

impl File {
    /// Open with default configuration.
    pub fn open(path: impl AsRef<Path>, mode: &str) -> Result<File> {
        Self::open_with(path, mode, &Config::default())
    }

    /// Open or create a container file.
    ///
    /// `r` opens read-only and `rw`/`r+` read-write; both need an existing
    /// file. `w` creates or truncates, `w-`/`x` create and fail if the file
    /// exists, and `a` opens read-write, creating the file when missing.
    pub fn open_with(path: impl AsRef<Path>, mode: &str, config: &Config) -> Result<File> {
        let requested = if mode == "w5" { "w" } else { mode };
        if !MODES.contains(&requested) {
            return Err(Error::Configuration(format!("invalid file mode '{mode}'")));
        }
        let filename = lock::absolute(path.as_ref());
        let denied = |message: &str| Error::StorageAccess {
            path: filename.display().to_string(),
            mode: requested.to_string(),
            message: message.to_string(),
        };
        let directory = filename.parent().map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from("."));
        if fs::read_dir(&directory).is_err() {
            return Err(denied("directory is missing or not readable"));
        }
        if config.lock > 0 {
            if let Some(dir) = &config.lock_directory {
                let writable = fs::metadata(dir).map(|m| !m.permissions().readonly()).unwrap_or(false);
                if !writable {
                    return Err(Error::Configuration(format!(
                        "not permitted to write to lock directory '{}'",
                        dir.display()
                    )));
                }
            }
        }
        let exists = filename.exists();
        let create = match requested {
            "w" => true,
            "w-" | "x" if exists => return Err(denied("file already exists")),
            "w-" | "x" => true,
            "a" => !exists,
            _ if !exists => return Err(denied("file does not exist")),
            _ => false,
        };
        let mode = if requested == "r" { Mode::Read } else { Mode::ReadWrite };
        let lock = Lock::new(&filename, config)?;
        let file = File {
            inner: Rc::new(RefCell::new(FileInner {
                filename,
                mode,
                config: config.clone(),
                lock,
                engine: None,
                depth: 0,
                seen_mtime: None,
                backup: None,
                root: Weak::new(),
            })),
        };
        if create {
            file.create_container()?;
        } else {
            file.with(|_, _| Ok(()))?;
        }
        file.mark_seen();
        debug!(file = %file.filename().display(), mode = %mode, created = create, "opened file");
        Ok(file)
    }

    fn create_container(&self) -> Result<()> {
        let filename = self.filename();
        let mut inner = self.inner.borrow_mut();
        inner.lock.acquire()?;
        let created = (|| -> StorageResult<()> {
            let mut engine = Hdf5Engine::create(&filename)?;
            for (name, value) in provenance(&filename) {
                engine.set_attr("/", name, &value)?;
            }
            engine.flush()
        })();
        inner.lock.release();
        created.map_err(|e| Error::storage(filename.display().to_string(), "w", e))
    }

    pub fn filename(&self) -> PathBuf {
        self.inner.borrow().filename.clone()
    }

    pub fn mode(&self) -> Mode {
        self.inner.borrow().mode
    }

    /// Change the access mode used by the next scope.
    pub fn set_mode(&self, mode: Mode) {
        self.inner.borrow_mut().mode = mode;
    }

    pub fn config(&self) -> Config {
        self.inner.borrow().config.clone()
    }

    /// True if both handles share state.
    pub fn same(&self, other: &File) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn is_open(&self) -> bool {
        self.inner.borrow().depth > 0
    }

    /// Open the file until the returned guard is dropped. Nested scopes
    /// share one engine.
    pub fn scope(&self) -> Result<FileScope> {
        self.enter()?;
        Ok(FileScope { file: self.clone(), open: true })
    }

    fn enter(&self) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        if inner.depth == 0 {
            inner.lock.acquire()?;
            let writable = inner.mode == Mode::ReadWrite;
            match Hdf5Engine::open(&inner.filename, writable) {
                Ok(engine) => inner.engine = Some(Box::new(engine)),
                Err(e) => {
                    inner.lock.release();
                    return Err(Error::storage(inner.filename.display().to_string(), inner.mode.as_str(), e));
                }
            }
            inner.seen_mtime = modified(&inner.filename);
            debug!(file = %inner.filename.display(), mode = %inner.mode, "file opened");
        }
        inner.depth += 1;
        Ok(())
    }

    fn exit(&self) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        if inner.depth == 0 {
            return Ok(());
        }
        inner.depth -= 1;
        if inner.depth > 0 {
            return Ok(());
        }
        let flushed = match inner.engine.take() {
            Some(mut engine) => engine.flush(),
            None => Ok(()),
        };
        inner.lock.release();
        inner.seen_mtime = modified(&inner.filename);
        debug!(file = %inner.filename.display(), "file closed");
        flushed.map_err(|e| Error::storage(inner.filename.display().to_string(), inner.mode.as_str(), e))
    }

    /// Leave every open scope.
    pub fn close(&self) -> Result<()> {
        while self.is_open() {
            self.exit()?;
        }
        Ok(())
    }

    /// Run `f` against the open engine. The engine is lent out for the
    /// duration of the call, so a nested call on the same file fails.
    pub(crate) fn with<T>(&self, f: impl FnOnce(&mut dyn StorageEngine, &Access) -> Result<T>) -> Result<T> {
        self.enter()?;
        let (engine, access) = {
            let mut inner = self.inner.borrow_mut();
            let access = Access {
                file: self.clone(),
                filename: inner.filename.display().to_string(),
                mode: inner.mode,
            };
            (inner.engine.take(), access)
        };
        let Some(mut engine) = engine else {
            let _ = self.exit();
            return Err(Error::InvalidOperation(format!("'{}' is already in use", access.filename)));
        };
        let result = f(engine.as_mut(), &access);
        self.inner.borrow_mut().engine = Some(engine);
        let closed = self.exit();
        let value = result?;
        closed?;
        Ok(value)
    }

    pub(crate) fn bind_root(&self, root: &Node) {
        self.inner.borrow_mut().root = Rc::downgrade(&root.0);
    }

    /// Root node bound to this file, while it is alive.
    pub fn root(&self) -> Option<Group> {
        self.inner.borrow().root.upgrade().map(|r| Group(Node(r)))
    }

    // Locking

    /// Set the lock timeout; `None` or zero disables locking.
    pub fn set_lock(&self, timeout: Option<Duration>) {
        self.inner.borrow_mut().lock.set_timeout(timeout.unwrap_or(Duration::ZERO));
    }

    /// Switch locking on with the configured timeout, or the default.
    pub fn enable_lock(&self) {
        let mut inner = self.inner.borrow_mut();
        let seconds = if inner.config.lock > 0 { inner.config.lock } else { DEFAULT_LOCK_TIMEOUT };
        inner.lock.set_timeout(Duration::from_secs(seconds));
    }

    pub fn lock_timeout(&self) -> Duration {
        self.inner.borrow().lock.timeout()
    }

    pub fn lock_file(&self) -> PathBuf {
        self.inner.borrow().lock.lock_file().to_path_buf()
    }

    /// Acquire the lock unless this process already holds it.
    pub fn acquire_lock(&self, timeout: Option<Duration>) -> Result<()> {
        if self.locked() {
            return Ok(());
        }
        match timeout {
            Some(timeout) => self.set_lock(Some(timeout)),
            None if self.lock_timeout().is_zero() && self.is_locked() => self.enable_lock(),
            None => {}
        }
        self.inner.borrow_mut().lock.acquire()
    }

    pub fn release_lock(&self) {
        self.inner.borrow_mut().lock.release();
    }

    /// True if this process holds the lock.
    pub fn locked(&self) -> bool {
        self.inner.borrow_mut().lock.locked()
    }

    /// True if any process holds the lock.
    pub fn is_locked(&self) -> bool {
        self.inner.borrow().lock.is_held_externally()
    }

    /// Wait for another process to release the lock.
    pub fn wait_lock(&self, timeout: Option<Duration>) -> Result<()> {
        let inner = self.inner.borrow();
        let timeout = timeout.unwrap_or_else(|| Duration::from_secs(inner.config.lock.max(DEFAULT_LOCK_TIMEOUT)));
        inner.lock.wait(Some(timeout))
    }

    /// Remove the lock file whoever created it.
    pub fn clear_lock(&self) {
        if self.is_locked() {
            self.inner.borrow_mut().lock.clear();
        }
    }

    /// Copy of the file taken by the last backup.
    pub fn backup(&self) -> Option<PathBuf> {
        self.inner.borrow().backup.clone()
    }

    pub(crate) fn set_backup(&self, path: PathBuf) {
        self.inner.borrow_mut().backup = Some(path);
    }

    /// Current modification time of the file.
    pub fn mtime(&self) -> Option<SystemTime> {
        modified(&self.filename())
    }

    pub(crate) fn mark_seen(&self) {
        let mut inner = self.inner.borrow_mut();
        inner.seen_mtime = modified(&inner.filename);
    }

    /// Modification time recorded when this process last opened or closed
    /// the file.
    pub fn seen_mtime(&self) -> Option<SystemTime> {
        self.inner.borrow().seen_mtime
    }

    /// True if another writer touched the file since it was last seen.
    pub fn is_modified(&self) -> bool {
        match (self.mtime(), self.seen_mtime()) {
            (Some(now), Some(seen)) => now > seen,
            _ => false,
        }
    }

    // Reading

    /// Read the hierarchy. The root's children are always read; deeper
    /// groups are read on first access unless the configuration asks for a
    /// recursive load.
    pub fn read_tree(&self) -> Result<Group> {
        let recursive = self.config().recursive;
        let root = self.with(|engine, cx| cx.check("/", read_group(engine, "/", "root", true, recursive)))?;
        {
            let mut inner = root.inner_mut();
            inner.file = Some(self.clone());
            inner.origin = None;
        }
        self.bind_root(&root);
        self.mark_seen();
        debug!(file = %self.filename().display(), recursive, "read tree");
        Ok(Group(root))
    }

    /// Read the item at `path` as a detached node bound to this file.
    pub fn read_path(&self, path: &str) -> Result<Node> {
        let recursive = self.config().recursive;
        let (_, name) = split(path);
        let node = self.with(|engine, cx| cx.check(path, read_object(engine, path, &name, true, recursive)))?;
        {
            let mut inner = node.inner_mut();
            inner.file = Some(self.clone());
            inner.origin = Some(path.to_string());
        }
        Ok(node)
    }

    /// Children of the group at `path`.
    pub(crate) fn read_entries(&self, path: &str) -> Result<Vec<(String, Node)>> {
        let recursive = self.config().recursive;
        self.with(|engine, cx| cx.check(path, read_children(engine, path, recursive)))
    }

    pub fn read_value(&self, path: &str, slab: &Hyperslab) -> Result<Array> {
        self.with(|engine, cx| cx.check(path, engine.read(path, slab)))
    }

    pub fn write_value(&self, path: &str, slab: &Hyperslab, value: &Array) -> Result<()> {
        self.check_writable(path)?;
        self.with(|engine, cx| cx.check(path, engine.write(path, slab, value)))
    }

    pub(crate) fn layout(&self, path: &str) -> Result<DatasetLayout> {
        self.with(|engine, cx| cx.check(path, engine.layout(path)))
    }

    pub(crate) fn resize(&self, path: &str, shape: &[usize]) -> Result<()> {
        self.check_writable(path)?;
        self.with(|engine, cx| cx.check(path, engine.resize(path, shape)))
    }

    pub(crate) fn delete(&self, path: &str) -> Result<()> {
        self.check_writable(path)?;
        self.with(|engine, cx| {
            if engine.exists(path) {
                cx.check(path, engine.delete(path))
            } else {
                Ok(())
            }
        })
    }

    fn check_writable(&self, path: &str) -> Result<()> {
        if self.mode() == Mode::Read {
            return Err(Error::ReadOnlyViolation(format!(
                "NeXus file opened as readonly ({}:{path})",
                self.filename().display()
            )));
        }
        Ok(())
    }

    // Writing

    /// Write every child and attribute of `root` into the file.
    pub fn write_tree(&self, root: &Group) -> Result<()> {
        self.check_writable("/")?;
        self.with(|engine, cx| {
            let mut links = Vec::new();
            for (name, child) in children_for_write(root, cx)? {
                write_node(engine, cx, &child, &join("/", &name), &mut links)?;
            }
            write_links(engine, cx, &links)?;
            for (name, value) in &root.inner().attrs {
                cx.check("/", engine.set_attr("/", name, value))?;
            }
            Ok(())
        })?;
        debug!(file = %self.filename().display(), "wrote tree");
        Ok(())
    }

    /// Write one changed node: a field, a group subtree or a link.
    pub fn update(&self, node: &Node) -> Result<()> {
        self.check_writable(&node.path())?;
        let path = node.path();
        self.with(|engine, cx| {
            let mut links = Vec::new();
            write_node(engine, cx, node, &path, &mut links)?;
            write_links(engine, cx, &links)
        })
    }

    /// Move an object within the file.
    pub fn move_object(&self, source: &str, destination: &str) -> Result<()> {
        self.check_writable(destination)?;
        self.with(|engine, cx| cx.check(destination, engine.rename(source, destination)))
    }

    pub fn rename(&self, old_path: &str, new_path: &str) -> Result<()> {
        if old_path == new_path {
            return Ok(());
        }
        self.move_object(old_path, new_path)
    }

    /// Copy an object within the file.
    pub fn copy(&self, source: &str, destination: &str) -> Result<()> {
        self.check_writable(destination)?;
        self.with(|engine, cx| cx.check(destination, copy_within(engine, source, destination)))
    }

    /// Copy every top-level object of `input` into this file and stamp
    /// fresh provenance attributes on the root.
    pub fn copy_file(&self, input: &File) -> Result<()> {
        self.check_writable("/")?;
        let filename = self.filename();
        self.with(|engine, cx| {
            input.with(|source, scx| {
                for name in scx.check("/", source.members("/"))? {
                    let path = join("/", &name);
                    cx.check(&path, copy_object(source, &path, engine, &path))?;
                }
                Ok(())
            })?;
            for (name, value) in provenance(&filename) {
                cx.check("/", engine.set_attr("/", name, &value))?;
            }
            Ok(())
        })
    }

    /// Re-read the bound root's children and attributes from the file.
    pub fn reload(&self) -> Result<()> {
        let Some(root) = self.root() else {
            return Err(Error::InvalidOperation(format!(
                "'{}' has no tree to reload",
                self.filename().display()
            )));
        };
        let recursive = self.config().recursive;
        let (children, mut attrs) = self.with(|engine, cx| {
            let children = cx.check("/", read_children(engine, "/", recursive))?;
            let attrs = cx.check("/", engine.attrs("/"))?;
            Ok((children, attrs))
        })?;
        attrs.remove("NX_class");
        {
            let mut inner = root.inner_mut();
            inner.attrs = attrs;
            if let Kind::Group(data) = &mut inner.kind {
                for child in data.entries.values() {
                    child.set_parent(None);
                }
                data.entries.clear();
                data.loaded = true;
            }
        }
        for (name, child) in children {
            crate::group::attach(&root, &name, &child);
        }
        root.set_changed();
        self.mark_seen();
        debug!(file = %self.filename().display(), "reloaded tree");
        Ok(())
    }
}

impl fmt::Debug for File {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("File")
            .field("filename", &inner.filename)
            .field("mode", &inner.mode)
            .field("depth", &inner.depth)
            .finish()
    }
}

fn modified(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Root attributes describing who wrote a new file and when.
fn provenance(filename: &Path) -> Vec<(&'static str, Array)> {
    let now = chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.6f").to_string();
    vec![
        ("file_name", Array::from(filename.display().to_string())),
        ("file_time", Array::from(now)),
        ("HDF5_Version", Array::from(LIBRARY_VERSION)),
        ("h5py_version", Array::from(env!("CARGO_PKG_VERSION"))),
        ("creator", Array::from("rustyhdf5-nexus")),
        ("creator_version", Array::from(env!("CARGO_PKG_VERSION"))),
    ]
}

// Reading

/// Link stored at `path`, if the object there is a soft, external or hard
/// link. A hard link is recognised by a `target` attribute naming another
/// path.
fn read_link(engine: &dyn StorageEngine, path: &str) -> StorageResult<Option<LinkData>> {
    if path == "/" {
        return Ok(None);
    }
    match engine.entry(path)? {
        Entry::External { file, path: target } => {
            let abspath = Path::new(&file).is_absolute();
            Ok(Some(LinkData::new(target, Some(PathBuf::from(file)), abspath, false)))
        }
        Entry::Soft(target) => Ok(Some(LinkData::new(target, None, false, true))),
        Entry::Group | Entry::Dataset => {
            let Some(target) = engine.attrs(path)?.get_str("target") else {
                return Ok(None);
            };
            let target = if target.starts_with('/') { target } else { format!("/{target}") };
            if target == path {
                Ok(None)
            } else {
                Ok(Some(LinkData::new(target, None, false, false)))
            }
        }
    }
}

fn read_object(
    engine: &dyn StorageEngine,
    path: &str,
    name: &str,
    load: bool,
    recursive: bool,
) -> StorageResult<Node> {
    if let Some(link) = read_link(engine, path)? {
        return Ok(Node::from_parts(name, "NXlink", AttrDict::new(), Kind::Link(link)));
    }
    match engine.kind(path)? {
        ObjectKind::Group => read_group(engine, path, name, load, recursive),
        ObjectKind::Dataset => read_field(engine, path, name),
    }
}

fn read_group(
    engine: &dyn StorageEngine,
    path: &str,
    name: &str,
    load: bool,
    recursive: bool,
) -> StorageResult<Node> {
    let mut attrs = engine.attrs(path)?;
    let class = attrs
        .remove("NX_class")
        .and_then(|v| v.item().and_then(|s| s.as_str().map(str::to_string)))
        .unwrap_or_else(|| "NXgroup".to_string());
    let class = if class == "NXgroup" && path == "/" { "NXroot".to_string() } else { class };
    let node = Node::from_parts(name, class, attrs, Kind::Group(GroupData::unloaded()));
    if load {
        for (child_name, child) in read_children(engine, path, recursive)? {
            crate::group::attach(&node, &child_name, &child);
        }
        if let Kind::Group(data) = &mut node.inner_mut().kind {
            data.loaded = true;
        }
    }
    Ok(node)
}

fn read_children(engine: &dyn StorageEngine, path: &str, recursive: bool) -> StorageResult<Vec<(String, Node)>> {
    let mut children = Vec::new();
    for name in engine.members(path)? {
        let child_path = join(path, &name);
        let child = read_object(engine, &child_path, &name, recursive, recursive)?;
        children.push((name, child));
    }
    Ok(children)
}

fn read_field(engine: &dyn StorageEngine, path: &str, name: &str) -> StorageResult<Node> {
    let layout = engine.layout(path)?;
    let mut attrs = engine.attrs(path)?;
    if attrs.get_str("NX_class").as_deref() == Some("SDS") {
        attrs.remove("NX_class");
    }
    let size: usize = layout.shape.iter().product();
    let state = if size < EAGER_READ_LIMIT {
        match engine.read_all(path) {
            Ok(value) => FieldState::Value { value, mask: None },
            Err(e) => {
                debug!(path, error = %e, "deferring unreadable dataset");
                FieldState::Deferred
            }
        }
    } else {
        FieldState::Deferred
    };
    let data = FieldData {
        dtype: Some(layout.dtype),
        shape: layout.shape.clone(),
        options: FieldOptions::from_layout(&layout),
        state,
    };
    Ok(Node::from_parts(name, "NXfield", attrs, Kind::Field(data)))
}

// Writing

/// Children to write. Unloaded groups stored in the destination file are
/// already there; groups from elsewhere are read first.
fn children_for_write(group: &Node, cx: &Access) -> Result<Vec<(String, Node)>> {
    let loaded = match &group.inner().kind {
        Kind::Group(data) if data.loaded => Some(data.entries.iter().map(|(k, v)| (k.clone(), v.clone())).collect()),
        Kind::Group(_) => None,
        _ => Some(Vec::new()),
    };
    if let Some(children) = loaded {
        return Ok(children);
    }
    match group.locate() {
        Some((file, _)) if file.same(&cx.file) => Ok(Vec::new()),
        _ => group.children(),
    }
}

fn write_node(
    engine: &mut dyn StorageEngine,
    cx: &Access,
    node: &Node,
    path: &str,
    links: &mut Vec<PendingLink>,
) -> Result<()> {
    match node.kind() {
        NodeKind::Link => {
            let (target, external, soft) = match &node.inner().kind {
                Kind::Link(data) => (data.target.clone(), data.filename.is_some(), data.soft),
                _ => return Ok(()),
            };
            if external {
                write_external(engine, cx, node, path, &target)
            } else {
                links.push(PendingLink { path: path.to_string(), target, soft });
                Ok(())
            }
        }
        NodeKind::Field => write_field(engine, cx, node, path),
        NodeKind::Group => write_group(engine, cx, node, path, links),
    }
}

fn write_group(
    engine: &mut dyn StorageEngine,
    cx: &Access,
    group: &Node,
    path: &str,
    links: &mut Vec<PendingLink>,
) -> Result<()> {
    if path != "/" {
        if !engine.exists(path) {
            cx.check(path, engine.create_group(path))?;
        }
        let class = group.class();
        if class != "NXgroup" {
            cx.check(path, engine.set_attr(path, "NX_class", &Array::from(class)))?;
        }
    }
    let attrs = group.inner().attrs.clone();
    for (name, value) in &attrs {
        cx.check(path, engine.set_attr(path, name, value))?;
    }
    for (name, child) in children_for_write(group, cx)? {
        write_node(engine, cx, &child, &join(path, &name), links)?;
    }
    Ok(())
}

fn write_field(engine: &mut dyn StorageEngine, cx: &Access, field: &Node, path: &str) -> Result<()> {
    let location = field.locate();
    let state = match &mut field.inner_mut().kind {
        Kind::Field(data) => std::mem::replace(&mut data.state, FieldState::Deferred),
        _ => return Ok(()),
    };
    let restored = match state {
        FieldState::PendingCopy { file, path: source } => {
            let copied = copy_from(engine, cx, &file, &source, path);
            if copied.is_err() {
                set_state(field, FieldState::PendingCopy { file, path: source });
            }
            copied?;
            None
        }
        FieldState::Scratch(scratch) => {
            if engine.exists(path) {
                cx.check(path, engine.delete(path))?;
            }
            let copied = cx.check(path, copy_object(&scratch, "/data", engine, path));
            if copied.is_err() {
                set_state(field, FieldState::Scratch(scratch));
            }
            copied?;
            None
        }
        FieldState::Deferred => {
            if let Some((file, source)) = location {
                if !file.same(&cx.file) || source != path {
                    copy_from(engine, cx, &file, &source, path)?;
                }
            }
            None
        }
        other @ (FieldState::Value { .. } | FieldState::Fill) => Some(other),
    };
    if let Some(state) = restored {
        let written = write_stored(engine, cx, field, path, &state);
        set_state(field, state);
        written?;
    }
    let attrs = field.inner().attrs.clone();
    for (name, value) in &attrs {
        cx.check(path, engine.set_attr(path, name, value))?;
    }
    Ok(())
}

/// Create the dataset for an in-memory or fill-only field and write its
/// value. An existing dataset of another shape or type is replaced.
fn write_stored(
    engine: &mut dyn StorageEngine,
    cx: &Access,
    field: &Node,
    path: &str,
    state: &FieldState,
) -> Result<()> {
    let layout = match &field.inner().kind {
        Kind::Field(data) => match data.dtype {
            Some(dtype) => data.options.layout(dtype, &data.shape),
            None => return Ok(()),
        },
        _ => return Ok(()),
    };
    if engine.exists(path) {
        let current = cx.check(path, engine.layout(path))?;
        if current.shape != layout.shape || current.dtype != layout.dtype {
            cx.check(path, engine.delete(path))?;
        }
    }
    if !engine.exists(path) {
        cx.check(path, engine.create_dataset(path, &layout))?;
    }
    if let FieldState::Value { value, .. } = state {
        cx.check(path, engine.write(path, &Hyperslab::full(&layout.shape), value))?;
    }
    Ok(())
}

fn set_state(field: &Node, state: FieldState) {
    if let Kind::Field(data) = &mut field.inner_mut().kind {
        data.state = state;
    }
}

/// Copy `source` in `file` to `path` in the engine, replacing what is there.
fn copy_from(
    engine: &mut dyn StorageEngine,
    cx: &Access,
    file: &File,
    source: &str,
    path: &str,
) -> Result<()> {
    if engine.exists(path) {
        cx.check(path, engine.delete(path))?;
    }
    if file.same(&cx.file) {
        cx.check(path, copy_within(engine, source, path))
    } else {
        file.with(|src, scx| scx.check(source, copy_object(src, source, engine, path)))
    }
}

/// Copy inside one engine through an in-memory staging engine.
fn copy_within(engine: &mut dyn StorageEngine, source: &str, destination: &str) -> StorageResult<()> {
    let mut staging = NativeEngine::in_memory();
    copy_object(engine, source, &mut staging, "/copy")?;
    copy_object(&staging, "/copy", engine, destination)
}

fn write_external(
    engine: &mut dyn StorageEngine,
    cx: &Access,
    link: &Node,
    path: &str,
    target: &str,
) -> Result<()> {
    if engine.exists(path) {
        return Ok(());
    }
    let (stored, abspath) = match &link.inner().kind {
        Kind::Link(data) => (data.filename.clone(), data.abspath),
        _ => return Ok(()),
    };
    let Some(stored) = stored else {
        return Ok(());
    };
    let own_dir = cx.file.filename().parent().map(Path::to_path_buf).unwrap_or_default();
    let filename = if abspath {
        link.file_name().unwrap_or(stored)
    } else if stored.is_absolute() {
        relative_to(&stored, &own_dir)
    } else {
        stored
    };
    let spec = LinkSpec::External {
        file: filename.display().to_string(),
        path: target.to_string(),
    };
    cx.check(path, engine.link(path, &spec))
}

/// Second pass: wire same-file links whose targets now exist.
fn write_links(engine: &mut dyn StorageEngine, cx: &Access, links: &[PendingLink]) -> Result<()> {
    for link in links {
        if link.path == link.target || engine.exists(&link.path) {
            continue;
        }
        if !engine.exists(&link.target) {
            warn!(path = %link.path, target = %link.target, "link target not written; link skipped");
            continue;
        }
        if link.soft {
            cx.check(&link.path, engine.link(&link.path, &LinkSpec::Soft(link.target.clone())))?;
        } else {
            let attrs = cx.check(&link.target, engine.attrs(&link.target))?;
            if !attrs.contains("target") {
                let value = Array::from(link.target.clone());
                cx.check(&link.target, engine.set_attr(&link.target, "target", &value))?;
            }
            cx.check(&link.path, engine.link(&link.path, &LinkSpec::Hard(link.target.clone())))?;
        }
    }
    Ok(())
}

/// `path` relative to the directory `base`.
pub(crate) fn relative_to(path: &Path, base: &Path) -> PathBuf {
    let path: Vec<Component<'_>> = path.components().collect();
    let base: Vec<Component<'_>> = base.components().collect();
    let common = path.iter().zip(&base).take_while(|(a, b)| a == b).count();
    let mut out = PathBuf::new();
    for _ in common..base.len() {
        out.push("..");
    }
    for part in &path[common..] {
        out.push(part.as_os_str());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::DType;
    use crate::field::Field;

    #[test]
    fn invalid_modes_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = File::open(dir.path().join("a.nxs"), "q").unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn missing_file_or_directory() {
        let dir = tempfile::tempdir().unwrap();
        let err = File::open(dir.path().join("missing.nxs"), "r").unwrap_err();
        assert!(matches!(err, Error::StorageAccess { .. }));
        let err = File::open(dir.path().join("no/such/dir.nxs"), "w").unwrap_err();
        assert!(matches!(err, Error::StorageAccess { .. }));
    }

    #[test]
    fn exclusive_create_refuses_existing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.nxs");
        File::open(&path, "w").unwrap();
        assert!(matches!(File::open(&path, "w-"), Err(Error::StorageAccess { .. })));
        assert!(matches!(File::open(&path, "x"), Err(Error::StorageAccess { .. })));
        assert_eq!(File::open(&path, "a").unwrap().mode(), Mode::ReadWrite);
        assert_eq!(File::open(&path, "r+").unwrap().mode(), Mode::ReadWrite);
        assert_eq!(File::open(&path, "r").unwrap().mode(), Mode::Read);
    }

    #[test]
    fn new_files_carry_provenance() {
        let dir = tempfile::tempdir().unwrap();
        let file = File::open(dir.path().join("a.nxs"), "w").unwrap();
        let root = file.read_tree().unwrap();
        assert_eq!(root.class(), "NXroot");
        assert_eq!(root.attr_str("creator").as_deref(), Some("rustyhdf5-nexus"));
        assert!(root.has_attr("file_time"));
        assert!(root.has_attr("HDF5_Version"));
    }

    #[test]
    fn scopes_nest_and_close_once() {
        let dir = tempfile::tempdir().unwrap();
        let file = File::open(dir.path().join("a.nxs"), "w").unwrap();
        assert!(!file.is_open());
        let outer = file.scope().unwrap();
        {
            let _inner = file.scope().unwrap();
            assert!(file.is_open());
        }
        assert!(file.is_open());
        outer.close().unwrap();
        assert!(!file.is_open());
    }

    #[test]
    fn nested_engine_use_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let file = File::open(dir.path().join("a.nxs"), "w").unwrap();
        let inner = file.clone();
        let err = file.with(|_, _| inner.with(|_, _| Ok(()))).unwrap_err();
        assert!(matches!(err, Error::InvalidOperation(_)));
        assert!(!file.is_open());
    }

    #[test]
    fn read_only_file_refuses_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.nxs");
        File::open(&path, "w").unwrap();
        let file = File::open(&path, "r").unwrap();
        let err = file.write_value("/x", &Hyperslab::full(&[1]), &Array::from(vec![1.0])).unwrap_err();
        assert!(matches!(err, Error::ReadOnlyViolation(_)));
    }

    #[test]
    fn storage_errors_carry_path_and_mode() {
        let dir = tempfile::tempdir().unwrap();
        let file = File::open(dir.path().join("a.nxs"), "w").unwrap();
        let err = file.read_value("/missing", &Hyperslab::full(&[1])).unwrap_err();
        match err {
            Error::StorageAccess { path, mode, .. } => {
                assert!(path.ends_with(":/missing"));
                assert_eq!(mode, "rw");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn large_datasets_are_deferred() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.nxs");
        let file = File::open(&path, "w").unwrap();
        file.with(|engine, _| {
            engine.create_group("/entry").unwrap();
            engine.create_dataset("/entry/small", &DatasetLayout::new(DType::F64, &[10])).unwrap();
            engine.create_dataset("/entry/large", &DatasetLayout::new(DType::F64, &[2000])).unwrap();
            Ok(())
        })
        .unwrap();
        let root = file.read_tree().unwrap();
        let entry = root.group("entry").unwrap();
        let small = entry.field("small").unwrap();
        let large = entry.field("large").unwrap();
        assert!(small.is_resident());
        assert!(!large.is_resident());
        assert_eq!(large.shape(), vec![2000]);
        assert_eq!(large.dtype(), Some(DType::F64));
    }

    #[test]
    fn links_wait_for_their_targets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.nxs");
        let root = Group::root();
        let entry = Group::entry();
        root.set("entry", entry.clone()).unwrap();
        entry.set("alias", crate::link::Link::new("/entry/x")).unwrap();
        entry.set("x", Field::new(vec![1.0, 2.0])).unwrap();
        entry.set("dangling", crate::link::Link::new("/entry/nowhere")).unwrap();
        let file = File::open(&path, "w").unwrap();
        file.write_tree(&root).unwrap();
        file.with(|engine, _| {
            assert!(engine.exists("/entry/alias"));
            assert!(!engine.exists("/entry/dangling"));
            assert_eq!(engine.attrs("/entry/x").unwrap().get_str("target").as_deref(), Some("/entry/x"));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn relative_paths() {
        assert_eq!(relative_to(Path::new("/a/b/c.nxs"), Path::new("/a/b")), PathBuf::from("c.nxs"));
        assert_eq!(relative_to(Path::new("/a/x/c.nxs"), Path::new("/a/b")), PathBuf::from("../x/c.nxs"));
    }
}

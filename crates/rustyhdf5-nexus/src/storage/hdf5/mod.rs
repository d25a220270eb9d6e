//! HDF5 file engine.
//!
//! Object headers are read when the file is opened and raw data only when a
//! selection asks for it, touching just the bytes or chunks it covers.
//!
//! Writes never modify bytes the file's committed metadata points at: new
//! raw data, chunks, chunk indexes and object headers are appended past the
//! end of the file, and [`flush`](StorageEngine::flush) commits them by
//! rewriting the superblock last. A process that dies before the superblock
//! is rewritten leaves the file as it was at the previous flush.
//!
//! ```text
//! superblock ──► root header ──► link messages ──► child headers
//!                                                    │
//!                      contiguous data or chunk B-tree ──► chunks
//! ```
//!
//! Supported: superblocks 0 to 3, object headers 1 and 2, compact and
//! old-style groups, compact, contiguous and B-tree chunked layouts, and
//! the deflate, shuffle and fletcher32 filters. Dense link or attribute
//! storage and the newer chunk indexes are reported as invalid operations
//! on the objects that use them.

mod btree;
mod bytes;
mod checksum;
mod datatype;
mod header;
mod heap;
mod message;
mod superblock;

use std::cell::{Ref, RefCell};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use self::btree::ChunkRecord;
use self::bytes::{corrupt, ReadAt, Sizes, UNDEFINED};
use self::datatype::Datatype;
use self::header::Message;
use self::heap::HeapReader;
use self::message::{kind, Dataspace, FilterInfo, Layout, LinkTarget, RawAttribute, UNLIMITED};
use self::superblock::Superblock;
use super::filters::{
    Filter, Pipeline, DEFAULT_LEVEL, FILTER_DEFLATE, FILTER_FLETCHER32, FILTER_SCALEOFFSET, FILTER_SHUFFLE,
};
use super::{split, DatasetLayout, Entry, LinkSpec, ObjectKind, StorageEngine, StorageError, StorageResult};
use crate::array::{c_strides, slab_offsets, Array, DType};
use crate::attrs::AttrDict;
use crate::selection::Hyperslab;

/// Oldest HDF5 library release that reads the files this engine writes,
/// recorded in the `HDF5_Version` root attribute.
pub const LIBRARY_VERSION: &str = "1.8.0";

/// Soft links may point at soft links; give up after this many hops.
const MAX_LINK_DEPTH: usize = 32;

/// Deepest group nesting followed when the file is opened.
const MAX_GROUP_DEPTH: usize = 1024;

/// Block size for copying and filling raw data.
const COPY_BLOCK: usize = 1 << 20;

/// Header message flag: the message body refers to a shared message.
const SHARED: u8 = 0x02;

fn invalid(e: impl ToString) -> StorageError {
    StorageError::Invalid(e.to_string())
}

fn align8(n: u64) -> u64 {
    (n + 7) / 8 * 8
}

/// The open file and the end of its allocated space.
#[derive(Debug)]
struct Disk {
    file: RefCell<fs::File>,
    /// Absolute position all addresses are relative to.
    base: u64,
    sizes: Sizes,
    eof: u64,
}

impl ReadAt for Disk {
    fn read_at(&self, addr: u64, len: usize) -> StorageResult<Vec<u8>> {
        let mut file = self.file.borrow_mut();
        let pos = self.base.saturating_add(addr);
        let available = file.metadata()?.len().saturating_sub(pos);
        if len as u64 > available {
            return Err(corrupt(format!("{len} bytes at {addr:#x} past end of file")));
        }
        file.seek(SeekFrom::Start(pos))?;
        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf).map_err(|e| match e.kind() {
            ErrorKind::UnexpectedEof => corrupt(format!("{len} bytes at {addr:#x} past end of file")),
            _ => e.into(),
        })?;
        Ok(buf)
    }
}

impl Disk {
    fn next_addr(&self) -> u64 {
        align8(self.eof)
    }

    fn allocate(&mut self, len: u64) -> u64 {
        let addr = self.next_addr();
        self.eof = addr + len;
        addr
    }

    fn write_at(&self, addr: u64, bytes: &[u8]) -> StorageResult<()> {
        self.write_absolute(self.base + addr, bytes)
    }

    fn write_absolute(&self, pos: u64, bytes: &[u8]) -> StorageResult<()> {
        let mut file = self.file.borrow_mut();
        file.seek(SeekFrom::Start(pos))?;
        file.write_all(bytes)?;
        Ok(())
    }

    fn append(&mut self, bytes: &[u8]) -> StorageResult<u64> {
        let addr = self.allocate(bytes.len() as u64);
        self.write_at(addr, bytes)?;
        Ok(addr)
    }

    /// Allocate `len` bytes holding `pattern` repeated, or zeros.
    fn append_filled(&mut self, len: u64, pattern: Option<&[u8]>) -> StorageResult<u64> {
        let addr = self.allocate(len);
        match pattern.filter(|p| !p.is_empty() && p.iter().any(|&b| b != 0)) {
            None => {
                let file = self.file.borrow_mut();
                let end = self.base + addr + len;
                if file.metadata()?.len() < end {
                    file.set_len(end)?;
                }
            }
            Some(pattern) => {
                let per_block = (COPY_BLOCK / pattern.len()).max(1);
                let block = pattern.repeat(per_block);
                let mut done = 0u64;
                while done < len {
                    let n = (len - done).min(block.len() as u64) as usize;
                    self.write_at(addr + done, &block[..n])?;
                    done += n as u64;
                }
            }
        }
        Ok(addr)
    }

    /// Copy `len` bytes at `from` to new space.
    fn relocate(&mut self, from: u64, len: u64) -> StorageResult<u64> {
        let addr = self.allocate(len);
        let mut done = 0u64;
        while done < len {
            let n = (len - done).min(COPY_BLOCK as u64) as usize;
            let block = self.read_at(from + done, n)?;
            self.write_at(addr + done, &block)?;
            done += n as u64;
        }
        Ok(addr)
    }

    fn sync(&self) -> StorageResult<()> {
        self.file.borrow().sync_data()?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
enum Link {
    Hard(usize),
    Soft(String),
    External { file: String, path: String },
    /// Object that is neither a group nor a dataset, kept as found.
    Opaque(u64),
}

#[derive(Debug)]
enum Storage {
    Compact(Vec<u8>),
    /// `fresh` space was allocated since the last flush and may be
    /// written in place.
    Contiguous { addr: u64, fresh: bool },
    Chunked {
        dims: Vec<usize>,
        btree: u64,
        /// Records by chunk offset, read on first use.
        index: RefCell<Option<BTreeMap<Vec<u64>, ChunkRecord>>>,
        changed: bool,
    },
    Unsupported(String),
}

#[derive(Debug)]
struct Dataset {
    layout: DatasetLayout,
    datatype: Datatype,
    /// Datatype message as stored.
    datatype_msg: Vec<u8>,
    max: Option<Vec<u64>>,
    storage: Storage,
    pipeline: Pipeline,
    filters: Vec<FilterInfo>,
    fill: Option<Vec<u8>>,
    /// Messages the dataset was loaded from, rewritten as they were when
    /// the dataset cannot be modelled.
    described: Vec<Message>,
}

impl Dataset {
    fn check(&self, path: &str) -> StorageResult<()> {
        self.datatype.dtype().map_err(|e| StorageError::Invalid(format!("'{path}': {e}")))?;
        if let Storage::Unsupported(what) = &self.storage {
            return Err(StorageError::Invalid(format!("'{path}' uses {what}, which is not supported")));
        }
        Ok(())
    }

    fn element_size(&self, sizes: Sizes) -> usize {
        self.datatype.size(sizes)
    }

    /// One element of fill bytes.
    fn fill_element(&self, sizes: Sizes) -> Vec<u8> {
        self.fill.clone().unwrap_or_else(|| vec![0; self.element_size(sizes)])
    }
}

#[derive(Debug)]
enum Body {
    Group { links: BTreeMap<String, Link>, dense: bool },
    Dataset(Dataset),
}

#[derive(Debug)]
struct Object {
    /// Header address as of the last flush.
    addr: Option<u64>,
    refcount: u32,
    dirty: bool,
    attrs: AttrDict,
    /// Attributes with types this engine cannot represent, kept verbatim.
    foreign_attrs: Vec<(String, Message)>,
    dense_attrs: bool,
    /// Messages carried over unchanged when the header is rewritten.
    extra: Vec<Message>,
    body: Body,
}

impl Object {
    fn new(body: Body) -> Object {
        Object {
            addr: None,
            refcount: 0,
            dirty: true,
            attrs: AttrDict::new(),
            foreign_attrs: Vec::new(),
            dense_attrs: false,
            extra: Vec::new(),
            body,
        }
    }

    fn empty_group() -> Object {
        Object::new(Body::Group { links: BTreeMap::new(), dense: false })
    }

    fn kind(&self) -> ObjectKind {
        match self.body {
            Body::Group { .. } => ObjectKind::Group,
            Body::Dataset(_) => ObjectKind::Dataset,
        }
    }
}

/// Engine over one HDF5 file.
#[derive(Debug)]
pub struct Hdf5Engine {
    path: PathBuf,
    writable: bool,
    disk: Disk,
    superblock: Superblock,
    /// Arena of objects; the root group is 0.
    objects: Vec<Object>,
    dirty: bool,
}

impl Hdf5Engine {
    /// Open an existing file.
    pub fn open(path: impl AsRef<Path>, writable: bool) -> StorageResult<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new().read(true).write(writable).open(path)?;
        let len = file.metadata()?.len();
        let mut disk = Disk { file: RefCell::new(file), base: 0, sizes: Sizes::DEFAULT, eof: 0 };
        let mut superblock = Superblock::locate(&disk, len)?;
        disk.base = superblock.base;
        disk.sizes = superblock.sizes;
        disk.eof = superblock.eof.max(len.saturating_sub(superblock.base));
        if superblock.extension != UNDEFINED {
            let extension = header::read(&disk, superblock.extension, disk.sizes)?;
            if let Some(m) = extension.find(kind::BTREE_K) {
                superblock.chunk_k = message::parse_btree_k(&m.data, disk.sizes)?;
            }
        }
        let mut engine = Self { path: path.to_path_buf(), writable, disk, superblock, objects: Vec::new(), dirty: false };
        let mut loaded = HashMap::new();
        let root = engine.superblock.root;
        engine.load(root, &mut loaded, 0)?;
        if engine.objects.first().map(Object::kind) != Some(ObjectKind::Group) {
            return Err(corrupt("the root object is not a group"));
        }
        debug!(
            path = %path.display(),
            superblock = engine.superblock.version,
            objects = engine.objects.len(),
            writable,
            "opened hdf5 file"
        );
        Ok(engine)
    }

    /// Create (or truncate) a file holding an empty root group.
    pub fn create(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new().read(true).write(true).create(true).truncate(true).open(path)?;
        let superblock = Superblock::new(UNDEFINED, 0);
        let eof = superblock.encode().len() as u64;
        let disk = Disk { file: RefCell::new(file), base: 0, sizes: superblock.sizes, eof };
        let mut engine = Self {
            path: path.to_path_buf(),
            writable: true,
            disk,
            superblock,
            objects: vec![Object::empty_group()],
            dirty: true,
        };
        engine.flush()?;
        debug!(path = %path.display(), "created hdf5 file");
        Ok(engine)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the object at `addr` and everything it links to. `None` for
    /// objects that are neither groups nor datasets.
    fn load(&mut self, addr: u64, loaded: &mut HashMap<u64, Option<usize>>, depth: usize) -> StorageResult<Option<usize>> {
        if let Some(&id) = loaded.get(&addr) {
            return Ok(id);
        }
        if depth > MAX_GROUP_DEPTH {
            return Err(corrupt(format!("groups nested deeper than {MAX_GROUP_DEPTH} levels")));
        }
        let header = header::read(&self.disk, addr, self.disk.sizes)?;
        let Some((object, children)) = self.parse_object(addr, header)? else {
            loaded.insert(addr, None);
            return Ok(None);
        };
        let id = self.objects.len();
        self.objects.push(object);
        loaded.insert(addr, Some(id));
        let mut links = BTreeMap::new();
        for (name, target) in children {
            let link = match target {
                LinkTarget::Hard(child) => match self.load(child, loaded, depth + 1)? {
                    Some(child_id) => Link::Hard(child_id),
                    None => Link::Opaque(child),
                },
                LinkTarget::Soft(path) => Link::Soft(path),
                LinkTarget::External { file, path } => Link::External { file, path },
            };
            links.insert(name, link);
        }
        if let Body::Group { links: slot, .. } = &mut self.objects[id].body {
            *slot = links;
        }
        Ok(Some(id))
    }

    fn parse_object(
        &self,
        addr: u64,
        header: header::Header,
    ) -> StorageResult<Option<(Object, Vec<(String, LinkTarget)>)>> {
        let sizes = self.disk.sizes;
        let mut is_group = false;
        let mut dense = false;
        let mut children = Vec::new();
        let mut attrs = AttrDict::new();
        let mut foreign_attrs = Vec::new();
        let mut dense_attrs = false;
        let mut extra = Vec::new();
        let mut described = Vec::new();
        let (mut space, mut datatype, mut layout, mut filters, mut fill, mut fill_old) =
            (None, None, None, Vec::new(), None, None);
        for m in header.messages {
            match m.kind {
                kind::LINK => {
                    is_group = true;
                    children.push(message::parse_link(&m.data, sizes)?);
                }
                kind::SYMBOL_TABLE => {
                    is_group = true;
                    let (tree, heap) = message::parse_symbol_table(&m.data, sizes)?;
                    children.extend(btree::read_group(&self.disk, tree, heap, sizes)?);
                }
                kind::LINK_INFO => {
                    is_group = true;
                    if message::parse_link_info(&m.data, sizes)? != UNDEFINED {
                        warn!(addr, "group uses dense link storage; its members are not readable");
                        dense = true;
                        extra.push(m);
                    }
                }
                kind::GROUP_INFO => is_group = true,
                kind::DATASPACE => {
                    space = Some(Dataspace::parse(&m.data, sizes)?);
                    described.push(m);
                }
                kind::DATATYPE => {
                    let parsed = match Datatype::parse(&m.data, sizes) {
                        Ok(parsed) if m.flags & SHARED == 0 => parsed,
                        Ok(_) => Datatype::Unsupported { size: 0, what: "shared datatype".into() },
                        Err(e) => Datatype::Unsupported { size: 0, what: e.to_string() },
                    };
                    datatype = Some((parsed, m.data.clone()));
                    described.push(m);
                }
                kind::LAYOUT => {
                    layout = Some(Layout::parse(&m.data, sizes).unwrap_or_else(|e| Layout::Unsupported(e.to_string())));
                    described.push(m);
                }
                kind::FILTERS => {
                    filters = message::parse_filters(&m.data, sizes)?;
                    described.push(m);
                }
                kind::FILL => {
                    fill = Some(message::parse_fill(m.kind, &m.data, sizes)?);
                    described.push(m);
                }
                kind::FILL_OLD => {
                    fill_old = Some(message::parse_fill(m.kind, &m.data, sizes)?);
                    described.push(m);
                }
                kind::ATTRIBUTE => match message::parse_attribute(&m.data, sizes) {
                    Ok(raw) => match self.decode_attribute(&raw) {
                        Ok(value) => {
                            attrs.insert(raw.name, value);
                        }
                        Err(e) => {
                            debug!(addr, name = %raw.name, error = %e, "keeping attribute verbatim");
                            foreign_attrs.push((raw.name, m));
                        }
                    },
                    Err(e) => {
                        debug!(addr, error = %e, "keeping attribute verbatim");
                        foreign_attrs.push((String::new(), m));
                    }
                },
                kind::ATTRIBUTE_INFO => {
                    if message::parse_attribute_info(&m.data, sizes)? != UNDEFINED {
                        warn!(addr, "object uses dense attribute storage; its attributes are not readable");
                        dense_attrs = true;
                        extra.push(m);
                    }
                }
                kind::REFCOUNT => {}
                _ => extra.push(m),
            }
        }
        let body = match (space, datatype, layout) {
            (Some(space), Some((datatype, datatype_msg)), Some(layout)) => {
                let fill = fill.or(fill_old).flatten();
                let mut ds = dataset_from_parts(space, datatype, datatype_msg, layout, filters, fill, sizes)?;
                ds.described = described;
                Body::Dataset(ds)
            }
            _ if is_group => Body::Group { links: BTreeMap::new(), dense },
            _ => return Ok(None),
        };
        let object = Object {
            addr: Some(addr),
            refcount: header.refcount,
            dirty: false,
            attrs,
            foreign_attrs,
            dense_attrs,
            extra,
            body,
        };
        Ok(Some((object, children)))
    }

    fn decode_attribute(&self, raw: &RawAttribute) -> StorageResult<Array> {
        if raw.space.null {
            return Err(invalid("attribute without a dataspace"));
        }
        let sizes = self.disk.sizes;
        let dtype = raw.datatype.dtype()?;
        let mut heap = HeapReader::new(&self.disk, sizes);
        let data = raw.datatype.decode(&raw.data, sizes, &mut |r| heap.string(r))?;
        let shape = raw.space.dims.iter().map(|&n| n as usize).collect();
        Array::new(dtype, shape, data).map_err(invalid)
    }

    fn check_writable(&self) -> StorageResult<()> {
        if self.writable {
            Ok(())
        } else {
            Err(StorageError::ReadOnly)
        }
    }

    /// Object id at `path`, following every link.
    fn resolve(&self, path: &str) -> StorageResult<usize> {
        self.resolve_depth(path, 0)
    }

    fn resolve_depth(&self, path: &str, depth: usize) -> StorageResult<usize> {
        if depth > MAX_LINK_DEPTH {
            return Err(StorageError::Invalid(format!("too many levels of links at '{path}'")));
        }
        let mut id = 0;
        for name in path.split('/').filter(|s| !s.is_empty()) {
            id = match self.links(id, path)?.get(name) {
                Some(Link::Hard(target)) => *target,
                Some(Link::Soft(target)) => self.resolve_depth(target, depth + 1)?,
                Some(Link::External { file, .. }) => {
                    return Err(StorageError::Invalid(format!(
                        "'{path}' passes through an external link to '{file}'"
                    )));
                }
                Some(Link::Opaque(_)) | None => return Err(StorageError::NotFound(path.to_string())),
            };
        }
        Ok(id)
    }

    fn links(&self, id: usize, path: &str) -> StorageResult<&BTreeMap<String, Link>> {
        match &self.objects[id].body {
            Body::Group { dense: true, .. } => Err(dense_error(path)),
            Body::Group { links, .. } => Ok(links),
            Body::Dataset(_) => Err(StorageError::NotFound(path.to_string())),
        }
    }

    fn links_mut(&mut self, id: usize, path: &str) -> StorageResult<&mut BTreeMap<String, Link>> {
        let object = &mut self.objects[id];
        match &mut object.body {
            Body::Group { dense: true, .. } => Err(dense_error(path)),
            Body::Group { links, .. } => {
                object.dirty = true;
                Ok(links)
            }
            Body::Dataset(_) => Err(StorageError::Invalid(format!("'{path}' is not a group"))),
        }
    }

    /// Group id of the parent of `path` and the final name.
    fn parent_of(&self, path: &str) -> StorageResult<(usize, String)> {
        let (parent, name) = split(path);
        if name.is_empty() {
            return Err(StorageError::Invalid("the root has no parent".into()));
        }
        let id = self.resolve(&parent)?;
        match self.objects[id].body {
            Body::Group { .. } => Ok((id, name)),
            Body::Dataset(_) => Err(StorageError::Invalid(format!("'{parent}' is not a group"))),
        }
    }

    /// Insert a new link, refusing to overwrite.
    fn add_link(&mut self, path: &str, link: Link) -> StorageResult<()> {
        self.check_writable()?;
        let (parent, name) = self.parent_of(path)?;
        if self.links(parent, path)?.contains_key(&name) {
            return Err(StorageError::Exists(path.to_string()));
        }
        self.links_mut(parent, path)?.insert(name, link);
        self.dirty = true;
        Ok(())
    }

    fn add_object(&mut self, path: &str, object: Object) -> StorageResult<()> {
        self.check_writable()?;
        let id = self.objects.len();
        self.objects.push(object);
        if let Err(e) = self.add_link(path, Link::Hard(id)) {
            self.objects.pop();
            return Err(e);
        }
        Ok(())
    }

    /// Dataset at `path`, whether or not its contents are readable.
    fn dataset_entry(&self, path: &str) -> StorageResult<&Dataset> {
        match &self.objects[self.resolve(path)?].body {
            Body::Dataset(ds) => Ok(ds),
            Body::Group { .. } => Err(StorageError::Invalid(format!("'{path}' is a group"))),
        }
    }

    fn dataset(&self, path: &str) -> StorageResult<&Dataset> {
        let ds = self.dataset_entry(path)?;
        ds.check(path)?;
        Ok(ds)
    }

    fn attr_object_mut(&mut self, path: &str) -> StorageResult<&mut Object> {
        self.check_writable()?;
        let id = self.resolve(path)?;
        let object = &mut self.objects[id];
        if object.dense_attrs {
            return Err(StorageError::Invalid(format!(
                "'{path}' keeps its attributes in dense storage, which is not supported"
            )));
        }
        Ok(object)
    }
}

fn dense_error(path: &str) -> StorageError {
    StorageError::Invalid(format!("'{path}' uses dense link storage, which is not supported"))
}

fn dataset_from_parts(
    space: Dataspace,
    datatype: Datatype,
    datatype_msg: Vec<u8>,
    layout: Layout,
    filters: Vec<FilterInfo>,
    fill: Option<Vec<u8>>,
    sizes: Sizes,
) -> StorageResult<Dataset> {
    let shape: Vec<usize> = space.dims.iter().map(|&n| n as usize).collect();
    let dtype = datatype.dtype().unwrap_or(DType::U8);
    let mut stored = DatasetLayout::new(dtype, &shape);
    let max = space.max.filter(|max| *max != space.dims);
    stored.maxshape = max
        .as_ref()
        .map(|max| max.iter().map(|&m| if m == UNLIMITED { None } else { Some(m as usize) }).collect());
    let pipeline = Pipeline {
        filters: filters
            .iter()
            .map(|f| Filter {
                id: f.id,
                level: match f.id {
                    FILTER_DEFLATE => f.values.first().copied().unwrap_or(DEFAULT_LEVEL),
                    FILTER_SCALEOFFSET => f.values.get(1).copied().unwrap_or(0),
                    _ => 0,
                },
            })
            .collect(),
    };
    for filter in &pipeline.filters {
        match filter.id {
            FILTER_DEFLATE => {
                stored.compression = Some("gzip".into());
                stored.compression_opts = Some(filter.level);
            }
            FILTER_SHUFFLE => stored.shuffle = true,
            FILTER_FLETCHER32 => stored.fletcher32 = true,
            FILTER_SCALEOFFSET => stored.scaleoffset = Some(filter.level as i32),
            _ => {}
        }
    }
    if let (Some(raw), Ok(dtype)) = (&fill, datatype.dtype()) {
        if datatype != Datatype::VarStr && raw.len() == datatype.size(sizes) {
            let data = datatype.decode(raw, sizes, &mut |_| Err(corrupt("unexpected string reference")))?;
            stored.fillvalue = Array::new(dtype, Vec::new(), data).ok().and_then(|a| a.item());
        }
    }
    let storage = match layout {
        Layout::Compact(bytes) => Storage::Compact(bytes),
        Layout::Contiguous { addr, .. } => Storage::Contiguous { addr, fresh: false },
        Layout::Chunked { dims, btree } => {
            let dims: Vec<usize> = dims.iter().map(|&n| n as usize).collect();
            stored.chunks = Some(dims.clone());
            Storage::Chunked { dims, btree, index: RefCell::new(None), changed: false }
        }
        Layout::Unsupported(what) => Storage::Unsupported(what),
    };
    Ok(Dataset { layout: stored, datatype, datatype_msg, max, storage, pipeline, filters, fill, described: Vec::new() })
}

/// Chunk shape for a dataset created without one, targeting chunks of
/// 8 KiB to 1 MiB that scale with the dataset.
fn guess_chunks(shape: &[usize], element: usize) -> Vec<usize> {
    const BASE: f64 = 16.0 * 1024.0;
    const MIN: f64 = 8.0 * 1024.0;
    const MAX: f64 = 1024.0 * 1024.0;
    let mut chunks: Vec<f64> = shape.iter().map(|&n| if n == 0 { 1024.0 } else { n as f64 }).collect();
    let element = element.max(1) as f64;
    let total = chunks.iter().product::<f64>() * element;
    let target = (BASE * 2f64.powf((total / MAX).log10())).clamp(MIN, MAX);
    let mut i = 0;
    loop {
        let count = chunks.iter().product::<f64>();
        let bytes = count * element;
        if (bytes < target || (bytes - target).abs() / target < 0.5) && bytes < MAX {
            break;
        }
        if count <= 1.0 {
            break;
        }
        let d = i % chunks.len();
        chunks[d] = (chunks[d] / 2.0).ceil();
        i += 1;
    }
    chunks.iter().map(|&c| c as usize).collect()
}

/// Filter pipeline message entries for a new dataset.
fn filter_infos(pipeline: &Pipeline, element: usize, dtype: DType) -> Vec<FilterInfo> {
    pipeline
        .filters
        .iter()
        .map(|f| {
            let (flags, values) = match f.id {
                FILTER_DEFLATE => (1, vec![f.level]),
                FILTER_SHUFFLE => (1, vec![element as u32]),
                // Floating-point decimal scaling, or integer bit reduction.
                FILTER_SCALEOFFSET => (1, vec![if dtype.is_float() { 0 } else { 2 }, f.level]),
                _ => (0, Vec::new()),
            };
            FilterInfo { id: f.id, flags, name: None, values }
        })
        .collect()
}

/// Raw bytes of `value`, with strings stored in a new heap collection.
fn encode_values(disk: &mut Disk, datatype: &Datatype, value: &Array) -> StorageResult<Vec<u8>> {
    let sizes = disk.sizes;
    let mut refs = Vec::new().into_iter();
    if *datatype == Datatype::VarStr {
        let texts: Vec<&str> = value.as_text().unwrap_or_default().iter().map(String::as_str).collect();
        let (r, collections) = heap::pack(&texts, disk.next_addr(), sizes);
        if !collections.is_empty() {
            disk.append(&collections)?;
        }
        refs = r.into_iter();
    }
    datatype.encode_data(value.data(), sizes, &mut |_| {
        refs.next().ok_or_else(|| corrupt("string reference count mismatch"))
    })
}

fn unravel(mut flat: usize, shape: &[usize]) -> Vec<usize> {
    let mut coords = vec![0; shape.len()];
    for d in (0..shape.len()).rev() {
        let n = shape[d].max(1);
        coords[d] = flat % n;
        flat /= n;
    }
    coords
}

/// Elements of `offsets` grouped by chunk: chunk offset to pairs of
/// (position in the selection, element index inside the chunk).
fn by_chunk(offsets: &[usize], shape: &[usize], dims: &[usize]) -> BTreeMap<Vec<u64>, Vec<(usize, usize)>> {
    let inner = c_strides(dims);
    let mut groups: BTreeMap<Vec<u64>, Vec<(usize, usize)>> = BTreeMap::new();
    for (i, &flat) in offsets.iter().enumerate() {
        let coords = unravel(flat, shape);
        let mut key = Vec::with_capacity(coords.len());
        let mut within = 0;
        for (d, &c) in coords.iter().enumerate() {
            let start = c / dims[d] * dims[d];
            key.push(start as u64);
            within += (c - start) * inner[d];
        }
        groups.entry(key).or_default().push((i, within));
    }
    groups
}

fn load_index<'a>(
    disk: &Disk,
    btree: u64,
    rank: usize,
    index: &'a RefCell<Option<BTreeMap<Vec<u64>, ChunkRecord>>>,
) -> StorageResult<Ref<'a, BTreeMap<Vec<u64>, ChunkRecord>>> {
    if index.borrow().is_none() {
        let records = btree::read_chunks(disk, btree, rank, disk.sizes)?;
        *index.borrow_mut() = Some(records.into_iter().map(|r| (r.offset.clone(), r)).collect());
    }
    Ref::filter_map(index.borrow(), Option::as_ref).map_err(|_| corrupt("chunk index missing"))
}

/// Decoded bytes of one stored chunk.
fn read_chunk(disk: &Disk, ds: &Dataset, record: &ChunkRecord, chunk_bytes: usize) -> StorageResult<Vec<u8>> {
    let stored = disk.read_at(record.addr, record.size as usize)?;
    let data = ds.pipeline.decode(&stored, ds.element_size(disk.sizes), record.mask)?;
    if data.len() != chunk_bytes {
        return Err(corrupt(format!(
            "chunk at {:?} holds {} bytes, expected {chunk_bytes}",
            record.offset,
            data.len()
        )));
    }
    Ok(data)
}

/// Raw bytes of the elements at `offsets`, in order.
fn read_elements(disk: &Disk, ds: &Dataset, offsets: &[usize]) -> StorageResult<Vec<u8>> {
    let size = ds.element_size(disk.sizes);
    let mut out = vec![0u8; offsets.len() * size];
    match &ds.storage {
        Storage::Compact(bytes) => {
            for (slot, &i) in out.chunks_exact_mut(size.max(1)).zip(offsets) {
                let src = bytes.get(i * size..(i + 1) * size).ok_or_else(|| corrupt("compact data too short"))?;
                slot.copy_from_slice(src);
            }
        }
        Storage::Contiguous { addr, .. } if *addr == UNDEFINED => {
            let fill = ds.fill_element(disk.sizes);
            for slot in out.chunks_exact_mut(size.max(1)) {
                slot.copy_from_slice(&fill);
            }
        }
        Storage::Contiguous { addr, .. } => {
            let (Some(&lo), Some(&hi)) = (offsets.iter().min(), offsets.iter().max()) else {
                return Ok(out);
            };
            let span = hi - lo + 1;
            if span <= offsets.len().saturating_mul(4) {
                let block = disk.read_at(addr + (lo * size) as u64, span * size)?;
                for (slot, &i) in out.chunks_exact_mut(size.max(1)).zip(offsets) {
                    let at = (i - lo) * size;
                    slot.copy_from_slice(&block[at..at + size]);
                }
            } else {
                let mut k = 0;
                while k < offsets.len() {
                    let mut run = 1;
                    while k + run < offsets.len() && offsets[k + run] == offsets[k] + run {
                        run += 1;
                    }
                    let block = disk.read_at(addr + (offsets[k] * size) as u64, run * size)?;
                    out[k * size..(k + run) * size].copy_from_slice(&block);
                    k += run;
                }
            }
        }
        Storage::Chunked { dims, btree, index, .. } => {
            let index = load_index(disk, *btree, dims.len(), index)?;
            let chunk_bytes = dims.iter().product::<usize>() * size;
            let fill = ds.fill_element(disk.sizes);
            for (key, members) in by_chunk(offsets, &ds.layout.shape, dims) {
                let chunk = match index.get(&key) {
                    Some(record) => Some(read_chunk(disk, ds, record, chunk_bytes)?),
                    None => None,
                };
                for (i, within) in members {
                    let src = match &chunk {
                        Some(chunk) => &chunk[within * size..(within + 1) * size],
                        None => fill.as_slice(),
                    };
                    out[i * size..(i + 1) * size].copy_from_slice(src);
                }
            }
        }
        Storage::Unsupported(what) => return Err(StorageError::Invalid(format!("cannot read {what}"))),
    }
    Ok(out)
}

/// Store one chunk past the end of the file and record it.
fn store_chunk(disk: &mut Disk, ds: &Dataset, key: Vec<u64>, data: &[u8]) -> StorageResult<ChunkRecord> {
    let stored = ds.pipeline.encode(data, ds.element_size(disk.sizes))?;
    let size = u32::try_from(stored.len()).map_err(|_| invalid("chunks must stay under 4 GiB"))?;
    let addr = disk.append(&stored)?;
    Ok(ChunkRecord { offset: key, size, mask: ds.pipeline.skip_mask(), addr })
}

fn write_elements(disk: &mut Disk, ds: &mut Dataset, offsets: &[usize], raw: &[u8]) -> StorageResult<()> {
    if matches!(ds.storage, Storage::Chunked { .. }) {
        return write_chunks(disk, ds, offsets, raw);
    }
    let size = ds.element_size(disk.sizes);
    let total = (ds.layout.shape.iter().product::<usize>() * size) as u64;
    match &mut ds.storage {
        Storage::Compact(bytes) => {
            for (src, &i) in raw.chunks_exact(size.max(1)).zip(offsets) {
                let dst = bytes.get_mut(i * size..(i + 1) * size).ok_or_else(|| corrupt("compact data too short"))?;
                dst.copy_from_slice(src);
            }
        }
        Storage::Contiguous { addr, fresh } => {
            if offsets.is_empty() {
                return Ok(());
            }
            if *addr == UNDEFINED {
                *addr = disk.append_filled(total, ds.fill.as_deref())?;
            } else if !*fresh {
                *addr = disk.relocate(*addr, total)?;
            }
            *fresh = true;
            let mut k = 0;
            while k < offsets.len() {
                let mut run = 1;
                while k + run < offsets.len() && offsets[k + run] == offsets[k] + run {
                    run += 1;
                }
                disk.write_at(*addr + (offsets[k] * size) as u64, &raw[k * size..(k + run) * size])?;
                k += run;
            }
        }
        Storage::Chunked { .. } => {}
        Storage::Unsupported(what) => return Err(StorageError::Invalid(format!("cannot write {what}"))),
    }
    Ok(())
}

/// Rewrite every chunk `offsets` touches. Chunks the selection covers
/// completely are not read back first.
fn write_chunks(disk: &mut Disk, ds: &mut Dataset, offsets: &[usize], raw: &[u8]) -> StorageResult<()> {
    let size = ds.element_size(disk.sizes);
    let Storage::Chunked { dims, btree, index, .. } = &ds.storage else {
        return Ok(());
    };
    let chunk_len = dims.iter().product::<usize>();
    let mut updates = Vec::new();
    {
        let records = load_index(disk, *btree, dims.len(), index)?;
        let fill = ds.fill_element(disk.sizes);
        for (key, members) in by_chunk(offsets, &ds.layout.shape, dims) {
            let mut chunk = match records.get(&key) {
                Some(_) if members.len() == chunk_len => vec![0u8; chunk_len * size],
                Some(record) => read_chunk(disk, ds, record, chunk_len * size)?,
                None => fill.repeat(chunk_len),
            };
            for (i, within) in members {
                chunk[within * size..(within + 1) * size].copy_from_slice(&raw[i * size..(i + 1) * size]);
            }
            updates.push((key, chunk));
        }
    }
    let mut stored = Vec::with_capacity(updates.len());
    for (key, chunk) in updates {
        stored.push(store_chunk(disk, ds, key, &chunk)?);
    }
    if let Storage::Chunked { index, changed, .. } = &mut ds.storage {
        if let Some(records) = index.get_mut() {
            for record in stored {
                records.insert(record.offset.clone(), record);
            }
        }
        *changed = true;
    }
    Ok(())
}

/// Drop chunks wholly outside `shape` and reset the elements of edge
/// chunks that fall outside it to the fill value.
fn shrink_chunks(disk: &mut Disk, ds: &mut Dataset, shape: &[usize]) -> StorageResult<()> {
    let size = ds.element_size(disk.sizes);
    let Storage::Chunked { dims, btree, index, .. } = &ds.storage else {
        return Ok(());
    };
    let chunk_len = dims.iter().product::<usize>();
    let mut dropped = Vec::new();
    let mut cleared = Vec::new();
    {
        let records = load_index(disk, *btree, dims.len(), index)?;
        let fill = ds.fill_element(disk.sizes);
        for (key, record) in records.iter() {
            let outside = key.iter().zip(shape).any(|(&o, &n)| o as usize >= n);
            if outside {
                dropped.push(key.clone());
                continue;
            }
            let partial = key.iter().zip(dims).zip(shape).zip(&ds.layout.shape).any(|(((&o, &d), &new), &old)| {
                new < old && o as usize + d > new
            });
            if !partial {
                continue;
            }
            let mut chunk = read_chunk(disk, ds, record, chunk_len * size)?;
            for within in 0..chunk_len {
                let coords = unravel(within, dims);
                if coords.iter().zip(key).zip(shape).any(|((&c, &o), &n)| o as usize + c >= n) {
                    chunk[within * size..(within + 1) * size].copy_from_slice(&fill);
                }
            }
            cleared.push((key.clone(), chunk));
        }
    }
    let mut stored = Vec::with_capacity(cleared.len());
    for (key, chunk) in cleared {
        stored.push(store_chunk(disk, ds, key, &chunk)?);
    }
    if let Storage::Chunked { index, changed, .. } = &mut ds.storage {
        if let Some(records) = index.get_mut() {
            for key in &dropped {
                records.remove(key);
            }
            for record in stored {
                records.insert(record.offset.clone(), record);
            }
        }
        *changed = true;
    }
    Ok(())
}

/// Header messages describing a dataset.
fn dataset_messages(ds: &Dataset, sizes: Sizes) -> StorageResult<Vec<Message>> {
    if ds.check("").is_err() {
        return Ok(ds.described.clone());
    }
    let chunked = matches!(ds.storage, Storage::Chunked { .. });
    let element = ds.element_size(sizes);
    let layout = match &ds.storage {
        Storage::Compact(bytes) => Layout::Compact(bytes.clone()),
        Storage::Contiguous { addr, .. } => Layout::Contiguous {
            addr: *addr,
            size: (ds.layout.shape.iter().product::<usize>() * element) as u64,
        },
        Storage::Chunked { dims, btree, .. } => {
            Layout::Chunked { dims: dims.iter().map(|&n| n as u64).collect(), btree: *btree }
        }
        Storage::Unsupported(_) => return Ok(ds.described.clone()),
    };
    let mut messages = vec![
        Message::new(kind::DATASPACE, Dataspace::simple(&ds.layout.shape, ds.max.clone()).encode(sizes)),
        Message { flags: 1, ..Message::new(kind::DATATYPE, ds.datatype_msg.clone()) },
        Message::new(kind::FILL, message::encode_fill(ds.fill.as_deref(), chunked, sizes)),
        Message::new(kind::LAYOUT, layout.encode(element, sizes)?),
    ];
    if !ds.filters.is_empty() {
        messages.push(Message::new(kind::FILTERS, message::encode_filters(&ds.filters, sizes)));
    }
    Ok(messages)
}

fn attribute_message(name: &str, value: &Array, sizes: Sizes) -> StorageResult<Message> {
    let datatype = match value.as_text() {
        Some(texts) => Datatype::fixed_str_for(texts),
        None => Datatype::for_dtype(value.dtype()),
    };
    let data = datatype.encode_data(value.data(), sizes, &mut |_| Err(invalid("attributes store fixed strings")))?;
    let raw = RawAttribute { name: name.to_string(), datatype, space: Dataspace::simple(value.shape(), None), data };
    Ok(Message::new(kind::ATTRIBUTE, message::encode_attribute(&raw, sizes)?))
}

impl Hdf5Engine {
    /// Depth-first order of the objects reachable from the root, the hard
    /// link count of each and the groups linking to each.
    fn reachable(&self) -> (Vec<usize>, HashMap<usize, u32>, HashMap<usize, Vec<usize>>) {
        let mut order = Vec::new();
        let mut counts: HashMap<usize, u32> = HashMap::from([(0, 1)]);
        let mut parents: HashMap<usize, Vec<usize>> = HashMap::new();
        let mut seen = HashSet::from([0]);
        let mut stack = vec![0];
        while let Some(id) = stack.pop() {
            order.push(id);
            if let Body::Group { links, .. } = &self.objects[id].body {
                for link in links.values() {
                    if let Link::Hard(child) = link {
                        *counts.entry(*child).or_default() += 1;
                        parents.entry(*child).or_default().push(id);
                        if seen.insert(*child) {
                            stack.push(*child);
                        }
                    }
                }
            }
        }
        (order, counts, parents)
    }

    /// Header messages of an object, with children at `addrs`.
    fn object_messages(&self, id: usize, addrs: &HashMap<usize, u64>) -> StorageResult<Vec<Message>> {
        let sizes = self.disk.sizes;
        let object = &self.objects[id];
        let mut messages = Vec::new();
        match &object.body {
            Body::Group { links, dense } => {
                // A dense group keeps its own link info message in `extra`.
                if !dense {
                    messages.push(Message::new(kind::LINK_INFO, message::encode_link_info(sizes)));
                }
                messages.push(Message::new(kind::GROUP_INFO, message::encode_group_info()));
                for (name, link) in links {
                    let target = match link {
                        Link::Hard(child) => LinkTarget::Hard(
                            addrs.get(child).copied().or(self.objects[*child].addr).unwrap_or(UNDEFINED),
                        ),
                        Link::Soft(path) => LinkTarget::Soft(path.clone()),
                        Link::External { file, path } => LinkTarget::External { file: file.clone(), path: path.clone() },
                        Link::Opaque(addr) => LinkTarget::Hard(*addr),
                    };
                    messages.push(Message::new(kind::LINK, message::encode_link(name, &target, sizes)?));
                }
            }
            Body::Dataset(ds) => messages.extend(dataset_messages(ds, sizes)?),
        }
        for (name, value) in object.attrs.iter() {
            messages.push(attribute_message(name, value, sizes)?);
        }
        for (name, m) in &object.foreign_attrs {
            if !object.attrs.contains(name) {
                messages.push(m.clone());
            }
        }
        messages.extend(object.extra.iter().cloned());
        Ok(messages)
    }

    /// Write every changed chunk index past the end of the file.
    fn write_chunk_indexes(&mut self, order: &[usize]) -> StorageResult<()> {
        let sizes = self.disk.sizes;
        let k = self.superblock.chunk_k;
        for &id in order {
            let object = &mut self.objects[id];
            let Body::Dataset(Dataset { storage: Storage::Chunked { dims, btree, index, changed }, .. }) = &mut object.body
            else {
                continue;
            };
            if !*changed {
                continue;
            }
            let records: Vec<ChunkRecord> = index.get_mut().iter().flat_map(|m| m.values().cloned()).collect();
            let chunk_dims: Vec<u64> = dims.iter().map(|&n| n as u64).collect();
            let (root, bytes) = btree::encode_chunks(&records, &chunk_dims, k, self.disk.next_addr(), sizes);
            if !bytes.is_empty() {
                self.disk.append(&bytes)?;
            }
            *btree = root;
            *changed = false;
            object.dirty = true;
        }
        Ok(())
    }
}

impl StorageEngine for Hdf5Engine {
    fn name(&self) -> &str {
        "hdf5"
    }

    fn writable(&self) -> bool {
        self.writable
    }

    fn entry(&self, path: &str) -> StorageResult<Entry> {
        if path.split('/').all(str::is_empty) {
            return Ok(Entry::Group);
        }
        let (parent, name) = self.parent_of(path)?;
        match self.links(parent, path)?.get(&name) {
            Some(Link::Hard(id)) => Ok(match self.objects[*id].kind() {
                ObjectKind::Group => Entry::Group,
                ObjectKind::Dataset => Entry::Dataset,
            }),
            Some(Link::Soft(target)) => Ok(Entry::Soft(target.clone())),
            Some(Link::External { file, path }) => Ok(Entry::External { file: file.clone(), path: path.clone() }),
            Some(Link::Opaque(_)) | None => Err(StorageError::NotFound(path.to_string())),
        }
    }

    fn kind(&self, path: &str) -> StorageResult<ObjectKind> {
        Ok(self.objects[self.resolve(path)?].kind())
    }

    fn members(&self, path: &str) -> StorageResult<Vec<String>> {
        let id = self.resolve(path)?;
        if self.objects[id].kind() == ObjectKind::Dataset {
            return Err(StorageError::Invalid(format!("'{path}' is not a group")));
        }
        Ok(self
            .links(id, path)?
            .iter()
            .filter(|(_, link)| !matches!(link, Link::Opaque(_)))
            .map(|(name, _)| name.clone())
            .collect())
    }

    fn create_group(&mut self, path: &str) -> StorageResult<()> {
        self.add_object(path, Object::empty_group())
    }

    fn create_dataset(&mut self, path: &str, layout: &DatasetLayout) -> StorageResult<()> {
        self.check_writable()?;
        let pipeline = Pipeline::for_layout(layout)?;
        if let Some(max) = &layout.maxshape {
            if !layout.allows(&layout.shape) {
                return Err(StorageError::Invalid(format!("shape {:?} exceeds maximum {max:?}", layout.shape)));
            }
        }
        // Fail on a bad path before any space is allocated.
        let (parent, name) = self.parent_of(path)?;
        if self.links(parent, path)?.contains_key(&name) {
            return Err(StorageError::Exists(path.to_string()));
        }
        let sizes = self.disk.sizes;
        let datatype = Datatype::for_dtype(layout.dtype);
        let element = datatype.size(sizes);
        let fill = match &layout.fillvalue {
            Some(value) if datatype != Datatype::VarStr => {
                let value = Array::filled(layout.dtype, &[], value).map_err(invalid)?;
                Some(datatype.encode_data(value.data(), sizes, &mut |_| Err(invalid("no string fill")))?)
            }
            _ => None,
        };
        let extendable = layout
            .maxshape
            .as_ref()
            .map_or(false, |max| max.iter().zip(&layout.shape).any(|(m, &n)| m.map_or(true, |m| m > n)));
        let mut stored = layout.clone();
        if let Some(level) = pipeline.filters.iter().find(|f| f.id == FILTER_DEFLATE).map(|f| f.level) {
            stored.compression = Some("gzip".into());
            stored.compression_opts = Some(level);
        }
        let storage = if layout.chunks.is_some() || extendable || !pipeline.is_empty() {
            if layout.shape.is_empty() {
                return Err(StorageError::Invalid(format!("scalar dataset '{path}' cannot be chunked")));
            }
            let mut chunks = layout.chunks.clone().unwrap_or_else(|| guess_chunks(&layout.shape, element));
            if chunks.len() != layout.shape.len() || chunks.contains(&0) {
                return Err(StorageError::Invalid(format!(
                    "chunk shape {chunks:?} does not fit a {}-dimensional dataset",
                    layout.shape.len()
                )));
            }
            if let Some(max) = &layout.maxshape {
                for (c, m) in chunks.iter_mut().zip(max) {
                    if let Some(m) = m {
                        *c = (*c).min((*m).max(1));
                    }
                }
            }
            if chunks.iter().product::<usize>().saturating_mul(element) > u32::MAX as usize {
                return Err(StorageError::Invalid(format!("chunks of {chunks:?} exceed 4 GiB")));
            }
            stored.chunks = Some(chunks.clone());
            Storage::Chunked { dims: chunks, btree: UNDEFINED, index: RefCell::new(Some(BTreeMap::new())), changed: true }
        } else {
            stored.chunks = None;
            let total = (layout.shape.iter().product::<usize>() * element) as u64;
            let addr = if total == 0 { UNDEFINED } else { self.disk.append_filled(total, fill.as_deref())? };
            Storage::Contiguous { addr, fresh: true }
        };
        let max = layout
            .maxshape
            .as_ref()
            .map(|max| max.iter().map(|m| m.map_or(UNLIMITED, |m| m as u64)).collect());
        let filters = filter_infos(&pipeline, element, layout.dtype);
        let dataset = Dataset {
            layout: stored,
            datatype_msg: datatype.encode(sizes),
            datatype,
            max,
            storage,
            pipeline,
            filters,
            fill,
            described: Vec::new(),
        };
        self.add_object(path, Object::new(Body::Dataset(dataset)))
    }

    /// Datasets of unsupported types report their shape with a `U8`
    /// element type; reading them fails.
    fn layout(&self, path: &str) -> StorageResult<DatasetLayout> {
        Ok(self.dataset_entry(path)?.layout.clone())
    }

    fn read(&self, path: &str, slab: &Hyperslab) -> StorageResult<Array> {
        let sizes = self.disk.sizes;
        let ds = self.dataset(path)?;
        let offsets = slab_offsets(&ds.layout.shape, slab).map_err(invalid)?;
        let raw = read_elements(&self.disk, ds, &offsets)?;
        let mut heap = HeapReader::new(&self.disk, sizes);
        let data = ds.datatype.decode(&raw, sizes, &mut |r| heap.string(r))?;
        Array::new(ds.datatype.dtype()?, slab.shape(), data).map_err(invalid)
    }

    fn write(&mut self, path: &str, slab: &Hyperslab, value: &Array) -> StorageResult<()> {
        self.check_writable()?;
        let id = self.resolve(path)?;
        let object = &mut self.objects[id];
        let Body::Dataset(ds) = &mut object.body else {
            return Err(StorageError::Invalid(format!("'{path}' is a group")));
        };
        ds.check(path)?;
        let offsets = slab_offsets(&ds.layout.shape, slab).map_err(invalid)?;
        let value = value
            .astype(ds.layout.dtype)
            .and_then(|v| v.broadcast_to(&slab.shape()))
            .map_err(invalid)?;
        let raw = encode_values(&mut self.disk, &ds.datatype, &value)?;
        write_elements(&mut self.disk, ds, &offsets, &raw)?;
        object.dirty = true;
        self.dirty = true;
        Ok(())
    }

    fn resize(&mut self, path: &str, shape: &[usize]) -> StorageResult<()> {
        self.check_writable()?;
        let id = self.resolve(path)?;
        let object = &mut self.objects[id];
        let Body::Dataset(ds) = &mut object.body else {
            return Err(StorageError::Invalid(format!("'{path}' is a group")));
        };
        ds.check(path)?;
        if ds.layout.maxshape.is_none() || !ds.layout.allows(shape) {
            return Err(StorageError::Invalid(format!(
                "cannot resize '{path}' to {shape:?} (maximum {:?})",
                ds.layout.maxshape
            )));
        }
        if shape == ds.layout.shape.as_slice() {
            return Ok(());
        }
        if !matches!(ds.storage, Storage::Chunked { .. }) {
            return Err(StorageError::Invalid(format!("'{path}' is not chunked and cannot change shape")));
        }
        if shape.iter().zip(&ds.layout.shape).any(|(new, old)| new < old) {
            shrink_chunks(&mut self.disk, ds, shape)?;
        }
        debug!(path, from = ?ds.layout.shape, to = ?shape, "resized dataset");
        ds.layout.shape = shape.to_vec();
        object.dirty = true;
        self.dirty = true;
        Ok(())
    }

    fn attrs(&self, path: &str) -> StorageResult<AttrDict> {
        Ok(self.objects[self.resolve(path)?].attrs.clone())
    }

    fn set_attr(&mut self, path: &str, name: &str, value: &Array) -> StorageResult<()> {
        let object = self.attr_object_mut(path)?;
        object.foreign_attrs.retain(|(n, _)| n != name);
        object.attrs.insert(name, value.clone());
        object.dirty = true;
        self.dirty = true;
        Ok(())
    }

    fn delete_attr(&mut self, path: &str, name: &str) -> StorageResult<()> {
        let object = self.attr_object_mut(path)?;
        let before = object.foreign_attrs.len();
        object.foreign_attrs.retain(|(n, _)| n != name);
        if object.attrs.remove(name).is_none() && object.foreign_attrs.len() == before {
            return Err(StorageError::NotFound(format!("{path}@{name}")));
        }
        object.dirty = true;
        self.dirty = true;
        Ok(())
    }

    fn link(&mut self, path: &str, spec: &LinkSpec) -> StorageResult<()> {
        let link = match spec {
            LinkSpec::Hard(target) => Link::Hard(self.resolve(target)?),
            LinkSpec::Soft(target) => Link::Soft(target.clone()),
            LinkSpec::External { file, path } => Link::External { file: file.clone(), path: path.clone() },
        };
        self.add_link(path, link)
    }

    fn delete(&mut self, path: &str) -> StorageResult<()> {
        self.check_writable()?;
        let (parent, name) = self.parent_of(path)?;
        if !self.links(parent, path)?.contains_key(&name) {
            return Err(StorageError::NotFound(path.to_string()));
        }
        self.links_mut(parent, path)?.remove(&name);
        self.dirty = true;
        Ok(())
    }

    fn rename(&mut self, from: &str, to: &str) -> StorageResult<()> {
        self.check_writable()?;
        let (old_parent, old_name) = self.parent_of(from)?;
        let (new_parent, new_name) = self.parent_of(to)?;
        if self.links(new_parent, to)?.contains_key(&new_name) {
            return Err(StorageError::Exists(to.to_string()));
        }
        if !self.links(old_parent, from)?.contains_key(&old_name) {
            return Err(StorageError::NotFound(from.to_string()));
        }
        if let Some(link) = self.links_mut(old_parent, from)?.remove(&old_name) {
            self.links_mut(new_parent, to)?.insert(new_name, link);
        }
        self.dirty = true;
        Ok(())
    }

    /// Append the chunk indexes and object headers that changed, then
    /// point the superblock at the new root.
    fn flush(&mut self) -> StorageResult<()> {
        if !self.writable || !self.dirty {
            return Ok(());
        }
        let sizes = self.disk.sizes;
        let (order, counts, parents) = self.reachable();
        self.write_chunk_indexes(&order)?;

        let mut rewrite: HashSet<usize> = order
            .iter()
            .copied()
            .filter(|id| {
                let object = &self.objects[*id];
                object.dirty || object.addr.is_none() || counts.get(id).copied() != Some(object.refcount)
            })
            .collect();
        let mut pending: Vec<usize> = rewrite.iter().copied().collect();
        while let Some(id) = pending.pop() {
            for &parent in parents.get(&id).into_iter().flatten() {
                if rewrite.insert(parent) {
                    pending.push(parent);
                }
            }
        }
        let rewrite: Vec<usize> = order.iter().copied().filter(|id| rewrite.contains(id)).collect();

        // Headers keep their size whatever addresses they hold.
        let start = self.disk.next_addr();
        let mut addrs = HashMap::new();
        let mut cursor = start;
        for &id in &rewrite {
            addrs.insert(id, cursor);
        }
        let mut placed = Vec::with_capacity(rewrite.len());
        for &id in &rewrite {
            let len = header::encode(&self.object_messages(id, &addrs)?, 0, sizes)?.len() as u64;
            placed.push((id, cursor));
            cursor = align8(cursor + len);
        }
        let addrs: HashMap<usize, u64> = placed.iter().copied().collect();
        let mut image = Vec::new();
        for &(id, addr) in &placed {
            let refcount = counts.get(&id).copied().unwrap_or(1);
            let bytes = header::encode(&self.object_messages(id, &addrs)?, refcount, sizes)?;
            image.resize((addr - start) as usize, 0);
            image.extend(bytes);
        }
        if !image.is_empty() {
            self.disk.append(&image)?;
        }
        self.disk.sync()?;

        self.superblock.root = addrs.get(&0).copied().or(self.objects[0].addr).unwrap_or(UNDEFINED);
        self.superblock.eof = self.disk.eof;
        self.disk.write_absolute(self.superblock.at, &self.superblock.encode())?;
        self.disk.sync()?;

        for &(id, addr) in &placed {
            let object = &mut self.objects[id];
            object.addr = Some(addr);
            object.refcount = counts.get(&id).copied().unwrap_or(1);
        }
        for object in &mut self.objects {
            object.dirty = false;
            if let Body::Dataset(Dataset { storage: Storage::Contiguous { fresh, .. }, .. }) = &mut object.body {
                *fresh = false;
            }
        }
        self.dirty = false;
        debug!(path = %self.path.display(), headers = placed.len(), eof = self.disk.eof, "flushed hdf5 file");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::Scalar;
    use crate::selection::{Index, Selection};

    fn full(shape: &[usize]) -> Hyperslab {
        Hyperslab::full(shape)
    }

    fn extendable(dtype: DType, shape: &[usize]) -> DatasetLayout {
        let mut layout = DatasetLayout::new(dtype, shape);
        layout.maxshape = Some(vec![None; shape.len()]);
        layout
    }

    #[test]
    fn created_file_is_hdf5() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.nxs");
        Hdf5Engine::create(&path).unwrap();
        let bytes = fs::read(&path).unwrap();
        assert_eq!(&bytes[..8], &superblock::SIGNATURE);
        let e = Hdf5Engine::open(&path, false).unwrap();
        assert_eq!(e.name(), "hdf5");
        assert!(e.members("/").unwrap().is_empty());
    }

    #[test]
    fn values_links_and_attributes_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("round.nxs");
        {
            let mut e = Hdf5Engine::create(&path).unwrap();
            e.create_group("/entry").unwrap();
            e.set_attr("/entry", "NX_class", &Array::from("NXentry")).unwrap();
            e.set_attr("/entry", "weights", &Array::from(vec![0.5, 1.5])).unwrap();
            let cases = [
                ("ints", Array::from(vec![-4i32, 5, 6])),
                ("floats", Array::from(vec![0.25f32, -1.0])),
                ("flags", Array::from(vec![true, false, true])),
                ("counts", Array::from(vec![7u16, 65535])),
                ("title", Array::from("Scan of silicon")),
                ("labels", Array::from(vec!["x", "", "détecteur"])),
                ("scalar", Array::from(3.5)),
            ];
            for (name, value) in &cases {
                let path = format!("/entry/{name}");
                e.create_dataset(&path, &DatasetLayout::new(value.dtype(), value.shape())).unwrap();
                e.write(&path, &full(value.shape()), value).unwrap();
            }
            e.set_attr("/entry/ints", "units", &Array::from("counts")).unwrap();
            e.link("/entry/alias", &LinkSpec::Soft("/entry/ints".into())).unwrap();
            e.link("/entry/same", &LinkSpec::Hard("/entry/floats".into())).unwrap();
            e.link("/entry/far", &LinkSpec::External { file: "raw.nxs".into(), path: "/entry/data".into() })
                .unwrap();
            e.flush().unwrap();
        }
        let e = Hdf5Engine::open(&path, false).unwrap();
        assert_eq!(
            e.members("/entry").unwrap(),
            ["alias", "counts", "far", "flags", "floats", "ints", "labels", "same", "scalar", "title"]
        );
        assert_eq!(e.read_all("/entry/ints").unwrap(), Array::from(vec![-4i32, 5, 6]));
        assert_eq!(e.read_all("/entry/floats").unwrap(), Array::from(vec![0.25f32, -1.0]));
        assert_eq!(e.read_all("/entry/flags").unwrap(), Array::from(vec![true, false, true]));
        assert_eq!(e.read_all("/entry/counts").unwrap(), Array::from(vec![7u16, 65535]));
        assert_eq!(e.read_all("/entry/title").unwrap(), Array::from("Scan of silicon"));
        assert_eq!(e.read_all("/entry/labels").unwrap(), Array::from(vec!["x", "", "détecteur"]));
        assert_eq!(e.read_all("/entry/scalar").unwrap(), Array::from(3.5));
        assert_eq!(e.attrs("/entry").unwrap().get_str("NX_class").as_deref(), Some("NXentry"));
        assert_eq!(e.attrs("/entry").unwrap().get("weights"), Some(Array::from(vec![0.5, 1.5])));
        assert_eq!(e.attrs("/entry/alias").unwrap().get_str("units").as_deref(), Some("counts"));
        assert_eq!(e.entry("/entry/alias").unwrap(), Entry::Soft("/entry/ints".into()));
        assert_eq!(
            e.entry("/entry/far").unwrap(),
            Entry::External { file: "raw.nxs".into(), path: "/entry/data".into() }
        );
        assert_eq!(e.kind("/entry/same").unwrap(), ObjectKind::Dataset);
        let shared = e.resolve("/entry/same").unwrap();
        assert_eq!(shared, e.resolve("/entry/floats").unwrap());
        assert_eq!(e.objects[shared].refcount, 2);
    }

    #[test]
    fn slabs_of_chunked_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chunked.nxs");
        let mut layout = DatasetLayout::new(DType::I64, &[6, 5]);
        layout.chunks = Some(vec![4, 2]);
        layout.shuffle = true;
        layout.fletcher32 = true;
        layout.fillvalue = Some(Scalar::Int(-1));
        {
            let mut e = Hdf5Engine::create(&path).unwrap();
            e.create_dataset("/grid", &layout).unwrap();
            let row = Selection::from(1).resolve(&[6, 5]).unwrap();
            e.write("/grid", &row, &Array::from(vec![10i64, 11, 12, 13, 14])).unwrap();
            e.flush().unwrap();
        }
        let mut e = Hdf5Engine::open(&path, true).unwrap();
        let stored = e.layout("/grid").unwrap();
        assert_eq!(stored.chunks, Some(vec![4, 2]));
        assert!(stored.shuffle && stored.fletcher32);
        assert_eq!(stored.fillvalue, Some(Scalar::Int(-1)));
        let column = Selection::from((Index::all(), 3)).resolve(&[6, 5]).unwrap();
        assert_eq!(e.read("/grid", &column).unwrap(), Array::from(vec![-1i64, 13, -1, -1, -1, -1]));
        let strided = Selection::from((1, Index::all().with_step(2))).resolve(&[6, 5]).unwrap();
        assert_eq!(e.read("/grid", &strided).unwrap(), Array::from(vec![10i64, 12, 14]));

        e.write("/grid", &column, &Array::from(0i64)).unwrap();
        e.flush().unwrap();
        let e = Hdf5Engine::open(&path, false).unwrap();
        let row = Selection::from(1).resolve(&[6, 5]).unwrap();
        assert_eq!(e.read("/grid", &row).unwrap(), Array::from(vec![10i64, 11, 12, 0, 14]));
        assert_eq!(e.read_all("/grid").unwrap().sum_all().unwrap(), 27.0);
    }

    #[cfg(feature = "deflate")]
    #[test]
    fn compressed_data_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gzip.nxs");
        let mut layout = DatasetLayout::new(DType::F64, &[1000]);
        layout.compression = Some("zlib".into());
        let values: Vec<f64> = (0..1000).map(|i| (i % 7) as f64).collect();
        {
            let mut e = Hdf5Engine::create(&path).unwrap();
            e.create_dataset("/signal", &layout).unwrap();
            e.write("/signal", &full(&[1000]), &Array::from(values.clone())).unwrap();
            e.flush().unwrap();
        }
        assert!(fs::metadata(&path).unwrap().len() < 8000);
        let e = Hdf5Engine::open(&path, false).unwrap();
        let stored = e.layout("/signal").unwrap();
        assert_eq!(stored.compression.as_deref(), Some("gzip"));
        assert_eq!(stored.compression_opts, Some(DEFAULT_LEVEL));
        assert!(stored.chunks.is_some());
        assert_eq!(e.read_all("/signal").unwrap(), Array::from(values));
    }

    #[test]
    fn resize_grows_and_shrinks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resize.nxs");
        let mut e = Hdf5Engine::create(&path).unwrap();
        let mut layout = extendable(DType::I32, &[3]);
        layout.chunks = Some(vec![2]);
        e.create_dataset("/x", &layout).unwrap();
        e.write("/x", &full(&[3]), &Array::from(vec![1i32, 2, 3])).unwrap();
        e.resize("/x", &[5]).unwrap();
        assert_eq!(e.read_all("/x").unwrap(), Array::from(vec![1i32, 2, 3, 0, 0]));
        e.resize("/x", &[1]).unwrap();
        e.resize("/x", &[4]).unwrap();
        assert_eq!(e.read_all("/x").unwrap(), Array::from(vec![1i32, 0, 0, 0]));
        e.flush().unwrap();
        drop(e);
        let e = Hdf5Engine::open(&path, false).unwrap();
        assert_eq!(e.layout("/x").unwrap().maxshape, Some(vec![None]));
        assert_eq!(e.read_all("/x").unwrap(), Array::from(vec![1i32, 0, 0, 0]));
    }

    #[test]
    fn fixed_datasets_refuse_resize() {
        let dir = tempfile::tempdir().unwrap();
        let mut e = Hdf5Engine::create(dir.path().join("fixed.nxs")).unwrap();
        e.create_dataset("/x", &DatasetLayout::new(DType::F64, &[3])).unwrap();
        assert!(matches!(e.resize("/x", &[5]), Err(StorageError::Invalid(_))));
        assert!(e.layout("/x").unwrap().chunks.is_none());
    }

    #[test]
    fn contiguous_fill_value() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fill.nxs");
        let mut layout = DatasetLayout::new(DType::F64, &[2, 3]);
        layout.fillvalue = Some(Scalar::Float(-1.0));
        let mut e = Hdf5Engine::create(&path).unwrap();
        e.create_dataset("/counts", &layout).unwrap();
        let slab = Selection::from((1, 0..2)).resolve(&[2, 3]).unwrap();
        e.write("/counts", &slab, &Array::from(vec![5.0, 6.0])).unwrap();
        e.flush().unwrap();
        let e = Hdf5Engine::open(&path, false).unwrap();
        let value = e.read_all("/counts").unwrap();
        assert_eq!(value.to_f64_vec().unwrap(), vec![-1.0, -1.0, -1.0, 5.0, 6.0, -1.0]);
    }

    #[test]
    fn strings_are_rewritten() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("text.nxs");
        let mut e = Hdf5Engine::create(&path).unwrap();
        e.create_dataset("/names", &extendable(DType::Str, &[2])).unwrap();
        e.write("/names", &full(&[2]), &Array::from(vec!["alpha", "beta"])).unwrap();
        e.resize("/names", &[3]).unwrap();
        let last = Selection::from(2).resolve(&[3]).unwrap();
        e.write("/names", &last, &Array::from("gamma".repeat(2000))).unwrap();
        e.flush().unwrap();
        let e = Hdf5Engine::open(&path, false).unwrap();
        let names = e.read_all("/names").unwrap();
        let names = names.as_text().unwrap();
        assert_eq!(&names[..2], ["alpha", "beta"]);
        assert_eq!(names[2].len(), 10_000);
    }

    #[test]
    fn unflushed_changes_leave_committed_file_intact() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("commit.nxs");
        let mut e = Hdf5Engine::create(&path).unwrap();
        e.create_dataset("/x", &DatasetLayout::new(DType::I32, &[3])).unwrap();
        e.write("/x", &full(&[3]), &Array::from(vec![1i32, 2, 3])).unwrap();
        e.flush().unwrap();
        let committed = fs::read(&path).unwrap();

        e.write("/x", &full(&[3]), &Array::from(vec![7i32, 8, 9])).unwrap();
        e.create_group("/entry").unwrap();
        e.set_attr("/x", "units", &Array::from("mm")).unwrap();
        let pending = fs::read(&path).unwrap();
        assert_eq!(&pending[..committed.len()], committed.as_slice());
        drop(e);

        let e = Hdf5Engine::open(&path, false).unwrap();
        assert_eq!(e.read_all("/x").unwrap(), Array::from(vec![1i32, 2, 3]));
        assert!(!e.exists("/entry"));
        assert!(e.attrs("/x").unwrap().is_empty());
    }

    #[test]
    fn flush_rewrites_only_the_superblock() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("append.nxs");
        let mut e = Hdf5Engine::create(&path).unwrap();
        let mut layout = extendable(DType::U8, &[4]);
        layout.chunks = Some(vec![2]);
        e.create_dataset("/x", &layout).unwrap();
        e.write("/x", &full(&[4]), &Array::from(vec![1u8, 2, 3, 4])).unwrap();
        e.flush().unwrap();
        let before = fs::read(&path).unwrap();

        e.resize("/x", &[6]).unwrap();
        e.write("/x", &full(&[6]), &Array::from(vec![6u8, 5, 4, 3, 2, 1])).unwrap();
        e.delete("/x").unwrap();
        e.create_group("/x").unwrap();
        e.flush().unwrap();
        let after = fs::read(&path).unwrap();
        let superblock = e.superblock.encode().len();
        assert_eq!(&after[superblock..before.len()], &before[superblock..]);
        assert_eq!(e.kind("/x").unwrap(), ObjectKind::Group);
    }

    #[test]
    fn deletes_and_renames_persist() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tree.nxs");
        {
            let mut e = Hdf5Engine::create(&path).unwrap();
            e.create_group("/entry").unwrap();
            e.create_group("/entry/sample").unwrap();
            e.create_group("/scratch").unwrap();
            e.flush().unwrap();
            e.rename("/entry/sample", "/entry/specimen").unwrap();
            e.delete("/scratch").unwrap();
            assert!(matches!(e.delete("/scratch"), Err(StorageError::NotFound(_))));
            assert!(matches!(e.create_group("/entry"), Err(StorageError::Exists(_))));
            e.flush().unwrap();
        }
        let e = Hdf5Engine::open(&path, false).unwrap();
        assert_eq!(e.members("/").unwrap(), ["entry"]);
        assert_eq!(e.members("/entry").unwrap(), ["specimen"]);
    }

    #[test]
    fn read_only_refuses_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ro.nxs");
        Hdf5Engine::create(&path).unwrap();
        let mut e = Hdf5Engine::open(&path, false).unwrap();
        assert!(matches!(e.create_group("/entry"), Err(StorageError::ReadOnly)));
        assert!(matches!(e.set_attr("/", "a", &Array::from(1i32)), Err(StorageError::ReadOnly)));
    }

    #[test]
    fn foreign_files_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plain.txt");
        fs::write(&path, b"not an hdf5 file").unwrap();
        assert!(matches!(Hdf5Engine::open(&path, false), Err(StorageError::Corrupt(_))));
    }

    #[test]
    fn guessed_chunks_follow_dataset_size() {
        assert_eq!(guess_chunks(&[1000, 1000], 8), vec![63, 63]);
        assert_eq!(guess_chunks(&[0], 1), vec![1024]);
        assert_eq!(guess_chunks(&[10], 4), vec![10]);
    }
}

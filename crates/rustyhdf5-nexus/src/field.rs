//! Typed array leaves.
//!
//! A field's data is in exactly one place at a time:
//!
//! | state | data lives in |
//! |---|---|
//! | `Fill` | nowhere yet; every element is the fill value |
//! | `Value` | memory, optionally with a mask |
//! | `Deferred` | the file the tree is bound to |
//! | `PendingCopy` | another file, copied on save or first write |
//! | `Scratch` | an in-memory engine, for large unattached fields |
//!
//! A file-backed field caches its value in the `Value` state after a whole
//! read; writes update the cache and the file together.

use std::ops::{Add, Deref, Div, Mul, Neg, Sub};

use crate::array::{Array, BinaryOp, DType, Data, Scalar};
use crate::attrs::AttrDict;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::file::{File, Mode};
use crate::group::{Group, Item};
use crate::node::{Kind, Node};
use crate::selection::{convert_index, index_of, Coord, Hyperslab, Index, Selection};
use crate::storage::{copy_object, DatasetLayout, NativeEngine, StorageEngine, StorageError};
use crate::text::human_size;

/// Storage options applied when the field's dataset is created.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldOptions {
    pub chunks: Option<Vec<usize>>,
    pub compression: Option<String>,
    pub compression_opts: Option<u32>,
    pub shuffle: bool,
    pub fletcher32: bool,
    pub fillvalue: Option<Scalar>,
    /// Per-dimension maximum, `None` for unbounded.
    pub maxshape: Option<Vec<Option<usize>>>,
    pub scaleoffset: Option<i32>,
}

impl FieldOptions {
    pub(crate) fn layout(&self, dtype: DType, shape: &[usize]) -> DatasetLayout {
        DatasetLayout {
            shape: shape.to_vec(),
            dtype,
            maxshape: self.maxshape.clone(),
            chunks: self.chunks.clone(),
            compression: self.compression.clone(),
            compression_opts: self.compression_opts,
            shuffle: self.shuffle,
            fletcher32: self.fletcher32,
            fillvalue: self.fillvalue.clone(),
            scaleoffset: self.scaleoffset,
        }
    }

    pub(crate) fn from_layout(layout: &DatasetLayout) -> Self {
        Self {
            chunks: layout.chunks.clone(),
            compression: layout.compression.clone(),
            compression_opts: layout.compression_opts,
            shuffle: layout.shuffle,
            fletcher32: layout.fletcher32,
            fillvalue: layout.fillvalue.clone(),
            maxshape: layout.maxshape.clone(),
            scaleoffset: layout.scaleoffset,
        }
    }
}

pub(crate) enum FieldState {
    Fill,
    Value { value: Array, mask: Option<Vec<bool>> },
    Deferred,
    PendingCopy { file: File, path: String },
    Scratch(NativeEngine),
}

pub(crate) struct FieldData {
    pub(crate) dtype: Option<DType>,
    pub(crate) shape: Vec<usize>,
    pub(crate) options: FieldOptions,
    pub(crate) state: FieldState,
}

impl FieldData {
    pub(crate) fn from_value(value: Array) -> Self {
        Self {
            dtype: Some(value.dtype()),
            shape: value.shape().to_vec(),
            options: FieldOptions::default(),
            state: FieldState::Value { value, mask: None },
        }
    }

    /// Copy of the data description. Values stored in a file are not read:
    /// the copy remembers `location` and fetches on demand.
    pub(crate) fn deep_copy(&self, location: Option<(File, String)>) -> Result<FieldData> {
        let state = match &self.state {
            FieldState::Fill => FieldState::Fill,
            FieldState::Value { value, mask } => FieldState::Value { value: value.clone(), mask: mask.clone() },
            FieldState::PendingCopy { file, path } => FieldState::PendingCopy { file: file.clone(), path: path.clone() },
            FieldState::Deferred => match location {
                Some((file, path)) => FieldState::PendingCopy { file, path },
                None => FieldState::Fill,
            },
            FieldState::Scratch(engine) => {
                let mut copy = NativeEngine::in_memory();
                for name in ["/data", "/mask"] {
                    if engine.exists(name) {
                        copy_object(engine, name, &mut copy, name).map_err(scratch_error)?;
                    }
                }
                FieldState::Scratch(copy)
            }
        };
        Ok(FieldData {
            dtype: self.dtype,
            shape: self.shape.clone(),
            options: self.options.clone(),
            state,
        })
    }
}

fn scratch_error(e: StorageError) -> Error {
    Error::storage("<scratch>", "rw", e)
}

fn mask_array(mask: &[bool], shape: &[usize]) -> Result<Array> {
    Array::new(DType::Bool, shape.to_vec(), Data::Bool(mask.to_vec()))
}

/// Chunk shape used when a large field is chunked automatically.
fn auto_chunks(shape: &[usize]) -> Vec<usize> {
    shape.iter().map(|&n| n.clamp(1, 1024)).collect()
}

fn check_maxshape(maxshape: &[Option<usize>], shape: &[usize]) -> Result<()> {
    let fits = maxshape.len() == shape.len() && maxshape.iter().zip(shape).all(|(m, &n)| m.map_or(true, |m| n <= m));
    if fits {
        Ok(())
    } else {
        Err(Error::ShapeMismatch(format!("shape {shape:?} exceeds maximum {maxshape:?}")))
    }
}

/// Builder for fields with an explicit shape, type or storage options.
#[derive(Debug, Clone, Default)]
pub struct FieldBuilder {
    value: Option<Array>,
    name: Option<String>,
    shape: Option<Vec<usize>>,
    dtype: Option<DType>,
    attrs: AttrDict,
    chunks: Option<Vec<usize>>,
    compression: Option<Option<String>>,
    compression_opts: Option<u32>,
    shuffle: Option<bool>,
    fletcher32: bool,
    fillvalue: Option<Scalar>,
    maxshape: Option<Vec<Option<usize>>>,
    scaleoffset: Option<i32>,
    config: Option<Config>,
}

impl FieldBuilder {
    pub fn value(mut self, value: impl Into<Array>) -> Self {
        self.value = Some(value.into());
        self
    }

    pub fn name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    pub fn shape(mut self, shape: &[usize]) -> Self {
        self.shape = Some(shape.to_vec());
        self
    }

    pub fn dtype(mut self, dtype: DType) -> Self {
        self.dtype = Some(dtype);
        self
    }

    pub fn attr(mut self, name: &str, value: impl Into<Array>) -> Self {
        self.attrs.insert(name, value);
        self
    }

    pub fn attrs(mut self, attrs: &AttrDict) -> Self {
        self.attrs.extend(attrs);
        self
    }

    pub fn chunks(mut self, chunks: &[usize]) -> Self {
        self.chunks = Some(chunks.to_vec());
        self
    }

    /// Compression filter; `None` switches automatic compression off.
    pub fn compression(mut self, compression: Option<&str>) -> Self {
        self.compression = Some(compression.map(str::to_string));
        self
    }

    pub fn compression_opts(mut self, level: u32) -> Self {
        self.compression_opts = Some(level);
        self
    }

    pub fn shuffle(mut self, shuffle: bool) -> Self {
        self.shuffle = Some(shuffle);
        self
    }

    pub fn fletcher32(mut self, fletcher32: bool) -> Self {
        self.fletcher32 = fletcher32;
        self
    }

    pub fn fillvalue(mut self, fill: impl Into<Scalar>) -> Self {
        self.fillvalue = Some(fill.into());
        self
    }

    pub fn maxshape(mut self, maxshape: &[Option<usize>]) -> Self {
        self.maxshape = Some(maxshape.to_vec());
        self
    }

    pub fn scaleoffset(mut self, scaleoffset: i32) -> Self {
        self.scaleoffset = Some(scaleoffset);
        self
    }

    /// Configuration deciding automatic chunking and compression.
    pub fn config(mut self, config: &Config) -> Self {
        self.config = Some(config.clone());
        self
    }

    pub fn build(self) -> Result<Field> {
        let config = self.config.unwrap_or_default();
        let (value, dtype, shape) = match self.value {
            Some(value) => {
                let value = match self.dtype {
                    Some(dtype) => value.astype(dtype)?,
                    None => value,
                };
                let value = match &self.shape {
                    Some(shape) if shape.as_slice() != value.shape() => value.reshape(shape)?,
                    _ => value,
                };
                let (dtype, shape) = (value.dtype(), value.shape().to_vec());
                (Some(value), Some(dtype), shape)
            }
            None => (None, self.dtype, self.shape.unwrap_or_default()),
        };
        if let Some(maxshape) = &self.maxshape {
            check_maxshape(maxshape, &shape)?;
        }
        if let Some(chunks) = &self.chunks {
            if chunks.len() != shape.len() {
                return Err(Error::ShapeMismatch(
                    "number of chunks does not match the number of dimensions".into(),
                ));
            }
        }
        let large = shape.iter().product::<usize>() > config.max_size;
        let options = FieldOptions {
            chunks: self.chunks.or_else(|| large.then(|| auto_chunks(&shape))),
            compression: match self.compression {
                Some(compression) => compression,
                None if large => config.compression.clone(),
                None => None,
            },
            compression_opts: self.compression_opts,
            shuffle: self.shuffle.unwrap_or(large),
            fletcher32: self.fletcher32,
            fillvalue: self.fillvalue,
            maxshape: self.maxshape,
            scaleoffset: self.scaleoffset,
        };
        let state = match value {
            Some(value) => FieldState::Value { value, mask: None },
            None => FieldState::Fill,
        };
        let data = FieldData { dtype, shape, options, state };
        let name = self.name.unwrap_or_else(|| "unknown".into());
        Ok(Field::from_data(name, self.attrs, data))
    }
}

/// Handle onto a field node.
#[derive(Debug, Clone)]
pub struct Field(pub(crate) Node);

impl Deref for Field {
    type Target = Node;

    fn deref(&self) -> &Node {
        &self.0
    }
}

impl From<Field> for Node {
    fn from(field: Field) -> Node {
        field.0
    }
}

impl Field {
    /// In-memory field holding `value`.
    pub fn new(value: impl Into<Array>) -> Field {
        Self::from_data("unknown", AttrDict::new(), FieldData::from_value(value.into()))
    }

    pub fn builder() -> FieldBuilder {
        FieldBuilder::default()
    }

    pub(crate) fn from_data(name: impl Into<String>, attrs: AttrDict, data: FieldData) -> Field {
        Field(Node::from_parts(name, "NXfield", attrs, Kind::Field(data)))
    }

    pub(crate) fn from_array(name: &str, value: Array, attrs: AttrDict) -> Field {
        Self::from_data(name, attrs, FieldData::from_value(value))
    }

    fn with_data<T>(&self, f: impl FnOnce(&FieldData) -> T) -> T {
        match &self.0.inner().kind {
            Kind::Field(data) => f(data),
            _ => f(&FieldData::from_value(Array::zeros(DType::F64, &[0]))),
        }
    }

    fn with_data_mut<T>(&self, f: impl FnOnce(&mut FieldData) -> T) -> Option<T> {
        match &mut self.0.inner_mut().kind {
            Kind::Field(data) => Some(f(data)),
            _ => None,
        }
    }

    pub fn dtype(&self) -> Option<DType> {
        self.with_data(|d| d.dtype)
    }

    pub fn shape(&self) -> Vec<usize> {
        self.with_data(|d| d.shape.clone())
    }

    pub fn ndim(&self) -> usize {
        self.with_data(|d| d.shape.len())
    }

    pub fn size(&self) -> usize {
        self.with_data(|d| d.shape.iter().product())
    }

    /// Length of the first dimension; 1 for scalars.
    pub fn len(&self) -> usize {
        self.with_data(|d| d.shape.first().copied().unwrap_or(1))
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn nbytes(&self) -> usize {
        self.size() * self.dtype().map_or(0, DType::itemsize)
    }

    pub fn human_size(&self) -> String {
        human_size(self.nbytes())
    }

    pub fn options(&self) -> FieldOptions {
        self.with_data(|d| d.options.clone())
    }

    /// True if the whole value is held in memory.
    pub fn is_resident(&self) -> bool {
        self.with_data(|d| matches!(d.state, FieldState::Value { .. }))
    }

    fn is_scratch(&self) -> bool {
        self.with_data(|d| matches!(d.state, FieldState::Scratch(_)))
    }

    /// File and path when the field belongs to a tree bound to a file.
    fn bound(&self) -> Option<(File, String)> {
        self.0.file_mode()?;
        self.0.locate()
    }

    /// File and path when writes go through to the file.
    fn bound_rw(&self) -> Option<(File, String)> {
        if self.0.file_mode() == Some(Mode::ReadWrite) {
            self.0.locate()
        } else {
            None
        }
    }

    fn is_stored(&self) -> bool {
        self.is_scratch() || self.bound().is_some()
    }

    fn check_writable(&self) -> Result<()> {
        if self.0.file_mode() == Some(Mode::Read) {
            return Err(Error::ReadOnlyViolation(format!(
                "NeXus file opened as readonly ({})",
                self.0.path()
            )));
        }
        if self.0.is_linked() {
            return Err(Error::LinkedItemImmutable(self.0.path()));
        }
        Ok(())
    }

    fn require_dtype(&self) -> Result<DType> {
        self.dtype()
            .ok_or_else(|| Error::InvalidOperation(format!("'{}' has no dtype; set it before use", self.0.name())))
    }

    /// Value of unwritten elements.
    fn fill_scalar(&self, dtype: DType) -> Scalar {
        match self.options().fillvalue {
            Some(fill) => fill,
            None if dtype.is_text() => Scalar::Text(String::new()),
            None => Scalar::Int(0),
        }
    }

    fn check_memory(&self) -> Result<()> {
        let config = self.0.config();
        if self.nbytes() > config.memory_bytes() {
            return Err(Error::DataTooLarge {
                path: self.0.path(),
                limit_mb: config.memory,
            });
        }
        Ok(())
    }

    /// Whole value. A value read from a file is cached in memory.
    pub fn value(&self) -> Result<Array> {
        let dtype = self.require_dtype()?;
        self.check_memory()?;
        let shape = self.shape();
        enum Source {
            Ready(Array),
            File(File, String),
        }
        let source = {
            let location = self.0.locate();
            let inner = self.0.inner();
            let Kind::Field(data) = &inner.kind else {
                return Err(Error::InvalidOperation("not a field".into()));
            };
            match &data.state {
                FieldState::Value { value, .. } => Source::Ready(value.clone()),
                FieldState::Fill => Source::Ready(Array::filled(dtype, &shape, &self.fill_scalar(dtype))?),
                FieldState::Scratch(engine) => Source::Ready(engine.read_all("/data").map_err(scratch_error)?),
                FieldState::PendingCopy { file, path } => Source::File(file.clone(), path.clone()),
                FieldState::Deferred => match location {
                    Some((file, path)) => Source::File(file, path),
                    None => return Err(Error::InvalidOperation(format!("no data available for '{}'", self.0.name()))),
                },
            }
        };
        match source {
            Source::Ready(value) => Ok(value),
            Source::File(file, path) => {
                let value = file.read_value(&path, &Hyperslab::full(&shape))?;
                self.with_data_mut(|d| d.state = FieldState::Value { value: value.clone(), mask: None });
                Ok(value)
            }
        }
    }

    /// The value as a single scalar.
    pub fn item(&self) -> Result<Scalar> {
        self.value()?
            .item()
            .ok_or_else(|| Error::ShapeMismatch(format!("'{}' is not a scalar", self.0.name())))
    }

    /// Text of a string field, elements joined by newlines.
    pub fn text(&self) -> Result<String> {
        let value = self.value()?;
        match value.as_text() {
            Some(items) => Ok(items.join("\n")),
            None => Ok(value.to_string()),
        }
    }

    pub fn to_f64_vec(&self) -> Result<Vec<f64>> {
        self.value()?.to_f64_vec()
    }

    /// Convert axis-value indices against the field's own values.
    fn resolve(&self, selection: Selection) -> Result<Hyperslab> {
        let selection = if selection.is_real() {
            if self.ndim() != 1 || selection.len() != 1 {
                return Err(Error::InvalidOperation(
                    "field must be one-dimensional for floating point slices".into(),
                ));
            }
            let axis = self.value()?;
            Selection::new(vec![convert_index(&selection.indices()[0], &axis)?])
        } else {
            selection
        };
        selection.resolve(&self.shape())
    }

    pub(crate) fn read_slab(&self, slab: &Hyperslab) -> Result<(Array, Option<Vec<bool>>)> {
        let dtype = self.require_dtype()?;
        let shape = self.shape();
        let location = self.0.locate();
        let source = {
            let inner = self.0.inner();
            let Kind::Field(data) = &inner.kind else {
                return Err(Error::InvalidOperation("not a field".into()));
            };
            match &data.state {
                FieldState::Value { value, mask } => {
                    let mask = match mask {
                        Some(m) => Some(mask_array(m, value.shape())?.slab(slab)?.to_bool_vec()?),
                        None => None,
                    };
                    return Ok((value.slab(slab)?, mask));
                }
                FieldState::Fill => {
                    return Ok((Array::filled(dtype, &slab.shape(), &self.fill_scalar(dtype))?, None));
                }
                FieldState::Scratch(engine) => {
                    let value = engine.read("/data", slab).map_err(scratch_error)?;
                    let mask = if engine.exists("/mask") {
                        Some(engine.read("/mask", slab).map_err(scratch_error)?.to_bool_vec()?)
                    } else {
                        None
                    };
                    return Ok((value, mask));
                }
                FieldState::PendingCopy { file, path } => (file.clone(), path.clone()),
                FieldState::Deferred => location
                    .ok_or_else(|| Error::InvalidOperation(format!("no data available for '{}'", self.0.name())))?,
            }
        };
        let (file, path) = source;
        if slab.dims().len() != shape.len() {
            return Err(Error::ShapeMismatch(format!("selection does not match shape {shape:?}")));
        }
        Ok((file.read_value(&path, slab)?, None))
    }

    /// Slab of the field as a new in-memory field carrying the safe
    /// attributes. Axis values select by coordinate on one-dimensional
    /// fields.
    pub fn get(&self, selection: impl Into<Selection>) -> Result<Field> {
        let slab = self.resolve(selection.into())?;
        let (value, mut mask) = self.read_slab(&slab)?;
        if let Some(sibling) = self.mask_sibling() {
            let (m, _) = sibling.read_slab(&slab)?;
            mask = Some(m.to_bool_vec()?);
        }
        let mask = mask.filter(|m| m.iter().any(|&b| b));
        let data = FieldData {
            dtype: Some(value.dtype()),
            shape: value.shape().to_vec(),
            options: FieldOptions::default(),
            state: FieldState::Value { value, mask },
        };
        Ok(Field::from_data(self.0.name(), self.0.attrs().safe(), data))
    }

    /// Assign `value` to a slab, broadcasting it.
    pub fn set(&self, selection: impl Into<Selection>, value: impl Into<Array>) -> Result<()> {
        let value = value.into();
        self.check_writable()?;
        let dtype = self.require_dtype()?;
        if value.dtype().is_bool() && !dtype.is_bool() {
            return Err(Error::DTypeMismatch("cannot set a Boolean value to a non-Boolean data type".into()));
        }
        let slab = self.resolve(selection.into())?;
        let value = value.astype(dtype)?;
        self.write_slab(&slab, &value)?;
        self.0.set_changed();
        Ok(())
    }

    /// Read a pending copy into memory so it can be modified.
    fn materialize(&self) -> Result<()> {
        let pending = self.with_data(|d| matches!(d.state, FieldState::PendingCopy { .. }));
        if pending {
            self.value()?;
        }
        Ok(())
    }

    /// Turn a fill-only field into a buffer, or a scratch engine when it is
    /// larger than `max_size`.
    fn allocate(&self) -> Result<()> {
        let dtype = self.require_dtype()?;
        let shape = self.shape();
        let max_size = self.0.config().max_size;
        let fill = match self.options().fillvalue {
            Some(fill) => fill,
            None if dtype.is_text() => Scalar::Text(" ".into()),
            None => Scalar::Int(0),
        };
        let state = if self.size() > max_size {
            let mut engine = NativeEngine::in_memory();
            let layout = self.options().layout(dtype, &shape);
            engine.create_dataset("/data", &layout).map_err(scratch_error)?;
            FieldState::Scratch(engine)
        } else {
            FieldState::Value { value: Array::filled(dtype, &shape, &fill)?, mask: None }
        };
        self.with_data_mut(|d| d.state = state);
        Ok(())
    }

    pub(crate) fn write_slab(&self, slab: &Hyperslab, value: &Array) -> Result<()> {
        self.materialize()?;
        let bound = self.bound_rw();
        if bound.is_none() && self.with_data(|d| matches!(d.state, FieldState::Fill)) {
            self.allocate()?;
        }
        let written = self.with_data_mut(|d| -> Result<()> {
            match &mut d.state {
                FieldState::Value { value: current, .. } => current.assign(slab, value),
                FieldState::Scratch(engine) if bound.is_none() => {
                    engine.write("/data", slab, value).map_err(scratch_error)
                }
                _ => Ok(()),
            }
        });
        if let Some(result) = written {
            result?;
        }
        if let Some((file, path)) = bound {
            file.write_value(&path, slab, value)?;
            self.with_data_mut(|d| {
                if matches!(d.state, FieldState::Fill) {
                    d.state = FieldState::Deferred;
                }
            });
        }
        Ok(())
    }

    // Masks

    fn mask_sibling(&self) -> Option<Field> {
        let name = self.0.inner().attrs.get_str("mask")?;
        let parent = self.0.parent_group()?;
        parent.get(&name).ok()?.as_field()
    }

    /// Sibling mask field, created on first use when attached to a group.
    fn create_mask(&self) -> Result<Option<Field>> {
        if let Some(mask) = self.mask_sibling() {
            return Ok(Some(mask));
        }
        let Some(parent) = self.0.parent_group() else {
            return Ok(None);
        };
        let name = format!("{}_mask", self.0.name());
        let mask = Field::builder().shape(&self.shape()).dtype(DType::Bool).fillvalue(false).build()?;
        parent.set(&name, mask)?;
        self.0.set_attr("mask", name.as_str())?;
        Ok(parent.get(&name)?.as_field())
    }

    /// Move a mask held in memory into a sibling field once attached.
    pub(crate) fn promote_mask(&self) -> Result<()> {
        if self.0.parent().is_none() {
            return Ok(());
        }
        let taken = self.with_data_mut(|d| -> Result<Option<Array>> {
            let shape = d.shape.clone();
            match &mut d.state {
                FieldState::Value { mask, .. } => match mask.take() {
                    Some(bits) => Ok(Some(mask_array(&bits, &shape)?)),
                    None => Ok(None),
                },
                FieldState::Scratch(engine) if engine.exists("/mask") => {
                    let bits = engine.read_all("/mask").map_err(scratch_error)?;
                    engine.delete("/mask").map_err(scratch_error)?;
                    Ok(Some(bits))
                }
                _ => Ok(None),
            }
        });
        if let Some(bits) = taken.unwrap_or(Ok(None))? {
            if let Some(mask) = self.create_mask()? {
                mask.write_slab(&Hyperslab::full(&self.shape()), &bits)?;
            }
        }
        Ok(())
    }

    /// Mask the selected elements. Attached fields record the mask in a
    /// sibling `<name>_mask` field; detached ones keep it in memory.
    pub fn set_masked(&self, selection: impl Into<Selection>) -> Result<()> {
        self.check_writable()?;
        self.require_dtype()?;
        let slab = self.resolve(selection.into())?;
        self.mask_slab(&slab)?;
        self.0.set_changed();
        Ok(())
    }

    pub(crate) fn mask_slab(&self, slab: &Hyperslab) -> Result<()> {
        if let Some(mask) = self.create_mask()? {
            return mask.write_slab(slab, &Array::scalar(true));
        }
        self.materialize()?;
        if self.with_data(|d| matches!(d.state, FieldState::Fill | FieldState::Deferred)) {
            self.allocate()?;
        }
        let shape = self.shape();
        let masked = self.with_data_mut(|d| -> Result<()> {
            match &mut d.state {
                FieldState::Value { mask, .. } => {
                    let mut bits = mask_array(&mask.take().unwrap_or_else(|| vec![false; shape.iter().product()]), &shape)?;
                    bits.assign(slab, &Array::scalar(true))?;
                    *mask = Some(bits.to_bool_vec()?);
                    Ok(())
                }
                FieldState::Scratch(engine) => {
                    if !engine.exists("/mask") {
                        let layout = DatasetLayout::new(DType::Bool, &shape);
                        engine.create_dataset("/mask", &layout).map_err(scratch_error)?;
                    }
                    engine.write("/mask", slab, &Array::scalar(true)).map_err(scratch_error)
                }
                _ => Ok(()),
            }
        });
        masked.unwrap_or(Ok(()))
    }

    /// Current mask, from the sibling mask field or memory.
    pub fn mask(&self) -> Result<Option<Array>> {
        if let Some(sibling) = self.mask_sibling() {
            return Ok(Some(sibling.value()?.astype(DType::Bool)?));
        }
        let inner = self.0.inner();
        match &inner.kind {
            Kind::Field(FieldData { state: FieldState::Value { value, mask: Some(mask) }, .. }) => {
                Ok(Some(mask_array(mask, value.shape())?))
            }
            Kind::Field(FieldData { state: FieldState::Scratch(engine), .. }) if engine.exists("/mask") => {
                Ok(Some(engine.read_all("/mask").map_err(scratch_error)?))
            }
            _ => Ok(None),
        }
    }

    /// Replace the whole mask; `None` clears it.
    pub fn set_mask(&self, mask: Option<Array>) -> Result<()> {
        self.check_writable()?;
        let shape = self.shape();
        let sibling = match &mask {
            Some(_) => self.create_mask()?,
            None => self.mask_sibling(),
        };
        if let Some(sibling) = sibling {
            let bits = mask.unwrap_or_else(|| Array::scalar(false));
            return sibling.set(Selection::all(), bits.astype(DType::Bool)?);
        }
        if self.0.inner().attrs.contains("mask") {
            self.0.inner_mut().attrs.remove("mask");
        }
        let bits = match mask {
            Some(mask) => Some(mask.astype(DType::Bool)?.broadcast_to(&shape)?),
            None => None,
        };
        if bits.is_some() {
            self.materialize()?;
            if self.with_data(|d| matches!(d.state, FieldState::Fill | FieldState::Deferred)) {
                self.allocate()?;
            }
        }
        let result = self.with_data_mut(|d| -> Result<()> {
            match &mut d.state {
                FieldState::Value { mask, .. } => {
                    *mask = match &bits {
                        Some(bits) => Some(bits.to_bool_vec()?),
                        None => None,
                    };
                    Ok(())
                }
                FieldState::Scratch(engine) => match &bits {
                    Some(bits) => {
                        if !engine.exists("/mask") {
                            let layout = DatasetLayout::new(DType::Bool, &shape);
                            engine.create_dataset("/mask", &layout).map_err(scratch_error)?;
                        }
                        engine.write("/mask", &Hyperslab::full(&shape), bits).map_err(scratch_error)
                    }
                    None if engine.exists("/mask") => engine.delete("/mask").map_err(scratch_error),
                    None => Ok(()),
                },
                _ => Ok(()),
            }
        });
        result.unwrap_or(Ok(()))?;
        self.0.set_changed();
        Ok(())
    }

    // Shape and type

    /// Change the shape. Stored fields may only grow, only when they were
    /// given a maximum shape, and never beyond it.
    pub fn resize(&self, shape: &[usize]) -> Result<()> {
        let old = self.shape();
        let maxshape = self.options().maxshape;
        if let Some(maxshape) = &maxshape {
            check_maxshape(maxshape, shape)?;
        }
        let bound = self.bound();
        let stored = bound.is_some() || self.is_scratch();
        if stored && (old.len() != shape.len() || old.iter().zip(shape).any(|(o, n)| n < o)) {
            return Err(Error::ShapeMismatch(format!("cannot resize {old:?} to {shape:?} once stored")));
        }
        if stored && maxshape.is_none() && old != shape {
            return Err(Error::ShapeMismatch(format!(
                "cannot resize {old:?} to {shape:?}: stored without a maximum shape"
            )));
        }
        if let Some((file, path)) = bound {
            self.check_writable()?;
            file.resize(&path, shape)?;
            self.with_data_mut(|d| d.state = FieldState::Deferred);
        }
        let resized = self.with_data_mut(|d| -> Result<()> {
            match &mut d.state {
                FieldState::Scratch(engine) => {
                    engine.resize("/data", shape).map_err(scratch_error)?;
                    if engine.exists("/mask") {
                        engine.resize("/mask", shape).map_err(scratch_error)?;
                    }
                }
                FieldState::Value { value, mask } => {
                    *value = value.resize(shape);
                    if let Some(m) = mask {
                        m.resize(shape.iter().product(), false);
                    }
                }
                _ => {}
            }
            d.shape = shape.to_vec();
            Ok(())
        });
        resized.unwrap_or(Ok(()))?;
        self.0.set_changed();
        Ok(())
    }

    /// Resize along one axis.
    pub fn resize_axis(&self, axis: usize, len: usize) -> Result<()> {
        let mut shape = self.shape();
        if axis >= shape.len() {
            return Err(Error::InvalidOperation(format!(
                "invalid axis {axis} (0 to {} allowed)",
                shape.len().saturating_sub(1)
            )));
        }
        shape[axis] = len;
        self.resize(&shape)
    }

    pub fn set_dtype(&self, dtype: DType) -> Result<()> {
        if self.is_stored() {
            return Err(Error::InvalidOperation(
                "cannot change the dtype of a field already stored in a file".into(),
            ));
        }
        let converted = self.with_data_mut(|d| -> Result<()> {
            if let FieldState::Value { value, .. } = &mut d.state {
                *value = value.astype(dtype)?;
            }
            d.dtype = Some(dtype);
            Ok(())
        });
        converted.unwrap_or(Ok(()))
    }

    fn set_option(&self, name: &str, f: impl FnOnce(&mut FieldOptions)) -> Result<()> {
        if self.is_stored() {
            return Err(Error::InvalidOperation(format!(
                "cannot change the {name} of a field already stored in a file"
            )));
        }
        self.with_data_mut(|d| f(&mut d.options));
        Ok(())
    }

    pub fn set_chunks(&self, chunks: Option<Vec<usize>>) -> Result<()> {
        if chunks.as_ref().is_some_and(|c| c.len() != self.ndim()) {
            return Err(Error::ShapeMismatch(
                "number of chunks does not match the number of dimensions".into(),
            ));
        }
        self.set_option("chunks", |o| o.chunks = chunks)
    }

    pub fn set_compression(&self, compression: Option<&str>) -> Result<()> {
        self.set_option("compression", |o| o.compression = compression.map(str::to_string))
    }

    pub fn set_compression_opts(&self, level: Option<u32>) -> Result<()> {
        self.set_option("compression_opts", |o| o.compression_opts = level)
    }

    pub fn set_shuffle(&self, shuffle: bool) -> Result<()> {
        self.set_option("shuffle", |o| o.shuffle = shuffle)
    }

    pub fn set_fletcher32(&self, fletcher32: bool) -> Result<()> {
        self.set_option("fletcher32", |o| o.fletcher32 = fletcher32)
    }

    pub fn set_fillvalue(&self, fill: Option<Scalar>) -> Result<()> {
        self.set_option("fillvalue", |o| o.fillvalue = fill)
    }

    pub fn set_scaleoffset(&self, scaleoffset: Option<i32>) -> Result<()> {
        self.set_option("scaleoffset", |o| o.scaleoffset = scaleoffset)
    }

    pub fn set_maxshape(&self, maxshape: Option<Vec<Option<usize>>>) -> Result<()> {
        if let Some(max) = &maxshape {
            check_maxshape(max, &self.shape())?;
        }
        self.set_option("maxshape", |o| o.maxshape = maxshape)
    }

    pub fn is_numeric(&self) -> bool {
        self.dtype().is_some_and(|d| !d.is_text())
    }

    pub fn is_string(&self) -> bool {
        self.dtype().is_some_and(DType::is_text)
    }

    /// Three-dimensional with RGB or RGBA planes.
    pub fn is_image(&self) -> bool {
        let shape = self.shape();
        shape.len() == 3 && (shape[2] == 3 || shape[2] == 4)
    }

    /// True for a one-dimensional field whose values decrease.
    pub fn reversed(&self) -> Result<bool> {
        if self.ndim() != 1 || self.size() < 2 {
            return Ok(false);
        }
        let values = self.to_f64_vec()?;
        Ok(values[values.len() - 1] < values[0])
    }

    /// Shape with length-one dimensions removed from multi-dimensional
    /// fields.
    pub fn plot_shape(&self) -> Vec<usize> {
        let shape = self.shape();
        if shape.len() > 1 {
            shape.into_iter().filter(|&n| n != 1).collect()
        } else {
            shape
        }
    }

    pub fn plot_rank(&self) -> usize {
        self.plot_shape().len()
    }

    pub fn is_plottable(&self) -> bool {
        self.plot_rank() > 0
    }

    // Axes

    /// Axes for plotting, from the `axes` attribute of the field or its
    /// group. Missing or mismatched axes become `Axis{i}` index ranges.
    pub fn axes(&self) -> Result<Vec<Field>> {
        let plot_shape = self.plot_shape();
        let rank = plot_shape.len();
        let placeholder = |i: usize| {
            let field = Field::new(Array::arange(plot_shape[i]));
            field.inner_mut().name = format!("Axis{i}");
            field
        };
        let Some(group) = self.0.parent_group() else {
            return Ok((0..rank).map(placeholder).collect());
        };
        let mut names = self
            .0
            .attrs()
            .get_names("axes")
            .or_else(|| group.attrs().get_names("axes"))
            .unwrap_or_else(|| vec![".".to_string(); rank]);
        names.truncate(rank);
        let mut axes = Vec::with_capacity(names.len());
        for (i, name) in names.iter().enumerate() {
            let axis = group.get(name.trim()).ok().and_then(|n| n.to_field().ok());
            match axis {
                Some(axis) if axis.size() == plot_shape[i] || axis.size() == plot_shape[i] + 1 => {
                    axes.push(Field::from_array(&axis.name(), axis.value()?, axis.attrs()));
                }
                _ => axes.push(placeholder(i)),
            }
        }
        Ok(axes)
    }

    /// True if `axes` are one-dimensional and match the plot shape as
    /// points or bin boundaries.
    pub fn valid_axes(&self, axes: &[Field]) -> bool {
        let axes: Vec<&Field> = axes.iter().filter(|a| a.size() >= 1).collect();
        let matching = self
            .plot_shape()
            .iter()
            .zip(&axes)
            .filter(|(&n, a)| n == a.size() || n + 1 == a.size())
            .count();
        axes.iter().all(|a| a.ndim() == 1) && matching == self.plot_rank()
    }

    /// Position of `value` along this one-dimensional field.
    pub fn index(&self, value: f64, max: bool) -> Result<usize> {
        if self.ndim() != 1 {
            return Err(Error::InvalidOperation(
                "field must be one-dimensional to use the index function".into(),
            ));
        }
        Ok(index_of(&self.to_f64_vec()?, value, max))
    }

    // Reductions

    /// Smallest finite value.
    pub fn min(&self) -> Result<Option<f64>> {
        Ok(self.value()?.min_f64())
    }

    /// Largest finite value.
    pub fn max(&self) -> Result<Option<f64>> {
        Ok(self.value()?.max_f64())
    }

    fn all_axes(&self) -> Vec<usize> {
        (0..self.ndim()).collect()
    }

    pub fn sum(&self, axes: Option<&[usize]>) -> Result<Field> {
        let axes = axes.map(<[usize]>::to_vec).unwrap_or_else(|| self.all_axes());
        let value = self.value()?.sum_axes(&axes)?;
        Ok(Field::from_array(&self.0.name(), value, self.0.attrs().safe()))
    }

    pub fn average(&self, axes: Option<&[usize]>) -> Result<Field> {
        let axes = axes.map(<[usize]>::to_vec).unwrap_or_else(|| self.all_axes());
        let value = self.value()?.mean_axes(&axes)?;
        Ok(Field::from_array(&self.0.name(), value, self.0.attrs().safe()))
    }

    /// Moment of the normalised one-dimensional distribution about
    /// `center`, or about its mean.
    pub fn moment(&self, order: i32, center: Option<f64>) -> Result<f64> {
        if self.is_string() {
            return Err(Error::DTypeMismatch("cannot calculate moments for a string".into()));
        }
        if self.ndim() > 1 {
            return Err(Error::InvalidOperation("operation only possible on one-dimensional fields".into()));
        }
        let values = self.to_f64_vec()?;
        let total: f64 = values.iter().sum();
        let y: Vec<f64> = values.iter().map(|v| v / total).collect();
        let c = center.unwrap_or_else(|| y.iter().enumerate().map(|(x, y)| y * x as f64).sum());
        if order == 1 {
            return Ok(c);
        }
        Ok(y.iter().enumerate().map(|(x, y)| y * (x as f64 - c).powi(order)).sum())
    }

    pub fn mean(&self) -> Result<f64> {
        self.moment(1, None)
    }

    pub fn var(&self) -> Result<f64> {
        Ok(self.moment(2, None)?.abs())
    }

    pub fn std(&self) -> Result<f64> {
        Ok(self.var()?.sqrt())
    }

    // Reshaping

    pub fn reshape(&self, shape: &[usize]) -> Result<Field> {
        let value = self.value()?.reshape(shape)?;
        Ok(Field::from_array(&self.0.name(), value, self.0.attrs().safe()))
    }

    pub fn transpose(&self, axes: Option<&[usize]>) -> Result<Field> {
        let value = self.value()?.transpose(axes)?;
        Ok(Field::from_array(&self.0.name(), value, self.0.attrs().safe()))
    }

    /// Midpoints between neighbouring values.
    pub fn centers(&self) -> Result<Field> {
        let values = self.one_dimensional("centers")?;
        let mids: Vec<f64> = values.windows(2).map(|w| (w[0] + w[1]) / 2.0).collect();
        Ok(Field::from_array(&self.0.name(), Array::from(mids), self.0.attrs().safe()))
    }

    /// Bin boundaries around each value, extrapolating the end bins.
    pub fn boundaries(&self) -> Result<Field> {
        let values = self.one_dimensional("boundaries")?;
        if values.len() < 2 {
            return Err(Error::ShapeMismatch("boundaries need at least two values".into()));
        }
        let n = values.len();
        let mut bounds = Vec::with_capacity(n + 1);
        bounds.push(values[0] - (values[1] - values[0]) / 2.0);
        bounds.extend(values.windows(2).map(|w| (w[0] + w[1]) / 2.0));
        bounds.push(values[n - 1] + (values[n - 1] - values[n - 2]) / 2.0);
        Ok(Field::from_array(&self.0.name(), Array::from(bounds), self.0.attrs().safe()))
    }

    fn one_dimensional(&self, what: &str) -> Result<Vec<f64>> {
        if self.ndim() != 1 {
            return Err(Error::InvalidOperation(format!("{what} need a one-dimensional field")));
        }
        self.to_f64_vec()
    }

    /// Add `data` into the slab starting at `offset`.
    pub fn add_at(&self, data: &Array, offset: &[usize]) -> Result<()> {
        if offset.len() != data.ndim() {
            return Err(Error::ShapeMismatch(format!(
                "offset {offset:?} does not match data of shape {:?}",
                data.shape()
            )));
        }
        let dtype = self.require_dtype()?;
        let selection = Selection::new(
            offset
                .iter()
                .zip(data.shape())
                .map(|(&o, &n)| Index::range(Some(Coord::Int(o as i64)), Some(Coord::Int((o + n) as i64))))
                .collect(),
        );
        let slab = self.resolve(selection)?;
        let (current, _) = self.read_slab(&slab)?;
        let sum = current.binary(&data.astype(dtype)?, BinaryOp::Add)?.astype(dtype)?;
        self.check_writable()?;
        self.write_slab(&slab, &sum)?;
        self.0.set_changed();
        Ok(())
    }

    /// Replace this field in its group. A plain value of the same shape and
    /// type is written in place; anything else replaces the node.
    pub fn replace(&self, item: impl Into<Item>) -> Result<()> {
        let group: Group = self
            .0
            .parent_group()
            .ok_or_else(|| Error::InvalidOperation("the field must be a member of a group".into()))?;
        let name = self.0.name();
        match item.into() {
            Item::Node(node) => {
                group.delete(&name)?;
                group.set(&name, node)
            }
            Item::Value(value) | Item::Masked { value, .. } => {
                if value.shape() == self.shape().as_slice() && Some(value.dtype()) == self.dtype() {
                    self.set(Selection::all(), value)
                } else {
                    let attrs = self.0.attrs();
                    group.delete(&name)?;
                    let field = Field::new(value);
                    field.inner_mut().attrs = attrs;
                    group.set(&name, field)
                }
            }
        }
    }

    // Arithmetic

    fn binary(&self, other: &Array, op: BinaryOp, reflected: bool) -> Result<Field> {
        let value = self.value()?;
        let result = if reflected { other.binary(&value, op)? } else { value.binary(other, op)? };
        Ok(Field::from_array(&self.0.name(), result, self.0.attrs().safe()))
    }

    pub fn pow(&self, power: f64) -> Result<Field> {
        self.binary(&Array::scalar(power), BinaryOp::Pow, false)
    }

    pub fn abs(&self) -> Result<Field> {
        Ok(Field::from_array(&self.0.name(), self.value()?.abs()?, self.0.attrs().safe()))
    }

    pub fn sqrt(&self) -> Result<Field> {
        Ok(Field::from_array(&self.0.name(), self.value()?.sqrt()?, self.0.attrs().safe()))
    }

    /// Equal shapes and element values.
    pub fn values_equal(&self, other: &Field) -> Result<bool> {
        Ok(self.value()?.values_equal(&other.value()?))
    }

    /// Text shown after `name = ` in tree listings.
    pub(crate) fn display_value(&self) -> String {
        let Some(dtype) = self.dtype() else {
            return "None".into();
        };
        let shape = self.shape();
        let dims = || format!("{dtype}({})", shape.iter().map(usize::to_string).collect::<Vec<_>>().join("x"));
        if dtype.is_text() {
            let mut text = match self.value() {
                Ok(value) => match value.item() {
                    Some(Scalar::Text(s)) => s,
                    _ => value.to_string(),
                },
                Err(_) => return dims(),
            }
            .replace("\r\n", "\n");
            if text.chars().count() > 60 {
                text = format!("{}...", text.chars().take(56).collect::<String>());
            }
            if let Some(i) = text.find('\n') {
                text = format!("{}...", &text[..i]);
            }
            if self.size() == 1 {
                text = format!("'{text}'");
            }
            return text;
        }
        if self.len() > 3 || shape.len() > 1 {
            return dims();
        }
        match self.value() {
            Ok(value) => {
                let text = value.to_string();
                if text.is_empty() || text.contains('\n') {
                    dims()
                } else {
                    text
                }
            }
            Err(_) => dims(),
        }
    }
}

macro_rules! field_ops {
    ($($trait:ident $method:ident $op:ident),* $(,)?) => {$(
        impl $trait<&Field> for &Field {
            type Output = Result<Field>;

            fn $method(self, rhs: &Field) -> Result<Field> {
                let rhs = rhs.value()?;
                self.binary(&rhs, BinaryOp::$op, false)
            }
        }

        impl $trait<&Array> for &Field {
            type Output = Result<Field>;

            fn $method(self, rhs: &Array) -> Result<Field> {
                self.binary(rhs, BinaryOp::$op, false)
            }
        }

        impl $trait<f64> for &Field {
            type Output = Result<Field>;

            fn $method(self, rhs: f64) -> Result<Field> {
                self.binary(&Array::scalar(rhs), BinaryOp::$op, false)
            }
        }

        impl $trait<&Field> for f64 {
            type Output = Result<Field>;

            fn $method(self, rhs: &Field) -> Result<Field> {
                rhs.binary(&Array::scalar(self), BinaryOp::$op, true)
            }
        }
    )*};
}

field_ops!(Add add Add, Sub sub Sub, Mul mul Mul, Div div Div);

impl Neg for &Field {
    type Output = Result<Field>;

    fn neg(self) -> Result<Field> {
        Ok(Field::from_array(&self.0.name(), self.value()?.neg()?, self.0.attrs().safe()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sel;

    fn values(field: &Field) -> Vec<f64> {
        field.to_f64_vec().unwrap()
    }

    #[test]
    fn new_field_is_resident() {
        let field = Field::new(vec![1.0, 2.0, 3.0]);
        assert!(field.is_resident());
        assert_eq!(field.shape(), vec![3]);
        assert_eq!(field.dtype(), Some(DType::F64));
        assert_eq!(field.len(), 3);
        assert_eq!(field.nbytes(), 24);
    }

    #[test]
    fn builder_fill_only() {
        let field = Field::builder().shape(&[4]).dtype(DType::I32).fillvalue(7i32).build().unwrap();
        assert!(!field.is_resident());
        assert_eq!(values(&field), vec![7.0; 4]);
        field.set(1, 3).unwrap();
        assert!(field.is_resident());
        assert_eq!(values(&field), vec![7.0, 3.0, 7.0, 7.0]);
    }

    #[test]
    fn large_fields_compress_automatically() {
        let mut config = Config::default();
        config.max_size = 10;
        let field = Field::builder().shape(&[100]).dtype(DType::F64).config(&config).build().unwrap();
        let options = field.options();
        assert_eq!(options.compression.as_deref(), Some("gzip"));
        assert!(options.shuffle);
        assert_eq!(options.chunks, Some(vec![100]));
    }

    #[test]
    fn maxshape_is_validated() {
        let err = Field::builder().shape(&[10]).dtype(DType::F64).maxshape(&[Some(5)]).build().unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch(_)));
        let field = Field::builder().shape(&[10]).dtype(DType::F64).maxshape(&[None]).build().unwrap();
        field.resize(&[20]).unwrap();
        assert_eq!(field.shape(), vec![20]);
    }

    #[test]
    fn boolean_into_numeric_is_refused() {
        let field = Field::new(vec![1.0, 2.0]);
        assert!(matches!(field.set(0, true), Err(Error::DTypeMismatch(_))));
    }

    #[test]
    fn get_carries_safe_attrs() {
        let field = Field::new(vec![1.0, 2.0, 3.0, 4.0]);
        field.set_attr("units", "mm").unwrap();
        field.set_attr("signal", 1).unwrap();
        let slab = field.get(1..3).unwrap();
        assert_eq!(values(&slab), vec![2.0, 3.0]);
        assert!(slab.has_attr("units"));
        assert!(!slab.has_attr("signal"));
    }

    #[test]
    fn real_valued_slices() {
        let axis = Field::new((0..=10).map(f64::from).collect::<Vec<_>>());
        assert_eq!(values(&axis.get(2.0..5.0).unwrap()), vec![2.0, 3.0, 4.0, 5.0]);
        let reversed = Field::new((0..=10).rev().map(f64::from).collect::<Vec<_>>());
        assert_eq!(values(&reversed.get(5.0..2.0).unwrap()), vec![5.0, 4.0, 3.0, 2.0]);
        let grid = Field::new(Array::zeros(DType::F64, &[2, 2]));
        assert!(grid.get(sel![0.5]).is_err());
    }

    #[test]
    fn detached_mask_stays_in_memory() {
        let field = Field::new(vec![1.0, 2.0, 3.0]);
        field.set_masked(1).unwrap();
        let mask = field.mask().unwrap().unwrap();
        assert_eq!(mask.to_bool_vec().unwrap(), vec![false, true, false]);
        let slab = field.get(()).unwrap();
        assert_eq!(slab.mask().unwrap().unwrap().to_bool_vec().unwrap(), vec![false, true, false]);
        field.set_mask(None).unwrap();
        assert!(field.mask().unwrap().is_none());
    }

    #[test]
    fn attached_mask_creates_one_sibling() {
        let group = Group::new("NXdata").unwrap();
        group.set("counts", Field::new(vec![1.0, 2.0, 3.0, 4.0])).unwrap();
        let counts = group.field("counts").unwrap();
        counts.set_masked(0).unwrap();
        counts.set_masked(2..4).unwrap();
        assert_eq!(counts.attr_str("mask").as_deref(), Some("counts_mask"));
        let mask = group.field("counts_mask").unwrap();
        assert_eq!(mask.value().unwrap().to_bool_vec().unwrap(), vec![true, false, true, true]);
        assert_eq!(group.len(), 2);
    }

    #[test]
    fn resize_keeps_flat_order() {
        let field = Field::new(Array::from_f64(&[2, 2], vec![1.0, 2.0, 3.0, 4.0]).unwrap());
        field.resize(&[3, 2]).unwrap();
        assert_eq!(values(&field), vec![1.0, 2.0, 3.0, 4.0, 0.0, 0.0]);
        field.resize_axis(0, 1).unwrap();
        assert_eq!(field.shape(), vec![1, 2]);
        assert!(field.resize_axis(4, 1).is_err());
    }

    #[test]
    fn index_tolerance() {
        let axis = Field::new(vec![0.0, 1.0, 2.0, 3.0]);
        assert_eq!(axis.index(1.005, false).unwrap(), 1);
        assert_eq!(axis.index(1.5, false).unwrap(), 1);
        assert_eq!(axis.index(1.995, false).unwrap(), 2);
        assert_eq!(axis.index(1.5, true).unwrap(), 2);
        assert_eq!(axis.index(2.005, true).unwrap(), 2);
    }

    #[test]
    fn moments() {
        let field = Field::new(vec![0.0, 1.0, 0.0]);
        assert_eq!(field.mean().unwrap(), 1.0);
        assert_eq!(field.var().unwrap(), 0.0);
        let flat = Field::new(vec![1.0, 1.0]);
        assert_eq!(flat.mean().unwrap(), 0.5);
        assert!((flat.std().unwrap() - 0.5).abs() < 1e-12);
        assert!(Field::new("abc").moment(1, None).is_err());
    }

    #[test]
    fn reductions() {
        let field = Field::new(Array::from_f64(&[2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap());
        assert_eq!(values(&field.sum(Some(&[0])).unwrap()), vec![5.0, 7.0, 9.0]);
        assert_eq!(values(&field.sum(None).unwrap()), vec![21.0]);
        assert_eq!(values(&field.average(Some(&[1])).unwrap()), vec![2.0, 5.0]);
        let with_inf = Field::new(vec![f64::NEG_INFINITY, 1.0, 5.0, f64::NAN]);
        assert_eq!(with_inf.min().unwrap(), Some(1.0));
        assert_eq!(with_inf.max().unwrap(), Some(5.0));
    }

    #[test]
    fn centers_and_boundaries() {
        let axis = Field::new(vec![0.0, 1.0, 2.0]);
        assert_eq!(values(&axis.centers().unwrap()), vec![0.5, 1.5]);
        assert_eq!(values(&axis.boundaries().unwrap()), vec![-0.5, 0.5, 1.5, 2.5]);
    }

    #[test]
    fn add_at_offset() {
        let field = Field::new(vec![0i32; 5]);
        field.add_at(&Array::from(vec![1i32, 2]), &[2]).unwrap();
        field.add_at(&Array::from(vec![1i32]), &[3]).unwrap();
        assert_eq!(values(&field), vec![0.0, 0.0, 1.0, 3.0, 0.0]);
    }

    #[test]
    fn arithmetic_keeps_name_and_safe_attrs() {
        let field = Field::new(vec![1.0, 2.0]);
        field.inner_mut().name = "counts".into();
        field.set_attr("units", "s").unwrap();
        let doubled = (&field * 2.0).unwrap();
        assert_eq!(doubled.name(), "counts");
        assert_eq!(values(&doubled), vec![2.0, 4.0]);
        assert!(doubled.has_attr("units"));
        assert_eq!(values(&(10.0 - &field).unwrap()), vec![9.0, 8.0]);
        assert_eq!(values(&(&field + &field).unwrap()), vec![2.0, 4.0]);
        assert_eq!(values(&(&field / &field).unwrap()), vec![1.0, 1.0]);
        assert_eq!(values(&field.pow(2.0).unwrap()), vec![1.0, 4.0]);
        assert_eq!(values(&(-&field).unwrap()), vec![-1.0, -2.0]);
        let row = Field::new(vec![1.0, 2.0, 3.0]);
        assert!(matches!(&field + &row, Err(Error::ShapeMismatch(_))));
    }

    #[test]
    fn replace_in_place_or_swap() {
        let group = Group::new("NXdata").unwrap();
        group.set("x", Field::new(vec![1.0, 2.0])).unwrap();
        let x = group.field("x").unwrap();
        x.set_attr("units", "mm").unwrap();
        x.replace(Array::from(vec![3.0, 4.0])).unwrap();
        assert!(group.field("x").unwrap().ptr_eq(&x));
        x.replace(Array::from(vec![1i32, 2, 3])).unwrap();
        let swapped = group.field("x").unwrap();
        assert!(!swapped.ptr_eq(&x));
        assert_eq!(swapped.shape(), vec![3]);
        assert_eq!(swapped.attr_str("units").as_deref(), Some("mm"));
    }

    #[test]
    fn display_lines() {
        assert_eq!(Field::new(2i32).display_value(), "2");
        assert_eq!(Field::new("Scan").display_value(), "'Scan'");
        assert_eq!(Field::new(vec![1i32, 2, 3, 4]).display_value(), "int32(4)");
        assert_eq!(Field::new(vec![1.5, 2.0]).display_value(), "[1.5 2]");
        let long = "x".repeat(70);
        assert_eq!(Field::new(long.as_str()).display_value(), format!("'{}...'", "x".repeat(56)));
        assert_eq!(Field::new("a\nb").display_value(), "'a...'");
        let unset = Field::builder().shape(&[2]).build().unwrap();
        assert_eq!(unset.display_value(), "None");
    }

    #[test]
    fn axes_placeholders() {
        let field = Field::new(Array::zeros(DType::F64, &[3, 1, 4]));
        let axes = field.axes().unwrap();
        assert_eq!(axes.len(), 2);
        assert_eq!(axes[0].name(), "Axis0");
        assert_eq!(axes[1].shape(), vec![4]);
        assert!(field.valid_axes(&axes));
        assert_eq!(field.plot_shape(), vec![3, 4]);
    }

    #[test]
    fn dtype_change_before_storage() {
        let field = Field::new(vec![1i32, 2]);
        field.set_dtype(DType::F64).unwrap();
        assert_eq!(field.value().unwrap().dtype(), DType::F64);
        field.set_compression(Some("gzip")).unwrap();
        assert_eq!(field.options().compression.as_deref(), Some("gzip"));
        assert!(field.set_chunks(Some(vec![1, 1])).is_err());
    }
}

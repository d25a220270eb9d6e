//! N-dimensional values held by fields and attributes.
//!
//! An [`Array`] is a row-major buffer tagged with a [`DType`] and a shape.
//! Integer types are stored widened (`i64`/`u64`) and wrapped back to their
//! declared width after every operation, `f32` values are rounded through
//! `f32`, so element values always match what the declared type can hold.
//!
//! Arithmetic follows the usual broadcasting rules: shapes are aligned from
//! the right and dimensions of length one stretch to match.

use std::fmt;

use crate::error::{Error, Result};
use crate::selection::Hyperslab;
use crate::text::format_float;

/// Element type of an [`Array`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    Bool,
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
    Str,
}

impl DType {
    /// Parse a type name such as `float64`, `f4`, `int16` or `char`.
    pub fn parse(name: &str) -> Result<DType> {
        let dtype = match name.trim().to_ascii_lowercase().as_str() {
            "bool" | "b1" => DType::Bool,
            "int8" | "i8" | "i1" => DType::I8,
            "int16" | "i16" | "i2" => DType::I16,
            "int32" | "i32" | "i4" => DType::I32,
            "int64" | "i64" | "i8b" | "int" => DType::I64,
            "uint8" | "u8" | "u1" => DType::U8,
            "uint16" | "u16" | "u2" => DType::U16,
            "uint32" | "u32" | "u4" => DType::U32,
            "uint64" | "u64" => DType::U64,
            "float32" | "f32" | "f4" => DType::F32,
            "float64" | "f64" | "f8" | "float" => DType::F64,
            "char" | "str" | "string" | "text" => DType::Str,
            other => return Err(Error::Configuration(format!("invalid dtype '{other}'"))),
        };
        Ok(dtype)
    }

    /// Bytes per element; variable-length strings count as a pointer.
    pub fn itemsize(self) -> usize {
        match self {
            DType::Bool | DType::I8 | DType::U8 => 1,
            DType::I16 | DType::U16 => 2,
            DType::I32 | DType::U32 | DType::F32 => 4,
            DType::I64 | DType::U64 | DType::F64 | DType::Str => 8,
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, DType::F32 | DType::F64)
    }

    pub fn is_signed(self) -> bool {
        matches!(self, DType::I8 | DType::I16 | DType::I32 | DType::I64)
    }

    pub fn is_unsigned(self) -> bool {
        matches!(self, DType::U8 | DType::U16 | DType::U32 | DType::U64)
    }

    pub fn is_integer(self) -> bool {
        self.is_signed() || self.is_unsigned()
    }

    pub fn is_text(self) -> bool {
        self == DType::Str
    }

    pub fn is_bool(self) -> bool {
        self == DType::Bool
    }

    fn signed_of_size(size: usize) -> DType {
        match size {
            1 => DType::I8,
            2 => DType::I16,
            4 => DType::I32,
            _ => DType::I64,
        }
    }

    fn unsigned_of_size(size: usize) -> DType {
        match size {
            1 => DType::U8,
            2 => DType::U16,
            4 => DType::U32,
            _ => DType::U64,
        }
    }

    /// Result type of combining two numeric types.
    pub fn promote(a: DType, b: DType) -> DType {
        if a.is_float() || b.is_float() {
            let wide = |d: DType| d == DType::F64 || (!d.is_float() && d.itemsize() > 2);
            return if wide(a) || wide(b) { DType::F64 } else { DType::F32 };
        }
        match (a, b) {
            (DType::Bool, DType::Bool) => DType::I64,
            (DType::Bool, other) | (other, DType::Bool) => other,
            _ if a.is_signed() == b.is_signed() => {
                let size = a.itemsize().max(b.itemsize());
                if a.is_signed() {
                    DType::signed_of_size(size)
                } else {
                    DType::unsigned_of_size(size)
                }
            }
            _ => {
                let (signed, unsigned) = if a.is_signed() { (a, b) } else { (b, a) };
                if signed.itemsize() > unsigned.itemsize() {
                    signed
                } else {
                    DType::signed_of_size(unsigned.itemsize() * 2)
                }
            }
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DType::Bool => "bool",
            DType::I8 => "int8",
            DType::I16 => "int16",
            DType::I32 => "int32",
            DType::I64 => "int64",
            DType::U8 => "uint8",
            DType::U16 => "uint16",
            DType::U32 => "uint32",
            DType::U64 => "uint64",
            DType::F32 => "float32",
            DType::F64 => "float64",
            DType::Str => "char",
        };
        f.write_str(name)
    }
}

/// A single element.
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Text(String),
}

impl Scalar {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Scalar::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Scalar::Int(v) => Some(*v as f64),
            Scalar::UInt(v) => Some(*v as f64),
            Scalar::Float(v) => Some(*v),
            Scalar::Text(_) => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Scalar::Bool(b) => Some(*b as i64),
            Scalar::Int(v) => Some(*v),
            Scalar::UInt(v) => i64::try_from(*v).ok(),
            Scalar::Float(v) if v.fract() == 0.0 => Some(*v as i64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Scalar::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Natural type of the value when it is stored on its own.
    pub fn dtype(&self) -> DType {
        match self {
            Scalar::Bool(_) => DType::Bool,
            Scalar::Int(_) => DType::I64,
            Scalar::UInt(_) => DType::U64,
            Scalar::Float(_) => DType::F64,
            Scalar::Text(_) => DType::Str,
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Bool(b) => write!(f, "{}", if *b { "True" } else { "False" }),
            Scalar::Int(v) => write!(f, "{v}"),
            Scalar::UInt(v) => write!(f, "{v}"),
            Scalar::Float(v) => f.write_str(&format_float(*v)),
            Scalar::Text(s) => f.write_str(s),
        }
    }
}

macro_rules! scalar_from {
    ($($t:ty => $variant:ident as $conv:ty),* $(,)?) => {
        $(impl From<$t> for Scalar {
            fn from(v: $t) -> Self {
                Scalar::$variant(v as $conv)
            }
        })*
    };
}

scalar_from!(
    i8 => Int as i64, i16 => Int as i64, i32 => Int as i64, i64 => Int as i64,
    u8 => UInt as u64, u16 => UInt as u64, u32 => UInt as u64, u64 => UInt as u64,
    usize => UInt as u64, f32 => Float as f64, f64 => Float as f64,
);

impl From<bool> for Scalar {
    fn from(v: bool) -> Self {
        Scalar::Bool(v)
    }
}

impl From<&str> for Scalar {
    fn from(v: &str) -> Self {
        Scalar::Text(v.to_string())
    }
}

impl From<String> for Scalar {
    fn from(v: String) -> Self {
        Scalar::Text(v)
    }
}

/// Element storage, widened per kind.
#[derive(Debug, Clone, PartialEq)]
pub enum Data {
    Bool(Vec<bool>),
    Int(Vec<i64>),
    UInt(Vec<u64>),
    Float(Vec<f64>),
    Text(Vec<String>),
}

impl Data {
    pub fn len(&self) -> usize {
        match self {
            Data::Bool(v) => v.len(),
            Data::Int(v) => v.len(),
            Data::UInt(v) => v.len(),
            Data::Float(v) => v.len(),
            Data::Text(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn get(&self, i: usize) -> Option<Scalar> {
        Some(match self {
            Data::Bool(v) => Scalar::Bool(*v.get(i)?),
            Data::Int(v) => Scalar::Int(*v.get(i)?),
            Data::UInt(v) => Scalar::UInt(*v.get(i)?),
            Data::Float(v) => Scalar::Float(*v.get(i)?),
            Data::Text(v) => Scalar::Text(v.get(i)?.clone()),
        })
    }

    fn gather(&self, offsets: &[usize]) -> Data {
        match self {
            Data::Bool(v) => Data::Bool(offsets.iter().map(|&i| v[i]).collect()),
            Data::Int(v) => Data::Int(offsets.iter().map(|&i| v[i]).collect()),
            Data::UInt(v) => Data::UInt(offsets.iter().map(|&i| v[i]).collect()),
            Data::Float(v) => Data::Float(offsets.iter().map(|&i| v[i]).collect()),
            Data::Text(v) => Data::Text(offsets.iter().map(|&i| v[i].clone()).collect()),
        }
    }

    /// Write `src[k]` to `self[offsets[k]]`. Both sides share a kind.
    fn scatter(&mut self, offsets: &[usize], src: Data) {
        match (self, src) {
            (Data::Bool(dst), Data::Bool(src)) => scatter_into(dst, offsets, src),
            (Data::Int(dst), Data::Int(src)) => scatter_into(dst, offsets, src),
            (Data::UInt(dst), Data::UInt(src)) => scatter_into(dst, offsets, src),
            (Data::Float(dst), Data::Float(src)) => scatter_into(dst, offsets, src),
            (Data::Text(dst), Data::Text(src)) => scatter_into(dst, offsets, src),
            _ => {}
        }
    }

    fn resized(&self, len: usize) -> Data {
        fn grow<T: Clone>(v: &[T], len: usize, fill: T) -> Vec<T> {
            let mut out: Vec<T> = v.iter().take(len).cloned().collect();
            out.resize(len, fill);
            out
        }
        match self {
            Data::Bool(v) => Data::Bool(grow(v, len, false)),
            Data::Int(v) => Data::Int(grow(v, len, 0)),
            Data::UInt(v) => Data::UInt(grow(v, len, 0)),
            Data::Float(v) => Data::Float(grow(v, len, 0.0)),
            Data::Text(v) => Data::Text(grow(v, len, String::new())),
        }
    }
}

fn scatter_into<T>(dst: &mut [T], offsets: &[usize], src: Vec<T>) {
    for (&i, value) in offsets.iter().zip(src) {
        dst[i] = value;
    }
}

/// Binary arithmetic operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Pow => "**",
        })
    }
}

/// Row-major n-dimensional array.
#[derive(Debug, Clone, PartialEq)]
pub struct Array {
    dtype: DType,
    shape: Vec<usize>,
    data: Data,
}

impl Array {
    /// Build an array, checking that `data` fits `dtype` and `shape`.
    pub fn new(dtype: DType, shape: Vec<usize>, data: Data) -> Result<Array> {
        let size: usize = shape.iter().product();
        if data.len() != size {
            return Err(Error::ShapeMismatch(format!(
                "{} values cannot fill shape {:?}",
                data.len(),
                shape
            )));
        }
        let fits = match &data {
            Data::Bool(_) => dtype.is_bool(),
            Data::Int(_) => dtype.is_signed(),
            Data::UInt(_) => dtype.is_unsigned(),
            Data::Float(_) => dtype.is_float(),
            Data::Text(_) => dtype.is_text(),
        };
        if !fits {
            return Err(Error::DTypeMismatch(format!("data does not match dtype {dtype}")));
        }
        Ok(Array { dtype, shape, data: normalize(dtype, data) })
    }

    /// Zero-dimensional array holding one value.
    pub fn scalar(value: impl Into<Scalar>) -> Array {
        let value = value.into();
        let dtype = value.dtype();
        let data = match value {
            Scalar::Bool(b) => Data::Bool(vec![b]),
            Scalar::Int(v) => Data::Int(vec![v]),
            Scalar::UInt(v) => Data::UInt(vec![v]),
            Scalar::Float(v) => Data::Float(vec![v]),
            Scalar::Text(s) => Data::Text(vec![s]),
        };
        Array { dtype, shape: Vec::new(), data }
    }

    /// Array of `shape` with every element set to `fill`.
    pub fn filled(dtype: DType, shape: &[usize], fill: &Scalar) -> Result<Array> {
        let size: usize = shape.iter().product();
        let one = Array::scalar(fill.clone()).astype(dtype)?;
        let data = match one.data {
            Data::Bool(v) => Data::Bool(vec![v[0]; size]),
            Data::Int(v) => Data::Int(vec![v[0]; size]),
            Data::UInt(v) => Data::UInt(vec![v[0]; size]),
            Data::Float(v) => Data::Float(vec![v[0]; size]),
            Data::Text(v) => Data::Text(vec![v[0].clone(); size]),
        };
        Ok(Array { dtype, shape: shape.to_vec(), data })
    }

    pub fn zeros(dtype: DType, shape: &[usize]) -> Array {
        let size: usize = shape.iter().product();
        let data = match dtype {
            DType::Bool => Data::Bool(vec![false; size]),
            d if d.is_signed() => Data::Int(vec![0; size]),
            d if d.is_unsigned() => Data::UInt(vec![0; size]),
            d if d.is_float() => Data::Float(vec![0.0; size]),
            _ => Data::Text(vec![String::new(); size]),
        };
        Array { dtype, shape: shape.to_vec(), data }
    }

    /// `0, 1, .., n-1` as `int64`.
    pub fn arange(n: usize) -> Array {
        Array {
            dtype: DType::I64,
            shape: vec![n],
            data: Data::Int((0..n as i64).collect()),
        }
    }

    /// `num` evenly spaced values from `start` to `stop` inclusive.
    pub fn linspace(start: f64, stop: f64, num: usize) -> Array {
        let values: Vec<f64> = match num {
            0 => Vec::new(),
            1 => vec![start],
            _ => {
                let step = (stop - start) / (num - 1) as f64;
                (0..num)
                    .map(|i| if i == num - 1 { stop } else { start + step * i as f64 })
                    .collect()
            }
        };
        Array::from(values)
    }

    /// `float64` array from values and a shape.
    pub fn from_f64(shape: &[usize], values: Vec<f64>) -> Result<Array> {
        Array::new(DType::F64, shape.to_vec(), Data::Float(values))
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn nbytes(&self) -> usize {
        self.size() * self.dtype.itemsize()
    }

    pub fn data(&self) -> &Data {
        &self.data
    }

    pub fn into_data(self) -> Data {
        self.data
    }

    /// Element at a flat (row-major) position.
    pub fn get(&self, flat: usize) -> Option<Scalar> {
        self.data.get(flat)
    }

    /// Element at a multi-dimensional index.
    pub fn at(&self, index: &[usize]) -> Option<Scalar> {
        if index.len() != self.shape.len() {
            return None;
        }
        let mut flat = 0;
        for (&i, &dim) in index.iter().zip(&self.shape) {
            if i >= dim {
                return None;
            }
            flat = flat * dim + i;
        }
        self.get(flat)
    }

    /// The only element of a size-one array.
    pub fn item(&self) -> Option<Scalar> {
        if self.size() == 1 {
            self.get(0)
        } else {
            None
        }
    }

    pub fn as_text(&self) -> Option<&[String]> {
        match &self.data {
            Data::Text(v) => Some(v),
            _ => None,
        }
    }

    /// Elements as `f64`; text arrays are rejected.
    pub fn to_f64_vec(&self) -> Result<Vec<f64>> {
        Ok(match &self.data {
            Data::Bool(v) => v.iter().map(|&b| if b { 1.0 } else { 0.0 }).collect(),
            Data::Int(v) => v.iter().map(|&x| x as f64).collect(),
            Data::UInt(v) => v.iter().map(|&x| x as f64).collect(),
            Data::Float(v) => v.clone(),
            Data::Text(_) => {
                return Err(Error::DTypeMismatch("text values are not numeric".into()));
            }
        })
    }

    /// Elements as `bool` (non-zero is true).
    pub fn to_bool_vec(&self) -> Result<Vec<bool>> {
        match self.astype(DType::Bool)?.data {
            Data::Bool(v) => Ok(v),
            _ => Err(Error::DTypeMismatch("not a boolean array".into())),
        }
    }

    fn to_i64_vec(&self) -> Result<Vec<i64>> {
        Ok(match &self.data {
            Data::Bool(v) => v.iter().map(|&b| b as i64).collect(),
            Data::Int(v) => v.clone(),
            Data::UInt(v) => v.iter().map(|&x| x as i64).collect(),
            Data::Float(v) => v.iter().map(|&x| x as i64).collect(),
            Data::Text(_) => {
                return Err(Error::DTypeMismatch("text values are not numeric".into()));
            }
        })
    }

    fn to_u64_vec(&self) -> Result<Vec<u64>> {
        Ok(match &self.data {
            Data::Bool(v) => v.iter().map(|&b| b as u64).collect(),
            Data::Int(v) => v.iter().map(|&x| x as u64).collect(),
            Data::UInt(v) => v.clone(),
            Data::Float(v) => v.iter().map(|&x| x as u64).collect(),
            Data::Text(_) => {
                return Err(Error::DTypeMismatch("text values are not numeric".into()));
            }
        })
    }

    /// Convert to another element type. Text never converts to or from numbers.
    pub fn astype(&self, dtype: DType) -> Result<Array> {
        if dtype == self.dtype {
            return Ok(self.clone());
        }
        if dtype.is_text() != self.dtype.is_text() {
            return Err(Error::DTypeMismatch(format!(
                "cannot convert {} to {}",
                self.dtype, dtype
            )));
        }
        let data = match dtype {
            DType::Bool => Data::Bool(match &self.data {
                Data::Int(v) => v.iter().map(|&x| x != 0).collect(),
                Data::UInt(v) => v.iter().map(|&x| x != 0).collect(),
                Data::Float(v) => v.iter().map(|&x| x != 0.0).collect(),
                other => return Ok(Array { dtype, shape: self.shape.clone(), data: other.clone() }),
            }),
            d if d.is_signed() => Data::Int(self.to_i64_vec()?),
            d if d.is_unsigned() => Data::UInt(self.to_u64_vec()?),
            d if d.is_float() => Data::Float(self.to_f64_vec()?),
            _ => self.data.clone(),
        };
        Ok(Array { dtype, shape: self.shape.clone(), data: normalize(dtype, data) })
    }

    /// Same elements under a new shape of equal size.
    pub fn reshape(&self, shape: &[usize]) -> Result<Array> {
        let size: usize = shape.iter().product();
        if size != self.size() {
            return Err(Error::ShapeMismatch(format!(
                "cannot reshape array of size {} into shape {:?}",
                self.size(),
                shape
            )));
        }
        Ok(Array { dtype: self.dtype, shape: shape.to_vec(), data: self.data.clone() })
    }

    /// New shape keeping the flat element order; truncates or pads with zeros.
    pub fn resize(&self, shape: &[usize]) -> Array {
        let size: usize = shape.iter().product();
        Array { dtype: self.dtype, shape: shape.to_vec(), data: self.data.resized(size) }
    }

    /// Stretch to `shape` under broadcasting rules.
    pub fn broadcast_to(&self, shape: &[usize]) -> Result<Array> {
        if self.shape == shape {
            return Ok(self.clone());
        }
        if broadcast_shapes(&self.shape, shape)? != shape {
            return Err(Error::ShapeMismatch(format!(
                "cannot broadcast shape {:?} to {:?}",
                self.shape, shape
            )));
        }
        let offsets = broadcast_offsets(&self.shape, shape);
        Ok(Array { dtype: self.dtype, shape: shape.to_vec(), data: self.data.gather(&offsets) })
    }

    /// Permute dimensions; the default reverses them.
    pub fn transpose(&self, axes: Option<&[usize]>) -> Result<Array> {
        let ndim = self.ndim();
        let perm: Vec<usize> = match axes {
            Some(axes) => axes.to_vec(),
            None => (0..ndim).rev().collect(),
        };
        let mut seen = vec![false; ndim];
        if perm.len() != ndim || perm.iter().any(|&a| a >= ndim || std::mem::replace(&mut seen[a], true)) {
            return Err(Error::ShapeMismatch(format!("invalid axes {perm:?} for {ndim} dimensions")));
        }
        let strides = c_strides(&self.shape);
        let shape: Vec<usize> = perm.iter().map(|&a| self.shape[a]).collect();
        let perm_strides: Vec<isize> = perm.iter().map(|&a| strides[a] as isize).collect();
        let offsets = strided_offsets(&shape, &perm_strides, 0);
        Ok(Array { dtype: self.dtype, shape, data: self.data.gather(&offsets) })
    }

    /// Extract the elements selected by `slab`.
    pub fn slab(&self, slab: &Hyperslab) -> Result<Array> {
        let offsets = self.slab_offsets(slab)?;
        Ok(Array { dtype: self.dtype, shape: slab.shape(), data: self.data.gather(&offsets) })
    }

    /// Overwrite the elements selected by `slab`, broadcasting `value`.
    pub fn assign(&mut self, slab: &Hyperslab, value: &Array) -> Result<()> {
        let offsets = self.slab_offsets(slab)?;
        let value = value.astype(self.dtype)?.broadcast_to(&slab.shape())?;
        self.data.scatter(&offsets, value.data);
        Ok(())
    }

    fn slab_offsets(&self, slab: &Hyperslab) -> Result<Vec<usize>> {
        slab_offsets(&self.shape, slab)
    }

    /// Element-wise arithmetic with broadcasting.
    pub fn binary(&self, other: &Array, op: BinaryOp) -> Result<Array> {
        if self.dtype.is_text() || other.dtype.is_text() {
            return Err(Error::DTypeMismatch(format!(
                "unsupported operand types for {op}: {} and {}",
                self.dtype, other.dtype
            )));
        }
        let shape = broadcast_shapes(&self.shape, &other.shape)?;
        let left = broadcast_offsets(&self.shape, &shape);
        let right = broadcast_offsets(&other.shape, &shape);
        let promoted = DType::promote(self.dtype, other.dtype);
        let dtype = match op {
            BinaryOp::Div if !promoted.is_float() => DType::F64,
            _ => promoted,
        };
        let data = if dtype.is_float() {
            let (a, b) = (self.to_f64_vec()?, other.to_f64_vec()?);
            Data::Float(
                left.iter()
                    .zip(&right)
                    .map(|(&i, &j)| float_op(op, a[i], b[j]))
                    .collect(),
            )
        } else if dtype.is_signed() {
            let (a, b) = (self.to_i64_vec()?, other.to_i64_vec()?);
            let mut out = Vec::with_capacity(left.len());
            for (&i, &j) in left.iter().zip(&right) {
                out.push(int_op(op, a[i], b[j])?);
            }
            Data::Int(out)
        } else {
            let (a, b) = (self.to_u64_vec()?, other.to_u64_vec()?);
            Data::UInt(
                left.iter()
                    .zip(&right)
                    .map(|(&i, &j)| uint_op(op, a[i], b[j]))
                    .collect(),
            )
        };
        Ok(Array { dtype, shape, data: normalize(dtype, data) })
    }

    /// Apply a float function element-wise; integer input yields `float64`.
    pub fn map_float(&self, f: impl Fn(f64) -> f64) -> Result<Array> {
        let dtype = if self.dtype == DType::F32 { DType::F32 } else { DType::F64 };
        let values = self.to_f64_vec()?.into_iter().map(f).collect();
        Ok(Array { dtype, shape: self.shape.clone(), data: normalize(dtype, Data::Float(values)) })
    }

    pub fn sqrt(&self) -> Result<Array> {
        self.map_float(f64::sqrt)
    }

    pub fn abs(&self) -> Result<Array> {
        match &self.data {
            Data::Int(v) => Ok(Array {
                dtype: self.dtype,
                shape: self.shape.clone(),
                data: normalize(self.dtype, Data::Int(v.iter().map(|x| x.wrapping_abs()).collect())),
            }),
            Data::UInt(_) | Data::Bool(_) => Ok(self.clone()),
            _ => self.map_float(f64::abs),
        }
    }

    pub fn neg(&self) -> Result<Array> {
        Array::scalar(0i64).astype(self.dtype)?.binary(self, BinaryOp::Sub)
    }

    /// Sum over `axes`, removing them from the shape.
    pub fn sum_axes(&self, axes: &[usize]) -> Result<Array> {
        let (shape, map) = reduction_map(&self.shape, axes)?;
        let size: usize = shape.iter().product();
        let (dtype, data) = match &self.data {
            Data::Float(v) => {
                let mut out = vec![0.0; size];
                for (k, &x) in v.iter().enumerate() {
                    out[map[k]] += x;
                }
                (self.dtype, Data::Float(out))
            }
            Data::UInt(v) => {
                let mut out = vec![0u64; size];
                for (k, &x) in v.iter().enumerate() {
                    out[map[k]] = out[map[k]].wrapping_add(x);
                }
                (DType::U64, Data::UInt(out))
            }
            Data::Text(_) => {
                return Err(Error::DTypeMismatch("cannot sum text values".into()));
            }
            _ => {
                let v = self.to_i64_vec()?;
                let mut out = vec![0i64; size];
                for (k, &x) in v.iter().enumerate() {
                    out[map[k]] = out[map[k]].wrapping_add(x);
                }
                (DType::I64, Data::Int(out))
            }
        };
        Ok(Array { dtype, shape, data: normalize(dtype, data) })
    }

    /// Mean over `axes` as floats.
    pub fn mean_axes(&self, axes: &[usize]) -> Result<Array> {
        let count: usize = axes.iter().filter_map(|&a| self.shape.get(a)).product();
        let sum = self.sum_axes(axes)?;
        sum.binary(&Array::scalar(count as f64), BinaryOp::Div)
    }

    /// Sum of every element.
    pub fn sum_all(&self) -> Result<f64> {
        Ok(self.to_f64_vec()?.iter().sum())
    }

    /// Smallest finite element.
    pub fn min_f64(&self) -> Option<f64> {
        self.to_f64_vec().ok()?.into_iter().filter(|x| x.is_finite()).reduce(f64::min)
    }

    /// Largest finite element.
    pub fn max_f64(&self) -> Option<f64> {
        self.to_f64_vec().ok()?.into_iter().filter(|x| x.is_finite()).reduce(f64::max)
    }

    /// Same shape and numerically equal elements, regardless of dtype.
    pub fn values_equal(&self, other: &Array) -> bool {
        if self.shape != other.shape {
            return false;
        }
        match (&self.data, &other.data) {
            (Data::Text(a), Data::Text(b)) => a == b,
            (Data::Text(_), _) | (_, Data::Text(_)) => false,
            _ => match (self.to_f64_vec(), other.to_f64_vec()) {
                (Ok(a), Ok(b)) => a == b,
                _ => false,
            },
        }
    }

    /// Same shape and elements equal within `rtol * |b| + atol`.
    pub fn allclose(&self, other: &Array, rtol: f64, atol: f64) -> bool {
        if self.shape != other.shape {
            return false;
        }
        match (self.to_f64_vec(), other.to_f64_vec()) {
            (Ok(a), Ok(b)) => a
                .iter()
                .zip(&b)
                .all(|(x, y)| x == y || (x - y).abs() <= atol + rtol * y.abs()),
            _ => self.values_equal(other),
        }
    }
}

impl fmt::Display for Array {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn write_dim(a: &Array, f: &mut fmt::Formatter<'_>, dim: usize, offset: usize) -> fmt::Result {
            let stride: usize = a.shape[dim + 1..].iter().product();
            f.write_str("[")?;
            for i in 0..a.shape[dim] {
                if i > 0 {
                    f.write_str(" ")?;
                }
                if dim + 1 == a.ndim() {
                    if let Some(v) = a.get(offset + i) {
                        match v {
                            Scalar::Text(s) => write!(f, "'{s}'")?,
                            other => write!(f, "{other}")?,
                        }
                    }
                } else {
                    write_dim(a, f, dim + 1, offset + i * stride)?;
                }
            }
            f.write_str("]")
        }
        if self.ndim() == 0 {
            match self.get(0) {
                Some(v) => write!(f, "{v}"),
                None => Ok(()),
            }
        } else {
            write_dim(self, f, 0, 0)
        }
    }
}

macro_rules! array_from {
    ($($t:ty => $dtype:ident, $variant:ident as $conv:ty);* $(;)?) => {
        $(
            impl From<$t> for Array {
                fn from(v: $t) -> Self {
                    Array { dtype: DType::$dtype, shape: Vec::new(), data: Data::$variant(vec![v as $conv]) }
                }
            }
            impl From<Vec<$t>> for Array {
                fn from(v: Vec<$t>) -> Self {
                    Array {
                        dtype: DType::$dtype,
                        shape: vec![v.len()],
                        data: Data::$variant(v.into_iter().map(|x| x as $conv).collect()),
                    }
                }
            }
            impl From<&[$t]> for Array {
                fn from(v: &[$t]) -> Self {
                    Array::from(v.to_vec())
                }
            }
        )*
    };
}

array_from!(
    i8 => I8, Int as i64; i16 => I16, Int as i64; i32 => I32, Int as i64; i64 => I64, Int as i64;
    u8 => U8, UInt as u64; u16 => U16, UInt as u64; u32 => U32, UInt as u64; u64 => U64, UInt as u64;
    f32 => F32, Float as f64; f64 => F64, Float as f64;
);

impl From<bool> for Array {
    fn from(v: bool) -> Self {
        Array::scalar(v)
    }
}

impl From<Vec<bool>> for Array {
    fn from(v: Vec<bool>) -> Self {
        Array { dtype: DType::Bool, shape: vec![v.len()], data: Data::Bool(v) }
    }
}

impl From<&str> for Array {
    fn from(v: &str) -> Self {
        Array::scalar(v)
    }
}

impl From<String> for Array {
    fn from(v: String) -> Self {
        Array::scalar(v)
    }
}

impl From<Vec<&str>> for Array {
    fn from(v: Vec<&str>) -> Self {
        Array::from(v.into_iter().map(str::to_string).collect::<Vec<_>>())
    }
}

impl From<Vec<String>> for Array {
    fn from(v: Vec<String>) -> Self {
        Array { dtype: DType::Str, shape: vec![v.len()], data: Data::Text(v) }
    }
}

impl From<Scalar> for Array {
    fn from(v: Scalar) -> Self {
        Array::scalar(v)
    }
}

/// Wrap widened values back into the range of `dtype`.
fn normalize(dtype: DType, data: Data) -> Data {
    match data {
        Data::Int(v) => Data::Int(match dtype {
            DType::I8 => v.into_iter().map(|x| x as i8 as i64).collect(),
            DType::I16 => v.into_iter().map(|x| x as i16 as i64).collect(),
            DType::I32 => v.into_iter().map(|x| x as i32 as i64).collect(),
            _ => v,
        }),
        Data::UInt(v) => Data::UInt(match dtype {
            DType::U8 => v.into_iter().map(|x| x as u8 as u64).collect(),
            DType::U16 => v.into_iter().map(|x| x as u16 as u64).collect(),
            DType::U32 => v.into_iter().map(|x| x as u32 as u64).collect(),
            _ => v,
        }),
        Data::Float(v) if dtype == DType::F32 => {
            Data::Float(v.into_iter().map(|x| x as f32 as f64).collect())
        }
        other => other,
    }
}

fn float_op(op: BinaryOp, a: f64, b: f64) -> f64 {
    match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::Div => a / b,
        BinaryOp::Pow => a.powf(b),
    }
}

fn int_op(op: BinaryOp, a: i64, b: i64) -> Result<i64> {
    Ok(match op {
        BinaryOp::Add => a.wrapping_add(b),
        BinaryOp::Sub => a.wrapping_sub(b),
        BinaryOp::Mul => a.wrapping_mul(b),
        BinaryOp::Div => a.checked_div(b).unwrap_or(0),
        BinaryOp::Pow => {
            let exp = u32::try_from(b).map_err(|_| {
                Error::InvalidOperation("integers to negative integer powers are not allowed".into())
            })?;
            a.wrapping_pow(exp)
        }
    })
}

fn uint_op(op: BinaryOp, a: u64, b: u64) -> u64 {
    match op {
        BinaryOp::Add => a.wrapping_add(b),
        BinaryOp::Sub => a.wrapping_sub(b),
        BinaryOp::Mul => a.wrapping_mul(b),
        BinaryOp::Div => a.checked_div(b).unwrap_or(0),
        BinaryOp::Pow => a.wrapping_pow(b.min(u32::MAX as u64) as u32),
    }
}

/// Row-major offsets of the elements `slab` selects from an array of `shape`.
pub(crate) fn slab_offsets(shape: &[usize], slab: &Hyperslab) -> Result<Vec<usize>> {
    let dims = slab.dims();
    if dims.len() != shape.len() {
        return Err(Error::ShapeMismatch(format!(
            "selection has {} dimensions, array has {}",
            dims.len(),
            shape.len()
        )));
    }
    let strides = c_strides(shape);
    let mut base = 0isize;
    let mut counts = Vec::with_capacity(dims.len());
    let mut steps = Vec::with_capacity(dims.len());
    for (d, (dim, &len)) in dims.iter().zip(shape).enumerate() {
        if dim.count > 0 {
            let last = dim.start as isize + (dim.count as isize - 1) * dim.step;
            if dim.start >= len || last < 0 || last as usize >= len {
                return Err(Error::ShapeMismatch(format!(
                    "selection exceeds dimension {d} of size {len}"
                )));
            }
        }
        base += dim.start as isize * strides[d] as isize;
        counts.push(dim.count);
        steps.push(dim.step * strides[d] as isize);
    }
    Ok(strided_offsets(&counts, &steps, base))
}

/// Result shape of broadcasting `a` against `b`.
pub fn broadcast_shapes(a: &[usize], b: &[usize]) -> Result<Vec<usize>> {
    let n = a.len().max(b.len());
    let dim = |s: &[usize], i: usize| {
        let pad = n - s.len();
        if i < pad {
            1
        } else {
            s[i - pad]
        }
    };
    (0..n)
        .map(|i| match (dim(a, i), dim(b, i)) {
            (x, y) if x == y || y == 1 => Ok(x),
            (1, y) => Ok(y),
            _ => Err(Error::ShapeMismatch(format!(
                "operands could not be broadcast together with shapes {a:?} {b:?}"
            ))),
        })
        .collect()
}

pub(crate) fn c_strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1usize; shape.len()];
    for i in (0..shape.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * shape[i + 1];
    }
    strides
}

/// Source offsets for each element of `out` when `src` is broadcast to it.
fn broadcast_offsets(src: &[usize], out: &[usize]) -> Vec<usize> {
    let pad = out.len() - src.len();
    let src_strides = c_strides(src);
    let mut strides = vec![0isize; out.len()];
    for (k, &dim) in src.iter().enumerate() {
        if dim != 1 {
            strides[k + pad] = src_strides[k] as isize;
        }
    }
    strided_offsets(out, &strides, 0)
}

/// Flat offsets visited by a row-major walk over `shape` with the given strides.
fn strided_offsets(shape: &[usize], strides: &[isize], base: isize) -> Vec<usize> {
    let n: usize = shape.iter().product();
    let mut offsets = Vec::with_capacity(n);
    let mut index = vec![0usize; shape.len()];
    let mut offset = base;
    for _ in 0..n {
        offsets.push(offset as usize);
        for axis in (0..shape.len()).rev() {
            index[axis] += 1;
            offset += strides[axis];
            if index[axis] < shape[axis] {
                break;
            }
            offset -= strides[axis] * index[axis] as isize;
            index[axis] = 0;
        }
    }
    offsets
}

/// Output shape and, for every input element, its output offset.
fn reduction_map(shape: &[usize], axes: &[usize]) -> Result<(Vec<usize>, Vec<usize>)> {
    if let Some(&bad) = axes.iter().find(|&&a| a >= shape.len()) {
        return Err(Error::ShapeMismatch(format!(
            "axis {bad} is out of bounds for array of dimension {}",
            shape.len()
        )));
    }
    let out_shape: Vec<usize> = (0..shape.len())
        .filter(|d| !axes.contains(d))
        .map(|d| shape[d])
        .collect();
    let out_strides = c_strides(&out_shape);
    let mut strides = vec![0isize; shape.len()];
    let mut k = 0;
    for d in 0..shape.len() {
        if !axes.contains(&d) {
            strides[d] = out_strides[k] as isize;
            k += 1;
        }
    }
    Ok((out_shape, strided_offsets(shape, &strides, 0)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selection::{Selection, SlabDim};

    fn grid() -> Array {
        Array::from((0..12).map(|x| x as f64).collect::<Vec<_>>())
            .reshape(&[3, 4])
            .unwrap()
    }

    #[test]
    fn dtype_names_parse_and_display() {
        assert_eq!(DType::parse("float64").unwrap(), DType::F64);
        assert_eq!(DType::parse("i2").unwrap(), DType::I16);
        assert_eq!(DType::parse("char").unwrap(), DType::Str);
        assert!(DType::parse("complex").is_err());
        assert_eq!(DType::U16.to_string(), "uint16");
    }

    #[test]
    fn promotion_rules() {
        assert_eq!(DType::promote(DType::I16, DType::I32), DType::I32);
        assert_eq!(DType::promote(DType::U8, DType::I8), DType::I16);
        assert_eq!(DType::promote(DType::F32, DType::I8), DType::F32);
        assert_eq!(DType::promote(DType::F32, DType::I64), DType::F64);
        assert_eq!(DType::promote(DType::Bool, DType::U16), DType::U16);
    }

    #[test]
    fn broadcasting_adds_row_to_grid() {
        let row = Array::from(vec![10.0, 20.0, 30.0, 40.0]);
        let sum = grid().binary(&row, BinaryOp::Add).unwrap();
        assert_eq!(sum.shape(), &[3, 4]);
        assert_eq!(sum.get(5), Some(Scalar::Float(25.0)));
        let bad = Array::from(vec![1.0, 2.0, 3.0]);
        assert!(matches!(grid().binary(&bad, BinaryOp::Add), Err(Error::ShapeMismatch(_))));
    }

    #[test]
    fn integer_division_gives_floats() {
        let a = Array::from(vec![1i32, 2, 3]);
        let q = a.binary(&Array::from(2i32), BinaryOp::Div).unwrap();
        assert_eq!(q.dtype(), DType::F64);
        assert_eq!(q.to_f64_vec().unwrap(), vec![0.5, 1.0, 1.5]);
    }

    #[test]
    fn narrow_integers_wrap() {
        let a = Array::from(vec![200u8]);
        let b = a.binary(&Array::from(100u8), BinaryOp::Add).unwrap();
        assert_eq!(b.dtype(), DType::U8);
        assert_eq!(b.get(0), Some(Scalar::UInt(44)));
    }

    #[test]
    fn text_arithmetic_rejected() {
        let a = Array::from("abc");
        assert!(matches!(a.binary(&Array::from(1.0), BinaryOp::Add), Err(Error::DTypeMismatch(_))));
    }

    #[test]
    fn slab_and_assign() {
        let mut g = grid();
        let slab = Selection::from((1, 1..3)).resolve(g.shape()).unwrap();
        let part = g.slab(&slab).unwrap();
        assert_eq!(part.shape(), &[2]);
        assert_eq!(part.to_f64_vec().unwrap(), vec![5.0, 6.0]);
        g.assign(&slab, &Array::from(-1.0)).unwrap();
        assert_eq!(g.at(&[1, 2]), Some(Scalar::Float(-1.0)));
        assert_eq!(g.at(&[1, 3]), Some(Scalar::Float(7.0)));
    }

    #[test]
    fn reversed_slab() {
        let a = Array::arange(5);
        let slab = Hyperslab::new(vec![SlabDim { start: 4, count: 5, step: -1, keep: true }]);
        assert_eq!(a.slab(&slab).unwrap().to_f64_vec().unwrap(), vec![4.0, 3.0, 2.0, 1.0, 0.0]);
    }

    #[test]
    fn sums_over_axes() {
        let s = grid().sum_axes(&[0]).unwrap();
        assert_eq!(s.to_f64_vec().unwrap(), vec![12.0, 15.0, 18.0, 21.0]);
        let s = grid().sum_axes(&[1]).unwrap();
        assert_eq!(s.to_f64_vec().unwrap(), vec![6.0, 22.0, 38.0]);
        let total = grid().sum_axes(&[0, 1]).unwrap();
        assert_eq!(total.shape(), &[] as &[usize]);
        assert_eq!(total.item(), Some(Scalar::Float(66.0)));
    }

    #[test]
    fn transpose_reverses_axes() {
        let t = grid().transpose(None).unwrap();
        assert_eq!(t.shape(), &[4, 3]);
        assert_eq!(t.at(&[3, 1]), grid().at(&[1, 3]));
    }

    #[test]
    fn resize_keeps_flat_order() {
        let v = Array::arange(100).resize(&[2, 5, 10]);
        assert_eq!(v.shape(), &[2, 5, 10]);
        assert_eq!(v.at(&[1, 0, 3]), Some(Scalar::Int(53)));
        let grown = Array::arange(3).resize(&[5]);
        assert_eq!(grown.to_f64_vec().unwrap(), vec![0.0, 1.0, 2.0, 0.0, 0.0]);
    }

    #[test]
    fn display_nested() {
        let a = Array::from(vec![1i64, 2, 3, 4]).reshape(&[2, 2]).unwrap();
        assert_eq!(a.to_string(), "[[1 2] [3 4]]");
        assert_eq!(Array::from(2.5).to_string(), "2.5");
    }
}

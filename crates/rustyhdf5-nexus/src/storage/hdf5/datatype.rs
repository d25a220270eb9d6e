//! Datatype messages and element conversion.

use byteorder::{BigEndian, ByteOrder, LittleEndian};

use super::bytes::{corrupt, Decoder, Encoder, Sizes};
use crate::array::{DType, Data};
use crate::storage::{StorageError, StorageResult};

const CLASS_INT: u8 = 0;
const CLASS_FLOAT: u8 = 1;
const CLASS_STRING: u8 = 3;
const CLASS_BITFIELD: u8 = 4;
const CLASS_ENUM: u8 = 8;
const CLASS_VLEN: u8 = 9;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Datatype {
    Int { size: usize, signed: bool, big_endian: bool },
    Float { size: usize, big_endian: bool },
    /// Fixed-length string; NUL and space padding are stripped on read.
    FixedStr { size: usize },
    /// Variable-length string held in a global heap.
    VarStr,
    /// Two-member FALSE/TRUE enumeration.
    Bool { size: usize },
    Unsupported { size: usize, what: String },
}

impl Datatype {
    /// Type stored for new datasets of `dtype`.
    pub fn for_dtype(dtype: DType) -> Datatype {
        match dtype {
            DType::Bool => Datatype::Bool { size: 1 },
            DType::F32 | DType::F64 => Datatype::Float { size: dtype.itemsize(), big_endian: false },
            DType::Str => Datatype::VarStr,
            _ => Datatype::Int { size: dtype.itemsize(), signed: dtype.is_signed(), big_endian: false },
        }
    }

    /// Fixed-length string wide enough for every value in `values`.
    pub fn fixed_str_for(values: &[String]) -> Datatype {
        Datatype::FixedStr { size: values.iter().map(String::len).max().unwrap_or(0).max(1) }
    }

    pub fn parse(data: &[u8], sizes: Sizes) -> StorageResult<Datatype> {
        Self::parse_from(&mut Decoder::new(data, sizes))
    }

    fn parse_from(d: &mut Decoder<'_>) -> StorageResult<Datatype> {
        let head = d.u8()?;
        let (class, version) = (head & 0x0f, head >> 4);
        let bits = d.take(3)?;
        let (b0, b1) = (bits[0], bits[1]);
        let size = d.u32()? as usize;
        let big_endian = b0 & 0x01 != 0;
        let datatype = match class {
            CLASS_INT | CLASS_BITFIELD => {
                d.skip(4)?;
                match size {
                    1 | 2 | 4 | 8 => Datatype::Int { size, signed: class == CLASS_INT && b0 & 0x08 != 0, big_endian },
                    _ => Datatype::Unsupported { size, what: format!("{size} byte integers") },
                }
            }
            CLASS_FLOAT => {
                d.skip(12)?;
                match size {
                    4 | 8 => Datatype::Float { size, big_endian },
                    _ => Datatype::Unsupported { size, what: format!("{size} byte floats") },
                }
            }
            CLASS_STRING => Datatype::FixedStr { size },
            CLASS_ENUM => {
                let members = usize::from(u16::from_le_bytes([b0, b1]));
                let base = Self::parse_from(d)?;
                let mut names = Vec::with_capacity(members);
                for _ in 0..members {
                    let start = d.pos();
                    names.push(d.cstring()?);
                    if version < 3 {
                        let used = d.pos() - start;
                        d.skip((8 - used % 8) % 8)?;
                    }
                }
                let base_size = base.size(d.sizes());
                let mut values = Vec::with_capacity(members);
                for _ in 0..members {
                    values.push(d.uint(base_size.clamp(1, 8))?);
                }
                let is_bool = names.len() == 2
                    && names[0] == "FALSE"
                    && names[1] == "TRUE"
                    && values == [0, 1];
                match base {
                    Datatype::Int { size, .. } if is_bool => Datatype::Bool { size },
                    Datatype::Int { .. } => base,
                    _ => Datatype::Unsupported { size, what: "non-integer enumerations".into() },
                }
            }
            CLASS_VLEN => {
                // Base type of the sequence; strings always hold bytes.
                Self::parse_from(d)?;
                if b0 & 0x0f == 1 {
                    Datatype::VarStr
                } else {
                    Datatype::Unsupported { size, what: "variable-length sequences".into() }
                }
            }
            c => Datatype::Unsupported { size, what: format!("datatype class {c}") },
        };
        Ok(datatype)
    }

    pub fn encode(&self, sizes: Sizes) -> Vec<u8> {
        let mut e = Encoder::new(sizes);
        self.encode_into(&mut e, sizes);
        e.into_bytes()
    }

    fn encode_into(&self, e: &mut Encoder, sizes: Sizes) {
        match self {
            Datatype::Int { size, signed, big_endian } => {
                let bits = u8::from(*big_endian) | if *signed { 0x08 } else { 0 };
                e.u8(0x10 | CLASS_INT).u8(bits).u8(0).u8(0).u32(*size as u32);
                e.u16(0).u16((*size * 8) as u16);
            }
            Datatype::Float { size, big_endian } => {
                let (exp_at, exp_bits, mantissa, bias) = if *size == 4 { (23, 8, 23, 127) } else { (52, 11, 52, 1023) };
                e.u8(0x10 | CLASS_FLOAT).u8(0x20 | u8::from(*big_endian)).u8((*size * 8 - 1) as u8).u8(0);
                e.u32(*size as u32).u16(0).u16((*size * 8) as u16);
                e.u8(exp_at).u8(exp_bits).u8(0).u8(mantissa).u32(bias);
            }
            Datatype::FixedStr { size } => {
                // Null padded, UTF-8.
                e.u8(0x10 | CLASS_STRING).u8(0x11).u8(0).u8(0).u32(*size as u32);
            }
            Datatype::VarStr => {
                e.u8(0x10 | CLASS_VLEN).u8(0x01).u8(0x01).u8(0).u32(vlen_size(sizes) as u32);
                Datatype::Int { size: 1, signed: false, big_endian: false }.encode_into(e, sizes);
            }
            Datatype::Bool { size } => {
                e.u8(0x10 | CLASS_ENUM).u8(2).u8(0).u8(0).u32(*size as u32);
                Datatype::Int { size: *size, signed: true, big_endian: false }.encode_into(e, sizes);
                e.bytes(b"FALSE\0\0\0").bytes(b"TRUE\0\0\0\0");
                e.uint(0, *size).uint(1, *size);
            }
            Datatype::Unsupported { size, .. } => {
                // Opaque bytes of the same width.
                e.u8(0x10 | 5).u8(0).u8(0).u8(0).u32(*size as u32);
            }
        }
    }

    /// Bytes per stored element.
    pub fn size(&self, sizes: Sizes) -> usize {
        match self {
            Datatype::Int { size, .. }
            | Datatype::Float { size, .. }
            | Datatype::FixedStr { size }
            | Datatype::Bool { size }
            | Datatype::Unsupported { size, .. } => *size,
            Datatype::VarStr => vlen_size(sizes),
        }
    }

    pub fn dtype(&self) -> StorageResult<DType> {
        Ok(match self {
            Datatype::Int { size, signed: true, .. } => match size {
                1 => DType::I8,
                2 => DType::I16,
                4 => DType::I32,
                _ => DType::I64,
            },
            Datatype::Int { size, signed: false, .. } => match size {
                1 => DType::U8,
                2 => DType::U16,
                4 => DType::U32,
                _ => DType::U64,
            },
            Datatype::Float { size: 4, .. } => DType::F32,
            Datatype::Float { .. } => DType::F64,
            Datatype::FixedStr { .. } | Datatype::VarStr => DType::Str,
            Datatype::Bool { .. } => DType::Bool,
            Datatype::Unsupported { what, .. } => {
                return Err(StorageError::Invalid(format!("unsupported datatype: {what}")));
            }
        })
    }

    /// Decode `raw` into elements. `vlen` resolves one variable-length
    /// string reference.
    pub fn decode(
        &self,
        raw: &[u8],
        sizes: Sizes,
        vlen: &mut dyn FnMut(&[u8]) -> StorageResult<String>,
    ) -> StorageResult<Data> {
        let size = self.size(sizes).max(1);
        if raw.len() % size != 0 {
            return Err(corrupt(format!("{} bytes is not a whole number of {size} byte elements", raw.len())));
        }
        let elements = raw.chunks_exact(size);
        Ok(match self {
            Datatype::Int { size, signed: true, big_endian } => {
                Data::Int(elements.map(|b| read_int(b, *size, *big_endian)).collect())
            }
            Datatype::Int { size, signed: false, big_endian } => {
                Data::UInt(elements.map(|b| read_uint(b, *size, *big_endian)).collect())
            }
            Datatype::Float { size, big_endian } => Data::Float(
                elements
                    .map(|b| match (*size, *big_endian) {
                        (4, false) => f64::from(LittleEndian::read_f32(b)),
                        (4, true) => f64::from(BigEndian::read_f32(b)),
                        (_, false) => LittleEndian::read_f64(b),
                        (_, true) => BigEndian::read_f64(b),
                    })
                    .collect(),
            ),
            Datatype::FixedStr { .. } => Data::Text(elements.map(fixed_text).collect()),
            Datatype::VarStr => Data::Text(elements.map(|b| vlen(b)).collect::<StorageResult<_>>()?),
            Datatype::Bool { size } => Data::Bool(elements.map(|b| read_uint(b, *size, false) != 0).collect()),
            Datatype::Unsupported { what, .. } => {
                return Err(StorageError::Invalid(format!("unsupported datatype: {what}")));
            }
        })
    }

    /// Encode elements whose kind matches [`Datatype::dtype`]. `vlen` stores
    /// one string and returns its reference.
    pub fn encode_data(
        &self,
        data: &Data,
        sizes: Sizes,
        vlen: &mut dyn FnMut(&str) -> StorageResult<Vec<u8>>,
    ) -> StorageResult<Vec<u8>> {
        let width = self.size(sizes);
        let mut out = vec![0u8; data.len() * width];
        let slots = out.chunks_exact_mut(width.max(1));
        match (self, data) {
            (Datatype::Int { size, big_endian, .. }, Data::Int(values)) => {
                for (slot, &v) in slots.zip(values) {
                    write_uint(slot, v as u64, *size, *big_endian);
                }
            }
            (Datatype::Int { size, big_endian, .. }, Data::UInt(values)) => {
                for (slot, &v) in slots.zip(values) {
                    write_uint(slot, v, *size, *big_endian);
                }
            }
            (Datatype::Float { size, big_endian }, Data::Float(values)) => {
                for (slot, &v) in slots.zip(values) {
                    match (*size, *big_endian) {
                        (4, false) => LittleEndian::write_f32(slot, v as f32),
                        (4, true) => BigEndian::write_f32(slot, v as f32),
                        (_, false) => LittleEndian::write_f64(slot, v),
                        (_, true) => BigEndian::write_f64(slot, v),
                    }
                }
            }
            (Datatype::Bool { size }, Data::Bool(values)) => {
                for (slot, &v) in slots.zip(values) {
                    write_uint(slot, u64::from(v), *size, false);
                }
            }
            (Datatype::FixedStr { size }, Data::Text(values)) => {
                for (slot, v) in slots.zip(values) {
                    if v.len() > *size {
                        return Err(StorageError::Invalid(format!(
                            "'{v}' does not fit a {size} byte string"
                        )));
                    }
                    slot[..v.len()].copy_from_slice(v.as_bytes());
                }
            }
            (Datatype::VarStr, Data::Text(values)) => {
                for (slot, v) in slots.zip(values) {
                    slot.copy_from_slice(&vlen(v)?);
                }
            }
            (datatype, _) => {
                return Err(StorageError::Invalid(format!("cannot store these values as {datatype:?}")));
            }
        }
        Ok(out)
    }
}

/// Length, collection address and object index.
fn vlen_size(sizes: Sizes) -> usize {
    4 + usize::from(sizes.offset) + 4
}

fn read_int(b: &[u8], size: usize, big_endian: bool) -> i64 {
    if big_endian {
        BigEndian::read_int(b, size)
    } else {
        LittleEndian::read_int(b, size)
    }
}

fn read_uint(b: &[u8], size: usize, big_endian: bool) -> u64 {
    if big_endian {
        BigEndian::read_uint(b, size)
    } else {
        LittleEndian::read_uint(b, size)
    }
}

fn write_uint(slot: &mut [u8], v: u64, size: usize, big_endian: bool) {
    let v = if size >= 8 { v } else { v & ((1u64 << (8 * size)) - 1) };
    if big_endian {
        BigEndian::write_uint(slot, v, size);
    } else {
        LittleEndian::write_uint(slot, v, size);
    }
}

fn fixed_text(b: &[u8]) -> String {
    let end = b.iter().position(|&c| c == 0).unwrap_or(b.len());
    String::from_utf8_lossy(&b[..end]).trim_end_matches(' ').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const S: Sizes = Sizes::DEFAULT;

    fn no_vlen(_: &[u8]) -> StorageResult<String> {
        Err(corrupt("unexpected reference"))
    }

    #[test]
    fn every_array_dtype_survives_the_message() {
        for dtype in [
            DType::Bool,
            DType::I8,
            DType::I16,
            DType::I32,
            DType::I64,
            DType::U8,
            DType::U16,
            DType::U32,
            DType::U64,
            DType::F32,
            DType::F64,
            DType::Str,
        ] {
            let datatype = Datatype::for_dtype(dtype);
            let parsed = Datatype::parse(&datatype.encode(S), S).unwrap();
            assert_eq!(parsed, datatype);
            assert_eq!(parsed.dtype().unwrap(), dtype);
        }
    }

    #[test]
    fn float64_message_bytes() {
        let bytes = Datatype::Float { size: 8, big_endian: false }.encode(S);
        assert_eq!(
            bytes,
            vec![0x11, 0x20, 0x3f, 0, 8, 0, 0, 0, 0, 0, 64, 0, 52, 11, 0, 52, 0xff, 0x03, 0, 0]
        );
    }

    #[test]
    fn big_endian_integers() {
        let datatype = Datatype::Int { size: 2, signed: true, big_endian: true };
        let data = datatype.decode(&[0xff, 0xfe, 0x01, 0x00], S, &mut no_vlen).unwrap();
        assert_eq!(data, Data::Int(vec![-2, 256]));
        let raw = datatype.encode_data(&data, S, &mut |_| unreachable!()).unwrap();
        assert_eq!(raw, vec![0xff, 0xfe, 0x01, 0x00]);
    }

    #[test]
    fn fixed_strings_are_trimmed() {
        let datatype = Datatype::fixed_str_for(&["NXentry".into(), "NXdata".into()]);
        assert_eq!(datatype, Datatype::FixedStr { size: 7 });
        let data = Data::Text(vec!["NXentry".into(), "NXdata".into()]);
        let raw = datatype.encode_data(&data, S, &mut |_| unreachable!()).unwrap();
        assert_eq!(&raw[7..], b"NXdata\0");
        assert_eq!(datatype.decode(&raw, S, &mut no_vlen).unwrap(), data);
        assert_eq!(fixed_text(b"ab  "), "ab");
        let too_long = Data::Text(vec!["NXinstrument".into()]);
        assert!(datatype.encode_data(&too_long, S, &mut |_| unreachable!()).is_err());
    }

    #[test]
    fn other_enumerations_read_as_integers() {
        let mut e = Encoder::new(S);
        e.u8(0x18).u8(3).u8(0).u8(0).u32(1);
        e.bytes(&Datatype::Int { size: 1, signed: false, big_endian: false }.encode(S));
        e.bytes(b"RED\0\0\0\0\0GREEN\0\0\0BLUE\0\0\0\0").u8(0).u8(1).u8(2);
        assert_eq!(
            Datatype::parse(&e.into_bytes(), S).unwrap(),
            Datatype::Int { size: 1, signed: false, big_endian: false }
        );
    }

    #[test]
    fn compound_types_are_unsupported() {
        let mut e = Encoder::new(S);
        e.u8(0x16).u8(0).u8(0).u8(0).u32(12);
        let datatype = Datatype::parse(&e.into_bytes(), S).unwrap();
        assert_eq!(datatype.size(S), 12);
        assert!(datatype.dtype().is_err());
    }
}

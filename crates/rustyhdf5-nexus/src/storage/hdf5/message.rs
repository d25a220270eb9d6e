//! Header message bodies: dataspace, layout, filters, fill value, links,
//! attributes and the group bookkeeping messages.

use super::bytes::{corrupt, Decoder, Encoder, Sizes, UNDEFINED};
use super::datatype::Datatype;
use crate::storage::{StorageError, StorageResult};

/// Message type numbers.
pub(crate) mod kind {
    pub const NIL: u16 = 0x00;
    pub const DATASPACE: u16 = 0x01;
    pub const LINK_INFO: u16 = 0x02;
    pub const DATATYPE: u16 = 0x03;
    pub const FILL_OLD: u16 = 0x04;
    pub const FILL: u16 = 0x05;
    pub const LINK: u16 = 0x06;
    pub const LAYOUT: u16 = 0x08;
    pub const GROUP_INFO: u16 = 0x0a;
    pub const FILTERS: u16 = 0x0b;
    pub const ATTRIBUTE: u16 = 0x0c;
    pub const CONTINUATION: u16 = 0x10;
    pub const SYMBOL_TABLE: u16 = 0x11;
    pub const BTREE_K: u16 = 0x13;
    pub const ATTRIBUTE_INFO: u16 = 0x15;
    pub const REFCOUNT: u16 = 0x16;
}

/// Unlimited maximum dimension.
pub(crate) const UNLIMITED: u64 = u64::MAX;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Dataspace {
    pub dims: Vec<u64>,
    /// Per-dimension maximum, `UNLIMITED` for none.
    pub max: Option<Vec<u64>>,
    /// Null dataspace: no elements at all.
    pub null: bool,
}

impl Dataspace {
    pub fn simple(dims: &[usize], max: Option<Vec<u64>>) -> Dataspace {
        Dataspace { dims: dims.iter().map(|&n| n as u64).collect(), max, null: false }
    }

    pub fn parse(data: &[u8], sizes: Sizes) -> StorageResult<Dataspace> {
        let mut d = Decoder::new(data, sizes);
        let version = d.u8()?;
        let rank = usize::from(d.u8()?);
        let flags = d.u8()?;
        let null = match version {
            1 => {
                d.skip(5)?;
                false
            }
            2 => d.u8()? == 2,
            v => return Err(corrupt(format!("unsupported dataspace version {v}"))),
        };
        let dims = (0..rank).map(|_| d.length()).collect::<StorageResult<Vec<_>>>()?;
        let max = if flags & 0x01 != 0 {
            Some((0..rank).map(|_| d.length().map(|m| if m == len_ones(sizes) { UNLIMITED } else { m })).collect::<StorageResult<Vec<_>>>()?)
        } else {
            None
        };
        Ok(Dataspace { dims, max, null })
    }

    pub fn encode(&self, sizes: Sizes) -> Vec<u8> {
        let mut e = Encoder::new(sizes);
        let kind = if self.null {
            2
        } else if self.dims.is_empty() {
            0
        } else {
            1
        };
        e.u8(2).u8(self.dims.len() as u8).u8(u8::from(self.max.is_some())).u8(kind);
        for &n in &self.dims {
            e.length(n);
        }
        for &m in self.max.iter().flatten() {
            e.length(m);
        }
        e.into_bytes()
    }

    pub fn len(&self) -> u64 {
        if self.null {
            0
        } else {
            self.dims.iter().product()
        }
    }
}

fn len_ones(sizes: Sizes) -> u64 {
    if sizes.length >= 8 {
        u64::MAX
    } else {
        (1u64 << (8 * sizes.length)) - 1
    }
}

/// Where the raw data of a dataset lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Layout {
    Compact(Vec<u8>),
    Contiguous { addr: u64, size: u64 },
    /// Chunk dimensions exclude the trailing element-size dimension.
    Chunked { dims: Vec<u64>, btree: u64 },
    Unsupported(String),
}

impl Layout {
    pub fn parse(data: &[u8], sizes: Sizes) -> StorageResult<Layout> {
        let mut d = Decoder::new(data, sizes);
        let version = d.u8()?;
        match version {
            1 | 2 => {
                let rank = usize::from(d.u8()?);
                let class = d.u8()?;
                d.skip(5)?;
                let addr = if class == 0 { UNDEFINED } else { d.offset()? };
                let dims = (0..rank).map(|_| d.u32().map(u64::from)).collect::<StorageResult<Vec<_>>>()?;
                match class {
                    0 => {
                        let size = d.u32()? as usize;
                        Ok(Layout::Compact(d.take(size)?.to_vec()))
                    }
                    1 => Ok(Layout::Contiguous { addr, size: UNDEFINED }),
                    2 => Ok(Layout::Chunked { dims: dims[..rank.saturating_sub(1)].to_vec(), btree: addr }),
                    c => Err(corrupt(format!("unknown layout class {c}"))),
                }
            }
            3 | 4 => {
                let class = d.u8()?;
                match class {
                    0 => {
                        let size = usize::from(d.u16()?);
                        Ok(Layout::Compact(d.take(size)?.to_vec()))
                    }
                    1 => Ok(Layout::Contiguous { addr: d.offset()?, size: d.length()? }),
                    2 if version == 3 => {
                        let rank = usize::from(d.u8()?);
                        let btree = d.offset()?;
                        let dims = (0..rank).map(|_| d.u32().map(u64::from)).collect::<StorageResult<Vec<_>>>()?;
                        Ok(Layout::Chunked { dims: dims[..rank.saturating_sub(1)].to_vec(), btree })
                    }
                    2 => Ok(Layout::Unsupported("version 4 chunk indexes".into())),
                    3 => Ok(Layout::Unsupported("virtual datasets".into())),
                    c => Err(corrupt(format!("unknown layout class {c}"))),
                }
            }
            v => Err(corrupt(format!("unsupported layout version {v}"))),
        }
    }

    /// Version 3 message. `element_size` completes the chunk dimensions.
    pub fn encode(&self, element_size: usize, sizes: Sizes) -> StorageResult<Vec<u8>> {
        let mut e = Encoder::new(sizes);
        e.u8(3);
        match self {
            Layout::Compact(data) => {
                let size = u16::try_from(data.len())
                    .map_err(|_| StorageError::Invalid("compact data exceeds 64 KiB".into()))?;
                e.u8(0).u16(size).bytes(data);
            }
            Layout::Contiguous { addr, size } => {
                e.u8(1).offset(*addr).length(*size);
            }
            Layout::Chunked { dims, btree } => {
                e.u8(2).u8(dims.len() as u8 + 1).offset(*btree);
                for &n in dims {
                    e.u32(n as u32);
                }
                e.u32(element_size as u32);
            }
            Layout::Unsupported(what) => {
                return Err(StorageError::Invalid(format!("cannot rewrite a layout using {what}")));
            }
        }
        Ok(e.into_bytes())
    }
}

/// One entry of a filter pipeline message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FilterInfo {
    pub id: u16,
    /// Bit 0 marks the filter optional.
    pub flags: u16,
    pub name: Option<String>,
    pub values: Vec<u32>,
}

pub(crate) fn parse_filters(data: &[u8], sizes: Sizes) -> StorageResult<Vec<FilterInfo>> {
    let mut d = Decoder::new(data, sizes);
    let version = d.u8()?;
    let count = d.u8()?;
    if version == 1 {
        d.skip(6)?;
    }
    let mut filters = Vec::with_capacity(usize::from(count));
    for _ in 0..count {
        let id = d.u16()?;
        let name_len = if version == 1 || id >= 256 { usize::from(d.u16()?) } else { 0 };
        let flags = d.u16()?;
        let n_values = usize::from(d.u16()?);
        let name = if name_len > 0 {
            let raw = d.take(if version == 1 { (name_len + 7) / 8 * 8 } else { name_len })?;
            let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
            Some(String::from_utf8_lossy(&raw[..end]).into_owned())
        } else {
            None
        };
        let values = (0..n_values).map(|_| d.u32()).collect::<StorageResult<Vec<_>>>()?;
        if version == 1 && n_values % 2 == 1 {
            d.skip(4)?;
        }
        filters.push(FilterInfo { id, flags, name, values });
    }
    Ok(filters)
}

/// Version 2 pipeline message.
pub(crate) fn encode_filters(filters: &[FilterInfo], sizes: Sizes) -> Vec<u8> {
    let mut e = Encoder::new(sizes);
    e.u8(2).u8(filters.len() as u8);
    for filter in filters {
        e.u16(filter.id);
        let name = filter.name.as_deref().filter(|_| filter.id >= 256);
        if filter.id >= 256 {
            e.u16(name.map_or(0, |n| n.len() as u16 + 1));
        }
        e.u16(filter.flags).u16(filter.values.len() as u16);
        if let Some(name) = name {
            e.bytes(name.as_bytes()).u8(0);
        }
        for &v in &filter.values {
            e.u32(v);
        }
    }
    e.into_bytes()
}

/// Raw fill value bytes from either fill value message, if one is defined.
pub(crate) fn parse_fill(kind: u16, data: &[u8], sizes: Sizes) -> StorageResult<Option<Vec<u8>>> {
    let mut d = Decoder::new(data, sizes);
    if kind == kind::FILL_OLD {
        let size = d.u32()? as usize;
        return Ok(if size == 0 { None } else { Some(d.take(size)?.to_vec()) });
    }
    let version = d.u8()?;
    let defined = match version {
        1 | 2 => {
            d.u8()?;
            d.u8()?;
            let defined = d.u8()? != 0;
            if version == 2 && !defined {
                return Ok(None);
            }
            defined
        }
        3 => {
            let flags = d.u8()?;
            if flags & 0x20 == 0 {
                return Ok(None);
            }
            true
        }
        v => return Err(corrupt(format!("unsupported fill value version {v}"))),
    };
    let size = d.u32()? as usize;
    if !defined || size == 0 {
        return Ok(None);
    }
    Ok(Some(d.take(size)?.to_vec()))
}

/// Version 2 fill value message. Space is allocated early for contiguous
/// data and incrementally for chunked data.
pub(crate) fn encode_fill(value: Option<&[u8]>, chunked: bool, sizes: Sizes) -> Vec<u8> {
    let mut e = Encoder::new(sizes);
    e.u8(2).u8(if chunked { 3 } else { 1 }).u8(2);
    match value {
        Some(bytes) => {
            e.u8(1).u32(bytes.len() as u32).bytes(bytes);
        }
        None => {
            e.u8(0);
        }
    }
    e.into_bytes()
}

/// Destination of a link message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum LinkTarget {
    Hard(u64),
    Soft(String),
    External { file: String, path: String },
}

pub(crate) fn parse_link(data: &[u8], sizes: Sizes) -> StorageResult<(String, LinkTarget)> {
    let mut d = Decoder::new(data, sizes);
    let version = d.u8()?;
    if version != 1 {
        return Err(corrupt(format!("unsupported link message version {version}")));
    }
    let flags = d.u8()?;
    let link_type = if flags & 0x08 != 0 { d.u8()? } else { 0 };
    if flags & 0x04 != 0 {
        d.u64()?;
    }
    if flags & 0x10 != 0 {
        d.u8()?;
    }
    let name_len = d.uint(1 << (flags & 0x03))? as usize;
    let name = String::from_utf8_lossy(d.take(name_len)?).into_owned();
    let target = match link_type {
        0 => LinkTarget::Hard(d.offset()?),
        1 => {
            let len = usize::from(d.u16()?);
            LinkTarget::Soft(String::from_utf8_lossy(d.take(len)?).into_owned())
        }
        64 => {
            let len = usize::from(d.u16()?);
            let mut v = Decoder::new(d.take(len)?, sizes);
            v.u8()?;
            let file = v.cstring()?;
            let path = v.cstring()?;
            LinkTarget::External { file, path }
        }
        t => return Err(corrupt(format!("unsupported link type {t} for '{name}'"))),
    };
    Ok((name, target))
}

pub(crate) fn encode_link(name: &str, target: &LinkTarget, sizes: Sizes) -> StorageResult<Vec<u8>> {
    let name_len = name.len();
    let width: u8 = match name_len {
        0 => return Err(StorageError::Invalid("link names cannot be empty".into())),
        1..=0xff => 0,
        0x100..=0xffff => 1,
        _ => 2,
    };
    let link_type = match target {
        LinkTarget::Hard(_) => 0u8,
        LinkTarget::Soft(_) => 1,
        LinkTarget::External { .. } => 64,
    };
    let utf8 = !name.is_ascii();
    let mut flags = width;
    if link_type != 0 {
        flags |= 0x08;
    }
    if utf8 {
        flags |= 0x10;
    }
    let mut e = Encoder::new(sizes);
    e.u8(1).u8(flags);
    if link_type != 0 {
        e.u8(link_type);
    }
    if utf8 {
        e.u8(1);
    }
    e.uint(name_len as u64, 1 << width).bytes(name.as_bytes());
    match target {
        LinkTarget::Hard(addr) => {
            e.offset(*addr);
        }
        LinkTarget::Soft(path) => {
            e.u16(short_len(path.len())?).bytes(path.as_bytes());
        }
        LinkTarget::External { file, path } => {
            e.u16(short_len(file.len() + path.len() + 3)?).u8(0);
            e.bytes(file.as_bytes()).u8(0).bytes(path.as_bytes()).u8(0);
        }
    }
    Ok(e.into_bytes())
}

fn short_len(n: usize) -> StorageResult<u16> {
    u16::try_from(n).map_err(|_| StorageError::Invalid(format!("link value of {n} bytes is too long")))
}

/// Link info message for compact link storage, without creation order.
pub(crate) fn encode_link_info(sizes: Sizes) -> Vec<u8> {
    let mut e = Encoder::new(sizes);
    e.u8(0).u8(0).offset(UNDEFINED).offset(UNDEFINED);
    e.into_bytes()
}

/// Address of the fractal heap holding dense links, if any.
pub(crate) fn parse_link_info(data: &[u8], sizes: Sizes) -> StorageResult<u64> {
    let mut d = Decoder::new(data, sizes);
    d.u8()?;
    let flags = d.u8()?;
    if flags & 0x01 != 0 {
        d.u64()?;
    }
    d.offset()
}

/// Group info message with default phase changes.
pub(crate) fn encode_group_info() -> Vec<u8> {
    vec![0, 0]
}

/// Address of the fractal heap holding dense attributes, if any.
pub(crate) fn parse_attribute_info(data: &[u8], sizes: Sizes) -> StorageResult<u64> {
    let mut d = Decoder::new(data, sizes);
    d.u8()?;
    let flags = d.u8()?;
    if flags & 0x01 != 0 {
        d.u16()?;
    }
    d.offset()
}

/// B-tree and local heap of an old-style group.
pub(crate) fn parse_symbol_table(data: &[u8], sizes: Sizes) -> StorageResult<(u64, u64)> {
    let mut d = Decoder::new(data, sizes);
    Ok((d.offset()?, d.offset()?))
}

/// Chunk index K from a superblock extension's B-tree K message.
pub(crate) fn parse_btree_k(data: &[u8], sizes: Sizes) -> StorageResult<u16> {
    let mut d = Decoder::new(data, sizes);
    d.u8()?;
    d.u16()
}

/// An attribute as stored: name, type, shape and raw element bytes.
#[derive(Debug, Clone)]
pub(crate) struct RawAttribute {
    pub name: String,
    pub datatype: Datatype,
    pub space: Dataspace,
    pub data: Vec<u8>,
}

pub(crate) fn parse_attribute(data: &[u8], sizes: Sizes) -> StorageResult<RawAttribute> {
    let mut d = Decoder::new(data, sizes);
    let version = d.u8()?;
    let flags = d.u8()?;
    let name_len = usize::from(d.u16()?);
    let type_len = usize::from(d.u16()?);
    let space_len = usize::from(d.u16()?);
    if version == 3 {
        d.u8()?;
    }
    if !(1..=3).contains(&version) {
        return Err(corrupt(format!("unsupported attribute version {version}")));
    }
    if flags & 0x03 != 0 {
        return Err(StorageError::Invalid("shared attribute types are not supported".into()));
    }
    let pad = |n: usize| if version == 1 { (n + 7) / 8 * 8 } else { n };
    let raw_name = d.take(pad(name_len))?;
    let end = raw_name.iter().position(|&b| b == 0).unwrap_or(name_len.min(raw_name.len()));
    let name = String::from_utf8_lossy(&raw_name[..end]).into_owned();
    let datatype = Datatype::parse(d.take(pad(type_len))?, sizes)?;
    let space = Dataspace::parse(d.take(pad(space_len))?, sizes)?;
    let size = (space.len() as usize).saturating_mul(datatype.size(sizes));
    let data = d.take(size.min(d.remaining()))?.to_vec();
    if data.len() < size {
        return Err(corrupt(format!("attribute '{name}' is truncated")));
    }
    Ok(RawAttribute { name, datatype, space, data })
}

/// Version 3 attribute message.
pub(crate) fn encode_attribute(attr: &RawAttribute, sizes: Sizes) -> StorageResult<Vec<u8>> {
    let datatype = attr.datatype.encode(sizes);
    let space = attr.space.encode(sizes);
    let name_len = u16::try_from(attr.name.len() + 1)
        .map_err(|_| StorageError::Invalid(format!("attribute name '{}' is too long", attr.name)))?;
    let mut e = Encoder::new(sizes);
    e.u8(3).u8(0).u16(name_len).u16(datatype.len() as u16).u16(space.len() as u16);
    e.u8(u8::from(!attr.name.is_ascii()));
    e.bytes(attr.name.as_bytes()).u8(0).bytes(&datatype).bytes(&space).bytes(&attr.data);
    Ok(e.into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    const S: Sizes = Sizes::DEFAULT;

    #[test]
    fn dataspace_with_unlimited_maximum() {
        let space = Dataspace::simple(&[3, 4], Some(vec![UNLIMITED, 4]));
        let parsed = Dataspace::parse(&space.encode(S), S).unwrap();
        assert_eq!(parsed, space);
        assert_eq!(parsed.len(), 12);
        let scalar = Dataspace::simple(&[], None);
        assert_eq!(Dataspace::parse(&scalar.encode(S), S).unwrap().len(), 1);
    }

    #[test]
    fn version1_dataspace() {
        let mut e = Encoder::new(S);
        e.u8(1).u8(1).u8(1).zeros(5).length(10).length(u64::MAX);
        let space = Dataspace::parse(&e.into_bytes(), S).unwrap();
        assert_eq!(space.dims, vec![10]);
        assert_eq!(space.max, Some(vec![UNLIMITED]));
    }

    #[test]
    fn layouts() {
        let chunked = Layout::Chunked { dims: vec![8, 4], btree: UNDEFINED };
        let bytes = chunked.encode(8, S).unwrap();
        assert_eq!(Layout::parse(&bytes, S).unwrap(), chunked);
        let contiguous = Layout::Contiguous { addr: 4096, size: 80 };
        assert_eq!(Layout::parse(&contiguous.encode(8, S).unwrap(), S).unwrap(), contiguous);
        let compact = Layout::Compact(vec![1, 2, 3]);
        assert_eq!(Layout::parse(&compact.encode(1, S).unwrap(), S).unwrap(), compact);
    }

    #[test]
    fn filter_pipelines() {
        let filters = vec![
            FilterInfo { id: 2, flags: 1, name: None, values: vec![8] },
            FilterInfo { id: 1, flags: 1, name: None, values: vec![6] },
            FilterInfo { id: 32001, flags: 0, name: Some("blosc".into()), values: vec![2, 2, 8] },
        ];
        assert_eq!(parse_filters(&encode_filters(&filters, S), S).unwrap(), filters);

        // Version 1 pads names to eight bytes and odd value lists to even.
        let mut e = Encoder::new(S);
        e.u8(1).u8(1).zeros(6).u16(1).u16(8).u16(0).u16(1).bytes(b"deflate\0").u32(9).u32(0);
        let v1 = parse_filters(&e.into_bytes(), S).unwrap();
        assert_eq!(v1[0].name.as_deref(), Some("deflate"));
        assert_eq!(v1[0].values, vec![9]);
    }

    #[test]
    fn fill_values() {
        let bytes = encode_fill(Some(&[1, 0, 0, 0]), false, S);
        assert_eq!(parse_fill(kind::FILL, &bytes, S).unwrap(), Some(vec![1, 0, 0, 0]));
        assert_eq!(parse_fill(kind::FILL, &encode_fill(None, true, S), S).unwrap(), None);
        assert_eq!(parse_fill(kind::FILL, &[3, 0x20 | 0x02, 2, 0, 0, 0, 7, 0], S).unwrap(), Some(vec![7, 0]));
    }

    #[test]
    fn links_of_every_kind() {
        for target in [
            LinkTarget::Hard(800),
            LinkTarget::Soft("/entry/data".into()),
            LinkTarget::External { file: "raw.nxs".into(), path: "/entry/counts".into() },
        ] {
            let bytes = encode_link("détecteur", &target, S).unwrap();
            let (name, parsed) = parse_link(&bytes, S).unwrap();
            assert_eq!(name, "détecteur");
            assert_eq!(parsed, target);
        }
        assert!(encode_link("", &LinkTarget::Hard(0), S).is_err());
    }

    #[test]
    fn version1_attribute_is_padded() {
        let datatype = Datatype::Int { size: 4, signed: true, big_endian: false }.encode(S);
        let space = Dataspace::simple(&[], None).encode(S);
        let mut e = Encoder::new(S);
        e.u8(1).u8(0).u16(6).u16(datatype.len() as u16).u16(space.len() as u16);
        e.bytes(b"units\0").align(8).bytes(&datatype).align(8).bytes(&space).align(8).u32(42);
        let attr = parse_attribute(&e.into_bytes(), S).unwrap();
        assert_eq!(attr.name, "units");
        assert_eq!(attr.data, 42u32.to_le_bytes());
    }
}

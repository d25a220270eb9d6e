//! Little-endian cursors over metadata blocks.
//!
//! Addresses and lengths are stored with the widths the superblock declares;
//! an address of all one bits is undefined and reads back as [`UNDEFINED`]
//! whatever its width.

use byteorder::{ByteOrder, LittleEndian};

use crate::storage::{StorageError, StorageResult};

/// Undefined address.
pub(crate) const UNDEFINED: u64 = u64::MAX;

/// Widths of file addresses and object lengths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Sizes {
    pub offset: u8,
    pub length: u8,
}

impl Sizes {
    pub const DEFAULT: Sizes = Sizes { offset: 8, length: 8 };

    pub fn new(offset: u8, length: u8) -> StorageResult<Sizes> {
        for size in [offset, length] {
            if !matches!(size, 2 | 4 | 8) {
                return Err(corrupt(format!("invalid address width {size}")));
            }
        }
        Ok(Sizes { offset, length })
    }
}

pub(crate) fn corrupt(msg: impl Into<String>) -> StorageError {
    StorageError::Corrupt(msg.into())
}

/// Random access to the bytes of a file.
pub(crate) trait ReadAt {
    fn read_at(&self, addr: u64, len: usize) -> StorageResult<Vec<u8>>;
}

impl ReadAt for [u8] {
    fn read_at(&self, addr: u64, len: usize) -> StorageResult<Vec<u8>> {
        let start = usize::try_from(addr).map_err(|_| corrupt(format!("address {addr:#x} out of range")))?;
        self.get(start..start.saturating_add(len))
            .map(<[u8]>::to_vec)
            .ok_or_else(|| corrupt(format!("{len} bytes at {addr:#x} past end of file")))
    }
}

impl ReadAt for Vec<u8> {
    fn read_at(&self, addr: u64, len: usize) -> StorageResult<Vec<u8>> {
        self.as_slice().read_at(addr, len)
    }
}

pub(crate) struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
    sizes: Sizes,
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8], sizes: Sizes) -> Self {
        Self { buf, pos: 0, sizes }
    }

    pub fn sizes(&self) -> Sizes {
        self.sizes
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    pub fn take(&mut self, n: usize) -> StorageResult<&'a [u8]> {
        let end = self.pos.checked_add(n).filter(|&end| end <= self.buf.len()).ok_or_else(|| {
            corrupt(format!("truncated block: need {n} bytes at {}, have {}", self.pos, self.remaining()))
        })?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub fn skip(&mut self, n: usize) -> StorageResult<()> {
        self.take(n).map(|_| ())
    }

    /// Advance to the next multiple of `align` from the start of the block.
    pub fn align(&mut self, align: usize) -> StorageResult<()> {
        let pad = (align - self.pos % align) % align;
        self.skip(pad.min(self.remaining()))
    }

    pub fn u8(&mut self) -> StorageResult<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> StorageResult<u16> {
        Ok(LittleEndian::read_u16(self.take(2)?))
    }

    pub fn u32(&mut self) -> StorageResult<u32> {
        Ok(LittleEndian::read_u32(self.take(4)?))
    }

    pub fn u64(&mut self) -> StorageResult<u64> {
        Ok(LittleEndian::read_u64(self.take(8)?))
    }

    pub fn uint(&mut self, width: usize) -> StorageResult<u64> {
        if width == 0 || width > 8 {
            return Err(corrupt(format!("invalid integer width {width}")));
        }
        Ok(LittleEndian::read_uint(self.take(width)?, width))
    }

    pub fn offset(&mut self) -> StorageResult<u64> {
        let width = usize::from(self.sizes.offset);
        let value = self.uint(width)?;
        Ok(if value == all_ones(width) { UNDEFINED } else { value })
    }

    pub fn length(&mut self) -> StorageResult<u64> {
        self.uint(usize::from(self.sizes.length))
    }

    pub fn signature(&mut self, expected: &[u8; 4]) -> StorageResult<()> {
        let found = self.take(4)?;
        if found != expected {
            return Err(corrupt(format!(
                "expected signature {}, found {:?}",
                String::from_utf8_lossy(expected),
                String::from_utf8_lossy(found)
            )));
        }
        Ok(())
    }

    /// NUL-terminated string.
    pub fn cstring(&mut self) -> StorageResult<String> {
        let rest = &self.buf[self.pos.min(self.buf.len())..];
        let len = rest.iter().position(|&b| b == 0).ok_or_else(|| corrupt("unterminated string"))?;
        let text = String::from_utf8_lossy(&rest[..len]).into_owned();
        self.pos += len + 1;
        Ok(text)
    }
}

fn all_ones(width: usize) -> u64 {
    if width >= 8 {
        u64::MAX
    } else {
        (1u64 << (8 * width)) - 1
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Encoder {
    buf: Vec<u8>,
    sizes: Sizes,
}

impl Encoder {
    pub fn new(sizes: Sizes) -> Self {
        Self { buf: Vec::new(), sizes }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn bytes(&mut self, data: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(data);
        self
    }

    pub fn zeros(&mut self, n: usize) -> &mut Self {
        self.buf.resize(self.buf.len() + n, 0);
        self
    }

    /// Pad with zeros to a multiple of `align`.
    pub fn align(&mut self, align: usize) -> &mut Self {
        let pad = (align - self.buf.len() % align) % align;
        self.zeros(pad)
    }

    pub fn u8(&mut self, v: u8) -> &mut Self {
        self.buf.push(v);
        self
    }

    pub fn u16(&mut self, v: u16) -> &mut Self {
        let mut b = [0u8; 2];
        LittleEndian::write_u16(&mut b, v);
        self.bytes(&b)
    }

    pub fn u32(&mut self, v: u32) -> &mut Self {
        let mut b = [0u8; 4];
        LittleEndian::write_u32(&mut b, v);
        self.bytes(&b)
    }

    pub fn u64(&mut self, v: u64) -> &mut Self {
        let mut b = [0u8; 8];
        LittleEndian::write_u64(&mut b, v);
        self.bytes(&b)
    }

    pub fn uint(&mut self, v: u64, width: usize) -> &mut Self {
        let mut b = [0u8; 8];
        LittleEndian::write_u64(&mut b, v & all_ones(width));
        self.bytes(&b[..width.min(8)])
    }

    pub fn offset(&mut self, v: u64) -> &mut Self {
        self.uint(v, usize::from(self.sizes.offset))
    }

    pub fn length(&mut self, v: u64) -> &mut Self {
        self.uint(v, usize::from(self.sizes.length))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn undefined_addresses_at_any_width() {
        let sizes = Sizes::new(4, 4).unwrap();
        let mut enc = Encoder::new(sizes);
        enc.offset(UNDEFINED).offset(0x1234).length(7);
        let bytes = enc.into_bytes();
        assert_eq!(bytes.len(), 12);
        let mut dec = Decoder::new(&bytes, sizes);
        assert_eq!(dec.offset().unwrap(), UNDEFINED);
        assert_eq!(dec.offset().unwrap(), 0x1234);
        assert_eq!(dec.length().unwrap(), 7);
        assert!(dec.u8().is_err());
    }

    #[test]
    fn strings_and_alignment() {
        let mut dec = Decoder::new(b"abc\0\0\0\0\0xy", Sizes::DEFAULT);
        assert_eq!(dec.cstring().unwrap(), "abc");
        dec.align(8).unwrap();
        assert_eq!(dec.take(2).unwrap(), b"xy");
        assert!(Sizes::new(3, 8).is_err());
    }
}

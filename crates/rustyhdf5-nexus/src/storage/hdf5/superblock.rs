//! Superblock versions 0 to 3.
//!
//! The superblock sits at byte 0 or after a user block at 512, 1024, 2048...
//! Every other address in the file is relative to its base address.

use super::bytes::{corrupt, Decoder, Encoder, ReadAt, Sizes, UNDEFINED};
use super::checksum::lookup3;
use crate::storage::StorageResult;

pub(crate) const SIGNATURE: [u8; 8] = *b"\x89HDF\r\n\x1a\n";

/// Default K of chunk index B-trees.
pub(crate) const DEFAULT_CHUNK_K: u16 = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Superblock {
    pub version: u8,
    pub sizes: Sizes,
    /// Byte position of the signature.
    pub at: u64,
    pub base: u64,
    /// End of allocated space, relative to `base`.
    pub eof: u64,
    /// Object header of the root group.
    pub root: u64,
    pub group_leaf_k: u16,
    pub group_internal_k: u16,
    pub chunk_k: u16,
    pub free_space: u64,
    pub driver_info: u64,
    pub extension: u64,
    pub flags: u32,
}

impl Superblock {
    /// Version 0 superblock for a new file.
    pub fn new(root: u64, eof: u64) -> Superblock {
        Superblock {
            version: 0,
            sizes: Sizes::DEFAULT,
            at: 0,
            base: 0,
            eof,
            root,
            group_leaf_k: 4,
            group_internal_k: 16,
            chunk_k: DEFAULT_CHUNK_K,
            free_space: UNDEFINED,
            driver_info: UNDEFINED,
            extension: UNDEFINED,
            flags: 0,
        }
    }

    /// Find and parse the superblock of a file of `file_len` bytes.
    pub fn locate(src: &dyn ReadAt, file_len: u64) -> StorageResult<Superblock> {
        let mut at = 0u64;
        while at + SIGNATURE.len() as u64 <= file_len {
            let window = (file_len - at).min(256) as usize;
            let buf = src.read_at(at, window)?;
            if buf.starts_with(&SIGNATURE) {
                return Self::parse(&buf, at);
            }
            at = if at == 0 { 512 } else { at * 2 };
        }
        Err(corrupt("not an HDF5 file: signature not found"))
    }

    /// Parse a superblock from `buf`, which starts at its signature.
    pub fn parse(buf: &[u8], at: u64) -> StorageResult<Superblock> {
        let mut d = Decoder::new(buf, Sizes::DEFAULT);
        if d.take(8)? != SIGNATURE {
            return Err(corrupt("not an HDF5 file: bad signature"));
        }
        let version = d.u8()?;
        match version {
            0 | 1 => Self::parse_v0(buf, at, version),
            2 | 3 => Self::parse_v2(buf, at, version),
            v => Err(corrupt(format!("unsupported superblock version {v}"))),
        }
    }

    fn parse_v0(buf: &[u8], at: u64, version: u8) -> StorageResult<Superblock> {
        let mut d = Decoder::new(buf, Sizes::DEFAULT);
        d.skip(13)?;
        let sizes = Sizes::new(d.u8()?, d.u8()?)?;
        d.skip(1)?;
        let group_leaf_k = d.u16()?;
        let group_internal_k = d.u16()?;
        let flags = d.u32()?;
        let chunk_k = if version == 1 {
            let k = d.u16()?;
            d.skip(2)?;
            k
        } else {
            DEFAULT_CHUNK_K
        };
        let mut d = Decoder::new(&buf[d.pos()..], sizes);
        let base = d.offset()?;
        let free_space = d.offset()?;
        let eof = d.offset()?;
        let driver_info = d.offset()?;
        // Root symbol table entry: name offset, then the header address.
        d.offset()?;
        let root = d.offset()?;
        Ok(Superblock {
            version,
            sizes,
            at,
            base: if base == UNDEFINED { at } else { base },
            eof,
            root,
            group_leaf_k,
            group_internal_k,
            chunk_k,
            free_space,
            driver_info,
            extension: UNDEFINED,
            flags,
        })
    }

    fn parse_v2(buf: &[u8], at: u64, version: u8) -> StorageResult<Superblock> {
        let mut d = Decoder::new(buf, Sizes::DEFAULT);
        d.skip(9)?;
        let sizes = Sizes::new(d.u8()?, d.u8()?)?;
        let flags = u32::from(d.u8()?);
        let mut d = Decoder::new(buf, sizes);
        d.skip(12)?;
        let base = d.offset()?;
        let extension = d.offset()?;
        let eof = d.offset()?;
        let root = d.offset()?;
        let end = d.pos();
        let stored = d.u32()?;
        let computed = lookup3(&buf[..end]);
        if stored != computed {
            return Err(corrupt(format!(
                "superblock checksum mismatch: stored {stored:#010x}, computed {computed:#010x}"
            )));
        }
        Ok(Superblock {
            version,
            sizes,
            at,
            base,
            eof,
            root,
            group_leaf_k: 4,
            group_internal_k: 16,
            chunk_k: DEFAULT_CHUNK_K,
            free_space: UNDEFINED,
            driver_info: UNDEFINED,
            extension,
            flags,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut e = Encoder::new(self.sizes);
        e.bytes(&SIGNATURE).u8(self.version);
        if self.version >= 2 {
            e.u8(self.sizes.offset).u8(self.sizes.length).u8(self.flags as u8);
            e.offset(self.base).offset(self.extension).offset(self.eof).offset(self.root);
            let sum = lookup3(&e.clone().into_bytes());
            e.u32(sum);
            return e.into_bytes();
        }
        e.u8(0).u8(0).u8(0).u8(0);
        e.u8(self.sizes.offset).u8(self.sizes.length).u8(0);
        e.u16(self.group_leaf_k).u16(self.group_internal_k).u32(self.flags);
        if self.version == 1 {
            e.u16(self.chunk_k).u16(0);
        }
        e.offset(self.base).offset(self.free_space).offset(self.eof).offset(self.driver_info);
        // Root entry without cached group information.
        e.offset(0).offset(self.root).u32(0).u32(0).zeros(16);
        e.into_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version0_layout() {
        let sb = Superblock::new(96, 4096);
        let bytes = sb.encode();
        assert_eq!(bytes.len(), 96);
        assert_eq!(&bytes[..8], &SIGNATURE);
        assert_eq!(Superblock::parse(&bytes, 0).unwrap(), sb);
    }

    #[test]
    fn version2_checksum_is_verified() {
        let mut sb = Superblock::new(48, 1000);
        sb.version = 2;
        let mut bytes = sb.encode();
        assert_eq!(bytes.len(), 48);
        let parsed = Superblock::parse(&bytes, 0).unwrap();
        assert_eq!(parsed.root, 48);
        assert_eq!(parsed.eof, 1000);
        bytes[20] ^= 1;
        assert!(Superblock::parse(&bytes, 0).is_err());
    }

    #[test]
    fn located_after_user_block() {
        let mut file = vec![0u8; 512];
        file.extend(Superblock::new(96, 200).encode());
        let sb = Superblock::locate(&file, file.len() as u64).unwrap();
        assert_eq!(sb.at, 512);
        assert!(Superblock::locate(&vec![0u8; 600], 600).is_err());
    }
}

//! Global heap collections, where variable-length strings live.
//!
//! A string element is a reference: its byte length, the address of a
//! collection and the index of an object inside it.

use std::collections::HashMap;

use super::bytes::{corrupt, Decoder, Encoder, ReadAt, Sizes, UNDEFINED};
use crate::storage::StorageResult;

const GCOL: [u8; 4] = *b"GCOL";

/// Smallest collection written.
const MIN_COLLECTION: usize = 4096;

fn pad8(n: usize) -> usize {
    (n + 7) / 8 * 8
}

/// Resolves string references, reading each collection once.
pub(crate) struct HeapReader<'a> {
    src: &'a dyn ReadAt,
    sizes: Sizes,
    collections: HashMap<u64, HashMap<u16, Vec<u8>>>,
}

impl<'a> HeapReader<'a> {
    pub fn new(src: &'a dyn ReadAt, sizes: Sizes) -> Self {
        Self { src, sizes, collections: HashMap::new() }
    }

    pub fn string(&mut self, reference: &[u8]) -> StorageResult<String> {
        let mut d = Decoder::new(reference, self.sizes);
        let len = d.u32()? as usize;
        let addr = d.offset()?;
        let index = d.u32()?;
        if len == 0 || addr == 0 || addr == UNDEFINED {
            return Ok(String::new());
        }
        if !self.collections.contains_key(&addr) {
            let collection = self.read_collection(addr)?;
            self.collections.insert(addr, collection);
        }
        let object = u16::try_from(index)
            .ok()
            .and_then(|i| self.collections.get(&addr)?.get(&i))
            .ok_or_else(|| corrupt(format!("global heap object {index} missing from {addr:#x}")))?;
        let bytes = object.get(..len).unwrap_or(object);
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }

    fn read_collection(&self, addr: u64) -> StorageResult<HashMap<u16, Vec<u8>>> {
        let head_len = 8 + usize::from(self.sizes.length);
        let head = self.src.read_at(addr, head_len)?;
        let mut d = Decoder::new(&head, self.sizes);
        d.signature(&GCOL)?;
        let version = d.u8()?;
        if version != 1 {
            return Err(corrupt(format!("unsupported global heap version {version}")));
        }
        d.skip(3)?;
        let size = usize::try_from(d.length()?).map_err(|_| corrupt("global heap too large"))?;
        let body = self.src.read_at(addr + head_len as u64, size.saturating_sub(head_len))?;
        let mut d = Decoder::new(&body, self.sizes);
        let mut objects = HashMap::new();
        while d.remaining() >= 8 + usize::from(self.sizes.length) {
            let index = d.u16()?;
            if index == 0 {
                break;
            }
            d.u16()?;
            d.skip(4)?;
            let len = usize::try_from(d.length()?).map_err(|_| corrupt("global heap object too large"))?;
            let data = d.take(len)?.to_vec();
            d.skip((pad8(len) - len).min(d.remaining()))?;
            objects.insert(index, data);
        }
        Ok(objects)
    }
}

/// Pack `values` into collections laid out from `addr`. Returns one
/// reference per value and the bytes to write at `addr`.
pub(crate) fn pack(values: &[&str], addr: u64, sizes: Sizes) -> (Vec<Vec<u8>>, Vec<u8>) {
    let length = usize::from(sizes.length);
    let head_len = 8 + length;
    let object_head = 8 + length;
    let mut refs = Vec::with_capacity(values.len());
    let mut out = Vec::new();
    let mut pending: Vec<&str> = Vec::new();
    let mut pending_size = head_len;

    let flush = |pending: &mut Vec<&str>, used: usize, out: &mut Vec<u8>| {
        if pending.is_empty() {
            return;
        }
        let size = used.max(MIN_COLLECTION);
        let mut e = Encoder::new(sizes);
        e.bytes(&GCOL).u8(1).zeros(3).length(size as u64);
        for (i, value) in pending.iter().enumerate() {
            e.u16(i as u16 + 1).u16(0).zeros(4).length(value.len() as u64);
            e.bytes(value.as_bytes()).align(8);
        }
        let free = size - e.len();
        if free >= object_head {
            e.u16(0).u16(0).zeros(4).length(free as u64);
        }
        let mut bytes = e.into_bytes();
        bytes.resize(size, 0);
        out.extend(bytes);
        pending.clear();
    };

    for &value in values {
        if value.is_empty() {
            refs.push(reference(0, 0, 0, sizes));
            continue;
        }
        let needed = object_head + pad8(value.len());
        if pending.len() == usize::from(u16::MAX) || (!pending.is_empty() && pending_size + needed > MIN_COLLECTION) {
            flush(&mut pending, pending_size, &mut out);
            pending_size = head_len;
        }
        let collection = addr + out.len() as u64;
        pending.push(value);
        pending_size += needed;
        refs.push(reference(value.len(), collection, pending.len(), sizes));
    }
    flush(&mut pending, pending_size, &mut out);
    (refs, out)
}

fn reference(len: usize, addr: u64, index: usize, sizes: Sizes) -> Vec<u8> {
    let mut e = Encoder::new(sizes);
    e.u32(len as u32).offset(addr).u32(index as u32);
    e.into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    const S: Sizes = Sizes::DEFAULT;

    #[test]
    fn packed_strings_resolve() {
        let values = ["counts", "", "détecteur"];
        let base = 256u64;
        let (refs, bytes) = pack(&values, base, S);
        assert_eq!(bytes.len(), MIN_COLLECTION);
        let mut file = vec![0u8; base as usize];
        file.extend(bytes);
        let mut reader = HeapReader::new(&file, S);
        let read: Vec<String> = refs.iter().map(|r| reader.string(r).unwrap()).collect();
        assert_eq!(read, values);
    }

    #[test]
    fn large_values_span_collections() {
        let long = "x".repeat(3000);
        let values = [long.as_str(), long.as_str(), "tail"];
        let (refs, bytes) = pack(&values, 8, S);
        assert_eq!(bytes.len(), 2 * MIN_COLLECTION);
        let mut file = vec![0u8; 8];
        file.extend(bytes);
        let mut reader = HeapReader::new(&file, S);
        assert_eq!(reader.string(&refs[0]).unwrap(), long);
        assert_eq!(reader.string(&refs[1]).unwrap(), long);
        assert_eq!(reader.string(&refs[2]).unwrap(), "tail");
        assert_eq!(reader.collections.len(), 2);
    }

    #[test]
    fn missing_object_is_corrupt() {
        let (_, bytes) = pack(&["a"], 8, S);
        let mut file = vec![0u8; 8];
        file.extend(bytes);
        let mut reader = HeapReader::new(&file, S);
        assert_eq!(reader.string(&reference(1, 8, 1, S)).unwrap(), "a");
        assert!(reader.string(&reference(1, 8, 9, S)).is_err());
        // Address zero never holds a collection.
        assert_eq!(reader.string(&reference(1, 0, 1, S)).unwrap(), "");
    }
}

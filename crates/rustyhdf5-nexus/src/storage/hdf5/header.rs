//! Object headers.
//!
//! Both header versions are read, following continuation blocks. Headers
//! are always written as version 1: a 16 byte prefix and one block of
//! messages, each padded to eight bytes.

use super::bytes::{corrupt, Decoder, Encoder, ReadAt, Sizes};
use super::checksum::lookup3;
use super::message::kind;
use crate::storage::{StorageError, StorageResult};

const OHDR: [u8; 4] = *b"OHDR";
const OCHK: [u8; 4] = *b"OCHK";

/// Guard against continuation cycles.
const MAX_BLOCKS: usize = 4096;

/// Smallest message area written, as the reference library does.
const MIN_BODY: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Message {
    pub kind: u16,
    pub flags: u8,
    pub data: Vec<u8>,
}

impl Message {
    pub fn new(kind: u16, data: Vec<u8>) -> Message {
        Message { kind, flags: 0, data }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Header {
    pub version: u8,
    /// Number of hard links to the object.
    pub refcount: u32,
    pub messages: Vec<Message>,
}

impl Header {
    pub fn find(&self, kind: u16) -> Option<&Message> {
        self.messages.iter().find(|m| m.kind == kind)
    }
}

/// Read the object header at `addr` with every continuation block.
pub(crate) fn read(src: &dyn ReadAt, addr: u64, sizes: Sizes) -> StorageResult<Header> {
    let head = src.read_at(addr, 4)?;
    if head == OHDR {
        read_v2(src, addr, sizes)
    } else if head[0] == 1 {
        read_v1(src, addr, sizes)
    } else {
        Err(corrupt(format!("unknown object header version {} at {addr:#x}", head[0])))
    }
}

fn read_v1(src: &dyn ReadAt, addr: u64, sizes: Sizes) -> StorageResult<Header> {
    let prefix = src.read_at(addr, 16)?;
    let mut d = Decoder::new(&prefix, sizes);
    d.skip(2)?;
    let count = d.u16()?;
    let refcount = d.u32()?;
    let size = d.u32()?;
    let mut messages = Vec::with_capacity(usize::from(count));
    let mut blocks = vec![(addr + 16, u64::from(size))];
    let mut seen = 0;
    while let Some((at, len)) = blocks.pop() {
        seen += 1;
        if seen > MAX_BLOCKS {
            return Err(corrupt(format!("object header at {addr:#x} has too many blocks")));
        }
        let block = src.read_at(at, to_usize(len)?)?;
        let mut d = Decoder::new(&block, sizes);
        while d.remaining() >= 8 {
            let kind = d.u16()?;
            let size = usize::from(d.u16()?);
            let flags = d.u8()?;
            d.skip(3)?;
            let data = d.take(size)?.to_vec();
            collect(kind, flags, data, sizes, &mut messages, &mut blocks)?;
        }
    }
    Ok(Header { version: 1, refcount, messages })
}

fn read_v2(src: &dyn ReadAt, addr: u64, sizes: Sizes) -> StorageResult<Header> {
    let start = src.read_at(addr, 6)?;
    let flags = start[5];
    let mut prefix_len = 6;
    if flags & 0x20 != 0 {
        prefix_len += 16;
    }
    if flags & 0x10 != 0 {
        prefix_len += 4;
    }
    let width = 1usize << (flags & 0x03);
    let prefix = src.read_at(addr, prefix_len + width)?;
    let chunk_len = to_usize(Decoder::new(&prefix[prefix_len..], sizes).uint(width)?)?;
    let prefix_len = prefix_len + width;
    let body = src.read_at(addr + prefix_len as u64, chunk_len + 4)?;
    let mut covered = prefix;
    covered.extend_from_slice(&body[..chunk_len]);
    verify(&covered, &body[chunk_len..], addr)?;

    let ordered = flags & 0x04 != 0;
    let mut messages = Vec::new();
    let mut blocks = Vec::new();
    parse_v2_block(&body[..chunk_len], ordered, sizes, &mut messages, &mut blocks)?;
    let mut seen = 0;
    while let Some((at, len)) = blocks.pop() {
        seen += 1;
        if seen > MAX_BLOCKS {
            return Err(corrupt(format!("object header at {addr:#x} has too many blocks")));
        }
        let block = src.read_at(at, to_usize(len)?)?;
        if block.len() < 8 || block[..4] != OCHK {
            return Err(corrupt(format!("bad continuation block at {at:#x}")));
        }
        let end = block.len() - 4;
        verify(&block[..end], &block[end..], at)?;
        parse_v2_block(&block[4..end], ordered, sizes, &mut messages, &mut blocks)?;
    }
    let refcount = match messages.iter().find(|m| m.kind == kind::REFCOUNT) {
        Some(m) => {
            let mut d = Decoder::new(&m.data, sizes);
            d.u8()?;
            d.u32()?
        }
        None => 1,
    };
    Ok(Header { version: 2, refcount, messages })
}

fn parse_v2_block(
    block: &[u8],
    ordered: bool,
    sizes: Sizes,
    messages: &mut Vec<Message>,
    blocks: &mut Vec<(u64, u64)>,
) -> StorageResult<()> {
    let head = if ordered { 6 } else { 4 };
    let mut d = Decoder::new(block, sizes);
    while d.remaining() >= head {
        let kind = u16::from(d.u8()?);
        let size = usize::from(d.u16()?);
        let flags = d.u8()?;
        if ordered {
            d.u16()?;
        }
        let data = d.take(size)?.to_vec();
        collect(kind, flags, data, sizes, messages, blocks)?;
    }
    Ok(())
}

fn collect(
    kind: u16,
    flags: u8,
    data: Vec<u8>,
    sizes: Sizes,
    messages: &mut Vec<Message>,
    blocks: &mut Vec<(u64, u64)>,
) -> StorageResult<()> {
    match kind {
        kind::NIL => {}
        kind::CONTINUATION => {
            let mut d = Decoder::new(&data, sizes);
            blocks.push((d.offset()?, d.length()?));
        }
        _ => messages.push(Message { kind, flags, data }),
    }
    Ok(())
}

fn verify(covered: &[u8], stored: &[u8], at: u64) -> StorageResult<()> {
    let stored = Decoder::new(stored, Sizes::DEFAULT).u32()?;
    let computed = lookup3(covered);
    if stored != computed {
        return Err(corrupt(format!(
            "object header checksum mismatch at {at:#x}: stored {stored:#010x}, computed {computed:#010x}"
        )));
    }
    Ok(())
}

fn to_usize(n: u64) -> StorageResult<usize> {
    usize::try_from(n).map_err(|_| corrupt(format!("block length {n} out of range")))
}

/// Encode a version 1 header holding `messages`.
pub(crate) fn encode(messages: &[Message], refcount: u32, sizes: Sizes) -> StorageResult<Vec<u8>> {
    let mut body = Encoder::new(sizes);
    let mut count = 0u16;
    for message in messages {
        let padded = (message.data.len() + 7) / 8 * 8;
        let size = u16::try_from(padded).map_err(|_| {
            StorageError::Invalid(format!(
                "header message of {} bytes exceeds the 64 KiB limit",
                message.data.len()
            ))
        })?;
        body.u16(message.kind).u16(size).u8(message.flags).zeros(3);
        body.bytes(&message.data).zeros(padded - message.data.len());
        count += 1;
    }
    if body.len() < MIN_BODY {
        let fill = MIN_BODY - body.len() - 8;
        body.u16(kind::NIL).u16(fill as u16).u8(0).zeros(3).zeros(fill);
        count += 1;
    }
    let body = body.into_bytes();
    let size = u32::try_from(body.len())
        .map_err(|_| StorageError::Invalid("object header exceeds 4 GiB".into()))?;
    let mut e = Encoder::new(sizes);
    e.u8(1).u8(0).u16(count).u32(refcount).u32(size).zeros(4).bytes(&body);
    Ok(e.into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(kind: u16, data: &[u8]) -> Message {
        Message::new(kind, data.to_vec())
    }

    #[test]
    fn version1_round_trip() {
        let messages = vec![msg(kind::DATASPACE, &[2, 1, 0, 0, 5, 0, 0, 0, 0, 0, 0, 0]), msg(0x12, b"mtime")];
        let bytes = encode(&messages, 1, Sizes::DEFAULT).unwrap();
        assert_eq!(bytes.len() % 8, 0);
        let header = read(&bytes, 0, Sizes::DEFAULT).unwrap();
        assert_eq!(header.version, 1);
        assert_eq!(header.refcount, 1);
        assert_eq!(header.messages.len(), 2);
        assert_eq!(&header.messages[1].data[..5], b"mtime");
    }

    #[test]
    fn small_headers_are_padded() {
        let bytes = encode(&[], 1, Sizes::DEFAULT).unwrap();
        assert_eq!(bytes.len(), 16 + MIN_BODY);
        assert!(read(&bytes, 0, Sizes::DEFAULT).unwrap().messages.is_empty());
    }

    #[test]
    fn oversized_message_is_refused() {
        let big = msg(kind::ATTRIBUTE, &vec![0u8; 70_000]);
        assert!(matches!(encode(&[big], 1, Sizes::DEFAULT), Err(StorageError::Invalid(_))));
    }

    /// Version 2 header with one message and a continuation block after it.
    fn version2_file() -> Vec<u8> {
        let sizes = Sizes::DEFAULT;
        let mut chunk = Encoder::new(sizes);
        chunk.u8(0x12).u16(4).u8(0).bytes(b"time");
        let cont_at = 64u64;
        let mut cont_body = Encoder::new(sizes);
        cont_body.bytes(&OCHK).u8(0x0c).u16(3).u8(0).bytes(b"abc");
        let mut cont = cont_body.into_bytes();
        let sum = lookup3(&cont);
        cont.extend_from_slice(&sum.to_le_bytes());
        chunk.u8(kind::CONTINUATION as u8).u16(16).u8(0).offset(cont_at).length(cont.len() as u64);

        let chunk = chunk.into_bytes();
        let mut head = Encoder::new(sizes);
        head.bytes(&OHDR).u8(2).u8(0).u8(chunk.len() as u8).bytes(&chunk);
        let mut file = head.into_bytes();
        let sum = lookup3(&file);
        file.extend_from_slice(&sum.to_le_bytes());
        file.resize(cont_at as usize, 0);
        file.extend(cont);
        file
    }

    #[test]
    fn version2_with_continuation() {
        let file = version2_file();
        let header = read(&file, 0, Sizes::DEFAULT).unwrap();
        assert_eq!(header.version, 2);
        assert_eq!(header.refcount, 1);
        let kinds: Vec<u16> = header.messages.iter().map(|m| m.kind).collect();
        assert_eq!(kinds, vec![0x12, kind::ATTRIBUTE]);
        assert_eq!(header.find(kind::ATTRIBUTE).unwrap().data, b"abc");
    }

    #[test]
    fn version2_checksum_mismatch() {
        let mut file = version2_file();
        file[10] ^= 0xff;
        assert!(matches!(read(&file, 0, Sizes::DEFAULT), Err(StorageError::Corrupt(_))));
    }
}

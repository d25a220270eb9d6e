//! Version 1 B-trees: old-style group indexes (type 0) with their symbol
//! table nodes and local heaps, and chunk indexes (type 1).

use super::bytes::{corrupt, Decoder, Encoder, ReadAt, Sizes, UNDEFINED};
use super::message::LinkTarget;
use crate::storage::StorageResult;

const TREE: [u8; 4] = *b"TREE";
const SNOD: [u8; 4] = *b"SNOD";
const HEAP: [u8; 4] = *b"HEAP";

/// Deepest tree followed before the file is declared corrupt.
const MAX_DEPTH: u8 = 64;

/// Symbol table entry caching a soft link value.
const CACHE_SOFT_LINK: u32 = 2;

struct Node {
    level: u8,
    keys: Vec<Vec<u8>>,
    children: Vec<u64>,
}

fn read_node(src: &dyn ReadAt, addr: u64, node_type: u8, key_size: usize, sizes: Sizes) -> StorageResult<Node> {
    let os = usize::from(sizes.offset);
    let head = src.read_at(addr, 8 + 2 * os)?;
    let mut d = Decoder::new(&head, sizes);
    d.signature(&TREE)?;
    let found = d.u8()?;
    if found != node_type {
        return Err(corrupt(format!("B-tree node at {addr:#x} has type {found}, expected {node_type}")));
    }
    let level = d.u8()?;
    let entries = usize::from(d.u16()?);
    let body = src.read_at(addr + head.len() as u64, entries * (key_size + os) + key_size)?;
    let mut d = Decoder::new(&body, sizes);
    let mut keys = Vec::with_capacity(entries + 1);
    let mut children = Vec::with_capacity(entries);
    for _ in 0..entries {
        keys.push(d.take(key_size)?.to_vec());
        children.push(d.offset()?);
    }
    keys.push(d.take(key_size)?.to_vec());
    Ok(Node { level, keys, children })
}

/// Leaf children of the tree at `addr`, left to right.
fn leaves(
    src: &dyn ReadAt,
    addr: u64,
    node_type: u8,
    key_size: usize,
    sizes: Sizes,
) -> StorageResult<Vec<(Vec<u8>, u64)>> {
    let mut out = Vec::new();
    let mut stack = vec![(addr, MAX_DEPTH)];
    while let Some((addr, budget)) = stack.pop() {
        if budget == 0 {
            return Err(corrupt(format!("B-tree at {addr:#x} is too deep")));
        }
        let node = read_node(src, addr, node_type, key_size, sizes)?;
        if node.level == 0 {
            out.extend(node.keys.into_iter().zip(node.children));
        } else {
            stack.extend(node.children.into_iter().rev().map(|child| (child, budget - 1)));
        }
    }
    Ok(out)
}

/// Links of an old-style group.
pub(crate) fn read_group(
    src: &dyn ReadAt,
    btree: u64,
    heap: u64,
    sizes: Sizes,
) -> StorageResult<Vec<(String, LinkTarget)>> {
    let names = read_local_heap(src, heap, sizes)?;
    let name_at = |offset: u64| -> StorageResult<String> {
        let start = usize::try_from(offset).ok().filter(|&s| s < names.len());
        let start = start.ok_or_else(|| corrupt(format!("name offset {offset} outside the local heap")))?;
        Decoder::new(&names[start..], sizes).cstring()
    };
    let os = usize::from(sizes.offset);
    let entry_size = 2 * os + 24;
    let mut links = Vec::new();
    for (_, snod) in leaves(src, btree, 0, usize::from(sizes.length), sizes)? {
        let head = src.read_at(snod, 8)?;
        let mut d = Decoder::new(&head, sizes);
        d.signature(&SNOD)?;
        d.skip(2)?;
        let count = usize::from(d.u16()?);
        let body = src.read_at(snod + 8, count * entry_size)?;
        let mut d = Decoder::new(&body, sizes);
        for _ in 0..count {
            let name = name_at(d.offset()?)?;
            let header = d.offset()?;
            let cache = d.u32()?;
            d.skip(4)?;
            let scratch = d.take(16)?;
            let target = if cache == CACHE_SOFT_LINK {
                LinkTarget::Soft(name_at(u64::from(Decoder::new(scratch, sizes).u32()?))?)
            } else {
                LinkTarget::Hard(header)
            };
            links.push((name, target));
        }
    }
    Ok(links)
}

fn read_local_heap(src: &dyn ReadAt, addr: u64, sizes: Sizes) -> StorageResult<Vec<u8>> {
    let head = src.read_at(addr, 8 + 2 * usize::from(sizes.length) + usize::from(sizes.offset))?;
    let mut d = Decoder::new(&head, sizes);
    d.signature(&HEAP)?;
    d.skip(4)?;
    let size = usize::try_from(d.length()?).map_err(|_| corrupt("local heap too large"))?;
    d.length()?;
    let data = d.offset()?;
    src.read_at(data, size)
}

/// One stored chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ChunkRecord {
    /// Element coordinates of the chunk's first element.
    pub offset: Vec<u64>,
    /// Stored size after filtering.
    pub size: u32,
    /// Filters not applied to this chunk.
    pub mask: u32,
    pub addr: u64,
}

fn chunk_key_size(rank: usize) -> usize {
    8 + 8 * (rank + 1)
}

/// Every chunk of the index at `addr`, for a dataset of `rank` dimensions.
pub(crate) fn read_chunks(src: &dyn ReadAt, addr: u64, rank: usize, sizes: Sizes) -> StorageResult<Vec<ChunkRecord>> {
    if addr == UNDEFINED {
        return Ok(Vec::new());
    }
    leaves(src, addr, 1, chunk_key_size(rank), sizes)?
        .into_iter()
        .map(|(key, addr)| {
            let mut d = Decoder::new(&key, sizes);
            let size = d.u32()?;
            let mask = d.u32()?;
            let offset = (0..rank).map(|_| d.u64()).collect::<StorageResult<Vec<_>>>()?;
            Ok(ChunkRecord { offset, size, mask, addr })
        })
        .collect()
}

/// Encode a chunk index over `records`, sorted by offset, with its nodes
/// laid out from `base`. Returns the root address and the bytes to write
/// at `base`; an empty index has no nodes and an undefined root.
pub(crate) fn encode_chunks(
    records: &[ChunkRecord],
    chunk_dims: &[u64],
    k: u16,
    base: u64,
    sizes: Sizes,
) -> (u64, Vec<u8>) {
    if records.is_empty() {
        return (UNDEFINED, Vec::new());
    }
    let rank = chunk_dims.len();
    let key_size = chunk_key_size(rank);
    let fanout = 2 * usize::from(k.max(1));
    let os = usize::from(sizes.offset);
    let node_size = (8 + 2 * os + (fanout + 1) * key_size + fanout * os) as u64;

    let key = |size: u32, mask: u32, offset: &[u64]| -> Vec<u8> {
        let mut e = Encoder::new(sizes);
        e.u32(size).u32(mask);
        for &o in offset {
            e.u64(o);
        }
        e.u64(0);
        e.into_bytes()
    };
    let Some(last) = records.last() else {
        return (UNDEFINED, Vec::new());
    };
    let end: Vec<u64> = last.offset.iter().zip(chunk_dims).map(|(o, d)| o + d).collect();
    let mut entries: Vec<(Vec<u8>, u64)> = records.iter().map(|r| (key(r.size, r.mask, &r.offset), r.addr)).collect();
    let mut right = key(0, 0, &end);

    let mut out = Vec::new();
    let mut level = 0u8;
    loop {
        let groups: Vec<&[(Vec<u8>, u64)]> = entries.chunks(fanout).collect();
        let first = base + out.len() as u64;
        let mut parents = Vec::with_capacity(groups.len());
        for (i, group) in groups.iter().enumerate() {
            let addr = first + i as u64 * node_size;
            let left = if i == 0 { UNDEFINED } else { addr - node_size };
            let next = if i + 1 == groups.len() { UNDEFINED } else { addr + node_size };
            let upper = groups.get(i + 1).map_or(&right, |g| &g[0].0);
            let mut e = Encoder::new(sizes);
            e.bytes(&TREE).u8(1).u8(level).u16(group.len() as u16).offset(left).offset(next);
            for (entry_key, child) in group.iter() {
                e.bytes(entry_key).offset(*child);
            }
            e.bytes(upper);
            let mut bytes = e.into_bytes();
            bytes.resize(node_size as usize, 0);
            out.extend(bytes);
            parents.push((group[0].0.clone(), addr));
        }
        if parents.len() == 1 {
            return (parents[0].1, out);
        }
        // Internal keys carry no chunk size.
        for (entry_key, _) in &mut parents {
            entry_key[..4].fill(0);
        }
        right[..4].fill(0);
        entries = parents;
        level += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const S: Sizes = Sizes::DEFAULT;

    fn records(n: u64) -> Vec<ChunkRecord> {
        (0..n).map(|i| ChunkRecord { offset: vec![i * 10, 0], size: 80, mask: 0, addr: 10_000 + i * 80 }).collect()
    }

    #[test]
    fn single_leaf_index() {
        let records = records(3);
        let (root, bytes) = encode_chunks(&records, &[10, 4], 32, 512, S);
        assert_eq!(root, 512);
        let mut file = vec![0u8; 512];
        file.extend(bytes);
        assert_eq!(read_chunks(&file, root, 2, S).unwrap(), records);
    }

    #[test]
    fn multi_level_index() {
        let records = records(40);
        let (root, bytes) = encode_chunks(&records, &[10, 4], 4, 64, S);
        let mut file = vec![0u8; 64];
        file.extend(bytes);
        // 40 entries, 8 per leaf: five leaves under one root.
        let node_size = 8 + 16 + 9 * chunk_key_size(2) + 8 * 8;
        assert_eq!(file.len() - 64, 6 * node_size);
        assert_eq!(root, 64 + 5 * node_size as u64);
        let root_node = read_node(&file, root, 1, chunk_key_size(2), S).unwrap();
        assert_eq!(root_node.level, 1);
        assert_eq!(root_node.children.len(), 5);
        assert_eq!(read_chunks(&file, root, 2, S).unwrap(), records);
    }

    #[test]
    fn empty_index_has_no_root() {
        assert_eq!(encode_chunks(&[], &[4], 32, 0, S), (UNDEFINED, Vec::new()));
        assert!(read_chunks(&Vec::new(), UNDEFINED, 1, S).unwrap().is_empty());
    }

    /// Old-style group: one B-tree leaf, one symbol table node and a local
    /// heap holding the names and a soft link value.
    fn old_style_group() -> (Vec<u8>, u64, u64) {
        let mut heap_data = Encoder::new(S);
        heap_data.u8(0).align(8);
        let data_at = heap_data.len() as u64;
        heap_data.bytes(b"data\0").align(8);
        let link_at = heap_data.len() as u64;
        heap_data.bytes(b"link\0").align(8);
        let value_at = heap_data.len() as u64;
        heap_data.bytes(b"/entry/data\0").align(8);
        let heap_data = heap_data.into_bytes();

        let (heap_addr, heap_data_addr, snod_addr, tree_addr) = (0u64, 40u64, 200u64, 400u64);
        let mut file = Encoder::new(S);
        file.bytes(&HEAP).u8(0).zeros(3).length(heap_data.len() as u64).length(UNDEFINED).offset(heap_data_addr);
        let mut file = file.into_bytes();
        file.resize(heap_data_addr as usize, 0);
        file.extend(&heap_data);
        file.resize(snod_addr as usize, 0);

        let mut snod = Encoder::new(S);
        snod.bytes(&SNOD).u8(1).u8(0).u16(2);
        snod.offset(data_at).offset(800).u32(0).u32(0).zeros(16);
        snod.offset(link_at).offset(UNDEFINED).u32(CACHE_SOFT_LINK).u32(0).u32(value_at as u32).zeros(12);
        file.extend(snod.into_bytes());
        file.resize(tree_addr as usize, 0);

        let mut tree = Encoder::new(S);
        tree.bytes(&TREE).u8(0).u8(0).u16(1).offset(UNDEFINED).offset(UNDEFINED);
        tree.length(0).offset(snod_addr).length(link_at);
        file.extend(tree.into_bytes());
        (file, tree_addr, heap_addr)
    }

    #[test]
    fn old_style_group_links() {
        let (file, tree, heap) = old_style_group();
        let links = read_group(&file, tree, heap, S).unwrap();
        assert_eq!(
            links,
            vec![
                ("data".to_string(), LinkTarget::Hard(800)),
                ("link".to_string(), LinkTarget::Soft("/entry/data".into())),
            ]
        );
    }

    #[test]
    fn wrong_node_type_is_corrupt() {
        let (file, tree, _) = old_style_group();
        assert!(read_chunks(&file, tree, 1, S).is_err());
    }
}

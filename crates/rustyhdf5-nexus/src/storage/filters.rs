//! Chunk filters: shuffle, deflate and a fletcher32 trailer.
//!
//! Filters run forward when a chunk is stored and in reverse when it is read
//! back. Identifiers and byte formats are those of the HDF5 filter registry.

use super::{DatasetLayout, StorageError, StorageResult};

pub const FILTER_DEFLATE: u16 = 1;
pub const FILTER_SHUFFLE: u16 = 2;
pub const FILTER_FLETCHER32: u16 = 3;
pub const FILTER_SCALEOFFSET: u16 = 6;

/// Deflate level used when a layout does not give one.
pub const DEFAULT_LEVEL: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Filter {
    pub id: u16,
    /// Deflate level, or the scale factor bits for scaleoffset.
    pub level: u32,
}

/// Ordered list of filters applied to one payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Pipeline {
    pub filters: Vec<Filter>,
}

impl Pipeline {
    /// Filters requested by a dataset layout, in storage order.
    pub fn for_layout(layout: &DatasetLayout) -> StorageResult<Pipeline> {
        let mut filters = Vec::new();
        if layout.shuffle {
            filters.push(Filter { id: FILTER_SHUFFLE, level: 0 });
        }
        match layout.compression.as_deref() {
            None => {}
            Some("gzip" | "zlib" | "deflate") => filters.push(Filter {
                id: FILTER_DEFLATE,
                level: layout.compression_opts.unwrap_or(DEFAULT_LEVEL).min(9),
            }),
            Some(other) => {
                return Err(StorageError::Invalid(format!("unsupported compression '{other}'")));
            }
        }
        if layout.fletcher32 {
            filters.push(Filter { id: FILTER_FLETCHER32, level: 0 });
        }
        if let Some(factor) = layout.scaleoffset {
            filters.insert(0, Filter { id: FILTER_SCALEOFFSET, level: factor as u32 });
        }
        Ok(Pipeline { filters })
    }

    /// Mask of the filters [`Pipeline::encode`] leaves out. Scaleoffset is
    /// recorded on the dataset but chunks are stored without it.
    pub fn skip_mask(&self) -> u32 {
        self.filters
            .iter()
            .take(32)
            .enumerate()
            .filter(|(_, f)| f.id == FILTER_SCALEOFFSET)
            .fold(0, |mask, (i, _)| mask | 1 << i)
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Apply every filter in order, except those in [`Pipeline::skip_mask`].
    pub fn encode(&self, data: &[u8], element_size: usize) -> StorageResult<Vec<u8>> {
        let mut out = data.to_vec();
        for filter in &self.filters {
            out = match filter.id {
                FILTER_SCALEOFFSET => out,
                FILTER_SHUFFLE => shuffle(&out, element_size)?,
                FILTER_DEFLATE => deflate(&out, filter.level)?,
                FILTER_FLETCHER32 => {
                    let sum = fletcher32(&out);
                    out.extend_from_slice(&sum.to_le_bytes());
                    out
                }
                other => return Err(unsupported(other)),
            };
        }
        Ok(out)
    }

    /// Undo every filter in reverse order. Bit `i` of `skip` marks filter
    /// `i` as not applied to this chunk.
    pub fn decode(&self, data: &[u8], element_size: usize, skip: u32) -> StorageResult<Vec<u8>> {
        let mut out = data.to_vec();
        for (i, filter) in self.filters.iter().enumerate().rev() {
            if i < 32 && skip & (1 << i) != 0 {
                continue;
            }
            out = match filter.id {
                FILTER_SHUFFLE => unshuffle(&out, element_size)?,
                FILTER_DEFLATE => inflate(&out)?,
                FILTER_FLETCHER32 => strip_fletcher32(out)?,
                other => return Err(unsupported(other)),
            };
        }
        Ok(out)
    }
}

fn unsupported(id: u16) -> StorageError {
    StorageError::Invalid(format!("unsupported filter {id}"))
}

#[cfg(feature = "deflate")]
fn deflate(data: &[u8], level: u32) -> StorageResult<Vec<u8>> {
    use std::io::Write;
    let mut encoder = flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::new(level));
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

#[cfg(feature = "deflate")]
fn inflate(data: &[u8]) -> StorageResult<Vec<u8>> {
    use std::io::Read;
    let mut out = Vec::new();
    flate2::read::ZlibDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(|e| StorageError::Corrupt(format!("deflate: {e}")))?;
    Ok(out)
}

#[cfg(not(feature = "deflate"))]
fn deflate(_data: &[u8], _level: u32) -> StorageResult<Vec<u8>> {
    Err(unsupported(FILTER_DEFLATE))
}

#[cfg(not(feature = "deflate"))]
fn inflate(_data: &[u8]) -> StorageResult<Vec<u8>> {
    Err(unsupported(FILTER_DEFLATE))
}

/// Group byte `j` of every element together.
fn shuffle(data: &[u8], size: usize) -> StorageResult<Vec<u8>> {
    if size <= 1 {
        return Ok(data.to_vec());
    }
    if data.len() % size != 0 {
        return Err(StorageError::Corrupt("shuffle: length not a multiple of element size".into()));
    }
    let n = data.len() / size;
    let mut out = vec![0u8; data.len()];
    for (i, element) in data.chunks_exact(size).enumerate() {
        for (j, &byte) in element.iter().enumerate() {
            out[j * n + i] = byte;
        }
    }
    Ok(out)
}

fn unshuffle(data: &[u8], size: usize) -> StorageResult<Vec<u8>> {
    if size <= 1 {
        return Ok(data.to_vec());
    }
    if data.len() % size != 0 {
        return Err(StorageError::Corrupt("shuffle: length not a multiple of element size".into()));
    }
    let n = data.len() / size;
    let mut out = vec![0u8; data.len()];
    for (j, plane) in data.chunks_exact(n.max(1)).enumerate().take(size) {
        for (i, &byte) in plane.iter().enumerate() {
            out[i * size + j] = byte;
        }
    }
    Ok(out)
}

/// Fletcher32 over big-endian 16-bit words, folded every 360 words. An odd
/// trailing byte counts as the high byte of a last word.
pub(crate) fn fletcher32(data: &[u8]) -> u32 {
    let fold = |x: u32| (x & 0xffff) + (x >> 16);
    let (mut sum1, mut sum2) = (0u32, 0u32);
    let words = data.chunks_exact(2);
    let odd = words.remainder().first().copied();
    let words: Vec<u32> = words.map(|w| u32::from(w[0]) << 8 | u32::from(w[1])).collect();
    for block in words.chunks(360) {
        for &word in block {
            sum1 += word;
            sum2 += sum1;
        }
        sum1 = fold(sum1);
        sum2 = fold(sum2);
    }
    if let Some(byte) = odd {
        sum1 += u32::from(byte) << 8;
        sum2 += sum1;
        sum1 = fold(sum1);
        sum2 = fold(sum2);
    }
    (fold(sum2) << 16) | fold(sum1)
}

fn strip_fletcher32(mut data: Vec<u8>) -> StorageResult<Vec<u8>> {
    if data.len() < 4 {
        return Err(StorageError::Corrupt("fletcher32: payload too short".into()));
    }
    let tail = data.split_off(data.len() - 4);
    let stored = u32::from_le_bytes([tail[0], tail[1], tail[2], tail[3]]);
    let computed = fletcher32(&data);
    // Checksums written by old big-endian writers are byte swapped.
    if stored != computed && stored != computed.swap_bytes() {
        return Err(StorageError::Corrupt(format!(
            "fletcher32 mismatch: stored {stored:#010x}, computed {computed:#010x}"
        )));
    }
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::DType;

    fn layout() -> DatasetLayout {
        let mut layout = DatasetLayout::new(DType::F64, &[64]);
        layout.compression = Some("gzip".into());
        layout.shuffle = true;
        layout.fletcher32 = true;
        layout
    }

    #[test]
    fn pipeline_order_follows_layout() {
        let p = Pipeline::for_layout(&layout()).unwrap();
        let ids: Vec<u16> = p.filters.iter().map(|f| f.id).collect();
        assert_eq!(ids, vec![FILTER_SHUFFLE, FILTER_DEFLATE, FILTER_FLETCHER32]);
        assert_eq!(p.filters[1].level, DEFAULT_LEVEL);
        assert_eq!(p.skip_mask(), 0);
    }

    #[test]
    fn scaleoffset_is_listed_but_skipped() {
        let mut l = DatasetLayout::new(DType::I32, &[4]);
        l.scaleoffset = Some(2);
        l.fletcher32 = true;
        let p = Pipeline::for_layout(&l).unwrap();
        assert_eq!(p.filters[0], Filter { id: FILTER_SCALEOFFSET, level: 2 });
        assert_eq!(p.skip_mask(), 0b01);
        let data = [1u8, 0, 0, 0, 2, 0, 0, 0];
        let stored = p.encode(&data, 4).unwrap();
        assert_eq!(stored.len(), data.len() + 4);
        assert_eq!(p.decode(&stored, 4, p.skip_mask()).unwrap(), data.to_vec());
        assert!(p.decode(&stored, 4, 0).is_err());
    }

    #[test]
    fn unknown_compression_rejected() {
        let mut l = layout();
        l.compression = Some("lz4".into());
        assert!(matches!(Pipeline::for_layout(&l), Err(StorageError::Invalid(_))));
    }

    #[test]
    fn shuffle_groups_bytes() {
        let data = [1u8, 2, 3, 4, 5, 6];
        assert_eq!(shuffle(&data, 2).unwrap(), vec![1, 3, 5, 2, 4, 6]);
        assert_eq!(unshuffle(&[1, 3, 5, 2, 4, 6], 2).unwrap(), data.to_vec());
    }

    #[test]
    fn fletcher32_detects_corruption() {
        let p = Pipeline { filters: vec![Filter { id: FILTER_FLETCHER32, level: 0 }] };
        let mut stored = p.encode(b"abcdef", 1).unwrap();
        assert_eq!(p.decode(&stored, 1, 0).unwrap(), b"abcdef");
        stored[0] ^= 0xff;
        assert!(matches!(p.decode(&stored, 1, 0), Err(StorageError::Corrupt(_))));
    }

    #[test]
    fn fletcher32_matches_reference_sums() {
        assert_eq!(fletcher32(b"abcde"), 0x4ff0_29c7);
        assert_eq!(fletcher32(b"abcdef"), 0x5056_2a2d);
        // Folding keeps 0xffff where a modulus would give zero.
        assert_eq!(fletcher32(&[0xff; 2000]), 0xffff_ffff);
    }

    #[test]
    fn skipped_filters_are_not_undone() {
        let p = Pipeline {
            filters: vec![
                Filter { id: FILTER_SHUFFLE, level: 0 },
                Filter { id: FILTER_FLETCHER32, level: 0 },
            ],
        };
        let data = [1u8, 2, 3, 4];
        let stored = p.encode(&data, 2).unwrap();
        assert_eq!(p.decode(&stored, 2, 0).unwrap(), data.to_vec());
        let unshuffled_only = Pipeline { filters: vec![Filter { id: FILTER_FLETCHER32, level: 0 }] }
            .encode(&data, 2)
            .unwrap();
        assert_eq!(p.decode(&unshuffled_only, 2, 0b01).unwrap(), data.to_vec());
    }

    #[test]
    #[cfg(feature = "deflate")]
    fn full_pipeline_restores_payload() {
        let p = Pipeline::for_layout(&layout()).unwrap();
        let data: Vec<u8> = (0..64u64).flat_map(|i| (i as f64).to_le_bytes()).collect();
        let stored = p.encode(&data, 8).unwrap();
        assert!(stored.len() < data.len());
        assert_eq!(p.decode(&stored, 8, 0).unwrap(), data);
    }
}

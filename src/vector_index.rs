//! Append-only flat vector index with inner-product search.
//!
//! Vectors are stored contiguously and searched by brute force. Callers
//! normalize vectors to unit length before `add` and `search`, which makes
//! the raw inner product equal to cosine similarity.
//!
//! # File format
//!
//! ```text
//! magic  "FRVX"         4 bytes
//! version u32 LE        4 bytes
//! dims    u32 LE        4 bytes
//! count   u64 LE        8 bytes
//! count × { id u64 LE, dims × f32 LE }
//! sha256 of everything above   32 bytes
//! ```

use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::Path;

use crate::embedding::dot;
use crate::error::{RagError, Result};
use crate::store::write_atomic;

const MAGIC: &[u8; 4] = b"FRVX";
const FORMAT_VERSION: u32 = 1;
const HEADER_LEN: usize = 20;
const CHECKSUM_LEN: usize = 32;

#[derive(Debug, Clone)]
pub struct FlatIndex {
    dims: usize,
    ids: Vec<u64>,
    data: Vec<f32>,
    id_set: HashSet<u64>,
}

impl FlatIndex {
    pub fn create_empty(dims: usize) -> Result<Self> {
        if dims == 0 {
            return Err(RagError::config("vector index dimension must be > 0"));
        }
        Ok(Self {
            dims,
            ids: Vec::new(),
            data: Vec::new(),
            id_set: HashSet::new(),
        })
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn contains(&self, id: u64) -> bool {
        self.id_set.contains(&id)
    }

    /// Ids in insertion order.
    pub fn ids(&self) -> &[u64] {
        &self.ids
    }

    /// Append vectors under new ids.
    ///
    /// The whole call is validated before anything is appended: a length
    /// or dimension error, or any id already present (or repeated within
    /// the call), leaves the index unchanged.
    pub fn add(&mut self, ids: &[u64], vectors: &[Vec<f32>]) -> Result<()> {
        if ids.len() != vectors.len() {
            return Err(RagError::IndexMismatch(format!(
                "add called with {} ids and {} vectors",
                ids.len(),
                vectors.len()
            )));
        }

        let mut batch = HashSet::with_capacity(ids.len());
        for (&id, v) in ids.iter().zip(vectors) {
            if v.len() != self.dims {
                return Err(RagError::DimensionMismatch {
                    expected: self.dims,
                    actual: v.len(),
                });
            }
            if self.id_set.contains(&id) || !batch.insert(id) {
                return Err(RagError::DuplicateId(id));
            }
        }

        self.ids.reserve(ids.len());
        self.data.reserve(ids.len() * self.dims);
        for (&id, v) in ids.iter().zip(vectors) {
            self.ids.push(id);
            self.data.extend_from_slice(v);
            self.id_set.insert(id);
        }
        Ok(())
    }

    /// Top-`k` ids by inner product, highest first, ties by ascending id.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<(u64, f32)>> {
        self.search_filtered(query, k, |_| true)
    }

    /// Like [`search`](Self::search), considering only ids accepted by `filter`.
    pub fn search_filtered<F>(&self, query: &[f32], k: usize, filter: F) -> Result<Vec<(u64, f32)>>
    where
        F: Fn(u64) -> bool,
    {
        if query.len() != self.dims {
            return Err(RagError::DimensionMismatch {
                expected: self.dims,
                actual: query.len(),
            });
        }
        if k == 0 {
            return Ok(Vec::new());
        }

        let mut scored: Vec<(u64, f32)> = self
            .ids
            .iter()
            .zip(self.data.chunks_exact(self.dims))
            .filter(|(id, _)| filter(**id))
            .map(|(&id, v)| (id, dot(query, v)))
            .collect();

        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        scored.truncate(k);
        Ok(scored)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let record_len = 8 + self.dims * 4;
        let mut bytes = Vec::with_capacity(HEADER_LEN + self.len() * record_len + CHECKSUM_LEN);
        bytes.extend_from_slice(MAGIC);
        bytes.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        bytes.extend_from_slice(&(self.dims as u32).to_le_bytes());
        bytes.extend_from_slice(&(self.len() as u64).to_le_bytes());

        for (id, v) in self.ids.iter().zip(self.data.chunks_exact(self.dims)) {
            bytes.extend_from_slice(&id.to_le_bytes());
            for x in v {
                bytes.extend_from_slice(&x.to_le_bytes());
            }
        }

        let digest = Sha256::digest(&bytes);
        bytes.extend_from_slice(&digest);
        bytes
    }

    /// Decode a serialized index. `path` is only used in error messages.
    pub fn from_bytes(bytes: &[u8], path: &Path) -> Result<Self> {
        if bytes.len() < HEADER_LEN + CHECKSUM_LEN {
            return Err(RagError::corrupt(path, "file too short"));
        }
        let (body, checksum) = bytes.split_at(bytes.len() - CHECKSUM_LEN);
        if Sha256::digest(body).as_slice() != checksum {
            return Err(RagError::corrupt(path, "checksum mismatch"));
        }
        if &body[0..4] != MAGIC {
            return Err(RagError::corrupt(path, "bad magic"));
        }

        let version = u32::from_le_bytes(read_array(&body[4..8]));
        if version != FORMAT_VERSION {
            return Err(RagError::corrupt(
                path,
                format!("unsupported format version {}", version),
            ));
        }
        let dims = u32::from_le_bytes(read_array(&body[8..12])) as usize;
        let count = u64::from_le_bytes(read_array(&body[12..20])) as usize;
        if dims == 0 {
            return Err(RagError::corrupt(path, "zero dimension"));
        }

        let record_len = 8 + dims * 4;
        let expected = count
            .checked_mul(record_len)
            .and_then(|n| n.checked_add(HEADER_LEN));
        if expected != Some(body.len()) {
            return Err(RagError::corrupt(
                path,
                format!("length does not match {} records of {} dims", count, dims),
            ));
        }

        let mut index = Self::create_empty(dims)?;
        index.ids.reserve(count);
        index.data.reserve(count * dims);
        for record in body[HEADER_LEN..].chunks_exact(record_len) {
            let id = u64::from_le_bytes(read_array(&record[0..8]));
            if !index.id_set.insert(id) {
                return Err(RagError::corrupt(path, format!("duplicate id {}", id)));
            }
            index.ids.push(id);
            index.data.extend(
                record[8..]
                    .chunks_exact(4)
                    .map(|c| f32::from_le_bytes(read_array(c))),
            );
        }
        Ok(index)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        write_atomic(path, &self.to_bytes())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        Self::from_bytes(&bytes, path)
    }
}

fn read_array<const N: usize>(slice: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&slice[..N]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::normalize;

    fn unit(v: &[f32]) -> Vec<f32> {
        let mut v = v.to_vec();
        normalize(&mut v);
        v
    }

    fn sample() -> FlatIndex {
        let mut index = FlatIndex::create_empty(3).unwrap();
        index
            .add(
                &[10, 11, 12],
                &[unit(&[1.0, 0.0, 0.0]), unit(&[0.0, 1.0, 0.0]), unit(&[1.0, 1.0, 0.0])],
            )
            .unwrap();
        index
    }

    #[test]
    fn test_search_orders_by_similarity() {
        let index = sample();
        let hits = index.search(&unit(&[1.0, 0.1, 0.0]), 3).unwrap();
        let ids: Vec<u64> = hits.iter().map(|h| h.0).collect();
        assert_eq!(ids, vec![10, 12, 11]);
        assert!(hits[0].1 > hits[1].1 && hits[1].1 > hits[2].1);
    }

    #[test]
    fn test_ties_break_by_ascending_id() {
        let mut index = FlatIndex::create_empty(2).unwrap();
        index
            .add(&[7, 3, 5], &[vec![1.0, 0.0], vec![1.0, 0.0], vec![1.0, 0.0]])
            .unwrap();
        let ids: Vec<u64> = index.search(&[1.0, 0.0], 3).unwrap().iter().map(|h| h.0).collect();
        assert_eq!(ids, vec![3, 5, 7]);
    }

    #[test]
    fn test_fewer_than_k() {
        let index = sample();
        assert_eq!(index.search(&unit(&[0.0, 0.0, 1.0]), 10).unwrap().len(), 3);
        assert!(index.search(&unit(&[0.0, 0.0, 1.0]), 0).unwrap().is_empty());
    }

    #[test]
    fn test_duplicate_id_rejected_without_mutation() {
        let mut index = sample();
        let err = index
            .add(&[99, 11], &[unit(&[0.0, 0.0, 1.0]), unit(&[0.0, 0.0, 1.0])])
            .unwrap_err();
        assert!(matches!(err, RagError::DuplicateId(11)));
        assert_eq!(index.len(), 3);
        assert!(!index.contains(99));

        let err = index
            .add(&[50, 50], &[unit(&[0.0, 0.0, 1.0]), unit(&[0.0, 0.0, 1.0])])
            .unwrap_err();
        assert!(matches!(err, RagError::DuplicateId(50)));
    }

    #[test]
    fn test_dimension_checked() {
        let mut index = sample();
        assert!(matches!(
            index.add(&[1], &[vec![1.0, 0.0]]),
            Err(RagError::DimensionMismatch { expected: 3, actual: 2 })
        ));
        assert!(matches!(
            index.search(&[1.0], 1),
            Err(RagError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_filtered_search() {
        let index = sample();
        let hits = index
            .search_filtered(&unit(&[1.0, 0.0, 0.0]), 5, |id| id != 10)
            .unwrap();
        assert_eq!(hits.iter().map(|h| h.0).collect::<Vec<_>>(), vec![12, 11]);
    }

    #[test]
    fn test_save_load_equivalent() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("vectors.idx");
        let index = sample();
        index.save(&path).unwrap();

        let loaded = FlatIndex::load(&path).unwrap();
        assert_eq!(loaded.dims(), 3);
        assert_eq!(loaded.ids(), index.ids());
        let q = unit(&[0.3, 0.9, 0.1]);
        assert_eq!(loaded.search(&q, 3).unwrap(), index.search(&q, 3).unwrap());
        assert!(!tmp.path().join("vectors.idx.tmp").exists());
    }

    #[test]
    fn test_flipped_byte_is_corrupt() {
        let path = Path::new("vectors.idx");
        let mut bytes = sample().to_bytes();
        bytes[HEADER_LEN + 3] ^= 0xff;
        assert!(matches!(
            FlatIndex::from_bytes(&bytes, path),
            Err(RagError::Corrupt { .. })
        ));
        assert!(matches!(
            FlatIndex::from_bytes(&bytes[..10], path),
            Err(RagError::Corrupt { .. })
        ));
    }

    #[test]
    fn test_empty_index_round_trips() {
        let index = FlatIndex::create_empty(8).unwrap();
        let loaded = FlatIndex::from_bytes(&index.to_bytes(), Path::new("x")).unwrap();
        assert_eq!(loaded.dims(), 8);
        assert!(loaded.is_empty());
    }
}

//! Metadata sidecar: the typed header and entry list stored next to the
//! vector file.
//!
//! The header records the chunking profile and embedding model that
//! produced the vectors. Chunk text is rebuilt from source documents at
//! query time, so any drift in those parameters would silently return the
//! wrong text; [`IndexManifest::check_compatible`] turns that into an error.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tracing::warn;

use crate::chunk::ChunkingProfile;
use crate::error::{RagError, Result};
use crate::models::{ChunkKey, IndexEntry};

pub const SIDECAR_VERSION: u32 = 1;

/// Header plus entries, in insertion order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexManifest {
    pub format_version: u32,
    /// `None` only for sidecars written without a header.
    pub chunking: Option<ChunkingProfile>,
    pub embedding_model: Option<String>,
    pub dims: Option<usize>,
    /// Lower bound for the next id handed out, persisted so ids stay
    /// unique even if entries are dropped during recovery.
    #[serde(default)]
    pub next_id: u64,
    pub entries: Vec<IndexEntry>,
}

/// Accepted on-disk shapes: the headered object, or a bare entry array.
#[derive(Deserialize)]
#[serde(untagged)]
enum SidecarFile {
    Manifest(IndexManifest),
    Legacy(Vec<IndexEntry>),
}

impl IndexManifest {
    pub fn new(chunking: ChunkingProfile, embedding_model: &str) -> Self {
        Self {
            format_version: SIDECAR_VERSION,
            chunking: Some(chunking),
            embedding_model: Some(embedding_model.to_string()),
            dims: None,
            next_id: 0,
            entries: Vec::new(),
        }
    }

    /// Parse and validate a sidecar. `path` is only used in error messages.
    pub fn from_json(json: &str, path: &Path) -> Result<Self> {
        let parsed: SidecarFile = serde_json::from_str(json)
            .map_err(|e| RagError::corrupt(path, format!("invalid metadata: {}", e)))?;

        let mut manifest = match parsed {
            SidecarFile::Manifest(m) => {
                if m.format_version != SIDECAR_VERSION {
                    return Err(RagError::corrupt(
                        path,
                        format!("unsupported metadata version {}", m.format_version),
                    ));
                }
                m
            }
            SidecarFile::Legacy(entries) => {
                warn!(
                    path = %path.display(),
                    "metadata has no header; chunking parameters cannot be verified"
                );
                Self {
                    format_version: SIDECAR_VERSION,
                    chunking: None,
                    embedding_model: None,
                    dims: None,
                    next_id: 0,
                    entries,
                }
            }
        };

        manifest.validate(path)?;
        manifest.next_id = manifest.next_id.max(manifest.max_id().map_or(0, |m| m + 1));
        Ok(manifest)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json, path)
    }

    /// Reject duplicate ids and duplicate chunk keys.
    fn validate(&self, path: &Path) -> Result<()> {
        let mut ids = HashSet::with_capacity(self.entries.len());
        let mut keys = HashSet::with_capacity(self.entries.len());
        for entry in &self.entries {
            if !ids.insert(entry.id) {
                return Err(RagError::corrupt(path, format!("duplicate id {}", entry.id)));
            }
            if !keys.insert(entry.key()) {
                return Err(RagError::corrupt(
                    path,
                    format!(
                        "duplicate chunk {}/{}#{}",
                        entry.ticker, entry.accession, entry.chunk_index
                    ),
                ));
            }
        }
        Ok(())
    }

    pub fn max_id(&self) -> Option<u64> {
        self.entries.iter().map(|e| e.id).max()
    }

    pub fn existing_keys(&self) -> HashSet<ChunkKey> {
        self.entries.iter().map(IndexEntry::key).collect()
    }

    /// Entry position by id. Ids need not be dense or positional.
    pub fn positions_by_id(&self) -> HashMap<u64, usize> {
        self.entries
            .iter()
            .enumerate()
            .map(|(pos, e)| (e.id, pos))
            .collect()
    }

    /// Fail if the index was built with different chunking or model.
    ///
    /// Headerless sidecars adopt the supplied values instead.
    pub fn check_compatible(&mut self, chunking: &ChunkingProfile, model: &str) -> Result<()> {
        match &self.chunking {
            Some(stored) if stored != chunking => {
                return Err(RagError::IndexMismatch(format!(
                    "index was built with chunking ({}) but config specifies ({}); a full reindex is required",
                    stored, chunking
                )))
            }
            Some(_) => {}
            None => self.chunking = Some(chunking.clone()),
        }

        match &self.embedding_model {
            Some(stored) if stored != model => {
                return Err(RagError::IndexMismatch(format!(
                    "index was built with embedding model '{}' but config specifies '{}'",
                    stored, model
                )))
            }
            Some(_) => {}
            None => self.embedding_model = Some(model.to_string()),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile() -> ChunkingProfile {
        ChunkingProfile {
            chunk_size: 1000,
            overlap: 200,
            tokenizer: "word-v1".to_string(),
        }
    }

    fn entry(id: u64, accession: &str, chunk_index: usize) -> IndexEntry {
        IndexEntry {
            id,
            ticker: "AAPL".to_string(),
            accession: accession.to_string(),
            chunk_index,
            filing_date: "2023-11-03".to_string(),
            form: Some("10-K".to_string()),
            chunk_hash: None,
        }
    }

    #[test]
    fn test_manifest_round_trip() {
        let mut m = IndexManifest::new(profile(), "text-embedding-3-small");
        m.dims = Some(4);
        m.entries = vec![entry(0, "a", 0), entry(1, "a", 1)];
        m.next_id = 2;
        let json = m.to_json().unwrap();
        let back = IndexManifest::from_json(&json, Path::new("m.json")).unwrap();
        assert_eq!(back, m);
    }

    #[test]
    fn test_legacy_array_accepted() {
        let json = r#"[
            {"id": 0, "ticker": "AAPL", "accession": "a", "chunk_index": 0, "filing_date": "2023-11-03"},
            {"id": 4, "ticker": "AAPL", "accession": "a", "chunk_index": 1, "filing_date": "2023-11-03"}
        ]"#;
        let mut m = IndexManifest::from_json(json, Path::new("m.json")).unwrap();
        assert_eq!(m.entries.len(), 2);
        assert_eq!(m.chunking, None);
        assert_eq!(m.next_id, 5);

        m.check_compatible(&profile(), "model").unwrap();
        assert_eq!(m.chunking, Some(profile()));
    }

    #[test]
    fn test_duplicate_id_is_corrupt() {
        let mut m = IndexManifest::new(profile(), "model");
        m.entries = vec![entry(0, "a", 0), entry(0, "a", 1)];
        let json = m.to_json().unwrap();
        assert!(matches!(
            IndexManifest::from_json(&json, Path::new("m.json")),
            Err(RagError::Corrupt { .. })
        ));
    }

    #[test]
    fn test_duplicate_key_is_corrupt() {
        let mut m = IndexManifest::new(profile(), "model");
        m.entries = vec![entry(0, "a", 0), entry(1, "a", 0)];
        let json = m.to_json().unwrap();
        assert!(IndexManifest::from_json(&json, Path::new("m.json")).is_err());
    }

    #[test]
    fn test_profile_drift_rejected() {
        let mut m = IndexManifest::new(profile(), "model");
        let mut drifted = profile();
        drifted.overlap = 100;
        assert!(matches!(
            m.check_compatible(&drifted, "model"),
            Err(RagError::IndexMismatch(_))
        ));
        assert!(matches!(
            m.check_compatible(&profile(), "other-model"),
            Err(RagError::IndexMismatch(_))
        ));
        m.check_compatible(&profile(), "model").unwrap();
    }

    #[test]
    fn test_positions_by_id_not_positional() {
        let mut m = IndexManifest::new(profile(), "model");
        m.entries = vec![entry(9, "a", 0), entry(3, "a", 1)];
        let pos = m.positions_by_id();
        assert_eq!(pos[&9], 0);
        assert_eq!(pos[&3], 1);
        assert_eq!(m.max_id(), Some(9));
    }
}

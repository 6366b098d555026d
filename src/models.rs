//! Core data models used throughout the indexing and retrieval pipeline.
//!
//! Document records come from the corpus on disk, index entries live in the
//! metadata sidecar, and retrieved chunks are what callers get back from a
//! query.

use serde::{Deserialize, Serialize};

/// One filing, persisted as `<corpus>/<ticker>/<accession>.json`.
///
/// Written by the filing downloader and never modified here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentRecord {
    #[serde(default)]
    pub ticker: String,
    pub accession: String,
    #[serde(default)]
    pub filing_date: String,
    #[serde(default)]
    pub form: Option<String>,
    #[serde(default)]
    pub text: String,
}

/// Composite de-duplication key for an indexed chunk.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkKey {
    pub ticker: String,
    pub accession: String,
    pub chunk_index: usize,
}

/// Metadata binding a vector id to its source chunk.
///
/// The chunk text itself is not stored; it is rebuilt from the source
/// document on demand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub id: u64,
    pub ticker: String,
    pub accession: String,
    pub chunk_index: usize,
    #[serde(default)]
    pub filing_date: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub form: Option<String>,
    /// SHA-256 of the chunk text at embedding time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_hash: Option<String>,
}

impl IndexEntry {
    pub fn key(&self) -> ChunkKey {
        ChunkKey {
            ticker: self.ticker.clone(),
            accession: self.accession.clone(),
            chunk_index: self.chunk_index,
        }
    }

    /// Four-digit year prefix of `filing_date`, if it parses as an ISO date.
    pub fn filing_year(&self) -> Option<i32> {
        use chrono::Datelike;
        chrono::NaiveDate::parse_from_str(&self.filing_date, "%Y-%m-%d")
            .ok()
            .map(|d| d.year())
    }
}

/// A ranked retrieval hit with its reconstructed text.
#[derive(Debug, Clone, Serialize)]
pub struct RetrievedChunk {
    pub id: u64,
    pub ticker: String,
    pub accession: String,
    pub chunk_index: usize,
    pub filing_date: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub form: Option<String>,
    /// Cosine similarity in `[-1.0, 1.0]`.
    pub score: f32,
    pub text: String,
}

impl RetrievedChunk {
    pub fn from_entry(entry: &IndexEntry, score: f32, text: String) -> Self {
        Self {
            id: entry.id,
            ticker: entry.ticker.clone(),
            accession: entry.accession.clone(),
            chunk_index: entry.chunk_index,
            filing_date: entry.filing_date.clone(),
            form: entry.form.clone(),
            score,
            text,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_without_optional_fields_parses() {
        let json = r#"{"id": 3, "ticker": "AAPL", "accession": "0000320193-23-000106",
                       "chunk_index": 7, "filing_date": "2023-11-03"}"#;
        let entry: IndexEntry = serde_json::from_str(json).unwrap();
        assert_eq!(entry.id, 3);
        assert_eq!(entry.form, None);
        assert_eq!(entry.chunk_hash, None);
        assert_eq!(entry.filing_year(), Some(2023));
    }

    #[test]
    fn test_optional_fields_omitted_on_write() {
        let entry = IndexEntry {
            id: 0,
            ticker: "MSFT".to_string(),
            accession: "a".to_string(),
            chunk_index: 0,
            filing_date: String::new(),
            form: None,
            chunk_hash: None,
        };
        let json = serde_json::to_string(&entry).unwrap();
        assert!(!json.contains("form"));
        assert!(!json.contains("chunk_hash"));
        assert_eq!(entry.filing_year(), None);
    }

    #[test]
    fn test_document_record_defaults() {
        let doc: DocumentRecord = serde_json::from_str(r#"{"accession": "x"}"#).unwrap();
        assert_eq!(doc.text, "");
        assert_eq!(doc.form, None);
    }
}

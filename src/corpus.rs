//! Corpus layout: one directory per ticker, one `<accession>.json` per filing.
//!
//! ```text
//! <root>/
//!   AAPL/
//!     0000320193-23-000106.json
//!   MSFT/
//!     0000950170-24-087843.json
//! ```
//!
//! The directory name is the ticker used in index keys, and the file stem
//! is the accession. Retrieval rebuilds the path from an entry's
//! `(ticker, accession)`, so both must round-trip through the file system.

use std::path::{Path, PathBuf};
use tracing::warn;
use walkdir::WalkDir;

use crate::error::{RagError, Result};
use crate::models::DocumentRecord;

/// Location of one document under the corpus root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentRef {
    pub ticker: String,
    pub accession: String,
    pub path: PathBuf,
}

pub fn document_path(root: &Path, ticker: &str, accession: &str) -> PathBuf {
    root.join(ticker).join(format!("{}.json", accession))
}

/// List every document file, sorted by ticker then accession.
///
/// Entries that do not fit the layout (stray files at the root, non-JSON
/// files, unreadable directories) are skipped with a warning.
pub fn scan_corpus(root: &Path) -> Result<Vec<DocumentRef>> {
    if !root.is_dir() {
        return Err(RagError::config(format!(
            "corpus root does not exist: {}",
            root.display()
        )));
    }

    let mut docs = Vec::new();
    let walker = WalkDir::new(root)
        .min_depth(2)
        .max_depth(2)
        .sort_by_file_name();

    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!(error = %e, "skipping unreadable corpus entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }

        let ticker = path
            .parent()
            .and_then(Path::file_name)
            .and_then(|n| n.to_str());
        let accession = path.file_stem().and_then(|s| s.to_str());
        match (ticker, accession) {
            (Some(ticker), Some(accession)) => docs.push(DocumentRef {
                ticker: ticker.to_string(),
                accession: accession.to_string(),
                path: path.to_path_buf(),
            }),
            _ => warn!(path = %path.display(), "skipping file with non UTF-8 name"),
        }
    }

    docs.sort_by(|a, b| (&a.ticker, &a.accession).cmp(&(&b.ticker, &b.accession)));
    Ok(docs)
}

/// Read and parse one document record.
///
/// A missing or unreadable file is `MissingSourceFile`; malformed JSON or
/// an accession that disagrees with the file name is `Corrupt`. The
/// directory ticker wins over the record's own `ticker` field.
pub fn load_document(doc: &DocumentRef) -> Result<DocumentRecord> {
    let raw = std::fs::read_to_string(&doc.path)
        .map_err(|_| RagError::MissingSourceFile(doc.path.clone()))?;
    let mut record: DocumentRecord = serde_json::from_str(&raw)
        .map_err(|e| RagError::corrupt(&doc.path, format!("invalid document: {}", e)))?;

    if record.accession != doc.accession {
        return Err(RagError::corrupt(
            &doc.path,
            format!(
                "accession '{}' does not match file name '{}'",
                record.accession, doc.accession
            ),
        ));
    }
    if !record.ticker.is_empty() && record.ticker != doc.ticker {
        warn!(
            path = %doc.path.display(),
            record_ticker = %record.ticker,
            "document ticker differs from its directory; using the directory name"
        );
    }
    record.ticker = doc.ticker.clone();
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_doc(root: &Path, ticker: &str, accession: &str, body: &str) {
        let dir = root.join(ticker);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(format!("{}.json", accession)), body).unwrap();
    }

    fn doc_json(ticker: &str, accession: &str) -> String {
        serde_json::json!({
            "ticker": ticker,
            "accession": accession,
            "filing_date": "2024-02-01",
            "form": "10-K",
            "text": "Revenue grew."
        })
        .to_string()
    }

    #[test]
    fn test_scan_sorted_and_filtered() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        write_doc(root, "MSFT", "b", &doc_json("MSFT", "b"));
        write_doc(root, "AAPL", "z", &doc_json("AAPL", "z"));
        write_doc(root, "AAPL", "a", &doc_json("AAPL", "a"));
        write_doc(root, "AAPL", "notes", "");
        std::fs::rename(root.join("AAPL/notes.json"), root.join("AAPL/notes.txt")).unwrap();
        std::fs::write(root.join("stray.json"), "{}").unwrap();

        let docs = scan_corpus(root).unwrap();
        let keys: Vec<(&str, &str)> = docs
            .iter()
            .map(|d| (d.ticker.as_str(), d.accession.as_str()))
            .collect();
        assert_eq!(keys, vec![("AAPL", "a"), ("AAPL", "z"), ("MSFT", "b")]);
        assert_eq!(docs[0].path, document_path(root, "AAPL", "a"));
    }

    #[test]
    fn test_missing_root_is_config_error() {
        let tmp = TempDir::new().unwrap();
        assert!(matches!(
            scan_corpus(&tmp.path().join("nope")),
            Err(RagError::Configuration(_))
        ));
    }

    #[test]
    fn test_load_document_checks() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        write_doc(root, "AAPL", "a", &doc_json("apple", "a"));
        write_doc(root, "AAPL", "b", &doc_json("AAPL", "other"));
        write_doc(root, "AAPL", "c", "{not json");

        let docs = scan_corpus(root).unwrap();
        let ok = load_document(&docs[0]).unwrap();
        assert_eq!(ok.ticker, "AAPL");
        assert_eq!(ok.form.as_deref(), Some("10-K"));

        assert!(matches!(load_document(&docs[1]), Err(RagError::Corrupt { .. })));
        assert!(matches!(load_document(&docs[2]), Err(RagError::Corrupt { .. })));

        let gone = DocumentRef {
            ticker: "AAPL".into(),
            accession: "gone".into(),
            path: document_path(root, "AAPL", "gone"),
        };
        assert!(matches!(
            load_document(&gone),
            Err(RagError::MissingSourceFile(_))
        ));
    }
}

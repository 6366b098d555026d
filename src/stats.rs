//! Index statistics and health overview for `frag stats`.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use crate::config::{Config, IndexPaths};
use crate::error::{RagError, Result};
use crate::store::IndexStore;

/// Per-ticker document and chunk counts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickerStats {
    pub ticker: String,
    pub documents: usize,
    pub chunks: usize,
    /// Most recent `filing_date` among the ticker's entries.
    pub latest_filing: Option<String>,
}

#[derive(Debug, Clone)]
pub struct IndexStats {
    pub entries: usize,
    pub documents: usize,
    pub dims: Option<usize>,
    pub embedding_model: Option<String>,
    pub chunking: Option<String>,
    pub next_id: u64,
    pub vectors_bytes: u64,
    pub metadata_bytes: u64,
    /// Modification time of the vector file, as a Unix timestamp.
    pub updated_at: Option<i64>,
    pub tickers: Vec<TickerStats>,
}

impl IndexStats {
    pub fn collect(paths: &IndexPaths) -> Result<Self> {
        let store = IndexStore::load(paths)?;
        let manifest = &store.manifest;

        let mut per_ticker: BTreeMap<&str, (HashSet<&str>, usize, Option<&str>)> = BTreeMap::new();
        for e in &manifest.entries {
            let slot = per_ticker.entry(e.ticker.as_str()).or_default();
            slot.0.insert(e.accession.as_str());
            slot.1 += 1;
            if !e.filing_date.is_empty() && slot.2.map_or(true, |d| e.filing_date.as_str() > d) {
                slot.2 = Some(e.filing_date.as_str());
            }
        }

        let tickers: Vec<TickerStats> = per_ticker
            .into_iter()
            .map(|(ticker, (docs, chunks, latest))| TickerStats {
                ticker: ticker.to_string(),
                documents: docs.len(),
                chunks,
                latest_filing: latest.map(str::to_string),
            })
            .collect();

        Ok(Self {
            entries: store.len(),
            documents: tickers.iter().map(|t| t.documents).sum(),
            dims: store.dims(),
            embedding_model: manifest.embedding_model.clone(),
            chunking: manifest.chunking.as_ref().map(ToString::to_string),
            next_id: manifest.next_id,
            vectors_bytes: file_size(&paths.vectors),
            metadata_bytes: file_size(&paths.metadata),
            updated_at: modified_ts(&paths.vectors),
            tickers,
        })
    }
}

fn file_size(path: &Path) -> u64 {
    std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

fn modified_ts(path: &Path) -> Option<i64> {
    let modified = std::fs::metadata(path).ok()?.modified().ok()?;
    let secs = modified
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .ok()?
        .as_secs();
    i64::try_from(secs).ok()
}

/// Run the stats command: load the index and print a summary.
pub fn run_stats(config: &Config) -> anyhow::Result<()> {
    let paths = config.index.paths();
    let stats = match IndexStats::collect(&paths) {
        Ok(s) => s,
        Err(RagError::NotIndexed(_)) => anyhow::bail!("No data available. Run `frag index` first."),
        Err(e) => return Err(e.into()),
    };

    println!("Filing RAG: Index Stats");
    println!("=======================");
    println!();
    println!("  Index dir:   {}", config.index.dir.display());
    println!("  Vectors:     {}", format_bytes(stats.vectors_bytes));
    println!("  Metadata:    {}", format_bytes(stats.metadata_bytes));
    if let Some(ts) = stats.updated_at {
        println!("  Updated:     {}", format_ts_relative(ts));
    }
    println!();
    println!("  Entries:     {}", stats.entries);
    println!("  Documents:   {}", stats.documents);
    println!("  Tickers:     {}", stats.tickers.len());
    println!("  Next id:     {}", stats.next_id);
    println!(
        "  Dims:        {}",
        stats.dims.map_or("-".to_string(), |d| d.to_string())
    );
    println!(
        "  Model:       {}",
        stats.embedding_model.as_deref().unwrap_or("(unrecorded)")
    );
    println!(
        "  Chunking:    {}",
        stats.chunking.as_deref().unwrap_or("(unrecorded)")
    );

    if !stats.tickers.is_empty() {
        println!();
        println!("  By ticker:");
        println!(
            "  {:<10} {:>6} {:>8}   {}",
            "TICKER", "DOCS", "CHUNKS", "LATEST FILING"
        );
        println!("  {}", "-".repeat(44));
        for t in &stats.tickers {
            println!(
                "  {:<10} {:>6} {:>8}   {}",
                t.ticker,
                t.documents,
                t.chunks,
                t.latest_filing.as_deref().unwrap_or("-")
            );
        }
    }
    println!();
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a Unix timestamp relative to now, e.g. "3 hours ago".
fn format_ts_relative(ts: i64) -> String {
    let delta = chrono::Utc::now().timestamp() - ts;
    if delta < 0 {
        return format_ts_iso(ts);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}

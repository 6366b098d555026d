//! Query-time retrieval.
//!
//! The query is embedded and normalized, the flat index returns the top-k
//! ids, and each hit's text is rebuilt by re-chunking its source document
//! with the same chunker that built the index. Hits whose document is gone
//! or whose text no longer matches the stored hash become
//! [`HitOutcome::Skipped`] and are dropped, so a retrieval can return
//! fewer than `k` results.

use std::collections::HashMap;
use std::path::PathBuf;
use tracing::{debug, warn};

use crate::chunk::{hash_text, ChunkWindow, Chunker};
use crate::config::{Config, IndexPaths};
use crate::corpus::{document_path, load_document, DocumentRef};
use crate::embedding::{normalize, EmbeddingClient};
use crate::error::{RagError, Result};
use crate::models::{IndexEntry, RetrievedChunk};
use crate::store::IndexStore;
use crate::vector_index::FlatIndex;

/// Separator between hits in [`format_context`].
pub const CONTEXT_SEPARATOR: &str = "\n\n---\n\n";

/// Restricts which entries are eligible before top-k selection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetrievalFilter {
    /// Case-insensitive.
    pub ticker: Option<String>,
    pub year: Option<i32>,
    /// Case-insensitive, e.g. `10-K`.
    pub form: Option<String>,
}

impl RetrievalFilter {
    pub fn is_empty(&self) -> bool {
        self.ticker.is_none() && self.year.is_none() && self.form.is_none()
    }

    pub fn matches(&self, entry: &IndexEntry) -> bool {
        if let Some(ticker) = &self.ticker {
            if !entry.ticker.eq_ignore_ascii_case(ticker) {
                return false;
            }
        }
        if let Some(year) = self.year {
            if entry.filing_year() != Some(year) {
                return false;
            }
        }
        if let Some(form) = &self.form {
            match &entry.form {
                Some(f) if f.eq_ignore_ascii_case(form) => {}
                _ => return false,
            }
        }
        true
    }
}

/// Resolution of one index hit.
#[derive(Debug, Clone)]
pub enum HitOutcome {
    Found(RetrievedChunk),
    Skipped { id: u64, reason: String },
}

/// A loaded document and its chunk windows, shared by hits from the same filing.
type CachedDocument = std::result::Result<(String, Vec<ChunkWindow>), String>;

pub struct Retriever {
    index: FlatIndex,
    entries: Vec<IndexEntry>,
    positions: HashMap<u64, usize>,
    corpus_root: PathBuf,
    chunker: Chunker,
    client: EmbeddingClient,
}

impl Retriever {
    /// Open a persisted index for querying.
    ///
    /// Fails with `NotIndexed` when no index exists yet, and with
    /// `IndexMismatch` when the chunker or model differ from the ones the
    /// index was built with.
    pub fn open(
        paths: &IndexPaths,
        corpus_root: PathBuf,
        chunker: Chunker,
        client: EmbeddingClient,
    ) -> Result<Self> {
        let mut store = IndexStore::load(paths)?;
        store
            .manifest
            .check_compatible(&chunker.profile(), client.model_name())?;

        let index = store
            .index
            .take()
            .ok_or_else(|| RagError::NotIndexed(paths.vectors.clone()))?;
        let positions = store.manifest.positions_by_id();

        Ok(Self {
            index,
            entries: store.manifest.entries,
            positions,
            corpus_root,
            chunker,
            client,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::open(
            &config.index.paths(),
            config.corpus.root.clone(),
            Chunker::from_config(&config.chunking)?,
            EmbeddingClient::from_config(&config.embedding)?,
        )
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Top-`k` chunks for `query`, highest score first.
    pub async fn retrieve(&self, query: &str, k: usize) -> Result<Vec<RetrievedChunk>> {
        self.retrieve_filtered(query, k, &RetrievalFilter::default())
            .await
    }

    pub async fn retrieve_filtered(
        &self,
        query: &str,
        k: usize,
        filter: &RetrievalFilter,
    ) -> Result<Vec<RetrievedChunk>> {
        let outcomes = self.search(query, k, filter).await?;
        Ok(outcomes
            .into_iter()
            .filter_map(|outcome| match outcome {
                HitOutcome::Found(hit) => Some(hit),
                HitOutcome::Skipped { id, reason } => {
                    warn!(id, reason = %reason, "skipping retrieval hit");
                    None
                }
            })
            .collect())
    }

    /// Like [`retrieve_filtered`](Self::retrieve_filtered), keeping skipped hits.
    pub async fn search(
        &self,
        query: &str,
        k: usize,
        filter: &RetrievalFilter,
    ) -> Result<Vec<HitOutcome>> {
        if query.trim().is_empty() || k == 0 {
            return Ok(Vec::new());
        }

        let mut q = self
            .client
            .embed_query(query, Some(self.index.dims()))
            .await?;
        normalize(&mut q);

        let hits = if filter.is_empty() {
            self.index.search(&q, k)?
        } else {
            self.index.search_filtered(&q, k, |id| {
                self.entry(id).map_or(false, |e| filter.matches(e))
            })?
        };
        debug!(hits = hits.len(), k, "index search");

        let mut cache: HashMap<(String, String), CachedDocument> = HashMap::new();
        Ok(hits
            .into_iter()
            .map(|(id, score)| self.resolve(id, score, &mut cache))
            .collect())
    }

    fn entry(&self, id: u64) -> Option<&IndexEntry> {
        self.positions.get(&id).map(|&pos| &self.entries[pos])
    }

    fn resolve(
        &self,
        id: u64,
        score: f32,
        cache: &mut HashMap<(String, String), CachedDocument>,
    ) -> HitOutcome {
        let Some(entry) = self.entry(id) else {
            return HitOutcome::Skipped {
                id,
                reason: "no metadata entry".to_string(),
            };
        };

        let cached = cache
            .entry((entry.ticker.clone(), entry.accession.clone()))
            .or_insert_with(|| self.load_windows(entry));
        let (text, windows) = match cached {
            Ok(doc) => doc,
            Err(reason) => {
                return HitOutcome::Skipped {
                    id,
                    reason: reason.clone(),
                }
            }
        };

        let Some(window) = windows.get(entry.chunk_index) else {
            return HitOutcome::Skipped {
                id,
                reason: format!(
                    "document has {} chunks, entry points at {}",
                    windows.len(),
                    entry.chunk_index
                ),
            };
        };
        let chunk = text[window.bytes.clone()].to_string();

        if let Some(expected) = &entry.chunk_hash {
            if hash_text(&chunk) != *expected {
                return HitOutcome::Skipped {
                    id,
                    reason: "reconstructed chunk differs from the indexed text".to_string(),
                };
            }
        }

        HitOutcome::Found(RetrievedChunk::from_entry(entry, score, chunk))
    }

    fn load_windows(&self, entry: &IndexEntry) -> CachedDocument {
        let doc = DocumentRef {
            ticker: entry.ticker.clone(),
            accession: entry.accession.clone(),
            path: document_path(&self.corpus_root, &entry.ticker, &entry.accession),
        };
        let record = load_document(&doc).map_err(|e| e.to_string())?;
        let windows = self
            .chunker
            .windows(&record.text)
            .map_err(|e| e.to_string())?;
        Ok((record.text, windows))
    }
}

/// Join hit texts into one context blob for a chat prompt.
pub fn format_context(hits: &[RetrievedChunk]) -> String {
    hits.iter()
        .map(|h| h.text.as_str())
        .collect::<Vec<_>>()
        .join(CONTEXT_SEPARATOR)
}

/// Output format for `frag search`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchOutput {
    Human,
    Json,
    Context,
}

/// `frag search`: query the index and print the hits.
pub async fn run_search(
    config: &Config,
    query: &str,
    k: Option<usize>,
    filter: RetrievalFilter,
    output: SearchOutput,
) -> anyhow::Result<()> {
    let retriever = match Retriever::from_config(config) {
        Ok(r) => r,
        Err(RagError::NotIndexed(_)) => anyhow::bail!("No data available. Run `frag index` first."),
        Err(e) => return Err(e.into()),
    };

    let k = k.unwrap_or(config.retrieval.top_k);
    let hits = retriever.retrieve_filtered(query, k, &filter).await?;

    match output {
        SearchOutput::Json => {
            println!("{}", serde_json::to_string_pretty(&hits)?);
        }
        SearchOutput::Context => {
            println!("{}", format_context(&hits));
        }
        SearchOutput::Human => {
            if hits.is_empty() {
                println!("No results.");
                return Ok(());
            }
            for (i, hit) in hits.iter().enumerate() {
                println!(
                    "{}. [{:.4}] {} / {} #{}",
                    i + 1,
                    hit.score,
                    hit.ticker,
                    hit.accession,
                    hit.chunk_index
                );
                println!("    filed: {}", hit.filing_date);
                if let Some(form) = &hit.form {
                    println!("    form: {}", form);
                }
                println!("    id: {}", hit.id);
                println!("    text: \"{}\"", excerpt(&hit.text, 240));
                println!();
            }
        }
    }
    Ok(())
}

fn excerpt(text: &str, max_chars: usize) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    match flat.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}...", &flat[..cut]),
        None => flat,
    }
}

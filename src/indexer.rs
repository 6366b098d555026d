//! Incremental indexing: scan the corpus, embed chunks not yet indexed,
//! append them, and persist once at the end.
//!
//! A run holds `index.lock` for its whole duration. Nothing is written
//! until every pending chunk has been embedded, so a provider failure or
//! a crash mid-run leaves the previous index untouched. A run that finds
//! nothing new writes nothing at all.

use anyhow::Context;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::chunk::{hash_text, Chunker};
use crate::config::{Config, IndexPaths};
use crate::corpus::{load_document, scan_corpus};
use crate::embedding::{normalize, EmbeddingClient};
use crate::error::Result;
use crate::models::IndexEntry;
use crate::progress::{IndexProgressEvent, IndexProgressReporter, NoProgress, ProgressMode};
use crate::store::{IndexLock, IndexStore};
use crate::vector_index::FlatIndex;

/// Outcome of [`Indexer::update_index`] or [`Indexer::plan`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexReport {
    pub documents_scanned: usize,
    /// Unreadable or malformed document files.
    pub documents_skipped: usize,
    /// Chunks embedded and appended by this run (or that would be, for a plan).
    pub processed_count: usize,
    pub total_entries: usize,
}

/// A chunk queued for embedding, with its id already assigned.
struct PendingChunk {
    entry: IndexEntry,
    text: String,
}

struct ScanResult {
    pending: Vec<PendingChunk>,
    documents_scanned: usize,
    documents_skipped: usize,
}

pub struct Indexer {
    paths: IndexPaths,
    corpus_root: PathBuf,
    chunker: Chunker,
    client: EmbeddingClient,
    batch_size: usize,
    batch_delay: Duration,
    progress: Box<dyn IndexProgressReporter>,
}

impl Indexer {
    pub fn new(
        paths: IndexPaths,
        corpus_root: PathBuf,
        chunker: Chunker,
        client: EmbeddingClient,
    ) -> Self {
        Self {
            paths,
            corpus_root,
            chunker,
            client,
            batch_size: 100,
            batch_delay: Duration::ZERO,
            progress: Box::new(NoProgress),
        }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let chunker = Chunker::from_config(&config.chunking)?;
        let client = EmbeddingClient::from_config(&config.embedding)?;
        Ok(Self::new(
            config.index.paths(),
            config.corpus.root.clone(),
            chunker,
            client,
        )
        .with_batch_size(config.embedding.batch_size)
        .with_batch_delay(Duration::from_millis(config.embedding.batch_delay_ms)))
    }

    /// Texts per provider call. Zero is treated as one.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Pause between consecutive provider calls.
    pub fn with_batch_delay(mut self, delay: Duration) -> Self {
        self.batch_delay = delay;
        self
    }

    pub fn with_progress(mut self, progress: Box<dyn IndexProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    /// Count what a run would embed, without calling the provider or
    /// writing anything.
    pub fn plan(&self) -> Result<IndexReport> {
        let store = self.load_store()?;
        let scan = self.scan(&store)?;
        Ok(IndexReport {
            documents_scanned: scan.documents_scanned,
            documents_skipped: scan.documents_skipped,
            processed_count: scan.pending.len(),
            total_entries: store.len(),
        })
    }

    /// Bring the index up to date with the corpus.
    pub async fn update_index(&self) -> Result<IndexReport> {
        let _lock = IndexLock::acquire(&self.paths.lock)?;
        let mut store = self.load_store()?;

        let scan = self.scan(&store)?;
        let mut report = IndexReport {
            documents_scanned: scan.documents_scanned,
            documents_skipped: scan.documents_skipped,
            processed_count: 0,
            total_entries: store.len(),
        };
        self.progress.report(IndexProgressEvent::Scanned {
            documents: scan.documents_scanned as u64,
            pending: scan.pending.len() as u64,
        });

        if scan.pending.is_empty() {
            info!(entries = store.len(), "index already up to date");
            return Ok(report);
        }

        let total = scan.pending.len();
        let mut dims = store.dims();
        let mut ids = Vec::with_capacity(total);
        let mut vectors = Vec::with_capacity(total);

        for (i, batch) in scan.pending.chunks(self.batch_size).enumerate() {
            if i > 0 && !self.batch_delay.is_zero() {
                tokio::time::sleep(self.batch_delay).await;
            }
            let texts: Vec<String> = batch.iter().map(|p| p.text.clone()).collect();
            let mut embedded = self.client.embed_batch(&texts, dims).await?;

            for (item, mut v) in batch.iter().zip(embedded.drain(..)) {
                if dims.is_none() {
                    dims = Some(v.len());
                }
                normalize(&mut v);
                ids.push(item.entry.id);
                vectors.push(v);
            }
            self.progress.report(IndexProgressEvent::Embedding {
                n: vectors.len() as u64,
                total: total as u64,
            });
            debug!(batch = i, done = vectors.len(), total, "embedded batch");
        }

        let mut index = match store.index.take() {
            Some(index) => index,
            None => FlatIndex::create_empty(dims.unwrap_or_default())?,
        };
        index.add(&ids, &vectors)?;
        store.index = Some(index);

        let last_id = scan.pending.last().map(|p| p.entry.id);
        store
            .manifest
            .entries
            .extend(scan.pending.into_iter().map(|p| p.entry));
        if let Some(last) = last_id {
            store.manifest.next_id = store.manifest.next_id.max(last + 1);
        }
        store.save(&self.paths)?;

        report.processed_count = total;
        report.total_entries = store.len();
        info!(
            processed = report.processed_count,
            entries = report.total_entries,
            "index updated"
        );
        Ok(report)
    }

    fn load_store(&self) -> Result<IndexStore> {
        IndexStore::load_or_empty(
            &self.paths,
            &self.chunker.profile(),
            self.client.model_name(),
        )
    }

    /// Chunk every document and queue the chunks whose keys are not yet
    /// indexed, assigning ids from the store's `next_id`.
    fn scan(&self, store: &IndexStore) -> Result<ScanResult> {
        let existing = store.manifest.existing_keys();
        let mut next_id = store.manifest.next_id;
        let mut result = ScanResult {
            pending: Vec::new(),
            documents_scanned: 0,
            documents_skipped: 0,
        };

        for doc in scan_corpus(&self.corpus_root)? {
            result.documents_scanned += 1;
            let record = match load_document(&doc) {
                Ok(r) => r,
                Err(e) => {
                    warn!(path = %doc.path.display(), error = %e, "skipping document");
                    result.documents_skipped += 1;
                    continue;
                }
            };

            for (chunk_index, text) in self.chunker.chunk(&record.text)?.into_iter().enumerate() {
                let entry = IndexEntry {
                    id: next_id,
                    ticker: record.ticker.clone(),
                    accession: record.accession.clone(),
                    chunk_index,
                    filing_date: record.filing_date.clone(),
                    form: record.form.clone(),
                    chunk_hash: Some(hash_text(&text)),
                };
                if existing.contains(&entry.key()) {
                    continue;
                }
                next_id += 1;
                result.pending.push(PendingChunk { entry, text });
            }
        }

        Ok(result)
    }
}

/// `frag index`: run the indexer and print a summary.
pub async fn run_index(
    config: &Config,
    dry_run: bool,
    batch_size: Option<usize>,
    progress: ProgressMode,
) -> anyhow::Result<()> {
    let indexer = Indexer::from_config(config)?
        .with_batch_size(batch_size.unwrap_or(config.embedding.batch_size))
        .with_progress(progress.reporter());

    if dry_run {
        let plan = indexer.plan()?;
        println!("index (dry-run)");
        println!("  documents scanned: {}", plan.documents_scanned);
        println!("  documents skipped: {}", plan.documents_skipped);
        println!("  chunks to embed: {}", plan.processed_count);
        println!("  existing entries: {}", plan.total_entries);
        return Ok(());
    }

    if !config.embedding.is_enabled() {
        anyhow::bail!("Embedding provider is disabled. Set [embedding] provider in config.");
    }

    // Dropping the run on a signal releases index.lock; nothing is written
    // before the final save.
    let report = tokio::select! {
        result = indexer.update_index() => {
            result.with_context(|| format!("indexing {}", config.corpus.root.display()))?
        }
        signal = shutdown_signal() => {
            anyhow::bail!("indexing interrupted by {}; index left unchanged", signal);
        }
    };

    println!("index");
    println!("  documents scanned: {}", report.documents_scanned);
    println!("  documents skipped: {}", report.documents_skipped);
    println!("  processed_count: {}", report.processed_count);
    println!("  total entries: {}", report.total_entries);
    Ok(())
}

/// Resolves with the signal name on Ctrl+C or, on unix, SIGTERM.
async fn shutdown_signal() -> &'static str {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => "Ctrl+C",
        _ = terminate => "SIGTERM",
    }
}


//! # Filing RAG
//!
//! Incremental chunk-embedding index and retriever for SEC 10-K/10-Q filings.
//!
//! Filing text is split into overlapping token windows, each window is
//! embedded once and appended to a flat vector index, and queries return
//! the nearest chunks with their text rebuilt from the source documents.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌─────────┐   ┌───────────┐   ┌──────────────────┐
//! │  Corpus  │──▶│ Chunker │──▶│ Embedding │──▶│ vectors.idx      │
//! │ <t>/<a>  │   │         │   │  client   │   │ metadata.json    │
//! └──────────┘   └─────────┘   └───────────┘   └────────┬─────────┘
//!      ▲                                                │
//!      │          re-chunk on demand                    ▼
//!      └───────────────────────────────────────── Retriever ◀── query
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! frag index                       # embed new chunks
//! frag search "supply chain risk" --ticker AAPL -k 5
//! frag stats
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`error`] | Error taxonomy |
//! | [`models`] | Document, index entry, and hit types |
//! | [`corpus`] | Corpus layout and document loading |
//! | [`chunk`] | Tokenizers and overlapping token windows |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`vector_index`] | Flat inner-product vector index |
//! | [`metadata`] | Metadata sidecar with chunking profile header |
//! | [`store`] | Paired atomic persistence and the index lock |
//! | [`indexer`] | Incremental indexing |
//! | [`retrieve`] | Query-time retrieval and context assembly |
//! | [`progress`] | Indexing progress reporting |
//! | [`stats`] | Index statistics |

pub mod chunk;
pub mod config;
pub mod corpus;
pub mod embedding;
pub mod error;
pub mod indexer;
pub mod metadata;
pub mod models;
pub mod progress;
pub mod retrieve;
pub mod stats;
pub mod store;
pub mod vector_index;

pub use chunk::{chunk_text, Chunker};
pub use embedding::{Embedder, EmbeddingClient};
pub use error::{RagError, Result};
pub use indexer::{IndexReport, Indexer};
pub use retrieve::{format_context, RetrievalFilter, Retriever};

use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::error::{RagError, Result};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub corpus: CorpusConfig,
    pub index: IndexConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CorpusConfig {
    /// One subdirectory per ticker, one `<accession>.json` per filing.
    pub root: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    pub dir: PathBuf,
}

/// File locations derived from `[index].dir`.
#[derive(Debug, Clone)]
pub struct IndexPaths {
    pub vectors: PathBuf,
    pub metadata: PathBuf,
    pub lock: PathBuf,
}

impl IndexPaths {
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            vectors: dir.join("vectors.idx"),
            metadata: dir.join("metadata.json"),
            lock: dir.join("index.lock"),
        }
    }
}

impl IndexConfig {
    pub fn paths(&self) -> IndexPaths {
        IndexPaths::in_dir(&self.dir)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_overlap")]
    pub overlap: usize,
    #[serde(default = "default_tokenizer")]
    pub tokenizer: String,
    /// Path to a `tokenizer.json`, required when `tokenizer = "hf"`.
    #[serde(default)]
    pub tokenizer_file: Option<PathBuf>,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            overlap: default_overlap(),
            tokenizer: default_tokenizer(),
            tokenizer_file: None,
        }
    }
}

fn default_chunk_size() -> usize {
    1000
}
fn default_overlap() -> usize {
    200
}
fn default_tokenizer() -> String {
    "word-v1".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Fixed pause between consecutive batch calls.
    #[serde(default)]
    pub batch_delay_ms: u64,
    /// Base URL for the Ollama provider.
    #[serde(default)]
    pub url: Option<String>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            batch_delay_ms: 0,
            url: None,
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    100
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
        }
    }
}

fn default_top_k() -> usize {
    5
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        RagError::config(format!(
            "failed to read config file {}: {}",
            path.display(),
            e
        ))
    })?;

    let config: Config = toml::from_str(&content)
        .map_err(|e| RagError::config(format!("failed to parse config file: {}", e)))?;

    validate(&config)?;
    Ok(config)
}

/// Check every parameter that would otherwise fail (or loop) mid-run.
pub fn validate(config: &Config) -> Result<()> {
    let chunking = &config.chunking;
    if chunking.chunk_size == 0 {
        return Err(RagError::config("chunking.chunk_size must be > 0"));
    }
    if chunking.overlap >= chunking.chunk_size {
        return Err(RagError::config(format!(
            "chunking.overlap ({}) must be smaller than chunking.chunk_size ({})",
            chunking.overlap, chunking.chunk_size
        )));
    }
    match chunking.tokenizer.as_str() {
        "word-v1" => {}
        "hf" => {
            if chunking.tokenizer_file.is_none() {
                return Err(RagError::config(
                    "chunking.tokenizer_file must be set when tokenizer = \"hf\"",
                ));
            }
        }
        other => {
            return Err(RagError::config(format!(
                "unknown tokenizer '{}'. Must be word-v1 or hf.",
                other
            )))
        }
    }

    if config.retrieval.top_k == 0 {
        return Err(RagError::config("retrieval.top_k must be >= 1"));
    }

    let embedding = &config.embedding;
    if embedding.batch_size == 0 {
        return Err(RagError::config("embedding.batch_size must be > 0"));
    }
    if embedding.dims == Some(0) {
        return Err(RagError::config("embedding.dims must be > 0 when set"));
    }

    match embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" | "local" => {}
        other => {
            return Err(RagError::config(format!(
                "unknown embedding provider: '{}'. Must be disabled, openai, ollama, or local.",
                other
            )))
        }
    }

    if embedding.is_enabled() && embedding.provider != "local" && embedding.model.is_none() {
        return Err(RagError::config(format!(
            "embedding.model must be specified when provider is '{}'",
            embedding.provider
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_src: &str) -> Result<Config> {
        let config: Config = toml::from_str(toml_src).expect("toml parses");
        validate(&config)?;
        Ok(config)
    }

    const BASE: &str = r#"
[corpus]
root = "data"

[index]
dir = "index"
"#;

    #[test]
    fn test_defaults_match_filing_pipeline() {
        let config = parse(BASE).unwrap();
        assert_eq!(config.chunking.chunk_size, 1000);
        assert_eq!(config.chunking.overlap, 200);
        assert_eq!(config.chunking.tokenizer, "word-v1");
        assert_eq!(config.retrieval.top_k, 5);
        assert!(!config.embedding.is_enabled());
        assert_eq!(config.index.paths().metadata, PathBuf::from("index/metadata.json"));
    }

    #[test]
    fn test_overlap_not_smaller_than_chunk_size_rejected() {
        let src = format!("{}\n[chunking]\nchunk_size = 100\noverlap = 100\n", BASE);
        let err = parse(&src).unwrap_err();
        assert!(matches!(err, RagError::Configuration(_)));
    }

    #[test]
    fn test_unknown_provider_rejected() {
        let src = format!("{}\n[embedding]\nprovider = \"gemini\"\nmodel = \"x\"\n", BASE);
        assert!(matches!(parse(&src), Err(RagError::Configuration(_))));
    }

    #[test]
    fn test_openai_requires_model() {
        let src = format!("{}\n[embedding]\nprovider = \"openai\"\n", BASE);
        assert!(matches!(parse(&src), Err(RagError::Configuration(_))));
    }

    #[test]
    fn test_hf_tokenizer_requires_file() {
        let src = format!("{}\n[chunking]\ntokenizer = \"hf\"\n", BASE);
        assert!(matches!(parse(&src), Err(RagError::Configuration(_))));
    }
}

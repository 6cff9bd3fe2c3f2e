//! Manager configuration and the CLI front-end for the diagnostic harness.
//!
//! `KVCacheConfig` is the one piece of this crate that is validated and can
//! fail: everywhere else the manager mandates small returns (`None`,
//! `false`) over `Result`, but construction-time misconfiguration (an empty
//! group list, a zero block size) is a programmer error in the embedder, not
//! a runtime condition to recover from, so it is surfaced once, loudly, via
//! `thiserror`.

use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::hash::HashAlgo;

/// Command-line arguments for the `kv-cache-tier-demo` trace-replay harness.
#[derive(Parser, Debug, Clone)]
#[command(name = "kv-cache-tier-demo", about = "Replays a token trace against a KVCacheManager and prints cache stats")]
pub struct Cli {
    /// Path to a KVCacheConfig JSON file. Falls back to built-in defaults
    /// when absent.
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// Path to a trace file: one JSON array of token ids per line, one line
    /// per simulated request. Reads from stdin when omitted.
    #[arg(short, long)]
    pub trace: Option<PathBuf>,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,
}

/// How a block's fingerprint is computed. Mirrors [`HashAlgo`] with
/// serde-friendly naming for config files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CachingHashAlgo {
    Builtin64,
    Sha256,
    Sha256Cbor64,
}

impl Default for CachingHashAlgo {
    fn default() -> Self {
        CachingHashAlgo::Builtin64
    }
}

impl From<CachingHashAlgo> for HashAlgo {
    fn from(a: CachingHashAlgo) -> Self {
        match a {
            CachingHashAlgo::Builtin64 => HashAlgo::Builtin64,
            CachingHashAlgo::Sha256 => HashAlgo::Sha256,
            CachingHashAlgo::Sha256Cbor64 => HashAlgo::Sha256Cbor64,
        }
    }
}

/// What attention pattern a KV cache group implements, and therefore how far
/// back into the prefix it needs real (non-null) blocks materialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum GroupKind {
    FullAttention,
    SlidingWindow { window_tokens: usize },
}

impl GroupKind {
    /// The window width in blocks, rounded up, or `None` for full attention
    /// (which has no window: every position in the prefix must be real).
    pub fn window_blocks(&self, block_size: usize) -> Option<usize> {
        match self {
            GroupKind::FullAttention => None,
            GroupKind::SlidingWindow { window_tokens } => {
                Some((window_tokens + block_size - 1) / block_size)
            }
        }
    }
}

/// One KV cache group: a set of layers sharing an attention pattern and
/// therefore a cache-hit rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KVCacheGroupSpec {
    pub block_size: usize,
    pub kind: GroupKind,
    pub layer_names: Vec<String>,
}

/// Top-level manager configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KVCacheConfig {
    /// Total number of block slots in the pool, including the null block.
    pub num_blocks: usize,
    pub groups: Vec<KVCacheGroupSpec>,
    pub max_model_len: usize,
    pub enable_caching: bool,
    pub caching_hash_algo: CachingHashAlgo,
    pub use_eagle: bool,
    pub log_stats: bool,
    pub enable_kv_cache_events: bool,
}

impl Default for KVCacheConfig {
    fn default() -> Self {
        Self {
            num_blocks: 1024,
            groups: vec![KVCacheGroupSpec {
                block_size: 16,
                kind: GroupKind::FullAttention,
                layer_names: vec!["layer_0".to_string()],
            }],
            max_model_len: 32768,
            enable_caching: true,
            caching_hash_algo: CachingHashAlgo::Builtin64,
            use_eagle: false,
            log_stats: true,
            enable_kv_cache_events: false,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("num_blocks must be at least 1 (for the null block), got {0}")]
    NoBlocks(usize),
    #[error("at least one KV cache group must be configured")]
    NoGroups,
    #[error("group {index} has block_size 0")]
    ZeroBlockSize { index: usize },
    #[error("all KV cache groups must share one block_size; group 0 has {expected}, group {index} has {actual}")]
    MismatchedBlockSize {
        index: usize,
        expected: usize,
        actual: usize,
    },
    #[error("group {index} is a sliding-window group with window_tokens 0")]
    ZeroWindow { index: usize },
}

impl KVCacheConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_blocks < 1 {
            return Err(ConfigError::NoBlocks(self.num_blocks));
        }
        if self.groups.is_empty() {
            return Err(ConfigError::NoGroups);
        }
        let expected = self.groups[0].block_size;
        for (index, group) in self.groups.iter().enumerate() {
            if group.block_size == 0 {
                return Err(ConfigError::ZeroBlockSize { index });
            }
            if group.block_size != expected {
                return Err(ConfigError::MismatchedBlockSize {
                    index,
                    expected,
                    actual: group.block_size,
                });
            }
            if let GroupKind::SlidingWindow { window_tokens } = group.kind {
                if window_tokens == 0 {
                    return Err(ConfigError::ZeroWindow { index });
                }
            }
        }
        Ok(())
    }

    pub fn block_size(&self) -> usize {
        self.groups[0].block_size
    }

    /// Loads a config from a JSON file, falling back to defaults when the
    /// file is absent.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let config: KVCacheConfig = serde_json::from_str(&data)?;
            Ok(config)
        } else {
            tracing::warn!("config file not found at {:?}, using defaults", path);
            Ok(KVCacheConfig::default())
        }
    }
}

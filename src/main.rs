//! kv-cache-tier-demo: a diagnostic harness for `KVCacheManager`.
//!
//! Loads a `KVCacheConfig` (JSON file or built-in defaults), replays a trace
//! of token sequences as simulated requests — one prefill followed by a
//! handful of decode steps each — and prints the resulting prefix cache
//! stats and event stream. This is not a model server: no tensors, no
//! attention kernels, no HTTP. Model execution lives outside this crate.

use std::io::Read;

use clap::Parser;
use tracing::info;

use kv_cache_tier::cache::manager::KVCacheManager;
use kv_cache_tier::cache::request::Request;
use kv_cache_tier::config::{Cli, KVCacheConfig};

/// Reads one token sequence (a JSON array of integers) per line from a
/// trace file, or from stdin when no file is given.
fn read_trace(cli: &Cli) -> anyhow::Result<Vec<Vec<u32>>> {
    let text = match &cli.trace {
        Some(path) => std::fs::read_to_string(path)?,
        None => {
            let mut buf = String::new();
            std::io::stdin().lock().read_to_string(&mut buf)?;
            buf
        }
    };
    let mut sequences = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        sequences.push(serde_json::from_str::<Vec<u32>>(line)?);
    }
    Ok(sequences)
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "kv_cache_tier=debug"
    } else {
        "kv_cache_tier=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with_target(true)
        .init();

    info!("kv-cache-tier-demo v{}", env!("CARGO_PKG_VERSION"));

    let config = KVCacheConfig::load(&cli.config)?;
    config.validate().map_err(anyhow::Error::from)?;
    info!(
        num_blocks = config.num_blocks,
        num_groups = config.groups.len(),
        block_size = config.block_size(),
        "configuration loaded"
    );

    let mut manager = KVCacheManager::new(config)?;

    let trace = read_trace(&cli)?;
    if trace.is_empty() {
        info!("empty trace, nothing to replay");
        return Ok(());
    }

    for (i, token_ids) in trace.into_iter().enumerate() {
        let mut request = Request::new(format!("req{i}"), token_ids.clone());
        let (hit, num_computed_tokens) = manager.get_computed_blocks(&request);
        let Some(blocks) = manager.allocate_slots(&mut request, token_ids.len(), 0, Some(hit)) else {
            info!(request_id = %request.request_id, "allocation failed: pool exhausted");
            continue;
        };
        info!(
            request_id = %request.request_id,
            num_tokens = token_ids.len(),
            num_computed_tokens,
            num_blocks = blocks.get_block_ids()[0].len(),
            "replayed request"
        );
        manager.free(&request);
    }

    if let Some(stats) = manager.prefix_cache_stats() {
        info!(
            queries = stats.queries,
            hits = stats.hits,
            hit_rate = stats.hit_rate(),
            "prefix cache stats"
        );
    }

    for event in manager.take_events() {
        info!(?event, "cache event");
    }

    Ok(())
}

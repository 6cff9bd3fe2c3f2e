//! Per-group cache-hit computation and per-request block bookkeeping.
//!
//! One `SingleTypeManager` exists per KV cache group. It owns that group's
//! slice of each request's block list and knows how to compute, for this
//! group alone, how long a prefix hit can be — full-attention groups require
//! every position to be a real cached block; sliding-window groups allow
//! positions outside the trailing window to be represented by the null
//! block.

use std::collections::HashMap;

use crate::cache::block::{BlockId, NULL_BLOCK_ID};
use crate::cache::hash::BlockHash;
use crate::cache::pool::BlockPool;
use crate::config::GroupKind;

pub struct SingleTypeManager {
    pub group_id: u32,
    pub kind: GroupKind,
    pub block_size: usize,
    req_to_blocks: HashMap<String, Vec<BlockId>>,
}

impl SingleTypeManager {
    pub fn new(group_id: u32, kind: GroupKind, block_size: usize) -> Self {
        Self {
            group_id,
            kind,
            block_size,
            req_to_blocks: HashMap::new(),
        }
    }

    pub fn blocks(&self, request_id: &str) -> &[BlockId] {
        self.req_to_blocks
            .get(request_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn num_blocks(&self, request_id: &str) -> usize {
        self.req_to_blocks.get(request_id).map_or(0, Vec::len)
    }

    pub fn append_blocks(&mut self, request_id: &str, ids: &[BlockId]) {
        self.req_to_blocks
            .entry(request_id.to_string())
            .or_default()
            .extend_from_slice(ids);
    }

    pub fn free_request(&mut self, request_id: &str) -> Vec<BlockId> {
        self.req_to_blocks.remove(request_id).unwrap_or_default()
    }

    fn is_cached(&self, hash: &BlockHash, pool: &BlockPool) -> bool {
        pool.get_cached_block(hash, &[self.group_id]).is_some()
    }

    /// The longest prefix length (in blocks) this group alone can offer as a
    /// cache hit for `hashes`, using a single left-to-right pass.
    pub fn max_hit_len(&self, hashes: &[BlockHash], pool: &BlockPool) -> usize {
        match self.kind {
            GroupKind::FullAttention => hashes
                .iter()
                .position(|h| !self.is_cached(h, pool))
                .unwrap_or(hashes.len()),
            GroupKind::SlidingWindow { .. } => {
                let window_blocks = self
                    .kind
                    .window_blocks(self.block_size)
                    .expect("sliding window group always has a window");
                let mut last_bad: Option<usize> = None;
                let mut hit_len = 0;
                for (i, hash) in hashes.iter().enumerate() {
                    if !self.is_cached(hash, pool) {
                        last_bad = Some(i);
                    }
                    let p = i + 1;
                    let threshold = p.saturating_sub(window_blocks);
                    let valid = match last_bad {
                        None => true,
                        Some(bad) => bad < threshold,
                    };
                    if valid {
                        hit_len = p;
                    }
                }
                hit_len
            }
        }
    }

    /// Attempts to materialize this group's block list for a fixed prefix
    /// length `len`. Not guaranteed to succeed even when `len <=
    /// max_hit_len(...)`: sliding-window validity is not prefix-monotonic, so
    /// a shorter length can newly require a position that was previously
    /// inside the (now-larger) window and therefore never checked.
    pub fn try_build(&self, hashes: &[BlockHash], len: usize, pool: &BlockPool) -> Option<Vec<BlockId>> {
        match self.kind {
            GroupKind::FullAttention => {
                let mut out = Vec::with_capacity(len);
                for hash in &hashes[..len] {
                    out.push(pool.get_cached_block(hash, &[self.group_id])?);
                }
                Some(out)
            }
            GroupKind::SlidingWindow { .. } => {
                let window_blocks = self
                    .kind
                    .window_blocks(self.block_size)
                    .expect("sliding window group always has a window");
                let threshold = len.saturating_sub(window_blocks);
                let mut out = Vec::with_capacity(len);
                for (i, hash) in hashes[..len].iter().enumerate() {
                    if i < threshold {
                        out.push(NULL_BLOCK_ID);
                    } else {
                        out.push(pool.get_cached_block(hash, &[self.group_id])?);
                    }
                }
                Some(out)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::hash::{HashAlgo, HashChain};

    fn hashes(n: usize) -> (HashChain, Vec<BlockHash>) {
        let hc = HashChain::new(HashAlgo::Builtin64);
        let tokens: Vec<u32> = (0..(n as u32 * 4)).collect();
        let mut out = Vec::new();
        hc.extend(&mut out, &tokens, 4, &[], None);
        (hc, out)
    }

    #[test]
    fn full_attention_stops_at_first_uncached() {
        let (_, hs) = hashes(4);
        let mgr = SingleTypeManager::new(0, GroupKind::FullAttention, 4);
        let mut pool = BlockPool::new(8, true, false);
        let ids = pool.get_new_blocks(2).unwrap();
        pool.cache_full_blocks(0, &ids, &hs[0..2], 4, None);
        assert_eq!(mgr.max_hit_len(&hs, &pool), 2);
    }

    #[test]
    fn sliding_window_allows_null_outside_trailing_window() {
        let (_, hs) = hashes(3);
        let mgr = SingleTypeManager::new(0, GroupKind::SlidingWindow { window_tokens: 8 }, 4);
        let mut pool = BlockPool::new(8, true, false);
        // Only the last 2 blocks (window = 8 tokens / 4 = 2 blocks) need be real.
        let ids = pool.get_new_blocks(2).unwrap();
        pool.cache_full_blocks(0, &ids, &hs[1..3], 4, None);
        assert_eq!(mgr.max_hit_len(&hs, &pool), 3);
        let built = mgr.try_build(&hs, 3, &pool).unwrap();
        assert_eq!(built[0], NULL_BLOCK_ID);
        assert_ne!(built[1], NULL_BLOCK_ID);
        assert_ne!(built[2], NULL_BLOCK_ID);
    }
}

//! Fans cache-hit computation and slot allocation across every KV cache
//! group, reconciling them into one combined prefix length.

use crate::cache::block::BlockId;
use crate::cache::hash::BlockHash;
use crate::cache::pool::BlockPool;
use crate::cache::single_type::SingleTypeManager;

/// Per-group block id lists, as returned by `get_computed_blocks` and
/// consumed by `allocate_slots`.
#[derive(Debug, Clone, Default)]
pub struct KVCacheBlocks {
    pub blocks: Vec<Vec<BlockId>>,
}

impl KVCacheBlocks {
    pub fn empty(num_groups: usize) -> Self {
        Self {
            blocks: vec![Vec::new(); num_groups],
        }
    }

    pub fn get_block_ids(&self) -> Vec<Vec<BlockId>> {
        self.blocks.clone()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.iter().all(Vec::is_empty)
    }
}

pub struct CacheCoordinator {
    pub groups: Vec<SingleTypeManager>,
}

impl CacheCoordinator {
    pub fn new(groups: Vec<SingleTypeManager>) -> Self {
        Self { groups }
    }

    /// Computes the combined cache hit across every group: each group's own
    /// maximal hit length, intersected by taking the minimum, optionally
    /// decremented by one block for Eagle mode. Because a sliding-window
    /// group's hit validity is not prefix-monotonic, a naively intersected
    /// length can turn out to be infeasible for some group (a position that
    /// was outside that group's own window becomes, at the shorter length,
    /// inside it, and not actually cached) — when that happens the combined
    /// length is shrunk further until every group can realize it, down to a
    /// true miss at zero.
    pub fn find_longest_cache_hit(
        &self,
        hashes: &[BlockHash],
        pool: &BlockPool,
        use_eagle: bool,
    ) -> (usize, KVCacheBlocks) {
        if self.groups.is_empty() || hashes.is_empty() {
            return (0, KVCacheBlocks::empty(self.groups.len()));
        }

        let mut combined = self
            .groups
            .iter()
            .map(|g| g.max_hit_len(hashes, pool))
            .min()
            .unwrap_or(0);

        if use_eagle {
            combined = combined.saturating_sub(1);
        }

        loop {
            if combined == 0 {
                return (0, KVCacheBlocks::empty(self.groups.len()));
            }
            let mut lists = Vec::with_capacity(self.groups.len());
            let mut all_ok = true;
            for group in &self.groups {
                match group.try_build(hashes, combined, pool) {
                    Some(list) => lists.push(list),
                    None => {
                        all_ok = false;
                        break;
                    }
                }
            }
            if all_ok {
                return (combined, KVCacheBlocks { blocks: lists });
            }
            combined -= 1;
        }
    }
}

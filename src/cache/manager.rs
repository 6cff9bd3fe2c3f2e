//! `KVCacheManager`: the public entry point tying the block pool, hash
//! chain, and per-group coordinators together.
//!
//! Single-writer, non-async, no internal locking — the contract is that one
//! scheduler thread owns a `KVCacheManager` and calls into it serially. See
//! [`SharedKVCacheManager`] for embedders that need to hand it across an
//! async boundary; the manager itself performs no synchronization.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use crate::cache::block::NULL_BLOCK_ID;
use crate::cache::coordinator::{CacheCoordinator, KVCacheBlocks};
use crate::cache::events::Event;
use crate::cache::hash::{BlockHash, HashChain};
use crate::cache::pool::BlockPool;
use crate::cache::request::Request;
use crate::cache::single_type::SingleTypeManager;
use crate::config::{ConfigError, KVCacheConfig};

fn div_ceil(a: usize, b: usize) -> usize {
    if a == 0 {
        0
    } else {
        (a + b - 1) / b
    }
}

/// Running totals for the prefix cache hit rate, maintained only when the
/// manager is constructed with `log_stats = true`.
#[derive(Debug, Clone, Default)]
pub struct PrefixCacheStats {
    pub queries: u64,
    pub queried_blocks: u64,
    pub hits: u64,
    pub hit_blocks: u64,
    pub resets: u64,
}

impl PrefixCacheStats {
    pub fn hit_rate(&self) -> f64 {
        if self.queried_blocks == 0 {
            0.0
        } else {
            self.hit_blocks as f64 / self.queried_blocks as f64
        }
    }
}

pub struct KVCacheManager {
    config: KVCacheConfig,
    block_pool: BlockPool,
    coordinator: CacheCoordinator,
    hash_chain: HashChain,
    req_to_block_hashes: HashMap<String, Vec<BlockHash>>,
    stats: Option<PrefixCacheStats>,
}

impl KVCacheManager {
    pub fn new(config: KVCacheConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let block_pool = BlockPool::new(
            config.num_blocks,
            config.enable_caching,
            config.enable_kv_cache_events,
        );
        let hash_chain = HashChain::new(config.caching_hash_algo.into());
        let groups = config
            .groups
            .iter()
            .enumerate()
            .map(|(i, g)| SingleTypeManager::new(i as u32, g.kind, g.block_size))
            .collect();
        let coordinator = CacheCoordinator::new(groups);
        let stats = config.log_stats.then(PrefixCacheStats::default);

        info!(
            num_blocks = config.num_blocks,
            num_groups = config.groups.len(),
            block_size = config.block_size(),
            use_eagle = config.use_eagle,
            "KV cache manager constructed"
        );

        Ok(Self {
            config,
            block_pool,
            coordinator,
            hash_chain,
            req_to_block_hashes: HashMap::new(),
            stats,
        })
    }

    pub fn num_free_blocks(&self) -> usize {
        self.block_pool.num_free_blocks()
    }

    /// Computes how many of `request`'s leading tokens are already backed by
    /// cached blocks, returning the per-group block lists for that prefix
    /// and the token count it covers.
    pub fn get_computed_blocks(&mut self, request: &Request) -> (KVCacheBlocks, usize) {
        let num_groups = self.coordinator.groups.len();
        if !self.config.enable_caching || request.skip_caching {
            self.req_to_block_hashes
                .entry(request.request_id.clone())
                .or_default();
            return (KVCacheBlocks::empty(num_groups), 0);
        }

        let block_size = self.config.block_size();
        {
            let hashes = self
                .req_to_block_hashes
                .entry(request.request_id.clone())
                .or_default();
            self.hash_chain.extend(
                hashes,
                &request.token_ids,
                block_size,
                &request.placeholders,
                request.cache_salt.as_deref(),
            );
        }
        let hashes_snapshot = self.req_to_block_hashes[&request.request_id].clone();

        let match_view: &[BlockHash] = if self.config.use_eagle
            && !hashes_snapshot.is_empty()
            && request.num_tokens() % block_size == 0
        {
            &hashes_snapshot[..hashes_snapshot.len() - 1]
        } else {
            &hashes_snapshot[..]
        };

        let (len, blocks) =
            self.coordinator
                .find_longest_cache_hit(match_view, &self.block_pool, self.config.use_eagle);

        if let Some(stats) = &mut self.stats {
            stats.queries += 1;
            stats.queried_blocks += match_view.len() as u64;
            stats.hit_blocks += len as u64;
            if len > 0 {
                stats.hits += 1;
            }
        }
        debug!(request_id = %request.request_id, hit_blocks = len, "computed prefix cache hit");

        (blocks, len * block_size)
    }

    /// Allocates the blocks needed to cover `num_new_tokens` additional
    /// tokens (plus `num_lookahead_tokens` reserved ahead for speculative
    /// decoding), on top of whatever `new_computed_blocks` prefix hit was
    /// already found. Returns `None` without mutating any state if the pool
    /// cannot satisfy every group's need at once.
    pub fn allocate_slots(
        &mut self,
        request: &mut Request,
        num_new_tokens: usize,
        num_lookahead_tokens: usize,
        new_computed_blocks: Option<KVCacheBlocks>,
    ) -> Option<KVCacheBlocks> {
        let num_groups = self.coordinator.groups.len();
        let hit_blocks =
            new_computed_blocks.unwrap_or_else(|| KVCacheBlocks::empty(num_groups));
        let total_tokens_needed =
            request.num_computed_tokens + num_new_tokens + num_lookahead_tokens;

        let mut need_new = Vec::with_capacity(num_groups);
        for (gi, group) in self.coordinator.groups.iter().enumerate() {
            let total_blocks_needed = div_ceil(total_tokens_needed, group.block_size);
            let hit_len = hit_blocks.blocks.get(gi).map_or(0, Vec::len);
            let existing = group.num_blocks(&request.request_id) + hit_len;
            need_new.push(total_blocks_needed.saturating_sub(existing));
        }
        // Touching a computed-block hit un-frees any of its blocks that are
        // sitting in the free list unreferenced (evicted but not yet
        // overwritten) — those slots must be counted against the budget too,
        // or `touch` below can hand out more slots than are actually free.
        let num_evictable_hit_blocks: usize = hit_blocks
            .blocks
            .iter()
            .flatten()
            .filter(|&&id| self.block_pool.block_is_evictable(id))
            .count();
        let total_need: usize = need_new.iter().sum::<usize>() + num_evictable_hit_blocks;
        if self.block_pool.num_free_blocks() < total_need {
            return None;
        }

        let mut allocated = KVCacheBlocks::empty(num_groups);
        for (gi, group) in self.coordinator.groups.iter_mut().enumerate() {
            let hit = hit_blocks.blocks.get(gi).cloned().unwrap_or_default();
            if !hit.is_empty() {
                self.block_pool.touch(&hit);
                group.append_blocks(&request.request_id, &hit);
            }
            let fresh = if need_new[gi] > 0 {
                self.block_pool
                    .get_new_blocks(need_new[gi])
                    .expect("checked total_need against num_free_blocks above")
            } else {
                Vec::new()
            };
            if !fresh.is_empty() {
                group.append_blocks(&request.request_id, &fresh);
            }
            let mut group_blocks = hit;
            group_blocks.extend(fresh);
            allocated.blocks[gi] = group_blocks;
        }

        self.register_newly_full_blocks(request);

        debug!(
            request_id = %request.request_id,
            new_blocks_drawn = need_new.iter().sum::<usize>(),
            evictable_hit_blocks_reclaimed = num_evictable_hit_blocks,
            "allocated slots"
        );
        Some(allocated)
    }

    /// After allocation, any block that now holds a full `block_size` worth
    /// of tokens and isn't fingerprinted yet gets registered with the
    /// content-address index so future requests can reuse it.
    fn register_newly_full_blocks(&mut self, request: &Request) {
        if !self.config.enable_caching || request.skip_caching {
            return;
        }
        let block_size = self.config.block_size();
        {
            let hashes = self
                .req_to_block_hashes
                .entry(request.request_id.clone())
                .or_default();
            self.hash_chain.extend(
                hashes,
                &request.token_ids,
                block_size,
                &request.placeholders,
                request.cache_salt.as_deref(),
            );
        }
        let hashes_snapshot = self.req_to_block_hashes[&request.request_id].clone();

        for group in &self.coordinator.groups {
            let group_block_ids = group.blocks(&request.request_id).to_vec();
            let limit = hashes_snapshot.len().min(group_block_ids.len());
            let mut new_ids = Vec::new();
            let mut new_hashes = Vec::new();
            for i in 0..limit {
                let id = group_block_ids[i];
                if id == NULL_BLOCK_ID || self.block_pool.block_has_fingerprint(id) {
                    continue;
                }
                new_ids.push(id);
                new_hashes.push(hashes_snapshot[i].clone());
            }
            if !new_ids.is_empty() {
                self.block_pool.cache_full_blocks(
                    group.group_id,
                    &new_ids,
                    &new_hashes,
                    block_size,
                    request.lora_id.clone(),
                );
            }
        }
    }

    /// Releases every block this request holds back to the pool and drops
    /// its memoized hash chain. Already-registered fingerprints remain in
    /// the pool's content-address index for reuse by other requests.
    pub fn free(&mut self, request: &Request) {
        for group in &mut self.coordinator.groups {
            let ids = group.free_request(&request.request_id);
            self.block_pool.free_blocks(&ids);
        }
        self.req_to_block_hashes.remove(&request.request_id);
    }

    /// Clears the content-address index, provided no block is still
    /// referenced by a live request. Returns `false` (and changes nothing)
    /// otherwise.
    pub fn reset_prefix_cache(&mut self) -> bool {
        let ok = self.block_pool.reset_prefix_cache();
        if ok {
            info!("prefix cache reset");
            if let Some(stats) = &mut self.stats {
                stats.resets += 1;
            }
        }
        ok
    }

    pub fn take_events(&mut self) -> Vec<Event> {
        self.block_pool.take_events()
    }

    pub fn prefix_cache_stats(&self) -> Option<&PrefixCacheStats> {
        self.stats.as_ref()
    }
}

/// Convenience alias for embedders sharing a manager across an async
/// boundary. The manager performs no internal locking itself.
pub type SharedKVCacheManager = Arc<Mutex<KVCacheManager>>;

pub fn new_shared_manager(config: KVCacheConfig) -> Result<SharedKVCacheManager, ConfigError> {
    Ok(Arc::new(Mutex::new(KVCacheManager::new(config)?)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CachingHashAlgo, GroupKind, KVCacheGroupSpec};

    fn full_attention_config(num_blocks: usize, block_size: usize) -> KVCacheConfig {
        KVCacheConfig {
            num_blocks,
            groups: vec![KVCacheGroupSpec {
                block_size,
                kind: GroupKind::FullAttention,
                layer_names: vec!["layer_0".to_string()],
            }],
            max_model_len: 8192,
            enable_caching: true,
            caching_hash_algo: CachingHashAlgo::Builtin64,
            use_eagle: false,
            log_stats: true,
            enable_kv_cache_events: true,
        }
    }

    fn tokens(n: usize) -> Vec<u32> {
        (0..n as u32).collect()
    }

    #[test]
    fn prefill_then_identical_request_is_a_full_hit() {
        let mut mgr = KVCacheManager::new(full_attention_config(10, 16)).unwrap();
        let mut req0 = Request::new("req0", tokens(55));
        let (hit0, computed0) = mgr.get_computed_blocks(&req0);
        assert_eq!(computed0, 0);
        let blocks0 = mgr
            .allocate_slots(&mut req0, 55, 0, Some(hit0))
            .expect("enough free blocks");
        assert_eq!(blocks0.blocks[0].len(), 4); // ceil(55/16)

        let req1 = Request::new("req1", tokens(55));
        let (hit1, computed1) = mgr.get_computed_blocks(&req1);
        assert_eq!(computed1, 48); // 3 full blocks * 16
        assert_eq!(hit1.blocks[0].len(), 3);
    }

    #[test]
    fn decode_steps_allocate_one_block_at_a_time() {
        let mut mgr = KVCacheManager::new(full_attention_config(10, 16)).unwrap();
        let mut req = Request::new("req0", tokens(55));
        let (hit, computed) = mgr.get_computed_blocks(&req);
        let blocks = mgr.allocate_slots(&mut req, 55, 0, Some(hit)).unwrap();
        assert_eq!(blocks.blocks[0].len(), 4);
        req.num_computed_tokens = computed + 55;

        for _ in 0..4 {
            req.append_output_token_ids(8);
        }
        let new_blocks = mgr.allocate_slots(&mut req, 4, 0, None).unwrap();
        // 55 + 4 = 59 tokens, ceil(59/16) = 4 blocks total; already had 4.
        assert!(new_blocks.blocks[0].is_empty());
    }

    #[test]
    fn prefill_fails_cleanly_when_not_enough_free_blocks() {
        let mut mgr = KVCacheManager::new(full_attention_config(3, 16)).unwrap();
        let mut req = Request::new("req0", tokens(80));
        let (hit, _) = mgr.get_computed_blocks(&req);
        let before = mgr.num_free_blocks();
        let result = mgr.allocate_slots(&mut req, 80, 0, Some(hit));
        assert!(result.is_none());
        assert_eq!(mgr.num_free_blocks(), before, "failed allocation must not mutate state");
    }

    #[test]
    fn prefill_fails_cleanly_when_computed_hit_blocks_are_still_free() {
        // req0 prefills 3 blocks, then frees them: they stay cached and
        // fingerprinted but sit unreferenced (ref_count == 0) in the free
        // list. req1 shares that 3-block prefix (a computed-block hit) and
        // also needs 3 brand-new blocks beyond it. The pool only has 5 free
        // slots total, and 3 of those are the hit's own blocks — reclaiming
        // them via `touch` leaves only 2 free for the 3 new ones, so the
        // whole allocation must fail up front, not panic partway through.
        let mut mgr = KVCacheManager::new(full_attention_config(6, 16)).unwrap();
        let mut req0 = Request::new("req0", tokens(48));
        let (hit0, _) = mgr.get_computed_blocks(&req0);
        mgr.allocate_slots(&mut req0, 48, 0, Some(hit0)).unwrap();
        mgr.free(&req0);

        let mut req1 = Request::new("req1", tokens(96));
        let (hit1, computed1) = mgr.get_computed_blocks(&req1);
        assert_eq!(computed1, 48, "req1 shares req0's 3-block prefix");
        assert_eq!(hit1.blocks[0].len(), 3);

        let before = mgr.num_free_blocks();
        let result = mgr.allocate_slots(&mut req1, 96, 0, Some(hit1));
        assert!(result.is_none());
        assert_eq!(
            mgr.num_free_blocks(),
            before,
            "rejected allocation must not touch or otherwise mutate pool state"
        );
    }

    #[test]
    fn evict_then_reuse_via_cache_key_salting() {
        let mut mgr = KVCacheManager::new(full_attention_config(10, 16)).unwrap();
        let mut req0 = Request::new("req0", tokens(16)).with_cache_salt("salt1");
        let (hit0, _) = mgr.get_computed_blocks(&req0);
        mgr.allocate_slots(&mut req0, 16, 0, Some(hit0)).unwrap();

        // Same tokens, no salt: must not hit the salted block.
        let req1 = Request::new("req1", tokens(16));
        let (hit1, computed1) = mgr.get_computed_blocks(&req1);
        assert_eq!(computed1, 0);
        assert!(hit1.blocks[0].is_empty());

        // Same tokens, same salt: hits.
        let req2 = Request::new("req2", tokens(16)).with_cache_salt("salt1");
        let (hit2, computed2) = mgr.get_computed_blocks(&req2);
        assert_eq!(computed2, 16);
        assert_eq!(hit2.blocks[0].len(), 1);
    }

    #[test]
    fn reset_prefix_cache_prevents_stale_hits() {
        let mut mgr = KVCacheManager::new(full_attention_config(10, 16)).unwrap();
        let mut req0 = Request::new("req0", tokens(16));
        let (hit0, _) = mgr.get_computed_blocks(&req0);
        mgr.allocate_slots(&mut req0, 16, 0, Some(hit0)).unwrap();
        mgr.free(&req0);

        assert!(mgr.reset_prefix_cache());

        let req1 = Request::new("req1", tokens(16));
        let (hit1, computed1) = mgr.get_computed_blocks(&req1);
        assert_eq!(computed1, 0);
        assert!(hit1.blocks[0].is_empty());
    }

    #[test]
    fn stats_disabled_when_not_requested() {
        let mut cfg = full_attention_config(10, 16);
        cfg.log_stats = false;
        let mut mgr = KVCacheManager::new(cfg).unwrap();
        let req = Request::new("req0", tokens(16));
        mgr.get_computed_blocks(&req);
        assert!(mgr.prefix_cache_stats().is_none());
    }

    #[test]
    fn events_emitted_on_store_and_suppressed_when_disabled() {
        let mut mgr = KVCacheManager::new(full_attention_config(10, 16)).unwrap();
        let mut req = Request::new("req0", tokens(16));
        let (hit, _) = mgr.get_computed_blocks(&req);
        mgr.allocate_slots(&mut req, 16, 0, Some(hit)).unwrap();
        let events = mgr.take_events();
        assert!(events
            .iter()
            .any(|e| matches!(e, Event::BlockStored { .. })));

        let mut cfg = full_attention_config(10, 16);
        cfg.enable_kv_cache_events = false;
        let mut mgr2 = KVCacheManager::new(cfg).unwrap();
        let mut req2 = Request::new("req0", tokens(16));
        let (hit2, _) = mgr2.get_computed_blocks(&req2);
        mgr2.allocate_slots(&mut req2, 16, 0, Some(hit2)).unwrap();
        assert!(mgr2.take_events().is_empty());
    }

    #[test]
    fn eagle_mode_trims_one_block_off_the_hit() {
        let mut cfg = full_attention_config(10, 16);
        cfg.use_eagle = true;
        let mut mgr = KVCacheManager::new(cfg).unwrap();

        let mut req0 = Request::new("req0", tokens(48));
        let (hit0, _) = mgr.get_computed_blocks(&req0);
        mgr.allocate_slots(&mut req0, 48, 0, Some(hit0)).unwrap();

        let req1 = Request::new("req1", tokens(48));
        let (hit1, computed1) = mgr.get_computed_blocks(&req1);
        // Divisible prefix: pop the last hash before matching (2 left), then
        // the standard eagle decrement removes one more.
        assert_eq!(computed1, 16);
        assert_eq!(hit1.blocks[0].len(), 1);
    }
}

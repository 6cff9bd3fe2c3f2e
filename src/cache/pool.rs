//! The block pool: the single fixed-capacity arena of blocks shared by every
//! KV cache group, plus the content-address index that turns a fingerprint
//! into a reusable slot.

use std::collections::{BTreeSet, HashMap};

use tracing::debug;

use crate::cache::block::{Block, BlockId, NULL_BLOCK_ID};
use crate::cache::events::{Event, EventQueue};
use crate::cache::free_list::FreeBlockQueue;
use crate::cache::hash::{BlockHash, BlockHashWithGroupId};

pub struct BlockPool {
    blocks: Vec<Block>,
    free_list: FreeBlockQueue,
    /// Fingerprint -> set of slots currently registered under it. Multiple
    /// slots can share a fingerprint only transiently (e.g. a block evicted
    /// and immediately re-derived elsewhere); in steady state each
    /// fingerprint maps to exactly one slot.
    index: HashMap<BlockHashWithGroupId, BTreeSet<BlockId>>,
    enable_caching: bool,
    events: EventQueue,
}

impl BlockPool {
    pub fn new(num_blocks: usize, enable_caching: bool, enable_kv_cache_events: bool) -> Self {
        assert!(num_blocks >= 1, "pool must have room for the null block");
        let mut blocks: Vec<Block> = Vec::with_capacity(num_blocks);
        blocks.push(Block::new_null());
        for id in 1..num_blocks {
            blocks.push(Block::new(id));
        }
        let mut free_list = FreeBlockQueue::new();
        for id in 1..num_blocks {
            free_list.push_back(&mut blocks, id);
        }
        Self {
            blocks,
            free_list,
            index: HashMap::new(),
            enable_caching,
            events: EventQueue::new(enable_kv_cache_events),
        }
    }

    pub fn num_free_blocks(&self) -> usize {
        self.free_list.num_free()
    }

    pub fn total_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn take_events(&mut self) -> Vec<Event> {
        self.events.take()
    }

    pub fn iterate_free_front_to_back(&self) -> Vec<BlockId> {
        self.free_list.iterate_front_to_back(&self.blocks)
    }

    pub fn block_has_fingerprint(&self, id: BlockId) -> bool {
        self.blocks[id].fingerprint.is_some()
    }

    /// Whether `id` currently sits unreferenced (and therefore still counts
    /// against the free-list budget even though it already holds cached
    /// content) — the null block is always referenced and never evictable.
    pub fn block_is_evictable(&self, id: BlockId) -> bool {
        id != NULL_BLOCK_ID && self.blocks[id].ref_count == 0
    }

    /// All-or-nothing: pops `n` free slots, evicting any that carry a stale
    /// fingerprint, and bumps each to `ref_count = 1`. Returns `None` without
    /// mutating any state if fewer than `n` slots are free.
    pub fn get_new_blocks(&mut self, n: usize) -> Option<Vec<BlockId>> {
        if self.free_list.num_free() < n {
            return None;
        }
        let mut ids = Vec::with_capacity(n);
        for _ in 0..n {
            let id = self
                .free_list
                .pop_front(&mut self.blocks)
                .expect("num_free checked above");
            if self.blocks[id].fingerprint.is_some() {
                self.maybe_evict_cached_block(id);
            }
            self.blocks[id].ref_count = 1;
            ids.push(id);
        }
        Some(ids)
    }

    /// Bumps the ref count of already-held blocks, removing any that were
    /// sitting unreferenced in the free list (a cache hit on a block nobody
    /// currently holds).
    pub fn touch(&mut self, ids: &[BlockId]) {
        for &id in ids {
            if id == NULL_BLOCK_ID {
                continue;
            }
            if self.blocks[id].ref_count == 0 {
                self.free_list.remove(&mut self.blocks, id);
            }
            self.blocks[id].ref_count += 1;
        }
    }

    /// Decrements ref counts, returning now-unreferenced (non-null) blocks to
    /// the back of the free list.
    pub fn free_blocks(&mut self, ids: &[BlockId]) {
        for &id in ids {
            if id == NULL_BLOCK_ID {
                continue;
            }
            debug_assert!(self.blocks[id].ref_count > 0);
            self.blocks[id].ref_count -= 1;
            if self.blocks[id].ref_count == 0 {
                self.free_list.push_back(&mut self.blocks, id);
            }
        }
    }

    /// Returns the lowest-numbered slot registered under `hash` in every
    /// group listed, or `None` if any of those groups lacks it.
    pub fn get_cached_block(&self, hash: &BlockHash, group_ids: &[u32]) -> Option<BlockId> {
        let mut result = None;
        for (i, &group_id) in group_ids.iter().enumerate() {
            let key = BlockHashWithGroupId {
                block_hash: hash.clone(),
                group_id,
            };
            let slots = self.index.get(&key)?;
            let lowest = *slots.iter().next()?;
            if i == 0 {
                result = Some(lowest);
            }
        }
        result
    }

    /// Registers one group's newly-completed blocks with the content-address
    /// index and emits a batched `BlockStored` event.
    pub fn cache_full_blocks(
        &mut self,
        group_id: u32,
        block_ids: &[BlockId],
        hashes: &[BlockHash],
        block_size: usize,
        lora_id: Option<String>,
    ) {
        if !self.enable_caching || block_ids.is_empty() {
            return;
        }
        debug_assert_eq!(block_ids.len(), hashes.len());
        let mut token_ids = Vec::with_capacity(block_ids.len());
        for (&block_id, hash) in block_ids.iter().zip(hashes) {
            debug_assert_ne!(block_id, NULL_BLOCK_ID, "the null block is never content-addressed");
            let key = BlockHashWithGroupId {
                block_hash: hash.clone(),
                group_id,
            };
            self.blocks[block_id].fingerprint = Some(key.clone());
            self.index.entry(key).or_default().insert(block_id);
            token_ids.push(hash.token_ids.to_vec());
            debug!(block_id, group_id, "registered full block with content-address index");
        }
        self.events.push(Event::BlockStored {
            block_hashes: hashes.to_vec(),
            token_ids,
            block_size,
            lora_id,
        });
    }

    /// Clears `block_id`'s fingerprint. Only removes the index's outer entry
    /// (and emits `BlockRemoved`) once its inner slot set becomes empty —
    /// the same fingerprint may still back another slot.
    pub fn maybe_evict_cached_block(&mut self, block_id: BlockId) {
        let Some(key) = self.blocks[block_id].fingerprint.take() else {
            return;
        };
        if let Some(slots) = self.index.get_mut(&key) {
            slots.remove(&block_id);
            if slots.is_empty() {
                self.index.remove(&key);
                self.events.push(Event::BlockRemoved {
                    block_hashes: vec![key.block_hash],
                });
            }
        }
    }

    /// Clears the entire content-address index, provided no non-null block
    /// is still referenced. Free-list *membership* is preserved; iteration
    /// order is reset to ascending slot id.
    pub fn reset_prefix_cache(&mut self) -> bool {
        for block in &self.blocks {
            if !block.is_null() && block.ref_count > 0 {
                return false;
            }
        }
        for block in &mut self.blocks {
            block.fingerprint = None;
        }
        self.index.clear();

        let mut rebuilt = FreeBlockQueue::new();
        for id in 1..self.blocks.len() {
            rebuilt.push_back(&mut self.blocks, id);
        }
        self.free_list = rebuilt;

        self.events.push(Event::AllBlocksCleared);
        true
    }
}

//! The cache event stream: notifications external observers (e.g. a
//! secondary KV cache tier, or a metrics sidecar) can replay to keep their
//! own view of the block pool's content-address index in sync.

use crate::cache::hash::BlockHash;

#[derive(Debug, Clone)]
pub enum Event {
    /// One or more full blocks were registered with the content-address
    /// index. Batched per `cache_full_blocks` call.
    BlockStored {
        block_hashes: Vec<BlockHash>,
        token_ids: Vec<Vec<u32>>,
        block_size: usize,
        lora_id: Option<String>,
    },
    /// A fingerprint's last referencing slot was evicted; observers should
    /// drop it from their own index.
    BlockRemoved { block_hashes: Vec<BlockHash> },
    /// `reset_prefix_cache` succeeded: the entire content-address index was
    /// cleared in one step.
    AllBlocksCleared,
}

/// FIFO queue of events awaiting a `take_events()` drain. Suppressed
/// entirely when the manager is constructed with `enable_kv_cache_events =
/// false`, in which case `push` is a no-op and the queue never grows.
#[derive(Debug, Default)]
pub struct EventQueue {
    enabled: bool,
    events: Vec<Event>,
}

impl EventQueue {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            events: Vec::new(),
        }
    }

    pub fn push(&mut self, event: Event) {
        if self.enabled {
            self.events.push(event);
        }
    }

    /// Drains and returns every event queued since the last call.
    pub fn take(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_queue_drops_events() {
        let mut q = EventQueue::new(false);
        q.push(Event::AllBlocksCleared);
        assert!(q.take().is_empty());
    }

    #[test]
    fn enabled_queue_drains_in_order() {
        let mut q = EventQueue::new(true);
        q.push(Event::AllBlocksCleared);
        q.push(Event::BlockRemoved {
            block_hashes: vec![],
        });
        let drained = q.take();
        assert_eq!(drained.len(), 2);
        assert!(q.take().is_empty());
    }
}

//! kv-cache-tier: a prefix-caching KV block manager for an LLM inference server.
//!
//! Tracks fixed-size token blocks across one or more KV cache groups (full
//! attention, sliding window, ...), content-addresses completed blocks with a
//! hash chain so identical prompt prefixes reuse already-computed KV state,
//! and emits a stream of cache events for external observers.
//!
//! Model execution, tensor storage, tokenization, sampling, and request
//! scheduling live outside this crate; [`cache::manager::KVCacheManager`] only
//! tracks which block holds which tokens.

pub mod cache;
pub mod config;

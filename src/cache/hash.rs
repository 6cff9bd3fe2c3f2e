//! Content-addressed fingerprints and the hash chain that derives them.
//!
//! A block's fingerprint is `H(parent_fingerprint, tokens, extra_keys)`: a
//! Merkle-style chain over the request's token sequence so that two requests
//! sharing a prompt prefix land on identical fingerprints for every block in
//! that shared prefix, block by block.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::cache::request::PlaceholderRange;

/// Which primitive backs fingerprint computation. Configured once per
/// [`HashChain`]; never mixed within a single manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HashAlgo {
    /// `xxhash_rust::xxh3`, a fast non-cryptographic 64-bit hash. The default:
    /// prefix caching only needs collision resistance against accidental
    /// reuse, not against an adversarial caller.
    Builtin64,
    /// SHA-256, truncated to the low 8 bytes (little-endian).
    Sha256,
    /// The same tuple CBOR-encoded before SHA-256, for cross-process
    /// reproducibility independent of this process's in-memory layout.
    Sha256Cbor64,
}

impl Default for HashAlgo {
    fn default() -> Self {
        HashAlgo::Builtin64
    }
}

/// The fingerprint of one completed block: a 64-bit hash value plus the
/// exact token and extra-key tuple it was derived from, so that an accidental
/// 64-bit collision between unrelated blocks cannot be mistaken for a cache
/// hit — equality and hashing both consider the full tuple, not just the
/// scalar value.
#[derive(Debug, Clone)]
pub struct BlockHash {
    pub hash_value: u64,
    pub token_ids: Arc<[u32]>,
    pub extra_keys: Option<Arc<[String]>>,
}

impl PartialEq for BlockHash {
    fn eq(&self, other: &Self) -> bool {
        self.hash_value == other.hash_value
            && self.token_ids == other.token_ids
            && self.extra_keys == other.extra_keys
    }
}
impl Eq for BlockHash {}

impl std::hash::Hash for BlockHash {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.hash_value.hash(state);
        self.token_ids.hash(state);
        self.extra_keys.hash(state);
    }
}

/// A [`BlockHash`] scoped to one KV cache group, keeping groups' fingerprint
/// spaces disjoint even when two groups independently hash identical token
/// content (e.g. a full-attention group and a sliding-window group covering
/// the same prompt).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BlockHashWithGroupId {
    pub block_hash: BlockHash,
    pub group_id: u32,
}

/// Derives block fingerprints for one manager instance.
///
/// `none_hash` — the sentinel "parent" fed to the first block of any
/// request — is computed once per instance rather than as a process-global
/// constant, so two `HashChain`s configured with different algorithms (or
/// under test, two independent chains) never cross-contaminate.
pub struct HashChain {
    algo: HashAlgo,
    none_hash: u64,
}

impl HashChain {
    pub fn new(algo: HashAlgo) -> Self {
        let none_hash = Self::primitive(algo, b"kv-cache-tier/none-hash");
        Self { algo, none_hash }
    }

    pub fn none_hash(&self) -> u64 {
        self.none_hash
    }

    pub fn algo(&self) -> HashAlgo {
        self.algo
    }

    /// Hashes `bytes` under `algo`. `Sha256Cbor64` always CBOR-encodes its
    /// input before hashing rather than hashing raw bytes, so it never
    /// collides with plain `Sha256` over the same input — the two variants
    /// must stay distinguishable even for a fixed seed like `none_hash`.
    fn primitive(algo: HashAlgo, bytes: &[u8]) -> u64 {
        match algo {
            HashAlgo::Builtin64 => xxhash_rust::xxh3::xxh3_64(bytes),
            HashAlgo::Sha256 => {
                let digest = Sha256::digest(bytes);
                u64::from_le_bytes(digest[0..8].try_into().unwrap())
            }
            HashAlgo::Sha256Cbor64 => {
                let mut buf = Vec::new();
                ciborium::into_writer(&bytes, &mut buf)
                    .expect("CBOR encoding of a byte slice cannot fail");
                let digest = Sha256::digest(&buf);
                u64::from_le_bytes(digest[0..8].try_into().unwrap())
            }
        }
    }

    /// Computes the fingerprint of one block given its parent's hash value,
    /// its tokens, and any extra keys (cache salt, multimodal content
    /// hashes) that must be folded into the block identity.
    pub fn hash_block(
        &self,
        parent_hash_value: u64,
        tokens: &[u32],
        extra_keys: Option<&[String]>,
    ) -> BlockHash {
        let hash_value = match self.algo {
            HashAlgo::Builtin64 | HashAlgo::Sha256 => {
                let mut buf = Vec::with_capacity(8 + tokens.len() * 4 + 32);
                buf.extend_from_slice(&parent_hash_value.to_le_bytes());
                for t in tokens {
                    buf.extend_from_slice(&t.to_le_bytes());
                }
                if let Some(keys) = extra_keys {
                    for k in keys {
                        buf.extend_from_slice(&(k.len() as u32).to_le_bytes());
                        buf.extend_from_slice(k.as_bytes());
                    }
                }
                Self::primitive(self.algo, &buf)
            }
            HashAlgo::Sha256Cbor64 => {
                let mut buf = Vec::new();
                let value = (
                    parent_hash_value,
                    tokens.to_vec(),
                    extra_keys.map(|k| k.to_vec()),
                );
                ciborium::into_writer(&value, &mut buf)
                    .expect("CBOR encoding of a plain tuple cannot fail");
                let digest = Sha256::digest(&buf);
                u64::from_le_bytes(digest[0..8].try_into().unwrap())
            }
        };
        BlockHash {
            hash_value,
            token_ids: Arc::from(tokens.to_vec().into_boxed_slice()),
            extra_keys: extra_keys.map(|k| Arc::from(k.to_vec().into_boxed_slice())),
        }
    }

    /// Extends a request's memoized block hash list to cover every full
    /// block in `tokens`. Only the new tail is hashed — `existing` is never
    /// recomputed — so a decode step that appends a handful of tokens does
    /// O(new tokens) work, not O(total tokens).
    pub fn extend(
        &self,
        existing: &mut Vec<BlockHash>,
        tokens: &[u32],
        block_size: usize,
        placeholders: &[PlaceholderRange],
        cache_salt: Option<&str>,
    ) {
        let already = existing.len();
        let total_full_blocks = tokens.len() / block_size;
        for block_idx in already..total_full_blocks {
            let start = block_idx * block_size;
            let end = start + block_size;
            let parent = existing
                .last()
                .map(|h| h.hash_value)
                .unwrap_or(self.none_hash);

            let mut extras: Vec<String> = Vec::new();
            if block_idx == 0 {
                if let Some(salt) = cache_salt {
                    extras.push(salt.to_string());
                }
            }
            for ph in placeholders {
                let ph_end = ph.offset + ph.length;
                if ph.offset < end && ph_end > start {
                    extras.push(ph.content_hash.clone());
                }
            }

            let extra_keys = if extras.is_empty() {
                None
            } else {
                Some(extras.as_slice())
            };
            let hash = self.hash_block(parent, &tokens[start..end], extra_keys);
            existing.push(hash);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain(algo: HashAlgo) -> HashChain {
        HashChain::new(algo)
    }

    #[test]
    fn none_hash_depends_on_algorithm() {
        let a = chain(HashAlgo::Builtin64);
        let b = chain(HashAlgo::Sha256);
        let c = chain(HashAlgo::Sha256Cbor64);
        assert_ne!(a.none_hash(), b.none_hash());
        assert_ne!(b.none_hash(), c.none_hash());
    }

    #[test]
    fn identical_prefixes_produce_identical_chains() {
        let hc = chain(HashAlgo::Builtin64);
        let tokens = vec![1u32, 2, 3, 4, 5, 6, 7, 8];
        let mut a = Vec::new();
        let mut b = Vec::new();
        hc.extend(&mut a, &tokens, 4, &[], None);
        hc.extend(&mut b, &tokens, 4, &[], None);
        assert_eq!(a, b);
        assert_eq!(a.len(), 2);
    }

    #[test]
    fn extend_is_incremental() {
        let hc = chain(HashAlgo::Builtin64);
        let mut hashes = Vec::new();
        hc.extend(&mut hashes, &[1, 2, 3, 4], 4, &[], None);
        assert_eq!(hashes.len(), 1);
        let first = hashes[0].clone();
        hc.extend(&mut hashes, &[1, 2, 3, 4, 5, 6, 7, 8], 4, &[], None);
        assert_eq!(hashes.len(), 2);
        assert_eq!(hashes[0], first, "existing prefix hash must not be recomputed");
    }

    #[test]
    fn cache_salt_only_affects_first_block() {
        let hc = chain(HashAlgo::Builtin64);
        let tokens = vec![1u32, 2, 3, 4, 5, 6, 7, 8];
        let mut salted = Vec::new();
        hc.extend(&mut salted, &tokens, 4, &[], Some("salt1"));
        let mut unsalted = Vec::new();
        hc.extend(&mut unsalted, &tokens, 4, &[], None);

        assert_eq!(salted[0].extra_keys.as_deref(), Some(&["salt1".to_string()][..]));
        assert!(unsalted[0].extra_keys.is_none());
        assert!(salted[1].extra_keys.is_none());
        assert_ne!(salted[0].hash_value, unsalted[0].hash_value);
        // Downstream blocks differ too since the parent hash changed.
        assert_ne!(salted[1].hash_value, unsalted[1].hash_value);
    }

    #[test]
    fn placeholder_hashes_fold_into_intersecting_blocks_only() {
        let hc = chain(HashAlgo::Builtin64);
        let tokens = vec![0u32; 8];
        let placeholders = vec![PlaceholderRange {
            offset: 4,
            length: 2,
            content_hash: "mm-hash-1".to_string(),
        }];
        let mut hashes = Vec::new();
        hc.extend(&mut hashes, &tokens, 4, &placeholders, None);
        assert!(hashes[0].extra_keys.is_none());
        assert_eq!(
            hashes[1].extra_keys.as_deref(),
            Some(&["mm-hash-1".to_string()][..])
        );
    }
}

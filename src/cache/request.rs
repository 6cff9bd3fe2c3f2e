//! The request type the manager tracks per in-flight sequence.
//!
//! Ownership of a `Request` is shared with the external scheduler: the
//! scheduler appends output tokens as decoding proceeds and advances
//! `num_computed_tokens` as the executor catches up. The manager only reads
//! from it and never mutates it except through the explicit helpers below.

/// A contiguous span of multimodal placeholder tokens within a request's
/// token sequence, carrying a content hash so identical multimodal inputs
/// fold into the same block fingerprint.
#[derive(Debug, Clone)]
pub struct PlaceholderRange {
    pub offset: usize,
    pub length: usize,
    pub content_hash: String,
}

/// One in-flight sequence.
#[derive(Debug, Clone)]
pub struct Request {
    pub request_id: String,
    pub token_ids: Vec<u32>,
    pub placeholders: Vec<PlaceholderRange>,
    pub cache_salt: Option<String>,
    pub lora_id: Option<String>,

    /// When set, this request's blocks are never registered with the
    /// content-address index and never looked up against it (e.g. requests
    /// with `prompt_logprobs` enabled, where reusing a cached block would
    /// lose the logprobs the caller asked for).
    pub skip_caching: bool,

    /// How many leading tokens the executor has already produced KV state
    /// for. Set by the external scheduler; read by `allocate_slots` to size
    /// the next allocation.
    pub num_computed_tokens: usize,
}

impl Request {
    pub fn new(request_id: impl Into<String>, token_ids: Vec<u32>) -> Self {
        Self {
            request_id: request_id.into(),
            token_ids,
            placeholders: Vec::new(),
            cache_salt: None,
            lora_id: None,
            skip_caching: false,
            num_computed_tokens: 0,
        }
    }

    pub fn with_cache_salt(mut self, salt: impl Into<String>) -> Self {
        self.cache_salt = Some(salt.into());
        self
    }

    pub fn with_placeholders(mut self, placeholders: Vec<PlaceholderRange>) -> Self {
        self.placeholders = placeholders;
        self
    }

    pub fn skip_caching(mut self) -> Self {
        self.skip_caching = true;
        self
    }

    /// Appends one generated token to the running sequence. Called by the
    /// scheduler once per decode step, before the next `allocate_slots`.
    pub fn append_output_token_ids(&mut self, token_id: u32) {
        self.token_ids.push(token_id);
    }

    pub fn num_tokens(&self) -> usize {
        self.token_ids.len()
    }
}

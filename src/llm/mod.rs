//! LLM generation client.
//!
//! One chat-completion call path with retry, backoff, and circuit-breaker
//! handling for the remote API, and a direct single-shot path for the
//! optional local model.

mod client;
#[cfg(feature = "local")]
mod local;
mod message;
mod remote;

pub use client::{
    LlmClient, LlmConfig, LlmError, DEFAULT_MAX_CONSECUTIVE_FAILURES, DEFAULT_MAX_RETRIES,
    DEFAULT_RETRY_BACKOFF_SECS, DEFAULT_RETRY_JITTER_SECS, DEFAULT_TIMEOUT_SECS,
};
pub use message::{Message, Role};

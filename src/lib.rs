//! # arxiv-digest
//!
//! Fetches arXiv paper metadata for a date/category range and generates
//! summaries through a large language model, reached either as a remote
//! OpenAI-compatible chat-completion API or as a locally loaded GGUF model.
//!
//! The remote path wraps every request in retry-with-backoff and a
//! consecutive-failure circuit breaker; the local path (behind the `local`
//! feature) runs llama.cpp inference in-process with no retries.
//!
//! ## Example
//!
//! ```rust,no_run
//! use arxiv_digest::{ArxivFetcher, FetchConfig, LlmClient, LlmConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut llm = LlmClient::new(
//!         LlmConfig::default()
//!             .with_api_key("sk-...")
//!             .with_model("gpt-4o-mini"),
//!     )
//!     .await?;
//!
//!     let fetcher = ArxivFetcher::new(FetchConfig::new(
//!         ["quant-ph", "physics.optics"],
//!         "20250101",
//!         "20250131",
//!     ));
//!
//!     for paper in fetcher.fetch().await? {
//!         println!("{}: {}", paper.id, paper.tldr(&mut llm).await);
//!     }
//!     Ok(())
//! }
//! ```

pub mod arxiv;
pub mod llm;

pub use arxiv::{ArxivFetcher, ArxivPaper, FetchConfig, FetchError};
pub use llm::{LlmClient, LlmConfig, LlmError, Message, Role};

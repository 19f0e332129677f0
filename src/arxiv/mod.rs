//! arXiv metadata fetching.

mod fetcher;
mod paper;

pub use fetcher::{
    ArxivFetcher, FetchConfig, FetchError, DEFAULT_BATCH_RETRIES, DEFAULT_BATCH_RETRY_DELAY,
    DEFAULT_BATCH_SIZE, DEFAULT_PAGE_DELAY, DEFAULT_PAGE_SIZE,
};
pub use paper::ArxivPaper;

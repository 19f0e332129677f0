//! Paginated fetcher for the arXiv export API.
//!
//! Collects paper ids for a category/date range page by page, de-duplicates
//! across categories, then retrieves full metadata in id-list batches. The
//! arXiv API asks clients to wait a few seconds between calls, so a
//! configurable delay is inserted between consecutive requests.

use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{info, warn};

use super::paper::ArxivPaper;

const API_URL: &str = "http://export.arxiv.org/api/query";

/// Default number of results requested per page.
pub const DEFAULT_PAGE_SIZE: usize = 500;

/// Default delay between consecutive API requests.
pub const DEFAULT_PAGE_DELAY: Duration = Duration::from_secs(3);

/// Default number of ids per metadata batch request.
pub const DEFAULT_BATCH_SIZE: usize = 50;

/// Default number of extra attempts for a failed metadata batch.
pub const DEFAULT_BATCH_RETRIES: u32 = 10;

/// Default delay before retrying a failed metadata batch.
pub const DEFAULT_BATCH_RETRY_DELAY: Duration = Duration::from_secs(10);

/// Fetcher errors.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("invalid date {0}: expected YYYYMMDD")]
    InvalidDate(String),
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("arXiv API error: {0}")]
    Api(String),
    #[error("failed to parse feed: {0}")]
    Parse(String),
}

/// What to fetch: categories, a submission date range, and paging knobs.
#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub categories: Vec<String>,
    /// Inclusive start of the submission date range, `YYYYMMDD`.
    pub start_date: String,
    /// Inclusive end of the submission date range, `YYYYMMDD`.
    pub end_date: String,
    pub page_size: usize,
    pub page_delay: Duration,
    pub batch_size: usize,
    pub batch_retries: u32,
    pub batch_retry_delay: Duration,
}

impl FetchConfig {
    pub fn new(
        categories: impl IntoIterator<Item = impl Into<String>>,
        start_date: impl Into<String>,
        end_date: impl Into<String>,
    ) -> Self {
        Self {
            categories: categories.into_iter().map(Into::into).collect(),
            start_date: start_date.into(),
            end_date: end_date.into(),
            page_size: DEFAULT_PAGE_SIZE,
            page_delay: DEFAULT_PAGE_DELAY,
            batch_size: DEFAULT_BATCH_SIZE,
            batch_retries: DEFAULT_BATCH_RETRIES,
            batch_retry_delay: DEFAULT_BATCH_RETRY_DELAY,
        }
    }

    /// Set the number of results requested per page.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// Set the delay between consecutive API requests.
    pub fn with_page_delay(mut self, delay: Duration) -> Self {
        self.page_delay = delay;
        self
    }

    /// Set the number of ids per metadata batch request.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Set the number of extra attempts for a failed metadata batch.
    pub fn with_batch_retries(mut self, retries: u32) -> Self {
        self.batch_retries = retries;
        self
    }

    /// Set the delay before retrying a failed metadata batch.
    pub fn with_batch_retry_delay(mut self, delay: Duration) -> Self {
        self.batch_retry_delay = delay;
        self
    }

    fn validate(&self) -> Result<(), FetchError> {
        for date in [&self.start_date, &self.end_date] {
            NaiveDate::parse_from_str(date, "%Y%m%d")
                .map_err(|_| FetchError::InvalidDate(date.clone()))?;
        }
        Ok(())
    }
}

/// Client for the arXiv export API.
pub struct ArxivFetcher {
    http: reqwest::Client,
    config: FetchConfig,
    api_url: String,
}

impl ArxivFetcher {
    pub fn new(config: FetchConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
            api_url: API_URL.to_string(),
        }
    }

    /// Point the fetcher at a different export API endpoint (e.g. a mirror).
    pub fn with_api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = api_url.into();
        self
    }

    /// Fetch all papers submitted in the configured date range and
    /// categories. A paper appearing in several categories is returned once.
    pub async fn fetch(&self) -> Result<Vec<ArxivPaper>, FetchError> {
        self.config.validate()?;

        let mut ids: Vec<String> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        for category in &self.config.categories {
            info!(category = %category, "fetching paper ids");
            match self.fetch_category_ids(category).await {
                Ok(category_ids) => {
                    for id in category_ids {
                        if seen.insert(id.clone()) {
                            ids.push(id);
                        }
                    }
                }
                // One bad category should not sink the whole run.
                Err(e) => warn!(category = %category, error = %e, "category fetch failed, skipping"),
            }
        }
        ids.sort();
        info!(count = ids.len(), "collected unique paper ids");

        self.fetch_metadata(&ids).await
    }

    /// Page through one category's results, returning version-stripped ids.
    async fn fetch_category_ids(&self, category: &str) -> Result<Vec<String>, FetchError> {
        let query = format!(
            "cat:{category} AND submittedDate:[{}* TO {}*]",
            self.config.start_date, self.config.end_date
        );

        let mut ids = Vec::new();
        let mut start = 0usize;
        loop {
            if start > 0 {
                sleep(self.config.page_delay).await;
            }
            let start_param = start.to_string();
            let max_param = self.config.page_size.to_string();
            let page = self
                .query_page(&[
                    ("search_query", query.as_str()),
                    ("start", start_param.as_str()),
                    ("max_results", max_param.as_str()),
                ])
                .await?;

            let entries = parse_feed(&page)?;
            if entries.is_empty() {
                break;
            }
            let count = entries.len();
            ids.extend(entries.into_iter().map(|entry| entry.id));
            info!(
                category = %category,
                page_count = count,
                total = ids.len(),
                "retrieved id page"
            );
            start += count;

            // A short page means we have reached the end of the results.
            if count < self.config.page_size {
                break;
            }
        }
        Ok(ids)
    }

    /// Fetch full metadata for the given ids in batches. Unlike the id
    /// collection phase, a failed batch here would discard everything
    /// gathered so far, so each batch is retried before giving up.
    async fn fetch_metadata(&self, ids: &[String]) -> Result<Vec<ArxivPaper>, FetchError> {
        let mut papers = Vec::with_capacity(ids.len());
        for (batch_index, chunk) in ids.chunks(self.config.batch_size).enumerate() {
            if batch_index > 0 {
                sleep(self.config.page_delay).await;
            }
            let id_list = chunk.join(",");
            let max_param = chunk.len().to_string();
            let params = [
                ("id_list", id_list.as_str()),
                ("max_results", max_param.as_str()),
            ];
            let page = with_retries(
                self.config.batch_retries,
                self.config.batch_retry_delay,
                || self.query_page(&params),
            )
            .await?;

            let entries = parse_feed(&page)?;
            info!(
                batch = entries.len(),
                total = papers.len() + entries.len(),
                "retrieved paper metadata"
            );
            papers.extend(entries);
        }
        Ok(papers)
    }

    async fn query_page(&self, params: &[(&str, &str)]) -> Result<String, FetchError> {
        let response = self.http.get(&self.api_url).query(params).send().await?;
        if !response.status().is_success() {
            return Err(FetchError::Api(response.status().to_string()));
        }
        Ok(response.text().await?)
    }
}

/// Run `operation`, retrying up to `retries` more times with a fixed
/// `delay` between attempts. The last error is returned once the budget
/// is spent.
async fn with_retries<T, F, Fut>(
    retries: u32,
    delay: Duration,
    mut operation: F,
) -> Result<T, FetchError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, FetchError>>,
{
    let mut attempt = 0u32;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                attempt += 1;
                if attempt > retries {
                    return Err(e);
                }
                warn!(attempt, max_retries = retries, error = %e, "request failed, retrying");
                sleep(delay).await;
            }
        }
    }
}

/// Parse the entries of one Atom feed page.
fn parse_feed(xml: &str) -> Result<Vec<ArxivPaper>, FetchError> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut papers = Vec::new();
    let mut current: Option<ArxivPaper> = None;
    let mut path: Vec<String> = Vec::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                if name == "entry" {
                    current = Some(ArxivPaper::default());
                } else if let Some(paper) = current.as_mut() {
                    apply_attribute_element(paper, &e);
                }
                path.push(name);
            }
            Ok(Event::Empty(e)) => {
                if let Some(paper) = current.as_mut() {
                    apply_attribute_element(paper, &e);
                }
            }
            Ok(Event::Text(t)) => {
                let Some(paper) = current.as_mut() else {
                    continue;
                };
                let text = t
                    .unescape()
                    .map_err(|e| FetchError::Parse(e.to_string()))?
                    .into_owned();
                let parent = path.iter().rev().nth(1).map(String::as_str);
                match path.last().map(String::as_str) {
                    Some("id") => paper.id = strip_version(text.trim()),
                    Some("title") => append_text(&mut paper.title, &text),
                    Some("summary") => append_text(&mut paper.summary, &text),
                    Some("published") => {
                        paper.published = DateTime::parse_from_rfc3339(text.trim())
                            .ok()
                            .map(|d| d.with_timezone(&Utc));
                    }
                    Some("name") if parent == Some("author") => paper.authors.push(text),
                    _ => {}
                }
            }
            Ok(Event::End(e)) => {
                path.pop();
                if e.name().as_ref() == b"entry" {
                    if let Some(paper) = current.take() {
                        papers.push(paper);
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(FetchError::Parse(e.to_string())),
            _ => {}
        }
    }

    Ok(papers)
}

/// Elements carrying their data in attributes: the PDF link and the
/// primary category. Both appear as empty elements in practice, but some
/// feeds emit them with separate open/close tags.
fn apply_attribute_element(paper: &mut ArxivPaper, e: &BytesStart<'_>) {
    match e.name().as_ref() {
        b"link" => {
            if attr(e, b"title").as_deref() == Some("pdf") {
                paper.pdf_url = attr(e, b"href");
            }
        }
        b"arxiv:primary_category" => {
            if let Some(term) = attr(e, b"term") {
                paper.primary_category = Some(term);
            }
        }
        _ => {}
    }
}

fn attr(e: &BytesStart<'_>, name: &[u8]) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| a.key.as_ref() == name)
        .and_then(|a| a.unescape_value().ok())
        .map(|value| value.into_owned())
}

/// Collapse runs of whitespace; titles and abstracts arrive with feed
/// indentation and hard line breaks embedded.
fn append_text(field: &mut String, text: &str) {
    for word in text.split_whitespace() {
        if !field.is_empty() {
            field.push(' ');
        }
        field.push_str(word);
    }
}

/// Extract the bare id from an Atom entry id URL, dropping the version
/// suffix (`2401.12345v2` becomes `2401.12345`).
fn strip_version(raw: &str) -> String {
    let id = raw.rsplit_once("/abs/").map(|(_, id)| id).unwrap_or(raw);
    match id.rsplit_once('v') {
        Some((base, version))
            if !base.is_empty()
                && !version.is_empty()
                && version.chars().all(|c| c.is_ascii_digit()) =>
        {
            base.to_string()
        }
        _ => id.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    const SAMPLE_FEED: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<feed xmlns="http://www.w3.org/2005/Atom" xmlns:arxiv="http://arxiv.org/schemas/atom">
  <title type="html">ArXiv Query: search_query=cat:quant-ph</title>
  <id>http://arxiv.org/api/abc123</id>
  <entry>
    <id>http://arxiv.org/abs/2401.12345v2</id>
    <published>2024-01-22T18:59:59Z</published>
    <title>Entanglement in
      Long Chains</title>
    <summary>We study entanglement
      in long chains.</summary>
    <author>
      <name>Alice Example</name>
    </author>
    <author>
      <name>Bob Sample</name>
    </author>
    <link title="pdf" href="http://arxiv.org/pdf/2401.12345v2" rel="related" type="application/pdf"/>
    <arxiv:primary_category xmlns:arxiv="http://arxiv.org/schemas/atom" term="quant-ph" scheme="http://arxiv.org/schemas/atom"/>
  </entry>
  <entry>
    <id>http://arxiv.org/abs/quant-ph/0101001v1</id>
    <published>2001-01-01T00:00:00Z</published>
    <title>An Older Paper</title>
    <summary>Nothing to see here.</summary>
    <author>
      <name>Carol Classic</name>
    </author>
  </entry>
</feed>"#;

    #[test]
    fn test_parse_feed_extracts_entries() {
        let papers = parse_feed(SAMPLE_FEED).unwrap();
        assert_eq!(papers.len(), 2);

        let first = &papers[0];
        assert_eq!(first.id, "2401.12345");
        assert_eq!(first.title, "Entanglement in Long Chains");
        assert_eq!(first.summary, "We study entanglement in long chains.");
        assert_eq!(first.authors, vec!["Alice Example", "Bob Sample"]);
        assert_eq!(first.primary_category.as_deref(), Some("quant-ph"));
        assert_eq!(
            first.pdf_url.as_deref(),
            Some("http://arxiv.org/pdf/2401.12345v2")
        );
        let published = first.published.unwrap();
        assert_eq!(published.to_rfc3339(), "2024-01-22T18:59:59+00:00");

        // Old-style ids keep their archive prefix.
        assert_eq!(papers[1].id, "quant-ph/0101001");
    }

    #[test]
    fn test_parse_feed_without_entries() {
        let xml = r#"<?xml version="1.0"?>
<feed xmlns="http://www.w3.org/2005/Atom">
  <title>ArXiv Query</title>
  <id>http://arxiv.org/api/empty</id>
</feed>"#;
        assert!(parse_feed(xml).unwrap().is_empty());
    }

    #[test]
    fn test_strip_version() {
        assert_eq!(strip_version("http://arxiv.org/abs/2401.12345v1"), "2401.12345");
        assert_eq!(strip_version("2401.12345v12"), "2401.12345");
        assert_eq!(strip_version("2401.12345"), "2401.12345");
        assert_eq!(
            strip_version("http://arxiv.org/abs/quant-ph/0101001v1"),
            "quant-ph/0101001"
        );
    }

    #[test]
    fn test_config_builders() {
        let config = FetchConfig::new(["quant-ph"], "20240101", "20240131")
            .with_page_size(100)
            .with_page_delay(Duration::from_secs(1))
            .with_batch_size(25)
            .with_batch_retries(4)
            .with_batch_retry_delay(Duration::from_secs(2));
        assert_eq!(config.page_size, 100);
        assert_eq!(config.page_delay, Duration::from_secs(1));
        assert_eq!(config.batch_size, 25);
        assert_eq!(config.batch_retries, 4);
        assert_eq!(config.batch_retry_delay, Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_retries_recovers_after_failure() {
        let calls = AtomicU32::new(0);
        let started = tokio::time::Instant::now();
        let page = with_retries(2, Duration::from_secs(10), || {
            let attempt = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt == 0 {
                    Err(FetchError::Api("503 Service Unavailable".to_string()))
                } else {
                    Ok("feed".to_string())
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(page, "feed");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(started.elapsed(), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_retries_gives_up_after_budget() {
        let calls = AtomicU32::new(0);
        let result: Result<String, _> = with_retries(2, Duration::from_secs(1), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(FetchError::Api("500 Internal Server Error".to_string())) }
        })
        .await;

        assert!(matches!(result, Err(FetchError::Api(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_invalid_date_rejected() {
        let config = FetchConfig::new(["quant-ph"], "2024-01-01", "20240131");
        assert!(matches!(
            config.validate(),
            Err(FetchError::InvalidDate(_))
        ));
        let config = FetchConfig::new(["quant-ph"], "20240101", "20240131");
        assert!(config.validate().is_ok());
    }
}

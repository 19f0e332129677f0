//! End-to-end tests for the arXiv fetcher against a mocked export API.

use std::time::Duration;

use arxiv_digest::{ArxivFetcher, FetchConfig, FetchError};
use httpmock::Method::GET;
use httpmock::MockServer;

fn entry(id: &str, title: &str) -> String {
    format!(
        "<entry>\
           <id>http://arxiv.org/abs/{id}</id>\
           <published>2024-01-15T12:00:00Z</published>\
           <title>{title}</title>\
           <summary>An abstract for {title}.</summary>\
           <author><name>Some Author</name></author>\
         </entry>"
    )
}

fn feed(entries: &[String]) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
         <feed xmlns=\"http://www.w3.org/2005/Atom\">\
           <title>ArXiv Query</title>\
           <id>http://arxiv.org/api/test</id>\
           {}\
         </feed>",
        entries.join("")
    )
}

#[tokio::test]
async fn fetch_deduplicates_across_categories_and_batches_metadata() {
    let server = MockServer::start_async().await;

    let quant_ph = server.mock(|when, then| {
        when.method(GET)
            .path("/api/query")
            .query_param(
                "search_query",
                "cat:quant-ph AND submittedDate:[20240101* TO 20240131*]",
            );
        then.status(200).body(feed(&[
            entry("2401.00001v1", "First Paper"),
            entry("2401.00002v1", "Second Paper"),
        ]));
    });
    let optics = server.mock(|when, then| {
        when.method(GET)
            .path("/api/query")
            .query_param(
                "search_query",
                "cat:physics.optics AND submittedDate:[20240101* TO 20240131*]",
            );
        then.status(200).body(feed(&[
            entry("2401.00002v1", "Second Paper"),
            entry("2401.00003v1", "Third Paper"),
        ]));
    });
    let metadata = server.mock(|when, then| {
        when.method(GET)
            .path("/api/query")
            .query_param("id_list", "2401.00001,2401.00002,2401.00003");
        then.status(200).body(feed(&[
            entry("2401.00001v1", "First Paper"),
            entry("2401.00002v1", "Second Paper"),
            entry("2401.00003v1", "Third Paper"),
        ]));
    });

    let config = FetchConfig::new(["quant-ph", "physics.optics"], "20240101", "20240131")
        .with_page_size(10)
        .with_page_delay(Duration::ZERO);
    let fetcher = ArxivFetcher::new(config)
        .with_api_url(format!("{}/api/query", server.base_url()));

    let papers = fetcher.fetch().await.unwrap();
    quant_ph.assert();
    optics.assert();
    metadata.assert();

    let ids: Vec<&str> = papers.iter().map(|p| p.id.as_str()).collect();
    assert_eq!(ids, vec!["2401.00001", "2401.00002", "2401.00003"]);
    assert_eq!(papers[0].title, "First Paper");
    assert_eq!(papers[2].summary, "An abstract for Third Paper.");
}

#[tokio::test]
async fn fetch_paginates_until_short_page() {
    let server = MockServer::start_async().await;

    let first_page = server.mock(|when, then| {
        when.method(GET)
            .path("/api/query")
            .query_param_exists("search_query")
            .query_param("start", "0");
        then.status(200).body(feed(&[
            entry("2401.00001v1", "First Paper"),
            entry("2401.00002v1", "Second Paper"),
        ]));
    });
    let second_page = server.mock(|when, then| {
        when.method(GET)
            .path("/api/query")
            .query_param_exists("search_query")
            .query_param("start", "2");
        then.status(200)
            .body(feed(&[entry("2401.00003v1", "Third Paper")]));
    });
    let metadata = server.mock(|when, then| {
        when.method(GET)
            .path("/api/query")
            .query_param("id_list", "2401.00001,2401.00002,2401.00003");
        then.status(200).body(feed(&[
            entry("2401.00001v1", "First Paper"),
            entry("2401.00002v1", "Second Paper"),
            entry("2401.00003v1", "Third Paper"),
        ]));
    });

    let config = FetchConfig::new(["quant-ph"], "20240101", "20240131")
        .with_page_size(2)
        .with_page_delay(Duration::ZERO);
    let fetcher = ArxivFetcher::new(config)
        .with_api_url(format!("{}/api/query", server.base_url()));

    let papers = fetcher.fetch().await.unwrap();
    first_page.assert();
    second_page.assert();
    metadata.assert();
    assert_eq!(papers.len(), 3);
}

#[tokio::test]
async fn metadata_batch_is_retried_before_giving_up() {
    let server = MockServer::start_async().await;

    server.mock(|when, then| {
        when.method(GET).path("/api/query").query_param(
            "search_query",
            "cat:quant-ph AND submittedDate:[20240101* TO 20240131*]",
        );
        then.status(200)
            .body(feed(&[entry("2401.00001v1", "First Paper")]));
    });
    let metadata = server.mock(|when, then| {
        when.method(GET)
            .path("/api/query")
            .query_param("id_list", "2401.00001");
        then.status(503).body("overloaded");
    });

    let config = FetchConfig::new(["quant-ph"], "20240101", "20240131")
        .with_page_size(10)
        .with_page_delay(Duration::ZERO)
        .with_batch_retries(2)
        .with_batch_retry_delay(Duration::ZERO);
    let fetcher = ArxivFetcher::new(config)
        .with_api_url(format!("{}/api/query", server.base_url()));

    let result = fetcher.fetch().await;
    assert!(matches!(result, Err(FetchError::Api(_))));
    // One initial attempt plus the two configured retries.
    metadata.assert_hits(3);
}

#[tokio::test]
async fn failing_category_is_skipped() {
    let server = MockServer::start_async().await;

    server.mock(|when, then| {
        when.method(GET).path("/api/query").query_param(
            "search_query",
            "cat:bad.category AND submittedDate:[20240101* TO 20240131*]",
        );
        then.status(500).body("server error");
    });
    server.mock(|when, then| {
        when.method(GET).path("/api/query").query_param(
            "search_query",
            "cat:quant-ph AND submittedDate:[20240101* TO 20240131*]",
        );
        then.status(200)
            .body(feed(&[entry("2401.00001v1", "First Paper")]));
    });
    server.mock(|when, then| {
        when.method(GET)
            .path("/api/query")
            .query_param("id_list", "2401.00001");
        then.status(200)
            .body(feed(&[entry("2401.00001v1", "First Paper")]));
    });

    let config = FetchConfig::new(["bad.category", "quant-ph"], "20240101", "20240131")
        .with_page_size(10)
        .with_page_delay(Duration::ZERO);
    let fetcher = ArxivFetcher::new(config)
        .with_api_url(format!("{}/api/query", server.base_url()));

    let papers = fetcher.fetch().await.unwrap();
    assert_eq!(papers.len(), 1);
    assert_eq!(papers[0].id, "2401.00001");
}

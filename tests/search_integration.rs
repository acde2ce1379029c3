//! Keyword-search discovery against a mock repository.

mod support;

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use harvester_core::discovery::{SearchSelectors, SearchSettings};
use harvester_core::{DiscoverySource, HttpPageRenderer, ItemStatus, KeywordSearcher};
use tempfile::TempDir;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn settings(server: &MockServer, keywords: &[&str]) -> SearchSettings {
    SearchSettings {
        name: "keyword_search".to_string(),
        base_url: server.uri(),
        url_template: "{base}/discover?query={keyword}&page={page}&rpp={page_size}".to_string(),
        keywords: keywords.iter().map(ToString::to_string).collect(),
        max_pages: 5,
        max_items_per_keyword: None,
        page_size: 20,
        readiness_timeout: Duration::from_secs(2),
        request_delay: Duration::ZERO,
    }
}

fn searcher(settings: SearchSettings) -> KeywordSearcher {
    let renderer = HttpPageRenderer::new(support::client(), support::no_pacing(), support::fast_policy())
        .with_poll_interval(Duration::from_millis(20));
    KeywordSearcher::new(settings, SearchSelectors::default(), Arc::new(renderer))
}

fn results_page(handles: &[&str], next: Option<&str>) -> String {
    let results: String = handles
        .iter()
        .map(|h| format!(r#"<div class="artifact-title"><a href="/handle/{h}">Item {h}</a></div>"#))
        .collect();
    let next = next
        .map(|href| format!(r#"<a class="next-page-link" href="{href}">Próxima</a>"#))
        .unwrap_or_default();
    format!(
        r#"<html><body><div class="discovery-result-results">Resultados {results}</div>{next}</body></html>"#
    )
}

fn html(body: String) -> ResponseTemplate {
    ResponseTemplate::new(200)
        .insert_header("content-type", "text/html; charset=utf-8")
        .set_body_string(body)
}

async fn mount_page(server: &MockServer, keyword: &str, page: &str, body: String) {
    Mock::given(method("GET"))
        .and(path("/discover"))
        .and(query_param("query", keyword))
        .and(query_param("page", page))
        .respond_with(html(body))
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_walks_pages_and_dedups_across_keywords() {
    let server = MockServer::start().await;
    mount_page(
        &server,
        "soja",
        "1",
        results_page(&["10/1", "10/2"], Some("/discover?query=soja&page=2&rpp=20")),
    )
    .await;
    mount_page(&server, "soja", "2", results_page(&["10/3"], None)).await;
    mount_page(&server, "milho", "1", results_page(&["10/2", "10/4"], None)).await;

    let dir = TempDir::new().expect("failed to create temp dir");
    let registry = support::file_registry(&dir).await;

    let stats = searcher(settings(&server, &["soja", "milho"]))
        .discover(&registry, &AtomicBool::new(false))
        .await
        .expect("search succeeds");

    assert_eq!(stats.pages, 3);
    assert_eq!(stats.seen, 5);
    assert_eq!(stats.registered, 4);
    assert_eq!(stats.skipped, 1);

    let items = registry.all_items().await.expect("items");
    assert_eq!(items.len(), 4);
    assert!(items.iter().all(|i| i.status() == ItemStatus::HtmlPending));
    assert!(items.iter().all(|i| i.source == "keyword_search"));
    assert_eq!(items[0].url, format!("{}/handle/10/1", server.uri()));
}

#[tokio::test]
async fn test_waits_for_results_to_become_ready() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/discover"))
        .respond_with(html(
            r#"<html><body><div class="spinner"></div></body></html>"#.to_string(),
        ))
        .up_to_n_times(2)
        .with_priority(1)
        .mount(&server)
        .await;
    mount_page(&server, "soja", "1", results_page(&["20/1"], None)).await;

    let dir = TempDir::new().expect("failed to create temp dir");
    let registry = support::file_registry(&dir).await;

    let stats = searcher(settings(&server, &["soja"]))
        .discover(&registry, &AtomicBool::new(false))
        .await
        .expect("search succeeds");

    assert_eq!(stats.registered, 1);
    let requests = server.received_requests().await.expect("recording enabled");
    assert_eq!(requests.len(), 3);
}

#[tokio::test]
async fn test_per_keyword_cap_stops_pagination() {
    let server = MockServer::start().await;
    mount_page(
        &server,
        "soja",
        "1",
        results_page(&["30/1", "30/2", "30/3"], Some("/discover?query=soja&page=2&rpp=20")),
    )
    .await;
    Mock::given(method("GET"))
        .and(path("/discover"))
        .and(query_param("page", "2"))
        .respond_with(html(results_page(&["30/4"], None)))
        .expect(0)
        .mount(&server)
        .await;

    let dir = TempDir::new().expect("failed to create temp dir");
    let registry = support::file_registry(&dir).await;
    let mut settings = settings(&server, &["soja"]);
    settings.max_items_per_keyword = Some(2);

    let stats = searcher(settings)
        .discover(&registry, &AtomicBool::new(false))
        .await
        .expect("search succeeds");

    assert_eq!(stats.registered, 2);
    assert_eq!(registry.all_items().await.expect("items").len(), 2);
}

#[tokio::test]
async fn test_script_next_link_ends_paging() {
    let server = MockServer::start().await;
    mount_page(
        &server,
        "soja",
        "1",
        results_page(&["40/1"], Some("javascript:loadPage(2)")),
    )
    .await;

    let dir = TempDir::new().expect("failed to create temp dir");
    let registry = support::file_registry(&dir).await;

    let stats = searcher(settings(&server, &["soja"]))
        .discover(&registry, &AtomicBool::new(false))
        .await
        .expect("search succeeds");

    assert_eq!(stats.pages, 1);
    assert_eq!(stats.registered, 1);
}

#[tokio::test]
async fn test_failed_search_page_moves_to_next_keyword() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/discover"))
        .and(query_param("query", "soja"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;
    mount_page(&server, "milho", "1", results_page(&["50/1"], None)).await;

    let dir = TempDir::new().expect("failed to create temp dir");
    let registry = support::file_registry(&dir).await;

    let stats = searcher(settings(&server, &["soja", "milho"]))
        .discover(&registry, &AtomicBool::new(false))
        .await
        .expect("page failures are not errors");

    assert_eq!(stats.failed_pages, 1);
    assert_eq!(stats.pages, 1);
    assert_eq!(stats.registered, 1);
}

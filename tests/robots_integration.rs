//! Integration tests for robots.txt handling in the fetch pipeline.

use std::sync::Arc;

use crawler_fetch::{
    ContentLengthLimits, CrawlSession, CrawlerClient, FetchConfig, HttpFetcher, PatternUrlFilter,
    RobotsConfig,
};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const ROBOTS: &str = "\
# test robots
User-agent: *
Disallow: /private/
Allow: /private/open
Crawl-delay: 1

User-agent: OtherBot
Disallow: /

Sitemap: http://example.com/sitemap.xml
";

async fn mount_robots(server: &MockServer, body: &str, expected: u64) {
    Mock::given(method("GET"))
        .and(path("/robots.txt"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body.to_string(), "text/plain"))
        .expect(expected)
        .mount(server)
        .await;
}

async fn mount_pages(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/page"))
        .respond_with(ResponseTemplate::new(200).set_body_raw("<p>page</p>", "text/html"))
        .mount(server)
        .await;
}

/// Fetcher sharing a session whose filter the test can inspect.
fn fetcher_with_filter(config: FetchConfig) -> (HttpFetcher, Arc<PatternUrlFilter>) {
    let filter = Arc::new(PatternUrlFilter::new());
    let session = Arc::new(CrawlSession::new(filter.clone()));
    let fetcher = HttpFetcher::builder(config).session(session).build();
    (fetcher, filter)
}

fn config_for(user_agent: &str) -> FetchConfig {
    FetchConfig {
        user_agent: user_agent.to_string(),
        ..FetchConfig::default()
    }
}

#[tokio::test]
async fn test_robots_rules_become_url_filter_patterns() {
    let server = MockServer::start().await;
    mount_robots(&server, ROBOTS, 1).await;
    mount_pages(&server).await;

    let (fetcher, filter) = fetcher_with_filter(config_for("TestBot/1.0"));
    let response = fetcher
        .do_get(&format!("{}/page", server.uri()))
        .await
        .expect("page fetch succeeds");
    assert_eq!(response.status_code(), 200);

    assert_eq!(filter.exclude_count(), 1);
    assert_eq!(filter.include_count(), 1);
    let host = server.uri();
    assert!(!filter.matches(&format!("{host}/private/secret")));
    assert!(!filter.matches(&format!("{host}/private/")));
    assert_eq!(
        fetcher.session().sitemaps(),
        vec!["http://example.com/sitemap.xml".to_string()]
    );
    assert!(fetcher
        .session()
        .is_robots_visited(&format!("{host}/robots.txt")));
}

#[tokio::test]
async fn test_most_specific_user_agent_group_wins() {
    let server = MockServer::start().await;
    mount_robots(&server, ROBOTS, 1).await;
    mount_pages(&server).await;

    let (fetcher, filter) = fetcher_with_filter(config_for("Mozilla/5.0 (compatible; OtherBot/2.1)"));
    fetcher
        .do_get(&format!("{}/page", server.uri()))
        .await
        .unwrap();

    assert_eq!(filter.exclude_count(), 1);
    assert_eq!(filter.include_count(), 0);
    assert!(!filter.matches(&format!("{}/page", server.uri())));
}

#[tokio::test]
async fn test_robots_fetched_once_per_host_sequentially() {
    let server = MockServer::start().await;
    mount_robots(&server, ROBOTS, 1).await;
    mount_pages(&server).await;

    let fetcher = HttpFetcher::new(config_for("TestBot/1.0"));
    for _ in 0..3 {
        fetcher
            .do_get(&format!("{}/page", server.uri()))
            .await
            .unwrap();
    }
    assert_eq!(fetcher.session().robots_visited_count(), 1);
}

#[tokio::test]
async fn test_robots_fetched_once_per_host_concurrently() {
    let server = MockServer::start().await;
    mount_robots(&server, ROBOTS, 1).await;
    mount_pages(&server).await;

    let fetcher = Arc::new(HttpFetcher::new(config_for("TestBot/1.0")));
    let url = format!("{}/page", server.uri());
    let mut handles = Vec::new();
    for _ in 0..8 {
        let fetcher = Arc::clone(&fetcher);
        let url = url.clone();
        handles.push(tokio::spawn(async move { fetcher.do_get(&url).await }));
    }
    for handle in handles {
        let response = handle.await.unwrap().unwrap();
        assert_eq!(response.status_code(), 200);
    }
    assert_eq!(fetcher.session().robots_visited_count(), 1);
}

#[tokio::test]
async fn test_missing_robots_does_not_block_fetch() {
    let server = MockServer::start().await;
    mount_pages(&server).await;

    let (fetcher, filter) = fetcher_with_filter(config_for("TestBot/1.0"));
    let response = fetcher
        .do_get(&format!("{}/page", server.uri()))
        .await
        .unwrap();
    assert_eq!(response.status_code(), 200);
    assert_eq!(filter.exclude_count() + filter.include_count(), 0);
    assert_eq!(fetcher.session().robots_visited_count(), 1);
}

#[tokio::test]
async fn test_oversized_robots_is_ignored() {
    let server = MockServer::start().await;
    mount_robots(&server, ROBOTS, 1).await;
    mount_pages(&server).await;

    let filter = Arc::new(PatternUrlFilter::new());
    let fetcher = HttpFetcher::builder(config_for("TestBot/1.0"))
        .session(Arc::new(CrawlSession::new(filter.clone())))
        .content_length_policy(Arc::new(
            ContentLengthLimits::default().with_limit("text/plain", 16),
        ))
        .build();

    for _ in 0..2 {
        let response = fetcher
            .do_get(&format!("{}/page", server.uri()))
            .await
            .expect("page fetch is unaffected");
        assert_eq!(response.status_code(), 200);
    }
    assert_eq!(filter.exclude_count() + filter.include_count(), 0);
    assert!(fetcher.session().sitemaps().is_empty());
}

#[tokio::test]
async fn test_robots_disabled_skips_request() {
    let server = MockServer::start().await;
    mount_robots(&server, ROBOTS, 0).await;
    mount_pages(&server).await;

    let fetcher = HttpFetcher::new(FetchConfig {
        robots: RobotsConfig {
            enabled: false,
            ..RobotsConfig::default()
        },
        ..config_for("TestBot/1.0")
    });
    fetcher
        .do_get(&format!("{}/page", server.uri()))
        .await
        .unwrap();
    assert_eq!(fetcher.session().robots_visited_count(), 0);
}

#[tokio::test]
async fn test_allow_rules_can_be_switched_off() {
    let server = MockServer::start().await;
    mount_robots(&server, ROBOTS, 1).await;
    mount_pages(&server).await;

    let (fetcher, filter) = fetcher_with_filter(FetchConfig {
        robots: RobotsConfig {
            use_allows: false,
            ..RobotsConfig::default()
        },
        ..config_for("TestBot/1.0")
    });
    fetcher
        .do_get(&format!("{}/page", server.uri()))
        .await
        .unwrap();

    assert_eq!(filter.include_count(), 0);
    assert_eq!(filter.exclude_count(), 1);
    assert!(filter.matches(&format!("{}/page", server.uri())));
}

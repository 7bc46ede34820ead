//! Per-host robots.txt compliance.
//!
//! The first fetch to a host triggers one robots.txt request through the same
//! executor as regular fetches. Rules for the configured user agent are turned
//! into URL filter patterns and sitemaps are handed to the crawl session.
//! Nothing that goes wrong here reaches the caller; failures are logged and
//! the fetch proceeds as if the host had no robots.txt.

use std::sync::Arc;

use futures_util::StreamExt;
use reqwest::header::CONTENT_LENGTH;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::constants::{ROBOTS_TXT_MIME_TYPE, ROBOTS_TXT_PATH};
use super::error::FetchError;
use super::executor::{Dispatched, Executor};
use super::request::FetchRequest;
use super::robots_txt::{RobotsTxt, convert_pattern_to_regex};
use crate::config::RobotsConfig;
use crate::context::{ContentLengthPolicy, CrawlSession};
use crate::transport::BodyStream;

/// Fetches robots.txt once per host and registers its rules.
#[derive(Debug)]
pub struct RobotsEngine {
    config: RobotsConfig,
    user_agent: String,
    session: Arc<CrawlSession>,
    length_policy: Arc<dyn ContentLengthPolicy>,
}

impl RobotsEngine {
    #[must_use]
    pub fn new(
        config: RobotsConfig,
        user_agent: impl Into<String>,
        session: Arc<CrawlSession>,
        length_policy: Arc<dyn ContentLengthPolicy>,
    ) -> Self {
        Self {
            config,
            user_agent: user_agent.into(),
            session,
            length_policy,
        }
    }

    /// Makes sure robots.txt of `url`'s host was processed in this session.
    ///
    /// The host's robots.txt URL is recorded before it is fetched, so
    /// concurrent callers for the same host trigger a single fetch; callers
    /// that lose the race return at once without waiting for the rules.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::System`] for a blank URL. Every other failure is
    /// logged and swallowed.
    #[instrument(skip(self, executor, cancel), fields(url = %url))]
    pub async fn ensure_compliance(
        &self,
        url: &str,
        executor: &Executor,
        cancel: &CancellationToken,
    ) -> Result<(), FetchError> {
        if url.trim().is_empty() {
            return Err(FetchError::system("URL is null or empty"));
        }
        if !self.config.enabled {
            return Ok(());
        }
        let Some(host_url) = host_url(url) else {
            debug!("no host in URL, skipping robots.txt");
            return Ok(());
        };
        let robots_url = format!("{host_url}{ROBOTS_TXT_PATH}");
        if !self.session.mark_robots_visited(&robots_url) {
            return Ok(());
        }

        match self.process(host_url, &robots_url, executor, cancel).await {
            Ok(()) => {}
            Err(e) if e.is_length_exceeded() => {
                info!(robots_url = %robots_url, error = %e, "robots.txt too large, ignored");
            }
            Err(e) => {
                warn!(robots_url = %robots_url, error = %e, "failed to process robots.txt");
            }
        }
        Ok(())
    }

    async fn process(
        &self,
        host_url: &str,
        robots_url: &str,
        executor: &Executor,
        cancel: &CancellationToken,
    ) -> Result<(), FetchError> {
        let request = executor.prepare(FetchRequest::get(robots_url)?);
        let Dispatched { mut response, lease } = executor.dispatch(&request, cancel).await?;

        if response.status() != 200 {
            debug!(robots_url = %robots_url, status = response.status(), "no robots.txt");
            lease.discard();
            return Ok(());
        }

        let limit = self.length_policy.max_length(ROBOTS_TXT_MIME_TYPE);
        let declared = response
            .header_str(CONTENT_LENGTH.as_str())
            .and_then(|v| v.trim().parse::<u64>().ok());
        if let Some(length) = declared
            && length > limit
        {
            lease.discard();
            return Err(FetchError::length_exceeded(robots_url, length, limit));
        }

        let body = match response.take_body() {
            Some(stream) => read_capped(stream, limit, robots_url, cancel).await,
            None => Ok(Vec::new()),
        };
        let body = match body {
            Ok(body) => {
                lease.release();
                body
            }
            Err(e) => {
                lease.discard();
                return Err(e);
            }
        };

        let robots = RobotsTxt::parse(&String::from_utf8_lossy(&body));
        self.register(host_url, &robots);
        Ok(())
    }

    fn register(&self, host_url: &str, robots: &RobotsTxt) {
        if !robots.sitemaps().is_empty() {
            self.session.add_sitemaps(robots.sitemaps());
        }
        let Some(directive) = robots.matched_directive(&self.user_agent) else {
            debug!(host = %host_url, "no robots.txt group applies");
            return;
        };

        let filter = self.session.url_filter();
        let mut excludes = 0;
        let mut includes = 0;
        if self.config.use_disallows {
            for path in directive.disallows().iter().filter(|p| !p.trim().is_empty()) {
                filter.add_exclude(&format!("{host_url}{}", convert_pattern_to_regex(path)));
                excludes += 1;
            }
        }
        if self.config.use_allows {
            for path in directive.allows().iter().filter(|p| !p.trim().is_empty()) {
                filter.add_include(&format!("{host_url}{}", convert_pattern_to_regex(path)));
                includes += 1;
            }
        }
        debug!(
            host = %host_url,
            user_agent = %directive.user_agent(),
            excludes,
            includes,
            sitemaps = robots.sitemaps().len(),
            "registered robots.txt rules"
        );
    }
}

/// `scheme://authority` of `url`: everything before the first `/`, `?` or `#`
/// after `://`.
#[must_use]
pub fn host_url(url: &str) -> Option<&str> {
    let start = url.find("://")? + 3;
    let end = url[start..]
        .find(['/', '?', '#'])
        .map_or(url.len(), |i| start + i);
    (end > start).then(|| &url[..end])
}

async fn read_capped(
    mut stream: BodyStream,
    limit: u64,
    url: &str,
    cancel: &CancellationToken,
) -> Result<Vec<u8>, FetchError> {
    let mut body = Vec::new();
    loop {
        let next = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(FetchError::access_timeout(url)),
            next = stream.next() => next,
        };
        match next {
            Some(Ok(chunk)) => {
                body.extend_from_slice(&chunk);
                if body.len() as u64 > limit {
                    return Err(FetchError::length_exceeded(url, body.len() as u64, limit));
                }
            }
            Some(Err(e)) => return Err(e.into_fetch_error(url)),
            None => return Ok(body),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::FetchConfig;
    use crate::context::{ContentLengthLimits, PatternUrlFilter, UrlFilter};
    use crate::pool::{ConnectionManager, Route};
    use crate::transport::{Connection, RawResponse, Transport, TransportError};
    use async_trait::async_trait;
    use bytes::Bytes;
    use reqwest::header::HeaderMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug)]
    struct CannedTransport {
        body: &'static str,
        status: u16,
        calls: Arc<AtomicUsize>,
    }

    #[derive(Debug)]
    struct CannedConnection {
        body: &'static str,
        status: u16,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Transport for CannedTransport {
        async fn open(&self, _route: &Route) -> Result<Box<dyn Connection>, TransportError> {
            Ok(Box::new(CannedConnection {
                body: self.body,
                status: self.status,
                calls: Arc::clone(&self.calls),
            }))
        }
    }

    #[async_trait]
    impl Connection for CannedConnection {
        async fn send(&mut self, request: &FetchRequest) -> Result<RawResponse, TransportError> {
            assert_eq!(request.url().path(), "/robots.txt");
            self.calls.fetch_add(1, Ordering::SeqCst);
            let stream = futures_util::stream::iter(vec![Ok(Bytes::from_static(self.body.as_bytes()))]);
            Ok(RawResponse::new(self.status, HeaderMap::new(), Box::pin(stream)))
        }

        fn is_open(&self) -> bool {
            true
        }

        fn close(&mut self) -> Result<(), TransportError> {
            Ok(())
        }
    }

    struct Fixture {
        engine: RobotsEngine,
        executor: Executor,
        session: Arc<CrawlSession>,
        filter: Arc<PatternUrlFilter>,
        calls: Arc<AtomicUsize>,
    }

    fn fixture(status: u16, body: &'static str, robots: RobotsConfig, limit: u64) -> Fixture {
        let calls = Arc::new(AtomicUsize::new(0));
        let transport = CannedTransport {
            body,
            status,
            calls: Arc::clone(&calls),
        };
        let config = FetchConfig::default();
        let executor = Executor::new(
            ConnectionManager::new(Arc::new(transport), config.pool.clone()),
            &config,
        );
        let filter = Arc::new(PatternUrlFilter::new());
        let session = Arc::new(CrawlSession::new(Arc::clone(&filter) as Arc<dyn UrlFilter>));
        let engine = RobotsEngine::new(
            robots,
            "crawler-fetch/1.0",
            Arc::clone(&session),
            Arc::new(ContentLengthLimits::new(limit)),
        );
        Fixture {
            engine,
            executor,
            session,
            filter,
            calls,
        }
    }

    const ROBOTS: &str = "\
User-agent: *
Disallow: /private/
Allow: /private/open.html$
Sitemap: http://example.com/sitemap.xml
";

    #[test]
    fn test_host_url() {
        assert_eq!(host_url("http://example.com/a/b"), Some("http://example.com"));
        assert_eq!(host_url("https://example.com:8443?q=1"), Some("https://example.com:8443"));
        assert_eq!(host_url("http://example.com"), Some("http://example.com"));
        assert_eq!(host_url("http:///path"), None);
        assert_eq!(host_url("example.com/path"), None);
    }

    #[tokio::test]
    async fn test_rules_registered_once_per_host() {
        let f = fixture(200, ROBOTS, RobotsConfig::default(), 1024);
        let cancel = CancellationToken::new();
        f.engine
            .ensure_compliance("http://example.com/a", &f.executor, &cancel)
            .await
            .unwrap();
        f.engine
            .ensure_compliance("http://example.com/b", &f.executor, &cancel)
            .await
            .unwrap();

        assert_eq!(f.calls.load(Ordering::SeqCst), 1);
        assert!(f.session.is_robots_visited("http://example.com/robots.txt"));
        assert_eq!(f.filter.exclude_count(), 1);
        assert_eq!(f.filter.include_count(), 1);
        assert!(!f.filter.matches("http://example.com/private/x.html"));
        assert_eq!(f.session.sitemaps(), ["http://example.com/sitemap.xml"]);
    }

    #[tokio::test]
    async fn test_disabled_robots_makes_no_request() {
        let robots = RobotsConfig {
            enabled: false,
            ..RobotsConfig::default()
        };
        let f = fixture(200, ROBOTS, robots, 1024);
        f.engine
            .ensure_compliance("http://example.com/", &f.executor, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(f.calls.load(Ordering::SeqCst), 0);
        assert_eq!(f.session.robots_visited_count(), 0);
    }

    #[tokio::test]
    async fn test_disallows_can_be_ignored() {
        let robots = RobotsConfig {
            use_disallows: false,
            ..RobotsConfig::default()
        };
        let f = fixture(200, ROBOTS, robots, 1024);
        f.engine
            .ensure_compliance("http://example.com/", &f.executor, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(f.filter.exclude_count(), 0);
        assert_eq!(f.filter.include_count(), 1);
    }

    #[tokio::test]
    async fn test_oversized_robots_is_swallowed() {
        let f = fixture(200, ROBOTS, RobotsConfig::default(), 10);
        f.engine
            .ensure_compliance("http://example.com/", &f.executor, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(f.filter.exclude_count(), 0);
        assert!(f.session.sitemaps().is_empty());
        assert_eq!(f.executor.manager().stats().open, 0, "connection discarded");
    }

    #[tokio::test]
    async fn test_missing_robots_registers_nothing() {
        let f = fixture(404, "not found", RobotsConfig::default(), 1024);
        f.engine
            .ensure_compliance("http://example.com/", &f.executor, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(f.calls.load(Ordering::SeqCst), 1);
        assert_eq!(f.filter.exclude_count() + f.filter.include_count(), 0);
    }

    #[tokio::test]
    async fn test_blank_url_is_system_error() {
        let f = fixture(200, ROBOTS, RobotsConfig::default(), 1024);
        let err = f
            .engine
            .ensure_compliance(" ", &f.executor, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_system());
        assert_eq!(f.calls.load(Ordering::SeqCst), 0);
    }
}

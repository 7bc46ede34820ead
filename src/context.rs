//! Crawl session state and the collaborators the pipeline consults.
//!
//! The pipeline never owns crawl-wide state implicitly. A [`CrawlSession`] is
//! created by the caller, shared via `Arc`, and injected into the fetcher; it
//! holds the robots.txt visited set, discovered sitemaps, and the URL filter
//! robots rules are registered into.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use dashmap::DashSet;
use regex::Regex;
use tracing::{debug, warn};

/// Default maximum content length for any MIME type (10 MiB).
pub const DEFAULT_MAX_CONTENT_LENGTH: u64 = 10 * 1024 * 1024;

/// Receives include/exclude URL patterns (regular expressions).
pub trait UrlFilter: Send + Sync + fmt::Debug {
    /// Adds a pattern URLs must match to be crawled.
    fn add_include(&self, pattern: &str);
    /// Adds a pattern that excludes matching URLs.
    fn add_exclude(&self, pattern: &str);
}

/// Maximum body length allowed per MIME type.
pub trait ContentLengthPolicy: Send + Sync + fmt::Debug {
    /// Returns the maximum length in bytes for `mime_type`.
    fn max_length(&self, mime_type: &str) -> u64;
}

/// Regex based [`UrlFilter`].
///
/// Patterns must match the whole URL. Any matching exclude rejects a URL; when
/// includes exist, a URL must also match one of them.
#[derive(Debug, Default)]
pub struct PatternUrlFilter {
    includes: RwLock<Vec<Regex>>,
    excludes: RwLock<Vec<Regex>>,
}

impl PatternUrlFilter {
    /// Creates an empty filter that accepts every URL.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if `url` passes the filter.
    #[must_use]
    pub fn matches(&self, url: &str) -> bool {
        let excludes = self.excludes.read().unwrap_or_else(PoisonError::into_inner);
        if excludes.iter().any(|re| re.is_match(url)) {
            return false;
        }
        let includes = self.includes.read().unwrap_or_else(PoisonError::into_inner);
        includes.is_empty() || includes.iter().any(|re| re.is_match(url))
    }

    /// Number of registered include patterns.
    #[must_use]
    pub fn include_count(&self) -> usize {
        self.includes.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Number of registered exclude patterns.
    #[must_use]
    pub fn exclude_count(&self) -> usize {
        self.excludes.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn push(list: &RwLock<Vec<Regex>>, pattern: &str) {
        match Regex::new(&format!("^(?:{pattern})$")) {
            Ok(re) => list.write().unwrap_or_else(PoisonError::into_inner).push(re),
            Err(e) => warn!(pattern = %pattern, error = %e, "ignoring invalid URL filter pattern"),
        }
    }
}

impl UrlFilter for PatternUrlFilter {
    fn add_include(&self, pattern: &str) {
        Self::push(&self.includes, pattern);
    }

    fn add_exclude(&self, pattern: &str) {
        Self::push(&self.excludes, pattern);
    }
}

/// [`ContentLengthPolicy`] with a default limit and per-MIME overrides.
#[derive(Debug, Clone)]
pub struct ContentLengthLimits {
    default_max: u64,
    per_mime: HashMap<String, u64>,
}

impl Default for ContentLengthLimits {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CONTENT_LENGTH)
    }
}

impl ContentLengthLimits {
    /// Creates limits where every MIME type gets `default_max`.
    #[must_use]
    pub fn new(default_max: u64) -> Self {
        Self {
            default_max,
            per_mime: HashMap::new(),
        }
    }

    /// Overrides the limit for one MIME type.
    #[must_use]
    pub fn with_limit(mut self, mime_type: impl Into<String>, max: u64) -> Self {
        self.per_mime.insert(mime_type.into().to_ascii_lowercase(), max);
        self
    }
}

impl ContentLengthPolicy for ContentLengthLimits {
    fn max_length(&self, mime_type: &str) -> u64 {
        self.per_mime
            .get(&mime_type.to_ascii_lowercase())
            .copied()
            .unwrap_or(self.default_max)
    }
}

/// Crawl-wide state shared by every fetch in one session.
#[derive(Debug)]
pub struct CrawlSession {
    robots_visited: DashSet<String>,
    sitemaps: Mutex<Vec<String>>,
    url_filter: Arc<dyn UrlFilter>,
}

impl Default for CrawlSession {
    fn default() -> Self {
        Self::new(Arc::new(PatternUrlFilter::new()))
    }
}

impl CrawlSession {
    /// Creates a session that registers robots rules into `url_filter`.
    #[must_use]
    pub fn new(url_filter: Arc<dyn UrlFilter>) -> Self {
        Self {
            robots_visited: DashSet::new(),
            sitemaps: Mutex::new(Vec::new()),
            url_filter,
        }
    }

    /// Records `robots_url` as visited.
    ///
    /// Returns true only for the first caller; concurrent callers racing on the
    /// same URL see exactly one `true`.
    pub fn mark_robots_visited(&self, robots_url: &str) -> bool {
        self.robots_visited.insert(robots_url.to_string())
    }

    /// Returns true if `robots_url` was already recorded.
    #[must_use]
    pub fn is_robots_visited(&self, robots_url: &str) -> bool {
        self.robots_visited.contains(robots_url)
    }

    /// Number of robots.txt URLs recorded so far.
    #[must_use]
    pub fn robots_visited_count(&self) -> usize {
        self.robots_visited.len()
    }

    /// Adds sitemap URLs for later scheduling, skipping duplicates.
    pub fn add_sitemaps<S: AsRef<str>>(&self, urls: &[S]) {
        let mut sitemaps = self.sitemaps.lock().unwrap_or_else(PoisonError::into_inner);
        for url in urls {
            let url = url.as_ref();
            if !sitemaps.iter().any(|s| s == url) {
                debug!(sitemap = %url, "sitemap discovered");
                sitemaps.push(url.to_string());
            }
        }
    }

    /// Sitemap URLs discovered so far, in discovery order.
    #[must_use]
    pub fn sitemaps(&self) -> Vec<String> {
        self.sitemaps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The URL filter robots rules are registered into.
    #[must_use]
    pub fn url_filter(&self) -> &Arc<dyn UrlFilter> {
        &self.url_filter
    }
}

//! Crawler Fetch Library
//!
//! A polite, bounded HTTP fetch pipeline for web crawlers: it honours
//! robots.txt, pools connections per route, reports redirects instead of
//! following them, and materializes bodies in memory or on disk.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`fetch`] - The crawler client, robots.txt engine and response materializer
//! - [`pool`] - Per-route connection pool and the shared connection reaper
//! - [`transport`] - The HTTP wire seam and its `reqwest` implementation
//! - [`context`] - Crawl session state: URL filter, robots visited set, sitemaps
//! - [`sink`] - Memory-or-file body buffering
//! - [`config`] - JSON-loadable pipeline configuration

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod context;
pub mod fetch;
pub mod mime;
pub mod pool;
pub mod sink;
pub mod transport;
pub mod user_agent;

// Re-export commonly used types
pub use config::{ConfigError, FetchConfig, PoolConfig, RobotsConfig};
pub use context::{
    ContentLengthLimits, ContentLengthPolicy, CrawlSession, PatternUrlFilter, UrlFilter,
};
pub use fetch::{
    AccessKind, CrawlerClient, FetchError, FetchResponse, HttpFetcher, HttpFetcherBuilder, Method,
};
pub use mime::{BasicMimeSniffer, MimeSniffer};
pub use pool::{ConnectionManager, PoolStats};
pub use sink::ResponseBody;

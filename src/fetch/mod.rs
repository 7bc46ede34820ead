//! The fetch pipeline: robots.txt compliance, pooled dispatch, response
//! materialization and the per-call deadline.
//!
//! # Features
//!
//! - `GET`/`HEAD` through a bounded per-route connection pool
//! - robots.txt fetched once per host and turned into URL filter rules
//! - Redirects reported, never followed
//! - Bodies above the cache threshold spooled to a temp file
//! - Content-length limits per MIME type
//! - Optional whole-call deadline that aborts the in-flight request
//!
//! # Example
//!
//! ```no_run
//! use crawler_fetch::{CrawlerClient, FetchConfig, HttpFetcher};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let fetcher = HttpFetcher::new(FetchConfig::default());
//! let response = fetcher.do_get("https://example.com/").await?;
//! println!("{} {:?}", response.status_code(), response.mime_type());
//! fetcher.close();
//! # Ok(())
//! # }
//! ```

mod client;
pub mod constants;
mod deadline;
mod error;
mod executor;
mod materializer;
mod request;
mod response;
mod robots;
pub mod robots_txt;

pub use client::{CrawlerClient, HttpFetcher, HttpFetcherBuilder};
pub use deadline::{DeadlineGuard, GuardState};
pub use error::{AccessKind, BoxError, FetchError};
pub use executor::{Dispatched, Executor};
pub use materializer::{Materializer, is_redirect, parse_last_modified, resolve_redirect};
pub use request::{FetchRequest, Method};
pub use response::FetchResponse;
pub use robots::{RobotsEngine, host_url};
pub use robots_txt::{Directive, RobotsTxt, convert_pattern_to_regex};

// Note: we do NOT define module-local Result aliases.
// Use `Result<T, FetchError>` explicitly in function signatures.

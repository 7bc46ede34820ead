//! Turns a raw transport response into a [`FetchResponse`].
//!
//! Redirects are reported without reading the body. Everything else is
//! streamed into a [`GrowableSink`], typed (header, then sniffing, then the
//! configured default), length-checked against the content length policy and
//! decorated with charset and `Last-Modified`.
//!
//! Length policy:
//! - declared `Content-Type` and `Content-Length` over the limit fail before
//!   any body byte is read
//! - the observed buffered length is checked once the body is complete
//! - the reported content length (declared, else observed) is checked last

use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use futures_util::StreamExt;
use reqwest::header::{CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, LAST_MODIFIED, LOCATION};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use super::constants::{DEFAULT_CHARSET, OCTET_STREAM};
use super::error::{AccessKind, FetchError};
use super::request::FetchRequest;
use super::response::{FetchResponse, Materialized};
use crate::config::FetchConfig;
use crate::context::ContentLengthPolicy;
use crate::mime::{MimeSniffer, SNIFF_LENGTH};
use crate::sink::{GrowableSink, ResponseBody};
use crate::transport::{BodyStream, RawResponse};

/// Builds normalized responses.
#[derive(Debug, Clone)]
pub struct Materializer {
    default_mime_type: String,
    threshold: usize,
    spool_dir: PathBuf,
    length_policy: Arc<dyn ContentLengthPolicy>,
    sniffer: Arc<dyn MimeSniffer>,
}

impl Materializer {
    /// Creates a materializer from `config` and its collaborators.
    #[must_use]
    pub fn new(
        config: &FetchConfig,
        length_policy: Arc<dyn ContentLengthPolicy>,
        sniffer: Arc<dyn MimeSniffer>,
    ) -> Self {
        Self {
            default_mime_type: config.default_mime_type.clone(),
            threshold: config.max_cached_content_size,
            spool_dir: config.spool_dir(),
            length_policy,
            sniffer,
        }
    }

    /// Materializes `raw`, the response to `request`.
    ///
    /// Body reads stop with [`AccessKind::AccessTimeout`] once `cancel` fires.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::Access`] for redirects without `Location` and body
    /// read or spool failures, [`FetchError::LengthExceeded`] when the body is
    /// over the limit for its MIME type. Partially buffered bodies are deleted.
    pub async fn materialize(
        &self,
        mut raw: RawResponse,
        request: &FetchRequest,
        cancel: &CancellationToken,
    ) -> Result<FetchResponse, FetchError> {
        let url = request.url_str();
        let status = raw.status();

        if is_redirect(status) {
            let Some(location) = raw.header_str(LOCATION.as_str()) else {
                return Err(FetchError::access_without_cause(url, AccessKind::InvalidRedirect));
            };
            let location = resolve_redirect(request.url(), location)
                .map_err(|e| FetchError::access(url, AccessKind::InvalidRedirect, e))?;
            debug!(url = %url, status, location = %location, "redirect response");
            return Ok(FetchResponse::redirect(
                url,
                status,
                request.method(),
                raw.headers(),
                location,
            ));
        }

        let declared_type = raw
            .header_str(CONTENT_TYPE.as_str())
            .and_then(strip_parameters)
            .filter(|t| !t.eq_ignore_ascii_case(OCTET_STREAM));
        let declared_length = raw
            .header_str(CONTENT_LENGTH.as_str())
            .and_then(|v| v.trim().parse::<u64>().ok());

        if let (Some(mime), Some(length)) = (&declared_type, declared_length) {
            self.check_length(url, mime, length)?;
        }

        let body = match raw.take_body() {
            Some(stream) => Some(self.buffer(stream, url, cancel).await?),
            None => None,
        };

        let mime_type = match (declared_type, &body) {
            (Some(mime), _) => mime,
            (None, Some(body)) => self.sniff(body, url).await,
            (None, None) => self.default_mime_type.clone(),
        };
        let body = body.unwrap_or_else(ResponseBody::empty);

        let observed = body.len();
        self.check_length(url, &mime_type, observed)?;
        let content_length = declared_length.unwrap_or(observed);
        self.check_length(url, &mime_type, content_length)?;

        let charset = raw
            .header_str(CONTENT_ENCODING.as_str())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .unwrap_or(DEFAULT_CHARSET)
            .to_string();
        let last_modified = raw
            .header_str(LAST_MODIFIED.as_str())
            .and_then(parse_last_modified);

        debug!(
            url = %url,
            status,
            mime_type = %mime_type,
            content_length,
            in_memory = body.is_in_memory(),
            "materialized response"
        );
        Ok(FetchResponse::materialized(
            url,
            status,
            request.method(),
            raw.headers(),
            Materialized {
                mime_type,
                charset,
                content_length,
                body,
                last_modified,
            },
        ))
    }

    fn check_length(&self, url: &str, mime_type: &str, length: u64) -> Result<(), FetchError> {
        let limit = self.length_policy.max_length(mime_type);
        if length > limit {
            debug!(url = %url, mime_type, length, limit, "content length over limit");
            return Err(FetchError::length_exceeded(url, length, limit));
        }
        Ok(())
    }

    async fn buffer(
        &self,
        mut stream: BodyStream,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<ResponseBody, FetchError> {
        let mut sink = GrowableSink::new(self.threshold, &self.spool_dir);
        loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(FetchError::access_timeout(url)),
                next = stream.next() => next,
            };
            match next {
                Some(Ok(chunk)) => sink
                    .write(&chunk)
                    .await
                    .map_err(|e| FetchError::access(url, AccessKind::Io, e))?,
                Some(Err(e)) => return Err(e.into_fetch_error(url)),
                None => break,
            }
        }
        sink.finish()
            .await
            .map_err(|e| FetchError::access(url, AccessKind::Io, e))
    }

    async fn sniff(&self, body: &ResponseBody, url: &str) -> String {
        let head = match body.head(SNIFF_LENGTH).await {
            Ok(head) => head,
            Err(e) => {
                warn!(url = %url, error = %e, "could not read body for content type detection");
                return self.default_mime_type.clone();
            }
        };
        match self.sniffer.content_type(&head, url) {
            Ok(mime) => mime,
            Err(e) => {
                debug!(url = %url, error = %e, default = %self.default_mime_type, "using default content type");
                self.default_mime_type.clone()
            }
        }
    }
}

/// Returns true for `3xx` status codes.
#[must_use]
pub fn is_redirect(status: u16) -> bool {
    (300..=399).contains(&status)
}

/// Resolves a `Location` header value.
///
/// Values starting with `/` are resolved against `base` after encoding spaces,
/// which also normalizes dot segments. Anything else is used verbatim.
///
/// # Errors
///
/// Returns the parse error when a `/`-relative location cannot be joined.
pub fn resolve_redirect(base: &Url, location: &str) -> Result<String, url::ParseError> {
    if location.starts_with('/') {
        Ok(base.join(&location.replace(' ', "%20"))?.to_string())
    } else {
        Ok(location.to_string())
    }
}

/// `text/html; charset=utf-8` to `text/html`. Blank values yield `None`.
fn strip_parameters(value: &str) -> Option<String> {
    let mime = value.split(';').next().unwrap_or("").trim();
    (!mime.is_empty()).then(|| mime.to_string())
}

/// Parses a `Last-Modified` value.
///
/// Tries the HTTP-date formats (IMF-fixdate, RFC 850, asctime) first, then
/// `Thu, 1 Oct 2015 07:28:00 +0000` style values. Unparseable input yields
/// `None`.
#[must_use]
pub fn parse_last_modified(value: &str) -> Option<SystemTime> {
    let value = value.trim();
    if let Ok(time) = httpdate::parse_http_date(value) {
        return Some(time);
    }
    let normalized = match value
        .strip_suffix(" GMT")
        .or_else(|| value.strip_suffix(" UTC"))
    {
        Some(stripped) => format!("{stripped} +0000"),
        None => value.to_string(),
    };
    chrono::DateTime::parse_from_str(&normalized, "%a, %d %b %Y %H:%M:%S %z")
        .ok()
        .map(SystemTime::from)
}

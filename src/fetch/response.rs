//! The normalized response handed to callers.

use std::io;
use std::time::SystemTime;

use reqwest::header::HeaderMap;

use super::request::Method;
use crate::sink::ResponseBody;

/// Result of one fetch.
///
/// A redirect response carries `redirect_location` and no body, MIME type or
/// content length. Otherwise the body is always present (possibly empty).
/// Call [`dispose`](Self::dispose) when done so a spooled body is deleted
/// promptly; dropping has the same effect but cannot report errors.
#[derive(Debug)]
pub struct FetchResponse {
    url: String,
    status: u16,
    method: Method,
    headers: Vec<(String, Vec<String>)>,
    mime_type: Option<String>,
    charset: Option<String>,
    content_length: Option<u64>,
    body: Option<ResponseBody>,
    last_modified: Option<SystemTime>,
    redirect_location: Option<String>,
}

/// Fields of a materialized (non-redirect) response.
#[derive(Debug)]
pub(crate) struct Materialized {
    pub mime_type: String,
    pub charset: String,
    pub content_length: u64,
    pub body: ResponseBody,
    pub last_modified: Option<SystemTime>,
}

impl FetchResponse {
    pub(crate) fn redirect(
        url: &str,
        status: u16,
        method: Method,
        headers: &HeaderMap,
        location: String,
    ) -> Self {
        Self {
            url: url.to_string(),
            status,
            method,
            headers: collect_headers(headers),
            mime_type: None,
            charset: None,
            content_length: None,
            body: None,
            last_modified: None,
            redirect_location: Some(location),
        }
    }

    pub(crate) fn materialized(
        url: &str,
        status: u16,
        method: Method,
        headers: &HeaderMap,
        parts: Materialized,
    ) -> Self {
        Self {
            url: url.to_string(),
            status,
            method,
            headers: collect_headers(headers),
            mime_type: Some(parts.mime_type),
            charset: Some(parts.charset),
            content_length: Some(parts.content_length),
            body: Some(parts.body),
            last_modified: parts.last_modified,
            redirect_location: None,
        }
    }

    /// The requested URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// HTTP status code.
    #[must_use]
    pub fn status_code(&self) -> u16 {
        self.status
    }

    /// Method the response was fetched with.
    #[must_use]
    pub fn method(&self) -> Method {
        self.method
    }

    /// Every response header, names lower-cased, values in received order.
    #[must_use]
    pub fn headers(&self) -> &[(String, Vec<String>)] {
        &self.headers
    }

    /// First value of header `name` (case-insensitive).
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.header_values(name).first().map(String::as_str)
    }

    /// All values of header `name` (case-insensitive).
    #[must_use]
    pub fn header_values(&self, name: &str) -> &[String] {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, values)| values.as_slice())
            .unwrap_or(&[])
    }

    #[must_use]
    pub fn mime_type(&self) -> Option<&str> {
        self.mime_type.as_deref()
    }

    #[must_use]
    pub fn charset(&self) -> Option<&str> {
        self.charset.as_deref()
    }

    /// Declared `Content-Length` when parseable, otherwise the observed length.
    #[must_use]
    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    #[must_use]
    pub fn body(&self) -> Option<&ResponseBody> {
        self.body.as_ref()
    }

    /// Takes the body out, leaving `None`. The caller becomes responsible for
    /// disposing it.
    pub fn take_body(&mut self) -> Option<ResponseBody> {
        self.body.take()
    }

    #[must_use]
    pub fn last_modified(&self) -> Option<SystemTime> {
        self.last_modified
    }

    /// Absolute redirect target for 3xx responses.
    #[must_use]
    pub fn redirect_location(&self) -> Option<&str> {
        self.redirect_location.as_deref()
    }

    #[must_use]
    pub fn is_redirect(&self) -> bool {
        self.redirect_location.is_some()
    }

    /// Releases the body, deleting a spooled file.
    ///
    /// # Errors
    ///
    /// Returns the IO error from deleting the spool file.
    pub fn dispose(mut self) -> io::Result<()> {
        match self.body.take() {
            Some(body) => body.dispose(),
            None => Ok(()),
        }
    }
}

/// Header map to `(name, values)` pairs, grouping repeated headers.
fn collect_headers(headers: &HeaderMap) -> Vec<(String, Vec<String>)> {
    headers
        .keys()
        .map(|name| {
            let values = headers
                .get_all(name)
                .iter()
                .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
                .collect();
            (name.as_str().to_string(), values)
        })
        .collect()
}

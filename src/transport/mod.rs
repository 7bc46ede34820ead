//! Transport seam between the pipeline and the network.
//!
//! A [`Transport`] opens [`Connection`]s for a [`Route`]; the connection pool owns
//! them and hands them out one request at a time. The default implementation,
//! [`HttpTransport`], is backed by `reqwest`. Tests plug in stub transports.

mod http;

use std::fmt;
use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::Stream;
use reqwest::header::HeaderMap;
use thiserror::Error;

use crate::fetch::{AccessKind, BoxError, FetchError, FetchRequest};
use crate::pool::Route;

pub use http::{HttpSettings, HttpTransport};

/// Stream of body chunks produced by a connection.
pub type BodyStream = Pin<Box<dyn Stream<Item = Result<Bytes, TransportError>> + Send>>;

/// Opens connections for routes.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// Opens a new connection to `route`.
    ///
    /// # Errors
    ///
    /// Returns a [`TransportError`] if the connection cannot be set up.
    async fn open(&self, route: &Route) -> Result<Box<dyn Connection>, TransportError>;
}

/// A single pooled connection, used by one request at a time.
#[async_trait]
pub trait Connection: Send + fmt::Debug {
    /// Sends `request` and resolves once response headers are available.
    ///
    /// Dropping the returned future aborts the request.
    ///
    /// # Errors
    ///
    /// Returns a [`TransportError`] classified by failure kind.
    async fn send(&mut self, request: &FetchRequest) -> Result<RawResponse, TransportError>;

    /// Returns false once the connection can no longer carry requests.
    fn is_open(&self) -> bool;

    /// Closes the connection. Closing twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns a [`TransportError`] if the underlying resource fails to close.
    fn close(&mut self) -> Result<(), TransportError>;
}

/// Response as received from the transport, before materialization.
pub struct RawResponse {
    status: u16,
    headers: HeaderMap,
    body: Option<BodyStream>,
}

impl RawResponse {
    /// Creates a response with a streamed body.
    #[must_use]
    pub fn new(status: u16, headers: HeaderMap, body: BodyStream) -> Self {
        Self {
            status,
            headers,
            body: Some(body),
        }
    }

    /// Creates a response that carries no body at all (e.g. HEAD).
    #[must_use]
    pub fn without_body(status: u16, headers: HeaderMap) -> Self {
        Self {
            status,
            headers,
            body: None,
        }
    }

    /// HTTP status code.
    #[must_use]
    pub fn status(&self) -> u16 {
        self.status
    }

    /// Response headers.
    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// First value of `name` as a string, if present and valid UTF-8.
    #[must_use]
    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Takes the body stream, leaving `None` behind.
    pub fn take_body(&mut self) -> Option<BodyStream> {
        self.body.take()
    }
}

impl fmt::Debug for RawResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field("has_body", &self.body.is_some())
            .finish()
    }
}

/// Failure reported by a transport or connection.
#[derive(Debug, Error)]
#[error("{kind}: {source}")]
pub struct TransportError {
    kind: AccessKind,
    #[source]
    source: BoxError,
}

impl TransportError {
    /// Creates a transport error of `kind` caused by `source`.
    pub fn new(kind: AccessKind, source: impl Into<BoxError>) -> Self {
        Self {
            kind,
            source: source.into(),
        }
    }

    /// Creates a transport error from a plain message.
    pub fn msg(kind: AccessKind, message: impl Into<String>) -> Self {
        Self::new(kind, message.into())
    }

    /// The failure classification.
    #[must_use]
    pub fn kind(&self) -> AccessKind {
        self.kind
    }

    /// Wraps this error as a [`FetchError::Access`] for `url`.
    pub fn into_fetch_error(self, url: impl Into<String>) -> FetchError {
        let kind = self.kind;
        FetchError::access(url, kind, self.source)
    }
}

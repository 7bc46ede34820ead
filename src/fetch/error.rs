//! Error types for the fetch pipeline.
//!
//! Three kinds of failure reach callers of the pipeline:
//! - [`FetchError::Access`] for anything that went wrong talking to the remote
//!   side (DNS, routing, sockets, deadlines, malformed redirects, bad URLs)
//! - [`FetchError::LengthExceeded`] when a body is larger than the content
//!   length policy allows for its MIME type
//! - [`FetchError::System`] for programmer errors detected before any I/O
//!
//! Robots.txt failures never appear here; they are logged and dropped.

use std::fmt;

use thiserror::Error;

/// Boxed error used as the underlying cause of access failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Classification of an access failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessKind {
    /// DNS resolution failed.
    UnknownHost,
    /// The network or host is unreachable.
    NoRouteToHost,
    /// The remote side refused the connection.
    ConnectionRefused,
    /// Establishing the connection timed out.
    ConnectTimeout,
    /// The socket failed after it was established.
    Socket,
    /// Any other I/O failure, including spool file writes.
    Io,
    /// The per-call deadline fired before the call completed.
    AccessTimeout,
    /// No pooled connection became available in time.
    PoolTimeout,
    /// A redirect status arrived without a usable `Location`.
    InvalidRedirect,
    /// The URL could not be parsed or has no host.
    InvalidUrl,
}

impl fmt::Display for AccessKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::UnknownHost => "unknown host",
            Self::NoRouteToHost => "no route to host",
            Self::ConnectionRefused => "connection refused",
            Self::ConnectTimeout => "connection timed out",
            Self::Socket => "socket error",
            Self::Io => "I/O error",
            Self::AccessTimeout => "access timeout",
            Self::PoolTimeout => "connection pool timeout",
            Self::InvalidRedirect => "invalid redirect location",
            Self::InvalidUrl => "invalid URL",
        };
        f.write_str(label)
    }
}

/// Errors surfaced by [`HttpFetcher`](crate::HttpFetcher) and its components.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Network-level or protocol-level failure while accessing `url`.
    #[error("{kind} accessing {url}")]
    Access {
        /// The URL being accessed.
        url: String,
        /// What went wrong.
        kind: AccessKind,
        /// The underlying cause, when there is one.
        #[source]
        source: Option<BoxError>,
    },

    /// The body is larger than the configured maximum for its MIME type.
    #[error("the content length ({length} byte) is over {limit} byte, url is {url}")]
    LengthExceeded {
        /// The URL whose body was too large.
        url: String,
        /// Declared or observed body length in bytes.
        length: u64,
        /// The maximum allowed for the body's MIME type.
        limit: u64,
    },

    /// Programmer error detected before any I/O.
    #[error("system error: {message}")]
    System {
        /// Description of the misuse.
        message: String,
    },
}

impl FetchError {
    /// Creates an access error carrying its cause.
    pub fn access(
        url: impl Into<String>,
        kind: AccessKind,
        source: impl Into<BoxError>,
    ) -> Self {
        Self::Access {
            url: url.into(),
            kind,
            source: Some(source.into()),
        }
    }

    /// Creates an access error with no underlying cause.
    pub fn access_without_cause(url: impl Into<String>, kind: AccessKind) -> Self {
        Self::Access {
            url: url.into(),
            kind,
            source: None,
        }
    }

    /// Creates an access error for a deadline that fired.
    pub fn access_timeout(url: impl Into<String>) -> Self {
        Self::access_without_cause(url, AccessKind::AccessTimeout)
    }

    /// Creates a length-exceeded error.
    pub fn length_exceeded(url: impl Into<String>, length: u64, limit: u64) -> Self {
        Self::LengthExceeded {
            url: url.into(),
            length,
            limit,
        }
    }

    /// Creates a system (programmer) error.
    pub fn system(message: impl Into<String>) -> Self {
        Self::System {
            message: message.into(),
        }
    }

    /// Returns the access kind if this is an access error.
    #[must_use]
    pub fn access_kind(&self) -> Option<AccessKind> {
        match self {
            Self::Access { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Returns true for access errors.
    #[must_use]
    pub fn is_access(&self) -> bool {
        matches!(self, Self::Access { .. })
    }

    /// Returns true for length-exceeded errors.
    #[must_use]
    pub fn is_length_exceeded(&self) -> bool {
        matches!(self, Self::LengthExceeded { .. })
    }

    /// Returns true for system errors.
    #[must_use]
    pub fn is_system(&self) -> bool {
        matches!(self, Self::System { .. })
    }
}

// No `From<reqwest::Error>` or `From<std::io::Error>`: every access error needs the
// URL, which neither source error carries. Transport failures are translated by the
// executor via `TransportError::into_fetch_error`.

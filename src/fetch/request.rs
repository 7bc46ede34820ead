//! Outgoing request description.

use std::fmt;

use url::Url;

use super::error::{AccessKind, FetchError};
use crate::config::Credential;

/// HTTP methods the pipeline issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    /// `GET`: fetch and materialize the body.
    Get,
    /// `HEAD`: headers only.
    Head,
}

impl Method {
    /// Upper-case method name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Head => "HEAD",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One request to dispatch. Immutable once built.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    method: Method,
    url: Url,
    raw_url: String,
    headers: Vec<(String, String)>,
    credential: Option<Credential>,
}

impl FetchRequest {
    /// Builds a request for `url`.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::System`] for a blank URL and
    /// [`FetchError::Access`] with [`AccessKind::InvalidUrl`] when the URL does not
    /// parse or has no host.
    pub fn new(method: Method, url: &str) -> Result<Self, FetchError> {
        if url.trim().is_empty() {
            return Err(FetchError::system("URL is null or empty"));
        }
        let parsed = Url::parse(url).map_err(|e| FetchError::access(url, AccessKind::InvalidUrl, e))?;
        if parsed.host_str().is_none() {
            return Err(FetchError::access_without_cause(url, AccessKind::InvalidUrl));
        }
        Ok(Self {
            method,
            url: parsed,
            raw_url: url.to_string(),
            headers: Vec::new(),
            credential: None,
        })
    }

    /// Shorthand for a `GET` request.
    ///
    /// # Errors
    ///
    /// See [`FetchRequest::new`].
    pub fn get(url: &str) -> Result<Self, FetchError> {
        Self::new(Method::Get, url)
    }

    /// Shorthand for a `HEAD` request.
    ///
    /// # Errors
    ///
    /// See [`FetchRequest::new`].
    pub fn head(url: &str) -> Result<Self, FetchError> {
        Self::new(Method::Head, url)
    }

    /// Appends headers, preserving order.
    #[must_use]
    pub fn with_headers<I, K, V>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.headers
            .extend(headers.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Inserts headers ahead of the existing ones, preserving order.
    #[must_use]
    pub fn with_leading_headers<I, K, V>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut merged: Vec<(String, String)> = headers
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        merged.append(&mut self.headers);
        self.headers = merged;
        self
    }

    /// Attaches basic-auth credentials.
    #[must_use]
    pub fn with_credential(mut self, credential: Option<Credential>) -> Self {
        self.credential = credential;
        self
    }

    /// The request method.
    #[must_use]
    pub fn method(&self) -> Method {
        self.method
    }

    /// The parsed target URL.
    #[must_use]
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// The target URL exactly as the caller supplied it.
    #[must_use]
    pub fn url_str(&self) -> &str {
        &self.raw_url
    }

    /// Ordered request headers.
    #[must_use]
    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// Credentials to send, if any matched the target host.
    #[must_use]
    pub fn credential(&self) -> Option<&Credential> {
        self.credential.as_ref()
    }
}

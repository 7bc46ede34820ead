//! Dispatches one request through the connection pool.

use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use super::error::{AccessKind, FetchError};
use super::request::FetchRequest;
use crate::config::{Credential, FetchConfig};
use crate::pool::{ConnectionLease, ConnectionManager, PoolError, Route};
use crate::transport::RawResponse;

/// A response whose headers arrived, still holding its connection.
///
/// Drop or [`ConnectionLease::release`] the lease once the body is consumed;
/// [`ConnectionLease::discard`] it when the body is abandoned.
#[derive(Debug)]
pub struct Dispatched {
    /// Status, headers and unread body.
    pub response: RawResponse,
    /// The connection carrying the body.
    pub lease: ConnectionLease,
}

/// Sends requests over pooled connections.
#[derive(Debug)]
pub struct Executor {
    manager: ConnectionManager,
    headers: Vec<(String, String)>,
    credentials: Vec<Credential>,
}

impl Executor {
    /// Creates an executor applying the configured headers and credentials.
    #[must_use]
    pub fn new(manager: ConnectionManager, config: &FetchConfig) -> Self {
        Self {
            manager,
            headers: config
                .valid_request_headers()
                .map(|h| (h.name.clone(), h.value.clone()))
                .collect(),
            credentials: config.credentials.clone(),
        }
    }

    /// The pool requests are dispatched through.
    #[must_use]
    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    /// Adds the configured headers (before the request's own) and, unless the
    /// request already carries some, the credentials matching its host.
    #[must_use]
    pub fn prepare(&self, request: FetchRequest) -> FetchRequest {
        let credential = request
            .credential()
            .cloned()
            .or_else(|| self.credential_for(&request));
        request
            .with_leading_headers(self.headers.iter().cloned())
            .with_credential(credential)
    }

    fn credential_for(&self, request: &FetchRequest) -> Option<Credential> {
        let url = request.url();
        let host = url.host_str()?;
        let port = url.port_or_known_default()?;
        self.credentials.iter().find(|c| c.matches(host, port)).cloned()
    }

    /// Leases a connection for the request's route and sends it.
    ///
    /// Waiting for a connection and waiting for response headers both stop
    /// when `cancel` fires. The connection is discarded on every failure.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::Access`] for transport failures, pool timeouts and
    /// cancellation ([`AccessKind::AccessTimeout`]).
    #[instrument(skip(self, request, cancel), fields(method = %request.method(), url = %request.url_str()))]
    pub async fn dispatch(
        &self,
        request: &FetchRequest,
        cancel: &CancellationToken,
    ) -> Result<Dispatched, FetchError> {
        let url = request.url_str();
        let route = Route::from_url(request.url())
            .ok_or_else(|| FetchError::access_without_cause(url, AccessKind::InvalidUrl))?;

        let acquired = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(FetchError::access_timeout(url)),
            acquired = self.manager.acquire(&route) => acquired,
        };
        let mut lease = acquired.map_err(|e| pool_error(e, url))?;

        let sent = tokio::select! {
            biased;
            () = cancel.cancelled() => None,
            sent = lease.send(request) => Some(sent),
        };
        match sent {
            Some(Ok(response)) => {
                debug!(status = response.status(), reused = lease.is_reused(), "response headers received");
                Ok(Dispatched { response, lease })
            }
            Some(Err(e)) => {
                lease.discard();
                Err(e.into_fetch_error(url))
            }
            None => {
                lease.discard();
                Err(FetchError::access_timeout(url))
            }
        }
    }
}

fn pool_error(error: PoolError, url: &str) -> FetchError {
    match error {
        PoolError::Timeout { .. } => FetchError::access(url, AccessKind::PoolTimeout, error),
        PoolError::Closed => FetchError::system(format!("connection manager is closed, url is {url}")),
        PoolError::Open(e) => e.into_fetch_error(url),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::{PoolConfig, RequestHeader};
    use crate::transport::{Connection, Transport, TransportError};
    use async_trait::async_trait;
    use reqwest::header::HeaderMap;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[derive(Debug, Default)]
    struct RecordingTransport {
        seen: Arc<Mutex<Vec<FetchRequest>>>,
        hang: bool,
    }

    #[derive(Debug)]
    struct RecordingConnection {
        seen: Arc<Mutex<Vec<FetchRequest>>>,
        hang: bool,
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn open(&self, _route: &Route) -> Result<Box<dyn Connection>, TransportError> {
            Ok(Box::new(RecordingConnection {
                seen: Arc::clone(&self.seen),
                hang: self.hang,
            }))
        }
    }

    #[async_trait]
    impl Connection for RecordingConnection {
        async fn send(&mut self, request: &FetchRequest) -> Result<RawResponse, TransportError> {
            self.seen.lock().unwrap().push(request.clone());
            if self.hang {
                std::future::pending::<()>().await;
            }
            if request.url().path() == "/refused" {
                return Err(TransportError::msg(AccessKind::ConnectionRefused, "refused"));
            }
            Ok(RawResponse::without_body(200, HeaderMap::new()))
        }

        fn is_open(&self) -> bool {
            true
        }

        fn close(&mut self) -> Result<(), TransportError> {
            Ok(())
        }
    }

    fn executor(transport: RecordingTransport, config: &FetchConfig) -> Executor {
        let manager = ConnectionManager::new(Arc::new(transport), config.pool.clone());
        Executor::new(manager, config)
    }

    #[test]
    fn test_prepare_merges_headers_and_credentials() {
        let config = FetchConfig {
            request_headers: vec![
                RequestHeader::new("Accept-Language", "en"),
                RequestHeader::new(" ", "ignored"),
            ],
            credentials: vec![Credential {
                host: "example.com".to_string(),
                port: None,
                username: "user".to_string(),
                password: Some("secret".to_string()),
            }],
            ..FetchConfig::default()
        };
        let executor = executor(RecordingTransport::default(), &config);

        let request = FetchRequest::get("http://example.com/a")
            .unwrap()
            .with_headers([("X-Own", "1")]);
        let prepared = executor.prepare(request);
        let names: Vec<&str> = prepared.headers().iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, ["Accept-Language", "X-Own"]);
        assert_eq!(prepared.credential().unwrap().username, "user");

        let other = executor.prepare(FetchRequest::get("http://other.com/").unwrap());
        assert!(other.credential().is_none());
    }

    #[tokio::test]
    async fn test_transport_failure_becomes_access_error_and_discards() {
        let config = FetchConfig::default();
        let executor = executor(RecordingTransport::default(), &config);
        let request = FetchRequest::get("http://example.com/refused").unwrap();

        let err = executor
            .dispatch(&request, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.access_kind(), Some(AccessKind::ConnectionRefused));
        assert_eq!(executor.manager().stats().open, 0);
    }

    #[tokio::test]
    async fn test_cancelled_send_releases_connection() {
        let config = FetchConfig {
            pool: PoolConfig {
                max_per_route: 1,
                ..PoolConfig::default()
            },
            ..FetchConfig::default()
        };
        let transport = RecordingTransport {
            hang: true,
            ..RecordingTransport::default()
        };
        let executor = executor(transport, &config);
        let request = FetchRequest::get("http://example.com/slow").unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            trigger.cancel();
        });
        let err = executor.dispatch(&request, &cancel).await.unwrap_err();
        assert_eq!(err.access_kind(), Some(AccessKind::AccessTimeout));
        assert_eq!(executor.manager().stats().leased, 0, "permit returned after abort");
    }

    #[tokio::test]
    async fn test_pool_timeout_is_access_error() {
        let config = FetchConfig {
            pool: PoolConfig {
                max_per_route: 1,
                acquire_timeout_ms: 30,
                ..PoolConfig::default()
            },
            ..FetchConfig::default()
        };
        let executor = executor(RecordingTransport::default(), &config);
        let request = FetchRequest::get("http://example.com/").unwrap();
        let held = executor.dispatch(&request, &CancellationToken::new()).await.unwrap();

        let err = executor
            .dispatch(&request, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.access_kind(), Some(AccessKind::PoolTimeout));
        drop(held);
    }
}

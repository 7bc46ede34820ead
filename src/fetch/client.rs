//! The crawler-facing client: [`CrawlerClient`] and its implementation
//! [`HttpFetcher`].

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::deadline::{DeadlineGuard, GuardState};
use super::error::FetchError;
use super::executor::{Dispatched, Executor};
use super::materializer::Materializer;
use super::request::{FetchRequest, Method};
use super::response::FetchResponse;
use super::robots::RobotsEngine;
use crate::config::FetchConfig;
use crate::context::{ContentLengthLimits, ContentLengthPolicy, CrawlSession};
use crate::mime::{BasicMimeSniffer, MimeSniffer};
use crate::pool::{ConnectionManager, PoolStats, ReaperHandle};
use crate::transport::{HttpSettings, HttpTransport, Transport};

/// Capabilities a crawler needs from an HTTP client.
#[async_trait]
pub trait CrawlerClient: Send + Sync {
    /// Builds the connection pool and registers it with the reaper.
    /// Calling it again is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::System`] for an invalid configuration.
    fn init(&self) -> Result<(), FetchError>;

    /// Fetches `url` with `GET`, initializing on first use.
    ///
    /// # Errors
    ///
    /// See [`FetchError`].
    async fn do_get(&self, url: &str) -> Result<FetchResponse, FetchError>;

    /// Fetches `url` with `HEAD`, initializing on first use.
    ///
    /// # Errors
    ///
    /// See [`FetchError`].
    async fn do_head(&self, url: &str) -> Result<FetchResponse, FetchError>;

    /// Stops the reaper and closes the pool. Calling it again is a no-op.
    fn close(&self);
}

/// Everything built by `init`, dropped by `close`.
struct Pipeline {
    executor: Executor,
    robots: RobotsEngine,
    materializer: Materializer,
    _reaper: ReaperHandle,
}

/// [`CrawlerClient`] over pooled HTTP connections.
///
/// One instance is shared by all crawl workers of a session.
pub struct HttpFetcher {
    config: FetchConfig,
    session: Arc<CrawlSession>,
    transport: Arc<dyn Transport>,
    length_policy: Arc<dyn ContentLengthPolicy>,
    sniffer: Arc<dyn MimeSniffer>,
    pipeline: Mutex<Option<Arc<Pipeline>>>,
}

impl fmt::Debug for HttpFetcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpFetcher")
            .field("user_agent", &self.config.user_agent)
            .field("initialized", &self.is_initialized())
            .finish_non_exhaustive()
    }
}

/// Builder for [`HttpFetcher`].
#[must_use]
pub struct HttpFetcherBuilder {
    config: FetchConfig,
    session: Option<Arc<CrawlSession>>,
    transport: Option<Arc<dyn Transport>>,
    length_policy: Option<Arc<dyn ContentLengthPolicy>>,
    sniffer: Option<Arc<dyn MimeSniffer>>,
}

impl HttpFetcherBuilder {
    /// Crawl session to share robots state, sitemaps and URL filter with.
    pub fn session(mut self, session: Arc<CrawlSession>) -> Self {
        self.session = Some(session);
        self
    }

    /// Replaces the default `reqwest` transport.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn content_length_policy(mut self, policy: Arc<dyn ContentLengthPolicy>) -> Self {
        self.length_policy = Some(policy);
        self
    }

    pub fn mime_sniffer(mut self, sniffer: Arc<dyn MimeSniffer>) -> Self {
        self.sniffer = Some(sniffer);
        self
    }

    /// Builds the fetcher. Nothing is connected until the first fetch or
    /// [`CrawlerClient::init`].
    #[must_use]
    pub fn build(self) -> HttpFetcher {
        let transport = self.transport.unwrap_or_else(|| {
            Arc::new(HttpTransport::new(HttpSettings::from_config(&self.config)))
        });
        HttpFetcher {
            session: self.session.unwrap_or_default(),
            transport,
            length_policy: self
                .length_policy
                .unwrap_or_else(|| Arc::new(ContentLengthLimits::default())),
            sniffer: self.sniffer.unwrap_or_else(|| Arc::new(BasicMimeSniffer)),
            pipeline: Mutex::new(None),
            config: self.config,
        }
    }
}

impl HttpFetcher {
    /// Starts building a fetcher for `config`.
    pub fn builder(config: FetchConfig) -> HttpFetcherBuilder {
        HttpFetcherBuilder {
            config,
            session: None,
            transport: None,
            length_policy: None,
            sniffer: None,
        }
    }

    /// A fetcher with default collaborators and a fresh session.
    #[must_use]
    pub fn new(config: FetchConfig) -> Self {
        Self::builder(config).build()
    }

    #[must_use]
    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    /// The crawl session robots rules and sitemaps are registered into.
    #[must_use]
    pub fn session(&self) -> &Arc<CrawlSession> {
        &self.session
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.lock().is_some()
    }

    /// Pool occupancy, once initialized.
    #[must_use]
    pub fn pool_stats(&self) -> Option<PoolStats> {
        self.lock().as_ref().map(|p| p.executor.manager().stats())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Arc<Pipeline>>> {
        self.pipeline.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pipeline(&self) -> Result<Arc<Pipeline>, FetchError> {
        let mut slot = self.lock();
        if let Some(pipeline) = slot.as_ref() {
            return Ok(Arc::clone(pipeline));
        }

        self.config
            .validate()
            .map_err(|e| FetchError::system(format!("invalid fetch configuration: {e}")))?;
        let manager = ConnectionManager::new(Arc::clone(&self.transport), self.config.pool.clone());
        let reaper = manager.start_reaper();
        let pipeline = Arc::new(Pipeline {
            executor: Executor::new(manager, &self.config),
            robots: RobotsEngine::new(
                self.config.robots.clone(),
                self.config.user_agent.clone(),
                Arc::clone(&self.session),
                Arc::clone(&self.length_policy),
            ),
            materializer: Materializer::new(
                &self.config,
                Arc::clone(&self.length_policy),
                Arc::clone(&self.sniffer),
            ),
            _reaper: reaper,
        });
        info!(
            max_total = self.config.pool.max_total,
            max_per_route = self.config.pool.max_per_route,
            robots = self.config.robots.enabled,
            "fetcher initialized"
        );
        *slot = Some(Arc::clone(&pipeline));
        Ok(pipeline)
    }

    #[instrument(skip(self, method), fields(method = %method))]
    async fn fetch(&self, method: Method, url: &str) -> Result<FetchResponse, FetchError> {
        if url.trim().is_empty() {
            return Err(FetchError::system("URL is null or empty"));
        }
        let request = FetchRequest::new(method, url)?;
        let pipeline = self.pipeline()?;

        {
            let cancel = CancellationToken::new();
            let guard = self.arm(&cancel);
            let outcome = pipeline
                .robots
                .ensure_compliance(url, &pipeline.executor, &cancel)
                .await;
            disarm(guard, "robots.txt");
            if let Err(e) = outcome {
                if e.is_system() {
                    return Err(e);
                }
                warn!(error = %e, "robots.txt check failed, continuing");
            }
        }

        let request = pipeline.executor.prepare(request);
        let cancel = CancellationToken::new();
        let guard = self.arm(&cancel);
        let outcome = Self::dispatch(&pipeline, &request, &cancel).await;
        disarm(guard, url);
        outcome
    }

    async fn dispatch(
        pipeline: &Pipeline,
        request: &FetchRequest,
        cancel: &CancellationToken,
    ) -> Result<FetchResponse, FetchError> {
        let Dispatched { response, lease } = pipeline.executor.dispatch(request, cancel).await?;
        match pipeline.materializer.materialize(response, request, cancel).await {
            Ok(response) if response.is_redirect() => {
                lease.discard();
                Ok(response)
            }
            Ok(response) => {
                lease.release();
                Ok(response)
            }
            Err(e) => {
                lease.discard();
                Err(e)
            }
        }
    }

    fn arm(&self, cancel: &CancellationToken) -> Option<DeadlineGuard> {
        self.config
            .access_timeout()
            .map(|timeout| DeadlineGuard::arm(timeout, cancel.clone()))
    }
}

fn disarm(guard: Option<DeadlineGuard>, call: &str) {
    if let Some(guard) = guard
        && guard.disarm() == GuardState::Fired
    {
        debug!(call, "access timeout fired");
    }
}

#[async_trait]
impl CrawlerClient for HttpFetcher {
    fn init(&self) -> Result<(), FetchError> {
        self.pipeline().map(|_| ())
    }

    async fn do_get(&self, url: &str) -> Result<FetchResponse, FetchError> {
        self.fetch(Method::Get, url).await
    }

    async fn do_head(&self, url: &str) -> Result<FetchResponse, FetchError> {
        self.fetch(Method::Head, url).await
    }

    fn close(&self) {
        let Some(pipeline) = self.lock().take() else {
            return;
        };
        pipeline.executor.manager().close();
        // Dropping the last reference cancels the reaper registration.
        drop(pipeline);
        info!("fetcher closed");
    }
}

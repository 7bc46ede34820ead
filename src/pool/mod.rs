//! Connection lifecycle management.
//!
//! [`ConnectionManager`] keeps connections partitioned by [`Route`], bounded by a
//! global and a per-route cap. Callers [`acquire`](ConnectionManager::acquire) a
//! [`ConnectionLease`]; dropping the lease returns the connection to the idle
//! list, [`ConnectionLease::discard`] closes it instead. Idle and expired
//! connections are closed by [`sweep`](ConnectionManager::sweep), which the
//! shared background reaper calls on a fixed interval.
//!
//! Permits:
//! - a route permit bounds connections in use per route
//! - a global permit bounds connections in use overall
//! - the open counter bounds idle plus leased connections; when it is at the
//!   global cap, one idle connection of any route is evicted before opening,
//!   otherwise the caller waits for a slot within the acquire timeout

mod reaper;

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Instant;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};
use url::Url;

use crate::config::PoolConfig;
use crate::fetch::FetchRequest;
use crate::transport::{Connection, RawResponse, Transport, TransportError};

pub use reaper::{ReaperHandle, Sweep};

/// Partition key for pooled connections.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Route {
    scheme: String,
    host: String,
    port: u16,
}

impl Route {
    /// Creates a route. Scheme and host are lower-cased.
    #[must_use]
    pub fn new(scheme: &str, host: &str, port: u16) -> Self {
        Self {
            scheme: scheme.to_ascii_lowercase(),
            host: host.to_ascii_lowercase(),
            port,
        }
    }

    /// Derives the route of `url`, using the scheme's default port when none is
    /// given. Returns `None` for URLs without a host or a known port.
    #[must_use]
    pub fn from_url(url: &Url) -> Option<Self> {
        let host = url.host_str()?;
        let port = url.port_or_known_default()?;
        Some(Self::new(url.scheme(), host, port))
    }

    /// URL scheme.
    #[must_use]
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// Host name or address.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port, explicit or the scheme default.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}

/// Failure to lease a connection.
#[derive(Debug, Error)]
pub enum PoolError {
    /// No permit became available within the acquire timeout.
    #[error("timed out waiting for a connection to {route}")]
    Timeout {
        /// The saturated route.
        route: Route,
    },

    /// The manager was closed.
    #[error("connection manager is closed")]
    Closed,

    /// The transport could not open a new connection.
    #[error("failed to open connection: {0}")]
    Open(#[source] TransportError),
}

/// Snapshot of pool occupancy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Open connections, idle or leased.
    pub open: usize,
    /// Open connections waiting in idle lists.
    pub idle: usize,
    /// Connections currently held by leases.
    pub leased: usize,
}

/// Connections closed by one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Closed because they outlived the time-to-live.
    pub expired: usize,
    /// Closed because they sat idle past the idle timeout.
    pub idle: usize,
}

impl SweepReport {
    /// Total connections closed.
    #[must_use]
    pub fn total(&self) -> usize {
        self.expired + self.idle
    }
}

struct PooledConnection {
    conn: Box<dyn Connection>,
    created_at: Instant,
    last_used: Instant,
}

struct RoutePool {
    route: Route,
    permits: Arc<Semaphore>,
    idle: Mutex<VecDeque<PooledConnection>>,
}

impl RoutePool {
    fn idle(&self) -> MutexGuard<'_, VecDeque<PooledConnection>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct PoolInner {
    transport: Arc<dyn Transport>,
    config: PoolConfig,
    global: Arc<Semaphore>,
    routes: DashMap<Route, Arc<RoutePool>>,
    open: AtomicUsize,
    closed: AtomicBool,
    slot_freed: Notify,
}

impl PoolInner {
    fn route_pool(&self, route: &Route) -> Arc<RoutePool> {
        Arc::clone(
            self.routes
                .entry(route.clone())
                .or_insert_with(|| {
                    Arc::new(RoutePool {
                        route: route.clone(),
                        permits: Arc::new(Semaphore::new(self.config.max_per_route)),
                        idle: Mutex::new(VecDeque::new()),
                    })
                })
                .value(),
        )
    }

    fn is_expired(&self, pooled: &PooledConnection, now: Instant) -> bool {
        now.duration_since(pooled.created_at) >= self.config.time_to_live()
    }

    /// Pops the most recently used idle connection that is still usable.
    fn take_idle(&self, route_pool: &RoutePool) -> Option<PooledConnection> {
        let now = Instant::now();
        let mut stale = Vec::new();
        let found = {
            let mut idle = route_pool.idle();
            loop {
                match idle.pop_back() {
                    Some(pooled) if self.is_expired(&pooled, now) || !pooled.conn.is_open() => {
                        stale.push(pooled);
                    }
                    other => break other,
                }
            }
        };
        for pooled in stale {
            self.close_connection(pooled, &route_pool.route, "expired while idle");
        }
        found
    }

    /// Closes the least recently used idle connection of any route.
    fn evict_one(&self) -> bool {
        let victim = self.routes.iter().find_map(|entry| {
            let route_pool = entry.value();
            route_pool
                .idle()
                .pop_front()
                .map(|pooled| (route_pool.route.clone(), pooled))
        });
        match victim {
            Some((route, pooled)) => {
                self.close_connection(pooled, &route, "evicted to make room");
                true
            }
            None => false,
        }
    }

    fn try_reserve(&self) -> bool {
        let mut current = self.open.load(Ordering::SeqCst);
        while current < self.config.max_total {
            match self.open.compare_exchange(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
        false
    }

    /// Reserves an open slot, evicting idle connections while at the cap and
    /// otherwise waiting until `deadline` for one to be freed.
    async fn reserve_slot(
        self: &Arc<Self>,
        deadline: tokio::time::Instant,
        route: &Route,
    ) -> Result<SlotReservation, PoolError> {
        loop {
            let freed = self.slot_freed.notified();
            tokio::pin!(freed);
            // Registered before checking so a slot freed in between still wakes us.
            freed.as_mut().enable();

            if self.closed.load(Ordering::SeqCst) {
                return Err(PoolError::Closed);
            }
            if self.try_reserve() {
                return Ok(SlotReservation {
                    inner: Arc::clone(self),
                    held: true,
                });
            }
            if self.evict_one() {
                continue;
            }
            if tokio::time::timeout_at(deadline, freed).await.is_err() {
                return Err(PoolError::Timeout {
                    route: route.clone(),
                });
            }
        }
    }

    fn free_slot(&self) {
        self.open.fetch_sub(1, Ordering::SeqCst);
        self.slot_freed.notify_waiters();
    }

    fn release(&self, route_pool: &RoutePool, mut pooled: PooledConnection) {
        let now = Instant::now();
        if self.closed.load(Ordering::SeqCst) {
            self.close_connection(pooled, &route_pool.route, "manager closed");
        } else if !pooled.conn.is_open() {
            self.close_connection(pooled, &route_pool.route, "connection no longer open");
        } else if self.is_expired(&pooled, now) {
            self.close_connection(pooled, &route_pool.route, "time-to-live exceeded");
        } else {
            pooled.last_used = now;
            route_pool.idle().push_back(pooled);
            self.slot_freed.notify_waiters();
        }
    }

    fn close_connection(&self, mut pooled: PooledConnection, route: &Route, reason: &str) {
        if let Err(e) = pooled.conn.close() {
            warn!(route = %route, error = %e, "failed to close connection");
        }
        self.free_slot();
        debug!(route = %route, reason, "connection closed");
    }

    fn idle_count(&self) -> usize {
        self.routes.iter().map(|entry| entry.value().idle().len()).sum()
    }

    fn sweep(&self) -> SweepReport {
        let now = Instant::now();
        let idle_timeout = self.config.idle_timeout();
        let mut report = SweepReport::default();
        let route_pools: Vec<Arc<RoutePool>> =
            self.routes.iter().map(|entry| Arc::clone(entry.value())).collect();

        for route_pool in route_pools {
            let mut expired = Vec::new();
            let mut stale = Vec::new();
            {
                let mut idle = route_pool.idle();
                let mut keep = VecDeque::with_capacity(idle.len());
                while let Some(pooled) = idle.pop_front() {
                    if self.is_expired(&pooled, now) {
                        expired.push(pooled);
                    } else if now.duration_since(pooled.last_used) >= idle_timeout {
                        stale.push(pooled);
                    } else {
                        keep.push_back(pooled);
                    }
                }
                *idle = keep;
            }
            report.expired += expired.len();
            report.idle += stale.len();
            for pooled in expired {
                self.close_connection(pooled, &route_pool.route, "time-to-live exceeded");
            }
            for pooled in stale {
                self.close_connection(pooled, &route_pool.route, "idle timeout");
            }
        }

        if report.total() > 0 {
            debug!(
                expired = report.expired,
                idle = report.idle,
                open = self.open.load(Ordering::SeqCst),
                "swept connections"
            );
        }
        report
    }
}

/// An open slot taken for a connection still being opened. Dropping it
/// without [`commit`](Self::commit) gives the slot back.
struct SlotReservation {
    inner: Arc<PoolInner>,
    held: bool,
}

impl SlotReservation {
    /// The slot now belongs to an open connection.
    fn commit(mut self) {
        self.held = false;
    }
}

impl Drop for SlotReservation {
    fn drop(&mut self) {
        if self.held {
            self.inner.free_slot();
        }
    }
}

impl Sweep for PoolInner {
    fn sweep(&self) {
        PoolInner::sweep(self);
    }
}

/// Pool of routed connections shared by every fetch of one fetcher.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<PoolInner>,
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("config", &self.inner.config)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    /// Creates a manager opening connections through `transport`.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, config: PoolConfig) -> Self {
        let global = Arc::new(Semaphore::new(config.max_total));
        Self {
            inner: Arc::new(PoolInner {
                transport,
                config,
                global,
                routes: DashMap::new(),
                open: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
                slot_freed: Notify::new(),
            }),
        }
    }

    /// Leases a connection for `route`, waiting for capacity up to the
    /// configured acquire timeout.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::Timeout`] when limits stay saturated,
    /// [`PoolError::Closed`] after [`close`](Self::close), and
    /// [`PoolError::Open`] when a new connection cannot be opened.
    pub async fn acquire(&self, route: &Route) -> Result<ConnectionLease, PoolError> {
        if self.is_closed() {
            return Err(PoolError::Closed);
        }
        let route_pool = self.inner.route_pool(route);
        let deadline = tokio::time::Instant::now() + self.inner.config.acquire_timeout();

        let route_permit = acquire_permit(&route_pool.permits, deadline, route).await?;
        let global_permit = acquire_permit(&self.inner.global, deadline, route).await?;
        let permits = (route_permit, global_permit);

        if let Some(pooled) = self.inner.take_idle(&route_pool) {
            debug!(route = %route, "reusing pooled connection");
            return Ok(ConnectionLease::new(pooled, route_pool, &self.inner, true, permits));
        }

        let slot = self.inner.reserve_slot(deadline, route).await?;
        let conn = self
            .inner
            .transport
            .open(route)
            .await
            .map_err(PoolError::Open)?;
        slot.commit();
        debug!(route = %route, open = self.inner.open.load(Ordering::SeqCst), "opened connection");
        let now = Instant::now();
        let pooled = PooledConnection {
            conn,
            created_at: now,
            last_used: now,
        };
        Ok(ConnectionLease::new(pooled, route_pool, &self.inner, false, permits))
    }

    /// Closes idle connections past their time-to-live or idle timeout.
    ///
    /// Close failures are logged; sweeping never fails.
    pub fn sweep(&self) -> SweepReport {
        self.inner.sweep()
    }

    /// Registers this manager with the shared background reaper.
    #[must_use]
    pub fn start_reaper(&self) -> ReaperHandle {
        let target: Weak<dyn Sweep> = Arc::downgrade(&self.inner) as Weak<dyn Sweep>;
        reaper::register(target, self.inner.config.sweep_interval())
    }

    /// Current occupancy.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let open = self.inner.open.load(Ordering::SeqCst);
        let idle = self.inner.idle_count();
        PoolStats {
            open,
            idle,
            leased: open.saturating_sub(idle),
        }
    }

    /// The pool settings.
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Returns true once [`close`](Self::close) was called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Stops handing out connections and closes every idle one. Leased
    /// connections are closed when their lease ends. Closing twice is a no-op.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.global.close();
        self.inner.slot_freed.notify_waiters();
        let route_pools: Vec<Arc<RoutePool>> =
            self.inner.routes.iter().map(|entry| Arc::clone(entry.value())).collect();
        let mut closed = 0;
        for route_pool in route_pools {
            route_pool.permits.close();
            let drained: Vec<PooledConnection> = route_pool.idle().drain(..).collect();
            closed += drained.len();
            for pooled in drained {
                self.inner.close_connection(pooled, &route_pool.route, "manager closed");
            }
        }
        debug!(closed, "connection manager closed");
    }
}

async fn acquire_permit(
    semaphore: &Arc<Semaphore>,
    deadline: tokio::time::Instant,
    route: &Route,
) -> Result<OwnedSemaphorePermit, PoolError> {
    match tokio::time::timeout_at(deadline, Arc::clone(semaphore).acquire_owned()).await {
        Ok(Ok(permit)) => Ok(permit),
        Ok(Err(_)) => Err(PoolError::Closed),
        Err(_) => Err(PoolError::Timeout {
            route: route.clone(),
        }),
    }
}

/// Exclusive use of one pooled connection.
///
/// Dropping the lease returns the connection to the pool; the permits are
/// released afterwards so a waiter finds it idle.
pub struct ConnectionLease {
    conn: Option<PooledConnection>,
    route_pool: Arc<RoutePool>,
    inner: Arc<PoolInner>,
    reused: bool,
    _permits: (OwnedSemaphorePermit, OwnedSemaphorePermit),
}

impl fmt::Debug for ConnectionLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionLease")
            .field("route", &self.route_pool.route)
            .field("reused", &self.reused)
            .finish_non_exhaustive()
    }
}

impl ConnectionLease {
    fn new(
        conn: PooledConnection,
        route_pool: Arc<RoutePool>,
        inner: &Arc<PoolInner>,
        reused: bool,
        permits: (OwnedSemaphorePermit, OwnedSemaphorePermit),
    ) -> Self {
        Self {
            conn: Some(conn),
            route_pool,
            inner: Arc::clone(inner),
            reused,
            _permits: permits,
        }
    }

    /// The route this connection belongs to.
    #[must_use]
    pub fn route(&self) -> &Route {
        &self.route_pool.route
    }

    /// Returns true if the connection came from the idle list.
    #[must_use]
    pub fn is_reused(&self) -> bool {
        self.reused
    }

    /// Sends `request` over the leased connection.
    ///
    /// # Errors
    ///
    /// Propagates the connection's [`TransportError`].
    pub async fn send(&mut self, request: &FetchRequest) -> Result<RawResponse, TransportError> {
        match self.conn.as_mut() {
            Some(pooled) => pooled.conn.send(request).await,
            None => Err(TransportError::msg(
                crate::fetch::AccessKind::Io,
                "connection already released",
            )),
        }
    }

    /// Returns the connection to the pool. Same as dropping the lease.
    pub fn release(self) {
        drop(self);
    }

    /// Closes the connection instead of returning it to the pool.
    pub fn discard(mut self) {
        if let Some(pooled) = self.conn.take() {
            self.inner
                .close_connection(pooled, &self.route_pool.route, "discarded");
        }
    }
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        if let Some(pooled) = self.conn.take() {
            self.inner.release(&self.route_pool, pooled);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use reqwest::header::HeaderMap;
    use std::time::Duration;

    #[derive(Debug, Default)]
    struct CountingTransport {
        opened: AtomicUsize,
        closed: Arc<AtomicUsize>,
    }

    #[derive(Debug)]
    struct StubConnection {
        open: bool,
        closed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Connection for StubConnection {
        async fn send(&mut self, _request: &FetchRequest) -> Result<RawResponse, TransportError> {
            Ok(RawResponse::without_body(204, HeaderMap::new()))
        }

        fn is_open(&self) -> bool {
            self.open
        }

        fn close(&mut self) -> Result<(), TransportError> {
            if self.open {
                self.open = false;
                self.closed.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        }
    }

    #[async_trait]
    impl Transport for CountingTransport {
        async fn open(&self, _route: &Route) -> Result<Box<dyn Connection>, TransportError> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(StubConnection {
                open: true,
                closed: Arc::clone(&self.closed),
            }))
        }
    }

    /// Takes a while to open each connection.
    #[derive(Debug, Default)]
    struct SlowOpenTransport {
        closed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Transport for SlowOpenTransport {
        async fn open(&self, _route: &Route) -> Result<Box<dyn Connection>, TransportError> {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(Box::new(StubConnection {
                open: true,
                closed: Arc::clone(&self.closed),
            }))
        }
    }

    fn new_manager(config: PoolConfig) -> (ConnectionManager, Arc<CountingTransport>) {
        let transport = Arc::new(CountingTransport::default());
        let manager = ConnectionManager::new(Arc::clone(&transport) as Arc<dyn Transport>, config);
        (manager, transport)
    }

    fn route(host: &str) -> Route {
        Route::new("http", host, 80)
    }

    #[test]
    fn test_route_from_url_uses_default_port() {
        let url = Url::parse("HTTPS://Example.COM/path").unwrap();
        let route = Route::from_url(&url).unwrap();
        assert_eq!(route, Route::new("https", "example.com", 443));
        assert_eq!(route.to_string(), "https://example.com:443");
    }

    #[tokio::test]
    async fn test_released_connection_is_reused() {
        let (manager, transport) = new_manager(PoolConfig::default());
        let lease = manager.acquire(&route("a")).await.unwrap();
        assert!(!lease.is_reused());
        drop(lease);
        assert_eq!(manager.stats(), PoolStats { open: 1, idle: 1, leased: 0 });

        let lease = manager.acquire(&route("a")).await.unwrap();
        assert!(lease.is_reused());
        assert_eq!(transport.opened.load(Ordering::SeqCst), 1);
        assert_eq!(manager.stats().leased, 1);
    }

    #[tokio::test]
    async fn test_discarded_connection_is_closed() {
        let (manager, transport) = new_manager(PoolConfig::default());
        let lease = manager.acquire(&route("a")).await.unwrap();
        lease.discard();
        assert_eq!(transport.closed.load(Ordering::SeqCst), 1);
        assert_eq!(manager.stats(), PoolStats::default());
    }

    #[tokio::test]
    async fn test_per_route_limit_times_out() {
        let config = PoolConfig {
            max_per_route: 1,
            acquire_timeout_ms: 50,
            ..PoolConfig::default()
        };
        let (manager, _) = new_manager(config);
        let held = manager.acquire(&route("a")).await.unwrap();

        let err = manager.acquire(&route("a")).await.unwrap_err();
        assert!(matches!(err, PoolError::Timeout { .. }), "got {err:?}");

        // Other routes are unaffected.
        let other = manager.acquire(&route("b")).await.unwrap();
        drop(other);
        drop(held);
        assert!(manager.acquire(&route("a")).await.is_ok());
    }

    #[tokio::test]
    async fn test_waiter_gets_released_connection() {
        let config = PoolConfig {
            max_per_route: 1,
            ..PoolConfig::default()
        };
        let (manager, transport) = new_manager(config);
        let held = manager.acquire(&route("a")).await.unwrap();

        let waiter = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.acquire(&route("a")).await.map(|l| l.is_reused()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(held);

        assert!(waiter.await.unwrap().unwrap());
        assert_eq!(transport.opened.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_global_cap_evicts_idle_connection_of_other_route() {
        let config = PoolConfig {
            max_total: 1,
            ..PoolConfig::default()
        };
        let (manager, transport) = new_manager(config);
        drop(manager.acquire(&route("a")).await.unwrap());
        assert_eq!(manager.stats().idle, 1);

        let lease = manager.acquire(&route("b")).await.unwrap();
        assert!(!lease.is_reused());
        assert_eq!(transport.closed.load(Ordering::SeqCst), 1);
        assert_eq!(manager.stats(), PoolStats { open: 1, idle: 0, leased: 1 });
    }

    #[tokio::test]
    async fn test_sweep_closes_idle_and_expired() {
        let config = PoolConfig {
            idle_timeout_ms: 10,
            ..PoolConfig::default()
        };
        let (manager, transport) = new_manager(config);
        drop(manager.acquire(&route("a")).await.unwrap());
        assert_eq!(manager.sweep().total(), 0, "fresh connection survives");

        tokio::time::sleep(Duration::from_millis(30)).await;
        let report = manager.sweep();
        assert_eq!(report, SweepReport { expired: 0, idle: 1 });
        assert_eq!(transport.closed.load(Ordering::SeqCst), 1);

        let config = PoolConfig {
            time_to_live_ms: 10,
            ..PoolConfig::default()
        };
        let (manager, _) = new_manager(config);
        drop(manager.acquire(&route("a")).await.unwrap());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(manager.sweep(), SweepReport { expired: 1, idle: 0 });
    }

    #[tokio::test]
    async fn test_expired_connection_is_not_reused() {
        let config = PoolConfig {
            time_to_live_ms: 10,
            ..PoolConfig::default()
        };
        let (manager, transport) = new_manager(config);
        let lease = manager.acquire(&route("a")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        drop(lease);
        assert_eq!(manager.stats().open, 0, "expired on release");

        let lease = manager.acquire(&route("a")).await.unwrap();
        assert!(!lease.is_reused());
        assert_eq!(transport.opened.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_close_drains_idle_and_rejects_acquire() {
        let (manager, transport) = new_manager(PoolConfig::default());
        drop(manager.acquire(&route("a")).await.unwrap());
        let held = manager.acquire(&route("b")).await.unwrap();

        manager.close();
        manager.close();
        assert_eq!(transport.closed.load(Ordering::SeqCst), 1);
        assert!(matches!(manager.acquire(&route("a")).await, Err(PoolError::Closed)));

        drop(held);
        assert_eq!(transport.closed.load(Ordering::SeqCst), 2, "late release is closed");
        assert_eq!(manager.stats(), PoolStats::default());
    }

    #[tokio::test]
    async fn test_abandoned_open_gives_slot_back() {
        let config = PoolConfig {
            max_total: 1,
            acquire_timeout_ms: 300,
            ..PoolConfig::default()
        };
        let manager = ConnectionManager::new(Arc::new(SlowOpenTransport::default()), config);

        let abandoned =
            tokio::time::timeout(Duration::from_millis(50), manager.acquire(&route("a"))).await;
        assert!(abandoned.is_err(), "open should still be pending");
        assert_eq!(manager.stats(), PoolStats::default());

        let lease = tokio::time::timeout(Duration::from_secs(2), manager.acquire(&route("b")))
            .await
            .expect("acquire should not hang")
            .unwrap();
        assert!(!lease.is_reused());
        assert_eq!(manager.stats().open, 1);
    }

    #[tokio::test]
    async fn test_waiting_for_open_slot_times_out() {
        let config = PoolConfig {
            max_total: 1,
            acquire_timeout_ms: 100,
            ..PoolConfig::default()
        };
        let (manager, transport) = new_manager(config);
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        let held = manager.inner.reserve_slot(deadline, &route("a")).await.unwrap();

        let started = std::time::Instant::now();
        let err = manager.acquire(&route("b")).await.unwrap_err();
        assert!(matches!(err, PoolError::Timeout { .. }), "got {err:?}");
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(transport.opened.load(Ordering::SeqCst), 0);

        drop(held);
        assert_eq!(manager.stats().open, 0);
    }

    #[tokio::test]
    async fn test_freed_slot_wakes_waiting_acquire() {
        let config = PoolConfig {
            max_total: 1,
            ..PoolConfig::default()
        };
        let (manager, transport) = new_manager(config);
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        let held = manager.inner.reserve_slot(deadline, &route("a")).await.unwrap();

        let waiter = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.acquire(&route("b")).await.map(|l| l.is_reused()) })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!waiter.is_finished());
        drop(held);

        let reused = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .expect("waiter should be woken")
            .unwrap()
            .unwrap();
        assert!(!reused);
        assert_eq!(transport.opened.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_reaper_sweeps_registered_manager() {
        let config = PoolConfig {
            idle_timeout_ms: 10,
            sweep_interval_ms: 100,
            ..PoolConfig::default()
        };
        let (manager, transport) = new_manager(config);
        let handle = manager.start_reaper();
        drop(manager.acquire(&route("a")).await.unwrap());

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(transport.closed.load(Ordering::SeqCst), 1);
        assert_eq!(manager.stats().open, 0);
        handle.cancel();
    }
}

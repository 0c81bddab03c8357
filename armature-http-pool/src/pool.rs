//! Connection pool.
//!
//! Connections are partitioned by [`Destination`]. Each route owns a semaphore
//! of `max_per_route` permits and the pool owns one of `max_total` permits; a
//! lease holds one of each, always acquired route first, then global. The
//! caller's connect timeout is a single budget: waiting for permits and opening
//! a new connection both draw from it.
//!
//! Returned connections go to the route's idle list (most recently used first).
//! An idle connection unused for longer than the time-to-live is dropped on the
//! next acquire, and one idle for more than [`VALIDATE_AFTER_INACTIVITY`] is
//! checked for liveness before it is handed out.

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use crate::config::PoolConfig;
use crate::destination::Destination;
use crate::transport::{Connection, Connector};
use crate::{HttpPoolError, Result};

/// Idle time after which a pooled connection is checked before reuse.
pub const VALIDATE_AFTER_INACTIVITY: Duration = Duration::from_millis(1000);

/// Snapshot of pool usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Connections currently leased.
    pub leased: usize,
    /// Connections waiting in idle lists.
    pub idle: usize,
    /// Global permits not currently held.
    pub available: usize,
    /// Configured global cap.
    pub max_total: usize,
    /// Configured per-route cap.
    pub max_per_route: usize,
    /// Number of routes currently tracked.
    pub routes: usize,
}

/// Snapshot of one route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteStats {
    /// Connections currently leased for the route.
    pub leased: usize,
    /// Idle connections kept for the route.
    pub idle: usize,
    /// Route permits not currently held.
    pub available: usize,
}

struct IdleConnection {
    conn: Box<dyn Connection>,
    created_at: Instant,
    last_used: Instant,
}

struct Route {
    permits: Arc<Semaphore>,
    idle: Mutex<VecDeque<IdleConnection>>,
    leased: AtomicUsize,
}

struct PoolInner {
    config: PoolConfig,
    connector: Arc<dyn Connector>,
    global: Arc<Semaphore>,
    routes: Mutex<HashMap<Destination, Arc<Route>>>,
    idle_count: AtomicUsize,
    closed: AtomicBool,
}

/// Bounded pool of reusable connections keyed by destination.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Create a pool that opens new connections with `connector`.
    pub fn new(config: PoolConfig, connector: Arc<dyn Connector>) -> Self {
        info!(
            max_per_route = config.max_per_route,
            max_total = config.max_total,
            ttl = ?config.connection_time_to_live,
            "Connection pool initialized"
        );

        Self {
            inner: Arc::new(PoolInner {
                global: Arc::new(Semaphore::new(config.max_total)),
                config,
                connector,
                routes: Mutex::new(HashMap::new()),
                idle_count: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Pool sizing.
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Lease a connection, reusing an idle one when possible.
    pub async fn acquire(&self, destination: &Destination, wait: Duration) -> Result<PooledConnection> {
        self.lease(destination, wait, true).await
    }

    /// Lease a newly opened connection, bypassing idle ones.
    pub async fn acquire_new(
        &self,
        destination: &Destination,
        wait: Duration,
    ) -> Result<PooledConnection> {
        self.lease(destination, wait, false).await
    }

    async fn lease(
        &self,
        destination: &Destination,
        wait: Duration,
        reuse_idle: bool,
    ) -> Result<PooledConnection> {
        if self.is_closed() {
            return Err(HttpPoolError::PoolClosed);
        }

        // One budget covers waiting for permits and opening the connection.
        let deadline = tokio::time::Instant::now() + wait;
        let route = self.route(destination);
        let global = Arc::clone(&self.inner.global);
        let route_permits = Arc::clone(&route.permits);

        let permits = tokio::time::timeout_at(deadline, async move {
            let route_permit = route_permits.acquire_owned().await?;
            let global_permit = global.acquire_owned().await?;
            Ok::<_, tokio::sync::AcquireError>((route_permit, global_permit))
        })
        .await;

        let (route_permit, global_permit) = match permits {
            Ok(Ok(permits)) => permits,
            Ok(Err(_)) => return Err(HttpPoolError::PoolClosed),
            Err(_) => {
                warn!(destination = %destination, waited = ?wait, "Timed out waiting for a pooled connection");
                return Err(HttpPoolError::PoolExhausted {
                    destination: destination.to_string(),
                    waited: wait,
                });
            }
        };

        let mut lease = PooledConnection {
            conn: None,
            created_at: Instant::now(),
            reused: false,
            destination: destination.clone(),
            route: Arc::clone(&route),
            pool: Arc::clone(&self.inner),
            _route_permit: route_permit,
            _global_permit: global_permit,
        };
        route.leased.fetch_add(1, Ordering::SeqCst);

        if reuse_idle && let Some(idle) = self.take_idle(&route, destination) {
            lease.conn = Some(idle.conn);
            lease.created_at = idle.created_at;
            lease.reused = true;
            return Ok(lease);
        }

        // Dropping the lease on error gives both permits back.
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        let conn = self.inner.connector.connect(destination, remaining).await?;
        lease.conn = Some(conn);
        Ok(lease)
    }

    fn take_idle(&self, route: &Route, destination: &Destination) -> Option<IdleConnection> {
        let ttl = self.inner.config.connection_time_to_live;
        loop {
            let idle = route.idle.lock().pop_back()?;
            self.inner.idle_count.fetch_sub(1, Ordering::SeqCst);

            let idle_for = idle.last_used.elapsed();
            if idle_for > ttl {
                debug!(destination = %destination, idle_for = ?idle_for, "Discarding expired connection");
                continue;
            }
            if idle_for > VALIDATE_AFTER_INACTIVITY && !idle.conn.is_open() {
                debug!(destination = %destination, "Discarding stale connection");
                continue;
            }
            return Some(idle);
        }
    }

    fn route(&self, destination: &Destination) -> Arc<Route> {
        let mut routes = self.inner.routes.lock();
        let route = routes.entry(destination.clone()).or_insert_with(|| {
            Arc::new(Route {
                permits: Arc::new(Semaphore::new(self.inner.config.max_per_route)),
                idle: Mutex::new(VecDeque::new()),
                leased: AtomicUsize::new(0),
            })
        });
        Arc::clone(route)
    }

    /// Return a leased connection. Same as [`PooledConnection::release`].
    pub fn release(&self, conn: PooledConnection, reusable: bool) {
        conn.release(reusable);
    }

    /// Drop idle connections past their time-to-live or already closed, then
    /// forget routes left with nothing leased or idle.
    /// Returns how many connections were removed.
    pub fn purge_expired(&self) -> usize {
        let ttl = self.inner.config.connection_time_to_live;
        let mut routes = self.inner.routes.lock();

        let mut removed = 0;
        for route in routes.values() {
            let mut idle = route.idle.lock();
            let before = idle.len();
            idle.retain(|c| c.last_used.elapsed() <= ttl && c.conn.is_open());
            removed += before - idle.len();
        }
        self.inner.idle_count.fetch_sub(removed, Ordering::SeqCst);

        // A route handed out by `route()` is referenced outside the map until
        // its lease ends, so a count of one means nobody is using it.
        let before = routes.len();
        routes.retain(|_, route| Arc::strong_count(route) > 1 || !route.idle.lock().is_empty());
        let forgotten = before - routes.len();

        if removed > 0 || forgotten > 0 {
            debug!(removed, routes_forgotten = forgotten, "Purged expired connections");
        }
        removed
    }

    /// Close the pool: idle connections are dropped, waiters fail with
    /// [`HttpPoolError::PoolClosed`], leased connections are discarded on release.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.global.close();

        let routes: Vec<Arc<Route>> = self.inner.routes.lock().values().cloned().collect();
        let mut dropped = 0;
        for route in routes {
            route.permits.close();
            let mut idle = route.idle.lock();
            dropped += idle.len();
            idle.clear();
        }
        self.inner.idle_count.fetch_sub(dropped, Ordering::SeqCst);
        info!(idle_dropped = dropped, "Connection pool closed");
    }

    /// Whether [`ConnectionPool::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Pool-wide usage.
    pub fn stats(&self) -> PoolStats {
        let routes = self.inner.routes.lock();
        PoolStats {
            leased: routes.values().map(|r| r.leased.load(Ordering::SeqCst)).sum(),
            idle: self.inner.idle_count.load(Ordering::SeqCst),
            available: self.inner.global.available_permits(),
            max_total: self.inner.config.max_total,
            max_per_route: self.inner.config.max_per_route,
            routes: routes.len(),
        }
    }

    /// Usage of one route, if it has been used.
    pub fn route_stats(&self, destination: &Destination) -> Option<RouteStats> {
        let routes = self.inner.routes.lock();
        routes.get(destination).map(|route| RouteStats {
            leased: route.leased.load(Ordering::SeqCst),
            idle: route.idle.lock().len(),
            available: route.permits.available_permits(),
        })
    }
}

/// A connection leased to exactly one in-flight request.
///
/// Dropping a lease without calling [`PooledConnection::release`] discards
/// the connection; the permits are always returned.
pub struct PooledConnection {
    conn: Option<Box<dyn Connection>>,
    created_at: Instant,
    reused: bool,
    destination: Destination,
    route: Arc<Route>,
    pool: Arc<PoolInner>,
    _route_permit: OwnedSemaphorePermit,
    _global_permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    /// Destination this connection belongs to.
    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    /// Whether the connection came from the idle list.
    pub fn is_reused(&self) -> bool {
        self.reused
    }

    /// Send a request over the leased connection.
    pub async fn send(&mut self, request: http::Request<Bytes>) -> Result<http::Response<Bytes>> {
        match self.conn.as_mut() {
            Some(conn) => conn.send(request).await,
            None => Err(HttpPoolError::io_before_send("connection already released")),
        }
    }

    /// Give the connection back. With `reusable == false`, or when the pool is
    /// closed or the connection is no longer open, it is discarded.
    pub fn release(mut self, reusable: bool) {
        let Some(conn) = self.conn.take() else {
            return;
        };

        let keep = reusable
            && conn.is_open()
            && !self.pool.closed.load(Ordering::SeqCst)
            && self.pool.idle_count.load(Ordering::SeqCst) < self.pool.config.max_total;
        if !keep {
            debug!(destination = %self.destination, reusable, "Discarding connection");
            return;
        }

        // Enqueue before the permits drop so a waiter finds this connection.
        self.pool.idle_count.fetch_add(1, Ordering::SeqCst);
        self.route.idle.lock().push_back(IdleConnection {
            conn,
            created_at: self.created_at,
            last_used: Instant::now(),
        });
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if self.conn.take().is_some() {
            debug!(destination = %self.destination, "Lease dropped without release, discarding connection");
        }
        self.route.leased.fetch_sub(1, Ordering::SeqCst);
    }
}

//! Connection pool management.
//!
//! This module owns a bounded set of physical [`DbConnection`]s and hands them
//! out with exclusive ownership.
//!
//! # Design Decisions
//!
//! - **`Semaphore` with `pool_max` permits**: a checked-out connection holds a
//!   permit, so no more than `pool_max` connections are ever held at once and
//!   `acquire` is the only operation that waits on other callers
//! - **`std::sync::Mutex` for the available set**: never held across an await,
//!   which lets [`PooledConnection`] return itself synchronously in `Drop`
//! - **Checked-out id set**: every release is matched against the ids currently
//!   handed out, so a second release of the same connection is detected
//! - **`Weak` reference in the maintenance task**: the task stops once the pool
//!   is dropped or closed
//!
//! # Connection Accounting
//!
//! Every live connection is exactly one of idle, checked out, or being opened.
//! Checked-out and opening connections each hold a permit. New connections are
//! opened either by an `acquire` that found no idle connection, or by
//! maintenance while the total is below `pool_min`, and both paths hold a permit
//! while opening, so the total stays at or below `pool_max`.
//!
//! `acquire` and `replenish` may be cancelled at any await. The accounting for a
//! connection being opened or tested is held by [`OpeningSlot`] and
//! [`IdleCheckout`], which undo it when dropped.

use crate::config::{POOL_MAINTENANCE_INTERVAL, PoolConfig};
use crate::db::connection::{DatabaseType, DbConnection};
use crate::error::{OrmError, OrmResult};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

struct IdleConnection {
    id: u64,
    conn: DbConnection,
    idle_since: Instant,
}

#[derive(Default)]
struct PoolState {
    /// Most recently returned at the back.
    idle: VecDeque<IdleConnection>,
    checked_out: HashSet<u64>,
    opening: usize,
}

impl PoolState {
    fn total(&self) -> usize {
        self.idle.len() + self.checked_out.len() + self.opening
    }
}

struct PoolInner {
    config: PoolConfig,
    db_type: DatabaseType,
    semaphore: Arc<Semaphore>,
    state: Mutex<PoolState>,
    next_id: AtomicU64,
    closed: AtomicBool,
    /// Signalled whenever a checked-out connection comes back.
    returned: Notify,
    returned_after_close: AtomicUsize,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

impl PoolInner {
    fn lock_state(&self) -> OrmResult<MutexGuard<'_, PoolState>> {
        self.state
            .lock()
            .map_err(|_| OrmError::internal("connection pool state lock poisoned"))
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Return a checked-out connection to the available set.
    ///
    /// Broken connections, and anything returned after the pool closed, are
    /// discarded instead. Fails with `InvalidRelease` if `id` is not currently
    /// checked out; the pool state is left untouched in that case.
    fn check_in(self: &Arc<Self>, id: u64, conn: DbConnection, broken: bool) -> OrmResult<()> {
        let mut state = self.lock_state()?;
        if !state.checked_out.remove(&id) {
            drop(state);
            error!(
                connection_id = id,
                "Release of a connection that is not checked out from this pool"
            );
            return Err(OrmError::invalid_release(
                id,
                "connection is not checked out from this pool (already released?)",
            ));
        }

        if self.is_closed() {
            drop(state);
            self.returned_after_close.fetch_add(1, Ordering::AcqRel);
            debug!(connection_id = id, "Pool closed, closing returned connection");
            close_in_background(id, conn);
        } else if broken {
            let below_min = state.total() < self.config.pool_min as usize;
            drop(state);
            warn!(connection_id = id, "Discarding broken connection");
            drop(conn);
            if below_min {
                self.schedule_replenish();
            }
        } else {
            state.idle.push_back(IdleConnection {
                id,
                conn,
                idle_since: Instant::now(),
            });
            drop(state);
            debug!(connection_id = id, "Connection returned to pool");
        }

        self.returned.notify_waiters();
        Ok(())
    }

    /// Replenish up to `pool_min` in the background, if a runtime is available.
    fn schedule_replenish(self: &Arc<Self>) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let weak = Arc::downgrade(self);
        handle.spawn(async move {
            if let Some(inner) = weak.upgrade() {
                let pool = ConnectionPool { inner };
                if let Err(e) = pool.replenish().await {
                    warn!(error = %e, "Failed to replenish connection pool");
                }
            }
        });
    }
}

/// An `opening` count held while a connection is being opened.
///
/// Dropping the slot without [`finish`](Self::finish) gives the count back.
struct OpeningSlot {
    pool: Arc<PoolInner>,
    armed: bool,
}

impl OpeningSlot {
    /// Reserve a slot; the caller already holds the state lock.
    fn reserve(pool: &Arc<PoolInner>, state: &mut PoolState) -> Self {
        state.opening += 1;
        Self {
            pool: Arc::clone(pool),
            armed: true,
        }
    }

    fn finish(mut self, state: &mut PoolState) {
        state.opening -= 1;
        self.armed = false;
    }
}

impl Drop for OpeningSlot {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        match self.pool.state.lock() {
            Ok(mut state) => state.opening -= 1,
            Err(poisoned) => poisoned.into_inner().opening -= 1,
        }
    }
}

/// An idle connection taken for `acquire` but not yet handed out.
///
/// Its id is already in the checked-out set. Dropping the checkout discards the
/// connection and removes the id.
struct IdleCheckout {
    pool: Arc<PoolInner>,
    idle: Option<IdleConnection>,
}

impl IdleCheckout {
    fn id(&self) -> u64 {
        self.idle.as_ref().map_or(0, |idle| idle.id)
    }

    fn connection(&mut self) -> Option<&mut DbConnection> {
        self.idle.as_mut().map(|idle| &mut idle.conn)
    }

    fn into_connection(mut self) -> Option<(u64, DbConnection)> {
        self.idle.take().map(|idle| (idle.id, idle.conn))
    }
}

impl Drop for IdleCheckout {
    fn drop(&mut self) {
        let Some(idle) = self.idle.take() else {
            return;
        };
        let below_min = match self.pool.state.lock() {
            Ok(mut state) => {
                state.checked_out.remove(&idle.id);
                state.total() < self.pool.config.pool_min as usize
            }
            Err(poisoned) => {
                let mut state = poisoned.into_inner();
                state.checked_out.remove(&idle.id);
                false
            }
        };
        debug!(connection_id = idle.id, "Discarding connection taken from the idle set");
        drop(idle.conn);
        self.pool.returned.notify_waiters();
        if below_min && !self.pool.is_closed() {
            self.pool.schedule_replenish();
        }
    }
}

/// What `acquire` found under the state lock.
enum Candidate {
    Idle(IdleCheckout),
    Open(OpeningSlot),
}

/// Close a connection without blocking the caller.
fn close_in_background(id: u64, conn: DbConnection) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                if let Err(e) = conn.close().await {
                    debug!(connection_id = id, error = %e, "Connection close failed");
                }
            });
        }
        Err(_) => drop(conn),
    }
}

/// Snapshot of pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// Live connections (idle + checked out + opening)
    pub size: usize,
    pub idle: usize,
    pub checked_out: usize,
    pub min: u32,
    pub max: u32,
    pub closed: bool,
}

/// Result of one maintenance pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    /// Idle connections closed for exceeding the idle timeout
    pub reaped: usize,
    /// Connections opened to get back to `pool_min`
    pub opened: usize,
}

/// Result of closing the pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolCloseReport {
    pub idle_closed: usize,
    /// Checked-out connections that came back within the grace period
    pub returned: usize,
    /// Checked-out connections still out when the grace period ended
    pub outstanding: usize,
}

/// A bounded pool of database connections.
///
/// Cloning is cheap and yields a handle to the same pool.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("db_type", &self.inner.db_type)
            .field("url", &self.inner.config.masked_url())
            .field("status", &self.status())
            .finish()
    }
}

impl ConnectionPool {
    /// Create a pool and open `pool_min` connections.
    ///
    /// Spawns a background task that periodically reaps idle connections and
    /// replenishes the pool.
    pub async fn connect(config: PoolConfig) -> OrmResult<Self> {
        config.validate()?;
        let db_type = config.database_type()?;

        info!(
            db_type = %db_type,
            url = %config.masked_url(),
            pool_min = config.pool_min,
            pool_max = config.pool_max,
            "Creating connection pool"
        );

        let pool = Self {
            inner: Arc::new(PoolInner {
                semaphore: Arc::new(Semaphore::new(config.pool_max as usize)),
                config,
                db_type,
                state: Mutex::new(PoolState::default()),
                next_id: AtomicU64::new(1),
                closed: AtomicBool::new(false),
                returned: Notify::new(),
                returned_after_close: AtomicUsize::new(0),
                maintenance: Mutex::new(None),
            }),
        };

        // Fail fast when the store is unreachable
        pool.replenish().await?;

        let weak = Arc::downgrade(&pool.inner);
        let handle = tokio::spawn(async move {
            Self::maintenance_task(weak, POOL_MAINTENANCE_INTERVAL).await;
        });
        if let Ok(mut guard) = pool.inner.maintenance.lock() {
            *guard = Some(handle);
        }

        Ok(pool)
    }

    /// Acquire a connection with exclusive ownership.
    ///
    /// Waits up to the configured timeout for a connection to become available,
    /// then fails with `PoolExhausted`. Fails with `PoolClosed` once the pool is closed.
    pub async fn acquire(&self) -> OrmResult<PooledConnection> {
        let inner = &self.inner;
        if inner.is_closed() {
            return Err(OrmError::PoolClosed);
        }

        let started = Instant::now();
        let timeout = inner.config.acquire_timeout();
        let permit = match tokio::time::timeout(timeout, Arc::clone(&inner.semaphore).acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(OrmError::PoolClosed),
            Err(_) => {
                let waited_ms = started.elapsed().as_millis() as u64;
                warn!(
                    waited_ms = waited_ms,
                    pool_max = inner.config.pool_max,
                    "Timed out waiting for a connection"
                );
                return Err(OrmError::pool_exhausted(waited_ms));
            }
        };

        loop {
            let candidate = {
                let mut state = inner.lock_state()?;
                match state.idle.pop_back() {
                    Some(idle) => {
                        state.checked_out.insert(idle.id);
                        Candidate::Idle(IdleCheckout {
                            pool: Arc::clone(inner),
                            idle: Some(idle),
                        })
                    }
                    None => Candidate::Open(OpeningSlot::reserve(inner, &mut state)),
                }
            };

            let slot = match candidate {
                Candidate::Idle(mut checkout) => {
                    if inner.config.test_before_acquire {
                        if let Some(conn) = checkout.connection() {
                            if let Err(e) = conn.ping().await {
                                warn!(connection_id = checkout.id(), error = %e, "Discarding broken idle connection");
                                drop(checkout);
                                continue;
                            }
                        }
                    }
                    let Some((id, conn)) = checkout.into_connection() else {
                        continue;
                    };
                    debug!(
                        connection_id = id,
                        waited_ms = started.elapsed().as_millis() as u64,
                        "Acquired idle connection"
                    );
                    return Ok(PooledConnection::new(id, conn, Arc::clone(inner), permit));
                }
                Candidate::Open(slot) => slot,
            };

            let remaining = timeout.saturating_sub(started.elapsed());
            let opened = tokio::time::timeout(remaining, DbConnection::open(&inner.config)).await;

            let mut state = inner.lock_state()?;
            slot.finish(&mut state);
            let conn = match opened {
                Ok(Ok(conn)) => conn,
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    return Err(OrmError::pool_exhausted(
                        started.elapsed().as_millis() as u64,
                    ));
                }
            };
            let id = inner.next_id();
            state.checked_out.insert(id);
            drop(state);

            debug!(connection_id = id, "Opened new connection");
            return Ok(PooledConnection::new(id, conn, Arc::clone(inner), permit));
        }
    }

    /// Return a connection to the pool.
    ///
    /// Equivalent to [`PooledConnection::release`], but also rejects connections
    /// that belong to a different pool.
    pub fn release(&self, conn: PooledConnection) -> OrmResult<()> {
        if !Arc::ptr_eq(&self.inner, &conn.pool) {
            let id = conn.id;
            error!(connection_id = id, "Connection released to a pool it does not belong to");
            return Err(OrmError::invalid_release(id, "connection belongs to a different pool"));
        }
        conn.release()
    }

    /// Close idle connections past the idle timeout and replenish up to `pool_min`.
    pub async fn maintain(&self) -> OrmResult<MaintenanceReport> {
        let idle_timeout = self.inner.config.idle_timeout();
        let min = self.inner.config.pool_min as usize;

        let expired: Vec<IdleConnection> = {
            let mut state = self.inner.lock_state()?;
            let mut expired = Vec::new();
            while state.total() > min {
                let front_expired = state
                    .idle
                    .front()
                    .is_some_and(|idle| idle.idle_since.elapsed() >= idle_timeout);
                if !front_expired {
                    break;
                }
                if let Some(idle) = state.idle.pop_front() {
                    expired.push(idle);
                }
            }
            expired
        };

        let reaped = expired.len();
        for idle in expired {
            debug!(connection_id = idle.id, "Closing idle connection");
            if let Err(e) = idle.conn.close().await {
                debug!(connection_id = idle.id, error = %e, "Idle connection close failed");
            }
        }

        let opened = self.replenish().await?;
        if reaped > 0 || opened > 0 {
            info!(reaped = reaped, opened = opened, "Pool maintenance");
        }
        Ok(MaintenanceReport { reaped, opened })
    }

    /// Open idle connections until the pool holds `pool_min`.
    ///
    /// Each open holds a permit; stops early when every permit is taken, since
    /// the holders will return their connections to the idle set.
    async fn replenish(&self) -> OrmResult<usize> {
        let inner = &self.inner;
        let mut opened = 0;
        loop {
            let Ok(_permit) = Arc::clone(&inner.semaphore).try_acquire_owned() else {
                return Ok(opened);
            };
            let slot = {
                let mut state = inner.lock_state()?;
                if inner.is_closed() || state.total() >= inner.config.pool_min as usize {
                    return Ok(opened);
                }
                OpeningSlot::reserve(inner, &mut state)
            };

            let result = DbConnection::open(&inner.config).await;
            let mut state = inner.lock_state()?;
            slot.finish(&mut state);
            let conn = result?;
            let id = inner.next_id();
            if inner.is_closed() {
                drop(state);
                close_in_background(id, conn);
                return Ok(opened);
            }
            state.idle.push_back(IdleConnection {
                id,
                conn,
                idle_since: Instant::now(),
            });
            opened += 1;
            debug!(connection_id = id, "Opened idle connection");
        }
    }

    async fn maintenance_task(weak: Weak<PoolInner>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        // First tick completes immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(inner) = weak.upgrade() else {
                break;
            };
            if inner.is_closed() {
                break;
            }
            let pool = ConnectionPool { inner };
            if let Err(e) = pool.maintain().await {
                warn!(error = %e, "Pool maintenance failed");
            }
        }
        debug!("Pool maintenance task stopped");
    }

    /// Close the pool.
    ///
    /// Pending and future `acquire` calls fail with `PoolClosed`, idle connections
    /// are closed, and checked-out connections are awaited for up to `grace`;
    /// any of them returned later is closed on return. Closing twice is a no-op
    /// that returns an empty report.
    pub async fn close(&self, grace: Duration) -> PoolCloseReport {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::AcqRel) {
            debug!("Connection pool already closed");
            return PoolCloseReport::default();
        }
        info!(url = %inner.config.masked_url(), "Closing connection pool");

        inner.semaphore.close();
        if let Ok(mut guard) = inner.maintenance.lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }

        let idle: Vec<IdleConnection> = match inner.state.lock() {
            Ok(mut state) => state.idle.drain(..).collect(),
            Err(poisoned) => poisoned.into_inner().idle.drain(..).collect(),
        };
        let idle_closed = idle.len();
        for conn in idle {
            // Already-broken connections fail to close cleanly; that is fine
            if let Err(e) = conn.conn.close().await {
                debug!(connection_id = conn.id, error = %e, "Idle connection close failed");
            }
        }

        let deadline = Instant::now() + grace;
        let outstanding = loop {
            let notified = inner.returned.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let outstanding = self.status().checked_out;
            if outstanding == 0 {
                break 0;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() || tokio::time::timeout(remaining, notified).await.is_err() {
                break self.status().checked_out;
            }
        };

        let report = PoolCloseReport {
            idle_closed,
            returned: inner.returned_after_close.load(Ordering::Acquire),
            outstanding,
        };
        if outstanding > 0 {
            warn!(
                outstanding = outstanding,
                "Grace period elapsed with connections still checked out"
            );
        }
        info!(
            idle_closed = report.idle_closed,
            returned = report.returned,
            "Connection pool closed"
        );
        report
    }

    pub fn status(&self) -> PoolStatus {
        let (size, idle, checked_out) = match self.inner.state.lock() {
            Ok(state) => (state.total(), state.idle.len(), state.checked_out.len()),
            Err(poisoned) => {
                let state = poisoned.into_inner();
                (state.total(), state.idle.len(), state.checked_out.len())
            }
        };
        PoolStatus {
            size,
            idle,
            checked_out,
            min: self.inner.config.pool_min,
            max: self.inner.config.pool_max,
            closed: self.inner.is_closed(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    pub fn db_type(&self) -> DatabaseType {
        self.inner.db_type
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }
}

/// A connection checked out of a [`ConnectionPool`].
///
/// Returned to the pool by [`release`](Self::release) or, failing that, when
/// dropped. A connection marked broken is discarded instead of returned.
pub struct PooledConnection {
    id: u64,
    conn: Option<DbConnection>,
    pool: Arc<PoolInner>,
    permit: Option<OwnedSemaphorePermit>,
    broken: bool,
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("db_type", &self.pool.db_type)
            .field("broken", &self.broken)
            .finish_non_exhaustive()
    }
}

impl PooledConnection {
    fn new(id: u64, conn: DbConnection, pool: Arc<PoolInner>, permit: OwnedSemaphorePermit) -> Self {
        Self {
            id,
            conn: Some(conn),
            pool,
            permit: Some(permit),
            broken: false,
        }
    }

    /// Pool-assigned connection id.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn db_type(&self) -> DatabaseType {
        self.pool.db_type
    }

    /// Whether statements on this connection should be logged at INFO.
    pub fn show_sql(&self) -> bool {
        self.pool.config.show_sql
    }

    /// Mark the connection as unusable; it is discarded on release.
    pub fn mark_broken(&mut self) {
        if !self.broken {
            debug!(connection_id = self.id, "Connection marked broken");
        }
        self.broken = true;
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }

    /// Access the underlying connection.
    pub fn connection(&mut self) -> OrmResult<&mut DbConnection> {
        self.conn
            .as_mut()
            .ok_or_else(|| OrmError::invalid_release(self.id, "connection already released"))
    }

    /// Return the connection to the pool.
    pub fn release(mut self) -> OrmResult<()> {
        self.release_inner()
    }

    fn release_inner(&mut self) -> OrmResult<()> {
        let conn = self
            .conn
            .take()
            .ok_or_else(|| OrmError::invalid_release(self.id, "connection already released"))?;
        let result = self.pool.check_in(self.id, conn, self.broken);
        // Free the permit only after the connection is back in the idle set
        self.permit.take();
        result
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if self.conn.is_none() {
            return;
        }
        if let Err(e) = self.release_inner() {
            error!(connection_id = self.id, error = %e, "Failed to return connection on drop");
        }
    }
}

//! Session pooling for the MonetDB MAPI driver.
//!
//! A [`Pool`] owns a bounded set of connections produced by a
//! [`ManageConnection`] implementation. Connections are either idle (queued
//! for reuse) or busy (checked out as a [`PooledConnection`]). All
//! bookkeeping, including creating connections to top the pool up, happens
//! under one mutex so a connection is never observable in both sets or in
//! neither.
//!
//! Checkout is exactly-once: a [`PooledConnection`] returns itself to the
//! pool when dropped, or can be handed back explicitly with
//! [`Pool::release`] or taken out for good with [`Pool::remove`]. A returned
//! connection that [`ManageConnection::has_broken`] rejects is closed instead
//! of queued.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use monetdb_core::error::{ConnectionError, ConnectionErrorKind, PoolError, PoolErrorKind};
use monetdb_core::{Error, Result};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Creates and closes the connections a [`Pool`] hands out.
pub trait ManageConnection: Send + Sync + 'static {
    type Connection: Send + 'static;

    /// Open and authenticate a new connection.
    fn connect(&self) -> Result<Self::Connection>;

    /// Close a connection the pool is discarding.
    fn close(&self, conn: Self::Connection) {
        drop(conn);
    }

    /// Whether a returned connection must be discarded instead of reused.
    fn has_broken(&self, _conn: &mut Self::Connection) -> bool {
        false
    }
}

/// Pool bounds and eviction age.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Connections kept open even when idle
    pub min_connections: usize,
    /// Upper bound on idle + busy connections
    pub max_connections: usize,
    /// Idle connections older than this are closed by [`Pool::sweep`]
    pub max_idle_age: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_connections: 1,
            max_connections: 10,
            max_idle_age: Duration::from_secs(300),
        }
    }
}

impl PoolConfig {
    /// Create a new pool configuration with the given bounds.
    pub fn new(min_connections: usize, max_connections: usize) -> Self {
        Self {
            min_connections,
            max_connections,
            ..Default::default()
        }
    }

    pub fn min_connections(mut self, n: usize) -> Self {
        self.min_connections = n;
        self
    }

    pub fn max_connections(mut self, n: usize) -> Self {
        self.max_connections = n;
        self
    }

    /// Set the age past which idle connections are evicted.
    pub fn max_idle_age(mut self, age: Duration) -> Self {
        self.max_idle_age = age;
        self
    }

    /// Check `1 <= min <= max`.
    pub fn validate(&self) -> Result<()> {
        let problem = if self.min_connections < 1 {
            Some("min_connections must be at least 1")
        } else if self.max_connections < 1 {
            Some("max_connections must be at least 1")
        } else if self.min_connections > self.max_connections {
            Some("min_connections must not exceed max_connections")
        } else {
            None
        };
        match problem {
            Some(message) => Err(Error::Pool(PoolError {
                kind: PoolErrorKind::Config,
                message: format!(
                    "{} (min={}, max={})",
                    message, self.min_connections, self.max_connections
                ),
                source: None,
            })),
            None => Ok(()),
        }
    }
}

/// Pool statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Idle + busy
    pub total_connections: usize,
    pub idle_connections: usize,
    pub busy_connections: usize,
}

struct Slot<C> {
    id: u64,
    created: Instant,
    conn: C,
}

struct PoolState<C> {
    idle: VecDeque<Slot<C>>,
    busy: HashSet<u64>,
}

impl<C> PoolState<C> {
    fn total(&self) -> usize {
        self.idle.len() + self.busy.len()
    }
}

struct Shared<M: ManageConnection> {
    manager: M,
    config: PoolConfig,
    state: Mutex<PoolState<M::Connection>>,
}

impl<M: ManageConnection> Shared<M> {
    fn lock(&self) -> MutexGuard<'_, PoolState<M::Connection>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Return a busy connection to the idle queue.
    ///
    /// A broken connection leaves the pool and is closed; the next acquire
    /// opens a replacement.
    fn check_in(&self, id: u64, created: Instant, mut conn: M::Connection) -> Result<()> {
        let broken = self.manager.has_broken(&mut conn);
        let mut state = self.lock();
        if !state.busy.remove(&id) {
            drop(state);
            self.manager.close(conn);
            return Err(invalid_state(format!("connection {id} is not checked out")));
        }
        if broken {
            let total = state.total();
            drop(state);
            self.manager.close(conn);
            tracing::debug!(id, total, "discarded broken connection");
            return Ok(());
        }
        state.idle.push_back(Slot { id, created, conn });
        tracing::trace!(id, idle = state.idle.len(), "connection released");
        Ok(())
    }

    /// Forget a busy connection without queuing it.
    fn check_out_for_good(&self, id: u64) -> Result<()> {
        let mut state = self.lock();
        if state.busy.remove(&id) {
            tracing::debug!(id, total = state.total(), "connection removed from pool");
            Ok(())
        } else {
            Err(invalid_state(format!("connection {id} is not checked out")))
        }
    }
}

/// A bounded connection pool.
///
/// Cloning a `Pool` yields another handle to the same pool.
pub struct Pool<M: ManageConnection> {
    shared: Arc<Shared<M>>,
}

impl<M: ManageConnection> Clone for Pool<M> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<M: ManageConnection> std::fmt::Debug for Pool<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("config", &self.shared.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl<M: ManageConnection> Pool<M> {
    /// Create a pool and open `min_connections` connections up front.
    pub fn new(manager: M, config: PoolConfig) -> Result<Self> {
        config.validate()?;
        let pool = Self {
            shared: Arc::new(Shared {
                manager,
                config,
                state: Mutex::new(PoolState {
                    idle: VecDeque::new(),
                    busy: HashSet::new(),
                }),
            }),
        };
        {
            let mut state = pool.shared.lock();
            pool.top_up(&mut state)?;
        }
        Ok(pool)
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    pub fn manager(&self) -> &M {
        &self.shared.manager
    }

    /// Check out an idle connection, creating new ones as the bounds allow.
    ///
    /// Fails with a retryable `PoolErrorKind::Exhausted` error when every
    /// connection is busy and the pool is at `max_connections`.
    pub fn acquire(&self) -> Result<PooledConnection<M>> {
        let mut state = self.shared.lock();
        self.top_up(&mut state)?;

        let Some(slot) = state.idle.pop_front() else {
            return Err(Error::Pool(PoolError {
                kind: PoolErrorKind::Exhausted,
                message: format!(
                    "no session available ({} busy, max {})",
                    state.busy.len(),
                    self.shared.config.max_connections
                ),
                source: None,
            }));
        };
        state.busy.insert(slot.id);
        tracing::trace!(
            id = slot.id,
            idle = state.idle.len(),
            busy = state.busy.len(),
            "connection acquired"
        );
        drop(state);

        Ok(PooledConnection {
            id: slot.id,
            created: slot.created,
            conn: Some(slot.conn),
            pool: Arc::downgrade(&self.shared),
        })
    }

    /// Return a checked-out connection to the idle queue.
    ///
    /// Fails with `PoolErrorKind::InvalidState` when the connection belongs
    /// to a different pool; it then goes back to the pool it came from.
    pub fn release(&self, mut conn: PooledConnection<M>) -> Result<()> {
        if !self.owns(&conn) {
            return Err(invalid_state(format!(
                "connection {} does not belong to this pool",
                conn.id
            )));
        }
        let Some(inner) = conn.conn.take() else {
            return Err(invalid_state("connection was already returned"));
        };
        self.shared.check_in(conn.id, conn.created, inner)
    }

    /// Take a checked-out connection out of the pool for good.
    ///
    /// The caller becomes responsible for closing the returned connection.
    pub fn remove(&self, mut conn: PooledConnection<M>) -> Result<M::Connection> {
        if !self.owns(&conn) {
            return Err(invalid_state(format!(
                "connection {} does not belong to this pool",
                conn.id
            )));
        }
        self.shared.check_out_for_good(conn.id)?;
        conn.conn
            .take()
            .ok_or_else(|| invalid_state("connection was already returned"))
    }

    /// Close idle connections older than `max_idle_age`, keeping at least
    /// `min_connections` in total. Returns how many were closed.
    pub fn sweep(&self) -> usize {
        let min = self.shared.config.min_connections;
        let max_age = self.shared.config.max_idle_age;

        let expired = {
            let mut state = self.shared.lock();
            let mut total = state.total();
            let mut kept = VecDeque::with_capacity(state.idle.len());
            let mut expired = Vec::new();
            for slot in state.idle.drain(..) {
                if total > min && slot.created.elapsed() > max_age {
                    total -= 1;
                    expired.push(slot);
                } else {
                    kept.push_back(slot);
                }
            }
            state.idle = kept;
            expired
        };

        let closed = expired.len();
        for slot in expired {
            tracing::debug!(id = slot.id, age = ?slot.created.elapsed(), "evicting aged connection");
            self.shared.manager.close(slot.conn);
        }
        closed
    }

    /// Close every idle connection. Busy connections are left to their holders.
    pub fn dispose(&self) {
        let idle: Vec<_> = self.shared.lock().idle.drain(..).collect();
        tracing::debug!(closed = idle.len(), "disposing idle connections");
        for slot in idle {
            self.shared.manager.close(slot.conn);
        }
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.shared.lock();
        PoolStats {
            total_connections: state.total(),
            idle_connections: state.idle.len(),
            busy_connections: state.busy.len(),
        }
    }

    pub fn idle_count(&self) -> usize {
        self.shared.lock().idle.len()
    }

    pub fn busy_count(&self) -> usize {
        self.shared.lock().busy.len()
    }

    /// Whether both handles refer to the same pool.
    pub fn same_pool(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    fn owns(&self, conn: &PooledConnection<M>) -> bool {
        std::ptr::eq(conn.pool.as_ptr(), Arc::as_ptr(&self.shared))
    }

    /// Create connections until `min` is reached, or until there is an idle
    /// one without exceeding `max`. Runs under the pool lock.
    fn top_up(&self, state: &mut PoolState<M::Connection>) -> Result<()> {
        let PoolConfig {
            min_connections: min,
            max_connections: max,
            ..
        } = self.shared.config;

        while state.total() < min || (state.idle.is_empty() && state.total() < max) {
            let conn = self.shared.manager.connect().map_err(connect_failure)?;
            let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
            state.idle.push_back(Slot {
                id,
                created: Instant::now(),
                conn,
            });
            tracing::debug!(id, total = state.total(), min, max, "opened pooled connection");
        }
        Ok(())
    }
}

/// A connection checked out of a [`Pool`].
///
/// Dropping it returns the connection to its pool.
pub struct PooledConnection<M: ManageConnection> {
    id: u64,
    created: Instant,
    conn: Option<M::Connection>,
    pool: Weak<Shared<M>>,
}

impl<M: ManageConnection> PooledConnection<M> {
    /// Pool-assigned identifier, unique for the life of the process.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Time since the underlying connection was opened.
    pub fn age(&self) -> Duration {
        self.created.elapsed()
    }

    /// Return the connection to the pool it came from.
    pub fn release(mut self) -> Result<()> {
        let Some(conn) = self.conn.take() else {
            return Err(invalid_state("connection was already returned"));
        };
        match self.pool.upgrade() {
            Some(shared) => shared.check_in(self.id, self.created, conn),
            None => Err(invalid_state("pool no longer exists")),
        }
    }

    /// Take the connection out of its pool for good.
    pub fn detach(mut self) -> Result<M::Connection> {
        let conn = self
            .conn
            .take()
            .ok_or_else(|| invalid_state("connection was already returned"))?;
        if let Some(shared) = self.pool.upgrade() {
            shared.check_out_for_good(self.id)?;
        }
        Ok(conn)
    }
}

impl<M: ManageConnection> std::ops::Deref for PooledConnection<M> {
    type Target = M::Connection;

    fn deref(&self) -> &Self::Target {
        // `conn` is only taken by methods that consume `self`.
        match self.conn.as_ref() {
            Some(conn) => conn,
            None => unreachable!("pooled connection used after release"),
        }
    }
}

impl<M: ManageConnection> std::ops::DerefMut for PooledConnection<M> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match self.conn.as_mut() {
            Some(conn) => conn,
            None => unreachable!("pooled connection used after release"),
        }
    }
}

impl<M: ManageConnection> Drop for PooledConnection<M> {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        if let Some(shared) = self.pool.upgrade() {
            if let Err(e) = shared.check_in(self.id, self.created, conn) {
                tracing::warn!(id = self.id, error = %e, "failed to return connection on drop");
            }
        }
    }
}

impl<M: ManageConnection> std::fmt::Debug for PooledConnection<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("age", &self.created.elapsed())
            .finish_non_exhaustive()
    }
}

fn invalid_state(message: impl Into<String>) -> Error {
    Error::Pool(PoolError {
        kind: PoolErrorKind::InvalidState,
        message: message.into(),
        source: None,
    })
}

fn connect_failure(err: Error) -> Error {
    match err {
        Error::Connection(_) => err,
        Error::Server(ref server) => {
            let message = format!("authentication failed: {}", server.message);
            Error::Connection(ConnectionError {
                kind: ConnectionErrorKind::Authentication,
                message,
                source: Some(Box::new(err)),
            })
        }
        other => Error::Connection(ConnectionError {
            kind: ConnectionErrorKind::Connect,
            message: format!("failed to open connection: {}", other),
            source: Some(Box::new(other)),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::thread;

    #[derive(Default)]
    struct Counters {
        opened: AtomicUsize,
        closed: AtomicUsize,
        fail: AtomicBool,
        broken: AtomicBool,
    }

    struct FakeManager {
        counters: Arc<Counters>,
    }

    impl FakeManager {
        fn new() -> (Self, Arc<Counters>) {
            let counters = Arc::new(Counters::default());
            (
                Self {
                    counters: Arc::clone(&counters),
                },
                counters,
            )
        }
    }

    impl ManageConnection for FakeManager {
        type Connection = usize;

        fn connect(&self) -> Result<usize> {
            if self.counters.fail.load(Ordering::SeqCst) {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "refused",
                )));
            }
            Ok(self.counters.opened.fetch_add(1, Ordering::SeqCst))
        }

        fn close(&self, _conn: usize) {
            self.counters.closed.fetch_add(1, Ordering::SeqCst);
        }

        fn has_broken(&self, _conn: &mut usize) -> bool {
            self.counters.broken.load(Ordering::SeqCst)
        }
    }

    fn pool(min: usize, max: usize) -> (Pool<FakeManager>, Arc<Counters>) {
        let (manager, counters) = FakeManager::new();
        let pool = Pool::new(manager, PoolConfig::new(min, max)).unwrap();
        (pool, counters)
    }

    #[test]
    fn test_min_two_max_two_lifecycle() {
        let (pool, _) = pool(2, 2);
        assert_eq!(pool.idle_count(), 2);

        let conn = pool.acquire().unwrap();
        assert_eq!(pool.idle_count(), 1);
        assert_eq!(pool.busy_count(), 1);

        pool.release(conn).unwrap();
        assert_eq!(pool.idle_count(), 2);
        assert_eq!(pool.busy_count(), 0);

        pool.dispose();
        assert_eq!(pool.idle_count(), 0);
    }

    #[test]
    fn test_release_to_foreign_pool_is_invalid_state() {
        let (first, _) = pool(1, 1);
        let (second, _) = pool(1, 1);

        let conn = first.acquire().unwrap();
        match second.release(conn) {
            Err(Error::Pool(e)) => assert_eq!(e.kind, PoolErrorKind::InvalidState),
            other => panic!("expected InvalidState, got {other:?}"),
        }
        // The rejected handle went home when it was dropped.
        assert_eq!(first.idle_count(), 1);
        assert_eq!(first.busy_count(), 0);
        assert_eq!(second.idle_count(), 1);
    }

    #[test]
    fn test_exhaustion_is_retryable() {
        let (pool, _) = pool(1, 2);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert_ne!(a.id(), b.id());

        let err = pool.acquire().unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(pool.stats().total_connections, 2);

        drop(a);
        let c = pool.acquire().unwrap();
        assert_eq!(pool.busy_count(), 2);
        drop((b, c));
    }

    #[test]
    fn test_clones_share_one_pool() {
        let (first, _) = pool(1, 1);
        let (second, _) = pool(1, 1);
        assert!(first.same_pool(&first.clone()));
        assert!(!first.same_pool(&second));
    }

    #[test]
    fn test_drop_returns_connection() {
        let (pool, _) = pool(1, 1);
        {
            let mut conn = pool.acquire().unwrap();
            *conn += 100;
            assert_eq!(pool.idle_count(), 0);
        }
        assert_eq!(pool.idle_count(), 1);
        assert_eq!(*pool.acquire().unwrap(), 100);
    }

    #[test]
    fn test_remove_keeps_connection_out() {
        let (pool, counters) = pool(1, 1);
        let conn = pool.acquire().unwrap();
        let raw = pool.remove(conn).unwrap();
        assert_eq!(raw, 0);
        assert_eq!(pool.stats().total_connections, 0);

        // Next acquire opens a replacement.
        let replacement = pool.acquire().unwrap();
        assert_eq!(*replacement, 1);
        assert_eq!(counters.opened.load(Ordering::SeqCst), 2);

        let detached = replacement.detach().unwrap();
        assert_eq!(detached, 1);
        assert_eq!(pool.busy_count(), 0);
    }

    #[test]
    fn test_connect_failure_surfaces_as_connection_error() {
        let (pool, counters) = pool(1, 2);
        let held = pool.acquire().unwrap();

        counters.fail.store(true, Ordering::SeqCst);
        match pool.acquire() {
            Err(Error::Connection(e)) => assert_eq!(e.kind, ConnectionErrorKind::Connect),
            other => panic!("expected connection error, got {other:?}"),
        }
        assert_eq!(pool.stats(), PoolStats {
            total_connections: 1,
            idle_connections: 0,
            busy_connections: 1,
        });

        counters.fail.store(false, Ordering::SeqCst);
        drop(held);
        assert!(pool.acquire().is_ok());
    }

    #[test]
    fn test_broken_connection_is_discarded_on_return() {
        let (pool, counters) = pool(1, 1);
        let first_id = {
            let conn = pool.acquire().unwrap();
            counters.broken.store(true, Ordering::SeqCst);
            conn.id()
        };
        assert_eq!(pool.stats(), PoolStats::default());
        assert_eq!(counters.closed.load(Ordering::SeqCst), 1);

        counters.broken.store(false, Ordering::SeqCst);
        let conn = pool.acquire().unwrap();
        assert_ne!(conn.id(), first_id);
        assert_eq!(*conn, 1);

        counters.broken.store(true, Ordering::SeqCst);
        pool.release(conn).unwrap();
        assert_eq!(pool.stats().total_connections, 0);
        assert_eq!(counters.closed.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_invalid_bounds_are_rejected() {
        for (min, max) in [(0, 1), (1, 0), (3, 2)] {
            let (manager, _) = FakeManager::new();
            let err = Pool::new(manager, PoolConfig::new(min, max)).unwrap_err();
            assert!(matches!(err, Error::Pool(ref e) if e.kind == PoolErrorKind::Config));
        }
    }

    #[test]
    fn test_sweep_keeps_min_connections() {
        let (manager, counters) = FakeManager::new();
        let config = PoolConfig::new(1, 3).max_idle_age(Duration::ZERO);
        let pool = Pool::new(manager, config).unwrap();

        let held: Vec<_> = (0..3).map(|_| pool.acquire().unwrap()).collect();
        drop(held);
        assert_eq!(pool.idle_count(), 3);

        thread::sleep(Duration::from_millis(5));
        assert_eq!(pool.sweep(), 2);
        assert_eq!(pool.idle_count(), 1);
        assert_eq!(counters.closed.load(Ordering::SeqCst), 2);
        assert_eq!(pool.sweep(), 0);
    }

    #[test]
    fn test_sweep_ignores_young_connections() {
        let (pool, _) = pool(1, 3);
        let held: Vec<_> = (0..3).map(|_| pool.acquire().unwrap()).collect();
        drop(held);
        assert_eq!(pool.sweep(), 0);
        assert_eq!(pool.idle_count(), 3);
    }

    #[test]
    fn test_concurrent_checkout_never_double_issues() {
        const THREADS: usize = 8;
        const ROUNDS: usize = 25;

        let (pool, _) = pool(1, 3);
        let in_use = Arc::new(Mutex::new(HashSet::new()));

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let pool = pool.clone();
                let in_use = Arc::clone(&in_use);
                thread::spawn(move || {
                    for _ in 0..ROUNDS {
                        let conn = loop {
                            match pool.acquire() {
                                Ok(conn) => break conn,
                                Err(e) if e.is_retryable() => thread::yield_now(),
                                Err(e) => panic!("unexpected error: {e}"),
                            }
                        };
                        assert!(in_use.lock().unwrap().insert(conn.id()));
                        thread::sleep(Duration::from_micros(50));
                        assert!(in_use.lock().unwrap().remove(&conn.id()));
                        pool.release(conn).unwrap();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let stats = pool.stats();
        assert!(stats.total_connections <= 3);
        assert_eq!(stats.busy_connections, 0);
    }
}

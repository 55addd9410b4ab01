//! Process-wide registry of session pools.
//!
//! Pools are keyed by `(host, port, user, database)` and created on first
//! use. The first pool created starts a background thread that sweeps idle
//! sessions out of every registered pool at the configured interval.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, Once, OnceLock, PoisonError};
use std::thread;

use monetdb_core::error::{PoolError, PoolErrorKind, UnsupportedError, UnsupportedKind};
use monetdb_core::{Error, Result};
use monetdb_pool::{Pool, PoolConfig, PoolStats, PooledConnection};

use crate::config::{MapiConfig, PoolKey};
use crate::connection::{MapiConnector, MapiSession};
use crate::settings::{self, CancelStrategy};

/// A session checked out of the registry.
///
/// Dropping it returns the session to its pool.
pub type PooledSession = PooledConnection<MapiConnector>;

type Registry = HashMap<PoolKey, Pool<MapiConnector>>;

fn registry() -> MutexGuard<'static, Registry> {
    static POOLS: OnceLock<Mutex<Registry>> = OnceLock::new();
    POOLS
        .get_or_init(|| Mutex::new(HashMap::new()))
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
}

/// Check out a session for `config`, creating its pool if needed.
///
/// `min` and `max` size the pool when this call creates it; an existing
/// pool keeps its original bounds. Sessions opened through the registry use
/// the process-wide receive timeout.
///
/// The password is not part of the pool key. Once a pool exists for
/// `(host, port, user, database)`, callers get its already authenticated
/// sessions whatever password they pass; only the call that creates the
/// pool has its credentials checked by the server.
pub fn get_connection(config: &MapiConfig, min: usize, max: usize) -> Result<PooledSession> {
    if min < 1 || min > max {
        return Err(Error::Pool(PoolError {
            kind: PoolErrorKind::Config,
            message: format!("pool bounds must satisfy 1 <= min <= max, got min={min} max={max}"),
            source: None,
        }));
    }

    let key = config.pool_key();
    let existing = registry().get(&key).cloned();
    let pool = match existing {
        Some(pool) => pool,
        None => {
            // `Pool::new` opens `min` sessions; the registry lock is not held here.
            let settings = settings::current();
            let connector =
                MapiConnector::new(config.clone().receive_timeout(settings.receive_timeout));
            let pool_config = PoolConfig::new(min, max).max_idle_age(settings.idle_max_age);
            let created = Pool::new(connector, pool_config)?;

            let registered = registry()
                .entry(key.clone())
                .or_insert_with(|| created.clone())
                .clone();
            if registered.same_pool(&created) {
                tracing::debug!(pool = %key, min, max, "created session pool");
                start_sweeper();
            } else {
                tracing::debug!(pool = %key, "pool registered concurrently; discarding ours");
                created.dispose();
            }
            registered
        }
    };
    pool.acquire()
}

/// Check out a session using the pool bounds from the process-wide settings.
pub fn get_default_connection(config: &MapiConfig) -> Result<PooledSession> {
    let settings = settings::current();
    get_connection(config, settings.pool_min, settings.pool_max)
}

fn pool_for(conn: &PooledSession) -> Result<Pool<MapiConnector>> {
    let key = conn.config().pool_key();
    registry().get(&key).cloned().ok_or_else(|| {
        Error::Pool(PoolError {
            kind: PoolErrorKind::InvalidState,
            message: format!("no registered pool for {key}"),
            source: None,
        })
    })
}

/// Return a session to its registered pool.
pub fn release(conn: PooledSession) -> Result<()> {
    pool_for(&conn)?.release(conn)
}

/// Take a session out of its pool; the caller must close it.
pub fn remove(conn: PooledSession) -> Result<MapiSession> {
    pool_for(&conn)?.remove(conn)
}

/// Cancel whatever `conn` is doing, as the cancel strategy dictates.
///
/// With [`CancelStrategy::TerminateSession`] the session is removed from
/// its pool and its socket closed. With [`CancelStrategy::None`] this fails
/// with `UnsupportedKind::NotSupported` and the session goes back to its
/// pool.
pub fn cancel(conn: PooledSession) -> Result<()> {
    match settings::current().cancel_strategy {
        CancelStrategy::None => Err(Error::Unsupported(UnsupportedError {
            kind: UnsupportedKind::NotSupported,
            message: "query cancellation is not supported".to_string(),
        })),
        CancelStrategy::TerminateSession => {
            let id = conn.id();
            let mut session = remove(conn)?;
            session.close();
            tracing::debug!(id, "terminated session on cancel");
            Ok(())
        }
    }
}

/// Statistics of the pool serving `config`, if one exists.
pub fn pool_stats(config: &MapiConfig) -> Option<PoolStats> {
    registry().get(&config.pool_key()).map(Pool::stats)
}

/// Close the idle sessions of the pool serving `config`.
pub fn dispose(config: &MapiConfig) {
    let pool = registry().get(&config.pool_key()).cloned();
    if let Some(pool) = pool {
        pool.dispose();
    }
}

/// Sweep every registered pool once; returns the number of sessions closed.
pub fn sweep_all() -> usize {
    let pools: Vec<(PoolKey, Pool<MapiConnector>)> = registry()
        .iter()
        .map(|(key, pool)| (key.clone(), pool.clone()))
        .collect();

    let mut closed = 0;
    for (key, pool) in pools {
        let n = pool.sweep();
        if n > 0 {
            tracing::info!(pool = %key, closed = n, "evicted idle sessions");
        }
        closed += n;
    }
    closed
}

fn start_sweeper() {
    static SWEEPER: Once = Once::new();
    SWEEPER.call_once(|| {
        let spawned = thread::Builder::new()
            .name("monetdb-pool-sweeper".to_string())
            .spawn(|| {
                loop {
                    thread::sleep(settings::current().sweep_interval);
                    sweep_all();
                }
            });
        if let Err(e) = spawned {
            tracing::warn!(error = %e, "failed to start pool sweeper");
        }
    });
}

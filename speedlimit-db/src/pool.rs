//! Shared connection pool
//!
//! One `PgPool` per process, built on first use with the sizes from
//! [`PoolSettings`] and never torn down. Construction does not touch the
//! network: the pool opens connections on demand and keeps `min_size` of
//! them warm in the background.
//!
//! The shared pool runs on its own small tokio runtime, which lives as long
//! as the process. Connections are opened and returned there, so the pool
//! keeps working after the runtime of whichever caller created it is gone.

use std::sync::{Mutex, OnceLock, PoisonError};

use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::PgPool;
use tokio::runtime::{self, Runtime};
use tracing::info;

use crate::config::{ConnectionParams, PoolSettings};
use crate::error::{DbError, DbResult};
use crate::session::PgSession;

const POOL_WORKER_THREADS: usize = 2;

static SHARED_POOL: PoolCell<SharedPool> = PoolCell::new();

/// Whether this build carries connection pooling (cargo feature `pool`)
pub const fn pooling_available() -> bool {
    cfg!(feature = "pool")
}

/// A slot that is filled at most once, under double-checked locking.
///
/// Readers of a filled slot never take the lock. The lock is held only while
/// `init` runs, and a failed `init` leaves the slot empty for the next caller.
pub struct PoolCell<P> {
    slot: OnceLock<P>,
    init_lock: Mutex<()>,
}

impl<P> PoolCell<P> {
    pub const fn new() -> Self {
        Self {
            slot: OnceLock::new(),
            init_lock: Mutex::new(()),
        }
    }

    pub fn get(&self) -> Option<&P> {
        self.slot.get()
    }

    pub fn get_or_try_init<E>(&self, init: impl FnOnce() -> Result<P, E>) -> Result<&P, E> {
        if let Some(pool) = self.slot.get() {
            return Ok(pool);
        }

        // A panic in an earlier `init` poisons the lock but leaves nothing
        // half-built behind it.
        let _guard = self
            .init_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(pool) = self.slot.get() {
            return Ok(pool);
        }

        let pool = init()?;
        Ok(self.slot.get_or_init(|| pool))
    }
}

impl<P> Default for PoolCell<P> {
    fn default() -> Self {
        Self::new()
    }
}

/// The process-wide pool together with the runtime that drives it
pub struct SharedPool {
    runtime: Runtime,
    pool: PgPool,
}

impl SharedPool {
    fn from_env() -> DbResult<Self> {
        let params = ConnectionParams::from_env();
        let settings = PoolSettings::from_env();
        // Validate before starting threads: a runtime must not be dropped
        // from inside async code, and a failed init would drop it.
        let options = params.connect_options()?;

        let runtime = runtime::Builder::new_multi_thread()
            .worker_threads(POOL_WORKER_THREADS)
            .thread_name("speedlimit-db-pool")
            .enable_all()
            .build()
            .map_err(|source| DbError::Runtime { source })?;

        let pool = {
            let _context = runtime.enter();
            lazy_pool(&params, options, settings)
        };
        Ok(Self { runtime, pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Handle to the runtime that owns the pool's connections
    pub fn runtime(&self) -> &runtime::Handle {
        self.runtime.handle()
    }

    /// Borrow a connection. The wait and any new connection happen on the
    /// pool's runtime, whatever runtime the caller is on.
    ///
    /// # Errors
    ///
    /// The driver error when no connection can be had before the pool's
    /// acquire timeout.
    pub async fn acquire(&self) -> DbResult<PgSession> {
        let pool = self.pool.clone();
        let conn = self
            .runtime
            .spawn(async move { pool.acquire().await })
            .await
            .map_err(|_| sqlx::Error::WorkerCrashed)??;
        Ok(PgSession::pooled(conn, self.runtime().clone()))
    }
}

fn lazy_pool(
    params: &ConnectionParams,
    options: PgConnectOptions,
    settings: PoolSettings,
) -> PgPool {
    info!(
        target = %params.describe(),
        min_size = settings.min_size,
        max_size = settings.max_size,
        "creating connection pool"
    );
    PgPoolOptions::new()
        .min_connections(settings.min_size)
        .max_connections(settings.max_size)
        .connect_lazy_with(options)
}

/// Build a standalone pool. Must be called from within a tokio runtime,
/// and the pool is only usable while that runtime is alive.
///
/// # Errors
///
/// Returns [`DbError::InvalidUrl`] if the connection URL does not parse.
pub fn build_pool(params: &ConnectionParams, settings: PoolSettings) -> DbResult<PgPool> {
    let options = params.connect_options()?;
    Ok(lazy_pool(params, options, settings))
}

/// The process-wide pool and its runtime, created on first call from the
/// environment. Safe to call from any thread, with or without a runtime.
///
/// # Errors
///
/// [`DbError::PoolingUnavailable`] when the `pool` feature is off,
/// [`DbError::InvalidUrl`] when the configured URL is malformed, or
/// [`DbError::Runtime`] when the pool's threads cannot be started.
pub fn shared_pool() -> DbResult<&'static SharedPool> {
    if !pooling_available() {
        return Err(DbError::PoolingUnavailable);
    }
    SHARED_POOL.get_or_try_init(SharedPool::from_env)
}

/// The process-wide pool; see [`shared_pool`].
///
/// Queries run straight against this pool may open connections on the
/// caller's runtime. [`crate::connection_scope`] and [`SharedPool::acquire`]
/// never do.
///
/// # Example
///
/// ```ignore
/// let pool = speedlimit_db::get_pool()?;
/// let n: i64 = sqlx::query_scalar("SELECT count(*) FROM segments")
///     .fetch_one(pool)
///     .await?;
/// ```
pub fn get_pool() -> DbResult<&'static PgPool> {
    shared_pool().map(SharedPool::pool)
}

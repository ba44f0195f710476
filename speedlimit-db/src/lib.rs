//! speedlimit-db: shared PostgreSQL connections for the Speed Limit tools
//!
//! - Connection parameters come from the environment (`PGHOST` and friends,
//!   or a full URL in `SPEEDLIMIT_DATABASE_URL`)
//! - One bounded pool per process, created lazily on first use and driven by
//!   its own runtime, so it serves callers on any thread or runtime
//! - Scoped connections that commit on success and roll back on failure
//! - A scalar query shortcut
//!
//! Set `SPEEDLIMIT_DISABLE_POOLING=1` to give every scope its own connection.

pub mod config;
pub mod error;
pub mod pool;
pub mod row;
pub mod scope;
pub mod session;

#[cfg(test)]
mod testing;

pub use config::{load_dotenv, ConnectionFields, ConnectionParams, PoolSettings};
pub use error::{DbError, DbResult};
pub use pool::{
    build_pool, get_pool, pooling_available, shared_pool, PoolCell, SharedPool,
};
pub use row::{Row, RowMode};
pub use scope::{
    connect, connection_scope, fetch_value, fetch_value_as, fetch_value_with, scope_with, Backend,
    PgBackend,
};
pub use session::{PgSession, Session};

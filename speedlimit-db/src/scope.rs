//! Scoped connections with automatic commit/rollback
//!
//! A scope borrows one connection, runs caller code against it, and then
//! settles the transaction: commit on `Ok`, rollback on `Err` or panic. The
//! connection is released exactly once on every path. Autocommit sessions
//! are never committed or rolled back by the scope. A scope that is dropped
//! before it settles discards its connection instead of returning it.
//!
//! The callback has the same shape as sqlx's `Connection::transaction`:
//!
//! ```ignore
//! use speedlimit_db::{connection_scope, DbError, Session};
//!
//! let updated = connection_scope(false, |conn| {
//!     Box::pin(async move {
//!         conn.execute("UPDATE segments SET limit_kph = $1 WHERE id = $2", &[50.into(), 7.into()])
//!             .await
//!     })
//! })
//! .await?;
//! ```

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::{pooling_disabled, ConnectionParams};
use crate::error::{DbError, DbResult};
use crate::pool::{pooling_available, shared_pool};
use crate::row::RowMode;
use crate::session::{PgSession, Session};

/// Source of connections for a scope
#[async_trait]
pub trait Backend: Send + Sync {
    type Conn: Session;

    /// Whether scopes should borrow from the shared pool
    fn pooling_enabled(&self) -> bool;

    /// Open a fresh, unpooled connection in the given row mode
    async fn connect(&self, mode: RowMode) -> DbResult<Self::Conn>;

    /// Borrow a connection from the shared pool
    async fn acquire(&self) -> DbResult<Self::Conn>;
}

/// PostgreSQL backend configured from the environment
#[derive(Debug, Clone, Copy, Default)]
pub struct PgBackend;

#[async_trait]
impl Backend for PgBackend {
    type Conn = PgSession;

    /// Re-read on every call so the flag can be flipped at runtime.
    fn pooling_enabled(&self) -> bool {
        pooling_available() && !pooling_disabled()
    }

    async fn connect(&self, mode: RowMode) -> DbResult<PgSession> {
        connect_with_mode(mode).await
    }

    async fn acquire(&self) -> DbResult<PgSession> {
        shared_pool()?.acquire().await
    }
}

/// Open one unpooled connection using freshly resolved parameters.
///
/// # Errors
///
/// The driver error if the server is unreachable or rejects the credentials.
/// There is no retry.
pub async fn connect(dict_rows: bool) -> DbResult<PgSession> {
    connect_with_mode(RowMode::from_dict_rows(dict_rows)).await
}

async fn connect_with_mode(mode: RowMode) -> DbResult<PgSession> {
    let params = ConnectionParams::from_env();
    debug!(target = %params.describe(), ?mode, "opening unpooled connection");
    PgSession::connect(&params.connect_options()?, mode).await
}

/// Run `work` inside a scoped connection from the default backend.
///
/// The callback cannot borrow from the enclosing function across the
/// boxed future; move owned values into it instead.
pub async fn connection_scope<F, T, E>(dict_rows: bool, work: F) -> Result<T, E>
where
    F: for<'c> FnOnce(&'c mut PgSession) -> BoxFuture<'c, Result<T, E>> + Send,
    T: Send,
    E: From<DbError> + Send,
{
    scope_with(&PgBackend, dict_rows, work).await
}

/// Run `work` inside a scoped connection from `backend`.
pub async fn scope_with<B, F, T, E>(backend: &B, dict_rows: bool, work: F) -> Result<T, E>
where
    B: Backend + ?Sized,
    F: for<'c> FnOnce(&'c mut B::Conn) -> BoxFuture<'c, Result<T, E>> + Send,
    T: Send,
    E: From<DbError> + Send,
{
    if backend.pooling_enabled() {
        pooled_scope(backend, dict_rows, work).await
    } else {
        unpooled_scope(backend, dict_rows, work).await
    }
}

async fn unpooled_scope<B, F, T, E>(backend: &B, dict_rows: bool, work: F) -> Result<T, E>
where
    B: Backend + ?Sized,
    F: for<'c> FnOnce(&'c mut B::Conn) -> BoxFuture<'c, Result<T, E>> + Send,
    T: Send,
    E: From<DbError> + Send,
{
    let conn = backend.connect(RowMode::from_dict_rows(dict_rows)).await?;
    let mut borrowed = Borrowed::new(conn);

    let outcome = run_and_settle(borrowed.conn(), work).await;

    if let Err(err) = borrowed.finish().await {
        warn!(error = %err, "failed to close unpooled connection");
    }
    resume(outcome)
}

async fn pooled_scope<B, F, T, E>(backend: &B, dict_rows: bool, work: F) -> Result<T, E>
where
    B: Backend + ?Sized,
    F: for<'c> FnOnce(&'c mut B::Conn) -> BoxFuture<'c, Result<T, E>> + Send,
    T: Send,
    E: From<DbError> + Send,
{
    let mut borrowed = Borrowed::new(backend.acquire().await?);
    let previous_mode = borrowed.conn().row_mode();
    if dict_rows {
        borrowed.conn().set_row_mode(RowMode::Dict);
    }

    let outcome = run_and_settle(borrowed.conn(), work).await;

    borrowed.conn().set_row_mode(previous_mode);
    if let Err(err) = borrowed.finish().await {
        warn!(error = %err, "failed to return connection to the pool");
    }
    resume(outcome)
}

/// A scope's connection until the scope has settled.
///
/// A scope future dropped part way (timeout, `select!`, task abort) drops
/// this guard, and the connection is discarded so nobody inherits its open
/// transaction.
struct Borrowed<C: Session> {
    conn: Option<C>,
}

impl<C: Session> Borrowed<C> {
    fn new(conn: C) -> Self {
        Self { conn: Some(conn) }
    }

    fn conn(&mut self) -> &mut C {
        match &mut self.conn {
            Some(conn) => conn,
            None => unreachable!("scope connection used after it was handed back"),
        }
    }

    /// Release the connection, unless a transaction survived settling (a
    /// failed rollback): then it is discarded.
    async fn finish(mut self) -> DbResult<()> {
        let Some(conn) = self.conn.take() else {
            return Ok(());
        };
        if conn.in_transaction() {
            warn!("transaction still open after the scope; discarding connection");
            conn.discard();
            return Ok(());
        }
        conn.release().await
    }
}

impl<C: Session> Drop for Borrowed<C> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            warn!("scope dropped before it finished; discarding its connection");
            conn.discard();
        }
    }
}

type Panic = Box<dyn Any + Send + 'static>;

/// Run the caller's work and settle the transaction. A panic is caught so
/// the connection can be rolled back and released before it resumes.
async fn run_and_settle<C, F, T, E>(conn: &mut C, work: F) -> Result<Result<T, E>, Panic>
where
    C: Session,
    F: for<'c> FnOnce(&'c mut C) -> BoxFuture<'c, Result<T, E>> + Send,
    T: Send,
    E: From<DbError> + Send,
{
    let outcome = AssertUnwindSafe(work(&mut *conn)).catch_unwind().await;

    match outcome {
        Ok(Ok(value)) => {
            if conn.autocommit() {
                return Ok(Ok(value));
            }
            match conn.commit().await {
                Ok(()) => Ok(Ok(value)),
                Err(err) => {
                    rollback_quietly(conn).await;
                    Ok(Err(E::from(err)))
                }
            }
        }
        Ok(Err(err)) => {
            rollback_quietly(conn).await;
            Ok(Err(err))
        }
        Err(panic) => {
            rollback_quietly(conn).await;
            Err(panic)
        }
    }
}

/// Roll back unless autocommit. A failure here must not mask the error that
/// is already propagating, so it is only logged.
async fn rollback_quietly<C: Session>(conn: &mut C) {
    if conn.autocommit() {
        return;
    }
    if let Err(err) = conn.rollback().await {
        warn!(error = %err, "rollback failed");
    }
}

fn resume<T, E>(outcome: Result<Result<T, E>, Panic>) -> Result<T, E> {
    match outcome {
        Ok(result) => result,
        Err(panic) => panic::resume_unwind(panic),
    }
}

/// First column of the first row, or `None` when the query matched nothing.
///
/// Runs in a plain-row scope, so any failure rolls back before it is
/// returned. A SQL `NULL` comes back as `Some(Value::Null)`. Only the first
/// column is decoded.
pub async fn fetch_value(query: &str, params: &[Value]) -> DbResult<Option<Value>> {
    fetch_value_with(&PgBackend, query, params).await
}

/// [`fetch_value`], deserialized into `T`
pub async fn fetch_value_as<T: DeserializeOwned>(
    query: &str,
    params: &[Value],
) -> DbResult<Option<T>> {
    fetch_value(query, params)
        .await?
        .map(serde_json::from_value)
        .transpose()
        .map_err(DbError::from)
}

/// [`fetch_value`] against an explicit backend
pub async fn fetch_value_with<B>(
    backend: &B,
    query: &str,
    params: &[Value],
) -> DbResult<Option<Value>>
where
    B: Backend + ?Sized,
{
    let query = query.to_owned();
    let params = params.to_vec();
    scope_with(backend, false, move |conn| {
        Box::pin(async move {
            conn.fetch_scalar(&query, &params).await
        })
    })
    .await
}

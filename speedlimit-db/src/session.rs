//! A single database connection as seen by caller code
//!
//! Outside autocommit mode the first statement of a unit of work opens a
//! transaction implicitly; [`Session::commit`] and [`Session::rollback`] end
//! it and do nothing when none is open.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::{ConnectOptions, Connection, Executor, Postgres};
use tokio::runtime;
use tracing::{debug, warn};

use crate::error::{DbError, DbResult};
use crate::row::{bind_params, decode_first_column, decode_row, Row, RowMode};

/// Operations a scoped connection offers.
///
/// [`crate::scope`] only talks to connections through this trait.
#[async_trait]
pub trait Session: Send {
    fn autocommit(&self) -> bool;

    /// Switch autocommit mode.
    ///
    /// # Errors
    ///
    /// [`DbError::AutocommitInTransaction`] while a transaction is open.
    fn set_autocommit(&mut self, autocommit: bool) -> DbResult<()>;

    fn row_mode(&self) -> RowMode;

    fn set_row_mode(&mut self, mode: RowMode);

    /// True from the first statement of a unit of work until the server has
    /// confirmed its commit or rollback
    fn in_transaction(&self) -> bool;

    /// Run a statement and return the number of affected rows
    async fn execute(&mut self, query: &str, params: &[Value]) -> DbResult<u64>;

    async fn fetch_all(&mut self, query: &str, params: &[Value]) -> DbResult<Vec<Row>>;

    /// At most one row; further rows are discarded
    async fn fetch_optional(&mut self, query: &str, params: &[Value]) -> DbResult<Option<Row>>;

    /// First column of the first row. Other columns are never decoded.
    async fn fetch_scalar(&mut self, query: &str, params: &[Value]) -> DbResult<Option<Value>>;

    async fn commit(&mut self) -> DbResult<()>;

    async fn rollback(&mut self) -> DbResult<()>;

    /// Hand the connection back: return it to its pool or close it. A pooled
    /// connection still inside a transaction is discarded instead.
    async fn release(self) -> DbResult<()>;

    /// Drop the connection without letting anyone reuse it. An open
    /// transaction dies with it on the server.
    fn discard(self);
}

enum Link {
    Pooled {
        conn: PoolConnection<Postgres>,
        runtime: runtime::Handle,
    },
    Direct(PgConnection),
}

/// PostgreSQL session over a pooled or a standalone connection.
///
/// Dropping a pooled session returns its connection to the pool, unless a
/// transaction is still open: then the connection is detached and closed.
pub struct PgSession {
    link: Option<Link>,
    row_mode: RowMode,
    autocommit: bool,
    in_transaction: bool,
}

impl PgSession {
    /// Open a standalone connection. The row mode is fixed here but may
    /// still be changed with [`Session::set_row_mode`].
    pub async fn connect(options: &PgConnectOptions, row_mode: RowMode) -> DbResult<Self> {
        let conn = options.connect().await?;
        Ok(Self::new(Link::Direct(conn), row_mode))
    }

    /// Wrap a connection borrowed from a pool. `runtime` is the runtime the
    /// pool was built on; the connection goes back to the pool there.
    pub fn pooled(conn: PoolConnection<Postgres>, runtime: runtime::Handle) -> Self {
        Self::new(Link::Pooled { conn, runtime }, RowMode::Tuple)
    }

    fn new(link: Link, row_mode: RowMode) -> Self {
        Self {
            link: Some(link),
            row_mode,
            autocommit: false,
            in_transaction: false,
        }
    }

    pub fn is_pooled(&self) -> bool {
        matches!(self.link, Some(Link::Pooled { .. }))
    }

    /// The underlying sqlx connection, for queries this wrapper does not
    /// cover. Statements issued here bypass the implicit `BEGIN`.
    pub fn raw(&mut self) -> &mut PgConnection {
        match &mut self.link {
            Some(Link::Pooled { conn, .. }) => conn,
            Some(Link::Direct(conn)) => conn,
            None => unreachable!("session used after it was released"),
        }
    }

    // Marked open before BEGIN is sent, and cleared only after the server
    // answers COMMIT or ROLLBACK, so a session abandoned mid-statement is
    // never handed to another borrower.
    async fn ensure_transaction(&mut self) -> DbResult<()> {
        if !self.autocommit && !self.in_transaction {
            self.in_transaction = true;
            self.raw().execute("BEGIN").await?;
        }
        Ok(())
    }

    async fn finish_transaction(&mut self, statement: &'static str) -> DbResult<()> {
        if !self.in_transaction {
            return Ok(());
        }
        debug!(statement, "ending transaction");
        self.raw().execute(statement).await?;
        self.in_transaction = false;
        Ok(())
    }
}

fn give_back(link: Link, reusable: bool) {
    match link {
        Link::Pooled { conn, runtime } => {
            // The pool spawns its return task on the current runtime.
            let _context = runtime.enter();
            if reusable {
                drop(conn);
            } else {
                drop(conn.detach());
            }
        }
        Link::Direct(conn) => drop(conn),
    }
}

impl Drop for PgSession {
    fn drop(&mut self) {
        if let Some(link) = self.link.take() {
            if self.in_transaction {
                warn!("session dropped inside a transaction; discarding its connection");
            }
            give_back(link, !self.in_transaction);
        }
    }
}

#[async_trait]
impl Session for PgSession {
    fn autocommit(&self) -> bool {
        self.autocommit
    }

    fn set_autocommit(&mut self, autocommit: bool) -> DbResult<()> {
        if self.in_transaction {
            return Err(DbError::AutocommitInTransaction);
        }
        self.autocommit = autocommit;
        Ok(())
    }

    fn row_mode(&self) -> RowMode {
        self.row_mode
    }

    fn set_row_mode(&mut self, mode: RowMode) {
        self.row_mode = mode;
    }

    fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    async fn execute(&mut self, query: &str, params: &[Value]) -> DbResult<u64> {
        self.ensure_transaction().await?;
        let result = bind_params(sqlx::query(query), params)
            .execute(self.raw())
            .await?;
        Ok(result.rows_affected())
    }

    async fn fetch_all(&mut self, query: &str, params: &[Value]) -> DbResult<Vec<Row>> {
        self.ensure_transaction().await?;
        let mode = self.row_mode;
        let rows = bind_params(sqlx::query(query), params)
            .fetch_all(self.raw())
            .await?;
        rows.iter().map(|row| decode_row(row, mode)).collect()
    }

    async fn fetch_optional(&mut self, query: &str, params: &[Value]) -> DbResult<Option<Row>> {
        self.ensure_transaction().await?;
        let mode = self.row_mode;
        let row = bind_params(sqlx::query(query), params)
            .fetch_optional(self.raw())
            .await?;
        row.as_ref().map(|row| decode_row(row, mode)).transpose()
    }

    async fn fetch_scalar(&mut self, query: &str, params: &[Value]) -> DbResult<Option<Value>> {
        self.ensure_transaction().await?;
        let row = bind_params(sqlx::query(query), params)
            .fetch_optional(self.raw())
            .await?;
        row.as_ref().map(decode_first_column).transpose()
    }

    async fn commit(&mut self) -> DbResult<()> {
        self.finish_transaction("COMMIT").await
    }

    async fn rollback(&mut self) -> DbResult<()> {
        self.finish_transaction("ROLLBACK").await
    }

    async fn release(mut self) -> DbResult<()> {
        match self.link.take() {
            // Closing ends the server session, and any transaction with it.
            Some(Link::Direct(conn)) => conn.close().await?,
            Some(pooled) => {
                if self.in_transaction {
                    warn!("releasing a connection inside a transaction; discarding it");
                }
                give_back(pooled, !self.in_transaction);
            }
            None => {}
        }
        Ok(())
    }

    fn discard(mut self) {
        if let Some(link) = self.link.take() {
            give_back(link, false);
        }
    }
}

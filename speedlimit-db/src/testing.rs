//! In-memory backend for exercising scopes without a database.
//!
//! Pooled fake connections keep their row mode, autocommit flag and open
//! transaction between borrows, and a connection dropped without being
//! released goes straight back to the idle list, like a naive pool would. Any
//! state a scope fails to clean up is therefore visible to the next borrower.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::{DbError, DbResult};
use crate::row::{Row, RowMode};
use crate::scope::Backend;
use crate::session::Session;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Stats {
    pub connects: usize,
    pub acquires: usize,
    pub commits: usize,
    pub rollbacks: usize,
    pub releases: usize,
    pub closes: usize,
    pub discards: usize,
    pub last_params: Vec<Value>,
}

/// Injected failures
#[derive(Debug, Clone, Copy, Default)]
pub struct Script {
    pub fail_connect: bool,
    pub fail_commit: bool,
    pub fail_rollback: bool,
    pub fail_queries: bool,
    /// Column position whose type cannot be decoded
    pub unsupported_column: Option<usize>,
}

/// Error type for caller code in tests
#[derive(Debug, Clone, PartialEq)]
pub enum FakeError {
    Caller(String),
    Db(String),
}

impl From<DbError> for FakeError {
    fn from(err: DbError) -> Self {
        FakeError::Db(err.to_string())
    }
}

#[derive(Debug, Clone, Copy)]
struct IdleConn {
    id: usize,
    mode: RowMode,
    autocommit: bool,
    in_transaction: bool,
}

impl IdleConn {
    fn fresh(id: usize) -> Self {
        Self {
            id,
            mode: RowMode::Tuple,
            autocommit: false,
            in_transaction: false,
        }
    }
}

#[derive(Default)]
struct State {
    idle: Vec<IdleConn>,
    next_id: usize,
    stats: Stats,
    script: Script,
    rows: Vec<Vec<Value>>,
}

pub struct FakeBackend {
    pooled: bool,
    state: Arc<Mutex<State>>,
}

impl FakeBackend {
    /// Pool of `size` idle connections with ids `0..size`
    pub fn pooled(size: usize) -> Self {
        Self {
            pooled: true,
            state: Arc::new(Mutex::new(State {
                idle: (0..size).map(IdleConn::fresh).collect(),
                next_id: size,
                ..State::default()
            })),
        }
    }

    /// Backend with pooling switched off
    pub fn unpooled() -> Self {
        Self {
            pooled: false,
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    pub fn with_script(self, script: Script) -> Self {
        self.state.lock().unwrap().script = script;
        self
    }

    /// Rows returned by every query, each as positional values
    pub fn with_rows(self, rows: Vec<Vec<Value>>) -> Self {
        self.state.lock().unwrap().rows = rows;
        self
    }

    pub fn stats(&self) -> Stats {
        self.state.lock().unwrap().stats.clone()
    }

    pub fn idle_modes(&self) -> Vec<RowMode> {
        self.state.lock().unwrap().idle.iter().map(|c| c.mode).collect()
    }

    pub fn set_idle_modes(&self, mode: RowMode) {
        for conn in &mut self.state.lock().unwrap().idle {
            conn.mode = mode;
        }
    }

    pub fn idle_ids(&self) -> Vec<usize> {
        self.state.lock().unwrap().idle.iter().map(|c| c.id).collect()
    }
}

fn injected(what: &str) -> DbError {
    DbError::Database(sqlx::Error::Protocol(format!("injected {what} failure")))
}

#[async_trait]
impl Backend for FakeBackend {
    type Conn = FakeConn;

    fn pooling_enabled(&self) -> bool {
        self.pooled
    }

    async fn connect(&self, mode: RowMode) -> DbResult<FakeConn> {
        let mut state = self.state.lock().unwrap();
        if state.script.fail_connect {
            return Err(injected("connect"));
        }
        state.stats.connects += 1;
        let id = state.next_id;
        state.next_id += 1;
        Ok(FakeConn::new(
            IdleConn { mode, ..IdleConn::fresh(id) },
            false,
            &self.state,
        ))
    }

    async fn acquire(&self) -> DbResult<FakeConn> {
        let mut state = self.state.lock().unwrap();
        if state.script.fail_connect {
            return Err(injected("acquire"));
        }
        let idle = state
            .idle
            .pop()
            .ok_or_else(|| DbError::Database(sqlx::Error::PoolTimedOut))?;
        state.stats.acquires += 1;
        Ok(FakeConn::new(idle, true, &self.state))
    }
}

pub struct FakeConn {
    pub id: usize,
    mode: RowMode,
    autocommit: bool,
    in_transaction: bool,
    pooled: bool,
    settled: bool,
    state: Arc<Mutex<State>>,
}

impl FakeConn {
    fn new(idle: IdleConn, pooled: bool, state: &Arc<Mutex<State>>) -> Self {
        Self {
            id: idle.id,
            mode: idle.mode,
            autocommit: idle.autocommit,
            in_transaction: idle.in_transaction,
            pooled,
            settled: false,
            state: Arc::clone(state),
        }
    }

    fn query(&mut self, params: &[Value], columns: usize) -> DbResult<Vec<Row>> {
        if !self.autocommit {
            self.in_transaction = true;
        }
        let mut state = self.state.lock().unwrap();
        state.stats.last_params = params.to_vec();
        if state.script.fail_queries {
            return Err(injected("query"));
        }
        if let Some(column) = state.script.unsupported_column {
            if column < columns {
                return Err(DbError::unsupported_column(format!("col{column}"), "GEOMETRY"));
            }
        }
        Ok(state
            .rows
            .iter()
            .map(|values| {
                let values = values.iter().take(columns).cloned();
                match self.mode {
                    RowMode::Tuple => Row::Tuple(values.collect()),
                    RowMode::Dict => Row::Dict(
                        values
                            .enumerate()
                            .map(|(i, v)| (format!("col{i}"), v))
                            .collect::<Map<_, _>>(),
                    ),
                }
            })
            .collect())
    }

    /// Return to the idle list with whatever state the connection is in
    fn hand_back(&mut self) {
        self.settled = true;
        let mut state = self.state.lock().unwrap();
        if self.pooled {
            state.stats.releases += 1;
            state.idle.push(IdleConn {
                id: self.id,
                mode: self.mode,
                autocommit: self.autocommit,
                in_transaction: self.in_transaction,
            });
        } else {
            state.stats.closes += 1;
        }
    }
}

impl Drop for FakeConn {
    fn drop(&mut self) {
        if !self.settled {
            self.hand_back();
        }
    }
}

#[async_trait]
impl Session for FakeConn {
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
        self.mode
    }

    fn set_row_mode(&mut self, mode: RowMode) {
        self.mode = mode;
    }

    fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    async fn execute(&mut self, _query: &str, params: &[Value]) -> DbResult<u64> {
        self.query(params, usize::MAX).map(|_| 1)
    }

    async fn fetch_all(&mut self, _query: &str, params: &[Value]) -> DbResult<Vec<Row>> {
        self.query(params, usize::MAX)
    }

    async fn fetch_optional(&mut self, _query: &str, params: &[Value]) -> DbResult<Option<Row>> {
        Ok(self.query(params, usize::MAX)?.into_iter().next())
    }

    async fn fetch_scalar(&mut self, _query: &str, params: &[Value]) -> DbResult<Option<Value>> {
        let rows = self.query(params, 1)?;
        Ok(rows.into_iter().next().and_then(Row::into_first))
    }

    async fn commit(&mut self) -> DbResult<()> {
        let mut state = self.state.lock().unwrap();
        state.stats.commits += 1;
        if !self.in_transaction {
            return Ok(());
        }
        if state.script.fail_commit {
            return Err(injected("commit"));
        }
        self.in_transaction = false;
        Ok(())
    }

    async fn rollback(&mut self) -> DbResult<()> {
        let mut state = self.state.lock().unwrap();
        state.stats.rollbacks += 1;
        if !self.in_transaction {
            return Ok(());
        }
        if state.script.fail_rollback {
            return Err(injected("rollback"));
        }
        self.in_transaction = false;
        Ok(())
    }

    async fn release(mut self) -> DbResult<()> {
        self.hand_back();
        Ok(())
    }

    /// The pool opens a replacement under a new id.
    fn discard(mut self) {
        self.settled = true;
        let mut state = self.state.lock().unwrap();
        state.stats.discards += 1;
        if self.pooled {
            let id = state.next_id;
            state.next_id += 1;
            state.idle.push(IdleConn::fresh(id));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fake_rejects_autocommit_change_inside_transaction() {
        let backend = FakeBackend::pooled(1);
        let mut conn = backend.acquire().await.unwrap();

        conn.execute("UPDATE t SET x = 1", &[]).await.unwrap();
        assert!(conn.in_transaction());
        assert!(matches!(
            conn.set_autocommit(true),
            Err(DbError::AutocommitInTransaction)
        ));

        conn.commit().await.unwrap();
        conn.set_autocommit(true).unwrap();
        conn.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_fake_keeps_open_transaction_across_borrows() {
        let backend = FakeBackend::pooled(1);

        let mut conn = backend.acquire().await.unwrap();
        conn.execute("INSERT INTO t VALUES (1)", &[]).await.unwrap();
        drop(conn);

        let conn = backend.acquire().await.unwrap();
        assert_eq!(conn.id, 0);
        assert!(conn.in_transaction(), "dropped connection went back as it was");
    }
}

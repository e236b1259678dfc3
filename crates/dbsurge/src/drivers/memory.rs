//! In-memory driver adapter used by the test suites.
//!
//! The adapter records every statement it is handed and replays scripted
//! result sets, so tests can assert on generated SQL, bound payloads,
//! and call counts without a live database. Failure injection covers
//! the error-isolation paths: a poison value makes any statement whose
//! payload carries it fail with an integrity error, and a one-shot
//! batch failure forces the per-row fallback.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::dialect::{Capabilities, DbType, ParamStyle, Params};
use crate::drivers::{DriverConnection, DriverCursor};
use crate::error::{EtlError, Result};
use crate::Value;

/// One executed statement, as seen by the driver.
#[derive(Debug, Clone)]
pub struct StatementRecord {
    pub sql: String,
    pub payloads: Vec<Params>,
    pub many: bool,
}

#[derive(Debug, Clone)]
struct Script {
    needle: String,
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
}

#[derive(Debug, Default)]
struct MemoryState {
    log: Vec<StatementRecord>,
    scripts: Vec<Script>,
    poison: Option<Value>,
    fail_next_many: Option<String>,
    begins: usize,
    commits: usize,
    rollbacks: usize,
}

impl MemoryState {
    fn check_poison(&self, payloads: &[Params]) -> Result<()> {
        let Some(poison) = &self.poison else {
            return Ok(());
        };
        for params in payloads {
            let hit = match params {
                Params::None => false,
                Params::Positional(values) => values.contains(poison),
                Params::Named(map) => map.values().any(|v| v == poison),
            };
            if hit {
                return Err(EtlError::integrity(format!(
                    "constraint violation on value {poison}"
                )));
            }
        }
        Ok(())
    }
}

/// Scripted in-memory connection.
///
/// Clones share state, so a test can keep a handle for inspection after
/// moving the connection into an `Arc<dyn DriverConnection>`.
#[derive(Clone)]
pub struct MemoryConnection {
    db_type: DbType,
    style: ParamStyle,
    capabilities: Capabilities,
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryConnection {
    /// Create a connection reporting the given engine and style.
    #[must_use]
    pub fn new(db_type: DbType, style: ParamStyle) -> Self {
        MemoryConnection {
            db_type,
            style,
            capabilities: db_type.default_capabilities(),
            state: Arc::new(Mutex::new(MemoryState::default())),
        }
    }

    /// Override the declared capabilities.
    #[must_use]
    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Register a result set replayed for any statement containing
    /// `needle`. Scripts are matched first-registered-first and are
    /// reusable across statements.
    pub fn script_query<S: Into<String>>(
        &self,
        needle: &str,
        columns: impl IntoIterator<Item = S>,
        rows: Vec<Vec<Value>>,
    ) {
        let mut state = self.state.lock().unwrap();
        state.scripts.push(Script {
            needle: needle.to_string(),
            columns: columns.into_iter().map(Into::into).collect(),
            rows,
        });
    }

    /// Any statement whose payload contains this value fails with an
    /// integrity error.
    pub fn poison_value(&self, value: Value) {
        self.state.lock().unwrap().poison = Some(value);
    }

    /// Make the next `execute_many` call fail with a general database
    /// error (one-shot).
    pub fn fail_next_execute_many(&self, message: impl Into<String>) {
        self.state.lock().unwrap().fail_next_many = Some(message.into());
    }

    /// Statements executed so far.
    #[must_use]
    pub fn executed(&self) -> Vec<StatementRecord> {
        self.state.lock().unwrap().log.clone()
    }

    /// Number of statements executed (batch calls count once).
    #[must_use]
    pub fn execute_count(&self) -> usize {
        self.state.lock().unwrap().log.len()
    }

    /// Statements whose SQL contains `needle`.
    #[must_use]
    pub fn executed_matching(&self, needle: &str) -> Vec<StatementRecord> {
        self.state
            .lock()
            .unwrap()
            .log
            .iter()
            .filter(|r| r.sql.contains(needle))
            .cloned()
            .collect()
    }

    /// Forget the statement log.
    pub fn clear_log(&self) {
        self.state.lock().unwrap().log.clear();
    }

    /// (begin, commit, rollback) counts.
    #[must_use]
    pub fn transaction_counts(&self) -> (usize, usize, usize) {
        let state = self.state.lock().unwrap();
        (state.begins, state.commits, state.rollbacks)
    }
}

#[async_trait]
impl DriverConnection for MemoryConnection {
    fn db_type(&self) -> DbType {
        self.db_type
    }

    fn param_style(&self) -> ParamStyle {
        self.style
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    fn open_cursor(&self) -> Result<Box<dyn DriverCursor>> {
        Ok(Box::new(MemoryCursor {
            state: Arc::clone(&self.state),
            pending: VecDeque::new(),
            description: None,
            rowcount: -1,
        }))
    }

    async fn begin(&self) -> Result<()> {
        self.state.lock().unwrap().begins += 1;
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        self.state.lock().unwrap().commits += 1;
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        self.state.lock().unwrap().rollbacks += 1;
        Ok(())
    }
}

struct MemoryCursor {
    state: Arc<Mutex<MemoryState>>,
    pending: VecDeque<Vec<Value>>,
    description: Option<Vec<String>>,
    rowcount: i64,
}

#[async_trait]
impl DriverCursor for MemoryCursor {
    async fn execute(&mut self, sql: &str, params: &Params) -> Result<u64> {
        let mut state = self.state.lock().unwrap();
        state.log.push(StatementRecord {
            sql: sql.to_string(),
            payloads: vec![params.clone()],
            many: false,
        });
        state.check_poison(std::slice::from_ref(params))?;

        let script = state
            .scripts
            .iter()
            .find(|s| sql.contains(&s.needle))
            .cloned();
        drop(state);

        match script {
            Some(script) => {
                self.rowcount = script.rows.len() as i64;
                self.pending = script.rows.into();
                self.description = Some(script.columns);
                Ok(self.rowcount as u64)
            }
            None => {
                self.pending.clear();
                self.description = None;
                self.rowcount = 1;
                Ok(1)
            }
        }
    }

    async fn execute_many(&mut self, sql: &str, params: &[Params]) -> Result<u64> {
        let mut state = self.state.lock().unwrap();
        state.log.push(StatementRecord {
            sql: sql.to_string(),
            payloads: params.to_vec(),
            many: true,
        });
        if let Some(message) = state.fail_next_many.take() {
            return Err(EtlError::database(message));
        }
        state.check_poison(params)?;
        drop(state);

        self.pending.clear();
        self.description = None;
        self.rowcount = params.len() as i64;
        Ok(params.len() as u64)
    }

    async fn fetch_one(&mut self) -> Result<Option<Vec<Value>>> {
        Ok(self.pending.pop_front())
    }

    async fn fetch_many(&mut self, n: usize) -> Result<Vec<Vec<Value>>> {
        let take = n.min(self.pending.len());
        Ok(self.pending.drain(..take).collect())
    }

    async fn fetch_all(&mut self) -> Result<Vec<Vec<Value>>> {
        Ok(self.pending.drain(..).collect())
    }

    fn description(&self) -> Option<&[String]> {
        self.description.as_deref()
    }

    fn rowcount(&self) -> i64 {
        self.rowcount
    }

    async fn close(&mut self) -> Result<()> {
        self.pending.clear();
        self.description = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_result_replay() {
        let conn = MemoryConnection::new(DbType::Postgres, ParamStyle::Named);
        conn.script_query(
            "FROM states",
            ["name", "code"],
            vec![vec![Value::Text("Ohio".into()), Value::Text("OH".into())]],
        );

        let mut cursor = conn.open_cursor().unwrap();
        cursor
            .execute("SELECT name, code FROM states", &Params::None)
            .await
            .unwrap();
        assert_eq!(cursor.description(), Some(&["name".to_string(), "code".to_string()][..]));
        let row = cursor.fetch_one().await.unwrap().unwrap();
        assert_eq!(row[1], Value::Text("OH".into()));
        assert!(cursor.fetch_one().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_statement_log_and_rowcount() {
        let conn = MemoryConnection::new(DbType::Postgres, ParamStyle::Named);
        let mut cursor = conn.open_cursor().unwrap();
        let n = cursor
            .execute_many(
                "INSERT INTO t (a) VALUES (:a)",
                &[Params::None, Params::None, Params::None],
            )
            .await
            .unwrap();
        assert_eq!(n, 3);
        assert_eq!(conn.execute_count(), 1);
        assert!(conn.executed()[0].many);
    }

    #[tokio::test]
    async fn test_poison_value_fails_integrity() {
        let conn = MemoryConnection::new(DbType::Postgres, ParamStyle::Named);
        conn.poison_value(Value::Int(13));
        let mut cursor = conn.open_cursor().unwrap();

        let err = cursor
            .execute("INSERT", &Params::Positional(vec![Value::Int(13)]))
            .await
            .unwrap_err();
        assert!(err.is_integrity());

        let ok = cursor
            .execute("INSERT", &Params::Positional(vec![Value::Int(12)]))
            .await;
        assert!(ok.is_ok());
    }

    #[tokio::test]
    async fn test_fail_next_execute_many_is_one_shot() {
        let conn = MemoryConnection::new(DbType::Postgres, ParamStyle::Named);
        conn.fail_next_execute_many("deadlock");
        let mut cursor = conn.open_cursor().unwrap();

        assert!(cursor
            .execute_many("INSERT", &[Params::None])
            .await
            .is_err());
        assert!(cursor
            .execute_many("INSERT", &[Params::None])
            .await
            .is_ok());
    }
}

//! Uniform cursor facade over driver cursors.
//!
//! The facade translates canonical named parameters to the driver's
//! style, loads SQL files, and turns raw driver rows into [`Record`]s
//! with a schema shared across the whole result set. Database errors
//! propagate unchanged; the facade adds no retries.

pub mod prepared;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use tracing::debug;

use crate::core::record::{Record, Schema};
use crate::core::value::Value;
use crate::dialect::{translate, DbType, ParamStyle, Params};
use crate::drivers::{DriverConnection, DriverCursor};
use crate::error::{EtlError, Result};

pub use prepared::PreparedStatement;

/// Build a shared schema from a driver's column description.
pub(crate) fn schema_from_description(description: &[String]) -> Arc<Schema> {
    Schema::new(description.iter().cloned())
}

/// Read a SQL file containing one statement in the canonical style.
pub(crate) fn load_sql_file(path: &Path) -> Result<String> {
    let sql = std::fs::read_to_string(path)?;
    let trimmed = sql.trim();
    if trimmed.is_empty() {
        return Err(EtlError::Translate(format!(
            "SQL file is empty: {}",
            path.display()
        )));
    }
    Ok(trimmed.to_string())
}

/// Cursor facade wrapping a driver cursor.
///
/// Fetches yield [`Record`]s; the first fetch after an execute builds
/// the schema from the driver's column description. Iterate with
/// `while let Some(row) = cursor.fetch_one().await?`.
pub struct Cursor {
    conn: Arc<dyn DriverConnection>,
    inner: Box<dyn DriverCursor>,
    schema: Option<Arc<Schema>>,
}

impl std::fmt::Debug for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cursor").field("schema", &self.schema).finish()
    }
}

impl Cursor {
    /// Open a cursor on a connection.
    ///
    /// # Errors
    ///
    /// Fails when the driver cannot allocate a cursor.
    pub fn new(conn: Arc<dyn DriverConnection>) -> Result<Self> {
        let inner = conn.open_cursor()?;
        Ok(Cursor {
            conn,
            inner,
            schema: None,
        })
    }

    /// The connection this cursor was opened from.
    #[must_use]
    pub fn connection(&self) -> &Arc<dyn DriverConnection> {
        &self.conn
    }

    /// The driver's placeholder style.
    #[must_use]
    pub fn param_style(&self) -> ParamStyle {
        self.conn.param_style()
    }

    /// The database engine behind this cursor.
    #[must_use]
    pub fn db_type(&self) -> DbType {
        self.conn.db_type()
    }

    /// Execute a statement.
    ///
    /// Named payloads are treated as canonical: the query is translated
    /// to the driver's style and the payload is re-bound to match.
    /// Positional payloads and parameterless statements pass through
    /// untouched, for callers already speaking the driver's dialect.
    pub async fn execute(&mut self, sql: &str, params: Params) -> Result<u64> {
        self.schema = None;
        match params {
            Params::Named(map) => {
                let query = translate(sql, self.conn.param_style())?;
                let bound = query.bind(&map);
                debug!(sql = query.sql(), params = bound.len(), "execute");
                self.inner.execute(query.sql(), &bound).await
            }
            other => {
                debug!(sql, params = other.len(), "execute");
                self.inner.execute(sql, &other).await
            }
        }
    }

    /// Execute an already-translated statement with pre-bound
    /// parameters, bypassing canonical translation.
    ///
    /// Used by callers that cache translated DML templates.
    pub async fn execute_raw(&mut self, sql: &str, params: &Params) -> Result<u64> {
        self.schema = None;
        debug!(sql, params = params.len(), "execute_raw");
        self.inner.execute(sql, params).await
    }

    /// Execute and return `self` for fluent chaining into a fetch.
    pub async fn query(&mut self, sql: &str, params: Params) -> Result<&mut Self> {
        self.execute(sql, params).await?;
        Ok(self)
    }

    /// Load a SQL file (canonical style, one statement) and execute it.
    pub async fn execute_file(&mut self, path: impl AsRef<Path>, params: Params) -> Result<u64> {
        let sql = load_sql_file(path.as_ref())?;
        self.execute(&sql, params).await
    }

    /// Execute one canonical statement against a sequence of payloads.
    ///
    /// The query is translated once; each payload is bound in turn and
    /// the batch goes to the driver's native batch call.
    pub async fn execute_many(
        &mut self,
        sql: &str,
        payloads: &[HashMap<String, Value>],
    ) -> Result<u64> {
        self.schema = None;
        let query = translate(sql, self.conn.param_style())?;
        let bound: Vec<Params> = payloads.iter().map(|p| query.bind(p)).collect();
        debug!(sql = query.sql(), batch = bound.len(), "execute_many");
        self.inner.execute_many(query.sql(), &bound).await
    }

    /// Batch-execute pre-bound payloads without translation.
    pub async fn execute_many_bound(&mut self, sql: &str, payloads: &[Params]) -> Result<u64> {
        self.schema = None;
        debug!(sql, batch = payloads.len(), "execute_many");
        self.inner.execute_many(sql, payloads).await
    }

    /// Prepare a canonical statement for repeated execution.
    ///
    /// The statement gets its own driver cursor on the same connection.
    pub fn prepare(&self, sql: &str) -> Result<PreparedStatement> {
        PreparedStatement::new(Arc::clone(&self.conn), sql)
    }

    /// Prepare the contents of a SQL file.
    pub fn prepare_file(&self, path: impl AsRef<Path>) -> Result<PreparedStatement> {
        let sql = load_sql_file(path.as_ref())?;
        self.prepare(&sql)
    }

    fn ensure_schema(&mut self) -> Result<Arc<Schema>> {
        if let Some(schema) = &self.schema {
            return Ok(Arc::clone(schema));
        }
        let description = self
            .inner
            .description()
            .ok_or_else(|| EtlError::database("query has not been run or did not succeed"))?;
        let schema = schema_from_description(description);
        self.schema = Some(Arc::clone(&schema));
        Ok(schema)
    }

    /// Fetch the next row as a [`Record`].
    pub async fn fetch_one(&mut self) -> Result<Option<Record>> {
        let schema = self.ensure_schema()?;
        match self.inner.fetch_one().await? {
            Some(row) => Ok(Some(Record::new(schema, row)?)),
            None => Ok(None),
        }
    }

    /// Fetch up to `n` rows.
    pub async fn fetch_many(&mut self, n: usize) -> Result<Vec<Record>> {
        let schema = self.ensure_schema()?;
        self.inner
            .fetch_many(n)
            .await?
            .into_iter()
            .map(|row| Record::new(Arc::clone(&schema), row))
            .collect()
    }

    /// Fetch all remaining rows.
    pub async fn fetch_all(&mut self) -> Result<Vec<Record>> {
        let schema = self.ensure_schema()?;
        self.inner
            .fetch_all()
            .await?
            .into_iter()
            .map(|row| Record::new(Arc::clone(&schema), row))
            .collect()
    }

    /// Execute a query that must return exactly one row.
    ///
    /// # Errors
    ///
    /// Fails with a database error on zero rows or more than one.
    pub async fn select_into(&mut self, sql: &str, params: Params) -> Result<Record> {
        self.execute(sql, params).await?;
        let rows = self.fetch_many(2).await?;
        match rows.len() {
            1 => Ok(rows.into_iter().next().unwrap()),
            0 => Err(EtlError::database("no data found")),
            _ => Err(EtlError::database(
                "select_into() must return one and only one row",
            )),
        }
    }

    /// Column names of the current result set.
    pub fn columns(&mut self, normalized: bool) -> Result<Vec<String>> {
        let schema = self.ensure_schema()?;
        Ok(if normalized {
            schema.normalized().to_vec()
        } else {
            schema.names().to_vec()
        })
    }

    /// Affected/returned row count of the last statement.
    #[must_use]
    pub fn rowcount(&self) -> i64 {
        self.inner.rowcount()
    }

    /// Release the driver cursor.
    pub async fn close(&mut self) -> Result<()> {
        self.schema = None;
        self.inner.close().await
    }
}

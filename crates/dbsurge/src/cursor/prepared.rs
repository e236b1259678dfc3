//! Prepared statements: translate once, execute many times.

use std::collections::HashMap;
use std::sync::Arc;

use crate::core::record::{Record, Schema};
use crate::core::value::Value;
use crate::dialect::{translate, Params, TranslatedQuery};
use crate::drivers::{DriverConnection, DriverCursor};
use crate::error::{EtlError, Result};

use super::schema_from_description;

/// A canonical statement translated to the driver's style and bound to
/// its own cursor.
///
/// Built once per canonical query (usually via
/// [`Cursor::prepare`](super::Cursor::prepare) or
/// [`Cursor::prepare_file`](super::Cursor::prepare_file)) and reused for
/// every payload. Owns no resources beyond its cursor; dropping the
/// statement releases it.
pub struct PreparedStatement {
    inner: Box<dyn DriverCursor>,
    query: TranslatedQuery,
    schema: Option<Arc<Schema>>,
}

impl std::fmt::Debug for PreparedStatement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreparedStatement")
            .field("query", &self.query)
            .field("schema", &self.schema)
            .finish()
    }
}

impl PreparedStatement {
    /// Translate `sql` for the connection's style and open a dedicated
    /// cursor for it.
    ///
    /// # Errors
    ///
    /// Translation errors surface here, never at execute time.
    pub fn new(conn: Arc<dyn DriverConnection>, sql: &str) -> Result<Self> {
        let query = translate(sql, conn.param_style())?;
        let inner = conn.open_cursor()?;
        Ok(PreparedStatement {
            inner,
            query,
            schema: None,
        })
    }

    /// The translated SQL.
    #[must_use]
    pub fn sql(&self) -> &str {
        self.query.sql()
    }

    /// Canonical parameter names, in occurrence order.
    #[must_use]
    pub fn param_names(&self) -> &[String] {
        self.query.names()
    }

    /// Bind a payload and execute.
    pub async fn execute(&mut self, payload: &HashMap<String, Value>) -> Result<u64> {
        self.schema = None;
        let bound = self.query.bind(payload);
        self.inner.execute(self.query.sql(), &bound).await
    }

    /// Bind strictly (missing parameters error) and execute.
    pub async fn execute_strict(&mut self, payload: &HashMap<String, Value>) -> Result<u64> {
        self.schema = None;
        let bound = self.query.bind_strict(payload)?;
        self.inner.execute(self.query.sql(), &bound).await
    }

    /// Execute against a sequence of payloads with one driver batch call.
    pub async fn execute_many(&mut self, payloads: &[HashMap<String, Value>]) -> Result<u64> {
        self.schema = None;
        let bound: Vec<Params> = payloads.iter().map(|p| self.query.bind(p)).collect();
        self.inner.execute_many(self.query.sql(), &bound).await
    }

    fn ensure_schema(&mut self) -> Result<Arc<Schema>> {
        if let Some(schema) = &self.schema {
            return Ok(Arc::clone(schema));
        }
        let description = self.inner.description().ok_or_else(|| {
            EtlError::database("statement has not been executed or returned no result set")
        })?;
        let schema = schema_from_description(description);
        self.schema = Some(Arc::clone(&schema));
        Ok(schema)
    }

    /// Fetch the next row of the current result set.
    pub async fn fetch_one(&mut self) -> Result<Option<Record>> {
        let schema = self.ensure_schema()?;
        match self.inner.fetch_one().await? {
            Some(row) => Ok(Some(Record::new(schema, row)?)),
            None => Ok(None),
        }
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

    /// Execute and return the first row, if any.
    pub async fn query_one(
        &mut self,
        payload: &HashMap<String, Value>,
    ) -> Result<Option<Record>> {
        self.execute(payload).await?;
        self.fetch_one().await
    }
}

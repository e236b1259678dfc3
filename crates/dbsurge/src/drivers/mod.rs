//! Driver adapter contracts.
//!
//! Concrete database drivers live outside this crate; the core talks to
//! them through these two traits. An adapter declares its parameter
//! style and capabilities on the connection and surfaces a DB-API-shaped
//! cursor: `execute`, `execute_many`, fetches, a column `description`,
//! and a `rowcount`. Driver errors are reported as
//! [`EtlError::Database`](crate::error::EtlError::Database) with the
//! kind distinguishing integrity violations from everything else.
//!
//! The only suspension points in the crate are the async methods here:
//! every `.await` upstream bottoms out in a driver round-trip.

pub mod memory;

use async_trait::async_trait;

use crate::dialect::{Capabilities, DbType, ParamStyle, Params};
use crate::error::Result;
use crate::Value;

pub use memory::{MemoryConnection, StatementRecord};

/// A live connection to a database, as exposed by a driver adapter.
///
/// Connections are shared (`Arc`) between the cursors, prepared
/// statements, and lookups opened from them; each of those owns its own
/// cursor, so operations through a single cursor stay serialized.
#[async_trait]
pub trait DriverConnection: Send + Sync {
    /// The database engine behind this connection.
    fn db_type(&self) -> DbType;

    /// The placeholder style the driver's cursors accept.
    fn param_style(&self) -> ParamStyle;

    /// Capabilities relevant to DML generation (merge strategy).
    fn capabilities(&self) -> Capabilities {
        self.db_type().default_capabilities()
    }

    /// Open a new driver cursor on this connection.
    fn open_cursor(&self) -> Result<Box<dyn DriverCursor>>;

    /// Begin a transaction.
    async fn begin(&self) -> Result<()>;

    /// Commit the open transaction.
    async fn commit(&self) -> Result<()>;

    /// Roll back the open transaction.
    async fn rollback(&self) -> Result<()>;
}

/// A driver cursor: executes statements and fetches raw rows.
///
/// Rows come back as plain value vectors; the cursor facade pairs them
/// with a shared [`Schema`](crate::core::Schema) built from
/// [`description`](Self::description).
#[async_trait]
pub trait DriverCursor: Send {
    /// Execute a statement in the driver's native placeholder style.
    ///
    /// Returns the affected row count where the driver reports one.
    async fn execute(&mut self, sql: &str, params: &Params) -> Result<u64>;

    /// Execute one statement against a sequence of payloads.
    async fn execute_many(&mut self, sql: &str, params: &[Params]) -> Result<u64>;

    /// Fetch the next row of the current result set.
    async fn fetch_one(&mut self) -> Result<Option<Vec<Value>>>;

    /// Fetch up to `n` rows.
    async fn fetch_many(&mut self, n: usize) -> Result<Vec<Vec<Value>>>;

    /// Fetch all remaining rows.
    async fn fetch_all(&mut self) -> Result<Vec<Vec<Value>>>;

    /// Column names of the current result set, if a query produced one.
    fn description(&self) -> Option<&[String]>;

    /// Affected/returned row count of the last statement (-1 if unknown).
    fn rowcount(&self) -> i64;

    /// Release the cursor.
    async fn close(&mut self) -> Result<()>;
}

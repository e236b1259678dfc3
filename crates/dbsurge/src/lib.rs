//! # dbsurge
//!
//! ETL execution core for moving records between heterogeneous
//! relational databases and file formats, with per-record
//! transformation, validation, and referential lookups:
//!
//! - **Portable parameters**: queries written once in a canonical named
//!   style, translated to any driver's placeholder dialect
//! - **Record rows** sharing one schema per result set, with
//!   positional, named, and normalized-name access
//! - **Table pipelines**: per-column source mapping, transforms,
//!   database-side expressions, readiness tracking, and DML generation
//! - **Surge bulk driver**: batched INSERT/UPDATE/DELETE/MERGE with
//!   per-row error isolation and a temp-table merge fallback
//! - **Cached lookups** wrapping reference tables as transforms
//! - **Resumable imports** via JSON-persisted entity state
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use dbsurge::{
//!     Column, Cursor, DbType, MemoryConnection, ParamStyle, Record, Surge, Table, Value,
//! };
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> dbsurge::Result<()> {
//!     let conn = Arc::new(MemoryConnection::new(DbType::Postgres, ParamStyle::Named));
//!     let cursor = Cursor::new(conn)?;
//!
//!     let table = Table::new(
//!         "people",
//!         vec![
//!             Column::builder("id").field("person_id").key(true),
//!             Column::builder("name")
//!                 .field("full_name")
//!                 .transform("strip")?
//!                 .nullable(false),
//!         ],
//!         cursor,
//!     )?;
//!
//!     let rows = vec![Record::from_pairs([
//!         ("person_id", Value::Int(1)),
//!         ("full_name", Value::Text("  Aang  ".into())),
//!     ])];
//!
//!     let mut surge = Surge::new(table).with_batch_size(500);
//!     let progress = surge.insert(rows).await?;
//!     println!("inserted {} rows", progress.inserted);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod core;
pub mod cursor;
pub mod dialect;
pub mod drivers;
pub mod error;
pub mod etl;

// Re-exports for convenient access
pub use crate::config::{ColumnDef, TableDef};
pub use crate::core::{
    normalize_name, quote_identifier, validate_identifier, Record, Schema, Value,
};
pub use crate::cursor::{Cursor, PreparedStatement};
pub use crate::dialect::{translate, Capabilities, DbType, MergeFlavor, ParamStyle, Params};
pub use crate::drivers::{DriverConnection, DriverCursor, MemoryConnection};
pub use crate::error::{DatabaseErrorKind, EtlError, Result};
pub use crate::etl::{
    CacheMode, Column, ColumnBuilder, Counts, DbExpr, Entity, EntityManager, EntityStatus,
    ErrorPolicy, Lookup, LookupSpec, Operation, Progress, Surge, Table, TransactionMode,
    Transform, Validate,
};

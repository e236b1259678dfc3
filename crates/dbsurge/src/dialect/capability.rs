//! Per-database capability table for upsert/merge strategy selection.
//!
//! The Surge driver consults this once per run to decide how a MERGE is
//! executed: a single batchable upsert statement, a native MERGE fed
//! from a staging table, or a delete-then-insert fallback.

use crate::core::identifier::quote_identifier;
use crate::core::record::normalize_name;
use crate::error::{EtlError, Result};

/// Database engines the DML generator knows how to address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DbType {
    Postgres,
    Mysql,
    Oracle,
    SqlServer,
    Sqlite,
}

impl DbType {
    /// Parse a database type string as drivers report it.
    ///
    /// # Errors
    ///
    /// Returns `EtlError::Config` for unknown database types.
    pub fn parse(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" | "pg" | "redshift" => Ok(DbType::Postgres),
            "mysql" | "mariadb" => Ok(DbType::Mysql),
            "oracle" => Ok(DbType::Oracle),
            "sqlserver" | "mssql" | "sql_server" => Ok(DbType::SqlServer),
            "sqlite" | "sqlite3" => Ok(DbType::Sqlite),
            other => Err(EtlError::Config(format!(
                "unknown database type: {other:?}"
            ))),
        }
    }

    /// Short identifier string.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            DbType::Postgres => "postgres",
            DbType::Mysql => "mysql",
            DbType::Oracle => "oracle",
            DbType::SqlServer => "sqlserver",
            DbType::Sqlite => "sqlite",
        }
    }

    /// Default capabilities for this engine.
    #[must_use]
    pub fn default_capabilities(self) -> Capabilities {
        let merge = match self {
            DbType::Postgres | DbType::Mysql | DbType::Sqlite => MergeFlavor::Upsert,
            DbType::Oracle | DbType::SqlServer => MergeFlavor::Statement,
        };
        Capabilities { merge }
    }
}

impl std::fmt::Display for DbType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// How a database expresses "insert or update on key match".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeFlavor {
    /// Single-statement upsert (`ON CONFLICT` / `ON DUPLICATE KEY`),
    /// batchable through `executemany`.
    Upsert,
    /// Native `MERGE` statement; bulk runs stage rows through a temp
    /// table.
    Statement,
    /// No upsert support: delete by key then insert.
    DeleteInsert,
}

/// Capabilities a connection declares for the DML generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub merge: MergeFlavor,
}

/// Derive a session temp-table name for a target table.
///
/// SQL Server gets the `#` prefix that scopes the table to the session;
/// elsewhere a `tmp_` prefix on the sanitized target name is used.
#[must_use]
pub fn temp_table_name(db: DbType, target: &str) -> String {
    let base = normalize_name(target, 0);
    match db {
        DbType::SqlServer => format!("#tmp_{base}"),
        _ => format!("tmp_{base}"),
    }
}

/// DDL that creates an empty temp table mirroring the target's columns.
///
/// `CREATE ... AS SELECT ... WHERE 1 = 0` copies column types from the
/// target without the core having to track them.
#[must_use]
pub fn create_temp_table_sql(db: DbType, temp: &str, target: &str, columns: &[String]) -> String {
    let col_list = columns
        .iter()
        .map(|c| quote_identifier(c))
        .collect::<Vec<_>>()
        .join(", ");
    let target = quote_identifier(target);
    match db {
        DbType::SqlServer => format!(
            "SELECT {col_list} INTO {temp} FROM {target} WHERE 1 = 0"
        ),
        DbType::Oracle => format!(
            "CREATE GLOBAL TEMPORARY TABLE {temp} ON COMMIT PRESERVE ROWS AS SELECT {col_list} FROM {target} WHERE 1 = 0"
        ),
        _ => format!(
            "CREATE TEMPORARY TABLE {temp} AS SELECT {col_list} FROM {target} WHERE 1 = 0"
        ),
    }
}

/// Statement that empties the temp table between batches.
#[must_use]
pub fn truncate_temp_table_sql(temp: &str) -> String {
    format!("TRUNCATE TABLE {temp}")
}

/// Statement that drops the temp table at end of run.
#[must_use]
pub fn drop_temp_table_sql(db: DbType, temp: &str) -> String {
    match db {
        DbType::Oracle | DbType::SqlServer => format!("DROP TABLE {temp}"),
        _ => format!("DROP TABLE IF EXISTS {temp}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_db_type_parse() {
        assert_eq!(DbType::parse("postgres").unwrap(), DbType::Postgres);
        assert_eq!(DbType::parse("PostgreSQL").unwrap(), DbType::Postgres);
        assert_eq!(DbType::parse("mariadb").unwrap(), DbType::Mysql);
        assert_eq!(DbType::parse("mssql").unwrap(), DbType::SqlServer);
        assert!(DbType::parse("dbase").is_err());
    }

    #[test]
    fn test_default_merge_flavors() {
        assert_eq!(
            DbType::Postgres.default_capabilities().merge,
            MergeFlavor::Upsert
        );
        assert_eq!(
            DbType::SqlServer.default_capabilities().merge,
            MergeFlavor::Statement
        );
    }

    #[test]
    fn test_temp_table_names() {
        assert_eq!(temp_table_name(DbType::Postgres, "staging.Users"), "tmp_staging_users");
        assert_eq!(temp_table_name(DbType::SqlServer, "Users"), "#tmp_users");
    }

    #[test]
    fn test_create_temp_sql_shapes() {
        let cols = vec!["id".to_string(), "v".to_string()];
        let pg = create_temp_table_sql(DbType::Postgres, "tmp_t", "t", &cols);
        assert!(pg.starts_with("CREATE TEMPORARY TABLE tmp_t AS SELECT"));
        assert!(pg.ends_with("WHERE 1 = 0"));

        let ms = create_temp_table_sql(DbType::SqlServer, "#tmp_t", "t", &cols);
        assert!(ms.starts_with("SELECT id, v INTO #tmp_t"));

        let ora = create_temp_table_sql(DbType::Oracle, "tmp_t", "t", &cols);
        assert!(ora.contains("GLOBAL TEMPORARY"));
        assert!(ora.contains("ON COMMIT PRESERVE ROWS"));
    }

    #[test]
    fn test_drop_temp_sql() {
        assert_eq!(
            drop_temp_table_sql(DbType::Postgres, "tmp_t"),
            "DROP TABLE IF EXISTS tmp_t"
        );
        assert_eq!(
            drop_temp_table_sql(DbType::Oracle, "tmp_t"),
            "DROP TABLE tmp_t"
        );
    }
}

//! Cached reference-table lookups and validations.
//!
//! A [`Lookup`] wraps a reference query as a reusable transform: probe a
//! table by key columns, return configured columns. Three caching
//! policies trade memory for round-trips. A [`Validate`] is the
//! degenerate form that only checks existence, warning on misses.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::core::identifier::{quote_identifier, validate_identifier};
use crate::core::record::{Record, Schema};
use crate::core::value::Value;
use crate::cursor::{Cursor, PreparedStatement};
use crate::dialect::Params;
use crate::drivers::DriverConnection;
use crate::error::{EtlError, Result};

/// Cache policy for a lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheMode {
    /// Materialize the whole reference table on first use; every call
    /// after that is a map hit. Not for tables larger than working-set
    /// memory.
    Preload,
    /// Cache individual keys as they are first probed.
    #[default]
    Lazy,
    /// Query on every call.
    None,
}

impl CacheMode {
    /// Parse a cache mode from shorthand text.
    ///
    /// # Errors
    ///
    /// Returns `EtlError::Config` for unknown modes.
    pub fn parse(text: &str) -> Result<Self> {
        match text.to_ascii_lowercase().as_str() {
            "preload" => Ok(CacheMode::Preload),
            "lazy" => Ok(CacheMode::Lazy),
            "none" | "no_cache" => Ok(CacheMode::None),
            other => Err(EtlError::Config(format!("unknown cache mode: {other:?}"))),
        }
    }
}

/// Parsed-but-unbound lookup configuration.
///
/// Shorthand strings parse to a spec at descriptor construction; the
/// spec binds to a fresh cursor when the owning table is built.
#[derive(Debug, Clone)]
pub struct LookupSpec {
    pub table: String,
    pub keys: Vec<String>,
    pub returns: Vec<String>,
    pub mode: CacheMode,
}

impl LookupSpec {
    /// Parse `lookup:<table>:<keys>:<returns>[:<cache>]`.
    pub fn parse(shorthand: &str) -> Result<Self> {
        let parts: Vec<&str> = shorthand.split(':').collect();
        if parts.len() < 4 || parts.len() > 5 || parts[0] != "lookup" {
            return Err(EtlError::Config(format!(
                "invalid lookup shorthand: {shorthand:?} (expected lookup:<table>:<keys>:<returns>[:<cache>])"
            )));
        }
        let mode = match parts.get(4) {
            Some(text) => CacheMode::parse(text)?,
            None => CacheMode::default(),
        };
        Self::build(parts[1], parts[2], parts[3], mode)
    }

    /// Parse `validate:<table>:<keys>[:<cache>]`.
    pub fn parse_validate(shorthand: &str) -> Result<Self> {
        let parts: Vec<&str> = shorthand.split(':').collect();
        if parts.len() < 3 || parts.len() > 4 || parts[0] != "validate" {
            return Err(EtlError::Config(format!(
                "invalid validate shorthand: {shorthand:?} (expected validate:<table>:<keys>[:<cache>])"
            )));
        }
        let mode = match parts.get(3) {
            Some(text) => CacheMode::parse(text)?,
            None => CacheMode::default(),
        };
        // Return columns are ignored by validation; probing the keys is
        // enough to establish existence.
        Self::build(parts[1], parts[2], parts[2], mode)
    }

    fn build(table: &str, keys: &str, returns: &str, mode: CacheMode) -> Result<Self> {
        let split = |s: &str| -> Vec<String> {
            s.split(',')
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect()
        };
        let spec = LookupSpec {
            table: table.to_string(),
            keys: split(keys),
            returns: split(returns),
            mode,
        };
        if spec.keys.is_empty() || spec.returns.is_empty() {
            return Err(EtlError::Config(format!(
                "lookup on {table:?} needs at least one key and one return column"
            )));
        }
        validate_identifier(&spec.table)?;
        for col in spec.keys.iter().chain(spec.returns.iter()) {
            validate_identifier(col)?;
        }
        Ok(spec)
    }

    /// Bind the spec to a connection, opening the lookup's own cursor.
    pub fn bind(self, conn: Arc<dyn DriverConnection>) -> Result<Lookup> {
        Lookup::new(conn, self)
    }
}

/// A reference-table lookup usable as a column transform.
///
/// Single configured return column → scalar value; several → the row as
/// a record (or a list value on the transform path); no match → null.
pub struct Lookup {
    spec: LookupSpec,
    conn: Arc<dyn DriverConnection>,
    probe: PreparedStatement,
    cache: HashMap<Vec<String>, Option<Vec<Value>>>,
    return_schema: Arc<Schema>,
    preloaded: bool,
}

impl Lookup {
    /// Build a lookup from a spec, opening its own probe cursor.
    pub fn new(conn: Arc<dyn DriverConnection>, spec: LookupSpec) -> Result<Self> {
        let conditions = spec
            .keys
            .iter()
            .map(|k| format!("{} = :{}", quote_identifier(k), k))
            .collect::<Vec<_>>()
            .join(" AND ");
        let returns = spec
            .returns
            .iter()
            .map(|c| quote_identifier(c))
            .collect::<Vec<_>>()
            .join(", ");
        let probe_sql = format!(
            "SELECT {returns} FROM {} WHERE {conditions}",
            quote_identifier(&spec.table)
        );
        let probe = PreparedStatement::new(Arc::clone(&conn), &probe_sql)?;
        let return_schema = Schema::new(spec.returns.iter().cloned());
        Ok(Lookup {
            spec,
            conn,
            probe,
            cache: HashMap::new(),
            return_schema,
            preloaded: false,
        })
    }

    /// The reference table name.
    #[must_use]
    pub fn table(&self) -> &str {
        &self.spec.table
    }

    /// Key column names.
    #[must_use]
    pub fn keys(&self) -> &[String] {
        &self.spec.keys
    }

    /// Materialize the full reference table into the cache.
    ///
    /// Runs exactly once; later calls are no-ops. Invoked automatically
    /// on the first lookup when the mode is [`CacheMode::Preload`].
    pub async fn preload(&mut self) -> Result<()> {
        if self.preloaded {
            return Ok(());
        }
        let keys = self
            .spec
            .keys
            .iter()
            .map(|c| quote_identifier(c))
            .collect::<Vec<_>>()
            .join(", ");
        let returns = self
            .spec
            .returns
            .iter()
            .map(|c| quote_identifier(c))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT {keys}, {returns} FROM {}",
            quote_identifier(&self.spec.table)
        );

        let mut cursor = Cursor::new(Arc::clone(&self.conn))?;
        cursor.execute(&sql, Params::None).await?;
        let key_count = self.spec.keys.len();
        let mut loaded = 0usize;
        while let Some(row) = cursor.fetch_one().await? {
            let values = row.values();
            let key: Vec<String> = values[..key_count].iter().map(Value::to_text).collect();
            // Null keys cannot be probed; skip them.
            if values[..key_count].iter().any(Value::is_null) {
                continue;
            }
            self.cache.insert(key, Some(values[key_count..].to_vec()));
            loaded += 1;
        }
        self.preloaded = true;
        debug!(table = %self.spec.table, rows = loaded, "lookup cache preloaded");
        Ok(())
    }

    /// Probe by key values, honoring the cache policy.
    ///
    /// Returns the matching row over the return columns, or `None`.
    pub async fn lookup(&mut self, key: &[Value]) -> Result<Option<Record>> {
        let row = self.fetch(key).await?;
        match row {
            Some(values) => Ok(Some(Record::new(
                Arc::clone(&self.return_schema),
                values,
            )?)),
            None => Ok(None),
        }
    }

    /// Transform entry point taking the sourced column value.
    ///
    /// A single key column accepts a scalar; several key columns expect
    /// a list value of matching arity (from a multi-field source).
    pub async fn resolve_value(&mut self, input: &Value) -> Result<Value> {
        if input.is_null() {
            return Ok(Value::Null);
        }
        let key: Vec<Value> = match input {
            Value::List(items) => items.clone(),
            other => vec![other.clone()],
        };
        if key.len() != self.spec.keys.len() {
            return Err(EtlError::lookup(
                &self.spec.table,
                format!(
                    "expected {} key value(s), got {}",
                    self.spec.keys.len(),
                    key.len()
                ),
            ));
        }
        self.resolve(&key).await
    }

    /// Transform entry point taking the whole source record.
    ///
    /// # Errors
    ///
    /// Fails when the record lacks any of the lookup's key columns,
    /// naming the table and the missing keys.
    pub async fn resolve_record(&mut self, record: &Record) -> Result<Value> {
        let missing: Vec<&String> = self
            .spec
            .keys
            .iter()
            .filter(|k| !record.contains_key(k))
            .collect();
        if !missing.is_empty() {
            return Err(EtlError::lookup(
                &self.spec.table,
                format!("record is missing key columns {missing:?}"),
            ));
        }
        let key: Vec<Value> = self
            .spec
            .keys
            .iter()
            .map(|k| record[k.as_str()].clone())
            .collect();
        if key.iter().all(Value::is_null) {
            return Ok(Value::Null);
        }
        self.resolve(&key).await
    }

    async fn resolve(&mut self, key: &[Value]) -> Result<Value> {
        match self.fetch(key).await? {
            None => Ok(Value::Null),
            Some(values) => {
                if values.len() == 1 {
                    Ok(values.into_iter().next().unwrap())
                } else {
                    Ok(Value::List(values))
                }
            }
        }
    }

    async fn fetch(&mut self, key: &[Value]) -> Result<Option<Vec<Value>>> {
        if self.spec.mode == CacheMode::Preload {
            self.preload().await?;
        }
        let cache_key: Vec<String> = key.iter().map(Value::to_text).collect();

        match self.spec.mode {
            CacheMode::Preload => Ok(self.cache.get(&cache_key).cloned().flatten()),
            CacheMode::Lazy => {
                if let Some(hit) = self.cache.get(&cache_key) {
                    return Ok(hit.clone());
                }
                let row = self.probe_one(key).await?;
                self.cache.insert(cache_key, row.clone());
                Ok(row)
            }
            CacheMode::None => self.probe_one(key).await,
        }
    }

    async fn probe_one(&mut self, key: &[Value]) -> Result<Option<Vec<Value>>> {
        let payload: HashMap<String, Value> = self
            .spec
            .keys
            .iter()
            .cloned()
            .zip(key.iter().cloned())
            .collect();
        match self.probe.query_one(&payload).await? {
            Some(record) => Ok(Some(record.values().to_vec())),
            None => Ok(None),
        }
    }
}

impl std::fmt::Debug for Lookup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lookup")
            .field("table", &self.spec.table)
            .field("keys", &self.spec.keys)
            .field("returns", &self.spec.returns)
            .field("mode", &self.spec.mode)
            .field("cached", &self.cache.len())
            .finish()
    }
}

/// Existence check against a reference table.
///
/// Returns its input unchanged; a miss is recorded as a warning, never
/// an error.
pub struct Validate {
    lookup: Lookup,
    warnings: usize,
}

impl Validate {
    /// Build a validation from a spec bound to a connection.
    pub fn new(conn: Arc<dyn DriverConnection>, spec: LookupSpec) -> Result<Self> {
        Ok(Validate {
            lookup: Lookup::new(conn, spec)?,
            warnings: 0,
        })
    }

    /// Number of misses observed so far.
    #[must_use]
    pub fn warnings(&self) -> usize {
        self.warnings
    }

    /// The reference table name.
    #[must_use]
    pub fn table(&self) -> &str {
        self.lookup.table()
    }

    /// Validate a sourced value; null passes through unchecked.
    pub async fn check_value(&mut self, input: &Value) -> Result<Value> {
        if input.is_null() {
            return Ok(Value::Null);
        }
        let found = !self.lookup.resolve_value(input).await?.is_null();
        if !found {
            self.warnings += 1;
            warn!(
                table = %self.lookup.table(),
                value = %input,
                "validation miss"
            );
        }
        Ok(input.clone())
    }

    /// Validate key columns read from the whole record.
    pub async fn check_record(&mut self, record: &Record) -> Result<Value> {
        let result = self.lookup.resolve_record(record).await?;
        let key = record[self.lookup.keys()[0].as_str()].clone();
        if result.is_null() {
            self.warnings += 1;
            warn!(table = %self.lookup.table(), "validation miss");
        }
        Ok(key)
    }
}

impl std::fmt::Debug for Validate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Validate")
            .field("lookup", &self.lookup)
            .field("warnings", &self.warnings)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::{DbType, ParamStyle};
    use crate::drivers::MemoryConnection;

    fn states_conn() -> (MemoryConnection, Arc<dyn DriverConnection>) {
        let conn = MemoryConnection::new(DbType::Postgres, ParamStyle::Named);
        conn.script_query(
            "code FROM states WHERE",
            ["code"],
            vec![vec![Value::Text("OH".into())]],
        );
        conn.script_query(
            "code FROM states",
            ["name", "code"],
            vec![
                vec![Value::Text("Ohio".into()), Value::Text("OH".into())],
                vec![Value::Text("Iowa".into()), Value::Text("IA".into())],
                vec![Value::Null, Value::Text("XX".into())],
            ],
        );
        let shared: Arc<dyn DriverConnection> = Arc::new(conn.clone());
        (conn, shared)
    }

    #[test]
    fn test_spec_parsing() {
        let spec = LookupSpec::parse("lookup:states:name:code:preload").unwrap();
        assert_eq!(spec.table, "states");
        assert_eq!(spec.keys, vec!["name"]);
        assert_eq!(spec.returns, vec!["code"]);
        assert_eq!(spec.mode, CacheMode::Preload);

        let spec = LookupSpec::parse("lookup:geo:country,region:code").unwrap();
        assert_eq!(spec.keys, vec!["country", "region"]);
        assert_eq!(spec.mode, CacheMode::Lazy);

        let spec = LookupSpec::parse_validate("validate:regions:name").unwrap();
        assert_eq!(spec.returns, vec!["name"]);

        assert!(LookupSpec::parse("lookup:states").is_err());
        assert!(LookupSpec::parse("lookup:states:name:code:sometimes").is_err());
        assert!(LookupSpec::parse("lookup:bad table:k:r").is_err());
    }

    #[tokio::test]
    async fn test_preload_executes_one_select() {
        let (handle, conn) = states_conn();
        let spec = LookupSpec::parse("lookup:states:name:code:preload").unwrap();
        let mut lookup = spec.bind(conn).unwrap();

        for _ in 0..100 {
            let v = lookup
                .resolve_value(&Value::Text("Ohio".into()))
                .await
                .unwrap();
            assert_eq!(v, Value::Text("OH".into()));
        }
        let miss = lookup
            .resolve_value(&Value::Text("Atlantis".into()))
            .await
            .unwrap();
        assert!(miss.is_null());

        // One SELECT total, no per-key probes.
        assert_eq!(handle.execute_count(), 1);
        assert!(handle.executed()[0].sql.starts_with("SELECT name, code FROM states"));
    }

    #[tokio::test]
    async fn test_lazy_caches_first_probe() {
        let (handle, conn) = states_conn();
        let spec = LookupSpec::parse("lookup:states:name:code:lazy").unwrap();
        let mut lookup = spec.bind(conn).unwrap();

        for _ in 0..5 {
            lookup
                .resolve_value(&Value::Text("Ohio".into()))
                .await
                .unwrap();
        }
        assert_eq!(handle.execute_count(), 1);

        // A different key probes again.
        lookup
            .resolve_value(&Value::Text("Iowa".into()))
            .await
            .unwrap();
        assert_eq!(handle.execute_count(), 2);
    }

    #[tokio::test]
    async fn test_no_cache_probes_every_call() {
        let (handle, conn) = states_conn();
        let spec = LookupSpec::parse("lookup:states:name:code:none").unwrap();
        let mut lookup = spec.bind(conn).unwrap();
        for _ in 0..3 {
            lookup
                .resolve_value(&Value::Text("Ohio".into()))
                .await
                .unwrap();
        }
        assert_eq!(handle.execute_count(), 3);
    }

    #[tokio::test]
    async fn test_record_probe_missing_keys() {
        let (_, conn) = states_conn();
        let spec = LookupSpec::parse("lookup:states:name:code").unwrap();
        let mut lookup = spec.bind(conn).unwrap();

        let record = Record::from_pairs([("city", Value::Text("Columbus".into()))]);
        let err = lookup.resolve_record(&record).await.unwrap_err();
        let text = err.to_string();
        assert!(text.contains("states"));
        assert!(text.contains("name"));
    }

    #[tokio::test]
    async fn test_validate_returns_input_and_warns() {
        let conn = MemoryConnection::new(DbType::Postgres, ParamStyle::Named);
        conn.script_query(
            "code, code FROM states",
            ["code", "code"],
            vec![
                vec![Value::Text("OH".into()), Value::Text("OH".into())],
                vec![Value::Text("IA".into()), Value::Text("IA".into())],
            ],
        );
        let conn: Arc<dyn DriverConnection> = Arc::new(conn);
        let spec = LookupSpec::parse_validate("validate:states:code:preload").unwrap();
        let mut validate = Validate::new(conn, spec).unwrap();

        let ok = validate
            .check_value(&Value::Text("OH".into()))
            .await
            .unwrap();
        assert_eq!(ok, Value::Text("OH".into()));
        assert_eq!(validate.warnings(), 0);

        let miss = validate
            .check_value(&Value::Text("ZZ".into()))
            .await
            .unwrap();
        assert_eq!(miss, Value::Text("ZZ".into()));
        assert_eq!(validate.warnings(), 1);

        let null = validate.check_value(&Value::Null).await.unwrap();
        assert!(null.is_null());
        assert_eq!(validate.warnings(), 1);
    }

    #[tokio::test]
    async fn test_multi_return_yields_list() {
        let conn = MemoryConnection::new(DbType::Postgres, ParamStyle::Named);
        conn.script_query(
            "FROM states",
            ["name", "code", "capital"],
            vec![vec![
                Value::Text("Ohio".into()),
                Value::Text("OH".into()),
                Value::Text("Columbus".into()),
            ]],
        );
        let conn: Arc<dyn DriverConnection> = Arc::new(conn);
        let spec = LookupSpec::parse("lookup:states:name:code,capital:preload").unwrap();
        let mut lookup = spec.bind(conn).unwrap();

        let v = lookup
            .resolve_value(&Value::Text("Ohio".into()))
            .await
            .unwrap();
        assert_eq!(
            v,
            Value::List(vec![
                Value::Text("OH".into()),
                Value::Text("Columbus".into())
            ])
        );

        let row = lookup
            .lookup(&[Value::Text("Ohio".into())])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row["capital"], Value::Text("Columbus".into()));
    }
}

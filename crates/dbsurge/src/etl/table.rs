//! Stateful table pipeline: column resolution, readiness tracking, DML
//! generation, and single-row execution.
//!
//! A [`Table`] owns its cursor, its column descriptors, the current-row
//! values produced by [`set_values`](Table::set_values), a readiness bit
//! per operation, and the operation counters that form the user-visible
//! failure surface for batch runs. DML templates are generated in the
//! canonical named style, translated once for the driver, and cached.

use std::collections::{HashMap, HashSet};

use tracing::{debug, warn};

use crate::core::identifier::{quote_identifier, validate_identifier};
use crate::core::record::Record;
use crate::core::value::Value;
use crate::cursor::Cursor;
use crate::dialect::{translate, MergeFlavor, Params, TranslatedQuery};
use crate::error::{EtlError, Result};
use crate::etl::column::{Column, ColumnBuilder, DbExpr, Operation};

/// Default string values treated as SQL null by the resolver.
pub const DEFAULT_NULL_VALUES: &[&str] = &["", "NULL", "<null>", "\\N"];

/// Operation counters: the stable, user-visible failure surface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counts {
    pub insert: u64,
    pub update: u64,
    pub delete: u64,
    pub merge: u64,
    pub select: u64,
    /// Rows whose requirements were not met for the attempted op.
    pub incomplete: u64,
    /// Transform failures and isolated per-row database errors.
    pub error: u64,
}

impl Counts {
    /// Counter for a DML operation.
    #[must_use]
    pub fn get(&self, op: Operation) -> u64 {
        match op {
            Operation::Insert => self.insert,
            Operation::Update => self.update,
            Operation::Delete => self.delete,
            Operation::Merge => self.merge,
            Operation::Select => self.select,
        }
    }

    pub(crate) fn add(&mut self, op: Operation, n: u64) {
        match op {
            Operation::Insert => self.insert += n,
            Operation::Update => self.update += n,
            Operation::Delete => self.delete += n,
            Operation::Merge => self.merge += n,
            Operation::Select => self.select += n,
        }
    }
}

/// A named target table as a reusable transformation pipeline.
#[derive(Debug)]
pub struct Table {
    name: String,
    columns: Vec<Column>,
    cursor: Cursor,
    null_values: HashSet<String>,
    values: HashMap<String, Value>,
    readiness: u8,
    counts: Counts,
    records: u64,
    update_excludes: HashSet<String>,
    plans: HashMap<Operation, TranslatedQuery>,
}

impl Table {
    /// Build a table pipeline from column builders, binding lookups and
    /// validations to the table's connection.
    ///
    /// # Errors
    ///
    /// Invalid identifiers, duplicate column names, unknown shorthands,
    /// and malformed db expressions all fail here.
    pub fn new(
        name: impl Into<String>,
        columns: Vec<ColumnBuilder>,
        cursor: Cursor,
    ) -> Result<Self> {
        let name = name.into();
        validate_identifier(&name)?;

        let conn = std::sync::Arc::clone(cursor.connection());
        let mut built = Vec::with_capacity(columns.len());
        let mut seen = HashSet::new();
        let mut seen_binds = HashSet::new();
        for builder in columns {
            let column = builder.build(&conn)?;
            if !seen.insert(column.name().to_string()) {
                return Err(EtlError::Config(format!(
                    "duplicate column {:?} on table {name:?}",
                    column.name()
                )));
            }
            if !seen_binds.insert(column.bind_name().to_string()) {
                return Err(EtlError::Config(format!(
                    "columns on table {name:?} collide on bind name {:?}",
                    column.bind_name()
                )));
            }
            built.push(column);
        }
        if built.is_empty() {
            return Err(EtlError::Config(format!(
                "table {name:?} has no columns"
            )));
        }

        let mut table = Table {
            name,
            columns: built,
            cursor,
            null_values: DEFAULT_NULL_VALUES.iter().map(ToString::to_string).collect(),
            values: HashMap::new(),
            readiness: 0,
            counts: Counts::default(),
            records: 0,
            update_excludes: HashSet::new(),
            plans: HashMap::new(),
        };
        table.refresh_readiness();
        Ok(table)
    }

    /// Replace the null-sentinel set.
    #[must_use]
    pub fn with_null_values<S: Into<String>>(
        mut self,
        values: impl IntoIterator<Item = S>,
    ) -> Self {
        self.null_values = values.into_iter().map(Into::into).collect();
        self
    }

    /// Target table name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Column descriptors, in declaration order.
    #[must_use]
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Target column names, in declaration order.
    #[must_use]
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(Column::name).collect()
    }

    /// Key column names.
    #[must_use]
    pub fn key_columns(&self) -> Vec<&str> {
        self.columns
            .iter()
            .filter(|c| c.is_key())
            .map(Column::name)
            .collect()
    }

    /// Operation counters.
    #[must_use]
    pub fn counts(&self) -> &Counts {
        &self.counts
    }

    /// Number of records run through `set_values`.
    #[must_use]
    pub fn records(&self) -> u64 {
        self.records
    }

    /// Reset all counters.
    pub fn reset_counts(&mut self) {
        self.counts = Counts::default();
        self.records = 0;
    }

    /// Current resolved values, keyed by column name.
    #[must_use]
    pub fn values(&self) -> &HashMap<String, Value> {
        &self.values
    }

    /// Directly set a current value. Call
    /// [`refresh_readiness`](Self::refresh_readiness) when done.
    pub fn set_value(&mut self, column: &str, value: Value) {
        self.values.insert(column.to_string(), value);
    }

    /// The cursor this table executes through.
    #[must_use]
    pub fn cursor_mut(&mut self) -> &mut Cursor {
        &mut self.cursor
    }

    /// Borrow the cursor immutably.
    #[must_use]
    pub fn cursor(&self) -> &Cursor {
        &self.cursor
    }

    /// How the connected database expresses MERGE.
    #[must_use]
    pub fn merge_flavor(&self) -> MergeFlavor {
        self.cursor.connection().capabilities().merge
    }

    // -----------------------------------------------------------------
    // Value resolution
    // -----------------------------------------------------------------

    /// Run the resolver pipeline for every column against one source
    /// record, then recompute the readiness bitmap.
    ///
    /// A failing transform stores null for its column, increments the
    /// `error` counter, finishes the remaining columns, and surfaces
    /// the first failure; callers running under a `continue` policy
    /// count the row and move on.
    pub async fn set_values(&mut self, record: &Record) -> Result<()> {
        self.records += 1;
        if self.records == 1 {
            self.warn_missing_fields(record);
        }

        let mut new_values = HashMap::with_capacity(self.columns.len());
        let mut first_error = None;
        let null_values = &self.null_values;
        for column in &mut self.columns {
            match column.resolve(record, null_values).await {
                Ok(value) => {
                    new_values.insert(column.name().to_string(), value);
                }
                Err(e) => {
                    new_values.insert(column.name().to_string(), Value::Null);
                    self.counts.error += 1;
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }
        self.values = new_values;
        self.refresh_readiness();

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn warn_missing_fields(&self, record: &Record) {
        for column in &self.columns {
            for field in column.source().field_names() {
                if !record.contains_key(field) {
                    warn!(
                        table = %self.name,
                        column = column.name(),
                        field,
                        "source field not found in record"
                    );
                }
            }
        }
    }

    /// Recompute the readiness bitmap from the current values.
    pub fn refresh_readiness(&mut self) {
        let mut bits = 0u8;
        for op in Operation::ALL {
            let ready = self.columns.iter().all(|column| {
                let participation = column.participation(op);
                !participation.required
                    || self
                        .values
                        .get(column.name())
                        .is_some_and(|v| !v.is_null())
            });
            if ready {
                bits |= 1 << op.bit();
            }
        }
        self.readiness = bits;
    }

    /// O(1) readiness check for an operation.
    #[must_use]
    pub fn is_ready(&self, op: Operation) -> bool {
        self.readiness & (1 << op.bit()) != 0
    }

    /// Recompute (not the bitmap) whether requirements are met for an
    /// operation. Diagnostic path.
    #[must_use]
    pub fn reqs_met(&self, op: Operation) -> bool {
        self.reqs_missing(op).is_empty()
    }

    /// Required columns currently null or unset for an operation.
    #[must_use]
    pub fn reqs_missing(&self, op: Operation) -> Vec<String> {
        self.columns
            .iter()
            .filter(|c| c.participation(op).required)
            .filter(|c| {
                self.values
                    .get(c.name())
                    .map_or(true, Value::is_null)
            })
            .map(|c| c.name().to_string())
            .collect()
    }

    /// Exclude from updates every column whose source fields are not
    /// all present in `available_fields`, plus `no_update` columns.
    ///
    /// Invalidates cached UPDATE/MERGE templates.
    pub fn calc_update_excludes<S: AsRef<str>>(
        &mut self,
        available_fields: impl IntoIterator<Item = S>,
    ) {
        let available: HashSet<String> = available_fields
            .into_iter()
            .map(|s| s.as_ref().to_string())
            .collect();
        self.update_excludes = self
            .columns
            .iter()
            .filter(|c| {
                let fields = c.source().field_names();
                c.is_no_update()
                    || (!fields.is_empty()
                        && fields.iter().any(|f| !available.contains(*f)))
            })
            .map(|c| c.name().to_string())
            .collect();
        self.plans.remove(&Operation::Update);
        self.plans.remove(&Operation::Merge);
    }

    // -----------------------------------------------------------------
    // SQL generation
    // -----------------------------------------------------------------

    fn placeholder(column: &Column) -> String {
        let bind = format!(":{}", column.bind_name());
        match column.db_expr() {
            Some(expr) => expr.render(&bind),
            None => bind,
        }
    }

    fn join_list(parts: &[String]) -> String {
        if parts.len() > 4 {
            parts.join(",\n    ")
        } else {
            parts.join(", ")
        }
    }

    fn excluded_from_update(&self, column: &Column) -> bool {
        column.is_no_update() || self.update_excludes.contains(column.name())
    }

    fn require_keys(&self, op: Operation) -> Result<()> {
        if self.columns.iter().any(Column::is_key) {
            Ok(())
        } else {
            Err(EtlError::Config(format!(
                "cannot generate {op} SQL for table {}: no key columns defined",
                self.name
            )))
        }
    }

    fn insert_sql_for(&self, table_name: &str) -> String {
        let cols: Vec<String> = self
            .columns
            .iter()
            .map(|c| quote_identifier(c.name()))
            .collect();
        let exprs: Vec<String> = self.columns.iter().map(Self::placeholder).collect();
        format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote_identifier(table_name),
            Self::join_list(&cols),
            Self::join_list(&exprs),
        )
    }

    fn create_insert(&self) -> String {
        self.insert_sql_for(&self.name)
    }

    fn create_select(&self) -> Result<String> {
        self.require_keys(Operation::Select)?;
        let cols: Vec<String> = self
            .columns
            .iter()
            .map(|c| quote_identifier(c.name()))
            .collect();
        let conditions: Vec<String> = self
            .columns
            .iter()
            .filter(|c| c.is_key())
            .map(|c| format!("{} = {}", quote_identifier(c.name()), Self::placeholder(c)))
            .collect();
        Ok(format!(
            "SELECT {} FROM {} WHERE {}",
            Self::join_list(&cols),
            quote_identifier(&self.name),
            conditions.join(" AND "),
        ))
    }

    fn create_update(&self) -> Result<String> {
        self.require_keys(Operation::Update)?;
        let sets: Vec<String> = self
            .columns
            .iter()
            .filter(|c| !c.is_key() && !self.excluded_from_update(c))
            .map(|c| format!("{} = {}", quote_identifier(c.name()), Self::placeholder(c)))
            .collect();
        if sets.is_empty() {
            return Err(EtlError::Config(format!(
                "UPDATE on {} has no settable columns",
                self.name
            )));
        }
        let conditions: Vec<String> = self
            .columns
            .iter()
            .filter(|c| c.is_key())
            .map(|c| format!("{} = {}", quote_identifier(c.name()), Self::placeholder(c)))
            .collect();
        Ok(format!(
            "UPDATE {} SET {} WHERE {}",
            quote_identifier(&self.name),
            Self::join_list(&sets),
            conditions.join(" AND "),
        ))
    }

    fn create_delete(&self) -> Result<String> {
        self.require_keys(Operation::Delete)?;
        let conditions: Vec<String> = self
            .columns
            .iter()
            .filter(|c| c.is_key())
            .map(|c| format!("{} = {}", quote_identifier(c.name()), Self::placeholder(c)))
            .collect();
        Ok(format!(
            "DELETE FROM {} WHERE {}",
            quote_identifier(&self.name),
            conditions.join(" AND "),
        ))
    }

    /// Update-arm expression for upsert statements, referencing the
    /// proposed row through `source` (`EXCLUDED` / `new_vals`).
    fn upsert_assignment(column: &Column, source: &str) -> String {
        let ident = quote_identifier(column.name());
        let reference = format!("{source}.{ident}");
        match column.db_expr() {
            Some(DbExpr::Standalone(expr)) => format!("{ident} = {expr}"),
            Some(expr) => format!("{ident} = {}", expr.render(&reference)),
            None => format!("{ident} = {reference}"),
        }
    }

    fn create_merge(&self) -> Result<String> {
        self.require_keys(Operation::Merge)?;
        let flavor = self.merge_flavor();
        let db = self.cursor.db_type();
        match flavor {
            MergeFlavor::Upsert => self.create_upsert(db),
            MergeFlavor::Statement => Ok(self.create_merge_statement(MergeSource::Params)),
            MergeFlavor::DeleteInsert => Err(EtlError::Config(format!(
                "database {db} has no single-statement merge; use delete+insert execution"
            ))),
        }
    }

    fn create_upsert(&self, db: crate::dialect::DbType) -> Result<String> {
        use crate::dialect::DbType;

        let table = quote_identifier(&self.name);
        let cols: Vec<String> = self
            .columns
            .iter()
            .map(|c| quote_identifier(c.name()))
            .collect();
        let exprs: Vec<String> = self.columns.iter().map(Self::placeholder).collect();
        let update_cols: Vec<&Column> = self
            .columns
            .iter()
            .filter(|c| !c.is_key() && !self.excluded_from_update(c))
            .collect();

        match db {
            DbType::Mysql => {
                let assignments: Vec<String> = update_cols
                    .iter()
                    .map(|c| Self::upsert_assignment(c, "new_vals"))
                    .collect();
                Ok(format!(
                    "INSERT INTO {table} ({}) VALUES ({}) AS new_vals ON DUPLICATE KEY UPDATE {}",
                    Self::join_list(&cols),
                    Self::join_list(&exprs),
                    Self::join_list(&assignments),
                ))
            }
            _ => {
                let conflict: Vec<String> = self
                    .columns
                    .iter()
                    .filter(|c| c.is_key())
                    .map(|c| quote_identifier(c.name()))
                    .collect();
                let assignments: Vec<String> = update_cols
                    .iter()
                    .map(|c| Self::upsert_assignment(c, "EXCLUDED"))
                    .collect();
                Ok(format!(
                    "INSERT INTO {table} ({}) VALUES ({}) ON CONFLICT ({}) DO UPDATE SET {}",
                    Self::join_list(&cols),
                    Self::join_list(&exprs),
                    conflict.join(", "),
                    Self::join_list(&assignments),
                ))
            }
        }
    }

    fn create_merge_statement(&self, source: MergeSource<'_>) -> String {
        use crate::dialect::DbType;

        let db = self.cursor.db_type();
        let table = quote_identifier(&self.name);
        let quoted: Vec<String> = self
            .columns
            .iter()
            .map(|c| quote_identifier(c.name()))
            .collect();

        let using = match source {
            MergeSource::Params => match db {
                DbType::Oracle => {
                    let items: Vec<String> = self
                        .columns
                        .iter()
                        .map(|c| {
                            format!("{} AS {}", Self::placeholder(c), quote_identifier(c.name()))
                        })
                        .collect();
                    format!("(SELECT {} FROM dual) s", Self::join_list(&items))
                }
                DbType::SqlServer => {
                    let items: Vec<String> = self
                        .columns
                        .iter()
                        .map(|c| {
                            format!("{} AS {}", Self::placeholder(c), quote_identifier(c.name()))
                        })
                        .collect();
                    format!("(SELECT {}) AS s", Self::join_list(&items))
                }
                _ => {
                    let exprs: Vec<String> =
                        self.columns.iter().map(Self::placeholder).collect();
                    format!(
                        "(VALUES ({})) AS s ({})",
                        Self::join_list(&exprs),
                        quoted.join(", ")
                    )
                }
            },
            MergeSource::Table(temp) => format!("{temp} s"),
        };

        let on: Vec<String> = self
            .columns
            .iter()
            .filter(|c| c.is_key())
            .map(|c| {
                let ident = quote_identifier(c.name());
                format!("t.{ident} = s.{ident}")
            })
            .collect();
        let updates: Vec<String> = self
            .columns
            .iter()
            .filter(|c| !c.is_key() && !self.excluded_from_update(c))
            .map(|c| {
                let ident = quote_identifier(c.name());
                format!("t.{ident} = s.{ident}")
            })
            .collect();
        let insert_values: Vec<String> = quoted.iter().map(|c| format!("s.{c}")).collect();

        format!(
            "MERGE INTO {table} t USING {using} ON ({}) \
             WHEN MATCHED THEN UPDATE SET {} \
             WHEN NOT MATCHED THEN INSERT ({}) VALUES ({})",
            on.join(" AND "),
            Self::join_list(&updates),
            Self::join_list(&quoted),
            Self::join_list(&insert_values),
        )
    }

    /// Native MERGE reading from a staging table instead of parameters.
    ///
    /// Used by the bulk merge fallback; carries no bind parameters.
    pub fn merge_from_temp_sql(&mut self, temp_table: &str) -> Result<String> {
        self.require_keys(Operation::Merge)?;
        Ok(self.create_merge_statement(MergeSource::Table(temp_table)))
    }

    /// Translated INSERT targeting a staging table with this table's
    /// column list.
    pub fn temp_insert_plan(&self, temp_table: &str) -> Result<TranslatedQuery> {
        let sql = self.insert_sql_for(temp_table);
        translate(&sql, self.cursor.param_style())
    }

    fn plan(&mut self, op: Operation) -> Result<&TranslatedQuery> {
        if !self.plans.contains_key(&op) {
            let sql = match op {
                Operation::Insert => self.create_insert(),
                Operation::Select => self.create_select()?,
                Operation::Update => self.create_update()?,
                Operation::Delete => self.create_delete()?,
                Operation::Merge => self.create_merge()?,
            };
            debug!(table = %self.name, op = %op, sql = %sql, "generated DML");
            let translated = translate(&sql, self.cursor.param_style())?;
            self.plans.insert(op, translated);
        }
        Ok(&self.plans[&op])
    }

    /// The cached DML template for an operation, in the driver's style.
    pub fn sql(&mut self, op: Operation) -> Result<String> {
        Ok(self.plan(op)?.sql().to_string())
    }

    fn payload(&self) -> HashMap<String, Value> {
        self.columns
            .iter()
            .map(|c| {
                (
                    c.bind_name().to_string(),
                    self.values.get(c.name()).cloned().unwrap_or(Value::Null),
                )
            })
            .collect()
    }

    /// Bind the current values into the payload shape for an operation.
    pub fn bind_params(&mut self, op: Operation) -> Result<Params> {
        let payload = self.payload();
        Ok(self.plan(op)?.bind(&payload))
    }

    /// Bind the current values against an externally cached plan (bulk
    /// staging inserts).
    #[must_use]
    pub fn bind_into(&self, plan: &TranslatedQuery) -> Params {
        plan.bind(&self.payload())
    }

    /// Delete-then-insert pair applying a staged batch to the target,
    /// for databases with no single-statement merge.
    pub fn delete_insert_from_temp_sql(&self, temp_table: &str) -> Result<(String, String)> {
        self.require_keys(Operation::Merge)?;
        let target = quote_identifier(&self.name);
        let on: Vec<String> = self
            .columns
            .iter()
            .filter(|c| c.is_key())
            .map(|c| {
                let ident = quote_identifier(c.name());
                format!("t.{ident} = s.{ident}")
            })
            .collect();
        let cols: Vec<String> = self
            .columns
            .iter()
            .map(|c| quote_identifier(c.name()))
            .collect();
        let delete = format!(
            "DELETE FROM {target} t WHERE EXISTS (SELECT 1 FROM {temp_table} s WHERE {})",
            on.join(" AND ")
        );
        let insert = format!(
            "INSERT INTO {target} ({}) SELECT {} FROM {temp_table}",
            Self::join_list(&cols),
            Self::join_list(&cols),
        );
        Ok((delete, insert))
    }

    pub(crate) fn note_incomplete(&mut self) {
        self.counts.incomplete += 1;
    }

    pub(crate) fn note_success(&mut self, op: Operation, n: u64) {
        self.counts.add(op, n);
    }

    pub(crate) fn note_error(&mut self, n: u64) {
        self.counts.error += n;
    }

    // -----------------------------------------------------------------
    // Execution
    // -----------------------------------------------------------------

    /// Single-row DML with default policy: incomplete rows are counted,
    /// not raised.
    pub async fn execute(&mut self, op: Operation) -> Result<bool> {
        self.execute_with(op, false, false).await
    }

    /// Single-row DML.
    ///
    /// With `raise_error`, an incomplete row fails with a
    /// requirements-not-met error naming the missing columns; otherwise
    /// it increments `incomplete` and issues no SQL. `reqs_checked`
    /// skips the readiness test for callers that already did it.
    /// Returns whether SQL was issued.
    ///
    /// Database errors propagate; the op counter is not incremented for
    /// a failed statement.
    pub async fn execute_with(
        &mut self,
        op: Operation,
        raise_error: bool,
        reqs_checked: bool,
    ) -> Result<bool> {
        if !reqs_checked && !self.is_ready(op) {
            if raise_error {
                return Err(EtlError::Requirements {
                    table: self.name.clone(),
                    operation: op.name().to_string(),
                    missing: self.reqs_missing(op),
                });
            }
            self.counts.incomplete += 1;
            return Ok(false);
        }

        if op == Operation::Merge && self.merge_flavor() == MergeFlavor::DeleteInsert {
            let delete = self.bind_params(Operation::Delete)?;
            let delete_sql = self.sql(Operation::Delete)?;
            let insert = self.bind_params(Operation::Insert)?;
            let insert_sql = self.sql(Operation::Insert)?;
            self.cursor.execute_raw(&delete_sql, &delete).await?;
            self.cursor.execute_raw(&insert_sql, &insert).await?;
            self.counts.merge += 1;
            return Ok(true);
        }

        let params = self.bind_params(op)?;
        let sql = self.sql(op)?;
        self.cursor.execute_raw(&sql, &params).await?;
        self.counts.add(op, 1);
        Ok(true)
    }

    /// Execute the SELECT-by-key statement for the current key values
    /// and return the matching row, if any.
    pub async fn fetch(&mut self) -> Result<Option<Record>> {
        if !self.is_ready(Operation::Select) {
            return Err(EtlError::Requirements {
                table: self.name.clone(),
                operation: Operation::Select.name().to_string(),
                missing: self.reqs_missing(Operation::Select),
            });
        }
        let params = self.bind_params(Operation::Select)?;
        let sql = self.sql(Operation::Select)?;
        self.cursor.execute_raw(&sql, &params).await?;
        self.counts.select += 1;
        self.cursor.fetch_one().await
    }
}

/// Source feeding a native MERGE: bound parameters or a staging table.
enum MergeSource<'a> {
    Params,
    Table(&'a str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::{Capabilities, DbType, ParamStyle};
    use crate::drivers::{DriverConnection, MemoryConnection};
    use std::sync::Arc;

    fn build_table(conn: &MemoryConnection) -> Table {
        let shared: Arc<dyn DriverConnection> = Arc::new(conn.clone());
        let cursor = Cursor::new(shared).unwrap();
        Table::new(
            "people",
            vec![
                Column::builder("id").field("id").key(true),
                Column::builder("name").field("name").nullable(false),
                Column::builder("email").field("email"),
            ],
            cursor,
        )
        .unwrap()
    }

    fn named_conn() -> MemoryConnection {
        MemoryConnection::new(DbType::Postgres, ParamStyle::Named)
    }

    #[test]
    fn test_insert_sql_shape() {
        let conn = named_conn();
        let mut table = build_table(&conn);
        assert_eq!(
            table.sql(Operation::Insert).unwrap(),
            "INSERT INTO people (id, name, email) VALUES (:id, :name, :email)"
        );
    }

    #[test]
    fn test_update_delete_select_shapes() {
        let conn = named_conn();
        let mut table = build_table(&conn);
        assert_eq!(
            table.sql(Operation::Update).unwrap(),
            "UPDATE people SET name = :name, email = :email WHERE id = :id"
        );
        assert_eq!(
            table.sql(Operation::Delete).unwrap(),
            "DELETE FROM people WHERE id = :id"
        );
        assert_eq!(
            table.sql(Operation::Select).unwrap(),
            "SELECT id, name, email FROM people WHERE id = :id"
        );
    }

    #[test]
    fn test_db_expr_in_sql() {
        let conn = named_conn();
        let shared: Arc<dyn DriverConnection> = Arc::new(conn.clone());
        let cursor = Cursor::new(shared).unwrap();
        let mut table = Table::new(
            "audit",
            vec![
                Column::builder("id").field("id").key(true),
                Column::builder("payload").field("payload").db_expr("upper(#)"),
                Column::builder("loaded_at").db_expr("now()"),
            ],
            cursor,
        )
        .unwrap();
        assert_eq!(
            table.sql(Operation::Insert).unwrap(),
            "INSERT INTO audit (id, payload, loaded_at) VALUES (:id, upper(:payload), now())"
        );
        // The standalone expression binds no parameter.
        let plan_names: Vec<String> = {
            table.sql(Operation::Insert).unwrap();
            table.plans[&Operation::Insert].names().to_vec()
        };
        assert_eq!(plan_names, vec!["id", "payload"]);
    }

    #[test]
    fn test_positional_translation_of_dml() {
        let conn = MemoryConnection::new(DbType::Postgres, ParamStyle::Qmark);
        let mut table = build_table(&conn);
        assert_eq!(
            table.sql(Operation::Insert).unwrap(),
            "INSERT INTO people (id, name, email) VALUES (?, ?, ?)"
        );
    }

    #[test]
    fn test_no_update_excluded_from_set_clause() {
        let conn = named_conn();
        let shared: Arc<dyn DriverConnection> = Arc::new(conn.clone());
        let cursor = Cursor::new(shared).unwrap();
        let mut table = Table::new(
            "t",
            vec![
                Column::builder("id").field("id").key(true),
                Column::builder("v").field("v"),
                Column::builder("created").field("created").no_update(true),
            ],
            cursor,
        )
        .unwrap();
        let sql = table.sql(Operation::Update).unwrap();
        assert!(!sql.contains("created ="));
        assert!(sql.contains("v = :v"));
    }

    #[test]
    fn test_calc_update_excludes() {
        let conn = named_conn();
        let mut table = build_table(&conn);
        table.calc_update_excludes(["id", "name"]);
        let sql = table.sql(Operation::Update).unwrap();
        assert!(!sql.contains("email"));
        assert!(sql.contains("name = :name"));
    }

    #[test]
    fn test_merge_upsert_postgres() {
        let conn = named_conn();
        let mut table = build_table(&conn);
        let sql = table.sql(Operation::Merge).unwrap();
        assert!(sql.starts_with("INSERT INTO people (id, name, email) VALUES"));
        assert!(sql.contains("ON CONFLICT (id) DO UPDATE SET"));
        assert!(sql.contains("name = EXCLUDED.name"));
    }

    #[test]
    fn test_merge_upsert_mysql() {
        let conn = MemoryConnection::new(DbType::Mysql, ParamStyle::Format);
        let mut table = build_table(&conn);
        let sql = table.sql(Operation::Merge).unwrap();
        assert!(sql.contains("AS new_vals ON DUPLICATE KEY UPDATE"));
        assert!(sql.contains("name = new_vals.name"));
        assert!(sql.contains("VALUES (%s, %s, %s)"));
    }

    #[test]
    fn test_merge_statement_sqlserver() {
        let conn = MemoryConnection::new(DbType::SqlServer, ParamStyle::Qmark);
        let mut table = build_table(&conn);
        let sql = table.sql(Operation::Merge).unwrap();
        assert!(sql.starts_with("MERGE INTO people t USING (SELECT ? AS id"));
        assert!(sql.contains("ON (t.id = s.id)"));
        assert!(sql.contains("WHEN MATCHED THEN UPDATE SET t.name = s.name"));
        assert!(sql.contains("WHEN NOT MATCHED THEN INSERT (id, name, email)"));
    }

    #[test]
    fn test_merge_from_temp() {
        let conn = MemoryConnection::new(DbType::SqlServer, ParamStyle::Qmark);
        let mut table = build_table(&conn);
        let sql = table.merge_from_temp_sql("#tmp_people").unwrap();
        assert!(sql.contains("USING #tmp_people s"));
        assert!(!sql.contains('?'));
    }

    #[test]
    fn test_keyless_table_rejects_keyed_ops() {
        let conn = named_conn();
        let shared: Arc<dyn DriverConnection> = Arc::new(conn.clone());
        let cursor = Cursor::new(shared).unwrap();
        let mut table = Table::new(
            "log",
            vec![Column::builder("message").field("message")],
            cursor,
        )
        .unwrap();
        assert!(table.sql(Operation::Insert).is_ok());
        assert!(table.sql(Operation::Update).is_err());
        assert!(table.sql(Operation::Delete).is_err());
        assert!(table.sql(Operation::Merge).is_err());
    }

    #[tokio::test]
    async fn test_readiness_bitmap_scenario() {
        let conn = named_conn();
        let mut table = build_table(&conn);

        let complete = Record::from_pairs([
            ("id", Value::Int(1)),
            ("name", Value::Text("Aang".into())),
        ]);
        table.set_values(&complete).await.unwrap();
        assert!(table.is_ready(Operation::Insert));
        assert!(table.is_ready(Operation::Update));

        let name_missing =
            Record::from_pairs([("id", Value::Int(1)), ("email", Value::Text("x".into()))]);
        table.set_values(&name_missing).await.unwrap();
        assert!(!table.is_ready(Operation::Insert));
        assert!(table.is_ready(Operation::Update));
        assert_eq!(table.reqs_missing(Operation::Insert), vec!["name"]);

        // Incomplete execute counts, issues no SQL.
        let issued = table.execute(Operation::Insert).await.unwrap();
        assert!(!issued);
        assert_eq!(table.counts().incomplete, 1);
        assert_eq!(conn.execute_count(), 0);

        // raise_error surfaces the missing column.
        let err = table
            .execute_with(Operation::Insert, true, false)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("name"));
    }

    #[tokio::test]
    async fn test_execute_binds_current_values() {
        let conn = named_conn();
        let mut table = build_table(&conn);
        let record = Record::from_pairs([
            ("id", Value::Int(7)),
            ("name", Value::Text("Toph".into())),
            ("email", Value::Text("t@b.example".into())),
        ]);
        table.set_values(&record).await.unwrap();
        assert!(table.execute(Operation::Insert).await.unwrap());
        assert_eq!(table.counts().insert, 1);

        let log = conn.executed();
        assert_eq!(log.len(), 1);
        match &log[0].payloads[0] {
            Params::Named(map) => {
                assert_eq!(map.get("id"), Some(&Value::Int(7)));
                assert_eq!(map.get("name"), Some(&Value::Text("Toph".into())));
            }
            other => panic!("expected named payload, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_transform_error_counts_and_stores_null() {
        let conn = named_conn();
        let shared: Arc<dyn DriverConnection> = Arc::new(conn.clone());
        let cursor = Cursor::new(shared).unwrap();
        let mut table = Table::new(
            "t",
            vec![
                Column::builder("id").field("id").key(true),
                Column::builder("v")
                    .field("v")
                    .transform_fn(|_| Err(EtlError::Config("bad".into()))),
            ],
            cursor,
        )
        .unwrap();

        let record = Record::from_pairs([("id", Value::Int(1)), ("v", Value::Int(2))]);
        let err = table.set_values(&record).await.unwrap_err();
        assert!(err.to_string().contains('v'));
        assert_eq!(table.counts().error, 1);
        assert_eq!(table.values().get("v"), Some(&Value::Null));
        // Other columns still resolved.
        assert_eq!(table.values().get("id"), Some(&Value::Int(1)));
    }

    #[tokio::test]
    async fn test_null_sentinels_and_defaults() {
        let conn = named_conn();
        let shared: Arc<dyn DriverConnection> = Arc::new(conn.clone());
        let cursor = Cursor::new(shared).unwrap();
        let mut table = Table::new(
            "t",
            vec![
                Column::builder("id").field("id").key(true),
                Column::builder("state")
                    .field("state")
                    .default_value("unknown"),
            ],
            cursor,
        )
        .unwrap();

        let record = Record::from_pairs([
            ("id", Value::Int(1)),
            ("state", Value::Text("\\N".into())),
        ]);
        table.set_values(&record).await.unwrap();
        assert_eq!(
            table.values().get("state"),
            Some(&Value::Text("unknown".into()))
        );
    }

    #[tokio::test]
    async fn test_fetch_by_key() {
        let conn = named_conn();
        conn.script_query(
            "FROM people WHERE",
            ["id", "name", "email"],
            vec![vec![
                Value::Int(7),
                Value::Text("Toph".into()),
                Value::Null,
            ]],
        );
        let mut table = build_table(&conn);
        let record = Record::from_pairs([
            ("id", Value::Int(7)),
            ("name", Value::Text("Toph".into())),
        ]);
        table.set_values(&record).await.unwrap();

        let row = table.fetch().await.unwrap().unwrap();
        assert_eq!(row["name"], Value::Text("Toph".into()));
        assert_eq!(table.counts().select, 1);
    }

    #[tokio::test]
    async fn test_merge_delete_insert_capability() {
        let conn = MemoryConnection::new(DbType::Postgres, ParamStyle::Named)
            .with_capabilities(Capabilities {
                merge: MergeFlavor::DeleteInsert,
            });
        let mut table = build_table(&conn);
        let record = Record::from_pairs([
            ("id", Value::Int(2)),
            ("name", Value::Text("B".into())),
        ]);
        table.set_values(&record).await.unwrap();
        assert!(table.execute(Operation::Merge).await.unwrap());
        assert_eq!(table.counts().merge, 1);

        let log = conn.executed();
        assert_eq!(log.len(), 2);
        assert!(log[0].sql.starts_with("DELETE FROM people"));
        assert!(log[1].sql.starts_with("INSERT INTO people"));
    }

    #[tokio::test]
    async fn test_counters_not_incremented_on_db_error() {
        let conn = named_conn();
        conn.poison_value(Value::Int(13));
        let mut table = build_table(&conn);
        let record = Record::from_pairs([
            ("id", Value::Int(13)),
            ("name", Value::Text("X".into())),
        ]);
        table.set_values(&record).await.unwrap();
        assert!(table.execute(Operation::Insert).await.is_err());
        assert_eq!(table.counts().insert, 0);
    }
}

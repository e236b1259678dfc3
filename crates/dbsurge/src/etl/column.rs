//! Column descriptors and the per-column value resolution pipeline.
//!
//! A descriptor says where a target column's value comes from (a source
//! field, several fields, the whole record, or nothing), what default
//! and transforms apply, and how the column participates in each DML
//! operation. Descriptors are immutable once built; the resolver runs
//! source → null-normalize → default → transform → db-expression for
//! every `set_values` call.

use std::collections::HashSet;
use std::sync::Arc;

use crate::core::identifier::validate_identifier;
use crate::core::record::{normalize_name, Record};
use crate::core::value::Value;
use crate::drivers::DriverConnection;
use crate::error::{EtlError, Result};
use crate::etl::lookup::{Lookup, LookupSpec, Validate};
use crate::etl::transforms::{parse_shorthand, ParsedTransform, RecordFn, Transform, ValueFn};

/// Where a column's raw value is read from.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SourceField {
    /// No source: the column is fed by its default or db expression.
    #[default]
    None,
    /// A single source-record key.
    Field(String),
    /// Several keys, assembled into a list value.
    Fields(Vec<String>),
    /// The whole record is handed to the first transform.
    WholeRecord,
}

impl SourceField {
    /// Field names this source reads, for warning checks and update
    /// exclusion.
    pub(crate) fn field_names(&self) -> Vec<&str> {
        match self {
            SourceField::Field(f) => vec![f.as_str()],
            SourceField::Fields(fs) => fs.iter().map(String::as_str).collect(),
            _ => Vec::new(),
        }
    }
}

/// Database-side expression attached to a column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DbExpr {
    /// Contains `#`: the placeholder is substituted with the bound
    /// parameter.
    Template(String),
    /// Parameterless expression used literally; the resolved value is
    /// discarded.
    Standalone(String),
    /// Bare function name, rendered as `name(<param>)`.
    Wrap(String),
}

/// SQL constants accepted as standalone expressions without parentheses.
const STANDALONE_CONSTANTS: &[&str] = &[
    "sysdate",
    "systimestamp",
    "user",
    "current_timestamp",
    "current_date",
];

impl DbExpr {
    /// Parse a db-expression string, failing fast on shapes that could
    /// not produce valid SQL.
    pub fn parse(text: &str) -> Result<Self> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(EtlError::Config("db expression cannot be empty".to_string()));
        }
        if trimmed.contains('#') {
            if trimmed.matches('#').count() > 1 {
                return Err(EtlError::Config(format!(
                    "db expression has more than one # placeholder: {trimmed:?}"
                )));
            }
            return Ok(DbExpr::Template(trimmed.to_string()));
        }
        if trimmed.ends_with("()") || STANDALONE_CONSTANTS.contains(&trimmed.to_lowercase().as_str())
        {
            return Ok(DbExpr::Standalone(trimmed.to_string()));
        }
        if trimmed
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
        {
            return Ok(DbExpr::Wrap(trimmed.to_string()));
        }
        Err(EtlError::Config(format!(
            "unrecognized db expression {trimmed:?}: add '()' or '#', or use a recognized constant"
        )))
    }

    /// True when the expression ignores the bound value entirely.
    #[must_use]
    pub fn is_standalone(&self) -> bool {
        matches!(self, DbExpr::Standalone(_))
    }

    /// Render the expression around a parameter placeholder.
    #[must_use]
    pub fn render(&self, placeholder: &str) -> String {
        match self {
            DbExpr::Template(t) => t.replace('#', placeholder),
            DbExpr::Standalone(s) => s.clone(),
            DbExpr::Wrap(name) => format!("{name}({placeholder})"),
        }
    }
}

/// Per-operation participation derived at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Participation {
    /// The readiness bitmap requires a non-null value for the op.
    pub required: bool,
    /// The column appears in the generated SQL for the op.
    pub in_sql: bool,
    /// The column is matched in the op's key clause.
    pub key: bool,
}

/// DML operations a table can execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Insert,
    Update,
    Delete,
    Merge,
    Select,
}

impl Operation {
    /// All operations, in bitmap order.
    pub const ALL: [Operation; 5] = [
        Operation::Insert,
        Operation::Update,
        Operation::Delete,
        Operation::Merge,
        Operation::Select,
    ];

    /// Position of this operation in readiness bitmaps.
    #[must_use]
    pub fn bit(self) -> u8 {
        match self {
            Operation::Insert => 0,
            Operation::Update => 1,
            Operation::Delete => 2,
            Operation::Merge => 3,
            Operation::Select => 4,
        }
    }

    /// Lowercase operation name, as used in counters and messages.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Operation::Insert => "insert",
            Operation::Update => "update",
            Operation::Delete => "delete",
            Operation::Merge => "merge",
            Operation::Select => "select",
        }
    }

    /// Parse an operation name.
    pub fn parse(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "insert" => Ok(Operation::Insert),
            "update" => Ok(Operation::Update),
            "delete" => Ok(Operation::Delete),
            "merge" | "upsert" => Ok(Operation::Merge),
            "select" => Ok(Operation::Select),
            other => Err(EtlError::Config(format!("invalid operation: {other:?}"))),
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// An immutable target-column descriptor with its bound transforms.
pub struct Column {
    name: String,
    bind_name: String,
    source: SourceField,
    default: Option<Value>,
    transforms: Vec<Transform>,
    db_expr: Option<DbExpr>,
    key: bool,
    nullable: bool,
    no_update: bool,
}

impl Column {
    /// Start building a column descriptor.
    #[must_use]
    pub fn builder(name: impl Into<String>) -> ColumnBuilder {
        ColumnBuilder::new(name)
    }

    /// Target column name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Normalized bind-parameter name.
    #[must_use]
    pub fn bind_name(&self) -> &str {
        &self.bind_name
    }

    /// The column's source specification.
    #[must_use]
    pub fn source(&self) -> &SourceField {
        &self.source
    }

    /// Attached database-side expression, if any.
    #[must_use]
    pub fn db_expr(&self) -> Option<&DbExpr> {
        self.db_expr.as_ref()
    }

    /// True when the column participates in primary-key identity.
    #[must_use]
    pub fn is_key(&self) -> bool {
        self.key
    }

    /// True when the column accepts null values.
    #[must_use]
    pub fn is_nullable(&self) -> bool {
        self.nullable
    }

    /// True when the column is omitted from update clauses.
    #[must_use]
    pub fn is_no_update(&self) -> bool {
        self.no_update
    }

    /// Whether the column binds a parameter for `op` (false for
    /// standalone expressions, which are pure SQL text).
    #[must_use]
    pub fn binds_param(&self) -> bool {
        !self.db_expr.as_ref().is_some_and(DbExpr::is_standalone)
    }

    /// Participation of this column in the given operation.
    #[must_use]
    pub fn participation(&self, op: Operation) -> Participation {
        let required_value = self.key || !self.nullable;
        match op {
            Operation::Insert => Participation {
                required: required_value && self.binds_param(),
                in_sql: true,
                key: false,
            },
            Operation::Merge => Participation {
                required: required_value && self.binds_param(),
                in_sql: true,
                key: self.key,
            },
            Operation::Update => Participation {
                required: self.key,
                in_sql: self.key || !self.no_update,
                key: self.key,
            },
            Operation::Delete | Operation::Select => Participation {
                required: self.key,
                in_sql: self.key,
                key: self.key,
            },
        }
    }

    /// Run the resolution pipeline for one source record.
    ///
    /// Stages: source read, null-sentinel normalization, default
    /// substitution, transform chain. The db-expression stage happens at
    /// SQL generation/bind time since it is SQL text, not a value.
    pub(crate) async fn resolve(
        &mut self,
        record: &Record,
        null_values: &HashSet<String>,
    ) -> Result<Value> {
        let mut value = match &self.source {
            SourceField::None | SourceField::WholeRecord => Value::Null,
            SourceField::Field(field) => record.get(field).cloned().unwrap_or(Value::Null),
            SourceField::Fields(fields) => Value::List(
                fields
                    .iter()
                    .map(|f| record.get(f).cloned().unwrap_or(Value::Null))
                    .collect(),
            ),
        };

        if let Value::Text(text) = &value {
            if null_values.contains(text.as_str()) {
                value = Value::Null;
            }
        }

        if value.is_empty() {
            if let Some(default) = &self.default {
                value = default.clone();
            }
        }

        let whole_record = self.source == SourceField::WholeRecord;
        for (i, transform) in self.transforms.iter_mut().enumerate() {
            value = if i == 0 && whole_record {
                transform.apply_record(record).await
            } else {
                transform.apply(value).await
            }
            .map_err(|e| EtlError::transform(&self.name, e.to_string()))?;
        }

        Ok(value)
    }
}

impl std::fmt::Debug for Column {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Column")
            .field("name", &self.name)
            .field("source", &self.source)
            .field("key", &self.key)
            .field("nullable", &self.nullable)
            .field("no_update", &self.no_update)
            .field("transforms", &self.transforms.len())
            .field("db_expr", &self.db_expr)
            .finish()
    }
}

/// Builder for [`Column`] descriptors.
///
/// Shorthand transforms parse immediately (unknown shorthands fail
/// here); lookup and validate shorthands bind to a cursor when the
/// owning table is constructed.
pub struct ColumnBuilder {
    name: String,
    source: SourceField,
    default: Option<Value>,
    transforms: Vec<ParsedTransform>,
    db_expr: Option<String>,
    key: bool,
    nullable: bool,
    no_update: bool,
}

impl ColumnBuilder {
    /// Create a builder for a target column.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        ColumnBuilder {
            name: name.into(),
            source: SourceField::None,
            default: None,
            transforms: Vec::new(),
            db_expr: None,
            key: false,
            nullable: true,
            no_update: false,
        }
    }

    /// Read from a single source field.
    #[must_use]
    pub fn field(mut self, field: impl Into<String>) -> Self {
        self.source = SourceField::Field(field.into());
        self
    }

    /// Read several source fields into a list value.
    #[must_use]
    pub fn fields<S: Into<String>>(mut self, fields: impl IntoIterator<Item = S>) -> Self {
        self.source = SourceField::Fields(fields.into_iter().map(Into::into).collect());
        self
    }

    /// Hand the whole source record to the first transform.
    #[must_use]
    pub fn whole_record(mut self) -> Self {
        self.source = SourceField::WholeRecord;
        self
    }

    /// Default applied when the sourced value is null or empty.
    #[must_use]
    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    /// Append a shorthand transform.
    ///
    /// # Errors
    ///
    /// Unknown shorthands fail here, at construction time.
    pub fn transform(mut self, shorthand: &str) -> Result<Self> {
        self.transforms.push(parse_shorthand(shorthand)?);
        Ok(self)
    }

    /// Append a user value-transform closure.
    #[must_use]
    pub fn transform_fn(
        mut self,
        f: impl Fn(Value) -> Result<Value> + Send + Sync + 'static,
    ) -> Self {
        self.transforms
            .push(ParsedTransform::Ready(Transform::Custom(Arc::new(f) as ValueFn)));
        self
    }

    /// Append a user whole-record closure (first stage of a
    /// whole-record source).
    #[must_use]
    pub fn record_fn(
        mut self,
        f: impl Fn(&Record) -> Result<Value> + Send + Sync + 'static,
    ) -> Self {
        self.transforms.push(ParsedTransform::Ready(
            Transform::WholeRecord(Arc::new(f) as RecordFn),
        ));
        self
    }

    /// Append a lookup built from a programmatic spec.
    #[must_use]
    pub fn lookup(mut self, spec: LookupSpec) -> Self {
        self.transforms.push(ParsedTransform::DeferredLookup(spec));
        self
    }

    /// Attach a database-side expression.
    #[must_use]
    pub fn db_expr(mut self, expr: impl Into<String>) -> Self {
        self.db_expr = Some(expr.into());
        self
    }

    /// Mark the column as part of primary-key identity.
    #[must_use]
    pub fn key(mut self, key: bool) -> Self {
        self.key = key;
        self
    }

    /// Set whether the column accepts nulls.
    #[must_use]
    pub fn nullable(mut self, nullable: bool) -> Self {
        self.nullable = nullable;
        self
    }

    /// `required` is shorthand for `!nullable`.
    #[must_use]
    pub fn required(self, required: bool) -> Self {
        self.nullable(!required)
    }

    /// Exclude the column from UPDATE set-clauses and the update arm of
    /// MERGE.
    #[must_use]
    pub fn no_update(mut self, no_update: bool) -> Self {
        self.no_update = no_update;
        self
    }

    /// Validate and bind the descriptor against a connection.
    pub(crate) fn build(self, conn: &Arc<dyn DriverConnection>) -> Result<Column> {
        validate_identifier(&self.name)?;
        let bind_name = normalize_name(&self.name, 0);

        let db_expr = self.db_expr.as_deref().map(DbExpr::parse).transpose()?;

        let mut transforms = Vec::with_capacity(self.transforms.len());
        for parsed in self.transforms {
            let transform = match parsed {
                ParsedTransform::Ready(t) => t,
                ParsedTransform::DeferredLookup(spec) => {
                    Transform::Lookup(Lookup::new(Arc::clone(conn), spec)?)
                }
                ParsedTransform::DeferredValidate(spec) => {
                    Transform::Validate(Validate::new(Arc::clone(conn), spec)?)
                }
            };
            transforms.push(transform);
        }

        if self.source == SourceField::WholeRecord {
            match transforms.first() {
                Some(first) if first.accepts_record() => {}
                _ => {
                    return Err(EtlError::Config(format!(
                        "column {:?} has a whole-record source but its first transform cannot take a record",
                        self.name
                    )))
                }
            }
        }

        Ok(Column {
            name: self.name,
            bind_name,
            source: self.source,
            default: self.default,
            transforms,
            db_expr,
            key: self.key,
            nullable: self.nullable,
            no_update: self.no_update,
        })
    }
}

//! Declarative table-pipeline definitions.
//!
//! A [`TableDef`] is the serializable description of a target table:
//! column sources, defaults, transform shorthands, flags. Definitions
//! load from YAML (or JSON, which YAML parses) and build into a live
//! [`Table`] bound to a cursor; every validation error — bad
//! identifiers, unknown shorthands, malformed db expressions —
//! surfaces at build time.
//!
//! ```yaml
//! name: people
//! columns:
//!   - name: id
//!     field: person_id
//!     key: true
//!   - name: full_name
//!     field: name
//!     fn: [strip, maxlen:100]
//!     nullable: false
//!   - name: state
//!     field: state_name
//!     fn: lookup:states:name:code:preload
//!   - name: loaded_at
//!     db_expr: now()
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::core::value::Value;
use crate::cursor::Cursor;
use crate::error::{EtlError, Result};
use crate::etl::column::{Column, ColumnBuilder};
use crate::etl::table::Table;

/// One transform shorthand or a list of them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    fn iter(&self) -> impl Iterator<Item = &str> {
        match self {
            OneOrMany::One(s) => std::slice::from_ref(s).iter().map(String::as_str),
            OneOrMany::Many(v) => v[..].iter().map(String::as_str),
        }
    }
}

/// Serializable column specification.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ColumnDef {
    /// Target column name.
    pub name: String,

    /// Single source field, or `"*"` for the whole record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,

    /// Several source fields assembled into a list value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<Vec<String>>,

    /// Default applied when the sourced value is null or empty.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,

    /// Transform shorthand(s), applied in order.
    #[serde(default, rename = "fn", skip_serializing_if = "Option::is_none")]
    pub transforms: Option<OneOrMany>,

    /// Database-side expression.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_expr: Option<String>,

    /// Participates in primary-key identity.
    #[serde(default)]
    pub key: bool,

    /// Accepts nulls (default true). Mutually redundant with `required`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nullable: Option<bool>,

    /// `required: true` is shorthand for `nullable: false`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required: Option<bool>,

    /// Excluded from UPDATE set-clauses.
    #[serde(default)]
    pub no_update: bool,
}

impl ColumnDef {
    fn into_builder(self) -> Result<ColumnBuilder> {
        let mut builder = Column::builder(self.name.as_str());

        match (&self.field, &self.fields) {
            (Some(_), Some(_)) => {
                return Err(EtlError::Config(format!(
                    "column {:?} sets both field and fields",
                    self.name
                )))
            }
            (Some(field), None) if field == "*" => builder = builder.whole_record(),
            (Some(field), None) => builder = builder.field(field.as_str()),
            (None, Some(fields)) => builder = builder.fields(fields.clone()),
            (None, None) => {}
        }

        if let Some(default) = &self.value {
            builder = builder.default_value(json_to_value(default)?);
        }
        if let Some(transforms) = &self.transforms {
            for shorthand in transforms.iter() {
                builder = builder.transform(shorthand)?;
            }
        }
        if let Some(expr) = &self.db_expr {
            builder = builder.db_expr(expr.as_str());
        }

        let nullable = match (self.nullable, self.required) {
            (Some(n), None) => n,
            (None, Some(r)) => !r,
            (None, None) => true,
            (Some(n), Some(r)) => {
                if n == r {
                    return Err(EtlError::Config(format!(
                        "column {:?}: nullable and required contradict each other",
                        self.name
                    )));
                }
                n
            }
        };

        Ok(builder
            .key(self.key)
            .nullable(nullable)
            .no_update(self.no_update))
    }
}

/// Serializable table specification.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TableDef {
    /// Target table name.
    pub name: String,

    /// Column specifications, in declaration order.
    pub columns: Vec<ColumnDef>,

    /// Override for the null-sentinel set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub null_values: Option<Vec<String>>,
}

impl TableDef {
    /// Parse a definition from YAML (or JSON) text.
    pub fn parse(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    /// Load a definition from a file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::parse(&text)
    }

    /// Build a live table pipeline bound to a cursor.
    pub fn build(self, cursor: Cursor) -> Result<Table> {
        let builders = self
            .columns
            .into_iter()
            .map(ColumnDef::into_builder)
            .collect::<Result<Vec<_>>>()?;
        let mut table = Table::new(self.name, builders, cursor)?;
        if let Some(null_values) = self.null_values {
            table = table.with_null_values(null_values);
        }
        Ok(table)
    }
}

/// Convert a config scalar into a runtime value.
fn json_to_value(json: &serde_json::Value) -> Result<Value> {
    use serde_json::Value as Json;
    match json {
        Json::Null => Ok(Value::Null),
        Json::Bool(b) => Ok(Value::Bool(*b)),
        Json::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(Value::Int(i))
            } else if let Some(f) = n.as_f64() {
                Ok(Value::Float(f))
            } else {
                Err(EtlError::Config(format!("unrepresentable number: {n}")))
            }
        }
        Json::String(s) => Ok(Value::Text(s.clone())),
        Json::Array(items) => Ok(Value::List(
            items.iter().map(json_to_value).collect::<Result<Vec<_>>>()?,
        )),
        Json::Object(_) => Err(EtlError::Config(
            "object values are not valid column defaults".to_string(),
        )),
    }
}

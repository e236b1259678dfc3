//! Shared-schema row type used by cursors, readers, and the ETL pipeline.
//!
//! A query or file pass produces many rows over one column list, so the
//! column metadata lives in a [`Schema`] shared via `Arc` and each
//! [`Record`] stores only its values. A record that gains or loses a
//! column detaches onto its own schema copy.

use std::collections::HashMap;
use std::sync::Arc;

use crate::core::value::Value;
use crate::error::{EtlError, Result};

/// Normalize a column name for key-based access and bind parameters.
///
/// Lowercases, collapses every run of non-alphanumeric characters to a
/// single underscore, trims leading and trailing underscores, and
/// prefixes `col_` when the result starts with a digit. An empty result
/// falls back to `column_{position+1}`.
///
/// The same function is used everywhere column names are produced, so a
/// name normalized by one component can be used as a key in another.
/// It is idempotent: `normalize_name(normalize_name(x, i), i)` is a
/// fixed point.
#[must_use]
pub fn normalize_name(name: &str, position: usize) -> String {
    let mut out = String::with_capacity(name.len());
    let mut pending_sep = false;
    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_sep && !out.is_empty() {
                out.push('_');
            }
            pending_sep = false;
            out.push(ch.to_ascii_lowercase());
        } else {
            pending_sep = true;
        }
    }

    if out.is_empty() {
        return format!("column_{}", position + 1);
    }
    if out.as_bytes()[0].is_ascii_digit() {
        out.insert_str(0, "col_");
    }
    out
}

/// Ordered column metadata shared by every record of one result set.
///
/// Invariant: `names`, `normalized`, and both index maps stay aligned by
/// position, and normalized names are unique within one schema
/// (collisions are suffixed `_2`, `_3`, ...).
#[derive(Debug, Clone, PartialEq)]
pub struct Schema {
    names: Vec<String>,
    normalized: Vec<String>,
    by_name: HashMap<String, usize>,
    by_normalized: HashMap<String, usize>,
}

impl Schema {
    /// Build a schema from original column names.
    pub fn new<I, S>(names: I) -> Arc<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names: Vec<String> = names.into_iter().map(Into::into).collect();
        let mut schema = Schema {
            names: Vec::with_capacity(names.len()),
            normalized: Vec::with_capacity(names.len()),
            by_name: HashMap::with_capacity(names.len()),
            by_normalized: HashMap::with_capacity(names.len()),
        };
        for name in names {
            schema.push(name);
        }
        Arc::new(schema)
    }

    /// Append a column, deriving a unique normalized name.
    fn push(&mut self, name: String) {
        let idx = self.names.len();
        let base = normalize_name(&name, idx);
        let mut candidate = base.clone();
        let mut suffix = 2;
        while self.by_normalized.contains_key(&candidate) {
            candidate = format!("{base}_{suffix}");
            suffix += 1;
        }
        // First writer wins for the original-name map; duplicate original
        // names remain addressable through their normalized forms.
        self.by_name.entry(name.clone()).or_insert(idx);
        self.by_normalized.insert(candidate.clone(), idx);
        self.names.push(name);
        self.normalized.push(candidate);
    }

    /// Number of columns.
    #[must_use]
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// True if the schema has no columns.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Original column names, in position order.
    #[must_use]
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Normalized column names, in position order.
    #[must_use]
    pub fn normalized(&self) -> &[String] {
        &self.normalized
    }

    /// Resolve a key to a position: exact original name first, then
    /// normalized name.
    #[must_use]
    pub fn index_of(&self, key: &str) -> Option<usize> {
        self.by_name
            .get(key)
            .or_else(|| self.by_normalized.get(key))
            .copied()
    }

    /// Check if a key resolves to a column.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.index_of(key).is_some()
    }
}

/// A single row: shared schema plus one value per column.
#[derive(Debug, Clone)]
pub struct Record {
    schema: Arc<Schema>,
    values: Vec<Value>,
}

impl Record {
    /// Create a record over a shared schema.
    ///
    /// # Errors
    ///
    /// Fails when the value count does not match the schema width.
    pub fn new(schema: Arc<Schema>, values: Vec<Value>) -> Result<Self> {
        if values.len() != schema.len() {
            return Err(EtlError::Config(format!(
                "record has {} values for {} columns",
                values.len(),
                schema.len()
            )));
        }
        Ok(Record { schema, values })
    }

    /// Build a one-off record from name/value pairs (its own schema).
    pub fn from_pairs<I, S>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (S, Value)>,
        S: Into<String>,
    {
        let (names, values): (Vec<String>, Vec<Value>) =
            pairs.into_iter().map(|(n, v)| (n.into(), v)).unzip();
        Record {
            schema: Schema::new(names),
            values,
        }
    }

    /// The schema this record currently references.
    #[must_use]
    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// Number of columns.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// True if the record has no columns.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Value at a position.
    #[must_use]
    pub fn at(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    /// Contiguous slice of values.
    #[must_use]
    pub fn slice(&self, range: std::ops::Range<usize>) -> &[Value] {
        &self.values[range]
    }

    /// Value by key: exact original name, falling back to normalized.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.schema.index_of(key).map(|i| &self.values[i])
    }

    /// Value by key, or the given default when the key is absent.
    #[must_use]
    pub fn get_or(&self, key: &str, default: Value) -> Value {
        self.get(key).cloned().unwrap_or(default)
    }

    /// Check if a key resolves to a column.
    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.schema.contains(key)
    }

    /// Column names: original, or normalized when `normalized` is true.
    #[must_use]
    pub fn keys(&self, normalized: bool) -> &[String] {
        if normalized {
            self.schema.normalized()
        } else {
            self.schema.names()
        }
    }

    /// Values in position order.
    #[must_use]
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Iterate over values in position order.
    pub fn iter(&self) -> std::slice::Iter<'_, Value> {
        self.values.iter()
    }

    /// Convert to an original-name → value mapping.
    #[must_use]
    pub fn to_map(&self) -> HashMap<String, Value> {
        self.schema
            .names()
            .iter()
            .cloned()
            .zip(self.values.iter().cloned())
            .collect()
    }

    /// Set a value by key.
    ///
    /// An existing key updates in place. A new key extends the record,
    /// detaching it from any shared schema first.
    pub fn set(&mut self, key: &str, value: Value) {
        if let Some(idx) = self.schema.index_of(key) {
            self.values[idx] = value;
        } else {
            Arc::make_mut(&mut self.schema).push(key.to_string());
            self.values.push(value);
        }
    }

    /// Remove a column by key, detaching from any shared schema.
    ///
    /// Returns the removed value, or `None` if the key is absent.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let idx = self.schema.index_of(key)?;
        let names: Vec<String> = self
            .schema
            .names()
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != idx)
            .map(|(_, n)| n.clone())
            .collect();
        // Rebuild so collision suffixes stay consistent with position.
        self.schema = Schema::new(names);
        Some(self.values.remove(idx))
    }
}

impl std::ops::Index<usize> for Record {
    type Output = Value;

    fn index(&self, index: usize) -> &Value {
        &self.values[index]
    }
}

impl std::ops::Index<&str> for Record {
    type Output = Value;

    fn index(&self, key: &str) -> &Value {
        self.get(key)
            .unwrap_or_else(|| panic!("column '{key}' not found"))
    }
}

/// Equality is name-and-value-wise: same original names in the same
/// order with equal values.
impl PartialEq for Record {
    fn eq(&self, other: &Self) -> bool {
        self.schema.names() == other.schema.names() && self.values == other.values
    }
}

impl<'a> IntoIterator for &'a Record {
    type Item = &'a Value;
    type IntoIter = std::slice::Iter<'a, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.values.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Record {
        let schema = Schema::new(["Id", "Full Name", "E-Mail"]);
        Record::new(
            schema,
            vec![
                Value::Int(7),
                Value::Text("Toph".into()),
                Value::Text("toph@beifong.example".into()),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_normalize_name() {
        assert_eq!(normalize_name("Full Name", 0), "full_name");
        assert_eq!(normalize_name("E-Mail", 0), "e_mail");
        assert_eq!(normalize_name("a__b", 0), "a_b");
        assert_eq!(normalize_name("_hidden_", 0), "hidden");
        assert_eq!(normalize_name("9lives", 0), "col_9lives");
        assert_eq!(normalize_name("", 2), "column_3");
        assert_eq!(normalize_name("***", 0), "column_1");
    }

    #[test]
    fn test_normalize_idempotent() {
        for name in ["Full Name", "9lives", "_x_", "a  b", "UPPER"] {
            let once = normalize_name(name, 0);
            assert_eq!(normalize_name(&once, 0), once);
        }
    }

    #[test]
    fn test_collision_suffixing() {
        let schema = Schema::new(["name", "Name", "NAME", "na me"]);
        assert_eq!(
            schema.normalized(),
            &["name", "name_2", "name_3", "na_me"]
        );
        // All unique
        let mut seen = std::collections::HashSet::new();
        assert!(schema.normalized().iter().all(|n| seen.insert(n)));
    }

    #[test]
    fn test_access_alignment() {
        let r = sample();
        for i in 0..r.len() {
            let orig = &r.keys(false)[i];
            let norm = &r.keys(true)[i];
            assert_eq!(&r[i], &r[orig.as_str()]);
            assert_eq!(&r[i], &r[norm.as_str()]);
        }
    }

    #[test]
    fn test_key_access() {
        let r = sample();
        assert_eq!(r["Full Name"], Value::Text("Toph".into()));
        assert_eq!(r["full_name"], Value::Text("Toph".into()));
        assert!(r.get("missing").is_none());
        assert_eq!(r.get_or("missing", Value::Int(0)), Value::Int(0));
        assert!(r.contains_key("e_mail"));
    }

    #[test]
    fn test_slicing_and_iteration() {
        let r = sample();
        assert_eq!(r.slice(1..3).len(), 2);
        let collected: Vec<&Value> = r.iter().collect();
        assert_eq!(collected.len(), 3);
    }

    #[test]
    fn test_mutation_updates_in_place() {
        let mut r = sample();
        let schema_before = Arc::clone(r.schema());
        r.set("full_name", Value::Text("Katara".into()));
        assert_eq!(r["Full Name"], Value::Text("Katara".into()));
        assert!(Arc::ptr_eq(&schema_before, r.schema()));
    }

    #[test]
    fn test_mutation_detaches_shared_schema() {
        let schema = Schema::new(["id"]);
        let mut a = Record::new(Arc::clone(&schema), vec![Value::Int(1)]).unwrap();
        let b = Record::new(Arc::clone(&schema), vec![Value::Int(2)]).unwrap();

        a.set("extra", Value::Text("x".into()));
        assert_eq!(a.len(), 2);
        assert_eq!(b.len(), 1);
        assert!(!b.contains_key("extra"));
    }

    #[test]
    fn test_remove() {
        let mut r = sample();
        let removed = r.remove("e_mail");
        assert_eq!(removed, Some(Value::Text("toph@beifong.example".into())));
        assert_eq!(r.len(), 2);
        assert!(!r.contains_key("E-Mail"));
    }

    #[test]
    fn test_equality_name_and_value_wise() {
        let a = Record::from_pairs([("id", Value::Int(1)), ("name", Value::Text("A".into()))]);
        let b = Record::from_pairs([("id", Value::Int(1)), ("name", Value::Text("A".into()))]);
        let c = Record::from_pairs([("id", Value::Int(1)), ("label", Value::Text("A".into()))]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_length_mismatch_rejected() {
        let schema = Schema::new(["a", "b"]);
        assert!(Record::new(schema, vec![Value::Int(1)]).is_err());
    }

    #[test]
    fn test_to_map() {
        let r = sample();
        let map = r.to_map();
        assert_eq!(map.get("Id"), Some(&Value::Int(7)));
        assert_eq!(map.len(), 3);
    }
}

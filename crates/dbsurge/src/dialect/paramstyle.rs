//! Parameter style translation between the canonical named form and the
//! placeholder dialects drivers actually accept.
//!
//! Source queries are written once in a canonical style (`:name` or
//! `%(name)s`) and rewritten per driver. The scanner walks the query a
//! single time, leaving string literals, quoted identifiers, and
//! comments untouched, and records every placeholder occurrence in
//! order so positional payloads can be built later.

use std::collections::HashMap;

use crate::core::value::Value;
use crate::error::{EtlError, Result};

/// Placeholder dialects, one per driver family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamStyle {
    /// `:name`, bound with a mapping.
    Named,
    /// `%(name)s`, bound with a mapping.
    NamedPercent,
    /// `?`, bound positionally.
    Qmark,
    /// `%s`, bound positionally.
    Format,
    /// `:1`, `:2`, ... bound positionally by occurrence.
    Numeric,
}

impl ParamStyle {
    /// True for styles whose payload is an ordered sequence rather than
    /// a mapping.
    #[must_use]
    pub fn is_positional(self) -> bool {
        matches!(
            self,
            ParamStyle::Qmark | ParamStyle::Format | ParamStyle::Numeric
        )
    }

    /// Parse a style name as drivers report it.
    ///
    /// # Errors
    ///
    /// Returns `EtlError::Translate` for unknown style names.
    pub fn parse(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "named" => Ok(ParamStyle::Named),
            "pyformat" | "named_percent" => Ok(ParamStyle::NamedPercent),
            "qmark" => Ok(ParamStyle::Qmark),
            "format" => Ok(ParamStyle::Format),
            "numeric" => Ok(ParamStyle::Numeric),
            other => Err(EtlError::Translate(format!(
                "unknown parameter style: {other:?}"
            ))),
        }
    }
}

impl std::fmt::Display for ParamStyle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ParamStyle::Named => "named",
            ParamStyle::NamedPercent => "pyformat",
            ParamStyle::Qmark => "qmark",
            ParamStyle::Format => "format",
            ParamStyle::Numeric => "numeric",
        };
        write!(f, "{name}")
    }
}

/// Bind payload shape accepted by driver cursors.
#[derive(Debug, Clone, PartialEq)]
pub enum Params {
    None,
    /// Ordered values for positional styles.
    Positional(Vec<Value>),
    /// Name → value mapping for named styles.
    Named(HashMap<String, Value>),
}

impl Params {
    /// Build a named payload from key/value pairs.
    pub fn named<K, V, I>(pairs: I) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
        I: IntoIterator<Item = (K, V)>,
    {
        Params::Named(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// Build a positional payload from values.
    pub fn positional<V, I>(values: I) -> Self
    where
        V: Into<Value>,
        I: IntoIterator<Item = V>,
    {
        Params::Positional(values.into_iter().map(Into::into).collect())
    }

    /// Number of bound slots or entries.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Params::None => 0,
            Params::Positional(v) => v.len(),
            Params::Named(m) => m.len(),
        }
    }

    /// True when nothing is bound.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A query translated to one target style, with its binder plan.
///
/// `names` holds every placeholder occurrence in textual order, so a
/// name used twice appears twice. Built once per canonical query and
/// style, then reused for every payload.
#[derive(Debug, Clone)]
pub struct TranslatedQuery {
    sql: String,
    names: Vec<String>,
    style: ParamStyle,
}

impl TranslatedQuery {
    /// The rewritten SQL in the target style.
    #[must_use]
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Placeholder occurrences, in textual order.
    #[must_use]
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// The target style this query was translated for.
    #[must_use]
    pub fn style(&self) -> ParamStyle {
        self.style
    }

    /// Build the driver payload from a name → value mapping.
    ///
    /// Missing names bind SQL null; extra keys are ignored, so one
    /// payload may drive several queries. Positional payloads follow
    /// textual occurrence order, re-binding repeated names per slot.
    #[must_use]
    pub fn bind(&self, payload: &HashMap<String, Value>) -> Params {
        if self.names.is_empty() {
            return Params::None;
        }
        if self.style.is_positional() {
            Params::Positional(
                self.names
                    .iter()
                    .map(|n| payload.get(n).cloned().unwrap_or(Value::Null))
                    .collect(),
            )
        } else {
            let mut map = HashMap::with_capacity(self.names.len());
            for name in &self.names {
                map.entry(name.clone())
                    .or_insert_with(|| payload.get(name).cloned().unwrap_or(Value::Null));
            }
            Params::Named(map)
        }
    }

    /// Like [`bind`](Self::bind) but failing when a referenced name is
    /// absent from the payload.
    ///
    /// # Errors
    ///
    /// Returns `EtlError::Bind` naming the first missing parameter.
    pub fn bind_strict(&self, payload: &HashMap<String, Value>) -> Result<Params> {
        for name in &self.names {
            if !payload.contains_key(name) {
                return Err(EtlError::Bind(format!("missing parameter: {name:?}")));
            }
        }
        Ok(self.bind(payload))
    }
}

/// Translate a canonical query to the target style.
///
/// Recognizes both canonical forms (`:name` and `%(name)s`) in the same
/// pass. Placeholders inside single-quoted literals, double-quoted
/// identifiers, `--` line comments, and `/* */` block comments are not
/// substituted. `::` casts and `%%` escapes pass through untouched.
///
/// # Errors
///
/// Returns `EtlError::Translate` for malformed `%(...)s` placeholders.
pub fn translate(sql: &str, style: ParamStyle) -> Result<TranslatedQuery> {
    let bytes = sql.as_bytes();
    let mut out = String::with_capacity(sql.len());
    let mut names: Vec<String> = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i] as char;
        match c {
            '\'' => {
                let end = scan_quoted(bytes, i, b'\'');
                out.push_str(&sql[i..end]);
                i = end;
            }
            '"' => {
                let end = scan_quoted(bytes, i, b'"');
                out.push_str(&sql[i..end]);
                i = end;
            }
            '-' if bytes.get(i + 1) == Some(&b'-') => {
                let end = sql[i..]
                    .find('\n')
                    .map_or(bytes.len(), |offset| i + offset + 1);
                out.push_str(&sql[i..end]);
                i = end;
            }
            '/' if bytes.get(i + 1) == Some(&b'*') => {
                let end = sql[i + 2..]
                    .find("*/")
                    .map_or(bytes.len(), |offset| i + 2 + offset + 2);
                out.push_str(&sql[i..end]);
                i = end;
            }
            ':' => {
                // `::` is a cast, `:1` is not canonical; only a leading
                // letter or underscore starts a named placeholder.
                if bytes.get(i + 1) == Some(&b':') {
                    out.push_str("::");
                    i += 2;
                } else if i + 1 < bytes.len() && is_name_start(bytes[i + 1]) {
                    let end = scan_name(bytes, i + 1);
                    let name = &sql[i + 1..end];
                    emit_placeholder(&mut out, name, names.len(), style);
                    names.push(name.to_string());
                    i = end;
                } else {
                    out.push(':');
                    i += 1;
                }
            }
            '%' => {
                if bytes.get(i + 1) == Some(&b'%') {
                    out.push_str("%%");
                    i += 2;
                } else if bytes.get(i + 1) == Some(&b'(') {
                    let close = sql[i + 2..].find(')').ok_or_else(|| {
                        EtlError::Translate(format!(
                            "unterminated %(...)s placeholder at byte {i}"
                        ))
                    })?;
                    let name = &sql[i + 2..i + 2 + close];
                    if name.is_empty() || !name.bytes().all(is_name_char) {
                        return Err(EtlError::Translate(format!(
                            "invalid placeholder name: {name:?}"
                        )));
                    }
                    let after = i + 2 + close + 1;
                    if bytes.get(after) != Some(&b's') {
                        return Err(EtlError::Translate(format!(
                            "placeholder %({name})... must end with 's'"
                        )));
                    }
                    emit_placeholder(&mut out, name, names.len(), style);
                    names.push(name.to_string());
                    i = after + 1;
                } else {
                    out.push('%');
                    i += 1;
                }
            }
            _ => {
                // Advance one full UTF-8 character.
                let ch_len = char_len_at(sql, i);
                out.push_str(&sql[i..i + ch_len]);
                i += ch_len;
            }
        }
    }

    Ok(TranslatedQuery {
        sql: out,
        names,
        style,
    })
}

fn char_len_at(sql: &str, i: usize) -> usize {
    sql[i..].chars().next().map_or(1, char::len_utf8)
}

fn is_name_start(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_'
}

fn is_name_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// Advance past a name starting at `start`, returning the end offset.
fn scan_name(bytes: &[u8], start: usize) -> usize {
    let mut i = start;
    while i < bytes.len() && is_name_char(bytes[i]) {
        i += 1;
    }
    i
}

/// Advance past a quoted region starting at `start` (which holds the
/// opening quote), honoring doubled-quote escapes. Returns the offset
/// just past the closing quote, or the end of input if unterminated.
fn scan_quoted(bytes: &[u8], start: usize, quote: u8) -> usize {
    let mut i = start + 1;
    while i < bytes.len() {
        if bytes[i] == quote {
            if bytes.get(i + 1) == Some(&quote) {
                i += 2;
                continue;
            }
            return i + 1;
        }
        i += 1;
    }
    bytes.len()
}

/// Write one placeholder in the target style.
fn emit_placeholder(out: &mut String, name: &str, occurrence: usize, style: ParamStyle) {
    match style {
        ParamStyle::Named => {
            out.push(':');
            out.push_str(name);
        }
        ParamStyle::NamedPercent => {
            out.push_str("%(");
            out.push_str(name);
            out.push_str(")s");
        }
        ParamStyle::Qmark => out.push('?'),
        ParamStyle::Format => out.push_str("%s"),
        ParamStyle::Numeric => {
            out.push(':');
            out.push_str(&(occurrence + 1).to_string());
        }
    }
}

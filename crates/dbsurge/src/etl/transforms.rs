//! Column transforms: builtin conversions, string shorthands, and the
//! hooks that let lookups and user closures participate in the value
//! resolution pipeline.
//!
//! Shorthand strings like `"int:0"` or `"lookup:states:name:code"`
//! resolve to concrete transforms at table construction; unknown
//! shorthands fail fast there, never mid-run.

use std::sync::Arc;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};

use crate::core::record::Record;
use crate::core::value::Value;
use crate::error::{EtlError, Result};
use crate::etl::lookup::{Lookup, LookupSpec, Validate};

/// User-supplied value transform.
pub type ValueFn = Arc<dyn Fn(Value) -> Result<Value> + Send + Sync>;

/// User-supplied whole-record transform.
pub type RecordFn = Arc<dyn Fn(&Record) -> Result<Value> + Send + Sync>;

/// One stage of a column's transform pipeline.
pub enum Transform {
    /// Integer conversion; unparsable or null input becomes `default`
    /// (or stays null without one).
    Int { default: Option<i64> },
    /// Float conversion; unparsable input becomes null.
    Float,
    /// Loose boolean parsing (`y/yes/true/1/t` vs `n/no/false/0/f`).
    Bool,
    /// Keep only ASCII digits of the text rendering.
    Digits,
    /// Numeric parse of text to a float value.
    Number,
    Lower,
    Upper,
    Strip,
    /// Uppercase the first character, lowercase the rest.
    Capitalize,
    /// Truncate text to at most `n` characters.
    MaxLen(usize),
    /// Right-justify text to `width` with `fill`.
    RJust { width: usize, fill: char },
    /// Left-justify text to `width` with `fill`.
    LJust { width: usize, fill: char },
    /// Truthy → `true_val`, falsy → `false_val` (null when absent).
    Indicator {
        true_val: Option<String>,
        false_val: Option<String>,
    },
    /// Split text into a list on a delimiter, trimming items.
    Split { delimiter: String },
    /// Take the item at `index` (negative counts from the end) of a
    /// delimited string.
    Nth { index: i64, delimiter: String },
    /// First non-empty element of a list value.
    Coalesce,
    /// Parse text to a date.
    Date,
    /// Parse text to a timestamp.
    DateTime,
    /// Parse text to a time of day.
    Time,
    /// User closure over the sourced value.
    Custom(ValueFn),
    /// User closure over the whole source record (first stage only).
    WholeRecord(RecordFn),
    /// Reference-table lookup.
    Lookup(Lookup),
    /// Reference-table existence check.
    Validate(Validate),
}

impl Transform {
    /// True when this transform can run as the first stage of a
    /// whole-record source.
    #[must_use]
    pub fn accepts_record(&self) -> bool {
        matches!(
            self,
            Transform::WholeRecord(_) | Transform::Lookup(_) | Transform::Validate(_)
        )
    }

    /// Apply to the current value.
    pub async fn apply(&mut self, value: Value) -> Result<Value> {
        match self {
            Transform::Int { default } => Ok(to_int(&value, *default)),
            Transform::Float => Ok(to_float(&value)),
            Transform::Bool => Ok(to_bool(&value)),
            Transform::Digits => Ok(digits(&value)),
            Transform::Number => Ok(to_number(&value)),
            Transform::Lower => Ok(map_text(value, |s| s.to_lowercase())),
            Transform::Upper => Ok(map_text(value, |s| s.to_uppercase())),
            Transform::Strip => Ok(map_text(value, |s| s.trim().to_string())),
            Transform::Capitalize => Ok(map_text(value, capitalize)),
            Transform::MaxLen(n) => Ok(max_len(value, *n)),
            Transform::RJust { width, fill } => {
                let (w, f) = (*width, *fill);
                Ok(map_text(value, move |s| justify(&s, w, f, true)))
            }
            Transform::LJust { width, fill } => {
                let (w, f) = (*width, *fill);
                Ok(map_text(value, move |s| justify(&s, w, f, false)))
            }
            Transform::Indicator {
                true_val,
                false_val,
            } => {
                let chosen = if value.is_truthy() {
                    true_val
                } else {
                    false_val
                };
                Ok(chosen
                    .as_ref()
                    .map_or(Value::Null, |s| Value::Text(s.clone())))
            }
            Transform::Split { delimiter } => Ok(split(&value, delimiter)),
            Transform::Nth { index, delimiter } => Ok(nth(&value, *index, delimiter)),
            Transform::Coalesce => Ok(coalesce(value)),
            Transform::Date => Ok(parse_date(&value)),
            Transform::DateTime => Ok(parse_datetime(&value)),
            Transform::Time => Ok(parse_time(&value)),
            Transform::Custom(f) => (f.as_ref())(value),
            Transform::WholeRecord(_) => Err(EtlError::Config(
                "whole-record transform requires a whole-record source in first position"
                    .to_string(),
            )),
            Transform::Lookup(lookup) => lookup.resolve_value(&value).await,
            Transform::Validate(validate) => validate.check_value(&value).await,
        }
    }

    /// Apply as the first stage of a whole-record source.
    pub async fn apply_record(&mut self, record: &Record) -> Result<Value> {
        match self {
            Transform::WholeRecord(f) => (f.as_ref())(record),
            Transform::Lookup(lookup) => lookup.resolve_record(record).await,
            Transform::Validate(validate) => validate.check_record(record).await,
            _ => Err(EtlError::Config(
                "transform cannot take a whole record".to_string(),
            )),
        }
    }
}

impl std::fmt::Debug for Transform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Transform::Int { .. } => "Int",
            Transform::Float => "Float",
            Transform::Bool => "Bool",
            Transform::Digits => "Digits",
            Transform::Number => "Number",
            Transform::Lower => "Lower",
            Transform::Upper => "Upper",
            Transform::Strip => "Strip",
            Transform::Capitalize => "Capitalize",
            Transform::MaxLen(_) => "MaxLen",
            Transform::RJust { .. } => "RJust",
            Transform::LJust { .. } => "LJust",
            Transform::Indicator { .. } => "Indicator",
            Transform::Split { .. } => "Split",
            Transform::Nth { .. } => "Nth",
            Transform::Coalesce => "Coalesce",
            Transform::Date => "Date",
            Transform::DateTime => "DateTime",
            Transform::Time => "Time",
            Transform::Custom(_) => "Custom",
            Transform::WholeRecord(_) => "WholeRecord",
            Transform::Lookup(_) => "Lookup",
            Transform::Validate(_) => "Validate",
        };
        write!(f, "Transform::{name}")
    }
}

/// A parsed shorthand: either ready to use, or a lookup/validate spec
/// awaiting a cursor binding at table construction.
#[derive(Debug)]
pub enum ParsedTransform {
    Ready(Transform),
    DeferredLookup(LookupSpec),
    DeferredValidate(LookupSpec),
}

/// Resolve a shorthand string to a transform.
///
/// # Errors
///
/// Unknown shorthands and malformed arguments fail with
/// `EtlError::Config`.
pub fn parse_shorthand(shorthand: &str) -> Result<ParsedTransform> {
    let shorthand = shorthand.trim_start();

    if shorthand.starts_with("lookup:") {
        return Ok(ParsedTransform::DeferredLookup(LookupSpec::parse(
            shorthand,
        )?));
    }
    if shorthand.starts_with("validate:") {
        return Ok(ParsedTransform::DeferredValidate(LookupSpec::parse_validate(
            shorthand,
        )?));
    }

    let ready = match shorthand {
        "int" => Transform::Int { default: None },
        "float" => Transform::Float,
        "bool" => Transform::Bool,
        "digits" => Transform::Digits,
        "number" => Transform::Number,
        "lower" => Transform::Lower,
        "upper" => Transform::Upper,
        "strip" => Transform::Strip,
        "capitalize" => Transform::Capitalize,
        "coalesce" => Transform::Coalesce,
        "date" => Transform::Date,
        "datetime" => Transform::DateTime,
        "time" => Transform::Time,
        "indicator" => Transform::Indicator {
            true_val: Some("Y".to_string()),
            false_val: None,
        },
        _ => return parse_parameterized(shorthand),
    };
    Ok(ParsedTransform::Ready(ready))
}

fn parse_parameterized(shorthand: &str) -> Result<ParsedTransform> {
    let bad = |detail: &str| EtlError::Config(format!("invalid shorthand {shorthand:?}: {detail}"));

    if let Some(rest) = shorthand.strip_prefix("int:") {
        let default: i64 = rest.parse().map_err(|_| bad("expected int:<default>"))?;
        return Ok(ParsedTransform::Ready(Transform::Int {
            default: Some(default),
        }));
    }

    if let Some(rest) = shorthand.strip_prefix("indicator:") {
        let transform = if rest == "inv" {
            Transform::Indicator {
                true_val: None,
                false_val: Some("Y".to_string()),
            }
        } else {
            let (true_part, false_part) = match rest.split_once('/') {
                Some((t, f)) => (t, Some(f)),
                None => (rest, None),
            };
            Transform::Indicator {
                true_val: Some(if true_part.is_empty() {
                    "Y".to_string()
                } else {
                    true_part.to_string()
                }),
                false_val: false_part.map(str::to_string),
            }
        };
        return Ok(ParsedTransform::Ready(transform));
    }

    if let Some(rest) = shorthand.strip_prefix("split:") {
        let delimiter = if rest.is_empty() { "," } else { rest };
        return Ok(ParsedTransform::Ready(Transform::Split {
            delimiter: delimiter.to_string(),
        }));
    }

    if let Some(rest) = shorthand.strip_prefix("nth:") {
        let (index_part, delimiter) = match rest.split_once(':') {
            Some((i, d)) => (i, d.to_string()),
            None => (rest, ",".to_string()),
        };
        let index: i64 = index_part.parse().map_err(|_| bad("bad index"))?;
        return Ok(ParsedTransform::Ready(Transform::Nth { index, delimiter }));
    }

    for prefix in ["maxlen:", "trunc:"] {
        if let Some(rest) = shorthand.strip_prefix(prefix) {
            let n: usize = rest.parse().map_err(|_| bad("bad length"))?;
            return Ok(ParsedTransform::Ready(Transform::MaxLen(n)));
        }
    }

    for (prefix, right) in [("rjust:", true), ("ljust:", false)] {
        if let Some(rest) = shorthand.strip_prefix(prefix) {
            let (width_part, fill_part) = rest
                .split_once(':')
                .ok_or_else(|| bad("expected <width>:<fill>"))?;
            let width: usize = width_part.parse().map_err(|_| bad("bad width"))?;
            let mut fill_chars = fill_part.chars();
            let fill = fill_chars.next().ok_or_else(|| bad("missing fill char"))?;
            if fill_chars.next().is_some() {
                return Err(bad("fill must be exactly one character"));
            }
            let transform = if right {
                Transform::RJust { width, fill }
            } else {
                Transform::LJust { width, fill }
            };
            return Ok(ParsedTransform::Ready(transform));
        }
    }

    Err(EtlError::Config(format!(
        "unrecognized transform shorthand: {shorthand:?}"
    )))
}

// ---------------------------------------------------------------------
// Builtin conversions
// ---------------------------------------------------------------------

fn to_int(value: &Value, default: Option<i64>) -> Value {
    let parsed = match value {
        Value::Int(v) => Some(*v),
        Value::Float(v) => Some(*v as i64),
        Value::Bool(v) => Some(i64::from(*v)),
        Value::Text(s) => {
            let trimmed = s.trim();
            trimmed
                .parse::<i64>()
                .ok()
                .or_else(|| trimmed.parse::<f64>().ok().map(|f| f as i64))
        }
        _ => None,
    };
    match (parsed, default) {
        (Some(v), _) => Value::Int(v),
        (None, Some(d)) => Value::Int(d),
        (None, None) => Value::Null,
    }
}

fn to_float(value: &Value) -> Value {
    match value {
        Value::Float(v) => Value::Float(*v),
        Value::Int(v) => Value::Float(*v as f64),
        Value::Text(s) => s
            .trim()
            .parse::<f64>()
            .map_or(Value::Null, Value::Float),
        _ => Value::Null,
    }
}

fn to_bool(value: &Value) -> Value {
    match value {
        Value::Bool(v) => Value::Bool(*v),
        Value::Int(v) => Value::Bool(*v != 0),
        Value::Text(s) => match s.trim().to_ascii_lowercase().as_str() {
            "y" | "yes" | "true" | "t" | "1" | "on" => Value::Bool(true),
            "n" | "no" | "false" | "f" | "0" | "off" => Value::Bool(false),
            _ => Value::Null,
        },
        _ => Value::Null,
    }
}

fn digits(value: &Value) -> Value {
    if value.is_null() {
        return Value::Null;
    }
    Value::Text(
        value
            .to_text()
            .chars()
            .filter(char::is_ascii_digit)
            .collect(),
    )
}

fn to_number(value: &Value) -> Value {
    match value {
        Value::Int(_) | Value::Float(_) | Value::Decimal(_) => value.clone(),
        Value::Text(s) => {
            let cleaned: String = s
                .chars()
                .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-' || *c == '+')
                .collect();
            cleaned.parse::<f64>().map_or(Value::Null, Value::Float)
        }
        _ => Value::Null,
    }
}

fn map_text<F: FnOnce(String) -> String>(value: Value, f: F) -> Value {
    match value {
        Value::Text(s) => Value::Text(f(s)),
        other => other,
    }
}

fn capitalize(s: String) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + &chars.as_str().to_lowercase(),
        None => s,
    }
}

fn max_len(value: Value, n: usize) -> Value {
    match value {
        Value::Text(s) => Value::Text(s.chars().take(n).collect()),
        Value::Null => Value::Null,
        other => Value::Text(other.to_text().chars().take(n).collect()),
    }
}

fn justify(s: &str, width: usize, fill: char, right: bool) -> String {
    let len = s.chars().count();
    if len >= width {
        return s.to_string();
    }
    let pad: String = std::iter::repeat(fill).take(width - len).collect();
    if right {
        format!("{pad}{s}")
    } else {
        format!("{s}{pad}")
    }
}

fn split(value: &Value, delimiter: &str) -> Value {
    match value {
        Value::Null => Value::List(Vec::new()),
        Value::Text(s) if s.is_empty() => Value::List(Vec::new()),
        Value::Text(s) => Value::List(
            s.split(delimiter)
                .map(|item| Value::Text(item.trim().to_string()))
                .collect(),
        ),
        Value::List(_) => value.clone(),
        other => Value::List(vec![other.clone()]),
    }
}

fn nth(value: &Value, index: i64, delimiter: &str) -> Value {
    let pick = |len: usize| -> Option<usize> {
        if index >= 0 {
            let i = index as usize;
            (i < len).then_some(i)
        } else {
            let back = index.unsigned_abs() as usize;
            len.checked_sub(back)
        }
    };
    match value {
        Value::Text(s) => {
            let items: Vec<&str> = s.split(delimiter).collect();
            pick(items.len())
                .map(|i| Value::Text(items[i].trim().to_string()))
                .unwrap_or(Value::Null)
        }
        Value::List(items) => pick(items.len())
            .map(|i| items[i].clone())
            .unwrap_or(Value::Null),
        _ => Value::Null,
    }
}

fn coalesce(value: Value) -> Value {
    match value {
        Value::List(items) => items
            .into_iter()
            .find(|v| !v.is_empty())
            .unwrap_or(Value::Null),
        other => other,
    }
}

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%m/%d/%Y", "%m-%d-%Y", "%Y%m%d"];

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%m/%d/%Y %H:%M:%S",
];

const TIME_FORMATS: &[&str] = &["%H:%M:%S%.f", "%H:%M:%S", "%H:%M", "%I:%M %p", "%I:%M:%S %p"];

fn parse_date(value: &Value) -> Value {
    match value {
        Value::Date(_) => value.clone(),
        Value::DateTime(dt) => Value::Date(dt.date()),
        Value::Text(s) => {
            let trimmed = s.trim();
            DATE_FORMATS
                .iter()
                .find_map(|fmt| NaiveDate::parse_from_str(trimmed, fmt).ok())
                .map_or(Value::Null, Value::Date)
        }
        _ => Value::Null,
    }
}

fn parse_datetime(value: &Value) -> Value {
    match value {
        Value::DateTime(_) => value.clone(),
        Value::Date(d) => d.and_hms_opt(0, 0, 0).map_or(Value::Null, Value::DateTime),
        Value::Text(s) => {
            let trimmed = s.trim();
            DATETIME_FORMATS
                .iter()
                .find_map(|fmt| NaiveDateTime::parse_from_str(trimmed, fmt).ok())
                .map(Value::DateTime)
                .or_else(|| match parse_date(value) {
                    Value::Date(d) => d.and_hms_opt(0, 0, 0).map(Value::DateTime),
                    _ => None,
                })
                .unwrap_or(Value::Null)
        }
        _ => Value::Null,
    }
}

fn parse_time(value: &Value) -> Value {
    match value {
        Value::Time(_) => value.clone(),
        Value::DateTime(dt) => Value::Time(dt.time()),
        Value::Text(s) => {
            let trimmed = s.trim();
            TIME_FORMATS
                .iter()
                .find_map(|fmt| NaiveTime::parse_from_str(trimmed, fmt).ok())
                .map_or(Value::Null, Value::Time)
        }
        _ => Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn run(shorthand: &str, value: Value) -> Value {
        match parse_shorthand(shorthand).unwrap() {
            ParsedTransform::Ready(mut t) => t.apply(value).await.unwrap(),
            other => panic!("expected ready transform, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_int_conversions() {
        assert_eq!(run("int", Value::Text(" 42 ".into())).await, Value::Int(42));
        assert_eq!(run("int", Value::Text("12.7".into())).await, Value::Int(12));
        assert_eq!(run("int", Value::Text("abc".into())).await, Value::Null);
        assert_eq!(run("int:0", Value::Null).await, Value::Int(0));
        assert_eq!(run("int:0", Value::Text("".into())).await, Value::Int(0));
        assert_eq!(run("int:0", Value::Text("5".into())).await, Value::Int(5));
    }

    #[tokio::test]
    async fn test_float_bool_number_digits() {
        assert_eq!(
            run("float", Value::Text("3.5".into())).await,
            Value::Float(3.5)
        );
        assert_eq!(run("bool", Value::Text("Yes".into())).await, Value::Bool(true));
        assert_eq!(run("bool", Value::Text("off".into())).await, Value::Bool(false));
        assert_eq!(run("bool", Value::Text("maybe".into())).await, Value::Null);
        assert_eq!(
            run("digits", Value::Text("(614) 555-0199".into())).await,
            Value::Text("6145550199".into())
        );
        assert_eq!(
            run("number", Value::Text("$1,234.50".into())).await,
            Value::Float(1234.50)
        );
    }

    #[tokio::test]
    async fn test_string_transforms() {
        assert_eq!(
            run("lower", Value::Text("HELLO".into())).await,
            Value::Text("hello".into())
        );
        assert_eq!(
            run("strip", Value::Text("  x  ".into())).await,
            Value::Text("x".into())
        );
        assert_eq!(
            run("capitalize", Value::Text("oHIO".into())).await,
            Value::Text("Ohio".into())
        );
        assert_eq!(
            run("maxlen:5", Value::Text("hello world".into())).await,
            Value::Text("hello".into())
        );
        assert_eq!(
            run("rjust:9:0", Value::Text("123".into())).await,
            Value::Text("000000123".into())
        );
        assert_eq!(
            run("ljust:5:x", Value::Text("ab".into())).await,
            Value::Text("abxxx".into())
        );
        // Non-text passes through string transforms untouched.
        assert_eq!(run("upper", Value::Int(3)).await, Value::Int(3));
    }

    #[tokio::test]
    async fn test_indicator_variants() {
        assert_eq!(
            run("indicator", Value::Bool(true)).await,
            Value::Text("Y".into())
        );
        assert_eq!(run("indicator", Value::Null).await, Value::Null);
        assert_eq!(
            run("indicator:inv", Value::Bool(false)).await,
            Value::Text("Y".into())
        );
        assert_eq!(run("indicator:inv", Value::Bool(true)).await, Value::Null);
        assert_eq!(
            run("indicator:T/F", Value::Int(0)).await,
            Value::Text("F".into())
        );
        assert_eq!(
            run("indicator:1/0", Value::Text("yes".into())).await,
            Value::Text("1".into())
        );
    }

    #[tokio::test]
    async fn test_split_and_nth() {
        assert_eq!(
            run("split:,", Value::Text("a, b ,c".into())).await,
            Value::List(vec![
                Value::Text("a".into()),
                Value::Text("b".into()),
                Value::Text("c".into())
            ])
        );
        assert_eq!(run("split:,", Value::Null).await, Value::List(vec![]));
        assert_eq!(
            run("nth:0", Value::Text("action,comedy".into())).await,
            Value::Text("action".into())
        );
        assert_eq!(
            run("nth:-1", Value::Text("a,b,c".into())).await,
            Value::Text("c".into())
        );
        assert_eq!(run("nth:5", Value::Text("a,b".into())).await, Value::Null);
        assert_eq!(
            run("nth:1:|", Value::Text("a|b|c".into())).await,
            Value::Text("b".into())
        );
    }

    #[tokio::test]
    async fn test_coalesce() {
        let v = Value::List(vec![Value::Null, Value::Text("".into()), Value::Int(5)]);
        assert_eq!(run("coalesce", v).await, Value::Int(5));
        assert_eq!(run("coalesce", Value::List(vec![Value::Null])).await, Value::Null);
    }

    #[tokio::test]
    async fn test_date_parsing() {
        let expected = Value::Date(NaiveDate::from_ymd_opt(2024, 3, 9).unwrap());
        assert_eq!(run("date", Value::Text("2024-03-09".into())).await, expected);
        assert_eq!(run("date", Value::Text("03/09/2024".into())).await, expected);
        assert_eq!(run("date", Value::Text("garbage".into())).await, Value::Null);

        let dt = run("datetime", Value::Text("2024-03-09 14:30:00".into())).await;
        assert_eq!(
            dt,
            Value::DateTime(
                NaiveDate::from_ymd_opt(2024, 3, 9)
                    .unwrap()
                    .and_hms_opt(14, 30, 0)
                    .unwrap()
            )
        );

        let t = run("time", Value::Text("14:30".into())).await;
        assert_eq!(t, Value::Time(NaiveTime::from_hms_opt(14, 30, 0).unwrap()));
    }

    #[tokio::test]
    async fn test_pipeline_from_scenario() {
        // lower → strip → maxlen:5 over "  HELLO WORLD  "
        let mut value = Value::Text("  HELLO WORLD  ".into());
        for shorthand in ["lower", "strip", "maxlen:5"] {
            value = run(shorthand, value).await;
        }
        assert_eq!(value, Value::Text("hello".into()));
    }

    #[test]
    fn test_unknown_shorthand_fails_fast() {
        assert!(parse_shorthand("reverse").is_err());
        assert!(parse_shorthand("maxlen:x").is_err());
        assert!(parse_shorthand("rjust:9").is_err());
        assert!(parse_shorthand("rjust:9:ab").is_err());
        assert!(parse_shorthand("nth:one").is_err());
    }

    #[test]
    fn test_lookup_shorthands_defer() {
        assert!(matches!(
            parse_shorthand("lookup:states:name:code").unwrap(),
            ParsedTransform::DeferredLookup(_)
        ));
        assert!(matches!(
            parse_shorthand("validate:regions:name:none").unwrap(),
            ParsedTransform::DeferredValidate(_)
        ));
    }

    #[tokio::test]
    async fn test_custom_closure() {
        let mut t = Transform::Custom(Arc::new(|v| {
            Ok(Value::Int(v.as_int().unwrap_or(0) * 2))
        }));
        assert_eq!(t.apply(Value::Int(21)).await.unwrap(), Value::Int(42));
    }
}

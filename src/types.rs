//! Tagged runtime values and declared type hints
//!
//! Every value an expression produces is a [`Value`]. Values are loosely
//! typed: arithmetic accepts numeric strings, and conversions between kinds
//! happen only through [`coerce`] against a [`TypeHint`] declared on a `Set`
//! or `Param` node. A failed conversion is a [`TypeError`], never a silent
//! cast.

use crate::error::TypeError;
use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

/// Runtime value
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    /// Result of resolving a name nobody declared
    #[default]
    Undefined,
    Null,
    Boolean(bool),
    Integer(i64),
    Decimal(f64),
    String(String),
    DateTime(DateTime<Utc>),
    Array(Vec<Value>),
    Object(BTreeMap<String, Value>),
}

impl Value {
    pub fn string(s: impl Into<String>) -> Self {
        Value::String(s.into())
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Undefined or null
    pub fn is_absent(&self) -> bool {
        matches!(self, Value::Undefined | Value::Null)
    }

    /// Name of this value's kind, as used in diagnostics
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Null => "null",
            Value::Boolean(_) => "boolean",
            Value::Integer(_) => "integer",
            Value::Decimal(_) => "decimal",
            Value::String(_) => "string",
            Value::DateTime(_) => "datetime",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
        }
    }

    /// Truthiness used by conditions and logical operators
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Undefined | Value::Null => false,
            Value::Boolean(b) => *b,
            Value::Integer(i) => *i != 0,
            Value::Decimal(d) => *d != 0.0,
            Value::String(s) => {
                let s = s.trim();
                !(s.is_empty()
                    || s.eq_ignore_ascii_case("false")
                    || s.eq_ignore_ascii_case("no")
                    || s == "0")
            }
            Value::DateTime(_) => true,
            Value::Array(items) => !items.is_empty(),
            Value::Object(map) => !map.is_empty(),
        }
    }

    /// Numeric view of the value; numeric strings count
    pub fn as_number(&self) -> Option<Number> {
        match self {
            Value::Integer(i) => Some(Number::Integer(*i)),
            Value::Decimal(d) => Some(Number::Decimal(*d)),
            Value::String(s) => Number::parse(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        self.as_number().map(Number::as_f64)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self.as_number()? {
            Number::Integer(i) => Some(i),
            Number::Decimal(d) if d.fract() == 0.0 && d.is_finite() => Some(d as i64),
            Number::Decimal(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&Vec<Value>> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Object(map) => Some(map),
            _ => None,
        }
    }

    /// Member access; anything that is not an object yields undefined,
    /// except `length` on arrays and strings
    pub fn member(&self, field: &str) -> Value {
        match self {
            Value::Object(map) => map.get(field).cloned().unwrap_or(Value::Undefined),
            Value::Array(items) if field == "length" => Value::Integer(items.len() as i64),
            Value::String(s) if field == "length" => Value::Integer(s.chars().count() as i64),
            _ => Value::Undefined,
        }
    }

    /// Index access (zero-based for arrays, string keys for objects)
    pub fn index(&self, index: &Value) -> Value {
        match self {
            Value::Array(items) => index
                .as_i64()
                .and_then(|i| usize::try_from(i).ok())
                .and_then(|i| items.get(i).cloned())
                .unwrap_or(Value::Undefined),
            Value::Object(map) => map
                .get(&index.to_string())
                .cloned()
                .unwrap_or(Value::Undefined),
            _ => Value::Undefined,
        }
    }

    /// Set a nested field, creating intermediate objects as needed
    pub fn set_path(&mut self, path: &[String], value: Value) {
        let Some((first, rest)) = path.split_first() else {
            *self = value;
            return;
        };
        if !matches!(self, Value::Object(_)) {
            *self = Value::Object(BTreeMap::new());
        }
        if let Value::Object(map) = self {
            let slot = map.entry(first.clone()).or_insert(Value::Undefined);
            slot.set_path(rest, value);
        }
    }

    /// Loose equality: numbers compare numerically (numeric strings
    /// included), strings case-sensitively, undefined equals only
    /// undefined or null
    pub fn loose_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Undefined | Value::Null, Value::Undefined | Value::Null) => true,
            (Value::Undefined | Value::Null, _) | (_, Value::Undefined | Value::Null) => false,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Boolean(b), other) | (other, Value::Boolean(b)) => {
                other.is_truthy() == *b && other.as_number().is_some()
                    || matches!(other, Value::String(s) if s.eq_ignore_ascii_case(if *b { "true" } else { "false" }))
            }
            (Value::Array(a), Value::Array(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.loose_eq(y))
            }
            (Value::Object(a), Value::Object(b)) => a == b,
            (a, b) => match (a.as_number(), b.as_number()) {
                (Some(x), Some(y)) => x.as_f64() == y.as_f64(),
                _ => a.to_string() == b.to_string(),
            },
        }
    }

    /// Ordering for comparisons and sorting; `None` when not comparable
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Undefined, _) | (_, Value::Undefined) => None,
            (Value::DateTime(a), Value::DateTime(b)) => Some(a.cmp(b)),
            (Value::Boolean(a), Value::Boolean(b)) => Some(a.cmp(b)),
            (a, b) => match (a.as_number(), b.as_number()) {
                (Some(x), Some(y)) => x.as_f64().partial_cmp(&y.as_f64()),
                _ => match (a, b) {
                    (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
                    (Value::Null, Value::Null) => Some(Ordering::Equal),
                    (Value::Array(_) | Value::Object(_), _)
                    | (_, Value::Array(_) | Value::Object(_)) => None,
                    (x, y) => Some(x.to_string().cmp(&y.to_string())),
                },
            },
        }
    }

    /// Convert to JSON (undefined becomes null)
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Undefined | Value::Null => serde_json::Value::Null,
            Value::Boolean(b) => serde_json::Value::Bool(*b),
            Value::Integer(i) => serde_json::Value::from(*i),
            Value::Decimal(d) => serde_json::Number::from_f64(*d)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::DateTime(dt) => serde_json::Value::String(format_datetime(dt)),
            Value::Array(items) => serde_json::Value::Array(items.iter().map(Value::to_json).collect()),
            Value::Object(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }

    /// Convert from JSON
    pub fn from_json(json: serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Boolean(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Integer(i),
                None => Value::Decimal(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::Array(items.into_iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(map) => Value::Object(
                map.into_iter()
                    .map(|(k, v)| (k, Value::from_json(v)))
                    .collect(),
            ),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undefined => f.write_str("undefined"),
            Value::Null => Ok(()),
            Value::Boolean(b) => write!(f, "{}", b),
            Value::Integer(i) => write!(f, "{}", i),
            Value::Decimal(d) => write!(f, "{}", d),
            Value::String(s) => f.write_str(s),
            Value::DateTime(dt) => f.write_str(&format_datetime(dt)),
            Value::Array(_) | Value::Object(_) => write!(f, "{}", self.to_json()),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<f64> for Value {
    fn from(d: f64) -> Self {
        Value::Decimal(d)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(items)
    }
}

/// A numeric view used by arithmetic
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Number {
    Integer(i64),
    Decimal(f64),
}

impl Number {
    /// Parse a numeric string (surrounding whitespace allowed)
    pub fn parse(s: &str) -> Option<Number> {
        let s = s.trim();
        if s.is_empty() {
            return None;
        }
        if let Ok(i) = s.parse::<i64>() {
            return Some(Number::Integer(i));
        }
        match s.parse::<f64>() {
            Ok(d) if d.is_finite() => Some(Number::Decimal(d)),
            _ => None,
        }
    }

    pub fn as_f64(self) -> f64 {
        match self {
            Number::Integer(i) => i as f64,
            Number::Decimal(d) => d,
        }
    }

    pub fn into_value(self) -> Value {
        match self {
            Number::Integer(i) => Value::Integer(i),
            Number::Decimal(d) => Value::Decimal(d),
        }
    }
}

/// RFC 3339 with second precision and a `Z` suffix
pub fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Parse the datetime formats accepted by the `datetime` hint
pub fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// Declared type hints
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeHint {
    String,
    Integer,
    Decimal,
    Boolean,
    Array,
    Json,
    DateTime,
    Any,
}

impl TypeHint {
    pub fn parse(name: &str) -> Option<TypeHint> {
        let hint = match name.trim().to_ascii_lowercase().as_str() {
            "string" => TypeHint::String,
            "integer" | "int" => TypeHint::Integer,
            "decimal" | "numeric" | "number" => TypeHint::Decimal,
            "boolean" | "bool" => TypeHint::Boolean,
            "array" => TypeHint::Array,
            "json" | "struct" | "object" => TypeHint::Json,
            "datetime" | "date" => TypeHint::DateTime,
            "any" => TypeHint::Any,
            _ => return None,
        };
        Some(hint)
    }
}

impl fmt::Display for TypeHint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TypeHint::String => "string",
            TypeHint::Integer => "integer",
            TypeHint::Decimal => "decimal",
            TypeHint::Boolean => "boolean",
            TypeHint::Array => "array",
            TypeHint::Json => "json",
            TypeHint::DateTime => "datetime",
            TypeHint::Any => "any",
        };
        f.write_str(name)
    }
}

/// Coerce a value to a declared type hint
pub fn coerce(value: Value, hint: TypeHint) -> Result<Value, TypeError> {
    if value.is_undefined() {
        return Ok(value);
    }
    let fail = |value: &Value| TypeError::new(hint, value);

    match hint {
        TypeHint::Any => Ok(value),
        TypeHint::String => Ok(match value {
            Value::String(_) => value,
            other => Value::String(other.to_string()),
        }),
        TypeHint::Integer => match &value {
            Value::Integer(_) => Ok(value),
            Value::Boolean(b) => Ok(Value::Integer(i64::from(*b))),
            Value::Decimal(_) | Value::String(_) => {
                value.as_i64().map(Value::Integer).ok_or_else(|| fail(&value))
            }
            _ => Err(fail(&value)),
        },
        TypeHint::Decimal => match &value {
            Value::Decimal(_) => Ok(value),
            Value::Integer(i) => Ok(Value::Decimal(*i as f64)),
            Value::String(_) => value.as_f64().map(Value::Decimal).ok_or_else(|| fail(&value)),
            _ => Err(fail(&value)),
        },
        TypeHint::Boolean => match &value {
            Value::Boolean(_) => Ok(value),
            Value::Integer(i) => Ok(Value::Boolean(*i != 0)),
            Value::Decimal(d) => Ok(Value::Boolean(*d != 0.0)),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" | "1" => Ok(Value::Boolean(true)),
                "false" | "no" | "0" => Ok(Value::Boolean(false)),
                _ => Err(fail(&value)),
            },
            _ => Err(fail(&value)),
        },
        TypeHint::Array => match &value {
            Value::Array(_) => Ok(value),
            Value::String(s) => match serde_json::from_str::<serde_json::Value>(s) {
                Ok(json @ serde_json::Value::Array(_)) => Ok(Value::from_json(json)),
                _ => Err(fail(&value)),
            },
            _ => Err(fail(&value)),
        },
        TypeHint::Json => match &value {
            Value::String(s) => serde_json::from_str::<serde_json::Value>(s)
                .map(Value::from_json)
                .map_err(|_| fail(&value)),
            Value::DateTime(_) => Err(fail(&value)),
            _ => Ok(value),
        },
        TypeHint::DateTime => match &value {
            Value::DateTime(_) => Ok(value),
            Value::String(s) => parse_datetime(s)
                .map(Value::DateTime)
                .ok_or_else(|| fail(&value)),
            Value::Integer(secs) => Utc
                .timestamp_opt(*secs, 0)
                .single()
                .map(Value::DateTime)
                .ok_or_else(|| fail(&value)),
            _ => Err(fail(&value)),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coerce_integer_from_string() {
        assert_eq!(
            coerce(Value::string(" 42 "), TypeHint::Integer).unwrap(),
            Value::Integer(42)
        );
        assert_eq!(
            coerce(Value::string("7.0"), TypeHint::Integer).unwrap(),
            Value::Integer(7)
        );
    }

    #[test]
    fn test_coerce_failure_is_type_error() {
        let err = coerce(Value::string("abc"), TypeHint::Integer).unwrap_err();
        assert_eq!(err.expected, TypeHint::Integer);
        assert_eq!(err.found, "string");
        assert_eq!(err.to_string(), "cannot convert 'abc' (string) to integer");

        assert!(coerce(Value::Decimal(1.5), TypeHint::Integer).is_err());
        assert!(coerce(Value::string("maybe"), TypeHint::Boolean).is_err());
    }

    #[test]
    fn test_coerce_boolean_words() {
        assert_eq!(
            coerce(Value::string("yes"), TypeHint::Boolean).unwrap(),
            Value::Boolean(true)
        );
        assert_eq!(
            coerce(Value::string("0"), TypeHint::Boolean).unwrap(),
            Value::Boolean(false)
        );
    }

    #[test]
    fn test_coerce_json_and_datetime() {
        let json = coerce(Value::string(r#"{"a": [1, 2]}"#), TypeHint::Json).unwrap();
        assert_eq!(
            json.member("a"),
            Value::Array(vec![Value::Integer(1), Value::Integer(2)])
        );

        let dt = coerce(Value::string("2024-03-01"), TypeHint::DateTime).unwrap();
        assert_eq!(dt.to_string(), "2024-03-01T00:00:00Z");
    }

    #[test]
    fn test_undefined_passes_every_hint() {
        for hint in [TypeHint::Integer, TypeHint::Boolean, TypeHint::DateTime] {
            assert_eq!(coerce(Value::Undefined, hint).unwrap(), Value::Undefined);
        }
    }

    #[test]
    fn test_truthiness() {
        assert!(!Value::Undefined.is_truthy());
        assert!(!Value::string("false").is_truthy());
        assert!(!Value::string("").is_truthy());
        assert!(Value::string("abc").is_truthy());
        assert!(!Value::Integer(0).is_truthy());
        assert!(!Value::Array(vec![]).is_truthy());
    }

    #[test]
    fn test_display() {
        assert_eq!(Value::Undefined.to_string(), "undefined");
        assert_eq!(Value::Null.to_string(), "");
        assert_eq!(Value::Decimal(2.5).to_string(), "2.5");
        assert_eq!(
            Value::Array(vec![Value::Integer(1), Value::string("a")]).to_string(),
            r#"[1,"a"]"#
        );
    }

    #[test]
    fn test_loose_equality_and_ordering() {
        assert!(Value::string("1").loose_eq(&Value::Integer(1)));
        assert!(!Value::Undefined.loose_eq(&Value::Integer(0)));
        assert!(Value::Undefined.loose_eq(&Value::Null));
        assert_eq!(
            Value::string("10").compare(&Value::Integer(9)),
            Some(Ordering::Greater)
        );
        assert_eq!(Value::Undefined.compare(&Value::Integer(1)), None);
    }

    #[test]
    fn test_set_path_creates_objects() {
        let mut value = Value::Undefined;
        value.set_path(&["a".to_string(), "b".to_string()], Value::Integer(1));
        assert_eq!(value.member("a").member("b"), Value::Integer(1));
    }
}

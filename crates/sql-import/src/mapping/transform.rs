//! Per-field coercion rules.
//!
//! Every rule maps a NULL source value to [`Value::Unset`] except `direct`,
//! which passes NULL through unchanged.

use crate::core::Value;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Named coercion applied to one field during import.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transform {
    #[default]
    Direct,
    Bool,
    Int,
    Float,
    Str,
    Date,
    Datetime,
}

impl Transform {
    pub const ALL: [Transform; 7] = [
        Transform::Direct,
        Transform::Bool,
        Transform::Int,
        Transform::Float,
        Transform::Str,
        Transform::Date,
        Transform::Datetime,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Transform::Direct => "direct",
            Transform::Bool => "bool",
            Transform::Int => "int",
            Transform::Float => "float",
            Transform::Str => "str",
            Transform::Date => "date",
            Transform::Datetime => "datetime",
        }
    }

    /// Coerce one source value. The error string is the underlying cause;
    /// callers attach the target field name.
    pub fn apply(&self, value: &Value) -> Result<Value, String> {
        if let Value::Null | Value::Unset = value {
            return Ok(match self {
                Transform::Direct => value.clone(),
                _ => Value::Unset,
            });
        }

        match self {
            Transform::Direct => Ok(value.clone()),
            Transform::Bool => Ok(Value::Bool(to_bool(value))),
            Transform::Int => to_int(value).map(Value::Int),
            Transform::Float => to_float(value),
            Transform::Str => to_str(value).map(Value::Text),
            Transform::Date => to_date(value),
            Transform::Datetime => to_datetime(value),
        }
    }
}

impl fmt::Display for Transform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Transform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Transform::ALL
            .iter()
            .find(|t| t.as_str() == s)
            .copied()
            .ok_or_else(|| {
                let valid: Vec<&str> = Transform::ALL.iter().map(|t| t.as_str()).collect();
                format!(
                    "invalid transform \"{}\". Valid transforms: {}",
                    s,
                    valid.join(", ")
                )
            })
    }
}

fn to_bool(value: &Value) -> bool {
    match value {
        Value::Null | Value::Unset => false,
        Value::Bool(b) => *b,
        Value::Int(n) => *n != 0,
        Value::Float(f) => *f != 0.0,
        Value::Decimal(d) => !d.is_zero(),
        Value::Text(s) => !matches!(
            s.trim().to_ascii_lowercase().as_str(),
            "" | "0" | "false" | "f" | "no" | "n" | "off"
        ),
        Value::Bytes(b) => !b.is_empty(),
        Value::Date(_) | Value::DateTime(_) => true,
    }
}

fn to_int(value: &Value) -> Result<i64, String> {
    match value {
        Value::Bool(b) => Ok(*b as i64),
        Value::Int(n) => Ok(*n),
        Value::Float(f) => {
            if f.is_finite() && f.abs() < i64::MAX as f64 {
                Ok(f.trunc() as i64)
            } else {
                Err(format!("float {} is out of integer range", f))
            }
        }
        Value::Decimal(d) => d
            .trunc()
            .to_i64()
            .ok_or_else(|| format!("decimal {} is out of integer range", d)),
        Value::Text(s) => s
            .trim()
            .parse::<i64>()
            .map_err(|e| format!("invalid integer literal '{}': {}", s, e)),
        other => Err(format!("cannot convert {} to int", other.kind())),
    }
}

fn to_float(value: &Value) -> Result<Value, String> {
    match value {
        Value::Bool(b) => Ok(Value::Float(if *b { 1.0 } else { 0.0 })),
        Value::Int(n) => Ok(Value::Float(*n as f64)),
        Value::Float(f) => Ok(Value::Float(*f)),
        // Exact numerics stay exact.
        Value::Decimal(d) => Ok(Value::Decimal(*d)),
        Value::Text(s) => {
            let trimmed = s.trim();
            if let Ok(d) = Decimal::from_str(trimmed) {
                return Ok(Value::Decimal(d));
            }
            trimmed
                .parse::<f64>()
                .map(Value::Float)
                .map_err(|e| format!("invalid float literal '{}': {}", s, e))
        }
        other => Err(format!("cannot convert {} to float", other.kind())),
    }
}

fn to_str(value: &Value) -> Result<String, String> {
    match value {
        Value::Text(s) if s.is_empty() => Ok(String::new()),
        Value::Text(s) => Ok(s.trim().to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Int(n) => Ok(n.to_string()),
        Value::Float(f) => Ok(f.to_string()),
        Value::Decimal(d) => Ok(d.to_string()),
        Value::Bytes(b) => String::from_utf8(b.clone())
            .map(|s| s.trim().to_string())
            .map_err(|e| format!("binary value is not valid UTF-8: {}", e)),
        Value::Date(d) => Ok(d.format("%Y-%m-%d").to_string()),
        Value::DateTime(dt) => Ok(dt.format("%Y-%m-%d %H:%M:%S%.f").to_string()),
        Value::Null | Value::Unset => Ok(String::new()),
    }
}

fn to_date(value: &Value) -> Result<Value, String> {
    match value {
        Value::Text(s) if s.trim().is_empty() => Ok(Value::Unset),
        Value::Text(s) => parse_datetime(s)
            .map(|dt| Value::Date(dt.date()))
            .ok_or_else(|| format!("unrecognised date '{}'", s)),
        Value::Date(d) => Ok(Value::Date(*d)),
        Value::DateTime(dt) => Ok(Value::Date(dt.date())),
        other => Err(format!("cannot convert {} to date", other.kind())),
    }
}

fn to_datetime(value: &Value) -> Result<Value, String> {
    match value {
        Value::Text(s) if s.trim().is_empty() => Ok(Value::Unset),
        Value::Text(s) => parse_datetime(s)
            .map(Value::DateTime)
            .ok_or_else(|| format!("unrecognised datetime '{}'", s)),
        Value::Date(d) => Ok(Value::DateTime(d.and_time(NaiveTime::MIN))),
        Value::DateTime(dt) => Ok(Value::DateTime(*dt)),
        other => Err(format!("cannot convert {} to datetime", other.kind())),
    }
}

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
    "%Y/%m/%d %H:%M:%S",
    "%m/%d/%Y %H:%M:%S",
    "%m/%d/%Y %H:%M",
    "%d.%m.%Y %H:%M:%S",
    "%b %d %Y %I:%M%p",
];

const DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d", "%Y/%m/%d", "%m/%d/%Y", "%d.%m.%Y", "%Y%m%d", "%b %d %Y", "%d %b %Y",
    "%B %d, %Y",
];

/// Lenient date/time parser for text columns holding dates.
///
/// Offsets are normalised to UTC. Date-only input yields midnight.
pub fn parse_datetime(input: &str) -> Option<NaiveDateTime> {
    let s = input.trim();
    if s.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.naive_utc());
    }
    if let Ok(dt) = DateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f %z") {
        return Some(dt.naive_utc());
    }

    for fmt in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(dt);
        }
    }

    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(s, fmt).ok())
        .map(|d| d.and_time(NaiveTime::MIN))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_null_maps_to_unset_except_direct() {
        assert_eq!(Transform::Direct.apply(&Value::Null).unwrap(), Value::Null);
        for t in Transform::ALL.iter().filter(|t| **t != Transform::Direct) {
            assert_eq!(t.apply(&Value::Null).unwrap(), Value::Unset, "{}", t);
        }
    }

    #[test]
    fn test_bool_truthiness() {
        assert_eq!(Transform::Bool.apply(&Value::Int(2)).unwrap(), Value::Bool(true));
        assert_eq!(Transform::Bool.apply(&Value::Int(0)).unwrap(), Value::Bool(false));
        assert_eq!(Transform::Bool.apply(&Value::from("yes")).unwrap(), Value::Bool(true));
        assert_eq!(Transform::Bool.apply(&Value::from("0")).unwrap(), Value::Bool(false));
        assert_eq!(Transform::Bool.apply(&Value::from("")).unwrap(), Value::Bool(false));
        for text in [" False ", "f", "NO", "n", "off"] {
            assert_eq!(Transform::Bool.apply(&Value::from(text)).unwrap(), Value::Bool(false), "{}", text);
        }
        for text in ["true", "1", "Y", "maybe", " 00 "] {
            assert_eq!(Transform::Bool.apply(&Value::from(text)).unwrap(), Value::Bool(true), "{}", text);
        }
    }

    #[test]
    fn test_int_coercion() {
        assert_eq!(Transform::Int.apply(&Value::from(" 42 ")).unwrap(), Value::Int(42));
        assert_eq!(Transform::Int.apply(&Value::Float(3.9)).unwrap(), Value::Int(3));
        assert_eq!(Transform::Int.apply(&Value::Bool(true)).unwrap(), Value::Int(1));
        assert!(Transform::Int.apply(&Value::from("abc")).is_err());
        assert!(Transform::Int.apply(&Value::Float(f64::NAN)).is_err());
    }

    #[test]
    fn test_float_keeps_decimal_precision() {
        let d = Decimal::from_str("19.50").unwrap();
        assert_eq!(Transform::Float.apply(&Value::Decimal(d)).unwrap(), Value::Decimal(d));
        assert_eq!(
            Transform::Float.apply(&Value::from("0.10")).unwrap(),
            Value::Decimal(Decimal::from_str("0.10").unwrap())
        );
        assert_eq!(Transform::Float.apply(&Value::from("1e3")).unwrap(), Value::Float(1000.0));
        assert!(Transform::Float.apply(&Value::from("n/a")).is_err());
    }

    #[test]
    fn test_str_keeps_empty_and_trims() {
        assert_eq!(Transform::Str.apply(&Value::from("")).unwrap(), Value::from(""));
        assert_eq!(Transform::Str.apply(&Value::from("  Acme ")).unwrap(), Value::from("Acme"));
        assert_eq!(Transform::Str.apply(&Value::Int(12)).unwrap(), Value::from("12"));
        assert_eq!(Transform::Str.apply(&Value::Null).unwrap(), Value::Unset);
    }

    #[test]
    fn test_date_from_text_and_datetime() {
        assert_eq!(
            Transform::Date.apply(&Value::from("2024-03-05")).unwrap(),
            Value::Date(ymd(2024, 3, 5))
        );
        let dt = ymd(2024, 3, 5).and_hms_opt(13, 4, 5).unwrap();
        assert_eq!(
            Transform::Date.apply(&Value::DateTime(dt)).unwrap(),
            Value::Date(ymd(2024, 3, 5))
        );
        assert_eq!(Transform::Date.apply(&Value::from("  ")).unwrap(), Value::Unset);
        assert!(Transform::Date.apply(&Value::from("not a date")).is_err());
    }

    #[test]
    fn test_datetime_parsing() {
        let expected = ymd(2023, 12, 31).and_hms_milli_opt(23, 59, 58, 250).unwrap();
        assert_eq!(
            Transform::Datetime
                .apply(&Value::from("2023-12-31 23:59:58.250"))
                .unwrap(),
            Value::DateTime(expected)
        );
        assert_eq!(
            Transform::Datetime
                .apply(&Value::from("2024-01-01T01:59:58.250+02:00"))
                .unwrap(),
            Value::DateTime(expected)
        );
        assert_eq!(
            Transform::Datetime.apply(&Value::Date(ymd(2024, 1, 2))).unwrap(),
            Value::DateTime(ymd(2024, 1, 2).and_hms_opt(0, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_parse_unknown_transform() {
        let err = "money".parse::<Transform>().unwrap_err();
        assert!(err.contains("money"));
        assert!(err.contains("datetime"));
        assert_eq!("str".parse::<Transform>().unwrap(), Transform::Str);
    }
}

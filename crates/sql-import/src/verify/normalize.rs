//! Canonical string forms for cross-store comparison.
//!
//! Both stores may hand back the same logical value in different physical
//! shapes (`19.50` vs `19.5`, microsecond vs millisecond timestamps, CRLF vs
//! LF). Every value is projected to one canonical string before comparing.
//!
//! Rules:
//! - NULL/unset: `NULL`
//! - Booleans: `1` / `0`
//! - Integers: decimal string
//! - Floats and decimals: integral values print as integers, otherwise
//!   fixed point with trailing zeros and a trailing `.` stripped
//! - Strings: trimmed, CRLF folded to LF, empty string as `""`
//! - Dates: `YYYY-MM-DD`; datetimes: `YYYY-MM-DD HH:MM:SS.mmm`
//! - Large binary/text: `LOB:<len>:<sig first 16 bytes>:<sig last 16 bytes>`
//!
//! Normalization is a projection: feeding a normalized string back in as
//! text yields the same string.

use crate::core::Value;
use sha2::{Digest, Sha256};

/// Token for NULL and unset values.
pub const NULL_TOKEN: &str = "NULL";

/// Token for an explicit empty string.
pub const EMPTY_TOKEN: &str = "\"\"";

/// Binary values up to this size are compared in full (hex).
const INLINE_BYTES_MAX: usize = 32;

/// Text values up to this size (in bytes) are compared in full.
const INLINE_TEXT_MAX: usize = 4096;

/// Bytes hashed at each end of a large value.
const LOB_EDGE: usize = 16;

/// Fractional digits kept for floats and decimals.
const FRACTION_DIGITS: u32 = 10;

/// Canonical string for one value.
pub fn normalize(value: &Value) -> String {
    match value {
        Value::Null | Value::Unset => NULL_TOKEN.to_string(),
        Value::Bool(true) => "1".to_string(),
        Value::Bool(false) => "0".to_string(),
        Value::Int(n) => n.to_string(),
        Value::Float(f) => normalize_float(*f),
        Value::Decimal(d) => d.round_dp(FRACTION_DIGITS).normalize().to_string(),
        Value::Text(s) => normalize_text(s),
        Value::Bytes(b) if b.len() <= INLINE_BYTES_MAX => hex::encode(b),
        Value::Bytes(b) => lob_proxy(b),
        Value::Date(d) => d.format("%Y-%m-%d").to_string(),
        Value::DateTime(dt) => dt.format("%Y-%m-%d %H:%M:%S%.3f").to_string(),
    }
}

/// Normalize every value of a row, keeping positions.
pub fn normalize_row(values: &[Value]) -> Vec<String> {
    values.iter().map(normalize).collect()
}

/// 64-bit checksum over a normalized row.
///
/// First 8 bytes (big-endian) of SHA-256 over the `|`-joined values.
pub fn row_checksum(normalized: &[String]) -> u64 {
    let mut hasher = Sha256::new();
    for (i, v) in normalized.iter().enumerate() {
        if i > 0 {
            hasher.update(b"|");
        }
        hasher.update(v.as_bytes());
    }
    let digest = hasher.finalize();
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(prefix)
}

fn normalize_float(f: f64) -> String {
    if !f.is_finite() {
        return f.to_string();
    }

    let fixed = format!("{:.*}", FRACTION_DIGITS as usize, f);
    let trimmed = fixed.trim_end_matches('0').trim_end_matches('.');

    match trimmed {
        "-0" | "" => "0".to_string(),
        other => other.to_string(),
    }
}

fn normalize_text(s: &str) -> String {
    if s.len() > INLINE_TEXT_MAX {
        return lob_proxy(s.as_bytes());
    }

    let folded = s.trim().replace("\r\n", "\n");
    if folded.is_empty() {
        EMPTY_TOKEN.to_string()
    } else {
        folded
    }
}

fn lob_proxy(bytes: &[u8]) -> String {
    let head = &bytes[..LOB_EDGE.min(bytes.len())];
    let tail = &bytes[bytes.len().saturating_sub(LOB_EDGE)..];
    format!("LOB:{}:{}:{}", bytes.len(), signature(head), signature(tail))
}

/// Short content signature: first 4 bytes of SHA-256, hex.
fn signature(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    hex::encode(&digest[..4])
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use rust_decimal::Decimal;
    use std::str::FromStr;

    fn all_kinds() -> Vec<Value> {
        let date = NaiveDate::from_ymd_opt(2024, 2, 29).unwrap();
        vec![
            Value::Null,
            Value::Unset,
            Value::Bool(true),
            Value::Bool(false),
            Value::Int(-42),
            Value::Float(19.5),
            Value::Float(3.0),
            Value::Float(-0.0),
            Value::Decimal(Decimal::from_str("19.50").unwrap()),
            Value::from("  padded \r\nline  "),
            Value::from(""),
            Value::from("x".repeat(5000)),
            Value::Bytes(vec![0xde, 0xad, 0xbe, 0xef]),
            Value::Bytes((0..200u8).collect()),
            Value::Date(date),
            Value::DateTime(date.and_hms_micro_opt(13, 45, 7, 123_456).unwrap()),
        ]
    }

    #[test]
    fn test_null_and_unset_share_token() {
        assert_eq!(normalize(&Value::Null), "NULL");
        assert_eq!(normalize(&Value::Unset), "NULL");
    }

    #[test]
    fn test_empty_string_distinct_from_null() {
        assert_eq!(normalize(&Value::from("")), "\"\"");
        assert_eq!(normalize(&Value::from("   ")), "\"\"");
        assert_ne!(normalize(&Value::from("")), normalize(&Value::Null));
    }

    #[test]
    fn test_scalars() {
        assert_eq!(normalize(&Value::Bool(true)), "1");
        assert_eq!(normalize(&Value::Bool(false)), "0");
        assert_eq!(normalize(&Value::Int(-42)), "-42");
        assert_eq!(normalize(&Value::from("  Acme \r\nCorp ")), "Acme \nCorp");
    }

    #[test]
    fn test_float_forms() {
        assert_eq!(normalize(&Value::Float(19.5)), "19.5");
        assert_eq!(normalize(&Value::Float(19.50)), "19.5");
        assert_eq!(normalize(&Value::Float(3.0)), "3");
        assert_eq!(normalize(&Value::Float(-0.0)), "0");
        assert_eq!(normalize(&Value::Float(0.1 + 0.2)), "0.3");
        assert_eq!(normalize(&Value::Float(-2.25)), "-2.25");
    }

    #[test]
    fn test_decimal_matches_float() {
        let d = Value::Decimal(Decimal::from_str("19.50").unwrap());
        assert_eq!(normalize(&d), normalize(&Value::Float(19.5)));

        let whole = Value::Decimal(Decimal::from_str("100.000").unwrap());
        assert_eq!(normalize(&whole), "100");
    }

    #[test]
    fn test_datetime_millisecond_precision() {
        let date = NaiveDate::from_ymd_opt(2024, 2, 29).unwrap();
        let micro = date.and_hms_micro_opt(13, 45, 7, 123_456).unwrap();
        let milli = date.and_hms_milli_opt(13, 45, 7, 123).unwrap();

        assert_eq!(normalize(&Value::DateTime(micro)), "2024-02-29 13:45:07.123");
        assert_eq!(
            normalize(&Value::DateTime(micro)),
            normalize(&Value::DateTime(milli))
        );
        assert_eq!(normalize(&Value::Date(date)), "2024-02-29");
    }

    #[test]
    fn test_small_binary_inline() {
        assert_eq!(normalize(&Value::Bytes(vec![0xde, 0xad, 0xbe, 0xef])), "deadbeef");
    }

    #[test]
    fn test_large_binary_proxy() {
        let blob: Vec<u8> = (0..200u8).collect();
        let n = normalize(&Value::Bytes(blob.clone()));
        let parts: Vec<&str> = n.split(':').collect();
        assert_eq!(parts[0], "LOB");
        assert_eq!(parts[1], "200");
        assert_eq!(parts[2].len(), 8);
        assert_eq!(parts[3].len(), 8);

        // A change in the middle is outside the proxy's view.
        let mut middle = blob.clone();
        middle[100] ^= 0xff;
        assert_eq!(normalize(&Value::Bytes(middle)), n);

        // A change at either end is not.
        let mut tail = blob;
        tail[199] ^= 0xff;
        assert_ne!(normalize(&Value::Bytes(tail)), n);
    }

    #[test]
    fn test_large_text_proxy() {
        let text = "y".repeat(INLINE_TEXT_MAX + 1);
        assert!(normalize(&Value::from(text)).starts_with("LOB:4097:"));
    }

    #[test]
    fn test_normalization_is_idempotent() {
        for value in all_kinds() {
            let once = normalize(&value);
            let twice = normalize(&Value::Text(once.clone()));
            assert_eq!(once, twice, "not idempotent for {:?}", value);
        }
    }

    #[test]
    fn test_checksum_is_deterministic() {
        let row = normalize_row(&[Value::from("Acme"), Value::Int(7), Value::Null]);
        assert_eq!(row_checksum(&row), row_checksum(&row.clone()));
    }

    #[test]
    fn test_checksum_separates_fields() {
        let a = vec!["ab".to_string(), "c".to_string()];
        let b = vec!["a".to_string(), "bc".to_string()];
        assert_ne!(row_checksum(&a), row_checksum(&b));
    }

    #[test]
    fn test_char_code_sum_collides_where_checksum_does_not() {
        // Summing character codes cannot tell transposed values apart.
        fn char_code_sum(values: &[String]) -> u64 {
            values
                .iter()
                .flat_map(|v| v.chars())
                .map(|c| c as u64)
                .sum()
        }

        let a = vec!["ab".to_string()];
        let b = vec!["ba".to_string()];
        assert_eq!(char_code_sum(&a), char_code_sum(&b));
        assert_ne!(row_checksum(&a), row_checksum(&b));

        let c = vec!["19.5".to_string(), "NULL".to_string()];
        let d = vec!["NULL".to_string(), "19.5".to_string()];
        assert_eq!(char_code_sum(&c), char_code_sum(&d));
        assert_ne!(row_checksum(&c), row_checksum(&d));
    }
}

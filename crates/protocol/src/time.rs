//! Timestamp normalization
//!
//! Upstream payloads carry timestamps as epoch seconds, epoch milliseconds,
//! numeric strings, or RFC 3339 strings depending on the event. Everything
//! lands in storage as epoch milliseconds.

use chrono::{DateTime, Utc};
use serde_json::Value;

// Values below this are epoch seconds; at or above, already milliseconds.
const MS_CUTOFF: i64 = 1_000_000_000_000;

/// Normalize a raw timestamp value to epoch milliseconds.
pub fn normalize_timestamp_ms(raw: &Value) -> Option<i64> {
    match raw {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(scale(i))
            } else {
                n.as_f64().map(scale_f64)
            }
        }
        Value::String(s) => {
            if let Ok(i) = s.parse::<i64>() {
                Some(scale(i))
            } else if let Ok(f) = s.parse::<f64>() {
                Some(scale_f64(f))
            } else {
                DateTime::parse_from_rfc3339(s)
                    .ok()
                    .map(|dt| dt.timestamp_millis())
            }
        }
        _ => None,
    }
}

/// Current time as epoch milliseconds.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn scale(v: i64) -> i64 {
    if v.abs() < MS_CUTOFF {
        v.saturating_mul(1000)
    } else {
        v
    }
}

fn scale_f64(v: f64) -> i64 {
    if v.abs() < MS_CUTOFF as f64 {
        (v * 1000.0) as i64
    } else {
        v as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn seconds_scale_to_millis() {
        assert_eq!(normalize_timestamp_ms(&json!(1_714_000_000)), Some(1_714_000_000_000));
        assert_eq!(normalize_timestamp_ms(&json!(1_714_000_000.5)), Some(1_714_000_000_500));
    }

    #[test]
    fn millis_pass_through() {
        assert_eq!(normalize_timestamp_ms(&json!(1_714_000_000_123i64)), Some(1_714_000_000_123));
    }

    #[test]
    fn numeric_strings_parse() {
        assert_eq!(normalize_timestamp_ms(&json!("1714000000")), Some(1_714_000_000_000));
        assert_eq!(normalize_timestamp_ms(&json!("1714000000123")), Some(1_714_000_000_123));
    }

    #[test]
    fn rfc3339_strings_parse() {
        let got = normalize_timestamp_ms(&json!("2024-04-24T22:26:40Z"));
        assert_eq!(got, Some(1_713_997_600_000));
    }

    #[test]
    fn garbage_is_none() {
        assert_eq!(normalize_timestamp_ms(&json!("not a time")), None);
        assert_eq!(normalize_timestamp_ms(&json!(null)), None);
        assert_eq!(normalize_timestamp_ms(&json!({"nested": 1})), None);
    }
}

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use core::fmt;
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Raw timestamps that could not be resolved to a UTC instant.
#[derive(Debug, Clone, PartialEq)]
pub struct TimestampParseError {
    pub raw: String,
}

impl Display for TimestampParseError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "unparseable timestamp: {}", self.raw)
    }
}

impl Error for TimestampParseError {}

/// Epoch values longer than 10 digits are milliseconds.
const EPOCH_MILLIS_THRESHOLD: f64 = 10_000_000_000.0;

fn from_epoch(mut value: f64) -> Option<DateTime<Utc>> {
    if value.abs() >= EPOCH_MILLIS_THRESHOLD {
        value /= 1000.0;
    }
    DateTime::from_timestamp(value as i64, 0)
}

/// Resolve a vendor timestamp into a UTC, second-precision instant.
///
/// Accepts numeric epoch seconds or milliseconds (JSON number or an
/// all-digits string) and the formatted shape `YYYY-MM-DD HH:MM:SS`, which
/// every vendor delivers in UTC.
pub fn parse_timestamp(raw: &serde_json::Value) -> Result<DateTime<Utc>, TimestampParseError> {
    let err = || TimestampParseError { raw: raw.to_string() };

    match raw {
        serde_json::Value::Number(n) => {
            let value = n.as_f64().ok_or_else(err)?;
            from_epoch(value).ok_or_else(err)
        }
        serde_json::Value::String(s) => {
            let s = s.trim();
            if s.is_empty() {
                return Err(err());
            }
            // Numeric strings are epoch values ("1718000000000").
            if s.chars().all(|c| c.is_ascii_digit() || c == '.') {
                let value: f64 = s.parse().map_err(|_| err())?;
                return from_epoch(value).ok_or_else(err);
            }
            NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
                .map(|dt| dt.and_utc())
                .map_err(|_| err())
        }
        _ => Err(err()),
    }
}

/// Vendor install dates arrive as epoch seconds/millis or as a `YYYY-MM-DD`
/// prefix of a longer string; anything else is treated as absent.
pub fn parse_install_date(raw: &serde_json::Value) -> Option<NaiveDate> {
    match raw {
        serde_json::Value::Number(n) => from_epoch(n.as_f64()?).map(|dt| dt.date_naive()),
        serde_json::Value::String(s) => {
            let s = s.trim();
            if s.len() >= 10 {
                s.get(..10)
                    .and_then(|prefix| NaiveDate::parse_from_str(prefix, "%Y-%m-%d").ok())
            } else if s.chars().all(|c| c.is_ascii_digit()) && !s.is_empty() {
                from_epoch(s.parse().ok()?).map(|dt| dt.date_naive())
            } else {
                None
            }
        }
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IdentifierError {
    pub raw: String,
}

impl Display for IdentifierError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "customer id {:?} yields no usable table identifier", self.raw)
    }
}

impl Error for IdentifierError {}

/// Reduce a customer id to a safe SQL identifier fragment: lower-cased,
/// `[a-z0-9_]` only, runs of other characters collapsed to one underscore.
/// Customer ids are operator-supplied, but they still pass through dynamic
/// DDL/DML and are never interpolated unsanitized.
pub fn sanitize_identifier(raw: &str) -> Result<String, IdentifierError> {
    let mut out = String::with_capacity(raw.len());
    let mut last_was_filler = false;
    for c in raw.trim().to_lowercase().chars() {
        if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' {
            out.push(c);
            last_was_filler = false;
        } else if !last_was_filler {
            out.push('_');
            last_was_filler = true;
        }
    }
    let out = out.trim_matches('_').to_string();
    if out.is_empty() {
        return Err(IdentifierError { raw: raw.to_string() });
    }
    Ok(out)
}

/// Per-customer real-time table name. Historical rows go to the shared
/// `device_data_historical` table instead.
pub fn realtime_table_name(customer_id: &str) -> Result<String, IdentifierError> {
    Ok(format!("customer_{}_device_data", sanitize_identifier(customer_id)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn millis_and_seconds_agree() {
        let ms = parse_timestamp(&json!(1_718_000_000_000_i64)).unwrap();
        let s = parse_timestamp(&json!(1_718_000_000_i64)).unwrap();
        assert_eq!(ms, s);
        assert_eq!(ms.timestamp(), 1_718_000_000);
    }

    #[test]
    fn formatted_string_is_utc() {
        let ts = parse_timestamp(&json!("2024-06-10 06:13:20")).unwrap();
        assert_eq!(ts.to_rfc3339(), "2024-06-10T06:13:20+00:00");
    }

    #[test]
    fn numeric_string_epoch() {
        let ts = parse_timestamp(&json!("1718000000")).unwrap();
        assert_eq!(ts.timestamp(), 1_718_000_000);
    }

    #[test]
    fn garbage_timestamp_is_an_error() {
        assert!(parse_timestamp(&json!("not a time")).is_err());
        assert!(parse_timestamp(&json!(null)).is_err());
        assert!(parse_timestamp(&json!("")).is_err());
    }

    #[test]
    fn install_date_variants() {
        assert_eq!(
            parse_install_date(&json!("2023-04-01")),
            NaiveDate::from_ymd_opt(2023, 4, 1)
        );
        assert_eq!(
            parse_install_date(&json!("2023-04-01 10:00:00")),
            NaiveDate::from_ymd_opt(2023, 4, 1)
        );
        assert_eq!(
            parse_install_date(&json!(1_718_000_000_000_i64)),
            NaiveDate::from_ymd_opt(2024, 6, 10)
        );
        assert_eq!(parse_install_date(&json!("soon")), None);
    }

    #[test]
    fn identifier_sanitization() {
        assert_eq!(sanitize_identifier("ACME Corp-01").unwrap(), "acme_corp_01");
        assert_eq!(sanitize_identifier("plain").unwrap(), "plain");
        assert_eq!(
            sanitize_identifier("x; DROP TABLE devices;--").unwrap(),
            "x_drop_table_devices"
        );
        assert!(sanitize_identifier("!!!").is_err());
    }

    #[test]
    fn realtime_table_naming() {
        assert_eq!(
            realtime_table_name("Acme-01").unwrap(),
            "customer_acme_01_device_data"
        );
    }
}

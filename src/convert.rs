//! Conversion of raw source scalars to canonical catalog values.
//!
//! Every keyword declares one of five types; [`convert`] turns the raw value
//! read from a FITS card or VOTable cell into that type. Conversions are
//! pure and never consult the clock: partial date-times are completed from
//! a fixed default date so results are reproducible.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime};
use thiserror::Error;

use crate::models::{FieldValue, KeywordType, RawValue};

/// Date used to complete partial date-time strings.
pub const DEFAULT_DATE: (i32, u32, u32) = (2000, 1, 1);

/// Formats tried for date-times without an explicit UTC offset.
const NAIVE_DATE_TIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
    "%Y/%m/%dT%H:%M:%S%.f",
    "%Y/%m/%d %H:%M:%S%.f",
    "%Y%m%dT%H%M%S%.f",
    "%Y-%jT%H:%M:%S%.f",
];

/// Formats tried for date-times carrying an offset.
const OFFSET_DATE_TIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f%:z",
    "%Y-%m-%d %H:%M:%S%.f%:z",
    "%Y-%m-%dT%H:%M:%S%.f%z",
    "%Y-%m-%d %H:%M:%S%.f%z",
];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%Y%m%d", "%d/%m/%y"];

const TIME_FORMATS: &[&str] = &["%H:%M:%S%.f", "%H:%M"];

/// A raw value could not be converted to its declared type.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("could not convert value \"{value}\" to {target}: {reason}")]
pub struct ConversionError {
    pub value: String,
    pub target: KeywordType,
    pub reason: String,
}

impl ConversionError {
    fn new(value: &RawValue, target: KeywordType, reason: impl Into<String>) -> Self {
        Self {
            value: value.to_string(),
            target,
            reason: reason.into(),
        }
    }
}

/// Convert a raw value to the canonical value of `target`.
///
/// Null raw values stay null for every type. Non-finite reals become null.
pub fn convert(raw: &RawValue, target: KeywordType) -> Result<FieldValue, ConversionError> {
    if raw.is_null() {
        return Ok(FieldValue::Null);
    }
    match target {
        KeywordType::Text => Ok(FieldValue::Text(to_text(raw))),
        KeywordType::Boolean => Ok(FieldValue::Boolean(truthiness(raw))),
        KeywordType::Integer => to_integer(raw).map(FieldValue::Integer),
        KeywordType::Real => to_real(raw).map(|x| {
            if x.is_finite() {
                FieldValue::Real(x)
            } else {
                FieldValue::Null
            }
        }),
        KeywordType::Time => match raw {
            RawValue::Text(s) => parse_date_time(s)
                .map(FieldValue::Time)
                .map_err(|reason| ConversionError::new(raw, target, reason)),
            _ => Err(ConversionError::new(
                raw,
                target,
                "expected a date-time string",
            )),
        },
    }
}

fn to_text(raw: &RawValue) -> String {
    match raw {
        RawValue::Text(s) => s.clone(),
        other => other.to_string(),
    }
}

fn truthiness(raw: &RawValue) -> bool {
    match raw {
        RawValue::Null => false,
        RawValue::Boolean(b) => *b,
        RawValue::Integer(n) => *n != 0,
        RawValue::Real(x) => *x != 0.0,
        RawValue::Text(s) => !s.is_empty(),
    }
}

fn to_integer(raw: &RawValue) -> Result<i64, ConversionError> {
    match raw {
        RawValue::Boolean(b) => Ok(i64::from(*b)),
        RawValue::Integer(n) => Ok(*n),
        RawValue::Real(x) => {
            if x.is_finite() && x.fract() == 0.0 && x.abs() < i64::MAX as f64 {
                Ok(*x as i64)
            } else {
                Err(ConversionError::new(
                    raw,
                    KeywordType::Integer,
                    "not an integral value",
                ))
            }
        }
        RawValue::Text(s) => s
            .trim()
            .parse::<i64>()
            .map_err(|e| ConversionError::new(raw, KeywordType::Integer, e.to_string())),
        RawValue::Null => Err(ConversionError::new(raw, KeywordType::Integer, "null")),
    }
}

fn to_real(raw: &RawValue) -> Result<f64, ConversionError> {
    match raw {
        RawValue::Boolean(b) => Ok(if *b { 1.0 } else { 0.0 }),
        RawValue::Integer(n) => Ok(*n as f64),
        RawValue::Real(x) => Ok(*x),
        RawValue::Text(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|e| ConversionError::new(raw, KeywordType::Real, e.to_string())),
        RawValue::Null => Err(ConversionError::new(raw, KeywordType::Real, "null")),
    }
}

fn default_date() -> NaiveDate {
    let (y, m, d) = DEFAULT_DATE;
    NaiveDate::from_ymd_opt(y, m, d).unwrap_or_default()
}

/// Parse an ISO-8601-like date-time string.
///
/// Values with an offset are converted to UTC. Missing components are taken
/// from [`DEFAULT_DATE`] at midnight, never from the current date.
pub fn parse_date_time(input: &str) -> Result<NaiveDateTime, String> {
    let s = input.trim();
    if s.is_empty() {
        return Err("empty date-time string".to_string());
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.naive_utc());
    }
    for format in OFFSET_DATE_TIME_FORMATS {
        if let Ok(dt) = DateTime::parse_from_str(s, format) {
            return Ok(dt.naive_utc());
        }
    }

    // A trailing Z means UTC, which is what naive values already are.
    let s = s
        .strip_suffix('Z')
        .or_else(|| s.strip_suffix('z'))
        .unwrap_or(s);

    for format in NAIVE_DATE_TIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, format) {
            return Ok(dt);
        }
    }
    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(s, format) {
            return Ok(date.and_time(NaiveTime::MIN));
        }
    }
    for format in TIME_FORMATS {
        if let Ok(time) = NaiveTime::parse_from_str(s, format) {
            return Ok(default_date().and_time(time));
        }
    }
    if let Some(date) = parse_partial_date(s) {
        return Ok(date.and_time(NaiveTime::MIN));
    }

    Err(format!("\"{}\" is not a valid date-time", input))
}

/// `YYYY` or `YYYY-MM`, completed from the default date.
fn parse_partial_date(s: &str) -> Option<NaiveDate> {
    let default = default_date();
    let mut parts = s.splitn(2, '-');
    let year = parts.next()?;
    if year.len() != 4 || !year.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let year: i32 = year.parse().ok()?;
    let month = match parts.next() {
        Some(m) if m.len() == 2 && m.bytes().all(|b| b.is_ascii_digit()) => m.parse().ok()?,
        Some(_) => return None,
        None => chrono::Datelike::month(&default),
    };
    NaiveDate::from_ymd_opt(year, month, chrono::Datelike::day(&default))
}

/// Compact numeric timestamp used as the default observation id.
pub fn compact_timestamp(t: &NaiveDateTime) -> String {
    t.format("%Y%m%d%H%M%S").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dt(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, mo, d)
            .unwrap()
            .and_hms_opt(h, mi, s)
            .unwrap()
    }

    #[test]
    fn text_conversion() {
        assert_eq!(
            convert(&RawValue::Text("SWAP".into()), KeywordType::Text).unwrap(),
            FieldValue::Text("SWAP".into())
        );
        assert_eq!(
            convert(&RawValue::Integer(174), KeywordType::Text).unwrap(),
            FieldValue::Text("174".into())
        );
        assert_eq!(
            convert(&RawValue::Boolean(true), KeywordType::Text).unwrap(),
            FieldValue::Text("True".into())
        );
    }

    #[test]
    fn boolean_uses_native_truthiness() {
        assert_eq!(
            convert(&RawValue::Boolean(false), KeywordType::Boolean).unwrap(),
            FieldValue::Boolean(false)
        );
        assert_eq!(
            convert(&RawValue::Integer(0), KeywordType::Boolean).unwrap(),
            FieldValue::Boolean(false)
        );
        assert_eq!(
            convert(&RawValue::Real(2.5), KeywordType::Boolean).unwrap(),
            FieldValue::Boolean(true)
        );
        assert_eq!(
            convert(&RawValue::Text(String::new()), KeywordType::Boolean).unwrap(),
            FieldValue::Boolean(false)
        );
    }

    #[test]
    fn integer_requires_integral_value() {
        assert_eq!(
            convert(&RawValue::Text(" 42 ".into()), KeywordType::Integer).unwrap(),
            FieldValue::Integer(42)
        );
        assert_eq!(
            convert(&RawValue::Real(3.0), KeywordType::Integer).unwrap(),
            FieldValue::Integer(3)
        );
        let err = convert(&RawValue::Real(2.5), KeywordType::Integer).unwrap_err();
        assert_eq!(err.target, KeywordType::Integer);
        assert_eq!(err.value, "2.5");
        assert!(convert(&RawValue::Text("abc".into()), KeywordType::Integer).is_err());
    }

    #[test]
    fn real_conversion_and_non_finite_values() {
        assert_eq!(
            convert(&RawValue::Integer(171), KeywordType::Real).unwrap(),
            FieldValue::Real(171.0)
        );
        assert_eq!(
            convert(&RawValue::Text("1.5e3".into()), KeywordType::Real).unwrap(),
            FieldValue::Real(1500.0)
        );
        for raw in [
            RawValue::Real(f64::NAN),
            RawValue::Real(f64::INFINITY),
            RawValue::Real(f64::NEG_INFINITY),
            RawValue::Text("NaN".into()),
            RawValue::Text("inf".into()),
        ] {
            assert_eq!(convert(&raw, KeywordType::Real).unwrap(), FieldValue::Null);
        }
        assert!(convert(&RawValue::Text("n/a".into()), KeywordType::Real).is_err());
    }

    #[test]
    fn null_stays_null() {
        for t in KeywordType::ALL {
            assert_eq!(convert(&RawValue::Null, t).unwrap(), FieldValue::Null);
        }
    }

    #[test]
    fn time_formats() {
        let cases = [
            ("2000-01-01T00:00:00", dt(2000, 1, 1, 0, 0, 0)),
            ("2000-01-01T00:00:00Z", dt(2000, 1, 1, 0, 0, 0)),
            ("2021-03-04T05:06:07.250", dt(2021, 3, 4, 5, 6, 7) + chrono::Duration::milliseconds(250)),
            ("2021-03-04 05:06:07", dt(2021, 3, 4, 5, 6, 7)),
            ("2021-03-04T07:06:07+02:00", dt(2021, 3, 4, 5, 6, 7)),
            ("2021-03-04", dt(2021, 3, 4, 0, 0, 0)),
            ("2021/03/04", dt(2021, 3, 4, 0, 0, 0)),
            ("20210304T050607", dt(2021, 3, 4, 5, 6, 7)),
            ("2021-03", dt(2021, 3, 1, 0, 0, 0)),
            ("2021", dt(2021, 1, 1, 0, 0, 0)),
        ];
        for (input, expected) in cases {
            assert_eq!(parse_date_time(input).unwrap(), expected, "input {}", input);
        }
    }

    #[test]
    fn partial_time_uses_fixed_default_date() {
        assert_eq!(parse_date_time("12:30:00").unwrap(), dt(2000, 1, 1, 12, 30, 0));
        assert_eq!(parse_date_time("08:15").unwrap(), dt(2000, 1, 1, 8, 15, 0));
    }

    #[test]
    fn invalid_times_fail() {
        assert!(parse_date_time("2000-01-01T24:00:00Z").is_err());
        assert!(parse_date_time("yesterday").is_err());
        assert!(parse_date_time("").is_err());
        let err = convert(&RawValue::Integer(2000), KeywordType::Time).unwrap_err();
        assert_eq!(err.target, KeywordType::Time);
    }

    #[test]
    fn compact_timestamp_for_oid() {
        assert_eq!(compact_timestamp(&dt(2000, 1, 1, 0, 0, 0)), "20000101000000");
    }
}

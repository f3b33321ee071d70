//! Prometheus-style duration strings
//!
//! Retention periods and probe cadences are configured the way the TSDB
//! itself expresses them: `90s`, `12h`, `30d`, `1w`, `1y`, or compound
//! forms like `1h30m`. A week is seven days and a year 365 days, matching
//! the TSDB's convention.

use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum DurationError {
    #[error("empty duration string")]
    Empty,
    #[error("invalid duration: {0}")]
    Invalid(String),
}

const UNITS: &[(&str, u64)] = &[
    ("ms", 1),
    ("s", 1_000),
    ("m", 60 * 1_000),
    ("h", 3_600 * 1_000),
    ("d", 24 * 3_600 * 1_000),
    ("w", 7 * 24 * 3_600 * 1_000),
    ("y", 365 * 24 * 3_600 * 1_000),
];

pub fn parse_duration(s: &str) -> Result<Duration, DurationError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(DurationError::Empty);
    }
    if s == "0" {
        return Ok(Duration::ZERO);
    }

    let mut total_ms = 0u64;
    let mut rest = s;
    while !rest.is_empty() {
        let digits_end = rest
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| DurationError::Invalid(s.to_string()))?;
        if digits_end == 0 {
            return Err(DurationError::Invalid(s.to_string()));
        }
        let value: u64 = rest[..digits_end]
            .parse()
            .map_err(|_| DurationError::Invalid(s.to_string()))?;
        rest = &rest[digits_end..];

        // "ms" must be tried before "m".
        let (unit, ms_per_unit) = UNITS
            .iter()
            .find(|(unit, _)| rest.starts_with(unit) && (*unit != "m" || !rest.starts_with("ms")))
            .ok_or_else(|| DurationError::Invalid(s.to_string()))?;
        rest = &rest[unit.len()..];

        total_ms = total_ms
            .checked_add(
                value
                    .checked_mul(*ms_per_unit)
                    .ok_or_else(|| DurationError::Invalid(s.to_string()))?,
            )
            .ok_or_else(|| DurationError::Invalid(s.to_string()))?;
    }

    Ok(Duration::from_millis(total_ms))
}

/// Render a duration back into the largest-units-first compound form.
/// `parse_duration(format_duration(d)) == d` for millisecond-granular
/// durations.
pub fn format_duration(d: Duration) -> String {
    let mut ms = d.as_millis() as u64;
    if ms == 0 {
        return "0s".to_string();
    }

    let mut out = String::new();
    for (unit, ms_per_unit) in UNITS.iter().rev() {
        if ms >= *ms_per_unit {
            let count = ms / ms_per_unit;
            ms %= ms_per_unit;
            out.push_str(&format!("{count}{unit}"));
        }
    }
    out
}

/// Serde helper for duration fields in the YAML configuration.
pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    parse_duration(&s).map_err(serde::de::Error::custom)
}

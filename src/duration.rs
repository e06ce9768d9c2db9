//! Go-style duration strings (`30s`, `1m30s`, `500ms`) as used in resource
//! specs and the controller configuration.

use regex::Regex;
use serde::{Deserialize, Deserializer};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DurationError {
    #[error("duration string cannot be empty")]
    Empty,
    #[error("invalid duration {0:?}, expected e.g. '30s', '1m' or '1h30m'")]
    Invalid(String),
    #[error("duration {0:?} must be greater than zero")]
    Zero(String),
}

pub fn parse_duration(input: &str) -> Result<Duration, DurationError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(DurationError::Empty);
    }

    let invalid = || DurationError::Invalid(trimmed.to_string());
    let whole = Regex::new(r"^(?:\d+(?:ms|s|m|h))+$").map_err(|_| invalid())?;
    if !whole.is_match(trimmed) {
        return Err(invalid());
    }

    let part = Regex::new(r"(\d+)(ms|s|m|h)").map_err(|_| invalid())?;
    let mut total = Duration::ZERO;
    for caps in part.captures_iter(trimmed) {
        let number: u64 = caps[1].parse().map_err(|_| invalid())?;
        let component = match &caps[2] {
            "ms" => Duration::from_millis(number),
            "s" => Duration::from_secs(number),
            "m" => Duration::from_secs(number.checked_mul(60).ok_or_else(invalid)?),
            "h" => Duration::from_secs(number.checked_mul(3600).ok_or_else(invalid)?),
            _ => return Err(invalid()),
        };
        total = total.checked_add(component).ok_or_else(invalid)?;
    }

    if total.is_zero() {
        return Err(DurationError::Zero(trimmed.to_string()));
    }
    Ok(total)
}

/// Inverse of [`parse_duration`] for whole milliseconds.
pub fn format_duration(duration: Duration) -> String {
    let total_millis = duration.as_millis();
    if total_millis == 0 {
        return "0s".to_string();
    }

    let hours = total_millis / 3_600_000;
    let minutes = (total_millis / 60_000) % 60;
    let seconds = (total_millis / 1000) % 60;
    let millis = total_millis % 1000;

    let mut out = String::new();
    for (value, unit) in [(hours, "h"), (minutes, "m"), (seconds, "s"), (millis, "ms")] {
        if value > 0 {
            out.push_str(&format!("{}{}", value, unit));
        }
    }
    out
}

/// Serde adapter for configuration fields holding a duration string.
pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_duration(&raw).map_err(serde::de::Error::custom)
}

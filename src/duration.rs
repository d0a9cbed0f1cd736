//! Human duration strings such as `1h`, `10h`, `1h30m` or `500ms`.

use chrono::Duration;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DurationError {
    #[error("empty duration")]
    Empty,
    #[error("invalid duration: {0}")]
    Invalid(String),
    #[error("unknown duration unit '{unit}' in {input}")]
    UnknownUnit { input: String, unit: String },
    #[error("duration out of range: {0}")]
    OutOfRange(String),
}

/// Parses a duration made of one or more `<number><unit>` parts.
///
/// Units: `ns`, `us`, `ms`, `s`, `m`, `h`, `d`, `w`. A bare `0` is the zero
/// duration. Parts may repeat units and are summed (`1h30m`).
pub fn parse_duration(input: &str) -> Result<Duration, DurationError> {
    let raw = input.trim();
    if raw.is_empty() {
        return Err(DurationError::Empty);
    }
    if raw == "0" {
        return Ok(Duration::zero());
    }

    let (negative, body) = match raw.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, raw),
    };

    let mut total_ns: i128 = 0;
    let mut chars = body.char_indices().peekable();
    let mut parts = 0;

    while chars.peek().is_some() {
        let start = chars.peek().map(|(i, _)| *i).unwrap_or(0);
        let mut end = start;
        while let Some((i, c)) = chars.peek().copied() {
            if c.is_ascii_digit() || c == '.' {
                end = i + c.len_utf8();
                chars.next();
            } else {
                break;
            }
        }
        if end == start {
            return Err(DurationError::Invalid(input.to_string()));
        }
        let number: f64 = body[start..end]
            .parse()
            .map_err(|_| DurationError::Invalid(input.to_string()))?;

        let unit_start = end;
        let mut unit_end = end;
        while let Some((i, c)) = chars.peek().copied() {
            if c.is_ascii_alphabetic() || c == 'µ' {
                unit_end = i + c.len_utf8();
                chars.next();
            } else {
                break;
            }
        }
        let unit = &body[unit_start..unit_end];
        let scale = unit_nanos(unit).ok_or_else(|| DurationError::UnknownUnit {
            input: input.to_string(),
            unit: unit.to_string(),
        })?;

        total_ns += (number * scale as f64).round() as i128;
        parts += 1;
    }

    if parts == 0 {
        return Err(DurationError::Invalid(input.to_string()));
    }
    if negative {
        total_ns = -total_ns;
    }

    let ns = i64::try_from(total_ns).map_err(|_| DurationError::OutOfRange(input.to_string()))?;
    Ok(Duration::nanoseconds(ns))
}

/// Renders a duration the way [`parse_duration`] reads it back.
pub fn format_duration(duration: Duration) -> String {
    if duration.is_zero() {
        return "0s".to_string();
    }

    let mut out = String::new();
    let mut remaining = match duration.num_nanoseconds() {
        Some(ns) => ns as i128,
        None => duration.num_milliseconds() as i128 * 1_000_000,
    };
    if remaining < 0 {
        out.push('-');
        remaining = -remaining;
    }

    for (unit, scale) in [
        ("h", 3_600_000_000_000_i128),
        ("m", 60_000_000_000),
        ("s", 1_000_000_000),
        ("ms", 1_000_000),
        ("us", 1_000),
        ("ns", 1),
    ] {
        let count = remaining / scale;
        if count > 0 {
            out.push_str(&format!("{count}{unit}"));
            remaining -= count * scale;
        }
    }
    out
}

/// Serde adapters writing durations in the [`format_duration`] form.
pub(crate) mod serde_duration {
    use chrono::Duration;
    use serde::Serializer;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_duration(*value))
    }

    pub fn serialize_opt<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_str(&super::format_duration(*d)),
            None => serializer.serialize_none(),
        }
    }
}

fn unit_nanos(unit: &str) -> Option<i64> {
    match unit {
        "ns" => Some(1),
        "us" | "µs" => Some(1_000),
        "ms" => Some(1_000_000),
        "s" => Some(1_000_000_000),
        "m" => Some(60 * 1_000_000_000),
        "h" => Some(3_600 * 1_000_000_000),
        "d" => Some(86_400 * 1_000_000_000),
        "w" => Some(7 * 86_400 * 1_000_000_000),
        _ => None,
    }
}

//! Bucket naming for aggregation granularity.
//!
//! A bucket is the `granularity`-sized slot a timestamp falls into, named by
//! its index since the unix epoch in base 34.

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

const BASE: i64 = 34;
const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwx";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WindowError {
    #[error("bucket size must be positive")]
    InvalidBucketSize,
}

pub fn bucket_name(ts: DateTime<Utc>, bucket_size: Duration) -> Result<String, WindowError> {
    let size = bucket_size
        .num_microseconds()
        .filter(|us| *us > 0)
        .ok_or(WindowError::InvalidBucketSize)?;
    Ok(to_base(ts.timestamp_micros().div_euclid(size)))
}

fn to_base(mut value: i64) -> String {
    if value == 0 {
        return "0".to_string();
    }
    let negative = value < 0;
    let mut digits = Vec::new();
    while value != 0 {
        let digit = (value % BASE).unsigned_abs() as usize;
        digits.push(DIGITS[digit] as char);
        value /= BASE;
    }
    if negative {
        digits.push('-');
    }
    digits.iter().rev().collect()
}

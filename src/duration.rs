//! Duration shorthand used wherever a human writes a time interval in the
//! configuration (`batchwait`, `timeout`, backoff bounds).
//!
//! A shorthand is any sequence of `<integer><unit>` tokens, matched
//! case-insensitively and summed: `"2h30m"`, `"1d"`, `"2h60m"` (three hours).
//! Recognized units are `ms`, `s`, `m`, `h`, `d` (24 hours) and `w` (7 days).

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::DurationError;

static TOKEN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(\d+)\s*(ms|s|m|h|d|w)").unwrap_or_else(|_| unreachable!())
});

const NANOS_PER_MILLI: u64 = 1_000_000;
const NANOS_PER_SEC: u64 = 1_000 * NANOS_PER_MILLI;
const NANOS_PER_MIN: u64 = 60 * NANOS_PER_SEC;
const NANOS_PER_HOUR: u64 = 60 * NANOS_PER_MIN;
const NANOS_PER_DAY: u64 = 24 * NANOS_PER_HOUR;
const NANOS_PER_WEEK: u64 = 7 * NANOS_PER_DAY;

fn unit_nanos(unit: &str) -> u64 {
    match unit {
        "ms" => NANOS_PER_MILLI,
        "s" => NANOS_PER_SEC,
        "m" => NANOS_PER_MIN,
        "h" => NANOS_PER_HOUR,
        "d" => NANOS_PER_DAY,
        // TOKEN admits no other unit
        _ => NANOS_PER_WEEK,
    }
}

/// Parse a duration shorthand into a [`Duration`].
///
/// Tokens are independent: there is no check that `m` stays below 60, so
/// `"2h60m"` is three hours. Text between tokens is ignored.
///
/// # Errors
///
/// Returns [`DurationError::NoMatch`] when no token is present (including a
/// bare number such as `"1000"` or an unknown unit such as `"5y"`), and [`DurationError::InvalidValue`] when a
/// token or the total does not fit in 64 bits of nanoseconds.
///
/// # Examples
///
/// ```
/// use loki_writer::duration::parse_duration;
/// use std::time::Duration;
///
/// assert_eq!(parse_duration("1m30s").unwrap(), Duration::from_secs(90));
/// assert!(parse_duration("5y").is_err());
/// ```
pub fn parse_duration(raw: &str) -> Result<Duration, DurationError> {
    let lowered = raw.to_lowercase();
    let mut total: u64 = 0;
    let mut matched = false;

    for caps in TOKEN.captures_iter(&lowered) {
        matched = true;
        let value = &caps[1];
        let unit = &caps[2];

        let n: u64 = value
            .parse()
            .map_err(|_| DurationError::InvalidValue(value.to_string()))?;
        let multiplier = unit_nanos(unit);

        total = n
            .checked_mul(multiplier)
            .and_then(|nanos| total.checked_add(nanos))
            .ok_or_else(|| DurationError::InvalidValue(format!("{value}{unit}")))?;
    }

    if !matched {
        return Err(DurationError::NoMatch(raw.to_string()));
    }

    Ok(Duration::from_nanos(total))
}

/// A configured duration that remembers the text it was written as.
///
/// Deserializes from the shorthand grammar (or a plain integer number of
/// nanoseconds) and serializes as an integer number of nanoseconds.
/// Equality compares the parsed value only.
#[derive(Debug, Clone, Default)]
pub struct StrTimeDuration {
    raw: String,
    value: Duration,
}

impl StrTimeDuration {
    /// Parse from shorthand, keeping the original text.
    pub fn parse(raw: &str) -> Result<Self, DurationError> {
        Ok(Self {
            raw: raw.to_string(),
            value: parse_duration(raw)?,
        })
    }

    pub fn as_duration(&self) -> Duration {
        self.value
    }

    /// The text this value was parsed from; empty when built from a number.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn is_zero(&self) -> bool {
        self.value.is_zero()
    }

    /// Total nanoseconds, saturating at `u64::MAX`.
    pub fn as_nanos(&self) -> u64 {
        u64::try_from(self.value.as_nanos()).unwrap_or(u64::MAX)
    }
}

impl From<Duration> for StrTimeDuration {
    fn from(value: Duration) -> Self {
        Self {
            raw: String::new(),
            value,
        }
    }
}

impl FromStr for StrTimeDuration {
    type Err = DurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl PartialEq for StrTimeDuration {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

impl Eq for StrTimeDuration {}

impl fmt::Display for StrTimeDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.raw.is_empty() {
            write!(f, "{:?}", self.value)
        } else {
            f.write_str(&self.raw)
        }
    }
}

impl Serialize for StrTimeDuration {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(self.as_nanos())
    }
}

struct StrTimeDurationVisitor;

impl<'de> Visitor<'de> for StrTimeDurationVisitor {
    type Value = StrTimeDuration;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a duration such as \"2h30m\" or an integer number of nanoseconds")
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
        StrTimeDuration::parse(v).map_err(E::custom)
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
        Ok(Duration::from_nanos(v).into())
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
        u64::try_from(v)
            .map(|nanos| Duration::from_nanos(nanos).into())
            .map_err(|_| E::custom(format!("negative duration {v}")))
    }
}

impl<'de> Deserialize<'de> for StrTimeDuration {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(StrTimeDurationVisitor)
    }
}

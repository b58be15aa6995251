//! Retention intervals such as `"3 days"` or `"1 hour 30 minutes"`.
//!
//! Accepted forms:
//! - one or more `<number> <unit>` pairs, the space being optional
//!   (`"90s"`, `"2 hours 15 min"`),
//! - a bare number of seconds (`"600"`),
//! - a clock form `HH:MM:SS` (`"01:30:00"`).
//!
//! The original text is kept for display and logging.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::IntervalError;

/// Default queue retention.
pub const DEFAULT_TTL: &str = "3 days";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Interval {
    text: String,
    duration: Duration,
}

impl Interval {
    pub fn parse(text: &str) -> Result<Self, IntervalError> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(IntervalError::Empty);
        }

        let duration = if trimmed.contains(':') {
            parse_clock(trimmed)?
        } else {
            parse_units(trimmed)?
        };

        Ok(Self {
            text: trimmed.to_string(),
            duration,
        })
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }
}

impl Default for Interval {
    fn default() -> Self {
        Self {
            text: DEFAULT_TTL.to_string(),
            duration: Duration::from_secs(3 * 86_400),
        }
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

impl FromStr for Interval {
    type Err = IntervalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Interval::parse(s)
    }
}

impl TryFrom<String> for Interval {
    type Error = IntervalError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Interval::parse(&value)
    }
}

impl From<Interval> for String {
    fn from(value: Interval) -> Self {
        value.text
    }
}

fn parse_units(text: &str) -> Result<Duration, IntervalError> {
    let mut total: u64 = 0;
    let mut rest = text;

    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(rest.len());
        if digits == 0 {
            let bad: String = rest.chars().take_while(|c| !c.is_whitespace()).collect();
            return Err(IntervalError::InvalidNumber(bad));
        }
        let amount: u64 = rest[..digits]
            .parse()
            .map_err(|_| IntervalError::InvalidNumber(rest[..digits].to_string()))?;
        rest = rest[digits..].trim_start();

        let unit_len = rest
            .find(|c: char| !c.is_ascii_alphabetic())
            .unwrap_or(rest.len());
        let unit = &rest[..unit_len];
        rest = rest[unit_len..].trim_start();

        let seconds = if unit.is_empty() {
            1
        } else {
            unit_seconds(unit)?
        };
        total = amount
            .checked_mul(seconds)
            .and_then(|s| total.checked_add(s))
            .ok_or(IntervalError::Overflow)?;
    }

    Ok(Duration::from_secs(total))
}

fn unit_seconds(unit: &str) -> Result<u64, IntervalError> {
    let seconds = match unit.to_ascii_lowercase().as_str() {
        "s" | "sec" | "secs" | "second" | "seconds" => 1,
        "m" | "min" | "mins" | "minute" | "minutes" => 60,
        "h" | "hr" | "hrs" | "hour" | "hours" => 3_600,
        "d" | "day" | "days" => 86_400,
        "w" | "week" | "weeks" => 604_800,
        _ => return Err(IntervalError::UnknownUnit(unit.to_string())),
    };
    Ok(seconds)
}

fn parse_clock(text: &str) -> Result<Duration, IntervalError> {
    let mut total: u64 = 0;
    let parts: Vec<&str> = text.split(':').collect();
    if parts.len() != 3 {
        return Err(IntervalError::InvalidNumber(text.to_string()));
    }
    for (part, scale) in parts.iter().zip([3_600u64, 60, 1]) {
        let value: u64 = part
            .parse()
            .map_err(|_| IntervalError::InvalidNumber(part.to_string()))?;
        total = value
            .checked_mul(scale)
            .and_then(|s| total.checked_add(s))
            .ok_or(IntervalError::Overflow)?;
    }
    Ok(Duration::from_secs(total))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_three_days() {
        let ttl = Interval::default();
        assert_eq!(ttl.duration(), Duration::from_secs(259_200));
        assert_eq!(ttl, Interval::parse(DEFAULT_TTL).unwrap());
    }

    #[test]
    fn parses_unit_pairs() {
        assert_eq!(Interval::parse("1 hour").unwrap().duration(), Duration::from_secs(3_600));
        assert_eq!(
            Interval::parse("2 hours 15 min").unwrap().duration(),
            Duration::from_secs(8_100)
        );
        assert_eq!(Interval::parse("90s").unwrap().duration(), Duration::from_secs(90));
        assert_eq!(Interval::parse("1 Week").unwrap().duration(), Duration::from_secs(604_800));
    }

    #[test]
    fn bare_number_is_seconds() {
        assert_eq!(Interval::parse("600").unwrap().duration(), Duration::from_secs(600));
    }

    #[test]
    fn parses_clock_form() {
        assert_eq!(
            Interval::parse("01:30:05").unwrap().duration(),
            Duration::from_secs(5_405)
        );
    }

    #[test]
    fn keeps_original_text() {
        assert_eq!(Interval::parse("  6 hours ").unwrap().to_string(), "6 hours");
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(Interval::parse(""), Err(IntervalError::Empty));
        assert_eq!(
            Interval::parse("3 fortnights"),
            Err(IntervalError::UnknownUnit("fortnights".to_string()))
        );
        assert!(matches!(Interval::parse("days"), Err(IntervalError::InvalidNumber(_))));
        assert!(matches!(Interval::parse("1:2"), Err(IntervalError::InvalidNumber(_))));
    }

    #[test]
    fn deserializes_from_string() {
        let ttl: Interval = serde_json::from_str("\"12 hours\"").unwrap();
        assert_eq!(ttl.duration(), Duration::from_secs(43_200));
    }
}

//! Go-format duration strings (`"30m"`, `"1h30m"`, `"1.5h"`).
//!
//! Policies and requests carry durations as strings so that an invalid value
//! surfaces as a `Rejected`/`Error` status rather than a decode failure.
//! The accepted units are exactly `ns`, `us` (or `µs`/`μs`), `ms`, `s`, `m`
//! and `h`, matching `time.ParseDuration`.

use std::{str::FromStr, time::Duration};

#[derive(Debug, thiserror::Error, Eq, PartialEq)]
pub enum ParseError {
    #[error("unknown unit: {EXPECTED_UNITS}")]
    UnknownUnit,

    #[error("missing a unit: {EXPECTED_UNITS}")]
    MissingUnit,

    #[error("invalid number: {0}")]
    NotANumber(#[from] std::num::ParseFloatError),
}

const EXPECTED_UNITS: &str = "expected one of 'ns', 'us', '\u{00b5}s', 'ms', 's', 'm', or 'h'";

/// A parsed duration. Go durations are signed while `std::time::Duration` is
/// not, so the sign is tracked separately; requests with non-positive
/// durations must be rejected, not silently clamped.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct GoDuration {
    duration: Duration,
    negative: bool,
}

impl GoDuration {
    pub fn get(&self) -> Duration {
        self.duration
    }

    /// True for durations a request or policy may legally carry.
    pub fn is_positive(&self) -> bool {
        !self.negative && self.duration > Duration::ZERO
    }

    pub fn as_chrono(&self) -> chrono::Duration {
        let d = chrono::Duration::from_std(self.duration).unwrap_or(chrono::Duration::MAX);
        if self.negative {
            -d
        } else {
            d
        }
    }
}

impl From<Duration> for GoDuration {
    fn from(duration: Duration) -> Self {
        Self {
            duration,
            negative: false,
        }
    }
}

impl std::fmt::Display for GoDuration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.negative {
            f.write_str("-")?;
        }
        write!(f, "{:?}", self.duration)
    }
}

/// Parses `s` in Go `time.ParseDuration` format.
pub fn parse(s: &str) -> Result<GoDuration, ParseError> {
    s.parse()
}

impl FromStr for GoDuration {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let negative = s.starts_with('-');
        let mut rest = s.trim_start_matches(['+', '-']);

        // "0" (with an optional sign) is the only unitless form Go accepts.
        if rest == "0" {
            return Ok(Self {
                duration: Duration::ZERO,
                negative,
            });
        }
        if rest.is_empty() {
            return Err(ParseError::MissingUnit);
        }

        let mut total = Duration::ZERO;
        while !rest.is_empty() {
            let unit_start = rest
                .find(|c: char| c.is_alphabetic())
                .ok_or(ParseError::MissingUnit)?;
            let (value, tail) = rest.split_at(unit_start);
            let value = value.parse::<f64>()?;

            let unit_end = tail
                .find(|c: char| !c.is_alphabetic())
                .unwrap_or(tail.len());
            let (unit, tail) = tail.split_at(unit_end);
            rest = tail;

            total += unit_base(unit)?.mul_f64(value);
        }

        Ok(Self {
            duration: total,
            negative,
        })
    }
}

fn unit_base(unit: &str) -> Result<Duration, ParseError> {
    match unit {
        "ns" => Ok(Duration::from_nanos(1)),
        // U+00B5 (micro sign) and U+03BC (Greek mu) are both accepted.
        "us" | "\u{00b5}s" | "\u{03bc}s" => Ok(Duration::from_micros(1)),
        "ms" => Ok(Duration::from_millis(1)),
        "s" => Ok(Duration::from_secs(1)),
        "m" => Ok(Duration::from_secs(60)),
        "h" => Ok(Duration::from_secs(60 * 60)),
        _ => Err(ParseError::UnknownUnit),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINUTE: Duration = Duration::from_secs(60);
    const HOUR: Duration = Duration::from_secs(60 * 60);

    #[test]
    fn parses_go_formats() {
        for (input, expected) in [
            ("0", Duration::ZERO),
            ("5s", Duration::from_secs(5)),
            ("30m", 30 * MINUTE),
            ("1478s", Duration::from_secs(1478)),
            ("+5s", Duration::from_secs(5)),
            ("5.6s", Duration::from_secs(5) + Duration::from_millis(600)),
            (".5s", Duration::from_millis(500)),
            ("1.0040s", Duration::from_secs(1) + Duration::from_millis(4)),
            ("10ns", Duration::from_nanos(10)),
            ("11us", Duration::from_micros(11)),
            ("12\u{00b5}s", Duration::from_micros(12)),
            ("12\u{03bc}s", Duration::from_micros(12)),
            ("13ms", Duration::from_millis(13)),
            ("15m", 15 * MINUTE),
            ("16h", 16 * HOUR),
            ("3h30m", 3 * HOUR + 30 * MINUTE),
            (
                "10.5s4m",
                4 * MINUTE + Duration::from_secs(10) + Duration::from_millis(500),
            ),
            (
                "1h2m3s4ms5us6ns",
                HOUR + 2 * MINUTE
                    + Duration::from_secs(3)
                    + Duration::from_millis(4)
                    + Duration::from_micros(5)
                    + Duration::from_nanos(6),
            ),
            ("0.3333333333333333333h", 20 * MINUTE),
        ] {
            let parsed = input.parse::<GoDuration>().unwrap_or_else(|e| {
                panic!("{input} failed to parse: {e}");
            });
            assert_eq!(parsed.get(), expected, "{input}");
            assert!(!parsed.negative, "{input}");
        }
    }

    #[test]
    fn tracks_sign() {
        let d = "-5s".parse::<GoDuration>().unwrap();
        assert_eq!(d.get(), Duration::from_secs(5));
        assert!(d.negative);
        assert!(!d.is_positive());

        assert!(!"-0".parse::<GoDuration>().unwrap().is_positive());
        assert!(!"0".parse::<GoDuration>().unwrap().is_positive());
        assert!("1h".parse::<GoDuration>().unwrap().is_positive());
    }

    #[test]
    fn rejects_malformed() {
        assert_eq!("1d".parse::<GoDuration>(), Err(ParseError::UnknownUnit));
        assert_eq!("100".parse::<GoDuration>(), Err(ParseError::MissingUnit));
        assert!("".parse::<GoDuration>().is_err());
        assert!("abc".parse::<GoDuration>().is_err());
        assert!("h1".parse::<GoDuration>().is_err());
    }
}

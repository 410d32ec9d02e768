use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use chrono::{
    DateTime, Duration, FixedOffset, Months, NaiveDate, NaiveDateTime, SecondsFormat, TimeZone,
    Utc,
};

use super::{CapabilityHandle, CapabilityName, CapabilityProvider};
use crate::config::ClockConfig;

/// Date/time helper exposed to scripts as `date`.
///
/// Patterns use moment-style tokens (`YYYY-MM-DD HH:mm:ss`).
pub trait Clock: Send + Sync {
    /// Current time as ISO-8601.
    fn now(&self) -> String;
    fn format_now(&self, pattern: &str) -> String;
    fn format(&self, timestamp: &str, pattern: &str) -> Result<String>;
    /// Seconds since the Unix epoch.
    fn unix(&self) -> i64;
    fn is_valid(&self, timestamp: &str) -> bool;
    fn add(&self, timestamp: &str, amount: i64, unit: &str) -> Result<String>;
    /// `a - b` expressed in `unit`, truncated toward zero.
    fn diff(&self, a: &str, b: &str, unit: &str) -> Result<i64>;

    /// True for the degraded stand-in installed when the helper fails to load.
    fn is_stub(&self) -> bool {
        false
    }
}

// ── Full helper ─────────────────────────────────────────

pub struct DateHelper {
    offset: FixedOffset,
}

impl DateHelper {
    pub fn new(offset: FixedOffset) -> Self {
        Self { offset }
    }

    fn parse(&self, input: &str) -> Result<DateTime<FixedOffset>> {
        let input = input.trim();
        if let Ok(dt) = DateTime::parse_from_rfc3339(input) {
            return Ok(dt);
        }
        for pattern in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M"] {
            if let Ok(naive) = NaiveDateTime::parse_from_str(input, pattern) {
                return self.localize(naive);
            }
        }
        if let Ok(date) = NaiveDate::parse_from_str(input, "%Y-%m-%d") {
            if let Some(naive) = date.and_hms_opt(0, 0, 0) {
                return self.localize(naive);
            }
        }
        Err(anyhow!("unrecognized date: {input}"))
    }

    fn localize(&self, naive: NaiveDateTime) -> Result<DateTime<FixedOffset>> {
        self.offset
            .from_local_datetime(&naive)
            .single()
            .ok_or_else(|| anyhow!("ambiguous local time: {naive}"))
    }

    fn current(&self) -> DateTime<FixedOffset> {
        Utc::now().with_timezone(&self.offset)
    }
}

impl Clock for DateHelper {
    fn now(&self) -> String {
        self.current().to_rfc3339_opts(SecondsFormat::Millis, false)
    }

    fn format_now(&self, pattern: &str) -> String {
        self.current().format(&translate_pattern(pattern)).to_string()
    }

    fn format(&self, timestamp: &str, pattern: &str) -> Result<String> {
        let dt = self.parse(timestamp)?;
        Ok(dt.format(&translate_pattern(pattern)).to_string())
    }

    fn unix(&self) -> i64 {
        Utc::now().timestamp()
    }

    fn is_valid(&self, timestamp: &str) -> bool {
        self.parse(timestamp).is_ok()
    }

    fn add(&self, timestamp: &str, amount: i64, unit: &str) -> Result<String> {
        let dt = self.parse(timestamp)?;
        let unit = normalize_unit(unit)?;
        let shifted = match unit {
            Unit::Months | Unit::Years => {
                let months = match unit {
                    Unit::Years => amount.checked_mul(12),
                    _ => Some(amount),
                }
                .ok_or_else(|| anyhow!("date arithmetic overflow"))?;
                let magnitude = Months::new(
                    u32::try_from(months.unsigned_abs())
                        .map_err(|_| anyhow!("date arithmetic overflow"))?,
                );
                if months >= 0 {
                    dt.checked_add_months(magnitude)
                } else {
                    dt.checked_sub_months(magnitude)
                }
            }
            other => dt.checked_add_signed(other.duration(amount)?),
        };
        shifted
            .map(|d| d.to_rfc3339_opts(SecondsFormat::Millis, false))
            .ok_or_else(|| anyhow!("date arithmetic overflow"))
    }

    fn diff(&self, a: &str, b: &str, unit: &str) -> Result<i64> {
        let delta = self.parse(a)? - self.parse(b)?;
        Ok(match normalize_unit(unit)? {
            Unit::Milliseconds => delta.num_milliseconds(),
            Unit::Seconds => delta.num_seconds(),
            Unit::Minutes => delta.num_minutes(),
            Unit::Hours => delta.num_hours(),
            Unit::Days => delta.num_days(),
            Unit::Weeks => delta.num_weeks(),
            Unit::Months | Unit::Years => bail!("diff in calendar units is not supported"),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Unit {
    Milliseconds,
    Seconds,
    Minutes,
    Hours,
    Days,
    Weeks,
    Months,
    Years,
}

impl Unit {
    fn duration(self, amount: i64) -> Result<Duration> {
        let d = match self {
            Unit::Milliseconds => Duration::try_milliseconds(amount),
            Unit::Seconds => Duration::try_seconds(amount),
            Unit::Minutes => Duration::try_minutes(amount),
            Unit::Hours => Duration::try_hours(amount),
            Unit::Days => Duration::try_days(amount),
            Unit::Weeks => Duration::try_weeks(amount),
            Unit::Months | Unit::Years => None,
        };
        d.ok_or_else(|| anyhow!("duration out of range"))
    }
}

fn normalize_unit(unit: &str) -> Result<Unit> {
    Ok(match unit.trim() {
        "ms" | "millisecond" | "milliseconds" => Unit::Milliseconds,
        "s" | "second" | "seconds" => Unit::Seconds,
        "m" | "minute" | "minutes" => Unit::Minutes,
        "h" | "hour" | "hours" => Unit::Hours,
        "d" | "day" | "days" => Unit::Days,
        "w" | "week" | "weeks" => Unit::Weeks,
        "M" | "month" | "months" => Unit::Months,
        "y" | "year" | "years" => Unit::Years,
        _ => bail!("unknown time unit: {unit}"),
    })
}

// ── Stub ────────────────────────────────────────────────

/// Minimal clock: ISO output regardless of pattern, everything is valid.
pub struct ClockStub;

impl Clock for ClockStub {
    fn now(&self) -> String {
        Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
    }

    fn format_now(&self, _pattern: &str) -> String {
        self.now()
    }

    fn format(&self, timestamp: &str, _pattern: &str) -> Result<String> {
        Ok(timestamp.to_string())
    }

    fn unix(&self) -> i64 {
        Utc::now().timestamp()
    }

    fn is_valid(&self, _timestamp: &str) -> bool {
        true
    }

    fn add(&self, _timestamp: &str, _amount: i64, _unit: &str) -> Result<String> {
        bail!("date arithmetic is unavailable (clock stub)")
    }

    fn diff(&self, _a: &str, _b: &str, _unit: &str) -> Result<i64> {
        bail!("date arithmetic is unavailable (clock stub)")
    }

    fn is_stub(&self) -> bool {
        true
    }
}

// ── Pattern translation ─────────────────────────────────

/// Moment tokens, longest first so `YYYY` wins over `YY`.
const TOKENS: &[(&str, &str)] = &[
    ("YYYY", "%Y"),
    ("YY", "%y"),
    ("MMMM", "%B"),
    ("MMM", "%b"),
    ("MM", "%m"),
    ("M", "%-m"),
    ("dddd", "%A"),
    ("ddd", "%a"),
    ("DD", "%d"),
    ("D", "%-d"),
    ("HH", "%H"),
    ("H", "%-H"),
    ("hh", "%I"),
    ("h", "%-I"),
    ("mm", "%M"),
    ("m", "%-M"),
    ("ss", "%S"),
    ("s", "%-S"),
    ("SSS", "%3f"),
    ("A", "%p"),
    ("a", "%P"),
    ("ZZ", "%z"),
    ("Z", "%:z"),
    ("X", "%s"),
];

/// Converts a moment-style pattern to a chrono format string. Text inside
/// `[...]` is copied literally.
pub fn translate_pattern(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len() * 2);
    let mut rest = pattern;
    'outer: while let Some(c) = rest.chars().next() {
        if c == '[' {
            if let Some(end) = rest.find(']') {
                out.push_str(&rest[1..end].replace('%', "%%"));
                rest = &rest[end + 1..];
                continue;
            }
        }
        for (token, fmt) in TOKENS {
            if let Some(tail) = rest.strip_prefix(token) {
                out.push_str(fmt);
                rest = tail;
                continue 'outer;
            }
        }
        if c == '%' {
            out.push_str("%%");
        } else {
            out.push(c);
        }
        rest = &rest[c.len_utf8()..];
    }
    out
}

/// Parses `+HH:MM`, `-HHMM`, `Z` or `UTC`.
pub fn parse_offset(raw: &str) -> Result<FixedOffset> {
    let raw = raw.trim();
    if raw.eq_ignore_ascii_case("z") || raw.eq_ignore_ascii_case("utc") {
        return FixedOffset::east_opt(0).ok_or_else(|| anyhow!("invalid offset"));
    }
    let (sign, body) = match raw.chars().next() {
        Some('+') => (1, &raw[1..]),
        Some('-') => (-1, &raw[1..]),
        _ => bail!("offset must start with + or -: {raw:?}"),
    };
    let digits: String = body.chars().filter(|c| *c != ':').collect();
    if digits.len() != 4 || !digits.chars().all(|c| c.is_ascii_digit()) {
        bail!("malformed offset: {raw:?}");
    }
    let hours: i32 = digits[..2].parse()?;
    let minutes: i32 = digits[2..].parse()?;
    if minutes >= 60 {
        bail!("malformed offset: {raw:?}");
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
        .ok_or_else(|| anyhow!("offset out of range: {raw:?}"))
}

// ── Provider ────────────────────────────────────────────

pub struct ClockProvider {
    config: ClockConfig,
}

impl ClockProvider {
    pub fn new(config: ClockConfig) -> Self {
        Self { config }
    }
}

impl CapabilityProvider for ClockProvider {
    fn name(&self) -> CapabilityName {
        CapabilityName::Clock
    }

    fn acquire(&self) -> Result<CapabilityHandle> {
        let offset = parse_offset(&self.config.utc_offset)?;
        Ok(CapabilityHandle::Clock(Arc::new(DateHelper::new(offset))))
    }

    fn fallback(&self) -> Option<CapabilityHandle> {
        Some(CapabilityHandle::Clock(Arc::new(ClockStub)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn helper(offset: &str) -> DateHelper {
        DateHelper::new(parse_offset(offset).unwrap())
    }

    #[test]
    fn test_translate_pattern() {
        assert_eq!(translate_pattern("YYYY-MM-DD HH:mm:ss"), "%Y-%m-%d %H:%M:%S");
        assert_eq!(translate_pattern("DD/MM/YY"), "%d/%m/%y");
        assert_eq!(translate_pattern("[Day] D"), "Day %-d");
        assert_eq!(translate_pattern("100%"), "100%%");
    }

    #[test]
    fn test_format_local_datetime() {
        let clock = helper("+02:00");
        assert_eq!(
            clock.format("2024-03-05 14:07:09", "DD/MM/YYYY HH:mm").unwrap(),
            "05/03/2024 14:07"
        );
        assert_eq!(
            clock.format("2024-03-05T12:00:00Z", "HH:mm Z").unwrap(),
            "12:00 +00:00"
        );
    }

    #[test]
    fn test_add_and_diff() {
        let clock = helper("+00:00");
        assert_eq!(
            clock.add("2024-01-31", 1, "month").unwrap(),
            "2024-02-29T00:00:00.000+00:00"
        );
        assert_eq!(
            clock.add("2024-01-01 00:00:00", -2, "days").unwrap(),
            "2023-12-30T00:00:00.000+00:00"
        );
        assert_eq!(clock.diff("2024-01-03", "2024-01-01", "days").unwrap(), 2);
        assert_eq!(clock.diff("2024-01-01 01:30:00", "2024-01-01", "minutes").unwrap(), 90);
        assert!(clock.add("2024-01-01", 1, "fortnight").is_err());
    }

    #[test]
    fn test_is_valid() {
        let clock = helper("Z");
        assert!(clock.is_valid("2024-02-29"));
        assert!(!clock.is_valid("2023-02-29"));
        assert!(!clock.is_valid("yesterday"));
    }

    #[test]
    fn test_parse_offset() {
        assert_eq!(parse_offset("+02:00").unwrap().local_minus_utc(), 7200);
        assert_eq!(parse_offset("-0530").unwrap().local_minus_utc(), -19800);
        assert!(parse_offset("Europe/Paris").is_err());
        assert!(parse_offset("+02:75").is_err());
        assert!(parse_offset("+99:00").is_err());
    }

    #[test]
    fn test_invalid_offset_falls_back_to_stub() {
        let provider = ClockProvider::new(ClockConfig {
            utc_offset: "not-an-offset".into(),
        });
        assert!(provider.acquire().is_err());
        match provider.fallback() {
            Some(CapabilityHandle::Clock(clock)) => {
                assert!(clock.is_stub());
                assert!(clock.is_valid("anything"));
                assert!(clock.now().ends_with('Z'));
                assert!(clock.add("2024-01-01", 1, "day").is_err());
            }
            _ => panic!("expected clock stub"),
        }
    }
}

//! Measurement windows expressed as ISO-8601 durations

use crate::error::{ImpactError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default lookback window
pub const DEFAULT_TIMESPAN: &str = "PT1H";
/// Default sampling resolution within the window
pub const DEFAULT_INTERVAL: &str = "PT5M";

/// The `(timespan, interval)` pair describing one polling window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawWindow", into = "RawWindow")]
pub struct TimeWindow {
    timespan: String,
    interval: String,
    timespan_duration: Duration,
    interval_duration: Duration,
}

#[derive(Serialize, Deserialize)]
struct RawWindow {
    timespan: String,
    interval: String,
}

impl TryFrom<RawWindow> for TimeWindow {
    type Error = ImpactError;

    fn try_from(raw: RawWindow) -> Result<Self> {
        TimeWindow::new(raw.timespan, raw.interval)
    }
}

impl From<TimeWindow> for RawWindow {
    fn from(window: TimeWindow) -> Self {
        RawWindow {
            timespan: window.timespan,
            interval: window.interval,
        }
    }
}

impl Default for TimeWindow {
    fn default() -> Self {
        Self {
            timespan: DEFAULT_TIMESPAN.to_string(),
            interval: DEFAULT_INTERVAL.to_string(),
            timespan_duration: Duration::from_secs(3600),
            interval_duration: Duration::from_secs(300),
        }
    }
}

impl TimeWindow {
    /// Build a window, validating both durations
    pub fn new(timespan: impl Into<String>, interval: impl Into<String>) -> Result<Self> {
        let timespan = timespan.into();
        let interval = interval.into();
        let timespan_duration = parse_iso8601_duration(&timespan)?;
        let interval_duration = parse_iso8601_duration(&interval)?;

        Ok(Self {
            timespan,
            interval,
            timespan_duration,
            interval_duration,
        })
    }

    pub fn timespan(&self) -> &str {
        &self.timespan
    }

    pub fn interval(&self) -> &str {
        &self.interval
    }

    pub fn timespan_duration(&self) -> Duration {
        self.timespan_duration
    }

    pub fn interval_duration(&self) -> Duration {
        self.interval_duration
    }

    /// Window length in hours
    pub fn hours(&self) -> f64 {
        self.timespan_duration.as_secs_f64() / 3600.0
    }

    /// Compact lower-case range for the timespan (`PT1H` -> `1h`)
    pub fn timespan_range(&self) -> String {
        compact_range(&self.timespan)
    }

    /// Compact lower-case range for the interval (`PT5M` -> `5m`)
    pub fn interval_range(&self) -> String {
        compact_range(&self.interval)
    }
}

fn compact_range(iso: &str) -> String {
    iso.to_ascii_lowercase().replace('p', "").replace('t', "")
}

/// Parse `P[nD][T[nH][nM][nS]]` into a [`Duration`]
pub fn parse_iso8601_duration(input: &str) -> Result<Duration> {
    let invalid = || ImpactError::InvalidDuration(input.to_string());

    let upper = input.trim().to_ascii_uppercase();
    let body = upper.strip_prefix('P').ok_or_else(invalid)?;
    if body.is_empty() {
        return Err(invalid());
    }

    let (date_part, time_part) = match body.split_once('T') {
        Some((_, "")) => return Err(invalid()),
        Some((date, time)) => (date, Some(time)),
        None => (body, None),
    };

    let mut seconds = 0.0;
    seconds += sum_components(date_part, &[('D', 86_400.0)]).ok_or_else(invalid)?;
    if let Some(time) = time_part {
        seconds += sum_components(time, &[('H', 3_600.0), ('M', 60.0), ('S', 1.0)])
            .ok_or_else(invalid)?;
    }

    Duration::try_from_secs_f64(seconds).map_err(|_| invalid())
}

/// Sum `<number><designator>` pairs, designators in the given order, each at most once
fn sum_components(part: &str, units: &[(char, f64)]) -> Option<f64> {
    let mut total = 0.0;
    let mut rest = part;
    let mut next_unit = 0;

    while !rest.is_empty() {
        let idx = rest.find(|c: char| c.is_ascii_alphabetic())?;
        let (number, tail) = rest.split_at(idx);
        let designator = tail.chars().next()?;

        let pos = units[next_unit..].iter().position(|(u, _)| *u == designator)?;
        let (_, factor) = units[next_unit + pos];
        next_unit += pos + 1;

        let value: f64 = number.parse().ok()?;
        if !value.is_finite() || value < 0.0 {
            return None;
        }
        total += value * factor;
        rest = &tail[designator.len_utf8()..];
    }

    Some(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_common_windows() {
        assert_eq!(parse_iso8601_duration("PT1H").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_iso8601_duration("PT5M").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_iso8601_duration("PT15M").unwrap(), Duration::from_secs(900));
        assert_eq!(parse_iso8601_duration("P1D").unwrap(), Duration::from_secs(86_400));
        assert_eq!(
            parse_iso8601_duration("P1DT12H").unwrap(),
            Duration::from_secs(129_600)
        );
        assert_eq!(
            parse_iso8601_duration("PT1H30M10S").unwrap(),
            Duration::from_secs(5410)
        );
        assert_eq!(parse_iso8601_duration("PT0.5H").unwrap(), Duration::from_secs(1800));
        assert_eq!(parse_iso8601_duration("pt1h").unwrap(), Duration::from_secs(3600));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        for bad in [
            "", "P", "PT", "1H", "PT1X", "PTH", "PT5M1H", "PT1H1H", "PT-1H", "P1H",
            "PT99999999999999999999H", "P99999999999999999999D",
        ] {
            assert!(
                matches!(parse_iso8601_duration(bad), Err(ImpactError::InvalidDuration(_))),
                "expected '{}' to be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_window_hours_and_ranges() {
        let window = TimeWindow::new("PT2H", "PT5M").unwrap();
        assert!((window.hours() - 2.0).abs() < 1e-12);
        assert_eq!(window.timespan_range(), "2h");
        assert_eq!(window.interval_range(), "5m");

        let default = TimeWindow::default();
        assert_eq!(default.timespan(), "PT1H");
        assert_eq!(default.interval(), "PT5M");
        assert!((default.hours() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_window_deserialize_validates() {
        let ok: TimeWindow =
            serde_json::from_str(r#"{"timespan":"PT30M","interval":"PT1M"}"#).unwrap();
        assert!((ok.hours() - 0.5).abs() < 1e-12);

        let bad = serde_json::from_str::<TimeWindow>(r#"{"timespan":"1h","interval":"PT1M"}"#);
        assert!(bad.is_err());
    }
}

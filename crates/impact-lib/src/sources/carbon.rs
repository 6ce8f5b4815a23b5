//! Carbon-intensity providers

use crate::error::{ImpactError, Result};
use crate::models::CarbonIntensityValue;
use crate::node::CarbonIntensityProvider;
use crate::observability::StructuredLogger;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;

/// Forecast documents older than this are averaged instead of matched
pub const STALE_AFTER_HOURS: i64 = 24;

/// Constant intensity, for regions without a forecast feed
#[derive(Debug, Clone, Copy)]
pub struct FixedCarbonIntensity {
    value: f64,
}

impl FixedCarbonIntensity {
    pub fn new(value: f64) -> Self {
        Self { value }
    }
}

#[async_trait]
impl CarbonIntensityProvider for FixedCarbonIntensity {
    async fn current_carbon_intensity(&self) -> Result<CarbonIntensityValue> {
        Ok(CarbonIntensityValue::new(self.value))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ForecastDocument {
    last_heartbeat_time: DateTime<Utc>,
    #[serde(default)]
    data: Vec<ForecastEntry>,
}

#[derive(Debug, Deserialize)]
struct ForecastEntry {
    from: DateTime<Utc>,
    intensity: ForecastIntensity,
}

#[derive(Debug, Deserialize)]
struct ForecastIntensity {
    actual: f64,
}

/// Reads a forecast document published into an environment variable
///
/// The variable is re-read on every call so a refreshed ConfigMap is picked
/// up without a restart.
#[derive(Clone)]
pub struct ForecastCarbonIntensity {
    variable: String,
    logger: StructuredLogger,
}

impl ForecastCarbonIntensity {
    pub fn new(variable: impl Into<String>) -> Self {
        let variable = variable.into();
        Self {
            logger: StructuredLogger::new(format!("forecast:{}", variable)),
            variable,
        }
    }

    pub fn variable(&self) -> &str {
        &self.variable
    }

    /// Intensity at `now` from a forecast document
    ///
    /// A fresh document yields the entry whose `from` is closest to `now`;
    /// a stale one yields the mean of all entries.
    pub fn select(&self, json: &str, now: DateTime<Utc>) -> Result<CarbonIntensityValue> {
        let document: ForecastDocument = serde_json::from_str(json)
            .map_err(|e| ImpactError::parse("carbon intensity forecast", e))?;
        if document.data.is_empty() {
            return Err(ImpactError::PermanentConfig(format!(
                "forecast in {} has no data",
                self.variable
            )));
        }

        let age = now - document.last_heartbeat_time;
        if age > chrono::Duration::hours(STALE_AFTER_HOURS) {
            self.logger
                .log_stale_carbon_intensity(&self.variable, age.num_minutes() as f64 / 60.0);
            let sum: f64 = document.data.iter().map(|e| e.intensity.actual).sum();
            let mean = sum / document.data.len() as f64;
            return Ok(CarbonIntensityValue {
                value: mean,
                timestamp: now,
            });
        }

        let closest = document
            .data
            .iter()
            .min_by_key(|e| (e.from - now).num_seconds().abs())
            .map(|e| e.intensity.actual)
            .unwrap_or_default();
        Ok(CarbonIntensityValue {
            value: closest,
            timestamp: now,
        })
    }
}

#[async_trait]
impl CarbonIntensityProvider for ForecastCarbonIntensity {
    async fn current_carbon_intensity(&self) -> Result<CarbonIntensityValue> {
        let json = std::env::var(&self.variable).map_err(|_| {
            ImpactError::PermanentConfig(format!("environment variable {} is not set", self.variable))
        })?;
        self.select(&json, Utc::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, hour, 0, 0).unwrap()
    }

    fn document(heartbeat: DateTime<Utc>) -> String {
        serde_json::json!({
            "lastHeartbeatTime": heartbeat.to_rfc3339(),
            "data": [
                { "from": at(10).to_rfc3339(), "intensity": { "actual": 100.0 } },
                { "from": at(11).to_rfc3339(), "intensity": { "actual": 200.0 } },
                { "from": at(12).to_rfc3339(), "intensity": { "actual": 600.0 } }
            ]
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_fixed_intensity() {
        let provider = FixedCarbonIntensity::new(321.0);
        assert_eq!(provider.current_carbon_intensity().await.unwrap().value, 321.0);
    }

    #[test]
    fn test_fresh_forecast_picks_closest_entry() {
        let provider = ForecastCarbonIntensity::new("SCI_TEST_UNUSED");
        let now = at(11) + chrono::Duration::minutes(20);
        let value = provider.select(&document(at(9)), now).unwrap();
        assert_eq!(value.value, 200.0);
        assert_eq!(value.timestamp, now);
    }

    #[test]
    fn test_stale_forecast_averages() {
        let provider = ForecastCarbonIntensity::new("SCI_TEST_UNUSED");
        let now = at(11) + chrono::Duration::hours(48);
        let value = provider.select(&document(at(9)), now).unwrap();
        assert_eq!(value.value, 300.0);
    }

    #[test]
    fn test_invalid_documents() {
        let provider = ForecastCarbonIntensity::new("SCI_TEST_UNUSED");
        let empty = serde_json::json!({ "lastHeartbeatTime": at(9).to_rfc3339(), "data": [] });
        assert!(matches!(
            provider.select(&empty.to_string(), at(10)),
            Err(ImpactError::PermanentConfig(_))
        ));
        assert!(matches!(
            provider.select("not json", at(10)),
            Err(ImpactError::Parse { .. })
        ));
    }

    #[tokio::test]
    async fn test_reads_environment_variable() {
        let provider = ForecastCarbonIntensity::new("SCI_TEST_FORECAST_MISSING_VAR");
        assert!(matches!(
            provider.current_carbon_intensity().await,
            Err(ImpactError::PermanentConfig(_))
        ));

        std::env::set_var("SCI_TEST_FORECAST_DOC", document(Utc::now()));
        let provider = ForecastCarbonIntensity::new("SCI_TEST_FORECAST_DOC");
        let value = provider.current_carbon_intensity().await.unwrap();
        assert!([100.0, 200.0, 600.0].contains(&value.value));
    }
}

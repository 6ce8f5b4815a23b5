//! OpenCost allocation API as an observation source

use crate::error::{ImpactError, Result};
use crate::models::ResourceObservation;
use crate::node::ResourceObservationSource;
use crate::window::TimeWindow;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// What one allocation entry stands for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationScope {
    /// `aggregate=node`, entries keyed by node name
    Node,
    /// Per-container allocations; pods match by substring, and when several
    /// containers match the last one in document order wins
    Pod,
}

/// Entries keep the upstream document order (`preserve_order`)
#[derive(Debug, Deserialize)]
struct AllocationResponse {
    #[serde(default)]
    data: Vec<Map<String, Value>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Allocation {
    #[serde(default)]
    cpu_core_usage_average: f64,
    #[serde(default)]
    cpu_cores: f64,
    #[serde(default)]
    cpu_core_hours: f64,
    #[serde(default)]
    ram_byte_usage_average: f64,
}

impl Allocation {
    fn observation(&self) -> ResourceObservation {
        let mut observation = ResourceObservation::new(0.0, self.ram_byte_usage_average / BYTES_PER_GB)
            .with_reserved_cores(self.cpu_cores);
        if self.cpu_cores > 0.0 {
            observation.avg_cpu_percent = 100.0 * self.cpu_core_usage_average / self.cpu_cores;
            observation.time_reserved_hours = Some(self.cpu_core_hours / self.cpu_cores);
        }
        observation
    }
}

/// Queries `/allocation/compute` once per fetch
#[derive(Debug, Clone)]
pub struct OpenCostObservationSource {
    client: reqwest::Client,
    base_url: String,
    scope: AllocationScope,
}

impl OpenCostObservationSource {
    pub fn new(base_url: impl Into<String>, scope: AllocationScope) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| ImpactError::PermanentConfig(format!("http client: {}", e)))?;
        Ok(Self::with_client(client, base_url, scope))
    }

    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>, scope: AllocationScope) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            scope,
        }
    }

    fn matches(&self, requested: &str, entry: &str) -> bool {
        match self.scope {
            AllocationScope::Node => requested == entry,
            AllocationScope::Pod => entry.contains(requested),
        }
    }
}

#[async_trait]
impl ResourceObservationSource for OpenCostObservationSource {
    async fn fetch(
        &self,
        resource_ids: &[String],
        window: &TimeWindow,
    ) -> Result<BTreeMap<String, ResourceObservation>> {
        let url = format!("{}/allocation/compute", self.base_url);
        let mut query = vec![
            ("window", window.timespan_range()),
            ("resolution", window.interval_range()),
        ];
        if self.scope == AllocationScope::Node {
            query.push(("aggregate", "node".to_string()));
        }

        debug!(url = %url, resources = resource_ids.len(), "querying allocations");
        let response = self
            .client
            .get(&url)
            .query(&query)
            .send()
            .await?
            .error_for_status()?;
        let body: AllocationResponse = response.json().await?;

        let mut observations = BTreeMap::new();
        let Some(allocations) = body.data.first() else {
            return Ok(observations);
        };
        for requested in resource_ids {
            let Some((name, entry)) = allocations
                .iter()
                .rev()
                .find(|(name, _)| self.matches(requested, name))
            else {
                continue;
            };
            let allocation: Allocation = serde_json::from_value(entry.clone())
                .map_err(|e| ImpactError::parse(format!("allocation '{}'", name), e))?;
            observations.insert(requested.clone(), allocation.observation());
        }
        Ok(observations)
    }
}

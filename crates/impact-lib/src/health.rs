//! Pipeline health for liveness and readiness probes
//!
//! Each impact pipeline reports the outcome of its last cycle. A pipeline
//! that computed everything is healthy, one with failed resources is
//! degraded, one that produced nothing is unhealthy.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl PipelineStatus {
    /// Still exporting at least some figures
    pub fn is_operational(&self) -> bool {
        matches!(self, PipelineStatus::Healthy | PipelineStatus::Degraded)
    }
}

/// Outcome of one pipeline's last cycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineHealth {
    pub status: PipelineStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub resources_computed: usize,
    pub resources_failed: usize,
    pub last_cycle_timestamp: i64,
}

impl PipelineHealth {
    /// Classify a finished cycle by its resource counts
    pub fn from_cycle(computed: usize, failed: usize) -> Self {
        let (status, message) = if failed == 0 {
            (PipelineStatus::Healthy, None)
        } else {
            (
                PipelineStatus::Degraded,
                Some(format!("{} resources failed", failed)),
            )
        };
        Self {
            status,
            message,
            resources_computed: computed,
            resources_failed: failed,
            last_cycle_timestamp: chrono::Utc::now().timestamp(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: PipelineStatus::Unhealthy,
            message: Some(message.into()),
            resources_computed: 0,
            resources_failed: 0,
            last_cycle_timestamp: chrono::Utc::now().timestamp(),
        }
    }

    fn pending() -> Self {
        Self {
            status: PipelineStatus::Healthy,
            message: Some("awaiting first cycle".to_string()),
            resources_computed: 0,
            resources_failed: 0,
            last_cycle_timestamp: chrono::Utc::now().timestamp(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: PipelineStatus,
    pub pipelines: BTreeMap<String, PipelineHealth>,
}

impl HealthResponse {
    /// Worst status across pipelines
    pub fn compute_status(pipelines: &BTreeMap<String, PipelineHealth>) -> PipelineStatus {
        pipelines
            .values()
            .map(|p| p.status)
            .fold(PipelineStatus::Healthy, |worst, status| match (worst, status) {
                (PipelineStatus::Unhealthy, _) | (_, PipelineStatus::Unhealthy) => {
                    PipelineStatus::Unhealthy
                }
                (PipelineStatus::Degraded, _) | (_, PipelineStatus::Degraded) => {
                    PipelineStatus::Degraded
                }
                _ => PipelineStatus::Healthy,
            })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Shared registry written by the export loop and read by the API
#[derive(Debug, Clone, Default)]
pub struct HealthRegistry {
    pipelines: Arc<RwLock<BTreeMap<String, PipelineHealth>>>,
    first_cycle_done: Arc<RwLock<bool>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a pipeline before its first cycle
    pub async fn register(&self, pipeline: &str) {
        let mut pipelines = self.pipelines.write().await;
        pipelines
            .entry(pipeline.to_string())
            .or_insert_with(PipelineHealth::pending);
    }

    pub async fn record_cycle(&self, pipeline: &str, computed: usize, failed: usize) {
        self.update(pipeline, PipelineHealth::from_cycle(computed, failed))
            .await;
    }

    pub async fn record_failure(&self, pipeline: &str, message: impl Into<String>) {
        self.update(pipeline, PipelineHealth::failed(message)).await;
    }

    async fn update(&self, pipeline: &str, health: PipelineHealth) {
        let mut pipelines = self.pipelines.write().await;
        pipelines.insert(pipeline.to_string(), health);
    }

    /// Called once every pipeline finished a cycle
    pub async fn mark_cycle_complete(&self) {
        *self.first_cycle_done.write().await = true;
    }

    pub async fn health(&self) -> HealthResponse {
        let pipelines = self.pipelines.read().await.clone();
        let status = HealthResponse::compute_status(&pipelines);
        HealthResponse { status, pipelines }
    }

    pub async fn readiness(&self) -> ReadinessResponse {
        if !*self.first_cycle_done.read().await {
            return ReadinessResponse {
                ready: false,
                reason: Some("first export cycle has not finished".to_string()),
            };
        }

        let unhealthy: Vec<String> = self
            .pipelines
            .read()
            .await
            .iter()
            .filter(|(_, p)| p.status == PipelineStatus::Unhealthy)
            .map(|(name, _)| name.clone())
            .collect();
        if unhealthy.is_empty() {
            ReadinessResponse {
                ready: true,
                reason: None,
            }
        } else {
            ReadinessResponse {
                ready: false,
                reason: Some(format!("unhealthy pipelines: {}", unhealthy.join(", "))),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_empty_registry_is_healthy() {
        let registry = HealthRegistry::new();
        let health = registry.health().await;

        assert_eq!(health.status, PipelineStatus::Healthy);
        assert!(health.pipelines.is_empty());
    }

    #[tokio::test]
    async fn test_registered_pipeline_awaits_first_cycle() {
        let registry = HealthRegistry::new();
        registry.register("cluster").await;

        let health = registry.health().await;
        assert_eq!(health.pipelines["cluster"].status, PipelineStatus::Healthy);
        assert!(health.pipelines["cluster"].message.is_some());
    }

    #[tokio::test]
    async fn test_failed_resources_degrade() {
        let registry = HealthRegistry::new();
        registry.record_cycle("vms", 4, 0).await;
        registry.record_cycle("cluster", 10, 2).await;

        let health = registry.health().await;
        assert_eq!(health.status, PipelineStatus::Degraded);
        assert_eq!(health.pipelines["cluster"].resources_failed, 2);
        assert!(health.status.is_operational());
    }

    #[tokio::test]
    async fn test_failed_pipeline_is_unhealthy() {
        let registry = HealthRegistry::new();
        registry.record_cycle("vms", 4, 1).await;
        registry.record_failure("cluster", "resource discovery failed").await;

        let health = registry.health().await;
        assert_eq!(health.status, PipelineStatus::Unhealthy);
        assert!(!health.status.is_operational());
    }

    #[tokio::test]
    async fn test_readiness_waits_for_first_cycle() {
        let registry = HealthRegistry::new();
        registry.register("vms").await;
        assert!(!registry.readiness().await.ready);

        registry.record_cycle("vms", 3, 0).await;
        registry.mark_cycle_complete().await;
        assert!(registry.readiness().await.ready);
    }

    #[tokio::test]
    async fn test_readiness_rejects_unhealthy_pipeline() {
        let registry = HealthRegistry::new();
        registry.record_failure("cluster", "opencost unreachable").await;
        registry.mark_cycle_complete().await;

        let readiness = registry.readiness().await;
        assert!(!readiness.ready);
        assert!(readiness.reason.unwrap().contains("cluster"));
    }
}

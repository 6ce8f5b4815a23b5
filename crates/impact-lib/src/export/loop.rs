//! Export loop

use crate::error::{ImpactError, Result};
use crate::health::HealthRegistry;
use crate::models::ImpactMetrics;
use crate::node::{ChildNode, CarbonIntensityProvider, FAILED_COMPONENTS_KEY};
use crate::observability::{EngineMetrics, ImpactExporter, StructuredLogger};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info};

/// Configuration for the export loop
#[derive(Debug, Clone)]
pub struct ExportConfig {
    /// Time between cycles (default: 5 minutes)
    pub interval: Duration,
    /// Intensity used when no provider answers
    pub default_carbon_intensity: f64,
    /// Instance name carried on structured log events
    pub instance: String,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            default_carbon_intensity: 100.0,
            instance: "sci-exporter".to_string(),
        }
    }
}

/// Totals of one export cycle
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleSummary {
    pub pipelines: usize,
    pub pipelines_failed: usize,
    pub resources_computed: usize,
    pub resources_failed: usize,
    pub series_exported: usize,
}

/// Drives every pipeline on a fixed interval
pub struct ExportLoop {
    pipelines: Vec<ChildNode>,
    carbon: Option<Arc<dyn CarbonIntensityProvider>>,
    exporter: ImpactExporter,
    health: HealthRegistry,
    metrics: EngineMetrics,
    logger: StructuredLogger,
    config: ExportConfig,
}

impl ExportLoop {
    pub fn builder() -> ExportLoopBuilder {
        ExportLoopBuilder::new()
    }

    pub fn health(&self) -> &HealthRegistry {
        &self.health
    }

    pub fn exporter(&self) -> &ImpactExporter {
        &self.exporter
    }

    /// Run until a shutdown signal arrives
    ///
    /// The first cycle starts immediately. Discovery and static parameters
    /// are resolved once up front; failures there are retried by the cycle
    /// itself.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            pipelines = self.pipelines.len(),
            "Starting export loop"
        );

        for pipeline in &self.pipelines {
            self.health.register(pipeline.name()).await;
        }
        self.prepare().await;

        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let summary = self.run_cycle().await;
                    debug!(
                        pipelines = summary.pipelines,
                        failed = summary.pipelines_failed,
                        series = summary.series_exported,
                        "Export cycle complete"
                    );
                }
                _ = shutdown.recv() => {
                    info!("Shutting down export loop");
                    break;
                }
            }
        }
    }

    async fn prepare(&mut self) {
        let names: Vec<String> = self.pipelines.iter().map(|p| p.name().to_string()).collect();
        let results = join_all(self.pipelines.iter_mut().map(|p| p.prepare())).await;
        for (name, result) in names.into_iter().zip(results) {
            if let Err(e) = result {
                self.logger
                    .log_resource_failure(&name, &name, &e.to_string(), e.kind());
            }
        }
    }

    /// Compute, export and record one cycle of every pipeline
    pub async fn run_cycle(&mut self) -> CycleSummary {
        let start = Instant::now();
        let intensity = crate::node::resolve_carbon_intensity(
            None,
            self.carbon.as_ref(),
            self.config.default_carbon_intensity,
        )
        .await;

        let names: Vec<String> = self.pipelines.iter().map(|p| p.name().to_string()).collect();
        let results = join_all(
            self.pipelines
                .iter_mut()
                .map(|p| p.calculate(Some(intensity))),
        )
        .await;
        let elapsed = start.elapsed();

        let mut summary = CycleSummary {
            pipelines: names.len(),
            ..Default::default()
        };
        let mut trees = Vec::new();
        for (name, result) in names.into_iter().zip(results) {
            match result {
                Ok(tree) => {
                    let (computed, failed) = count_resources(&tree);
                    summary.resources_computed += computed;
                    summary.resources_failed += failed;
                    self.health.record_cycle(&name, computed, failed).await;
                    self.logger
                        .log_cycle(&name, computed, failed, elapsed.as_millis(), tree.sci());
                    trees.push(tree);
                }
                Err(e) => {
                    summary.pipelines_failed += 1;
                    self.report_failure(&name, &e).await;
                }
            }
        }

        summary.series_exported = self.exporter.export_cycle(&trees);
        self.metrics.observe_cycle_latency(start.elapsed().as_secs_f64());
        self.metrics.set_resource_counts(
            summary.resources_computed as i64,
            summary.resources_failed as i64,
        );
        self.health.mark_cycle_complete().await;
        summary
    }

    async fn report_failure(&self, pipeline: &str, error: &ImpactError) {
        self.logger
            .log_resource_failure(pipeline, pipeline, &error.to_string(), error.kind());
        self.health.record_failure(pipeline, error.to_string()).await;
    }
}

/// `(computed, failed)` resources in one tree
///
/// Computed records are the ones carrying observations; failures are read
/// from every rollup's failed-components list.
fn count_resources(tree: &ImpactMetrics) -> (usize, usize) {
    let mut computed = 0;
    let mut failed = 0;
    tree.walk(|_, node| {
        if node.observations.is_some() {
            computed += 1;
        }
        if let Some(list) = node.metadata.get(FAILED_COMPONENTS_KEY) {
            failed += list.split(',').filter(|s| !s.is_empty()).count();
        }
    });
    (computed, failed)
}

/// Builder for creating the export loop
pub struct ExportLoopBuilder {
    pipelines: Vec<ChildNode>,
    carbon: Option<Arc<dyn CarbonIntensityProvider>>,
    exporter: Option<ImpactExporter>,
    health: Option<HealthRegistry>,
    config: ExportConfig,
}

impl ExportLoopBuilder {
    pub fn new() -> Self {
        Self {
            pipelines: Vec::new(),
            carbon: None,
            exporter: None,
            health: None,
            config: ExportConfig::default(),
        }
    }

    /// Add a pipeline; each becomes one top-level metrics tree
    pub fn pipeline(mut self, pipeline: impl Into<ChildNode>) -> Self {
        self.pipelines.push(pipeline.into());
        self
    }

    pub fn carbon_provider(mut self, provider: Arc<dyn CarbonIntensityProvider>) -> Self {
        self.carbon = Some(provider);
        self
    }

    pub fn exporter(mut self, exporter: ImpactExporter) -> Self {
        self.exporter = Some(exporter);
        self
    }

    /// Share a registry with the API server
    pub fn health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.config.interval = interval;
        self
    }

    pub fn default_carbon_intensity(mut self, value: f64) -> Self {
        self.config.default_carbon_intensity = value;
        self
    }

    pub fn instance(mut self, instance: impl Into<String>) -> Self {
        self.config.instance = instance.into();
        self
    }

    pub fn build(self) -> Result<ExportLoop> {
        if self.pipelines.is_empty() {
            return Err(ImpactError::PermanentConfig(
                "export loop needs at least one pipeline".to_string(),
            ));
        }
        if self.config.interval.is_zero() {
            return Err(ImpactError::PermanentConfig(
                "export interval must be positive".to_string(),
            ));
        }

        Ok(ExportLoop {
            pipelines: self.pipelines,
            carbon: self.carbon,
            exporter: self.exporter.unwrap_or_default(),
            health: self.health.unwrap_or_default(),
            metrics: EngineMetrics::new(),
            logger: StructuredLogger::new(self.config.instance.clone()),
            config: self.config,
        })
    }
}

impl Default for ExportLoopBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::PipelineStatus;
    use crate::models::{ResourceIdentity, ResourceKind, ResourceObservation};
    use crate::node::{ImpactNode, ResourceObservationSource};
    use crate::observability::ImpactGauge;
    use crate::sources::{ConfiguredResourceProvider, FixedCarbonIntensity};
    use crate::window::TimeWindow;
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Mock source returning a fixed observation for known ids
    struct MockSource {
        known: Vec<String>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ResourceObservationSource for MockSource {
        async fn fetch(
            &self,
            resource_ids: &[String],
            _window: &TimeWindow,
        ) -> crate::Result<BTreeMap<String, ResourceObservation>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut out = BTreeMap::new();
            for id in resource_ids {
                if self.known.contains(id) {
                    out.insert(id.clone(), ResourceObservation::new(50.0, 4.0));
                } else {
                    return Err(ImpactError::PermanentConfig(format!("unknown vm {}", id)));
                }
            }
            Ok(out)
        }
    }

    fn pipeline(name: &str, ids: &[&str], known: &[&str]) -> (ImpactNode, Arc<MockSource>) {
        let resources = ids
            .iter()
            .map(|id| ResourceIdentity::new(*id, ResourceKind::AzureVm))
            .collect();
        let source = Arc::new(MockSource {
            known: known.iter().map(|s| s.to_string()).collect(),
            calls: AtomicUsize::new(0),
        });
        let node = ImpactNode::builder(name, ResourceKind::AzureVm)
            .provider(Arc::new(ConfiguredResourceProvider::new(resources)))
            .observation_source(source.clone())
            .build()
            .unwrap();
        (node, source)
    }

    #[test]
    fn test_builder_validation() {
        assert!(ExportLoop::builder().build().is_err());

        let (node, _) = pipeline("export-test-zero", &["vm-a"], &["vm-a"]);
        let result = ExportLoop::builder()
            .pipeline(node)
            .interval(Duration::ZERO)
            .build();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_cycle_exports_and_records_health() {
        let (healthy, _) = pipeline("export-test-vms", &["vm-a", "vm-b"], &["vm-a", "vm-b"]);
        let (partial, _) = pipeline("export-test-partial", &["vm-c", "vm-d"], &["vm-c"]);
        let (broken, _) = pipeline("export-test-broken", &["vm-e"], &[]);

        let mut export = ExportLoop::builder()
            .pipeline(healthy)
            .pipeline(partial)
            .pipeline(broken)
            .carbon_provider(Arc::new(FixedCarbonIntensity::new(250.0)))
            .build()
            .unwrap();

        let summary = export.run_cycle().await;

        assert_eq!(summary.pipelines, 3);
        assert_eq!(summary.pipelines_failed, 1);
        assert_eq!(summary.resources_computed, 3);
        assert_eq!(summary.resources_failed, 1);
        // 2 rollups + 3 resources
        assert_eq!(summary.series_exported, 5);

        let health = export.health().health().await;
        assert_eq!(health.pipelines["export-test-vms"].status, PipelineStatus::Healthy);
        assert_eq!(health.pipelines["export-test-partial"].status, PipelineStatus::Degraded);
        assert_eq!(health.pipelines["export-test-broken"].status, PipelineStatus::Unhealthy);
        assert!(!export.health().readiness().await.ready);

        let intensity = export.exporter().value(
            ImpactGauge::I,
            &["vm-a", "computeserver-static", "azure.vm", "", "", "export-test-vms"],
        );
        assert_eq!(intensity, Some(250.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_ticks_until_shutdown() {
        let (node, source) = pipeline("export-test-loop", &["vm-a"], &["vm-a"]);
        let health = HealthRegistry::new();
        let export = ExportLoop::builder()
            .pipeline(node)
            .health(health.clone())
            .interval(Duration::from_secs(60))
            .build()
            .unwrap();

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = tokio::spawn(export.run(shutdown_rx));

        tokio::time::sleep(Duration::from_secs(150)).await;
        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();

        // ticks at 0s, 60s and 120s
        assert_eq!(source.calls.load(Ordering::SeqCst), 3);
        assert!(health.readiness().await.ready);
    }
}

//! Observability infrastructure for the impact engine
//!
//! Provides:
//! - The Prometheus gauge sink for computed impact metrics
//! - Engine self-metrics (cycle latency, retries, terminal failures)
//! - Structured JSON logging with tracing

use crate::models::ImpactMetrics;
use prometheus::{
    register_gauge_vec, register_histogram, register_int_counter, register_int_gauge, GaugeVec,
    Histogram, IntCounter, IntGauge,
};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, OnceLock};
use tracing::{info, warn};

/// Histogram buckets for cycle latency (in seconds); cycles include
/// upstream calls and backoff, so the range is wide
const CYCLE_LATENCY_BUCKETS: &[f64] = &[0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 300.0];

/// Label names of every impact gauge
pub const IMPACT_LABELS: &[&str] = &["name", "model", "type", "namespace", "node", "parent"];

static ENGINE_METRICS: OnceLock<EngineMetricsInner> = OnceLock::new();
static IMPACT_GAUGES: OnceLock<ImpactGauges> = OnceLock::new();

struct EngineMetricsInner {
    cycle_latency_seconds: Histogram,
    fetch_retries: IntCounter,
    fetch_failures: IntCounter,
    resources_computed: IntGauge,
    resources_failed: IntGauge,
}

impl EngineMetricsInner {
    fn new() -> Self {
        Self {
            cycle_latency_seconds: register_histogram!(
                "sci_exporter_cycle_latency_seconds",
                "Time spent computing and exporting one impact cycle",
                CYCLE_LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register cycle_latency_seconds"),

            fetch_retries: register_int_counter!(
                "sci_exporter_fetch_retries_total",
                "Collaborator calls retried after a transient failure"
            )
            .expect("Failed to register fetch_retries"),

            fetch_failures: register_int_counter!(
                "sci_exporter_fetch_failures_total",
                "Collaborator calls that exhausted their retries"
            )
            .expect("Failed to register fetch_failures"),

            resources_computed: register_int_gauge!(
                "sci_exporter_resources_computed",
                "Resources with impact metrics in the last cycle"
            )
            .expect("Failed to register resources_computed"),

            resources_failed: register_int_gauge!(
                "sci_exporter_resources_failed",
                "Resources that failed in the last cycle"
            )
            .expect("Failed to register resources_failed"),
        }
    }
}

/// Handle to the engine's self-metrics
///
/// Clones share the same process-wide Prometheus collectors.
#[derive(Clone)]
pub struct EngineMetrics {
    _private: (),
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineMetrics {
    pub fn new() -> Self {
        ENGINE_METRICS.get_or_init(EngineMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &EngineMetricsInner {
        ENGINE_METRICS.get_or_init(EngineMetricsInner::new)
    }

    pub fn observe_cycle_latency(&self, duration_secs: f64) {
        self.inner().cycle_latency_seconds.observe(duration_secs);
    }

    pub fn inc_fetch_retries(&self) {
        self.inner().fetch_retries.inc();
    }

    pub fn inc_fetch_failures(&self) {
        self.inner().fetch_failures.inc();
    }

    pub fn set_resource_counts(&self, computed: i64, failed: i64) {
        self.inner().resources_computed.set(computed);
        self.inner().resources_failed.set(failed);
    }

    pub fn fetch_retries(&self) -> u64 {
        self.inner().fetch_retries.get()
    }
}

/// The seven figures exported per resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImpactGauge {
    ECpu,
    EMem,
    EGpu,
    E,
    I,
    M,
    Sci,
}

impl ImpactGauge {
    pub const ALL: [ImpactGauge; 7] = [
        ImpactGauge::ECpu,
        ImpactGauge::EMem,
        ImpactGauge::EGpu,
        ImpactGauge::E,
        ImpactGauge::I,
        ImpactGauge::M,
        ImpactGauge::Sci,
    ];

    fn read(&self, metrics: &ImpactMetrics) -> f64 {
        match self {
            ImpactGauge::ECpu => metrics.e_cpu(),
            ImpactGauge::EMem => metrics.e_mem(),
            ImpactGauge::EGpu => metrics.e_gpu(),
            ImpactGauge::E => metrics.e(),
            ImpactGauge::I => metrics.i(),
            ImpactGauge::M => metrics.m(),
            ImpactGauge::Sci => metrics.sci(),
        }
    }
}

struct ImpactGauges {
    e_cpu: GaugeVec,
    e_mem: GaugeVec,
    e_gpu: GaugeVec,
    e: GaugeVec,
    i: GaugeVec,
    m: GaugeVec,
    sci: GaugeVec,
}

impl ImpactGauges {
    fn new() -> Self {
        Self {
            e_cpu: register_gauge_vec!("sci_e_cpu_kwh", "CPU energy over the window", IMPACT_LABELS)
                .expect("Failed to register sci_e_cpu_kwh"),
            e_mem: register_gauge_vec!("sci_e_mem_kwh", "Memory energy over the window", IMPACT_LABELS)
                .expect("Failed to register sci_e_mem_kwh"),
            e_gpu: register_gauge_vec!("sci_e_gpu_kwh", "GPU energy over the window", IMPACT_LABELS)
                .expect("Failed to register sci_e_gpu_kwh"),
            e: register_gauge_vec!("sci_e_kwh", "Total operational energy over the window", IMPACT_LABELS)
                .expect("Failed to register sci_e_kwh"),
            i: register_gauge_vec!("sci_i_gco2_per_kwh", "Grid carbon intensity", IMPACT_LABELS)
                .expect("Failed to register sci_i_gco2_per_kwh"),
            m: register_gauge_vec!("sci_m_gco2", "Embodied emissions share for the window", IMPACT_LABELS)
                .expect("Failed to register sci_m_gco2"),
            sci: register_gauge_vec!("sci_score_gco2", "Software Carbon Intensity, E*I+M", IMPACT_LABELS)
                .expect("Failed to register sci_score_gco2"),
        }
    }

    fn family(&self, gauge: ImpactGauge) -> &GaugeVec {
        match gauge {
            ImpactGauge::ECpu => &self.e_cpu,
            ImpactGauge::EMem => &self.e_mem,
            ImpactGauge::EGpu => &self.e_gpu,
            ImpactGauge::E => &self.e,
            ImpactGauge::I => &self.i,
            ImpactGauge::M => &self.m,
            ImpactGauge::Sci => &self.sci,
        }
    }
}

/// Prometheus sink for impact metric trees
///
/// Each exporter remembers the series it set in its last cycle and removes
/// the ones that did not come back, so vanished resources stop reporting.
#[derive(Clone)]
pub struct ImpactExporter {
    exported: Arc<Mutex<HashSet<Vec<String>>>>,
    latest: Arc<Mutex<Vec<ImpactMetrics>>>,
}

impl Default for ImpactExporter {
    fn default() -> Self {
        Self::new()
    }
}

impl ImpactExporter {
    pub fn new() -> Self {
        IMPACT_GAUGES.get_or_init(ImpactGauges::new);
        Self {
            exported: Arc::new(Mutex::new(HashSet::new())),
            latest: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn gauges(&self) -> &ImpactGauges {
        IMPACT_GAUGES.get_or_init(ImpactGauges::new)
    }

    /// Export every tree of one cycle; returns the number of records set
    pub fn export_cycle(&self, trees: &[ImpactMetrics]) -> usize {
        let mut current = HashSet::new();
        for tree in trees {
            tree.walk(|parent, node| {
                let labels = series_labels(parent, node);
                self.set_series(&labels, node);
                current.insert(labels);
            });
        }
        let count = current.len();

        let mut exported = self.exported.lock().unwrap_or_else(|e| e.into_inner());
        for stale in exported.difference(&current) {
            let refs: Vec<&str> = stale.iter().map(String::as_str).collect();
            for gauge in ImpactGauge::ALL {
                // Already gone is fine
                let _ = self.gauges().family(gauge).remove_label_values(&refs);
            }
        }
        *exported = current;
        drop(exported);

        *self.latest.lock().unwrap_or_else(|e| e.into_inner()) = trees.to_vec();
        count
    }

    /// Trees exported by the last cycle
    pub fn latest(&self) -> Vec<ImpactMetrics> {
        self.latest.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn set_series(&self, labels: &[String], node: &ImpactMetrics) {
        let labels: Vec<&str> = labels.iter().map(String::as_str).collect();
        for gauge in ImpactGauge::ALL {
            self.gauges()
                .family(gauge)
                .with_label_values(&labels)
                .set(gauge.read(node));
        }
    }

    /// Current value of one series, if this exporter set it last cycle
    pub fn value(&self, gauge: ImpactGauge, labels: &[&str]) -> Option<f64> {
        let key: Vec<String> = labels.iter().map(|l| l.to_string()).collect();
        let exported = self.exported.lock().unwrap_or_else(|e| e.into_inner());
        if !exported.contains(&key) {
            return None;
        }
        self.gauges()
            .family(gauge)
            .get_metric_with_label_values(labels)
            .ok()
            .map(|g| g.get())
    }
}

/// Label values in [`IMPACT_LABELS`] order
pub fn series_labels(parent: Option<&ImpactMetrics>, node: &ImpactMetrics) -> Vec<String> {
    let meta = |key: &str| node.metadata.get(key).cloned().unwrap_or_default();
    vec![
        node.name.clone(),
        node.model.clone(),
        node.kind.clone(),
        meta("namespace"),
        meta("node"),
        parent.map(|p| p.name.clone()).unwrap_or_default(),
    ]
}

/// Structured logger for exporter events
///
/// Every event carries a fixed `event` field so log pipelines can filter
/// on it.
#[derive(Clone)]
pub struct StructuredLogger {
    instance: String,
}

impl StructuredLogger {
    pub fn new(instance: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
        }
    }

    pub fn log_startup(&self, version: &str, pipelines: usize) {
        info!(
            event = "exporter_started",
            instance = %self.instance,
            version = %version,
            pipelines = pipelines,
            "SCI exporter started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "exporter_shutdown",
            instance = %self.instance,
            reason = %reason,
            "SCI exporter shutting down"
        );
    }

    pub fn log_cycle(&self, pipeline: &str, resources: usize, failures: usize, elapsed_ms: u128, sci: f64) {
        if failures == 0 {
            info!(
                event = "cycle_completed",
                instance = %self.instance,
                pipeline = %pipeline,
                resources = resources,
                failures = failures,
                elapsed_ms = elapsed_ms as u64,
                sci = sci,
                "Impact cycle completed"
            );
        } else {
            warn!(
                event = "cycle_completed",
                instance = %self.instance,
                pipeline = %pipeline,
                resources = resources,
                failures = failures,
                elapsed_ms = elapsed_ms as u64,
                sci = sci,
                "Impact cycle completed with failures"
            );
        }
    }

    pub fn log_resource_failure(&self, pipeline: &str, resource: &str, error: &str, kind: &str) {
        warn!(
            event = "resource_failed",
            instance = %self.instance,
            pipeline = %pipeline,
            resource = %resource,
            error_kind = %kind,
            error = %error,
            "Resource impact could not be computed"
        );
    }

    pub fn log_stale_carbon_intensity(&self, source: &str, age_hours: f64) {
        warn!(
            event = "stale_carbon_intensity",
            instance = %self.instance,
            source = %source,
            age_hours = age_hours,
            "Carbon intensity data is stale, using the forecast average"
        );
    }
}

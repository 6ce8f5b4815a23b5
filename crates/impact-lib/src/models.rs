//! Core data models for the impact engine

use crate::window::TimeWindow;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Kind tag used for rolled-up metrics
pub const AGGREGATE_KIND: &str = "aggregate";

/// Resource kinds the engine knows how to compute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    #[serde(rename = "azure.vm")]
    AzureVm,
    #[serde(rename = "aks.node")]
    AksNode,
    #[serde(rename = "aks.pod")]
    AksPod,
    #[serde(rename = "kubernetes.node")]
    KubernetesNode,
    #[serde(rename = "kubernetes.pod")]
    KubernetesPod,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::AzureVm => "azure.vm",
            ResourceKind::AksNode => "aks.node",
            ResourceKind::AksPod => "aks.pod",
            ResourceKind::KubernetesNode => "kubernetes.node",
            ResourceKind::KubernetesPod => "kubernetes.pod",
        }
    }

    /// Pods cannot be metered directly; their impact is attributed from a host
    pub fn is_attributed(&self) -> bool {
        matches!(self, ResourceKind::AksPod | ResourceKind::KubernetesPod)
    }

    /// Host kind that carries this kind's workloads
    pub fn host_kind(&self) -> Option<ResourceKind> {
        match self {
            ResourceKind::AksPod => Some(ResourceKind::AksNode),
            ResourceKind::KubernetesPod => Some(ResourceKind::KubernetesNode),
            _ => None,
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A concrete resource returned by discovery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceIdentity {
    pub id: String,
    pub name: String,
    pub kind: ResourceKind,
    #[serde(default)]
    pub sku: Option<String>,
    /// Hosting node, for attributed kinds
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl ResourceIdentity {
    pub fn new(id: impl Into<String>, kind: ResourceKind) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            kind,
            sku: None,
            host: None,
            namespace: None,
            labels: BTreeMap::new(),
        }
    }

    pub fn with_sku(mut self, sku: impl Into<String>) -> Self {
        self.sku = Some(sku.into());
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Labels attached to every metric computed for this resource
    pub fn metadata(&self) -> BTreeMap<String, String> {
        let mut metadata = self.labels.clone();
        if let Some(sku) = &self.sku {
            metadata.insert("sku".to_string(), sku.clone());
        }
        if let Some(namespace) = &self.namespace {
            metadata.insert("namespace".to_string(), namespace.clone());
        }
        if let Some(host) = &self.host {
            metadata.insert("node".to_string(), host.clone());
        }
        metadata
    }
}

/// Per-resource utilization snapshot for one window
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceObservation {
    /// Average CPU utilization, 0-100
    pub avg_cpu_percent: f64,
    /// Average consumed memory in GB
    pub avg_memory_gb: f64,
    /// Average GPU utilization, 0-100
    #[serde(default)]
    pub avg_gpu_percent: Option<f64>,
    /// vCPUs actually used by the workload (RR)
    #[serde(default)]
    pub reserved_cores: Option<f64>,
    /// Hours the workload was active inside the window (TR)
    #[serde(default)]
    pub time_reserved_hours: Option<f64>,
}

impl ResourceObservation {
    pub fn new(avg_cpu_percent: f64, avg_memory_gb: f64) -> Self {
        Self {
            avg_cpu_percent,
            avg_memory_gb,
            ..Default::default()
        }
    }

    pub fn with_gpu_percent(mut self, percent: f64) -> Self {
        self.avg_gpu_percent = Some(percent);
        self
    }

    pub fn with_reserved_cores(mut self, cores: f64) -> Self {
        self.reserved_cores = Some(cores);
        self
    }

    pub fn with_time_reserved_hours(mut self, hours: f64) -> Self {
        self.time_reserved_hours = Some(hours);
        self
    }
}

/// Resource-class constants, looked up by SKU
///
/// Every field is optional; missing values resolve to the configured
/// defaults at computation time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StaticParameters {
    #[serde(default)]
    pub sku: Option<String>,
    /// CPU package thermal design power
    #[serde(default)]
    pub tdp_watts: Option<f64>,
    /// vCPUs allocated to the instance
    #[serde(default)]
    pub reserved_vcpus: Option<f64>,
    /// vCPUs on the physical host
    #[serde(default)]
    pub platform_total_vcpus: Option<f64>,
    #[serde(default)]
    pub instance_memory_gb: Option<f64>,
    /// Lifecycle embodied carbon of the hardware
    #[serde(default)]
    pub embodied_carbon_kg: Option<f64>,
    #[serde(default)]
    pub gpu_tdp_watts: Option<f64>,
    #[serde(default)]
    pub gpu_count: Option<f64>,
}

/// Grid carbon intensity in gCO2e/kWh at retrieval time
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CarbonIntensityValue {
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

impl CarbonIntensityValue {
    pub fn new(value: f64) -> Self {
        Self {
            value,
            timestamp: Utc::now(),
        }
    }
}

/// Operational energy split, in kWh
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct EnergyBreakdown {
    pub cpu_kwh: f64,
    pub mem_kwh: f64,
    pub gpu_kwh: f64,
}

impl EnergyBreakdown {
    pub fn total(&self) -> f64 {
        self.cpu_kwh + self.mem_kwh + self.gpu_kwh
    }
}

/// Descriptive part of an [`ImpactMetrics`] record
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsHeader {
    pub name: String,
    pub kind: String,
    pub model: String,
    pub timespan: String,
    pub interval: String,
}

impl MetricsHeader {
    pub fn new(
        name: impl Into<String>,
        kind: impl Into<String>,
        model: impl Into<String>,
        window: &TimeWindow,
    ) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            model: model.into(),
            timespan: window.timespan().to_string(),
            interval: window.interval().to_string(),
        }
    }
}

/// Impact of one resource (or rollup) over one window
///
/// `E` and `SCI` are derived at construction and cannot be set directly,
/// so `E == E_CPU + E_MEM + E_GPU` always holds and leaves satisfy
/// `SCI == E * I + M`. Rollups carry `SCI == Σ child.SCI`, which is the same
/// figure whenever the children share one intensity.
/// Records are built fresh every cycle and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImpactMetrics {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub model: String,
    pub timespan: String,
    pub interval: String,
    #[serde(rename = "E_CPU")]
    e_cpu: f64,
    #[serde(rename = "E_MEM")]
    e_mem: f64,
    #[serde(rename = "E_GPU")]
    e_gpu: f64,
    #[serde(rename = "E")]
    e: f64,
    #[serde(rename = "I")]
    i: f64,
    #[serde(rename = "M")]
    m: f64,
    #[serde(rename = "SCI")]
    sci: f64,
    pub metadata: BTreeMap<String, String>,
    pub observations: Option<ResourceObservation>,
    pub static_params: Option<StaticParameters>,
    components: Vec<ImpactMetrics>,
    #[serde(skip_serializing_if = "Option::is_none")]
    host_node: Option<Arc<ImpactMetrics>>,
}

impl ImpactMetrics {
    /// Leaf record from an energy split, an intensity and an embodied share
    pub fn new(header: MetricsHeader, energy: EnergyBreakdown, intensity: f64, embodied: f64) -> Self {
        let e = energy.total();
        Self {
            name: header.name,
            kind: header.kind,
            model: header.model,
            timespan: header.timespan,
            interval: header.interval,
            e_cpu: energy.cpu_kwh,
            e_mem: energy.mem_kwh,
            e_gpu: energy.gpu_kwh,
            e,
            i: intensity,
            m: embodied,
            sci: e * intensity + embodied,
            metadata: BTreeMap::new(),
            observations: None,
            static_params: None,
            components: Vec::new(),
            host_node: None,
        }
    }

    /// Rollup summing energy, embodied emissions and SCI over `components`
    ///
    /// `I` is the supplied intensity, not a sum. With no components every
    /// figure is zero.
    pub fn aggregate(header: MetricsHeader, intensity: f64, components: Vec<ImpactMetrics>) -> Self {
        let mut energy = EnergyBreakdown::default();
        let mut m = 0.0;
        let mut sci = 0.0;
        for child in &components {
            energy.cpu_kwh += child.e_cpu;
            energy.mem_kwh += child.e_mem;
            energy.gpu_kwh += child.e_gpu;
            m += child.m;
            sci += child.sci;
        }

        let mut rollup = Self::new(header, energy, intensity, m);
        // Children may have been computed against different intensities
        rollup.sci = sci;
        rollup.components = components;
        rollup
    }

    pub fn with_metadata(mut self, metadata: BTreeMap<String, String>) -> Self {
        self.metadata.extend(metadata);
        self
    }

    pub fn with_observations(mut self, observations: ResourceObservation) -> Self {
        self.observations = Some(observations);
        self
    }

    pub fn with_static_params(mut self, params: StaticParameters) -> Self {
        self.static_params = Some(params);
        self
    }

    pub fn with_host_node(mut self, host: Arc<ImpactMetrics>) -> Self {
        self.host_node = Some(host);
        self
    }

    pub fn e_cpu(&self) -> f64 {
        self.e_cpu
    }

    pub fn e_mem(&self) -> f64 {
        self.e_mem
    }

    pub fn e_gpu(&self) -> f64 {
        self.e_gpu
    }

    pub fn e(&self) -> f64 {
        self.e
    }

    pub fn i(&self) -> f64 {
        self.i
    }

    pub fn m(&self) -> f64 {
        self.m
    }

    pub fn sci(&self) -> f64 {
        self.sci
    }

    pub fn components(&self) -> &[ImpactMetrics] {
        &self.components
    }

    /// Host record this one was attributed from
    pub fn host_node(&self) -> Option<&ImpactMetrics> {
        self.host_node.as_deref()
    }

    /// Depth-first walk over this record and its components, with each
    /// record's parent
    pub fn walk<'a, F>(&'a self, mut visit: F)
    where
        F: FnMut(Option<&'a ImpactMetrics>, &'a ImpactMetrics),
    {
        fn go<'a, F>(parent: Option<&'a ImpactMetrics>, node: &'a ImpactMetrics, visit: &mut F)
        where
            F: FnMut(Option<&'a ImpactMetrics>, &'a ImpactMetrics),
        {
            visit(parent, node);
            for child in &node.components {
                go(Some(node), child, visit);
            }
        }
        go(None, self, &mut visit);
    }

    /// Number of levels in the component tree (a leaf has depth 1)
    pub fn depth(&self) -> usize {
        1 + self.components.iter().map(|c| c.depth()).max().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-9;

    fn header(name: &str) -> MetricsHeader {
        MetricsHeader::new(name, "kubernetes.node", "test", &TimeWindow::default())
    }

    #[test]
    fn test_leaf_invariants() {
        let energy = EnergyBreakdown {
            cpu_kwh: 0.3,
            mem_kwh: 0.01,
            gpu_kwh: 0.05,
        };
        let metrics = ImpactMetrics::new(header("n1"), energy, 250.0, 12.5);

        assert!((metrics.e() - 0.36).abs() < EPS);
        assert!((metrics.sci() - (0.36 * 250.0 + 12.5)).abs() < EPS);
        assert_eq!(metrics.timespan, "PT1H");
        assert!(metrics.components().is_empty());
        assert_eq!(metrics.depth(), 1);
    }

    #[test]
    fn test_aggregate_empty_is_zero() {
        let rollup = ImpactMetrics::aggregate(header("empty"), 100.0, vec![]);
        assert_eq!(rollup.e(), 0.0);
        assert_eq!(rollup.m(), 0.0);
        assert_eq!(rollup.sci(), 0.0);
        assert_eq!(rollup.i(), 100.0);
    }

    #[test]
    fn test_aggregate_sums_children() {
        let a = ImpactMetrics::new(
            header("a"),
            EnergyBreakdown { cpu_kwh: 1.0, mem_kwh: 0.5, gpu_kwh: 0.0 },
            100.0,
            2.0,
        );
        let b = ImpactMetrics::new(
            header("b"),
            EnergyBreakdown { cpu_kwh: 0.25, mem_kwh: 0.0, gpu_kwh: 0.1 },
            300.0,
            1.0,
        );
        let expected_sci = a.sci() + b.sci();

        let rollup = ImpactMetrics::aggregate(header("ab"), 200.0, vec![a, b]);
        assert!((rollup.e() - 1.85).abs() < EPS);
        assert!((rollup.e_cpu() - 1.25).abs() < EPS);
        assert!((rollup.m() - 3.0).abs() < EPS);
        assert!((rollup.sci() - expected_sci).abs() < EPS);
        assert_eq!(rollup.i(), 200.0);
        assert_eq!(rollup.components().len(), 2);
        assert_eq!(rollup.depth(), 2);
    }

    #[test]
    fn test_walk_visits_depth_first_with_parent() {
        let leaf = ImpactMetrics::new(header("leaf"), EnergyBreakdown::default(), 100.0, 0.0);
        let mid = ImpactMetrics::aggregate(header("mid"), 100.0, vec![leaf]);
        let root = ImpactMetrics::aggregate(header("root"), 100.0, vec![mid]);

        let mut seen = Vec::new();
        root.walk(|parent, node| {
            seen.push((parent.map(|p| p.name.clone()), node.name.clone()));
        });

        assert_eq!(
            seen,
            vec![
                (None, "root".to_string()),
                (Some("root".to_string()), "mid".to_string()),
                (Some("mid".to_string()), "leaf".to_string()),
            ]
        );
    }

    #[test]
    fn test_serialized_field_names() {
        let metrics = ImpactMetrics::new(
            header("n1"),
            EnergyBreakdown { cpu_kwh: 0.3, mem_kwh: 0.0, gpu_kwh: 0.0 },
            100.0,
            1.0,
        );
        let json = serde_json::to_value(&metrics).unwrap();
        assert_eq!(json["type"], "kubernetes.node");
        assert!(json.get("E_CPU").is_some());
        assert!(json.get("SCI").is_some());
        assert!(json.get("host_node").is_none());
    }

    #[test]
    fn test_identity_metadata_labels() {
        let pod = ResourceIdentity::new("pod-a", ResourceKind::KubernetesPod)
            .with_namespace("keda")
            .with_host("node-1");
        let metadata = pod.metadata();
        assert_eq!(metadata["namespace"], "keda");
        assert_eq!(metadata["node"], "node-1");
        assert!(ResourceKind::KubernetesPod.is_attributed());
        assert_eq!(
            ResourceKind::AksPod.host_kind(),
            Some(ResourceKind::AksNode)
        );
        assert!(!ResourceKind::AzureVm.is_attributed());
    }
}

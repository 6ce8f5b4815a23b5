//! Impact derived from a host's already-computed metrics
//!
//! Energy scales with the sub-resource's share of the host's utilization.
//! Embodied emissions are recomputed from the sub-resource's own reserved
//! cores against the host's platform size.

use super::impact_node::{ImpactNode, NodeReport};
use super::{resolve_carbon_intensity, CarbonIntensityProvider};
use crate::config::{AttributionConfig, ModelDefaults};
use crate::error::{ImpactError, Result};
use crate::model::{calculate_m, time_reserved_or_window};
use crate::models::{
    CarbonIntensityValue, EnergyBreakdown, ImpactMetrics, MetricsHeader, ResourceIdentity,
    ResourceKind, ResourceObservation, StaticParameters,
};
use crate::window::TimeWindow;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// A sub-resource (typically a pod) attributed from its host
#[derive(Clone)]
pub struct AttributedImpactNode {
    resource: ResourceIdentity,
    window: TimeWindow,
    observation: Option<ResourceObservation>,
    static_params: StaticParameters,
    host: Option<Arc<ImpactMetrics>>,
    carbon: Option<Arc<dyn CarbonIntensityProvider>>,
    defaults: ModelDefaults,
    attribution: AttributionConfig,
}

impl std::fmt::Debug for AttributedImpactNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttributedImpactNode")
            .field("resource", &self.resource.id)
            .field("host", &self.host.as_ref().map(|h| h.name.as_str()))
            .field("has_observation", &self.observation.is_some())
            .finish()
    }
}

impl AttributedImpactNode {
    pub fn new(resource: ResourceIdentity, window: TimeWindow) -> Self {
        Self {
            resource,
            window,
            observation: None,
            static_params: StaticParameters::default(),
            host: None,
            carbon: None,
            defaults: ModelDefaults::default(),
            attribution: AttributionConfig::default(),
        }
    }

    pub fn with_observation(mut self, observation: ResourceObservation) -> Self {
        self.observation = Some(observation);
        self
    }

    /// The sub-resource's own share (reserved cores)
    pub fn with_static_params(mut self, params: StaticParameters) -> Self {
        self.static_params = params;
        self
    }

    pub fn with_host(mut self, host: Arc<ImpactMetrics>) -> Self {
        self.host = Some(host);
        self
    }

    pub fn with_carbon_provider(mut self, provider: Arc<dyn CarbonIntensityProvider>) -> Self {
        self.carbon = Some(provider);
        self
    }

    pub fn with_defaults(mut self, defaults: ModelDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn with_attribution(mut self, attribution: AttributionConfig) -> Self {
        self.attribution = attribution;
        self
    }

    pub fn set_observation(&mut self, observation: ResourceObservation) {
        self.observation = Some(observation);
    }

    pub fn set_host(&mut self, host: Arc<ImpactMetrics>) {
        self.host = Some(host);
    }

    pub fn resource(&self) -> &ResourceIdentity {
        &self.resource
    }

    pub fn name(&self) -> &str {
        &self.resource.name
    }

    /// Derive this resource's metrics from the host's
    ///
    /// Intensity: the provider is re-queried when present, since it may be
    /// fresher than the host's; otherwise the supplied value, then the
    /// host's own `I`.
    pub async fn calculate(
        &self,
        carbon_intensity: Option<CarbonIntensityValue>,
    ) -> Result<ImpactMetrics> {
        let observation = self.observation.as_ref().ok_or_else(|| {
            ImpactError::PermanentConfig(format!(
                "no observation set for '{}'",
                self.resource.id
            ))
        })?;
        let host = self.host.as_ref().ok_or_else(|| {
            ImpactError::PermanentConfig(format!("no host metrics set for '{}'", self.resource.id))
        })?;
        let host_observation = host.observations.as_ref().ok_or_else(|| {
            ImpactError::PermanentConfig(format!(
                "host '{}' of '{}' carries no observations",
                host.name, self.resource.id
            ))
        })?;

        let intensity = match (&self.carbon, carbon_intensity) {
            (Some(provider), supplied) => {
                let fallback = supplied.map(|ci| ci.value).unwrap_or(host.i());
                resolve_carbon_intensity(None, Some(provider), fallback).await
            }
            (None, Some(supplied)) => supplied,
            (None, None) => CarbonIntensityValue::new(host.i()),
        };

        let cpu_ratio = self.ratio(
            "cpu",
            observation.avg_cpu_percent,
            host_observation.avg_cpu_percent,
        );
        let mem_ratio = self.ratio(
            "memory",
            observation.avg_memory_gb,
            host_observation.avg_memory_gb,
        );
        // GPU sharing is not attributed
        let gpu_ratio = 0.0;

        let energy = EnergyBreakdown {
            cpu_kwh: host.e_cpu() * cpu_ratio,
            mem_kwh: host.e_mem() * mem_ratio,
            gpu_kwh: host.e_gpu() * gpu_ratio,
        };

        let host_params = host.static_params.clone().unwrap_or_default();
        let embodied_kg = host_params
            .embodied_carbon_kg
            .unwrap_or(self.defaults.embodied_carbon_kg);
        let host_total = host_params
            .platform_total_vcpus
            .unwrap_or(self.defaults.total_vcpus);
        let own_cores = observation
            .reserved_cores
            .or(self.static_params.reserved_vcpus)
            .unwrap_or(self.defaults.reserved_cores);
        let time_reserved =
            time_reserved_or_window(observation.time_reserved_hours, &self.window, &self.resource.id);
        let embodied = calculate_m(
            embodied_kg,
            time_reserved,
            own_cores,
            host_total,
            self.defaults.lifespan_hours,
        );

        debug!(
            resource = %self.resource.id,
            host = %host.name,
            cpu_ratio,
            mem_ratio,
            "attributed from host"
        );

        let header = MetricsHeader::new(
            self.resource.name.clone(),
            self.resource.kind.as_str(),
            host.model.clone(),
            &self.window,
        );
        let mut own_params = self.static_params.clone();
        own_params.reserved_vcpus = Some(own_cores);

        Ok(ImpactMetrics::new(header, energy, intensity.value, embodied)
            .with_metadata(self.resource.metadata())
            .with_observations(observation.clone())
            .with_static_params(own_params)
            .with_host_node(host.clone()))
    }

    /// `own / host`, 0 when the host figure is not positive
    fn ratio(&self, dimension: &str, own: f64, host: f64) -> f64 {
        if !(host > 0.0) {
            return 0.0;
        }
        let ratio = own / host;
        if ratio > 1.0 {
            warn!(
                resource = %self.resource.id,
                dimension,
                ratio,
                clamped = self.attribution.clamp_ratios,
                "sub-resource utilization exceeds its host's"
            );
        }
        if self.attribution.clamp_ratios {
            ratio.clamp(0.0, 1.0)
        } else {
            ratio
        }
    }
}

/// Pod pipeline: computes every host once, then attributes each pod
///
/// `pods` is only used for discovery, static shares and observations; its
/// model is never invoked.
pub struct HostAttributionNode {
    name: String,
    kind: ResourceKind,
    metadata: BTreeMap<String, String>,
    hosts: ImpactNode,
    pods: ImpactNode,
    defaults: ModelDefaults,
    attribution: AttributionConfig,
}

impl std::fmt::Debug for HostAttributionNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostAttributionNode")
            .field("name", &self.name)
            .field("hosts", &self.hosts)
            .field("pods", &self.pods)
            .finish()
    }
}

impl HostAttributionNode {
    pub fn new(name: impl Into<String>, hosts: ImpactNode, pods: ImpactNode) -> Self {
        Self {
            name: name.into(),
            kind: pods.kind(),
            metadata: pods.metadata().clone(),
            hosts,
            pods,
            defaults: ModelDefaults::default(),
            attribution: AttributionConfig::default(),
        }
    }

    pub fn with_defaults(mut self, defaults: ModelDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn with_attribution(mut self, attribution: AttributionConfig) -> Self {
        self.attribution = attribution;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    pub fn hosts(&self) -> &ImpactNode {
        &self.hosts
    }

    pub fn pods(&self) -> &ImpactNode {
        &self.pods
    }

    /// Discover hosts and pods and resolve their static parameters
    pub async fn prepare(&mut self) -> Result<()> {
        self.hosts.lookup_static_params().await?;
        self.pods.lookup_static_params().await?;
        Ok(())
    }

    /// Compute every host, then every pod against its host
    ///
    /// Host discovery failure fails the whole pipeline. A pod whose host is
    /// unknown or failed fails alone.
    ///
    /// Pod intensity follows [`AttributedImpactNode::calculate`]: the pods'
    /// provider, when set, is queried once for the batch and wins over the
    /// supplied value; without one, the supplied value, then each host's `I`.
    pub async fn calculate(
        &mut self,
        carbon_intensity: Option<CarbonIntensityValue>,
    ) -> Result<NodeReport> {
        let host_report = self.hosts.calculate(carbon_intensity).await?;

        let mut hosts_by_key: BTreeMap<String, Arc<ImpactMetrics>> = BTreeMap::new();
        let mut host_names: BTreeMap<String, String> = BTreeMap::new();
        for resource in self.hosts.resources().unwrap_or_default() {
            host_names.insert(resource.name.clone(), resource.id.clone());
        }
        for (id, metrics) in host_report.metrics {
            hosts_by_key.insert(id, Arc::new(metrics));
        }

        self.pods.lookup_static_params().await?;
        self.pods.fetch_observations().await?;

        // Same precedence as a lone attributed node, with one provider
        // reading shared by the whole batch
        let intensity = match self.pods.carbon_provider() {
            Some(provider) => {
                let fallback = carbon_intensity
                    .map(|ci| ci.value)
                    .unwrap_or(self.defaults.carbon_intensity);
                Some(resolve_carbon_intensity(None, Some(provider), fallback).await)
            }
            None => carbon_intensity,
        };

        let mut report = NodeReport {
            metrics: BTreeMap::new(),
            failures: self.pods.failures(),
        };
        let pods: Vec<ResourceIdentity> = self.pods.resources().unwrap_or_default().to_vec();

        for pod in pods {
            if report.failures.contains_key(&pod.id) {
                continue;
            }
            let Some(observation) = self.pods.observations().get(&pod.id).cloned() else {
                debug!(pod = %pod.id, "no observation, skipping");
                continue;
            };

            let host = pod.host.as_ref().and_then(|host| {
                hosts_by_key.get(host).or_else(|| {
                    host_names
                        .get(host)
                        .and_then(|id| hosts_by_key.get(id))
                })
            });
            let Some(host) = host.cloned() else {
                let reason = match pod.host.as_deref() {
                    Some(host) => match host_report.failures.get(host) {
                        Some(err) => format!("host '{}' failed: {}", host, err),
                        None => format!("host '{}' has no metrics", host),
                    },
                    None => "pod has no host".to_string(),
                };
                report
                    .failures
                    .insert(pod.id.clone(), ImpactError::PermanentConfig(reason));
                continue;
            };

            let params = self
                .pods
                .static_params()
                .get(&pod.id)
                .cloned()
                .unwrap_or_default();
            let id = pod.id.clone();
            let node = AttributedImpactNode::new(pod, self.pods.window().clone())
                .with_observation(observation)
                .with_static_params(params)
                .with_host(host)
                .with_defaults(self.defaults.clone())
                .with_attribution(self.attribution.clone());

            match node.calculate(intensity).await {
                Ok(metrics) => {
                    report.metrics.insert(id, metrics);
                }
                Err(e) => {
                    report.failures.insert(id, e);
                }
            }
        }

        Ok(report)
    }
}

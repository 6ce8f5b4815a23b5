//! Static-coefficient model for compute servers (VMs and cluster nodes)

use super::energy::{
    calculate_ecpu, calculate_egpu, calculate_m, memory_energy_kwh, time_reserved_or_window,
};
use super::ImpactModel;
use crate::config::ModelDefaults;
use crate::models::{
    EnergyBreakdown, ImpactMetrics, MetricsHeader, ResourceIdentity, ResourceObservation,
    StaticParameters,
};
use crate::window::TimeWindow;

pub const COMPUTE_SERVER_MODEL_ID: &str = "computeserver-static";

/// Static parameters with every fallback applied
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolvedParameters {
    pub tdp_watts: f64,
    pub reserved_cores: f64,
    pub total_vcpus: f64,
    pub embodied_carbon_kg: f64,
    pub gpu_tdp_watts: f64,
    pub gpu_count: f64,
}

impl ResolvedParameters {
    /// Apply defaults; observed reserved cores win over the instance size
    pub fn resolve(
        params: &StaticParameters,
        observation: Option<&ResourceObservation>,
        defaults: &ModelDefaults,
    ) -> Self {
        let reserved_cores = observation
            .and_then(|o| o.reserved_cores)
            .or(params.reserved_vcpus)
            .unwrap_or(defaults.reserved_cores);

        Self {
            tdp_watts: params.tdp_watts.unwrap_or(defaults.tdp_watts),
            reserved_cores,
            total_vcpus: params.platform_total_vcpus.unwrap_or(defaults.total_vcpus),
            embodied_carbon_kg: params.embodied_carbon_kg.unwrap_or(defaults.embodied_carbon_kg),
            gpu_tdp_watts: params.gpu_tdp_watts.unwrap_or(0.0),
            gpu_count: params.gpu_count.unwrap_or(0.0),
        }
    }

    /// Fold the resolved values back into the record kept on the metrics
    fn fill(&self, params: &StaticParameters) -> StaticParameters {
        StaticParameters {
            sku: params.sku.clone(),
            tdp_watts: Some(self.tdp_watts),
            reserved_vcpus: Some(params.reserved_vcpus.unwrap_or(self.reserved_cores)),
            platform_total_vcpus: Some(self.total_vcpus),
            instance_memory_gb: params.instance_memory_gb,
            embodied_carbon_kg: Some(self.embodied_carbon_kg),
            gpu_tdp_watts: params.gpu_tdp_watts,
            gpu_count: params.gpu_count,
        }
    }
}

/// TDP-tier energy model with CCF-style embodied emissions
#[derive(Debug, Clone, Default)]
pub struct ComputeServerModel {
    defaults: ModelDefaults,
}

impl ComputeServerModel {
    pub fn new(defaults: ModelDefaults) -> Self {
        Self { defaults }
    }

    pub fn defaults(&self) -> &ModelDefaults {
        &self.defaults
    }
}

impl ImpactModel for ComputeServerModel {
    fn model_identifier(&self) -> &str {
        COMPUTE_SERVER_MODEL_ID
    }

    fn default_carbon_intensity(&self) -> f64 {
        self.defaults.carbon_intensity
    }

    fn calculate_resource(
        &self,
        resource: &ResourceIdentity,
        observation: &ResourceObservation,
        params: &StaticParameters,
        intensity: f64,
        window: &TimeWindow,
    ) -> ImpactMetrics {
        let resolved = ResolvedParameters::resolve(params, Some(observation), &self.defaults);
        let hours = window.hours();

        let energy = EnergyBreakdown {
            cpu_kwh: calculate_ecpu(
                observation.avg_cpu_percent,
                resolved.tdp_watts,
                resolved.reserved_cores,
                hours,
            ),
            mem_kwh: memory_energy_kwh(observation.avg_memory_gb, self.defaults.memory_watts_per_gb),
            gpu_kwh: calculate_egpu(
                observation.avg_gpu_percent.unwrap_or(0.0),
                resolved.gpu_tdp_watts,
                resolved.gpu_count,
                hours,
            ),
        };

        let time_reserved =
            time_reserved_or_window(observation.time_reserved_hours, window, &resource.id);
        let embodied = calculate_m(
            resolved.embodied_carbon_kg,
            time_reserved,
            resolved.reserved_cores,
            resolved.total_vcpus,
            self.defaults.lifespan_hours,
        );

        let header = MetricsHeader::new(
            resource.name.clone(),
            resource.kind.as_str(),
            self.model_identifier(),
            window,
        );

        ImpactMetrics::new(header, energy, intensity, embodied)
            .with_metadata(resource.metadata())
            .with_observations(observation.clone())
            .with_static_params(resolved.fill(params))
    }
}

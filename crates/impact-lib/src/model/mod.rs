//! Impact models
//!
//! A model turns observations and static parameters into per-resource
//! [`ImpactMetrics`]. Models never perform I/O: the caller resolves the
//! carbon intensity before handing it over.

mod compute_server;
mod energy;

pub use compute_server::{ComputeServerModel, ResolvedParameters, COMPUTE_SERVER_MODEL_ID};
pub use energy::{
    calculate_ecpu, calculate_egpu, calculate_emem, calculate_m, memory_energy_kwh,
    tdp_coefficient, time_reserved_or_window, DEFAULT_LIFESPAN_HOURS, MEMORY_WATTS_PER_GB,
};

use crate::models::{
    CarbonIntensityValue, ImpactMetrics, ResourceIdentity, ResourceObservation, StaticParameters,
};
use crate::window::TimeWindow;
use std::collections::BTreeMap;
use tracing::debug;

/// Trait for impact calculators
pub trait ImpactModel: Send + Sync {
    /// Identifier exported in the `model` label
    fn model_identifier(&self) -> &str;

    /// Intensity used when the caller has none
    fn default_carbon_intensity(&self) -> f64;

    /// Compute one resource's metrics
    fn calculate_resource(
        &self,
        resource: &ResourceIdentity,
        observation: &ResourceObservation,
        params: &StaticParameters,
        intensity: f64,
        window: &TimeWindow,
    ) -> ImpactMetrics;

    /// Compute every resource that has an observation
    ///
    /// Resources missing from `observations` are skipped; resources missing
    /// from `static_params` use the model's defaults.
    fn calculate(
        &self,
        resources: &[ResourceIdentity],
        observations: &BTreeMap<String, ResourceObservation>,
        static_params: &BTreeMap<String, StaticParameters>,
        carbon_intensity: Option<CarbonIntensityValue>,
        window: &TimeWindow,
    ) -> BTreeMap<String, ImpactMetrics> {
        let intensity = carbon_intensity
            .map(|ci| ci.value)
            .unwrap_or_else(|| self.default_carbon_intensity());
        let empty = StaticParameters::default();

        resources
            .iter()
            .filter_map(|resource| {
                let Some(observation) = observations.get(&resource.id) else {
                    debug!(resource = %resource.id, "no observation, skipping");
                    return None;
                };
                let params = static_params.get(&resource.id).unwrap_or(&empty);
                let metrics =
                    self.calculate_resource(resource, observation, params, intensity, window);
                Some((resource.id.clone(), metrics))
            })
            .collect()
    }
}

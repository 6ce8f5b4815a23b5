//! Impact nodes and their collaborators
//!
//! Nodes are composed, not subclassed: one generic [`ImpactNode`] is handed
//! a resource provider, an observation source, an optional static-parameter
//! lookup and a model. Pods are derived from their hosts by
//! [`AttributedImpactNode`], and any mix of nodes rolls up through
//! [`AggregatedImpactNode`].

mod aggregated;
mod attributed;
mod impact_node;


pub use aggregated::{AggregatedImpactNode, ChildNode, FAILED_COMPONENTS_KEY};
pub use attributed::{AttributedImpactNode, HostAttributionNode};
pub use impact_node::{ImpactNode, ImpactNodeBuilder, NodeReport, NodeState};

use crate::error::Result;
use crate::models::{CarbonIntensityValue, ResourceIdentity, ResourceObservation, StaticParameters};
use crate::window::TimeWindow;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::warn;

/// Discovers the concrete resources a node covers
#[async_trait]
pub trait ResourceProvider: Send + Sync {
    async fn fetch_resources(&self) -> Result<Vec<ResourceIdentity>>;
}

/// Telemetry backend returning per-resource utilization
///
/// Unknown ids are absent from the result rather than an error.
#[async_trait]
pub trait ResourceObservationSource: Send + Sync {
    async fn fetch(
        &self,
        resource_ids: &[String],
        window: &TimeWindow,
    ) -> Result<BTreeMap<String, ResourceObservation>>;
}

/// SKU to resource-class constants
#[async_trait]
pub trait StaticParameterLookup: Send + Sync {
    /// Returns `MissingStaticParam` when nothing matches
    async fn lookup(&self, sku: &str) -> Result<StaticParameters>;
}

/// Source of the current grid carbon intensity
#[async_trait]
pub trait CarbonIntensityProvider: Send + Sync {
    async fn current_carbon_intensity(&self) -> Result<CarbonIntensityValue>;
}

/// Pick the intensity for one computation
///
/// A supplied value wins, then the provider, then `default`. A failing
/// provider never fails the computation.
pub(crate) async fn resolve_carbon_intensity(
    supplied: Option<CarbonIntensityValue>,
    provider: Option<&Arc<dyn CarbonIntensityProvider>>,
    default: f64,
) -> CarbonIntensityValue {
    if let Some(value) = supplied {
        return value;
    }
    let Some(provider) = provider else {
        return CarbonIntensityValue::new(default);
    };
    match provider.current_carbon_intensity().await {
        Ok(value) => value,
        Err(e) => {
            warn!(
                error = %e,
                default,
                "carbon intensity unavailable, using default"
            );
            CarbonIntensityValue::new(default)
        }
    }
}

//! Concrete collaborators for the node pipeline

mod carbon;
mod opencost;
mod static_table;

pub use carbon::{ForecastCarbonIntensity, FixedCarbonIntensity, STALE_AFTER_HOURS};
pub use opencost::{AllocationScope, OpenCostObservationSource};
pub use static_table::{normalize_sku, StaticParameterTable};

use crate::error::Result;
use crate::models::ResourceIdentity;
use crate::node::ResourceProvider;
use async_trait::async_trait;

/// Serves a fixed resource list from configuration
#[derive(Debug, Clone, Default)]
pub struct ConfiguredResourceProvider {
    resources: Vec<ResourceIdentity>,
}

impl ConfiguredResourceProvider {
    pub fn new(resources: Vec<ResourceIdentity>) -> Self {
        Self { resources }
    }
}

#[async_trait]
impl ResourceProvider for ConfiguredResourceProvider {
    async fn fetch_resources(&self) -> Result<Vec<ResourceIdentity>> {
        Ok(self.resources.clone())
    }
}

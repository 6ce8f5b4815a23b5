//! Per-resource pipeline: discovery, static parameters, observations, model

use super::{
    resolve_carbon_intensity, CarbonIntensityProvider, ResourceObservationSource,
    ResourceProvider, StaticParameterLookup,
};
use crate::concurrency::ConcurrencyController;
use crate::config::ModelDefaults;
use crate::error::{ImpactError, Result};
use crate::model::{ComputeServerModel, ImpactModel};
use crate::models::{
    CarbonIntensityValue, ImpactMetrics, ResourceIdentity, ResourceKind, ResourceObservation,
    StaticParameters,
};
use crate::window::TimeWindow;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Pipeline progress of an [`ImpactNode`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Uninitialized,
    ResourcesKnown,
    StaticParamsKnown,
    ObservationsFresh,
    MetricsComputed,
}

/// Outcome of one node computation
///
/// Failures are per resource; a resource appears in at most one of the
/// two maps.
#[derive(Debug, Clone, Default)]
pub struct NodeReport {
    pub metrics: BTreeMap<String, ImpactMetrics>,
    pub failures: BTreeMap<String, ImpactError>,
}

impl NodeReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// One group of resources of the same kind, computed with one model
pub struct ImpactNode {
    name: String,
    kind: ResourceKind,
    metadata: BTreeMap<String, String>,
    window: TimeWindow,
    provider: Arc<dyn ResourceProvider>,
    source: Arc<dyn ResourceObservationSource>,
    static_lookup: Option<Arc<dyn StaticParameterLookup>>,
    carbon: Option<Arc<dyn CarbonIntensityProvider>>,
    model: Arc<dyn ImpactModel>,
    controller: ConcurrencyController,

    state: NodeState,
    resources: Option<Vec<ResourceIdentity>>,
    static_params: BTreeMap<String, StaticParameters>,
    static_failures: BTreeMap<String, ImpactError>,
    observations: BTreeMap<String, ResourceObservation>,
    observation_failures: BTreeMap<String, ImpactError>,
}

impl std::fmt::Debug for ImpactNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImpactNode")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("state", &self.state)
            .field("model", &self.model.model_identifier())
            .finish()
    }
}

impl ImpactNode {
    pub fn builder(name: impl Into<String>, kind: ResourceKind) -> ImpactNodeBuilder {
        ImpactNodeBuilder::new(name, kind)
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

    pub fn window(&self) -> &TimeWindow {
        &self.window
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    pub fn model(&self) -> &Arc<dyn ImpactModel> {
        &self.model
    }

    pub fn carbon_provider(&self) -> Option<&Arc<dyn CarbonIntensityProvider>> {
        self.carbon.as_ref()
    }

    /// Resources from the last discovery, if any
    pub fn resources(&self) -> Option<&[ResourceIdentity]> {
        self.resources.as_deref()
    }

    pub fn static_params(&self) -> &BTreeMap<String, StaticParameters> {
        &self.static_params
    }

    /// Observations from the last fetch
    pub fn observations(&self) -> &BTreeMap<String, ResourceObservation> {
        &self.observations
    }

    /// Resources whose static lookup or latest observation fetch failed
    pub fn failures(&self) -> BTreeMap<String, ImpactError> {
        let mut failures = self.static_failures.clone();
        for (id, err) in &self.observation_failures {
            failures.entry(id.clone()).or_insert_with(|| err.clone());
        }
        failures
    }

    /// Discover resources; memoized until [`invalidate_resources`](Self::invalidate_resources)
    pub async fn fetch_resources(&mut self) -> Result<&[ResourceIdentity]> {
        if self.resources.is_none() {
            let provider = &self.provider;
            let label = format!("{}/resources", self.name);
            let resources = self
                .controller
                .run(&label, move || provider.fetch_resources())
                .await?;

            info!(
                node = %self.name,
                count = resources.len(),
                "resources discovered"
            );
            self.resources = Some(resources);
            self.state = NodeState::ResourcesKnown;
        }
        Ok(self.resources.as_deref().unwrap_or_default())
    }

    /// Forget discovered resources and everything derived from them
    pub fn invalidate_resources(&mut self) {
        self.resources = None;
        self.static_params.clear();
        self.static_failures.clear();
        self.observations.clear();
        self.observation_failures.clear();
        self.state = NodeState::Uninitialized;
    }

    /// Resolve static parameters for every known resource
    ///
    /// Successful lookups are kept until resources change; failed ones are
    /// retried on the next call. An unmatched SKU falls back to defaults.
    pub async fn lookup_static_params(&mut self) -> Result<&BTreeMap<String, StaticParameters>> {
        let resources = self.fetch_resources().await?.to_vec();
        let pending: Vec<ResourceIdentity> = resources
            .into_iter()
            .filter(|r| !self.static_params.contains_key(&r.id))
            .collect();

        let mut tasks = Vec::new();
        for resource in pending {
            match (&self.static_lookup, resource.sku.clone()) {
                (Some(lookup), Some(sku)) => {
                    let lookup = lookup.clone();
                    let task = move || {
                        let lookup = lookup.clone();
                        let sku = sku.clone();
                        async move { lookup.lookup(&sku).await }
                    };
                    tasks.push((resource.id, task));
                }
                (_, sku) => {
                    debug!(node = %self.name, resource = %resource.id, "no SKU lookup, using defaults");
                    self.static_params.insert(
                        resource.id,
                        StaticParameters {
                            sku,
                            ..Default::default()
                        },
                    );
                }
            }
        }

        self.static_failures.clear();
        for (id, result) in self.controller.run_bounded(tasks).await {
            match result {
                Ok(params) => {
                    self.static_params.insert(id, params);
                }
                Err(ImpactError::MissingStaticParam(sku)) => {
                    warn!(
                        node = %self.name,
                        resource = %id,
                        sku = %sku,
                        "no static parameters for SKU, using defaults"
                    );
                    self.static_params.insert(
                        id,
                        StaticParameters {
                            sku: Some(sku),
                            ..Default::default()
                        },
                    );
                }
                Err(e) => {
                    self.static_failures.insert(id, e);
                }
            }
        }

        self.state = NodeState::StaticParamsKnown;
        Ok(&self.static_params)
    }

    /// Fetch fresh observations for every known resource, one call each
    ///
    /// Never served from cache. A resource whose fetch fails is recorded in
    /// [`failures`](Self::failures) and left out; its siblings are not
    /// affected.
    pub async fn fetch_observations(&mut self) -> Result<&BTreeMap<String, ResourceObservation>> {
        let resources = self.fetch_resources().await?.to_vec();

        let tasks: Vec<_> = resources
            .iter()
            .map(|resource| {
                let source = self.source.clone();
                let window = self.window.clone();
                let ids = vec![resource.id.clone()];
                let task = move || {
                    let source = source.clone();
                    let window = window.clone();
                    let ids = ids.clone();
                    async move { source.fetch(&ids, &window).await }
                };
                (resource.id.clone(), task)
            })
            .collect();

        self.observations.clear();
        self.observation_failures.clear();
        for (id, result) in self.controller.run_bounded(tasks).await {
            match result {
                Ok(mut batch) => match batch.remove(&id) {
                    Some(observation) => {
                        self.observations.insert(id, observation);
                    }
                    None => debug!(node = %self.name, resource = %id, "no observation returned"),
                },
                Err(e) => {
                    self.observation_failures.insert(id, e);
                }
            }
        }

        self.state = NodeState::ObservationsFresh;
        Ok(&self.observations)
    }

    /// Run the full pipeline and compute every resource
    ///
    /// Discovery failures propagate. Static-parameter and observation
    /// failures are reported per resource in [`NodeReport::failures`].
    /// Without a supplied intensity the node's provider is queried, then
    /// the model default is used.
    pub async fn calculate(
        &mut self,
        carbon_intensity: Option<CarbonIntensityValue>,
    ) -> Result<NodeReport> {
        self.lookup_static_params().await?;
        self.fetch_observations().await?;

        let intensity = resolve_carbon_intensity(
            carbon_intensity,
            self.carbon.as_ref(),
            self.model.default_carbon_intensity(),
        )
        .await;

        let failures = self.failures();
        let computable: Vec<ResourceIdentity> = self
            .resources
            .as_deref()
            .unwrap_or_default()
            .iter()
            .filter(|r| !failures.contains_key(&r.id))
            .cloned()
            .collect();

        let metrics = self.model.calculate(
            &computable,
            &self.observations,
            &self.static_params,
            Some(intensity),
            &self.window,
        );

        self.state = NodeState::MetricsComputed;
        Ok(NodeReport { metrics, failures })
    }
}

/// Builder for [`ImpactNode`]
pub struct ImpactNodeBuilder {
    name: String,
    kind: ResourceKind,
    metadata: BTreeMap<String, String>,
    window: TimeWindow,
    provider: Option<Arc<dyn ResourceProvider>>,
    source: Option<Arc<dyn ResourceObservationSource>>,
    static_lookup: Option<Arc<dyn StaticParameterLookup>>,
    carbon: Option<Arc<dyn CarbonIntensityProvider>>,
    model: Option<Arc<dyn ImpactModel>>,
    defaults: ModelDefaults,
    controller: Option<ConcurrencyController>,
}

impl ImpactNodeBuilder {
    pub fn new(name: impl Into<String>, kind: ResourceKind) -> Self {
        Self {
            name: name.into(),
            kind,
            metadata: BTreeMap::new(),
            window: TimeWindow::default(),
            provider: None,
            source: None,
            static_lookup: None,
            carbon: None,
            model: None,
            defaults: ModelDefaults::default(),
            controller: None,
        }
    }

    pub fn metadata(mut self, metadata: BTreeMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn window(mut self, window: TimeWindow) -> Self {
        self.window = window;
        self
    }

    pub fn provider(mut self, provider: Arc<dyn ResourceProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn observation_source(mut self, source: Arc<dyn ResourceObservationSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn static_lookup(mut self, lookup: Arc<dyn StaticParameterLookup>) -> Self {
        self.static_lookup = Some(lookup);
        self
    }

    pub fn carbon_provider(mut self, provider: Arc<dyn CarbonIntensityProvider>) -> Self {
        self.carbon = Some(provider);
        self
    }

    /// Defaults to a [`ComputeServerModel`] over the configured defaults
    pub fn model(mut self, model: Arc<dyn ImpactModel>) -> Self {
        self.model = Some(model);
        self
    }

    pub fn defaults(mut self, defaults: ModelDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    /// Share a controller to put several nodes under one ceiling
    pub fn controller(mut self, controller: ConcurrencyController) -> Self {
        self.controller = Some(controller);
        self
    }

    pub fn build(self) -> Result<ImpactNode> {
        let provider = self.provider.ok_or_else(|| {
            ImpactError::PermanentConfig(format!("node '{}' has no resource provider", self.name))
        })?;
        let source = self.source.ok_or_else(|| {
            ImpactError::PermanentConfig(format!("node '{}' has no observation source", self.name))
        })?;
        let model: Arc<dyn ImpactModel> = match self.model {
            Some(model) => model,
            None => Arc::new(ComputeServerModel::new(self.defaults)),
        };

        Ok(ImpactNode {
            name: self.name,
            kind: self.kind,
            metadata: self.metadata,
            window: self.window,
            provider,
            source,
            static_lookup: self.static_lookup,
            carbon: self.carbon,
            model,
            controller: self.controller.unwrap_or_default(),
            state: NodeState::Uninitialized,
            resources: None,
            static_params: BTreeMap::new(),
            static_failures: BTreeMap::new(),
            observations: BTreeMap::new(),
            observation_failures: BTreeMap::new(),
        })
    }
}

//! Rollup over heterogeneous child nodes

use super::attributed::{AttributedImpactNode, HostAttributionNode};
use super::impact_node::{ImpactNode, NodeReport};
use super::{resolve_carbon_intensity, CarbonIntensityProvider};
use crate::config::{ModelDefaults, PartialFailurePolicy};
use crate::error::Result;
use crate::models::{CarbonIntensityValue, ImpactMetrics, MetricsHeader, AGGREGATE_KIND};
use crate::window::TimeWindow;
use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::warn;

/// Metadata key listing the children left out of a rollup
pub const FAILED_COMPONENTS_KEY: &str = "failed_components";

/// Any node an aggregate can hold
#[derive(Debug)]
pub enum ChildNode {
    Impact(ImpactNode),
    Attributed(AttributedImpactNode),
    HostAttribution(HostAttributionNode),
    Aggregated(AggregatedImpactNode),
}

impl From<ImpactNode> for ChildNode {
    fn from(node: ImpactNode) -> Self {
        ChildNode::Impact(node)
    }
}

impl From<AttributedImpactNode> for ChildNode {
    fn from(node: AttributedImpactNode) -> Self {
        ChildNode::Attributed(node)
    }
}

impl From<HostAttributionNode> for ChildNode {
    fn from(node: HostAttributionNode) -> Self {
        ChildNode::HostAttribution(node)
    }
}

impl From<AggregatedImpactNode> for ChildNode {
    fn from(node: AggregatedImpactNode) -> Self {
        ChildNode::Aggregated(node)
    }
}

impl ChildNode {
    pub fn name(&self) -> &str {
        match self {
            ChildNode::Impact(node) => node.name(),
            ChildNode::Attributed(node) => node.name(),
            ChildNode::HostAttribution(node) => node.name(),
            ChildNode::Aggregated(node) => node.name(),
        }
    }

    /// Resolve discovery and static parameters ahead of the first cycle
    pub fn prepare(&mut self) -> BoxFuture<'_, Result<()>> {
        async move {
            match self {
                ChildNode::Impact(node) => node.lookup_static_params().await.map(|_| ()),
                ChildNode::Attributed(_) => Ok(()),
                ChildNode::HostAttribution(node) => node.prepare().await,
                ChildNode::Aggregated(node) => node.prepare().await,
            }
        }
        .boxed()
    }

    /// Run this child's whole pipeline and return one metrics tree
    ///
    /// Resource groups roll up under the child's name with each resource as
    /// a component. A group where every resource failed is an error.
    pub fn calculate(
        &mut self,
        carbon_intensity: Option<CarbonIntensityValue>,
    ) -> BoxFuture<'_, Result<ImpactMetrics>> {
        async move {
            match self {
                ChildNode::Impact(node) => {
                    let report = node.calculate(carbon_intensity).await?;
                    let header = MetricsHeader::new(
                        node.name(),
                        node.kind().as_str(),
                        node.model().model_identifier(),
                        node.window(),
                    );
                    let metadata = node.metadata().clone();
                    roll_up(report, header, carbon_intensity, metadata)
                }
                ChildNode::Attributed(node) => node.calculate(carbon_intensity).await,
                ChildNode::HostAttribution(node) => {
                    let report = node.calculate(carbon_intensity).await?;
                    let header = MetricsHeader::new(
                        node.name(),
                        node.kind().as_str(),
                        node.hosts().model().model_identifier(),
                        node.pods().window(),
                    );
                    let metadata = node.metadata().clone();
                    roll_up(report, header, carbon_intensity, metadata)
                }
                ChildNode::Aggregated(node) => node.calculate(carbon_intensity).await,
            }
        }
        .boxed()
    }
}

/// Group rollup; `I` is the supplied intensity or, without one, the
/// members' shared value
fn roll_up(
    report: NodeReport,
    header: MetricsHeader,
    carbon_intensity: Option<CarbonIntensityValue>,
    mut metadata: BTreeMap<String, String>,
) -> Result<ImpactMetrics> {
    if report.metrics.is_empty() {
        if let Some((_, err)) = report.failures.into_iter().next() {
            return Err(err);
        }
    } else if !report.failures.is_empty() {
        for (resource, err) in &report.failures {
            warn!(
                node = %header.name,
                resource = %resource,
                error_kind = err.kind(),
                error = %err,
                "resource left out of rollup"
            );
        }
        let failed: Vec<&str> = report.failures.keys().map(String::as_str).collect();
        metadata.insert(FAILED_COMPONENTS_KEY.to_string(), failed.join(","));
    }

    let components: Vec<ImpactMetrics> = report.metrics.into_values().collect();
    let intensity = carbon_intensity
        .map(|ci| ci.value)
        .or_else(|| components.first().map(|c| c.i()))
        .unwrap_or(0.0);
    Ok(ImpactMetrics::aggregate(header, intensity, components).with_metadata(metadata))
}

/// Sums any mix of child nodes into one rollup
///
/// Children run concurrently and each drives its own pipeline. `I` of the
/// rollup is the intensity handed to every child, resolved once per call.
pub struct AggregatedImpactNode {
    name: String,
    window: TimeWindow,
    metadata: BTreeMap<String, String>,
    children: Vec<ChildNode>,
    carbon: Option<Arc<dyn CarbonIntensityProvider>>,
    defaults: ModelDefaults,
    policy: PartialFailurePolicy,
}

impl std::fmt::Debug for AggregatedImpactNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregatedImpactNode")
            .field("name", &self.name)
            .field("policy", &self.policy)
            .field("children", &self.children)
            .finish()
    }
}

impl AggregatedImpactNode {
    pub fn new(name: impl Into<String>, window: TimeWindow) -> Self {
        Self {
            name: name.into(),
            window,
            metadata: BTreeMap::new(),
            children: Vec::new(),
            carbon: None,
            defaults: ModelDefaults::default(),
            policy: PartialFailurePolicy::default(),
        }
    }

    pub fn with_child(mut self, child: impl Into<ChildNode>) -> Self {
        self.children.push(child.into());
        self
    }

    pub fn with_metadata(mut self, metadata: BTreeMap<String, String>) -> Self {
        self.metadata = metadata;
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

    pub fn with_policy(mut self, policy: PartialFailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn push(&mut self, child: impl Into<ChildNode>) {
        self.children.push(child.into());
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn children(&self) -> &[ChildNode] {
        &self.children
    }

    pub fn policy(&self) -> PartialFailurePolicy {
        self.policy
    }

    pub async fn prepare(&mut self) -> Result<()> {
        let results = join_all(self.children.iter_mut().map(|child| child.prepare())).await;
        results.into_iter().collect()
    }

    /// Compute every child and sum them
    ///
    /// Waits for all children before summing. Under `ContributeZero` a
    /// failed child is left out and named in the `failed_components`
    /// metadata; under `FailClosed` the first failure (in child order) is
    /// returned. No children yields an all-zero rollup.
    pub async fn calculate(
        &mut self,
        carbon_intensity: Option<CarbonIntensityValue>,
    ) -> Result<ImpactMetrics> {
        let intensity = resolve_carbon_intensity(
            carbon_intensity,
            self.carbon.as_ref(),
            self.defaults.carbon_intensity,
        )
        .await;

        let names: Vec<String> = self.children.iter().map(|c| c.name().to_string()).collect();
        let results = join_all(
            self.children
                .iter_mut()
                .map(|child| child.calculate(Some(intensity))),
        )
        .await;

        let mut components = Vec::with_capacity(results.len());
        let mut failed = Vec::new();
        for (name, result) in names.into_iter().zip(results) {
            match result {
                Ok(metrics) => components.push(metrics),
                Err(e) => match self.policy {
                    PartialFailurePolicy::FailClosed => {
                        warn!(
                            aggregate = %self.name,
                            child = %name,
                            error = %e,
                            "child failed, failing aggregate"
                        );
                        return Err(e);
                    }
                    PartialFailurePolicy::ContributeZero => {
                        warn!(
                            aggregate = %self.name,
                            child = %name,
                            error = %e,
                            "child failed, contributing zero"
                        );
                        failed.push(name);
                    }
                },
            }
        }

        let mut metadata = self.metadata.clone();
        if !failed.is_empty() {
            metadata.insert(FAILED_COMPONENTS_KEY.to_string(), failed.join(","));
        }

        let header = MetricsHeader::new(self.name.clone(), AGGREGATE_KIND, AGGREGATE_KIND, &self.window);
        Ok(ImpactMetrics::aggregate(header, intensity.value, components).with_metadata(metadata))
    }
}

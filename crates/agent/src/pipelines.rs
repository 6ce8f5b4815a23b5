//! Builds the impact node tree from configuration

use crate::config::{ExporterConfig, NodeDefinition, ResourceEntry};
use anyhow::Result;
use impact_lib::node::{CarbonIntensityProvider, ResourceObservationSource, StaticParameterLookup};
use impact_lib::sources::{
    AllocationScope, ConfiguredResourceProvider, FixedCarbonIntensity, ForecastCarbonIntensity,
    OpenCostObservationSource, StaticParameterTable,
};
use impact_lib::{
    AggregatedImpactNode, ChildNode, ConcurrencyController, HostAttributionNode, ImpactNode,
    ResourceKind, TimeWindow,
};
use std::sync::Arc;
use tracing::info;

/// Shared collaborators for every node
struct Wiring {
    window: TimeWindow,
    controller: ConcurrencyController,
    static_lookup: Option<Arc<dyn StaticParameterLookup>>,
    node_source: Arc<dyn ResourceObservationSource>,
    pod_source: Arc<dyn ResourceObservationSource>,
}

/// Carbon intensity source: a forecast document wins over a fixed value
pub fn carbon_provider(config: &ExporterConfig) -> Option<Arc<dyn CarbonIntensityProvider>> {
    if let Some(variable) = &config.carbon_intensity_env {
        return Some(Arc::new(ForecastCarbonIntensity::new(variable)));
    }
    config
        .carbon_intensity
        .map(|value| Arc::new(FixedCarbonIntensity::new(value)) as Arc<dyn CarbonIntensityProvider>)
}

/// One pipeline per configured node, optionally wrapped in an aggregate
pub fn build(config: &ExporterConfig) -> Result<Vec<ChildNode>> {
    let static_lookup = match &config.static_params_path {
        Some(path) => {
            let table = StaticParameterTable::load(path)?;
            Some(Arc::new(table) as Arc<dyn StaticParameterLookup>)
        }
        None => None,
    };

    let wiring = Wiring {
        window: config.window()?,
        // One controller so every node shares the upstream's request budget
        controller: ConcurrencyController::new(config.engine.concurrency.clone()),
        static_lookup,
        node_source: Arc::new(OpenCostObservationSource::new(
            &config.opencost_url,
            AllocationScope::Node,
        )?),
        pod_source: Arc::new(OpenCostObservationSource::new(
            &config.opencost_url,
            AllocationScope::Pod,
        )?),
    };

    let mut pipelines = Vec::with_capacity(config.nodes.len());
    for definition in &config.nodes {
        pipelines.push(build_pipeline(config, &wiring, definition)?);
        info!(pipeline = %definition.name, kind = %definition.kind, "Pipeline configured");
    }

    match &config.aggregate {
        Some(name) => {
            let mut aggregate = AggregatedImpactNode::new(name, wiring.window.clone())
                .with_defaults(config.engine.defaults.clone())
                .with_policy(config.engine.attribution.partial_failure);
            for pipeline in pipelines {
                aggregate.push(pipeline);
            }
            Ok(vec![aggregate.into()])
        }
        None => Ok(pipelines),
    }
}

fn build_pipeline(
    config: &ExporterConfig,
    wiring: &Wiring,
    definition: &NodeDefinition,
) -> Result<ChildNode> {
    let Some(host_kind) = definition.kind.host_kind() else {
        let node = impact_node(
            config,
            wiring,
            &definition.name,
            definition.kind,
            definition,
            &definition.resources,
            Arc::clone(&wiring.node_source),
        )?;
        return Ok(node.into());
    };

    let hosts = impact_node(
        config,
        wiring,
        &format!("{}-hosts", definition.name),
        host_kind,
        definition,
        &definition.hosts,
        Arc::clone(&wiring.node_source),
    )?;
    let pods = impact_node(
        config,
        wiring,
        &definition.name,
        definition.kind,
        definition,
        &definition.resources,
        Arc::clone(&wiring.pod_source),
    )?;

    Ok(HostAttributionNode::new(&definition.name, hosts, pods)
        .with_defaults(config.engine.defaults.clone())
        .with_attribution(config.engine.attribution.clone())
        .into())
}

fn impact_node(
    config: &ExporterConfig,
    wiring: &Wiring,
    name: &str,
    kind: ResourceKind,
    definition: &NodeDefinition,
    resources: &[ResourceEntry],
    source: Arc<dyn ResourceObservationSource>,
) -> Result<ImpactNode> {
    let resources = resources.iter().map(|r| r.identity(kind)).collect();
    let mut builder = ImpactNode::builder(name, kind)
        .metadata(definition.metadata.clone())
        .window(wiring.window.clone())
        .provider(Arc::new(ConfiguredResourceProvider::new(resources)))
        .observation_source(source)
        .defaults(config.engine.defaults.clone())
        .controller(wiring.controller.clone());
    if let Some(lookup) = &wiring.static_lookup {
        builder = builder.static_lookup(Arc::clone(lookup));
    }
    Ok(builder.build()?)
}

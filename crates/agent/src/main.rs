//! SCI Exporter - Software Carbon Intensity metrics for cloud compute
//!
//! Periodically computes energy, embodied emissions and SCI for the
//! configured VMs, nodes and pods and exposes them to Prometheus.

use anyhow::Result;
use impact_lib::{ExportLoop, HealthRegistry, ImpactExporter, StructuredLogger};
use sci_exporter::{api, config::ExporterConfig, pipelines};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const EXPORTER_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting sci-exporter");

    // Load configuration
    let config = ExporterConfig::load()?;
    info!(
        instance = %config.instance,
        nodes = config.nodes.len(),
        interval_secs = config.export_interval_secs,
        "Exporter configured"
    );

    let health_registry = HealthRegistry::new();
    let exporter = ImpactExporter::new();
    let logger = StructuredLogger::new(&config.instance);

    let pipelines = pipelines::build(&config)?;
    logger.log_startup(EXPORTER_VERSION, pipelines.len());

    let mut builder = ExportLoop::builder()
        .exporter(exporter.clone())
        .health(health_registry.clone())
        .interval(config.export_interval())
        .default_carbon_intensity(config.engine.defaults.carbon_intensity)
        .instance(&config.instance);
    if let Some(provider) = pipelines::carbon_provider(&config) {
        builder = builder.carbon_provider(provider);
    }
    for pipeline in pipelines {
        builder = builder.pipeline(pipeline);
    }
    let export_loop = builder.build()?;

    // Start health and metrics server
    let app_state = Arc::new(api::AppState::new(health_registry, exporter));
    let api_handle = tokio::spawn(api::serve(config.api_port, app_state));

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let loop_handle = tokio::spawn(export_loop.run(shutdown_rx));

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    logger.log_shutdown("SIGINT received");
    info!("Shutting down");

    let _ = shutdown_tx.send(());
    if let Err(e) = loop_handle.await {
        error!(error = %e, "Export loop terminated abnormally");
    }
    api_handle.abort();

    Ok(())
}

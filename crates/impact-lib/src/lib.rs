//! Impact engine for cloud compute resources
//!
//! This crate provides:
//! - Energy, embodied-emission and SCI models
//! - Bounded-concurrency fetching with retry and backoff
//! - Composable impact nodes (per resource, attributed, aggregated)
//! - Collaborators for static tables, carbon intensity and OpenCost
//! - The periodic export loop, health checks and observability

pub mod concurrency;
pub mod config;
pub mod error;
pub mod export;
pub mod health;
pub mod model;
pub mod models;
pub mod node;
pub mod observability;
pub mod sources;
pub mod window;

pub use concurrency::ConcurrencyController;
pub use config::{AttributionConfig, ConcurrencyConfig, EngineConfig, ModelDefaults, PartialFailurePolicy};
pub use error::{ImpactError, Result};
pub use export::{ExportLoop, ExportLoopBuilder};
pub use health::{HealthRegistry, HealthResponse, PipelineHealth, PipelineStatus, ReadinessResponse};
pub use model::{ComputeServerModel, ImpactModel};
pub use models::*;
pub use node::{
    AggregatedImpactNode, AttributedImpactNode, ChildNode, HostAttributionNode, ImpactNode,
    NodeReport, NodeState,
};
pub use observability::{EngineMetrics, ImpactExporter, StructuredLogger};
pub use window::TimeWindow;

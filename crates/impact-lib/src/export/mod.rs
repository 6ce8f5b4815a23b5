//! Periodic computation and export of impact metrics
//!
//! The export loop drives every configured pipeline on a fixed interval,
//! pushes the resulting metric trees to the Prometheus gauges and records
//! per-pipeline health.

mod r#loop;

pub use r#loop::{CycleSummary, ExportConfig, ExportLoop, ExportLoopBuilder};

//! SCI exporter service: configuration, pipeline wiring and the HTTP API

pub mod api;
pub mod config;
pub mod pipelines;

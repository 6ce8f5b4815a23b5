//! Exporter configuration
//!
//! Values come from an optional TOML file (path in `SCI_CONFIG`, default
//! `sci-exporter.toml`) overlaid by `SCI_*` environment variables. Nested
//! keys use a double underscore, e.g. `SCI_ENGINE__CONCURRENCY__MAX_RETRIES`.

use anyhow::{bail, Context, Result};
use impact_lib::{EngineConfig, ResourceIdentity, ResourceKind, TimeWindow};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_CONFIG_PATH: &str = "sci-exporter.toml";

/// Exporter configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ExporterConfig {
    /// Label attached to structured log events
    #[serde(default = "default_instance")]
    pub instance: String,

    /// API server port for health/metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Seconds between export cycles
    #[serde(default = "default_export_interval")]
    pub export_interval_secs: u64,

    /// ISO-8601 observation window, e.g. `PT1H`
    #[serde(default = "default_timespan")]
    pub timespan: String,

    /// ISO-8601 sampling interval inside the window
    #[serde(default = "default_interval")]
    pub interval: String,

    /// Fixed grid carbon intensity in gCO2eq/kWh
    #[serde(default)]
    pub carbon_intensity: Option<f64>,

    /// Environment variable holding a carbon-aware forecast document
    #[serde(default)]
    pub carbon_intensity_env: Option<String>,

    /// OpenCost API base URL
    #[serde(default = "default_opencost_url")]
    pub opencost_url: String,

    /// JSON table of per-SKU static parameters
    #[serde(default)]
    pub static_params_path: Option<PathBuf>,

    /// When set, every pipeline is rolled up under one aggregate of this name
    #[serde(default)]
    pub aggregate: Option<String>,

    #[serde(default)]
    pub nodes: Vec<NodeDefinition>,

    #[serde(default)]
    pub engine: EngineConfig,
}

/// One impact pipeline
#[derive(Debug, Clone, Deserialize)]
pub struct NodeDefinition {
    pub name: String,
    pub kind: ResourceKind,
    #[serde(default)]
    pub resources: Vec<ResourceEntry>,
    /// Hosts carrying the pods of an attributed kind
    #[serde(default)]
    pub hosts: Vec<ResourceEntry>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// A statically configured resource
#[derive(Debug, Clone, Deserialize)]
pub struct ResourceEntry {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub sku: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl ResourceEntry {
    pub fn identity(&self, kind: ResourceKind) -> ResourceIdentity {
        let mut identity = ResourceIdentity::new(&self.id, kind);
        if let Some(name) = &self.name {
            identity.name = name.clone();
        }
        identity.sku = self.sku.clone();
        identity.host = self.host.clone();
        identity.namespace = self.namespace.clone();
        identity.labels = self.labels.clone();
        identity
    }
}

fn default_instance() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "sci-exporter".to_string())
}

fn default_api_port() -> u16 {
    8000
}

fn default_export_interval() -> u64 {
    300
}

fn default_timespan() -> String {
    "PT1H".to_string()
}

fn default_interval() -> String {
    "PT5M".to_string()
}

fn default_opencost_url() -> String {
    "http://opencost.opencost.svc:9003".to_string()
}

impl ExporterConfig {
    /// Load configuration from the config file and environment
    pub fn load() -> Result<Self> {
        let path = std::env::var("SCI_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(Path::new(&path))
    }

    /// Load from a specific file, still honoring environment overrides
    pub fn load_from(path: &Path) -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::from(path).required(false))
            .add_source(
                config::Environment::with_prefix("SCI")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()
            .with_context(|| format!("reading configuration from {}", path.display()))?;

        let config: ExporterConfig = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.export_interval_secs == 0 {
            bail!("export_interval_secs must be positive");
        }
        self.window()?;
        self.engine.concurrency.validate()?;
        for node in &self.nodes {
            if node.kind.is_attributed() && node.hosts.is_empty() {
                bail!("node '{}' of kind {} needs at least one host", node.name, node.kind);
            }
        }
        Ok(())
    }

    pub fn window(&self) -> Result<TimeWindow> {
        Ok(TimeWindow::new(&self.timespan, &self.interval)?)
    }

    pub fn export_interval(&self) -> Duration {
        Duration::from_secs(self.export_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(contents: &str) -> NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = tokio_test::assert_ok!(ExporterConfig::load_from(&dir.path().join("absent.toml")));

        assert_eq!(config.api_port, 8000);
        assert_eq!(config.export_interval_secs, 300);
        assert_eq!(config.window().unwrap().hours(), 1.0);
        assert!(config.nodes.is_empty());
        assert_eq!(config.engine.concurrency.max_concurrency, 5);
    }

    #[test]
    fn test_nodes_from_file() {
        let file = write_config(
            r#"
            api_port = 9100
            carbon_intensity = 250.0
            aggregate = "cluster"

            [engine.attribution]
            clamp_ratios = true

            [[nodes]]
            name = "pods"
            kind = "aks.pod"
            metadata = { team = "payments" }
            resources = [
                { id = "web-1", namespace = "shop", host = "aks-pool-0" },
            ]
            hosts = [
                { id = "aks-pool-0", sku = "Standard_D4s_v3" },
            ]
            "#,
        );

        let config = ExporterConfig::load_from(file.path()).unwrap();
        assert_eq!(config.api_port, 9100);
        assert_eq!(config.carbon_intensity, Some(250.0));
        assert_eq!(config.aggregate.as_deref(), Some("cluster"));
        assert!(config.engine.attribution.clamp_ratios);

        let node = &config.nodes[0];
        assert_eq!(node.kind, ResourceKind::AksPod);
        assert_eq!(node.metadata["team"], "payments");

        let pod = node.resources[0].identity(node.kind);
        assert_eq!(pod.name, "web-1");
        assert_eq!(pod.host.as_deref(), Some("aks-pool-0"));
        assert_eq!(pod.namespace.as_deref(), Some("shop"));
        assert_eq!(node.hosts[0].sku.as_deref(), Some("Standard_D4s_v3"));
    }

    #[test]
    fn test_pod_node_without_hosts_is_rejected() {
        let file = write_config(
            r#"
            [[nodes]]
            name = "pods"
            kind = "kubernetes.pod"
            resources = [{ id = "web-1" }]
            "#,
        );

        let err = ExporterConfig::load_from(file.path()).unwrap_err();
        assert!(err.to_string().contains("needs at least one host"));
    }

    #[test]
    fn test_unusable_attempt_timeout_is_rejected() {
        for timeout in ["0.0", "-5.0", "inf", "nan"] {
            let file = write_config(&format!(
                "[engine.concurrency]\nattempt_timeout_secs = {}\n",
                timeout
            ));
            let err = ExporterConfig::load_from(file.path()).unwrap_err();
            assert!(
                err.to_string().contains("attempt_timeout_secs"),
                "timeout {} gave {}",
                timeout,
                err
            );
        }
    }

    #[test]
    fn test_bad_window_is_rejected() {
        let file = write_config(r#"timespan = "one hour""#);
        assert!(ExporterConfig::load_from(file.path()).is_err());
    }
}

//! SKU-keyed static parameter table loaded from JSON

use crate::error::{ImpactError, Result};
use crate::models::StaticParameters;
use crate::node::StaticParameterLookup;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tracing::info;

/// Canonical form of a SKU for matching
///
/// `Standard_D2s_v3`, `D2s v3` and `d2s_v3` all map to `d2sv3`.
pub fn normalize_sku(sku: &str) -> String {
    let lower = sku.trim().to_lowercase();
    let without_tier = lower.strip_prefix("standard_").unwrap_or(&lower);
    without_tier
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '_' && *c != '-')
        .collect()
}

/// In-memory lookup over a JSON document of `{ "<sku>": { ... } }`
#[derive(Debug, Clone, Default)]
pub struct StaticParameterTable {
    entries: HashMap<String, StaticParameters>,
}

impl StaticParameterTable {
    pub fn from_json(json: &str) -> Result<Self> {
        let raw: BTreeMap<String, StaticParameters> =
            serde_json::from_str(json).map_err(|e| ImpactError::parse("static parameter table", e))?;
        Ok(Self::from_entries(raw))
    }

    pub fn from_entries(entries: impl IntoIterator<Item = (String, StaticParameters)>) -> Self {
        let entries = entries
            .into_iter()
            .map(|(sku, mut params)| {
                params.sku.get_or_insert_with(|| sku.clone());
                (normalize_sku(&sku), params)
            })
            .collect();
        Self { entries }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            ImpactError::PermanentConfig(format!("cannot read {}: {}", path.display(), e))
        })?;
        let table = Self::from_json(&json)?;
        info!(path = %path.display(), entries = table.len(), "static parameter table loaded");
        Ok(table)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, sku: &str) -> Option<&StaticParameters> {
        self.entries.get(&normalize_sku(sku))
    }
}

#[async_trait]
impl StaticParameterLookup for StaticParameterTable {
    async fn lookup(&self, sku: &str) -> Result<StaticParameters> {
        self.get(sku)
            .cloned()
            .ok_or_else(|| ImpactError::MissingStaticParam(sku.to_string()))
    }
}

//! Resource inventory.
//!
//! Maps resource identifiers to their canonical sources and, optionally, the
//! tables they are known to contain. [`ResourceRegistry`] is the
//! config-backed implementation; it serves both as the service's
//! [`ResourceInventory`] and as the materializer's
//! [`SourceLocator`](crate::materialize::SourceLocator).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::{Result, TabularError};
use crate::materialize::SourceLocator;

/// Resource name used for requests that carry no resource id.
pub const BUNDLED_RESOURCE: &str = "bundled";

/// Where a resource's canonical copy lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "kind", content = "location")]
pub enum ResourceLocation {
    /// A SQLite file on local or mounted storage
    File(PathBuf),
    /// A remote object that cannot be fetched yet
    Remote(String),
}

/// One inventory entry as exposed to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceInfo {
    /// Resource identifier
    pub id: String,
    /// Free-form description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Known tables, when the inventory supplies them
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tables: Option<Vec<String>>,
    /// Canonical location
    pub source: ResourceLocation,
}

/// Inventory of resources the service can serve.
pub trait ResourceInventory: Send + Sync {
    /// All registered resources, ordered by id.
    fn resources(&self) -> Vec<ResourceInfo>;

    /// Table names for `resource_id`, if the inventory knows them.
    fn tables(&self, resource_id: &str) -> Option<Vec<String>>;
}

/// Config-backed inventory and source locator.
#[derive(Debug, Clone, Default)]
pub struct ResourceRegistry {
    entries: BTreeMap<String, ResourceInfo>,
    fallback: Option<PathBuf>,
}

impl ResourceRegistry {
    /// Create an empty registry with an optional fallback source.
    pub fn new(fallback: Option<PathBuf>) -> Self {
        Self {
            entries: BTreeMap::new(),
            fallback,
        }
    }

    /// Build from the `[[resources]]` and `materialization.fallback_source`
    /// sections.
    pub fn from_config(config: &Config) -> Self {
        let mut registry = Self::new(config.materialization.fallback_source.clone());
        for resource in &config.resources {
            let source = match (&resource.path, &resource.remote) {
                (Some(path), _) => ResourceLocation::File(path.clone()),
                (None, Some(url)) => ResourceLocation::Remote(url.clone()),
                (None, None) => continue,
            };
            registry.register(ResourceInfo {
                id: resource.id.clone(),
                description: resource.description.clone(),
                tables: resource.tables.clone(),
                source,
            });
        }
        registry
    }

    /// Add or replace an entry.
    pub fn register(&mut self, info: ResourceInfo) {
        self.entries.insert(info.id.clone(), info);
    }

    /// Register a local file source.
    pub fn with_file(mut self, id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.register(ResourceInfo {
            id: id.into(),
            description: None,
            tables: None,
            source: ResourceLocation::File(path.into()),
        });
        self
    }

    /// Fallback source, if any.
    pub fn fallback(&self) -> Option<&Path> {
        self.fallback.as_deref()
    }

    fn existing_file(resource_id: &str, path: &Path) -> Result<PathBuf> {
        if path.is_file() {
            Ok(path.to_path_buf())
        } else {
            Err(TabularError::resource_unavailable(
                resource_id,
                format!("source {} not found", path.display()),
            ))
        }
    }
}

impl SourceLocator for ResourceRegistry {
    fn locate(&self, resource_id: &str) -> Result<PathBuf> {
        let id = resource_id.trim();

        if let Some(info) = self.entries.get(id) {
            return match &info.source {
                ResourceLocation::File(path) => Self::existing_file(id, path),
                ResourceLocation::Remote(_) => {
                    Err(TabularError::ResourceNotProvisioned(id.to_string()))
                }
            };
        }

        match &self.fallback {
            Some(path) => {
                let name = if id.is_empty() { BUNDLED_RESOURCE } else { id };
                Self::existing_file(name, path)
            }
            None => Err(TabularError::ResourceNotProvisioned(if id.is_empty() {
                BUNDLED_RESOURCE.to_string()
            } else {
                id.to_string()
            })),
        }
    }
}

impl ResourceInventory for ResourceRegistry {
    fn resources(&self) -> Vec<ResourceInfo> {
        self.entries.values().cloned().collect()
    }

    fn tables(&self, resource_id: &str) -> Option<Vec<String>> {
        self.entries
            .get(resource_id.trim())
            .and_then(|info| info.tables.clone())
    }
}

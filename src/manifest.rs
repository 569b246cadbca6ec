//! TOML manifests - script-backed definitions, resources and bulk dependencies
//!
//! ```toml
//! imports = ["core"]
//!
//! [[definition]]
//! type = "core.file"
//!
//! [[definition.action]]
//! name = "content"
//! phase = "sync"
//! verify = "test \"$(cat {{path}})\" = \"{{content}}\""
//! run = "printf '%s' \"{{content}}\" > {{path}}"
//! notify = ["changed"]
//!
//! [[resource]]
//! type = "file"
//! id = "motd"
//! after = "id=base"
//! attributes = { path = "/etc/motd", content = "hello" }
//!
//! [[dependency]]
//! from = "type=core.service"
//! to = "type=core.package"
//! ```

use crate::script;
use declarative::{
    AFTER_ATTR, BEFORE_ATTR, CreateOptions, Phase, Resource, ResourceManager, Selector,
    UniqueScope,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("could not read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid manifest {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("resource '{id}' names unknown parent '{parent}'")]
    UnknownParent { id: String, parent: String },

    #[error(transparent)]
    Engine(#[from] declarative::Error),
}

pub type Result<T> = std::result::Result<T, ManifestError>;

/// A script-backed resource type
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DefinitionSpec {
    #[serde(rename = "type")]
    pub fqname: String,
    #[serde(default)]
    pub unique: UniqueScope,
    #[serde(default)]
    pub defaults: BTreeMap<String, String>,
    #[serde(default, rename = "action")]
    pub actions: Vec<ActionSpec>,
    #[serde(default, rename = "handler")]
    pub handlers: Vec<HandlerSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ActionSpec {
    pub name: String,
    pub phase: Phase,
    /// Command template run on the host
    pub run: String,
    /// Command template; exit 0 means already in sync (sync phases only)
    #[serde(default)]
    pub verify: Option<String>,
    #[serde(default)]
    pub order: i32,
    /// Actions of the same resource that must have run first
    #[serde(default)]
    pub only_if_after: Vec<String>,
    /// Notifications raised when the command succeeds
    #[serde(default)]
    pub notify: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HandlerSpec {
    pub notification: String,
    pub run: String,
    #[serde(default = "default_true")]
    pub reorder: bool,
    #[serde(default = "default_true")]
    pub aggregate: bool,
    #[serde(default)]
    pub only_if_after: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceSpec {
    #[serde(rename = "type")]
    pub fqname: String,
    #[serde(default)]
    pub id: Option<String>,
    /// Uid of a resource declared earlier in the manifest
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub after: Option<String>,
    #[serde(default)]
    pub before: Option<String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

/// Every resource matching `from` depends on every resource matching `to`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DependencySpec {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
    /// Packages searched for unqualified resource types
    #[serde(default)]
    pub imports: Vec<String>,
    #[serde(default, rename = "definition")]
    pub definitions: Vec<DefinitionSpec>,
    #[serde(default, rename = "resource")]
    pub resources: Vec<ResourceSpec>,
    #[serde(default, rename = "dependency")]
    pub dependencies: Vec<DependencySpec>,
}

impl Manifest {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|source| ManifestError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content).map_err(|source| ManifestError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn parse(content: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Register the definitions and create the resources in declaration
    /// order, then add the bulk dependencies.
    pub fn apply(&self, manager: &ResourceManager) -> Result<Vec<Arc<Resource>>> {
        for spec in &self.definitions {
            manager.register_definition(script::definition(spec)?)?;
        }

        let mut created = Vec::with_capacity(self.resources.len());
        for spec in &self.resources {
            let mut options = CreateOptions::new();
            options.id = spec.id.clone();
            options.host = spec.host.clone();
            options.import_scope = self.imports.clone();
            options.attributes = spec.attributes.clone();
            if let Some(after) = &spec.after {
                options.attributes.insert(AFTER_ATTR.to_string(), after.clone());
            }
            if let Some(before) = &spec.before {
                options.attributes.insert(BEFORE_ATTR.to_string(), before.clone());
            }
            if let Some(parent) = &spec.parent {
                let resource =
                    manager
                        .resource(parent)?
                        .ok_or_else(|| ManifestError::UnknownParent {
                            id: spec.id.clone().unwrap_or_else(|| spec.fqname.clone()),
                            parent: parent.clone(),
                        })?;
                options.parent = Some(resource.handle());
            }
            created.push(manager.create_resource(spec.fqname.as_str(), options)?);
        }

        for dep in &self.dependencies {
            manager.add_bulk_dependency(Selector::query(&dep.from), Selector::query(&dep.to))?;
        }
        Ok(created)
    }
}

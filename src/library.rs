//! Definition library - `<root>/<package path>/<name>.toml`
//!
//! `acme.web.vhost` lives in `<root>/acme/web/vhost.toml`. A library file
//! holds `[[definition]]` tables in manifest format; unqualified types in it
//! take the package of the file.

use crate::manifest::DefinitionSpec;
use crate::script;
use anyhow::{Context, Result};
use declarative::{DefinitionLoader, FQName, ResourceDefinition};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct LibraryFile {
    #[serde(default, rename = "definition")]
    definitions: Vec<DefinitionSpec>,
}

#[derive(Debug, Clone)]
pub struct DirectoryLoader {
    root: PathBuf,
}

impl DirectoryLoader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, fqname: &FQName) -> Option<PathBuf> {
        let package = fqname.package()?;
        let mut path = self.root.clone();
        path.extend(package.split('.'));
        path.push(format!("{}.toml", fqname.name()));
        Some(path)
    }

    /// Every type with a file in the library, sorted
    pub fn available(&self) -> Vec<FQName> {
        let mut found: Vec<FQName> = WalkDir::new(&self.root)
            .min_depth(2)
            .into_iter()
            .filter_map(std::result::Result::ok)
            .filter(|e| e.file_type().is_file())
            .filter_map(|e| {
                let relative = e.path().strip_prefix(&self.root).ok()?;
                if relative.extension()? != "toml" {
                    return None;
                }
                let name = relative.file_stem()?.to_str()?;
                let package: Vec<&str> = relative
                    .parent()?
                    .components()
                    .map(|c| c.as_os_str().to_str())
                    .collect::<Option<_>>()?;
                Some(FQName::new(package.join("."), name))
            })
            .collect();
        found.sort();
        found
    }
}

impl DefinitionLoader for DirectoryLoader {
    fn load(&self, fqname: &FQName) -> Result<Vec<ResourceDefinition>> {
        let Some(path) = self.path_for(fqname) else {
            return Ok(Vec::new());
        };
        if !path.is_file() {
            log::debug!("No library file for {} at {}", fqname, path.display());
            return Ok(Vec::new());
        }

        log::info!("Loading {} from {}", fqname, path.display());
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Could not read {}", path.display()))?;
        let file: LibraryFile = toml::from_str(&content)
            .with_context(|| format!("Invalid library file {}", path.display()))?;

        file.definitions
            .into_iter()
            .map(|mut spec| {
                let name = FQName::parse(&spec.fqname);
                if !name.is_qualified()
                    && let Some(package) = fqname.package()
                {
                    spec.fqname = FQName::new(package, name.name()).to_string();
                }
                script::definition(&spec)
                    .with_context(|| format!("Invalid definition in {}", path.display()))
            })
            .collect()
    }
}

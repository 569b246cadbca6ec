// Engine commands
pub mod apply;
pub mod check;
pub mod plan;

use anyhow::Result;
use declarative::ResourceManager;

use crate::Context;
use crate::cli::SourceArgs;
use crate::library::DirectoryLoader;
use crate::manifest::{Manifest, ManifestError};
use crate::ui;

/// Build a manager holding the manifest's definitions and resources
pub(crate) fn load(ctx: &Context, source: &SourceArgs) -> Result<ResourceManager> {
    let mut manager = ResourceManager::new();
    if let Some(host) = &ctx.settings.host {
        manager = manager.with_default_host(host.as_str());
    }
    if let Some(dir) = library_dir(ctx, source) {
        log::debug!("Using definition library {}", dir.display());
        manager = manager.with_loader(DirectoryLoader::new(dir));
    }

    let manifest = Manifest::load(&source.manifest)?;
    if let Err(err) = manifest.apply(&manager) {
        if let ManifestError::Engine(engine) = &err {
            explain(engine);
        }
        return Err(err.into());
    }
    Ok(manager)
}

pub(crate) fn library_dir(ctx: &Context, source: &SourceArgs) -> Option<std::path::PathBuf> {
    source
        .library
        .clone()
        .or_else(|| ctx.settings.library_path())
}

/// Freeze the graph, explaining structural errors
pub(crate) fn prepare(manager: &ResourceManager) -> Result<()> {
    manager.prepare_for_execution().map_err(|err| {
        explain(&err);
        err.into()
    })
}

fn explain(err: &declarative::Error) {
    let category = err.category();
    ui::error(category.description());
    ui::dim(category.advice());
}

//! `converge check` - validate a manifest without touching the host

use anyhow::Result;

use crate::Context;
use crate::cli::SourceArgs;
use crate::library::DirectoryLoader;
use crate::ui;

pub fn run(ctx: &Context, args: SourceArgs) -> Result<()> {
    let manager = super::load(ctx, &args)?;
    super::prepare(&manager)?;

    let definitions = manager.definitions()?;
    let order = manager.execution_order()?;
    let dependencies: usize = order.iter().map(|r| r.dependencies().len()).sum();

    if !ctx.quiet {
        ui::header(&format!("Manifest {}", args.manifest.display()));
        ui::kv("definitions", &definitions.len().to_string());
        ui::kv("resources", &order.len().to_string());
        ui::kv("dependencies", &dependencies.to_string());
        if let Some(dir) = super::library_dir(ctx, &args) {
            let available = DirectoryLoader::new(&dir).available();
            ui::kv(
                "library",
                &format!("{} ({} types)", dir.display(), available.len()),
            );
            if ctx.verbose > 0 {
                for fqname in &available {
                    ui::dim(&fqname.to_string());
                }
            }
        }
        println!();
    }
    manager.close()?;

    ui::success("Manifest is valid");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use std::fs;
    use tempfile::TempDir;

    fn ctx() -> Context {
        Context {
            verbose: 0,
            quiet: true,
            settings: Settings::default(),
        }
    }

    #[test]
    fn test_check_detects_cycles() {
        let dir = TempDir::new().unwrap();
        let manifest = dir.path().join("site.toml");
        fs::write(
            &manifest,
            r#"
[[definition]]
type = "pkg.node"

[[resource]]
type = "pkg.node"
id = "a"
after = "id=b"

[[resource]]
type = "pkg.node"
id = "b"
after = "id=a"
"#,
        )
        .unwrap();

        let args = SourceArgs {
            manifest: manifest.clone(),
            library: None,
        };
        assert!(run(&ctx(), args).is_err());

        fs::write(
            &manifest,
            "[[definition]]\ntype = \"pkg.node\"\n\n[[resource]]\ntype = \"pkg.node\"\n",
        )
        .unwrap();
        let args = SourceArgs {
            manifest,
            library: None,
        };
        run(&ctx(), args).unwrap();
    }

    #[test]
    fn test_check_resolves_types_from_library() {
        let dir = TempDir::new().unwrap();
        let lib = dir.path().join("lib");
        fs::create_dir_all(lib.join("acme")).unwrap();
        fs::write(lib.join("acme").join("site.toml"), "[[definition]]\ntype = \"site\"\n").unwrap();
        let manifest = dir.path().join("site.toml");
        fs::write(&manifest, "[[resource]]\ntype = \"acme.site\"\n").unwrap();

        let args = SourceArgs {
            manifest: manifest.clone(),
            library: None,
        };
        assert!(run(&ctx(), args).is_err());

        let args = SourceArgs {
            manifest,
            library: Some(lib),
        };
        run(&ctx(), args).unwrap();
    }
}

//! `converge apply` - run every resource of a manifest through its lifecycle

use anyhow::{Context as AnyhowContext, Result};
use chrono::{DateTime, Utc};
use colored::Colorize;
use declarative::{DEFAULT_HOST, ExecuteOptions, ExecutionReport};
use serde::Serialize;
use std::fs;
use std::path::Path;
use std::time::{Duration, Instant};

use crate::Context;
use crate::cli::ApplyArgs;
use crate::host::LocalHost;
use crate::progress::PassProgress;
use crate::ui;

/// JSON report written by `--report`
#[derive(Debug, Serialize)]
struct RunReport<'a> {
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    host: &'a str,
    success: bool,
    #[serde(flatten)]
    report: &'a ExecutionReport,
}

pub fn run(ctx: &Context, args: ApplyArgs) -> Result<()> {
    let manager = super::load(ctx, &args.source)?;
    super::prepare(&manager)?;

    let order = manager.execution_order()?;
    if order.is_empty() {
        ui::info("Nothing to converge");
        return Ok(());
    }

    if !ctx.quiet {
        ui::header(&format!("Converging {} resources", order.len()));
        for (i, resource) in order.iter().enumerate() {
            let label = format!("{} {}", resource.uid(), format!("({})", resource.fqname()).dimmed());
            ui::step(i + 1, order.len(), &label);
        }
        println!();
    }

    if !args.yes && !confirm_proceed()? {
        ui::warn("Aborted");
        return Ok(());
    }

    let options = execute_options(ctx, &args);
    let host_name = ctx.settings.host.as_deref().unwrap_or(DEFAULT_HOST);
    let host = LocalHost::new(host_name);

    let started_at = Utc::now();
    let report = if ctx.quiet {
        manager.execute(&host, &options)?
    } else {
        manager.execute_with(&host, &options, &mut PassProgress::new())?
    };
    let finished_at = Utc::now();

    if let Some(path) = &args.report {
        let run = RunReport {
            started_at,
            finished_at,
            host: host_name,
            success: report.is_success(),
            report: &report,
        };
        write_report(path, &run)?;
        ui::dim(&format!("Report written to {}", path.display()));
    }

    if !ctx.quiet {
        ui::print_report(&report, ctx.verbose > 0);
    }
    manager.close()?;

    if report.cancelled {
        anyhow::bail!("Run stopped before completion");
    }
    if !report.is_success() {
        anyhow::bail!("{} resource(s) did not converge", report.failures().count());
    }
    if !ctx.quiet {
        ui::success("Host converged");
    }
    Ok(())
}

/// Flags win over settings; at least one job
fn execute_options(ctx: &Context, args: &ApplyArgs) -> ExecuteOptions {
    let jobs = args.jobs.or(ctx.settings.jobs).unwrap_or(1).max(1);
    let timeout = args.timeout.or(ctx.settings.timeout);
    ExecuteOptions {
        jobs,
        deadline: timeout.map(|secs| Instant::now() + Duration::from_secs(secs)),
        ..Default::default()
    }
}

fn write_report(path: &Path, run: &RunReport<'_>) -> Result<()> {
    let content = serde_json::to_string_pretty(run)?;
    fs::write(path, content).with_context(|| format!("Could not write {}", path.display()))
}

/// Confirm with user
fn confirm_proceed() -> Result<bool> {
    use dialoguer::Confirm;

    let confirmed = Confirm::new()
        .with_prompt("Continue?")
        .default(true)
        .interact()?;

    Ok(confirmed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::SourceArgs;
    use crate::config::Settings;
    use tempfile::TempDir;

    fn ctx(settings: Settings) -> Context {
        Context {
            verbose: 0,
            quiet: true,
            settings,
        }
    }

    fn args(manifest: &Path, report: Option<&Path>) -> ApplyArgs {
        ApplyArgs {
            source: SourceArgs {
                manifest: manifest.to_path_buf(),
                library: None,
            },
            jobs: None,
            timeout: None,
            yes: true,
            report: report.map(Path::to_path_buf),
        }
    }

    #[test]
    fn test_flags_override_settings() {
        let settings = Settings {
            jobs: Some(8),
            timeout: Some(60),
            ..Default::default()
        };
        let mut apply = args(Path::new("site.toml"), None);
        let opts = execute_options(&ctx(settings.clone()), &apply);
        assert_eq!(opts.jobs, 8);
        assert!(opts.deadline.is_some());

        apply.jobs = Some(0);
        assert_eq!(execute_options(&ctx(settings), &apply).jobs, 1);
        assert!(execute_options(&ctx(Settings::default()), &apply).deadline.is_none());
    }

    #[test]
    fn test_apply_writes_report() {
        let dir = TempDir::new().unwrap();
        let manifest = dir.path().join("site.toml");
        let report = dir.path().join("report.json");
        fs::write(
            &manifest,
            r#"
[[definition]]
type = "core.exec"

[[definition.action]]
name = "run"
phase = "execute"
run = "true"

[[resource]]
type = "core.exec"
id = "noop"
"#,
        )
        .unwrap();

        run(&ctx(Settings::default()), args(&manifest, Some(&report))).unwrap();

        let json: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&report).unwrap()).unwrap();
        assert_eq!(json["success"], true);
        assert_eq!(json["host"], "localhost");
        assert_eq!(json["outcomes"][0]["uid"], "noop");
        assert_eq!(json["outcomes"][0]["actions_run"][0], "run");
        assert!(json["started_at"].is_string());
    }

    #[test]
    fn test_apply_fails_when_a_resource_fails() {
        let dir = TempDir::new().unwrap();
        let manifest = dir.path().join("site.toml");
        fs::write(
            &manifest,
            r#"
[[definition]]
type = "core.exec"

[[definition.action]]
name = "run"
phase = "execute"
run = "exit 1"

[[resource]]
type = "core.exec"
"#,
        )
        .unwrap();

        let err = run(&ctx(Settings::default()), args(&manifest, None)).unwrap_err();
        assert!(err.to_string().contains("did not converge"));
    }
}

use clap::{Args, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "converge")]
#[command(version)]
#[command(about = "Converge a host toward the state declared in a manifest", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Settings file (default: ~/.config/converge/config.toml)
    #[arg(long, global = true, env = "CONVERGE_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run every resource of a manifest through its lifecycle
    Apply(ApplyArgs),

    /// Show the execution order without running anything
    Plan(PlanArgs),

    /// Validate a manifest: definitions, dependencies, cycles
    Check(SourceArgs),

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

/// Where resources and definitions come from
#[derive(Args)]
pub struct SourceArgs {
    /// Manifest file
    pub manifest: PathBuf,

    /// Definition library directory (`<dir>/<package>/<name>.toml`)
    #[arg(short = 'L', long, env = "CONVERGE_LIBRARY")]
    pub library: Option<PathBuf>,
}

#[derive(Args)]
pub struct ApplyArgs {
    #[command(flatten)]
    pub source: SourceArgs,

    /// Number of parallel jobs within a phase
    #[arg(short, long, env = "CONVERGE_JOBS")]
    pub jobs: Option<usize>,

    /// Stop starting new work after this many seconds
    #[arg(short, long)]
    pub timeout: Option<u64>,

    /// Skip confirmation prompt
    #[arg(short, long)]
    pub yes: bool,

    /// Write a JSON run report to this file
    #[arg(long)]
    pub report: Option<PathBuf>,
}

#[derive(Args)]
pub struct PlanArgs {
    #[command(flatten)]
    pub source: SourceArgs,

    /// Print the plan as JSON
    #[arg(long)]
    pub json: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_apply() {
        let cli = Cli::try_parse_from([
            "converge", "-vv", "apply", "site.toml", "--jobs", "4", "--yes", "-L", "lib",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Command::Apply(args) => {
                assert_eq!(args.source.manifest, PathBuf::from("site.toml"));
                assert_eq!(args.source.library, Some(PathBuf::from("lib")));
                assert_eq!(args.jobs, Some(4));
                assert!(args.yes);
                assert!(args.timeout.is_none());
            }
            _ => panic!("expected apply"),
        }
    }
}

use colored::{ColoredString, Colorize};
use declarative::{ExecutionReport, FailureKind, State};

/// Print an info message
pub fn info(msg: &str) {
    println!("{} {}", "ℹ".blue(), msg);
}

/// Print a success message
pub fn success(msg: &str) {
    println!("{} {}", "✓".green(), msg);
}

/// Print a warning message
pub fn warn(msg: &str) {
    println!("{} {}", "⚠".yellow(), msg);
}

/// Print an error message
pub fn error(msg: &str) {
    eprintln!("{} {}", "✗".red(), msg);
}

/// Print a dim/muted message
pub fn dim(msg: &str) {
    println!("  {}", msg.dimmed());
}

/// Print a header/title
pub fn header(title: &str) {
    println!();
    println!("{}", title.bold());
    println!("{}", "─".repeat(title.chars().count()).dimmed());
}

/// Print a key-value pair
pub fn kv(key: &str, value: &str) {
    println!("  {}: {}", key.dimmed(), value);
}

/// Print a step indicator
pub fn step(num: usize, total: usize, msg: &str) {
    println!("{} {}", format!("[{num}/{total}]").blue().bold(), msg);
}

/// Symbol for a terminal resource state
pub fn state_symbol(state: &State) -> ColoredString {
    match state {
        State::Failed(failure) if failure.kind == FailureKind::Cancelled => "⊘".yellow(),
        State::Failed(_) => "✗".red(),
        State::Executed => "✓".green(),
        _ => "○".dimmed(),
    }
}

/// Print per-resource outcomes and the summary line of a run
pub fn print_report(report: &ExecutionReport, verbose: bool) {
    header("Results");
    for outcome in &report.outcomes {
        let shown = verbose || outcome.state.is_failed();
        if !shown {
            continue;
        }
        let actions = if outcome.actions_run.is_empty() {
            "no changes".to_string()
        } else {
            outcome.actions_run.join(", ")
        };
        println!(
            "  {} {} {}",
            state_symbol(&outcome.state),
            outcome.uid,
            format!("({})", outcome.fqname).dimmed()
        );
        match outcome.state.failure() {
            Some(failure) => dim(&failure.to_string()),
            None => dim(&actions),
        }
    }
    for failure in &report.cleanup_failures {
        warn(&format!(
            "cleanup '{}' of {} failed: {}",
            failure.action, failure.uid, failure.message
        ));
    }

    let summary = report.summary();
    println!();
    if report.is_success() {
        println!(
            "  {} Converged {} resources",
            "✓".green().bold(),
            summary.executed
        );
    } else {
        println!("  {} Converged with errors", "⚠".yellow().bold());
        if summary.failed > 0 {
            println!("    • {} {} failed", summary.failed, "resources".red());
        }
        if summary.cancelled > 0 {
            println!("    • {} resources cancelled", summary.cancelled);
        }
    }
    if summary.cleanup_failed > 0 {
        println!("    • {} cleanup actions failed", summary.cleanup_failed);
    }
}

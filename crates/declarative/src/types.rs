//! Core types for declarative resource management

use serde::{Deserialize, Serialize};
use std::fmt;
use std::process::Output;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

/// Lifecycle phase an action is bound to.
///
/// Variants are declared in execution order; `Ord` follows that order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    Prepare,
    Sync,
    PostChildrenSync,
    Execute,
    PostChildrenExecute,
    Cleanup,
}

impl Phase {
    /// All phases in execution order
    pub const ALL: [Phase; 6] = [
        Phase::Prepare,
        Phase::Sync,
        Phase::PostChildrenSync,
        Phase::Execute,
        Phase::PostChildrenExecute,
        Phase::Cleanup,
    ];

    /// Whether actions of this phase are verify/sync pairs
    pub fn is_sync(&self) -> bool {
        matches!(self, Self::Sync | Self::PostChildrenSync)
    }

    /// Whether this phase runs only after the resource's children
    pub fn is_post_children(&self) -> bool {
        matches!(self, Self::PostChildrenSync | Self::PostChildrenExecute)
    }

    /// Whether actions in this phase may emit notifications
    pub fn can_notify(&self) -> bool {
        matches!(
            self,
            Self::Sync | Self::PostChildrenSync | Self::Execute | Self::PostChildrenExecute
        )
    }

    /// The post-children variant of a sync or execute phase
    pub fn post_children(self) -> Self {
        match self {
            Self::Sync => Self::PostChildrenSync,
            Self::Execute => Self::PostChildrenExecute,
            other => other,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Phase::Prepare => "prepare",
            Phase::Sync => "sync",
            Phase::PostChildrenSync => "post-children-sync",
            Phase::Execute => "execute",
            Phase::PostChildrenExecute => "post-children-execute",
            Phase::Cleanup => "cleanup",
        };
        f.write_str(label)
    }
}

/// How many live instances of a resource type may exist
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UniqueScope {
    /// No constraint
    #[default]
    None,
    /// At most one per host
    Host,
    /// At most one per manager
    Global,
}

/// Why a resource ended up failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureKind {
    /// An action body (or its verify) returned an error
    Action { phase: Phase, action: String },
    /// A notification handler returned an error
    Handler { notification: String },
    /// A resource this one depends on failed
    Dependency { uid: String },
    /// A dependency failed in a later pass, after this resource executed
    DependencyAfterRun { uid: String },
    /// The run was cancelled before the resource completed
    Cancelled,
    /// Marked failed by the caller before execution
    External,
}

/// A per-resource failure with its rendered cause
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,
}

impl Failure {
    pub fn action(phase: Phase, action: &str, err: &anyhow::Error) -> Self {
        Self {
            kind: FailureKind::Action {
                phase,
                action: action.to_string(),
            },
            message: format!("{err:#}"),
        }
    }

    pub fn handler(notification: &str, err: &anyhow::Error) -> Self {
        Self {
            kind: FailureKind::Handler {
                notification: notification.to_string(),
            },
            message: format!("{err:#}"),
        }
    }

    pub fn dependency(uid: &str) -> Self {
        Self {
            kind: FailureKind::Dependency {
                uid: uid.to_string(),
            },
            message: format!("dependency {uid} failed"),
        }
    }

    pub fn dependency_after_run(uid: &str) -> Self {
        Self {
            kind: FailureKind::DependencyAfterRun {
                uid: uid.to_string(),
            },
            message: format!("dependency {uid} failed after this resource had executed"),
        }
    }

    pub fn cancelled() -> Self {
        Self {
            kind: FailureKind::Cancelled,
            message: "execution cancelled".to_string(),
        }
    }

    pub fn external(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::External,
            message: message.into(),
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            FailureKind::Action { phase, action } => {
                write!(f, "{phase} action '{action}' failed: {}", self.message)
            }
            FailureKind::Handler { notification } => {
                write!(f, "handler for '{notification}' failed: {}", self.message)
            }
            _ => f.write_str(&self.message),
        }
    }
}

/// Lifecycle state of a resource
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "failure", rename_all = "snake_case")]
pub enum State {
    #[default]
    Created,
    Prepared,
    Synced,
    Executed,
    Failed(Failure),
}

impl State {
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }

    pub fn failure(&self) -> Option<&Failure> {
        match self {
            Self::Failed(failure) => Some(failure),
            _ => None,
        }
    }

    /// Short label for display
    pub fn label(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Prepared => "prepared",
            Self::Synced => "synced",
            Self::Executed => "executed",
            Self::Failed(_) => "failed",
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed(failure) => write!(f, "failed ({failure})"),
            other => f.write_str(other.label()),
        }
    }
}

/// When a host should log the output of a command
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogPolicy {
    Always,
    #[default]
    OnError,
    Never,
}

/// Output of a host command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub output: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

impl From<Output> for CommandOutput {
    fn from(output: Output) -> Self {
        let mut text = String::from_utf8_lossy(&output.stdout).to_string();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        Self {
            exit_code: output.status.code().unwrap_or(-1),
            output: text,
        }
    }
}

/// Cooperative cancellation shared between the caller and the executor
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Options for execution
#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    /// Worker threads used within a phase (1 = sequential)
    pub jobs: usize,
    /// Stop starting new work after this instant
    pub deadline: Option<Instant>,
    /// Stop starting new work once cancelled
    pub cancel: CancelFlag,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            jobs: 1,
            deadline: None,
            cancel: CancelFlag::new(),
        }
    }
}

impl ExecuteOptions {
    /// Whether the run should stop starting new work
    pub fn should_stop(&self) -> bool {
        self.cancel.is_cancelled() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }
}

/// Terminal outcome of one resource
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceOutcome {
    pub uid: String,
    pub fqname: String,
    pub state: State,
    /// Names of actions whose body ran, in order
    pub actions_run: Vec<String>,
    pub cleaned: bool,
}

/// A cleanup action that failed (logged, never propagated)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupFailure {
    pub uid: String,
    pub action: String,
    pub message: String,
}

/// Result of a run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionReport {
    /// Outcomes in execution order
    pub outcomes: Vec<ResourceOutcome>,
    pub cleanup_failures: Vec<CleanupFailure>,
    pub cancelled: bool,
}

impl ExecutionReport {
    /// True iff no resource ended failed
    pub fn is_success(&self) -> bool {
        !self.outcomes.iter().any(|o| o.state.is_failed())
    }

    /// Failed resources with their causes
    pub fn failures(&self) -> impl Iterator<Item = (&str, &Failure)> {
        self.outcomes
            .iter()
            .filter_map(|o| o.state.failure().map(|f| (o.uid.as_str(), f)))
    }

    pub fn outcome(&self, uid: &str) -> Option<&ResourceOutcome> {
        self.outcomes.iter().find(|o| o.uid == uid)
    }

    pub fn summary(&self) -> ExecuteSummary {
        let mut summary = ExecuteSummary::default();
        for outcome in &self.outcomes {
            summary.add_state(&outcome.state);
        }
        summary.cleanup_failed = self.cleanup_failures.len();
        summary
    }
}

/// Summary of execution results
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteSummary {
    pub executed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub cleanup_failed: usize,
}

impl ExecuteSummary {
    /// Check if execution was fully successful (no failures)
    pub fn is_success(&self) -> bool {
        self.failed == 0 && self.cancelled == 0
    }

    /// Total number of resources processed
    pub fn total(&self) -> usize {
        self.executed + self.failed + self.cancelled
    }

    fn add_state(&mut self, state: &State) {
        match state {
            State::Failed(Failure {
                kind: FailureKind::Cancelled,
                ..
            }) => self.cancelled += 1,
            State::Failed(_) => self.failed += 1,
            _ => self.executed += 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_order_is_execution_order() {
        let mut phases = Phase::ALL.to_vec();
        phases.reverse();
        phases.sort();
        assert_eq!(phases, Phase::ALL.to_vec());
        assert!(Phase::Sync < Phase::Execute);
        assert_eq!(Phase::Sync.post_children(), Phase::PostChildrenSync);
        assert_eq!(Phase::Prepare.post_children(), Phase::Prepare);
    }

    #[test]
    fn test_report_success_and_summary() {
        let mut report = ExecutionReport::default();
        report.outcomes.push(ResourceOutcome {
            uid: "a".into(),
            fqname: "pkg.a".into(),
            state: State::Executed,
            actions_run: vec![],
            cleaned: true,
        });
        assert!(report.is_success());

        report.outcomes.push(ResourceOutcome {
            uid: "b".into(),
            fqname: "pkg.b".into(),
            state: State::Failed(Failure::dependency("a")),
            actions_run: vec![],
            cleaned: true,
        });
        assert!(!report.is_success());
        assert_eq!(report.failures().count(), 1);
        let summary = report.summary();
        assert_eq!(summary.executed, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.total(), 2);
    }

    #[test]
    fn test_deadline_stops_run() {
        let opts = ExecuteOptions {
            deadline: Some(Instant::now()),
            ..Default::default()
        };
        assert!(opts.should_stop());
        let opts = ExecuteOptions::default();
        assert!(!opts.should_stop());
        opts.cancel.cancel();
        assert!(opts.should_stop());
    }
}

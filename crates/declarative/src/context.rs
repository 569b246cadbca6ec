//! Action context and provider traits
//!
//! These traits allow the declarative crate to be used without
//! depending on a specific host transport, UI framework, etc.

use crate::resource::Resource;
use crate::types::{CommandOutput, LogPolicy, Phase, State};
use anyhow::Result;

/// The only capability actions have on the target machine
///
/// Implement this trait for local execution, SSH, containers, ...
/// Implementations may block for the duration of the command.
pub trait Host: Send + Sync {
    /// Name of the host (used for HOST-scoped uniqueness and logging)
    fn name(&self) -> &str;

    /// Run a command on the host
    fn exec(&self, command: &str, logging: LogPolicy) -> Result<CommandOutput>;

    /// Run a command and return just success/failure
    fn exec_status(&self, command: &str) -> Result<bool> {
        Ok(self.exec(command, LogPolicy::Never)?.success())
    }

    /// Run a command and capture its output, failing on a non-zero exit
    fn exec_capture(&self, command: &str) -> Result<String> {
        let output = self.exec(command, LogPolicy::OnError)?;
        if !output.success() {
            anyhow::bail!(
                "Command failed with exit code {}: {}",
                output.exit_code,
                output.output.trim()
            );
        }
        Ok(output.output)
    }
}

/// Host that refuses every command
pub struct NoHost;

impl Host for NoHost {
    fn name(&self) -> &str {
        "none"
    }

    fn exec(&self, command: &str, _logging: LogPolicy) -> Result<CommandOutput> {
        anyhow::bail!("No host available to run: {command}")
    }
}

/// Progress callback for execution operations
///
/// Implement this trait to receive progress updates during execution.
pub trait ProgressCallback: Send {
    /// Called when a phase pass starts over `count` resources
    fn on_phase_start(&mut self, phase: Phase, count: usize);

    /// Called before a resource runs a phase
    fn on_resource_start(&mut self, uid: &str, phase: Phase);

    /// Called when a resource finished a phase
    fn on_resource_complete(&mut self, uid: &str, phase: Phase, state: &State);

    /// Called when a phase pass completes
    fn on_phase_complete(&mut self, phase: Phase);
}

/// No-op progress callback
pub struct NoProgress;

impl ProgressCallback for NoProgress {
    fn on_phase_start(&mut self, _phase: Phase, _count: usize) {}
    fn on_resource_start(&mut self, _uid: &str, _phase: Phase) {}
    fn on_resource_complete(&mut self, _uid: &str, _phase: Phase, _state: &State) {}
    fn on_phase_complete(&mut self, _phase: Phase) {}
}

/// Context passed to action bodies, verify predicates and handlers
pub struct ActionContext<'a> {
    resource: &'a Resource,
    host: &'a dyn Host,
    phase: Phase,
    emitted: Vec<String>,
}

impl<'a> ActionContext<'a> {
    pub(crate) fn new(resource: &'a Resource, host: &'a dyn Host, phase: Phase) -> Self {
        Self {
            resource,
            host,
            phase,
            emitted: Vec::new(),
        }
    }

    /// The resource the action runs for
    pub fn resource(&self) -> &Resource {
        self.resource
    }

    pub fn uid(&self) -> &str {
        self.resource.uid()
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn host(&self) -> &dyn Host {
        self.host
    }

    /// Read an attribute of the resource
    pub fn get(&self, name: &str) -> Option<String> {
        self.resource.get(name)
    }

    /// Read an attribute that must be present
    pub fn require(&self, name: &str) -> Result<String> {
        self.resource.get(name).ok_or_else(|| {
            anyhow::anyhow!(
                "Resource {} is missing required attribute '{}'",
                self.resource.uid(),
                name
            )
        })
    }

    /// Write an attribute of the resource
    pub fn set(&self, name: &str, value: impl Into<String>) {
        self.resource.set(name, value);
    }

    /// Run a command on the host, logging output only on failure
    pub fn exec(&self, command: &str) -> Result<CommandOutput> {
        self.host.exec(command, LogPolicy::OnError)
    }

    /// Raise a notification; delivered once the current phase completes
    pub fn notify(&mut self, name: impl Into<String>) {
        let name = name.into();
        if self.phase.can_notify() {
            self.emitted.push(name);
        } else {
            log::warn!(
                "{}: notification '{}' raised during {} is dropped",
                self.resource.uid(),
                name,
                self.phase
            );
        }
    }

    pub(crate) fn into_emitted(self) -> Vec<String> {
        self.emitted
    }
}

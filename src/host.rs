//! Local host - runs action commands through `sh -c`

use anyhow::{Context, Result};
use declarative::{CommandOutput, Host, LogPolicy};
use std::process::{Command, Stdio};

pub struct LocalHost {
    name: String,
}

impl LocalHost {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Host for LocalHost {
    fn name(&self) -> &str {
        &self.name
    }

    fn exec(&self, command: &str, logging: LogPolicy) -> Result<CommandOutput> {
        log::debug!("[{}] $ {}", self.name, command);
        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .output()
            .with_context(|| format!("Failed to execute: {command}"))?;
        let output = CommandOutput::from(output);

        let show = match logging {
            LogPolicy::Always => true,
            LogPolicy::OnError => !output.success(),
            LogPolicy::Never => false,
        };
        if show && !output.output.trim().is_empty() {
            if output.success() {
                log::info!("[{}] {}", self.name, output.output.trim());
            } else {
                log::warn!(
                    "[{}] exit {}: {}",
                    self.name,
                    output.exit_code,
                    output.output.trim()
                );
            }
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exec_captures_output_and_exit_code() {
        let host = LocalHost::new("localhost");
        let out = host.exec("echo hello", LogPolicy::Never).unwrap();
        assert!(out.success());
        assert_eq!(out.output.trim(), "hello");

        let out = host.exec("echo oops >&2; exit 3", LogPolicy::Never).unwrap();
        assert_eq!(out.exit_code, 3);
        assert_eq!(out.output.trim(), "oops");
    }

    #[test]
    fn test_exec_capture_fails_on_nonzero_exit() {
        let host = LocalHost::new("localhost");
        assert!(host.exec_status("true").unwrap());
        assert!(!host.exec_status("false").unwrap());
        assert!(host.exec_capture("exit 1").is_err());
    }
}

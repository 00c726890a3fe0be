//! Run configuration for a batch execution.
//!
//! A [`Spec`] describes one local run; a [`JumpSpec`] extends it with the
//! fan-out settings for running through jump hosts. Both are immutable for
//! the duration of a run and must pass `validate()` before the engine
//! spawns anything.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Token in an argv element that is replaced with the current target.
pub const TARGET_TOKEN: &str = "{.T}";

/// Token in the jump command template that is replaced with the hop address.
pub const HOP_TOKEN: &str = "{.J}";

/// Remote-shell template used to reach jump hosts unless overridden.
pub const DEFAULT_JUMP_COMMAND: &str = "ssh -A -oBatchMode=yes -oConnectTimeout=10 {.J}";

/// A required setting was missing or non-positive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SpecError {
    #[error("command not set")]
    NoCommand,
    #[error("timeout must be greater than zero")]
    NoTimeout,
    #[error("parallel must be greater than zero")]
    NoParallel,
    #[error("stdout_bytes must be greater than zero")]
    NoStdoutBytes,
    #[error("stderr_bytes must be greater than zero")]
    NoStderrBytes,
    #[error("jump command not set")]
    NoJumpCommand,
    #[error("no jump hosts available")]
    NoJumpHosts,
}

/// Specification for a batch execution.
///
/// `command` is executed verbatim; every element of `args` has occurrences
/// of [`TARGET_TOKEN`] replaced with the current target first.
#[derive(Debug, Clone, Default)]
pub struct Spec {
    pub command: String,
    pub args: Vec<String>,
    pub timeout: Duration,
    pub parallel: usize,
    pub stdout_bytes: usize,
    pub stderr_bytes: usize,
}

impl Spec {
    /// Check that every required setting is present and positive.
    pub fn validate(&self) -> Result<(), SpecError> {
        if self.command.is_empty() {
            Err(SpecError::NoCommand)
        } else if self.timeout.is_zero() {
            Err(SpecError::NoTimeout)
        } else if self.parallel == 0 {
            Err(SpecError::NoParallel)
        } else if self.stdout_bytes == 0 {
            Err(SpecError::NoStdoutBytes)
        } else if self.stderr_bytes == 0 {
            Err(SpecError::NoStderrBytes)
        } else {
            Ok(())
        }
    }
}

/// Specification for a batch execution relayed through jump hosts.
///
/// Each hop gets its own auth agent so that agent access never becomes the
/// bottleneck of a highly parallel run. When `jump_hosts_key_file` is set
/// the key is added to every agent before the remote shell starts.
#[derive(Debug, Clone)]
pub struct JumpSpec {
    pub spec: Spec,
    pub jump_command: String,
    pub jump_hosts: Vec<String>,
    pub jump_hosts_key_file: Option<PathBuf>,
}

impl Default for JumpSpec {
    fn default() -> Self {
        Self {
            spec: Spec::default(),
            jump_command: DEFAULT_JUMP_COMMAND.to_string(),
            jump_hosts: Vec::new(),
            jump_hosts_key_file: None,
        }
    }
}

impl JumpSpec {
    /// Check the inner spec plus the fan-out settings.
    pub fn validate(&self) -> Result<(), SpecError> {
        self.spec.validate()?;
        if self.jump_command.is_empty() {
            Err(SpecError::NoJumpCommand)
        } else if self.jump_hosts.is_empty() {
            Err(SpecError::NoJumpHosts)
        } else {
            Ok(())
        }
    }
}

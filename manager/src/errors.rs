//! Custom error types for the fleet supervisor
//!
//! Per-concern error enums, each implementing `std::error::Error` so they
//! convert into `anyhow::Error` at call boundaries via `?`.

use std::fmt;

/// Configuration error variants
#[derive(Debug)]
pub enum ConfigError {
    /// Failed to load configuration file
    LoadFailed { path: String, reason: String },

    /// Configuration parsing error
    ParseError { path: String, reason: String },

    /// A node referenced by name has no entry in the merged configuration
    MissingNode { node_name: String },
}

/// Classification of a node-CLI failure, per spec §4.3 / §7
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CliErrorKind {
    FailedRestRequest,
    AddressAlreadyInUse,
    Unknown,
}

/// Node CLI error, carrying the classification and raw process output
#[derive(Debug)]
pub struct CliError {
    pub message: String,
    pub kind: CliErrorKind,
    pub returncode: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CliError {
    pub fn classify(message: impl Into<String>, returncode: i32, stdout: String, stderr: String) -> Self {
        let kind = if stderr.contains("failed to make a REST request") {
            CliErrorKind::FailedRestRequest
        } else if stderr.contains("Address already in use") {
            CliErrorKind::AddressAlreadyInUse
        } else {
            CliErrorKind::Unknown
        };

        Self {
            message: message.into(),
            kind,
            returncode,
            stdout,
            stderr,
        }
    }
}

/// Process-supervisor RPC error variants
#[derive(Debug)]
pub enum SupervisorError {
    Transport { service: String, reason: String },
    ActionFailed { service: String, action: String },
    MalformedResponse { service: String, reason: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::LoadFailed { path, reason } => {
                write!(f, "failed to load config from '{}': {}", path, reason)
            }
            ConfigError::ParseError { path, reason } => {
                write!(f, "failed to parse config '{}': {}", path, reason)
            }
            ConfigError::MissingNode { node_name } => {
                write!(f, "no configuration found for node '{}'", node_name)
            }
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (exit={}, kind={:?}): {}",
            self.message, self.returncode, self.kind, self.stderr
        )
    }
}

impl fmt::Display for SupervisorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SupervisorError::Transport { service, reason } => {
                write!(f, "RPC transport failure for '{}': {}", service, reason)
            }
            SupervisorError::ActionFailed { service, action } => {
                write!(f, "supervisor refused '{}' on '{}'", action, service)
            }
            SupervisorError::MalformedResponse { service, reason } => {
                write!(f, "malformed RPC response for '{}': {}", service, reason)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
impl std::error::Error for CliError {}
impl std::error::Error for SupervisorError {}

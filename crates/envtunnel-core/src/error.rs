//! Error types for tunnel lifecycle operations

use std::time::Duration;
use thiserror::Error;

/// Errors reported by the Tunnel CLI boundary
#[derive(Debug, Error)]
pub enum CliError {
    /// The CLI reported that no tunnel exists for the key (the expected
    /// "not found yet" sentinel, not a failure)
    #[error("No tunnels found")]
    NotFound,

    #[error("Failed to start `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` exited with {status}: {output}")]
    CommandFailed {
        command: String,
        status: String,
        output: String,
    },

    /// The command did not finish in time and was killed
    #[error("`{command}` did not finish within {after:?}")]
    Timeout { command: String, after: Duration },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors reported by a lock store backend
#[derive(Debug, Clone, Error)]
pub enum LockStoreError {
    #[error("Lock store unavailable: {0}")]
    Backend(String),
}

/// Tunnel lifecycle errors
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Timed out waiting for lock on {key}")]
    LockTimeout { key: String },

    #[error("Tunnel setup for {key} did not report ready within {after:?}")]
    SetupTimeout { key: String, after: Duration },

    #[error("Tunnel CLI for {key} finished without reporting ready")]
    SetupIncomplete { key: String },

    #[error("Health check failed for tunnel {key}")]
    HealthCheckFailed { key: String },

    #[error("Service '{service}' is not available on {key}")]
    ServiceNotAvailable { key: String, service: String },

    #[error("Describe failed: {0}")]
    Describe(#[source] CliError),

    #[error("Tunnel CLI error: {0}")]
    Cli(#[source] CliError),

    #[error(transparent)]
    LockStore(#[from] LockStoreError),

    #[error("Failed to set up tunnel {key} after {attempts} attempt(s): {source}")]
    SetupFailed {
        key: String,
        attempts: u32,
        #[source]
        source: Box<TunnelError>,
    },

    #[error("Invalid tunnel key: {0}")]
    InvalidKey(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl TunnelError {
    /// Whether `open_tunnel` retries this error inside its own attempt loop
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TunnelError::LockTimeout { .. }
                | TunnelError::SetupTimeout { .. }
                | TunnelError::SetupIncomplete { .. }
                | TunnelError::HealthCheckFailed { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, TunnelError>;

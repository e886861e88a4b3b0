//! Tunnel identity

use crate::error::TunnelError;
use serde::{Deserialize, Serialize};
use std::fmt;

const LOCK_PREFIX: &str = "tunnel_lock:";
const ACTIVITY_PREFIX: &str = "tunnel_last_activity:";

/// Identity of one remote environment's tunnel: (project, environment)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TunnelKey {
    project_id: String,
    environment: String,
}

impl TunnelKey {
    /// Create a key, rejecting components that are unsafe to embed in
    /// lock keys or CLI arguments
    pub fn new(
        project_id: impl Into<String>,
        environment: impl Into<String>,
    ) -> Result<Self, TunnelError> {
        let project_id = project_id.into();
        let environment = environment.into();

        Self::validate_part("project", &project_id)?;
        Self::validate_part("environment", &environment)?;

        Ok(Self {
            project_id,
            environment,
        })
    }

    /// Alphanumeric, hyphens, underscores and dots only
    fn validate_part(what: &str, value: &str) -> Result<(), TunnelError> {
        if value.is_empty() {
            return Err(TunnelError::InvalidKey(format!("{} cannot be empty", what)));
        }
        if !value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        {
            return Err(TunnelError::InvalidKey(format!(
                "{} '{}' must contain only alphanumeric characters, hyphens, underscores and dots",
                what, value
            )));
        }
        Ok(())
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    /// Lock Store key guarding who may open or close this tunnel
    pub fn lock_key(&self) -> String {
        format!("{}{}", LOCK_PREFIX, self)
    }

    /// Advisory liveness marker refreshed on every successful lookup
    pub fn activity_key(&self) -> String {
        format!("{}{}", ACTIVITY_PREFIX, self)
    }
}

impl fmt::Display for TunnelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.project_id, self.environment)
    }
}

//! Manager configuration

use crate::error::TunnelError;
use crate::key::TunnelKey;
use crate::lock::lock_ttl_secs;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Tunnel CLI invocation templates
///
/// `{project}` and `{environment}` in any argument are replaced with the
/// tunnel key's parts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    pub program: String,
    pub open_args: Vec<String>,
    pub close_args: Vec<String>,
    pub describe_args: Vec<String>,
    /// Output fragments meaning "no tunnel exists for this key"
    pub not_found_markers: Vec<String>,
    /// Limit for one `close` or `describe` run; the process is killed after it
    #[serde(with = "duration_ms")]
    pub command_timeout: Duration,
}

impl Default for CliConfig {
    fn default() -> Self {
        let scoped = |command: &str| {
            vec![
                command.to_string(),
                "--project".to_string(),
                "{project}".to_string(),
                "--environment".to_string(),
                "{environment}".to_string(),
                "--yes".to_string(),
            ]
        };
        Self {
            program: "platform".to_string(),
            open_args: scoped("tunnel:open"),
            close_args: scoped("tunnel:close"),
            describe_args: scoped("tunnel:info"),
            not_found_markers: vec!["No tunnels found".to_string()],
            command_timeout: Duration::from_secs(8),
        }
    }
}

impl CliConfig {
    pub fn render(&self, args: &[String], key: &TunnelKey) -> Vec<String> {
        args.iter()
            .map(|arg| {
                arg.replace("{project}", key.project_id())
                    .replace("{environment}", key.environment())
            })
            .collect()
    }

    pub fn is_not_found(&self, stdout: &str, stderr: &str) -> bool {
        self.not_found_markers
            .iter()
            .any(|marker| stdout.contains(marker.as_str()) || stderr.contains(marker.as_str()))
    }
}

/// Lock Store timing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Acquire budget before opening
    #[serde(with = "duration_ms")]
    pub acquire_timeout: Duration,
    /// Fixed delay between conditional-set attempts
    #[serde(with = "duration_ms")]
    pub retry_delay: Duration,
    /// Added to the acquire timeout to form the entry's TTL
    #[serde(with = "duration_ms")]
    pub ttl_margin: Duration,
    /// Acquire budget before closing; zero means one attempt
    #[serde(with = "duration_ms")]
    pub close_timeout: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            acquire_timeout: Duration::from_secs(10),
            retry_delay: Duration::from_millis(250),
            ttl_margin: Duration::from_secs(50),
            close_timeout: Duration::ZERO,
        }
    }
}

/// Open operation timing and readiness detection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenerConfig {
    /// Safety timer for the ready marker
    #[serde(with = "duration_ms")]
    pub setup_timeout: Duration,
    /// Pause between the ready marker and the authoritative describe
    #[serde(with = "duration_ms")]
    pub settle_delay: Duration,
    /// Output fragments signalling that setup completed
    pub ready_markers: Vec<String>,
}

impl Default for OpenerConfig {
    fn default() -> Self {
        Self {
            setup_timeout: Duration::from_secs(30),
            settle_delay: Duration::from_millis(1_500),
            ready_markers: vec![
                "Logs are written to".to_string(),
                "All tunnels are open".to_string(),
            ],
        }
    }
}

impl OpenerConfig {
    pub fn is_ready_marker(&self, line: &str) -> bool {
        self.ready_markers
            .iter()
            .any(|marker| line.contains(marker.as_str()))
    }
}

/// Which service the front end probes, and how long it may take
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// `None` disables probing (records are assumed healthy)
    pub service: Option<String>,
    #[serde(with = "duration_ms")]
    pub timeout: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            service: Some("cache".to_string()),
            timeout: Duration::from_secs(2),
        }
    }
}

/// Tunnel manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Teardown after this long without a lookup
    #[serde(with = "duration_ms")]
    pub idle_timeout: Duration,
    pub max_attempts: u32,
    /// Linear backoff step between attempts
    #[serde(with = "duration_ms")]
    pub retry_backoff: Duration,
    /// How long to wait for a peer process that holds the lock
    #[serde(with = "duration_ms")]
    pub peer_wait_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub peer_poll_interval: Duration,
    pub lock: LockConfig,
    pub opener: OpenerConfig,
    pub cli: CliConfig,
    pub probe: ProbeConfig,
}

/// Helper module for serializing Duration as milliseconds
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(15 * 60),
            max_attempts: 3,
            retry_backoff: Duration::from_secs(1),
            peer_wait_timeout: Duration::from_secs(90),
            peer_poll_interval: Duration::from_secs(1),
            lock: LockConfig::default(),
            opener: OpenerConfig::default(),
            cli: CliConfig::default(),
            probe: ProbeConfig::default(),
        }
    }
}

impl ManagerConfig {
    pub fn builder() -> ManagerConfigBuilder {
        ManagerConfigBuilder::default()
    }

    /// Load from a YAML file; keys that are absent keep their defaults
    pub fn from_yaml_file(path: &Path) -> Result<Self, TunnelError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            TunnelError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&text)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, TunnelError> {
        let config: ManagerConfig = serde_yaml::from_str(text)
            .map_err(|e| TunnelError::Config(format!("failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// TTL of the lock entry taken before opening
    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(lock_ttl_secs(
            self.lock.acquire_timeout,
            self.lock.ttl_margin,
        ))
    }

    /// Longest a lock holder may need: re-check describe, teardown of an
    /// unhealthy tunnel, ready wait, settle, verifying describe, one probe
    pub fn holder_budget(&self) -> Duration {
        self.opener.setup_timeout
            + self.opener.settle_delay
            + self.probe.timeout
            + self.cli.command_timeout * 3
    }

    pub fn validate(&self) -> Result<(), TunnelError> {
        if self.max_attempts == 0 {
            return Err(TunnelError::Config(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if self.idle_timeout.is_zero() {
            return Err(TunnelError::Config(
                "idle_timeout must be greater than zero".to_string(),
            ));
        }
        if self.cli.command_timeout.is_zero() {
            return Err(TunnelError::Config(
                "cli.command_timeout must be greater than zero".to_string(),
            ));
        }
        if self.peer_poll_interval.is_zero() || self.lock.retry_delay.is_zero() {
            return Err(TunnelError::Config(
                "polling intervals must be greater than zero".to_string(),
            ));
        }
        if self.opener.ready_markers.is_empty() {
            return Err(TunnelError::Config(
                "at least one ready marker is required".to_string(),
            ));
        }
        if self.lock_ttl() <= self.holder_budget() {
            return Err(TunnelError::Config(format!(
                "lock TTL {:?} must exceed the holder budget {:?}; raise lock.ttl_margin",
                self.lock_ttl(),
                self.holder_budget()
            )));
        }
        Ok(())
    }
}

/// Builder for ManagerConfig
#[derive(Default)]
pub struct ManagerConfigBuilder {
    config: ManagerConfig,
}

impl ManagerConfigBuilder {
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.idle_timeout = timeout;
        self
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.config.max_attempts = attempts;
        self
    }

    pub fn retry_backoff(mut self, backoff: Duration) -> Self {
        self.config.retry_backoff = backoff;
        self
    }

    pub fn peer_wait(mut self, timeout: Duration, poll_interval: Duration) -> Self {
        self.config.peer_wait_timeout = timeout;
        self.config.peer_poll_interval = poll_interval;
        self
    }

    pub fn lock(mut self, lock: LockConfig) -> Self {
        self.config.lock = lock;
        self
    }

    pub fn opener(mut self, opener: OpenerConfig) -> Self {
        self.config.opener = opener;
        self
    }

    pub fn cli(mut self, cli: CliConfig) -> Self {
        self.config.cli = cli;
        self
    }

    pub fn probe(mut self, probe: ProbeConfig) -> Self {
        self.config.probe = probe;
        self
    }

    pub fn build(self) -> Result<ManagerConfig, TunnelError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

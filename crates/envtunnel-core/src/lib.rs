//! Environment tunnel manager - core library
//!
//! Opens, shares and tears down SSH tunnels created by an external platform
//! CLI. Tunnels are keyed by (project, environment); a shared lock store
//! keeps concurrent processes from opening the same tunnel twice, a health
//! probe screens every record handed out, and idle tunnels are closed after
//! a configurable period without lookups.

pub mod backoff;
pub mod cli;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod key;
pub mod lock;
pub mod manager;
pub mod opener;
pub mod parser;
pub mod probe;
pub mod reaper;

pub use cli::{CommandTunnelCli, OpenSession, OutputLines, TunnelCli};
pub use config::{CliConfig, LockConfig, ManagerConfig, OpenerConfig, ProbeConfig};
pub use endpoint::{ServiceEndpoint, TunnelRecord};
pub use error::{CliError, LockStoreError, Result, TunnelError};
pub use key::TunnelKey;
pub use lock::{LockCoordinator, LockStore, MemoryLockStore};
pub use manager::TunnelManager;
pub use opener::TunnelOpener;
pub use parser::{endpoint_from_url, parse_describe_output, parse_progress_line};
pub use probe::{AssumeHealthy, HealthProbe, TcpConnectProbe};
pub use reaper::IdleReaper;

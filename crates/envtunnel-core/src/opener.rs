//! Drives the Tunnel CLI's open operation to completion
//!
//! The open operation is asynchronous and its exit status says nothing about
//! readiness: the process may exit 0 while still printing, or stay attached
//! after the tunnels are up. Completion is therefore decided by two
//! independent signals:
//!
//! 1. an in-band ready marker in the output, bounded by a safety timer
//! 2. an authoritative `describe` after a short settle delay
//!
//! Endpoints seen in progress lines are kept only as a fallback for when
//! `describe` has not caught up with the open yet.

use crate::cli::TunnelCli;
use crate::config::OpenerConfig;
use crate::endpoint::TunnelRecord;
use crate::error::{CliError, TunnelError};
use crate::key::TunnelKey;
use crate::parser::{parse_describe_output, parse_progress_line};
use futures::StreamExt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Stage of one open operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenStage {
    Starting,
    WaitingForReady,
    Verifying,
    Done,
}

/// Opens a tunnel and resolves its endpoint record
pub struct TunnelOpener {
    cli: Arc<dyn TunnelCli>,
    config: OpenerConfig,
}

impl TunnelOpener {
    pub fn new(cli: Arc<dyn TunnelCli>, config: OpenerConfig) -> Self {
        Self { cli, config }
    }

    pub async fn open(&self, key: &TunnelKey) -> Result<TunnelRecord, TunnelError> {
        let mut stage = OpenStage::Starting;
        debug!(key = %key, ?stage, "Opening tunnel");

        let mut output = self.cli.open(key).await.map_err(TunnelError::Cli)?;
        let mut progress = TunnelRecord::new();

        stage = OpenStage::WaitingForReady;
        debug!(key = %key, ?stage, "Waiting for ready marker");

        let deadline = tokio::time::sleep(self.config.setup_timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = &mut deadline => {
                    warn!(
                        key = %key,
                        "No ready marker within {:?} ({} service(s) seen)",
                        self.config.setup_timeout,
                        progress.len()
                    );
                    return Err(TunnelError::SetupTimeout {
                        key: key.to_string(),
                        after: self.config.setup_timeout,
                    });
                }
                line = output.next() => {
                    let Some(line) = line else {
                        warn!(key = %key, "Tunnel CLI closed its output before reporting ready");
                        return Err(TunnelError::SetupIncomplete { key: key.to_string() });
                    };

                    if let Some((service, endpoint)) = parse_progress_line(&line) {
                        progress.push(service, endpoint);
                    }
                    if self.config.is_ready_marker(&line) {
                        break;
                    }
                }
            }
        }

        // Stop listening but leave the process (and its tunnels) running.
        // Every early return above drops the session instead, which kills it.
        output.detach();

        stage = OpenStage::Verifying;
        debug!(key = %key, ?stage, "Ready marker seen, verifying with describe");
        tokio::time::sleep(self.config.settle_delay).await;

        let record = match self.cli.describe(key).await {
            Ok(text) => {
                let described = parse_describe_output(&text);
                if described.is_empty() {
                    self.fallback(key, progress, "describe returned no endpoints")?
                } else {
                    described
                }
            }
            Err(CliError::NotFound) => self.fallback(key, progress, "describe reports no tunnels yet")?,
            Err(e) => return Err(TunnelError::Describe(e)),
        };

        stage = OpenStage::Done;
        info!(
            key = %key,
            ?stage,
            services = ?record.service_names().collect::<Vec<_>>(),
            "Tunnel open"
        );
        Ok(record)
    }

    /// Use progress-parsed endpoints when describe lags behind the open
    fn fallback(
        &self,
        key: &TunnelKey,
        progress: TunnelRecord,
        reason: &str,
    ) -> Result<TunnelRecord, TunnelError> {
        if progress.is_empty() {
            warn!(key = %key, "{} and no endpoints were reported while opening", reason);
            return Err(TunnelError::SetupIncomplete {
                key: key.to_string(),
            });
        }
        warn!(key = %key, "{}, using endpoints from open output", reason);
        Ok(progress)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::{MockTunnelCli, OpenSession};
    use futures::stream;
    use std::time::Duration;

    const READY: &str = "Logs are written to: /tmp/tunnel.log";
    const DESCRIBE_CACHE: &str = "cache:\n    -\n        host: 10.0.0.5\n        port: 6379\n";

    fn key() -> TunnelKey {
        TunnelKey::new("abc123", "main").unwrap()
    }

    fn config() -> OpenerConfig {
        OpenerConfig {
            setup_timeout: Duration::from_secs(30),
            settle_delay: Duration::from_millis(500),
            ..OpenerConfig::default()
        }
    }

    fn lines(lines: &[&str]) -> OpenSession {
        let owned: Vec<String> = lines.iter().map(|l| l.to_string()).collect();
        OpenSession::new(stream::iter(owned).boxed())
    }

    fn opener(cli: MockTunnelCli) -> TunnelOpener {
        TunnelOpener::new(Arc::new(cli), config())
    }

    #[tokio::test(start_paused = true)]
    async fn test_prefers_describe_over_progress() {
        let mut cli = MockTunnelCli::new();
        cli.expect_open().times(1).returning(|_| {
            Ok(lines(&[
                "SSH tunnel opened to cache at: redis://127.0.0.1:30001",
                READY,
            ]))
        });
        cli.expect_describe()
            .times(1)
            .returning(|_| Ok(DESCRIBE_CACHE.to_string()));

        let record = opener(cli).open(&key()).await.unwrap();
        let cache = record.primary("cache").unwrap();
        assert_eq!(cache.host, "10.0.0.5");
        assert_eq!(cache.port, Some(6379));
    }

    #[tokio::test(start_paused = true)]
    async fn test_falls_back_when_describe_lags() {
        let mut cli = MockTunnelCli::new();
        cli.expect_open().returning(|_| {
            Ok(lines(&[
                "SSH tunnel opened to cache at: redis://127.0.0.1:30001",
                "A tunnel is already opened to the relationship database, at: pgsql://main:@127.0.0.1:30000/main",
                READY,
            ]))
        });
        cli.expect_describe().returning(|_| Err(CliError::NotFound));

        let record = opener(cli).open(&key()).await.unwrap();
        assert_eq!(record.primary("cache").unwrap().port, Some(30001));
        assert_eq!(record.primary("database").unwrap().port, Some(30000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_describe_lag_without_progress_is_incomplete() {
        let mut cli = MockTunnelCli::new();
        cli.expect_open().returning(|_| Ok(lines(&[READY])));
        cli.expect_describe().returning(|_| Err(CliError::NotFound));

        let err = opener(cli).open(&key()).await.unwrap_err();
        assert!(matches!(err, TunnelError::SetupIncomplete { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_output_closed_before_ready() {
        let mut cli = MockTunnelCli::new();
        cli.expect_open().returning(|_| {
            Ok(lines(&["SSH tunnel opened to cache at: redis://127.0.0.1:30001"]))
        });
        cli.expect_describe().times(0);

        let err = opener(cli).open(&key()).await.unwrap_err();
        assert!(matches!(err, TunnelError::SetupIncomplete { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_setup_timeout_when_output_stalls() {
        let mut cli = MockTunnelCli::new();
        cli.expect_open()
            .returning(|_| Ok(OpenSession::new(stream::pending::<String>().boxed())));
        cli.expect_describe().times(0);

        let started = tokio::time::Instant::now();
        let err = opener(cli).open(&key()).await.unwrap_err();

        assert!(matches!(err, TunnelError::SetupTimeout { .. }));
        assert!(started.elapsed() >= Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_describe_error_is_propagated() {
        let mut cli = MockTunnelCli::new();
        cli.expect_open().returning(|_| Ok(lines(&[READY])));
        cli.expect_describe().returning(|_| {
            Err(CliError::CommandFailed {
                command: "platform tunnel:info".to_string(),
                status: "exit status: 1".to_string(),
                output: "Authentication required".to_string(),
            })
        });

        let err = opener(cli).open(&key()).await.unwrap_err();
        assert!(matches!(
            err,
            TunnelError::Describe(CliError::CommandFailed { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_failure_is_cli_error() {
        let mut cli = MockTunnelCli::new();
        cli.expect_open().returning(|_| {
            Err(CliError::Spawn {
                program: "platform".to_string(),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            })
        });

        let err = opener(cli).open(&key()).await.unwrap_err();
        assert!(matches!(err, TunnelError::Cli(CliError::Spawn { .. })));
    }

    fn tracked(lines: &[&str], detach: tokio::sync::oneshot::Sender<()>) -> OpenSession {
        let owned: Vec<String> = lines.iter().map(|l| l.to_string()).collect();
        OpenSession::with_detach(stream::iter(owned).chain(stream::pending()).boxed(), detach)
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_open_is_detached() {
        let (detach_tx, detach_rx) = tokio::sync::oneshot::channel();
        let mut detach_tx = Some(detach_tx);

        let mut cli = MockTunnelCli::new();
        cli.expect_open().times(1).returning(move |_| {
            Ok(tracked(&[READY], detach_tx.take().unwrap()))
        });
        cli.expect_describe()
            .returning(|_| Ok(DESCRIBE_CACHE.to_string()));

        opener(cli).open(&key()).await.unwrap();
        assert!(detach_rx.await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_open_is_abandoned() {
        let (detach_tx, detach_rx) = tokio::sync::oneshot::channel();
        let mut detach_tx = Some(detach_tx);

        let mut cli = MockTunnelCli::new();
        cli.expect_open().times(1).returning(move |_| {
            Ok(tracked(&["Connecting..."], detach_tx.take().unwrap()))
        });

        let err = opener(cli).open(&key()).await.unwrap_err();
        assert!(matches!(err, TunnelError::SetupTimeout { .. }));
        assert!(detach_rx.await.is_err());
    }
}

//! Tunnel CLI boundary
//!
//! The external tool that actually opens, closes and describes tunnels. Only
//! its textual output and exit status are part of the contract.

use crate::config::CliConfig;
use crate::error::CliError;
use crate::key::TunnelKey;
use async_trait::async_trait;
use futures::stream::{BoxStream, Stream, StreamExt};
use std::pin::Pin;
use std::process::{ExitStatus, Stdio};
use std::task::{Context, Poll};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::{LinesStream, ReceiverStream};
use tracing::{debug, warn};

/// Combined stdout/stderr lines of a running open operation
///
/// The stream ends when the process closes its output.
pub type OutputLines = BoxStream<'static, String>;

/// A running open operation
///
/// Yields the operation's output lines. Dropping the session without calling
/// [`OpenSession::detach`] abandons the operation and kills its process;
/// detaching leaves the process running with its tunnels.
pub struct OpenSession {
    lines: OutputLines,
    detach: Option<oneshot::Sender<()>>,
}

impl OpenSession {
    /// Session with no process attached
    pub fn new(lines: OutputLines) -> Self {
        Self {
            lines,
            detach: None,
        }
    }

    /// Session whose process is killed when `detach` is dropped unsent
    pub fn with_detach(lines: OutputLines, detach: oneshot::Sender<()>) -> Self {
        Self {
            lines,
            detach: Some(detach),
        }
    }

    /// Stop reading but keep the process running
    pub fn detach(mut self) {
        if let Some(detach) = self.detach.take() {
            let _ = detach.send(());
        }
    }
}

impl Stream for OpenSession {
    type Item = String;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<String>> {
        self.lines.poll_next_unpin(cx)
    }
}

/// Operations offered by the Tunnel CLI
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TunnelCli: Send + Sync {
    /// Start the long-running open operation and stream its output
    async fn open(&self, key: &TunnelKey) -> Result<OpenSession, CliError>;

    /// Close the tunnel for `key`
    async fn close(&self, key: &TunnelKey) -> Result<(), CliError>;

    /// Structured description of the open tunnel, or `CliError::NotFound`
    async fn describe(&self, key: &TunnelKey) -> Result<String, CliError>;
}

/// `TunnelCli` backed by an external program
#[derive(Debug, Clone)]
pub struct CommandTunnelCli {
    config: CliConfig,
}

impl CommandTunnelCli {
    pub fn new(config: CliConfig) -> Self {
        Self { config }
    }

    fn command(&self, args: &[String]) -> Command {
        let mut command = Command::new(&self.config.program);
        command.args(args).stdin(Stdio::null());
        command
    }

    fn command_line(&self, args: &[String]) -> String {
        std::iter::once(self.config.program.as_str())
            .chain(args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Run to completion within `command_timeout`, returning status, stdout
    /// and stderr
    async fn run(&self, args: &[String]) -> Result<(ExitStatus, String, String), CliError> {
        debug!("Running {}", self.command_line(args));

        let mut command = self.command(args);
        command.kill_on_drop(true);

        let output = match tokio::time::timeout(self.config.command_timeout, command.output()).await
        {
            Ok(result) => result.map_err(|source| CliError::Spawn {
                program: self.config.program.clone(),
                source,
            })?,
            Err(_) => {
                warn!(
                    "{} did not finish within {:?}, killed",
                    self.command_line(args),
                    self.config.command_timeout
                );
                return Err(CliError::Timeout {
                    command: self.command_line(args),
                    after: self.config.command_timeout,
                });
            }
        };

        Ok((
            output.status,
            String::from_utf8_lossy(&output.stdout).to_string(),
            String::from_utf8_lossy(&output.stderr).to_string(),
        ))
    }

    fn failed(&self, args: &[String], status: ExitStatus, stdout: &str, stderr: &str) -> CliError {
        let output = if stderr.trim().is_empty() {
            stdout.trim().to_string()
        } else {
            stderr.trim().to_string()
        };
        CliError::CommandFailed {
            command: self.command_line(args),
            status: status.to_string(),
            output,
        }
    }
}

#[async_trait]
impl TunnelCli for CommandTunnelCli {
    async fn open(&self, key: &TunnelKey) -> Result<OpenSession, CliError> {
        let args = self.config.render(&self.config.open_args, key);
        let command_line = self.command_line(&args);
        debug!(key = %key, "Starting {}", command_line);

        let mut child = self
            .command(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| CliError::Spawn {
                program: self.config.program.clone(),
                source,
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CliError::Io(std::io::Error::other("stdout was not captured")))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| CliError::Io(std::io::Error::other("stderr was not captured")))?;

        let mut lines = futures::stream::select(
            LinesStream::new(BufReader::new(stdout).lines()),
            LinesStream::new(BufReader::new(stderr).lines()),
        );

        let (tx, rx) = mpsc::channel(64);
        let (detach_tx, mut detach_rx) = oneshot::channel::<()>();

        // Keeps draining the pipes after the reader goes away so the child
        // never blocks on a full pipe, then reaps it. An abandoned session
        // kills the child first.
        tokio::spawn(async move {
            let mut watching = true;
            loop {
                tokio::select! {
                    outcome = &mut detach_rx, if watching => {
                        watching = false;
                        if outcome.is_err() {
                            warn!("Open abandoned, killing {}", command_line);
                            if let Err(e) = child.start_kill() {
                                warn!("Failed to kill {}: {}", command_line, e);
                            }
                        }
                    }
                    line = lines.next() => match line {
                        Some(Ok(line)) => {
                            if !tx.is_closed() {
                                let _ = tx.send(line).await;
                            }
                        }
                        Some(Err(e)) if e.kind() == std::io::ErrorKind::InvalidData => {}
                        Some(Err(e)) => {
                            warn!("Error reading output of {}: {}", command_line, e);
                            break;
                        }
                        None => break,
                    },
                }
            }
            drop(tx);

            match child.wait().await {
                Ok(status) => debug!("{} exited with {}", command_line, status),
                Err(e) => warn!("Failed to wait for {}: {}", command_line, e),
            }
        });

        Ok(OpenSession::with_detach(
            ReceiverStream::new(rx).boxed(),
            detach_tx,
        ))
    }

    async fn close(&self, key: &TunnelKey) -> Result<(), CliError> {
        let args = self.config.render(&self.config.close_args, key);
        let (status, stdout, stderr) = self.run(&args).await?;

        if status.success() || self.config.is_not_found(&stdout, &stderr) {
            return Ok(());
        }
        Err(self.failed(&args, status, &stdout, &stderr))
    }

    async fn describe(&self, key: &TunnelKey) -> Result<String, CliError> {
        let args = self.config.render(&self.config.describe_args, key);
        let (status, stdout, stderr) = self.run(&args).await?;

        if self.config.is_not_found(&stdout, &stderr) {
            return Err(CliError::NotFound);
        }
        if !status.success() {
            return Err(self.failed(&args, status, &stdout, &stderr));
        }
        Ok(stdout)
    }
}

//! Worker process supervision.
//!
//! Owns the single worker child process: spawns it with the inherited
//! environment plus harness variables, wires its stdio into a [`Connection`],
//! and terminates it on request. Nothing here kills the worker implicitly.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use tokio::process::{Child, Command};
use tracing::{info, warn};

use crate::config::HarnessConfig;
use crate::correlator::ResponseCorrelator;
use crate::dispatch::{connect, ConnectOptions, Connection};
use crate::error::{HarnessError, HarnessResult};
use crate::protocol::ProtocolSchemas;

/// Environment variable telling the worker which transport carries the protocol.
pub const CHANNEL_ENV_VAR: &str = "PLUGIN_TESTER_CHANNEL";
pub const CHANNEL_STDIO: &str = "stdio";

#[derive(Debug)]
pub struct WorkerProcess {
    executable: PathBuf,
    child: Child,
    connection: Connection,
}

impl WorkerProcess {
    /// Spawn `executable` with the built-in protocol schemas.
    pub fn spawn(executable: impl AsRef<Path>, config: &HarnessConfig) -> HarnessResult<Self> {
        Self::spawn_with_schemas(executable, config, ProtocolSchemas::builtin()?)
    }

    /// Spawn `executable`, validating traffic with caller-supplied schemas.
    ///
    /// `executable` must be absolute; relative paths are refused rather than
    /// resolved against a working directory the worker may not share.
    pub fn spawn_with_schemas(
        executable: impl AsRef<Path>,
        config: &HarnessConfig,
        schemas: ProtocolSchemas,
    ) -> HarnessResult<Self> {
        let executable = executable.as_ref();
        if !executable.is_absolute() {
            return Err(HarnessError::Configuration(format!(
                "Worker path must be absolute, got '{}'",
                executable.display()
            )));
        }

        let mut cmd = Command::new(executable);
        cmd.args(&config.worker.args)
            .envs(&config.worker.env)
            .env(CHANNEL_ENV_VAR, CHANNEL_STDIO)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        if let Some(cwd) = &config.worker.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = cmd.spawn().map_err(|e| {
            HarnessError::Configuration(format!(
                "Failed to spawn worker {}: {}",
                executable.display(),
                e
            ))
        })?;
        info!(pid = ?child.id(), path = %executable.display(), "worker spawned");

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| HarnessError::Configuration("Worker stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| HarnessError::Configuration("Worker stdout unavailable".to_string()))?;

        let connection = connect(stdout, stdin, ConnectOptions::from_config(config, schemas));

        Ok(Self {
            executable: executable.to_path_buf(),
            child,
            connection,
        })
    }

    pub fn correlator(&self) -> &Arc<ResponseCorrelator> {
        &self.connection.correlator
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Terminate the worker. Requests still awaiting a response and any later
    /// sends fail with `ChannelClosed`.
    pub async fn kill(&mut self) -> HarnessResult<()> {
        self.connection.shutdown();
        self.connection
            .correlator
            .fail_all(|| HarnessError::ChannelClosed)
            .await;
        match self.child.kill().await {
            Ok(()) => {
                info!(path = %self.executable.display(), "worker terminated");
                Ok(())
            }
            Err(e) => {
                warn!("Failed to terminate worker: {}", e);
                Err(HarnessError::Io(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_relative_path_is_refused() {
        let err = WorkerProcess::spawn("plugins/worker", &HarnessConfig::default()).unwrap_err();
        assert!(matches!(err, HarnessError::Configuration(ref m) if m.contains("absolute")));
    }

    #[tokio::test]
    async fn test_missing_executable_is_a_configuration_error() {
        let err = WorkerProcess::spawn("/definitely/not/here", &HarnessConfig::default()).unwrap_err();
        assert!(matches!(err, HarnessError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_kill_closes_the_channel() {
        let mut worker = WorkerProcess::spawn("/bin/cat", &HarnessConfig::default()).unwrap();
        assert!(worker.pid().is_some());
        worker.kill().await.unwrap();
        let err = worker
            .correlator()
            .send("initialize", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, HarnessError::ChannelClosed));
    }

    #[tokio::test]
    async fn test_kill_fails_requests_in_flight() {
        let mut worker = WorkerProcess::spawn("/bin/cat", &HarnessConfig::default()).unwrap();
        let correlator = Arc::clone(worker.correlator());
        let in_flight = tokio::spawn(async move {
            correlator.send("plan", serde_json::json!({})).await
        });
        while worker.correlator().pending_count().await == 0 {
            tokio::task::yield_now().await;
        }

        worker.kill().await.unwrap();
        let outcome = tokio::time::timeout(std::time::Duration::from_secs(3), in_flight)
            .await
            .expect("in-flight request should settle after kill")
            .unwrap();
        assert!(matches!(outcome, Err(HarnessError::ChannelClosed)));
        assert_eq!(worker.correlator().pending_count().await, 0);
    }
}

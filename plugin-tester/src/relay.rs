//! Privileged command relay.
//!
//! Serves `SUDO_REQUEST` messages issued by the worker: the command runs
//! elevated inside a (login) shell, its output is mirrored live onto this
//! process's stdout/stderr while also being accumulated, and the exit status
//! decides the reply's status. A command that fails to start is reported to
//! the worker as an ERROR result, not raised here.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::channel::MessageChannel;
use crate::config::RelayConfig;
use crate::error::{HarnessError, HarnessResult};
use crate::protocol::{Message, MessageStatus, MessageValidator, SudoRequest, SudoResult, SUDO_REQUEST};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputStream {
    Stdout,
    Stderr,
}

type Sink = Box<dyn AsyncWrite + Send + Unpin>;

/// Where mirrored command output goes; the process's own stdio by default.
pub struct OutputSinks {
    stdout: Mutex<Sink>,
    stderr: Mutex<Sink>,
}

impl OutputSinks {
    pub fn new(
        stdout: impl AsyncWrite + Send + Unpin + 'static,
        stderr: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        Self {
            stdout: Mutex::new(Box::new(stdout)),
            stderr: Mutex::new(Box::new(stderr)),
        }
    }

    pub fn stdio() -> Self {
        Self::new(tokio::io::stdout(), tokio::io::stderr())
    }

    async fn forward(&self, stream: OutputStream, chunk: &[u8]) {
        let sink = match stream {
            OutputStream::Stdout => &self.stdout,
            OutputStream::Stderr => &self.stderr,
        };
        let mut sink = sink.lock().await;
        let written = match sink.write_all(chunk).await {
            Ok(()) => sink.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            debug!(?stream, "could not mirror command output: {}", e);
        }
    }
}

pub struct SudoRelay {
    config: RelayConfig,
    channel: MessageChannel,
    validator: Arc<dyn MessageValidator>,
    sinks: OutputSinks,
}

impl std::fmt::Debug for SudoRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SudoRelay")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SudoRelay {
    pub fn new(
        config: RelayConfig,
        channel: MessageChannel,
        validator: Arc<dyn MessageValidator>,
    ) -> Self {
        Self {
            config,
            channel,
            validator,
            sinks: OutputSinks::stdio(),
        }
    }

    pub fn with_output_sinks(mut self, sinks: OutputSinks) -> Self {
        self.sinks = sinks;
        self
    }

    /// Whether `message` is a worker-originated privileged command.
    pub fn handles(message: &Message) -> bool {
        message.cmd == SUDO_REQUEST && message.status.is_none()
    }

    /// Check the embedded payload against the sudo schema and decode it.
    pub fn parse_request(&self, data: &Value) -> HarnessResult<SudoRequest> {
        self.validator.validate(data).into_result("sudo request")?;
        serde_json::from_value(data.clone())
            .map_err(|e| HarnessError::ProtocolViolation(format!("sudo request: {}", e)))
    }

    /// Run the request and send the result back as `SUDO_REQUEST_Response`.
    pub async fn serve(&self, request: SudoRequest) -> HarnessResult<()> {
        let result = self.execute(&request).await;
        let reply = Message::response(SUDO_REQUEST, result.status, serde_json::to_value(&result)?);
        self.channel.send(&reply)
    }

    fn command_line(&self, command: &str) -> String {
        match &self.config.elevation {
            Some(program) => format!("{} {}", program, command),
            None => command.to_string(),
        }
    }

    pub async fn execute(&self, request: &SudoRequest) -> SudoResult {
        let command_line = self.command_line(&request.command);
        info!(command = %command_line, "running privileged command for worker");

        let mut cmd = Command::new(&self.config.shell);
        if self.config.login_shell {
            cmd.arg("-l");
        }
        cmd.arg("-c")
            .arg(&command_line)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(cwd) = &request.options.cwd {
            cmd.current_dir(cwd);
        }
        if let Some(env) = &request.options.env {
            cmd.envs(env);
        }
        #[cfg(unix)]
        {
            if let Some(uid) = request.options.uid {
                cmd.uid(uid);
            }
            if let Some(gid) = request.options.gid {
                cmd.gid(gid);
            }
        }
        if !request.options.ignored.is_empty() {
            debug!(
                options = ?request.options.ignored.keys().collect::<Vec<_>>(),
                "ignoring spawn options the relay controls"
            );
        }
        cmd.kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!("Failed to start privileged command: {}", e);
                return SudoResult {
                    status: MessageStatus::Error,
                    data: format!("Failed to start '{}': {}", command_line, e),
                };
            }
        };

        let (tx, mut rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump(OutputStream::Stdout, stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump(OutputStream::Stderr, stderr, tx.clone()));
        }
        drop(tx);

        let mut captured: Vec<u8> = Vec::new();
        let run = async {
            while let Some((stream, chunk)) = rx.recv().await {
                if self.config.forward_output {
                    self.sinks.forward(stream, &chunk).await;
                }
                captured.extend_from_slice(&chunk);
            }
            child.wait().await
        };
        let exit = match request.options.timeout {
            Some(ms) => tokio::time::timeout(Duration::from_millis(ms), run).await.ok(),
            None => Some(run.await),
        };

        let status = match exit {
            Some(Ok(exit)) if exit.success() => MessageStatus::Success,
            Some(Ok(exit)) => {
                debug!(code = ?exit.code(), "privileged command exited unsuccessfully");
                MessageStatus::Error
            }
            Some(Err(e)) => {
                captured.extend_from_slice(format!("\n{}", e).as_bytes());
                MessageStatus::Error
            }
            None => {
                warn!(command = %command_line, "privileged command timed out");
                if let Err(e) = child.kill().await {
                    debug!("could not kill timed out command: {}", e);
                }
                captured.extend_from_slice(
                    format!("\nTimed out after {}ms", request.options.timeout.unwrap_or_default())
                        .as_bytes(),
                );
                MessageStatus::Error
            }
        };

        SudoResult {
            status,
            data: String::from_utf8_lossy(&captured).into_owned(),
        }
    }
}

async fn pump<R: AsyncRead + Unpin>(
    stream: OutputStream,
    mut reader: R,
    tx: mpsc::UnboundedSender<(OutputStream, Vec<u8>)>,
) {
    let mut buf = vec![0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if tx.send((stream, buf[..n].to_vec())).is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!(?stream, "stopped reading command output: {}", e);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ProtocolSchemas, SudoSpawnOptions};
    use serde_json::json;
    use std::collections::HashMap;
    use tokio::io::{AsyncBufReadExt, BufReader};

    fn relay() -> (SudoRelay, tokio::io::DuplexStream) {
        let (controller, worker) = tokio::io::duplex(64 * 1024);
        let (read_half, write_half) = tokio::io::split(controller);
        let (channel, _inbound, _tasks) = MessageChannel::open(read_half, write_half);
        let schemas = ProtocolSchemas::builtin().unwrap();
        let relay = SudoRelay::new(
            RelayConfig::unelevated("/bin/sh").with_forward_output(false),
            channel,
            schemas.sudo_request,
        );
        (relay, worker)
    }

    fn request(command: &str) -> SudoRequest {
        SudoRequest {
            command: command.to_string(),
            options: SudoSpawnOptions::default(),
        }
    }

    #[tokio::test]
    async fn test_successful_command_reports_output() {
        let (relay, _worker) = relay();
        let result = relay.execute(&request("echo ok")).await;
        assert_eq!(result.status, MessageStatus::Success);
        assert!(result.data.contains("ok"));
    }

    #[tokio::test]
    async fn test_failing_command_keeps_output() {
        let (relay, _worker) = relay();
        let result = relay
            .execute(&request("echo partial; echo oops 1>&2; exit 3"))
            .await;
        assert_eq!(result.status, MessageStatus::Error);
        assert!(result.data.contains("partial"));
        assert!(result.data.contains("oops"));
    }

    #[tokio::test]
    async fn test_spawn_failure_is_an_error_result() {
        let (controller, _worker) = tokio::io::duplex(64);
        let (read_half, write_half) = tokio::io::split(controller);
        let (channel, _inbound, _tasks) = MessageChannel::open(read_half, write_half);
        let relay = SudoRelay::new(
            RelayConfig::unelevated("/nonexistent/shell").with_forward_output(false),
            channel,
            ProtocolSchemas::builtin().unwrap().sudo_request,
        );
        let result = relay.execute(&request("echo ok")).await;
        assert_eq!(result.status, MessageStatus::Error);
        assert!(result.data.contains("Failed to start"));
    }

    #[tokio::test]
    async fn test_cwd_and_env_are_honoured() {
        let (relay, _worker) = relay();
        let dir = tempfile::tempdir().unwrap();
        let mut env = HashMap::new();
        env.insert("RELAY_MARKER".to_string(), "marker-value".to_string());
        let result = relay
            .execute(&SudoRequest {
                command: "pwd; echo $RELAY_MARKER".to_string(),
                options: SudoSpawnOptions {
                    cwd: Some(dir.path().to_path_buf()),
                    env: Some(env),
                    ..Default::default()
                },
            })
            .await;
        assert_eq!(result.status, MessageStatus::Success);
        assert!(result.data.contains("marker-value"));
        let dir_name = dir.path().file_name().unwrap().to_string_lossy().to_string();
        assert!(result.data.contains(&dir_name));
    }

    #[tokio::test]
    async fn test_timeout_kills_command_and_reports_error() {
        let (relay, _worker) = relay();
        let started = std::time::Instant::now();
        let result = relay
            .execute(&SudoRequest {
                command: "sleep 5; echo finished".to_string(),
                options: SudoSpawnOptions {
                    timeout: Some(100),
                    ..Default::default()
                },
            })
            .await;
        assert_eq!(result.status, MessageStatus::Error);
        assert!(!result.data.contains("finished"));
        assert!(result.data.contains("Timed out after 100ms"));
        assert!(started.elapsed() < std::time::Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_uid_and_gid_are_applied() {
        let current = |flag: &str| -> u32 {
            let out = std::process::Command::new("id").arg(flag).output().unwrap();
            String::from_utf8_lossy(&out.stdout).trim().parse().unwrap()
        };
        let (uid, gid) = (current("-u"), current("-g"));
        let (relay, _worker) = relay();
        let result = relay
            .execute(&SudoRequest {
                command: "id -u; id -g".to_string(),
                options: SudoSpawnOptions {
                    uid: Some(uid),
                    gid: Some(gid),
                    ..Default::default()
                },
            })
            .await;
        assert_eq!(result.status, MessageStatus::Success);
        let lines: Vec<&str> = result.data.lines().collect();
        assert!(lines.ends_with(&[uid.to_string().as_str(), gid.to_string().as_str()]));
    }

    #[tokio::test]
    async fn test_output_is_forwarded_and_captured() {
        let (controller, _worker) = tokio::io::duplex(64);
        let (read_half, write_half) = tokio::io::split(controller);
        let (channel, _inbound, _tasks) = MessageChannel::open(read_half, write_half);
        let (out_sink, mut out_seen) = tokio::io::duplex(64 * 1024);
        let (err_sink, mut err_seen) = tokio::io::duplex(64 * 1024);
        let config = RelayConfig {
            login_shell: false,
            ..RelayConfig::unelevated("/bin/sh")
        };
        let relay = SudoRelay::new(
            config,
            channel,
            ProtocolSchemas::builtin().unwrap().sudo_request,
        )
        .with_output_sinks(OutputSinks::new(out_sink, err_sink));

        let result = relay
            .execute(&request("echo to-out; echo to-err 1>&2"))
            .await;
        drop(relay);

        let mut out = String::new();
        let mut err = String::new();
        out_seen.read_to_string(&mut out).await.unwrap();
        err_seen.read_to_string(&mut err).await.unwrap();
        assert_eq!(result.status, MessageStatus::Success);
        assert_eq!(out, "to-out\n");
        assert_eq!(err, "to-err\n");
        assert_eq!(result.data.len(), out.len() + err.len());
        assert!(result.data.contains(&out));
        assert!(result.data.contains(&err));
    }

    #[tokio::test]
    async fn test_elevation_prefixes_command() {
        let (controller, _worker) = tokio::io::duplex(64);
        let (read_half, write_half) = tokio::io::split(controller);
        let (channel, _inbound, _tasks) = MessageChannel::open(read_half, write_half);
        let relay = SudoRelay::new(
            RelayConfig::default(),
            channel,
            ProtocolSchemas::builtin().unwrap().sudo_request,
        );
        assert_eq!(relay.command_line("apt-get update"), "sudo apt-get update");
    }

    #[tokio::test]
    async fn test_serve_replies_with_correlated_response() {
        let (relay, worker) = relay();
        relay.serve(request("echo served")).await.unwrap();

        let mut lines = BufReader::new(worker).lines();
        let line = lines.next_line().await.unwrap().unwrap();
        let reply: Message = serde_json::from_str(&line).unwrap();
        assert_eq!(reply.cmd, "SUDO_REQUEST_Response");
        assert_eq!(reply.status, Some(MessageStatus::Success));
        assert_eq!(reply.data["status"], json!("SUCCESS"));
        assert!(reply.data["data"].as_str().unwrap().contains("served"));
    }

    #[tokio::test]
    async fn test_parse_request_rejects_bad_payload() {
        let (relay, _worker) = relay();
        let err = relay.parse_request(&json!({"cmd": "nope"})).unwrap_err();
        assert!(matches!(err, HarnessError::ProtocolViolation(_)));
        let parsed = relay
            .parse_request(&json!({"command": "ls", "options": {"detached": true}}))
            .unwrap();
        assert_eq!(parsed.command, "ls");
    }
}

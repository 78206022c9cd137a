//! Harness configuration.
//!
//! Every field has a default matching the protocol's reference behaviour, so
//! an empty TOML document (or `HarnessConfig::default()`) is a valid setup.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::HarnessResult;

/// How the privileged relay runs worker-requested commands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Program prefixed to every command; `None` runs it unelevated
    pub elevation: Option<String>,
    /// Shell hosting the command
    pub shell: PathBuf,
    /// Start the shell as a login shell so profile customisations apply
    pub login_shell: bool,
    /// Mirror command output onto this process's stdout/stderr
    pub forward_output: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            elevation: Some("sudo".to_string()),
            shell: std::env::var_os("SHELL")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/bin/sh")),
            login_shell: true,
            forward_output: true,
        }
    }
}

impl RelayConfig {
    /// Run commands as-is (no elevation) under `shell`.
    pub fn unelevated(shell: impl Into<PathBuf>) -> Self {
        Self {
            elevation: None,
            shell: shell.into(),
            ..Self::default()
        }
    }

    pub fn with_forward_output(mut self, forward: bool) -> Self {
        self.forward_output = forward;
        self
    }
}

/// Launch parameters for the worker process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub args: Vec<String>,
    /// Added on top of the inherited environment
    pub env: HashMap<String, String>,
    pub cwd: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    pub relay: RelayConfig,
    pub worker: WorkerConfig,
    /// Per-request timeout; unset means a request waits indefinitely
    pub request_timeout_secs: Option<u64>,
}

impl HarnessConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_toml_str(content: &str) -> HarnessResult<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> HarnessResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&content)
    }

    pub fn with_relay(mut self, relay: RelayConfig) -> Self {
        self.relay = relay;
        self
    }

    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.worker.args.push(arg.into());
        self
    }

    pub fn with_env_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.worker.env.insert(key.into(), value.into());
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.worker.cwd = Some(cwd.into());
        self
    }

    pub fn with_request_timeout_secs(mut self, secs: u64) -> Self {
        self.request_timeout_secs = Some(secs);
        self
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_secs.map(Duration::from_secs)
    }
}

//! Message envelope exchanged with the worker.
//!
//! `{ cmd, status?, data }`. A request carries no status, a response does.
//! The response to a request named `X` is named `X_Response`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Suffix appended to a request command to name its response.
pub const RESPONSE_SUFFIX: &str = "_Response";

pub const INITIALIZE: &str = "initialize";
pub const VALIDATE: &str = "validate";
pub const PLAN: &str = "plan";
pub const APPLY: &str = "apply";
pub const IMPORT: &str = "import";
/// Reserved worker-originated command served by the privileged relay.
pub const SUDO_REQUEST: &str = "SUDO_REQUEST";

/// Name of the response correlated to `command`.
pub fn response_command(command: &str) -> String {
    format!("{}{}", command, RESPONSE_SUFFIX)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageStatus {
    Success,
    Error,
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageStatus::Success => write!(f, "SUCCESS"),
            MessageStatus::Error => write!(f, "ERROR"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub cmd: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<MessageStatus>,
    #[serde(default)]
    pub data: Value,
}

impl Message {
    pub fn request(cmd: impl Into<String>, data: Value) -> Self {
        Self {
            cmd: cmd.into(),
            status: None,
            data,
        }
    }

    /// Build the response correlated to `request_cmd`.
    pub fn response(request_cmd: &str, status: MessageStatus, data: Value) -> Self {
        Self {
            cmd: response_command(request_cmd),
            status: Some(status),
            data,
        }
    }

    pub fn is_response(&self) -> bool {
        self.status.is_some()
    }
}

/// Text carried by an ERROR response: strings verbatim, anything else as JSON.
pub fn payload_text(data: &Value) -> String {
    match data {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

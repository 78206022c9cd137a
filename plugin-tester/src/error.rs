//! Error taxonomy for the plugin tester.
//!
//! Setup and protocol failures are fatal to the call that observes them.
//! `Operation` is the expected channel for worker-reported failures; the
//! composite variants (`UnsupportedResource` through `DestroyVerification`)
//! carry the complete offending data set rather than the first failure.

use std::time::Duration;

use itertools::Itertools;
use thiserror::Error;

use crate::protocol::{Plan, ResourceOperation, ValidationResult};

/// A configuration whose imported record did not reproduce it.
#[derive(Debug, Clone, PartialEq)]
pub struct ImportMismatch {
    pub config: serde_json::Value,
    pub imported: Vec<serde_json::Value>,
    /// Keys of the configuration that were missing or different
    pub fields: Vec<String>,
}

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Message channel closed")]
    ChannelClosed,

    /// The worker answered with an ERROR status; the message is the payload text.
    #[error("{0}")]
    Operation(String),

    #[error("A '{0}' request is already awaiting its response")]
    RequestInFlight(String),

    #[error("Request '{command}' timed out after {after:?}")]
    Timeout { command: String, after: Duration },

    #[error("Resource types not declared by the plugin: {}", .0.join(", "))]
    UnsupportedResource(Vec<String>),

    #[error(
        "Validation failed for {} config(s): {}",
        .0.len(),
        .0.iter().map(|r| format!("{} {:?}", r.resource_type, r.errors)).join("; ")
    )]
    Validation(Vec<ValidationResult>),

    #[error(
        "Resources did not converge after apply, re-plan produced: {}",
        .0.iter().map(|p| format!("{}={}", p.resource_type, p.operation)).join(", ")
    )]
    Convergence(Vec<Plan>),

    #[error(
        "Import did not reproduce {} config(s): {}",
        .0.len(),
        .0.iter().map(|m| format!("{} (fields: {})", m.config, m.fields.join(", "))).join("; ")
    )]
    ImportMismatch(Vec<ImportMismatch>),

    #[error("Expected a DESTROY plan for '{resource_type}' but the plugin returned {operation}")]
    DestroyMismatch {
        resource_type: String,
        operation: ResourceOperation,
    },

    #[error("Destroy of '{resource_type}' was not effective: re-plan returned {operation} instead of CREATE")]
    DestroyVerification {
        resource_type: String,
        operation: ResourceOperation,
    },

    #[error("Plan inspection failed: {0}")]
    PlanInspection(#[source] anyhow::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Config parse error: {0}")]
    Config(#[from] toml::de::Error),
}

/// Result type for harness operations
pub type HarnessResult<T> = Result<T, HarnessError>;

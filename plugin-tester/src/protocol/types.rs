//! Typed payloads for the protocol commands.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::message::MessageStatus;

/// A resource configuration: a declared `type` plus arbitrary properties.
///
/// The harness never mutates a configuration; it only forwards it to the
/// worker and compares it against what the worker reports back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceConfig {
    #[serde(rename = "type")]
    pub resource_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(flatten)]
    pub properties: Map<String, Value>,
}

impl ResourceConfig {
    pub fn new(resource_type: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            name: None,
            properties: Map::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// `type` or `type.name`, used in logs and reports.
    pub fn id(&self) -> String {
        match &self.name {
            Some(name) => format!("{}.{}", self.resource_type, name),
            None => self.resource_type.clone(),
        }
    }

    /// Every field as it appears on the wire, `type` and `name` included.
    pub fn fields(&self) -> Map<String, Value> {
        let mut fields = Map::new();
        fields.insert("type".to_string(), Value::String(self.resource_type.clone()));
        if let Some(name) = &self.name {
            fields.insert("name".to_string(), Value::String(name.clone()));
        }
        for (key, value) in &self.properties {
            fields.insert(key.clone(), value.clone());
        }
        fields
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceDefinition {
    #[serde(rename = "type")]
    pub resource_type: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResponse {
    pub resource_definitions: Vec<ResourceDefinition>,
}

impl InitializeResponse {
    pub fn declares(&self, resource_type: &str) -> bool {
        self.resource_definitions
            .iter()
            .any(|d| d.resource_type == resource_type)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidateRequest {
    pub configs: Vec<ResourceConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    pub resource_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_name: Option<String>,
    pub is_valid: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateResponse {
    pub validation_results: Vec<ValidationResult>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResourceOperation {
    Create,
    Destroy,
    Modify,
    Noop,
}

impl fmt::Display for ResourceOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResourceOperation::Create => "CREATE",
            ResourceOperation::Destroy => "DESTROY",
            ResourceOperation::Modify => "MODIFY",
            ResourceOperation::Noop => "NOOP",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ParameterOperation {
    Add,
    Remove,
    Modify,
    Noop,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParameterChange {
    pub name: String,
    pub operation: ParameterOperation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_value: Option<Value>,
}

/// Desired and/or current state handed to the worker's planner.
///
/// `is_stateful` with only `state` set asks for a destroy-oriented plan that
/// treats the configuration as what currently exists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desired: Option<ResourceConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<ResourceConfig>,
    pub is_stateful: bool,
}

impl PlanRequest {
    pub fn desired(config: ResourceConfig) -> Self {
        Self {
            desired: Some(config),
            state: None,
            is_stateful: false,
        }
    }

    pub fn from_existing_state(config: ResourceConfig) -> Self {
        Self {
            desired: None,
            state: Some(config),
            is_stateful: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    pub plan_id: String,
    pub resource_type: String,
    pub operation: ResourceOperation,
    #[serde(default)]
    pub parameters: Vec<ParameterChange>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyRequest {
    pub plan_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportRequest {
    pub config: ResourceConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportResponse {
    pub request: ResourceConfig,
    pub result: Vec<Map<String, Value>>,
}

/// Spawn options a worker may pass with a sudo request.
///
/// Options the relay controls itself (`detached`, `shell`, `stdio`) are
/// accepted and land in `ignored`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SudoSpawnOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gid: Option<u32>,
    /// Milliseconds before the command is killed and reported as failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(flatten)]
    pub ignored: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SudoRequest {
    pub command: String,
    #[serde(default)]
    pub options: SudoSpawnOptions,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SudoResult {
    pub status: MessageStatus,
    /// Combined stdout and stderr in arrival order
    pub data: String,
}

//! Payload validation capability.
//!
//! The core only sees [`MessageValidator`]; which engine checks a payload is
//! up to the caller. [`JsonSchemaValidator`] is the stock implementation and
//! [`ProtocolSchemas::builtin`] wires it to the envelope and sudo schemas.

use std::fmt;
use std::sync::Arc;

use jsonschema::{Draft, JSONSchema};
use once_cell::sync::Lazy;
use serde_json::{json, Value};

use crate::error::{HarnessError, HarnessResult};

/// One reason a payload failed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaIssue {
    /// JSON pointer into the payload
    pub path: String,
    pub message: String,
}

impl fmt::Display for SchemaIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.path.is_empty() {
            write!(f, "{}", self.message)
        } else {
            write!(f, "{}: {}", self.path, self.message)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaCheck {
    pub valid: bool,
    pub issues: Vec<SchemaIssue>,
}

impl SchemaCheck {
    pub fn ok() -> Self {
        Self {
            valid: true,
            issues: Vec::new(),
        }
    }

    pub fn failed(issues: Vec<SchemaIssue>) -> Self {
        Self {
            valid: false,
            issues,
        }
    }

    /// Turn a failed check into a `ProtocolViolation` naming `what` was checked.
    pub fn into_result(self, what: &str) -> HarnessResult<()> {
        if self.valid {
            return Ok(());
        }
        let details = self
            .issues
            .iter()
            .map(|i| i.to_string())
            .collect::<Vec<_>>()
            .join("; ");
        Err(HarnessError::ProtocolViolation(format!(
            "{} failed schema validation: {}",
            what, details
        )))
    }
}

/// Validates an untyped payload.
pub trait MessageValidator: Send + Sync {
    fn validate(&self, payload: &Value) -> SchemaCheck;
}

/// [`MessageValidator`] backed by a compiled draft-07 JSON schema.
pub struct JsonSchemaValidator {
    name: String,
    compiled: JSONSchema,
}

impl fmt::Debug for JsonSchemaValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JsonSchemaValidator")
            .field("name", &self.name)
            .finish()
    }
}

impl JsonSchemaValidator {
    pub fn compile(name: impl Into<String>, schema: &Value) -> HarnessResult<Self> {
        let name = name.into();
        let compiled = JSONSchema::options()
            .with_draft(Draft::Draft7)
            .compile(schema)
            .map_err(|e| {
                HarnessError::Configuration(format!("Schema '{}' does not compile: {}", name, e))
            })?;
        Ok(Self { name, compiled })
    }
}

impl MessageValidator for JsonSchemaValidator {
    fn validate(&self, payload: &Value) -> SchemaCheck {
        match self.compiled.validate(payload) {
            Ok(()) => SchemaCheck::ok(),
            Err(errors) => SchemaCheck::failed(
                errors
                    .map(|e| SchemaIssue {
                        path: e.instance_path.to_string(),
                        message: e.to_string(),
                    })
                    .collect(),
            ),
        }
    }
}

/// Wire envelope: `{ cmd, status?, data }`.
pub static ENVELOPE_SCHEMA: Lazy<Value> = Lazy::new(|| {
    json!({
        "$schema": "http://json-schema.org/draft-07/schema#",
        "type": "object",
        "properties": {
            "cmd": { "type": "string", "minLength": 1 },
            "status": { "enum": ["SUCCESS", "ERROR"] },
            "data": {}
        },
        "required": ["cmd", "data"]
    })
});

/// Payload of a worker-originated `SUDO_REQUEST`.
pub static SUDO_REQUEST_SCHEMA: Lazy<Value> = Lazy::new(|| {
    json!({
        "$schema": "http://json-schema.org/draft-07/schema#",
        "type": "object",
        "properties": {
            "command": { "type": "string", "minLength": 1 },
            "options": {
                "type": "object",
                "properties": {
                    "cwd": { "type": "string" },
                    "uid": { "type": "integer", "minimum": 0 },
                    "gid": { "type": "integer", "minimum": 0 },
                    "timeout": { "type": "integer", "minimum": 0 },
                    "env": {
                        "type": "object",
                        "additionalProperties": { "type": "string" }
                    }
                }
            }
        },
        "required": ["command"]
    })
});

/// Validators consulted by the dispatch loop and the relay.
#[derive(Clone)]
pub struct ProtocolSchemas {
    pub envelope: Arc<dyn MessageValidator>,
    pub sudo_request: Arc<dyn MessageValidator>,
}

impl ProtocolSchemas {
    pub fn builtin() -> HarnessResult<Self> {
        Ok(Self {
            envelope: Arc::new(JsonSchemaValidator::compile("envelope", &ENVELOPE_SCHEMA)?),
            sudo_request: Arc::new(JsonSchemaValidator::compile(
                "sudo request",
                &SUDO_REQUEST_SCHEMA,
            )?),
        })
    }
}

impl fmt::Debug for ProtocolSchemas {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtocolSchemas").finish_non_exhaustive()
    }
}

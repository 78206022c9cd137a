//! Reference worker plugin.
//!
//! Speaks the protocol over stdin/stdout with an in-memory resource store.
//! Used by the integration tests; behaviour is tuned through environment
//! variables:
//!
//! - `TEST_PLUGIN_TYPES`: comma separated resource types to declare (default `test`)
//! - `TEST_PLUGIN_NOISE`: number of unrelated messages emitted before each response
//! - `TEST_PLUGIN_SUDO_COMMAND`: command requested through `SUDO_REQUEST` on every apply
//! - `TEST_PLUGIN_FAULT`: `drift`, `ignore-destroy` or `import-drift`

use std::collections::HashMap;
use std::io::Write;

use anyhow::Context;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use plugin_tester::protocol::{
    response_command, ApplyRequest, ImportRequest, Message, MessageStatus, ParameterChange,
    ParameterOperation, PlanRequest, ResourceConfig, ResourceOperation, SudoResult,
    ValidateRequest, APPLY, IMPORT, INITIALIZE, PLAN, SUDO_REQUEST, VALIDATE,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fault {
    /// Applied state differs from what was planned
    Drift,
    /// DESTROY plans apply without removing anything
    IgnoreDestroy,
    /// Import reports a property value that was never applied
    ImportDrift,
}

impl Fault {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "drift" => Some(Fault::Drift),
            "ignore-destroy" => Some(Fault::IgnoreDestroy),
            "import-drift" => Some(Fault::ImportDrift),
            _ => None,
        }
    }
}

struct PendingPlan {
    operation: ResourceOperation,
    target: String,
    desired: Option<ResourceConfig>,
}

struct TestPlugin {
    types: Vec<String>,
    noise: usize,
    sudo_command: Option<String>,
    fault: Option<Fault>,
    store: HashMap<String, ResourceConfig>,
    plans: HashMap<String, PendingPlan>,
    input: std::io::Lines<std::io::StdinLock<'static>>,
}

impl TestPlugin {
    fn from_env() -> Self {
        let types = std::env::var("TEST_PLUGIN_TYPES")
            .unwrap_or_else(|_| "test".to_string())
            .split(',')
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();
        Self {
            types,
            noise: std::env::var("TEST_PLUGIN_NOISE")
                .ok()
                .and_then(|n| n.parse().ok())
                .unwrap_or(0),
            sudo_command: std::env::var("TEST_PLUGIN_SUDO_COMMAND").ok(),
            fault: std::env::var("TEST_PLUGIN_FAULT")
                .ok()
                .and_then(|f| Fault::parse(&f)),
            store: HashMap::new(),
            plans: HashMap::new(),
            input: std::io::stdin().lines(),
        }
    }

    fn run(&mut self) -> anyhow::Result<()> {
        info!(types = ?self.types, "test plugin ready");
        while let Some(line) = self.input.next() {
            let line = line.context("reading stdin")?;
            if line.trim().is_empty() {
                continue;
            }
            let message: Message = match serde_json::from_str(&line) {
                Ok(message) => message,
                Err(e) => {
                    warn!("ignoring undecodable input: {}", e);
                    continue;
                }
            };
            debug!(cmd = %message.cmd, "received");
            let outcome = self.handle(&message);
            self.emit_noise()?;
            let reply = match outcome {
                Ok(data) => Message::response(&message.cmd, MessageStatus::Success, data),
                Err(reason) => Message::response(&message.cmd, MessageStatus::Error, json!(reason)),
            };
            write_message(&reply)?;
        }
        Ok(())
    }

    fn handle(&mut self, message: &Message) -> Result<Value, String> {
        match message.cmd.as_str() {
            INITIALIZE => Ok(self.initialize()),
            VALIDATE => self.validate(decode(&message.data)?),
            PLAN => self.plan(decode(&message.data)?),
            APPLY => self.apply(decode(&message.data)?),
            IMPORT => self.import(decode(&message.data)?),
            other => Err(format!("Unknown command '{}'", other)),
        }
    }

    fn emit_noise(&self) -> anyhow::Result<()> {
        for i in 0..self.noise {
            write_message(&Message::request("log", json!(format!("noise {}", i))))?;
            write_message(&Message::response(
                "unrelated",
                MessageStatus::Success,
                json!({}),
            ))?;
        }
        Ok(())
    }

    fn initialize(&self) -> Value {
        let definitions: Vec<Value> = self
            .types
            .iter()
            .map(|t| json!({"type": t, "dependencies": []}))
            .collect();
        json!({ "resourceDefinitions": definitions })
    }

    fn validate(&self, request: ValidateRequest) -> Result<Value, String> {
        let results: Vec<Value> = request
            .configs
            .iter()
            .map(|config| {
                let mut errors = Vec::new();
                if !self.types.contains(&config.resource_type) {
                    errors.push(format!("Unknown resource type '{}'", config.resource_type));
                }
                if let Some(prop_b) = config.properties.get("propB") {
                    if !prop_b.is_number() {
                        errors.push("propB must be a number".to_string());
                    }
                }
                json!({
                    "resourceType": config.resource_type,
                    "resourceName": config.name,
                    "isValid": errors.is_empty(),
                    "errors": errors,
                })
            })
            .collect();
        Ok(json!({ "validationResults": results }))
    }

    fn refresh(&self, config: &ResourceConfig) -> Result<Option<ResourceConfig>, String> {
        if config.properties.contains_key("propD") {
            return Err("Prop D is included".to_string());
        }
        Ok(self.store.get(&config.id()).cloned())
    }

    fn plan(&mut self, request: PlanRequest) -> Result<Value, String> {
        let (operation, target, resource_type, parameters, desired) =
            match (request.desired, request.state) {
                (Some(desired), _) => {
                    let current = self.refresh(&desired)?;
                    let parameters = diff(current.as_ref(), &desired);
                    let operation = match current {
                        None => ResourceOperation::Create,
                        Some(_) if parameters.iter().all(|p| p.operation == ParameterOperation::Noop) => {
                            ResourceOperation::Noop
                        }
                        Some(_) => ResourceOperation::Modify,
                    };
                    (operation, desired.id(), desired.resource_type.clone(), parameters, Some(desired))
                }
                (None, Some(state)) if request.is_stateful => {
                    let operation = match self.refresh(&state)? {
                        Some(_) => ResourceOperation::Destroy,
                        None => ResourceOperation::Noop,
                    };
                    (operation, state.id(), state.resource_type.clone(), Vec::new(), None)
                }
                _ => return Err("A plan needs a desired config or a stateful current state".to_string()),
            };

        let plan_id = uuid::Uuid::new_v4().to_string();
        self.plans.insert(
            plan_id.clone(),
            PendingPlan {
                operation,
                target,
                desired,
            },
        );
        Ok(json!({
            "planId": plan_id,
            "resourceType": resource_type,
            "operation": operation,
            "parameters": parameters,
        }))
    }

    fn apply(&mut self, request: ApplyRequest) -> Result<Value, String> {
        if let Some(command) = self.sudo_command.clone() {
            let result = self.request_sudo(&command)?;
            if result.status == MessageStatus::Error {
                return Err(format!("Sudo command failed: {}", result.data.trim()));
            }
        }

        let plan = self
            .plans
            .remove(&request.plan_id)
            .ok_or_else(|| format!("Unknown plan '{}'", request.plan_id))?;
        match plan.operation {
            ResourceOperation::Create | ResourceOperation::Modify => {
                let Some(mut desired) = plan.desired else {
                    return Err("Plan carries no desired state".to_string());
                };
                if self.fault == Some(Fault::Drift) {
                    desired.properties.insert("propA".to_string(), json!("drifted"));
                }
                self.store.insert(plan.target, desired);
            }
            ResourceOperation::Destroy => {
                if self.fault != Some(Fault::IgnoreDestroy) {
                    self.store.remove(&plan.target);
                }
            }
            ResourceOperation::Noop => {}
        }
        Ok(Value::Null)
    }

    fn request_sudo(&mut self, command: &str) -> Result<SudoResult, String> {
        write_message(&Message::request(
            SUDO_REQUEST,
            json!({"command": command, "options": {}}),
        ))
        .map_err(|e| e.to_string())?;

        let expected = response_command(SUDO_REQUEST);
        while let Some(line) = self.input.next() {
            let line = line.map_err(|e| e.to_string())?;
            let Ok(message) = serde_json::from_str::<Message>(&line) else {
                continue;
            };
            if message.cmd == expected {
                return decode(&message.data);
            }
            warn!(cmd = %message.cmd, "unexpected message while waiting for sudo result");
        }
        Err("Controller closed the channel before answering the sudo request".to_string())
    }

    fn import(&self, request: ImportRequest) -> Result<Value, String> {
        let records: Vec<Map<String, Value>> = self
            .refresh(&request.config)?
            .map(|current| {
                let mut fields = current.fields();
                if self.fault == Some(Fault::ImportDrift) {
                    fields.insert("propB".to_string(), json!("drifted"));
                }
                fields
            })
            .into_iter()
            .collect();
        Ok(json!({ "request": request.config, "result": records }))
    }
}

fn diff(current: Option<&ResourceConfig>, desired: &ResourceConfig) -> Vec<ParameterChange> {
    let desired_fields = desired.properties.clone();
    let current_fields = current.map(|c| c.properties.clone()).unwrap_or_default();

    let mut changes: Vec<ParameterChange> = desired_fields
        .iter()
        .map(|(name, new_value)| {
            let previous = current_fields.get(name).cloned();
            let operation = match &previous {
                None => ParameterOperation::Add,
                Some(prev) if prev == new_value => ParameterOperation::Noop,
                Some(_) => ParameterOperation::Modify,
            };
            ParameterChange {
                name: name.clone(),
                operation,
                previous_value: previous,
                new_value: Some(new_value.clone()),
            }
        })
        .collect();

    for (name, previous) in &current_fields {
        if !desired_fields.contains_key(name) {
            changes.push(ParameterChange {
                name: name.clone(),
                operation: ParameterOperation::Remove,
                previous_value: Some(previous.clone()),
                new_value: None,
            });
        }
    }
    changes
}

fn decode<T: serde::de::DeserializeOwned>(data: &Value) -> Result<T, String> {
    serde_json::from_value(data.clone()).map_err(|e| format!("Malformed payload: {}", e))
}

fn write_message(message: &Message) -> anyhow::Result<()> {
    let line = serde_json::to_string(message)?;
    let mut out = std::io::stdout().lock();
    writeln!(out, "{}", line)?;
    out.flush()?;
    Ok(())
}

fn main() -> anyhow::Result<()> {
    plugin_tester::logging::init("test_plugin=info");
    TestPlugin::from_env().run()
}

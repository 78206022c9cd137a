//! Lifecycle orchestration.
//!
//! [`PluginTester`] exposes one call per protocol command plus the two
//! composite checks, [`PluginTester::full_test`] and
//! [`PluginTester::uninstall`]. Composite operations run strictly in order,
//! awaiting each round trip before issuing the next, and stop at the first
//! failed assertion.

use std::fmt;
use std::path::Path;

use itertools::Itertools;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::config::HarnessConfig;
use crate::error::{HarnessError, HarnessResult, ImportMismatch};
use crate::protocol::{
    ApplyRequest, ImportRequest, ImportResponse, InitializeResponse, Plan, PlanRequest,
    ProtocolSchemas, ResourceConfig, ResourceOperation, ValidateRequest, ValidateResponse, APPLY,
    IMPORT, INITIALIZE, PLAN, VALIDATE,
};
use crate::supervisor::WorkerProcess;

/// Where a configuration is in its journey through [`PluginTester::full_test`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ResourceStage {
    Unknown,
    Validated,
    Planned,
    Applied,
    Converged,
    Imported,
    Destroyed,
    DestroyVerified,
    /// The run aborted; [`ResourceReport::reached`] holds the last stage passed
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResourceReport {
    pub id: String,
    pub stage: ResourceStage,
    pub reached: ResourceStage,
}

/// Per-resource stages and the plans applied during a lifecycle run.
#[derive(Debug, Clone, PartialEq)]
pub struct LifecycleReport {
    pub resources: Vec<ResourceReport>,
    /// Plans produced before apply, in input order
    pub plans: Vec<Plan>,
}

impl LifecycleReport {
    fn new(configs: &[ResourceConfig]) -> Self {
        Self {
            resources: configs
                .iter()
                .map(|c| ResourceReport {
                    id: c.id(),
                    stage: ResourceStage::Unknown,
                    reached: ResourceStage::Unknown,
                })
                .collect(),
            plans: Vec::new(),
        }
    }

    fn advance(&mut self, index: usize, stage: ResourceStage) {
        if let Some(resource) = self.resources.get_mut(index) {
            debug!(resource = %resource.id, from = ?resource.stage, to = ?stage, "stage transition");
            resource.stage = stage;
            resource.reached = stage;
        }
    }

    fn abort(&mut self) {
        for resource in &mut self.resources {
            warn!(resource = %resource.id, last_stage = ?resource.reached, "lifecycle aborted");
            resource.stage = ResourceStage::Failed;
        }
    }

    pub fn failed(&self) -> bool {
        self.resources.iter().any(|r| r.stage == ResourceStage::Failed)
    }

    fn advance_all(&mut self, stage: ResourceStage) {
        for index in 0..self.resources.len() {
            self.advance(index, stage);
        }
    }
}

type PlanInspector = Box<dyn FnOnce(&[Plan]) -> anyhow::Result<()> + Send>;

#[derive(Default)]
pub struct FullTestOptions {
    pub skip_uninstall: bool,
    pub skip_import: bool,
    /// Receives every plan before any is applied
    pub validate_plan: Option<PlanInspector>,
}

impl fmt::Debug for FullTestOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FullTestOptions")
            .field("skip_uninstall", &self.skip_uninstall)
            .field("skip_import", &self.skip_import)
            .field("validate_plan", &self.validate_plan.is_some())
            .finish()
    }
}

impl FullTestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn skip_uninstall(mut self) -> Self {
        self.skip_uninstall = true;
        self
    }

    pub fn skip_import(mut self) -> Self {
        self.skip_import = true;
        self
    }

    pub fn with_plan_validation(
        mut self,
        inspect: impl FnOnce(&[Plan]) -> anyhow::Result<()> + Send + 'static,
    ) -> Self {
        self.validate_plan = Some(Box::new(inspect));
        self
    }
}

/// Drives one worker plugin through its resource lifecycle.
#[derive(Debug)]
pub struct PluginTester {
    process: WorkerProcess,
}

impl PluginTester {
    pub fn spawn(executable: impl AsRef<Path>, config: &HarnessConfig) -> HarnessResult<Self> {
        Ok(Self {
            process: WorkerProcess::spawn(executable, config)?,
        })
    }

    pub fn spawn_with_schemas(
        executable: impl AsRef<Path>,
        config: &HarnessConfig,
        schemas: ProtocolSchemas,
    ) -> HarnessResult<Self> {
        Ok(Self {
            process: WorkerProcess::spawn_with_schemas(executable, config, schemas)?,
        })
    }

    pub fn process(&self) -> &WorkerProcess {
        &self.process
    }

    async fn request<Req, Resp>(&self, command: &str, payload: &Req) -> HarnessResult<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let data = self
            .process
            .correlator()
            .send(command, serde_json::to_value(payload)?)
            .await?;
        serde_json::from_value(data).map_err(|e| {
            HarnessError::ProtocolViolation(format!("'{}' response does not match its type: {}", command, e))
        })
    }

    pub async fn initialize(&self) -> HarnessResult<InitializeResponse> {
        self.request(INITIALIZE, &Map::new()).await
    }

    pub async fn validate(&self, configs: &[ResourceConfig]) -> HarnessResult<ValidateResponse> {
        let request = ValidateRequest {
            configs: configs.to_vec(),
        };
        self.request(VALIDATE, &request).await
    }

    pub async fn plan(&self, request: PlanRequest) -> HarnessResult<Plan> {
        self.request(PLAN, &request).await
    }

    pub async fn apply(&self, plan_id: &str) -> HarnessResult<()> {
        let request = ApplyRequest {
            plan_id: plan_id.to_string(),
        };
        let _: Value = self.request(APPLY, &request).await?;
        Ok(())
    }

    pub async fn import(&self, config: &ResourceConfig) -> HarnessResult<ImportResponse> {
        let request = ImportRequest {
            config: config.clone(),
        };
        self.request(IMPORT, &request).await
    }

    /// Run the complete lifecycle against `configs` and verify each step.
    ///
    /// initialize, validate, plan, apply, re-plan (must be NOOP), optional
    /// import (must reproduce the config), then uninstall in reverse order.
    pub async fn full_test(
        &self,
        configs: &[ResourceConfig],
        options: FullTestOptions,
    ) -> HarnessResult<LifecycleReport> {
        let (report, outcome) = self.full_test_with_report(configs, options).await;
        outcome.map(|()| report)
    }

    /// Same as [`PluginTester::full_test`], but the report comes back on failure
    /// too, with every resource marked [`ResourceStage::Failed`].
    pub async fn full_test_with_report(
        &self,
        configs: &[ResourceConfig],
        options: FullTestOptions,
    ) -> (LifecycleReport, HarnessResult<()>) {
        info!(count = configs.len(), ?options, "starting full lifecycle test");
        let mut report = LifecycleReport::new(configs);
        let outcome = self.run_full_test(configs, options, &mut report).await;
        match &outcome {
            Ok(()) => info!("full lifecycle test passed"),
            Err(e) => {
                warn!("full lifecycle test failed: {}", e);
                report.abort();
            }
        }
        (report, outcome)
    }

    async fn run_full_test(
        &self,
        configs: &[ResourceConfig],
        options: FullTestOptions,
        report: &mut LifecycleReport,
    ) -> HarnessResult<()> {
        let catalogue = self.initialize().await?;
        let unsupported: Vec<String> = configs
            .iter()
            .filter(|c| !catalogue.declares(&c.resource_type))
            .map(|c| c.resource_type.clone())
            .unique()
            .collect();
        if !unsupported.is_empty() {
            return Err(HarnessError::UnsupportedResource(unsupported));
        }

        let validation = self.validate(configs).await?;
        let invalid: Vec<_> = validation
            .validation_results
            .into_iter()
            .filter(|r| !r.is_valid)
            .collect();
        if !invalid.is_empty() {
            return Err(HarnessError::Validation(invalid));
        }
        report.advance_all(ResourceStage::Validated);

        let mut plans = Vec::with_capacity(configs.len());
        for (index, config) in configs.iter().enumerate() {
            let plan = self.plan(PlanRequest::desired(config.clone())).await?;
            info!(resource = %config.id(), operation = %plan.operation, "planned");
            report.advance(index, ResourceStage::Planned);
            plans.push(plan);
        }

        if let Some(inspect) = options.validate_plan {
            inspect(&plans).map_err(HarnessError::PlanInspection)?;
        }

        for (index, plan) in plans.iter().enumerate() {
            self.apply(&plan.plan_id).await?;
            report.advance(index, ResourceStage::Applied);
        }
        report.plans = plans;

        let mut unconverged = Vec::new();
        for (index, config) in configs.iter().enumerate() {
            let plan = self.plan(PlanRequest::desired(config.clone())).await?;
            if plan.operation == ResourceOperation::Noop {
                report.advance(index, ResourceStage::Converged);
            } else {
                unconverged.push(plan);
            }
        }
        if !unconverged.is_empty() {
            return Err(HarnessError::Convergence(unconverged));
        }

        if !options.skip_import {
            let mut mismatches = Vec::new();
            for (index, config) in configs.iter().enumerate() {
                let response = self.import(config).await?;
                match import_mismatch(config, &response.result) {
                    Some(mismatch) => mismatches.push(mismatch),
                    None => report.advance(index, ResourceStage::Imported),
                }
            }
            if !mismatches.is_empty() {
                return Err(HarnessError::ImportMismatch(mismatches));
            }
        }

        if !options.skip_uninstall {
            for (index, config) in configs.iter().enumerate().rev() {
                self.destroy(config).await?;
                report.advance(index, ResourceStage::Destroyed);
                self.verify_destroyed(config).await?;
                report.advance(index, ResourceStage::DestroyVerified);
            }
        }

        Ok(())
    }

    /// Destroy every configuration and verify nothing is left behind.
    pub async fn uninstall(&self, configs: &[ResourceConfig]) -> HarnessResult<()> {
        for config in configs {
            self.destroy(config).await?;
            self.verify_destroyed(config).await?;
        }
        Ok(())
    }

    /// Plan from existing state, require DESTROY, apply it.
    async fn destroy(&self, config: &ResourceConfig) -> HarnessResult<()> {
        let plan = self
            .plan(PlanRequest::from_existing_state(config.clone()))
            .await?;
        if plan.operation != ResourceOperation::Destroy {
            return Err(HarnessError::DestroyMismatch {
                resource_type: config.resource_type.clone(),
                operation: plan.operation,
            });
        }
        self.apply(&plan.plan_id).await?;
        info!(resource = %config.id(), "destroyed");
        Ok(())
    }

    /// After a destroy, planning the config as desired state must need a CREATE.
    async fn verify_destroyed(&self, config: &ResourceConfig) -> HarnessResult<()> {
        let plan = self.plan(PlanRequest::desired(config.clone())).await?;
        if plan.operation != ResourceOperation::Create {
            return Err(HarnessError::DestroyVerification {
                resource_type: config.resource_type.clone(),
                operation: plan.operation,
            });
        }
        Ok(())
    }

    pub async fn kill(&mut self) -> HarnessResult<()> {
        self.process.kill().await
    }
}

/// `None` when `imported` is a single record reproducing every field of `config`.
fn import_mismatch(
    config: &ResourceConfig,
    imported: &[Map<String, Value>],
) -> Option<ImportMismatch> {
    let expected = config.fields();
    let fields: Vec<String> = match imported {
        [record] => expected
            .iter()
            .filter(|(key, value)| record.get(key.as_str()) != Some(*value))
            .map(|(key, _)| key.clone())
            .collect(),
        _ => expected.keys().cloned().collect(),
    };
    if fields.is_empty() {
        return None;
    }
    Some(ImportMismatch {
        config: Value::Object(expected),
        imported: imported.iter().cloned().map(Value::Object).collect(),
        fields,
    })
}

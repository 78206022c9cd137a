// Plugin Tester Library
// Drives a worker plugin through its resource lifecycle over a message channel

pub mod channel;
pub mod config;
pub mod correlator;
pub mod dispatch;
pub mod error;
pub mod logging;
pub mod protocol;
pub mod relay;
pub mod supervisor;
pub mod tester;

pub use crate::config::{HarnessConfig, RelayConfig, WorkerConfig};
pub use crate::error::{HarnessError, HarnessResult};
pub use crate::protocol::{Plan, PlanRequest, ResourceConfig, ResourceOperation};
pub use crate::supervisor::WorkerProcess;
pub use crate::tester::{FullTestOptions, LifecycleReport, PluginTester, ResourceReport, ResourceStage};

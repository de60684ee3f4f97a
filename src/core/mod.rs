//! 核心编排层：数据模型、错误类型、主控编排器

pub mod error;
pub mod orchestrator;
pub mod types;

pub use error::PilotError;
pub use orchestrator::{Orchestrator, REASON_STEP_LIMIT};
pub use types::{
    ActionKind, ExecutionResult, ExecutionStatus, PlannedStep, Region, ReportMode, RunReport, RunStatus,
    StepReport, ValidationMethod, ValidationReport, ValidationStatus,
};

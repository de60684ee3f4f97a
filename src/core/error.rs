//! 编排层错误类型
//!
//! 只有配置类错误（未注册后端、缺少能力、非法计划）会以 Err 形式离开 Orchestrator；
//! 单次尝试的失败一律转成结构化结果，不会向上传播。

use thiserror::Error;

use crate::backends::Capability;

#[derive(Error, Debug)]
pub enum PilotError {
    #[error("unregistered backend: {0}")]
    UnregisteredBackend(String),

    #[error("backend {backend} does not support {capability}")]
    MissingCapability {
        backend: String,
        capability: Capability,
    },

    #[error("no execution backend configured")]
    NoExecutionBackend,

    #[error("invalid plan: {0}")]
    InvalidPlan(String),

    #[error("planner backend failed: {0}")]
    PlannerBackend(String),

    #[error("Config error: {0}")]
    ConfigError(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl PilotError {
    /// 配置类错误：运行前即失败，不参与重试
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            PilotError::UnregisteredBackend(_)
                | PilotError::MissingCapability { .. }
                | PilotError::NoExecutionBackend
                | PilotError::ConfigError(_)
        )
    }
}

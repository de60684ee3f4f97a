//! 后端抽象（能力契约）
//!
//! 屏幕控制工具、视觉检测器、能力型服务都实现 Backend trait（detect / execute / validate / plan），
//! 由 BackendRegistry 按名注册与查找；未实现的能力默认返回 BackendError::Unsupported。

pub mod contract;
pub mod filesystem;
pub mod mock;
pub mod registry;

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::core::{PlannedStep, Region, ValidationStatus};
use crate::executor::StepAction;

pub use contract::{Capability, IntegrationContract, IntegrationMode, TaskDomain, DEFAULT_CAPABILITIES};
pub use filesystem::FilesystemBackend;
pub use mock::MockBackend;
pub use registry::{global, global_snapshot, register_global, restore_global, BackendRegistry};

/// 后端调用错误：在调用点即被转换为结构化失败结果
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("capability not supported: {0}")]
    Unsupported(Capability),

    #[error("{0}")]
    Failed(String),
}

/// 检测请求：当前屏幕截图 + 步骤描述
#[derive(Debug, Clone, Serialize)]
pub struct DetectRequest {
    pub step_id: u32,
    pub description: String,
    pub image: Option<PathBuf>,
}

/// 检测器返回的单个候选元素
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedElement {
    pub label: String,
    pub region: Region,
    pub confidence: f32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Detection {
    /// 检测器直接给出的目标
    pub region: Option<Region>,
    #[serde(default)]
    pub candidates: Vec<DetectedElement>,
    #[serde(default)]
    pub raw: Value,
}

impl Detection {
    pub fn at(region: Region) -> Self {
        Self {
            region: Some(region),
            ..Self::default()
        }
    }

    /// 首个可用区域：优先 region，其次按顺序取候选
    pub fn first_viable(&self) -> Option<Region> {
        self.region
            .filter(Region::is_viable)
            .or_else(|| {
                self.candidates
                    .iter()
                    .map(|c| c.region)
                    .find(Region::is_viable)
            })
    }
}

/// 动作请求；autonomous=true 表示把整条任务交给后端自行处理（FULL 模式）
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionRequest {
    pub step_id: u32,
    pub description: String,
    pub action: StepAction,
    pub region: Option<Region>,
    pub autonomous: bool,
}

impl ActionRequest {
    pub fn task(prompt: &str) -> Self {
        Self {
            step_id: 0,
            description: prompt.to_string(),
            action: crate::executor::classify_action(prompt),
            region: None,
            autonomous: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Success,
    Failed,
    Noop,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionOutcome {
    pub status: ActionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,
}

impl ActionOutcome {
    pub fn new(status: ActionStatus) -> Self {
        Self {
            status,
            detail: None,
            payload: Value::Null,
        }
    }

    pub fn success() -> Self {
        Self::new(ActionStatus::Success)
    }

    pub fn failed(detail: impl Into<String>) -> Self {
        Self::new(ActionStatus::Failed).with_detail(detail)
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }
}

/// 后端自校验请求
#[derive(Debug, Clone, Serialize)]
pub struct ValidateRequest {
    pub step_id: u32,
    pub description: String,
    pub before: Option<PathBuf>,
    pub after: Option<PathBuf>,
    pub region: Option<Region>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BackendVerdict {
    pub status: ValidationStatus,
    pub detail: Map<String, Value>,
}

/// 能力契约：所有后端都以此接入编排器
///
/// integration_mode / capabilities / domains 为静态元数据，仅在注册时读取一次。
#[async_trait]
pub trait Backend: Send + Sync {
    /// 声明的控制程度；None 表示使用默认 PARTIAL
    fn integration_mode(&self) -> Option<IntegrationMode> {
        None
    }

    /// 声明的能力集合；None 表示使用默认 {detect, execute, validate}
    fn capabilities(&self) -> Option<Vec<Capability>> {
        None
    }

    /// 能力型后端负责的任务领域（如文件系统）；视觉类后端为空
    fn domains(&self) -> Vec<TaskDomain> {
        Vec::new()
    }

    async fn detect(&self, _request: &DetectRequest) -> Result<Detection, BackendError> {
        Err(BackendError::Unsupported(Capability::Detect))
    }

    async fn execute(&self, request: &ActionRequest) -> Result<ActionOutcome, BackendError>;

    async fn validate(&self, _request: &ValidateRequest) -> Result<BackendVerdict, BackendError> {
        Err(BackendError::Unsupported(Capability::Validate))
    }

    async fn plan(&self, _prompt: &str) -> Result<Vec<PlannedStep>, BackendError> {
        Err(BackendError::Unsupported(Capability::Plan))
    }
}

//! 运行期数据模型：步骤、单次执行结果、校验报告、运行报告
//!
//! ExecutionResult / ValidationReport 一经创建不再修改：每次重试都会产生新的实例。
//! 所有结构都可直接序列化为 JSON，供 CLI 输出运行报告。

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::backends::IntegrationMode;

/// 屏幕矩形区域（UI 目标）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Region {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// 宽高均大于 0 才算可用的检测结果
    pub fn is_viable(&self) -> bool {
        self.width > 0 && self.height > 0
    }

    pub fn center(&self) -> (u32, u32) {
        (self.x + self.width / 2, self.y + self.height / 2)
    }

    /// 裁剪到 (width, height) 画布内；完全落在画布外时返回 None
    pub fn clamp_to(&self, bounds: (u32, u32)) -> Option<Region> {
        let (bw, bh) = bounds;
        if self.x >= bw || self.y >= bh {
            return None;
        }
        let width = self.width.min(bw - self.x);
        let height = self.height.min(bh - self.y);
        let clamped = Region::new(self.x, self.y, width, height);
        clamped.is_viable().then_some(clamped)
    }

    /// 四周各扩展 pad 像素后再裁剪到画布内
    pub fn padded(&self, pad: u32, bounds: (u32, u32)) -> Option<Region> {
        let x = self.x.saturating_sub(pad);
        let y = self.y.saturating_sub(pad);
        let right = self.x.saturating_add(self.width).saturating_add(pad);
        let bottom = self.y.saturating_add(self.height).saturating_add(pad);
        Region::new(x, y, right - x, bottom - y).clamp_to(bounds)
    }
}

/// Planner 产出的单个步骤；step_id 在一次运行内唯一，重规划后不保证连续
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedStep {
    pub step_id: u32,
    pub description: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
}

impl PlannedStep {
    pub fn new(step_id: u32, description: impl Into<String>) -> Self {
        Self {
            step_id,
            description: description.into(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// 步骤自带的目标框（metadata.bbox），存在时跳过检测
    pub fn explicit_region(&self) -> Option<Region> {
        self.metadata
            .get("bbox")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

/// 实际下发的动作类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Click,
    Type,
    Scroll,
    Navigate,
    /// 整段描述交给能力型后端（如文件系统操作）
    Capability,
    Noop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Success,
    Failed,
    /// 后端不具备所需能力，动作未能下发
    Aborted,
}

/// 单次尝试的执行结果（重试产生新实例）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub step_id: u32,
    pub backend_used: String,
    pub decided_action: ActionKind,
    pub status: ExecutionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<Region>,
    pub screenshot_before: Option<PathBuf>,
    pub screenshot_after: Option<PathBuf>,
    #[serde(default)]
    pub raw: Value,
}

impl ExecutionResult {
    pub fn succeeded(&self) -> bool {
        self.status == ExecutionStatus::Success
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStatus {
    Pass,
    Fail,
}

/// 得出结论所依据的信号
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationMethod {
    Pixel,
    Ocr,
    Region,
    SpecialCase,
    /// 执行失败 / 缺少截图等前置检查
    Precheck,
    /// 后端自校验
    Backend,
}

/// 校验报告：detail 平铺到 JSON 顶层（reason / diff / matched 等）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub step_id: u32,
    #[serde(rename = "validation_status")]
    pub status: ValidationStatus,
    pub method: ValidationMethod,
    #[serde(flatten)]
    pub detail: Map<String, Value>,
}

impl ValidationReport {
    pub fn pass(step_id: u32, method: ValidationMethod) -> Self {
        Self {
            step_id,
            status: ValidationStatus::Pass,
            method,
            detail: Map::new(),
        }
    }

    pub fn fail(step_id: u32, method: ValidationMethod) -> Self {
        Self {
            step_id,
            status: ValidationStatus::Fail,
            method,
            detail: Map::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.detail.insert(key.to_string(), value.into());
        self
    }

    pub fn passed(&self) -> bool {
        self.status == ValidationStatus::Pass
    }

    pub fn reason(&self) -> Option<&str> {
        self.detail.get("reason").and_then(|v| v.as_str())
    }
}

/// 报告中的一条步骤记录：只保留最后一次尝试
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepReport {
    pub step: PlannedStep,
    pub execution: ExecutionResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationReport>,
    pub attempts: u32,
}

impl StepReport {
    pub fn passed(&self) -> bool {
        match &self.validation {
            Some(v) => v.passed(),
            None => self.execution.succeeded(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Failed,
}

/// 报告里的运行模式；Mcp 表示直接路由到能力型后端
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportMode {
    Full,
    Partial,
    Hybrid,
    Mcp,
}

impl From<IntegrationMode> for ReportMode {
    fn from(mode: IntegrationMode) -> Self {
        match mode {
            IntegrationMode::Full => ReportMode::Full,
            IntegrationMode::Partial => ReportMode::Partial,
            IntegrationMode::Hybrid => ReportMode::Hybrid,
        }
    }
}

/// 一次 run 的完整报告，由 Orchestrator 独占，run 结束时返回
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub user_prompt: String,
    pub overall_status: RunStatus,
    pub mode: ReportMode,
    pub steps: Vec<StepReport>,
    /// 无法继续执行的首个致命原因（如 "Planner error: ..."）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// FULL / MCP 模式下后端返回的说明
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl RunReport {
    pub fn new(user_prompt: impl Into<String>, mode: ReportMode) -> Self {
        Self {
            user_prompt: user_prompt.into(),
            overall_status: RunStatus::Failed,
            mode,
            steps: Vec::new(),
            reason: None,
            detail: None,
        }
    }

    pub fn aborted(user_prompt: impl Into<String>, mode: ReportMode, reason: impl Into<String>) -> Self {
        let mut report = Self::new(user_prompt, mode);
        report.reason = Some(reason.into());
        report
    }

    pub fn succeeded(&self) -> bool {
        self.overall_status == RunStatus::Success
    }

    /// 归约：无致命原因、至少一步、且每一步都通过才算成功
    pub fn finalize(mut self) -> Self {
        let all_passed = !self.steps.is_empty() && self.steps.iter().all(StepReport::passed);
        self.overall_status = if self.reason.is_none() && all_passed {
            RunStatus::Success
        } else {
            RunStatus::Failed
        };
        self
    }
}

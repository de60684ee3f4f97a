//! 步骤执行器：单步重试循环
//!
//! 每次尝试：before 截图 → 目标区域（显式 bbox / 检测 / 兜底）→ 推断动作 → execute → after 截图 → 校验。
//! 校验通过立即返回；尝试用尽后返回最后一次的结果，从不以 Err 结束。
//! 每次后端调用输出一条 JSON 审计日志。

pub mod action;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use serde_json::json;

use crate::backends::{
    ActionOutcome, ActionRequest, ActionStatus, Backend, BackendError, BackendRegistry, DetectRequest,
    Detection,
};
use crate::capture::{capture_evidence, ScreenCapture};
use crate::core::{
    ActionKind, ExecutionResult, ExecutionStatus, PlannedStep, Region, ValidationMethod,
    ValidationReport,
};
use crate::validator::Validator;

pub use action::{
    classify_action, classify_domain, first_cue, has_cue, quoted_literal, Cue, ScrollDirection,
    StepAction,
};

/// 单步最终结果：最后一次尝试的执行与校验
#[derive(Debug, Clone, Serialize)]
pub struct StepOutcome {
    pub execution: ExecutionResult,
    pub validation: ValidationReport,
    pub attempts: u32,
}

/// detect_and_execute 的结果（无校验、无重试）
#[derive(Debug, Clone, Serialize)]
pub struct DirectOutcome {
    pub detection: Option<Detection>,
    pub chosen_bbox: Region,
    pub execution: ExecutionResult,
}

/// 默认兜底区域：左上角 32x32
pub const DEFAULT_FALLBACK_REGION: Region = Region {
    x: 0,
    y: 0,
    width: 32,
    height: 32,
};

pub struct StepExecutor {
    detector: Option<(String, Arc<dyn Backend>)>,
    actuator: (String, Arc<dyn Backend>),
    screen: Arc<dyn ScreenCapture>,
    evidence_dir: PathBuf,
    fallback_region: Region,
}

impl StepExecutor {
    pub fn new(
        actuator_name: impl Into<String>,
        actuator: Arc<dyn Backend>,
        screen: Arc<dyn ScreenCapture>,
        evidence_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            detector: None,
            actuator: (actuator_name.into(), actuator),
            screen,
            evidence_dir: evidence_dir.into(),
            fallback_region: DEFAULT_FALLBACK_REGION,
        }
    }

    pub fn with_detector(mut self, name: impl Into<String>, backend: Arc<dyn Backend>) -> Self {
        self.detector = Some((name.into(), backend));
        self
    }

    pub fn with_fallback_region(mut self, region: Region) -> Self {
        self.fallback_region = region;
        self
    }

    pub fn actuator_name(&self) -> &str {
        &self.actuator.0
    }

    /// 按描述推断动作的重试循环
    pub async fn run_step(
        &self,
        step: &PlannedStep,
        validator: &dyn Validator,
        max_attempts: u32,
    ) -> StepOutcome {
        self.run_step_as(step, None, validator, max_attempts).await
    }

    /// 同 run_step；forced 不为 None 时忽略描述推断，固定下发该动作
    pub async fn run_step_as(
        &self,
        step: &PlannedStep,
        forced: Option<StepAction>,
        validator: &dyn Validator,
        max_attempts: u32,
    ) -> StepOutcome {
        let max_attempts = max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            // 每次尝试都重新截图
            let execution = self.attempt(step, forced.clone()).await;
            let validation = validator.validate_step(step, &execution).await;
            tracing::info!(
                step_id = step.step_id,
                attempt,
                max_attempts,
                status = ?execution.status,
                passed = validation.passed(),
                "step attempt finished"
            );
            if validation.passed() || attempt >= max_attempts {
                return StepOutcome {
                    execution,
                    validation,
                    attempts: attempt,
                };
            }
        }
    }

    async fn attempt(&self, step: &PlannedStep, forced: Option<StepAction>) -> ExecutionResult {
        let before = capture_evidence(
            self.screen.as_ref(),
            &self.evidence_dir,
            &format!("step{}_before", step.step_id),
        )
        .await;
        let region = self.resolve_region(step, before.as_deref()).await;
        let action = forced
            .unwrap_or_else(|| classify_action(&step.description))
            .dispatchable();
        let kind = action.kind();
        let request = ActionRequest {
            step_id: step.step_id,
            description: step.description.clone(),
            action,
            region: Some(region),
            autonomous: false,
        };
        let (name, backend) = &self.actuator;
        let result = call_execute(name, backend.as_ref(), &request).await;
        let after = capture_evidence(
            self.screen.as_ref(),
            &self.evidence_dir,
            &format!("step{}_after", step.step_id),
        )
        .await;

        let mut execution = execution_from(step.step_id, name, kind, result);
        execution.region = Some(region);
        execution.screenshot_before = before;
        execution.screenshot_after = after;
        execution
    }

    /// 显式 bbox 优先；否则调用检测器，失败或无可用结果时使用兜底区域
    async fn resolve_region(&self, step: &PlannedStep, image: Option<&Path>) -> Region {
        if let Some(region) = step.explicit_region() {
            return region;
        }
        let Some((name, detector)) = &self.detector else {
            return self.fallback_region;
        };
        let request = DetectRequest {
            step_id: step.step_id,
            description: step.description.clone(),
            image: image.map(Path::to_path_buf),
        };
        call_detect(name, detector.as_ref(), &request)
            .await
            .and_then(|d| d.first_viable())
            .unwrap_or(self.fallback_region)
    }

    /// 对一张图片检测一次、点击一次，不做校验与重试
    pub async fn detect_and_execute(&self, image: &Path) -> DirectOutcome {
        let request = DetectRequest {
            step_id: 0,
            description: "detect clickable target".to_string(),
            image: Some(image.to_path_buf()),
        };
        let detection = match &self.detector {
            Some((name, detector)) => call_detect(name, detector.as_ref(), &request).await,
            None => None,
        };
        let chosen_bbox = detection
            .as_ref()
            .and_then(Detection::first_viable)
            .unwrap_or(self.fallback_region);

        let action = ActionRequest {
            step_id: 0,
            description: "click detected target".to_string(),
            action: StepAction::Click,
            region: Some(chosen_bbox),
            autonomous: false,
        };
        let (name, backend) = &self.actuator;
        let result = call_execute(name, backend.as_ref(), &action).await;
        let mut execution = execution_from(0, name, ActionKind::Click, result);
        execution.region = Some(chosen_bbox);
        execution.screenshot_before = Some(image.to_path_buf());

        DirectOutcome {
            detection,
            chosen_bbox,
            execution,
        }
    }

    /// 步骤属于某个能力型后端的领域时直接交给它，否则走视觉重试循环
    pub async fn execute_with_mcp_or_visual(
        &self,
        step: &PlannedStep,
        registry: &BackendRegistry,
        validator: &dyn Validator,
        max_attempts: u32,
    ) -> StepOutcome {
        let routed = classify_domain(&step.description)
            .and_then(|domain| registry.capability_backend_for(domain));
        match routed {
            Some((name, backend)) => {
                tracing::info!(step_id = step.step_id, backend = %name, "routing step to capability backend");
                let execution = capability_call(&name, backend.as_ref(), step).await;
                let validation = capability_verdict(&execution);
                StepOutcome {
                    execution,
                    validation,
                    attempts: 1,
                }
            }
            None => self.run_step(step, validator, max_attempts).await,
        }
    }
}

/// 能力型调用：整段描述交给后端，无截图
pub async fn capability_call(name: &str, backend: &dyn Backend, step: &PlannedStep) -> ExecutionResult {
    let request = ActionRequest {
        step_id: step.step_id,
        description: step.description.clone(),
        action: classify_action(&step.description).dispatchable(),
        region: None,
        autonomous: true,
    };
    let result = call_execute(name, backend, &request).await;
    execution_from(step.step_id, name, ActionKind::Capability, result)
}

/// 能力型调用没有截图证据，以后端自报状态为准
pub fn capability_verdict(execution: &ExecutionResult) -> ValidationReport {
    let report = if execution.succeeded() {
        ValidationReport::pass(execution.step_id, ValidationMethod::Backend)
    } else {
        ValidationReport::fail(execution.step_id, ValidationMethod::Backend)
    };
    report
        .with("backend", execution.backend_used.as_str())
        .with("execution_status", json!(execution.status))
}

async fn call_detect(name: &str, backend: &dyn Backend, request: &DetectRequest) -> Option<Detection> {
    let started = Instant::now();
    let result = backend.detect(request).await;
    audit(name, "detect", request.step_id, outcome_label(&result), started);
    match result {
        Ok(detection) => Some(detection),
        Err(e) => {
            tracing::warn!(backend = %name, step_id = request.step_id, error = %e, "detection failed, using fallback region");
            None
        }
    }
}

async fn call_execute(
    name: &str,
    backend: &dyn Backend,
    request: &ActionRequest,
) -> Result<ActionOutcome, BackendError> {
    let started = Instant::now();
    let result = backend.execute(request).await;
    let outcome = match &result {
        Ok(o) => status_label(o.status),
        Err(e) => error_label(e),
    };
    audit(name, "execute", request.step_id, outcome, started);
    result
}

fn outcome_label<T>(result: &Result<T, BackendError>) -> &'static str {
    match result {
        Ok(_) => "ok",
        Err(e) => error_label(e),
    }
}

fn error_label(error: &BackendError) -> &'static str {
    match error {
        BackendError::Unsupported(_) => "unsupported",
        BackendError::Failed(_) => "error",
    }
}

fn status_label(status: ActionStatus) -> &'static str {
    match status {
        ActionStatus::Success => "success",
        ActionStatus::Failed => "failed",
        ActionStatus::Noop => "noop",
        ActionStatus::Skipped => "skipped",
    }
}

pub(crate) fn audit(backend: &str, call: &str, step_id: u32, outcome: &str, started: Instant) {
    let audit = json!({
        "event": "backend_audit",
        "backend": backend,
        "call": call,
        "step_id": step_id,
        "outcome": outcome,
        "duration_ms": started.elapsed().as_millis() as u64,
    });
    tracing::info!(audit = %audit.to_string(), "backend");
}

/// 把后端返回转换为 ExecutionResult（截图与区域由调用方补齐）
///
/// noop / skipped 视为成功，动作记为 noop；Unsupported → Aborted；其他错误 → Failed。
pub(crate) fn execution_from(
    step_id: u32,
    backend: &str,
    kind: ActionKind,
    result: Result<ActionOutcome, BackendError>,
) -> ExecutionResult {
    let (status, decided_action, raw) = match result {
        Ok(outcome) => {
            let (status, action) = match outcome.status {
                ActionStatus::Success => (ExecutionStatus::Success, kind),
                ActionStatus::Noop | ActionStatus::Skipped => (ExecutionStatus::Success, ActionKind::Noop),
                ActionStatus::Failed => (ExecutionStatus::Failed, kind),
            };
            (status, action, serde_json::to_value(&outcome).unwrap_or_default())
        }
        Err(e @ BackendError::Unsupported(_)) => {
            (ExecutionStatus::Aborted, kind, json!({ "error": e.to_string() }))
        }
        Err(e) => (ExecutionStatus::Failed, kind, json!({ "error": e.to_string() })),
    };
    ExecutionResult {
        step_id,
        backend_used: backend.to_string(),
        decided_action,
        status,
        region: None,
        screenshot_before: None,
        screenshot_after: None,
        raw,
    }
}

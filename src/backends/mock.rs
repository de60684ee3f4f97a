//! Mock 后端（用于测试与本地演练，无需真实屏幕控制工具）
//!
//! 元数据、检测结果、执行状态序列、计划与自校验结论均可配置；记录每类调用次数与收到的动作请求。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{json, Map};

use crate::backends::{
    ActionOutcome, ActionRequest, ActionStatus, Backend, BackendError, BackendVerdict, Capability,
    DetectRequest, Detection, IntegrationMode, TaskDomain, ValidateRequest,
};
use crate::core::{PlannedStep, Region, ValidationStatus};

#[derive(Debug, Default)]
struct CallCounts {
    detect: AtomicU32,
    execute: AtomicU32,
    validate: AtomicU32,
    plan: AtomicU32,
}

/// 可编排的 Mock 后端：执行状态按队列依次弹出，队列耗尽后一律 Success
#[derive(Debug, Default)]
pub struct MockBackend {
    mode: Option<IntegrationMode>,
    capabilities: Option<Vec<Capability>>,
    domains: Vec<TaskDomain>,
    detection: Option<Region>,
    detect_error: Option<String>,
    statuses: Mutex<VecDeque<ActionStatus>>,
    execute_error: Option<String>,
    plan: Option<Vec<String>>,
    verdict: Option<ValidationStatus>,
    calls: CallCounts,
    requests: Mutex<Vec<ActionRequest>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_mode(mut self, mode: IntegrationMode) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn with_capabilities(mut self, capabilities: Vec<Capability>) -> Self {
        self.capabilities = Some(capabilities);
        self
    }

    pub fn with_domains(mut self, domains: Vec<TaskDomain>) -> Self {
        self.domains = domains;
        self
    }

    /// detect 固定返回该区域
    pub fn with_detection(mut self, region: Region) -> Self {
        self.detection = Some(region);
        self
    }

    /// detect 一律返回错误
    pub fn failing_detection(mut self, message: impl Into<String>) -> Self {
        self.detect_error = Some(message.into());
        self
    }

    pub fn with_statuses(self, statuses: impl IntoIterator<Item = ActionStatus>) -> Self {
        *self.statuses.lock().unwrap_or_else(|e| e.into_inner()) = statuses.into_iter().collect();
        self
    }

    /// execute 一律返回 BackendError::Failed
    pub fn failing(mut self, message: impl Into<String>) -> Self {
        self.execute_error = Some(message.into());
        self
    }

    pub fn with_plan(mut self, steps: Vec<&str>) -> Self {
        self.plan = Some(steps.into_iter().map(String::from).collect());
        self
    }

    pub fn with_verdict(mut self, verdict: ValidationStatus) -> Self {
        self.verdict = Some(verdict);
        self
    }

    pub fn detect_calls(&self) -> u32 {
        self.calls.detect.load(Ordering::SeqCst)
    }

    pub fn execute_calls(&self) -> u32 {
        self.calls.execute.load(Ordering::SeqCst)
    }

    pub fn validate_calls(&self) -> u32 {
        self.calls.validate.load(Ordering::SeqCst)
    }

    pub fn plan_calls(&self) -> u32 {
        self.calls.plan.load(Ordering::SeqCst)
    }

    /// 已收到的动作请求（按调用顺序）
    pub fn requests(&self) -> Vec<ActionRequest> {
        self.requests.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl Backend for MockBackend {
    fn integration_mode(&self) -> Option<IntegrationMode> {
        self.mode
    }

    fn capabilities(&self) -> Option<Vec<Capability>> {
        self.capabilities.clone()
    }

    fn domains(&self) -> Vec<TaskDomain> {
        self.domains.clone()
    }

    async fn detect(&self, request: &DetectRequest) -> Result<Detection, BackendError> {
        self.calls.detect.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = &self.detect_error {
            return Err(BackendError::Failed(message.clone()));
        }
        let mut detection = self.detection.map(Detection::at).unwrap_or_default();
        detection.raw = json!({ "mock": true, "step_id": request.step_id });
        Ok(detection)
    }

    async fn execute(&self, request: &ActionRequest) -> Result<ActionOutcome, BackendError> {
        self.calls.execute.fetch_add(1, Ordering::SeqCst);
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request.clone());
        if let Some(message) = &self.execute_error {
            return Err(BackendError::Failed(message.clone()));
        }
        let status = self
            .statuses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .unwrap_or(ActionStatus::Success);
        Ok(ActionOutcome::new(status).with_detail(format!("mock {:?}", request.action)))
    }

    async fn validate(&self, request: &ValidateRequest) -> Result<BackendVerdict, BackendError> {
        self.calls.validate.fetch_add(1, Ordering::SeqCst);
        let status = self
            .verdict
            .ok_or(BackendError::Unsupported(Capability::Validate))?;
        let mut detail = Map::new();
        detail.insert("mock".into(), json!(true));
        detail.insert("step_id".into(), json!(request.step_id));
        Ok(BackendVerdict { status, detail })
    }

    async fn plan(&self, _prompt: &str) -> Result<Vec<PlannedStep>, BackendError> {
        self.calls.plan.fetch_add(1, Ordering::SeqCst);
        let steps = self
            .plan
            .as_ref()
            .ok_or(BackendError::Unsupported(Capability::Plan))?;
        Ok(steps
            .iter()
            .enumerate()
            .map(|(i, d)| PlannedStep::new(i as u32 + 1, d.clone()))
            .collect())
    }
}

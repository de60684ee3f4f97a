//! 编排器：一次 run 的顶层状态机
//!
//! 1. 解析配置的检测 / 执行后端（未注册即失败，不会运行任何步骤）
//! 2. 单句任务命中某能力型后端的领域时直接交给它（mode = mcp），不经过规划与校验
//! 3. 否则按执行后端契约的 integration mode 分派：FULL / PARTIAL / HYBRID，每个模式一个处理函数
//!
//! 步骤严格串行；run 结束时返回完整的 RunReport。

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use tokio::task::JoinError;

use crate::backends::{
    ActionRequest, Backend, BackendError, BackendRegistry, Capability, IntegrationContract,
    IntegrationMode,
};
use crate::capture::ScreenCapture;
use crate::config::{AppConfig, ExecutorSection};
use crate::core::{PilotError, PlannedStep, ReportMode, RunReport, StepReport};
use crate::executor::{
    audit, capability_call, classify_domain, execution_from, DirectOutcome,
    StepAction, StepExecutor,
};
use crate::llm::LlmClient;
use crate::planner::heuristic::split_clauses;
use crate::planner::{self, validate_plan, Planner};
use crate::validator::{self, TextReader, Validator};

pub const REASON_STEP_LIMIT: &str = "step limit reached";

#[derive(Clone)]
struct ResolvedBackend {
    name: String,
    backend: Arc<dyn Backend>,
    contract: IntegrationContract,
}

/// 运行前解析出的后端
struct Resolved {
    detector: Option<ResolvedBackend>,
    executor: Option<ResolvedBackend>,
}

pub struct Orchestrator {
    registry: BackendRegistry,
    planner: Box<dyn Planner>,
    validator: Arc<dyn Validator>,
    screen: Arc<dyn ScreenCapture>,
    settings: ExecutorSection,
    detection_backend: Option<String>,
    execution_backend: Option<String>,
}

impl Orchestrator {
    pub fn new(
        registry: BackendRegistry,
        planner: Box<dyn Planner>,
        validator: Arc<dyn Validator>,
        screen: Arc<dyn ScreenCapture>,
    ) -> Self {
        Self {
            registry,
            planner,
            validator,
            screen,
            settings: ExecutorSection::default(),
            detection_backend: None,
            execution_backend: None,
        }
    }

    /// 按配置构造：规划器、校验器、默认后端名与执行参数都来自 AppConfig
    pub fn from_config(
        registry: BackendRegistry,
        config: &AppConfig,
        screen: Arc<dyn ScreenCapture>,
        llm: Option<Arc<dyn LlmClient>>,
        ocr: Option<Arc<dyn TextReader>>,
    ) -> Self {
        let planner = planner::from_config(&config.planner, llm, config.executor.max_replans);
        let validator = validator::from_config(
            &config.validator,
            ocr,
            &registry,
            config.backends.execution.as_deref(),
        );
        Self {
            registry,
            planner,
            validator,
            screen,
            settings: config.executor.clone(),
            detection_backend: config.backends.detection.clone(),
            execution_backend: config.backends.execution.clone(),
        }
    }

    pub fn with_settings(mut self, settings: ExecutorSection) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_detection_backend(mut self, name: impl Into<String>) -> Self {
        self.detection_backend = Some(name.into());
        self
    }

    pub fn with_execution_backend(mut self, name: impl Into<String>) -> Self {
        self.execution_backend = Some(name.into());
        self
    }

    pub fn registry(&self) -> &BackendRegistry {
        &self.registry
    }

    /// 执行一次任务。只有配置错误会返回 Err；其余失败都体现在报告里
    pub async fn run(&mut self, prompt: &str) -> Result<RunReport, PilotError> {
        let resolved = self.resolve_backends()?;
        tracing::info!(
            detection = ?self.detection_backend,
            execution = ?self.execution_backend,
            "run started"
        );

        if let Some(report) = self.route_to_capability(prompt).await {
            return Ok(report);
        }

        let executor = resolved.executor.clone().ok_or(PilotError::NoExecutionBackend)?;
        let report = match executor.contract.mode {
            IntegrationMode::Full => self.run_full(prompt, &executor).await,
            IntegrationMode::Partial => self.run_partial(prompt, &resolved, &executor).await,
            IntegrationMode::Hybrid => self.run_hybrid(prompt, &resolved, &executor).await,
        };
        tracing::info!(
            mode = ?report.mode,
            status = ?report.overall_status,
            steps = report.steps.len(),
            "run finished"
        );
        Ok(report)
    }

    /// 对单张图片检测一次、点击一次（不规划、不校验）
    pub async fn detect_and_execute(&self, image: &Path) -> Result<DirectOutcome, PilotError> {
        let resolved = self.resolve_backends()?;
        let executor = resolved.executor.as_ref().ok_or(PilotError::NoExecutionBackend)?;
        let step_executor = self.step_executor(&resolved, executor, false);
        Ok(step_executor.detect_and_execute(image).await)
    }

    fn resolve_backends(&self) -> Result<Resolved, PilotError> {
        let detector = self
            .detection_backend
            .as_deref()
            .map(|name| self.resolve_with(name, Capability::Detect))
            .transpose()?;
        let executor = self
            .execution_backend
            .as_deref()
            .map(|name| self.resolve_with(name, Capability::Execute))
            .transpose()?;
        Ok(Resolved { detector, executor })
    }

    fn resolve_with(&self, name: &str, capability: Capability) -> Result<ResolvedBackend, PilotError> {
        let (backend, contract) = self.registry.require(name)?;
        if !contract.supports(capability) {
            return Err(PilotError::MissingCapability {
                backend: name.to_string(),
                capability,
            });
        }
        Ok(ResolvedBackend {
            name: name.to_string(),
            backend,
            contract,
        })
    }

    fn step_executor(
        &self,
        resolved: &Resolved,
        executor: &ResolvedBackend,
        native_detection: bool,
    ) -> StepExecutor {
        let step_executor = StepExecutor::new(
            executor.name.clone(),
            executor.backend.clone(),
            self.screen.clone(),
            self.settings.evidence_dir.clone(),
        )
        .with_fallback_region(self.settings.fallback_region);
        match &resolved.detector {
            Some(d) => step_executor.with_detector(d.name.clone(), d.backend.clone()),
            None if native_detection && executor.contract.supports(Capability::Detect) => {
                step_executor.with_detector(executor.name.clone(), executor.backend.clone())
            }
            None => step_executor,
        }
    }

    /// 单句、且命中能力型后端领域的任务直接路由，不再进入步骤循环
    async fn route_to_capability(&self, prompt: &str) -> Option<RunReport> {
        if split_clauses(prompt).len() != 1 {
            return None;
        }
        let domain = classify_domain(prompt)?;
        let (name, backend) = self.registry.capability_backend_for(domain)?;
        tracing::info!(backend = %name, domain = %domain, "routing task to capability backend");

        let step = PlannedStep::new(1, prompt.trim());
        let execution = capability_call(&name, backend.as_ref(), &step).await;
        let mut report = RunReport::new(prompt, ReportMode::Mcp);
        report.detail = outcome_detail(&execution.raw);
        report.steps.push(StepReport {
            step,
            execution,
            validation: None,
            attempts: 1,
        });
        Some(report.finalize())
    }

    /// FULL：整条任务交给后端，采信其自报状态；后端错误或 panic 都转成失败报告
    async fn run_full(&mut self, prompt: &str, executor: &ResolvedBackend) -> RunReport {
        let request = ActionRequest::task(prompt);
        let kind = request.action.kind();
        let backend = executor.backend.clone();
        let started = Instant::now();
        let result = match tokio::spawn(async move { backend.execute(&request).await }).await {
            Ok(result) => result,
            Err(e) => Err(BackendError::Failed(panic_message(e))),
        };
        let outcome = match &result {
            Ok(_) => "ok",
            Err(_) => "error",
        };
        audit(&executor.name, "execute", 0, outcome, started);

        let mut report = RunReport::new(prompt, ReportMode::Full);
        report.detail = match &result {
            Ok(o) => o.detail.clone(),
            Err(e) => Some(e.to_string()),
        };
        if let Err(e) = &result {
            tracing::warn!(backend = %executor.name, error = %e, "autonomous backend failed");
        }
        report.steps.push(StepReport {
            step: PlannedStep::new(0, prompt),
            execution: execution_from(0, &executor.name, kind, result),
            validation: None,
            attempts: 1,
        });
        report.finalize()
    }

    /// PARTIAL：Planner → 每步重试循环 → 观察回灌 → 插入补救步骤
    async fn run_partial(
        &mut self,
        prompt: &str,
        resolved: &Resolved,
        executor: &ResolvedBackend,
    ) -> RunReport {
        let steps = match self.planner.plan(prompt).await {
            Ok(steps) => steps,
            Err(e) => return planner_failure(prompt, ReportMode::Partial, e),
        };
        let step_executor = self.step_executor(resolved, executor, false);
        let mut report = RunReport::new(prompt, ReportMode::Partial);
        let mut queue: VecDeque<PlannedStep> = steps.into();

        while let Some(step) = queue.pop_front() {
            if report.steps.len() >= self.settings.max_steps {
                tracing::warn!(max_steps = self.settings.max_steps, "step limit reached");
                report.reason = Some(REASON_STEP_LIMIT.to_string());
                break;
            }
            let outcome = step_executor
                .execute_with_mcp_or_visual(
                    &step,
                    &self.registry,
                    self.validator.as_ref(),
                    self.settings.max_attempts,
                )
                .await;
            self.planner
                .receive_observation(step.step_id, &step.description, &outcome.validation);
            report.steps.push(StepReport {
                step,
                execution: outcome.execution,
                validation: Some(outcome.validation),
                attempts: outcome.attempts,
            });
            if let Some(inserted) = self.planner.decide_next_step().await {
                for s in inserted.into_iter().rev() {
                    queue.push_front(s);
                }
            }
        }
        report.finalize()
    }

    /// HYBRID：优先用后端自带的规划与检测，每个子步骤都按点击下发，校验同 PARTIAL
    async fn run_hybrid(
        &mut self,
        prompt: &str,
        resolved: &Resolved,
        executor: &ResolvedBackend,
    ) -> RunReport {
        let steps = match self.backend_plan(prompt, executor).await {
            Some(steps) => steps,
            None => match self.planner.plan(prompt).await {
                Ok(steps) => steps,
                Err(e) => return planner_failure(prompt, ReportMode::Hybrid, e),
            },
        };
        let step_executor = self.step_executor(resolved, executor, true);
        let mut report = RunReport::new(prompt, ReportMode::Hybrid);

        for step in steps {
            if report.steps.len() >= self.settings.max_steps {
                report.reason = Some(REASON_STEP_LIMIT.to_string());
                break;
            }
            let outcome = step_executor
                .run_step_as(
                    &step,
                    Some(StepAction::Click),
                    self.validator.as_ref(),
                    self.settings.max_attempts,
                )
                .await;
            report.steps.push(StepReport {
                step,
                execution: outcome.execution,
                validation: Some(outcome.validation),
                attempts: outcome.attempts,
            });
        }
        report.finalize()
    }

    /// 后端声明了 plan 能力且返回合法计划时使用；否则返回 None 交给默认 Planner
    async fn backend_plan(&self, prompt: &str, executor: &ResolvedBackend) -> Option<Vec<PlannedStep>> {
        if !executor.contract.supports(Capability::Plan) {
            return None;
        }
        let started = Instant::now();
        let result = executor.backend.plan(prompt).await;
        audit(
            &executor.name,
            "plan",
            0,
            if result.is_ok() { "ok" } else { "error" },
            started,
        );
        match result {
            Ok(steps) => match validate_plan(&steps) {
                Ok(()) => Some(steps),
                Err(e) => {
                    tracing::warn!(backend = %executor.name, error = %e, "backend plan rejected, using planner");
                    None
                }
            },
            Err(e) => {
                tracing::warn!(backend = %executor.name, error = %e, "backend planning failed, using planner");
                None
            }
        }
    }
}

fn planner_failure(prompt: &str, mode: ReportMode, error: PilotError) -> RunReport {
    tracing::warn!(error = %error, "planning failed");
    RunReport::aborted(prompt, mode, format!("Planner error: {}", error)).finalize()
}

fn outcome_detail(raw: &serde_json::Value) -> Option<String> {
    raw.get("detail")
        .or_else(|| raw.get("error"))
        .and_then(|v| v.as_str())
        .map(String::from)
}

fn panic_message(error: JoinError) -> String {
    match error.try_into_panic() {
        Ok(payload) => payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "backend panicked".to_string()),
        Err(e) => e.to_string(),
    }
}


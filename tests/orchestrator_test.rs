//! 编排器集成测试：模式分派、能力路由、重规划、配置错误与全局注册表隔离

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use image::{GrayImage, Luma};

use pilot::backends::{
    global_snapshot, register_global, restore_global, ActionOutcome, ActionRequest, Backend,
    BackendError, BackendRegistry, Capability, FilesystemBackend, IntegrationMode, MockBackend,
};
use pilot::capture::{FrameSequenceScreen, ScreenCapture, UnavailableScreen};
use pilot::config::{AppConfig, ExecutorSection};
use pilot::core::{ReportMode, RunStatus, ValidationMethod, REASON_STEP_LIMIT};
use pilot::executor::StepAction;
use pilot::planner::HeuristicPlanner;
use pilot::validator::{LayeredValidator, REASON_MISSING_SCREENSHOTS};
use pilot::{Orchestrator, PilotError};

/// 整屏单色 PNG
fn frame(dir: &Path, name: &str, value: u8) -> PathBuf {
    let path = dir.join(name);
    GrayImage::from_pixel(16, 16, Luma([value])).save(&path).unwrap();
    path
}

/// 暗 / 亮交替：每步 before 与 after 都明显不同
fn alternating_screen(dir: &Path, steps: usize) -> Arc<dyn ScreenCapture> {
    let frames = (0..steps * 2)
        .map(|i| frame(dir, &format!("frame{}.png", i), if i % 2 == 0 { 0 } else { 200 }))
        .collect();
    Arc::new(FrameSequenceScreen::new(frames))
}

/// 画面始终不变
fn static_screen(dir: &Path) -> Arc<dyn ScreenCapture> {
    Arc::new(FrameSequenceScreen::new(vec![frame(dir, "still.png", 90)]))
}

fn settings(dir: &Path, max_attempts: u32) -> ExecutorSection {
    ExecutorSection {
        max_attempts,
        evidence_dir: dir.join("evidence"),
        ..ExecutorSection::default()
    }
}

fn orchestrator(registry: BackendRegistry, screen: Arc<dyn ScreenCapture>, dir: &Path) -> Orchestrator {
    Orchestrator::new(
        registry,
        Box::new(HeuristicPlanner::new()),
        Arc::new(LayeredValidator::default()),
        screen,
    )
    .with_settings(settings(dir, 3))
}

struct PanickingBackend;

#[async_trait]
impl Backend for PanickingBackend {
    fn integration_mode(&self) -> Option<IntegrationMode> {
        Some(IntegrationMode::Full)
    }

    async fn execute(&self, _request: &ActionRequest) -> Result<ActionOutcome, BackendError> {
        panic!("driver crashed")
    }
}

#[tokio::test]
async fn test_full_mode_backend_error_becomes_failed_report() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(
        MockBackend::new()
            .with_mode(IntegrationMode::Full)
            .failing("automation session lost"),
    );
    let mut registry = BackendRegistry::new();
    registry.register("agent", backend.clone());

    let report = orchestrator(registry, Arc::new(UnavailableScreen), dir.path())
        .with_execution_backend("agent")
        .run("book a table for two")
        .await
        .unwrap();
    assert_eq!(report.mode, ReportMode::Full);
    assert_eq!(report.overall_status, RunStatus::Failed);
    assert_eq!(report.detail.as_deref(), Some("automation session lost"));
    assert_eq!(backend.execute_calls(), 1);
    assert!(backend.requests()[0].autonomous);
}

#[tokio::test]
async fn test_full_mode_backend_panic_is_contained() {
    let dir = tempfile::tempdir().unwrap();
    let mut registry = BackendRegistry::new();
    registry.register("agent", Arc::new(PanickingBackend));

    let report = orchestrator(registry, Arc::new(UnavailableScreen), dir.path())
        .with_execution_backend("agent")
        .run("open the calendar")
        .await
        .unwrap();
    assert_eq!(report.overall_status, RunStatus::Failed);
    assert_eq!(report.detail.as_deref(), Some("driver crashed"));
}

#[tokio::test]
async fn test_full_mode_trusts_backend_status() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(MockBackend::new().with_mode(IntegrationMode::Full));
    let mut registry = BackendRegistry::new();
    registry.register("agent", backend.clone());

    let report = orchestrator(registry, Arc::new(UnavailableScreen), dir.path())
        .with_execution_backend("agent")
        .run("click the login button")
        .await
        .unwrap();
    assert!(report.succeeded());
    assert_eq!(report.steps.len(), 1);
    assert!(report.steps[0].validation.is_none());
    // FULL 模式不截图、不检测
    assert_eq!(backend.detect_calls(), 0);
}

#[tokio::test]
async fn test_capability_prompt_routes_directly() {
    let dir = tempfile::tempdir().unwrap();
    let workspace = dir.path().join("workspace");
    std::fs::create_dir_all(&workspace).unwrap();
    let visual = Arc::new(MockBackend::new());
    let mut registry = BackendRegistry::new();
    registry.register("mock", visual.clone());
    registry.register("fs", Arc::new(FilesystemBackend::new(&workspace)));

    let report = orchestrator(registry, Arc::new(UnavailableScreen), dir.path())
        .with_execution_backend("mock")
        .run("create folder reports")
        .await
        .unwrap();
    assert_eq!(report.mode, ReportMode::Mcp);
    assert!(report.succeeded());
    assert!(workspace.join("reports").is_dir());
    assert_eq!(visual.execute_calls(), 0);
    assert_eq!(visual.detect_calls(), 0);

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["mode"], "mcp");
    assert_eq!(json["overall_status"], "success");
}

#[tokio::test]
async fn test_capability_route_needs_no_execution_backend() {
    let dir = tempfile::tempdir().unwrap();
    let mut registry = BackendRegistry::new();
    registry.register("fs", Arc::new(FilesystemBackend::new(dir.path())));

    let report = orchestrator(registry, Arc::new(UnavailableScreen), dir.path())
        .run("create file notes.txt")
        .await
        .unwrap();
    assert_eq!(report.mode, ReportMode::Mcp);
    assert!(dir.path().join("notes.txt").is_file());
}

#[tokio::test]
async fn test_unregistered_backend_fails_before_any_step() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(MockBackend::new());
    let mut registry = BackendRegistry::new();
    registry.register("mock", backend.clone());

    let err = orchestrator(registry, Arc::new(UnavailableScreen), dir.path())
        .with_detection_backend("mock")
        .with_execution_backend("X")
        .run("click OK")
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "unregistered backend: X");
    assert!(err.is_configuration());
    assert_eq!(backend.detect_calls(), 0);
    assert_eq!(backend.execute_calls(), 0);
}

#[tokio::test]
async fn test_missing_execution_backend_and_capability() {
    let dir = tempfile::tempdir().unwrap();
    let mut registry = BackendRegistry::new();
    registry.register("mock", Arc::new(MockBackend::new()));
    registry.register("fs", Arc::new(FilesystemBackend::new(dir.path())));

    let err = orchestrator(registry.clone(), Arc::new(UnavailableScreen), dir.path())
        .run("click OK")
        .await
        .unwrap_err();
    assert!(matches!(err, PilotError::NoExecutionBackend));

    // fs 只声明了 execute，不能作为检测后端
    let err = orchestrator(registry, Arc::new(UnavailableScreen), dir.path())
        .with_detection_backend("fs")
        .with_execution_backend("mock")
        .run("click OK")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PilotError::MissingCapability {
            capability: Capability::Detect,
            ..
        }
    ));
}

#[tokio::test]
async fn test_partial_mode_runs_each_step_and_validates() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(MockBackend::new());
    let mut registry = BackendRegistry::new();
    registry.register("mock", backend.clone());

    let report = orchestrator(registry, alternating_screen(dir.path(), 2), dir.path())
        .with_execution_backend("mock")
        .run("click OK, then click Cancel")
        .await
        .unwrap();
    assert_eq!(report.mode, ReportMode::Partial);
    assert!(report.succeeded(), "{:?}", report);
    assert_eq!(report.steps.len(), 2);
    assert_eq!(report.steps[1].step.description, "click Cancel");
    for step in &report.steps {
        assert_eq!(step.attempts, 1);
        let validation = step.validation.as_ref().unwrap();
        assert_eq!(validation.method, ValidationMethod::Pixel);
        assert!(step.execution.screenshot_before.as_ref().unwrap().exists());
    }
    assert_eq!(backend.execute_calls(), 2);
}

#[tokio::test]
async fn test_partial_mode_replans_failed_typing() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(MockBackend::new());
    let mut registry = BackendRegistry::new();
    registry.register("mock", backend.clone());

    let report = orchestrator(registry, static_screen(dir.path()), dir.path())
        .with_settings(settings(dir.path(), 1))
        .with_execution_backend("mock")
        .run("type 'hello'")
        .await
        .unwrap();

    let descriptions: Vec<&str> = report
        .steps
        .iter()
        .map(|s| s.step.description.as_str())
        .collect();
    assert_eq!(
        descriptions,
        vec!["type 'hello'", "Click the text input field", "type 'hello'"]
    );
    assert_eq!(report.steps[1].step.metadata["replan_of"], 1);
    assert_eq!(report.overall_status, RunStatus::Failed);
    assert_eq!(
        backend.requests()[0].action,
        StepAction::Type {
            text: "hello".into()
        }
    );
}

#[tokio::test]
async fn test_retries_are_bounded_and_reported() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(MockBackend::new());
    let mut registry = BackendRegistry::new();
    registry.register("mock", backend.clone());

    let report = orchestrator(registry, static_screen(dir.path()), dir.path())
        .with_execution_backend("mock")
        .run("click OK")
        .await
        .unwrap();
    assert_eq!(report.overall_status, RunStatus::Failed);
    assert_eq!(report.steps.len(), 1);
    assert_eq!(report.steps[0].attempts, 3);
    assert_eq!(backend.execute_calls(), 3);
}

#[tokio::test]
async fn test_missing_evidence_fails_steps_without_crashing() {
    let dir = tempfile::tempdir().unwrap();
    let mut registry = BackendRegistry::new();
    registry.register("mock", Arc::new(MockBackend::new()));

    let report = orchestrator(registry, Arc::new(UnavailableScreen), dir.path())
        .with_settings(settings(dir.path(), 1))
        .with_execution_backend("mock")
        .run("click OK")
        .await
        .unwrap();
    assert_eq!(report.overall_status, RunStatus::Failed);
    let validation = report.steps[0].validation.as_ref().unwrap();
    assert_eq!(validation.reason(), Some(REASON_MISSING_SCREENSHOTS));
}

#[tokio::test]
async fn test_planner_error_yields_report_with_reason() {
    let dir = tempfile::tempdir().unwrap();
    let mut registry = BackendRegistry::new();
    registry.register("mock", Arc::new(MockBackend::new()));

    let report = orchestrator(registry, Arc::new(UnavailableScreen), dir.path())
        .with_execution_backend("mock")
        .run(" ; ")
        .await
        .unwrap();
    assert_eq!(report.overall_status, RunStatus::Failed);
    assert!(report.steps.is_empty());
    assert!(report
        .reason
        .as_deref()
        .unwrap()
        .starts_with("Planner error: invalid plan"));
}

#[tokio::test]
async fn test_step_limit_stops_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let mut registry = BackendRegistry::new();
    registry.register("mock", Arc::new(MockBackend::new()));

    let report = orchestrator(registry, alternating_screen(dir.path(), 3), dir.path())
        .with_settings(ExecutorSection {
            max_steps: 1,
            ..settings(dir.path(), 1)
        })
        .with_execution_backend("mock")
        .run("click a, click b, click c")
        .await
        .unwrap();
    assert_eq!(report.steps.len(), 1);
    assert_eq!(report.reason.as_deref(), Some(REASON_STEP_LIMIT));
    assert_eq!(report.overall_status, RunStatus::Failed);
}

#[tokio::test]
async fn test_hybrid_mode_uses_backend_plan_and_detection() {
    let dir = tempfile::tempdir().unwrap();
    let target = pilot::core::Region::new(4, 4, 6, 6);
    let backend = Arc::new(
        MockBackend::new()
            .with_mode(IntegrationMode::Hybrid)
            .with_capabilities(vec![Capability::Detect, Capability::Execute, Capability::Plan])
            .with_plan(vec!["Open the menu", "Type 'ignored'"])
            .with_detection(target),
    );
    let mut registry = BackendRegistry::new();
    registry.register("hybrid", backend.clone());

    let report = orchestrator(registry, alternating_screen(dir.path(), 2), dir.path())
        .with_execution_backend("hybrid")
        .run("pick something from the menu")
        .await
        .unwrap();
    assert_eq!(report.mode, ReportMode::Hybrid);
    assert_eq!(report.steps.len(), 2);
    assert_eq!(backend.plan_calls(), 1);
    assert_eq!(backend.detect_calls(), 2);
    for request in backend.requests() {
        assert_eq!(request.action, StepAction::Click);
        assert_eq!(request.region, Some(target));
    }
}

#[tokio::test]
async fn test_hybrid_mode_falls_back_to_planner() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(MockBackend::new().with_mode(IntegrationMode::Hybrid));
    let mut registry = BackendRegistry::new();
    registry.register("hybrid", backend.clone());

    let report = orchestrator(registry, alternating_screen(dir.path(), 2), dir.path())
        .with_execution_backend("hybrid")
        .run("open settings; open profile")
        .await
        .unwrap();
    assert_eq!(report.mode, ReportMode::Hybrid);
    assert_eq!(backend.plan_calls(), 0);
    assert_eq!(report.steps[1].step.description, "open profile");
}

#[tokio::test]
async fn test_from_config_uses_configured_backends() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(MockBackend::new());
    let mut registry = BackendRegistry::new();
    registry.register("mock", backend.clone());

    let mut config = AppConfig::default();
    config.backends.execution = Some("mock".to_string());
    config.executor = settings(dir.path(), 2);

    let mut orchestrator = Orchestrator::from_config(
        registry,
        &config,
        alternating_screen(dir.path(), 1),
        None,
        None,
    );
    let report = orchestrator.run("press the blue button").await.unwrap();
    assert!(report.succeeded());
    assert_eq!(backend.execute_calls(), 1);
}

#[tokio::test]
async fn test_global_registry_snapshot_and_restore() {
    let saved = global_snapshot();
    register_global("temporary", Arc::new(MockBackend::new()));
    assert!(global_snapshot().resolve("temporary").is_some());
    let contract = global_snapshot().contract_of("temporary").unwrap();
    assert_eq!(contract.mode, IntegrationMode::Partial);
    assert!(contract.supports(Capability::Validate));

    restore_global(saved);
    assert!(global_snapshot().resolve("temporary").is_none());
}

#[tokio::test]
async fn test_reused_orchestrator_replans_on_every_run() {
    let dir = tempfile::tempdir().unwrap();
    let mut registry = BackendRegistry::new();
    registry.register("mock", Arc::new(MockBackend::new()));

    let mut orchestrator = orchestrator(registry, static_screen(dir.path()), dir.path())
        .with_settings(settings(dir.path(), 1))
        .with_execution_backend("mock");
    let first = orchestrator.run("type 'hello'").await.unwrap();
    let second = orchestrator.run("type 'hello'").await.unwrap();

    assert_eq!(first.steps.len(), 3);
    assert_eq!(second.steps.len(), 3);
    assert_eq!(second.steps[1].step.description, "Click the text input field");
    assert_eq!(second.steps[1].step.step_id, 2);
    assert_eq!(second.steps[1].step.metadata["replan_of"], 1);
}

#[tokio::test]
async fn test_unrecognised_capability_request_fails_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let mut registry = BackendRegistry::new();
    registry.register("fs", Arc::new(FilesystemBackend::new(dir.path())));

    let report = orchestrator(registry, Arc::new(UnavailableScreen), dir.path())
        .run("delete file")
        .await
        .unwrap();
    assert_eq!(report.mode, ReportMode::Mcp);
    assert_eq!(report.overall_status, RunStatus::Failed);
    assert_eq!(
        report.detail.as_deref(),
        Some("unrecognised filesystem request: delete file")
    );
}

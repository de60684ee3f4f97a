//! 步骤校验：根据描述与前后截图判断步骤是否生效
//!
//! - LayeredValidator：按序规则（执行失败 → 缺截图 → 输入文本 OCR → 导航 → 特例 → 点击 → 默认）
//! - RegionAwareValidator：局部差 → 全局差 → OCR → 目标框变化，任一信号触发即通过
//! - BackendValidator：委托给声明了 validate 能力的后端
//!
//! 校验器不持有可变状态，相同输入总是得到相同结论。

pub mod backend;
pub mod layered;
pub mod ocr;
pub mod region;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use image::GrayImage;

use crate::backends::{Backend, BackendRegistry, Capability};
use crate::config::{ValidatorSection, ValidatorVariant};
use crate::core::{ExecutionResult, PlannedStep, ValidationMethod, ValidationReport};
use crate::vision;

pub use backend::BackendValidator;
pub use layered::{LayeredValidator, Thresholds};
pub use ocr::{SidecarTextReader, StaticTextReader, TextReader};
pub use region::{RegionAwareValidator, RegionThresholds};

pub const REASON_EXECUTOR_FAILED: &str = "executor_failed";
pub const REASON_MISSING_SCREENSHOTS: &str = "missing_screenshots";

#[async_trait]
pub trait Validator: Send + Sync {
    async fn validate_step(&self, step: &PlannedStep, execution: &ExecutionResult) -> ValidationReport;
}

/// 前置规则 1：执行后端报告失败
fn executor_failed(step: &PlannedStep, execution: &ExecutionResult) -> Option<ValidationReport> {
    (!execution.succeeded()).then(|| {
        ValidationReport::fail(step.step_id, ValidationMethod::Precheck)
            .with("reason", REASON_EXECUTOR_FAILED)
            .with("execution_status", serde_json::json!(execution.status))
    })
}

fn missing_screenshots(step: &PlannedStep, error: impl ToString) -> ValidationReport {
    ValidationReport::fail(step.step_id, ValidationMethod::Precheck)
        .with("reason", REASON_MISSING_SCREENSHOTS)
        .with("error", error.to_string())
}

/// 前置规则 1、2：只检查截图路径是否存在（不解码）
pub(crate) fn precheck_paths(
    step: &PlannedStep,
    execution: &ExecutionResult,
) -> Result<(PathBuf, PathBuf), ValidationReport> {
    if let Some(report) = executor_failed(step, execution) {
        return Err(report);
    }
    match (&execution.screenshot_before, &execution.screenshot_after) {
        (Some(before), Some(after)) if before.exists() && after.exists() => {
            Ok((before.clone(), after.clone()))
        }
        _ => Err(missing_screenshots(step, "before/after screenshot absent")),
    }
}

/// 前置规则 1、2：截图缺失或无法解码一律判失败
pub(crate) fn load_evidence(
    step: &PlannedStep,
    execution: &ExecutionResult,
) -> Result<(GrayImage, GrayImage), ValidationReport> {
    let (before, after) = precheck_paths(step, execution)?;
    let before = vision::load_luma(&before).map_err(|e| missing_screenshots(step, e))?;
    let after = vision::load_luma(&after).map_err(|e| missing_screenshots(step, e))?;
    Ok((before, after))
}

/// 按配置构造校验器
///
/// backend 变体委托给执行后端的 validate；未配置执行后端、或其契约未声明 validate 时退回分层校验。
pub fn from_config(
    section: &ValidatorSection,
    ocr: Option<Arc<dyn TextReader>>,
    registry: &BackendRegistry,
    execution_backend: Option<&str>,
) -> Arc<dyn Validator> {
    match section.variant {
        ValidatorVariant::Layered => Arc::new(LayeredValidator::from_config(section, ocr)),
        ValidatorVariant::Region => Arc::new(RegionAwareValidator::from_config(&section.region, ocr)),
        ValidatorVariant::Backend => match validating_backend(registry, execution_backend) {
            Some((name, backend)) => Arc::new(BackendValidator::new(name, backend)),
            None => Arc::new(LayeredValidator::from_config(section, ocr)),
        },
    }
}

fn validating_backend(
    registry: &BackendRegistry,
    name: Option<&str>,
) -> Option<(String, Arc<dyn Backend>)> {
    let Some(name) = name else {
        tracing::warn!("backend validator requested without an execution backend, using layered validator");
        return None;
    };
    let backend = registry.resolve(name)?;
    let supports = registry
        .contract_of(name)
        .is_some_and(|contract| contract.supports(Capability::Validate));
    if !supports {
        tracing::warn!(backend = %name, "execution backend does not declare validate, using layered validator");
        return None;
    }
    Some((name.to_string(), backend))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::MockBackend;
    use crate::core::{ActionKind, ExecutionStatus, ValidationStatus};
    use crate::vision::testing::write_gray;

    fn section(variant: ValidatorVariant) -> ValidatorSection {
        ValidatorSection {
            variant,
            ..ValidatorSection::default()
        }
    }

    async fn method_for(validator: Arc<dyn Validator>, dir: &std::path::Path) -> ValidationMethod {
        let before = write_gray(dir, "b.png", (16, 16), |_, _| 0);
        let after = write_gray(dir, "a.png", (16, 16), |_, _| 200);
        let execution = ExecutionResult {
            step_id: 1,
            backend_used: "mock".into(),
            decided_action: ActionKind::Click,
            status: ExecutionStatus::Success,
            region: None,
            screenshot_before: Some(before),
            screenshot_after: Some(after),
            raw: serde_json::Value::Null,
        };
        validator
            .validate_step(&PlannedStep::new(1, "Click OK"), &execution)
            .await
            .method
    }

    #[tokio::test]
    async fn test_backend_variant_requires_validate_capability() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = BackendRegistry::new();
        registry.register(
            "judge",
            Arc::new(MockBackend::new().with_verdict(ValidationStatus::Pass)),
        );
        registry.register(
            "clicker",
            Arc::new(
                MockBackend::new()
                    .with_capabilities(vec![Capability::Detect, Capability::Execute])
                    .with_verdict(ValidationStatus::Pass),
            ),
        );
        let backend = section(ValidatorVariant::Backend);

        let delegated = from_config(&backend, None, &registry, Some("judge"));
        assert_eq!(method_for(delegated, dir.path()).await, ValidationMethod::Backend);

        let undeclared = from_config(&backend, None, &registry, Some("clicker"));
        assert_eq!(method_for(undeclared, dir.path()).await, ValidationMethod::Pixel);

        let missing = from_config(&backend, None, &registry, None);
        assert_eq!(method_for(missing, dir.path()).await, ValidationMethod::Pixel);
    }

    #[tokio::test]
    async fn test_region_variant_ignores_backend() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = BackendRegistry::new();
        registry.register("judge", Arc::new(MockBackend::new()));
        let region = from_config(&section(ValidatorVariant::Region), None, &registry, Some("judge"));
        assert_eq!(method_for(region, dir.path()).await, ValidationMethod::Pixel);
    }
}

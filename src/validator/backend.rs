//! 委托后端自校验：后端声明了 validate 能力时使用

use std::sync::Arc;

use async_trait::async_trait;

use crate::backends::{Backend, ValidateRequest};
use crate::core::{ExecutionResult, PlannedStep, ValidationMethod, ValidationReport};
use crate::validator::{precheck_paths, Validator};

pub struct BackendValidator {
    name: String,
    backend: Arc<dyn Backend>,
}

impl BackendValidator {
    pub fn new(name: impl Into<String>, backend: Arc<dyn Backend>) -> Self {
        Self {
            name: name.into(),
            backend,
        }
    }
}

#[async_trait]
impl Validator for BackendValidator {
    async fn validate_step(&self, step: &PlannedStep, execution: &ExecutionResult) -> ValidationReport {
        let (before, after) = match precheck_paths(step, execution) {
            Ok(paths) => paths,
            Err(report) => return report,
        };
        let request = ValidateRequest {
            step_id: step.step_id,
            description: step.description.clone(),
            before: Some(before),
            after: Some(after),
            region: execution.region,
        };
        match self.backend.validate(&request).await {
            Ok(verdict) => {
                let mut report = ValidationReport::pass(step.step_id, ValidationMethod::Backend)
                    .with("backend", self.name.as_str());
                report.status = verdict.status;
                report.detail.extend(verdict.detail);
                report
            }
            Err(e) => {
                tracing::warn!(backend = %self.name, error = %e, "backend validation failed");
                ValidationReport::fail(step.step_id, ValidationMethod::Backend)
                    .with("backend", self.name.as_str())
                    .with("error", e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::MockBackend;
    use crate::core::{ActionKind, ExecutionStatus, ValidationStatus};

    fn execution(dir: &std::path::Path) -> ExecutionResult {
        let before = dir.join("before.png");
        let after = dir.join("after.png");
        std::fs::write(&before, b"x").unwrap();
        std::fs::write(&after, b"y").unwrap();
        ExecutionResult {
            step_id: 1,
            backend_used: "mock".into(),
            decided_action: ActionKind::Click,
            status: ExecutionStatus::Success,
            region: None,
            screenshot_before: Some(before),
            screenshot_after: Some(after),
            raw: serde_json::Value::Null,
        }
    }

    #[tokio::test]
    async fn test_backend_verdict_is_wrapped() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(MockBackend::new().with_verdict(ValidationStatus::Pass));
        let validator = BackendValidator::new("mock", backend.clone());

        let report = validator
            .validate_step(&PlannedStep::new(1, "click"), &execution(dir.path()))
            .await;
        assert!(report.passed());
        assert_eq!(report.method, ValidationMethod::Backend);
        assert_eq!(report.detail["mock"], true);
        assert_eq!(report.detail["backend"], "mock");
        assert_eq!(backend.validate_calls(), 1);
    }

    #[tokio::test]
    async fn test_unsupported_validation_fails() {
        let dir = tempfile::tempdir().unwrap();
        let validator = BackendValidator::new("mock", Arc::new(MockBackend::new()));
        let report = validator
            .validate_step(&PlannedStep::new(1, "click"), &execution(dir.path()))
            .await;
        assert_eq!(report.status, ValidationStatus::Fail);
        assert!(report.detail["error"].as_str().unwrap().contains("not supported"));
    }
}

//! 分层启发式校验
//!
//! 规则按序执行，第一条适用者给出结论：
//! 1. 执行失败 → executor_failed
//! 2. 截图缺失 / 无法解码 → missing_screenshots
//! 3. 计算降采样后的全局亮度差 diff
//! 4. 输入类：有 OCR 时检查引号文本是否出现在 after 截图中，否则 diff > type_threshold
//! 5. 回车 / 导航类：diff > navigation_threshold
//! 6. 已知的细微目标（如搜索框点击）直接通过
//! 7. 点击类：diff > click_threshold
//! 8. 其他：diff > default_threshold

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::ValidatorSection;
use crate::core::{ExecutionResult, PlannedStep, ValidationMethod, ValidationReport};
use crate::executor::action::{has_cue, quoted_literal, Cue};
use crate::validator::{load_evidence, TextReader, Validator};
use crate::vision::{self, round_to};

/// OCR 摘录长度上限（字符）
const OCR_EXCERPT_CHARS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    pub type_: f64,
    pub navigation: f64,
    pub click: f64,
    pub default: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            type_: 0.3,
            navigation: 5.0,
            click: 0.6,
            default: 1.0,
        }
    }
}

pub struct LayeredValidator {
    thresholds: Thresholds,
    downsample_width: u32,
    ocr: Option<Arc<dyn TextReader>>,
    always_pass_targets: Vec<String>,
}

impl LayeredValidator {
    pub fn new(thresholds: Thresholds) -> Self {
        Self {
            thresholds,
            downsample_width: 320,
            ocr: None,
            always_pass_targets: default_always_pass_targets(),
        }
    }

    pub fn from_config(section: &ValidatorSection, ocr: Option<Arc<dyn TextReader>>) -> Self {
        Self {
            thresholds: Thresholds {
                type_: section.type_threshold,
                navigation: section.navigation_threshold,
                click: section.click_threshold,
                default: section.default_threshold,
            },
            downsample_width: section.downsample_width,
            ocr,
            always_pass_targets: section.always_pass_targets.clone(),
        }
    }

    pub fn with_ocr(mut self, ocr: Arc<dyn TextReader>) -> Self {
        self.ocr = Some(ocr);
        self
    }

    pub fn with_downsample_width(mut self, width: u32) -> Self {
        self.downsample_width = width;
        self
    }

    pub fn with_always_pass_targets(mut self, targets: Vec<String>) -> Self {
        self.always_pass_targets = targets;
        self
    }

    pub fn evaluate(&self, step: &PlannedStep, execution: &ExecutionResult) -> ValidationReport {
        let (before, after) = match load_evidence(step, execution) {
            Ok(images) => images,
            Err(report) => return report,
        };
        let diff = round_to(
            vision::global_diff(&before, &after, self.downsample_width),
            3,
        );
        let text = step.description.as_str();

        if has_cue(text, Cue::Type) {
            return self.check_typed_text(step, execution, diff);
        }
        if has_cue(text, Cue::Navigate) {
            return pixel_verdict(step.step_id, diff, self.thresholds.navigation, "navigation");
        }
        if let Some(target) = self.always_pass_target(text) {
            return ValidationReport::pass(step.step_id, ValidationMethod::SpecialCase)
                .with("target", target)
                .with("diff", diff);
        }
        if has_cue(text, Cue::Click) {
            return pixel_verdict(step.step_id, diff, self.thresholds.click, "click");
        }
        pixel_verdict(step.step_id, diff, self.thresholds.default, "default")
    }

    fn always_pass_target(&self, text: &str) -> Option<&str> {
        let lower = text.to_lowercase();
        self.always_pass_targets
            .iter()
            .find(|t| lower.contains(&t.to_lowercase()))
            .map(String::as_str)
    }

    fn check_typed_text(
        &self,
        step: &PlannedStep,
        execution: &ExecutionResult,
        diff: f64,
    ) -> ValidationReport {
        let expected = quoted_literal(&step.description);
        let (Some(ocr), Some(expected), Some(after)) =
            (&self.ocr, expected, execution.screenshot_after.as_deref())
        else {
            return pixel_verdict(step.step_id, diff, self.thresholds.type_, "type");
        };

        let ocr_text = match ocr.read_text(after) {
            Ok(text) => text,
            Err(e) => {
                tracing::debug!(error = %e, "ocr unavailable, falling back to pixel diff");
                return pixel_verdict(step.step_id, diff, self.thresholds.type_, "type")
                    .with("ocr_error", e);
            }
        };

        // OCR 可能把一段文字折成多行：按空白归一化后在全文里找
        let needle = normalize_whitespace(&expected);
        if normalize_whitespace(&ocr_text).contains(&needle) {
            let report = ValidationReport::pass(step.step_id, ValidationMethod::Ocr)
                .with("matched", expected.clone())
                .with("diff", diff);
            // 地址栏自动补全也可能满足子串匹配：保留通过，只做标注
            return if matched_near_url(&ocr_text, &needle) {
                report.with("note", "matched text looks like a URL; may be an address-bar suggestion")
            } else {
                report
            };
        }
        ValidationReport::fail(step.step_id, ValidationMethod::Ocr)
            .with("expected", expected)
            .with("ocr_excerpt", ocr_text.chars().take(OCR_EXCERPT_CHARS).collect::<String>())
            .with("diff", diff)
    }
}

impl Default for LayeredValidator {
    fn default() -> Self {
        Self::new(Thresholds::default())
    }
}

#[async_trait]
impl Validator for LayeredValidator {
    async fn validate_step(&self, step: &PlannedStep, execution: &ExecutionResult) -> ValidationReport {
        self.evaluate(step, execution)
    }
}

pub(crate) fn default_always_pass_targets() -> Vec<String> {
    vec!["search box".into(), "search bar".into(), "search field".into()]
}

fn pixel_verdict(step_id: u32, diff: f64, threshold: f64, rule: &str) -> ValidationReport {
    let report = if diff > threshold {
        ValidationReport::pass(step_id, ValidationMethod::Pixel)
    } else {
        ValidationReport::fail(step_id, ValidationMethod::Pixel)
    };
    report
        .with("diff", diff)
        .with("threshold", threshold)
        .with("rule", rule)
}

/// 小写并把连续空白（含换行）压成单个空格
fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// 匹配所在行（按期望文本的首个词定位）是否含有 URL 样式的词
fn matched_near_url(ocr_text: &str, needle: &str) -> bool {
    let Some(first_word) = needle.split_whitespace().next() else {
        return false;
    };
    ocr_text
        .lines()
        .filter(|line| line.to_lowercase().contains(first_word))
        .any(|line| line.split_whitespace().any(looks_like_url))
}

fn looks_like_url(token: &str) -> bool {
    let t = token.to_lowercase();
    t.contains("://")
        || t.starts_with("www.")
        || [".com", ".org", ".net", ".io", ".dev"]
            .iter()
            .any(|tld| t.contains(tld))
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::core::{ActionKind, ExecutionStatus, ValidationStatus};
    use crate::validator::{StaticTextReader, REASON_EXECUTOR_FAILED, REASON_MISSING_SCREENSHOTS};
    use crate::vision::testing::write_gray;

    fn execution(before: Option<PathBuf>, after: Option<PathBuf>, status: ExecutionStatus) -> ExecutionResult {
        ExecutionResult {
            step_id: 1,
            backend_used: "mock".into(),
            decided_action: ActionKind::Click,
            status,
            region: None,
            screenshot_before: before,
            screenshot_after: after,
            raw: serde_json::Value::Null,
        }
    }

    /// before 全 100；after 前 rows 行为 100+delta
    fn evidence(dir: &std::path::Path, rows: u32, delta: u8) -> (PathBuf, PathBuf) {
        let before = write_gray(dir, "before.png", (10, 10), |_, _| 100);
        let after = write_gray(dir, "after.png", (10, 10), |_, y| if y < rows { 100 + delta } else { 100 });
        (before, after)
    }

    #[tokio::test]
    async fn test_typed_text_found_by_ocr() {
        let dir = tempfile::tempdir().unwrap();
        let (before, after) = evidence(dir.path(), 0, 0);
        let validator = LayeredValidator::default()
            .with_ocr(Arc::new(StaticTextReader::new("user@host:~$ ls\nCargo.toml  src")));
        let step = PlannedStep::new(1, "Type 'ls' and execute");

        let report = validator
            .validate_step(&step, &execution(Some(before), Some(after), ExecutionStatus::Success))
            .await;
        assert_eq!(report.status, ValidationStatus::Pass);
        assert_eq!(report.method, ValidationMethod::Ocr);
        assert_eq!(report.detail["matched"], "ls");
        assert!(report.detail.get("note").is_none());
    }

    #[tokio::test]
    async fn test_typed_text_wrapped_across_lines() {
        let dir = tempfile::tempdir().unwrap();
        let (before, after) = evidence(dir.path(), 0, 0);
        let validator = LayeredValidator::default()
            .with_ocr(Arc::new(StaticTextReader::new("Subject: quarterly\n  Report  draft")));
        let step = PlannedStep::new(1, "Type 'Quarterly report draft'");

        let report = validator
            .validate_step(&step, &execution(Some(before), Some(after), ExecutionStatus::Success))
            .await;
        assert!(report.passed());
        assert_eq!(report.method, ValidationMethod::Ocr);
        assert_eq!(report.detail["matched"], "Quarterly report draft");
        assert!(report.detail.get("note").is_none());
    }

    #[tokio::test]
    async fn test_typed_text_missing_reports_excerpt() {
        let dir = tempfile::tempdir().unwrap();
        let (before, after) = evidence(dir.path(), 10, 50);
        let validator = LayeredValidator::default()
            .with_ocr(Arc::new(StaticTextReader::new("nothing relevant here")));
        let step = PlannedStep::new(1, "Type 'cargo build'");

        let report = validator
            .validate_step(&step, &execution(Some(before), Some(after), ExecutionStatus::Success))
            .await;
        assert_eq!(report.status, ValidationStatus::Fail);
        assert_eq!(report.method, ValidationMethod::Ocr);
        assert_eq!(report.detail["ocr_excerpt"], "nothing relevant here");
    }

    #[tokio::test]
    async fn test_url_like_match_passes_with_note() {
        let dir = tempfile::tempdir().unwrap();
        let (before, after) = evidence(dir.path(), 0, 0);
        let validator = LayeredValidator::default()
            .with_ocr(Arc::new(StaticTextReader::new("https://rust-lang.org/learn")));
        let step = PlannedStep::new(1, "Type 'rust-lang' in the address bar");

        let report = validator
            .validate_step(&step, &execution(Some(before), Some(after), ExecutionStatus::Success))
            .await;
        assert!(report.passed());
        assert!(report.detail.contains_key("note"));
    }

    #[tokio::test]
    async fn test_type_without_ocr_uses_pixel_threshold() {
        let dir = tempfile::tempdir().unwrap();
        // 4 行差 1 → diff 0.4 > 0.3
        let (before, after) = evidence(dir.path(), 4, 1);
        let report = LayeredValidator::default()
            .validate_step(
                &PlannedStep::new(1, "Type 'ls'"),
                &execution(Some(before), Some(after), ExecutionStatus::Success),
            )
            .await;
        assert!(report.passed());
        assert_eq!(report.method, ValidationMethod::Pixel);
        assert_eq!(report.detail["rule"], "type");
    }

    #[tokio::test]
    async fn test_click_below_threshold_fails() {
        let dir = tempfile::tempdir().unwrap();
        let (before, after) = evidence(dir.path(), 2, 1);
        let report = LayeredValidator::default()
            .validate_step(
                &PlannedStep::new(1, "click"),
                &execution(Some(before), Some(after), ExecutionStatus::Success),
            )
            .await;
        assert_eq!(report.status, ValidationStatus::Fail);
        assert_eq!(report.method, ValidationMethod::Pixel);
        assert_eq!(report.detail["diff"], 0.2);
    }

    #[tokio::test]
    async fn test_navigation_needs_large_change() {
        let dir = tempfile::tempdir().unwrap();
        let (before, after) = evidence(dir.path(), 5, 8);
        // diff = 4.0，点击足够但导航不够
        let report = LayeredValidator::default()
            .validate_step(
                &PlannedStep::new(1, "Press Enter"),
                &execution(Some(before.clone()), Some(after.clone()), ExecutionStatus::Success),
            )
            .await;
        assert!(!report.passed());
        assert_eq!(report.detail["rule"], "navigation");

        let report = LayeredValidator::default()
            .validate_step(
                &PlannedStep::new(1, "Click OK"),
                &execution(Some(before), Some(after), ExecutionStatus::Success),
            )
            .await;
        assert!(report.passed());
    }

    #[tokio::test]
    async fn test_search_box_click_always_passes() {
        let dir = tempfile::tempdir().unwrap();
        let (before, after) = evidence(dir.path(), 0, 0);
        let report = LayeredValidator::default()
            .validate_step(
                &PlannedStep::new(1, "Click the search box"),
                &execution(Some(before), Some(after), ExecutionStatus::Success),
            )
            .await;
        assert!(report.passed());
        assert_eq!(report.method, ValidationMethod::SpecialCase);
    }

    #[tokio::test]
    async fn test_executor_failure_wins_over_screenshots() {
        let dir = tempfile::tempdir().unwrap();
        let (before, after) = evidence(dir.path(), 10, 100);
        let report = LayeredValidator::default()
            .validate_step(
                &PlannedStep::new(1, "click"),
                &execution(Some(before), Some(after), ExecutionStatus::Failed),
            )
            .await;
        assert_eq!(report.status, ValidationStatus::Fail);
        assert_eq!(report.reason(), Some(REASON_EXECUTOR_FAILED));
    }

    #[tokio::test]
    async fn test_missing_screenshots() {
        let report = LayeredValidator::default()
            .validate_step(
                &PlannedStep::new(1, "click"),
                &execution(None, None, ExecutionStatus::Success),
            )
            .await;
        assert_eq!(report.reason(), Some(REASON_MISSING_SCREENSHOTS));

        let dir = tempfile::tempdir().unwrap();
        let garbage = dir.path().join("garbage.png");
        std::fs::write(&garbage, b"not a png").unwrap();
        let report = LayeredValidator::default()
            .validate_step(
                &PlannedStep::new(1, "click"),
                &execution(Some(garbage.clone()), Some(garbage), ExecutionStatus::Success),
            )
            .await;
        assert_eq!(report.reason(), Some(REASON_MISSING_SCREENSHOTS));
    }

    #[tokio::test]
    async fn test_validation_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let (before, after) = evidence(dir.path(), 3, 2);
        let validator = LayeredValidator::default();
        let step = PlannedStep::new(7, "Scroll down");
        let exec = execution(Some(before), Some(after), ExecutionStatus::Success);

        let first = validator.validate_step(&step, &exec).await;
        let second = validator.validate_step(&step, &exec).await;
        assert_eq!(first, second);
    }
}

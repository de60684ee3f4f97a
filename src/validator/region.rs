//! 区域感知校验：局部差 → 全局差 → OCR → 目标框变化
//!
//! 每个检查相互独立，返回 Option<ValidationReport>；第一个给出结论的检查胜出。
//! 四个信号都未触发才判失败（宁可误判成功，也不漏判）。

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use image::GrayImage;
use serde::{Deserialize, Serialize};

use crate::core::{ExecutionResult, PlannedStep, Region, ValidationMethod, ValidationReport};
use crate::executor::action::quoted_literal;
use crate::validator::{load_evidence, TextReader, Validator};
use crate::vision::{self, round_to};

/// 目标框内「变化像素」的单像素亮度阈值
const CHANGED_PIXEL_DELTA: u8 = 25;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegionThresholds {
    pub local_threshold: f64,
    pub global_threshold: f64,
    /// 目标框内变化像素百分比
    pub bbox_threshold: f64,
    pub pad: u32,
}

impl Default for RegionThresholds {
    fn default() -> Self {
        Self {
            local_threshold: 12.0,
            global_threshold: 6.0,
            bbox_threshold: 10.0,
            pad: 24,
        }
    }
}

struct Evidence<'a> {
    step: &'a PlannedStep,
    before: GrayImage,
    after: GrayImage,
    region: Option<Region>,
    after_path: Option<&'a Path>,
}

type Check = fn(&RegionAwareValidator, &Evidence<'_>) -> Option<ValidationReport>;

pub struct RegionAwareValidator {
    thresholds: RegionThresholds,
    ocr: Option<Arc<dyn TextReader>>,
}

impl RegionAwareValidator {
    const CHECKS: [Check; 4] = [
        Self::local_signal,
        Self::global_signal,
        Self::ocr_signal,
        Self::bbox_signal,
    ];

    pub fn new(thresholds: RegionThresholds) -> Self {
        Self {
            thresholds,
            ocr: None,
        }
    }

    pub fn from_config(thresholds: &RegionThresholds, ocr: Option<Arc<dyn TextReader>>) -> Self {
        Self {
            thresholds: *thresholds,
            ocr,
        }
    }

    pub fn with_ocr(mut self, ocr: Arc<dyn TextReader>) -> Self {
        self.ocr = Some(ocr);
        self
    }

    pub fn evaluate(&self, step: &PlannedStep, execution: &ExecutionResult) -> ValidationReport {
        let (before, after) = match load_evidence(step, execution) {
            Ok(images) => images,
            Err(report) => return report,
        };
        let evidence = Evidence {
            step,
            before,
            after,
            region: execution.region.or_else(|| step.explicit_region()),
            after_path: execution.screenshot_after.as_deref(),
        };

        Self::CHECKS
            .iter()
            .find_map(|check| check(self, &evidence))
            .unwrap_or_else(|| {
                ValidationReport::fail(step.step_id, ValidationMethod::Region)
                    .with("reason", "no_signal")
                    .with("has_region", evidence.region.is_some())
            })
    }

    /// 目标框外扩 pad 后的局部亮度差
    fn local_signal(&self, ev: &Evidence<'_>) -> Option<ValidationReport> {
        let crop = ev.region?.padded(self.thresholds.pad, ev.before.dimensions())?;
        let diff = round_to(vision::region_diff(&ev.before, &ev.after, crop)?, 3);
        (diff > self.thresholds.local_threshold).then(|| {
            ValidationReport::pass(ev.step.step_id, ValidationMethod::Region)
                .with("signal", "local")
                .with("local_diff", diff)
                .with("crop", serde_json::json!(crop))
        })
    }

    /// 全分辨率全局差
    fn global_signal(&self, ev: &Evidence<'_>) -> Option<ValidationReport> {
        let diff = round_to(vision::global_diff(&ev.before, &ev.after, 0), 3);
        (diff > self.thresholds.global_threshold).then(|| {
            ValidationReport::pass(ev.step.step_id, ValidationMethod::Pixel)
                .with("signal", "global")
                .with("diff", diff)
        })
    }

    fn ocr_signal(&self, ev: &Evidence<'_>) -> Option<ValidationReport> {
        let ocr = self.ocr.as_ref()?;
        let expected = quoted_literal(&ev.step.description)?;
        let text = ocr
            .read_text(ev.after_path?)
            .map_err(|e| tracing::debug!(error = %e, "ocr unavailable"))
            .ok()?;
        text.to_lowercase()
            .contains(&expected.to_lowercase())
            .then(|| {
                ValidationReport::pass(ev.step.step_id, ValidationMethod::Ocr)
                    .with("signal", "ocr")
                    .with("matched", expected)
            })
    }

    /// 目标框内明显变化的像素占比
    fn bbox_signal(&self, ev: &Evidence<'_>) -> Option<ValidationReport> {
        let region = ev.region?;
        let percent = round_to(
            vision::changed_percent(&ev.before, &ev.after, region, CHANGED_PIXEL_DELTA)?,
            3,
        );
        (percent > self.thresholds.bbox_threshold).then(|| {
            ValidationReport::pass(ev.step.step_id, ValidationMethod::Region)
                .with("signal", "bbox")
                .with("changed_percent", percent)
        })
    }
}

impl Default for RegionAwareValidator {
    fn default() -> Self {
        Self::new(RegionThresholds::default())
    }
}

#[async_trait]
impl Validator for RegionAwareValidator {
    async fn validate_step(&self, step: &PlannedStep, execution: &ExecutionResult) -> ValidationReport {
        self.evaluate(step, execution)
    }
}

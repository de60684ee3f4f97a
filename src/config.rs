//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `PILOT__*` 覆盖（双下划线表示嵌套，如 `PILOT__EXECUTOR__MAX_ATTEMPTS=5`）。
//! 所有字段都有默认值；没有任何配置源时得到 AppConfig::default()。

use std::path::PathBuf;

use serde::Deserialize;

use crate::core::Region;
use crate::executor::DEFAULT_FALLBACK_REGION;
use crate::validator::layered::default_always_pass_targets;
use crate::validator::RegionThresholds;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub backends: BackendsSection,
    pub executor: ExecutorSection,
    pub validator: ValidatorSection,
    pub planner: PlannerSection,
    pub llm: LlmSection,
    pub filesystem: FilesystemSection,
}

/// [backends] 段：默认检测 / 执行后端名
#[derive(Debug, Clone, Deserialize, Default)]
pub struct BackendsSection {
    pub detection: Option<String>,
    pub execution: Option<String>,
}

/// [executor] 段：重试次数、证据目录、兜底区域与运行上限
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutorSection {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_evidence_dir")]
    pub evidence_dir: PathBuf,
    #[serde(default = "default_fallback_region")]
    pub fallback_region: Region,
    /// 单次运行最多产出的步骤记录数（含重规划插入的步骤）
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
    #[serde(default = "default_max_replans")]
    pub max_replans: u32,
}

impl Default for ExecutorSection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            evidence_dir: default_evidence_dir(),
            fallback_region: default_fallback_region(),
            max_steps: default_max_steps(),
            max_replans: default_max_replans(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_evidence_dir() -> PathBuf {
    PathBuf::from("evidence")
}

fn default_fallback_region() -> Region {
    DEFAULT_FALLBACK_REGION
}

fn default_max_steps() -> usize {
    50
}

fn default_max_replans() -> u32 {
    3
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidatorVariant {
    #[default]
    Layered,
    Region,
    /// 委托执行后端的 validate
    Backend,
}

/// [validator] 段：校验器选择与各规则阈值
#[derive(Debug, Clone, Deserialize)]
pub struct ValidatorSection {
    #[serde(default)]
    pub variant: ValidatorVariant,
    #[serde(default = "default_type_threshold")]
    pub type_threshold: f64,
    #[serde(default = "default_navigation_threshold")]
    pub navigation_threshold: f64,
    #[serde(default = "default_click_threshold")]
    pub click_threshold: f64,
    #[serde(default = "default_default_threshold")]
    pub default_threshold: f64,
    /// 计算全局差前的降采样宽度
    #[serde(default = "default_downsample_width")]
    pub downsample_width: u32,
    /// 视觉变化过小、直接判通过的目标
    #[serde(default = "default_always_pass_targets")]
    pub always_pass_targets: Vec<String>,
    /// [validator.region] 子段
    #[serde(default)]
    pub region: RegionThresholds,
}

impl Default for ValidatorSection {
    fn default() -> Self {
        Self {
            variant: ValidatorVariant::default(),
            type_threshold: default_type_threshold(),
            navigation_threshold: default_navigation_threshold(),
            click_threshold: default_click_threshold(),
            default_threshold: default_default_threshold(),
            downsample_width: default_downsample_width(),
            always_pass_targets: default_always_pass_targets(),
            region: RegionThresholds::default(),
        }
    }
}

fn default_type_threshold() -> f64 {
    0.3
}

fn default_navigation_threshold() -> f64 {
    5.0
}

fn default_click_threshold() -> f64 {
    0.6
}

fn default_default_threshold() -> f64 {
    1.0
}

fn default_downsample_width() -> u32 {
    320
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlannerKind {
    #[default]
    Heuristic,
    Llm,
}

/// [planner] 段
#[derive(Debug, Clone, Deserialize, Default)]
pub struct PlannerSection {
    #[serde(default)]
    pub kind: PlannerKind,
}

/// [llm] 段：LlmPlanner 使用的 OpenAI 兼容端点；API Key 读 OPENAI_API_KEY
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    pub base_url: Option<String>,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            base_url: None,
        }
    }
}

fn default_provider() -> String {
    "openai".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

/// [filesystem] 段：内置文件系统后端的沙箱根目录，未设置时用 ./workspace
#[derive(Debug, Clone, Deserialize, Default)]
pub struct FilesystemSection {
    pub root: Option<PathBuf>,
}

impl FilesystemSection {
    pub fn root_or_default(&self) -> PathBuf {
        self.root.clone().unwrap_or_else(|| PathBuf::from("workspace"))
    }
}

/// 加载配置：默认文件（首个存在者）→ 显式路径 → 环境变量
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(path) = config_path {
        builder = builder.add_source(config::File::from(path).required(true));
    }

    builder = builder.add_source(
        config::Environment::with_prefix("PILOT")
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}

/// 同 load_config，但任何错误都记录告警并回退到默认配置
pub fn load_config_or_default(config_path: Option<PathBuf>) -> AppConfig {
    load_config(config_path).unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        AppConfig::default()
    })
}

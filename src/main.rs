//! Bee Pilot CLI
//!
//! 入口：初始化日志、加载配置、注册内置后端（mock / fs），执行一次任务并把运行报告以 JSON 打印到 stdout。
//! 退出码：0 成功，1 运行失败，2 配置错误。

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use pilot::backends::{global_snapshot, register_global, FilesystemBackend, MockBackend};
use pilot::capture::{ImageFileScreen, ScreenCapture, UnavailableScreen};
use pilot::config::{load_config, load_config_or_default, PlannerKind, ValidatorVariant};
use pilot::llm::create_llm_from_config;
use pilot::validator::{SidecarTextReader, TextReader};
use pilot::{observability, Orchestrator};

#[derive(Parser, Debug)]
#[command(
    name = "pilot",
    version,
    about = "Plan a UI task, execute it step by step through pluggable backends and validate each step from screenshots"
)]
struct Cli {
    /// Task prompt, e.g. "click the search box, type 'rust' and press enter"
    prompt: Option<String>,
    /// Config file (default: config/default.toml when present)
    #[arg(long)]
    config: Option<PathBuf>,
    /// Image used as the current screen state
    #[arg(long)]
    image: Option<PathBuf>,
    /// Detection backend name
    #[arg(long)]
    detector: Option<String>,
    /// Execution backend name
    #[arg(long)]
    executor: Option<String>,
    /// Attempts per step
    #[arg(long)]
    attempts: Option<u32>,
    /// Step validator
    #[arg(long, value_enum)]
    validator: Option<ValidatorArg>,
    /// Read OCR text from `<screenshot>.txt` sidecar files
    #[arg(long)]
    ocr_sidecar: bool,
    /// Detect once on --image and click the chosen target, without planning or validation
    #[arg(long)]
    direct: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum ValidatorArg {
    Layered,
    Region,
    Backend,
}

impl From<ValidatorArg> for ValidatorVariant {
    fn from(arg: ValidatorArg) -> Self {
        match arg {
            ValidatorArg::Layered => ValidatorVariant::Layered,
            ValidatorArg::Region => ValidatorVariant::Region,
            ValidatorArg::Backend => ValidatorVariant::Backend,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    observability::init();
    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(2)
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let mut config = match &cli.config {
        Some(path) => load_config(Some(path.clone()))
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => load_config_or_default(None),
    };
    if let Some(attempts) = cli.attempts {
        config.executor.max_attempts = attempts;
    }
    if let Some(validator) = cli.validator {
        config.validator.variant = validator.into();
    }
    if cli.detector.is_some() {
        config.backends.detection = cli.detector.clone();
    }
    if cli.executor.is_some() {
        config.backends.execution = cli.executor.clone();
    }

    let fs_root = config.filesystem.root_or_default();
    std::fs::create_dir_all(&fs_root)
        .with_context(|| format!("failed to create filesystem root {}", fs_root.display()))?;
    register_global("mock", Arc::new(MockBackend::new()));
    register_global("fs", Arc::new(FilesystemBackend::new(&fs_root)));

    let screen: Arc<dyn ScreenCapture> = match &cli.image {
        Some(image) => Arc::new(ImageFileScreen::new(image)),
        None => Arc::new(UnavailableScreen),
    };
    let ocr = cli
        .ocr_sidecar
        .then(|| Arc::new(SidecarTextReader) as Arc<dyn TextReader>);
    let llm = match config.planner.kind {
        PlannerKind::Llm => create_llm_from_config(&config.llm),
        PlannerKind::Heuristic => None,
    };
    let mut orchestrator = Orchestrator::from_config(global_snapshot(), &config, screen, llm, ocr);

    if cli.direct {
        let image = cli.image.as_deref().context("--direct requires --image")?;
        let outcome = orchestrator.detect_and_execute(image).await?;
        println!("{}", serde_json::to_string_pretty(&outcome)?);
        return Ok(exit_code(outcome.execution.succeeded()));
    }

    let prompt = cli.prompt.context("a task prompt is required")?;
    let report = orchestrator.run(&prompt).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(exit_code(report.succeeded()))
}

fn exit_code(success: bool) -> ExitCode {
    if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    }
}

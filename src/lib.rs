//! Bee Pilot - 自适应执行编排器
//!
//! 把自然语言任务拆成步骤，逐步通过可插拔后端执行，并用截图证据校验每一步。
//!
//! 模块划分：
//! - **backends**: 能力契约（Backend trait）、注册表、Mock / 文件系统后端
//! - **capture**: 截图采集与证据文件命名
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 数据模型、错误类型、编排器（FULL / PARTIAL / HYBRID / 能力路由）
//! - **executor**: 动作推断规则表与单步重试循环
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / Mock）
//! - **observability**: tracing 初始化
//! - **planner**: 启发式 / LLM 规划与重规划
//! - **validator**: 分层启发式、区域感知、后端自校验
//! - **vision**: 灰度图加载与像素差分

pub mod backends;
pub mod capture;
pub mod config;
pub mod core;
pub mod executor;
pub mod llm;
pub mod observability;
pub mod planner;
pub mod validator;
pub mod vision;

pub use crate::core::{Orchestrator, PilotError, RunReport};

//! LLM 层：客户端抽象与实现（OpenAI 兼容 / Mock），供 LlmPlanner 使用

pub mod mock;
pub mod openai;
pub mod traits;

use std::sync::Arc;

use crate::config::LlmSection;

pub use mock::MockLlmClient;
pub use openai::{OpenAiClient, TokenUsage};
pub use traits::{LlmClient, Message, Role};

/// 根据配置与环境变量创建 LLM 客户端；没有 OPENAI_API_KEY 时返回 None
pub fn create_llm_from_config(cfg: &LlmSection) -> Option<Arc<dyn LlmClient>> {
    let api_key = std::env::var("OPENAI_API_KEY").ok()?;
    let provider = cfg.provider.to_lowercase();
    if provider != "openai" {
        tracing::info!(provider = %provider, "treating provider as an OpenAI-compatible endpoint");
    }
    tracing::info!("Using OpenAI-compatible LLM ({})", cfg.model);
    Some(Arc::new(OpenAiClient::new(
        cfg.base_url.as_deref(),
        &cfg.model,
        Some(&api_key),
    )))
}

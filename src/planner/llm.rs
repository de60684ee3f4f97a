//! LLM 规划：请求 OpenAI 兼容模型输出 `{"steps": [{"description": "..."}]}`
//!
//! 步骤列表的 JSON Schema 由 schemars 生成并拼入 system prompt。
//! 计划无法解析时返回 InvalidPlan；重规划只在校验失败后请求，回复无法解析一律视为「按原计划继续」。

use std::sync::Arc;

use async_trait::async_trait;
use schemars::{schema_for, JsonSchema};
use serde::Deserialize;

use crate::core::{PilotError, PlannedStep, ValidationReport};
use crate::llm::{LlmClient, Message};
use crate::planner::{validate_plan, Planner, PlannerMemory};

const SYSTEM_PROMPT: &str = "You are a desktop automation planner. Break the user's task into short, \
imperative UI steps (click, type, press enter, scroll, navigate). Put any text that must be typed in \
single quotes. Respond with JSON only, matching this schema:";

/// 模型回复格式（仅用于解析与 Schema 生成）
#[derive(Debug, Deserialize, JsonSchema)]
struct PlanResponse {
    /// 按执行顺序排列的步骤
    steps: Vec<PlanStepSpec>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct PlanStepSpec {
    /// 单个 UI 动作，如 "Click the search box" 或 "Type 'hello'"
    description: String,
}

fn plan_schema_json() -> String {
    let schema = schema_for!(PlanResponse);
    serde_json::to_string_pretty(&schema).unwrap_or_default()
}

/// 从回复中取出 JSON（```json 代码块或首个 `{` 到最后一个 `}`）并解析
fn parse_plan_response(output: &str) -> Result<Vec<String>, PilotError> {
    let trimmed = output.trim();
    let json_str = if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        rest.find("```").map(|end| rest[..end].trim()).unwrap_or(rest.trim())
    } else {
        match (trimmed.find('{'), trimmed.rfind('}')) {
            (Some(start), Some(end)) if start < end => &trimmed[start..=end],
            _ => {
                return Err(PilotError::InvalidPlan(format!(
                    "no JSON object in model output: {}",
                    trimmed.chars().take(120).collect::<String>()
                )))
            }
        }
    };
    let parsed: PlanResponse = serde_json::from_str(json_str)
        .map_err(|e| PilotError::InvalidPlan(format!("{}: {}", e, json_str)))?;
    Ok(parsed
        .steps
        .into_iter()
        .map(|s| s.description.trim().to_string())
        .collect())
}

pub struct LlmPlanner {
    llm: Arc<dyn LlmClient>,
    memory: PlannerMemory,
    max_replans: u32,
}

impl LlmPlanner {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self {
            llm,
            memory: PlannerMemory::default(),
            max_replans: 3,
        }
    }

    pub fn with_max_replans(mut self, max_replans: u32) -> Self {
        self.max_replans = max_replans;
        self
    }

    pub fn memory(&self) -> &PlannerMemory {
        &self.memory
    }

    fn system_message() -> Message {
        Message::system(format!("{}\n{}", SYSTEM_PROMPT, plan_schema_json()))
    }

    /// 已执行步骤的简短历史，拼入重规划请求
    fn history(&self) -> String {
        self.memory
            .observations()
            .iter()
            .map(|o| {
                format!(
                    "- step {} \"{}\": {}",
                    o.step_id,
                    o.description,
                    if o.passed { "pass" } else { "fail" }
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[async_trait]
impl Planner for LlmPlanner {
    async fn plan(&mut self, prompt: &str) -> Result<Vec<PlannedStep>, PilotError> {
        self.memory.start_run(prompt);
        let messages = vec![Self::system_message(), Message::user(prompt)];
        let output = self
            .llm
            .complete(&messages)
            .await
            .map_err(PilotError::PlannerBackend)?;
        let steps: Vec<PlannedStep> = parse_plan_response(&output)?
            .into_iter()
            .enumerate()
            .map(|(i, d)| PlannedStep::new(i as u32 + 1, d))
            .collect();
        validate_plan(&steps)?;
        self.memory.assigned(&steps);
        let (_, _, total_tokens) = self.llm.token_usage();
        tracing::info!(steps = steps.len(), total_tokens, "llm plan ready");
        Ok(steps)
    }

    fn receive_observation(&mut self, step_id: u32, description: &str, observation: &ValidationReport) {
        self.memory.record(step_id, description, observation);
    }

    async fn decide_next_step(&mut self) -> Option<Vec<PlannedStep>> {
        let obs = self.memory.take_pending()?;
        if obs.passed || !self.memory.can_replan(obs.step_id, self.max_replans) {
            return None;
        }
        let request = format!(
            "Progress so far:\n{}\n\nStep {} \"{}\" failed (reason: {}). Reply with the remedial steps \
             to insert before continuing, or {{\"steps\": []}} to continue as planned.",
            self.history(),
            obs.step_id,
            obs.description,
            obs.reason.as_deref().unwrap_or("validation failed"),
        );
        let messages = vec![Self::system_message(), Message::user(request)];
        let output = match self.llm.complete(&messages).await {
            Ok(output) => output,
            Err(e) => {
                tracing::warn!(error = %e, "replanning request failed, continuing as planned");
                return None;
            }
        };
        let descriptions = match parse_plan_response(&output) {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!(error = %e, "unparsable replanning answer, continuing as planned");
                return None;
            }
        };
        let descriptions: Vec<String> = descriptions.into_iter().filter(|d| !d.is_empty()).collect();
        if descriptions.is_empty() {
            return None;
        }
        Some(self.memory.replan(obs.step_id, &descriptions))
    }
}

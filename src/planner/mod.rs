//! Planner：把自然语言任务拆成有序步骤，并在每步之后决定是否插入补救步骤
//!
//! - HeuristicPlanner：按分隔符与连接词拆句，失败后按动作类型插入固定的补救步骤
//! - LlmPlanner：请求 OpenAI 兼容模型输出 JSON 步骤列表
//!
//! decide_next_step 返回 None 表示「按原计划继续」；已执行的步骤永远不会被改写。

pub mod heuristic;
pub mod llm;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::config::{PlannerKind, PlannerSection};
use crate::core::{PilotError, PlannedStep, ValidationMethod, ValidationReport};
use crate::llm::LlmClient;

pub use heuristic::HeuristicPlanner;
pub use llm::LlmPlanner;

#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(&mut self, prompt: &str) -> Result<Vec<PlannedStep>, PilotError>;

    /// 记录一步的校验结论
    fn receive_observation(&mut self, step_id: u32, description: &str, observation: &ValidationReport);

    /// 每步之后调用；返回需要插入到剩余步骤之前的新步骤
    async fn decide_next_step(&mut self) -> Option<Vec<PlannedStep>>;
}

/// 一条已记录的观察
#[derive(Debug, Clone, Serialize)]
pub struct Observation {
    pub step_id: u32,
    pub description: String,
    pub passed: bool,
    pub method: ValidationMethod,
    pub reason: Option<String>,
}

/// 规划器的运行记忆：历史任务、观察、重规划记账
#[derive(Debug, Default)]
pub struct PlannerMemory {
    prompts: Vec<String>,
    observations: Vec<Observation>,
    /// 插入步骤 → 它所补救的原始步骤
    origins: HashMap<u32, u32>,
    replanned: HashSet<u32>,
    replans: u32,
    next_id: u32,
    pending: bool,
}

impl PlannerMemory {
    /// 新一轮 run：保留历史任务与观察，重规划记账与编号从头开始
    pub fn start_run(&mut self, prompt: &str) {
        self.prompts.push(prompt.to_string());
        self.origins.clear();
        self.replanned.clear();
        self.replans = 0;
        self.next_id = 0;
        self.pending = false;
    }

    pub fn prompts(&self) -> &[String] {
        &self.prompts
    }

    pub fn observations(&self) -> &[Observation] {
        &self.observations
    }

    pub fn record(&mut self, step_id: u32, description: &str, report: &ValidationReport) {
        self.observations.push(Observation {
            step_id,
            description: description.to_string(),
            passed: report.passed(),
            method: report.method,
            reason: report.reason().map(String::from),
        });
        self.pending = true;
    }

    /// 取出尚未处理的最新观察（每条观察只处理一次）
    pub fn take_pending(&mut self) -> Option<Observation> {
        if !std::mem::take(&mut self.pending) {
            return None;
        }
        self.observations.last().cloned()
    }

    /// 计划产出后调用：后续插入步骤从最大 id 之后继续编号
    pub fn assigned(&mut self, steps: &[PlannedStep]) {
        let max = steps.iter().map(|s| s.step_id).max().unwrap_or(0);
        self.next_id = self.next_id.max(max);
    }

    pub fn next_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    /// 步骤追溯到的原始步骤
    pub fn origin_of(&self, step_id: u32) -> u32 {
        self.origins.get(&step_id).copied().unwrap_or(step_id)
    }

    /// 是否还能为该步骤重规划：每个原始步骤至多一次，总数不超过 max
    pub fn can_replan(&self, step_id: u32, max: u32) -> bool {
        self.replans < max && !self.replanned.contains(&self.origin_of(step_id))
    }

    /// 构造补救步骤并记账
    pub fn replan(&mut self, step_id: u32, descriptions: &[String]) -> Vec<PlannedStep> {
        let origin = self.origin_of(step_id);
        self.replanned.insert(origin);
        self.replans += 1;
        descriptions
            .iter()
            .map(|d| {
                let id = self.next_id();
                self.origins.insert(id, origin);
                PlannedStep::new(id, d.clone()).with_metadata("replan_of", origin)
            })
            .collect()
    }

    pub fn replans(&self) -> u32 {
        self.replans
    }
}

/// 结构校验：非空、描述非空、step_id 唯一
pub fn validate_plan(steps: &[PlannedStep]) -> Result<(), PilotError> {
    if steps.is_empty() {
        return Err(PilotError::InvalidPlan("plan has no steps".to_string()));
    }
    let mut seen = HashSet::new();
    for step in steps {
        if step.description.trim().is_empty() {
            return Err(PilotError::InvalidPlan(format!(
                "step {} has an empty description",
                step.step_id
            )));
        }
        if !seen.insert(step.step_id) {
            return Err(PilotError::InvalidPlan(format!(
                "duplicate step_id {}",
                step.step_id
            )));
        }
    }
    Ok(())
}

/// 按配置构造规划器
pub fn from_config(
    section: &PlannerSection,
    llm: Option<Arc<dyn LlmClient>>,
    max_replans: u32,
) -> Box<dyn Planner> {
    match (section.kind, llm) {
        (PlannerKind::Llm, Some(llm)) => Box::new(LlmPlanner::new(llm).with_max_replans(max_replans)),
        (PlannerKind::Llm, None) => {
            tracing::warn!("llm planner requested without a client, using heuristic planner");
            Box::new(HeuristicPlanner::new().with_max_replans(max_replans))
        }
        (PlannerKind::Heuristic, _) => Box::new(HeuristicPlanner::new().with_max_replans(max_replans)),
    }
}

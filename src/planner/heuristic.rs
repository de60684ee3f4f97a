//! 启发式规划：按 `;`、`,`、换行与连接词（and then / then / after that / finally）拆分任务
//!
//! 引号内的文本原样保留，不参与拆分。失败后的补救规则：
//! - 输入类步骤失败 → 先点击输入框，再重试输入
//! - 回车 / 导航类步骤失败 → 补一次回车
//!
//! 证据缺失（missing_screenshots）时不重规划。

use async_trait::async_trait;

use crate::core::{PilotError, PlannedStep, ValidationReport};
use crate::executor::action::{first_cue, Cue};
use crate::planner::{validate_plan, Planner, PlannerMemory};
use crate::validator::REASON_MISSING_SCREENSHOTS;

const CONNECTIVES: [&str; 4] = [" and then ", " then ", " after that ", " finally "];
const LEADING_WORDS: [&str; 5] = ["and then ", "then ", "and ", "after that ", "finally "];

pub const FOCUS_INPUT_STEP: &str = "Click the text input field";
pub const PRESS_ENTER_STEP: &str = "Press Enter";

pub struct HeuristicPlanner {
    memory: PlannerMemory,
    max_replans: u32,
}

impl HeuristicPlanner {
    pub fn new() -> Self {
        Self {
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
}

impl Default for HeuristicPlanner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Planner for HeuristicPlanner {
    async fn plan(&mut self, prompt: &str) -> Result<Vec<PlannedStep>, PilotError> {
        self.memory.start_run(prompt);
        let steps: Vec<PlannedStep> = split_clauses(prompt)
            .into_iter()
            .enumerate()
            .map(|(i, clause)| PlannedStep::new(i as u32 + 1, clause))
            .collect();
        validate_plan(&steps)?;
        self.memory.assigned(&steps);
        tracing::debug!(steps = steps.len(), "heuristic plan ready");
        Ok(steps)
    }

    fn receive_observation(&mut self, step_id: u32, description: &str, observation: &ValidationReport) {
        self.memory.record(step_id, description, observation);
    }

    async fn decide_next_step(&mut self) -> Option<Vec<PlannedStep>> {
        let obs = self.memory.take_pending()?;
        if obs.passed || obs.reason.as_deref() == Some(REASON_MISSING_SCREENSHOTS) {
            return None;
        }
        if !self.memory.can_replan(obs.step_id, self.max_replans) {
            return None;
        }
        let remedy = match first_cue(&obs.description)? {
            Cue::Type => vec![FOCUS_INPUT_STEP.to_string(), obs.description.clone()],
            Cue::Navigate => vec![PRESS_ENTER_STEP.to_string()],
            Cue::Scroll | Cue::Click => return None,
        };
        let steps = self.memory.replan(obs.step_id, &remedy);
        tracing::info!(
            step_id = obs.step_id,
            inserted = steps.len(),
            replans = self.memory.replans(),
            "inserting remedial steps"
        );
        Some(steps)
    }
}

fn is_quote(c: char) -> bool {
    matches!(c, '"' | '\'' | '“' | '‘')
}

fn closing_quote(open: char) -> char {
    match open {
        '“' => '”',
        '‘' => '’',
        other => other,
    }
}

/// chars[i..] 是否以某个连接词开头（ASCII 大小写不敏感），返回其长度
fn connective_at(chars: &[char], i: usize) -> Option<usize> {
    CONNECTIVES.iter().find_map(|sep| {
        let len = sep.chars().count();
        let window = chars.get(i..i + len)?;
        window
            .iter()
            .zip(sep.chars())
            .all(|(a, b)| a.to_ascii_lowercase() == b)
            .then_some(len)
    })
}

fn strip_leading_words(clause: &str) -> &str {
    let mut rest = clause;
    loop {
        let lower = rest.to_ascii_lowercase();
        match LEADING_WORDS.iter().find(|w| lower.starts_with(*w)) {
            Some(word) => rest = rest[word.len()..].trim_start(),
            None => return rest,
        }
    }
}

fn finish_clause(current: &mut String, clauses: &mut Vec<String>) {
    let clause = std::mem::take(current);
    let clause = strip_leading_words(clause.trim()).trim_end_matches('.').trim();
    if !clause.is_empty() {
        clauses.push(clause.to_string());
    }
}

/// 引号感知的拆句
pub fn split_clauses(prompt: &str) -> Vec<String> {
    let chars: Vec<char> = prompt.chars().collect();
    let mut clauses = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if let Some(open) = quote {
            current.push(c);
            if c == closing_quote(open) {
                quote = None;
            }
            i += 1;
            continue;
        }
        // 单引号只有出现在词首时才算开引号（避免 don't）
        let word_start = i == 0 || !chars[i - 1].is_alphanumeric();
        if is_quote(c) && (c != '\'' || word_start) {
            quote = Some(c);
            current.push(c);
        } else if matches!(c, ';' | ',' | '\n') {
            finish_clause(&mut current, &mut clauses);
        } else if let Some(len) = connective_at(&chars, i) {
            finish_clause(&mut current, &mut clauses);
            i += len;
            continue;
        } else {
            current.push(c);
        }
        i += 1;
    }
    finish_clause(&mut current, &mut clauses);
    clauses
}

//! 步骤动作推断：集中式、按序匹配的词法规则表
//!
//! Executor 用 classify_action 决定下发的动作；Validator 用 has_cue 判断描述隐含的动作；
//! 能力型路由用 classify_domain 判断任务领域。三者共用同一套归一化与短语匹配，
//! 规则顺序即优先级，第一个命中者胜出。引号内文本不参与线索匹配。

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::backends::TaskDomain;
use crate::core::ActionKind;

static QUOTED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""([^"]+)"|“([^”]+)”|‘([^’]+)’|(?:^|[^\w])'([^']+)'"#).expect("valid quote pattern")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScrollDirection {
    Up,
    Down,
    Left,
    Right,
}

/// 推断出的动作
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepAction {
    Click,
    Type { text: String },
    Scroll { direction: ScrollDirection },
    Navigate,
    Unknown,
}

impl StepAction {
    pub fn kind(&self) -> ActionKind {
        match self {
            StepAction::Click | StepAction::Unknown => ActionKind::Click,
            StepAction::Type { .. } => ActionKind::Type,
            StepAction::Scroll { .. } => ActionKind::Scroll,
            StepAction::Navigate => ActionKind::Navigate,
        }
    }

    /// 无法识别的动作按点击下发
    pub fn dispatchable(self) -> StepAction {
        match self {
            StepAction::Unknown => StepAction::Click,
            other => other,
        }
    }
}

/// 描述中隐含的动作线索
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cue {
    Type,
    Navigate,
    Scroll,
    Click,
}

struct CueRule {
    cue: Cue,
    phrases: &'static [&'static str],
}

const CUE_RULES: &[CueRule] = &[
    CueRule {
        cue: Cue::Type,
        phrases: &["type", "enter text", "input text", "write", "fill in", "search for"],
    },
    CueRule {
        cue: Cue::Navigate,
        phrases: &[
            "press enter",
            "hit enter",
            "press return",
            "execute",
            "navigate",
            "go to",
            "visit",
            "submit",
            "open url",
        ],
    },
    CueRule {
        cue: Cue::Scroll,
        phrases: &["scroll", "page down", "page up"],
    },
    CueRule {
        cue: Cue::Click,
        phrases: &["click", "double click", "tap", "press", "select", "choose", "open", "focus"],
    },
];

struct DomainRule {
    domain: TaskDomain,
    phrases: &'static [&'static str],
}

const DOMAIN_RULES: &[DomainRule] = &[
    DomainRule {
        domain: TaskDomain::Filesystem,
        phrases: &[
            "create folder",
            "create a folder",
            "create directory",
            "create a directory",
            "make folder",
            "make directory",
            "new folder",
            "mkdir",
            "create file",
            "create a file",
            "create a new file",
            "delete file",
            "remove file",
            "list files",
        ],
    },
    DomainRule {
        domain: TaskDomain::Browser,
        phrases: &["open url", "browse to", "open website", "open the website", "web page"],
    },
];

/// 小写、去掉引号内容、非字母数字替换为空格，并在两端补空格便于整词匹配
fn normalize(text: &str) -> String {
    let unquoted = QUOTED.replace_all(text, " ");
    let mut out = String::with_capacity(unquoted.len() + 2);
    out.push(' ');
    let mut last_space = true;
    for c in unquoted.chars().flat_map(char::to_lowercase) {
        if c.is_alphanumeric() {
            out.push(c);
            last_space = false;
        } else if !last_space {
            out.push(' ');
            last_space = true;
        }
    }
    if !last_space {
        out.push(' ');
    }
    out
}

fn contains_phrase(normalized: &str, phrase: &str) -> bool {
    normalized.contains(&format!(" {} ", phrase))
}

fn matches_rule(normalized: &str, phrases: &[&str]) -> bool {
    phrases.iter().any(|p| contains_phrase(normalized, p))
}

/// 描述是否含有某类动作线索（不考虑优先级）
pub fn has_cue(text: &str, cue: Cue) -> bool {
    let normalized = normalize(text);
    CUE_RULES
        .iter()
        .filter(|rule| rule.cue == cue)
        .any(|rule| matches_rule(&normalized, rule.phrases))
}

/// 按规则表顺序返回第一个命中的线索
pub fn first_cue(text: &str) -> Option<Cue> {
    let normalized = normalize(text);
    CUE_RULES
        .iter()
        .find(|rule| matches_rule(&normalized, rule.phrases))
        .map(|rule| rule.cue)
}

/// 纯文本函数：从步骤描述推断动作
pub fn classify_action(text: &str) -> StepAction {
    match first_cue(text) {
        Some(Cue::Type) => StepAction::Type {
            text: typed_text(text).unwrap_or_default(),
        },
        Some(Cue::Navigate) => StepAction::Navigate,
        Some(Cue::Scroll) => StepAction::Scroll {
            direction: scroll_direction(text),
        },
        Some(Cue::Click) => StepAction::Click,
        None => StepAction::Unknown,
    }
}

/// 能力型后端负责的领域（如「create folder reports」→ filesystem）
pub fn classify_domain(text: &str) -> Option<TaskDomain> {
    let normalized = normalize(text);
    DOMAIN_RULES
        .iter()
        .find(|rule| matches_rule(&normalized, rule.phrases))
        .map(|rule| rule.domain)
}

/// 描述中第一个引号包裹的片段
pub fn quoted_literal(text: &str) -> Option<String> {
    QUOTED.captures(text).and_then(|caps| {
        caps.iter()
            .skip(1)
            .flatten()
            .next()
            .map(|m| m.as_str().trim().to_string())
            .filter(|s| !s.is_empty())
    })
}

/// 要输入的文本：优先引号片段，否则取 type 之后、连接词之前的部分
fn typed_text(text: &str) -> Option<String> {
    if let Some(literal) = quoted_literal(text) {
        return Some(literal);
    }
    let lower = text.to_ascii_lowercase();
    let start = lower.find("type ")? + "type ".len();
    let rest = lower.get(start..)?;
    let end = [" and ", " then ", " into ", " in "]
        .iter()
        .filter_map(|sep| rest.find(sep))
        .min()
        .unwrap_or(rest.len());
    let typed = text.get(start..start + end)?.trim();
    (!typed.is_empty()).then(|| typed.to_string())
}

fn scroll_direction(text: &str) -> ScrollDirection {
    let normalized = normalize(text);
    if contains_phrase(&normalized, "up") || contains_phrase(&normalized, "page up") {
        ScrollDirection::Up
    } else if contains_phrase(&normalized, "left") {
        ScrollDirection::Left
    } else if contains_phrase(&normalized, "right") {
        ScrollDirection::Right
    } else {
        ScrollDirection::Down
    }
}

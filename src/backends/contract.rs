//! 集成契约：后端声明的控制程度、能力集合与任务领域
//!
//! 注册时从后端元数据推导一次，之后只读；编排模式完全由执行后端的契约决定。

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::backends::Backend;

/// 后端希望的控制程度
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum IntegrationMode {
    /// 后端自行规划、执行与校验
    Full,
    /// 由编排器逐步驱动（默认）
    #[default]
    Partial,
    /// 混合：优先使用后端自带的检测与规划
    Hybrid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Detect,
    Execute,
    Validate,
    Plan,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capability::Detect => write!(f, "detect"),
            Capability::Execute => write!(f, "execute"),
            Capability::Validate => write!(f, "validate"),
            Capability::Plan => write!(f, "plan"),
        }
    }
}

/// 未声明能力时的默认集合
pub const DEFAULT_CAPABILITIES: [Capability; 3] =
    [Capability::Detect, Capability::Execute, Capability::Validate];

/// 能力型后端（不依赖视觉定位）负责的任务领域
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskDomain {
    Filesystem,
    Browser,
}

impl fmt::Display for TaskDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskDomain::Filesystem => write!(f, "filesystem"),
            TaskDomain::Browser => write!(f, "browser"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrationContract {
    pub backend_name: String,
    pub mode: IntegrationMode,
    pub capabilities: BTreeSet<Capability>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub domains: Vec<TaskDomain>,
}

impl IntegrationContract {
    /// 从后端声明推导契约；未声明的 mode / capabilities 使用默认值
    pub fn derive(name: &str, backend: &dyn Backend) -> Self {
        let capabilities = backend
            .capabilities()
            .map(|caps| caps.into_iter().collect())
            .unwrap_or_else(|| DEFAULT_CAPABILITIES.into_iter().collect());
        Self {
            backend_name: name.to_string(),
            mode: backend.integration_mode().unwrap_or_default(),
            capabilities,
            domains: backend.domains(),
        }
    }

    pub fn supports(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    /// 声明了领域且可执行，才会被直接路由
    pub fn handles(&self, domain: TaskDomain) -> bool {
        self.supports(Capability::Execute) && self.domains.contains(&domain)
    }
}

//! 后端注册表
//!
//! 按名称存储 Arc<dyn Backend> 与注册时推导出的 IntegrationContract。
//! 进程级注册表通过 global() 访问；Orchestrator 只持有注入的实例（通常是 global_snapshot()），
//! 测试用 global_snapshot / restore_global 隔离全局修改。

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock, RwLock};

use crate::backends::{Backend, IntegrationContract, TaskDomain};
use crate::core::PilotError;

#[derive(Clone)]
struct RegisteredBackend {
    backend: Arc<dyn Backend>,
    contract: IntegrationContract,
}

/// 后端注册表：register / resolve / contract_of / require
#[derive(Clone, Default)]
pub struct BackendRegistry {
    entries: HashMap<String, RegisteredBackend>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册（同名覆盖后端与契约），返回推导出的契约
    pub fn register(&mut self, name: impl Into<String>, backend: Arc<dyn Backend>) -> IntegrationContract {
        let name = name.into();
        let contract = IntegrationContract::derive(&name, backend.as_ref());
        tracing::debug!(
            backend = %name,
            mode = ?contract.mode,
            capabilities = ?contract.capabilities,
            "backend registered"
        );
        self.entries.insert(
            name,
            RegisteredBackend {
                backend,
                contract: contract.clone(),
            },
        );
        contract
    }

    /// 未知名称返回 None，由调用方决定是否视为配置错误
    pub fn resolve(&self, name: &str) -> Option<Arc<dyn Backend>> {
        self.entries.get(name).map(|e| e.backend.clone())
    }

    pub fn contract_of(&self, name: &str) -> Option<IntegrationContract> {
        self.entries.get(name).map(|e| e.contract.clone())
    }

    /// 查找后端与契约，未注册时返回 UnregisteredBackend
    pub fn require(&self, name: &str) -> Result<(Arc<dyn Backend>, IntegrationContract), PilotError> {
        self.entries
            .get(name)
            .map(|e| (e.backend.clone(), e.contract.clone()))
            .ok_or_else(|| PilotError::UnregisteredBackend(name.to_string()))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.keys().cloned().collect();
        names.sort();
        names
    }

    /// 负责该领域的能力型后端；多个候选时按名称取第一个，保证结果确定
    pub fn capability_backend_for(&self, domain: TaskDomain) -> Option<(String, Arc<dyn Backend>)> {
        self.names().into_iter().find_map(|name| {
            let entry = self.entries.get(&name)?;
            entry
                .contract
                .handles(domain)
                .then(|| (name.clone(), entry.backend.clone()))
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("backends", &self.names())
            .finish()
    }
}

static GLOBAL: OnceLock<RwLock<BackendRegistry>> = OnceLock::new();

/// 进程级注册表；并发注册需调用方自行串行化
pub fn global() -> &'static RwLock<BackendRegistry> {
    GLOBAL.get_or_init(|| RwLock::new(BackendRegistry::new()))
}

pub fn register_global(name: impl Into<String>, backend: Arc<dyn Backend>) -> IntegrationContract {
    let mut registry = global().write().unwrap_or_else(|e| e.into_inner());
    registry.register(name, backend)
}

/// 当前全局注册表的拷贝（后端为共享引用）
pub fn global_snapshot() -> BackendRegistry {
    global().read().unwrap_or_else(|e| e.into_inner()).clone()
}

/// 用快照整体替换全局注册表
pub fn restore_global(snapshot: BackendRegistry) {
    let mut registry = global().write().unwrap_or_else(|e| e.into_inner());
    *registry = snapshot;
}

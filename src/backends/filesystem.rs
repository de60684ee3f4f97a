//! 沙箱文件系统能力后端
//!
//! SafeFs 绑定 root_dir，所有路径必须落在 root 下（禁止 ../ 与绝对路径逃逸）；
//! FilesystemBackend 把「create folder X」「create file X」「list files」之类的描述直接落到磁盘，
//! 不经过截图与视觉定位。

use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde_json::json;

use crate::backends::{
    ActionOutcome, ActionRequest, ActionStatus, Backend, BackendError, Capability, IntegrationMode,
    TaskDomain,
};

/// 目标名：引号内整段（可含空格），否则取到空白为止
const NAME: &str = r#"(?:["'“‘]([^"'”’]+)["'”’]|([^\s"'”’]+))"#;

fn name_pattern(prefix: &str, suffix: &str) -> Regex {
    Regex::new(&format!("{prefix}{NAME}{suffix}")).expect("valid filesystem pattern")
}

static CREATE_DIR: LazyLock<Regex> = LazyLock::new(|| {
    name_pattern(
        r"(?i)\b(?:create|make|new|mkdir)\b(?:\s+(?:a|new))*\s*(?:folder|directory|dir)?\s+(?:named\s+|called\s+)?",
        "",
    )
});

static CREATE_FILE: LazyLock<Regex> = LazyLock::new(|| {
    name_pattern(
        r"(?i)\b(?:create|make|touch)\b(?:\s+(?:a|new|empty))*\s+file\s+(?:named\s+|called\s+)?",
        "",
    )
});

static DELETE_FILE: LazyLock<Regex> = LazyLock::new(|| {
    name_pattern(r"(?i)\b(?:delete|remove)\b\s+(?:the\s+)?file\s+", "")
});

static LIST_DIR: LazyLock<Regex> = LazyLock::new(|| {
    name_pattern(
        r"(?i)\blist\b\s+(?:the\s+)?(?:files|folder|directory|contents)(?:\s+(?:in|of)\s+",
        ")?",
    )
});

/// 沙箱文件系统：路径逐段校验，目标不存在时同样可以解析（用于创建）
#[derive(Debug, Clone)]
pub struct SafeFs {
    root_dir: PathBuf,
}

impl SafeFs {
    pub fn new(root_dir: impl AsRef<Path>) -> Self {
        let root = root_dir.as_ref().to_path_buf();
        let root_dir = root.canonicalize().unwrap_or(root);
        Self { root_dir }
    }

    pub fn root(&self) -> &Path {
        &self.root_dir
    }

    /// 只允许普通路径段；`..`、绝对路径一律视为逃逸
    pub fn resolve(&self, path: &str) -> Result<PathBuf, BackendError> {
        let path = path.trim().trim_start_matches("./");
        let mut resolved = self.root_dir.clone();
        for component in Path::new(path).components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::CurDir => {}
                _ => {
                    return Err(BackendError::Failed(format!(
                        "Path escape attempt: {}",
                        path
                    )))
                }
            }
        }
        Ok(resolved)
    }

    pub fn create_dir(&self, path: &str) -> Result<PathBuf, BackendError> {
        let resolved = self.resolve(path)?;
        std::fs::create_dir_all(&resolved)
            .map_err(|e| BackendError::Failed(format!("Create dir failed: {}", e)))?;
        Ok(resolved)
    }

    pub fn create_file(&self, path: &str) -> Result<PathBuf, BackendError> {
        let resolved = self.resolve(path)?;
        if let Some(parent) = resolved.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| BackendError::Failed(format!("Create dir failed: {}", e)))?;
        }
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&resolved)
            .map_err(|e| BackendError::Failed(format!("Create file failed: {}", e)))?;
        Ok(resolved)
    }

    pub fn remove_file(&self, path: &str) -> Result<PathBuf, BackendError> {
        let resolved = self.resolve(path)?;
        std::fs::remove_file(&resolved)
            .map_err(|e| BackendError::Failed(format!("Remove failed: {}", e)))?;
        Ok(resolved)
    }

    pub fn list_dir(&self, path: &str) -> Result<Vec<String>, BackendError> {
        let base = self.resolve(path)?;
        let mut entries = Vec::new();
        for e in std::fs::read_dir(&base)
            .map_err(|e| BackendError::Failed(format!("List failed: {}", e)))?
        {
            let e = e.map_err(|e| BackendError::Failed(e.to_string()))?;
            let name = e.file_name().to_string_lossy().to_string();
            if !name.starts_with('.') {
                let ty = if e.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                    "/"
                } else {
                    ""
                };
                entries.push(format!("{}{}", name, ty));
            }
        }
        entries.sort();
        Ok(entries)
    }
}

/// 文件系统能力后端：领域 filesystem，仅声明 execute
pub struct FilesystemBackend {
    fs: SafeFs,
}

impl FilesystemBackend {
    pub fn new(root_dir: impl AsRef<Path>) -> Self {
        Self {
            fs: SafeFs::new(root_dir),
        }
    }

    fn relative(&self, path: &Path) -> String {
        path.strip_prefix(self.fs.root())
            .unwrap_or(path)
            .display()
            .to_string()
    }
}

#[async_trait]
impl Backend for FilesystemBackend {
    fn integration_mode(&self) -> Option<IntegrationMode> {
        Some(IntegrationMode::Partial)
    }

    fn capabilities(&self) -> Option<Vec<Capability>> {
        Some(vec![Capability::Execute])
    }

    fn domains(&self) -> Vec<TaskDomain> {
        vec![TaskDomain::Filesystem]
    }

    async fn execute(&self, request: &ActionRequest) -> Result<ActionOutcome, BackendError> {
        let text = request.description.as_str();
        tracing::info!(request = %text, "filesystem backend execute");

        // 文件规则先于目录规则：「create file a.txt」不应被当成目录
        if let Some(name) = capture(&CREATE_FILE, text) {
            let created = self.fs.create_file(&name)?;
            return Ok(ActionOutcome::success()
                .with_detail(format!("created file {}", self.relative(&created)))
                .with_payload(json!({ "op": "create_file", "path": self.relative(&created) })));
        }
        if let Some(name) = capture(&DELETE_FILE, text) {
            let removed = self.fs.remove_file(&name)?;
            return Ok(ActionOutcome::success()
                .with_detail(format!("removed file {}", self.relative(&removed)))
                .with_payload(json!({ "op": "remove_file", "path": self.relative(&removed) })));
        }
        if LIST_DIR.is_match(text) {
            let dir = capture(&LIST_DIR, text).unwrap_or_else(|| ".".to_string());
            let entries = self.fs.list_dir(&dir)?;
            return Ok(ActionOutcome::success()
                .with_detail(format!("{} entries", entries.len()))
                .with_payload(json!({ "op": "list", "path": dir, "entries": entries })));
        }
        if let Some(name) = capture(&CREATE_DIR, text) {
            let created = self.fs.create_dir(&name)?;
            return Ok(ActionOutcome::success()
                .with_detail(format!("created folder {}", self.relative(&created)))
                .with_payload(json!({ "op": "create_dir", "path": self.relative(&created) })));
        }

        tracing::warn!(request = %text, "no filesystem rule matched");
        Ok(ActionOutcome::failed(format!("unrecognised filesystem request: {}", text)))
    }
}

fn capture(pattern: &Regex, text: &str) -> Option<String> {
    pattern
        .captures(text)
        .and_then(|c| match (c.get(1), c.get(2)) {
            (Some(quoted), _) => Some(quoted.as_str().trim().to_string()),
            (None, Some(bare)) => Some(bare.as_str().trim_end_matches(['.', ',']).to_string()),
            (None, None) => None,
        })
        .filter(|s| !s.is_empty())
}

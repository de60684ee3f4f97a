//! 截图采集
//!
//! ScreenCapture 是外部协作者：把「当前屏幕」写到指定路径。证据文件名为 label + 时间戳 + 随机后缀，
//! 写入后不会自动清理。

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

#[async_trait]
pub trait ScreenCapture: Send + Sync {
    /// 将当前屏幕写入 dest（PNG）
    async fn capture(&self, dest: &Path) -> Result<(), String>;
}

/// 以一张固定图片作为屏幕状态（CLI 的 --image）
#[derive(Debug, Clone)]
pub struct ImageFileScreen {
    source: PathBuf,
}

impl ImageFileScreen {
    pub fn new(source: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
        }
    }
}

#[async_trait]
impl ScreenCapture for ImageFileScreen {
    async fn capture(&self, dest: &Path) -> Result<(), String> {
        tokio::fs::copy(&self.source, dest)
            .await
            .map(|_| ())
            .map_err(|e| format!("copy {} failed: {}", self.source.display(), e))
    }
}

/// 依次回放一组帧，用完后重复最后一帧（测试与离线回放）
#[derive(Debug)]
pub struct FrameSequenceScreen {
    frames: Vec<PathBuf>,
    cursor: AtomicUsize,
}

impl FrameSequenceScreen {
    pub fn new(frames: Vec<PathBuf>) -> Self {
        Self {
            frames,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn captured(&self) -> usize {
        self.cursor.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ScreenCapture for FrameSequenceScreen {
    async fn capture(&self, dest: &Path) -> Result<(), String> {
        let index = self.cursor.fetch_add(1, Ordering::SeqCst);
        let frame = self
            .frames
            .get(index)
            .or_else(|| self.frames.last())
            .ok_or_else(|| "no frames configured".to_string())?;
        tokio::fs::copy(frame, dest)
            .await
            .map(|_| ())
            .map_err(|e| format!("copy {} failed: {}", frame.display(), e))
    }
}

/// 未配置屏幕来源：每次采集都失败，后续校验会得到 missing_screenshots
#[derive(Debug, Default)]
pub struct UnavailableScreen;

#[async_trait]
impl ScreenCapture for UnavailableScreen {
    async fn capture(&self, _dest: &Path) -> Result<(), String> {
        Err("no screen source configured".to_string())
    }
}

/// `<dir>/<label>_<YYYYmmdd_HHMMSS_mmm>_<8 hex>.png`
pub fn evidence_path(dir: &Path, label: &str) -> PathBuf {
    let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S_%3f");
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    dir.join(format!("{}_{}_{}.png", label, stamp, &suffix[..8]))
}

/// 采集一张证据截图；失败时记录告警并返回 None，不中断步骤
pub async fn capture_evidence(screen: &dyn ScreenCapture, dir: &Path, label: &str) -> Option<PathBuf> {
    if let Err(e) = tokio::fs::create_dir_all(dir).await {
        tracing::warn!(dir = %dir.display(), error = %e, "evidence dir unavailable");
        return None;
    }
    let path = evidence_path(dir, label);
    match screen.capture(&path).await {
        Ok(()) => Some(path),
        Err(e) => {
            tracing::warn!(label = %label, error = %e, "screenshot capture failed");
            None
        }
    }
}

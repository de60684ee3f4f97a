//! OCR 协作者：text(image) → string
//!
//! 真正的文字识别引擎不在本 crate 内；SidecarTextReader 读取外部 OCR 写在截图旁的 `<image>.txt`。

use std::path::Path;

pub trait TextReader: Send + Sync {
    fn read_text(&self, image: &Path) -> Result<String, String>;
}

/// 读取截图同名 .txt 旁车文件
#[derive(Debug, Default, Clone)]
pub struct SidecarTextReader;

impl TextReader for SidecarTextReader {
    fn read_text(&self, image: &Path) -> Result<String, String> {
        let sidecar = image.with_extension("txt");
        std::fs::read_to_string(&sidecar)
            .map_err(|e| format!("ocr sidecar {} unavailable: {}", sidecar.display(), e))
    }
}

/// 固定返回同一段文本（测试用）
#[derive(Debug, Clone)]
pub struct StaticTextReader(pub String);

impl StaticTextReader {
    pub fn new(text: impl Into<String>) -> Self {
        Self(text.into())
    }
}

impl TextReader for StaticTextReader {
    fn read_text(&self, _image: &Path) -> Result<String, String> {
        Ok(self.0.clone())
    }
}

//! 截图证据的像素计算：加载灰度图、降采样、全局 / 区域亮度差、区域变化像素占比
//!
//! 所有差值都以 0..=255 的平均绝对亮度差表示；尺寸不一致时 after 会被缩放到 before 的尺寸。

use std::path::{Path, PathBuf};

use image::imageops::{self, FilterType};
use image::GrayImage;
use thiserror::Error;

use crate::core::Region;

#[derive(Error, Debug)]
pub enum VisionError {
    #[error("screenshot not found: {0}")]
    Missing(PathBuf),

    #[error("failed to decode {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
}

pub fn load_luma(path: &Path) -> Result<GrayImage, VisionError> {
    if !path.exists() {
        return Err(VisionError::Missing(path.to_path_buf()));
    }
    image::open(path)
        .map(|img| img.to_luma8())
        .map_err(|source| VisionError::Decode {
            path: path.to_path_buf(),
            source,
        })
}

/// 宽度超过 max_width 时按比例缩小；否则原样返回
pub fn downsample(img: &GrayImage, max_width: u32) -> GrayImage {
    let (w, h) = img.dimensions();
    if max_width == 0 || w <= max_width {
        return img.clone();
    }
    let nh = ((h as u64 * max_width as u64) / w as u64).max(1) as u32;
    imageops::resize(img, max_width, nh, FilterType::Triangle)
}

fn match_dimensions(img: &GrayImage, dims: (u32, u32)) -> GrayImage {
    if img.dimensions() == dims {
        img.clone()
    } else {
        imageops::resize(img, dims.0, dims.1, FilterType::Triangle)
    }
}

/// 逐像素平均绝对亮度差（要求尺寸一致）
pub fn mean_abs_diff(a: &GrayImage, b: &GrayImage) -> f64 {
    let total = a.width() as u64 * a.height() as u64;
    if total == 0 {
        return 0.0;
    }
    let sum: u64 = a
        .pixels()
        .zip(b.pixels())
        .map(|(pa, pb)| (pa.0[0] as i16 - pb.0[0] as i16).unsigned_abs() as u64)
        .sum();
    sum as f64 / total as f64
}

/// 降采样后的全局差值
pub fn global_diff(before: &GrayImage, after: &GrayImage, max_width: u32) -> f64 {
    let a = downsample(before, max_width);
    let b = match_dimensions(after, a.dimensions());
    mean_abs_diff(&a, &b)
}

/// 全分辨率下，region 内的平均亮度差；区域落在画布外时返回 None
pub fn region_diff(before: &GrayImage, after: &GrayImage, region: Region) -> Option<f64> {
    let b = match_dimensions(after, before.dimensions());
    let r = region.clamp_to(before.dimensions())?;
    let mut sum = 0u64;
    for y in r.y..r.y + r.height {
        for x in r.x..r.x + r.width {
            let pa = before.get_pixel(x, y).0[0] as i16;
            let pb = b.get_pixel(x, y).0[0] as i16;
            sum += (pa - pb).unsigned_abs() as u64;
        }
    }
    Some(sum as f64 / (r.width as u64 * r.height as u64) as f64)
}

/// region 内亮度差超过 pixel_threshold 的像素百分比（0..=100）
pub fn changed_percent(
    before: &GrayImage,
    after: &GrayImage,
    region: Region,
    pixel_threshold: u8,
) -> Option<f64> {
    let b = match_dimensions(after, before.dimensions());
    let r = region.clamp_to(before.dimensions())?;
    let mut changed = 0u64;
    for y in r.y..r.y + r.height {
        for x in r.x..r.x + r.width {
            let pa = before.get_pixel(x, y).0[0] as i16;
            let pb = b.get_pixel(x, y).0[0] as i16;
            if (pa - pb).unsigned_abs() > pixel_threshold as u16 {
                changed += 1;
            }
        }
    }
    Some(changed as f64 * 100.0 / (r.width as u64 * r.height as u64) as f64)
}

pub fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

#[cfg(test)]
pub(crate) mod testing {
    use std::path::{Path, PathBuf};

    use image::{GrayImage, Luma};

    /// 生成灰度 PNG，像素值由 f(x, y) 决定
    pub fn write_gray(
        dir: &Path,
        name: &str,
        size: (u32, u32),
        f: impl Fn(u32, u32) -> u8,
    ) -> PathBuf {
        let img = GrayImage::from_fn(size.0, size.1, |x, y| Luma([f(x, y)]));
        let path = dir.join(name);
        img.save(&path).unwrap();
        path
    }
}

#[cfg(test)]
mod tests {
    use super::testing::write_gray;
    use super::*;

    #[test]
    fn test_global_diff_exact_on_small_images() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_gray(dir.path(), "a.png", (10, 10), |_, _| 100);
        // 20 个像素各差 1 → 平均 0.2
        let b = write_gray(dir.path(), "b.png", (10, 10), |_, y| if y < 2 { 101 } else { 100 });
        let diff = global_diff(&load_luma(&a).unwrap(), &load_luma(&b).unwrap(), 320);
        assert!((diff - 0.2).abs() < 1e-9);
    }

    #[test]
    fn test_downsample_keeps_aspect() {
        let img = GrayImage::new(640, 320);
        assert_eq!(downsample(&img, 320).dimensions(), (320, 160));
        assert_eq!(downsample(&img, 1000).dimensions(), (640, 320));
    }

    #[test]
    fn test_region_diff_and_changed_percent() {
        let before = GrayImage::from_pixel(20, 20, image::Luma([0]));
        let after = GrayImage::from_fn(20, 20, |x, y| {
            if x < 10 && y < 10 {
                image::Luma([200])
            } else {
                image::Luma([0])
            }
        });
        let hit = Region::new(0, 0, 10, 10);
        assert_eq!(region_diff(&before, &after, hit), Some(200.0));
        assert_eq!(changed_percent(&before, &after, Region::new(0, 0, 20, 10), 25), Some(50.0));
        assert_eq!(region_diff(&before, &after, Region::new(50, 50, 5, 5)), None);
    }

    #[test]
    fn test_missing_file() {
        let err = load_luma(Path::new("/nonexistent/shot.png")).unwrap_err();
        assert!(matches!(err, VisionError::Missing(_)));
    }
}

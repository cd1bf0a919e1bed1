#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use image::{DynamicImage, Rgb, RgbImage};
use parking_lot::Mutex;
use tempfile::TempDir;
use visage_core::db::{self, store::SqliteFaceStore};
use visage_core::models::face::BoundingBox;
use visage_core::pipeline::events::FaceEvent;
use visage_core::pipeline::face::{Detection, FaceAnalyzer};
use visage_core::utils::config::Config;
use visage_core::utils::logging;

pub const RED: Rgb<u8> = Rgb([230, 20, 20]);
pub const GREEN: Rgb<u8> = Rgb([20, 230, 20]);
pub const BLUE: Rgb<u8> = Rgb([20, 20, 230]);
const BACKGROUND: Rgb<u8> = Rgb([245, 245, 245]);

/// Create a temporary pooled store for testing
pub fn setup_store() -> (TempDir, Arc<SqliteFaceStore>) {
    logging::init();
    let tmp = TempDir::new().unwrap();
    let db_dir = tmp.path().join("db");
    std::fs::create_dir_all(&db_dir).unwrap();
    let pool = db::create_pool(db_dir.join("visage.db"), 4).unwrap();
    (tmp, Arc::new(SqliteFaceStore::new(pool)))
}

/// Config rooted in `data` with no pauses and no parallel noise
pub fn test_config(data: &Path) -> Config {
    logging::init();
    Config {
        data: data.to_path_buf(),
        thumb_threads: 2,
        face_thumb_size: 48,
        scan_throttle_ms: 0,
        ..Config::default()
    }
}

/// Write a PNG with solid coloured squares on a light background. Each square
/// is one "face" for `ColorAnalyzer`.
pub fn write_photo(path: &Path, width: u32, height: u32, faces: &[((u32, u32, u32, u32), Rgb<u8>)]) -> PathBuf {
    let mut img = RgbImage::from_pixel(width, height, BACKGROUND);
    for &((x, y, w, h), colour) in faces {
        for py in y..(y + h).min(height) {
            for px in x..(x + w).min(width) {
                img.put_pixel(px, py, colour);
            }
        }
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    img.save_with_format(path, image::ImageFormat::Png).unwrap();
    path.to_path_buf()
}

/// Write a file that no decoder accepts
pub fn write_garbage(path: &Path) -> PathBuf {
    std::fs::write(path, b"this is not a photo").unwrap();
    path.to_path_buf()
}

fn dominant(p: &Rgb<u8>) -> Option<usize> {
    (0..3).find(|&c| p[c] > 180 && (0..3).filter(|&o| o != c).all(|o| p[o] < 90))
}

/// Deterministic analyzer for tests. Every saturated red, green or blue
/// region is one face; the embedding is the mean colour of the box scaled to
/// 0..1, so faces of one colour sit together and different colours are about
/// 1.3 apart.
#[derive(Default)]
pub struct ColorAnalyzer {
    pub not_ready: bool,
    /// Detection errors out when a green face is present.
    pub fail_on_green: bool,
    pub seen_sizes: Mutex<Vec<(u32, u32)>>,
}

impl ColorAnalyzer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FaceAnalyzer for ColorAnalyzer {
    fn is_ready(&self) -> bool {
        !self.not_ready
    }

    fn detect(&self, image: &DynamicImage) -> anyhow::Result<Vec<Detection>> {
        let rgb = image.to_rgb8();
        self.seen_sizes.lock().push(rgb.dimensions());

        let mut extents: [Option<(u32, u32, u32, u32)>; 3] = [None; 3];
        for (x, y, p) in rgb.enumerate_pixels() {
            if let Some(c) = dominant(p) {
                let e = extents[c].get_or_insert((x, y, x, y));
                e.0 = e.0.min(x);
                e.1 = e.1.min(y);
                e.2 = e.2.max(x);
                e.3 = e.3.max(y);
            }
        }
        if self.fail_on_green && extents[1].is_some() {
            anyhow::bail!("detector crashed");
        }
        Ok(extents
            .iter()
            .flatten()
            .map(|&(x1, y1, x2, y2)| Detection {
                bbox: BoundingBox::new(x1 as f32, y1 as f32, (x2 + 1) as f32, (y2 + 1) as f32),
                confidence: 0.9,
            })
            .collect())
    }

    fn embed(&self, image: &DynamicImage, bbox: &BoundingBox) -> anyhow::Result<Vec<f32>> {
        let (x, y, w, h) = bbox
            .crop_rect(image.width(), image.height(), 0.0)
            .context("box outside image")?;
        let crop = image.crop_imm(x, y, w, h).to_rgb8();
        let n = (crop.width() * crop.height()) as f32;
        let mut sum = [0f32; 3];
        for p in crop.pixels() {
            for c in 0..3 {
                sum[c] += p[c] as f32;
            }
        }
        Ok(sum.iter().map(|s| s / n / 255.0).collect())
    }
}

/// Drain everything currently buffered on a subscription
pub fn drain(rx: &mut tokio::sync::broadcast::Receiver<FaceEvent>) -> Vec<FaceEvent> {
    let mut out = Vec::new();
    while let Ok(ev) = rx.try_recv() {
        out.push(ev);
    }
    out
}

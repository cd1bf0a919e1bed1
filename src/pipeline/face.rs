use anyhow::Result;
use image::DynamicImage;
use serde::{Deserialize, Serialize};

use crate::models::face::BoundingBox;

#[cfg(feature = "facial-recognition")]
use anyhow::Context;
#[cfg(feature = "facial-recognition")]
use ort::session::Session;
#[cfg(feature = "facial-recognition")]
use ort::value::Value;
#[cfg(feature = "facial-recognition")]
use parking_lot::Mutex;
#[cfg(feature = "facial-recognition")]
use std::path::PathBuf;
#[cfg(feature = "facial-recognition")]
use tracing::{debug, info, warn};

pub const SCRFD_MODEL_FILE: &str = "scrfd_500m_bnkps.onnx";
pub const ARCFACE_MODEL_FILE: &str = "w600k_r50.onnx";

const SCRFD_INPUT: u32 = 640;
const ARCFACE_INPUT: u32 = 112;
const SCRFD_STRIDES: [u32; 3] = [8, 16, 32];
const MIN_FACE_PX: f32 = 8.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub confidence: f32,
}

/// Detector + embedder pair used by the scanner. Boxes are in the pixel space
/// of the image passed to `detect`.
pub trait FaceAnalyzer: Send + Sync {
    /// False while models are missing. A scan pass never starts in that state.
    fn is_ready(&self) -> bool;
    fn detect(&self, image: &DynamicImage) -> Result<Vec<Detection>>;
    fn embed(&self, image: &DynamicImage, bbox: &BoundingBox) -> Result<Vec<f32>>;
}

#[derive(Debug, Clone, Copy)]
pub struct DetectorSettings {
    pub confidence_threshold: f32,
    pub nms_iou_threshold: f32,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self { confidence_threshold: 0.5, nms_iou_threshold: 0.4 }
    }
}

/// Greedy non-maximum suppression, highest confidence first.
pub fn nms(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    detections.sort_by(|a, b| b.confidence.partial_cmp(&a.confidence).unwrap_or(std::cmp::Ordering::Equal));
    let mut keep: Vec<Detection> = Vec::with_capacity(detections.len());
    for candidate in detections {
        if keep.iter().all(|k| k.bbox.iou(&candidate.bbox) <= iou_threshold) {
            keep.push(candidate);
        }
    }
    keep
}

/// Tight crop of a detection, clipped to the image.
pub fn crop_face(image: &DynamicImage, bbox: &BoundingBox) -> Option<DynamicImage> {
    let (x, y, w, h) = bbox.crop_rect(image.width(), image.height(), 0.0)?;
    Some(image.crop_imm(x, y, w, h))
}

pub fn l2_normalize(v: &mut [f32]) -> f32 {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
    norm
}

/// Decodes one SCRFD stride. `scores` holds one value per anchor and `boxes`
/// four distances (left, top, right, bottom) per anchor, in stride units.
/// Anchors are laid out row-major over a `input/stride` square grid with
/// `scores.len() / cells` anchors per cell. `scale` is the letterbox factor
/// applied to the source image; results are in source pixels.
pub fn decode_stride(
    scores: &[f32],
    boxes: &[f32],
    stride: u32,
    scale: f32,
    source_size: (u32, u32),
    confidence_threshold: f32,
) -> Vec<Detection> {
    let side = (SCRFD_INPUT / stride) as usize;
    let cells = side * side;
    if cells == 0 || scores.is_empty() || scores.len() % cells != 0 || boxes.len() < scores.len() * 4 {
        return Vec::new();
    }
    let anchors = scores.len() / cells;
    let stride = stride as f32;
    let (img_w, img_h) = (source_size.0 as f32, source_size.1 as f32);

    let mut out = Vec::new();
    for (idx, &conf) in scores.iter().enumerate() {
        if conf < confidence_threshold {
            continue;
        }
        let cell = idx / anchors;
        let cx = (cell % side) as f32 * stride;
        let cy = (cell / side) as f32 * stride;
        let d = &boxes[idx * 4..idx * 4 + 4];
        let bbox = BoundingBox::new(
            ((cx - d[0] * stride) / scale).clamp(0.0, img_w),
            ((cy - d[1] * stride) / scale).clamp(0.0, img_h),
            ((cx + d[2] * stride) / scale).clamp(0.0, img_w),
            ((cy + d[3] * stride) / scale).clamp(0.0, img_h),
        );
        if bbox.width() < MIN_FACE_PX || bbox.height() < MIN_FACE_PX {
            continue;
        }
        out.push(Detection { bbox, confidence: conf });
    }
    out
}

/// Stand-in when the crate is built without ONNX support. Never ready, so
/// face passes refuse to start.
#[cfg(not(feature = "facial-recognition"))]
pub struct DisabledAnalyzer;

#[cfg(not(feature = "facial-recognition"))]
impl FaceAnalyzer for DisabledAnalyzer {
    fn is_ready(&self) -> bool {
        false
    }

    fn detect(&self, _image: &DynamicImage) -> Result<Vec<Detection>> {
        anyhow::bail!("built without facial-recognition support")
    }

    fn embed(&self, _image: &DynamicImage, _bbox: &BoundingBox) -> Result<Vec<f32>> {
        anyhow::bail!("built without facial-recognition support")
    }
}

/// SCRFD detector and ArcFace embedder backed by ONNX Runtime. Models are
/// read from `models_dir`; nothing is downloaded.
#[cfg(feature = "facial-recognition")]
pub struct FaceProcessor {
    pub models_dir: PathBuf,
    settings: DetectorSettings,
    scrfd_session: Option<Mutex<Session>>,
    arcface_session: Option<Mutex<Session>>,
}

#[cfg(feature = "facial-recognition")]
impl FaceProcessor {
    pub fn new(models_dir: PathBuf, settings: DetectorSettings) -> Self {
        Self { models_dir, settings, scrfd_session: None, arcface_session: None }
    }

    pub fn load_models(&mut self) -> Result<()> {
        let scrfd_path = self.models_dir.join(SCRFD_MODEL_FILE);
        let arcface_path = self.models_dir.join(ARCFACE_MODEL_FILE);

        if !scrfd_path.exists() || !arcface_path.exists() {
            anyhow::bail!(
                "Face models missing; expected SCRFD at {:?} and ArcFace at {:?}",
                scrfd_path, arcface_path
            );
        }

        let scrfd = Session::builder()?
            .commit_from_file(&scrfd_path)
            .context("Failed to create SCRFD session")?;
        let arc = Session::builder()?
            .commit_from_file(&arcface_path)
            .context("Failed to create ArcFace session")?;

        self.scrfd_session = Some(Mutex::new(scrfd));
        self.arcface_session = Some(Mutex::new(arc));
        info!("Face models loaded: SCRFD={:?} ArcFace={:?}", scrfd_path, arcface_path);
        Ok(())
    }

    /// Letterboxes into the 640x640 detector input, BGR planes normalised to
    /// roughly [-1, 1]. Returns the tensor and the resize factor.
    fn preprocess_scrfd(&self, image: &DynamicImage) -> (Vec<f32>, f32) {
        let (ow, oh) = (image.width() as f32, image.height() as f32);
        let scale = SCRFD_INPUT as f32 / ow.max(oh);
        let nw = ((ow * scale) as u32).max(1);
        let nh = ((oh * scale) as u32).max(1);
        let resized = image.resize_exact(nw, nh, image::imageops::FilterType::Triangle);
        let mut padded = DynamicImage::new_rgb8(SCRFD_INPUT, SCRFD_INPUT);
        image::imageops::overlay(&mut padded, &resized, 0, 0);
        let rgb = padded.to_rgb8();

        let plane = (SCRFD_INPUT * SCRFD_INPUT) as usize;
        let mut data = vec![0f32; 3 * plane];
        for (i, p) in rgb.pixels().enumerate() {
            data[i] = (p[2] as f32 - 127.5) / 128.0;
            data[plane + i] = (p[1] as f32 - 127.5) / 128.0;
            data[2 * plane + i] = (p[0] as f32 - 127.5) / 128.0;
        }
        (data, scale)
    }

    fn preprocess_arcface(&self, face_crop: &DynamicImage) -> Vec<f32> {
        let resized = face_crop.resize_exact(ARCFACE_INPUT, ARCFACE_INPUT, image::imageops::FilterType::Triangle);
        let rgb = resized.to_rgb8();
        let plane = (ARCFACE_INPUT * ARCFACE_INPUT) as usize;
        let mut data = vec![0f32; 3 * plane];
        for (i, p) in rgb.pixels().enumerate() {
            for c in 0..3 {
                data[c * plane + i] = (p[c] as f32 - 127.5) / 128.0;
            }
        }
        data
    }
}

#[cfg(feature = "facial-recognition")]
impl FaceAnalyzer for FaceProcessor {
    fn is_ready(&self) -> bool {
        self.scrfd_session.is_some() && self.arcface_session.is_some()
    }

    fn detect(&self, image: &DynamicImage) -> Result<Vec<Detection>> {
        let mut session = self
            .scrfd_session
            .as_ref()
            .context("Detection model not loaded")?
            .lock();
        let (data, scale) = self.preprocess_scrfd(image);
        let shape = [1i64, 3, SCRFD_INPUT as i64, SCRFD_INPUT as i64];

        let input_name = session.inputs[0].name.clone();
        let input = Value::from_array((shape.to_vec(), data))
            .context("Failed to create SCRFD input tensor")?;
        let outputs = session
            .run(ort::inputs![input_name => input])
            .context("SCRFD inference failed")?;

        let mut raw = Vec::new();
        for stride in SCRFD_STRIDES {
            let (Some(sv), Some(bv)) = (
                outputs.get(&format!("score_{}", stride)),
                outputs.get(&format!("bbox_{}", stride)),
            ) else {
                warn!("SCRFD model has no outputs for stride {}", stride);
                continue;
            };
            let (_, scores) = sv.try_extract_tensor::<f32>().context("Bad SCRFD score tensor")?;
            let (_, boxes) = bv.try_extract_tensor::<f32>().context("Bad SCRFD bbox tensor")?;
            raw.extend(decode_stride(
                scores,
                boxes,
                stride,
                scale,
                (image.width(), image.height()),
                self.settings.confidence_threshold,
            ));
        }

        let kept = nms(raw, self.settings.nms_iou_threshold);
        debug!("SCRFD kept {} faces after NMS", kept.len());
        Ok(kept)
    }

    fn embed(&self, image: &DynamicImage, bbox: &BoundingBox) -> Result<Vec<f32>> {
        let crop = crop_face(image, bbox).context("Bounding box lies outside the image")?;
        let mut session = self
            .arcface_session
            .as_ref()
            .context("Recognition model not loaded")?
            .lock();
        let data = self.preprocess_arcface(&crop);
        let shape = [1i64, 3, ARCFACE_INPUT as i64, ARCFACE_INPUT as i64];

        let input_name = session.inputs[0].name.clone();
        let input = Value::from_array((shape.to_vec(), data))
            .context("Failed to create ArcFace input tensor")?;
        let outputs = session
            .run(ort::inputs![input_name => input])
            .context("ArcFace inference failed")?;

        let key = outputs.keys().next().context("ArcFace produced no outputs")?.to_string();
        let value = outputs.get(&key).context("ArcFace output vanished")?;
        let (_, slice) = value.try_extract_tensor::<f32>().context("Bad ArcFace output tensor")?;
        let mut embedding = slice.to_vec();
        if l2_normalize(&mut embedding) == 0.0 {
            anyhow::bail!("ArcFace embedding has zero norm");
        }
        Ok(embedding)
    }
}

use serde::{Deserialize, Serialize};

pub type PhotoId = i64;
pub type FaceId = i64;
pub type PersonId = i64;

/// Pixel rectangle in source-image coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).max(0.0)
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    pub fn is_valid(&self) -> bool {
        [self.x1, self.y1, self.x2, self.y2].iter().all(|v| v.is_finite())
            && self.x2 > self.x1
            && self.y2 > self.y1
    }

    /// Divides each axis by its scale factor. Used to map boxes found on a
    /// downscaled working image back to the full-resolution source.
    pub fn unscale(&self, scale_x: f32, scale_y: f32) -> Self {
        Self {
            x1: self.x1 / scale_x,
            y1: self.y1 / scale_y,
            x2: self.x2 / scale_x,
            y2: self.y2 / scale_y,
        }
    }

    pub fn clamp_to(&self, width: u32, height: u32) -> Self {
        let (w, h) = (width as f32, height as f32);
        Self {
            x1: self.x1.clamp(0.0, w),
            y1: self.y1.clamp(0.0, h),
            x2: self.x2.clamp(0.0, w),
            y2: self.y2.clamp(0.0, h),
        }
    }

    /// Integer crop rectangle `(x, y, w, h)` grown by `padding` (fraction of the
    /// box size on each side) and clipped to the image. `None` when nothing of
    /// the box lies inside the image.
    pub fn crop_rect(&self, width: u32, height: u32, padding: f32) -> Option<(u32, u32, u32, u32)> {
        if !self.is_valid() {
            return None;
        }
        let clamped = self.clamp_to(width, height);
        if !clamped.is_valid() {
            return None;
        }
        let pad_x = clamped.width() * padding;
        let pad_y = clamped.height() * padding;
        let x1 = (clamped.x1 - pad_x).max(0.0) as u32;
        let y1 = (clamped.y1 - pad_y).max(0.0) as u32;
        let x2 = ((clamped.x2 + pad_x).min(width as f32) as u32).min(width);
        let y2 = ((clamped.y2 + pad_y).min(height as f32) as u32).min(height);
        if x2 <= x1 || y2 <= y1 {
            return None;
        }
        Some((x1, y1, x2 - x1, y2 - y1))
    }

    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let x1 = self.x1.max(other.x1);
        let y1 = self.y1.max(other.y1);
        let x2 = self.x2.min(other.x2);
        let y2 = self.y2.min(other.y2);
        if x2 <= x1 || y2 <= y1 {
            return 0.0;
        }
        let intersection = (x2 - x1) * (y2 - y1);
        let union = self.area() + other.area() - intersection;
        if union <= 0.0 {
            return 0.0;
        }
        intersection / union
    }
}

/// Identity state of a face. A deleted face cannot carry a person.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum FaceState {
    Active { person_id: Option<PersonId> },
    Deleted,
}

impl FaceState {
    pub fn from_columns(person_id: Option<PersonId>, is_deleted: bool) -> Self {
        if is_deleted {
            FaceState::Deleted
        } else {
            FaceState::Active { person_id }
        }
    }

    pub fn person_id(&self) -> Option<PersonId> {
        match self {
            FaceState::Active { person_id } => *person_id,
            FaceState::Deleted => None,
        }
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, FaceState::Active { person_id: None })
    }

    pub fn is_deleted(&self) -> bool {
        matches!(self, FaceState::Deleted)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Face {
    pub id: FaceId,
    pub photo_id: PhotoId,
    pub photo_path: String,
    pub embedding: Vec<f32>,
    pub bbox: BoundingBox,
    pub confidence: f32,
    pub state: FaceState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Photo {
    pub id: PhotoId,
    pub filepath: String,
    pub scanned_for_faces: bool,
    pub is_hidden: bool,
}

/// A photo still waiting for face detection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingPhoto {
    pub id: PhotoId,
    pub filepath: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Person {
    pub id: PersonId,
    pub name: String,
    pub face_count: i64,
}

/// Operator's answer when confirming a face or group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersonChoice {
    Existing(PersonId),
    New(String),
}

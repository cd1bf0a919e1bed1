use std::path::PathBuf;

use thiserror::Error;

use crate::models::face::{FaceId, PersonId};

pub type Result<T> = std::result::Result<T, FaceError>;

#[derive(Debug, Error)]
pub enum FaceError {
    #[error("failed to decode image {path:?}: {reason}")]
    Decode { path: PathBuf, reason: String },

    #[error("invalid bounding box for face {0}")]
    InvalidBoundingBox(FaceId),

    #[error("face {0} not found")]
    FaceNotFound(FaceId),

    #[error("person {0} not found")]
    PersonNotFound(PersonId),

    #[error("person name must not be empty")]
    EmptyName,

    #[error("no labeling unit is pending")]
    NothingPending,

    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error(transparent)]
    Persistence(#[from] anyhow::Error),
}

impl FaceError {
    /// Store-level failures (locked, full, pool exhausted). The scan loop
    /// counts these per photo and keeps going.
    pub fn is_persistence(&self) -> bool {
        matches!(self, FaceError::Pool(_) | FaceError::Database(_) | FaceError::Persistence(_))
    }
}

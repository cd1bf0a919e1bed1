pub mod decode;
pub mod events;
pub mod face;
pub mod thumb;
pub mod scanner;
pub mod cluster;
pub mod labeling;
pub mod scheduler;

use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug, Clone, Copy, Serialize)]
pub struct QueueDepths {
    pub thumb: usize,
    pub face_scan: usize,
}

/// Live queue sizes. `thumb` counts crop jobs not yet picked up by a worker,
/// `face_scan` counts photos left in the running face pass.
#[derive(Default)]
pub struct QueueGauges {
    pub thumb: AtomicUsize,
    pub face_scan: AtomicUsize,
}

impl QueueGauges {
    pub fn depths(&self) -> QueueDepths {
        QueueDepths {
            thumb: self.thumb.load(Ordering::Relaxed),
            face_scan: self.face_scan.load(Ordering::Relaxed),
        }
    }
}

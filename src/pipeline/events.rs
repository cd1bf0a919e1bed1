use serde::Serialize;
use tokio::sync::broadcast;

use crate::models::face::{BoundingBox, FaceId};
use crate::pipeline::scheduler::PipelineKind;

/// Notifications published by the background pipelines. Within one pipeline
/// events arrive in processing order.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FaceEvent {
    FaceDiscovered { face_id: FaceId, photo_path: String, bbox: BoundingBox },
    ScanProgress { done: usize, total: usize },
    ClustersFound { groups: Vec<Vec<FaceId>> },
    FaceThumbnailReady { face_id: FaceId, png: Vec<u8> },
    FaceThumbnailFailed { face_id: FaceId },
    Status { pipeline: PipelineKind, message: String },
}

/// Broadcast fan-out. Sending never blocks and succeeds with no subscribers;
/// a subscriber that falls `capacity` events behind loses the oldest ones.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<FaceEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FaceEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: FaceEvent) {
        // Err only means nobody is listening right now.
        let _ = self.tx.send(event);
    }

    pub fn status(&self, pipeline: PipelineKind, message: impl Into<String>) {
        let message = message.into();
        tracing::info!(?pipeline, "{}", message);
        self.emit(FaceEvent::Status { pipeline, message });
    }
}

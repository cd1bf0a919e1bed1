use std::collections::VecDeque;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use crate::db::store::FaceStore;
use crate::error::{FaceError, Result};
use crate::models::face::{FaceId, PersonChoice, PersonId};
use crate::pipeline::thumb::FaceThumbnailCache;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LabelDecision {
    Confirm(PersonChoice),
    Skip,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "person_id", rename_all = "snake_case")]
pub enum UnitState {
    Pending,
    Confirmed(PersonId),
    Skipped,
    Deleted,
}

/// One face or one proposed group, labeled as a whole.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LabelUnit {
    pub face_ids: Vec<FaceId>,
    pub state: UnitState,
}

/// Thumbnail of one face of the unit under review. `png` is `None` when the
/// crop could not be produced.
#[derive(Debug, Clone)]
pub struct FaceTile {
    pub face_id: FaceId,
    pub png: Option<Vec<u8>>,
}

/// Operator-driven labeling. Batch mode walks a FIFO of units, always acting
/// on the head; single mode labels one face directly.
pub struct LabelingWorkflow {
    store: Arc<dyn FaceStore>,
    thumbs: Arc<FaceThumbnailCache>,
    queue: VecDeque<Vec<FaceId>>,
    history: Vec<LabelUnit>,
}

impl LabelingWorkflow {
    pub fn new(store: Arc<dyn FaceStore>, thumbs: Arc<FaceThumbnailCache>) -> Self {
        Self { store, thumbs, queue: VecDeque::new(), history: Vec::new() }
    }

    /// Queues `groups` in order, replacing whatever was still pending.
    /// Returns the number of queued units.
    pub fn start_batch(&mut self, groups: Vec<Vec<FaceId>>) -> usize {
        self.queue = groups.into_iter().filter(|g| !g.is_empty()).collect();
        info!("Labeling batch started with {} units", self.queue.len());
        self.queue.len()
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn current(&self) -> Option<&[FaceId]> {
        self.queue.front().map(Vec::as_slice)
    }

    pub fn current_tiles(&self) -> Vec<FaceTile> {
        let Some(unit) = self.queue.front() else {
            return Vec::new();
        };
        unit.iter()
            .map(|&face_id| FaceTile {
                face_id,
                png: self.thumbs.thumbnail_for_face(self.store.as_ref(), face_id).ok(),
            })
            .collect()
    }

    /// Applies `decision` to the head unit. On error the unit stays at the
    /// head and nothing was persisted.
    pub fn decide(&mut self, decision: LabelDecision) -> Result<UnitState> {
        let unit = self.queue.front().ok_or(FaceError::NothingPending)?;
        let state = apply(self.store.as_ref(), unit, &decision)?;
        if let Some(face_ids) = self.queue.pop_front() {
            self.history.push(LabelUnit { face_ids, state });
        }
        Ok(state)
    }

    /// Drops the rest of the batch. Units already decided keep their effect.
    pub fn cancel_batch(&mut self) -> usize {
        let dropped = self.queue.len();
        self.queue.clear();
        if dropped > 0 {
            info!("Labeling batch cancelled with {} units left", dropped);
        }
        dropped
    }

    pub fn label_single(&mut self, face_id: FaceId, decision: LabelDecision) -> Result<UnitState> {
        let unit = [face_id];
        let state = apply(self.store.as_ref(), &unit, &decision)?;
        self.history.push(LabelUnit { face_ids: unit.to_vec(), state });
        Ok(state)
    }

    pub fn history(&self) -> &[LabelUnit] {
        &self.history
    }
}

fn apply(store: &dyn FaceStore, face_ids: &[FaceId], decision: &LabelDecision) -> Result<UnitState> {
    match decision {
        LabelDecision::Confirm(choice) => {
            let person_id = store.confirm_faces(face_ids, choice)?;
            debug!("Confirmed {:?} as person {}", face_ids, person_id);
            Ok(UnitState::Confirmed(person_id))
        }
        LabelDecision::Skip => Ok(UnitState::Skipped),
        LabelDecision::Delete => {
            store.soft_delete_faces(face_ids)?;
            debug!("Moved {:?} to trash", face_ids);
            Ok(UnitState::Deleted)
        }
    }
}

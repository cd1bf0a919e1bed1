use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::pipeline::events::EventBus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineKind {
    PhotoScan,
    VideoScan,
    FaceScan,
    Clustering,
}

impl PipelineKind {
    /// Library-wide file work that face scanning should yield to.
    pub fn is_io_heavy(self) -> bool {
        matches!(self, PipelineKind::PhotoScan | PipelineKind::VideoScan)
    }
}

#[derive(Default)]
struct ThrottleState {
    manual: AtomicBool,
    io_heavy: AtomicUsize,
}

/// Raised while an I/O heavy pipeline runs or when an operator asks for it.
/// The face scanner slows down while it is raised.
#[derive(Clone, Default)]
pub struct ThrottleSignal {
    state: Arc<ThrottleState>,
}

impl ThrottleSignal {
    pub fn is_raised(&self) -> bool {
        self.state.manual.load(Ordering::Relaxed) || self.state.io_heavy.load(Ordering::Relaxed) > 0
    }

    pub fn set_manual(&self, raised: bool) {
        self.state.manual.store(raised, Ordering::Relaxed);
    }
}

struct Running {
    token: CancellationToken,
    generation: u64,
}

struct SchedulerInner {
    running: Mutex<HashMap<PipelineKind, Running>>,
    generation: AtomicU64,
    throttle: ThrottleSignal,
    events: EventBus,
}

/// Keeps at most one instance of each pipeline kind running and owns their
/// cancellation tokens.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

pub enum PipelineStart {
    Started(PipelineGuard),
    AlreadyRunning,
}

impl Scheduler {
    pub fn new(events: EventBus) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                running: Mutex::new(HashMap::new()),
                generation: AtomicU64::new(0),
                throttle: ThrottleSignal::default(),
                events,
            }),
        }
    }

    pub fn throttle(&self) -> ThrottleSignal {
        self.inner.throttle.clone()
    }

    pub fn try_start(&self, kind: PipelineKind) -> PipelineStart {
        let mut running = self.inner.running.lock();
        if running.contains_key(&kind) {
            drop(running);
            self.inner.events.status(kind, "Already running");
            return PipelineStart::AlreadyRunning;
        }
        let token = CancellationToken::new();
        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed);
        running.insert(kind, Running { token: token.clone(), generation });
        if kind.is_io_heavy() {
            self.inner.throttle.state.io_heavy.fetch_add(1, Ordering::Relaxed);
        }
        tracing::debug!(?kind, "Pipeline started");
        PipelineStart::Started(PipelineGuard { kind, token, generation, inner: self.inner.clone() })
    }

    /// Requests cancellation. The pipeline stops at its next checkpoint and
    /// releases its slot when its guard drops.
    pub fn cancel(&self, kind: PipelineKind) -> bool {
        match self.inner.running.lock().get(&kind) {
            Some(r) => {
                r.token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self, kind: PipelineKind) -> bool {
        self.inner.running.lock().contains_key(&kind)
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }
}

/// Slot of one running pipeline; dropping it frees the slot.
pub struct PipelineGuard {
    kind: PipelineKind,
    token: CancellationToken,
    generation: u64,
    inner: Arc<SchedulerInner>,
}

impl PipelineGuard {
    pub fn kind(&self) -> PipelineKind {
        self.kind
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Drop for PipelineGuard {
    fn drop(&mut self) {
        let mut running = self.inner.running.lock();
        if running.get(&self.kind).map(|r| r.generation) == Some(self.generation) {
            running.remove(&self.kind);
        }
        if self.kind.is_io_heavy() {
            self.inner.throttle.state.io_heavy.fetch_sub(1, Ordering::Relaxed);
        }
        tracing::debug!(kind = ?self.kind, "Pipeline finished");
    }
}

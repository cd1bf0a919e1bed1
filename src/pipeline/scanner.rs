use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::db::store::FaceStore;
use crate::error::Result;
use crate::models::face::{FaceId, PendingPhoto};
use crate::pipeline::decode;
use crate::pipeline::events::{EventBus, FaceEvent};
use crate::pipeline::face::FaceAnalyzer;
use crate::pipeline::scheduler::{PipelineKind, ThrottleSignal};
use crate::pipeline::thumb::FaceThumbnailCache;
use crate::pipeline::QueueGauges;
use crate::stats::Stats;

#[derive(Debug, Clone, Copy)]
pub struct ScanSettings {
    /// Wider sources are analysed on a downscaled copy.
    pub max_working_width: u32,
    pub progress_every: usize,
    pub batch_size: usize,
    /// Pause between batches while the throttle signal is raised.
    pub throttle_pause: Duration,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            max_working_width: 1600,
            progress_every: 5,
            batch_size: 10,
            throttle_pause: Duration::from_millis(250),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanReport {
    pub total: usize,
    pub scanned: usize,
    pub faces: usize,
    pub decode_failures: usize,
    pub analysis_failures: usize,
    pub persistence_failures: usize,
    pub cancelled: bool,
    /// The pass never started because the analyzer had no models.
    pub not_ready: bool,
}

/// What happened to one photo. Every outcome ends with the photo marked scanned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhotoOutcome {
    Faces(usize),
    NoFaces,
    DecodeFailed,
    AnalysisFailed,
    PersistenceFailed { saved: usize },
}

pub struct FaceScanner {
    store: Arc<dyn FaceStore>,
    analyzer: Arc<dyn FaceAnalyzer>,
    events: EventBus,
    settings: ScanSettings,
    throttle: ThrottleSignal,
    gauges: Option<Arc<QueueGauges>>,
    stats: Option<Arc<Stats>>,
    thumbs: Option<Arc<FaceThumbnailCache>>,
}

impl FaceScanner {
    pub fn new(
        store: Arc<dyn FaceStore>,
        analyzer: Arc<dyn FaceAnalyzer>,
        events: EventBus,
        settings: ScanSettings,
    ) -> Self {
        Self {
            store,
            analyzer,
            events,
            settings,
            throttle: ThrottleSignal::default(),
            gauges: None,
            stats: None,
            thumbs: None,
        }
    }

    pub fn with_throttle(mut self, throttle: ThrottleSignal) -> Self {
        self.throttle = throttle;
        self
    }

    pub fn with_gauges(mut self, gauges: Arc<QueueGauges>) -> Self {
        self.gauges = Some(gauges);
        self
    }

    pub fn with_stats(mut self, stats: Arc<Stats>) -> Self {
        self.stats = Some(stats);
        self
    }

    /// Crops of faces discarded from an interrupted pass are removed from this cache.
    pub fn with_thumbnails(mut self, thumbs: Arc<FaceThumbnailCache>) -> Self {
        self.thumbs = Some(thumbs);
        self
    }

    /// One pass over every unscanned, visible photo. Blocking; run it on a
    /// blocking thread. Cancellation is honoured between photos.
    pub fn run(&self, cancel: &CancellationToken) -> Result<ScanReport> {
        if !self.analyzer.is_ready() {
            self.events.status(PipelineKind::FaceScan, "Face models are not loaded; scan skipped");
            return Ok(ScanReport { not_ready: true, ..Default::default() });
        }

        let photos = self.store.unscanned_photos()?;
        let total = photos.len();
        let mut report = ScanReport { total, ..Default::default() };
        if total == 0 {
            self.events.status(PipelineKind::FaceScan, "No photos waiting for face detection");
            return Ok(report);
        }

        let started = Instant::now();
        if let Some(stats) = &self.stats {
            stats.start_face_pass();
        }
        self.set_remaining(total);
        self.events.status(PipelineKind::FaceScan, format!("Scanning {} photos for faces", total));

        for (idx, photo) in photos.iter().enumerate() {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            if idx > 0 && idx % self.settings.batch_size.max(1) == 0 && self.throttle.is_raised() {
                self.pause(cancel);
                if cancel.is_cancelled() {
                    report.cancelled = true;
                    break;
                }
            }

            let outcome = self.scan_photo(photo);
            let mut persistence_failed = false;
            match outcome {
                PhotoOutcome::Faces(n) => report.faces += n,
                PhotoOutcome::NoFaces => {}
                PhotoOutcome::DecodeFailed => {
                    report.decode_failures += 1;
                    self.bump(Stats::inc_decode_failures);
                }
                PhotoOutcome::AnalysisFailed => {
                    report.analysis_failures += 1;
                    self.bump(Stats::inc_analysis_failures);
                }
                PhotoOutcome::PersistenceFailed { saved } => {
                    report.faces += saved;
                    persistence_failed = true;
                }
            }

            match self.store.mark_scanned(photo.id) {
                Ok(()) => {
                    report.scanned += 1;
                    self.bump(Stats::inc_photos_scanned);
                }
                Err(e) => {
                    error!("Failed to mark photo {} as scanned: {}", photo.id, e);
                    persistence_failed = true;
                }
            }
            if persistence_failed {
                report.persistence_failures += 1;
                self.bump(Stats::inc_persistence_failures);
            }

            let done = idx + 1;
            self.set_remaining(total - done);
            if done % self.settings.progress_every.max(1) == 0 || done == total {
                self.events.emit(FaceEvent::ScanProgress { done, total });
            }
        }

        self.set_remaining(0);
        if let Some(stats) = &self.stats {
            stats.finish_face_pass();
        }
        info!(
            "Face scan {}: {}/{} photos, {} faces, {} decode / {} analysis / {} persistence failures in {:?}",
            if report.cancelled { "cancelled" } else { "finished" },
            report.scanned,
            report.total,
            report.faces,
            report.decode_failures,
            report.analysis_failures,
            report.persistence_failures,
            started.elapsed()
        );
        let message = if report.cancelled {
            format!("Face scan cancelled after {} of {} photos", report.scanned, total)
        } else {
            format!("Face scan finished: {} faces in {} photos", report.faces, report.scanned)
        };
        self.events.status(PipelineKind::FaceScan, message);
        Ok(report)
    }

    /// Detects, embeds and stores the faces of one photo. Does not mark the
    /// photo scanned.
    pub fn scan_photo(&self, photo: &PendingPhoto) -> PhotoOutcome {
        match self.store.discard_partial_faces(photo.id) {
            Ok(stale) if stale.is_empty() => {}
            Ok(stale) => {
                debug!("Dropped {} faces left by an interrupted pass for photo {}", stale.len(), photo.id);
                self.remove_crops(&stale);
            }
            Err(e) => {
                error!("Failed to clear partial faces for photo {}: {}", photo.id, e);
                return PhotoOutcome::PersistenceFailed { saved: 0 };
            }
        }

        let source = match decode::decode_image(Path::new(&photo.filepath)) {
            Ok(img) => img,
            Err(e) => {
                warn!("Skipping {}: {}", photo.filepath, e);
                return PhotoOutcome::DecodeFailed;
            }
        };
        let (src_w, src_h) = (source.width(), source.height());
        let working = decode::working_copy(&source, self.settings.max_working_width);
        if working.is_downscaled() {
            debug!(
                "Analysing {} at {}x{} (source {}x{})",
                photo.filepath,
                working.image.width(),
                working.image.height(),
                src_w,
                src_h
            );
        }

        let detections = match self.analyzer.detect(&working.image) {
            Ok(d) => d,
            Err(e) => {
                warn!("Face detection failed for {}: {:#}", photo.filepath, e);
                return PhotoOutcome::AnalysisFailed;
            }
        };
        if detections.is_empty() {
            return PhotoOutcome::NoFaces;
        }

        let mut saved = 0usize;
        for detection in &detections {
            let embedding = match self.analyzer.embed(&working.image, &detection.bbox) {
                Ok(e) => e,
                Err(e) => {
                    warn!("Skipping a face in {}: embedding failed: {:#}", photo.filepath, e);
                    continue;
                }
            };
            let bbox = working.to_source(&detection.bbox).clamp_to(src_w, src_h);
            match self.store.add_face(photo.id, &embedding, &bbox, detection.confidence) {
                Ok(face_id) => {
                    saved += 1;
                    self.bump(|s| s.inc_faces(1));
                    self.events.emit(FaceEvent::FaceDiscovered {
                        face_id,
                        photo_path: photo.filepath.clone(),
                        bbox,
                    });
                }
                Err(e) => {
                    error!("Failed to store a face of {}: {}", photo.filepath, e);
                    return PhotoOutcome::PersistenceFailed { saved };
                }
            }
        }

        if saved == 0 {
            PhotoOutcome::AnalysisFailed
        } else {
            PhotoOutcome::Faces(saved)
        }
    }

    fn pause(&self, cancel: &CancellationToken) {
        let step = Duration::from_millis(50);
        let mut remaining = self.settings.throttle_pause;
        debug!("Throttled; pausing face scan for {:?}", remaining);
        while !remaining.is_zero() && !cancel.is_cancelled() {
            let nap = remaining.min(step);
            std::thread::sleep(nap);
            remaining -= nap;
        }
    }

    fn remove_crops(&self, face_ids: &[FaceId]) {
        let Some(thumbs) = &self.thumbs else {
            return;
        };
        for &face_id in face_ids {
            if let Err(e) = thumbs.remove(face_id) {
                warn!("Failed to remove face thumbnail {}: {}", face_id, e);
            }
        }
    }

    fn set_remaining(&self, n: usize) {
        if let Some(gauges) = &self.gauges {
            gauges.face_scan.store(n, Ordering::Relaxed);
        }
    }

    fn bump(&self, f: impl FnOnce(&Stats)) {
        if let Some(stats) = &self.stats {
            f(stats);
        }
    }
}

pub mod utils;
pub mod stats;
pub mod error;
pub mod models;
pub mod db;
pub mod pipeline;

pub use error::{FaceError, Result};

use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::mpsc::{self, Sender};
use tokio::task::JoinHandle;

use db::store::{FaceStore, SqliteFaceStore};
use models::face::{FaceId, PhotoId};
use pipeline::cluster::{ClusterOutcome, IdentityClusterer};
use pipeline::events::EventBus;
use pipeline::face::FaceAnalyzer;
use pipeline::labeling::LabelingWorkflow;
use pipeline::scanner::{FaceScanner, ScanReport};
use pipeline::scheduler::{PipelineKind, PipelineStart, Scheduler};
use pipeline::thumb::{FaceThumbJob, FaceThumbnailCache};
use pipeline::QueueGauges;
use utils::config::Config;

const THUMB_QUEUE_CAPACITY: usize = 1024;

#[derive(Clone, Debug)]
pub struct AppPaths {
    pub data: PathBuf,
    pub db_path: PathBuf,
    pub face_cache: PathBuf,
    pub models: PathBuf,
}

impl AppPaths {
    pub fn new(data: PathBuf) -> Self {
        Self {
            db_path: data.join("db").join("visage.db"),
            face_cache: data.join("face-cache"),
            models: data.join("models"),
            data,
        }
    }

    pub fn ensure(&self) -> std::io::Result<()> {
        if let Some(db_dir) = self.db_path.parent() {
            std::fs::create_dir_all(db_dir)?;
        }
        std::fs::create_dir_all(&self.face_cache)?;
        std::fs::create_dir_all(&self.models)?;
        Ok(())
    }
}

/// Everything the background pipelines share. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub started_at: std::time::Instant,
    pub config: Config,
    pub paths: AppPaths,
    pub store: Arc<SqliteFaceStore>,
    pub events: EventBus,
    pub scheduler: Scheduler,
    pub stats: Arc<stats::Stats>,
    pub gauges: Arc<QueueGauges>,
    pub thumbs: Arc<FaceThumbnailCache>,
    pub analyzer: Arc<dyn FaceAnalyzer>,
    thumb_tx: Sender<FaceThumbJob>,
}

impl AppState {
    /// Opens the library with the ONNX analyzer from `<data>/models`. Missing
    /// models are logged and leave face scanning disabled.
    #[cfg(feature = "facial-recognition")]
    pub fn open(config: Config) -> anyhow::Result<Self> {
        let paths = AppPaths::new(config.data.clone());
        let mut processor = pipeline::face::FaceProcessor::new(paths.models.clone(), config.detector_settings());
        if let Err(e) = processor.load_models() {
            tracing::warn!("Face models not loaded: {:#}", e);
        }
        Self::with_analyzer(config, Arc::new(processor))
    }

    #[cfg(not(feature = "facial-recognition"))]
    pub fn open(config: Config) -> anyhow::Result<Self> {
        Self::with_analyzer(config, Arc::new(pipeline::face::DisabledAnalyzer))
    }

    /// Must be called inside a tokio runtime; the thumbnail workers start here.
    pub fn with_analyzer(config: Config, analyzer: Arc<dyn FaceAnalyzer>) -> anyhow::Result<Self> {
        let paths = AppPaths::new(config.data.clone());
        paths.ensure().with_context(|| format!("Failed to create data directories under {:?}", paths.data))?;

        let pool = db::create_pool(&paths.db_path, config.db_pool_size)?;
        let store = Arc::new(SqliteFaceStore::new(pool));
        let events = EventBus::new(config.event_capacity);
        let stats = Arc::new(stats::Stats::new());
        let gauges = Arc::new(QueueGauges::default());
        let thumbs = Arc::new(
            FaceThumbnailCache::new(paths.face_cache.clone(), config.face_thumb_size, events.clone())
                .with_stats(stats.clone()),
        );

        let (thumb_tx, thumb_rx) = mpsc::channel(THUMB_QUEUE_CAPACITY);
        pipeline::thumb::start_workers(config.thumb_threads, thumb_rx, thumbs.clone(), gauges.clone());

        tracing::info!("Library opened at {:?} (analyzer ready: {})", paths.data, analyzer.is_ready());
        Ok(Self {
            started_at: std::time::Instant::now(),
            scheduler: Scheduler::new(events.clone()),
            config,
            paths,
            store,
            events,
            stats,
            gauges,
            thumbs,
            analyzer,
            thumb_tx,
        })
    }

    /// Starts a face pass on a blocking thread. `None` when one is already running.
    pub fn start_face_scan(&self) -> Option<JoinHandle<Result<ScanReport>>> {
        let PipelineStart::Started(guard) = self.scheduler.try_start(PipelineKind::FaceScan) else {
            return None;
        };
        let scanner = FaceScanner::new(
            self.store.clone(),
            self.analyzer.clone(),
            self.events.clone(),
            self.config.scan_settings(),
        )
        .with_throttle(self.scheduler.throttle())
        .with_gauges(self.gauges.clone())
        .with_stats(self.stats.clone())
        .with_thumbnails(self.thumbs.clone());
        Some(tokio::task::spawn_blocking(move || {
            let token = guard.token();
            let report = scanner.run(&token);
            drop(guard);
            report
        }))
    }

    /// Starts a clustering pass on a blocking thread. `None` when one is already running.
    pub fn start_clustering(&self) -> Option<JoinHandle<Result<ClusterOutcome>>> {
        let PipelineStart::Started(guard) = self.scheduler.try_start(PipelineKind::Clustering) else {
            return None;
        };
        let clusterer = IdentityClusterer::new(self.store.clone(), self.events.clone(), self.config.cluster_settings())
            .with_stats(self.stats.clone());
        Some(tokio::task::spawn_blocking(move || {
            let outcome = clusterer.run();
            drop(guard);
            outcome
        }))
    }

    pub fn cancel(&self, kind: PipelineKind) -> bool {
        self.scheduler.cancel(kind)
    }

    pub fn labeling_workflow(&self) -> LabelingWorkflow {
        LabelingWorkflow::new(self.store.clone(), self.thumbs.clone())
    }

    /// Queues a crop for the worker pool. The result arrives as a
    /// `FaceThumbnailReady` or `FaceThumbnailFailed` event. Returns false when
    /// the queue is full.
    pub fn request_face_thumbnail(&self, face_id: FaceId) -> Result<bool> {
        let face = self.store.face(face_id)?.ok_or(FaceError::FaceNotFound(face_id))?;
        let job = FaceThumbJob { face_id, source: PathBuf::from(face.photo_path), bbox: face.bbox };
        self.gauges.thumb.fetch_add(1, Ordering::Relaxed);
        if self.thumb_tx.try_send(job).is_err() {
            self.gauges.thumb.fetch_sub(1, Ordering::Relaxed);
            return Ok(false);
        }
        Ok(true)
    }

    /// Removes the photo, its faces and their cached crops.
    pub fn delete_photo_permanently(&self, photo_id: PhotoId) -> Result<Vec<FaceId>> {
        let removed = self.store.delete_photo_permanently(photo_id)?;
        for &face_id in &removed {
            if let Err(e) = self.thumbs.remove(face_id) {
                tracing::warn!("Failed to remove face thumbnail {}: {}", face_id, e);
            }
        }
        Ok(removed)
    }

    pub fn reclaim_orphan_thumbnails(&self) -> Result<usize> {
        let live = self.store.live_face_ids()?;
        self.thumbs.reclaim_orphans(&live)
    }
}

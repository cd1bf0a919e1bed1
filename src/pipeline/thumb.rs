use std::collections::HashSet;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use image::ImageOutputFormat;
use tempfile::NamedTempFile;
use tokio::sync::mpsc::Receiver;
use tracing::{debug, warn};

use crate::db::store::FaceStore;
use crate::error::{FaceError, Result};
use crate::models::face::{BoundingBox, FaceId};
use crate::pipeline::decode;
use crate::pipeline::events::{EventBus, FaceEvent};
use crate::pipeline::QueueGauges;
use crate::stats::Stats;

/// Extra context around the detected box, as a fraction of its size per side.
pub const FACE_PADDING: f32 = 0.2;

#[derive(Clone, Debug)]
pub struct FaceThumbJob {
    pub face_id: FaceId,
    pub source: PathBuf,
    pub bbox: BoundingBox,
}

fn ensure_dir(p: &Path) -> std::io::Result<()> { std::fs::create_dir_all(p) }

fn thumb_path(cache_dir: &Path, face_id: FaceId) -> PathBuf {
    let sub = format!("{:02x}", face_id & 0xff);
    cache_dir.join(sub).join(format!("face_{}.png", face_id))
}

fn parse_thumb_name(name: &str) -> Option<FaceId> {
    name.strip_prefix("face_")?.strip_suffix(".png")?.parse().ok()
}

fn render_face_thumb(face_id: FaceId, source: &Path, bbox: &BoundingBox, size: u32) -> Result<Vec<u8>> {
    let img = decode::decode_image(source)?;
    let (x, y, w, h) = bbox
        .crop_rect(img.width(), img.height(), FACE_PADDING)
        .ok_or(FaceError::InvalidBoundingBox(face_id))?;
    let face = img.crop_imm(x, y, w, h).resize_exact(size, size, image::imageops::FilterType::Triangle);
    let mut png = Vec::new();
    face.write_to(&mut Cursor::new(&mut png), ImageOutputFormat::Png)?;
    Ok(png)
}

/// Square PNG crops of faces, stored on disk and keyed by face id. A cached
/// crop is served without decoding the source photo again.
pub struct FaceThumbnailCache {
    dir: PathBuf,
    size: u32,
    events: EventBus,
    stats: Option<Arc<Stats>>,
}

impl FaceThumbnailCache {
    pub fn new(dir: PathBuf, size: u32, events: EventBus) -> Self {
        Self { dir, size: size.max(1), events, stats: None }
    }

    pub fn with_stats(mut self, stats: Arc<Stats>) -> Self {
        self.stats = Some(stats);
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, face_id: FaceId) -> PathBuf {
        thumb_path(&self.dir, face_id)
    }

    pub fn get_or_create(&self, face_id: FaceId, source: &Path, bbox: &BoundingBox) -> Result<Vec<u8>> {
        let path = self.path_for(face_id);
        if let Ok(bytes) = std::fs::read(&path) {
            self.events.emit(FaceEvent::FaceThumbnailReady { face_id, png: bytes.clone() });
            return Ok(bytes);
        }

        match self.render_and_store(face_id, source, bbox, &path) {
            Ok(bytes) => {
                debug!("Rendered face thumbnail {:?}", path);
                if let Some(stats) = &self.stats {
                    stats.inc_thumbs_rendered();
                }
                self.events.emit(FaceEvent::FaceThumbnailReady { face_id, png: bytes.clone() });
                Ok(bytes)
            }
            Err(e) => {
                warn!("Failed to create face thumbnail {} from {:?}: {}", face_id, source, e);
                if let Some(stats) = &self.stats {
                    stats.inc_thumbs_failed();
                }
                self.events.emit(FaceEvent::FaceThumbnailFailed { face_id });
                Err(e)
            }
        }
    }

    fn render_and_store(&self, face_id: FaceId, source: &Path, bbox: &BoundingBox, path: &Path) -> Result<Vec<u8>> {
        let png = render_face_thumb(face_id, source, bbox, self.size)?;
        let parent = path.parent().unwrap_or(&self.dir);
        ensure_dir(parent)?;
        // Concurrent renders of the same face each write their own temp file;
        // the last rename wins and readers never see a partial file.
        let mut tmp = NamedTempFile::new_in(parent)?;
        tmp.write_all(&png)?;
        tmp.persist(path).map_err(|e| e.error)?;
        Ok(png)
    }

    /// Looks the face up in the store and serves its crop.
    pub fn thumbnail_for_face(&self, store: &dyn FaceStore, face_id: FaceId) -> Result<Vec<u8>> {
        let face = match store.face(face_id)? {
            Some(face) => face,
            None => {
                self.events.emit(FaceEvent::FaceThumbnailFailed { face_id });
                return Err(FaceError::FaceNotFound(face_id));
            }
        };
        self.get_or_create(face_id, Path::new(&face.photo_path), &face.bbox)
    }

    pub fn remove(&self, face_id: FaceId) -> Result<bool> {
        match std::fs::remove_file(self.path_for(face_id)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Deletes crops whose face no longer exists. Returns how many were removed.
    pub fn reclaim_orphans(&self, live: &[FaceId]) -> Result<usize> {
        let live: HashSet<FaceId> = live.iter().copied().collect();
        let shards = match std::fs::read_dir(&self.dir) {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        let mut removed = 0;
        for shard in shards {
            let shard = shard?;
            if !shard.file_type()?.is_dir() {
                continue;
            }
            for entry in std::fs::read_dir(shard.path())? {
                let entry = entry?;
                let name = entry.file_name();
                let Some(face_id) = name.to_str().and_then(parse_thumb_name) else {
                    continue;
                };
                if live.contains(&face_id) {
                    continue;
                }
                match std::fs::remove_file(entry.path()) {
                    Ok(()) => removed += 1,
                    Err(e) => warn!("Failed to remove orphaned face thumbnail {:?}: {}", entry.path(), e),
                }
            }
        }
        if removed > 0 {
            debug!("Reclaimed {} orphaned face thumbnails", removed);
        }
        Ok(removed)
    }
}

/// Fixed pool of `n` crop workers fed round-robin from `rx`. Results are
/// published on the cache's event bus. Must be called inside a tokio runtime.
pub fn start_workers(n: usize, mut rx: Receiver<FaceThumbJob>, cache: Arc<FaceThumbnailCache>, gauges: Arc<QueueGauges>) {
    let mut worker_txs = Vec::new();
    let mut worker_rxs = Vec::new();
    for _ in 0..n.max(1) {
        let (wt, wr) = tokio::sync::mpsc::channel::<FaceThumbJob>(256);
        worker_txs.push(wt);
        worker_rxs.push(wr);
    }

    tokio::spawn(async move {
        let mut idx = 0;
        while let Some(job) = rx.recv().await {
            let target_idx = idx % worker_txs.len();
            if worker_txs[target_idx].send(job).await.is_err() {
                break;
            }
            idx += 1;
        }
    });

    for mut worker_rx in worker_rxs.into_iter() {
        let cachec = cache.clone();
        let gaugesc = gauges.clone();
        tokio::spawn(async move {
            while let Some(job) = worker_rx.recv().await {
                gaugesc.thumb.fetch_sub(1, Ordering::Relaxed);
                let cache = cachec.clone();
                let face_id = job.face_id;
                // Render failures are already logged and published as events.
                let rendered = tokio::task::spawn_blocking(move || {
                    let _ = cache.get_or_create(job.face_id, &job.source, &job.bbox);
                })
                .await;
                if let Err(e) = rendered {
                    warn!("Face thumbnail worker for {} died: {}", face_id, e);
                    cachec.events.emit(FaceEvent::FaceThumbnailFailed { face_id });
                }
            }
        });
    }
}

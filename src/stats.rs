use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Process-wide counters for the face pipelines.
pub struct Stats {
    photos_scanned: AtomicU64,
    faces_discovered: AtomicU64,
    decode_failures: AtomicU64,
    analysis_failures: AtomicU64,
    persistence_failures: AtomicU64,
    thumbs_rendered: AtomicU64,
    thumbs_failed: AtomicU64,
    cluster_runs: AtomicU64,
    last_cluster_groups: AtomicU64,
    started: Instant,
    pass_start: parking_lot::Mutex<Option<Instant>>,
    pass_photos_at_start: AtomicU64,
    last_completed_pass_photos: AtomicU64,
    last_completed_pass_elapsed: parking_lot::Mutex<Option<f64>>,
    last_cluster_elapsed: parking_lot::Mutex<Option<f64>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub uptime_secs: u64,
    pub photos_scanned: u64,
    pub faces_discovered: u64,
    pub decode_failures: u64,
    pub analysis_failures: u64,
    pub persistence_failures: u64,
    pub thumbs_rendered: u64,
    pub thumbs_failed: u64,
    pub cluster_runs: u64,
    pub last_cluster_groups: u64,
    pub pass_running: bool,
    pub last_completed_pass_photos: u64,
    pub last_completed_pass_elapsed: Option<f64>,
    pub last_completed_pass_rate: Option<f64>,
    pub last_cluster_elapsed: Option<f64>,
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

impl Stats {
    pub fn new() -> Self {
        Self {
            photos_scanned: AtomicU64::new(0),
            faces_discovered: AtomicU64::new(0),
            decode_failures: AtomicU64::new(0),
            analysis_failures: AtomicU64::new(0),
            persistence_failures: AtomicU64::new(0),
            thumbs_rendered: AtomicU64::new(0),
            thumbs_failed: AtomicU64::new(0),
            cluster_runs: AtomicU64::new(0),
            last_cluster_groups: AtomicU64::new(0),
            started: Instant::now(),
            pass_start: parking_lot::Mutex::new(None),
            pass_photos_at_start: AtomicU64::new(0),
            last_completed_pass_photos: AtomicU64::new(0),
            last_completed_pass_elapsed: parking_lot::Mutex::new(None),
            last_cluster_elapsed: parking_lot::Mutex::new(None),
        }
    }
    pub fn inc_photos_scanned(&self) { self.photos_scanned.fetch_add(1, Ordering::Relaxed); }
    pub fn inc_faces(&self, n: u64) { self.faces_discovered.fetch_add(n, Ordering::Relaxed); }
    pub fn inc_decode_failures(&self) { self.decode_failures.fetch_add(1, Ordering::Relaxed); }
    pub fn inc_analysis_failures(&self) { self.analysis_failures.fetch_add(1, Ordering::Relaxed); }
    pub fn inc_persistence_failures(&self) { self.persistence_failures.fetch_add(1, Ordering::Relaxed); }
    pub fn inc_thumbs_rendered(&self) { self.thumbs_rendered.fetch_add(1, Ordering::Relaxed); }
    pub fn inc_thumbs_failed(&self) { self.thumbs_failed.fetch_add(1, Ordering::Relaxed); }

    pub fn photos_scanned(&self) -> u64 { self.photos_scanned.load(Ordering::Relaxed) }
    pub fn faces_discovered(&self) -> u64 { self.faces_discovered.load(Ordering::Relaxed) }
    pub fn uptime_secs(&self) -> u64 { self.started.elapsed().as_secs() }

    pub fn start_face_pass(&self) {
        *self.pass_start.lock() = Some(Instant::now());
        self.pass_photos_at_start.store(self.photos_scanned(), Ordering::Relaxed);
    }

    /// Stores totals of the pass that just ended and clears the timer.
    pub fn finish_face_pass(&self) {
        let mut guard = self.pass_start.lock();
        let Some(start) = guard.take() else {
            return;
        };
        let photos = self.photos_scanned().saturating_sub(self.pass_photos_at_start.load(Ordering::Relaxed));
        self.last_completed_pass_photos.store(photos, Ordering::Relaxed);
        *self.last_completed_pass_elapsed.lock() = Some(start.elapsed().as_secs_f64());
    }

    pub fn record_cluster_run(&self, groups: usize, elapsed: Duration) {
        self.cluster_runs.fetch_add(1, Ordering::Relaxed);
        self.last_cluster_groups.store(groups as u64, Ordering::Relaxed);
        *self.last_cluster_elapsed.lock() = Some(elapsed.as_secs_f64());
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let last_photos = self.last_completed_pass_photos.load(Ordering::Relaxed);
        let last_elapsed = *self.last_completed_pass_elapsed.lock();
        let rate = match last_elapsed {
            Some(secs) if secs > 0.0 && last_photos > 0 => Some(last_photos as f64 / secs),
            _ => None,
        };
        StatsSnapshot {
            uptime_secs: self.uptime_secs(),
            photos_scanned: self.photos_scanned(),
            faces_discovered: self.faces_discovered(),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            analysis_failures: self.analysis_failures.load(Ordering::Relaxed),
            persistence_failures: self.persistence_failures.load(Ordering::Relaxed),
            thumbs_rendered: self.thumbs_rendered.load(Ordering::Relaxed),
            thumbs_failed: self.thumbs_failed.load(Ordering::Relaxed),
            cluster_runs: self.cluster_runs.load(Ordering::Relaxed),
            last_cluster_groups: self.last_cluster_groups.load(Ordering::Relaxed),
            pass_running: self.pass_start.lock().is_some(),
            last_completed_pass_photos: last_photos,
            last_completed_pass_elapsed: last_elapsed,
            last_completed_pass_rate: rate,
            last_cluster_elapsed: *self.last_cluster_elapsed.lock(),
        }
    }

    pub fn metrics_text(&self) -> String {
        let snap = self.snapshot();
        let mut s = String::new();
        s.push_str(&format!("visage_uptime_seconds {}\n", snap.uptime_secs));
        s.push_str(&format!("visage_photos_scanned_total {}\n", snap.photos_scanned));
        s.push_str(&format!("visage_faces_discovered_total {}\n", snap.faces_discovered));
        s.push_str(&format!("visage_decode_failures_total {}\n", snap.decode_failures));
        s.push_str(&format!("visage_analysis_failures_total {}\n", snap.analysis_failures));
        s.push_str(&format!("visage_persistence_failures_total {}\n", snap.persistence_failures));
        s.push_str(&format!("visage_face_thumbnails_total {}\n", snap.thumbs_rendered));
        s.push_str(&format!("visage_cluster_runs_total {}\n", snap.cluster_runs));
        s
    }
}

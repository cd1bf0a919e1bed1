use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::pipeline::cluster::ClusterSettings;
use crate::pipeline::face::DetectorSettings;
use crate::pipeline::scanner::ScanSettings;

#[derive(Clone, Debug)]
pub struct Config {
    pub data: PathBuf,
    pub db_pool_size: u32,
    pub thumb_threads: usize,
    pub face_thumb_size: u32,
    pub max_working_width: u32,
    pub scan_progress_every: usize,
    pub scan_batch: usize,
    pub scan_throttle_ms: u64,
    pub cluster_epsilon: f32,
    pub min_cluster_size: usize,
    pub confidence_threshold: f32,
    pub nms_iou_threshold: f32,
    pub event_capacity: usize,
}

fn parsed<T: FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

fn default_threads() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data: PathBuf::from("./visage-data"),
            db_pool_size: 4,
            thumb_threads: default_threads(),
            face_thumb_size: 160,
            max_working_width: 1600,
            scan_progress_every: 5,
            scan_batch: 10,
            scan_throttle_ms: 250,
            cluster_epsilon: 1.0,
            min_cluster_size: 2,
            confidence_threshold: 0.5,
            nms_iou_threshold: 0.4,
            event_capacity: 1024,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let d = Self::default();
        let data = env::var("VISAGE_DATA").map(PathBuf::from).unwrap_or(d.data);
        Self {
            data,
            db_pool_size: parsed("VISAGE_DB_POOL_SIZE", d.db_pool_size).max(1),
            thumb_threads: parsed("VISAGE_THUMB_THREADS", d.thumb_threads).max(1),
            face_thumb_size: parsed("VISAGE_FACE_THUMB_SIZE", d.face_thumb_size).max(1),
            max_working_width: parsed("VISAGE_MAX_WORKING_WIDTH", d.max_working_width),
            scan_progress_every: parsed("VISAGE_SCAN_PROGRESS_EVERY", d.scan_progress_every).max(1),
            scan_batch: parsed("VISAGE_SCAN_BATCH", d.scan_batch).max(1),
            scan_throttle_ms: parsed("VISAGE_SCAN_THROTTLE_MS", d.scan_throttle_ms),
            cluster_epsilon: parsed("VISAGE_FACE_CLUSTER_EPSILON", d.cluster_epsilon),
            min_cluster_size: parsed("VISAGE_FACE_MIN_CLUSTER_SIZE", d.min_cluster_size).max(2),
            confidence_threshold: parsed("VISAGE_FACE_CONFIDENCE_THRESHOLD", d.confidence_threshold),
            nms_iou_threshold: parsed("VISAGE_FACE_NMS_IOU_THRESHOLD", d.nms_iou_threshold),
            event_capacity: parsed("VISAGE_EVENT_CAPACITY", d.event_capacity).max(1),
        }
    }

    pub fn scan_settings(&self) -> ScanSettings {
        ScanSettings {
            max_working_width: self.max_working_width,
            progress_every: self.scan_progress_every,
            batch_size: self.scan_batch,
            throttle_pause: Duration::from_millis(self.scan_throttle_ms),
        }
    }

    pub fn cluster_settings(&self) -> ClusterSettings {
        ClusterSettings { epsilon: self.cluster_epsilon, min_cluster_size: self.min_cluster_size }
    }

    pub fn detector_settings(&self) -> DetectorSettings {
        DetectorSettings {
            confidence_threshold: self.confidence_threshold,
            nms_iou_threshold: self.nms_iou_threshold,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: &[&str] = &[
        "VISAGE_DATA",
        "VISAGE_DB_POOL_SIZE",
        "VISAGE_THUMB_THREADS",
        "VISAGE_FACE_THUMB_SIZE",
        "VISAGE_MAX_WORKING_WIDTH",
        "VISAGE_SCAN_PROGRESS_EVERY",
        "VISAGE_SCAN_BATCH",
        "VISAGE_SCAN_THROTTLE_MS",
        "VISAGE_FACE_CLUSTER_EPSILON",
        "VISAGE_FACE_MIN_CLUSTER_SIZE",
        "VISAGE_FACE_CONFIDENCE_THRESHOLD",
        "VISAGE_FACE_NMS_IOU_THRESHOLD",
        "VISAGE_EVENT_CAPACITY",
    ];

    fn clear_vars(vars: &[&str]) -> Vec<(String, Option<String>)> {
        let mut saved = Vec::new();
        for &k in vars {
            let prev = env::var(k).ok();
            saved.push((k.to_string(), prev));
            env::remove_var(k);
        }
        saved
    }

    fn restore_vars(saved: Vec<(String, Option<String>)>) {
        for (k, v) in saved {
            if let Some(val) = v {
                env::set_var(k, val);
            } else {
                env::remove_var(k);
            }
        }
    }

    #[test]
    #[serial]
    fn test_config_defaults() {
        let saved = clear_vars(VARS);

        let config = Config::from_env();
        assert_eq!(config.data, PathBuf::from("./visage-data"));
        assert_eq!(config.db_pool_size, 4);
        assert!(config.thumb_threads >= 1);
        assert_eq!(config.face_thumb_size, 160);
        assert_eq!(config.max_working_width, 1600);
        assert_eq!(config.scan_progress_every, 5);
        assert_eq!(config.scan_batch, 10);
        assert_eq!(config.scan_throttle_ms, 250);
        assert_eq!(config.cluster_epsilon, 1.0);
        assert_eq!(config.min_cluster_size, 2);
        assert_eq!(config.event_capacity, 1024);

        restore_vars(saved);
    }

    #[test]
    #[serial]
    fn test_config_from_env() {
        let saved = clear_vars(VARS);

        env::set_var("VISAGE_DATA", "/custom/data");
        env::set_var("VISAGE_THUMB_THREADS", "3");
        env::set_var("VISAGE_FACE_THUMB_SIZE", "96");
        env::set_var("VISAGE_FACE_CLUSTER_EPSILON", "0.6");
        env::set_var("VISAGE_FACE_MIN_CLUSTER_SIZE", "3");
        env::set_var("VISAGE_SCAN_THROTTLE_MS", "0");

        let config = Config::from_env();
        assert_eq!(config.data, PathBuf::from("/custom/data"));
        assert_eq!(config.thumb_threads, 3);
        assert_eq!(config.face_thumb_size, 96);
        assert_eq!(config.cluster_settings().epsilon, 0.6);
        assert_eq!(config.cluster_settings().min_cluster_size, 3);
        assert_eq!(config.scan_settings().throttle_pause, Duration::ZERO);

        restore_vars(saved);
    }

    #[test]
    #[serial]
    fn test_config_rejects_garbage_and_zero() {
        let saved = clear_vars(VARS);

        env::set_var("VISAGE_SCAN_BATCH", "lots");
        env::set_var("VISAGE_THUMB_THREADS", "0");
        let config = Config::from_env();
        assert_eq!(config.scan_batch, 10);
        assert_eq!(config.thumb_threads, 1);

        restore_vars(saved);
    }

    #[test]
    #[serial]
    fn test_min_cluster_size_is_at_least_a_pair() {
        let saved = clear_vars(VARS);

        for raw in ["0", "1"] {
            env::set_var("VISAGE_FACE_MIN_CLUSTER_SIZE", raw);
            assert_eq!(Config::from_env().cluster_settings().min_cluster_size, 2);
        }

        restore_vars(saved);
    }
}

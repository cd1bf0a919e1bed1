mod common;

use std::sync::Arc;

use common::{drain, setup_store, write_garbage, write_photo, ColorAnalyzer, BLUE, GREEN, RED};
use tokio_util::sync::CancellationToken;
use visage_core::db::store::{FaceStore, SqliteFaceStore};
use visage_core::models::face::{BoundingBox, Face, FaceId, PendingPhoto, Person, PersonChoice, PersonId, PhotoId};
use visage_core::pipeline::events::{EventBus, FaceEvent};
use visage_core::pipeline::scanner::{FaceScanner, ScanReport, ScanSettings};
use visage_core::pipeline::thumb::FaceThumbnailCache;
use visage_core::pipeline::QueueGauges;
use visage_core::stats::Stats;
use visage_core::{FaceError, Result};

fn scanner(store: Arc<dyn FaceStore>, analyzer: Arc<ColorAnalyzer>, events: EventBus) -> FaceScanner {
    FaceScanner::new(store, analyzer, events, ScanSettings { progress_every: 2, ..ScanSettings::default() })
}

fn paths(store: &SqliteFaceStore, files: &[std::path::PathBuf]) -> Vec<PhotoId> {
    let names: Vec<String> = files.iter().map(|p| p.to_string_lossy().into_owned()).collect();
    store.upsert_photos(&names).unwrap()
}

#[test]
fn scan_marks_every_photo_including_undecodable_ones() {
    let (tmp, store) = setup_store();
    let files = vec![
        write_photo(&tmp.path().join("a.png"), 120, 80, &[((10, 10, 20, 20), RED), ((60, 10, 20, 20), BLUE)]),
        write_photo(&tmp.path().join("b.png"), 120, 80, &[]),
        write_garbage(&tmp.path().join("c.jpg")),
    ];
    paths(&store, &files);

    let stats = Arc::new(Stats::new());
    let report = scanner(store.clone(), Arc::new(ColorAnalyzer::new()), EventBus::new(64))
        .with_stats(stats.clone())
        .run(&CancellationToken::new())
        .unwrap();

    assert_eq!(
        report,
        ScanReport { total: 3, scanned: 3, faces: 2, decode_failures: 1, ..Default::default() }
    );
    assert!(store.unscanned_photos().unwrap().is_empty());
    assert_eq!(stats.photos_scanned(), 3);
    assert_eq!(stats.faces_discovered(), 2);

    let unknown = store.unknown_faces().unwrap();
    assert_eq!(unknown.len(), 2);
    assert!(unknown.iter().all(|f| f.state.is_unknown() && f.embedding.len() == 3));
}

#[test]
fn second_pass_finds_nothing_new() {
    let (tmp, store) = setup_store();
    let files = vec![write_photo(&tmp.path().join("a.png"), 64, 64, &[((8, 8, 16, 16), RED)])];
    paths(&store, &files);
    let analyzer = Arc::new(ColorAnalyzer::new());

    let first = scanner(store.clone(), analyzer.clone(), EventBus::new(16)).run(&CancellationToken::new()).unwrap();
    assert_eq!(first.faces, 1);

    let second = scanner(store.clone(), analyzer.clone(), EventBus::new(16)).run(&CancellationToken::new()).unwrap();
    assert_eq!(second, ScanReport::default());
    assert_eq!(store.unknown_faces().unwrap().len(), 1);
    assert_eq!(analyzer.seen_sizes.lock().len(), 1);
}

#[test]
fn hidden_photos_are_not_scanned() {
    let (tmp, store) = setup_store();
    let files = vec![
        write_photo(&tmp.path().join("shown.png"), 64, 64, &[((8, 8, 16, 16), RED)]),
        write_photo(&tmp.path().join("hidden.png"), 64, 64, &[((8, 8, 16, 16), BLUE)]),
    ];
    let ids = paths(&store, &files);
    assert!(store.hide_photo(ids[1]).unwrap());

    let report = scanner(store.clone(), Arc::new(ColorAnalyzer::new()), EventBus::new(16))
        .run(&CancellationToken::new())
        .unwrap();
    assert_eq!((report.total, report.faces), (1, 1));

    assert!(store.unhide_photo(ids[1]).unwrap());
    let pending = store.unscanned_photos().unwrap();
    assert_eq!(pending.iter().map(|p| p.id).collect::<Vec<_>>(), vec![ids[1]]);
}

#[test]
fn analyzer_without_models_skips_the_pass() {
    let (tmp, store) = setup_store();
    paths(&store, &[write_photo(&tmp.path().join("a.png"), 32, 32, &[])]);
    let events = EventBus::new(16);
    let mut rx = events.subscribe();
    let analyzer = Arc::new(ColorAnalyzer { not_ready: true, ..Default::default() });

    let report = scanner(store.clone(), analyzer, events).run(&CancellationToken::new()).unwrap();
    assert!(report.not_ready);
    assert_eq!(store.unscanned_photos().unwrap().len(), 1);
    assert!(matches!(drain(&mut rx).as_slice(), [FaceEvent::Status { .. }]));
}

#[test]
fn detector_failure_still_marks_photo_scanned() {
    let (tmp, store) = setup_store();
    paths(&store, &[
        write_photo(&tmp.path().join("g.png"), 64, 64, &[((8, 8, 16, 16), GREEN)]),
        write_photo(&tmp.path().join("r.png"), 64, 64, &[((8, 8, 16, 16), RED)]),
    ]);
    let analyzer = Arc::new(ColorAnalyzer { fail_on_green: true, ..Default::default() });

    let report = scanner(store.clone(), analyzer, EventBus::new(16)).run(&CancellationToken::new()).unwrap();
    assert_eq!((report.scanned, report.faces, report.analysis_failures), (2, 1, 1));
    assert!(store.unscanned_photos().unwrap().is_empty());
}

#[test]
fn boxes_found_on_downscaled_copy_are_stored_in_source_pixels() {
    let (tmp, store) = setup_store();
    paths(&store, &[write_photo(&tmp.path().join("wide.png"), 400, 200, &[((80, 40, 120, 120), RED)])]);
    let analyzer = Arc::new(ColorAnalyzer::new());
    let settings = ScanSettings { max_working_width: 100, ..ScanSettings::default() };

    FaceScanner::new(store.clone(), analyzer.clone(), EventBus::new(16), settings)
        .run(&CancellationToken::new())
        .unwrap();

    assert_eq!(*analyzer.seen_sizes.lock(), vec![(100, 50)]);
    let face = &store.unknown_faces().unwrap()[0];
    let expected = BoundingBox::new(80.0, 40.0, 200.0, 160.0);
    for (got, want) in [
        (face.bbox.x1, expected.x1),
        (face.bbox.y1, expected.y1),
        (face.bbox.x2, expected.x2),
        (face.bbox.y2, expected.y2),
    ] {
        assert!((got - want).abs() <= 8.0, "bbox {:?} too far from {:?}", face.bbox, expected);
    }
}

#[test]
fn discovery_and_progress_events_follow_processing_order() {
    let (tmp, store) = setup_store();
    let files: Vec<_> = (0..3)
        .map(|i| write_photo(&tmp.path().join(format!("p{}.png", i)), 64, 64, &[((8, 8, 16, 16), RED)]))
        .collect();
    paths(&store, &files);
    let events = EventBus::new(64);
    let mut rx = events.subscribe();
    let gauges = Arc::new(QueueGauges::default());

    scanner(store.clone(), Arc::new(ColorAnalyzer::new()), events)
        .with_gauges(gauges.clone())
        .run(&CancellationToken::new())
        .unwrap();

    let received = drain(&mut rx);
    let discovered: Vec<String> = received
        .iter()
        .filter_map(|e| match e {
            FaceEvent::FaceDiscovered { photo_path, .. } => Some(photo_path.clone()),
            _ => None,
        })
        .collect();
    let expected: Vec<String> = files.iter().map(|p| p.to_string_lossy().into_owned()).collect();
    assert_eq!(discovered, expected);

    let progress: Vec<(usize, usize)> = received
        .iter()
        .filter_map(|e| match e {
            FaceEvent::ScanProgress { done, total } => Some((*done, *total)),
            _ => None,
        })
        .collect();
    assert_eq!(progress, vec![(2, 3), (3, 3)]);
    assert!(matches!(received.last(), Some(FaceEvent::Status { .. })));
    assert_eq!(gauges.depths().face_scan, 0);
}

#[test]
fn cancelled_pass_leaves_photos_for_later() {
    let (tmp, store) = setup_store();
    paths(&store, &[write_photo(&tmp.path().join("a.png"), 32, 32, &[])]);
    let token = CancellationToken::new();
    token.cancel();

    let report = scanner(store.clone(), Arc::new(ColorAnalyzer::new()), EventBus::new(16)).run(&token).unwrap();
    assert!(report.cancelled);
    assert_eq!((report.total, report.scanned), (1, 0));
    assert_eq!(store.unscanned_photos().unwrap().len(), 1);
}

#[test]
fn faces_left_by_an_interrupted_pass_are_replaced() {
    let (tmp, store) = setup_store();
    let id = paths(&store, &[write_photo(&tmp.path().join("a.png"), 64, 64, &[((8, 8, 16, 16), RED)])])[0];
    let stale = store.add_face(id, &[0.0, 0.0, 0.0], &BoundingBox::new(1.0, 1.0, 5.0, 5.0), 0.7).unwrap();

    let report = scanner(store.clone(), Arc::new(ColorAnalyzer::new()), EventBus::new(16))
        .run(&CancellationToken::new())
        .unwrap();
    assert_eq!(report.faces, 1);
    assert!(store.face(stale).unwrap().is_none());
    assert_eq!(store.unknown_faces().unwrap().len(), 1);
}

#[test]
fn crops_of_faces_left_by_an_interrupted_pass_are_removed() {
    let (tmp, store) = setup_store();
    let source = write_photo(&tmp.path().join("a.png"), 64, 64, &[((8, 8, 16, 16), RED)]);
    let id = paths(&store, &[source.clone()])[0];
    let bbox = BoundingBox::new(8.0, 8.0, 24.0, 24.0);
    let stale = store.add_face(id, &[0.0, 0.0, 0.0], &bbox, 0.7).unwrap();

    let events = EventBus::new(16);
    let thumbs = Arc::new(FaceThumbnailCache::new(tmp.path().join("faces"), 32, events.clone()));
    thumbs.get_or_create(stale, &source, &bbox).unwrap();
    assert!(thumbs.path_for(stale).exists());

    let report = scanner(store.clone(), Arc::new(ColorAnalyzer::new()), events)
        .with_thumbnails(thumbs.clone())
        .run(&CancellationToken::new())
        .unwrap();
    assert_eq!(report.faces, 1);
    assert!(!thumbs.path_for(stale).exists());
    let fresh = store.unknown_faces().unwrap()[0].id;
    assert!(fresh > stale);
}

#[test]
fn malformed_raw_files_are_decode_failures_not_aborts() {
    let (tmp, store) = setup_store();
    let mut raf = b"FUJIFILMCCD-RAW 0201".to_vec();
    raf.resize(8192, 0xAB);
    let mut nef = b"II*\x00\x08\x00\x00\x00".to_vec();
    nef.resize(8192, 0xAB);
    std::fs::write(tmp.path().join("bad.raf"), &raf).unwrap();
    std::fs::write(tmp.path().join("bad.nef"), &nef).unwrap();
    let files = vec![
        tmp.path().join("bad.raf"),
        tmp.path().join("bad.nef"),
        write_photo(&tmp.path().join("z.png"), 64, 64, &[((8, 8, 16, 16), RED)]),
    ];
    paths(&store, &files);

    let report = scanner(store.clone(), Arc::new(ColorAnalyzer::new()), EventBus::new(16))
        .run(&CancellationToken::new())
        .unwrap();
    assert_eq!((report.scanned, report.decode_failures, report.faces), (3, 2, 1));
    assert!(store.unscanned_photos().unwrap().is_empty());
}

/// Delegates to SQLite but every face insert fails as if the database were locked.
struct FlakyStore {
    inner: SqliteFaceStore,
}

impl FaceStore for FlakyStore {
    fn unscanned_photos(&self) -> Result<Vec<PendingPhoto>> {
        self.inner.unscanned_photos()
    }
    fn mark_scanned(&self, photo_id: PhotoId) -> Result<()> {
        self.inner.mark_scanned(photo_id)
    }
    fn add_face(&self, photo_id: PhotoId, embedding: &[f32], bbox: &BoundingBox, confidence: f32) -> Result<FaceId> {
        let _ = (photo_id, embedding, bbox, confidence);
        Err(FaceError::Persistence(anyhow::anyhow!("database is locked")))
    }
    fn discard_partial_faces(&self, photo_id: PhotoId) -> Result<Vec<FaceId>> {
        self.inner.discard_partial_faces(photo_id)
    }
    fn face(&self, face_id: FaceId) -> Result<Option<Face>> {
        self.inner.face(face_id)
    }
    fn unknown_faces(&self) -> Result<Vec<Face>> {
        self.inner.unknown_faces()
    }
    fn encodings_for_clustering(&self) -> Result<Vec<(FaceId, Vec<f32>)>> {
        self.inner.encodings_for_clustering()
    }
    fn faces_for_person(&self, person_id: PersonId) -> Result<Vec<Face>> {
        self.inner.faces_for_person(person_id)
    }
    fn deleted_faces(&self) -> Result<Vec<Face>> {
        self.inner.deleted_faces()
    }
    fn live_face_ids(&self) -> Result<Vec<FaceId>> {
        self.inner.live_face_ids()
    }
    fn link_face_to_person(&self, face_id: FaceId, person_id: PersonId) -> Result<()> {
        self.inner.link_face_to_person(face_id, person_id)
    }
    fn soft_delete(&self, face_id: FaceId) -> Result<()> {
        self.inner.soft_delete(face_id)
    }
    fn restore(&self, face_id: FaceId) -> Result<()> {
        self.inner.restore(face_id)
    }
    fn confirm_faces(&self, face_ids: &[FaceId], choice: &PersonChoice) -> Result<PersonId> {
        self.inner.confirm_faces(face_ids, choice)
    }
    fn soft_delete_faces(&self, face_ids: &[FaceId]) -> Result<()> {
        self.inner.soft_delete_faces(face_ids)
    }
    fn add_person(&self, name: &str) -> Result<PersonId> {
        self.inner.add_person(name)
    }
    fn people(&self) -> Result<Vec<Person>> {
        self.inner.people()
    }
    fn person_by_name(&self, name: &str) -> Result<Option<Person>> {
        self.inner.person_by_name(name)
    }
    fn rename_person(&self, person_id: PersonId, name: &str) -> Result<PersonId> {
        self.inner.rename_person(person_id, name)
    }
    fn delete_person(&self, person_id: PersonId) -> Result<()> {
        self.inner.delete_person(person_id)
    }
}

#[test]
fn persistence_failure_is_counted_and_the_pass_continues() {
    let (tmp, sqlite) = setup_store();
    paths(&sqlite, &[
        write_photo(&tmp.path().join("a.png"), 64, 64, &[((8, 8, 16, 16), RED)]),
        write_photo(&tmp.path().join("b.png"), 64, 64, &[((8, 8, 16, 16), BLUE)]),
    ]);
    let store = Arc::new(FlakyStore { inner: (*sqlite).clone() });

    let report = scanner(store.clone(), Arc::new(ColorAnalyzer::new()), EventBus::new(16))
        .run(&CancellationToken::new())
        .unwrap();
    assert_eq!((report.scanned, report.faces, report.persistence_failures), (2, 0, 2));
    assert!(store.unscanned_photos().unwrap().is_empty());
    assert!(store.unknown_faces().unwrap().is_empty());
}

mod common;

use std::fs;

use common::{MANIFEST_URL, Origin, settings, sha256_hex};
use kiosk_content::{ContentSync, SyncOutcome};
use kiosk_core::{CancelToken, ContentLayout, MANIFEST_FILE};
use kiosk_types::EngineError;

fn three_file_manifest(version: &str) -> String {
    format!(
        r#"{{"version":"{version}","files":[
            {{"url":"https://cdn.example/logo.txt","filename":"logo.txt","checksum":"{}"}},
            {{"url":"https://cdn.example/menu.json","filename":"data/menu.json","checksum":"{}"}},
            {{"url":"https://cdn.example/promo.txt","filename":"promo.txt"}}
        ]}}"#,
        sha256_hex(b"logo"),
        sha256_hex(b"{\"items\":[]}"),
    )
}

fn origin(version: &str) -> Origin {
    Origin::default()
        .serve(MANIFEST_URL, three_file_manifest(version))
        .serve("https://cdn.example/logo.txt", "logo")
        .serve("https://cdn.example/menu.json", "{\"items\":[]}")
        .serve("https://cdn.example/promo.txt", "promo")
}

/// Seed `current/` with an older version in which only `logo.txt` matches.
fn seed_current(layout: &ContentLayout) {
    let current = layout.current();
    fs::create_dir_all(&current).unwrap();
    fs::write(current.join("logo.txt"), "logo").unwrap();
    fs::write(
        current.join(MANIFEST_FILE),
        r#"{"version":"old","files":[{"url":"https://cdn.example/logo.txt","filename":"logo.txt"}]}"#,
    )
    .unwrap();
}

#[test]
fn three_files_one_cached_two_downloaded() {
    let dir = tempfile::tempdir().expect("tmp dir");
    let settings = settings(dir.path(), 3);
    let layout = ContentLayout::new(&settings.content_root);
    seed_current(&layout);
    let origin = origin("2");

    let mut sync = ContentSync::with_transport(settings, &origin, CancelToken::new());
    let report = match sync.run().expect("sync") {
        SyncOutcome::Published(report) => report,
        other => panic!("unexpected outcome {other:?}"),
    };

    assert_eq!(origin.file_requests(), 2);
    assert_eq!(report.downloaded, 2);
    assert_eq!(report.reused, 1);
    assert_eq!(fs::read_to_string(layout.current().join("data/menu.json")).unwrap(), "{\"items\":[]}");

    let backup = report.backup.expect("old current backed up");
    let name = backup.file_name().unwrap().to_string_lossy().to_string();
    assert!(name.starts_with("backup-"), "dated backup, got {name}");
    assert!(backup.join("logo.txt").is_file());
    assert!(!backup.join("promo.txt").exists());
}

#[test]
fn unchanged_manifest_downloads_nothing() {
    let dir = tempfile::tempdir().expect("tmp dir");
    let origin = origin("5");

    ContentSync::with_transport(settings(dir.path(), 3), &origin, CancelToken::new())
        .run()
        .expect("first sync");
    let after_first = origin.file_requests();
    let layout = ContentLayout::new(dir.path().join("content"));
    let backups_before = layout.list_backups().unwrap().len();

    let outcome = ContentSync::with_transport(settings(dir.path(), 3), &origin, CancelToken::new())
        .run()
        .expect("second sync");
    assert_eq!(outcome, SyncOutcome::UpToDate { version: "5".into() });
    assert_eq!(origin.file_requests(), after_first);
    assert_eq!(layout.list_backups().unwrap().len(), backups_before);
}

#[test]
fn force_refetches_everything() {
    let dir = tempfile::tempdir().expect("tmp dir");
    let origin = origin("5");
    ContentSync::with_transport(settings(dir.path(), 3), &origin, CancelToken::new())
        .run()
        .unwrap();

    let mut forced = settings(dir.path(), 3);
    forced.force = true;
    let outcome = ContentSync::with_transport(forced, &origin, CancelToken::new())
        .run()
        .unwrap();
    assert!(matches!(outcome, SyncOutcome::Published(ref r) if r.downloaded == 3));
    assert_eq!(origin.file_requests(), 6);
}

#[test]
fn download_succeeds_on_last_allowed_attempt() {
    let dir = tempfile::tempdir().expect("tmp dir");
    // max_retries = 2 allows 3 attempts; fail twice.
    let origin = origin("1").fail("https://cdn.example/promo.txt", 2);
    let outcome = ContentSync::with_transport(settings(dir.path(), 2), &origin, CancelToken::new())
        .run()
        .expect("sync");
    assert!(matches!(outcome, SyncOutcome::Published(_)));
}

#[test]
fn exhausted_retries_abort_without_publish() {
    let dir = tempfile::tempdir().expect("tmp dir");
    let settings = settings(dir.path(), 2);
    let layout = ContentLayout::new(&settings.content_root);
    seed_current(&layout);
    let origin = origin("1").fail("https://cdn.example/promo.txt", 3);

    let err = ContentSync::with_transport(settings, &origin, CancelToken::new())
        .run()
        .unwrap_err();
    assert!(matches!(err, EngineError::Network(_)));
    assert_eq!(err.exit_code(), 2);
    assert!(!layout.current().join("promo.txt").exists());
    assert!(layout.list_backups().unwrap().is_empty());
    assert_eq!(fs::read_dir(layout.staging()).unwrap().count(), 0);
}

#[test]
fn checksum_mismatch_never_reaches_current() {
    let dir = tempfile::tempdir().expect("tmp dir");
    let settings = settings(dir.path(), 0);
    let layout = ContentLayout::new(&settings.content_root);
    seed_current(&layout);
    let origin = origin("9").serve("https://cdn.example/menu.json", "tampered");

    let err = ContentSync::with_transport(settings, &origin, CancelToken::new())
        .run()
        .unwrap_err();
    assert_eq!(err.exit_code(), 3);
    assert!(!layout.current().join("data/menu.json").exists());
    assert!(layout.current().join("logo.txt").is_file(), "old tree untouched");
}

#[test]
fn stale_lock_from_dead_pid_is_reclaimed() {
    let dir = tempfile::tempdir().expect("tmp dir");
    let settings = settings(dir.path(), 0);
    let lock_path = settings.lock_path.clone();
    fs::create_dir_all(lock_path.parent().unwrap()).unwrap();
    fs::write(&lock_path, r#"{"owner_pid":4000000,"acquired_at":"2026-10-01T00:00:00Z"}"#).unwrap();

    let origin = origin("1");
    let outcome = ContentSync::with_transport(settings, &origin, CancelToken::new()).run();
    assert!(matches!(outcome, Ok(SyncOutcome::Published(_))));
    assert!(!lock_path.exists(), "lock released after the run");
}

#[test]
fn live_lock_blocks_run_without_side_effects() {
    let dir = tempfile::tempdir().expect("tmp dir");
    let settings = settings(dir.path(), 0);
    let lock_path = settings.lock_path.clone();
    fs::create_dir_all(lock_path.parent().unwrap()).unwrap();
    fs::write(&lock_path, "1").unwrap();

    let origin = origin("1");
    let err = ContentSync::with_transport(settings, &origin, CancelToken::new())
        .run()
        .unwrap_err();
    assert_eq!(err.exit_code(), 4);
    assert_eq!(origin.file_requests(), 0);
    assert!(!dir.path().join("content").exists());
}

#[test]
fn cancelled_run_is_interrupted_and_releases_lock() {
    let dir = tempfile::tempdir().expect("tmp dir");
    let settings = settings(dir.path(), 0);
    let lock_path = settings.lock_path.clone();
    let cancel = CancelToken::new();
    cancel.cancel();

    let origin = origin("1");
    let err = ContentSync::with_transport(settings, &origin, cancel).run().unwrap_err();
    assert!(matches!(err, EngineError::Interrupted));
    assert!(!lock_path.exists());
    assert!(!dir.path().join("content/current").exists());
}

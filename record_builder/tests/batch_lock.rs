mod common;
use common::*;

use chrono::{Duration, TimeZone, Utc};
use record_builder::builder::FixedClock;
use record_builder::lock::{BatchLock, LockAttempt, LockInfo};
use record_builder::runner::{RunOptions, RunSummary, run_batch};
use record_builder::session::{EventType, RecordStatus, SessionStore};
use tempfile::TempDir;

fn seeded() -> (TestDb, TempDir, record_builder::config::Settings) {
    let (db, mut store) = setup_store();
    seed_instrument(store.connection(), "titan", "Titan", "UTC");
    let t0 = Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap();
    store
        .append_usage_event(&usage("titan", "s1", EventType::Start, t0))
        .unwrap();
    store
        .append_usage_event(&usage("titan", "s1", EventType::End, t0 + Duration::hours(1)))
        .unwrap();
    let dir = TempDir::new().unwrap();
    let settings = settings_in(dir.path(), &db.path);
    (db, dir, settings)
}

#[test]
fn held_lock_means_no_store_changes() {
    let (db, _dir, settings) = seeded();
    std::fs::write(
        &settings.lock_file,
        serde_json::to_vec(&LockInfo {
            pid: 4242,
            created: Utc::now(),
        })
        .unwrap(),
    )
    .unwrap();

    let summary = run_batch(
        &settings,
        FixedClock(Utc.with_ymd_and_hms(2024, 5, 10, 0, 0, 0).unwrap()),
        RunOptions::default(),
    )
    .unwrap();
    assert!(matches!(summary, RunSummary::Locked));

    let mut conn = record_builder::db::connection::connect_sqlite(&db.path).unwrap();
    assert_eq!(count(&mut conn, "session_log"), 2);
    assert_eq!(
        count_where(&mut conn, "session_log", "record_status = 'TO_BE_BUILT'"),
        2
    );
    // the foreign lock is left alone
    assert_eq!(BatchLock::read(&settings.lock_file).map(|i| i.pid), Some(4242));
}

#[test]
fn run_releases_the_lock_and_uploads_completed_records() {
    let (db, dir, mut settings) = seeded();
    settings.upload_dir = Some(dir.path().join("outbox"));
    let t0 = Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap();
    write_file_at(
        &data_dir(&settings, "Titan").join("a.json"),
        r#"{"DatasetType": "Image"}"#,
        t0 + Duration::minutes(10),
    );

    let summary = run_batch(
        &settings,
        FixedClock(t0 + Duration::hours(2)),
        RunOptions::default(),
    )
    .unwrap();
    let RunSummary::Ran {
        report,
        uploaded,
        upload_failures,
        ingest,
    } = summary
    else {
        panic!("lock unexpectedly held");
    };
    assert!(ingest.is_none());
    assert_eq!(report.tally()["completed"], 1);
    assert_eq!((uploaded, upload_failures), (1, 0));
    assert!(dir.path().join("outbox/titan_s1.json").is_file());
    assert!(!settings.lock_file.exists());

    let mut store = record_builder::session::SqliteSessionStore::open(&db.path).unwrap();
    assert_eq!(
        store.session_status("titan", "s1").unwrap(),
        Some(RecordStatus::Completed)
    );

    // the lock can be taken again right away
    match BatchLock::acquire(&settings.lock_file, Utc::now()).unwrap() {
        LockAttempt::Acquired(lock) => assert_eq!(lock.path(), settings.lock_file.as_path()),
        LockAttempt::Held(_) => panic!("lock leaked"),
    }
}

#![allow(dead_code)]

use chrono::{DateTime, Utc};
use diesel::QueryableByName;
use diesel::prelude::*;
use diesel::sql_types::{BigInt, Integer, Text};
use record_builder::config::{FileStrategy, Settings};
use record_builder::db::{connection, migrate};
use record_builder::instruments::sync::{InstrumentSpec, upsert_instrument};
use record_builder::retry::RetryPolicy;
use record_builder::session::{EventType, SqliteSessionStore, UsageEvent};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tempfile::TempDir;

#[derive(QueryableByName)]
struct JournalMode {
    #[diesel(sql_type = Text)]
    journal_mode: String,
}
#[derive(QueryableByName)]
struct ForeignKeys {
    #[diesel(sql_type = Integer)]
    foreign_keys: i32,
}
#[derive(QueryableByName)]
struct BusyTimeout {
    #[diesel(sql_type = Integer, column_name = "timeout")]
    busy_timeout: i32,
}
#[derive(QueryableByName)]
struct Count {
    #[diesel(sql_type = BigInt)]
    n: i64,
}

pub struct TestDb {
    _dir: TempDir,    // keep alive for the life of the test
    pub path: String, // <tmpdir>/test.db
}

pub fn setup_db() -> (TestDb, SqliteConnection) {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("test.db").to_string_lossy().to_string();

    migrate::run_all(&path).expect("migrations");
    let conn = connection::connect_sqlite(&path).expect("connect");
    (TestDb { _dir: dir, path }, conn)
}

pub fn setup_store() -> (TestDb, SqliteSessionStore) {
    let (db, conn) = setup_db();
    (db, SqliteSessionStore::new(conn))
}

pub fn assert_sqlite_pragmas(conn: &mut SqliteConnection) {
    use diesel::sql_query;

    let jm: JournalMode = sql_query("PRAGMA journal_mode;").get_result(conn).unwrap();
    assert_eq!(jm.journal_mode.to_lowercase(), "wal"); // WAL is persistent per DB file

    let fk: ForeignKeys = sql_query("PRAGMA foreign_keys;").get_result(conn).unwrap();
    assert_eq!(fk.foreign_keys, 1);

    let bt: BusyTimeout = sql_query("PRAGMA busy_timeout;").get_result(conn).unwrap();
    assert_eq!(bt.busy_timeout, 5000);
}

pub fn fk_check_empty(conn: &mut SqliteConnection) {
    #[derive(QueryableByName)]
    struct Violation {
        #[diesel(sql_type = Text)]
        table: String,
    }
    let v: Vec<Violation> = diesel::sql_query("PRAGMA foreign_key_check;")
        .load(conn)
        .unwrap();
    assert!(
        v.is_empty(),
        "foreign key violations in {:?}",
        v.iter().map(|x| &x.table).collect::<Vec<_>>()
    );
}

pub fn count(conn: &mut SqliteConnection, table: &str) -> i64 {
    count_where(conn, table, "1 = 1")
}

pub fn count_where(conn: &mut SqliteConnection, table: &str, predicate: &str) -> i64 {
    diesel::sql_query(format!("SELECT COUNT(*) AS n FROM {table} WHERE {predicate}"))
        .get_result::<Count>(conn)
        .unwrap()
        .n
}

pub fn seed_instrument(conn: &mut SqliteConnection, pid: &str, filestore_path: &str, tz: &str) {
    upsert_instrument(
        conn,
        pid,
        &InstrumentSpec {
            filestore_path: filestore_path.into(),
            timezone: tz.into(),
            harvester_type: "none".into(),
            harvester_endpoint: None,
            require_reservation: false,
        },
    )
    .unwrap();
}

pub fn usage(pid: &str, sid: &str, event_type: EventType, at: DateTime<Utc>) -> UsageEvent {
    UsageEvent {
        session_identifier: sid.into(),
        instrument_pid: pid.into(),
        event_type,
        timestamp: at,
        user: Some("jdoe".into()),
    }
}

/// Write `body` to `path` and set its modification time.
pub fn write_file_at(path: &Path, body: &str, at: DateTime<Utc>) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, body).unwrap();
    let f = File::options().write(true).open(path).unwrap();
    f.set_modified(SystemTime::from(at)).unwrap();
}

/// Settings rooted in `dir` with a 2-day grace window and no retry delay.
pub fn settings_in(dir: &Path, database_url: &str) -> Settings {
    Settings {
        database_url: database_url.into(),
        data_root: dir.join("data"),
        records_dir: dir.join("records"),
        metadata_dir: dir.join("metadata"),
        lock_file: dir.join("batch.lock"),
        file_strategy: FileStrategy::Exclusive,
        ignore_patterns: Vec::new(),
        grace_window_hours: 48,
        ingest_lookback_hours: 72,
        retry: RetryPolicy::immediate(2),
        upload_dir: None,
    }
}

pub fn data_dir(settings: &Settings, filestore_path: &str) -> PathBuf {
    settings.data_root.join(filestore_path)
}

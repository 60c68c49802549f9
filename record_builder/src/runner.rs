//! Process-level sequencing of one scheduled run.
//!
//! lock → store → registry → (ingest) → build → upload → unlock
//!
//! The lock is taken before the store is opened; a held lock ends the run
//! without touching anything.

use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

use crate::{
    builder::{BatchReport, BuildOptions, Clock, RecordBuilder},
    config::Settings,
    harvest::{self, IngestReport},
    instruments::InstrumentRegistry,
    lock::{BatchLock, LockAttempt},
    session::{SessionStore, SqliteSessionStore},
    upload::{DirectoryUploader, Uploader},
};

/// Options for [`run_batch`].
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Pull usage events from the harvesters before building.
    pub ingest_first: bool,
}

/// What a run did.
#[derive(Debug, Serialize)]
#[serde(tag = "run", rename_all = "snake_case")]
pub enum RunSummary {
    /// Another run holds the lock; nothing was done.
    Locked,
    /// The batch ran.
    Ran {
        /// Ingestion totals, if ingestion ran.
        ingest: Option<IngestReport>,
        /// Per-session outcomes.
        report: BatchReport,
        /// Documents uploaded.
        uploaded: usize,
        /// Documents whose upload failed after retries.
        upload_failures: usize,
    },
}

fn open_registry(store: &mut SqliteSessionStore) -> anyhow::Result<InstrumentRegistry> {
    let registry = InstrumentRegistry::from_rows(store.load_instruments()?)?;
    if registry.is_empty() {
        warn!("no instruments registered; run `instruments sync` first");
    }
    Ok(registry)
}

/// Run one batch under the lock.
pub fn run_batch(
    settings: &Settings,
    clock: impl Clock + 'static,
    opts: RunOptions,
) -> anyhow::Result<RunSummary> {
    let now = clock.now();
    let _lock = match BatchLock::acquire(&settings.lock_file, now)? {
        LockAttempt::Acquired(lock) => lock,
        LockAttempt::Held(_) => return Ok(RunSummary::Locked),
    };

    let mut store = SqliteSessionStore::open(&settings.database_url)?;
    let registry = open_registry(&mut store)?;

    let ingest = if opts.ingest_first {
        Some(harvest::ingest_all(
            &registry,
            &mut store,
            settings.ingest_lookback(),
            now,
            &settings.retry,
        )?)
    } else {
        None
    };

    let builder =
        RecordBuilder::new(&registry, BuildOptions::from_settings(settings)?).with_clock(clock);
    let report = builder.build_pending(&mut store)?;

    let documents = report.completed_documents();
    let (uploaded, upload_failures) = match &settings.upload_dir {
        Some(dir) if !documents.is_empty() => {
            let results = DirectoryUploader::new(dir).upload(&documents, &settings.retry);
            let ok = results.iter().filter(|r| r.outcome.is_ok()).count();
            (ok, results.len() - ok)
        }
        _ => (0, 0),
    };
    info!(uploaded, upload_failures, "run finished");

    Ok(RunSummary::Ran {
        ingest,
        report,
        uploaded,
        upload_failures,
    })
}

/// Ingest usage events only, under the same lock.
pub fn run_ingest(settings: &Settings) -> anyhow::Result<Option<IngestReport>> {
    let now = Utc::now();
    let _lock = match BatchLock::acquire(&settings.lock_file, now)? {
        LockAttempt::Acquired(lock) => lock,
        LockAttempt::Held(_) => return Ok(None),
    };
    let mut store = SqliteSessionStore::open(&settings.database_url)?;
    let registry = open_registry(&mut store)?;
    let report = harvest::ingest_all(
        &registry,
        &mut store,
        settings.ingest_lookback(),
        now,
        &settings.retry,
    )?;
    Ok(Some(report))
}

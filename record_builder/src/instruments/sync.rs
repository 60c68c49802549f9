//! Instrument catalog synchronization into SQLite.
//!
//! ## What this does
//! - Normalizes an [`InstrumentCatalog`] and builds the desired `instruments` rows.
//! - Reads the current rows and computes an [`InstrumentDiff`].
//! - Applies the diff with UPSERTs (idempotent) and optional **prune** deletes.
//!
//! ## Transactions & consistency
//! Everything runs inside a single `BEGIN IMMEDIATE` transaction, so the whole
//! diff applies or none of it. Pruning an instrument that still has
//! `session_log` rows fails on the `ON DELETE RESTRICT` foreign key; the audit
//! trail always wins over the catalog.
//!
//! ## Dry-run
//! With [`SyncOptions::dry_run`] the diff is computed and returned, nothing is written.

use std::{collections::BTreeMap, fmt};

use diesel::prelude::*;
use diesel::{SqliteConnection, insert_into};

use crate::{
    instruments::catalog::{InstrumentCatalog, normalize_catalog},
    models::{InstrumentRow, NewInstrument},
    schema::instruments,
};

/// Options for catalog synchronization.
#[derive(Debug, Clone, Copy, Default)]
pub struct SyncOptions {
    /// If true, compute the diff only.
    pub dry_run: bool,
    /// If true, delete instruments that are not present in the catalog.
    pub prune: bool,
}

/// Desired column values for one instrument (pid is the map key).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstrumentSpec {
    /// File store path relative to the data root.
    pub filestore_path: String,
    /// IANA zone name.
    pub timezone: String,
    /// Harvester code.
    pub harvester_type: String,
    /// Harvester endpoint.
    pub harvester_endpoint: Option<String>,
    /// Reservation requirement flag.
    pub require_reservation: bool,
}

impl From<InstrumentRow> for InstrumentSpec {
    fn from(r: InstrumentRow) -> Self {
        Self {
            filestore_path: r.filestore_path,
            timezone: r.timezone,
            harvester_type: r.harvester_type,
            harvester_endpoint: r.harvester_endpoint,
            require_reservation: r.require_reservation,
        }
    }
}

/// What needs to change to make DB == catalog.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstrumentDiff {
    /// New or changed instruments.
    pub upsert: BTreeMap<String, InstrumentSpec>,
    /// Instruments present in the DB but not in the catalog (only filled when pruning).
    pub delete: Vec<String>,
}

impl InstrumentDiff {
    /// True if there is nothing to upsert or delete.
    pub fn is_noop(&self) -> bool {
        self.upsert.is_empty() && self.delete.is_empty()
    }
}

impl fmt::Display for InstrumentDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_noop() {
            return writeln!(f, "instruments up to date");
        }
        for (pid, spec) in &self.upsert {
            writeln!(
                f,
                "+ {pid}  {} [{}] via {}",
                spec.filestore_path, spec.timezone, spec.harvester_type
            )?;
        }
        for pid in &self.delete {
            writeln!(f, "- {pid}")?;
        }
        Ok(())
    }
}

fn wanted_from_catalog(cat: &InstrumentCatalog) -> BTreeMap<String, InstrumentSpec> {
    cat.instruments
        .iter()
        .map(|(pid, cfg)| {
            (
                pid.clone(),
                InstrumentSpec {
                    filestore_path: cfg.filestore_path.clone(),
                    timezone: cfg.timezone.clone(),
                    harvester_type: cfg.harvester.clone(),
                    harvester_endpoint: cfg.harvester_endpoint.clone(),
                    require_reservation: cfg.require_reservation,
                },
            )
        })
        .collect()
}

fn read_current(conn: &mut SqliteConnection) -> QueryResult<BTreeMap<String, InstrumentSpec>> {
    Ok(instruments::table
        .select(InstrumentRow::as_select())
        .load(conn)?
        .into_iter()
        .map(|r| (r.instrument_pid.clone(), InstrumentSpec::from(r)))
        .collect())
}

fn compute_diff(
    want: BTreeMap<String, InstrumentSpec>,
    current: &BTreeMap<String, InstrumentSpec>,
    prune: bool,
) -> InstrumentDiff {
    let delete = if prune {
        current
            .keys()
            .filter(|pid| !want.contains_key(*pid))
            .cloned()
            .collect()
    } else {
        Vec::new()
    };
    let upsert = want
        .into_iter()
        .filter(|(pid, spec)| current.get(pid) != Some(spec))
        .collect();
    InstrumentDiff { upsert, delete }
}

/// Upsert one instrument row.
pub fn upsert_instrument(
    conn: &mut SqliteConnection,
    pid: &str,
    spec: &InstrumentSpec,
) -> QueryResult<usize> {
    let row = NewInstrument {
        instrument_pid: pid,
        filestore_path: &spec.filestore_path,
        timezone: &spec.timezone,
        harvester_type: &spec.harvester_type,
        harvester_endpoint: spec.harvester_endpoint.as_deref(),
        require_reservation: spec.require_reservation,
    };
    insert_into(instruments::table)
        .values(&row)
        .on_conflict(instruments::instrument_pid)
        .do_update()
        .set(&row)
        .execute(conn)
}

/// Sync the instrument catalog into SQLite and return the applied (or, for a dry run,
/// the pending) diff.
pub fn sync_instruments(
    conn: &mut SqliteConnection,
    mut cat: InstrumentCatalog,
    opt: SyncOptions,
) -> anyhow::Result<InstrumentDiff> {
    normalize_catalog(&mut cat)?;
    let want = wanted_from_catalog(&cat);

    conn.immediate_transaction::<_, anyhow::Error, _>(|conn| {
        let current = read_current(conn)?;
        let diff = compute_diff(want, &current, opt.prune);
        if opt.dry_run {
            return Ok(diff);
        }

        for (pid, spec) in &diff.upsert {
            upsert_instrument(conn, pid, spec)?;
        }
        for pid in &diff.delete {
            diesel::delete(instruments::table.find(pid)).execute(conn)?;
        }
        tracing::info!(
            upserted = diff.upsert.len(),
            deleted = diff.delete.len(),
            "instrument catalog synced"
        );
        Ok(diff)
    })
}

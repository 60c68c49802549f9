//! Instrument reference data.
//!
//! - [`catalog`]: the TOML catalog model and its normalization.
//! - [`sync`]: pushes the catalog into the `instruments` table.
//! - [`InstrumentRegistry`]: the immutable, load-once lookup table handed to
//!   every component that needs an instrument by pid.

pub mod catalog;
pub mod sync;

use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono_tz::Tz;
use indexmap::IndexMap;

use crate::{harvest::HarvesterKind, models::InstrumentRow, tz};

/// One instrument, with its columns parsed into typed values.
#[derive(Debug, Clone, PartialEq)]
pub struct Instrument {
    /// Unique identifier.
    pub pid: String,
    /// File store directory relative to the data root.
    pub filestore_path: PathBuf,
    /// Time zone of the instrument's location.
    pub timezone: Tz,
    /// Harvester variant serving this instrument.
    pub harvester: HarvesterKind,
    /// Harvester endpoint (URL or export path).
    pub harvester_endpoint: Option<String>,
    /// Whether a missing reservation is terminal.
    pub require_reservation: bool,
}

impl Instrument {
    /// Absolute root of the instrument's files under `data_root`.
    pub fn root(&self, data_root: &Path) -> PathBuf {
        data_root.join(&self.filestore_path)
    }
}

impl TryFrom<InstrumentRow> for Instrument {
    type Error = anyhow::Error;

    fn try_from(row: InstrumentRow) -> Result<Self, Self::Error> {
        let timezone = tz::parse_tz(&row.timezone)
            .with_context(|| format!("instrument {}", row.instrument_pid))?;
        let harvester = row
            .harvester_type
            .parse()
            .with_context(|| format!("instrument {}", row.instrument_pid))?;
        Ok(Self {
            pid: row.instrument_pid,
            filestore_path: PathBuf::from(row.filestore_path),
            timezone,
            harvester,
            harvester_endpoint: row.harvester_endpoint,
            require_reservation: row.require_reservation,
        })
    }
}

/// Immutable instrument lookup built once at startup.
#[derive(Debug, Clone, Default)]
pub struct InstrumentRegistry {
    by_pid: IndexMap<String, Instrument>,
}

impl InstrumentRegistry {
    /// Build the registry from stored rows; any unparsable row is an error.
    pub fn from_rows(rows: impl IntoIterator<Item = InstrumentRow>) -> anyhow::Result<Self> {
        let mut by_pid = IndexMap::new();
        for row in rows {
            let inst = Instrument::try_from(row)?;
            by_pid.insert(inst.pid.clone(), inst);
        }
        Ok(Self { by_pid })
    }

    /// Build from already typed instruments.
    pub fn from_instruments(instruments: impl IntoIterator<Item = Instrument>) -> Self {
        Self {
            by_pid: instruments
                .into_iter()
                .map(|i| (i.pid.clone(), i))
                .collect(),
        }
    }

    /// Look up an instrument by pid.
    pub fn get(&self, pid: &str) -> Option<&Instrument> {
        self.by_pid.get(pid)
    }

    /// Iterate instruments in load order.
    pub fn iter(&self) -> impl Iterator<Item = &Instrument> {
        self.by_pid.values()
    }

    /// Number of instruments.
    pub fn len(&self) -> usize {
        self.by_pid.len()
    }

    /// True if no instruments are registered.
    pub fn is_empty(&self) -> bool {
        self.by_pid.is_empty()
    }
}

//! Reservation harvesters.
//!
//! A harvester translates an external reservation/usage system into two things:
//! - [`UsageEvent`]s appended to the session log (START / END rows)
//! - [`ReservationEvent`]s describing who used the instrument and why, looked up
//!   while a record is built
//!
//! Every instrument names its variant through `harvester_type`; [`build_source`]
//! maps that code to a concrete [`ReservationSource`].

pub mod export_file;

use std::{fmt, path::PathBuf, str::FromStr};

use anyhow::bail;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{
    instruments::{Instrument, InstrumentRegistry},
    retry::{RetryPolicy, Retryable},
    session::{SessionStore, UsageEvent, store::AppendOutcome},
};

pub use export_file::ExportFileSource;

/// Harvester variants known to this build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HarvesterKind {
    /// No reservation system; every lookup is a no-match.
    None,
    /// Reservations and usage events read from a JSON export file.
    ExportFile,
}

impl HarvesterKind {
    /// Code stored in `instruments.harvester_type`.
    pub const fn as_str(self) -> &'static str {
        match self {
            HarvesterKind::None => "none",
            HarvesterKind::ExportFile => "export_file",
        }
    }

    /// Whether the variant cannot work without `harvester_endpoint`.
    pub const fn needs_endpoint(self) -> bool {
        matches!(self, HarvesterKind::ExportFile)
    }
}

impl fmt::Display for HarvesterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HarvesterKind {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "none" => HarvesterKind::None,
            "export_file" => HarvesterKind::ExportFile,
            _ => bail!("unknown harvester: {s}"),
        })
    }
}

/// Normalized reservation describing one booking of an instrument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationEvent {
    /// Identifier in the external system.
    pub reservation_id: Option<String>,
    /// Short title of the experiment.
    pub title: Option<String>,
    /// User who booked the instrument.
    pub user: Option<String>,
    /// Free-text purpose of the session.
    pub purpose: Option<String>,
    /// Project or account the booking belongs to.
    pub project: Option<String>,
    /// Booked start.
    pub start: DateTime<Utc>,
    /// Booked end.
    pub end: DateTime<Utc>,
    /// The user declined record building for this booking.
    pub consent_withheld: bool,
}

impl ReservationEvent {
    /// Seconds of overlap with `[from, to]`, zero when disjoint.
    pub fn overlap_secs(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> i64 {
        let lo = self.start.max(from);
        let hi = self.end.min(to);
        (hi - lo).num_seconds().max(0)
    }
}

/// Result of a reservation lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReservationLookup {
    /// A reservation overlapped the session.
    Found(ReservationEvent),
    /// Nothing matched.
    NoMatch,
}

/// Failures talking to a reservation system.
#[derive(thiserror::Error, Debug)]
pub enum HarvestError {
    /// The service or export could not be reached.
    #[error("reservation source unavailable: {0}")]
    Unavailable(String),
    /// Reading the export failed.
    #[error("read {path}: {source}")]
    Read {
        /// Export path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The export is not valid JSON of the expected shape.
    #[error("malformed export {path}: {source}")]
    Malformed {
        /// Export path.
        path: PathBuf,
        /// Parser error.
        #[source]
        source: serde_json::Error,
    },
    /// A timestamp in the export could not be resolved.
    #[error("bad timestamp {value:?}: {reason}")]
    Timestamp {
        /// Raw value.
        value: String,
        /// Why it was rejected.
        reason: String,
    },
    /// The instrument is not configured for this harvester.
    #[error("instrument {0} has no harvester endpoint")]
    MissingEndpoint(String),
}

impl Retryable for HarvestError {
    fn is_transient(&self) -> bool {
        match self {
            HarvestError::Unavailable(_) => true,
            HarvestError::Read { source, .. } => {
                source.kind() != std::io::ErrorKind::PermissionDenied
            }
            _ => false,
        }
    }
}

/// Capability every harvester variant implements.
pub trait ReservationSource {
    /// Best reservation overlapping `[dt_from, dt_to]` on `instrument`.
    fn find_reservation(
        &self,
        instrument: &Instrument,
        dt_from: DateTime<Utc>,
        dt_to: DateTime<Utc>,
    ) -> Result<ReservationLookup, HarvestError>;

    /// START / END events observed within `lookback` before `now`.
    fn ingest_usage_events(
        &self,
        instrument: &Instrument,
        lookback: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<UsageEvent>, HarvestError>;

    /// Whether a session without a matching reservation is NO_RESERVATION.
    fn requires_reservation(&self) -> bool;
}

/// Source for instruments without a reservation system.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoReservationSource {
    require: bool,
}

impl NoReservationSource {
    /// `require` makes every session NO_RESERVATION.
    pub fn new(require: bool) -> Self {
        Self { require }
    }
}

impl ReservationSource for NoReservationSource {
    fn find_reservation(
        &self,
        _instrument: &Instrument,
        _dt_from: DateTime<Utc>,
        _dt_to: DateTime<Utc>,
    ) -> Result<ReservationLookup, HarvestError> {
        Ok(ReservationLookup::NoMatch)
    }

    fn ingest_usage_events(
        &self,
        _instrument: &Instrument,
        _lookback: Duration,
        _now: DateTime<Utc>,
    ) -> Result<Vec<UsageEvent>, HarvestError> {
        Ok(Vec::new())
    }

    fn requires_reservation(&self) -> bool {
        self.require
    }
}

/// Build the reservation source configured for `instrument`.
pub fn build_source(instrument: &Instrument) -> Result<Box<dyn ReservationSource>, HarvestError> {
    match instrument.harvester {
        HarvesterKind::None => Ok(Box::new(NoReservationSource::new(
            instrument.require_reservation,
        ))),
        HarvesterKind::ExportFile => {
            let endpoint = instrument
                .harvester_endpoint
                .as_deref()
                .ok_or_else(|| HarvestError::MissingEndpoint(instrument.pid.clone()))?;
            Ok(Box::new(ExportFileSource::new(
                endpoint,
                instrument.require_reservation,
            )))
        }
    }
}

/// Totals of one ingestion pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    /// Rows written.
    pub inserted: usize,
    /// Events already on record.
    pub duplicates: usize,
    /// Instruments whose harvester failed after retries.
    pub failed_instruments: Vec<String>,
}

/// Pull usage events from every instrument's harvester into the store.
///
/// Harvester failures are logged per instrument and do not stop the pass;
/// store failures are returned.
pub fn ingest_all(
    registry: &InstrumentRegistry,
    store: &mut dyn SessionStore,
    lookback: Duration,
    now: DateTime<Utc>,
    retry: &RetryPolicy,
) -> anyhow::Result<IngestReport> {
    let mut report = IngestReport::default();
    for instrument in registry.iter() {
        let events = build_source(instrument).and_then(|source| {
            retry.run("ingest_usage_events", || {
                source.ingest_usage_events(instrument, lookback, now)
            })
        });
        let events = match events {
            Ok(events) => events,
            Err(err) => {
                warn!(instrument = %instrument.pid, error = %err, "usage harvest failed");
                report.failed_instruments.push(instrument.pid.clone());
                continue;
            }
        };
        for event in &events {
            match store.append_usage_event(event)? {
                AppendOutcome::Inserted => report.inserted += 1,
                AppendOutcome::Duplicate => report.duplicates += 1,
            }
        }
    }
    info!(
        inserted = report.inserted,
        duplicates = report.duplicates,
        failed = report.failed_instruments.len(),
        "usage ingestion finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn kind_codes_round_trip() {
        for kind in [HarvesterKind::None, HarvesterKind::ExportFile] {
            assert_eq!(kind.as_str().parse::<HarvesterKind>().unwrap(), kind);
            assert_eq!(kind.to_string(), kind.as_str());
        }
        let err = "nemo".parse::<HarvesterKind>().unwrap_err();
        assert!(err.to_string().contains("unknown harvester"));
        assert!(HarvesterKind::ExportFile.needs_endpoint());
        assert!(!HarvesterKind::None.needs_endpoint());
    }

    #[test]
    fn overlap_is_clamped() {
        let t = |h| Utc.with_ymd_and_hms(2024, 5, 1, h, 0, 0).unwrap();
        let ev = ReservationEvent {
            reservation_id: None,
            title: None,
            user: None,
            purpose: None,
            project: None,
            start: t(9),
            end: t(12),
            consent_withheld: false,
        };
        assert_eq!(ev.overlap_secs(t(11), t(14)), 3600);
        assert_eq!(ev.overlap_secs(t(13), t(14)), 0);
    }

    #[test]
    fn transient_classification() {
        assert!(HarvestError::Unavailable("down".into()).is_transient());
        assert!(!HarvestError::MissingEndpoint("x".into()).is_transient());
    }
}

//! Harvester backed by a JSON export of a reservation system.
//!
//! The export is re-read on every call so an external job can refresh it
//! between runs:
//!
//! ```json
//! {
//!   "reservations": [
//!     { "id": "r-17", "title": "Grain boundaries", "user": "jdoe",
//!       "purpose": "tilt series", "project": "MML-22",
//!       "start": "2024-05-01T09:00:00", "end": "2024-05-01T12:00:00",
//!       "consent": true }
//!   ],
//!   "usage": [
//!     { "session_identifier": "s-1", "event": "START",
//!       "time": "2024-05-01T09:05:00", "user": "jdoe" }
//!   ]
//! }
//! ```
//!
//! Times are either RFC-3339 with an offset or naive wall-clock times in the
//! instrument's zone; ambiguous fall-back times resolve to the earlier instant.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use serde::Deserialize;
use tracing::{debug, warn};

use super::{HarvestError, ReservationEvent, ReservationLookup, ReservationSource};
use crate::{
    instruments::Instrument,
    session::{EventType, UsageEvent},
    tz::{self, DstPolicy},
};

#[derive(Debug, Default, Deserialize)]
struct Export {
    #[serde(default)]
    reservations: Vec<ExportReservation>,
    #[serde(default)]
    usage: Vec<ExportUsage>,
}

#[derive(Debug, Deserialize)]
struct ExportReservation {
    id: Option<String>,
    title: Option<String>,
    user: Option<String>,
    purpose: Option<String>,
    project: Option<String>,
    start: String,
    end: String,
    #[serde(default = "consent_default")]
    consent: bool,
}

fn consent_default() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct ExportUsage {
    session_identifier: String,
    event: EventType,
    time: String,
    user: Option<String>,
}

/// [`ReservationSource`] reading one export file.
#[derive(Debug, Clone)]
pub struct ExportFileSource {
    path: PathBuf,
    require: bool,
}

impl ExportFileSource {
    /// Source reading `path`.
    pub fn new(path: impl Into<PathBuf>, require: bool) -> Self {
        Self {
            path: path.into(),
            require,
        }
    }

    /// Export location.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<Export, HarvestError> {
        let bytes = std::fs::read(&self.path).map_err(|source| HarvestError::Read {
            path: self.path.clone(),
            source,
        })?;
        serde_json::from_slice(&bytes).map_err(|source| HarvestError::Malformed {
            path: self.path.clone(),
            source,
        })
    }
}

fn resolve_time(raw: &str, instrument: &Instrument) -> Result<DateTime<Utc>, HarvestError> {
    if let Ok(dt) = tz::parse_ts_to_utc(raw) {
        return Ok(dt);
    }
    let naive = NaiveDateTime::parse_from_str(raw.trim(), "%Y-%m-%dT%H:%M:%S").map_err(|e| {
        HarvestError::Timestamp {
            value: raw.to_string(),
            reason: e.to_string(),
        }
    })?;
    tz::from_local_naive_with_policy(naive, instrument.timezone, DstPolicy::PreferEarliest).map_err(
        |e| HarvestError::Timestamp {
            value: raw.to_string(),
            reason: e.to_string(),
        },
    )
}

impl ReservationSource for ExportFileSource {
    fn find_reservation(
        &self,
        instrument: &Instrument,
        dt_from: DateTime<Utc>,
        dt_to: DateTime<Utc>,
    ) -> Result<ReservationLookup, HarvestError> {
        let export = self.load()?;
        let mut best: Option<(i64, ReservationEvent)> = None;
        for r in export.reservations {
            let event = ReservationEvent {
                reservation_id: r.id,
                title: r.title,
                user: r.user,
                purpose: r.purpose,
                project: r.project,
                start: resolve_time(&r.start, instrument)?,
                end: resolve_time(&r.end, instrument)?,
                consent_withheld: !r.consent,
            };
            let overlap = event.overlap_secs(dt_from, dt_to);
            if overlap == 0 {
                continue;
            }
            // Largest overlap wins; ties go to the earlier booking.
            let better = match &best {
                None => true,
                Some((o, b)) => overlap > *o || (overlap == *o && event.start < b.start),
            };
            if better {
                best = Some((overlap, event));
            }
        }
        Ok(match best {
            Some((overlap, event)) => {
                debug!(
                    instrument = %instrument.pid,
                    reservation = ?event.reservation_id,
                    overlap_secs = overlap,
                    "reservation matched"
                );
                ReservationLookup::Found(event)
            }
            None => ReservationLookup::NoMatch,
        })
    }

    fn ingest_usage_events(
        &self,
        instrument: &Instrument,
        lookback: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<UsageEvent>, HarvestError> {
        let since = now - lookback;
        let mut out = Vec::new();
        for u in self.load()?.usage {
            if u.event == EventType::RecordGeneration {
                warn!(
                    instrument = %instrument.pid,
                    session = %u.session_identifier,
                    "export lists RECORD_GENERATION as usage; ignored"
                );
                continue;
            }
            let timestamp = resolve_time(&u.time, instrument)?;
            if timestamp < since || timestamp > now {
                continue;
            }
            out.push(UsageEvent {
                session_identifier: u.session_identifier,
                instrument_pid: instrument.pid.clone(),
                event_type: u.event,
                timestamp,
                user: u.user,
            });
        }
        out.sort_by_key(|e| e.timestamp);
        Ok(out)
    }

    fn requires_reservation(&self) -> bool {
        self.require
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harvest::HarvesterKind;
    use chrono::TimeZone;

    fn titan(endpoint: &Path) -> Instrument {
        Instrument {
            pid: "titan".into(),
            filestore_path: "Titan".into(),
            timezone: chrono_tz::America::New_York,
            harvester: HarvesterKind::ExportFile,
            harvester_endpoint: Some(endpoint.display().to_string()),
            require_reservation: true,
        }
    }

    fn write_export(dir: &Path, body: &str) -> PathBuf {
        let p = dir.join("export.json");
        std::fs::write(&p, body).unwrap();
        p
    }

    const EXPORT: &str = r#"{
        "reservations": [
            {"id": "r-1", "title": "short", "start": "2024-05-01T09:00:00", "end": "2024-05-01T09:30:00"},
            {"id": "r-2", "title": "long", "user": "jdoe", "start": "2024-05-01T09:00:00", "end": "2024-05-01T12:00:00", "consent": false}
        ],
        "usage": [
            {"session_identifier": "s-1", "event": "START", "time": "2024-05-01T09:05:00", "user": "jdoe"},
            {"session_identifier": "s-1", "event": "END", "time": "2024-05-01T13:05:00Z"},
            {"session_identifier": "s-0", "event": "START", "time": "2024-04-01T09:05:00"}
        ]
    }"#;

    #[test]
    fn picks_largest_overlap_in_local_time() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_export(dir.path(), EXPORT);
        let inst = titan(&path);
        let src = ExportFileSource::new(&path, true);

        // 13:00-16:00Z == 09:00-12:00 EDT
        let from = Utc.with_ymd_and_hms(2024, 5, 1, 13, 0, 0).unwrap();
        let to = Utc.with_ymd_and_hms(2024, 5, 1, 16, 0, 0).unwrap();
        let ReservationLookup::Found(ev) = src.find_reservation(&inst, from, to).unwrap() else {
            panic!("expected a reservation");
        };
        assert_eq!(ev.reservation_id.as_deref(), Some("r-2"));
        assert!(ev.consent_withheld);
        assert_eq!(ev.start, from);

        let later = Utc.with_ymd_and_hms(2024, 5, 2, 13, 0, 0).unwrap();
        assert_eq!(
            src.find_reservation(&inst, later, later + Duration::hours(1))
                .unwrap(),
            ReservationLookup::NoMatch
        );
        assert!(src.requires_reservation());
    }

    #[test]
    fn usage_events_respect_lookback() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_export(dir.path(), EXPORT);
        let inst = titan(&path);
        let src = ExportFileSource::new(&path, false);

        let now = Utc.with_ymd_and_hms(2024, 5, 2, 0, 0, 0).unwrap();
        let events = src
            .ingest_usage_events(&inst, Duration::days(7), now)
            .unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, EventType::Start);
        assert_eq!(
            events[0].timestamp,
            Utc.with_ymd_and_hms(2024, 5, 1, 13, 5, 0).unwrap()
        );
        assert_eq!(events[1].event_type, EventType::End);
        assert!(events.iter().all(|e| e.instrument_pid == "titan"));
    }

    #[test]
    fn missing_and_malformed_exports_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.json");
        let inst = titan(&missing);
        let now = Utc::now();

        let err = ExportFileSource::new(&missing, false)
            .ingest_usage_events(&inst, Duration::days(1), now)
            .unwrap_err();
        assert!(matches!(err, HarvestError::Read { .. }));

        let bad = write_export(dir.path(), "{ not json");
        let err = ExportFileSource::new(&bad, false)
            .find_reservation(&inst, now, now)
            .unwrap_err();
        assert!(matches!(err, HarvestError::Malformed { .. }));
    }
}

//! Experiment records.
//!
//! A [`Record`] is the in-memory result of one session build: reservation
//! summary plus ordered acquisition activities. [`Record::to_document`]
//! renders it as the JSON document that is validated, written to the records
//! directory and uploaded.

pub mod validate;
pub mod write;

use std::path::PathBuf;

use chrono_tz::Tz;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    activity::AcquisitionActivity,
    harvest::{ReservationEvent, ReservationLookup},
    metadata::FlatMetadata,
    session::Session,
    tz,
};

pub use validate::{SchemaValidator, StructuralValidator, ValidationError};

/// Document layout version.
pub const SCHEMA_VERSION: u32 = 1;

/// Who used the instrument and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationSummary {
    /// Whether a reservation matched the session.
    pub matched: bool,
    /// Experiment title.
    pub title: String,
    /// User (reservation user, else session user).
    pub user: Option<String>,
    /// Purpose of the session.
    pub purpose: Option<String>,
    /// Project or account.
    pub project: Option<String>,
    /// External reservation id.
    pub reservation_id: Option<String>,
}

impl ReservationSummary {
    /// Summary for a session with no matching reservation.
    pub fn placeholder(session: &Session) -> Self {
        Self {
            matched: false,
            title: format!("Experiment on the {}", session.instrument_pid),
            user: session.user.clone(),
            purpose: None,
            project: None,
            reservation_id: None,
        }
    }

    /// Summary from a reservation; falls back to the placeholder title and user.
    pub fn from_event(event: &ReservationEvent, session: &Session) -> Self {
        let fallback = Self::placeholder(session);
        Self {
            matched: true,
            title: event.title.clone().unwrap_or(fallback.title),
            user: event.user.clone().or(fallback.user),
            purpose: event.purpose.clone(),
            project: event.project.clone(),
            reservation_id: event.reservation_id.clone(),
        }
    }

    /// Summary for any lookup result.
    pub fn from_lookup(lookup: &ReservationLookup, session: &Session) -> Self {
        match lookup {
            ReservationLookup::Found(ev) => Self::from_event(ev, session),
            ReservationLookup::NoMatch => Self::placeholder(session),
        }
    }
}

/// One built session.
#[derive(Debug, Clone)]
pub struct Record {
    /// The session the record describes.
    pub session: Session,
    /// Zone used for human-facing times in the document.
    pub timezone: Tz,
    /// Reservation block.
    pub summary: ReservationSummary,
    /// Activities in time order.
    pub activities: Vec<AcquisitionActivity>,
}

/// Serialized record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecordDocument {
    /// Layout version.
    pub schema_version: u32,
    /// Stable identifier, also the file stem.
    pub record_id: String,
    /// Instrument pid.
    pub instrument: String,
    /// Session block.
    pub session: SessionBlock,
    /// Reservation block.
    pub summary: ReservationSummary,
    /// Activities in time order.
    pub activities: Vec<ActivityBlock>,
}

/// Session block of a [`RecordDocument`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionBlock {
    /// Session identifier.
    pub identifier: String,
    /// Start in instrument-local time.
    pub start: String,
    /// End in instrument-local time.
    pub end: String,
    /// Session user.
    pub user: Option<String>,
}

/// Activity block of a [`RecordDocument`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActivityBlock {
    /// 1-based position.
    pub index: usize,
    /// First file time, instrument-local.
    pub start: String,
    /// Last file time, instrument-local.
    pub end: String,
    /// Shared metadata.
    pub setup_params: FlatMetadata,
    /// Member datasets.
    pub datasets: Vec<DatasetBlock>,
}

/// Dataset entry of an [`ActivityBlock`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DatasetBlock {
    /// File name.
    pub name: String,
    /// Path relative to the instrument root.
    pub location: PathBuf,
    /// Dataset type tag.
    pub dataset_type: String,
    /// Modification time, instrument-local.
    pub modified: String,
    /// Preview artifact, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview: Option<PathBuf>,
    /// Fallback metadata was used.
    pub extraction_failed: bool,
    /// Warnings collected for this file.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    /// Metadata not hoisted into the activity.
    pub unique_metadata: IndexMap<String, Value>,
}

/// Encode an identifier as a file-stem fragment.
///
/// `[A-Za-z0-9.-]` pass through; every other UTF-8 byte, `_` included, becomes
/// `~XX`. Distinct inputs give distinct outputs and the result never contains
/// `_`, so it can be joined with `_` without ambiguity.
pub fn encode_component(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        if b.is_ascii_alphanumeric() || matches!(b, b'.' | b'-') {
            out.push(char::from(b));
        } else {
            out.push_str(&format!("~{b:02X}"));
        }
    }
    out
}

impl Record {
    /// Stable identifier: `{instrument}_{identifier}`, each part encoded.
    pub fn record_id(&self) -> String {
        format!(
            "{}_{}",
            encode_component(&self.session.instrument_pid),
            encode_component(&self.session.session_identifier)
        )
    }

    /// Total datasets across activities.
    pub fn dataset_count(&self) -> usize {
        self.activities.iter().map(AcquisitionActivity::len).sum()
    }

    /// Render the document.
    pub fn to_document(&self) -> RecordDocument {
        let local = |t| tz::to_instrument_local(t, self.timezone);
        RecordDocument {
            schema_version: SCHEMA_VERSION,
            record_id: self.record_id(),
            instrument: self.session.instrument_pid.clone(),
            session: SessionBlock {
                identifier: self.session.session_identifier.clone(),
                start: local(self.session.dt_from),
                end: local(self.session.dt_to),
                user: self.session.user.clone(),
            },
            summary: self.summary.clone(),
            activities: self
                .activities
                .iter()
                .enumerate()
                .map(|(i, a)| ActivityBlock {
                    index: i + 1,
                    start: local(a.start),
                    end: local(a.end),
                    setup_params: a.setup_params.clone(),
                    datasets: a
                        .members
                        .iter()
                        .map(|m| DatasetBlock {
                            name: m
                                .dataset
                                .path
                                .file_name()
                                .map(|n| n.to_string_lossy().into_owned())
                                .unwrap_or_default(),
                            location: m.dataset.relative_path.clone(),
                            dataset_type: m.dataset.dataset_type.clone(),
                            modified: local(m.dataset.modified),
                            preview: m.dataset.preview.clone(),
                            extraction_failed: m.dataset.extraction_failed,
                            warnings: m.dataset.warnings.clone(),
                            unique_metadata: m.unique_metadata.clone(),
                        })
                        .collect(),
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn session() -> Session {
        let from = Utc.with_ymd_and_hms(2024, 1, 15, 14, 0, 0).unwrap();
        Session {
            session_identifier: "2024/01/15 #3".into(),
            instrument_pid: "FEI-Titan".into(),
            dt_from: from,
            dt_to: from + Duration::hours(2),
            user: Some("jdoe".into()),
        }
    }

    #[test]
    fn placeholder_summary_shape() {
        insta::assert_json_snapshot!(ReservationSummary::placeholder(&session()), @r#"
        {
          "matched": false,
          "title": "Experiment on the FEI-Titan",
          "user": "jdoe",
          "purpose": null,
          "project": null,
          "reservation_id": null
        }
        "#);
    }

    #[test]
    fn reservation_fields_override_placeholder() {
        let s = session();
        let ev = ReservationEvent {
            reservation_id: Some("r-9".into()),
            title: Some("Tilt series".into()),
            user: None,
            purpose: Some("grain boundaries".into()),
            project: None,
            start: s.dt_from,
            end: s.dt_to,
            consent_withheld: false,
        };
        let sum = ReservationSummary::from_lookup(&ReservationLookup::Found(ev), &s);
        assert!(sum.matched);
        assert_eq!(sum.title, "Tilt series");
        assert_eq!(sum.user.as_deref(), Some("jdoe"));
        assert_eq!(sum.reservation_id.as_deref(), Some("r-9"));
    }

    #[test]
    fn record_id_is_a_safe_file_stem() {
        let rec = Record {
            session: session(),
            timezone: chrono_tz::America::New_York,
            summary: ReservationSummary::placeholder(&session()),
            activities: Vec::new(),
        };
        assert_eq!(rec.record_id(), "FEI-Titan_2024~2F01~2F15~20~233");
        assert_eq!(encode_component("s1"), "s1");
        assert_eq!(encode_component("µ~"), "~C2~B5~7E");

        let doc = rec.to_document();
        assert_eq!(doc.session.start, "2024-01-15T09:00:00.000-05:00");
        assert_eq!(doc.session.end, "2024-01-15T11:00:00.000-05:00");
        assert!(doc.activities.is_empty());
    }

    #[test]
    fn record_ids_of_distinct_sessions_never_collide() {
        let id = |pid: &str, sid: &str| {
            let mut s = session();
            s.instrument_pid = pid.into();
            s.session_identifier = sid.into();
            Record {
                summary: ReservationSummary::placeholder(&s),
                session: s,
                timezone: chrono_tz::UTC,
                activities: Vec::new(),
            }
            .record_id()
        };
        assert_eq!(id("titan", "s1"), "titan_s1");
        assert_ne!(id("titan", "2024/05/01"), id("titan", "2024_05_01"));
        assert_ne!(id("titan_a", "s1"), id("titan", "a_s1"));
        assert_ne!(id("titan", "a~2F"), id("titan", "a/"));
        assert_eq!(id("", ".."), "_..");
    }
}

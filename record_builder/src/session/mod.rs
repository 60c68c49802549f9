//! Session log vocabulary and the record-status state machine.
//!
//! A [`Session`] is never stored; it is derived from a START / END pair of
//! `session_log` rows sharing an identifier and instrument. The only mutable
//! column of the log is `record_status`, whose transitions are governed by
//! [`RecordStatus::can_transition_to`].
//!
//! ```text
//! WAITING_FOR_END ──END row──▶ TO_BE_BUILT ──build──▶ COMPLETED | ERROR | NO_FILES_FOUND
//!                                                     | NO_CONSENT | NO_RESERVATION
//! ```

pub mod store;

use std::{fmt, str::FromStr};

use anyhow::bail;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

pub use store::{SessionStore, SqliteSessionStore, StoreError, StoreResult};

/// Kind of a `session_log` row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    /// Instrument usage began.
    Start,
    /// Instrument usage ended.
    End,
    /// Audit marker written before a build attempt.
    RecordGeneration,
}

impl EventType {
    /// Database representation.
    pub const fn as_str(self) -> &'static str {
        match self {
            EventType::Start => "START",
            EventType::End => "END",
            EventType::RecordGeneration => "RECORD_GENERATION",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "START" => EventType::Start,
            "END" => EventType::End,
            "RECORD_GENERATION" => EventType::RecordGeneration,
            _ => bail!("unknown event_type: {s}"),
        })
    }
}

/// Build status carried by every `session_log` row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordStatus {
    /// START seen, END not yet recorded.
    WaitingForEnd,
    /// Paired and eligible for a build.
    ToBeBuilt,
    /// Record built and validated.
    Completed,
    /// Build failed (extraction, validation, exhausted retries).
    Error,
    /// No files appeared within the grace window.
    NoFilesFound,
    /// The reservation withheld consent for record building.
    NoConsent,
    /// The harvester requires a reservation and none matched.
    NoReservation,
}

impl RecordStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [RecordStatus; 7] = [
        RecordStatus::WaitingForEnd,
        RecordStatus::ToBeBuilt,
        RecordStatus::Completed,
        RecordStatus::Error,
        RecordStatus::NoFilesFound,
        RecordStatus::NoConsent,
        RecordStatus::NoReservation,
    ];

    /// Database representation.
    pub const fn as_str(self) -> &'static str {
        match self {
            RecordStatus::WaitingForEnd => "WAITING_FOR_END",
            RecordStatus::ToBeBuilt => "TO_BE_BUILT",
            RecordStatus::Completed => "COMPLETED",
            RecordStatus::Error => "ERROR",
            RecordStatus::NoFilesFound => "NO_FILES_FOUND",
            RecordStatus::NoConsent => "NO_CONSENT",
            RecordStatus::NoReservation => "NO_RESERVATION",
        }
    }

    /// Terminal statuses are never reverted.
    pub const fn is_terminal(self) -> bool {
        !matches!(self, RecordStatus::WaitingForEnd | RecordStatus::ToBeBuilt)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    ///
    /// Re-asserting the current status is allowed (idempotent update).
    pub fn can_transition_to(self, next: RecordStatus) -> bool {
        use RecordStatus::*;
        if self == next {
            return true;
        }
        match self {
            WaitingForEnd => next == ToBeBuilt,
            ToBeBuilt => next.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordStatus {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RecordStatus::ALL
            .into_iter()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| anyhow::anyhow!("unknown record_status: {s}"))
    }
}

/// One instrument-usage interval bounded by a paired START / END.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Session {
    /// Identifier shared by the START / END rows.
    pub session_identifier: String,
    /// Instrument pid.
    pub instrument_pid: String,
    /// START timestamp.
    pub dt_from: DateTime<Utc>,
    /// END timestamp.
    pub dt_to: DateTime<Utc>,
    /// User recorded on the START row (falls back to the END row).
    pub user: Option<String>,
}

impl Session {
    /// Wall-clock length of the session.
    pub fn span(&self) -> Duration {
        self.dt_to - self.dt_from
    }
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.instrument_pid, self.session_identifier)
    }
}

/// A START or END observation supplied by a harvester.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageEvent {
    /// Session identifier shared by the START and END.
    pub session_identifier: String,
    /// Instrument pid.
    pub instrument_pid: String,
    /// START or END; RECORD_GENERATION is not a harvester event.
    pub event_type: EventType,
    /// Event time.
    pub timestamp: DateTime<Utc>,
    /// User, if known.
    pub user: Option<String>,
}

/// Outcome of the no-files rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileAvailability {
    /// Files exist; continue the build.
    Proceed,
    /// No files yet but still inside the grace window; leave status untouched.
    Retry,
    /// No files and the grace window has elapsed.
    NoFilesFound,
}

/// Pure decision for sessions whose file search may come back empty.
///
/// `elapsed` is the time since the session ended.
pub fn grace_decision(elapsed: Duration, grace_window: Duration, file_count: usize) -> FileAvailability {
    if file_count > 0 {
        FileAvailability::Proceed
    } else if elapsed >= grace_window {
        FileAvailability::NoFilesFound
    } else {
        FileAvailability::Retry
    }
}

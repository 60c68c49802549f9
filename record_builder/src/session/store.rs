//! Session log repository.
//!
//! [`SessionStore`] is the portable surface the record builder and the
//! harvesters talk to; [`SqliteSessionStore`] implements it on top of the
//! diesel schema in [`crate::schema`].
//!
//! ## Transactions
//! Every mutation that touches more than one row (END promotion, status
//! updates) runs inside `BEGIN IMMEDIATE` via
//! `SqliteConnection::immediate_transaction`, so a START / END pair is never
//! observable half-updated.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use tracing::{debug, warn};

use crate::{
    models::{InstrumentRow, NewSessionLogEntry, SessionLogRow},
    schema::{instruments, session_log::dsl as sl},
    session::{EventType, RecordStatus, Session, UsageEvent},
    tz,
};

/// Errors the store raises for consistency problems (as opposed to I/O or SQL failures).
///
/// Returned inside [`StoreResult`]; callers that need to branch use
/// `err.downcast_ref::<StoreError>()`.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum StoreError {
    /// The requested status change would revert or skip a state.
    #[error("session {session}: cannot move {from} -> {to}")]
    InvalidTransition {
        /// `instrument/identifier` of the session.
        session: String,
        /// Status found on the row.
        from: RecordStatus,
        /// Requested status.
        to: RecordStatus,
    },
    /// The session does not have exactly one START and one END row.
    #[error("session {session}: expected one START and one END row, found {starts} and {ends}")]
    Unpaired {
        /// `instrument/identifier` of the session.
        session: String,
        /// Number of START rows.
        starts: usize,
        /// Number of END rows.
        ends: usize,
    },
    /// Only START / END can be appended by harvesters.
    #[error("{0} is not a harvester usage event")]
    NotAUsageEvent(EventType),
}

/// Result type used throughout the store for fallible operations.
pub type StoreResult<T> = anyhow::Result<T>;

/// Whether an appended usage event created a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// A new row was written.
    Inserted,
    /// The same START/END was already recorded; nothing changed.
    Duplicate,
}

/// Persisted session log + instrument reference data.
pub trait SessionStore {
    /// All instrument rows, ordered by pid.
    fn load_instruments(&mut self) -> StoreResult<Vec<InstrumentRow>>;

    /// Harvester entry point: append a START or END row.
    ///
    /// START rows start in WAITING_FOR_END; an END row is written as TO_BE_BUILT and
    /// promotes its START in the same transaction.
    fn append_usage_event(&mut self, event: &UsageEvent) -> StoreResult<AppendOutcome>;

    /// Paired sessions whose rows are TO_BE_BUILT, ordered by start time.
    ///
    /// Unpaired or duplicated rows are excluded and logged for manual review.
    fn get_sessions_to_build(&mut self) -> StoreResult<Vec<Session>>;

    /// Append the RECORD_GENERATION audit row for `session`, timestamped `now`.
    fn insert_record_generation_event(
        &mut self,
        session: &Session,
        now: DateTime<Utc>,
    ) -> StoreResult<()>;

    /// Move both the START and END rows of `session` to `status` atomically.
    fn update_session_status(&mut self, session: &Session, status: RecordStatus)
    -> StoreResult<()>;

    /// Current status of the session's START row, if the session exists.
    fn session_status(
        &mut self,
        instrument_pid: &str,
        session_identifier: &str,
    ) -> StoreResult<Option<RecordStatus>>;
}

/// SQLite implementation of [`SessionStore`].
pub struct SqliteSessionStore {
    conn: SqliteConnection,
}

impl SqliteSessionStore {
    /// Wrap an already configured connection (see [`crate::db::connection::connect_sqlite`]).
    pub fn new(conn: SqliteConnection) -> Self {
        Self { conn }
    }

    /// Connect with the standard PRAGMAs applied.
    pub fn open(database_url: &str) -> anyhow::Result<Self> {
        Ok(Self::new(crate::db::connection::connect_sqlite(database_url)?))
    }

    /// Borrow the underlying connection (catalog sync, tests).
    pub fn connection(&mut self) -> &mut SqliteConnection {
        &mut self.conn
    }
}

fn pair_rows(
    conn: &mut SqliteConnection,
    instrument: &str,
    identifier: &str,
) -> QueryResult<Vec<SessionLogRow>> {
    sl::session_log
        .filter(sl::instrument_pid.eq(instrument))
        .filter(sl::session_identifier.eq(identifier))
        .filter(sl::event_type.eq_any([EventType::Start.as_str(), EventType::End.as_str()]))
        .order(sl::id.asc())
        .select(SessionLogRow::as_select())
        .load(conn)
}

impl SessionStore for SqliteSessionStore {
    fn load_instruments(&mut self) -> StoreResult<Vec<InstrumentRow>> {
        let rows = instruments::table
            .order(instruments::instrument_pid.asc())
            .select(InstrumentRow::as_select())
            .load(&mut self.conn)?;
        Ok(rows)
    }

    fn append_usage_event(&mut self, event: &UsageEvent) -> StoreResult<AppendOutcome> {
        if event.event_type == EventType::RecordGeneration {
            return Err(StoreError::NotAUsageEvent(event.event_type).into());
        }
        let ts = tz::to_rfc3339_millis(event.timestamp);

        self.conn.immediate_transaction::<_, anyhow::Error, _>(|conn| {
            let existing = pair_rows(conn, &event.instrument_pid, &event.session_identifier)?;
            if existing
                .iter()
                .any(|r| r.event_type == event.event_type.as_str())
            {
                debug!(
                    instrument = %event.instrument_pid,
                    session = %event.session_identifier,
                    event_type = %event.event_type,
                    "usage event already recorded"
                );
                return Ok(AppendOutcome::Duplicate);
            }

            let status = match event.event_type {
                EventType::Start
                    if existing.iter().any(|r| r.event_type == EventType::End.as_str()) =>
                {
                    // END arrived first; the pair is complete now.
                    RecordStatus::ToBeBuilt
                }
                EventType::Start => RecordStatus::WaitingForEnd,
                _ => {
                    let start = existing
                        .iter()
                        .find(|r| r.event_type == EventType::Start.as_str());
                    match start {
                        Some(start) => {
                            diesel::update(sl::session_log.find(start.id))
                                .filter(sl::record_status.eq(RecordStatus::WaitingForEnd.as_str()))
                                .set(sl::record_status.eq(RecordStatus::ToBeBuilt.as_str()))
                                .execute(conn)?;
                        }
                        None => warn!(
                            instrument = %event.instrument_pid,
                            session = %event.session_identifier,
                            "END recorded without a START; session needs manual review"
                        ),
                    }
                    RecordStatus::ToBeBuilt
                }
            };

            diesel::insert_into(sl::session_log)
                .values(NewSessionLogEntry {
                    session_identifier: &event.session_identifier,
                    instrument_pid: &event.instrument_pid,
                    timestamp: &ts,
                    event_type: event.event_type.as_str(),
                    record_status: status.as_str(),
                    user: event.user.as_deref(),
                })
                .execute(conn)?;
            Ok(AppendOutcome::Inserted)
        })
    }

    fn get_sessions_to_build(&mut self) -> StoreResult<Vec<Session>> {
        let rows: Vec<SessionLogRow> = sl::session_log
            .filter(sl::record_status.eq(RecordStatus::ToBeBuilt.as_str()))
            .filter(sl::event_type.eq_any([EventType::Start.as_str(), EventType::End.as_str()]))
            .order(sl::id.asc())
            .select(SessionLogRow::as_select())
            .load(&mut self.conn)?;

        let mut groups: BTreeMap<(String, String), Vec<SessionLogRow>> = BTreeMap::new();
        for row in rows {
            groups
                .entry((row.instrument_pid.clone(), row.session_identifier.clone()))
                .or_default()
                .push(row);
        }

        let mut sessions = Vec::with_capacity(groups.len());
        for ((instrument, identifier), rows) in groups {
            let starts: Vec<&SessionLogRow> = rows
                .iter()
                .filter(|r| r.event_type == EventType::Start.as_str())
                .collect();
            let ends: Vec<&SessionLogRow> = rows
                .iter()
                .filter(|r| r.event_type == EventType::End.as_str())
                .collect();

            let (start, end) = match (starts.as_slice(), ends.as_slice()) {
                ([start], [end]) => (*start, *end),
                _ => {
                    warn!(
                        instrument = %instrument,
                        session = %identifier,
                        starts = starts.len(),
                        ends = ends.len(),
                        "unpaired session rows; skipping for manual review"
                    );
                    continue;
                }
            };

            let dt_from = tz::parse_ts_to_utc(&start.timestamp)?;
            let dt_to = tz::parse_ts_to_utc(&end.timestamp)?;
            if dt_to < dt_from {
                warn!(
                    instrument = %instrument,
                    session = %identifier,
                    "END precedes START; skipping for manual review"
                );
                continue;
            }

            sessions.push(Session {
                session_identifier: identifier,
                instrument_pid: instrument,
                dt_from,
                dt_to,
                user: start.user.clone().or_else(|| end.user.clone()),
            });
        }

        sessions.sort_by(|a, b| {
            (a.dt_from, &a.instrument_pid, &a.session_identifier).cmp(&(
                b.dt_from,
                &b.instrument_pid,
                &b.session_identifier,
            ))
        });
        Ok(sessions)
    }

    fn insert_record_generation_event(
        &mut self,
        session: &Session,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        let ts = tz::to_rfc3339_millis(now);
        diesel::insert_into(sl::session_log)
            .values(NewSessionLogEntry {
                session_identifier: &session.session_identifier,
                instrument_pid: &session.instrument_pid,
                timestamp: &ts,
                event_type: EventType::RecordGeneration.as_str(),
                record_status: RecordStatus::ToBeBuilt.as_str(),
                user: None,
            })
            .execute(&mut self.conn)?;
        Ok(())
    }

    fn update_session_status(
        &mut self,
        session: &Session,
        status: RecordStatus,
    ) -> StoreResult<()> {
        self.conn.immediate_transaction::<_, anyhow::Error, _>(|conn| {
            let rows = pair_rows(conn, &session.instrument_pid, &session.session_identifier)?;
            let starts = rows
                .iter()
                .filter(|r| r.event_type == EventType::Start.as_str())
                .count();
            let ends = rows.len() - starts;
            if starts != 1 || ends != 1 {
                return Err(StoreError::Unpaired {
                    session: session.to_string(),
                    starts,
                    ends,
                }
                .into());
            }

            for row in &rows {
                let current: RecordStatus = row.record_status.parse()?;
                if !current.can_transition_to(status) {
                    return Err(StoreError::InvalidTransition {
                        session: session.to_string(),
                        from: current,
                        to: status,
                    }
                    .into());
                }
            }

            let ids: Vec<i32> = rows.iter().map(|r| r.id).collect();
            diesel::update(sl::session_log.filter(sl::id.eq_any(ids)))
                .set(sl::record_status.eq(status.as_str()))
                .execute(conn)?;
            Ok(())
        })
    }

    fn session_status(
        &mut self,
        instrument_pid: &str,
        session_identifier: &str,
    ) -> StoreResult<Option<RecordStatus>> {
        let status: Option<String> = sl::session_log
            .filter(sl::instrument_pid.eq(instrument_pid))
            .filter(sl::session_identifier.eq(session_identifier))
            .filter(sl::event_type.eq(EventType::Start.as_str()))
            .select(sl::record_status)
            .first(&mut self.conn)
            .optional()?;
        status.map(|s| s.parse::<RecordStatus>()).transpose()
    }
}

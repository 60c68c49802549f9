//! Diesel models mapping to the database schema.
//!
//! These types mirror the tables defined in the embedded migrations and in
//! [`crate::schema`]:
//! - [`crate::schema::instruments`] — instrument reference data (synced from the catalog)
//! - [`crate::schema::session_log`] — append-only START / END / RECORD_GENERATION rows
//!
//! Timestamps are RFC-3339 UTC text with millisecond precision (see
//! [`crate::tz::to_rfc3339_millis`]); statuses and event types are stored as
//! their SCREAMING_SNAKE names and guarded by CHECK constraints.

use diesel::prelude::*;

use crate::schema::*;

/// A row in [`crate::schema::instruments`].
#[derive(Debug, Clone, Queryable, Identifiable, Selectable)]
#[diesel(table_name = instruments, check_for_backend(diesel::sqlite::Sqlite))]
#[diesel(primary_key(instrument_pid))]
pub struct InstrumentRow {
    /// Unique instrument identifier (primary key), normalized lowercase.
    pub instrument_pid: String,
    /// Path of the instrument's file store, relative to the configured data root.
    pub filestore_path: String,
    /// IANA time zone name of the instrument's location (e.g., "America/New_York").
    pub timezone: String,
    /// Reservation harvester variant serving this instrument (e.g., "none", "export_file").
    pub harvester_type: String,
    /// Harvester-specific endpoint (URL or file path), if the variant needs one.
    pub harvester_endpoint: Option<String>,
    /// Whether a session without a matching reservation is terminal (NO_RESERVATION).
    pub require_reservation: bool,
}

/// Insertable/changeset form of [`InstrumentRow`] used by the catalog sync.
#[derive(Debug, Clone, Insertable, AsChangeset)]
#[diesel(table_name = instruments, primary_key(instrument_pid), treat_none_as_null = true)]
pub struct NewInstrument<'a> {
    /// Instrument identifier (primary key).
    pub instrument_pid: &'a str,
    /// File store path relative to the data root.
    pub filestore_path: &'a str,
    /// IANA time zone name.
    pub timezone: &'a str,
    /// Harvester variant code.
    pub harvester_type: &'a str,
    /// Optional harvester endpoint; `None` clears a previously stored endpoint.
    pub harvester_endpoint: Option<&'a str>,
    /// Reservation requirement flag.
    pub require_reservation: bool,
}

/// A row in [`crate::schema::session_log`].
#[derive(Debug, Clone, Queryable, Identifiable, Selectable)]
#[diesel(table_name = session_log, check_for_backend(diesel::sqlite::Sqlite))]
pub struct SessionLogRow {
    /// Database primary key. Populated by the DB.
    pub id: i32,
    /// Identifier shared by the START and END rows of one session.
    pub session_identifier: String,
    /// FK to [`InstrumentRow::instrument_pid`].
    pub instrument_pid: String,
    /// Event time in RFC-3339 UTC.
    pub timestamp: String,
    /// "START" | "END" | "RECORD_GENERATION".
    pub event_type: String,
    /// Current record status of the row (see [`crate::session::RecordStatus`]).
    pub record_status: String,
    /// User recorded by the harvester, if any.
    pub user: Option<String>,
}

/// Insertable form of [`SessionLogRow`].
#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = session_log)]
pub struct NewSessionLogEntry<'a> {
    /// Session identifier.
    pub session_identifier: &'a str,
    /// FK to [`InstrumentRow::instrument_pid`].
    pub instrument_pid: &'a str,
    /// Event time in RFC-3339 UTC.
    pub timestamp: &'a str,
    /// Event type name.
    pub event_type: &'a str,
    /// Initial record status name.
    pub record_status: &'a str,
    /// Optional user.
    pub user: Option<&'a str>,
}

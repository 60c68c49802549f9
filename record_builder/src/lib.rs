//! Session record builder.
//!
//! Detects completed instrument-usage sessions in a persisted session log,
//! finds the files each session produced, groups them into acquisition
//! activities, and publishes one validated experiment record per session.
//!
//! - [`session`]: the session log, its state machine and the SQLite store
//! - [`instruments`]: the instrument catalog and the immutable registry
//! - [`harvest`]: reservation sources and usage-event ingestion
//! - [`files`], [`extract`], [`metadata`]: file discovery and per-file metadata
//! - [`activity`]: clustering and setup-parameter assembly
//! - [`record`]: document rendering, validation and output
//! - [`builder`]: the per-session orchestrator
//! - [`runner`]: lock, build and upload for one scheduled run

#![deny(missing_docs)]

pub mod activity;
pub mod builder;
pub mod config;
pub mod db;
pub mod extract;
pub mod files;
pub mod harvest;
pub mod instruments;
pub mod lock;
pub mod metadata;
pub mod models;
pub mod record;
pub mod retry;
pub mod runner;
#[allow(missing_docs)]
pub mod schema;
pub mod session;
pub mod tz;
pub mod upload;

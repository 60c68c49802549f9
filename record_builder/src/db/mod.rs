//! Database utilities for connections and schema migrations.
//!
//! This module provides:
//! - [`connection::connect_sqlite`], which applies WAL, foreign_keys=ON, and a 5000ms busy_timeout.
//! - Embedded Diesel migrations and runners: [`migrate::run_sqlite`] and [`migrate::run_all`]
//!   (the latter accepts `sqlite:`-prefixed URLs as well as bare paths).
//!
//! Example:
//! ```no_run
//! use record_builder::db::{connection, migrate};
//!
//! let db_path = std::env::temp_dir().join("record_builder_example.db");
//! migrate::run_all(db_path.to_str().unwrap()).expect("migrations");
//! let _conn = connection::connect_sqlite(db_path.to_str().unwrap()).expect("connect");
//! ```

pub mod connection;
pub mod migrate;

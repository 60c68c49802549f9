//! Embedded schema migrations.

use anyhow::anyhow;
use diesel::{Connection, SqliteConnection, connection::SimpleConnection};
use diesel_migrations::{EmbeddedMigrations, MigrationHarness, embed_migrations};

/// Embedded Diesel migrations bundled with this crate.
///
/// These are applied by [`run_sqlite`] to bring the database schema up to date.
pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

/// Runs pending Diesel migrations on a SQLite database at the given URL.
///
/// Sets the journal mode to WAL and applies all embedded migrations. Returns the
/// number of migrations that were applied by this call.
pub fn run_sqlite(url: &str) -> anyhow::Result<usize> {
    let mut conn = SqliteConnection::establish(url)?;
    conn.batch_execute("PRAGMA journal_mode=WAL;")?;
    let applied = conn
        .run_pending_migrations(MIGRATIONS)
        .map_err(|e| anyhow!(e))?;

    Ok(applied.len())
}

/// Runs pending migrations for the given database URL.
///
/// Accepts bare file paths, `sqlite:` / `sqlite://` prefixed paths and `:memory:`;
/// any other URL scheme is rejected.
pub fn run_all(database_url: &str) -> anyhow::Result<usize> {
    run_sqlite(&sqlite_path(database_url)?)
}

/// Strips an optional `sqlite:` / `sqlite://` scheme so diesel receives a plain path.
pub fn sqlite_path(database_url: &str) -> anyhow::Result<String> {
    let path = database_url
        .strip_prefix("sqlite://")
        .or_else(|| database_url.strip_prefix("sqlite:"))
        .unwrap_or(database_url);
    if path.contains("://") {
        anyhow::bail!("Unsupported database_url: {database_url}");
    }
    Ok(path.to_string())
}

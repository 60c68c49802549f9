//! Builder settings: one TOML file read once at startup.
//!
//! ```toml
//! database_url = "sqlite:///var/lib/record-builder/sessions.db"
//! data_root = "/mnt/instruments"
//! records_dir = "/srv/records"
//! metadata_dir = "/srv/records/metadata"
//! lock_file = "/run/record-builder.lock"
//! file_strategy = "exclusive"
//! ignore_patterns = ["*.mib", "**/tmp/**"]
//! grace_window_hours = 48
//! ingest_lookback_hours = 72
//! upload_dir = "/srv/cdcs/inbox"
//!
//! [retry]
//! max_attempts = 3
//! base_delay_ms = 500
//! ```
//!
//! The path comes from `--config` or `RECORD_BUILDER_CONFIG`.

use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use chrono::Duration;
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;

/// Environment variable naming the settings file.
pub const CONFIG_ENV: &str = "RECORD_BUILDER_CONFIG";

/// Which files under an instrument root count as session output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStrategy {
    /// Only files with a registered format-specific extractor.
    #[default]
    Exclusive,
    /// Every file; unknown formats get the basic extractor.
    Inclusive,
}

/// Parsed settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    /// SQLite URL or path of the session store.
    pub database_url: String,
    /// Directory instrument `filestore_path`s are relative to.
    pub data_root: PathBuf,
    /// Where record documents are written.
    pub records_dir: PathBuf,
    /// Root of the dataset sidecar tree.
    pub metadata_dir: PathBuf,
    /// Lock artifact guarding against concurrent batches.
    pub lock_file: PathBuf,
    /// File inclusion strategy.
    #[serde(default)]
    pub file_strategy: FileStrategy,
    /// Globs matched against file names and root-relative paths.
    #[serde(default)]
    pub ignore_patterns: Vec<String>,
    /// Hours to wait for files after a session ends.
    #[serde(default = "default_grace_hours")]
    pub grace_window_hours: u32,
    /// How far back harvesters look for usage events.
    #[serde(default = "default_lookback_hours")]
    pub ingest_lookback_hours: u32,
    /// Harvester and upload retry policy.
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Destination of the directory uploader; no upload when unset.
    #[serde(default)]
    pub upload_dir: Option<PathBuf>,
}

fn default_grace_hours() -> u32 {
    48
}

fn default_lookback_hours() -> u32 {
    72
}

/// What [`normalize_settings`] changed.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SettingsReport {
    /// Blank ignore patterns removed.
    pub blank_patterns: usize,
    /// Repeated ignore patterns removed.
    pub duplicate_patterns: usize,
}

impl Settings {
    /// Grace window as a duration.
    pub fn grace_window(&self) -> Duration {
        Duration::hours(i64::from(self.grace_window_hours))
    }

    /// Ingestion lookback as a duration.
    pub fn ingest_lookback(&self) -> Duration {
        Duration::hours(i64::from(self.ingest_lookback_hours))
    }

    /// Compiled ignore globs.
    pub fn ignore_set(&self) -> anyhow::Result<GlobSet> {
        compile_globs(&self.ignore_patterns)
    }
}

/// Compile glob patterns into one matcher.
pub fn compile_globs(patterns: &[String]) -> anyhow::Result<GlobSet> {
    let mut b = GlobSetBuilder::new();
    for p in patterns {
        b.add(Glob::new(p).with_context(|| format!("bad ignore pattern {p:?}"))?);
    }
    Ok(b.build()?)
}

/// Trim and deduplicate ignore patterns, check they compile, and reject empty paths.
pub fn normalize_settings(s: &mut Settings) -> anyhow::Result<SettingsReport> {
    let mut report = SettingsReport::default();

    s.database_url = s.database_url.trim().to_string();
    if s.database_url.is_empty() {
        bail!("database_url cannot be empty");
    }
    for (name, p) in [
        ("data_root", &s.data_root),
        ("records_dir", &s.records_dir),
        ("metadata_dir", &s.metadata_dir),
        ("lock_file", &s.lock_file),
    ] {
        if p.as_os_str().is_empty() {
            bail!("{name} cannot be empty");
        }
    }

    let mut kept: Vec<String> = Vec::with_capacity(s.ignore_patterns.len());
    for raw in std::mem::take(&mut s.ignore_patterns) {
        let p = raw.trim().to_string();
        if p.is_empty() {
            report.blank_patterns += 1;
        } else if kept.contains(&p) {
            report.duplicate_patterns += 1;
        } else {
            kept.push(p);
        }
    }
    s.ignore_patterns = kept;
    compile_globs(&s.ignore_patterns)?;
    Ok(report)
}

/// Parse and normalize settings from TOML text.
pub fn load_settings_str(toml_str: &str) -> anyhow::Result<Settings> {
    let mut s: Settings = toml::from_str(toml_str).context("failed to parse settings TOML")?;
    let report = normalize_settings(&mut s)?;
    tracing::debug!(?report, "settings normalized");
    Ok(s)
}

/// Read settings from `path`.
pub fn load_settings_path(path: impl AsRef<Path>) -> anyhow::Result<Settings> {
    let text = std::fs::read_to_string(path.as_ref())
        .with_context(|| format!("read settings {}", path.as_ref().display()))?;
    load_settings_str(&text).with_context(|| format!("settings {}", path.as_ref().display()))
}

/// Resolve the settings path from an explicit argument or [`CONFIG_ENV`].
pub fn resolve_settings_path(explicit: Option<&Path>) -> anyhow::Result<PathBuf> {
    if let Some(p) = explicit {
        return Ok(p.to_path_buf());
    }
    Ok(PathBuf::from(shared_utils::env::get_env_var(CONFIG_ENV)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        database_url = " sqlite://sessions.db "
        data_root = "/data"
        records_dir = "/out/records"
        metadata_dir = "/out/meta"
        lock_file = "/run/rb.lock"
    "#;

    #[test]
    fn defaults_fill_in() {
        let s = load_settings_str(MINIMAL).unwrap();
        assert_eq!(s.database_url, "sqlite://sessions.db");
        assert_eq!(s.file_strategy, FileStrategy::Exclusive);
        assert_eq!(s.grace_window(), Duration::hours(48));
        assert_eq!(s.ingest_lookback(), Duration::hours(72));
        assert_eq!(s.retry, RetryPolicy::default());
        assert!(s.upload_dir.is_none());
    }

    #[test]
    fn patterns_are_trimmed_and_deduplicated() {
        let text = format!(
            "{MINIMAL}\nfile_strategy = \"inclusive\"\nignore_patterns = [\" *.tmp \", \"*.tmp\", \"\", \"**/cache/**\"]\n[retry]\nmax_attempts = 5\n"
        );
        let mut s: Settings = toml::from_str(&text).unwrap();
        let report = normalize_settings(&mut s).unwrap();
        assert_eq!(
            report,
            SettingsReport {
                blank_patterns: 1,
                duplicate_patterns: 1,
            }
        );
        assert_eq!(s.ignore_patterns, vec!["*.tmp", "**/cache/**"]);
        assert_eq!(s.file_strategy, FileStrategy::Inclusive);
        assert_eq!(s.retry.max_attempts, 5);
        assert_eq!(s.retry.base_delay_ms, 500);
        assert!(s.ignore_set().unwrap().is_match("scan.tmp"));
    }

    #[test]
    fn invalid_settings_are_rejected() {
        assert!(load_settings_str(&format!("{MINIMAL}\ncolour = 1\n")).is_err());
        assert!(load_settings_str(&format!("{MINIMAL}\nignore_patterns = [\"a[\"]\n")).is_err());
        assert!(load_settings_str(&MINIMAL.replace("sqlite://sessions.db", "  ")).is_err());
    }

    #[test]
    fn explicit_path_wins_over_env() {
        let p = resolve_settings_path(Some(Path::new("/etc/rb.toml"))).unwrap();
        assert_eq!(p, PathBuf::from("/etc/rb.toml"));
    }
}

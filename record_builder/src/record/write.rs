//! Writing documents and dataset sidecars.
//!
//! Names are stable (record id, mirrored source path), so a rebuilt session
//! overwrites its previous output instead of adding to it. Files are written
//! to a temporary sibling and renamed into place.

use std::{
    ffi::OsString,
    path::{Path, PathBuf},
};

use anyhow::Context;
use serde::Serialize;

use super::{Record, RecordDocument};
use crate::extract::Dataset;

/// Subdirectory of the records directory receiving documents that failed validation.
pub const ERROR_SUBDIR: &str = "error";

/// Serialize `value` as pretty JSON to `path`, creating parent directories.
pub fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let mut tmp_name = path.file_name().map(OsString::from).unwrap_or_default();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);
    let bytes = serde_json::to_vec_pretty(value)?;
    std::fs::write(&tmp, bytes).with_context(|| format!("write {}", tmp.display()))?;
    std::fs::rename(&tmp, path).with_context(|| format!("rename into {}", path.display()))?;
    Ok(())
}

/// Path of the published document for `doc`.
pub fn record_path(records_dir: &Path, doc: &RecordDocument) -> PathBuf {
    records_dir.join(format!("{}.json", doc.record_id))
}

/// Write a validated document; returns its path.
pub fn write_record(records_dir: &Path, doc: &RecordDocument) -> anyhow::Result<PathBuf> {
    let path = record_path(records_dir, doc);
    write_json(&path, doc)?;
    Ok(path)
}

/// Keep a document that failed validation for inspection; returns its path.
pub fn write_error_record(records_dir: &Path, doc: &RecordDocument) -> anyhow::Result<PathBuf> {
    let path = record_path(&records_dir.join(ERROR_SUBDIR), doc);
    write_json(&path, doc)?;
    Ok(path)
}

/// Sidecar location mirroring `dataset.path` below `metadata_dir`.
///
/// Paths outside `data_root` fall back to the instrument-relative path.
pub fn sidecar_path(metadata_dir: &Path, data_root: &Path, dataset: &Dataset) -> PathBuf {
    let rel = dataset
        .path
        .strip_prefix(data_root)
        .unwrap_or(&dataset.relative_path);
    let mut name = rel.as_os_str().to_os_string();
    name.push(".json");
    metadata_dir.join(PathBuf::from(name))
}

/// Write one sidecar per dataset of `record`; returns how many were written.
pub fn write_sidecars(metadata_dir: &Path, data_root: &Path, record: &Record) -> anyhow::Result<usize> {
    let mut n = 0;
    for activity in &record.activities {
        for member in &activity.members {
            let path = sidecar_path(metadata_dir, data_root, &member.dataset);
            write_json(&path, &member.dataset)?;
            n += 1;
        }
    }
    Ok(n)
}

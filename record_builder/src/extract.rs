//! Per-file metadata extraction.
//!
//! Format-specific readers plug in through [`Extractor`] and are looked up by
//! file extension in an [`ExtractorRegistry`]. Files without a registered
//! extractor (inclusive strategy), and files whose extractor fails, fall back
//! to [`BasicFileExtractor`] so one bad file never sinks a record.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::warn;

use crate::{
    files::FileStamp,
    metadata::{self, FlatMetadata},
    tz,
};

/// Dataset type used when an extractor cannot tell.
pub const UNKNOWN_DATASET_TYPE: &str = "Unknown";

/// What an extractor returns for one file.
#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    /// Nested metadata object.
    pub metadata: Value,
    /// Dataset type tag (e.g. "Image", "Spectrum").
    pub dataset_type: String,
    /// Optional preview artifact produced alongside.
    pub preview: Option<PathBuf>,
    /// Non-fatal problems noticed while reading.
    pub warnings: Vec<String>,
}

/// Extraction failures.
#[derive(thiserror::Error, Debug)]
pub enum ExtractionError {
    /// The file could not be read.
    #[error("read {path}: {source}")]
    Io {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// The file was read but its content is not understood.
    #[error("parse {path}: {reason}")]
    Parse {
        /// File path.
        path: PathBuf,
        /// Parser message.
        reason: String,
    },
}

/// A metadata reader for one family of file formats.
pub trait Extractor {
    /// Short name used in logs and warnings.
    fn name(&self) -> &str;

    /// Read metadata from `path`.
    fn extract(&self, path: &Path) -> Result<Extraction, ExtractionError>;
}

/// Generic facts any file has: name, extension, size.
#[derive(Debug, Clone, Copy, Default)]
pub struct BasicFileExtractor;

impl Extractor for BasicFileExtractor {
    fn name(&self) -> &str {
        "basic"
    }

    fn extract(&self, path: &Path) -> Result<Extraction, ExtractionError> {
        let meta = std::fs::metadata(path).map_err(|source| ExtractionError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let ext = path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        Ok(Extraction {
            metadata: json!({
                "File": {
                    "Name": name,
                    "Extension": ext,
                    "Size (bytes)": meta.len(),
                }
            }),
            dataset_type: UNKNOWN_DATASET_TYPE.to_string(),
            preview: None,
            warnings: Vec::new(),
        })
    }
}

/// Reads instrument-written JSON documents; the object itself is the metadata.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonDocumentExtractor;

impl Extractor for JsonDocumentExtractor {
    fn name(&self) -> &str {
        "json"
    }

    fn extract(&self, path: &Path) -> Result<Extraction, ExtractionError> {
        let bytes = std::fs::read(path).map_err(|source| ExtractionError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let value: Value = serde_json::from_slice(&bytes).map_err(|e| ExtractionError::Parse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        if !value.is_object() {
            return Err(ExtractionError::Parse {
                path: path.to_path_buf(),
                reason: "top level is not an object".into(),
            });
        }
        let dataset_type = value
            .get("DatasetType")
            .and_then(Value::as_str)
            .unwrap_or(UNKNOWN_DATASET_TYPE)
            .to_string();
        Ok(Extraction {
            metadata: value,
            dataset_type,
            preview: None,
            warnings: Vec::new(),
        })
    }
}

/// One extracted file, ready for assembly.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Dataset {
    /// Absolute path of the source file.
    pub path: PathBuf,
    /// Path relative to the instrument root.
    pub relative_path: PathBuf,
    /// Modification time.
    pub modified: DateTime<Utc>,
    /// Flattened metadata including the reserved per-file keys.
    pub metadata: FlatMetadata,
    /// Dataset type tag.
    pub dataset_type: String,
    /// Optional preview artifact.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview: Option<PathBuf>,
    /// Extraction and flattening warnings.
    pub warnings: Vec<String>,
    /// True when the format-specific extractor failed and fallback metadata was used.
    pub extraction_failed: bool,
}

/// Extension-keyed extractor lookup with the basic fallback.
pub struct ExtractorRegistry {
    by_ext: HashMap<String, Box<dyn Extractor>>,
    fallback: BasicFileExtractor,
}

impl Default for ExtractorRegistry {
    fn default() -> Self {
        let mut r = Self::empty();
        r.register("json", Box::new(JsonDocumentExtractor));
        r
    }
}

impl ExtractorRegistry {
    /// Registry with only the fallback.
    pub fn empty() -> Self {
        Self {
            by_ext: HashMap::new(),
            fallback: BasicFileExtractor,
        }
    }

    /// Register `extractor` for a case-insensitive extension (without the dot).
    pub fn register(&mut self, ext: &str, extractor: Box<dyn Extractor>) {
        self.by_ext
            .insert(ext.trim_start_matches('.').to_lowercase(), extractor);
    }

    /// Format-specific extractor for `path`, if one is registered.
    pub fn for_path(&self, path: &Path) -> Option<&dyn Extractor> {
        let ext = path.extension()?.to_string_lossy().to_lowercase();
        self.by_ext.get(&ext).map(|b| b.as_ref())
    }

    /// Whether `path` has a format-specific extractor.
    pub fn has_extractor(&self, path: &Path) -> bool {
        self.for_path(path).is_some()
    }

    /// Extract `file` into a [`Dataset`]; never fails.
    pub fn extract_dataset(&self, file: &FileStamp, root: &Path) -> Dataset {
        let chosen: &dyn Extractor = self.for_path(&file.path).unwrap_or(&self.fallback);
        let (extraction, failed) = match chosen.extract(&file.path) {
            Ok(x) => (x, false),
            Err(err) => {
                warn!(
                    file = %file.path.display(),
                    extractor = chosen.name(),
                    error = %err,
                    "extraction failed; using fallback metadata"
                );
                let mut x = self.fallback.extract(&file.path).unwrap_or_else(|_| Extraction {
                    metadata: json!({}),
                    dataset_type: UNKNOWN_DATASET_TYPE.to_string(),
                    preview: None,
                    warnings: Vec::new(),
                });
                x.warnings
                    .push(format!("{} extractor failed: {err}", chosen.name()));
                (x, true)
            }
        };

        let flat = metadata::flatten(&extraction.metadata);
        let mut warnings = extraction.warnings;
        warnings.extend(flat.collision_warnings());
        let mut map = flat.map;
        map.retain(|k, _| !metadata::is_reserved(k));
        map.insert(
            "DatasetType".into(),
            Value::String(extraction.dataset_type.clone()),
        );
        map.insert(
            "Creation Time".into(),
            Value::String(tz::to_rfc3339_millis(file.modified)),
        );
        if !warnings.is_empty() {
            map.insert("Extractor Warnings".into(), json!(warnings));
        }

        Dataset {
            relative_path: file
                .path
                .strip_prefix(root)
                .unwrap_or(&file.path)
                .to_path_buf(),
            path: file.path.clone(),
            modified: file.modified,
            metadata: map,
            dataset_type: extraction.dataset_type,
            preview: extraction.preview,
            warnings,
            extraction_failed: failed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn stamp(path: PathBuf) -> FileStamp {
        FileStamp {
            path,
            modified: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        }
    }

    #[test]
    fn registered_extractor_is_used() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("scan.JSON");
        std::fs::write(&p, r#"{"DatasetType": "Image", "Optics": {"Mag": 1000}}"#).unwrap();

        let reg = ExtractorRegistry::default();
        assert!(reg.has_extractor(&p));
        let ds = reg.extract_dataset(&stamp(p), dir.path());
        assert!(!ds.extraction_failed);
        assert_eq!(ds.dataset_type, "Image");
        assert_eq!(ds.relative_path, PathBuf::from("scan.JSON"));
        assert_eq!(ds.metadata["Optics <> Mag"], json!(1000));
        assert_eq!(ds.metadata["Creation Time"], json!("2024-05-01T12:00:00.000Z"));
        assert!(!ds.metadata.contains_key("Extractor Warnings"));
    }

    #[test]
    fn reserved_keys_come_only_from_the_extraction() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("tagged.json");
        std::fs::write(
            &p,
            r#"{"Extractor Warnings": ["stale"], "Creation Time": "1999", "Gun": {"kV": 300}}"#,
        )
        .unwrap();

        let ds = ExtractorRegistry::default().extract_dataset(&stamp(p), dir.path());
        assert!(ds.warnings.is_empty());
        assert!(!ds.metadata.contains_key("Extractor Warnings"));
        assert_eq!(ds.metadata["Creation Time"], json!("2024-05-01T12:00:00.000Z"));
        assert_eq!(ds.metadata["Gun <> kV"], json!(300));
    }

    #[test]
    fn failed_extraction_falls_back_with_warning() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("broken.json");
        std::fs::write(&p, "{ nope").unwrap();

        let ds = ExtractorRegistry::default().extract_dataset(&stamp(p), dir.path());
        assert!(ds.extraction_failed);
        assert_eq!(ds.dataset_type, UNKNOWN_DATASET_TYPE);
        assert_eq!(ds.metadata["File <> Name"], json!("broken.json"));
        assert_eq!(ds.warnings.len(), 1);
        assert!(ds.warnings[0].starts_with("json extractor failed"));
        assert!(ds.metadata.contains_key("Extractor Warnings"));
    }

    #[test]
    fn unknown_extension_uses_basic_facts() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("frame.dm4");
        std::fs::write(&p, [0u8; 16]).unwrap();

        let reg = ExtractorRegistry::default();
        assert!(!reg.has_extractor(&p));
        let ds = reg.extract_dataset(&stamp(p), dir.path());
        assert!(!ds.extraction_failed);
        assert_eq!(ds.metadata["File <> Size (bytes)"], json!(16));
        assert_eq!(ds.metadata["File <> Extension"], json!("dm4"));
    }
}

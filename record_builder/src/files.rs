//! Candidate file discovery under an instrument root.

use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use globset::GlobSet;
use serde::Serialize;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::{config::FileStrategy, extract::ExtractorRegistry, tz};

/// A file identity with its modification time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileStamp {
    /// Absolute path.
    pub path: PathBuf,
    /// Modification time.
    pub modified: DateTime<Utc>,
}

/// Walks instrument roots and applies the inclusion rules.
pub struct FileFinder<'a> {
    strategy: FileStrategy,
    ignore: &'a GlobSet,
    extractors: &'a ExtractorRegistry,
}

impl<'a> FileFinder<'a> {
    /// Finder for one batch.
    pub fn new(strategy: FileStrategy, ignore: &'a GlobSet, extractors: &'a ExtractorRegistry) -> Self {
        Self {
            strategy,
            ignore,
            extractors,
        }
    }

    fn ignored(&self, root: &Path, path: &Path) -> bool {
        let name_hit = path
            .file_name()
            .is_some_and(|n| self.ignore.is_match(Path::new(n)));
        let rel_hit = path
            .strip_prefix(root)
            .is_ok_and(|rel| self.ignore.is_match(rel));
        name_hit || rel_hit
    }

    /// Files under `root` modified within `[from, to]`, sorted by (mtime, path).
    ///
    /// A missing root is an error; unreadable entries below it are skipped with a warning.
    pub fn find(
        &self,
        root: &Path,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> anyhow::Result<Vec<FileStamp>> {
        let meta = std::fs::metadata(root)
            .with_context(|| format!("instrument root {}", root.display()))?;
        if !meta.is_dir() {
            anyhow::bail!("instrument root {} is not a directory", root.display());
        }

        let mut out = Vec::new();
        for entry in WalkDir::new(root).follow_links(false) {
            let entry = match entry {
                Ok(e) => e,
                Err(err) => {
                    warn!(root = %root.display(), error = %err, "skipping unreadable entry");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            if self.ignored(root, path) {
                continue;
            }
            if self.strategy == FileStrategy::Exclusive && !self.extractors.has_extractor(path) {
                continue;
            }
            let modified = match entry.metadata().map_err(anyhow::Error::from).and_then(|m| {
                m.modified().map_err(anyhow::Error::from)
            }) {
                Ok(t) => tz::system_time_to_utc(t),
                Err(err) => {
                    warn!(file = %path.display(), error = %err, "no modification time; skipping");
                    continue;
                }
            };
            if modified < from || modified > to {
                continue;
            }
            out.push(FileStamp {
                path: path.to_path_buf(),
                modified,
            });
        }
        out.sort_by(|a, b| (a.modified, &a.path).cmp(&(b.modified, &b.path)));
        debug!(root = %root.display(), found = out.len(), "file search done");
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::compile_globs;
    use chrono::Duration;
    use std::{fs::File, time::SystemTime};

    fn touch(path: &Path, at: DateTime<Utc>) {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, b"{}").unwrap();
        let f = File::options().write(true).open(path).unwrap();
        f.set_modified(SystemTime::from(at)).unwrap();
    }

    #[test]
    fn window_strategy_and_ignores() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let t0 = Utc::now() - Duration::days(1);

        touch(&root.join("a/one.json"), t0 + Duration::seconds(10));
        touch(&root.join("a/two.dat"), t0 + Duration::seconds(20));
        touch(&root.join("tmp/skip.json"), t0 + Duration::seconds(30));
        touch(&root.join("late.json"), t0 + Duration::hours(5));
        touch(&root.join("edge.json"), t0 + Duration::hours(1));

        let ignore = compile_globs(&["tmp/**".to_string()]).unwrap();
        let reg = ExtractorRegistry::default();
        let to = t0 + Duration::hours(1);

        let exclusive = FileFinder::new(FileStrategy::Exclusive, &ignore, &reg)
            .find(root, t0, to)
            .unwrap();
        let names: Vec<_> = exclusive
            .iter()
            .map(|f| f.path.strip_prefix(root).unwrap().to_path_buf())
            .collect();
        assert_eq!(names, [PathBuf::from("a/one.json"), PathBuf::from("edge.json")]);

        let inclusive = FileFinder::new(FileStrategy::Inclusive, &ignore, &reg)
            .find(root, t0, to)
            .unwrap();
        assert_eq!(inclusive.len(), 3);
    }

    #[test]
    fn ignore_matches_bare_file_names() {
        let dir = tempfile::tempdir().unwrap();
        let t = Utc::now();
        touch(&dir.path().join("deep/er/thumb.json"), t);
        let ignore = compile_globs(&["thumb.json".to_string()]).unwrap();
        let reg = ExtractorRegistry::default();
        let found = FileFinder::new(FileStrategy::Inclusive, &ignore, &reg)
            .find(dir.path(), t - Duration::minutes(1), t + Duration::minutes(1))
            .unwrap();
        assert!(found.is_empty());
    }

    #[test]
    fn missing_root_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let ignore = GlobSet::empty();
        let reg = ExtractorRegistry::default();
        let t = Utc::now();
        assert!(
            FileFinder::new(FileStrategy::Inclusive, &ignore, &reg)
                .find(&dir.path().join("nope"), t, t)
                .is_err()
        );
    }
}

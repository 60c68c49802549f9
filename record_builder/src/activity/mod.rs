//! Acquisition activities.
//!
//! - [`cluster`]: splits a session's files into temporally coherent groups.
//! - [`assemble`]: separates what a group's files share (setup parameters)
//!   from what is unique to each file.

pub mod assemble;
pub mod cluster;

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{extract::ExtractorRegistry, files::FileStamp, metadata::FlatMetadata};

pub use assemble::{ActivityMember, assemble};
pub use cluster::{ClusterConfig, cluster_files};

/// A contiguous, non-overlapping group of a session's datasets.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AcquisitionActivity {
    /// Earliest member modification time.
    pub start: DateTime<Utc>,
    /// Latest member modification time.
    pub end: DateTime<Utc>,
    /// Metadata shared by every member.
    pub setup_params: FlatMetadata,
    /// Members in time order.
    pub members: Vec<ActivityMember>,
}

impl AcquisitionActivity {
    /// Number of member datasets.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// True if the activity has no members.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Members whose format-specific extraction failed.
    pub fn failed_extractions(&self) -> usize {
        self.members
            .iter()
            .filter(|m| m.dataset.extraction_failed)
            .count()
    }
}

/// Extract every file of every group and assemble the activities in order.
pub fn build_activities(
    groups: Vec<Vec<FileStamp>>,
    extractors: &ExtractorRegistry,
    root: &Path,
) -> Vec<AcquisitionActivity> {
    groups
        .into_iter()
        .filter_map(|group| {
            let datasets = group
                .iter()
                .map(|f| extractors.extract_dataset(f, root))
                .collect();
            assemble(datasets)
        })
        .collect()
}

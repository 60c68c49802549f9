//! Setup-parameter hoisting for one activity.

use serde::Serialize;

use crate::{
    extract::Dataset,
    metadata::{FlatMetadata, is_reserved},
};

use super::AcquisitionActivity;

/// One dataset of an activity with the metadata left after hoisting.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActivityMember {
    /// The extracted dataset (full metadata kept for the sidecar).
    pub dataset: Dataset,
    /// Keys not hoisted into the activity's setup parameters.
    pub unique_metadata: FlatMetadata,
}

/// Keys present in every dataset with an identical value, excluding reserved keys.
///
/// Order follows the first dataset.
pub fn common_setup(datasets: &[Dataset]) -> FlatMetadata {
    let Some((first, rest)) = datasets.split_first() else {
        return FlatMetadata::new();
    };
    first
        .metadata
        .iter()
        .filter(|(k, _)| !is_reserved(k))
        .filter(|(k, v)| rest.iter().all(|d| d.metadata.get(*k) == Some(*v)))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Build an activity from its datasets; `None` for an empty group.
pub fn assemble(datasets: Vec<Dataset>) -> Option<AcquisitionActivity> {
    let start = datasets.iter().map(|d| d.modified).min()?;
    let end = datasets.iter().map(|d| d.modified).max()?;
    let setup_params = common_setup(&datasets);
    let members = datasets
        .into_iter()
        .map(|dataset| {
            let unique_metadata = dataset
                .metadata
                .iter()
                .filter(|(k, _)| !setup_params.contains_key(*k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            ActivityMember {
                dataset,
                unique_metadata,
            }
        })
        .collect();
    Some(AcquisitionActivity {
        start,
        end,
        setup_params,
        members,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use proptest::prelude::*;
    use serde_json::{Value, json};
    use std::path::PathBuf;

    fn dataset(i: usize, metadata: FlatMetadata) -> Dataset {
        let modified = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap() + Duration::seconds(i as i64);
        Dataset {
            path: PathBuf::from(format!("/data/f{i}.json")),
            relative_path: PathBuf::from(format!("f{i}.json")),
            modified,
            metadata,
            dataset_type: "Image".into(),
            preview: None,
            warnings: Vec::new(),
            extraction_failed: false,
        }
    }

    fn meta(pairs: &[(&str, Value)]) -> FlatMetadata {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn hoists_only_identical_values() {
        let a = meta(&[
            ("Voltage", json!(300)),
            ("Mag", json!(1000)),
            ("DatasetType", json!("Image")),
        ]);
        let b = meta(&[
            ("Voltage", json!(300)),
            ("Mag", json!(2000)),
            ("DatasetType", json!("Image")),
        ]);
        let act = assemble(vec![dataset(0, a), dataset(1, b)]).unwrap();
        assert_eq!(act.setup_params, meta(&[("Voltage", json!(300))]));
        assert_eq!(
            act.members[0].unique_metadata,
            meta(&[("Mag", json!(1000)), ("DatasetType", json!("Image"))])
        );
        assert_eq!(act.end - act.start, Duration::seconds(1));
    }

    #[test]
    fn key_missing_from_one_member_stays_unique() {
        let a = meta(&[("Detector", json!("Ceta")), ("Voltage", json!(300))]);
        let b = meta(&[("Voltage", json!(300))]);
        let act = assemble(vec![dataset(0, a), dataset(1, b)]).unwrap();
        assert_eq!(act.setup_params, meta(&[("Voltage", json!(300))]));
        assert_eq!(act.members[0].unique_metadata, meta(&[("Detector", json!("Ceta"))]));
        assert!(act.members[1].unique_metadata.is_empty());
    }

    #[test]
    fn singleton_hoists_everything_but_reserved() {
        let a = meta(&[
            ("Voltage", json!(300)),
            ("Creation Time", json!("2024-05-01T12:00:00.000Z")),
            ("Extractor Warnings", json!(["w"])),
        ]);
        let act = assemble(vec![dataset(0, a)]).unwrap();
        assert_eq!(act.setup_params, meta(&[("Voltage", json!(300))]));
        assert_eq!(act.members[0].unique_metadata.len(), 2);
    }

    #[test]
    fn empty_group_has_no_activity() {
        assert!(assemble(Vec::new()).is_none());
    }

    fn arb_meta() -> impl Strategy<Value = FlatMetadata> {
        let key = prop::sample::select(vec!["A", "B", "C", "D", "DatasetType", "Creation Time"]);
        let val = (0i64..3).prop_map(Value::from);
        prop::collection::vec((key, val), 0..6).prop_map(|pairs| {
            pairs
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect()
        })
    }

    proptest! {
        #[test]
        fn setup_and_unique_reproduce_each_file(metas in prop::collection::vec(arb_meta(), 1..6)) {
            let datasets: Vec<Dataset> = metas
                .iter()
                .cloned()
                .enumerate()
                .map(|(i, m)| dataset(i, m))
                .collect();
            let act = assemble(datasets).unwrap();

            prop_assert!(act.setup_params.keys().all(|k| !is_reserved(k)));
            for (member, original) in act.members.iter().zip(&metas) {
                let mut merged = act.setup_params.clone();
                merged.extend(member.unique_metadata.clone());
                prop_assert_eq!(&merged, original);
                prop_assert!(member.unique_metadata.keys().all(|k| !act.setup_params.contains_key(k)));
            }
            for (k, v) in &act.setup_params {
                prop_assert!(metas.iter().all(|m| m.get(k) == Some(v)));
            }
        }
    }
}

//! Record document validation.

use serde_json::Value;

use crate::tz;

/// A document failed validation.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("record failed validation: {}", details.join("; "))]
pub struct ValidationError {
    /// One entry per problem, with a JSON-pointer-like location.
    pub details: Vec<String>,
}

/// Checks a serialized record before it is published.
pub trait SchemaValidator {
    /// `Ok(())` if the document is publishable.
    fn validate(&self, document: &Value) -> Result<(), ValidationError>;
}

/// Structural checks over the document produced by [`super::Record::to_document`].
#[derive(Debug, Clone, Copy, Default)]
pub struct StructuralValidator;

fn require_str<'a>(v: &'a Value, key: &str, at: &str, errs: &mut Vec<String>) -> Option<&'a str> {
    match v.get(key).and_then(Value::as_str) {
        Some(s) if !s.trim().is_empty() => Some(s),
        _ => {
            errs.push(format!("{at}/{key}: missing or empty string"));
            None
        }
    }
}

fn require_time(
    v: &Value,
    key: &str,
    at: &str,
    errs: &mut Vec<String>,
) -> Option<chrono::DateTime<chrono::Utc>> {
    let s = require_str(v, key, at, errs)?;
    match tz::parse_ts_to_utc(s) {
        Ok(t) => Some(t),
        Err(_) => {
            errs.push(format!("{at}/{key}: not an RFC-3339 timestamp"));
            None
        }
    }
}

impl SchemaValidator for StructuralValidator {
    fn validate(&self, doc: &Value) -> Result<(), ValidationError> {
        let mut errs = Vec::new();
        if !doc.is_object() {
            return Err(ValidationError {
                details: vec!["/: document is not an object".into()],
            });
        }
        if doc.get("schema_version").and_then(Value::as_u64) != Some(u64::from(super::SCHEMA_VERSION)) {
            errs.push("/schema_version: unsupported".into());
        }
        require_str(doc, "record_id", "", &mut errs);
        require_str(doc, "instrument", "", &mut errs);

        match doc.get("session") {
            Some(s) if s.is_object() => {
                require_str(s, "identifier", "/session", &mut errs);
                let start = require_time(s, "start", "/session", &mut errs);
                let end = require_time(s, "end", "/session", &mut errs);
                if let (Some(a), Some(b)) = (start, end) {
                    if b < a {
                        errs.push("/session: end precedes start".into());
                    }
                }
            }
            _ => errs.push("/session: missing".into()),
        }

        match doc.get("summary") {
            Some(s) if s.is_object() => {
                require_str(s, "title", "/summary", &mut errs);
            }
            _ => errs.push("/summary: missing".into()),
        }

        let activities: &[Value] = match doc.get("activities").and_then(Value::as_array) {
            Some(a) if !a.is_empty() => a.as_slice(),
            _ => {
                errs.push("/activities: missing or empty".into());
                &[]
            }
        };
        let mut prev_end = None;
        for (i, act) in activities.iter().enumerate() {
            let at = format!("/activities/{i}");
            let start = require_time(act, "start", &at, &mut errs);
            let end = require_time(act, "end", &at, &mut errs);
            if let (Some(s), Some(e)) = (start, end) {
                if e < s {
                    errs.push(format!("{at}: end precedes start"));
                }
                if prev_end.is_some_and(|p| s < p) {
                    errs.push(format!("{at}: overlaps the previous activity"));
                }
                prev_end = Some(e);
            }
            if !act.get("setup_params").is_some_and(Value::is_object) {
                errs.push(format!("{at}/setup_params: not an object"));
            }
            match act.get("datasets").and_then(Value::as_array) {
                Some(ds) if !ds.is_empty() => {
                    for (j, d) in ds.iter().enumerate() {
                        let at = format!("{at}/datasets/{j}");
                        require_str(d, "name", &at, &mut errs);
                        require_str(d, "location", &at, &mut errs);
                        require_str(d, "dataset_type", &at, &mut errs);
                        require_time(d, "modified", &at, &mut errs);
                        if !d.get("unique_metadata").is_some_and(Value::is_object) {
                            errs.push(format!("{at}/unique_metadata: not an object"));
                        }
                    }
                }
                _ => errs.push(format!("{at}/datasets: missing or empty")),
            }
        }

        if errs.is_empty() {
            Ok(())
        } else {
            Err(ValidationError { details: errs })
        }
    }
}

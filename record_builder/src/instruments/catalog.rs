//! Instrument catalog configuration: parsing, normalization, and loading.
//!
//! The catalog is a TOML file describing every instrument the builder knows:
//! - the instrument pid (table key)
//! - where its files live, relative to the configured data root
//! - the IANA time zone of the instrument's location
//! - which reservation harvester serves it, and its endpoint
//!
//! ```toml
//! [instruments.FEI-Titan-TEM]
//! filestore_path = "Titan_TEM"
//! timezone = "America/New_York"
//! harvester = "export_file"
//! harvester_endpoint = "/srv/reservations/titan.json"
//! require_reservation = true
//! ```
//!
//! Normalization trims pids and paths, lowercases harvester codes, checks the
//! time zone and harvester exist, and rejects pids that collide after trimming.
//! The normalized shape seeds [`crate::schema::instruments`] through
//! [`crate::instruments::sync`].

use anyhow::{Context, bail};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::{harvest::HarvesterKind, tz};

/// Top-level catalog mapping instrument pids to their configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct InstrumentCatalog {
    /// Map of instrument pid -> configuration, in file order.
    pub instruments: IndexMap<String, InstrumentCfg>,
}

/// Configuration payload for one instrument.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct InstrumentCfg {
    /// File store directory relative to the data root (e.g., "Titan_TEM").
    pub filestore_path: String,
    /// IANA time zone (e.g., "America/New_York").
    pub timezone: String,
    /// Harvester code (see [`HarvesterKind`]); defaults to "none".
    #[serde(default = "default_harvester")]
    pub harvester: String,
    /// Harvester endpoint (URL or export file path).
    pub harvester_endpoint: Option<String>,
    /// Sessions without a matching reservation become NO_RESERVATION.
    #[serde(default)]
    pub require_reservation: bool,
}

fn default_harvester() -> String {
    HarvesterKind::None.as_str().to_string()
}

/// Summary of changes performed during normalization.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct NormalizationReport {
    /// Number of pids that changed when trimming.
    pub pids_trimmed: usize,
    /// Number of file store paths whose surrounding slashes/whitespace were stripped.
    pub paths_trimmed: usize,
    /// Number of blank endpoints dropped.
    pub endpoints_cleared: usize,
}

/// Normalize a catalog in-place.
///
/// What normalization does:
/// - Trim pids; reject empty pids, pids with inner whitespace, and duplicates after trimming
/// - Trim file store paths (including surrounding `/`); reject empty paths
/// - Validate the time zone name
/// - Lowercase the harvester code and check it is a known [`HarvesterKind`]
/// - Drop blank endpoints; require one for harvesters that need it
pub fn normalize_catalog(cat: &mut InstrumentCatalog) -> anyhow::Result<NormalizationReport> {
    let mut report = NormalizationReport::default();
    let mut rebuilt: IndexMap<String, InstrumentCfg> = IndexMap::new();

    for (raw_pid, mut cfg) in std::mem::take(&mut cat.instruments) {
        let pid = raw_pid.trim().to_string();
        if pid.is_empty() {
            bail!("instrument pid cannot be empty after trimming");
        }
        if pid.chars().any(char::is_whitespace) {
            bail!("instrument pid '{pid}' contains whitespace");
        }
        if pid != raw_pid {
            report.pids_trimmed += 1;
        }
        if rebuilt.contains_key(&pid) {
            bail!("duplicate instrument pid after normalization: {pid}");
        }

        let path = cfg
            .filestore_path
            .trim()
            .trim_matches('/')
            .to_string();
        if path.is_empty() {
            bail!("instrument {pid}: filestore_path cannot be empty");
        }
        if path != cfg.filestore_path {
            report.paths_trimmed += 1;
        }
        cfg.filestore_path = path;

        cfg.timezone = cfg.timezone.trim().to_string();
        tz::parse_tz(&cfg.timezone).with_context(|| format!("instrument {pid}"))?;

        cfg.harvester = cfg.harvester.trim().to_lowercase();
        let kind: HarvesterKind = cfg
            .harvester
            .parse()
            .with_context(|| format!("instrument {pid}"))?;

        cfg.harvester_endpoint = match cfg.harvester_endpoint.take() {
            Some(ep) if ep.trim().is_empty() => {
                report.endpoints_cleared += 1;
                None
            }
            Some(ep) => Some(ep.trim().to_string()),
            None => None,
        };
        if kind.needs_endpoint() && cfg.harvester_endpoint.is_none() {
            bail!("instrument {pid}: harvester '{kind}' requires harvester_endpoint");
        }

        rebuilt.insert(pid, cfg);
    }

    cat.instruments = rebuilt;
    Ok(report)
}

/// Parse and normalize a catalog from a TOML string.
pub fn load_catalog_str(toml_str: &str) -> anyhow::Result<InstrumentCatalog> {
    let mut cat: InstrumentCatalog =
        toml::from_str(toml_str).context("failed to parse instrument catalog TOML")?;
    let report = normalize_catalog(&mut cat).context("normalize_catalog failed")?;
    tracing::debug!(?report, "instrument catalog normalized");
    Ok(cat)
}

/// Read a catalog TOML file from disk, parse, and normalize it.
pub fn load_catalog_path(path: impl AsRef<std::path::Path>) -> anyhow::Result<InstrumentCatalog> {
    let text = std::fs::read_to_string(path.as_ref())
        .with_context(|| format!("read instrument catalog {}", path.as_ref().display()))?;
    load_catalog_str(&text)
}

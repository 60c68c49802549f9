//! Record-building orchestrator.
//!
//! For each pending session, in order:
//! 1. append the RECORD_GENERATION audit row
//! 2. resolve the reservation (bounded retry); consent withheld or a required
//!    reservation missing end the session immediately
//! 3. find the session's files under the instrument root
//! 4. no files: the grace rule decides between waiting and NO_FILES_FOUND
//! 5. cluster files into activities, extract each file, assemble setup parameters
//! 6. render, validate and write the document and sidecars
//! 7. record the resulting status
//!
//! A failing session never stops the batch. Only store failures propagate;
//! consistency errors from the store (unpaired rows, refused transitions)
//! are logged and the session is skipped.

use std::{collections::BTreeMap, path::PathBuf};

use anyhow::Context;
use chrono::{DateTime, Duration, Utc};
use globset::GlobSet;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::{
    activity::{ClusterConfig, build_activities, cluster_files},
    config::{FileStrategy, Settings},
    extract::ExtractorRegistry,
    files::FileFinder,
    harvest::{self, HarvestError, ReservationLookup, ReservationSource},
    instruments::{Instrument, InstrumentRegistry},
    record::{
        Record, ReservationSummary, SchemaValidator, StructuralValidator,
        write::{write_error_record, write_record, write_sidecars},
    },
    retry::RetryPolicy,
    session::{FileAvailability, RecordStatus, Session, SessionStore, StoreError, grace_decision},
};

/// Source of "now".
pub trait Clock {
    /// Current instant.
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock frozen at one instant.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// Everything a batch needs from the settings.
#[derive(Debug, Clone)]
pub struct BuildOptions {
    /// Directory instrument roots are relative to.
    pub data_root: PathBuf,
    /// Where documents go.
    pub records_dir: PathBuf,
    /// Sidecar tree root.
    pub metadata_dir: PathBuf,
    /// File inclusion strategy.
    pub file_strategy: FileStrategy,
    /// Compiled ignore globs.
    pub ignore: GlobSet,
    /// Grace window after session end.
    pub grace_window: Duration,
    /// Harvester retry policy.
    pub retry: RetryPolicy,
    /// Clusterer tuning.
    pub cluster: ClusterConfig,
}

impl BuildOptions {
    /// Options from parsed settings.
    pub fn from_settings(s: &Settings) -> anyhow::Result<Self> {
        Ok(Self {
            data_root: s.data_root.clone(),
            records_dir: s.records_dir.clone(),
            metadata_dir: s.metadata_dir.clone(),
            file_strategy: s.file_strategy,
            ignore: s.ignore_set()?,
            grace_window: s.grace_window(),
            retry: s.retry,
            cluster: ClusterConfig::default(),
        })
    }
}

/// What happened to one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SessionOutcome {
    /// Record written and validated.
    Completed {
        /// Document path.
        record: PathBuf,
        /// Number of activities.
        activities: usize,
        /// Number of datasets.
        datasets: usize,
    },
    /// Document failed validation; partial copy kept.
    Invalid {
        /// Path of the partial document.
        record: PathBuf,
        /// Validator findings.
        details: Vec<String>,
    },
    /// The build failed before a document existed.
    Failed {
        /// Error chain.
        reason: String,
    },
    /// No files yet, still inside the grace window; status unchanged.
    AwaitingFiles,
    /// No files and the grace window elapsed.
    NoFilesFound,
    /// The reservation withheld consent.
    NoConsent,
    /// A reservation is required and none matched.
    NoReservation,
    /// The store refused the status change; left for manual review.
    Skipped {
        /// Store message.
        reason: String,
    },
}

impl SessionOutcome {
    /// Status to record, `None` when the session stays as it is.
    pub fn status(&self) -> Option<RecordStatus> {
        match self {
            SessionOutcome::Completed { .. } => Some(RecordStatus::Completed),
            SessionOutcome::Invalid { .. } | SessionOutcome::Failed { .. } => {
                Some(RecordStatus::Error)
            }
            SessionOutcome::NoFilesFound => Some(RecordStatus::NoFilesFound),
            SessionOutcome::NoConsent => Some(RecordStatus::NoConsent),
            SessionOutcome::NoReservation => Some(RecordStatus::NoReservation),
            SessionOutcome::AwaitingFiles | SessionOutcome::Skipped { .. } => None,
        }
    }

    /// Short label for logs and tallies.
    pub fn label(&self) -> &'static str {
        match self {
            SessionOutcome::Completed { .. } => "completed",
            SessionOutcome::Invalid { .. } => "invalid",
            SessionOutcome::Failed { .. } => "failed",
            SessionOutcome::AwaitingFiles => "awaiting_files",
            SessionOutcome::NoFilesFound => "no_files_found",
            SessionOutcome::NoConsent => "no_consent",
            SessionOutcome::NoReservation => "no_reservation",
            SessionOutcome::Skipped { .. } => "skipped",
        }
    }
}

/// Result of one batch.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchReport {
    /// Every session attempted, in build order.
    pub sessions: Vec<(Session, SessionOutcome)>,
}

impl BatchReport {
    /// Documents written for sessions now COMPLETED.
    pub fn completed_documents(&self) -> Vec<PathBuf> {
        self.sessions
            .iter()
            .filter_map(|(_, o)| match o {
                SessionOutcome::Completed { record, .. } => Some(record.clone()),
                _ => None,
            })
            .collect()
    }

    /// Sessions per outcome label.
    pub fn tally(&self) -> BTreeMap<&'static str, usize> {
        let mut t = BTreeMap::new();
        for (_, o) in &self.sessions {
            *t.entry(o.label()).or_insert(0) += 1;
        }
        t
    }
}

type SourceFactory = Box<dyn Fn(&Instrument) -> Result<Box<dyn ReservationSource>, HarvestError>>;

/// Builds records for pending sessions.
pub struct RecordBuilder<'a> {
    registry: &'a InstrumentRegistry,
    opts: BuildOptions,
    extractors: ExtractorRegistry,
    validator: Box<dyn SchemaValidator>,
    clock: Box<dyn Clock>,
    sources: SourceFactory,
}

impl<'a> RecordBuilder<'a> {
    /// Builder with the default extractors, structural validator, wall clock
    /// and each instrument's configured harvester.
    pub fn new(registry: &'a InstrumentRegistry, opts: BuildOptions) -> Self {
        Self {
            registry,
            opts,
            extractors: ExtractorRegistry::default(),
            validator: Box::new(StructuralValidator),
            clock: Box::new(SystemClock),
            sources: Box::new(harvest::build_source),
        }
    }

    /// Replace the clock.
    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    /// Replace the validator.
    pub fn with_validator(mut self, validator: impl SchemaValidator + 'static) -> Self {
        self.validator = Box::new(validator);
        self
    }

    /// Replace the extractor registry.
    pub fn with_extractors(mut self, extractors: ExtractorRegistry) -> Self {
        self.extractors = extractors;
        self
    }

    /// Replace how reservation sources are chosen per instrument.
    pub fn with_source_factory(
        mut self,
        f: impl Fn(&Instrument) -> Result<Box<dyn ReservationSource>, HarvestError> + 'static,
    ) -> Self {
        self.sources = Box::new(f);
        self
    }

    /// Build every pending session.
    pub fn build_pending(&self, store: &mut dyn SessionStore) -> anyhow::Result<BatchReport> {
        let pending = store
            .get_sessions_to_build()
            .context("load pending sessions")?;
        info!(pending = pending.len(), "starting record build batch");

        let mut report = BatchReport::default();
        for session in pending {
            let outcome = self.build_session(store, &session)?;
            report.sessions.push((session, outcome));
        }
        info!(tally = ?report.tally(), "record build batch finished");
        Ok(report)
    }

    /// Build one session and record its status.
    pub fn build_session(
        &self,
        store: &mut dyn SessionStore,
        session: &Session,
    ) -> anyhow::Result<SessionOutcome> {
        let now = self.clock.now();
        store
            .insert_record_generation_event(session, now)
            .with_context(|| format!("record generation row for {session}"))?;

        let outcome = match self.produce(session, now) {
            Ok(o) => o,
            Err(err) => {
                warn!(session = %session, error = %format!("{err:#}"), "record build failed");
                SessionOutcome::Failed {
                    reason: format!("{err:#}"),
                }
            }
        };

        if let Some(status) = outcome.status() {
            if let Err(err) = store.update_session_status(session, status) {
                return match err.downcast_ref::<StoreError>() {
                    Some(consistency) => {
                        warn!(
                            session = %session,
                            error = %consistency,
                            "status update refused; skipping for manual review"
                        );
                        Ok(SessionOutcome::Skipped {
                            reason: consistency.to_string(),
                        })
                    }
                    None => Err(err.context(format!("update status of {session}"))),
                };
            }
        }
        info!(
            session = %session,
            outcome = outcome.label(),
            status = ?outcome.status(),
            "session processed"
        );
        Ok(outcome)
    }

    fn produce(&self, session: &Session, now: DateTime<Utc>) -> anyhow::Result<SessionOutcome> {
        let instrument = self
            .registry
            .get(&session.instrument_pid)
            .with_context(|| format!("unknown instrument {}", session.instrument_pid))?;

        let source = (self.sources)(instrument)?;
        let lookup = self.opts.retry.run("find_reservation", || {
            source.find_reservation(instrument, session.dt_from, session.dt_to)
        })?;
        match &lookup {
            ReservationLookup::Found(ev) if ev.consent_withheld => {
                info!(session = %session, reservation = ?ev.reservation_id, "consent withheld");
                return Ok(SessionOutcome::NoConsent);
            }
            ReservationLookup::NoMatch if source.requires_reservation() => {
                info!(session = %session, "no reservation matched and one is required");
                return Ok(SessionOutcome::NoReservation);
            }
            _ => {}
        }

        let root = instrument.root(&self.opts.data_root);
        let files = FileFinder::new(self.opts.file_strategy, &self.opts.ignore, &self.extractors)
            .find(&root, session.dt_from, session.dt_to)?;

        match grace_decision(now - session.dt_to, self.opts.grace_window, files.len()) {
            FileAvailability::Proceed => {}
            FileAvailability::Retry => {
                debug!(session = %session, "no files yet; inside grace window");
                return Ok(SessionOutcome::AwaitingFiles);
            }
            FileAvailability::NoFilesFound => return Ok(SessionOutcome::NoFilesFound),
        }

        let groups = cluster_files(files, session.span(), &self.opts.cluster);
        let activities = build_activities(groups, &self.extractors, &root);
        let record = Record {
            session: session.clone(),
            timezone: instrument.timezone,
            summary: ReservationSummary::from_lookup(&lookup, session),
            activities,
        };
        let failed = record
            .activities
            .iter()
            .map(|a| a.failed_extractions())
            .sum::<usize>();
        if failed > 0 {
            warn!(session = %session, files = failed, "some files used fallback metadata");
        }

        let doc = record.to_document();
        let value = serde_json::to_value(&doc)?;
        if let Err(invalid) = self.validator.validate(&value) {
            let path = write_error_record(&self.opts.records_dir, &doc)?;
            warn!(session = %session, path = %path.display(), error = %invalid, "record failed validation");
            return Ok(SessionOutcome::Invalid {
                record: path,
                details: invalid.details,
            });
        }

        // a published document implies its sidecars exist
        let sidecars = write_sidecars(&self.opts.metadata_dir, &self.opts.data_root, &record)?;
        debug!(session = %session, sidecars, "sidecars written");
        let path = write_record(&self.opts.records_dir, &doc)?;
        Ok(SessionOutcome::Completed {
            record: path,
            activities: record.activities.len(),
            datasets: record.dataset_count(),
        })
    }
}

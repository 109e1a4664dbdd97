//! Job driver
//!
//! Runs one job invocation end to end: enumerate work units, filter the ones
//! the ledger already knows, fetch, transform, deliver, and claim according to
//! the job's [`ClaimPolicy`].
//!
//! ```text
//! Idle -> Enumerating -> PerUnit -> Done
//! ```
//!
//! With [`ClaimPolicy::AfterDelivery`] a unit is claimed only after its rows
//! were delivered, so a crash between delivery and claim re-delivers the unit
//! on the next run (at-least-once). A unit that fetched zero records is
//! claimed as well, except when it is the last unit of the enumeration: the
//! newest folder or window may still be filling up and is left for the next
//! run.
//!
//! A job that [`tracks_sources`](IngestJob::tracks_sources) enumerates source
//! objects instead of units. Sources already marked in the ledger are not
//! read again; the rest are expanded into units, and a source is marked once
//! every unit it held was delivered or found already claimed.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use std::borrow::Cow;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::fetcher::SourceError;
use super::ledger::{ClaimOutcome, DedupLedger, LedgerError};
use super::schema::TableSchema;
use super::sink::{deliver, deliver_dimension, BatchSink, DeliveryOutcome};
use super::transform::{TransformContext, Transformer};
use super::types::{RawRecord, WorkUnit};

/// Ledger key of a source object, kept apart from unit keys
pub fn source_mark(source: &str) -> String {
    format!("source:{source}")
}

/// When the ledger mark is written relative to delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimPolicy {
    /// Claim after a successful delivery (at-least-once)
    AfterDelivery,
    /// Claim before delivery, skipping anything already claimed (at-most-once)
    BeforeDelivery,
    /// No ledger; the warehouse upsert or promotion is idempotent
    Untracked,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Bulk append into staging, then promote
    Staged,
    /// Keyed upsert per row
    Upsert { key_columns: Vec<String> },
}

impl DeliveryMode {
    pub fn upsert_on(columns: &[&str]) -> Self {
        DeliveryMode::Upsert {
            key_columns: columns.iter().map(|c| c.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPhase {
    Idle,
    Enumerating,
    PerUnit,
    Done,
}

/// One ingestion job
#[async_trait]
pub trait IngestJob: Send + Sync {
    /// Stable job name; also the ledger namespace
    fn name(&self) -> &str;

    fn claim_policy(&self) -> ClaimPolicy {
        ClaimPolicy::AfterDelivery
    }

    /// Load every claimed key once instead of asking per unit
    fn prefilter_claimed(&self) -> bool {
        false
    }

    fn delivery(&self) -> DeliveryMode {
        DeliveryMode::Staged
    }

    /// Row contract for a batch of raw records
    fn schema_for<'a>(&'a self, records: &[RawRecord]) -> Cow<'a, TableSchema>;

    async fn enumerate(&self, now: DateTime<Utc>) -> Result<Vec<WorkUnit>, SourceError>;

    /// Enumeration lists source objects that [`expand`](Self::expand) turns into units
    fn tracks_sources(&self) -> bool {
        false
    }

    /// Work units held by one enumerated source object
    async fn expand(&self, source: &WorkUnit) -> Result<Vec<WorkUnit>, SourceError> {
        Ok(vec![source.clone()])
    }

    /// Raw records of one unit; defaults to the payload produced by enumeration
    async fn fetch(&self, unit: &WorkUnit) -> Result<Vec<RawRecord>, SourceError> {
        Ok(unit.payload.iter().cloned().collect())
    }
}

#[derive(Error, Debug)]
pub enum DriverError {
    #[error("Job {job} could not enumerate work units: {source}")]
    Enumerate { job: String, source: SourceError },

    #[error("Work unit {unit} failed permanently: {source}")]
    Source { unit: String, source: SourceError },

    #[error("Ledger unavailable: {0}")]
    Ledger(#[from] LedgerError),
}

/// Outcome counters of one run
#[derive(Debug, Clone, Serialize)]
pub struct JobSummary {
    pub job: String,
    pub run_id: Uuid,
    pub sources_total: usize,
    pub sources_skipped: usize,
    pub units_total: usize,
    pub units_skipped: usize,
    pub units_delivered: usize,
    pub units_deferred: usize,
    pub units_failed: usize,
    pub records_fetched: usize,
    pub rows_delivered: u64,
    pub records_dropped: usize,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_secs: f64,
}

impl JobSummary {
    fn new(job: &str, run_id: Uuid, started_at: DateTime<Utc>) -> Self {
        Self {
            job: job.to_string(),
            run_id,
            sources_total: 0,
            sources_skipped: 0,
            units_total: 0,
            units_skipped: 0,
            units_delivered: 0,
            units_deferred: 0,
            units_failed: 0,
            records_fetched: 0,
            rows_delivered: 0,
            records_dropped: 0,
            started_at,
            completed_at: None,
            duration_secs: 0.0,
        }
    }

    pub fn is_success(&self) -> bool {
        self.units_failed == 0
    }
}

/// Runs jobs against one ledger and one sink
pub struct JobDriver {
    ledger: Arc<dyn DedupLedger>,
    sink: Arc<dyn BatchSink>,
    timezone: Tz,
    phase: JobPhase,
}

impl JobDriver {
    pub fn new(ledger: Arc<dyn DedupLedger>, sink: Arc<dyn BatchSink>, timezone: Tz) -> Self {
        Self {
            ledger,
            sink,
            timezone,
            phase: JobPhase::Idle,
        }
    }

    pub fn phase(&self) -> JobPhase {
        self.phase
    }

    pub async fn run(&mut self, job: &dyn IngestJob) -> Result<JobSummary, DriverError> {
        self.run_at(job, Utc::now()).await
    }

    /// Run with an explicit clock; `now` anchors windows and `ingested_at`
    pub async fn run_at(&mut self, job: &dyn IngestJob, now: DateTime<Utc>) -> Result<JobSummary, DriverError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("job", job = %job.name(), run_id = %run_id);
        self.run_inner(job, now, run_id).instrument(span).await
    }

    async fn run_inner(
        &mut self,
        job: &dyn IngestJob,
        now: DateTime<Utc>,
        run_id: Uuid,
    ) -> Result<JobSummary, DriverError> {
        let clock = std::time::Instant::now();
        let mut summary = JobSummary::new(job.name(), run_id, now);
        if job.name() != self.ledger.namespace() && job.claim_policy() != ClaimPolicy::Untracked {
            warn!(ledger = %self.ledger.namespace(), "Ledger namespace differs from job name");
        }

        self.set_phase(JobPhase::Enumerating);
        let mut units = job.enumerate(now).await.map_err(|source| {
            self.phase = JobPhase::Done;
            DriverError::Enumerate {
                job: job.name().to_string(),
                source,
            }
        })?;
        let mut sources = Vec::new();
        if job.tracks_sources() {
            summary.sources_total = units.len();
            (units, sources) = match self.expand_sources(job, units, &mut summary).await {
                Ok(expanded) => expanded,
                Err(e) => {
                    self.phase = JobPhase::Done;
                    return Err(e);
                },
            };
        } else {
            summary.units_total = units.len();
        }
        info!(units = units.len(), policy = ?job.claim_policy(), "Enumerated work units");

        self.set_phase(JobPhase::PerUnit);
        let ctx = TransformContext::new(self.timezone, now);
        let result = match job.claim_policy() {
            ClaimPolicy::AfterDelivery => self.claim_after_delivery(job, &units, &ctx, &mut summary).await,
            ClaimPolicy::BeforeDelivery => {
                self.claim_before_delivery(job, &units, &sources, &ctx, &mut summary).await
            },
            ClaimPolicy::Untracked => self.untracked(job, &units, &ctx, &mut summary).await,
        };
        self.set_phase(JobPhase::Done);
        result?;

        summary.completed_at = Some(Utc::now());
        summary.duration_secs = clock.elapsed().as_secs_f64();
        info!(
            delivered = summary.units_delivered,
            skipped = summary.units_skipped,
            deferred = summary.units_deferred,
            failed = summary.units_failed,
            rows = summary.rows_delivered,
            dropped = summary.records_dropped,
            "Job run complete"
        );
        Ok(summary)
    }

    fn set_phase(&mut self, phase: JobPhase) {
        info!(from = ?self.phase, to = ?phase, "Job phase");
        self.phase = phase;
    }

    /// Skip marked sources and expand the rest, returning the units still to
    /// process and the sources they came from
    async fn expand_sources(
        &self,
        job: &dyn IngestJob,
        listed: Vec<WorkUnit>,
        summary: &mut JobSummary,
    ) -> Result<(Vec<WorkUnit>, Vec<String>), DriverError> {
        let claimed = self.ledger.scan_claimed().await?;
        let mut units = Vec::new();
        let mut sources = Vec::new();

        for source in listed {
            if claimed.contains(&source_mark(&source.key)) {
                debug!(source = %source.key, "Source already processed, not read");
                summary.sources_skipped += 1;
                continue;
            }
            match job.expand(&source).await {
                Ok(expanded) => {
                    summary.units_total += expanded.len();
                    for unit in expanded {
                        if claimed.contains(&unit.key) {
                            debug!(unit = %unit.key, "Duplicate, already processed");
                            summary.units_skipped += 1;
                        } else {
                            units.push(unit);
                        }
                    }
                    sources.push(source.key);
                },
                Err(e) if e.aborts_run() => {
                    return Err(DriverError::Source {
                        unit: source.key,
                        source: e,
                    })
                },
                Err(e) => {
                    error!(source = %source.key, error = %e, "Source unreadable, left for the next run");
                    summary.units_failed += 1;
                },
            }
        }
        info!(
            sources = sources.len(),
            skipped = summary.sources_skipped,
            units = units.len(),
            "Expanded sources"
        );
        Ok((units, sources))
    }

    /// Mark sources whose units all reached the ledger
    async fn mark_sources(&self, sources: &[String], incomplete: &HashSet<String>) {
        for source in sources.iter().filter(|s| !incomplete.contains(*s)) {
            if let Err(e) = self.ledger.try_claim(&source_mark(source)).await {
                warn!(source = %source, error = %e, "Failed to mark source, it will be read again");
            }
        }
    }

    /// Fetch a unit, containing everything but permanent failures
    async fn fetch_unit(
        &self,
        job: &dyn IngestJob,
        unit: &WorkUnit,
        summary: &mut JobSummary,
    ) -> Result<Option<Vec<RawRecord>>, DriverError> {
        match job.fetch(unit).await {
            Ok(records) => {
                summary.records_fetched += records.len();
                Ok(Some(records))
            },
            Err(source) if source.aborts_run() => Err(DriverError::Source {
                unit: unit.key.clone(),
                source,
            }),
            Err(e) => {
                error!(unit = %unit.key, error = %e, "Fetch failed, unit left for the next run");
                summary.units_failed += 1;
                Ok(None)
            },
        }
    }

    /// Transform and deliver one batch of records
    async fn transform_and_deliver(
        &self,
        job: &dyn IngestJob,
        records: &[RawRecord],
        ctx: &TransformContext,
        summary: &mut JobSummary,
    ) -> DeliveryOutcome {
        let schema = job.schema_for(records);
        let outcome = Transformer::new(&schema, ctx).transform_batch(records);
        summary.records_dropped += outcome.dropped.len();

        let delivered = match job.delivery() {
            DeliveryMode::Staged => deliver(self.sink.as_ref(), &schema, &outcome.rows).await,
            DeliveryMode::Upsert { key_columns } => {
                deliver_dimension(self.sink.as_ref(), &schema, &key_columns, &outcome.rows).await
            },
        };
        if let DeliveryOutcome::Delivered { rows } = &delivered {
            summary.rows_delivered += rows;
            info!(table = %schema.table(), rows, dropped = outcome.dropped.len(), "Delivered batch");
        }
        delivered
    }

    /// Write the mark after delivery; failure is logged and contained
    async fn claim(&self, unit: &WorkUnit, summary: &mut JobSummary) -> bool {
        match self.ledger.try_claim(&unit.key).await {
            Ok(ClaimOutcome::Claimed) => true,
            Ok(ClaimOutcome::AlreadyClaimed) => {
                warn!(unit = %unit.key, "Unit was claimed concurrently");
                true
            },
            Err(e) => {
                error!(unit = %unit.key, error = %e, "Failed to record unit as processed");
                summary.units_failed += 1;
                false
            },
        }
    }

    async fn claim_after_delivery(
        &self,
        job: &dyn IngestJob,
        units: &[WorkUnit],
        ctx: &TransformContext,
        summary: &mut JobSummary,
    ) -> Result<(), DriverError> {
        let claimed: Option<HashSet<String>> = if job.prefilter_claimed() {
            Some(self.ledger.scan_claimed().await?)
        } else {
            None
        };

        for (index, unit) in units.iter().enumerate() {
            let is_last = index + 1 == units.len();
            let already = match &claimed {
                Some(keys) => keys.contains(&unit.key),
                None => self.ledger.is_claimed(&unit.key).await?,
            };
            if already {
                info!(unit = %unit.key, "Already processed, skipping");
                summary.units_skipped += 1;
                continue;
            }

            let Some(records) = self.fetch_unit(job, unit, summary).await? else {
                continue;
            };

            if records.is_empty() {
                if is_last {
                    info!(unit = %unit.key, "Last unit is empty, leaving it unclaimed");
                    summary.units_deferred += 1;
                } else if self.claim(unit, summary).await {
                    info!(unit = %unit.key, "Empty unit marked processed");
                    summary.units_delivered += 1;
                }
                continue;
            }

            match self.transform_and_deliver(job, &records, ctx, summary).await {
                DeliveryOutcome::Delivered { .. } => {
                    if self.claim(unit, summary).await {
                        summary.units_delivered += 1;
                    }
                },
                DeliveryOutcome::Failed(e) => {
                    error!(unit = %unit.key, error = %e, "Delivery failed, unit left unclaimed");
                    summary.units_failed += 1;
                },
            }
        }
        Ok(())
    }

    async fn claim_before_delivery(
        &self,
        job: &dyn IngestJob,
        units: &[WorkUnit],
        sources: &[String],
        ctx: &TransformContext,
        summary: &mut JobSummary,
    ) -> Result<(), DriverError> {
        let mut records = Vec::new();
        let mut claimed_units = 0usize;
        let mut incomplete = HashSet::new();

        for unit in units {
            match self.ledger.try_claim(&unit.key).await {
                Ok(ClaimOutcome::Claimed) => {},
                Ok(ClaimOutcome::AlreadyClaimed) => {
                    info!(unit = %unit.key, "Duplicate, already processed");
                    summary.units_skipped += 1;
                    continue;
                },
                Err(e) => {
                    error!(unit = %unit.key, error = %e, "Claim failed, unit not processed");
                    summary.units_failed += 1;
                    incomplete.insert(unit.locator.clone());
                    continue;
                },
            }

            match self.fetch_unit(job, unit, summary).await? {
                Some(fetched) => {
                    records.extend(fetched);
                    claimed_units += 1;
                },
                None => {
                    incomplete.insert(unit.locator.clone());
                },
            }
        }

        if records.is_empty() {
            summary.units_delivered += claimed_units;
            self.mark_sources(sources, &incomplete).await;
            return Ok(());
        }

        match self.transform_and_deliver(job, &records, ctx, summary).await {
            DeliveryOutcome::Delivered { .. } => {
                summary.units_delivered += claimed_units;
                self.mark_sources(sources, &incomplete).await;
            },
            DeliveryOutcome::Failed(e) => {
                error!(
                    units = claimed_units,
                    error = %e,
                    "Delivery failed after claiming; these units will not be retried"
                );
                summary.units_failed += claimed_units;
            },
        }
        Ok(())
    }

    async fn untracked(
        &self,
        job: &dyn IngestJob,
        units: &[WorkUnit],
        ctx: &TransformContext,
        summary: &mut JobSummary,
    ) -> Result<(), DriverError> {
        for unit in units {
            let Some(records) = self.fetch_unit(job, unit, summary).await? else {
                continue;
            };
            match self.transform_and_deliver(job, &records, ctx, summary).await {
                DeliveryOutcome::Delivered { .. } => summary.units_delivered += 1,
                DeliveryOutcome::Failed(e) => {
                    error!(unit = %unit.key, error = %e, "Delivery failed");
                    summary.units_failed += 1;
                },
            }
        }
        Ok(())
    }
}

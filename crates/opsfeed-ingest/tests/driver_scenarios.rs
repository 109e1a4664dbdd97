//! Driver scenarios against the in-memory ledger and a recording sink

mod common;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use common::{record, RecordingSink};
use opsfeed_ingest::framework::{
    Cell, ClaimPolicy, ColumnSpec, DedupLedger, DeliveryMode, DriverError, IngestJob, JobDriver, JobPhase,
    MemoryLedger, RawRecord, SourceError, TableSchema, WorkUnit,
};
use serde_json::{json, Value};
use std::borrow::Cow;
use std::sync::{Arc, Mutex};

const JOB: &str = "scripted";

fn schema() -> TableSchema {
    TableSchema::new("test.events_staging")
        .promoted_by("test.promote_events")
        .columns_from([
            ColumnSpec::text("id", "id").required(),
            ColumnSpec::integer("amount", "amount"),
        ])
}

/// Job whose units and fetch results are fixed up front
struct ScriptedJob {
    policy: ClaimPolicy,
    delivery: DeliveryMode,
    prefilter: bool,
    units: Vec<(String, Result<Vec<Value>, SourceError>)>,
    fetched: Mutex<Vec<String>>,
    schema: TableSchema,
}

impl ScriptedJob {
    fn new(policy: ClaimPolicy) -> Self {
        Self {
            policy,
            delivery: DeliveryMode::Staged,
            prefilter: false,
            units: Vec::new(),
            fetched: Mutex::new(Vec::new()),
            schema: schema(),
        }
    }

    fn unit(mut self, key: &str, records: Vec<Value>) -> Self {
        self.units.push((key.to_string(), Ok(records)));
        self
    }

    fn failing_unit(mut self, key: &str, error: SourceError) -> Self {
        self.units.push((key.to_string(), Err(error)));
        self
    }

    fn fetched(&self) -> Vec<String> {
        self.fetched.lock().unwrap().clone()
    }
}

#[async_trait]
impl IngestJob for ScriptedJob {
    fn name(&self) -> &str {
        JOB
    }

    fn claim_policy(&self) -> ClaimPolicy {
        self.policy
    }

    fn prefilter_claimed(&self) -> bool {
        self.prefilter
    }

    fn delivery(&self) -> DeliveryMode {
        self.delivery.clone()
    }

    fn schema_for<'a>(&'a self, _records: &[RawRecord]) -> Cow<'a, TableSchema> {
        Cow::Borrowed(&self.schema)
    }

    async fn enumerate(&self, _now: DateTime<Utc>) -> Result<Vec<WorkUnit>, SourceError> {
        Ok(self
            .units
            .iter()
            .map(|(key, _)| WorkUnit::new(key.clone(), format!("scripted/{key}/")))
            .collect())
    }

    async fn fetch(&self, unit: &WorkUnit) -> Result<Vec<RawRecord>, SourceError> {
        self.fetched.lock().unwrap().push(unit.key.clone());
        let (_, result) = self
            .units
            .iter()
            .find(|(key, _)| *key == unit.key)
            .ok_or_else(|| SourceError::Unit(format!("unknown unit {}", unit.key)))?;
        result.clone().map(|values| values.into_iter().map(record).collect())
    }
}

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 4, 12, 0, 0).unwrap()
}

fn setup(ledger: MemoryLedger) -> (Arc<MemoryLedger>, Arc<RecordingSink>, JobDriver) {
    let ledger = Arc::new(ledger);
    let sink = Arc::new(RecordingSink::new());
    let driver = JobDriver::new(ledger.clone(), sink.clone(), chrono_tz::America::New_York);
    (ledger, sink, driver)
}

fn claimed_keys(ledger: &MemoryLedger) -> Vec<String> {
    let mut keys: Vec<String> = ledger.marks().into_iter().map(|m| m.key).collect();
    keys.sort();
    keys
}

#[tokio::test]
async fn test_empty_units_claimed_except_the_last() {
    let job = ScriptedJob::new(ClaimPolicy::AfterDelivery)
        .unit("U1", vec![])
        .unit("U2", vec![])
        .unit("U3", vec![]);
    let (ledger, sink, mut driver) = setup(MemoryLedger::new(JOB));

    let summary = driver.run_at(&job, now()).await.unwrap();

    assert_eq!(claimed_keys(&ledger), vec!["U1", "U2"]);
    assert_eq!(summary.units_delivered, 2);
    assert_eq!(summary.units_deferred, 1);
    assert!(sink.appends().is_empty());
    assert!(sink.promotions().is_empty());
    assert_eq!(driver.phase(), JobPhase::Done);
}

#[tokio::test]
async fn test_bad_record_is_dropped_and_unit_still_claimed() {
    let job = ScriptedJob::new(ClaimPolicy::AfterDelivery).unit(
        "U1",
        vec![
            json!({ "id": "r1", "amount": "5" }),
            json!({ "amount": "6" }),
            json!({ "id": "r3", "amount": 7 }),
        ],
    );
    let (ledger, sink, mut driver) = setup(MemoryLedger::new(JOB));

    let summary = driver.run_at(&job, now()).await.unwrap();

    let ids: Vec<Cell> = sink.appended_rows().iter().map(|r| r.get(0).unwrap().clone()).collect();
    assert_eq!(ids, vec![Cell::Text("r1".into()), Cell::Text("r3".into())]);
    assert_eq!(summary.records_fetched, 3);
    assert_eq!(summary.rows_delivered, 2);
    assert_eq!(summary.records_dropped, 1);
    assert_eq!(sink.promotions(), vec!["test.promote_events"]);
    assert_eq!(claimed_keys(&ledger), vec!["U1"]);
    assert!(summary.is_success());
}

#[tokio::test]
async fn test_claimed_unit_skipped_siblings_processed() {
    for prefilter in [false, true] {
        let mut job = ScriptedJob::new(ClaimPolicy::AfterDelivery)
            .unit("2024-01-01_", vec![json!({ "id": "a" })])
            .unit("2024-01-02_", vec![json!({ "id": "b" })])
            .unit("2024-01-03_", vec![json!({ "id": "c" })]);
        job.prefilter = prefilter;
        let (ledger, sink, mut driver) = setup(MemoryLedger::new(JOB).with_claimed(["2024-01-01_"]));

        let summary = driver.run_at(&job, now()).await.unwrap();

        assert_eq!(job.fetched(), vec!["2024-01-02_", "2024-01-03_"]);
        assert_eq!(summary.units_skipped, 1);
        assert_eq!(summary.units_delivered, 2);
        assert_eq!(sink.appends().len(), 2);
        assert_eq!(claimed_keys(&ledger), vec!["2024-01-01_", "2024-01-02_", "2024-01-03_"]);
    }
}

#[tokio::test]
async fn test_sink_failure_leaves_unit_unclaimed() {
    let job = ScriptedJob::new(ClaimPolicy::AfterDelivery)
        .unit("A", vec![json!({ "id": "a" })])
        .unit("B", vec![json!({ "id": "b" })]);
    let (ledger, sink, mut driver) = setup(MemoryLedger::new(JOB));
    sink.fail_next_appends(1);

    let summary = driver.run_at(&job, now()).await.unwrap();

    assert_eq!(claimed_keys(&ledger), vec!["B"]);
    assert_eq!(summary.units_failed, 1);
    assert_eq!(summary.units_delivered, 1);
    assert!(!summary.is_success());
    assert_eq!(sink.promotions().len(), 1);
}

#[tokio::test]
async fn test_permanent_error_aborts_run() {
    let job = ScriptedJob::new(ClaimPolicy::AfterDelivery)
        .unit("A", vec![json!({ "id": "a" })])
        .failing_unit("B", SourceError::Permanent("403 Forbidden".into()))
        .unit("C", vec![json!({ "id": "c" })]);
    let (ledger, _sink, mut driver) = setup(MemoryLedger::new(JOB));

    let err = driver.run_at(&job, now()).await.unwrap_err();

    assert!(matches!(err, DriverError::Source { ref unit, .. } if unit == "B"));
    assert_eq!(claimed_keys(&ledger), vec!["A"]);
    assert_eq!(job.fetched(), vec!["A", "B"]);
    assert_eq!(driver.phase(), JobPhase::Done);
}

#[tokio::test]
async fn test_exhausted_retries_fail_only_that_unit() {
    let job = ScriptedJob::new(ClaimPolicy::AfterDelivery)
        .failing_unit(
            "A",
            SourceError::RetriesExhausted {
                attempts: 5,
                last: "429 Too Many Requests".into(),
            },
        )
        .unit("B", vec![json!({ "id": "b" })]);
    let (ledger, _sink, mut driver) = setup(MemoryLedger::new(JOB));

    let summary = driver.run_at(&job, now()).await.unwrap();

    assert_eq!(summary.units_failed, 1);
    assert_eq!(summary.units_delivered, 1);
    assert_eq!(claimed_keys(&ledger), vec!["B"]);
}

#[tokio::test]
async fn test_claim_before_delivery_skips_duplicates() {
    let job = ScriptedJob::new(ClaimPolicy::BeforeDelivery)
        .unit("evt-1", vec![json!({ "id": "1" })])
        .unit("evt-2", vec![json!({ "id": "2" })])
        .unit("evt-2", vec![json!({ "id": "2" })]);
    let (ledger, sink, mut driver) = setup(MemoryLedger::new(JOB).with_claimed(["evt-1"]));

    let summary = driver.run_at(&job, now()).await.unwrap();

    assert_eq!(summary.units_skipped, 2);
    assert_eq!(summary.units_delivered, 1);
    assert_eq!(job.fetched(), vec!["evt-2"]);
    let appends = sink.appends();
    assert_eq!(appends.len(), 1);
    assert_eq!(appends[0].rows.len(), 1);
    assert_eq!(claimed_keys(&ledger), vec!["evt-1", "evt-2"]);
}

#[tokio::test]
async fn test_untracked_upsert_converges() {
    let mut job = ScriptedJob::new(ClaimPolicy::Untracked).unit(
        "snapshot",
        vec![json!({ "id": "q-1", "amount": 1 }), json!({ "id": "q-2", "amount": 2 })],
    );
    job.delivery = DeliveryMode::upsert_on(&["id"]);
    let (ledger, sink, mut driver) = setup(MemoryLedger::new(JOB));

    let first = driver.run_at(&job, now()).await.unwrap();
    let second = driver.run_at(&job, now()).await.unwrap();

    assert_eq!(first.rows_delivered, 2);
    assert_eq!(second.rows_delivered, 2);
    assert_eq!(sink.dimension_rows(), 2);
    assert!(sink.appends().is_empty());
    assert!(ledger.marks().is_empty());
    assert!(ledger.scan_claimed().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_rerun_delivers_nothing_new() {
    let job = ScriptedJob::new(ClaimPolicy::AfterDelivery)
        .unit("2024-01-01_", vec![json!({ "id": "a" })])
        .unit("2024-01-02_", vec![json!({ "id": "b" })]);
    let (_ledger, sink, mut driver) = setup(MemoryLedger::new(JOB));

    let first = driver.run_at(&job, now()).await.unwrap();
    let second = driver.run_at(&job, now()).await.unwrap();

    assert_eq!(first.units_delivered, 2);
    assert_eq!(second.units_skipped, 2);
    assert_eq!(second.rows_delivered, 0);
    assert_eq!(sink.appended_rows().len(), 2);
    assert_eq!(sink.promotions().len(), 2);
}

#[tokio::test]
async fn test_ingested_at_uses_run_time() {
    let mut job = ScriptedJob::new(ClaimPolicy::AfterDelivery).unit("U1", vec![json!({ "id": "a" })]);
    job.schema = schema().column(ColumnSpec::derived(
        "ingested_at",
        opsfeed_ingest::framework::Derivation::IngestedAt,
    ));
    let (_ledger, sink, mut driver) = setup(MemoryLedger::new(JOB));

    driver.run_at(&job, now()).await.unwrap();

    let rows = sink.appended_rows();
    assert_eq!(
        rows[0].get(2),
        Some(&Cell::Timestamp(
            chrono::NaiveDate::from_ymd_opt(2024, 1, 4).unwrap().and_hms_opt(7, 0, 0).unwrap()
        ))
    );
}

//! Daily hourly agent metrics
//!
//! Yesterday in the reporting zone is one work unit. Agents are listed first
//! and their metrics requested in chunks; the metric results come back as one
//! entry per (agent, hour) and are reduced to one row per key.

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use chrono_tz::Tz;
use serde_json::{json, Value};
use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::contacts::to_utc;
use crate::framework::{
    ColumnSpec, ColumnType, IngestJob, PageSource, PaginatedFetcher, RawRecord, RetryPolicy, SourceError, TableSchema,
    WorkUnit,
};
use crate::sources::ListRequest;

pub const JOB_NAME: &str = "agent-metrics";

const METRICS_TABLE: &str = "connect.f_agent_metrics";
const AGENT_CHUNK: usize = 100;

pub const EXPECTED_METRICS: [&str; 52] = [
    "AGENT_ANSWER_RATE",
    "AGENT_NON_RESPONSE",
    "AGENT_OCCUPANCY",
    "AVG_DIALS_PER_MINUTE",
    "SUM_CONNECTING_TIME_AGENT",
    "SUM_RETRY_CALLBACK_ATTEMPTS",
    "PERCENT_TALK_TIME_CUSTOMER",
    "AVG_TALK_TIME_CUSTOMER",
    "PERCENT_TALK_TIME_AGENT",
    "AVG_TALK_TIME_AGENT",
    "PERCENT_TALK_TIME",
    "AVG_TALK_TIME",
    "CONTACTS_QUEUED",
    "CONTACTS_QUEUED_BY_ENQUEUE",
    "MAX_QUEUED_TIME",
    "CONTACTS_TRANSFERRED_OUT_FROM_QUEUE",
    "AVG_QUEUE_ANSWER_TIME",
    "CONTACTS_CREATED",
    "SUM_CONTACTS_DISCONNECTED",
    "AVG_ACTIVE_TIME",
    "ABANDONMENT_RATE",
    "AVG_NON_TALK_TIME",
    "AVG_INTERRUPTION_TIME_AGENT",
    "DELIVERY_ATTEMPTS",
    "CONTACTS_TRANSFERRED_OUT",
    "CONTACTS_TRANSFERRED_OUT_INTERNAL",
    "CONTACTS_TRANSFERRED_OUT_EXTERNAL",
    "CONTACTS_PUT_ON_HOLD",
    "AVG_HOLDS",
    "SUM_HOLD_TIME",
    "CONTACTS_HOLD_ABANDONS",
    "CONTACTS_ON_HOLD_AGENT_DISCONNECT",
    "CONTACTS_ON_HOLD_CUSTOMER_DISCONNECT",
    "CONTACTS_HANDLED",
    "AVG_HANDLE_TIME",
    "SUM_HANDLE_TIME",
    "AVG_INTERACTION_TIME",
    "SUM_INTERACTION_TIME",
    "AVG_CONTACT_DURATION",
    "SUM_INTERACTION_AND_HOLD_TIME",
    "AVG_AFTER_CONTACT_WORK_TIME",
    "SUM_AFTER_CONTACT_WORK_TIME",
    "SUM_ONLINE_TIME_AGENT",
    "SUM_NON_PRODUCTIVE_TIME_AGENT",
    "SUM_IDLE_TIME_AGENT",
    "SUM_ERROR_STATUS_TIME_AGENT",
    "SUM_CONTACT_TIME_AGENT",
    "AGENT_NON_RESPONSE_WITHOUT_CUSTOMER_ABANDONS",
    "AGENT_NON_ADHERENT_TIME",
    "AGENT_ADHERENT_TIME",
    "AGENT_SCHEDULED_TIME",
    "AGENT_SCHEDULE_ADHERENCE",
];

pub fn metrics_schema() -> TableSchema {
    let metrics = EXPECTED_METRICS.iter().map(|metric| {
        let column = metric.to_lowercase();
        ColumnSpec::field(column.clone(), column, ColumnType::Float { decimals: Some(2) })
    });

    TableSchema::new(METRICS_TABLE)
        .column(ColumnSpec::text("agent_id", "agent_id").required())
        .column(ColumnSpec::timestamp("start_time", "start_time"))
        .column(ColumnSpec::timestamp("end_time", "end_time"))
        .columns_from(metrics)
}

/// Reduce metric results to one record per (agent, interval start)
///
/// Every expected metric is present in the output, null unless some entry
/// for the key reported it. Later entries win for metrics reported twice.
pub fn reduce_metric_results(results: &[RawRecord]) -> Vec<RawRecord> {
    let mut order: Vec<RawRecord> = Vec::new();
    let mut index: HashMap<(String, String), usize> = HashMap::new();

    for entry in results {
        let Some(agent) = entry.get_str("Dimensions.AGENT") else {
            warn!("Skipping metric result without an agent dimension");
            continue;
        };
        let start = entry.get("MetricInterval.StartTime").cloned().unwrap_or(Value::Null);
        let key = (agent.to_string(), start.to_string());

        let slot = *index.entry(key).or_insert_with(|| {
            let mut row = RawRecord::new();
            row.insert("agent_id", json!(agent));
            row.insert("start_time", start.clone());
            row.insert(
                "end_time",
                entry.get("MetricInterval.EndTime").cloned().unwrap_or(Value::Null),
            );
            for metric in EXPECTED_METRICS {
                row.insert(metric.to_lowercase(), Value::Null);
            }
            order.push(row);
            order.len() - 1
        });

        let collections = entry
            .get("Collections")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();
        for collection in collections {
            let Some(name) = collection.pointer("/Metric/Name").and_then(Value::as_str) else {
                continue;
            };
            let value = collection.get("Value").cloned().unwrap_or(Value::Null);
            if !value.is_null() {
                order[slot].insert(name.to_lowercase(), value);
            }
        }
    }

    order
}

pub struct AgentMetricsJob {
    users: Arc<dyn PageSource<Filter = ListRequest>>,
    metrics: Arc<dyn PageSource<Filter = ListRequest>>,
    instance_id: String,
    timezone: Tz,
    retry: RetryPolicy,
    schema: TableSchema,
}

impl AgentMetricsJob {
    pub fn new(
        users: Arc<dyn PageSource<Filter = ListRequest>>,
        metrics: Arc<dyn PageSource<Filter = ListRequest>>,
        instance_id: impl Into<String>,
        timezone: Tz,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            users,
            metrics,
            instance_id: instance_id.into(),
            timezone,
            retry,
            schema: metrics_schema(),
        }
    }

    async fn agent_ids(&self) -> Result<Vec<String>, SourceError> {
        let request = ListRequest::new().query("InstanceId", self.instance_id.clone());
        let users = PaginatedFetcher::new(self.users.as_ref(), self.retry.clone())
            .collect_all(&request)
            .await?;
        Ok(users
            .iter()
            .filter_map(|u| u.get_str("Id").map(str::to_owned))
            .collect())
    }

    fn metric_request(&self, day: NaiveDate, agents: &[String]) -> ListRequest {
        let start = to_utc(self.timezone, day.and_time(chrono::NaiveTime::MIN));
        let end = to_utc(
            self.timezone,
            (day + Duration::days(1)).and_time(chrono::NaiveTime::MIN),
        );
        let metrics: Vec<Value> = EXPECTED_METRICS.iter().map(|name| json!({ "Name": name })).collect();

        ListRequest::new().body(json!({
            "InstanceId": self.instance_id,
            "StartTime": start.timestamp(),
            "EndTime": end.timestamp(),
            "Interval": { "TimeZone": self.timezone.name(), "IntervalPeriod": "HOUR" },
            "Filters": [{ "FilterKey": "AGENT", "FilterValues": agents }],
            "Groupings": ["AGENT"],
            "Metrics": metrics,
        }))
    }
}

#[async_trait]
impl IngestJob for AgentMetricsJob {
    fn name(&self) -> &str {
        JOB_NAME
    }

    fn schema_for<'a>(&'a self, _records: &[RawRecord]) -> Cow<'a, TableSchema> {
        Cow::Borrowed(&self.schema)
    }

    async fn enumerate(&self, now: DateTime<Utc>) -> Result<Vec<WorkUnit>, SourceError> {
        let today = now.with_timezone(&self.timezone).date_naive();
        let yesterday = today - Duration::days(1);
        let key = yesterday.format("%Y-%m-%d").to_string();
        Ok(vec![WorkUnit::new(key.clone(), key)])
    }

    async fn fetch(&self, unit: &WorkUnit) -> Result<Vec<RawRecord>, SourceError> {
        let day = NaiveDate::parse_from_str(&unit.locator, "%Y-%m-%d")
            .map_err(|e| SourceError::Unit(format!("invalid report date {:?}: {e}", unit.locator)))?;

        let agents = self.agent_ids().await?;
        info!(day = %day, agents = agents.len(), "Requesting agent metrics");

        let fetcher = PaginatedFetcher::new(self.metrics.as_ref(), self.retry.clone());
        let mut results = Vec::new();
        for chunk in agents.chunks(AGENT_CHUNK) {
            let chunk_results = fetcher.collect_all(&self.metric_request(day, chunk)).await?;
            debug!(agents = chunk.len(), results = chunk_results.len(), "Metric chunk");
            results.extend(chunk_results);
        }

        let rows = reduce_metric_results(&results);
        info!(day = %day, results = results.len(), rows = rows.len(), "Reduced metric results");
        Ok(rows)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::framework::{Cell, TransformContext, Transformer};

    fn result(agent: &str, start: i64, metrics: Value) -> RawRecord {
        RawRecord::from_value(json!({
            "Dimensions": { "AGENT": agent },
            "MetricInterval": { "StartTime": start, "EndTime": start + 3600 },
            "Collections": metrics
        }))
        .unwrap()
    }

    #[test]
    fn test_schema_has_every_metric() {
        let schema = metrics_schema();
        schema.validate().unwrap();
        assert_eq!(schema.columns().len(), 3 + 52);
        assert!(schema.index_of("agent_schedule_adherence").is_some());
        assert_eq!(schema.promote_procedure(), None);
    }

    #[test]
    fn test_reduce_by_agent_and_interval_start() {
        let rows = reduce_metric_results(&[
            result("a-1", 1_719_806_400, json!([{ "Metric": { "Name": "CONTACTS_HANDLED" }, "Value": 4.0 }])),
            result("a-1", 1_719_806_400, json!([{ "Metric": { "Name": "AVG_HANDLE_TIME" }, "Value": 123.456 }])),
            result("a-1", 1_719_810_000, json!([])),
            result("a-2", 1_719_806_400, json!([{ "Metric": { "Name": "CONTACTS_HANDLED" }, "Value": null }])),
        ]);

        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].get("contacts_handled"), Some(&json!(4.0)));
        assert_eq!(rows[0].get("avg_handle_time"), Some(&json!(123.456)));
        assert_eq!(rows[1].get("contacts_handled"), Some(&Value::Null));
        assert_eq!(rows[2].get_str("agent_id"), Some("a-2"));
        assert_eq!(rows[2].get("contacts_handled"), Some(&Value::Null));
        assert_eq!(rows[0].len(), 3 + 52);
    }

    #[test]
    fn test_reduce_skips_entries_without_agent() {
        let orphan = RawRecord::from_value(json!({ "Collections": [] })).unwrap();
        assert!(reduce_metric_results(&[orphan]).is_empty());
    }

    #[test]
    fn test_metric_row_rounded_and_localized() {
        let rows = reduce_metric_results(&[result(
            "a-1",
            1_719_806_400, // 2024-07-01T04:00:00Z
            json!([{ "Metric": { "Name": "AVG_HANDLE_TIME" }, "Value": 123.456 }]),
        )]);
        let schema = metrics_schema();
        let ctx = TransformContext::new(chrono_tz::America::New_York, Utc::now());
        let row = Transformer::new(&schema, &ctx).transform(&rows[0]).unwrap();
        let cell = |name: &str| row.get(schema.index_of(name).unwrap()).unwrap().clone();

        assert_eq!(cell("avg_handle_time"), Cell::Float(123.46));
        assert_eq!(cell("contacts_handled"), Cell::Float(0.0));
        assert_eq!(
            cell("start_time"),
            Cell::Timestamp(NaiveDate::from_ymd_opt(2024, 7, 1).unwrap().and_hms_opt(0, 0, 0).unwrap())
        );
    }
}

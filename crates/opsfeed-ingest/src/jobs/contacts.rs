//! Contact records job
//!
//! Every run covers the previous two whole hours in the reporting zone. The
//! window label is the dedup key, so a window that was already delivered is
//! not searched again.

use async_trait::async_trait;
use chrono::{DateTime, Duration, LocalResult, NaiveDateTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use serde_json::json;
use std::borrow::Cow;
use std::sync::Arc;
use tracing::info;

use crate::framework::{
    enrich_with_details, ColumnSpec, DetailSource, Derivation, IngestJob, PageSource, PaginatedFetcher, RawRecord,
    RetryPolicy, SourceError, TableSchema, TimestampFormat, WorkUnit,
};
use crate::sources::ListRequest;

pub const JOB_NAME: &str = "contact-records";

pub const CALLS_STAGING_TABLE: &str = "connect.f_calls_staging";
pub const CALLS_PROMOTION: &str = "connect.insert_new_f_calls";

const WINDOW_HOURS: i64 = 2;
const DETAIL_FIELD: &str = "Detail";

/// Search window of one run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContactWindow {
    pub label: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl ContactWindow {
    /// The two whole hours before `now`, end extended by one second
    pub fn preceding(now: DateTime<Utc>, tz: Tz) -> Self {
        let local = now.with_timezone(&tz).naive_local();
        let hour_start = local
            .date()
            .and_hms_opt(local.hour(), 0, 0)
            .unwrap_or(local);
        let start_local = hour_start - Duration::hours(WINDOW_HOURS);

        let label = format!(
            "{}_{:02}-{:02}",
            start_local.format("%Y-%m-%d"),
            start_local.hour(),
            hour_start.hour()
        );

        Self {
            label,
            start: to_utc(tz, start_local),
            end: to_utc(tz, hour_start) + Duration::seconds(1),
        }
    }

    fn locator(&self) -> String {
        format!("{}..{}", self.start.to_rfc3339(), self.end.to_rfc3339())
    }

    fn from_unit(unit: &WorkUnit) -> Result<Self, SourceError> {
        let invalid = || SourceError::Unit(format!("invalid window locator {:?}", unit.locator));
        let (start, end) = unit.locator.split_once("..").ok_or_else(invalid)?;
        let start = DateTime::parse_from_rfc3339(start).map_err(|_| invalid())?;
        let end = DateTime::parse_from_rfc3339(end).map_err(|_| invalid())?;
        Ok(Self {
            label: unit.key.clone(),
            start: start.with_timezone(&Utc),
            end: end.with_timezone(&Utc),
        })
    }
}

/// Local wall-clock time to UTC; ambiguous times take the earlier instant and
/// times skipped by a DST jump move forward an hour
pub(crate) fn to_utc(tz: Tz, local: NaiveDateTime) -> DateTime<Utc> {
    match tz.from_local_datetime(&local) {
        LocalResult::Single(t) | LocalResult::Ambiguous(t, _) => t.with_timezone(&Utc),
        LocalResult::None => match tz.from_local_datetime(&(local + Duration::hours(1))).earliest() {
            Some(t) => t.with_timezone(&Utc),
            None => local.and_utc(),
        },
    }
}

/// Staging row of a searched contact plus its detail lookup
pub fn contact_schema() -> TableSchema {
    let detail = |path: &str| format!("{DETAIL_FIELD}.{path}");

    TableSchema::new(CALLS_STAGING_TABLE)
        .promoted_by(CALLS_PROMOTION)
        .columns_from([
            ColumnSpec::text("init_contact_id", "InitialContactId"),
            ColumnSpec::text("prev_contact_id", "PreviousContactId"),
            ColumnSpec::text("contact_id", "Id").required(),
            ColumnSpec::text("next_contact_id", "NextContactId"),
            ColumnSpec::text("channel", "Channel"),
            ColumnSpec::text("init_method", "InitiationMethod"),
            ColumnSpec::timestamp("init_time", "InitiationTimestamp"),
            ColumnSpec::timestamp("disconn_time", "DisconnectTimestamp"),
            ColumnSpec::text("disconn_reason", "DisconnectReason"),
            ColumnSpec::timestamp("last_update_time", detail("LastUpdateTimestamp")),
            ColumnSpec::timestamp("agent_conn", "AgentInfo.ConnectedToAgentTimestamp"),
            ColumnSpec::text("agent_id", "AgentInfo.Id"),
            ColumnSpec::text("agent_username", "AgentInfo.Username"),
            ColumnSpec::integer("agent_conn_att", detail("AgentInfo.AgentConnectionAttempts")),
            ColumnSpec::timestamp("agent_afw_start", detail("AgentInfo.AfterContactWorkStartTimestamp")),
            ColumnSpec::timestamp("agent_afw_end", detail("AgentInfo.AfterContactWorkEndTimestamp")),
            ColumnSpec::integer("agent_afw_duration", detail("AgentInfo.AfterContactWorkDuration")),
            ColumnSpec::integer("agent_interact_duration", detail("AgentInfo.AgentInteractionDuration")),
            ColumnSpec::integer("agent_holds", detail("TotalPauseCount")),
            ColumnSpec::integer("agent_longest_hold", detail("AgentInfo.LongestHoldDuration")),
            ColumnSpec::text("queue_id", "QueueInfo.Id"),
            ColumnSpec::text("queue_name", detail("QueueInfo.Name")),
            ColumnSpec::timestamp("in_queue_time", detail("QueueInfo.EnqueueTimestamp")),
            ColumnSpec::timestamp("out_queue_time", detail("QueueInfo.DequeueTimestamp")),
            ColumnSpec::integer("queue_duration", detail("QueueTimeAdjustmentSeconds")),
            ColumnSpec::text("customer_voice", detail("CustomerEndpoint.Voice")),
            ColumnSpec::integer("customer_hold_duration", detail("TotalPauseDurationInSeconds")),
            ColumnSpec::derived(
                "contact_duration",
                Derivation::SecondsBetween {
                    start: "AgentInfo.ConnectedToAgentTimestamp".to_string(),
                    end: "DisconnectTimestamp".to_string(),
                    format: TimestampFormat::Iso8601,
                },
            ),
            ColumnSpec::text("sys_phone", detail("SystemEndpoint.Address")),
            ColumnSpec::timestamp("conn_to_sys", detail("ConnectedToSystemTimestamp")),
            ColumnSpec::text("customer_phone", detail("CustomerEndpoint.Address")),
        ])
}

pub struct ContactRecordsJob {
    search: Arc<dyn PageSource<Filter = ListRequest>>,
    details: Arc<dyn DetailSource>,
    instance_id: String,
    timezone: Tz,
    retry: RetryPolicy,
    detail_concurrency: usize,
    schema: TableSchema,
}

impl ContactRecordsJob {
    pub fn new(
        search: Arc<dyn PageSource<Filter = ListRequest>>,
        details: Arc<dyn DetailSource>,
        instance_id: impl Into<String>,
        timezone: Tz,
        retry: RetryPolicy,
        detail_concurrency: usize,
    ) -> Self {
        Self {
            search,
            details,
            instance_id: instance_id.into(),
            timezone,
            retry,
            detail_concurrency,
            schema: contact_schema(),
        }
    }

    fn search_request(&self, window: &ContactWindow) -> ListRequest {
        ListRequest::new().body(json!({
            "InstanceId": self.instance_id,
            "TimeRange": {
                "Type": "INITIATION_TIMESTAMP",
                "StartTime": window.start.to_rfc3339(),
                "EndTime": window.end.to_rfc3339(),
            },
        }))
    }
}

#[async_trait]
impl IngestJob for ContactRecordsJob {
    fn name(&self) -> &str {
        JOB_NAME
    }

    fn schema_for<'a>(&'a self, _records: &[RawRecord]) -> Cow<'a, TableSchema> {
        Cow::Borrowed(&self.schema)
    }

    async fn enumerate(&self, now: DateTime<Utc>) -> Result<Vec<WorkUnit>, SourceError> {
        let window = ContactWindow::preceding(now, self.timezone);
        info!(window = %window.label, start = %window.start, end = %window.end, "Contact search window");
        Ok(vec![WorkUnit::new(window.label.clone(), window.locator())])
    }

    async fn fetch(&self, unit: &WorkUnit) -> Result<Vec<RawRecord>, SourceError> {
        let window = ContactWindow::from_unit(unit)?;
        let request = self.search_request(&window);
        let contacts = PaginatedFetcher::new(self.search.as_ref(), self.retry.clone())
            .collect_all(&request)
            .await?;

        let found = contacts.len();
        let finished: Vec<RawRecord> = contacts
            .into_iter()
            .filter(|c| c.get_str("DisconnectTimestamp").is_some())
            .collect();
        if finished.len() < found {
            info!(
                window = %window.label,
                in_progress = found - finished.len(),
                "Skipping contacts that have not disconnected"
            );
        }

        Ok(enrich_with_details(
            finished,
            "Id",
            self.details.as_ref(),
            &self.retry,
            DETAIL_FIELD,
            self.detail_concurrency,
        )
        .await)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::framework::{Cell, TransformContext, Transformer};
    use chrono::NaiveDate;

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn test_window_is_previous_two_hours() {
        // 14:37 EDT
        let window = ContactWindow::preceding(utc("2024-07-01T18:37:12Z"), chrono_tz::America::New_York);
        assert_eq!(window.label, "2024-07-01_12-14");
        assert_eq!(window.start, utc("2024-07-01T16:00:00Z"));
        assert_eq!(window.end, utc("2024-07-01T18:00:01Z"));
    }

    #[test]
    fn test_window_wraps_to_previous_day_after_midnight() {
        // 00:15 EDT on July 2nd
        let window = ContactWindow::preceding(utc("2024-07-02T04:15:00Z"), chrono_tz::America::New_York);
        assert_eq!(window.label, "2024-07-01_22-00");
        assert_eq!(window.start, utc("2024-07-02T02:00:00Z"));
        assert_eq!(window.end, utc("2024-07-02T04:00:01Z"));

        // 01:59 EDT
        let window = ContactWindow::preceding(utc("2024-07-02T05:59:00Z"), chrono_tz::America::New_York);
        assert_eq!(window.label, "2024-07-01_23-01");
    }

    #[test]
    fn test_window_locator_roundtrip() {
        let window = ContactWindow::preceding(utc("2024-01-15T10:05:00Z"), chrono_tz::UTC);
        let unit = WorkUnit::new(window.label.clone(), window.locator());
        assert_eq!(ContactWindow::from_unit(&unit).unwrap(), window);

        let broken = WorkUnit::new("x", "not-a-window");
        assert!(matches!(ContactWindow::from_unit(&broken), Err(SourceError::Unit(_))));
    }

    #[test]
    fn test_to_utc_skipped_hour() {
        // 02:30 does not exist in New York on 2024-03-10
        let local = NaiveDate::from_ymd_opt(2024, 3, 10).unwrap().and_hms_opt(2, 30, 0).unwrap();
        assert_eq!(to_utc(chrono_tz::America::New_York, local), utc("2024-03-10T07:30:00Z"));
    }

    #[test]
    fn test_contact_schema_shape() {
        let schema = contact_schema();
        schema.validate().unwrap();
        assert_eq!(schema.columns().len(), 31);
        assert_eq!(schema.index_of("contact_id"), Some(2));
        assert_eq!(schema.index_of("customer_phone"), Some(30));
        assert_eq!(schema.promote_procedure(), Some(CALLS_PROMOTION));
    }

    #[test]
    fn test_contact_row_from_search_and_detail() {
        let record = RawRecord::from_value(json!({
            "Id": "c-1",
            "InitialContactId": "c-0",
            "Channel": "VOICE",
            "InitiationMethod": "INBOUND",
            "InitiationTimestamp": "2024-07-01T16:10:00Z",
            "DisconnectTimestamp": "2024-07-01T16:20:30Z",
            "AgentInfo": { "Id": "agent-7", "ConnectedToAgentTimestamp": "2024-07-01T16:12:00Z" },
            "QueueInfo": { "Id": "queue-1" },
            "Detail": {
                "CustomerEndpoint": { "Address": "+15550100" },
                "TotalPauseCount": 2,
                "TotalPauseDurationInSeconds": 45,
                "QueueInfo": { "EnqueueTimestamp": "2024-07-01T16:10:05Z" }
            }
        }))
        .unwrap();

        let schema = contact_schema();
        let ctx = TransformContext::new(chrono_tz::America::New_York, Utc::now());
        let row = Transformer::new(&schema, &ctx).transform(&record).unwrap();
        let cell = |name: &str| row.get(schema.index_of(name).unwrap()).unwrap().clone();

        assert_eq!(cell("contact_id"), Cell::Text("c-1".into()));
        assert_eq!(cell("prev_contact_id"), Cell::Text(String::new()));
        assert_eq!(cell("agent_holds"), Cell::Int(2));
        assert_eq!(cell("customer_hold_duration"), Cell::Int(45));
        assert_eq!(cell("customer_phone"), Cell::Text("+15550100".into()));
        assert_eq!(cell("contact_duration"), Cell::Float(510.0));
        assert_eq!(
            cell("in_queue_time"),
            Cell::Timestamp(NaiveDate::from_ymd_opt(2024, 7, 1).unwrap().and_hms_opt(12, 10, 5).unwrap())
        );
    }
}

//! Contact trace record events
//!
//! Events arrive as newline-delimited JSON files under the CTR prefix. Each
//! file is a tracked source: once its events are delivered the file is marked
//! and not downloaded again. Each event is its own work unit keyed by contact
//! id and claimed before delivery, so a contact is loaded at most once even
//! when it shows up in several files.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::borrow::Cow;
use std::sync::Arc;
use tracing::{debug, warn};

use super::contacts::{CALLS_PROMOTION, CALLS_STAGING_TABLE};
use crate::framework::{
    ClaimPolicy, ColumnSpec, Derivation, IngestJob, RawRecord, SourceError, TableSchema, TimestampFormat, WorkUnit,
};
use crate::sources::{parse_json_lines, ObjectSource};

pub const JOB_NAME: &str = "contact-trace-records";

fn trailing(path: &str, marker: &str) -> Derivation {
    Derivation::TrailingSegment {
        path: path.to_string(),
        marker: marker.to_string(),
    }
}

/// Staging row of one trace record event; same table as the contact search
pub fn trace_record_schema() -> TableSchema {
    TableSchema::new(CALLS_STAGING_TABLE)
        .promoted_by(CALLS_PROMOTION)
        .columns_from([
            ColumnSpec::text("init_contact_id", "InitialContactId"),
            ColumnSpec::text("prev_contact_id", "PreviousContactId"),
            ColumnSpec::text("contact_id", "ContactId").required(),
            ColumnSpec::text("next_contact_id", "NextContactId"),
            ColumnSpec::text("channel", "Channel"),
            ColumnSpec::text("init_method", "InitiationMethod"),
            ColumnSpec::timestamp("init_time", "InitiationTimestamp"),
            ColumnSpec::timestamp("disconn_time", "DisconnectTimestamp"),
            ColumnSpec::text("disconn_reason", "DisconnectReason"),
            ColumnSpec::timestamp("last_update_time", "LastUpdateTimestamp"),
            ColumnSpec::timestamp("agent_conn", "Agent.ConnectedToAgentTimestamp"),
            ColumnSpec::derived("agent_id", trailing("Agent.ARN", "/agent/")),
            ColumnSpec::text("agent_username", "Agent.Username"),
            ColumnSpec::integer("agent_conn_att", "AgentConnectionAttempts"),
            ColumnSpec::timestamp("agent_afw_start", "Agent.AfterContactWorkStartTimestamp"),
            ColumnSpec::timestamp("agent_afw_end", "Agent.AfterContactWorkEndTimestamp"),
            ColumnSpec::integer("agent_afw_duration", "Agent.AfterContactWorkDuration"),
            ColumnSpec::integer("agent_interact_duration", "Agent.AgentInteractionDuration"),
            ColumnSpec::integer("agent_holds", "Agent.NumberOfHolds"),
            ColumnSpec::integer("agent_longest_hold", "Agent.LongestHoldDuration"),
            ColumnSpec::derived("queue_id", trailing("Queue.ARN", "/queue/")),
            ColumnSpec::text("queue_name", "Queue.Name"),
            ColumnSpec::timestamp("in_queue_time", "Queue.EnqueueTimestamp"),
            ColumnSpec::timestamp("out_queue_time", "Queue.DequeueTimestamp"),
            ColumnSpec::integer("queue_duration", "Queue.Duration"),
            ColumnSpec::text("customer_voice", "CustomerEndpoint.Voice"),
            ColumnSpec::integer("customer_hold_duration", "Agent.CustomerHoldDuration"),
            ColumnSpec::derived(
                "contact_duration",
                Derivation::SecondsBetween {
                    start: "Agent.ConnectedToAgentTimestamp".to_string(),
                    end: "DisconnectTimestamp".to_string(),
                    format: TimestampFormat::Iso8601,
                },
            ),
            ColumnSpec::text("sys_phone", "SystemEndpoint.Address"),
            ColumnSpec::timestamp("conn_to_sys", "ConnectedToSystemTimestamp"),
            ColumnSpec::text("customer_phone", "CustomerEndpoint.Address"),
        ])
}

/// One work unit per event, keyed by contact id; events without one are dropped
pub fn event_units(file: &str, events: Vec<RawRecord>) -> Vec<WorkUnit> {
    events
        .into_iter()
        .filter_map(|event| match event.get_str("ContactId").map(str::to_owned) {
            Some(contact_id) => Some(WorkUnit::new(contact_id, file).with_payload(event)),
            None => {
                warn!(file, "Dropping event without ContactId");
                None
            },
        })
        .collect()
}

pub struct TraceRecordsJob {
    store: Arc<dyn ObjectSource>,
    prefix: String,
    schema: TableSchema,
}

impl TraceRecordsJob {
    pub fn new(store: Arc<dyn ObjectSource>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
            schema: trace_record_schema(),
        }
    }
}

#[async_trait]
impl IngestJob for TraceRecordsJob {
    fn name(&self) -> &str {
        JOB_NAME
    }

    fn claim_policy(&self) -> ClaimPolicy {
        ClaimPolicy::BeforeDelivery
    }

    fn schema_for<'a>(&'a self, _records: &[RawRecord]) -> Cow<'a, TableSchema> {
        Cow::Borrowed(&self.schema)
    }

    fn tracks_sources(&self) -> bool {
        true
    }

    /// One source per event file; nothing is downloaded here
    async fn enumerate(&self, _now: DateTime<Utc>) -> Result<Vec<WorkUnit>, SourceError> {
        let files = self.store.list_keys(&self.prefix).await?;
        Ok(files
            .into_iter()
            .filter(|k| !k.ends_with('/'))
            .map(|file| WorkUnit::new(file.clone(), file))
            .collect())
    }

    async fn expand(&self, source: &WorkUnit) -> Result<Vec<WorkUnit>, SourceError> {
        let file = source.key.as_str();
        // A bad object only affects its own events
        let bytes = self
            .store
            .get_bytes(file)
            .await
            .map_err(|e| SourceError::Unit(format!("{file}: {e}")))?;
        let events = parse_json_lines(&bytes);
        debug!(file, events = events.len(), "Read event file");
        Ok(event_units(file, events))
    }
}

//! Queue and user dimension snapshots
//!
//! Both jobs list the full dimension on every run and upsert it row by row on
//! the natural key. No ledger is involved; re-running converges on the same
//! table contents.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::borrow::Cow;
use std::sync::Arc;
use tracing::info;

use crate::framework::{
    enrich_with_details, ClaimPolicy, ColumnSpec, DeliveryMode, DetailSource, IngestJob, PageSource,
    PaginatedFetcher, RawRecord, RetryPolicy, SourceError, TableSchema, WorkUnit,
};
use crate::sources::ListRequest;

pub const QUEUE_JOB_NAME: &str = "queue-dimension";
pub const USER_JOB_NAME: &str = "user-dimension";

const USER_DETAIL_FIELD: &str = "User";

pub fn queue_schema() -> TableSchema {
    TableSchema::new("connect.dim_queues").columns_from([
        ColumnSpec::text("queue_id", "Id").required(),
        ColumnSpec::text("queue_name", "Name"),
        ColumnSpec::timestamp("last_modified", "LastModifiedTime"),
    ])
}

pub fn user_schema() -> TableSchema {
    TableSchema::new("connect.dim_users").columns_from([
        ColumnSpec::text("user_id", "Id").required(),
        ColumnSpec::text("user_email", "Username"),
        ColumnSpec::text("user_name", "User.IdentityInfo.FirstName"),
        ColumnSpec::text("user_lastname", "User.IdentityInfo.LastName"),
        ColumnSpec::timestamp("last_modified", "User.LastModifiedTime"),
    ])
}

struct Detail {
    source: Arc<dyn DetailSource>,
    concurrency: usize,
}

/// Full-listing dimension feed, optionally enriched by a per-item lookup
pub struct DimensionJob {
    name: &'static str,
    listing: Arc<dyn PageSource<Filter = ListRequest>>,
    request: ListRequest,
    detail: Option<Detail>,
    key_columns: Vec<&'static str>,
    retry: RetryPolicy,
    schema: TableSchema,
}

impl DimensionJob {
    pub fn queues(
        listing: Arc<dyn PageSource<Filter = ListRequest>>,
        instance_id: &str,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            name: QUEUE_JOB_NAME,
            listing,
            request: ListRequest::new().query("InstanceId", instance_id),
            detail: None,
            key_columns: vec!["queue_id"],
            retry,
            schema: queue_schema(),
        }
    }

    pub fn users(
        listing: Arc<dyn PageSource<Filter = ListRequest>>,
        details: Arc<dyn DetailSource>,
        instance_id: &str,
        retry: RetryPolicy,
        detail_concurrency: usize,
    ) -> Self {
        Self {
            name: USER_JOB_NAME,
            listing,
            request: ListRequest::new().query("InstanceId", instance_id),
            detail: Some(Detail {
                source: details,
                concurrency: detail_concurrency,
            }),
            key_columns: vec!["user_id"],
            retry,
            schema: user_schema(),
        }
    }
}

#[async_trait]
impl IngestJob for DimensionJob {
    fn name(&self) -> &str {
        self.name
    }

    fn claim_policy(&self) -> ClaimPolicy {
        ClaimPolicy::Untracked
    }

    fn delivery(&self) -> DeliveryMode {
        DeliveryMode::upsert_on(&self.key_columns)
    }

    fn schema_for<'a>(&'a self, _records: &[RawRecord]) -> Cow<'a, TableSchema> {
        Cow::Borrowed(&self.schema)
    }

    async fn enumerate(&self, now: DateTime<Utc>) -> Result<Vec<WorkUnit>, SourceError> {
        let snapshot = now.format("%Y-%m-%dT%H:%M:%SZ").to_string();
        Ok(vec![WorkUnit::new(snapshot, self.name)])
    }

    async fn fetch(&self, _unit: &WorkUnit) -> Result<Vec<RawRecord>, SourceError> {
        let items = PaginatedFetcher::new(self.listing.as_ref(), self.retry.clone())
            .collect_all(&self.request)
            .await?;
        info!(job = self.name, items = items.len(), "Listed dimension");

        Ok(match &self.detail {
            None => items,
            Some(detail) => {
                enrich_with_details(
                    items,
                    "Id",
                    detail.source.as_ref(),
                    &self.retry,
                    USER_DETAIL_FIELD,
                    detail.concurrency,
                )
                .await
            },
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::framework::{Cell, TransformContext, Transformer};
    use chrono::NaiveDate;
    use serde_json::json;

    #[test]
    fn test_schemas_validate() {
        queue_schema().validate().unwrap();
        user_schema().validate().unwrap();
    }

    #[test]
    fn test_user_row_with_failed_lookup() {
        let record = RawRecord::from_value(json!({ "Id": "u-1", "Username": "ana@example.com", "User": null })).unwrap();
        let schema = user_schema();
        let ctx = TransformContext::new(chrono_tz::America::New_York, Utc::now());
        let row = Transformer::new(&schema, &ctx).transform(&record).unwrap();

        assert_eq!(row.get(1), Some(&Cell::Text("ana@example.com".into())));
        assert_eq!(row.get(2), Some(&Cell::Text(String::new())));
        assert_eq!(row.get(4), Some(&Cell::Null));
    }

    #[test]
    fn test_queue_row_localized() {
        let record = RawRecord::from_value(json!({
            "Id": "q-1",
            "Name": "Billing",
            "LastModifiedTime": "2024-03-01T15:00:00Z"
        }))
        .unwrap();
        let schema = queue_schema();
        let ctx = TransformContext::new(chrono_tz::America::New_York, Utc::now());
        let row = Transformer::new(&schema, &ctx).transform(&record).unwrap();

        assert_eq!(
            row.get(2),
            Some(&Cell::Timestamp(
                NaiveDate::from_ymd_opt(2024, 3, 1).unwrap().and_hms_opt(10, 0, 0).unwrap()
            ))
        );
    }
}

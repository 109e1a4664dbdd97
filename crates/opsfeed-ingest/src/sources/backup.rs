//! Object-store source for CRM differential backups and event files
//!
//! Backups land as `<prefix><date>_Differential/<Object>/<file>.csv`. The
//! listing is exposed as a [`PageSource`] so folder and key enumeration go
//! through the same paginated fetcher as the HTTP listings.

use async_trait::async_trait;
use aws_sdk_s3::{
    config::{Credentials, Region},
    error::{DisplayErrorContext, ProvideErrorMetadata, SdkError},
    Client,
};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::config::BackupConfig;
use crate::framework::{Page, PageSource, PaginatedFetcher, RawRecord, RetryPolicy, SourceError};

const DIFFERENTIAL_SUFFIX: &str = "_Differential/";

fn classify<E, R>(context: &str, err: SdkError<E, R>) -> SourceError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: std::fmt::Debug,
{
    let message = format!("{context}: {}", DisplayErrorContext(&err));
    match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) => SourceError::Transient(message),
        _ => match err.code() {
            Some(
                "SlowDown"
                | "Throttling"
                | "ThrottlingException"
                | "RequestLimitExceeded"
                | "TooManyRequestsException",
            ) => SourceError::RateLimited(message),
            Some("InternalError" | "ServiceUnavailable" | "RequestTimeout") => SourceError::Transient(message),
            _ => SourceError::Permanent(message),
        },
    }
}

/// What a listing page contains
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Listing {
    /// Immediate sub-folders of the prefix, as `{ "prefix": ... }`
    Folders(String),
    /// Every object key below the prefix, as `{ "key": ... }`
    Keys(String),
}

/// Read access to a bucket of backup folders and event files
#[async_trait]
pub trait ObjectSource: Send + Sync {
    /// Immediate sub-folders of `prefix`, in listing order
    async fn list_folders(&self, prefix: &str) -> Result<Vec<String>, SourceError>;

    /// All object keys below `prefix`
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, SourceError>;

    async fn get_bytes(&self, key: &str) -> Result<Vec<u8>, SourceError>;
}

/// Bucket-scoped object store client
#[derive(Clone)]
pub struct ObjectStore {
    client: Client,
    bucket: String,
    retry: RetryPolicy,
}

impl ObjectStore {
    pub async fn new(config: &BackupConfig, retry: RetryPolicy) -> anyhow::Result<Self> {
        let bucket = config.require_bucket()?.to_string();

        let mut builder = match (&config.access_key, &config.secret_key) {
            (Some(access_key), Some(secret_key)) => {
                let credentials = Credentials::new(access_key, secret_key, None, None, "opsfeed-backup");
                aws_sdk_s3::Config::builder()
                    .behavior_version_latest()
                    .credentials_provider(credentials)
                    .region(Region::new(config.region.clone()))
            },
            _ => {
                let shared = aws_config::defaults(aws_config::BehaviorVersion::latest())
                    .region(Region::new(config.region.clone()))
                    .load()
                    .await;
                aws_sdk_s3::config::Builder::from(&shared)
            },
        };
        builder = builder.force_path_style(config.path_style);
        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint);
        }

        info!("Object store client initialized for bucket: {}", bucket);
        Ok(Self::from_client(Client::from_conf(builder.build()), bucket, retry))
    }

    pub fn from_client(client: Client, bucket: impl Into<String>, retry: RetryPolicy) -> Self {
        Self {
            client,
            bucket: bucket.into(),
            retry,
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}

#[async_trait]
impl PageSource for ObjectStore {
    type Filter = Listing;

    async fn list_page(&self, filter: &Listing, cursor: Option<&str>) -> Result<Page, SourceError> {
        let mut request = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .set_continuation_token(cursor.map(str::to_owned));
        request = match filter {
            Listing::Folders(prefix) => request.prefix(prefix).delimiter("/"),
            Listing::Keys(prefix) => request.prefix(prefix),
        };

        let response = request.send().await.map_err(|e| classify("list_objects_v2", e))?;

        let records: Vec<RawRecord> = match filter {
            Listing::Folders(_) => response
                .common_prefixes()
                .iter()
                .filter_map(|p| p.prefix())
                .filter_map(|p| RawRecord::from_value(json!({ "prefix": p })))
                .collect(),
            Listing::Keys(_) => response
                .contents()
                .iter()
                .filter_map(|o| o.key())
                .filter_map(|k| RawRecord::from_value(json!({ "key": k })))
                .collect(),
        };

        let next_cursor = if response.is_truncated().unwrap_or(false) {
            response.next_continuation_token().map(str::to_owned)
        } else {
            None
        };
        debug!(bucket = %self.bucket, entries = records.len(), "Listed objects");
        Ok(Page::new(records, next_cursor))
    }
}

#[async_trait]
impl ObjectSource for ObjectStore {
    async fn list_folders(&self, prefix: &str) -> Result<Vec<String>, SourceError> {
        let records = PaginatedFetcher::new(self, self.retry.clone())
            .collect_all(&Listing::Folders(prefix.to_string()))
            .await?;
        Ok(records
            .iter()
            .filter_map(|r| r.get_str("prefix").map(str::to_owned))
            .collect())
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, SourceError> {
        let records = PaginatedFetcher::new(self, self.retry.clone())
            .collect_all(&Listing::Keys(prefix.to_string()))
            .await?;
        Ok(records
            .iter()
            .filter_map(|r| r.get_str("key").map(str::to_owned))
            .collect())
    }

    async fn get_bytes(&self, key: &str) -> Result<Vec<u8>, SourceError> {
        self.retry
            .run("get_object", || async {
                let object = self
                    .client
                    .get_object()
                    .bucket(&self.bucket)
                    .key(key)
                    .send()
                    .await
                    .map_err(|e| classify("get_object", e))?;
                let body = object
                    .body
                    .collect()
                    .await
                    .map_err(|e| SourceError::Transient(format!("reading {key}: {e}")))?;
                Ok(body.into_bytes().to_vec())
            })
            .await
    }
}

/// Dedup key of a differential folder: `backup/2024-01-01_Differential/` -> `2024-01-01_`
///
/// `None` for folders that are not differential exports.
pub fn folder_key(folder: &str) -> Option<String> {
    if !folder.ends_with(DIFFERENTIAL_SUFFIX) {
        return None;
    }
    let name = folder.trim_end_matches('/').rsplit('/').next()?;
    let stem = name.split("_Differential").next()?;
    Some(format!("{stem}_"))
}

/// Parse a CSV export: lowercased headers, empty cells as null
pub fn parse_csv(bytes: &[u8]) -> Result<Vec<RawRecord>, SourceError> {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(bytes);

    let headers: Vec<String> = reader
        .headers()
        .map_err(|e| SourceError::Unit(format!("unreadable CSV header: {e}")))?
        .iter()
        .map(|h| h.trim().to_lowercase())
        .collect();

    let mut records = Vec::new();
    for (line, row) in reader.records().enumerate() {
        let row = row.map_err(|e| SourceError::Unit(format!("unreadable CSV row {}: {e}", line + 2)))?;
        let record: RawRecord = headers
            .iter()
            .enumerate()
            .map(|(i, name)| {
                let value = match row.get(i) {
                    Some(cell) if !cell.is_empty() => Value::String(cell.to_string()),
                    _ => Value::Null,
                };
                (name.clone(), value)
            })
            .collect();
        records.push(record);
    }
    Ok(records)
}

/// Parse newline-delimited JSON events; undecodable or non-object lines are dropped
pub fn parse_json_lines(bytes: &[u8]) -> Vec<RawRecord> {
    String::from_utf8_lossy(bytes)
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .filter_map(|(n, line)| {
            match serde_json::from_str::<Value>(line).ok().and_then(RawRecord::from_value) {
                Some(record) => Some(record),
                None => {
                    warn!(line = n + 1, "Dropping undecodable event");
                    None
                },
            }
        })
        .collect()
}

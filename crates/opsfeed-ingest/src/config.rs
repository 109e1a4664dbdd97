//! Ingestion configuration
//!
//! Everything a run needs is loaded once from `OPSFEED_*` environment
//! variables into [`IngestConfig`] and passed down explicitly.

use anyhow::{bail, Context};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::framework::RetryPolicy;

fn var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parsed<T: FromStr>(name: &str, default: T) -> anyhow::Result<T>
where
    T::Err: std::fmt::Display,
{
    match var(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid {}={:?}: {}", name, raw, e)),
        None => Ok(default),
    }
}

/// Retry and backoff settings for source calls
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 2_000,
            max_delay_ms: 60_000,
        }
    }
}

impl RetryConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            max_attempts: parsed("OPSFEED_RETRY_MAX_ATTEMPTS", defaults.max_attempts)?,
            base_delay_ms: parsed("OPSFEED_RETRY_BASE_DELAY_MS", defaults.base_delay_ms)?,
            max_delay_ms: parsed("OPSFEED_RETRY_MAX_DELAY_MS", defaults.max_delay_ms)?,
        })
    }

    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
        )
    }
}

/// Contact-center HTTP gateway
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectConfig {
    pub api_url: Option<String>,
    #[serde(skip_serializing)]
    pub api_token: Option<String>,
    pub instance_id: Option<String>,
    pub page_size: u32,
}

impl ConnectConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            api_url: var("OPSFEED_CONNECT_API_URL"),
            api_token: var("OPSFEED_CONNECT_API_TOKEN"),
            instance_id: var("OPSFEED_CONNECT_INSTANCE_ID"),
            page_size: parsed("OPSFEED_CONNECT_PAGE_SIZE", 100)?,
        })
    }

    pub fn require_url(&self) -> anyhow::Result<&str> {
        self.api_url
            .as_deref()
            .context("OPSFEED_CONNECT_API_URL must be set for contact-center jobs")
    }

    pub fn require_instance(&self) -> anyhow::Result<&str> {
        self.instance_id
            .as_deref()
            .context("OPSFEED_CONNECT_INSTANCE_ID must be set for contact-center jobs")
    }
}

/// Object store holding CRM differential backups and contact trace records
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    pub bucket: Option<String>,
    pub prefix: String,
    pub ctr_prefix: String,
    pub region: String,
    pub endpoint: Option<String>,
    #[serde(skip_serializing)]
    pub access_key: Option<String>,
    #[serde(skip_serializing)]
    pub secret_key: Option<String>,
    pub path_style: bool,
}

impl BackupConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            bucket: var("OPSFEED_BACKUP_BUCKET"),
            prefix: var("OPSFEED_BACKUP_PREFIX").unwrap_or_else(|| "backup/".to_string()),
            ctr_prefix: var("OPSFEED_CTR_PREFIX").unwrap_or_else(|| "ctr/".to_string()),
            region: var("OPSFEED_S3_REGION").unwrap_or_else(|| "us-east-1".to_string()),
            endpoint: var("OPSFEED_S3_ENDPOINT"),
            access_key: var("OPSFEED_S3_ACCESS_KEY").or_else(|| var("AWS_ACCESS_KEY_ID")),
            secret_key: var("OPSFEED_S3_SECRET_KEY").or_else(|| var("AWS_SECRET_ACCESS_KEY")),
            path_style: parsed("OPSFEED_S3_PATH_STYLE", false)?,
        })
    }

    pub fn require_bucket(&self) -> anyhow::Result<&str> {
        self.bucket
            .as_deref()
            .context("OPSFEED_BACKUP_BUCKET must be set for object-store jobs")
    }
}

/// Spreadsheet API holding the staffing tracker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SheetsConfig {
    pub api_url: String,
    #[serde(skip_serializing)]
    pub token: Option<String>,
    pub sheet_id: Option<String>,
    pub staffing_range: String,
    pub goals_range: String,
}

impl SheetsConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            api_url: var("OPSFEED_SHEETS_API_URL")
                .unwrap_or_else(|| "https://sheets.googleapis.com".to_string()),
            token: var("OPSFEED_SHEETS_TOKEN"),
            sheet_id: var("OPSFEED_SHEET_ID"),
            staffing_range: var("OPSFEED_STAFFING_RANGE").unwrap_or_else(|| "Staffing".to_string()),
            goals_range: var("OPSFEED_GOALS_RANGE").unwrap_or_else(|| "Targets".to_string()),
        })
    }

    pub fn require_sheet(&self) -> anyhow::Result<&str> {
        self.sheet_id
            .as_deref()
            .context("OPSFEED_SHEET_ID must be set for staffing jobs")
    }
}

/// Main ingestion configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    #[serde(skip_serializing)]
    pub database_url: Option<String>,
    #[serde(skip_serializing)]
    pub ledger_database_url: Option<String>,
    pub db_max_connections: u32,
    /// IANA name of the reporting timezone
    pub timezone: String,
    pub detail_concurrency: usize,
    pub http_timeout_secs: u64,
    pub retry: RetryConfig,
    pub connect: ConnectConfig,
    pub backup: BackupConfig,
    pub sheets: SheetsConfig,
}

impl IngestConfig {
    /// Load from the environment and validate
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = var("OPSFEED_DATABASE_URL");
        let config = Self {
            ledger_database_url: var("OPSFEED_LEDGER_DATABASE_URL").or_else(|| database_url.clone()),
            database_url,
            db_max_connections: parsed("OPSFEED_DB_MAX_CONNECTIONS", 5)?,
            timezone: var("OPSFEED_TIMEZONE").unwrap_or_else(|| "America/New_York".to_string()),
            detail_concurrency: parsed("OPSFEED_DETAIL_CONCURRENCY", 8)?,
            http_timeout_secs: parsed("OPSFEED_HTTP_TIMEOUT_SECS", 30)?,
            retry: RetryConfig::from_env()?,
            connect: ConnectConfig::from_env()?,
            backup: BackupConfig::from_env()?,
            sheets: SheetsConfig::from_env()?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        self.tz()?;
        if self.db_max_connections == 0 {
            bail!("OPSFEED_DB_MAX_CONNECTIONS must be greater than 0");
        }
        if self.detail_concurrency == 0 {
            bail!("OPSFEED_DETAIL_CONCURRENCY must be greater than 0");
        }
        if self.http_timeout_secs == 0 {
            bail!("OPSFEED_HTTP_TIMEOUT_SECS must be greater than 0");
        }
        if self.retry.max_attempts == 0 {
            bail!("OPSFEED_RETRY_MAX_ATTEMPTS must be greater than 0");
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            bail!("OPSFEED_RETRY_BASE_DELAY_MS must not exceed OPSFEED_RETRY_MAX_DELAY_MS");
        }
        if self.connect.page_size == 0 || self.connect.page_size > 100 {
            bail!("OPSFEED_CONNECT_PAGE_SIZE must be between 1 and 100");
        }
        Ok(())
    }

    pub fn tz(&self) -> anyhow::Result<Tz> {
        self.timezone
            .parse::<Tz>()
            .map_err(|_| opsfeed_common::FeedError::InvalidTimezone(self.timezone.clone()).into())
    }

    /// Warehouse URL, required for anything but a dry run
    pub fn require_database_url(&self) -> anyhow::Result<&str> {
        self.database_url
            .as_deref()
            .context("OPSFEED_DATABASE_URL must be set (or pass --dry-run)")
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}

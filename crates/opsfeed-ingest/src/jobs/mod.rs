//! Concrete ingestion jobs and the registry that builds them from config

pub mod agent_metrics;
pub mod backup;
pub mod contacts;
pub mod ctr_events;
pub mod dimensions;
pub mod staffing;

use anyhow::Context;
use opsfeed_common::FeedError;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::config::IngestConfig;
use crate::framework::{DetailSource, IngestJob, PageSource};
use crate::sources::{GatewayClient, HttpDetailSource, HttpPageSource, ListRequest, ObjectStore, SheetsSource};

pub use agent_metrics::AgentMetricsJob;
pub use backup::BackupJob;
pub use contacts::{ContactRecordsJob, ContactWindow};
pub use ctr_events::TraceRecordsJob;
pub use dimensions::DimensionJob;
pub use staffing::SheetJob;

/// Gateway routes: (path, items or detail field)
const SEARCH_CONTACTS: (&str, &str) = ("contacts/search", "Contacts");
const DESCRIBE_CONTACT: (&str, &str) = ("contacts", "Contact");
const LIST_USERS: (&str, &str) = ("users", "UserSummaryList");
const DESCRIBE_USER: (&str, &str) = ("users", "User");
const LIST_QUEUES: (&str, &str) = ("queues", "QueueSummaryList");
const METRIC_DATA: (&str, &str) = ("metrics/data", "MetricResults");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobKind {
    ContactRecords,
    ContactTraceRecords,
    AgentMetrics,
    QueueDimension,
    UserDimension,
    MatterBackup,
    TaskBackup,
    UserBackup,
    StaffingEmployees,
    StaffingGoals,
}

impl JobKind {
    pub const ALL: [JobKind; 10] = [
        JobKind::ContactRecords,
        JobKind::ContactTraceRecords,
        JobKind::AgentMetrics,
        JobKind::QueueDimension,
        JobKind::UserDimension,
        JobKind::MatterBackup,
        JobKind::TaskBackup,
        JobKind::UserBackup,
        JobKind::StaffingEmployees,
        JobKind::StaffingGoals,
    ];

    pub fn name(self) -> &'static str {
        match self {
            JobKind::ContactRecords => contacts::JOB_NAME,
            JobKind::ContactTraceRecords => ctr_events::JOB_NAME,
            JobKind::AgentMetrics => agent_metrics::JOB_NAME,
            JobKind::QueueDimension => dimensions::QUEUE_JOB_NAME,
            JobKind::UserDimension => dimensions::USER_JOB_NAME,
            JobKind::MatterBackup => backup::MATTER_JOB_NAME,
            JobKind::TaskBackup => backup::TASK_JOB_NAME,
            JobKind::UserBackup => backup::USER_JOB_NAME,
            JobKind::StaffingEmployees => staffing::EMPLOYEES_JOB_NAME,
            JobKind::StaffingGoals => staffing::GOALS_JOB_NAME,
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            JobKind::ContactRecords => "Contacts of the previous two hours, with details",
            JobKind::ContactTraceRecords => "Contact trace record events from the object store",
            JobKind::AgentMetrics => "Yesterday's hourly agent metrics",
            JobKind::QueueDimension => "Queue dimension snapshot (upsert)",
            JobKind::UserDimension => "Contact-center user dimension snapshot (upsert)",
            JobKind::MatterBackup => "CRM matter differential backups",
            JobKind::TaskBackup => "CRM task differential backups",
            JobKind::UserBackup => "CRM user differential backups",
            JobKind::StaffingEmployees => "Employee sheet snapshot",
            JobKind::StaffingGoals => "Weekly productivity goals sheet (upsert)",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for JobKind {
    type Err = FeedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobKind::ALL
            .into_iter()
            .find(|kind| kind.name() == s)
            .ok_or_else(|| FeedError::UnknownJob(s.to_string()))
    }
}

fn gateway(config: &IngestConfig) -> anyhow::Result<GatewayClient> {
    GatewayClient::new(
        config.connect.require_url()?,
        config.connect.api_token.clone(),
        config.http_timeout(),
    )
    .context("Failed to build contact-center HTTP client")
}

fn listing(
    client: &GatewayClient,
    config: &IngestConfig,
    route: (&str, &str),
) -> Arc<dyn PageSource<Filter = ListRequest>> {
    Arc::new(HttpPageSource::new(
        client.clone(),
        route.0,
        route.1,
        config.connect.page_size,
    ))
}

fn lookup(client: &GatewayClient, route: (&str, &str)) -> Arc<dyn DetailSource> {
    Arc::new(HttpDetailSource::new(client.clone(), route.0, route.1))
}

async fn object_store(config: &IngestConfig) -> anyhow::Result<Arc<ObjectStore>> {
    Ok(Arc::new(ObjectStore::new(&config.backup, config.retry.policy()).await?))
}

fn sheets(config: &IngestConfig) -> anyhow::Result<Arc<SheetsSource>> {
    let client = GatewayClient::new(
        &config.sheets.api_url,
        config.sheets.token.clone(),
        config.http_timeout(),
    )
    .context("Failed to build spreadsheet HTTP client")?;
    Ok(Arc::new(SheetsSource::new(
        client,
        config.sheets.require_sheet()?,
        config.retry.policy(),
    )))
}

/// Build a job with its live sources
pub async fn build_job(kind: JobKind, config: &IngestConfig) -> anyhow::Result<Box<dyn IngestJob>> {
    let retry = config.retry.policy();

    let job: Box<dyn IngestJob> = match kind {
        JobKind::ContactRecords => {
            let client = gateway(config)?;
            Box::new(ContactRecordsJob::new(
                listing(&client, config, SEARCH_CONTACTS),
                lookup(&client, DESCRIBE_CONTACT),
                config.connect.require_instance()?,
                config.tz()?,
                retry,
                config.detail_concurrency,
            ))
        },
        JobKind::ContactTraceRecords => Box::new(TraceRecordsJob::new(
            object_store(config).await?,
            config.backup.ctr_prefix.clone(),
        )),
        JobKind::AgentMetrics => {
            let client = gateway(config)?;
            Box::new(AgentMetricsJob::new(
                listing(&client, config, LIST_USERS),
                listing(&client, config, METRIC_DATA),
                config.connect.require_instance()?,
                config.tz()?,
                retry,
            ))
        },
        JobKind::QueueDimension => {
            let client = gateway(config)?;
            Box::new(DimensionJob::queues(
                listing(&client, config, LIST_QUEUES),
                config.connect.require_instance()?,
                retry,
            ))
        },
        JobKind::UserDimension => {
            let client = gateway(config)?;
            Box::new(DimensionJob::users(
                listing(&client, config, LIST_USERS),
                lookup(&client, DESCRIBE_USER),
                config.connect.require_instance()?,
                retry,
                config.detail_concurrency,
            ))
        },
        JobKind::MatterBackup => Box::new(BackupJob::matters(
            object_store(config).await?,
            config.backup.prefix.clone(),
        )),
        JobKind::TaskBackup => Box::new(BackupJob::tasks(
            object_store(config).await?,
            config.backup.prefix.clone(),
        )),
        JobKind::UserBackup => Box::new(BackupJob::users(
            object_store(config).await?,
            config.backup.prefix.clone(),
        )),
        JobKind::StaffingEmployees => Box::new(SheetJob::employees(
            sheets(config)?,
            config.sheets.staffing_range.clone(),
        )),
        JobKind::StaffingGoals => Box::new(SheetJob::goals(sheets(config)?, config.sheets.goals_range.clone())),
    };
    Ok(job)
}

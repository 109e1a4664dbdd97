//! Opsfeed Ingest Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Scheduled batch jobs that pull operational data from the contact-center
//! gateway, CRM differential backups and the staffing sheets into the
//! warehouse, built on one idempotent incremental-ingestion framework.
//!
//! # Jobs
//!
//! - **Contact center**: contact records, trace record events, agent metrics,
//!   queue and user dimensions
//! - **CRM backups**: matters, tasks and users from `_Differential/` folders
//! - **Staffing sheets**: employees and weekly goals
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use opsfeed_ingest::config::IngestConfig;
//! use opsfeed_ingest::framework::{JobDriver, LogSink, MemoryLedger};
//! use opsfeed_ingest::jobs::{build_job, JobKind};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = IngestConfig::from_env()?;
//!     let job = build_job(JobKind::QueueDimension, &config).await?;
//!     let mut driver = JobDriver::new(
//!         Arc::new(MemoryLedger::new(job.name())),
//!         Arc::new(LogSink::new()),
//!         config.tz()?,
//!     );
//!     let summary = driver.run(job.as_ref()).await?;
//!     println!("{} rows", summary.rows_delivered);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod framework;
pub mod jobs;
pub mod sources;

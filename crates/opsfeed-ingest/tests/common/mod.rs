//! Common test utilities for opsfeed-ingest integration tests
//!
//! - [`RecordingSink`]: in-memory [`BatchSink`] that records every call and
//!   can be told to fail
//! - [`MemoryObjects`]: in-memory [`ObjectSource`] laid out like the backup
//!   bucket
//! - [`TestPostgres`]: throwaway PostgreSQL container (needs Docker)

#![allow(dead_code)]

use anyhow::{Context, Result};
use async_trait::async_trait;
use opsfeed_ingest::framework::{
    BatchSink, RawRecord, SinkError, SourceError, StagingRow, TableSchema, UpsertOutcome,
};
use opsfeed_ingest::sources::ObjectSource;
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use testcontainers::{core::IntoContainerPort, runners::AsyncRunner, ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;

pub fn record(value: Value) -> RawRecord {
    RawRecord::from_value(value).unwrap()
}

// ============================================================================
// Recording sink
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct Append {
    pub table: String,
    pub rows: Vec<StagingRow>,
}

#[derive(Default)]
pub struct RecordingSink {
    appends: Mutex<Vec<Append>>,
    promotions: Mutex<Vec<String>>,
    dimension: Mutex<HashMap<Vec<String>, StagingRow>>,
    failing_appends: AtomicUsize,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` appends with a shape error
    pub fn fail_next_appends(&self, n: usize) {
        self.failing_appends.store(n, Ordering::SeqCst);
    }

    pub fn appends(&self) -> Vec<Append> {
        self.appends.lock().unwrap().clone()
    }

    pub fn appended_rows(&self) -> Vec<StagingRow> {
        self.appends().into_iter().flat_map(|a| a.rows).collect()
    }

    pub fn promotions(&self) -> Vec<String> {
        self.promotions.lock().unwrap().clone()
    }

    pub fn dimension_rows(&self) -> usize {
        self.dimension.lock().unwrap().len()
    }
}

#[async_trait]
impl BatchSink for RecordingSink {
    async fn bulk_append(&self, schema: &TableSchema, rows: &[StagingRow]) -> Result<u64, SinkError> {
        let remaining = self.failing_appends.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_appends.store(remaining - 1, Ordering::SeqCst);
            return Err(SinkError::RowShape {
                table: schema.table().to_string(),
                expected: 0,
                actual: rows.len(),
            });
        }
        self.appends.lock().unwrap().push(Append {
            table: schema.table().to_string(),
            rows: rows.to_vec(),
        });
        Ok(rows.len() as u64)
    }

    async fn promote(&self, procedure: &str) -> Result<(), SinkError> {
        self.promotions.lock().unwrap().push(procedure.to_string());
        Ok(())
    }

    async fn upsert(
        &self,
        schema: &TableSchema,
        key_columns: &[String],
        row: &StagingRow,
    ) -> Result<UpsertOutcome, SinkError> {
        let key = key_columns
            .iter()
            .map(|k| {
                schema
                    .index_of(k)
                    .and_then(|i| row.get(i))
                    .map(|c| c.to_string())
                    .ok_or_else(|| SinkError::UnknownKeyColumn(k.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let previous = self.dimension.lock().unwrap().insert(key, row.clone());
        Ok(match previous {
            Some(_) => UpsertOutcome::Updated,
            None => UpsertOutcome::Inserted,
        })
    }
}

// ============================================================================
// In-memory object store
// ============================================================================

/// Objects keyed by full path; folders are derived from the keys
#[derive(Default)]
pub struct MemoryObjects {
    objects: BTreeMap<String, Vec<u8>>,
    unreadable: BTreeSet<String>,
    reads: Mutex<HashMap<String, usize>>,
}

impl MemoryObjects {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, body: &str) -> Self {
        self.objects.insert(key.to_string(), body.as_bytes().to_vec());
        self
    }

    /// Listed like any other object, but every read fails
    pub fn unreadable(mut self, key: &str) -> Self {
        self.objects.insert(key.to_string(), Vec::new());
        self.unreadable.insert(key.to_string());
        self
    }

    /// How often `key` was downloaded
    pub fn reads(&self, key: &str) -> usize {
        self.reads.lock().unwrap().get(key).copied().unwrap_or(0)
    }
}

#[async_trait]
impl ObjectSource for MemoryObjects {
    async fn list_folders(&self, prefix: &str) -> Result<Vec<String>, SourceError> {
        let folders: BTreeSet<String> = self
            .objects
            .keys()
            .filter_map(|key| key.strip_prefix(prefix))
            .filter_map(|rest| rest.split_once('/'))
            .map(|(folder, _)| format!("{prefix}{folder}/"))
            .collect();
        Ok(folders.into_iter().collect())
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, SourceError> {
        Ok(self
            .objects
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn get_bytes(&self, key: &str) -> Result<Vec<u8>, SourceError> {
        *self.reads.lock().unwrap().entry(key.to_string()).or_default() += 1;
        if self.unreadable.contains(key) {
            return Err(SourceError::Permanent(format!("AccessDenied: {key}")));
        }
        self.objects
            .get(key)
            .cloned()
            .ok_or_else(|| SourceError::Permanent(format!("NoSuchKey: {key}")))
    }
}

// ============================================================================
// PostgreSQL Test Container
// ============================================================================

pub struct TestPostgres {
    _container: ContainerAsync<Postgres>,
    pool: PgPool,
}

impl TestPostgres {
    pub async fn start() -> Result<Self> {
        let container = Postgres::default()
            .with_tag("16-alpine")
            .start()
            .await
            .context("Failed to start PostgreSQL container")?;

        let host = container.get_host().await.context("Failed to get container host")?;
        let port = container
            .get_host_port_ipv4(5432.tcp())
            .await
            .context("Failed to get container port")?;

        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(30))
            .connect(&format!("postgresql://postgres:postgres@{}:{}/postgres", host, port))
            .await
            .context("Failed to connect to PostgreSQL")?;

        Ok(Self {
            _container: container,
            pool,
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

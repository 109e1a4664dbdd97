//! Dedup ledger
//!
//! Durable set of work-unit keys that completed ingestion, namespaced per
//! job. The only write is an atomic conditional insert: a mark is created
//! exactly once and never overwritten, so two racing claims of the same key
//! produce one `Claimed` and one `AlreadyClaimed`.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{PgPool, Row};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, info};

use super::types::ProcessedMark;

const LEDGER_TABLE: &str = "ingest_processed_marks";

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Ledger database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Ledger state poisoned")]
    Poisoned,
}

/// Result of a conditional claim
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    Claimed,
    AlreadyClaimed,
}

impl ClaimOutcome {
    pub fn is_claimed(self) -> bool {
        matches!(self, ClaimOutcome::Claimed)
    }
}

#[async_trait]
pub trait DedupLedger: Send + Sync {
    /// Job namespace; keys never collide across namespaces
    fn namespace(&self) -> &str;

    /// Atomically create the mark if absent
    async fn try_claim(&self, key: &str) -> Result<ClaimOutcome, LedgerError>;

    async fn is_claimed(&self, key: &str) -> Result<bool, LedgerError>;

    /// Every claimed key of the namespace, for batch pre-filtering
    async fn scan_claimed(&self) -> Result<HashSet<String>, LedgerError>;
}

/// Postgres-backed ledger
#[derive(Clone)]
pub struct PgLedger {
    pool: PgPool,
    namespace: String,
}

impl PgLedger {
    pub fn new(pool: PgPool, namespace: impl Into<String>) -> Self {
        Self {
            pool,
            namespace: namespace.into(),
        }
    }

    /// Create the marks table when it does not exist yet
    pub async fn ensure_schema(pool: &PgPool) -> Result<(), LedgerError> {
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {LEDGER_TABLE} (
                namespace TEXT NOT NULL,
                work_unit_key TEXT NOT NULL,
                processed_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                PRIMARY KEY (namespace, work_unit_key)
            )
            "#
        ))
        .execute(pool)
        .await?;

        info!(table = LEDGER_TABLE, "Ledger schema ready");
        Ok(())
    }

    /// Full mark for a key, if any
    pub async fn mark(&self, key: &str) -> Result<Option<ProcessedMark>, LedgerError> {
        let row = sqlx::query(&format!(
            "SELECT processed_at FROM {LEDGER_TABLE} WHERE namespace = $1 AND work_unit_key = $2"
        ))
        .bind(&self.namespace)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| {
            Ok(ProcessedMark {
                namespace: self.namespace.clone(),
                key: key.to_string(),
                processed_at: r.try_get("processed_at")?,
            })
        })
        .transpose()
    }
}

#[async_trait]
impl DedupLedger for PgLedger {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn try_claim(&self, key: &str) -> Result<ClaimOutcome, LedgerError> {
        let result = sqlx::query(&format!(
            r#"
            INSERT INTO {LEDGER_TABLE} (namespace, work_unit_key, processed_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (namespace, work_unit_key) DO NOTHING
            "#
        ))
        .bind(&self.namespace)
        .bind(key)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        let outcome = if result.rows_affected() == 1 {
            ClaimOutcome::Claimed
        } else {
            ClaimOutcome::AlreadyClaimed
        };
        debug!(namespace = %self.namespace, key, ?outcome, "Claim attempted");
        Ok(outcome)
    }

    async fn is_claimed(&self, key: &str) -> Result<bool, LedgerError> {
        let exists: bool = sqlx::query_scalar(&format!(
            "SELECT EXISTS (SELECT 1 FROM {LEDGER_TABLE} WHERE namespace = $1 AND work_unit_key = $2)"
        ))
        .bind(&self.namespace)
        .bind(key)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn scan_claimed(&self) -> Result<HashSet<String>, LedgerError> {
        let keys: Vec<String> = sqlx::query_scalar(&format!(
            "SELECT work_unit_key FROM {LEDGER_TABLE} WHERE namespace = $1"
        ))
        .bind(&self.namespace)
        .fetch_all(&self.pool)
        .await?;
        Ok(keys.into_iter().collect())
    }
}

/// In-process ledger with the same semantics, for dry runs and tests
#[derive(Debug, Default)]
pub struct MemoryLedger {
    namespace: String,
    marks: Mutex<HashMap<String, ProcessedMark>>,
}

impl MemoryLedger {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            marks: Mutex::new(HashMap::new()),
        }
    }

    /// Seed keys as already processed
    pub fn with_claimed<I, S>(self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if let Ok(mut marks) = self.marks.lock() {
            for key in keys {
                let key = key.into();
                marks.insert(
                    key.clone(),
                    ProcessedMark {
                        namespace: self.namespace.clone(),
                        key,
                        processed_at: Utc::now(),
                    },
                );
            }
        }
        self
    }

    pub fn marks(&self) -> Vec<ProcessedMark> {
        self.marks
            .lock()
            .map(|marks| marks.values().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl DedupLedger for MemoryLedger {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn try_claim(&self, key: &str) -> Result<ClaimOutcome, LedgerError> {
        let mut marks = self.marks.lock().map_err(|_| LedgerError::Poisoned)?;
        if marks.contains_key(key) {
            return Ok(ClaimOutcome::AlreadyClaimed);
        }
        marks.insert(
            key.to_string(),
            ProcessedMark {
                namespace: self.namespace.clone(),
                key: key.to_string(),
                processed_at: Utc::now(),
            },
        );
        Ok(ClaimOutcome::Claimed)
    }

    async fn is_claimed(&self, key: &str) -> Result<bool, LedgerError> {
        let marks = self.marks.lock().map_err(|_| LedgerError::Poisoned)?;
        Ok(marks.contains_key(key))
    }

    async fn scan_claimed(&self) -> Result<HashSet<String>, LedgerError> {
        let marks = self.marks.lock().map_err(|_| LedgerError::Poisoned)?;
        Ok(marks.keys().cloned().collect())
    }
}

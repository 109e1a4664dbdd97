//! Batch sink
//!
//! Appends staging rows to the warehouse, calls the promotion procedure and
//! performs keyed upserts for dimension tables. Every identifier interpolated
//! into SQL is validated first; values are always bound.

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use opsfeed_common::{ident, FeedError};
use sqlx::{PgPool, Postgres, QueryBuilder};
use thiserror::Error;
use tracing::{debug, info};

use super::schema::{ColumnType, TableSchema};
use super::types::{Cell, StagingRow};

/// Postgres accepts at most this many bind parameters per statement
const MAX_BIND_PARAMS: usize = 65_535;

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Warehouse error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Invalid schema: {0}")]
    Schema(#[from] FeedError),

    #[error("Row has {actual} cells, schema {table} has {expected} columns")]
    RowShape {
        table: String,
        expected: usize,
        actual: usize,
    },

    #[error("Key column {0} is not part of the schema")]
    UnknownKeyColumn(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

/// Result of handing one unit's rows to the sink
#[derive(Debug)]
pub enum DeliveryOutcome {
    Delivered { rows: u64 },
    Failed(SinkError),
}

impl DeliveryOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, DeliveryOutcome::Delivered { .. })
    }
}

#[async_trait]
pub trait BatchSink: Send + Sync {
    /// Append rows to the schema's table; all or nothing
    async fn bulk_append(&self, schema: &TableSchema, rows: &[StagingRow]) -> Result<u64, SinkError>;

    /// Run a parameterless stored procedure
    async fn promote(&self, procedure: &str) -> Result<(), SinkError>;

    /// Update the row matching `key_columns`, insert it when none matches
    async fn upsert(
        &self,
        schema: &TableSchema,
        key_columns: &[String],
        row: &StagingRow,
    ) -> Result<UpsertOutcome, SinkError>;
}

/// Append then promote; an empty batch delivers nothing and skips promotion
pub async fn deliver<K>(sink: &K, schema: &TableSchema, rows: &[StagingRow]) -> DeliveryOutcome
where
    K: BatchSink + ?Sized,
{
    if rows.is_empty() {
        return DeliveryOutcome::Delivered { rows: 0 };
    }

    let appended = match sink.bulk_append(schema, rows).await {
        Ok(n) => n,
        Err(e) => return DeliveryOutcome::Failed(e),
    };

    if let Some(procedure) = schema.promote_procedure() {
        if let Err(e) = sink.promote(procedure).await {
            return DeliveryOutcome::Failed(e);
        }
        debug!(procedure, "Promotion complete");
    }

    DeliveryOutcome::Delivered { rows: appended }
}

/// Upsert each row by key, then promote; stops at the first failure
pub async fn deliver_dimension<K>(
    sink: &K,
    schema: &TableSchema,
    key_columns: &[String],
    rows: &[StagingRow],
) -> DeliveryOutcome
where
    K: BatchSink + ?Sized,
{
    let mut inserted = 0u64;
    let mut updated = 0u64;
    for row in rows {
        match sink.upsert(schema, key_columns, row).await {
            Ok(UpsertOutcome::Inserted) => inserted += 1,
            Ok(UpsertOutcome::Updated) => updated += 1,
            Err(e) => return DeliveryOutcome::Failed(e),
        }
    }
    info!(table = %schema.table(), inserted, updated, "Dimension upsert complete");

    if !rows.is_empty() {
        if let Some(procedure) = schema.promote_procedure() {
            if let Err(e) = sink.promote(procedure).await {
                return DeliveryOutcome::Failed(e);
            }
        }
    }

    DeliveryOutcome::Delivered {
        rows: inserted + updated,
    }
}

fn check_shape(schema: &TableSchema, row: &StagingRow) -> Result<(), SinkError> {
    if row.len() != schema.columns().len() {
        return Err(SinkError::RowShape {
            table: schema.table().to_string(),
            expected: schema.columns().len(),
            actual: row.len(),
        });
    }
    Ok(())
}

fn key_indices(schema: &TableSchema, key_columns: &[String]) -> Result<Vec<usize>, SinkError> {
    key_columns
        .iter()
        .map(|k| {
            schema
                .index_of(k)
                .ok_or_else(|| SinkError::UnknownKeyColumn(k.clone()))
        })
        .collect()
}

/// Bind a cell typed by its column, so nulls carry the right parameter type
macro_rules! push_cell {
    ($target:expr, $cell:expr, $kind:expr) => {
        match ($cell, $kind) {
            (Cell::Text(s), _) => $target.push_bind(s.clone()),
            (Cell::Int(i), _) => $target.push_bind(*i),
            (Cell::Float(f), _) => $target.push_bind(*f),
            (Cell::Timestamp(ts), _) => $target.push_bind(*ts),
            (Cell::Date(d), _) => $target.push_bind(*d),
            (Cell::Null, ColumnType::Timestamp { .. }) => $target.push_bind(None::<NaiveDateTime>),
            (Cell::Null, ColumnType::Date { .. }) => $target.push_bind(None::<NaiveDate>),
            (Cell::Null, ColumnType::Boolean | ColumnType::Integer) => $target.push_bind(None::<i64>),
            (Cell::Null, ColumnType::Float { .. }) => $target.push_bind(None::<f64>),
            (Cell::Null, ColumnType::Text | ColumnType::LowerText) => $target.push_bind(None::<String>),
        }
    };
}

/// Postgres-protocol warehouse sink
#[derive(Clone)]
pub struct PgSink {
    pool: PgPool,
}

impl PgSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BatchSink for PgSink {
    async fn bulk_append(&self, schema: &TableSchema, rows: &[StagingRow]) -> Result<u64, SinkError> {
        schema.validate()?;
        if rows.is_empty() {
            return Ok(0);
        }
        for row in rows {
            check_shape(schema, row)?;
        }

        let columns = schema.columns();
        let column_list = schema.column_names().collect::<Vec<_>>().join(", ");
        let rows_per_statement = (MAX_BIND_PARAMS / columns.len()).max(1);

        let mut tx = self.pool.begin().await?;
        let mut appended = 0u64;
        for chunk in rows.chunks(rows_per_statement) {
            let mut query_builder: QueryBuilder<Postgres> =
                QueryBuilder::new(format!("INSERT INTO {} ({}) ", schema.table(), column_list));

            query_builder.push_values(chunk.iter(), |mut b, row| {
                for (cell, column) in row.cells().iter().zip(columns) {
                    push_cell!(b, cell, &column.kind);
                }
            });

            let result = query_builder.build().execute(&mut *tx).await?;
            appended += result.rows_affected();
        }
        tx.commit().await?;

        info!(table = %schema.table(), rows = appended, "Appended staging rows");
        Ok(appended)
    }

    async fn promote(&self, procedure: &str) -> Result<(), SinkError> {
        ident::validate_identifier(procedure)?;
        sqlx::query(&format!("CALL {procedure}()"))
            .execute(&self.pool)
            .await?;
        info!(procedure, "Called promotion procedure");
        Ok(())
    }

    async fn upsert(
        &self,
        schema: &TableSchema,
        key_columns: &[String],
        row: &StagingRow,
    ) -> Result<UpsertOutcome, SinkError> {
        schema.validate()?;
        check_shape(schema, row)?;
        let keys = key_indices(schema, key_columns)?;
        let columns = schema.columns();

        let mut tx = self.pool.begin().await?;

        let mut exists: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("SELECT COUNT(*) FROM {} WHERE ", schema.table()));
        for (n, &i) in keys.iter().enumerate() {
            if n > 0 {
                exists.push(" AND ");
            }
            exists.push(format!("{} = ", columns[i].name));
            push_cell!(exists, &row.cells()[i], &columns[i].kind);
        }
        let count: i64 = exists.build_query_scalar().fetch_one(&mut *tx).await?;

        let outcome = if count > 0 {
            let assignments: Vec<usize> = (0..columns.len()).filter(|i| !keys.contains(i)).collect();
            if !assignments.is_empty() {
                let mut update: QueryBuilder<Postgres> =
                    QueryBuilder::new(format!("UPDATE {} SET ", schema.table()));
                for (n, &i) in assignments.iter().enumerate() {
                    if n > 0 {
                        update.push(", ");
                    }
                    update.push(format!("{} = ", columns[i].name));
                    push_cell!(update, &row.cells()[i], &columns[i].kind);
                }
                update.push(" WHERE ");
                for (n, &i) in keys.iter().enumerate() {
                    if n > 0 {
                        update.push(" AND ");
                    }
                    update.push(format!("{} = ", columns[i].name));
                    push_cell!(update, &row.cells()[i], &columns[i].kind);
                }
                update.build().execute(&mut *tx).await?;
            }
            UpsertOutcome::Updated
        } else {
            let column_list = schema.column_names().collect::<Vec<_>>().join(", ");
            let mut insert: QueryBuilder<Postgres> =
                QueryBuilder::new(format!("INSERT INTO {} ({}) ", schema.table(), column_list));
            insert.push_values(std::iter::once(row), |mut b, row| {
                for (cell, column) in row.cells().iter().zip(columns) {
                    push_cell!(b, cell, &column.kind);
                }
            });
            insert.build().execute(&mut *tx).await?;
            UpsertOutcome::Inserted
        };

        tx.commit().await?;
        debug!(table = %schema.table(), ?outcome, "Upserted row");
        Ok(outcome)
    }
}

/// Sink that logs rows instead of writing them, for dry runs
#[derive(Debug, Default, Clone)]
pub struct LogSink;

impl LogSink {
    pub fn new() -> Self {
        Self
    }

    fn render(schema: &TableSchema, row: &StagingRow) -> String {
        schema
            .column_names()
            .zip(row.cells())
            .map(|(name, cell)| format!("{name}={cell}"))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[async_trait]
impl BatchSink for LogSink {
    async fn bulk_append(&self, schema: &TableSchema, rows: &[StagingRow]) -> Result<u64, SinkError> {
        schema.validate()?;
        for row in rows {
            check_shape(schema, row)?;
            info!(table = %schema.table(), row = %Self::render(schema, row), "dry-run append");
        }
        Ok(rows.len() as u64)
    }

    async fn promote(&self, procedure: &str) -> Result<(), SinkError> {
        ident::validate_identifier(procedure)?;
        info!(procedure, "dry-run promotion");
        Ok(())
    }

    async fn upsert(
        &self,
        schema: &TableSchema,
        key_columns: &[String],
        row: &StagingRow,
    ) -> Result<UpsertOutcome, SinkError> {
        schema.validate()?;
        check_shape(schema, row)?;
        key_indices(schema, key_columns)?;
        info!(table = %schema.table(), row = %Self::render(schema, row), "dry-run upsert");
        Ok(UpsertOutcome::Inserted)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::framework::schema::ColumnSpec;
    use std::sync::Mutex;

    fn schema() -> TableSchema {
        TableSchema::new("connect.f_calls_staging")
            .promoted_by("connect.insert_new_f_calls")
            .column(ColumnSpec::text("contact_id", "ContactId"))
            .column(ColumnSpec::integer("agent_holds", "Holds"))
    }

    fn row(id: &str) -> StagingRow {
        StagingRow::from(vec![Cell::Text(id.into()), Cell::Int(0)])
    }

    #[derive(Default)]
    struct Calls {
        appended: Mutex<Vec<usize>>,
        promoted: Mutex<Vec<String>>,
        fail_promote: bool,
    }

    #[async_trait]
    impl BatchSink for Calls {
        async fn bulk_append(&self, _: &TableSchema, rows: &[StagingRow]) -> Result<u64, SinkError> {
            self.appended.lock().unwrap().push(rows.len());
            Ok(rows.len() as u64)
        }

        async fn promote(&self, procedure: &str) -> Result<(), SinkError> {
            if self.fail_promote {
                return Err(SinkError::Database(sqlx::Error::PoolTimedOut));
            }
            self.promoted.lock().unwrap().push(procedure.to_string());
            Ok(())
        }

        async fn upsert(&self, _: &TableSchema, _: &[String], _: &StagingRow) -> Result<UpsertOutcome, SinkError> {
            Ok(UpsertOutcome::Updated)
        }
    }

    #[tokio::test]
    async fn test_empty_batch_skips_promotion() {
        let sink = Calls::default();
        let outcome = deliver(&sink, &schema(), &[]).await;
        assert!(matches!(outcome, DeliveryOutcome::Delivered { rows: 0 }));
        assert!(sink.appended.lock().unwrap().is_empty());
        assert!(sink.promoted.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_deliver_appends_then_promotes() {
        let sink = Calls::default();
        let outcome = deliver(&sink, &schema(), &[row("a"), row("b")]).await;
        assert!(matches!(outcome, DeliveryOutcome::Delivered { rows: 2 }));
        assert_eq!(*sink.appended.lock().unwrap(), vec![2]);
        assert_eq!(*sink.promoted.lock().unwrap(), vec!["connect.insert_new_f_calls"]);
    }

    #[tokio::test]
    async fn test_failed_promotion_fails_delivery() {
        let sink = Calls {
            fail_promote: true,
            ..Default::default()
        };
        let outcome = deliver(&sink, &schema(), &[row("a")]).await;
        assert!(!outcome.is_delivered());
    }

    #[tokio::test]
    async fn test_deliver_dimension_counts_rows() {
        let sink = Calls::default();
        let outcome = deliver_dimension(&sink, &schema(), &["contact_id".to_string()], &[row("a"), row("b")]).await;
        assert!(matches!(outcome, DeliveryOutcome::Delivered { rows: 2 }));
    }

    #[tokio::test]
    async fn test_log_sink_checks_shape_and_keys() {
        let sink = LogSink::new();
        let schema = schema();
        assert_eq!(sink.bulk_append(&schema, &[row("a")]).await.unwrap(), 1);

        let short = StagingRow::from(vec![Cell::Null]);
        assert!(matches!(
            sink.bulk_append(&schema, &[short]).await,
            Err(SinkError::RowShape { expected: 2, actual: 1, .. })
        ));
        assert!(matches!(
            sink.upsert(&schema, &["nope".to_string()], &row("a")).await,
            Err(SinkError::UnknownKeyColumn(_))
        ));
        assert!(sink.promote("bad name()").await.is_err());
    }
}

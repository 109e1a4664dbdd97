//! Idempotent incremental-ingestion framework
//!
//! Every job is the same loop: enumerate work units, skip the ones the dedup
//! ledger already holds, fetch their records page by page, coerce them into a
//! fixed staging schema, bulk-load them into the warehouse and only then
//! claim the unit.
//!
//! Control flow: `JobDriver` -> `DedupLedger` (filter) -> `PaginatedFetcher`
//! (source) -> `Transformer` (shape) -> `BatchSink` (destination) ->
//! `DedupLedger` (commit).

pub mod driver;
pub mod fetcher;
pub mod ledger;
pub mod schema;
pub mod sink;
pub mod transform;
pub mod types;

// Re-export commonly used types
pub use driver::{
    source_mark, ClaimPolicy, DeliveryMode, DriverError, IngestJob, JobDriver, JobPhase, JobSummary,
};
pub use fetcher::{
    enrich_with_details, DetailSource, Page, PageSource, PaginatedFetcher, RetryPolicy,
    SourceError,
};
pub use ledger::{ClaimOutcome, DedupLedger, LedgerError, MemoryLedger, PgLedger};
pub use schema::{
    Classification, ColumnSource, ColumnSpec, ColumnType, Derivation, TableSchema,
    TimestampFormat,
};
pub use sink::{
    deliver, deliver_dimension, BatchSink, DeliveryOutcome, LogSink, PgSink, SinkError,
    UpsertOutcome,
};
pub use transform::{TransformContext, TransformError, TransformOutcome, Transformer};
pub use types::{Cell, ProcessedMark, RawRecord, StagingRow, WorkUnit};

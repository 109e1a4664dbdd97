//! Paginated fetcher
//!
//! Drives a cursor-based listing API to exhaustion as a lazy stream of
//! records, retrying throttled and transient failures on the same cursor
//! with bounded exponential backoff. Also provides the bounded detail
//! fan-out used to enrich list results with per-record lookups.

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use serde_json::Value;
use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use super::types::RawRecord;

/// Source-side failure taxonomy
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Transient source failure: {0}")]
    Transient(String),

    #[error("Permanent source failure: {0}")]
    Permanent(String),

    #[error("Gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },

    /// The work unit's data is unreadable; other units are unaffected
    #[error("Unreadable work unit: {0}")]
    Unit(String),
}

impl SourceError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, SourceError::RateLimited(_) | SourceError::Transient(_))
    }

    /// Errors that make continuing the run pointless
    pub fn aborts_run(&self) -> bool {
        matches!(self, SourceError::Permanent(_))
    }
}

/// One page of a listing
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    pub records: Vec<RawRecord>,
    pub next_cursor: Option<String>,
}

impl Page {
    pub fn new(records: Vec<RawRecord>, next_cursor: Option<String>) -> Self {
        Self {
            records,
            next_cursor,
        }
    }

    pub fn last(records: Vec<RawRecord>) -> Self {
        Self::new(records, None)
    }
}

/// A cursor-paginated listing endpoint
#[async_trait]
pub trait PageSource: Send + Sync {
    /// Query parameters of a listing (time window, resource ids, ...)
    type Filter: Send + Sync;

    async fn list_page(&self, filter: &Self::Filter, cursor: Option<&str>) -> Result<Page, SourceError>;
}

/// A by-id lookup endpoint; `None` means not found
#[async_trait]
pub trait DetailSource: Send + Sync {
    async fn get_detail(&self, id: &str) -> Result<Option<RawRecord>, SourceError>;
}

/// Bounded exponential backoff
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
        }
    }

    /// Single attempt, no retries
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO)
    }

    /// Delay after the given failed attempt (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Run `op` until it succeeds, fails permanently or attempts run out
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, SourceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, SourceError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) if attempt >= max_attempts => {
                    return Err(SourceError::RetriesExhausted {
                        attempts: attempt,
                        last: e.to_string(),
                    })
                },
                Err(e) => {
                    let delay = self.backoff(attempt);
                    warn!(
                        "{} attempt {}/{} failed: {}. Retrying in {:?}...",
                        what, attempt, max_attempts, e, delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                },
            }
        }
    }
}

enum Cursor {
    Start,
    Next(String),
    Done,
}

struct PagingState {
    cursor: Cursor,
    seen: HashSet<String>,
    pages: usize,
}

/// Exhaustive cursor pagination over a [`PageSource`]
pub struct PaginatedFetcher<'s, S: PageSource + ?Sized> {
    source: &'s S,
    retry: RetryPolicy,
}

impl<'s, S: PageSource + ?Sized> PaginatedFetcher<'s, S> {
    pub fn new(source: &'s S, retry: RetryPolicy) -> Self {
        Self { source, retry }
    }

    /// Lazy, finite stream of every record, pages in order
    ///
    /// Ends when a page carries no (or an empty) next cursor. A cursor seen
    /// before aborts with a permanent error rather than looping forever.
    pub fn fetch_all<'a>(&'a self, filter: &'a S::Filter) -> BoxStream<'a, Result<RawRecord, SourceError>>
    where
        's: 'a,
    {
        let initial = PagingState {
            cursor: Cursor::Start,
            seen: HashSet::new(),
            pages: 0,
        };

        stream::try_unfold(initial, move |mut state| async move {
            let cursor = match std::mem::replace(&mut state.cursor, Cursor::Done) {
                Cursor::Done => return Ok(None),
                Cursor::Start => None,
                Cursor::Next(cursor) => Some(cursor),
            };

            let page = self
                .retry
                .run("list_page", || self.source.list_page(filter, cursor.as_deref()))
                .await?;
            state.pages += 1;
            debug!(page = state.pages, records = page.records.len(), "Fetched page");

            state.cursor = match page.next_cursor.filter(|c| !c.is_empty()) {
                Some(next) => {
                    if !state.seen.insert(next.clone()) {
                        return Err(SourceError::Permanent(format!(
                            "pagination cursor {next:?} repeated after {} pages",
                            state.pages
                        )));
                    }
                    Cursor::Next(next)
                },
                None => Cursor::Done,
            };

            let records = stream::iter(page.records.into_iter().map(Ok));
            Ok(Some((records, state)))
        })
        .try_flatten()
        .boxed()
    }

    pub async fn collect_all(&self, filter: &S::Filter) -> Result<Vec<RawRecord>, SourceError> {
        self.fetch_all(filter).try_collect().await
    }
}

/// Attach one detail lookup per record under `into_field`
///
/// Lookups run through a pool of at most `concurrency` in flight and the
/// output keeps input order. A record without an id, a not-found lookup or a
/// failed lookup gets a null detail; the batch itself never fails.
pub async fn enrich_with_details<D>(
    records: Vec<RawRecord>,
    id_field: &str,
    source: &D,
    retry: &RetryPolicy,
    into_field: &str,
    concurrency: usize,
) -> Vec<RawRecord>
where
    D: DetailSource + ?Sized,
{
    stream::iter(records)
        .map(|mut record| async move {
            let detail = match record.get_str(id_field).map(str::to_owned) {
                None => Value::Null,
                Some(id) => match retry.run("get_detail", || source.get_detail(&id)).await {
                    Ok(Some(detail)) => detail.into_value(),
                    Ok(None) => {
                        warn!(id = %id, "Detail not found, continuing with null fields");
                        Value::Null
                    },
                    Err(e) => {
                        warn!(id = %id, error = %e, "Detail lookup failed, continuing with null fields");
                        Value::Null
                    },
                },
            };
            record.insert(into_field, detail);
            record
        })
        .buffered(concurrency.max(1))
        .collect()
        .await
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn rec(id: &str) -> RawRecord {
        RawRecord::from_value(json!({ "Id": id })).unwrap()
    }

    fn ids(records: &[RawRecord]) -> Vec<String> {
        records.iter().map(|r| r.get_str("Id").unwrap().to_string()).collect()
    }

    /// Replays scripted responses and records the cursors it was called with
    struct ScriptedPages {
        script: Mutex<VecDeque<Result<Page, SourceError>>>,
        cursors: Mutex<Vec<Option<String>>>,
    }

    impl ScriptedPages {
        fn new(script: Vec<Result<Page, SourceError>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                cursors: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl PageSource for ScriptedPages {
        type Filter = ();

        async fn list_page(&self, _: &(), cursor: Option<&str>) -> Result<Page, SourceError> {
            self.cursors.lock().unwrap().push(cursor.map(str::to_owned));
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(SourceError::Permanent("script exhausted".into())))
        }
    }

    fn page(ids: &[&str], next: Option<&str>) -> Result<Page, SourceError> {
        Ok(Page::new(ids.iter().map(|id| rec(id)).collect(), next.map(str::to_owned)))
    }

    #[tokio::test]
    async fn test_pages_yield_each_record_once_in_order() {
        let source = ScriptedPages::new(vec![
            page(&["A", "B"], Some("p2")),
            page(&["C"], Some("p3")),
            page(&[], None),
        ]);
        let fetcher = PaginatedFetcher::new(&source, RetryPolicy::none());

        let records = fetcher.collect_all(&()).await.unwrap();

        assert_eq!(ids(&records), vec!["A", "B", "C"]);
        assert_eq!(
            *source.cursors.lock().unwrap(),
            vec![None, Some("p2".to_string()), Some("p3".to_string())]
        );
    }

    #[tokio::test]
    async fn test_empty_cursor_ends_pagination() {
        let source = ScriptedPages::new(vec![page(&["A"], Some(""))]);
        let fetcher = PaginatedFetcher::new(&source, RetryPolicy::none());
        assert_eq!(ids(&fetcher.collect_all(&()).await.unwrap()), vec!["A"]);
        assert_eq!(source.cursors.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_repeated_cursor_is_permanent_error() {
        let source = ScriptedPages::new(vec![
            page(&["A"], Some("same")),
            page(&["B"], Some("same")),
        ]);
        let fetcher = PaginatedFetcher::new(&source, RetryPolicy::none());
        let err = fetcher.collect_all(&()).await.unwrap_err();
        assert!(matches!(err, SourceError::Permanent(_)));
    }

    #[tokio::test]
    async fn test_stream_is_lazy() {
        let source = ScriptedPages::new(vec![page(&["A"], Some("p2")), page(&["B"], None)]);
        let fetcher = PaginatedFetcher::new(&source, RetryPolicy::none());

        let mut stream = fetcher.fetch_all(&());
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.get_str("Id"), Some("A"));
        assert_eq!(source.cursors.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_retried_on_same_cursor_with_backoff() {
        let source = ScriptedPages::new(vec![
            page(&["A"], Some("p2")),
            Err(SourceError::RateLimited("429".into())),
            Err(SourceError::Transient("503".into())),
            page(&["B"], None),
        ]);
        let retry = RetryPolicy::new(5, Duration::from_secs(2), Duration::from_secs(60));
        let fetcher = PaginatedFetcher::new(&source, retry);

        let start = tokio::time::Instant::now();
        let records = fetcher.collect_all(&()).await.unwrap();

        assert_eq!(ids(&records), vec!["A", "B"]);
        // 2s after the first failure, 4s after the second
        assert!(start.elapsed() >= Duration::from_secs(6));
        let cursors = source.cursors.lock().unwrap();
        let p2 = Some("p2".to_string());
        assert_eq!(cursors[1..].to_vec(), vec![p2.clone(), p2.clone(), p2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted() {
        let source = ScriptedPages::new(vec![
            Err(SourceError::RateLimited("429".into())),
            Err(SourceError::RateLimited("429".into())),
            Err(SourceError::RateLimited("429".into())),
        ]);
        let retry = RetryPolicy::new(3, Duration::from_millis(10), Duration::from_millis(10));
        let fetcher = PaginatedFetcher::new(&source, retry);

        let err = fetcher.collect_all(&()).await.unwrap_err();
        assert!(matches!(err, SourceError::RetriesExhausted { attempts: 3, .. }));
        assert!(!err.aborts_run());
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let source = ScriptedPages::new(vec![Err(SourceError::Permanent("403".into())), page(&["A"], None)]);
        let fetcher = PaginatedFetcher::new(&source, RetryPolicy::default());
        let err = fetcher.collect_all(&()).await.unwrap_err();
        assert_eq!(err, SourceError::Permanent("403".into()));
        assert_eq!(source.cursors.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let retry = RetryPolicy::new(10, Duration::from_secs(2), Duration::from_secs(20));
        assert_eq!(retry.backoff(1), Duration::from_secs(2));
        assert_eq!(retry.backoff(2), Duration::from_secs(4));
        assert_eq!(retry.backoff(3), Duration::from_secs(8));
        assert_eq!(retry.backoff(4), Duration::from_secs(16));
        assert_eq!(retry.backoff(5), Duration::from_secs(20));
        assert_eq!(retry.backoff(40), Duration::from_secs(20));
    }

    struct Details {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl DetailSource for Details {
        async fn get_detail(&self, id: &str) -> Result<Option<RawRecord>, SourceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match id {
                "missing" => Ok(None),
                "broken" => Err(SourceError::Permanent("500".into())),
                _ => Ok(RawRecord::from_value(json!({ "Phone": format!("+1-{id}") }))),
            }
        }
    }

    #[tokio::test]
    async fn test_detail_failures_degrade_to_null() {
        let details = Details {
            calls: AtomicUsize::new(0),
        };
        let mut no_id = RawRecord::new();
        no_id.insert("Other", json!(1));
        let records = vec![rec("a"), rec("missing"), rec("broken"), no_id, rec("b")];

        let enriched = enrich_with_details(records, "Id", &details, &RetryPolicy::none(), "Detail", 2).await;

        assert_eq!(enriched.len(), 5);
        assert_eq!(enriched[0].get("Detail.Phone"), Some(&json!("+1-a")));
        assert_eq!(enriched[1].get("Detail"), Some(&Value::Null));
        assert_eq!(enriched[2].get("Detail"), Some(&Value::Null));
        assert_eq!(enriched[3].get("Detail"), Some(&Value::Null));
        assert_eq!(enriched[4].get("Detail.Phone"), Some(&json!("+1-b")));
        assert_eq!(details.calls.load(Ordering::SeqCst), 4);
    }
}

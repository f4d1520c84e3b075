use std::{
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Instant,
};

use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::Mutex;
use water_client::{CacheStore, RawUsagePayload, UsageReading};

use crate::transform::UsageExtractor;

/// Everything that can go wrong between a cache miss and a fresh reading.
///
/// `Clone` so that every caller joined on one retrieval gets the same error.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum UsageError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("authentication failed: {0}")]
    Authentication(String),
    #[error("unexpected upstream schema: {0}")]
    Schema(String),
    #[error("usage value is not numeric: {0}")]
    Parse(String),
    #[error("no usable records: {0}")]
    EmptyResult(String),
    #[error("upstream {step} returned HTTP {status}")]
    Status { step: String, status: u16 },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("browser session error: {0}")]
    Browser(String),
    #[error("retrieval task failed: {0}")]
    Task(String),
}

impl UsageError {
    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::Authentication(_) => "authentication",
            Self::Schema(_) => "schema",
            Self::Parse(_) => "parse",
            Self::EmptyResult(_) => "empty_result",
            Self::Status { .. } | Self::Transport(_) => "transport",
            Self::Browser(_) => "browser",
            Self::Task(_) => "task",
        }
    }
}

impl From<reqwest::Error> for UsageError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => UsageError::Status {
                step: err
                    .url()
                    .map(|u| u.path().to_string())
                    .unwrap_or_else(|| "request".to_string()),
                status: status.as_u16(),
            },
            None => UsageError::Transport(err.to_string()),
        }
    }
}

/// One way of logging into the portal and pulling raw usage data.
#[async_trait::async_trait]
pub trait Retriever: Send + Sync {
    /// Recorded as `source` on every reading this retriever produces.
    fn source_id(&self) -> &'static str;

    async fn fetch(&self) -> Result<RawUsagePayload, UsageError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct DailyUsage {
    pub reading: UsageReading,
    pub cached: bool,
}

type InFlight = Shared<BoxFuture<'static, Result<UsageReading, UsageError>>>;

/// The retrieval currently running, tagged so its task only ever clears
/// its own entry.
type InFlightSlot = Arc<Mutex<Option<(u64, InFlight)>>>;

/// Cache-first retrieval of the daily usage reading.
///
/// Concurrent cache misses share a single retrieval. The retrieval runs on
/// its own task and clears the in-flight slot itself when done, so callers
/// going away neither abort it nor leave a finished result behind for
/// later requests.
pub struct UsagePipeline {
    retriever: Arc<dyn Retriever>,
    extractor: Arc<UsageExtractor>,
    cache: Arc<CacheStore>,
    in_flight: InFlightSlot,
    next_id: AtomicU64,
}

impl UsagePipeline {
    pub fn new(
        retriever: Arc<dyn Retriever>,
        extractor: UsageExtractor,
        cache: CacheStore,
    ) -> Self {
        Self {
            retriever,
            extractor: Arc::new(extractor),
            cache: Arc::new(cache),
            in_flight: Arc::new(Mutex::new(None)),
            next_id: AtomicU64::new(0),
        }
    }

    pub async fn daily_usage(&self) -> Result<DailyUsage, UsageError> {
        if let Some(reading) = self.cache.read().await {
            metrics::counter!("water_cache_hits_total").increment(1);
            return Ok(DailyUsage { reading, cached: true });
        }
        metrics::counter!("water_cache_misses_total").increment(1);

        let retrieval = {
            let mut slot = self.in_flight.lock().await;
            match slot.as_ref() {
                Some((_, existing)) => {
                    tracing::debug!("joining in-flight retrieval");
                    existing.clone()
                }
                None => {
                    // A retrieval may have finished between the miss above and
                    // taking the lock.
                    if let Some(reading) = self.cache.read().await {
                        return Ok(DailyUsage { reading, cached: true });
                    }
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    let retrieval = self.start_retrieval(id);
                    *slot = Some((id, retrieval.clone()));
                    retrieval
                }
            }
        };

        retrieval.await.map(|reading| DailyUsage {
            reading,
            cached: false,
        })
    }

    /// Run one retrieval and extraction without consulting the cache.
    pub async fn refresh(&self) -> Result<UsageReading, UsageError> {
        retrieve(
            Arc::clone(&self.retriever),
            Arc::clone(&self.extractor),
            Arc::clone(&self.cache),
        )
        .await
    }

    /// Must be called with the slot locked, so the task cannot clear the
    /// slot before the caller has stored the entry.
    fn start_retrieval(&self, id: u64) -> InFlight {
        let run = AssertUnwindSafe(retrieve(
            Arc::clone(&self.retriever),
            Arc::clone(&self.extractor),
            Arc::clone(&self.cache),
        ));
        let slot = Arc::clone(&self.in_flight);

        let handle = tokio::spawn(async move {
            let result = run.catch_unwind().await.unwrap_or_else(|_| {
                Err(UsageError::Task("retrieval panicked".to_string()))
            });

            let mut current = slot.lock().await;
            if current.as_ref().is_some_and(|(running, _)| *running == id) {
                *current = None;
            }
            result
        });

        async move {
            match handle.await {
                Ok(result) => result,
                Err(e) => Err(UsageError::Task(e.to_string())),
            }
        }
        .boxed()
        .shared()
    }
}

async fn retrieve(
    retriever: Arc<dyn Retriever>,
    extractor: Arc<UsageExtractor>,
    cache: Arc<CacheStore>,
) -> Result<UsageReading, UsageError> {
    let source = retriever.source_id();
    let started = Instant::now();
    metrics::counter!("water_retrievals_total").increment(1);
    tracing::info!(source, "retrieving usage from provider");

    let outcome = match retriever.fetch().await {
        Ok(payload) => extractor.extract(&payload),
        Err(e) => Err(e),
    };

    metrics::histogram!("water_retrieval_duration_seconds")
        .record(started.elapsed().as_secs_f64());

    let extracted = match outcome {
        Ok(extracted) => extracted,
        Err(e) => {
            metrics::counter!("water_retrieval_failures_total", "kind" => e.kind()).increment(1);
            tracing::warn!(source, kind = e.kind(), error = %e, "usage retrieval failed");
            return Err(e);
        }
    };

    let reading = UsageReading::captured_now(source, extracted.value, extracted.row_count);
    tracing::info!(
        source,
        usage_gallons = reading.usage_value,
        rows = ?reading.row_count,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "usage retrieved"
    );

    if let Err(e) = cache.write(&reading).await {
        tracing::error!(
            error = %e,
            path = %cache.path().display(),
            "failed to persist usage reading"
        );
    }

    Ok(reading)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::{sync::atomic::AtomicUsize, time::Duration};
    use tempfile::TempDir;
    use water_client::{store::DEFAULT_TTL, UsageRow};

    /// Retriever double that counts calls and returns a canned result.
    pub(crate) struct FakeRetriever {
        pub calls: AtomicUsize,
        pub result: Result<RawUsagePayload, UsageError>,
        pub delay: Duration,
    }

    impl FakeRetriever {
        pub fn ok(payload: RawUsagePayload) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                result: Ok(payload),
                delay: Duration::ZERO,
            }
        }

        pub fn failing(err: UsageError) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                result: Err(err),
                delay: Duration::ZERO,
            }
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl Retriever for FakeRetriever {
        fn source_id(&self) -> &'static str {
            "fake_portal"
        }

        async fn fetch(&self) -> Result<RawUsagePayload, UsageError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.result.clone()
        }
    }

    pub(crate) fn gallons_rows(values: &[&str]) -> RawUsagePayload {
        RawUsagePayload::Rows(
            values
                .iter()
                .map(|v| {
                    [("Date", "2024-05-01"), ("Gallons", *v)]
                        .into_iter()
                        .collect::<UsageRow>()
                })
                .collect(),
        )
    }

    fn pipeline_with(retriever: Arc<FakeRetriever>, dir: &TempDir) -> UsagePipeline {
        UsagePipeline::new(
            retriever,
            UsageExtractor::default(),
            CacheStore::new(dir.path().join("cache.json"), DEFAULT_TTL),
        )
    }

    #[tokio::test]
    async fn miss_then_hit_retrieves_once() {
        let dir = TempDir::new().unwrap();
        let retriever = Arc::new(FakeRetriever::ok(gallons_rows(&["100", "123.4"])));
        let pipeline = pipeline_with(Arc::clone(&retriever), &dir);

        let first = pipeline.daily_usage().await.unwrap();
        assert!(!first.cached);
        assert_eq!(first.reading.usage_value, 123.4);
        assert_eq!(first.reading.row_count, Some(2));
        assert_eq!(first.reading.source, "fake_portal");

        let second = pipeline.daily_usage().await.unwrap();
        assert!(second.cached);
        assert_eq!(second.reading, first.reading);
        assert_eq!(retriever.calls(), 1);
    }

    #[tokio::test]
    async fn failure_is_not_cached() {
        let dir = TempDir::new().unwrap();
        let retriever = Arc::new(FakeRetriever::failing(UsageError::Authentication(
            "timed out waiting for redirect".to_string(),
        )));
        let pipeline = pipeline_with(Arc::clone(&retriever), &dir);

        let err = pipeline.daily_usage().await.unwrap_err();
        assert_eq!(err.kind(), "authentication");
        assert!(!dir.path().join("cache.json").exists());

        // no memo of the failure: next request tries again
        let _ = pipeline.daily_usage().await.unwrap_err();
        assert_eq!(retriever.calls(), 2);
    }

    #[tokio::test]
    async fn extraction_failure_keeps_previous_entry() {
        let dir = TempDir::new().unwrap();
        let cache = CacheStore::new(dir.path().join("cache.json"), DEFAULT_TTL);
        let previous = UsageReading::captured_now("fake_portal", 80.0, Some(3));
        cache.write(&previous).await.unwrap();

        let retriever = Arc::new(FakeRetriever::ok(RawUsagePayload::Text("n/a".to_string())));
        let pipeline = UsagePipeline::new(retriever, UsageExtractor::default(), cache.clone());

        let err = pipeline.refresh().await.unwrap_err();
        assert!(matches!(err, UsageError::Parse(_)));
        assert_eq!(cache.read().await, Some(previous));
    }

    #[tokio::test]
    async fn concurrent_misses_share_one_retrieval() {
        let dir = TempDir::new().unwrap();
        let retriever = Arc::new(FakeRetriever {
            delay: Duration::from_millis(100),
            ..FakeRetriever::ok(gallons_rows(&["42"]))
        });
        let pipeline = Arc::new(pipeline_with(Arc::clone(&retriever), &dir));

        let (a, b, c) = tokio::join!(
            pipeline.daily_usage(),
            pipeline.daily_usage(),
            pipeline.daily_usage()
        );

        let (a, b, c) = (a.unwrap(), b.unwrap(), c.unwrap());
        assert_eq!(retriever.calls(), 1);
        assert_eq!(a.reading, b.reading);
        assert_eq!(b.reading, c.reading);
        assert!(!a.cached);
    }

    #[tokio::test]
    async fn concurrent_waiters_share_the_error() {
        let dir = TempDir::new().unwrap();
        let retriever = Arc::new(FakeRetriever {
            delay: Duration::from_millis(100),
            ..FakeRetriever::failing(UsageError::Status {
                step: "/login".to_string(),
                status: 503,
            })
        });
        let pipeline = Arc::new(pipeline_with(Arc::clone(&retriever), &dir));

        let (a, b) = tokio::join!(pipeline.daily_usage(), pipeline.daily_usage());

        assert_eq!(a.unwrap_err(), b.unwrap_err());
        assert_eq!(retriever.calls(), 1);
    }

    #[tokio::test]
    async fn abandoned_failure_is_retried_by_next_request() {
        let dir = TempDir::new().unwrap();
        let retriever = Arc::new(FakeRetriever {
            delay: Duration::from_millis(50),
            ..FakeRetriever::failing(UsageError::Authentication("bad password".to_string()))
        });
        let pipeline = Arc::new(pipeline_with(Arc::clone(&retriever), &dir));

        // the only waiter goes away while the retrieval is still running
        let waiter = tokio::spawn({
            let pipeline = Arc::clone(&pipeline);
            async move { pipeline.daily_usage().await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        waiter.abort();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let err = pipeline.daily_usage().await.unwrap_err();
        assert_eq!(err.kind(), "authentication");
        assert_eq!(retriever.calls(), 2);
    }

    #[tokio::test]
    async fn abandoned_success_is_served_from_cache() {
        let dir = TempDir::new().unwrap();
        let retriever = Arc::new(FakeRetriever {
            delay: Duration::from_millis(50),
            ..FakeRetriever::ok(gallons_rows(&["61.5"]))
        });
        let pipeline = Arc::new(pipeline_with(Arc::clone(&retriever), &dir));

        let waiter = tokio::spawn({
            let pipeline = Arc::clone(&pipeline);
            async move { pipeline.daily_usage().await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        waiter.abort();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let daily = pipeline.daily_usage().await.unwrap();
        assert!(daily.cached);
        assert_eq!(daily.reading.usage_value, 61.5);
        assert_eq!(retriever.calls(), 1);
    }

    #[test]
    fn status_error_mentions_code() {
        let err = UsageError::Status {
            step: "login page".to_string(),
            status: 502,
        };
        assert_eq!(err.to_string(), "upstream login page returned HTTP 502");
        assert_eq!(err.kind(), "transport");
    }
}

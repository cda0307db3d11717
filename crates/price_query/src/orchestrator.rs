use std::{
    any::Any,
    panic::AssertUnwindSafe,
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::{Result, anyhow};
use cache::{Cache, CacheError, Clock, SystemClock};
use futures::{
    FutureExt,
    future::{self, Either},
};
use futures_timer::Delay;
use serde::{Deserialize, Serialize};

use crate::{
    audit::{AuditLogger, AuditRecord, LogAuditLogger},
    config::Config,
    executor::{ExecutionError, Executor, ResultRow},
    intent::classify,
    query_spec::{QuerySpec, build},
};

/// The uniform answer returned for every question, successful or not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryEnvelope {
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<QuerySpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql: Option<String>,
    pub results: Vec<ResultRow>,
    pub execution_time: f64,
    pub cached: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct QueryOrchestrator {
    cache: Arc<dyn Cache>,
    executor: Arc<dyn Executor>,
    audit: Arc<dyn AuditLogger>,
    clock: Arc<dyn Clock>,
    cache_ttl: Duration,
    executor_timeout: Duration,
}

#[derive(Default)]
pub struct QueryOrchestratorBuilder {
    cache: Option<Arc<dyn Cache>>,
    executor: Option<Arc<dyn Executor>>,
    audit: Option<Arc<dyn AuditLogger>>,
    clock: Option<Arc<dyn Clock>>,
    cache_ttl: Option<Duration>,
    executor_timeout: Option<Duration>,
}

impl QueryOrchestratorBuilder {
    pub fn with_cache(&mut self, cache: Arc<dyn Cache>) -> &mut Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_executor(&mut self, executor: Arc<dyn Executor>) -> &mut Self {
        self.executor = Some(executor);
        self
    }

    pub fn with_audit_logger(&mut self, audit: Arc<dyn AuditLogger>) -> &mut Self {
        self.audit = Some(audit);
        self
    }

    pub fn with_clock(&mut self, clock: Arc<dyn Clock>) -> &mut Self {
        self.clock = Some(clock);
        self
    }

    pub fn with_cache_ttl(&mut self, ttl: Duration) -> &mut Self {
        self.cache_ttl = Some(ttl);
        self
    }

    pub fn with_executor_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.executor_timeout = Some(timeout);
        self
    }

    pub fn with_config(&mut self, config: &Config) -> &mut Self {
        self.with_cache_ttl(config.cache_ttl)
            .with_executor_timeout(config.executor_timeout)
    }

    pub fn build(&self) -> Result<QueryOrchestrator> {
        let defaults = Config::default();

        Ok(QueryOrchestrator {
            cache: self
                .cache
                .clone()
                .ok_or_else(|| anyhow!("a cache store is required"))?,
            executor: self
                .executor
                .clone()
                .ok_or_else(|| anyhow!("a query executor is required"))?,
            audit: self
                .audit
                .clone()
                .unwrap_or_else(|| Arc::new(LogAuditLogger)),
            clock: self.clock.clone().unwrap_or_else(|| Arc::new(SystemClock)),
            cache_ttl: self.cache_ttl.unwrap_or(defaults.cache_ttl),
            executor_timeout: self.executor_timeout.unwrap_or(defaults.executor_timeout),
        })
    }
}

impl QueryOrchestrator {
    pub fn builder() -> QueryOrchestratorBuilder {
        QueryOrchestratorBuilder::default()
    }

    /// Answers a free-text question. Never fails: executor errors and
    /// timeouts come back in the envelope's `error` field, and cache faults
    /// degrade to recomputing the answer.
    pub async fn answer(&self, text: &str) -> QueryEnvelope {
        let started = Instant::now();

        if let Some(rows) = self.cached_rows(text) {
            let envelope = QueryEnvelope {
                query: text.to_owned(),
                spec: None,
                sql: None,
                results: rows,
                execution_time: started.elapsed().as_secs_f64(),
                cached: true,
                error: None,
            };
            self.record(&envelope);
            return envelope;
        }

        let spec = build(&classify(text));
        let sql = spec.to_string();

        let envelope = match self.execute(&spec).await {
            Ok(rows) => {
                self.store(text, &rows);
                QueryEnvelope {
                    query: text.to_owned(),
                    spec: Some(spec),
                    sql: Some(sql),
                    results: rows,
                    execution_time: started.elapsed().as_secs_f64(),
                    cached: false,
                    error: None,
                }
            }
            Err(err) => QueryEnvelope {
                query: text.to_owned(),
                spec: Some(spec),
                sql: Some(sql),
                results: Vec::new(),
                execution_time: started.elapsed().as_secs_f64(),
                cached: false,
                error: Some(err.to_string()),
            },
        };

        self.record(&envelope);
        envelope
    }

    /// Drops every cache entry that has expired by now.
    pub fn sweep_expired(&self) -> Result<usize, CacheError> {
        let removed = self.cache.sweep_expired(self.clock.now())?;
        log::info!("cleared {} expired cache entries", removed);
        Ok(removed)
    }

    fn cached_rows(&self, text: &str) -> Option<Vec<ResultRow>> {
        let entry = match self.cache.get(text) {
            Ok(entry) => entry?,
            Err(err) => {
                log::warn!("cache lookup failed, treating as a miss: {}", err);
                return None;
            }
        };

        match serde_json::from_value(entry.payload) {
            Ok(rows) => Some(rows),
            Err(err) => {
                log::warn!("cached payload for {} is unreadable: {}", entry.key, err);
                None
            }
        }
    }

    fn store(&self, text: &str, rows: &[ResultRow]) {
        let stored = serde_json::to_value(rows)
            .map_err(CacheError::from)
            .and_then(|payload| self.cache.put(text, payload, self.cache_ttl));

        if let Err(err) = stored {
            log::warn!("failed to cache answer, continuing without it: {}", err);
        }
    }

    /// Runs the executor bounded by the timeout. A panicking executor is
    /// reported as a failed execution.
    async fn execute(&self, spec: &QuerySpec) -> Result<Vec<ResultRow>, ExecutionError> {
        let execution = AssertUnwindSafe(self.executor.execute(spec)).catch_unwind();

        match future::select(execution, Delay::new(self.executor_timeout)).await {
            Either::Left((Ok(result), _)) => result,
            Either::Left((Err(panic), _)) => Err(ExecutionError::Failed(format!(
                "executor panicked: {}",
                panic_message(&*panic)
            ))),
            Either::Right(_) => Err(ExecutionError::Timeout(self.executor_timeout)),
        }
    }

    fn record(&self, envelope: &QueryEnvelope) {
        self.audit.record(AuditRecord {
            query_text: envelope.query.clone(),
            spec: envelope.spec.clone(),
            generated_sql: envelope.sql.clone().unwrap_or_default(),
            execution_time: envelope.execution_time,
            result_count: envelope.results.len(),
            success: envelope.error.is_none(),
            error: envelope.error.clone(),
            cached: envelope.cached,
            timestamp: self.clock.now(),
        });
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        *message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic"
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use cache::{CacheEntry, ManualClock, MemoryCache};
    use chrono::{NaiveDate, NaiveDateTime};
    use serde_json::Value;

    use super::*;
    use crate::{audit::MemoryAuditLog, intent::QueryIntent, query_spec::Predicate};

    fn start() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 5, 1)
            .unwrap()
            .and_hms_opt(9, 0, 0)
            .unwrap()
    }

    fn onion_row() -> ResultRow {
        ResultRow {
            name: "Onion".into(),
            platform: "zepto".into(),
            price: 38.0,
            discount_percent: 13.04,
            savings: None,
        }
    }

    enum Behaviour {
        Rows(Vec<ResultRow>),
        Fail(&'static str),
        Hang,
        Panic,
    }

    struct StubExecutor {
        behaviour: Behaviour,
        calls: AtomicUsize,
        specs: parking_lot::Mutex<Vec<QuerySpec>>,
    }

    impl StubExecutor {
        fn new(behaviour: Behaviour) -> Arc<Self> {
            Arc::new(Self {
                behaviour,
                calls: AtomicUsize::new(0),
                specs: parking_lot::Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Executor for StubExecutor {
        async fn execute(&self, spec: &QuerySpec) -> Result<Vec<ResultRow>, ExecutionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.specs.lock().push(spec.clone());
            match &self.behaviour {
                Behaviour::Rows(rows) => Ok(rows.clone()),
                Behaviour::Fail(message) => Err(ExecutionError::Failed(message.to_string())),
                Behaviour::Hang => future::pending().await,
                Behaviour::Panic => panic!("catalog index out of bounds"),
            }
        }
    }

    struct BrokenCache;

    impl Cache for BrokenCache {
        fn get(&self, _text: &str) -> Result<Option<CacheEntry>, CacheError> {
            Err(CacheError::Unavailable("disk on fire".into()))
        }

        fn put(&self, _text: &str, _payload: Value, _ttl: Duration) -> Result<(), CacheError> {
            Err(CacheError::Unavailable("disk on fire".into()))
        }

        fn sweep_expired(&self, _now: NaiveDateTime) -> Result<usize, CacheError> {
            Err(CacheError::Unavailable("disk on fire".into()))
        }

        fn peek(&self, _text: &str) -> Result<Option<CacheEntry>, CacheError> {
            Err(CacheError::Unavailable("disk on fire".into()))
        }
    }

    struct Harness {
        orchestrator: QueryOrchestrator,
        executor: Arc<StubExecutor>,
        cache: Arc<MemoryCache>,
        audit: Arc<MemoryAuditLog>,
        clock: Arc<ManualClock>,
    }

    fn harness(behaviour: Behaviour) -> Harness {
        let clock = Arc::new(ManualClock::new(start()));
        let cache = Arc::new(MemoryCache::new(clock.clone()));
        let executor = StubExecutor::new(behaviour);
        let audit = Arc::new(MemoryAuditLog::default());
        let orchestrator = QueryOrchestrator::builder()
            .with_cache(cache.clone())
            .with_executor(executor.clone())
            .with_audit_logger(audit.clone())
            .with_clock(clock.clone())
            .with_cache_ttl(Duration::from_secs(300))
            .with_executor_timeout(Duration::from_millis(50))
            .build()
            .unwrap();

        Harness {
            orchestrator,
            executor,
            cache,
            audit,
            clock,
        }
    }

    #[tokio::test]
    async fn miss_executes_classified_spec_and_caches() {
        let h = harness(Behaviour::Rows(vec![onion_row()]));
        let text = "Which app has cheapest onions right now?";

        let envelope = h.orchestrator.answer(text).await;

        assert!(!envelope.cached);
        assert!(envelope.error.is_none());
        assert_eq!(envelope.results, vec![onion_row()]);
        assert!(envelope.execution_time >= 0.0);
        let expected = build(&QueryIntent::CheapestProduct {
            product: "onion".into(),
        });
        assert_eq!(envelope.spec.as_ref(), Some(&expected));
        assert_eq!(envelope.sql, Some(expected.to_string()));
        assert_eq!(h.executor.specs.lock().as_slice(), &[expected]);

        let stored = h.cache.peek(text).unwrap().unwrap();
        assert_eq!(stored.expires_at, start() + chrono::Duration::seconds(300));
        assert_eq!(stored.hit_count, 0);
    }

    #[tokio::test]
    async fn second_answer_within_ttl_is_cached() {
        let h = harness(Behaviour::Rows(vec![onion_row()]));

        let first = h.orchestrator.answer("cheapest onion").await;
        let second = h.orchestrator.answer("cheapest onion").await;

        assert_eq!(h.executor.calls(), 1);
        assert!(!first.cached);
        assert!(second.cached);
        assert_eq!(second.results, first.results);
        assert!(second.spec.is_none());
        assert_eq!(h.cache.peek("cheapest onion").unwrap().unwrap().hit_count, 1);
    }

    #[tokio::test]
    async fn expired_answer_is_recomputed() {
        let h = harness(Behaviour::Rows(vec![onion_row()]));

        h.orchestrator.answer("cheapest onion").await;
        h.clock.advance(chrono::Duration::seconds(300));
        let again = h.orchestrator.answer("cheapest onion").await;

        assert!(!again.cached);
        assert_eq!(h.executor.calls(), 2);
    }

    #[tokio::test]
    async fn executor_failure_becomes_error_envelope() {
        let h = harness(Behaviour::Fail("no such table: price_histories"));

        let envelope = h.orchestrator.answer("cheapest onion").await;

        assert_eq!(
            envelope.error.as_deref(),
            Some("query execution failed: no such table: price_histories")
        );
        assert!(envelope.results.is_empty());
        assert!(!envelope.cached);
        assert!(envelope.execution_time >= 0.0);
        assert!(h.cache.peek("cheapest onion").unwrap().is_none());

        let records = h.audit.records();
        assert_eq!(records.len(), 1);
        assert!(!records[0].success);
        assert_eq!(records[0].result_count, 0);
        assert_eq!(records[0].error, envelope.error);
    }

    #[tokio::test]
    async fn hung_executor_times_out() {
        let h = harness(Behaviour::Hang);

        let envelope = h.orchestrator.answer("best deals ₹500").await;

        assert!(envelope.error.unwrap().contains("timed out"));
        assert!(envelope.results.is_empty());
        assert!(!envelope.cached);
    }

    #[tokio::test]
    async fn panicking_executor_becomes_error_envelope() {
        let h = harness(Behaviour::Panic);

        let envelope = h.orchestrator.answer("cheapest onion").await;

        assert_eq!(
            envelope.error.as_deref(),
            Some("query execution failed: executor panicked: catalog index out of bounds")
        );
        assert!(envelope.results.is_empty());
        assert!(envelope.spec.is_some());
        assert!(h.cache.peek("cheapest onion").unwrap().is_none());

        let records = h.audit.records();
        assert_eq!(records.len(), 1);
        assert!(!records[0].success);
    }

    #[tokio::test]
    async fn broken_cache_degrades_to_miss() {
        let executor = StubExecutor::new(Behaviour::Rows(vec![onion_row()]));
        let orchestrator = QueryOrchestrator::builder()
            .with_cache(Arc::new(BrokenCache))
            .with_executor(executor.clone())
            .build()
            .unwrap();

        let first = orchestrator.answer("cheapest onion").await;
        let second = orchestrator.answer("cheapest onion").await;

        assert!(first.error.is_none());
        assert!(!second.cached);
        assert_eq!(second.results, vec![onion_row()]);
        assert_eq!(executor.calls(), 2);
        assert!(orchestrator.sweep_expired().is_err());
    }

    #[tokio::test]
    async fn every_answer_is_audited() {
        let h = harness(Behaviour::Rows(vec![onion_row(), onion_row()]));

        h.orchestrator.answer("30% discount on zepto").await;
        h.orchestrator.answer("30% discount on zepto").await;

        let records = h.audit.records();
        assert_eq!(records.len(), 2);
        assert!(!records[0].cached);
        assert!(records[0].generated_sql.contains("ph.discount_percentage >= 30"));
        assert_eq!(
            records[0].spec.as_ref().map(|spec| &spec.predicates[0]),
            Some(&Predicate::DiscountAtLeast { percent: 30 })
        );
        assert!(records[1].cached);
        assert!(records.iter().all(|record| record.success));
        assert!(records.iter().all(|record| record.result_count == 2));
        assert!(records.iter().all(|record| record.timestamp == start()));
    }

    #[tokio::test]
    async fn sweep_uses_clock() {
        let h = harness(Behaviour::Rows(Vec::new()));
        h.orchestrator.answer("salt").await;
        h.orchestrator.answer("sugar").await;

        assert_eq!(h.orchestrator.sweep_expired().unwrap(), 0);
        h.clock.advance(chrono::Duration::seconds(301));
        assert_eq!(h.orchestrator.sweep_expired().unwrap(), 2);
        assert!(h.cache.is_empty());
    }

    #[test]
    fn builder_requires_cache_and_executor() {
        assert!(QueryOrchestrator::builder().build().is_err());
        assert!(
            QueryOrchestrator::builder()
                .with_cache(Arc::new(MemoryCache::default()))
                .build()
                .is_err()
        );
    }
}

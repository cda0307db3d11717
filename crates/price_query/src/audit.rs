use std::{collections::VecDeque, sync::Arc};

use chrono::NaiveDateTime;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::query_spec::QuerySpec;

const DEFAULT_MAX_RECORDS: usize = 10_000;
const STATS_WINDOW_HOURS: i64 = 24;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub query_text: String,
    pub spec: Option<QuerySpec>,
    pub generated_sql: String,
    pub execution_time: f64,
    pub result_count: usize,
    pub success: bool,
    pub error: Option<String>,
    pub cached: bool,
    pub timestamp: NaiveDateTime,
}

/// Receives one record per answered query. Recording is fire-and-forget:
/// implementations swallow their own failures.
pub trait AuditLogger: Send + Sync {
    fn record(&self, record: AuditRecord);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LogAuditLogger;

impl AuditLogger for LogAuditLogger {
    fn record(&self, record: AuditRecord) {
        match &record.error {
            None => log::info!(
                "query {:?}: {} rows in {:.4}s (cached: {})",
                record.query_text,
                record.result_count,
                record.execution_time,
                record.cached
            ),
            Some(error) => log::warn!(
                "query {:?} failed after {:.4}s: {}",
                record.query_text,
                record.execution_time,
                error
            ),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryStats {
    pub recent_queries: usize,
    pub successful_queries: usize,
    pub failed_queries: usize,
    pub cached_queries: usize,
    pub avg_query_time: f64,
}

/// Keeps the most recent audit records in memory, oldest dropped first.
pub struct MemoryAuditLog {
    records: Mutex<VecDeque<AuditRecord>>,
    max_records: usize,
}

impl MemoryAuditLog {
    pub fn new(max_records: usize) -> Self {
        Self {
            records: Mutex::new(VecDeque::new()),
            max_records: max_records.max(1),
        }
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().iter().cloned().collect()
    }

    /// Aggregates the records of the 24 hours leading up to `now`.
    pub fn stats(&self, now: NaiveDateTime) -> QueryStats {
        let since = now - chrono::Duration::hours(STATS_WINDOW_HOURS);
        let records = self.records.lock();
        let recent: Vec<&AuditRecord> = records
            .iter()
            .filter(|record| record.timestamp >= since)
            .collect();

        let total_time: f64 = recent.iter().map(|record| record.execution_time).sum();
        let successful_queries = recent.iter().filter(|record| record.success).count();

        QueryStats {
            recent_queries: recent.len(),
            successful_queries,
            failed_queries: recent.len() - successful_queries,
            cached_queries: recent.iter().filter(|record| record.cached).count(),
            avg_query_time: if recent.is_empty() {
                0.0
            } else {
                total_time / recent.len() as f64
            },
        }
    }
}

impl Default for MemoryAuditLog {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RECORDS)
    }
}

impl AuditLogger for MemoryAuditLog {
    fn record(&self, record: AuditRecord) {
        let mut records = self.records.lock();
        if records.len() == self.max_records {
            records.pop_front();
        }
        records.push_back(record);
    }
}

/// Forwards every record to each inner logger in turn.
#[derive(Default, Clone)]
pub struct CompositeAuditLogger {
    loggers: Vec<Arc<dyn AuditLogger>>,
}

impl CompositeAuditLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_logger(mut self, logger: Arc<dyn AuditLogger>) -> Self {
        self.loggers.push(logger);
        self
    }
}

impl AuditLogger for CompositeAuditLogger {
    fn record(&self, record: AuditRecord) {
        for logger in &self.loggers {
            logger.record(record.clone());
        }
    }
}

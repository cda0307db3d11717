use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::query_spec::QuerySpec;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRow {
    pub name: String,
    pub platform: String,
    pub price: f64,
    pub discount_percent: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub savings: Option<f64>,
}

#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("query execution failed: {0}")]
    Failed(String),
    #[error("query execution timed out after {0:?}")]
    Timeout(Duration),
}

/// Runs a [`QuerySpec`] against a price dataset. Rows come back already
/// filtered, ordered and limited as the `QuerySpec` describes.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, spec: &QuerySpec) -> Result<Vec<ResultRow>, ExecutionError>;
}

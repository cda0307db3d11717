use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use cache::Clock;
use context_server::{Tool, ToolContent, ToolExecutor};
use price_query::{CatalogSummary, MemoryAuditLog, MemoryCatalog, QueryStats};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

#[derive(Debug, Serialize, Deserialize)]
struct StatsReport {
    #[serde(flatten)]
    queries: QueryStats,
    #[serde(flatten)]
    catalog: CatalogSummary,
}

pub struct QueryStatsTool {
    audit_log: Arc<MemoryAuditLog>,
    catalog: Arc<MemoryCatalog>,
    clock: Arc<dyn Clock>,
}

impl QueryStatsTool {
    pub fn new(
        audit_log: Arc<MemoryAuditLog>,
        catalog: Arc<MemoryCatalog>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            audit_log,
            catalog,
            clock,
        }
    }
}

#[async_trait]
impl ToolExecutor for QueryStatsTool {
    async fn execute(&self, _arguments: Option<Value>) -> Result<Vec<ToolContent>> {
        log::debug!("Executing QueryStatsTool");
        let report = StatsReport {
            queries: self.audit_log.stats(self.clock.now()),
            catalog: self.catalog.summary(),
        };

        Ok(vec![ToolContent::Text {
            text: serde_json::to_string_pretty(&report)?,
        }])
    }

    fn to_tool(&self) -> Tool {
        Tool {
            name: "query_stats".into(),
            description: Some(
                "Summarize price questions answered in the last 24 hours and the products, platforms and categories being tracked".into(),
            ),
            input_schema: json!({
                "type": "object",
                "properties": {}
            }),
        }
    }
}

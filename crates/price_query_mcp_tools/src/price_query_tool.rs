use std::sync::Arc;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use context_server::{Tool, ToolContent, ToolExecutor};
use price_query::QueryOrchestrator;
use serde_json::{Value, json};

use crate::RateLimiter;

const DEFAULT_CLIENT: &str = "local";

pub struct PriceQueryTool {
    orchestrator: Arc<QueryOrchestrator>,
    rate_limiter: Arc<RateLimiter>,
}

impl PriceQueryTool {
    pub fn new(orchestrator: Arc<QueryOrchestrator>, rate_limiter: Arc<RateLimiter>) -> Self {
        Self {
            orchestrator,
            rate_limiter,
        }
    }
}

#[async_trait]
impl ToolExecutor for PriceQueryTool {
    async fn execute(&self, arguments: Option<Value>) -> Result<Vec<ToolContent>> {
        log::debug!("Executing PriceQueryTool");
        let args = arguments.ok_or_else(|| anyhow!("Missing arguments"))?;

        let query = args
            .get("query")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("Missing or invalid query parameter"))?;

        if query.trim().is_empty() {
            return Err(anyhow!("Query is required"));
        }

        let client_id = args
            .get("client_id")
            .and_then(|v| v.as_str())
            .unwrap_or(DEFAULT_CLIENT);

        if !self.rate_limiter.check(client_id).await {
            return Err(anyhow!("Rate limit exceeded"));
        }

        let envelope = self.orchestrator.answer(query).await;

        Ok(vec![ToolContent::Text {
            text: serde_json::to_string_pretty(&envelope)?,
        }])
    }

    fn to_tool(&self) -> Tool {
        Tool {
            name: "price_query".into(),
            description: Some(
                "Answer a grocery price question across quick-commerce platforms \
                 (Blinkit, Zepto, Instamart, BigBasket)"
                    .into(),
            ),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "query": {
                        "type": "string",
                        "description": "A question such as 'Which app has cheapest onions right now?', 'Show products with 30% discount on Blinkit' or 'Find best deals for ₹500 grocery list'"
                    },
                    "client_id": {
                        "type": "string",
                        "description": "Identifier of the caller, used for rate limiting"
                    }
                },
                "required": ["query"]
            }),
        }
    }
}

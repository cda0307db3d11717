use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Result, anyhow};
use cache::{Clock, SystemClock};
use context_server::{ContextServer, ContextServerRpcRequest, ContextServerRpcResponse};
use context_server_utils::{
    prompt_registry::PromptRegistry, resource_registry::ResourceRegistry,
    tool_registry::ToolRegistry,
};
use directories::ProjectDirs;
use local_cache::LocalCache;
use price_query::{
    CompositeAuditLogger, Config, LogAuditLogger, MemoryAuditLog, MemoryCatalog,
    QueryOrchestrator,
};
use price_query_mcp_tools::{PriceQueryTool, QueryStatsTool, RateLimiter};
use tokio::io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader};

struct ContextServerState {
    rpc: ContextServer,
}

fn project_dirs() -> Result<ProjectDirs> {
    ProjectDirs::from("com", "quick-commerce", "price-compare-mcp")
        .ok_or_else(|| anyhow!("unable to find project directory"))
}

fn database_dir() -> Result<PathBuf> {
    Ok(project_dirs()?.data_dir().join("query_cache.db"))
}

fn price_catalog(config: &Config, clock: Arc<dyn Clock>) -> Result<Arc<MemoryCatalog>> {
    let catalog = match &config.price_catalog {
        Some(path) => MemoryCatalog::from_json_file(path, clock)?,
        None => {
            log::info!("PRICE_CATALOG not set, serving reference prices");
            MemoryCatalog::with_reference_prices(clock)
        }
    };
    Ok(Arc::new(catalog))
}

/// Sweeps expired answers right away and then once per `period`, so the
/// on-disk store never fills up with dead entries.
fn spawn_cache_sweeper(orchestrator: Arc<QueryOrchestrator>, period: Duration) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            if let Err(err) = orchestrator.sweep_expired() {
                log::warn!("failed to clear expired cache entries: {}", err);
            }
        }
    });
}

impl ContextServerState {
    fn new(config: Config) -> Result<Self> {
        let resource_registry = Arc::new(ResourceRegistry::default());

        let tool_registry = Arc::new(ToolRegistry::default());

        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let local_cache = Arc::new(LocalCache::new(database_dir()?, clock.clone())?);
        let catalog = price_catalog(&config, clock.clone())?;
        let audit_log = Arc::new(MemoryAuditLog::default());
        let audit_logger = CompositeAuditLogger::new()
            .with_logger(Arc::new(LogAuditLogger))
            .with_logger(audit_log.clone());

        let orchestrator = Arc::new(
            QueryOrchestrator::builder()
                .with_cache(local_cache)
                .with_executor(catalog.clone())
                .with_audit_logger(Arc::new(audit_logger))
                .with_clock(clock.clone())
                .with_config(&config)
                .build()?,
        );

        spawn_cache_sweeper(orchestrator.clone(), config.cache_sweep_interval);

        let rate_limiter = Arc::new(RateLimiter::new(
            config.rate_limit_window,
            config.rate_limit_max,
        ));
        tool_registry.register(Arc::new(PriceQueryTool::new(orchestrator, rate_limiter)));
        tool_registry.register(Arc::new(QueryStatsTool::new(audit_log, catalog, clock)));

        let prompt_registry = Arc::new(PromptRegistry::default());

        Ok(Self {
            rpc: ContextServer::builder()
                .with_server_info((env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")))
                .with_resources(resource_registry)
                .with_tools(tool_registry)
                .with_prompts(prompt_registry)
                .build()?,
        })
    }

    async fn process_request(
        &self,
        request: ContextServerRpcRequest,
    ) -> Result<Option<ContextServerRpcResponse>> {
        self.rpc.handle_incoming_message(request).await
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    let config = Config::from_env()?;
    log::info!(
        "starting {} ({:?}, cache ttl {:?})",
        env!("CARGO_PKG_NAME"),
        config.environment,
        config.cache_ttl
    );

    let state = ContextServerState::new(config)?;

    let mut stdin = BufReader::new(io::stdin()).lines();
    let mut stdout = io::stdout();

    while let Some(line) = stdin.next_line().await? {
        let request: ContextServerRpcRequest = match serde_json::from_str(&line) {
            Ok(req) => req,
            Err(e) => {
                log::error!("Error parsing request: {}", e);
                continue;
            }
        };

        if let Some(response) = state.process_request(request).await? {
            let response_json = serde_json::to_string(&response)?;
            stdout.write_all(response_json.as_bytes()).await?;
            stdout.write_all(b"\n").await?;
            stdout.flush().await?;
        }
    }

    Ok(())
}

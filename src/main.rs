//! Hornet 服务入口
//!
//! 启动: ANTHROPIC_API_KEY=... cargo run
//! 环境变量：GREEN_AGENT_MCP_URL / FALLBACK_MODEL / TOOL_TIMEOUT / TASK_TIMEOUT / RL_CACHE_DIR

use std::sync::Arc;

use hornet::config::load_config;
use hornet::llm::AnthropicClient;
use hornet::server::{router, AppState};
use hornet::worker::Worker;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    hornet::observability::init();

    let cfg = load_config(None)?;
    tracing::info!(
        cache_dir = %cfg.worker.cache_dir.display(),
        tools_endpoint = %cfg.tools.default_endpoint,
        "config loaded"
    );

    let llm = Arc::new(AnthropicClient::from_env(&cfg.llm)?);
    let port = cfg.server.port;
    let worker = Worker::new(cfg, llm);
    let state = Arc::new(AppState { worker });

    let app = router(state);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Hornet worker listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

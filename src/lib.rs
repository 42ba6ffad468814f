pub mod agent;
pub mod cache;
pub mod cli;
pub mod error;
pub mod history;
pub mod llm;
pub mod models;
pub mod rag;
pub mod server;
pub mod text;

use agent::ChatAgent;
use cli::Args;
use log::info;
use server::Server;
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

pub async fn run(args: Args) -> Result<(), Box<dyn Error + Send + Sync>> {
    info!("--- Core Configuration ---");
    info!("HTTP Address: {}", args.http_addr);
    info!("WebSocket Address: {}", args.server_addr);
    info!("Inference Backend: {}", args.ollama_url);
    info!("Default Model: {}", args.default_model);
    info!("Stream Timeout: {}s, Request Timeout: {}s", args.stream_timeout, args.request_timeout);
    info!("History Store Type: {}", args.history_type);
    info!("History Store Host: {}", args.history_host);
    info!("Cache Enabled: {}", args.enable_cache);
    if args.enable_cache {
        info!("Cache Type: {}", args.cache_type);
        info!("Cache TTL: {}s", args.cache_ttl);
        info!("Cache Sweep Interval: {}s", args.cache_sweep_interval);
    }
    info!("Search Endpoint: {}", args.search_url);
    info!("TLS Enabled: {}", args.enable_tls);
    info!("-------------------------");

    let agent = Arc::new(ChatAgent::from_args(&args).await?);
    agent.probe_backend().await;

    if args.cache_sweep_interval > 0 {
        if let Some(cache) = agent.cache() {
            cache.spawn_sweeper(Duration::from_secs(args.cache_sweep_interval));
        }
    }

    let server = Server::new(agent, args);
    server.run().await?;

    Ok(())
}

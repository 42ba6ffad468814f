pub mod api;
pub mod websocket;

use crate::agent::ChatAgent;
use crate::cli::Args;
use std::error::Error;
use std::sync::Arc;

pub struct Server {
    agent: Arc<ChatAgent>,
    args: Args,
}

impl Server {
    pub fn new(agent: Arc<ChatAgent>, args: Args) -> Self {
        Self { agent, args }
    }

    /// Starts the HTTP API in the background, then serves WebSocket
    /// connections until the listener fails.
    pub async fn run(&self) -> Result<(), Box<dyn Error + Send + Sync>> {
        self.start_http_server().await?;
        self.start_ws_server().await?;
        Ok(())
    }

    async fn start_http_server(&self) -> Result<(), Box<dyn Error + Send + Sync>> {
        api::start_http_server(self.agent.clone(), self.args.clone()).await
    }

    async fn start_ws_server(&self) -> Result<(), Box<dyn Error + Send + Sync>> {
        websocket::start_ws_server(self.agent.clone(), self.args.clone()).await
    }
}

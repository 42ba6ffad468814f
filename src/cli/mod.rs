use clap::{ ArgAction, Parser };

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    // --- Server Args ---
    /// Host address and port for the HTTP API (JSON and Server-Sent Events).
    #[arg(long, env = "HTTP_ADDR", default_value = "127.0.0.1:8000")]
    pub http_addr: String,

    /// Host address and port for the WebSocket server.
    #[arg(long, env = "SERVER_ADDR", default_value = "127.0.0.1:8001")]
    pub server_addr: String,

    /// Optional path to the TLS certificate file (PEM format). Requires --tls-key-path.
    #[arg(long, env = "TLS_CERT_PATH")]
    pub tls_cert_path: Option<String>,

    /// Optional path to the TLS private key file (PEM format). Requires --tls-cert-path.
    #[arg(long, env = "TLS_KEY_PATH")]
    pub tls_key_path: Option<String>,

    /// Serve both the HTTP API and the WebSocket server over TLS.
    #[arg(long, env = "ENABLE_TLS", default_value = "false")]
    pub enable_tls: bool,

    // --- Inference Backend Args ---
    /// Base URL of the Ollama-compatible inference service.
    #[arg(long, env = "OLLAMA_URL", default_value = "http://localhost:11434")]
    pub ollama_url: String,

    /// Model used when a request does not name one.
    #[arg(long, env = "DEFAULT_MODEL", default_value = "llama2")]
    pub default_model: String,

    /// Seconds to wait for the stream to connect and for each subsequent read.
    #[arg(long, env = "STREAM_TIMEOUT", default_value = "60")]
    pub stream_timeout: u64,

    /// Seconds allowed for a whole buffered completion.
    #[arg(long, env = "REQUEST_TIMEOUT", default_value = "300")]
    pub request_timeout: u64,

    // --- History Store Args ---
    /// History chat store type (sqlite, redis)
    #[arg(long, env = "HISTORY_TYPE", default_value = "sqlite")]
    pub history_type: String,

    /// SQLite database path, or Redis URL (e.g., redis://127.0.0.1:6379) when HISTORY_TYPE=redis
    #[arg(long, env = "HISTORY_HOST", default_value = "chat_history.db")]
    pub history_host: String,

    /// Prefix for Redis history keys.
    #[arg(long, env = "HISTORY_REDIS_PREFIX", default_value = "history:")]
    pub history_redis_prefix: String,

    // --- Caching Args ---
    /// Enable the response cache.
    #[arg(long, env = "ENABLE_CACHE", default_value = "true", action = ArgAction::Set)]
    pub enable_cache: bool,

    /// Response cache backend (disk, redis, memory)
    #[arg(long, env = "CACHE_TYPE", default_value = "disk")]
    pub cache_type: String,

    /// Directory for the disk cache backend.
    #[arg(long, env = "CACHE_DIR", default_value = ".cache")]
    pub cache_dir: String,

    /// Redis URL for the redis cache backend.
    #[arg(long, env = "CACHE_REDIS_URL", default_value = "redis://127.0.0.1:6379/1")] // Use DB 1 to avoid collision
    pub cache_redis_url: String,

    /// Time-to-live in seconds for cached responses.
    #[arg(long, env = "CACHE_TTL", default_value = "3600")] // 1 hour
    pub cache_ttl: u64,

    /// Seconds between background sweeps of expired cache entries. 0 disables the sweep.
    #[arg(long, env = "CACHE_SWEEP_INTERVAL", default_value = "600")]
    pub cache_sweep_interval: u64,

    // --- Web Search Args ---
    /// HTML search endpoint used for web-search augmentation.
    #[arg(long, env = "SEARCH_URL", default_value = "https://html.duckduckgo.com/html/")]
    pub search_url: String,

    /// Number of search results listed in the injected context.
    #[arg(long, env = "SEARCH_RESULTS", default_value = "5")]
    pub search_results: usize,

    /// Seconds allowed for each search or page fetch.
    #[arg(long, env = "WEB_TIMEOUT", default_value = "10")]
    pub web_timeout: u64,

    // --- General App Args ---
    /// Enable debug logging/output
    #[arg(long, env = "DEBUG", default_value = "false")]
    pub debug: bool,
}

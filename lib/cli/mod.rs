use crate::build_info;
use crate::worker::SourceKind;
use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(
    about = "Exports confirmed EVM chain data into Postgres with resumable checkpoints",
    version = build_info::VERSION_WITH_COMMIT,
    long_version = build_info::VERSION_WITH_COMMIT
)]
pub struct Cli {
    /// Data source to export (eth-blocks, eth-transfers, eth-receipts)
    #[arg(long, default_value = "eth-blocks")]
    pub source: SourceKind,

    /// JSON-RPC endpoint; overrides NODE_URL
    #[arg(long = "node-url")]
    pub node_url: Option<String>,
    /// Overrides DATABASE_URL
    #[arg(long = "database-url")]
    pub database_url: Option<String>,
    /// Pipeline name (checkpoint slot); overrides EXPORTER_NAME
    #[arg(long)]
    pub name: Option<String>,

    /// Blocks a head must be buried under before it is exported
    #[arg(long, default_value_t = 3)]
    pub confirmations: i64,
    /// Blocks per range task
    #[arg(long = "block-interval", default_value_t = 100)]
    pub block_interval: i64,
    /// Range tasks running at once
    #[arg(long, default_value_t = 8)]
    pub concurrency: usize,
    /// Running plus unreleased tasks; defaults to 4x concurrency
    #[arg(long = "max-pending")]
    pub max_pending: Option<usize>,
    #[arg(long = "loop-interval-ms", default_value_t = 3000)]
    pub loop_interval_ms: u64,
    /// First block exported when no checkpoint exists
    #[arg(long = "start-block", default_value_t = 0)]
    pub start_block: i64,

    #[arg(long = "rpc-timeout-ms", default_value_t = 10_000)]
    pub rpc_timeout_ms: u64,
    /// Global RPC request budget per second
    #[arg(long = "rpc-rps", default_value_t = 50)]
    pub rpc_rps: u32,
    #[arg(long = "retry-attempts", default_value_t = 5)]
    pub retry_attempts: u32,
    #[arg(long = "retry-initial-ms", default_value_t = 100)]
    pub retry_initial_ms: u64,
    #[arg(long = "retry-max-ms", default_value_t = 5000)]
    pub retry_max_ms: u64,
    #[arg(long = "retry-jitter-ms", default_value_t = 25)]
    pub retry_jitter_ms: u64,

    /// Max age of the last successful append before /health turns unhealthy
    #[arg(long = "health-timeout-secs", default_value_t = 900)]
    pub health_timeout_secs: u64,
    #[arg(long = "metrics-bind", default_value = "0.0.0.0:3000")]
    pub metrics_bind: String,
    /// Topic name prefix; defaults to the pipeline name
    #[arg(long = "topic-prefix")]
    pub topic_prefix: Option<String>,
    #[arg(long = "db-pool-size", default_value_t = 4)]
    pub db_pool_size: usize,

    #[arg(long = "log-level", default_value = "info")]
    pub log_level: String,
}

pub fn parse_args() -> Cli {
    Cli::parse()
}

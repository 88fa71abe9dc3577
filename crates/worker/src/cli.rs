use clap::Parser;
use reqwest::Url;

use poolhand_engine::WorkerConfig;

#[derive(Debug, Clone, Parser)]
#[command(
    name = "poolhand",
    version,
    about = "Work-pool worker for Prefect-compatible orchestration APIs"
)]
pub struct Cli {
    /// Base URL of the orchestration API.
    #[arg(
        long,
        env = "PREFECT_API_URL",
        default_value = "http://127.0.0.1:4200/api"
    )]
    pub api_url: Url,

    /// API key sent as a bearer token.
    #[arg(long, env = "PREFECT_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Name of the work pool to poll.
    #[arg(short = 'p', long = "pool", env = "PREFECT_WORKER_POOL")]
    pub pool: String,

    /// Work queue to poll (repeatable). Defaults to every queue in the pool.
    #[arg(short = 'q', long = "work-queue")]
    pub work_queues: Vec<String>,

    /// Worker name; generated when omitted. Cannot contain '/' or '%'.
    #[arg(short = 'n', long)]
    pub name: Option<String>,

    /// Worker type, resolved through the registry.
    #[arg(short = 't', long = "type", default_value = "process")]
    pub worker_type: String,

    /// Seconds of look-ahead when querying scheduled flow runs.
    #[arg(
        long,
        env = "PREFECT_WORKER_PREFETCH_SECONDS",
        default_value_t = WorkerConfig::DEFAULT_PREFETCH_SECONDS
    )]
    pub prefetch_seconds: f64,

    /// Seconds between poll cycles.
    #[arg(long, env = "PREFECT_WORKER_QUERY_SECONDS", default_value_t = 10.0)]
    pub query_seconds: f64,

    /// Maximum number of flow runs to keep in flight at once.
    #[arg(short = 'l', long)]
    pub limit: Option<usize>,

    /// Do not create the work pool when it does not exist.
    #[arg(long, default_value_t = false)]
    pub no_create_pool: bool,
}

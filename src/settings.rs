// afc-server: Service settings

use clap::Parser;

/// AFC request coordinator settings, taken from the command line or from
/// environment variables
#[derive(Debug, Clone, Parser)]
#[command(name = "afc-server", about = "AFC spectrum-availability request coordinator")]
pub struct Settings {
    /// Port the coordinator listens on
    #[arg(long, env = "AFC_SERVER_PORT", default_value_t = 8000)]
    pub port: u16,

    /// Response cache Postgres DSN
    #[arg(long, env = "RCACHE_POSTGRES_DSN")]
    pub rcache_dsn: String,

    /// Registration database (configs, certifications) Postgres DSN
    #[arg(long, env = "AFC_SERVER_RATDB_DSN")]
    pub ratdb_dsn: String,

    /// AMQP DSN for worker responses and task submission
    #[arg(long, env = "RCACHE_RMQ_DSN")]
    pub rmq_dsn: String,

    /// Base URL of the cache service control plane; cache updates are
    /// disabled when absent
    #[arg(long, env = "RCACHE_SERVICE_URL")]
    pub rcache_service_url: Option<String>,

    /// Base URL of the object store; history artifacts are skipped when
    /// absent
    #[arg(long, env = "AFC_OBJST_URL")]
    pub objst_url: Option<String>,

    /// Worker-side mount path of static data
    #[arg(long, env = "NFS_MOUNT_PATH")]
    pub static_data_root: Option<String>,

    /// Maximum request processing duration in seconds
    #[arg(long, env = "AFC_SERVER_REQUEST_TIMEOUT", default_value_t = 180.0)]
    pub request_timeout: f64,

    /// Maximum EDEBUG request processing duration in seconds
    #[arg(long, env = "AFC_SERVER_REQUEST_TIMEOUT_EDEBUG", default_value_t = 1800.0)]
    pub request_timeout_edebug: f64,

    /// AFC Config refresh interval in seconds
    #[arg(long, env = "AFC_SERVER_CONFIG_REFRESH", default_value_t = 60.0)]
    pub config_refresh: f64,

    /// Engine request type
    #[arg(long, env = "AFC_SERVER_ENGINE_REQUEST_TYPE", default_value = "AP-AFC")]
    pub engine_request_type: String,

    /// Task queue the engine workers consume
    #[arg(long, env = "AFC_SERVER_TASK_QUEUE", default_value = "celery")]
    pub task_queue: String,

    /// Response vendor extensions carried from cached responses into
    /// dispatched requests
    #[arg(long, env = "AFC_STATE_VENDOR_EXTENSIONS", value_delimiter = ',')]
    pub afc_state_vendor_extensions: Vec<String>,

    /// Bypass the certification lookup (always respond affirmatively).
    /// For performance estimation purposes.
    #[arg(long, env = "AFC_SERVER_BYPASS_CERT", default_value_t = false)]
    pub bypass_cert: bool,

    /// Log level filter (tracing env-filter syntax)
    #[arg(long, env = "AFC_SERVER_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

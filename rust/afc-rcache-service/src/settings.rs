// afc-rcache-service: Service settings

use clap::Parser;

/// Cache service settings, taken from the command line or from
/// environment variables
#[derive(Debug, Clone, Parser)]
#[command(name = "afc-rcache-service", about = "AFC response cache service")]
pub struct Settings {
    /// Port the control plane listens on
    #[arg(long, env = "RCACHE_CLIENT_PORT", default_value_t = 8437)]
    pub port: u16,

    /// Response cache Postgres DSN
    #[arg(long, env = "RCACHE_POSTGRES_DSN")]
    pub postgres_dsn: String,

    /// Create cache tables when absent
    #[arg(
        long,
        env = "RCACHE_CREATE_TABLES",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub create_tables: bool,

    /// Maximum number of precomputing requests in flight
    #[arg(long, env = "RCACHE_PRECOMPUTE_QUOTA", default_value_t = 10)]
    pub precompute_quota: usize,

    /// Ingress URL requests are POSTed to for precomputation; precomputation
    /// is disabled when absent
    #[arg(long, env = "RCACHE_AFC_REQ_URL")]
    pub afc_req_url: Option<String>,

    /// URL returning the list of active ruleset IDs
    #[arg(long, env = "RCACHE_RULESETS_URL")]
    pub rulesets_url: Option<String>,

    /// URL prefix for retrieving an AFC Config by ruleset ID
    #[arg(long, env = "RCACHE_CONFIG_RETRIEVAL_URL")]
    pub config_retrieval_url: Option<String>,

    /// Log level filter (tracing env-filter syntax)
    #[arg(long, env = "RCACHE_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

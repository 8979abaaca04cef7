// afc-rcache-service: Cache service entry point

use std::sync::Arc;

use afc_rcache::store::{CacheStore, PgCacheStore};
use afc_rcache_service::control::{self, ControlState};
use afc_rcache_service::metrics::ServiceMetrics;
use afc_rcache_service::{RcacheService, ServiceConfig, Settings};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;

fn trimmed(url: &Option<String>) -> Option<String> {
    url.as_ref().map(|url| url.trim_end_matches('/').to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_new(&settings.log_level)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting AFC response cache service");

    let store = PgCacheStore::connect(&settings.postgres_dsn, 10).await?;
    if settings.create_tables {
        store.init_schema().await?;
    }
    let store: Arc<dyn CacheStore> = Arc::new(store);

    let metrics = Arc::new(ServiceMetrics::new());
    let service = RcacheService::new(
        store,
        ServiceConfig {
            precompute_quota: settings.precompute_quota,
            afc_req_url: trimmed(&settings.afc_req_url),
            rulesets_url: trimmed(&settings.rulesets_url),
            config_retrieval_url: trimmed(&settings.config_retrieval_url),
        },
        Arc::clone(&metrics),
    );
    service.mark_db_connected();
    let workers = service.spawn_workers();

    let state = Arc::new(ControlState {
        service: Arc::clone(&service),
        metrics,
    });
    let listener = TcpListener::bind(("0.0.0.0", settings.port)).await?;
    info!("Control plane listening on http://0.0.0.0:{}", settings.port);
    axum::serve(listener, control::router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    info!("Shutting down");
    for worker in workers {
        worker.abort();
    }
    info!("Cache service stopped");
    Ok(())
}

// afc-server: Coordinator service entry point

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use afc_rcache::bus::BusReceiver;
use afc_rcache::client::RcacheClient;
use afc_rcache::store::PgCacheStore;
use afc_server::certs::{BypassCertAuthority, CertAuthority, PgCertAuthority};
use afc_server::compute::ComputeClient;
use afc_server::config_dispenser::{ConfigDispenser, PgConfigSource};
use afc_server::dispatch::QueueDispatcher;
use afc_server::http::{self, AppState};
use afc_server::metrics::Metrics;
use afc_server::objst::ObjstClient;
use afc_server::{MessageProcessor, ProcessorConfig, Settings};
use clap::Parser;
use sqlx::postgres::PgPoolOptions;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_new(&settings.log_level)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting AFC request coordinator");

    let cache = Arc::new(PgCacheStore::connect(&settings.rcache_dsn, 10).await?);
    let ratdb = PgPoolOptions::new()
        .max_connections(10)
        .connect(&settings.ratdb_dsn)
        .await?;
    let certs: Arc<dyn CertAuthority> = if settings.bypass_cert {
        warn!("Certification lookup is bypassed");
        Arc::new(BypassCertAuthority)
    } else {
        Arc::new(PgCertAuthority::new(ratdb.clone()))
    };
    let dispenser = ConfigDispenser::new(
        Arc::new(PgConfigSource::new(ratdb)),
        Duration::from_secs_f64(settings.config_refresh),
    );

    let bus = Arc::new(BusReceiver::connect(&settings.rmq_dsn).await?);
    info!("Response queue: {}", bus.queue_name());

    let objst = settings.objst_url.as_deref().map(ObjstClient::new);
    let dispatcher = Arc::new(
        QueueDispatcher::connect(
            &settings.rmq_dsn,
            &settings.task_queue,
            &settings.engine_request_type,
            settings.static_data_root.clone(),
            objst,
        )
        .await?,
    );
    let rcache_client = settings
        .rcache_service_url
        .as_deref()
        .map(|url| Arc::new(RcacheClient::new(url)));
    if rcache_client.is_none() {
        warn!("Cache service URL not set; computed responses will not be cached");
    }
    let compute = Arc::new(ComputeClient::new(
        dispatcher,
        bus.queue_name().to_string(),
        rcache_client,
    ));

    let metrics = Arc::new(Metrics::new());
    let processor = Arc::new(MessageProcessor::new(
        cache,
        certs,
        dispenser,
        Arc::clone(&compute),
        Arc::clone(&metrics),
        ProcessorConfig {
            request_timeout: Duration::from_secs_f64(settings.request_timeout),
            edebug_request_timeout: Duration::from_secs_f64(settings.request_timeout_edebug),
            state_vendor_extensions: settings.afc_state_vendor_extensions.clone(),
        },
    ));

    // Bus reader: correlates worker responses back to waiting requests.
    // Its death makes the service unhealthy but keeps it serving cache
    // hits and validation errors.
    let healthy = Arc::new(AtomicBool::new(true));
    let reader = {
        let bus = Arc::clone(&bus);
        let compute = Arc::clone(&compute);
        let healthy = Arc::clone(&healthy);
        tokio::spawn(async move {
            if let Err(err) = bus.run(|rrk| compute.handle_delivery(rrk)).await {
                error!("Bus reader unexpectedly aborted: {err}");
            }
            healthy.store(false, Ordering::SeqCst);
        })
    };

    let state = Arc::new(AppState {
        processor,
        metrics,
        healthy,
    });
    let listener = TcpListener::bind(("0.0.0.0", settings.port)).await?;
    info!("Listening on http://0.0.0.0:{}", settings.port);
    axum::serve(listener, http::router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    info!("Shutting down");
    reader.abort();
    if let Err(err) = bus.close().await {
        warn!("Failed to delete response queue: {err}");
    }
    compute.inflight().cancel_all();
    info!("Coordinator stopped");
    Ok(())
}

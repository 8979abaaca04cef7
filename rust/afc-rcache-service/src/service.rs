// afc-rcache-service: Cache service background activities
//
// Four long-lived tasks over one shared store: the updater drains the
// update queue into bulk UPSERTs, the invalidator consumes invalidation
// requests (complete, per-ruleset, spatial with FS-coverage dilation),
// the precomputer re-drives Invalid rows through the service's own
// ingress bounded by a quota derived from the database, and the averager
// maintains the EMA figures of the status document. A panic or error in
// one task marks the service unhealthy but the others keep running.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use afc_rcache::ema::Ema;
use afc_rcache::error::{RcacheError, RcacheResult};
use afc_rcache::models::{
    ApPk, ApRecord, ConfigLinkDistance, FuncSwitch, RcacheInvalidateReq,
    RcacheSpatialInvalidateReq, RcacheStatus, RcacheUpdateReq, ReqRespKey, RulesetIds,
};
use afc_rcache::store::CacheStore;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::metrics::ServiceMetrics;

/// Default maximum distance between FS and AP in kilometers
pub const DEFAULT_MAX_LINK_DISTANCE_KM: f64 = 200.0;

/// Length of the EMA averaging window
const AVERAGING_WINDOW_SIZE: u32 = 10;

/// Maximum number of rows invalidated in one statement. Used for complete
/// and per-ruleset invalidation; spatial invalidation is naturally bounded
/// by the tile.
const INVALIDATION_CHUNK_SIZE: i64 = 1000;

/// Fallback tick of the precomputer when no signal arrives
const PRECOMPUTE_TICK: Duration = Duration::from_secs(5);

/// Poll period while a function switch is off
const SWITCH_POLL: Duration = Duration::from_secs(1);

/// Service endpoints and quotas
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Maximum number of precomputing requests in flight
    pub precompute_quota: usize,
    /// Ingress URL requests are POSTed to for precomputation; `None`
    /// disables precomputation
    pub afc_req_url: Option<String>,
    /// URL returning the list of active ruleset IDs; `None` falls back to
    /// the default maximum link distance
    pub rulesets_url: Option<String>,
    /// URL prefix for retrieving an AFC Config by ruleset ID
    pub config_retrieval_url: Option<String>,
}

enum InvalidationJob {
    Rulesets(RcacheInvalidateReq),
    Spatial(RcacheSpatialInvalidateReq),
}

struct EmaSet {
    updated_rate: Ema,
    update_queue_len: Ema,
    precomputation_rate: Ema,
    schedule_lag: Ema,
}

/// Manager of all cache-service activities
pub struct RcacheService {
    store: Arc<dyn CacheStore>,
    config: ServiceConfig,
    http: reqwest::Client,
    metrics: Arc<ServiceMetrics>,
    start_time: Instant,
    update_tx: mpsc::UnboundedSender<ReqRespKey>,
    update_rx: Mutex<Option<mpsc::UnboundedReceiver<ReqRespKey>>>,
    invalidation_tx: mpsc::UnboundedSender<InvalidationJob>,
    invalidation_rx: Mutex<Option<mpsc::UnboundedReceiver<InvalidationJob>>>,
    precompute_event: Arc<Notify>,
    precompute_quota: AtomicUsize,
    update_queue_len: AtomicUsize,
    updated_count: AtomicU64,
    precompute_count: AtomicU64,
    active_precomputations: AtomicUsize,
    emas: Mutex<EmaSet>,
    all_tasks_running: AtomicBool,
    db_connected: AtomicBool,
}

impl RcacheService {
    pub fn new(
        store: Arc<dyn CacheStore>,
        config: ServiceConfig,
        metrics: Arc<ServiceMetrics>,
    ) -> Arc<RcacheService> {
        let (update_tx, update_rx) = mpsc::unbounded_channel();
        let (invalidation_tx, invalidation_rx) = mpsc::unbounded_channel();
        let quota = config.precompute_quota;
        // Initial permit lets the precomputer make a pass right at startup
        let precompute_event = Arc::new(Notify::new());
        precompute_event.notify_one();
        Arc::new(RcacheService {
            store,
            config,
            http: reqwest::Client::new(),
            metrics,
            start_time: Instant::now(),
            update_tx,
            update_rx: Mutex::new(Some(update_rx)),
            invalidation_tx,
            invalidation_rx: Mutex::new(Some(invalidation_rx)),
            precompute_event,
            precompute_quota: AtomicUsize::new(quota),
            update_queue_len: AtomicUsize::new(0),
            updated_count: AtomicU64::new(0),
            precompute_count: AtomicU64::new(0),
            active_precomputations: AtomicUsize::new(0),
            emas: Mutex::new(EmaSet {
                updated_rate: Ema::new(AVERAGING_WINDOW_SIZE, true),
                update_queue_len: Ema::new(AVERAGING_WINDOW_SIZE, false),
                precomputation_rate: Ema::new(AVERAGING_WINDOW_SIZE, true),
                schedule_lag: Ema::new(AVERAGING_WINDOW_SIZE, false),
            }),
            all_tasks_running: AtomicBool::new(true),
            db_connected: AtomicBool::new(false),
        })
    }

    pub fn mark_db_connected(&self) {
        self.db_connected.store(true, Ordering::SeqCst);
    }

    /// Service is serving and no background task has died
    pub fn healthy(&self) -> bool {
        self.all_tasks_running.load(Ordering::SeqCst) && self.db_connected.load(Ordering::SeqCst)
    }

    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }

    // Switches

    pub async fn get_invalidation_enabled(&self) -> RcacheResult<bool> {
        self.store.get_switch(FuncSwitch::Invalidate).await
    }

    pub async fn set_invalidation_enabled(&self, value: bool) -> RcacheResult<()> {
        info!("Invalidation enabled: {value}");
        self.store.set_switch(FuncSwitch::Invalidate, value).await
    }

    pub async fn get_precomputation_enabled(&self) -> RcacheResult<bool> {
        self.store.get_switch(FuncSwitch::Precompute).await
    }

    pub async fn set_precomputation_enabled(&self, value: bool) -> RcacheResult<()> {
        info!("Precomputation enabled: {value}");
        self.store.set_switch(FuncSwitch::Precompute, value).await
    }

    pub async fn get_update_enabled(&self) -> RcacheResult<bool> {
        self.store.get_switch(FuncSwitch::Update).await
    }

    pub async fn set_update_enabled(&self, value: bool) -> RcacheResult<()> {
        info!("Update enabled: {value}");
        self.store.set_switch(FuncSwitch::Update, value).await
    }

    pub fn precompute_quota(&self) -> usize {
        self.precompute_quota.load(Ordering::SeqCst)
    }

    pub fn set_precompute_quota(&self, value: usize) {
        info!("Precompute quota: {value}");
        self.precompute_quota.store(value, Ordering::SeqCst);
    }

    // Queues

    /// Enqueues arrived update requests
    pub fn enqueue_update(&self, req: RcacheUpdateReq) {
        for rrk in req.req_resp_keys {
            self.update_queue_len.fetch_add(1, Ordering::SeqCst);
            let _ = self.update_tx.send(rrk);
        }
    }

    /// Enqueues a complete or per-ruleset invalidation request
    pub fn enqueue_invalidation(&self, req: RcacheInvalidateReq) {
        match &req.ruleset_ids {
            None => info!("Invalidation requested: all entries"),
            Some(rulesets) => info!("Invalidation requested: rulesets {rulesets:?}"),
        }
        let _ = self.invalidation_tx.send(InvalidationJob::Rulesets(req));
    }

    /// Enqueues a spatial invalidation request
    pub fn enqueue_spatial_invalidation(&self, req: RcacheSpatialInvalidateReq) {
        for tile in &req.tiles {
            info!("Invalidation requested: tile {}", tile.short_str());
        }
        let _ = self.invalidation_tx.send(InvalidationJob::Spatial(req));
    }

    /// Current service status
    pub async fn status(&self) -> RcacheStatus {
        let db_connected = self.db_connected.load(Ordering::SeqCst);
        let num_invalid = if db_connected {
            self.store.num_invalid().await.unwrap_or(-1)
        } else {
            -1
        };
        let num_valid = if db_connected {
            match self.store.cache_size().await {
                Ok(total) => (total - num_invalid).max(0),
                Err(_) => -1,
            }
        } else {
            -1
        };
        let invalidation_enabled = self.get_invalidation_enabled().await.unwrap_or(false);
        let precomputation_enabled = self.get_precomputation_enabled().await.unwrap_or(false);
        let update_enabled = self.get_update_enabled().await.unwrap_or(false);
        let emas = self.emas.lock();
        RcacheStatus {
            up_time_sec: self.start_time.elapsed().as_secs_f64(),
            db_connected,
            all_tasks_running: self.all_tasks_running.load(Ordering::SeqCst),
            invalidation_enabled,
            precomputation_enabled,
            update_enabled,
            precomputation_quota: self.precompute_quota(),
            num_valid_entries: num_valid,
            num_invalid_entries: num_invalid,
            update_queue_len: self.update_queue_len.load(Ordering::SeqCst),
            update_count: self.updated_count.load(Ordering::SeqCst),
            avg_update_write_rate: emas.updated_rate.get(),
            avg_update_queue_len: emas.update_queue_len.get(),
            num_precomputed: self.precompute_count.load(Ordering::SeqCst),
            active_precomputations: self.active_precomputations.load(Ordering::SeqCst),
            avg_precomputation_rate: emas.precomputation_rate.get(),
            avg_schedule_lag: emas.schedule_lag.get(),
        }
    }

    // Workers

    /// Spawns all background tasks; each failure marks the service
    /// unhealthy without stopping the siblings
    pub fn spawn_workers(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        vec![
            self.spawn_guarded("Updater", |service| async move {
                service.updater_worker().await
            }),
            self.spawn_guarded("Invalidator", |service| async move {
                service.invalidator_worker().await
            }),
            self.spawn_guarded("Precomputer", |service| async move {
                service.precomputer_worker().await
            }),
            self.spawn_guarded("Averager", |service| async move {
                service.averager_worker().await
            }),
        ]
    }

    fn spawn_guarded<F, Fut>(self: &Arc<Self>, name: &'static str, worker: F) -> JoinHandle<()>
    where
        F: FnOnce(Arc<RcacheService>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = RcacheResult<()>> + Send + 'static,
    {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = worker(Arc::clone(&service)).await {
                service.all_tasks_running.store(false, Ordering::SeqCst);
                error!("{name} task unexpectedly aborted: {err}");
            }
        })
    }

    /// Drains the update queue into bulk writes
    async fn updater_worker(self: Arc<Self>) -> RcacheResult<()> {
        let mut rx = self
            .update_rx
            .lock()
            .take()
            .ok_or_else(|| RcacheError::BadRecord("updater already running".to_string()))?;
        loop {
            let Some(first) = rx.recv().await else {
                return Ok(());
            };
            let mut bulk = std::collections::HashMap::new();
            self.collect_update(&mut bulk, first);
            while bulk.len() < self.store.max_update_records() {
                match rx.try_recv() {
                    Ok(rrk) => self.collect_update(&mut bulk, rrk),
                    Err(_) => break,
                }
            }
            if !bulk.is_empty() && self.store.get_switch(FuncSwitch::Update).await? {
                let written = bulk.len() as u64;
                self.store
                    .update_cache(bulk.into_values().collect())
                    .await?;
                self.updated_count.fetch_add(written, Ordering::SeqCst);
                self.metrics.updates.inc_by(written);
                self.precompute_event.notify_one();
            }
        }
    }

    fn collect_update(
        &self,
        bulk: &mut std::collections::HashMap<ApPk, ApRecord>,
        rrk: ReqRespKey,
    ) {
        self.update_queue_len.fetch_sub(1, Ordering::SeqCst);
        match ApRecord::from_req_resp_key(&rrk) {
            Ok(Some(record)) => {
                bulk.insert(record.pk(), record);
            }
            Ok(None) => {}
            Err(err) => error!("Invalid format of cache update data: {err}"),
        }
    }

    /// Consumes invalidation requests
    async fn invalidator_worker(self: Arc<Self>) -> RcacheResult<()> {
        let mut rx = self
            .invalidation_rx
            .lock()
            .take()
            .ok_or_else(|| RcacheError::BadRecord("invalidator already running".to_string()))?;
        loop {
            let Some(job) = rx.recv().await else {
                return Ok(());
            };
            while !self.store.get_switch(FuncSwitch::Invalidate).await? {
                tokio::time::sleep(SWITCH_POLL).await;
            }
            self.metrics.invalidations.inc();
            let mut invalid_before = self.store.num_invalid().await?;
            match job {
                InvalidationJob::Rulesets(req) => match req.ruleset_ids {
                    None => {
                        while self.store.invalidate(None, INVALIDATION_CHUNK_SIZE).await? > 0 {}
                        self.report_invalidation("Complete invalidation", invalid_before)
                            .await?;
                    }
                    Some(rulesets) => {
                        for ruleset in rulesets {
                            while self
                                .store
                                .invalidate(Some(&ruleset), INVALIDATION_CHUNK_SIZE)
                                .await?
                                > 0
                            {}
                            invalid_before = self
                                .report_invalidation(
                                    &format!("AFC Config for ruleset '{ruleset}' invalidation"),
                                    invalid_before,
                                )
                                .await?;
                        }
                    }
                },
                InvalidationJob::Spatial(req) => {
                    let max_link_distance_km = self.max_link_distance_km().await;
                    for tile in req.tiles {
                        for rect in tile.dilated(max_link_distance_km).normalized() {
                            self.store.spatial_invalidate(&rect).await?;
                        }
                        invalid_before = self
                            .report_invalidation(
                                &format!(
                                    "Spatial invalidation for tile <{}> with clearance of {}km",
                                    tile.short_str(),
                                    max_link_distance_km
                                ),
                                invalid_before,
                            )
                            .await?;
                    }
                }
            }
            self.precompute_event.notify_one();
        }
    }

    async fn report_invalidation(&self, dsc: &str, invalid_before: i64) -> RcacheResult<i64> {
        let invalid_after = self.store.num_invalid().await?;
        info!(
            "{dsc}: {invalid_before} invalid before operation, {invalid_after} after, \
             increase of {}",
            invalid_after - invalid_before
        );
        Ok(invalid_after)
    }

    /// Re-drives Invalid rows through the service's own ingress
    async fn precomputer_worker(self: Arc<Self>) -> RcacheResult<()> {
        let Some(afc_req_url) = self.config.afc_req_url.clone() else {
            return Ok(());
        };
        self.store.reset_precomputations().await?;
        loop {
            while !self.store.get_switch(FuncSwitch::Precompute).await? {
                tokio::time::sleep(SWITCH_POLL).await;
            }
            tokio::select! {
                _ = self.precompute_event.notified() => {}
                _ = tokio::time::sleep(PRECOMPUTE_TICK) => {}
            }
            let remaining_quota =
                self.precompute_quota() as i64 - self.store.num_precomputing().await?;
            if remaining_quota <= 0 {
                continue;
            }
            let invalid_reqs = self.store.get_invalid_reqs(remaining_quota).await?;
            if invalid_reqs.is_empty() {
                continue;
            }
            // More invalid rows may remain; keep the pump going
            self.precompute_event.notify_one();
            for req in invalid_reqs {
                self.precompute_count.fetch_add(1, Ordering::SeqCst);
                self.metrics.precomputations.inc();
                self.active_precomputations.fetch_add(1, Ordering::SeqCst);
                let service = Arc::clone(&self);
                let url = afc_req_url.clone();
                tokio::spawn(async move {
                    service.single_precompute(&url, &req).await;
                    service
                        .active_precomputations
                        .fetch_sub(1, Ordering::SeqCst);
                });
            }
        }
    }

    /// POSTs one stored request back to the ingress; the normal pipeline
    /// refills the cache. A non-OK status means the row no longer maps to
    /// a servable request and is dropped.
    async fn single_precompute(&self, url: &str, req_str: &str) {
        let body: Value = match serde_json::from_str(req_str) {
            Ok(body) => body,
            Err(err) => {
                error!("Stored precomputation request does not parse: {err}");
                return;
            }
        };
        match self.http.post(url).json(&body).send().await {
            Ok(resp) if resp.status().is_success() => {}
            Ok(resp) => {
                info!(
                    "Precomputation request rejected with {}; dropping row",
                    resp.status()
                );
                if let Ok(pk) = ApPk::from_request_str(req_str) {
                    if let Err(err) = self.store.delete(&pk).await {
                        error!("Failed to drop rejected cache row: {err}");
                    }
                }
            }
            Err(err) => error!("Precomputation request failed: {err}"),
        }
    }

    /// Maximum of `maxLinkDistance` across active rulesets' configs, with
    /// a fixed fallback when the config service is unreachable
    async fn max_link_distance_km(&self) -> f64 {
        if let (Some(rulesets_url), Some(config_url)) =
            (&self.config.rulesets_url, &self.config.config_retrieval_url)
        {
            match self.try_max_link_distance(rulesets_url, config_url).await {
                Ok(Some(km)) => return km,
                Ok(None) => {}
                Err(err) => error!("Error retrieving maximum maxLinkDistance: {err}"),
            }
        }
        error!(
            "Default maximum maxLinkDistance of {DEFAULT_MAX_LINK_DISTANCE_KM}km will be used"
        );
        DEFAULT_MAX_LINK_DISTANCE_KM
    }

    async fn try_max_link_distance(
        &self,
        rulesets_url: &str,
        config_url: &str,
    ) -> RcacheResult<Option<f64>> {
        let resp = self.http.get(rulesets_url).send().await?;
        if !resp.status().is_success() {
            return Err(RcacheError::Http(
                "Can't receive list of active configurations".to_string(),
            ));
        }
        let rulesets: RulesetIds = resp.json().await?;
        let mut ret: Option<f64> = None;
        for ruleset in rulesets.ruleset_ids {
            let resp = self.http.get(format!("{config_url}/{ruleset}")).send().await?;
            if !resp.status().is_success() {
                continue;
            }
            let config: ConfigLinkDistance = match resp.json().await {
                Ok(config) => config,
                Err(_) => continue,
            };
            ret = Some(ret.map_or(config.max_link_distance, |max| {
                max.max(config.max_link_distance)
            }));
        }
        Ok(ret)
    }

    /// Once a second: schedule lag and rate averages
    async fn averager_worker(self: Arc<Self>) -> RcacheResult<()> {
        loop {
            let tick_start = Instant::now();
            tokio::time::sleep(Duration::from_secs(1)).await;
            let lag = tick_start.elapsed().as_secs_f64() - 1.0;
            let mut emas = self.emas.lock();
            emas.schedule_lag.periodic_update(lag);
            emas.update_queue_len
                .periodic_update(self.update_queue_len.load(Ordering::SeqCst) as f64);
            emas.updated_rate
                .periodic_update(self.updated_count.load(Ordering::SeqCst) as f64);
            emas.precomputation_rate
                .periodic_update(self.precompute_count.load(Ordering::SeqCst) as f64);
        }
    }
}

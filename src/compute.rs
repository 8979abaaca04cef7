// afc-server: Engine computation client
//
// One outbound compute job per fingerprint: the first caller owns the
// dispatch, later callers for the same fingerprint attach to the pending
// entry, and the bus delivery completes every waiter at once.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use afc_rcache::models::{RcacheUpdateReq, ReqRespKey};
use afc_rcache::client::RcacheClient;
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{error, warn};

use crate::error::{AfcError, AfcResult};

/// Runtime-option bits passed to the engine
pub const RNTM_OPT_CERT_ID: u32 = 1;
pub const RNTM_OPT_DBG: u32 = 2;
pub const RNTM_OPT_GUI: u32 = 4;
pub const RNTM_OPT_AFCENGINE_HTTP_IO: u32 = 8;
pub const RNTM_OPT_SLOW_DBG: u32 = 16;

/// Everything a worker needs to run one computation
#[derive(Debug, Clone)]
pub struct EngineJob {
    pub request_str: String,
    pub config_str: String,
    pub req_cfg_digest: String,
    pub runtime_opts: u32,
    pub task_id: String,
    pub history_dir: Option<String>,
    /// Deadline as seconds since the Unix epoch
    pub deadline_epoch: f64,
    /// Bus queue the worker publishes the result to
    pub response_queue: String,
}

/// Submits compute jobs toward the worker fleet. Submission is
/// fire-and-forget: errors are logged by the implementation and the
/// caller's deadline produces the timeout.
#[async_trait]
pub trait EngineDispatcher: Send + Sync {
    async fn dispatch(&self, job: EngineJob);
}

enum Completion {
    Pending,
    Done(Option<String>),
}

struct Inflight {
    /// Distinguishes this flight from a later one under the same digest
    flight_id: u64,
    tx: watch::Sender<Arc<Completion>>,
    waiters: usize,
}

/// Mutex-guarded map fingerprint -> (completion channel + refcount)
#[derive(Default)]
pub struct InflightTable {
    inner: Mutex<HashMap<String, Inflight>>,
    next_flight_id: std::sync::atomic::AtomicU64,
}

impl InflightTable {
    /// Attaches to the pending computation for a fingerprint, creating
    /// the entry when absent. Returns the completion receiver, whether
    /// the caller owns the dispatch, and the flight id to detach with.
    fn join(&self, digest: &str) -> (watch::Receiver<Arc<Completion>>, bool, u64) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.get_mut(digest) {
            entry.waiters += 1;
            return (entry.tx.subscribe(), false, entry.flight_id);
        }
        let flight_id = self
            .next_flight_id
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let (tx, rx) = watch::channel(Arc::new(Completion::Pending));
        inner.insert(
            digest.to_string(),
            Inflight {
                flight_id,
                tx,
                waiters: 1,
            },
        );
        (rx, true, flight_id)
    }

    /// Detaches one waiter; the entry disappears with its last waiter so
    /// an abandoned computation does not block future dispatches. A
    /// completed flight is already gone; the id keeps a late leave from
    /// touching a successor flight under the same digest.
    fn leave(&self, digest: &str, flight_id: u64) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.get_mut(digest) {
            if entry.flight_id != flight_id {
                return;
            }
            entry.waiters -= 1;
            if entry.waiters == 0 {
                inner.remove(digest);
            }
        }
    }

    /// Completes every waiter of a fingerprint. A digest with no pending
    /// entry is a duplicate or late delivery and is ignored.
    pub fn complete(&self, digest: &str, response: Option<String>) {
        let entry = self.inner.lock().remove(digest);
        if let Some(entry) = entry {
            entry.tx.send_replace(Arc::new(Completion::Done(response)));
        }
    }

    /// Fails every pending computation; used at shutdown
    pub fn cancel_all(&self) {
        let entries: Vec<Inflight> = {
            let mut inner = self.inner.lock();
            inner.drain().map(|(_, entry)| entry).collect()
        };
        for entry in entries {
            entry.tx.send_replace(Arc::new(Completion::Done(None)));
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

/// Client side of the compute pipeline: dispatch, correlation, cache
/// update on receipt
pub struct ComputeClient {
    dispatcher: Arc<dyn EngineDispatcher>,
    inflight: Arc<InflightTable>,
    response_queue: String,
    rcache_client: Option<Arc<RcacheClient>>,
}

impl ComputeClient {
    pub fn new(
        dispatcher: Arc<dyn EngineDispatcher>,
        response_queue: String,
        rcache_client: Option<Arc<RcacheClient>>,
    ) -> ComputeClient {
        ComputeClient {
            dispatcher,
            inflight: Arc::new(InflightTable::default()),
            response_queue,
            rcache_client,
        }
    }

    pub fn inflight(&self) -> Arc<InflightTable> {
        Arc::clone(&self.inflight)
    }

    /// Runs one computation, coalescing concurrent callers with the same
    /// fingerprint onto a single dispatch. Returns the response text,
    /// `None` on engine failure, `Timeout` when the deadline passes first.
    pub async fn process_request(
        &self,
        request_str: String,
        config_str: String,
        req_cfg_digest: &str,
        runtime_opts: u32,
        task_id: &str,
        history_dir: Option<String>,
        deadline: Instant,
    ) -> AfcResult<Option<String>> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(AfcError::Timeout);
        }
        let (mut rx, owner, flight_id) = self.inflight.join(req_cfg_digest);
        if owner {
            let deadline_epoch = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|now| now.as_secs_f64() + remaining.as_secs_f64())
                .unwrap_or_default();
            let job = EngineJob {
                request_str,
                config_str,
                req_cfg_digest: req_cfg_digest.to_string(),
                runtime_opts,
                task_id: task_id.to_string(),
                history_dir,
                deadline_epoch,
                response_queue: self.response_queue.clone(),
            };
            let dispatcher = Arc::clone(&self.dispatcher);
            tokio::spawn(async move {
                dispatcher.dispatch(job).await;
            });
        }
        let waited = tokio::time::timeout(remaining, async {
            loop {
                if let Completion::Done(response) = rx.borrow_and_update().as_ref() {
                    return Some(response.clone());
                }
                if rx.changed().await.is_err() {
                    return None;
                }
            }
        })
        .await;
        self.inflight.leave(req_cfg_digest, flight_id);
        match waited {
            Ok(Some(response)) => Ok(response),
            // Channel closed without completion: shutting down
            Ok(None) => Ok(None),
            Err(_) => Err(AfcError::Timeout),
        }
    }

    /// Feeds one bus correlation record: completes the waiter set and,
    /// when the record carries both request and response, forwards the
    /// pair to the cache service
    pub fn handle_delivery(&self, rrk: ReqRespKey) {
        if let (Some(client), Some(_), Some(_)) =
            (self.rcache_client.as_ref(), &rrk.afc_req, &rrk.afc_resp)
        {
            let client = Arc::clone(client);
            let update = RcacheUpdateReq {
                req_resp_keys: vec![ReqRespKey {
                    req_cfg_digest: rrk.req_cfg_digest.clone(),
                    afc_req: rrk.afc_req.clone(),
                    afc_resp: rrk.afc_resp.clone(),
                }],
            };
            tokio::spawn(async move {
                if let Err(err) = client.update(&update).await {
                    error!("Failed to forward computed response to cache service: {err}");
                }
            });
        } else if rrk.afc_req.is_none() && rrk.afc_resp.is_some() {
            warn!(
                "Response for digest {} arrived without request text; cache not updated",
                rrk.req_cfg_digest
            );
        }
        self.inflight.complete(&rrk.req_cfg_digest, rrk.afc_resp);
    }
}

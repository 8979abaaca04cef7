// afc-server: Inquiry message processor
//
// Drives each message through version gate, envelope validation, vendor
// extension filtering and concurrent per-request processing, and each
// sub-request through the validate -> certification lookup -> config
// selection -> fingerprint -> cache lookup -> dispatch pipeline. All
// failures become response codes; this module never surfaces errors to
// the HTTP layer.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use afc_rcache::store::CacheStore;
use afc_rcache::RequestConfigHash;
use chrono::Utc;
use futures::future::join_all;
use serde_json::{json, Value};
use tracing::{debug, error};
use uuid::Uuid;

use crate::certs::{CertAuthority, CertRequest, CERT_LOCATION_INDOOR};
use crate::compute::{
    ComputeClient, RNTM_OPT_CERT_ID, RNTM_OPT_DBG, RNTM_OPT_GUI, RNTM_OPT_SLOW_DBG,
};
use crate::config_dispenser::ConfigDispenser;
use crate::error::{AfcError, AfcResult};
use crate::ext_filter::VendorExtensionFilter;
use crate::metrics::Metrics;
use crate::models::{
    failed_response, latest_version, response_message, ResponseCode, ResponseInfo,
    SUPPORTED_VERSIONS,
};
use crate::validation::{validate_message, validate_request};

/// Per-message processing flags derived from the ingress request
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestFlags {
    pub debug: bool,
    pub edebug: bool,
    pub nocache: bool,
    pub gui: bool,
    pub internal: bool,
}

impl RequestFlags {
    /// True when the response cache must not answer this request
    fn bypass_cache(&self) -> bool {
        self.nocache || self.debug || self.edebug || self.gui
    }
}

/// Tunables of the message processor
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    pub request_timeout: Duration,
    pub edebug_request_timeout: Duration,
    /// Response vendor extensions carried over from the previously cached
    /// response into dispatched requests
    pub state_vendor_extensions: Vec<String>,
}

/// Processor of spectrum inquiry messages
pub struct MessageProcessor {
    cache: Arc<dyn CacheStore>,
    certs: Arc<dyn CertAuthority>,
    dispenser: ConfigDispenser,
    compute: Arc<ComputeClient>,
    ext_filter: VendorExtensionFilter,
    metrics: Arc<Metrics>,
    config: ProcessorConfig,
    next_log_req_id: std::sync::atomic::AtomicU64,
}

/// Bounds a pipeline step by the remaining message deadline
async fn with_deadline<T, F>(deadline: Instant, fut: F) -> AfcResult<T>
where
    F: Future<Output = AfcResult<T>>,
{
    let remaining = deadline.saturating_duration_since(Instant::now());
    if remaining.is_zero() {
        return Err(AfcError::Timeout);
    }
    tokio::time::timeout(remaining, fut)
        .await
        .map_err(|_| AfcError::Timeout)?
}

/// The message's own version when supported, the latest version otherwise
fn response_version(msg: &Value) -> &str {
    match msg.get("version").and_then(Value::as_str) {
        Some(version) if SUPPORTED_VERSIONS.contains(&version) => version,
        _ => latest_version(),
    }
}

fn request_id_of(req: &Value) -> &str {
    req.get("requestId").and_then(Value::as_str).unwrap_or("Unknown")
}

impl MessageProcessor {
    pub fn new(
        cache: Arc<dyn CacheStore>,
        certs: Arc<dyn CertAuthority>,
        dispenser: ConfigDispenser,
        compute: Arc<ComputeClient>,
        metrics: Arc<Metrics>,
        config: ProcessorConfig,
    ) -> MessageProcessor {
        MessageProcessor {
            cache,
            certs,
            dispenser,
            compute,
            ext_filter: VendorExtensionFilter::new(),
            metrics,
            config,
            next_log_req_id: std::sync::atomic::AtomicU64::new(1),
        }
    }

    /// Processes one inquiry message into its response message
    pub async fn process_msg(&self, mut msg: Value, flags: RequestFlags) -> Value {
        self.metrics.requests.inc();
        let log_req_id = self
            .next_log_req_id
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        debug!("Inquiry message {log_req_id} arrived ({flags:?})");
        let deadline = Instant::now()
            + if flags.edebug {
                self.config.edebug_request_timeout
            } else {
                self.config.request_timeout
            };
        // Version gate; an absent or non-string version falls through to
        // envelope validation instead
        if let Some(version) = msg.get("version").and_then(Value::as_str) {
            if !SUPPORTED_VERSIONS.contains(&version) {
                let info = ResponseInfo::new(ResponseCode::VersionNotSupported, "", None);
                return self.blanket_response(&msg, &info);
            }
        }
        if let Err(failure) = validate_message(&msg) {
            return self.blanket_response(&msg, &failure.to_response_info());
        }
        self.ext_filter
            .drop_unwanted(&mut msg, true, flags.gui, flags.internal);
        let requests = msg
            .get("availableSpectrumInquiryRequests")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let responses = join_all(
            requests
                .iter()
                .map(|req| self.process_req(req, flags, deadline)),
        )
        .await;
        let mut out = response_message(response_version(&msg), responses);
        self.ext_filter
            .drop_unwanted(&mut out, false, flags.gui, flags.internal);
        out
    }

    /// Response message failing every sub-request with the same code
    fn blanket_response(&self, msg: &Value, info: &ResponseInfo) -> Value {
        let responses = msg
            .get("availableSpectrumInquiryRequests")
            .and_then(Value::as_array)
            .map(|requests| {
                requests
                    .iter()
                    .map(|req| failed_response(request_id_of(req), "Unknown", info))
                    .collect()
            })
            .unwrap_or_default();
        response_message(response_version(msg), responses)
    }

    /// Processes one sub-request; every failure path folds into a failed
    /// sub-response
    async fn process_req(&self, req: &Value, flags: RequestFlags, deadline: Instant) -> Value {
        let task_id = Uuid::new_v4().to_string();
        let request_id = request_id_of(req).to_string();
        let mut err_ruleset = req
            .pointer("/deviceDescriptor/certificationId/0/rulesetId")
            .and_then(Value::as_str)
            .unwrap_or("Unknown")
            .to_string();
        match self
            .process_req_inner(req, flags, deadline, &task_id, &request_id, &mut err_ruleset)
            .await
        {
            Ok(response) => response,
            Err(err) => failed_response(
                &request_id,
                &err_ruleset,
                &self.error_response_info(&err, &task_id),
            ),
        }
    }

    async fn process_req_inner(
        &self,
        req: &Value,
        flags: RequestFlags,
        deadline: Instant,
        task_id: &str,
        request_id: &str,
        err_ruleset: &mut String,
    ) -> AfcResult<Value> {
        validate_request(req).map_err(AfcError::Validation)?;

        // Which certifications may this device operate under?
        let cert_req = cert_request_of(req);
        let cert_info = with_deadline(deadline, self.certs.get_cert_info(&cert_req)).await?;
        if cert_info.allowed.is_empty() {
            return Ok(failed_response(
                request_id,
                err_ruleset,
                &ResponseInfo::new(
                    ResponseCode::DeviceDisallowed,
                    &cert_info.deny_reason(),
                    None,
                ),
            ));
        }
        *err_ruleset = cert_info.allowed[0].ruleset.clone();

        // First allowed certification with an available config wins
        let mut chosen = None;
        for cert in &cert_info.allowed {
            if let Some(config) = self.dispenser.get_config(&cert.ruleset, deadline).await? {
                *err_ruleset = cert.ruleset.clone();
                chosen = Some((cert, config));
                break;
            }
        }
        let Some((cert, config)) = chosen else {
            return Ok(failed_response(
                request_id,
                err_ruleset,
                &ResponseInfo::new(
                    ResponseCode::DeviceDisallowed,
                    "No AFC Config found for presented Ruleset IDs",
                    None,
                ),
            ));
        };

        let fingerprint = RequestConfigHash::new(req, &config);

        // Cache lookup
        let mut response = None;
        if !flags.bypass_cache() {
            let digests = vec![fingerprint.req_cfg_digest.clone()];
            let found =
                with_deadline(deadline, async { Ok(self.cache.lookup(&digests).await?) }).await?;
            if let Some(resp_str) = found.get(&fingerprint.req_cfg_digest) {
                response = first_sub_response(resp_str);
                if response.is_some() {
                    self.metrics.cache_hits.inc();
                }
            }
        }

        // No cached result: run the engine
        if response.is_none() {
            let mut runtime_opts = 0u32;
            if cert.location_flags & CERT_LOCATION_INDOOR != 0 {
                runtime_opts |= RNTM_OPT_CERT_ID;
            }
            if flags.debug {
                runtime_opts |= RNTM_OPT_DBG;
            }
            if flags.edebug {
                runtime_opts |= RNTM_OPT_SLOW_DBG;
            }
            if flags.gui {
                runtime_opts |= RNTM_OPT_GUI;
            }
            let mut dispatch_req = req.clone();
            self.attach_state_extensions(&mut dispatch_req, &fingerprint.req_cfg_digest)
                .await;
            let request_str = json!({
                "version": latest_version(),
                "availableSpectrumInquiryRequests": [dispatch_req],
            })
            .to_string();
            let history_dir = format!(
                "/history/{}/{}",
                cert_req.serial_number,
                Utc::now().format("%Y-%m-%dT%H:%M:%S%.6f")
            );
            self.metrics.engine_dispatches.inc();
            let resp_str = self
                .compute
                .process_request(
                    request_str,
                    fingerprint.config_str.clone(),
                    &fingerprint.req_cfg_digest,
                    runtime_opts,
                    task_id,
                    Some(history_dir),
                    deadline,
                )
                .await?;
            let Some(resp_str) = resp_str else {
                return Ok(failed_response(
                    request_id,
                    err_ruleset,
                    &ResponseInfo::new(
                        ResponseCode::GeneralFailure,
                        &format!("AFC General failure. Task ID {task_id}"),
                        None,
                    ),
                ));
            };
            response = first_sub_response(&resp_str);
            if response.is_none() {
                return Err(AfcError::Internal(
                    "engine response message has no responses".to_string(),
                ));
            }
        }

        let Some(mut response) = response else {
            return Err(AfcError::Internal("response vanished".to_string()));
        };
        response["requestId"] = Value::String(request_id.to_string());
        Ok(response)
    }

    /// Copies configured response vendor extensions of the previously
    /// cached response (any state) into the request about to be
    /// dispatched, so the engine can reuse prior computation state.
    /// Best-effort: any failure just dispatches the request unchanged.
    async fn attach_state_extensions(&self, dispatch_req: &mut Value, digest: &str) {
        if self.config.state_vendor_extensions.is_empty() {
            return;
        }
        let prev = match self.cache.get_response(digest).await {
            Ok(Some(prev)) => prev,
            _ => return,
        };
        let Some(prev_response) = first_sub_response(&prev) else {
            return;
        };
        let Some(extensions) = prev_response
            .get("vendorExtensions")
            .and_then(Value::as_array)
        else {
            return;
        };
        let carried: Vec<Value> = extensions
            .iter()
            .filter(|ext| {
                ext.get("extensionId")
                    .and_then(Value::as_str)
                    .map_or(false, |id| {
                        self.config
                            .state_vendor_extensions
                            .iter()
                            .any(|allowed| allowed == id)
                    })
            })
            .cloned()
            .collect();
        if carried.is_empty() {
            return;
        }
        match dispatch_req.get_mut("vendorExtensions") {
            Some(Value::Array(existing)) => existing.extend(carried),
            _ => dispatch_req["vendorExtensions"] = Value::Array(carried),
        }
    }

    fn error_response_info(&self, err: &AfcError, task_id: &str) -> ResponseInfo {
        match err {
            AfcError::Validation(failure) => failure.to_response_info(),
            AfcError::Timeout => {
                self.metrics.timeouts.inc();
                ResponseInfo::new(
                    ResponseCode::GeneralFailure,
                    "Request processing timed out",
                    None,
                )
            }
            other => {
                error!("Request {task_id} failed: {other}");
                ResponseInfo::new(
                    ResponseCode::GeneralFailure,
                    &format!("AFC General failure. Task ID {task_id}"),
                    None,
                )
            }
        }
    }
}

/// Builds the authorization query from a validated sub-request
fn cert_request_of(req: &Value) -> CertRequest {
    let descriptor = &req["deviceDescriptor"];
    CertRequest {
        serial_number: descriptor
            .get("serialNumber")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        certifications: descriptor
            .get("certificationId")
            .and_then(Value::as_array)
            .map(|certs| {
                certs
                    .iter()
                    .filter_map(|cert| {
                        Some((
                            cert.get("rulesetId")?.as_str()?.to_string(),
                            cert.get("id")?.as_str()?.to_string(),
                        ))
                    })
                    .collect()
            })
            .unwrap_or_default(),
    }
}

/// First sub-response of a response message text, `None` when the text
/// does not parse as a response message
fn first_sub_response(resp_str: &str) -> Option<Value> {
    serde_json::from_str::<Value>(resp_str)
        .ok()?
        .get("availableSpectrumInquiryResponses")?
        .get(0)
        .cloned()
}

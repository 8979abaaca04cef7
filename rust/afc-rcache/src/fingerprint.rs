// afc-rcache: Request/config fingerprint

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Stable digest over a canonicalized (sub-request, config) pair.
///
/// The `requestId` field does not participate: two sub-requests differing
/// only in their caller-assigned ids fingerprint identically. Canonical
/// form is serde_json's compact output, which serializes object keys in
/// sorted order and normalizes numeric representations on parse.
#[derive(Debug, Clone)]
pub struct RequestConfigHash {
    /// Hex digest identifying the cache row
    pub req_cfg_digest: String,
    /// Canonical config text, as dispatched to the engine
    pub config_str: String,
}

impl RequestConfigHash {
    pub fn new(req: &Value, config: &Value) -> RequestConfigHash {
        let mut canonical_req = req.clone();
        if let Some(obj) = canonical_req.as_object_mut() {
            obj.remove("requestId");
        }
        let request_str = canonical_req.to_string();
        let config_str = config.to_string();
        let mut hasher = Sha256::new();
        hasher.update(request_str.as_bytes());
        hasher.update([0u8]);
        hasher.update(config_str.as_bytes());
        RequestConfigHash {
            req_cfg_digest: hex::encode(hasher.finalize()),
            config_str,
        }
    }
}

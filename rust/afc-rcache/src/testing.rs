// afc-rcache: In-memory cache store double for tests

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

use crate::error::RcacheResult;
use crate::models::{ApPk, ApRecord, FuncSwitch, LatLonRect, RespState};
use crate::store::CacheStore;

/// In-memory [`CacheStore`] with the same observable behavior as the
/// Postgres implementation. Rows live in a map keyed by primary key;
/// switches default to enabled.
#[derive(Default)]
pub struct MemCacheStore {
    rows: Mutex<HashMap<ApPk, ApRecord>>,
    switches: Mutex<HashMap<&'static str, bool>>,
}

impl MemCacheStore {
    pub fn new() -> MemCacheStore {
        MemCacheStore::default()
    }

    /// Direct row insertion for test setup
    pub fn insert(&self, record: ApRecord) {
        self.rows.lock().insert(record.pk(), record);
    }

    /// Snapshot of all rows for test assertions
    pub fn records(&self) -> Vec<ApRecord> {
        self.rows.lock().values().cloned().collect()
    }

    /// State of the row with the given digest, if present
    pub fn state_of(&self, digest: &str) -> Option<RespState> {
        self.rows
            .lock()
            .values()
            .find(|rec| rec.req_cfg_digest == digest)
            .map(|rec| rec.state)
    }

    fn is_expired(record: &ApRecord) -> bool {
        match record.validity_period_sec {
            Some(period) => {
                (Utc::now() - record.last_update).num_milliseconds() as f64 / 1000.0 > period
            }
            None => false,
        }
    }
}

#[async_trait]
impl CacheStore for MemCacheStore {
    async fn lookup(&self, digests: &[String]) -> RcacheResult<HashMap<String, String>> {
        let rows = self.rows.lock();
        Ok(rows
            .values()
            .filter(|rec| {
                rec.state == RespState::Valid
                    && !Self::is_expired(rec)
                    && digests.contains(&rec.req_cfg_digest)
            })
            .map(|rec| (rec.req_cfg_digest.clone(), rec.response.clone()))
            .collect())
    }

    async fn get_response(&self, digest: &str) -> RcacheResult<Option<String>> {
        Ok(self
            .rows
            .lock()
            .values()
            .find(|rec| rec.req_cfg_digest == digest)
            .map(|rec| rec.response.clone()))
    }

    async fn update_cache(&self, records: Vec<ApRecord>) -> RcacheResult<()> {
        let mut rows = self.rows.lock();
        for record in records {
            rows.insert(record.pk(), record);
        }
        Ok(())
    }

    async fn invalidate(&self, ruleset: Option<&str>, limit: i64) -> RcacheResult<u64> {
        let mut rows = self.rows.lock();
        let mut affected = 0u64;
        for rec in rows.values_mut() {
            if affected as i64 >= limit {
                break;
            }
            if rec.state != RespState::Invalid
                && ruleset.map_or(true, |r| rec.config_ruleset == r)
            {
                rec.state = RespState::Invalid;
                affected += 1;
            }
        }
        Ok(affected)
    }

    async fn spatial_invalidate(&self, rect: &LatLonRect) -> RcacheResult<u64> {
        let mut rows = self.rows.lock();
        let mut affected = 0u64;
        for rec in rows.values_mut() {
            if rec.state == RespState::Valid && rect.contains(rec.lat, rec.lon) {
                rec.state = RespState::Invalid;
                affected += 1;
            }
        }
        Ok(affected)
    }

    async fn num_invalid(&self) -> RcacheResult<i64> {
        Ok(self
            .rows
            .lock()
            .values()
            .filter(|rec| rec.state == RespState::Invalid)
            .count() as i64)
    }

    async fn num_precomputing(&self) -> RcacheResult<i64> {
        Ok(self
            .rows
            .lock()
            .values()
            .filter(|rec| rec.state == RespState::Precomputing)
            .count() as i64)
    }

    async fn cache_size(&self) -> RcacheResult<i64> {
        Ok(self.rows.lock().len() as i64)
    }

    async fn get_invalid_reqs(&self, limit: i64) -> RcacheResult<Vec<String>> {
        let mut rows = self.rows.lock();
        let mut ret = Vec::new();
        for rec in rows.values_mut() {
            if ret.len() as i64 >= limit {
                break;
            }
            if rec.state == RespState::Invalid {
                rec.state = RespState::Precomputing;
                ret.push(rec.request.clone());
            }
        }
        Ok(ret)
    }

    async fn reset_precomputations(&self) -> RcacheResult<u64> {
        let mut rows = self.rows.lock();
        let mut affected = 0u64;
        for rec in rows.values_mut() {
            if rec.state == RespState::Precomputing {
                rec.state = RespState::Invalid;
                affected += 1;
            }
        }
        Ok(affected)
    }

    async fn delete(&self, pk: &ApPk) -> RcacheResult<()> {
        self.rows.lock().remove(pk);
        Ok(())
    }

    async fn get_switch(&self, switch: FuncSwitch) -> RcacheResult<bool> {
        Ok(*self.switches.lock().get(switch.name()).unwrap_or(&true))
    }

    async fn set_switch(&self, switch: FuncSwitch, state: bool) -> RcacheResult<()> {
        self.switches.lock().insert(switch.name(), state);
        Ok(())
    }

    async fn check_server(&self) -> bool {
        true
    }
}

/// Builds a Valid cache row at the given point for test setup
pub fn sample_record(digest: &str, config_ruleset: &str, lat: f64, lon: f64) -> ApRecord {
    let request = serde_json::json!({
        "version": "1.4",
        "availableSpectrumInquiryRequests": [{
            "requestId": "0",
            "deviceDescriptor": {
                "serialNumber": format!("SN-{digest}"),
                "certificationId": [{"rulesetId": config_ruleset, "id": "CID"}]
            },
            "location": {
                "ellipse": {"center": {"latitude": lat, "longitude": lon}}
            },
            "inquiredFrequencyRange": [{"lowFrequency": 5925, "highFrequency": 6425}]
        }]
    });
    let response = serde_json::json!({
        "version": "1.4",
        "availableSpectrumInquiryResponses": [{
            "requestId": "0",
            "rulesetId": config_ruleset,
            "response": {"responseCode": 0}
        }]
    });
    ApRecord {
        serial_number: format!("SN-{digest}"),
        rulesets: config_ruleset.to_string(),
        cert_ids: "CID".to_string(),
        state: RespState::Valid,
        config_ruleset: config_ruleset.to_string(),
        lat,
        lon,
        last_update: Utc::now(),
        req_cfg_digest: digest.to_string(),
        validity_period_sec: None,
        request: request.to_string(),
        response: response.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lookup_skips_invalid_and_expired() {
        let store = MemCacheStore::new();
        store.insert(sample_record("d1", "US", 37.0, -122.0));
        let mut invalid = sample_record("d2", "US", 37.0, -122.0);
        invalid.state = RespState::Invalid;
        store.insert(invalid);
        let mut expired = sample_record("d3", "US", 37.0, -122.0);
        expired.validity_period_sec = Some(-1.0);
        store.insert(expired);

        let found = store
            .lookup(&["d1".to_string(), "d2".to_string(), "d3".to_string()])
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert!(found.contains_key("d1"));
    }

    #[tokio::test]
    async fn test_get_invalid_reqs_claims_rows() {
        let store = MemCacheStore::new();
        for digest in ["d1", "d2", "d3"] {
            let mut rec = sample_record(digest, "US", 37.0, -122.0);
            rec.state = RespState::Invalid;
            store.insert(rec);
        }
        let claimed = store.get_invalid_reqs(2).await.unwrap();
        assert_eq!(claimed.len(), 2);
        assert_eq!(store.num_precomputing().await.unwrap(), 2);
        assert_eq!(store.num_invalid().await.unwrap(), 1);
    }
}

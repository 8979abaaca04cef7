// afc-rcache: Cache data models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{RcacheError, RcacheResult};

/// Number of degrees per kilometer of great-circle distance
pub const DEGREES_PER_KM: f64 = 1.0 / (60.0 * 1.852);

/// Separator used when joining certification fields into primary key columns
const PK_FIELD_SEPARATOR: &str = "|";

/// Row state in the `aps` cache table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RespState {
    Valid,
    Invalid,
    Precomputing,
}

impl RespState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RespState::Valid => "Valid",
            RespState::Invalid => "Invalid",
            RespState::Precomputing => "Precomputing",
        }
    }
}

/// Enable/disable switches persisted in the `switches` table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FuncSwitch {
    Invalidate,
    Precompute,
    Update,
}

impl FuncSwitch {
    pub fn name(&self) -> &'static str {
        match self {
            FuncSwitch::Invalidate => "invalidate",
            FuncSwitch::Precompute => "precompute",
            FuncSwitch::Update => "update",
        }
    }
}

/// Axis-aligned latitude/longitude rectangle (a spatial invalidation tile)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatLonRect {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lon: f64,
    pub max_lon: f64,
}

impl LatLonRect {
    /// Short form for log messages
    pub fn short_str(&self) -> String {
        format!(
            "[{:.3}..{:.3}]x[{:.3}..{:.3}]",
            self.min_lat, self.max_lat, self.min_lon, self.max_lon
        )
    }

    /// Expands the rectangle by the given clearance in kilometers.
    ///
    /// Longitude expansion is corrected by the cosine of the mid latitude,
    /// floored at 1/180 to stay finite near the poles.
    pub fn dilated(&self, clearance_km: f64) -> LatLonRect {
        let clearance_deg = clearance_km * DEGREES_PER_KM;
        let lon_reduction = ((self.min_lat + self.max_lat) / 2.0)
            .to_radians()
            .cos()
            .max(1.0 / 180.0);
        LatLonRect {
            min_lat: self.min_lat - clearance_deg,
            max_lat: self.max_lat + clearance_deg,
            min_lon: self.min_lon - clearance_deg / lon_reduction,
            max_lon: self.max_lon + clearance_deg / lon_reduction,
        }
    }

    /// Clamps latitudes to [-90, 90] and brings longitudes back to
    /// [-180, 180], splitting a rectangle that crosses the antimeridian
    /// into two.
    pub fn normalized(&self) -> Vec<LatLonRect> {
        let min_lat = self.min_lat.max(-90.0);
        let max_lat = self.max_lat.min(90.0);
        if (self.max_lon - self.min_lon) >= 360.0 {
            return vec![LatLonRect {
                min_lat,
                max_lat,
                min_lon: -180.0,
                max_lon: 180.0,
            }];
        }
        let mut ret = Vec::new();
        if self.min_lon < -180.0 {
            ret.push(LatLonRect {
                min_lat,
                max_lat,
                min_lon: self.min_lon + 360.0,
                max_lon: 180.0,
            });
            ret.push(LatLonRect {
                min_lat,
                max_lat,
                min_lon: -180.0,
                max_lon: self.max_lon,
            });
        } else if self.max_lon > 180.0 {
            ret.push(LatLonRect {
                min_lat,
                max_lat,
                min_lon: self.min_lon,
                max_lon: 180.0,
            });
            ret.push(LatLonRect {
                min_lat,
                max_lat,
                min_lon: -180.0,
                max_lon: self.max_lon - 360.0,
            });
        } else {
            ret.push(LatLonRect {
                min_lat,
                max_lat,
                min_lon: self.min_lon,
                max_lon: self.max_lon,
            });
        }
        ret
    }

    /// True if the WGS-84 point lies within the rectangle
    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        lat >= self.min_lat && lat <= self.max_lat && lon >= self.min_lon && lon <= self.max_lon
    }
}

/// Primary key of a cache row
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ApPk {
    pub serial_number: String,
    pub rulesets: String,
    pub cert_ids: String,
}

impl ApPk {
    /// Derives the primary key from a spectrum inquiry sub-request
    pub fn from_request(req: &Value) -> Option<ApPk> {
        let descriptor = req.get("deviceDescriptor")?;
        let serial_number = descriptor.get("serialNumber")?.as_str()?.to_string();
        let certifications = descriptor.get("certificationId")?.as_array()?;
        if certifications.is_empty() {
            return None;
        }
        let mut rulesets = Vec::with_capacity(certifications.len());
        let mut cert_ids = Vec::with_capacity(certifications.len());
        for cert in certifications {
            rulesets.push(cert.get("rulesetId")?.as_str()?.to_string());
            cert_ids.push(cert.get("id")?.as_str()?.to_string());
        }
        Some(ApPk {
            serial_number,
            rulesets: rulesets.join(PK_FIELD_SEPARATOR),
            cert_ids: cert_ids.join(PK_FIELD_SEPARATOR),
        })
    }

    /// Derives the primary key from a stored request message string
    /// (`{"version": ..., "availableSpectrumInquiryRequests": [...]}`)
    pub fn from_request_str(req_str: &str) -> RcacheResult<ApPk> {
        let msg: Value = serde_json::from_str(req_str)?;
        msg.get("availableSpectrumInquiryRequests")
            .and_then(|reqs| reqs.get(0))
            .and_then(ApPk::from_request)
            .ok_or_else(|| RcacheError::BadRecord("no device descriptor in request".to_string()))
    }
}

/// Row of the `aps` cache table
#[derive(Debug, Clone, PartialEq)]
pub struct ApRecord {
    pub serial_number: String,
    pub rulesets: String,
    pub cert_ids: String,
    pub state: RespState,
    pub config_ruleset: String,
    pub lat: f64,
    pub lon: f64,
    pub last_update: DateTime<Utc>,
    pub req_cfg_digest: String,
    pub validity_period_sec: Option<f64>,
    pub request: String,
    pub response: String,
}

impl ApRecord {
    /// Builds a Valid cache row from a correlation record.
    ///
    /// Returns `None` for a failed computation (no response attached), an
    /// error for a record whose request cannot be parsed.
    pub fn from_req_resp_key(rrk: &ReqRespKey) -> RcacheResult<Option<ApRecord>> {
        let (req_str, resp_str) = match (&rrk.afc_req, &rrk.afc_resp) {
            (Some(req), Some(resp)) => (req, resp),
            _ => return Ok(None),
        };
        let req_msg: Value = serde_json::from_str(req_str)?;
        let req = req_msg
            .get("availableSpectrumInquiryRequests")
            .and_then(|reqs| reqs.get(0))
            .ok_or_else(|| RcacheError::BadRecord("request message has no requests".to_string()))?;
        let pk = ApPk::from_request(req)
            .ok_or_else(|| RcacheError::BadRecord("no device descriptor in request".to_string()))?;
        let (lat, lon) = request_coordinates(req)
            .ok_or_else(|| RcacheError::BadRecord("no location in request".to_string()))?;
        let resp_msg: Value = serde_json::from_str(resp_str)?;
        let resp = resp_msg
            .get("availableSpectrumInquiryResponses")
            .and_then(|resps| resps.get(0))
            .ok_or_else(|| {
                RcacheError::BadRecord("response message has no responses".to_string())
            })?;
        let config_ruleset = resp
            .get("rulesetId")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let validity_period_sec = resp
            .get("availabilityExpireTime")
            .and_then(Value::as_str)
            .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
            .map(|expire| (expire.with_timezone(&Utc) - Utc::now()).num_seconds() as f64);
        Ok(Some(ApRecord {
            serial_number: pk.serial_number,
            rulesets: pk.rulesets,
            cert_ids: pk.cert_ids,
            state: RespState::Valid,
            config_ruleset,
            lat,
            lon,
            last_update: Utc::now(),
            req_cfg_digest: rrk.req_cfg_digest.clone(),
            validity_period_sec,
            request: req_str.clone(),
            response: resp_str.clone(),
        }))
    }

    pub fn pk(&self) -> ApPk {
        ApPk {
            serial_number: self.serial_number.clone(),
            rulesets: self.rulesets.clone(),
            cert_ids: self.cert_ids.clone(),
        }
    }
}

/// Extracts the WGS-84 point of a sub-request: ellipse center, radial
/// polygon center, or first linear polygon vertex.
fn request_coordinates(req: &Value) -> Option<(f64, f64)> {
    let location = req.get("location")?;
    let point = location
        .pointer("/ellipse/center")
        .or_else(|| location.pointer("/radialPolygon/center"))
        .or_else(|| location.pointer("/linearPolygon/outerBoundary/0"))?;
    Some((
        point.get("latitude")?.as_f64()?,
        point.get("longitude")?.as_f64()?,
    ))
}

/// Correlation record returned by workers over the message bus.
///
/// `afc_req` is absent when the sender already updated the cache itself,
/// `afc_resp` is absent when the computation failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReqRespKey {
    pub req_cfg_digest: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub afc_req: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub afc_resp: Option<String>,
}

/// Cache update request accepted by the control plane
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RcacheUpdateReq {
    pub req_resp_keys: Vec<ReqRespKey>,
}

/// Complete or per-ruleset invalidation request.
/// `ruleset_ids = None` invalidates everything.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RcacheInvalidateReq {
    #[serde(default)]
    pub ruleset_ids: Option<Vec<String>>,
}

/// Spatial invalidation request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RcacheSpatialInvalidateReq {
    pub tiles: Vec<LatLonRect>,
}

/// Cache service status document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RcacheStatus {
    pub up_time_sec: f64,
    pub db_connected: bool,
    pub all_tasks_running: bool,
    pub invalidation_enabled: bool,
    pub precomputation_enabled: bool,
    pub update_enabled: bool,
    pub precomputation_quota: usize,
    pub num_valid_entries: i64,
    pub num_invalid_entries: i64,
    pub update_queue_len: usize,
    pub update_count: u64,
    pub avg_update_write_rate: f64,
    pub avg_update_queue_len: f64,
    pub num_precomputed: u64,
    pub active_precomputations: usize,
    pub avg_precomputation_rate: f64,
    pub avg_schedule_lag: f64,
}

/// List of active ruleset IDs served by the config service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RulesetIds {
    #[serde(rename = "rulesetId")]
    pub ruleset_ids: Vec<String>,
}

/// The slice of an AFC Config the invalidator cares about
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigLinkDistance {
    #[serde(rename = "maxLinkDistance")]
    pub max_link_distance: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_request() -> Value {
        json!({
            "requestId": "0",
            "deviceDescriptor": {
                "serialNumber": "SN-1",
                "certificationId": [
                    {"rulesetId": "US_47_CFR_PART_15_SUBPART_E", "id": "CID-1"},
                    {"rulesetId": "CA_RES_DBS-06", "id": "CID-2"}
                ]
            },
            "location": {
                "ellipse": {"center": {"latitude": 37.0, "longitude": -122.0}}
            }
        })
    }

    #[test]
    fn test_pk_from_request() {
        let pk = ApPk::from_request(&sample_request()).unwrap();
        assert_eq!(pk.serial_number, "SN-1");
        assert_eq!(pk.rulesets, "US_47_CFR_PART_15_SUBPART_E|CA_RES_DBS-06");
        assert_eq!(pk.cert_ids, "CID-1|CID-2");
    }

    #[test]
    fn test_record_from_req_resp_key() {
        let req_msg = json!({
            "version": "1.4",
            "availableSpectrumInquiryRequests": [sample_request()]
        });
        let resp_msg = json!({
            "version": "1.4",
            "availableSpectrumInquiryResponses": [{
                "requestId": "0",
                "rulesetId": "US_47_CFR_PART_15_SUBPART_E",
                "response": {"responseCode": 0}
            }]
        });
        let rrk = ReqRespKey {
            req_cfg_digest: "d1".to_string(),
            afc_req: Some(req_msg.to_string()),
            afc_resp: Some(resp_msg.to_string()),
        };
        let record = ApRecord::from_req_resp_key(&rrk).unwrap().unwrap();
        assert_eq!(record.state, RespState::Valid);
        assert_eq!(record.config_ruleset, "US_47_CFR_PART_15_SUBPART_E");
        assert_eq!(record.lat, 37.0);
        assert_eq!(record.lon, -122.0);
        assert_eq!(record.req_cfg_digest, "d1");
        assert!(record.validity_period_sec.is_none());
    }

    #[test]
    fn test_failed_computation_yields_no_record() {
        let rrk = ReqRespKey {
            req_cfg_digest: "d1".to_string(),
            afc_req: Some("{}".to_string()),
            afc_resp: None,
        };
        assert!(ApRecord::from_req_resp_key(&rrk).unwrap().is_none());
    }

    #[test]
    fn test_dilation_expands_longitude_more_at_high_latitude() {
        let rect = LatLonRect {
            min_lat: 59.0,
            max_lat: 61.0,
            min_lon: 10.0,
            max_lon: 12.0,
        };
        let dilated = rect.dilated(200.0);
        let lat_growth = rect.min_lat - dilated.min_lat;
        let lon_growth = rect.min_lon - dilated.min_lon;
        assert!((lat_growth - 200.0 * DEGREES_PER_KM).abs() < 1e-9);
        // cos(60 deg) = 0.5, so longitude grows twice as much
        assert!((lon_growth - 2.0 * lat_growth).abs() < 1e-6);
    }

    #[test]
    fn test_normalize_splits_antimeridian_crossing() {
        let rect = LatLonRect {
            min_lat: 50.0,
            max_lat: 52.0,
            min_lon: 175.0,
            max_lon: 185.0,
        };
        let parts = rect.normalized();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].min_lon, 175.0);
        assert_eq!(parts[0].max_lon, 180.0);
        assert_eq!(parts[1].min_lon, -180.0);
        assert_eq!(parts[1].max_lon, -175.0);
    }

    #[test]
    fn test_normalize_clamps_latitude() {
        let rect = LatLonRect {
            min_lat: 88.0,
            max_lat: 93.0,
            min_lon: 0.0,
            max_lon: 10.0,
        };
        let parts = rect.normalized();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].max_lat, 90.0);
    }

    #[test]
    fn test_req_resp_key_round_trip() {
        let rrk = ReqRespKey {
            req_cfg_digest: "abc".to_string(),
            afc_req: None,
            afc_resp: Some("{}".to_string()),
        };
        let text = serde_json::to_string(&rrk).unwrap();
        assert!(!text.contains("afc_req"));
        let parsed: ReqRespKey = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed, rrk);
    }
}

// afc-server: Device authorization lookup

use async_trait::async_trait;
use sqlx::PgPool;

use crate::error::AfcResult;

/// Location flags of a certification
pub const CERT_LOCATION_UNKNOWN: i32 = 0;
pub const CERT_LOCATION_INDOOR: i32 = 1;
pub const CERT_LOCATION_OUTDOOR: i32 = 2;

/// Certifications better be explicitly disabled in a production database
const SPECIAL_CERTIFICATIONS: &[(&str, &str)] = &[
    ("TestCertificationId", "TestSerialNumber"),
    ("HeatMapCertificationId", "HeatMapSerialNumber"),
];

/// Authorization query for one device
#[derive(Debug, Clone)]
pub struct CertRequest {
    pub serial_number: String,
    /// (ruleset ID, certification ID) pairs in request order
    pub certifications: Vec<(String, String)>,
}

/// One certification the device may operate under
#[derive(Debug, Clone)]
pub struct AllowedCert {
    pub ruleset: String,
    pub cert_id: String,
    pub location_flags: i32,
}

/// Outcome of the authorization lookup
#[derive(Debug, Clone, Default)]
pub struct CertInfo {
    pub allowed: Vec<AllowedCert>,
    pub deny_reasons: Vec<String>,
}

impl CertInfo {
    /// Reason reported when no certification is allowed
    pub fn deny_reason(&self) -> String {
        if self.deny_reasons.is_empty() {
            "Device is not authorized".to_string()
        } else {
            self.deny_reasons.join("; ")
        }
    }
}

/// Source of device authorization decisions
#[async_trait]
pub trait CertAuthority: Send + Sync {
    async fn get_cert_info(&self, req: &CertRequest) -> AfcResult<CertInfo>;
}

fn special_certification(cert_id: &str, serial_number: &str) -> Option<i32> {
    SPECIAL_CERTIFICATIONS
        .iter()
        .any(|(cert, serial)| *cert == cert_id && *serial == serial_number)
        .then_some(CERT_LOCATION_INDOOR | CERT_LOCATION_OUTDOOR)
}

/// Authorization lookup against the registration database
pub struct PgCertAuthority {
    pool: PgPool,
}

impl PgCertAuthority {
    pub fn new(pool: PgPool) -> PgCertAuthority {
        PgCertAuthority { pool }
    }

    async fn lookup_certification(
        &self,
        ruleset: &str,
        cert_id: &str,
    ) -> AfcResult<Option<i32>> {
        let location: Option<i32> = sqlx::query_scalar(
            "SELECT c.location FROM cert_id c
             JOIN aaa_ruleset r ON c.ruleset_id = r.id
             WHERE c.certification_id = $1 AND r.name = $2",
        )
        .bind(cert_id)
        .bind(ruleset)
        .fetch_optional(&self.pool)
        .await?;
        Ok(location)
    }

    async fn is_denied(&self, serial_number: &str, cert_id: &str) -> AfcResult<bool> {
        let denials: i64 = sqlx::query_scalar(
            "SELECT count(*) FROM access_point_deny
             WHERE (certification_id = $1 AND (serial_number = $2 OR serial_number IS NULL))
                OR (serial_number = $2 AND certification_id IS NULL)",
        )
        .bind(cert_id)
        .bind(serial_number)
        .fetch_one(&self.pool)
        .await?;
        Ok(denials > 0)
    }
}

#[async_trait]
impl CertAuthority for PgCertAuthority {
    async fn get_cert_info(&self, req: &CertRequest) -> AfcResult<CertInfo> {
        let mut info = CertInfo::default();
        for (ruleset, cert_id) in &req.certifications {
            if let Some(location_flags) = special_certification(cert_id, &req.serial_number) {
                info.allowed.push(AllowedCert {
                    ruleset: ruleset.clone(),
                    cert_id: cert_id.clone(),
                    location_flags,
                });
                continue;
            }
            let location = match self.lookup_certification(ruleset, cert_id).await? {
                Some(location) => location,
                None => {
                    info.deny_reasons.push(format!(
                        "Certification '{cert_id}' not found for ruleset '{ruleset}'"
                    ));
                    continue;
                }
            };
            if self.is_denied(&req.serial_number, cert_id).await? {
                info.deny_reasons.push(format!(
                    "Device with serial number '{}' and certification '{cert_id}' is denied \
                     service",
                    req.serial_number
                ));
                continue;
            }
            info.allowed.push(AllowedCert {
                ruleset: ruleset.clone(),
                cert_id: cert_id.clone(),
                location_flags: location,
            });
        }
        Ok(info)
    }
}

/// Authorization stub that admits everything. For performance estimation.
pub struct BypassCertAuthority;

#[async_trait]
impl CertAuthority for BypassCertAuthority {
    async fn get_cert_info(&self, req: &CertRequest) -> AfcResult<CertInfo> {
        Ok(CertInfo {
            allowed: req
                .certifications
                .iter()
                .map(|(ruleset, cert_id)| AllowedCert {
                    ruleset: ruleset.clone(),
                    cert_id: cert_id.clone(),
                    location_flags: CERT_LOCATION_INDOOR | CERT_LOCATION_OUTDOOR,
                })
                .collect(),
            deny_reasons: Vec::new(),
        })
    }
}

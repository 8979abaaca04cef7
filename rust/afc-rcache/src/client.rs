// afc-rcache: REST client for the cache service control plane

use crate::error::{RcacheError, RcacheResult};
use crate::models::{RcacheInvalidateReq, RcacheSpatialInvalidateReq, RcacheStatus, RcacheUpdateReq};

/// Client for the cache service REST API
#[derive(Debug, Clone)]
pub struct RcacheClient {
    base_url: String,
    http: reqwest::Client,
}

impl RcacheClient {
    pub fn new(base_url: &str) -> RcacheClient {
        RcacheClient {
            base_url: base_url.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    async fn post<T: serde::Serialize>(&self, path: &str, body: &T) -> RcacheResult<()> {
        let url = format!("{}{path}", self.base_url);
        let resp = self.http.post(&url).json(body).send().await?;
        if !resp.status().is_success() {
            return Err(RcacheError::Http(format!(
                "POST {url} returned {}",
                resp.status()
            )));
        }
        Ok(())
    }

    /// Enqueues computed responses for cache write
    pub async fn update(&self, req: &RcacheUpdateReq) -> RcacheResult<()> {
        self.post("/update", req).await
    }

    /// Requests complete or per-ruleset invalidation
    pub async fn invalidate(&self, req: &RcacheInvalidateReq) -> RcacheResult<()> {
        self.post("/invalidate", req).await
    }

    /// Requests invalidation of spatial tiles
    pub async fn spatial_invalidate(&self, req: &RcacheSpatialInvalidateReq) -> RcacheResult<()> {
        self.post("/spatial_invalidate", req).await
    }

    /// Fetches the service status document
    pub async fn status(&self) -> RcacheResult<RcacheStatus> {
        let url = format!("{}/status", self.base_url);
        let resp = self.http.get(&url).send().await?;
        if !resp.status().is_success() {
            return Err(RcacheError::Http(format!(
                "GET {url} returned {}",
                resp.status()
            )));
        }
        Ok(resp.json().await?)
    }
}

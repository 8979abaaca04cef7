//! AFC response cache core.
//!
//! Shared between the request coordinator (`afc-server`) and the cache
//! service (`afc-rcache-service`): the cache row model, the request/config
//! fingerprint, the Postgres/PostGIS store, the AMQP correlation protocol
//! used by workers to return computed responses, and the REST client for
//! the cache control plane.

pub mod bus;
pub mod client;
pub mod ema;
pub mod error;
pub mod fingerprint;
pub mod models;
pub mod store;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use error::{RcacheError, RcacheResult};
pub use fingerprint::RequestConfigHash;
pub use models::{
    ApPk, ApRecord, FuncSwitch, LatLonRect, ReqRespKey, RespState, RcacheInvalidateReq,
    RcacheSpatialInvalidateReq, RcacheStatus, RcacheUpdateReq,
};
pub use store::{CacheStore, PgCacheStore};

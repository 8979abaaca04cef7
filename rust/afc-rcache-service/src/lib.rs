//! AFC response cache service.
//!
//! Hosts the cache's background activities (updates, invalidation,
//! precomputation, averaging) and their control-plane REST API.

pub mod control;
pub mod metrics;
pub mod service;
pub mod settings;

pub use service::{RcacheService, ServiceConfig, DEFAULT_MAX_LINK_DISTANCE_KM};
pub use settings::Settings;

//! AFC spectrum-availability request coordinator.
//!
//! Accepts inquiry messages, deduplicates computations against the
//! response cache, dispatches uncached work to engine workers over the
//! task queue, and correlates asynchronous worker responses back to the
//! waiting requests over the message bus.

pub mod certs;
pub mod compute;
pub mod config_dispenser;
pub mod dispatch;
pub mod error;
pub mod ext_filter;
pub mod http;
pub mod metrics;
pub mod models;
pub mod msg_proc;
pub mod objst;
pub mod regions;
pub mod settings;
pub mod validation;

pub use error::{AfcError, AfcResult};
pub use msg_proc::{MessageProcessor, ProcessorConfig, RequestFlags};
pub use settings::Settings;

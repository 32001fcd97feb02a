pub mod api;
pub mod config;
pub mod export;
pub mod metrics_server;
pub mod notify;
pub mod observability;
pub mod pipeline;
pub mod retry;
pub mod sinks;
pub mod sources;
pub mod store;
pub mod transform;

pub use pipeline::{Envelope, Pipeline};

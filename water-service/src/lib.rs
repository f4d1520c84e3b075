pub mod config;
pub mod http;
pub mod metrics_server;
pub mod observability;
pub mod pipeline;
pub mod sources;
pub mod transform;

pub use pipeline::{DailyUsage, Retriever, UsageError, UsagePipeline};

pub mod domain;
pub mod store;

pub use domain::{RawUsagePayload, UsageReading, UsageRow};
pub use store::{CacheStore, StoreError};

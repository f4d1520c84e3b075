pub mod raw_payload;
pub mod usage_reading;

pub use raw_payload::{RawUsagePayload, UsageRow};
pub use usage_reading::UsageReading;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Latest daily water usage captured from the provider portal.
///
/// Field names on the wire match what the portal-facing service has always
/// returned: `latest_usage_gallons` and `rows`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageReading {
    pub source: String,
    #[serde(rename = "latest_usage_gallons")]
    pub usage_value: f64,
    #[serde(rename = "rows", default, skip_serializing_if = "Option::is_none")]
    pub row_count: Option<u64>,
    pub timestamp: i64,
}

impl UsageReading {
    /// Build a reading stamped with the current time.
    pub fn captured_now(
        source: impl Into<String>,
        usage_value: f64,
        row_count: Option<u64>,
    ) -> Self {
        Self {
            source: source.into(),
            usage_value,
            row_count,
            timestamp: OffsetDateTime::now_utc().unix_timestamp(),
        }
    }
}

//! Canonical performance-metric schema shared across providers.

use serde::{Deserialize, Serialize};

use crate::providers::ProviderKind;

pub mod store;
pub mod writer;

pub use store::{MetricFilter, MetricStore};
pub use writer::MetricsWriter;

/// Creative-level detail attached to a campaign row (Meta enrichment).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Creative {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub creative_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spend: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub impressions: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clicks: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversions: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revenue: Option<f64>,
}

/// One per-day, per-campaign performance record in the canonical schema.
///
/// Logical identity is (workspace, provider, account/client, campaign,
/// date); the writer upserts on that key so overlapping re-syncs overwrite
/// rather than duplicate. `raw_payload` keeps the provider's row for audit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NormalizedMetric {
    pub provider: ProviderKind,
    pub client_id: Option<String>,
    pub account_id: Option<String>,
    /// YYYY-MM-DD.
    pub date: String,
    pub spend: f64,
    pub impressions: i64,
    pub clicks: i64,
    pub conversions: f64,
    pub revenue: Option<f64>,
    pub campaign_id: Option<String>,
    pub campaign_name: Option<String>,
    pub creatives: Vec<Creative>,
    pub raw_payload: serde_json::Value,
}

//! Metric normalization: provider raw rows → the canonical schema.
//!
//! Pure and deterministic: identical input always yields identical output,
//! which is what makes re-processing and upsert re-syncs idempotent.
//! Dispatch is by the row's adapter tag, never by shape inspection.
//!
//! Providers disagree on numeric types (string vs number); everything is
//! coerced through [`coerce_f64`], with unparseable and non-finite values
//! collapsing to 0.

use serde_json::Value;

use crate::metrics::{Creative, NormalizedMetric};
use crate::providers::{ProviderKind, RawMetricRow};

/// Meta action types counted as conversions. An entry matches on equality
/// or as a `offsite_conversion.`-style subtype.
const META_CONVERSION_ACTIONS: &[&str] = &["purchase", "omni_purchase", "offsite_conversion"];

/// Coerce a JSON string|number to f64; anything else (or NaN/∞) is 0.
pub fn coerce_f64(value: &Value) -> f64 {
    let n = match value {
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        Value::String(s) => s.trim().parse::<f64>().unwrap_or(0.0),
        _ => 0.0,
    };
    if n.is_finite() {
        n
    } else {
        0.0
    }
}

/// Coerce to a count.
pub fn coerce_i64(value: &Value) -> i64 {
    coerce_f64(value) as i64
}

fn opt_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Normalize one raw row into the canonical schema.
///
/// Account and client identity are stamped by the caller (the job runner
/// knows the integration); the normalizer maps row content only.
pub fn normalize_row(row: &RawMetricRow) -> NormalizedMetric {
    match row {
        RawMetricRow::Google(payload) => normalize_google(payload),
        RawMetricRow::Meta(payload) => normalize_meta(payload),
        RawMetricRow::TikTok(payload) => normalize_tiktok(payload),
        RawMetricRow::LinkedIn(payload) => normalize_linkedin(payload),
    }
}

fn base(provider: ProviderKind, raw: &Value) -> NormalizedMetric {
    NormalizedMetric {
        provider,
        client_id: None,
        account_id: None,
        date: String::new(),
        spend: 0.0,
        impressions: 0,
        clicks: 0,
        conversions: 0.0,
        revenue: None,
        campaign_id: None,
        campaign_name: None,
        creatives: Vec::new(),
        raw_payload: raw.clone(),
    }
}

fn normalize_google(payload: &Value) -> NormalizedMetric {
    let metrics = &payload["metrics"];
    let mut out = base(ProviderKind::Google, payload);
    out.date = payload["segments"]["date"]
        .as_str()
        .unwrap_or_default()
        .to_string();
    // Ads reports cost in micros.
    out.spend = coerce_f64(&metrics["costMicros"]) / 1_000_000.0;
    out.impressions = coerce_i64(&metrics["impressions"]);
    out.clicks = coerce_i64(&metrics["clicks"]);
    out.conversions = coerce_f64(&metrics["conversions"]);
    out.revenue = metrics
        .get("conversionsValue")
        .map(|v| coerce_f64(v));
    out.campaign_id = opt_string(&payload["campaign"]["id"]);
    out.campaign_name = opt_string(&payload["campaign"]["name"]);
    out
}

fn meta_action_matches(action_type: &str) -> bool {
    META_CONVERSION_ACTIONS
        .iter()
        .any(|allowed| action_type == *allowed || action_type.starts_with(&format!("{}.", allowed)))
}

/// Sum the `value` of action entries whose type is on the allow-list.
fn sum_matching_actions(actions: &Value) -> f64 {
    actions
        .as_array()
        .map(|entries| {
            entries
                .iter()
                .filter(|entry| {
                    entry["action_type"]
                        .as_str()
                        .map(meta_action_matches)
                        .unwrap_or(false)
                })
                .map(|entry| coerce_f64(&entry["value"]))
                .sum()
        })
        .unwrap_or(0.0)
}

fn normalize_meta(payload: &Value) -> NormalizedMetric {
    let mut out = base(ProviderKind::Meta, payload);
    out.date = payload["date_start"].as_str().unwrap_or_default().to_string();
    out.spend = coerce_f64(&payload["spend"]);
    out.impressions = coerce_i64(&payload["impressions"]);
    out.clicks = coerce_i64(&payload["clicks"]);
    out.conversions = sum_matching_actions(&payload["actions"]);
    out.revenue = payload
        .get("action_values")
        .map(|values| sum_matching_actions(values));
    out.campaign_id = opt_string(&payload["campaign_id"]);
    out.campaign_name = opt_string(&payload["campaign_name"]);
    out.creatives = payload["creatives"]
        .as_array()
        .map(|entries| {
            entries
                .iter()
                .filter_map(|creative| {
                    Some(Creative {
                        id: opt_string(&creative["id"])?,
                        name: opt_string(&creative["name"]),
                        creative_type: opt_string(&creative["object_type"]),
                        url: opt_string(&creative["thumbnail_url"]),
                        ..Creative::default()
                    })
                })
                .collect()
        })
        .unwrap_or_default();
    out
}

fn normalize_tiktok(payload: &Value) -> NormalizedMetric {
    let dimensions = &payload["dimensions"];
    let metrics = &payload["metrics"];
    let mut out = base(ProviderKind::TikTok, payload);
    // "2024-01-01 00:00:00" → "2024-01-01".
    out.date = dimensions["stat_time_day"]
        .as_str()
        .map(|s| s.chars().take(10).collect())
        .unwrap_or_default();
    out.spend = coerce_f64(&metrics["spend"]);
    out.impressions = coerce_i64(&metrics["impressions"]);
    out.clicks = coerce_i64(&metrics["clicks"]);
    out.conversions = coerce_f64(&metrics["conversion"]);
    out.revenue = metrics
        .get("total_complete_payment")
        .map(|v| coerce_f64(v));
    out.campaign_id = opt_string(&dimensions["campaign_id"]);
    out.campaign_name = opt_string(&metrics["campaign_name"]);
    out
}

fn normalize_linkedin(payload: &Value) -> NormalizedMetric {
    let mut out = base(ProviderKind::LinkedIn, payload);
    let start = &payload["dateRange"]["start"];
    if let (Some(year), Some(month), Some(day)) = (
        start["year"].as_i64(),
        start["month"].as_i64(),
        start["day"].as_i64(),
    ) {
        out.date = format!("{:04}-{:02}-{:02}", year, month, day);
    }
    out.spend = coerce_f64(&payload["costInLocalCurrency"]);
    out.impressions = coerce_i64(&payload["impressions"]);
    out.clicks = coerce_i64(&payload["clicks"]);
    out.conversions = coerce_f64(&payload["externalWebsiteConversions"]);
    out.revenue = payload
        .get("conversionValueInLocalCurrency")
        .map(|v| coerce_f64(v));
    out.campaign_id = payload["pivotValues"][0]
        .as_str()
        .map(|urn| urn.rsplit(':').next().unwrap_or(urn).to_string());
    out
}

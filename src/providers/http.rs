//! Shared request policy for provider calls.
//!
//! - 429 and 5xx are transient: retried up to two extra times with
//!   `200ms × 2^attempt` backoff, then surfaced as `UpstreamUnavailable`.
//! - 401/403 surface immediately as `UpstreamAuthExpired`; the job runner
//!   owns the single refresh-and-retry.
//! - Other non-2xx responses surface as `UpstreamUnavailable` without
//!   spending retry attempts.

use reqwest::{RequestBuilder, Response, StatusCode};
use tracing::warn;

use crate::config::retry::{FETCH_BACKOFF_BASE, FETCH_EXTRA_ATTEMPTS};
use crate::error::SyncError;

/// Send a request under the provider retry policy.
///
/// The builder must be cloneable (no streaming body); every adapter call
/// site uses buffered JSON/form/query bodies, so `try_clone` always
/// succeeds there.
pub async fn send_with_retry(request: RequestBuilder) -> Result<Response, SyncError> {
    let mut last_failure = String::new();

    for attempt in 0..=FETCH_EXTRA_ATTEMPTS {
        let Some(req) = request.try_clone() else {
            return Err(SyncError::UpstreamUnavailable(
                "request body is not retryable".to_string(),
            ));
        };

        match req.send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    return Ok(response);
                }
                if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                    return Err(SyncError::UpstreamAuthExpired);
                }
                if !is_transient(status) {
                    let body = response.text().await.unwrap_or_default();
                    return Err(SyncError::UpstreamUnavailable(format!(
                        "upstream returned {}: {}",
                        status,
                        truncate(&body)
                    )));
                }
                last_failure = format!("upstream returned {}", status);
            }
            Err(e) => {
                // Connection-level failures get the same transient treatment
                // as a 5xx.
                last_failure = format!("request failed: {}", e);
            }
        }

        if attempt < FETCH_EXTRA_ATTEMPTS {
            let delay = FETCH_BACKOFF_BASE * 2u32.pow(attempt);
            warn!(
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                failure = %last_failure,
                "Transient provider failure, backing off"
            );
            tokio::time::sleep(delay).await;
        }
    }

    Err(SyncError::UpstreamUnavailable(last_failure))
}

fn is_transient(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn truncate(body: &str) -> String {
    body.chars().take(200).collect()
}

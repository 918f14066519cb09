//! Encrypted OAuth state tokens for CSRF protection.
//!
//! The state parameter round-trips through the provider's redirect, so it
//! is self-contained: an AES-256-GCM-sealed JSON payload in URL-safe
//! base64, validated by decryption and a 5-minute age check. Tokens are not
//! tracked for single use; replay inside the TTL is an accepted, documented
//! window.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::credentials::{open_url_safe, seal_url_safe};
use crate::error::SyncError;

/// Maximum state-token age.
pub const STATE_TTL_SECS: i64 = 300;

/// Context carried through the provider redirect.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatePayload {
    /// Workspace initiating the connection.
    pub workspace_id: String,
    /// Where to send the user after the callback completes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect: Option<String>,
    /// Sub-client being connected, for agency setups.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl StatePayload {
    pub fn new(workspace_id: impl Into<String>) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            redirect: None,
            client_id: None,
            created_at: Utc::now(),
        }
    }
}

/// Seal a payload into an opaque, URL-safe state token.
pub fn create_state(payload: &StatePayload, key: &[u8]) -> Result<String, SyncError> {
    let bytes = serde_json::to_vec(payload)
        .map_err(|e| SyncError::InvalidState(format!("failed to encode payload: {}", e)))?;
    seal_url_safe(&bytes, key).map_err(|e| SyncError::InvalidState(e.to_string()))
}

/// Decrypt and validate a state token.
///
/// Fails with `InvalidState` when decryption fails, required fields are
/// missing, or the payload is older than [`STATE_TTL_SECS`].
pub fn validate_state(token: &str, key: &[u8]) -> Result<StatePayload, SyncError> {
    let bytes = open_url_safe(token, key)
        .map_err(|_| SyncError::InvalidState("undecryptable state token".to_string()))?;

    let payload: StatePayload = serde_json::from_slice(&bytes)
        .map_err(|e| SyncError::InvalidState(format!("malformed state payload: {}", e)))?;

    if payload.workspace_id.is_empty() {
        return Err(SyncError::InvalidState("empty workspace in state".to_string()));
    }

    let age = Utc::now() - payload.created_at;
    if age > chrono::Duration::seconds(STATE_TTL_SECS) {
        return Err(SyncError::InvalidState(format!(
            "state token expired ({}s old)",
            age.num_seconds()
        )));
    }

    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::seal_url_safe;

    const KEY: [u8; 32] = [3u8; 32];

    #[test]
    fn test_round_trip() {
        let mut payload = StatePayload::new("w1");
        payload.redirect = Some("/settings/integrations".into());
        payload.client_id = Some("client-4".into());

        let token = create_state(&payload, &KEY).unwrap();
        let validated = validate_state(&token, &KEY).unwrap();

        assert_eq!(validated.workspace_id, "w1");
        assert_eq!(validated.redirect.as_deref(), Some("/settings/integrations"));
        assert_eq!(validated.client_id.as_deref(), Some("client-4"));
    }

    #[test]
    fn test_token_is_url_safe() {
        let token = create_state(&StatePayload::new("w1"), &KEY).unwrap();
        assert!(token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn test_malformed_ciphertext_rejected() {
        let err = validate_state("not-a-real-token", &KEY).unwrap_err();
        assert!(matches!(err, SyncError::InvalidState(_)));

        // Valid base64, garbage ciphertext.
        let err = validate_state("AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA", &KEY).unwrap_err();
        assert!(matches!(err, SyncError::InvalidState(_)));
    }

    #[test]
    fn test_wrong_key_rejected() {
        let token = create_state(&StatePayload::new("w1"), &KEY).unwrap();
        let err = validate_state(&token, &[9u8; 32]).unwrap_err();
        assert!(matches!(err, SyncError::InvalidState(_)));
    }

    #[test]
    fn test_missing_fields_rejected() {
        // Well-encrypted, but not a state payload.
        let token = seal_url_safe(br#"{"redirect": "/x"}"#, &KEY).unwrap();
        let err = validate_state(&token, &KEY).unwrap_err();
        assert!(matches!(err, SyncError::InvalidState(_)));
    }

    #[test]
    fn test_expired_state_rejected() {
        let mut payload = StatePayload::new("w1");
        payload.created_at = Utc::now() - chrono::Duration::seconds(STATE_TTL_SECS + 60);

        let token = create_state(&payload, &KEY).unwrap();
        let err = validate_state(&token, &KEY).unwrap_err();
        match err {
            SyncError::InvalidState(msg) => assert!(msg.contains("expired")),
            other => panic!("expected InvalidState, got {:?}", other),
        }
    }

    #[test]
    fn test_fresh_state_within_ttl_accepted() {
        let mut payload = StatePayload::new("w1");
        payload.created_at = Utc::now() - chrono::Duration::seconds(STATE_TTL_SECS - 30);
        let token = create_state(&payload, &KEY).unwrap();
        assert!(validate_state(&token, &KEY).is_ok());
    }

    #[test]
    fn test_replay_within_ttl_is_accepted() {
        // No consumed-token tracking: validating twice succeeds twice.
        let token = create_state(&StatePayload::new("w1"), &KEY).unwrap();
        assert!(validate_state(&token, &KEY).is_ok());
        assert!(validate_state(&token, &KEY).is_ok());
    }
}

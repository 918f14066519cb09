//! AES-256-GCM sealing for secrets at rest.
//!
//! Each secret is sealed into a single opaque blob: `nonce || ciphertext`,
//! base64-encoded. The nonce is random per seal and never reused. The same
//! primitive protects stored OAuth tokens and the ephemeral OAuth state
//! token (URL-safe alphabet for the latter).

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use anyhow::{anyhow, Context, Result};
use base64::{
    engine::general_purpose::{STANDARD as BASE64, URL_SAFE_NO_PAD as BASE64_URL},
    Engine,
};

/// Master key size in bytes (256 bits).
const KEY_SIZE: usize = 32;

/// GCM nonce size in bytes (96 bits).
const NONCE_SIZE: usize = 12;

/// Decode and length-check a base64 master key.
pub fn decode_key(key_base64: &str) -> Result<Vec<u8>> {
    let key = BASE64
        .decode(key_base64)
        .context("encryption key is not valid base64")?;
    if key.len() != KEY_SIZE {
        return Err(anyhow!(
            "encryption key must be {} bytes, got {}",
            KEY_SIZE,
            key.len()
        ));
    }
    Ok(key)
}

fn seal_bytes(plaintext: &[u8], key: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|e| anyhow!("bad cipher key: {}", e))?;
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|e| anyhow!("encryption failed: {}", e))?;

    let mut blob = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    blob.extend_from_slice(&nonce);
    blob.extend_from_slice(&ciphertext);
    Ok(blob)
}

fn open_bytes(blob: &[u8], key: &[u8]) -> Result<Vec<u8>> {
    if blob.len() <= NONCE_SIZE {
        return Err(anyhow!("sealed blob too short"));
    }
    let (nonce, ciphertext) = blob.split_at(NONCE_SIZE);
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|e| anyhow!("bad cipher key: {}", e))?;
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| anyhow!("decryption failed (wrong key or tampered data)"))
}

/// Seal a secret for database storage (standard base64).
pub fn seal(plaintext: &str, key: &[u8]) -> Result<String> {
    Ok(BASE64.encode(seal_bytes(plaintext.as_bytes(), key)?))
}

/// Open a database-stored secret.
pub fn open(sealed: &str, key: &[u8]) -> Result<String> {
    let blob = BASE64.decode(sealed).context("sealed blob is not valid base64")?;
    String::from_utf8(open_bytes(&blob, key)?).context("decrypted secret is not UTF-8")
}

/// Seal a payload into a URL-safe token (no padding), e.g. an OAuth state
/// parameter that travels through provider redirects.
pub fn seal_url_safe(plaintext: &[u8], key: &[u8]) -> Result<String> {
    Ok(BASE64_URL.encode(seal_bytes(plaintext, key)?))
}

/// Open a URL-safe token produced by [`seal_url_safe`].
pub fn open_url_safe(token: &str, key: &[u8]) -> Result<Vec<u8>> {
    let blob = BASE64_URL
        .decode(token)
        .context("token is not valid url-safe base64")?;
    open_bytes(&blob, key)
}

//! Envelope encryption for tokens at rest.
//!
//! AES-256-GCM with a key derived from an operator-supplied secret via
//! SHA-256, a random 96-bit nonce per call, and an explicit `"enc:"` envelope
//! prefix. A malformed envelope is always a distinguished
//! `GatewayError::CorruptCiphertext` rather than a silent fallback to
//! plaintext — nothing persists a client's token unencrypted.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::error::GatewayError;

const ENVELOPE_PREFIX: &str = "enc:";
const NONCE_LEN: usize = 12;

/// Derives a 256-bit AES key from an arbitrary-length operator secret via
/// SHA-256 of the raw secret bytes.
fn derive_key(secret: &str) -> Key<Aes256Gcm> {
    let digest = Sha256::digest(secret.as_bytes());
    *Key::<Aes256Gcm>::from_slice(&digest)
}

/// Reads the encryption key from the environment variable named by
/// `var_name` (the config-configurable `security.config_key_env`, default
/// `TOKEN_ENC_KEY`).
pub fn key_from_env(var_name: &str) -> Result<String, GatewayError> {
    std::env::var(var_name).map_err(|_| GatewayError::KeyMissing)
}

/// Encrypts `plaintext` under `secret`, returning `"enc:" + base64url(nonce
/// || ciphertext)`.
pub fn encrypt(plaintext: &str, secret: &str) -> Result<String, GatewayError> {
    let cipher = Aes256Gcm::new(&derive_key(secret));

    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext.as_bytes())
        .map_err(|_| GatewayError::CorruptCiphertext)?;

    let mut combined = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    combined.extend_from_slice(&nonce_bytes);
    combined.extend_from_slice(&ciphertext);

    Ok(format!(
        "{ENVELOPE_PREFIX}{}",
        URL_SAFE_NO_PAD.encode(combined)
    ))
}

/// Decrypts a value produced by [`encrypt`]. Returns
/// `GatewayError::CorruptCiphertext` for anything that isn't a well-formed
/// envelope — truncation, bad base64, tag mismatch — never panics.
pub fn decrypt(envelope: &str, secret: &str) -> Result<String, GatewayError> {
    let encoded = envelope
        .strip_prefix(ENVELOPE_PREFIX)
        .ok_or(GatewayError::CorruptCiphertext)?;

    let combined = URL_SAFE_NO_PAD
        .decode(encoded)
        .map_err(|_| GatewayError::CorruptCiphertext)?;

    if combined.len() <= NONCE_LEN {
        return Err(GatewayError::CorruptCiphertext);
    }
    let (nonce_bytes, ciphertext) = combined.split_at(NONCE_LEN);
    let nonce = Nonce::from_slice(nonce_bytes);

    let cipher = Aes256Gcm::new(&derive_key(secret));
    let plaintext = cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| GatewayError::CorruptCiphertext)?;

    String::from_utf8(plaintext).map_err(|_| GatewayError::CorruptCiphertext)
}

/// True if `value` looks like one of our envelopes, used by the token store
/// to decide whether a stored value needs decrypting.
pub fn is_envelope(value: &str) -> bool {
    value.starts_with(ENVELOPE_PREFIX)
}

/// Constant-time string comparison, used for OAuth state/PKCE verifier
/// checks so that timing does not leak how much of a guessed value matched.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let secret = "test-secret-value";
        let enc = encrypt("hello world", secret).unwrap();
        assert!(is_envelope(&enc));
        assert_eq!(decrypt(&enc, secret).unwrap(), "hello world");
    }

    #[test]
    fn wrong_key_fails_closed() {
        let enc = encrypt("hello world", "key-a").unwrap();
        assert!(matches!(
            decrypt(&enc, "key-b"),
            Err(GatewayError::CorruptCiphertext)
        ));
    }

    #[test]
    fn truncated_envelope_is_corrupt_not_panic() {
        let enc = encrypt("hello world", "key-a").unwrap();
        let truncated = &enc[..enc.len() - 10];
        assert!(matches!(
            decrypt(truncated, "key-a"),
            Err(GatewayError::CorruptCiphertext)
        ));
    }

    #[test]
    fn missing_prefix_is_corrupt() {
        assert!(matches!(
            decrypt("not-an-envelope", "key-a"),
            Err(GatewayError::CorruptCiphertext)
        ));
    }

    #[test]
    fn distinct_nonces_each_call() {
        let a = encrypt("same plaintext", "k").unwrap();
        let b = encrypt("same plaintext", "k").unwrap();
        assert_ne!(a, b);
    }
}

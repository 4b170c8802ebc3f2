// src/signature.rs
//
// Secret generation and payload signing for webhook deliveries.
//
// An endpoint secret looks like `whsec_<url-safe-base64>` and is returned to
// the caller exactly once, at creation or rotation. Storage keeps only
// `SHA-256(secret)` as lowercase hex.
//
// Outgoing payloads are signed `HMAC-SHA256(secret_hash, body)`; the HMAC
// key is the stored *hash*, not the original secret. Integrators reconstruct
// the key by hashing the secret they were shown, so this scheme is part of
// the public contract and must not change.
//
// ────────────────────────────────────────────────────────────────────────────

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Prefix identifying SkyPlanner webhook secrets.
pub const SECRET_PREFIX: &str = "whsec_";

/// Generate a fresh endpoint secret: `whsec_` + 32 random bytes, URL-safe
/// base64 without padding.
pub fn generate_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("{}{}", SECRET_PREFIX, URL_SAFE_NO_PAD.encode(bytes))
}

/// Hash a secret for storage. One-way; the plaintext secret is never kept.
pub fn hash_secret(secret: &str) -> String {
    hex::encode(Sha256::digest(secret.as_bytes()))
}

/// Sign a payload with the *stored hash* of the endpoint secret.
///
/// Returns the lowercase hex HMAC-SHA256 digest (without any `sha256=`
/// header prefix; that is added at request construction).
pub fn sign_payload(secret_hash: &str, payload: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret_hash.as_bytes()).expect("HMAC accepts any key length");
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

/// Verify a signature by recomputing with the same scheme.
///
/// Comparison is constant-time.
pub fn verify_signature(secret_hash: &str, payload: &[u8], signature_hex: &str) -> bool {
    let expected = sign_payload(secret_hash, payload);
    expected.as_bytes().ct_eq(signature_hex.as_bytes()).into()
}

// ─── Tests ──────────────────────────────────────────────────────────────────

//! Security utilities: API key hashing, notification signatures and
//! idempotency keys.

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use billing_types::{Money, PaymentPurpose};

type HmacSha256 = Hmac<Sha256>;

/// Hashes an API key using SHA-256.
pub fn hash_api_key(key: &str) -> String {
    let hash = Sha256::digest(key.as_bytes());
    hex::encode(hash)
}

/// Verifies an API key against a stored hash using constant-time comparison.
pub fn verify_api_key(input: &str, stored_hash: &str) -> bool {
    let input_hash = hash_api_key(input);
    input_hash.as_bytes().ct_eq(stored_hash.as_bytes()).into()
}

/// Signs a payload using HMAC-SHA256, hex encoded.
pub fn sign_payload(payload: &[u8], secret: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

/// Verifies a hex HMAC-SHA256 signature using constant-time comparison.
pub fn verify_signature(payload: &[u8], signature: &str, secret: &str) -> bool {
    let expected = sign_payload(payload, secret);
    expected
        .as_bytes()
        .ct_eq(signature.trim().to_ascii_lowercase().as_bytes())
        .into()
}

/// Derives the idempotency key of a charge.
///
/// Identical (purpose, payer, amount, currency, nonce) tuples map to the same
/// key, so a retried request finds the intent the first one created. Each
/// field is length-prefixed, so no choice of payer or nonce text can make two
/// different tuples hash the same material.
pub fn derive_idempotency_key(
    purpose: PaymentPurpose,
    payer_ref: &str,
    amount: &Money,
    nonce: &str,
) -> String {
    let fields = [
        purpose.as_str().to_string(),
        payer_ref.to_string(),
        amount.amount().to_string(),
        amount.currency().code().to_string(),
        nonce.to_string(),
    ];
    let mut hasher = Sha256::new();
    for field in &fields {
        hasher.update((field.len() as u64).to_be_bytes());
        hasher.update(field.as_bytes());
    }
    hex::encode(hasher.finalize())
}

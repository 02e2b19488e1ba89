//! Keyed-hash signing of the pool's logical content.
//!
//! The tag is HMAC-SHA256 keyed with the pool passphrase over the compact JSON
//! document with the `signature` key removed. Keys keep document order and
//! `<`, `>`, `&`, U+2028 and U+2029 are written as `\uXXXX` escapes, which is
//! the byte layout earlier pool tooling signed. Verification hashes the
//! decrypted document as stored, so fields this crate does not model (zero
//! timestamps, explicit `false` flags, non-UTC offsets) still count.

use crate::error::{MacvaultError, MacvaultResult};
use crate::pool::Pool;
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

const SIGNATURE_KEY: &str = "signature";

/// Result of checking a pool's stored signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureStatus {
    Verified,
    /// No signature stored. Trusted for compatibility with pools written before
    /// signing existed, but operators must be told.
    Unsigned,
    Mismatch,
}

impl SignatureStatus {
    pub fn is_trusted(self) -> bool {
        !matches!(self, SignatureStatus::Mismatch)
    }
}

/// Replace `pool.signature` with a fresh tag under `passphrase`.
pub fn sign(pool: &mut Pool, passphrase: &str) -> MacvaultResult<()> {
    pool.signature.clear();
    let document = serde_json::to_value(&*pool)?;
    let mac = keyed_digest(&signing_payload(document)?, passphrase)?;
    pool.signature = hex::encode(mac.finalize().into_bytes());
    Ok(())
}

/// True when the stored signature matches, or when no signature is stored.
pub fn verify(pool: &Pool, passphrase: &str) -> bool {
    status(pool, passphrase).is_trusted()
}

/// Classify the signature of an in-memory pool. Comparison is constant-time.
pub fn status(pool: &Pool, passphrase: &str) -> SignatureStatus {
    match serde_json::to_value(pool) {
        Ok(document) => document_value_status(document, passphrase),
        Err(_) => SignatureStatus::Mismatch,
    }
}

/// Classify the signature of a decrypted pool document exactly as stored.
pub fn document_status(plaintext: &[u8], passphrase: &str) -> MacvaultResult<SignatureStatus> {
    let document: Value = serde_json::from_slice(plaintext)?;
    Ok(document_value_status(document, passphrase))
}

fn document_value_status(mut document: Value, passphrase: &str) -> SignatureStatus {
    let stored = document
        .as_object_mut()
        .and_then(|fields| fields.remove(SIGNATURE_KEY));
    let stored = match stored {
        None | Some(Value::Null) => return SignatureStatus::Unsigned,
        Some(Value::String(tag)) if tag.is_empty() => return SignatureStatus::Unsigned,
        Some(Value::String(tag)) => tag,
        Some(_) => return SignatureStatus::Mismatch,
    };

    let Ok(stored) = hex::decode(stored.trim()) else {
        return SignatureStatus::Mismatch;
    };
    let digest = signing_payload(document).and_then(|payload| keyed_digest(&payload, passphrase));
    match digest {
        Ok(mac) if mac.clone().verify_slice(&stored).is_ok() => SignatureStatus::Verified,
        _ => SignatureStatus::Mismatch,
    }
}

/// Compact bytes that get hashed. `document` must not carry a signature.
fn signing_payload(mut document: Value) -> MacvaultResult<Vec<u8>> {
    if let Some(fields) = document.as_object_mut() {
        fields.remove(SIGNATURE_KEY);
    }
    let compact = serde_json::to_string(&document)?;
    Ok(escape_markup(&compact).into_bytes())
}

/// Outside string literals compact JSON never contains these characters, so
/// a plain substitution only touches string contents.
fn escape_markup(json: &str) -> String {
    let mut out = String::with_capacity(json.len());
    for ch in json.chars() {
        match ch {
            '<' => out.push_str("\\u003c"),
            '>' => out.push_str("\\u003e"),
            '&' => out.push_str("\\u0026"),
            '\u{2028}' => out.push_str("\\u2028"),
            '\u{2029}' => out.push_str("\\u2029"),
            other => out.push(other),
        }
    }
    out
}

fn keyed_digest(payload: &[u8], passphrase: &str) -> MacvaultResult<HmacSha256> {
    let mut mac = HmacSha256::new_from_slice(passphrase.as_bytes())
        .map_err(|err| MacvaultError::Provider(format!("HMAC key rejected: {err}")))?;
    mac.update(payload);
    Ok(mac)
}

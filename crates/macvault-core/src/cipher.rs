//! Passphrase-based authenticated encryption of opaque payloads.
//!
//! Blob layout before text encoding: `salt[16] || nonce[12] || ciphertext+tag`.
//! The key is PBKDF2-HMAC-SHA256 over the passphrase with a fresh random salt;
//! the cipher is AES-256-GCM with a fresh random nonce. The whole blob is
//! standard base64.

use crate::error::{MacvaultError, MacvaultResult};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use pbkdf2::pbkdf2_hmac;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use zeroize::Zeroizing;

pub const SALT_LEN: usize = 16;
pub const NONCE_LEN: usize = 12;
pub const KEY_LEN: usize = 32;
pub const KDF_ROUNDS: u32 = 10_000;

/// Encrypt `plaintext` under `passphrase`, returning the text-encoded blob.
pub fn seal(plaintext: &[u8], passphrase: &str) -> MacvaultResult<String> {
    let mut salt = [0u8; SALT_LEN];
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut salt);
    OsRng.fill_bytes(&mut nonce);

    let key = derive_key(passphrase, &salt);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_slice()));
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| MacvaultError::Provider("AES-GCM encryption failed".into()))?;

    let mut blob = Vec::with_capacity(SALT_LEN + NONCE_LEN + ciphertext.len());
    blob.extend_from_slice(&salt);
    blob.extend_from_slice(&nonce);
    blob.extend_from_slice(&ciphertext);
    Ok(STANDARD.encode(blob))
}

/// Decrypt a blob produced by [`seal`].
///
/// Every failure (bad encoding, truncated blob, tag mismatch) is reported as
/// [`MacvaultError::Decryption`].
pub fn open(blob: &[u8], passphrase: &str) -> MacvaultResult<Zeroizing<Vec<u8>>> {
    let text = blob.trim_ascii();
    let raw = STANDARD
        .decode(text)
        .map_err(|_| MacvaultError::Decryption)?;
    if raw.len() < SALT_LEN + NONCE_LEN {
        return Err(MacvaultError::Decryption);
    }

    let (salt, rest) = raw.split_at(SALT_LEN);
    let (nonce, ciphertext) = rest.split_at(NONCE_LEN);

    let key = derive_key(passphrase, salt);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_slice()));
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map(Zeroizing::new)
        .map_err(|_| MacvaultError::Decryption)
}

fn derive_key(passphrase: &str, salt: &[u8]) -> Zeroizing<[u8; KEY_LEN]> {
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), salt, KDF_ROUNDS, key.as_mut_slice());
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_including_empty_payload() {
        for payload in [&b""[..], b"x", br#"{"version":1,"addresses":[]}"#] {
            let sealed = seal(payload, "correct horse").unwrap();
            let opened = open(sealed.as_bytes(), "correct horse").unwrap();
            assert_eq!(opened.as_slice(), payload);
        }
    }

    #[test]
    fn empty_passphrase_still_round_trips() {
        let sealed = seal(b"payload", "").unwrap();
        assert_eq!(open(sealed.as_bytes(), "").unwrap().as_slice(), b"payload");
    }

    #[test]
    fn wrong_passphrase_fails_with_decryption_error() {
        let sealed = seal(b"inventory", "first-pass").unwrap();
        assert!(matches!(
            open(sealed.as_bytes(), "second-pass"),
            Err(MacvaultError::Decryption)
        ));
    }

    #[test]
    fn flipping_bits_anywhere_is_detected() {
        let sealed = seal(b"tamper target payload", "pass-phrase").unwrap();
        let raw = STANDARD.decode(&sealed).unwrap();
        for idx in (0..raw.len()).step_by(3) {
            for bit in [0u8, 7] {
                let mut tampered = raw.clone();
                tampered[idx] ^= 1 << bit;
                let encoded = STANDARD.encode(&tampered);
                assert!(
                    matches!(
                        open(encoded.as_bytes(), "pass-phrase"),
                        Err(MacvaultError::Decryption)
                    ),
                    "flip at byte {idx} bit {bit} went unnoticed"
                );
            }
        }
    }

    #[test]
    fn short_and_non_text_blobs_are_decryption_errors() {
        let short = STANDARD.encode([0u8; SALT_LEN + NONCE_LEN - 1]);
        assert!(matches!(
            open(short.as_bytes(), "p"),
            Err(MacvaultError::Decryption)
        ));
        assert!(matches!(
            open(b"%%% not base64 %%%", "p"),
            Err(MacvaultError::Decryption)
        ));
        assert!(matches!(open(b"", "p"), Err(MacvaultError::Decryption)));
    }

    #[test]
    fn salt_and_nonce_are_fresh_per_seal() {
        let a = STANDARD.decode(seal(b"same", "same").unwrap()).unwrap();
        let b = STANDARD.decode(seal(b"same", "same").unwrap()).unwrap();
        assert_ne!(a[..SALT_LEN], b[..SALT_LEN]);
        assert_ne!(
            a[SALT_LEN..SALT_LEN + NONCE_LEN],
            b[SALT_LEN..SALT_LEN + NONCE_LEN]
        );
    }

    #[test]
    fn trailing_newline_is_tolerated() {
        let mut sealed = seal(b"data", "pw").unwrap();
        sealed.push('\n');
        assert_eq!(open(sealed.as_bytes(), "pw").unwrap().as_slice(), b"data");
    }
}

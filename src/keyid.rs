/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/keyid.rs
*
* Pure computation of the signing key-ID set (spec §3 "Key-ID set", §4.2
* "Signing-Key ID Observer"). A key-ID is `base64url(SHA-256(DER(key)))`;
* since a PEM "PUBLIC KEY" block's payload *is* the DER-encoded
* SubjectPublicKeyInfo, no algorithm-specific parsing (RSA/EC/...) is
* needed — only a PEM decoder.
*
* SPDX-License-Identifier: Apache-2.0
*/

use base64::Engine;
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KeyIdError {
    #[error("no PEM public keys found in the supplied data")]
    NoKeysFound,
    #[error("failed to parse PEM data: {0}")]
    PemParse(#[from] std::io::Error),
}

/// Parses every "PUBLIC KEY" PEM block in `pem_data`, computes
/// `base64url_nopad(SHA-256(der))` for each, and returns them sorted
/// lexicographically (spec §4.2: "sort lexicographically").
pub fn compute_key_ids(pem_data: &[u8]) -> Result<Vec<String>, KeyIdError> {
    let mut reader = std::io::BufReader::new(pem_data);
    let mut key_ids: Vec<String> = Vec::new();

    for key in rustls_pemfile::public_keys(&mut reader) {
        let key = key?;
        let digest = Sha256::digest(key.as_ref());
        key_ids.push(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(digest));
    }

    if key_ids.is_empty() {
        return Err(KeyIdError::NoKeysFound);
    }

    key_ids.sort();
    Ok(key_ids)
}

#[cfg(test)]
mod tests {
    use super::*;

    // A PEM "PUBLIC KEY" block wrapping arbitrary bytes, used only to
    // exercise the PEM -> DER -> SHA-256 -> base64url pipeline; the PEM
    // decoder only cares about the block label and valid base64, not
    // whether the payload is a structurally valid SubjectPublicKeyInfo.
    const TEST_PEM: &str = "-----BEGIN PUBLIC KEY-----\n\
AAECAwQFBgcICQoLDA0ODxAREhMUFRYXGBkaGxwdHh8gISIjJCUmJygpKissLS4v\n\
MDEyMzQ1Njc4OTo7\n\
-----END PUBLIC KEY-----\n";

    #[test]
    fn computes_a_stable_key_id_for_a_known_key() {
        let ids = compute_key_ids(TEST_PEM.as_bytes()).unwrap();
        assert_eq!(ids.len(), 1);
        assert!(!ids[0].contains('+'));
        assert!(!ids[0].contains('/'));
        assert!(!ids[0].contains('='));
    }

    #[test]
    fn multiple_keys_are_sorted_lexicographically() {
        let combined = format!("{TEST_PEM}{TEST_PEM}");
        // Same key twice still yields two identical, sorted entries.
        let ids = compute_key_ids(combined.as_bytes()).unwrap();
        assert_eq!(ids.len(), 2);
        assert_eq!(ids[0], ids[1]);
    }

    #[test]
    fn empty_input_is_an_error() {
        assert!(matches!(compute_key_ids(b""), Err(KeyIdError::NoKeysFound)));
    }
}

//! Authenticated encryption layer. Every blob is
//! `nonce(24) ‖ MAC(16) ‖ ciphertext` so storage stays stateless; the
//! symmetric key is derived per blob from the caller's key material, the
//! nonce and a domain-separation string ("erd", "eks", "ect", "emk",
//! "cse") so the layers cannot be used as oracles against each other.

use crypto_secretbox::aead::{Aead, KeyInit};
use crypto_secretbox::{Nonce as SecretboxNonce, XSalsa20Poly1305};
use zeroize::Zeroizing;

use anastasis_core::types::Nonce;
use anastasis_core::{EncryptedKeyShare, HashCode, KeyShare, TruthKey};

use crate::error::CryptoError;
use crate::kdf::kdf32;

pub const NONCE_BYTES: usize = 24;
pub const MAC_BYTES: usize = 16;

/// Salt strings, one per encryption domain.
pub const SALT_RECOVERY_DOCUMENT: &str = "erd";
pub const SALT_KEY_SHARE: &str = "eks";
pub const SALT_TRUTH: &str = "ect";
pub const SALT_MASTER_KEY: &str = "emk";
pub const SALT_CORE_SECRET: &str = "cse";

fn derive_sym_key(key_material: &[u8], nonce: &Nonce, salt: &str) -> Zeroizing<[u8; 32]> {
    Zeroizing::new(kdf32(
        Some(nonce.as_bytes()),
        key_material,
        salt.as_bytes(),
    ))
}

/// Encrypt `plaintext` under a key derived from `key_material` and a
/// fresh random nonce. Output layout: nonce ‖ MAC ‖ ciphertext.
pub fn encrypt(key_material: &[u8], plaintext: &[u8], salt: &str) -> Vec<u8> {
    encrypt_with_nonce(&Nonce::random(), key_material, plaintext, salt)
}

/// Deterministic variant for callers that manage their own nonces.
pub fn encrypt_with_nonce(
    nonce: &Nonce,
    key_material: &[u8],
    plaintext: &[u8],
    salt: &str,
) -> Vec<u8> {
    let key = derive_sym_key(key_material, nonce, salt);
    let cipher = XSalsa20Poly1305::new_from_slice(key.as_ref())
        .expect("derived key is always 32 bytes");
    let ct_and_tag = cipher
        .encrypt(SecretboxNonce::from_slice(nonce.as_bytes()), plaintext)
        .expect("XSalsa20-Poly1305 encryption cannot fail for in-memory buffers");
    // The AEAD crate appends the tag; the wire format wants it up front.
    let (ct, tag) = ct_and_tag.split_at(plaintext.len());
    let mut out = Vec::with_capacity(NONCE_BYTES + MAC_BYTES + plaintext.len());
    out.extend_from_slice(nonce.as_bytes());
    out.extend_from_slice(tag);
    out.extend_from_slice(ct);
    out
}

/// Inverse of [`encrypt`]. Fails with [`CryptoError::AuthFail`] on MAC
/// mismatch, i.e. wrong key material or tampered blob.
pub fn decrypt(key_material: &[u8], blob: &[u8], salt: &str) -> Result<Vec<u8>, CryptoError> {
    if blob.len() < NONCE_BYTES + MAC_BYTES {
        return Err(CryptoError::Malformed(blob.len()));
    }
    let nonce = Nonce::from_bytes(
        blob[..NONCE_BYTES]
            .try_into()
            .expect("slice length checked above"),
    );
    let tag = &blob[NONCE_BYTES..NONCE_BYTES + MAC_BYTES];
    let ct = &blob[NONCE_BYTES + MAC_BYTES..];
    let key = derive_sym_key(key_material, &nonce, salt);
    let cipher = XSalsa20Poly1305::new_from_slice(key.as_ref())
        .expect("derived key is always 32 bytes");
    let mut ct_and_tag = Vec::with_capacity(ct.len() + MAC_BYTES);
    ct_and_tag.extend_from_slice(ct);
    ct_and_tag.extend_from_slice(tag);
    cipher
        .decrypt(SecretboxNonce::from_slice(nonce.as_bytes()), ct_and_tag.as_slice())
        .map_err(|_| CryptoError::AuthFail)
}

// ── Recovery documents ("erd") ───────────────────────────────────────────────

pub fn recovery_document_encrypt(id: &HashCode, document: &[u8]) -> Vec<u8> {
    encrypt(id.as_bytes(), document, SALT_RECOVERY_DOCUMENT)
}

pub fn recovery_document_decrypt(id: &HashCode, blob: &[u8]) -> Result<Vec<u8>, CryptoError> {
    decrypt(id.as_bytes(), blob, SALT_RECOVERY_DOCUMENT)
}

// ── Key shares ("eks", or the answer for question truths) ────────────────────

/// Encrypt a key share under the user identifier. For question truths
/// the (normalized) answer string is used as the salt instead of "eks",
/// binding share release to knowledge of the answer.
pub fn keyshare_encrypt(
    share: &KeyShare,
    id: &HashCode,
    answer_salt: Option<&str>,
) -> EncryptedKeyShare {
    let blob = encrypt(
        id.as_bytes(),
        share.as_bytes(),
        answer_salt.unwrap_or(SALT_KEY_SHARE),
    );
    EncryptedKeyShare::from_bytes(
        blob.as_slice()
            .try_into()
            .expect("32-byte share always encrypts to exactly 72 bytes"),
    )
}

pub fn keyshare_decrypt(
    enc: &EncryptedKeyShare,
    id: &HashCode,
    answer_salt: Option<&str>,
) -> Result<KeyShare, CryptoError> {
    let plain = decrypt(
        id.as_bytes(),
        enc.as_bytes(),
        answer_salt.unwrap_or(SALT_KEY_SHARE),
    )?;
    let bytes: [u8; 32] = plain
        .as_slice()
        .try_into()
        .map_err(|_| CryptoError::Malformed(plain.len()))?;
    Ok(KeyShare::from_bytes(bytes))
}

// ── Truths ("ect") ───────────────────────────────────────────────────────────

pub fn truth_encrypt(truth_key: &TruthKey, truth: &[u8]) -> Vec<u8> {
    encrypt(truth_key.as_bytes(), truth, SALT_TRUTH)
}

pub fn truth_decrypt(truth_key: &TruthKey, blob: &[u8]) -> Result<Vec<u8>, CryptoError> {
    decrypt(truth_key.as_bytes(), blob, SALT_TRUTH)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let m = b"recovery document bytes";
        let blob = encrypt(b"key material", m, "erd");
        assert_eq!(blob.len(), NONCE_BYTES + MAC_BYTES + m.len());
        assert_eq!(decrypt(b"key material", &blob, "erd").unwrap(), m);
    }

    #[test]
    fn wrong_key_fails_auth() {
        let blob = encrypt(b"key material", b"secret", "erd");
        assert_eq!(
            decrypt(b"other key", &blob, "erd"),
            Err(CryptoError::AuthFail)
        );
    }

    #[test]
    fn wrong_salt_fails_auth() {
        let blob = encrypt(b"key material", b"secret", "erd");
        assert_eq!(
            decrypt(b"key material", &blob, "eks"),
            Err(CryptoError::AuthFail)
        );
    }

    #[test]
    fn truncated_blob_is_malformed() {
        assert_eq!(
            decrypt(b"k", &[0u8; 39], "erd"),
            Err(CryptoError::Malformed(39))
        );
    }

    #[test]
    fn tampered_ciphertext_fails_auth() {
        let mut blob = encrypt(b"key material", b"secret", "erd");
        let last = blob.len() - 1;
        blob[last] ^= 0x01;
        assert_eq!(
            decrypt(b"key material", &blob, "erd"),
            Err(CryptoError::AuthFail)
        );
    }

    #[test]
    fn keyshare_blob_is_72_bytes() {
        let id = HashCode::from_bytes([7u8; 64]);
        let share = KeyShare::random();
        let enc = keyshare_encrypt(&share, &id, None);
        assert_eq!(enc.as_bytes().len(), 72);
        assert_eq!(keyshare_decrypt(&enc, &id, None).unwrap(), share);
    }

    #[test]
    fn keyshare_answer_salt_matters() {
        let id = HashCode::from_bytes([7u8; 64]);
        let share = KeyShare::random();
        let enc = keyshare_encrypt(&share, &id, Some("The-Answer"));
        assert!(keyshare_decrypt(&enc, &id, None).is_err());
        assert_eq!(
            keyshare_decrypt(&enc, &id, Some("The-Answer")).unwrap(),
            share
        );
    }

    #[test]
    fn truth_round_trip() {
        let key = TruthKey::random();
        let blob = truth_encrypt(&key, b"+49123456789");
        assert_eq!(truth_decrypt(&key, &blob).unwrap(), b"+49123456789");
        assert!(truth_decrypt(&TruthKey::random(), &blob).is_err());
    }
}

//! The two derivation primitives everything else builds on: a
//! memory-hard hash for password-grade inputs and HKDF-SHA512 for
//! everything already carrying full entropy.

use argon2::{Algorithm, Argon2, Params, Version};
use hkdf::Hkdf;
use sha2::Sha512;

use crate::error::CryptoError;

/// Argon2id cost parameters. High enough to make dictionary attacks on
/// identity data expensive, low enough for interactive recovery flows.
const POW_MEMORY_KIB: u32 = 8 * 1024;
const POW_ITERATIONS: u32 = 3;
const POW_LANES: u32 = 1;

/// Memory-hard hash of `data` with `salt`, 64 bytes out. Used where the
/// input may be guessable (identity attributes, question answers).
pub fn pow_hash(salt: &[u8], data: &[u8]) -> Result<[u8; 64], CryptoError> {
    let params = Params::new(POW_MEMORY_KIB, POW_ITERATIONS, POW_LANES, Some(64))
        .map_err(|e| CryptoError::Kdf(e.to_string()))?;
    let argon = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
    let mut out = [0u8; 64];
    argon
        .hash_password_into(data, salt, &mut out)
        .map_err(|e| CryptoError::Kdf(e.to_string()))?;
    Ok(out)
}

/// HKDF-SHA512: extract with `xts` as salt, expand with `info`.
pub fn kdf(out: &mut [u8], xts: Option<&[u8]>, ikm: &[u8], info: &[u8]) {
    let hk = Hkdf::<Sha512>::new(xts, ikm);
    hk.expand(info, out)
        .expect("HKDF output length is always well within bounds here");
}

/// Convenience: 32-byte HKDF output.
pub fn kdf32(xts: Option<&[u8]>, ikm: &[u8], info: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    kdf(&mut out, xts, ikm, info);
    out
}

/// Convenience: 64-byte HKDF output.
pub fn kdf64(xts: Option<&[u8]>, ikm: &[u8], info: &[u8]) -> [u8; 64] {
    let mut out = [0u8; 64];
    kdf(&mut out, xts, ikm, info);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pow_hash_is_deterministic_and_salt_sensitive() {
        let a = pow_hash(b"salt-aaaaaaaaaaa", b"input").unwrap();
        let b = pow_hash(b"salt-aaaaaaaaaaa", b"input").unwrap();
        let c = pow_hash(b"salt-bbbbbbbbbbb", b"input").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn kdf_separates_info_domains() {
        let a = kdf32(None, b"ikm", b"ver");
        let b = kdf32(None, b"ikm", b"eks");
        assert_ne!(a, b);
    }

    #[test]
    fn kdf_separates_xts() {
        let a = kdf32(Some(b"nonce-1"), b"ikm", b"ect");
        let b = kdf32(Some(b"nonce-2"), b"ikm", b"ect");
        assert_ne!(a, b);
    }
}

//! Policy keys and the core-secret fan-out: a random master key
//! encrypts the core secret once, and is itself encrypted once per
//! policy key, so any single satisfied policy recovers the secret and
//! policies can change without re-encrypting it.

use sha2::{Digest, Sha512};
use zeroize::Zeroizing;

use anastasis_core::{HashCode, KeyShare, MasterSalt, PolicyKey, QuestionSalt, TruthUuid};

use crate::encryption::{decrypt, encrypt, SALT_CORE_SECRET, SALT_MASTER_KEY};
use crate::error::CryptoError;
use crate::kdf::{kdf64, pow_hash};

/// Fresh random key share, one per truth in a policy.
pub fn keyshare_create() -> KeyShare {
    KeyShare::random()
}

/// Derive a policy key from the concatenated shares of that policy.
pub fn policy_key_derive(shares: &[KeyShare], salt: &MasterSalt) -> PolicyKey {
    let mut ikm = Zeroizing::new(Vec::with_capacity(shares.len() * 32));
    for share in shares {
        ikm.extend_from_slice(share.as_bytes());
    }
    PolicyKey::from_bytes(kdf64(
        Some(salt.as_bytes()),
        &ikm,
        b"anastasis-policy-key-derive",
    ))
}

/// Result of encrypting a core secret: one ciphertext for the secret,
/// one encrypted master key per policy.
pub struct CoreSecretEncryption {
    pub enc_core_secret: Vec<u8>,
    pub enc_master_keys: Vec<Vec<u8>>,
}

/// Encrypt `core_secret` under a fresh random master key and fan the
/// master key out to every policy key.
pub fn core_secret_encrypt(policy_keys: &[PolicyKey], core_secret: &[u8]) -> CoreSecretEncryption {
    let master_key = Zeroizing::new(*HashCode::random().as_bytes());
    let enc_core_secret = encrypt(master_key.as_ref(), core_secret, SALT_CORE_SECRET);
    let enc_master_keys = policy_keys
        .iter()
        .map(|pk| encrypt(pk.as_bytes(), master_key.as_ref(), SALT_MASTER_KEY))
        .collect();
    CoreSecretEncryption {
        enc_core_secret,
        enc_master_keys,
    }
}

/// Recover the core secret along one policy: decrypt that policy's
/// master-key ciphertext, then the core secret.
pub fn core_secret_recover(
    enc_master_key: &[u8],
    policy_key: &PolicyKey,
    enc_core_secret: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let master_key = Zeroizing::new(decrypt(
        policy_key.as_bytes(),
        enc_master_key,
        SALT_MASTER_KEY,
    )?);
    decrypt(&master_key, enc_core_secret, SALT_CORE_SECRET)
}

/// Hash a security-question answer for submission: memory-hard over the
/// client-side salt, then bound to the truth UUID so a precomputed
/// dictionary for one truth is useless against another.
pub fn secure_answer_hash(
    answer: &str,
    uuid: &TruthUuid,
    salt: &QuestionSalt,
) -> Result<HashCode, CryptoError> {
    let pow = Zeroizing::new(pow_hash(salt.as_bytes(), answer.as_bytes())?);
    Ok(HashCode::from_bytes(kdf64(
        Some(uuid.as_bytes()),
        pow.as_ref(),
        b"anastasis-secure-question-hashing",
    )))
}

/// Hash a numeric challenge code the way clients submit it: SHA-512 of
/// its decimal representation.
pub fn hash_answer(code: u64) -> HashCode {
    let digest = Sha512::digest(code.to_string().as_bytes());
    HashCode::from_bytes(digest.into())
}

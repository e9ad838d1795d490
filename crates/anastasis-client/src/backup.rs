//! Backup and recovery arithmetic on top of the crypto crate: split a
//! core secret across policies of key shares, and reassemble it from
//! any one satisfied policy.

use anastasis_crypto::{
    core_secret_encrypt, core_secret_recover, policy_key_derive, CryptoError,
};

use anastasis_core::{KeyShare, MasterSalt, PolicyKey};

/// The provider-independent result of splitting a core secret.
pub struct SecretSplit {
    pub enc_core_secret: Vec<u8>,

    /// One encrypted master key per policy, in policy order.
    pub enc_master_keys: Vec<Vec<u8>>,
}

/// Derive the policy keys for `policies` (each a list of that policy's
/// key shares) and encrypt `core_secret` so that any single policy
/// recovers it.
pub fn split_core_secret(
    policies: &[Vec<KeyShare>],
    master_salt: &MasterSalt,
    core_secret: &[u8],
) -> SecretSplit {
    let policy_keys: Vec<PolicyKey> = policies
        .iter()
        .map(|shares| policy_key_derive(shares, master_salt))
        .collect();
    let enc = core_secret_encrypt(&policy_keys, core_secret);
    SecretSplit {
        enc_core_secret: enc.enc_core_secret,
        enc_master_keys: enc.enc_master_keys,
    }
}

/// Recover the core secret along one policy, given that policy's
/// reassembled key shares.
pub fn recover_core_secret(
    shares: &[KeyShare],
    master_salt: &MasterSalt,
    enc_master_key: &[u8],
    enc_core_secret: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let policy_key = policy_key_derive(shares, master_salt);
    core_secret_recover(enc_master_key, &policy_key, enc_core_secret)
}

//! Account identity: from identity attributes to the user identifier,
//! and from the user identifier to the Ed25519 account keypair that
//! names the account at a provider.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use zeroize::Zeroizing;

use anastasis_core::constants::SIGNATURE_PURPOSE_POLICY_UPLOAD;
use anastasis_core::{AccountPublicKey, AccountSignature, HashCode, ProviderSalt};

use crate::error::CryptoError;
use crate::kdf::{kdf32, pow_hash};

/// Derive the user identifier from identity attributes and the provider
/// salt. Deterministic; distinct salts yield distinct identifiers for
/// the same attributes, which is what keeps accounts unlinkable across
/// providers.
///
/// The attributes are canonicalised as compact JSON with
/// lexicographically sorted keys before hashing, so key order in the
/// caller's value does not matter.
pub fn user_identifier_derive(
    id_data: &serde_json::Value,
    provider_salt: &ProviderSalt,
) -> Result<HashCode, CryptoError> {
    if !id_data.is_object() {
        return Err(CryptoError::BadIdentityData);
    }
    let canonical = canonical_json(id_data);
    let hash = pow_hash(provider_salt.as_bytes(), canonical.as_bytes())?;
    Ok(HashCode::from_bytes(hash))
}

/// Compact JSON with recursively sorted object keys.
fn canonical_json(v: &serde_json::Value) -> String {
    fn sort(v: &serde_json::Value) -> serde_json::Value {
        match v {
            serde_json::Value::Object(map) => {
                let mut sorted = serde_json::Map::new();
                let mut keys: Vec<_> = map.keys().collect();
                keys.sort();
                for k in keys {
                    sorted.insert(k.clone(), sort(&map[k]));
                }
                serde_json::Value::Object(sorted)
            }
            serde_json::Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(sort).collect())
            }
            other => other.clone(),
        }
    }
    sort(v).to_string()
}

/// The account keypair, deterministically derived from the user
/// identifier with context `"ver"`.
pub struct AccountKeyPair {
    signing: SigningKey,
}

impl AccountKeyPair {
    pub fn derive(id: &HashCode) -> Self {
        let seed = Zeroizing::new(kdf32(None, id.as_bytes(), b"ver"));
        Self {
            signing: SigningKey::from_bytes(&seed),
        }
    }

    pub fn public(&self) -> AccountPublicKey {
        AccountPublicKey::from_bytes(self.signing.verifying_key().to_bytes())
    }

    /// Sign a policy upload: the fixed purpose structure over the
    /// document hash.
    pub fn sign_policy_upload(&self, document_hash: &HashCode) -> AccountSignature {
        let msg = policy_upload_message(document_hash);
        AccountSignature::from_bytes(self.signing.sign(&msg).to_bytes())
    }
}

impl std::fmt::Debug for AccountKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AccountKeyPair({:?})", self.public())
    }
}

/// The signed structure: `uint32 size ‖ uint32 purpose ‖ 64-byte hash`,
/// both integers big-endian.
fn policy_upload_message(document_hash: &HashCode) -> [u8; 72] {
    let mut msg = [0u8; 72];
    msg[0..4].copy_from_slice(&72u32.to_be_bytes());
    msg[4..8].copy_from_slice(&SIGNATURE_PURPOSE_POLICY_UPLOAD.to_be_bytes());
    msg[8..72].copy_from_slice(document_hash.as_bytes());
    msg
}

/// Verify a policy-upload signature under the account public key.
pub fn verify_policy_upload(
    account: &AccountPublicKey,
    document_hash: &HashCode,
    signature: &AccountSignature,
) -> Result<(), CryptoError> {
    let vk = VerifyingKey::from_bytes(account.as_bytes())
        .map_err(|_| CryptoError::InvalidPublicKey)?;
    let sig = Signature::from_bytes(signature.as_bytes());
    vk.verify(&policy_upload_message(document_hash), &sig)
        .map_err(|_| CryptoError::InvalidSignature)
}

//! The recovery document: the client-side JSON structure that ties the
//! escrowed truths and the authentication policies together. Providers
//! never see it in plaintext; it travels encrypted under the user
//! identifier ("erd").

use serde::{Deserialize, Serialize};

use anastasis_core::{base32, HashCode, KeyShare, MasterSalt, QuestionSalt, TruthKey, TruthUuid};
use anastasis_crypto::{
    core_secret_encrypt, core_secret_recover, policy_key_derive, recovery_document_decrypt,
    recovery_document_encrypt, CryptoError,
};

#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    #[error("document encoding invalid: {0}")]
    Encoding(String),

    #[error("policy index {0} out of range")]
    UnknownPolicy(usize),

    #[error("policy references unknown truth index {0}")]
    UnknownTruth(usize),

    #[error("policy needs {expected} key shares, got {got}")]
    ShareCount { expected: usize, got: usize },

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// One escrowed truth, as the recovery side needs it: where it lives,
/// how to decrypt it at the provider, and how to answer it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TruthReference {
    pub uuid: TruthUuid,

    /// Method tag ("question", "sms", ...).
    pub method: String,

    /// Base URL of the provider escrowing this truth.
    pub provider_url: String,

    /// Key the provider needs to decrypt the truth.
    pub truth_key: TruthKey,

    /// Client-side salt for hashing a security-question answer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub question_salt: Option<QuestionSalt>,

    /// Human-readable challenge prompt (e.g. the security question).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

/// One policy: which truths must be satisfied, and the master-key
/// ciphertext their combined shares unlock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyEntry {
    /// Indices into [`RecoveryDocument::truths`], in share order.
    pub truth_indices: Vec<usize>,

    /// Salt for this policy's key derivation.
    pub master_salt: MasterSalt,

    /// Master key encrypted under this policy's key (base32).
    pub encrypted_master_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_name: Option<String>,

    /// Core secret encrypted under the random master key (base32).
    pub encrypted_core_secret: String,

    pub truths: Vec<TruthReference>,

    pub policies: Vec<PolicyEntry>,
}

impl RecoveryDocument {
    /// Build a document from the policies' share assignments. Each
    /// policy is a list of (truth index, that truth's key share); a
    /// fresh master salt is drawn per policy.
    pub fn build(
        secret_name: Option<String>,
        truths: Vec<TruthReference>,
        policies: &[Vec<(usize, KeyShare)>],
        core_secret: &[u8],
    ) -> Result<Self, DocumentError> {
        let mut policy_keys = Vec::with_capacity(policies.len());
        let mut salts = Vec::with_capacity(policies.len());
        for policy in policies {
            for (idx, _) in policy {
                if *idx >= truths.len() {
                    return Err(DocumentError::UnknownTruth(*idx));
                }
            }
            let shares: Vec<KeyShare> = policy.iter().map(|(_, s)| s.clone()).collect();
            let salt = MasterSalt::random();
            policy_keys.push(policy_key_derive(&shares, &salt));
            salts.push(salt);
        }
        let enc = core_secret_encrypt(&policy_keys, core_secret);
        let policies = policies
            .iter()
            .zip(salts)
            .zip(enc.enc_master_keys)
            .map(|((policy, master_salt), emk)| PolicyEntry {
                truth_indices: policy.iter().map(|(idx, _)| *idx).collect(),
                master_salt,
                encrypted_master_key: base32::encode(&emk),
            })
            .collect();
        Ok(Self {
            secret_name,
            encrypted_core_secret: base32::encode(&enc.enc_core_secret),
            truths,
            policies,
        })
    }

    /// Recover the core secret along policy `policy_index`, given the
    /// key shares obtained for that policy's truths (in policy order).
    pub fn recover(
        &self,
        policy_index: usize,
        shares: &[KeyShare],
    ) -> Result<Vec<u8>, DocumentError> {
        let policy = self
            .policies
            .get(policy_index)
            .ok_or(DocumentError::UnknownPolicy(policy_index))?;
        if shares.len() != policy.truth_indices.len() {
            return Err(DocumentError::ShareCount {
                expected: policy.truth_indices.len(),
                got: shares.len(),
            });
        }
        let policy_key = policy_key_derive(shares, &policy.master_salt);
        let emk = base32::decode(&policy.encrypted_master_key)
            .map_err(|e| DocumentError::Encoding(e.to_string()))?;
        let ecs = base32::decode(&self.encrypted_core_secret)
            .map_err(|e| DocumentError::Encoding(e.to_string()))?;
        Ok(core_secret_recover(&emk, &policy_key, &ecs)?)
    }

    /// Serialize and encrypt under the user identifier for upload.
    pub fn seal(&self, id: &HashCode) -> Result<Vec<u8>, DocumentError> {
        let json =
            serde_json::to_vec(self).map_err(|e| DocumentError::Encoding(e.to_string()))?;
        Ok(recovery_document_encrypt(id, &json))
    }

    /// Decrypt and parse a downloaded document.
    pub fn open(id: &HashCode, sealed: &[u8]) -> Result<Self, DocumentError> {
        let json = recovery_document_decrypt(id, sealed)?;
        serde_json::from_slice(&json).map_err(|e| DocumentError::Encoding(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anastasis_crypto::keyshare_create;

    fn truth_ref(method: &str) -> TruthReference {
        TruthReference {
            uuid: TruthUuid::random(),
            method: method.to_string(),
            provider_url: "http://localhost:9977".into(),
            truth_key: TruthKey::random(),
            question_salt: if method == "question" {
                Some(QuestionSalt::random())
            } else {
                None
            },
            instructions: Some("What is your pet's name?".into()),
        }
    }

    /// Build with three truths in three two-share policies; every
    /// policy recovers the secret after seal/open.
    #[test]
    fn build_seal_open_recover() {
        let truths = vec![truth_ref("question"), truth_ref("sms"), truth_ref("email")];
        let share_a = keyshare_create();
        let share_b = keyshare_create();
        let share_c = keyshare_create();
        let policies = vec![
            vec![(0, share_a.clone()), (1, share_b.clone())],
            vec![(1, share_b.clone()), (2, share_c.clone())],
            vec![(0, share_a.clone()), (2, share_c.clone())],
        ];
        let secret = b"core secret";
        let doc = RecoveryDocument::build(
            Some("wallet".into()),
            truths,
            &policies,
            secret,
        )
        .unwrap();

        let id = HashCode::from_bytes([9u8; 64]);
        let sealed = doc.seal(&id).unwrap();
        let opened = RecoveryDocument::open(&id, &sealed).unwrap();
        assert_eq!(opened.secret_name.as_deref(), Some("wallet"));
        assert_eq!(opened.policies.len(), 3);

        for (i, policy) in policies.iter().enumerate() {
            let shares: Vec<KeyShare> = policy.iter().map(|(_, s)| s.clone()).collect();
            assert_eq!(opened.recover(i, &shares).unwrap(), secret, "policy {i}");
        }

        // Wrong identity cannot open the document.
        let other = HashCode::from_bytes([10u8; 64]);
        assert!(matches!(
            RecoveryDocument::open(&other, &sealed),
            Err(DocumentError::Crypto(CryptoError::AuthFail))
        ));
    }

    #[test]
    fn recover_rejects_bad_inputs() {
        let truths = vec![truth_ref("question")];
        let share = keyshare_create();
        let doc = RecoveryDocument::build(
            None,
            truths,
            &[vec![(0, share.clone())]],
            b"secret",
        )
        .unwrap();

        assert!(matches!(
            doc.recover(5, &[share.clone()]),
            Err(DocumentError::UnknownPolicy(5))
        ));
        assert!(matches!(
            doc.recover(0, &[]),
            Err(DocumentError::ShareCount {
                expected: 1,
                got: 0
            })
        ));
        // Wrong share fails the master-key decryption.
        assert!(matches!(
            doc.recover(0, &[keyshare_create()]),
            Err(DocumentError::Crypto(CryptoError::AuthFail))
        ));
    }

    #[test]
    fn build_validates_truth_indices() {
        let truths = vec![truth_ref("question")];
        let result = RecoveryDocument::build(
            None,
            truths,
            &[vec![(3, keyshare_create())]],
            b"secret",
        );
        assert!(matches!(result, Err(DocumentError::UnknownTruth(3))));
    }
}

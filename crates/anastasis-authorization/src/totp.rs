//! TOTP challenge method (RFC 6238 with HMAC-SHA512, 30 s steps,
//! 8 digits). The user's authenticator already owns the shared secret,
//! so no code is generated or transmitted: the plugin checks the
//! submitted answer directly (`user_provided_code`).

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use sha2::Sha512;
use subtle::ConstantTimeEq;

use anastasis_core::constants::{
    CHALLENGE_CODE_VALIDITY_SECONDS, INITIAL_RETRY_COUNTER, MAX_QUESTION_FREQ_SECONDS,
};
use anastasis_core::{Amount, HashCode, Timestamp, TruthUuid};
use anastasis_crypto::hash_answer;

use crate::plugin::{
    AuthorizationPlugin, ChallengeProcess, MethodProperties, ProcessResult, Reply, StartError,
    Trigger, ValidationError,
};

const TOTP_STEP_SECONDS: i64 = 30;
const TOTP_DIGITS_MODULUS: u64 = 100_000_000;

pub struct TotpPlugin {
    properties: MethodProperties,
    allowed_drift_steps: u32,
}

impl TotpPlugin {
    pub fn new(cost: Amount, allowed_drift_steps: u32) -> Self {
        Self {
            properties: MethodProperties {
                cost,
                code_rotation_period: MAX_QUESTION_FREQ_SECONDS,
                code_validity_period: CHALLENGE_CODE_VALIDITY_SECONDS,
                retry_counter: INITIAL_RETRY_COUNTER,
                code_retransmission_frequency: 0,
                user_provided_code: true,
                payment_plugin_managed: false,
            },
            allowed_drift_steps,
        }
    }
}

/// One RFC 6238 value for the given counter.
fn totp_at(key: &[u8], counter: i64) -> u64 {
    let mut mac = <Hmac<Sha512> as Mac>::new_from_slice(key)
        .expect("HMAC accepts keys of any length");
    mac.update(&counter.to_be_bytes());
    let digest = mac.finalize().into_bytes();
    let offset = (digest[digest.len() - 1] & 0x0f) as usize;
    let binary = (u64::from(digest[offset] & 0x7f) << 24)
        | (u64::from(digest[offset + 1]) << 16)
        | (u64::from(digest[offset + 2]) << 8)
        | u64::from(digest[offset + 3]);
    binary % TOTP_DIGITS_MODULUS
}

impl AuthorizationPlugin for TotpPlugin {
    fn method(&self) -> &str {
        "totp"
    }

    fn properties(&self) -> &MethodProperties {
        &self.properties
    }

    fn validate(&self, _truth_mime: &str, decrypted_truth: &[u8]) -> Result<(), ValidationError> {
        if !(16..=64).contains(&decrypted_truth.len()) {
            return Err(ValidationError::Invalid(Reply::new(
                400,
                serde_json::json!({
                    "code": "TRUTH_INVALID",
                    "hint": "TOTP key must be 16 to 64 bytes",
                }),
            )));
        }
        Ok(())
    }

    fn start(
        &self,
        _trigger: Trigger,
        _uuid: &TruthUuid,
        _code: u64,
        decrypted_truth: &[u8],
        response: Option<&HashCode>,
    ) -> Result<Box<dyn ChallengeProcess>, StartError> {
        Ok(Box::new(TotpCheck {
            key: decrypted_truth.to_vec(),
            response: response.cloned(),
            allowed_drift_steps: self.allowed_drift_steps,
        }))
    }
}

struct TotpCheck {
    key: Vec<u8>,
    response: Option<HashCode>,
    allowed_drift_steps: u32,
}

#[async_trait]
impl ChallengeProcess for TotpCheck {
    async fn process(&mut self, _deadline: Timestamp) -> ProcessResult {
        let Some(response) = &self.response else {
            return ProcessResult::Failed(Reply::new(
                403,
                serde_json::json!({
                    "code": "CHALLENGE_RESPONSE_REQUIRED",
                    "method": "totp",
                    "hint": "submit the current TOTP value",
                }),
            ));
        };
        let now = chrono::Utc::now().timestamp();
        let counter = now / TOTP_STEP_SECONDS;
        let drift = i64::from(self.allowed_drift_steps);
        let mut matched = false;
        for c in (counter - drift)..=(counter + drift) {
            let expected = hash_answer(totp_at(&self.key, c));
            matched |= bool::from(expected.as_bytes().ct_eq(response.as_bytes()));
        }
        if matched {
            ProcessResult::Finished
        } else {
            ProcessResult::Failed(Reply::new(
                403,
                serde_json::json!({
                    "code": "CHALLENGE_FAILED",
                    "method": "totp",
                    "hint": "TOTP value did not match",
                }),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plugin() -> TotpPlugin {
        TotpPlugin::new("EUR:0".parse().unwrap(), 2)
    }

    #[test]
    fn validate_enforces_key_length() {
        let p = plugin();
        assert!(p.validate("", &[7u8; 32]).is_ok());
        assert!(p.validate("", &[7u8; 8]).is_err());
        assert!(p.validate("", &[7u8; 100]).is_err());
    }

    #[test]
    fn totp_is_deterministic_per_counter() {
        let key = [9u8; 32];
        assert_eq!(totp_at(&key, 1000), totp_at(&key, 1000));
        assert_ne!(totp_at(&key, 1000), totp_at(&key, 1001));
        assert!(totp_at(&key, 1000) < TOTP_DIGITS_MODULUS);
    }

    #[tokio::test]
    async fn current_value_finishes_and_wrong_value_fails() {
        let p = plugin();
        let key = [5u8; 32];
        let uuid = TruthUuid::from_bytes([0u8; 32]);
        let now = chrono::Utc::now().timestamp();
        let current = totp_at(&key, now / TOTP_STEP_SECONDS);

        let good = hash_answer(current);
        let mut state = p
            .start(Trigger::noop(), &uuid, 0, &key, Some(&good))
            .unwrap();
        assert!(matches!(state.process(0).await, ProcessResult::Finished));

        let bad = hash_answer(current.wrapping_add(1));
        let mut state = p
            .start(Trigger::noop(), &uuid, 0, &key, Some(&bad))
            .unwrap();
        assert!(matches!(state.process(0).await, ProcessResult::Failed(_)));
    }

    #[tokio::test]
    async fn missing_response_is_rejected() {
        let p = plugin();
        let mut state = p
            .start(
                Trigger::noop(),
                &TruthUuid::from_bytes([0u8; 32]),
                0,
                &[5u8; 32],
                None,
            )
            .unwrap();
        match state.process(0).await {
            ProcessResult::Failed(reply) => assert_eq!(reply.status, 403),
            other => panic!("{other:?}"),
        }
    }
}

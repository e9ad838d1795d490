//! File-based challenge method: the truth is a filesystem path and the
//! challenge code is written into that file. Mostly useful for tests
//! and for air-gapped setups where another process forwards the file.

use std::path::PathBuf;

use async_trait::async_trait;
use tracing::{info, warn};

use anastasis_core::{HashCode, Timestamp, TruthUuid};

use crate::plugin::{
    AuthorizationPlugin, ChallengeProcess, MethodProperties, ProcessResult, Reply, StartError,
    Trigger, ValidationError,
};

pub struct FilePlugin {
    properties: MethodProperties,
}

impl FilePlugin {
    pub fn new(cost: anastasis_core::Amount) -> Self {
        Self {
            properties: MethodProperties {
                cost,
                code_rotation_period: 15 * 60,
                code_validity_period: 3600,
                retry_counter: 3,
                code_retransmission_frequency: 60,
                user_provided_code: false,
                payment_plugin_managed: false,
            },
        }
    }
}

impl AuthorizationPlugin for FilePlugin {
    fn method(&self) -> &str {
        "file"
    }

    fn properties(&self) -> &MethodProperties {
        &self.properties
    }

    fn validate(&self, _truth_mime: &str, decrypted_truth: &[u8]) -> Result<(), ValidationError> {
        let path = std::str::from_utf8(decrypted_truth).map_err(|_| {
            ValidationError::Invalid(Reply::new(
                400,
                serde_json::json!({
                    "code": "TRUTH_INVALID",
                    "hint": "file path must be UTF-8",
                }),
            ))
        })?;
        if path.is_empty() {
            return Err(ValidationError::Invalid(Reply::new(
                400,
                serde_json::json!({
                    "code": "TRUTH_INVALID",
                    "hint": "file path must not be empty",
                }),
            )));
        }
        Ok(())
    }

    fn start(
        &self,
        _trigger: Trigger,
        uuid: &TruthUuid,
        code: u64,
        decrypted_truth: &[u8],
        _response: Option<&HashCode>,
    ) -> Result<Box<dyn ChallengeProcess>, StartError> {
        let path = std::str::from_utf8(decrypted_truth)
            .map_err(|_| StartError("file path is not UTF-8".into()))?;
        Ok(Box::new(FileChallenge {
            path: PathBuf::from(path),
            uuid: uuid.clone(),
            code,
        }))
    }
}

struct FileChallenge {
    path: PathBuf,
    uuid: TruthUuid,
    code: u64,
}

#[async_trait]
impl ChallengeProcess for FileChallenge {
    async fn process(&mut self, _deadline: Timestamp) -> ProcessResult {
        match tokio::fs::write(&self.path, format!("{}\n", self.code)).await {
            Ok(()) => {
                info!(uuid = %self.uuid.short(), path = %self.path.display(),
                      "challenge code written");
                ProcessResult::Success(Reply::new(
                    403,
                    serde_json::json!({
                        "code": "CHALLENGE_INSTRUCTIONS",
                        "method": "file",
                        "filename": self.path.display().to_string(),
                        "hint": "read the code from the file and submit its hash",
                    }),
                ))
            }
            Err(e) => {
                warn!(uuid = %self.uuid.short(), error = %e,
                      "failed to write challenge file");
                ProcessResult::Failed(Reply::new(
                    500,
                    serde_json::json!({
                        "code": "AUTHORIZATION_START_FAILED",
                        "hint": "could not deliver the challenge",
                    }),
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plugin() -> FilePlugin {
        FilePlugin::new("EUR:1".parse().unwrap())
    }

    #[test]
    fn validate_wants_utf8_nonempty_paths() {
        let p = plugin();
        assert!(p.validate("", b"/tmp/challenge").is_ok());
        assert!(matches!(
            p.validate("", b""),
            Err(ValidationError::Invalid(_))
        ));
        assert!(matches!(
            p.validate("", &[0xff, 0xfe]),
            Err(ValidationError::Invalid(_))
        ));
    }

    #[tokio::test]
    async fn process_writes_code_and_replies_with_instructions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("challenge");
        let p = plugin();
        let mut state = p
            .start(
                Trigger::noop(),
                &TruthUuid::from_bytes([1u8; 32]),
                12345678,
                path.to_str().unwrap().as_bytes(),
                None,
            )
            .unwrap();
        match state.process(0).await {
            ProcessResult::Success(reply) => {
                assert_eq!(reply.status, 403);
                assert_eq!(
                    reply.body["filename"].as_str().unwrap(),
                    path.to_str().unwrap()
                );
            }
            other => panic!("expected success, got {other:?}"),
        }
        let written = std::fs::read_to_string(&path).unwrap();
        assert_eq!(written.trim(), "12345678");
    }

    #[tokio::test]
    async fn unwritable_path_fails() {
        let p = plugin();
        let mut state = p
            .start(
                Trigger::noop(),
                &TruthUuid::from_bytes([1u8; 32]),
                1,
                b"/nonexistent-dir/challenge",
                None,
            )
            .unwrap();
        assert!(matches!(state.process(0).await, ProcessResult::Failed(_)));
    }
}

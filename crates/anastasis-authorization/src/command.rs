//! Challenge delivery through an external command ("email", "sms").
//! The configured shell command receives the destination in
//! `$ANASTASIS_DESTINATION` and the message on stdin; a zero exit
//! status counts as transmitted. Answer checking stays with the server
//! (code-based method).

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use anastasis_core::{Amount, HashCode, Timestamp, TruthUuid};

use crate::plugin::{
    AuthorizationPlugin, ChallengeProcess, MethodProperties, ProcessResult, Reply, StartError,
    Trigger, ValidationError,
};

/// Upper bound on a single delivery attempt.
const DELIVERY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

pub struct CommandPlugin {
    method: String,
    command: String,
    properties: MethodProperties,
}

impl CommandPlugin {
    pub fn new(method: &str, cost: Amount, command: String) -> Self {
        // SMS codes expire faster than e-mail: mail delivery is slow
        // and users read it late.
        let (rotation, validity, retransmission) = match method {
            "sms" => (10 * 60, 3600, 2 * 60),
            _ => (30 * 60, 24 * 3600, 5 * 60),
        };
        Self {
            method: method.to_string(),
            command,
            properties: MethodProperties {
                cost,
                code_rotation_period: rotation,
                code_validity_period: validity,
                retry_counter: 3,
                code_retransmission_frequency: retransmission,
                user_provided_code: false,
                payment_plugin_managed: false,
            },
        }
    }

    fn destination_valid(&self, destination: &str) -> bool {
        match self.method.as_str() {
            "sms" => {
                destination.starts_with('+')
                    && destination.len() > 4
                    && destination[1..].bytes().all(|b| b.is_ascii_digit())
            }
            _ => destination.contains('@') && !destination.contains(char::is_whitespace),
        }
    }
}

impl AuthorizationPlugin for CommandPlugin {
    fn method(&self) -> &str {
        &self.method
    }

    fn properties(&self) -> &MethodProperties {
        &self.properties
    }

    fn validate(&self, _truth_mime: &str, decrypted_truth: &[u8]) -> Result<(), ValidationError> {
        let destination = std::str::from_utf8(decrypted_truth).map_err(|_| {
            ValidationError::Invalid(Reply::new(
                400,
                serde_json::json!({
                    "code": "TRUTH_INVALID",
                    "hint": "destination must be UTF-8",
                }),
            ))
        })?;
        if !self.destination_valid(destination) {
            return Err(ValidationError::Invalid(Reply::new(
                400,
                serde_json::json!({
                    "code": "TRUTH_INVALID",
                    "hint": format!("not a usable {} destination", self.method),
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
        let destination = std::str::from_utf8(decrypted_truth)
            .map_err(|_| StartError("destination is not UTF-8".into()))?
            .to_string();
        Ok(Box::new(CommandDelivery {
            method: self.method.clone(),
            command: self.command.clone(),
            destination,
            uuid: uuid.clone(),
            code,
        }))
    }
}

struct CommandDelivery {
    method: String,
    command: String,
    destination: String,
    uuid: TruthUuid,
    code: u64,
}

impl CommandDelivery {
    fn instructions(&self) -> Reply {
        // Show only a hint of the destination, the caller may not be
        // its owner.
        let masked = mask_destination(&self.destination);
        Reply::new(
            403,
            serde_json::json!({
                "code": "CHALLENGE_INSTRUCTIONS",
                "method": self.method,
                "destination": masked,
                "hint": "a code was transmitted, submit its hash",
            }),
        )
    }

    fn failure(&self) -> Reply {
        Reply::new(
            500,
            serde_json::json!({
                "code": "AUTHORIZATION_START_FAILED",
                "method": self.method,
                "hint": "could not deliver the challenge",
            }),
        )
    }
}

/// Keep the first two and the domain/last two characters visible.
fn mask_destination(destination: &str) -> String {
    match destination.split_once('@') {
        Some((local, domain)) => {
            let head: String = local.chars().take(2).collect();
            format!("{head}…@{domain}")
        }
        None => {
            let tail: String = destination
                .chars()
                .rev()
                .take(2)
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .collect();
            format!("…{tail}")
        }
    }
}

#[async_trait]
impl ChallengeProcess for CommandDelivery {
    async fn process(&mut self, _deadline: Timestamp) -> ProcessResult {
        let message = format!(
            "Your Anastasis recovery code is: A-{:08}\n",
            self.code
        );
        let spawn = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .env("ANASTASIS_DESTINATION", &self.destination)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();
        let mut child = match spawn {
            Ok(child) => child,
            Err(e) => {
                warn!(method = %self.method, error = %e, "delivery command failed to spawn");
                return ProcessResult::Failed(self.failure());
            }
        };
        if let Some(mut stdin) = child.stdin.take() {
            if stdin.write_all(message.as_bytes()).await.is_err() {
                let _ = child.kill().await;
                return ProcessResult::Failed(self.failure());
            }
            // Close stdin so line-buffered consumers terminate.
            drop(stdin);
        }
        match tokio::time::timeout(DELIVERY_TIMEOUT, child.wait()).await {
            Ok(Ok(status)) if status.success() => {
                info!(uuid = %self.uuid.short(), method = %self.method,
                      "challenge transmitted");
                ProcessResult::Success(self.instructions())
            }
            Ok(Ok(status)) => {
                warn!(method = %self.method, code = ?status.code(),
                      "delivery command exited with failure");
                ProcessResult::Failed(self.failure())
            }
            Ok(Err(e)) => {
                warn!(method = %self.method, error = %e, "delivery command failed");
                ProcessResult::Failed(self.failure())
            }
            Err(_) => {
                let _ = child.kill().await;
                warn!(method = %self.method, "delivery command timed out");
                ProcessResult::Failed(self.failure())
            }
        }
    }
}

//! The authorization plugin contract: how the truth subsystem talks to
//! a challenge method. A plugin validates truth data at upload time,
//! starts transmission of a challenge, and drives a per-request process
//! toward either a sent challenge, a verified answer, or failure.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use anastasis_core::{Amount, HashCode, Timestamp, TruthUuid};

/// Static per-method parameters the server needs before any challenge
/// is started.
#[derive(Debug, Clone)]
pub struct MethodProperties {
    /// What one challenge costs.
    pub cost: Amount,

    /// Within this period the same code is re-issued instead of rotated.
    pub code_rotation_period: i64,

    /// How long an issued code stays answerable.
    pub code_validity_period: i64,

    /// Wrong/repeated attempts allowed per code.
    pub retry_counter: u32,

    /// Minimum delay between two transmissions of the same code; a
    /// request inside this window gets 208 Already Reported.
    pub code_retransmission_frequency: i64,

    /// True when the user already possesses the code-equivalent (e.g.
    /// TOTP): the service never generates a numeric challenge and the
    /// plugin checks the answer itself.
    pub user_provided_code: bool,

    /// True when the plugin owns the payment side entirely.
    pub payment_plugin_managed: bool,
}

/// A protocol-level reply a plugin wants sent to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub status: u16,
    pub body: serde_json::Value,
}

impl Reply {
    pub fn new(status: u16, body: serde_json::Value) -> Self {
        Self { status, body }
    }
}

/// Outcome of one `process` step.
#[derive(Debug)]
pub enum ProcessResult {
    /// Challenge transmitted; reply carries the user instructions.
    Success(Reply),

    /// Transmission or validation failed; reply tells the user.
    /// A paid challenge is refunded on this outcome.
    Failed(Reply),

    /// The plugin parked the request and will wake it via its
    /// [`Trigger`]; the server re-runs `process` after the wake-up.
    Suspended,

    /// Challenge transmitted but no reply could be produced; the server
    /// records the transmission and aborts the connection.
    SuccessReplyFailed,

    /// Failed and no reply could be produced.
    FailedReplyFailed,

    /// Authentication succeeded; the key share may be released.
    Finished,
}

/// Why a truth upload was rejected by `validate`.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    /// Truth data unusable for this method; reply explains it.
    #[error("truth data invalid for this method")]
    Invalid(Reply),

    /// Plugin-internal failure.
    #[error("validation failed internally: {0}")]
    Internal(String),
}

#[derive(Debug, thiserror::Error)]
#[error("failed to start authorization process: {0}")]
pub struct StartError(pub String);

/// Wakes the suspended request a plugin parked. The server installs the
/// concrete wake-up behind this handle.
#[derive(Clone)]
pub struct Trigger(Arc<dyn Fn() + Send + Sync>);

impl Trigger {
    pub fn new(wake: impl Fn() + Send + Sync + 'static) -> Self {
        Self(Arc::new(wake))
    }

    /// No-op trigger for contexts that cannot be woken (tests, direct
    /// validation).
    pub fn noop() -> Self {
        Self(Arc::new(|| {}))
    }

    pub fn fire(&self) {
        (self.0)();
    }
}

impl fmt::Debug for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Trigger")
    }
}

/// One in-flight challenge. Dropped state must release its resources.
#[async_trait]
pub trait ChallengeProcess: Send {
    /// Drive the challenge toward transmission or verification.
    /// `deadline` bounds any waiting the plugin does internally.
    async fn process(&mut self, deadline: Timestamp) -> ProcessResult;
}

/// A challenge method. Implementations are cached process-wide by the
/// registry and shared across requests.
pub trait AuthorizationPlugin: Send + Sync {
    fn method(&self) -> &str;

    fn properties(&self) -> &MethodProperties;

    /// Check truth data at upload time and on fresh challenge creation.
    fn validate(&self, truth_mime: &str, decrypted_truth: &[u8]) -> Result<(), ValidationError>;

    /// Begin a challenge: `code` is the generated challenge code (0 for
    /// `user_provided_code` methods), `response` the client's answer
    /// hash when one was supplied.
    fn start(
        &self,
        trigger: Trigger,
        uuid: &TruthUuid,
        code: u64,
        decrypted_truth: &[u8],
        response: Option<&HashCode>,
    ) -> Result<Box<dyn ChallengeProcess>, StartError>;
}

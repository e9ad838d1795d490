//! Provider configuration, deserialized from the JSON file the binary is
//! pointed at. Read once at startup and passed around immutably.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::amount::Amount;
use crate::constants::DEFAULT_ANNUAL_POLICY_UPLOAD_LIMIT;

/// Per-method authorization settings (`authorization-$METHOD` in the
/// original ini layout; a map entry per method here).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizationMethodConfig {
    pub enabled: bool,

    /// What one challenge via this method costs. Mandatory: a method
    /// without a cost fails closed when a truth references it.
    pub cost: Amount,

    /// Shell command that delivers the challenge for command-backed
    /// methods (email, sms). The destination arrives in
    /// `$ANASTASIS_DESTINATION`, the message on stdin.
    #[serde(default)]
    pub command: Option<String>,

    /// Allowed clock drift for TOTP, in 30-second steps.
    #[serde(default = "default_totp_drift")]
    pub totp_allowed_drift_steps: u32,
}

fn default_totp_drift() -> u32 {
    2
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MerchantBackendConfig {
    /// HTTP(S) base URL of the merchant backend.
    pub payment_backend_url: String,

    /// Optional `Authorization` header value for the backend.
    #[serde(default)]
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Address the HTTP server binds to.
    pub listen_addr: SocketAddr,

    /// Directory for the persistent database.
    pub data_dir: PathBuf,

    pub business_name: String,

    /// Currency every configured fee must share.
    pub currency: String,

    /// Per-year account fee; zero enables the free tier.
    pub annual_fee: Amount,

    /// Per-year-per-truth upload fee.
    pub truth_upload_fee: Amount,

    /// Cost of one security-question attempt batch.
    pub question_cost: Amount,

    /// Liability cap advertised in `/config`.
    pub insurance: Amount,

    /// Maximum policy/truth body size in megabytes.
    pub upload_limit_mb: u64,

    /// Distinct policy uploads included per paid year.
    #[serde(default = "default_upload_limit")]
    pub annual_policy_upload_limit: u32,

    /// Seed string the 16-byte provider salt is derived from.
    pub server_salt: String,

    /// Fulfillment URL advertised in merchant orders.
    pub fulfillment_url: String,

    pub merchant: MerchantBackendConfig,

    /// Terms-of-service document, served at `/terms`.
    #[serde(default)]
    pub terms_path: Option<PathBuf>,

    /// Privacy-policy document, served at `/privacy`.
    #[serde(default)]
    pub privacy_path: Option<PathBuf>,

    /// Authorization methods by name ("sms", "file", "totp", ...). The
    /// built-in "question" method is configured via `question_cost` and
    /// needs no entry here.
    #[serde(default)]
    pub authorization: BTreeMap<String, AuthorizationMethodConfig>,
}

fn default_upload_limit() -> u32 {
    DEFAULT_ANNUAL_POLICY_UPLOAD_LIMIT
}

impl ProviderConfig {
    /// Cross-field validation: currencies must agree and the backend URL
    /// must be an HTTP(S) URL with a host, since it is spliced into
    /// `taler://pay/` URIs.
    pub fn validate(&self) -> Result<(), String> {
        for (what, amount) in [
            ("annual_fee", &self.annual_fee),
            ("truth_upload_fee", &self.truth_upload_fee),
            ("question_cost", &self.question_cost),
            ("insurance", &self.insurance),
        ] {
            if amount.currency() != self.currency {
                return Err(format!(
                    "{what} is in {} but the provider currency is {}",
                    amount.currency(),
                    self.currency
                ));
            }
        }
        for (method, mc) in &self.authorization {
            if mc.cost.currency() != self.currency {
                return Err(format!(
                    "authorization method {method} cost is in {}, expected {}",
                    mc.cost.currency(),
                    self.currency
                ));
            }
        }
        let url = &self.merchant.payment_backend_url;
        let rest = url
            .strip_prefix("https://")
            .or_else(|| url.strip_prefix("http://"))
            .ok_or_else(|| "payment_backend_url must be an HTTP(S) URL".to_string())?;
        if rest.trim_end_matches('/').is_empty() {
            return Err("payment_backend_url must have a host".to_string());
        }
        if self.upload_limit_mb == 0 {
            return Err("upload_limit_mb must be positive".to_string());
        }
        Ok(())
    }
}

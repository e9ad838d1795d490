//! The immutable service context handlers run against: configuration,
//! database, plugin registry, merchant client, derived provider salt,
//! and the suspension/refund machinery.

use std::sync::Arc;

use tracing::info;

use anastasis_authorization::PluginRegistry;
use anastasis_core::{ProviderConfig, ProviderSalt, Timestamp};
use anastasis_crypto::kdf::kdf;
use anastasis_db::AnastasisDb;
use anastasis_merchant::MerchantClient;

use crate::refund::RefundWorker;
use crate::wait::WaitRegistry;

#[derive(Debug, thiserror::Error)]
pub enum ContextInitError {
    #[error("configuration invalid: {0}")]
    Config(String),

    #[error("database failed to open: {0}")]
    Database(String),

    #[error("terms document unreadable: {0}")]
    Document(String),
}

/// A static legal document served with an ETag.
pub struct StaticDocument {
    pub bytes: Vec<u8>,
    pub etag: String,
    pub content_type: &'static str,
}

impl StaticDocument {
    fn load(path: &std::path::Path) -> Result<Self, ContextInitError> {
        let bytes = std::fs::read(path)
            .map_err(|e| ContextInitError::Document(format!("{}: {e}", path.display())))?;
        use sha2::Digest;
        let etag = anastasis_core::base32::encode(&sha2::Sha512::digest(&bytes));
        let content_type = match path.extension().and_then(|e| e.to_str()) {
            Some("html") | Some("htm") => "text/html",
            Some("md") => "text/markdown",
            Some("json") => "application/json",
            _ => "text/plain",
        };
        Ok(Self {
            bytes,
            etag,
            content_type,
        })
    }
}

pub struct ServiceContext {
    pub cfg: ProviderConfig,
    pub db: Arc<AnastasisDb>,
    pub registry: PluginRegistry,
    pub merchant: MerchantClient,
    pub provider_salt: ProviderSalt,
    pub waits: Arc<WaitRegistry>,
    pub refunds: RefundWorker,
    pub terms: Option<StaticDocument>,
    pub privacy: Option<StaticDocument>,
}

pub type SharedContext = Arc<ServiceContext>;

impl ServiceContext {
    pub fn new(cfg: ProviderConfig) -> Result<Self, ContextInitError> {
        cfg.validate().map_err(ContextInitError::Config)?;
        let db = AnastasisDb::open(&cfg.data_dir)
            .map_err(|e| ContextInitError::Database(e.to_string()))?;
        let merchant = MerchantClient::new(
            &cfg.merchant.payment_backend_url,
            cfg.merchant.api_key.clone(),
        );
        let registry = PluginRegistry::new(cfg.authorization.clone());
        let provider_salt = derive_provider_salt(&cfg.server_salt);
        let terms = cfg.terms_path.as_deref().map(StaticDocument::load).transpose()?;
        let privacy = cfg
            .privacy_path
            .as_deref()
            .map(StaticDocument::load)
            .transpose()?;
        info!(business = %cfg.business_name, currency = %cfg.currency,
              "service context initialised");
        Ok(Self {
            cfg,
            db: Arc::new(db),
            registry,
            merchant,
            provider_salt,
            waits: WaitRegistry::new(),
            refunds: RefundWorker::new(),
            terms,
            privacy,
        })
    }

    pub fn now(&self) -> Timestamp {
        chrono::Utc::now().timestamp()
    }

    /// Resume everything that is parked and stop background work.
    pub fn shutdown(&self) {
        self.waits.shutdown();
        self.refunds.shutdown();
        if let Err(e) = self.db.flush() {
            tracing::error!(error = %e, "flushing database on shutdown failed");
        }
    }
}

/// The advertised 16-byte provider salt, derived once from the
/// configured seed string.
fn derive_provider_salt(seed: &str) -> ProviderSalt {
    let mut out = [0u8; 16];
    kdf(
        &mut out,
        Some(b"anastasis-server-salt"),
        seed.as_bytes(),
        b"",
    );
    ProviderSalt::from_bytes(out)
}

//! On-disk record types (bincode-encoded values of the sled trees).

use serde::{Deserialize, Serialize};

use anastasis_core::{
    AccountSignature, Amount, EncryptedKeyShare, HashCode, PaymentSecret, Timestamp,
};

/// One account row. Created by the first recorded payment; carries the
/// monotonically increasing policy version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountRecord {
    pub paid_until: Timestamp,

    /// Version of the newest stored recovery document; 0 when none.
    pub latest_version: u32,

    /// Hash of the newest stored recovery document.
    pub current_hash: Option<HashCode>,
}

/// One stored recovery document version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryDocumentRecord {
    pub account_sig: AccountSignature,
    pub document_hash: HashCode,
    pub document: Vec<u8>,
    pub version: u32,
}

/// Payment backing policy storage. The post counter lives here: each
/// paid period includes a bounded number of distinct uploads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyPaymentRecord {
    pub account: [u8; 32],
    pub amount: Amount,
    pub paid: bool,

    /// Remaining distinct uploads covered by this payment.
    pub post_counter: u32,

    /// Whether this payment already extended the account lifetime;
    /// guarantees a payment secret extends it at most once.
    pub lifetime_granted: bool,

    pub created_at: Timestamp,
}

/// One truth object. The tuple is immutable after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TruthRecord {
    pub key_share_data: EncryptedKeyShare,
    pub method: String,
    pub truth_mime: String,
    pub encrypted_truth: Vec<u8>,
    pub paid_until: Timestamp,
}

/// Payment state for one truth upload (keyed by truth UUID; the order
/// id is the base32 UUID).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TruthUploadPaymentRecord {
    pub amount: Amount,
    pub paid_until: Timestamp,
}

/// The at-most-one live challenge code per truth.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChallengeRecord {
    pub code: u64,
    pub created_at: Timestamp,

    /// Attempts left before the rate limiter trips.
    pub retry_counter_left: u32,

    /// Within this period after creation the same code is reused.
    pub rotation_period: i64,

    /// Code lifetime; after it the code is dead and collectable.
    pub validity_period: i64,

    /// Set once authentication for this code succeeded.
    pub satisfied: bool,

    /// When the challenge was last transmitted to the user, if ever.
    pub last_sent_at: Option<Timestamp>,
}

/// Payment state for one (truth, payment secret) challenge session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChallengePaymentRecord {
    pub payment_secret: PaymentSecret,
    pub amount: Amount,
    pub paid: bool,
    pub refunded: bool,
    pub created_at: Timestamp,
}

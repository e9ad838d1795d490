//! Result vocabulary of the storage contract. Callers branch on these
//! tags; no operation reports protocol-level outcomes through errors.

use thiserror::Error;

use anastasis_core::{HashCode, Timestamp};

#[derive(Debug, Error)]
pub enum DbError {
    /// Permanent failure; surfaces as HTTP 500.
    #[error("database hard error: {0}")]
    Hard(String),

    /// Transient failure; the caller may retry a bounded number of times.
    #[error("database soft error: {0}")]
    Soft(String),
}

impl From<sled::Error> for DbError {
    fn from(e: sled::Error) -> Self {
        DbError::Hard(e.to_string())
    }
}

impl From<bincode::Error> for DbError {
    fn from(e: bincode::Error) -> Self {
        DbError::Hard(format!("record encoding: {e}"))
    }
}

/// Outcome of `lookup_account`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccountStatus {
    /// No such account: nothing was ever paid for this public key.
    PaymentRequired,

    /// Account exists but holds no recovery document yet.
    Empty { paid_until: Timestamp },

    /// Account exists and has a current document.
    ValidHashReturned {
        paid_until: Timestamp,
        hash: HashCode,
        version: u32,
    },
}

/// Outcome of `store_recovery_document`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreStatus {
    /// Stored under this fresh version.
    Success { version: u32 },

    /// Identical bytes already stored; no version consumed.
    NoChange { version: u32 },

    /// The payment's upload quota is used up.
    StoreLimitExceeded,

    /// No (paid) account or payment backs this upload.
    PaymentRequired,
}

/// Outcome of `store_truth`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TruthStoreStatus {
    Success,

    /// Same UUID, identical content: idempotent re-upload.
    Idempotent,

    /// Same UUID, different content.
    Conflict,
}

/// Outcome of `get_key_share` / `get_escrow_challenge`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TruthLookup<T> {
    Found(T),

    /// UUID never seen.
    Unknown,

    /// Truth existed but its paid lifetime lapsed.
    Expired,
}

/// Outcome of `create_challenge_code`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChallengeCreation {
    /// Fresh code issued.
    Fresh { code: u64 },

    /// Existing code inside its rotation period returned again; one
    /// retry was consumed.
    Cached {
        code: u64,
        last_sent_at: Option<Timestamp>,
    },

    /// Retry counter exhausted: rate limited.
    RateLimited,
}

/// Outcome of `verify_challenge_code`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodeStatus {
    /// Answer does not match the live code.
    Mismatch,

    /// Answer matches; `satisfied` reports the post-verification state
    /// (true unless satisfaction is managed externally by a plugin).
    ValidCodeStored { code: u64, satisfied: bool },

    /// No live (unexpired) code for this truth.
    NoResults,
}

//! ─── Anastasis protocol constants ───────────────────────────────────────────

// ── Storage lifetimes ────────────────────────────────────────────────────────

/// Longest storage period a client can buy in one go (years).
pub const MAX_YEARS_STORAGE: u32 = 5;

/// Default number of distinct policy uploads included per paid year.
pub const DEFAULT_ANNUAL_POLICY_UPLOAD_LIMIT: u32 = 64;

/// A "year" when charging: what clients compute with (365 days).
pub const SECONDS_PER_YEAR: i64 = 365 * 24 * 3600;

/// A "year" when granting lifetime: 52 weeks. Together with
/// [`LIFETIME_GRACE`] this makes the server's grant slightly longer than
/// the client's 365-day expectation, so a payment made "for one year"
/// still covers a full client-side year after the seconds spent paying.
pub const GRANTED_YEAR_SECONDS: i64 = 52 * 7 * 24 * 3600;

/// Grace added once per lifetime grant (one week).
pub const LIFETIME_GRACE_SECONDS: i64 = 7 * 24 * 3600;

/// How long an account and its documents survive past `paid_until`
/// before garbage collection removes them.
pub const ACCOUNT_RETENTION_GRACE_SECONDS: i64 = 30 * 24 * 3600;

// ── Challenges ───────────────────────────────────────────────────────────────

/// Maximum frequency at which clients may attempt to answer security
/// questions (seconds); doubles as the question-truth code rotation period.
pub const MAX_QUESTION_FREQ_SECONDS: i64 = 30;

/// Retries allowed per challenge code.
pub const INITIAL_RETRY_COUNTER: u32 = 3;

/// How long a generated challenge code stays valid (seconds).
pub const CHALLENGE_CODE_VALIDITY_SECONDS: i64 = 3600;

/// Challenge codes are 8 decimal digits so users can transcribe them.
pub const CHALLENGE_CODE_MODULUS: u64 = 100_000_000;

// ── Payment timing ───────────────────────────────────────────────────────────

/// How long we hold a connection awaiting payment before giving up.
pub const CHECK_PAYMENT_TIMEOUT_SECONDS: i64 = 30 * 60;

/// How long the wallet may auto-refund an unpaid challenge order.
pub const AUTO_REFUND_TIMEOUT_SECONDS: i64 = 2 * 60;

/// Pay deadline offered on challenge orders.
pub const CHALLENGE_OFFER_LIFETIME_SECONDS: i64 = 3600;

/// Default long-poll when the client supplies no `timeout_ms`.
pub const DEFAULT_LONG_POLL_SECONDS: i64 = 1;

// ── Signatures ───────────────────────────────────────────────────────────────

/// Purpose tag of the policy-upload signature
/// (`uint32 size ‖ uint32 purpose ‖ 64-byte hash`).
pub const SIGNATURE_PURPOSE_POLICY_UPLOAD: u32 = 1400;

// ── Exit codes (LSB) ─────────────────────────────────────────────────────────

pub const EXIT_OK: i32 = 0;
pub const EXIT_FAILURE: i32 = 1;
pub const EXIT_BAD_ARGUMENTS: i32 = 2;
pub const EXIT_NOT_IMPLEMENTED: i32 = 3;
pub const EXIT_NO_PERMISSION: i32 = 4;
pub const EXIT_NOT_INSTALLED: i32 = 5;
pub const EXIT_NOT_CONFIGURED: i32 = 6;
pub const EXIT_NOT_RUNNING: i32 = 7;
pub const EXIT_TEST_SKIP: i32 = 77;

// ── Protocol ─────────────────────────────────────────────────────────────────

/// Version triple advertised by `GET /config`.
pub const PROTOCOL_VERSION: &str = "0:0:0";

/// Where `GET /agpl` redirects to.
pub const SOURCE_URL: &str = "https://git.taler.net/anastasis.git/";

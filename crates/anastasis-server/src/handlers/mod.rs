//! HTTP handlers, one module per surface.

pub mod meta;
pub mod policy;
pub mod truth;

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use axum::http::{HeaderMap, HeaderName};

use anastasis_core::constants::DEFAULT_LONG_POLL_SECONDS;
use anastasis_core::Timestamp;

use crate::error::ApiError;

// Protocol headers (lowercase: axum normalizes header names).
pub const HEADER_POLICY_SIGNATURE: HeaderName =
    HeaderName::from_static("anastasis-policy-signature");
pub const HEADER_POLICY_VERSION: HeaderName = HeaderName::from_static("anastasis-version");
pub const HEADER_POLICY_EXPIRATION: HeaderName =
    HeaderName::from_static("anastasis-policy-expiration");
pub const HEADER_TRUTH_DECRYPTION_KEY: HeaderName =
    HeaderName::from_static("anastasis-truth-decryption-key");
pub const HEADER_PAYMENT_IDENTIFIER: HeaderName =
    HeaderName::from_static("anastasis-payment-identifier");

/// Parse an optional header whose value is a base32 wire type.
pub fn parse_header<T: FromStr>(
    headers: &HeaderMap,
    name: &HeaderName,
) -> Result<Option<T>, ApiError> {
    let Some(raw) = headers.get(name) else {
        return Ok(None);
    };
    let s = raw
        .to_str()
        .map_err(|_| ApiError::bad_request("PARAMETER_MALFORMED", name.as_str()))?;
    s.parse::<T>()
        .map(Some)
        .map_err(|_| ApiError::bad_request("PARAMETER_MALFORMED", name.as_str()))
}

/// Parse the optional `timeout_ms` query parameter into the request
/// deadline.
pub fn request_deadline(
    params: &HashMap<String, String>,
    now: Timestamp,
    default: Duration,
) -> Result<Timestamp, ApiError> {
    match params.get("timeout_ms") {
        None => Ok(now + default.as_secs() as Timestamp),
        Some(raw) => {
            let ms: u64 = raw.parse().map_err(|_| {
                ApiError::bad_request("PARAMETER_MALFORMED", "timeout_ms (must be non-negative)")
            })?;
            Ok(now + (ms / 1000).max(DEFAULT_LONG_POLL_SECONDS as u64) as Timestamp)
        }
    }
}

/// Remaining wait budget until `deadline`.
pub fn remaining(deadline: Timestamp, now: Timestamp) -> Duration {
    Duration::from_secs((deadline - now).max(0) as u64)
}

/// Long-poll an order's payment status. While waiting the request is
/// parked in the wait registry so shutdown can resume it; the merchant
/// future is dropped (cancelled) in that case.
pub async fn poll_order_status(
    ctx: &crate::context::SharedContext,
    order_id: &str,
    deadline: Timestamp,
) -> Result<anastasis_merchant::OrderStatus, ApiError> {
    let now = ctx.now();
    let budget = remaining(deadline, now);
    let waiter = ctx.waits.new_waiter();
    let guard_deadline =
        tokio::time::Instant::now() + budget + Duration::from_secs(30);
    tokio::select! {
        status = ctx.merchant.get_order_status(order_id, budget) => Ok(status?),
        reason = waiter.wait_until(guard_deadline) => match reason {
            crate::wait::WakeReason::Shutdown => Err(ApiError::new(
                axum::http::StatusCode::SERVICE_UNAVAILABLE,
                "SHUTDOWN",
                "service is shutting down",
            )),
            _ => Err(ApiError::from(anastasis_merchant::MerchantError::Timeout)),
        },
    }
}

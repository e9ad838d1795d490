//! `/policy/$ACCOUNT_PUB`: recovery-document download and the
//! payment-gated, streamed upload.

use std::collections::HashMap;

use axum::extract::{Path, Query, Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::StreamExt;
use sha2::{Digest, Sha512};
use tracing::{debug, info, warn};

use anastasis_core::constants::{CHECK_PAYMENT_TIMEOUT_SECONDS, MAX_YEARS_STORAGE};
use anastasis_core::{AccountPublicKey, AccountSignature, HashCode, PaymentSecret, Timestamp};
use anastasis_crypto::verify_policy_upload;
use anastasis_db::{retry_soft, AccountStatus, StoreStatus};
use anastasis_merchant::{CreateOrderRequest, OrderStatus};

use crate::context::SharedContext;
use crate::error::ApiError;
use crate::handlers::{
    parse_header, poll_order_status, request_deadline, HEADER_PAYMENT_IDENTIFIER,
    HEADER_POLICY_EXPIRATION, HEADER_POLICY_SIGNATURE, HEADER_POLICY_VERSION,
};
use crate::lifetime::{desired_until, grant_seconds, years_to_pay};

fn parse_account(account: &str) -> Result<AccountPublicKey, ApiError> {
    account
        .parse()
        .map_err(|_| ApiError::bad_request("PARAMETER_MALFORMED", "account public key"))
}

// ── GET ──────────────────────────────────────────────────────────────────────

pub async fn policy_get(
    State(ctx): State<SharedContext>,
    Path(account): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let account = parse_account(&account)?;
    let version: Option<u32> = match params.get("version") {
        None => None,
        Some(raw) => Some(
            raw.parse()
                .map_err(|_| ApiError::bad_request("PARAMETER_MALFORMED", "version"))?,
        ),
    };

    match ctx.db.lookup_account(&account)? {
        AccountStatus::PaymentRequired => {
            return Err(ApiError::not_found("ACCOUNT_UNKNOWN"));
        }
        AccountStatus::Empty { .. } => {
            return Ok(StatusCode::NO_CONTENT.into_response());
        }
        AccountStatus::ValidHashReturned { hash, .. } => {
            if let Some(inm) = headers.get(header::IF_NONE_MATCH) {
                let inm = inm
                    .to_str()
                    .ok()
                    .and_then(|s| s.trim_matches('"').parse::<HashCode>().ok())
                    .ok_or_else(|| {
                        ApiError::bad_request(
                            "POLICY_BAD_IF_NONE_MATCH",
                            "ETag must be a base32-encoded SHA-512 hash",
                        )
                    })?;
                if inm == hash {
                    return Ok(StatusCode::NOT_MODIFIED.into_response());
                }
            }
        }
    }

    let doc = match version {
        Some(v) => ctx.db.get_recovery_document(&account, v)?,
        None => ctx.db.get_latest_recovery_document(&account)?,
    };
    let Some(doc) = doc else {
        return Err(ApiError::not_found("POLICY_NOT_FOUND"));
    };
    debug!(account = %account, version = doc.version, "returning recovery document");
    Ok((
        StatusCode::OK,
        [
            (HEADER_POLICY_SIGNATURE, doc.account_sig.to_string()),
            (HEADER_POLICY_VERSION, doc.version.to_string()),
            (header::ETAG, doc.document_hash.to_string()),
        ],
        doc.document,
    )
        .into_response())
}

// ── POST ─────────────────────────────────────────────────────────────────────

struct UploadRequest {
    account: AccountPublicKey,
    signature: AccountSignature,
    promised_hash: HashCode,
    payment: Option<PaymentSecret>,
    content_length: u64,
    deadline: Timestamp,
    /// Requested coverage end, from `storage_duration` years.
    end_date: Timestamp,
}

fn parse_upload_request(
    ctx: &SharedContext,
    account: AccountPublicKey,
    params: &HashMap<String, String>,
    headers: &HeaderMap,
    now: Timestamp,
) -> Result<UploadRequest, ApiError> {
    let content_length: u64 = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::bad_request("MISSING_CONTENT_LENGTH", "Content-Length"))?
        .parse()
        .map_err(|_| ApiError::bad_request("MALFORMED_CONTENT_LENGTH", "Content-Length"))?;
    if content_length / 1024 / 1024 >= ctx.cfg.upload_limit_mb {
        return Err(ApiError::payload_too_large("Content-Length not acceptable"));
    }

    let signature: AccountSignature = parse_header(headers, &HEADER_POLICY_SIGNATURE)?
        .ok_or_else(|| {
            ApiError::bad_request(
                "POLICY_BAD_SIGNATURE",
                "Anastasis-Policy-Signature header must be a base32-encoded EdDSA signature",
            )
        })?;
    let promised_hash: HashCode = headers
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim_matches('"').parse().ok())
        .ok_or_else(|| {
            ApiError::bad_request(
                "POLICY_BAD_IF_MATCH",
                "If-None-Match header must be a base32-encoded SHA-512 hash",
            )
        })?;
    let payment: Option<PaymentSecret> = parse_header(headers, &HEADER_PAYMENT_IDENTIFIER)?;

    let years: u32 = match params.get("storage_duration") {
        None => 0,
        Some(raw) => raw.parse().map_err(|_| {
            ApiError::bad_request("PARAMETER_MALFORMED", "storage_duration (must be years)")
        })?,
    };
    let deadline = request_deadline(
        params,
        now,
        std::time::Duration::from_secs(CHECK_PAYMENT_TIMEOUT_SECONDS as u64),
    )?;

    verify_policy_upload(&account, &promised_hash, &signature)
        .map_err(|_| ApiError::forbidden("POLICY_BAD_SIGNATURE", "signature invalid"))?;

    Ok(UploadRequest {
        account,
        signature,
        promised_hash,
        payment,
        content_length,
        deadline,
        end_date: desired_until(now, years),
    })
}

/// Create a policy-storage order for `years` and answer 402.
async fn request_policy_payment(
    ctx: &SharedContext,
    req: &UploadRequest,
    payment: &PaymentSecret,
    years: u32,
) -> Result<ApiError, ApiError> {
    let years = years.max(1);
    let fee = ctx
        .cfg
        .annual_fee
        .checked_mul(years)
        .map_err(|_| ApiError::bad_request("PARAMETER_MALFORMED", "storage_duration"))?;
    let order_id = payment.to_string();
    info!(account = %req.account, order = %order_id, years,
          "policy upload requires payment, creating order");
    ctx.merchant
        .create_order(&CreateOrderRequest {
            amount: fee,
            summary: "Anastasis policy storage fee".into(),
            order_id: order_id.clone(),
            auto_refund: None,
            pay_deadline: None,
            fulfillment_url: Some(ctx.cfg.fulfillment_url.clone()),
        })
        .await?;
    ctx.db.record_recdoc_payment(
        &req.account,
        ctx.cfg.annual_policy_upload_limit,
        payment,
        &ctx.cfg.annual_fee,
        ctx.now(),
    )?;
    Ok(ApiError::payment_required(&ctx.merchant.pay_uri(&order_id)))
}

/// Long-poll the client's pending order; on payment, grant lifetime.
/// Returns `Ok(())` when paid, `Err(reply)` otherwise.
async fn await_policy_payment(
    ctx: &SharedContext,
    req: &UploadRequest,
    payment: &PaymentSecret,
) -> Result<(), ApiError> {
    let order_id = payment.to_string();
    match poll_order_status(ctx, &order_id, req.deadline).await? {
        OrderStatus::Paid {
            contract_amount,
            deposit_total,
        } => {
            let paid_amount = contract_amount.or(deposit_total);
            let years = paid_amount
                .and_then(|a| a.divide2(&ctx.cfg.annual_fee).ok())
                .filter(|y| *y > 0)
                .unwrap_or(1);
            let now = ctx.now();
            // The order may predate this process; make sure the payment
            // row exists before granting.
            if ctx.db.check_payment_identifier(payment)?.is_none() {
                ctx.db.record_recdoc_payment(
                    &req.account,
                    ctx.cfg.annual_policy_upload_limit,
                    payment,
                    &ctx.cfg.annual_fee,
                    now,
                )?;
            }
            let paid_until =
                ctx.db
                    .increment_lifetime(&req.account, payment, grant_seconds(years), now)?;
            info!(account = %req.account, order = %order_id, years,
                  paid_until, "policy payment confirmed");
            Ok(())
        }
        OrderStatus::Unpaid | OrderStatus::Claimed => {
            debug!(order = %order_id, "order remains unpaid");
            Err(ApiError::payment_required(&ctx.merchant.pay_uri(&order_id)))
        }
        OrderStatus::NotFound => {
            // We promised this order earlier; recreate it.
            let years = years_to_pay(req.end_date, 0, ctx.now());
            Err(request_policy_payment(ctx, req, payment, years).await?)
        }
    }
}

/// Settle the payment phase: afterwards the account exists, is paid,
/// and `payment` names a paid payment row.
async fn ensure_paid(
    ctx: &SharedContext,
    req: &mut UploadRequest,
) -> Result<PaymentSecret, ApiError> {
    if let Some(payment) = req.payment.clone() {
        match ctx.db.check_payment_identifier(&payment)? {
            Some((true, true)) => return Ok(payment),
            Some((_, false)) => {
                // Upload quota of that payment is exhausted; force a
                // fresh payment.
                debug!(account = %req.account, "payment quota exhausted, fresh payment");
                req.payment = None;
            }
            Some((false, true)) | None => {
                if ctx.cfg.annual_fee.is_zero() {
                    // Stale identifier on the free tier; ignore it.
                    req.payment = None;
                } else {
                    await_policy_payment(ctx, req, &payment).await?;
                    return Ok(payment);
                }
            }
        }
    }

    let payment = PaymentSecret::random();
    if ctx.cfg.annual_fee.is_zero() {
        // Free tier: synthesize a paid payment covering the maximum.
        let now = ctx.now();
        ctx.db.record_recdoc_payment(
            &req.account,
            ctx.cfg.annual_policy_upload_limit,
            &payment,
            &ctx.cfg.annual_fee,
            now,
        )?;
        ctx.db.update_lifetime(
            &req.account,
            &payment,
            desired_until(now, MAX_YEARS_STORAGE),
        )?;
        debug!(account = %req.account, "free tier, upload allowed without payment");
        return Ok(payment);
    }
    let years = years_to_pay(req.end_date, 0, ctx.now());
    Err(request_policy_payment(ctx, req, &payment, years).await?)
}

pub async fn policy_post(
    State(ctx): State<SharedContext>,
    Path(account): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    request: Request,
) -> Result<Response, ApiError> {
    let account = parse_account(&account)?;
    let now = ctx.now();
    let mut req = parse_upload_request(&ctx, account, &params, request.headers(), now)?;

    let mut payment = ensure_paid(&ctx, &mut req).await?;

    // Idempotence and extension checks against the stored state.
    let paid_until = match ctx.db.lookup_account(&req.account)? {
        AccountStatus::PaymentRequired => {
            // Paid a moment ago yet no account: broken backend state.
            return Err(ApiError::internal("account missing after payment"));
        }
        AccountStatus::Empty { paid_until } => paid_until,
        AccountStatus::ValidHashReturned {
            paid_until,
            hash,
            version,
        } => {
            let extension = years_to_pay(req.end_date, paid_until, ctx.now());
            if extension > 0 {
                // Client asked for more coverage than is paid for.
                let fresh = PaymentSecret::random();
                return Err(request_policy_payment(&ctx, &req, &fresh, extension).await?);
            }
            if hash == req.promised_hash {
                return Ok((
                    StatusCode::NOT_MODIFIED,
                    [(HEADER_POLICY_VERSION, version.to_string())],
                )
                    .into_response());
            }
            paid_until
        }
    };
    let extension = years_to_pay(req.end_date, paid_until, ctx.now());
    if extension > 0 {
        let fresh = PaymentSecret::random();
        return Err(request_policy_payment(&ctx, &req, &fresh, extension).await?);
    }

    // Stream the body through an incremental hash; never buffer more
    // than the declared Content-Length.
    let mut hasher = Sha512::new();
    let mut body = Vec::with_capacity(req.content_length as usize);
    let mut stream = request.into_body().into_data_stream();
    while let Some(chunk) = stream.next().await {
        let chunk =
            chunk.map_err(|_| ApiError::bad_request("UPLOAD_TRUNCATED", "body read failed"))?;
        if body.len() + chunk.len() > req.content_length as usize {
            return Err(ApiError::bad_request(
                "UPLOAD_OVERSIZED",
                "body exceeds declared Content-Length",
            ));
        }
        hasher.update(&chunk);
        body.extend_from_slice(&chunk);
    }
    if body.len() as u64 != req.content_length {
        return Err(ApiError::bad_request(
            "UPLOAD_TRUNCATED",
            "body shorter than declared Content-Length",
        ));
    }
    let actual_hash = HashCode::from_bytes(hasher.finalize().into());
    if actual_hash != req.promised_hash {
        warn!(account = %req.account, "uploaded data does not match ETag promise");
        return Err(ApiError::bad_request(
            "POLICY_INVALID_UPLOAD",
            "data uploaded does not match Etag promise",
        ));
    }

    // Store; a used-up quota mid-flight forces a fresh payment.
    for _attempt in 0..2 {
        match retry_soft(|| {
            ctx.db.store_recovery_document(
                &req.account,
                &req.signature,
                &req.promised_hash,
                &body,
                &payment,
            )
        })? {
            StoreStatus::Success { version } => {
                info!(account = %req.account, version, "recovery document uploaded");
                return Ok((
                    StatusCode::NO_CONTENT,
                    [
                        (HEADER_POLICY_VERSION, version.to_string()),
                        (HEADER_POLICY_EXPIRATION, paid_until.to_string()),
                    ],
                )
                    .into_response());
            }
            StoreStatus::NoChange { version } => {
                return Ok((
                    StatusCode::NOT_MODIFIED,
                    [(HEADER_POLICY_VERSION, version.to_string())],
                )
                    .into_response());
            }
            StoreStatus::StoreLimitExceeded | StoreStatus::PaymentRequired => {
                let fresh = PaymentSecret::random();
                req.payment = Some(fresh.clone());
                match await_policy_payment(&ctx, &req, &fresh).await {
                    Ok(()) => {
                        payment = fresh;
                        continue;
                    }
                    Err(reply) => return Err(reply),
                }
            }
        }
    }
    Err(ApiError::internal("store retries exhausted"))
}

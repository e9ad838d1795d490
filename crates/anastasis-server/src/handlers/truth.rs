//! `/truth/$UUID`: upload of authentication material and the
//! payment-gated challenge/response state machine that releases
//! encrypted key shares.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};

use anastasis_authorization::{
    AuthorizationPlugin, ProcessResult, Trigger, ValidationError,
};
use anastasis_core::constants::{
    AUTO_REFUND_TIMEOUT_SECONDS, CHALLENGE_CODE_VALIDITY_SECONDS, CHALLENGE_OFFER_LIFETIME_SECONDS,
    INITIAL_RETRY_COUNTER, MAX_QUESTION_FREQ_SECONDS, MAX_YEARS_STORAGE,
};
use anastasis_core::{
    base32, Amount, EncryptedKeyShare, HashCode, PaymentSecret, Timestamp, TruthKey, TruthUuid,
};
use anastasis_crypto::truth_decrypt;
use anastasis_db::{retry_soft, ChallengeCreation, CodeStatus, TruthLookup, TruthStoreStatus};
use anastasis_merchant::{CreateOrderRequest, OrderStatus};

use crate::context::SharedContext;
use crate::error::ApiError;
use crate::handlers::{
    parse_header, poll_order_status, request_deadline, HEADER_PAYMENT_IDENTIFIER,
    HEADER_TRUTH_DECRYPTION_KEY,
};
use crate::lifetime::{desired_until, grant_seconds, years_to_pay};
use crate::wait::WakeReason;

fn parse_uuid(uuid: &str) -> Result<TruthUuid, ApiError> {
    uuid.parse()
        .map_err(|_| ApiError::bad_request("PARAMETER_MALFORMED", "truth UUID"))
}

// ── POST /truth/$UUID ────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct TruthUploadRequest {
    key_share_data: EncryptedKeyShare,

    #[serde(rename = "type")]
    method: String,

    /// Base32-encoded ciphertext of the authentication data.
    encrypted_truth: String,

    #[serde(default)]
    truth_mime: Option<String>,

    storage_duration_years: u32,
}

pub async fn truth_post(
    State(ctx): State<SharedContext>,
    Path(uuid): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    body: axum::body::Bytes,
) -> Result<Response, ApiError> {
    let uuid = parse_uuid(&uuid)?;
    let now = ctx.now();

    if body.len() as u64 / 1024 / 1024 >= ctx.cfg.upload_limit_mb {
        return Err(ApiError::payload_too_large("truth upload too large"));
    }
    let upload: TruthUploadRequest = serde_json::from_slice(&body)
        .map_err(|e| ApiError::bad_request("JSON_INVALID", &e.to_string()))?;
    let encrypted_truth = base32::decode(&upload.encrypted_truth)
        .map_err(|_| ApiError::bad_request("PARAMETER_MALFORMED", "encrypted_truth"))?;

    // The method must be deliverable before we accept the upload.
    if upload.method != "question" && ctx.registry.load(&upload.method).is_err() {
        return Err(ApiError::bad_request(
            "TRUTH_UPLOAD_METHOD_NOT_SUPPORTED",
            &upload.method,
        ));
    }

    if upload.storage_duration_years > MAX_YEARS_STORAGE {
        return Err(ApiError::bad_request(
            "PARAMETER_MALFORMED",
            "storage_duration_years",
        ));
    }
    let years = upload.storage_duration_years.max(1);

    let deadline = request_deadline(&params, now, std::time::Duration::from_secs(1))?;
    let paid_until = if ctx.cfg.truth_upload_fee.is_zero() {
        desired_until(now, MAX_YEARS_STORAGE)
    } else {
        let desired = desired_until(now, years);
        let already = ctx.db.check_truth_upload_paid(&uuid)?;
        match already {
            Some(paid_until) if paid_until >= desired => paid_until,
            covered => {
                let open_years = years_to_pay(desired, covered.unwrap_or(0), now);
                let fee = ctx
                    .cfg
                    .truth_upload_fee
                    .checked_mul(open_years.max(1))
                    .map_err(|_| {
                        ApiError::bad_request("PARAMETER_MALFORMED", "storage_duration_years")
                    })?;
                await_truth_upload_payment(&ctx, &uuid, &fee, deadline).await?
            }
        }
    };

    let status = retry_soft(|| {
        ctx.db.store_truth(
            &uuid,
            &upload.key_share_data,
            upload.truth_mime.as_deref().unwrap_or(""),
            &encrypted_truth,
            &upload.method,
            paid_until,
        )
    })?;
    match status {
        TruthStoreStatus::Success | TruthStoreStatus::Idempotent => {
            info!(uuid = %uuid.short(), method = %upload.method, "truth stored");
            Ok(StatusCode::NO_CONTENT.into_response())
        }
        TruthStoreStatus::Conflict => Err(ApiError::conflict(
            "TRUTH_UPLOAD_UUID_EXISTS",
            "a different truth already exists under this UUID",
        )),
    }
}

/// Payment gate for truth uploads. The order id is the base32 UUID.
/// Returns the granted `paid_until` when payment is settled; otherwise
/// replies 402 (creating the order first if the backend has none).
async fn await_truth_upload_payment(
    ctx: &SharedContext,
    uuid: &TruthUuid,
    fee: &Amount,
    deadline: Timestamp,
) -> Result<Timestamp, ApiError> {
    let order_id = uuid.to_string();
    match poll_order_status(ctx, &order_id, deadline).await? {
        OrderStatus::Paid {
            contract_amount,
            deposit_total,
        } => {
            let deposit = deposit_total.clone().or(contract_amount);
            let years = deposit
                .as_ref()
                .and_then(|a| a.divide2(&ctx.cfg.truth_upload_fee).ok())
                .filter(|y| *y > 0)
                .unwrap_or(1);
            let now = ctx.now();
            let covered = ctx.db.check_truth_upload_paid(uuid)?.unwrap_or(now);
            let paid_until = covered.max(now) + grant_seconds(years);
            ctx.db.record_truth_upload_payment(
                uuid,
                deposit.as_ref().unwrap_or(fee),
                paid_until,
            )?;
            info!(uuid = %uuid.short(), years, paid_until, "truth upload paid");
            Ok(paid_until)
        }
        OrderStatus::Unpaid | OrderStatus::Claimed => {
            Err(ApiError::payment_required(&ctx.merchant.pay_uri(&order_id)))
        }
        OrderStatus::NotFound => {
            ctx.merchant
                .create_order(&CreateOrderRequest {
                    amount: fee.clone(),
                    summary: "Anastasis challenge storage fee".into(),
                    order_id: order_id.clone(),
                    auto_refund: None,
                    pay_deadline: None,
                    fulfillment_url: Some(ctx.cfg.fulfillment_url.clone()),
                })
                .await?;
            debug!(uuid = %uuid.short(), fee = %fee, "created truth upload order");
            Err(ApiError::payment_required(&ctx.merchant.pay_uri(&order_id)))
        }
    }
}

// ── GET /truth/$UUID ─────────────────────────────────────────────────────────

struct ChallengeRequest {
    uuid: TruthUuid,
    truth_key: TruthKey,
    payment: Option<PaymentSecret>,
    response: Option<HashCode>,
    deadline: Timestamp,
}

pub async fn truth_get(
    State(ctx): State<SharedContext>,
    Path(uuid): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let uuid = parse_uuid(&uuid)?;
    let now = ctx.now();

    let truth_key: TruthKey =
        parse_header(&headers, &HEADER_TRUTH_DECRYPTION_KEY)?.ok_or_else(|| {
            ApiError::bad_request("PARAMETER_MISSING", "Anastasis-Truth-Decryption-Key")
        })?;
    let payment: Option<PaymentSecret> = parse_header(&headers, &HEADER_PAYMENT_IDENTIFIER)?;
    let response: Option<HashCode> = match params.get("response") {
        None => None,
        Some(raw) => Some(
            raw.parse()
                .map_err(|_| ApiError::bad_request("PARAMETER_MALFORMED", "response"))?,
        ),
    };
    let deadline = request_deadline(&params, now, std::time::Duration::from_secs(1))?;
    let req = ChallengeRequest {
        uuid,
        truth_key,
        payment,
        response,
        deadline,
    };

    // S0: load the truth and resolve its method.
    let (encrypted_truth, truth_mime, method) =
        match ctx.db.get_escrow_challenge(&req.uuid, now)? {
            TruthLookup::Unknown => return Err(ApiError::not_found("TRUTH_UNKNOWN")),
            TruthLookup::Expired => return Err(ApiError::gone("TRUTH_EXPIRED")),
            TruthLookup::Found(t) => t,
        };
    let is_question = method == "question";
    let plugin = if is_question {
        None
    } else {
        Some(ctx.registry.load(&method).map_err(|e| {
            warn!(uuid = %req.uuid.short(), method = %method, error = %e,
                  "authorization method unavailable");
            ApiError::internal("authorization method no longer supported")
        })?)
    };
    let cost = match &plugin {
        Some(p) => p.properties().cost.clone(),
        None => ctx.cfg.question_cost.clone(),
    };

    // S1: payment, unless free or plugin-managed.
    let plugin_managed = plugin
        .as_ref()
        .map(|p| p.properties().payment_plugin_managed)
        .unwrap_or(false);
    let mut paid_session: Option<PaymentSecret> = None;
    if !plugin_managed && !cost.is_zero() {
        paid_session = Some(ensure_challenge_paid(&ctx, &req, &cost).await?);
    }

    // S2: decrypt the truth with the caller's key.
    let decrypted_truth = truth_decrypt(&req.truth_key, &encrypted_truth)
        .map_err(|_| ApiError::new(
            StatusCode::EXPECTATION_FAILED,
            "TRUTH_DECRYPTION_FAILED",
            "could not decrypt truth with the provided key",
        ))?;

    // S3: dispatch by method.
    if is_question {
        return handle_security_question(&ctx, &req, &decrypted_truth).await;
    }
    let plugin = plugin.expect("non-question methods always carry a plugin");

    if plugin.properties().user_provided_code {
        return direct_validation(&ctx, &req, plugin, &decrypted_truth, paid_session, &cost)
            .await;
    }

    // Code-based method: verify an answer against the stored code ...
    let mut have_response = req.response.is_some();
    if let Some(response) = &req.response {
        // Recompute the clock: the payment phase may have long-polled.
        match ctx.db.verify_challenge_code(&req.uuid, response, ctx.now())? {
            CodeStatus::Mismatch => {
                warn!(uuid = %req.uuid.short(), "challenge response mismatch");
                return Err(ApiError::forbidden(
                    "TRUTH_CHALLENGE_FAILED",
                    "response does not match the challenge code",
                ));
            }
            CodeStatus::ValidCodeStored { satisfied, code } => {
                if satisfied {
                    return release_key_share(&ctx, &req.uuid);
                }
                // Externally-managed satisfaction still pending; let the
                // plugin drive the remaining process.
                return run_authorization_process(
                    &ctx,
                    &req,
                    plugin,
                    code,
                    &decrypted_truth,
                    paid_session,
                    &cost,
                )
                .await;
            }
            CodeStatus::NoResults => {
                debug!(uuid = %req.uuid.short(),
                       "response for expired code, issuing a fresh challenge");
                have_response = false;
            }
        }
    }

    // ... or create and transmit a fresh challenge.
    if !have_response {
        if let Err(e) = plugin.validate(&truth_mime, &decrypted_truth) {
            return match e {
                ValidationError::Invalid(reply) => Err(ApiError::from_reply(reply)),
                ValidationError::Internal(hint) => Err(ApiError::internal(&hint)),
            };
        }
        let props = plugin.properties();
        let now = ctx.now();
        let code = match retry_soft(|| {
            ctx.db.create_challenge_code(
                &req.uuid,
                props.code_rotation_period,
                props.code_validity_period,
                props.retry_counter,
                now,
            )
        })? {
            ChallengeCreation::RateLimited => {
                return Err(ApiError::too_many_requests("TRUTH_RATE_LIMITED"));
            }
            ChallengeCreation::Fresh { code } => code,
            ChallengeCreation::Cached { code, last_sent_at } => {
                if let Some(sent) = last_sent_at {
                    if now - sent < props.code_retransmission_frequency {
                        return Err(ApiError::already_reported(
                            "TRUTH_CHALLENGE_ACTIVE",
                            "challenge was transmitted recently, wait before retrying",
                        ));
                    }
                }
                code
            }
        };
        return run_authorization_process(
            &ctx,
            &req,
            plugin,
            code,
            &decrypted_truth,
            paid_session,
            &cost,
        )
        .await;
    }
    Err(ApiError::internal("unreachable challenge state"))
}

/// S1 for methods the service charges for. Returns the paid payment
/// secret, or replies 402/other.
async fn ensure_challenge_paid(
    ctx: &SharedContext,
    req: &ChallengeRequest,
    cost: &Amount,
) -> Result<PaymentSecret, ApiError> {
    let now = ctx.now();
    if let Some(ps) = &req.payment {
        match ctx.db.check_challenge_payment(ps, &req.uuid)? {
            Some(true) => return Ok(ps.clone()),
            Some(false) => return await_challenge_payment(ctx, req, ps.clone()).await,
            None => {
                debug!(uuid = %req.uuid.short(),
                       "client payment identifier unknown, starting fresh payment");
            }
        }
    }
    // Reuse an open offer when one exists so the wallet keeps a single
    // order to pay.
    let ps = match ctx.db.lookup_challenge_payment(&req.uuid)? {
        Some(ps) => return await_challenge_payment(ctx, req, ps).await,
        None => PaymentSecret::random(),
    };
    let order_id = ps.to_string();
    ctx.merchant
        .create_order(&CreateOrderRequest {
            amount: cost.clone(),
            summary: "challenge fee for anastasis service".into(),
            order_id: order_id.clone(),
            auto_refund: Some(AUTO_REFUND_TIMEOUT_SECONDS),
            pay_deadline: Some(now + CHALLENGE_OFFER_LIFETIME_SECONDS),
            fulfillment_url: Some(ctx.cfg.fulfillment_url.clone()),
        })
        .await?;
    ctx.db
        .record_challenge_payment(&req.uuid, &ps, cost, now)?;
    info!(uuid = %req.uuid.short(), order = %order_id, "challenge order created");
    Err(ApiError::payment_required(&ctx.merchant.pay_uri(&order_id)))
}

/// Long-poll an existing challenge order.
async fn await_challenge_payment(
    ctx: &SharedContext,
    req: &ChallengeRequest,
    ps: PaymentSecret,
) -> Result<PaymentSecret, ApiError> {
    let order_id = ps.to_string();
    match poll_order_status(ctx, &order_id, req.deadline).await? {
        OrderStatus::Paid { .. } => {
            ctx.db.update_challenge_payment(&req.uuid, &ps)?;
            info!(uuid = %req.uuid.short(), order = %order_id, "challenge paid");
            Ok(ps)
        }
        OrderStatus::Unpaid | OrderStatus::Claimed => {
            Err(ApiError::payment_required(&ctx.merchant.pay_uri(&order_id)))
        }
        OrderStatus::NotFound => {
            // We created this order before; its disappearance is a
            // backend fault, not a client one.
            warn!(order = %order_id, "previously created order disappeared from backend");
            Err(ApiError::new(
                StatusCode::BAD_GATEWAY,
                "TRUTH_ORDER_DISAPPEARED",
                "order vanished from the payment backend",
            ))
        }
    }
}

/// S3(a): security questions are answered inline; the database gates
/// the attempt rate even for correct answers.
async fn handle_security_question(
    ctx: &SharedContext,
    req: &ChallengeRequest,
    decrypted_truth: &[u8],
) -> Result<Response, ApiError> {
    debug!(uuid = %req.uuid.short(), "handling security question challenge");
    let Some(response) = &req.response else {
        return Err(ApiError::forbidden(
            "TRUTH_CHALLENGE_RESPONSE_REQUIRED",
            "security questions require a response parameter",
        ));
    };
    question_rate_limit(ctx, &req.uuid)?;
    let matches = decrypted_truth.len() == HashCode::LEN
        && bool::from(decrypted_truth.ct_eq(response.as_bytes()));
    if !matches {
        info!(uuid = %req.uuid.short(), "wrong answer to security question");
        return Err(ApiError::forbidden(
            "TRUTH_CHALLENGE_FAILED",
            "answer does not match",
        ));
    }
    release_key_share(ctx, &req.uuid)
}

/// The shared attempt gate for questions and user-provided-code
/// methods: every attempt passes through the challenge-code store.
fn question_rate_limit(ctx: &SharedContext, uuid: &TruthUuid) -> Result<(), ApiError> {
    match retry_soft(|| {
        ctx.db.create_challenge_code(
            uuid,
            MAX_QUESTION_FREQ_SECONDS,
            CHALLENGE_CODE_VALIDITY_SECONDS,
            INITIAL_RETRY_COUNTER,
            ctx.now(),
        )
    })? {
        ChallengeCreation::RateLimited => {
            Err(ApiError::too_many_requests("TRUTH_RATE_LIMITED"))
        }
        ChallengeCreation::Fresh { .. } | ChallengeCreation::Cached { .. } => Ok(()),
    }
}

/// S3(b): the plugin checks the user-supplied answer itself.
async fn direct_validation(
    ctx: &SharedContext,
    req: &ChallengeRequest,
    plugin: Arc<dyn AuthorizationPlugin>,
    decrypted_truth: &[u8],
    paid_session: Option<PaymentSecret>,
    cost: &Amount,
) -> Result<Response, ApiError> {
    question_rate_limit(ctx, &req.uuid)?;
    run_authorization_process(ctx, req, plugin, 0, decrypted_truth, paid_session, cost).await
}

/// S4: drive the plugin process until it yields a terminal outcome,
/// parking the request in the wait registry across suspensions.
async fn run_authorization_process(
    ctx: &SharedContext,
    req: &ChallengeRequest,
    plugin: Arc<dyn AuthorizationPlugin>,
    code: u64,
    decrypted_truth: &[u8],
    paid_session: Option<PaymentSecret>,
    cost: &Amount,
) -> Result<Response, ApiError> {
    let waiter = ctx.waits.new_waiter();
    let trigger: Trigger = waiter.trigger();
    let mut state = plugin
        .start(trigger, &req.uuid, code, decrypted_truth, req.response.as_ref())
        .map_err(|e| {
            warn!(uuid = %req.uuid.short(), error = %e, "authorization start failed");
            ApiError::internal("could not start the authorization process")
        })?;

    let refund_on_failure = |reason: &str| {
        if let Some(ps) = &paid_session {
            ctx.refunds.begin_refund(
                ctx.merchant.clone(),
                Arc::clone(&ctx.db),
                req.uuid.clone(),
                ps.clone(),
                cost.clone(),
            );
            debug!(uuid = %req.uuid.short(), reason, "refund scheduled");
        }
    };

    loop {
        match state.process(req.deadline).await {
            ProcessResult::Success(reply) => {
                ctx.db.mark_challenge_sent(
                    paid_session.as_ref(),
                    &req.uuid,
                    code,
                    ctx.now(),
                )?;
                info!(uuid = %req.uuid.short(), "challenge transmitted");
                return Err(ApiError::from_reply(reply));
            }
            ProcessResult::Failed(reply) => {
                refund_on_failure("challenge transmission failed");
                return Err(ApiError::from_reply(reply));
            }
            ProcessResult::SuccessReplyFailed => {
                ctx.db.mark_challenge_sent(
                    paid_session.as_ref(),
                    &req.uuid,
                    code,
                    ctx.now(),
                )?;
                return Err(ApiError::internal("challenge sent, reply failed"));
            }
            ProcessResult::FailedReplyFailed => {
                refund_on_failure("challenge failed without reply");
                return Err(ApiError::internal("challenge failed"));
            }
            ProcessResult::Suspended => {
                let deadline_in = crate::handlers::remaining(req.deadline, ctx.now());
                match waiter
                    .wait_until(tokio::time::Instant::now() + deadline_in)
                    .await
                {
                    WakeReason::Event => continue,
                    WakeReason::Timeout => {
                        refund_on_failure("authorization timed out");
                        return Err(ApiError::new(
                            StatusCode::GATEWAY_TIMEOUT,
                            "AUTHORIZATION_TIMEOUT",
                            "gave up waiting for the authorization process",
                        ));
                    }
                    WakeReason::Shutdown => {
                        return Err(ApiError::new(
                            StatusCode::SERVICE_UNAVAILABLE,
                            "SHUTDOWN",
                            "service is shutting down",
                        ));
                    }
                }
            }
            ProcessResult::Finished => {
                return release_key_share(ctx, &req.uuid);
            }
        }
    }
}

/// S5: hand out the encrypted key share.
fn release_key_share(ctx: &SharedContext, uuid: &TruthUuid) -> Result<Response, ApiError> {
    match ctx.db.get_key_share(uuid, ctx.now())? {
        TruthLookup::Unknown => Err(ApiError::not_found("TRUTH_KEY_SHARE_GONE")),
        TruthLookup::Expired => Err(ApiError::gone("TRUTH_KEY_SHARE_GONE")),
        TruthLookup::Found(share) => {
            info!(uuid = %uuid.short(), "returning key share");
            Ok((
                StatusCode::OK,
                [(header::CONTENT_TYPE, "application/octet-stream")],
                share.as_bytes().to_vec(),
            )
                .into_response())
        }
    }
}

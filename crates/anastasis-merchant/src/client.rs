use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, info, warn};

use anastasis_core::{Amount, Timestamp};

/// Ceiling for any single status long-poll; callers may ask for less.
const LONG_POLL_CEILING: Duration = Duration::from_secs(30 * 60);

/// Slack added to the HTTP timeout beyond the long-poll window so a
/// healthy backend can answer late, and a dead one is still detected.
const HTTP_TIMEOUT_SLACK: Duration = Duration::from_secs(15);

#[derive(Debug, thiserror::Error)]
pub enum MerchantError {
    /// Could not reach the backend at all.
    #[error("merchant backend unreachable: {0}")]
    Transport(reqwest::Error),

    /// Backend took too long to answer.
    #[error("merchant backend timed out")]
    Timeout,

    /// Backend answered with an error status.
    #[error("merchant backend returned status {status}")]
    Backend {
        status: u16,
        ec: Option<u64>,
        reply: Option<serde_json::Value>,
    },

    /// Backend answered 200 but the body made no sense.
    #[error("merchant backend reply malformed: {0}")]
    Malformed(String),
}

impl From<reqwest::Error> for MerchantError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            MerchantError::Timeout
        } else {
            MerchantError::Transport(e)
        }
    }
}

#[derive(Debug, Clone)]
pub struct CreateOrderRequest {
    pub amount: Amount,
    pub summary: String,

    /// Merchant order id; the base32 payment secret or truth UUID.
    pub order_id: String,

    /// Automatic refund window offered to the wallet (seconds).
    pub auto_refund: Option<i64>,

    /// Deadline by which the order must be paid.
    pub pay_deadline: Option<Timestamp>,

    pub fulfillment_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct OrderCreated {
    pub order_id: String,
}

/// What the provider observes about an order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderStatus {
    Paid {
        /// Amount from the paid contract terms, if present.
        contract_amount: Option<Amount>,
        deposit_total: Option<Amount>,
    },
    Unpaid,
    Claimed,
    NotFound,
}

#[derive(Deserialize)]
struct OrderStatusBody {
    order_status: String,
    #[serde(default)]
    contract_terms: Option<serde_json::Value>,
    #[serde(default)]
    deposit_total: Option<String>,
}

#[derive(Deserialize)]
struct PostOrderBody {
    order_id: String,
}

#[derive(Clone)]
pub struct MerchantClient {
    http: reqwest::Client,
    backend_url: String,
    api_key: Option<String>,
}

impl MerchantClient {
    pub fn new(backend_url: &str, api_key: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            backend_url: backend_url.trim_end_matches('/').to_string(),
            api_key,
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut rb = self
            .http
            .request(method, format!("{}{}", self.backend_url, path));
        if let Some(key) = &self.api_key {
            rb = rb.header(reqwest::header::AUTHORIZATION, key);
        }
        rb
    }

    /// The pay URI advertised to wallets in the `Taler:` header:
    /// `taler[+http]://pay/$HOST/$ORDER_ID/`.
    pub fn pay_uri(&self, order_id: &str) -> String {
        let (scheme, host) = if let Some(h) = self.backend_url.strip_prefix("https://") {
            ("taler://", h)
        } else if let Some(h) = self.backend_url.strip_prefix("http://") {
            ("taler+http://", h)
        } else {
            // Checked at configuration time; keep a sane fallback.
            ("taler://", self.backend_url.as_str())
        };
        format!("{scheme}pay/{host}/{order_id}/")
    }

    /// Create an order; completes when the backend has accepted it.
    pub async fn create_order(
        &self,
        req: &CreateOrderRequest,
    ) -> Result<OrderCreated, MerchantError> {
        let mut order = serde_json::json!({
            "amount": req.amount.to_string(),
            "summary": req.summary,
            "order_id": req.order_id,
        });
        if let Some(deadline) = req.pay_deadline {
            order["pay_deadline"] = serde_json::json!({ "t_s": deadline });
        }
        if let Some(url) = &req.fulfillment_url {
            order["fulfillment_url"] = serde_json::json!(url);
        }
        let mut body = serde_json::json!({
            "order": order,
            "create_token": false,
        });
        if let Some(secs) = req.auto_refund {
            body["refund_delay"] = serde_json::json!({ "d_us": secs * 1_000_000 });
        }
        debug!(order_id = %req.order_id, amount = %req.amount, "creating order");
        let resp = self
            .request(reqwest::Method::POST, "/private/orders")
            .timeout(HTTP_TIMEOUT_SLACK)
            .json(&body)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let reply = resp.json::<serde_json::Value>().await.ok();
            warn!(order_id = %req.order_id, status = %status, "order creation failed");
            return Err(backend_error(status.as_u16(), reply));
        }
        let parsed: PostOrderBody = resp
            .json()
            .await
            .map_err(|e| MerchantError::Malformed(e.to_string()))?;
        info!(order_id = %parsed.order_id, "order created");
        Ok(OrderCreated {
            order_id: parsed.order_id,
        })
    }

    /// Poll the payment status of an order, long-polling up to
    /// `long_poll` (clamped to an internal ceiling).
    pub async fn get_order_status(
        &self,
        order_id: &str,
        long_poll: Duration,
    ) -> Result<OrderStatus, MerchantError> {
        let long_poll = long_poll.min(LONG_POLL_CEILING);
        let resp = self
            .request(
                reqwest::Method::GET,
                &format!("/private/orders/{order_id}"),
            )
            .query(&[("timeout_ms", long_poll.as_millis().to_string())])
            .timeout(long_poll + HTTP_TIMEOUT_SLACK)
            .send()
            .await?;
        let status = resp.status();
        match status.as_u16() {
            404 => return Ok(OrderStatus::NotFound),
            s if !status.is_success() => {
                let reply = resp.json::<serde_json::Value>().await.ok();
                return Err(backend_error(s, reply));
            }
            _ => {}
        }
        let body: OrderStatusBody = resp
            .json()
            .await
            .map_err(|e| MerchantError::Malformed(e.to_string()))?;
        parse_order_status(&body)
    }

    /// Issue a refund for a (fully or partially) paid order.
    pub async fn refund_order(
        &self,
        order_id: &str,
        amount: &Amount,
        reason: &str,
    ) -> Result<(), MerchantError> {
        let resp = self
            .request(
                reqwest::Method::POST,
                &format!("/private/orders/{order_id}/refund"),
            )
            .timeout(HTTP_TIMEOUT_SLACK)
            .json(&serde_json::json!({
                "refund": amount.to_string(),
                "reason": reason,
            }))
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let reply = resp.json::<serde_json::Value>().await.ok();
            return Err(backend_error(status.as_u16(), reply));
        }
        info!(order_id, amount = %amount, "refund issued");
        Ok(())
    }
}

fn backend_error(status: u16, reply: Option<serde_json::Value>) -> MerchantError {
    if status == 504 {
        return MerchantError::Timeout;
    }
    let ec = reply
        .as_ref()
        .and_then(|r| r.get("code"))
        .and_then(|c| c.as_u64());
    MerchantError::Backend { status, ec, reply }
}

fn parse_order_status(body: &OrderStatusBody) -> Result<OrderStatus, MerchantError> {
    match body.order_status.as_str() {
        "paid" => {
            let contract_amount = body
                .contract_terms
                .as_ref()
                .and_then(|ct| ct.get("amount"))
                .and_then(|a| a.as_str())
                .and_then(|a| a.parse().ok());
            let deposit_total = body.deposit_total.as_deref().and_then(|a| a.parse().ok());
            Ok(OrderStatus::Paid {
                contract_amount,
                deposit_total,
            })
        }
        "unpaid" => Ok(OrderStatus::Unpaid),
        "claimed" => Ok(OrderStatus::Claimed),
        other => Err(MerchantError::Malformed(format!(
            "unknown order_status `{other}`"
        ))),
    }
}

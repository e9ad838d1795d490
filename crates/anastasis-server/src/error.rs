//! The request error taxonomy. Every handler failure is a value of
//! [`ApiError`]; an error reply is always terminal for its request.

use axum::http::{header, HeaderName, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;

use anastasis_db::DbError;
use anastasis_merchant::MerchantError;

/// Header carrying the pay URI on 402 responses.
pub const TALER_HEADER: HeaderName = HeaderName::from_static("taler");

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub body: serde_json::Value,
    headers: Vec<(HeaderName, String)>,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &str, hint: &str) -> Self {
        Self {
            status,
            body: serde_json::json!({ "code": code, "hint": hint }),
            headers: Vec::new(),
        }
    }

    pub fn bad_request(code: &str, hint: &str) -> Self {
        Self::new(StatusCode::BAD_REQUEST, code, hint)
    }

    pub fn forbidden(code: &str, hint: &str) -> Self {
        Self::new(StatusCode::FORBIDDEN, code, hint)
    }

    pub fn not_found(code: &str) -> Self {
        Self::new(StatusCode::NOT_FOUND, code, "")
    }

    pub fn gone(code: &str) -> Self {
        Self::new(StatusCode::GONE, code, "")
    }

    pub fn conflict(code: &str, hint: &str) -> Self {
        Self::new(StatusCode::CONFLICT, code, hint)
    }

    pub fn payload_too_large(hint: &str) -> Self {
        Self::new(StatusCode::PAYLOAD_TOO_LARGE, "UPLOAD_TOO_LARGE", hint)
    }

    pub fn too_many_requests(code: &str) -> Self {
        Self::new(StatusCode::TOO_MANY_REQUESTS, code, "")
    }

    pub fn already_reported(code: &str, hint: &str) -> Self {
        Self::new(StatusCode::ALREADY_REPORTED, code, hint)
    }

    pub fn internal(hint: &str) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", hint)
    }

    /// 402 with the `Taler:` header carrying the pay URI.
    pub fn payment_required(pay_uri: &str) -> Self {
        Self {
            status: StatusCode::PAYMENT_REQUIRED,
            body: serde_json::json!({}),
            headers: vec![(TALER_HEADER, pay_uri.to_string())],
        }
    }

    /// A reply dictated by an authorization plugin.
    pub fn from_reply(reply: anastasis_authorization::Reply) -> Self {
        Self {
            status: StatusCode::from_u16(reply.status)
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            body: reply.body,
            headers: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: HeaderName, value: String) -> Self {
        self.headers.push((name, value));
        self
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut resp = (self.status, Json(self.body)).into_response();
        for (name, value) in self.headers {
            if let Ok(v) = header::HeaderValue::from_str(&value) {
                resp.headers_mut().insert(name, v);
            }
        }
        resp
    }
}

impl From<DbError> for ApiError {
    fn from(e: DbError) -> Self {
        tracing::error!(error = %e, "database failure surfaced to client");
        match e {
            DbError::Hard(_) => Self::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "DB_FETCH_FAILED",
                "database failure",
            ),
            DbError::Soft(_) => Self::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "DB_SOFT_FAILURE",
                "database failure (retries exhausted)",
            ),
        }
    }
}

impl From<MerchantError> for ApiError {
    fn from(e: MerchantError) -> Self {
        match e {
            MerchantError::Timeout => Self::new(
                StatusCode::GATEWAY_TIMEOUT,
                "BACKEND_TIMEOUT",
                "timeout talking to the payment backend",
            ),
            MerchantError::Backend { status, ec, reply } => Self {
                status: StatusCode::BAD_GATEWAY,
                body: serde_json::json!({
                    "code": "BACKEND_ERROR",
                    "hint": "payment backend failed",
                    "backend-ec": ec,
                    "backend-http-status": status,
                    "backend-reply": reply,
                }),
                headers: Vec::new(),
            },
            MerchantError::Transport(err) => {
                tracing::warn!(error = %err, "merchant backend unreachable");
                Self::new(
                    StatusCode::BAD_GATEWAY,
                    "BACKEND_UNREACHABLE",
                    "payment backend unreachable",
                )
            }
            MerchantError::Malformed(hint) => Self::new(
                StatusCode::BAD_GATEWAY,
                "BACKEND_REPLY_MALFORMED",
                &hint,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payment_required_carries_taler_header() {
        let resp = ApiError::payment_required("taler://pay/host/ORDER/").into_response();
        assert_eq!(resp.status(), StatusCode::PAYMENT_REQUIRED);
        assert_eq!(
            resp.headers().get("taler").unwrap(),
            "taler://pay/host/ORDER/"
        );
    }

    #[test]
    fn merchant_backend_error_becomes_502_with_details() {
        let e = MerchantError::Backend {
            status: 500,
            ec: Some(7),
            reply: Some(serde_json::json!({"x": 1})),
        };
        let api: ApiError = e.into();
        assert_eq!(api.status, StatusCode::BAD_GATEWAY);
        assert_eq!(api.body["backend-ec"], 7);
        assert_eq!(api.body["backend-http-status"], 500);
    }

    #[test]
    fn merchant_timeout_becomes_504() {
        let api: ApiError = MerchantError::Timeout.into();
        assert_eq!(api.status, StatusCode::GATEWAY_TIMEOUT);
    }
}

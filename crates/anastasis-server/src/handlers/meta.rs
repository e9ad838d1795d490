//! The static surface: banner, source redirect, `/config`, `/terms`
//! and `/privacy`.

use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;

use anastasis_core::constants::{PROTOCOL_VERSION, SOURCE_URL};

use crate::context::{SharedContext, StaticDocument};
use crate::error::ApiError;

pub async fn banner() -> &'static str {
    "This is an Anastasis provider. See /config for details.\n"
}

/// Plain 302 to the source code, as the license requires.
pub async fn agpl() -> Response {
    (StatusCode::FOUND, [(header::LOCATION, SOURCE_URL)]).into_response()
}

pub async fn config(State(ctx): State<SharedContext>) -> Json<serde_json::Value> {
    let mut methods = vec![serde_json::json!({
        "type": "question",
        "cost": ctx.cfg.question_cost,
    })];
    for (name, cost) in ctx.registry.enabled_methods() {
        methods.push(serde_json::json!({ "type": name, "cost": cost }));
    }
    Json(serde_json::json!({
        "name": "anastasis",
        "version": PROTOCOL_VERSION,
        "business_name": ctx.cfg.business_name,
        "currency": ctx.cfg.currency,
        "methods": methods,
        "storage_limit_in_megabytes": ctx.cfg.upload_limit_mb,
        "annual_fee": ctx.cfg.annual_fee,
        "truth_upload_fee": ctx.cfg.truth_upload_fee,
        "liability_limit": ctx.cfg.insurance,
        "server_salt": ctx.provider_salt,
    }))
}

fn serve_document(
    doc: Option<&StaticDocument>,
    headers: &HeaderMap,
) -> Result<Response, ApiError> {
    let Some(doc) = doc else {
        return Err(ApiError::not_found("DOCUMENT_NOT_CONFIGURED"));
    };
    if let Some(inm) = headers
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
    {
        if inm.trim_matches('"') == doc.etag {
            return Ok(StatusCode::NOT_MODIFIED.into_response());
        }
    }
    Ok((
        StatusCode::OK,
        [
            (header::ETAG, doc.etag.clone()),
            (header::CONTENT_TYPE, doc.content_type.to_string()),
        ],
        doc.bytes.clone(),
    )
        .into_response())
}

pub async fn terms(
    State(ctx): State<SharedContext>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    serve_document(ctx.terms.as_ref(), &headers)
}

pub async fn privacy(
    State(ctx): State<SharedContext>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    serve_document(ctx.privacy.as_ref(), &headers)
}

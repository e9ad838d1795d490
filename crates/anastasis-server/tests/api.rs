//! In-process protocol tests: the router is exercised with oneshot
//! requests, payments run against a mock merchant backend bound to an
//! ephemeral port.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{Request, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use http_body_util::BodyExt;
use sha2::Digest;
use tower::util::ServiceExt;

use anastasis_core::{base32, HashCode, ProviderConfig, TruthKey, TruthUuid};
use anastasis_crypto::{hash_answer, truth_encrypt, AccountKeyPair};
use anastasis_server::{build_router, spawn_background_tasks, ServiceContext, SharedContext};

// ── Mock merchant backend ─────────────────────────────────────────────────────

#[derive(Default)]
struct MockOrders {
    orders: Mutex<HashMap<String, (String, bool)>>,
    refunds: Mutex<Vec<String>>,
}

impl MockOrders {
    fn pay(&self, order_id: &str) {
        let mut orders = self.orders.lock().unwrap();
        let entry = orders
            .get_mut(order_id)
            .unwrap_or_else(|| panic!("paying unknown order {order_id}"));
        entry.1 = true;
    }

    fn refund_count(&self) -> usize {
        self.refunds.lock().unwrap().len()
    }
}

async fn mock_post_order(
    State(state): State<Arc<MockOrders>>,
    Json(body): Json<serde_json::Value>,
) -> impl IntoResponse {
    let order = &body["order"];
    let order_id = order["order_id"].as_str().unwrap().to_string();
    let amount = order["amount"].as_str().unwrap().to_string();
    state
        .orders
        .lock()
        .unwrap()
        .insert(order_id.clone(), (amount, false));
    Json(serde_json::json!({ "order_id": order_id }))
}

async fn mock_get_order(
    State(state): State<Arc<MockOrders>>,
    Path(order_id): Path<String>,
) -> impl IntoResponse {
    let orders = state.orders.lock().unwrap();
    match orders.get(&order_id) {
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "code": 2000 })),
        )
            .into_response(),
        Some((amount, paid)) => {
            let status = if *paid { "paid" } else { "unpaid" };
            Json(serde_json::json!({
                "order_status": status,
                "contract_terms": { "amount": amount },
                "deposit_total": amount,
            }))
            .into_response()
        }
    }
}

async fn mock_refund(
    State(state): State<Arc<MockOrders>>,
    Path(order_id): Path<String>,
) -> impl IntoResponse {
    state.refunds.lock().unwrap().push(order_id);
    Json(serde_json::json!({}))
}

async fn spawn_mock_merchant() -> (SocketAddr, Arc<MockOrders>) {
    let state = Arc::new(MockOrders::default());
    let router = Router::new()
        .route("/private/orders", post(mock_post_order))
        .route("/private/orders/:order_id", get(mock_get_order))
        .route("/private/orders/:order_id/refund", post(mock_refund))
        .with_state(Arc::clone(&state));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    (addr, state)
}

// ── Test environment ──────────────────────────────────────────────────────────

struct TestEnv {
    router: Router,
    _ctx: SharedContext,
    merchant: Arc<MockOrders>,
    _dir: tempfile::TempDir,
}

async fn test_env(annual_fee: &str, truth_fee: &str, question_cost: &str) -> TestEnv {
    let (merchant_addr, merchant) = spawn_mock_merchant().await;
    let dir = tempfile::tempdir().unwrap();
    let cfg: ProviderConfig = serde_json::from_value(serde_json::json!({
        "listen_addr": "127.0.0.1:0",
        "data_dir": dir.path().join("db"),
        "business_name": "Test Provider",
        "currency": "EUR",
        "annual_fee": annual_fee,
        "truth_upload_fee": truth_fee,
        "question_cost": question_cost,
        "insurance": "EUR:1000",
        "upload_limit_mb": 1,
        "server_salt": "test-salt",
        "fulfillment_url": "taler://fulfillment-success/",
        "merchant": { "payment_backend_url": format!("http://{merchant_addr}/") },
        "authorization": {
            "file": { "enabled": true, "cost": "EUR:1" }
        }
    }))
    .unwrap();
    let ctx = Arc::new(ServiceContext::new(cfg).unwrap());
    let _tasks = spawn_background_tasks(&ctx);
    TestEnv {
        router: build_router(Arc::clone(&ctx)),
        _ctx: ctx,
        merchant,
        _dir: dir,
    }
}

async fn send(env: &TestEnv, req: Request<Body>) -> (StatusCode, axum::http::HeaderMap, Vec<u8>) {
    let resp = env.router.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let headers = resp.headers().clone();
    let body = resp.into_body().collect().await.unwrap().to_bytes().to_vec();
    (status, headers, body)
}

fn keypair() -> AccountKeyPair {
    AccountKeyPair::derive(&HashCode::from_bytes([42u8; 64]))
}

fn policy_post_request(
    kp: &AccountKeyPair,
    document: &[u8],
    payment: Option<&str>,
) -> Request<Body> {
    let hash = HashCode::from_bytes(sha2::Sha512::digest(document).into());
    let sig = kp.sign_policy_upload(&hash);
    let mut builder = Request::builder()
        .method("POST")
        .uri(format!("/policy/{}", kp.public()))
        .header("content-length", document.len())
        .header("if-none-match", hash.to_string())
        .header("anastasis-policy-signature", sig.to_string());
    if let Some(ps) = payment {
        builder = builder.header("anastasis-payment-identifier", ps);
    }
    builder.body(Body::from(document.to_vec())).unwrap()
}

fn order_id_from_taler_header(headers: &axum::http::HeaderMap) -> String {
    let uri = headers
        .get("taler")
        .expect("402 must carry a Taler header")
        .to_str()
        .unwrap();
    uri.trim_end_matches('/').rsplit('/').next().unwrap().to_string()
}

// ── Meta surface ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn config_advertises_methods_and_salt() {
    let env = test_env("EUR:0", "EUR:0", "EUR:0").await;
    let (status, _, body) = send(
        &env,
        Request::builder()
            .uri("/config")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["name"], "anastasis");
    assert_eq!(json["currency"], "EUR");
    let methods: Vec<&str> = json["methods"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["type"].as_str().unwrap())
        .collect();
    assert_eq!(methods, vec!["question", "file"]);
    // 16-byte salt, base32 encoded.
    let salt = json["server_salt"].as_str().unwrap();
    assert_eq!(base32::decode(salt).unwrap().len(), 16);
}

#[tokio::test]
async fn banner_and_agpl_redirect() {
    let env = test_env("EUR:0", "EUR:0", "EUR:0").await;
    let (status, _, body) = send(
        &env,
        Request::builder().uri("/").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(String::from_utf8(body).unwrap().contains("Anastasis"));

    let (status, headers, _) = send(
        &env,
        Request::builder().uri("/agpl").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::FOUND);
    assert!(headers.contains_key("location"));
}

// ── Policy surface ────────────────────────────────────────────────────────────

#[tokio::test]
async fn malformed_account_is_rejected() {
    let env = test_env("EUR:0", "EUR:0", "EUR:0").await;
    let (status, _, _) = send(
        &env,
        Request::builder()
            .uri("/policy/not-base32-!!!")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unknown_account_is_404() {
    let env = test_env("EUR:0", "EUR:0", "EUR:0").await;
    let kp = keypair();
    let (status, _, _) = send(
        &env,
        Request::builder()
            .uri(format!("/policy/{}", kp.public()))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn bad_signature_is_403() {
    let env = test_env("EUR:0", "EUR:0", "EUR:0").await;
    let kp = keypair();
    let document = b"Test-1";
    let hash = HashCode::from_bytes(sha2::Sha512::digest(document).into());
    // Signature over a different hash.
    let sig = kp.sign_policy_upload(&HashCode::from_bytes([1u8; 64]));
    let req = Request::builder()
        .method("POST")
        .uri(format!("/policy/{}", kp.public()))
        .header("content-length", document.len())
        .header("if-none-match", hash.to_string())
        .header("anastasis-policy-signature", sig.to_string())
        .body(Body::from(document.to_vec()))
        .unwrap();
    let (status, _, _) = send(&env, req).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn free_policy_upload_and_download() {
    let env = test_env("EUR:0", "EUR:0", "EUR:0").await;
    let kp = keypair();
    let document = b"Test-1";

    let (status, headers, _) = send(&env, policy_post_request(&kp, document, None)).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert_eq!(headers.get("anastasis-version").unwrap(), "1");
    assert!(headers.contains_key("anastasis-policy-expiration"));

    // Hash mismatch between promise and body is rejected.
    let hash = HashCode::from_bytes(sha2::Sha512::digest(b"other").into());
    let sig = kp.sign_policy_upload(&hash);
    let req = Request::builder()
        .method("POST")
        .uri(format!("/policy/{}", kp.public()))
        .header("content-length", document.len())
        .header("if-none-match", hash.to_string())
        .header("anastasis-policy-signature", sig.to_string())
        .body(Body::from(document.to_vec()))
        .unwrap();
    let (status, _, _) = send(&env, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // Download with matching ETag → 304.
    let hash = HashCode::from_bytes(sha2::Sha512::digest(document).into());
    let (status, _, _) = send(
        &env,
        Request::builder()
            .uri(format!("/policy/{}", kp.public()))
            .header("if-none-match", hash.to_string())
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_MODIFIED);

    // Plain download returns the body with signature and version.
    let (status, headers, body) = send(
        &env,
        Request::builder()
            .uri(format!("/policy/{}", kp.public()))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, document);
    assert_eq!(headers.get("anastasis-version").unwrap(), "1");
    assert!(headers.contains_key("anastasis-policy-signature"));
    assert_eq!(
        headers.get("etag").unwrap().to_str().unwrap(),
        hash.to_string()
    );

    // Idempotent re-upload: 304, version unchanged.
    let (status, headers, _) = send(&env, policy_post_request(&kp, document, None)).await;
    assert_eq!(status, StatusCode::NOT_MODIFIED);
    assert_eq!(headers.get("anastasis-version").unwrap(), "1");

    // Distinct upload: version 2.
    let (status, headers, _) = send(&env, policy_post_request(&kp, b"Test-2", None)).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert_eq!(headers.get("anastasis-version").unwrap(), "2");
}

#[tokio::test]
async fn paid_policy_upload_requires_and_accepts_payment() {
    let env = test_env("EUR:4.99", "EUR:0", "EUR:0").await;
    let kp = keypair();
    let document = b"Test-1";

    // First attempt: 402 with a Taler pay URI.
    let (status, headers, _) = send(&env, policy_post_request(&kp, document, None)).await;
    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
    let order_id = order_id_from_taler_header(&headers);

    // Unpaid retry with the same payment identifier stays 402.
    let (status, _, _) =
        send(&env, policy_post_request(&kp, document, Some(&order_id))).await;
    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);

    // Pay the order, retry: 204.
    env.merchant.pay(&order_id);
    let (status, headers, _) =
        send(&env, policy_post_request(&kp, document, Some(&order_id))).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert_eq!(headers.get("anastasis-version").unwrap(), "1");
}

// ── Truth surface ─────────────────────────────────────────────────────────────

struct QuestionTruth {
    uuid: TruthUuid,
    truth_key: TruthKey,
    answer_hash: [u8; 64],
}

async fn upload_question_truth(env: &TestEnv) -> QuestionTruth {
    let uuid = TruthUuid::random();
    let truth_key = TruthKey::random();
    let answer_hash: [u8; 64] = sha2::Sha512::digest(b"The-Answer").into();
    let encrypted_truth = truth_encrypt(&truth_key, &answer_hash);
    let body = serde_json::json!({
        "key_share_data": base32::encode(&[7u8; 72]),
        "type": "question",
        "encrypted_truth": base32::encode(&encrypted_truth),
        "truth_mime": "binary/sha512",
        "storage_duration_years": 1,
    });
    let (status, _, _) = send(
        env,
        Request::builder()
            .method("POST")
            .uri(format!("/truth/{uuid}"))
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    QuestionTruth {
        uuid,
        truth_key,
        answer_hash,
    }
}

fn keyshare_get_request(
    truth: &QuestionTruth,
    response: Option<&str>,
    payment: Option<&str>,
) -> Request<Body> {
    let uri = match response {
        Some(r) => format!("/truth/{}?response={r}", truth.uuid),
        None => format!("/truth/{}", truth.uuid),
    };
    let mut builder = Request::builder()
        .uri(uri)
        .header("anastasis-truth-decryption-key", truth.truth_key.to_string());
    if let Some(ps) = payment {
        builder = builder.header("anastasis-payment-identifier", ps);
    }
    builder.body(Body::empty()).unwrap()
}

#[tokio::test]
async fn question_truth_answer_flow() {
    let env = test_env("EUR:0", "EUR:0", "EUR:0").await;
    let truth = upload_question_truth(&env).await;

    // Unknown truth is 404.
    let (status, _, _) = send(
        &env,
        Request::builder()
            .uri(format!("/truth/{}", TruthUuid::random()))
            .header(
                "anastasis-truth-decryption-key",
                truth.truth_key.to_string(),
            )
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // Missing response → 403.
    let (status, _, _) = send(&env, keyshare_get_request(&truth, None, None)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    // Wrong decryption key → 417.
    let wrong_key = TruthKey::random();
    let right = HashCode::from_bytes(truth.answer_hash).to_string();
    let (status, _, _) = send(
        &env,
        Request::builder()
            .uri(format!("/truth/{}?response={right}", truth.uuid))
            .header("anastasis-truth-decryption-key", wrong_key.to_string())
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::EXPECTATION_FAILED);

    // Wrong answer → 403.
    let wrong = HashCode::from_bytes(sha2::Sha512::digest(b"Wrong-Answer").into()).to_string();
    let (status, _, _) = send(&env, keyshare_get_request(&truth, Some(&wrong), None)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    // Right answer → 200 with the 72-byte share.
    let (status, _, body) = send(&env, keyshare_get_request(&truth, Some(&right), None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.len(), 72);
    assert_eq!(body, [7u8; 72]);
}

#[tokio::test]
async fn question_truth_rate_limits_after_retries() {
    let env = test_env("EUR:0", "EUR:0", "EUR:0").await;
    let truth = upload_question_truth(&env).await;
    let wrong = HashCode::from_bytes(sha2::Sha512::digest(b"Wrong-Answer").into()).to_string();

    // One free attempt plus the retry budget, then 429.
    for _ in 0..4 {
        let (status, _, _) = send(&env, keyshare_get_request(&truth, Some(&wrong), None)).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }
    let (status, _, _) = send(&env, keyshare_get_request(&truth, Some(&wrong), None)).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);

    // Even the right answer is rate limited now.
    let right = HashCode::from_bytes(truth.answer_hash).to_string();
    let (status, _, _) = send(&env, keyshare_get_request(&truth, Some(&right), None)).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn truth_upload_is_idempotent_but_conflicts_on_change() {
    let env = test_env("EUR:0", "EUR:0", "EUR:0").await;
    let uuid = TruthUuid::random();
    let make_body = |enc: &str| {
        serde_json::json!({
            "key_share_data": base32::encode(&[9u8; 72]),
            "type": "question",
            "encrypted_truth": enc,
            "storage_duration_years": 1,
        })
    };
    let post = |body: serde_json::Value| {
        Request::builder()
            .method("POST")
            .uri(format!("/truth/{uuid}"))
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap()
    };

    let enc = base32::encode(b"ciphertext");
    let (status, _, _) = send(&env, post(make_body(&enc))).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    // Identical upload: idempotent 204.
    let (status, _, _) = send(&env, post(make_body(&enc))).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    // Any differing field: 409.
    let other = base32::encode(b"different ciphertext");
    let (status, _, _) = send(&env, post(make_body(&other))).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn unsupported_method_is_rejected_at_upload() {
    let env = test_env("EUR:0", "EUR:0", "EUR:0").await;
    let uuid = TruthUuid::random();
    let body = serde_json::json!({
        "key_share_data": base32::encode(&[9u8; 72]),
        "type": "sms",
        "encrypted_truth": base32::encode(b"x"),
        "storage_duration_years": 1,
    });
    let (status, _, _) = send(
        &env,
        Request::builder()
            .method("POST")
            .uri(format!("/truth/{uuid}"))
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn file_challenge_with_payment_and_code() {
    let env = test_env("EUR:0", "EUR:0", "EUR:0").await;
    let dir = tempfile::tempdir().unwrap();
    let challenge_path = dir.path().join("challenge-code");

    // Upload a file-method truth whose plaintext is the target path.
    let uuid = TruthUuid::random();
    let truth_key = TruthKey::random();
    let encrypted_truth = truth_encrypt(
        &truth_key,
        challenge_path.to_str().unwrap().as_bytes(),
    );
    let body = serde_json::json!({
        "key_share_data": base32::encode(&[3u8; 72]),
        "type": "file",
        "encrypted_truth": base32::encode(&encrypted_truth),
        "storage_duration_years": 1,
    });
    let (status, _, _) = send(
        &env,
        Request::builder()
            .method("POST")
            .uri(format!("/truth/{uuid}"))
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    // Challenge without payment: 402 (the file method costs EUR:1).
    let get_no_response = |payment: Option<String>| {
        let mut builder = Request::builder()
            .uri(format!("/truth/{uuid}"))
            .header("anastasis-truth-decryption-key", truth_key.to_string());
        if let Some(ps) = payment {
            builder = builder.header("anastasis-payment-identifier", ps);
        }
        builder.body(Body::empty()).unwrap()
    };
    let (status, headers, _) = send(&env, get_no_response(None)).await;
    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
    let order_id = order_id_from_taler_header(&headers);

    // Pay, then request the challenge: instructions with the filename,
    // and the code lands in the file.
    env.merchant.pay(&order_id);
    let (status, _, body) = send(&env, get_no_response(Some(order_id.clone()))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(
        json["filename"].as_str().unwrap(),
        challenge_path.to_str().unwrap()
    );
    let code: u64 = std::fs::read_to_string(&challenge_path)
        .unwrap()
        .trim()
        .parse()
        .unwrap();

    // Submit the hashed code: the key share is released.
    let response = hash_answer(code).to_string();
    let req = Request::builder()
        .uri(format!("/truth/{uuid}?response={response}"))
        .header("anastasis-truth-decryption-key", truth_key.to_string())
        .header("anastasis-payment-identifier", order_id.clone())
        .body(Body::empty())
        .unwrap();
    let (status, _, body) = send(&env, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.len(), 72);
    assert_eq!(body, [3u8; 72]);
    assert_eq!(env.merchant.refund_count(), 0);
}

#[tokio::test]
async fn email_challenge_delivers_code_and_rate_limits_retransmission() {
    let dir = tempfile::tempdir().unwrap();
    let mailbox = dir.path().join("mailbox");

    // Wire the email method to `cat > mailbox` instead of a real MTA.
    let (addr, merchant) = spawn_mock_merchant().await;
    let cfg: ProviderConfig = serde_json::from_value(serde_json::json!({
        "listen_addr": "127.0.0.1:0",
        "data_dir": dir.path().join("db"),
        "business_name": "Test Provider",
        "currency": "EUR",
        "annual_fee": "EUR:0",
        "truth_upload_fee": "EUR:0",
        "question_cost": "EUR:0",
        "insurance": "EUR:1000",
        "upload_limit_mb": 1,
        "server_salt": "test-salt",
        "fulfillment_url": "taler://fulfillment-success/",
        "merchant": { "payment_backend_url": format!("http://{addr}/") },
        "authorization": {
            "email": {
                "enabled": true,
                "cost": "EUR:0",
                "command": format!("cat > {}", mailbox.display()),
            }
        }
    }))
    .unwrap();
    let ctx = Arc::new(ServiceContext::new(cfg).unwrap());
    let _tasks = spawn_background_tasks(&ctx);
    let env = TestEnv {
        router: build_router(Arc::clone(&ctx)),
        _ctx: ctx,
        merchant,
        _dir: dir,
    };

    // Store an email truth.
    let uuid = TruthUuid::random();
    let truth_key = TruthKey::random();
    let encrypted_truth = truth_encrypt(&truth_key, b"user@example.com");
    let body = serde_json::json!({
        "key_share_data": base32::encode(&[5u8; 72]),
        "type": "email",
        "encrypted_truth": base32::encode(&encrypted_truth),
        "storage_duration_years": 1,
    });
    let (status, _, _) = send(
        &env,
        Request::builder()
            .method("POST")
            .uri(format!("/truth/{uuid}"))
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    // First challenge request transmits the code.
    let get = |response: Option<String>| {
        let uri = match response {
            Some(r) => format!("/truth/{uuid}?response={r}"),
            None => format!("/truth/{uuid}"),
        };
        Request::builder()
            .uri(uri)
            .header("anastasis-truth-decryption-key", truth_key.to_string())
            .body(Body::empty())
            .unwrap()
    };
    let (status, _, body) = send(&env, get(None)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["method"], "email");
    assert_eq!(json["destination"], "us…@example.com");
    let mail = std::fs::read_to_string(&mailbox).unwrap();
    let code: u64 = mail
        .split("A-")
        .nth(1)
        .and_then(|s| s.get(..8))
        .unwrap()
        .parse()
        .unwrap();

    // Asking again right away is already reported.
    let (status, _, _) = send(&env, get(None)).await;
    assert_eq!(status, StatusCode::ALREADY_REPORTED);

    // The transmitted code unlocks the key share.
    let (status, _, body) = send(&env, get(Some(hash_answer(code).to_string()))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, [5u8; 72]);

    // A wrong code is rejected.
    let (status, _, _) =
        send(&env, get(Some(hash_answer(code + 1).to_string()))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn merchant_failure_surfaces_as_bad_gateway() {
    // Point the provider at a dead backend.
    let dir = tempfile::tempdir().unwrap();
    let cfg: ProviderConfig = serde_json::from_value(serde_json::json!({
        "listen_addr": "127.0.0.1:0",
        "data_dir": dir.path().join("db"),
        "business_name": "Test Provider",
        "currency": "EUR",
        "annual_fee": "EUR:4.99",
        "truth_upload_fee": "EUR:0",
        "question_cost": "EUR:0",
        "insurance": "EUR:1000",
        "upload_limit_mb": 1,
        "server_salt": "test-salt",
        "fulfillment_url": "taler://fulfillment-success/",
        "merchant": { "payment_backend_url": "http://127.0.0.1:1/" },
        "authorization": {}
    }))
    .unwrap();
    let ctx = Arc::new(ServiceContext::new(cfg).unwrap());
    let _tasks = spawn_background_tasks(&ctx);
    let router = build_router(Arc::clone(&ctx));

    let kp = keypair();
    let resp = router
        .oneshot(policy_post_request(&kp, b"Test-1", None))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
}

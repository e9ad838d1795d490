//! HTTP client mirroring the provider protocol.

use std::time::Duration;

use serde::Deserialize;
use sha2::{Digest, Sha512};
use tracing::debug;

use anastasis_core::{
    base32, AccountPublicKey, AccountSignature, Amount, EncryptedKeyShare, HashCode,
    PaymentSecret, ProviderSalt, TruthKey, TruthUuid,
};
use anastasis_crypto::{verify_policy_upload, AccountKeyPair};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("transport failure: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected status {status}")]
    Protocol {
        status: u16,
        body: Option<serde_json::Value>,
    },

    #[error("reply malformed: {0}")]
    Malformed(String),

    #[error("provider signature invalid")]
    BadSignature,
}

/// The `/config` advertisement of a provider.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderInfo {
    pub name: String,
    pub version: String,
    pub business_name: String,
    pub currency: String,
    pub methods: Vec<MethodInfo>,
    pub storage_limit_in_megabytes: u64,
    pub annual_fee: Amount,
    pub truth_upload_fee: Amount,
    pub liability_limit: Amount,
    pub server_salt: ProviderSalt,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MethodInfo {
    #[serde(rename = "type")]
    pub method: String,
    pub cost: Amount,
}

#[derive(Debug)]
pub enum PolicyLookupResult {
    Document {
        document: Vec<u8>,
        version: u32,
        hash: HashCode,
        signature: AccountSignature,
    },
    NotModified,
    /// Account exists but holds no document.
    Empty,
    NotFound,
}

#[derive(Debug)]
pub enum PolicyStoreResult {
    Success {
        version: u32,
        expiration: i64,
    },
    NotModified {
        version: u32,
    },
    PaymentRequired {
        payment_secret: PaymentSecret,
        pay_uri: String,
    },
}

#[derive(Debug)]
pub enum TruthStoreResult {
    Success,
    PaymentRequired {
        payment_secret: PaymentSecret,
        pay_uri: String,
    },
    Conflict,
}

#[derive(Debug)]
pub enum KeyShareResult {
    /// Authentication succeeded.
    Share(EncryptedKeyShare),
    PaymentRequired {
        payment_secret: PaymentSecret,
        pay_uri: String,
    },
    /// Challenge instructions or rejection from the provider (403).
    Instructions { body: Option<serde_json::Value> },
    /// Challenge already transmitted recently (208).
    AlreadyTransmitted,
    RateLimited,
    /// The decryption key did not fit the stored truth (417).
    DecryptionFailed,
    NotFound,
    Gone,
}

pub struct ProviderClient {
    http: reqwest::Client,
    base_url: String,
}

impl ProviderClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub async fn get_config(&self) -> Result<ProviderInfo, ClientError> {
        let resp = self.http.get(self.url("/config")).send().await?;
        if !resp.status().is_success() {
            return Err(protocol_error(resp).await);
        }
        resp.json::<ProviderInfo>()
            .await
            .map_err(|e| ClientError::Malformed(e.to_string()))
    }

    /// Download the recovery document (latest, or a specific version),
    /// verifying the provider-returned signature before returning it.
    pub async fn policy_lookup(
        &self,
        account: &AccountPublicKey,
        if_none_match: Option<&HashCode>,
        version: Option<u32>,
    ) -> Result<PolicyLookupResult, ClientError> {
        let mut rb = self.http.get(self.url(&format!("/policy/{account}")));
        if let Some(hash) = if_none_match {
            rb = rb.header(reqwest::header::IF_NONE_MATCH, hash.to_string());
        }
        if let Some(v) = version {
            rb = rb.query(&[("version", v.to_string())]);
        }
        let resp = rb.send().await?;
        match resp.status().as_u16() {
            200 => {
                let signature: AccountSignature =
                    require_header(&resp, "anastasis-policy-signature")?;
                let version: u32 = require_header(&resp, "anastasis-version")?;
                let hash: HashCode = require_header(&resp, "etag")?;
                let document = resp.bytes().await?.to_vec();
                let actual = HashCode::from_bytes(Sha512::digest(&document).into());
                if actual != hash {
                    return Err(ClientError::Malformed("ETag does not match body".into()));
                }
                verify_policy_upload(account, &hash, &signature)
                    .map_err(|_| ClientError::BadSignature)?;
                Ok(PolicyLookupResult::Document {
                    document,
                    version,
                    hash,
                    signature,
                })
            }
            204 => Ok(PolicyLookupResult::Empty),
            304 => Ok(PolicyLookupResult::NotModified),
            404 => Ok(PolicyLookupResult::NotFound),
            _ => Err(protocol_error(resp).await),
        }
    }

    /// Upload a recovery document, optionally naming a payment and a
    /// desired coverage in years.
    pub async fn policy_store(
        &self,
        keypair: &AccountKeyPair,
        document: &[u8],
        payment: Option<&PaymentSecret>,
        storage_years: Option<u32>,
        timeout: Option<Duration>,
    ) -> Result<PolicyStoreResult, ClientError> {
        let hash = HashCode::from_bytes(Sha512::digest(document).into());
        let signature = keypair.sign_policy_upload(&hash);
        let account = keypair.public();
        let mut rb = self
            .http
            .post(self.url(&format!("/policy/{account}")))
            .header(reqwest::header::IF_NONE_MATCH, hash.to_string())
            .header("anastasis-policy-signature", signature.to_string())
            .body(document.to_vec());
        if let Some(ps) = payment {
            rb = rb.header("anastasis-payment-identifier", ps.to_string());
        }
        let mut query: Vec<(String, String)> = Vec::new();
        if let Some(years) = storage_years {
            query.push(("storage_duration".into(), years.to_string()));
        }
        if let Some(t) = timeout {
            query.push(("timeout_ms".into(), t.as_millis().to_string()));
            rb = rb.timeout(t + Duration::from_secs(30));
        }
        if !query.is_empty() {
            rb = rb.query(&query);
        }
        debug!(account = %account, bytes = document.len(), "storing policy");
        let resp = rb.send().await?;
        match resp.status().as_u16() {
            204 => Ok(PolicyStoreResult::Success {
                version: require_header(&resp, "anastasis-version")?,
                expiration: require_header(&resp, "anastasis-policy-expiration")?,
            }),
            304 => Ok(PolicyStoreResult::NotModified {
                version: require_header(&resp, "anastasis-version")?,
            }),
            402 => payment_details(&resp).map(|(payment_secret, pay_uri)| {
                PolicyStoreResult::PaymentRequired {
                    payment_secret,
                    pay_uri,
                }
            }),
            _ => Err(protocol_error(resp).await),
        }
    }

    /// Upload a truth object.
    #[allow(clippy::too_many_arguments)]
    pub async fn truth_store(
        &self,
        uuid: &TruthUuid,
        key_share_data: &EncryptedKeyShare,
        method: &str,
        encrypted_truth: &[u8],
        truth_mime: Option<&str>,
        storage_years: u32,
        payment: Option<&PaymentSecret>,
    ) -> Result<TruthStoreResult, ClientError> {
        let body = serde_json::json!({
            "key_share_data": key_share_data,
            "type": method,
            "encrypted_truth": base32::encode(encrypted_truth),
            "truth_mime": truth_mime,
            "storage_duration_years": storage_years,
        });
        let mut rb = self
            .http
            .post(self.url(&format!("/truth/{uuid}")))
            .json(&body);
        if let Some(ps) = payment {
            rb = rb.header("anastasis-payment-identifier", ps.to_string());
        }
        let resp = rb.send().await?;
        match resp.status().as_u16() {
            204 => Ok(TruthStoreResult::Success),
            402 => payment_details(&resp).map(|(payment_secret, pay_uri)| {
                TruthStoreResult::PaymentRequired {
                    payment_secret,
                    pay_uri,
                }
            }),
            409 => Ok(TruthStoreResult::Conflict),
            _ => Err(protocol_error(resp).await),
        }
    }

    /// Attempt to obtain the encrypted key share behind a truth.
    pub async fn keyshare_lookup(
        &self,
        uuid: &TruthUuid,
        truth_key: &TruthKey,
        payment: Option<&PaymentSecret>,
        response: Option<&HashCode>,
        timeout: Option<Duration>,
    ) -> Result<KeyShareResult, ClientError> {
        let mut rb = self
            .http
            .get(self.url(&format!("/truth/{uuid}")))
            .header("anastasis-truth-decryption-key", truth_key.to_string());
        if let Some(ps) = payment {
            rb = rb.header("anastasis-payment-identifier", ps.to_string());
        }
        let mut query: Vec<(String, String)> = Vec::new();
        if let Some(r) = response {
            query.push(("response".into(), r.to_string()));
        }
        if let Some(t) = timeout {
            query.push(("timeout_ms".into(), t.as_millis().to_string()));
            rb = rb.timeout(t + Duration::from_secs(30));
        }
        if !query.is_empty() {
            rb = rb.query(&query);
        }
        let resp = rb.send().await?;
        match resp.status().as_u16() {
            200 => {
                let bytes = resp.bytes().await?;
                let arr: [u8; 72] = bytes.as_ref().try_into().map_err(|_| {
                    ClientError::Malformed(format!("key share of {} bytes", bytes.len()))
                })?;
                Ok(KeyShareResult::Share(EncryptedKeyShare::from_bytes(arr)))
            }
            208 => Ok(KeyShareResult::AlreadyTransmitted),
            402 => payment_details(&resp).map(|(payment_secret, pay_uri)| {
                KeyShareResult::PaymentRequired {
                    payment_secret,
                    pay_uri,
                }
            }),
            403 => Ok(KeyShareResult::Instructions {
                body: resp.json().await.ok(),
            }),
            404 => Ok(KeyShareResult::NotFound),
            410 => Ok(KeyShareResult::Gone),
            417 => Ok(KeyShareResult::DecryptionFailed),
            429 => Ok(KeyShareResult::RateLimited),
            _ => Err(protocol_error(resp).await),
        }
    }
}

fn require_header<T: std::str::FromStr>(
    resp: &reqwest::Response,
    name: &str,
) -> Result<T, ClientError> {
    resp.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim_matches('"').parse().ok())
        .ok_or_else(|| ClientError::Malformed(format!("header {name} missing or malformed")))
}

/// Extract payment secret and pay URI from a 402 reply's `Taler:`
/// header (`taler[+http]://pay/$HOST/$ORDER_ID/`).
fn payment_details(resp: &reqwest::Response) -> Result<(PaymentSecret, String), ClientError> {
    let uri = resp
        .headers()
        .get("taler")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ClientError::Malformed("402 reply without Taler header".into()))?
        .to_string();
    let order = uri
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or_default();
    let payment_secret = order
        .parse()
        .map_err(|_| ClientError::Malformed(format!("order id `{order}` not a payment secret")))?;
    Ok((payment_secret, uri))
}

async fn protocol_error(resp: reqwest::Response) -> ClientError {
    let status = resp.status().as_u16();
    let body = resp.json().await.ok();
    ClientError::Protocol { status, body }
}

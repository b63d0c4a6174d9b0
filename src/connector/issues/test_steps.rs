//! Test-management API: per-request JWT signing and test step lookup.
//!
//! Each request carries an HS256 token whose `qsh` claim is the SHA-256 of
//! `METHOD&path&canonical-query`, where `path` is relative to the API base
//! URL. Tokens are valid for one hour.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

use crate::fetch::{ApiClient, FetchError, RetryPolicy};

type HmacSha256 = Hmac<Sha256>;

/// Token lifetime in seconds.
pub const TOKEN_TTL_SECS: i64 = 3600;

/// Header carrying the access key next to the token.
pub const ACCESS_KEY_HEADER: &str = "zapiaccesskey";

/// Errors raised while signing a request.
#[derive(Debug, Error)]
pub enum SigningError {
    /// The secret key was rejected by the MAC.
    #[error("secret key rejected for signing")]
    Key,

    /// A token segment could not be encoded.
    #[error("failed to encode token segment: {0}")]
    Encode(#[from] serde_json::Error),

    /// The signed token is not a valid header value.
    #[error("signed token is not a valid header value")]
    Header,
}

/// One step of a test case.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestStep {
    #[serde(default)]
    pub order_id: i64,
    pub step: Option<String>,
    pub data: Option<String>,
    pub result: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StepsResponse {
    Bare(Vec<TestStep>),
    Wrapped {
        #[serde(rename = "testSteps", default)]
        test_steps: Vec<TestStep>,
    },
}

#[derive(Debug, Serialize)]
struct Header<'a> {
    alg: &'a str,
    typ: &'a str,
}

/// JWT claims for one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Claims {
    pub sub: String,
    pub qsh: String,
    pub iss: String,
    pub iat: i64,
    pub exp: i64,
}

/// Credentials for the test-management API.
#[derive(Clone)]
pub struct SigningKeys {
    pub account_id: String,
    pub access_key: String,
    pub secret_key: String,
}

impl std::fmt::Debug for SigningKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKeys")
            .field("account_id", &self.account_id)
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .finish()
    }
}

/// `METHOD&path&query` as hashed into the `qsh` claim.
#[must_use]
pub fn canonical_request(method: &str, path: &str, query: &str) -> String {
    format!("{}&{path}&{query}", method.to_ascii_uppercase())
}

/// Hex SHA-256 of the canonical request.
#[must_use]
pub fn query_string_hash(method: &str, path: &str, query: &str) -> String {
    hex_sha256(canonical_request(method, path, query).as_bytes())
}

/// Builds an HS256 token for `claims`.
///
/// # Errors
///
/// [`SigningError`] when a segment cannot be encoded.
pub fn sign_token(claims: &Claims, secret: &str) -> Result<String, SigningError> {
    let header = Header {
        alg: "HS256",
        typ: "JWT",
    };
    let header = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header)?);
    let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims)?);
    let unsigned = format!("{header}.{payload}");

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| SigningError::Key)?;
    mac.update(unsigned.as_bytes());
    let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
    Ok(format!("{unsigned}.{signature}"))
}

fn hex_sha256(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Test step lookups against one test-management API.
#[derive(Debug, Clone)]
pub struct TestStepApi {
    client: ApiClient,
    retry: RetryPolicy,
    base_url: String,
    keys: SigningKeys,
}

impl TestStepApi {
    /// Wraps an unbound client; `base_url` may carry a path prefix.
    #[must_use]
    pub fn new(client: ApiClient, retry: RetryPolicy, base_url: &str, keys: SigningKeys) -> Self {
        Self {
            client,
            retry,
            base_url: base_url.trim_end_matches('/').to_string(),
            keys,
        }
    }

    /// Signed headers for a GET of `path?query`, issued at `now` (unix seconds).
    ///
    /// # Errors
    ///
    /// [`SigningError`] when the token cannot be built.
    pub fn signed_headers(
        &self,
        path: &str,
        query: &str,
        now: i64,
    ) -> Result<HeaderMap, SigningError> {
        let claims = Claims {
            sub: self.keys.account_id.clone(),
            qsh: query_string_hash("GET", path, query),
            iss: self.keys.access_key.clone(),
            iat: now,
            exp: now + TOKEN_TTL_SECS,
        };
        let token = sign_token(&claims, &self.keys.secret_key)?;

        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("JWT {token}")).map_err(|_| SigningError::Header)?,
        );
        headers.insert(
            ACCESS_KEY_HEADER,
            HeaderValue::from_str(&self.keys.access_key).map_err(|_| SigningError::Header)?,
        );
        Ok(headers)
    }

    /// Test steps of an issue sorted by `orderId`.
    ///
    /// A fresh token is signed for every attempt.
    ///
    /// # Errors
    ///
    /// [`FetchError`] after retries are exhausted, or a signing failure
    /// reported as [`FetchError::MalformedResponse`].
    pub async fn steps(&self, issue_id: &str, project_id: &str) -> Result<Vec<TestStep>, FetchError> {
        let path = format!("/public/rest/api/1.0/teststep/{issue_id}");
        let query = format!("projectId={}", urlencoding::encode(project_id));
        let url = format!("{}{path}?{query}", self.base_url);

        let response: StepsResponse = self
            .retry
            .run("test steps", || async {
                let headers = self
                    .signed_headers(&path, &query, chrono::Utc::now().timestamp())
                    .map_err(|e| FetchError::malformed(url.as_str(), e.to_string()))?;
                self.client.get_json_with_headers(&url, headers).await
            })
            .await?;

        let mut steps = match response {
            StepsResponse::Wrapped { test_steps } => test_steps,
            StepsResponse::Bare(steps) => steps,
        };
        steps.sort_by_key(|s| s.order_id);
        debug!(issue_id, steps = steps.len(), "test steps fetched");
        Ok(steps)
    }
}

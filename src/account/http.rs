//! Account API client over HTTP/JSON.
//!
//! Authenticates with an account id, access key and secret, caches the
//! bearer token until shortly before it expires and re-authenticates once
//! when a request comes back `401`.  Error responses are decoded from their
//! JSON body into an [`AccountError`].
//!
//! Endpoints, relative to the configured base URL:
//!   `POST   /auth/token`
//!   `POST   /permissions`, `GET|PUT|DELETE /permissions/{id}`
//!   `POST   /service-accounts`, `GET|PUT|DELETE /service-accounts/{id}`
//!   `PUT|DELETE /service-accounts/{id}/enabled`

use std::sync::Mutex;
use std::time::{Duration, Instant};

use bytes::Bytes;
use percent_encoding::{utf8_percent_encode, AsciiSet, PercentEncode, NON_ALPHANUMERIC};
use reqwest::header::ACCEPT;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::api::{
    AccountApi, AccountFuture, AccountResult, PermissionInput, PermissionRecord,
    ServiceAccountCreated, ServiceAccountInput, ServiceAccountRecord,
};
use crate::errors::{codes, AccountError};
use crate::metrics::REMOTE_CALLS_TOTAL;

/// Tokens are refreshed this long before the server-side expiry.
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// Lifetime assumed when the token response carries none.
const DEFAULT_TOKEN_LIFETIME_SECS: u64 = 3600;

/// Credentials exchanged for a bearer token.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountCredentials {
    pub account_id: String,
    pub access_key: String,
    pub secret: String,
}

/// Token endpoint response.  `expirationSec` arrives as a string or a number.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenResponse {
    #[serde(default)]
    token: String,
    #[serde(default)]
    expiration_sec: Option<serde_json::Value>,
}

/// JSON error body.
#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CreatedId {
    id: String,
}

/// Cached bearer token with expiry.
struct CachedToken {
    token: String,
    expiry: Instant,
}

/// HTTP implementation of [`AccountApi`].
pub struct HttpAccountClient {
    /// HTTP client for account API calls.
    client: reqwest::Client,
    /// Base URL without a trailing slash.
    base_url: String,
    /// Credentials for the token exchange.
    credentials: AccountCredentials,
    /// Cached bearer token.
    token_cache: Mutex<Option<CachedToken>>,
}

impl HttpAccountClient {
    /// Create a client.  No request is made until the first call.
    pub fn new(
        base_url: &str,
        credentials: AccountCredentials,
        timeout: Duration,
    ) -> Result<Self, AccountError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AccountError::new(codes::TRANSPORT, None, format!("building HTTP client: {e}")))?;

        info!(base_url, account_id = %credentials.account_id, "account API client initialized");

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            credentials,
            token_cache: Mutex::new(None),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Exchange the credentials for a bearer token.
    ///
    /// A missing, empty or `null` response body is an error; no token is
    /// guessed.
    pub async fn authenticate(&self) -> AccountResult<String> {
        debug!(account_id = %self.credentials.account_id, "authenticating");
        let resp = self
            .client
            .post(self.url("/auth/token"))
            .header(ACCEPT, "application/json")
            .json(&self.credentials)
            .send()
            .await
            .map_err(transport)?;
        let status = resp.status();
        let body = resp.bytes().await.map_err(transport)?;
        record_call("authenticate", status);

        if !status.is_success() {
            return Err(decode_error(status, &body, codes::UNAUTHORIZED));
        }

        let parsed: Option<TokenResponse> = if body.iter().all(u8::is_ascii_whitespace) {
            None
        } else {
            serde_json::from_slice(&body).map_err(|e| malformed(status, format!("authentication response: {e}")))?
        };
        let Some(parsed) = parsed.filter(|t| !t.token.is_empty()) else {
            return Err(malformed(status, "authentication response carried no token".to_string()));
        };

        let lifetime = parsed
            .expiration_sec
            .as_ref()
            .and_then(|v| v.as_u64().or_else(|| v.as_str().and_then(|s| s.trim().parse().ok())))
            .unwrap_or(DEFAULT_TOKEN_LIFETIME_SECS);
        let expiry = Instant::now() + Duration::from_secs(lifetime).saturating_sub(TOKEN_EXPIRY_MARGIN);

        let mut cache = self.token_cache.lock().unwrap_or_else(|e| e.into_inner());
        *cache = Some(CachedToken {
            token: parsed.token.clone(),
            expiry,
        });
        Ok(parsed.token)
    }

    /// Cached token, authenticating when there is none or it expired.
    async fn token(&self) -> AccountResult<String> {
        {
            let cache = self.token_cache.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(ref cached) = *cache {
                if cached.expiry > Instant::now() {
                    return Ok(cached.token.clone());
                }
            }
        }
        self.authenticate().await
    }

    fn invalidate_token(&self) {
        let mut cache = self.token_cache.lock().unwrap_or_else(|e| e.into_inner());
        *cache = None;
    }

    /// Send an authenticated request and return the body of a successful
    /// response.  `not_found` is the code reported for a bare 404.
    async fn send(
        &self,
        operation: &'static str,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
        not_found: &'static str,
    ) -> AccountResult<Bytes> {
        let mut reauthenticated = false;
        loop {
            let token = self.token().await?;
            let mut request = self
                .client
                .request(method.clone(), self.url(path))
                .bearer_auth(&token)
                .header(ACCEPT, "application/json");
            if let Some(ref json) = body {
                request = request.json(json);
            }

            let resp = request.send().await.map_err(transport)?;
            let status = resp.status();
            let bytes = resp.bytes().await.map_err(transport)?;
            record_call(operation, status);

            if status == StatusCode::UNAUTHORIZED && !reauthenticated {
                warn!(operation, "bearer token rejected, re-authenticating");
                self.invalidate_token();
                reauthenticated = true;
                continue;
            }
            if status.is_success() {
                return Ok(bytes);
            }
            return Err(decode_error(status, &bytes, not_found));
        }
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        operation: &'static str,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
        not_found: &'static str,
    ) -> AccountResult<T> {
        let status_hint = StatusCode::OK;
        let bytes = self.send(operation, method, path, body, not_found).await?;
        serde_json::from_slice(&bytes).map_err(|e| malformed(status_hint, format!("{operation} response: {e}")))
    }
}

/// Encoding set for ids in a path segment: everything except unreserved
/// characters.
const SEGMENT_ENCODE_SET: AsciiSet = NON_ALPHANUMERIC.remove(b'-').remove(b'_').remove(b'.').remove(b'~');

fn segment(id: &str) -> PercentEncode<'_> {
    utf8_percent_encode(id, &SEGMENT_ENCODE_SET)
}

fn to_json<T: Serialize>(value: &T) -> AccountResult<serde_json::Value> {
    serde_json::to_value(value).map_err(|e| AccountError::new(codes::BAD_REQUEST, None, e.to_string()))
}

fn transport(err: reqwest::Error) -> AccountError {
    AccountError::new(codes::TRANSPORT, err.status().map(|s| s.as_u16()), err.to_string())
}

fn malformed(status: StatusCode, message: String) -> AccountError {
    AccountError::new(codes::MALFORMED_RESPONSE, Some(status.as_u16()), message)
}

fn record_call(operation: &'static str, status: StatusCode) {
    let outcome = if status.is_success() { "ok" } else { "error" };
    metrics::counter!(REMOTE_CALLS_TOTAL, "api" => "account", "operation" => operation, "outcome" => outcome)
        .increment(1);
}

/// Decode an error response.  The code is the body's `code`, else its
/// `message`, else one derived from the status.
fn decode_error(status: StatusCode, body: &[u8], not_found: &'static str) -> AccountError {
    let parsed: ErrorBody = serde_json::from_slice(body).unwrap_or_default();
    let text = String::from_utf8_lossy(body).trim().to_string();
    let message = parsed.message.clone().unwrap_or_else(|| text.clone());

    let code = match (parsed.code, parsed.message) {
        (Some(code), _) if !code.is_empty() => code,
        _ => match status {
            StatusCode::NOT_FOUND => not_found.to_string(),
            StatusCode::UNAUTHORIZED => codes::UNAUTHORIZED.to_string(),
            StatusCode::INTERNAL_SERVER_ERROR => codes::INTERNAL_ERROR.to_string(),
            StatusCode::SERVICE_UNAVAILABLE => codes::SERVICE_UNAVAILABLE.to_string(),
            StatusCode::TOO_MANY_REQUESTS => codes::TOO_MANY_REQUESTS.to_string(),
            _ if !message.is_empty() => message.clone(),
            _ => status.canonical_reason().unwrap_or("UnknownError").to_string(),
        },
    };
    AccountError::new(code, Some(status.as_u16()), message)
}

impl AccountApi for HttpAccountClient {
    fn create_permission<'a>(&'a self, input: &'a PermissionInput) -> AccountFuture<'a, String> {
        Box::pin(async move {
            let created: CreatedId = self
                .send_json(
                    "create_permission",
                    Method::POST,
                    "/permissions",
                    Some(to_json(input)?),
                    codes::PERMISSION_NOT_FOUND,
                )
                .await?;
            Ok(created.id)
        })
    }

    fn get_permission<'a>(&'a self, id: &'a str) -> AccountFuture<'a, PermissionRecord> {
        Box::pin(async move {
            self.send_json(
                "get_permission",
                Method::GET,
                &format!("/permissions/{}", segment(id)),
                None,
                codes::PERMISSION_NOT_FOUND,
            )
            .await
        })
    }

    fn update_permission<'a>(&'a self, id: &'a str, input: &'a PermissionInput) -> AccountFuture<'a, ()> {
        Box::pin(async move {
            self.send(
                "update_permission",
                Method::PUT,
                &format!("/permissions/{}", segment(id)),
                Some(to_json(input)?),
                codes::PERMISSION_NOT_FOUND,
            )
            .await?;
            Ok(())
        })
    }

    fn delete_permission<'a>(&'a self, id: &'a str) -> AccountFuture<'a, ()> {
        Box::pin(async move {
            self.send(
                "delete_permission",
                Method::DELETE,
                &format!("/permissions/{}", segment(id)),
                None,
                codes::PERMISSION_NOT_FOUND,
            )
            .await?;
            Ok(())
        })
    }

    fn create_service_account<'a>(
        &'a self,
        input: &'a ServiceAccountInput,
    ) -> AccountFuture<'a, ServiceAccountCreated> {
        Box::pin(async move {
            self.send_json(
                "create_service_account",
                Method::POST,
                "/service-accounts",
                Some(to_json(input)?),
                codes::SERVICE_ACCOUNT_NOT_FOUND,
            )
            .await
        })
    }

    fn get_service_account<'a>(&'a self, id: &'a str) -> AccountFuture<'a, ServiceAccountRecord> {
        Box::pin(async move {
            self.send_json(
                "get_service_account",
                Method::GET,
                &format!("/service-accounts/{}", segment(id)),
                None,
                codes::SERVICE_ACCOUNT_NOT_FOUND,
            )
            .await
        })
    }

    fn update_service_account<'a>(
        &'a self,
        id: &'a str,
        input: &'a ServiceAccountInput,
    ) -> AccountFuture<'a, ()> {
        Box::pin(async move {
            self.send(
                "update_service_account",
                Method::PUT,
                &format!("/service-accounts/{}", segment(id)),
                Some(to_json(input)?),
                codes::SERVICE_ACCOUNT_NOT_FOUND,
            )
            .await?;
            Ok(())
        })
    }

    fn enable_service_account<'a>(&'a self, id: &'a str) -> AccountFuture<'a, ()> {
        Box::pin(async move {
            self.send(
                "enable_service_account",
                Method::PUT,
                &format!("/service-accounts/{}/enabled", segment(id)),
                None,
                codes::SERVICE_ACCOUNT_NOT_FOUND,
            )
            .await?;
            Ok(())
        })
    }

    fn disable_service_account<'a>(&'a self, id: &'a str) -> AccountFuture<'a, ()> {
        Box::pin(async move {
            self.send(
                "disable_service_account",
                Method::DELETE,
                &format!("/service-accounts/{}/enabled", segment(id)),
                None,
                codes::SERVICE_ACCOUNT_NOT_FOUND,
            )
            .await?;
            Ok(())
        })
    }

    fn delete_service_account<'a>(&'a self, id: &'a str) -> AccountFuture<'a, ()> {
        Box::pin(async move {
            self.send(
                "delete_service_account",
                Method::DELETE,
                &format!("/service-accounts/{}", segment(id)),
                None,
                codes::SERVICE_ACCOUNT_NOT_FOUND,
            )
            .await?;
            Ok(())
        })
    }
}

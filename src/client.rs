//! HTTP client for pushing batches to the Loki push API.
//!
//! This module provides an async HTTP client with connection pooling,
//! credential handling (basic, bearer, bearer file, OAuth2 client
//! credentials), TLS and proxy settings, and the retry loop that applies
//! the configured backoff policy to each batch.

use std::fmt;
use std::path::Path;
use std::time::{Duration, Instant};

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::{Certificate, Client, Identity, Proxy, RequestBuilder};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};
use url::Url;

use crate::backoff::BackoffPolicy;
use crate::batch::Batch;
use crate::config::{AuthConfig, ClientConfig, OAuth2, TlsConfig, CLIENT_NAME};
use crate::error::{OpenError, PushError};

/// Header carrying the tenant in multi-tenant Loki deployments.
pub const TENANT_HEADER: HeaderName = HeaderName::from_static("x-scope-orgid");

/// Access tokens are refreshed this long before they expire.
const TOKEN_EXPIRY_DELTA: Duration = Duration::from_secs(10);

/// Longest response body kept in a [`PushError::Status`].
const MAX_ERROR_BODY: usize = 1024;

/// Why a batch was given up on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Server answered 429 and rate-limited batches are dropped
    RateLimited,
    /// The error cannot succeed on retry (4xx, bad credentials)
    NotRetryable,
    /// The backoff policy ran out of attempts
    RetriesExhausted,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DropReason::RateLimited => write!(f, "rate limited"),
            DropReason::NotRetryable => write!(f, "not retryable"),
            DropReason::RetriesExhausted => write!(f, "retries exhausted"),
        }
    }
}

/// A batch that could not be delivered.
#[derive(Debug, Error)]
#[error("batch dropped after {attempts} attempt(s), {reason}: {last_error}")]
pub struct BatchDropped {
    pub attempts: u32,
    pub reason: DropReason,
    #[source]
    pub last_error: PushError,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Debug)]
struct CachedToken {
    access_token: String,
    refresh_at: Option<Instant>,
}

impl CachedToken {
    fn is_fresh(&self) -> bool {
        self.refresh_at.map_or(true, |at| Instant::now() < at)
    }
}

/// Fetches and caches OAuth2 client-credentials access tokens.
#[derive(Debug)]
struct TokenSource {
    config: OAuth2,
    cached: Mutex<Option<CachedToken>>,
}

impl TokenSource {
    fn new(config: OAuth2) -> Self {
        Self {
            config,
            cached: Mutex::new(None),
        }
    }

    async fn token(&self, http: &Client) -> Result<String, PushError> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref().filter(|t| t.is_fresh()) {
            return Ok(token.access_token.clone());
        }

        let mut form: Vec<(&str, &str)> = vec![("grant_type", "client_credentials")];
        let scope = self.config.scopes.join(" ");
        if !scope.is_empty() {
            form.push(("scope", scope.as_str()));
        }
        for (key, value) in &self.config.endpoint_params {
            form.push((key.as_str(), value.as_str()));
        }

        debug!(token_url = %self.config.token_url, "Fetching OAuth2 access token");

        let response = http
            .post(&self.config.token_url)
            .basic_auth(&self.config.client_id, Some(self.config.client_secret.expose()))
            .form(&form)
            .send()
            .await
            .map_err(|e| PushError::Auth(format!("token request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PushError::Auth(format!("token endpoint returned {status}")));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| PushError::Auth(format!("invalid token response: {e}")))?;

        let refresh_at = token
            .expires_in
            .map(|secs| Instant::now() + Duration::from_secs(secs).saturating_sub(TOKEN_EXPIRY_DELTA));
        let access_token = token.access_token.clone();
        *cached = Some(CachedToken {
            access_token: token.access_token,
            refresh_at,
        });

        Ok(access_token)
    }
}

/// HTTP client for the Loki push API.
///
/// The client uses connection pooling (via reqwest's internal pool),
/// retries failed pushes following the configured backoff policy, and
/// respects the configured per-request timeout.
#[derive(Debug)]
pub struct PushClient {
    /// The underlying HTTP client (reused for connection pooling)
    client: Client,

    /// Push endpoint
    url: Url,

    /// Custom headers plus the ones the writer always sets
    headers: HeaderMap,

    auth: AuthConfig,

    oauth: Option<TokenSource>,

    timeout: Duration,

    backoff: BackoffPolicy,

    drop_rate_limited_batches: bool,
}

impl PushClient {
    /// Create a new push client with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns `OpenError::Client` if a header is not valid HTTP, a TLS file
    /// cannot be read or parsed, or the proxy URL is rejected.
    pub fn new(config: &ClientConfig) -> Result<Self, OpenError> {
        let mut builder = Client::builder()
            .timeout(config.timeout)
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .user_agent(format!("{CLIENT_NAME}/{}", env!("CARGO_PKG_VERSION")));

        builder = apply_tls(builder, &config.tls)?;

        if let Some(proxy_url) = &config.proxy_url {
            let proxy = Proxy::all(proxy_url.as_str()).map_err(|e| OpenError::Client(format!("proxy_url: {e}")))?;
            builder = builder.proxy(proxy);
        }

        let client = builder.build().map_err(|e| OpenError::Client(e.to_string()))?;

        Ok(Self {
            client,
            url: config.url.clone(),
            headers: build_headers(config)?,
            auth: config.auth.clone(),
            oauth: config.auth.oauth2.clone().map(TokenSource::new),
            timeout: config.timeout,
            backoff: config.backoff,
            drop_rate_limited_batches: config.drop_rate_limited_batches,
        })
    }

    /// Send a batch, retrying transient failures.
    ///
    /// Returns the number of attempts it took on success.
    ///
    /// # Retryable Errors
    ///
    /// - Network connection errors and timeouts
    /// - Server errors (5xx status codes)
    /// - Rate limiting (429), unless rate-limited batches are dropped
    ///
    /// Anything else drops the batch on the first failure.
    pub async fn send_batch(&self, batch: &Batch) -> Result<u32, BatchDropped> {
        debug!(
            entries = batch.len(),
            streams = batch.stream_count(),
            bytes = batch.size_bytes(),
            url = %self.url,
            "Sending log batch"
        );

        let mut backoff = self.backoff.start();

        loop {
            let err = match self.push(batch).await {
                Ok(()) => {
                    debug!(entries = batch.len(), attempts = backoff.failures() + 1, "Batch delivered");
                    return Ok(backoff.failures() + 1);
                }
                Err(err) => err,
            };

            backoff.fail();
            let attempts = backoff.failures();

            let reason = if err.is_rate_limited() && self.drop_rate_limited_batches {
                Some(DropReason::RateLimited)
            } else if !err.is_retryable() {
                Some(DropReason::NotRetryable)
            } else if !backoff.ongoing() {
                Some(DropReason::RetriesExhausted)
            } else {
                None
            };

            if let Some(reason) = reason {
                error!(
                    error = %err,
                    attempts = attempts,
                    reason = %reason,
                    entries = batch.len(),
                    "Final error sending batch, dropping it"
                );
                return Err(BatchDropped {
                    attempts,
                    reason,
                    last_error: err,
                });
            }

            let delay = backoff.next_delay();
            warn!(
                error = %err,
                attempt = attempts,
                max_retries = self.backoff.max_retries,
                delay_ms = delay.as_millis() as u64,
                "Error sending batch, will retry"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Send a single push request without retry logic.
    pub async fn push(&self, batch: &Batch) -> Result<(), PushError> {
        let body = batch.encode()?;

        let request = self
            .client
            .post(self.url.clone())
            .headers(self.headers.clone())
            .timeout(self.timeout)
            .body(body);
        let request = self.authorize(request).await?;

        let response = request.send().await?;
        let status = response.status();

        if status.is_success() {
            return Ok(());
        }

        let mut body = response.text().await.unwrap_or_default();
        if body.len() > MAX_ERROR_BODY {
            let mut end = MAX_ERROR_BODY;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            body.truncate(end);
        }

        Err(PushError::Status { code: status, body })
    }

    async fn authorize(&self, request: RequestBuilder) -> Result<RequestBuilder, PushError> {
        if let Some(oauth) = &self.oauth {
            let token = oauth.token(&self.client).await?;
            return Ok(request.bearer_auth(token));
        }

        if let Some(basic) = &self.auth.basic {
            let username = match basic.username_file.as_str() {
                "" => basic.username.clone(),
                path => read_secret_file(Path::new(path)).await?,
            };
            let password = match basic.password_file.as_str() {
                "" => basic.password.expose().to_string(),
                path => read_secret_file(Path::new(path)).await?,
            };
            return Ok(request.basic_auth(username, Some(password)));
        }

        if let Some(token) = &self.auth.bearer_token {
            return Ok(request.bearer_auth(token.expose()));
        }

        if let Some(path) = &self.auth.bearer_token_file {
            let token = read_secret_file(path).await?;
            return Ok(request.bearer_auth(token));
        }

        Ok(request)
    }

    /// Get the push endpoint.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Get the request timeout duration.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Get the headers sent with every push.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }
}

/// Custom headers first, then the headers the writer owns so they win.
/// A configured `tenant_id` replaces any custom `X-Scope-OrgID`.
fn build_headers(config: &ClientConfig) -> Result<HeaderMap, OpenError> {
    let mut headers = HeaderMap::new();

    for (name, value) in &config.headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| OpenError::Client(format!("header {name:?}: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| OpenError::Client(format!("header {name}: {e}")))?;
        headers.insert(name, value);
    }

    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

    if let Some(tenant) = &config.tenant_id {
        let value = HeaderValue::from_str(tenant)
            .map_err(|e| OpenError::Client(format!("tenant_id: {e}")))?;
        headers.insert(TENANT_HEADER, value);
    }

    Ok(headers)
}

fn apply_tls(mut builder: reqwest::ClientBuilder, tls: &TlsConfig) -> Result<reqwest::ClientBuilder, OpenError> {
    if !tls.ca_file.is_empty() {
        let pem = read_file(&tls.ca_file)?;
        let cert = Certificate::from_pem(&pem).map_err(|e| OpenError::Client(format!("ca_file: {e}")))?;
        builder = builder.add_root_certificate(cert);
    }

    if !tls.cert_file.is_empty() {
        let mut pem = read_file(&tls.cert_file)?;
        if !tls.key_file.is_empty() {
            pem.push(b'\n');
            pem.extend(read_file(&tls.key_file)?);
        } else if !tls.key.is_empty() {
            pem.push(b'\n');
            pem.extend_from_slice(tls.key.expose().as_bytes());
        } else {
            return Err(OpenError::Client("cert_file is set but no client key was given".to_string()));
        }
        let identity = Identity::from_pem(&pem).map_err(|e| OpenError::Client(format!("client certificate: {e}")))?;
        builder = builder.identity(identity);
    }

    if tls.insecure_skip_verify {
        warn!("TLS certificate verification is disabled");
        builder = builder.danger_accept_invalid_certs(true);
    }

    if !tls.server_name.is_empty() {
        warn!(
            server_name = %tls.server_name,
            "tls_config.server_name cannot be applied per client; the URL host is used for verification"
        );
    }

    Ok(builder)
}

fn read_file(path: &str) -> Result<Vec<u8>, OpenError> {
    std::fs::read(path).map_err(|e| OpenError::Client(format!("reading {path}: {e}")))
}

async fn read_secret_file(path: &Path) -> Result<String, PushError> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| PushError::Auth(format!("reading {}: {e}", path.display())))?;
    Ok(contents.trim_end_matches(['\r', '\n']).to_string())
}

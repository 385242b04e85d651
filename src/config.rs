//! Configuration for the Loki writer.
//!
//! [`RawConfig`] is the user-authored configuration, filled from JSON, from a
//! directive block (see [`crate::directive`]) or from environment variables.
//! [`RawConfig::validate`] checks it, applies defaults and produces the
//! immutable [`ClientConfig`] that the shipper runs with.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::backoff::{BackoffPolicy, DEFAULT_MAX_PERIOD, DEFAULT_MAX_RETRIES, DEFAULT_MIN_PERIOD};
use crate::duration::StrTimeDuration;
use crate::entry::LabelSet;
use crate::error::ConfigError;
use crate::secret::Secret;

/// Name the client reports itself as
pub const CLIENT_NAME: &str = "loki-writer";

/// Default maximum time a batch waits before it is sent
pub const DEFAULT_BATCH_WAIT: Duration = Duration::from_secs(1);

/// Default batch size threshold in bytes
pub const DEFAULT_BATCH_SIZE: usize = 1_048_576;

/// Default per-request timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Prefix of the environment variables read by [`RawConfig::apply_env`]
pub const ENV_PREFIX: &str = "LOKI_WRITER_";

/// Basic authentication credentials.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BasicAuth {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub username: String,

    /// File holding the username, read on every request
    #[serde(skip_serializing_if = "String::is_empty")]
    pub username_file: String,

    #[serde(skip_serializing_if = "Secret::is_empty")]
    pub password: Secret,

    /// File holding the password, read on every request
    #[serde(skip_serializing_if = "String::is_empty")]
    pub password_file: String,
}

impl BasicAuth {
    fn redacted(mut self) -> Self {
        self.password = self.password.redacted();
        self
    }
}

/// OAuth 2.0 client-credentials configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OAuth2 {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub client_id: String,

    #[serde(skip_serializing_if = "Secret::is_empty")]
    pub client_secret: Secret,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub scopes: Vec<String>,

    #[serde(skip_serializing_if = "String::is_empty")]
    pub token_url: String,

    /// Extra form parameters sent to the token endpoint
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub endpoint_params: BTreeMap<String, String>,
}

impl OAuth2 {
    fn redacted(mut self) -> Self {
        self.client_secret = self.client_secret.redacted();
        self
    }
}

/// TLS settings for the connection to the ingestion endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// PEM file with the CA used to verify the server
    #[serde(skip_serializing_if = "String::is_empty")]
    pub ca_file: String,

    /// PEM client certificate
    #[serde(skip_serializing_if = "String::is_empty")]
    pub cert_file: String,

    /// PEM client key
    #[serde(skip_serializing_if = "String::is_empty")]
    pub key_file: String,

    /// Inline PEM client key, used when `key_file` is empty
    #[serde(skip_serializing_if = "Secret::is_empty")]
    pub key: Secret,

    #[serde(skip_serializing_if = "String::is_empty")]
    pub server_name: String,

    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub insecure_skip_verify: bool,
}

impl TlsConfig {
    fn redacted(mut self) -> Self {
        self.key = self.key.redacted();
        self
    }
}

/// Retry schedule as written in the configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Initial backoff time between retries, default is 500ms
    #[serde(skip_serializing_if = "StrTimeDuration::is_zero")]
    pub min_period: StrTimeDuration,

    /// Maximum backoff time between retries, default is 5m
    #[serde(skip_serializing_if = "StrTimeDuration::is_zero")]
    pub max_period: StrTimeDuration,

    /// Maximum number of attempts, default is 10
    #[serde(skip_serializing_if = "is_zero_u32")]
    pub max_retries: u32,
}

fn is_zero_u32(v: &u32) -> bool {
    *v == 0
}

fn is_zero_usize(v: &usize) -> bool {
    *v == 0
}

/// The user-authored configuration, before validation.
///
/// Every field is optional in JSON; zero values mean "use the default".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawConfig {
    /// Full URL of the push API, e.g. `http://localhost:3100/loki/api/v1/push`
    #[serde(skip_serializing_if = "String::is_empty")]
    pub url: String,

    /// Extra HTTP headers sent with every push. They cannot override the
    /// headers the writer sets itself (tenant, content type).
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,

    /// Tenant sent as `X-Scope-OrgID`; omitted when empty
    #[serde(skip_serializing_if = "String::is_empty")]
    pub tenant_id: String,

    /// Maximum time to wait before sending a batch, default 1s
    #[serde(skip_serializing_if = "StrTimeDuration::is_zero")]
    pub batchwait: StrTimeDuration,

    /// Maximum batch size in bytes, default 1048576
    #[serde(skip_serializing_if = "is_zero_usize")]
    pub batchsize: usize,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub basic_auth: Option<BasicAuth>,

    /// Cannot be combined with basic_auth by the transport
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oauth2: Option<OAuth2>,

    #[serde(skip_serializing_if = "Secret::is_empty")]
    pub bearer_token: Secret,

    #[serde(skip_serializing_if = "String::is_empty")]
    pub bearer_token_file: String,

    #[serde(skip_serializing_if = "String::is_empty")]
    pub proxy_url: String,

    pub tls_config: TlsConfig,

    pub backoff_config: BackoffConfig,

    /// Drop batches answered with 429 instead of retrying them
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub drop_rate_limited_batches: bool,

    /// Static labels attached to every line; at least one is required
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    /// Per-request timeout, default 10s
    #[serde(skip_serializing_if = "StrTimeDuration::is_zero")]
    pub timeout: StrTimeDuration,

    /// Maximum distinct streams per batch, 0 disables the limit
    #[serde(skip_serializing_if = "is_zero_usize")]
    pub max_streams: usize,

    /// Maximum line size in bytes, 0 disables the limit
    #[serde(skip_serializing_if = "is_zero_usize")]
    pub max_line_size: usize,

    /// Truncate oversized lines instead of dropping them
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub max_line_size_truncate: bool,
}

/// Which credentials are sent with each push.
///
/// Everything configured is carried; when several are present the shipper
/// prefers OAuth2, then basic auth, then the bearer token, then the bearer
/// token file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthConfig {
    pub basic: Option<BasicAuth>,
    pub oauth2: Option<OAuth2>,
    pub bearer_token: Option<Secret>,
    pub bearer_token_file: Option<PathBuf>,
}

impl AuthConfig {
    pub fn is_none(&self) -> bool {
        self.basic.is_none()
            && self.oauth2.is_none()
            && self.bearer_token.is_none()
            && self.bearer_token_file.is_none()
    }
}

/// Memory ceilings enforced by the shipper.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceLimits {
    /// Maximum distinct streams per batch; 0 is unbounded
    pub max_streams: usize,

    /// Maximum line size in bytes; 0 is unbounded
    pub max_line_size: usize,

    /// Truncate rather than drop lines over `max_line_size`
    pub truncate_oversized: bool,
}

/// Validated, immutable configuration of the push client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub name: String,
    pub url: Url,
    pub headers: BTreeMap<String, String>,
    pub tenant_id: Option<String>,
    pub batch_wait: Duration,
    pub batch_size: usize,
    pub auth: AuthConfig,
    pub tls: TlsConfig,
    pub proxy_url: Option<Url>,
    pub backoff: BackoffPolicy,
    pub drop_rate_limited_batches: bool,
    pub timeout: Duration,
    pub labels: LabelSet,
    pub limits: ResourceLimits,
}

impl RawConfig {
    /// Parse the JSON representation.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(json).map_err(|e| ConfigError::new("config", format!("is not valid JSON: {e}")))
    }

    /// Serialize back to JSON. Durations are written as nanoseconds.
    pub fn to_json(&self) -> Result<String, ConfigError> {
        serde_json::to_string(self).map_err(|e| ConfigError::new("config", format!("cannot be serialized: {e}")))
    }

    /// Check the configuration and build the client configuration from it.
    ///
    /// Defaults are written back into `self`, so calling this again on the
    /// same value yields the same [`ClientConfig`].
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if:
    /// - `url` is empty or not an absolute URL with a host
    /// - `labels` is empty or has an empty label name
    /// - `proxy_url` is set but not a URL
    pub fn validate(&mut self) -> Result<ClientConfig, ConfigError> {
        let url = self.parse_url()?;

        if self.labels.is_empty() {
            return Err(ConfigError::new("labels", "is nil, at least one label is required"));
        }
        if self.labels.keys().any(|name| name.is_empty()) {
            return Err(ConfigError::new("labels", "contains an empty label name"));
        }

        self.apply_defaults();

        let proxy_url = if self.proxy_url.is_empty() {
            None
        } else {
            Some(Url::parse(&self.proxy_url).map_err(|e| ConfigError::new("proxy_url", format!("is invalid: {e}")))?)
        };

        let backoff = BackoffPolicy::new(
            self.backoff_config.min_period.as_duration(),
            self.backoff_config.max_period.as_duration(),
            self.backoff_config.max_retries,
        );

        let auth = AuthConfig {
            basic: self.basic_auth.clone().map(BasicAuth::redacted),
            oauth2: self.oauth2.clone().map(OAuth2::redacted),
            bearer_token: (!self.bearer_token.is_empty()).then(|| self.bearer_token.clone().redacted()),
            bearer_token_file: (!self.bearer_token_file.is_empty()).then(|| PathBuf::from(&self.bearer_token_file)),
        };

        Ok(ClientConfig {
            name: CLIENT_NAME.to_string(),
            url,
            headers: self.headers.clone(),
            tenant_id: (!self.tenant_id.is_empty()).then(|| self.tenant_id.clone()),
            batch_wait: self.batchwait.as_duration(),
            batch_size: self.batchsize,
            auth,
            tls: self.tls_config.clone().redacted(),
            proxy_url,
            backoff,
            drop_rate_limited_batches: self.drop_rate_limited_batches,
            timeout: self.timeout.as_duration(),
            labels: self.labels.clone().into(),
            limits: ResourceLimits {
                max_streams: self.max_streams,
                max_line_size: self.max_line_size,
                truncate_oversized: self.max_line_size_truncate,
            },
        })
    }

    fn parse_url(&self) -> Result<Url, ConfigError> {
        if self.url.is_empty() {
            return Err(ConfigError::new("url", "is required"));
        }

        let url = Url::parse(&self.url).map_err(|e| ConfigError::new("url", format!("is invalid: {e}")))?;
        if url.host_str().is_none() {
            return Err(ConfigError::new("url", "is invalid: missing host"));
        }

        Ok(url)
    }

    fn apply_defaults(&mut self) {
        if self.batchwait.is_zero() {
            self.batchwait = DEFAULT_BATCH_WAIT.into();
        }
        if self.batchsize == 0 {
            self.batchsize = DEFAULT_BATCH_SIZE;
        }
        if self.timeout.is_zero() {
            self.timeout = DEFAULT_TIMEOUT.into();
        }
        if self.backoff_config.max_retries == 0 {
            self.backoff_config.max_retries = DEFAULT_MAX_RETRIES;
        }
        if self.backoff_config.min_period.is_zero() {
            self.backoff_config.min_period = DEFAULT_MIN_PERIOD.into();
        }
        if self.backoff_config.max_period.is_zero() {
            self.backoff_config.max_period = DEFAULT_MAX_PERIOD.into();
        }
    }

    /// Key identifying writers that push to the same endpoint.
    pub fn writer_key(&self) -> String {
        format!("loki_log_{}", self.url)
    }

    /// Override fields from `LOKI_WRITER_*` environment variables.
    ///
    /// - `LOKI_WRITER_URL`, `LOKI_WRITER_TENANT_ID`, `LOKI_WRITER_PROXY_URL`
    /// - `LOKI_WRITER_BATCHWAIT`, `LOKI_WRITER_TIMEOUT` (duration shorthand)
    /// - `LOKI_WRITER_BATCHSIZE`, `LOKI_WRITER_MAX_STREAMS`,
    ///   `LOKI_WRITER_MAX_LINE_SIZE` (integers)
    /// - `LOKI_WRITER_LABELS` (`key=value,key=value`)
    /// - `LOKI_WRITER_BEARER_TOKEN`, `LOKI_WRITER_BEARER_TOKEN_FILE`
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Same as [`RawConfig::apply_env`] with a custom variable lookup.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| {
            let key = format!("{ENV_PREFIX}{name}");
            lookup(&key).filter(|v| !v.is_empty()).map(|v| (key, v))
        };

        if let Some((_, v)) = var("URL") {
            self.url = v;
        }
        if let Some((_, v)) = var("TENANT_ID") {
            self.tenant_id = v;
        }
        if let Some((_, v)) = var("PROXY_URL") {
            self.proxy_url = v;
        }
        if let Some((key, v)) = var("BATCHWAIT") {
            self.batchwait = v.parse().map_err(|e| ConfigError::invalid_duration(&key, e))?;
        }
        if let Some((key, v)) = var("TIMEOUT") {
            self.timeout = v.parse().map_err(|e| ConfigError::invalid_duration(&key, e))?;
        }
        if let Some((key, v)) = var("BATCHSIZE") {
            self.batchsize = parse_usize(&key, &v)?;
        }
        if let Some((key, v)) = var("MAX_STREAMS") {
            self.max_streams = parse_usize(&key, &v)?;
        }
        if let Some((key, v)) = var("MAX_LINE_SIZE") {
            self.max_line_size = parse_usize(&key, &v)?;
        }
        if let Some((key, v)) = var("LABELS") {
            self.labels = parse_label_list(&key, &v)?;
        }
        if let Some((_, v)) = var("BEARER_TOKEN") {
            self.bearer_token = Secret::new(v);
        }
        if let Some((_, v)) = var("BEARER_TOKEN_FILE") {
            self.bearer_token_file = v;
        }

        Ok(())
    }
}

fn parse_usize(key: &str, value: &str) -> Result<usize, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::invalid_int(key, value))
}

/// Parse `key=value,key=value` into a label map.
fn parse_label_list(key: &str, value: &str) -> Result<BTreeMap<String, String>, ConfigError> {
    value
        .split(',')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((name, val)) if !name.trim().is_empty() => Ok((name.trim().to_string(), val.trim().to_string())),
            _ => Err(ConfigError::new(key, format!("has a malformed label {pair:?}, expected key=value"))),
        })
        .collect()
}

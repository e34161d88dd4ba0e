//! Cluster API client (spec §4.2, §6.1)
//!
//! Session- or basic-authenticated HTTP client against a OneFS PAPI
//! endpoint, with CSRF handling, session re-authentication, request
//! chunking to a URL-length budget, and exponential-backoff retry on
//! transient connection failures.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, REFERER, SET_COOKIE, USER_AGENT};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::{AuthType, ClusterConfig};
use crate::error::{CollectorError, Result};
use crate::model::{DeviceId, ErrorCode, NodeNumber, StatDetail, StatKey, StatResult};
use crate::value::Value;

const DEFAULT_USER_AGENT: &str = concat!("onefs-stats-collector/", env!("CARGO_PKG_VERSION"));
/// PAPI's documented URL length limit, minus slop (spec §4.2/§6.1).
pub const URL_BUDGET_BYTES: usize = 8198;
const REAUTH_GRACE: chrono::Duration = chrono::Duration::seconds(60);
const DEFAULT_SESSION_TIMEOUT_SECS: i64 = 14400;
const CSRF_COOKIE_NAME: &str = "isicsrf";

#[derive(Debug, Clone)]
pub struct ClusterClientBuilder {
    host: String,
    port: u16,
    /// Overrides `host`/`port` entirely when set, scheme included. Used by
    /// the `testing` module to point a client at a plain-http mock server.
    base_url: Option<String>,
    username: String,
    password: String,
    authtype: AuthType,
    verify_ssl: bool,
    timeout: Duration,
    user_agent: String,
    /// 0 or negative means unbounded retry (spec §4.2).
    max_retries: i64,
}

impl ClusterClientBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Override the target entirely with a full base URL (scheme included).
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = username.into();
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = password.into();
        self
    }

    pub fn authtype(mut self, authtype: AuthType) -> Self {
        self.authtype = authtype;
        self
    }

    pub fn verify_ssl(mut self, verify_ssl: bool) -> Self {
        self.verify_ssl = verify_ssl;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Cap on connection-failure retries (spec §4.2). 0 or negative means
    /// unbounded.
    pub fn max_retries(mut self, max_retries: i64) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn from_cluster_config(config: &ClusterConfig, password: String) -> Self {
        Self::new()
            .host(config.hostname.clone())
            .port(config.port)
            .username(config.username.clone())
            .password(password)
            .authtype(config.authtype)
            .verify_ssl(config.verify_ssl)
    }

    pub fn build(self) -> Result<ClusterClient> {
        let mut default_headers = HeaderMap::new();
        default_headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&self.user_agent)
                .map_err(|e| CollectorError::InvalidUrl(format!("invalid user agent: {e}")))?,
        );

        let client = reqwest::Client::builder()
            .timeout(self.timeout)
            .danger_accept_invalid_certs(!self.verify_ssl)
            .cookie_store(true)
            .default_headers(default_headers)
            .build()
            .map_err(|e| CollectorError::ConnectionError(e.to_string()))?;

        Ok(ClusterClient {
            base_url: self
                .base_url
                .unwrap_or_else(|| format!("https://{}:{}", self.host, self.port)),
            username: self.username,
            password: self.password,
            authtype: self.authtype,
            max_retries: self.max_retries,
            client: Arc::new(client),
            session: Arc::new(Mutex::new(SessionState::default())),
        })
    }
}

impl Default for ClusterClientBuilder {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8080,
            base_url: None,
            username: String::new(),
            password: String::new(),
            authtype: AuthType::Session,
            verify_ssl: true,
            timeout: Duration::from_secs(120),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            max_retries: 0,
        }
    }
}

#[derive(Debug, Default)]
struct SessionState {
    authenticated: bool,
    reauth_deadline: Option<DateTime<Utc>>,
    csrf_token: Option<String>,
}

/// The authentication state machine's transitions (spec §4.2). Exposed for
/// observability/tests, not consulted by the client internally (the client
/// tracks the data it actually needs in `SessionState`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Unauthenticated,
    Authenticated,
    ReauthPending,
    Failed,
}

#[derive(Clone)]
pub struct ClusterClient {
    base_url: String,
    username: String,
    password: String,
    authtype: AuthType,
    max_retries: i64,
    client: Arc<reqwest::Client>,
    session: Arc<Mutex<SessionState>>,
}

#[derive(Debug, Deserialize)]
struct SessionCreateResponse {
    #[serde(default)]
    timeout_absolute: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct ClusterConfigResponse {
    name: String,
    #[serde(default)]
    onefs_version: Option<OnefsVersion>,
}

#[derive(Debug, Deserialize)]
struct OnefsVersion {
    #[serde(default)]
    version: Option<String>,
}

#[derive(Debug, Deserialize)]
struct KeyMetadataResponse {
    #[serde(default)]
    keys: Vec<KeyMetadataEntry>,
}

#[derive(Debug, Deserialize)]
struct KeyMetadataEntry {
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    units: Option<String>,
    #[serde(default)]
    scope: Option<String>,
    #[serde(default)]
    r#type: Option<String>,
    #[serde(default)]
    aggregation_type: Option<String>,
    #[serde(default)]
    policies: Vec<PolicyEntry>,
}

#[derive(Debug, Deserialize)]
struct PolicyEntry {
    persistent: bool,
    #[serde(default)]
    interval: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct CurrentStatsResponse {
    #[serde(default)]
    stats: Vec<RawStatResult>,
    #[serde(default)]
    errors: Option<Vec<ApiErrorEntry>>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorEntry {
    #[serde(default)]
    #[allow(dead_code)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawStatResult {
    devid: u32,
    #[serde(default)]
    node: Option<u32>,
    key: String,
    time: i64,
    #[serde(default)]
    error_code: Option<ErrorCode>,
    #[serde(default)]
    #[allow(dead_code)]
    error: Option<String>,
    #[serde(default)]
    value: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct SummaryResponse {
    #[serde(default)]
    protocol: Option<Vec<serde_json::Value>>,
    #[serde(default)]
    client: Option<Vec<serde_json::Value>>,
}

impl ClusterClient {
    pub fn builder() -> ClusterClientBuilder {
        ClusterClientBuilder::new()
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Authenticate per spec §4.2. A no-op for basic auth (credentials are
    /// attached per-request instead).
    pub async fn connect(&self) -> Result<()> {
        if self.authtype != AuthType::Session {
            return Ok(());
        }
        self.authenticate().await
    }

    async fn authenticate(&self) -> Result<()> {
        let url = self.url("/session/1/session");
        let body = serde_json::json!({
            "username": self.username,
            "password": self.password,
            "services": ["platform"],
        });

        let response = retry_connection_errors(
            || {
                let client = self.client.clone();
                let url = url.clone();
                let body = body.clone();
                async move {
                    client
                        .post(&url)
                        .json(&body)
                        .send()
                        .await
                        .map_err(CollectorError::from)
                }
            },
            self.max_retries,
        )
        .await?;

        if response.status().as_u16() != 201 {
            return Err(CollectorError::AuthenticationFailed);
        }

        let csrf_token = extract_csrf_cookie(response.headers());

        let text = response.text().await.unwrap_or_default();
        let parsed: SessionCreateResponse = serde_json::from_str(&text).unwrap_or(SessionCreateResponse {
            timeout_absolute: None,
        });
        let timeout_secs = parsed.timeout_absolute.unwrap_or(DEFAULT_SESSION_TIMEOUT_SECS);
        let deadline = Utc::now() + chrono::Duration::seconds(timeout_secs) - REAUTH_GRACE;

        let mut session = self.session.lock().await;
        session.authenticated = true;
        session.reauth_deadline = Some(deadline);
        session.csrf_token = csrf_token;
        Ok(())
    }

    async fn ensure_fresh_session(&self) -> Result<()> {
        if self.authtype != AuthType::Session {
            return Ok(());
        }
        let needs_reauth = {
            let session = self.session.lock().await;
            !session.authenticated
                || session
                    .reauth_deadline
                    .map(|d| Utc::now() >= d)
                    .unwrap_or(true)
        };
        if needs_reauth {
            self.authenticate().await?;
        }
        Ok(())
    }

    async fn authed_get(&self, path: &str) -> Result<reqwest::Response> {
        self.ensure_fresh_session().await?;

        let send_once = || {
            let client = self.client.clone();
            let url = self.url(path);
            let username = self.username.clone();
            let password = self.password.clone();
            let authtype = self.authtype;
            let session = self.session.clone();
            async move {
                let mut req = client.get(&url);
                if authtype == AuthType::Basic {
                    req = req.basic_auth(&username, Some(&password));
                } else {
                    let token = session.lock().await.csrf_token.clone();
                    if let Some(token) = token {
                        req = req.header("X-CSRF-Token", &token).header(REFERER, &url);
                    }
                }
                req.send().await.map_err(CollectorError::from)
            }
        };

        let response = retry_connection_errors(send_once, self.max_retries).await?;

        if response.status().as_u16() == 401 {
            if self.authtype == AuthType::Basic {
                return Err(CollectorError::AuthenticationFailed);
            }
            self.authenticate().await?;
            let retried = retry_connection_errors(send_once, self.max_retries).await?;
            if retried.status().as_u16() == 401 {
                return Err(CollectorError::AuthenticationFailed);
            }
            return Ok(retried);
        }

        Ok(response)
    }

    pub async fn fetch_cluster_config(&self) -> Result<(String, String)> {
        let response = self.authed_get("/platform/1/cluster/config").await?;
        ensure_status_ok(&response)?;
        let bytes = response.bytes().await.map_err(CollectorError::from)?;
        let parsed: ClusterConfigResponse = parse_json(&bytes)?;
        let version = parsed
            .onefs_version
            .and_then(|v| v.version)
            .unwrap_or_default();
        Ok((parsed.name, version))
    }

    pub async fn fetch_key_metadata(&self, key: &StatKey) -> Result<StatDetail> {
        let path = format!("/platform/1/statistics/keys/{key}");
        let response = match self.authed_get(&path).await {
            Ok(r) => r,
            Err(e) => {
                warn!(key = %key, error = %e, "metadata fetch failed, marking key invalid");
                return Ok(StatDetail::invalid());
            }
        };
        if !response.status().is_success() {
            warn!(key = %key, status = %response.status(), "metadata fetch returned error status");
            return Ok(StatDetail::invalid());
        }
        let bytes = match response.bytes().await {
            Ok(b) => b,
            Err(e) => {
                warn!(key = %key, error = %e, "metadata response body read failed");
                return Ok(StatDetail::invalid());
            }
        };
        let parsed: KeyMetadataResponse = match parse_json(&bytes) {
            Ok(p) => p,
            Err(e) => {
                warn!(key = %key, error = %e, "metadata response parse failed");
                return Ok(StatDetail::invalid());
            }
        };
        let Some(entry) = parsed.keys.into_iter().next() else {
            warn!(key = %key, "metadata response had no keys[] entry");
            return Ok(StatDetail::invalid());
        };
        let interval = entry
            .policies
            .into_iter()
            .find(|p| !p.persistent)
            .and_then(|p| p.interval)
            .unwrap_or(0.0);
        Ok(StatDetail {
            valid: true,
            description: entry.description.unwrap_or_default(),
            units: entry.units.unwrap_or_default(),
            scope: entry.scope.unwrap_or_default(),
            datatype: entry.r#type.unwrap_or_default(),
            aggregation_type: entry.aggregation_type.unwrap_or_default(),
            native_update_interval: Duration::from_secs_f64(interval.max(0.0)),
        })
    }

    /// Fetch current stats for the given keys, chunked to the URL budget
    /// (spec §4.2 "Request chunking"). Results are concatenated.
    pub async fn fetch_current_stats(&self, keys: &[StatKey]) -> Result<Vec<StatResult>> {
        let chunks = chunk_keys_to_budget(&self.base_url, keys, URL_BUDGET_BYTES)?;
        let mut all = Vec::new();
        for chunk in chunks {
            let path = current_stats_path(&chunk);
            let response = self.authed_get(&path).await?;
            ensure_status_ok(&response)?;
            let bytes = response.bytes().await.map_err(CollectorError::from)?;
            let parsed: CurrentStatsResponse = parse_json(&bytes)?;
            if let Some(errors) = parsed.errors {
                let message = errors
                    .into_iter()
                    .map(|e| e.message.unwrap_or_default())
                    .collect::<Vec<_>>()
                    .join("; ");
                return Err(CollectorError::ApiError { code: 0, message });
            }
            all.extend(parsed.stats.into_iter().map(raw_to_stat_result));
        }
        Ok(all)
    }

    pub async fn fetch_summary_protocol(&self) -> Result<Vec<Value>> {
        let response = self
            .authed_get("/platform/3/statistics/summary/protocol?degraded=true")
            .await?;
        ensure_status_ok(&response)?;
        let bytes = response.bytes().await.map_err(CollectorError::from)?;
        let parsed: SummaryResponse = parse_json(&bytes)?;
        Ok(parsed
            .protocol
            .unwrap_or_default()
            .into_iter()
            .map(Value::from)
            .collect())
    }

    pub async fn fetch_summary_client(&self) -> Result<Vec<Value>> {
        let response = self
            .authed_get("/platform/3/statistics/summary/client?degraded=true")
            .await?;
        ensure_status_ok(&response)?;
        let bytes = response.bytes().await.map_err(CollectorError::from)?;
        let parsed: SummaryResponse = parse_json(&bytes)?;
        Ok(parsed
            .client
            .unwrap_or_default()
            .into_iter()
            .map(Value::from)
            .collect())
    }
}

fn raw_to_stat_result(r: RawStatResult) -> StatResult {
    StatResult {
        key: r.key,
        devid: DeviceId(r.devid),
        node: r.node.map(NodeNumber),
        time: r.time,
        error_code: r.error_code.unwrap_or(ErrorCode::None),
        error: r.error,
        value: Value::from(r.value),
    }
}

fn parse_json<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T> {
    let deserializer = &mut serde_json::Deserializer::from_slice(bytes);
    serde_path_to_error::deserialize(deserializer)
        .map_err(|err| CollectorError::ParseError(format!("field '{}': {}", err.path(), err.inner())))
}

fn ensure_status_ok(response: &reqwest::Response) -> Result<()> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    match status.as_u16() {
        401 => Err(CollectorError::Unauthorized),
        500..=599 => Err(CollectorError::ServerError(status.to_string())),
        code => Err(CollectorError::ApiError {
            code,
            message: status.to_string(),
        }),
    }
}

fn extract_csrf_cookie(headers: &HeaderMap) -> Option<String> {
    headers.get_all(SET_COOKIE).iter().find_map(|v| {
        let s = v.to_str().ok()?;
        let (name, rest) = s.split_once('=')?;
        if name.trim() == CSRF_COOKIE_NAME {
            Some(rest.split(';').next().unwrap_or("").to_string())
        } else {
            None
        }
    })
}

fn current_stats_path(keys: &[String]) -> String {
    let mut path =
        String::from("/platform/1/statistics/current?degraded=true&devid=all&show_nodes=true");
    for key in keys {
        path.push_str("&key=");
        path.push_str(key);
    }
    path
}

/// Split `keys` into chunks whose resulting current-stats URL stays under
/// `budget` bytes (spec §4.2 "Request chunking"). A single key that alone
/// exceeds the budget is an error.
pub fn chunk_keys_to_budget(
    base_url: &str,
    keys: &[StatKey],
    budget: usize,
) -> Result<Vec<Vec<StatKey>>> {
    let fixed_len = base_url.len() + current_stats_path(&[]).len();
    if fixed_len > budget {
        return Err(CollectorError::UrlBudgetExceeded {
            key: String::new(),
            budget,
        });
    }

    let mut chunks = Vec::new();
    let mut current: Vec<StatKey> = Vec::new();
    let mut current_len = fixed_len;

    for key in keys {
        let added = "&key=".len() + key.len();
        if fixed_len + added > budget {
            return Err(CollectorError::UrlBudgetExceeded {
                key: key.clone(),
                budget,
            });
        }
        if current_len + added > budget {
            chunks.push(std::mem::take(&mut current));
            current_len = fixed_len;
        }
        current.push(key.clone());
        current_len += added;
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    Ok(chunks)
}

/// Exponential backoff for transient connection failures (spec §4.2):
/// start at 1s, double each failure, clamp at 1800s, continue until
/// `max_retries` failures (0 or negative means unbounded). See
/// SPEC_FULL.md's scheduler module for the separate, shorter-clamped
/// per-tick retry loop used around data fetches.
async fn retry_connection_errors<F, Fut>(mut attempt: F, max_retries: i64) -> Result<reqwest::Response>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<reqwest::Response>>,
{
    let mut delay = Duration::from_secs(1);
    let max = Duration::from_secs(1800);
    let mut failures: i64 = 0;
    loop {
        match attempt().await {
            Ok(resp) => return Ok(resp),
            Err(e) if e.is_retryable() => {
                failures += 1;
                if max_retries > 0 && failures >= max_retries {
                    debug!(failures, "connection retries exhausted");
                    return Err(e);
                }
                debug!(delay = ?delay, "retrying after connection error");
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(max);
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunking_stays_under_budget() {
        let keys: Vec<String> = (0..500).map(|i| format!("cluster.key.number.{i}")).collect();
        let chunks = chunk_keys_to_budget("https://host:8080", &keys, 200).unwrap();
        for chunk in &chunks {
            let path = current_stats_path(chunk);
            assert!("https://host:8080".len() + path.len() <= 200);
        }
        let total: usize = chunks.iter().map(|c| c.len()).sum();
        assert_eq!(total, keys.len());
    }

    #[test]
    fn single_oversized_key_is_an_error() {
        let keys = vec!["x".repeat(9000)];
        let err = chunk_keys_to_budget("https://host:8080", &keys, URL_BUDGET_BYTES).unwrap_err();
        assert!(matches!(err, CollectorError::UrlBudgetExceeded { .. }));
    }

    #[test]
    fn csrf_cookie_extraction() {
        let mut headers = HeaderMap::new();
        headers.append(SET_COOKIE, HeaderValue::from_static("isicsrf=abc123; Path=/"));
        headers.append(SET_COOKIE, HeaderValue::from_static("session=xyz; Path=/"));
        assert_eq!(extract_csrf_cookie(&headers), Some("abc123".to_string()));
    }
}

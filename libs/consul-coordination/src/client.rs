//! Consul HTTP client for blocking queries and one-shot KV access.
//!
//! Wraps `reqwest` with the small slice of the Consul API the connector needs.
//! The client is cheap to clone; all clones share one connection pool, so
//! every watch in the process multiplexes over the same set of connections.

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{RequestBuilder, StatusCode, Url};
use tracing::{debug, trace};

use config::ConsulConfig;

use crate::error::{CoordinationError, CoordinationResult};
use crate::models::{self, Document, Members, QueryOutcome, VersionedValue};

/// Header carrying the modify index of a blocking query response.
pub const INDEX_HEADER: &str = "X-Consul-Index";

/// Header carrying the ACL token.
pub const TOKEN_HEADER: &str = "X-Consul-Token";

/// Default blocking query wait if not configured.
pub const DEFAULT_WAIT: Duration = Duration::from_secs(300);

/// Default connection timeout if not configured.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Timeout for one-shot (non-blocking) requests.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Extra time granted beyond `wait` before a blocking request is abandoned.
/// Consul adds up to `wait / 16` of jitter on its side.
const BLOCKING_SLACK: Duration = Duration::from_secs(5);

/// Collects everything needed to build a [`ConsulClient`].
///
/// Kept by the coordination context so collaborators can build dedicated
/// clients with the same settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsulClientBuilder {
    address: String,
    token: Option<String>,
    datacenter: Option<String>,
    wait: Duration,
    connect_timeout: Duration,
}

impl ConsulClientBuilder {
    /// Builder for the agent at `address`. A missing scheme means `http`.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            token: None,
            datacenter: None,
            wait: DEFAULT_WAIT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn from_config(config: &ConsulConfig) -> Self {
        Self {
            address: config.address.clone(),
            token: config.token.clone(),
            datacenter: config.datacenter.clone(),
            wait: config.wait,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn datacenter(mut self, datacenter: impl Into<String>) -> Self {
        self.datacenter = Some(datacenter.into());
        self
    }

    /// How long a blocking query may be held open by the agent.
    pub fn wait(mut self, wait: Duration) -> Self {
        self.wait = wait;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Validate settings and build a client. Does not contact the agent.
    pub fn build(&self) -> CoordinationResult<ConsulClient> {
        let base = Self::parse_address(&self.address)?;
        if self.wait.is_zero() {
            return Err(CoordinationError::Config(
                "blocking query wait must be non-zero".into(),
            ));
        }

        let mut headers = HeaderMap::new();
        if let Some(token) = &self.token {
            let mut value = HeaderValue::from_str(token).map_err(|_| {
                CoordinationError::Config("ACL token contains invalid header characters".into())
            })?;
            value.set_sensitive(true);
            headers.insert(TOKEN_HEADER, value);
        }

        let http = reqwest::Client::builder()
            .connect_timeout(self.connect_timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| CoordinationError::Config(format!("failed to build HTTP client: {e}")))?;

        debug!(address = %base, datacenter = ?self.datacenter, wait = ?self.wait, "built consul client");

        Ok(ConsulClient {
            http,
            base,
            datacenter: self.datacenter.clone(),
            wait: self.wait,
        })
    }

    fn parse_address(address: &str) -> CoordinationResult<Url> {
        let address = address.trim();
        if address.is_empty() {
            return Err(CoordinationError::Config("consul address is empty".into()));
        }
        let with_scheme = if address.contains("://") {
            address.to_owned()
        } else {
            format!("http://{address}")
        };
        let mut url = Url::parse(&with_scheme).map_err(|e| {
            CoordinationError::Config(format!("invalid consul address '{address}': {e}"))
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(CoordinationError::Config(format!(
                "unsupported scheme '{}' in consul address",
                url.scheme()
            )));
        }
        if !url.path().ends_with('/') {
            let path = format!("{}/", url.path());
            url.set_path(&path);
        }
        Ok(url)
    }
}

/// Consul HTTP client.
#[derive(Debug, Clone)]
pub struct ConsulClient {
    http: reqwest::Client,
    base: Url,
    datacenter: Option<String>,
    wait: Duration,
}

/// A decoded response: status, modify index and raw body.
struct RawResponse {
    status: StatusCode,
    index: u64,
    body: Vec<u8>,
}

impl ConsulClient {
    /// Returns the configured blocking query wait.
    pub fn wait(&self) -> Duration {
        self.wait
    }

    /// Returns the base URL of the agent.
    pub fn base_url(&self) -> &Url {
        &self.base
    }

    /// Blocking read of a KV key. A missing key is a response with
    /// `value: None` and the current index.
    pub async fn kv_blocking(
        &self,
        key: &str,
        index: u64,
    ) -> CoordinationResult<QueryOutcome<Document>> {
        let request = self.blocking_request(&format!("v1/kv/{key}"), index, &[])?;
        let Some(raw) = self.execute(request).await? else {
            return Ok(QueryOutcome::NoResponse);
        };
        let value = match raw.status {
            StatusCode::NOT_FOUND => None,
            _ => models::decode_kv(&raw.body)?,
        };
        trace!(key, index = raw.index, present = value.is_some(), "kv blocking query returned");
        Ok(QueryOutcome::Response(VersionedValue::new(value, raw.index)))
    }

    /// Blocking read of the passing instances of `service`.
    pub async fn health_blocking(
        &self,
        service: &str,
        index: u64,
    ) -> CoordinationResult<QueryOutcome<Members>> {
        let request = self.blocking_request(
            &format!("v1/health/service/{service}"),
            index,
            &[("passing", "true")],
        )?;
        let Some(raw) = self.execute(request).await? else {
            return Ok(QueryOutcome::NoResponse);
        };
        if raw.status == StatusCode::NOT_FOUND {
            return Err(CoordinationError::Protocol(format!(
                "health endpoint for service '{service}' returned 404"
            )));
        }
        let members = models::decode_health(&raw.body)?;
        trace!(service, index = raw.index, members = members.len(), "health blocking query returned");
        Ok(QueryOutcome::Response(VersionedValue::new(members, raw.index)))
    }

    /// One-shot read of a KV key.
    pub async fn kv_get(&self, key: &str) -> CoordinationResult<VersionedValue<Document>> {
        let request = self
            .http
            .get(self.url(&format!("v1/kv/{key}"))?)
            .query(&self.dc_params())
            .timeout(DEFAULT_REQUEST_TIMEOUT);
        match self.execute(request).await? {
            Some(raw) if raw.status == StatusCode::NOT_FOUND => {
                Ok(VersionedValue::new(None, raw.index))
            }
            Some(raw) => Ok(VersionedValue::new(models::decode_kv(&raw.body)?, raw.index)),
            None => Err(CoordinationError::Timeout(format!(
                "read of key '{key}' timed out after {DEFAULT_REQUEST_TIMEOUT:?}"
            ))),
        }
    }

    /// Write a KV key. Returns whether the agent accepted the write.
    pub async fn kv_put(&self, key: &str, value: impl Into<String>) -> CoordinationResult<bool> {
        let request = self
            .http
            .put(self.url(&format!("v1/kv/{key}"))?)
            .query(&self.dc_params())
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .body(value.into());
        self.execute_bool(request, key).await
    }

    /// Delete a KV key. Deleting a missing key succeeds.
    pub async fn kv_delete(&self, key: &str) -> CoordinationResult<bool> {
        let request = self
            .http
            .delete(self.url(&format!("v1/kv/{key}"))?)
            .query(&self.dc_params())
            .timeout(DEFAULT_REQUEST_TIMEOUT);
        self.execute_bool(request, key).await
    }

    fn url(&self, path: &str) -> CoordinationResult<Url> {
        self.base
            .join(path)
            .map_err(|e| CoordinationError::Config(format!("invalid request path '{path}': {e}")))
    }

    fn dc_params(&self) -> Vec<(&'static str, String)> {
        self.datacenter
            .iter()
            .map(|dc| ("dc", dc.clone()))
            .collect()
    }

    /// Build a blocking GET. An index of `0` is omitted so the agent answers
    /// immediately with the current state.
    fn blocking_request(
        &self,
        path: &str,
        index: u64,
        extra: &[(&'static str, &str)],
    ) -> CoordinationResult<RequestBuilder> {
        let mut params = self.dc_params();
        params.extend(extra.iter().map(|(k, v)| (*k, (*v).to_owned())));
        if index > 0 {
            params.push(("index", index.to_string()));
            params.push(("wait", format!("{}ms", self.wait.as_millis())));
        }
        Ok(self
            .http
            .get(self.url(path)?)
            .query(&params)
            .timeout(self.wait + self.wait / 16 + BLOCKING_SLACK))
    }

    /// Send a request. A client-side timeout yields `Ok(None)`.
    async fn execute(&self, request: RequestBuilder) -> CoordinationResult<Option<RawResponse>> {
        let response = match request.send().await {
            Ok(response) => response,
            Err(err) if err.is_timeout() => {
                debug!(error = %err, "consul request timed out, treating as no change");
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };

        let status = response.status();
        classify_status(status)?;
        let index = parse_index(response.headers())?;
        let body = match response.bytes().await {
            Ok(body) => body.to_vec(),
            Err(err) if err.is_timeout() => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        Ok(Some(RawResponse {
            status,
            index,
            body,
        }))
    }

    async fn execute_bool(&self, request: RequestBuilder, key: &str) -> CoordinationResult<bool> {
        let response = request.send().await?;
        classify_status(response.status())?;
        let body = response.text().await?;
        match body.trim() {
            "true" => Ok(true),
            "false" => Ok(false),
            other => Err(CoordinationError::Codec(format!(
                "unexpected response for key '{key}': {other}"
            ))),
        }
    }
}

/// Map an HTTP status to the error taxonomy. 404 is left to the caller since
/// it means "absent" for KV reads.
fn classify_status(status: StatusCode) -> CoordinationResult<()> {
    match status {
        s if s.is_success() || s == StatusCode::NOT_FOUND => Ok(()),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            Err(CoordinationError::Auth(format!("consul returned {status}")))
        }
        s if s.is_server_error() => Err(CoordinationError::Transport(format!(
            "consul returned {status}"
        ))),
        _ => Err(CoordinationError::Protocol(format!(
            "unexpected status {status}"
        ))),
    }
}

/// Read `X-Consul-Index`. A missing header on a 404 maps to index 0.
fn parse_index(headers: &HeaderMap) -> CoordinationResult<u64> {
    let Some(value) = headers.get(INDEX_HEADER) else {
        return Ok(0);
    };
    value
        .to_str()
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .ok_or_else(|| CoordinationError::Codec(format!("invalid {INDEX_HEADER} header: {value:?}")))
}

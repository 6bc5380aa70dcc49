//! HTTP seam: every provider call goes through an [`HttpClient`].
//!
//! Timeouts are enforced here, per call, and surface as [`NetworkErrorKind::Timeout`], which
//! the backoff policies treat as a retryable network failure. Status codes are returned as-is;
//! [`HttpJsonProvider`] turns `>= 400` into [`ProviderError::Status`].

use crate::error::{NetworkErrorKind, ProviderError};
use crate::fetch::{FetchRequest, Provider};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Default per-call timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// A fully resolved outbound request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: String,
    pub url: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub timeout: Duration,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: "GET".to_string(),
            url: url.into(),
            query: Vec::new(),
            headers: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

/// Sends a request, returning the response or a typed network error.
#[async_trait]
pub trait HttpClient: Send + Sync + std::fmt::Debug {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, ProviderError>;
}

/// Adapts a JSON-over-HTTP endpoint to [`Provider`].
///
/// `{name}` placeholders in the path are filled from the request parameters; parameters not
/// consumed by the path are sent as query parameters, after any static query pairs.
#[derive(Debug, Clone)]
pub struct HttpJsonProvider {
    name: String,
    client: Arc<dyn HttpClient>,
    base_url: String,
    path: String,
    static_query: Vec<(String, String)>,
    headers: Vec<(String, String)>,
    timeout: Duration,
}

impl HttpJsonProvider {
    pub fn new(name: impl Into<String>, client: Arc<dyn HttpClient>, base_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            client,
            base_url: base_url.into(),
            path: String::new(),
            static_query: Vec::new(),
            headers: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    /// Static query pair sent with every request (API keys, formats).
    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.static_query.push((key.into(), value.into()));
        self
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Resolve the outbound request for `request`.
    pub fn build_request(&self, request: &FetchRequest) -> HttpRequest {
        let mut path = self.path.clone();
        let mut query = self.static_query.clone();
        for (key, value) in &request.params {
            let placeholder = format!("{{{key}}}");
            if path.contains(&placeholder) {
                path = path.replace(&placeholder, value);
            } else {
                query.push((key.clone(), value.clone()));
            }
        }
        let url = format!("{}{}", self.base_url.trim_end_matches('/'), path);
        HttpRequest {
            method: "GET".to_string(),
            url,
            query,
            headers: self.headers.clone(),
            timeout: self.timeout,
        }
    }
}

#[async_trait]
impl Provider for HttpJsonProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn endpoint(&self) -> String {
        if self.path.is_empty() {
            "/".to_string()
        } else {
            self.path.clone()
        }
    }

    async fn fetch(&self, request: &FetchRequest) -> Result<Value, ProviderError> {
        let response = self.client.send(self.build_request(request)).await?;
        if response.status >= 400 {
            return Err(ProviderError::Status {
                status: response.status,
                body: Some(response.body).filter(|b| !b.is_empty()),
            });
        }
        serde_json::from_str(&response.body).map_err(|e| ProviderError::Decode(e.to_string()))
    }
}

#[cfg(feature = "http")]
pub use self::reqwest_client::ReqwestClient;

#[cfg(feature = "http")]
mod reqwest_client {
    use super::{HttpClient, HttpRequest, HttpResponse};
    use crate::error::{NetworkErrorKind, ProviderError};
    use async_trait::async_trait;

    /// [`HttpClient`] backed by `reqwest`.
    #[derive(Debug, Clone, Default)]
    pub struct ReqwestClient {
        client: reqwest::Client,
    }

    impl ReqwestClient {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn from_client(client: reqwest::Client) -> Self {
            Self { client }
        }
    }

    #[async_trait]
    impl HttpClient for ReqwestClient {
        async fn send(&self, request: HttpRequest) -> Result<HttpResponse, ProviderError> {
            let method = reqwest::Method::from_bytes(request.method.as_bytes())
                .map_err(|e| ProviderError::Misconfigured(e.to_string()))?;
            let mut builder = self
                .client
                .request(method, &request.url)
                .query(&request.query)
                .timeout(request.timeout);
            for (key, value) in &request.headers {
                builder = builder.header(key.as_str(), value.as_str());
            }

            tracing::debug!(target: "bulwark::http", url = %request.url, "sending provider request");
            let response = builder.send().await.map_err(classify)?;
            let status = response.status().as_u16();
            let headers = response
                .headers()
                .iter()
                .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
                .collect();
            let body = response.text().await.map_err(classify)?;
            Ok(HttpResponse { status, headers, body })
        }
    }

    fn classify(err: reqwest::Error) -> ProviderError {
        if err.is_builder() {
            return ProviderError::Misconfigured(err.to_string());
        }
        let kind = if err.is_timeout() {
            NetworkErrorKind::Timeout
        } else {
            io_kind(&err).unwrap_or(if err.is_connect() {
                NetworkErrorKind::ConnectionRefused
            } else {
                NetworkErrorKind::Other
            })
        };
        ProviderError::network(kind, err.to_string())
    }

    fn io_kind(err: &reqwest::Error) -> Option<NetworkErrorKind> {
        let mut source = std::error::Error::source(err);
        while let Some(cause) = source {
            if let Some(io) = cause.downcast_ref::<std::io::Error>() {
                return Some(super::network_kind_from_io(io.kind()));
            }
            if cause.to_string().contains("dns error") {
                return Some(NetworkErrorKind::HostNotFound);
            }
            source = cause.source();
        }
        None
    }
}

/// Map an I/O error kind to a network failure kind.
pub fn network_kind_from_io(kind: std::io::ErrorKind) -> NetworkErrorKind {
    use std::io::ErrorKind;
    match kind {
        ErrorKind::TimedOut => NetworkErrorKind::Timeout,
        ErrorKind::ConnectionRefused => NetworkErrorKind::ConnectionRefused,
        ErrorKind::ConnectionAborted => NetworkErrorKind::ConnectionAborted,
        ErrorKind::ConnectionReset => NetworkErrorKind::ConnectionReset,
        ErrorKind::NotFound => NetworkErrorKind::HostNotFound,
        _ => NetworkErrorKind::Other,
    }
}

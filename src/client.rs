//! Backend gateway: the seam between the portal and its REST backend.
//!
//! [`Gateway`] is the only way the rest of the crate talks HTTP, so tests
//! swap in a fake and the dashboards, channels and login flow never import
//! `reqwest` directly. [`HttpGateway`] is the production implementation.

use std::fmt;
use std::time::Duration;

use reqwest::Method;
use serde_json::Value;

use crate::auth;
use crate::error::GatewayError;

/// Default REST base of the deployed backend.
pub const DEFAULT_API_URL: &str = "http://localhost:4004/api";

/// One call through the [`Gateway`].
#[derive(Clone, PartialEq)]
pub struct GatewayRequest {
    /// HTTP method.
    pub method: Method,
    /// Path below the API base, e.g. `/patients/me/details`.
    pub path: String,
    /// Query-string pairs.
    pub query: Vec<(String, String)>,
    /// JSON body.
    pub body: Option<Value>,
    /// Bearer token. `None` sends the request anonymously.
    pub token: Option<String>,
}

impl std::fmt::Debug for GatewayRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayRequest")
            .field("method", &self.method)
            .field("path", &self.path)
            .field("query", &self.query)
            .field("has_body", &self.body.is_some())
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl GatewayRequest {
    /// Build a request with no query, body or token.
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
            token: None,
        }
    }

    /// `GET path`.
    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    /// `POST path` with a JSON body.
    pub fn post(path: impl Into<String>, body: Value) -> Self {
        Self::new(Method::POST, path).with_body(body)
    }

    /// `PUT path` with a JSON body.
    pub fn put(path: impl Into<String>, body: Value) -> Self {
        Self::new(Method::PUT, path).with_body(body)
    }

    /// Set the JSON body.
    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Append query-string pairs.
    pub fn with_query<K, V>(mut self, pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.query
            .extend(pairs.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Set (or clear) the bearer token.
    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }
}

/// Request/response access to the backend.
///
/// # Returns
///
/// `Ok(Some(json))` for a 2xx with a body, `Ok(None)` for a 204 or an empty
/// 2xx body.
///
/// # Errors
///
/// See [`GatewayError`] for the status mapping.
#[async_trait::async_trait]
pub trait Gateway: Send + Sync + 'static {
    /// Issue one request.
    async fn request(&self, request: GatewayRequest) -> Result<Option<Value>, GatewayError>;
}

/// [`Gateway`] over HTTP.
///
/// `Clone` is cheap: `reqwest::Client` is reference-counted internally.
#[derive(Clone)]
pub struct HttpGateway {
    http: reqwest::Client,
    base_url: String,
}

impl fmt::Debug for HttpGateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpGateway")
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl HttpGateway {
    /// Create a gateway for `base_url` with a default client.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Transport`] if the HTTP client could not be
    /// built.
    pub fn new(base_url: impl Into<String>) -> Result<Self, GatewayError> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| GatewayError::Transport(format!("http client: {e}")))?;
        Ok(Self::with_client(http, base_url))
    }

    /// Create a gateway for `base_url` whose requests time out after
    /// `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Transport`] if the HTTP client could not be
    /// built (e.g. the TLS backend failed to initialise).
    pub fn with_timeout(
        base_url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, GatewayError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GatewayError::Transport(format!("http client: {e}")))?;
        Ok(Self::with_client(http, base_url))
    }

    /// Create a gateway over a pre-built client.
    pub fn with_client(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_owned(),
        }
    }

    /// Returns the API base, without a trailing slash.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Absolute URL for `path`.
    pub fn url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{path}", self.base_url)
        } else {
            format!("{}/{path}", self.base_url)
        }
    }
}

#[async_trait::async_trait]
impl Gateway for HttpGateway {
    async fn request(&self, request: GatewayRequest) -> Result<Option<Value>, GatewayError> {
        let url = self.url(&request.path);
        let mut builder = self.http.request(request.method.clone(), &url);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        builder = auth::with_bearer(builder, request.token.as_deref())?;
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(|e| {
            tracing::debug!(method = %request.method, path = %request.path, error = %e, "request failed");
            GatewayError::Transport(e.to_string())
        })?;
        let status = response.status().as_u16();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| GatewayError::Transport(format!("reading body: {e}")))?;

        let result = decode_response(status, &bytes);
        if let Err(e) = &result {
            tracing::debug!(method = %request.method, path = %request.path, status, error = %e, "request rejected");
        }
        result
    }
}

/// Map a raw status and body to the gateway's result.
pub(crate) fn decode_response(status: u16, body: &[u8]) -> Result<Option<Value>, GatewayError> {
    if (200..300).contains(&status) {
        if status == 204 || body.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }
        return serde_json::from_slice(body)
            .map(Some)
            .map_err(|e| GatewayError::Decode(format!("response body: {e}")));
    }
    let parsed: Option<Value> = serde_json::from_slice(body).ok();
    Err(GatewayError::from_status(status, parsed.as_ref()))
}

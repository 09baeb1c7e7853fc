//! Remote API seam and the reqwest-backed client.

use async_trait::async_trait;
use reqwest::header::{HeaderValue, ACCEPT_ENCODING, AUTHORIZATION};
use reqwest::{Method, StatusCode};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::RwLock;

use crate::config::ApiConfig;
use crate::error::{Result, SyncError};

/// Per-call knobs.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Overrides the client's default deadline.
    pub timeout: Option<Duration>,
    /// Ask the server for a gzip-encoded response.
    pub compress: bool,
}

impl RequestOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn compressed(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }
}

/// Decoded body plus status of a successful call.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub data: Value,
    pub status: u16,
}

impl ApiResponse {
    pub fn new(status: u16, data: Value) -> Self {
        Self { data, status }
    }

    /// `id` of the returned resource, if the body carries one.
    pub fn remote_id(&self) -> Option<String> {
        match self.data.get("id")? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

/// Request client used by the queue and the domain services.
///
/// Non-2xx responses are returned as [`SyncError::Remote`]; a 409 body holds
/// the server's current version of the resource.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    async fn get(&self, endpoint: &str, opts: &RequestOptions) -> Result<ApiResponse>;

    async fn post(&self, endpoint: &str, payload: &Value, opts: &RequestOptions)
        -> Result<ApiResponse>;

    async fn put(&self, endpoint: &str, payload: &Value, opts: &RequestOptions)
        -> Result<ApiResponse>;

    async fn delete(&self, endpoint: &str, opts: &RequestOptions) -> Result<ApiResponse>;

    async fn upload_file(
        &self,
        endpoint: &str,
        file_name: &str,
        bytes: Vec<u8>,
        opts: &RequestOptions,
    ) -> Result<ApiResponse>;
}

/// Appends URL-encoded query parameters to an endpoint.
pub fn with_query(endpoint: &str, params: &[(&str, String)]) -> String {
    if params.is_empty() {
        return endpoint.to_string();
    }
    let query: Vec<String> = params
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect();
    let sep = if endpoint.contains('?') { '&' } else { '?' };
    format!("{}{}{}", endpoint, sep, query.join("&"))
}

enum Body<'a> {
    Empty,
    Json(&'a Value),
    File { name: &'a str, bytes: &'a [u8] },
}

/// HTTP implementation with bearer auth and one refresh attempt on 401.
pub struct HttpApiClient {
    client: reqwest::Client,
    base_url: String,
    token: RwLock<Option<String>>,
    refresh_token: Option<String>,
    refresh_endpoint: String,
    default_timeout: Duration,
}

impl HttpApiClient {
    pub fn new(base_url: impl Into<String>, default_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .build()
            .map_err(|e| SyncError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.into(),
            token: RwLock::new(None),
            refresh_token: None,
            refresh_endpoint: ApiConfig::default().refresh_endpoint,
            default_timeout,
        })
    }

    /// Builds a client from the `api` config section.
    ///
    /// Returns `Validation` if no base URL is configured.
    pub fn from_config(config: &ApiConfig, default_timeout: Duration) -> Result<Self> {
        let base_url = config
            .base_url
            .clone()
            .ok_or_else(|| SyncError::Validation("api.base_url is not configured".to_string()))?;

        let mut client = Self::new(base_url, default_timeout)?;
        client.token = RwLock::new(config.token.clone());
        client.refresh_token = config.refresh_token.clone();
        client.refresh_endpoint = config.refresh_endpoint.clone();
        Ok(client)
    }

    pub async fn set_token(&self, token: Option<String>) {
        *self.token.write().await = token;
    }

    fn url(&self, endpoint: &str) -> String {
        if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            return endpoint.to_string();
        }
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            endpoint.trim_start_matches('/')
        )
    }

    fn map_send_error(&self, err: reqwest::Error, endpoint: &str, timeout: Duration) -> SyncError {
        if err.is_timeout() {
            SyncError::Timeout(timeout, endpoint.to_string())
        } else if err.is_connect() {
            SyncError::Connectivity
        } else {
            SyncError::Transport(err.to_string())
        }
    }

    async fn send(
        &self,
        method: Method,
        endpoint: &str,
        body: Body<'_>,
        opts: &RequestOptions,
    ) -> Result<ApiResponse> {
        let timeout = opts.timeout.unwrap_or(self.default_timeout);
        let url = self.url(endpoint);
        let mut refreshed = false;

        loop {
            let mut request = self
                .client
                .request(method.clone(), &url)
                .timeout(timeout);

            if !opts.compress {
                request = request.header(ACCEPT_ENCODING, HeaderValue::from_static("identity"));
            }
            if let Some(token) = self.token.read().await.as_deref() {
                request = request.header(AUTHORIZATION, format!("Bearer {}", token));
            }
            request = match &body {
                Body::Empty => request,
                Body::Json(value) => request.json(value),
                Body::File { name, bytes } => {
                    let part = reqwest::multipart::Part::bytes(bytes.to_vec())
                        .file_name(name.to_string());
                    request.multipart(reqwest::multipart::Form::new().part("file", part))
                }
            };

            let response = request
                .send()
                .await
                .map_err(|e| self.map_send_error(e, endpoint, timeout))?;
            let status = response.status();

            if status == StatusCode::UNAUTHORIZED && !refreshed && self.refresh_token.is_some() {
                refreshed = true;
                if self.refresh(timeout).await? {
                    tracing::debug!(endpoint, "Retrying after token refresh");
                    continue;
                }
            }

            let text = response
                .text()
                .await
                .map_err(|e| self.map_send_error(e, endpoint, timeout))?;

            if !status.is_success() {
                return Err(SyncError::remote(status.as_u16(), text));
            }

            let data = if text.trim().is_empty() {
                Value::Null
            } else {
                serde_json::from_str(&text).unwrap_or(Value::String(text))
            };
            return Ok(ApiResponse::new(status.as_u16(), data));
        }
    }

    /// Exchanges the refresh token for a new access token.
    async fn refresh(&self, timeout: Duration) -> Result<bool> {
        let Some(refresh_token) = &self.refresh_token else {
            return Ok(false);
        };

        let response = self
            .client
            .post(self.url(&self.refresh_endpoint))
            .timeout(timeout)
            .json(&json!({ "refreshToken": refresh_token }))
            .send()
            .await
            .map_err(|e| self.map_send_error(e, &self.refresh_endpoint, timeout))?;

        if !response.status().is_success() {
            tracing::warn!(status = response.status().as_u16(), "Token refresh rejected");
            return Ok(false);
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| SyncError::Transport(e.to_string()))?;
        let token = body
            .get("accessToken")
            .or_else(|| body.get("token"))
            .and_then(Value::as_str)
            .map(str::to_string);

        match token {
            Some(token) => {
                *self.token.write().await = Some(token);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[async_trait]
impl RemoteApi for HttpApiClient {
    async fn get(&self, endpoint: &str, opts: &RequestOptions) -> Result<ApiResponse> {
        self.send(Method::GET, endpoint, Body::Empty, opts).await
    }

    async fn post(
        &self,
        endpoint: &str,
        payload: &Value,
        opts: &RequestOptions,
    ) -> Result<ApiResponse> {
        self.send(Method::POST, endpoint, Body::Json(payload), opts)
            .await
    }

    async fn put(
        &self,
        endpoint: &str,
        payload: &Value,
        opts: &RequestOptions,
    ) -> Result<ApiResponse> {
        self.send(Method::PUT, endpoint, Body::Json(payload), opts)
            .await
    }

    async fn delete(&self, endpoint: &str, opts: &RequestOptions) -> Result<ApiResponse> {
        self.send(Method::DELETE, endpoint, Body::Empty, opts).await
    }

    async fn upload_file(
        &self,
        endpoint: &str,
        file_name: &str,
        bytes: Vec<u8>,
        opts: &RequestOptions,
    ) -> Result<ApiResponse> {
        let body = Body::File {
            name: file_name,
            bytes: &bytes,
        };
        self.send(Method::POST, endpoint, body, opts).await
    }
}

/// Stand-in used when no backend is configured. Every call fails with
/// [`SyncError::Connectivity`], so writes end up in the queue.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisconnectedApi;

#[async_trait]
impl RemoteApi for DisconnectedApi {
    async fn get(&self, _endpoint: &str, _opts: &RequestOptions) -> Result<ApiResponse> {
        Err(SyncError::Connectivity)
    }

    async fn post(&self, _endpoint: &str, _payload: &Value, _opts: &RequestOptions) -> Result<ApiResponse> {
        Err(SyncError::Connectivity)
    }

    async fn put(&self, _endpoint: &str, _payload: &Value, _opts: &RequestOptions) -> Result<ApiResponse> {
        Err(SyncError::Connectivity)
    }

    async fn delete(&self, _endpoint: &str, _opts: &RequestOptions) -> Result<ApiResponse> {
        Err(SyncError::Connectivity)
    }

    async fn upload_file(
        &self,
        _endpoint: &str,
        _file_name: &str,
        _bytes: Vec<u8>,
        _opts: &RequestOptions,
    ) -> Result<ApiResponse> {
        Err(SyncError::Connectivity)
    }
}

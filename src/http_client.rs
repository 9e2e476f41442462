//! HTTP client: header injection, status-to-error mapping, single-retry
//! token refresh, and RFC 7231 `Retry-After` parsing.
//!
//! Outbound sends go through a [`Transport`] trait rather than a bare
//! `reqwest::Client`, the same way [`crate::sleeper::Sleeper`] and
//! [`crate::clock::Clock`] sit between this crate's logic and the real
//! clock/executor — production code uses [`ReqwestTransport`], tests wire
//! in an in-memory double that never opens a socket.

use crate::error::SyncError;
use crate::model::{OpType, PendingOp};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Method;
use serde_json::Value as JsonValue;
use std::time::Duration;

/// Supplies the bearer token for outbound requests and refreshes it once
/// on a 401. Implementations are host-specific (Firebase, Cognito, a
/// custom session service); the client only needs these two operations.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Current token, if the host has one cached.
    async fn token(&self) -> Option<String>;

    /// Attempt to obtain a fresh token after a 401. Returns the new token
    /// on success; the client retries the failed request exactly once.
    async fn try_refresh(&self) -> Result<String, SyncError>;
}

/// Fixed-token provider for tests and hosts with no refresh flow.
#[derive(Debug, Clone)]
pub struct StaticAuthProvider {
    token: Option<String>,
    refreshed: Option<String>,
}

impl StaticAuthProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self { token: Some(token.into()), refreshed: None }
    }

    /// A provider whose refresh always succeeds with `refreshed`.
    pub fn with_refresh(token: impl Into<String>, refreshed: impl Into<String>) -> Self {
        Self { token: Some(token.into()), refreshed: Some(refreshed.into()) }
    }

    /// A provider with no token and a refresh that always fails.
    pub fn unauthenticated() -> Self {
        Self { token: None, refreshed: None }
    }
}

#[async_trait]
impl AuthProvider for StaticAuthProvider {
    async fn token(&self) -> Option<String> {
        self.token.clone()
    }

    async fn try_refresh(&self) -> Result<String, SyncError> {
        self.refreshed.clone().ok_or(SyncError::Auth { requires_login: true })
    }
}

/// Derives method + path for an operation. The core is agnostic to entity
/// schemas, so hosts that need anything richer than `/{entity_type}/{id}`
/// supply their own resolver.
pub trait EndpointResolver: Send + Sync {
    fn method_for(&self, op_type: OpType) -> Method;
    fn path_for(&self, op: &PendingOp) -> String;
    /// Path to a specific resource by id, independent of any op in flight.
    /// Used by the reconciler to GET a resource a CREATE conflicted with,
    /// where `path_for` would otherwise return the collection endpoint.
    fn resource_path(&self, entity_type: &str, id: &str) -> String;
}

/// `/{entity_type}` for CREATE, `/{entity_type}/{id}` for UPDATE/DELETE,
/// where `{id}` is `payload["id"]` if present, else `op.id`.
/// CREATE -> POST, UPDATE -> PATCH, DELETE -> DELETE.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultEndpointResolver;

impl DefaultEndpointResolver {
    fn resource_id(op: &PendingOp) -> String {
        op.payload
            .get("id")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| op.id.clone())
    }
}

impl EndpointResolver for DefaultEndpointResolver {
    fn method_for(&self, op_type: OpType) -> Method {
        match op_type {
            OpType::Create => Method::POST,
            OpType::Update => Method::PATCH,
            OpType::Delete => Method::DELETE,
        }
    }

    fn path_for(&self, op: &PendingOp) -> String {
        match op.op_type {
            OpType::Create => format!("/{}", op.entity_type),
            OpType::Update | OpType::Delete => {
                format!("/{}/{}", op.entity_type, Self::resource_id(op))
            }
        }
    }

    fn resource_path(&self, entity_type: &str, id: &str) -> String {
        format!("/{entity_type}/{id}")
    }
}

/// Per-request headers the caller supplies beyond auth/content-type.
#[derive(Debug, Clone, Default)]
pub struct RequestHeaders {
    pub idempotency_key: Option<String>,
    pub trace_id: Option<String>,
}

/// Configuration for [`HttpClient`].
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub base_url: String,
    pub app_version: String,
    pub device_id: String,
    pub request_timeout: Duration,
    /// Cap applied to a parsed `Retry-After` value, mirroring
    /// `BackoffConfig::max_ms` without requiring this client to depend on
    /// the backoff module.
    pub retry_after_cap: Duration,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            app_version: "dev".into(),
            device_id: "unknown".into(),
            request_timeout: Duration::from_secs(30),
            retry_after_cap: Duration::from_secs(30),
        }
    }
}

/// Successful response: decoded body plus the latency observed, so the
/// caller (the engine) can feed it to [`crate::metrics::Metrics`] without
/// this client owning a metrics handle itself.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub body: JsonValue,
    pub latency: Duration,
}

/// A fully-assembled outbound request, independent of whichever
/// [`Transport`] actually ships it over the wire.
#[derive(Debug, Clone)]
pub struct OutgoingRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<JsonValue>,
}

/// A response as seen off the wire, before status-code interpretation.
#[derive(Debug, Clone)]
pub struct IncomingResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: JsonValue,
}

/// Ships an [`OutgoingRequest`] and returns the raw [`IncomingResponse`].
/// [`HttpClient`] owns all status-code interpretation; a `Transport` only
/// moves bytes.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: OutgoingRequest) -> Result<IncomingResponse, SyncError>;
}

/// Production transport backed by `reqwest`.
#[derive(Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("reqwest client configuration is always valid here");
        Self { client }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: OutgoingRequest) -> Result<IncomingResponse, SyncError> {
        let mut builder = self.client.request(request.method, &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response =
            builder.send().await.map_err(|e| SyncError::Network { message: e.to_string() })?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
            .collect();
        let text =
            response.text().await.map_err(|e| SyncError::Network { message: e.to_string() })?;
        let body = if text.trim().is_empty() {
            serde_json::json!({})
        } else {
            serde_json::from_str(&text)
                .map_err(|e| SyncError::Internal { message: format!("invalid JSON body: {e}") })?
        };
        Ok(IncomingResponse { status, headers, body })
    }
}

/// Injects auth/app/device/idempotency/trace headers, maps non-2xx status
/// codes to [`SyncError`], and retries once on 401 after a token refresh.
#[derive(Clone)]
pub struct HttpClient {
    transport: std::sync::Arc<dyn Transport>,
    config: HttpClientConfig,
    auth: std::sync::Arc<dyn AuthProvider>,
}

impl HttpClient {
    pub fn new(
        transport: std::sync::Arc<dyn Transport>,
        config: HttpClientConfig,
        auth: std::sync::Arc<dyn AuthProvider>,
    ) -> Self {
        Self { transport, config, auth }
    }

    /// Convenience constructor wiring up the production `reqwest` transport.
    pub fn with_reqwest(config: HttpClientConfig, auth: std::sync::Arc<dyn AuthProvider>) -> Self {
        let transport = std::sync::Arc::new(ReqwestTransport::new(config.request_timeout));
        Self::new(transport, config, auth)
    }

    pub async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<JsonValue>,
        headers: RequestHeaders,
    ) -> Result<HttpResponse, SyncError> {
        self.request_inner(method, path, body, headers, false).await
    }

    async fn request_inner(
        &self,
        method: Method,
        path: &str,
        body: Option<JsonValue>,
        headers: RequestHeaders,
        already_retried: bool,
    ) -> Result<HttpResponse, SyncError> {
        let url = format!("{}{}", self.config.base_url.trim_end_matches('/'), path);
        let started = std::time::Instant::now();

        let mut wire_headers = vec![
            ("X-App-Version".to_string(), self.config.app_version.clone()),
            ("X-Device-Id".to_string(), self.config.device_id.clone()),
        ];
        if let Some(token) = self.auth.token().await {
            wire_headers.push(("Authorization".to_string(), format!("Bearer {token}")));
        }
        if let Some(key) = &headers.idempotency_key {
            wire_headers.push(("Idempotency-Key".to_string(), key.clone()));
        }
        if let Some(trace_id) = &headers.trace_id {
            wire_headers.push(("Trace-Id".to_string(), trace_id.clone()));
        }
        if body.is_some() {
            wire_headers.push(("Content-Type".to_string(), "application/json".to_string()));
        }

        let response = self
            .transport
            .send(OutgoingRequest { method: method.clone(), url: url.clone(), headers: wire_headers, body: body.clone() })
            .await?;
        let latency = started.elapsed();

        if (200..300).contains(&response.status) {
            tracing::debug!(%url, status = response.status, latency_ms = latency.as_millis() as u64, "request succeeded");
            return Ok(HttpResponse { body: response.body, latency });
        }

        match response.status {
            401 => {
                if already_retried {
                    let requires_login = response
                        .body
                        .get("requires_login")
                        .and_then(|v| v.as_bool())
                        .unwrap_or(true);
                    return Err(SyncError::Auth { requires_login });
                }
                self.auth.try_refresh().await?;
                tracing::info!(%url, "token refreshed after 401, retrying once");
                Box::pin(self.request_inner(method, path, body, headers, true)).await
            }
            400 => {
                let (field, message) = parse_validation_body(&response.body);
                Err(SyncError::Validation { field, message })
            }
            403 => Err(SyncError::PermissionDenied),
            404 => {
                let resource_id =
                    response.body.get("resource_id").and_then(|v| v.as_str()).map(str::to_string);
                Err(SyncError::ResourceNotFound { resource_id })
            }
            409 => {
                let conflict_type = response
                    .body
                    .get("conflict_type")
                    .and_then(|v| v.as_str())
                    .unwrap_or("unknown")
                    .to_string();
                let server_version = response.body.get("server_version").and_then(|v| v.as_i64());
                let client_version = response.body.get("client_version").and_then(|v| v.as_i64());
                Err(SyncError::Conflict {
                    conflict_type,
                    server_version,
                    client_version,
                    body: response.body,
                })
            }
            429 | 503 => {
                let retry_after = response
                    .headers
                    .iter()
                    .find(|(name, _)| name.eq_ignore_ascii_case("retry-after"))
                    .and_then(|(_, value)| parse_retry_after(value))
                    .map(|d| d.min(self.config.retry_after_cap));
                Err(SyncError::Retryable { retry_after })
            }
            s if (500..600).contains(&s) => Err(SyncError::Server { status: s }),
            s => Err(SyncError::Internal { message: format!("unexpected status {s}") }),
        }
    }
}

fn parse_validation_body(body: &JsonValue) -> (Option<String>, String) {
    let message = body
        .get("error")
        .and_then(|v| v.as_str())
        .unwrap_or("validation failed")
        .to_string();
    let field = body
        .get("fields")
        .and_then(|v| v.as_object())
        .and_then(|fields| fields.keys().next())
        .cloned();
    (field, message)
}

/// Parses an RFC 7231 `Retry-After` value: either decimal seconds or an
/// HTTP-date (`max(0, date - now)`).
fn parse_retry_after(raw: &str) -> Option<Duration> {
    if let Ok(seconds) = raw.trim().parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    parse_http_date(raw.trim()).map(|when| {
        let now = Utc::now();
        let delta = when - now;
        Duration::from_secs(delta.num_seconds().max(0) as u64)
    })
}

fn parse_http_date(raw: &str) -> Option<DateTime<Utc>> {
    // IMF-fixdate, e.g. "Sun, 06 Nov 1994 08:49:37 GMT" (the only form
    // RFC 7231 requires servers to send; the obsolete RFC 850 / asctime
    // forms are not generated by HTTP servers in this API's contract).
    chrono::NaiveDateTime::parse_from_str(raw, "%a, %d %b %Y %H:%M:%S GMT")
        .ok()
        .map(|naive| DateTime::from_naive_utc_and_offset(naive, Utc))
}

// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! HTTP plumbing shared by every call to the streaming endpoint.
//!
//! Hostname resolution, channel open, row insert and bulk status all go
//! through [`HttpClient::send_request`], which attaches headers, applies the
//! per-request timeout and maps non-success statuses to [`HttpError`]. The
//! single [`BackoffPolicy`] decides which of those failures are retried and
//! how long to wait between attempts.

use std::borrow::Cow;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE, USER_AGENT};
use reqwest::{Client, Method, Response, StatusCode};
use thiserror::Error;
use tracing::{debug, warn};

/// Header telling the control plane which kind of bearer token is attached.
pub const TOKEN_TYPE_HEADER: &str = "X-Snowflake-Authorization-Token-Type";
/// Token type value for key-pair signed JWTs.
pub const KEYPAIR_JWT: &str = "KEYPAIR_JWT";

/// Error taxonomy for a single HTTP exchange.
#[derive(Debug, Error)]
pub enum HttpError {
    /// The request did not complete within the configured timeout.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    /// The endpoint answered with a non-success status.
    #[error("unexpected status {status}: {body}")]
    Status { status: StatusCode, body: String },
    /// The provided URL violates the required transport policy.
    #[error("insecure url requires explicit opt-in: {0}")]
    InsecureUrl(String),
    /// A header value could not be encoded.
    #[error("invalid header value for {0}")]
    InvalidHeader(&'static str),
    /// Transport-level issue (DNS, TLS, socket, etc.).
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

impl HttpError {
    /// Returns the HTTP status when the failure came from a response.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Status { status, .. } => Some(*status),
            Self::Transport(err) => err.status(),
            _ => None,
        }
    }

    /// Response body (if any) attached to the failure.
    pub fn body(&self) -> &str {
        match self {
            Self::Status { body, .. } => body,
            _ => "",
        }
    }
}

/// Options governing how the HTTP client is constructed.
#[derive(Debug, Clone, Copy)]
pub struct HttpClientOptions {
    /// Whether plaintext (HTTP) endpoints are allowed.
    pub allow_plaintext: bool,
    /// Whether TLS certificate validation should be skipped.
    pub accept_invalid_certs: bool,
    /// Timeout applied to every request.
    pub request_timeout: Duration,
}

impl Default for HttpClientOptions {
    fn default() -> Self {
        Self {
            allow_plaintext: false,
            accept_invalid_certs: false,
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// Reusable `reqwest::Client` plus the transport policy it was built with.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
    options: HttpClientOptions,
}

impl HttpClient {
    pub fn new(options: HttpClientOptions) -> Result<Self, HttpError> {
        let mut headers = HeaderMap::new();
        let user_agent = format!("streaming-ingest/{}", env!("CARGO_PKG_VERSION"));
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&user_agent).map_err(|_| HttpError::InvalidHeader("user-agent"))?,
        );

        if options.accept_invalid_certs {
            warn!("TLS certificate validation is disabled");
        }
        let client = Client::builder()
            .use_rustls_tls()
            .default_headers(headers)
            .danger_accept_invalid_certs(options.accept_invalid_certs)
            .build()?;

        Ok(Self { client, options })
    }

    pub fn request_timeout(&self) -> Duration {
        self.options.request_timeout
    }

    /// Rejects plaintext URLs unless the client was built with `allow_plaintext`.
    pub fn ensure_transport_policy(&self, url: &str) -> Result<(), HttpError> {
        if !self.options.allow_plaintext && url.starts_with("http://") {
            return Err(HttpError::InsecureUrl(url.to_string()));
        }
        Ok(())
    }

    /// Builds the `https://host` (or `http://host` in plaintext mode) base for a bare hostname.
    pub fn base_url_for_host(&self, host: &str) -> String {
        if host.starts_with("http://") || host.starts_with("https://") {
            return host.trim_end_matches('/').to_string();
        }
        let scheme = if self.options.allow_plaintext {
            "http"
        } else {
            "https"
        };
        format!("{scheme}://{}", host.trim_end_matches('/'))
    }

    /// Sends one request and classifies the response status.
    ///
    /// Success responses are returned untouched so callers decode the body.
    /// Every other status is buffered, logged and turned into
    /// [`HttpError::Status`].
    pub async fn send_request(
        &self,
        method: Method,
        url: &str,
        headers: HeaderMap,
        query: &[(&str, String)],
        body: Option<Vec<u8>>,
    ) -> Result<Response, HttpError> {
        self.ensure_transport_policy(url)?;

        let body_len = body.as_ref().map(Vec::len).unwrap_or(0);
        if tracing::enabled!(tracing::Level::TRACE) {
            if let Some(bytes) = &body {
                debug!(
                    method = %method,
                    url = %url,
                    headers = ?redact_headers(&headers),
                    body_len = body_len,
                    body = %request_body_preview(&headers, bytes),
                    "streaming HTTP request"
                );
            }
        } else {
            debug!(
                method = %method,
                url = %url,
                headers = ?redact_headers(&headers),
                body_len = body_len,
                "streaming HTTP request"
            );
        }

        let builder = self
            .client
            .request(method.clone(), url)
            .timeout(self.options.request_timeout)
            .headers(headers);
        let builder = if query.is_empty() {
            builder
        } else {
            builder.query(query)
        };
        let builder = match body {
            Some(bytes) => builder.body(bytes),
            None => builder,
        };

        let response = builder.send().await.map_err(|err| {
            if err.is_timeout() {
                HttpError::Timeout(self.options.request_timeout)
            } else {
                HttpError::Transport(err)
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body_bytes = response.bytes().await.unwrap_or_default();
            let body = String::from_utf8_lossy(&body_bytes).into_owned();
            debug!(
                method = %method,
                url = %url,
                status = %status,
                body = %body,
                "streaming HTTP response"
            );
            return Err(HttpError::Status { status, body });
        }

        debug!(method = %method, url = %url, status = %status, "streaming HTTP response");
        Ok(response)
    }
}

/// Headers carrying a bearer token and, for control-plane calls, its type.
pub fn bearer_headers(
    token: &str,
    token_type: Option<&'static str>,
    content_type: Option<&'static str>,
) -> Result<HeaderMap, HttpError> {
    let mut headers = HeaderMap::new();
    headers.insert(
        AUTHORIZATION,
        HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|_| HttpError::InvalidHeader("authorization"))?,
    );
    if let Some(token_type) = token_type {
        headers.insert(TOKEN_TYPE_HEADER, HeaderValue::from_static(token_type));
    }
    if let Some(content_type) = content_type {
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    }
    headers.insert("Accept", HeaderValue::from_static("application/json"));
    Ok(headers)
}

/// Returns a redacted view of request headers suitable for debug logging.
fn redact_headers(headers: &HeaderMap) -> Vec<(String, String)> {
    const SENSITIVE_HEADERS: [&str; 2] = ["authorization", "proxy-authorization"];

    headers
        .iter()
        .map(|(name, value)| {
            let lower = name.as_str().to_ascii_lowercase();
            let display = if SENSITIVE_HEADERS.contains(&lower.as_str()) {
                "<redacted>".to_string()
            } else {
                value
                    .to_str()
                    .map(|s| s.to_string())
                    .unwrap_or_else(|_| "<non-utf8>".to_string())
            };
            (lower, display)
        })
        .collect()
}

/// Human-readable preview of a request body for verbose logging.
fn request_body_preview(headers: &HeaderMap, body: &[u8]) -> String {
    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_ascii_lowercase();
    if !(content_type.contains("json") || content_type.contains("text")) {
        return format!("[{} bytes binary]", body.len());
    }
    truncate_preview_text(String::from_utf8_lossy(body))
}

fn truncate_preview_text(text: Cow<'_, str>) -> String {
    const MAX_CHARS: usize = 1024;
    let mut chars = text.chars();
    let mut preview = String::new();
    for _ in 0..MAX_CHARS {
        match chars.next() {
            Some(ch) => preview.push(ch),
            None => return preview,
        }
    }
    if chars.next().is_some() {
        preview.push('…');
    }
    preview
}

/// Statuses retried by default: throttling and server-side failures.
pub fn default_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

/// Exponential backoff with jitter, shared by every network call site.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound on a single delay, before jitter.
    pub max_delay: Duration,
    /// Multiplier applied per retry.
    pub factor: f64,
    /// Fraction of the delay randomly added or removed (0.0 to 1.0).
    pub jitter: f64,
    /// Which response statuses are transient.
    pub retryable_status: fn(StatusCode) -> bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            factor: 2.0,
            jitter: 0.2,
            retryable_status: default_retryable_status,
        }
    }
}

/// Value produced by a retried call, with the number of attempts it took.
#[derive(Debug)]
pub struct Attempted<T> {
    pub value: T,
    pub attempts: u32,
}

/// Final failure of a retried call.
#[derive(Debug, Error)]
#[error("failed after {attempts} attempt(s): {error}")]
pub struct RetryError {
    pub error: HttpError,
    pub attempts: u32,
    /// `true` when the error was transient and the attempt budget ran out.
    pub exhausted: bool,
}

impl BackoffPolicy {
    /// Whether `error` is transient under this policy.
    pub fn is_retryable(&self, error: &HttpError) -> bool {
        match error {
            HttpError::Timeout(_) => true,
            HttpError::Status { status, .. } => (self.retryable_status)(*status),
            HttpError::Transport(err) => match err.status() {
                Some(status) => (self.retryable_status)(status),
                None => err.is_timeout() || err.is_connect() || err.is_request(),
            },
            HttpError::InsecureUrl(_) | HttpError::InvalidHeader(_) => false,
        }
    }

    /// Un-jittered delay before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(100) as i32;
        let secs = self.base_delay.as_secs_f64() * self.factor.powi(exponent);
        let capped = secs.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }

    fn jittered(&self, delay: Duration) -> Duration {
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 || delay.is_zero() {
            return delay;
        }
        let spread = rand::thread_rng().gen_range(-jitter..=jitter);
        delay.mul_f64(1.0 + spread)
    }

    /// Runs `call` until it succeeds, fails permanently, or the attempt budget runs out.
    pub async fn retry<T, F, Fut>(
        &self,
        operation: &str,
        mut call: F,
    ) -> Result<Attempted<T>, RetryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, HttpError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempts = 0;
        loop {
            attempts += 1;
            match call().await {
                Ok(value) => return Ok(Attempted { value, attempts }),
                Err(error) => {
                    if !self.is_retryable(&error) {
                        return Err(RetryError {
                            error,
                            attempts,
                            exhausted: false,
                        });
                    }
                    if attempts >= max_attempts {
                        warn!(operation, attempts, %error, "giving up after retries");
                        return Err(RetryError {
                            error,
                            attempts,
                            exhausted: true,
                        });
                    }
                    let delay = self.jittered(self.delay_for(attempts));
                    debug!(operation, attempts, ?delay, %error, "retrying after transient failure");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Channel negotiation against the streaming endpoint.
//!
//! Opening a channel is a two step exchange driven by the control-plane
//! bearer token:
//!
//! ```text
//!   CLOSED ──> RESOLVING ──> OPENING ──> OPEN
//!                  │             │
//!                  └─────────────┴──> FAILED
//! ```
//!
//! RESOLVING asks the control plane for the account's data-plane host.
//! OPENING asks the data plane for the channel's scoped token, continuation
//! token and last committed offset. The negotiator keeps no state once the
//! [`ChannelHandle`] is returned.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::config::PipeTarget;
use crate::cursor::Cursor;
use crate::error::IngestError;
use crate::http::{bearer_headers, BackoffPolicy, HttpClient, HttpError, RetryError, KEYPAIR_JWT};
use crate::token::BearerToken;

const HOSTNAME_PATH: &str = "/v2/streaming/hostname";

/// Live delivery session for one channel.
#[derive(Debug, Clone)]
pub struct ChannelHandle {
    pub channel_name: String,
    /// Base URL of the data-plane host rows are sent to.
    pub ingest_endpoint: String,
    pub scoped_token: BearerToken,
    pub continuation_token: String,
    pub offset: u64,
}

impl ChannelHandle {
    /// Cursor positioned where the endpoint says the channel stands.
    pub fn cursor(&self) -> Cursor {
        Cursor::new(self.continuation_token.clone(), self.offset)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Closed,
    Resolving,
    Opening,
    Open,
    Failed,
}

#[derive(Debug, Serialize)]
struct OpenChannelRequest<'a> {
    channel_name: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OffsetToken {
    Number(u64),
    Text(String),
}

#[derive(Debug, Deserialize)]
struct OpenChannelResponse {
    ingest_host: Option<String>,
    scoped_token: Option<String>,
    continuation_token: Option<String>,
    offset_token: Option<OffsetToken>,
    scoped_token_expires_in: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct HostnameResponse {
    hostname: String,
}

#[derive(Debug, Serialize)]
struct BulkStatusRequest<'a> {
    channel_names: &'a [String],
}

#[derive(Debug, Deserialize)]
struct BulkStatusResponse {
    #[serde(default)]
    channel_statuses: HashMap<String, ChannelStatus>,
}

/// Health and progress of one channel as reported by the endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ChannelStatus {
    #[serde(default)]
    pub channel_status_code: String,
    #[serde(default)]
    pub last_committed_offset_token: Option<String>,
    #[serde(default)]
    pub rows_inserted: u64,
    #[serde(default)]
    pub rows_error_count: u64,
}

impl ChannelStatus {
    pub fn committed_offset(&self) -> Option<u64> {
        self.last_committed_offset_token
            .as_deref()
            .and_then(|token| token.trim().parse().ok())
    }
}

/// Resolves the data-plane host and opens channels on it.
#[derive(Debug, Clone)]
pub struct ChannelNegotiator {
    http: HttpClient,
    control_plane_url: String,
    target: PipeTarget,
    backoff: BackoffPolicy,
    scoped_token_ttl: Duration,
}

impl ChannelNegotiator {
    pub fn new(
        http: HttpClient,
        control_plane_url: impl Into<String>,
        target: PipeTarget,
        backoff: BackoffPolicy,
        scoped_token_ttl: Duration,
    ) -> Self {
        Self {
            http,
            control_plane_url: control_plane_url.into().trim_end_matches('/').to_string(),
            target,
            backoff,
            scoped_token_ttl,
        }
    }

    pub fn target(&self) -> &PipeTarget {
        &self.target
    }

    /// Opens `channel_name` using the control-plane `bearer` token.
    pub async fn open(
        &self,
        bearer: &BearerToken,
        channel_name: &str,
    ) -> Result<ChannelHandle, IngestError> {
        let mut state = NegotiationState::Closed;
        if bearer.is_expired() {
            return Err(IngestError::AuthExpired);
        }

        transition(&mut state, NegotiationState::Resolving, channel_name);
        let host = match self.resolve_host(bearer).await {
            Ok(host) => host,
            Err(err) => {
                transition(&mut state, NegotiationState::Failed, channel_name);
                error!(channel = channel_name, "failed to resolve ingest host: {err}");
                return Err(err);
            }
        };

        transition(&mut state, NegotiationState::Opening, channel_name);
        match self.open_channel(bearer, &host, channel_name).await {
            Ok(handle) => {
                transition(&mut state, NegotiationState::Open, channel_name);
                info!(
                    channel = channel_name,
                    ingest_endpoint = %handle.ingest_endpoint,
                    offset = handle.offset,
                    "channel open"
                );
                Ok(handle)
            }
            Err(err) => {
                transition(&mut state, NegotiationState::Failed, channel_name);
                error!(channel = channel_name, "failed to open channel: {err}");
                Err(err)
            }
        }
    }

    async fn resolve_host(&self, bearer: &BearerToken) -> Result<String, IngestError> {
        let url = format!("{}{HOSTNAME_PATH}", self.control_plane_url);
        let headers = bearer_headers(bearer.value(), Some(KEYPAIR_JWT), None)
            .map_err(|err| IngestError::Key(err.to_string()))?;

        let response = self
            .backoff
            .retry("resolve_host", || {
                self.http
                    .send_request(Method::GET, &url, headers.clone(), &[], None)
            })
            .await
            .map_err(unreachable_error)?
            .value;

        let body = response
            .text()
            .await
            .map_err(|err| IngestError::Protocol(format!("unreadable hostname response: {err}")))?;
        parse_hostname(&body)
    }

    async fn open_channel(
        &self,
        bearer: &BearerToken,
        host: &str,
        channel_name: &str,
    ) -> Result<ChannelHandle, IngestError> {
        let base = self.http.base_url_for_host(host);
        let url = format!("{base}{}", self.target.channel_path(channel_name));
        let headers = bearer_headers(bearer.value(), Some(KEYPAIR_JWT), Some("application/json"))
            .map_err(|err| IngestError::Key(err.to_string()))?;
        let body = serde_json::to_vec(&OpenChannelRequest { channel_name })
            .map_err(|err| IngestError::Protocol(err.to_string()))?;

        let response = self
            .backoff
            .retry("open_channel", || {
                self.http.send_request(
                    Method::PUT,
                    &url,
                    headers.clone(),
                    &[],
                    Some(body.clone()),
                )
            })
            .await
            .map_err(|err| self.open_error(err))?
            .value;

        let bytes = response
            .bytes()
            .await
            .map_err(|err| IngestError::Protocol(format!("unreadable open-channel response: {err}")))?;
        let parsed: OpenChannelResponse = serde_json::from_slice(&bytes)
            .map_err(|err| IngestError::Protocol(format!("malformed open-channel response: {err}")))?;

        let ingest_host = required(parsed.ingest_host, "ingest_host")?;
        let scoped_token = required(parsed.scoped_token, "scoped_token")?;
        let continuation_token = required(parsed.continuation_token, "continuation_token")?;
        let offset = match parsed.offset_token {
            None => 0,
            Some(OffsetToken::Number(offset)) => offset,
            Some(OffsetToken::Text(text)) if text.trim().is_empty() => 0,
            Some(OffsetToken::Text(text)) => text.trim().parse().map_err(|_| {
                IngestError::Protocol(format!("offset_token {text:?} is not a numeric offset"))
            })?,
        };

        let ttl = parsed
            .scoped_token_expires_in
            .map(Duration::from_secs)
            .unwrap_or(self.scoped_token_ttl);
        let issued_at = Utc::now();
        let expires_at = issued_at
            + chrono::Duration::from_std(ttl)
                .map_err(|err| IngestError::Protocol(format!("scoped token ttl: {err}")))?;

        Ok(ChannelHandle {
            channel_name: channel_name.to_string(),
            ingest_endpoint: self.http.base_url_for_host(&ingest_host),
            scoped_token: BearerToken::new(scoped_token, issued_at, expires_at),
            continuation_token,
            offset,
        })
    }

    fn open_error(&self, err: RetryError) -> IngestError {
        if err.exhausted {
            return unreachable_error(err);
        }
        match err.error.status() {
            Some(StatusCode::NOT_FOUND) => IngestError::ChannelOpenRejected {
                status: 404,
                reason: format!(
                    "pipe {}.{}.{} does not exist",
                    self.target.database, self.target.schema, self.target.pipe
                ),
            },
            Some(status) if status.is_client_error() => IngestError::ChannelOpenRejected {
                status: status.as_u16(),
                reason: non_empty_or(err.error.body(), status.canonical_reason().unwrap_or("rejected")),
            },
            _ => unreachable_error(err),
        }
    }

    /// Asks the endpoint for the health and committed offset of `channel_names`.
    pub async fn bulk_status(
        &self,
        handle: &ChannelHandle,
        channel_names: &[String],
    ) -> Result<HashMap<String, ChannelStatus>, IngestError> {
        if handle.scoped_token.is_expired() {
            return Err(IngestError::AuthExpired);
        }
        let url = format!("{}{}", handle.ingest_endpoint, self.target.bulk_status_path());
        let headers = bearer_headers(handle.scoped_token.value(), None, Some("application/json"))
            .map_err(|err| IngestError::Key(err.to_string()))?;
        let body = serde_json::to_vec(&BulkStatusRequest { channel_names })
            .map_err(|err| IngestError::Protocol(err.to_string()))?;

        let response = self
            .backoff
            .retry("bulk_channel_status", || {
                self.http.send_request(
                    Method::POST,
                    &url,
                    headers.clone(),
                    &[],
                    Some(body.clone()),
                )
            })
            .await
            .map_err(|err| {
                if err.exhausted {
                    return IngestError::Transport {
                        attempts: err.attempts,
                        source: err.error,
                    };
                }
                match err.error.status() {
                    Some(StatusCode::UNAUTHORIZED) => IngestError::AuthExpired,
                    Some(status) => IngestError::Protocol(format!(
                        "bulk channel status rejected with {status}"
                    )),
                    None => IngestError::Transport {
                        attempts: err.attempts,
                        source: err.error,
                    },
                }
            })?
            .value;

        let bytes = response
            .bytes()
            .await
            .map_err(|err| IngestError::Protocol(format!("unreadable status response: {err}")))?;
        let parsed: BulkStatusResponse = serde_json::from_slice(&bytes)
            .map_err(|err| IngestError::Protocol(format!("malformed status response: {err}")))?;
        for name in channel_names {
            if !parsed.channel_statuses.contains_key(name) {
                warn!(channel = %name, "bulk status response has no entry for channel");
            }
        }
        Ok(parsed.channel_statuses)
    }
}

fn transition(state: &mut NegotiationState, next: NegotiationState, channel: &str) {
    debug!(channel, from = ?*state, to = ?next, "channel negotiation");
    *state = next;
}

fn unreachable_error(err: RetryError) -> IngestError {
    match err.error {
        HttpError::InsecureUrl(url) => {
            IngestError::InvalidConfig(format!("insecure url requires explicit opt-in: {url}"))
        }
        error => IngestError::EndpointUnreachable {
            attempts: err.attempts,
            reason: error.to_string(),
        },
    }
}

fn required(value: Option<String>, field: &str) -> Result<String, IngestError> {
    value
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| IngestError::Protocol(format!("open-channel response missing `{field}`")))
}

fn non_empty_or(value: &str, fallback: &str) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        fallback.to_string()
    } else {
        trimmed.to_string()
    }
}

/// Accepts either a bare hostname or `{"hostname": "..."}`.
fn parse_hostname(body: &str) -> Result<String, IngestError> {
    let trimmed = body.trim();
    let host = if trimmed.starts_with('{') {
        serde_json::from_str::<HostnameResponse>(trimmed)
            .map_err(|err| IngestError::Protocol(format!("malformed hostname response: {err}")))?
            .hostname
    } else {
        trimmed.trim_matches('"').to_string()
    };
    if host.trim().is_empty() {
        return Err(IngestError::Protocol("hostname response is empty".to_string()));
    }
    Ok(host.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_and_json_hostnames() {
        assert_eq!(
            parse_hostname("ingest.example.com\n").unwrap(),
            "ingest.example.com"
        );
        assert_eq!(
            parse_hostname(r#"{"hostname":"ingest.example.com"}"#).unwrap(),
            "ingest.example.com"
        );
        assert!(matches!(parse_hostname("  "), Err(IngestError::Protocol(_))));
        assert!(matches!(
            parse_hostname(r#"{"host":"x"}"#),
            Err(IngestError::Protocol(_))
        ));
    }

    #[test]
    fn required_rejects_missing_and_blank_fields() {
        assert!(required(Some("ct".into()), "continuation_token").is_ok());
        assert!(matches!(
            required(None, "continuation_token"),
            Err(IngestError::Protocol(msg)) if msg.contains("continuation_token")
        ));
        assert!(required(Some(" ".into()), "scoped_token").is_err());
    }

    #[test]
    fn channel_status_committed_offset() {
        let status: ChannelStatus = serde_json::from_str(
            r#"{"channel_status_code":"SUCCESS","last_committed_offset_token":"1200","rows_inserted":1200}"#,
        )
        .unwrap();
        assert_eq!(status.committed_offset(), Some(1200));
        assert_eq!(status.rows_error_count, 0);

        let fresh: ChannelStatus = serde_json::from_str(r#"{"channel_status_code":"SUCCESS"}"#).unwrap();
        assert_eq!(fresh.committed_offset(), None);
    }

    #[test]
    fn exhausted_retries_map_to_unreachable() {
        let err = unreachable_error(RetryError {
            error: HttpError::Timeout(Duration::from_secs(1)),
            attempts: 4,
            exhausted: true,
        });
        assert!(matches!(err, IngestError::EndpointUnreachable { attempts: 4, .. }));

        let err = unreachable_error(RetryError {
            error: HttpError::InsecureUrl("http://x".into()),
            attempts: 1,
            exhausted: false,
        });
        assert!(matches!(err, IngestError::InvalidConfig(_)));
    }
}

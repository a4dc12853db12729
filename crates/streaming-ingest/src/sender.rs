// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Row delivery for one open channel.
//!
//! A batch is serialized as newline-delimited JSON, one row per event in
//! batch order, and posted with the continuation token and the offset the
//! batch will reach once committed. The sender never mutates the cursor: it
//! returns an [`Ack`] the caller applies after a successful send.

use reqwest::{Method, StatusCode};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::channel::ChannelHandle;
use crate::config::PipeTarget;
use crate::cursor::{Ack, CursorSnapshot};
use crate::error::IngestError;
use crate::event::BadgeEvent;
use crate::http::{bearer_headers, BackoffPolicy, HttpClient, HttpError, RetryError};

const NDJSON_CONTENT_TYPE: &str = "application/x-ndjson";

/// One row the endpoint refused, with its position in the batch.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Rejection {
    pub index: usize,
    #[serde(default, alias = "message")]
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendResult {
    pub accepted_count: usize,
    pub rejected_rows: Vec<Rejection>,
    pub ack: Ack,
    /// HTTP attempts spent, including retries. Zero for an empty batch.
    pub attempts: u32,
}

#[derive(Debug, Deserialize)]
struct AppendRowsResponse {
    next_continuation_token: Option<String>,
    #[serde(default)]
    rejected_rows: Vec<Rejection>,
}

/// Posts batches to the row-append endpoint of a channel.
#[derive(Debug, Clone)]
pub struct BatchSender {
    http: HttpClient,
    target: PipeTarget,
    backoff: BackoffPolicy,
}

impl BatchSender {
    pub fn new(http: HttpClient, target: PipeTarget, backoff: BackoffPolicy) -> Self {
        Self {
            http,
            target,
            backoff,
        }
    }

    /// Sends `batch` positioned at `snapshot`.
    ///
    /// A 200 advances the whole batch even when some rows are rejected;
    /// those rows come back in [`SendResult::rejected_rows`] and are never
    /// resent. The offset sent is `snapshot.offset + batch.len()`.
    pub async fn send(
        &self,
        handle: &ChannelHandle,
        snapshot: &CursorSnapshot,
        batch: &[BadgeEvent],
    ) -> Result<SendResult, IngestError> {
        if batch.is_empty() {
            return Ok(SendResult {
                accepted_count: 0,
                rejected_rows: Vec::new(),
                ack: Ack {
                    continuation_token: snapshot.continuation_token.clone(),
                    offset: snapshot.offset,
                },
                attempts: 0,
            });
        }
        if handle.scoped_token.is_expired() {
            debug!(channel = %handle.channel_name, "scoped token expired before send");
            return Err(IngestError::AuthExpired);
        }

        let next_offset = u64::try_from(batch.len())
            .ok()
            .and_then(|len| snapshot.offset.checked_add(len))
            .ok_or_else(|| {
                IngestError::Protocol(format!(
                    "offset {} cannot advance by {} rows",
                    snapshot.offset,
                    batch.len()
                ))
            })?;
        let body = encode_ndjson(batch)?;
        let url = format!(
            "{}{}",
            handle.ingest_endpoint,
            self.target.rows_path(&handle.channel_name)
        );
        let headers = bearer_headers(
            handle.scoped_token.value(),
            None,
            Some(NDJSON_CONTENT_TYPE),
        )
        .map_err(|err| IngestError::Key(err.to_string()))?;
        let query = [
            ("continuationToken", snapshot.continuation_token.clone()),
            ("offsetToken", next_offset.to_string()),
        ];

        let attempted = self
            .backoff
            .retry("append_rows", || {
                self.http.send_request(
                    Method::POST,
                    &url,
                    headers.clone(),
                    &query,
                    Some(body.clone()),
                )
            })
            .await
            .map_err(|err| append_error(err, &handle.channel_name))?;
        let attempts = attempted.attempts;

        let bytes = attempted
            .value
            .bytes()
            .await
            .map_err(|err| IngestError::Protocol(format!("unreadable append response: {err}")))?;
        let parsed: AppendRowsResponse = serde_json::from_slice(&bytes)
            .map_err(|err| IngestError::Protocol(format!("malformed append response: {err}")))?;
        let continuation_token = parsed
            .next_continuation_token
            .filter(|token| !token.trim().is_empty())
            .ok_or_else(|| {
                IngestError::Protocol("append response missing `next_continuation_token`".to_string())
            })?;

        let mut rejected_rows = Vec::with_capacity(parsed.rejected_rows.len());
        for rejection in parsed.rejected_rows {
            if rejection.index >= batch.len() {
                warn!(
                    channel = %handle.channel_name,
                    index = rejection.index,
                    batch_len = batch.len(),
                    "ignoring rejection outside the batch"
                );
                continue;
            }
            if rejected_rows
                .iter()
                .any(|seen: &Rejection| seen.index == rejection.index)
            {
                continue;
            }
            warn!(
                channel = %handle.channel_name,
                index = rejection.index,
                badge_id = batch[rejection.index].badge_id(),
                reason = %rejection.reason,
                "row rejected"
            );
            rejected_rows.push(rejection);
        }

        debug!(
            channel = %handle.channel_name,
            rows = batch.len(),
            rejected = rejected_rows.len(),
            offset = next_offset,
            attempts,
            "batch acknowledged"
        );
        Ok(SendResult {
            accepted_count: batch.len() - rejected_rows.len(),
            rejected_rows,
            ack: Ack {
                continuation_token,
                offset: next_offset,
            },
            attempts,
        })
    }
}

/// One JSON object per line, batch order preserved, trailing newline.
fn encode_ndjson(batch: &[BadgeEvent]) -> Result<Vec<u8>, IngestError> {
    let mut body = Vec::with_capacity(batch.len() * 192);
    for event in batch {
        serde_json::to_writer(&mut body, event)
            .map_err(|err| IngestError::Protocol(format!("failed to encode row: {err}")))?;
        body.push(b'\n');
    }
    Ok(body)
}

fn append_error(err: RetryError, channel: &str) -> IngestError {
    if err.exhausted {
        return IngestError::Transport {
            attempts: err.attempts,
            source: err.error,
        };
    }
    match err.error.status() {
        Some(StatusCode::UNAUTHORIZED) => IngestError::AuthExpired,
        Some(StatusCode::NOT_FOUND) | Some(StatusCode::GONE) => {
            IngestError::ChannelClosed(channel.to_string())
        }
        Some(status) => {
            warn!(channel, %status, body = err.error.body(), "batch refused, dropping it");
            IngestError::Protocol(format!("append rejected with {status}"))
        }
        None => match err.error {
            HttpError::InsecureUrl(url) => {
                IngestError::InvalidConfig(format!("insecure url requires explicit opt-in: {url}"))
            }
            error => IngestError::Transport {
                attempts: err.attempts,
                source: error,
            },
        },
    }
}

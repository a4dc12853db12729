// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::http::HttpError;

/// Errors surfaced by the ingestion client.
///
/// Row-level rejections are not errors: they are reported through
/// [`crate::sender::SendResult`] and counted in the run summary.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("private key unusable: {0}")]
    Key(String),

    #[error("failed to sign token: {0}")]
    Signature(String),

    #[error("streaming endpoint unreachable after {attempts} attempt(s): {reason}")]
    EndpointUnreachable { attempts: u32, reason: String },

    #[error("channel open rejected (status {status}): {reason}")]
    ChannelOpenRejected { status: u16, reason: String },

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("authorization expired")]
    AuthExpired,

    #[error("channel {0} is closed or no longer exists")]
    ChannelClosed(String),

    #[error("transport failure after {attempts} attempt(s): {source}")]
    Transport {
        attempts: u32,
        #[source]
        source: HttpError,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl IngestError {
    /// Errors that are recovered by re-signing and reopening the channel.
    pub fn requires_reopen(&self) -> bool {
        matches!(self, Self::AuthExpired | Self::ChannelClosed(_))
    }

    /// Identity and configuration problems that must abort the run immediately.
    pub fn is_identity_or_config(&self) -> bool {
        matches!(
            self,
            Self::Key(_)
                | Self::Signature(_)
                | Self::ChannelOpenRejected { .. }
                | Self::InvalidConfig(_)
        )
    }
}

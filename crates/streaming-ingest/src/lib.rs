// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Streaming-ingestion client for RFID badge events.
//!
//! The crate signs key-pair bearer tokens, negotiates a channel against the
//! streaming endpoint, and delivers batches of badge scans while tracking
//! the channel's continuation token and offset. A paced generator provides
//! synthetic traffic and the orchestrator ties the pieces into a run that
//! recovers from token expiry and closed channels.

#![deny(clippy::all)]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]

pub mod channel;
pub mod config;
pub mod cursor;
pub mod error;
pub mod event;
pub mod generator;
pub mod http;
pub mod logger;
pub mod orchestrator;
pub mod sender;
pub mod summary;
pub mod token;

pub use channel::{ChannelHandle, ChannelNegotiator, ChannelStatus, NegotiationState};
pub use config::{IngestConfig, PipeTarget};
pub use cursor::{Ack, Cursor, CursorSnapshot};
pub use error::IngestError;
pub use event::{BadgeEvent, Direction, EventError, ScanFields};
pub use generator::{EventGenerator, EventSynthesizer, GeneratorConfig, GeneratorReport, StopReason};
pub use http::{BackoffPolicy, HttpClient, HttpClientOptions, HttpError};
pub use orchestrator::{IngestionOrchestrator, OrchestratorConfig, RunFailure, RunState};
pub use sender::{BatchSender, Rejection, SendResult};
pub use summary::{FinalFlush, RunSummary};
pub use token::{BearerToken, Credentials, TokenCache, TokenSigner};

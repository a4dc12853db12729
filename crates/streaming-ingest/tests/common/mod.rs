// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![allow(dead_code)]

use std::time::Duration;

use chrono::Utc;
use mockito::{Mock, Server};
use streaming_ingest::{
    http::default_retryable_status, BackoffPolicy, BadgeEvent, BatchSender, BearerToken,
    ChannelHandle, ChannelNegotiator, Credentials, Direction, HttpClient, HttpClientOptions,
    PipeTarget, ScanFields, TokenCache, TokenSigner,
};

pub const PRIVATE_KEY: &str = include_str!("../fixtures/rsa_key.p8");
pub const ACCOUNT: &str = "MYORG-TEST";
pub const USER: &str = "INGEST_SVC";
pub const CHANNEL: &str = "rfid_channel_1";
pub const CHANNEL_PATH: &str =
    "/v2/streaming/databases/RFID/schemas/STAGE/pipes/BADGE_PIPE/channels/rfid_channel_1";
pub const ROWS_PATH: &str =
    "/v2/streaming/data/databases/RFID/schemas/STAGE/pipes/BADGE_PIPE/channels/rfid_channel_1/rows";
pub const STATUS_PATH: &str =
    "/v2/streaming/databases/RFID/schemas/STAGE/pipes/BADGE_PIPE:bulk-channel-status";

pub fn target() -> PipeTarget {
    PipeTarget {
        database: "RFID".to_string(),
        schema: "STAGE".to_string(),
        pipe: "BADGE_PIPE".to_string(),
    }
}

pub fn signer() -> TokenSigner {
    TokenSigner::new(Credentials {
        account_identifier: ACCOUNT.to_string(),
        principal_id: USER.to_string(),
        private_key_pem: PRIVATE_KEY.to_string(),
        passphrase: None,
        key_fingerprint: None,
    })
    .expect("fixture key loads")
}

pub fn token_cache() -> TokenCache {
    TokenCache::new(signer(), ACCOUNT, Duration::from_secs(3600))
}

pub fn http_client() -> HttpClient {
    HttpClient::new(HttpClientOptions {
        allow_plaintext: true,
        accept_invalid_certs: false,
        request_timeout: Duration::from_secs(2),
    })
    .expect("client builds")
}

pub fn fast_backoff(max_attempts: u32) -> BackoffPolicy {
    BackoffPolicy {
        max_attempts,
        base_delay: Duration::from_millis(5),
        max_delay: Duration::from_millis(20),
        factor: 2.0,
        jitter: 0.0,
        retryable_status: default_retryable_status,
    }
}

pub fn negotiator(server: &Server, max_attempts: u32) -> ChannelNegotiator {
    ChannelNegotiator::new(
        http_client(),
        server.url(),
        target(),
        fast_backoff(max_attempts),
        Duration::from_secs(1800),
    )
}

pub fn batch_sender(max_attempts: u32) -> BatchSender {
    BatchSender::new(http_client(), target(), fast_backoff(max_attempts))
}

pub fn bearer() -> BearerToken {
    signer()
        .sign(ACCOUNT, Duration::from_secs(600))
        .expect("signs")
}

/// Handle pointing at `server` with a scoped token valid for ten minutes.
pub fn open_handle(server: &Server, offset: u64) -> ChannelHandle {
    let now = Utc::now();
    ChannelHandle {
        channel_name: CHANNEL.to_string(),
        ingest_endpoint: server.url(),
        scoped_token: BearerToken::new("scoped-token", now, now + chrono::Duration::minutes(10)),
        continuation_token: "ct-0".to_string(),
        offset,
    }
}

pub fn open_channel_body(server: &Server, continuation_token: &str, offset: u64) -> String {
    serde_json::json!({
        "ingest_host": server.url(),
        "scoped_token": "scoped-token",
        "continuation_token": continuation_token,
        "offset_token": offset.to_string(),
        "scoped_token_expires_in": 1800,
    })
    .to_string()
}

pub async fn mock_hostname(server: &mut Server) -> Mock {
    let url = server.url();
    server
        .mock("GET", "/v2/streaming/hostname")
        .match_header("X-Snowflake-Authorization-Token-Type", "KEYPAIR_JWT")
        .with_status(200)
        .with_body(url)
        .expect_at_least(1)
        .create_async()
        .await
}

pub async fn mock_open(server: &mut Server, continuation_token: &str, offset: u64) -> Mock {
    let body = open_channel_body(server, continuation_token, offset);
    server
        .mock("PUT", CHANNEL_PATH)
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(body)
        .create_async()
        .await
}

pub fn append_ok(next: &str) -> String {
    serde_json::json!({ "next_continuation_token": next, "rejected_rows": [] }).to_string()
}

pub fn events(count: usize) -> Vec<BadgeEvent> {
    let now = Utc::now();
    (0..count)
        .map(|n| {
            BadgeEvent::new(
                ScanFields {
                    badge_id: format!("BADGE-{n:05}"),
                    user_id: format!("USR-{n:05}"),
                    zone_id: "LOBBY".to_string(),
                    reader_id: "RDR-LOBBY-01".to_string(),
                    signal_strength: -50,
                    direction: Direction::Entry,
                },
                now,
                now,
            )
            .expect("valid event")
        })
        .collect()
}

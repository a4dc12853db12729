// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

mod common;

use chrono::Utc;
use mockito::{Matcher, Server};
use streaming_ingest::{BearerToken, Cursor, IngestError};

use common::*;

fn row_query(continuation_token: &str, offset: u64) -> Matcher {
    Matcher::AllOf(vec![
        Matcher::UrlEncoded("continuationToken".into(), continuation_token.into()),
        Matcher::UrlEncoded("offsetToken".into(), offset.to_string()),
    ])
}

#[tokio::test]
async fn sends_ndjson_and_advances_cursor() {
    let mut server = Server::new_async().await;
    let batch = events(3);
    let expected_body: String = batch
        .iter()
        .map(|e| format!("{}\n", serde_json::to_string(e).unwrap()))
        .collect();
    let rows = server
        .mock("POST", ROWS_PATH)
        .match_query(row_query("ct-0", 103))
        .match_header("authorization", "Bearer scoped-token")
        .match_header("content-type", "application/x-ndjson")
        .match_body(expected_body.as_str())
        .with_status(200)
        .with_body(append_ok("ct-1"))
        .expect(1)
        .create_async()
        .await;

    let handle = open_handle(&server, 100);
    let mut cursor = handle.cursor();
    let result = batch_sender(3)
        .send(&handle, &cursor.snapshot(), &batch)
        .await
        .expect("batch accepted");

    rows.assert_async().await;
    assert_eq!(result.accepted_count, 3);
    assert!(result.rejected_rows.is_empty());
    assert_eq!(result.attempts, 1);
    assert!(cursor.advance(&result.ack));
    assert_eq!(cursor.offset(), 103);
    assert_eq!(cursor.snapshot().continuation_token, "ct-1");
}

#[tokio::test]
async fn throttled_twice_then_accepted() {
    let mut server = Server::new_async().await;
    let throttled = server
        .mock("POST", ROWS_PATH)
        .match_query(row_query("ct-0", 10))
        .with_status(429)
        .expect(2)
        .create_async()
        .await;
    let accepted = server
        .mock("POST", ROWS_PATH)
        .match_query(row_query("ct-0", 10))
        .with_status(200)
        .with_body(append_ok("ct-1"))
        .expect(1)
        .create_async()
        .await;

    let handle = open_handle(&server, 0);
    let mut cursor = handle.cursor();
    let result = batch_sender(5)
        .send(&handle, &cursor.snapshot(), &events(10))
        .await
        .expect("batch accepted after retries");

    throttled.assert_async().await;
    accepted.assert_async().await;
    // Three attempts means exactly two backoff waits.
    assert_eq!(result.attempts, 3);
    assert!(cursor.advance(&result.ack));
    assert_eq!(cursor.advances(), 1);
    assert_eq!(cursor.offset(), 10);
}

#[tokio::test]
async fn partial_rejection_advances_whole_batch() {
    let mut server = Server::new_async().await;
    let _rows = server
        .mock("POST", ROWS_PATH)
        .match_query(row_query("ct-0", 5))
        .with_status(200)
        .with_body(
            serde_json::json!({
                "next_continuation_token": "ct-1",
                "rejected_rows": [
                    { "index": 1, "reason": "zone_id not in dimension" },
                    { "index": 3, "reason": "duplicate scan" }
                ]
            })
            .to_string(),
        )
        .create_async()
        .await;

    let handle = open_handle(&server, 0);
    let result = batch_sender(3)
        .send(&handle, &handle.cursor().snapshot(), &events(5))
        .await
        .expect("partial acceptance is a success");

    assert_eq!(result.accepted_count, 3);
    let indexes: Vec<usize> = result.rejected_rows.iter().map(|r| r.index).collect();
    assert_eq!(indexes, vec![1, 3]);
    assert_eq!(result.rejected_rows[1].reason, "duplicate scan");
    assert_eq!(result.ack.offset, 5);
}

#[tokio::test]
async fn unauthorized_is_auth_expired_and_cursor_stays() {
    let mut server = Server::new_async().await;
    let rows = server
        .mock("POST", ROWS_PATH)
        .match_query(Matcher::Any)
        .with_status(401)
        .expect(1)
        .create_async()
        .await;

    let handle = open_handle(&server, 40);
    let cursor = handle.cursor();
    let before = cursor.snapshot();
    let err = batch_sender(5)
        .send(&handle, &cursor.snapshot(), &events(4))
        .await
        .expect_err("401 fails the send");

    rows.assert_async().await;
    assert!(matches!(err, IngestError::AuthExpired));
    assert!(err.requires_reopen());
    assert_eq!(cursor.snapshot(), before);
}

#[tokio::test]
async fn gone_channel_requires_reopen() {
    let mut server = Server::new_async().await;
    let _rows = server
        .mock("POST", ROWS_PATH)
        .match_query(Matcher::Any)
        .with_status(410)
        .create_async()
        .await;

    let handle = open_handle(&server, 0);
    let err = batch_sender(5)
        .send(&handle, &handle.cursor().snapshot(), &events(2))
        .await
        .expect_err("410 fails the send");
    assert!(matches!(err, IngestError::ChannelClosed(ref name) if name == CHANNEL));
}

#[tokio::test]
async fn bad_request_is_protocol_error_without_retry() {
    let mut server = Server::new_async().await;
    let rows = server
        .mock("POST", ROWS_PATH)
        .match_query(Matcher::Any)
        .with_status(400)
        .with_body("malformed row payload")
        .expect(1)
        .create_async()
        .await;

    let handle = open_handle(&server, 0);
    let err = batch_sender(5)
        .send(&handle, &handle.cursor().snapshot(), &events(2))
        .await
        .expect_err("400 fails the send");
    rows.assert_async().await;
    assert!(matches!(err, IngestError::Protocol(_)));
}

#[tokio::test]
async fn missing_continuation_token_does_not_advance() {
    let mut server = Server::new_async().await;
    let _rows = server
        .mock("POST", ROWS_PATH)
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(r#"{"rejected_rows":[]}"#)
        .create_async()
        .await;

    let handle = open_handle(&server, 7);
    let cursor = handle.cursor();
    let err = batch_sender(2)
        .send(&handle, &cursor.snapshot(), &events(2))
        .await
        .expect_err("ack without token is a protocol error");
    assert!(matches!(err, IngestError::Protocol(ref msg) if msg.contains("next_continuation_token")));
    assert_eq!(cursor.offset(), 7);
}

#[tokio::test]
async fn persistent_server_errors_exhaust_into_transport_error() {
    let mut server = Server::new_async().await;
    let rows = server
        .mock("POST", ROWS_PATH)
        .match_query(Matcher::Any)
        .with_status(500)
        .expect(3)
        .create_async()
        .await;

    let handle = open_handle(&server, 0);
    let err = batch_sender(3)
        .send(&handle, &handle.cursor().snapshot(), &events(1))
        .await
        .expect_err("send gives up");
    rows.assert_async().await;
    assert!(matches!(err, IngestError::Transport { attempts: 3, .. }));
}

#[tokio::test]
async fn expired_scoped_token_fails_before_io() {
    let mut server = Server::new_async().await;
    let rows = server
        .mock("POST", ROWS_PATH)
        .match_query(Matcher::Any)
        .expect(0)
        .create_async()
        .await;

    let mut handle = open_handle(&server, 0);
    let now = Utc::now();
    handle.scoped_token = BearerToken::new(
        "scoped-token",
        now - chrono::Duration::minutes(31),
        now - chrono::Duration::minutes(1),
    );
    let err = batch_sender(3)
        .send(&handle, &handle.cursor().snapshot(), &events(1))
        .await
        .expect_err("expired token");
    rows.assert_async().await;
    assert!(matches!(err, IngestError::AuthExpired));
}

#[tokio::test]
async fn empty_batch_is_not_sent() {
    let mut server = Server::new_async().await;
    let rows = server
        .mock("POST", ROWS_PATH)
        .match_query(Matcher::Any)
        .expect(0)
        .create_async()
        .await;

    let handle = open_handle(&server, 12);
    let mut cursor = Cursor::new("ct-0", 12);
    let result = batch_sender(3)
        .send(&handle, &cursor.snapshot(), &[])
        .await
        .expect("empty batch is a no-op");
    rows.assert_async().await;
    assert_eq!(result.attempts, 0);
    assert!(!cursor.advance(&result.ack));
}

#[tokio::test]
async fn offset_overflow_is_protocol_error_before_io() {
    let mut server = Server::new_async().await;
    let rows = server
        .mock("POST", ROWS_PATH)
        .match_query(Matcher::Any)
        .expect(0)
        .create_async()
        .await;

    let handle = open_handle(&server, u64::MAX);
    let cursor = handle.cursor();
    let err = batch_sender(3)
        .send(&handle, &cursor.snapshot(), &events(1))
        .await
        .expect_err("offset cannot wrap");
    rows.assert_async().await;
    assert!(matches!(err, IngestError::Protocol(msg) if msg.contains("cannot advance")));
    assert_eq!(cursor.offset(), u64::MAX);
}

//! Failure-path tests for the client adapter: timeouts, disconnects,
//! teardown idempotence, and stray-response tolerance.
//!
//! The liveness property under test: no pending prompt request survives
//! connection teardown — every outstanding call settles, with an error kind
//! callers can act on.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;

use agent_relay::telemetry::MemorySink;
use agent_relay::tunnel::client::TunnelClient;
use agent_relay::tunnel::protocol::{PromptConfig, PromptRequest, PromptType, TunnelMessage};
use agent_relay::tunnel::server::TunnelServer;
use agent_relay::AppError;

fn confirm_request(message: &str) -> PromptRequest {
    PromptRequest::new(
        PromptType::Confirm,
        PromptConfig {
            message: message.into(),
            ..PromptConfig::default()
        },
        None,
    )
}

/// A request with a 50 ms timeout against a server that never responds
/// rejects promptly with a timeout-classified error — not some generic
/// failure a caller could not apply fallback policy to.
#[tokio::test]
async fn unanswered_request_times_out_with_timeout_kind() {
    let (client_stream, server_stream) = tokio::io::duplex(64 * 1024);

    // A server with no prompt handler relays telemetry but never answers.
    let server = Arc::new(TunnelServer::new(Arc::new(MemorySink::new())));
    let cancel = CancellationToken::new();
    tokio::spawn({
        let server = Arc::clone(&server);
        let cancel = cancel.clone();
        async move {
            server.serve_connection("conn-1".into(), server_stream, cancel).await;
        }
    });

    let client = TunnelClient::connect(client_stream);
    let started = Instant::now();
    let result = client
        .send_prompt_request(confirm_request("anyone there?"), Some(Duration::from_millis(50)))
        .await;
    let elapsed = started.elapsed();

    match result {
        Err(err) => assert!(err.is_timeout(), "expected timeout kind, got: {err}"),
        Ok(value) => panic!("request must not resolve, got: {value}"),
    }
    assert!(
        elapsed < Duration::from_millis(500),
        "timeout must fire near its deadline, took {elapsed:?}"
    );

    // The table entry is gone: tearing down now must not double-settle.
    client.destroy().await;
    cancel.cancel();
}

/// Forcibly closing the connection with a request pending rejects it with a
/// connection-lost error — never a timeout, so default-on-timeout fallbacks
/// cannot misfire on transport failure.
#[tokio::test]
async fn connection_close_rejects_pending_with_connection_lost() {
    let (client_stream, server_stream) = tokio::io::duplex(64 * 1024);

    // Peer that reads the request, then slams the connection shut.
    let peer = tokio::spawn(async move {
        let mut lines = BufReader::new(server_stream).lines();
        let _request = lines.next_line().await.expect("read must succeed");
        // Dropping the stream closes both directions.
    });

    let client = TunnelClient::connect(client_stream);
    let result = tokio::time::timeout(
        Duration::from_secs(2),
        client.send_prompt_request(confirm_request("doomed"), None),
    )
    .await
    .expect("pending request must settle promptly after the close, not hang");

    match result {
        Err(AppError::ConnectionLost(_)) => {}
        other => panic!("expected ConnectionLost, got: {other:?}"),
    }

    let _ = peer.await;
}

/// `destroy()` rejects every pending request and is idempotent; sends after
/// teardown fail fast.
#[tokio::test]
async fn destroy_rejects_pending_and_is_idempotent() {
    let (client_stream, _server_stream) = tokio::io::duplex(64 * 1024);

    let client = Arc::new(TunnelClient::connect(client_stream));

    let pending = {
        let client = Arc::clone(&client);
        tokio::spawn(async move {
            client
                .send_prompt_request(confirm_request("never answered"), None)
                .await
        })
    };
    // Let the request register before tearing down.
    tokio::time::sleep(Duration::from_millis(20)).await;

    client.destroy().await;

    let result = tokio::time::timeout(Duration::from_secs(1), pending)
        .await
        .expect("pending request must settle on destroy")
        .expect("task must not panic");
    match result {
        Err(AppError::ConnectionLost(_)) => {}
        other => panic!("expected ConnectionLost after destroy, got: {other:?}"),
    }

    // Second teardown is a no-op, not a double-settle.
    client.destroy().await;

    let send_result = client
        .send(&TunnelMessage::Stdout { data: "late".into() })
        .await;
    assert!(
        matches!(send_result, Err(AppError::Tunnel(_))),
        "sends after destroy must fail fast, got: {send_result:?}"
    );
}

/// A response whose `requestId` matches nothing (already timed out, or
/// never existed) is ignored; the connection keeps working.
#[tokio::test]
async fn stray_response_is_a_no_op() {
    let (client_stream, server_stream) = tokio::io::duplex(64 * 1024);

    // Scripted peer: answer a bogus id first, then the real request.
    let peer = tokio::spawn(async move {
        let (read_half, mut write_half) = tokio::io::split(server_stream);
        let mut lines = BufReader::new(read_half).lines();

        let line = lines
            .next_line()
            .await
            .expect("read must succeed")
            .expect("a request must arrive");
        let request: serde_json::Value = serde_json::from_str(&line).expect("request is JSON");
        let request_id = request["message"]["requestId"]
            .as_str()
            .expect("request carries its id")
            .to_owned();

        let stray = json!({"type": "prompt_response", "requestId": "r-bogus", "value": false});
        write_half
            .write_all(format!("{stray}\n").as_bytes())
            .await
            .expect("stray write must succeed");

        let real = json!({"type": "prompt_response", "requestId": request_id, "value": true});
        write_half
            .write_all(format!("{real}\n").as_bytes())
            .await
            .expect("real write must succeed");

        // Keep the connection open long enough for the client to read both.
        tokio::time::sleep(Duration::from_millis(200)).await;
    });

    let client = TunnelClient::connect(client_stream);
    let value = client
        .send_prompt_request(confirm_request("real one"), Some(Duration::from_secs(2)))
        .await
        .expect("the real response must resolve the request");

    assert_eq!(value, json!(true));

    client.destroy().await;
    let _ = peer.await;
}

/// An error response rejects the pending request with the remote message.
#[tokio::test]
async fn error_response_rejects_with_prompt_failed() {
    let (client_stream, server_stream) = tokio::io::duplex(64 * 1024);

    let peer = tokio::spawn(async move {
        let (read_half, mut write_half) = tokio::io::split(server_stream);
        let mut lines = BufReader::new(read_half).lines();

        let line = lines
            .next_line()
            .await
            .expect("read must succeed")
            .expect("a request must arrive");
        let request: serde_json::Value = serde_json::from_str(&line).expect("request is JSON");
        let request_id = request["message"]["requestId"].as_str().expect("id").to_owned();

        let response =
            json!({"type": "prompt_response", "requestId": request_id, "error": "operator declined"});
        write_half
            .write_all(format!("{response}\n").as_bytes())
            .await
            .expect("write must succeed");
        tokio::time::sleep(Duration::from_millis(200)).await;
    });

    let client = TunnelClient::connect(client_stream);
    let result = client
        .send_prompt_request(confirm_request("declined"), Some(Duration::from_secs(2)))
        .await;

    match result {
        Err(AppError::PromptFailed(message)) => assert_eq!(message, "operator declined"),
        other => panic!("expected PromptFailed, got: {other:?}"),
    }

    client.destroy().await;
    let _ = peer.await;
}

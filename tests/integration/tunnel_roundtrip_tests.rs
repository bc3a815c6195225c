//! End-to-end tunnel round trips over in-memory duplex streams: prompt
//! correlation, out-of-order responses, telemetry relay, and
//! malformed-input tolerance.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;

use agent_relay::telemetry::{MemorySink, SinkEvent};
use agent_relay::tunnel::client::TunnelClient;
use agent_relay::tunnel::protocol::{
    LogLevel, OutputStream, PromptConfig, PromptRequest, PromptType, StructuredMessage,
    TunnelMessage,
};
use agent_relay::tunnel::server::TunnelServer;

use super::test_helpers::{AutoValueHandler, OrderProbeHandler};

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

/// Client sends a confirm prompt request; the server's handler resolves with
/// `true`; the client's suspended call resolves to exactly that value.
#[tokio::test]
async fn prompt_round_trip_resolves_with_handler_value() {
    let (client_stream, server_stream) = tokio::io::duplex(64 * 1024);

    let sink = Arc::new(MemorySink::new());
    let server = Arc::new(
        TunnelServer::new(Arc::clone(&sink))
            .with_prompt_handler(Arc::new(AutoValueHandler(json!(true)))),
    );
    let cancel = CancellationToken::new();
    let server_task = {
        let server = Arc::clone(&server);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            server.serve_connection("conn-1".into(), server_stream, cancel).await;
        })
    };

    let client = TunnelClient::connect(client_stream);
    let value = client
        .send_prompt_request(confirm_request("Proceed?"), Some(Duration::from_secs(2)))
        .await
        .expect("round trip must resolve");

    assert_eq!(value, json!(true));

    // The request was relayed to telemetry before it was dispatched.
    let relayed = sink
        .events()
        .into_iter()
        .any(|event| matches!(event, SinkEvent::Structured(StructuredMessage::PromptRequest(_))));
    assert!(relayed, "prompt requests must always reach the telemetry sink");

    client.destroy().await;
    cancel.cancel();
    let _ = server_task.await;
}

/// Two concurrent prompt requests answered out of order each settle with
/// their own result.
#[tokio::test]
async fn out_of_order_responses_correlate_by_request_id() {
    let (client_stream, server_stream) = tokio::io::duplex(64 * 1024);

    let sink = Arc::new(MemorySink::new());
    let server = Arc::new(
        TunnelServer::new(sink).with_prompt_handler(Arc::new(OrderProbeHandler)),
    );
    let cancel = CancellationToken::new();
    tokio::spawn({
        let server = Arc::clone(&server);
        let cancel = cancel.clone();
        async move {
            server.serve_connection("conn-1".into(), server_stream, cancel).await;
        }
    });

    let client = TunnelClient::connect(client_stream);
    let slow = client.send_prompt_request(confirm_request("slow one"), Some(Duration::from_secs(2)));
    let fast = client.send_prompt_request(confirm_request("fast one"), Some(Duration::from_secs(2)));

    let (slow_result, fast_result) = tokio::join!(slow, fast);

    assert_eq!(slow_result.expect("slow must settle"), json!("slow-answer"));
    assert_eq!(fast_result.expect("fast must settle"), json!("fast-answer"));

    client.destroy().await;
    cancel.cancel();
}

/// Console, passthrough, and structured telemetry arrive at the sink in
/// arrival order with their classification intact.
#[tokio::test]
async fn telemetry_relays_in_order() {
    let (client_stream, server_stream) = tokio::io::duplex(64 * 1024);

    let sink = Arc::new(MemorySink::new());
    let server = Arc::new(TunnelServer::new(Arc::clone(&sink)));
    let cancel = CancellationToken::new();
    tokio::spawn({
        let server = Arc::clone(&server);
        let cancel = cancel.clone();
        async move {
            server.serve_connection("conn-1".into(), server_stream, cancel).await;
        }
    });

    let client = TunnelClient::connect(client_stream);
    client
        .send(&TunnelMessage::console(LogLevel::Warn, vec![json!("low disk")]))
        .await
        .expect("send must succeed");
    client
        .send(&TunnelMessage::passthrough(OutputStream::Stdout, "raw out".into()))
        .await
        .expect("send must succeed");
    client
        .send(&TunnelMessage::Structured {
            message: StructuredMessage::agent_error("sad path"),
        })
        .await
        .expect("send must succeed");

    // Allow the relay to drain.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let events = sink.events();
    assert_eq!(events.len(), 3, "all three messages must be relayed: {events:?}");
    assert!(matches!(
        &events[0],
        SinkEvent::Console { level: LogLevel::Warn, args } if args == &vec![json!("low disk")]
    ));
    assert!(matches!(
        &events[1],
        SinkEvent::Output { stream: OutputStream::Stdout, data } if data == "raw out"
    ));
    assert!(matches!(
        &events[2],
        SinkEvent::Structured(StructuredMessage::AgentError { message, .. }) if message == "sad path"
    ));

    client.destroy().await;
    cancel.cancel();
}

/// Malformed JSON and schema-invalid prompt requests are dropped without
/// killing the connection; later valid traffic still round-trips.
#[tokio::test]
async fn malformed_and_invalid_lines_are_dropped_not_fatal() {
    let (mut raw_client, server_stream) = tokio::io::duplex(64 * 1024);

    let sink = Arc::new(MemorySink::new());
    let server = Arc::new(
        TunnelServer::new(Arc::clone(&sink))
            .with_prompt_handler(Arc::new(AutoValueHandler(json!("ok")))),
    );
    let cancel = CancellationToken::new();
    tokio::spawn({
        let server = Arc::clone(&server);
        let cancel = cancel.clone();
        async move {
            server.serve_connection("conn-1".into(), server_stream, cancel).await;
        }
    });

    // Garbage, an unknown type tag, and a schema-invalid prompt request
    // (empty requestId) — all must be swallowed.
    raw_client
        .write_all(b"this is not json\n")
        .await
        .expect("raw write must succeed");
    raw_client
        .write_all(b"{\"type\":\"telepathy\"}\n")
        .await
        .expect("raw write must succeed");
    raw_client
        .write_all(
            b"{\"type\":\"structured\",\"message\":{\"type\":\"prompt_request\",\
              \"requestId\":\"\",\"promptType\":\"confirm\",\"promptConfig\":{\"message\":\"x\"}}}\n",
        )
        .await
        .expect("raw write must succeed");

    // A valid prompt request after the garbage still gets answered.
    raw_client
        .write_all(
            b"{\"type\":\"structured\",\"message\":{\"type\":\"prompt_request\",\
              \"requestId\":\"r-good\",\"promptType\":\"confirm\",\
              \"promptConfig\":{\"message\":\"Proceed?\"}}}\n",
        )
        .await
        .expect("raw write must succeed");

    let mut lines = BufReader::new(&mut raw_client).lines();
    let response = tokio::time::timeout(Duration::from_secs(2), lines.next_line())
        .await
        .expect("a response must arrive for the valid request")
        .expect("read must succeed")
        .expect("stream must stay open");

    let parsed: serde_json::Value = serde_json::from_str(&response).expect("response is JSON");
    assert_eq!(parsed["type"], "prompt_response");
    assert_eq!(
        parsed["requestId"], "r-good",
        "only the valid request may be answered; the invalid one is dropped"
    );
    assert_eq!(parsed["value"], "ok");

    cancel.cancel();
}

//! Tests for the prompt wrapper facade: direct-mode fallback, tunneled
//! decoding, and the timeout-only fallback policy.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

use agent_relay::prompt::wrapper::{
    CheckboxOptions, ConfirmOptions, InputOptions, PromptScope, SelectOptions,
};
use agent_relay::telemetry::{MemorySink, SinkEvent};
use agent_relay::tunnel::client::TunnelClient;
use agent_relay::tunnel::protocol::{PromptChoice, StructuredMessage};
use agent_relay::tunnel::server::TunnelServer;
use agent_relay::AppError;

use super::test_helpers::{AutoValueHandler, HangingFrontend, StaticFrontend};

/// Direct mode renders locally and still relays the prompt description to
/// telemetry for visibility.
#[tokio::test]
async fn direct_mode_prompts_locally_and_relays_telemetry() {
    let sink = Arc::new(MemorySink::new());
    let scope = PromptScope::direct(
        Arc::new(StaticFrontend {
            confirm_answer: true,
            input_answer: "direct".into(),
        }),
        Arc::clone(&sink),
    );
    assert!(!scope.is_tunneled());

    let confirmed = scope
        .confirm(ConfirmOptions::new("Ship it?"))
        .await
        .expect("confirm must settle");
    assert!(confirmed);

    let text = scope
        .input(InputOptions::new("Name?"))
        .await
        .expect("input must settle");
    assert_eq!(text, "direct");

    let picked = scope
        .select(SelectOptions::new(
            "Pick",
            vec![
                PromptChoice::new("first", json!("a")),
                PromptChoice::new("second", json!("b")),
            ],
        ))
        .await
        .expect("select must settle");
    assert_eq!(picked, json!("a"));

    let checked = scope
        .checkbox(CheckboxOptions::new(
            "Pick many",
            vec![PromptChoice {
                name: "on".into(),
                value: json!("x"),
                description: None,
                checked: Some(true),
            }],
        ))
        .await
        .expect("checkbox must settle");
    assert_eq!(checked, vec![json!("x")]);

    let prompt_relays = sink
        .events()
        .into_iter()
        .filter(|event| {
            matches!(
                event,
                SinkEvent::Structured(StructuredMessage::PromptRequest(_))
            )
        })
        .count();
    assert_eq!(
        prompt_relays, 4,
        "every direct-mode prompt must be visible in telemetry"
    );
}

/// Tunneled mode decodes the correlated response into the typed result.
#[tokio::test]
async fn tunneled_confirm_decodes_boolean() {
    let (client_stream, server_stream) = tokio::io::duplex(64 * 1024);
    let server = Arc::new(
        TunnelServer::new(Arc::new(MemorySink::new()))
            .with_prompt_handler(Arc::new(AutoValueHandler(json!(true)))),
    );
    let cancel = CancellationToken::new();
    tokio::spawn({
        let server = Arc::clone(&server);
        let cancel = cancel.clone();
        async move {
            server.serve_connection("conn-1".into(), server_stream, cancel).await;
        }
    });

    let client = Arc::new(TunnelClient::connect(client_stream));
    let scope = PromptScope::tunneled(
        Arc::clone(&client),
        Arc::new(StaticFrontend::default()),
        Arc::new(MemorySink::new()),
    );
    assert!(scope.is_tunneled());

    let confirmed = scope
        .confirm(ConfirmOptions {
            message: "Deploy?".into(),
            default: Some(false),
            timeout: Some(Duration::from_secs(2)),
        })
        .await
        .expect("tunneled confirm must settle");
    assert!(confirmed);

    client.destroy().await;
    cancel.cancel();
}

/// A response of the wrong JSON type is a failure, not a silent coercion.
#[tokio::test]
async fn tunneled_type_mismatch_is_prompt_failed() {
    let (client_stream, server_stream) = tokio::io::duplex(64 * 1024);
    let server = Arc::new(
        TunnelServer::new(Arc::new(MemorySink::new()))
            .with_prompt_handler(Arc::new(AutoValueHandler(json!("not a bool")))),
    );
    let cancel = CancellationToken::new();
    tokio::spawn({
        let server = Arc::clone(&server);
        let cancel = cancel.clone();
        async move {
            server.serve_connection("conn-1".into(), server_stream, cancel).await;
        }
    });

    let client = Arc::new(TunnelClient::connect(client_stream));
    let scope = PromptScope::tunneled(
        Arc::clone(&client),
        Arc::new(StaticFrontend::default()),
        Arc::new(MemorySink::new()),
    );

    let result = scope
        .confirm(ConfirmOptions {
            message: "Deploy?".into(),
            default: None,
            timeout: Some(Duration::from_secs(2)),
        })
        .await;
    assert!(
        matches!(result, Err(AppError::PromptFailed(_))),
        "got: {result:?}"
    );

    client.destroy().await;
    cancel.cancel();
}

/// `confirm_or_default` applies the fallback on a genuine timeout…
#[tokio::test]
async fn confirm_or_default_applies_fallback_on_timeout() {
    let (client_stream, server_stream) = tokio::io::duplex(64 * 1024);
    // No handler: the server never answers, so the client-side timer fires.
    let server = Arc::new(TunnelServer::new(Arc::new(MemorySink::new())));
    let cancel = CancellationToken::new();
    tokio::spawn({
        let server = Arc::clone(&server);
        let cancel = cancel.clone();
        async move {
            server.serve_connection("conn-1".into(), server_stream, cancel).await;
        }
    });

    let client = Arc::new(TunnelClient::connect(client_stream));
    let scope = PromptScope::tunneled(
        Arc::clone(&client),
        Arc::new(StaticFrontend::default()),
        Arc::new(MemorySink::new()),
    );

    let answer = scope
        .confirm_or_default(
            ConfirmOptions {
                message: "Allow the tool call?".into(),
                default: None,
                timeout: Some(Duration::from_millis(50)),
            },
            false,
        )
        .await
        .expect("timeout must be absorbed by the fallback");
    assert!(!answer, "the fallback answer must be returned on timeout");

    client.destroy().await;
    cancel.cancel();
}

/// …but never on a lost connection: silently approving (or denying) a
/// sensitive action after a transport failure is forbidden, so the error
/// propagates.
#[tokio::test]
async fn confirm_or_default_propagates_connection_loss() {
    let (client_stream, server_stream) = tokio::io::duplex(64 * 1024);

    // Peer that reads the request and then drops the connection.
    tokio::spawn(async move {
        let mut lines = BufReader::new(server_stream).lines();
        let _ = lines.next_line().await;
    });

    let client = Arc::new(TunnelClient::connect(client_stream));
    let scope = PromptScope::tunneled(
        Arc::clone(&client),
        Arc::new(StaticFrontend::default()),
        Arc::new(MemorySink::new()),
    );

    let result = scope
        .confirm_or_default(
            ConfirmOptions {
                message: "Allow the tool call?".into(),
                default: None,
                // A generous timeout: the disconnect must win the race and
                // must NOT be treated like a timeout.
                timeout: Some(Duration::from_secs(5)),
            },
            true,
        )
        .await;

    match result {
        Err(AppError::ConnectionLost(_)) => {}
        other => panic!("connection loss must propagate, got: {other:?}"),
    }
}

/// Direct mode honors the caller's timeout with the same error kind as the
/// tunneled path.
#[tokio::test]
async fn direct_mode_timeout_classifies_as_prompt_timeout() {
    let scope = PromptScope::direct(Arc::new(HangingFrontend), Arc::new(MemorySink::new()));

    let result = scope
        .confirm(ConfirmOptions {
            message: "anyone?".into(),
            default: None,
            timeout: Some(Duration::from_millis(50)),
        })
        .await;

    match result {
        Err(err) => assert!(err.is_timeout(), "expected timeout kind, got: {err}"),
        Ok(value) => panic!("hanging frontend cannot answer, got: {value}"),
    }
}

//! Unit tests for the NDJSON line codec.
//!
//! Covers the framing properties the tunnel depends on: partial chunks are
//! buffered until their newline arrives, the EOF flush emits the final
//! residual line, emitted lines never contain embedded newlines, and
//! oversized lines error instead of allocating without bound.

use bytes::BytesMut;
use tokio_util::codec::Decoder;

use agent_relay::tunnel::codec::{LineCodec, MAX_LINE_BYTES};
use agent_relay::AppError;

// ── Basic framing ────────────────────────────────────────────────────────────

/// A complete JSON object on a single newline-terminated line is decoded
/// without error and returned as the line content (without the `\n`).
#[test]
fn single_line_decodes() {
    let mut codec = LineCodec::new();
    let mut buf = BytesMut::from("{\"type\":\"log\",\"args\":[]}\n");

    let result = codec
        .decode(&mut buf)
        .expect("decode must succeed for a valid NDJSON line");

    assert_eq!(
        result,
        Some("{\"type\":\"log\",\"args\":[]}".to_owned()),
        "codec must return the line content without the trailing newline"
    );
}

/// Two objects delivered in a single buffer are decoded as two separate
/// items by successive `decode` calls.
#[test]
fn batched_lines_decode_separately() {
    let mut codec = LineCodec::new();
    let raw = concat!(
        "{\"type\":\"stdout\",\"data\":\"a\"}\n",
        "{\"type\":\"stderr\",\"data\":\"b\"}\n",
    );
    let mut buf = BytesMut::from(raw);

    let first = codec.decode(&mut buf).expect("first decode must succeed");
    assert!(first.is_some(), "first line must be decoded");

    let second = codec.decode(&mut buf).expect("second decode must succeed");
    assert!(second.is_some(), "second line must be decoded");

    let third = codec
        .decode(&mut buf)
        .expect("buffer now empty, decode must return None");
    assert!(third.is_none(), "no further lines must be present");
}

// ── Chunk-boundary buffering and flush ───────────────────────────────────────

/// Feeding `'{"a":1}\n{"b"'` then `':2}'` then flushing emits exactly
/// `'{"a":1}'` and, after the flush, `'{"b":2}'`.
#[test]
fn split_chunk_is_reassembled_and_flushed_at_eof() {
    let mut codec = LineCodec::new();
    let mut buf = BytesMut::from("{\"a\":1}\n{\"b\"");

    let first = codec.decode(&mut buf).expect("decode must succeed");
    assert_eq!(first, Some("{\"a\":1}".to_owned()));

    let none = codec.decode(&mut buf).expect("partial decode must not error");
    assert!(none.is_none(), "partial line must stay buffered");

    buf.extend_from_slice(b":2}");
    let none = codec.decode(&mut buf).expect("still no newline, no line");
    assert!(none.is_none(), "line is only complete at EOF flush");

    let flushed = codec
        .decode_eof(&mut buf)
        .expect("decode_eof must flush the residual line");
    assert_eq!(
        flushed,
        Some("{\"b\":2}".to_owned()),
        "flush must emit the final partial message exactly once"
    );

    let empty = codec.decode_eof(&mut buf).expect("second flush must succeed");
    assert!(empty.is_none(), "the residual line must be flushed exactly once");
}

/// Concatenating the emitted lines (with newlines reinserted) plus the EOF
/// flush reconstructs the original input exactly, for an adversarial chunk
/// split.
#[test]
fn chunked_input_reconstructs_exactly() {
    let original = "{\"n\":1}\n{\"n\":2}\n{\"n\":3}\ntail-without-newline";
    let chunks = ["{\"n\":1}\n{\"", "n\":2}", "\n{\"n\":3}\nta", "il-without-newline"];

    let mut codec = LineCodec::new();
    let mut buf = BytesMut::new();
    let mut lines: Vec<String> = Vec::new();

    for chunk in chunks {
        buf.extend_from_slice(chunk.as_bytes());
        while let Some(line) = codec.decode(&mut buf).expect("decode must succeed") {
            lines.push(line);
        }
    }
    if let Some(residual) = codec.decode_eof(&mut buf).expect("flush must succeed") {
        lines.push(residual);
    }

    for line in &lines {
        assert!(
            !line.contains('\n'),
            "no emitted line may contain an embedded newline, got: {line:?}"
        );
    }

    let reconstructed = lines.join("\n");
    assert_eq!(
        reconstructed, original,
        "emitted lines plus flush must reconstruct the input"
    );
}

/// An empty stream flushes to nothing.
#[test]
fn eof_on_empty_buffer_is_none() {
    let mut codec = LineCodec::new();
    let mut buf = BytesMut::new();

    let result = codec.decode_eof(&mut buf).expect("flush of nothing succeeds");
    assert!(result.is_none());
}

// ── Bounded line length ──────────────────────────────────────────────────────

/// A line exceeding `MAX_LINE_BYTES` causes `decode` to return
/// `AppError::Tunnel` containing `"line too long"`.
#[test]
fn oversized_line_returns_error() {
    let mut codec = LineCodec::new();

    let big_line = "a".repeat(MAX_LINE_BYTES + 1) + "\n";
    let mut buf = BytesMut::from(big_line.as_str());

    let result = codec.decode(&mut buf);

    match result {
        Err(AppError::Tunnel(msg)) => assert!(
            msg.contains("line too long"),
            "error must mention 'line too long', got: {msg}"
        ),
        other => panic!("expected Err(AppError::Tunnel(\"line too long …\")), got: {other:?}"),
    }
}

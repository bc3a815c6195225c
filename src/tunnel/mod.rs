//! Bidirectional tunnel between a parent orchestrator and its child agents.
//!
//! One duplex byte stream carries newline-delimited JSON in both directions:
//! telemetry and prompt requests flow child → parent ([`protocol::TunnelMessage`]),
//! prompt responses flow parent → child ([`protocol::ServerTunnelMessage`]).
//!
//! - [`codec`] — newline framing with a bounded line length.
//! - [`protocol`] — wire message shapes and validation.
//! - [`client`] — child-side adapter: send telemetry, await correlated
//!   prompt responses.
//! - [`server`] — parent-side dispatcher: classify inbound lines, relay
//!   telemetry, service prompt requests per connection.

pub mod client;
pub mod codec;
pub mod protocol;
pub mod server;

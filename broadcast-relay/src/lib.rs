//! Single-process websocket relay.
//!
//! Every message a client sends over its websocket is forwarded verbatim to
//! every other connected client. Nothing is persisted, routed or validated.
//!
//! - [`hub`] owns the registry of open channels and performs the fan-out.
//! - [`server`] is the transport: an axum router that upgrades `/ws`
//!   requests and feeds each connection's open, message and close events
//!   into the hub.
//! - [`cli`] parses the command-line interface for the relay binary.

pub mod cli;
pub mod hub;
pub mod server;

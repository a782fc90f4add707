//! Multi-client TCP broadcast relay.
//!
//! Every accepted connection becomes a participant; whatever one participant
//! sends is written, byte for byte, to every other participant. There is no
//! framing: one read on the server is relayed as one message.
//!
//! - [`registry`] keeps the set of live participants and hands out snapshots.
//! - [`participant`] is the per-connection handle with a serialized send path.
//! - [`relay`] runs each connection's read loop and the broadcast fan-out.
//! - [`server`] binds the listening socket and spawns one task per connection.
//! - [`sink`] mirrors log lines into an append-only file.
//! - [`cli`] parses the command line into a [`server::RelayConfig`].

pub mod cli;
pub mod error;
pub mod participant;
pub mod registry;
pub mod relay;
pub mod server;
pub mod sink;

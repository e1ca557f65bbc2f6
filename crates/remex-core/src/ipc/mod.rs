//! Channel plumbing between proxies and the execution server.
//!
//! Each message is a 4-byte big-endian length followed by a JSON document.
//! Commands travel as `CommandEnvelope`s; responses are `$type`-tagged values.
//!
//! # Architecture
//!
//! - **Transport**: named local sockets or TCP, behind one `Channel` type
//! - **Server**: self-replenishing acceptor, one task per connection
//! - **Client**: one-in-one-out exchanges over a single channel
//! - **Protocol**: framing plus the command and response documents

pub mod client;
pub mod protocol;
pub mod server;
pub mod transport;

pub use client::ChannelClient;
pub use protocol::{CommandEnvelope, CommandKind};
pub use server::{CommandDispatch, DispatchOutcome, RemoteExecutionServer, ServerHandle};
pub use transport::Endpoint;

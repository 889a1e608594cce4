//! Network Module Implementation
//!
//! This module provides the connection engine: framing, per-socket tasks and the
//! event surface shared with the server.
//!
//! # Architecture
//!
//! The network module is built on tokio's async I/O primitives and consists of:
//! - Frame parsing for the 4-digit ASCII length prefixed wire format
//! - Connection management, one send, receive and heartbeat task per socket
//! - A client shim that dials a fixed address
//!
//! # Components
//!
//! - `Frame` / `FrameReader`: encode a payload, read complete frames off a socket
//! - `Connection`: owns one socket, its outbound queue and its subscribers
//! - `Client`: a `Connection` bound to a remote address
//! - `Endpoint`: status and default messages shared with the server
//!
//! # Features
//!
//! - Per connection FIFO outbound queue, woken on push
//! - Broadcast shutdown on disconnect, no polling
//! - Heartbeat with automatic sign-off on failure
//! - Errors reported as events, never propagated out of a task

pub use client::Client;
pub use connection::{Connection, ConnectionHandler};
pub use endpoint::{DefaultMessages, Endpoint, Status};
pub use events::{ConnectionEvent, SubscriptionId};
pub(crate) use events::Subscribers;
pub use frame::{Frame, FrameReader, HEADER_LEN, MAX_PAYLOAD_LEN};

mod client;
mod connection;
mod endpoint;
mod events;
mod frame;

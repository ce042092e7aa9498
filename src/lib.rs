//! Server-side WebSocket protocol engine.
//!
//! This crate upgrades an existing byte stream into a framed, bidirectional
//! text-messaging channel. It provides the opening handshake, a codec for
//! single-frame text and close frames, and [`Connection`]/[`Listener`] types
//! that turn decoded frames into callbacks.
//!
//! The host owns the sockets: it hands upgrade requests to
//! [`Listener::handle_upgrade`] and inbound bytes to
//! [`Connection::handle_data`]. The [`server`] module is a small tokio host
//! that does both over TCP.
//!
//! This crate does not handle fragmentation, ping/pong, extensions,
//! sub-protocols, TLS or payloads longer than 65535 bytes.
pub mod codec;
pub mod connection;
pub mod errors;
pub mod events;
pub mod handshake;
pub mod listener;
pub mod server;
pub mod transport;

pub use codec::Decoded;
pub use connection::{Connection, ConnectionId};
pub use errors::{ConnectionError, ProtocolError, WebsocketCodecError};
pub use events::SubscriptionId;
pub use listener::Listener;
pub use server::{Server, ServerConfig};
pub use transport::Transport;

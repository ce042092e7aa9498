//! Error types for the wsengine crate.

use thiserror::Error;

/// Reasons an upgrade request is refused during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// The `upgrade` header is absent or not exactly `websocket`.
    #[error("Upgrade header is not \"websocket\"")]
    NotWebSocket,
    /// The `sec-websocket-key` header is absent or not valid text.
    #[error("Missing Sec-WebSocket-Key header")]
    MissingKey,
}

/// Errors produced by the frame codec.

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WebsocketCodecError {
    /// The buffer ended before the header or payload it announces.
    #[error("Truncated frame: needed {needed} bytes, got {available}")]
    Truncated { needed: usize, available: usize },
    /// The frame uses a length encoding this engine does not handle.
    #[error("Unsupported payload length marker {0}")]
    UnsupportedPayload(u8),
    /// The text payload is not valid UTF-8.
    #[error("Invalid UTF-8 in text frame: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),
    /// The outbound payload does not fit a 16-bit extended length.
    #[error("Payload too big: {0} bytes")]
    PayloadTooLarge(usize),
}

impl WebsocketCodecError {
    /// Whether this error is a frame decode failure rather than an
    /// unsupported-but-wellformed frame.
    #[must_use]
    pub fn is_decode_failure(&self) -> bool {
        matches!(self, Self::Truncated { .. } | Self::InvalidUtf8(_))
    }
}

/// Errors produced by connections, the listener and the tokio host.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The connection has been closed; nothing more can be written.
    #[error("WebSocket closed")]
    Closed,
    /// The upgrade request was rejected.
    #[error("Handshake rejected: {0}")]
    Protocol(#[from] ProtocolError),
    /// An error occurred in the WebSocket codec.
    #[error("Codec error: {0}")]
    Codec(#[from] WebsocketCodecError),
    /// A payload could not be serialized to JSON.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    /// An underlying I/O error occurred.
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
    /// The request head grew past the configured limit.
    #[error("Handshake request too large")]
    HandshakeRequestTooLarge,
    /// The stream ended before a complete request head arrived.
    #[error("Failed to read handshake request")]
    ReadHandshakeFailed,
    /// The request head could not be parsed.
    #[error("Failed to parse handshake request")]
    ParseHandshakeFailed,
    /// The request had an invalid header name.
    #[error("Invalid header name")]
    InvalidHeaderName,
    /// The request had an invalid header value.
    #[error("Invalid header value")]
    InvalidHeaderValue,
}

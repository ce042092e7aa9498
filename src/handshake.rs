//! Server side of the opening handshake.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as base64;
use http::HeaderMap;
use sha1::{Digest, Sha1};

use crate::errors::ProtocolError;

/// GUID appended to the client key before hashing (RFC 6455 section 1.3).
pub const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Response written to a request that is not a WebSocket upgrade.
pub const BAD_REQUEST_RESPONSE: &[u8] = b"HTTP/1.1 400 Bad Request";

/// Check that `headers` ask for a WebSocket upgrade and return the client key.
///
/// The `upgrade` value must be exactly `websocket`; no other header is
/// checked beyond the presence of `sec-websocket-key`.
///
/// # Errors
///
/// Returns [`ProtocolError::NotWebSocket`] if the upgrade header is wrong or
/// absent, and [`ProtocolError::MissingKey`] if there is no usable key.
pub fn validate(headers: &HeaderMap) -> Result<&str, ProtocolError> {
    let upgrade = headers.get(http::header::UPGRADE).map(http::HeaderValue::as_bytes);
    if upgrade != Some(b"websocket".as_slice()) {
        return Err(ProtocolError::NotWebSocket);
    }
    headers
        .get(http::header::SEC_WEBSOCKET_KEY)
        .and_then(|v| v.to_str().ok())
        .ok_or(ProtocolError::MissingKey)
}

/// Compute the `Sec-WebSocket-Accept` value for a client key.
#[must_use]
pub fn compute_accept_value(client_key: &str) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(client_key.as_bytes());
    sha1.update(WEBSOCKET_GUID.as_bytes());
    base64.encode(sha1.finalize())
}

/// Build the `101` response completing the handshake.
#[must_use]
pub fn build_response(accept_value: &str) -> String {
    format!(
        "HTTP/1.1 101 Web Socket Protocol Handshake\r\nUpgrade: WebSocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: {accept_value}\r\n\r\n"
    )
}

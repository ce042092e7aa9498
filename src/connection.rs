//! A live WebSocket connection and its message/disconnect events.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tracing::{debug, trace, warn};

use crate::codec::{self, Decoded};
use crate::errors::ConnectionError;
use crate::events::{SubscriptionId, Subscribers};
use crate::transport::Transport;

/// Callback invoked with the text of each inbound message.
pub type MessageHandler = dyn Fn(&str) + Send + Sync;

/// Callback invoked once when the connection goes away.
pub type DisconnectHandler = dyn Fn() + Send + Sync;

/// Process-unique identifier of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ws-{}", self.0)
    }
}

/// A websocket connection
///
/// Cloning is cheap; clones share the transport and subscriber lists.
/// Inbound bytes are fed in through [`Connection::handle_data`] and the
/// end of the underlying stream through
/// [`Connection::handle_transport_closed`], both normally driven by the host
/// (see [`crate::server`]).
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

struct Inner {
    id: ConnectionId,
    transport: Box<dyn Transport>,
    closed: AtomicBool,
    close_signal: Notify,
    message: Mutex<Subscribers<MessageHandler>>,
    disconnect: Mutex<Subscribers<DisconnectHandler>>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Connection {
    pub(crate) fn new<T: Transport + 'static>(transport: T) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: ConnectionId::next(),
                transport: Box::new(transport),
                closed: AtomicBool::new(false),
                close_signal: Notify::new(),
                message: Mutex::default(),
                disconnect: Mutex::default(),
            }),
        }
    }

    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    /// Whether the connection has closed, for any reason.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Resolves once the connection has closed, for any reason.
    ///
    /// Hosts select on this alongside their reads so a connection closed
    /// from elsewhere (e.g. [`crate::Listener::shutdown`]) releases its
    /// stream without waiting for the peer.
    pub async fn closed(&self) {
        let mut notified = std::pin::pin!(self.inner.close_signal.notified());
        notified.as_mut().enable();
        if self.is_closed() {
            return;
        }
        notified.await;
    }

    /// Register a callback for inbound text messages.
    ///
    /// Callbacks run in registration order. Messages that arrived before
    /// registration are not replayed. On a closed connection the callback
    /// is dropped at once and the returned handle removes nothing.
    pub fn on_message<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        let mut message = self.inner.message.lock();
        if self.is_closed() {
            trace!(connection = %self.inner.id, "Dropping message handler registered after close");
            return message.next_handle();
        }
        message.subscribe(Arc::new(callback))
    }

    /// Remove a message callback. Returns `false` if it was not registered.
    pub fn remove_message_handler(&self, id: SubscriptionId) -> bool {
        self.inner.message.lock().remove(id)
    }

    /// Register a callback for the end of the connection.
    ///
    /// Disconnect callbacks fire at most once per connection, whether the
    /// peer sent a close frame, sent an undecodable frame, dropped the
    /// stream, or [`Connection::close`] was called. A callback registered
    /// after that point is dropped without running.
    pub fn on_disconnect<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn() + Send + Sync + 'static,
    {
        let mut disconnect = self.inner.disconnect.lock();
        if self.is_closed() {
            trace!(connection = %self.inner.id, "Dropping disconnect handler registered after close");
            return disconnect.next_handle();
        }
        disconnect.subscribe(Arc::new(callback))
    }

    /// Remove a disconnect callback. Returns `false` if it was not registered.
    pub fn remove_disconnect_handler(&self, id: SubscriptionId) -> bool {
        self.inner.disconnect.lock().remove(id)
    }

    /// Feed one transport delivery through the frame decoder.
    ///
    /// A decode failure is treated as an abrupt disconnect: subscribers are
    /// told once, the transport is shut down and later bytes are discarded.
    pub fn handle_data(&self, buf: &[u8]) {
        let id = self.inner.id;
        if self.is_closed() {
            trace!(connection = %id, len = buf.len(), "Discarding bytes after close");
            return;
        }
        match codec::decode(buf) {
            Ok(Decoded::Message(text)) => {
                let handlers = self.inner.message.lock().snapshot();
                trace!(connection = %id, len = text.len(), subscribers = handlers.len(), "Text message");
                for handler in handlers {
                    handler(&text);
                }
            }
            Ok(Decoded::Closing) => {
                debug!(connection = %id, "Peer sent close frame");
                if self.mark_closed() {
                    if let Err(e) = self.inner.transport.write(codec::encode_close().freeze()) {
                        debug!(connection = %id, error = %e, "Could not answer close frame");
                    }
                    self.inner.transport.shutdown();
                    self.fire_disconnect();
                }
            }
            Ok(Decoded::Ignored) => {
                trace!(connection = %id, opcode = buf[0] & 0x0F, "Ignoring frame");
            }
            Err(e) if e.is_decode_failure() => {
                warn!(connection = %id, error = %e, "Dropping connection after undecodable frame");
                self.abort();
            }
            Err(e) => {
                debug!(connection = %id, error = %e, "Dropping connection after unsupported frame");
                self.abort();
            }
        }
    }

    /// The underlying stream ended or failed.
    pub fn handle_transport_closed(&self) {
        if !self.is_closed() {
            debug!(connection = %self.inner.id, "Transport closed");
        }
        self.abort();
    }

    /// Send a text message as a single frame.
    ///
    /// The call never waits for the bytes to reach the peer.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::Closed`] after the connection has closed,
    /// a codec error if the text is too large for one frame, or the
    /// transport's error if it refused the write.
    pub fn send(&self, text: &str) -> Result<(), ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }
        let frame = codec::encode_text(text)?;
        self.write(frame)
    }

    /// Serialize `value` to compact JSON and send it as a text message.
    ///
    /// # Errors
    ///
    /// As [`Connection::send`], plus [`ConnectionError::Json`] if
    /// serialization fails.
    pub fn send_json<T>(&self, value: &T) -> Result<(), ConnectionError>
    where
        T: Serialize + ?Sized,
    {
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }
        let frame = codec::encode_json(value)?;
        self.write(frame)
    }

    /// Send a close frame, shut the transport down and notify disconnect
    /// subscribers. Does nothing if the connection is already closed.
    pub fn close(&self) {
        if !self.mark_closed() {
            return;
        }
        debug!(connection = %self.inner.id, "Closing connection");
        if let Err(e) = self.inner.transport.write(codec::encode_close().freeze()) {
            debug!(connection = %self.inner.id, error = %e, "Could not send close frame");
        }
        self.inner.transport.shutdown();
        self.fire_disconnect();
    }

    fn write(&self, frame: tokio_util::bytes::BytesMut) -> Result<(), ConnectionError> {
        self.inner.transport.write(frame.freeze()).inspect_err(|e| {
            warn!(connection = %self.inner.id, error = %e, "Write failed");
        })
    }

    fn abort(&self) {
        if self.mark_closed() {
            self.inner.transport.shutdown();
            self.fire_disconnect();
        }
    }

    /// Returns `true` for the caller that performed the transition.
    fn mark_closed(&self) -> bool {
        let first = !self.inner.closed.swap(true, Ordering::SeqCst);
        if first {
            self.inner.close_signal.notify_waiters();
        }
        first
    }

    /// Runs disconnect callbacks and drops every subscriber; callbacks that
    /// capture a clone of this connection would otherwise keep it alive.
    fn fire_disconnect(&self) {
        drop(self.inner.message.lock().drain());
        let handlers = self.inner.disconnect.lock().drain();
        for handler in handlers {
            handler();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::transport::testing::RecordingTransport;

    fn masked(text: &str) -> Vec<u8> {
        let mask = [0x11, 0x22, 0x33, 0x44];
        let mut frame = vec![0x81, 0x80 | u8::try_from(text.len()).unwrap()];
        frame.extend_from_slice(&mask);
        frame.extend(text.bytes().enumerate().map(|(i, b)| b ^ mask[i % 4]));
        frame
    }

    fn recorder() -> (Connection, RecordingTransport) {
        let transport = RecordingTransport::default();
        (Connection::new(transport.clone()), transport)
    }

    fn counter() -> (Arc<AtomicUsize>, impl Fn() + Send + Sync + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let hits = Arc::clone(&count);
        (count, move || {
            hits.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn messages_reach_subscribers_in_registration_order() {
        let (conn, _) = recorder();
        let log = Arc::new(Mutex::new(Vec::new()));
        for tag in ["first", "second"] {
            let log = Arc::clone(&log);
            conn.on_message(move |text| log.lock().push(format!("{tag}:{text}")));
        }

        conn.handle_data(&masked("hello"));
        assert_eq!(*log.lock(), vec!["first:hello", "second:hello"]);
    }

    #[test]
    fn late_subscribers_miss_earlier_messages() {
        let (conn, _) = recorder();
        conn.handle_data(&masked("early"));

        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        conn.on_message(move |text| sink.lock().push(text.to_owned()));
        conn.handle_data(&masked("late"));
        assert_eq!(*log.lock(), vec!["late"]);
    }

    #[test]
    fn removed_message_handler_stops_firing() {
        let (conn, _) = recorder();
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        let id = conn.on_message(move |text| sink.lock().push(text.to_owned()));

        conn.handle_data(&masked("one"));
        assert!(conn.remove_message_handler(id));
        conn.handle_data(&masked("two"));
        assert_eq!(*log.lock(), vec!["one"]);
        assert!(!conn.remove_message_handler(id));
    }

    #[test]
    fn ignored_frames_fire_nothing() {
        let (conn, transport) = recorder();
        let (messages, on_message) = counter();
        let (disconnects, on_disconnect) = counter();
        conn.on_message(move |_| on_message());
        conn.on_disconnect(on_disconnect);

        conn.handle_data(&[0x82, 0x02, 0xde, 0xad]);
        assert_eq!(messages.load(Ordering::SeqCst), 0);
        assert_eq!(disconnects.load(Ordering::SeqCst), 0);
        assert!(!conn.is_closed());
        assert!(transport.written().is_empty());
    }

    #[test]
    fn close_frame_disconnects_once_and_answers() {
        let (conn, transport) = recorder();
        let (disconnects, on_disconnect) = counter();
        conn.on_disconnect(on_disconnect);

        conn.handle_data(&[0x88, 0x80, 1, 2, 3, 4]);
        conn.handle_data(&[0x88, 0x00]);
        conn.handle_transport_closed();

        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
        assert!(conn.is_closed());
        assert!(transport.is_shut_down());
        assert_eq!(transport.written(), vec![codec::encode_close().freeze()]);
    }

    #[test]
    fn bytes_after_close_are_discarded() {
        let (conn, _) = recorder();
        let (messages, on_message) = counter();
        conn.on_message(move |_| on_message());

        conn.handle_data(&[0x88, 0x00]);
        conn.handle_data(&masked("too late"));
        assert_eq!(messages.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn decode_failure_is_an_abrupt_disconnect() {
        let (conn, transport) = recorder();
        let (messages, on_message) = counter();
        let (disconnects, on_disconnect) = counter();
        conn.on_message(move |_| on_message());
        conn.on_disconnect(on_disconnect);

        // Announces five payload bytes, carries two.
        conn.handle_data(&[0x81, 0x05, b'h', b'i']);
        conn.handle_data(&masked("after"));

        assert_eq!(messages.load(Ordering::SeqCst), 0);
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
        assert!(transport.is_shut_down());
        assert!(transport.written().is_empty());
    }

    #[test]
    fn unsupported_length_is_an_abrupt_disconnect() {
        let (conn, _) = recorder();
        let (disconnects, on_disconnect) = counter();
        conn.on_disconnect(on_disconnect);

        conn.handle_data(&[0x81, 0xFF, 0, 0, 0, 0, 0, 1, 0, 0]);
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
        assert!(conn.is_closed());
    }

    #[test]
    fn transport_close_fires_disconnect() {
        let (conn, _) = recorder();
        let (disconnects, on_disconnect) = counter();
        conn.on_disconnect(on_disconnect);

        conn.handle_transport_closed();
        conn.handle_transport_closed();
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn removed_disconnect_handler_stops_firing() {
        let (conn, _) = recorder();
        let (disconnects, on_disconnect) = counter();
        let id = conn.on_disconnect(on_disconnect);
        assert!(conn.remove_disconnect_handler(id));

        conn.handle_transport_closed();
        assert_eq!(disconnects.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn send_writes_encoded_frames() {
        let (conn, transport) = recorder();
        conn.send("hi").unwrap();
        conn.send_json(&serde_json::json!({ "type": "x" })).unwrap();

        assert_eq!(
            transport.written(),
            vec![
                codec::encode_text("hi").unwrap().freeze(),
                codec::encode_text(r#"{"type":"x"}"#).unwrap().freeze(),
            ]
        );
    }

    #[test]
    fn send_reports_transport_failure() {
        let (conn, transport) = recorder();
        transport.refuse_writes();
        assert!(matches!(conn.send("hi"), Err(ConnectionError::Io(_))));
    }

    #[test]
    fn send_after_close_is_refused() {
        let (conn, transport) = recorder();
        conn.close();
        assert!(matches!(conn.send("hi"), Err(ConnectionError::Closed)));
        assert!(matches!(
            conn.send_json(&[1, 2, 3]),
            Err(ConnectionError::Closed)
        ));
        assert_eq!(transport.written(), vec![codec::encode_close().freeze()]);
    }

    #[test]
    fn close_with_refused_write_still_tears_down() {
        let (conn, transport) = recorder();
        let (disconnects, on_disconnect) = counter();
        conn.on_disconnect(on_disconnect);
        transport.refuse_writes();

        conn.close();
        assert!(conn.is_closed());
        assert!(transport.is_shut_down());
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn oversized_send_is_a_codec_error() {
        let (conn, transport) = recorder();
        let text = "z".repeat(70_000);
        assert!(matches!(
            conn.send(&text),
            Err(ConnectionError::Codec(_))
        ));
        assert!(transport.written().is_empty());
    }

    #[test]
    fn handlers_may_reply_from_inside_a_callback() {
        let (conn, transport) = recorder();
        let replier = conn.clone();
        conn.on_message(move |text| {
            replier.send(&text.to_uppercase()).unwrap();
        });

        conn.handle_data(&masked("echo"));
        assert_eq!(
            transport.written(),
            vec![codec::encode_text("ECHO").unwrap().freeze()]
        );
    }

    #[test]
    fn handlers_may_subscribe_from_inside_a_callback() {
        let (conn, _) = recorder();
        let (messages, on_message) = counter();
        let on_message = Arc::new(on_message);
        let registrar = conn.clone();
        conn.on_message(move |_| {
            let on_message = Arc::clone(&on_message);
            registrar.on_message(move |_| on_message());
        });

        conn.handle_data(&masked("a"));
        assert_eq!(messages.load(Ordering::SeqCst), 0);
        conn.handle_data(&masked("b"));
        assert_eq!(messages.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn handlers_registered_after_close_are_dropped() {
        let (conn, _) = recorder();
        conn.close();

        let held = Arc::new(conn.clone());
        let captured = Arc::clone(&held);
        let message_id = conn.on_message(move |_| {
            let _ = captured.send("unreachable");
        });
        let captured = Arc::clone(&held);
        let disconnect_id = conn.on_disconnect(move || {
            let _ = captured.is_closed();
        });

        assert_eq!(Arc::strong_count(&held), 1);
        assert!(!conn.remove_message_handler(message_id));
        assert!(!conn.remove_disconnect_handler(disconnect_id));
        conn.handle_transport_closed();
    }

    #[tokio::test]
    async fn closed_resolves_when_closed_elsewhere() {
        let (conn, _) = recorder();
        let waiter = conn.clone();
        let task = tokio::spawn(async move { waiter.closed().await });

        tokio::task::yield_now().await;
        assert!(!task.is_finished());
        conn.close();
        tokio::time::timeout(std::time::Duration::from_secs(2), task)
            .await
            .expect("closed() did not resolve")
            .unwrap();
    }

    #[tokio::test]
    async fn closed_resolves_immediately_after_close() {
        let (conn, _) = recorder();
        conn.handle_data(&[0x88, 0x00]);
        tokio::time::timeout(std::time::Duration::from_secs(2), conn.closed())
            .await
            .expect("closed() did not resolve");
    }

    #[test]
    fn connections_do_not_share_subscribers() {
        let (a, _) = recorder();
        let (b, _) = recorder();
        assert_ne!(a.id(), b.id());
        let (messages, on_message) = counter();
        a.on_message(move |_| on_message());

        b.handle_data(&masked("other"));
        assert_eq!(messages.load(Ordering::SeqCst), 0);
    }
}

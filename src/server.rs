//! Minimal tokio host: accepts TCP streams, reads the upgrade request head
//! and pumps each stream's deliveries into a [`Listener`].
//!
//! Each `read` from the socket is handed to the connection as one delivery;
//! frames split across reads are not reassembled.

use std::net::{Ipv4Addr, SocketAddr};

use http::{HeaderMap, HeaderName, HeaderValue};
use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};
use tokio::net::TcpListener;
use tracing::{debug, info};

use crate::errors::ConnectionError;
use crate::handshake::BAD_REQUEST_RESPONSE;
use crate::listener::Listener;
use crate::transport;

/// Limit on the number of request header lines.
const MAX_HEADERS: usize = 64;

/// Host settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to listen on.
    pub bind_addr: SocketAddr,
    /// Largest accepted request head, in bytes.
    pub max_request_head: usize,
    /// Size of the per-connection read buffer, i.e. the largest single delivery.
    pub read_buffer_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 8080)),
            max_request_head: 8192,
            read_buffer_size: 4096,
        }
    }
}

impl ServerConfig {
    #[must_use]
    pub fn with_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    #[must_use]
    pub fn with_max_request_head(mut self, bytes: usize) -> Self {
        self.max_request_head = bytes;
        self
    }

    #[must_use]
    pub fn with_read_buffer_size(mut self, bytes: usize) -> Self {
        self.read_buffer_size = bytes;
        self
    }
}

/// A bound TCP server feeding a [`Listener`].
pub struct Server {
    tcp: TcpListener,
    listener: Listener,
    config: ServerConfig,
}

impl Server {
    /// Bind the configured address.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the address cannot be bound.
    pub async fn bind(config: ServerConfig, listener: Listener) -> Result<Self, ConnectionError> {
        let tcp = TcpListener::bind(config.bind_addr).await?;
        info!(addr = %tcp.local_addr()?, "WebSocket server listening");
        Ok(Self {
            tcp,
            listener,
            config,
        })
    }

    /// The address actually bound, useful with port 0.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the socket has no local address.
    pub fn local_addr(&self) -> Result<SocketAddr, ConnectionError> {
        Ok(self.tcp.local_addr()?)
    }

    /// Accept streams forever, serving each on its own task.
    ///
    /// # Errors
    ///
    /// Returns the first error from `accept`.
    pub async fn run(self) -> Result<(), ConnectionError> {
        loop {
            let (stream, peer) = self.tcp.accept().await?;
            debug!(peer = %peer, "Accepted TCP stream");
            let listener = self.listener.clone();
            let config = self.config.clone();
            tokio::spawn(async move {
                if let Err(e) = serve_stream(stream, &listener, &config).await {
                    debug!(peer = %peer, error = %e, "Stream ended with error");
                }
            });
        }
    }
}

/// Serve one stream: upgrade it through `listener`, then deliver its bytes
/// until the peer closes, the connection closes, or a read fails.
///
/// A connection closed from elsewhere ([`crate::Connection::close`],
/// [`Listener::shutdown`]) ends the read loop immediately, even if the peer
/// is idle.
///
/// # Errors
///
/// Returns an error if the request head cannot be read or parsed, or if the
/// listener rejects the upgrade.
pub async fn serve_stream<S>(
    stream: S,
    listener: &Listener,
    config: &ServerConfig,
) -> Result<(), ConnectionError>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut reader, mut writer) = tokio::io::split(stream);

    let (headers, leftover) = match read_upgrade_request(&mut reader, config.max_request_head).await
    {
        Ok(request) => request,
        Err(e @ (ConnectionError::ParseHandshakeFailed
        | ConnectionError::InvalidHeaderName
        | ConnectionError::InvalidHeaderValue
        | ConnectionError::HandshakeRequestTooLarge)) => {
            let _ = writer.write_all(BAD_REQUEST_RESPONSE).await;
            let _ = writer.shutdown().await;
            return Err(e);
        }
        Err(e) => return Err(e),
    };

    let (transport, outbound) = transport::channel();
    let writer_task = tokio::spawn(transport::write_loop(outbound, writer));

    let connection = match listener.handle_upgrade(&headers, transport) {
        Ok(connection) => connection,
        Err(e) => {
            let _ = writer_task.await;
            return Err(e);
        }
    };

    if !leftover.is_empty() {
        connection.handle_data(&leftover);
    }

    let mut buf = vec![0u8; config.read_buffer_size];
    while !connection.is_closed() {
        tokio::select! {
            () = connection.closed() => break,
            read = reader.read(&mut buf) => match read {
                Ok(0) => break,
                Ok(n) => connection.handle_data(&buf[..n]),
                Err(e) => {
                    debug!(connection = %connection.id(), error = %e, "Read failed");
                    break;
                }
            },
        }
    }
    connection.handle_transport_closed();

    match writer_task.await {
        Ok(Err(e)) => debug!(connection = %connection.id(), error = %e, "Writer failed"),
        Err(e) => debug!(connection = %connection.id(), error = %e, "Writer task aborted"),
        Ok(Ok(())) => {}
    }
    Ok(())
}

/// Read until a complete request head is buffered. Returns the headers and
/// any bytes that followed the head in the same reads.
async fn read_upgrade_request<R>(
    reader: &mut R,
    max_request_head: usize,
) -> Result<(HeaderMap, Vec<u8>), ConnectionError>
where
    R: AsyncRead + Unpin,
{
    let mut request = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        let n = reader
            .read(&mut buf)
            .await
            .map_err(|_| ConnectionError::ReadHandshakeFailed)?;
        if n == 0 {
            return Err(ConnectionError::ReadHandshakeFailed);
        }
        request.extend_from_slice(&buf[..n]);
        if let Some((headers, head_len)) = parse_request_head(&request)? {
            if head_len > max_request_head {
                return Err(ConnectionError::HandshakeRequestTooLarge);
            }
            let leftover = request.split_off(head_len);
            return Ok((headers, leftover));
        }
        if request.len() > max_request_head {
            return Err(ConnectionError::HandshakeRequestTooLarge);
        }
    }
}

fn parse_request_head(bytes: &[u8]) -> Result<Option<(HeaderMap, usize)>, ConnectionError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);
    let status = req
        .parse(bytes)
        .map_err(|_| ConnectionError::ParseHandshakeFailed)?;
    let httparse::Status::Complete(head_len) = status else {
        return Ok(None);
    };
    let mut map = HeaderMap::with_capacity(req.headers.len());
    for h in req.headers.iter() {
        let name = HeaderName::from_bytes(h.name.as_bytes())
            .map_err(|_| ConnectionError::InvalidHeaderName)?;
        let value =
            HeaderValue::from_bytes(h.value).map_err(|_| ConnectionError::InvalidHeaderValue)?;
        map.append(name, value);
    }
    Ok(Some((map, head_len)))
}

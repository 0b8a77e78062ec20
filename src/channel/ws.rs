//! WebSocket transport (`ws://` and `wss://`).
//!
//! Name resolution, TCP connect and the TLS/WebSocket handshake run on a
//! short-lived helper thread, so the owner's loop keeps stepping while a
//! reconnect is in flight. Once open, the socket is non-blocking and the
//! write buffer is bounded: a peer that stops reading makes sends drop
//! instead of piling frames up in memory.

use std::io::ErrorKind;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::time::Duration;

use tungstenite::protocol::frame::coding::CloseCode;
use tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tungstenite::stream::MaybeTlsStream;
use tungstenite::{Message, WebSocket};
use url::Url;

use super::{Connection, Inbound, PendingConnection, SendStatus, Transport};
use crate::error::ChannelError;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound on unflushed output. Roughly two large frames.
pub const MAX_WRITE_BUFFER: usize = 1024 * 1024;

pub struct WsTransport {
    connect_timeout: Duration,
}

impl WsTransport {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for WsTransport {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECT_TIMEOUT)
    }
}

fn connect_error(endpoint: &str, message: impl ToString) -> ChannelError {
    ChannelError::Connect {
        endpoint: endpoint.to_string(),
        message: message.to_string(),
    }
}

fn socket_config() -> WebSocketConfig {
    let mut config = WebSocketConfig::default();
    config.write_buffer_size = 0;
    config.max_write_buffer_size = MAX_WRITE_BUFFER;
    config
}

/// Blocking open: resolve, connect, handshake, then switch to non-blocking.
fn open_socket(endpoint: &str, connect_timeout: Duration) -> Result<WsConnection, ChannelError> {
    let url = Url::parse(endpoint).map_err(|e| connect_error(endpoint, e))?;
    if url.scheme() != "ws" && url.scheme() != "wss" {
        return Err(connect_error(
            endpoint,
            format!("unsupported scheme '{}'", url.scheme()),
        ));
    }
    let host = url
        .host_str()
        .ok_or_else(|| connect_error(endpoint, "missing host"))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| connect_error(endpoint, "missing port"))?;
    let addr = (host, port)
        .to_socket_addrs()
        .map_err(|e| connect_error(endpoint, e))?
        .next()
        .ok_or_else(|| connect_error(endpoint, "host did not resolve"))?;

    let stream = TcpStream::connect_timeout(&addr, connect_timeout)
        .map_err(|e| connect_error(endpoint, e))?;
    stream
        .set_read_timeout(Some(connect_timeout))
        .map_err(|e| connect_error(endpoint, e))?;
    stream
        .set_write_timeout(Some(connect_timeout))
        .map_err(|e| connect_error(endpoint, e))?;
    stream
        .set_nodelay(true)
        .map_err(|e| connect_error(endpoint, e))?;

    let (mut socket, _response) =
        tungstenite::client_tls_with_config(endpoint, stream, Some(socket_config()), None)
            .map_err(|e| connect_error(endpoint, e))?;
    set_nonblocking(&mut socket).map_err(|e| connect_error(endpoint, e))?;

    Ok(WsConnection {
        socket,
        backlog: false,
    })
}

impl Transport for WsTransport {
    fn open(&mut self, endpoint: &str) -> Result<Box<dyn Connection>, ChannelError> {
        Ok(Box::new(open_socket(endpoint, self.connect_timeout)?))
    }

    fn begin_open(&mut self, endpoint: &str) -> Box<dyn PendingConnection> {
        let (tx, rx) = mpsc::channel();
        let target = endpoint.to_string();
        let timeout = self.connect_timeout;
        let spawned = std::thread::Builder::new()
            .name("ws-connect".to_string())
            .spawn(move || {
                let result = open_socket(&target, timeout);
                if tx.send(result).is_err() {
                    log::debug!("connect to {} finished after the attempt was abandoned", target);
                }
            });
        if let Err(err) = spawned {
            return Box::new(FailedOpen(Some(connect_error(
                endpoint,
                format!("spawn connect thread: {}", err),
            ))));
        }
        Box::new(ConnectAttempt {
            endpoint: endpoint.to_string(),
            rx,
        })
    }
}

struct ConnectAttempt {
    endpoint: String,
    rx: Receiver<Result<WsConnection, ChannelError>>,
}

impl PendingConnection for ConnectAttempt {
    fn poll_ready(&mut self) -> Option<Result<Box<dyn Connection>, ChannelError>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result.map(|conn| Box::new(conn) as Box<dyn Connection>)),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(connect_error(
                &self.endpoint,
                "connect thread exited without a result",
            ))),
        }
    }
}

struct FailedOpen(Option<ChannelError>);

impl PendingConnection for FailedOpen {
    fn poll_ready(&mut self) -> Option<Result<Box<dyn Connection>, ChannelError>> {
        self.0.take().map(Err)
    }
}

fn set_nonblocking(socket: &mut WebSocket<MaybeTlsStream<TcpStream>>) -> std::io::Result<()> {
    match socket.get_mut() {
        MaybeTlsStream::Plain(stream) => stream.set_nonblocking(true),
        MaybeTlsStream::Rustls(stream) => stream.get_mut().set_nonblocking(true),
        _ => Ok(()),
    }
}

fn is_would_block(err: &tungstenite::Error) -> bool {
    matches!(err, tungstenite::Error::Io(io) if io.kind() == ErrorKind::WouldBlock)
}

struct WsConnection {
    socket: WebSocket<MaybeTlsStream<TcpStream>>,
    /// Output is sitting in the write buffer because the socket would block.
    backlog: bool,
}

impl WsConnection {
    fn flush(&mut self) -> Result<(), ChannelError> {
        match self.socket.flush() {
            Ok(()) => {
                self.backlog = false;
                Ok(())
            }
            Err(err) if is_would_block(&err) => {
                self.backlog = true;
                Ok(())
            }
            Err(err) => Err(ChannelError::Transport(err.to_string())),
        }
    }
}

impl Connection for WsConnection {
    fn send_text(&mut self, text: &str) -> Result<SendStatus, ChannelError> {
        match self.socket.send(Message::Text(text.to_string())) {
            Ok(()) => {
                self.backlog = false;
                Ok(SendStatus::Flushed)
            }
            Err(err) if is_would_block(&err) => {
                self.backlog = true;
                Ok(SendStatus::Queued)
            }
            Err(tungstenite::Error::WriteBufferFull(_)) => {
                self.backlog = true;
                Ok(SendStatus::Dropped)
            }
            Err(err) => Err(ChannelError::Transport(err.to_string())),
        }
    }

    fn is_writable(&self) -> bool {
        !self.backlog
    }

    fn try_recv(&mut self) -> Result<Option<Inbound>, ChannelError> {
        self.flush()?;
        loop {
            match self.socket.read() {
                Ok(Message::Text(text)) => return Ok(Some(Inbound::Text(text))),
                Ok(Message::Binary(bytes)) => return Ok(Some(Inbound::Binary(bytes))),
                Ok(Message::Close(frame)) => {
                    return Ok(Some(Inbound::Closed {
                        code: frame.map(|frame| u16::from(frame.code)),
                    }))
                }
                // Pings are answered by tungstenite itself.
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => continue,
                Err(err) if is_would_block(&err) => return Ok(None),
                Err(tungstenite::Error::ConnectionClosed)
                | Err(tungstenite::Error::AlreadyClosed) => {
                    return Ok(Some(Inbound::Closed { code: None }))
                }
                Err(err) => return Err(ChannelError::Transport(err.to_string())),
            }
        }
    }

    fn close(&mut self, code: u16) {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: "".into(),
        };
        if let Err(err) = self.socket.close(Some(frame)) {
            if !is_would_block(&err) {
                log::debug!("websocket close failed: {}", err);
            }
        }
        let _ = self.socket.flush();
    }
}

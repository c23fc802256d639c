//! The upgraded connection: a socket plus the codec negotiated for it.

pub(crate) mod server;

use std::sync::Arc;

use futures_util::{SinkExt as _, StreamExt as _};
use tokio::io::AsyncWriteExt as _;
use tokio::sync::watch;
use tokio_util::codec::Framed;

use crate::codec::{Frame, FrameCodec, Message};
use crate::errors::{CodecError, ConnectionError};
use crate::handshake::{HandshakeRequest, ProtocolRevision};

// Trait alias for boxed stream type used in Connection
pub trait WebSocketStream: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin {}
impl<T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin> WebSocketStream for T {}

type FramedStream = Framed<Box<dyn WebSocketStream + Send>, FrameCodec>;

/// Lifecycle of a [`Connection`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// Messages can be sent and received.
    Open,
    /// A [`CloseHandle`] asked for the close; the owner has not torn the socket down yet.
    Closing,
    /// The socket has been shut down and released.
    Closed,
}

/// Requests the close of a [`Connection`] from another task.
///
/// A pending or later `receive()`/`send()` on the connection wakes up, shuts the socket
/// down and fails with [`ConnectionError::ConnectionClosed`].
#[derive(Debug, Clone)]
pub struct CloseHandle {
    signal: Arc<watch::Sender<bool>>,
}

impl CloseHandle {
    /// Ask for the close. Returns `false` if it had already been asked for.
    pub fn close(&self) -> bool {
        request_close(&self.signal)
    }

    #[must_use]
    pub fn is_close_requested(&self) -> bool {
        *self.signal.borrow()
    }
}

fn request_close(signal: &watch::Sender<bool>) -> bool {
    signal.send_if_modified(|closed| !std::mem::replace(closed, true))
}

/// A WebSocket connection after a successful handshake.
///
/// One task owns the connection and drives `send`/`receive`; use
/// [`Connection::close_handle`] to stop it from elsewhere.
pub struct Connection {
    framed: Option<FramedStream>,
    revision: ProtocolRevision,
    origin: Option<String>,
    protocol: Option<String>,
    path: String,
    close_signal: Arc<watch::Sender<bool>>,
    close_requested: watch::Receiver<bool>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("revision", &self.revision)
            .field("state", &self.state())
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Wrap a stream whose handshake has already been answered.
    ///
    /// `max_message_size` bounds every incoming frame.
    pub fn new<S>(stream: S, revision: ProtocolRevision, max_message_size: usize) -> Self
    where
        S: WebSocketStream + Send + 'static,
    {
        let codec = FrameCodec::for_revision(revision, max_message_size);
        let (close_signal, close_requested) = watch::channel(false);
        Self {
            framed: Some(Framed::new(
                Box::new(stream) as Box<dyn WebSocketStream + Send>,
                codec,
            )),
            revision,
            origin: None,
            protocol: None,
            path: String::from("/"),
            close_signal: Arc::new(close_signal),
            close_requested,
        }
    }

    /// Record the request metadata the connection was upgraded from.
    #[must_use]
    pub fn with_request(mut self, request: &HandshakeRequest) -> Self {
        self.origin.clone_from(&request.origin);
        self.protocol.clone_from(&request.protocol);
        self.path.clone_from(&request.path);
        self
    }

    /// Bytes the client sent after the handshake that were read along with it.
    pub(crate) fn prime_read_buffer(&mut self, buffered: &[u8]) {
        if let Some(framed) = self.framed.as_mut() {
            framed.read_buffer_mut().extend_from_slice(buffered);
        }
    }

    #[must_use]
    pub fn revision(&self) -> ProtocolRevision {
        self.revision
    }

    #[must_use]
    pub fn origin(&self) -> Option<&str> {
        self.origin.as_deref()
    }

    /// The requested sub-protocol, or `"unknown"` when none was asked for.
    #[must_use]
    pub fn protocol(&self) -> &str {
        self.protocol.as_deref().unwrap_or("unknown")
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        if self.framed.is_none() {
            ConnectionState::Closed
        } else if *self.close_requested.borrow() {
            ConnectionState::Closing
        } else {
            ConnectionState::Open
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.framed.is_none()
    }

    /// A handle that can close this connection from any task.
    #[must_use]
    pub fn close_handle(&self) -> CloseHandle {
        CloseHandle {
            signal: Arc::clone(&self.close_signal),
        }
    }

    /// Send a text message.
    /// # Errors
    /// Returns an error if the connection is closed or sending fails.
    pub async fn send_text(&mut self, text: &str) -> Result<(), ConnectionError> {
        self.send(Message::from(text)).await
    }

    /// Send one message as a single frame.
    ///
    /// Only text can be sent; binary messages and, on draft-07/08/13, texts longer than
    /// 65535 bytes are refused without touching the connection.
    /// # Errors
    /// Returns [`ConnectionError::ConnectionClosed`] once the connection is closed, or the
    /// codec/I/O error that prevented sending.
    pub async fn send(&mut self, message: impl Into<Message>) -> Result<(), ConnectionError> {
        if *self.close_requested.borrow() {
            self.shutdown().await;
        }
        let Some(framed) = self.framed.as_mut() else {
            return Err(ConnectionError::ConnectionClosed);
        };

        let sent = tokio::select! {
            biased;
            _ = self.close_requested.changed() => None,
            result = framed.send(message.into()) => Some(result),
        };
        match sent {
            Some(Ok(())) => Ok(()),
            Some(Err(e @ CodecError::IOError(_))) => {
                tracing::debug!(error = %e, "websocket write failed");
                self.shutdown().await;
                Err(e.into())
            }
            Some(Err(e)) => Err(e.into()),
            None => {
                self.shutdown().await;
                Err(ConnectionError::ConnectionClosed)
            }
        }
    }

    /// Wait for the next message.
    ///
    /// Returns `Ok(None)` when the peer closes or goes away; the connection is closed by
    /// then. Draft-75/76 binary frames are read and dropped. Any protocol error closes the
    /// connection before it is returned.
    /// # Errors
    /// Returns [`ConnectionError::ConnectionClosed`] once the connection is closed, or the
    /// codec error that ended it.
    pub async fn receive(&mut self) -> Result<Option<Message>, ConnectionError> {
        loop {
            if *self.close_requested.borrow() {
                self.shutdown().await;
            }
            let Some(framed) = self.framed.as_mut() else {
                return Err(ConnectionError::ConnectionClosed);
            };

            let next = tokio::select! {
                biased;
                _ = self.close_requested.changed() => None,
                frame = framed.next() => Some(frame),
            };

            match next {
                None => {
                    self.shutdown().await;
                    return Err(ConnectionError::ConnectionClosed);
                }
                Some(None) => {
                    tracing::debug!(revision = %self.revision, "websocket peer disconnected");
                    self.shutdown().await;
                    return Ok(None);
                }
                Some(Some(Err(e))) => {
                    tracing::warn!(revision = %self.revision, error = %e, "closing websocket");
                    self.shutdown().await;
                    return Err(e.into());
                }
                Some(Some(Ok(Frame::Close))) => {
                    tracing::debug!(revision = %self.revision, "websocket closed by peer");
                    self.shutdown().await;
                    return Ok(None);
                }
                Some(Some(Ok(Frame::Text(text)))) => return Ok(Some(Message::Text(text))),
                Some(Some(Ok(Frame::Binary(data)))) => match self.revision {
                    ProtocolRevision::Draft75 | ProtocolRevision::Draft76 => {
                        tracing::debug!(len = data.len(), "discarding legacy binary frame");
                    }
                    ProtocolRevision::Draft07to13 { .. } => {
                        return Ok(Some(Message::Binary(data)));
                    }
                },
            }
        }
    }

    /// Shut the socket down and release it. Closing twice does nothing.
    pub async fn close(&mut self) {
        self.shutdown().await;
    }

    async fn shutdown(&mut self) {
        request_close(&self.close_signal);
        let Some(mut framed) = self.framed.take() else {
            return;
        };
        // The peer may already have torn its side down.
        if let Err(e) = framed.get_mut().shutdown().await {
            tracing::debug!(error = %e, "when closing web socket");
        }
        tracing::debug!(revision = %self.revision, path = %self.path, "websocket closed");
    }
}

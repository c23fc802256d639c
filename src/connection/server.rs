use std::sync::Arc;

use http::{Request, Version};
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio_util::bytes::{Buf as _, BytesMut};

use crate::codec::DEFAULT_MAX_MESSAGE_SIZE;
use crate::config::AcceptorConfig;
use crate::connection::{Connection, WebSocketStream};
use crate::errors::{ConnectionError, HandshakeError};
use crate::handshake::{
    AllowedPaths, CHALLENGE_LEN, HandshakeRequest, HandshakeResponse, PathPattern, negotiate,
};

/// Largest request head accepted by default.
pub const DEFAULT_MAX_REQUEST_SIZE: usize = 8192;

const MAX_HEADERS: usize = 64;

/// Why [`Acceptor::accept`] handed the stream back.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DeclineReason {
    /// The request does not ask for a WebSocket upgrade.
    NotAnUpgrade,
    /// The request path matches none of the allowed paths.
    PathNotAllowed,
    /// The upgrade veto refused the request.
    Vetoed,
}

/// The outcome of reading one request off a fresh stream.
pub enum Upgrade<S> {
    /// The handshake was answered; the connection is ready for messages.
    Accepted(Connection),
    /// Serve the request as ordinary HTTP. Nothing has been written to `stream`.
    Declined {
        request: Request<()>,
        stream: S,
        /// Bytes read past the request head (the start of a body, or a pipelined request).
        buffered: BytesMut,
        reason: DeclineReason,
    },
}

impl<S> std::fmt::Debug for Upgrade<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Upgrade::Accepted(conn) => f.debug_tuple("Accepted").field(conn).finish(),
            Upgrade::Declined {
                request, reason, ..
            } => f
                .debug_struct("Declined")
                .field("request", request)
                .field("reason", reason)
                .finish_non_exhaustive(),
        }
    }
}

type UpgradeVeto = Arc<dyn Fn(&Request<()>) -> bool + Send + Sync>;

/// Accepts server-side upgrades on already-connected streams.
#[derive(Clone)]
pub struct Acceptor {
    max_message_size: usize,
    max_request_size: usize,
    server_port: Option<u16>,
    allowed_paths: AllowedPaths,
    can_upgrade: Option<UpgradeVeto>,
}

impl std::fmt::Debug for Acceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Acceptor")
            .field("max_message_size", &self.max_message_size)
            .field("max_request_size", &self.max_request_size)
            .field("server_port", &self.server_port)
            .field("allowed_paths", &self.allowed_paths)
            .field("upgrade_veto", &self.can_upgrade.is_some())
            .finish()
    }
}

impl Default for Acceptor {
    fn default() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            max_request_size: DEFAULT_MAX_REQUEST_SIZE,
            server_port: None,
            allowed_paths: AllowedPaths::default(),
            can_upgrade: None,
        }
    }
}

impl Acceptor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn from_config(config: &AcceptorConfig) -> Self {
        Self {
            max_message_size: config.max_message_size,
            max_request_size: config.max_request_size,
            server_port: config.server_port,
            allowed_paths: config.allowed_paths.clone(),
            can_upgrade: None,
        }
    }

    #[must_use]
    /// Set the largest incoming message accepted on upgraded connections.
    pub fn max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    #[must_use]
    /// Set the largest request head read before giving up.
    pub fn max_request_size(mut self, size: usize) -> Self {
        self.max_request_size = size;
        self
    }

    #[must_use]
    /// Set the local port requests arrive on; port 443 makes legacy locations `wss://`.
    pub fn server_port(mut self, port: u16) -> Self {
        self.server_port = Some(port);
        self
    }

    #[must_use]
    /// Allow upgrades on paths matching `pattern`.
    ///
    /// With no patterns every path may be upgraded; once one is added, a path must match
    /// at least one of them.
    pub fn allowed_path(mut self, pattern: PathPattern) -> Self {
        self.allowed_paths.push(pattern);
        self
    }

    #[must_use]
    /// Let `can_upgrade` refuse upgrades after the path check and before negotiation.
    ///
    /// Returning `false` declines the request with [`DeclineReason::Vetoed`].
    pub fn upgrade_veto<F>(mut self, can_upgrade: F) -> Self
    where
        F: Fn(&Request<()>) -> bool + Send + Sync + 'static,
    {
        self.can_upgrade = Some(Arc::new(can_upgrade));
        self
    }

    /// Read a request from `stream` and upgrade it if it asks for WebSocket.
    ///
    /// # Errors
    ///
    /// Returns an error if the request cannot be read or the handshake fails. On
    /// handshake failure the client has already been sent an error response and the
    /// stream has been shut down.
    pub async fn accept<S>(&self, mut stream: S) -> Result<Upgrade<S>, ConnectionError>
    where
        S: WebSocketStream + Send + 'static,
    {
        let (request, mut buffered) = read_request_head(&mut stream, self.max_request_size).await?;
        let version = request.version();
        let view = HandshakeRequest::from_request(&request, self.server_port);

        let reason = if !view.is_upgrade_request() {
            Some(DeclineReason::NotAnUpgrade)
        } else if !self.allowed_paths.permits(&view.path) {
            tracing::debug!(path = %view.path, "upgrade refused for path");
            Some(DeclineReason::PathNotAllowed)
        } else if self.can_upgrade.as_ref().is_some_and(|can| !can(&request)) {
            tracing::debug!(path = %view.path, "upgrade vetoed");
            Some(DeclineReason::Vetoed)
        } else {
            None
        };
        if let Some(reason) = reason {
            return Ok(Upgrade::Declined {
                request,
                stream,
                buffered,
                reason,
            });
        }

        let view = match view.needs_challenge() {
            Ok(true) => {
                let challenge = read_challenge(&mut stream, &mut buffered).await?;
                view.with_challenge(challenge)
            }
            Ok(false) => view,
            Err(e) => return Err(reject(&mut stream, version, e).await),
        };

        let (revision, response) = match negotiate(&view) {
            Ok(negotiated) => negotiated,
            Err(e) => return Err(reject(&mut stream, version, e).await),
        };

        stream.write_all(&response.to_bytes(version)).await?;
        stream.flush().await?;
        tracing::info!(
            %revision,
            path = %view.path,
            origin = view.origin.as_deref().unwrap_or_default(),
            "websocket upgraded"
        );

        let mut conn = Connection::new(stream, revision, self.max_message_size).with_request(&view);
        conn.prime_read_buffer(&buffered);
        Ok(Upgrade::Accepted(conn))
    }
}

/// Answer a failed upgrade and close the stream.
async fn reject<S>(stream: &mut S, version: Version, error: HandshakeError) -> ConnectionError
where
    S: WebSocketStream,
{
    tracing::warn!(error = %error, "websocket handshake failed");
    if let Some(response) = HandshakeResponse::rejection(&error) {
        if let Err(e) = stream.write_all(&response.to_bytes(version)).await {
            tracing::debug!(error = %e, "failed to write handshake rejection");
        }
    }
    if let Err(e) = stream.shutdown().await {
        tracing::debug!(error = %e, "when closing rejected stream");
    }
    ConnectionError::Handshake(error)
}

/// Read until a complete request head is buffered; return it with any bytes past it.
async fn read_request_head<S>(
    stream: &mut S,
    max_request_size: usize,
) -> Result<(Request<()>, BytesMut), ConnectionError>
where
    S: WebSocketStream,
{
    let mut request = BytesMut::new();
    let mut buf = [0u8; 1024];
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Err(ConnectionError::IncompleteHandshakeRequest);
        }
        request.extend_from_slice(&buf[..n]);

        if let Some((parsed, head_len)) = parse_request_head(&request)? {
            request.advance(head_len);
            return Ok((parsed, request));
        }
        if request.len() > max_request_size {
            return Err(ConnectionError::HandshakeRequestTooLarge);
        }
    }
}

fn parse_request_head(bytes: &[u8]) -> Result<Option<(Request<()>, usize)>, ConnectionError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);
    let httparse::Status::Complete(head_len) = req
        .parse(bytes)
        .map_err(|_| ConnectionError::ParseHandshakeFailed)?
    else {
        return Ok(None);
    };

    let method = req.method.ok_or(ConnectionError::ParseHandshakeFailed)?;
    let path = req.path.ok_or(ConnectionError::ParseHandshakeFailed)?;
    let version = match req.version {
        Some(0) => Version::HTTP_10,
        _ => Version::HTTP_11,
    };
    let mut builder = Request::builder().method(method).uri(path).version(version);
    for h in req.headers.iter() {
        builder = builder.header(h.name, h.value);
    }
    let request = builder
        .body(())
        .map_err(|_| ConnectionError::BuildHandshakeRequestFailed)?;
    Ok(Some((request, head_len)))
}

/// Take the eight draft-76 challenge bytes, reading more from `stream` if needed.
async fn read_challenge<S>(
    stream: &mut S,
    buffered: &mut BytesMut,
) -> Result<[u8; CHALLENGE_LEN], ConnectionError>
where
    S: WebSocketStream,
{
    let mut buf = [0u8; 64];
    while buffered.len() < CHALLENGE_LEN {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Err(ConnectionError::IncompleteHandshakeRequest);
        }
        buffered.extend_from_slice(&buf[..n]);
    }
    let mut challenge = [0u8; CHALLENGE_LEN];
    challenge.copy_from_slice(&buffered.split_to(CHALLENGE_LEN));
    Ok(challenge)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Message;
    use crate::handshake::ProtocolRevision;
    use tokio::io::DuplexStream;

    async fn read_available(client: &mut DuplexStream) -> Vec<u8> {
        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        out
    }

    #[test]
    fn parses_complete_head_only() {
        assert!(parse_request_head(b"GET / HTTP/1.1\r\nHost: a\r\n").unwrap().is_none());
        let (request, len) = parse_request_head(b"GET /x?y HTTP/1.0\r\nHost: a\r\n\r\nrest")
            .unwrap()
            .unwrap();
        assert_eq!(len, 30);
        assert_eq!(request.uri().path(), "/x");
        assert_eq!(request.version(), Version::HTTP_10);
        assert_eq!(request.headers()["host"], "a");
    }

    #[test]
    fn garbage_head_fails_to_parse() {
        assert!(matches!(
            parse_request_head(b"\x00\x01\x02 nonsense\r\n\r\n"),
            Err(ConnectionError::ParseHandshakeFailed)
        ));
    }

    #[tokio::test]
    async fn plain_http_is_declined_untouched() {
        let (server, mut client) = tokio::io::duplex(4096);
        client
            .write_all(b"POST /form HTTP/1.1\r\nHost: a\r\nContent-Length: 3\r\n\r\nabc")
            .await
            .unwrap();
        match Acceptor::new().accept(server).await.unwrap() {
            Upgrade::Declined {
                request,
                buffered,
                reason,
                ..
            } => {
                assert_eq!(reason, DeclineReason::NotAnUpgrade);
                assert_eq!(request.method(), http::Method::POST);
                assert_eq!(&buffered[..], b"abc");
            }
            Upgrade::Accepted(_) => panic!("plain request must not upgrade"),
        }
    }

    #[tokio::test]
    async fn disallowed_path_is_declined() {
        let (server, mut client) = tokio::io::duplex(4096);
        client
            .write_all(
                b"GET /admin HTTP/1.1\r\nHost: a\r\nConnection: Upgrade\r\nUpgrade: WebSocket\r\n\r\n",
            )
            .await
            .unwrap();
        let acceptor = Acceptor::new()
            .allowed_path(PathPattern::new("/chat").unwrap())
            .allowed_path(PathPattern::new("/feed$").unwrap());
        let upgrade = acceptor.accept(server).await.unwrap();
        assert!(matches!(
            upgrade,
            Upgrade::Declined {
                reason: DeclineReason::PathNotAllowed,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn second_allowed_path_permits() {
        let (server, mut client) = tokio::io::duplex(4096);
        client
            .write_all(
                b"GET /feed HTTP/1.1\r\nHost: a\r\nConnection: Upgrade\r\nUpgrade: WebSocket\r\n\r\n",
            )
            .await
            .unwrap();
        let acceptor = Acceptor::new()
            .allowed_path(PathPattern::new("/chat").unwrap())
            .allowed_path(PathPattern::new("/feed$").unwrap());
        let upgrade = acceptor.accept(server).await.unwrap();
        assert!(matches!(upgrade, Upgrade::Accepted(_)));
    }

    #[tokio::test]
    async fn upgrade_veto_declines_before_negotiation() {
        let (server, mut client) = tokio::io::duplex(4096);
        client
            .write_all(
                b"GET /chat HTTP/1.1\r\nHost: a\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\
                  Sec-WebSocket-Version: 13\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
                  Origin: http://evil.example\r\n\r\n",
            )
            .await
            .unwrap();
        let acceptor = Acceptor::new().upgrade_veto(|request| {
            request.headers().get("origin").is_some_and(|o| o == "http://example.com")
        });
        match acceptor.accept(server).await.unwrap() {
            Upgrade::Declined {
                request, reason, ..
            } => {
                assert_eq!(reason, DeclineReason::Vetoed);
                assert_eq!(request.uri().path(), "/chat");
            }
            Upgrade::Accepted(_) => panic!("vetoed request must not upgrade"),
        }
    }

    #[tokio::test]
    async fn upgrade_veto_can_allow() {
        let (server, mut client) = tokio::io::duplex(4096);
        client
            .write_all(
                b"GET /chat HTTP/1.1\r\nHost: a\r\nConnection: Upgrade\r\nUpgrade: WebSocket\r\n\
                  Origin: http://example.com\r\n\r\n",
            )
            .await
            .unwrap();
        let acceptor = Acceptor::new().upgrade_veto(|request| {
            request.headers().get("origin").is_some_and(|o| o == "http://example.com")
        });
        let upgrade = acceptor.accept(server).await.unwrap();
        assert!(matches!(upgrade, Upgrade::Accepted(_)));
    }

    #[tokio::test]
    async fn malformed_challenge_key_gets_400_after_challenge() {
        let (server, mut client) = tokio::io::duplex(4096);
        let accept = tokio::spawn(async move { Acceptor::new().accept(server).await });
        // 7 is not a multiple of the two spaces in Key1.
        client
            .write_all(
                b"GET /chat HTTP/1.1\r\nHost: a\r\nConnection: Upgrade\r\nUpgrade: WebSocket\r\n\
                  Sec-WebSocket-Key1: 7 a b\r\nSec-WebSocket-Key2: 12998 5 Y3 1  .P00\r\n\r\n",
            )
            .await
            .unwrap();
        tokio::task::yield_now().await;
        assert!(!accept.is_finished());
        client.write_all(b"^n:ds[4U").await.unwrap();

        let err = accept.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            ConnectionError::Handshake(HandshakeError::MalformedChallengeKey(_))
        ));
        let response = String::from_utf8(read_available(&mut client).await).unwrap();
        assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    }

    #[tokio::test]
    async fn missing_challenge_keys_get_400() {
        let (server, mut client) = tokio::io::duplex(4096);
        client
            .write_all(
                b"GET /chat HTTP/1.1\r\nHost: a\r\nConnection: Upgrade\r\nUpgrade: WebSocket\r\n\
                  Sec-WebSocket-Key1: 4 @1  46546xW%0l 1 5\r\n\r\n",
            )
            .await
            .unwrap();
        let err = Acceptor::new().accept(server).await.unwrap_err();
        assert!(matches!(
            err,
            ConnectionError::Handshake(HandshakeError::MissingChallengeKeys)
        ));
        let response = String::from_utf8(read_available(&mut client).await).unwrap();
        assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(response.ends_with("\r\n\r\nClient using old/invalid protocol implementation"));
    }

    #[tokio::test]
    async fn unsupported_version_gets_400() {
        let (server, mut client) = tokio::io::duplex(4096);
        client
            .write_all(
                b"GET /chat HTTP/1.1\r\nHost: a\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\
                  Sec-WebSocket-Version: 6\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n",
            )
            .await
            .unwrap();
        let err = Acceptor::new().accept(server).await.unwrap_err();
        assert!(matches!(
            err,
            ConnectionError::Handshake(HandshakeError::UnsupportedVersion(_))
        ));
        let response = String::from_utf8(read_available(&mut client).await).unwrap();
        assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    }

    #[tokio::test]
    async fn challenge_bytes_may_arrive_later() {
        let (server, mut client) = tokio::io::duplex(4096);
        let accept = tokio::spawn(async move { Acceptor::new().accept(server).await });
        client
            .write_all(
                b"GET /demo HTTP/1.1\r\nHost: example.com\r\nConnection: Upgrade\r\n\
                  Sec-WebSocket-Key2: 12998 5 Y3 1  .P00\r\nSec-WebSocket-Protocol: sample\r\n\
                  Upgrade: WebSocket\r\nSec-WebSocket-Key1: 4 @1  46546xW%0l 1 5\r\n\
                  Origin: http://example.com\r\n\r\n^n:d",
            )
            .await
            .unwrap();
        tokio::task::yield_now().await;
        client.write_all(b"s[4U\x00hi\xff").await.unwrap();

        let Upgrade::Accepted(mut conn) = accept.await.unwrap().unwrap() else {
            panic!("expected upgrade");
        };
        assert_eq!(conn.revision(), ProtocolRevision::Draft76);
        assert_eq!(conn.protocol(), "sample");
        // Frame bytes that arrived with the challenge are not lost.
        assert_eq!(conn.receive().await.unwrap(), Some(Message::Text("hi".into())));

        let mut head = vec![0u8; 1024];
        let n = client.read(&mut head).await.unwrap();
        assert!(head[..n].ends_with(b"\r\n\r\n8jKS'y:G*Co,Wxa-"));
    }

    #[tokio::test]
    async fn oversized_head_is_refused() {
        let (server, mut client) = tokio::io::duplex(1 << 16);
        let mut request = b"GET / HTTP/1.1\r\n".to_vec();
        request.extend(std::iter::repeat_n(b'X', 300));
        client.write_all(&request).await.unwrap();
        let err = Acceptor::new()
            .max_request_size(256)
            .accept(server)
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectionError::HandshakeRequestTooLarge));
    }

    #[tokio::test]
    async fn eof_before_head_is_incomplete() {
        let (server, mut client) = tokio::io::duplex(4096);
        client.write_all(b"GET / HTTP/1.1\r\n").await.unwrap();
        drop(client);
        let err = Acceptor::new().accept(server).await.unwrap_err();
        assert!(matches!(err, ConnectionError::IncompleteHandshakeRequest));
    }
}

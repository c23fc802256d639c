//! Server-side upgrade negotiation.
//!
//! Picks the protocol revision a client speaks from its request headers and builds the
//! exact response that revision expects.
//!
//! # Draft-07/08/13
//!
//! ```http
//! GET /chat HTTP/1.1
//! Host: server.example.com
//! Upgrade: websocket
//! Connection: Upgrade
//! Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==
//! Sec-WebSocket-Version: 13
//! ```
//!
//! ```http
//! HTTP/1.1 101 Switching Protocols
//! Upgrade: WebSocket
//! Connection: Upgrade
//! Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=
//! ```
//!
//! # Draft-75/76
//!
//! The legacy revisions answer with `101 Web Socket Protocol Handshake` and echo the
//! origin, sub-protocol and location. Draft-76 additionally proves the handshake with an
//! MD5 digest computed from `Sec-WebSocket-Key1`, `Sec-WebSocket-Key2` and eight bytes
//! the client sends after its headers. Legacy clients are picky about header order and
//! capitalization, so [`HandshakeResponse`] keeps both exactly as built here.

use std::fmt;

use base64::Engine as _;
use http::{HeaderMap, Request, StatusCode, Version};
use md5::Md5;
use regex::Regex;
use serde::Deserialize;
use sha1::{Digest, Sha1};

use crate::errors::HandshakeError;

/// GUID appended to the client key before hashing.
const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

const SWITCHING_PROTOCOLS: &str = "101 Switching Protocols";
const LEGACY_HANDSHAKE: &str = "101 Web Socket Protocol Handshake";

/// Length of the draft-76 challenge body sent after the request headers.
pub const CHALLENGE_LEN: usize = 8;

/// The protocol revision negotiated for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolRevision {
    Draft75,
    Draft76,
    /// Draft-07, draft-08 or draft-13; `version` is the number the client sent.
    Draft07to13 { version: u8 },
}

impl fmt::Display for ProtocolRevision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolRevision::Draft75 => write!(f, "draft-75"),
            ProtocolRevision::Draft76 => write!(f, "draft-76"),
            ProtocolRevision::Draft07to13 { version } => write!(f, "draft-{version:02}"),
        }
    }
}

/// Compute the `Sec-WebSocket-Accept` value for a client key.
///
/// # Example
///
/// ```
/// use hybi_upgrade::handshake::compute_accept_key;
///
/// let accept = compute_accept_key("dGhlIHNhbXBsZSBub25jZQ==");
/// assert_eq!(accept, "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
/// ```
#[must_use]
pub fn compute_accept_key(client_key: &str) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(client_key.as_bytes());
    sha1.update(WS_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(sha1.finalize())
}

/// The header values negotiation looks at.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandshakeRequest {
    pub connection: Option<String>,
    pub upgrade: Option<String>,
    pub version: Option<String>,
    pub key: Option<String>,
    pub key1: Option<String>,
    pub key2: Option<String>,
    pub origin: Option<String>,
    pub protocol: Option<String>,
    pub host: Option<String>,
    pub forwarded_protocol: Option<String>,
    pub path: String,
    pub server_port: Option<u16>,
    /// The eight draft-76 body bytes, once the caller has read them.
    pub challenge: Option<[u8; CHALLENGE_LEN]>,
}

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
}

impl HandshakeRequest {
    /// Collect the negotiation inputs from a parsed request.
    ///
    /// `server_port` is the local port the request arrived on, if known.
    #[must_use]
    pub fn from_request<B>(request: &Request<B>, server_port: Option<u16>) -> Self {
        let headers = request.headers();
        Self {
            connection: header(headers, "Connection"),
            upgrade: header(headers, "Upgrade"),
            version: header(headers, "Sec-WebSocket-Version"),
            key: header(headers, "Sec-WebSocket-Key"),
            key1: header(headers, "Sec-WebSocket-Key1"),
            key2: header(headers, "Sec-WebSocket-Key2"),
            origin: header(headers, "Origin"),
            protocol: header(headers, "Sec-WebSocket-Protocol"),
            host: header(headers, "Host"),
            forwarded_protocol: header(headers, "X-Forwarded-Protocol"),
            path: request.uri().path().to_owned(),
            server_port,
            challenge: None,
        }
    }

    /// Attach the draft-76 challenge bytes read from the body.
    #[must_use]
    pub fn with_challenge(mut self, challenge: [u8; CHALLENGE_LEN]) -> Self {
        self.challenge = Some(challenge);
        self
    }

    /// Whether the client asked to switch to WebSocket at all.
    #[must_use]
    pub fn is_upgrade_request(&self) -> bool {
        let connection = self
            .connection
            .as_deref()
            .is_some_and(|v| v.to_ascii_lowercase().contains("upgrade"));
        let upgrade = self
            .upgrade
            .as_deref()
            .is_some_and(|v| v.trim().eq_ignore_ascii_case("websocket"));
        connection && upgrade
    }

    /// Pick the revision from the version-indicating headers.
    ///
    /// # Errors
    ///
    /// Returns [`HandshakeError::UnsupportedVersion`] when `Sec-WebSocket-Version` is
    /// not one of 7, 8, 13, 75 or 76.
    pub fn revision(&self) -> Result<ProtocolRevision, HandshakeError> {
        if let Some(raw) = &self.version {
            return match raw.trim().parse::<u8>() {
                Ok(version @ (7 | 8 | 13)) => Ok(ProtocolRevision::Draft07to13 { version }),
                Ok(75) => Ok(ProtocolRevision::Draft75),
                Ok(76) => Ok(ProtocolRevision::Draft76),
                _ => Err(HandshakeError::UnsupportedVersion(raw.trim().to_owned())),
            };
        }
        if self.key1.is_some() || self.key2.is_some() || self.key.is_some() {
            Ok(ProtocolRevision::Draft76)
        } else {
            Ok(ProtocolRevision::Draft75)
        }
    }

    /// Whether negotiation will need the eight challenge bytes from the body.
    ///
    /// # Errors
    ///
    /// Propagates [`HandshakeRequest::revision`] failures.
    pub fn needs_challenge(&self) -> Result<bool, HandshakeError> {
        Ok(self.revision()? == ProtocolRevision::Draft76
            && self.key1.is_some()
            && self.key2.is_some())
    }

    fn location(&self) -> Result<String, HandshakeError> {
        let host = self.host.as_deref().ok_or(HandshakeError::MissingHost)?;
        let secure =
            self.forwarded_protocol.as_deref() == Some("ssl") || self.server_port == Some(443);
        let scheme = if secure { "wss" } else { "ws" };
        Ok(format!("{scheme}://{host}{}", self.path))
    }

    fn origin(&self) -> String {
        self.origin.clone().unwrap_or_default()
    }

    fn sub_protocol(&self) -> String {
        self.protocol.clone().unwrap_or_else(|| "unknown".to_owned())
    }
}

/// The status line, headers and body to send back for an upgrade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeResponse {
    /// Status code and reason phrase, e.g. `101 Switching Protocols`.
    pub status: String,
    /// Headers in wire order, with wire capitalization.
    pub headers: Vec<(String, String)>,
    /// Sent right after the headers; only draft-76 has one.
    pub body: Vec<u8>,
}

impl HandshakeResponse {
    fn new(status: &str, headers: Vec<(&str, String)>) -> Self {
        Self {
            status: status.to_owned(),
            headers: headers
                .into_iter()
                .map(|(name, value)| (name.to_owned(), value))
                .collect(),
            body: Vec::new(),
        }
    }

    /// The plain-text error response for a failed upgrade.
    ///
    /// Returns `None` when the error only means the request should be served as HTTP.
    #[must_use]
    pub fn rejection(error: &HandshakeError) -> Option<Self> {
        let (status, message) = error.rejection()?;
        let status = format!(
            "{} {}",
            status.as_u16(),
            status.canonical_reason().unwrap_or_default()
        );
        let mut response = Self::new(
            &status,
            vec![
                ("Content-Type", "text/plain".to_owned()),
                ("Content-Length", message.len().to_string()),
            ],
        );
        response.body = message.into_bytes();
        Some(response)
    }

    /// The numeric status code.
    #[must_use]
    pub fn status_code(&self) -> Option<StatusCode> {
        self.status
            .split(' ')
            .next()
            .and_then(|code| code.parse::<u16>().ok())
            .and_then(|code| StatusCode::from_u16(code).ok())
    }

    /// Look up a header by exact name.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Serialize the response as it goes on the wire.
    #[must_use]
    pub fn to_bytes(&self, version: Version) -> Vec<u8> {
        use std::fmt::Write as _;
        let mut head = format!("{version:?} {}\r\n", self.status);
        for (name, value) in &self.headers {
            let _ = write!(head, "{name}: {value}\r\n");
        }
        head.push_str("\r\n");
        let mut out = head.into_bytes();
        out.extend_from_slice(&self.body);
        out
    }
}

/// Select the revision and build the upgrade response.
///
/// # Errors
///
/// Returns [`HandshakeError::NotAnUpgradeRequest`] when the request does not ask for an
/// upgrade; every other error is fatal to the upgrade attempt.
pub fn negotiate(
    request: &HandshakeRequest,
) -> Result<(ProtocolRevision, HandshakeResponse), HandshakeError> {
    if !request.is_upgrade_request() {
        return Err(HandshakeError::NotAnUpgradeRequest);
    }

    let revision = request.revision()?;
    let response = match revision {
        ProtocolRevision::Draft07to13 { .. } => {
            let key = request.key.as_deref().ok_or(HandshakeError::MissingKey)?;
            HandshakeResponse::new(
                SWITCHING_PROTOCOLS,
                vec![
                    ("Upgrade", "WebSocket".to_owned()),
                    ("Connection", "Upgrade".to_owned()),
                    ("Sec-WebSocket-Accept", compute_accept_key(key.trim())),
                ],
            )
        }
        ProtocolRevision::Draft75 => HandshakeResponse::new(
            LEGACY_HANDSHAKE,
            vec![
                ("Upgrade", "WebSocket".to_owned()),
                ("Connection", "Upgrade".to_owned()),
                ("WebSocket-Origin", request.origin()),
                ("WebSocket-Protocol", request.sub_protocol()),
                ("WebSocket-Location", request.location()?),
            ],
        ),
        ProtocolRevision::Draft76 => {
            let (Some(key1), Some(key2)) = (request.key1.as_deref(), request.key2.as_deref())
            else {
                return Err(HandshakeError::MissingChallengeKeys);
            };
            let part1 = challenge_key_value(key1)?;
            let part2 = challenge_key_value(key2)?;
            let key3 = request
                .challenge
                .ok_or(HandshakeError::MissingChallengeBody)?;

            let mut response = HandshakeResponse::new(
                LEGACY_HANDSHAKE,
                vec![
                    ("Upgrade", "WebSocket".to_owned()),
                    ("Connection", "Upgrade".to_owned()),
                    ("Sec-WebSocket-Origin", request.origin()),
                    ("Sec-WebSocket-Protocol", request.sub_protocol()),
                    ("Sec-WebSocket-Location", request.location()?),
                ],
            );
            response.body = challenge_response(part1, part2, &key3).to_vec();
            response
        }
    };

    tracing::debug!(%revision, path = %request.path, "negotiated websocket upgrade");
    Ok((revision, response))
}

/// Decode one draft-76 key: its digits divided by its space count.
fn challenge_key_value(key: &str) -> Result<u32, HandshakeError> {
    let malformed = || HandshakeError::MalformedChallengeKey(key.to_owned());

    let digits: String = key.chars().filter(char::is_ascii_digit).collect();
    let number: u64 = digits.parse().map_err(|_| malformed())?;
    let spaces = key.chars().filter(|&c| c == ' ').count() as u64;
    if spaces == 0 || number % spaces != 0 {
        return Err(malformed());
    }
    u32::try_from(number / spaces).map_err(|_| malformed())
}

fn challenge_response(part1: u32, part2: u32, key3: &[u8; CHALLENGE_LEN]) -> [u8; 16] {
    let mut md5 = Md5::new();
    md5.update(part1.to_be_bytes());
    md5.update(part2.to_be_bytes());
    md5.update(key3);
    let mut digest = [0u8; 16];
    digest.copy_from_slice(&md5.finalize());
    digest
}

/// A request-path pattern for access control.
///
/// Patterns are regular expressions matched from the start of the path, but not
/// necessarily to its end: `/chat` allows `/chat` and `/chatroom/1`, while `/chat$`
/// allows only `/chat`.
#[derive(Debug, Clone, Deserialize)]
#[serde(try_from = "String")]
pub struct PathPattern {
    source: String,
    regex: Regex,
}

impl PathPattern {
    /// Compile `pattern`.
    ///
    /// # Errors
    ///
    /// Returns the compile error when `pattern` is not a valid regular expression.
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        let regex = Regex::new(&format!("^(?:{pattern})"))?;
        Ok(Self {
            source: pattern.to_owned(),
            regex,
        })
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.source
    }

    #[must_use]
    pub fn matches(&self, path: &str) -> bool {
        self.regex.is_match(path)
    }
}

impl PartialEq for PathPattern {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl Eq for PathPattern {}

impl TryFrom<String> for PathPattern {
    type Error = regex::Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        PathPattern::new(&value)
    }
}

impl TryFrom<&str> for PathPattern {
    type Error = regex::Error;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        PathPattern::new(value)
    }
}

/// The ordered list of paths that may be upgraded. Empty allows every path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct AllowedPaths(Vec<PathPattern>);

impl AllowedPaths {
    #[must_use]
    pub fn new(patterns: Vec<PathPattern>) -> Self {
        Self(patterns)
    }

    pub fn push(&mut self, pattern: PathPattern) {
        self.0.push(pattern);
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether `path` may be upgraded: any pattern matching is enough.
    #[must_use]
    pub fn permits(&self, path: &str) -> bool {
        self.0.is_empty() || self.0.iter().any(|p| p.matches(path))
    }
}

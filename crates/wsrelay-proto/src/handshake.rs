//! HTTP/1.1 upgrade handshake (RFC 6455 §4.2).
//!
//! Pure functions over request text and response bytes; reading the request
//! head off the socket is the server's job.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use sha1::{Digest, Sha1};

use crate::errors::HandshakeError;

/// Appended to the client key before hashing (RFC 6455 §1.3).
pub const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// The only protocol version this server speaks.
pub const WEBSOCKET_VERSION: &str = "13";

const HEAD_TERMINATOR: &[u8] = b"\r\n\r\n";

/// `Sec-WebSocket-Accept` value for a client's `Sec-WebSocket-Key`.
pub fn accept_key(client_key: &str) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(client_key.trim().as_bytes());
    sha1.update(WEBSOCKET_GUID.as_bytes());
    STANDARD.encode(sha1.finalize())
}

/// Length of the request head including the blank line, once fully buffered.
pub fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(HEAD_TERMINATOR.len())
        .position(|w| w == HEAD_TERMINATOR)
        .map(|pos| pos + HEAD_TERMINATOR.len())
}

/// Request line and headers of an HTTP/1.1 request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: String,
    pub target: String,
    pub version: String,
    headers: Vec<(String, String)>,
}

impl HttpRequest {
    /// Parse a request head. Header names are stored lowercased and values
    /// trimmed; lines without a colon are skipped.
    pub fn parse(head: &str) -> Result<Self, HandshakeError> {
        let mut lines = head.split("\r\n").flat_map(|l| l.split('\n'));

        let request_line = lines
            .next()
            .filter(|l| !l.trim().is_empty())
            .ok_or_else(|| HandshakeError::MalformedRequest("empty request".into()))?;
        let mut parts = request_line.split_whitespace();
        let (Some(method), Some(target), Some(version)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(HandshakeError::MalformedRequest(format!(
                "invalid request line: {request_line}"
            )));
        };
        if !version.starts_with("HTTP/") {
            return Err(HandshakeError::MalformedRequest(format!(
                "invalid HTTP version: {version}"
            )));
        }

        let headers = lines
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| l.split_once(':'))
            .map(|(name, value)| (name.trim().to_ascii_lowercase(), value.trim().to_owned()))
            .collect();

        Ok(Self {
            method: method.to_owned(),
            target: target.to_owned(),
            version: version.to_owned(),
            headers,
        })
    }

    /// First value of a header, looked up case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Whether a comma-separated header contains `token` (case-insensitive).
    pub fn header_has_token(&self, name: &str, token: &str) -> bool {
        self.header(name)
            .is_some_and(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case(token)))
    }
}

/// A request that passed upgrade validation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpgradeRequest {
    pub target: String,
    pub key: String,
}

/// Decide whether `req` is an acceptable websocket upgrade.
///
/// A request without `Upgrade: websocket` and `Connection: upgrade` is an
/// ordinary HTTP request and yields [`HandshakeError::NotUpgrade`].
pub fn validate_upgrade(req: &HttpRequest) -> Result<UpgradeRequest, HandshakeError> {
    if !req.header_has_token("upgrade", "websocket") || !req.header_has_token("connection", "upgrade")
    {
        return Err(HandshakeError::NotUpgrade);
    }
    if !req.method.eq_ignore_ascii_case("GET") {
        return Err(HandshakeError::MethodNotAllowed(req.method.clone()));
    }
    if let Some(version) = req.header("sec-websocket-version") {
        if version != WEBSOCKET_VERSION {
            return Err(HandshakeError::UnsupportedVersion(version.to_owned()));
        }
    }

    let key = req
        .header("sec-websocket-key")
        .filter(|k| !k.is_empty())
        .ok_or(HandshakeError::MissingKey)?;
    match STANDARD.decode(key) {
        Ok(raw) if raw.len() == 16 => {}
        _ => return Err(HandshakeError::InvalidKey),
    }

    Ok(UpgradeRequest {
        target: req.target.clone(),
        key: key.to_owned(),
    })
}

/// `101 Switching Protocols` response for a validated key.
pub fn switching_protocols(client_key: &str) -> String {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\
         \r\n",
        accept_key(client_key)
    )
}

/// Plain-text HTTP response that closes the connection.
pub fn plain_response(status: u16, reason: &str, body: &str, extra_headers: &[(&str, &str)]) -> String {
    let mut response = format!(
        "HTTP/1.1 {status} {reason}\r\n\
         Content-Type: text/plain; charset=utf-8\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n",
        body.len()
    );
    for (name, value) in extra_headers {
        response.push_str(name);
        response.push_str(": ");
        response.push_str(value);
        response.push_str("\r\n");
    }
    response.push_str("\r\n");
    response.push_str(body);
    response
}

/// Response for a request that will not be upgraded.
pub fn rejection_response(err: &HandshakeError) -> String {
    let (status, reason) = err.status();
    match err {
        HandshakeError::NotUpgrade => {
            plain_response(status, reason, "websocket server: send an upgrade request\n", &[])
        }
        HandshakeError::UnsupportedVersion(_) => plain_response(
            status,
            reason,
            &format!("{err}\n"),
            &[("Sec-WebSocket-Version", WEBSOCKET_VERSION)],
        ),
        _ => plain_response(status, reason, &format!("{err}\n"), &[]),
    }
}

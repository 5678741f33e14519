//! Reading the HTTP upgrade request off the socket and answering it.

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;
use wsrelay_proto::handshake::{self, HttpRequest, UpgradeRequest};
use wsrelay_proto::HandshakeError;

use crate::errors::SessionError;

/// Result of reading and answering the request head.
#[derive(Debug)]
pub enum HandshakeOutcome {
    /// `101` was written. `leftover` holds bytes read past the head; they are
    /// the start of the first frame.
    Upgraded {
        request: UpgradeRequest,
        leftover: BytesMut,
    },
    /// A plain HTTP response was written and the stream shut down.
    Rejected(HandshakeError),
}

/// Read the request head (at most `max_head` bytes), validate it and write
/// either `101 Switching Protocols` or a rejection.
///
/// `at_capacity` is consulted only for valid upgrade requests.
pub async fn accept_upgrade<S>(
    stream: &mut S,
    max_head: usize,
    at_capacity: impl FnOnce() -> bool,
) -> Result<HandshakeOutcome, SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(1024);
    let head_len = loop {
        if let Some(end) = handshake::find_head_end(&buf) {
            break end;
        }
        if buf.len() >= max_head {
            return reject(stream, HandshakeError::HeadTooLarge(max_head)).await;
        }
        if stream.read_buf(&mut buf).await? == 0 {
            return Err(SessionError::PeerClosed);
        }
    };
    if head_len > max_head {
        return reject(stream, HandshakeError::HeadTooLarge(max_head)).await;
    }

    let head = buf.split_to(head_len);
    let Ok(text) = std::str::from_utf8(&head) else {
        return reject(stream, HandshakeError::MalformedRequest("head is not UTF-8".into())).await;
    };
    let request = match HttpRequest::parse(text).and_then(|req| handshake::validate_upgrade(&req)) {
        Ok(request) => request,
        Err(e) => return reject(stream, e).await,
    };
    if at_capacity() {
        return reject(stream, HandshakeError::AtCapacity).await;
    }

    stream
        .write_all(handshake::switching_protocols(&request.key).as_bytes())
        .await?;
    stream.flush().await?;
    debug!(target_path = %request.target, leftover = buf.len(), "upgrade accepted");

    Ok(HandshakeOutcome::Upgraded {
        request,
        leftover: buf,
    })
}

async fn reject<S>(stream: &mut S, err: HandshakeError) -> Result<HandshakeOutcome, SessionError>
where
    S: AsyncWrite + Unpin,
{
    let (status, _) = err.status();
    debug!(status, kind = err.error_kind(), "rejecting request");
    stream
        .write_all(handshake::rejection_response(&err).as_bytes())
        .await?;
    stream.flush().await?;
    stream.shutdown().await?;
    Ok(HandshakeOutcome::Rejected(err))
}

//! Shared helpers for unit tests.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, DuplexStream};
use tokio_util::sync::CancellationToken;
use wsrelay_proto::frame::{self, Decoded, Frame};
use wsrelay_proto::SessionId;

use crate::websocket::handle::{SendLimits, SessionHandle};

/// Writer whose every write fails like a vanished peer.
pub(crate) struct FailingWriter;

impl AsyncWrite for FailingWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "peer gone")))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// An Open session writing into an in-memory pipe; the returned stream reads
/// what the server sent.
pub(crate) fn open_handle() -> (Arc<SessionHandle>, DuplexStream) {
    piped_handle(64 * 1024, SendLimits::default())
}

/// An Open session over a pipe of `capacity` bytes. A peer that never reads
/// the returned stream stalls the writer once the pipe is full.
pub(crate) fn piped_handle(
    capacity: usize,
    limits: SendLimits,
) -> (Arc<SessionHandle>, DuplexStream) {
    let (client, server) = tokio::io::duplex(capacity);
    let handle = SessionHandle::new(
        SessionId::new(),
        None,
        Box::new(server),
        CancellationToken::new(),
        limits,
    );
    let _ = handle.mark_open();
    (Arc::new(handle), client)
}

/// An Open session whose writes always fail. The first failed write cancels
/// it and later sends report [`crate::SendError::Closed`].
pub(crate) fn failing_handle() -> Arc<SessionHandle> {
    let handle = SessionHandle::new(
        SessionId::new(),
        None,
        Box::new(FailingWriter),
        CancellationToken::new(),
        SendLimits::default(),
    );
    let _ = handle.mark_open();
    Arc::new(handle)
}

/// Read exactly one frame from `reader`. Panics on EOF.
pub(crate) async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Frame {
    let mut buf = BytesMut::new();
    loop {
        if let Decoded::Frame { frame, consumed } = frame::decode(&buf).expect("valid frame") {
            assert_eq!(consumed, buf.len(), "read_frame got more than one frame");
            return frame;
        }
        // One byte at a time so no bytes of the next frame are swallowed.
        let byte = reader.read_u8().await.expect("frame before EOF");
        buf.extend_from_slice(&[byte]);
    }
}

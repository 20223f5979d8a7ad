//! Reader that keeps a copy of every byte it yields.

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use tokio::io::{AsyncRead, ReadBuf};

/// Wraps a reader; whatever the consumer reads is appended to an in-memory
/// buffer. The buffer is the record of how many bytes left the source.
pub struct TeeReader<R> {
    inner: R,
    captured: Vec<u8>,
}

impl<R> TeeReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            captured: Vec::new(),
        }
    }

    pub fn captured(&self) -> &[u8] {
        &self.captured
    }

    pub fn bytes_read(&self) -> u64 {
        self.captured.len() as u64
    }

    pub fn into_captured(self) -> Vec<u8> {
        self.captured
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for TeeReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
        this.captured.extend_from_slice(&buf.filled()[before..]);
        Poll::Ready(Ok(()))
    }
}

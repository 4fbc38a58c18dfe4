use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

/// Longest identification line allowed by RFC 4253, CR LF included.
const MAX_ID_LINE: usize = 255;
/// Stop looking for the identification line after this many bytes.
const MAX_SCANNED: usize = 8 * 1024;

/// The identification string a client sent, once it has been seen.
#[derive(Debug, Clone, Default)]
pub struct ClientVersion(Arc<OnceLock<String>>);

impl ClientVersion {
    pub fn get(&self) -> Option<&str> {
        self.0.get().map(String::as_str)
    }

    /// The identification string, or an empty string if none was read yet.
    pub fn to_string_lossy(&self) -> String {
        self.get().unwrap_or_default().to_string()
    }
}

/// Transparent wrapper around a socket that remembers the first
/// `SSH-` line the peer sends.
///
/// Once `close` is cancelled the stream reads as end-of-file and
/// refuses writes, whatever the peer is doing.
pub struct ClientIdStream<S> {
    inner: S,
    version: ClientVersion,
    line: Vec<u8>,
    scanned: usize,
    close: CancellationToken,
    closed: Pin<Box<WaitForCancellationFutureOwned>>,
}

impl<S> ClientIdStream<S> {
    pub fn new(inner: S, close: CancellationToken) -> (Self, ClientVersion) {
        let version = ClientVersion::default();
        (
            ClientIdStream {
                inner,
                version: version.clone(),
                line: Vec::new(),
                scanned: 0,
                closed: Box::pin(close.clone().cancelled_owned()),
                close,
            },
            version,
        )
    }

    fn done(&self) -> bool {
        self.scanned >= MAX_SCANNED || self.version.get().is_some()
    }

    fn scan(&mut self, bytes: &[u8]) {
        for &b in bytes {
            if self.done() {
                return;
            }
            self.scanned += 1;
            if b == b'\n' {
                let line = std::mem::take(&mut self.line);
                if line.starts_with(b"SSH-") {
                    let id = String::from_utf8_lossy(&line);
                    let _ = self.version.0.set(id.trim_end_matches('\r').to_string());
                }
            } else if self.line.len() < MAX_ID_LINE {
                self.line.push(b);
            }
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for ClientIdStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.closed.as_mut().poll(cx).is_ready() {
            return Poll::Ready(Ok(()));
        }
        let before = buf.filled().len();
        let result = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = result {
            if let Some(fresh) = buf.filled().get(before..) {
                self.scan(fresh);
            }
        }
        result
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for ClientIdStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, io::Error>> {
        if self.close.is_cancelled() {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), io::Error>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

//! Byte-stream capability shared by every transport, plus the relay's
//! connection wrapper.

use bytes::{Buf, BytesMut};
use std::fmt;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

/// Any full-duplex byte stream the broker can relay.
///
/// Read and write map to `poll_read`/`poll_write`; close is `poll_shutdown`
/// followed by drop. Raw TCP sockets satisfy this directly, WebSocket
/// connections through [`WsStream`](crate::ws::WsStream).
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Boxed transport used wherever the concrete kind no longer matters.
pub type BoxedTransport = Box<dyn Transport>;

/// Which adapter a connection arrived through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Raw TCP socket.
    Tcp,
    /// WebSocket message stream viewed as bytes.
    WebSocket,
    /// In-process stream, used by tests and embedders.
    Memory,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => f.write_str("tcp"),
            Self::WebSocket => f.write_str("ws"),
            Self::Memory => f.write_str("memory"),
        }
    }
}

/// Peer information for relay connections.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    /// Remote socket address, when the transport has one.
    pub addr: Option<SocketAddr>,
    /// Adapter the connection came through.
    pub kind: TransportKind,
    /// When the connection was established.
    pub established_at: Instant,
}

impl PeerInfo {
    /// Peer info stamped with the current instant.
    pub fn new(addr: Option<SocketAddr>, kind: TransportKind) -> Self {
        Self {
            addr,
            kind,
            established_at: Instant::now(),
        }
    }
}

impl fmt::Display for PeerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.addr {
            Some(addr) => write!(f, "{}://{}", self.kind, addr),
            None => write!(f, "{}://local", self.kind),
        }
    }
}

/// A transport plus the bytes already pulled off it but not yet consumed.
///
/// Control-line parsing and the provider keep-alive loop both read ahead of
/// the payload. Whatever they read beyond what they needed is pushed back
/// here and served first by [`AsyncRead`], so the relay never drops payload.
pub struct RelayStream {
    transport: BoxedTransport,
    peer: PeerInfo,
    pending: BytesMut,
}

impl Unpin for RelayStream {}

impl RelayStream {
    /// Wrap a transport.
    pub fn new<T: Transport>(transport: T, peer: PeerInfo) -> Self {
        Self {
            transport: Box::new(transport),
            peer,
            pending: BytesMut::new(),
        }
    }

    /// Peer information captured at accept/connect time.
    pub fn peer(&self) -> &PeerInfo {
        &self.peer
    }

    /// Number of pushed-back bytes waiting to be read.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Return bytes to the front of the read side.
    pub fn unread(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        let mut joined = BytesMut::with_capacity(bytes.len() + self.pending.len());
        joined.extend_from_slice(bytes);
        joined.extend_from_slice(&self.pending);
        self.pending = joined;
    }

    /// Read from the underlying transport into the pending buffer.
    ///
    /// Returns the number of bytes appended; `0` means the peer closed.
    /// Cancel safe: dropping the future before completion loses no data.
    pub async fn fill_pending(&mut self, max: usize) -> std::io::Result<usize> {
        self.pending.reserve(max);
        let mut limited = (&mut self.transport).take(max as u64);
        limited.read_buf(&mut self.pending).await
    }
}

impl fmt::Debug for RelayStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayStream")
            .field("peer", &self.peer)
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

impl AsyncRead for RelayStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        if !this.pending.is_empty() {
            let n = this.pending.len().min(buf.remaining());
            buf.put_slice(&this.pending[..n]);
            this.pending.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.transport).poll_read(cx, buf)
    }
}

impl AsyncWrite for RelayStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.get_mut().transport).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().transport).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().transport).poll_shutdown(cx)
    }
}

//! AsyncRead/AsyncWrite wrapper for WebSocket message streams.

use bytes::{Buf, Bytes};
use futures_util::{Sink, Stream};
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::trace;

use crate::error::{Error, Result};
use crate::stream::{PeerInfo, RelayStream, TransportKind};

// Helper function to convert a WebSocket error to an IO error
fn error_to_io(e: WsError, kind: std::io::ErrorKind) -> std::io::Error {
    match e {
        WsError::Io(io) => io,
        other => std::io::Error::new(kind, other),
    }
}

fn is_closed(e: &WsError) -> bool {
    matches!(e, WsError::ConnectionClosed | WsError::AlreadyClosed)
}

/// Byte-stream view of a WebSocket connection.
///
/// Incoming binary and text messages are concatenated in arrival order; a
/// Close frame or the end of the message stream reads as EOF. Every write is
/// sent as one binary message. Ping and pong frames are answered by the
/// WebSocket layer and never surface as bytes.
#[derive(Debug)]
pub struct WsStream<S> {
    inner: WebSocketStream<S>,
    read_buf: Bytes,
    read_closed: bool,
}

impl<S> WsStream<S> {
    /// Wrap an established WebSocket.
    pub fn new(inner: WebSocketStream<S>) -> Self {
        Self {
            inner,
            read_buf: Bytes::new(),
            read_closed: false,
        }
    }
}

impl<S> AsyncRead for WsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.read_buf.is_empty() {
                let n = this.read_buf.len().min(buf.remaining());
                buf.put_slice(&this.read_buf[..n]);
                this.read_buf.advance(n);
                return Poll::Ready(Ok(()));
            }
            if this.read_closed {
                return Poll::Ready(Ok(()));
            }

            match ready!(Pin::new(&mut this.inner).poll_next(cx)) {
                Some(Ok(Message::Binary(data))) => this.read_buf = data,
                Some(Ok(Message::Text(text))) => {
                    this.read_buf = Bytes::copy_from_slice(text.as_bytes())
                }
                Some(Ok(Message::Close(frame))) => {
                    trace!(?frame, "websocket close frame");
                    this.read_closed = true;
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
                Some(Err(e)) if is_closed(&e) => this.read_closed = true,
                Some(Err(e)) => {
                    return Poll::Ready(Err(error_to_io(e, std::io::ErrorKind::UnexpectedEof)))
                }
                None => this.read_closed = true,
            }
        }
    }
}

impl<S> AsyncWrite for WsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        ready!(Pin::new(&mut this.inner).poll_ready(cx))
            .map_err(|e| error_to_io(e, std::io::ErrorKind::BrokenPipe))?;
        Pin::new(&mut this.inner)
            .start_send(Message::binary(Bytes::copy_from_slice(buf)))
            .map_err(|e| error_to_io(e, std::io::ErrorKind::BrokenPipe))?;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match ready!(Pin::new(&mut self.get_mut().inner).poll_flush(cx)) {
            Ok(()) => Poll::Ready(Ok(())),
            Err(e) => Poll::Ready(Err(error_to_io(e, std::io::ErrorKind::BrokenPipe))),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match ready!(Pin::new(&mut self.get_mut().inner).poll_close(cx)) {
            Ok(()) => Poll::Ready(Ok(())),
            Err(e) if is_closed(&e) => Poll::Ready(Ok(())),
            Err(e) => Poll::Ready(Err(error_to_io(e, std::io::ErrorKind::BrokenPipe))),
        }
    }
}

/// Complete the server side of the upgrade handshake on an accepted socket.
pub async fn accept(socket: TcpStream, addr: SocketAddr) -> Result<RelayStream> {
    let ws = tokio_tungstenite::accept_async(socket).await?;
    Ok(RelayStream::new(
        WsStream::new(ws),
        PeerInfo::new(Some(addr), TransportKind::WebSocket),
    ))
}

/// Dial a `ws://` URL and return the connection as a relay stream.
pub async fn connect(url: &str) -> Result<RelayStream> {
    let (ws, _response) = tokio_tungstenite::connect_async(url)
        .await
        .map_err(|e| match e {
            WsError::Io(io) => Error::connect(url, io),
            other => Error::WebSocket(other),
        })?;
    let addr = match ws.get_ref() {
        tokio_tungstenite::MaybeTlsStream::Plain(tcp) => tcp.peer_addr().ok(),
        _ => None,
    };
    Ok(RelayStream::new(
        WsStream::new(ws),
        PeerInfo::new(addr, TransportKind::WebSocket),
    ))
}

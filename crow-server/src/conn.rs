//! Framed duplex transport to the client.
//!
//! [`Conn`] is the narrow interface the session works against; [`WsConn`]
//! implements it over an axum WebSocket. Close is at-most-once via an atomic
//! CAS, writes are serialized by an internal lock, and both directions carry
//! deadlines so a stuck peer cannot pin the session forever.

use crate::error::{ConnError, ConnResult};
use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::timeout;

/// Idle read deadline.
pub const READ_DEADLINE: Duration = Duration::from_secs(60);
/// Write deadline.
pub const WRITE_DEADLINE: Duration = Duration::from_secs(30);
/// Deadline for the close frame on shutdown.
const CLOSE_DEADLINE: Duration = Duration::from_secs(5);

/// Kind of a client frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// JSON control/chat frame.
    Text,
    /// Raw audio frame.
    Binary,
}

/// Duplex frame transport.
#[async_trait]
pub trait Conn: Send + Sync {
    /// Read the next frame. Blocks up to the idle read deadline.
    async fn read_frame(&self) -> ConnResult<(FrameKind, Vec<u8>)>;

    /// Write one frame. Concurrent writers are serialized.
    async fn write_frame(&self, kind: FrameKind, data: Vec<u8>) -> ConnResult<()>;

    /// Close the connection. Idempotent; only the first caller performs the
    /// underlying close.
    async fn close(&self);

    /// Whether the connection is closed.
    fn is_closed(&self) -> bool;
}

/// [`Conn`] over a WebSocket.
///
/// Generic over the socket so tests can drive it with an in-memory stream;
/// production uses [`axum::extract::ws::WebSocket`].
pub struct WsConn<S = WebSocket> {
    writer: Mutex<SplitSink<S, Message>>,
    reader: Mutex<SplitStream<S>>,
    closed: AtomicBool,
}

impl<S> WsConn<S>
where
    S: Stream<Item = Result<Message, axum::Error>>
        + Sink<Message, Error = axum::Error>
        + Send
        + Unpin
        + 'static,
{
    /// Wrap an upgraded socket.
    #[must_use]
    pub fn new(socket: S) -> Self {
        let (writer, reader) = socket.split();
        Self {
            writer: Mutex::new(writer),
            reader: Mutex::new(reader),
            closed: AtomicBool::new(false),
        }
    }

    fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl<S> Conn for WsConn<S>
where
    S: Stream<Item = Result<Message, axum::Error>>
        + Sink<Message, Error = axum::Error>
        + Send
        + Unpin
        + 'static,
{
    async fn read_frame(&self) -> ConnResult<(FrameKind, Vec<u8>)> {
        if self.is_closed() {
            return Err(ConnError::Closed);
        }

        let mut reader = self.reader.lock().await;
        loop {
            let next = timeout(READ_DEADLINE, reader.next()).await;
            match next {
                Ok(Some(Ok(Message::Text(text)))) => {
                    return Ok((FrameKind::Text, text.as_bytes().to_vec()));
                }
                Ok(Some(Ok(Message::Binary(data)))) => {
                    return Ok((FrameKind::Binary, data.to_vec()));
                }
                // Keepalives are transport noise, not frames.
                Ok(Some(Ok(Message::Ping(_) | Message::Pong(_)))) => continue,
                Ok(Some(Ok(Message::Close(_)))) | Ok(None) => {
                    self.mark_closed();
                    return Err(ConnError::Closed);
                }
                Ok(Some(Err(_))) => {
                    self.mark_closed();
                    return Err(ConnError::Closed);
                }
                Err(_) => {
                    self.mark_closed();
                    return Err(ConnError::Timeout);
                }
            }
        }
    }

    async fn write_frame(&self, kind: FrameKind, data: Vec<u8>) -> ConnResult<()> {
        if self.is_closed() {
            return Err(ConnError::Closed);
        }

        let mut writer = self.writer.lock().await;
        // The connection may have closed while waiting for the lock.
        if self.is_closed() {
            return Err(ConnError::Closed);
        }

        let message = match kind {
            FrameKind::Text => Message::Text(
                String::from_utf8(data)
                    .map_err(|e| ConnError::Transport(e.to_string()))?
                    .into(),
            ),
            FrameKind::Binary => Message::Binary(data.into()),
        };

        match timeout(WRITE_DEADLINE, writer.send(message)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => {
                self.mark_closed();
                Err(ConnError::Closed)
            }
            Err(_) => {
                self.mark_closed();
                Err(ConnError::Timeout)
            }
        }
    }

    async fn close(&self) {
        // At-most-once: the loser of the CAS returns immediately.
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut writer = self.writer.lock().await;
        let _ = timeout(CLOSE_DEADLINE, writer.send(Message::Close(None))).await;
        let _ = writer.flush().await;
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::task::{Context, Poll};

    /// In-memory socket: pops inbound messages from a queue, counts close
    /// frames on the sink side.
    struct FakeSocket {
        inbound: std::collections::VecDeque<Message>,
        close_frames: Arc<AtomicUsize>,
    }

    impl Stream for FakeSocket {
        type Item = Result<Message, axum::Error>;

        fn poll_next(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
            Poll::Ready(self.inbound.pop_front().map(Ok))
        }
    }

    impl Sink<Message> for FakeSocket {
        type Error = axum::Error;

        fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn start_send(self: Pin<&mut Self>, item: Message) -> Result<(), Self::Error> {
            if matches!(item, Message::Close(_)) {
                self.close_frames.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }
    }

    fn conn_with(messages: Vec<Message>) -> (Arc<WsConn<FakeSocket>>, Arc<AtomicUsize>) {
        let close_frames = Arc::new(AtomicUsize::new(0));
        let socket = FakeSocket {
            inbound: messages.into(),
            close_frames: close_frames.clone(),
        };
        (Arc::new(WsConn::new(socket)), close_frames)
    }

    #[tokio::test]
    async fn test_read_text_and_binary() {
        let (conn, _) = conn_with(vec![
            Message::Text("{\"type\":\"abort\"}".into()),
            Message::Ping(vec![].into()),
            Message::Binary(vec![1, 2, 3].into()),
        ]);

        let (kind, data) = conn.read_frame().await.unwrap();
        assert_eq!(kind, FrameKind::Text);
        assert_eq!(data, b"{\"type\":\"abort\"}");

        // The ping is skipped.
        let (kind, data) = conn.read_frame().await.unwrap();
        assert_eq!(kind, FrameKind::Binary);
        assert_eq!(data, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_stream_end_closes() {
        let (conn, _) = conn_with(vec![]);
        assert!(matches!(conn.read_frame().await, Err(ConnError::Closed)));
        assert!(conn.is_closed());
        // Reads and writes after close return the stable closed error.
        assert!(matches!(conn.read_frame().await, Err(ConnError::Closed)));
        assert!(matches!(
            conn.write_frame(FrameKind::Text, b"{}".to_vec()).await,
            Err(ConnError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_close_once_under_concurrency() {
        let (conn, close_frames) = conn_with(vec![]);

        let mut handles = Vec::new();
        for _ in 0..32 {
            let conn = conn.clone();
            handles.push(tokio::spawn(async move { conn.close().await }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(close_frames.load(Ordering::SeqCst), 1);
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn test_close_then_close_is_noop() {
        let (conn, close_frames) = conn_with(vec![]);
        conn.close().await;
        conn.close().await;
        assert_eq!(close_frames.load(Ordering::SeqCst), 1);
    }
}

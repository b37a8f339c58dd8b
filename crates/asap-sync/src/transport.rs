//! Transport abstraction for the sync protocol.
//!
//! A [`Connection`] is one bidirectional PDU stream between two peers. Each
//! side signals the end of its sending half with [`Connection::finish`]; the
//! other side then reads `None`.

use async_trait::async_trait;

use crate::error::SyncError;
use crate::messages::Pdu;

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, SyncError>;

/// A bidirectional PDU stream to one peer.
///
/// Implementations must be thread-safe (Send + Sync). Sending and receiving
/// may run concurrently from two tasks.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Send one PDU.
    async fn send(&self, pdu: Pdu) -> Result<()>;

    /// Receive the next PDU.
    ///
    /// Returns `None` once the peer has finished sending.
    async fn recv(&self) -> Result<Option<Pdu>>;

    /// Close the sending half. Further sends fail.
    async fn finish(&self) -> Result<()>;
}

/// In-memory connections for testing.
///
/// Uses channels to simulate a byte-free PDU pipe between two peers.
pub mod memory {
    use super::*;
    use tokio::sync::{mpsc, Mutex};

    /// Default buffered PDUs per direction.
    pub const DEFAULT_CAPACITY: usize = 1024;

    /// One end of an in-memory connection.
    pub struct MemoryConnection {
        sender: Mutex<Option<mpsc::Sender<Pdu>>>,
        receiver: Mutex<mpsc::Receiver<Pdu>>,
    }

    /// Create two connected ends.
    pub fn pair() -> (MemoryConnection, MemoryConnection) {
        pair_with_capacity(DEFAULT_CAPACITY)
    }

    /// Create two connected ends with a bounded buffer per direction.
    pub fn pair_with_capacity(capacity: usize) -> (MemoryConnection, MemoryConnection) {
        let (a_tx, a_rx) = mpsc::channel(capacity);
        let (b_tx, b_rx) = mpsc::channel(capacity);
        (
            MemoryConnection {
                sender: Mutex::new(Some(a_tx)),
                receiver: Mutex::new(b_rx),
            },
            MemoryConnection {
                sender: Mutex::new(Some(b_tx)),
                receiver: Mutex::new(a_rx),
            },
        )
    }

    #[async_trait]
    impl Connection for MemoryConnection {
        async fn send(&self, pdu: Pdu) -> Result<()> {
            let sender = self.sender.lock().await.clone();
            match sender {
                Some(sender) => sender
                    .send(pdu)
                    .await
                    .map_err(|_| SyncError::Transport("peer disconnected".into())),
                None => Err(SyncError::Transport("connection finished".into())),
            }
        }

        async fn recv(&self) -> Result<Option<Pdu>> {
            Ok(self.receiver.lock().await.recv().await)
        }

        async fn finish(&self) -> Result<()> {
            self.sender.lock().await.take();
            Ok(())
        }
    }
}

/// Framed byte-stream connections.
///
/// Each PDU travels as a 4-byte big-endian length followed by its CBOR
/// encoding. End of stream at a frame boundary means the peer finished.
pub mod stream {
    use super::*;
    use std::io;
    use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
    use tokio::sync::Mutex;

    /// Largest accepted frame.
    pub const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

    /// A [`Connection`] over any async reader/writer pair.
    pub struct StreamConnection<R, W> {
        reader: Mutex<R>,
        writer: Mutex<Option<W>>,
    }

    impl<R, W> StreamConnection<R, W>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        pub fn new(reader: R, writer: W) -> Self {
            Self {
                reader: Mutex::new(reader),
                writer: Mutex::new(Some(writer)),
            }
        }
    }

    fn transport(e: io::Error) -> SyncError {
        SyncError::Transport(e.to_string())
    }

    #[async_trait]
    impl<R, W> Connection for StreamConnection<R, W>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        async fn send(&self, pdu: Pdu) -> Result<()> {
            let mut frame = Vec::new();
            ciborium::into_writer(&pdu, &mut frame)
                .map_err(|e| SyncError::Transport(format!("encode {}: {e}", pdu.kind())))?;
            let len = u32::try_from(frame.len())
                .ok()
                .filter(|len| *len <= MAX_FRAME_LEN)
                .ok_or_else(|| {
                    SyncError::Transport(format!("frame of {} bytes too large", frame.len()))
                })?;

            let mut guard = self.writer.lock().await;
            let writer = guard
                .as_mut()
                .ok_or_else(|| SyncError::Transport("connection finished".into()))?;
            writer.write_u32(len).await.map_err(transport)?;
            writer.write_all(&frame).await.map_err(transport)?;
            writer.flush().await.map_err(transport)
        }

        async fn recv(&self) -> Result<Option<Pdu>> {
            let mut reader = self.reader.lock().await;
            let len = match reader.read_u32().await {
                Ok(len) => len,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
                Err(e) => return Err(transport(e)),
            };
            if len > MAX_FRAME_LEN {
                return Err(SyncError::Protocol(format!(
                    "frame of {len} bytes exceeds limit"
                )));
            }
            let mut frame = vec![0u8; len as usize];
            reader.read_exact(&mut frame).await.map_err(transport)?;
            let pdu = ciborium::from_reader(frame.as_slice())
                .map_err(|e| SyncError::Protocol(format!("undecodable frame: {e}")))?;
            Ok(Some(pdu))
        }

        async fn finish(&self) -> Result<()> {
            if let Some(mut writer) = self.writer.lock().await.take() {
                writer.shutdown().await.map_err(transport)?;
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::memory;
    use super::stream::StreamConnection;
    use super::*;
    use crate::messages::InterestPdu;
    use asap_core::PeerId;

    fn interest(name: &str) -> Pdu {
        Pdu::Interest(InterestPdu {
            peer: PeerId::from(name),
            format: Some("chat".into()),
        })
    }

    #[tokio::test]
    async fn test_memory_pair() {
        let (a, b) = memory::pair();
        a.send(interest("alice")).await.unwrap();
        b.send(interest("bob")).await.unwrap();

        assert_eq!(b.recv().await.unwrap(), Some(interest("alice")));
        assert_eq!(a.recv().await.unwrap(), Some(interest("bob")));

        a.finish().await.unwrap();
        assert_eq!(b.recv().await.unwrap(), None);
        assert!(a.send(interest("alice")).await.is_err());
    }

    #[tokio::test]
    async fn test_stream_connection() {
        let (left, right) = tokio::io::duplex(1024);
        let (lr, lw) = tokio::io::split(left);
        let (rr, rw) = tokio::io::split(right);
        let a = StreamConnection::new(lr, lw);
        let b = StreamConnection::new(rr, rw);

        a.send(interest("alice")).await.unwrap();
        a.send(interest("carol")).await.unwrap();
        a.finish().await.unwrap();

        assert_eq!(b.recv().await.unwrap(), Some(interest("alice")));
        assert_eq!(b.recv().await.unwrap(), Some(interest("carol")));
        assert_eq!(b.recv().await.unwrap(), None);

        b.send(interest("bob")).await.unwrap();
        assert_eq!(a.recv().await.unwrap(), Some(interest("bob")));
    }

    #[tokio::test]
    async fn test_stream_rejects_garbage_frame() {
        use tokio::io::AsyncWriteExt;

        let (left, right) = tokio::io::duplex(1024);
        let (_lr, mut lw) = tokio::io::split(left);
        let (rr, rw) = tokio::io::split(right);
        let b = StreamConnection::new(rr, rw);

        lw.write_u32(3).await.unwrap();
        lw.write_all(&[0xff, 0xff, 0xff]).await.unwrap();

        assert!(matches!(b.recv().await, Err(SyncError::Protocol(_))));
    }
}

//! # Channels
//!
//! A minimal interface for moving messages, with their handles, between two
//! endpoints.
//!
//! ## Philosophy
//!
//! - **Message-Oriented**: A channel moves whole `MessageBuf`s. It knows
//!   nothing about headers, ordinals, or schemas.
//! - **Non-Blocking Writes**: `write` either queues the message or fails
//!   immediately. Only `read` waits.
//! - **Ownership**: A message passed to `write` is owned by the channel from
//!   then on. If the write fails, the message and its handles are dropped.
//!
//! ## Invariants
//!
//! - Delivery is FIFO per direction.
//! - After one endpoint closes, the other drains what was already queued
//!   and then reads `PeerClosed`.
//! - `read` is cancel safe: dropping the future never loses a message.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use tiderpc::MessageBuf;
use tokio::sync::mpsc;
use tokio::sync::watch;

/// Largest message, in bytes, a channel accepts.
pub const MAX_MESSAGE_BYTES: usize = 65536;
/// Most handles a single message may carry.
pub const MAX_MESSAGE_HANDLES: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The other endpoint is closed.
    PeerClosed,
    /// No message is available right now.
    WouldBlock,
    /// This endpoint has been closed locally.
    Closed,
    /// The message exceeds the channel's limits.
    MessageTooLarge { bytes: usize, handles: usize },
    /// Generic I/O error or internal transport failure.
    Io(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PeerClosed => write!(f, "Peer closed"),
            Self::WouldBlock => write!(f, "Would block"),
            Self::Closed => write!(f, "Channel closed"),
            Self::MessageTooLarge { bytes, handles } => {
                write!(f, "Message too large: {} bytes, {} handles", bytes, handles)
            }
            Self::Io(msg) => write!(f, "I/O error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// One endpoint of a bidirectional message channel.
///
/// This trait is object-safe (`Arc<dyn Channel>`).
#[async_trait::async_trait]
pub trait Channel: Send + Sync + 'static {
    /// Queues a message for the peer without waiting.
    fn write(&self, message: MessageBuf) -> Result<()>;

    /// Returns the next message if one is queued, or `WouldBlock`.
    fn try_read(&self) -> Result<MessageBuf>;

    /// Waits for the next message. Cancel safe.
    async fn read(&self) -> Result<MessageBuf>;

    /// Closes this endpoint. Pending and future reads return `Closed`;
    /// the peer sees `PeerClosed` once it has drained its queue.
    fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Closed flags for both ends of a `MemoryChannel` pair.
struct PairState {
    closed: [AtomicBool; 2],
}

/// An in-process channel built on tokio mpsc queues.
///
/// Messages written on one endpoint of a `pair()` are read on the other.
pub struct MemoryChannel {
    side: usize,
    state: Arc<PairState>,
    tx: Mutex<Option<mpsc::UnboundedSender<MessageBuf>>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<MessageBuf>>,
    closed: watch::Sender<bool>,
}

impl MemoryChannel {
    /// Creates a pair of endpoints connected to each other.
    pub fn pair() -> (Self, Self) {
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();
        let state = Arc::new(PairState { closed: [AtomicBool::new(false), AtomicBool::new(false)] });

        let a = Self::endpoint(0, Arc::clone(&state), tx_a, rx_b);
        let b = Self::endpoint(1, state, tx_b, rx_a);
        (a, b)
    }

    fn endpoint(
        side: usize,
        state: Arc<PairState>,
        tx: mpsc::UnboundedSender<MessageBuf>,
        rx: mpsc::UnboundedReceiver<MessageBuf>,
    ) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            side,
            state,
            tx: Mutex::new(Some(tx)),
            rx: tokio::sync::Mutex::new(rx),
            closed,
        }
    }

    fn peer_closed(&self) -> bool {
        self.state.closed[1 - self.side].load(Ordering::Acquire)
    }
}

#[async_trait::async_trait]
impl Channel for MemoryChannel {
    fn write(&self, message: MessageBuf) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        if message.bytes.len() > MAX_MESSAGE_BYTES || message.handles.len() > MAX_MESSAGE_HANDLES {
            return Err(Error::MessageTooLarge { bytes: message.bytes.len(), handles: message.handles.len() });
        }
        if self.peer_closed() {
            return Err(Error::PeerClosed);
        }
        let tx = self.tx.lock().map_err(|_| Error::Io("sender lock poisoned".into()))?;
        match tx.as_ref() {
            Some(tx) => tx.send(message).map_err(|_| Error::PeerClosed),
            None => Err(Error::Closed),
        }
    }

    fn try_read(&self) -> Result<MessageBuf> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        let mut rx = self.rx.try_lock().map_err(|_| Error::WouldBlock)?;
        match rx.try_recv() {
            Ok(message) => Ok(message),
            Err(mpsc::error::TryRecvError::Empty) => Err(Error::WouldBlock),
            Err(mpsc::error::TryRecvError::Disconnected) => Err(Error::PeerClosed),
        }
    }

    async fn read(&self) -> Result<MessageBuf> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow() {
            return Err(Error::Closed);
        }
        let mut rx = self.rx.lock().await;
        tokio::select! {
            message = rx.recv() => message.ok_or(Error::PeerClosed),
            _ = closed.wait_for(|closed| *closed) => Err(Error::Closed),
        }
    }

    fn close(&self) {
        if self.state.closed[self.side].swap(true, Ordering::AcqRel) {
            return;
        }
        // Dropping the sender lets the peer drain and then see PeerClosed.
        if let Ok(mut tx) = self.tx.lock() {
            tx.take();
        }
        self.closed.send_replace(true);
        // Close whatever was queued for us; a concurrent reader drops the rest with the channel.
        if let Ok(mut rx) = self.rx.try_lock() {
            rx.close();
            while rx.try_recv().is_ok() {}
        }
    }

    fn is_closed(&self) -> bool {
        self.state.closed[self.side].load(Ordering::Acquire)
    }
}

impl Drop for MemoryChannel {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidepack::HandleTable;

    fn message(bytes: &[u8]) -> MessageBuf {
        MessageBuf::new(bytes.to_vec(), vec![])
    }

    #[tokio::test]
    async fn test_pair_delivers_in_order() {
        let (a, b) = MemoryChannel::pair();
        a.write(message(&[1; 8])).unwrap();
        a.write(message(&[2; 8])).unwrap();

        assert_eq!(b.read().await.unwrap().bytes, vec![1; 8]);
        assert_eq!(b.try_read().unwrap().bytes, vec![2; 8]);
        assert_eq!(b.try_read(), Err(Error::WouldBlock));
    }

    #[tokio::test]
    async fn test_peer_drains_then_sees_closed() {
        let (a, b) = MemoryChannel::pair();
        a.write(message(&[7; 8])).unwrap();
        a.close();

        assert_eq!(b.read().await.unwrap().bytes, vec![7; 8]);
        assert_eq!(b.read().await, Err(Error::PeerClosed));
        assert_eq!(b.write(message(&[0; 8])), Err(Error::PeerClosed));
        assert_eq!(a.write(message(&[0; 8])), Err(Error::Closed));
    }

    #[tokio::test]
    async fn test_close_wakes_pending_read() {
        let (a, _b) = MemoryChannel::pair();
        let a = Arc::new(a);
        let reader = {
            let a = Arc::clone(&a);
            tokio::spawn(async move { a.read().await })
        };
        tokio::task::yield_now().await;
        a.close();
        assert_eq!(reader.await.unwrap(), Err(Error::Closed));
    }

    #[tokio::test]
    async fn test_oversized_message_is_rejected_and_closed() {
        let table = HandleTable::new();
        let (a, _b) = MemoryChannel::pair();
        let handles = (0..MAX_MESSAGE_HANDLES + 1).map(|_| table.create()).collect();
        let result = a.write(MessageBuf::new(vec![0; 8], handles));
        assert_eq!(result, Err(Error::MessageTooLarge { bytes: 8, handles: MAX_MESSAGE_HANDLES + 1 }));
        assert_eq!(table.live_count(), 0);
    }

    #[tokio::test]
    async fn test_dropping_endpoint_closes_queued_handles() {
        let table = HandleTable::new();
        let (a, b) = MemoryChannel::pair();
        a.write(MessageBuf::new(vec![0; 8], vec![table.create()])).unwrap();
        assert_eq!(table.live_count(), 1);
        drop(b);
        assert_eq!(table.live_count(), 0);
    }
}

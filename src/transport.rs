//! # Datagram Transport Abstraction
//!
//! Traits for the wire underneath a connection, so the pacer, the emulator
//! and the receive loop work with any datagram carrier (UDP, in-memory
//! links, or an emulator wrapping either).
//!
//! - [`DatagramSink`]: asynchronous sending
//! - [`DatagramSource`]: asynchronous receiving
//!
//! Both use explicit boxed futures instead of `async_trait`, and both take
//! `&self` so one carrier can be shared between tasks behind an `Arc`.
//!
//! ## Example
//!
//! ```rust
//! use quicfec::transport::{memory_link, DatagramSink, DatagramSource};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> std::io::Result<()> {
//! let (tx, rx) = memory_link();
//! tx.send_datagram(b"hello").await?;
//!
//! let mut buf = [0u8; 64];
//! let n = rx.recv_datagram(&mut buf).await?;
//! assert_eq!(&buf[..n], b"hello");
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

/// Future returned by the transport traits.
pub type DatagramFuture<'a> = Pin<Box<dyn Future<Output = io::Result<usize>> + Send + 'a>>;

// =============================================================================
// Traits
// =============================================================================

/// Sends whole datagrams.
pub trait DatagramSink: Send + Sync {
    /// Send one datagram. Returns the number of bytes accepted, which equals
    /// `data.len()` for datagram carriers.
    fn send_datagram<'a>(&'a self, data: &'a [u8]) -> DatagramFuture<'a>;
}

/// Receives whole datagrams.
pub trait DatagramSource: Send + Sync {
    /// Receive one datagram into `buf`. A datagram longer than `buf` is
    /// truncated.
    fn recv_datagram<'a>(&'a self, buf: &'a mut [u8]) -> DatagramFuture<'a>;
}

impl<T: DatagramSink + ?Sized> DatagramSink for Arc<T> {
    fn send_datagram<'a>(&'a self, data: &'a [u8]) -> DatagramFuture<'a> {
        (**self).send_datagram(data)
    }
}

impl<T: DatagramSource + ?Sized> DatagramSource for Arc<T> {
    fn recv_datagram<'a>(&'a self, buf: &'a mut [u8]) -> DatagramFuture<'a> {
        (**self).recv_datagram(buf)
    }
}

// =============================================================================
// Tokio UDP
// =============================================================================

/// Connected `tokio::net::UdpSocket`.
///
/// ```rust,no_run
/// use quicfec::transport::DatagramSink;
/// use tokio::net::UdpSocket;
///
/// # async fn run() -> std::io::Result<()> {
/// let socket = UdpSocket::bind("0.0.0.0:0").await?;
/// socket.connect("127.0.0.1:9000").await?;
/// socket.send_datagram(&[0x42; 1200]).await?;
/// # Ok(())
/// # }
/// ```
impl DatagramSink for tokio::net::UdpSocket {
    fn send_datagram<'a>(&'a self, data: &'a [u8]) -> DatagramFuture<'a> {
        Box::pin(async move { self.send(data).await })
    }
}

impl DatagramSource for tokio::net::UdpSocket {
    fn recv_datagram<'a>(&'a self, buf: &'a mut [u8]) -> DatagramFuture<'a> {
        Box::pin(async move { self.recv(buf).await })
    }
}

// =============================================================================
// In-memory link
// =============================================================================

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "link closed")
}

/// Sending half of an in-memory link.
#[derive(Debug, Clone)]
pub struct MemorySink {
    sender: mpsc::UnboundedSender<Vec<u8>>,
}

/// Receiving half of an in-memory link.
#[derive(Debug)]
pub struct MemorySource {
    receiver: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
}

/// Create a one-way in-memory datagram link.
///
/// Datagrams arrive in send order; the source reports `BrokenPipe` once
/// every sink is dropped and the queue is empty.
pub fn memory_link() -> (MemorySink, MemorySource) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (
        MemorySink { sender },
        MemorySource {
            receiver: Mutex::new(receiver),
        },
    )
}

impl MemorySink {
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

impl MemorySource {
    /// Take the next datagram if one is queued.
    pub fn try_recv(&self) -> io::Result<Option<Vec<u8>>> {
        let Ok(mut receiver) = self.receiver.try_lock() else {
            return Ok(None);
        };
        match receiver.try_recv() {
            Ok(datagram) => Ok(Some(datagram)),
            Err(mpsc::error::TryRecvError::Empty) => Ok(None),
            Err(mpsc::error::TryRecvError::Disconnected) => Err(closed()),
        }
    }
}

impl DatagramSink for MemorySink {
    fn send_datagram<'a>(&'a self, data: &'a [u8]) -> DatagramFuture<'a> {
        Box::pin(async move {
            self.sender.send(data.to_vec()).map_err(|_| closed())?;
            Ok(data.len())
        })
    }
}

impl DatagramSource for MemorySource {
    fn recv_datagram<'a>(&'a self, buf: &'a mut [u8]) -> DatagramFuture<'a> {
        Box::pin(async move {
            let datagram = self.receiver.lock().await.recv().await.ok_or_else(closed)?;
            let len = datagram.len().min(buf.len());
            buf[..len].copy_from_slice(&datagram[..len]);
            Ok(len)
        })
    }
}

// =============================================================================
// Tests
// =============================================================================

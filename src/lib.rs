//! quicfec - adaptive transport resilience
//!
//! Building blocks for a QUIC-like datagram transport that keeps working
//! on lossy links:
//!
//! - [`fec`]: group forward error correction. Every `K` data packets are
//!   followed by `R` redundancy packets (XOR for the first, Cauchy
//!   Reed-Solomon rows over GF(2^8) for the rest), and a receiver rebuilds
//!   up to `R` lost payloads per group byte for byte.
//! - [`congestion`]: BBR-family controllers with a dual-scale bandwidth
//!   estimate, plus Reno and CUBIC.
//! - [`pacer`]: token-bucket pacing of data and redundancy at the
//!   controller's rate.
//! - [`emulator`]: a seeded lossy/duplicating/delaying link.
//! - [`metrics`]: sent-packet ledger, RTT and loss sampling, and the
//!   snapshot feed observers subscribe to.
//! - [`connection`]: all of the above joined over an in-memory link.
//!
//! # Example
//!
//! ```rust
//! use quicfec::{Connection, TransportConfig};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> quicfec::Result<()> {
//! let config = TransportConfig {
//!     fec_redundancy: 0.2,
//!     network_profile: Some("wifi".to_string()),
//!     emulator_seed: Some(7),
//!     ..Default::default()
//! };
//! let mut conn = Connection::open_in_memory(config)?;
//!
//! for i in 0..10u8 {
//!     conn.send(&[i; 100]).await?;
//! }
//! let first = conn.recv().await.unwrap();
//! assert_eq!(first.payload.len(), 100);
//!
//! println!("{:?}", conn.snapshot());
//! conn.close().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod congestion;
pub mod connection;
pub mod emulator;
pub mod error;
pub mod fec;
pub mod kernels;
pub mod metrics;
pub mod pacer;
pub mod transport;

pub use config::TransportConfig;
pub use congestion::{CongestionAlgorithm, CongestionController, Phase};
pub use connection::Connection;
pub use emulator::{NetworkEmulator, NetworkProfile};
pub use error::{ConfigError, DecodeError, Error, Result};
pub use fec::{Delivery, FecDecoder, FecEncoder, FecParams};
pub use metrics::MetricsSnapshot;

//! # Group FEC
//!
//! Outbound datagrams are batched into groups of `K` data packets. When a
//! group is sealed the encoder emits `R = max(1, round(K·ρ))` redundancy
//! packets computed over the group. A receiver that loses up to `R` data
//! packets of a group, and still holds as many redundancy packets as it
//! lost, rebuilds the missing payloads byte for byte.
//!
//! With `R = 1` the redundancy packet is the XOR of all payloads of the
//! group, zero-padded to the longest one. Additional redundancy packets use
//! further rows of a Cauchy matrix over GF(2^8) whose first row is all ones,
//! so parity 0 is always the plain XOR.
//!
//! ## Example
//!
//! ```rust
//! use quicfec::fec::{FecDecoder, FecEncoder, FecParams, DecoderConfig};
//!
//! let params = FecParams::new(4, 0.20).unwrap();
//! let mut encoder = FecEncoder::new(params);
//! let decoder = FecDecoder::new(DecoderConfig::for_params(&params));
//!
//! let mut wire = Vec::new();
//! for payload in [&b"alpha"[..], b"beta", b"gamma", b"delta"] {
//!     wire.extend(encoder.submit(payload).unwrap());
//! }
//!
//! // Lose the second data packet.
//! let mut recovered = Vec::new();
//! for (i, packet) in wire.iter().enumerate() {
//!     if i == 1 {
//!         continue;
//!     }
//!     recovered.extend(decoder.receive(&packet.datagram).unwrap());
//! }
//! assert!(recovered.iter().any(|d| d.recovered && d.payload == b"beta"));
//! ```

mod decoder;
mod encoder;
pub mod protocol;

#[cfg(test)]
mod tests;

pub use decoder::{
    CleanupReport, DecoderConfig, DecoderCounters, DecoderStats, Delivery, FecDecoder,
    GroupState, Recovery, RecoveredPacket,
};
pub use encoder::{compute_redundancy, compute_redundancy_scalar, EncoderStats, FecEncoder};
pub use protocol::PacketKind;

use crate::error::{ConfigError, DecodeError};
use protocol::{DataHeader, RedundancyHeader};

/// Group shape shared by encoder and decoder.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FecParams {
    group_size: u8,
    redundancy: f64,
    repair_count: u8,
}

impl FecParams {
    /// Smallest accepted redundancy fraction.
    pub const MIN_REDUNDANCY: f64 = 0.05;

    /// Largest accepted redundancy fraction.
    pub const MAX_REDUNDANCY: f64 = 0.20;

    /// Create parameters for groups of `group_size` data packets protected
    /// by a fraction `redundancy` of redundancy packets.
    pub fn new(group_size: u8, redundancy: f64) -> Result<Self, ConfigError> {
        if group_size == 0 {
            return Err(ConfigError::InvalidGroupSize(0));
        }
        if !(Self::MIN_REDUNDANCY..=Self::MAX_REDUNDANCY).contains(&redundancy) {
            return Err(ConfigError::RedundancyOutOfRange(redundancy));
        }

        let repair_count = repair_count_for(group_size, redundancy);
        if group_size as u32 + repair_count as u32 > 256 {
            return Err(ConfigError::TooManyBlocks {
                k: group_size as u32,
                r: repair_count as u32,
            });
        }

        Ok(Self {
            group_size,
            redundancy,
            repair_count,
        })
    }

    /// Data packets per full group (K).
    pub fn group_size(&self) -> u8 {
        self.group_size
    }

    /// Redundancy fraction (ρ).
    pub fn redundancy(&self) -> f64 {
        self.redundancy
    }

    /// Redundancy packets per group (R).
    pub fn repair_count(&self) -> u8 {
        self.repair_count
    }
}

impl Default for FecParams {
    fn default() -> Self {
        Self {
            group_size: 10,
            redundancy: 0.10,
            repair_count: 1,
        }
    }
}

/// `R = max(1, round(K·ρ))`.
pub fn repair_count_for(group_size: u8, redundancy: f64) -> u8 {
    let r = (group_size as f64 * redundancy).round();
    r.clamp(1.0, 255.0) as u8
}

/// A framed datagram produced by the encoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Per-connection transmission order.
    pub sequence_id: u64,
    pub group_id: u64,
    pub kind: PacketKind,
    /// Data packet index, or parity index for redundancy packets.
    pub index: u16,
    /// Complete datagram, header included.
    pub datagram: Vec<u8>,
}

impl Packet {
    /// Datagram length in bytes.
    pub fn len(&self) -> usize {
        self.datagram.len()
    }

    pub fn is_empty(&self) -> bool {
        self.datagram.is_empty()
    }

    pub fn key(&self) -> PacketKey {
        PacketKey {
            group_id: self.group_id,
            kind: self.kind,
            index: self.index,
        }
    }
}

/// Identifies a datagram on the wire without a sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PacketKey {
    pub group_id: u64,
    pub kind: PacketKind,
    pub index: u16,
}

impl PacketKey {
    /// Read the key from a received datagram.
    pub fn from_datagram(datagram: &[u8]) -> Result<Self, DecodeError> {
        match PacketKind::classify(datagram) {
            PacketKind::Data => {
                let (header, _) = DataHeader::decode(datagram)?;
                Ok(Self {
                    group_id: header.group_id,
                    kind: PacketKind::Data,
                    index: header.packet_index,
                })
            }
            PacketKind::Redundancy => {
                let (header, _) = RedundancyHeader::decode(datagram)?;
                Ok(Self {
                    group_id: header.group_id,
                    kind: PacketKind::Redundancy,
                    index: header.parity_index as u16,
                })
            }
        }
    }
}

//! Wire framing for data and redundancy packets.
//!
//! All multi-byte integers are big-endian. A redundancy packet starts with
//! the two marker bytes `0xFE 0xC0`; anything else is parsed as a data
//! packet. Group ids are assigned from zero upwards, so a data header can
//! only collide with the marker after 2^63 groups.

use crate::error::DecodeError;

/// Leading bytes of every redundancy packet.
pub const REDUNDANCY_MARKER: [u8; 2] = [0xFE, 0xC0];

/// Size of a data packet header.
pub const DATA_HEADER_LEN: usize = 10;

/// Size of the fixed part of a redundancy header (before the length table).
pub const REDUNDANCY_FIXED_LEN: usize = 13;

/// Largest payload a data packet may carry (length table entries are u16).
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize;

/// Packet kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketKind {
    /// Application payload.
    Data,
    /// Parity computed over a group.
    Redundancy,
}

impl PacketKind {
    /// Classify a datagram by its leading bytes.
    pub fn classify(datagram: &[u8]) -> Self {
        if datagram.len() >= 2 && datagram[..2] == REDUNDANCY_MARKER {
            Self::Redundancy
        } else {
            Self::Data
        }
    }
}

/// Data packet header.
///
/// ```text
/// ┌──────────────────┬──────────────┬─────────────┐
/// │ group_id (8B BE) │ index (2B BE)│ payload ... │
/// └──────────────────┴──────────────┴─────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataHeader {
    pub group_id: u64,
    pub packet_index: u16,
}

impl DataHeader {
    /// Build a complete datagram carrying `payload`.
    pub fn encode(&self, payload: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(DATA_HEADER_LEN + payload.len());
        buf.extend_from_slice(&self.group_id.to_be_bytes());
        buf.extend_from_slice(&self.packet_index.to_be_bytes());
        buf.extend_from_slice(payload);
        buf
    }

    /// Split a datagram into header and payload.
    pub fn decode(datagram: &[u8]) -> Result<(Self, &[u8]), DecodeError> {
        if datagram.len() < DATA_HEADER_LEN {
            return Err(DecodeError::Truncated {
                needed: DATA_HEADER_LEN,
                got: datagram.len(),
            });
        }

        let group_id = read_u64(&datagram[0..8]);
        let packet_index = u16::from_be_bytes([datagram[8], datagram[9]]);

        Ok((
            Self {
                group_id,
                packet_index,
            },
            &datagram[DATA_HEADER_LEN..],
        ))
    }
}

/// Redundancy packet header.
///
/// ```text
/// ┌───────────┬──────────────────┬──────────┬────┬────┬──────────────────┬────────────┐
/// │ FE C0     │ group_id (8B BE) │ parity_ix│ k  │ r  │ k × len (2B BE)  │ parity ... │
/// └───────────┴──────────────────┴──────────┴────┴────┴──────────────────┴────────────┘
/// ```
///
/// The parity payload is as long as the longest data payload of the group;
/// shorter payloads are treated as zero-padded. The length table lets the
/// receiver truncate a recovered payload back to its original size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedundancyHeader {
    pub group_id: u64,
    pub parity_index: u8,
    /// Number of data packets actually in the group.
    pub k: u8,
    /// Number of redundancy packets emitted for the group.
    pub r: u8,
    /// Payload length of each data packet, by index.
    pub payload_lens: Vec<u16>,
}

impl RedundancyHeader {
    /// Header length on the wire.
    pub fn encoded_len(&self) -> usize {
        REDUNDANCY_FIXED_LEN + 2 * self.payload_lens.len()
    }

    /// Length of the parity payload that follows the header.
    pub fn parity_len(&self) -> usize {
        self.payload_lens.iter().copied().max().unwrap_or(0) as usize
    }

    /// Build a complete datagram carrying `parity`.
    pub fn encode(&self, parity: &[u8]) -> Vec<u8> {
        debug_assert_eq!(parity.len(), self.parity_len());

        let mut buf = Vec::with_capacity(self.encoded_len() + parity.len());
        buf.extend_from_slice(&REDUNDANCY_MARKER);
        buf.extend_from_slice(&self.group_id.to_be_bytes());
        buf.push(self.parity_index);
        buf.push(self.k);
        buf.push(self.r);
        for len in &self.payload_lens {
            buf.extend_from_slice(&len.to_be_bytes());
        }
        buf.extend_from_slice(parity);
        buf
    }

    /// Parse and validate a redundancy datagram.
    pub fn decode(datagram: &[u8]) -> Result<(Self, &[u8]), DecodeError> {
        if datagram.len() < REDUNDANCY_FIXED_LEN {
            return Err(DecodeError::Truncated {
                needed: REDUNDANCY_FIXED_LEN,
                got: datagram.len(),
            });
        }
        if datagram[..2] != REDUNDANCY_MARKER {
            return Err(DecodeError::BadMarker);
        }

        let group_id = read_u64(&datagram[2..10]);
        let parity_index = datagram[10];
        let k = datagram[11];
        let r = datagram[12];

        if k == 0 || r == 0 || k as u16 + r as u16 > 256 {
            return Err(DecodeError::InvalidGroupShape { k, r });
        }
        if parity_index >= r {
            return Err(DecodeError::ParityIndexOutOfRange {
                index: parity_index,
                r,
            });
        }

        let table_end = REDUNDANCY_FIXED_LEN + 2 * k as usize;
        if datagram.len() < table_end {
            return Err(DecodeError::Truncated {
                needed: table_end,
                got: datagram.len(),
            });
        }

        let payload_lens: Vec<u16> = datagram[REDUNDANCY_FIXED_LEN..table_end]
            .chunks_exact(2)
            .map(|c| u16::from_be_bytes([c[0], c[1]]))
            .collect();

        let header = Self {
            group_id,
            parity_index,
            k,
            r,
            payload_lens,
        };

        let parity = &datagram[table_end..];
        if parity.len() != header.parity_len() {
            return Err(DecodeError::LengthMismatch {
                expected: header.parity_len(),
                got: parity.len(),
            });
        }

        Ok((header, parity))
    }
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    u64::from_be_bytes(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_header_layout() {
        let header = DataHeader {
            group_id: 0x0102_0304_0506_0708,
            packet_index: 0x0a0b,
        };
        let wire = header.encode(b"xyz");
        assert_eq!(
            wire,
            [1, 2, 3, 4, 5, 6, 7, 8, 0x0a, 0x0b, b'x', b'y', b'z']
        );

        let (parsed, payload) = DataHeader::decode(&wire).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(payload, b"xyz");
        assert_eq!(PacketKind::classify(&wire), PacketKind::Data);
    }

    #[test]
    fn test_redundancy_header_layout() {
        let header = RedundancyHeader {
            group_id: 9,
            parity_index: 0,
            k: 2,
            r: 1,
            payload_lens: vec![3, 1],
        };
        let wire = header.encode(&[0xaa, 0xbb, 0xcc]);
        assert_eq!(&wire[..2], &REDUNDANCY_MARKER);
        assert_eq!(wire.len(), REDUNDANCY_FIXED_LEN + 4 + 3);
        assert_eq!(PacketKind::classify(&wire), PacketKind::Redundancy);

        let (parsed, parity) = RedundancyHeader::decode(&wire).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(parity, &[0xaa, 0xbb, 0xcc]);
    }

    #[test]
    fn test_truncated_packets_rejected() {
        assert_eq!(
            DataHeader::decode(&[0; 9]).unwrap_err(),
            DecodeError::Truncated { needed: 10, got: 9 }
        );

        let mut wire = vec![0xFE, 0xC0];
        wire.extend_from_slice(&[0; 11]);
        wire[11] = 4; // k
        wire[12] = 1; // r
        assert!(matches!(
            RedundancyHeader::decode(&wire),
            Err(DecodeError::Truncated { needed: 21, .. })
        ));
    }

    #[test]
    fn test_invalid_shape_rejected() {
        let header = RedundancyHeader {
            group_id: 1,
            parity_index: 0,
            k: 1,
            r: 1,
            payload_lens: vec![0],
        };
        let mut wire = header.encode(&[]);

        wire[11] = 0;
        assert_eq!(
            RedundancyHeader::decode(&wire).unwrap_err(),
            DecodeError::InvalidGroupShape { k: 0, r: 1 }
        );

        wire[11] = 1;
        wire[10] = 3;
        assert_eq!(
            RedundancyHeader::decode(&wire).unwrap_err(),
            DecodeError::ParityIndexOutOfRange { index: 3, r: 1 }
        );
    }

    #[test]
    fn test_parity_length_mismatch_rejected() {
        let header = RedundancyHeader {
            group_id: 1,
            parity_index: 0,
            k: 2,
            r: 1,
            payload_lens: vec![4, 2],
        };
        let mut wire = header.encode(&[1, 2, 3, 4]);
        wire.pop();
        assert_eq!(
            RedundancyHeader::decode(&wire).unwrap_err(),
            DecodeError::LengthMismatch {
                expected: 4,
                got: 3
            }
        );
    }
}

//! FEC encoder (sender side).

use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::{Error, Result};
use crate::kernels;

use super::protocol::{DataHeader, RedundancyHeader, MAX_PAYLOAD_LEN};
use super::{FecParams, Packet, PacketKind};

/// Default time a partially filled group may wait before it is sealed.
pub const DEFAULT_FLUSH_TIMEOUT: Duration = Duration::from_millis(20);

/// Encoder counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EncoderStats {
    /// Groups sealed, full or short.
    pub groups_sealed: u64,
    /// Groups sealed by a flush before reaching K packets.
    pub short_groups: u64,
    pub data_packets: u64,
    pub redundancy_packets: u64,
}

/// Groups outbound payloads and emits redundancy when a group is sealed.
///
/// One encoder belongs to one sender; group ids and sequence ids are
/// strictly increasing over its lifetime.
#[derive(Debug)]
pub struct FecEncoder {
    params: FecParams,

    /// When false, packets are framed and grouped but no redundancy is sent.
    redundancy_enabled: bool,

    flush_timeout: Duration,

    /// Group currently being filled.
    group_id: u64,

    /// Index the next data packet gets inside the current group.
    next_index: u16,

    /// Payloads of the current group, kept until the group is sealed.
    pending: Vec<Vec<u8>>,

    /// When the first packet of the current group was submitted.
    group_started: Option<Instant>,

    next_sequence: u64,

    stats: EncoderStats,
}

impl FecEncoder {
    /// Create an encoder with the default flush timeout.
    pub fn new(params: FecParams) -> Self {
        Self::with_config(params, DEFAULT_FLUSH_TIMEOUT, true)
    }

    /// Create an encoder with custom flush timeout, optionally with
    /// redundancy disabled.
    pub fn with_config(params: FecParams, flush_timeout: Duration, redundancy_enabled: bool) -> Self {
        Self {
            params,
            redundancy_enabled,
            flush_timeout,
            group_id: 0,
            next_index: 0,
            pending: Vec::with_capacity(params.group_size() as usize),
            group_started: None,
            next_sequence: 0,
            stats: EncoderStats::default(),
        }
    }

    pub fn params(&self) -> &FecParams {
        &self.params
    }

    pub fn stats(&self) -> EncoderStats {
        self.stats
    }

    /// Group the next data packet will join.
    pub fn current_group(&self) -> u64 {
        self.group_id
    }

    /// Data packets buffered in the current group.
    pub fn pending_count(&self) -> usize {
        self.next_index as usize
    }

    /// When the current partial group must be flushed, if one is open.
    pub fn flush_deadline(&self) -> Option<Instant> {
        self.group_started.map(|t| t + self.flush_timeout)
    }

    /// Frame `payload` into the current group.
    ///
    /// Returns the data packet, followed by the group's redundancy packets
    /// when this payload completes the group.
    pub fn submit(&mut self, payload: &[u8]) -> Result<Vec<Packet>> {
        self.submit_at(payload, Instant::now())
    }

    /// Same as [`submit`](Self::submit) with an explicit clock.
    pub fn submit_at(&mut self, payload: &[u8], now: Instant) -> Result<Vec<Packet>> {
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(Error::PayloadTooLarge {
                len: payload.len(),
                max: MAX_PAYLOAD_LEN,
            });
        }

        if self.next_index == 0 {
            self.group_started = Some(now);
        }

        let header = DataHeader {
            group_id: self.group_id,
            packet_index: self.next_index,
        };
        let data = self.make_packet(PacketKind::Data, self.next_index, header.encode(payload));
        self.stats.data_packets += 1;

        if self.redundancy_enabled {
            self.pending.push(payload.to_vec());
        }
        self.next_index += 1;

        let mut out = vec![data];
        if self.next_index >= self.params.group_size() as u16 {
            out.extend(self.seal_group());
        }
        Ok(out)
    }

    /// Seal the current partial group now.
    ///
    /// Redundancy is computed over the packets present and records the
    /// actual group size. Returns nothing when no group is open.
    pub fn flush(&mut self) -> Vec<Packet> {
        if self.next_index == 0 {
            return Vec::new();
        }
        self.seal_group()
    }

    /// Flush the current group if its deadline has passed.
    pub fn flush_if_due(&mut self, now: Instant) -> Vec<Packet> {
        match self.flush_deadline() {
            Some(deadline) if now >= deadline => self.flush(),
            _ => Vec::new(),
        }
    }

    fn seal_group(&mut self) -> Vec<Packet> {
        let group_id = self.group_id;
        let k_actual = self.next_index;

        let mut out = Vec::new();
        if self.redundancy_enabled && !self.pending.is_empty() {
            let parities = compute_redundancy(group_id, &self.pending, self.params.repair_count());
            for (header, parity) in parities {
                let index = header.parity_index as u16;
                let datagram = header.encode(&parity);
                out.push(self.make_packet(PacketKind::Redundancy, index, datagram));
            }
            self.stats.redundancy_packets += out.len() as u64;
        }

        if k_actual < self.params.group_size() as u16 {
            self.stats.short_groups += 1;
        }
        self.stats.groups_sealed += 1;

        debug!(
            "sealed group {}: k={}, redundancy={}",
            group_id,
            k_actual,
            out.len()
        );

        self.group_id += 1;
        self.next_index = 0;
        self.pending.clear();
        self.group_started = None;

        out
    }

    fn make_packet(&mut self, kind: PacketKind, index: u16, datagram: Vec<u8>) -> Packet {
        let sequence_id = self.next_sequence;
        self.next_sequence += 1;
        Packet {
            sequence_id,
            group_id: self.group_id,
            kind,
            index,
            datagram,
        }
    }
}

// =============================================================================
// Parity computation
// =============================================================================

/// Compute `r` redundancy packets over `payloads`.
///
/// Parity row `i` is `Σ_j a_ij · payload_j` over GF(2^8), with every payload
/// zero-padded to the longest. Row 0 has all coefficients equal to one,
/// so it is the XOR of the group.
pub fn compute_redundancy<P: AsRef<[u8]>>(
    group_id: u64,
    payloads: &[P],
    r: u8,
) -> Vec<(RedundancyHeader, Vec<u8>)> {
    compute_with(group_id, payloads, r, kernels::xor_into, kernels::mul_add_into)
}

/// [`compute_redundancy`] restricted to the portable kernels.
pub fn compute_redundancy_scalar<P: AsRef<[u8]>>(
    group_id: u64,
    payloads: &[P],
    r: u8,
) -> Vec<(RedundancyHeader, Vec<u8>)> {
    compute_with(
        group_id,
        payloads,
        r,
        kernels::xor_into_scalar,
        kernels::mul_add_into_scalar,
    )
}

fn compute_with<P: AsRef<[u8]>>(
    group_id: u64,
    payloads: &[P],
    r: u8,
    xor: fn(&mut [u8], &[u8]),
    mul_add: fn(&mut [u8], &[u8], u8),
) -> Vec<(RedundancyHeader, Vec<u8>)> {
    let k = payloads.len().min(255) as u8;
    let r = r.min((256 - k as u16).min(255) as u8);
    let payload_lens: Vec<u16> = payloads
        .iter()
        .take(k as usize)
        .map(|p| p.as_ref().len() as u16)
        .collect();
    let parity_len = payload_lens.iter().copied().max().unwrap_or(0) as usize;

    (0..r)
        .map(|parity_index| {
            let mut parity = vec![0u8; parity_len];
            for (j, payload) in payloads.iter().take(k as usize).enumerate() {
                let payload = payload.as_ref();
                let dst = &mut parity[..payload.len()];
                if parity_index == 0 {
                    xor(dst, payload);
                } else {
                    let coeff = kernels::cauchy_coefficient(parity_index, k, j as u8);
                    mul_add(dst, payload, coeff);
                }
            }

            let header = RedundancyHeader {
                group_id,
                parity_index,
                k,
                r,
                payload_lens: payload_lens.clone(),
            };
            (header, parity)
        })
        .collect()
}

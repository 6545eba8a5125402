//! FEC decoder (receiver side).
//!
//! The group table is split into shards by `group_id mod N`, each behind its
//! own mutex, so packets of different groups rarely contend. Every method
//! takes `&self`; share the decoder between the receive loop and the cleanup
//! timer through an `Arc`.
//!
//! A group is created by the first datagram that names it, data or
//! redundancy. Once every data slot is filled (received or rebuilt) the
//! group keeps only its slot bitmap, so late duplicates are recognised, and
//! it stays in the table until the retention window evicts it.
//!
//! An evicted group counts as unrecoverable only when a loss is provable:
//! the redundancy header fixed its size and slots are still empty, or a
//! gap sits below the highest data index that did arrive. A group that
//! never saw a header and has no gap may just be a short group whose
//! redundancy was lost, so it is counted as unverified instead. Evicted
//! ids are remembered for a while and late packets for them are dropped.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::error::DecodeError;
use crate::kernels;

use super::protocol::{DataHeader, RedundancyHeader};
use super::{FecParams, PacketKind};

/// Default time a group stays in the table after its first packet.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(2);

/// Default number of group table shards.
pub const DEFAULT_SHARDS: usize = 16;

/// Upper bound on data slots per group (k is a u8 on the wire).
const MAX_SLOTS: usize = 256;

/// Evicted group ids remembered per shard.
const TOMBSTONES_PER_SHARD: usize = 1024;

/// Decoder configuration.
#[derive(Debug, Clone)]
pub struct DecoderConfig {
    /// Data packets per group assumed until a redundancy header for the
    /// group arrives.
    pub group_size: u8,

    /// Age at which a group is evicted, complete or not.
    pub retention: Duration,

    /// Number of group table shards.
    pub shards: usize,

    /// Whether the sender emits redundancy. When it does not, a group that
    /// ends short of `group_size` without a gap is a flushed short group.
    pub redundancy: bool,
}

impl DecoderConfig {
    /// Configuration matching an encoder's parameters.
    pub fn for_params(params: &FecParams) -> Self {
        Self {
            group_size: params.group_size(),
            ..Self::default()
        }
    }
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            group_size: 10,
            retention: DEFAULT_RETENTION,
            shards: DEFAULT_SHARDS,
            redundancy: true,
        }
    }
}

/// Lifecycle of a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupState {
    /// Waiting for packets.
    Open,
    /// Missing slots are within tolerance and are being rebuilt.
    Recoverable,
    /// Every data slot is filled. Only the slot bitmap is retained.
    Complete,
    /// Evicted by cleanup. Later packets for the group are dropped.
    Expired,
}

/// A data packet rebuilt from redundancy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveredPacket {
    pub packet_index: u16,
    pub payload: Vec<u8>,
}

/// Result of handing a packet to the decoder.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Recovery {
    /// True when this packet made the group solvable and data was rebuilt.
    pub recovered: bool,
    /// Rebuilt packets in index order.
    pub packets: Vec<RecoveredPacket>,
    /// The packet was already known, or its group is complete or expired.
    pub duplicate: bool,
}

impl Recovery {
    fn duplicate() -> Self {
        Self {
            duplicate: true,
            ..Self::default()
        }
    }
}

/// A payload ready for the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub group_id: u64,
    pub packet_index: u16,
    pub payload: Vec<u8>,
    /// Rebuilt from redundancy rather than received.
    pub recovered: bool,
}

/// Outcome of a cleanup pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub evicted: usize,
    /// Evicted with a provable data loss.
    pub unrecoverable: usize,
    /// Evicted short of the nominal size with no header and no gap.
    pub unverified: usize,
}

// =============================================================================
// Counters
// =============================================================================

/// Decoder counters, shared with metrics observers.
///
/// Everything except `open_groups` is monotonic.
#[derive(Debug, Default)]
pub struct DecoderStats {
    data_packets: AtomicU64,
    redundancy_packets: AtomicU64,
    duplicate_packets: AtomicU64,
    malformed_packets: AtomicU64,
    recovered_packets: AtomicU64,
    recovered_groups: AtomicU64,
    completed_groups: AtomicU64,
    unrecoverable_groups: AtomicU64,
    unverified_groups: AtomicU64,
    expired_groups: AtomicU64,
    late_packets: AtomicU64,
    open_groups: AtomicU64,
}

/// Point-in-time copy of [`DecoderStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecoderCounters {
    pub data_packets: u64,
    pub redundancy_packets: u64,
    pub duplicate_packets: u64,
    pub malformed_packets: u64,
    pub recovered_packets: u64,
    pub recovered_groups: u64,
    pub completed_groups: u64,
    pub unrecoverable_groups: u64,
    pub unverified_groups: u64,
    pub expired_groups: u64,
    /// Packets for groups that had already been evicted.
    pub late_packets: u64,
    /// Groups in the table that are not complete yet.
    pub open_groups: u64,
}

impl DecoderStats {
    pub fn snapshot(&self) -> DecoderCounters {
        DecoderCounters {
            data_packets: self.data_packets.load(Ordering::Relaxed),
            redundancy_packets: self.redundancy_packets.load(Ordering::Relaxed),
            duplicate_packets: self.duplicate_packets.load(Ordering::Relaxed),
            malformed_packets: self.malformed_packets.load(Ordering::Relaxed),
            recovered_packets: self.recovered_packets.load(Ordering::Relaxed),
            recovered_groups: self.recovered_groups.load(Ordering::Relaxed),
            completed_groups: self.completed_groups.load(Ordering::Relaxed),
            unrecoverable_groups: self.unrecoverable_groups.load(Ordering::Relaxed),
            unverified_groups: self.unverified_groups.load(Ordering::Relaxed),
            expired_groups: self.expired_groups.load(Ordering::Relaxed),
            late_packets: self.late_packets.load(Ordering::Relaxed),
            open_groups: self.open_groups.load(Ordering::Relaxed),
        }
    }

    pub fn open_groups(&self) -> u64 {
        self.open_groups.load(Ordering::Relaxed)
    }

    pub fn recovered_packets(&self) -> u64 {
        self.recovered_packets.load(Ordering::Relaxed)
    }

    pub fn unrecoverable_groups(&self) -> u64 {
        self.unrecoverable_groups.load(Ordering::Relaxed)
    }

    fn bump(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }
}

// =============================================================================
// Group
// =============================================================================

/// Bitmap over the 256 possible data slots.
#[derive(Debug, Clone, Copy, Default)]
struct SlotSet([u64; 4]);

impl SlotSet {
    fn contains(&self, slot: usize) -> bool {
        self.0[slot / 64] & (1 << (slot % 64)) != 0
    }

    /// Returns true if the slot was not set before.
    fn insert(&mut self, slot: usize) -> bool {
        let fresh = !self.contains(slot);
        self.0[slot / 64] |= 1 << (slot % 64);
        fresh
    }

    fn remove(&mut self, slot: usize) {
        self.0[slot / 64] &= !(1 << (slot % 64));
    }

    fn count_below(&self, k: usize) -> usize {
        (0..k).filter(|&i| self.contains(i)).count()
    }

    fn highest(&self) -> Option<usize> {
        (0..MAX_SLOTS).rev().find(|&i| self.contains(i))
    }
}

/// Shape announced by redundancy headers.
#[derive(Debug, Clone, PartialEq, Eq)]
struct GroupShape {
    k: u8,
    r: u8,
    payload_lens: Vec<u16>,
}

#[derive(Debug)]
struct Group {
    created_at: Instant,
    state: GroupState,
    shape: Option<GroupShape>,
    received: SlotSet,
    data: Vec<Option<Vec<u8>>>,
    /// (parity_index, parity payload), in arrival order.
    parity: Vec<(u8, Vec<u8>)>,
}

/// What a settle step did to a group.
enum Settle {
    Pending,
    Completed,
    Recovered(Vec<RecoveredPacket>),
}

impl Group {
    fn new(now: Instant) -> Self {
        Self {
            created_at: now,
            state: GroupState::Open,
            shape: None,
            received: SlotSet::default(),
            data: Vec::new(),
            parity: Vec::new(),
        }
    }

    /// Data slots known to be lost. Without a header only gaps below the
    /// highest received index count; trailing slots may never have existed.
    fn provable_losses(&self) -> usize {
        let known = match &self.shape {
            Some(shape) => shape.k as usize,
            None => self.received.highest().map_or(0, |slot| slot + 1),
        };
        known - self.received.count_below(known)
    }

    /// Record a data payload. Returns false for duplicates.
    fn insert_data(&mut self, index: u16, payload: &[u8]) -> Result<bool, DecodeError> {
        if self.state == GroupState::Complete {
            return Ok(false);
        }

        let slot = index as usize;
        match &self.shape {
            Some(shape) => {
                if slot >= shape.k as usize {
                    return Err(DecodeError::DataIndexOutOfRange {
                        index,
                        k: shape.k as u16,
                    });
                }
                let expected = shape.payload_lens[slot] as usize;
                if payload.len() != expected {
                    return Err(DecodeError::LengthMismatch {
                        expected,
                        got: payload.len(),
                    });
                }
            }
            None if slot >= MAX_SLOTS => {
                return Err(DecodeError::DataIndexOutOfRange {
                    index,
                    k: MAX_SLOTS as u16,
                });
            }
            None => {}
        }

        if self.received.contains(slot) {
            return Ok(false);
        }

        if self.data.len() <= slot {
            self.data.resize_with(slot + 1, || None);
        }
        self.data[slot] = Some(payload.to_vec());
        self.received.insert(slot);
        Ok(true)
    }

    /// Record a redundancy payload. Returns false for duplicates.
    ///
    /// The first header fixes the group's shape. Data slots that arrived
    /// before it and do not fit are discarded and counted in `discarded`.
    fn insert_parity(
        &mut self,
        group_id: u64,
        header: RedundancyHeader,
        parity: &[u8],
        discarded: &mut usize,
    ) -> Result<bool, DecodeError> {
        if self.state == GroupState::Complete {
            return Ok(false);
        }

        let shape = GroupShape {
            k: header.k,
            r: header.r,
            payload_lens: header.payload_lens,
        };

        match &self.shape {
            Some(known) if *known != shape => {
                return Err(DecodeError::InconsistentGroup { group_id });
            }
            Some(_) => {}
            None => {
                for (slot, entry) in self.data.iter_mut().enumerate() {
                    let fits = match entry {
                        Some(payload) => {
                            slot < shape.k as usize
                                && payload.len() == shape.payload_lens[slot] as usize
                        }
                        None => true,
                    };
                    if !fits {
                        debug!(
                            "group {}: dropping data slot {} that contradicts the header",
                            group_id, slot
                        );
                        *entry = None;
                        self.received.remove(slot);
                        *discarded += 1;
                    }
                }
                self.data.truncate(shape.k as usize);
                self.shape = Some(shape);
            }
        }

        if self.parity.iter().any(|(i, _)| *i == header.parity_index) {
            return Ok(false);
        }
        self.parity.push((header.parity_index, parity.to_vec()));
        Ok(true)
    }

    /// Complete the group if possible, rebuilding missing slots when enough
    /// redundancy is present.
    fn settle(&mut self, group_id: u64, nominal: u8) -> Settle {
        if self.state == GroupState::Complete {
            return Settle::Pending;
        }

        let Some(shape) = self.shape.clone() else {
            // Without a header only a full nominal group can complete.
            if self.received.count_below(nominal as usize) == nominal as usize {
                self.complete();
                return Settle::Completed;
            }
            return Settle::Pending;
        };

        let k = shape.k as usize;
        let missing: Vec<usize> = (0..k).filter(|&i| !self.received.contains(i)).collect();
        if missing.is_empty() {
            self.complete();
            return Settle::Completed;
        }
        if missing.len() > self.parity.len() {
            if missing.len() > shape.r as usize {
                trace!(
                    "group {}: {} missing exceeds tolerance r={}",
                    group_id,
                    missing.len(),
                    shape.r
                );
            }
            return Settle::Pending;
        }

        self.state = GroupState::Recoverable;
        match self.solve(&shape, &missing) {
            Some(rebuilt) => {
                let packets = missing
                    .iter()
                    .zip(rebuilt)
                    .map(|(&slot, payload)| RecoveredPacket {
                        packet_index: slot as u16,
                        payload,
                    })
                    .collect::<Vec<_>>();
                for packet in &packets {
                    self.received.insert(packet.packet_index as usize);
                }
                self.complete();
                Settle::Recovered(packets)
            }
            None => {
                warn!("group {}: redundancy rows are singular", group_id);
                self.state = GroupState::Open;
                Settle::Pending
            }
        }
    }

    /// Solve for the missing slots with Gauss-Jordan elimination over
    /// GF(2^8). One missing slot and parity 0 reduces to XOR.
    fn solve(&self, shape: &GroupShape, missing: &[usize]) -> Option<Vec<Vec<u8>>> {
        let k = shape.k;
        let m = missing.len();

        let mut rows: Vec<(u8, Vec<u8>)> = self.parity.clone();
        rows.sort_by_key(|(i, _)| *i);
        rows.truncate(m);

        let coefficient = |parity_index: u8, slot: usize| -> u8 {
            if parity_index == 0 {
                1
            } else {
                kernels::cauchy_coefficient(parity_index, k, slot as u8)
            }
        };

        // Move every received payload to the right-hand side.
        for (parity_index, buf) in rows.iter_mut() {
            for (slot, payload) in self.data.iter().enumerate().take(k as usize) {
                if let Some(payload) = payload {
                    let coeff = coefficient(*parity_index, slot);
                    kernels::mul_add_into(&mut buf[..payload.len()], payload, coeff);
                }
            }
        }

        let mut matrix: Vec<Vec<u8>> = rows
            .iter()
            .map(|(parity_index, _)| missing.iter().map(|&s| coefficient(*parity_index, s)).collect())
            .collect();

        for col in 0..m {
            let pivot = (col..m).find(|&r| matrix[r][col] != 0)?;
            matrix.swap(col, pivot);
            rows.swap(col, pivot);

            let inv = kernels::gf_inv(matrix[col][col])?;
            for value in matrix[col].iter_mut() {
                *value = kernels::gf_mul(*value, inv);
            }
            kernels::mul_in_place(&mut rows[col].1, inv);

            for r in 0..m {
                let factor = matrix[r][col];
                if r == col || factor == 0 {
                    continue;
                }
                for c in 0..m {
                    let scaled = kernels::gf_mul(factor, matrix[col][c]);
                    matrix[r][c] ^= scaled;
                }
                let (target, source) = if r < col {
                    let (lo, hi) = rows.split_at_mut(col);
                    (&mut lo[r].1, &hi[0].1)
                } else {
                    let (lo, hi) = rows.split_at_mut(r);
                    (&mut hi[0].1, &lo[col].1)
                };
                kernels::mul_add_into(target, source, factor);
            }
        }

        Some(
            rows.into_iter()
                .zip(missing)
                .map(|((_, mut buf), &slot)| {
                    buf.truncate(shape.payload_lens[slot] as usize);
                    buf
                })
                .collect(),
        )
    }

    fn complete(&mut self) {
        self.state = GroupState::Complete;
        self.data = Vec::new();
        self.parity = Vec::new();
    }
}

// =============================================================================
// Decoder
// =============================================================================

/// One slice of the group table, plus the ids it evicted recently.
#[derive(Debug, Default)]
struct Shard {
    groups: HashMap<u64, Group>,
    expired: HashSet<u64>,
    expired_order: VecDeque<u64>,
}

impl Shard {
    fn is_expired(&self, group_id: u64) -> bool {
        self.expired.contains(&group_id)
    }

    fn bury(&mut self, group_id: u64) {
        if !self.expired.insert(group_id) {
            return;
        }
        self.expired_order.push_back(group_id);
        if self.expired_order.len() > TOMBSTONES_PER_SHARD {
            if let Some(oldest) = self.expired_order.pop_front() {
                self.expired.remove(&oldest);
            }
        }
    }
}

/// Receiver-side FEC decoder.
#[derive(Debug)]
pub struct FecDecoder {
    config: DecoderConfig,
    shards: Vec<Mutex<Shard>>,
    stats: Arc<DecoderStats>,
}

impl FecDecoder {
    pub fn new(config: DecoderConfig) -> Self {
        let shard_count = config.shards.max(1);
        Self {
            shards: (0..shard_count).map(|_| Mutex::new(Shard::default())).collect(),
            config,
            stats: Arc::new(DecoderStats::default()),
        }
    }

    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }

    /// Shared handle to the counters.
    pub fn stats(&self) -> Arc<DecoderStats> {
        Arc::clone(&self.stats)
    }

    fn shard(&self, group_id: u64) -> &Mutex<Shard> {
        &self.shards[(group_id % self.shards.len() as u64) as usize]
    }

    /// Record a received data payload.
    ///
    /// Creates the group if needed. A data packet can complete a group that
    /// already holds enough redundancy, in which case the remaining missing
    /// packets are rebuilt and returned.
    pub fn add_packet(
        &self,
        group_id: u64,
        packet_index: u16,
        payload: &[u8],
    ) -> Result<Recovery, DecodeError> {
        let now = Instant::now();
        let mut shard = self.shard(group_id).lock();
        if shard.is_expired(group_id) {
            return Ok(self.late(group_id));
        }
        let group = self.entry(&mut shard, group_id, now);

        match group.insert_data(packet_index, payload) {
            Ok(true) => {}
            Ok(false) => {
                DecoderStats::bump(&self.stats.duplicate_packets, 1);
                return Ok(Recovery::duplicate());
            }
            Err(e) => {
                self.note_malformed(&e);
                return Err(e);
            }
        }
        DecoderStats::bump(&self.stats.data_packets, 1);

        Ok(self.settle(group_id, group))
    }

    /// Parse a redundancy datagram and store its parity.
    ///
    /// If the group becomes solvable, the missing packets are rebuilt and
    /// returned with `recovered = true`. Malformed datagrams are counted and
    /// returned as errors; the decoder state is unaffected.
    pub fn add_redundancy_packet(&self, datagram: &[u8]) -> Result<Recovery, DecodeError> {
        let (header, parity) = RedundancyHeader::decode(datagram).map_err(|e| {
            self.note_malformed(&e);
            e
        })?;

        let group_id = header.group_id;
        let now = Instant::now();
        let mut shard = self.shard(group_id).lock();
        if shard.is_expired(group_id) {
            return Ok(self.late(group_id));
        }
        let group = self.entry(&mut shard, group_id, now);

        let mut discarded = 0;
        let inserted = group.insert_parity(group_id, header, parity, &mut discarded);
        if discarded > 0 {
            DecoderStats::bump(&self.stats.malformed_packets, discarded as u64);
        }
        match inserted {
            Ok(true) => {}
            Ok(false) => {
                DecoderStats::bump(&self.stats.duplicate_packets, 1);
                return Ok(Recovery::duplicate());
            }
            Err(e) => {
                self.note_malformed(&e);
                return Err(e);
            }
        }
        DecoderStats::bump(&self.stats.redundancy_packets, 1);

        Ok(self.settle(group_id, group))
    }

    /// Handle one datagram off the wire.
    ///
    /// Returns the payloads that became available: the datagram's own
    /// payload for fresh data packets, followed by any rebuilt packets of
    /// the same group in index order.
    pub fn receive(&self, datagram: &[u8]) -> Result<Vec<Delivery>, DecodeError> {
        match PacketKind::classify(datagram) {
            PacketKind::Data => {
                let (header, payload) = DataHeader::decode(datagram).map_err(|e| {
                    self.note_malformed(&e);
                    e
                })?;
                let recovery = self.add_packet(header.group_id, header.packet_index, payload)?;
                if recovery.duplicate {
                    return Ok(Vec::new());
                }

                let mut out = Vec::with_capacity(1 + recovery.packets.len());
                out.push(Delivery {
                    group_id: header.group_id,
                    packet_index: header.packet_index,
                    payload: payload.to_vec(),
                    recovered: false,
                });
                out.extend(deliveries(header.group_id, recovery));
                Ok(out)
            }
            PacketKind::Redundancy => {
                let group_id = RedundancyHeader::decode(datagram)
                    .map(|(h, _)| h.group_id)
                    .unwrap_or_default();
                let recovery = self.add_redundancy_packet(datagram)?;
                Ok(deliveries(group_id, recovery).collect())
            }
        }
    }

    /// Evict every group older than the retention window.
    pub fn cleanup_groups(&self) -> CleanupReport {
        self.cleanup_groups_at(Instant::now())
    }

    /// [`cleanup_groups`](Self::cleanup_groups) with an explicit clock.
    pub fn cleanup_groups_at(&self, now: Instant) -> CleanupReport {
        let retention = self.config.retention;
        self.evict(|group| now.saturating_duration_since(group.created_at) >= retention)
    }

    /// Evict every group, e.g. when the connection closes.
    pub fn drain(&self) -> CleanupReport {
        self.evict(|_| true)
    }

    /// Current state of a group: in the table, or recently evicted.
    pub fn group_state(&self, group_id: u64) -> Option<GroupState> {
        let shard = self.shard(group_id).lock();
        match shard.groups.get(&group_id) {
            Some(group) => Some(group.state),
            None if shard.is_expired(group_id) => Some(GroupState::Expired),
            None => None,
        }
    }

    /// Groups in the table, complete ones included.
    pub fn group_count(&self) -> usize {
        self.shards.iter().map(|s| s.lock().groups.len()).sum()
    }

    /// Groups in the table that are not complete.
    pub fn open_groups(&self) -> u64 {
        self.stats.open_groups()
    }

    fn entry<'a>(
        &self,
        shard: &'a mut Shard,
        group_id: u64,
        now: Instant,
    ) -> &'a mut Group {
        shard.groups.entry(group_id).or_insert_with(|| {
            DecoderStats::bump(&self.stats.open_groups, 1);
            trace!("group {} opened", group_id);
            Group::new(now)
        })
    }

    fn settle(&self, group_id: u64, group: &mut Group) -> Recovery {
        match group.settle(group_id, self.config.group_size) {
            Settle::Pending => Recovery::default(),
            Settle::Completed => {
                self.stats.open_groups.fetch_sub(1, Ordering::Relaxed);
                DecoderStats::bump(&self.stats.completed_groups, 1);
                Recovery::default()
            }
            Settle::Recovered(packets) => {
                self.stats.open_groups.fetch_sub(1, Ordering::Relaxed);
                DecoderStats::bump(&self.stats.completed_groups, 1);
                DecoderStats::bump(&self.stats.recovered_groups, 1);
                DecoderStats::bump(&self.stats.recovered_packets, packets.len() as u64);
                debug!("group {}: recovered {} packet(s)", group_id, packets.len());
                Recovery {
                    recovered: true,
                    packets,
                    duplicate: false,
                }
            }
        }
    }

    fn late(&self, group_id: u64) -> Recovery {
        DecoderStats::bump(&self.stats.late_packets, 1);
        trace!("group {}: packet arrived after eviction", group_id);
        Recovery::duplicate()
    }

    fn evict(&self, mut expired: impl FnMut(&Group) -> bool) -> CleanupReport {
        let mut report = CleanupReport::default();
        let mut evicted = Vec::new();

        for shard in &self.shards {
            let mut shard = shard.lock();
            shard.groups.retain(|&group_id, group| {
                if !expired(group) {
                    return true;
                }

                evicted.push(group_id);
                if group.state != GroupState::Complete {
                    self.stats.open_groups.fetch_sub(1, Ordering::Relaxed);
                    match group.provable_losses() {
                        0 if group.shape.is_some() || !self.config.redundancy => {}
                        0 => {
                            report.unverified += 1;
                            trace!("group {} expired short without a header", group_id);
                        }
                        missing => {
                            report.unrecoverable += 1;
                            debug!(
                                "group {} expired with {} packet(s) missing",
                                group_id, missing
                            );
                        }
                    }
                }
                false
            });

            report.evicted += evicted.len();
            for group_id in evicted.drain(..) {
                shard.bury(group_id);
            }
        }

        DecoderStats::bump(&self.stats.expired_groups, report.evicted as u64);
        DecoderStats::bump(&self.stats.unrecoverable_groups, report.unrecoverable as u64);
        DecoderStats::bump(&self.stats.unverified_groups, report.unverified as u64);
        report
    }

    fn note_malformed(&self, error: &DecodeError) {
        DecoderStats::bump(&self.stats.malformed_packets, 1);
        warn!("dropping malformed FEC packet: {}", error);
    }
}

fn deliveries(group_id: u64, recovery: Recovery) -> impl Iterator<Item = Delivery> {
    recovery.packets.into_iter().map(move |p| Delivery {
        group_id,
        packet_index: p.packet_index,
        payload: p.payload,
        recovered: true,
    })
}

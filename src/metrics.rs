//! Acknowledgement bookkeeping and the metrics feed.
//!
//! [`SentLedger`] remembers every transmitted datagram until it is
//! acknowledged or declared lost, and turns acknowledgements into RTT and
//! delivery-rate samples. [`MetricsFeed`] owns the connection's congestion
//! controller: it forwards those samples, publishes the resulting
//! [`PacingTarget`] to the pacer and a [`MetricsSnapshot`] to observers.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::watch;
use tracing::debug;

use crate::congestion::{
    AckEvent, BandwidthSample, CongestionController, PacingTarget, Phase, RttSample,
};
use crate::fec::{DecoderStats, Packet, PacketKey};

/// Packets acknowledged after this many later-sent ones are lost.
pub const REORDER_THRESHOLD: u64 = 3;

/// Floor for the time-based loss timeout.
pub const MIN_LOSS_TIMEOUT: Duration = Duration::from_millis(50);

/// RTT assumed before the first sample.
const INITIAL_RTT: Duration = Duration::from_millis(333);

/// EWMA alpha for loss rate smoothing.
const LOSS_EWMA_ALPHA: f64 = 0.1;

/// Window size for the average RTT.
const RTT_WINDOW_SIZE: usize = 10;

// =============================================================================
// Sent ledger
// =============================================================================

#[derive(Debug, Clone)]
struct SentRecord {
    key: PacketKey,
    bytes: u64,
    sent_at: Instant,
    /// Connection delivered-bytes count when this packet left.
    delivered: u64,
    delivered_at: Instant,
}

/// Losses found by one detection pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LossReport {
    pub packets: u64,
    pub bytes: u64,
}

impl LossReport {
    pub fn is_empty(&self) -> bool {
        self.packets == 0
    }

    fn add(&mut self, bytes: u64) {
        self.packets += 1;
        self.bytes += bytes;
    }
}

/// Result of acknowledging one datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckOutcome {
    pub acked_bytes: u64,
    pub rtt: RttSample,
    pub delivery: Option<BandwidthSample>,
    /// Packets this acknowledgement proved lost by reordering.
    pub lost: LossReport,
}

/// In-flight datagrams of one connection.
#[derive(Debug)]
pub struct SentLedger {
    in_flight: BTreeMap<u64, SentRecord>,
    by_key: HashMap<PacketKey, u64>,
    bytes_in_flight: u64,

    delivered: u64,
    delivered_at: Option<Instant>,
    largest_acked: Option<u64>,

    srtt: Option<Duration>,
    reorder_threshold: u64,

    packets_acked: u64,
    packets_lost: u64,
}

impl Default for SentLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl SentLedger {
    pub fn new() -> Self {
        Self::with_reorder_threshold(REORDER_THRESHOLD)
    }

    pub fn with_reorder_threshold(reorder_threshold: u64) -> Self {
        Self {
            in_flight: BTreeMap::new(),
            by_key: HashMap::new(),
            bytes_in_flight: 0,
            delivered: 0,
            delivered_at: None,
            largest_acked: None,
            srtt: None,
            reorder_threshold: reorder_threshold.max(1),
            packets_acked: 0,
            packets_lost: 0,
        }
    }

    pub fn bytes_in_flight(&self) -> u64 {
        self.bytes_in_flight
    }

    pub fn packets_in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn packets_acked(&self) -> u64 {
        self.packets_acked
    }

    pub fn packets_lost(&self) -> u64 {
        self.packets_lost
    }

    pub fn srtt(&self) -> Option<Duration> {
        self.srtt
    }

    /// Age after which an unacknowledged datagram counts as lost.
    pub fn loss_timeout(&self) -> Duration {
        (self.srtt.unwrap_or(INITIAL_RTT) * 2).max(MIN_LOSS_TIMEOUT)
    }

    /// Record a transmitted datagram.
    pub fn on_sent(&mut self, packet: &Packet, now: Instant) {
        if self.in_flight.is_empty() || self.delivered_at.is_none() {
            self.delivered_at = Some(now);
        }
        let record = SentRecord {
            key: packet.key(),
            bytes: packet.len() as u64,
            sent_at: now,
            delivered: self.delivered,
            delivered_at: self.delivered_at.unwrap_or(now),
        };
        self.bytes_in_flight += record.bytes;
        self.by_key.insert(record.key, packet.sequence_id);
        self.in_flight.insert(packet.sequence_id, record);
    }

    /// Acknowledge the datagram identified by `key`.
    ///
    /// Returns `None` for unknown or already settled datagrams, which covers
    /// duplicates produced on the path.
    pub fn on_ack(&mut self, key: PacketKey, now: Instant) -> Option<AckOutcome> {
        let sequence_id = self.by_key.remove(&key)?;
        let record = self.in_flight.remove(&sequence_id)?;
        self.bytes_in_flight = self.bytes_in_flight.saturating_sub(record.bytes);
        self.packets_acked += 1;

        let rtt = now.saturating_duration_since(record.sent_at);
        self.srtt = Some(match self.srtt {
            None => rtt,
            Some(srtt) => (srtt * 7 + rtt) / 8,
        });

        self.delivered += record.bytes;
        self.delivered_at = Some(now);
        let interval = now.saturating_duration_since(record.delivered_at);
        let delivery = (!interval.is_zero()).then(|| BandwidthSample {
            timestamp: now,
            delivered_bytes: self.delivered - record.delivered,
            interval,
        });

        self.largest_acked = Some(self.largest_acked.map_or(sequence_id, |l| l.max(sequence_id)));
        let lost = self.detect_reordered();

        Some(AckOutcome {
            acked_bytes: record.bytes,
            rtt: RttSample {
                timestamp: now,
                rtt,
            },
            delivery,
            lost,
        })
    }

    fn detect_reordered(&mut self) -> LossReport {
        let Some(largest) = self.largest_acked else {
            return LossReport::default();
        };
        let Some(cutoff) = largest.checked_sub(self.reorder_threshold) else {
            return LossReport::default();
        };

        let lost: Vec<u64> = self.in_flight.range(..=cutoff).map(|(&seq, _)| seq).collect();
        self.declare_lost(lost)
    }

    /// Declare lost every datagram older than the loss timeout.
    pub fn detect_timeouts(&mut self, now: Instant) -> LossReport {
        let timeout = self.loss_timeout();
        let lost: Vec<u64> = self
            .in_flight
            .iter()
            .take_while(|(_, r)| now.saturating_duration_since(r.sent_at) >= timeout)
            .map(|(&seq, _)| seq)
            .collect();
        self.declare_lost(lost)
    }

    fn declare_lost(&mut self, sequences: Vec<u64>) -> LossReport {
        let mut report = LossReport::default();
        for seq in sequences {
            if let Some(record) = self.in_flight.remove(&seq) {
                self.by_key.remove(&record.key);
                self.bytes_in_flight = self.bytes_in_flight.saturating_sub(record.bytes);
                report.add(record.bytes);
            }
        }
        self.packets_lost += report.packets;
        report
    }
}

// =============================================================================
// Metrics feed
// =============================================================================

/// Per-connection view exported to observers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub cwnd: u64,
    pub pacing_rate: u64,
    pub bandwidth_fast: u64,
    pub bandwidth_slow: u64,
    pub rtt_min: Option<Duration>,
    pub phase: Phase,
    pub fec_groups_open: u64,
    pub fec_recovered_count: u64,
    pub fec_unrecoverable_count: u64,
    /// Smoothed packet loss rate seen by the sender.
    pub loss_rate: f64,
    pub bytes_in_flight: u64,
}

/// Sample aggregator and owner of the congestion controller.
#[derive(Debug)]
pub struct MetricsFeed {
    controller: Box<dyn CongestionController>,
    decoder_stats: Arc<DecoderStats>,

    target_tx: watch::Sender<PacingTarget>,
    snapshot_tx: watch::Sender<MetricsSnapshot>,

    loss_rate: f64,
    rtt_window: VecDeque<Duration>,
    min_rtt: Option<Duration>,
    bytes_in_flight: u64,

    packets_acked: u64,
    packets_lost: u64,
    bytes_delivered: u64,
}

impl MetricsFeed {
    /// Wrap `controller`; FEC counters are read from `decoder_stats`.
    pub fn new(controller: Box<dyn CongestionController>, decoder_stats: Arc<DecoderStats>) -> Self {
        let (target_tx, _) = watch::channel(controller.target());
        let state = controller.state();
        let (snapshot_tx, _) = watch::channel(MetricsSnapshot {
            cwnd: state.cwnd,
            pacing_rate: state.pacing_rate,
            bandwidth_fast: state.bandwidth_fast,
            bandwidth_slow: state.bandwidth_slow,
            rtt_min: state.min_rtt,
            phase: state.phase,
            fec_groups_open: decoder_stats.open_groups(),
            fec_recovered_count: decoder_stats.recovered_packets(),
            fec_unrecoverable_count: decoder_stats.unrecoverable_groups(),
            loss_rate: 0.0,
            bytes_in_flight: 0,
        });

        Self {
            controller,
            decoder_stats,
            target_tx,
            snapshot_tx,
            loss_rate: 0.0,
            rtt_window: VecDeque::with_capacity(RTT_WINDOW_SIZE),
            min_rtt: None,
            bytes_in_flight: 0,
            packets_acked: 0,
            packets_lost: 0,
            bytes_delivered: 0,
        }
    }

    /// Receiver the pacer reads its rate and window from.
    pub fn pacing_target(&self) -> watch::Receiver<PacingTarget> {
        self.target_tx.subscribe()
    }

    /// Receiver of metrics snapshots.
    pub fn subscribe(&self) -> watch::Receiver<MetricsSnapshot> {
        self.snapshot_tx.subscribe()
    }

    pub fn controller(&self) -> &dyn CongestionController {
        self.controller.as_ref()
    }

    /// Feed one acknowledgement.
    pub fn on_ack(&mut self, outcome: &AckOutcome, bytes_in_flight: u64, now: Instant) {
        self.bytes_in_flight = bytes_in_flight;
        self.packets_acked += 1;
        self.bytes_delivered += outcome.acked_bytes;
        self.update_loss(true);
        for _ in 0..outcome.lost.packets {
            self.update_loss(false);
        }
        self.packets_lost += outcome.lost.packets;
        self.update_rtt(outcome.rtt.rtt);

        self.controller.on_ack(&AckEvent {
            now,
            acked_bytes: outcome.acked_bytes,
            lost_bytes: outcome.lost.bytes,
            rtt: Some(outcome.rtt),
            delivery: outcome.delivery,
            bytes_in_flight,
        });
        self.publish();
    }

    /// Feed losses found without an acknowledgement.
    pub fn on_loss(&mut self, report: LossReport, bytes_in_flight: u64, now: Instant) {
        if report.is_empty() {
            return;
        }
        debug!(
            "metrics: {} packets ({} bytes) declared lost",
            report.packets, report.bytes
        );
        self.bytes_in_flight = bytes_in_flight;
        self.packets_lost += report.packets;
        for _ in 0..report.packets {
            self.update_loss(false);
        }
        self.controller
            .on_ack(&AckEvent::loss(now, report.bytes, bytes_in_flight));
        self.publish();
    }

    /// Advance controller timers and refresh FEC counters.
    pub fn on_tick(&mut self, now: Instant) {
        self.controller.on_tick(now);
        self.publish();
    }

    fn update_loss(&mut self, received: bool) {
        let sample = if received { 0.0 } else { 1.0 };
        self.loss_rate = LOSS_EWMA_ALPHA * sample + (1.0 - LOSS_EWMA_ALPHA) * self.loss_rate;
    }

    fn update_rtt(&mut self, rtt: Duration) {
        if rtt.is_zero() {
            return;
        }
        if self.rtt_window.len() >= RTT_WINDOW_SIZE {
            self.rtt_window.pop_front();
        }
        self.rtt_window.push_back(rtt);
        self.min_rtt = Some(self.min_rtt.map_or(rtt, |m| m.min(rtt)));
    }

    /// Smoothed packet loss rate (0.0 - 1.0).
    pub fn loss_rate(&self) -> f64 {
        self.loss_rate
    }

    /// Average of the last few RTT samples.
    pub fn avg_rtt(&self) -> Option<Duration> {
        if self.rtt_window.is_empty() {
            return None;
        }
        let sum: Duration = self.rtt_window.iter().sum();
        Some(sum / self.rtt_window.len() as u32)
    }

    pub fn min_rtt(&self) -> Option<Duration> {
        self.min_rtt
    }

    pub fn packets_acked(&self) -> u64 {
        self.packets_acked
    }

    pub fn packets_lost(&self) -> u64 {
        self.packets_lost
    }

    pub fn bytes_delivered(&self) -> u64 {
        self.bytes_delivered
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let state = self.controller.state();
        MetricsSnapshot {
            cwnd: state.cwnd,
            pacing_rate: state.pacing_rate,
            bandwidth_fast: state.bandwidth_fast,
            bandwidth_slow: state.bandwidth_slow,
            rtt_min: state.min_rtt.or(self.min_rtt),
            phase: state.phase,
            fec_groups_open: self.decoder_stats.open_groups(),
            fec_recovered_count: self.decoder_stats.recovered_packets(),
            fec_unrecoverable_count: self.decoder_stats.unrecoverable_groups(),
            loss_rate: self.loss_rate,
            bytes_in_flight: self.bytes_in_flight,
        }
    }

    fn publish(&mut self) {
        let target = self.controller.target();
        self.target_tx.send_if_modified(|current| {
            if *current == target {
                return false;
            }
            *current = target;
            true
        });
        let snapshot = self.snapshot();
        self.snapshot_tx.send_replace(snapshot);
    }
}

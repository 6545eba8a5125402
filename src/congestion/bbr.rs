//! BBR-family congestion control with a dual-scale bandwidth estimate.
//!
//! The bottleneck rate is tracked at two time scales:
//!
//! - **fast**: windowed max of per-ack delivery-rate samples over the last
//!   `fast_window_rounds` rounds;
//! - **slow**: windowed max of per-round delivery rates over the last
//!   `slow_window_rounds` rounds.
//!
//! While the fast estimate stays within a hysteresis band around the slow
//! one it is used as is. Outside the band the smaller of the two wins, so a
//! transient spike cannot inflate the rate and a sustained drop is followed
//! within a couple of rounds.
//!
//! A round lasts one min-RTT of wall time. `bbr` re-probes the propagation
//! delay every 10 s; `bbrv2` and `bbrv3` every 5 s and additionally leave
//! Startup on the first lossy round.

use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::filter::WindowedMaxFilter;
use super::{
    AckEvent, CongestionAlgorithm, CongestionController, CongestionState, ControllerConfig,
    Phase, RttSample,
};

/// Combine the two bandwidth scales.
///
/// With no sample yet on one scale the other is used directly.
pub fn dual_scale_estimate(fast: u64, slow: u64, hysteresis: f64) -> u64 {
    if slow == 0 {
        return fast;
    }
    if fast == 0 {
        return slow;
    }
    let lower = slow as f64 * (1.0 - hysteresis);
    let upper = slow as f64 * (1.0 + hysteresis);
    let f = fast as f64;
    if f < lower || f > upper {
        fast.min(slow)
    } else {
        fast
    }
}

/// Phase plus the data only that phase needs.
#[derive(Debug, Clone, Copy, PartialEq)]
enum PhaseState {
    Startup {
        full_bw: u64,
        rounds_without_growth: u32,
    },
    Drain,
    ProbeBw {
        cycle_index: u32,
    },
    ProbeRtt {
        entered_at: Instant,
        /// When in-flight data first fell to the minimal window.
        drained_at: Option<Instant>,
        probe_min_rtt: Option<Duration>,
    },
}

impl PhaseState {
    fn phase(&self) -> Phase {
        match self {
            Self::Startup { .. } => Phase::Startup,
            Self::Drain => Phase::Drain,
            Self::ProbeBw { .. } => Phase::ProbeBw,
            Self::ProbeRtt { .. } => Phase::ProbeRtt,
        }
    }

    fn startup() -> Self {
        Self::Startup {
            full_bw: 0,
            rounds_without_growth: 0,
        }
    }
}

/// BBR controller state.
#[derive(Debug, Clone)]
pub struct BbrController {
    algorithm: CongestionAlgorithm,
    config: ControllerConfig,
    probe_rtt_interval: Duration,

    state: PhaseState,

    fast: WindowedMaxFilter,
    slow: WindowedMaxFilter,

    /// Bandwidth estimate in bytes/sec.
    bandwidth: u64,

    min_rtt: Option<Duration>,
    min_rtt_stamp: Instant,
    latest_rtt: Option<Duration>,

    round_count: u64,
    round_start: Instant,
    round_delivered: u64,
    round_lost: u64,
    loss_rate_window: f64,

    /// Window ceiling after a lossy round, lifted by a clean one.
    loss_cap: Option<u64>,

    cwnd: u64,
    pacing_rate: u64,
    pacing_gain: f64,

    bytes_in_flight: u64,
    last_sample_at: Instant,
    stall_count: u64,
}

impl BbrController {
    pub fn new(algorithm: CongestionAlgorithm, config: ControllerConfig, now: Instant) -> Self {
        let probe_rtt_interval = config.probe_rtt_interval(algorithm);
        let mut controller = Self {
            algorithm,
            probe_rtt_interval,
            state: PhaseState::startup(),
            fast: WindowedMaxFilter::new(config.fast_window_rounds),
            slow: WindowedMaxFilter::new(config.slow_window_rounds),
            bandwidth: 0,
            min_rtt: None,
            min_rtt_stamp: now,
            latest_rtt: None,
            round_count: 0,
            round_start: now,
            round_delivered: 0,
            round_lost: 0,
            loss_rate_window: 0.0,
            loss_cap: None,
            cwnd: config.initial_cwnd(),
            pacing_rate: 0,
            pacing_gain: config.startup_gain,
            bytes_in_flight: 0,
            last_sample_at: now,
            stall_count: 0,
            config,
        };
        controller.update_control();
        controller
    }

    pub fn phase(&self) -> Phase {
        self.state.phase()
    }

    /// Bandwidth estimate (bytes/sec).
    pub fn bandwidth(&self) -> u64 {
        self.bandwidth
    }

    pub fn min_rtt(&self) -> Option<Duration> {
        self.min_rtt
    }

    pub fn round_count(&self) -> u64 {
        self.round_count
    }

    /// Times a stall forced ProbeRTT.
    pub fn stall_count(&self) -> u64 {
        self.stall_count
    }

    pub fn in_loss_recovery(&self) -> bool {
        self.loss_cap.is_some()
    }

    fn round_length(&self) -> Duration {
        self.min_rtt
            .or(self.latest_rtt)
            .unwrap_or_else(|| self.config.initial_rtt())
    }

    /// Bandwidth-delay product in bytes.
    fn bdp(&self) -> u64 {
        (self.bandwidth as f64 * self.round_length().as_secs_f64()) as u64
    }

    fn update_min_rtt(&mut self, sample: RttSample) {
        let rtt = sample.rtt;
        if rtt.is_zero() {
            return;
        }
        self.latest_rtt = Some(rtt);

        if let PhaseState::ProbeRtt { probe_min_rtt, .. } = &mut self.state {
            *probe_min_rtt = Some(probe_min_rtt.map_or(rtt, |m| m.min(rtt)));
        }

        // Equal samples do not refresh the stamp, so a flat RTT still
        // triggers periodic ProbeRTT.
        match self.min_rtt {
            Some(current) if rtt >= current => {}
            _ => {
                self.min_rtt = Some(rtt);
                self.min_rtt_stamp = sample.timestamp;
            }
        }
    }

    /// Close the round if one min-RTT has elapsed. Returns whether it did.
    fn end_round_if_due(&mut self, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.round_start);
        if elapsed < self.round_length() || elapsed.is_zero() {
            return false;
        }

        let probing_rtt = matches!(self.state, PhaseState::ProbeRtt { .. });
        let rate = (self.round_delivered as f64 / elapsed.as_secs_f64()) as u64;
        if rate > 0 && !probing_rtt {
            self.slow.update(self.round_count, rate);
        }

        let total = self.round_delivered + self.round_lost;
        if total > 0 {
            self.loss_rate_window = self.round_lost as f64 / total as f64;
            self.respond_to_loss();
        }

        self.round_count += 1;
        self.round_start = now;
        self.round_delivered = 0;
        self.round_lost = 0;
        self.fast.expire(self.round_count);
        self.slow.expire(self.round_count);
        true
    }

    fn respond_to_loss(&mut self) {
        if self.loss_rate_window > self.config.loss_threshold {
            let reduced = (self.cwnd as f64 * self.config.loss_beta) as u64;
            let cap = reduced.max(self.config.min_cwnd());
            debug!(
                "{}: round loss {:.2}%, cwnd {} -> {}",
                self.algorithm,
                self.loss_rate_window * 100.0,
                self.cwnd,
                cap
            );
            self.loss_cap = Some(cap);
        } else if self.loss_cap.take().is_some() {
            debug!("{}: clean round, lifting loss cap", self.algorithm);
        }
    }

    fn update_estimate(&mut self) {
        self.bandwidth = dual_scale_estimate(
            self.fast.get(),
            self.slow.get(),
            self.config.bandwidth_hysteresis,
        );
    }

    fn advance_phase(&mut self, now: Instant, round_ended: bool) {
        match self.state {
            PhaseState::Startup {
                full_bw,
                rounds_without_growth,
            } => {
                if !round_ended {
                    return;
                }
                let (full_bw, rounds_without_growth) = if self.bandwidth as f64
                    >= full_bw as f64 * self.config.startup_growth_threshold
                {
                    (self.bandwidth, 0)
                } else {
                    (full_bw, rounds_without_growth + 1)
                };

                let plateau = rounds_without_growth >= self.config.startup_full_bw_rounds;
                let lossy = self.algorithm != CongestionAlgorithm::Bbr && self.loss_cap.is_some();
                if plateau || lossy {
                    self.set_state(PhaseState::Drain);
                } else {
                    self.state = PhaseState::Startup {
                        full_bw,
                        rounds_without_growth,
                    };
                }
            }
            PhaseState::Drain => {
                if self.bytes_in_flight <= self.bdp() {
                    self.set_state(PhaseState::ProbeBw { cycle_index: 0 });
                }
            }
            PhaseState::ProbeBw { cycle_index } => {
                if now.saturating_duration_since(self.min_rtt_stamp) >= self.probe_rtt_interval {
                    self.enter_probe_rtt(now);
                    return;
                }
                if round_ended {
                    self.state = PhaseState::ProbeBw {
                        cycle_index: (cycle_index + 1) % self.config.probe_bw_cycle_rounds,
                    };
                }
            }
            PhaseState::ProbeRtt { .. } => self.update_probe_rtt(now),
        }
    }

    fn enter_probe_rtt(&mut self, now: Instant) {
        self.set_state(PhaseState::ProbeRtt {
            entered_at: now,
            drained_at: None,
            probe_min_rtt: None,
        });
        self.update_probe_rtt(now);
    }

    fn update_probe_rtt(&mut self, now: Instant) {
        let PhaseState::ProbeRtt {
            entered_at,
            drained_at,
            probe_min_rtt,
        } = self.state
        else {
            return;
        };

        let drained_at = match drained_at {
            Some(at) => at,
            None if self.bytes_in_flight <= self.config.min_cwnd() => {
                self.state = PhaseState::ProbeRtt {
                    entered_at,
                    drained_at: Some(now),
                    probe_min_rtt,
                };
                now
            }
            None => return,
        };

        let hold = self
            .config
            .probe_rtt_duration()
            .max(probe_min_rtt.unwrap_or_else(|| self.round_length()));
        if now.saturating_duration_since(drained_at) < hold {
            return;
        }

        if let Some(rtt) = probe_min_rtt {
            self.min_rtt = Some(rtt);
        }
        self.min_rtt_stamp = now;
        debug!(
            "{}: ProbeRTT held {:?}, min_rtt {:?}",
            self.algorithm,
            now.saturating_duration_since(entered_at),
            self.min_rtt
        );

        // Never back to Startup, even when the probe interrupted it.
        self.set_state(PhaseState::ProbeBw { cycle_index: 0 });
    }

    fn set_state(&mut self, next: PhaseState) {
        let from = self.state.phase();
        let to = next.phase();
        if from != to {
            info!(
                "{}: {} -> {} (bw={} B/s, min_rtt={:?}, cwnd={})",
                self.algorithm, from, to, self.bandwidth, self.min_rtt, self.cwnd
            );
        }
        self.state = next;
    }

    fn update_control(&mut self) {
        let config = &self.config;
        let phase_gain = match self.state {
            PhaseState::Startup { .. } => config.startup_gain,
            PhaseState::Drain => config.drain_gain,
            PhaseState::ProbeBw { cycle_index } if cycle_index == 0 => config.probe_bw_gain,
            PhaseState::ProbeBw { .. } | PhaseState::ProbeRtt { .. } => 1.0,
        };
        // A lossy round stops any probing above the estimate.
        let gain = if self.loss_cap.is_some() {
            phase_gain.min(1.0)
        } else {
            phase_gain
        };
        self.pacing_gain = gain;

        let min_cwnd = config.min_cwnd();
        let rate = if self.bandwidth == 0 {
            gain * config.initial_cwnd() as f64 / self.round_length().as_secs_f64()
        } else {
            gain * self.bandwidth as f64
        };
        let floor = min_cwnd as f64 / config.initial_rtt().as_secs_f64();
        self.pacing_rate = rate.max(floor) as u64;

        let bdp = self.bdp() as f64;
        let cwnd = match self.state {
            PhaseState::ProbeRtt { .. } => min_cwnd,
            _ if self.bandwidth == 0 => config.initial_cwnd(),
            PhaseState::Startup { .. } | PhaseState::Drain => {
                ((bdp * config.startup_gain) as u64).max(config.initial_cwnd())
            }
            PhaseState::ProbeBw { .. } => ((bdp * config.cwnd_gain) as u64).max(min_cwnd),
        };
        let cwnd = match self.loss_cap {
            Some(cap) => cwnd.min(cap),
            None => cwnd,
        };
        self.cwnd = cwnd.max(config.segment_size);
    }
}

impl CongestionController for BbrController {
    fn algorithm(&self) -> CongestionAlgorithm {
        self.algorithm
    }

    fn on_ack(&mut self, event: &AckEvent) {
        let now = event.now;
        self.bytes_in_flight = event.bytes_in_flight;
        if event.has_sample() {
            self.last_sample_at = now;
        }

        if let Some(rtt) = event.rtt {
            self.update_min_rtt(rtt);
        }

        // ProbeRTT deliberately starves the pipe; its samples say nothing
        // about the bottleneck.
        if let Some(sample) = event.delivery {
            let rate = sample.rate();
            if rate > 0 && !matches!(self.state, PhaseState::ProbeRtt { .. }) {
                self.fast.update(self.round_count, rate);
            }
        }

        self.round_delivered += event.acked_bytes;
        self.round_lost += event.lost_bytes;

        let round_ended = self.end_round_if_due(now);
        self.update_estimate();
        self.advance_phase(now, round_ended);
        self.update_control();
    }

    fn on_tick(&mut self, now: Instant) {
        let timeout = self.config.stall_timeout();
        if now.saturating_duration_since(self.last_sample_at) >= timeout {
            self.last_sample_at = now;
            if !matches!(self.state, PhaseState::ProbeRtt { .. }) {
                warn!(
                    "{}: no delivery samples for {:?}, forcing ProbeRTT",
                    self.algorithm, timeout
                );
                self.stall_count += 1;
                self.enter_probe_rtt(now);
            }
        }
        self.update_probe_rtt(now);
        self.update_control();
    }

    fn cwnd(&self) -> u64 {
        self.cwnd
    }

    fn pacing_rate(&self) -> u64 {
        self.pacing_rate
    }

    fn state(&self) -> CongestionState {
        CongestionState {
            phase: self.phase(),
            bandwidth_fast: self.fast.get(),
            bandwidth_slow: self.slow.get(),
            bandwidth_estimate: self.bandwidth,
            min_rtt: self.min_rtt,
            cwnd: self.cwnd,
            pacing_rate: self.pacing_rate,
            pacing_gain: self.pacing_gain,
            loss_rate_window: self.loss_rate_window,
        }
    }
}

//! Loss-based congestion control: NewReno and CUBIC (RFC 8312).
//!
//! Both grow the window per acknowledged byte and cut it at most once per
//! round trip when loss is reported. The pacing rate is derived from the
//! window and the smoothed RTT.

use std::time::{Duration, Instant};

use tracing::debug;

use super::{
    AckEvent, CongestionAlgorithm, CongestionController, CongestionState, ControllerConfig,
    Phase,
};

/// Reno multiplicative decrease.
const RENO_BETA: f64 = 0.5;

/// CUBIC multiplicative decrease.
const CUBIC_BETA: f64 = 0.7;

/// CUBIC scaling constant, in segments per second cubed.
const CUBIC_C: f64 = 0.4;

/// Pacing gains applied to cwnd/srtt.
const SLOW_START_PACING_GAIN: f64 = 2.0;
const AVOIDANCE_PACING_GAIN: f64 = 1.25;

/// Delivery-rate smoothing for the slow bandwidth figure.
const BANDWIDTH_EWMA_ALPHA: f64 = 0.125;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LossBasedFlavor {
    Reno,
    Cubic,
}

#[derive(Debug, Clone)]
pub struct LossBasedController {
    flavor: LossBasedFlavor,
    config: ControllerConfig,

    cwnd: u64,
    ssthresh: u64,

    srtt: Option<Duration>,
    min_rtt: Option<Duration>,

    /// No further reduction until this instant.
    recovery_until: Option<Instant>,

    /// CUBIC: window before the last reduction, in bytes.
    w_max: f64,
    /// CUBIC: start of the current growth epoch.
    epoch_start: Option<Instant>,
    /// CUBIC: seconds to climb back to `w_max`.
    k: f64,

    latest_rate: u64,
    smoothed_rate: f64,
    last_round_loss: f64,
    pacing_rate: u64,
}

impl LossBasedController {
    pub fn new(flavor: LossBasedFlavor, config: ControllerConfig) -> Self {
        let mut controller = Self {
            flavor,
            cwnd: config.initial_cwnd(),
            ssthresh: u64::MAX,
            srtt: None,
            min_rtt: None,
            recovery_until: None,
            w_max: 0.0,
            epoch_start: None,
            k: 0.0,
            latest_rate: 0,
            smoothed_rate: 0.0,
            last_round_loss: 0.0,
            pacing_rate: 0,
            config,
        };
        controller.update_pacing();
        controller
    }

    pub fn phase(&self) -> Phase {
        if self.cwnd < self.ssthresh {
            Phase::SlowStart
        } else {
            Phase::CongestionAvoidance
        }
    }

    pub fn ssthresh(&self) -> u64 {
        self.ssthresh
    }

    fn in_recovery(&self, now: Instant) -> bool {
        self.recovery_until.map_or(false, |until| now < until)
    }

    fn update_rtt(&mut self, rtt: Duration) {
        if rtt.is_zero() {
            return;
        }
        self.min_rtt = Some(self.min_rtt.map_or(rtt, |m| m.min(rtt)));
        self.srtt = Some(match self.srtt {
            None => rtt,
            Some(srtt) => (srtt * 7 + rtt) / 8,
        });
    }

    fn on_congestion(&mut self, now: Instant, lost_bytes: u64, acked_bytes: u64) {
        let min_cwnd = self.config.min_cwnd();
        let before = self.cwnd;
        let beta = match self.flavor {
            LossBasedFlavor::Reno => RENO_BETA,
            LossBasedFlavor::Cubic => CUBIC_BETA,
        };

        if self.flavor == LossBasedFlavor::Cubic {
            self.w_max = before as f64;
            let w_max_segments = self.w_max / self.config.segment_size as f64;
            self.k = (w_max_segments * (1.0 - CUBIC_BETA) / CUBIC_C).cbrt();
            self.epoch_start = None;
        }

        self.cwnd = ((before as f64 * beta) as u64).max(min_cwnd);
        self.ssthresh = self.cwnd;

        let srtt = self.srtt.unwrap_or_else(|| self.config.initial_rtt());
        self.recovery_until = Some(now + srtt);
        self.last_round_loss = lost_bytes as f64 / (lost_bytes + acked_bytes).max(1) as f64;

        debug!(
            "{:?}: loss of {} bytes, cwnd {} -> {}",
            self.flavor, lost_bytes, before, self.cwnd
        );
    }

    fn grow(&mut self, now: Instant, acked_bytes: u64) {
        let segment = self.config.segment_size;

        if self.cwnd < self.ssthresh {
            self.cwnd = self.cwnd.saturating_add(acked_bytes);
            return;
        }

        match self.flavor {
            LossBasedFlavor::Reno => {
                let increase = (segment * acked_bytes / self.cwnd.max(1)).max(1);
                self.cwnd = self.cwnd.saturating_add(increase);
            }
            LossBasedFlavor::Cubic => {
                let epoch_start = *self.epoch_start.get_or_insert(now);
                if self.w_max < self.cwnd as f64 {
                    // No reduction yet in this epoch: grow from the current
                    // window as if it were the last maximum.
                    self.w_max = self.cwnd as f64;
                    self.k = 0.0;
                }

                let t = now.saturating_duration_since(epoch_start).as_secs_f64();
                let w_max_segments = self.w_max / segment as f64;
                let target = (CUBIC_C * (t - self.k).powi(3) + w_max_segments) * segment as f64;

                let cwnd = self.cwnd as f64;
                let increase = if target > cwnd {
                    ((target - cwnd) * acked_bytes as f64 / cwnd).min(acked_bytes as f64)
                } else {
                    // Keep probing slowly near the plateau.
                    segment as f64 * acked_bytes as f64 / (100.0 * cwnd)
                };
                self.cwnd = self.cwnd.saturating_add(increase.max(1.0) as u64);
            }
        }
    }

    fn update_pacing(&mut self) {
        let srtt = self.srtt.unwrap_or_else(|| self.config.initial_rtt());
        let gain = match self.phase() {
            Phase::SlowStart => SLOW_START_PACING_GAIN,
            _ => AVOIDANCE_PACING_GAIN,
        };
        self.pacing_rate = (gain * self.cwnd as f64 / srtt.as_secs_f64()) as u64;
    }
}

impl CongestionController for LossBasedController {
    fn algorithm(&self) -> CongestionAlgorithm {
        match self.flavor {
            LossBasedFlavor::Reno => CongestionAlgorithm::Reno,
            LossBasedFlavor::Cubic => CongestionAlgorithm::Cubic,
        }
    }

    fn on_ack(&mut self, event: &AckEvent) {
        let now = event.now;
        if let Some(sample) = event.rtt {
            self.update_rtt(sample.rtt);
        }
        if let Some(sample) = event.delivery {
            let rate = sample.rate();
            if rate > 0 {
                self.latest_rate = rate;
                self.smoothed_rate = if self.smoothed_rate == 0.0 {
                    rate as f64
                } else {
                    self.smoothed_rate * (1.0 - BANDWIDTH_EWMA_ALPHA)
                        + rate as f64 * BANDWIDTH_EWMA_ALPHA
                };
            }
        }

        if event.lost_bytes > 0 && !self.in_recovery(now) {
            self.on_congestion(now, event.lost_bytes, event.acked_bytes);
        } else if event.acked_bytes > 0 && !self.in_recovery(now) {
            self.grow(now, event.acked_bytes);
        }

        self.cwnd = self.cwnd.max(self.config.segment_size);
        self.update_pacing();
    }

    fn on_tick(&mut self, now: Instant) {
        if !self.in_recovery(now) {
            self.recovery_until = None;
        }
    }

    fn cwnd(&self) -> u64 {
        self.cwnd
    }

    fn pacing_rate(&self) -> u64 {
        self.pacing_rate
    }

    fn state(&self) -> CongestionState {
        let gain = match self.phase() {
            Phase::SlowStart => SLOW_START_PACING_GAIN,
            _ => AVOIDANCE_PACING_GAIN,
        };
        CongestionState {
            phase: self.phase(),
            bandwidth_fast: self.latest_rate,
            bandwidth_slow: self.smoothed_rate as u64,
            bandwidth_estimate: self.smoothed_rate as u64,
            min_rtt: self.min_rtt,
            cwnd: self.cwnd,
            pacing_rate: self.pacing_rate,
            pacing_gain: gain,
            loss_rate_window: self.last_round_loss,
        }
    }
}

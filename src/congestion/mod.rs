//! Congestion control.
//!
//! A controller consumes acknowledgement observations (delivery-rate
//! samples, RTT samples, acked and lost byte counts) and produces two
//! outputs: a congestion window in bytes and a pacing rate in bytes per
//! second. The pacer reads both through a [`PacingTarget`].
//!
//! The BBR family (`bbr`, `bbrv2`, `bbrv3`) shares one model-based
//! implementation with a dual-scale bandwidth estimate. `cubic` and `reno`
//! are loss-based and kept mostly as baselines.

mod bbr;
mod filter;
mod loss_based;

pub use bbr::{dual_scale_estimate, BbrController};
pub use filter::WindowedMaxFilter;
pub use loss_based::{LossBasedController, LossBasedFlavor};

use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Selectable congestion control algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CongestionAlgorithm {
    Cubic,
    #[default]
    Bbr,
    Bbrv2,
    Bbrv3,
    Reno,
}

impl CongestionAlgorithm {
    /// Whether this algorithm uses the model-based BBR machinery.
    pub fn is_bbr(&self) -> bool {
        matches!(self, Self::Bbr | Self::Bbrv2 | Self::Bbrv3)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cubic => "cubic",
            Self::Bbr => "bbr",
            Self::Bbrv2 => "bbrv2",
            Self::Bbrv3 => "bbrv3",
            Self::Reno => "reno",
        }
    }
}

impl FromStr for CongestionAlgorithm {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cubic" => Ok(Self::Cubic),
            "bbr" => Ok(Self::Bbr),
            "bbrv2" => Ok(Self::Bbrv2),
            "bbrv3" => Ok(Self::Bbrv3),
            "reno" => Ok(Self::Reno),
            _ => Err(ConfigError::UnknownAlgorithm(s.to_string())),
        }
    }
}

impl fmt::Display for CongestionAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Controller phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    /// BBR: exponential growth to find the bottleneck rate.
    Startup,
    /// BBR: drain the queue built during Startup.
    Drain,
    /// BBR: steady state with a periodic probing sub-round.
    ProbeBw,
    /// BBR: minimal window to refresh the propagation delay.
    ProbeRtt,
    /// Loss-based: window doubles every round trip.
    SlowStart,
    /// Loss-based: additive or cubic growth.
    CongestionAvoidance,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Startup => "Startup",
            Self::Drain => "Drain",
            Self::ProbeBw => "ProbeBW",
            Self::ProbeRtt => "ProbeRTT",
            Self::SlowStart => "SlowStart",
            Self::CongestionAvoidance => "CongestionAvoidance",
        };
        f.write_str(name)
    }
}

/// Bytes delivered over a measured interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BandwidthSample {
    pub timestamp: Instant,
    pub delivered_bytes: u64,
    pub interval: Duration,
}

impl BandwidthSample {
    /// Delivery rate in bytes per second; zero for an empty interval.
    pub fn rate(&self) -> u64 {
        let secs = self.interval.as_secs_f64();
        if secs <= 0.0 {
            return 0;
        }
        (self.delivered_bytes as f64 / secs) as u64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RttSample {
    pub timestamp: Instant,
    pub rtt: Duration,
}

/// One batch of acknowledgement feedback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckEvent {
    pub now: Instant,
    /// Bytes newly acknowledged.
    pub acked_bytes: u64,
    /// Bytes newly declared lost.
    pub lost_bytes: u64,
    pub rtt: Option<RttSample>,
    pub delivery: Option<BandwidthSample>,
    /// Bytes still unacknowledged after this batch.
    pub bytes_in_flight: u64,
}

impl AckEvent {
    /// A loss-only event with no delivery feedback.
    pub fn loss(now: Instant, lost_bytes: u64, bytes_in_flight: u64) -> Self {
        Self {
            now,
            acked_bytes: 0,
            lost_bytes,
            rtt: None,
            delivery: None,
            bytes_in_flight,
        }
    }

    /// Whether this event carries a delivery or RTT sample.
    pub fn has_sample(&self) -> bool {
        self.rtt.is_some() || self.delivery.is_some()
    }
}

/// What the pacer needs from the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacingTarget {
    /// Bytes per second.
    pub pacing_rate: u64,
    /// Bytes.
    pub cwnd: u64,
}

/// Read-only view of a controller.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CongestionState {
    pub phase: Phase,
    pub bandwidth_fast: u64,
    pub bandwidth_slow: u64,
    /// Estimate the pacing rate is derived from.
    pub bandwidth_estimate: u64,
    pub min_rtt: Option<Duration>,
    pub cwnd: u64,
    pub pacing_rate: u64,
    pub pacing_gain: f64,
    /// Loss fraction of the last completed round.
    pub loss_rate_window: f64,
}

/// A congestion controller driven by acknowledgement feedback.
pub trait CongestionController: Send + fmt::Debug {
    fn algorithm(&self) -> CongestionAlgorithm;

    /// Feed one batch of acknowledgement feedback.
    fn on_ack(&mut self, event: &AckEvent);

    /// Advance timers with no new feedback.
    fn on_tick(&mut self, now: Instant);

    /// Congestion window in bytes, never below one segment.
    fn cwnd(&self) -> u64;

    /// Pacing rate in bytes per second.
    fn pacing_rate(&self) -> u64;

    fn state(&self) -> CongestionState;

    fn target(&self) -> PacingTarget {
        PacingTarget {
            pacing_rate: self.pacing_rate(),
            cwnd: self.cwnd(),
        }
    }
}

// =============================================================================
// Configuration
// =============================================================================

/// Controller tuning shared by every algorithm.
///
/// Loss-based controllers only read the segment and window sizes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Bytes per full-size datagram.
    pub segment_size: u64,

    /// Window before the first estimate, in segments.
    pub initial_cwnd_segments: u64,

    /// Floor for the window, in segments. Also the ProbeRTT window.
    pub min_cwnd_segments: u64,

    /// RTT assumed until the first sample.
    pub initial_rtt_ms: u64,

    pub startup_gain: f64,
    pub drain_gain: f64,

    /// Pacing gain of the ProbeBW probing sub-round.
    pub probe_bw_gain: f64,

    /// Window gain outside Startup and Drain.
    pub cwnd_gain: f64,

    /// Startup ends after `startup_full_bw_rounds` rounds in which the
    /// estimate grew by less than this factor.
    pub startup_growth_threshold: f64,
    pub startup_full_bw_rounds: u32,

    /// ProbeBW cycle length in rounds; the first round probes.
    pub probe_bw_cycle_rounds: u32,

    pub fast_window_rounds: u64,
    pub slow_window_rounds: u64,

    /// Relative band around the slow estimate inside which the fast
    /// estimate is trusted.
    pub bandwidth_hysteresis: f64,

    /// Overrides the per-algorithm ProbeRTT interval.
    pub probe_rtt_interval_ms: Option<u64>,
    pub probe_rtt_duration_ms: u64,

    /// Per-round loss fraction that triggers a window reduction.
    pub loss_threshold: f64,

    /// Multiplicative decrease applied on a lossy round.
    pub loss_beta: f64,

    /// Time without any sample after which ProbeRTT is forced.
    pub stall_timeout_ms: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            segment_size: 1200,
            initial_cwnd_segments: 10,
            min_cwnd_segments: 4,
            initial_rtt_ms: 100,
            startup_gain: 2.77,
            drain_gain: 0.35,
            probe_bw_gain: 1.25,
            cwnd_gain: 2.0,
            startup_growth_threshold: 1.25,
            startup_full_bw_rounds: 3,
            probe_bw_cycle_rounds: 8,
            fast_window_rounds: 2,
            slow_window_rounds: 10,
            bandwidth_hysteresis: 0.20,
            probe_rtt_interval_ms: None,
            probe_rtt_duration_ms: 200,
            loss_threshold: 0.02,
            loss_beta: 0.7,
            stall_timeout_ms: 1000,
        }
    }
}

impl ControllerConfig {
    /// ProbeRTT interval for `algorithm` unless overridden.
    pub fn probe_rtt_interval(&self, algorithm: CongestionAlgorithm) -> Duration {
        if let Some(ms) = self.probe_rtt_interval_ms {
            return Duration::from_millis(ms);
        }
        match algorithm {
            CongestionAlgorithm::Bbrv2 | CongestionAlgorithm::Bbrv3 => Duration::from_secs(5),
            _ => Duration::from_secs(10),
        }
    }

    pub fn probe_rtt_duration(&self) -> Duration {
        Duration::from_millis(self.probe_rtt_duration_ms)
    }

    pub fn initial_rtt(&self) -> Duration {
        Duration::from_millis(self.initial_rtt_ms.max(1))
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_millis(self.stall_timeout_ms)
    }

    pub fn initial_cwnd(&self) -> u64 {
        self.initial_cwnd_segments.max(1) * self.segment_size
    }

    pub fn min_cwnd(&self) -> u64 {
        self.min_cwnd_segments.max(1) * self.segment_size
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(name: &'static str, reason: &str) -> ConfigError {
            ConfigError::InvalidValue {
                name,
                reason: reason.to_string(),
            }
        }

        if self.segment_size == 0 {
            return Err(invalid("segment_size", "must be positive"));
        }
        if self.min_cwnd_segments == 0 {
            return Err(invalid("min_cwnd_segments", "must be at least 1"));
        }
        if self.initial_cwnd_segments < self.min_cwnd_segments {
            return Err(invalid(
                "initial_cwnd_segments",
                "must not be below min_cwnd_segments",
            ));
        }
        for (name, gain) in [
            ("startup_gain", self.startup_gain),
            ("drain_gain", self.drain_gain),
            ("probe_bw_gain", self.probe_bw_gain),
            ("cwnd_gain", self.cwnd_gain),
        ] {
            if !(gain.is_finite() && gain > 0.0) {
                return Err(invalid(name, "must be a positive number"));
            }
        }
        if !(self.startup_growth_threshold > 1.0) {
            return Err(invalid("startup_growth_threshold", "must exceed 1.0"));
        }
        if self.startup_full_bw_rounds == 0 || self.probe_bw_cycle_rounds == 0 {
            return Err(invalid("rounds", "round counts must be positive"));
        }
        if self.fast_window_rounds == 0 || self.fast_window_rounds > self.slow_window_rounds {
            return Err(invalid(
                "fast_window_rounds",
                "must be positive and not exceed slow_window_rounds",
            ));
        }
        if !(0.0..1.0).contains(&self.bandwidth_hysteresis) {
            return Err(invalid("bandwidth_hysteresis", "must be in [0, 1)"));
        }
        if !(self.loss_threshold > 0.0 && self.loss_threshold < 1.0) {
            return Err(invalid("loss_threshold", "must be in (0, 1)"));
        }
        if !(self.loss_beta > 0.0 && self.loss_beta < 1.0) {
            return Err(invalid("loss_beta", "must be in (0, 1)"));
        }
        if self.stall_timeout_ms == 0 {
            return Err(invalid("stall_timeout_ms", "must be positive"));
        }
        Ok(())
    }
}

/// Instantiate the controller for `algorithm`.
pub fn build(
    algorithm: CongestionAlgorithm,
    config: &ControllerConfig,
    now: Instant,
) -> Box<dyn CongestionController> {
    match algorithm {
        CongestionAlgorithm::Bbr | CongestionAlgorithm::Bbrv2 | CongestionAlgorithm::Bbrv3 => {
            Box::new(BbrController::new(algorithm, config.clone(), now))
        }
        CongestionAlgorithm::Cubic => Box::new(LossBasedController::new(
            LossBasedFlavor::Cubic,
            config.clone(),
        )),
        CongestionAlgorithm::Reno => Box::new(LossBasedController::new(
            LossBasedFlavor::Reno,
            config.clone(),
        )),
    }
}

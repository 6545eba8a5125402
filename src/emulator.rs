//! # Network Emulator
//!
//! A [`DatagramSink`] wrapper that injects loss, duplication, latency and
//! jitter on the send path. Each outbound datagram draws one uniform value
//! `u` in `[0, 1)`:
//!
//! - `u < loss`: dropped;
//! - `u < loss + duplicate`: sent twice;
//! - otherwise sent once.
//!
//! Delayed copies are handed to spawned tokio tasks, so the caller never
//! waits for the configured latency. The random source is a seeded
//! `ChaCha8Rng`; a fixed seed reproduces the exact loss pattern.

use std::fmt;
use std::io;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::error::ConfigError;
use crate::transport::{DatagramFuture, DatagramSink};

// =============================================================================
// Configuration
// =============================================================================

/// Impairments applied to every outbound datagram.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EmulatorConfig {
    /// Drop probability.
    pub loss: f64,
    /// Duplication probability.
    pub duplicate: f64,
    /// Extra one-way delay.
    pub latency: Duration,
    /// Uniform spread applied around `latency`.
    pub jitter: Duration,
    /// Fixed RNG seed; `None` seeds from the clock.
    pub seed: Option<u64>,
}

impl EmulatorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [("emulate_loss", self.loss), ("emulate_dup", self.duplicate)] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::InvalidProbability { name, value });
            }
        }
        if self.loss + self.duplicate > 1.0 {
            return Err(ConfigError::ProbabilitySumExceeded {
                loss: self.loss,
                dup: self.duplicate,
            });
        }
        Ok(())
    }

    /// True when the emulator changes nothing.
    pub fn is_passthrough(&self) -> bool {
        self.loss == 0.0 && self.duplicate == 0.0 && self.latency.is_zero() && self.jitter.is_zero()
    }
}

/// Named impairment presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkProfile {
    Wifi,
    Lte,
    #[serde(rename = "5g")]
    FiveG,
    Satellite,
    Ethernet,
    Fiber,
    Datacenter,
}

impl NetworkProfile {
    pub const ALL: [NetworkProfile; 7] = [
        Self::Wifi,
        Self::Lte,
        Self::FiveG,
        Self::Satellite,
        Self::Ethernet,
        Self::Fiber,
        Self::Datacenter,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Wifi => "wifi",
            Self::Lte => "lte",
            Self::FiveG => "5g",
            Self::Satellite => "satellite",
            Self::Ethernet => "ethernet",
            Self::Fiber => "fiber",
            Self::Datacenter => "datacenter",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::Wifi => "WiFi: variable latency, occasional loss",
            Self::Lte => "4G/LTE mobile link",
            Self::FiveG => "5G mobile link",
            Self::Satellite => "Geostationary satellite: very high latency",
            Self::Ethernet => "Wired LAN",
            Self::Fiber => "Fiber access: low latency, rare loss",
            Self::Datacenter => "Same-datacenter path",
        }
    }

    /// `(latency, jitter, loss)` of the preset.
    fn parameters(&self) -> (Duration, Duration, f64) {
        let ms = Duration::from_millis;
        match self {
            Self::Wifi => (ms(20), ms(5), 0.005),
            Self::Lte => (ms(50), ms(15), 0.01),
            Self::FiveG => (ms(10), ms(3), 0.001),
            Self::Satellite => (ms(600), ms(30), 0.02),
            Self::Ethernet => (ms(1), Duration::ZERO, 0.00001),
            Self::Fiber => (ms(5), ms(1), 0.0001),
            Self::Datacenter => (Duration::from_micros(500), Duration::ZERO, 0.0),
        }
    }

    pub fn latency(&self) -> Duration {
        self.parameters().0
    }

    pub fn jitter(&self) -> Duration {
        self.parameters().1
    }

    pub fn loss(&self) -> f64 {
        self.parameters().2
    }

    /// Emulator settings for this preset, with no duplication.
    pub fn emulator_config(&self, seed: Option<u64>) -> EmulatorConfig {
        let (latency, jitter, loss) = self.parameters();
        EmulatorConfig {
            loss,
            duplicate: 0.0,
            latency,
            jitter,
            seed,
        }
    }
}

impl FromStr for NetworkProfile {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|p| p.name() == wanted)
            .ok_or_else(|| ConfigError::UnknownProfile(s.to_string()))
    }
}

impl fmt::Display for NetworkProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// =============================================================================
// Decision
// =============================================================================

/// What happens to one datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Drop,
    Deliver,
    Duplicate,
}

impl Verdict {
    /// Decide from a uniform draw `u` in `[0, 1)`.
    pub fn from_draw(u: f64, loss: f64, duplicate: f64) -> Self {
        if u < loss {
            Self::Drop
        } else if u < loss + duplicate {
            Self::Duplicate
        } else {
            Self::Deliver
        }
    }

    pub fn copies(&self) -> usize {
        match self {
            Self::Drop => 0,
            Self::Deliver => 1,
            Self::Duplicate => 2,
        }
    }
}

/// Emulator counters.
#[derive(Debug, Default)]
pub struct EmulatorStats {
    offered: AtomicU64,
    dropped: AtomicU64,
    duplicated: AtomicU64,
    delivered: AtomicU64,
}

/// Point-in-time copy of [`EmulatorStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EmulatorCounters {
    /// Datagrams handed to the emulator.
    pub offered: u64,
    pub dropped: u64,
    pub duplicated: u64,
    /// Copies scheduled for delivery, duplicates included.
    pub delivered: u64,
}

impl EmulatorStats {
    pub fn snapshot(&self) -> EmulatorCounters {
        EmulatorCounters {
            offered: self.offered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            duplicated: self.duplicated.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
        }
    }
}

fn clock_seed() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

// =============================================================================
// Emulator
// =============================================================================

/// Impairing wrapper around a sink.
pub struct NetworkEmulator<S> {
    inner: Arc<S>,
    config: EmulatorConfig,
    rng: Mutex<ChaCha8Rng>,
    stats: Arc<EmulatorStats>,
}

impl<S> fmt::Debug for NetworkEmulator<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkEmulator")
            .field("config", &self.config)
            .field("stats", &self.stats.snapshot())
            .finish()
    }
}

impl<S: DatagramSink + 'static> NetworkEmulator<S> {
    /// Wrap `inner` with the given impairments.
    pub fn new(inner: S, config: EmulatorConfig) -> Result<Self, ConfigError> {
        Self::from_arc(Arc::new(inner), config)
    }

    pub fn from_arc(inner: Arc<S>, config: EmulatorConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let seed = config.seed.unwrap_or_else(clock_seed);
        debug!(
            "emulator: loss={} dup={} latency={:?} jitter={:?} seed={}",
            config.loss, config.duplicate, config.latency, config.jitter, seed
        );
        Ok(Self {
            inner,
            config,
            rng: Mutex::new(ChaCha8Rng::seed_from_u64(seed)),
            stats: Arc::new(EmulatorStats::default()),
        })
    }

    pub fn config(&self) -> &EmulatorConfig {
        &self.config
    }

    pub fn stats(&self) -> Arc<EmulatorStats> {
        Arc::clone(&self.stats)
    }

    pub fn inner(&self) -> &Arc<S> {
        &self.inner
    }

    /// Draw the verdict and one delay per copy.
    fn plan(&self) -> (Verdict, [Duration; 2]) {
        let mut rng = self.rng.lock();
        let u: f64 = rng.gen();
        let verdict = Verdict::from_draw(u, self.config.loss, self.config.duplicate);
        let mut delays = [self.config.latency; 2];
        if !self.config.jitter.is_zero() {
            let spread = self.config.jitter.as_secs_f64();
            for delay in delays.iter_mut().take(verdict.copies()) {
                let offset = rng.gen_range(-spread..=spread);
                *delay = Duration::from_secs_f64((self.config.latency.as_secs_f64() + offset).max(0.0));
            }
        }
        (verdict, delays)
    }

    async fn transmit(&self, data: &[u8]) -> io::Result<usize> {
        self.stats.offered.fetch_add(1, Ordering::Relaxed);
        let (verdict, delays) = self.plan();
        trace!("emulator: {:?} ({} bytes)", verdict, data.len());

        match verdict {
            Verdict::Drop => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                // The wire swallowed it; the sender cannot tell.
                return Ok(data.len());
            }
            Verdict::Duplicate => {
                self.stats.duplicated.fetch_add(1, Ordering::Relaxed);
            }
            Verdict::Deliver => {}
        }

        for delay in delays.into_iter().take(verdict.copies()) {
            self.stats.delivered.fetch_add(1, Ordering::Relaxed);
            if delay.is_zero() {
                self.inner.send_datagram(data).await?;
                continue;
            }

            let inner = Arc::clone(&self.inner);
            let datagram = data.to_vec();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if let Err(e) = inner.send_datagram(&datagram).await {
                    debug!("emulator: delayed send failed: {}", e);
                }
            });
        }
        Ok(data.len())
    }
}

impl<S: DatagramSink + 'static> DatagramSink for NetworkEmulator<S> {
    fn send_datagram<'a>(&'a self, data: &'a [u8]) -> DatagramFuture<'a> {
        Box::pin(self.transmit(data))
    }
}

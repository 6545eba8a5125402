//! Rate-limited packet scheduler.
//!
//! The [`Pacer`] owns the connection's [`FecEncoder`]. Each application
//! payload is framed by the encoder; the data packet and, when the payload
//! completes a group, the group's redundancy packets go out in order, each
//! waiting for the congestion window and for [`TokenBucket`] budget at the
//! controller's pacing rate. Redundancy packets are paced exactly like data.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace};

use crate::congestion::PacingTarget;
use crate::error::Result;
use crate::fec::{FecEncoder, Packet, PacketKind};
use crate::metrics::SentLedger;
use crate::transport::DatagramSink;

/// Slowest rate the bucket accepts, in bytes per second.
pub const MIN_PACING_RATE: u64 = 12_000;

/// Burst allowance expressed as time at the current rate.
const BURST_INTERVAL: Duration = Duration::from_millis(2);

/// Poll interval while the congestion window is full.
const CWND_POLL_INTERVAL: Duration = Duration::from_millis(1);

// =============================================================================
// Token bucket
// =============================================================================

/// Byte budget refilled at a fixed rate.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    rate: u64,
    capacity: u64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// A full bucket.
    pub fn new(rate: u64, capacity: u64, now: Instant) -> Self {
        let capacity = capacity.max(1);
        Self {
            rate: rate.max(MIN_PACING_RATE),
            capacity,
            tokens: capacity as f64,
            last_refill: now,
        }
    }

    pub fn rate(&self) -> u64 {
        self.rate
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn tokens(&self) -> f64 {
        self.tokens
    }

    pub fn set_rate(&mut self, rate: u64, now: Instant) {
        self.refill(now);
        self.rate = rate.max(MIN_PACING_RATE);
    }

    pub fn set_capacity(&mut self, capacity: u64) {
        self.capacity = capacity.max(1);
        self.tokens = self.tokens.min(self.capacity as f64);
    }

    pub fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.last_refill = now.max(self.last_refill);
        self.tokens =
            (self.tokens + elapsed.as_secs_f64() * self.rate as f64).min(self.capacity as f64);
    }

    /// Debit `bytes`, or return how long until enough budget accrues.
    ///
    /// A packet larger than the whole bucket goes out once the bucket is
    /// full and leaves the balance negative.
    pub fn try_consume(&mut self, bytes: u64, now: Instant) -> std::result::Result<(), Duration> {
        self.refill(now);
        let needed = bytes.min(self.capacity) as f64;
        if self.tokens >= needed {
            self.tokens -= bytes as f64;
            return Ok(());
        }
        let wait = (needed - self.tokens) / self.rate as f64;
        Err(Duration::from_secs_f64(wait).max(Duration::from_micros(1)))
    }
}

// =============================================================================
// Pacer
// =============================================================================

/// Send-side counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacerStats {
    pub data_packets: u64,
    pub redundancy_packets: u64,
    pub bytes_sent: u64,
    /// Times a packet waited for pacing budget.
    pub pacing_waits: u64,
    /// Times a packet waited for the congestion window.
    pub cwnd_waits: u64,
}

fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

/// Paced sender for one connection.
pub struct Pacer<S> {
    encoder: FecEncoder,
    sink: S,
    bucket: TokenBucket,
    target: watch::Receiver<PacingTarget>,
    ledger: Arc<Mutex<SentLedger>>,
    min_burst: u64,
    stats: PacerStats,
}

impl<S: DatagramSink> Pacer<S> {
    /// Create a pacer that sends through `sink` at the rate published on
    /// `target`, recording every datagram in `ledger`.
    pub fn new(
        encoder: FecEncoder,
        sink: S,
        target: watch::Receiver<PacingTarget>,
        ledger: Arc<Mutex<SentLedger>>,
        segment_size: usize,
    ) -> Self {
        let initial = *target.borrow();
        let min_burst = 2 * segment_size as u64;
        let bucket = TokenBucket::new(
            initial.pacing_rate,
            burst_for(initial.pacing_rate, min_burst),
            now(),
        );
        Self {
            encoder,
            sink,
            bucket,
            target,
            ledger,
            min_burst,
            stats: PacerStats::default(),
        }
    }

    pub fn stats(&self) -> PacerStats {
        self.stats
    }

    pub fn encoder(&self) -> &FecEncoder {
        &self.encoder
    }

    pub fn bucket(&self) -> &TokenBucket {
        &self.bucket
    }

    /// Frame `payload` and transmit the resulting packets.
    ///
    /// Suspends until the window and the pacing budget admit each packet.
    pub async fn send(&mut self, payload: &[u8]) -> Result<()> {
        let packets = self.encoder.submit_at(payload, now())?;
        self.transmit_all(packets).await
    }

    /// Seal the open group and transmit its redundancy.
    pub async fn flush(&mut self) -> Result<()> {
        let packets = self.encoder.flush();
        self.transmit_all(packets).await
    }

    /// Flush the open group if its timeout has passed.
    pub async fn flush_if_due(&mut self) -> Result<()> {
        let packets = self.encoder.flush_if_due(now());
        self.transmit_all(packets).await
    }

    async fn transmit_all(&mut self, packets: Vec<Packet>) -> Result<()> {
        for packet in packets {
            self.transmit(packet).await?;
        }
        Ok(())
    }

    async fn transmit(&mut self, packet: Packet) -> Result<()> {
        let bytes = packet.len() as u64;
        self.wait_for_window(bytes).await;
        self.wait_for_budget(bytes).await;

        self.sink.send_datagram(&packet.datagram).await?;
        self.ledger.lock().on_sent(&packet, now());

        match packet.kind {
            PacketKind::Data => self.stats.data_packets += 1,
            PacketKind::Redundancy => self.stats.redundancy_packets += 1,
        }
        self.stats.bytes_sent += bytes;
        trace!(
            "pacer: sent {:?} g={} i={} ({} bytes)",
            packet.kind,
            packet.group_id,
            packet.index,
            bytes
        );
        Ok(())
    }

    fn apply_target(&mut self) {
        let target = *self.target.borrow_and_update();
        if target.pacing_rate != self.bucket.rate() {
            self.bucket.set_rate(target.pacing_rate, now());
            self.bucket
                .set_capacity(burst_for(target.pacing_rate, self.min_burst));
        }
    }

    async fn wait_for_window(&mut self, bytes: u64) {
        loop {
            let cwnd = self.target.borrow().cwnd;
            let in_flight = self.ledger.lock().bytes_in_flight();
            // An empty pipe always admits one packet.
            if in_flight == 0 || in_flight + bytes <= cwnd {
                return;
            }
            self.stats.cwnd_waits += 1;
            tokio::time::sleep(CWND_POLL_INTERVAL).await;
        }
    }

    async fn wait_for_budget(&mut self, bytes: u64) {
        loop {
            self.apply_target();
            match self.bucket.try_consume(bytes, now()) {
                Ok(()) => return,
                Err(wait) => {
                    self.stats.pacing_waits += 1;
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    /// Send loop: transmits payloads from `input`, flushes partial groups on
    /// their timeout, and stops on `shutdown` or when `input` closes.
    ///
    /// Closing `input` flushes the open group first; `shutdown` does not.
    pub async fn run(
        mut self,
        mut input: mpsc::Receiver<Vec<u8>>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<PacerStats> {
        loop {
            let deadline = self.encoder.flush_deadline();
            let flush_at = deadline
                .map(tokio::time::Instant::from_std)
                .unwrap_or_else(|| tokio::time::Instant::now() + Duration::from_secs(3600));

            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                payload = input.recv() => match payload {
                    Some(payload) => self.send(&payload).await?,
                    None => {
                        self.flush().await?;
                        break;
                    }
                },
                _ = tokio::time::sleep_until(flush_at), if deadline.is_some() => {
                    self.flush_if_due().await?;
                }
            }
        }
        debug!("pacer: stopped, {:?}", self.stats);
        Ok(self.stats)
    }
}

fn burst_for(rate: u64, min_burst: u64) -> u64 {
    ((rate as f64 * BURST_INTERVAL.as_secs_f64()) as u64).max(min_burst)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fec::FecParams;
    use crate::transport::{memory_link, MemorySource};

    fn drain(rx: &MemorySource) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        while let Ok(Some(datagram)) = rx.try_recv() {
            out.push(datagram);
        }
        out
    }

    #[test]
    fn test_bucket_starts_full() {
        let t0 = Instant::now();
        let mut bucket = TokenBucket::new(100_000, 3000, t0);
        assert!(bucket.try_consume(1500, t0).is_ok());
        assert!(bucket.try_consume(1500, t0).is_ok());
        let wait = bucket.try_consume(1500, t0).unwrap_err();
        // 1500 bytes at 100 kB/s
        assert_eq!(wait, Duration::from_millis(15));
    }

    #[test]
    fn test_bucket_refills_at_rate() {
        let t0 = Instant::now();
        let mut bucket = TokenBucket::new(100_000, 3000, t0);
        bucket.try_consume(3000, t0).unwrap();

        assert!(bucket.try_consume(1000, t0 + Duration::from_millis(5)).is_err());
        assert!(bucket.try_consume(1000, t0 + Duration::from_millis(10)).is_ok());

        // Refill is capped at capacity.
        bucket.refill(t0 + Duration::from_secs(10));
        assert_eq!(bucket.tokens(), 3000.0);
    }

    #[test]
    fn test_oversized_packet_borrows() {
        let t0 = Instant::now();
        let mut bucket = TokenBucket::new(100_000, 1000, t0);
        assert!(bucket.try_consume(1500, t0).is_ok());
        assert_eq!(bucket.tokens(), -500.0);
        assert!(bucket.try_consume(100, t0).is_err());
    }

    #[test]
    fn test_rate_floor() {
        let bucket = TokenBucket::new(0, 1000, Instant::now());
        assert_eq!(bucket.rate(), MIN_PACING_RATE);
    }

    fn pacer(
        group_size: u8,
        target: PacingTarget,
    ) -> (
        Pacer<crate::transport::MemorySink>,
        MemorySource,
        watch::Sender<PacingTarget>,
        Arc<Mutex<SentLedger>>,
    ) {
        let (tx, rx) = memory_link();
        let (target_tx, target_rx) = watch::channel(target);
        let ledger = Arc::new(Mutex::new(SentLedger::new()));
        let encoder = FecEncoder::new(FecParams::new(group_size, 0.1).unwrap());
        let pacer = Pacer::new(encoder, tx, target_rx, Arc::clone(&ledger), 1200);
        (pacer, rx, target_tx, ledger)
    }

    #[tokio::test(start_paused = true)]
    async fn test_redundancy_follows_group() {
        let target = PacingTarget {
            pacing_rate: 10_000_000,
            cwnd: 1_000_000,
        };
        let (mut pacer, rx, _target, ledger) = pacer(4, target);

        for i in 0..4u8 {
            pacer.send(&[i; 100]).await.unwrap();
        }
        let sent = drain(&rx);
        assert_eq!(sent.len(), 5);
        assert_eq!(PacketKind::classify(&sent[4]), PacketKind::Redundancy);

        let stats = pacer.stats();
        assert_eq!(stats.data_packets, 4);
        assert_eq!(stats.redundancy_packets, 1);
        assert_eq!(ledger.lock().packets_in_flight(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pacing_spaces_packets() {
        let target = PacingTarget {
            pacing_rate: 100_000,
            cwnd: 10_000_000,
        };
        let (mut pacer, rx, _target, _ledger) = pacer(10, target);

        let start = tokio::time::Instant::now();
        for _ in 0..10 {
            pacer.send(&[0u8; 990]).await.unwrap();
        }
        let elapsed = start.elapsed();

        // 10 KB at 100 kB/s, less the initial 2.4 KB burst.
        assert_eq!(drain(&rx).len(), 11);
        assert!(
            elapsed >= Duration::from_millis(70) && elapsed <= Duration::from_millis(110),
            "elapsed {:?}",
            elapsed
        );
        assert!(pacer.stats().pacing_waits > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_change_applies() {
        let target = PacingTarget {
            pacing_rate: MIN_PACING_RATE,
            cwnd: 10_000_000,
        };
        let (mut pacer, _rx, target_tx, _ledger) = pacer(10, target);

        target_tx.send_replace(PacingTarget {
            pacing_rate: 5_000_000,
            cwnd: 10_000_000,
        });
        pacer.send(&[0u8; 500]).await.unwrap();
        assert_eq!(pacer.bucket().rate(), 5_000_000);
        assert_eq!(pacer.bucket().capacity(), 10_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_blocks_until_acked() {
        let target = PacingTarget {
            pacing_rate: 10_000_000,
            cwnd: 1500,
        };
        let (mut pacer, rx, _target, ledger) = pacer(10, target);

        pacer.send(&[1u8; 1000]).await.unwrap();
        let first = drain(&rx);
        assert_eq!(first.len(), 1);

        let acker = {
            let ledger = Arc::clone(&ledger);
            let key = crate::fec::PacketKey::from_datagram(&first[0]).unwrap();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                ledger.lock().on_ack(key, now());
            })
        };

        let start = tokio::time::Instant::now();
        pacer.send(&[2u8; 1000]).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(30));
        assert!(pacer.stats().cwnd_waits > 0);
        acker.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_flushes_on_timeout_and_close() {
        let target = PacingTarget {
            pacing_rate: 10_000_000,
            cwnd: 10_000_000,
        };
        let (pacer, rx, _target, _ledger) = pacer(10, target);
        let (input_tx, input_rx) = mpsc::channel(16);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(pacer.run(input_rx, shutdown_rx));

        input_tx.send(vec![1; 50]).await.unwrap();
        input_tx.send(vec![2; 50]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(25)).await;

        // Short group sealed by the flush timeout.
        let sent = drain(&rx);
        assert_eq!(sent.len(), 3);
        assert_eq!(PacketKind::classify(&sent[2]), PacketKind::Redundancy);

        input_tx.send(vec![3; 50]).await.unwrap();
        drop(input_tx);
        let stats = task.await.unwrap().unwrap();
        assert_eq!(stats.data_packets, 3);
        assert_eq!(stats.redundancy_packets, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_shutdown() {
        let target = PacingTarget {
            pacing_rate: 10_000_000,
            cwnd: 10_000_000,
        };
        let (pacer, _rx, _target, _ledger) = pacer(10, target);
        let (_input_tx, input_rx) = mpsc::channel::<Vec<u8>>(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(pacer.run(input_rx, shutdown_rx));

        shutdown_tx.send(true).unwrap();
        let stats = task.await.unwrap().unwrap();
        assert_eq!(stats, PacerStats::default());
    }
}

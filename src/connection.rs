//! In-memory connection harness.
//!
//! A [`Connection`] wires one sender and one receiver together over an
//! in-memory link:
//!
//! ```text
//! send() ──> Pacer(FecEncoder) ──> NetworkEmulator ──> link ──> receive loop ──> recv()
//!               ^                                                    │
//!               │ PacingTarget                                       │ (key, arrival)
//!               │                                                    v
//!            MetricsFeed(CongestionController) <── SentLedger <── ack loop
//! ```
//!
//! Every datagram that reaches the receiver is acknowledged back to the
//! sender at its arrival time. The reverse path is loss free and instant,
//! so measured RTT equals the one-way emulated delay.
//!
//! [`Connection::open_udp`] runs the same pipeline over a pair of UDP
//! sockets instead of the in-memory link.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::TransportConfig;
use crate::congestion::{self, CongestionAlgorithm};
use crate::emulator::{EmulatorStats, NetworkEmulator};
use crate::error::{Error, Result};
use crate::fec::protocol::{MAX_PAYLOAD_LEN, REDUNDANCY_FIXED_LEN};
use crate::fec::{DecoderStats, Delivery, FecDecoder, FecEncoder, PacketKey};
use crate::metrics::{MetricsFeed, MetricsSnapshot, SentLedger};
use crate::pacer::Pacer;
use crate::transport::{memory_link, DatagramSink, DatagramSource};

/// Cadence of loss detection and controller timers.
const TICK_INTERVAL: Duration = Duration::from_millis(10);

/// Payloads queued for the pacer before `send` waits.
const SEND_QUEUE_DEPTH: usize = 1024;

/// Largest datagram the encoder can produce.
const MAX_DATAGRAM_LEN: usize = REDUNDANCY_FIXED_LEN + 2 * 256 + MAX_PAYLOAD_LEN;

fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

/// A sender and a receiver joined by an emulated link.
pub struct Connection {
    config: TransportConfig,
    algorithm: CongestionAlgorithm,

    input: mpsc::Sender<Vec<u8>>,
    deliveries: mpsc::UnboundedReceiver<Delivery>,
    metrics: watch::Receiver<MetricsSnapshot>,

    decoder: Arc<FecDecoder>,
    emulator_stats: Arc<EmulatorStats>,

    pacer_task: JoinHandle<()>,
    receive_task: JoinHandle<()>,
    ack_task: JoinHandle<()>,
    cleanup_task: JoinHandle<()>,
    cleanup_shutdown: watch::Sender<bool>,
    // Dropping this stops the pacer loop.
    _pacer_shutdown: watch::Sender<bool>,
}

impl Connection {
    /// Validate `config` and start the connection's tasks.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn open_in_memory(config: TransportConfig) -> Result<Self> {
        let (sink, source) = memory_link();
        Self::open(config, sink, source)
    }

    /// Like [`open_in_memory`](Self::open_in_memory), but datagrams travel
    /// from `sender` to `receiver` over UDP.
    ///
    /// `sender` must be connected to `receiver`'s address. The emulator
    /// still sits in front of `sender`.
    pub fn open_udp(
        config: TransportConfig,
        sender: UdpSocket,
        receiver: UdpSocket,
    ) -> Result<Self> {
        Self::open(config, sender, receiver)
    }

    fn open<S, R>(config: TransportConfig, sink: S, source: R) -> Result<Self>
    where
        S: DatagramSink + 'static,
        R: DatagramSource + 'static,
    {
        config.validate()?;
        let algorithm = config.algorithm()?;
        let params = config.fec_params()?;

        let encoder = FecEncoder::with_config(params, config.flush_timeout(), config.fec_enabled);
        let decoder = Arc::new(FecDecoder::new(config.decoder_config()?));

        let controller = congestion::build(algorithm, &config.controller_config(), now());
        let feed = MetricsFeed::new(controller, decoder.stats());
        let target = feed.pacing_target();
        let metrics = feed.subscribe();

        let emulator = NetworkEmulator::new(sink, config.emulator_config()?)?;
        let emulator_stats = emulator.stats();

        let ledger = Arc::new(Mutex::new(SentLedger::new()));
        let pacer = Pacer::new(
            encoder,
            emulator,
            target,
            Arc::clone(&ledger),
            config.segment_size,
        );

        let (input, input_rx) = mpsc::channel(SEND_QUEUE_DEPTH);
        let (pacer_shutdown, pacer_shutdown_rx) = watch::channel(false);
        let (cleanup_shutdown, cleanup_shutdown_rx) = watch::channel(false);
        let (ack_tx, ack_rx) = mpsc::unbounded_channel();
        let (delivery_tx, deliveries) = mpsc::unbounded_channel();

        let pacer_task = tokio::spawn(async move {
            match pacer.run(input_rx, pacer_shutdown_rx).await {
                Ok(stats) => debug!("connection: pacer finished, {:?}", stats),
                Err(e) => warn!("connection: pacer failed: {}", e),
            }
        });
        let receive_task = tokio::spawn(receive_loop(
            source,
            Arc::clone(&decoder),
            ack_tx,
            delivery_tx,
        ));
        let ack_task = tokio::spawn(ack_loop(feed, ledger, ack_rx));
        let cleanup_task = tokio::spawn(cleanup_loop(
            Arc::clone(&decoder),
            config.cleanup_interval(),
            cleanup_shutdown_rx,
        ));

        info!(
            "connection: opened ({}, K={}, R={}, fec={})",
            algorithm,
            params.group_size(),
            params.repair_count(),
            config.fec_enabled
        );

        Ok(Self {
            config,
            algorithm,
            input,
            deliveries,
            metrics,
            decoder,
            emulator_stats,
            pacer_task,
            receive_task,
            ack_task,
            cleanup_task,
            cleanup_shutdown,
            _pacer_shutdown: pacer_shutdown,
        })
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn algorithm(&self) -> CongestionAlgorithm {
        self.algorithm
    }

    /// Queue one payload for transmission.
    ///
    /// Payloads longer than the segment size are rejected.
    pub async fn send(&self, payload: &[u8]) -> Result<()> {
        if payload.len() > self.config.segment_size {
            return Err(Error::PayloadTooLarge {
                len: payload.len(),
                max: self.config.segment_size,
            });
        }
        self.input
            .send(payload.to_vec())
            .await
            .map_err(|_| Error::ConnectionClosed)
    }

    /// Next payload delivered to the receiver, in arrival order.
    ///
    /// Rebuilt payloads are marked `recovered`. Returns `None` once the
    /// receive side has stopped.
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.deliveries.recv().await
    }

    /// Delivered payload, if one is waiting.
    pub fn try_recv(&mut self) -> Option<Delivery> {
        self.deliveries.try_recv().ok()
    }

    /// Latest published metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        *self.metrics.borrow()
    }

    /// Receiver notified on every metrics update.
    pub fn subscribe(&self) -> watch::Receiver<MetricsSnapshot> {
        self.metrics.clone()
    }

    pub fn decoder_stats(&self) -> Arc<DecoderStats> {
        self.decoder.stats()
    }

    pub fn emulator_stats(&self) -> Arc<EmulatorStats> {
        Arc::clone(&self.emulator_stats)
    }

    /// Tear the connection down.
    ///
    /// Pacer, receive and ack tasks stop immediately; queued and in-flight
    /// payloads are discarded. A running cleanup pass completes, then every
    /// remaining group is evicted.
    pub async fn close(self) {
        self.pacer_task.abort();
        self.receive_task.abort();
        self.ack_task.abort();

        let _ = self.cleanup_shutdown.send(true);
        if let Err(e) = self.cleanup_task.await {
            warn!("connection: cleanup task failed: {}", e);
        }

        let report = self.decoder.drain();
        let counters = self.decoder.stats().snapshot();
        info!(
            "connection: closed, {} groups evicted ({} unrecoverable, {} unverified), {} packets recovered",
            report.evicted,
            counters.unrecoverable_groups,
            counters.unverified_groups,
            counters.recovered_packets
        );
    }
}

async fn receive_loop<R: DatagramSource>(
    source: R,
    decoder: Arc<FecDecoder>,
    acks: mpsc::UnboundedSender<(PacketKey, Instant)>,
    deliveries: mpsc::UnboundedSender<Delivery>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM_LEN];
    loop {
        let len = match source.recv_datagram(&mut buf).await {
            Ok(len) => len,
            Err(e) => {
                debug!("connection: receive loop stopped: {}", e);
                return;
            }
        };
        let datagram = &buf[..len];

        if let Ok(key) = PacketKey::from_datagram(datagram) {
            let _ = acks.send((key, now()));
        }

        match decoder.receive(datagram) {
            Ok(ready) => {
                for delivery in ready {
                    if deliveries.send(delivery).is_err() {
                        return;
                    }
                }
            }
            Err(e) => debug!("connection: dropped datagram: {}", e),
        }
    }
}

async fn ack_loop(
    mut feed: MetricsFeed,
    ledger: Arc<Mutex<SentLedger>>,
    mut acks: mpsc::UnboundedReceiver<(PacketKey, Instant)>,
) {
    let mut ticker = tokio::time::interval(TICK_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            ack = acks.recv() => {
                let Some((key, arrived)) = ack else {
                    break;
                };
                let (outcome, in_flight) = {
                    let mut ledger = ledger.lock();
                    (ledger.on_ack(key, arrived), ledger.bytes_in_flight())
                };
                if let Some(outcome) = outcome {
                    feed.on_ack(&outcome, in_flight, arrived);
                }
            }
            _ = ticker.tick() => {
                let now = now();
                let (report, in_flight) = {
                    let mut ledger = ledger.lock();
                    (ledger.detect_timeouts(now), ledger.bytes_in_flight())
                };
                feed.on_loss(report, in_flight, now);
                feed.on_tick(now);
            }
        }
    }
    debug!(
        "connection: ack loop stopped, {} acked, {} lost",
        feed.packets_acked(),
        feed.packets_lost()
    );
}

async fn cleanup_loop(
    decoder: Arc<FecDecoder>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                let report = decoder.cleanup_groups();
                if report.evicted > 0 {
                    debug!(
                        "connection: cleanup evicted {} groups ({} unrecoverable)",
                        report.evicted, report.unrecoverable
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::congestion::Phase;

    async fn collect(conn: &mut Connection, count: usize) -> Vec<Delivery> {
        let mut out = Vec::with_capacity(count);
        while out.len() < count {
            match tokio::time::timeout(Duration::from_secs(5), conn.recv()).await {
                Ok(Some(delivery)) => out.push(delivery),
                _ => break,
            }
        }
        out
    }

    #[tokio::test(start_paused = true)]
    async fn test_delivers_in_order_without_loss() {
        let mut conn = Connection::open_in_memory(TransportConfig::default()).unwrap();
        for i in 0..25u8 {
            conn.send(&[i; 200]).await.unwrap();
        }

        let got = collect(&mut conn, 25).await;
        assert_eq!(got.len(), 25);
        for (i, delivery) in got.iter().enumerate() {
            assert_eq!(delivery.payload, vec![i as u8; 200]);
            assert!(!delivery.recovered);
        }
        conn.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_under_loss() {
        let config = TransportConfig {
            fec_redundancy: 0.2,
            emulate_loss: 0.05,
            emulator_seed: Some(42),
            emulate_latency_ms: 20,
            ..Default::default()
        };
        let mut conn = Connection::open_in_memory(config).unwrap();
        for i in 0..200u32 {
            conn.send(&i.to_be_bytes().repeat(50)).await.unwrap();
        }

        let mut got = Vec::new();
        while let Ok(Some(delivery)) =
            tokio::time::timeout(Duration::from_millis(500), conn.recv()).await
        {
            got.push(delivery);
        }

        let emulated = conn.emulator_stats().snapshot();
        assert!(emulated.dropped > 0);
        assert!(got.iter().any(|d| d.recovered));
        // Every delivered payload is intact.
        for delivery in &got {
            let index = delivery.group_id * 10 + delivery.packet_index as u64;
            assert_eq!(delivery.payload, (index as u32).to_be_bytes().repeat(50));
        }
        assert!(conn.decoder_stats().recovered_packets() > 0);
        conn.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_metrics_published() {
        let config = TransportConfig {
            emulate_latency_ms: 30,
            emulator_seed: Some(1),
            ..Default::default()
        };
        let mut conn = Connection::open_in_memory(config).unwrap();
        assert_eq!(conn.snapshot().phase, Phase::Startup);

        for i in 0..50u8 {
            conn.send(&[i; 1000]).await.unwrap();
        }
        let _ = collect(&mut conn, 50).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let snapshot = conn.snapshot();
        let rtt = snapshot.rtt_min.unwrap();
        assert!(rtt >= Duration::from_millis(30) && rtt < Duration::from_millis(40));
        assert!(snapshot.cwnd >= 4 * 1200);
        assert!(snapshot.pacing_rate > 0);
        conn.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejects_oversized_payload() {
        let conn = Connection::open_in_memory(TransportConfig::default()).unwrap();
        let err = conn.send(&[0u8; 1201]).await.unwrap_err();
        assert!(matches!(err, Error::PayloadTooLarge { len: 1201, max: 1200 }));
        conn.close().await;
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let config = TransportConfig {
            congestion_control: "vegas".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            Connection::open_in_memory(config),
            Err(Error::Config(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_algorithm_delivers() {
        for name in ["cubic", "reno", "bbr", "bbrv2", "bbrv3"] {
            let config = TransportConfig {
                congestion_control: name.to_string(),
                ..Default::default()
            };
            let mut conn = Connection::open_in_memory(config).unwrap();
            assert_eq!(conn.algorithm().as_str(), name);
            for i in 0..20u8 {
                conn.send(&[i; 100]).await.unwrap();
            }
            assert_eq!(collect(&mut conn, 20).await.len(), 20, "{}", name);
            conn.close().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_without_redundancy() {
        let config = TransportConfig {
            fec_enabled: false,
            ..Default::default()
        };
        let mut conn = Connection::open_in_memory(config).unwrap();
        for i in 0..10u8 {
            conn.send(&[i; 10]).await.unwrap();
        }
        assert_eq!(collect(&mut conn, 10).await.len(), 10);
        tokio::time::sleep(Duration::from_millis(50)).await;
        let counters = conn.decoder_stats().snapshot();
        assert_eq!(counters.redundancy_packets, 0);
        conn.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_flushed_groups_without_redundancy_not_unrecoverable() {
        let config = TransportConfig {
            fec_enabled: false,
            ..Default::default()
        };
        let mut conn = Connection::open_in_memory(config).unwrap();

        // Bursts of three leave a short group behind each flush timeout.
        for burst in 0..5u8 {
            for i in 0..3u8 {
                conn.send(&[burst * 3 + i; 64]).await.unwrap();
            }
            assert_eq!(collect(&mut conn, 3).await.len(), 3);
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let stats = conn.decoder_stats();
        conn.close().await;

        let counters = stats.snapshot();
        assert_eq!(counters.expired_groups, 5);
        assert_eq!(counters.unrecoverable_groups, 0);
        assert_eq!(counters.unverified_groups, 0);
    }

    #[tokio::test]
    async fn test_open_udp_delivers() {
        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender.connect(receiver.local_addr().unwrap()).await.unwrap();
        receiver.connect(sender.local_addr().unwrap()).await.unwrap();

        let mut conn = Connection::open_udp(TransportConfig::default(), sender, receiver).unwrap();
        for i in 0..30u8 {
            conn.send(&[i; 300]).await.unwrap();
        }

        let got = collect(&mut conn, 30).await;
        assert_eq!(got.len(), 30);
        for (i, delivery) in got.iter().enumerate() {
            assert_eq!(delivery.payload, vec![i as u8; 300]);
        }
        assert!(conn.decoder_stats().snapshot().redundancy_packets > 0);
        conn.close().await;
    }
}

//! Push a stream of payloads through an emulated lossy link and report how
//! much the FEC layer recovered.
//!
//! Usage:
//!   cargo run --example lossy_link -- run --profile lte --redundancy 0.2
//!   cargo run --example lossy_link -- run --config link.toml --json
//!   cargo run --example lossy_link -- profiles

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use quicfec::{Connection, NetworkProfile, TransportConfig};
use tracing::{info, Level};

// ============================================================================
// CLI
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "lossy-link")]
#[command(about = "Send data over an emulated lossy link with FEC and paced congestion control")]
struct Args {
    #[command(subcommand)]
    command: Command,

    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send payloads through the emulator and print the outcome
    Run {
        /// TOML configuration file; flags below override it
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Network profile (wifi, lte, 5g, satellite, ethernet, fiber, datacenter)
        #[arg(short, long)]
        profile: Option<String>,

        /// Congestion control algorithm
        #[arg(short, long)]
        algorithm: Option<String>,

        /// Redundancy fraction (0.05 - 0.20)
        #[arg(short, long)]
        redundancy: Option<f64>,

        /// Random loss probability when no profile is given
        #[arg(long)]
        loss: Option<f64>,

        /// Emulator seed
        #[arg(long)]
        seed: Option<u64>,

        /// Number of payloads
        #[arg(short = 'n', long, default_value = "2000")]
        count: usize,

        /// Payload size in bytes
        #[arg(short, long, default_value = "1000")]
        size: usize,

        /// Print the final metrics snapshot as JSON
        #[arg(long)]
        json: bool,
    },

    /// List the built-in network profiles
    Profiles,
}

// ============================================================================
// Run
// ============================================================================

struct RunOptions {
    count: usize,
    size: usize,
    json: bool,
}

async fn run(config: TransportConfig, options: RunOptions) -> Result<()> {
    let mut conn = Connection::open_in_memory(config).context("failed to open connection")?;
    let mut metrics = conn.subscribe();

    let start = Instant::now();
    let mut delivered = 0usize;
    let mut recovered = 0usize;
    let mut received = vec![false; options.count];

    for i in 0..options.count {
        let mut payload = vec![0u8; options.size];
        payload[..4].copy_from_slice(&(i as u32).to_be_bytes());
        conn.send(&payload).await?;

        while let Some(delivery) = conn.try_recv() {
            record(&delivery.payload, delivery.recovered, &mut received, &mut delivered, &mut recovered);
        }
        if metrics.has_changed().unwrap_or(false) && i % 200 == 0 {
            let snapshot = *metrics.borrow_and_update();
            info!(
                "sent {} | phase {} | cwnd {} | pacing {} B/s | loss {:.3}",
                i, snapshot.phase, snapshot.cwnd, snapshot.pacing_rate, snapshot.loss_rate
            );
        }
    }

    // Drain until the link has been quiet for a while.
    while let Ok(Some(delivery)) = tokio::time::timeout(Duration::from_secs(2), conn.recv()).await {
        record(&delivery.payload, delivery.recovered, &mut received, &mut delivered, &mut recovered);
    }

    let elapsed = start.elapsed();
    let snapshot = conn.snapshot();
    let emulated = conn.emulator_stats().snapshot();
    let decoded = conn.decoder_stats().snapshot();
    conn.close().await;

    let missing = received.iter().filter(|r| !**r).count();
    println!();
    println!("=== Results ===");
    println!("Payloads sent:        {}", options.count);
    println!("Delivered:            {} ({} recovered by FEC)", delivered, recovered);
    println!(
        "Residual loss:        {} ({:.2}%)",
        missing,
        missing as f64 * 100.0 / options.count.max(1) as f64
    );
    println!(
        "Link:                 {} offered, {} dropped, {} duplicated",
        emulated.offered, emulated.dropped, emulated.duplicated
    );
    println!(
        "FEC groups:           {} recovered, {} unrecoverable, {} unverified",
        decoded.recovered_groups, decoded.unrecoverable_groups, decoded.unverified_groups
    );
    println!("Elapsed:              {:.2?}", elapsed);

    if options.json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    } else {
        println!("Final metrics:        {:?}", snapshot);
    }
    Ok(())
}

fn record(
    payload: &[u8],
    was_recovered: bool,
    received: &mut [bool],
    delivered: &mut usize,
    recovered: &mut usize,
) {
    let Some(id) = payload.get(..4) else {
        return;
    };
    let id = u32::from_be_bytes([id[0], id[1], id[2], id[3]]) as usize;
    if let Some(slot) = received.get_mut(id) {
        if !*slot {
            *slot = true;
            *delivered += 1;
            if was_recovered {
                *recovered += 1;
            }
        }
    }
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    match args.command {
        Command::Run {
            config,
            profile,
            algorithm,
            redundancy,
            loss,
            seed,
            count,
            size,
            json,
        } => {
            let mut transport = match config {
                Some(path) => TransportConfig::load(&path)
                    .with_context(|| format!("failed to load {}", path.display()))?,
                None => TransportConfig::default(),
            };
            if profile.is_some() {
                transport.network_profile = profile;
            }
            if let Some(algorithm) = algorithm {
                transport.congestion_control = algorithm;
            }
            if let Some(redundancy) = redundancy {
                transport.fec_redundancy = redundancy;
            }
            if let Some(loss) = loss {
                transport.emulate_loss = loss;
            }
            if seed.is_some() {
                transport.emulator_seed = seed;
            }
            anyhow::ensure!(
                (4..=transport.segment_size).contains(&size),
                "payload size must be between 4 and {}",
                transport.segment_size
            );

            run(transport, RunOptions { count, size, json }).await?
        }
        Command::Profiles => {
            for profile in NetworkProfile::ALL {
                println!(
                    "{:<11} {:>7.1?} ±{:<7.1?} loss {:>6.3}%  {}",
                    profile.name(),
                    profile.latency(),
                    profile.jitter(),
                    profile.loss() * 100.0,
                    profile.description()
                );
            }
        }
    }

    Ok(())
}

//! Runs one producer against consumer threads over every tessera primitive
//! and logs throughput and loss.
//!
//! ```bash
//! cargo run --release -p relay -- relay.toml
//! RUST_LOG=debug cargo run --release -p relay
//! ```

use anyhow::{Context, bail, ensure};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tessera_config::RelayConfig;
use tessera_icc::{Backoff, BroadcastWriter, Rcu, ReadStatus, SeqLock, fixed, spsc};
use tracing_subscriber::EnvFilter;

/// Elements per `push_many` on the fixed ring.
const FIXED_BATCH: usize = 16;

/// The broadcast producer republishes the routing table this often.
const ROUTES_EVERY: u64 = 10_000;

#[derive(Debug, Clone, Copy, Default)]
struct Tick {
    seq: u64,
    px: i64,
}

/// Producer progress, published through the seqlock after every message.
#[derive(Debug, Clone, Copy, Default)]
struct Progress {
    published: u64,
    last_len: usize,
}

/// Read-mostly state swapped through RCU.
#[derive(Debug, Clone)]
struct Routes {
    epoch: u64,
    targets: Vec<u16>,
}

fn main() -> anyhow::Result<()> {
    let cfg = match std::env::args().nth(1) {
        Some(path) => RelayConfig::load(path.clone())
            .with_context(|| format!("loading config from {path}"))?,
        None => RelayConfig::default(),
    };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cfg.log_level))
        .context("invalid log level")?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::info!(?cfg, "relay starting");

    run_spsc(&cfg)?;
    run_fixed(&cfg)?;
    run_broadcast(&cfg)?;

    tracing::info!("relay finished");
    Ok(())
}

/// `[seq: u64 LE][seq as u8; ..]`
fn fill_payload(buf: &mut [u8], seq: u64) {
    buf[..8].copy_from_slice(&seq.to_le_bytes());
    buf[8..].fill(seq as u8);
}

fn payload_seq(payload: &[u8]) -> Option<u64> {
    let seq = u64::from_le_bytes(payload.get(..8)?.try_into().ok()?);
    payload[8..].iter().all(|&b| b == seq as u8).then_some(seq)
}

fn rate(count: u64, elapsed: Duration) -> f64 {
    count as f64 / elapsed.as_secs_f64().max(f64::EPSILON)
}

fn run_spsc(cfg: &RelayConfig) -> anyhow::Result<()> {
    let (mut tx, mut rx) = spsc::channel(cfg.spsc_ring()?);
    let messages = cfg.messages;
    let spin_limit = cfg.spin_limit;
    let payload_len = cfg.payload_len;
    let start = Instant::now();

    let received = thread::scope(|s| -> anyhow::Result<u64> {
        s.spawn(move || {
            let mut payload = vec![0u8; payload_len];
            let mut backoff = Backoff::with_spin_limit(spin_limit);
            for seq in 0..messages {
                fill_payload(&mut payload, seq);
                while !tx.push(&payload) {
                    backoff.snooze();
                }
                backoff.reset();
            }
        });

        let consumer = s.spawn(move || -> anyhow::Result<u64> {
            let mut buf = Vec::with_capacity(payload_len);
            let mut backoff = Backoff::with_spin_limit(spin_limit);
            let mut expected = 0u64;
            while expected < messages {
                if !rx.pop_into(&mut buf) {
                    backoff.snooze();
                    continue;
                }
                backoff.reset();
                match payload_seq(&buf) {
                    Some(seq) if seq == expected => expected += 1,
                    other => bail!("spsc: expected seq {expected}, got {other:?}"),
                }
            }
            Ok(expected)
        });

        consumer
            .join()
            .map_err(|_| anyhow::anyhow!("spsc consumer panicked"))?
    })?;

    let elapsed = start.elapsed();
    tracing::info!(
        received,
        ?elapsed,
        msgs_per_sec = rate(received, elapsed),
        "spsc done"
    );
    Ok(())
}

fn run_fixed(cfg: &RelayConfig) -> anyhow::Result<()> {
    let (mut tx, mut rx) = fixed::channel::<Tick>(cfg.fixed_ring()?);
    let messages = cfg.messages;
    let spin_limit = cfg.spin_limit;
    let start = Instant::now();

    let (received, checksum) = thread::scope(|s| -> anyhow::Result<(u64, i64)> {
        s.spawn(move || {
            let mut batch = [Tick::default(); FIXED_BATCH];
            let mut backoff = Backoff::with_spin_limit(spin_limit);
            let mut seq = 0u64;
            while seq < messages {
                let n = FIXED_BATCH.min((messages - seq) as usize);
                for (i, tick) in batch[..n].iter_mut().enumerate() {
                    let s = seq + i as u64;
                    *tick = Tick { seq: s, px: s as i64 };
                }
                while !tx.push_many(&batch[..n]) {
                    backoff.snooze();
                }
                backoff.reset();
                seq += n as u64;
            }
        });

        let consumer = s.spawn(move || -> anyhow::Result<(u64, i64)> {
            let mut backoff = Backoff::with_spin_limit(spin_limit);
            let mut expected = 0u64;
            let mut checksum = 0i64;
            while expected < messages {
                let Some(tick) = rx.pop_one() else {
                    backoff.snooze();
                    continue;
                };
                backoff.reset();
                ensure!(
                    tick.seq == expected,
                    "fixed: expected seq {expected}, got {}",
                    tick.seq
                );
                checksum = checksum.wrapping_add(tick.px);
                expected += 1;
            }
            Ok((expected, checksum))
        });

        consumer
            .join()
            .map_err(|_| anyhow::anyhow!("fixed consumer panicked"))?
    })?;

    let elapsed = start.elapsed();
    tracing::info!(
        received,
        checksum,
        ?elapsed,
        msgs_per_sec = rate(received, elapsed),
        "fixed done"
    );
    Ok(())
}

/// What one broadcast consumer saw.
#[derive(Debug, Default)]
struct ConsumerStats {
    received: u64,
    overrun_events: u64,
    bytes_lost: u64,
    progress_reads: u64,
    routes_epoch: u64,
}

fn run_broadcast(cfg: &RelayConfig) -> anyhow::Result<()> {
    let mut writer = BroadcastWriter::new(cfg.broadcast_ring()?);
    let progress = SeqLock::new(Progress::default());
    let routes = Rcu::with_spin_limit(
        Routes {
            epoch: 0,
            targets: (0..cfg.consumers as u16).collect(),
        },
        cfg.spin_limit,
    );
    let done = AtomicBool::new(false);
    let readers: Vec<_> = (0..cfg.consumers).map(|_| writer.subscribe()).collect();
    let start = Instant::now();

    let stats = thread::scope(|s| -> anyhow::Result<Vec<ConsumerStats>> {
        let consumers: Vec<_> = readers
            .into_iter()
            .enumerate()
            .map(|(id, mut reader)| {
                let (progress, routes, done) = (&progress, &routes, &done);
                let spin_limit = cfg.spin_limit;
                s.spawn(move || -> anyhow::Result<ConsumerStats> {
                    let mut stats = ConsumerStats::default();
                    let mut backoff = Backoff::with_spin_limit(spin_limit);
                    let mut buf = Vec::new();
                    let mut last_seq = None;
                    loop {
                        match reader.try_read_into(&mut buf) {
                            ReadStatus::Ok => {
                                backoff.reset();
                                let seq = payload_seq(&buf)
                                    .with_context(|| format!("consumer {id}: torn message"))?;
                                if let Some(last) = last_seq {
                                    ensure!(seq > last, "consumer {id}: {seq} after {last}");
                                }
                                last_seq = Some(seq);
                                stats.received += 1;
                            }
                            ReadStatus::Overrun { skipped } => {
                                stats.overrun_events += 1;
                                stats.bytes_lost += skipped;
                            }
                            ReadStatus::Empty => {
                                if done.load(Ordering::Acquire) && reader.lag() == 0 {
                                    break;
                                }
                                // Idle: look at the slow-moving state.
                                let p = progress.read();
                                stats.progress_reads += 1;
                                let r = routes.read();
                                ensure!(
                                    r.epoch >= stats.routes_epoch,
                                    "consumer {id}: routes went backwards"
                                );
                                stats.routes_epoch = r.epoch;
                                drop(r);
                                tracing::trace!(id, published = p.published, "consumer idle");
                                backoff.snooze();
                            }
                        }
                    }
                    Ok(stats)
                })
            })
            .collect();

        let mut payload = vec![0u8; cfg.payload_len];
        for seq in 0..cfg.messages {
            fill_payload(&mut payload, seq);
            if let Err(e) = writer.try_push(&payload) {
                done.store(true, Ordering::Release);
                return Err(e).context("broadcast publish");
            }
            progress.write(Progress {
                published: seq + 1,
                last_len: payload.len(),
            });
            if (seq + 1) % ROUTES_EVERY == 0 {
                routes.update(|r| {
                    r.epoch += 1;
                    r.targets.rotate_left(1);
                });
            }
        }
        done.store(true, Ordering::Release);

        consumers
            .into_iter()
            .map(|c| -> anyhow::Result<ConsumerStats> {
                c.join()
                    .map_err(|_| anyhow::anyhow!("broadcast consumer panicked"))?
            })
            .collect()
    })?;

    let elapsed = start.elapsed();
    let last = progress.read();
    tracing::info!(
        published = last.published,
        last_len = last.last_len,
        routes_epoch = routes.read().epoch,
        ?elapsed,
        msgs_per_sec = rate(last.published, elapsed),
        "broadcast done"
    );
    for (id, s) in stats.iter().enumerate() {
        tracing::info!(
            id,
            received = s.received,
            overruns = s.overrun_events,
            bytes_lost = s.bytes_lost,
            progress_reads = s.progress_reads,
            routes_epoch = s.routes_epoch,
            "broadcast consumer"
        );
    }
    Ok(())
}

use std::hint::black_box;
use std::mem::{align_of, size_of};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};

use tessera_icc::{
    BroadcastReader, BroadcastWriter, Rcu, RingConfig, SeqLock, SpscReader, SpscWriter, copy_in,
    fixed, spsc,
};
use tessera_perf::*;

const PAYLOAD_LEN: usize = 64;
const XTHREAD_EVENTS: usize = 200_000;
/// Producer spacing for the latency runs, so samples measure hand-off rather
/// than queueing.
const PACE_NS: u64 = 500;
const FANOUT_READERS: usize = 4;

/// Latency samples and side counters from one cross-thread run.
#[derive(Default, serde::Serialize)]
struct CrossThreadDiag {
    stats: Option<Stats>,
    overruns: u64,
    received: u64,
}

fn main() {
    let rusage_start = Rusage::sample();
    let system = SystemInfo::detect();
    let mut results: Vec<BenchResult> = Vec::new();

    print_banner(&system);
    section_memory_layout(&system);
    section_single_thread(&mut results);

    section_header("CROSS-THREAD LATENCY  (producer stamp \u{2192} consumer read)");
    let spsc_diag = section_spsc_latency(&mut results);
    let broadcast_diag = section_broadcast_latency(&mut results);
    let fanout_diag = section_broadcast_fanout(&mut results);

    let resources = Rusage::sample().since(&rusage_start);
    section_resources(&resources);

    let output = serde_json::json!({
        "report_type": "primitives",
        "system": system,
        "benchmarks": results,
        "cross_thread": {
            "spsc": spsc_diag,
            "broadcast": broadcast_diag,
            "broadcast_fanout": fanout_diag,
        },
        "resources": resources,
    });
    save_results(&output);
}

// ═══════════════════════════════════════════════════════════════════════════
// Banner
// ═══════════════════════════════════════════════════════════════════════════

fn print_banner(system: &SystemInfo) {
    let bar = "\u{2550}".repeat(90);
    println!("\n{bar}");
    println!("  TESSERA PERFORMANCE REPORT");
    println!("  single-thread ops + cross-thread hand-off latency");
    println!("{bar}\n");

    let os = run_cmd("uname", &["-srm"]).unwrap_or_else(|| "unknown".into());
    let date = run_cmd("date", &["+%Y-%m-%d %H:%M:%S"]).unwrap_or_default();

    println!("  CPU:     {}  ({} cores)", system.cpu_brand, system.ncpu);
    println!("  OS:      {}", os.trim());
    println!("  Date:    {}", date.trim());
}

// ═══════════════════════════════════════════════════════════════════════════
// Memory layout
// ═══════════════════════════════════════════════════════════════════════════

fn section_memory_layout(system: &SystemInfo) {
    section_header("MEMORY LAYOUT");

    println!("  Cursor padding:  {} bytes", system.padded_line);
    println!();
    println!("  {:<28} {:>6} {:>6}", "Type", "size", "align");
    println!("  {}", "─".repeat(44));
    let rows: [(&str, usize, usize); 6] = [
        ("SpscWriter", size_of::<SpscWriter>(), align_of::<SpscWriter>()),
        ("SpscReader", size_of::<SpscReader>(), align_of::<SpscReader>()),
        (
            "BroadcastWriter",
            size_of::<BroadcastWriter>(),
            align_of::<BroadcastWriter>(),
        ),
        (
            "BroadcastReader",
            size_of::<BroadcastReader>(),
            align_of::<BroadcastReader>(),
        ),
        ("SeqLock<[u64; 4]>", size_of::<SeqLock<[u64; 4]>>(), align_of::<SeqLock<[u64; 4]>>()),
        ("Rcu<Vec<u64>>", size_of::<Rcu<Vec<u64>>>(), align_of::<Rcu<Vec<u64>>>()),
    ];
    for (name, size, align) in rows {
        println!("  {name:<28} {size:>6} {align:>6}");
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Single-thread operation cost
// ═══════════════════════════════════════════════════════════════════════════

fn section_single_thread(results: &mut Vec<BenchResult>) {
    section_header("SINGLE-THREAD OPERATIONS");
    print_row("Benchmark", QUANTILES.map(|(label, _)| label), "max", "unit");
    println!("  {}", "\u{2500}".repeat(96));

    let payload = make_test_payload(PAYLOAD_LEN);
    let mut buf = Vec::with_capacity(PAYLOAD_LEN);

    let (mut tx, mut rx) = spsc::channel(RingConfig::new(65536));
    push_row(
        results,
        measure_batched("spsc push+pop (64B)", 1000, 100, 10, || {
            tx.push(black_box(&payload));
            black_box(rx.pop_into(&mut buf));
        }),
    );

    let (mut ftx, mut frx) = fixed::channel::<[u64; 4]>(RingConfig::new(1024));
    push_row(
        results,
        measure_batched("fixed push_one+pop_one", 1000, 100, 10, || {
            ftx.push_one(black_box([1, 2, 3, 4]));
            black_box(frx.pop_one());
        }),
    );

    let mut writer = BroadcastWriter::new(RingConfig::new(65536));
    let mut reader = writer.subscribe();
    push_row(
        results,
        measure_batched("broadcast push+read (64B)", 1000, 100, 10, || {
            writer.push(black_box(&payload));
            black_box(reader.try_read_into(&mut buf));
        }),
    );

    let mut ring = vec![0u8; 4096];
    push_row(
        results,
        measure_batched("copy_in split (64B)", 1000, 100, 10, || {
            copy_in(&mut ring, black_box(4096 - 20), &payload);
        }),
    );

    let lock = SeqLock::new([0u64; 4]);
    push_row(
        results,
        measure_batched("seqlock read", 1000, 100, 10, || {
            black_box(lock.read());
        }),
    );
    push_row(
        results,
        measure_batched("seqlock write", 1000, 100, 10, || {
            lock.write(black_box([1, 2, 3, 4]));
        }),
    );

    let rcu = Rcu::new(vec![0u64; 64]);
    push_row(
        results,
        measure_batched("rcu read", 1000, 100, 10, || {
            black_box(rcu.read()[3]);
        }),
    );
    push_row(
        results,
        measure_batched("rcu update (no readers)", 200, 10, 5, || {
            rcu.update(|v| v[0] += 1);
        }),
    );
}

fn push_row(results: &mut Vec<BenchResult>, r: Option<BenchResult>) {
    let Some(r) = r else { return };
    let s = &r.stats;
    print_row(&r.name, s.quantiles, s.max, r.unit);
    results.push(r);
}

// ═══════════════════════════════════════════════════════════════════════════
// Cross-thread latency
// ═══════════════════════════════════════════════════════════════════════════

/// Busy-waits until `PACE_NS` after `last`, returning the new timestamp.
#[inline(always)]
fn pace(last: u64) -> u64 {
    loop {
        let now = mono_now_ns();
        if now >= last + PACE_NS {
            return now;
        }
        std::hint::spin_loop();
    }
}

fn section_spsc_latency(results: &mut Vec<BenchResult>) -> CrossThreadDiag {
    let (mut tx, mut rx) = spsc::channel(RingConfig::new(65536));
    let barrier = Arc::new(Barrier::new(2));
    let b2 = Arc::clone(&barrier);

    let consumer = std::thread::spawn(move || {
        set_thread_affinity(1);
        let mut samples = Vec::with_capacity(XTHREAD_EVENTS);
        let mut buf = Vec::with_capacity(PAYLOAD_LEN);
        b2.wait();
        while samples.len() < XTHREAD_EVENTS {
            if rx.pop_into(&mut buf) {
                let now = mono_now_ns();
                if let Some((_, stamp)) = read_stamp(&buf) {
                    samples.push(now.saturating_sub(stamp));
                }
            } else {
                std::hint::spin_loop();
            }
        }
        samples
    });

    barrier.wait();
    set_thread_affinity(0);
    let mut payload = make_test_payload(PAYLOAD_LEN);
    let mut last = mono_now_ns();
    for seq in 0..XTHREAD_EVENTS as u64 {
        last = pace(last);
        stamp_payload(&mut payload, seq);
        while !tx.push(&payload) {
            std::hint::spin_loop();
        }
    }

    let samples = consumer.join().expect("spsc consumer panicked");
    record_latency(results, "spsc", samples, 0)
}

/// Reads stamped payloads until `done` is set and the reader has caught up.
fn drain_latencies(mut reader: BroadcastReader, done: &AtomicBool) -> (Vec<u64>, u64) {
    let mut samples = Vec::with_capacity(XTHREAD_EVENTS);
    let mut buf = Vec::with_capacity(PAYLOAD_LEN);
    loop {
        match reader.try_read_into(&mut buf) {
            tessera_icc::ReadStatus::Ok => {
                let now = mono_now_ns();
                if let Some((_, stamp)) = read_stamp(&buf) {
                    samples.push(now.saturating_sub(stamp));
                }
            }
            tessera_icc::ReadStatus::Overrun { .. } => {}
            tessera_icc::ReadStatus::Empty => {
                if done.load(Ordering::Acquire) && reader.lag() == 0 {
                    break;
                }
                std::hint::spin_loop();
            }
        }
    }
    (samples, reader.overruns())
}

fn run_broadcast(readers: usize) -> (Vec<u64>, u64) {
    let mut writer = BroadcastWriter::new(RingConfig::new(65536));
    let done = Arc::new(AtomicBool::new(false));
    let barrier = Arc::new(Barrier::new(readers + 1));

    let consumers: Vec<_> = (0..readers)
        .map(|i| {
            let reader = writer.subscribe();
            let done = Arc::clone(&done);
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                set_thread_affinity(i + 1);
                barrier.wait();
                drain_latencies(reader, &done)
            })
        })
        .collect();

    barrier.wait();
    set_thread_affinity(0);
    let mut payload = make_test_payload(PAYLOAD_LEN);
    let mut last = mono_now_ns();
    for seq in 0..XTHREAD_EVENTS as u64 {
        last = pace(last);
        stamp_payload(&mut payload, seq);
        writer.push(&payload);
    }
    done.store(true, Ordering::Release);

    let mut samples = Vec::with_capacity(XTHREAD_EVENTS * readers);
    let mut overruns = 0;
    for c in consumers {
        let (s, o) = c.join().expect("broadcast consumer panicked");
        samples.extend(s);
        overruns += o;
    }
    (samples, overruns)
}

fn section_broadcast_latency(results: &mut Vec<BenchResult>) -> CrossThreadDiag {
    broadcast_section(results, "broadcast", 1)
}

fn section_broadcast_fanout(results: &mut Vec<BenchResult>) -> CrossThreadDiag {
    broadcast_section(results, "broadcast fan-out", FANOUT_READERS)
}

fn broadcast_section(
    results: &mut Vec<BenchResult>,
    label: &str,
    readers: usize,
) -> CrossThreadDiag {
    let (samples, overruns) = run_broadcast(readers);
    record_latency(results, &format!("{label} ({readers} readers)"), samples, overruns)
}

/// Prints and records one cross-thread run.
fn record_latency(
    results: &mut Vec<BenchResult>,
    label: &str,
    mut samples: Vec<u64>,
    overruns: u64,
) -> CrossThreadDiag {
    let received = samples.len() as u64;
    let Some(stats) = Stats::from_samples(&mut samples) else {
        println!("  WARNING: {label} returned no data.");
        return CrossThreadDiag {
            overruns,
            ..Default::default()
        };
    };

    let cols: Vec<String> = QUANTILES
        .iter()
        .zip(stats.quantiles)
        .map(|((name, _), v)| format!("{name}={:>9}", fmt_ns(v)))
        .collect();
    println!("  {label:<30} {}  max={:>9}", cols.join("  "), fmt_ns(stats.max));
    if overruns > 0 {
        println!("    {overruns} bytes lost to overruns");
    }

    results.push(BenchResult {
        name: format!("{label} cross-thread"),
        unit: "ns",
        stats: stats.clone(),
    });
    CrossThreadDiag {
        stats: Some(stats),
        overruns,
        received,
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Resources
// ═══════════════════════════════════════════════════════════════════════════

fn section_resources(used: &Rusage) {
    section_header("RESOURCE USAGE");

    let rows: [(&str, String); 6] = [
        ("Peak RSS", format!("{:.1} MiB", used.peak_rss_kib as f64 / 1024.0)),
        ("Minor page faults", used.minor_faults.to_string()),
        ("Voluntary ctx switches", used.voluntary_switches.to_string()),
        ("Involuntary ctx switches", used.involuntary_switches.to_string()),
        ("User CPU time", format!("{:.3}s", used.user.as_secs_f64())),
        ("System CPU time", format!("{:.3}s", used.system.as_secs_f64())),
    ];
    for (label, value) in rows {
        println!("  {:<28} {value}", format!("{label}:"));
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Save JSON
// ═══════════════════════════════════════════════════════════════════════════

fn save_results(output: &serde_json::Value) {
    let timestamp = run_cmd("date", &["+%Y%m%d_%H%M%S"])
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|| "unknown".into());

    let results_dir = concat!(env!("CARGO_MANIFEST_DIR"), "/results");
    let _ = std::fs::create_dir_all(results_dir);
    let json_path = format!("{results_dir}/{timestamp}_report.json");

    let json = match serde_json::to_string_pretty(output) {
        Ok(json) => json,
        Err(e) => {
            eprintln!("\n  [failed to serialise results: {e}]\n");
            return;
        }
    };
    let bar = "\u{2550}".repeat(90);
    match std::fs::write(&json_path, json) {
        Ok(()) => {
            println!("\n{bar}");
            println!("  Results saved to: {json_path}");
            println!("{bar}\n");
        }
        Err(e) => eprintln!("\n  [failed to save results: {e}]\n"),
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Helpers
// ═══════════════════════════════════════════════════════════════════════════

fn section_header(title: &str) {
    let rule = "\u{2500}".repeat(90);
    println!("\n{rule}\n  {title}\n{rule}\n");
}

/// One line of the single-thread table: name, each quantile, max, unit.
fn print_row<T: std::fmt::Display>(name: &str, quantiles: [T; QUANTILES.len()], max: T, unit: &str) {
    let mut line = format!("  {name:<34}");
    for v in quantiles.iter().chain([&max]) {
        line.push_str(&format!(" {v:>8}"));
    }
    println!("{line}  {unit}");
}

/// Pins the calling thread to core `tag` (Linux only; elsewhere a no-op).
fn set_thread_affinity(tag: usize) {
    #[cfg(target_os = "linux")]
    {
        unsafe {
            let mut set: libc::cpu_set_t = std::mem::zeroed();
            libc::CPU_SET(tag, &mut set);
            libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set);
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = tag;
    }
}

fn run_cmd(cmd: &str, args: &[&str]) -> Option<String> {
    std::process::Command::new(cmd)
        .args(args)
        .output()
        .ok()
        .and_then(|o| {
            if o.status.success() {
                String::from_utf8(o.stdout).ok()
            } else {
                None
            }
        })
}

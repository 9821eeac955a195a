//! Shared measurement helpers for the benches and `perf_report`.

use std::time::{Duration, Instant};

// ─── Statistics ─────────────────────────────────────────────────────────────

/// Quantiles reported for every sample set, as `(label, fraction)`.
pub const QUANTILES: [(&str, f64); 4] = [("p50", 0.50), ("p90", 0.90), ("p99", 0.99), ("p99.9", 0.999)];

/// Summary of one sample set. `quantiles` lines up with [`QUANTILES`].
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Stats {
    pub count: usize,
    pub min: u64,
    pub max: u64,
    pub mean: f64,
    pub stddev: f64,
    pub quantiles: [u64; QUANTILES.len()],
}

impl Stats {
    /// Sorts `samples` in place and summarises them; `None` if there are none.
    pub fn from_samples(samples: &mut [u64]) -> Option<Self> {
        samples.sort_unstable();
        let samples: &[u64] = samples;
        let (&min, &max) = (samples.first()?, samples.last()?);

        let n = samples.len() as f64;
        let (sum, sum_sq) = samples.iter().fold((0f64, 0f64), |(s, sq), &x| {
            let x = x as f64;
            (s + x, sq + x * x)
        });
        let mean = sum / n;
        // Clamp: rounding can leave a tiny negative for constant input.
        let stddev = (sum_sq / n - mean * mean).max(0.0).sqrt();

        Some(Self {
            count: samples.len(),
            min,
            max,
            mean,
            stddev,
            quantiles: QUANTILES.map(|(_, q)| nearest_rank(samples, q)),
        })
    }

    /// Looks a quantile up by its [`QUANTILES`] label.
    pub fn quantile(&self, label: &str) -> Option<u64> {
        QUANTILES
            .iter()
            .position(|&(l, _)| l == label)
            .map(|i| self.quantiles[i])
    }
}

fn nearest_rank(sorted: &[u64], q: f64) -> u64 {
    let rank = (q * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct BenchResult {
    pub name: String,
    pub unit: &'static str,
    pub stats: Stats,
}

// ─── Measurement Harness ────────────────────────────────────────────────────

/// Per-call cost of `f`, sampled once per batch of `batch_size` calls after
/// `warmup` discarded batches. `None` if `batches` is zero.
pub fn measure_batched<F: FnMut()>(
    name: &str,
    batches: usize,
    batch_size: usize,
    warmup: usize,
    mut f: F,
) -> Option<BenchResult> {
    let mut run_batch = || {
        let start = Instant::now();
        (0..batch_size).for_each(|_| f());
        start.elapsed()
    };
    (0..warmup).for_each(|_| {
        run_batch();
    });

    let per_batch = batch_size.max(1) as u128;
    let mut samples: Vec<u64> = (0..batches)
        .map(|_| (run_batch().as_nanos().div_ceil(per_batch) as u64).max(1))
        .collect();

    Some(BenchResult {
        name: name.to_owned(),
        unit: "ns/op",
        stats: Stats::from_samples(&mut samples)?,
    })
}

// ─── Host ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, serde::Serialize)]
pub struct SystemInfo {
    pub cpu_brand: String,
    pub ncpu: usize,
    /// Alignment the cursor words are padded to.
    pub padded_line: usize,
}

impl SystemInfo {
    pub fn detect() -> Self {
        Self {
            cpu_brand: cpu_brand().unwrap_or_else(|| "unknown".into()),
            ncpu: std::thread::available_parallelism().map_or(0, |n| n.get()),
            padded_line: align_of::<crossbeam_utils::CachePadded<u64>>(),
        }
    }
}

#[cfg(target_os = "linux")]
fn cpu_brand() -> Option<String> {
    std::fs::read_to_string("/proc/cpuinfo")
        .ok()?
        .lines()
        .find_map(|l| l.strip_prefix("model name")?.split_once(':'))
        .map(|(_, v)| v.trim().to_owned())
}

#[cfg(not(target_os = "linux"))]
fn cpu_brand() -> Option<String> {
    None
}

/// Process-wide `getrusage` counters.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct Rusage {
    pub peak_rss_kib: u64,
    pub minor_faults: u64,
    pub major_faults: u64,
    pub voluntary_switches: u64,
    pub involuntary_switches: u64,
    pub user: Duration,
    pub system: Duration,
}

impl Rusage {
    pub fn sample() -> Self {
        // SAFETY: rusage is plain old data and getrusage only writes into it
        let mut ru: libc::rusage = unsafe { std::mem::zeroed() };
        if unsafe { libc::getrusage(libc::RUSAGE_SELF, &mut ru) } != 0 {
            return Self::default();
        }
        let tv = |t: libc::timeval| {
            Duration::from_secs(t.tv_sec as u64) + Duration::from_micros(t.tv_usec as u64)
        };
        // macOS reports bytes, Linux KiB.
        let peak_rss_kib = if cfg!(target_os = "macos") {
            ru.ru_maxrss as u64 / 1024
        } else {
            ru.ru_maxrss as u64
        };
        Self {
            peak_rss_kib,
            minor_faults: ru.ru_minflt as u64,
            major_faults: ru.ru_majflt as u64,
            voluntary_switches: ru.ru_nvcsw as u64,
            involuntary_switches: ru.ru_nivcsw as u64,
            user: tv(ru.ru_utime),
            system: tv(ru.ru_stime),
        }
    }

    /// Counters accumulated since `earlier`. Peak RSS is not a counter and is
    /// taken from `self`.
    pub fn since(&self, earlier: &Rusage) -> Rusage {
        Rusage {
            peak_rss_kib: self.peak_rss_kib,
            minor_faults: self.minor_faults.saturating_sub(earlier.minor_faults),
            major_faults: self.major_faults.saturating_sub(earlier.major_faults),
            voluntary_switches: self.voluntary_switches.saturating_sub(earlier.voluntary_switches),
            involuntary_switches: self
                .involuntary_switches
                .saturating_sub(earlier.involuntary_switches),
            user: self.user.saturating_sub(earlier.user),
            system: self.system.saturating_sub(earlier.system),
        }
    }
}

// ─── Clock ──────────────────────────────────────────────────────────────────

/// `CLOCK_MONOTONIC` in nanoseconds; comparable across threads.
#[inline(always)]
pub fn mono_now_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    (ts.tv_sec as u64) * 1_000_000_000 + ts.tv_nsec as u64
}

/// Renders a nanosecond figure in the largest unit that keeps it above one.
pub fn fmt_ns(ns: u64) -> String {
    match ns {
        0..1_000 => format!("{ns} ns"),
        1_000..1_000_000 => format!("{:.1} us", ns as f64 / 1e3),
        _ => format!("{:.1} ms", ns as f64 / 1e6),
    }
}

// ─── Payloads ───────────────────────────────────────────────────────────────

/// Bytes at the front of every benchmark payload: `[seq: u64][stamp_ns: u64]`.
pub const STAMP_LEN: usize = 16;

/// A payload of `len` bytes (at least [`STAMP_LEN`]) with a recognisable fill.
pub fn make_test_payload(len: usize) -> Vec<u8> {
    let len = len.max(STAMP_LEN);
    (0..len).map(|i| i as u8).collect()
}

/// Writes `seq` and the current monotonic time into the payload header.
#[inline(always)]
pub fn stamp_payload(payload: &mut [u8], seq: u64) {
    payload[..8].copy_from_slice(&seq.to_le_bytes());
    payload[8..STAMP_LEN].copy_from_slice(&mono_now_ns().to_le_bytes());
}

/// `(seq, stamp_ns)` from a payload written by [`stamp_payload`].
#[inline(always)]
pub fn read_stamp(payload: &[u8]) -> Option<(u64, u64)> {
    let seq = u64::from_le_bytes(payload.get(..8)?.try_into().ok()?);
    let stamp = u64::from_le_bytes(payload.get(8..STAMP_LEN)?.try_into().ok()?);
    Some((seq, stamp))
}

//! Upload pipeline metrics
//!
//! Lock-free counters, gauges and histograms rendered in Prometheus text
//! format. Shipping them anywhere is left to the embedding process.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Instant;

/// Upload latencies in seconds, from a small part on a fast link to a
/// large part on a slow one
const LATENCY_BOUNDS: &[f64] = &[0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 300.0];

fn write_header(out: &mut String, name: &str, help: &str, kind: &str) {
    let _ = writeln!(out, "# HELP {} {}", name, help);
    let _ = writeln!(out, "# TYPE {} {}", name, kind);
}

/// Monotonic counter
pub struct Counter {
    name: &'static str,
    help: &'static str,
    value: AtomicU64,
}

impl Counter {
    pub fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            name,
            help,
            value: AtomicU64::new(0),
        }
    }

    pub fn inc(&self) {
        self.inc_by(1);
    }

    pub fn inc_by(&self, delta: u64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    fn render(&self, out: &mut String) {
        write_header(out, self.name, self.help, "counter");
        let _ = writeln!(out, "{} {}", self.name, self.get());
    }
}

/// Value that moves both ways, e.g. buffers checked out
pub struct Gauge {
    name: &'static str,
    help: &'static str,
    value: AtomicI64,
}

impl Gauge {
    pub fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            name,
            help,
            value: AtomicI64::new(0),
        }
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        self.value.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }

    fn render(&self, out: &mut String) {
        write_header(out, self.name, self.help, "gauge");
        let _ = writeln!(out, "{} {}", self.name, self.get());
    }
}

/// Latency histogram with cumulative buckets
pub struct Histogram {
    name: &'static str,
    help: &'static str,
    bounds: &'static [f64],
    /// One slot per bound plus the overflow slot
    slots: Vec<AtomicU64>,
    sum_nanos: AtomicU64,
}

impl Histogram {
    /// Histogram over the default latency bounds
    pub fn new(name: &'static str, help: &'static str) -> Self {
        Self::with_bounds(name, help, LATENCY_BOUNDS)
    }

    /// Histogram over ascending `bounds` in seconds
    pub fn with_bounds(name: &'static str, help: &'static str, bounds: &'static [f64]) -> Self {
        Self {
            name,
            help,
            bounds,
            slots: (0..=bounds.len()).map(|_| AtomicU64::new(0)).collect(),
            sum_nanos: AtomicU64::new(0),
        }
    }

    /// Record one observation in seconds
    pub fn observe(&self, secs: f64) {
        let slot = self.bounds.partition_point(|&bound| bound < secs);
        self.slots[slot].fetch_add(1, Ordering::Relaxed);
        self.sum_nanos
            .fetch_add((secs.max(0.0) * 1e9) as u64, Ordering::Relaxed);
    }

    /// Record the time elapsed since `start`
    pub fn observe_since(&self, start: Instant) {
        self.observe(start.elapsed().as_secs_f64());
    }

    /// Observations so far
    pub fn count(&self) -> u64 {
        self.slots.iter().map(|s| s.load(Ordering::Relaxed)).sum()
    }

    fn render(&self, out: &mut String) {
        write_header(out, self.name, self.help, "histogram");
        let mut cumulative = 0;
        for (bound, slot) in self.bounds.iter().zip(&self.slots) {
            cumulative += slot.load(Ordering::Relaxed);
            let _ = writeln!(out, "{}_bucket{{le=\"{}\"}} {}", self.name, bound, cumulative);
        }
        let _ = writeln!(out, "{}_bucket{{le=\"+Inf\"}} {}", self.name, self.count());
        let sum = self.sum_nanos.load(Ordering::Relaxed) as f64 / 1e9;
        let _ = writeln!(out, "{}_sum {}", self.name, sum);
        let _ = writeln!(out, "{}_count {}", self.name, self.count());
    }
}

/// Standard upload pipeline metrics
pub mod standard {
    use super::*;
    use std::sync::LazyLock;

    pub static PARTS_UPLOADED: LazyLock<Counter> = LazyLock::new(|| {
        Counter::new("s3stream_parts_uploaded_total", "Parts acknowledged by UploadPart")
    });

    pub static BYTES_UPLOADED: LazyLock<Counter> = LazyLock::new(|| {
        Counter::new("s3stream_bytes_uploaded_total", "Part bytes acknowledged by UploadPart")
    });

    pub static PART_FAILURES: LazyLock<Counter> = LazyLock::new(|| {
        Counter::new("s3stream_part_failures_total", "Failed UploadPart requests")
    });

    pub static UPLOADS_COMPLETED: LazyLock<Counter> = LazyLock::new(|| {
        Counter::new("s3stream_uploads_completed_total", "Objects completed by writers")
    });

    pub static UPLOADS_ABORTED: LazyLock<Counter> = LazyLock::new(|| {
        Counter::new("s3stream_uploads_aborted_total", "Multipart uploads aborted by writers")
    });

    pub static INFLIGHT_PARTS: LazyLock<Gauge> = LazyLock::new(|| {
        Gauge::new("s3stream_inflight_parts", "Buffers queued on or owned by the upload executor")
    });

    pub static BUFFERS_IN_USE: LazyLock<Gauge> = LazyLock::new(|| {
        Gauge::new("s3stream_buffers_in_use", "Pool buffers checked out")
    });

    pub static PART_UPLOAD_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
        Histogram::new("s3stream_part_upload_duration_seconds", "UploadPart latency")
    });

    pub static CLOSE_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
        Histogram::new("s3stream_close_duration_seconds", "Writer close latency including the final wait")
    });
}

/// Render all standard metrics in Prometheus text format
pub fn gather_metrics() -> String {
    let mut out = String::new();

    for counter in [
        &standard::PARTS_UPLOADED,
        &standard::BYTES_UPLOADED,
        &standard::PART_FAILURES,
        &standard::UPLOADS_COMPLETED,
        &standard::UPLOADS_ABORTED,
    ] {
        counter.render(&mut out);
    }
    standard::INFLIGHT_PARTS.render(&mut out);
    standard::BUFFERS_IN_USE.render(&mut out);
    standard::PART_UPLOAD_DURATION.render(&mut out);
    standard::CLOSE_DURATION.render(&mut out);

    out
}

use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Lightweight in-memory metrics using atomic counters, rendered in the
/// Prometheus text exposition format.
pub struct Metrics {
    total_requests: AtomicU64,
    total_errors: AtomicU64,
    total_prompt_tokens: AtomicU64,
    total_completion_tokens: AtomicU64,
    /// Latency histogram buckets (ms): <100, <500, <1000, <5000, <30000, +Inf.
    latency_buckets: [AtomicU64; 6],
    total_latency_ms: AtomicU64,
    created_at: Instant,
}

const LATENCY_BOUNDS: [&str; 6] = ["100", "500", "1000", "5000", "30000", "+Inf"];

impl Metrics {
    pub fn new() -> Self {
        Self {
            total_requests: AtomicU64::new(0),
            total_errors: AtomicU64::new(0),
            total_prompt_tokens: AtomicU64::new(0),
            total_completion_tokens: AtomicU64::new(0),
            latency_buckets: [
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
            ],
            total_latency_ms: AtomicU64::new(0),
            created_at: Instant::now(),
        }
    }

    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.total_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_latency_ms(&self, ms: u64) {
        let bucket = match ms {
            0..=99 => 0,
            100..=499 => 1,
            500..=999 => 2,
            1000..=4999 => 3,
            5000..=29999 => 4,
            _ => 5,
        };
        self.latency_buckets[bucket].fetch_add(1, Ordering::Relaxed);
        self.total_latency_ms.fetch_add(ms, Ordering::Relaxed);
    }

    pub fn record_tokens(&self, prompt: u64, completion: u64) {
        self.total_prompt_tokens.fetch_add(prompt, Ordering::Relaxed);
        self.total_completion_tokens
            .fetch_add(completion, Ordering::Relaxed);
    }

    /// Render all counters in the Prometheus text format.
    pub fn render_prometheus(&self) -> String {
        let mut out = String::new();
        let counter = |out: &mut String, name: &str, help: &str, value: u64| {
            let _ = writeln!(out, "# HELP {name} {help}");
            let _ = writeln!(out, "# TYPE {name} counter");
            let _ = writeln!(out, "{name} {value}");
        };

        counter(
            &mut out,
            "powerproxy_requests_total",
            "Total dispatched requests.",
            self.total_requests.load(Ordering::Relaxed),
        );
        counter(
            &mut out,
            "powerproxy_errors_total",
            "Requests that ended in a proxy-generated error.",
            self.total_errors.load(Ordering::Relaxed),
        );
        counter(
            &mut out,
            "powerproxy_prompt_tokens_total",
            "Prompt tokens accounted across requests.",
            self.total_prompt_tokens.load(Ordering::Relaxed),
        );
        counter(
            &mut out,
            "powerproxy_completion_tokens_total",
            "Completion tokens accounted across requests.",
            self.total_completion_tokens.load(Ordering::Relaxed),
        );

        let _ = writeln!(
            out,
            "# HELP powerproxy_upstream_latency_ms Upstream roundtrip latency histogram."
        );
        let _ = writeln!(out, "# TYPE powerproxy_upstream_latency_ms histogram");
        let mut cumulative = 0u64;
        for (bucket, bound) in self.latency_buckets.iter().zip(LATENCY_BOUNDS) {
            cumulative += bucket.load(Ordering::Relaxed);
            let _ = writeln!(
                out,
                "powerproxy_upstream_latency_ms_bucket{{le=\"{bound}\"}} {cumulative}"
            );
        }
        let _ = writeln!(
            out,
            "powerproxy_upstream_latency_ms_sum {}",
            self.total_latency_ms.load(Ordering::Relaxed)
        );
        let _ = writeln!(out, "powerproxy_upstream_latency_ms_count {cumulative}");

        let _ = writeln!(out, "# HELP powerproxy_uptime_seconds Seconds since startup.");
        let _ = writeln!(out, "# TYPE powerproxy_uptime_seconds gauge");
        let _ = writeln!(
            out,
            "powerproxy_uptime_seconds {}",
            self.created_at.elapsed().as_secs()
        );
        out
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

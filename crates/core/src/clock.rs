use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock time in millisecond resolution.
///
/// Target cooldowns and rate-limit windows are driven by this trait so tests
/// can run against a controlled clock.
pub trait Clock: Send + Sync {
    /// Current timestamp in milliseconds since the Unix epoch.
    fn now_ms(&self) -> u64;

    /// Current timestamp in whole seconds since the Unix epoch.
    fn now_s(&self) -> u64 {
        self.now_ms() / 1_000
    }
}

/// Uniform samples in `[0, 1)`, used by the non-streaming traffic gate.
pub trait RandomSource: Send + Sync {
    fn sample(&self) -> f64;
}

/// Production clock backed by the system time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// Production random source backed by the thread-local generator.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadRngSource;

impl RandomSource for ThreadRngSource {
    fn sample(&self) -> f64 {
        rand::random::<f64>()
    }
}

/// Settable clock for tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicU64,
}

impl ManualClock {
    pub fn new(now_ms: u64) -> Self {
        Self {
            now_ms: AtomicU64::new(now_ms),
        }
    }

    pub fn set(&self, now_ms: u64) {
        self.now_ms.store(now_ms, Ordering::Relaxed);
    }

    pub fn advance(&self, delta_ms: u64) {
        self.now_ms.fetch_add(delta_ms, Ordering::Relaxed);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now_ms.load(Ordering::Relaxed)
    }
}

/// Scripted random source for tests. Yields the queued samples in order and
/// repeats the last one once the queue is drained.
#[derive(Debug)]
pub struct SequenceRandom {
    samples: Mutex<Vec<f64>>,
    fallback: f64,
}

impl SequenceRandom {
    pub fn new(samples: Vec<f64>) -> Self {
        let fallback = samples.last().copied().unwrap_or(0.0);
        Self {
            samples: Mutex::new(samples),
            fallback,
        }
    }
}

impl RandomSource for SequenceRandom {
    fn sample(&self) -> f64 {
        let mut samples = self.samples.lock().unwrap();
        if samples.is_empty() {
            self.fallback
        } else {
            samples.remove(0)
        }
    }
}

//! Latency aggregation shared by all workers
use std::fmt;

use parking_lot::Mutex;
use rand::{Rng, SeedableRng, rngs::StdRng};
use serde::Serialize;

/// reservoir size for percentile estimates
pub const SAMPLE_SIZE: usize = 1028;

/// Accumulates request latencies
pub trait Histogram: Send + Sync + fmt::Debug {
    /// record one request
    fn update(&self, elapsed_ms: u64);
    /// read out current statistics
    fn snapshot(&self) -> HistogramSnapshot;
}

/// Point-in-time view of a [`Histogram`]
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HistogramSnapshot {
    /// samples recorded
    pub count: u64,
    /// smallest sample
    pub min: u64,
    /// largest sample
    pub max: u64,
    /// arithmetic mean over every sample
    pub mean: f64,
    /// median
    pub p50: u64,
    /// 75th percentile
    pub p75: u64,
    /// 95th percentile
    pub p95: u64,
    /// 99th percentile
    pub p99: u64,
}

/// Exact count/min/max/mean plus a uniform reservoir of [`SAMPLE_SIZE`]
/// samples for percentiles.
#[derive(Debug)]
pub struct LatencyHistogram {
    inner: Mutex<Inner>,
}

#[derive(Debug)]
struct Inner {
    count: u64,
    min: u64,
    max: u64,
    sum: u128,
    sample: Vec<u64>,
    capacity: usize,
    rng: StdRng,
}

impl LatencyHistogram {
    /// histogram with the default reservoir size
    pub fn new() -> Self {
        Self::with_capacity(SAMPLE_SIZE)
    }

    /// histogram keeping at most `capacity` samples
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                count: 0,
                min: 0,
                max: 0,
                sum: 0,
                sample: Vec::with_capacity(capacity),
                capacity: capacity.max(1),
                rng: StdRng::from_entropy(),
            }),
        }
    }
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self::new()
    }
}

impl Histogram for LatencyHistogram {
    fn update(&self, elapsed_ms: u64) {
        let mut h = self.inner.lock();
        h.count += 1;
        h.sum += u128::from(elapsed_ms);
        if h.count == 1 {
            h.min = elapsed_ms;
            h.max = elapsed_ms;
        } else {
            h.min = h.min.min(elapsed_ms);
            h.max = h.max.max(elapsed_ms);
        }
        // reservoir sampling, every sample seen so far is equally likely to be kept
        if h.sample.len() < h.capacity {
            h.sample.push(elapsed_ms);
        } else {
            let count = h.count;
            let idx = h.rng.gen_range(0..count) as usize;
            if idx < h.capacity {
                h.sample[idx] = elapsed_ms;
            }
        }
    }

    fn snapshot(&self) -> HistogramSnapshot {
        let (count, min, max, sum, mut values) = {
            let h = self.inner.lock();
            (h.count, h.min, h.max, h.sum, h.sample.clone())
        };
        if count == 0 {
            return HistogramSnapshot::default();
        }
        values.sort_unstable();
        let p = |q| percentile(&values, q).unwrap_or_default();
        HistogramSnapshot {
            count,
            min,
            max,
            mean: sum as f64 / count as f64,
            p50: p(0.50),
            p75: p(0.75),
            p95: p(0.95),
            p99: p(0.99),
        }
    }
}

/// nearest-rank percentile over sorted `values`
pub fn percentile(values: &[u64], p: f64) -> Option<u64> {
    if values.is_empty() {
        return None;
    }
    let index = ((values.len() - 1) as f64 * p).round() as usize;
    values.get(index).copied()
}

//! # rate-gate
//!
//! Admission control for outgoing requests. A [`RateGate`] holds up to two
//! token buckets, one refilled per second and one refilled per minute. A
//! caller is admitted only once every configured bucket has granted it a
//! cell. Buckets are queried most restrictive first.
#![warn(
    missing_debug_implementations,
    missing_docs,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![allow(clippy::cognitive_complexity)]
use std::{fmt, num::NonZeroU32, time::Duration};

use async_trait::async_trait;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Errors produced by the gate
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum GateError {
    /// the wait was abandoned because the run was cancelled
    #[error("rate gate wait cancelled")]
    Cancelled,
    /// burst size must be at least one
    #[error("rate gate burst must be greater than zero")]
    ZeroBurst,
}

/// Admission rate expressed in events per second. Unlimited is infinite.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct Limit(f64);

impl Limit {
    /// no limit at all
    pub const INFINITE: Limit = Limit(f64::INFINITY);

    /// limit of `events` per `period`
    pub fn new(events: u32, period: Duration) -> Self {
        if events == 0 || period.is_zero() {
            return Self::INFINITE;
        }
        Limit(events as f64 / period.as_secs_f64())
    }

    /// events admitted per second
    pub fn per_second(&self) -> f64 {
        self.0
    }

    /// no ceiling at all
    pub fn is_unlimited(&self) -> bool {
        self.0.is_infinite()
    }
}

impl fmt::Display for Limit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unlimited() {
            write!(f, "unlimited")
        } else {
            write!(f, "{:.3}/s", self.0)
        }
    }
}

/// Something that paces callers.
#[async_trait]
pub trait Limiter: Send + Sync + fmt::Debug {
    /// Wait until the caller may proceed, or until `token` is cancelled.
    async fn wait(&self, token: &CancellationToken) -> Result<(), GateError>;
    /// The effective (most restrictive) limit
    fn limit(&self) -> Limit;
}

/// Arguments used to build a [`RateGate`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GateArgs {
    /// bucket capacity, normally the connection count
    pub burst: u32,
    /// events per second, 0 is unlimited
    pub per_second: u32,
    /// events per minute, 0 is unlimited
    pub per_minute: u32,
}

/// Build a quota that refills `event_count` cells evenly over `duration`.
/// Returns `None` when `event_count` is 0, which means unlimited.
pub fn per(event_count: u32, duration: Duration) -> Option<Quota> {
    if event_count == 0 {
        return None;
    }
    // a period that rounds to zero is faster than we can measure
    Quota::with_period(duration / event_count)
}

struct Bucket {
    name: &'static str,
    limit: Limit,
    rl: DefaultDirectRateLimiter,
}

impl fmt::Debug for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bucket")
            .field("name", &self.name)
            .field("limit", &self.limit)
            .finish()
    }
}

/// Composite per-second/per-minute gate
#[derive(Debug)]
pub struct RateGate {
    buckets: Vec<Bucket>,
}

impl RateGate {
    /// Create a new gate. Rates of 0 leave that bucket out.
    pub fn new(args: GateArgs) -> Result<Self, GateError> {
        let burst = NonZeroU32::new(args.burst).ok_or(GateError::ZeroBurst)?;
        let mut buckets = [
            ("per_second", args.per_second, Duration::from_secs(1)),
            ("per_minute", args.per_minute, Duration::from_secs(60)),
        ]
        .into_iter()
        .filter_map(|(name, count, period)| {
            let quota = per(count, period)?.allow_burst(burst);
            Some(Bucket {
                name,
                limit: Limit::new(count, period),
                rl: RateLimiter::direct(quota),
            })
        })
        .collect::<Vec<_>>();
        // most restrictive first
        buckets.sort_by(|a, b| {
            a.limit
                .partial_cmp(&b.limit)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        debug!(?buckets, %burst, "created rate gate");
        Ok(Self { buckets })
    }

    /// A gate that admits everything immediately
    pub fn unlimited() -> Self {
        Self {
            buckets: Vec::new(),
        }
    }
}

#[async_trait]
impl Limiter for RateGate {
    async fn wait(&self, token: &CancellationToken) -> Result<(), GateError> {
        if token.is_cancelled() {
            return Err(GateError::Cancelled);
        }
        for bucket in &self.buckets {
            tokio::select! {
                biased;
                _ = token.cancelled() => return Err(GateError::Cancelled),
                _ = bucket.rl.until_ready() => {
                    trace!(bucket = bucket.name, "admitted");
                }
            }
        }
        Ok(())
    }

    fn limit(&self) -> Limit {
        self.buckets
            .first()
            .map(|b| b.limit)
            .unwrap_or(Limit::INFINITE)
    }
}

#![allow(missing_docs)] // lazy_static statics dont play nicely with docstrings

//! # metrics
//!
//! process wide request statistics, exported in the prometheus text format
use lazy_static::lazy_static;
use prometheus::{
    Encoder, Histogram, IntCounter, IntCounterVec, IntGauge, TextEncoder, register_histogram,
    register_int_counter, register_int_counter_vec, register_int_gauge,
};

lazy_static! {
    /// requests attempted
    pub static ref REQUESTS_SENT: IntCounter = register_int_counter!("sling_requests_sent", "requests attempted").unwrap();
    /// requests that failed, by cause
    pub static ref REQUEST_FAILURES: IntCounterVec = register_int_counter_vec!(
        "sling_request_failures",
        "requests that failed",
        &["cause"]
    )
    .unwrap();

    /// payload bytes written
    pub static ref BYTES_SENT: IntCounter = register_int_counter!("sling_bytes_sent", "payload bytes sent").unwrap();
    /// response bytes read
    pub static ref BYTES_RECV: IntCounter = register_int_counter!("sling_bytes_recv", "response bytes received").unwrap();

    /// requests currently in flight
    pub static ref IN_FLIGHT: IntGauge = register_int_gauge!("sling_in_flight", "requests in flight").unwrap();

    /// request duration
    pub static ref REQUEST_DURATION: Histogram = register_histogram!(
        "sling_request_duration",
        "request duration (seconds)"
    )
    .unwrap();

    /// saved artifacts that failed to write
    pub static ref SAVE_FAILURES: IntCounter = register_int_counter!("sling_save_failures", "request/response saves that failed").unwrap();
}

/// Gather all registered metrics in the prometheus text format
pub fn gather() -> String {
    let families = prometheus::gather();
    let mut buf = Vec::new();
    if let Err(err) = TextEncoder::new().encode(&families, &mut buf) {
        tracing::error!(?err, "failed to encode metrics");
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// Decrements [`IN_FLIGHT`] when dropped
#[derive(Debug)]
pub struct InFlight(());

impl InFlight {
    pub fn start() -> Self {
        IN_FLIGHT.inc();
        InFlight(())
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        IN_FLIGHT.dec();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_are_registered_and_exposed() {
        REQUESTS_SENT.inc();
        REQUEST_FAILURES.with_label_values(&["dial"]).inc();
        REQUEST_DURATION.observe(0.001);
        {
            let _guard = InFlight::start();
        }
        let text = gather();
        assert!(text.contains("sling_requests_sent"));
        assert!(text.contains("sling_request_failures"));
        assert!(text.contains("sling_request_duration"));
        assert!(text.contains("sling_in_flight"));
    }
}

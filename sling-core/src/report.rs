//! Run report printed at the end of `sling request send`
use serde::Serialize;

use crate::{
    dispatcher::RunSummary,
    histogram::HistogramSnapshot,
    plan::{SendPlan, SendType},
};

/// Where the run sent to
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EndpointSnapshot {
    /// host, IP or HTTP address
    pub address: String,
    /// port number
    pub port: u16,
    /// `tcp` or `http_post`
    #[serde(rename = "type")]
    pub kind: String,
}

/// Request counts
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Totals {
    /// descriptors the planner expected to emit
    pub planned: u64,
    /// requests handed to a worker
    pub attempted: u64,
    /// requests delivered
    pub succeeded: u64,
    /// requests that failed, cancellations excluded
    pub failed: u64,
}

/// Timing figures
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuntimeStats {
    /// wall time of the whole run
    pub duration_ms: u64,
    /// attempted requests per second of wall time
    pub throughput_per_sec: f64,
    /// failed over attempted
    pub error_rate: f64,
    /// transport latency
    pub latency_ms: HistogramSnapshot,
}

/// Everything worth knowing about a finished run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    /// session the run belongs to
    pub session_id: String,
    /// how requests were generated
    pub send_type: SendType,
    /// destination
    pub endpoint: EndpointSnapshot,
    /// max simultaneous requests
    pub concurrency: u32,
    /// the run was cancelled before it finished
    pub cancelled: bool,
    /// request counts
    pub totals: Totals,
    /// timing figures
    pub stats: RuntimeStats,
}

impl RunReport {
    /// Fold a run's summary together with the plan it executed
    pub fn new(plan: &SendPlan, summary: RunSummary) -> Self {
        let secs = summary.duration_ms as f64 / 1000.0;
        let throughput_per_sec = if secs > 0.0 {
            summary.attempted as f64 / secs
        } else {
            0.0
        };
        let error_rate = if summary.attempted > 0 {
            summary.failed as f64 / summary.attempted as f64
        } else {
            0.0
        };
        Self {
            session_id: summary.session_id,
            send_type: summary.send_type,
            endpoint: EndpointSnapshot {
                address: plan.endpoint.address.clone(),
                port: plan.endpoint.port,
                kind: plan.endpoint.kind.to_string(),
            },
            concurrency: plan.concurrency,
            cancelled: summary.cancelled,
            totals: Totals {
                planned: summary.planned,
                attempted: summary.attempted,
                succeeded: summary.succeeded,
                failed: summary.failed,
            },
            stats: RuntimeStats {
                duration_ms: summary.duration_ms,
                throughput_per_sec,
                error_rate,
                latency_ms: summary.latency,
            },
        }
    }

    /// the batch finished without being cancelled
    pub fn completed(&self) -> bool {
        !self.cancelled
    }

    /// multi-line text for the console
    pub fn human_summary(&self) -> String {
        let mut output = String::new();
        output.push_str("sling run report\n");
        output.push_str(&format!(
            "status: {}\n",
            if self.completed() {
                "COMPLETED"
            } else {
                "CANCELLED"
            }
        ));
        output.push_str(&format!(
            "session: {} send_type={:?} concurrency={}\n",
            self.session_id, self.send_type, self.concurrency
        ));
        output.push_str(&format!(
            "endpoint: {}:{} ({})\n",
            self.endpoint.address, self.endpoint.port, self.endpoint.kind
        ));
        output.push_str(&format!(
            "requests: planned={}, attempted={}, succeeded={}, failed={} (rate {:.2}%)\n",
            self.totals.planned,
            self.totals.attempted,
            self.totals.succeeded,
            self.totals.failed,
            self.stats.error_rate * 100.0
        ));
        let latency = &self.stats.latency_ms;
        output.push_str(&format!(
            "timing: duration={}ms throughput={:.2}/s\n",
            self.stats.duration_ms, self.stats.throughput_per_sec
        ));
        output.push_str(&format!(
            "latency: count={} min={}ms mean={:.2}ms max={}ms p50={}ms p75={}ms p95={}ms p99={}ms\n",
            latency.count,
            latency.min,
            latency.mean,
            latency.max,
            latency.p50,
            latency.p75,
            latency.p95,
            latency.p99
        ));
        output
    }
}

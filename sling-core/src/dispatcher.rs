//! Executes a [`SendPlan`]: one direct send, or a batch fanned out over a
//! pool of workers.
//!
//! Every descriptor the planner emits is attempted exactly once. A failing
//! request is logged and counted, it never stops its worker or the batch.
use std::{
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use bytes::Bytes;
use filer::{Filer, FilerError};
use rate_gate::{GateError, Limiter, RateGate};
use serde::Serialize;
use thiserror::Error;
use tokio::{
    sync::{Mutex, mpsc},
    task::{JoinError, JoinSet},
};
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use transport::{Delivery, Transport, TransportError, WriteArgs};

use crate::{
    config::trace::CONSOLE,
    context::RunContext,
    histogram::{Histogram, HistogramSnapshot, LatencyHistogram},
    metrics::{self, InFlight},
    plan::{PlanError, SendPlan, SendType},
    planner::{RequestDescriptor, RequestPlanner},
};

/// Why a single request failed. Contained to that request.
#[derive(Debug, Error)]
pub enum SendError {
    /// the payload could not be read or unpacked
    #[error("failed to read content of {path:?}: {source}")]
    Content {
        /// payload file
        path: PathBuf,
        /// filer error
        #[source]
        source: FilerError,
    },
    /// the transport failed to deliver
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// the rate gate wait failed
    #[error("rate gate: {0}")]
    Gate(#[from] GateError),
    /// the blocking read task panicked or was cancelled
    #[error("blocking task failed: {0}")]
    Join(#[from] JoinError),
}

impl SendError {
    /// the run was cancelled while this request waited or was in flight
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            SendError::Transport(TransportError::Cancelled) | SendError::Gate(GateError::Cancelled)
        )
    }

    /// metric label
    pub fn cause(&self) -> &'static str {
        match self {
            SendError::Content { .. } => "content",
            SendError::Gate(_) => "gate",
            SendError::Join(_) => "task",
            SendError::Transport(err) => match err {
                TransportError::Dial { .. } => "dial",
                TransportError::Write(_) => "write",
                TransportError::Read(_) | TransportError::ResponseTooLarge { .. } => "read",
                TransportError::Timeout { .. } => "timeout",
                TransportError::Http(_) => "http",
                TransportError::Cancelled => "cancelled",
            },
        }
    }
}

/// Result of one request
#[derive(Debug)]
pub struct Outcome {
    /// correlates with logs and saved artifacts
    pub request_id: u64,
    /// time spent in the transport, `None` if it was never called
    pub elapsed: Option<Duration>,
    /// bytes moved, or why the request failed
    pub result: Result<Delivery, SendError>,
}

/// Totals for one run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    /// session the run belongs to
    pub session_id: String,
    /// how requests were generated
    pub send_type: SendType,
    /// descriptors the planner expected to emit
    pub planned: u64,
    /// requests handed to a worker
    pub attempted: u64,
    /// requests delivered
    pub succeeded: u64,
    /// failed requests, excluding those interrupted by cancellation
    pub failed: u64,
    /// the run was cancelled before it finished
    pub cancelled: bool,
    /// wall time of the whole run
    pub duration_ms: u64,
    /// transport latency, milliseconds
    pub latency: HistogramSnapshot,
}

#[derive(Debug, Default)]
struct Tally {
    attempted: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
}

impl Tally {
    fn record(&self, outcome: &Outcome) {
        self.attempted.fetch_add(1, Ordering::Relaxed);
        match &outcome.result {
            Ok(_) => self.succeeded.fetch_add(1, Ordering::Relaxed),
            Err(err) if err.is_cancelled() => 0,
            Err(_) => self.failed.fetch_add(1, Ordering::Relaxed),
        };
    }
}

/// Writes artifacts in the background, on the run's tracker
#[derive(Debug, Clone)]
struct Saver {
    filer: Arc<dyn Filer>,
    tracker: TaskTracker,
}

impl Saver {
    fn spawn(&self, dir: PathBuf, name: String, buf: Bytes) {
        let filer = self.filer.clone();
        self.tracker.spawn_blocking(move || match filer.save(&dir, &name, &buf) {
            Ok(path) => debug!(?path, len = buf.len(), "saved"),
            Err(err) => {
                metrics::SAVE_FAILURES.inc();
                warn!(?err, %name, "failed to save");
            }
        });
    }
}

/// Runs plans. Cheap to clone, clones share the gate, histogram and save tracker.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    filer: Arc<dyn Filer>,
    transport: Arc<dyn Transport>,
    gate: Arc<dyn Limiter>,
    histogram: Arc<dyn Histogram>,
    saver: Saver,
}

impl Dispatcher {
    /// create a dispatcher from its collaborators
    pub fn new(
        filer: Arc<dyn Filer>,
        transport: Arc<dyn Transport>,
        gate: Arc<dyn Limiter>,
        histogram: Arc<dyn Histogram>,
    ) -> Self {
        let saver = Saver {
            filer: filer.clone(),
            tracker: TaskTracker::new(),
        };
        Self {
            filer,
            transport,
            gate,
            histogram,
            saver,
        }
    }

    /// Dispatcher gated by the plan's rate limits, with a fresh [`LatencyHistogram`]
    pub fn for_plan(
        plan: &SendPlan,
        filer: Arc<dyn Filer>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, PlanError> {
        let gate = RateGate::new(plan.gate_args())?;
        debug!(limit = %gate.limit(), "rate gate ready");
        Ok(Self::new(
            filer,
            transport,
            Arc::new(gate),
            Arc::new(LatencyHistogram::new()),
        ))
    }

    /// shared latency histogram
    pub fn histogram(&self) -> &Arc<dyn Histogram> {
        &self.histogram
    }

    /// Execute `plan`. Only planner failures are returned as errors, request
    /// failures are reported in the summary. Pending saves are flushed before
    /// this returns.
    pub async fn run(&self, ctx: &RunContext, plan: &SendPlan) -> Result<RunSummary, PlanError> {
        let start = Instant::now();
        let mut planner = RequestPlanner::new(plan, ctx)?;
        let planned = planner.planned();
        self.prepare_save_dirs(plan);

        let tally = Arc::new(Tally::default());
        match plan.send_type {
            SendType::Single => {
                if let Some(desc) = planner.next() {
                    let outcome = self.send_request(ctx, plan, desc).await;
                    tally.record(&outcome);
                }
            }
            SendType::Repeat | SendType::Multi => {
                self.run_batch(ctx, plan, planner, tally.clone()).await;
            }
        }

        let tracker = &self.saver.tracker;
        tracker.close();
        tracker.wait().await;
        tracker.reopen();

        Ok(RunSummary {
            session_id: ctx.session_id().to_string(),
            send_type: plan.send_type,
            planned,
            attempted: tally.attempted.load(Ordering::Relaxed),
            succeeded: tally.succeeded.load(Ordering::Relaxed),
            failed: tally.failed.load(Ordering::Relaxed),
            cancelled: ctx.is_cancelled(),
            duration_ms: start.elapsed().as_millis() as u64,
            latency: self.histogram.snapshot(),
        })
    }

    async fn run_batch(
        &self,
        ctx: &RunContext,
        plan: &SendPlan,
        planner: RequestPlanner,
        tally: Arc<Tally>,
    ) {
        let capacity = planner.planned().max(1) as usize;
        let (tx, rx) = mpsc::channel(capacity);
        // the queue holds the whole run, fill it before any worker starts
        let producer = tokio::task::spawn_blocking(move || {
            let mut queued = 0_u64;
            for desc in planner {
                if tx.blocking_send(desc).is_err() {
                    break;
                }
                queued += 1;
            }
            queued
        });
        let queued = match producer.await {
            Ok(queued) => queued,
            Err(err) => {
                error!(?err, "request planner task failed");
                return;
            }
        };
        if queued == 0 {
            info!(target: CONSOLE, "no requests to send");
            return;
        }

        let pool = plan.pool_size(queued);
        debug!(queued, pool, "starting workers");
        let rx = Arc::new(Mutex::new(rx));
        let plan = Arc::new(plan.clone());
        let mut workers = JoinSet::new();
        for worker in 0..pool {
            let this = self.clone();
            let ctx = ctx.clone();
            let plan = plan.clone();
            let rx = rx.clone();
            let tally = tally.clone();
            workers.spawn(async move {
                this.worker(worker, &ctx, &plan, &rx, &tally).await;
            });
        }
        while let Some(joined) = workers.join_next().await {
            if let Err(err) = joined {
                error!(?err, "worker task failed");
            }
        }

        info!(
            target: CONSOLE,
            attempted = tally.attempted.load(Ordering::Relaxed),
            succeeded = tally.succeeded.load(Ordering::Relaxed),
            failed = tally.failed.load(Ordering::Relaxed),
            "batch completed"
        );
    }

    async fn worker(
        &self,
        worker: usize,
        ctx: &RunContext,
        plan: &SendPlan,
        rx: &Mutex<mpsc::Receiver<RequestDescriptor>>,
        tally: &Tally,
    ) {
        let token = ctx.token();
        loop {
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => None,
                desc = async { rx.lock().await.recv().await } => desc,
            };
            let Some(desc) = next else {
                break;
            };
            let outcome = self.send_request(ctx, plan, desc).await;
            tally.record(&outcome);

            if !plan.delay.is_zero() {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(plan.delay) => {}
                }
            }
        }
        debug!(worker, "worker done");
    }

    /// Wait on the gate, read the payload, send it. Never fails, the outcome
    /// carries the error and has already been logged.
    pub async fn send_request(
        &self,
        ctx: &RunContext,
        plan: &SendPlan,
        desc: RequestDescriptor,
    ) -> Outcome {
        let request_id = desc.request_id;
        metrics::REQUESTS_SENT.inc();
        let (elapsed, result) = self.attempt(ctx, plan, &desc).await;
        let elapsed_ms = elapsed.map(|d| d.as_millis() as u64);

        match &result {
            Ok(delivery) => {
                metrics::BYTES_SENT.inc_by(delivery.sent as u64);
                metrics::BYTES_RECV.inc_by(delivery.received as u64);
                info!(
                    target: CONSOLE,
                    request_id,
                    path = ?desc.path,
                    elapsed_ms,
                    sent = delivery.sent,
                    received = delivery.received,
                    "request sent successfully"
                );
            }
            Err(err) if err.is_cancelled() => {
                debug!(request_id, "request cancelled");
            }
            Err(err) => {
                metrics::REQUEST_FAILURES
                    .with_label_values(&[err.cause()])
                    .inc();
                error!(
                    target: CONSOLE,
                    request_id,
                    path = ?desc.path,
                    elapsed_ms,
                    %err,
                    "failed to send the request"
                );
            }
        }

        // only transport time counts, failed sends included
        if let Some(elapsed) = elapsed {
            if !result.as_ref().is_err_and(SendError::is_cancelled) {
                self.histogram.update(elapsed.as_millis() as u64);
                metrics::REQUEST_DURATION.observe(elapsed.as_secs_f64());
            }
        }

        Outcome {
            request_id,
            elapsed,
            result,
        }
    }

    async fn attempt(
        &self,
        ctx: &RunContext,
        plan: &SendPlan,
        desc: &RequestDescriptor,
    ) -> (Option<Duration>, Result<Delivery, SendError>) {
        let request_id = desc.request_id;
        if let Err(err) = self.gate.wait(ctx.token()).await {
            return (None, Err(err.into()));
        }
        let payload = match self.read_content(&desc.path).await {
            Ok(payload) => payload,
            Err(err) => return (None, Err(err)),
        };

        let persistence = &plan.persistence;
        if let Some(dir) = &persistence.save_req_dir {
            let base = desc
                .path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();
            self.saver.spawn(
                dir.clone(),
                format!("{request_id:03}.{base}.req"),
                payload.clone(),
            );
        }

        let mut args = WriteArgs::new(plan.endpoint.address.clone(), plan.endpoint.port);
        args.timeouts = plan.timeouts;
        args.request_id = request_id;
        args.cancel = ctx.token().clone();
        if let Some(dir) = &persistence.save_res_dir {
            let saver = self.saver.clone();
            let dir = dir.clone();
            args.on_response = Some(Arc::new(move |body: Bytes| {
                saver.spawn(dir.clone(), format!("{request_id:03}.res"), body);
            }));
        }

        let _in_flight = InFlight::start();
        let start = Instant::now();
        let result = self.transport.send(&payload, &args).await;
        (Some(start.elapsed()), result.map_err(SendError::from))
    }

    async fn read_content(&self, path: &Path) -> Result<Bytes, SendError> {
        let filer = self.filer.clone();
        let owned = path.to_path_buf();
        let content = tokio::task::spawn_blocking(move || filer.read_content(&owned)).await?;
        content
            .map(Bytes::from)
            .map_err(|source| SendError::Content {
                path: path.to_path_buf(),
                source,
            })
    }

    fn prepare_save_dirs(&self, plan: &SendPlan) {
        let persistence = &plan.persistence;
        for dir in [&persistence.save_req_dir, &persistence.save_res_dir]
            .into_iter()
            .flatten()
        {
            if let Err(err) = self.filer.mkdir_all(dir) {
                warn!(?err, ?dir, "failed to create save directory");
            }
        }
    }
}

//! `sling request send`
use std::sync::Arc;

use anyhow::Context;
use config::{SlingConfig, TransportKind};
use sling_core::{
    Dispatcher, RunContext, RunReport, SendPlan,
    config::{cli::SendArgs, trace::CONSOLE},
    filer::FsFiler,
    metrics,
    tokio::{self, signal},
    tracing::*,
    transport::{HttpTransport, TcpTransport, Transport},
};

use crate::Failure;

pub(crate) async fn run(args: SendArgs, mut cfg: SlingConfig) -> Result<(), Failure> {
    let spec = args.to_spec(&mut cfg).map_err(Failure::Config)?;
    let ctx = RunContext::new();
    info!(session_id = %ctx.session_id(), "starting run");

    let filer = Arc::new(FsFiler::new());
    let plan = SendPlan::resolve(spec, &ctx, filer.as_ref())
        .context("failed to plan the run")
        .map_err(Failure::Run)?;
    let transport: Arc<dyn Transport> = match plan.endpoint.kind {
        TransportKind::Tcp => Arc::new(TcpTransport::new()),
        TransportKind::HttpPost => Arc::new(HttpTransport::new()),
    };
    let dispatcher = Dispatcher::for_plan(&plan, filer, transport)
        .context("failed to build dispatcher")
        .map_err(Failure::Config)?;

    let token = ctx.token().clone();
    let interrupt = tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            warn!(target: CONSOLE, "interrupted, cancelling run");
            token.cancel();
        }
    });
    let summary = dispatcher.run(&ctx, &plan).await;
    interrupt.abort();
    let summary = summary.context("run aborted").map_err(Failure::Run)?;

    let report = RunReport::new(&plan, summary);
    if args.log_histogram(&cfg) {
        match serde_json::to_string(&report) {
            Ok(json) => info!(report = %json, "run report"),
            Err(err) => warn!(?err, "failed to serialize report"),
        }
    }
    if args.json {
        let json = serde_json::to_string_pretty(&report)
            .context("failed to serialize report")
            .map_err(Failure::Run)?;
        println!("{json}");
    } else if args.console_histogram(&cfg) {
        print!("{}", report.human_summary());
    }

    let exposition = metrics::gather();
    debug!(metrics = %exposition, "run metrics");
    if let Some(path) = &args.metrics_out {
        std::fs::write(path, exposition)
            .with_context(|| format!("failed to write metrics to {}", path.display()))
            .map_err(Failure::Run)?;
    }
    Ok(())
}

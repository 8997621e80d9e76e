//! # sling
//!
//! Sends files as requests to a TCP or HTTP endpoint. A [`plan::SendPlan`] is
//! resolved once per run, expanded into request descriptors by the
//! [`planner::RequestPlanner`] and executed by the [`dispatcher::Dispatcher`]
//! on a pool of workers gated by a rate limiter.
#![warn(
    missing_debug_implementations,
    missing_docs,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![allow(clippy::cognitive_complexity)]
#![deny(rustdoc::broken_intra_doc_links)]
#![doc(test(
    no_crate_inject,
    attr(deny(warnings, rust_2018_idioms), allow(dead_code, unused_variables))
))]
pub use anyhow;
pub use async_trait::async_trait;
pub use chrono;
pub use filer;
pub use rate_gate;
pub use tokio;
pub use tokio_util;
pub use tracing;
pub use transport;

pub use crate::{
    context::RunContext,
    dispatcher::{Dispatcher, Outcome, RunSummary, SendError},
    plan::{PlanError, SendPlan, SendSpec, SendType},
    report::RunReport,
};

pub mod config;
pub mod context;
pub mod dispatcher;
pub mod histogram;
pub mod metrics;
pub mod plan;
pub mod planner;
pub mod report;

#![allow(clippy::cognitive_complexity)]
use anyhow::{Context, Result};

mod maintenance;
mod send;

use config::SlingConfig;
use sling_core::{
    config::{
        cli::{Cli, Command, ConfigCommand, LogCommand, Parser, RequestCommand},
        trace,
    },
    tokio::{self, runtime::Builder},
    tracing::*,
};

/// Why the process is exiting early
#[derive(Debug)]
pub(crate) enum Failure {
    /// bad config file or arguments
    Config(anyhow::Error),
    /// the run could not be carried out
    Run(anyhow::Error),
}

impl Failure {
    fn code(&self) -> i32 {
        match self {
            Failure::Config(_) => 2,
            Failure::Run(_) => 1,
        }
    }
}

fn main() {
    // parses from cli or environment var
    let cli = Cli::parse();
    let cfg = match setup(&cli) {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("configuration error: {err:#}");
            std::process::exit(2);
        }
    };

    let mut builder = Builder::new_multi_thread();
    // configure thread name & enable IO/time
    builder.thread_name(&cli.thread_name).enable_all();
    // default num threads will be num logical CPUs
    if let Some(num) = cli.threads {
        builder.worker_threads(num);
    }
    let rt = match builder.build() {
        Ok(rt) => rt,
        Err(err) => {
            eprintln!("failed to build runtime: {err:#}");
            std::process::exit(1);
        }
    };

    let result = rt.block_on(async move {
        match tokio::spawn(async move { start(cli.command, cfg).await }).await {
            Ok(result) => result,
            Err(err) => Err(Failure::Run(err.into())),
        }
    });
    match result {
        Ok(()) => debug!("exiting..."),
        Err(failure) => {
            let code = failure.code();
            match failure {
                Failure::Config(err) => eprintln!("configuration error: {err:#}"),
                Failure::Run(err) => eprintln!("run failed: {err:#}"),
            }
            std::process::exit(code);
        }
    }
}

/// Load the config, install tracing, then fold the global flags in.
fn setup(cli: &Cli) -> Result<SlingConfig> {
    let mut cfg = SlingConfig::load(cli.config.as_deref())?;
    if let Some(format) = cli.log_format {
        cfg.log.format = format;
    }
    let handle = trace::Config::from(&cfg)
        .init()
        .context("failed to install tracing")?;
    // levels given on the command line win over the file
    cli.apply_globals(&mut cfg);
    handle.set_log_level(&cfg.log.level)?;
    handle.set_console_level(&cfg.console.level)?;
    handle.set_console_flat(cfg.console.flat);
    debug!(?cli, path = ?cfg.path(), "loaded config");
    Ok(cfg)
}

async fn start(command: Command, cfg: SlingConfig) -> Result<(), Failure> {
    match command {
        Command::Request(RequestCommand::Send(args)) => send::run(args, cfg).await,
        Command::Config(ConfigCommand::View) => maintenance::view_config(&cfg).map_err(Failure::Run),
        Command::Log(LogCommand::View) => maintenance::view_log(&cfg).map_err(Failure::Run),
        Command::Log(LogCommand::Clean) => maintenance::clean(&cfg).map_err(Failure::Run),
    }
}

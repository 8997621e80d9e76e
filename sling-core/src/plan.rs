//! Resolving what a run will send
use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use config::Endpoint;
use filer::Filer;
use rate_gate::{GateArgs, GateError};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;
use transport::Timeouts;

use crate::context::RunContext;

/// Largest repeat count a plan accepts
pub const MAX_REPEAT: u64 = 10_000_000;

/// Errors that abort a run before any request is sent
#[derive(Debug, Error)]
pub enum PlanError {
    /// the wildcard could not be compiled
    #[error("invalid wildcard pattern {pattern:?}: {source}")]
    InvalidPattern {
        /// full pattern including the directory
        pattern: String,
        /// glob compile error
        #[source]
        source: glob::PatternError,
    },
    /// a required file or directory is missing or unreadable
    #[error("source {path:?} unavailable: {reason}")]
    SourceUnavailable {
        /// the offending path
        path: PathBuf,
        /// what was wrong with it
        reason: String,
    },
    /// neither a file nor a directory was given
    #[error("no file or directory to send from")]
    NoSource,
    /// a single-file source turned out to be a directory
    #[error("{0:?} is a directory, expected a file")]
    NotAFile(PathBuf),
    /// the requested repeat count is above [`MAX_REPEAT`]
    #[error("repeat count {repeat} exceeds {max}")]
    RepeatTooLarge {
        /// requested count
        repeat: u64,
        /// ceiling
        max: u64,
    },
    /// the rate gate could not be built
    #[error("failed to build rate gate: {0}")]
    Gate(#[from] GateError),
}

impl PlanError {
    fn unavailable(path: &Path, reason: impl ToString) -> Self {
        PlanError::SourceUnavailable {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        }
    }
}

/// How requests are generated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SendType {
    /// one request, sent directly
    Single,
    /// the same file `repeat` times
    Repeat,
    /// files matching a wildcard in a directory
    Multi,
}

/// Where payloads come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    /// a single resolved file
    File(PathBuf),
    /// `dir/wildcard`
    Glob {
        /// directory searched
        dir: PathBuf,
        /// file name pattern
        wildcard: String,
    },
}

/// Rate ceilings, 0 is unlimited
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimits {
    /// requests per second
    pub per_second: u32,
    /// requests per minute
    pub per_minute: u32,
}

/// Save directories for request and response artifacts. `None` disables saving.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Persistence {
    /// saved requests go here
    pub save_req_dir: Option<PathBuf>,
    /// saved responses go here
    pub save_res_dir: Option<PathBuf>,
}

/// Merged operator input, before any filesystem checks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendSpec {
    /// file to send, selects a single or repeated send
    pub file: Option<PathBuf>,
    /// directory, selects a multi send when no file is given. Also resolves bare file names.
    pub dir: Option<PathBuf>,
    /// file name pattern for multi sends
    pub wildcard: String,
    /// explicitly requested repeat count
    pub repeat: Option<u64>,
    /// repeat count for single files when none was requested
    pub default_repeat: u64,
    /// max simultaneous requests, also the rate limiter burst
    pub concurrency: u32,
    /// bound the worker pool by `concurrency`
    pub cxn_lim: bool,
    /// per-worker pause after each request
    pub delay: Duration,
    /// rate ceilings
    pub rate: RateLimits,
    /// destination
    pub endpoint: Endpoint,
    /// per-request timeouts
    pub timeouts: Timeouts,
    /// save requests under this directory
    pub save_req_dir: Option<PathBuf>,
    /// save responses under this directory
    pub save_res_dir: Option<PathBuf>,
}

/// Immutable description of one run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendPlan {
    /// request generation strategy
    pub send_type: SendType,
    /// where payloads are read from
    pub source: Source,
    /// requested count, 0 means every matched file once (multi only)
    pub repeat: u64,
    /// max simultaneous requests
    pub concurrency: u32,
    /// bound the worker pool by `concurrency`
    pub cxn_lim: bool,
    /// per-worker pause after each request
    pub delay: Duration,
    /// rate ceilings
    pub rate: RateLimits,
    /// destination
    pub endpoint: Endpoint,
    /// per-request timeouts
    pub timeouts: Timeouts,
    /// where artifacts are saved, session scoped
    pub persistence: Persistence,
}

impl SendPlan {
    /// Resolve `spec` against the filesystem.
    ///
    /// An explicit file selects [`SendType::Single`], promoted to
    /// [`SendType::Repeat`] when more than one send is requested. A file that
    /// does not exist is looked up in `dir`. Otherwise `dir` selects
    /// [`SendType::Multi`]. Save directories get the session id appended.
    pub fn resolve(spec: SendSpec, ctx: &RunContext, filer: &dyn Filer) -> Result<Self, PlanError> {
        let (send_type, source, repeat) = match (&spec.file, &spec.dir) {
            (Some(file), dir) => {
                let path = resolve_file(file, dir.as_deref(), filer)?;
                let repeat = spec.repeat.unwrap_or(spec.default_repeat);
                let send_type = if repeat > 1 {
                    SendType::Repeat
                } else {
                    SendType::Single
                };
                (send_type, Source::File(path), repeat.max(1))
            }
            (None, Some(dir)) => {
                if !dir.is_dir() {
                    return Err(PlanError::unavailable(dir, "not a directory"));
                }
                let source = Source::Glob {
                    dir: dir.clone(),
                    wildcard: spec.wildcard.clone(),
                };
                (SendType::Multi, source, spec.repeat.unwrap_or(0))
            }
            (None, None) => return Err(PlanError::NoSource),
        };
        if repeat > MAX_REPEAT {
            return Err(PlanError::RepeatTooLarge {
                repeat,
                max: MAX_REPEAT,
            });
        }

        let concurrency = match send_type {
            SendType::Single => 1,
            _ => spec.concurrency.max(1),
        };
        let session = ctx.session_id();
        let plan = SendPlan {
            send_type,
            source,
            repeat,
            concurrency,
            cxn_lim: spec.cxn_lim,
            delay: spec.delay,
            rate: spec.rate,
            endpoint: spec.endpoint,
            timeouts: spec.timeouts,
            persistence: Persistence {
                save_req_dir: spec.save_req_dir.map(|d| d.join(&**session)),
                save_res_dir: spec.save_res_dir.map(|d| d.join(&**session)),
            },
        };
        debug!(?plan, "resolved send plan");
        Ok(plan)
    }

    /// Worker count for a batch of `total` requests. Every request gets its
    /// own worker unless the pool is explicitly limited.
    pub fn pool_size(&self, total: u64) -> usize {
        let size = if self.cxn_lim {
            u64::from(self.concurrency).min(total)
        } else {
            total
        };
        size.max(1) as usize
    }

    /// arguments for the run's rate gate
    pub fn gate_args(&self) -> GateArgs {
        GateArgs {
            burst: self.concurrency.max(1),
            per_second: self.rate.per_second,
            per_minute: self.rate.per_minute,
        }
    }
}

fn resolve_file(file: &Path, dir: Option<&Path>, filer: &dyn Filer) -> Result<PathBuf, PlanError> {
    if let Ok(meta) = file.metadata() {
        if meta.is_dir() {
            return Err(PlanError::NotAFile(file.to_path_buf()));
        }
        return Ok(file.to_path_buf());
    }
    // only a file name was given, look for it in `dir`
    let dir = dir.ok_or_else(|| PlanError::unavailable(file, "file not found"))?;
    let name = file.to_string_lossy();
    let path = filer
        .build_file_path(dir, &name)
        .map_err(|err| PlanError::unavailable(dir, err))?;
    match path.metadata() {
        Ok(meta) if meta.is_dir() => Err(PlanError::NotAFile(path)),
        Ok(_) => Ok(path),
        Err(err) => Err(PlanError::unavailable(&path, err)),
    }
}

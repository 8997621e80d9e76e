//! Per-run state threaded through planning and dispatch
use std::sync::Arc;

use chrono::{DateTime, Local};
use tokio_util::sync::CancellationToken;

/// Identity and cancellation for one invocation
#[derive(Debug, Clone)]
pub struct RunContext {
    session_id: Arc<str>,
    token: CancellationToken,
}

impl RunContext {
    /// New context with a session id derived from the current time
    pub fn new() -> Self {
        Self::with_session(session_id(Local::now()))
    }

    /// New context with a caller supplied session id
    pub fn with_session(session_id: impl Into<Arc<str>>) -> Self {
        Self {
            session_id: session_id.into(),
            token: CancellationToken::new(),
        }
    }

    /// unique per run, used to name save directories and correlate logs
    pub fn session_id(&self) -> &Arc<str> {
        &self.session_id
    }

    /// token observed by every wait and send in the run
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// abort the run
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// has the run been cancelled
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Default for RunContext {
    fn default() -> Self {
        Self::new()
    }
}

/// timestamp with nanoseconds, e.g. `2019-04-01T10:20:30.123456789`
pub fn session_id<Tz: chrono::TimeZone>(now: DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    now.format("%Y-%m-%dT%H:%M:%S%.9f").to_string()
}

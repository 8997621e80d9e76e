//! # transport
//!
//! Delivers a request payload to an endpoint. Two variants exist: [`TcpTransport`]
//! opens a fresh stream per request and frames the payload with
//! [`MSG_END_SEQUENCE`], [`HttpTransport`] issues a single form POST.
#![warn(
    missing_debug_implementations,
    missing_docs,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![allow(clippy::cognitive_complexity)]
use std::{fmt, future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub use crate::{http::HttpTransport, tcp::TcpTransport};

pub mod http;
pub mod tcp;

/// Called with the response body once it has been fully read. Must not block,
/// implementations are expected to hand the body off to a background task.
pub type ResponseCallback = Arc<dyn Fn(Bytes) + Send + Sync>;

/// The phase of a request a timeout fired in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// dialing the endpoint
    Connect,
    /// writing the payload
    Write,
    /// reading the response
    Read,
    /// the whole request
    Overall,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Connect => "connect",
            Stage::Write => "write",
            Stage::Read => "read",
            Stage::Overall => "overall",
        })
    }
}

/// Why a send failed
#[derive(Debug, Error)]
pub enum TransportError {
    /// the connection could not be opened
    #[error("failed to dial {endpoint}: {source}")]
    Dial {
        /// `address:port` or URL
        endpoint: String,
        /// connect error
        #[source]
        source: std::io::Error,
    },
    /// writing the payload failed
    #[error("write failed: {0}")]
    Write(#[source] std::io::Error),
    /// reading the response failed
    #[error("read failed: {0}")]
    Read(#[source] std::io::Error),
    /// the response outgrew the buffer ceiling
    #[error("response exceeds {limit} bytes")]
    ResponseTooLarge {
        /// ceiling in bytes
        limit: usize,
    },
    /// a timeout fired during `stage`
    #[error("{stage} timed out after {after:?}")]
    Timeout {
        /// where it fired
        stage: Stage,
        /// the bound that expired
        after: Duration,
    },
    /// reqwest failed for a reason other than a timeout
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    /// the run was cancelled mid-send
    #[error("send cancelled")]
    Cancelled,
}

impl TransportError {
    /// any stage timed out
    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Timeout { .. })
    }
}

/// Per-call timeouts, `None` disables the bound
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Timeouts {
    /// whole send, dial through last read
    pub overall: Option<Duration>,
    /// establishing the connection
    pub connect: Option<Duration>,
    /// each read of the response
    pub read: Option<Duration>,
    /// writing the payload
    pub write: Option<Duration>,
}

impl Timeouts {
    /// turn a count of seconds into a bound, 0 meaning none
    pub fn secs(secs: u64) -> Option<Duration> {
        (secs > 0).then(|| Duration::from_secs(secs))
    }
}

/// Everything a transport needs to deliver one request
#[derive(Clone)]
pub struct WriteArgs {
    /// host, IP or HTTP URL
    pub address: String,
    /// destination port
    pub port: u16,
    /// per-stage bounds
    pub timeouts: Timeouts,
    /// for logs only
    pub request_id: u64,
    /// aborts the send at the next await point
    pub cancel: CancellationToken,
    /// receives the response body, if any
    pub on_response: Option<ResponseCallback>,
}

impl WriteArgs {
    /// args for `address:port` with no timeouts and no response callback
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
            timeouts: Timeouts::default(),
            request_id: 0,
            cancel: CancellationToken::new(),
            on_response: None,
        }
    }

    /// `address:port`, for logs and dial errors
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

impl fmt::Debug for WriteArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteArgs")
            .field("address", &self.address)
            .field("port", &self.port)
            .field("timeouts", &self.timeouts)
            .field("request_id", &self.request_id)
            .field("save_response", &self.on_response.is_some())
            .finish()
    }
}

/// Byte counts for one delivered request
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    /// payload bytes written
    pub sent: usize,
    /// response bytes read
    pub received: usize,
}

/// Delivers one payload to one endpoint
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// Send `payload` to the endpoint in `args`. One attempt, no retries.
    async fn send(&self, payload: &[u8], args: &WriteArgs) -> Result<Delivery, TransportError>;
}

/// Bound `fut` by `limit`, reporting expiry as a timeout in `stage`.
pub(crate) async fn bounded<T, F>(
    stage: Stage,
    limit: Option<Duration>,
    fut: F,
) -> Result<T, TransportError>
where
    F: Future<Output = Result<T, TransportError>>,
{
    match limit {
        Some(after) => tokio::time::timeout(after, fut)
            .await
            .map_err(|_| TransportError::Timeout { stage, after })?,
        None => fut.await,
    }
}

/// Apply the overall timeout and cancellation to a whole exchange.
pub(crate) async fn guarded<T, F>(args: &WriteArgs, fut: F) -> Result<T, TransportError>
where
    F: Future<Output = Result<T, TransportError>>,
{
    tokio::select! {
        biased;
        _ = args.cancel.cancelled() => Err(TransportError::Cancelled),
        res = bounded(Stage::Overall, args.timeouts.overall, fut) => res,
    }
}

/// Hand the response body to the callback, if any
pub(crate) fn deliver_response(args: &WriteArgs, body: Bytes) {
    if let Some(cb) = &args.on_response {
        cb(body);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secs_zero_is_none() {
        assert_eq!(Timeouts::secs(0), None);
        assert_eq!(Timeouts::secs(3), Some(Duration::from_secs(3)));
    }

    #[tokio::test]
    async fn test_bounded_times_out() {
        let res: Result<(), _> = bounded(Stage::Read, Some(Duration::from_millis(10)), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(
            res,
            Err(TransportError::Timeout {
                stage: Stage::Read,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_guarded_cancelled() {
        let args = WriteArgs::new("127.0.0.1", 1);
        args.cancel.cancel();
        let res: Result<(), _> = guarded(&args, std::future::pending()).await;
        assert!(matches!(res, Err(TransportError::Cancelled)));
    }
}

//! Stream socket transport. One connection per request:
//! dial, write payload, write [`MSG_END_SEQUENCE`], read until the peer closes.
use std::io;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};
use tracing::{debug, trace};

use crate::{
    Delivery, Stage, Transport, TransportError, WriteArgs, bounded, deliver_response, guarded,
};

/// appended after every payload so the peer can frame the request
pub const MSG_END_SEQUENCE: &[u8] = b"\r\n\r\n";
/// response buffer ceiling
pub const MAX_MSG_SIZE: usize = 64 * 1024 * 1024;
/// read chunk size
pub const BUFFER_SIZE: usize = 1024;

/// Raw TCP sender, stateless
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpTransport;

impl TcpTransport {
    /// a new tcp transport
    pub fn new() -> Self {
        Self
    }

    async fn exchange(&self, payload: &[u8], args: &WriteArgs) -> Result<Delivery, TransportError> {
        let timeouts = args.timeouts;
        let mut stream = bounded(Stage::Connect, timeouts.connect, async {
            TcpStream::connect((args.address.as_str(), args.port))
                .await
                .map_err(|source| TransportError::Dial {
                    endpoint: args.endpoint(),
                    source,
                })
        })
        .await?;
        trace!(request_id = args.request_id, peer = ?stream.peer_addr().ok(), "connected");

        bounded(Stage::Write, timeouts.write, async {
            write_framed(&mut stream, payload)
                .await
                .map_err(TransportError::Write)
        })
        .await?;

        let body = bounded(Stage::Read, timeouts.read, read_to_close(&mut stream)).await?;
        let delivery = Delivery {
            sent: payload.len() + MSG_END_SEQUENCE.len(),
            received: body.len(),
        };
        debug!(request_id = args.request_id, ?delivery, "tcp exchange complete");
        deliver_response(args, Bytes::from(body));
        Ok(delivery)
    }
}

async fn write_framed(stream: &mut TcpStream, payload: &[u8]) -> io::Result<()> {
    stream.write_all(payload).await?;
    stream.write_all(MSG_END_SEQUENCE).await?;
    stream.flush().await
}

// peer closing the connection (EOF) ends the response
async fn read_to_close(stream: &mut TcpStream) -> Result<Vec<u8>, TransportError> {
    let mut resp = Vec::with_capacity(MAX_MSG_SIZE);
    let mut chunk = [0u8; BUFFER_SIZE];
    loop {
        let n = stream
            .read(&mut chunk)
            .await
            .map_err(TransportError::Read)?;
        if n == 0 {
            break;
        }
        if resp.len() + n > MAX_MSG_SIZE {
            return Err(TransportError::ResponseTooLarge {
                limit: MAX_MSG_SIZE,
            });
        }
        resp.extend_from_slice(&chunk[..n]);
    }
    Ok(resp)
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&self, payload: &[u8], args: &WriteArgs) -> Result<Delivery, TransportError> {
        guarded(args, self.exchange(payload, args)).await
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use parking_lot::Mutex;
    use tokio::{net::TcpListener, sync::oneshot};
    use tracing_test::traced_test;

    use super::*;
    use crate::Timeouts;

    // accepts one connection, reads up to the end marker, replies and closes
    async fn echo_server(reply: &'static [u8]) -> (u16, oneshot::Receiver<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.expect("accept");
            let mut got = Vec::new();
            let mut buf = [0u8; 256];
            while !got.ends_with(MSG_END_SEQUENCE) {
                let n = sock.read(&mut buf).await.expect("read");
                if n == 0 {
                    break;
                }
                got.extend_from_slice(&buf[..n]);
            }
            sock.write_all(reply).await.expect("reply");
            drop(sock);
            let _ = tx.send(got);
        });
        (port, rx)
    }

    #[tokio::test]
    #[traced_test]
    async fn test_payload_framed_and_response_captured() {
        let (port, rx) = echo_server(b"ACK").await;
        let saved = Arc::new(Mutex::new(None));
        let sink = saved.clone();
        let mut args = WriteArgs::new("127.0.0.1", port);
        args.request_id = 7;
        args.on_response = Some(Arc::new(move |body: Bytes| {
            *sink.lock() = Some(body);
        }));

        let delivery = TcpTransport::new()
            .send(b"hello", &args)
            .await
            .expect("send");
        assert_eq!(rx.await.expect("server"), b"hello\r\n\r\n");
        assert_eq!(
            delivery,
            Delivery {
                sent: 9,
                received: 3
            }
        );
        assert_eq!(saved.lock().as_deref(), Some(&b"ACK"[..]));
        assert!(logs_contain("tcp exchange complete"));
    }

    #[tokio::test]
    async fn test_empty_response_is_ok() {
        let (port, _rx) = echo_server(b"").await;
        let args = WriteArgs::new("127.0.0.1", port);
        let delivery = TcpTransport::new().send(b"", &args).await.expect("send");
        assert_eq!(delivery.received, 0);
    }

    #[tokio::test]
    async fn test_dial_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        drop(listener);
        let err = TcpTransport::new()
            .send(b"x", &WriteArgs::new("127.0.0.1", port))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Dial { .. }), "{err:?}");
    }

    #[tokio::test]
    async fn test_read_timeout_when_peer_never_closes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        tokio::spawn(async move {
            let (_sock, _) = listener.accept().await.expect("accept");
            tokio::time::sleep(Duration::from_secs(10)).await;
        });
        let mut args = WriteArgs::new("127.0.0.1", port);
        args.timeouts = Timeouts {
            read: Some(Duration::from_millis(100)),
            ..Timeouts::default()
        };
        let err = TcpTransport::new().send(b"x", &args).await.unwrap_err();
        assert!(
            matches!(
                err,
                TransportError::Timeout {
                    stage: Stage::Read,
                    ..
                }
            ),
            "{err:?}"
        );
    }

    #[tokio::test]
    async fn test_cancel_aborts_in_flight() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        tokio::spawn(async move {
            let (_sock, _) = listener.accept().await.expect("accept");
            tokio::time::sleep(Duration::from_secs(10)).await;
        });
        let args = WriteArgs::new("127.0.0.1", port);
        let cancel = args.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });
        let err = TcpTransport::new().send(b"x", &args).await.unwrap_err();
        assert!(matches!(err, TransportError::Cancelled));
    }
}

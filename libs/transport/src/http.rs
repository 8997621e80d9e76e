//! Single-shot HTTP POST transport.
use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::{Client, header::CONTENT_TYPE};
use tracing::debug;

use crate::{Delivery, Stage, Timeouts, Transport, TransportError, WriteArgs, deliver_response, guarded};

/// content type of every POST
pub const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

/// Posts each payload once. Clients are cached per timeout set, so repeated
/// sends in a run reuse one connection pool.
#[derive(Debug, Default)]
pub struct HttpTransport {
    clients: Mutex<HashMap<Timeouts, Client>>,
}

impl HttpTransport {
    /// transport with an empty client cache
    pub fn new() -> Self {
        Self::default()
    }

    fn client(&self, timeouts: Timeouts) -> Result<Client, TransportError> {
        let mut clients = self.clients.lock();
        if let Some(client) = clients.get(&timeouts) {
            return Ok(client.clone());
        }
        let mut builder = Client::builder();
        if let Some(connect) = timeouts.connect {
            builder = builder.connect_timeout(connect);
        }
        // reqwest has no separate write bound, the larger of the two governs
        if let Some(rw) = timeouts.read.max(timeouts.write) {
            builder = builder.read_timeout(rw);
        }
        if let Some(overall) = timeouts.overall {
            builder = builder.timeout(overall);
        }
        let client = builder.build()?;
        clients.insert(timeouts, client.clone());
        Ok(client)
    }

    async fn post(&self, payload: &[u8], args: &WriteArgs) -> Result<Delivery, TransportError> {
        let client = self.client(args.timeouts)?;
        let url = target_url(&args.address, args.port);
        let resp = client
            .post(&url)
            .header(CONTENT_TYPE, FORM_CONTENT_TYPE)
            .body(payload.to_vec())
            .send()
            .await
            .map_err(|err| classify(err, args))?;
        let status = resp.status();
        let body = resp.bytes().await.map_err(|err| classify(err, args))?;
        debug!(request_id = args.request_id, %url, %status, received = body.len(), "http post complete");
        let delivery = Delivery {
            sent: payload.len(),
            received: body.len(),
        };
        deliver_response(args, body);
        Ok(delivery)
    }
}

/// `address` is used verbatim when it already carries a scheme
pub fn target_url(address: &str, port: u16) -> String {
    if address.starts_with("http://") || address.starts_with("https://") {
        address.to_owned()
    } else {
        format!("http://{address}:{port}/")
    }
}

fn classify(err: reqwest::Error, args: &WriteArgs) -> TransportError {
    if err.is_timeout() {
        let t = args.timeouts;
        let (stage, after) = if err.is_connect() {
            (Stage::Connect, t.connect)
        } else {
            (Stage::Overall, t.overall.or(t.read.max(t.write)))
        };
        return TransportError::Timeout {
            stage,
            after: after.unwrap_or(Duration::ZERO),
        };
    }
    TransportError::Http(err)
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, payload: &[u8], args: &WriteArgs) -> Result<Delivery, TransportError> {
        guarded(args, self.post(payload, args)).await
    }
}

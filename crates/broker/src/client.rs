//! Broker wire client.
//!
//! A [`BrokerConnection`] speaks newline-delimited JSON over a
//! [`WireConnection`]: responses are matched to requests by correlation id,
//! and a request whose caller stops waiting leaves the connection usable.

use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;

use harness_core::wire::WireConnection;
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::BrokerError;
use crate::protocol::{BrokerRequest, BrokerResponse, ErrorCode, RequestFrame, ResponseFrame};

/// Connection to the embedded broker.
#[derive(Debug)]
pub struct BrokerConnection {
    addr: String,
    client_id: String,
    request_timeout: Duration,
    next_correlation_id: AtomicI32,
    wire: WireConnection<ResponseFrame>,
}

impl BrokerConnection {
    /// Connect to `addr`; `timeout` bounds the connect and every request.
    pub async fn connect(
        addr: &str,
        timeout: Duration,
        client_id: &str,
    ) -> Result<Self, BrokerError> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| BrokerError::ConnectTimeout {
                addr: addr.to_owned(),
                timeout_ms: millis(timeout),
            })??;
        stream.set_nodelay(true)?;
        debug!(addr, client_id, "broker connection established");

        Ok(Self {
            addr: addr.to_owned(),
            client_id: client_id.to_owned(),
            request_timeout: timeout,
            next_correlation_id: AtomicI32::new(0),
            wire: WireConnection::spawn(stream, addr),
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Send one request and wait for its response.
    ///
    /// A top-level `Error` response becomes [`BrokerError::Server`].
    pub async fn send(&self, request: BrokerRequest) -> Result<BrokerResponse, BrokerError> {
        let correlation_id = self.next_correlation_id.fetch_add(1, Ordering::Relaxed);
        let api = request.api_name();
        let frame = RequestFrame {
            correlation_id,
            client_id: self.client_id.clone(),
            request,
        };
        let response = self
            .wire
            .call(i64::from(correlation_id), &frame, self.request_timeout)
            .await
            .map_err(|e| {
                debug!(api, correlation_id, error = %e, "broker request failed");
                BrokerError::from(e)
            })?;

        match response.response {
            BrokerResponse::Error {
                error_code,
                message,
            } => Err(BrokerError::server(error_code, message)),
            other => Ok(other),
        }
    }

    pub fn is_open(&self) -> bool {
        self.wire.is_open()
    }

    /// Shut the socket down. Safe to call more than once.
    pub fn close(&self) {
        self.wire.close();
    }
}

/// Turn a non-`None` partition error code into an error.
pub(crate) fn check(code: ErrorCode, context: &str) -> Result<(), BrokerError> {
    if code.is_ok() {
        Ok(())
    } else {
        Err(BrokerError::server(code, context.to_owned()))
    }
}

pub(crate) fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

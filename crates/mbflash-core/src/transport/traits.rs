//! Broker transport abstraction.
//!
//! Defines the `RpcTransport` trait for request/reply calls routed through a
//! broker, allowing different implementations (MDP client, mock, emulator).

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Failed to connect to {broker}: {message}")]
    ConnectFailed { broker: String, message: String },

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    #[error("Timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Malformed reply envelope: {0}")]
    Envelope(String),

    #[error("Transport closed")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Broker address and the service name requests are routed to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub broker: String,
    pub service: String,
}

impl Endpoint {
    pub fn new(broker: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            broker: broker.into(),
            service: service.into(),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.service, self.broker)
    }
}

/// Synchronous request/reply transport.
///
/// One call submits an ordered list of opaque payloads and blocks until the
/// ordered reply payloads arrive or the call fails.
pub trait RpcTransport: Send + Sync {
    fn call(&self, endpoint: &Endpoint, request: Vec<Vec<u8>>)
    -> Result<Vec<Vec<u8>>, TransportError>;

    /// Whether the transport can still carry calls.
    fn is_connected(&self) -> bool {
        true
    }
}

impl<T: RpcTransport + ?Sized> RpcTransport for &T {
    fn call(
        &self,
        endpoint: &Endpoint,
        request: Vec<Vec<u8>>,
    ) -> Result<Vec<Vec<u8>>, TransportError> {
        (**self).call(endpoint, request)
    }

    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }
}

impl<T: RpcTransport + ?Sized> RpcTransport for Box<T> {
    fn call(
        &self,
        endpoint: &Endpoint,
        request: Vec<Vec<u8>>,
    ) -> Result<Vec<Vec<u8>>, TransportError> {
        (**self).call(endpoint, request)
    }

    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }
}

//! Majordomo (MDP/0.1) client transport over ZeroMQ.

use std::time::Duration;

use tracing::{debug, info, instrument};

use super::traits::{Endpoint, RpcTransport, TransportError};

/// Client protocol header frame.
pub const MDP_CLIENT: &[u8] = b"MDPC01";

/// Default socket receive timeout.
pub const DEFAULT_RECEIVE_TIMEOUT: Duration = Duration::from_secs(5);

/// MDP client.
///
/// A fresh REQ socket is used for every call, so a lost reply never leaves
/// the socket stuck in the send-after-send state.
pub struct MdpTransport {
    context: zmq::Context,
    receive_timeout: Duration,
}

impl MdpTransport {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_RECEIVE_TIMEOUT)
    }

    /// The timeout must exceed every per-frame `timeout_ms` the worker honours.
    pub fn with_timeout(receive_timeout: Duration) -> Self {
        info!(
            timeout_ms = receive_timeout.as_millis() as u64,
            "MDP transport ready"
        );
        Self {
            context: zmq::Context::new(),
            receive_timeout,
        }
    }

    fn timeout_ms(&self) -> u64 {
        self.receive_timeout.as_millis() as u64
    }

    fn connect(&self, broker: &str) -> Result<zmq::Socket, TransportError> {
        let connect_failed = |e: zmq::Error| TransportError::ConnectFailed {
            broker: broker.to_string(),
            message: e.to_string(),
        };
        let socket = self.context.socket(zmq::REQ).map_err(connect_failed)?;
        socket.set_linger(0).map_err(connect_failed)?;
        socket
            .set_rcvtimeo(i32::try_from(self.timeout_ms()).unwrap_or(i32::MAX))
            .map_err(connect_failed)?;
        socket.connect(broker).map_err(connect_failed)?;
        Ok(socket)
    }
}

impl Default for MdpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl RpcTransport for MdpTransport {
    #[instrument(skip(self, request), fields(endpoint = %endpoint, frames = request.len()))]
    fn call(
        &self,
        endpoint: &Endpoint,
        request: Vec<Vec<u8>>,
    ) -> Result<Vec<Vec<u8>>, TransportError> {
        let socket = self.connect(&endpoint.broker)?;

        let mut message: Vec<Vec<u8>> = Vec::with_capacity(request.len() + 2);
        message.push(MDP_CLIENT.to_vec());
        message.push(endpoint.service.as_bytes().to_vec());
        message.extend(request);
        socket
            .send_multipart(message, 0)
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;

        let mut reply = socket.recv_multipart(0).map_err(|e| match e {
            zmq::Error::EAGAIN => TransportError::Timeout {
                timeout_ms: self.timeout_ms(),
            },
            other => TransportError::ReceiveFailed(other.to_string()),
        })?;

        if reply.len() < 2 {
            return Err(TransportError::Envelope(format!(
                "{} frames, need header and service",
                reply.len()
            )));
        }
        if reply[0] != MDP_CLIENT {
            return Err(TransportError::Envelope(format!(
                "unexpected header {:?}",
                String::from_utf8_lossy(&reply[0])
            )));
        }
        if reply[1] != endpoint.service.as_bytes() {
            return Err(TransportError::Envelope(format!(
                "reply from service {:?}",
                String::from_utf8_lossy(&reply[1])
            )));
        }

        let body = reply.split_off(2);
        debug!(frames = body.len(), "Reply received");
        Ok(body)
    }
}

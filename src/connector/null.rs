//! A connector that hears nothing and accepts every message.

use super::{Connector, IncomingSender, OutgoingMessage};
use crate::retval::RetVal;

use tokio_util::sync::CancellationToken;

#[derive(Debug)]
pub struct NullConnector {
    protocol: String,
}

impl NullConnector {
    pub fn new(protocol: &str) -> Self {
        Self {
            protocol: protocol.to_string(),
        }
    }
}

impl Connector for NullConnector {
    fn protocol(&self) -> &str {
        &self.protocol
    }

    async fn send(&self, message: OutgoingMessage) -> RetVal {
        tracing::trace!(target = ?message.target, "null connector discarding message");
        RetVal::Ok
    }

    async fn run(&self, _incoming: IncomingSender, stop: CancellationToken) {
        stop.cancelled().await;
    }
}

//! Wires a [`NetworkLayer`] together with a [`SenderEngine`] and a
//! [`ReceiverEngine`] behind the public `send_transmission`/
//! `receive_transmission` surface.

use std::sync::Arc;
use std::time::Duration;

use transit_net::NetworkLayer;

use crate::config::TransportConfig;
use crate::error::TransportError;
use crate::receiver::ReceiverEngine;
use crate::sender::SenderEngine;

/// `create_transport_layer()` / `free_transport_layer()`.
///
/// Owns one [`NetworkLayer`] and both engines riding on top of it; dropping
/// this value tears down every simulator and engine thread.
pub struct TransportLayer {
    net: Arc<NetworkLayer>,
    sender: Arc<SenderEngine>,
    receiver: Arc<ReceiverEngine>,
}

impl TransportLayer {
    pub fn new(config: TransportConfig) -> Self {
        let net = NetworkLayer::new(config.network.clone());
        let sender = SenderEngine::new(Arc::clone(&net), config.clone());
        let receiver = ReceiverEngine::new(Arc::clone(&net), config);
        TransportLayer { net, sender, receiver }
    }

    pub fn send_transmission(&self, id: u32, data: &[u8]) -> Result<(), TransportError> {
        self.sender.send_transmission(id, data)
    }

    pub fn receive_transmission(&self, id_or_wildcard: u32, dest: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        self.receiver.receive_transmission(id_or_wildcard, dest, timeout)
    }

    pub fn network(&self) -> &Arc<NetworkLayer> {
        &self.net
    }

    /// Explicit, idempotent teardown matching `free_transport_layer()`.
    /// `Drop` calls this too, so explicit use is only needed to observe
    /// shutdown completing before the value goes out of scope.
    pub fn shutdown(&self) {
        self.sender.shutdown();
        self.receiver.shutdown();
        self.net.shutdown();
    }
}

impl Drop for TransportLayer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

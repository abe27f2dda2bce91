//! Free-function surface matching the public API shape the test harness
//! consumes. These are thin wrappers over [`crate::layer::TransportLayer`]
//! and `transit_net::NetworkLayer` — plain safe Rust, not a C ABI; the
//! naming mirrors the history implied by the source rather than `extern
//! "C"` linkage.

use std::sync::Arc;
use std::time::Duration;

use transit_net::NetworkLayer;

use crate::config::TransportConfig;
use crate::error::TransportError;
use crate::layer::TransportLayer;

/// `create_transport_layer()`.
pub fn create_transport_layer(config: TransportConfig) -> Arc<TransportLayer> {
    Arc::new(TransportLayer::new(config))
}

/// `free_transport_layer()`. Explicit call is optional — `Drop` already
/// tears the layer down once the last `Arc` reference is released — but
/// this mirrors the paired create/free surface for callers that
/// want a definite teardown point.
pub fn free_transport_layer(layer: Arc<TransportLayer>) {
    layer.shutdown();
}

/// `create_network_layer()`: a standalone simulator, for callers driving
/// the network layer directly (e.g. test harnesses exercising it without
/// a transport engine on top).
pub fn create_network_layer(config: transit_net::NetworkConfig) -> Arc<NetworkLayer> {
    NetworkLayer::new(config)
}

/// `free_network_layer()`.
pub fn free_network_layer(net: Arc<NetworkLayer>) {
    net.shutdown();
}

/// `send_transmission(id, data) -> {OK=0, FAIL=1}`.
pub fn send_transmission(layer: &TransportLayer, id: u32, data: &[u8]) -> i32 {
    TransportError::send_code(layer.send_transmission(id, data))
}

/// `receive_transmission(id_or_wildcard, dest, out_length, timeout_ms) ->
/// {OK=0, TIMEOUT=1}`. `out_length` is left untouched on timeout.
pub fn receive_transmission(layer: &TransportLayer, id_or_wildcard: u32, dest: &mut [u8], out_length: &mut usize, timeout_ms: u64) -> i32 {
    match layer.receive_transmission(id_or_wildcard, dest, Duration::from_millis(timeout_ms)) {
        Ok(n) => {
            *out_length = n;
            0
        }
        Err(_) => 1,
    }
}

//! Public error taxonomy for the transport API.
//!
//! Internal setup/configuration failures (thread spawn, malformed config)
//! use `anyhow::Error` instead — they never reach the per-packet path this
//! enum covers.

use std::fmt;

/// Everything `send_transmission`/`receive_transmission` can return besides
/// success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    /// `id` is out of the valid `[0, 2^31)` range.
    InvalidId,
    /// `data` was empty.
    InvalidLength,
    /// A `send_transmission` call for this `id` is already in flight.
    AlreadyInFlight,
    /// The deadline for `receive_transmission`, or the sender's overall
    /// wall-clock send budget, elapsed first.
    Timeout,
    /// The transport layer is shutting down.
    ShuttingDown,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            TransportError::InvalidId => "transmission id out of range",
            TransportError::InvalidLength => "transmission data must be non-empty",
            TransportError::AlreadyInFlight => "transmission id already in flight",
            TransportError::Timeout => "timed out",
            TransportError::ShuttingDown => "transport layer is shutting down",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for TransportError {}

/// Numeric codes matching the C-ABI-shaped public API
/// (`{OK=0, FAIL=1}` / `{OK=0, TIMEOUT=1}`).
pub const CODE_OK: i32 = 0;
pub const CODE_FAIL: i32 = 1;
pub const CODE_TIMEOUT: i32 = 1;

impl TransportError {
    /// Map onto `send_transmission`'s `{OK=0, FAIL=1}` return convention.
    pub fn send_code(result: Result<(), TransportError>) -> i32 {
        match result {
            Ok(()) => CODE_OK,
            Err(_) => CODE_FAIL,
        }
    }

    /// Map onto `receive_transmission`'s `{OK=0, TIMEOUT=1}` return
    /// convention.
    pub fn receive_code(result: &Result<usize, TransportError>) -> i32 {
        match result {
            Ok(_) => CODE_OK,
            Err(_) => CODE_TIMEOUT,
        }
    }
}

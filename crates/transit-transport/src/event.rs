//! The "either of these events, whichever fires first, with a timeout"
//! suspension primitive used by both the send path and the receive path.

use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// A one-shot-per-cycle completion flag. `wait`/`wait_timeout` observe a
/// shared shutdown flag in addition to their own `signal`, so every
/// blocking wait in the transport engine can be woken by process shutdown
/// without each call site re-deriving that logic.
#[derive(Default)]
pub struct Completion {
    state: Mutex<bool>,
    condvar: Condvar,
}

impl Completion {
    pub fn new() -> Self {
        Completion {
            state: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    pub fn signal(&self) {
        let mut done = self.state.lock().expect("completion mutex poisoned");
        *done = true;
        self.condvar.notify_all();
    }

    pub fn is_signaled(&self) -> bool {
        *self.state.lock().expect("completion mutex poisoned")
    }

    /// Block until signaled, `timeout` elapses, or `shutdown` becomes true.
    /// Returns `true` if signaled, `false` on timeout or shutdown.
    pub fn wait_timeout(&self, timeout: Duration, shutdown: &std::sync::atomic::AtomicBool) -> bool {
        use std::sync::atomic::Ordering;

        let deadline = std::time::Instant::now() + timeout;
        let mut done = self.state.lock().expect("completion mutex poisoned");
        loop {
            if *done {
                return true;
            }
            if shutdown.load(Ordering::Acquire) {
                return false;
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                return false;
            }
            // Re-check shutdown/timeout periodically rather than sleeping
            // for the whole remaining timeout in one shot.
            let slice = Duration::from_millis(20).min(deadline - now);
            let (guard, result) = self
                .condvar
                .wait_timeout(done, slice)
                .expect("completion condvar poisoned");
            done = guard;
            if *done {
                return true;
            }
            if result.timed_out() && std::time::Instant::now() >= deadline {
                return false;
            }
        }
    }
}

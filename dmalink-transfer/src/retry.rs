//! Fixed-interval busy-poll loop shared by the channel, the handshake
//! and the transfer orchestrator.

use std::thread;
use std::time::Duration;

use crate::error::Result;

/// Interval between retries of a transient condition.
pub(crate) const POLL_INTERVAL: Duration = Duration::from_micros(10);

/// Outcome of one attempt inside [`busy_poll`].
pub(crate) enum Attempt<T> {
    Ready(T),
    Pending,
}

/// Spin on `op` until it resolves, sleeping [`POLL_INTERVAL`] between
/// attempts. Transient conditions map to `Attempt::Pending`; a
/// non-transient error terminates the loop. There is no timeout:
/// callers that must bound wall-clock time wrap this externally.
pub(crate) fn busy_poll<T>(mut op: impl FnMut() -> Result<Attempt<T>>) -> Result<T> {
    loop {
        match op()? {
            Attempt::Ready(value) => return Ok(value),
            Attempt::Pending => thread::sleep(POLL_INTERVAL),
        }
    }
}

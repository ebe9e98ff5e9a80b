use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Outcome of a bounded [`Semaphore::acquire`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Acquire {
    Permit,
    TimedOut,
    Closed,
}

#[derive(Default)]
struct Permits {
    count: usize,
    closed: bool,
}

/// Counting semaphore with a bounded wait. Closing it fails every current
/// and future waiter.
#[derive(Default)]
pub(crate) struct Semaphore {
    permits: Mutex<Permits>,
    available: Condvar,
}

impl Semaphore {
    pub(crate) fn post(&self) {
        let mut permits = self.permits.lock();
        if permits.closed {
            return;
        }
        permits.count += 1;
        self.available.notify_one();
    }

    /// Takes one permit, waiting at most `timeout`.
    pub(crate) fn acquire(&self, timeout: Duration) -> Acquire {
        // An unrepresentable deadline means waiting until posted or closed.
        let deadline = Instant::now().checked_add(timeout);
        let mut permits = self.permits.lock();
        loop {
            if permits.closed {
                return Acquire::Closed;
            }
            if permits.count > 0 {
                permits.count -= 1;
                return Acquire::Permit;
            }
            let Some(deadline) = deadline else {
                self.available.wait(&mut permits);
                continue;
            };
            if self
                .available
                .wait_until(&mut permits, deadline)
                .timed_out()
            {
                // A post may have raced the deadline.
                if permits.count > 0 && !permits.closed {
                    permits.count -= 1;
                    return Acquire::Permit;
                }
                return Acquire::TimedOut;
            }
        }
    }

    /// Drops outstanding permits and wakes all waiters.
    pub(crate) fn close(&self) {
        let mut permits = self.permits.lock();
        permits.closed = true;
        permits.count = 0;
        self.available.notify_all();
    }
}

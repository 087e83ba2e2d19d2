//! One-shot completion signalled by the host controller when an
//! asynchronous bus write has gone out.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default)]
pub struct Completion {
    done: Mutex<bool>,
    cond: Condvar,
}

impl Completion {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the completion done and wakes every waiter.
    pub fn complete(&self) {
        let mut done = self.done.lock();
        *done = true;
        self.cond.notify_all();
    }

    /// Re-arms the completion before a new write is issued.
    pub fn reinit(&self) {
        *self.done.lock() = false;
    }

    pub fn is_done(&self) -> bool {
        *self.done.lock()
    }

    /// Blocks until completed or `timeout` elapses. Returns whether the
    /// completion fired.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut done = self.done.lock();
        while !*done {
            if self.cond.wait_until(&mut done, deadline).timed_out() {
                return *done;
            }
        }
        true
    }
}

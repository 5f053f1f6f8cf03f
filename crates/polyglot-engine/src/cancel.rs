//! Cancellation
//!
//! Interrupt flag raised by a cancelling close. Guest code blocks through
//! [`CancelFlag::sleep`] so that a cancel can wake it up.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::PolyglotError;

#[derive(Debug, Default)]
pub(crate) struct CancelFlag {
    requested: AtomicBool,
}

impl CancelFlag {
    pub(crate) fn request(&self) {
        self.requested.store(true, Ordering::Release);
    }

    pub(crate) fn is_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }

    pub(crate) fn check(&self) -> Result<(), PolyglotError> {
        if self.is_requested() {
            Err(PolyglotError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Block the calling thread for `duration` unless cancellation is
    /// requested first. The canceller unparks waiting threads.
    pub(crate) fn sleep(&self, duration: Duration) -> Result<(), PolyglotError> {
        let deadline = Instant::now() + duration;
        loop {
            self.check()?;
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            thread::park_timeout(deadline - now);
        }
    }
}

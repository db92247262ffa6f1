// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Monotonic time source used by every wait loop in the engine.

use std::time::Duration;
use std::time::Instant;

/// Source of monotonic time and sleeps.
pub trait Clock {
    /// Time elapsed since an arbitrary, fixed origin.
    fn now(&self) -> Duration;
    /// Block for `duration`.
    fn sleep(&self, duration: Duration);
}

/// The wall clock of the controller host.
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    /// Creates a clock whose origin is the moment of construction.
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn sleep(&self, duration: Duration) {
        if !duration.is_zero() {
            tracing::trace!(?duration, "sleeping");
            std::thread::sleep(duration);
        }
    }
}

#[cfg(test)]
pub(crate) use fake::FakeClock;

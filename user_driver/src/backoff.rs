// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Spin loop support for polling device state.

use std::time::Duration;
use std::time::Instant;

const YIELD_ATTEMPTS: u64 = 250;
const SHORT_SLEEP_ATTEMPTS: u64 = 250;
const SHORT_SLEEP_DURATION: Duration = Duration::from_millis(1);
const LONG_SLEEP_DURATION: Duration = Duration::from_millis(15);

/// An object to yield execution while in a spin loop.
///
/// This is useful when waiting for some condition (such as a device register
/// to change states) that can only be polled and does not have an
/// interrupt-based notification.
pub struct Backoff {
    n: u64,
}

impl Backoff {
    /// Returns a new backoff object, usable for the lifetime of one spin loop.
    pub fn new() -> Self {
        Self { n: 0 }
    }

    /// Yields execution.
    ///
    /// Initially just yields the CPU to any other ready threads. Sleeps for
    /// longer the more times this is called.
    pub fn back_off(&mut self) {
        if self.n < YIELD_ATTEMPTS {
            std::thread::yield_now();
        } else if self.n - YIELD_ATTEMPTS < SHORT_SLEEP_ATTEMPTS {
            std::thread::sleep(SHORT_SLEEP_DURATION);
        } else {
            std::thread::sleep(LONG_SLEEP_DURATION);
        }
        self.n += 1;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

/// A wall-clock bound for a polling loop.
///
/// A zero timeout produces an already-expired deadline, which polling loops
/// treat as "probe once".
#[derive(Copy, Clone)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    /// A deadline `timeout` from now. `None` means no bound.
    pub fn after(timeout: Option<Duration>) -> Self {
        Self(timeout.map(|t| Instant::now() + t))
    }

    pub fn expired(&self) -> bool {
        self.0.is_some_and(|t| Instant::now() >= t)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_timeout_expires_immediately() {
        assert!(Deadline::after(Some(Duration::ZERO)).expired());
        assert!(!Deadline::after(None).expired());
        assert!(!Deadline::after(Some(Duration::from_secs(60))).expired());
    }
}

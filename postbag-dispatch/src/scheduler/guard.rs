use std::sync::atomic::{AtomicBool, Ordering};

/// Non-blocking mutual exclusion for dispatch cycles
///
/// `try_acquire` never waits: it either hands out the only permit or returns
/// `None`. The permit releases the guard when dropped, so a cycle that
/// returns early, errors, panics or is cancelled still frees it.
#[derive(Debug, Default)]
pub struct SingleFlight {
    active: AtomicBool,
}

impl SingleFlight {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            active: AtomicBool::new(false),
        }
    }

    /// Take the guard if nobody holds it
    pub fn try_acquire(&self) -> Option<FlightPermit<'_>> {
        self.active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| FlightPermit { flight: self })
    }

    /// Whether a permit is currently held
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

/// Proof of holding the [`SingleFlight`] guard
#[derive(Debug)]
#[must_use = "the guard is released as soon as the permit is dropped"]
pub struct FlightPermit<'a> {
    flight: &'a SingleFlight,
}

impl Drop for FlightPermit<'_> {
    fn drop(&mut self) {
        self.flight.active.store(false, Ordering::Release);
    }
}

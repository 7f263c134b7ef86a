//! Per-task admission control.
//!
//! Admission is a non-blocking attempt: a full limiter is a normal outcome
//! (the job stays queued), never an error and never a wait.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Bounded admission set for one task.
#[derive(Debug, Clone)]
pub struct Limiter {
    permits: Arc<Semaphore>,
    capacity: usize,
}

/// Held for the duration of one execution. Dropping it frees the slot,
/// including when the holder unwinds.
#[derive(Debug)]
pub struct Admission {
    _permit: OwnedSemaphorePermit,
}

impl Limiter {
    /// A capacity of zero is raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Take a slot if one is free and the limiter is open.
    pub fn try_admit(&self) -> Option<Admission> {
        self.permits
            .clone()
            .try_acquire_owned()
            .ok()
            .map(|permit| Admission { _permit: permit })
    }

    /// Reject every further admission. Held slots stay valid.
    pub fn close(&self) {
        self.permits.close();
    }

    pub fn is_closed(&self) -> bool {
        self.permits.is_closed()
    }

    /// Slots currently held.
    pub fn running(&self) -> usize {
        self.capacity
            .saturating_sub(self.permits.available_permits())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_up_to_capacity() {
        let limiter = Limiter::new(2);
        let a = limiter.try_admit().expect("first slot");
        let _b = limiter.try_admit().expect("second slot");
        assert!(limiter.try_admit().is_none());
        assert_eq!(limiter.running(), 2);

        drop(a);
        assert_eq!(limiter.running(), 1);
        assert!(limiter.try_admit().is_some());
    }

    #[test]
    fn zero_capacity_means_one() {
        let limiter = Limiter::new(0);
        assert_eq!(limiter.capacity(), 1);
        assert!(limiter.try_admit().is_some());
    }

    #[test]
    fn closed_limiter_rejects_but_counts_holders() {
        let limiter = Limiter::new(3);
        let held = limiter.try_admit().unwrap();
        limiter.close();

        assert!(limiter.is_closed());
        assert!(limiter.try_admit().is_none());
        assert_eq!(limiter.running(), 1);

        drop(held);
        assert_eq!(limiter.running(), 0);
    }

    #[test]
    fn slot_is_released_on_panic() {
        let limiter = Limiter::new(1);
        let inner = limiter.clone();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _admission = inner.try_admit().unwrap();
            panic!("handler blew up");
        }));
        assert!(result.is_err());
        assert_eq!(limiter.running(), 0);
    }
}

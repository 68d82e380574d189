//! Waiting policies for the blocking acquire path.

use crate::Error;
use parking_lot::{Condvar, MutexGuard};
use std::time::{Duration, Instant};

/// Wait-forever vs. wait-up-to-a-deadline semantics over a condition
/// variable.
///
/// Bounded waits carry their remaining budget across wake-ups: each call
/// deducts the wall time actually spent waiting, so spurious wake-ups and
/// head-of-queue retries cannot extend the deadline.
pub(crate) enum Wait {
    Unlimited,
    Bounded { remaining: Duration, elapsed: bool },
}

impl Wait {
    pub(crate) fn unlimited() -> Self {
        Self::Unlimited
    }

    pub(crate) fn bounded(max_wait: Duration) -> Self {
        Self::Bounded {
            remaining: max_wait,
            elapsed: false,
        }
    }

    /// Suspends once on `cv`, releasing `guard` for the duration of the wait.
    /// Returns whether further waiting is possible.
    pub(crate) fn await_next<T>(&mut self, cv: &Condvar, guard: &mut MutexGuard<'_, T>) -> bool {
        match self {
            Self::Unlimited => {
                cv.wait(guard);
                true
            }
            Self::Bounded { remaining, elapsed } => {
                if remaining.is_zero() {
                    *elapsed = true;
                    return false;
                }
                let start = Instant::now();
                let timed_out = cv.wait_for(guard, *remaining).timed_out();
                *remaining = remaining.saturating_sub(start.elapsed());
                *elapsed = *elapsed || timed_out;
                !*elapsed
            }
        }
    }

    /// Fails with [Error::Timeout] once the budget has been exhausted.
    pub(crate) fn check_time_elapsed(&self) -> Result<(), Error> {
        match self {
            Self::Bounded { elapsed: true, .. } => Err(Error::Timeout),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::{sync::Arc, thread};

    #[test]
    fn test_unlimited_resumes_on_signal() {
        let shared = Arc::new((Mutex::new(false), Condvar::new()));
        let signaller = shared.clone();
        let handle = thread::spawn(move || {
            let (mutex, cv) = &*signaller;
            *mutex.lock() = true;
            cv.notify_one();
        });

        let (mutex, cv) = &*shared;
        let mut wait = Wait::unlimited();
        let mut guard = mutex.lock();
        while !*guard {
            assert!(wait.await_next(cv, &mut guard));
        }
        drop(guard);
        assert!(wait.check_time_elapsed().is_ok());
        handle.join().unwrap();
    }

    #[test]
    fn test_bounded_elapses_without_signal() {
        let mutex = Mutex::new(());
        let cv = Condvar::new();
        let mut wait = Wait::bounded(Duration::from_millis(20));

        let mut guard = mutex.lock();
        assert!(!wait.await_next(&cv, &mut guard));
        assert!(matches!(wait.check_time_elapsed(), Err(Error::Timeout)));

        // Once elapsed, further waits return immediately.
        let start = Instant::now();
        assert!(!wait.await_next(&cv, &mut guard));
        assert!(start.elapsed() < Duration::from_millis(20));
    }

    #[test]
    fn test_bounded_zero_budget_never_waits() {
        let mutex = Mutex::new(());
        let cv = Condvar::new();
        let mut wait = Wait::bounded(Duration::ZERO);

        let mut guard = mutex.lock();
        assert!(!wait.await_next(&cv, &mut guard));
        assert!(matches!(wait.check_time_elapsed(), Err(Error::Timeout)));
    }

    #[test]
    fn test_bounded_budget_spans_wake_ups() {
        let shared = Arc::new((Mutex::new(0u32), Condvar::new()));
        let signaller = shared.clone();
        let handle = thread::spawn(move || {
            let (mutex, cv) = &*signaller;
            for _ in 0..3 {
                thread::sleep(Duration::from_millis(5));
                *mutex.lock() += 1;
                cv.notify_one();
            }
        });

        // Each early wake-up deducts from the same budget; three 5 ms sleeps
        // fit comfortably inside it.
        let (mutex, cv) = &*shared;
        let mut wait = Wait::bounded(Duration::from_secs(5));
        let mut guard = mutex.lock();
        while *guard < 3 {
            assert!(wait.await_next(cv, &mut guard));
            wait.check_time_elapsed().unwrap();
        }
        if let Wait::Bounded { remaining, .. } = &wait {
            assert!(*remaining < Duration::from_secs(5));
        }
        drop(guard);
        handle.join().unwrap();
    }
}

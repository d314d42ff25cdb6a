//! Countdown join-barrier for fan-out sub-fetches
//!
//! A [`JoinBarrier`] is armed with the number of sub-operations about to be
//! issued. Each completion, successful or not, calls [`JoinBarrier::arrive`]
//! (or drops its [`ArrivalGuard`]). The counter is decremented under a mutex
//! and the barrier releases exactly once, on the arrival that reaches zero.

use std::sync::{Arc, Mutex};
use tokio::sync::watch;

#[derive(Debug)]
struct Inner {
    pending: Mutex<usize>,
    released: watch::Sender<bool>,
}

/// Countdown latch that releases exactly once when its counter reaches zero
#[derive(Clone, Debug)]
pub struct JoinBarrier {
    inner: Arc<Inner>,
}

impl JoinBarrier {
    /// Arm a barrier for `count` arrivals. A zero count is released immediately.
    pub fn new(count: usize) -> Self {
        let (released, _) = watch::channel(count == 0);
        Self {
            inner: Arc::new(Inner {
                pending: Mutex::new(count),
                released,
            }),
        }
    }

    /// Arm a barrier and hand out one guard per expected arrival
    pub fn with_guards(count: usize) -> (Self, Vec<ArrivalGuard>) {
        let barrier = Self::new(count);
        let guards = (0..count)
            .map(|_| ArrivalGuard {
                barrier: Some(barrier.clone()),
            })
            .collect();
        (barrier, guards)
    }

    /// Record one completion
    ///
    /// Returns `true` for the single arrival that released the barrier.
    /// Arrivals past zero are ignored and return `false`.
    pub fn arrive(&self) -> bool {
        let mut pending = match self.inner.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if *pending == 0 {
            return false;
        }
        *pending -= 1;
        if *pending == 0 {
            self.inner.released.send_replace(true);
            true
        } else {
            false
        }
    }

    /// Number of arrivals still outstanding
    pub fn pending(&self) -> usize {
        match self.inner.pending.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Whether the barrier has released
    pub fn is_released(&self) -> bool {
        *self.inner.released.borrow()
    }

    /// Wait until the counter reaches zero
    pub async fn wait(&self) {
        let mut rx = self.inner.released.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait
        let _ = rx.wait_for(|released| *released).await;
    }
}

/// One expected arrival; arrives when completed or dropped
///
/// Tying the arrival to `Drop` means a sub-fetch that panics or is cancelled
/// still counts down.
#[derive(Debug)]
pub struct ArrivalGuard {
    barrier: Option<JoinBarrier>,
}

impl ArrivalGuard {
    /// Arrive now; returns `true` if this arrival released the barrier
    pub fn complete(mut self) -> bool {
        self.barrier.take().is_some_and(|barrier| barrier.arrive())
    }
}

impl Drop for ArrivalGuard {
    fn drop(&mut self) {
        if let Some(barrier) = self.barrier.take() {
            barrier.arrive();
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn zero_count_is_released() {
        let barrier = JoinBarrier::new(0);
        assert!(barrier.is_released());
        assert!(!barrier.arrive());
    }

    #[test]
    fn releases_on_last_arrival_only() {
        let barrier = JoinBarrier::new(3);

        assert!(!barrier.arrive());
        assert!(!barrier.arrive());
        assert!(!barrier.is_released());
        assert!(barrier.arrive());
        assert!(barrier.is_released());
        assert!(!barrier.arrive(), "arrivals past zero must not release again");
        assert_eq!(barrier.pending(), 0);
    }

    #[test]
    fn dropped_guards_count_down() {
        let (barrier, mut guards) = JoinBarrier::with_guards(2);

        drop(guards.pop());
        assert_eq!(barrier.pending(), 1);
        assert!(guards.pop().unwrap().complete());
        assert!(barrier.is_released());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn concurrent_arrivals_release_exactly_once() {
        for _ in 0..50 {
            let (barrier, guards) = JoinBarrier::with_guards(64);
            let releases = Arc::new(AtomicUsize::new(0));

            let handles: Vec<_> = guards
                .into_iter()
                .map(|guard| {
                    let releases = releases.clone();
                    tokio::spawn(async move {
                        tokio::task::yield_now().await;
                        if guard.complete() {
                            releases.fetch_add(1, Ordering::SeqCst);
                        }
                    })
                })
                .collect();

            for handle in handles {
                handle.await.unwrap();
            }

            barrier.wait().await;
            assert_eq!(releases.load(Ordering::SeqCst), 1);
        }
    }

    #[tokio::test]
    async fn wait_returns_after_release() {
        let (barrier, guards) = JoinBarrier::with_guards(2);

        let waiter = {
            let barrier = barrier.clone();
            tokio::spawn(async move { barrier.wait().await })
        };

        for guard in guards {
            tokio::time::sleep(Duration::from_millis(5)).await;
            drop(guard);
        }

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("barrier never released")
            .unwrap();
    }
}

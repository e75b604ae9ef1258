//! Bounded-concurrency gate for independent network calls.
//!
//! Built over `tokio::sync::Semaphore`, whose waiter queue is FIFO, so
//! earlier callers always acquire before later ones. The permit is an
//! RAII guard: a task that returns an error (or panics) still releases
//! its slot, so a crashing task can never deadlock the gate.

use crate::errors::EngineError;
use std::future::Future;
use std::sync::Arc;

/// FIFO gate bounding how many tasks may be in flight at once.
#[derive(Debug, Clone)]
pub struct CallGate {
    inner: Arc<tokio::sync::Semaphore>,
    max: usize,
}

impl CallGate {
    /// Creates a gate admitting up to `max` concurrent tasks.
    ///
    /// # Errors
    ///
    /// Returns a validation error when `max < 1`.
    pub fn new(max: usize) -> Result<Self, EngineError> {
        if max < 1 {
            return Err(EngineError::Validation(
                "concurrency limit must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            inner: Arc::new(tokio::sync::Semaphore::new(max)),
            max,
        })
    }

    /// The configured concurrency ceiling.
    #[must_use]
    pub fn max(&self) -> usize {
        self.max
    }

    /// Currently free slots.
    #[must_use]
    pub fn available(&self) -> usize {
        self.inner.available_permits()
    }

    /// Runs `task` once a slot is free, releasing the slot when the
    /// task settles either way.
    pub async fn run<T, F, Fut>(&self, task: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        // Acquire only fails if the semaphore is closed, which this
        // gate never does.
        let permit = match self.inner.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return task().await,
        };
        let result = task().await;
        drop(permit);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_rejects_zero_limit() {
        assert!(CallGate::new(0).is_err());
        assert!(CallGate::new(1).is_ok());
    }

    #[tokio::test]
    async fn test_bounds_in_flight_tasks() {
        let gate = CallGate::new(2).unwrap();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let gate = gate.clone();
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                gate.run(|| async {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                })
                .await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_slot_released_on_error() {
        let gate = CallGate::new(1).unwrap();

        let failed: Result<(), EngineError> = gate
            .run(|| async { Err(EngineError::Internal("boom".to_string())) })
            .await;
        assert!(failed.is_err());

        // The slot is free again; a second task runs without waiting.
        let ok = tokio::time::timeout(
            Duration::from_millis(100),
            gate.run(|| async { "ran" }),
        )
        .await
        .unwrap();
        assert_eq!(ok, "ran");
        assert_eq!(gate.available(), 1);
    }

    #[tokio::test]
    async fn test_waiters_acquire_in_fifo_order() {
        let gate = CallGate::new(1).unwrap();
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        // Hold the only slot while the waiters queue up.
        let blocker = gate.clone();
        let hold = tokio::spawn(async move {
            blocker
                .run(|| async {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                })
                .await;
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let mut handles = Vec::new();
        for i in 0..4 {
            let gate = gate.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                gate.run(|| async move {
                    order.lock().push(i);
                })
                .await;
            }));
            // Give each waiter time to enqueue before the next.
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        hold.await.unwrap();
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(*order.lock(), vec![0, 1, 2, 3]);
    }
}

//! Budget-safety ledger shared by all concurrently running stages.
//!
//! The reserve/finalize protocol is the only way concurrent stages
//! touch shared mutable state. Both operations run inside a single
//! mutex-guarded critical section so two stages can never both pass a
//! reservation check that together overcommits the budget.

use crate::errors::EngineError;
use parking_lot::Mutex;

#[derive(Debug, Default)]
struct Ledger {
    spent: f64,
    reserved: f64,
    calls: u64,
}

/// A provisional budget hold returned by [`CostTracker::reserve`].
///
/// Pass it back to [`CostTracker::finalize`] once the actual cost is
/// known.
#[derive(Debug, Clone, Copy)]
pub struct Reservation {
    /// The reserved amount in USD.
    pub amount: f64,
}

/// Tracks spent vs. reserved spend for one pipeline run.
#[derive(Debug, Default)]
pub struct CostTracker {
    ledger: Mutex<Ledger>,
}

impl CostTracker {
    /// Creates a fresh tracker with nothing spent or reserved.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically reserves `estimate` USD against `max_budget`.
    ///
    /// Rejects when `spent + reserved + estimate` would strictly exceed
    /// the budget; an estimate that lands exactly on the budget is
    /// accepted. (`check_budget` intentionally uses the other boundary.)
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::BudgetExceeded`] without reserving
    /// anything if the reservation would overcommit.
    pub fn reserve(&self, estimate: f64, max_budget: f64) -> Result<Reservation, EngineError> {
        let mut ledger = self.ledger.lock();
        if ledger.spent + ledger.reserved + estimate > max_budget {
            return Err(EngineError::BudgetExceeded {
                spent: ledger.spent,
                reserved: ledger.reserved,
                requested: estimate,
                budget: max_budget,
            });
        }
        ledger.reserved += estimate;
        ledger.calls += 1;
        Ok(Reservation { amount: estimate })
    }

    /// Releases a reservation and records the actual spend.
    ///
    /// The reserved balance is floored at zero so a double release can
    /// never drive it negative.
    pub fn finalize(&self, reservation: Reservation, actual_cost: f64) {
        let mut ledger = self.ledger.lock();
        ledger.reserved = (ledger.reserved - reservation.amount).max(0.0);
        ledger.spent += actual_cost;
    }

    /// Fails once committed spend has reached the budget.
    ///
    /// Uses `>=` where `reserve` uses a strict `>`: a run that has
    /// exactly exhausted its budget may finish in-flight work but may
    /// not start more.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::BudgetExceeded`] when
    /// `spent + reserved >= max_budget`.
    pub fn check_budget(&self, max_budget: f64) -> Result<(), EngineError> {
        let ledger = self.ledger.lock();
        if ledger.spent + ledger.reserved >= max_budget {
            return Err(EngineError::BudgetExceeded {
                spent: ledger.spent,
                reserved: ledger.reserved,
                requested: 0.0,
                budget: max_budget,
            });
        }
        Ok(())
    }

    /// Total spend so far in USD.
    #[must_use]
    pub fn spent(&self) -> f64 {
        self.ledger.lock().spent
    }

    /// Currently reserved (not yet finalized) USD.
    #[must_use]
    pub fn reserved(&self) -> f64 {
        self.ledger.lock().reserved
    }

    /// Number of successful reservations taken.
    #[must_use]
    pub fn call_count(&self) -> u64 {
        self.ledger.lock().calls
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_reserve_and_finalize() {
        let tracker = CostTracker::new();
        let reservation = tracker.reserve(0.10, 1.0).unwrap();
        assert_eq!(tracker.reserved(), 0.10);

        tracker.finalize(reservation, 0.07);
        assert_eq!(tracker.reserved(), 0.0);
        assert_eq!(tracker.spent(), 0.07);
        assert_eq!(tracker.call_count(), 1);
    }

    #[test]
    fn test_reserve_rejects_overcommit_without_reserving() {
        let tracker = CostTracker::new();
        tracker.reserve(0.8, 1.0).unwrap();

        let err = tracker.reserve(0.3, 1.0).unwrap_err();
        assert!(matches!(err, EngineError::BudgetExceeded { .. }));
        // Nothing was added by the failed reserve.
        assert_eq!(tracker.reserved(), 0.8);
    }

    #[test]
    fn test_reserve_boundary_is_inclusive() {
        let tracker = CostTracker::new();
        // Exactly hitting the budget is allowed for reserve.
        assert!(tracker.reserve(1.0, 1.0).is_ok());
    }

    #[test]
    fn test_check_budget_boundary_is_exclusive() {
        let tracker = CostTracker::new();
        let reservation = tracker.reserve(1.0, 1.0).unwrap();
        tracker.finalize(reservation, 1.0);
        // spent == budget fails the >= check.
        assert!(tracker.check_budget(1.0).is_err());
        assert!(tracker.check_budget(1.01).is_ok());
    }

    #[test]
    fn test_finalize_floors_reserved_at_zero() {
        let tracker = CostTracker::new();
        let reservation = tracker.reserve(0.1, 1.0).unwrap();
        tracker.finalize(reservation, 0.05);
        // Second release of the same hold must not go negative.
        tracker.finalize(reservation, 0.0);
        assert_eq!(tracker.reserved(), 0.0);
    }

    #[tokio::test]
    async fn test_concurrent_reserves_never_overcommit() {
        let tracker = Arc::new(CostTracker::new());
        let budget = 1.0;

        let mut handles = Vec::new();
        for _ in 0..16 {
            let tracker = tracker.clone();
            handles.push(tokio::spawn(async move {
                tracker.reserve(0.2, budget).is_ok()
            }));
        }

        let mut succeeded = 0;
        for handle in handles {
            if handle.await.unwrap() {
                succeeded += 1;
            }
        }

        // 16 reserves of 0.2 against 1.0: exactly 5 fit.
        assert_eq!(succeeded, 5);
        assert!(tracker.spent() + tracker.reserved() <= budget + f64::EPSILON);
    }
}

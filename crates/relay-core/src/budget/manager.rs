//! Per-request and daily spend ceilings.
//!
//! `spent_today` belongs to a UTC calendar day. Any access on a later day
//! starts a fresh ledger at zero, so no external reset job is needed;
//! [`BudgetManager::reset`] is still available for manual resets.
//!
//! [`BudgetManager::preflight`] followed by [`BudgetManager::charge`] is not
//! atomic: two concurrent callers can both pass preflight before either
//! charges. Use [`BudgetManager::preflight_and_charge`] when the projected
//! cost is already known and must be reserved under one lock.

use chrono::{NaiveDate, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use super::BudgetError;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetLimits {
    /// USD ceiling for a single request.
    pub max_per_request: f64,
    /// USD ceiling per UTC day.
    pub daily_budget: f64,
}

impl Default for BudgetLimits {
    fn default() -> Self {
        Self {
            max_per_request: 1.0,
            daily_budget: 100.0,
        }
    }
}

/// Point-in-time view of the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BudgetStatus {
    pub day: NaiveDate,
    pub spent_today: f64,
    pub daily_budget: f64,
    pub max_per_request: f64,
    /// `spent_today / daily_budget`, 0 when the budget is 0.
    pub utilization: f64,
}

#[derive(Debug)]
struct Ledger {
    day: NaiveDate,
    spent: f64,
}

type Clock = Arc<dyn Fn() -> NaiveDate + Send + Sync>;

pub struct BudgetManager {
    limits: BudgetLimits,
    ledger: Mutex<Ledger>,
    clock: Clock,
}

impl std::fmt::Debug for BudgetManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BudgetManager")
            .field("limits", &self.limits)
            .field("ledger", &*self.ledger.lock())
            .finish()
    }
}

impl BudgetManager {
    pub fn new(limits: BudgetLimits) -> Self {
        Self::with_clock(limits, Arc::new(|| Utc::now().date_naive()))
    }

    /// Manager whose notion of "today" comes from `clock`.
    pub fn with_clock(limits: BudgetLimits, clock: Clock) -> Self {
        let day = clock();
        Self {
            limits,
            ledger: Mutex::new(Ledger { day, spent: 0.0 }),
            clock,
        }
    }

    pub fn limits(&self) -> BudgetLimits {
        self.limits
    }

    fn current(&self) -> parking_lot::MutexGuard<'_, Ledger> {
        let today = (self.clock)();
        let mut ledger = self.ledger.lock();
        if today > ledger.day {
            info!(previous_day = %ledger.day, spent = ledger.spent, "daily budget rolled over");
            ledger.day = today;
            ledger.spent = 0.0;
        }
        ledger
    }

    fn check(&self, spent: f64, cost: f64, max_per_request: f64) -> Result<(), BudgetError> {
        if cost > max_per_request {
            return Err(BudgetError::PerRequestExceeded {
                cost,
                limit: max_per_request,
            });
        }
        if spent + cost > self.limits.daily_budget {
            return Err(BudgetError::DailyExceeded {
                cost,
                spent,
                limit: self.limits.daily_budget,
            });
        }
        Ok(())
    }

    /// Fail if `cost` breaks the per-request or the daily ceiling.
    pub fn preflight(&self, cost: f64) -> Result<(), BudgetError> {
        self.preflight_with_ceiling(cost, self.limits.max_per_request)
    }

    /// [`preflight`](Self::preflight) with a caller-supplied per-request
    /// ceiling, e.g. a tenant override.
    pub fn preflight_with_ceiling(&self, cost: f64, max_per_request: f64) -> Result<(), BudgetError> {
        let spent = self.current().spent;
        self.check(spent, cost, max_per_request).inspect_err(|e| {
            warn!(cost, error = %e, "budget preflight rejected");
        })
    }

    /// Add `cost` to today's spend without validation. Returns the new total.
    pub fn charge(&self, cost: f64) -> f64 {
        let mut ledger = self.current();
        ledger.spent += cost.max(0.0);
        ledger.spent
    }

    /// Preflight and charge under a single lock.
    pub fn preflight_and_charge(&self, cost: f64) -> Result<f64, BudgetError> {
        let mut ledger = self.current();
        if let Err(e) = self.check(ledger.spent, cost, self.limits.max_per_request) {
            warn!(cost, error = %e, "budget preflight rejected");
            return Err(e);
        }
        ledger.spent += cost.max(0.0);
        Ok(ledger.spent)
    }

    pub fn spent_today(&self) -> f64 {
        self.current().spent
    }

    pub fn remaining_today(&self) -> f64 {
        (self.limits.daily_budget - self.spent_today()).max(0.0)
    }

    pub fn set_spent_today(&self, amount: f64) {
        self.current().spent = amount.max(0.0);
    }

    pub fn reset(&self) {
        self.current().spent = 0.0;
    }

    pub fn status(&self) -> BudgetStatus {
        let ledger = self.current();
        let utilization = if self.limits.daily_budget > 0.0 {
            ledger.spent / self.limits.daily_budget
        } else {
            0.0
        };
        BudgetStatus {
            day: ledger.day,
            spent_today: ledger.spent,
            daily_budget: self.limits.daily_budget,
            max_per_request: self.limits.max_per_request,
            utilization,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(max_per_request: f64, daily_budget: f64) -> BudgetManager {
        BudgetManager::new(BudgetLimits {
            max_per_request,
            daily_budget,
        })
    }

    #[test]
    fn test_per_request_ceiling() {
        let m = manager(1.00, 100.0);
        assert!(matches!(
            m.preflight(1.01),
            Err(BudgetError::PerRequestExceeded { .. })
        ));
        assert!(m.preflight(1.00).is_ok());
    }

    #[test]
    fn test_tenant_ceiling_replaces_global() {
        let m = manager(1.00, 100.0);
        assert!(m.preflight_with_ceiling(2.50, 5.0).is_ok());
        assert!(matches!(
            m.preflight_with_ceiling(0.50, 0.25),
            Err(BudgetError::PerRequestExceeded { limit, .. }) if limit == 0.25
        ));
    }

    #[test]
    fn test_daily_ceiling() {
        let m = manager(5.0, 100.00);
        m.set_spent_today(99.50);
        assert!(matches!(
            m.preflight(1.00),
            Err(BudgetError::DailyExceeded { .. })
        ));
        assert!(m.preflight(0.50).is_ok());
    }

    #[test]
    fn test_charge_adds_exact_amount() {
        let m = manager(1.0, 100.0);
        m.set_spent_today(3.25);
        m.preflight(0.75).unwrap();
        let before = m.spent_today();
        m.charge(0.75);
        assert!((m.spent_today() - before - 0.75).abs() < 1e-12);
    }

    #[test]
    fn test_charge_does_not_revalidate() {
        let m = manager(1.0, 1.0);
        m.charge(5.0);
        assert_eq!(m.spent_today(), 5.0);
        assert_eq!(m.remaining_today(), 0.0);
    }

    #[test]
    fn test_preflight_and_charge_is_all_or_nothing() {
        let m = manager(1.0, 1.5);
        assert_eq!(m.preflight_and_charge(1.0).unwrap(), 1.0);
        assert!(m.preflight_and_charge(1.0).is_err());
        assert_eq!(m.spent_today(), 1.0);
    }

    #[test]
    fn test_rolls_over_on_new_day() {
        let today = Arc::new(Mutex::new(NaiveDate::from_ymd_opt(2025, 3, 1).unwrap()));
        let clock_day = today.clone();
        let m = BudgetManager::with_clock(
            BudgetLimits::default(),
            Arc::new(move || *clock_day.lock()),
        );
        m.charge(42.0);
        assert_eq!(m.spent_today(), 42.0);

        *today.lock() = NaiveDate::from_ymd_opt(2025, 3, 2).unwrap();
        assert_eq!(m.spent_today(), 0.0);
        assert_eq!(m.status().day, NaiveDate::from_ymd_opt(2025, 3, 2).unwrap());
    }

    #[test]
    fn test_reset() {
        let m = manager(1.0, 10.0);
        m.charge(2.0);
        m.reset();
        assert_eq!(m.spent_today(), 0.0);
    }
}

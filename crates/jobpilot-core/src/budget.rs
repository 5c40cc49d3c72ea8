//! Monotonic session budget ledger.
//!
//! Tracks estimated cost and token consumption for one session. Spending is
//! monotonic — charges are never reversed — and admission is checked against
//! the worst-case ceiling of the next item, so the accumulator can exceed
//! the limit by at most one in-flight item's ceiling.

use serde::{Deserialize, Serialize};

/// Budget arithmetic errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum BudgetError {
    /// A counter would overflow.
    #[error("budget counter overflow")]
    Overflow,
}

/// Cost and token accumulators with a hard cost limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetLedger {
    limit_micros: u64,
    spent_micros: u64,
    reserved_micros: u64,
    tokens_in: u64,
    tokens_out: u64,
}

impl BudgetLedger {
    /// Creates a ledger with the given cost limit in micro-dollars.
    #[must_use]
    pub const fn new(limit_micros: u64) -> Self {
        Self {
            limit_micros,
            spent_micros: 0,
            reserved_micros: 0,
            tokens_in: 0,
            tokens_out: 0,
        }
    }

    /// Whether an item with the given worst-case cost ceiling may start.
    ///
    /// Admission accounts for reservations already handed to in-flight
    /// items, so concurrent dispatch cannot overshoot by more than the
    /// ceilings it explicitly admitted.
    #[must_use]
    pub fn admits(&self, ceiling_micros: u64) -> bool {
        self.spent_micros
            .saturating_add(self.reserved_micros)
            .saturating_add(ceiling_micros)
            <= self.limit_micros
    }

    /// Reserves an item's ceiling at dispatch.
    pub fn reserve(&mut self, ceiling_micros: u64) {
        self.reserved_micros = self.reserved_micros.saturating_add(ceiling_micros);
    }

    /// Converts a reservation into an actual charge when the item settles.
    ///
    /// # Errors
    ///
    /// Returns `BudgetError::Overflow` if a counter would overflow; the
    /// ledger is left unchanged in that case.
    pub fn settle(
        &mut self,
        ceiling_micros: u64,
        cost_micros: u64,
        tokens_in: u64,
        tokens_out: u64,
    ) -> Result<(), BudgetError> {
        let spent = self
            .spent_micros
            .checked_add(cost_micros)
            .ok_or(BudgetError::Overflow)?;
        let tin = self
            .tokens_in
            .checked_add(tokens_in)
            .ok_or(BudgetError::Overflow)?;
        let tout = self
            .tokens_out
            .checked_add(tokens_out)
            .ok_or(BudgetError::Overflow)?;
        self.spent_micros = spent;
        self.tokens_in = tin;
        self.tokens_out = tout;
        self.reserved_micros = self.reserved_micros.saturating_sub(ceiling_micros);
        Ok(())
    }

    /// Total estimated spend so far, in micro-dollars.
    #[must_use]
    pub const fn spent_micros(&self) -> u64 {
        self.spent_micros
    }

    /// Configured limit in micro-dollars.
    #[must_use]
    pub const fn limit_micros(&self) -> u64 {
        self.limit_micros
    }

    /// Tokens consumed, `(input, output)`.
    #[must_use]
    pub const fn tokens(&self) -> (u64, u64) {
        (self.tokens_in, self.tokens_out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admission_with_reservations() {
        let mut b = BudgetLedger::new(1_000_000);
        assert!(b.admits(500_000));
        b.reserve(500_000);
        assert!(b.admits(500_000));
        b.reserve(500_000);
        // Fully reserved: nothing more fits.
        assert!(!b.admits(1));
        b.settle(500_000, 120_000, 800, 400).unwrap();
        // 120k spent + 500k still reserved leaves room for 380k.
        assert!(b.admits(380_000));
        assert!(!b.admits(380_001));
        assert_eq!(b.spent_micros(), 120_000);
        assert_eq!(b.tokens(), (800, 400));
    }

    #[test]
    fn test_overshoot_bounded_by_one_ceiling() {
        let mut b = BudgetLedger::new(100_000);
        assert!(b.admits(90_000));
        b.reserve(90_000);
        // The item may cost up to its ceiling even if that lands on the
        // limit exactly; admission of the next item is what's refused.
        b.settle(90_000, 90_000, 0, 0).unwrap();
        assert!(!b.admits(20_000));
        assert!(b.spent_micros() <= b.limit_micros());
    }

    #[test]
    fn test_overflow_detected() {
        let mut b = BudgetLedger::new(u64::MAX);
        b.settle(0, u64::MAX, 0, 0).unwrap();
        assert_eq!(b.settle(0, 1, 0, 0), Err(BudgetError::Overflow));
        // Failed settle leaves counters untouched.
        assert_eq!(b.spent_micros(), u64::MAX);
    }
}

//! Attempt Budget
//!
//! One counter per request, shared by query generation and narrative
//! regeneration. Nothing can spend past the maximum.

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptBudget {
    max: u32,
    used: u32,
}

impl AttemptBudget {
    pub fn new(max: u32) -> Self {
        Self { max, used: 0 }
    }

    /// Spend one attempt, returning its 1-based index, or `None` when exhausted.
    pub fn try_consume(&mut self) -> Option<u32> {
        if self.used >= self.max {
            return None;
        }
        self.used += 1;
        Some(self.used)
    }

    pub fn used(&self) -> u32 {
        self.used
    }

    pub fn remaining(&self) -> u32 {
        self.max - self.used
    }

    pub fn max(&self) -> u32 {
        self.max
    }

    pub fn is_exhausted(&self) -> bool {
        self.used >= self.max
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_never_exceeds_max() {
        let mut budget = AttemptBudget::new(3);
        assert_eq!(budget.try_consume(), Some(1));
        assert_eq!(budget.try_consume(), Some(2));
        assert_eq!(budget.remaining(), 1);
        assert_eq!(budget.try_consume(), Some(3));
        assert!(budget.is_exhausted());
        assert_eq!(budget.try_consume(), None);
        assert_eq!(budget.used(), 3);
    }

    #[test]
    fn test_zero_budget_is_exhausted() {
        let mut budget = AttemptBudget::new(0);
        assert!(budget.is_exhausted());
        assert_eq!(budget.try_consume(), None);
    }
}

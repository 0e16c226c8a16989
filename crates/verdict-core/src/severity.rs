//! Severity ranking over validation statuses
//!
//! Aggregation picks the worst child status. Which status is "worst" is a
//! deployment policy, so the order is data, not code: a ranking is built
//! from an ordered list, mildest first.

use crate::error::VerdictError;
use crate::types::ValidationStatus;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Total order over [`ValidationStatus`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<ValidationStatus>", into = "Vec<ValidationStatus>")]
pub struct SeverityRanking {
    /// Rank per status, indexed by [`ValidationStatus::index`]
    ranks: [u8; 5],
}

impl SeverityRanking {
    /// Build a ranking from statuses ordered mildest first
    ///
    /// # Errors
    /// Returns `Configuration` unless every status appears exactly once
    pub fn new(order: &[ValidationStatus]) -> Result<Self, VerdictError> {
        if order.len() != ValidationStatus::ALL.len() {
            return Err(VerdictError::Configuration(format!(
                "severity ranking must list {} statuses, got {}",
                ValidationStatus::ALL.len(),
                order.len()
            )));
        }

        let mut ranks = [u8::MAX; 5];
        for (rank, status) in order.iter().enumerate() {
            let slot = &mut ranks[status.index()];
            if *slot != u8::MAX {
                return Err(VerdictError::Configuration(format!(
                    "status {status} listed twice in severity ranking"
                )));
            }
            // order.len() == 5, so the cast cannot truncate
            *slot = rank as u8;
        }

        Ok(Self { ranks })
    }

    /// Rank of a status (0 = mildest)
    #[inline]
    #[must_use]
    pub fn rank(&self, status: ValidationStatus) -> u8 {
        self.ranks[status.index()]
    }

    /// Compare two statuses by severity
    #[inline]
    #[must_use]
    pub fn compare(&self, a: ValidationStatus, b: ValidationStatus) -> Ordering {
        self.rank(a).cmp(&self.rank(b))
    }

    /// Worst status of a set, `None` for an empty set
    pub fn worst<I>(&self, statuses: I) -> Option<ValidationStatus>
    where
        I: IntoIterator<Item = ValidationStatus>,
    {
        statuses.into_iter().max_by_key(|s| self.rank(*s))
    }

    /// Statuses ordered mildest first
    #[must_use]
    pub fn order(&self) -> Vec<ValidationStatus> {
        let mut order = ValidationStatus::ALL.to_vec();
        order.sort_by_key(|s| self.rank(*s));
        order
    }
}

impl Default for SeverityRanking {
    fn default() -> Self {
        Self {
            // Passed < None < Warning < Degraded < Failed
            ranks: [0, 1, 2, 3, 4],
        }
    }
}

impl TryFrom<Vec<ValidationStatus>> for SeverityRanking {
    type Error = VerdictError;

    fn try_from(value: Vec<ValidationStatus>) -> Result<Self, Self::Error> {
        Self::new(&value)
    }
}

impl From<SeverityRanking> for Vec<ValidationStatus> {
    fn from(value: SeverityRanking) -> Self {
        value.order()
    }
}

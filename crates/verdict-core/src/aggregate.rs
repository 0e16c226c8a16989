//! Validation aggregator
//!
//! Parameters get their status from a local rule: a [`Comparator`] chosen
//! by display type, deep JSON equality by default. Tabs, pages and the
//! session take the worst status among their direct children under the
//! configured [`SeverityRanking`].

use crate::severity::SeverityRanking;
use crate::types::ValidationStatus;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Local validation rule for a parameter
pub trait Comparator: Send + Sync {
    /// Compare a collected value with the expectation
    fn compare(&self, expected: &Value, actual: &Value) -> ValidationStatus;
}

/// Structural equality of JSON values
#[derive(Debug, Clone, Copy, Default)]
pub struct DeepEquality;

impl Comparator for DeepEquality {
    fn compare(&self, expected: &Value, actual: &Value) -> ValidationStatus {
        if expected == actual {
            ValidationStatus::Passed
        } else {
            ValidationStatus::Failed
        }
    }
}

/// Comparators by display type, falling back to [`DeepEquality`]
#[derive(Clone)]
pub struct ComparatorRegistry {
    by_display_type: HashMap<String, Arc<dyn Comparator>>,
    fallback: Arc<dyn Comparator>,
}

impl ComparatorRegistry {
    /// Create registry with only the default comparator
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self {
            by_display_type: HashMap::new(),
            fallback: Arc::new(DeepEquality),
        }
    }

    /// Register comparator for a display type
    #[must_use]
    pub fn with(mut self, display_type: impl Into<String>, comparator: Arc<dyn Comparator>) -> Self {
        self.by_display_type.insert(display_type.into(), comparator);
        self
    }

    /// Comparator for a display type
    #[must_use]
    pub fn for_display_type(&self, display_type: Option<&str>) -> &dyn Comparator {
        display_type
            .and_then(|t| self.by_display_type.get(t))
            .map_or(&*self.fallback, |c| &**c)
    }

    /// Validate a parameter
    ///
    /// No expectation yields [`ValidationStatus::None`]; an expectation with
    /// no collected value fails.
    #[must_use]
    pub fn validate(
        &self,
        display_type: Option<&str>,
        expected: Option<&Value>,
        actual: Option<&Value>,
    ) -> ValidationStatus {
        match (expected, actual) {
            (None, _) => ValidationStatus::None,
            (Some(_), None) => ValidationStatus::Failed,
            (Some(expected), Some(actual)) => {
                self.for_display_type(display_type).compare(expected, actual)
            }
        }
    }
}

impl Default for ComparatorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ComparatorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComparatorRegistry")
            .field("display_types", &self.by_display_type.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

/// Status of a scope from its children's final statuses
///
/// An empty scope has nothing validated and aggregates to `None`.
pub fn aggregate<I>(ranking: &SeverityRanking, children: I) -> ValidationStatus
where
    I: IntoIterator<Item = ValidationStatus>,
{
    ranking.worst(children).unwrap_or(ValidationStatus::None)
}

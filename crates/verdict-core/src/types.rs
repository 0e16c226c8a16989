//! Core types for the orchestrator
//!
//! Defines the identifiers and value types shared by every component:
//! - Session and scope identifiers
//! - Validation statuses and scope references
//! - Per-execution configuration flags

use serde::{Deserialize, Serialize};
use std::fmt;
use ulid::Ulid;

macro_rules! scope_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub Ulid);

        impl $name {
            /// Generate a new identifier
            #[inline]
            #[must_use]
            pub fn new() -> Self {
                Self(Ulid::new())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

scope_id!(
    /// Unique session identifier (ULID for sortability)
    SessionId
);
scope_id!(
    /// Unique page identifier within an execution
    PageId
);
scope_id!(
    /// Unique tab identifier within an execution
    TabId
);
scope_id!(
    /// Unique parameter identifier within an execution
    ParamId
);

/// Identifier of a service instance hosting sessions or subscribers
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceId(pub String);

impl InstanceId {
    /// Create instance identifier
    #[inline]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier handed out by an external deferred-search subsystem
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(pub String);

impl RequestId {
    /// Create request identifier
    #[inline]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Outcome of validating a parameter or aggregating a scope
///
/// The declaration order carries no meaning; precedence during aggregation
/// comes from [`crate::severity::SeverityRanking`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStatus {
    /// Actual value matched the expectation
    Passed,
    /// Nothing to validate (no expected value, or empty scope)
    None,
    /// Soft mismatch reported by a comparator
    Warning,
    /// Outcome unknown: external timeout, external failure or unit crash
    Degraded,
    /// Actual value contradicts the expectation
    Failed,
}

impl ValidationStatus {
    /// All statuses, in declaration order
    pub const ALL: [ValidationStatus; 5] = [
        ValidationStatus::Passed,
        ValidationStatus::None,
        ValidationStatus::Warning,
        ValidationStatus::Degraded,
        ValidationStatus::Failed,
    ];

    /// Stable index used by rank tables
    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            ValidationStatus::Passed => 0,
            ValidationStatus::None => 1,
            ValidationStatus::Warning => 2,
            ValidationStatus::Degraded => 3,
            ValidationStatus::Failed => 4,
        }
    }
}

impl fmt::Display for ValidationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ValidationStatus::Passed => "passed",
            ValidationStatus::None => "none",
            ValidationStatus::Warning => "warning",
            ValidationStatus::Degraded => "degraded",
            ValidationStatus::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Reference to any node of the hierarchy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "scope", content = "id", rename_all = "snake_case")]
pub enum ScopeRef {
    /// The session root
    Session,
    /// The common-parameters group of a session
    Common,
    /// A page
    Page(PageId),
    /// A tab
    Tab(TabId),
    /// A leaf parameter
    Parameter(ParamId),
}

impl fmt::Display for ScopeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScopeRef::Session => f.write_str("session"),
            ScopeRef::Common => f.write_str("common"),
            ScopeRef::Page(id) => write!(f, "page:{id}"),
            ScopeRef::Tab(id) => write!(f, "tab:{id}"),
            ScopeRef::Parameter(id) => write!(f, "param:{id}"),
        }
    }
}

/// Flags controlling a single execution of a session
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Pages to collect by name; empty selects every configured page
    pub selected_pages: Vec<String>,
    /// Collect only parameters with a preconfigured value, inline on the caller
    pub preconfigured_only: bool,
    /// Collect common parameters and skip pages
    pub common_only: bool,
    /// Re-collect common parameters even when already loaded
    pub forced_reload: bool,
    /// Collect every configured page regardless of selection
    pub pot_generation: bool,
}

impl ExecutionConfig {
    /// Create default execution config
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// With selected pages
    #[must_use]
    pub fn with_pages<I, S>(mut self, pages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.selected_pages = pages.into_iter().map(Into::into).collect();
        self
    }

    /// Preconfigured-only execution
    #[inline]
    #[must_use]
    pub fn preconfigured_only(mut self) -> Self {
        self.preconfigured_only = true;
        self
    }

    /// Common-parameters-only execution
    #[inline]
    #[must_use]
    pub fn common_only(mut self) -> Self {
        self.common_only = true;
        self
    }

    /// Force common parameters to be collected again
    #[inline]
    #[must_use]
    pub fn forced_reload(mut self) -> Self {
        self.forced_reload = true;
        self
    }

    /// Pot generation mode
    #[inline]
    #[must_use]
    pub fn pot_generation(mut self) -> Self {
        self.pot_generation = true;
        self
    }
}

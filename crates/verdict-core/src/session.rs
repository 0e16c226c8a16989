//! Sessions
//!
//! A session is one client-initiated collection run and the root of the
//! hierarchy. It survives across executions: configuration, the variable
//! table and the common-parameter outcome are kept, the scope arena is
//! rebuilt on every execution.

use crate::arena::{ParameterScope, ScopeArena};
use crate::barrier::Latch;
use crate::error::VerdictError;
use crate::state_machine::{validate_transition, SessionState};
use crate::store::{PageConfig, ParameterConfig};
use crate::types::{ExecutionConfig, InstanceId, PageId, ParamId, SessionId, TabId, ValidationStatus};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;

/// Session root
#[derive(Debug)]
pub struct Session {
    /// Identifier
    pub id: SessionId,
    /// Configuration folder
    pub folder: String,
    /// Instance executing the session
    pub owner: InstanceId,
    /// Creation time
    pub created_at: DateTime<Utc>,
    last_touched: Mutex<DateTime<Utc>>,
    variables: DashMap<String, String>,
    state: watch::Sender<SessionState>,
    execution: RwLock<ExecutionConfig>,
    pages: Vec<PageConfig>,
    common: Vec<ParameterConfig>,
    common_loaded: Latch,
    common_status: Mutex<Option<ValidationStatus>>,
    status: Mutex<Option<ValidationStatus>>,
    arena: RwLock<Option<Arc<ScopeArena>>>,
}

impl Session {
    /// Create session in the `Created` state
    pub fn new(
        folder: impl Into<String>,
        owner: InstanceId,
        pages: Vec<PageConfig>,
        common: Vec<ParameterConfig>,
        variables: impl IntoIterator<Item = (String, String)>,
        now: DateTime<Utc>,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Created);
        Self {
            id: SessionId::new(),
            folder: folder.into(),
            owner,
            created_at: now,
            last_touched: Mutex::new(now),
            variables: variables.into_iter().collect(),
            state,
            execution: RwLock::new(ExecutionConfig::default()),
            pages,
            common,
            common_loaded: Latch::new(),
            common_status: Mutex::new(None),
            status: Mutex::new(None),
            arena: RwLock::new(None),
        }
    }

    /// Current lifecycle state
    #[inline]
    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Watch lifecycle changes
    #[inline]
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Move to `to`, validating the transition
    ///
    /// # Errors
    /// Returns `IllegalTransition` if `to` is not reachable from the current state
    pub fn transition(&self, to: SessionState) -> Result<SessionState, VerdictError> {
        let mut outcome = Err(VerdictError::Fatal("transition not attempted".to_string()));
        self.state.send_if_modified(|current| {
            let from = *current;
            match validate_transition(from, to) {
                Ok(()) => {
                    *current = to;
                    outcome = Ok(from);
                    true
                }
                Err(e) => {
                    outcome = Err(e);
                    false
                }
            }
        });
        if let Ok(from) = outcome {
            tracing::debug!(session = %self.id, ?from, ?to, "session transition");
        }
        outcome
    }

    /// Start an execution: install a fresh arena and leave the idle state
    ///
    /// # Errors
    /// Returns `DuplicateRequest` if an execution is already running, or
    /// `IllegalTransition` if the session has expired
    pub fn begin_execution(
        &self,
        config: ExecutionConfig,
        arena: Arc<ScopeArena>,
        first: SessionState,
    ) -> Result<(), VerdictError> {
        let mut outcome = Ok(());
        self.state.send_if_modified(|current| {
            if !current.is_idle() {
                outcome = Err(if *current == SessionState::Expired {
                    VerdictError::IllegalTransition {
                        from: *current,
                        to: first,
                    }
                } else {
                    VerdictError::DuplicateRequest(format!(
                        "session {} is already executing ({current:?})",
                        self.id
                    ))
                });
                return false;
            }
            if let Err(e) = validate_transition(*current, first) {
                outcome = Err(e);
                return false;
            }
            *self.execution.write() = config;
            *self.arena.write() = Some(arena);
            *self.status.lock() = None;
            *current = first;
            true
        });
        outcome
    }

    /// Arena of the current execution
    ///
    /// # Errors
    /// Returns `NotFound` before the first execution
    pub fn arena(&self) -> Result<Arc<ScopeArena>, VerdictError> {
        self.arena
            .read()
            .clone()
            .ok_or_else(|| VerdictError::not_found("execution", self.id))
    }

    /// Execution flags of the current execution
    #[inline]
    #[must_use]
    pub fn execution(&self) -> ExecutionConfig {
        self.execution.read().clone()
    }

    /// Whether the current execution runs everything inline
    #[inline]
    #[must_use]
    pub fn preconfigured_only(&self) -> bool {
        self.execution.read().preconfigured_only
    }

    /// Configured pages
    #[inline]
    #[must_use]
    pub fn pages(&self) -> &[PageConfig] {
        &self.pages
    }

    /// Configured common parameters
    #[inline]
    #[must_use]
    pub fn common_params(&self) -> &[ParameterConfig] {
        &self.common
    }

    /// Whether common parameters have been collected at least once
    #[inline]
    #[must_use]
    pub fn common_loaded(&self) -> bool {
        self.common_loaded.is_set()
    }

    /// Record the outcome of common-parameter collection
    ///
    /// `None` means no common parameter took part and leaves the session
    /// verdict to the pages.
    pub fn record_common(&self, status: Option<ValidationStatus>) {
        *self.common_status.lock() = status;
    }

    /// Common values are in the variable table; later executions skip
    /// collecting them unless reloading is forced
    #[inline]
    pub fn mark_common_loaded(&self) {
        self.common_loaded.set();
    }

    /// Status of the last common-parameter collection
    #[inline]
    #[must_use]
    pub fn common_status(&self) -> Option<ValidationStatus> {
        *self.common_status.lock()
    }

    /// Final status of the last execution
    #[inline]
    #[must_use]
    pub fn status(&self) -> Option<ValidationStatus> {
        *self.status.lock()
    }

    /// Record final status
    #[inline]
    pub fn set_status(&self, status: ValidationStatus) {
        *self.status.lock() = Some(status);
    }

    /// Shared variable table
    #[inline]
    #[must_use]
    pub fn variables(&self) -> &DashMap<String, String> {
        &self.variables
    }

    /// Set a variable; last write wins
    #[inline]
    pub fn set_variable(&self, key: impl Into<String>, value: impl Into<String>) {
        self.variables.insert(key.into(), value.into());
    }

    /// Mark activity at `now`
    #[inline]
    pub fn touch(&self, now: DateTime<Utc>) {
        *self.last_touched.lock() = now;
    }

    /// Last activity
    #[inline]
    #[must_use]
    pub fn last_touched(&self) -> DateTime<Utc> {
        *self.last_touched.lock()
    }

    /// Point-in-time view of the session and its current execution
    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        let arena = self.arena.read().clone();
        let (common, pages) = match arena.as_deref() {
            Some(arena) => (
                arena
                    .common_ids()
                    .iter()
                    .filter_map(|id| arena.param(*id).ok())
                    .map(ParameterSnapshot::from_scope)
                    .collect(),
                arena
                    .page_ids()
                    .iter()
                    .filter_map(|id| arena.page(*id).ok())
                    .map(|page| PageSnapshot {
                        id: page.group.id,
                        name: page.group.name.clone(),
                        status: page.group.status(),
                        pending: page.group.barrier.remaining(),
                        tabs: page
                            .tabs
                            .iter()
                            .filter_map(|id| arena.tab(*id).ok())
                            .map(|tab| TabSnapshot {
                                id: tab.group.id,
                                name: tab.group.name.clone(),
                                status: tab.group.status(),
                                pending: tab.group.barrier.remaining(),
                                parameters: tab
                                    .params
                                    .iter()
                                    .filter_map(|id| arena.param(*id).ok())
                                    .map(ParameterSnapshot::from_scope)
                                    .collect(),
                            })
                            .collect(),
                    })
                    .collect(),
            ),
            None => (Vec::new(), Vec::new()),
        };

        SessionSnapshot {
            id: self.id,
            folder: self.folder.clone(),
            state: self.state(),
            status: self.status(),
            common_status: self.common_status(),
            variables: self
                .variables
                .iter()
                .map(|e| (e.key().clone(), e.value().clone()))
                .collect(),
            common,
            pages,
        }
    }
}

/// View of a session
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub folder: String,
    pub state: SessionState,
    pub status: Option<ValidationStatus>,
    pub common_status: Option<ValidationStatus>,
    pub variables: BTreeMap<String, String>,
    pub common: Vec<ParameterSnapshot>,
    pub pages: Vec<PageSnapshot>,
}

impl SessionSnapshot {
    /// Find a page by name
    #[must_use]
    pub fn page(&self, name: &str) -> Option<&PageSnapshot> {
        self.pages.iter().find(|p| p.name == name)
    }
}

/// View of a page
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PageSnapshot {
    pub id: PageId,
    pub name: String,
    pub status: Option<ValidationStatus>,
    /// Tabs not yet aggregated
    pub pending: usize,
    pub tabs: Vec<TabSnapshot>,
}

impl PageSnapshot {
    /// Find a tab by name
    #[must_use]
    pub fn tab(&self, name: &str) -> Option<&TabSnapshot> {
        self.tabs.iter().find(|t| t.name == name)
    }
}

/// View of a tab
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TabSnapshot {
    pub id: TabId,
    pub name: String,
    pub status: Option<ValidationStatus>,
    /// Parameters not yet resolved
    pub pending: usize,
    pub parameters: Vec<ParameterSnapshot>,
}

impl TabSnapshot {
    /// Find a parameter by name
    #[must_use]
    pub fn parameter(&self, name: &str) -> Option<&ParameterSnapshot> {
        self.parameters.iter().find(|p| p.name == name)
    }
}

/// View of a parameter
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParameterSnapshot {
    pub id: ParamId,
    pub name: String,
    pub path: String,
    pub status: Option<ValidationStatus>,
    pub actual: Option<Value>,
    pub expected: Option<Value>,
    pub error: Option<String>,
}

impl ParameterSnapshot {
    fn from_scope(scope: &ParameterScope) -> Self {
        let state = scope.state();
        Self {
            id: scope.id,
            name: scope.name().to_string(),
            path: scope.path.clone(),
            status: state.status,
            actual: state.actual,
            expected: scope.config.expected.clone(),
            error: state.error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session::new(
            "crm",
            InstanceId::new("local"),
            Vec::new(),
            Vec::new(),
            [("account".to_string(), "42".to_string())],
            Utc::now(),
        )
    }

    #[test]
    fn new_session_is_created_with_variables() {
        let s = session();
        assert_eq!(s.state(), SessionState::Created);
        assert_eq!(s.variables().get("account").unwrap().value(), "42");
        assert!(s.arena().is_err());
    }

    #[test]
    fn begin_execution_rejects_concurrent_runs() {
        let s = session();
        let arena = Arc::new(ScopeArena::build(&[], &[], false));

        s.begin_execution(ExecutionConfig::new(), arena.clone(), SessionState::CollectingPages)
            .unwrap();
        assert_eq!(s.state(), SessionState::CollectingPages);

        let err = s
            .begin_execution(ExecutionConfig::new(), arena, SessionState::CollectingPages)
            .unwrap_err();
        assert!(matches!(err, VerdictError::DuplicateRequest(_)));
    }

    #[test]
    fn transition_validates() {
        let s = session();
        assert!(s.transition(SessionState::Resolved).is_err());
        assert_eq!(s.state(), SessionState::Created);
        assert_eq!(s.transition(SessionState::Expired).unwrap(), SessionState::Created);
    }

    #[test]
    fn expired_session_cannot_execute() {
        let s = session();
        s.transition(SessionState::Expired).unwrap();
        let arena = Arc::new(ScopeArena::build(&[], &[], false));
        let err = s
            .begin_execution(ExecutionConfig::new(), arena, SessionState::CollectingPages)
            .unwrap_err();
        assert!(matches!(err, VerdictError::IllegalTransition { .. }));
    }

    #[tokio::test]
    async fn subscribers_see_transitions() {
        let s = session();
        let mut rx = s.subscribe();
        s.transition(SessionState::CollectingPages).unwrap();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), SessionState::CollectingPages);
    }

    #[test]
    fn snapshot_without_execution() {
        let s = session();
        let snap = s.snapshot();
        assert_eq!(snap.state, SessionState::Created);
        assert!(snap.pages.is_empty());
        assert_eq!(snap.variables.get("account").map(String::as_str), Some("42"));
    }
}

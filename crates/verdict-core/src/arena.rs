//! Scope arena
//!
//! One arena per execution of a session. Scopes are stored by id and refer
//! to their children and parent by id only; the arena is built once at
//! dispatch time and never restructured, so lookups need no locking. The
//! mutable parts of a scope (status, collected value, barrier, latches)
//! carry their own synchronization.

use crate::barrier::{CompletionBarrier, Latch};
use crate::error::VerdictError;
use crate::store::{PageConfig, ParameterConfig};
use crate::types::{PageId, ParamId, RequestId, ScopeRef, TabId, ValidationStatus};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Owner of a parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParentRef {
    /// Common parameter of the session
    Common,
    /// Source-under-test parameter of a tab
    Tab(TabId),
}

/// Mutable part of a parameter
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParameterState {
    /// Collected value
    pub actual: Option<Value>,
    /// Validation status once resolved
    pub status: Option<ValidationStatus>,
    /// Why the status is degraded, if it is
    pub error: Option<String>,
    /// Deferred request currently awaited
    pub request_id: Option<RequestId>,
}

/// Leaf unit of work
#[derive(Debug)]
pub struct ParameterScope {
    /// Identifier
    pub id: ParamId,
    /// Owner
    pub parent: ParentRef,
    /// Logical path (`page/tab/name` or `common/name`)
    pub path: String,
    /// Configuration
    pub config: ParameterConfig,
    state: Mutex<ParameterState>,
    completed: Latch,
}

impl ParameterScope {
    fn new(parent: ParentRef, path: String, config: ParameterConfig) -> Self {
        Self {
            id: ParamId::new(),
            parent,
            path,
            config,
            state: Mutex::new(ParameterState::default()),
            completed: Latch::new(),
        }
    }

    /// Parameter name
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Copy of the mutable state
    #[must_use]
    pub fn state(&self) -> ParameterState {
        self.state.lock().clone()
    }

    /// Mutate state under the parameter lock
    pub fn update<R>(&self, f: impl FnOnce(&mut ParameterState) -> R) -> R {
        f(&mut self.state.lock())
    }

    /// Claim the parameter's single completion; `false` if already claimed
    #[inline]
    pub fn claim_completion(&self) -> bool {
        self.completed.set()
    }

    /// Whether the parameter has completed
    #[inline]
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.completed.is_set()
    }
}

/// Intermediate scope shared by pages and tabs
#[derive(Debug)]
pub struct GroupScope<Id> {
    /// Identifier
    pub id: Id,
    /// Display name
    pub name: String,
    /// Every descendant parameter is synchronous
    pub all_sync: bool,
    /// Countdown over direct children
    pub barrier: CompletionBarrier,
    /// Children have been dispatched
    pub dispatch_started: Latch,
    /// Status has been aggregated
    pub aggregated: Latch,
    status: Mutex<Option<ValidationStatus>>,
}

impl<Id> GroupScope<Id> {
    fn new(id: Id, scope: ScopeRef, name: String, children: usize, all_sync: bool) -> Self {
        Self {
            id,
            name,
            all_sync,
            barrier: CompletionBarrier::new(scope, children),
            dispatch_started: Latch::new(),
            aggregated: Latch::new(),
            status: Mutex::new(None),
        }
    }

    /// Aggregated status, `None` while pending
    #[inline]
    #[must_use]
    pub fn status(&self) -> Option<ValidationStatus> {
        *self.status.lock()
    }

    /// Record aggregated status
    #[inline]
    pub fn set_status(&self, status: ValidationStatus) {
        *self.status.lock() = Some(status);
    }
}

/// Page scope
#[derive(Debug)]
pub struct PageScope {
    /// Shared scope state
    pub group: GroupScope<PageId>,
    /// Child tabs in display order
    pub tabs: Vec<TabId>,
}

/// Tab scope
#[derive(Debug)]
pub struct TabScope {
    /// Shared scope state
    pub group: GroupScope<TabId>,
    /// Owning page
    pub page: PageId,
    /// Child parameters in display order
    pub params: Vec<ParamId>,
}

/// All scopes of one execution
#[derive(Debug)]
pub struct ScopeArena {
    pages: HashMap<PageId, PageScope>,
    page_order: Vec<PageId>,
    tabs: HashMap<TabId, TabScope>,
    params: HashMap<ParamId, ParameterScope>,
    common: Vec<ParamId>,
    /// Countdown over common parameters
    pub common_barrier: CompletionBarrier,
    /// Common status has been aggregated
    pub common_aggregated: Latch,
    /// Countdown over pages
    pub session_barrier: CompletionBarrier,
    /// Session status has been aggregated
    pub session_aggregated: Latch,
    /// Page collection has been started
    pub pages_started: Latch,
}

impl ScopeArena {
    /// Build the arena for one execution
    ///
    /// With `preconfigured_only`, parameters without a preconfigured value
    /// are left out entirely so they never count towards a barrier.
    #[must_use]
    pub fn build(common: &[ParameterConfig], pages: &[&PageConfig], preconfigured_only: bool) -> Self {
        let included = |p: &&ParameterConfig| !preconfigured_only || p.preconfigured.is_some();

        let mut params = HashMap::new();
        let mut common_ids = Vec::new();
        for config in common.iter().filter(included) {
            let scope = ParameterScope::new(
                ParentRef::Common,
                format!("common/{}", config.name),
                config.clone(),
            );
            common_ids.push(scope.id);
            params.insert(scope.id, scope);
        }

        let mut page_map = HashMap::new();
        let mut page_order = Vec::new();
        let mut tab_map = HashMap::new();

        for page_config in pages {
            let page_id = PageId::new();
            let mut tab_ids = Vec::new();
            let mut page_sync = true;

            for tab_config in &page_config.tabs {
                let tab_id = TabId::new();
                let mut param_ids = Vec::new();
                let mut tab_sync = true;

                for config in tab_config.parameters.iter().filter(included) {
                    tab_sync &= config.synchronous;
                    let scope = ParameterScope::new(
                        ParentRef::Tab(tab_id),
                        format!("{}/{}/{}", page_config.name, tab_config.name, config.name),
                        config.clone(),
                    );
                    param_ids.push(scope.id);
                    params.insert(scope.id, scope);
                }

                page_sync &= tab_sync;
                tab_ids.push(tab_id);
                tab_map.insert(
                    tab_id,
                    TabScope {
                        group: GroupScope::new(
                            tab_id,
                            ScopeRef::Tab(tab_id),
                            tab_config.name.clone(),
                            param_ids.len(),
                            tab_sync,
                        ),
                        page: page_id,
                        params: param_ids,
                    },
                );
            }

            page_order.push(page_id);
            page_map.insert(
                page_id,
                PageScope {
                    group: GroupScope::new(
                        page_id,
                        ScopeRef::Page(page_id),
                        page_config.name.clone(),
                        tab_ids.len(),
                        page_sync,
                    ),
                    tabs: tab_ids,
                },
            );
        }

        Self {
            common_barrier: CompletionBarrier::new(ScopeRef::Common, common_ids.len()),
            common_aggregated: Latch::new(),
            session_barrier: CompletionBarrier::new(ScopeRef::Session, page_order.len()),
            session_aggregated: Latch::new(),
            pages_started: Latch::new(),
            pages: page_map,
            page_order,
            tabs: tab_map,
            params,
            common: common_ids,
        }
    }

    /// Look up a page
    ///
    /// # Errors
    /// Returns `NotFound` for an unknown id
    pub fn page(&self, id: PageId) -> Result<&PageScope, VerdictError> {
        self.pages.get(&id).ok_or_else(|| VerdictError::not_found("page", id))
    }

    /// Look up a tab
    ///
    /// # Errors
    /// Returns `NotFound` for an unknown id
    pub fn tab(&self, id: TabId) -> Result<&TabScope, VerdictError> {
        self.tabs.get(&id).ok_or_else(|| VerdictError::not_found("tab", id))
    }

    /// Look up a parameter
    ///
    /// # Errors
    /// Returns `NotFound` for an unknown id
    pub fn param(&self, id: ParamId) -> Result<&ParameterScope, VerdictError> {
        self.params.get(&id).ok_or_else(|| VerdictError::not_found("parameter", id))
    }

    /// Page ids in display order
    #[inline]
    #[must_use]
    pub fn page_ids(&self) -> &[PageId] {
        &self.page_order
    }

    /// Common parameter ids
    #[inline]
    #[must_use]
    pub fn common_ids(&self) -> &[ParamId] {
        &self.common
    }

    /// Number of parameters in the arena
    #[inline]
    #[must_use]
    pub fn param_count(&self) -> usize {
        self.params.len()
    }

    /// Find a parameter by logical path
    #[must_use]
    pub fn find_param(&self, path: &str) -> Option<&ParameterScope> {
        self.params.values().find(|p| p.path == path)
    }

    /// Find a page by name
    #[must_use]
    pub fn find_page(&self, name: &str) -> Option<&PageScope> {
        self.pages.values().find(|p| p.group.name == name)
    }

    /// Final statuses of the common parameters that resolved
    #[must_use]
    pub fn common_statuses(&self) -> Vec<ValidationStatus> {
        self.common
            .iter()
            .filter_map(|id| self.params.get(id))
            .filter_map(|p| p.state().status)
            .collect()
    }
}

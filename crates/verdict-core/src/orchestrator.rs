//! Session orchestrator
//!
//! Owns the sessions, the deferred result registry and the worker pools,
//! and drives the hierarchy:
//!
//! 1. Common parameters are collected (first execution, or forced reload)
//! 2. Their values are written to the session variable table
//! 3. Selected pages dispatch their tabs, tabs dispatch their parameters
//! 4. Collected parameters are validated, or parked until a deferred
//!    result or a timeout arrives
//! 5. Each resolution counts down its parent's barrier; the unit whose
//!    decrement fires the barrier aggregates the scope and moves up
//!
//! Units never wait on each other. A unit returns its follow-up units and
//! [`Orchestrator`] either runs them inline or hands them to a pool. Any
//! error or panic inside a unit is absorbed as a `Degraded` status on the
//! unit's scope so every barrier still reaches zero.

use crate::aggregate::{aggregate, ComparatorRegistry};
use crate::arena::{PageScope, ParameterScope, ParentRef, ScopeArena, TabScope};
use crate::config::OrchestratorConfig;
use crate::connector::{
    substitute, value_as_variable, ConnectorRegistry, ConnectorRequest, DeferredSearch,
    NoDeferredSearch, SearchQuery,
};
use crate::deferred::{DeferredContext, DeferredOutcome, DeferredResultRegistry};
use crate::delivery::{EventBus, OrchestratorEvent, ParameterResolved, ResultSink, ScopeAggregated};
use crate::dispatch::{route, Dispatcher, Mode, Phase, PoolStats, RouteContext, Task};
use crate::error::VerdictError;
use crate::session::{Session, SessionSnapshot};
use crate::state_machine::SessionState;
use crate::store::{ConfigStore, PageConfig, ParameterConfig};
use crate::types::{
    ExecutionConfig, InstanceId, PageId, ParamId, RequestId, ScopeRef, SessionId, TabId,
    ValidationStatus,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::FutureExt;
use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// External systems the orchestrator talks to
#[derive(Clone)]
pub struct Collaborators {
    /// Page and parameter configuration
    pub config_store: Arc<dyn ConfigStore>,
    /// Synchronous-reply data sources
    pub connectors: ConnectorRegistry,
    /// Out-of-band search subsystem
    pub deferred_search: Arc<dyn DeferredSearch>,
    /// Extra receiver of results besides the local event bus
    pub sink: Option<Arc<dyn ResultSink>>,
    /// Parameter validation rules
    pub comparators: ComparatorRegistry,
}

impl Collaborators {
    /// Create with a config store and defaults for everything else
    pub fn new(config_store: Arc<dyn ConfigStore>) -> Self {
        Self {
            config_store,
            connectors: ConnectorRegistry::new(),
            deferred_search: Arc::new(NoDeferredSearch),
            sink: None,
            comparators: ComparatorRegistry::new(),
        }
    }

    /// With connector registry
    #[must_use]
    pub fn with_connectors(mut self, connectors: ConnectorRegistry) -> Self {
        self.connectors = connectors;
        self
    }

    /// With deferred-search subsystem
    #[must_use]
    pub fn with_deferred_search(mut self, search: Arc<dyn DeferredSearch>) -> Self {
        self.deferred_search = search;
        self
    }

    /// With result sink
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn ResultSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// With comparators
    #[must_use]
    pub fn with_comparators(mut self, comparators: ComparatorRegistry) -> Self {
        self.comparators = comparators;
        self
    }
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators")
            .field("connectors", &self.connectors)
            .field("comparators", &self.comparators)
            .field("sink", &self.sink.is_some())
            .finish_non_exhaustive()
    }
}

/// Request to open a session
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionRequest {
    /// Configuration folder
    pub folder: String,
    /// Values for the folder's key parameters
    pub key_values: HashMap<String, String>,
}

impl SessionRequest {
    /// Create request for `folder`
    pub fn new(folder: impl Into<String>) -> Self {
        Self {
            folder: folder.into(),
            key_values: HashMap::new(),
        }
    }

    /// With a key parameter value
    #[must_use]
    pub fn with_key(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.key_values.insert(name.into(), value.into());
        self
    }
}

/// Hierarchical collection and validation orchestrator
///
/// Cheap to clone; clones share all state.
#[derive(Debug, Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    config: OrchestratorConfig,
    instance: InstanceId,
    session_ttl: chrono::Duration,
    sessions: DashMap<SessionId, Arc<Session>>,
    registry: DeferredResultRegistry,
    dispatcher: Dispatcher,
    events: EventBus,
    collaborators: Collaborators,
}

impl Orchestrator {
    /// Create orchestrator and start its worker pools
    ///
    /// # Errors
    /// Returns `Configuration` when `config` is invalid
    ///
    /// # Panics
    /// Panics when called outside a tokio runtime
    pub fn new(config: OrchestratorConfig, collaborators: Collaborators) -> Result<Self, VerdictError> {
        config.validate()?;
        let deferred_ttl = to_chrono(config.deferred_ttl())?;
        let session_ttl = to_chrono(config.session_ttl())?;

        tracing::info!(
            instance = %config.instance_id,
            collection_workers = config.collection_workers,
            validation_workers = config.validation_workers,
            "starting orchestrator"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                instance: config.instance(),
                session_ttl,
                sessions: DashMap::new(),
                registry: DeferredResultRegistry::new(deferred_ttl),
                dispatcher: Dispatcher::start(config.collection_workers, config.validation_workers),
                events: EventBus::new(config.event_capacity),
                collaborators,
                config,
            }),
        })
    }

    /// Configuration in use
    #[inline]
    #[must_use]
    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    /// Subscribe to published results
    #[inline]
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.inner.events.subscribe()
    }

    /// Open a session on `request.folder`
    ///
    /// Key parameters seed the variable table; a required key without a
    /// value and without a default rejects the request.
    ///
    /// # Errors
    /// - `NotFound` if the folder does not exist
    /// - `InvalidRequest` on a bad folder name or a missing required key
    /// - `Configuration` if the folder's parameter files are malformed
    pub async fn create_session(&self, request: SessionRequest) -> Result<SessionId, VerdictError> {
        let store = &self.inner.collaborators.config_store;
        let folder = request.folder.as_str();
        let (keys, pages, common) = tokio::try_join!(
            store.load_key_params(folder),
            store.load_pages(folder),
            store.load_common_params(folder),
        )?;

        let mut variables = request.key_values.clone();
        for key in &keys {
            if variables.contains_key(&key.name) {
                continue;
            }
            match (&key.default, key.required) {
                (Some(default), _) => {
                    variables.insert(key.name.clone(), default.clone());
                }
                (None, true) => {
                    return Err(VerdictError::InvalidRequest(format!(
                        "missing required key parameter: {}",
                        key.name
                    )));
                }
                (None, false) => {}
            }
        }

        let session = Arc::new(Session::new(
            folder,
            self.inner.instance.clone(),
            pages,
            common,
            variables,
            Utc::now(),
        ));
        let id = session.id;
        self.inner.sessions.insert(id, session);

        tracing::info!(session = %id, folder, "session created");
        Ok(id)
    }

    /// Look up a session
    ///
    /// # Errors
    /// Returns `NotFound` for an unknown or expired session
    pub fn session(&self, id: SessionId) -> Result<Arc<Session>, VerdictError> {
        self.inner
            .sessions
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| VerdictError::not_found("session", id))
    }

    /// Ids of live sessions
    #[must_use]
    pub fn session_ids(&self) -> Vec<SessionId> {
        self.inner.sessions.iter().map(|entry| *entry.key()).collect()
    }

    /// Run the session's hierarchy
    ///
    /// Returns once the inline part of the work is done. With
    /// `preconfigured_only` everything is inline and the session is
    /// resolved on return; otherwise pool work continues in the background
    /// (see [`Orchestrator::wait_until_settled`]).
    ///
    /// # Errors
    /// - `NotFound` for an unknown session
    /// - `InvalidRequest` for an unknown selected page
    /// - `DuplicateRequest` while a previous execution is still running
    pub async fn execute(&self, id: SessionId, execution: ExecutionConfig) -> Result<(), VerdictError> {
        let session = self.session(id)?;
        session.touch(Utc::now());

        let pages = select_pages(session.pages(), &execution)?;
        let collect_common =
            execution.common_only || execution.forced_reload || !session.common_loaded();
        let common: &[ParameterConfig] = if collect_common {
            session.common_params()
        } else {
            &[]
        };
        let arena = Arc::new(ScopeArena::build(common, &pages, execution.preconfigured_only));
        let first = if collect_common {
            SessionState::CollectingCommon
        } else {
            SessionState::CollectingPages
        };

        tracing::info!(
            session = %id,
            pages = pages.len(),
            parameters = arena.param_count(),
            collect_common,
            preconfigured_only = execution.preconfigured_only,
            "executing session"
        );
        session.begin_execution(execution, arena.clone(), first)?;

        let tasks = if collect_common {
            self.start_common(&session, &arena)
        } else {
            self.start_pages(&session, &arena)
        };
        self.drive(tasks).await;
        Ok(())
    }

    /// Mark client activity, postponing expiry
    ///
    /// # Errors
    /// Returns `NotFound` for an unknown session
    pub fn touch(&self, id: SessionId) -> Result<(), VerdictError> {
        self.session(id)?.touch(Utc::now());
        Ok(())
    }

    /// Current view of a session
    ///
    /// # Errors
    /// Returns `NotFound` for an unknown session
    pub fn snapshot(&self, id: SessionId) -> Result<SessionSnapshot, VerdictError> {
        Ok(self.session(id)?.snapshot())
    }

    /// Wait until the session is resolved or expired
    ///
    /// Returns `None` if that does not happen within `timeout`.
    ///
    /// # Errors
    /// Returns `NotFound` for an unknown session
    pub async fn wait_until_settled(
        &self,
        id: SessionId,
        timeout: Duration,
    ) -> Result<Option<SessionSnapshot>, VerdictError> {
        let session = self.session(id)?;
        let mut rx = session.subscribe();
        let settled = tokio::time::timeout(timeout, async {
            rx.wait_for(|state| state.is_settled()).await.map(|_| ())
        })
        .await;

        match settled {
            Ok(Ok(())) => Ok(Some(session.snapshot())),
            Ok(Err(_)) | Err(_) => Ok(None),
        }
    }

    /// Inbound callback from the deferred-search subsystem
    ///
    /// Returns `false` when nobody waits for `request_id` (already resolved,
    /// timed out, its session expired, or not registered yet). A result that
    /// overtakes the registration of its request is held and applied as soon
    /// as the request registers.
    pub async fn on_deferred_result(&self, request_id: &RequestId, outcome: DeferredOutcome) -> bool {
        let Some((context, outcome)) = self.inner.registry.resolve(request_id, outcome, Utc::now())
        else {
            return false;
        };
        let Some((session, arena)) = self.locate(context.session) else {
            tracing::debug!(%request_id, session = %context.session, "deferred result for gone session");
            return false;
        };
        let Ok(scope) = arena.param(context.param) else {
            tracing::debug!(%request_id, "deferred result for parameter of a previous execution");
            return false;
        };

        tracing::debug!(%request_id, session = %session.id, param = %scope.path, "deferred result arrived");
        let tasks = self.apply_outcome(&session, &arena, scope, outcome);
        self.drive(tasks).await;
        true
    }

    /// Evict deferred requests older than the deferred TTL at `now`
    ///
    /// Their parameters resolve `Degraded` and the external searches are
    /// cancelled. Returns how many were evicted.
    pub async fn sweep_deferred(&self, now: DateTime<Utc>) -> usize {
        let expired = self.inner.registry.sweep_expired(now);
        if expired.is_empty() {
            return 0;
        }

        let reason = format!(
            "no result within {}s",
            self.inner.registry.ttl().num_seconds()
        );
        let mut tasks = Vec::new();
        for context in &expired {
            let Some((session, arena)) = self.locate(context.session) else {
                continue;
            };
            if let Ok(scope) = arena.param(context.param) {
                tracing::warn!(
                    session = %session.id,
                    param = %scope.path,
                    request_id = %context.request_id,
                    "deferred result timed out"
                );
                tasks.extend(self.complete_parameter(
                    &session,
                    &arena,
                    scope,
                    ValidationStatus::Degraded,
                    Some(reason.clone()),
                ));
            }
        }

        self.cancel(&expired).await;
        self.drive(tasks).await;
        expired.len()
    }

    /// Expire sessions idle for longer than the session TTL at `now`
    pub async fn sweep_sessions(&self, now: DateTime<Utc>) -> Vec<SessionId> {
        let stale: Vec<SessionId> = self
            .inner
            .sessions
            .iter()
            .filter(|entry| now - entry.value().last_touched() > self.inner.session_ttl)
            .map(|entry| *entry.key())
            .collect();

        let mut expired = Vec::with_capacity(stale.len());
        for id in stale {
            if self.expire(id).await.is_ok() {
                expired.push(id);
            }
        }
        expired
    }

    /// Expire a session now
    ///
    /// The session turns `Expired` first. Outstanding deferred requests then
    /// resolve `Degraded` and are cancelled; their tabs and pages still
    /// publish aggregates, but the session itself is never aggregated or
    /// `Resolved` on this path. `SessionExpired` is the last event. Later
    /// results for the session are discarded.
    ///
    /// # Errors
    /// Returns `NotFound` for an unknown session
    pub async fn expire(&self, id: SessionId) -> Result<(), VerdictError> {
        let (_, session) = self
            .inner
            .sessions
            .remove(&id)
            .ok_or_else(|| VerdictError::not_found("session", id))?;

        if let Err(e) = session.transition(SessionState::Expired) {
            tracing::warn!(session = %id, error = %e, "expiring session in unexpected state");
        }

        let drained = self.inner.registry.drain_session(id);
        if let Ok(arena) = session.arena() {
            for context in &drained {
                if let Ok(scope) = arena.param(context.param) {
                    // Follow-up units would only touch the removed session.
                    let _ = self.complete_parameter(
                        &session,
                        &arena,
                        scope,
                        ValidationStatus::Degraded,
                        Some("session expired".to_string()),
                    );
                }
            }
        }
        self.cancel(&drained).await;
        self.emit(OrchestratorEvent::SessionExpired { session: id });
        tracing::info!(session = %id, cancelled = drained.len(), "session expired");
        Ok(())
    }

    /// Number of deferred requests awaiting a result
    #[inline]
    #[must_use]
    pub fn pending_deferred(&self) -> usize {
        self.inner.registry.len()
    }

    /// Statistics of the collection and validation pools
    #[must_use]
    pub fn pool_stats(&self) -> [PoolStats; 2] {
        self.inner.dispatcher.stats()
    }

    /// Stop the worker pools after draining queued units
    pub async fn shutdown(&self) {
        tracing::info!(instance = %self.inner.instance, "shutting down orchestrator");
        self.inner.dispatcher.shutdown().await;
    }

    // ---- scheduling -------------------------------------------------------

    async fn drive(&self, tasks: impl IntoIterator<Item = Task>) {
        let mut queue: VecDeque<Task> = tasks.into_iter().collect();
        while let Some(task) = queue.pop_front() {
            match route(&task, self.route_context(&task)) {
                Mode::Inline => queue.extend(self.run_guarded(task).await),
                Mode::Pool(phase) => {
                    if let Err(e) = self.submit(phase, task) {
                        tracing::warn!(%task, error = %e, "pool unavailable, running inline");
                        queue.extend(self.run_guarded(task).await);
                    }
                }
            }
        }
    }

    fn submit(&self, phase: Phase, task: Task) -> Result<(), VerdictError> {
        let this = self.clone();
        self.inner.dispatcher.submit(
            phase,
            async move {
                let next = this.run_guarded(task).await;
                this.drive(next).await;
            }
            .boxed(),
        )
    }

    fn route_context(&self, task: &Task) -> RouteContext {
        let Some((session, arena)) = self.locate(task.session()) else {
            // Unit will find nothing to do; no point queueing it.
            return RouteContext {
                preconfigured_only: false,
                synchronous: true,
            };
        };
        let synchronous = match *task {
            Task::CollectCommon { param, .. }
            | Task::CollectParameter { param, .. }
            | Task::ValidateParameter { param, .. } => {
                arena.param(param).map_or(true, |p| p.config.synchronous)
            }
            Task::CollectPage { page, .. } => arena.page(page).map_or(true, |p| p.group.all_sync),
            Task::CollectTab { tab, .. } => arena.tab(tab).map_or(true, |t| t.group.all_sync),
        };
        RouteContext {
            preconfigured_only: session.preconfigured_only(),
            synchronous,
        }
    }

    async fn run_guarded(&self, task: Task) -> Vec<Task> {
        match AssertUnwindSafe(self.run_unit(task)).catch_unwind().await {
            Ok(Ok(next)) => next,
            Ok(Err(e)) => {
                tracing::warn!(%task, error = %e, "unit failed");
                self.absorb_failure(task, e.to_string())
            }
            Err(panic) => {
                let reason = format!("unit panicked: {}", panic_message(&*panic));
                tracing::error!(%task, %reason, "unit panicked");
                self.absorb_failure(task, reason)
            }
        }
    }

    async fn run_unit(&self, task: Task) -> Result<Vec<Task>, VerdictError> {
        let session = self.session(task.session())?;
        let arena = session.arena()?;
        tracing::trace!(%task, "running unit");

        match task {
            Task::CollectCommon { param, .. } | Task::CollectParameter { param, .. } => {
                self.collect_parameter(&session, &arena, param).await
            }
            Task::ValidateParameter { param, .. } => self.validate_parameter(&session, &arena, param),
            Task::CollectPage { page, .. } => self.dispatch_page(&session, &arena, page),
            Task::CollectTab { tab, .. } => self.dispatch_tab(&session, &arena, tab),
        }
    }

    fn absorb_failure(&self, task: Task, reason: String) -> Vec<Task> {
        let Some((session, arena)) = self.locate(task.session()) else {
            return Vec::new();
        };
        let degraded = ValidationStatus::Degraded;
        match task {
            Task::CollectCommon { param, .. }
            | Task::CollectParameter { param, .. }
            | Task::ValidateParameter { param, .. } => match arena.param(param) {
                Ok(scope) => self.complete_parameter(&session, &arena, scope, degraded, Some(reason)),
                Err(_) => Vec::new(),
            },
            Task::CollectPage { page, .. } => match arena.page(page) {
                Ok(scope) => self.aggregate_page(&session, &arena, scope, Some(degraded)),
                Err(_) => Vec::new(),
            },
            Task::CollectTab { tab, .. } => match arena.tab(tab) {
                Ok(scope) => self.aggregate_tab(&session, &arena, scope, Some(degraded)),
                Err(_) => Vec::new(),
            },
        }
    }

    fn locate(&self, id: SessionId) -> Option<(Arc<Session>, Arc<ScopeArena>)> {
        let session = self.session(id).ok()?;
        let arena = session.arena().ok()?;
        Some((session, arena))
    }

    async fn cancel(&self, contexts: &[DeferredContext]) {
        if contexts.is_empty() {
            return;
        }
        let ids: Vec<RequestId> = contexts.iter().map(|c| c.request_id.clone()).collect();
        if let Err(e) = self.inner.collaborators.deferred_search.cancel(&ids).await {
            tracing::warn!(count = ids.len(), error = %e, "cancelling deferred searches failed");
        }
    }

    fn emit(&self, event: OrchestratorEvent) {
        if let Some(sink) = &self.inner.collaborators.sink {
            event.deliver_to(&**sink);
        }
        self.inner.events.publish(event);
    }

    // ---- units ------------------------------------------------------------

    async fn collect_parameter(
        &self,
        session: &Session,
        arena: &ScopeArena,
        id: ParamId,
    ) -> Result<Vec<Task>, VerdictError> {
        let scope = arena.param(id)?;
        if scope.is_completed() {
            return Ok(Vec::new());
        }
        let config = &scope.config;
        let validate = vec![Task::ValidateParameter {
            session: session.id,
            param: id,
        }];

        if let Some(value) = &config.preconfigured {
            scope.update(|state| state.actual = Some(value.clone()));
            return Ok(validate);
        }

        let query = substitute(&config.query, session.variables());
        let limit = self.inner.config.connector_timeout();

        if config.deferred {
            let search = SearchQuery {
                session: session.id,
                path: scope.path.clone(),
                source: config.source.clone(),
                query,
            };
            let request_id = tokio::time::timeout(
                limit,
                self.inner.collaborators.deferred_search.start_search(&search),
            )
            .await
            .map_err(|_| VerdictError::ExternalTimeout(limit))??;

            scope.update(|state| state.request_id = Some(request_id.clone()));
            let early = self.inner.registry.register(DeferredContext::new(
                request_id.clone(),
                session.id,
                id,
                Utc::now(),
            ))?;
            if let Some(outcome) = early {
                tracing::debug!(session = %session.id, param = %scope.path, %request_id, "deferred result was already there");
                return Ok(self.apply_outcome(session, arena, scope, outcome));
            }
            tracing::debug!(session = %session.id, param = %scope.path, %request_id, "waiting for deferred result");
            return Ok(Vec::new());
        }

        let source = config.source.as_deref().ok_or_else(|| {
            VerdictError::Configuration(format!("parameter {} has no source", scope.path))
        })?;
        let connector = self
            .inner
            .collaborators
            .connectors
            .get(source)
            .ok_or_else(|| VerdictError::Configuration(format!("unknown connector: {source}")))?;

        let request = ConnectorRequest {
            session: session.id,
            path: scope.path.clone(),
            query,
        };
        let value = tokio::time::timeout(limit, connector.execute(&request))
            .await
            .map_err(|_| VerdictError::ExternalTimeout(limit))??;

        scope.update(|state| state.actual = Some(value));
        Ok(validate)
    }

    fn validate_parameter(
        &self,
        session: &Session,
        arena: &ScopeArena,
        id: ParamId,
    ) -> Result<Vec<Task>, VerdictError> {
        let scope = arena.param(id)?;
        let actual = scope.state().actual;
        let config = &scope.config;
        let status = self.inner.collaborators.comparators.validate(
            config.display_type.as_deref(),
            config.expected.as_ref(),
            actual.as_ref(),
        );
        Ok(self.complete_parameter(session, arena, scope, status, None))
    }

    fn dispatch_page(
        &self,
        session: &Session,
        arena: &ScopeArena,
        id: PageId,
    ) -> Result<Vec<Task>, VerdictError> {
        let page = arena.page(id)?;
        if !page.group.dispatch_started.set() {
            return Ok(Vec::new());
        }
        if page.group.barrier.fire_if_empty() {
            return Ok(self.aggregate_page(session, arena, page, None));
        }
        Ok(page
            .tabs
            .iter()
            .map(|&tab| Task::CollectTab {
                session: session.id,
                tab,
            })
            .collect())
    }

    fn dispatch_tab(
        &self,
        session: &Session,
        arena: &ScopeArena,
        id: TabId,
    ) -> Result<Vec<Task>, VerdictError> {
        let tab = arena.tab(id)?;
        if !tab.group.dispatch_started.set() {
            return Ok(Vec::new());
        }
        if tab.group.barrier.fire_if_empty() {
            return Ok(self.aggregate_tab(session, arena, tab, None));
        }
        Ok(tab
            .params
            .iter()
            .map(|&param| Task::CollectParameter {
                session: session.id,
                param,
            })
            .collect())
    }

    // ---- completion chain -------------------------------------------------

    fn apply_outcome(
        &self,
        session: &Session,
        arena: &ScopeArena,
        scope: &ParameterScope,
        outcome: DeferredOutcome,
    ) -> Vec<Task> {
        match outcome {
            DeferredOutcome::Value(value) => {
                scope.update(|state| state.actual = Some(value));
                vec![Task::ValidateParameter {
                    session: session.id,
                    param: scope.id,
                }]
            }
            DeferredOutcome::Failed(reason) => self.complete_parameter(
                session,
                arena,
                scope,
                ValidationStatus::Degraded,
                Some(reason),
            ),
        }
    }

    fn complete_parameter(
        &self,
        session: &Session,
        arena: &ScopeArena,
        scope: &ParameterScope,
        status: ValidationStatus,
        error: Option<String>,
    ) -> Vec<Task> {
        if !scope.claim_completion() {
            tracing::trace!(param = %scope.path, "parameter already resolved");
            return Vec::new();
        }

        let state = scope.update(|state| {
            state.status = Some(status);
            if error.is_some() {
                state.error = error;
            }
            state.request_id = None;
            state.clone()
        });
        tracing::debug!(session = %session.id, param = %scope.path, %status, "parameter resolved");
        self.emit(OrchestratorEvent::ParameterResolved(ParameterResolved {
            session: session.id,
            param: scope.id,
            path: scope.path.clone(),
            status,
            actual: state.actual,
            error: state.error,
        }));

        match scope.parent {
            ParentRef::Common => {
                if arena.common_barrier.decrement().fired() {
                    self.finish_common(session, arena)
                } else {
                    Vec::new()
                }
            }
            ParentRef::Tab(tab) => match arena.tab(tab) {
                Ok(tab) if tab.group.barrier.decrement().fired() => {
                    self.aggregate_tab(session, arena, tab, None)
                }
                _ => Vec::new(),
            },
        }
    }

    fn aggregate_tab(
        &self,
        session: &Session,
        arena: &ScopeArena,
        tab: &TabScope,
        forced: Option<ValidationStatus>,
    ) -> Vec<Task> {
        if !tab.group.aggregated.set() {
            return Vec::new();
        }
        let status = forced.unwrap_or_else(|| {
            aggregate(
                &self.inner.config.severity,
                tab.params
                    .iter()
                    .filter_map(|id| arena.param(*id).ok())
                    .filter_map(|p| p.state().status),
            )
        });
        tab.group.set_status(status);
        self.emit_scope(session, ScopeRef::Tab(tab.group.id), &tab.group.name, status);

        match arena.page(tab.page) {
            Ok(page) if page.group.barrier.decrement().fired() => {
                self.aggregate_page(session, arena, page, None)
            }
            _ => Vec::new(),
        }
    }

    fn aggregate_page(
        &self,
        session: &Session,
        arena: &ScopeArena,
        page: &PageScope,
        forced: Option<ValidationStatus>,
    ) -> Vec<Task> {
        if !page.group.aggregated.set() {
            return Vec::new();
        }
        let status = forced.unwrap_or_else(|| {
            aggregate(
                &self.inner.config.severity,
                page.tabs
                    .iter()
                    .filter_map(|id| arena.tab(*id).ok())
                    .filter_map(|t| t.group.status()),
            )
        });
        page.group.set_status(status);
        self.emit_scope(session, ScopeRef::Page(page.group.id), &page.group.name, status);

        if arena.session_barrier.decrement().fired() {
            self.finish_session(session, arena);
        }
        Vec::new()
    }

    fn start_common(&self, session: &Session, arena: &ScopeArena) -> Vec<Task> {
        if arena.common_barrier.fire_if_empty() {
            return self.finish_common(session, arena);
        }
        arena
            .common_ids()
            .iter()
            .map(|&param| Task::CollectCommon {
                session: session.id,
                param,
            })
            .collect()
    }

    fn finish_common(&self, session: &Session, arena: &ScopeArena) -> Vec<Task> {
        if !arena.common_aggregated.set() {
            return Vec::new();
        }

        let common: Vec<&ParameterScope> = arena
            .common_ids()
            .iter()
            .filter_map(|id| arena.param(*id).ok())
            .collect();
        for scope in &common {
            if let Some(actual) = scope.state().actual {
                session.set_variable(scope.name(), value_as_variable(&actual));
            }
        }

        let status = (!common.is_empty())
            .then(|| aggregate(&self.inner.config.severity, arena.common_statuses()));
        session.record_common(status);
        if !session.preconfigured_only() {
            session.mark_common_loaded();
        }
        if let Some(status) = status {
            self.emit_scope(session, ScopeRef::Common, "common", status);
        }

        self.start_pages(session, arena)
    }

    fn start_pages(&self, session: &Session, arena: &ScopeArena) -> Vec<Task> {
        if !arena.pages_started.set() {
            return Vec::new();
        }
        if arena.session_barrier.fire_if_empty() {
            self.finish_session(session, arena);
            return Vec::new();
        }
        if session.state() == SessionState::CollectingCommon {
            if let Err(e) = session.transition(SessionState::CollectingPages) {
                tracing::warn!(session = %session.id, error = %e, "cannot start page collection");
            }
        }
        arena
            .page_ids()
            .iter()
            .map(|&page| Task::CollectPage {
                session: session.id,
                page,
            })
            .collect()
    }

    fn finish_session(&self, session: &Session, arena: &ScopeArena) {
        if session.state() == SessionState::Expired {
            tracing::debug!(session = %session.id, "session expired before aggregation");
            return;
        }
        if !arena.session_aggregated.set() {
            return;
        }
        if let Err(e) = session.transition(SessionState::Aggregating) {
            tracing::warn!(session = %session.id, error = %e, "session left before aggregation");
            return;
        }

        let pages = arena
            .page_ids()
            .iter()
            .filter_map(|id| arena.page(*id).ok())
            .filter_map(|p| p.group.status());
        let status = aggregate(
            &self.inner.config.severity,
            session.common_status().into_iter().chain(pages),
        );
        session.set_status(status);
        self.emit_scope(session, ScopeRef::Session, &session.folder, status);

        if let Err(e) = session.transition(SessionState::Resolved) {
            tracing::warn!(session = %session.id, error = %e, "session left before resolution");
            return;
        }
        tracing::info!(session = %session.id, %status, "session resolved");
    }

    fn emit_scope(&self, session: &Session, scope: ScopeRef, name: &str, status: ValidationStatus) {
        tracing::debug!(session = %session.id, %scope, name, %status, "scope aggregated");
        self.emit(OrchestratorEvent::ScopeAggregated(ScopeAggregated {
            session: session.id,
            scope,
            name: name.to_string(),
            status,
        }));
    }
}

/// Pages an execution collects, in configured order
fn select_pages<'a>(
    pages: &'a [PageConfig],
    execution: &ExecutionConfig,
) -> Result<Vec<&'a PageConfig>, VerdictError> {
    if execution.common_only {
        return Ok(Vec::new());
    }
    if execution.pot_generation || execution.selected_pages.is_empty() {
        return Ok(pages.iter().collect());
    }
    if let Some(unknown) = execution
        .selected_pages
        .iter()
        .find(|name| !pages.iter().any(|p| &p.name == *name))
    {
        return Err(VerdictError::InvalidRequest(format!("unknown page: {unknown}")));
    }
    Ok(pages
        .iter()
        .filter(|p| execution.selected_pages.contains(&p.name))
        .collect())
}

fn to_chrono(duration: Duration) -> Result<chrono::Duration, VerdictError> {
    chrono::Duration::from_std(duration)
        .map_err(|e| VerdictError::Configuration(format!("duration out of range: {e}")))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

//! Testing utilities for the Verdict workspace
//!
//! Mock collaborators, an in-memory config store, a recording result sink
//! and configuration builders.

#![allow(missing_docs)]

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use verdict_core::{
    Collaborators, ConfigStore, Connector, ConnectorError, ConnectorRegistry, ConnectorRequest,
    DeferredSearch, KeyParameterConfig, Orchestrator, OrchestratorConfig, OrchestratorEvent,
    PageConfig, ParameterConfig, ParameterResolved, RequestId, ResultSink, ScopeAggregated,
    ScopeRef, SearchQuery, SessionId, TabConfig, VerdictError,
};

// ---- config builders -------------------------------------------------------

pub fn page(name: &str, tabs: Vec<TabConfig>) -> PageConfig {
    PageConfig {
        name: name.to_string(),
        order: 0,
        tabs,
    }
}

pub fn tab(name: &str, parameters: Vec<ParameterConfig>) -> TabConfig {
    TabConfig {
        name: name.to_string(),
        parameters,
    }
}

pub fn sql_param(name: &str, query: &str) -> ParameterConfig {
    ParameterConfig::new(name, "sql", query)
}

pub fn deferred_param(name: &str, query: &str) -> ParameterConfig {
    ParameterConfig::new(name, "logs", query).deferred()
}

pub fn required_key(name: &str) -> KeyParameterConfig {
    KeyParameterConfig {
        name: name.to_string(),
        required: true,
        default: None,
    }
}

pub fn optional_key(name: &str, default: &str) -> KeyParameterConfig {
    KeyParameterConfig {
        name: name.to_string(),
        required: false,
        default: Some(default.to_string()),
    }
}

/// Small pools and short TTLs
pub fn test_config() -> OrchestratorConfig {
    OrchestratorConfig::new()
        .with_workers(4, 2)
        .with_deferred_ttl(Duration::from_secs(30))
        .with_session_ttl(Duration::from_secs(600))
}

// ---- config store ----------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct FolderConfig {
    pub keys: Vec<KeyParameterConfig>,
    pub common: Vec<ParameterConfig>,
    pub pages: Vec<PageConfig>,
}

impl FolderConfig {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn key(mut self, key: KeyParameterConfig) -> Self {
        self.keys.push(key);
        self
    }

    #[must_use]
    pub fn common(mut self, param: ParameterConfig) -> Self {
        self.common.push(param);
        self
    }

    #[must_use]
    pub fn page(mut self, page: PageConfig) -> Self {
        self.pages.push(page);
        self
    }
}

#[derive(Debug, Default)]
pub struct InMemoryConfigStore {
    folders: HashMap<String, FolderConfig>,
}

impl InMemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_folder(mut self, name: &str, folder: FolderConfig) -> Self {
        self.folders.insert(name.to_string(), folder);
        self
    }

    fn folder(&self, name: &str) -> Result<&FolderConfig, VerdictError> {
        self.folders
            .get(name)
            .ok_or_else(|| VerdictError::not_found("folder", name))
    }
}

#[async_trait]
impl ConfigStore for InMemoryConfigStore {
    async fn load_pages(&self, folder: &str) -> Result<Vec<PageConfig>, VerdictError> {
        Ok(self.folder(folder)?.pages.clone())
    }

    async fn load_common_params(&self, folder: &str) -> Result<Vec<ParameterConfig>, VerdictError> {
        Ok(self.folder(folder)?.common.clone())
    }

    async fn load_key_params(&self, folder: &str) -> Result<Vec<KeyParameterConfig>, VerdictError> {
        Ok(self.folder(folder)?.keys.clone())
    }
}

// ---- connectors ------------------------------------------------------------

/// Answers queries from a fixed table; unknown queries fail
#[derive(Debug, Default)]
pub struct MockConnector {
    responses: HashMap<String, Value>,
    delay: Option<Duration>,
    failure: Option<String>,
    calls: Mutex<Vec<ConnectorRequest>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn respond(mut self, query: &str, value: Value) -> Self {
        self.responses.insert(query.to_string(), value);
        self
    }

    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    #[must_use]
    pub fn failing(mut self, message: &str) -> Self {
        self.failure = Some(message.to_string());
        self
    }

    pub fn calls(&self) -> Vec<ConnectorRequest> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn execute(&self, request: &ConnectorRequest) -> Result<Value, ConnectorError> {
        self.calls.lock().push(request.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(message) = &self.failure {
            return Err(ConnectorError::Failure(message.clone()));
        }
        self.responses
            .get(&request.query)
            .cloned()
            .ok_or_else(|| ConnectorError::Failure(format!("no data for {}", request.query)))
    }
}

/// Panics on every call
#[derive(Debug, Default)]
pub struct PanickingConnector;

#[async_trait]
impl Connector for PanickingConnector {
    async fn execute(&self, request: &ConnectorRequest) -> Result<Value, ConnectorError> {
        panic!("connector crashed on {}", request.path);
    }
}

// ---- deferred search -------------------------------------------------------

/// Records searches and cancellations; results are pushed by the test
#[derive(Debug, Default)]
pub struct MockDeferredSearch {
    next_id: AtomicUsize,
    started: Mutex<Vec<(RequestId, SearchQuery)>>,
    cancelled: Mutex<Vec<RequestId>>,
    refuse: Mutex<Option<String>>,
    notify: Notify,
}

impl MockDeferredSearch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `start_search` fail from now on
    pub fn refuse(&self, message: &str) {
        *self.refuse.lock() = Some(message.to_string());
    }

    pub fn started(&self) -> Vec<(RequestId, SearchQuery)> {
        self.started.lock().clone()
    }

    pub fn cancelled(&self) -> Vec<RequestId> {
        self.cancelled.lock().clone()
    }

    /// Request id of the search started for `path`
    pub fn request_for(&self, path: &str) -> Option<RequestId> {
        self.started
            .lock()
            .iter()
            .find(|(_, q)| q.path == path)
            .map(|(id, _)| id.clone())
    }

    /// Wait until at least `count` searches have started
    pub async fn wait_for_started(&self, count: usize, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, async {
            loop {
                let notified = self.notify.notified();
                if self.started.lock().len() >= count {
                    return;
                }
                notified.await;
            }
        })
        .await
        .is_ok()
    }
}

#[async_trait]
impl DeferredSearch for MockDeferredSearch {
    async fn start_search(&self, query: &SearchQuery) -> Result<RequestId, ConnectorError> {
        if let Some(message) = self.refuse.lock().clone() {
            return Err(ConnectorError::Failure(message));
        }
        let id = RequestId::new(format!("req-{}", self.next_id.fetch_add(1, Ordering::SeqCst)));
        self.started.lock().push((id.clone(), query.clone()));
        self.notify.notify_waiters();
        Ok(id)
    }

    async fn cancel(&self, request_ids: &[RequestId]) -> Result<(), ConnectorError> {
        self.cancelled.lock().extend_from_slice(request_ids);
        Ok(())
    }
}

// ---- sink ------------------------------------------------------------------

/// Keeps every delivered event
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<OrchestratorEvent>>,
    notify: Notify,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<OrchestratorEvent> {
        self.events.lock().clone()
    }

    pub fn resolved(&self) -> Vec<ParameterResolved> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                OrchestratorEvent::ParameterResolved(r) => Some(r.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn aggregated(&self, scope: ScopeRef) -> Vec<ScopeAggregated> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                OrchestratorEvent::ScopeAggregated(a) if a.scope == scope => Some(a.clone()),
                _ => None,
            })
            .collect()
    }

    /// Wait until an event matching `predicate` has been delivered
    pub async fn wait_for<F>(&self, predicate: F, timeout: Duration) -> bool
    where
        F: Fn(&OrchestratorEvent) -> bool,
    {
        tokio::time::timeout(timeout, async {
            loop {
                let notified = self.notify.notified();
                if self.events.lock().iter().any(&predicate) {
                    return;
                }
                notified.await;
            }
        })
        .await
        .is_ok()
    }

    fn record(&self, event: OrchestratorEvent) {
        self.events.lock().push(event);
        self.notify.notify_waiters();
    }
}

impl ResultSink for RecordingSink {
    fn on_parameter_resolved(&self, event: &ParameterResolved) {
        self.record(OrchestratorEvent::ParameterResolved(event.clone()));
    }

    fn on_scope_aggregated(&self, event: &ScopeAggregated) {
        self.record(OrchestratorEvent::ScopeAggregated(event.clone()));
    }

    fn on_session_expired(&self, session: SessionId) {
        self.record(OrchestratorEvent::SessionExpired { session });
    }
}

// ---- wiring ----------------------------------------------------------------

/// Orchestrator with the usual mocks attached
pub struct Harness {
    pub orchestrator: Orchestrator,
    pub search: Arc<MockDeferredSearch>,
    pub sink: Arc<RecordingSink>,
}

impl Harness {
    /// Build an orchestrator over `store` with `sql` bound to `connector`
    pub fn new(store: InMemoryConfigStore, connector: Arc<dyn Connector>) -> Self {
        Self::with_config(store, connector, test_config())
    }

    pub fn with_config(
        store: InMemoryConfigStore,
        connector: Arc<dyn Connector>,
        config: OrchestratorConfig,
    ) -> Self {
        let search = Arc::new(MockDeferredSearch::new());
        let sink = Arc::new(RecordingSink::new());
        let collaborators = Collaborators::new(Arc::new(store))
            .with_connectors(ConnectorRegistry::new().with("sql", connector))
            .with_deferred_search(search.clone())
            .with_sink(sink.clone());
        let orchestrator = Orchestrator::new(config, collaborators).unwrap();
        Self {
            orchestrator,
            search,
            sink,
        }
    }

    /// Wait until `count` deferred requests are registered and awaiting results
    pub async fn wait_for_pending(&self, count: usize, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, async {
            while self.orchestrator.pending_deferred() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .is_ok()
    }
}

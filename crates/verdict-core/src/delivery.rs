//! Result delivery
//!
//! Resolved parameters, aggregated scopes and expired sessions are published
//! through a [`ResultSink`]. [`EventBus`] fans events out to local
//! subscribers. [`DeliveryRouter`] sends events for sessions owned by
//! another instance through a [`RemoteForwarder`] (a message broker client)
//! and hands everything else to a local sink.

use crate::error::VerdictError;
use crate::types::{InstanceId, ParamId, ScopeRef, SessionId, ValidationStatus};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::broadcast;

/// A parameter reached its final status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterResolved {
    pub session: SessionId,
    pub param: ParamId,
    pub path: String,
    pub status: ValidationStatus,
    pub actual: Option<Value>,
    pub error: Option<String>,
}

/// A tab, page, the common group or the session was aggregated
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeAggregated {
    pub session: SessionId,
    pub scope: ScopeRef,
    pub name: String,
    pub status: ValidationStatus,
}

/// Event published by the orchestrator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    ParameterResolved(ParameterResolved),
    ScopeAggregated(ScopeAggregated),
    SessionExpired { session: SessionId },
}

impl OrchestratorEvent {
    /// Session the event belongs to
    #[must_use]
    pub fn session(&self) -> SessionId {
        match self {
            Self::ParameterResolved(e) => e.session,
            Self::ScopeAggregated(e) => e.session,
            Self::SessionExpired { session } => *session,
        }
    }

    /// Hand the event to the matching sink callback
    pub fn deliver_to(&self, sink: &dyn ResultSink) {
        match self {
            Self::ParameterResolved(e) => sink.on_parameter_resolved(e),
            Self::ScopeAggregated(e) => sink.on_scope_aggregated(e),
            Self::SessionExpired { session } => sink.on_session_expired(*session),
        }
    }
}

/// Receiver of orchestrator results
///
/// Callbacks run on the unit that produced the result and must not block.
pub trait ResultSink: Send + Sync {
    /// A parameter resolved
    fn on_parameter_resolved(&self, event: &ParameterResolved);

    /// A scope was aggregated
    fn on_scope_aggregated(&self, event: &ScopeAggregated);

    /// A session expired; no further events follow for it
    fn on_session_expired(&self, session: SessionId);
}

/// Local fan-out over a tokio broadcast channel
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<OrchestratorEvent>,
}

impl EventBus {
    /// Create bus keeping at most `capacity` undelivered events per subscriber
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribe to events published from now on
    #[inline]
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.sender.subscribe()
    }

    /// Publish an event; dropped when nobody listens
    pub fn publish(&self, event: OrchestratorEvent) {
        if self.sender.send(event).is_err() {
            tracing::trace!("event dropped, no subscribers");
        }
    }

    /// Current subscriber count
    #[inline]
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl ResultSink for EventBus {
    fn on_parameter_resolved(&self, event: &ParameterResolved) {
        self.publish(OrchestratorEvent::ParameterResolved(event.clone()));
    }

    fn on_scope_aggregated(&self, event: &ScopeAggregated) {
        self.publish(OrchestratorEvent::ScopeAggregated(event.clone()));
    }

    fn on_session_expired(&self, session: SessionId) {
        self.publish(OrchestratorEvent::SessionExpired { session });
    }
}

/// Finds the instance a session's subscribers are attached to
pub trait SessionLocator: Send + Sync {
    /// Owning instance; `None` when unknown
    fn resolve_owner(&self, session: SessionId) -> Option<InstanceId>;
}

/// Locator for single-instance deployments
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalOnly;

impl SessionLocator for LocalOnly {
    fn resolve_owner(&self, _session: SessionId) -> Option<InstanceId> {
        None
    }
}

/// Sends an event to another instance
pub trait RemoteForwarder: Send + Sync {
    /// Forward `event` to `owner`
    ///
    /// # Errors
    /// Returns `ExternalFailure` when the transport rejects the event
    fn forward(&self, owner: &InstanceId, event: &OrchestratorEvent) -> Result<(), VerdictError>;
}

/// Routes events to the local sink or to the owning instance
pub struct DeliveryRouter {
    instance: InstanceId,
    local: Arc<dyn ResultSink>,
    locator: Arc<dyn SessionLocator>,
    forwarder: Arc<dyn RemoteForwarder>,
}

impl DeliveryRouter {
    /// Create router for `instance`
    pub fn new(
        instance: InstanceId,
        local: Arc<dyn ResultSink>,
        locator: Arc<dyn SessionLocator>,
        forwarder: Arc<dyn RemoteForwarder>,
    ) -> Self {
        Self {
            instance,
            local,
            locator,
            forwarder,
        }
    }

    /// Deliver locally or forward to the owner
    pub fn route(&self, event: &OrchestratorEvent) {
        let session = event.session();
        match self.locator.resolve_owner(session) {
            Some(owner) if owner != self.instance => {
                if let Err(e) = self.forwarder.forward(&owner, event) {
                    tracing::warn!(%session, %owner, error = %e, "event forwarding failed");
                }
            }
            _ => event.deliver_to(&*self.local),
        }
    }

    /// Deliver an event forwarded by another instance
    pub fn accept_forwarded(&self, event: &OrchestratorEvent) {
        tracing::trace!(session = %event.session(), "accepted forwarded event");
        event.deliver_to(&*self.local);
    }
}

impl std::fmt::Debug for DeliveryRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryRouter")
            .field("instance", &self.instance)
            .finish_non_exhaustive()
    }
}

impl ResultSink for DeliveryRouter {
    fn on_parameter_resolved(&self, event: &ParameterResolved) {
        self.route(&OrchestratorEvent::ParameterResolved(event.clone()));
    }

    fn on_scope_aggregated(&self, event: &ScopeAggregated) {
        self.route(&OrchestratorEvent::ScopeAggregated(event.clone()));
    }

    fn on_session_expired(&self, session: SessionId) {
        self.route(&OrchestratorEvent::SessionExpired { session });
    }
}

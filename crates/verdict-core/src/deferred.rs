//! Deferred result registry
//!
//! Parameters whose value comes from an external subsystem answering
//! out-of-band park a [`DeferredContext`] here and return. The context
//! leaves the registry exactly once: through the matching callback, TTL
//! eviction, or expiry of its session. Removal is the claim, so whichever
//! path removes the entry owns the resolution and every other path sees an
//! absent key. A callback can overtake the registration of its request;
//! its result is held under the request id and handed to the registration.

use crate::error::VerdictError;
use crate::types::{ParamId, RequestId, SessionId};
use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Back-reference from an in-flight external request to its parameter
#[derive(Debug, Clone, PartialEq)]
pub struct DeferredContext {
    /// External request id
    pub request_id: RequestId,
    /// Owning session
    pub session: SessionId,
    /// Parameter waiting for the result
    pub param: ParamId,
    /// Registration timestamp
    pub registered_at: DateTime<Utc>,
}

impl DeferredContext {
    /// Create context registered at `now`
    #[inline]
    #[must_use]
    pub fn new(request_id: RequestId, session: SessionId, param: ParamId, now: DateTime<Utc>) -> Self {
        Self {
            request_id,
            session,
            param,
            registered_at: now,
        }
    }

    /// Whether this context has outlived `ttl` at `now`
    #[inline]
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        now - self.registered_at >= ttl
    }
}

/// Result delivered by the external subsystem
#[derive(Debug, Clone, PartialEq)]
pub enum DeferredOutcome {
    /// The awaited value
    Value(Value),
    /// The subsystem reported an error
    Failed(String),
}

/// Registry entry: a parked context, or a result that beat its registration
#[derive(Debug)]
enum Slot {
    Waiting(DeferredContext),
    Early {
        outcome: DeferredOutcome,
        received_at: DateTime<Utc>,
    },
}

impl Slot {
    fn is_expired(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        match self {
            Slot::Waiting(ctx) => ctx.is_expired(now, ttl),
            Slot::Early { received_at, .. } => now - *received_at >= ttl,
        }
    }

    fn into_context(self) -> Option<DeferredContext> {
        match self {
            Slot::Waiting(ctx) => Some(ctx),
            Slot::Early { .. } => None,
        }
    }

    fn into_outcome(self) -> Option<DeferredOutcome> {
        match self {
            Slot::Early { outcome, .. } => Some(outcome),
            Slot::Waiting(_) => None,
        }
    }
}

/// Keyed store of in-flight external requests
///
/// Backed by a sharded map: operations on one key are mutually exclusive,
/// operations on different keys rarely share a shard lock. A result whose
/// request is not registered yet is held under the same key until the
/// registration claims it or the sweep evicts it.
#[derive(Debug)]
pub struct DeferredResultRegistry {
    ttl: Duration,
    slots: DashMap<RequestId, Slot>,
    waiting: AtomicUsize,
}

impl DeferredResultRegistry {
    /// Create registry evicting contexts older than `ttl`
    #[inline]
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            slots: DashMap::new(),
            waiting: AtomicUsize::new(0),
        }
    }

    /// Park a context under its request id
    ///
    /// Returns the outcome when the result already arrived; the caller then
    /// owns the resolution and nothing stays parked.
    ///
    /// # Errors
    /// Returns `DuplicateRequest` if the id is already registered
    pub fn register(&self, context: DeferredContext) -> Result<Option<DeferredOutcome>, VerdictError> {
        match self.slots.entry(context.request_id.clone()) {
            Entry::Occupied(slot) => match slot.get() {
                Slot::Waiting(existing) => Err(VerdictError::DuplicateRequest(format!(
                    "deferred request {} already registered for param {}",
                    slot.key(),
                    existing.param
                ))),
                Slot::Early { .. } => {
                    tracing::debug!(
                        request_id = %context.request_id,
                        param = %context.param,
                        "claimed result that arrived before registration"
                    );
                    Ok(slot.remove().into_outcome())
                }
            },
            Entry::Vacant(slot) => {
                tracing::debug!(
                    request_id = %context.request_id,
                    session = %context.session,
                    param = %context.param,
                    "deferred request registered"
                );
                slot.insert(Slot::Waiting(context));
                self.waiting.fetch_add(1, Ordering::SeqCst);
                Ok(None)
            }
        }
    }

    /// Claim the context for an arriving result
    ///
    /// Returns `None` when nobody waits for the id. The result is then held
    /// until a registration claims it or the sweep evicts it; a repeated
    /// result never replaces the first one.
    pub fn resolve(
        &self,
        request_id: &RequestId,
        outcome: DeferredOutcome,
        now: DateTime<Utc>,
    ) -> Option<(DeferredContext, DeferredOutcome)> {
        match self.slots.entry(request_id.clone()) {
            Entry::Occupied(slot) => match slot.get() {
                Slot::Waiting(_) => {
                    let context = slot.remove().into_context()?;
                    self.waiting.fetch_sub(1, Ordering::SeqCst);
                    Some((context, outcome))
                }
                Slot::Early { .. } => {
                    tracing::info!(%request_id, "ignoring repeated result for unclaimed request");
                    None
                }
            },
            Entry::Vacant(slot) => {
                tracing::info!(%request_id, "holding result for unknown or already resolved request");
                slot.insert(Slot::Early {
                    outcome,
                    received_at: now,
                });
                None
            }
        }
    }

    /// Claim every context older than the TTL at `now`
    ///
    /// Held results older than the TTL are dropped as well.
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> Vec<DeferredContext> {
        let candidates: Vec<RequestId> = self
            .slots
            .iter()
            .filter(|entry| entry.value().is_expired(now, self.ttl))
            .map(|entry| entry.key().clone())
            .collect();

        let mut expired = Vec::new();
        let mut dropped = 0;
        for id in &candidates {
            let Some((_, slot)) = self.slots.remove_if(id, |_, slot| slot.is_expired(now, self.ttl))
            else {
                continue;
            };
            match slot.into_context() {
                Some(context) => {
                    self.waiting.fetch_sub(1, Ordering::SeqCst);
                    expired.push(context);
                }
                None => dropped += 1,
            }
        }

        if !expired.is_empty() {
            tracing::warn!(count = expired.len(), "evicted expired deferred requests");
        }
        if dropped > 0 {
            tracing::debug!(count = dropped, "dropped unclaimed deferred results");
        }
        expired
    }

    /// Claim every context belonging to a session
    pub fn drain_session(&self, session: SessionId) -> Vec<DeferredContext> {
        let owned = |slot: &Slot| matches!(slot, Slot::Waiting(ctx) if ctx.session == session);
        let ids: Vec<RequestId> = self
            .slots
            .iter()
            .filter(|entry| owned(entry.value()))
            .map(|entry| entry.key().clone())
            .collect();

        let drained: Vec<DeferredContext> = ids
            .iter()
            .filter_map(|id| self.slots.remove_if(id, |_, slot| owned(slot)))
            .filter_map(|(_, slot)| slot.into_context())
            .collect();
        self.waiting.fetch_sub(drained.len(), Ordering::SeqCst);
        drained
    }

    /// Whether a request is still in flight
    #[inline]
    #[must_use]
    pub fn contains(&self, request_id: &RequestId) -> bool {
        self.slots
            .get(request_id)
            .is_some_and(|slot| matches!(*slot, Slot::Waiting(_)))
    }

    /// Number of in-flight requests
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    /// Whether nothing is in flight
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Results held for requests nobody has registered
    #[must_use]
    pub fn held(&self) -> usize {
        self.slots.len().saturating_sub(self.len())
    }

    /// Eviction TTL
    #[inline]
    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(id: &str, session: SessionId, at: DateTime<Utc>) -> DeferredContext {
        DeferredContext::new(RequestId::new(id), session, ParamId::new(), at)
    }

    #[test]
    fn register_rejects_duplicates() {
        let registry = DeferredResultRegistry::new(Duration::seconds(30));
        let now = Utc::now();
        let session = SessionId::new();

        registry.register(ctx("r1", session, now)).unwrap();
        let err = registry.register(ctx("r1", session, now)).unwrap_err();
        assert!(matches!(err, VerdictError::DuplicateRequest(_)));
        assert_eq!(registry.len(), 1);
    }

    fn value(v: i64) -> DeferredOutcome {
        DeferredOutcome::Value(Value::from(v))
    }

    #[test]
    fn resolve_claims_once() {
        let registry = DeferredResultRegistry::new(Duration::seconds(30));
        let now = Utc::now();
        registry.register(ctx("r1", SessionId::new(), now)).unwrap();

        let (context, outcome) = registry.resolve(&RequestId::new("r1"), value(1), now).unwrap();
        assert_eq!(context.request_id, RequestId::new("r1"));
        assert_eq!(outcome, value(1));
        assert!(registry.resolve(&RequestId::new("r1"), value(2), now).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn result_before_registration_is_handed_over() {
        let registry = DeferredResultRegistry::new(Duration::seconds(30));
        let now = Utc::now();

        assert!(registry.resolve(&RequestId::new("r1"), value(7), now).is_none());
        // A repeat does not replace the first result.
        assert!(registry.resolve(&RequestId::new("r1"), value(8), now).is_none());
        assert_eq!(registry.held(), 1);
        assert!(registry.is_empty());

        let early = registry.register(ctx("r1", SessionId::new(), now)).unwrap();
        assert_eq!(early, Some(value(7)));
        assert!(registry.is_empty());
        assert_eq!(registry.held(), 0);
        assert!(!registry.contains(&RequestId::new("r1")));
    }

    #[test]
    fn sweep_drops_stale_held_results() {
        let ttl = Duration::seconds(10);
        let registry = DeferredResultRegistry::new(ttl);
        let t0 = Utc::now();
        registry.resolve(&RequestId::new("late"), value(1), t0);
        registry.register(ctx("r1", SessionId::new(), t0)).unwrap();

        let evicted = registry.sweep_expired(t0 + ttl);
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].request_id, RequestId::new("r1"));
        assert_eq!(registry.held(), 0);

        // Nothing to hand over anymore.
        let fresh = registry.register(ctx("late", SessionId::new(), t0 + ttl)).unwrap();
        assert_eq!(fresh, None);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn sweep_evicts_at_ttl_exactly_once() {
        let ttl = Duration::seconds(10);
        let registry = DeferredResultRegistry::new(ttl);
        let t0 = Utc::now();
        let session = SessionId::new();
        registry.register(ctx("r1", session, t0)).unwrap();

        assert!(registry.sweep_expired(t0 + Duration::seconds(9)).is_empty());

        let evicted = registry.sweep_expired(t0 + ttl);
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].request_id, RequestId::new("r1"));

        assert!(registry.sweep_expired(t0 + ttl * 2).is_empty());
    }

    #[test]
    fn resolved_request_is_not_swept() {
        let registry = DeferredResultRegistry::new(Duration::seconds(1));
        let t0 = Utc::now();
        registry.register(ctx("r1", SessionId::new(), t0)).unwrap();

        assert!(registry.resolve(&RequestId::new("r1"), value(1), t0).is_some());
        assert!(registry.sweep_expired(t0 + Duration::seconds(5)).is_empty());
    }

    #[test]
    fn drain_session_only_touches_that_session() {
        let registry = DeferredResultRegistry::new(Duration::seconds(30));
        let now = Utc::now();
        let a = SessionId::new();
        let b = SessionId::new();
        registry.register(ctx("a1", a, now)).unwrap();
        registry.register(ctx("a2", a, now)).unwrap();
        registry.register(ctx("b1", b, now)).unwrap();

        let drained = registry.drain_session(a);
        assert_eq!(drained.len(), 2);
        assert!(registry.contains(&RequestId::new("b1")));
        assert_eq!(registry.len(), 1);
    }
}

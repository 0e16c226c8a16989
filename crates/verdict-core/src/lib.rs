//! Verdict Core - hierarchical collection and validation orchestrator
//!
//! Collects evidence values for a tree of configured parameters from
//! heterogeneous data sources, validates them against expectations and
//! rolls the outcome up into one verdict per session:
//! - Session → common parameters / pages → tabs → parameters
//! - Exactly-once completion detection per scope ([`CompletionBarrier`])
//! - Deferred results with TTL eviction ([`DeferredResultRegistry`])
//! - Inline or pooled execution per unit ([`Dispatcher`])
//! - Worst-status aggregation under a configurable [`SeverityRanking`]
//!
//! # Example
//!
//! ```rust,ignore
//! use verdict_core::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), VerdictError> {
//! let store = Arc::new(FsConfigStore::new("/srv/verdict/projects"));
//! let orchestrator = Orchestrator::new(OrchestratorConfig::new(), Collaborators::new(store))?;
//!
//! let session = orchestrator
//!     .create_session(SessionRequest::new("billing").with_key("account", "42"))
//!     .await?;
//! orchestrator.execute(session, ExecutionConfig::new()).await?;
//!
//! if let Some(snapshot) = orchestrator
//!     .wait_until_settled(session, std::time::Duration::from_secs(60))
//!     .await?
//! {
//!     println!("verdict: {:?}", snapshot.status);
//! }
//! # Ok(())
//! # }
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

// Core modules
pub mod aggregate;
pub mod arena;
pub mod barrier;
pub mod config;
pub mod connector;
pub mod deferred;
pub mod delivery;
pub mod dispatch;
pub mod error;
pub mod orchestrator;
pub mod session;
pub mod severity;
pub mod state_machine;
pub mod store;
pub mod sweeper;
pub mod types;

// Re-exports for convenience
pub use aggregate::{aggregate, Comparator, ComparatorRegistry, DeepEquality};
pub use arena::{ParameterState, ParentRef, ScopeArena};
pub use barrier::{CompletionBarrier, Decrement, Latch};
pub use config::OrchestratorConfig;
pub use connector::{
    substitute, Connector, ConnectorRegistry, ConnectorRequest, DeferredSearch, NoDeferredSearch,
    SearchQuery,
};
pub use deferred::{DeferredContext, DeferredOutcome, DeferredResultRegistry};
pub use delivery::{
    DeliveryRouter, EventBus, LocalOnly, OrchestratorEvent, ParameterResolved, RemoteForwarder,
    ResultSink, ScopeAggregated, SessionLocator,
};
pub use dispatch::{route, Dispatcher, Mode, Phase, PoolStats, RouteContext, Task, WorkerPool};
pub use error::{ConnectorError, ErrorKind, VerdictError};
pub use orchestrator::{Collaborators, Orchestrator, SessionRequest};
pub use session::{PageSnapshot, ParameterSnapshot, Session, SessionSnapshot, TabSnapshot};
pub use severity::SeverityRanking;
pub use state_machine::{allowed_transitions, validate_transition, SessionState};
pub use store::{
    ConfigStore, FsConfigStore, KeyParameterConfig, PageConfig, ParameterConfig, TabConfig,
};
pub use sweeper::{spawn_sweeper, SweeperHandle};
pub use types::{
    ExecutionConfig, InstanceId, PageId, ParamId, RequestId, ScopeRef, SessionId, TabId,
    ValidationStatus,
};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for working with Verdict Core
    pub use crate::{
        Collaborators, Connector, ConnectorError, ConnectorRegistry, ConnectorRequest,
        DeferredOutcome, DeferredSearch, ExecutionConfig, FsConfigStore, Orchestrator,
        OrchestratorConfig, OrchestratorEvent, ParameterConfig, ResultSink, SessionId, SessionRequest,
        SessionSnapshot, SessionState, ValidationStatus, VerdictError,
    };
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

//! Orchestrator configuration
//!
//! Loaded from TOML. Every field has a default so a partial file works.

use crate::error::VerdictError;
use crate::severity::SeverityRanking;
use crate::types::InstanceId;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Orchestrator configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Identifier of this service instance
    pub instance_id: String,
    /// Workers in the collection pool
    pub collection_workers: usize,
    /// Workers in the validation pool
    pub validation_workers: usize,
    /// Deferred result TTL in seconds
    pub deferred_ttl_secs: u64,
    /// Idle session TTL in seconds
    pub session_ttl_secs: u64,
    /// Background sweep period in milliseconds
    pub sweep_interval_ms: u64,
    /// Upper bound on a single connector call in seconds
    pub connector_timeout_secs: u64,
    /// Capacity of the local event bus
    pub event_capacity: usize,
    /// Status precedence for aggregation, mildest first
    pub severity: SeverityRanking,
}

impl OrchestratorConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse configuration from TOML text
    ///
    /// # Errors
    /// Returns `Configuration` on malformed TOML or invalid values
    pub fn from_toml_str(text: &str) -> Result<Self, VerdictError> {
        let config: Self =
            toml::from_str(text).map_err(|e| VerdictError::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    ///
    /// # Errors
    /// Returns `Io` when the file cannot be read, `Configuration` when invalid
    pub fn load(path: impl AsRef<Path>) -> Result<Self, VerdictError> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }

    /// Check value ranges
    ///
    /// # Errors
    /// Returns `Configuration` for empty pools or zero durations
    pub fn validate(&self) -> Result<(), VerdictError> {
        if self.collection_workers == 0 || self.validation_workers == 0 {
            return Err(VerdictError::Configuration(
                "worker pools need at least one worker".to_string(),
            ));
        }
        if self.deferred_ttl_secs == 0 || self.session_ttl_secs == 0 {
            return Err(VerdictError::Configuration("TTLs must be positive".to_string()));
        }
        if self.sweep_interval_ms == 0 {
            return Err(VerdictError::Configuration(
                "sweep interval must be positive".to_string(),
            ));
        }
        if self.event_capacity == 0 {
            return Err(VerdictError::Configuration(
                "event capacity must be positive".to_string(),
            ));
        }
        if self.deferred_ttl_secs > self.session_ttl_secs {
            tracing::warn!(
                deferred_ttl_secs = self.deferred_ttl_secs,
                session_ttl_secs = self.session_ttl_secs,
                "deferred TTL exceeds session TTL; session expiry will resolve stragglers"
            );
        }
        Ok(())
    }

    /// With pool sizes
    #[inline]
    #[must_use]
    pub fn with_workers(mut self, collection: usize, validation: usize) -> Self {
        self.collection_workers = collection;
        self.validation_workers = validation;
        self
    }

    /// With deferred TTL
    #[inline]
    #[must_use]
    pub fn with_deferred_ttl(mut self, ttl: Duration) -> Self {
        self.deferred_ttl_secs = ttl.as_secs().max(1);
        self
    }

    /// With session TTL
    #[inline]
    #[must_use]
    pub fn with_session_ttl(mut self, ttl: Duration) -> Self {
        self.session_ttl_secs = ttl.as_secs().max(1);
        self
    }

    /// With instance identifier
    #[inline]
    #[must_use]
    pub fn with_instance(mut self, instance: impl Into<String>) -> Self {
        self.instance_id = instance.into();
        self
    }

    /// Instance identifier
    #[inline]
    #[must_use]
    pub fn instance(&self) -> InstanceId {
        InstanceId::new(self.instance_id.clone())
    }

    /// Deferred TTL
    #[inline]
    #[must_use]
    pub fn deferred_ttl(&self) -> Duration {
        Duration::from_secs(self.deferred_ttl_secs)
    }

    /// Session TTL
    #[inline]
    #[must_use]
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    /// Sweep period
    #[inline]
    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    /// Connector call bound
    #[inline]
    #[must_use]
    pub fn connector_timeout(&self) -> Duration {
        Duration::from_secs(self.connector_timeout_secs)
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            instance_id: "local".to_string(),
            collection_workers: 8,
            validation_workers: 4,
            deferred_ttl_secs: 300,
            session_ttl_secs: 3600,
            sweep_interval_ms: 1000,
            connector_timeout_secs: 30,
            event_capacity: 1024,
            severity: SeverityRanking::default(),
        }
    }
}

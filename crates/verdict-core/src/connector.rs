//! Data-source connectors and the deferred-search seam
//!
//! Concrete connectors (SQL, columnar stores, SSH, HTTP, SOAP) live outside
//! this crate. The orchestrator only needs `execute` and a typed timeout.

use crate::error::ConnectorError;
use crate::types::{RequestId, SessionId};
use async_trait::async_trait;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Request handed to a connector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectorRequest {
    /// Session collecting the value
    pub session: SessionId,
    /// Logical path of the parameter
    pub path: String,
    /// Query with session variables substituted
    pub query: String,
}

/// Synchronous-reply data source
#[async_trait]
pub trait Connector: Send + Sync {
    /// Run a request; must be safe to retry
    async fn execute(&self, request: &ConnectorRequest) -> Result<Value, ConnectorError>;
}

/// Connectors by source name
#[derive(Clone, Default)]
pub struct ConnectorRegistry {
    connectors: HashMap<String, Arc<dyn Connector>>,
}

impl ConnectorRegistry {
    /// Create empty registry
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register connector under `source`
    #[must_use]
    pub fn with(mut self, source: impl Into<String>, connector: Arc<dyn Connector>) -> Self {
        self.connectors.insert(source.into(), connector);
        self
    }

    /// Register connector under `source`
    pub fn insert(&mut self, source: impl Into<String>, connector: Arc<dyn Connector>) {
        self.connectors.insert(source.into(), connector);
    }

    /// Look up connector
    #[inline]
    #[must_use]
    pub fn get(&self, source: &str) -> Option<Arc<dyn Connector>> {
        self.connectors.get(source).cloned()
    }

    /// Registered source names
    pub fn sources(&self) -> impl Iterator<Item = &str> {
        self.connectors.keys().map(String::as_str)
    }
}

impl fmt::Debug for ConnectorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectorRegistry")
            .field("sources", &self.connectors.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Query handed to the deferred-search subsystem
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchQuery {
    /// Session waiting for the result
    pub session: SessionId,
    /// Logical path of the parameter
    pub path: String,
    /// Source name from the parameter config, if any
    pub source: Option<String>,
    /// Query with session variables substituted
    pub query: String,
}

/// External subsystem that replies out-of-band (e.g. a log search service)
///
/// Results come back through [`crate::Orchestrator::on_deferred_result`].
#[async_trait]
pub trait DeferredSearch: Send + Sync {
    /// Start a search; the returned id keys the eventual callback
    async fn start_search(&self, query: &SearchQuery) -> Result<RequestId, ConnectorError>;

    /// Best-effort cancellation of searches nobody waits for anymore
    async fn cancel(&self, request_ids: &[RequestId]) -> Result<(), ConnectorError>;
}

/// Deferred-search stand-in for deployments without one
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDeferredSearch;

#[async_trait]
impl DeferredSearch for NoDeferredSearch {
    async fn start_search(&self, query: &SearchQuery) -> Result<RequestId, ConnectorError> {
        Err(ConnectorError::Unsupported(format!(
            "no deferred-search subsystem configured for {}",
            query.path
        )))
    }

    async fn cancel(&self, _request_ids: &[RequestId]) -> Result<(), ConnectorError> {
        Ok(())
    }
}

static VARIABLE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$\{([A-Za-z0-9_.\-]+)\}").expect("variable pattern is valid")
});

/// Replace `${name}` with values from the session variable table
///
/// Unknown variables are left untouched.
pub fn substitute(template: &str, variables: &DashMap<String, String>) -> String {
    VARIABLE
        .replace_all(template, |caps: &Captures<'_>| {
            variables
                .get(&caps[1])
                .map(|v| v.value().clone())
                .unwrap_or_else(|| {
                    tracing::debug!(variable = &caps[1], "unresolved query variable");
                    caps[0].to_string()
                })
        })
        .into_owned()
}

/// Render a collected value for the variable table
#[must_use]
pub fn value_as_variable(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn substitutes_known_variables() {
        let vars = DashMap::new();
        vars.insert("account".to_string(), "42".to_string());
        vars.insert("env.name".to_string(), "qa".to_string());

        let out = substitute("select * from t where acc = ${account} and env = '${env.name}'", &vars);
        assert_eq!(out, "select * from t where acc = 42 and env = 'qa'");
    }

    #[test]
    fn leaves_unknown_variables() {
        let vars = DashMap::new();
        assert_eq!(substitute("x = ${missing}", &vars), "x = ${missing}");
    }

    #[test]
    fn renders_values_for_variables() {
        assert_eq!(value_as_variable(&json!("abc")), "abc");
        assert_eq!(value_as_variable(&json!(12)), "12");
        assert_eq!(value_as_variable(&Value::Null), "");
        assert_eq!(value_as_variable(&json!([1, 2])), "[1,2]");
    }

    #[tokio::test]
    async fn no_deferred_search_refuses() {
        let query = SearchQuery {
            session: SessionId::new(),
            path: "p/t/x".into(),
            source: None,
            query: "q".into(),
        };
        let err = NoDeferredSearch.start_search(&query).await.unwrap_err();
        assert!(matches!(err, ConnectorError::Unsupported(_)));
    }

    #[test]
    fn registry_lookup() {
        struct Fixed;
        #[async_trait]
        impl Connector for Fixed {
            async fn execute(&self, _r: &ConnectorRequest) -> Result<Value, ConnectorError> {
                Ok(json!(1))
            }
        }

        let registry = ConnectorRegistry::new().with("sql", Arc::new(Fixed));
        assert!(registry.get("sql").is_some());
        assert!(registry.get("ssh").is_none());
        assert_eq!(registry.sources().collect::<Vec<_>>(), vec!["sql"]);
    }
}

//! Page and parameter configuration storage
//!
//! The orchestrator only reads configuration. [`FsConfigStore`] lays a
//! project folder out as:
//!
//! ```text
//! <root>/<folder>/key_parameters.{json,yaml,yml}
//! <root>/<folder>/common_parameters.{json,yaml,yml}
//! <root>/<folder>/pages/<page>.{json,yaml,yml}
//! ```
//!
//! Missing parameter files mean "none configured". A page file that fails
//! to parse is skipped with a warning so the rest of the folder still loads.

use crate::error::VerdictError;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};

/// Configured page
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageConfig {
    /// Page name, unique within a folder
    pub name: String,
    /// Display order
    #[serde(default)]
    pub order: u32,
    /// Tabs in display order
    #[serde(default)]
    pub tabs: Vec<TabConfig>,
}

/// Configured tab
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TabConfig {
    /// Tab name, unique within its page
    pub name: String,
    /// Parameters in display order
    #[serde(default)]
    pub parameters: Vec<ParameterConfig>,
}

/// Configured parameter (common or source-under-test)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterConfig {
    /// Parameter name
    pub name: String,
    /// Connector name used to collect the value
    #[serde(default)]
    pub source: Option<String>,
    /// Query template; `${name}` is substituted from session variables
    #[serde(default)]
    pub query: String,
    /// Completes inline with its parent instead of on a pool
    #[serde(default)]
    pub synchronous: bool,
    /// Value arrives out-of-band from the deferred-search subsystem
    #[serde(default)]
    pub deferred: bool,
    /// Value known at configuration time; no connector call needed
    #[serde(default)]
    pub preconfigured: Option<Value>,
    /// Expected value; absent means nothing to validate
    #[serde(default)]
    pub expected: Option<Value>,
    /// Display type selecting a custom comparator
    #[serde(default)]
    pub display_type: Option<String>,
}

impl ParameterConfig {
    /// Create parameter collected from `source` with `query`
    pub fn new(name: impl Into<String>, source: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: Some(source.into()),
            query: query.into(),
            synchronous: false,
            deferred: false,
            preconfigured: None,
            expected: None,
            display_type: None,
        }
    }

    /// Create parameter with a preconfigured value
    pub fn preconfigured(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            source: None,
            query: String::new(),
            synchronous: true,
            deferred: false,
            preconfigured: Some(value),
            expected: None,
            display_type: None,
        }
    }

    /// With expected value
    #[must_use]
    pub fn expect(mut self, expected: Value) -> Self {
        self.expected = Some(expected);
        self
    }

    /// Mark synchronous
    #[must_use]
    pub fn synchronous(mut self) -> Self {
        self.synchronous = true;
        self
    }

    /// Mark deferred
    #[must_use]
    pub fn deferred(mut self) -> Self {
        self.deferred = true;
        self
    }

    /// With display type
    #[must_use]
    pub fn display_type(mut self, display_type: impl Into<String>) -> Self {
        self.display_type = Some(display_type.into());
        self
    }
}

/// Session input declared by a folder
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyParameterConfig {
    /// Variable name
    pub name: String,
    /// Session creation fails without a value
    #[serde(default)]
    pub required: bool,
    /// Value used when the request omits it
    #[serde(default)]
    pub default: Option<String>,
}

/// Read access to project configuration
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Pages of a folder, in display order
    async fn load_pages(&self, folder: &str) -> Result<Vec<PageConfig>, VerdictError>;

    /// Common parameters of a folder
    async fn load_common_params(&self, folder: &str) -> Result<Vec<ParameterConfig>, VerdictError>;

    /// Key parameters of a folder
    async fn load_key_params(&self, folder: &str) -> Result<Vec<KeyParameterConfig>, VerdictError>;
}

/// Filesystem-backed [`ConfigStore`]
#[derive(Debug, Clone)]
pub struct FsConfigStore {
    root: PathBuf,
}

impl FsConfigStore {
    /// Create store rooted at `root`
    #[inline]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory
    #[inline]
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn folder_path(&self, folder: &str) -> Result<PathBuf, VerdictError> {
        if folder.is_empty()
            || folder == "."
            || folder == ".."
            || folder.contains(['/', '\\'])
        {
            return Err(VerdictError::InvalidRequest(format!(
                "invalid folder name: {folder:?}"
            )));
        }
        Ok(self.root.join(folder))
    }

    async fn existing_folder(&self, folder: &str) -> Result<PathBuf, VerdictError> {
        let path = self.folder_path(folder)?;
        if !tokio::fs::try_exists(&path).await? {
            return Err(VerdictError::not_found("folder", folder));
        }
        Ok(path)
    }

    async fn load_list<T: DeserializeOwned>(&self, folder: &str, stem: &str) -> Result<Vec<T>, VerdictError> {
        let dir = self.existing_folder(folder).await?;
        for ext in ["json", "yaml", "yml"] {
            let path = dir.join(format!("{stem}.{ext}"));
            if tokio::fs::try_exists(&path).await? {
                let text = tokio::fs::read_to_string(&path).await?;
                return parse_document(&path, &text);
            }
        }
        Ok(Vec::new())
    }
}

#[async_trait]
impl ConfigStore for FsConfigStore {
    async fn load_pages(&self, folder: &str) -> Result<Vec<PageConfig>, VerdictError> {
        let dir = self.existing_folder(folder).await?.join("pages");
        if !tokio::fs::try_exists(&dir).await? {
            return Ok(Vec::new());
        }

        let mut pages = Vec::new();
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !is_config_file(&path) {
                continue;
            }
            let text = tokio::fs::read_to_string(&path).await?;
            match parse_document::<PageConfig>(&path, &text) {
                Ok(page) => pages.push(page),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping malformed page config");
                }
            }
        }

        pages.sort_by(|a, b| a.order.cmp(&b.order).then_with(|| a.name.cmp(&b.name)));
        tracing::debug!(folder, pages = pages.len(), "loaded page configuration");
        Ok(pages)
    }

    async fn load_common_params(&self, folder: &str) -> Result<Vec<ParameterConfig>, VerdictError> {
        self.load_list(folder, "common_parameters").await
    }

    async fn load_key_params(&self, folder: &str) -> Result<Vec<KeyParameterConfig>, VerdictError> {
        self.load_list(folder, "key_parameters").await
    }
}

fn is_config_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("json" | "yaml" | "yml")
    )
}

fn parse_document<T: DeserializeOwned>(path: &Path, text: &str) -> Result<T, VerdictError> {
    let parsed = match path.extension().and_then(|e| e.to_str()) {
        Some("json") => serde_json::from_str(text).map_err(|e| e.to_string()),
        _ => serde_yaml::from_str(text).map_err(|e| e.to_string()),
    };
    parsed.map_err(|e| VerdictError::Configuration(format!("{}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn write(path: &Path, text: &str) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, text).unwrap();
    }

    #[tokio::test]
    async fn loads_pages_sorted_and_skips_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let folder = dir.path().join("billing");
        write(
            &folder.join("pages/b.json"),
            r#"{"name":"Invoices","order":2,"tabs":[{"name":"Main","parameters":[]}]}"#,
        );
        write(
            &folder.join("pages/a.yaml"),
            "name: Accounts\norder: 1\ntabs:\n  - name: Summary\n    parameters:\n      - name: balance\n        source: sql\n        query: select 1\n        expected: 1\n",
        );
        write(&folder.join("pages/broken.json"), "{ not json");
        write(&folder.join("pages/notes.txt"), "ignored");

        let store = FsConfigStore::new(dir.path());
        let pages = store.load_pages("billing").await.unwrap();

        let names: Vec<_> = pages.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["Accounts", "Invoices"]);
        assert_eq!(pages[0].tabs[0].parameters[0].expected, Some(json!(1)));
    }

    #[tokio::test]
    async fn missing_parameter_files_are_empty() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("empty")).unwrap();

        let store = FsConfigStore::new(dir.path());
        assert!(store.load_common_params("empty").await.unwrap().is_empty());
        assert!(store.load_key_params("empty").await.unwrap().is_empty());
        assert!(store.load_pages("empty").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn loads_key_and_common_parameters() {
        let dir = tempfile::tempdir().unwrap();
        let folder = dir.path().join("crm");
        write(
            &folder.join("key_parameters.json"),
            r#"[{"name":"account","required":true},{"name":"env","default":"qa"}]"#,
        );
        write(
            &folder.join("common_parameters.yml"),
            "- name: customer_id\n  source: sql\n  query: select id from customers where acc = '${account}'\n",
        );

        let store = FsConfigStore::new(dir.path());
        let keys = store.load_key_params("crm").await.unwrap();
        assert_eq!(keys.len(), 2);
        assert!(keys[0].required);
        assert_eq!(keys[1].default.as_deref(), Some("qa"));

        let common = store.load_common_params("crm").await.unwrap();
        assert_eq!(common[0].source.as_deref(), Some("sql"));
    }

    #[tokio::test]
    async fn rejects_traversal_and_missing_folder() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsConfigStore::new(dir.path());

        let err = store.load_pages("../etc").await.unwrap_err();
        assert!(matches!(err, VerdictError::InvalidRequest(_)));

        let err = store.load_pages("nowhere").await.unwrap_err();
        assert!(matches!(err, VerdictError::NotFound { .. }));
    }
}

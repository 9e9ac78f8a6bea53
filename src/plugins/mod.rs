//! Plugin host contract and plugin-adjacent collaborators.
//!
//! The plugin execution sandbox is external; the orchestrator hands it
//! an allow-listed config subset and merges whatever overrides it
//! returns. Run events (`before:run` / `after:run`) go through the same
//! host.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::{SanitizedConfig, TestingType};
use crate::errors::ProjectError;
use crate::specs::SpecDescriptor;

/// Overrides returned from plugin init. Loose map because the values
/// cross a sandbox boundary; validated in `config::merge_plugin_overrides`.
pub type PluginOverrides = BTreeMap<String, serde_json::Value>;

/// Error/warning forwarders handed to collaborators.
pub type ErrorHandler = Arc<dyn Fn(&ProjectError) + Send + Sync>;
pub type WarningHandler = Arc<dyn Fn(&str) + Send + Sync>;

/// Lifecycle run events executed through the plugin host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunEvent {
    BeforeRun,
    AfterRun,
}

impl RunEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            RunEvent::BeforeRun => "before:run",
            RunEvent::AfterRun => "after:run",
        }
    }
}

/// Context passed to plugin init alongside the sanitized config.
#[derive(Clone)]
pub struct PluginInitContext {
    pub project_root: PathBuf,
    pub config_file_path: Option<PathBuf>,
    pub testing_type: TestingType,
    pub on_error: ErrorHandler,
    pub on_warning: WarningHandler,
}

impl std::fmt::Debug for PluginInitContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginInitContext")
            .field("project_root", &self.project_root)
            .field("config_file_path", &self.config_file_path)
            .field("testing_type", &self.testing_type)
            .finish()
    }
}

/// The external plugin sandbox.
///
/// Real implementation: the embedding runner's sandbox. Test double:
/// mock hosts in the integration tests.
#[async_trait]
pub trait PluginHost: Send + Sync {
    /// Execute the user's plugins file. May fail; failures during open()
    /// reject open(), failures during re-init go to `on_error` only.
    async fn init(
        &self,
        config: SanitizedConfig,
        ctx: PluginInitContext,
    ) -> anyhow::Result<PluginOverrides>;

    /// Execute a lifecycle run event with the final config and
    /// environment metadata.
    async fn execute_run_event(
        &self,
        event: RunEvent,
        config: &crate::config::ConfigSnapshot,
        meta: serde_json::Value,
    ) -> anyhow::Result<()>;
}

/// Host for projects without a plugins file: returns no overrides and
/// treats run events as no-ops.
pub struct NullPluginHost;

#[async_trait]
impl PluginHost for NullPluginHost {
    async fn init(
        &self,
        _config: SanitizedConfig,
        _ctx: PluginInitContext,
    ) -> anyhow::Result<PluginOverrides> {
        Ok(PluginOverrides::new())
    }

    async fn execute_run_event(
        &self,
        _event: RunEvent,
        _config: &crate::config::ConfigSnapshot,
        _meta: serde_json::Value,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Spec preprocessor collaborator, released on close() for e2e sessions.
#[async_trait]
pub trait Preprocessor: Send + Sync {
    async fn close(&self) -> anyhow::Result<()>;
}

/// Bundler/dev-server collaborator for component sessions; receives
/// spec-set changes.
#[async_trait]
pub trait DevServer: Send + Sync {
    async fn update_specs(&self, specs: &[SpecDescriptor]) -> anyhow::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ResolveOptions, resolve};
    use crate::state::PersistedState;
    use tempfile::tempdir;

    #[test]
    fn test_run_event_names() {
        assert_eq!(RunEvent::BeforeRun.as_str(), "before:run");
        assert_eq!(RunEvent::AfterRun.as_str(), "after:run");
    }

    #[tokio::test]
    async fn test_null_host_returns_no_overrides() {
        let dir = tempdir().unwrap();
        let config = resolve(
            dir.path(),
            TestingType::E2e,
            &ResolveOptions::default(),
            &PersistedState::default(),
        )
        .unwrap();
        let ctx = PluginInitContext {
            project_root: dir.path().to_path_buf(),
            config_file_path: None,
            testing_type: TestingType::E2e,
            on_error: Arc::new(|_| {}),
            on_warning: Arc::new(|_| {}),
        };
        let overrides = NullPluginHost
            .init(crate::config::allow_list(&config), ctx)
            .await
            .unwrap();
        assert!(overrides.is_empty());
    }
}

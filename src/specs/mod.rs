//! Spec discovery and spec-set watching.
//!
//! Discovery internals live behind the [`SpecFinder`] contract;
//! [`GlobSpecFinder`] is the default implementation. [`SpecStore`] owns
//! the current spec set for a session, filters descriptors by the active
//! testing type, and notifies a subscriber when the set changes under a
//! filesystem watch.

use async_trait::async_trait;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use crate::config::{ConfigSnapshot, TestingType};
use crate::watch::{WatchId, WatchRegistry};

/// Tag carried by every discovered spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SpecType {
    Integration,
    Component,
}

impl std::fmt::Display for SpecType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SpecType::Integration => write!(f, "integration"),
            SpecType::Component => write!(f, "component"),
        }
    }
}

/// One discovered spec file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SpecDescriptor {
    pub absolute_path: PathBuf,
    pub spec_type: SpecType,
}

/// Spec discovery contract. One-shot and finite; watching is layered on
/// top by [`SpecStore`].
///
/// Real implementation: [`GlobSpecFinder`]. Tests supply fixed lists.
#[async_trait]
pub trait SpecFinder: Send + Sync {
    async fn find(&self, config: &ConfigSnapshot) -> anyhow::Result<Vec<SpecDescriptor>>;
}

/// Default finder: walks the integration and component folders with the
/// configured spec glob, tagging descriptors by folder.
pub struct GlobSpecFinder;

impl GlobSpecFinder {
    fn find_in(folder: &Path, pattern: &str, spec_type: SpecType) -> Vec<SpecDescriptor> {
        let full = folder.join(pattern);
        let Some(full) = full.to_str().map(str::to_string) else {
            return Vec::new();
        };
        let Ok(paths) = glob::glob(&full) else {
            return Vec::new();
        };
        let mut specs: Vec<SpecDescriptor> = paths
            .filter_map(|entry| entry.ok())
            .filter(|p| p.is_file())
            .map(|absolute_path| SpecDescriptor {
                absolute_path,
                spec_type,
            })
            .collect();
        specs.sort_by(|a, b| a.absolute_path.cmp(&b.absolute_path));
        specs
    }
}

#[async_trait]
impl SpecFinder for GlobSpecFinder {
    async fn find(&self, config: &ConfigSnapshot) -> anyhow::Result<Vec<SpecDescriptor>> {
        let mut specs = Self::find_in(
            &config.integration_folder,
            &config.spec_pattern,
            SpecType::Integration,
        );
        specs.extend(Self::find_in(
            &config.component_folder,
            &config.spec_pattern,
            SpecType::Component,
        ));
        Ok(specs)
    }
}

/// Receives the new spec set whenever it changes under watch.
pub trait SpecSetSubscriber: Send + Sync {
    fn on_specs_changed(&self, specs: &[SpecDescriptor]);
}

/// Keep only descriptors whose tag matches the session's testing type.
pub fn filter_by_type(specs: Vec<SpecDescriptor>, testing_type: TestingType) -> Vec<SpecDescriptor> {
    let wanted = testing_type.spec_type();
    specs
        .into_iter()
        .filter(|s| s.spec_type == wanted)
        .collect()
}

/// True when the two sets differ (order-insensitive on path).
pub fn spec_set_changed(old: &[SpecDescriptor], new: &[SpecDescriptor]) -> bool {
    if old.len() != new.len() {
        return true;
    }
    let mut old_paths: Vec<&Path> = old.iter().map(|s| s.absolute_path.as_path()).collect();
    let mut new_paths: Vec<&Path> = new.iter().map(|s| s.absolute_path.as_path()).collect();
    old_paths.sort();
    new_paths.sort();
    old_paths != new_paths
}

/// Owns the current spec set for one session.
pub struct SpecStore {
    finder: Arc<dyn SpecFinder>,
    current: Arc<Mutex<Vec<SpecDescriptor>>>,
}

impl SpecStore {
    pub fn new(finder: Arc<dyn SpecFinder>) -> Self {
        Self {
            finder,
            current: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Run discovery and install the filtered result as the current set.
    pub async fn discover(
        &self,
        config: &ConfigSnapshot,
    ) -> anyhow::Result<Vec<SpecDescriptor>> {
        let specs = self.finder.find(config).await?;
        let filtered = filter_by_type(specs, config.testing_type);
        *self.current.lock().expect("spec set lock") = filtered.clone();
        debug!(count = filtered.len(), testing_type = %config.testing_type, "specs discovered");
        Ok(filtered)
    }

    /// Snapshot of the current set.
    pub fn current(&self) -> Vec<SpecDescriptor> {
        self.current.lock().expect("spec set lock").clone()
    }

    /// Watch the active spec folder and re-run discovery on changes,
    /// notifying `subscriber` only when the set actually changed.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start_watching(
        &self,
        registry: &mut WatchRegistry,
        config: &ConfigSnapshot,
        subscriber: Arc<dyn SpecSetSubscriber>,
    ) -> anyhow::Result<WatchId> {
        let folder = match config.testing_type {
            TestingType::E2e => config.integration_folder.clone(),
            TestingType::Component => config.component_folder.clone(),
        };
        // The scaffolder normally created this already; cover the case
        // where example scaffolding was skipped.
        std::fs::create_dir_all(&folder)?;

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<()>();
        let id = registry.watch_tree(
            &folder,
            Arc::new(move |_: &Path| {
                let _ = tx.send(());
            }),
        )?;

        let finder = Arc::clone(&self.finder);
        let current = Arc::clone(&self.current);
        let config = config.clone();
        tokio::spawn(async move {
            while rx.recv().await.is_some() {
                // Collapse change bursts into one discovery pass
                while rx.try_recv().is_ok() {}
                refresh(&*finder, &config, &current, &*subscriber).await;
            }
        });
        Ok(id)
    }
}

/// One watch-triggered discovery pass.
async fn refresh(
    finder: &dyn SpecFinder,
    config: &ConfigSnapshot,
    current: &Mutex<Vec<SpecDescriptor>>,
    subscriber: &dyn SpecSetSubscriber,
) {
    let specs = match finder.find(config).await {
        Ok(specs) => filter_by_type(specs, config.testing_type),
        Err(e) => {
            warn!(error = %e, "spec re-discovery failed");
            return;
        }
    };
    let changed = {
        let mut guard = current.lock().expect("spec set lock");
        if spec_set_changed(&guard, &specs) {
            *guard = specs.clone();
            true
        } else {
            false
        }
    };
    if changed {
        subscriber.on_specs_changed(&specs);
    }
}

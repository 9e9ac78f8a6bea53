//! Durable per-project session/UI state.
//!
//! A small JSON blob keyed by project root, stored under the user's
//! application-data directory. Holds open timestamps and UI flags that
//! must survive runner restarts but are too transient for the settings
//! file. Headless sessions get an in-memory handle that never touches
//! disk.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// The persisted blob.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    /// Set the first time the project is opened, never overwritten.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_opened: Option<DateTime<Utc>>,
    /// Updated on every open.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_opened: Option<DateTime<Utc>>,
    #[serde(default)]
    pub banner_dismissed: bool,
    /// Free-form UI flags keyed by feature name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub flags: BTreeMap<String, serde_json::Value>,
}

impl PersistedState {
    /// Flatten into the `state` sub-map of a config snapshot.
    pub fn to_map(&self) -> BTreeMap<String, serde_json::Value> {
        match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(obj)) => obj.into_iter().collect(),
            _ => BTreeMap::new(),
        }
    }
}

/// Partial update applied through [`StateHandle::merge`]. Absent fields
/// are left untouched.
#[derive(Debug, Clone, Default)]
pub struct StateUpdate {
    /// Only applied when the blob has no `first_opened` yet.
    pub first_opened: Option<DateTime<Utc>>,
    pub last_opened: Option<DateTime<Utc>>,
    pub banner_dismissed: Option<bool>,
    pub flags: BTreeMap<String, serde_json::Value>,
}

/// Factory for per-project state handles.
#[derive(Debug, Clone)]
pub struct StateStore {
    base_dir: PathBuf,
}

impl StateStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// The conventional location under the user's app-data directory.
    pub fn default_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("specdeck")
            .join("state")
    }

    fn file_for(&self, root: &Path) -> PathBuf {
        let digest = Sha256::digest(root.to_string_lossy().as_bytes());
        let mut name = String::with_capacity(16);
        for byte in digest.iter().take(8) {
            name.push_str(&format!("{byte:02x}"));
        }
        self.base_dir.join(format!("{name}.json"))
    }

    /// Load the handle for `root`. Headless handles are in-memory only:
    /// they start from the persisted blob if one exists but never write.
    pub fn load(&self, root: &Path, is_headless: bool) -> std::io::Result<StateHandle> {
        let path = self.file_for(root);
        let state = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            serde_json::from_str(&raw).unwrap_or_default()
        } else {
            PersistedState::default()
        };
        Ok(StateHandle {
            path: (!is_headless).then_some(path),
            state,
        })
    }
}

/// Live handle to one project's persisted state.
#[derive(Debug, Clone)]
pub struct StateHandle {
    /// None for headless sessions.
    path: Option<PathBuf>,
    state: PersistedState,
}

impl StateHandle {
    /// Current blob.
    pub fn get(&self) -> &PersistedState {
        &self.state
    }

    /// Apply a partial update and persist it (unless headless).
    ///
    /// `first_opened` is set-once: an incoming value is ignored when the
    /// blob already carries one.
    pub fn merge(&mut self, update: StateUpdate) -> std::io::Result<PersistedState> {
        if self.state.first_opened.is_none() {
            self.state.first_opened = update.first_opened;
        }
        if let Some(last) = update.last_opened {
            self.state.last_opened = Some(last);
        }
        if let Some(dismissed) = update.banner_dismissed {
            self.state.banner_dismissed = dismissed;
        }
        for (key, value) in update.flags {
            self.state.flags.insert(key, value);
        }

        if let Some(path) = &self.path {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let raw = serde_json::to_string_pretty(&self.state)?;
            std::fs::write(path, raw)?;
        }
        Ok(self.state.clone())
    }
}

//! Layered configuration resolution.
//!
//! A [`ConfigSnapshot`] is produced by merging, in order:
//! defaults → settings file (`specdeck.toml`) → caller options →
//! persisted state. Each merging phase takes the snapshot by value and
//! returns the updated value with a bumped `version`, so downstream
//! components only ever see a snapshot the orchestrator handed them.
//! The `resolved` map records which layer supplied each field.
//!
//! Plugin-returned overrides are applied through
//! [`merge_plugin_overrides`], which rejects any field outside the
//! allow-listed subset plugins are shown in the first place.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::errors::{ConfigError, PluginError};
use crate::state::PersistedState;

/// Settings file name expected at the project root.
pub const SETTINGS_FILE: &str = "specdeck.toml";

/// Default viewport for e2e projects.
pub const DEFAULT_VIEWPORT: (u32, u32) = (1000, 660);
/// Component projects get a square viewport unless one is configured.
pub const COMPONENT_VIEWPORT: (u32, u32) = (500, 500);

/// Which testing mode the project session runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestingType {
    E2e,
    Component,
}

impl TestingType {
    /// The spec-type tag descriptors must carry to match this mode.
    pub fn spec_type(self) -> crate::specs::SpecType {
        match self {
            TestingType::E2e => crate::specs::SpecType::Integration,
            TestingType::Component => crate::specs::SpecType::Component,
        }
    }
}

impl std::fmt::Display for TestingType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TestingType::E2e => write!(f, "e2e"),
            TestingType::Component => write!(f, "component"),
        }
    }
}

impl std::str::FromStr for TestingType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "e2e" => Ok(TestingType::E2e),
            "component" | "ct" => Ok(TestingType::Component),
            other => Err(ConfigError::UnknownTestingType {
                value: other.to_string(),
            }),
        }
    }
}

/// Which layer supplied a config field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigSource {
    Default,
    Settings,
    Options,
    State,
    Plugin,
}

/// The merged configuration snapshot.
///
/// Single source of truth once produced. The orchestrator is the only
/// writer; phase functions consume the snapshot by value and return the
/// next version.
#[derive(Debug, Clone, Serialize)]
pub struct ConfigSnapshot {
    /// Bumped by every merging phase.
    pub version: u64,
    pub project_root: PathBuf,
    pub project_id: Option<String>,
    pub testing_type: TestingType,
    /// None until the session server reports its bound port.
    pub port: Option<u16>,
    pub base_host: String,
    pub proxy_url: Option<String>,
    pub browser_url: Option<String>,
    pub reporter_url: Option<String>,
    pub viewport_width: u32,
    pub viewport_height: u32,
    pub integration_folder: PathBuf,
    pub component_folder: PathBuf,
    pub fixtures_folder: PathBuf,
    pub plugins_file: Option<PathBuf>,
    pub support_file: Option<PathBuf>,
    pub spec_pattern: String,
    pub reporter: String,
    pub report: bool,
    /// True when running non-interactively (headless).
    pub is_text_terminal: bool,
    pub component_testing: bool,
    pub run_events_enabled: bool,
    pub env: BTreeMap<String, serde_json::Value>,
    /// Session/UI state merged from the persisted blob.
    pub state: BTreeMap<String, serde_json::Value>,
    /// Field → layer that supplied it.
    pub resolved: BTreeMap<String, ConfigSource>,
}

impl ConfigSnapshot {
    fn record(&mut self, field: &str, source: ConfigSource) {
        self.resolved.insert(field.to_string(), source);
    }

    /// Record provenance for a field set outside the resolver (e.g. the
    /// fabricated testing-type entry for component sessions).
    pub fn mark_resolved(&mut self, field: &str, source: ConfigSource) {
        self.record(field, source);
    }

    /// Whether a field still carries its built-in default.
    pub fn is_default(&self, field: &str) -> bool {
        matches!(
            self.resolved.get(field),
            None | Some(ConfigSource::Default)
        )
    }
}

/// On-disk shape of `specdeck.toml`. Every field optional; absent fields
/// fall through to the defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SettingsFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub viewport_width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub viewport_height: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integration_folder: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component_folder: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fixtures_folder: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugins_file: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub support_file: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec_pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reporter: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_events_enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, serde_json::Value>,
}

/// Caller-supplied resolution options (the programmatic layer).
#[derive(Debug, Clone, Default)]
pub struct ResolveOptions {
    pub port: Option<u16>,
    pub viewport_width: Option<u32>,
    pub viewport_height: Option<u32>,
    pub reporter: Option<String>,
    pub report: bool,
    pub is_text_terminal: bool,
    pub env: BTreeMap<String, serde_json::Value>,
}

/// Read and parse the settings file at `root`, if present.
pub fn read_settings(root: &Path) -> Result<SettingsFile, ConfigError> {
    let path = root.join(SETTINGS_FILE);
    if !path.exists() {
        return Ok(SettingsFile::default());
    }
    let raw = std::fs::read_to_string(&path).map_err(|source| ConfigError::SettingsRead {
        path: path.clone(),
        source,
    })?;
    toml::from_str(&raw).map_err(|source| ConfigError::SettingsParse { path, source })
}

/// Rewrite the settings file with a generated project id, preserving all
/// other fields. The caller is responsible for marking this write as
/// programmatic on any active settings watch.
pub fn write_project_id(root: &Path, id: &str) -> Result<(), ConfigError> {
    let path = root.join(SETTINGS_FILE);
    let mut settings = read_settings(root)?;
    settings.project_id = Some(id.to_string());
    let raw = toml::to_string_pretty(&settings).map_err(|e| ConfigError::SettingsWrite {
        path: path.clone(),
        source: std::io::Error::new(std::io::ErrorKind::InvalidData, e),
    })?;
    std::fs::write(&path, raw).map_err(|source| ConfigError::SettingsWrite { path, source })
}

/// Resolve the full snapshot for one open() phase.
///
/// The persisted state blob lands in the `state` sub-map; it never
/// shadows first-class config fields.
pub fn resolve(
    root: &Path,
    testing_type: TestingType,
    options: &ResolveOptions,
    saved_state: &PersistedState,
) -> Result<ConfigSnapshot, ConfigError> {
    let settings = read_settings(root)?;

    let mut snapshot = ConfigSnapshot {
        version: 1,
        project_root: root.to_path_buf(),
        project_id: None,
        testing_type,
        port: None,
        base_host: "localhost".to_string(),
        proxy_url: None,
        browser_url: None,
        reporter_url: None,
        viewport_width: DEFAULT_VIEWPORT.0,
        viewport_height: DEFAULT_VIEWPORT.1,
        integration_folder: root.join("deck").join("integration"),
        component_folder: root.join("deck").join("component"),
        fixtures_folder: root.join("deck").join("fixtures"),
        plugins_file: Some(root.join("deck").join("plugins.toml")),
        support_file: Some(root.join("deck").join("support.toml")),
        spec_pattern: "**/*.spec.*".to_string(),
        reporter: "spec".to_string(),
        report: false,
        is_text_terminal: false,
        component_testing: false,
        run_events_enabled: false,
        env: BTreeMap::new(),
        state: BTreeMap::new(),
        resolved: BTreeMap::new(),
    };

    // Settings-file layer
    if let Some(id) = settings.project_id {
        snapshot.project_id = Some(id);
        snapshot.record("project_id", ConfigSource::Settings);
    }
    if let Some(port) = settings.port {
        snapshot.port = Some(port);
        snapshot.record("port", ConfigSource::Settings);
    }
    if let Some(host) = settings.base_host {
        snapshot.base_host = host;
        snapshot.record("base_host", ConfigSource::Settings);
    }
    if let Some(w) = settings.viewport_width {
        snapshot.viewport_width = w;
        snapshot.record("viewport_width", ConfigSource::Settings);
    }
    if let Some(h) = settings.viewport_height {
        snapshot.viewport_height = h;
        snapshot.record("viewport_height", ConfigSource::Settings);
    }
    if let Some(dir) = settings.integration_folder {
        snapshot.integration_folder = root.join(dir);
        snapshot.record("integration_folder", ConfigSource::Settings);
    }
    if let Some(dir) = settings.component_folder {
        snapshot.component_folder = root.join(dir);
        snapshot.record("component_folder", ConfigSource::Settings);
    }
    if let Some(dir) = settings.fixtures_folder {
        snapshot.fixtures_folder = root.join(dir);
        snapshot.record("fixtures_folder", ConfigSource::Settings);
    }
    if let Some(file) = settings.plugins_file {
        snapshot.plugins_file = Some(root.join(file));
        snapshot.record("plugins_file", ConfigSource::Settings);
    }
    if let Some(file) = settings.support_file {
        snapshot.support_file = Some(root.join(file));
        snapshot.record("support_file", ConfigSource::Settings);
    }
    if let Some(pattern) = settings.spec_pattern {
        snapshot.spec_pattern = pattern;
        snapshot.record("spec_pattern", ConfigSource::Settings);
    }
    if let Some(reporter) = settings.reporter {
        snapshot.reporter = reporter;
        snapshot.record("reporter", ConfigSource::Settings);
    }
    if let Some(enabled) = settings.run_events_enabled {
        snapshot.run_events_enabled = enabled;
        snapshot.record("run_events_enabled", ConfigSource::Settings);
    }
    for (key, value) in settings.env {
        snapshot.env.insert(key, value);
    }

    // Caller-options layer
    if let Some(port) = options.port {
        snapshot.port = Some(port);
        snapshot.record("port", ConfigSource::Options);
    }
    if let Some(w) = options.viewport_width {
        snapshot.viewport_width = w;
        snapshot.record("viewport_width", ConfigSource::Options);
    }
    if let Some(h) = options.viewport_height {
        snapshot.viewport_height = h;
        snapshot.record("viewport_height", ConfigSource::Options);
    }
    if let Some(reporter) = &options.reporter {
        snapshot.reporter = reporter.clone();
        snapshot.record("reporter", ConfigSource::Options);
    }
    snapshot.report = options.report;
    snapshot.is_text_terminal = options.is_text_terminal;
    for (key, value) in &options.env {
        snapshot.env.insert(key.clone(), value.clone());
    }

    // Testing-type defaults: component sessions get a square viewport
    // unless one was configured explicitly.
    if testing_type == TestingType::Component {
        if snapshot.is_default("viewport_width") {
            snapshot.viewport_width = COMPONENT_VIEWPORT.0;
        }
        if snapshot.is_default("viewport_height") {
            snapshot.viewport_height = COMPONENT_VIEWPORT.1;
        }
    }

    // Persisted-state layer, nested under `state`
    snapshot.state = saved_state.to_map();
    snapshot.record("state", ConfigSource::State);

    Ok(derive_urls(snapshot))
}

/// The plugin-visible subset of the config. Plugins never see the raw
/// snapshot, so they cannot tamper with internals like the resolved
/// provenance or the persisted state.
#[derive(Debug, Clone, Serialize)]
pub struct SanitizedConfig {
    pub base_host: String,
    pub port: Option<u16>,
    pub viewport_width: u32,
    pub viewport_height: u32,
    pub integration_folder: PathBuf,
    pub component_folder: PathBuf,
    pub fixtures_folder: PathBuf,
    pub support_file: Option<PathBuf>,
    pub spec_pattern: String,
    pub reporter: String,
    pub report: bool,
    pub testing_type: TestingType,
    pub env: BTreeMap<String, serde_json::Value>,
}

/// Fields a plugin is allowed to override. Anything else in the returned
/// override map is rejected.
const PLUGIN_OVERRIDABLE: &[&str] = &[
    "port",
    "viewport_width",
    "viewport_height",
    "integration_folder",
    "component_folder",
    "fixtures_folder",
    "support_file",
    "spec_pattern",
    "reporter",
    "env",
];

/// Produce the allow-listed subset handed to the plugin host.
pub fn allow_list(snapshot: &ConfigSnapshot) -> SanitizedConfig {
    SanitizedConfig {
        base_host: snapshot.base_host.clone(),
        port: snapshot.port,
        viewport_width: snapshot.viewport_width,
        viewport_height: snapshot.viewport_height,
        integration_folder: snapshot.integration_folder.clone(),
        component_folder: snapshot.component_folder.clone(),
        fixtures_folder: snapshot.fixtures_folder.clone(),
        support_file: snapshot.support_file.clone(),
        spec_pattern: snapshot.spec_pattern.clone(),
        reporter: snapshot.reporter.clone(),
        report: snapshot.report,
        testing_type: snapshot.testing_type,
        env: snapshot.env.clone(),
    }
}

/// Merge plugin-returned overrides into the snapshot.
///
/// Overrides arrive as a loose map because the plugin host crosses a
/// sandbox boundary. Only allow-listed fields may appear.
pub fn merge_plugin_overrides(
    mut snapshot: ConfigSnapshot,
    overrides: BTreeMap<String, serde_json::Value>,
) -> Result<ConfigSnapshot, PluginError> {
    for (field, value) in overrides {
        if !PLUGIN_OVERRIDABLE.contains(&field.as_str()) {
            return Err(PluginError::OverrideNotAllowed { field });
        }
        let type_err = |field: &str| PluginError::OverrideNotAllowed {
            field: field.to_string(),
        };
        match field.as_str() {
            "port" => {
                snapshot.port = Some(
                    value
                        .as_u64()
                        .and_then(|v| u16::try_from(v).ok())
                        .ok_or_else(|| type_err("port"))?,
                );
            }
            "viewport_width" => {
                snapshot.viewport_width = value
                    .as_u64()
                    .and_then(|v| u32::try_from(v).ok())
                    .ok_or_else(|| type_err("viewport_width"))?;
            }
            "viewport_height" => {
                snapshot.viewport_height = value
                    .as_u64()
                    .and_then(|v| u32::try_from(v).ok())
                    .ok_or_else(|| type_err("viewport_height"))?;
            }
            "integration_folder" => {
                let dir = value.as_str().ok_or_else(|| type_err("integration_folder"))?;
                snapshot.integration_folder = snapshot.project_root.join(dir);
            }
            "component_folder" => {
                let dir = value.as_str().ok_or_else(|| type_err("component_folder"))?;
                snapshot.component_folder = snapshot.project_root.join(dir);
            }
            "fixtures_folder" => {
                let dir = value.as_str().ok_or_else(|| type_err("fixtures_folder"))?;
                snapshot.fixtures_folder = snapshot.project_root.join(dir);
            }
            "support_file" => {
                let file = value.as_str().ok_or_else(|| type_err("support_file"))?;
                snapshot.support_file = Some(snapshot.project_root.join(file));
            }
            "spec_pattern" => {
                snapshot.spec_pattern = value
                    .as_str()
                    .ok_or_else(|| type_err("spec_pattern"))?
                    .to_string();
            }
            "reporter" => {
                snapshot.reporter = value
                    .as_str()
                    .ok_or_else(|| type_err("reporter"))?
                    .to_string();
            }
            "env" => {
                let map = value.as_object().ok_or_else(|| type_err("env"))?;
                for (k, v) in map {
                    snapshot.env.insert(k.clone(), v.clone());
                }
            }
            _ => unreachable!("field checked against PLUGIN_OVERRIDABLE"),
        }
        snapshot.record(&field, ConfigSource::Plugin);
    }
    snapshot.version += 1;
    Ok(derive_urls(snapshot))
}

/// Recompute the derived URL fields from `base_host` + `port`.
pub fn derive_urls(mut snapshot: ConfigSnapshot) -> ConfigSnapshot {
    match snapshot.port {
        Some(port) => {
            let proxy = format!("http://{}:{}", snapshot.base_host, port);
            snapshot.browser_url = Some(format!("{proxy}/__/"));
            snapshot.reporter_url = Some(format!("{proxy}/__specdeck/reporter"));
            snapshot.proxy_url = Some(proxy);
        }
        None => {
            snapshot.proxy_url = None;
            snapshot.browser_url = None;
            snapshot.reporter_url = None;
        }
    }
    snapshot
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn resolve_default(root: &Path, testing_type: TestingType) -> ConfigSnapshot {
        resolve(
            root,
            testing_type,
            &ResolveOptions::default(),
            &PersistedState::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_resolve_applies_defaults() {
        let dir = tempdir().unwrap();
        let snapshot = resolve_default(dir.path(), TestingType::E2e);
        assert_eq!(snapshot.viewport_width, 1000);
        assert_eq!(snapshot.viewport_height, 660);
        assert_eq!(snapshot.base_host, "localhost");
        assert!(snapshot.port.is_none());
        assert!(snapshot.browser_url.is_none());
        assert_eq!(
            snapshot.integration_folder,
            dir.path().join("deck/integration")
        );
    }

    #[test]
    fn test_component_viewport_defaults_to_500() {
        let dir = tempdir().unwrap();
        let snapshot = resolve_default(dir.path(), TestingType::Component);
        assert_eq!(snapshot.viewport_width, 500);
        assert_eq!(snapshot.viewport_height, 500);
    }

    #[test]
    fn test_component_viewport_respects_explicit_dimensions() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join(SETTINGS_FILE),
            "viewport_width = 800\nviewport_height = 600\n",
        )
        .unwrap();
        let snapshot = resolve_default(dir.path(), TestingType::Component);
        assert_eq!(snapshot.viewport_width, 800);
        assert_eq!(snapshot.viewport_height, 600);
    }

    #[test]
    fn test_settings_file_layer_records_provenance() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(SETTINGS_FILE), "port = 9999\n").unwrap();
        let snapshot = resolve_default(dir.path(), TestingType::E2e);
        assert_eq!(snapshot.port, Some(9999));
        assert_eq!(
            snapshot.resolved.get("port"),
            Some(&ConfigSource::Settings)
        );
        // Pinned port means URLs are derivable immediately
        assert_eq!(
            snapshot.browser_url.as_deref(),
            Some("http://localhost:9999/__/")
        );
    }

    #[test]
    fn test_caller_options_override_settings() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(SETTINGS_FILE), "port = 9999\n").unwrap();
        let options = ResolveOptions {
            port: Some(4444),
            ..Default::default()
        };
        let snapshot = resolve(
            dir.path(),
            TestingType::E2e,
            &options,
            &PersistedState::default(),
        )
        .unwrap();
        assert_eq!(snapshot.port, Some(4444));
        assert_eq!(snapshot.resolved.get("port"), Some(&ConfigSource::Options));
    }

    #[test]
    fn test_bad_settings_file_is_a_parse_error() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(SETTINGS_FILE), "port = \"not a port").unwrap();
        let err = resolve(
            dir.path(),
            TestingType::E2e,
            &ResolveOptions::default(),
            &PersistedState::default(),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::SettingsParse { .. }));
    }

    #[test]
    fn test_allow_list_excludes_internals() {
        let dir = tempdir().unwrap();
        let snapshot = resolve_default(dir.path(), TestingType::E2e);
        let sanitized = allow_list(&snapshot);
        let json = serde_json::to_value(&sanitized).unwrap();
        let obj = json.as_object().unwrap();
        assert!(!obj.contains_key("resolved"));
        assert!(!obj.contains_key("state"));
        assert!(!obj.contains_key("project_id"));
    }

    #[test]
    fn test_merge_plugin_overrides_applies_and_bumps_version() {
        let dir = tempdir().unwrap();
        let snapshot = resolve_default(dir.path(), TestingType::E2e);
        let before = snapshot.version;
        let mut overrides = BTreeMap::new();
        overrides.insert("viewport_width".to_string(), serde_json::json!(1280));
        let merged = merge_plugin_overrides(snapshot, overrides).unwrap();
        assert_eq!(merged.viewport_width, 1280);
        assert_eq!(merged.version, before + 1);
        assert_eq!(
            merged.resolved.get("viewport_width"),
            Some(&ConfigSource::Plugin)
        );
    }

    #[test]
    fn test_merge_plugin_overrides_rejects_unlisted_field() {
        let dir = tempdir().unwrap();
        let snapshot = resolve_default(dir.path(), TestingType::E2e);
        let mut overrides = BTreeMap::new();
        overrides.insert("project_id".to_string(), serde_json::json!("hijacked"));
        let err = merge_plugin_overrides(snapshot, overrides).unwrap_err();
        assert!(matches!(
            err,
            PluginError::OverrideNotAllowed { field } if field == "project_id"
        ));
    }

    #[test]
    fn test_derive_urls_clears_when_port_unset() {
        let dir = tempdir().unwrap();
        let mut snapshot = resolve_default(dir.path(), TestingType::E2e);
        snapshot.port = Some(8080);
        let snapshot = derive_urls(snapshot);
        assert_eq!(
            snapshot.proxy_url.as_deref(),
            Some("http://localhost:8080")
        );
        let mut snapshot = snapshot;
        snapshot.port = None;
        let snapshot = derive_urls(snapshot);
        assert!(snapshot.proxy_url.is_none());
        assert!(snapshot.browser_url.is_none());
    }

    #[test]
    fn test_write_project_id_preserves_other_fields() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(SETTINGS_FILE), "port = 9999\n").unwrap();
        write_project_id(dir.path(), "abc-123").unwrap();
        let settings = read_settings(dir.path()).unwrap();
        assert_eq!(settings.project_id.as_deref(), Some("abc-123"));
        assert_eq!(settings.port, Some(9999));
    }

    #[test]
    fn test_testing_type_parse_round_trip() {
        assert_eq!("e2e".parse::<TestingType>().unwrap(), TestingType::E2e);
        assert_eq!(
            "component".parse::<TestingType>().unwrap(),
            TestingType::Component
        );
        assert_eq!("ct".parse::<TestingType>().unwrap(), TestingType::Component);
        assert!(matches!(
            "ui".parse::<TestingType>().unwrap_err(),
            ConfigError::UnknownTestingType { .. }
        ));
    }
}

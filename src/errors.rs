//! Typed error hierarchy for the specdeck orchestrator.
//!
//! One top-level enum per subsystem:
//! - `ConfigError` — project root and configuration resolution failures
//! - `ResourceError` — missing files the resolved config points at
//! - `RemoteError` — account/remote-API failures, carrying the HTTP status
//! - `PluginError` — plugin host init, re-init, and run-event failures
//! - `ReporterError` — reporter resolution vs. load failures
//!
//! `ProjectError` is the umbrella returned by lifecycle operations. Every
//! error exposes a stable machine-readable kind via [`ProjectError::kind`].

use std::path::PathBuf;
use thiserror::Error;

/// Errors from configuration resolution.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Project root {path} does not exist")]
    ProjectRootMissing { path: PathBuf },

    #[error("Project root {path} is not a directory")]
    ProjectRootNotDirectory { path: PathBuf },

    #[error("Unrecognized testing type '{value}'. Valid values: e2e, component")]
    UnknownTestingType { value: String },

    #[error("Failed to read settings file at {path}: {source}")]
    SettingsRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse settings file at {path}: {source}")]
    SettingsParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Failed to write settings file at {path}: {source}")]
    SettingsWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors for files the resolved configuration references but which are
/// absent on disk.
#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("Support file missing at {path}")]
    SupportFileMissing {
        path: PathBuf,
        /// Every location that was checked before giving up.
        searched: Vec<PathBuf>,
    },

    #[error("No project found at {root}")]
    ProjectNotFoundAtRoot { root: PathBuf },
}

/// Errors from the remote project/account API.
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("No auth token available")]
    TokenMissing,

    #[error("{}", api_display(.status, .message))]
    Api {
        /// HTTP status, when the failure carried one.
        status: Option<u16>,
        message: String,
    },

    #[error("Remote API transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

fn api_display(status: &Option<u16>, message: &str) -> String {
    match status {
        Some(status) => format!("Remote API request failed ({status}): {message}"),
        None => format!("Remote API request failed: {message}"),
    }
}

impl RemoteError {
    /// HTTP status code if this failure carried one.
    pub fn status(&self) -> Option<u16> {
        match self {
            RemoteError::Api { status, .. } => *status,
            RemoteError::Transport(e) => e.status().map(|s| s.as_u16()),
            RemoteError::TokenMissing => None,
        }
    }
}

/// Errors from the plugin host.
#[derive(Debug, Error)]
pub enum PluginError {
    #[error("Plugin host initialization failed for {plugins_file}: {message}")]
    InitFailed {
        plugins_file: PathBuf,
        message: String,
    },

    #[error("Plugin override rejected for field '{field}': not in the allow-listed config")]
    OverrideNotAllowed { field: String },

    #[error("Run event '{event}' failed: {message}")]
    RunEventFailed { event: String, message: String },
}

/// Errors from reporter resolution.
///
/// `NotResolvable` means no candidate path existed at all; `LoadFailed`
/// means a candidate was found but could not be loaded. Callers rely on
/// the distinction to fall back to built-in reporters.
#[derive(Debug, Error)]
pub enum ReporterError {
    #[error("Reporter '{name}' could not be resolved")]
    NotResolvable {
        name: String,
        searched: Vec<PathBuf>,
    },

    #[error("Reporter '{name}' failed to load from {path}: {source}")]
    LoadFailed {
        name: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Umbrella error for lifecycle operations.
#[derive(Debug, Error)]
pub enum ProjectError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Resource(#[from] ResourceError),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Plugin(#[from] PluginError),

    #[error(transparent)]
    Reporter(#[from] ReporterError),

    #[error("Session server error: {0}")]
    Server(String),

    #[error("State persistence error: {0}")]
    State(#[source] std::io::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ProjectError {
    /// Stable machine-readable kind for each error family.
    pub fn kind(&self) -> &'static str {
        match self {
            ProjectError::Config(_) => "configuration",
            ProjectError::Resource(_) => "resource-not-found",
            ProjectError::Remote(_) => "auth",
            ProjectError::Plugin(_) => "plugin",
            ProjectError::Reporter(_) => "reporter-resolution",
            ProjectError::Server(_) => "session-server",
            ProjectError::State(_) => "state-persistence",
            ProjectError::Io(_) => "io",
            ProjectError::Other(_) => "other",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn config_error_unknown_testing_type_is_matchable() {
        let err = ConfigError::UnknownTestingType { value: "ui".into() };
        match &err {
            ConfigError::UnknownTestingType { value } => assert_eq!(value, "ui"),
            _ => panic!("Expected UnknownTestingType"),
        }
        assert!(err.to_string().contains("ui"));
    }

    #[test]
    fn resource_error_support_file_carries_searched_paths() {
        let err = ResourceError::SupportFileMissing {
            path: PathBuf::from("/proj/deck/support.rs"),
            searched: vec![
                PathBuf::from("/proj/deck/support.rs"),
                PathBuf::from("/proj/deck/support"),
            ],
        };
        match &err {
            ResourceError::SupportFileMissing { searched, .. } => {
                assert_eq!(searched.len(), 2);
            }
            _ => panic!("Expected SupportFileMissing"),
        }
    }

    #[test]
    fn remote_error_api_carries_status() {
        let err = RemoteError::Api {
            status: Some(403),
            message: "forbidden".into(),
        };
        assert_eq!(err.status(), Some(403));
        assert!(err.to_string().contains("403"));
    }

    #[test]
    fn remote_error_without_status_displays_cleanly() {
        let err = RemoteError::Api {
            status: None,
            message: "connection reset".into(),
        };
        assert_eq!(err.status(), None);
        assert!(!err.to_string().contains('('));
    }

    #[test]
    fn reporter_error_variants_are_distinct() {
        let not_found = ReporterError::NotResolvable {
            name: "teamcity".into(),
            searched: vec![],
        };
        let load = ReporterError::LoadFailed {
            name: "teamcity".into(),
            path: PathBuf::from("/proj/reporters/teamcity.toml"),
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, "bad"),
        };
        assert!(matches!(not_found, ReporterError::NotResolvable { .. }));
        assert!(matches!(load, ReporterError::LoadFailed { .. }));
    }

    #[test]
    fn project_error_kind_is_stable() {
        let err: ProjectError = ConfigError::UnknownTestingType { value: "x".into() }.into();
        assert_eq!(err.kind(), "configuration");

        let err: ProjectError = PluginError::OverrideNotAllowed {
            field: "port".into(),
        }
        .into();
        assert_eq!(err.kind(), "plugin");
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&ConfigError::UnknownTestingType { value: "x".into() });
        assert_std_error(&ResourceError::ProjectNotFoundAtRoot {
            root: PathBuf::from("/nope"),
        });
        assert_std_error(&PluginError::OverrideNotAllowed { field: "x".into() });
    }
}

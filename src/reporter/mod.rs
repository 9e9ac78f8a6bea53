//! Reporter resolution.
//!
//! Built-in reporters resolve by name. Anything else is searched on
//! disk; "nothing found anywhere" and "found but broken" are distinct
//! failures so callers can fall back for the former and surface the
//! latter.

use std::path::{Path, PathBuf};

use crate::errors::ReporterError;

/// Reporters shipped with the runner.
pub const BUILT_IN: &[&str] = &["spec", "dot", "json", "junit"];

/// A resolved reporter, ready to instantiate.
#[derive(Debug, Clone, PartialEq)]
pub struct ReporterSpec {
    pub name: String,
    /// None for built-ins.
    pub path: Option<PathBuf>,
    pub options: serde_json::Value,
}

/// Candidate locations for a custom reporter, in search order:
/// the project's reporter directory, then the name taken as a
/// root-relative path.
pub fn resolve_search_paths(name: &str, root: &Path) -> Vec<PathBuf> {
    vec![
        root.join("deck").join("reporters").join(format!("{name}.toml")),
        root.join(name),
    ]
}

/// Resolve `name` to a reporter definition.
pub fn load(name: &str, root: &Path) -> Result<ReporterSpec, ReporterError> {
    if BUILT_IN.contains(&name) {
        return Ok(ReporterSpec {
            name: name.to_string(),
            path: None,
            options: serde_json::Value::Null,
        });
    }

    let searched = resolve_search_paths(name, root);
    for candidate in &searched {
        match std::fs::read_to_string(candidate) {
            Ok(raw) => {
                // A candidate exists; a parse failure is a load failure,
                // not a resolution failure.
                return match toml::from_str::<toml::Value>(&raw) {
                    Ok(_) => Ok(ReporterSpec {
                        name: name.to_string(),
                        path: Some(candidate.clone()),
                        options: serde_json::Value::Null,
                    }),
                    Err(e) => Err(ReporterError::LoadFailed {
                        name: name.to_string(),
                        path: candidate.clone(),
                        source: std::io::Error::new(std::io::ErrorKind::InvalidData, e),
                    }),
                };
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => {
                return Err(ReporterError::LoadFailed {
                    name: name.to_string(),
                    path: candidate.clone(),
                    source: e,
                });
            }
        }
    }

    Err(ReporterError::NotResolvable {
        name: name.to_string(),
        searched,
    })
}

/// Resolve and attach instance options.
pub fn create(
    name: &str,
    options: serde_json::Value,
    root: &Path,
) -> Result<ReporterSpec, ReporterError> {
    let mut spec = load(name, root)?;
    spec.options = options;
    Ok(spec)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_built_in_resolves_without_touching_disk() {
        let spec = load("spec", Path::new("/nonexistent")).unwrap();
        assert_eq!(spec.name, "spec");
        assert!(spec.path.is_none());
    }

    #[test]
    fn test_missing_reporter_is_not_resolvable_with_searched_paths() {
        let dir = tempdir().unwrap();
        let err = load("teamcity", dir.path()).unwrap_err();
        match err {
            ReporterError::NotResolvable { name, searched } => {
                assert_eq!(name, "teamcity");
                assert_eq!(searched.len(), 2);
                assert!(searched[0].ends_with("deck/reporters/teamcity.toml"));
            }
            other => panic!("Expected NotResolvable, got {other:?}"),
        }
    }

    #[test]
    fn test_broken_reporter_is_a_load_failure() {
        let dir = tempdir().unwrap();
        let reporters = dir.path().join("deck").join("reporters");
        std::fs::create_dir_all(&reporters).unwrap();
        std::fs::write(reporters.join("custom.toml"), "not = [valid").unwrap();

        let err = load("custom", dir.path()).unwrap_err();
        assert!(matches!(err, ReporterError::LoadFailed { .. }));
    }

    #[test]
    fn test_custom_reporter_resolves_from_reporter_dir() {
        let dir = tempdir().unwrap();
        let reporters = dir.path().join("deck").join("reporters");
        std::fs::create_dir_all(&reporters).unwrap();
        std::fs::write(reporters.join("custom.toml"), "format = \"tap\"\n").unwrap();

        let spec = create("custom", serde_json::json!({"color": false}), dir.path()).unwrap();
        assert_eq!(spec.path.unwrap(), reporters.join("custom.toml"));
        assert_eq!(spec.options, serde_json::json!({"color": false}));
    }
}

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

use crate::error::{Result, RuntimeError};

pub const ENV_WORKFLOW_HOME: &str = "SPEC_WORKFLOW_HOME";
pub const ENV_HOST_PATH_PREFIX: &str = "SPEC_WORKFLOW_HOST_PATH_PREFIX";
pub const ENV_CONTAINER_PATH_PREFIX: &str = "SPEC_WORKFLOW_CONTAINER_PATH_PREFIX";

pub const EVENTS_LOG_FILE: &str = "runtime-events-v2.jsonl";
pub const SNAPSHOTS_FILE: &str = "runtime-snapshots-v2.json";
pub const PROJECT_REGISTRY_FILE: &str = "activeProjects.json";
pub const MERKLE_DIR: &str = "merkle";

/// Resolve the global state directory: `SPEC_WORKFLOW_HOME` (absolute, or
/// resolved against cwd) or `~/.spec-context-mcp`.
pub fn resolve_global_dir(env: &HashMap<String, String>) -> Result<PathBuf> {
    if let Some(raw) = env.get(ENV_WORKFLOW_HOME) {
        let trimmed = raw.trim();
        if !trimmed.is_empty() {
            let path = PathBuf::from(trimmed);
            if path.is_absolute() {
                return Ok(path);
            }
            let cwd = std::env::current_dir()?;
            return Ok(cwd.join(path));
        }
    }
    let home = dirs::home_dir()
        .ok_or_else(|| RuntimeError::Config("cannot determine home directory".to_string()))?;
    Ok(home.join(".spec-context-mcp"))
}

/// Host↔container path rewrite, active only when both prefixes are set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathMapping {
    pub host_prefix: PathBuf,
    pub container_prefix: PathBuf,
}

fn contains_parent_component(path: &Path) -> bool {
    path.components()
        .any(|component| matches!(component, Component::ParentDir))
}

impl PathMapping {
    /// Both env vars must be present, absolute, and traversal-free; a
    /// single one is a configuration error.
    pub fn from_env(env: &HashMap<String, String>) -> Result<Option<Self>> {
        let host = env.get(ENV_HOST_PATH_PREFIX).map(|v| v.trim().to_string());
        let container = env
            .get(ENV_CONTAINER_PATH_PREFIX)
            .map(|v| v.trim().to_string());

        let (host, container) = match (host, container) {
            (None, None) => return Ok(None),
            (Some(h), Some(c)) if !h.is_empty() && !c.is_empty() => (h, c),
            _ => {
                return Err(RuntimeError::Config(format!(
                    "{ENV_HOST_PATH_PREFIX} and {ENV_CONTAINER_PATH_PREFIX} must both be set"
                )))
            }
        };

        let host_prefix = PathBuf::from(&host);
        let container_prefix = PathBuf::from(&container);
        for (name, path) in [
            (ENV_HOST_PATH_PREFIX, &host_prefix),
            (ENV_CONTAINER_PATH_PREFIX, &container_prefix),
        ] {
            if !path.is_absolute() {
                return Err(RuntimeError::Config(format!("{name} must be absolute")));
            }
            if contains_parent_component(path) {
                return Err(RuntimeError::Config(format!(
                    "{name} must not contain \"..\""
                )));
            }
        }

        Ok(Some(Self {
            host_prefix,
            container_prefix,
        }))
    }

    /// Rewrite a host path into its container location, when it falls
    /// under the host prefix.
    pub fn host_to_container(&self, path: &Path) -> PathBuf {
        match path.strip_prefix(&self.host_prefix) {
            Ok(rest) => self.container_prefix.join(rest),
            Err(_) => path.to_path_buf(),
        }
    }

    pub fn container_to_host(&self, path: &Path) -> PathBuf {
        match path.strip_prefix(&self.container_prefix) {
            Ok(rest) => self.host_prefix.join(rest),
            Err(_) => path.to_path_buf(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn workflow_home_override_wins() {
        let dir = resolve_global_dir(&env(&[(ENV_WORKFLOW_HOME, "/var/lib/relay")])).unwrap();
        assert_eq!(dir, PathBuf::from("/var/lib/relay"));
    }

    #[test]
    fn relative_workflow_home_resolves_against_cwd() {
        let dir = resolve_global_dir(&env(&[(ENV_WORKFLOW_HOME, "state/relay")])).unwrap();
        assert!(dir.is_absolute());
        assert!(dir.ends_with("state/relay"));
    }

    #[test]
    fn default_global_dir_is_under_home() {
        let dir = resolve_global_dir(&env(&[])).unwrap();
        assert!(dir.ends_with(".spec-context-mcp"));
    }

    #[test]
    fn mapping_requires_both_prefixes() {
        assert!(PathMapping::from_env(&env(&[])).unwrap().is_none());
        let err =
            PathMapping::from_env(&env(&[(ENV_HOST_PATH_PREFIX, "/host")])).unwrap_err();
        assert!(err.to_string().contains("both"));
    }

    #[test]
    fn mapping_rejects_relative_and_traversal_prefixes() {
        let err = PathMapping::from_env(&env(&[
            (ENV_HOST_PATH_PREFIX, "host"),
            (ENV_CONTAINER_PATH_PREFIX, "/workspace"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("absolute"));

        let err = PathMapping::from_env(&env(&[
            (ENV_HOST_PATH_PREFIX, "/host/../etc"),
            (ENV_CONTAINER_PATH_PREFIX, "/workspace"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains(".."));
    }

    #[test]
    fn mapping_rewrites_paths_under_the_prefix() {
        let mapping = PathMapping::from_env(&env(&[
            (ENV_HOST_PATH_PREFIX, "/Users/dev/projects"),
            (ENV_CONTAINER_PATH_PREFIX, "/workspace"),
        ]))
        .unwrap()
        .unwrap();
        assert_eq!(
            mapping.host_to_container(Path::new("/Users/dev/projects/app/src")),
            PathBuf::from("/workspace/app/src")
        );
        assert_eq!(
            mapping.container_to_host(Path::new("/workspace/app")),
            PathBuf::from("/Users/dev/projects/app")
        );
        // Paths outside the prefix pass through untouched.
        assert_eq!(
            mapping.host_to_container(Path::new("/tmp/elsewhere")),
            PathBuf::from("/tmp/elsewhere")
        );
    }
}

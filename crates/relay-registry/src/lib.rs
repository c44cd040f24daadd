//! Registry of active project instances, shared by every runtime process
//! on the machine.
//!
//! The registry is a single JSON map keyed by project id. Every mutating
//! read filters dead PIDs, so crashed processes heal out of the file on
//! the next touch. Writes are atomic; concurrent writers follow
//! last-write-wins, which the idempotent self-healing tolerates.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use thiserror::Error;
use tokio::fs;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("registry file was corrupt; backed up to {backup}")]
    Corrupt { backup: PathBuf },
}

/// First 16 hex chars of SHA-1 over the base64url encoding of the
/// absolute path.
pub fn project_id(absolute_path: &str) -> String {
    let encoded = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(absolute_path.as_bytes());
    let mut hasher = Sha1::new();
    hasher.update(encoded.as_bytes());
    let digest = hasher.finalize();
    hex::encode(digest)[..16].to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectInstance {
    pub pid: u32,
    #[serde(rename = "registeredAt")]
    pub registered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectEntry {
    #[serde(rename = "projectId")]
    pub project_id: String,
    #[serde(rename = "projectPath")]
    pub project_path: String,
    #[serde(rename = "projectName")]
    pub project_name: String,
    pub instances: Vec<ProjectInstance>,
    #[serde(default)]
    pub persistent: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupStats {
    pub dead_instances_removed: usize,
    pub entries_removed: usize,
}

type LivenessCheck = Arc<dyn Fn(u32) -> bool + Send + Sync>;

pub struct ProjectRegistry {
    path: PathBuf,
    liveness: LivenessCheck,
}

impl ProjectRegistry {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            liveness: Arc::new(pid_is_alive),
        }
    }

    /// When host↔container path mapping is active, PIDs belong to the
    /// host and cannot be probed from inside the container; treat all of
    /// them as alive.
    pub fn assume_pids_alive(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            liveness: Arc::new(|_| true),
        }
    }

    #[doc(hidden)]
    pub fn with_liveness(path: impl AsRef<Path>, liveness: LivenessCheck) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            liveness,
        }
    }

    pub async fn register_project(
        &self,
        project_path: &str,
        pid: u32,
        persistent: bool,
    ) -> Result<ProjectEntry, RegistryError> {
        let mut registry = self.load().await?;
        let id = project_id(project_path);

        let entry = registry.entry(id.clone()).or_insert_with(|| ProjectEntry {
            project_id: id.clone(),
            project_path: project_path.to_string(),
            project_name: project_name_of(project_path),
            instances: Vec::new(),
            persistent,
        });
        entry.persistent = entry.persistent || persistent;
        self.heal_entry(entry);
        entry.instances.retain(|instance| instance.pid != pid);
        entry.instances.push(ProjectInstance {
            pid,
            registered_at: Utc::now(),
        });
        let result = entry.clone();

        self.write(&registry).await?;
        Ok(result)
    }

    /// Remove one instance, or the whole entry when `pid` is `None`.
    pub async fn unregister_project(
        &self,
        project_path: &str,
        pid: Option<u32>,
    ) -> Result<bool, RegistryError> {
        let mut registry = self.load().await?;
        let id = project_id(project_path);

        let changed = match pid {
            Some(pid) => {
                let Some(entry) = registry.get_mut(&id) else {
                    return Ok(false);
                };
                let before = entry.instances.len();
                entry.instances.retain(|instance| instance.pid != pid);
                before != entry.instances.len()
            }
            None => registry.remove(&id).is_some(),
        };

        if let Some(entry) = registry.get(&id) {
            if entry.instances.is_empty() && !entry.persistent {
                registry.remove(&id);
            }
        }

        self.write(&registry).await?;
        Ok(changed)
    }

    /// Prune dead PIDs everywhere; drop empty non-persistent entries.
    pub async fn cleanup_stale_projects(&self) -> Result<CleanupStats, RegistryError> {
        let mut registry = self.load().await?;
        let mut stats = CleanupStats::default();

        for entry in registry.values_mut() {
            let before = entry.instances.len();
            self.heal_entry(entry);
            stats.dead_instances_removed += before - entry.instances.len();
        }
        let before = registry.len();
        registry.retain(|_, entry| entry.persistent || !entry.instances.is_empty());
        stats.entries_removed = before - registry.len();

        self.write(&registry).await?;
        Ok(stats)
    }

    pub async fn list_projects(&self) -> Result<Vec<ProjectEntry>, RegistryError> {
        let registry = self.load().await?;
        let mut entries: Vec<ProjectEntry> = registry.into_values().collect();
        entries.sort_by(|a, b| a.project_id.cmp(&b.project_id));
        Ok(entries)
    }

    pub async fn get_project(
        &self,
        project_path: &str,
    ) -> Result<Option<ProjectEntry>, RegistryError> {
        let registry = self.load().await?;
        Ok(registry.get(&project_id(project_path)).cloned())
    }

    fn heal_entry(&self, entry: &mut ProjectEntry) {
        entry.instances.retain(|instance| (self.liveness)(instance.pid));
    }

    async fn load(&self) -> Result<HashMap<String, ProjectEntry>, RegistryError> {
        if !fs::try_exists(&self.path).await? {
            return Ok(HashMap::new());
        }
        let raw = fs::read_to_string(&self.path).await?;
        if raw.trim().is_empty() {
            return Ok(HashMap::new());
        }
        match serde_json::from_str::<HashMap<String, ProjectEntry>>(&raw) {
            Ok(registry) => Ok(registry),
            Err(err) => {
                let backup = self.path.with_file_name(format!(
                    "{}.corrupted.{}",
                    self.path
                        .file_name()
                        .map(|n| n.to_string_lossy().to_string())
                        .unwrap_or_else(|| "activeProjects.json".to_string()),
                    Utc::now().timestamp()
                ));
                tracing::error!(error = %err, backup = %backup.display(), "corrupt project registry");
                fs::rename(&self.path, &backup).await?;
                Err(RegistryError::Corrupt { backup })
            }
        }
    }

    async fn write(&self, registry: &HashMap<String, ProjectEntry>) -> Result<(), RegistryError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let payload = serde_json::to_string_pretty(registry)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, payload).await?;
        fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

fn project_name_of(project_path: &str) -> String {
    Path::new(project_path)
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| project_path.to_string())
}

/// `kill(pid, 0)` liveness probe: delivery permission errors still mean
/// the process exists.
#[cfg(unix)]
fn pid_is_alive(pid: u32) -> bool {
    let result = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if result == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn pid_is_alive(_pid: u32) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_with_liveness(
        tmp: &tempfile::TempDir,
        alive: &'static [u32],
    ) -> ProjectRegistry {
        ProjectRegistry::with_liveness(
            tmp.path().join("activeProjects.json"),
            Arc::new(move |pid| alive.contains(&pid)),
        )
    }

    #[test]
    fn project_ids_are_16_hex_chars_and_deterministic() {
        let a = project_id("/work/alpha");
        let b = project_id("/work/alpha");
        let c = project_id("/work/beta");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 16);
        assert!(a.chars().all(|ch| ch.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn register_appends_and_deduplicates_pids() {
        let tmp = tempfile::TempDir::new().unwrap();
        let registry = registry_with_liveness(&tmp, &[100, 200]);

        registry.register_project("/work/alpha", 100, false).await.unwrap();
        let entry = registry.register_project("/work/alpha", 100, false).await.unwrap();
        assert_eq!(entry.instances.len(), 1);

        let entry = registry.register_project("/work/alpha", 200, false).await.unwrap();
        assert_eq!(entry.instances.len(), 2);
        assert_eq!(entry.project_name, "alpha");
    }

    #[tokio::test]
    async fn register_filters_dead_pids_on_the_way_in() {
        let tmp = tempfile::TempDir::new().unwrap();
        let registry = registry_with_liveness(&tmp, &[200]);

        // PID 999 is dead per the probe; registering it then touching the
        // entry heals it away.
        registry.register_project("/work/alpha", 999, false).await.unwrap();
        let entry = registry.register_project("/work/alpha", 200, false).await.unwrap();
        assert_eq!(entry.instances.len(), 1);
        assert_eq!(entry.instances[0].pid, 200);
    }

    #[tokio::test]
    async fn cleanup_prunes_dead_pids_and_empty_non_persistent_entries() {
        let tmp = tempfile::TempDir::new().unwrap();
        let registry = registry_with_liveness(&tmp, &[1]);

        registry.register_project("/work/kept", 1, false).await.unwrap();
        registry.register_project("/work/doomed", 999, false).await.unwrap();
        registry.register_project("/work/pinned", 998, true).await.unwrap();

        let stats = registry.cleanup_stale_projects().await.unwrap();
        assert_eq!(stats.dead_instances_removed, 2);
        assert_eq!(stats.entries_removed, 1);

        let entries = registry.list_projects().await.unwrap();
        let paths: Vec<&str> = entries.iter().map(|e| e.project_path.as_str()).collect();
        assert!(paths.contains(&"/work/kept"));
        assert!(paths.contains(&"/work/pinned"));
        assert!(!paths.contains(&"/work/doomed"));
    }

    #[tokio::test]
    async fn unregister_removes_instance_or_whole_entry() {
        let tmp = tempfile::TempDir::new().unwrap();
        let registry = registry_with_liveness(&tmp, &[1, 2]);

        registry.register_project("/work/alpha", 1, false).await.unwrap();
        registry.register_project("/work/alpha", 2, false).await.unwrap();

        assert!(registry.unregister_project("/work/alpha", Some(1)).await.unwrap());
        let entry = registry.get_project("/work/alpha").await.unwrap().unwrap();
        assert_eq!(entry.instances.len(), 1);

        // Removing the last instance deletes the non-persistent entry.
        registry.unregister_project("/work/alpha", Some(2)).await.unwrap();
        assert!(registry.get_project("/work/alpha").await.unwrap().is_none());

        assert!(!registry.unregister_project("/work/ghost", None).await.unwrap());
    }

    #[tokio::test]
    async fn corrupt_file_is_backed_up_and_fatal() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("activeProjects.json");
        std::fs::write(&path, "{not json at all").unwrap();

        let registry = ProjectRegistry::with_liveness(&path, Arc::new(|_| true));
        let err = registry.list_projects().await.unwrap_err();
        assert!(matches!(err, RegistryError::Corrupt { .. }));
        assert!(!path.exists());
        let backups: Vec<_> = std::fs::read_dir(tmp.path())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().contains(".corrupted."))
            .collect();
        assert_eq!(backups.len(), 1);
    }

    #[tokio::test]
    async fn malformed_shape_is_treated_as_corrupt() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("activeProjects.json");
        // Valid JSON, wrong shape: instances must be an array.
        std::fs::write(
            &path,
            r#"{"abc":{"projectId":"abc","projectPath":"/p","projectName":"p","instances":"nope"}}"#,
        )
        .unwrap();

        let registry = ProjectRegistry::with_liveness(&path, Arc::new(|_| true));
        assert!(matches!(
            registry.list_projects().await.unwrap_err(),
            RegistryError::Corrupt { .. }
        ));
    }

    #[tokio::test]
    async fn current_process_is_alive_by_probe() {
        let tmp = tempfile::TempDir::new().unwrap();
        let registry = ProjectRegistry::new(tmp.path().join("activeProjects.json"));
        let entry = registry
            .register_project("/work/self", std::process::id(), false)
            .await
            .unwrap();
        assert_eq!(entry.instances.len(), 1);
    }
}

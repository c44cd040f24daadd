//! File-set synchronizer for a project tree.
//!
//! Scans the workspace (ignore-aware), fingerprints every file, and
//! reports added/removed/modified sets against the previous durable
//! snapshot. Snapshots live under `{state_dir}/merkle/` named by a hash
//! of the absolute root path, one file per synced tree.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use ignore::WalkBuilder;
use md5::{Digest as Md5Digest, Md5};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Files up to this size are content-hashed; larger files rely on
/// mtime+size alone.
const CONTENT_HASH_LIMIT: u64 = 1024 * 1024;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("scan task failed: {0}")]
    Scan(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileFingerprint {
    pub mtime_ms: i64,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MerkleSnapshot {
    pub root: String,
    pub files: BTreeMap<String, FileFingerprint>,
    pub root_hash: String,
    pub scanned_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncReport {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub modified: Vec<String>,
    pub file_count: usize,
    pub root_hash: String,
}

impl SyncReport {
    pub fn is_clean(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.modified.is_empty()
    }
}

/// Snapshot file name for a tree root: hex MD5 of the absolute path.
pub fn snapshot_file_name(absolute_root: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(absolute_root.as_bytes());
    format!("{}.json", hex::encode(hasher.finalize()))
}

pub struct MerkleSynchronizer {
    root: PathBuf,
    snapshot_dir: PathBuf,
}

impl MerkleSynchronizer {
    pub fn new(root: impl Into<PathBuf>, snapshot_dir: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            snapshot_dir: snapshot_dir.into(),
        }
    }

    fn snapshot_path(&self) -> PathBuf {
        self.snapshot_dir
            .join(snapshot_file_name(&self.root.to_string_lossy()))
    }

    /// Scan the tree and report the delta against the stored snapshot,
    /// then persist the new snapshot.
    pub async fn sync(&self) -> Result<SyncReport, SyncError> {
        let root = self.root.clone();
        let files = tokio::task::spawn_blocking(move || scan_tree(&root))
            .await
            .map_err(|err| SyncError::Scan(err.to_string()))??;

        let previous = self.load_snapshot().await?;
        let report = diff(previous.as_ref().map(|s| &s.files), &files);

        let snapshot = MerkleSnapshot {
            root: self.root.to_string_lossy().to_string(),
            root_hash: report.root_hash.clone(),
            files,
            scanned_at: Utc::now(),
        };
        self.store_snapshot(&snapshot).await?;

        tracing::debug!(
            root = %snapshot.root,
            added = report.added.len(),
            removed = report.removed.len(),
            modified = report.modified.len(),
            "workspace sync complete"
        );
        Ok(report)
    }

    pub async fn load_snapshot(&self) -> Result<Option<MerkleSnapshot>, SyncError> {
        let path = self.snapshot_path();
        if !tokio::fs::try_exists(&path).await? {
            return Ok(None);
        }
        let raw = tokio::fs::read_to_string(&path).await?;
        Ok(serde_json::from_str(&raw).ok())
    }

    async fn store_snapshot(&self, snapshot: &MerkleSnapshot) -> Result<(), SyncError> {
        tokio::fs::create_dir_all(&self.snapshot_dir).await?;
        let path = self.snapshot_path();
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_string_pretty(snapshot)?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

fn scan_tree(root: &Path) -> Result<BTreeMap<String, FileFingerprint>, SyncError> {
    let mut files = BTreeMap::new();
    for entry in WalkBuilder::new(root).hidden(false).build().flatten() {
        if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            continue;
        }
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        let relative = entry
            .path()
            .strip_prefix(root)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .to_string();
        let mtime_ms = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        let size = metadata.len();
        let content_hash = if size <= CONTENT_HASH_LIMIT {
            std::fs::read(entry.path()).ok().map(|bytes| {
                let mut hasher = Sha256::new();
                hasher.update(&bytes);
                format!("{:064x}", hasher.finalize())
            })
        } else {
            None
        };
        files.insert(
            relative,
            FileFingerprint {
                mtime_ms,
                size,
                content_hash,
            },
        );
    }
    Ok(files)
}

fn changed(previous: &FileFingerprint, current: &FileFingerprint) -> bool {
    match (&previous.content_hash, &current.content_hash) {
        (Some(a), Some(b)) => a != b,
        _ => previous.mtime_ms != current.mtime_ms || previous.size != current.size,
    }
}

fn diff(
    previous: Option<&BTreeMap<String, FileFingerprint>>,
    current: &BTreeMap<String, FileFingerprint>,
) -> SyncReport {
    let mut report = SyncReport {
        file_count: current.len(),
        root_hash: combined_hash(current),
        ..SyncReport::default()
    };

    let empty = BTreeMap::new();
    let previous = previous.unwrap_or(&empty);

    for (path, fingerprint) in current {
        match previous.get(path) {
            None => report.added.push(path.clone()),
            Some(old) if changed(old, fingerprint) => report.modified.push(path.clone()),
            Some(_) => {}
        }
    }
    for path in previous.keys() {
        if !current.contains_key(path) {
            report.removed.push(path.clone());
        }
    }
    report
}

fn combined_hash(files: &BTreeMap<String, FileFingerprint>) -> String {
    let mut hasher = Sha256::new();
    for (path, fingerprint) in files {
        hasher.update(path.as_bytes());
        hasher.update(b"\0");
        match &fingerprint.content_hash {
            Some(hash) => hasher.update(hash.as_bytes()),
            None => {
                hasher.update(fingerprint.mtime_ms.to_le_bytes());
                hasher.update(fingerprint.size.to_le_bytes());
            }
        }
        hasher.update(b"\n");
    }
    format!("{:064x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (tempfile::TempDir, MerkleSynchronizer) {
        let tmp = tempfile::TempDir::new().unwrap();
        let workspace = tmp.path().join("workspace");
        std::fs::create_dir_all(&workspace).unwrap();
        let sync = MerkleSynchronizer::new(workspace, tmp.path().join("merkle"));
        (tmp, sync)
    }

    #[tokio::test]
    async fn first_sync_reports_everything_added() {
        let (tmp, sync) = setup();
        std::fs::write(tmp.path().join("workspace/a.rs"), "fn a() {}").unwrap();
        std::fs::write(tmp.path().join("workspace/b.rs"), "fn b() {}").unwrap();

        let report = sync.sync().await.unwrap();
        assert_eq!(report.added.len(), 2);
        assert!(report.removed.is_empty());
        assert!(report.modified.is_empty());
        assert_eq!(report.file_count, 2);
    }

    #[tokio::test]
    async fn unchanged_tree_is_clean_on_resync() {
        let (tmp, sync) = setup();
        std::fs::write(tmp.path().join("workspace/a.rs"), "fn a() {}").unwrap();
        sync.sync().await.unwrap();
        let report = sync.sync().await.unwrap();
        assert!(report.is_clean());
    }

    #[tokio::test]
    async fn modifications_and_removals_are_detected() {
        let (tmp, sync) = setup();
        let a = tmp.path().join("workspace/a.rs");
        let b = tmp.path().join("workspace/b.rs");
        std::fs::write(&a, "fn a() {}").unwrap();
        std::fs::write(&b, "fn b() {}").unwrap();
        sync.sync().await.unwrap();

        std::fs::write(&a, "fn a() { /* changed */ }").unwrap();
        std::fs::remove_file(&b).unwrap();
        std::fs::write(tmp.path().join("workspace/c.rs"), "fn c() {}").unwrap();

        let report = sync.sync().await.unwrap();
        assert_eq!(report.modified, vec!["a.rs".to_string()]);
        assert_eq!(report.removed, vec!["b.rs".to_string()]);
        assert_eq!(report.added, vec!["c.rs".to_string()]);
    }

    #[tokio::test]
    async fn snapshot_survives_a_new_synchronizer_instance() {
        let (tmp, sync) = setup();
        std::fs::write(tmp.path().join("workspace/a.rs"), "fn a() {}").unwrap();
        sync.sync().await.unwrap();

        let again = MerkleSynchronizer::new(
            tmp.path().join("workspace"),
            tmp.path().join("merkle"),
        );
        let report = again.sync().await.unwrap();
        assert!(report.is_clean());
    }

    #[test]
    fn snapshot_file_names_are_md5_of_the_root() {
        let name = snapshot_file_name("/work/alpha");
        assert!(name.ends_with(".json"));
        assert_eq!(name.len(), 32 + 5);
        assert_eq!(name, snapshot_file_name("/work/alpha"));
        assert_ne!(name, snapshot_file_name("/work/beta"));
    }
}

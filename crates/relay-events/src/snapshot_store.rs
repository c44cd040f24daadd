use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::{watch, Mutex};

use relay_types::{AppliedOffset, RunSnapshot};

use crate::error::SnapshotStoreError;
use crate::projector::SnapshotUpdate;

pub const SNAPSHOT_FORMAT_VERSION: &str = "v2";

#[derive(Debug, Clone)]
pub struct SnapshotStoreConfig {
    /// Debounce window between an upsert and the disk write.
    pub debounce: Duration,
}

impl Default for SnapshotStoreConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(35),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotFile {
    #[serde(rename = "formatVersion")]
    format_version: String,
    snapshots: HashMap<String, RunSnapshot>,
    #[serde(rename = "lastUpdated")]
    last_updated: DateTime<Utc>,
}

struct StoreState {
    snapshots: HashMap<String, RunSnapshot>,
    dirty: bool,
    write_scheduled: bool,
    persist_error: Option<String>,
    /// Set when the on-disk file carries a foreign format version. The
    /// store then behaves as empty and never mutates the file.
    read_only: bool,
    debounce: Duration,
}

/// Revisioned per-run snapshot store persisted as a single JSON file.
/// Writes are debounced and atomic (temp file + rename), so readers always
/// see a complete file.
pub struct SnapshotStore {
    path: PathBuf,
    state: Arc<Mutex<StoreState>>,
    write_gen: watch::Sender<u64>,
}

impl SnapshotStore {
    pub async fn open(
        path: impl AsRef<Path>,
        config: SnapshotStoreConfig,
    ) -> Result<Self, SnapshotStoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut snapshots = HashMap::new();
        let mut read_only = false;
        if fs::try_exists(&path).await? {
            let raw = fs::read_to_string(&path).await?;
            let file: SnapshotFile = serde_json::from_str(&raw)?;
            if file.format_version == SNAPSHOT_FORMAT_VERSION {
                snapshots = file.snapshots;
            } else {
                tracing::warn!(
                    found = %file.format_version,
                    expected = SNAPSHOT_FORMAT_VERSION,
                    "snapshot file has a foreign format version; loading empty and leaving the file untouched"
                );
                read_only = true;
            }
        }

        let (write_gen, _) = watch::channel(0u64);
        Ok(Self {
            path,
            state: Arc::new(Mutex::new(StoreState {
                snapshots,
                dirty: false,
                write_scheduled: false,
                persist_error: None,
                read_only,
                debounce: config.debounce,
            })),
            write_gen,
        })
    }

    pub async fn get(&self, run_id: &str) -> Option<RunSnapshot> {
        self.state.lock().await.snapshots.get(run_id).cloned()
    }

    pub async fn list_runs(&self) -> Vec<RunSnapshot> {
        let mut runs: Vec<RunSnapshot> =
            self.state.lock().await.snapshots.values().cloned().collect();
        runs.sort_by(|a, b| a.run_id.cmp(&b.run_id));
        runs
    }

    /// Merge a projection into the store. Applying an update whose
    /// `(partition, sequence)` is already covered is a no-op and returns
    /// the existing snapshot unchanged.
    pub async fn upsert(&self, update: SnapshotUpdate) -> Result<RunSnapshot, SnapshotStoreError> {
        let mut state = self.state.lock().await;
        let previous = state.snapshots.get(&update.run_id).cloned();

        if let Some(prev) = &previous {
            let covered = prev.applied_offset(&update.applied_offset.partition_key);
            if update.applied_offset.sequence != 0 && update.applied_offset.sequence <= covered {
                return Ok(prev.clone());
            }
        }

        let (revision, parent_config, mut applied_offsets) = match &previous {
            Some(prev) => (
                prev.revision + 1,
                format!("{}:rev:{}", update.run_id, prev.revision),
                prev.applied_offsets.clone(),
            ),
            None => (1, format!("{}:root", update.run_id), Vec::new()),
        };

        merge_offset(&mut applied_offsets, update.applied_offset);

        let snapshot = RunSnapshot {
            run_id: update.run_id.clone(),
            revision,
            projector_version: update.projector_version,
            applied_offsets,
            parent_config,
            pending_writes: update.pending_writes,
            status: update.status,
            goal: update.goal,
            facts: update.facts,
            token_budget: update.token_budget,
            updated_at: Utc::now(),
        };

        state
            .snapshots
            .insert(update.run_id.clone(), snapshot.clone());
        state.dirty = true;
        if !state.write_scheduled && !state.read_only {
            state.write_scheduled = true;
            self.spawn_debounced_write(state.debounce);
        }
        drop(state);

        Ok(snapshot)
    }

    /// Force persistence now and re-raise the last persistence error.
    pub async fn flush(&self) -> Result<(), SnapshotStoreError> {
        // Wait out any scheduled write so we do not race its rename.
        let mut rx = self.write_gen.subscribe();
        loop {
            let snapshot = {
                let mut state = self.state.lock().await;
                if state.write_scheduled {
                    None
                } else {
                    if let Some(message) = state.persist_error.take() {
                        return Err(SnapshotStoreError::Persist(message));
                    }
                    if !state.dirty || state.read_only {
                        return Ok(());
                    }
                    state.dirty = false;
                    Some(state.snapshots.clone())
                }
            };

            match snapshot {
                Some(map) => {
                    return write_atomic(&self.path, &map).await.map_err(|err| {
                        SnapshotStoreError::Persist(err.to_string())
                    });
                }
                None => {
                    if rx.changed().await.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }

    fn spawn_debounced_write(&self, debounce: Duration) {
        let state = Arc::clone(&self.state);
        let path = self.path.clone();
        let write_gen = self.write_gen.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(debounce).await;
                let snapshot = {
                    let mut st = state.lock().await;
                    if !st.dirty {
                        st.write_scheduled = false;
                        write_gen.send_modify(|g| *g += 1);
                        return;
                    }
                    st.dirty = false;
                    st.snapshots.clone()
                };

                let result = write_atomic(&path, &snapshot).await;

                let mut st = state.lock().await;
                if let Err(err) = result {
                    st.persist_error = Some(err.to_string());
                    tracing::error!(error = %err, "snapshot persistence failed");
                }
                // An upsert that landed mid-write re-dirties the map; stay
                // scheduled and write again after another debounce window.
                if st.dirty {
                    continue;
                }
                st.write_scheduled = false;
                write_gen.send_modify(|g| *g += 1);
                return;
            }
        });
    }
}

fn merge_offset(offsets: &mut Vec<AppliedOffset>, incoming: AppliedOffset) {
    match offsets
        .iter_mut()
        .find(|o| o.partition_key == incoming.partition_key)
    {
        Some(existing) => {
            if incoming.sequence > existing.sequence {
                existing.sequence = incoming.sequence;
            }
        }
        None => offsets.push(incoming),
    }
}

async fn write_atomic(
    path: &Path,
    snapshots: &HashMap<String, RunSnapshot>,
) -> Result<(), SnapshotStoreError> {
    let file = SnapshotFile {
        format_version: SNAPSHOT_FORMAT_VERSION.to_string(),
        snapshots: snapshots.clone(),
        last_updated: Utc::now(),
    };
    let payload = serde_json::to_string_pretty(&file)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, payload).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}

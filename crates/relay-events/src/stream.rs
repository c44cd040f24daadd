use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{watch, Mutex};
use uuid::Uuid;

use relay_types::{EventDraft, EventEnvelope, EVENT_SCHEMA_VERSION};

use crate::error::{EventStreamError, Result};

#[derive(Debug, Clone)]
pub struct EventStreamConfig {
    /// Most recent events kept in memory per partition. Older events stay
    /// on disk but are not replayed.
    pub retention_per_partition: usize,
    /// Idempotency index bound; the oldest key is evicted when exceeded.
    pub idempotency_cap: usize,
}

impl Default for EventStreamConfig {
    fn default() -> Self {
        Self {
            retention_per_partition: 2000,
            idempotency_cap: 10_000,
        }
    }
}

#[derive(Debug)]
struct StreamState {
    partitions: HashMap<String, Vec<EventEnvelope>>,
    sequences: HashMap<String, u64>,
    idempotency: HashMap<String, EventEnvelope>,
    idempotency_order: VecDeque<String>,
    pending_lines: Vec<String>,
    drain_in_flight: bool,
    persist_error: Option<String>,
    config: EventStreamConfig,
}

impl StreamState {
    fn remember_idempotency(&mut self, envelope: &EventEnvelope) {
        self.idempotency
            .insert(envelope.idempotency_key.clone(), envelope.clone());
        self.idempotency_order
            .push_back(envelope.idempotency_key.clone());
        while self.idempotency_order.len() > self.config.idempotency_cap {
            if let Some(oldest) = self.idempotency_order.pop_front() {
                self.idempotency.remove(&oldest);
            }
        }
    }

    fn append_to_partition(&mut self, envelope: EventEnvelope) {
        let retention = self.config.retention_per_partition;
        let events = self
            .partitions
            .entry(envelope.partition_key.clone())
            .or_default();
        events.push(envelope);
        if events.len() > retention {
            let excess = events.len() - retention;
            events.drain(..excess);
        }
    }
}

/// Partitioned append-only event log with idempotent publish and a durable
/// JSON-lines backing file. Publishes on the same partition are serialized
/// by the internal lock; reads return snapshot copies.
#[derive(Debug)]
pub struct EventStream {
    log_path: PathBuf,
    state: Arc<Mutex<StreamState>>,
    drain_gen: watch::Sender<u64>,
}

impl EventStream {
    /// Open the stream, replaying any existing log. Malformed lines abort
    /// with a line-annotated error.
    pub async fn open(log_path: impl AsRef<Path>, config: EventStreamConfig) -> Result<Self> {
        let log_path = log_path.as_ref().to_path_buf();
        if let Some(parent) = log_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut state = StreamState {
            partitions: HashMap::new(),
            sequences: HashMap::new(),
            idempotency: HashMap::new(),
            idempotency_order: VecDeque::new(),
            pending_lines: Vec::new(),
            drain_in_flight: false,
            persist_error: None,
            config,
        };

        if fs::try_exists(&log_path).await? {
            let raw = fs::read_to_string(&log_path).await?;
            replay(&mut state, &raw)?;
        }

        let (drain_gen, _) = watch::channel(0u64);
        Ok(Self {
            log_path,
            state: Arc::new(Mutex::new(state)),
            drain_gen,
        })
    }

    /// Assign a sequence and persist the draft. Re-publishing with a known
    /// idempotency key returns the previously stored envelope unchanged.
    pub async fn publish(&self, draft: EventDraft) -> Result<EventEnvelope> {
        if draft.partition_key.trim().is_empty() {
            return Err(EventStreamError::InvalidDraft(
                "partition key must be non-empty".into(),
            ));
        }
        if draft.idempotency_key.trim().is_empty() {
            return Err(EventStreamError::InvalidDraft(
                "idempotency key must be non-empty".into(),
            ));
        }

        let mut state = self.state.lock().await;
        if let Some(existing) = state.idempotency.get(&draft.idempotency_key) {
            return Ok(existing.clone());
        }

        let sequence = state
            .sequences
            .get(&draft.partition_key)
            .copied()
            .unwrap_or(0)
            + 1;
        state
            .sequences
            .insert(draft.partition_key.clone(), sequence);

        let envelope = EventEnvelope {
            event_id: Uuid::new_v4().to_string(),
            idempotency_key: draft.idempotency_key,
            partition_key: draft.partition_key,
            sequence,
            parent_event_id: draft.parent_event_id,
            occurred_at: Utc::now(),
            run_id: draft.run_id,
            step_id: draft.step_id,
            agent_id: draft.agent_id,
            event_type: draft.event_type,
            payload: draft.payload,
            schema_version: EVENT_SCHEMA_VERSION.to_string(),
        };

        let line = serde_json::to_string(&envelope)?;
        state.remember_idempotency(&envelope);
        state.append_to_partition(envelope.clone());
        state.pending_lines.push(line);

        if !state.drain_in_flight {
            state.drain_in_flight = true;
            self.spawn_drain();
        }
        drop(state);

        Ok(envelope)
    }

    /// Ordered tail of a partition after `after_sequence` (copy).
    pub async fn read_partition(
        &self,
        partition_key: &str,
        after_sequence: u64,
    ) -> Vec<EventEnvelope> {
        let state = self.state.lock().await;
        state
            .partitions
            .get(partition_key)
            .map(|events| {
                events
                    .iter()
                    .filter(|e| e.sequence > after_sequence)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Last assigned sequence for a partition, or 0.
    pub async fn latest_offset(&self, partition_key: &str) -> u64 {
        let state = self.state.lock().await;
        state.sequences.get(partition_key).copied().unwrap_or(0)
    }

    /// Wait for durable persistence of all pending writes. An in-flight
    /// persistence error becomes this call's failure.
    pub async fn flush(&self) -> Result<()> {
        let mut rx = self.drain_gen.subscribe();
        loop {
            {
                let mut state = self.state.lock().await;
                if !state.drain_in_flight && state.pending_lines.is_empty() {
                    return match state.persist_error.take() {
                        Some(message) => Err(EventStreamError::Persist(message)),
                        None => Ok(()),
                    };
                }
            }
            if rx.changed().await.is_err() {
                // Sender only drops with the stream itself.
                return Ok(());
            }
        }
    }

    fn spawn_drain(&self) {
        let state = Arc::clone(&self.state);
        let log_path = self.log_path.clone();
        let drain_gen = self.drain_gen.clone();
        tokio::spawn(async move {
            loop {
                let lines = {
                    let mut st = state.lock().await;
                    if st.pending_lines.is_empty() {
                        st.drain_in_flight = false;
                        drain_gen.send_modify(|g| *g += 1);
                        return;
                    }
                    std::mem::take(&mut st.pending_lines)
                };

                if let Err(err) = append_lines(&log_path, &lines).await {
                    let mut st = state.lock().await;
                    st.persist_error = Some(err.to_string());
                    st.drain_in_flight = false;
                    drain_gen.send_modify(|g| *g += 1);
                    tracing::error!(error = %err, "event log append failed");
                    return;
                }
            }
        });
    }
}

async fn append_lines(path: &Path, lines: &[String]) -> std::io::Result<()> {
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    let mut buffer = String::with_capacity(lines.iter().map(|l| l.len() + 1).sum());
    for line in lines {
        buffer.push_str(line);
        buffer.push('\n');
    }
    file.write_all(buffer.as_bytes()).await?;
    file.flush().await?;
    Ok(())
}

fn replay(state: &mut StreamState, raw: &str) -> Result<()> {
    for (index, line) in raw.lines().enumerate() {
        let line_no = index + 1;
        if line.trim().is_empty() {
            continue;
        }
        let envelope: EventEnvelope =
            serde_json::from_str(line).map_err(|err| EventStreamError::Replay {
                line: line_no,
                message: err.to_string(),
            })?;
        if envelope.partition_key.trim().is_empty() {
            return Err(EventStreamError::Replay {
                line: line_no,
                message: "missing partition key".into(),
            });
        }
        if envelope.idempotency_key.trim().is_empty() {
            return Err(EventStreamError::Replay {
                line: line_no,
                message: "missing idempotency key".into(),
            });
        }

        let max = state
            .sequences
            .entry(envelope.partition_key.clone())
            .or_insert(0);
        if envelope.sequence > *max {
            *max = envelope.sequence;
        }
        if !state.idempotency.contains_key(&envelope.idempotency_key) {
            state.remember_idempotency(&envelope);
        }
        state.append_to_partition(envelope);
    }
    Ok(())
}

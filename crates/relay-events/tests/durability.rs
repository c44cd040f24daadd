//! Cold-start replay invariants: the on-disk log and snapshot file fully
//! reconstruct the in-memory state.

use relay_events::{
    project, EventStream, EventStreamConfig, SnapshotStore, SnapshotStoreConfig,
};
use relay_types::{EventDraft, EventType};
use serde_json::json;

fn draft(partition: &str, key: &str, payload: serde_json::Value) -> EventDraft {
    EventDraft {
        idempotency_key: key.to_string(),
        partition_key: partition.to_string(),
        parent_event_id: None,
        run_id: partition.to_string(),
        step_id: "1".to_string(),
        agent_id: "implementer".to_string(),
        event_type: EventType::StateDelta,
        payload,
    }
}

#[tokio::test]
async fn replay_reconstructs_every_partition() {
    let tmp = tempfile::TempDir::new().unwrap();
    let path = tmp.path().join("runtime-events-v2.jsonl");

    let before = {
        let stream = EventStream::open(&path, EventStreamConfig::default())
            .await
            .unwrap();
        for run in ["run-a", "run-b"] {
            for i in 0..10 {
                stream
                    .publish(draft(run, &format!("{run}-{i}"), json!({"i": i})))
                    .await
                    .unwrap();
            }
        }
        stream.flush().await.unwrap();
        (
            stream.read_partition("run-a", 0).await,
            stream.read_partition("run-b", 0).await,
        )
    };

    let reopened = EventStream::open(&path, EventStreamConfig::default())
        .await
        .unwrap();
    assert_eq!(reopened.read_partition("run-a", 0).await, before.0);
    assert_eq!(reopened.read_partition("run-b", 0).await, before.1);
    assert_eq!(reopened.latest_offset("run-a").await, 10);
    assert_eq!(reopened.latest_offset("run-b").await, 10);

    // New publishes continue the sequence after replay.
    let next = reopened
        .publish(draft("run-a", "run-a-post", json!({})))
        .await
        .unwrap();
    assert_eq!(next.sequence, 11);
}

#[tokio::test]
async fn projection_pipeline_survives_restart() {
    let tmp = tempfile::TempDir::new().unwrap();
    let events_path = tmp.path().join("runtime-events-v2.jsonl");
    let snapshots_path = tmp.path().join("runtime-snapshots-v2.json");

    {
        let stream = EventStream::open(&events_path, EventStreamConfig::default())
            .await
            .unwrap();
        let store = SnapshotStore::open(&snapshots_path, SnapshotStoreConfig::default())
            .await
            .unwrap();

        for i in 0..5 {
            let envelope = stream
                .publish(draft("run-a", &format!("k-{i}"), json!({"i": i})))
                .await
                .unwrap();
            let previous = store.get("run-a").await;
            let update = project(previous.as_ref(), &envelope);
            store.upsert(update).await.unwrap();
        }
        stream.flush().await.unwrap();
        store.flush().await.unwrap();
    }

    let store = SnapshotStore::open(&snapshots_path, SnapshotStoreConfig::default())
        .await
        .unwrap();
    let snapshot = store.get("run-a").await.unwrap();
    assert_eq!(snapshot.revision, 5);
    assert_eq!(snapshot.applied_offset("run-a"), 5);
    assert_eq!(snapshot.facts.len(), 5);

    // Replaying an already-applied event is a no-op after restart too.
    let stream = EventStream::open(&events_path, EventStreamConfig::default())
        .await
        .unwrap();
    let replayed = stream.read_partition("run-a", 0).await;
    let update = project(Some(&snapshot), &replayed[2]);
    let unchanged = store.upsert(update).await.unwrap();
    assert_eq!(unchanged.revision, 5);
    assert_eq!(unchanged.facts.len(), 5);
}

//! Steady-state behaviour of a bootstrapped engine: offline edits, conflicts,
//! reconciliation triggers, filter changes and metrics.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use cadence_core::entity::{EntityKey, EntityRecord};
use cadence_core::grouping::Filter;
use cadence_core::sync::{
    ConflictRecord, DiffResponse, MutationKind, PatchOutcome, SyncBroadcast, SyncCycleTrigger,
};
use cadence_engine::test_support::{
    wait_until, FakeSyncApi, MemoryPushTransport, PatchReply, RecordingReloader, ScriptedPrompt,
};
use cadence_engine::{ConnectivityFlag, ConnectivityMonitor, SyncEngine};

struct Harness {
    api: Arc<FakeSyncApi>,
    online: Arc<ConnectivityFlag>,
    reloader: Arc<RecordingReloader>,
    engine: SyncEngine,
}

fn harness(online: bool, prompt: Option<ScriptedPrompt>) -> Harness {
    let api = Arc::new(FakeSyncApi::new());
    let online = Arc::new(ConnectivityFlag::new(online));
    let reloader = Arc::new(RecordingReloader::new());
    let mut builder = SyncEngine::builder()
        .api(api.clone())
        .transport(Arc::new(MemoryPushTransport::new()))
        .connectivity(online.clone())
        .reloader(reloader.clone());
    if let Some(prompt) = prompt {
        builder = builder.prompt(Arc::new(prompt));
    }
    Harness {
        api,
        online,
        reloader,
        engine: builder.build().expect("engine"),
    }
}

fn task(id: &str, priority: i32) -> EntityRecord {
    let mut record = EntityRecord::new(EntityKey::task(id));
    record.priority = priority;
    record
}

#[tokio::test]
async fn offline_mutations_drain_once_back_online() {
    let h = harness(false, None);

    let first = h
        .engine
        .enqueue_mutation(
            MutationKind::Create,
            EntityKey::task("t-1"),
            json!({"title": "Draft agenda"}),
        )
        .await
        .expect("create");
    let second = h
        .engine
        .enqueue_mutation(
            MutationKind::Update,
            EntityKey::task("t-1"),
            json!({"priority": 3}),
        )
        .await
        .expect("update");

    assert_eq!(h.engine.store().get(&EntityKey::task("t-1")).map(|t| t.priority), Some(3));
    assert!(h.api.patch_calls().is_empty());
    assert_eq!(h.engine.metrics().pending_mutations, 2);

    assert!(h.engine.on_connectivity_change(false).await.is_none());
    let report = h
        .engine
        .on_connectivity_change(true)
        .await
        .expect("drain on reconnect");

    assert_eq!(report.sent, 2);
    assert!(h.online.is_online());
    let tokens: Vec<String> = h
        .api
        .patch_calls()
        .into_iter()
        .map(|(_, request)| request.idempotency_token)
        .collect();
    assert_eq!(
        tokens,
        vec![first.idempotency_token, second.idempotency_token]
    );
    assert_eq!(h.engine.metrics().pending_mutations, 0);
}

#[tokio::test]
async fn online_mutation_is_sent_in_background() {
    let h = harness(true, None);

    h.engine
        .enqueue_mutation(MutationKind::Create, EntityKey::task("t-9"), json!({}))
        .await
        .expect("create");

    let engine = h.engine.clone();
    assert!(wait_until(Duration::from_secs(1), || engine.queue().is_empty()).await);
    assert_eq!(h.api.patch_calls().len(), 1);
}

#[tokio::test]
async fn description_conflict_auto_resolves() {
    let h = harness(false, None);
    let key = EntityKey::task("t-1");
    h.engine.store().upsert(task("t-1", 2));

    h.engine
        .enqueue_mutation(MutationKind::Update, key.clone(), json!({"description": "mine"}))
        .await
        .expect("update");
    let local = h.engine.store().get(&key).expect("local");
    let mut server = task("t-1", 2);
    server
        .set_field("description", json!("theirs"))
        .expect("field");
    server.etag = Some("v2".to_string());
    h.api
        .push_patch_reply(PatchReply::Outcome(PatchOutcome::Conflict(ConflictRecord {
            entity_key: key.clone(),
            local_version: local,
            server_version: server,
            conflicting_fields: vec!["description".to_string()],
            event_type: "task.updated".to_string(),
        })));

    let mut broadcasts = h.engine.watch_broadcasts();
    let report = h
        .engine
        .on_connectivity_change(true)
        .await
        .expect("drain");

    assert_eq!(report.conflicts, 1);
    let metrics = h.engine.metrics().conflicts;
    assert_eq!(metrics.auto_resolved, 1);
    assert_eq!(metrics.failed, 0);
    let resolved = h.engine.store().get(&key).expect("resolved");
    assert_eq!(resolved.field("description"), Some(json!("theirs")));
    assert_eq!(resolved.etag.as_deref(), Some("v2"));
    assert!(matches!(
        broadcasts.try_recv(),
        Ok(SyncBroadcast::ConflictResolved { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn unanswered_prompt_fails_without_mutation() {
    let h = harness(false, Some(ScriptedPrompt::silent()));
    let key = EntityKey::task("t-1");
    h.engine.store().upsert(task("t-1", 1));

    h.engine
        .enqueue_mutation(MutationKind::Update, key.clone(), json!({"priority": 5}))
        .await
        .expect("update");
    let local = h.engine.store().get(&key).expect("local");
    h.api
        .push_patch_reply(PatchReply::Outcome(PatchOutcome::Conflict(ConflictRecord {
            entity_key: key.clone(),
            local_version: local.clone(),
            server_version: task("t-1", 8),
            conflicting_fields: vec!["priority".to_string()],
            event_type: "task.updated".to_string(),
        })));

    let started = tokio::time::Instant::now();
    let report = h
        .engine
        .on_connectivity_change(true)
        .await
        .expect("drain");

    assert!(started.elapsed() >= Duration::from_secs(30));
    assert_eq!(report.conflicts, 1);
    let metrics = h.engine.metrics().conflicts;
    assert_eq!(metrics.failed, 1);
    assert_eq!(metrics.auto_resolved, 0);
    assert_eq!(h.engine.store().get(&key), Some(local));

    let after = h.engine.metrics();
    assert_eq!(after.pending_mutations, 1);
    assert_eq!(after.unresolved_conflicts, 1);
    assert_eq!(after.dead_letters, 0);
}

#[tokio::test]
async fn foreground_reconciles_drifted_resource() {
    let h = harness(true, None);
    h.api.set_header("sessions", "A", 1);
    h.api.set_header("tasks", "T", 1);
    h.engine.bootstrap().await;
    h.engine.reconciliation().seed_token("tasks", Some("T".to_string()));

    h.api.set_header("sessions", "B", 2);
    h.api.set_default_diff(
        "sessions",
        DiffResponse {
            upserts: vec![EntityRecord::new(EntityKey::session("s-new"))],
            last_event_id: 2,
            ..DiffResponse::default()
        },
    );
    let mut broadcasts = h.engine.watch_broadcasts();

    assert!(h.engine.on_visibility_change(false).await.is_none());
    let report = h
        .engine
        .on_visibility_change(true)
        .await
        .expect("foreground reconcile");

    assert_eq!(report.trigger, SyncCycleTrigger::Foreground);
    assert_eq!(report.changed, vec!["sessions".to_string()]);
    assert_eq!(report.unchanged, vec!["tasks".to_string()]);
    assert!(h.engine.store().contains(&EntityKey::session("s-new")));
    assert_eq!(h.reloader.reloaded(), vec!["sessions".to_string()]);
    assert_eq!(
        broadcasts.try_recv().ok(),
        Some(SyncBroadcast::ResourceChanged {
            resource: "sessions".to_string(),
            etag: Some("B".to_string()),
        })
    );
    h.engine.shutdown().await;
}

#[tokio::test]
async fn task_drift_is_reflected_in_next_paint() {
    let h = harness(true, None);
    h.api.set_header("sessions", "A", 1);
    h.api.set_header("tasks", "T", 1);
    h.engine.store().upsert(task("t-gone", 1));
    h.engine.bootstrap().await;
    let painted = h.engine.cache().read_snapshot("sessions").expect("snapshot");
    assert!(painted
        .entities
        .iter()
        .any(|e| e.key == EntityKey::task("t-gone")));

    let report = h.engine.trigger_reconciliation().await;
    assert_eq!(report.changed, vec!["tasks".to_string()]);
    assert!(!h.engine.store().contains(&EntityKey::task("t-gone")));

    let repainted = h.engine.cache().read_snapshot("sessions").expect("snapshot");
    assert!(!repainted
        .entities
        .iter()
        .any(|e| e.key == EntityKey::task("t-gone")));
    h.engine.shutdown().await;
}

#[tokio::test]
async fn held_action_lease_skips_reconciliation() {
    let h = harness(true, None);

    let lease = h.engine.acquire_action_lease("title-editor");
    let skipped = h.engine.trigger_reconciliation().await;
    assert!(skipped.skipped);
    assert!(h.api.probe_calls().is_empty());

    lease.release();
    let ran = h.engine.trigger_reconciliation().await;
    assert!(!ran.skipped);
    assert_eq!(ran.trigger, SyncCycleTrigger::Manual);
    assert_eq!(h.api.probe_calls().len(), 2);
    assert_eq!(h.engine.metrics().reconcile.skipped, 1);
}

#[tokio::test]
async fn filter_change_refetches_for_new_context() {
    let h = harness(true, None);
    let filter = Filter {
        show_archived: true,
        ..Filter::default()
    };

    h.engine.set_filter(filter).await.expect("filter");

    assert_eq!(h.engine.store().filter(), filter);
    let calls = h.api.diff_calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].1.filter, Some(filter));
    assert_eq!(calls[0].1.last_event_id, 0);
}

#[tokio::test]
async fn metrics_serialize_for_diagnostics() {
    let h = harness(false, None);
    h.engine
        .enqueue_mutation(MutationKind::Create, EntityKey::task("t-1"), json!({}))
        .await
        .expect("create");

    let value = serde_json::to_value(h.engine.metrics()).expect("metrics json");
    assert_eq!(value["pendingMutations"], json!(1));
    assert_eq!(value["entities"], json!(1));
    assert_eq!(value["channelState"], json!("disconnected"));
    assert!(value["lastBootstrap"].is_null());
}

//! End-to-end scenarios through the composed storage service.

use std::sync::Arc;
use std::time::Duration;

use kyrokv::legacy::{default_layout, MemoryLegacyStore};
use kyrokv::storage::{Fault, MemoryBackend};
use kyrokv::{
    CompactionPolicy, CompactionReason, ConnectionConfig, GuardConfig, LifecycleEvent, MigrationStatus, Node,
    SerializationError, StorageConfig, StorageService, Value, DEFAULT_PARTITIONS,
};

fn config() -> StorageConfig {
    let mut partitions: Vec<String> = DEFAULT_PARTITIONS.iter().map(|p| (*p).to_string()).collect();
    partitions.extend(["list".to_string(), "notes".to_string()]);

    StorageConfig {
        connection: ConnectionConfig {
            partitions,
            retry_backoff_ms: 5,
            ..ConnectionConfig::default()
        },
        guard: GuardConfig::default()
            .with_policy(
                "list",
                CompactionPolicy {
                    max_bytes: 256 * 1024,
                    ..CompactionPolicy::default()
                },
            )
            .with_policy(
                "messages",
                CompactionPolicy {
                    retain_last: Some(50),
                    ..CompactionPolicy::default()
                },
            ),
        ..StorageConfig::default()
    }
}

async fn start(backend: &MemoryBackend) -> StorageService {
    StorageService::builder(Arc::new(backend.clone()))
        .config(config())
        .start()
        .await
        .unwrap()
}

fn chat_entry(i: i64) -> Node {
    Node::object([
        ("id", Node::from(i)),
        ("name", Node::from(format!("chat {i}"))),
        ("avatar", Node::from(format!("data:image/png;base64,{}", "Q".repeat(1024)))),
    ])
}

#[tokio::test]
async fn scenario_set_then_get() {
    let backend = MemoryBackend::new();
    let service = start(&backend).await;

    service.store().set("settings", "theme", "dark").await.unwrap();
    assert_eq!(
        service.store().get("settings", "theme").await.unwrap(),
        Some(Value::from("dark"))
    );
}

#[tokio::test]
async fn scenario_oversized_list_is_compacted() {
    let backend = MemoryBackend::new();
    let service = start(&backend).await;

    let chats = Node::array((0..500).map(chat_entry).collect());
    let report = service.store().set("list", "chats", chats).await.unwrap();

    let compaction = report.compaction.unwrap();
    assert_eq!(compaction.reason, CompactionReason::SizeCeiling);
    assert_eq!(compaction.original_len, 500);

    let stored = service.store().get("list", "chats").await.unwrap().unwrap();
    let items = stored.as_array().unwrap();
    assert!(items.len() <= 300);
    // Most recent entries are the ones kept.
    assert_eq!(items.last().unwrap().get("id"), Some(&Value::from(499)));
    assert_eq!(items[0].get("avatar"), Some(&Value::from("[blob removed]")));
}

#[tokio::test]
async fn scenario_concurrent_opens_connect_once() {
    let backend = MemoryBackend::new();
    let service = start(&backend).await;
    let connection = service.connection().clone();
    let mut events = connection.subscribe();

    let (a, b) = tokio::join!(connection.open(), connection.open());
    assert_eq!(a.unwrap().id(), b.unwrap().id());

    let mut opened = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, LifecycleEvent::Opened { .. }) {
            opened += 1;
        }
    }
    assert_eq!(opened, 1);
    assert_eq!(connection.connections_created(), 1);
    assert_eq!(backend.stats().connect_calls, 1);
}

#[tokio::test]
async fn scenario_legacy_migration_then_rerun() {
    let backend = MemoryBackend::new();
    let legacy = Arc::new(MemoryLegacyStore::new());
    legacy.insert("messages_42", r#"[{"id":1,"content":"hello"},{"id":2,"content":"hi"}]"#);

    let service = StorageService::builder(Arc::new(backend.clone()))
        .config(config())
        .legacy(legacy.clone(), default_layout())
        .start()
        .await
        .unwrap();

    let result = service.migration().unwrap();
    assert_eq!(result.status, MigrationStatus::Completed);
    assert_eq!(result.migrated, 1);

    let messages = service.store().get("messages", "42").await.unwrap().unwrap();
    assert_eq!(messages.as_array().unwrap().len(), 2);
    assert_eq!(
        service.store().get("settings", "__migration_version").await.unwrap(),
        Some(Value::from("1.0"))
    );

    // A second start on the same store finds the marker and writes nothing.
    let commits = backend.stats().commits;
    service.close();
    let again = StorageService::builder(Arc::new(backend.clone()))
        .config(config())
        .legacy(legacy, default_layout())
        .start()
        .await
        .unwrap();
    assert_eq!(again.migration().unwrap().status, MigrationStatus::AlreadyCurrent);
    assert_eq!(backend.stats().commits, commits);
    assert_eq!(
        again.store().get("settings", "__migration_version").await.unwrap(),
        Some(Value::from("1.0"))
    );
}

#[tokio::test]
async fn scenario_self_reference_is_omitted() {
    let backend = MemoryBackend::new();
    let service = start(&backend).await;

    let note = Node::object([("title", Node::from("n1")), ("body", Node::from("text"))]);
    note.object_handle().unwrap().write().insert("self".to_string(), note.clone());

    let report = service.store().set("notes", "n1", note).await.unwrap();
    assert_eq!(report.omissions.len(), 1);
    assert!(matches!(report.omissions[0], SerializationError::CyclicReference { .. }));

    let stored = service.store().get("notes", "n1").await.unwrap().unwrap();
    assert_eq!(stored.get("title"), Some(&Value::from("n1")));
    assert_eq!(stored.get("body"), Some(&Value::from("text")));
    assert_eq!(stored.get("self"), None);
}

#[tokio::test]
async fn round_trip_of_json_shapes() {
    let backend = MemoryBackend::new();
    let service = start(&backend).await;
    let store = service.store();

    let values = [
        serde_json::json!(null),
        serde_json::json!(true),
        serde_json::json!(-17),
        serde_json::json!(2.5),
        serde_json::json!("emoji 🎉"),
        serde_json::json!([1, "two", [3.0], {"four": 4}]),
        serde_json::json!({"nested": {"list": [], "map": {}}, "n": null}),
    ];
    for (i, json) in values.into_iter().enumerate() {
        let value = Value::from(json);
        let key = format!("v{i}");
        store.set("misc", &key, value.clone()).await.unwrap();
        assert_eq!(store.get("misc", &key).await.unwrap(), Some(value));
    }
}

#[tokio::test]
async fn retained_arrays_stay_within_bound() {
    let backend = MemoryBackend::new();
    let service = start(&backend).await;

    let items = Node::array((0..120).map(Node::from).collect());
    service.store().set("messages", "chat_1", items).await.unwrap();

    let stored = service.store().get("messages", "chat_1").await.unwrap().unwrap();
    let stored = stored.as_array().unwrap();
    assert_eq!(stored.len(), 50);
    assert_eq!(stored[0], Value::from(70));
}

#[tokio::test]
async fn blocked_then_successful_write_keeps_cache_consistent() {
    let backend = MemoryBackend::new();
    backend.inject(Fault::Blocked);
    backend.inject(Fault::Blocked);
    let service = start(&backend).await;

    service.store().set("settings", "theme", "dark").await.unwrap();

    let stored = service.store().get("settings", "theme").await.unwrap();
    assert_eq!(stored, Some(Value::from("dark")));
    assert_eq!(service.reader().get_sync("settings", "theme"), Value::from("dark"));
    assert_eq!(backend.stats().connect_calls, 3);
}

#[tokio::test]
async fn get_sync_sees_write_immediately() {
    let backend = MemoryBackend::new();
    let service = start(&backend).await;

    assert_eq!(service.reader().get_sync("settings", "chatList"), Value::Null);
    service
        .store()
        .set("settings", "chatList", Value::Array(vec![Value::from("c1")]))
        .await
        .unwrap();
    assert_eq!(service.reader().get_sync_items("settings", "chatList"), vec![Value::from("c1")]);
}

#[tokio::test]
async fn get_sync_sees_write_before_commit_resolves() {
    let backend = MemoryBackend::new();
    let service = start(&backend).await;
    service.store().set("settings", "theme", "light").await.unwrap();

    backend.inject(Fault::SlowCommit(Duration::from_millis(100)));
    let store = service.store().clone();
    let write = tokio::spawn(async move { store.set("settings", "theme", "dark").await });
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert!(!write.is_finished());
    assert!(service.store().cache().is_pending("settings", "theme"));
    assert_eq!(service.reader().get_sync("settings", "theme"), Value::from("dark"));

    write.await.unwrap().unwrap();
    assert!(!service.store().cache().is_pending("settings", "theme"));
    assert_eq!(service.reader().get_sync("settings", "theme"), Value::from("dark"));
}

#[tokio::test]
async fn read_during_retried_write_does_not_resurrect_old_value() {
    let backend = MemoryBackend::new();
    let service = start(&backend).await;
    service.store().set("settings", "theme", "light").await.unwrap();

    // The first commit loses its connection; the retry is slow.
    backend.inject(Fault::DropConnection);
    backend.inject(Fault::SlowCommit(Duration::from_millis(100)));
    let store = service.store().clone();
    let write = tokio::spawn(async move { store.set("settings", "theme", "dark").await });
    tokio::time::sleep(Duration::from_millis(20)).await;

    // The store still holds the old value; the staged one must survive the read.
    let during = service.reader().get("settings", "theme").await;
    assert_eq!(during, Value::from("light"));
    assert_eq!(service.reader().get_sync("settings", "theme"), Value::from("dark"));

    write.await.unwrap().unwrap();
    assert_eq!(service.reader().get_sync("settings", "theme"), Value::from("dark"));
    assert_eq!(service.reader().get("settings", "theme").await, Value::from("dark"));
    assert_eq!(backend.stats().connect_calls, 2);
}

//! End-to-end ingestion: decoded firehose frames through the batch flusher
//! into SQLite.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{Value, json};
use tempfile::TempDir;

use collector::error::Result;
use collector::models::{Config, Counter, Edge, Entity, EntityKind, PipelineStats, User};
use collector::pipeline::{BatchFlusher, StreamConsumer};
use collector::services::{EventSource, MessageStream};
use collector::storage::{EntityStore, FileCheckpointStore, SqliteStore};

/// Never used to connect; frames are fed through `handle`.
struct Idle;

#[async_trait]
impl EventSource for Idle {
    async fn connect(&self, _cursor: Option<i64>) -> Result<MessageStream> {
        Ok(futures::stream::empty().boxed())
    }
}

fn commit(did: &str, time_us: i64, collection: &str, rkey: &str, record: Value) -> String {
    json!({
        "did": did,
        "time_us": time_us,
        "kind": "commit",
        "commit": {
            "rev": "3l",
            "operation": "create",
            "collection": collection,
            "rkey": rkey,
            "record": record,
            "cid": format!("bafy{rkey}")
        }
    })
    .to_string()
}

fn delete(did: &str, time_us: i64, collection: &str, rkey: &str) -> String {
    json!({
        "did": did,
        "time_us": time_us,
        "kind": "commit",
        "commit": {"operation": "delete", "collection": collection, "rkey": rkey}
    })
    .to_string()
}

fn frames() -> Vec<String> {
    let carol_post = "at://did:plc:carol/app.bsky.feed.post/p1";
    vec![
        commit(
            "did:plc:alice",
            100,
            "app.bsky.actor.profile",
            "self",
            json!({"displayName": "Alice", "description": "hi"}),
        ),
        commit(
            "did:plc:alice",
            101,
            "app.bsky.graph.follow",
            "f1",
            json!({"subject": "did:plc:bob", "createdAt": "2024-01-01T00:00:00Z"}),
        ),
        commit(
            "did:plc:carol",
            102,
            "app.bsky.feed.post",
            "p1",
            json!({
                "text": "replying",
                "createdAt": "2024-01-01T00:00:01Z",
                "langs": ["en"],
                "reply": {
                    "parent": {"uri": "at://did:plc:bob/app.bsky.feed.post/p0", "cid": "a"},
                    "root": {"uri": "at://did:plc:bob/app.bsky.feed.post/p0", "cid": "a"}
                }
            }),
        ),
        commit(
            "did:plc:dave",
            103,
            "app.bsky.feed.like",
            "l1",
            json!({"subject": {"uri": carol_post, "cid": "bafyp1"}, "createdAt": "2024-01-01T00:00:02Z"}),
        ),
        commit(
            "did:plc:erin",
            104,
            "app.bsky.feed.like",
            "l2",
            json!({"subject": {"uri": carol_post, "cid": "bafyp1"}}),
        ),
        delete("did:plc:erin", 105, "app.bsky.feed.like", "l2"),
        "not json at all".to_string(),
    ]
}

struct Pipeline {
    _dir: TempDir,
    store: Arc<SqliteStore>,
    flusher: Arc<BatchFlusher>,
    consumer: StreamConsumer,
}

fn pipeline() -> Pipeline {
    let dir = TempDir::new().unwrap();
    let config = Config::default();
    let store = Arc::new(SqliteStore::open(dir.path().join("collector.db")).unwrap());
    let flusher = Arc::new(BatchFlusher::new(
        store.clone(),
        &config,
        Arc::new(PipelineStats::new()),
    ));
    let checkpoints = Arc::new(FileCheckpointStore::new(dir.path().join("checkpoint.json")));
    let consumer = StreamConsumer::new(Arc::new(Idle), flusher.clone(), checkpoints, &config);
    Pipeline {
        _dir: dir,
        store,
        flusher,
        consumer,
    }
}

#[tokio::test]
async fn test_replaying_frames_is_idempotent() {
    let p = pipeline();

    for frame in frames() {
        p.consumer.handle(&frame).await;
    }
    p.flusher.flush_all().await;
    let first = p.store.snapshot().await.unwrap();

    for frame in frames() {
        p.consumer.handle(&frame).await;
    }
    p.flusher.flush_all().await;
    let second = p.store.snapshot().await.unwrap();

    assert_eq!(first, second);
    assert_eq!(first.edges.len(), 1);
    assert_eq!(first.content.len(), 1);
    assert_eq!(first.interactions.len(), 1);
    assert_eq!(first.interactions[0].actor, "did:plc:dave");

    let alice = p.store.get_user("did:plc:alice").await.unwrap().unwrap();
    assert_eq!(alice.display_name.as_deref(), Some("Alice"));
    // Every referenced account exists, including reply targets.
    for did in ["did:plc:bob", "did:plc:carol", "did:plc:dave", "did:plc:erin"] {
        assert!(p.store.get_user(did).await.unwrap().is_some(), "{did} missing");
    }

    let stats = p.flusher.stats();
    assert_eq!(stats.get(Counter::DecodeErrors), 2);
    assert_eq!(stats.get(Counter::EventsProcessed), 12);
    assert_eq!(stats.get(Counter::FlushErrors), 0);
}

#[tokio::test]
async fn test_dependent_before_owner_still_lands() {
    let p = pipeline();
    let edge = Edge {
        source: "did:plc:x".into(),
        target: "did:plc:y".into(),
        uri: Some("at://did:plc:x/app.bsky.graph.follow/f".into()),
        created_at: None,
        indexed_at: 10,
    };
    p.flusher.enqueue(Entity::Edge(edge));
    let summary = p.flusher.flush(EntityKind::Edge).await;
    assert_eq!(summary.written, 1);
    assert_eq!(summary.dropped, 0);
    assert_eq!(p.flusher.stats().get(Counter::ReferentialRetries), 1);

    // The full profile arriving later fills in the placeholder.
    p.flusher.enqueue(Entity::User(User {
        handle: Some("x.example".into()),
        followers_count: Some(42),
        ..User::placeholder("did:plc:x", 20)
    }));
    p.flusher.flush_all().await;

    let x = p.store.get_user("did:plc:x").await.unwrap().unwrap();
    assert_eq!(x.handle.as_deref(), Some("x.example"));
    assert_eq!(x.followers_count, Some(42));
    assert!(p.store.get_edge("did:plc:x", "did:plc:y").await.unwrap().is_some());
    assert_eq!(p.store.count(EntityKind::User).await.unwrap(), 2);
}

#[tokio::test]
async fn test_owner_before_dependent_needs_no_retry() {
    let p = pipeline();
    p.flusher
        .enqueue(Entity::User(User::placeholder("did:plc:x", 1)));
    p.flusher
        .enqueue(Entity::User(User::placeholder("did:plc:y", 1)));
    p.flusher.flush_all().await;

    p.flusher.enqueue(Entity::Edge(Edge {
        source: "did:plc:x".into(),
        target: "did:plc:y".into(),
        uri: None,
        created_at: None,
        indexed_at: 2,
    }));
    p.flusher.flush_all().await;

    assert_eq!(p.flusher.stats().get(Counter::ReferentialRetries), 0);
    assert_eq!(p.store.count(EntityKind::Edge).await.unwrap(), 1);
}

// src/models/event.rs

//! Firehose message decoding.
//!
//! Inbound messages are loosely typed JSON. [`decode`] turns each one into a
//! [`Decoded`] value: a typed [`EventEnvelope`], an ignored non-commit
//! message, or a decode failure. Nothing downstream touches raw JSON.

use serde::Deserialize;
use serde_json::Value;

use super::entity::{
    Content, Edge, Entity, EntityKind, Interaction, InteractionKind, User, did_from_uri,
    record_uri,
};

/// Commit operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

/// Record collections the collector understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    Profile,
    Follow,
    Post,
    Like,
    Repost,
}

impl Collection {
    pub const ALL: [Collection; 5] = [
        Collection::Profile,
        Collection::Follow,
        Collection::Post,
        Collection::Like,
        Collection::Repost,
    ];

    pub fn nsid(&self) -> &'static str {
        match self {
            Collection::Profile => "app.bsky.actor.profile",
            Collection::Follow => "app.bsky.graph.follow",
            Collection::Post => "app.bsky.feed.post",
            Collection::Like => "app.bsky.feed.like",
            Collection::Repost => "app.bsky.feed.repost",
        }
    }

    pub fn from_nsid(nsid: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.nsid() == nsid)
    }

    pub fn entity_kind(&self) -> EntityKind {
        match self {
            Collection::Profile => EntityKind::User,
            Collection::Follow => EntityKind::Edge,
            Collection::Post => EntityKind::Content,
            Collection::Like | Collection::Repost => EntityKind::Interaction,
        }
    }
}

// --- Wire format ---

#[derive(Debug, Deserialize)]
struct RawMessage {
    did: String,
    time_us: i64,
    kind: String,
    #[serde(default)]
    commit: Option<RawCommit>,
}

#[derive(Debug, Deserialize)]
struct RawCommit {
    operation: Operation,
    collection: String,
    rkey: String,
    #[serde(default)]
    record: Option<Value>,
    #[serde(default)]
    cid: Option<String>,
}

// --- Typed records ---

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StrongRef {
    pub uri: String,
    #[serde(default)]
    pub cid: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ReplyRef {
    pub parent: StrongRef,
    pub root: StrongRef,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileRecord {
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub avatar: Option<Value>,
}

impl ProfileRecord {
    /// CID of the avatar blob, if one is set.
    pub fn avatar_cid(&self) -> Option<String> {
        self.avatar
            .as_ref()?
            .get("ref")?
            .get("$link")?
            .as_str()
            .map(str::to_string)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FollowRecord {
    pub subject: String,
    #[serde(default)]
    pub created_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostRecord {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub reply: Option<ReplyRef>,
    #[serde(default)]
    pub langs: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectRecord {
    pub subject: StrongRef,
    #[serde(default)]
    pub created_at: Option<String>,
}

/// Typed record payload, one variant per collection.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Profile(ProfileRecord),
    Follow(FollowRecord),
    Post(PostRecord),
    Like(SubjectRecord),
    Repost(SubjectRecord),
}

impl Record {
    fn decode(collection: Collection, value: Value) -> Result<Self, serde_json::Error> {
        Ok(match collection {
            Collection::Profile => Record::Profile(serde_json::from_value(value)?),
            Collection::Follow => Record::Follow(serde_json::from_value(value)?),
            Collection::Post => Record::Post(serde_json::from_value(value)?),
            Collection::Like => Record::Like(serde_json::from_value(value)?),
            Collection::Repost => Record::Repost(serde_json::from_value(value)?),
        })
    }
}

/// A decoded commit event.
#[derive(Debug, Clone, PartialEq)]
pub struct EventEnvelope {
    pub subject_id: String,
    pub cursor: i64,
    pub operation: Operation,
    pub collection: Collection,
    pub record_key: String,
    /// `None` for deletes.
    pub record: Option<Record>,
    pub content_hash: Option<String>,
}

/// A queue-level write derived from an event.
#[derive(Debug, Clone, PartialEq)]
pub enum PendingWrite {
    Upsert(Entity),
    Delete { kind: EntityKind, uri: String },
}

impl EventEnvelope {
    pub fn uri(&self) -> String {
        record_uri(&self.subject_id, self.collection.nsid(), &self.record_key)
    }

    /// Translate the event into queue writes.
    ///
    /// Creates and updates also yield a placeholder user for every DID the
    /// record references, so owners can be flushed ahead of dependents.
    pub fn to_writes(&self) -> Vec<PendingWrite> {
        let kind = self.collection.entity_kind();
        let record = match (self.operation, &self.record) {
            (Operation::Delete, _) => {
                // Profile deletes keep the account row; everything else is
                // removed by record URI.
                if kind == EntityKind::User {
                    return Vec::new();
                }
                return vec![PendingWrite::Delete {
                    kind,
                    uri: self.uri(),
                }];
            }
            (_, Some(record)) => record,
            (_, None) => return Vec::new(),
        };

        let entity = self.entity_for(record);
        let mut writes: Vec<PendingWrite> = entity
            .owner_dids()
            .into_iter()
            .map(|did| PendingWrite::Upsert(Entity::User(User::placeholder(did, self.cursor))))
            .collect();
        writes.push(PendingWrite::Upsert(entity));
        writes
    }

    fn entity_for(&self, record: &Record) -> Entity {
        let did = self.subject_id.clone();
        let indexed_at = self.cursor;
        match record {
            Record::Profile(p) => Entity::User(User {
                display_name: p.display_name.clone(),
                description: p.description.clone(),
                avatar: p.avatar_cid(),
                ..User::placeholder(did, indexed_at)
            }),
            Record::Follow(f) => Entity::Edge(Edge {
                source: did,
                target: f.subject.clone(),
                uri: Some(self.uri()),
                created_at: f.created_at.clone(),
                indexed_at,
            }),
            Record::Post(p) => Entity::Content(Content {
                uri: self.uri(),
                author: did,
                cid: self.content_hash.clone(),
                text: p.text.clone(),
                created_at: p.created_at.clone(),
                reply_parent: p.reply.as_ref().map(|r| r.parent.uri.clone()),
                reply_root: p.reply.as_ref().map(|r| r.root.uri.clone()),
                langs: p.langs.clone().unwrap_or_default(),
                indexed_at,
            }),
            Record::Like(s) | Record::Repost(s) => Entity::Interaction(Interaction {
                uri: self.uri(),
                actor: did,
                kind: if matches!(record, Record::Like(_)) {
                    InteractionKind::Like
                } else {
                    InteractionKind::Repost
                },
                subject_uri: s.subject.uri.clone(),
                subject_cid: s.subject.cid.clone(),
                created_at: s.created_at.clone(),
                indexed_at,
            }),
        }
    }
}

/// Why a message could not be decoded.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodeFailure {
    pub reason: String,
    /// Cursor of the message when it was readable far enough to tell.
    pub cursor: Option<i64>,
}

/// Result of decoding one firehose message.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Commit(EventEnvelope),
    /// Identity/account messages; carry a cursor but no record.
    Ignored { kind: String, cursor: i64 },
    Error(DecodeFailure),
}

/// Decode one firehose text frame.
pub fn decode(text: &str) -> Decoded {
    let raw: RawMessage = match serde_json::from_str(text) {
        Ok(raw) => raw,
        Err(e) => {
            return Decoded::Error(DecodeFailure {
                reason: format!("malformed message: {e}"),
                cursor: None,
            });
        }
    };

    let fail = |reason: String| {
        Decoded::Error(DecodeFailure {
            reason,
            cursor: Some(raw.time_us),
        })
    };

    if raw.kind != "commit" {
        return Decoded::Ignored {
            kind: raw.kind,
            cursor: raw.time_us,
        };
    }
    let Some(commit) = raw.commit else {
        return fail("commit message without commit body".to_string());
    };
    if !raw.did.starts_with("did:") {
        return fail(format!("invalid repository DID '{}'", raw.did));
    }
    let Some(collection) = Collection::from_nsid(&commit.collection) else {
        return fail(format!("unknown collection '{}'", commit.collection));
    };

    let record = match commit.operation {
        Operation::Delete => None,
        Operation::Create | Operation::Update => {
            let Some(value) = commit.record else {
                return fail(format!(
                    "{:?} of {} without record",
                    commit.operation, commit.collection
                ));
            };
            match Record::decode(collection, value) {
                Ok(record) => Some(record),
                Err(e) => return fail(format!("invalid {} record: {e}", commit.collection)),
            }
        }
    };

    if let Some(Record::Follow(f)) = &record {
        if !f.subject.starts_with("did:") {
            return fail(format!("follow subject '{}' is not a DID", f.subject));
        }
    }
    if let Some(Record::Like(s) | Record::Repost(s)) = &record {
        if did_from_uri(&s.subject.uri).is_none() {
            return fail(format!("subject '{}' is not an AT-URI", s.subject.uri));
        }
    }

    Decoded::Commit(EventEnvelope {
        subject_id: raw.did,
        cursor: raw.time_us,
        operation: commit.operation,
        collection,
        record_key: commit.rkey,
        record,
        content_hash: commit.cid,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn commit_json(collection: &str, operation: &str, record: Value) -> String {
        serde_json::json!({
            "did": "did:plc:alice",
            "time_us": 1_700_000_000_000_000i64,
            "kind": "commit",
            "commit": {
                "rev": "3l",
                "operation": operation,
                "collection": collection,
                "rkey": "3kabc",
                "record": record,
                "cid": "bafyrei"
            }
        })
        .to_string()
    }

    #[test]
    fn test_decode_post_create() {
        let text = commit_json(
            "app.bsky.feed.post",
            "create",
            serde_json::json!({
                "$type": "app.bsky.feed.post",
                "text": "hello",
                "createdAt": "2024-01-01T00:00:00Z",
                "langs": ["en"],
                "reply": {
                    "parent": {"uri": "at://did:plc:bob/app.bsky.feed.post/1", "cid": "x"},
                    "root": {"uri": "at://did:plc:carol/app.bsky.feed.post/0", "cid": "y"}
                }
            }),
        );

        let Decoded::Commit(envelope) = decode(&text) else {
            panic!("expected commit");
        };
        assert_eq!(envelope.collection, Collection::Post);
        assert_eq!(envelope.uri(), "at://did:plc:alice/app.bsky.feed.post/3kabc");

        let writes = envelope.to_writes();
        let owners: Vec<_> = writes
            .iter()
            .filter_map(|w| match w {
                PendingWrite::Upsert(Entity::User(u)) => Some(u.did.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(owners, vec!["did:plc:alice", "did:plc:bob", "did:plc:carol"]);
        assert!(matches!(
            writes.last(),
            Some(PendingWrite::Upsert(Entity::Content(c))) if c.text == "hello"
        ));
    }

    #[test]
    fn test_decode_follow_synthesizes_both_users() {
        let text = commit_json(
            "app.bsky.graph.follow",
            "create",
            serde_json::json!({"subject": "did:plc:bob", "createdAt": "2024-01-01T00:00:00Z"}),
        );
        let Decoded::Commit(envelope) = decode(&text) else {
            panic!("expected commit");
        };
        let writes = envelope.to_writes();
        assert_eq!(writes.len(), 3);
    }

    #[test]
    fn test_decode_delete_yields_tombstone() {
        let text = serde_json::json!({
            "did": "did:plc:alice",
            "time_us": 5,
            "kind": "commit",
            "commit": {"operation": "delete", "collection": "app.bsky.feed.like", "rkey": "r1"}
        })
        .to_string();
        let Decoded::Commit(envelope) = decode(&text) else {
            panic!("expected commit");
        };
        assert_eq!(
            envelope.to_writes(),
            vec![PendingWrite::Delete {
                kind: EntityKind::Interaction,
                uri: "at://did:plc:alice/app.bsky.feed.like/r1".into()
            }]
        );
    }

    #[test]
    fn test_decode_identity_is_ignored() {
        let text = r#"{"did":"did:plc:alice","time_us":7,"kind":"identity","identity":{}}"#;
        assert_eq!(
            decode(text),
            Decoded::Ignored {
                kind: "identity".into(),
                cursor: 7
            }
        );
    }

    #[test]
    fn test_decode_errors_never_panic() {
        assert!(matches!(decode("not json"), Decoded::Error(_)));

        let unknown = commit_json("app.example.thing", "create", serde_json::json!({}));
        assert!(matches!(decode(&unknown), Decoded::Error(f) if f.cursor.is_some()));

        let missing_subject =
            commit_json("app.bsky.feed.like", "create", serde_json::json!({"createdAt": "x"}));
        assert!(matches!(decode(&missing_subject), Decoded::Error(_)));

        let bad_follow =
            commit_json("app.bsky.graph.follow", "create", serde_json::json!({"subject": "bob"}));
        assert!(matches!(decode(&bad_follow), Decoded::Error(_)));
    }

    #[test]
    fn test_profile_avatar_cid() {
        let text = commit_json(
            "app.bsky.actor.profile",
            "update",
            serde_json::json!({
                "displayName": "Alice",
                "avatar": {"$type": "blob", "ref": {"$link": "bafkavatar"}, "mimeType": "image/jpeg"}
            }),
        );
        let Decoded::Commit(envelope) = decode(&text) else {
            panic!("expected commit");
        };
        let writes = envelope.to_writes();
        assert!(matches!(
            writes.as_slice(),
            [PendingWrite::Upsert(Entity::User(u))]
                if u.avatar.as_deref() == Some("bafkavatar") && u.display_name.as_deref() == Some("Alice")
        ));
    }
}

// src/models/entity.rs

//! Normalized entities written to the relational store.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Entity variant, listed in flush order (owners before dependents).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    User,
    Edge,
    Content,
    Interaction,
}

impl EntityKind {
    /// All variants in the order they must be flushed.
    pub const FLUSH_ORDER: [EntityKind; 4] = [
        EntityKind::User,
        EntityKind::Edge,
        EntityKind::Content,
        EntityKind::Interaction,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::User => "user",
            EntityKind::Edge => "edge",
            EntityKind::Content => "content",
            EntityKind::Interaction => "interaction",
        }
    }

    /// Whether rows of this kind reference user rows.
    pub fn is_dependent(&self) -> bool {
        !matches!(self, EntityKind::User)
    }

    pub(crate) fn index(&self) -> usize {
        match self {
            EntityKind::User => 0,
            EntityKind::Edge => 1,
            EntityKind::Content => 2,
            EntityKind::Interaction => 3,
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Natural key of an entity; unique within a store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NaturalKey {
    Did(String),
    Pair(String, String),
    Uri(String),
}

/// A user account. A user with nothing but a DID is a placeholder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub did: String,
    #[serde(default)]
    pub handle: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub avatar: Option<String>,
    #[serde(default)]
    pub followers_count: Option<i64>,
    #[serde(default)]
    pub follows_count: Option<i64>,
    #[serde(default)]
    pub posts_count: Option<i64>,
    pub indexed_at: i64,
}

impl User {
    /// Minimal owner record used to satisfy foreign keys.
    pub fn placeholder(did: impl Into<String>, indexed_at: i64) -> Self {
        Self {
            did: did.into(),
            handle: None,
            display_name: None,
            description: None,
            avatar: None,
            followers_count: None,
            follows_count: None,
            posts_count: None,
            indexed_at,
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.handle.is_none()
            && self.display_name.is_none()
            && self.description.is_none()
            && self.avatar.is_none()
            && self.followers_count.is_none()
            && self.follows_count.is_none()
            && self.posts_count.is_none()
    }

    /// Merge a newer record into this one. Known fields are never erased by
    /// missing ones.
    pub fn merge(&mut self, newer: User) {
        fn take<T>(slot: &mut Option<T>, value: Option<T>) {
            if value.is_some() {
                *slot = value;
            }
        }
        take(&mut self.handle, newer.handle);
        take(&mut self.display_name, newer.display_name);
        take(&mut self.description, newer.description);
        take(&mut self.avatar, newer.avatar);
        take(&mut self.followers_count, newer.followers_count);
        take(&mut self.follows_count, newer.follows_count);
        take(&mut self.posts_count, newer.posts_count);
        self.indexed_at = self.indexed_at.max(newer.indexed_at);
    }
}

/// A follow relationship between two users.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub source: String,
    pub target: String,
    /// Record URI; absent for edges discovered through the graph API.
    #[serde(default)]
    pub uri: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    pub indexed_at: i64,
}

/// A post.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Content {
    pub uri: String,
    pub author: String,
    #[serde(default)]
    pub cid: Option<String>,
    pub text: String,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub reply_parent: Option<String>,
    #[serde(default)]
    pub reply_root: Option<String>,
    #[serde(default)]
    pub langs: Vec<String>,
    pub indexed_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionKind {
    Like,
    Repost,
}

impl InteractionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            InteractionKind::Like => "like",
            InteractionKind::Repost => "repost",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "like" => Some(InteractionKind::Like),
            "repost" => Some(InteractionKind::Repost),
            _ => None,
        }
    }
}

/// A like or repost of some subject record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interaction {
    pub uri: String,
    pub actor: String,
    pub kind: InteractionKind,
    pub subject_uri: String,
    #[serde(default)]
    pub subject_cid: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    pub indexed_at: i64,
}

/// Polymorphic entity record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Entity {
    User(User),
    Edge(Edge),
    Content(Content),
    Interaction(Interaction),
}

impl Entity {
    pub fn kind(&self) -> EntityKind {
        match self {
            Entity::User(_) => EntityKind::User,
            Entity::Edge(_) => EntityKind::Edge,
            Entity::Content(_) => EntityKind::Content,
            Entity::Interaction(_) => EntityKind::Interaction,
        }
    }

    pub fn natural_key(&self) -> NaturalKey {
        match self {
            Entity::User(u) => NaturalKey::Did(u.did.clone()),
            Entity::Edge(e) => NaturalKey::Pair(e.source.clone(), e.target.clone()),
            Entity::Content(c) => NaturalKey::Uri(c.uri.clone()),
            Entity::Interaction(i) => NaturalKey::Uri(i.uri.clone()),
        }
    }

    /// Record URI, when the entity has one.
    pub fn uri(&self) -> Option<&str> {
        match self {
            Entity::User(_) => None,
            Entity::Edge(e) => e.uri.as_deref(),
            Entity::Content(c) => Some(&c.uri),
            Entity::Interaction(i) => Some(&i.uri),
        }
    }

    /// DIDs of every user row this entity references.
    pub fn owner_dids(&self) -> Vec<String> {
        let mut dids = Vec::new();
        match self {
            Entity::User(_) => {}
            Entity::Edge(e) => {
                dids.push(e.source.clone());
                dids.push(e.target.clone());
            }
            Entity::Content(c) => {
                dids.push(c.author.clone());
                for uri in [&c.reply_parent, &c.reply_root].into_iter().flatten() {
                    if let Some(did) = did_from_uri(uri) {
                        dids.push(did.to_string());
                    }
                }
            }
            Entity::Interaction(i) => {
                dids.push(i.actor.clone());
                if let Some(did) = did_from_uri(&i.subject_uri) {
                    dids.push(did.to_string());
                }
            }
        }
        dids.sort();
        dids.dedup();
        dids
    }
}

/// Build an AT-URI for a record.
pub fn record_uri(did: &str, collection: &str, rkey: &str) -> String {
    format!("at://{did}/{collection}/{rkey}")
}

/// Extract the repository DID from an AT-URI.
pub fn did_from_uri(uri: &str) -> Option<&str> {
    let rest = uri.strip_prefix("at://")?;
    let did = rest.split('/').next()?;
    did.starts_with("did:").then_some(did)
}

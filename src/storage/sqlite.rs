// src/storage/sqlite.rs

//! SQLite-backed entity store.
//!
//! Users are the owner table; edges, content and interactions reference it
//! through foreign keys, so a dependent row whose owner is missing is
//! rejected with [`AppError::ReferentialWrite`].

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, Row, Transaction, params};

use crate::error::{AppError, Result};
use crate::models::{
    ConflictMode, Content, Edge, Entity, EntityKind, Interaction, InteractionKind, User,
};
use crate::storage::EntityStore;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS users (
        did TEXT PRIMARY KEY,
        handle TEXT,
        display_name TEXT,
        description TEXT,
        avatar TEXT,
        followers_count INTEGER,
        follows_count INTEGER,
        posts_count INTEGER,
        indexed_at INTEGER NOT NULL
    );
    CREATE TABLE IF NOT EXISTS edges (
        source_did TEXT NOT NULL REFERENCES users(did),
        target_did TEXT NOT NULL REFERENCES users(did),
        uri TEXT,
        created_at TEXT,
        indexed_at INTEGER NOT NULL,
        PRIMARY KEY (source_did, target_did)
    );
    CREATE INDEX IF NOT EXISTS edges_uri ON edges(uri);
    CREATE TABLE IF NOT EXISTS content (
        uri TEXT PRIMARY KEY,
        author_did TEXT NOT NULL REFERENCES users(did),
        cid TEXT,
        text TEXT NOT NULL,
        created_at TEXT,
        reply_parent TEXT,
        reply_root TEXT,
        langs TEXT NOT NULL DEFAULT '[]',
        indexed_at INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS content_author ON content(author_did);
    CREATE TABLE IF NOT EXISTS interactions (
        uri TEXT PRIMARY KEY,
        actor_did TEXT NOT NULL REFERENCES users(did),
        kind TEXT NOT NULL,
        subject_uri TEXT NOT NULL,
        subject_cid TEXT,
        created_at TEXT,
        indexed_at INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS interactions_subject ON interactions(subject_uri);
";

/// Full, ordered dump of every table. Used to compare store states.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreSnapshot {
    pub users: Vec<User>,
    pub edges: Vec<Edge>,
    pub content: Vec<Content>,
    pub interactions: Vec<Interaction>,
}

#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) a database file and apply the schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        Self::from_connection(conn)
    }

    /// Private in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.initialize_schema()?;
        Ok(store)
    }

    pub fn initialize_schema(&self) -> Result<()> {
        let conn = self.lock();
        conn.execute_batch(&format!("BEGIN;{SCHEMA}COMMIT;"))?;
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run blocking database work off the async runtime.
    async fn with_conn<T, F>(&self, work: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            work(&mut guard)
        })
        .await
        .map_err(|e| AppError::storage(format!("database task failed: {e}")))?
    }

    pub async fn get_user(&self, did: &str) -> Result<Option<User>> {
        let did = did.to_string();
        self.with_conn(move |conn| {
            let user = conn
                .query_row(
                    "SELECT did, handle, display_name, description, avatar,
                            followers_count, follows_count, posts_count, indexed_at
                     FROM users WHERE did = ?1",
                    params![did],
                    user_from_row,
                )
                .optional()?;
            Ok(user)
        })
        .await
    }

    pub async fn get_edge(&self, source: &str, target: &str) -> Result<Option<Edge>> {
        let (source, target) = (source.to_string(), target.to_string());
        self.with_conn(move |conn| {
            let edge = conn
                .query_row(
                    "SELECT source_did, target_did, uri, created_at, indexed_at
                     FROM edges WHERE source_did = ?1 AND target_did = ?2",
                    params![source, target],
                    edge_from_row,
                )
                .optional()?;
            Ok(edge)
        })
        .await
    }

    /// Dump all tables ordered by natural key.
    pub async fn snapshot(&self) -> Result<StoreSnapshot> {
        self.with_conn(|conn| {
            let users = collect(
                conn,
                "SELECT did, handle, display_name, description, avatar,
                        followers_count, follows_count, posts_count, indexed_at
                 FROM users ORDER BY did",
                user_from_row,
            )?;
            let edges = collect(
                conn,
                "SELECT source_did, target_did, uri, created_at, indexed_at
                 FROM edges ORDER BY source_did, target_did",
                edge_from_row,
            )?;
            let content = collect(
                conn,
                "SELECT uri, author_did, cid, text, created_at, reply_parent, reply_root,
                        langs, indexed_at
                 FROM content ORDER BY uri",
                content_from_row,
            )?;
            let interactions = collect(
                conn,
                "SELECT uri, actor_did, kind, subject_uri, subject_cid, created_at, indexed_at
                 FROM interactions ORDER BY uri",
                interaction_from_row,
            )?;
            Ok(StoreSnapshot {
                users,
                edges,
                content,
                interactions,
            })
        })
        .await
    }
}

#[async_trait]
impl EntityStore for SqliteStore {
    async fn upsert(
        &self,
        kind: EntityKind,
        batch: &[Entity],
        mode: ConflictMode,
    ) -> Result<usize> {
        if batch.is_empty() {
            return Ok(0);
        }
        let batch = batch.to_vec();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            for entity in &batch {
                if entity.kind() != kind {
                    return Err(AppError::validation(format!(
                        "{} row in {kind} batch",
                        entity.kind()
                    )));
                }
                write_entity(&tx, entity, mode).map_err(|e| classify_write_error(kind, e))?;
            }
            tx.commit()?;
            Ok(batch.len())
        })
        .await
    }

    async fn delete(&self, kind: EntityKind, uris: &[String]) -> Result<usize> {
        let table = match kind {
            EntityKind::User => {
                return Err(AppError::validation("users cannot be deleted by URI"));
            }
            EntityKind::Edge => "edges",
            EntityKind::Content => "content",
            EntityKind::Interaction => "interactions",
        };
        if uris.is_empty() {
            return Ok(0);
        }
        let uris = uris.to_vec();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let mut removed = 0;
            {
                let mut stmt = tx.prepare(&format!("DELETE FROM {table} WHERE uri = ?1"))?;
                for uri in &uris {
                    removed += stmt.execute(params![uri])?;
                }
            }
            tx.commit()?;
            Ok(removed)
        })
        .await
    }

    async fn ensure_users(&self, dids: &[String], indexed_at: i64) -> Result<usize> {
        if dids.is_empty() {
            return Ok(0);
        }
        let dids = dids.to_vec();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let mut inserted = 0;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO users (did, indexed_at) VALUES (?1, ?2)
                     ON CONFLICT(did) DO NOTHING",
                )?;
                for did in &dids {
                    inserted += stmt.execute(params![did, indexed_at])?;
                }
            }
            tx.commit()?;
            Ok(inserted)
        })
        .await
    }

    async fn count(&self, kind: EntityKind) -> Result<u64> {
        let table = match kind {
            EntityKind::User => "users",
            EntityKind::Edge => "edges",
            EntityKind::Content => "content",
            EntityKind::Interaction => "interactions",
        };
        self.with_conn(move |conn| {
            let n: i64 =
                conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))?;
            Ok(n as u64)
        })
        .await
    }
}

fn write_entity(tx: &Transaction<'_>, entity: &Entity, mode: ConflictMode) -> rusqlite::Result<()> {
    let overwrite = mode == ConflictMode::Overwrite;
    match entity {
        Entity::User(u) => {
            let sql = if overwrite {
                "INSERT INTO users (did, handle, display_name, description, avatar,
                                    followers_count, follows_count, posts_count, indexed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(did) DO UPDATE SET
                    handle = COALESCE(excluded.handle, users.handle),
                    display_name = COALESCE(excluded.display_name, users.display_name),
                    description = COALESCE(excluded.description, users.description),
                    avatar = COALESCE(excluded.avatar, users.avatar),
                    followers_count = COALESCE(excluded.followers_count, users.followers_count),
                    follows_count = COALESCE(excluded.follows_count, users.follows_count),
                    posts_count = COALESCE(excluded.posts_count, users.posts_count),
                    indexed_at = MAX(users.indexed_at, excluded.indexed_at)"
            } else {
                "INSERT INTO users (did, handle, display_name, description, avatar,
                                    followers_count, follows_count, posts_count, indexed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(did) DO NOTHING"
            };
            tx.prepare_cached(sql)?.execute(params![
                u.did,
                u.handle,
                u.display_name,
                u.description,
                u.avatar,
                u.followers_count,
                u.follows_count,
                u.posts_count,
                u.indexed_at,
            ])?;
        }
        Entity::Edge(e) => {
            let sql = if overwrite {
                "INSERT INTO edges (source_did, target_did, uri, created_at, indexed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(source_did, target_did) DO UPDATE SET
                    uri = COALESCE(excluded.uri, edges.uri),
                    created_at = COALESCE(excluded.created_at, edges.created_at),
                    indexed_at = MAX(edges.indexed_at, excluded.indexed_at)"
            } else {
                "INSERT INTO edges (source_did, target_did, uri, created_at, indexed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(source_did, target_did) DO NOTHING"
            };
            tx.prepare_cached(sql)?.execute(params![
                e.source,
                e.target,
                e.uri,
                e.created_at,
                e.indexed_at,
            ])?;
        }
        Entity::Content(c) => {
            let sql = if overwrite {
                "INSERT INTO content (uri, author_did, cid, text, created_at, reply_parent,
                                      reply_root, langs, indexed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(uri) DO UPDATE SET
                    cid = excluded.cid,
                    text = excluded.text,
                    created_at = excluded.created_at,
                    reply_parent = excluded.reply_parent,
                    reply_root = excluded.reply_root,
                    langs = excluded.langs,
                    indexed_at = MAX(content.indexed_at, excluded.indexed_at)"
            } else {
                "INSERT INTO content (uri, author_did, cid, text, created_at, reply_parent,
                                      reply_root, langs, indexed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(uri) DO NOTHING"
            };
            let langs = serde_json::to_string(&c.langs)
                .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
            tx.prepare_cached(sql)?.execute(params![
                c.uri,
                c.author,
                c.cid,
                c.text,
                c.created_at,
                c.reply_parent,
                c.reply_root,
                langs,
                c.indexed_at,
            ])?;
        }
        Entity::Interaction(i) => {
            let sql = if overwrite {
                "INSERT INTO interactions (uri, actor_did, kind, subject_uri, subject_cid,
                                           created_at, indexed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(uri) DO UPDATE SET
                    subject_uri = excluded.subject_uri,
                    subject_cid = excluded.subject_cid,
                    created_at = excluded.created_at,
                    indexed_at = MAX(interactions.indexed_at, excluded.indexed_at)"
            } else {
                "INSERT INTO interactions (uri, actor_did, kind, subject_uri, subject_cid,
                                           created_at, indexed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(uri) DO NOTHING"
            };
            tx.prepare_cached(sql)?.execute(params![
                i.uri,
                i.actor,
                i.kind.as_str(),
                i.subject_uri,
                i.subject_cid,
                i.created_at,
                i.indexed_at,
            ])?;
        }
    }
    Ok(())
}

/// Turn foreign-key violations into [`AppError::ReferentialWrite`].
fn classify_write_error(kind: EntityKind, error: rusqlite::Error) -> AppError {
    if let rusqlite::Error::SqliteFailure(failure, message) = &error {
        if failure.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_FOREIGNKEY {
            return AppError::ReferentialWrite {
                kind,
                message: message
                    .clone()
                    .unwrap_or_else(|| "FOREIGN KEY constraint failed".to_string()),
            };
        }
    }
    AppError::Sqlite(error)
}

fn collect<T>(
    conn: &Connection,
    sql: &str,
    map: fn(&Row<'_>) -> rusqlite::Result<T>,
) -> Result<Vec<T>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map([], map)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        did: row.get(0)?,
        handle: row.get(1)?,
        display_name: row.get(2)?,
        description: row.get(3)?,
        avatar: row.get(4)?,
        followers_count: row.get(5)?,
        follows_count: row.get(6)?,
        posts_count: row.get(7)?,
        indexed_at: row.get(8)?,
    })
}

fn edge_from_row(row: &Row<'_>) -> rusqlite::Result<Edge> {
    Ok(Edge {
        source: row.get(0)?,
        target: row.get(1)?,
        uri: row.get(2)?,
        created_at: row.get(3)?,
        indexed_at: row.get(4)?,
    })
}

fn content_from_row(row: &Row<'_>) -> rusqlite::Result<Content> {
    let langs: String = row.get(7)?;
    Ok(Content {
        uri: row.get(0)?,
        author: row.get(1)?,
        cid: row.get(2)?,
        text: row.get(3)?,
        created_at: row.get(4)?,
        reply_parent: row.get(5)?,
        reply_root: row.get(6)?,
        langs: serde_json::from_str(&langs).unwrap_or_default(),
        indexed_at: row.get(8)?,
    })
}

fn interaction_from_row(row: &Row<'_>) -> rusqlite::Result<Interaction> {
    let kind: String = row.get(2)?;
    Ok(Interaction {
        uri: row.get(0)?,
        actor: row.get(1)?,
        kind: InteractionKind::parse(&kind).unwrap_or(InteractionKind::Like),
        subject_uri: row.get(3)?,
        subject_cid: row.get(4)?,
        created_at: row.get(5)?,
        indexed_at: row.get(6)?,
    })
}

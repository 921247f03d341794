//! libSQL backend for `ConversationStore`.
//!
//! The live state is stored as a JSON document per conversation with a
//! `version` column for optimistic concurrency. Every message-log entry is
//! also mirrored into the append-only `conversation_log` table, so the full
//! history survives the bounded window kept in the state. The state row and
//! its new log entries are written in one transaction.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, Transaction, params};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::conversation::model::{
    ConversationState, ConversationStatus, Direction, MessageLogEntry,
};
use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::traits::{ConversationStore, Versioned};

/// libSQL conversation store.
///
/// Stores a single connection that is reused for all operations, one
/// operation at a time.
pub struct LibSqlStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    /// Serializes use of the shared connection, so no statement runs inside
    /// another caller's open transaction.
    conn_lock: Mutex<()>,
}

impl LibSqlStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let store = Self::from_database(db)?;
        migrations::run_migrations(&store.conn).await?;
        info!(path = %path.display(), "Database opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let store = Self::from_database(db)?;
        migrations::run_migrations(&store.conn).await?;
        Ok(store)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            conn,
            conn_lock: Mutex::new(()),
        })
    }

    /// Identity of the newest mirrored log entry for a conversation.
    async fn last_logged(
        tx: &Transaction,
        id: &str,
    ) -> Result<Option<(String, String)>, DatabaseError> {
        let mut rows = tx
            .query(
                "SELECT direction, message_id FROM conversation_log WHERE conversation_id = ?1 ORDER BY rowid DESC LIMIT 1",
                params![id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("last_logged: {e}")))?;

        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("last_logged: {e}")))?
        {
            Some(row) => {
                let direction: String = row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("last_logged: {e}")))?;
                let message_id: String = row
                    .get(1)
                    .map_err(|e| DatabaseError::Query(format!("last_logged: {e}")))?;
                Ok(Some((direction, message_id)))
            }
            None => Ok(None),
        }
    }

    /// Mirror the log entries added since the last write into the log table.
    async fn append_log(tx: &Transaction, state: &ConversationState) -> Result<(), DatabaseError> {
        let last = Self::last_logged(tx, &state.conversation_id).await?;
        for entry in unlogged_entries(state, last.as_ref()) {
            tx.execute(
                "INSERT OR IGNORE INTO conversation_log (conversation_id, direction, message_id, text, timestamp) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    state.conversation_id.as_str(),
                    entry.direction.as_str(),
                    entry.message_id.as_str(),
                    entry.text.as_str(),
                    entry.timestamp.to_rfc3339()
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("append_log: {e}")))?;
        }
        Ok(())
    }

    /// State row plus log mirror. Runs inside `tx`; nothing is visible until
    /// the caller commits.
    async fn write_state(
        tx: &Transaction,
        state: &ConversationState,
        expected_version: Option<u64>,
    ) -> Result<u64, DatabaseError> {
        let json = serde_json::to_string(state)
            .map_err(|e| DatabaseError::Serialization(format!("encode state: {e}")))?;
        let id = state.conversation_id.as_str();
        let now = Utc::now().to_rfc3339();

        let (affected, new_version) = match expected_version {
            None => {
                let affected = tx
                    .execute(
                        "INSERT OR IGNORE INTO conversations (id, status, version, state, created_at, last_activity_at, updated_at) VALUES (?1, ?2, 1, ?3, ?4, ?5, ?6)",
                        params![
                            id,
                            state.status.as_str(),
                            json,
                            state.created_at.to_rfc3339(),
                            state.last_activity_at.to_rfc3339(),
                            now
                        ],
                    )
                    .await
                    .map_err(|e| DatabaseError::Query(format!("put insert: {e}")))?;
                (affected, 1)
            }
            Some(expected) => {
                let next = expected + 1;
                let affected = tx
                    .execute(
                        "UPDATE conversations SET status = ?1, version = ?2, state = ?3, last_activity_at = ?4, updated_at = ?5 WHERE id = ?6 AND version = ?7",
                        params![
                            state.status.as_str(),
                            next as i64,
                            json,
                            state.last_activity_at.to_rfc3339(),
                            now,
                            id,
                            expected as i64
                        ],
                    )
                    .await
                    .map_err(|e| DatabaseError::Query(format!("put update: {e}")))?;
                (affected, next)
            }
        };

        if affected == 0 {
            let actual = current_version(tx, id).await?;
            debug!(conversation_id = id, ?expected_version, ?actual, "Version conflict");
            return Err(DatabaseError::VersionConflict {
                id: id.to_string(),
                expected: expected_version,
                actual,
            });
        }

        Self::append_log(tx, state).await?;
        Ok(new_version)
    }
}

// ── Helper functions ────────────────────────────────────────────────

async fn current_version(conn: &Connection, id: &str) -> Result<Option<u64>, DatabaseError> {
    let mut rows = conn
        .query("SELECT version FROM conversations WHERE id = ?1", params![id])
        .await
        .map_err(|e| DatabaseError::Query(format!("current_version: {e}")))?;

    match rows
        .next()
        .await
        .map_err(|e| DatabaseError::Query(format!("current_version: {e}")))?
    {
        Some(row) => {
            let version: i64 = row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("current_version: {e}")))?;
            Ok(Some(version as u64))
        }
        None => Ok(None),
    }
}

/// Entries of the live window that come after `last`, the newest entry
/// already in the log table. Everything is new when `last` is absent or has
/// already left the window.
fn unlogged_entries<'a>(
    state: &'a ConversationState,
    last: Option<&(String, String)>,
) -> impl Iterator<Item = &'a MessageLogEntry> {
    let skip = last
        .and_then(|(direction, message_id)| {
            state
                .message_log
                .iter()
                .rposition(|e| e.direction.as_str() == direction && &e.message_id == message_id)
        })
        .map_or(0, |pos| pos + 1);
    state.message_log.iter().skip(skip)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn str_to_direction(s: &str) -> Direction {
    match s {
        "outbound" => Direction::Outbound,
        _ => Direction::Inbound,
    }
}

fn row_to_state(row: &libsql::Row) -> Result<Versioned<ConversationState>, DatabaseError> {
    let json: String = row
        .get(0)
        .map_err(|e| DatabaseError::Query(format!("read state: {e}")))?;
    let version: i64 = row
        .get(1)
        .map_err(|e| DatabaseError::Query(format!("read version: {e}")))?;
    let value: ConversationState = serde_json::from_str(&json)
        .map_err(|e| DatabaseError::Serialization(format!("decode state: {e}")))?;
    Ok(Versioned {
        value,
        version: version as u64,
    })
}

#[async_trait]
impl ConversationStore for LibSqlStore {
    async fn get(
        &self,
        conversation_id: &str,
    ) -> Result<Option<Versioned<ConversationState>>, DatabaseError> {
        let _conn = self.conn_lock.lock().await;
        let mut rows = self
            .conn
            .query(
                "SELECT state, version FROM conversations WHERE id = ?1",
                params![conversation_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get: {e}")))?;

        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("get: {e}")))?
        {
            Some(row) => Ok(Some(row_to_state(&row)?)),
            None => Ok(None),
        }
    }

    async fn put(
        &self,
        state: &ConversationState,
        expected_version: Option<u64>,
    ) -> Result<u64, DatabaseError> {
        let _conn = self.conn_lock.lock().await;
        let tx = self
            .conn
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("begin: {e}")))?;

        // Dropping `tx` without commit rolls back, including when the
        // caller's timeout cancels this future.
        match Self::write_state(&tx, state, expected_version).await {
            Ok(version) => {
                tx.commit()
                    .await
                    .map_err(|e| DatabaseError::Query(format!("commit: {e}")))?;
                Ok(version)
            }
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    tracing::warn!(conversation_id = %state.conversation_id, error = %rollback, "Rollback failed");
                }
                Err(e)
            }
        }
    }

    async fn list_by_status(
        &self,
        status: ConversationStatus,
    ) -> Result<Vec<Versioned<ConversationState>>, DatabaseError> {
        let _conn = self.conn_lock.lock().await;
        let mut rows = self
            .conn
            .query(
                "SELECT state, version FROM conversations WHERE status = ?1 ORDER BY last_activity_at",
                params![status.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_by_status: {e}")))?;

        let mut out = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_by_status: {e}")))?
        {
            out.push(row_to_state(&row)?);
        }
        Ok(out)
    }

    async fn message_log(&self, conversation_id: &str) -> Result<Vec<MessageLogEntry>, DatabaseError> {
        let _conn = self.conn_lock.lock().await;
        let mut rows = self
            .conn
            .query(
                "SELECT direction, message_id, text, timestamp FROM conversation_log WHERE conversation_id = ?1 ORDER BY timestamp, rowid",
                params![conversation_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("message_log: {e}")))?;

        let mut out = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("message_log: {e}")))?
        {
            let direction: String = row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("message_log: {e}")))?;
            let message_id: String = row
                .get(1)
                .map_err(|e| DatabaseError::Query(format!("message_log: {e}")))?;
            let text: String = row
                .get(2)
                .map_err(|e| DatabaseError::Query(format!("message_log: {e}")))?;
            let timestamp: String = row
                .get(3)
                .map_err(|e| DatabaseError::Query(format!("message_log: {e}")))?;
            out.push(MessageLogEntry {
                direction: str_to_direction(&direction),
                text,
                timestamp: parse_datetime(&timestamp),
                message_id,
            });
        }
        Ok(out)
    }
}

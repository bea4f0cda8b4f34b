use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Mutex;

use crate::types::{AttemptOutcome, BroadcastAttempt, ConversationId, TargetKind};

/// Persisted system instructions row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredInstructions {
    pub text: String,
    pub updated_at: DateTime<Utc>,
}

/// Persisted broadcast settings row. `target_ids` is kept as the raw
/// comma-separated list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredBroadcastSettings {
    pub target_ids: String,
    pub start_message: String,
    pub updated_at: DateTime<Utc>,
}

/// Durable home of the operator-editable settings.
///
/// Every write replaces the single logical record; there is never more than
/// one live configuration.
pub trait ConfigStore: Send + Sync {
    fn load_system_instructions(&self) -> Result<Option<StoredInstructions>>;
    fn save_system_instructions(&self, text: &str) -> Result<()>;
    fn load_broadcast_settings(&self) -> Result<Option<StoredBroadcastSettings>>;
    fn save_broadcast_settings(&self, target_ids: &str, start_message: &str) -> Result<()>;
}

/// Append-only audit log of broadcast attempts.
pub trait BroadcastLog: Send + Sync {
    fn append(&self, attempt: &BroadcastAttempt) -> Result<()>;
    /// Most recent first, at most `limit` entries.
    fn recent(&self, limit: usize) -> Result<Vec<BroadcastAttempt>>;
}

pub struct CourierDatabase {
    conn: Mutex<Connection>,
}

impl CourierDatabase {
    /// Helper to lock the connection
    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Database lock poisoned: {}", e))
    }

    /// Create or open the database
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {:?}", path))?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.ensure_schema()?;
        Ok(db)
    }

    /// Create the database schema
    fn ensure_schema(&self) -> Result<()> {
        let conn = self.lock_conn()?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS system_instructions (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                text TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )"#,
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS broadcast_settings (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                target_ids TEXT NOT NULL,
                start_message TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )"#,
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS broadcast_attempts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id TEXT NOT NULL,
                target_id INTEGER NOT NULL,
                target_kind TEXT NOT NULL,
                target_name TEXT NOT NULL,
                message_text TEXT NOT NULL,
                success INTEGER NOT NULL,
                error_text TEXT,
                attempted_at TEXT NOT NULL
            )"#,
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_broadcast_attempts_run ON broadcast_attempts(run_id)",
            [],
        )?;

        Ok(())
    }

    /// Get the persisted system instructions
    pub fn get_system_instructions(&self) -> Result<Option<StoredInstructions>> {
        let conn = self.lock_conn()?;
        let result = conn.query_row(
            "SELECT text, updated_at FROM system_instructions WHERE id = 1",
            [],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
        );

        match result {
            Ok((text, updated_at)) => Ok(Some(StoredInstructions {
                text,
                updated_at: parse_timestamp(&updated_at)?,
            })),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Create or replace the system instructions row
    pub fn set_system_instructions(&self, text: &str) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO system_instructions (id, text, updated_at)
             VALUES (1, ?1, ?2)
             ON CONFLICT(id) DO UPDATE SET
                text = excluded.text,
                updated_at = excluded.updated_at",
            params![text, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Get the persisted broadcast settings
    pub fn get_broadcast_settings(&self) -> Result<Option<StoredBroadcastSettings>> {
        let conn = self.lock_conn()?;
        let result = conn.query_row(
            "SELECT target_ids, start_message, updated_at FROM broadcast_settings WHERE id = 1",
            [],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            },
        );

        match result {
            Ok((target_ids, start_message, updated_at)) => Ok(Some(StoredBroadcastSettings {
                target_ids,
                start_message,
                updated_at: parse_timestamp(&updated_at)?,
            })),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Create or replace the broadcast settings row
    pub fn set_broadcast_settings(&self, target_ids: &str, start_message: &str) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO broadcast_settings (id, target_ids, start_message, updated_at)
             VALUES (1, ?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET
                target_ids = excluded.target_ids,
                start_message = excluded.start_message,
                updated_at = excluded.updated_at",
            params![target_ids, start_message, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Append one broadcast attempt, returning its row id
    pub fn add_broadcast_attempt(&self, attempt: &BroadcastAttempt) -> Result<i64> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO broadcast_attempts (run_id, target_id, target_kind, target_name, message_text, success, error_text, attempted_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                attempt.run_id,
                attempt.target.get(),
                attempt.target_kind.as_db_str(),
                attempt.target_name,
                attempt.message_text,
                attempt.outcome.is_success(),
                attempt.error_detail,
                attempt.attempted_at.to_rfc3339(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Get the N most recent broadcast attempts, newest first
    pub fn get_recent_broadcast_attempts(&self, limit: usize) -> Result<Vec<BroadcastAttempt>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT run_id, target_id, target_kind, target_name, message_text, success, error_text, attempted_at
             FROM broadcast_attempts
             ORDER BY id DESC
             LIMIT ?1",
        )?;

        let attempts = stmt
            .query_map([limit as i64], |row| {
                let success: bool = row.get(5)?;
                Ok(BroadcastAttempt {
                    run_id: row.get(0)?,
                    target: ConversationId::new(row.get(1)?),
                    target_kind: TargetKind::from_db(&row.get::<_, String>(2)?),
                    target_name: row.get(3)?,
                    message_text: row.get(4)?,
                    outcome: if success {
                        AttemptOutcome::Success
                    } else {
                        AttemptOutcome::Failure
                    },
                    error_detail: row.get(6)?,
                    attempted_at: row.get::<_, String>(7)?.parse().map_err(|e| {
                        rusqlite::Error::FromSqlConversionFailure(
                            7,
                            rusqlite::types::Type::Text,
                            Box::new(e),
                        )
                    })?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(attempts)
    }

    /// Count all broadcast attempts
    pub fn count_broadcast_attempts(&self) -> Result<usize> {
        let conn = self.lock_conn()?;
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM broadcast_attempts", [], |row| row.get(0))?;
        Ok(count.max(0) as usize)
    }
}

impl ConfigStore for CourierDatabase {
    fn load_system_instructions(&self) -> Result<Option<StoredInstructions>> {
        self.get_system_instructions()
    }

    fn save_system_instructions(&self, text: &str) -> Result<()> {
        self.set_system_instructions(text)
    }

    fn load_broadcast_settings(&self) -> Result<Option<StoredBroadcastSettings>> {
        self.get_broadcast_settings()
    }

    fn save_broadcast_settings(&self, target_ids: &str, start_message: &str) -> Result<()> {
        self.set_broadcast_settings(target_ids, start_message)
    }
}

impl BroadcastLog for CourierDatabase {
    fn append(&self, attempt: &BroadcastAttempt) -> Result<()> {
        self.add_broadcast_attempt(attempt).map(|_| ())
    }

    fn recent(&self, limit: usize) -> Result<Vec<BroadcastAttempt>> {
        self.get_recent_broadcast_attempts(limit)
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    raw.parse()
        .with_context(|| format!("Failed to parse stored timestamp {:?}", raw))
}

//! warden-store — SQLite persistence for the matching core.
//!
//! Embeddings are stored as little-endian `f32` blobs, timestamps as RFC 3339
//! text, record ids as hyphenated UUID text.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::path::Path;
use thiserror::Error;
use uuid::Uuid;
use warden_core::{Embedding, Identity, Snapshot, TemplateStore, UnmatchedRecord};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid stored value in {column}: {reason}")]
    InvalidDbValue { column: &'static str, reason: String },
}

pub type Result<T> = std::result::Result<T, StoreError>;

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS identities (
    name        TEXT PRIMARY KEY,
    template    BLOB NOT NULL,
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS unmatched (
    id              TEXT PRIMARY KEY,
    representative  BLOB NOT NULL,
    mean            BLOB NOT NULL,
    occurrences     INTEGER NOT NULL,
    first_seen      TEXT NOT NULL,
    last_seen       TEXT NOT NULL
);
";

pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open or create the database at `path`, creating parent directories.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA_SQL)?;
        tracing::info!(path = %path.display(), "opened template store");
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self { conn })
    }

    fn load_identities(&self) -> Result<Vec<Identity>> {
        let mut stmt = self.conn.prepare(
            "SELECT name, template, created_at, updated_at FROM identities ORDER BY name ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Vec<u8>>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut identities = Vec::new();
        for row in rows {
            let (name, template, created_at, updated_at) = row?;
            identities.push(Identity {
                name,
                template: decode_embedding("identities.template", &template)?,
                created_at: decode_timestamp("identities.created_at", &created_at)?,
                updated_at: decode_timestamp("identities.updated_at", &updated_at)?,
            });
        }
        Ok(identities)
    }

    fn load_unmatched(&self) -> Result<Vec<UnmatchedRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, representative, mean, occurrences, first_seen, last_seen
             FROM unmatched ORDER BY first_seen ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Vec<u8>>(1)?,
                row.get::<_, Vec<u8>>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (id, representative, mean, occurrences, first_seen, last_seen) = row?;
            records.push(UnmatchedRecord {
                id: Uuid::parse_str(&id).map_err(|e| StoreError::InvalidDbValue {
                    column: "unmatched.id",
                    reason: e.to_string(),
                })?,
                representative: decode_embedding("unmatched.representative", &representative)?,
                mean: decode_f32_blob("unmatched.mean", &mean)?,
                occurrences: u32::try_from(occurrences).map_err(|_| StoreError::InvalidDbValue {
                    column: "unmatched.occurrences",
                    reason: format!("out of range: {occurrences}"),
                })?,
                first_seen: decode_timestamp("unmatched.first_seen", &first_seen)?,
                last_seen: decode_timestamp("unmatched.last_seen", &last_seen)?,
            });
        }
        Ok(records)
    }
}

impl TemplateStore for SqliteStore {
    type Error = StoreError;

    fn load(&self) -> Result<Snapshot> {
        let snapshot = Snapshot {
            identities: self.load_identities()?,
            unmatched: self.load_unmatched()?,
        };
        tracing::debug!(
            identities = snapshot.identities.len(),
            unmatched = snapshot.unmatched.len(),
            "loaded template store"
        );
        Ok(snapshot)
    }

    fn save_identity(&self, identity: &Identity) -> Result<()> {
        self.conn.execute(
            "INSERT INTO identities (name, template, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(name) DO UPDATE SET
                template = excluded.template,
                created_at = excluded.created_at,
                updated_at = excluded.updated_at",
            params![
                identity.name,
                encode_f32_blob(identity.template.as_slice()),
                identity.created_at.to_rfc3339(),
                identity.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn delete_identity(&self, name: &str) -> Result<bool> {
        let deleted = self
            .conn
            .execute("DELETE FROM identities WHERE name = ?1", params![name])?;
        Ok(deleted > 0)
    }

    fn save_unmatched(&self, record: &UnmatchedRecord) -> Result<()> {
        self.conn.execute(
            "INSERT INTO unmatched (id, representative, mean, occurrences, first_seen, last_seen)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                representative = excluded.representative,
                mean = excluded.mean,
                occurrences = excluded.occurrences,
                last_seen = excluded.last_seen",
            params![
                record.id.to_string(),
                encode_f32_blob(record.representative.as_slice()),
                encode_f32_blob(&record.mean),
                i64::from(record.occurrences),
                record.first_seen.to_rfc3339(),
                record.last_seen.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn delete_unmatched(&self, id: Uuid) -> Result<bool> {
        let deleted = self
            .conn
            .execute("DELETE FROM unmatched WHERE id = ?1", params![id.to_string()])?;
        Ok(deleted > 0)
    }
}

fn encode_f32_blob(values: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(std::mem::size_of_val(values));
    for &value in values {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

fn decode_f32_blob(column: &'static str, blob: &[u8]) -> Result<Vec<f32>> {
    if blob.len() % 4 != 0 {
        return Err(StoreError::InvalidDbValue {
            column,
            reason: format!("blob length {} is not a multiple of 4", blob.len()),
        });
    }
    Ok(blob
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

fn decode_embedding(column: &'static str, blob: &[u8]) -> Result<Embedding> {
    Embedding::from_unit(decode_f32_blob(column, blob)?).map_err(|e| StoreError::InvalidDbValue {
        column,
        reason: e.to_string(),
    })
}

fn decode_timestamp(column: &'static str, text: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::InvalidDbValue {
            column,
            reason: e.to_string(),
        })
}

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;
use warden_core::{Identity, TemplateStore, UnmatchedRecord};
use warden_store::{SqliteStore, StoreError};

#[derive(Error, Debug)]
pub enum WriterError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("failed to spawn store writer: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("store writer thread exited")]
    ChannelClosed,
}

/// One durable change, applied after the in-memory decision is final.
#[derive(Debug, Clone)]
pub enum Persist {
    SaveIdentity(Identity),
    /// Carries the removed identity so later saves of that enrollment are dropped.
    DeleteIdentity(Identity),
    SaveUnmatched(UnmatchedRecord),
    DeleteUnmatched(Uuid),
}

/// Messages sent from pipelines and D-Bus handlers to the writer thread.
enum WriterRequest {
    Apply(Persist),
    /// Reply once every earlier request has been applied.
    Flush { reply: oneshot::Sender<()> },
}

/// Clone-safe handle to the store writer thread.
#[derive(Clone)]
pub struct StoreHandle {
    tx: mpsc::Sender<WriterRequest>,
}

impl StoreHandle {
    /// Queue a change from async context.
    pub async fn persist(&self, change: Persist) -> Result<(), WriterError> {
        self.tx
            .send(WriterRequest::Apply(change))
            .await
            .map_err(|_| WriterError::ChannelClosed)
    }

    /// Queue a change from a source thread. Blocks while the queue is full.
    pub fn persist_blocking(&self, change: Persist) -> Result<(), WriterError> {
        self.tx
            .blocking_send(WriterRequest::Apply(change))
            .map_err(|_| WriterError::ChannelClosed)
    }

    /// Wait until everything queued so far has been written.
    pub async fn flush(&self) -> Result<(), WriterError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(WriterRequest::Flush { reply: reply_tx })
            .await
            .map_err(|_| WriterError::ChannelClosed)?;
        reply_rx.await.map_err(|_| WriterError::ChannelClosed)
    }
}

/// Spawn the store writer on a dedicated OS thread.
///
/// SQLite calls block, so they never run on the async executor. A failed
/// write is logged and the loop carries on: the in-memory state stays
/// authoritative and the next write of the same row supersedes it.
pub fn spawn_writer(store: SqliteStore) -> Result<StoreHandle, WriterError> {
    let (tx, mut rx) = mpsc::channel::<WriterRequest>(256);

    std::thread::Builder::new()
        .name("warden-store".into())
        .spawn(move || {
            tracing::info!("store writer started");
            let mut ledger = Ledger::default();
            while let Some(req) = rx.blocking_recv() {
                match req {
                    WriterRequest::Apply(change) => {
                        if !ledger.admit(&change) {
                            tracing::debug!(change = ?change, "skipping superseded store write");
                            continue;
                        }
                        if let Err(e) = apply(&store, &change) {
                            tracing::error!(error = %e, change = ?change, "store write failed");
                        }
                    }
                    WriterRequest::Flush { reply } => {
                        let _ = reply.send(());
                    }
                }
            }
            tracing::info!("store writer exiting");
        })?;

    Ok(StoreHandle { tx })
}

/// Last version of every row the writer has seen.
///
/// Pipelines and D-Bus handlers queue changes independently, so a save taken
/// before a delete or a newer save can arrive after it. An identity version
/// is `(created_at, updated_at)`: a re-enrollment gets a new `created_at`, a
/// template refresh a new `updated_at`. Unmatched record ids are never
/// reused and their occurrence count only grows.
#[derive(Debug, Default)]
struct Ledger {
    identities: HashMap<String, RowVersion<(DateTime<Utc>, DateTime<Utc>)>>,
    unmatched: HashMap<Uuid, RowVersion<u32>>,
}

#[derive(Debug, Clone, Copy)]
struct RowVersion<V> {
    version: V,
    deleted: bool,
}

impl Ledger {
    /// Record `change` and report whether it should reach the store.
    fn admit(&mut self, change: &Persist) -> bool {
        match change {
            Persist::SaveIdentity(identity) => {
                let version = (identity.created_at, identity.updated_at);
                if let Some(seen) = self.identities.get(&identity.name) {
                    let same_enrollment = seen.version.0 == identity.created_at;
                    if version < seen.version || (seen.deleted && same_enrollment) {
                        return false;
                    }
                }
                self.identities.insert(
                    identity.name.clone(),
                    RowVersion {
                        version,
                        deleted: false,
                    },
                );
                true
            }
            Persist::DeleteIdentity(identity) => {
                let version = (identity.created_at, identity.updated_at);
                let entry = self
                    .identities
                    .entry(identity.name.clone())
                    .or_insert(RowVersion {
                        version,
                        deleted: true,
                    });
                if entry.version < version {
                    entry.version = version;
                }
                if entry.version.0 == identity.created_at {
                    entry.deleted = true;
                    true
                } else {
                    // A newer enrollment of this name is already stored.
                    false
                }
            }
            Persist::SaveUnmatched(record) => {
                if let Some(seen) = self.unmatched.get(&record.id) {
                    if seen.deleted || record.occurrences < seen.version {
                        return false;
                    }
                }
                self.unmatched.insert(
                    record.id,
                    RowVersion {
                        version: record.occurrences,
                        deleted: false,
                    },
                );
                true
            }
            Persist::DeleteUnmatched(id) => {
                self.unmatched
                    .entry(*id)
                    .and_modify(|seen| seen.deleted = true)
                    .or_insert(RowVersion {
                        version: 0,
                        deleted: true,
                    });
                true
            }
        }
    }
}

fn apply(store: &SqliteStore, change: &Persist) -> Result<(), StoreError> {
    match change {
        Persist::SaveIdentity(identity) => store.save_identity(identity),
        Persist::DeleteIdentity(identity) => {
            if !store.delete_identity(&identity.name)? {
                tracing::warn!(name = %identity.name, "deleted identity had no stored row");
            }
            Ok(())
        }
        Persist::SaveUnmatched(record) => store.save_unmatched(record),
        Persist::DeleteUnmatched(id) => {
            if !store.delete_unmatched(*id)? {
                tracing::warn!(record = %id, "deleted unmatched record had no stored row");
            }
            Ok(())
        }
    }
}

use crate::writer::{Persist, StoreHandle};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;
use warden_core::{Embedding, Identity, Recognizer, UnmatchedOrder, UnmatchedRecord};
use zbus::interface;

/// D-Bus interface for the Warden identity daemon.
///
/// Bus name: org.warden.Warden1
/// Object path: /org/warden/Warden1
///
/// Request and reply bodies that carry structure are JSON strings.
pub struct WardenService {
    recognizer: Arc<Recognizer>,
    store: StoreHandle,
}

impl WardenService {
    pub fn new(recognizer: Arc<Recognizer>, store: StoreHandle) -> Self {
        Self { recognizer, store }
    }

    async fn persist(&self, change: Persist) {
        if let Err(e) = self.store.persist(change).await {
            tracing::error!(error = %e, "dropping store write");
        }
    }
}

/// Identity as shown to clients: everything but the raw template.
#[derive(Serialize)]
struct IdentitySummary<'a> {
    name: &'a str,
    dimension: usize,
    created_at: String,
    updated_at: String,
}

impl<'a> From<&'a Identity> for IdentitySummary<'a> {
    fn from(identity: &'a Identity) -> Self {
        Self {
            name: &identity.name,
            dimension: identity.template.dim(),
            created_at: identity.created_at.to_rfc3339(),
            updated_at: identity.updated_at.to_rfc3339(),
        }
    }
}

#[derive(Serialize)]
struct RecordSummary {
    id: Uuid,
    occurrences: u32,
    first_seen: String,
    last_seen: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    score: Option<f32>,
}

impl RecordSummary {
    fn new(record: &UnmatchedRecord, score: Option<f32>) -> Self {
        Self {
            id: record.id,
            occurrences: record.occurrences,
            first_seen: record.first_seen.to_rfc3339(),
            last_seen: record.last_seen.to_rfc3339(),
            score,
        }
    }
}

fn to_fdo(e: warden_core::Error) -> zbus::fdo::Error {
    use warden_core::Error;
    match e {
        Error::DuplicateName(_)
        | Error::NotFound(_)
        | Error::DimensionMismatch { .. }
        | Error::InvalidEmbedding(_)
        | Error::InvalidName => zbus::fdo::Error::InvalidArgs(e.to_string()),
        Error::IndexRebuildFailure(_) | Error::Config(_) => zbus::fdo::Error::Failed(e.to_string()),
    }
}

fn to_json<T: Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
}

fn parse_id(id: &str) -> zbus::fdo::Result<Uuid> {
    Uuid::parse_str(id).map_err(|e| zbus::fdo::Error::InvalidArgs(format!("record id {id:?}: {e}")))
}

#[interface(name = "org.warden.Warden1")]
impl WardenService {
    /// Enroll `name` with a JSON array embedding. Returns the identity summary.
    async fn enroll(&self, name: &str, embedding: &str) -> zbus::fdo::Result<String> {
        tracing::info!(name, "enroll requested");
        let values: Vec<f32> = serde_json::from_str(embedding)
            .map_err(|e| zbus::fdo::Error::InvalidArgs(format!("embedding: {e}")))?;
        let embedding = Embedding::new(values).map_err(to_fdo)?;

        let identity = self.recognizer.enroll(name, embedding).map_err(to_fdo)?;
        self.persist(Persist::SaveIdentity(identity.clone())).await;
        to_json(&IdentitySummary::from(&identity))
    }

    /// Replace the template of enrolled `name` in one step. On error the
    /// enrolled identity is kept. Returns the identity summary.
    async fn replace(&self, name: &str, embedding: &str) -> zbus::fdo::Result<String> {
        tracing::info!(name, "replace requested");
        let values: Vec<f32> = serde_json::from_str(embedding)
            .map_err(|e| zbus::fdo::Error::InvalidArgs(format!("embedding: {e}")))?;
        let embedding = Embedding::new(values).map_err(to_fdo)?;

        let identity = self.recognizer.replace(name, embedding).map_err(to_fdo)?;
        self.persist(Persist::SaveIdentity(identity.clone())).await;
        to_json(&IdentitySummary::from(&identity))
    }

    /// Remove an enrolled identity by name.
    async fn remove(&self, name: &str) -> zbus::fdo::Result<bool> {
        tracing::info!(name, "remove requested");
        let removed = self.recognizer.remove(name).map_err(to_fdo)?;
        self.persist(Persist::DeleteIdentity(removed)).await;
        Ok(true)
    }

    /// List enrolled identities, ordered by name.
    async fn list_identities(&self) -> zbus::fdo::Result<String> {
        let identities = self.recognizer.identities();
        let summaries: Vec<IdentitySummary<'_>> = identities.iter().map(Into::into).collect();
        to_json(&summaries)
    }

    /// List unmatched records. `order` is `occurrence_desc` (default when
    /// empty), `last_seen_desc` or `first_seen_asc`.
    async fn list_unmatched(&self, order: &str) -> zbus::fdo::Result<String> {
        let order = if order.is_empty() {
            UnmatchedOrder::default()
        } else {
            order
                .parse()
                .map_err(|_| zbus::fdo::Error::InvalidArgs(format!("unknown order {order:?}")))?
        };
        let records: Vec<RecordSummary> = self
            .recognizer
            .list_unmatched(order)
            .iter()
            .map(|r| RecordSummary::new(r, None))
            .collect();
        to_json(&records)
    }

    /// Enroll unmatched record `id` as `name`.
    async fn promote(&self, id: &str, name: &str) -> zbus::fdo::Result<String> {
        tracing::info!(record = id, name, "promote requested");
        let id = parse_id(id)?;
        let identity = self.recognizer.promote(id, name).map_err(to_fdo)?;
        self.persist(Persist::SaveIdentity(identity.clone())).await;
        self.persist(Persist::DeleteUnmatched(id)).await;
        to_json(&IdentitySummary::from(&identity))
    }

    /// Discard unmatched record `id`.
    async fn dismiss(&self, id: &str) -> zbus::fdo::Result<bool> {
        tracing::info!(record = id, "dismiss requested");
        let id = parse_id(id)?;
        self.recognizer.dismiss(id).map_err(to_fdo)?;
        self.persist(Persist::DeleteUnmatched(id)).await;
        Ok(true)
    }

    /// Records resembling `id` at or above `threshold`, best first.
    async fn similar_unmatched(
        &self,
        id: &str,
        threshold: f64,
        limit: u32,
    ) -> zbus::fdo::Result<String> {
        let id = parse_id(id)?;
        let similar = self
            .recognizer
            .similar_unmatched(id, threshold as f32, limit as usize)
            .map_err(to_fdo)?;
        let summaries: Vec<RecordSummary> = similar
            .iter()
            .map(|(r, score)| RecordSummary::new(r, Some(*score)))
            .collect();
        to_json(&summaries)
    }

    /// Force a rebuild of the candidate index. Returns the active strategy.
    async fn rebuild_index(&self) -> zbus::fdo::Result<String> {
        tracing::info!("index rebuild requested");
        let kind = self.recognizer.rebuild_index().map_err(to_fdo)?;
        to_json(&kind)
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let status = self.recognizer.status();
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "identities": status.identities,
            "dimension": status.dimension,
            "mode": status.mode,
            "unmatched": status.unmatched,
            "window_size": status.window_size,
        })
        .to_string())
    }
}

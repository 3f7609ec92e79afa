//! Persistence seam.
//!
//! The in-memory core is the working copy. A store is only touched after a
//! decision is final: at startup to restore, then once per side effect.

use crate::triage::UnmatchedRecord;
use crate::types::Identity;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Everything needed to rebuild a recognizer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub identities: Vec<Identity>,
    pub unmatched: Vec<UnmatchedRecord>,
}

/// Durable storage for identities and unmatched records.
pub trait TemplateStore {
    type Error: std::error::Error + Send + Sync + 'static;

    fn load(&self) -> Result<Snapshot, Self::Error>;

    /// Insert or replace by name.
    fn save_identity(&self, identity: &Identity) -> Result<(), Self::Error>;

    /// Returns whether a row was deleted.
    fn delete_identity(&self, name: &str) -> Result<bool, Self::Error>;

    /// Insert or replace by id.
    fn save_unmatched(&self, record: &UnmatchedRecord) -> Result<(), Self::Error>;

    fn delete_unmatched(&self, id: Uuid) -> Result<bool, Self::Error>;
}

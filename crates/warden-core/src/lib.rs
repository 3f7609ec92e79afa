//! warden-core — Face identity matching core.
//!
//! Consumes pre-computed, unit-normalized face embeddings and decides who they
//! belong to: temporal smoothing per track, exact or approximate candidate
//! search, adaptive template refresh, and triage of faces nobody knows yet.
//! No I/O happens here; persistence goes through [`store::TemplateStore`].

pub mod aggregator;
pub mod config;
pub mod error;
pub mod index;
pub mod matcher;
pub mod recognizer;
pub mod store;
pub mod template;
pub mod triage;
pub mod types;

pub use aggregator::TrackId;
pub use config::{ConfigError, MatchConfig};
pub use error::{Error, Result};
pub use index::{IndexMode, StrategyKind};
pub use recognizer::{Observation, Pipeline, Recognizer, Status};
pub use store::{Snapshot, TemplateStore};
pub use triage::{UnmatchedOrder, UnmatchedRecord};
pub use types::{Candidate, Decision, Embedding, Identity};

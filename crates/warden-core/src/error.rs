use crate::config::ConfigError;
use thiserror::Error;

/// Typed outcomes surfaced at the core boundary.
///
/// None of these is fatal: callers get them back verbatim and decide what to
/// show an operator.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("an identity named {0:?} is already enrolled")]
    DuplicateName(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("index rebuild failed: {0}")]
    IndexRebuildFailure(String),
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("invalid embedding: {0}")]
    InvalidEmbedding(String),
    #[error("identity name must not be empty")]
    InvalidName,
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),
}

pub type Result<T> = std::result::Result<T, Error>;

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Tolerance for the unit-norm invariant of stored embeddings.
pub const NORM_TOLERANCE: f32 = 1e-4;

/// Face embedding vector (typically 512-dimensional for ArcFace).
///
/// Always L2-normalized: the constructor rescales the raw model output to unit
/// length, so cosine similarity between two embeddings is a plain dot product.
/// Values are immutable once built; a new template is a new `Embedding`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<f32>", into = "Vec<f32>")]
pub struct Embedding {
    values: Vec<f32>,
}

impl Embedding {
    /// Build an embedding from raw descriptor values, normalizing to unit length.
    ///
    /// Rejects empty vectors, non-finite components and the zero vector.
    pub fn new(values: Vec<f32>) -> Result<Self> {
        if values.is_empty() {
            return Err(Error::InvalidEmbedding("empty vector".into()));
        }
        if values.iter().any(|v| !v.is_finite()) {
            return Err(Error::InvalidEmbedding("non-finite component".into()));
        }

        let norm = values
            .iter()
            .map(|&v| f64::from(v) * f64::from(v))
            .sum::<f64>()
            .sqrt();
        if norm <= f64::EPSILON {
            return Err(Error::InvalidEmbedding("zero-norm vector".into()));
        }

        let values = values
            .into_iter()
            .map(|v| (f64::from(v) / norm) as f32)
            .collect();
        Ok(Self { values })
    }

    /// Accept values that are already unit length, bit for bit.
    ///
    /// For reloading persisted templates; anything off the unit sphere by more
    /// than [`NORM_TOLERANCE`] is rejected rather than silently rescaled.
    pub fn from_unit(values: Vec<f32>) -> Result<Self> {
        if values.is_empty() || values.iter().any(|v| !v.is_finite()) {
            return Err(Error::InvalidEmbedding("empty or non-finite vector".into()));
        }
        let embedding = Self { values };
        if !embedding.is_unit() {
            return Err(Error::InvalidEmbedding(format!(
                "expected unit length, got norm {}",
                embedding.norm()
            )));
        }
        Ok(embedding)
    }

    /// Componentwise mean of `embeddings`, re-normalized to unit length.
    pub fn mean(embeddings: &[Embedding]) -> Result<Self> {
        let first = embeddings
            .first()
            .ok_or_else(|| Error::InvalidEmbedding("mean of zero embeddings".into()))?;
        let dim = first.dim();
        // Identical frames average to themselves, bit for bit.
        if embeddings.iter().all(|e| e == first) {
            return Ok(first.clone());
        }

        let mut sum = vec![0.0f64; dim];
        for e in embeddings {
            if e.dim() != dim {
                return Err(Error::DimensionMismatch {
                    expected: dim,
                    actual: e.dim(),
                });
            }
            for (acc, &v) in sum.iter_mut().zip(&e.values) {
                *acc += f64::from(v);
            }
        }

        let n = embeddings.len() as f64;
        Self::new(sum.into_iter().map(|v| (v / n) as f32).collect())
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.values
    }

    /// Cosine similarity in [-1, 1]. Higher = more similar.
    ///
    /// Both sides are unit length, so this is the dot product, clamped against
    /// rounding. Identical embeddings score exactly 1.0.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        if self.values == other.values {
            return 1.0;
        }
        let dot: f32 = self
            .values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| a * b)
            .sum();
        dot.clamp(-1.0, 1.0)
    }

    /// Euclidean length; ≈ 1.0 for every embedding this type hands out.
    pub fn norm(&self) -> f32 {
        self.values.iter().map(|v| v * v).sum::<f32>().sqrt()
    }

    pub fn is_unit(&self) -> bool {
        (self.norm() - 1.0).abs() <= NORM_TOLERANCE
    }
}

impl TryFrom<Vec<f32>> for Embedding {
    type Error = Error;

    fn try_from(values: Vec<f32>) -> Result<Self> {
        Self::new(values)
    }
}

impl From<Embedding> for Vec<f32> {
    fn from(e: Embedding) -> Self {
        e.values
    }
}

/// An enrolled identity and its current reference template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub name: String,
    pub template: Embedding,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Identity {
    pub fn new(name: impl Into<String>, template: Embedding) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            template,
            created_at: now,
            updated_at: now,
        }
    }
}

/// One ranked candidate from a similarity search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub name: String,
    /// Cosine similarity against the query [-1, 1].
    pub score: f32,
}

/// Outcome of feeding one detection into a pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    Matched { name: String, score: f32 },
    Unmatched,
    /// The track's window is still collecting frames.
    Pending,
}

impl Decision {
    pub fn is_matched(&self) -> bool {
        matches!(self, Decision::Matched { .. })
    }
}

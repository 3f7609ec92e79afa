//! Temporal aggregation of per-frame embeddings into one smoothed probe per window.
//!
//! Single-frame embeddings are noisy (pose, blur, lighting). Each face track
//! buffers `window_size` embeddings; once full, their normalized mean is
//! emitted and the window starts over. A full window whose frames cancel to
//! the zero vector has no direction and is discarded. A track that ends early
//! is dropped without a decision. The aggregator is owned by one pipeline and never shared.

use crate::error::{Error, Result};
use crate::types::Embedding;
use std::collections::HashMap;

/// Identifier of a continuous face track, assigned by the external tracker.
pub type TrackId = u64;

/// Result of pushing one embedding into a track's window.
#[derive(Debug, Clone, PartialEq)]
pub enum Aggregate {
    /// Window still collecting: `buffered` of `needed` frames so far.
    Pending { buffered: usize, needed: usize },
    /// Window reached its size; this is the mean of its frames.
    Ready(Embedding),
    /// Window reached its size but its frames averaged to the zero vector.
    /// The frames are dropped and the window starts over.
    Discarded { frames: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowState {
    Collecting { buffered: usize },
}

pub struct TemporalAggregator {
    window_size: usize,
    windows: HashMap<TrackId, Vec<Embedding>>,
}

impl TemporalAggregator {
    pub fn new(window_size: usize) -> Self {
        Self {
            window_size: window_size.max(1),
            windows: HashMap::new(),
        }
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    /// Append `embedding` to `track`'s window.
    ///
    /// A frame whose dimension differs from the frames already buffered is
    /// rejected and the window is left as it was.
    pub fn push(&mut self, track: TrackId, embedding: Embedding) -> Result<Aggregate> {
        let window = self.windows.entry(track).or_default();
        if let Some(first) = window.first() {
            if first.dim() != embedding.dim() {
                return Err(Error::DimensionMismatch {
                    expected: first.dim(),
                    actual: embedding.dim(),
                });
            }
        }

        window.push(embedding);
        if window.len() < self.window_size {
            return Ok(Aggregate::Pending {
                buffered: window.len(),
                needed: self.window_size,
            });
        }

        let frames = std::mem::take(window);
        match Embedding::mean(&frames) {
            Ok(mean) => Ok(Aggregate::Ready(mean)),
            Err(Error::InvalidEmbedding(reason)) => {
                tracing::debug!(track, frames = frames.len(), %reason, "discarded cancelling window");
                Ok(Aggregate::Discarded {
                    frames: frames.len(),
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Drop `track`'s window without a decision. Returns how many frames were discarded.
    pub fn abandon(&mut self, track: TrackId) -> Option<usize> {
        let frames = self.windows.remove(&track)?;
        tracing::debug!(track, frames = frames.len(), "abandoned partial window");
        Some(frames.len())
    }

    pub fn state(&self, track: TrackId) -> Option<WindowState> {
        self.windows
            .get(&track)
            .map(|w| WindowState::Collecting { buffered: w.len() })
    }

    pub fn active_tracks(&self) -> usize {
        self.windows.len()
    }
}

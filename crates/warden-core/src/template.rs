//! Adaptive template refresh.
//!
//! A confirmed high-confidence match nudges the identity's template toward the
//! observed embedding: `template' = normalize((1 - α)·template + α·observed)`.
//! Only every `every`-th match scoring above the high-confidence threshold of an identity triggers a
//! refresh, which bounds how fast any run of frames can drag a template.

use crate::config::MatchConfig;
use crate::index::CandidateIndex;
use crate::types::{Embedding, Identity};
use parking_lot::Mutex;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy)]
pub struct AdaptivePolicy {
    pub enabled: bool,
    /// Only scores strictly above this count toward a refresh.
    pub high_confidence: f32,
    pub alpha: f32,
    pub every: u32,
}

impl AdaptivePolicy {
    pub fn from_config(config: &MatchConfig) -> Self {
        Self {
            enabled: config.adaptive_enabled,
            high_confidence: config.high_confidence_threshold,
            alpha: config.adaptive_alpha,
            every: config.adaptive_every.max(1),
        }
    }
}

/// Blend `observed` into `template` by step `alpha` and re-normalize.
///
/// `None` only when the blend cancels out to the zero vector.
pub fn blend(template: &Embedding, observed: &Embedding, alpha: f32) -> Option<Embedding> {
    let mixed = template
        .as_slice()
        .iter()
        .zip(observed.as_slice())
        .map(|(&t, &o)| t * (1.0 - alpha) + o * alpha)
        .collect();
    Embedding::new(mixed).ok()
}

/// Per-identity refresh counters plus the refresh policy.
pub struct TemplateUpdater {
    policy: AdaptivePolicy,
    confirmed: Mutex<HashMap<String, u32>>,
}

impl TemplateUpdater {
    pub fn new(policy: AdaptivePolicy) -> Self {
        Self {
            policy,
            confirmed: Mutex::new(HashMap::new()),
        }
    }

    /// Count a match of `name` at `score` and refresh its template when due.
    ///
    /// Returns the identity with its refreshed template if one was written.
    pub fn maybe_update(
        &self,
        index: &CandidateIndex,
        name: &str,
        observed: &Embedding,
        score: f32,
    ) -> Option<Identity> {
        if !self.policy.enabled || score <= self.policy.high_confidence {
            return None;
        }

        let due = {
            let mut confirmed = self.confirmed.lock();
            let count = confirmed.entry(name.to_string()).or_insert(0);
            *count += 1;
            if *count >= self.policy.every {
                *count = 0;
                true
            } else {
                false
            }
        };
        if !due {
            return None;
        }

        let alpha = self.policy.alpha;
        let updated = index.update_template(name, |identity| {
            blend(&identity.template, observed, alpha)
        })?;

        debug_assert!(
            updated.template.is_unit(),
            "template for {name:?} left unit norm after refresh: {}",
            updated.template.norm()
        );
        tracing::debug!(name, score, "adaptive template refresh");
        Some(updated)
    }

    /// Drop the counter of a removed identity.
    pub fn forget(&self, name: &str) {
        self.confirmed.lock().remove(name);
    }

    pub fn pending_count(&self, name: &str) -> u32 {
        self.confirmed.lock().get(name).copied().unwrap_or(0)
    }
}

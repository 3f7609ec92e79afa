//! Similarity engine: rank a probe embedding against a set of templates.
//!
//! Pure functions, no state. Every lookup strategy in [`crate::index`] ranks
//! through [`rank`] so ordering and tie-breaks are identical across strategies.

use crate::types::{Candidate, Decision, Embedding};
use std::cmp::Ordering;

/// Descending by score; equal scores fall back to ascending name.
pub fn candidate_order(a: &Candidate, b: &Candidate) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| a.name.cmp(&b.name))
}

/// Score `probe` against every candidate template and return them ranked.
pub fn rank<'a, I>(probe: &Embedding, candidates: I) -> Vec<Candidate>
where
    I: IntoIterator<Item = (&'a str, &'a Embedding)>,
{
    let mut ranked: Vec<Candidate> = candidates
        .into_iter()
        .map(|(name, template)| Candidate {
            name: name.to_string(),
            score: probe.similarity(template),
        })
        .collect();
    ranked.sort_by(candidate_order);
    ranked
}

/// Top-ranked candidate if it clears `threshold`, otherwise `Unmatched`.
///
/// Never returns [`Decision::Pending`].
pub fn best_match<'a, I>(probe: &Embedding, candidates: I, threshold: f32) -> Decision
where
    I: IntoIterator<Item = (&'a str, &'a Embedding)>,
{
    decide(&rank(probe, candidates), threshold)
}

/// Threshold an already-ranked candidate list.
pub fn decide(ranked: &[Candidate], threshold: f32) -> Decision {
    match ranked.first() {
        Some(top) if top.score >= threshold => Decision::Matched {
            name: top.name.clone(),
            score: top.score,
        },
        _ => Decision::Unmatched,
    }
}

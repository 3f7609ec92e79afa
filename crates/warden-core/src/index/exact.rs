//! Exact lookup: linear scan over every template.

use super::{SearchStrategy, StrategyKind};
use crate::matcher;
use crate::types::{Candidate, Embedding};

/// Brute-force inner-product scan. O(n·d) per query, always exact.
pub struct ExactSearch {
    /// Sorted by name.
    rows: Vec<(String, Embedding)>,
}

impl ExactSearch {
    pub fn build(mut rows: Vec<(String, Embedding)>) -> Self {
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        Self { rows }
    }
}

impl SearchStrategy for ExactSearch {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Exact
    }

    fn search(&self, probe: &Embedding, k: usize) -> Vec<Candidate> {
        let mut ranked = matcher::rank(probe, self.rows.iter().map(|(n, e)| (n.as_str(), e)));
        ranked.truncate(k);
        ranked
    }

    fn refresh(&mut self, name: &str, template: &Embedding) {
        if let Ok(pos) = self.rows.binary_search_by(|(n, _)| n.as_str().cmp(name)) {
            self.rows[pos].1 = template.clone();
        }
    }
}

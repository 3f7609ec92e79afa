//! Candidate index: the enrolled identities and the lookup structure over them.
//!
//! Two interchangeable strategies sit behind [`SearchStrategy`]: an exact
//! linear scan for small galleries and an inverted-file approximate index once
//! the gallery reaches the configured switchover size. The strategy is chosen
//! when membership changes, never per query, and every structural change
//! rebuilds it before the write lock is released, so a reader can never see a
//! stale index. If a rebuild fails the index drops into a degraded mode in
//! which every query returns no candidates.

pub mod exact;
pub mod ivf;

use crate::config::MatchConfig;
use crate::error::{Error, Result};
use crate::types::{Candidate, Embedding, Identity};
use chrono::Utc;
use exact::ExactSearch;
use ivf::{IvfParams, IvfSearch};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A lookup structure over a fixed snapshot of templates.
pub trait SearchStrategy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    /// Top-`k` candidates ranked by [`crate::matcher::candidate_order`].
    fn search(&self, probe: &Embedding, k: usize) -> Vec<Candidate>;

    /// Swap one member's template in place. Membership is unchanged.
    fn refresh(&mut self, name: &str, template: &Embedding);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    Exact,
    Approximate,
}

/// What the index is currently serving queries with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexMode {
    Exact,
    Approximate,
    /// Last rebuild failed; queries return nothing until the next good rebuild.
    Degraded,
}

/// Strategy selection and approximate-index parameters.
#[derive(Debug, Clone, Copy)]
pub struct IndexPolicy {
    /// Gallery size at which the approximate strategy takes over.
    pub switchover: usize,
    pub ivf: IvfParams,
}

impl IndexPolicy {
    pub fn from_config(config: &MatchConfig) -> Self {
        Self {
            switchover: config.ann_switchover,
            ivf: IvfParams {
                probes: config.ann_probes,
                iterations: config.ann_iterations,
                seed: config.ann_seed,
            },
        }
    }

    fn select(&self, rows: Vec<(String, Embedding)>) -> Result<Box<dyn SearchStrategy>> {
        if rows.len() >= self.switchover {
            Ok(Box::new(IvfSearch::build(rows, self.ivf)?))
        } else {
            Ok(Box::new(ExactSearch::build(rows)))
        }
    }
}

struct IndexState {
    identities: BTreeMap<String, Identity>,
    /// Fixed by the first template; released when the index empties.
    dimension: Option<usize>,
    strategy: Option<Box<dyn SearchStrategy>>,
}

/// Shared, internally synchronized set of enrolled identities.
///
/// Queries take a read lock and run concurrently. Enrollment, removal,
/// template refreshes and rebuilds take the write lock, so a rebuild blocks
/// new queries until it is done.
pub struct CandidateIndex {
    policy: IndexPolicy,
    state: RwLock<IndexState>,
}

impl CandidateIndex {
    pub fn new(policy: IndexPolicy) -> Self {
        let mut state = IndexState {
            identities: BTreeMap::new(),
            dimension: None,
            strategy: None,
        };
        let _ = rebuild_locked(&policy, &mut state);
        Self {
            policy,
            state: RwLock::new(state),
        }
    }

    /// Build an index over previously persisted identities in one rebuild.
    pub fn with_identities(policy: IndexPolicy, identities: Vec<Identity>) -> Result<Self> {
        let mut state = IndexState {
            identities: BTreeMap::new(),
            dimension: None,
            strategy: None,
        };
        for identity in identities {
            check_insert(&state, &identity)?;
            state.dimension = Some(identity.template.dim());
            state.identities.insert(identity.name.clone(), identity);
        }
        let _ = rebuild_locked(&policy, &mut state);
        Ok(Self {
            policy,
            state: RwLock::new(state),
        })
    }

    pub fn add(&self, identity: Identity) -> Result<()> {
        let mut state = self.state.write();
        check_insert(&state, &identity)?;

        tracing::info!(name = %identity.name, "enrolling identity");
        state.dimension = Some(identity.template.dim());
        state.identities.insert(identity.name.clone(), identity);
        // A failed rebuild leaves the index degraded; membership still changed.
        let _ = rebuild_locked(&self.policy, &mut state);
        Ok(())
    }

    pub fn remove(&self, name: &str) -> Result<Identity> {
        let mut state = self.state.write();
        let removed = state
            .identities
            .remove(name)
            .ok_or_else(|| Error::NotFound(format!("identity {name:?}")))?;

        tracing::info!(name, "removed identity");
        if state.identities.is_empty() {
            state.dimension = None;
        }
        let _ = rebuild_locked(&self.policy, &mut state);
        Ok(removed)
    }

    /// Swap the identity named `identity.name` for `identity` in one step.
    ///
    /// The new template must match the gallery dimension unless it replaces
    /// the only identity. On error the enrolled identity is left untouched.
    /// Returns the identity that was replaced.
    pub fn replace(&self, identity: Identity) -> Result<Identity> {
        let mut state = self.state.write();
        if !state.identities.contains_key(&identity.name) {
            return Err(Error::NotFound(format!("identity {:?}", identity.name)));
        }
        if state.identities.len() > 1 {
            if let Some(expected) = state.dimension {
                let actual = identity.template.dim();
                if actual != expected {
                    return Err(Error::DimensionMismatch { expected, actual });
                }
            }
        }

        tracing::info!(name = %identity.name, "replacing identity template");
        state.dimension = Some(identity.template.dim());
        let name = identity.name.clone();
        let previous = state.identities.insert(name.clone(), identity);
        let _ = rebuild_locked(&self.policy, &mut state);
        previous.ok_or_else(|| Error::NotFound(format!("identity {name:?}")))
    }

    /// Top-`k` candidates for `probe`. Empty when degraded or on a dimension mismatch.
    pub fn query(&self, probe: &Embedding, k: usize) -> Vec<Candidate> {
        let state = self.state.read();
        if state.dimension.is_some_and(|d| d != probe.dim()) {
            return Vec::new();
        }
        match &state.strategy {
            Some(strategy) => strategy.search(probe, k),
            None => Vec::new(),
        }
    }

    /// Force a rebuild of the active strategy from the current templates.
    pub fn rebuild(&self) -> Result<StrategyKind> {
        let mut state = self.state.write();
        rebuild_locked(&self.policy, &mut state)
    }

    /// Apply `update` to one identity's template under the write lock.
    ///
    /// `update` sees the current identity and returns the replacement template,
    /// or `None` to leave it untouched. Returns the updated identity.
    pub fn update_template<F>(&self, name: &str, update: F) -> Option<Identity>
    where
        F: FnOnce(&Identity) -> Option<Embedding>,
    {
        let mut state = self.state.write();
        let state = &mut *state;
        let identity = state.identities.get_mut(name)?;
        let template = update(identity)?;
        if template.dim() != identity.template.dim() {
            return None;
        }

        identity.template = template;
        identity.updated_at = Utc::now();
        if let Some(strategy) = state.strategy.as_mut() {
            strategy.refresh(name, &identity.template);
        }
        Some(identity.clone())
    }

    pub fn get(&self, name: &str) -> Option<Identity> {
        self.state.read().identities.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.state.read().identities.contains_key(name)
    }

    /// All identities, ordered by name.
    pub fn identities(&self) -> Vec<Identity> {
        self.state.read().identities.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.state.read().identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dimension(&self) -> Option<usize> {
        self.state.read().dimension
    }

    pub fn mode(&self) -> IndexMode {
        match self.state.read().strategy.as_ref().map(|s| s.kind()) {
            Some(StrategyKind::Exact) => IndexMode::Exact,
            Some(StrategyKind::Approximate) => IndexMode::Approximate,
            None => IndexMode::Degraded,
        }
    }
}

fn check_insert(state: &IndexState, identity: &Identity) -> Result<()> {
    if state.identities.contains_key(&identity.name) {
        return Err(Error::DuplicateName(identity.name.clone()));
    }
    if let Some(expected) = state.dimension {
        let actual = identity.template.dim();
        if actual != expected {
            return Err(Error::DimensionMismatch { expected, actual });
        }
    }
    Ok(())
}

fn rebuild_locked(policy: &IndexPolicy, state: &mut IndexState) -> Result<StrategyKind> {
    let previous = state.strategy.as_ref().map(|s| s.kind());
    let rows = state
        .identities
        .values()
        .map(|i| (i.name.clone(), i.template.clone()))
        .collect();

    match policy.select(rows) {
        Ok(strategy) => {
            let kind = strategy.kind();
            if previous != Some(kind) {
                tracing::info!(
                    strategy = ?kind,
                    identities = state.identities.len(),
                    "candidate index strategy selected"
                );
            }
            state.strategy = Some(strategy);
            Ok(kind)
        }
        Err(e) => {
            tracing::error!(
                error = %e,
                identities = state.identities.len(),
                "candidate index rebuild failed; all queries will be unmatched"
            );
            state.strategy = None;
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(switchover: usize) -> IndexPolicy {
        IndexPolicy {
            switchover,
            ivf: IvfParams {
                probes: 2,
                iterations: 5,
                seed: 1,
            },
        }
    }

    fn axis(dim: usize, i: usize) -> Embedding {
        let mut v = vec![0.01; dim];
        v[i] = 1.0;
        Embedding::new(v).unwrap()
    }

    #[test]
    fn test_add_and_query() {
        let index = CandidateIndex::new(policy(50));
        index.add(Identity::new("alice", axis(4, 0))).unwrap();
        index.add(Identity::new("bob", axis(4, 1))).unwrap();

        let top = index.query(&axis(4, 0), 1);
        assert_eq!(top[0].name, "alice");
        assert_eq!(top[0].score, 1.0);
        assert_eq!(index.mode(), IndexMode::Exact);
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let index = CandidateIndex::new(policy(50));
        index.add(Identity::new("alice", axis(4, 0))).unwrap();
        let err = index.add(Identity::new("alice", axis(4, 1))).unwrap_err();
        assert_eq!(err, Error::DuplicateName("alice".into()));
        // Existing template untouched.
        assert_eq!(index.get("alice").unwrap().template, axis(4, 0));
    }

    #[test]
    fn test_replace_swaps_template() {
        let index = CandidateIndex::new(policy(50));
        index.add(Identity::new("alice", axis(4, 0))).unwrap();
        index.add(Identity::new("bob", axis(4, 1))).unwrap();

        let previous = index.replace(Identity::new("alice", axis(4, 2))).unwrap();
        assert_eq!(previous.template, axis(4, 0));
        assert_eq!(index.get("alice").unwrap().template, axis(4, 2));
        assert_eq!(index.query(&axis(4, 2), 1)[0].name, "alice");
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn test_rejected_replace_keeps_original() {
        let index = CandidateIndex::new(policy(50));
        index.add(Identity::new("alice", axis(3, 0))).unwrap();
        index.add(Identity::new("bob", axis(3, 1))).unwrap();

        assert_eq!(
            index.replace(Identity::new("alice", axis(2, 0))),
            Err(Error::DimensionMismatch { expected: 3, actual: 2 })
        );
        assert_eq!(index.get("alice").unwrap().template, axis(3, 0));
        assert_eq!(index.query(&axis(3, 0), 1)[0].name, "alice");
        assert_eq!(index.dimension(), Some(3));

        assert!(matches!(
            index.replace(Identity::new("carol", axis(3, 2))),
            Err(Error::NotFound(_))
        ));
        assert!(!index.contains("carol"));
    }

    #[test]
    fn test_replace_only_identity_may_change_dimension() {
        let index = CandidateIndex::new(policy(50));
        index.add(Identity::new("alice", axis(3, 0))).unwrap();
        index.replace(Identity::new("alice", axis(2, 1))).unwrap();
        assert_eq!(index.dimension(), Some(2));
    }

    #[test]
    fn test_dimension_fixed_by_first_template() {
        let index = CandidateIndex::new(policy(50));
        index.add(Identity::new("alice", axis(4, 0))).unwrap();
        assert_eq!(
            index.add(Identity::new("bob", axis(3, 0))),
            Err(Error::DimensionMismatch { expected: 4, actual: 3 })
        );
        assert!(index.query(&axis(3, 0), 1).is_empty());

        index.remove("alice").unwrap();
        assert_eq!(index.dimension(), None);
        index.add(Identity::new("bob", axis(3, 0))).unwrap();
    }

    #[test]
    fn test_remove_missing_is_not_found() {
        let index = CandidateIndex::new(policy(50));
        index.add(Identity::new("alice", axis(4, 0))).unwrap();
        index.remove("alice").unwrap();
        assert!(matches!(index.remove("alice"), Err(Error::NotFound(_))));
        assert!(index.query(&axis(4, 0), 1).is_empty());
    }

    #[test]
    fn test_switches_strategy_at_threshold() {
        let index = CandidateIndex::new(policy(4));
        for i in 0..3 {
            index.add(Identity::new(format!("p{i}"), axis(8, i))).unwrap();
        }
        assert_eq!(index.mode(), IndexMode::Exact);

        index.add(Identity::new("p3", axis(8, 3))).unwrap();
        assert_eq!(index.mode(), IndexMode::Approximate);
        assert_eq!(index.query(&axis(8, 3), 1)[0].name, "p3");

        index.remove("p0").unwrap();
        assert_eq!(index.mode(), IndexMode::Exact);
    }

    #[test]
    fn test_straddling_switchover_agrees_on_enrolled_template() {
        let exact = CandidateIndex::new(policy(100));
        let approx = CandidateIndex::new(policy(1));
        for i in 0..8 {
            exact.add(Identity::new(format!("p{i}"), axis(8, i))).unwrap();
            approx.add(Identity::new(format!("p{i}"), axis(8, i))).unwrap();
        }
        assert_eq!(exact.mode(), IndexMode::Exact);
        assert_eq!(approx.mode(), IndexMode::Approximate);
        for i in 0..8 {
            assert_eq!(exact.query(&axis(8, i), 1), approx.query(&axis(8, i), 1));
        }
    }

    #[test]
    fn test_failed_rebuild_degrades_to_no_candidates() {
        // With switchover 0 an empty gallery must still build an IVF index, which fails.
        let index = CandidateIndex::new(policy(0));
        assert_eq!(index.mode(), IndexMode::Degraded);
        assert!(index.query(&axis(4, 0), 1).is_empty());
        assert!(matches!(index.rebuild(), Err(Error::IndexRebuildFailure(_))));

        index.add(Identity::new("alice", axis(4, 0))).unwrap();
        assert_eq!(index.mode(), IndexMode::Approximate);
        assert_eq!(index.query(&axis(4, 0), 1)[0].name, "alice");
    }

    #[test]
    fn test_update_template_refreshes_strategy() {
        for switchover in [50, 1] {
            let index = CandidateIndex::new(policy(switchover));
            index.add(Identity::new("alice", axis(4, 0))).unwrap();
            index.add(Identity::new("bob", axis(4, 1))).unwrap();

            let updated = index
                .update_template("alice", |_| Some(axis(4, 2)))
                .unwrap();
            assert_eq!(updated.template, axis(4, 2));
            assert!(updated.updated_at >= updated.created_at);
            assert_eq!(index.query(&axis(4, 2), 1)[0].name, "alice");

            assert!(index.update_template("carol", |_| Some(axis(4, 0))).is_none());
            assert!(index.update_template("alice", |_| None).is_none());
        }
    }

    #[test]
    fn test_with_identities_rejects_duplicates() {
        let result = CandidateIndex::with_identities(
            policy(50),
            vec![
                Identity::new("alice", axis(4, 0)),
                Identity::new("alice", axis(4, 1)),
            ],
        );
        assert!(matches!(result, Err(Error::DuplicateName(_))));
    }
}

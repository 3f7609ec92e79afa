//! Recognizer facade and per-source pipelines.
//!
//! A [`Recognizer`] owns the shared state: the candidate index, the adaptive
//! template counters and the unmatched triage. It is constructed explicitly
//! and passed around behind an `Arc`, so independent recognizers (one per
//! camera group, one per test) never share anything.
//!
//! A [`Pipeline`] is one sequential detection flow. It owns its temporal
//! windows outright and only touches shared state once a window is full.

use crate::aggregator::{Aggregate, TemporalAggregator, TrackId};
use crate::config::MatchConfig;
use crate::error::{Error, Result};
use crate::index::{CandidateIndex, IndexMode, IndexPolicy, StrategyKind};
use crate::matcher;
use crate::store::Snapshot;
use crate::template::{AdaptivePolicy, TemplateUpdater};
use crate::triage::{Triage, UnmatchedOrder, UnmatchedRecord};
use crate::types::{Decision, Embedding, Identity};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

/// A decision plus the shared-state side effects it caused.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Observation {
    pub decision: Decision,
    /// Top candidate score, if any candidate was returned.
    pub best_score: Option<f32>,
    /// Set when this match refreshed the identity's template.
    pub template_update: Option<Identity>,
    /// Set when this window was routed to triage.
    pub unmatched: Option<UnmatchedRecord>,
}

impl Observation {
    fn pending() -> Self {
        Self {
            decision: Decision::Pending,
            best_score: None,
            template_update: None,
            unmatched: None,
        }
    }

    /// A full window with no usable mean: unmatched, never triaged.
    fn discarded() -> Self {
        Self {
            decision: Decision::Unmatched,
            ..Self::pending()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Status {
    pub identities: usize,
    pub dimension: Option<usize>,
    pub mode: IndexMode,
    pub unmatched: usize,
    pub window_size: usize,
}

pub struct Recognizer {
    config: MatchConfig,
    index: CandidateIndex,
    templates: TemplateUpdater,
    triage: Triage,
}

impl Recognizer {
    pub fn new(config: MatchConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            index: CandidateIndex::new(IndexPolicy::from_config(&config)),
            templates: TemplateUpdater::new(AdaptivePolicy::from_config(&config)),
            triage: Triage::new(config.dedup_threshold),
            config,
        })
    }

    /// Rebuild a recognizer from persisted state.
    ///
    /// Every unmatched record must carry a running mean as long as its
    /// representative.
    pub fn restore(config: MatchConfig, snapshot: Snapshot) -> Result<Self> {
        config.validate()?;
        for record in &snapshot.unmatched {
            if record.mean.len() != record.representative.dim() {
                return Err(Error::DimensionMismatch {
                    expected: record.representative.dim(),
                    actual: record.mean.len(),
                });
            }
        }
        let identities = snapshot.identities.len();
        let unmatched = snapshot.unmatched.len();
        let index =
            CandidateIndex::with_identities(IndexPolicy::from_config(&config), snapshot.identities)?;

        tracing::info!(identities, unmatched, mode = ?index.mode(), "restored recognizer state");
        Ok(Self {
            index,
            templates: TemplateUpdater::new(AdaptivePolicy::from_config(&config)),
            triage: Triage::with_records(config.dedup_threshold, snapshot.unmatched),
            config,
        })
    }

    pub fn config(&self) -> &MatchConfig {
        &self.config
    }

    /// A fresh detection flow over this recognizer.
    pub fn pipeline(self: &Arc<Self>) -> Pipeline {
        Pipeline {
            recognizer: Arc::clone(self),
            aggregator: TemporalAggregator::new(self.config.window_size),
        }
    }

    /// Decide one aggregated probe and apply the resulting side effects.
    pub fn match_embedding(&self, probe: &Embedding) -> Observation {
        let candidates = self.index.query(probe, 1);
        let best_score = candidates.first().map(|c| c.score);
        let decision = matcher::decide(&candidates, self.config.match_threshold);

        let mut observation = Observation {
            decision,
            best_score,
            template_update: None,
            unmatched: None,
        };
        match &observation.decision {
            Decision::Matched { name, score } => {
                tracing::debug!(name = %name, score, "matched");
                observation.template_update =
                    self.templates.maybe_update(&self.index, name, probe, *score);
            }
            Decision::Unmatched => {
                tracing::debug!(best_score = ?best_score, "unmatched");
                observation.unmatched = Some(self.triage.record(probe.clone()));
            }
            Decision::Pending => {}
        }
        observation
    }

    pub fn enroll(&self, name: &str, embedding: Embedding) -> Result<Identity> {
        let name = validate_name(name)?;
        let identity = Identity::new(name, embedding);
        self.index.add(identity.clone())?;
        Ok(identity)
    }

    /// Enroll `name` afresh with `embedding`, replacing its template atomically.
    ///
    /// Fails with `NotFound` if `name` is not enrolled. A rejected embedding
    /// leaves the enrolled identity as it was.
    pub fn replace(&self, name: &str, embedding: Embedding) -> Result<Identity> {
        let name = validate_name(name)?;
        let identity = Identity::new(name, embedding);
        self.index.replace(identity.clone())?;
        self.templates.forget(name);
        Ok(identity)
    }

    pub fn remove(&self, name: &str) -> Result<Identity> {
        let removed = self.index.remove(name)?;
        self.templates.forget(name);
        Ok(removed)
    }

    pub fn identity(&self, name: &str) -> Option<Identity> {
        self.index.get(name)
    }

    pub fn identities(&self) -> Vec<Identity> {
        self.index.identities()
    }

    pub fn list_unmatched(&self, order: UnmatchedOrder) -> Vec<UnmatchedRecord> {
        self.triage.list(order)
    }

    pub fn promote(&self, id: Uuid, name: &str) -> Result<Identity> {
        let name = validate_name(name)?;
        self.triage.promote(id, name, &self.index)
    }

    pub fn dismiss(&self, id: Uuid) -> Result<UnmatchedRecord> {
        self.triage.dismiss(id)
    }

    pub fn similar_unmatched(
        &self,
        id: Uuid,
        threshold: f32,
        limit: usize,
    ) -> Result<Vec<(UnmatchedRecord, f32)>> {
        self.triage.similar(id, threshold, limit)
    }

    pub fn rebuild_index(&self) -> Result<StrategyKind> {
        self.index.rebuild()
    }

    pub fn status(&self) -> Status {
        Status {
            identities: self.index.len(),
            dimension: self.index.dimension(),
            mode: self.index.mode(),
            unmatched: self.triage.len(),
            window_size: self.config.window_size,
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            identities: self.index.identities(),
            unmatched: self.triage.list(UnmatchedOrder::OccurrenceDesc),
        }
    }
}

fn validate_name(name: &str) -> Result<&str> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(Error::InvalidName);
    }
    Ok(trimmed)
}

/// One sequential detection flow (one camera, one tracker).
pub struct Pipeline {
    recognizer: Arc<Recognizer>,
    aggregator: TemporalAggregator,
}

impl Pipeline {
    pub fn recognizer(&self) -> &Arc<Recognizer> {
        &self.recognizer
    }

    /// Feed one frame of `face_id`'s track.
    pub fn decide(&mut self, face_id: TrackId, embedding: Embedding) -> Result<Decision> {
        self.observe(face_id, embedding).map(|o| o.decision)
    }

    /// Like [`Pipeline::decide`], also reporting the side effects of the decision.
    ///
    /// A full window whose frames cancel out is reported as `Unmatched`
    /// without a triage record.
    pub fn observe(&mut self, face_id: TrackId, embedding: Embedding) -> Result<Observation> {
        if let Some(expected) = self.recognizer.index.dimension() {
            if embedding.dim() != expected {
                return Err(Error::DimensionMismatch {
                    expected,
                    actual: embedding.dim(),
                });
            }
        }

        match self.aggregator.push(face_id, embedding)? {
            Aggregate::Pending { .. } => Ok(Observation::pending()),
            Aggregate::Ready(probe) => Ok(self.recognizer.match_embedding(&probe)),
            Aggregate::Discarded { .. } => Ok(Observation::discarded()),
        }
    }

    /// The tracker lost `face_id`: drop its partial window without a decision.
    pub fn end_track(&mut self, face_id: TrackId) -> Option<usize> {
        self.aggregator.abandon(face_id)
    }

    pub fn active_tracks(&self) -> usize {
        self.aggregator.active_tracks()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emb(values: &[f32]) -> Embedding {
        Embedding::new(values.to_vec()).unwrap()
    }

    fn config() -> MatchConfig {
        MatchConfig {
            window_size: 2,
            ..MatchConfig::default()
        }
    }

    fn recognizer() -> Arc<Recognizer> {
        Arc::new(Recognizer::new(config()).unwrap())
    }

    #[test]
    fn test_invalid_config_rejected() {
        let bad = MatchConfig {
            dedup_threshold: 0.5,
            match_threshold: 0.4,
            ..MatchConfig::default()
        };
        assert!(matches!(Recognizer::new(bad), Err(Error::Config(_))));
    }

    #[test]
    fn test_enroll_validates_name() {
        let r = recognizer();
        assert_eq!(r.enroll("   ", emb(&[1.0, 0.0])), Err(Error::InvalidName));
        let alice = r.enroll("  alice ", emb(&[1.0, 0.0])).unwrap();
        assert_eq!(alice.name, "alice");
        assert!(matches!(
            r.enroll("alice", emb(&[0.0, 1.0])),
            Err(Error::DuplicateName(_))
        ));
    }

    #[test]
    fn test_pipeline_pending_then_matched() {
        let r = recognizer();
        r.enroll("alice", emb(&[1.0, 0.0, 0.0])).unwrap();
        let mut pipeline = r.pipeline();

        assert_eq!(pipeline.decide(1, emb(&[1.0, 0.0, 0.0])).unwrap(), Decision::Pending);
        assert_eq!(
            pipeline.decide(1, emb(&[1.0, 0.0, 0.0])).unwrap(),
            Decision::Matched {
                name: "alice".into(),
                score: 1.0
            }
        );
    }

    #[test]
    fn test_pipeline_rejects_wrong_dimension() {
        let r = recognizer();
        r.enroll("alice", emb(&[1.0, 0.0, 0.0])).unwrap();
        let mut pipeline = r.pipeline();
        assert_eq!(
            pipeline.decide(1, emb(&[1.0, 0.0])),
            Err(Error::DimensionMismatch {
                expected: 3,
                actual: 2
            })
        );
        assert_eq!(pipeline.active_tracks(), 0);
    }

    #[test]
    fn test_unmatched_goes_to_triage() {
        let r = recognizer();
        r.enroll("alice", emb(&[1.0, 0.0, 0.0])).unwrap();
        let mut pipeline = r.pipeline();

        pipeline.observe(4, emb(&[0.0, 0.0, 1.0])).unwrap();
        let observation = pipeline.observe(4, emb(&[0.0, 0.0, 1.0])).unwrap();
        assert_eq!(observation.decision, Decision::Unmatched);
        let record = observation.unmatched.unwrap();
        assert_eq!(record.occurrences, 1);
        assert_eq!(r.status().unmatched, 1);
    }

    #[test]
    fn test_empty_gallery_is_unmatched() {
        let r = recognizer();
        let mut pipeline = r.pipeline();
        pipeline.decide(1, emb(&[0.6, 0.8])).unwrap();
        assert_eq!(pipeline.decide(1, emb(&[0.6, 0.8])).unwrap(), Decision::Unmatched);
    }

    #[test]
    fn test_adaptive_refresh_reported() {
        let r = Arc::new(
            Recognizer::new(MatchConfig {
                window_size: 1,
                adaptive_every: 2,
                ..MatchConfig::default()
            })
            .unwrap(),
        );
        r.enroll("alice", emb(&[1.0, 0.0, 0.0])).unwrap();
        let mut pipeline = r.pipeline();
        let observed = emb(&[0.9, 0.3, 0.0]);

        let first = pipeline.observe(1, observed.clone()).unwrap();
        assert!(first.decision.is_matched());
        assert!(first.template_update.is_none());

        let second = pipeline.observe(1, observed).unwrap();
        let updated = second.template_update.unwrap();
        assert!(updated.template.is_unit());
        assert_eq!(r.identity("alice").unwrap().template, updated.template);
    }

    #[test]
    fn test_cancelling_window_is_unmatched_without_triage() {
        let r = recognizer();
        r.enroll("alice", emb(&[1.0, 0.0, 0.0])).unwrap();
        let mut pipeline = r.pipeline();

        pipeline.observe(2, emb(&[0.0, 1.0, 0.0])).unwrap();
        let observation = pipeline.observe(2, emb(&[0.0, -1.0, 0.0])).unwrap();
        assert_eq!(observation.decision, Decision::Unmatched);
        assert_eq!(observation.best_score, None);
        assert!(observation.unmatched.is_none());
        assert_eq!(r.status().unmatched, 0);

        // The track keeps going with a fresh window.
        assert_eq!(pipeline.decide(2, emb(&[1.0, 0.0, 0.0])).unwrap(), Decision::Pending);
    }

    #[test]
    fn test_replace_swaps_template_and_resets_counter() {
        let r = Arc::new(
            Recognizer::new(MatchConfig {
                window_size: 1,
                adaptive_every: 2,
                ..MatchConfig::default()
            })
            .unwrap(),
        );
        let original = r.enroll("alice", emb(&[1.0, 0.0, 0.0])).unwrap();
        r.pipeline().observe(1, emb(&[0.9, 0.3, 0.0])).unwrap();
        assert_eq!(r.templates.pending_count("alice"), 1);

        let replaced = r.replace("alice", emb(&[0.0, 1.0, 0.0])).unwrap();
        assert_eq!(r.identity("alice").unwrap(), replaced);
        assert!(replaced.created_at >= original.created_at);
        assert_eq!(r.templates.pending_count("alice"), 0);
        assert!(matches!(
            r.replace("bob", emb(&[0.0, 0.0, 1.0])),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_rejected_replace_keeps_enrolled_template() {
        let r = recognizer();
        r.enroll("alice", emb(&[1.0, 0.0, 0.0])).unwrap();
        r.enroll("bob", emb(&[0.0, 1.0, 0.0])).unwrap();

        assert_eq!(
            r.replace("alice", emb(&[1.0, 0.0])),
            Err(Error::DimensionMismatch {
                expected: 3,
                actual: 2
            })
        );
        assert_eq!(r.identity("alice").unwrap().template, emb(&[1.0, 0.0, 0.0]));
        assert_eq!(r.status().identities, 2);
    }

    #[test]
    fn test_restore_rejects_truncated_running_mean() {
        let mut record = UnmatchedRecord::new(emb(&[0.0, 0.0, 1.0]));
        record.mean.truncate(2);
        let snapshot = Snapshot {
            identities: Vec::new(),
            unmatched: vec![record],
        };
        assert_eq!(
            Recognizer::restore(config(), snapshot).err(),
            Some(Error::DimensionMismatch {
                expected: 3,
                actual: 2
            })
        );
    }

    #[test]
    fn test_remove_is_not_found_twice() {
        let r = recognizer();
        r.enroll("alice", emb(&[1.0, 0.0])).unwrap();
        r.remove("alice").unwrap();
        assert!(matches!(r.remove("alice"), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_snapshot_restore() {
        let r = recognizer();
        r.enroll("alice", emb(&[1.0, 0.0, 0.0])).unwrap();
        let mut pipeline = r.pipeline();
        pipeline.decide(9, emb(&[0.0, 1.0, 0.0])).unwrap();
        pipeline.decide(9, emb(&[0.0, 1.0, 0.0])).unwrap();

        let snapshot = r.snapshot();
        let restored = Recognizer::restore(config(), snapshot.clone()).unwrap();
        assert_eq!(restored.snapshot(), snapshot);
        assert_eq!(restored.status(), r.status());
    }

    #[test]
    fn test_status() {
        let r = recognizer();
        let status = r.status();
        assert_eq!(status.identities, 0);
        assert_eq!(status.dimension, None);
        assert_eq!(status.mode, IndexMode::Exact);
        assert_eq!(status.window_size, 2);

        r.enroll("alice", emb(&[1.0, 0.0])).unwrap();
        assert_eq!(r.status().dimension, Some(2));
        assert_eq!(r.rebuild_index(), Ok(StrategyKind::Exact));
    }
}

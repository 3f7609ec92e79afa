//! Unmatched-detection triage.
//!
//! Windows that match no identity land here. Repeat sightings of the same
//! unknown face merge into one record (by a looser dedup threshold) whose
//! representative is the running centroid of everything merged into it. A
//! reviewer later promotes a record to a new identity or dismisses it.

use crate::error::{Error, Result};
use crate::index::CandidateIndex;
use crate::types::{Embedding, Identity};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnmatchedRecord {
    pub id: Uuid,
    /// Unit-norm centroid of every embedding merged into this record.
    pub representative: Embedding,
    /// Unnormalized running mean backing `representative`.
    pub mean: Vec<f32>,
    pub occurrences: u32,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl UnmatchedRecord {
    pub fn new(embedding: Embedding) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            mean: embedding.as_slice().to_vec(),
            representative: embedding,
            occurrences: 1,
            first_seen: now,
            last_seen: now,
        }
    }

    /// Fold one more sighting into the centroid.
    fn merge(&mut self, embedding: &Embedding) {
        self.occurrences += 1;
        let n = self.occurrences as f32;
        for (m, &v) in self.mean.iter_mut().zip(embedding.as_slice()) {
            *m += (v - *m) / n;
        }
        // A centroid that cancels out keeps the previous representative.
        if let Ok(representative) = Embedding::new(self.mean.clone()) {
            self.representative = representative;
        }
        self.last_seen = Utc::now();
    }
}

/// Listing order for [`Triage::list`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnmatchedOrder {
    /// Most sightings first: the records most worth a reviewer's time.
    #[default]
    OccurrenceDesc,
    LastSeenDesc,
    FirstSeenAsc,
}

impl std::str::FromStr for UnmatchedOrder {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "occurrence_desc" | "occurrences" => Ok(Self::OccurrenceDesc),
            "last_seen_desc" | "recent" => Ok(Self::LastSeenDesc),
            "first_seen_asc" | "oldest" => Ok(Self::FirstSeenAsc),
            other => Err(format!("unknown listing order {other:?}")),
        }
    }
}

/// Shared set of unmatched records.
///
/// The dedup lookup and the insert-or-merge that follows happen under one
/// lock, so two tracks seeing the same new face cannot fork two records.
pub struct Triage {
    dedup_threshold: f32,
    records: Mutex<BTreeMap<Uuid, UnmatchedRecord>>,
}

impl Triage {
    pub fn new(dedup_threshold: f32) -> Self {
        Self {
            dedup_threshold,
            records: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn with_records(dedup_threshold: f32, records: Vec<UnmatchedRecord>) -> Self {
        Self {
            dedup_threshold,
            records: Mutex::new(records.into_iter().map(|r| (r.id, r)).collect()),
        }
    }

    /// Merge `embedding` into the closest record within the dedup threshold,
    /// or open a new record. Returns the record as it stands afterwards.
    pub fn record(&self, embedding: Embedding) -> UnmatchedRecord {
        let mut records = self.records.lock();

        let closest = records
            .values()
            .filter(|r| r.representative.dim() == embedding.dim())
            .map(|r| (r.id, r.representative.similarity(&embedding)))
            .filter(|&(_, score)| score >= self.dedup_threshold)
            .max_by(|a, b| a.1.total_cmp(&b.1));

        if let Some((id, score)) = closest {
            if let Some(record) = records.get_mut(&id) {
                record.merge(&embedding);
                tracing::debug!(
                    record = %id,
                    score,
                    occurrences = record.occurrences,
                    "merged unmatched detection"
                );
                return record.clone();
            }
        }

        let record = UnmatchedRecord::new(embedding);
        tracing::info!(record = %record.id, "new unmatched face");
        records.insert(record.id, record.clone());
        record
    }

    /// Enroll record `id` as a new identity named `name` and drop the record.
    ///
    /// On `DuplicateName` (or any other enrollment error) the record stays put.
    pub fn promote(&self, id: Uuid, name: &str, index: &CandidateIndex) -> Result<Identity> {
        let mut records = self.records.lock();
        let record = records
            .get(&id)
            .ok_or_else(|| Error::NotFound(format!("unmatched record {id}")))?;

        let identity = Identity::new(name, record.representative.clone());
        index.add(identity.clone())?;
        records.remove(&id);

        tracing::info!(record = %id, name, "promoted unmatched face");
        Ok(identity)
    }

    pub fn dismiss(&self, id: Uuid) -> Result<UnmatchedRecord> {
        let removed = self
            .records
            .lock()
            .remove(&id)
            .ok_or_else(|| Error::NotFound(format!("unmatched record {id}")))?;
        tracing::info!(record = %id, "dismissed unmatched face");
        Ok(removed)
    }

    pub fn get(&self, id: Uuid) -> Option<UnmatchedRecord> {
        self.records.lock().get(&id).cloned()
    }

    pub fn list(&self, order: UnmatchedOrder) -> Vec<UnmatchedRecord> {
        let mut records: Vec<UnmatchedRecord> = self.records.lock().values().cloned().collect();
        match order {
            UnmatchedOrder::OccurrenceDesc => records.sort_by(|a, b| {
                b.occurrences
                    .cmp(&a.occurrences)
                    .then_with(|| a.first_seen.cmp(&b.first_seen))
                    .then_with(|| a.id.cmp(&b.id))
            }),
            UnmatchedOrder::LastSeenDesc => records.sort_by(|a, b| {
                b.last_seen
                    .cmp(&a.last_seen)
                    .then_with(|| a.id.cmp(&b.id))
            }),
            UnmatchedOrder::FirstSeenAsc => records.sort_by(|a, b| {
                a.first_seen
                    .cmp(&b.first_seen)
                    .then_with(|| a.id.cmp(&b.id))
            }),
        }
        records
    }

    /// Other records scoring at least `threshold` against record `id`, best first.
    pub fn similar(
        &self,
        id: Uuid,
        threshold: f32,
        limit: usize,
    ) -> Result<Vec<(UnmatchedRecord, f32)>> {
        let records = self.records.lock();
        let reference = records
            .get(&id)
            .ok_or_else(|| Error::NotFound(format!("unmatched record {id}")))?;

        let mut similar: Vec<(UnmatchedRecord, f32)> = records
            .values()
            .filter(|r| r.id != id && r.representative.dim() == reference.representative.dim())
            .map(|r| (r.clone(), r.representative.similarity(&reference.representative)))
            .filter(|(_, score)| *score >= threshold)
            .collect();
        similar.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.id.cmp(&b.0.id)));
        similar.truncate(limit);
        Ok(similar)
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MatchConfig;
    use crate::index::IndexPolicy;
    use std::sync::Arc;

    fn emb(values: &[f32]) -> Embedding {
        Embedding::new(values.to_vec()).unwrap()
    }

    fn index() -> CandidateIndex {
        CandidateIndex::new(IndexPolicy::from_config(&MatchConfig::default()))
    }

    #[test]
    fn test_repeat_sighting_merges() {
        let triage = Triage::new(0.3);
        let first = triage.record(emb(&[1.0, 0.0, 0.0]));
        let second = triage.record(emb(&[1.0, 0.0, 0.0]));

        assert_eq!(first.id, second.id);
        assert_eq!(second.occurrences, 2);
        assert!(second.last_seen >= second.first_seen);
        assert_eq!(triage.len(), 1);
    }

    #[test]
    fn test_distinct_faces_open_distinct_records() {
        let triage = Triage::new(0.3);
        let a = triage.record(emb(&[1.0, 0.0, 0.0]));
        let b = triage.record(emb(&[0.0, 1.0, 0.0]));
        assert_ne!(a.id, b.id);
        assert_eq!(triage.len(), 2);
    }

    #[test]
    fn test_merge_moves_centroid() {
        let triage = Triage::new(0.3);
        triage.record(emb(&[1.0, 0.0]));
        let merged = triage.record(emb(&[0.6, 0.8]));

        assert!(merged.representative.is_unit());
        let expected = emb(&[0.8, 0.4]);
        assert!((merged.representative.similarity(&expected) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_merge_picks_closest_record() {
        let triage = Triage::new(0.3);
        let a = triage.record(emb(&[1.0, 0.0, 0.0]));
        let b = triage.record(emb(&[0.0, 1.0, 0.0]));
        let hit = triage.record(emb(&[0.3, 0.9, 0.0]));
        assert_eq!(hit.id, b.id);
        assert_eq!(triage.get(a.id).unwrap().occurrences, 1);
    }

    #[test]
    fn test_list_by_occurrence() {
        let triage = Triage::new(0.3);
        let once = triage.record(emb(&[1.0, 0.0, 0.0]));
        let thrice = triage.record(emb(&[0.0, 1.0, 0.0]));
        triage.record(emb(&[0.0, 1.0, 0.0]));
        triage.record(emb(&[0.0, 1.0, 0.0]));

        let listed = triage.list(UnmatchedOrder::OccurrenceDesc);
        assert_eq!(listed[0].id, thrice.id);
        assert_eq!(listed[0].occurrences, 3);
        assert_eq!(listed[1].id, once.id);

        let oldest = triage.list(UnmatchedOrder::FirstSeenAsc);
        assert_eq!(oldest[0].id, once.id);
    }

    #[test]
    fn test_promote_enrolls_and_removes() {
        let triage = Triage::new(0.3);
        let index = index();
        let record = triage.record(emb(&[0.0, 0.0, 1.0]));

        let identity = triage.promote(record.id, "charlie", &index).unwrap();
        assert_eq!(identity.template, record.representative);
        assert!(index.contains("charlie"));
        assert!(triage.is_empty());
        assert!(matches!(
            triage.promote(record.id, "charlie2", &index),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_promote_duplicate_name_keeps_record() {
        let triage = Triage::new(0.3);
        let index = index();
        index.add(Identity::new("charlie", emb(&[1.0, 0.0, 0.0]))).unwrap();
        let record = triage.record(emb(&[0.0, 0.0, 1.0]));

        assert_eq!(
            triage.promote(record.id, "charlie", &index),
            Err(Error::DuplicateName("charlie".into()))
        );
        assert_eq!(triage.len(), 1);
    }

    #[test]
    fn test_second_dismiss_is_not_found() {
        let triage = Triage::new(0.3);
        let record = triage.record(emb(&[1.0, 0.0]));
        assert_eq!(triage.dismiss(record.id).unwrap().id, record.id);
        assert!(matches!(triage.dismiss(record.id), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_similar_records() {
        let triage = Triage::new(0.95);
        let base = triage.record(emb(&[1.0, 0.0, 0.0]));
        let near = triage.record(emb(&[0.9, 0.3, 0.0]));
        triage.record(emb(&[0.0, 0.0, 1.0]));

        let similar = triage.similar(base.id, 0.8, 10).unwrap();
        assert_eq!(similar.len(), 1);
        assert_eq!(similar[0].0.id, near.id);
        assert!(triage.similar(Uuid::new_v4(), 0.8, 10).is_err());
    }

    #[test]
    fn test_concurrent_sightings_share_one_record() {
        let triage = Arc::new(Triage::new(0.3));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let triage = Arc::clone(&triage);
                std::thread::spawn(move || {
                    for _ in 0..25 {
                        triage.record(emb(&[0.2, 0.9, 0.1]));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let listed = triage.list(UnmatchedOrder::OccurrenceDesc);
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].occurrences, 200);
    }

    #[test]
    fn test_order_parsing() {
        assert_eq!("occurrence_desc".parse::<UnmatchedOrder>(), Ok(UnmatchedOrder::OccurrenceDesc));
        assert_eq!("recent".parse::<UnmatchedOrder>(), Ok(UnmatchedOrder::LastSeenDesc));
        assert!("sideways".parse::<UnmatchedOrder>().is_err());
    }
}

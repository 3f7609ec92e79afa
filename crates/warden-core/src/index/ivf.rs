//! Approximate lookup: inverted-file index over an inner-product metric.
//!
//! Templates are partitioned by spherical k-means into `≈√n` inverted lists.
//! A query scores the centroids, scans the `probes` closest lists and ranks
//! only their members. The true best match can be missed when it lives in an
//! unprobed list; that recall loss is the price of sub-linear scans.

use super::{SearchStrategy, StrategyKind};
use crate::error::{Error, Result};
use crate::matcher;
use crate::types::{Candidate, Embedding};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::HashMap;

/// Build parameters for [`IvfSearch`].
#[derive(Debug, Clone, Copy)]
pub struct IvfParams {
    pub probes: usize,
    pub iterations: usize,
    pub seed: u64,
}

pub struct IvfSearch {
    rows: Vec<(String, Embedding)>,
    slots: HashMap<String, usize>,
    centroids: Vec<Embedding>,
    /// Row indices per centroid.
    lists: Vec<Vec<usize>>,
    /// Centroid of each row.
    assignment: Vec<usize>,
    probes: usize,
}

impl IvfSearch {
    pub fn build(rows: Vec<(String, Embedding)>, params: IvfParams) -> Result<Self> {
        let Some((_, first)) = rows.first() else {
            return Err(Error::IndexRebuildFailure("no templates to index".into()));
        };
        let dim = first.dim();
        if let Some((name, e)) = rows.iter().find(|(_, e)| e.dim() != dim) {
            return Err(Error::IndexRebuildFailure(format!(
                "template {name:?} has dimension {}, expected {dim}",
                e.dim()
            )));
        }

        let n = rows.len();
        let nlist = ((n as f64).sqrt().round() as usize).clamp(1, n);

        let mut rng = StdRng::seed_from_u64(params.seed);
        let mut centroids: Vec<Embedding> = rand::seq::index::sample(&mut rng, n, nlist)
            .into_iter()
            .map(|i| rows[i].1.clone())
            .collect();

        let mut assignment: Vec<usize> = rows
            .iter()
            .map(|(_, e)| nearest_centroid(&centroids, e))
            .collect();

        for _ in 0..params.iterations {
            for (c, centroid) in centroids.iter_mut().enumerate() {
                // An emptied or degenerate cluster keeps its previous centroid.
                if let Some(updated) = cluster_mean(&rows, &assignment, c, dim) {
                    *centroid = updated;
                }
            }

            let next: Vec<usize> = rows
                .iter()
                .map(|(_, e)| nearest_centroid(&centroids, e))
                .collect();
            let converged = next == assignment;
            assignment = next;
            if converged {
                break;
            }
        }

        let mut lists = vec![Vec::new(); nlist];
        for (row, &c) in assignment.iter().enumerate() {
            lists[c].push(row);
        }

        let slots = rows
            .iter()
            .enumerate()
            .map(|(i, (name, _))| (name.clone(), i))
            .collect();

        tracing::debug!(templates = n, lists = nlist, probes = params.probes, "built IVF index");

        Ok(Self {
            rows,
            slots,
            centroids,
            lists,
            assignment,
            probes: params.probes.max(1),
        })
    }

    pub fn list_count(&self) -> usize {
        self.lists.len()
    }
}

impl SearchStrategy for IvfSearch {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Approximate
    }

    fn search(&self, probe: &Embedding, k: usize) -> Vec<Candidate> {
        if k == 0 {
            return Vec::new();
        }

        // Probe order must agree with `nearest_centroid` on the first list:
        // score descending, lower centroid index on ties.
        let mut order: Vec<(usize, f32)> = self
            .centroids
            .iter()
            .enumerate()
            .map(|(c, centroid)| (c, probe.similarity(centroid)))
            .collect();
        order.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

        let members = order
            .iter()
            .take(self.probes)
            .flat_map(|&(c, _)| self.lists[c].iter())
            .map(|&row| {
                let (name, template) = &self.rows[row];
                (name.as_str(), template)
            });

        let mut ranked = matcher::rank(probe, members);
        ranked.truncate(k);
        ranked
    }

    fn refresh(&mut self, name: &str, template: &Embedding) {
        let Some(&row) = self.slots.get(name) else {
            return;
        };
        self.rows[row].1 = template.clone();

        // Centroids stay put; the row just moves to whichever list is now closest.
        let target = nearest_centroid(&self.centroids, template);
        let current = self.assignment[row];
        if target != current {
            self.lists[current].retain(|&r| r != row);
            self.lists[target].push(row);
            self.assignment[row] = target;
        }
    }
}

/// Index of the most similar centroid; the lowest index wins ties.
fn nearest_centroid(centroids: &[Embedding], e: &Embedding) -> usize {
    let mut best = 0;
    let mut best_score = f32::NEG_INFINITY;
    for (c, centroid) in centroids.iter().enumerate() {
        let score = e.similarity(centroid);
        if score > best_score {
            best_score = score;
            best = c;
        }
    }
    best
}

fn cluster_mean(
    rows: &[(String, Embedding)],
    assignment: &[usize],
    cluster: usize,
    dim: usize,
) -> Option<Embedding> {
    let mut sum = vec![0.0f64; dim];
    let mut members = 0usize;
    for ((_, e), _) in rows.iter().zip(assignment).filter(|(_, c)| **c == cluster) {
        for (acc, &v) in sum.iter_mut().zip(e.as_slice()) {
            *acc += f64::from(v);
        }
        members += 1;
    }
    if members == 0 {
        return None;
    }
    Embedding::new(sum.into_iter().map(|v| v as f32).collect()).ok()
}

//! Detection sources: newline-delimited JSON streams from an external
//! detector/tracker, one dedicated pipeline thread per stream.

use crate::writer::{Persist, StoreHandle};
use serde::Deserialize;
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use warden_core::{Decision, Embedding, Observation, Pipeline, Recognizer, TrackId};

/// One line of a detection stream.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DetectionEvent {
    Frame { face_id: TrackId, embedding: Vec<f32> },
    TrackLost { face_id: TrackId },
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SourceStats {
    pub frames: u64,
    pub matched: u64,
    pub unmatched: u64,
    pub abandoned: u64,
    pub rejected: u64,
}

/// Drive `pipeline` from `reader` until end of stream.
///
/// Malformed lines and rejected embeddings are logged and skipped; a bad
/// frame never ends the stream. Every side effect of a decision is handed to
/// `persist` once the decision is final.
pub fn run_source<R, F>(source: &str, reader: R, pipeline: &mut Pipeline, mut persist: F) -> SourceStats
where
    R: BufRead,
    F: FnMut(Persist),
{
    let mut stats = SourceStats::default();

    for (lineno, line) in reader.lines().enumerate() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                tracing::error!(source, error = %e, "detection stream read failed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let event = match serde_json::from_str::<DetectionEvent>(&line) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(source, line = lineno + 1, error = %e, "skipping malformed event");
                stats.rejected += 1;
                continue;
            }
        };

        match event {
            DetectionEvent::Frame { face_id, embedding } => {
                stats.frames += 1;
                let observation = Embedding::new(embedding)
                    .and_then(|e| pipeline.observe(face_id, e));
                match observation {
                    Ok(observation) => {
                        record(source, face_id, &observation, &mut stats);
                        forward(observation, &mut persist);
                    }
                    Err(e) => {
                        tracing::warn!(source, face_id, error = %e, "rejected frame");
                        stats.rejected += 1;
                    }
                }
            }
            DetectionEvent::TrackLost { face_id } => {
                if pipeline.end_track(face_id).is_some() {
                    stats.abandoned += 1;
                }
            }
        }
    }

    stats
}

fn record(source: &str, face_id: TrackId, observation: &Observation, stats: &mut SourceStats) {
    match &observation.decision {
        Decision::Matched { name, score } => {
            stats.matched += 1;
            tracing::info!(source, face_id, name = %name, score, "face matched");
        }
        Decision::Unmatched => {
            stats.unmatched += 1;
            tracing::info!(
                source,
                face_id,
                best_score = ?observation.best_score,
                "face unmatched"
            );
        }
        Decision::Pending => {}
    }
}

fn forward(observation: Observation, persist: &mut impl FnMut(Persist)) {
    if let Some(identity) = observation.template_update {
        persist(Persist::SaveIdentity(identity));
    }
    if let Some(record) = observation.unmatched {
        persist(Persist::SaveUnmatched(record));
    }
}

/// Spawn one pipeline thread reading `path` (`-` for stdin).
pub fn spawn_source(
    path: PathBuf,
    recognizer: &Arc<Recognizer>,
    store: StoreHandle,
) -> std::io::Result<std::thread::JoinHandle<SourceStats>> {
    let mut pipeline = recognizer.pipeline();
    let name = path.display().to_string();

    std::thread::Builder::new()
        .name(format!("warden-src-{}", short_name(&path)))
        .spawn(move || {
            let reader: Box<dyn BufRead> = if path == Path::new("-") {
                Box::new(std::io::stdin().lock())
            } else {
                match std::fs::File::open(&path) {
                    Ok(file) => Box::new(std::io::BufReader::new(file)),
                    Err(e) => {
                        tracing::error!(source = %name, error = %e, "cannot open detection source");
                        return SourceStats::default();
                    }
                }
            };

            tracing::info!(source = %name, "detection source started");
            let stats = run_source(&name, reader, &mut pipeline, |change| {
                if let Err(e) = store.persist_blocking(change) {
                    tracing::error!(source = %name, error = %e, "dropping store write");
                }
            });
            tracing::info!(source = %name, ?stats, "detection source finished");
            stats
        })
}

fn short_name(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "stdin".into())
}

//! Bulk enrollment from a directory of `<Name>.json` embedding files.

use anyhow::{Context, Result};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use warden_core::Embedding;

#[derive(Debug, PartialEq)]
pub enum Entry {
    Enroll {
        name: String,
        embedding: Embedding,
        /// An identity of this name exists and its template will be replaced.
        replace: bool,
    },
    Skip {
        name: String,
    },
    Invalid {
        path: PathBuf,
        reason: String,
    },
}

#[derive(Debug, Default)]
pub struct Summary {
    pub enrolled: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Decide what to do with every `.json` file in `dir`, sorted by name.
///
/// Files are only parsed when they would be enrolled.
pub fn plan(dir: &Path, existing: &HashSet<String>, force: bool) -> Result<Vec<Entry>> {
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("reading {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "json"))
        .collect();
    paths.sort();

    let mut entries = Vec::with_capacity(paths.len());
    for path in paths {
        let Some(name) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
            entries.push(Entry::Invalid {
                path,
                reason: "file name is not valid UTF-8".into(),
            });
            continue;
        };

        let enrolled = existing.contains(&name);
        if enrolled && !force {
            entries.push(Entry::Skip { name });
            continue;
        }

        match load(&path) {
            Ok(embedding) => entries.push(Entry::Enroll {
                name,
                embedding,
                replace: enrolled,
            }),
            Err(reason) => entries.push(Entry::Invalid { path, reason }),
        }
    }

    tracing::debug!(dir = %dir.display(), files = entries.len(), "sync plan");
    Ok(entries)
}

fn load(path: &Path) -> std::result::Result<Embedding, String> {
    let text = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
    let values: Vec<f32> = serde_json::from_str(&text).map_err(|e| e.to_string())?;
    Embedding::new(values).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, file: &str, body: &str) {
        std::fs::write(dir.join(file), body).unwrap();
    }

    #[test]
    fn test_plan_skips_enrolled_and_flags_bad_files() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "Alice.json", "[1.0, 0.0]");
        write(dir.path(), "Bob.json", "[0.0, 2.0]");
        write(dir.path(), "Broken.json", "{\"not\": \"an array\"}");
        write(dir.path(), "notes.txt", "ignored");

        let existing: HashSet<String> = ["Alice".to_string()].into_iter().collect();
        let entries = plan(dir.path(), &existing, false).unwrap();

        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0], Entry::Skip { name: "Alice".into() });
        assert_eq!(
            entries[1],
            Entry::Enroll {
                name: "Bob".into(),
                embedding: Embedding::new(vec![0.0, 1.0]).unwrap(),
                replace: false,
            }
        );
        assert!(matches!(entries[2], Entry::Invalid { .. }));
    }

    #[test]
    fn test_force_replaces_enrolled() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "Alice.json", "[1.0, 0.0]");

        let existing: HashSet<String> = ["Alice".to_string()].into_iter().collect();
        let entries = plan(dir.path(), &existing, true).unwrap();
        assert!(matches!(
            &entries[0],
            Entry::Enroll { name, replace: true, .. } if name == "Alice"
        ));
    }

    #[test]
    fn test_zero_vector_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "Ghost.json", "[0.0, 0.0]");
        let entries = plan(dir.path(), &HashSet::new(), false).unwrap();
        assert!(matches!(entries[0], Entry::Invalid { .. }));
    }

    #[test]
    fn test_missing_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(plan(&dir.path().join("absent"), &HashSet::new(), false).is_err());
    }
}

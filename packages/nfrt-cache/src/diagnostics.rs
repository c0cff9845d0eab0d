//! Miss diagnostics (C5): rank existing entries of the same type by
//! fingerprint delta size, and explain the closest one.

use std::time::SystemTime;

use color_eyre::Result;
use jiff::Timestamp;
use tracing::{info, instrument, warn};

use crate::fsops;
use crate::key::{self, CacheKey, Delta};
use crate::layout::StoreLayout;

/// One ranked candidate in a [`MissReport`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MissCandidate {
    pub filename: String,
    pub mtime: SystemTime,
    pub delta_count: usize,
}

/// The structured result of [`diagnose`]: every same-type candidate ranked
/// by delta size, and the deltas of the closest one.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MissReport {
    /// Sorted by `delta_count` ascending (stable ties).
    pub candidates: Vec<MissCandidate>,
    /// The deltas against the first (closest) candidate, if any.
    pub best_deltas: Vec<Delta>,
}

impl MissReport {
    pub fn best(&self) -> Option<&MissCandidate> {
        self.candidates.first()
    }
}

/// Rank every marker of `key`'s type in the store by fingerprint distance to
/// `key`, logging a summary line per candidate and the full delta for the
/// closest one. Performs no mutation; safe to call speculatively.
#[instrument(skip(layout), fields(key = %key))]
pub fn diagnose(layout: &StoreLayout, key: &CacheKey) -> Result<MissReport> {
    let dir = layout.intermediate_results_dir();
    let mut candidates = Vec::new();
    let mut best_deltas = Vec::new();

    let files = match fsops::scan_dir_files(&dir) {
        Ok(files) => files,
        Err(err) => {
            warn!(error = %err, "miss diagnostics: could not scan intermediate_results/");
            return Ok(MissReport::default());
        }
    };

    struct Candidate {
        filename: String,
        mtime: SystemTime,
        delta_count: usize,
        deltas: Vec<Delta>,
    }
    let mut scored = Vec::new();

    for file in files {
        let Some((type_name, _hash)) = key::parse_filename_prefix(&file.file_name) else {
            continue;
        };
        if type_name != key.type_name() {
            continue;
        }
        let prefix_len = type_name.len() + 1 + 40;
        if file.file_name.len() != prefix_len + 4 || !file.file_name.ends_with(".txt") {
            // Not a marker (either an output file sharing the prefix, or a
            // marker for a different hash length than expected).
            continue;
        }

        let contents = match fsops::read_to_string_opt(&file.path) {
            Ok(Some(contents)) => contents,
            Ok(None) => continue,
            Err(err) => {
                warn!(filename = %file.file_name, error = %err, "skipping unreadable marker during diagnostics");
                continue;
            }
        };
        let other = match CacheKey::from_json_str(&contents) {
            Ok(other) => other,
            Err(err) => {
                warn!(filename = %file.file_name, error = %err, "skipping unparseable marker during diagnostics");
                continue;
            }
        };

        let deltas = key.diff(&other);
        scored.push(Candidate {
            filename: file.file_name,
            mtime: file.mtime,
            delta_count: deltas.len(),
            deltas,
        });
    }

    scored.sort_by_key(|c| c.delta_count);

    for c in &scored {
        info!(filename = %c.filename, mtime = %format_mtime(c.mtime), delta_count = c.delta_count, "miss diagnostics candidate");
        candidates.push(MissCandidate {
            filename: c.filename.clone(),
            mtime: c.mtime,
            delta_count: c.delta_count,
        });
    }

    if let Some(best) = scored.into_iter().next() {
        for delta in &best.deltas {
            info!(
                key = %delta.key,
                new = ?delta.ours.as_ref().map(|v| &v.value),
                old = ?delta.theirs.as_ref().map(|v| &v.value),
                "miss diagnostics delta"
            );
        }
        best_deltas = best.deltas;
    }

    Ok(MissReport { candidates, best_deltas })
}

/// Render a marker's mtime for a log line, falling back to `Debug` if it
/// cannot be represented as a civil timestamp (e.g. pre-epoch on some
/// platforms).
fn format_mtime(mtime: SystemTime) -> String {
    Timestamp::try_from(mtime).map(|t| t.to_string()).unwrap_or_else(|_| format!("{mtime:?}"))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    use super::*;
    use crate::key::AnnotatedValue;

    fn key(components: &[(&str, &str)]) -> CacheKey {
        CacheKey::new(
            "t",
            components
                .iter()
                .map(|(k, v)| (k.to_string(), AnnotatedValue::new(*v)))
                .collect::<BTreeMap<_, _>>(),
        )
        .unwrap()
    }

    #[test_log::test]
    fn ranks_closest_candidate_first_s7() {
        let dir = tempdir().unwrap();
        let layout = StoreLayout::new(dir.path());
        fsops::create_dir_all(&layout.intermediate_results_dir()).unwrap();

        let a = key(&[("x", "1"), ("y", "2")]);
        let b = key(&[("x", "1"), ("y", "3"), ("z", "4")]);
        let far = key(&[("x", "9"), ("y", "9"), ("w", "9")]);

        std::fs::write(layout.marker_path(&b), b.to_json_pretty().unwrap()).unwrap();
        std::fs::write(layout.marker_path(&far), far.to_json_pretty().unwrap()).unwrap();

        let report = diagnose(&layout, &a).unwrap();
        assert_eq!(report.candidates.len(), 2);
        let best = report.best().unwrap();
        assert_eq!(best.delta_count, 2);
        assert!(best.filename.contains(&b.hash_value()[..8]));
    }

    #[test]
    fn ignores_markers_of_a_different_type() {
        let dir = tempdir().unwrap();
        let layout = StoreLayout::new(dir.path());
        fsops::create_dir_all(&layout.intermediate_results_dir()).unwrap();

        let other_type = CacheKey::new(
            "other",
            BTreeMap::from([("x".to_string(), AnnotatedValue::new("1"))]),
        )
        .unwrap();
        std::fs::write(layout.marker_path(&other_type), other_type.to_json_pretty().unwrap())
            .unwrap();

        let report = diagnose(&layout, &key(&[("x", "1")])).unwrap();
        assert!(report.candidates.is_empty());
    }

    #[test]
    fn skips_unparseable_markers() {
        let dir = tempdir().unwrap();
        let layout = StoreLayout::new(dir.path());
        fsops::create_dir_all(&layout.intermediate_results_dir()).unwrap();

        let a = key(&[("x", "1")]);
        let marker_path = layout.marker_path(&a);
        std::fs::write(&marker_path, "not json").unwrap();

        let report = diagnose(&layout, &a).unwrap();
        assert!(report.candidates.is_empty());
    }
}

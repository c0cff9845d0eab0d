//! Lookup and publish (C3): the executor-facing surface of the cache.
//!
//! Grounded on this codebase's Cargo-unit restore/save flow (restore then
//! touch on hit; publish outputs then write the marker last), generalised
//! from Cargo units to an arbitrary declared-outputs [`Node`].

use std::collections::BTreeMap;
use std::path::PathBuf;

use color_eyre::Result;
use color_eyre::eyre::eyre;
use tracing::{instrument, warn};

use crate::diagnostics::{self, MissReport};
use crate::fsops;
use crate::key::CacheKey;
use crate::layout::StoreLayout;

/// An output's declared type, insofar as this crate cares about it: the
/// file extension to give the published artifact.
pub trait HasExtension {
    /// A dot-prefixed extension, e.g. `".jar"`. Empty string for extensionless
    /// outputs.
    fn extension(&self) -> &str;
}

/// A minimal [`HasExtension`] implementation for callers that don't need a
/// richer output-type enum.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SimpleOutputSpec {
    pub extension: String,
}

impl SimpleOutputSpec {
    pub fn new(extension: impl Into<String>) -> Self {
        Self { extension: extension.into() }
    }
}

impl HasExtension for SimpleOutputSpec {
    fn extension(&self) -> &str {
        &self.extension
    }
}

/// A pipeline node: an identity, plus an ordered (here: lexicographic,
/// deterministic-iteration) mapping from logical output name to its
/// declared output type.
pub trait Node {
    type Output: HasExtension;

    fn id(&self) -> &str;
    fn outputs(&self) -> &BTreeMap<String, Self::Output>;
}

/// Outcome of [`Store::restore`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RestoreOutcome {
    /// Every declared output exists on disk; the marker's mtime was touched.
    Hit,
    /// No marker for this key.
    Miss,
    /// The marker exists but at least one declared output is missing. A
    /// miss to the caller, but distinguished for diagnosability.
    MissIncomplete,
}

impl RestoreOutcome {
    pub fn is_hit(self) -> bool {
        matches!(self, RestoreOutcome::Hit)
    }
}

/// The lookup/publish surface over a single store layout.
pub struct Store {
    layout: StoreLayout,
    diagnostics_enabled: bool,
}

impl Store {
    pub fn new(home: impl Into<PathBuf>) -> Self {
        Self { layout: StoreLayout::new(home), diagnostics_enabled: false }
    }

    pub fn with_diagnostics_enabled(mut self, enabled: bool) -> Self {
        self.diagnostics_enabled = enabled;
        self
    }

    pub fn set_diagnostics_enabled(&mut self, enabled: bool) {
        self.diagnostics_enabled = enabled;
    }

    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    /// Whether a marker exists for `key`.
    ///
    /// Note this does not imply `Hit`: a malformed or incomplete entry can
    /// still have a marker file present on disk. This is the same brittle
    /// existence test `restore` itself uses to decide whether to proceed
    /// past the "cheap" check before validating individual outputs.
    pub fn marker_exists(&self, key: &CacheKey) -> bool {
        fsops::is_file(&self.layout.marker_path(key))
    }

    /// Look up cached outputs for `(node, key)`.
    ///
    /// On `Hit`, `out` is populated with every declared output's path and the
    /// marker's mtime is advanced. On `Miss` or `MissIncomplete`, `out` is
    /// left empty. Runs diagnostics on miss iff diagnostics are enabled.
    #[instrument(skip(self, node, out), fields(key = %key))]
    pub fn restore<N: Node>(
        &self,
        node: &N,
        key: &CacheKey,
        out: &mut BTreeMap<String, PathBuf>,
    ) -> Result<RestoreOutcome> {
        let (outcome, _) = self.restore_inner(node, key, out, self.diagnostics_enabled)?;
        Ok(outcome)
    }

    /// Like [`Store::restore`], but always computes and returns the miss
    /// report (if the lookup misses), regardless of the diagnostics setting.
    pub fn restore_with_diagnostics<N: Node>(
        &self,
        node: &N,
        key: &CacheKey,
        out: &mut BTreeMap<String, PathBuf>,
    ) -> Result<(RestoreOutcome, Option<MissReport>)> {
        self.restore_inner(node, key, out, true)
    }

    fn restore_inner<N: Node>(
        &self,
        node: &N,
        key: &CacheKey,
        out: &mut BTreeMap<String, PathBuf>,
        diagnose: bool,
    ) -> Result<(RestoreOutcome, Option<MissReport>)> {
        fsops::create_dir_all(&self.layout.intermediate_results_dir())?;
        out.clear();

        let marker_path = self.layout.marker_path(key);
        if !fsops::is_file(&marker_path) {
            let report = if diagnose { Some(diagnostics::diagnose(&self.layout, key)?) } else { None };
            return Ok((RestoreOutcome::Miss, report));
        }

        for (name, spec) in node.outputs() {
            let path = self.layout.output_path(key, name, spec.extension())?;
            if fsops::is_file(&path) {
                out.insert(name.clone(), path);
            } else {
                out.clear();
                warn!(%key, output = %name, path = %path.display(), "Missing: output file for declared output");
                return Ok((RestoreOutcome::MissIncomplete, None));
            }
        }

        fsops::touch(&marker_path)?;
        Ok((RestoreOutcome::Hit, None))
    }

    /// Publish freshly produced outputs for `(node, key)`.
    ///
    /// Each `produced[name]` is a temporary path containing the finished
    /// output; it is atomically renamed to its final location, and
    /// `produced[name]` is updated in place to that final path. Only after
    /// every rename succeeds is the marker written. A crash between output
    /// renames and the marker write leaves no marker, so a subsequent
    /// restore treats the key as a plain miss.
    #[instrument(skip(self, node, produced), fields(key = %key))]
    pub fn publish<N: Node>(
        &self,
        node: &N,
        key: &CacheKey,
        produced: &mut BTreeMap<String, PathBuf>,
    ) -> Result<()> {
        fsops::create_dir_all(&self.layout.intermediate_results_dir())?;

        let outputs = node.outputs();
        let names: Vec<String> = produced.keys().cloned().collect();
        for name in names {
            let temp_path = produced[&name].clone();
            let spec = outputs
                .get(&name)
                .ok_or_else(|| eyre!("publish: output {name:?} not declared by node {}", node.id()))?;
            let final_path = self.layout.output_path(key, &name, spec.extension())?;
            fsops::rename_atomic(&temp_path, &final_path)?;
            produced.insert(name, final_path);
        }

        let marker_path = self.layout.marker_path(key);
        let json = key.to_json_pretty()?;
        fsops::write_atomic(&marker_path, json.as_bytes())?;
        Ok(())
    }
}

//! On-disk layout of the intermediate-result store.
//!
//! Given a home directory, this module derives the fixed subdirectory
//! layout and the filenames for markers and outputs, and parses filenames
//! back into their cache-key prefix.

use std::path::{Path, PathBuf};

use color_eyre::Result;
use color_eyre::eyre::{Context, OptionExt, bail};
use tracing::{debug, instrument};

use crate::key::CacheKey;

/// Resolves paths under a single home directory.
///
/// Only `intermediate_results/` is governed by this crate; `artifacts/` and
/// `assets/` are fixed sibling directories owned by external collaborators.
#[derive(Clone, Debug)]
pub struct StoreLayout {
    home: PathBuf,
}

impl StoreLayout {
    pub fn new(home: impl Into<PathBuf>) -> Self {
        Self { home: home.into() }
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        self.home.join("artifacts")
    }

    pub fn intermediate_results_dir(&self) -> PathBuf {
        self.home.join("intermediate_results")
    }

    pub fn assets_dir(&self) -> PathBuf {
        self.home.join("assets")
    }

    /// The maintenance coordination file: advisory-locked, its mtime doubling
    /// as the rate-gate clock.
    pub fn cleanup_state_path(&self) -> PathBuf {
        self.home.join("nfrt_cache_cleanup.state")
    }

    /// `<type>_<hash>.txt`.
    pub fn marker_path(&self, key: &CacheKey) -> PathBuf {
        self.intermediate_results_dir().join(format!("{}.txt", key.to_key_string()))
    }

    /// `<type>_<hash>_<outputName><ext>`. Fails if `output_name` or `ext`
    /// contains a path separator, since the filename grammar forbids it and
    /// both are folded into a single path component below.
    pub fn output_path(&self, key: &CacheKey, output_name: &str, ext: &str) -> Result<PathBuf> {
        if output_name.contains('/') || output_name.contains('\\') {
            bail!("output name {output_name:?} must not contain a path separator");
        }
        if ext.contains('/') || ext.contains('\\') {
            bail!("output extension {ext:?} must not contain a path separator");
        }
        Ok(self
            .intermediate_results_dir()
            .join(format!("{}_{output_name}{ext}", key.to_key_string())))
    }

    /// A scratch path in `intermediate_results/` for a caller to write to
    /// before an atomic publish rename. Not part of the filename grammar;
    /// never matched by maintenance scans because of the leading dot.
    pub fn temp_path(&self, label: &str) -> PathBuf {
        self.intermediate_results_dir().join(format!(".tmp-{label}"))
    }

    /// Find a sensible default home directory for this cache under the
    /// current user's platform cache directory, without creating it.
    ///
    /// This is a convenience for hosts that don't have an opinion of their
    /// own about where the store should live; the core otherwise takes the
    /// home directory as a given (see [`StoreLayout::new`]).
    ///
    /// - Linux: `$XDG_CACHE_HOME/nfrt-cache`
    /// - macOS: `$HOME/Library/Caches/dev.nfrt.nfrt-cache`
    /// - Windows: `%LOCALAPPDATA%\nfrt-cache`
    ///
    /// Falls back to `$HOME/.cache/nfrt-cache` if platform directories can't
    /// be determined.
    #[instrument]
    pub fn discover_home() -> Result<PathBuf> {
        let base = if let Some(dirs) = directories::ProjectDirs::from("dev", "nfrt", "nfrt-cache") {
            dirs.cache_dir().to_path_buf()
        } else {
            homedir::my_home()
                .context("get user home directory")?
                .ok_or_eyre("user has no home directory")?
                .join(".cache")
                .join("nfrt-cache")
        };
        debug!(?base, "discovered default home directory");
        Ok(base)
    }
}

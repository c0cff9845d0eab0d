//! Maintenance (C4): single-writer periodic cleanup.
//!
//! Grounded on this codebase's `fslock`-backed process-exclusion pattern,
//! adapted from its async typestate `LockFile` to a blocking, non-typestate
//! wrapper since maintenance only ever needs one non-blocking try-lock per
//! run (no hold-across-await-points concern in blocking code).

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use color_eyre::Result;
use color_eyre::eyre::Context;
use humansize::{BINARY, format_size};
use itertools::Itertools as _;
use tracing::{debug, info, instrument, warn};

use crate::fsops::{self, ScannedFile};
use crate::key;
use crate::layout::StoreLayout;

const RATE_GATE: Duration = Duration::from_secs(24 * 3600);

/// Maintenance knobs. All fields default per §6 of the cache's on-disk
/// contract; a host populates this from its own CLI/config/env surface.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MaintenanceConfig {
    max_age_hours: u64,
    max_size_bytes: u64,
    disabled: bool,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self { max_age_hours: 744, max_size_bytes: 1_073_741_824, disabled: false }
    }
}

impl MaintenanceConfig {
    pub fn max_age_hours(&self) -> u64 {
        self.max_age_hours
    }

    pub fn max_size_bytes(&self) -> u64 {
        self.max_size_bytes
    }

    pub fn disabled(&self) -> bool {
        self.disabled
    }

    pub fn with_max_age_hours(mut self, hours: u64) -> Self {
        self.max_age_hours = hours;
        self
    }

    pub fn with_max_size_bytes(mut self, bytes: u64) -> Self {
        self.max_size_bytes = bytes;
        self
    }

    pub fn set_max_age_hours(&mut self, hours: u64) {
        self.max_age_hours = hours;
    }

    pub fn set_max_size_bytes(&mut self, bytes: u64) {
        self.max_size_bytes = bytes;
    }

    pub fn set_disabled(&mut self, disabled: bool) {
        self.disabled = disabled;
    }

    fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_hours * 3600)
    }
}

/// Summary counters from one maintenance sweep, matching this codebase's
/// existing `Restored`/`BulkStoreResult` summary-type convention.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    /// Whether the cleanup body actually ran (vs. skipped by the lock or
    /// the rate gate, or short-circuited by `disabled`).
    pub ran: bool,
    pub files_scanned: usize,
    pub unrecognised_files: usize,
    pub keys_expired: usize,
    pub entries_evicted: usize,
    pub bytes_freed: u64,
}

/// The maintenance entry point over a single store layout.
pub struct Maintenance {
    layout: StoreLayout,
    config: MaintenanceConfig,
}

impl Maintenance {
    pub fn new(home: impl Into<PathBuf>, config: MaintenanceConfig) -> Self {
        Self { layout: StoreLayout::new(home), config }
    }

    pub fn config(&self) -> &MaintenanceConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut MaintenanceConfig {
        &mut self.config
    }

    /// Periodic, rate-limited entry point: acquires the cross-process
    /// advisory lock, checks the 24h mtime gate, and runs the cleanup body
    /// at most once per gate interval. Lock contention and a fresh gate are
    /// both silent no-ops, not errors.
    #[instrument(skip(self))]
    pub fn perform_maintenance(&self) -> Result<MaintenanceReport> {
        if self.config.disabled {
            debug!("maintenance disabled; skipping");
            return Ok(MaintenanceReport::default());
        }

        fsops::create_dir_all(&self.layout.home()).context("ensure home directory")?;
        let state_path = self.layout.cleanup_state_path();

        let mut lock = fslock::LockFile::open(&state_path).context("open cleanup state file")?;
        let acquired = lock.try_lock().context("attempt advisory lock on cleanup state file")?;
        if !acquired {
            debug!("maintenance already running in another process; skipping");
            return Ok(MaintenanceReport::default());
        }

        let now = SystemTime::now();
        let gate_mtime = fsops::mtime(&state_path).unwrap_or(SystemTime::UNIX_EPOCH);
        let elapsed = now.duration_since(gate_mtime).unwrap_or(Duration::ZERO);
        if elapsed < RATE_GATE {
            debug!(?elapsed, "maintenance rate-gated; skipping");
            return Ok(MaintenanceReport::default());
        }

        let report = self.clean_up_body()?;
        filetime::set_file_mtime(&state_path, filetime::FileTime::from_system_time(SystemTime::now()))
            .context("update cleanup state mtime")?;
        Ok(report)
    }

    /// Unconditional entry point: runs the cleanup body without consulting
    /// the lock or the rate gate.
    #[instrument(skip(self))]
    pub fn clean_up_all(&self) -> Result<MaintenanceReport> {
        if self.config.disabled {
            debug!("maintenance disabled; skipping");
            return Ok(MaintenanceReport::default());
        }
        self.clean_up_body()
    }

    fn clean_up_body(&self) -> Result<MaintenanceReport> {
        let dir = self.layout.intermediate_results_dir();
        fsops::create_dir_all(&dir).context("ensure intermediate_results directory")?;

        let files = fsops::scan_dir_files(&dir)?;
        let mut report = MaintenanceReport { ran: true, files_scanned: files.len(), ..Default::default() };

        let mut entries: Vec<(String, ScannedFile, bool)> = Vec::with_capacity(files.len());
        for file in files {
            match key::parse_filename_prefix(&file.file_name) {
                Some((type_name, hash)) => {
                    let cache_key = format!("{type_name}_{hash}");
                    let prefix_len = cache_key.len();
                    let is_marker =
                        file.file_name.len() == prefix_len + 4 && file.file_name.ends_with(".txt");
                    entries.push((cache_key, file, is_marker));
                }
                None => {
                    report.unrecognised_files += 1;
                    warn!(filename = %file.file_name, "unrecognised file in intermediate_results/; leaving in place");
                }
            }
        }

        let max_age = self.config.max_age();
        let now = SystemTime::now();
        // Deliberately marker-gated: a marker-less output can be a genuine
        // orphan (a previous sweep deleted its marker but failed to delete
        // the output), but it can just as easily be an in-flight publish
        // (output renamed, marker not yet written — rename does not reset
        // mtime, so a slow publish's output can already look "old"). Age-based
        // eviction only ever touches marker-bearing groups to avoid reaping
        // a publish out from under a running caller; true orphans are left
        // to the size-based pass below, which at least bounds how long they
        // can linger.
        let mut expired: BTreeSet<String> = BTreeSet::new();
        for (cache_key, file, is_marker) in &entries {
            if *is_marker {
                let age = now.duration_since(file.mtime).unwrap_or(Duration::ZERO);
                if age > max_age {
                    expired.insert(cache_key.clone());
                }
            }
        }
        report.keys_expired = expired.len();

        let mut total_size: u64 = entries.iter().map(|(_, f, _)| f.size).sum();
        let mut survivors = Vec::with_capacity(entries.len());
        for (cache_key, file, is_marker) in entries {
            if expired.contains(&cache_key) {
                match fsops::remove_file_logged(&file.path) {
                    Some(freed) => {
                        report.bytes_freed += freed;
                        report.entries_evicted += 1;
                        total_size = total_size.saturating_sub(freed);
                    }
                    None => survivors.push((cache_key, file, is_marker)),
                }
            } else {
                survivors.push((cache_key, file, is_marker));
            }
        }

        if total_size > self.config.max_size_bytes {
            let mut groups: BTreeMap<String, Vec<ScannedFile>> = BTreeMap::new();
            for (cache_key, file, _) in survivors {
                groups.entry(cache_key).or_default().push(file);
            }
            let group_list: Vec<(String, u64, Vec<ScannedFile>)> = groups
                .into_iter()
                .map(|(cache_key, files)| {
                    let size = files.iter().map(|f| f.size).sum();
                    (cache_key, size, files)
                })
                .sorted_by_key(|(_, size, _)| std::cmp::Reverse(*size))
                .collect();

            for (cache_key, group_size, files) in group_list {
                if total_size <= self.config.max_size_bytes {
                    break;
                }
                debug!(%cache_key, group_size, "evicting group to reclaim space");
                for file in files {
                    if let Some(freed) = fsops::remove_file_logged(&file.path) {
                        report.bytes_freed += freed;
                        report.entries_evicted += 1;
                        total_size = total_size.saturating_sub(freed);
                    }
                }
            }
        }

        info!(
            files_scanned = report.files_scanned,
            keys_expired = report.keys_expired,
            entries_evicted = report.entries_evicted,
            bytes_freed = %format_size(report.bytes_freed, BINARY),
            unrecognised_files = report.unrecognised_files,
            "maintenance sweep complete"
        );
        Ok(report)
    }
}

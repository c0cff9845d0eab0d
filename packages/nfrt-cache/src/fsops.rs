//! Blocking filesystem primitives shared across the store and maintenance
//! components.
//!
//! Adapted from this codebase's async `fs` helpers to blocking `std::fs`,
//! since the store's operations are defined as blocking I/O.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use color_eyre::Result;
use color_eyre::eyre::{Context, ContextCompat};
use tap::TapFallible;
use tracing::{instrument, trace, warn};

/// Create the directory and all its parents, if they don't already exist.
#[instrument]
pub fn create_dir_all(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir)
        .with_context(|| format!("create dir: {}", dir.display()))
        .tap_ok(|_| trace!(?dir, "create directory"))
}

/// Return whether the path represents a regular file. `false` for missing
/// paths or any metadata error; this is inherently racy and only meant for
/// the existence checks this store already treats as advisory.
#[instrument]
pub fn is_file(path: &Path) -> bool {
    fs::metadata(path).is_ok_and(|m| m.is_file())
}

/// Return the file's mtime. Callers that want a "missing file" fallback
/// rather than a propagated error (e.g. the rate-gate clock, which treats an
/// absent state file as infinitely old) should `.unwrap_or(UNIX_EPOCH)` the
/// result themselves, as `maintenance.rs` does.
#[instrument]
pub fn mtime(path: &Path) -> Result<SystemTime> {
    fs::metadata(path)
        .with_context(|| format!("stat metadata: {}", path.display()))?
        .modified()
        .with_context(|| format!("read mtime: {}", path.display()))
}

/// Set the file's mtime to now. Used to implement touch-on-hit.
#[instrument]
pub fn touch(path: &Path) -> Result<()> {
    let now = filetime::FileTime::from_system_time(SystemTime::now());
    filetime::set_file_mtime(path, now)
        .with_context(|| format!("touch mtime: {}", path.display()))
        .tap_ok(|_| trace!(?path, "touch mtime"))
}

/// Read a file's contents as a UTF-8 string, or `None` if it doesn't exist.
#[instrument]
pub fn read_to_string_opt(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(contents) => Ok(Some(contents)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("read file: {}", path.display())),
    }
}

/// Write `contents` to `path` via write-to-temp + atomic rename, so that a
/// reader never observes a partially written file.
#[instrument(skip(contents))]
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = path.parent().with_context(|| format!("no parent dir: {}", path.display()))?;
    let file_name = path.file_name().with_context(|| format!("no file name: {}", path.display()))?;
    let temp_path = dir.join(format!(".tmp-{}", file_name.to_string_lossy()));
    fs::write(&temp_path, contents)
        .with_context(|| format!("write temp file: {}", temp_path.display()))?;
    rename_atomic(&temp_path, path)
        .with_context(|| format!("rename into place: {}", path.display()))?;
    trace!(?path, bytes = contents.len(), "write file atomically");
    Ok(())
}

/// Atomically move `src` to `dst`, replacing `dst` if it already exists.
///
/// Prefers a plain rename. Only falls back to copy+fsync+remove when the
/// rename fails because `src` and `dst` cross a filesystem boundary; any
/// other rename failure (permissions, a transient I/O error, ...) propagates
/// rather than being silently masked into a copy.
#[instrument]
pub fn rename_atomic(src: &Path, dst: &Path) -> Result<()> {
    match fs::rename(src, dst) {
        Ok(()) => {
            trace!(?src, ?dst, "rename file");
            Ok(())
        }
        Err(err) if err.kind() == io::ErrorKind::CrossesDevices => {
            // Copy by hand (rather than fs::copy, which hands back no open
            // handle) so the already-open, already-writable destination file
            // can be fsync'd directly — reopening it afterwards would fail
            // whenever fs::copy preserved a read-only source mode.
            let mut reader = fs::File::open(src)
                .with_context(|| format!("open source for copy: {}", src.display()))?;
            let mut writer = fs::File::create(dst)
                .with_context(|| format!("create destination for copy: {}", dst.display()))?;
            io::copy(&mut reader, &mut writer)
                .with_context(|| format!("copy {} to {}", src.display(), dst.display()))?;
            writer
                .sync_all()
                .with_context(|| format!("fsync destination after copy: {}", dst.display()))?;
            drop(writer);
            fs::remove_file(src)
                .with_context(|| format!("remove source after copy: {}", src.display()))?;
            trace!(?src, ?dst, "copy+remove file (cross-device rename)");
            Ok(())
        }
        Err(err) => {
            Err(err).with_context(|| format!("rename {} to {}", src.display(), dst.display()))
        }
    }
}

/// Delete a file, logging (rather than propagating) the failure.
///
/// Used by maintenance, which must keep sweeping other entries even when one
/// delete fails.
pub fn remove_file_logged(path: &Path) -> Option<u64> {
    let size = fs::metadata(path).map(|m| m.len()).ok();
    match fs::remove_file(path) {
        Ok(()) => {
            trace!(?path, "removed file");
            size
        }
        Err(err) => {
            warn!(?path, error = %err, "failed to delete cache entry file; leaving in place");
            None
        }
    }
}

/// One non-recursive directory entry: a regular file's path, bare filename,
/// byte size, and mtime.
#[derive(Clone, Debug)]
pub struct ScannedFile {
    pub path: PathBuf,
    pub file_name: String,
    pub size: u64,
    pub mtime: SystemTime,
}

/// Scan `dir` non-recursively, yielding only regular files.
///
/// Entries whose metadata cannot be read are logged and skipped rather than
/// aborting the whole scan.
#[instrument]
pub fn scan_dir_files(dir: &Path) -> Result<Vec<ScannedFile>> {
    let mut out = Vec::new();
    let entries =
        fs::read_dir(dir).with_context(|| format!("read directory: {}", dir.display()))?;
    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                warn!(?dir, error = %err, "failed to read directory entry; skipping");
                continue;
            }
        };
        let path = entry.path();
        let metadata = match entry.metadata() {
            Ok(metadata) => metadata,
            Err(err) => {
                warn!(?path, error = %err, "failed to stat directory entry; skipping");
                continue;
            }
        };
        if !metadata.is_file() {
            continue;
        }
        let mtime = match metadata.modified() {
            Ok(mtime) => mtime,
            Err(err) => {
                warn!(?path, error = %err, "failed to read mtime; skipping");
                continue;
            }
        };
        out.push(ScannedFile {
            file_name: entry.file_name().to_string_lossy().into_owned(),
            size: metadata.len(),
            mtime,
            path,
        });
    }
    Ok(out)
}

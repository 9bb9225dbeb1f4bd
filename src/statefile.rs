//! On-disk persisted state (§6.4): `disk-mapping.json` binds each
//! gadget volume to the physical disk found for it at install time, so
//! update time can find the same disk again without re-probing every
//! block device.

use crate::matcher::DiskVolumeDeviceTraits;
use anyhow::{Context, Result};
use fn_error_context::context;
use fs2::FileExt;
use openat_ext::OpenatDirExt;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::prelude::*;
use std::path::Path;

/// `map<VolumeName, DiskVolumeDeviceTraits>`, the shape stored in
/// `disk-mapping.json`.
pub type DiskMapping = BTreeMap<String, DiskVolumeDeviceTraits>;

/// Relative to the caller-supplied state root.
pub const STATEFILE_NAME: &str = "disk-mapping.json";
/// Relative to the caller-supplied state root; guards concurrent
/// updaters the same way `bootupd`'s write lock guards its statefile.
const WRITE_LOCK_PATH: &str = "disk-mapping.lock";

/// Load the persisted disk mapping, if one exists yet (absent before
/// the first successful install).
#[context("Loading disk mapping")]
pub fn load_from_disk(state_dir: impl AsRef<Path>) -> Result<Option<DiskMapping>> {
    let state_dir = state_dir.as_ref();
    if !state_dir.exists() {
        return Ok(None);
    }
    let dir = openat::Dir::open(state_dir)
        .with_context(|| format!("opening state dir '{}'", state_dir.display()))?;
    let Some(f) = dir.open_file_optional(STATEFILE_NAME)? else {
        return Ok(None);
    };
    let mut bufr = std::io::BufReader::new(f);
    let mut s = String::new();
    bufr.read_to_string(&mut s)?;
    let mapping: DiskMapping = serde_json::from_str(&s)?;
    Ok(Some(mapping))
}

/// Acquire the write lock guarding `disk-mapping.json`, creating
/// `state_dir` if it doesn't already exist.
pub fn acquire_write_lock(state_dir: impl AsRef<Path>) -> Result<StateLockGuard> {
    let state_dir = state_dir.as_ref();
    std::fs::create_dir_all(state_dir)
        .with_context(|| format!("creating state dir '{}'", state_dir.display()))?;
    let dir = openat::Dir::open(state_dir)
        .with_context(|| format!("opening state dir '{}'", state_dir.display()))?;
    let lockfile = dir.write_file(WRITE_LOCK_PATH, 0o644)?;
    lockfile.lock_exclusive()?;
    Ok(StateLockGuard {
        dir,
        lockfile: Some(lockfile),
    })
}

/// Write-lock guard for `disk-mapping.json`, protecting against
/// concurrent updaters racing each other's persisted traits.
#[derive(Debug)]
pub struct StateLockGuard {
    dir: openat::Dir,
    #[allow(dead_code)]
    lockfile: Option<File>,
}

impl StateLockGuard {
    /// Atomically replace the on-disk mapping with a new version.
    pub fn update_state(&mut self, mapping: &DiskMapping) -> Result<()> {
        self.dir
            .write_file_with_sync(STATEFILE_NAME, 0o644, |w| -> Result<()> {
                serde_json::to_writer(w, mapping)?;
                Ok(())
            })?;
        Ok(())
    }
}

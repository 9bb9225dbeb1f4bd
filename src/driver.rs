//! Update driver (component J, §4.8): orchestrates the three-phase
//! backup/write/rollback pass across all selected structures.

use crate::error::{Error, Result};
use crate::layout::{LaidOutStructure, LaidOutVolume};
use crate::locate::{Location, VolumeLocationMap};
use crate::mountedfs::{filter_kernel_update, MountedFsUpdater};
use crate::raw::RawUpdater;
use crate::updater::{UpdateOutcome, Updater};
use camino::Utf8Path;
use log::{debug, warn};
use std::collections::BTreeMap;

/// Driver states, §4.8: `Idle → Planning → Backing-up → Ready → Writing
/// → {Committed | Rolling-back → Reverted | Rolled-back-with-errors}`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DriverState {
    Idle,
    Planning,
    BackingUp,
    Ready,
    Writing,
    Committed,
    RollingBack,
    Reverted,
    RolledBackWithErrors,
}

fn transition(prev: DriverState, next: DriverState) -> DriverState {
    debug!("driver: {prev:?} -> {next:?}");
    next
}

/// Selects which structures qualify for an update (§4.8).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Policy {
    /// Update when `new.edition > old.edition`.
    Default,
    /// Update every non-mbr structure regardless of edition.
    Remodel,
    /// Update only structures whose new content references a kernel
    /// asset marked `update: true`; each update is filtered to that
    /// subset (S6).
    Kernel,
}

/// External observer hooks. The driver calls `before_write` exactly
/// once between phase 1 and phase 3, and `canceled` at most once on any
/// failure path (§5).
pub trait Observer {
    fn before_write(&mut self) -> Result<()> {
        Ok(())
    }
    fn canceled(&mut self) {}
}

/// An [`Observer`] that does nothing; the default for callers that
/// don't need the hooks.
#[derive(Default)]
pub struct NoopObserver;
impl Observer for NoopObserver {}

/// Checks role, type, filesystem, id, name (GPT only), filesystem
/// label, and that the new structure's offset/size remain within the
/// tolerance window the old structure's min/max sizes allow (§4.8).
fn can_update_structure(old: &LaidOutStructure, new: &LaidOutStructure) -> Result<()> {
    let o = &old.structure;
    let n = &new.structure;
    let name = n.name.clone().unwrap_or_default();

    if o.role != n.role {
        return Err(Error::IncompatibleManifest(format!(
            "structure {name:?} changed role from {:?} to {:?}",
            o.role, n.role
        )));
    }
    if o.structure_type != n.structure_type {
        return Err(Error::IncompatibleManifest(format!(
            "structure {name:?} changed type"
        )));
    }
    if o.filesystem != n.filesystem {
        return Err(Error::IncompatibleManifest(format!(
            "structure {name:?} changed filesystem"
        )));
    }
    if o.id != n.id {
        return Err(Error::IncompatibleManifest(format!(
            "structure {name:?} changed partition id"
        )));
    }
    if matches!(o.structure_type, crate::manifest::StructureType::Guid(_)) && o.name != n.name {
        return Err(Error::IncompatibleManifest(format!(
            "GPT structure name changed from {:?} to {:?}",
            o.name, n.name
        )));
    }

    let window_hi = old.start_offset.0 + o.size.0.saturating_sub(o.min_size.0);
    if new.start_offset.0 < old.start_offset.0 || new.start_offset.0 > window_hi {
        return Err(Error::IncompatibleManifest(format!(
            "structure {name:?} moved outside the offset tolerance the old layout allows"
        )));
    }
    let size_hi = if o.size.0 != 0 { o.size.0 } else { u64::MAX };
    if n.min_size.0 < o.min_size.0
        || (n.size.0 != 0 && n.size.0 > size_hi && n.role != crate::manifest::Role::SystemData)
    {
        return Err(Error::IncompatibleManifest(format!(
            "structure {name:?} size range is incompatible with the old layout"
        )));
    }
    Ok(())
}

fn select_structures(
    old: &LaidOutVolume,
    new: &LaidOutVolume,
    policy: Policy,
) -> Vec<usize> {
    let old_by_index: BTreeMap<usize, &LaidOutStructure> =
        old.structure.iter().map(|s| (s.yaml_index, s)).collect();

    new.structure
        .iter()
        .filter(|s| match policy {
            Policy::Default => old_by_index
                .get(&s.yaml_index)
                .is_some_and(|o| s.structure.update.edition > o.structure.update.edition),
            Policy::Remodel => s.structure.role != crate::manifest::Role::Mbr,
            Policy::Kernel => s.resolved_content.iter().any(|c| c.kernel_update),
        })
        .map(|s| s.yaml_index)
        .collect()
}

fn updater_for<'a>(
    location: &Location,
    structure: &LaidOutStructure,
    vol_name: &str,
    gadget_root: &'a Utf8Path,
    rollback_dir: &'a Utf8Path,
    policy: Policy,
    structure_offsets: &BTreeMap<String, u64>,
) -> Result<Box<dyn Updater + 'a>> {
    match location {
        Location::Device { node, offset } => Ok(Box::new(RawUpdater {
            device: node.clone().into(),
            gadget_root,
            rollback_dir,
            vol_name: vol_name.to_string(),
            structure_name: structure.structure.name.clone(),
            yaml_index: structure.yaml_index,
            structure_start_offset: *offset,
            structure_size: structure.structure.size.0,
            sector_size: 512,
            contents: structure.laid_out_content.clone(),
            structure_offsets: structure_offsets.clone(),
        })),
        Location::RootMountPoint { path } => {
            let contents = if policy == Policy::Kernel {
                filter_kernel_update(&structure.resolved_content)
            } else {
                structure.resolved_content.clone()
            };
            Ok(Box::new(MountedFsUpdater {
                mount_point: path.clone().into(),
                rollback_dir,
                vol_name: vol_name.to_string(),
                yaml_index: structure.yaml_index,
                contents,
                preserve: structure.structure.update.preserve.clone(),
            }))
        }
        Location::Unresolved => Err(Error::MountNotFound(format!(
            "structure {:?} has no resolved location; refusing to bump its edition",
            structure.structure.name
        ))),
    }
}

/// Run one update pass. Returns the final [`DriverState`] on success
/// (always [`DriverState::Committed`] or an informational error);
/// returns `Err` on any other outcome, with rollback already completed
/// for whatever was written in phase 3.
pub fn run_update(
    vol_name: &str,
    old: &LaidOutVolume,
    new: &LaidOutVolume,
    location_map: &VolumeLocationMap,
    rollback_dir: &Utf8Path,
    gadget_root: &Utf8Path,
    policy: Policy,
    observer: &mut dyn Observer,
) -> Result<DriverState> {
    let mut state = transition(DriverState::Idle, DriverState::Planning);

    if old.structure.len() != new.structure.len() {
        return Err(Error::IncompatibleManifest(format!(
            "volume {vol_name:?} structure count changed from {} to {}",
            old.structure.len(),
            new.structure.len()
        )));
    }
    let old_by_index: BTreeMap<usize, &LaidOutStructure> =
        old.structure.iter().map(|s| (s.yaml_index, s)).collect();
    for new_s in &new.structure {
        let Some(old_s) = old_by_index.get(&new_s.yaml_index) else {
            return Err(Error::IncompatibleManifest(format!(
                "volume {vol_name:?} gained a structure at index {}",
                new_s.yaml_index
            )));
        };
        can_update_structure(old_s, new_s)?;
    }

    let selected = select_structures(old, new, policy);
    if selected.is_empty() {
        return Err(Error::NoUpdate);
    }

    let new_by_index: BTreeMap<usize, &LaidOutStructure> =
        new.structure.iter().map(|s| (s.yaml_index, s)).collect();
    let structure_offsets: BTreeMap<String, u64> = new
        .structure
        .iter()
        .filter_map(|s| s.structure.name.clone().map(|name| (name, s.start_offset.0)))
        .collect();

    state = transition(state, DriverState::BackingUp);
    let mut updaters = Vec::new();
    for &idx in &selected {
        let structure = new_by_index[&idx];
        let location = location_map.get(&idx).unwrap_or(&Location::Unresolved);
        let mut updater = match updater_for(
            location,
            structure,
            vol_name,
            gadget_root,
            rollback_dir,
            policy,
            &structure_offsets,
        ) {
            Ok(u) => u,
            Err(e) => {
                observer.canceled();
                return Err(e);
            }
        };
        if let Err(e) = updater.backup() {
            observer.canceled();
            return Err(e);
        }
        updaters.push((idx, updater));
    }

    state = transition(state, DriverState::Ready);
    if let Err(e) = observer.before_write() {
        observer.canceled();
        return Err(e);
    }

    state = transition(state, DriverState::Writing);
    let mut written = Vec::new();
    for (pos, (idx, updater)) in updaters.iter_mut().enumerate() {
        match updater.update() {
            Ok(UpdateOutcome::Updated) => written.push(pos),
            Ok(UpdateOutcome::NoUpdate) => {}
            Err(write_err) => {
                transition(state, DriverState::RollingBack);
                let mut rollback_error = None;
                for &done in written.iter().rev() {
                    let (done_idx, done_updater) = &mut updaters[done];
                    if let Err(rb_err) = done_updater.rollback() {
                        warn!("rollback of structure index {done_idx} failed: {rb_err}");
                        rollback_error.get_or_insert(rb_err);
                    }
                }
                observer.canceled();
                let _ = idx;
                return match rollback_error {
                    Some(rb_err) => Err(Error::RollbackFailed {
                        original: write_err.to_string(),
                        rollback: rb_err.to_string(),
                    }),
                    None => Err(write_err),
                };
            }
        }
    }

    Ok(transition(state, DriverState::Committed))
}

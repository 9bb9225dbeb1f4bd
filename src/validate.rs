//! The validator (component C): structural and cross-structure
//! invariants from §3.5 / §4.2.

use crate::error::{Error, Result};
use crate::manifest::{Info, Role, Volume, VolumeContent, VolumeStructure};
use regex::Regex;
use std::collections::HashSet;
use std::sync::OnceLock;

/// Whether the caller supplied model constraints (classic/seed) or left
/// the validator to infer auto-consistency (§4.2 "Consistency mode").
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ModelConstraints {
    pub classic: bool,
    pub seed_required: Option<bool>,
}

fn volume_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9-]+$").unwrap())
}

/// Validate an entire [`Info`] document. Returns the first violation
/// encountered; callers that want every violation should call
/// [`validate_volume`] per volume directly.
pub fn validate(info: &Info, constraints: ModelConstraints) -> Result<()> {
    let mut bootloader_count = 0;
    for volume in info.volumes.values() {
        validate_volume(volume, constraints)?;
        if volume.bootloader.is_some() {
            bootloader_count += 1;
        }
    }
    // Invariant 2: exactly one bootloader, unless every volume defers its
    // structure to the installer (schema `partial:structure`).
    let all_partial_structure = info
        .volumes
        .values()
        .all(|v| v.partial.structure);
    if !all_partial_structure && bootloader_count != 1 {
        return Err(Error::Invalid(format!(
            "exactly one volume must declare a bootloader, found {bootloader_count}"
        )));
    }
    Ok(())
}

/// Validate a single volume: structure-local checks first, then the
/// cross-structure pass over structures sorted by `start_offset`.
pub fn validate_volume(volume: &Volume, constraints: ModelConstraints) -> Result<()> {
    if !volume_name_re().is_match(&volume.name) {
        return Err(Error::Invalid(format!(
            "volume name {:?} doesn't match ^[A-Za-z0-9][A-Za-z0-9-]+$",
            volume.name
        )));
    }

    let seeded = volume.is_seeded();
    if let Some(seed_required) = constraints.seed_required {
        if seed_required && !seeded {
            return Err(Error::Invalid(
                "constraints require a system-seed structure but none is present".into(),
            ));
        }
    }

    let mut names = HashSet::new();
    let mut labels = HashSet::new();
    let mut roles_seen = HashSet::new();
    for structure in &volume.structure {
        validate_structure_local(volume, structure)?;

        if let Some(name) = &structure.name {
            if !names.insert(name.as_str()) {
                return Err(Error::Invalid(format!(
                    "duplicate structure name {name:?} in volume {:?}",
                    volume.name
                )));
            }
        }
        if let Some(label) = structure.effective_label(seeded) {
            // Duplicate filesystem labels are rejected unconditionally, even
            // when one of the structures is `partial:filesystem` (open
            // question (i), resolved in DESIGN.md).
            if !labels.insert(label) {
                return Err(Error::Invalid(format!(
                    "duplicate filesystem label {:?} in volume {:?}",
                    structure.effective_label(seeded),
                    volume.name
                )));
            }
        }
        if matches!(
            structure.role,
            Role::Mbr | Role::SystemBoot | Role::SystemSeed | Role::SystemData | Role::SystemSave
        ) && !roles_seen.insert(structure.role)
        {
            return Err(Error::Invalid(format!(
                "role {:?} declared more than once in volume {:?}",
                structure.role, volume.name
            )));
        }
    }

    validate_cross_structure(volume)?;
    Ok(())
}

fn validate_structure_local(volume: &Volume, s: &VolumeStructure) -> Result<()> {
    // Invariant 7: filesystem must be permitted by schema.
    if !s.filesystem.allowed_for(volume.schema) {
        return Err(Error::Invalid(format!(
            "filesystem {:?} not permitted under schema {:?}",
            s.filesystem, volume.schema
        )));
    }

    // Invariant 8: bare content only in bare structures, filesystem
    // content only in filesystem structures.
    for c in &s.content {
        match c {
            VolumeContent::Image(_) if !s.is_bare() => {
                return Err(Error::Invalid(format!(
                    "structure {:?} has image content but is not of type bare",
                    s.name
                )));
            }
            VolumeContent::Filesystem(_) if s.is_bare() => {
                return Err(Error::Invalid(format!(
                    "structure {:?} is bare but has filesystem content",
                    s.name
                )));
            }
            _ => {}
        }
    }
    if !s.is_bare() && !s.filesystem.is_filesystem() && !s.content.is_empty() {
        return Err(Error::NoFilesystemDefined(
            s.name.clone().unwrap_or_default(),
        ));
    }

    // Invariant 4: mbr-role structures.
    if s.role == Role::Mbr {
        if s.offset.is_some_and(|o| o.0 != 0) {
            return Err(Error::Invalid("mbr-role structure must start at offset 0".into()));
        }
        if s.size.0 > 446 {
            return Err(Error::Invalid(
                "mbr-role structure must occupy at most 446 bytes".into(),
            ));
        }
        if s.id.is_some() {
            return Err(Error::Invalid(
                "mbr-role structure must not declare a partition id".into(),
            ));
        }
        if s.filesystem.is_filesystem() {
            return Err(Error::Invalid(
                "mbr-role structure must not declare a filesystem".into(),
            ));
        }
    }

    // Invariant 9: offset_write.relative_to must name a sibling structure.
    if let Some(rel) = &s.offset_write {
        if let Some(target) = &rel.relative_to {
            if volume.structure_by_name(target).is_none() {
                return Err(Error::Invalid(format!(
                    "offset-write relative-to {target:?} doesn't name a structure in volume {:?}",
                    volume.name
                )));
            }
        }
    }

    // update.preserve entries must be unique.
    let mut preserve = HashSet::new();
    for p in &s.update.preserve {
        if !preserve.insert(p.as_str()) {
            return Err(Error::Invalid(format!(
                "duplicate preserve entry {p:?} in structure {:?}",
                s.name
            )));
        }
    }

    // Invariant 6: size == 0 only permitted for partial:size volumes.
    if s.size.0 == 0 && !volume.partial.size {
        return Err(Error::Invalid(format!(
            "structure {:?} has size 0 but volume isn't partial:size",
            s.name
        )));
    }
    if s.size.0 != 0 && s.size.0 < s.min_size.0 {
        return Err(Error::Invalid(format!(
            "structure {:?} size {} is smaller than min-size {}",
            s.name, s.size.0, s.min_size.0
        )));
    }

    Ok(())
}

fn validate_cross_structure(volume: &Volume) -> Result<()> {
    let mut sorted: Vec<&VolumeStructure> = volume.structure.iter().collect();
    sorted.sort_by_key(|s| s.offset.map(|o| o.0).unwrap_or(u64::MAX));

    // Non-overlap, but only among structures with an explicit, and
    // therefore comparable, offset: fully implicit layouts are checked
    // for overlap by the layout engine itself once offsets are resolved.
    let mut prev_end: Option<u64> = None;
    for s in sorted.iter().filter(|s| s.offset.is_some()) {
        let start = s.offset.unwrap().0;
        if let Some(prev_end) = prev_end {
            if start < prev_end {
                return Err(Error::Invalid(format!(
                    "structure {:?} at offset {start} overlaps the previous structure ending at {prev_end}",
                    s.name
                )));
            }
        }
        prev_end = Some(start + s.size.0);
    }
    Ok(())
}

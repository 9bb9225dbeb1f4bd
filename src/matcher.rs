//! Compatibility matcher (component F, §4.6): checks a laid-out volume
//! against a probed on-disk volume.

use crate::diskprobe::{probe_disk, DiskProvider, OnDiskStructure, OnDiskVolume};
use crate::error::{Error, Result};
use crate::layout::LaidOutVolume;
use crate::manifest::Role;
use crate::quantity::{Offset, Size};
use crate::system::UdevLookup;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Declares that a structure's on-disk filesystem should be an
/// encrypted block (LUKS or ICE), keyed by structure name.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EncryptionMethod {
    Luks,
    Ice,
}

/// Per-structure trait record persisted across install and update
/// (§6.4's `disk-mapping.json` is a mapping of `Volume::name` to this).
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct StructureTraits {
    pub device_node: String,
    pub partition_label: Option<String>,
    pub partition_uuid: Option<String>,
    pub filesystem_label: Option<String>,
    pub filesystem_uuid: Option<String>,
    pub filesystem_type: Option<String>,
    pub offset: Offset,
    pub size: Size,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct DiskVolumeDeviceTraits {
    pub disk_id: String,
    pub device: String,
    pub sector_size: Size,
    pub schema: crate::manifest::Schema,
    pub size: Size,
    pub structure: BTreeMap<String, StructureTraits>,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct MatchOptions {
    pub allow_implicit_system_data: bool,
}

/// Probe `device` and validate it against `volume`, producing the
/// persistable [`DiskVolumeDeviceTraits`] on success. `udev` fills in
/// `partition_uuid`/`filesystem_uuid`, which the disk probe alone
/// can't determine.
pub fn disk_traits_from_device_and_validate(
    volume: &LaidOutVolume,
    provider: &dyn DiskProvider,
    encryption: &BTreeMap<String, EncryptionMethod>,
    opts: MatchOptions,
    udev: &dyn UdevLookup,
) -> Result<DiskVolumeDeviceTraits> {
    let on_disk = probe_disk(provider)?;
    validate_against_disk(volume, &on_disk, encryption, opts, udev)
}

fn validate_against_disk(
    volume: &LaidOutVolume,
    on_disk: &OnDiskVolume,
    encryption: &BTreeMap<String, EncryptionMethod>,
    opts: MatchOptions,
    udev: &dyn UdevLookup,
) -> Result<DiskVolumeDeviceTraits> {
    let mut structure_traits = BTreeMap::new();
    let mut matched_disk_structures: Vec<bool> = vec![false; on_disk.structure.len()];

    let has_system_data = volume
        .structure
        .iter()
        .any(|s| s.structure.role == Role::SystemData);

    for gadget_structure in &volume.structure {
        if gadget_structure.structure.is_bare() {
            continue;
        }
        let name = gadget_structure
            .structure
            .name
            .clone()
            .unwrap_or_default();

        let (idx, on_disk_structure) = find_matching_partition(on_disk, gadget_structure)
            .ok_or_else(|| {
                Error::NotCompatible(format!(
                    "no on-disk partition found within the expected offset range for structure {name:?}"
                ))
            })?;
        matched_disk_structures[idx] = true;

        check_size(&name, gadget_structure, on_disk_structure)?;

        if let Some(method) = encryption.get(&name) {
            check_encryption(&name, method, on_disk_structure)?;
        }

        structure_traits.insert(
            name,
            StructureTraits {
                device_node: on_disk_structure.node.clone(),
                partition_label: on_disk_structure.name.clone(),
                partition_uuid: udev.partition_uuid(&on_disk_structure.node)?,
                filesystem_label: on_disk_structure.partition_fs_label.clone(),
                filesystem_uuid: udev.filesystem_uuid(&on_disk_structure.node)?,
                filesystem_type: on_disk_structure.partition_fs_type.clone(),
                offset: on_disk_structure.start_offset,
                size: on_disk_structure.size,
            },
        );
    }

    // Invariant from §4.6 step 4: a single trailing unmatched partition is
    // tolerated (UC16 implicit system-data) iff the gadget declares no
    // system-data role of its own.
    let unmatched: Vec<usize> = matched_disk_structures
        .iter()
        .enumerate()
        .filter(|(_, matched)| !**matched)
        .map(|(i, _)| i)
        .collect();
    match unmatched.as_slice() {
        [] => {}
        [only] if *only == on_disk.structure.len() - 1 && opts.allow_implicit_system_data && !has_system_data => {
            let s = &on_disk.structure[*only];
            structure_traits.insert(
                "system-data".to_string(),
                StructureTraits {
                    device_node: s.node.clone(),
                    partition_label: s.name.clone(),
                    partition_uuid: udev.partition_uuid(&s.node)?,
                    filesystem_label: s.partition_fs_label.clone(),
                    filesystem_uuid: udev.filesystem_uuid(&s.node)?,
                    filesystem_type: s.partition_fs_type.clone(),
                    offset: s.start_offset,
                    size: s.size,
                },
            );
        }
        _ => {
            return Err(Error::NotCompatible(format!(
                "{} on-disk partition(s) have no matching gadget structure",
                unmatched.len()
            )));
        }
    }

    Ok(DiskVolumeDeviceTraits {
        disk_id: on_disk.id.clone(),
        device: on_disk.device.clone(),
        sector_size: on_disk.sector_size,
        schema: on_disk.schema,
        size: on_disk.size,
        structure: structure_traits,
    })
}

fn find_matching_partition<'a>(
    on_disk: &'a OnDiskVolume,
    gadget_structure: &crate::layout::LaidOutStructure,
) -> Option<(usize, &'a OnDiskStructure)> {
    let lo = gadget_structure.start_offset.0;
    let hi = if gadget_structure.structure.offset.is_some() {
        lo
    } else {
        lo + gadget_structure.structure.size.0.saturating_sub(gadget_structure.structure.min_size.0)
    };
    on_disk
        .structure
        .iter()
        .enumerate()
        .find(|(_, s)| s.start_offset.0 >= lo && s.start_offset.0 <= hi)
}

fn check_size(
    name: &str,
    gadget_structure: &crate::layout::LaidOutStructure,
    on_disk_structure: &OnDiskStructure,
) -> Result<()> {
    let min_size = gadget_structure.structure.min_size.0;
    if on_disk_structure.size.0 < min_size {
        return Err(Error::NotCompatible(format!(
            "on disk size {} is smaller than gadget min size {}",
            on_disk_structure.size.0, min_size
        )));
    }
    let fixed_size = gadget_structure.structure.size.0;
    let is_last_system_data = gadget_structure.structure.role == Role::SystemData;
    if fixed_size != 0 && on_disk_structure.size.0 > fixed_size && !is_last_system_data {
        return Err(Error::NotCompatible(format!(
            "on disk size {} exceeds gadget fixed size {} for structure {name:?}",
            on_disk_structure.size.0, fixed_size
        )));
    }
    Ok(())
}

fn check_encryption(
    name: &str,
    method: &EncryptionMethod,
    on_disk_structure: &OnDiskStructure,
) -> Result<()> {
    let expected = match method {
        EncryptionMethod::Luks => "crypto_LUKS",
        EncryptionMethod::Ice => "crypto_ICE",
    };
    match &on_disk_structure.partition_fs_type {
        Some(fs_type) if fs_type == expected => Ok(()),
        _ => Err(Error::NotCompatible(format!(
            "structure {name:?} is declared as {expected} but disk reports {:?}",
            on_disk_structure.partition_fs_type
        ))),
    }
}

/// Reverses the lookup at update time (§4.6): find the current kernel
/// device path given persisted traits, trying the saved path first.
pub fn search_volume_with_traits_and_match_parts(
    traits: &DiskVolumeDeviceTraits,
    saved_kernel_path: Option<&str>,
    candidate_sysfs_devices: &[(&str, &str)],
) -> Result<String> {
    if let Some(path) = saved_kernel_path {
        if candidate_sysfs_devices.iter().any(|(dev, _)| *dev == path) {
            return Ok(path.to_string());
        }
    }
    for (dev, disk_id) in candidate_sysfs_devices {
        if *disk_id == traits.disk_id {
            return Ok(dev.to_string());
        }
    }
    Err(Error::DeviceNotFound(format!(
        "no device found matching disk id {:?}",
        traits.disk_id
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{layout_volume, LayoutOptions};
    use crate::manifest::{Filesystem, PartialFields, Schema, StructureType, UpdateInfo, Volume, VolumeStructure};
    use camino::Utf8Path;

    fn structure(name: &str, offset: u64, size: u64, role: Role) -> VolumeStructure {
        VolumeStructure {
            name: Some(name.into()),
            label: None,
            role,
            structure_type: StructureType::Guid(uuid::Uuid::nil()),
            id: None,
            filesystem: Filesystem::Vfat,
            offset: Some(Offset(offset)),
            offset_write: None,
            min_size: Size(size),
            size: Size(size),
            content: vec![],
            update: UpdateInfo::default(),
            yaml_index: 0,
        }
    }

    fn disk_structure(node: &str, offset: u64, size: u64, idx: u32) -> OnDiskStructure {
        OnDiskStructure {
            name: Some(node.into()),
            partition_type: "EF".into(),
            partition_fs_label: None,
            partition_fs_type: Some("vfat".into()),
            start_offset: Offset(offset),
            size: Size(size),
            node: node.into(),
            disk_index: idx,
        }
    }

    struct NoUdev;
    impl UdevLookup for NoUdev {
        fn partition_uuid(&self, _device: &str) -> Result<Option<String>> {
            Ok(None)
        }
        fn filesystem_uuid(&self, _device: &str) -> Result<Option<String>> {
            Ok(None)
        }
    }

    #[test]
    fn test_s3_matcher_rejects_shrunken_partition() {
        let recovery = structure("Recovery", 2 << 20, 1200 * (1 << 20), Role::None);
        let volume = Volume {
            name: "pc".into(),
            schema: Schema::Gpt,
            bootloader: None,
            id: None,
            partial: PartialFields::default(),
            structure: vec![recovery],
        };
        let tmp = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(tmp.path()).unwrap();
        let laid_out = layout_volume(&volume, root, None, LayoutOptions::default()).unwrap();

        let on_disk = OnDiskVolume {
            schema: Schema::Gpt,
            id: "disk-id".into(),
            device: "/dev/sda".into(),
            size: Size(1 << 30),
            usable_sectors_end: Offset(0),
            sector_size: Size(512),
            structure: vec![disk_structure("/dev/sda1", 2 << 20, 4096, 1)],
        };

        let err = validate_against_disk(&laid_out, &on_disk, &BTreeMap::new(), MatchOptions::default(), &NoUdev)
            .unwrap_err();
        assert!(matches!(err, Error::NotCompatible(_)));
    }

    #[test]
    fn test_s4_expanded_system_data_accepted() {
        let data = structure("system-data", 2 << 20, 1 << 30, Role::SystemData);
        let volume = Volume {
            name: "pc".into(),
            schema: Schema::Gpt,
            bootloader: None,
            id: None,
            partial: PartialFields::default(),
            structure: vec![data],
        };
        let tmp = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(tmp.path()).unwrap();
        let laid_out = layout_volume(&volume, root, None, LayoutOptions::default()).unwrap();

        let on_disk = OnDiskVolume {
            schema: Schema::Gpt,
            id: "disk-id".into(),
            device: "/dev/sda".into(),
            size: Size(4 << 30),
            usable_sectors_end: Offset(0),
            sector_size: Size(512),
            structure: vec![disk_structure("/dev/sda1", 2 << 20, 3200 * (1 << 20), 1)],
        };

        let traits = validate_against_disk(&laid_out, &on_disk, &BTreeMap::new(), MatchOptions::default(), &NoUdev)
            .unwrap();
        assert_eq!(
            traits.structure["system-data"].size,
            Size(3200 * (1 << 20))
        );
    }

    #[test]
    fn test_udev_lookup_fills_partition_and_filesystem_uuid() {
        struct StaticUdev;
        impl UdevLookup for StaticUdev {
            fn partition_uuid(&self, _device: &str) -> Result<Option<String>> {
                Ok(Some("part-uuid".into()))
            }
            fn filesystem_uuid(&self, _device: &str) -> Result<Option<String>> {
                Ok(Some("fs-uuid".into()))
            }
        }

        let recovery = structure("Recovery", 2 << 20, 1200 * (1 << 20), Role::None);
        let volume = Volume {
            name: "pc".into(),
            schema: Schema::Gpt,
            bootloader: None,
            id: None,
            partial: PartialFields::default(),
            structure: vec![recovery],
        };
        let tmp = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(tmp.path()).unwrap();
        let laid_out = layout_volume(&volume, root, None, LayoutOptions::default()).unwrap();

        let on_disk = OnDiskVolume {
            schema: Schema::Gpt,
            id: "disk-id".into(),
            device: "/dev/sda".into(),
            size: Size(4 << 30),
            usable_sectors_end: Offset(0),
            sector_size: Size(512),
            structure: vec![disk_structure("/dev/sda1", 2 << 20, 1200 * (1 << 20), 1)],
        };

        let traits = validate_against_disk(
            &laid_out,
            &on_disk,
            &BTreeMap::new(),
            MatchOptions::default(),
            &StaticUdev,
        )
        .unwrap();
        let recovery_traits = &traits.structure["Recovery"];
        assert_eq!(recovery_traits.partition_uuid.as_deref(), Some("part-uuid"));
        assert_eq!(recovery_traits.filesystem_uuid.as_deref(), Some("fs-uuid"));
    }
}

//! Structure-to-location map (component G, §4.7): resolves each
//! updatable structure to either a raw device range or a mount point.

use crate::error::{Error, Result};
use crate::layout::LaidOutVolume;
use crate::manifest::Role;
use crate::matcher::DiskVolumeDeviceTraits;
use log::warn;
use std::collections::BTreeMap;

/// Where a structure's content should be written.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Location {
    /// Raw writes at a byte offset inside a device node.
    Device { node: String, offset: u64 },
    /// Filesystem writes rooted at a mount point.
    RootMountPoint { path: String },
    /// Present in the gadget but not updatable right now (e.g. an
    /// encrypted partition without an opened mapping).
    Unresolved,
}

/// One mount table entry, as read from `/proc/self/mountinfo`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MountEntry {
    pub root: String,
    pub mount_dir: String,
    pub fs_type: String,
    pub source_device: String,
    pub read_only: bool,
}

/// The `/proc/self/mountinfo` reader collaborator (§6.2).
pub trait MountInfo {
    fn mounts(&self) -> Result<Vec<MountEntry>>;
}

/// `map<YamlIndex, Location>` for a single volume.
pub type VolumeLocationMap = BTreeMap<usize, Location>;
/// `map<VolName, VolumeLocationMap>` across all volumes touched by an
/// update (old and new manifests paired by structure identity).
pub type LocationMap = BTreeMap<String, VolumeLocationMap>;

/// Build the structure-to-location map for an update spanning `old` and
/// `new` laid-out volumes of the same gadget. `traits` is the persisted
/// binding from a prior install; `None` means the disk binding is still
/// ambiguous (pre-seed path, §4.7 step 1), and this returns
/// [`Error::SkipUpdateProceedRefresh`] rather than a map.
pub fn volume_structure_to_location_map(
    old: &LaidOutVolume,
    traits: Option<&DiskVolumeDeviceTraits>,
    mount_info: &dyn MountInfo,
    encrypted: &[String],
) -> Result<VolumeLocationMap> {
    let mounts = mount_info.mounts()?;
    let Some(traits) = traits else {
        warn!(
            "no persisted disk traits for volume {:?}; ambiguous device binding, skipping gadget asset update",
            old.volume.name
        );
        return Err(Error::SkipUpdateProceedRefresh);
    };

    let mut map = VolumeLocationMap::new();
    for s in &old.structure {
        if s.structure.is_bare() || s.structure.role == Role::Mbr {
            let node = traits.device.clone();
            map.insert(
                s.yaml_index,
                Location::Device {
                    node,
                    offset: s.start_offset.0,
                },
            );
            continue;
        }

        let name = s.structure.name.clone().unwrap_or_default();
        if encrypted.iter().any(|n| n == &name) {
            map.insert(s.yaml_index, Location::Unresolved);
            continue;
        }

        let Some(structure_traits) = traits.structure.get(&name) else {
            map.insert(s.yaml_index, Location::Unresolved);
            continue;
        };

        match find_mount_for_partition(&mounts, structure_traits) {
            Some(mount) => {
                map.insert(
                    s.yaml_index,
                    Location::RootMountPoint {
                        path: mount.mount_dir.clone(),
                    },
                );
            }
            None => {
                map.insert(s.yaml_index, Location::Unresolved);
            }
        }
    }
    Ok(map)
}

/// Pick a read-write mount whose source device matches the partition.
/// When multiple candidates exist, resolution is deterministic: shortest
/// `mount_dir` wins, ties broken lexicographically (open question (ii),
/// resolved).
fn find_mount_for_partition<'a>(
    mounts: &'a [MountEntry],
    traits: &crate::matcher::StructureTraits,
) -> Option<&'a MountEntry> {
    let mut candidates: Vec<&MountEntry> = mounts
        .iter()
        .filter(|m| !m.read_only)
        .filter(|m| m.source_device == traits.device_node)
        .collect();
    candidates.sort_by(|a, b| {
        a.mount_dir
            .len()
            .cmp(&b.mount_dir.len())
            .then_with(|| a.mount_dir.cmp(&b.mount_dir))
    });
    candidates.into_iter().next()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{LaidOutStructure, LaidOutVolume};
    use crate::manifest::{
        Filesystem, PartialFields, Schema, StructureType, UpdateInfo, Volume, VolumeStructure,
    };
    use crate::quantity::{Offset, Size};

    struct EmptyMountInfo;
    impl MountInfo for EmptyMountInfo {
        fn mounts(&self) -> Result<Vec<MountEntry>> {
            Ok(vec![])
        }
    }

    #[test]
    fn test_missing_traits_skips_update_instead_of_resolving_unresolved() {
        let s = VolumeStructure {
            name: Some("system-boot".into()),
            label: None,
            role: Role::SystemBoot,
            structure_type: StructureType::Guid(uuid::Uuid::nil()),
            id: None,
            filesystem: Filesystem::Vfat,
            offset: Some(Offset(1 << 20)),
            offset_write: None,
            min_size: Size(1 << 20),
            size: Size(1 << 20),
            content: vec![],
            update: UpdateInfo::default(),
            yaml_index: 0,
        };
        let volume = Volume {
            name: "pc".into(),
            schema: Schema::Gpt,
            bootloader: None,
            id: None,
            partial: PartialFields::default(),
            structure: vec![s.clone()],
        };
        let old = LaidOutVolume {
            volume,
            structure: vec![LaidOutStructure {
                structure: s,
                start_offset: Offset(1 << 20),
                laid_out_content: vec![],
                resolved_content: vec![],
                yaml_index: 0,
            }],
            size: Size(2 << 20),
            sector_size: Size(512),
        };

        let err = volume_structure_to_location_map(&old, None, &EmptyMountInfo, &[]).unwrap_err();
        assert!(matches!(err, Error::SkipUpdateProceedRefresh));
    }

    #[test]
    fn test_shortest_path_wins_deterministically() {
        let mounts = vec![
            MountEntry {
                root: "/".into(),
                mount_dir: "/run/mnt/data/nested".into(),
                fs_type: "ext4".into(),
                source_device: "/dev/sda1".into(),
                read_only: false,
            },
            MountEntry {
                root: "/".into(),
                mount_dir: "/data".into(),
                fs_type: "ext4".into(),
                source_device: "/dev/sda1".into(),
                read_only: false,
            },
        ];
        let traits = crate::matcher::StructureTraits {
            device_node: "/dev/sda1".into(),
            partition_label: Some("Recovery".into()),
            partition_uuid: None,
            filesystem_label: None,
            filesystem_uuid: None,
            filesystem_type: None,
            offset: crate::quantity::Offset(0),
            size: crate::quantity::Size(0),
        };
        let found = find_mount_for_partition(&mounts, &traits).unwrap();
        assert_eq!(found.mount_dir, "/data");
    }

    #[test]
    fn test_read_only_mounts_excluded() {
        let mounts = vec![MountEntry {
            root: "/".into(),
            mount_dir: "/data".into(),
            fs_type: "ext4".into(),
            source_device: "/dev/sda1".into(),
            read_only: true,
        }];
        let traits = crate::matcher::StructureTraits {
            device_node: "/dev/sda1".into(),
            partition_label: Some("Recovery".into()),
            partition_uuid: None,
            filesystem_label: None,
            filesystem_uuid: None,
            filesystem_type: None,
            offset: crate::quantity::Offset(0),
            size: crate::quantity::Size(0),
        };
        assert!(find_mount_for_partition(&mounts, &traits).is_none());
    }

    #[test]
    fn test_device_node_is_matched_not_partition_label() {
        let mounts = vec![MountEntry {
            root: "/".into(),
            mount_dir: "/boot".into(),
            fs_type: "vfat".into(),
            source_device: "/dev/sda1".into(),
            read_only: false,
        }];
        // partition_label deliberately does not equal the device node; only
        // device_node should participate in the match.
        let traits = crate::matcher::StructureTraits {
            device_node: "/dev/sda1".into(),
            partition_label: Some("Recovery".into()),
            partition_uuid: None,
            filesystem_label: None,
            filesystem_uuid: None,
            filesystem_type: None,
            offset: crate::quantity::Offset(0),
            size: crate::quantity::Size(0),
        };
        let found = find_mount_for_partition(&mounts, &traits).unwrap();
        assert_eq!(found.mount_dir, "/boot");
    }
}

//! Installer merge (components B/C, §4.4): fills in the `partial`
//! fields a gadget volume defers to the installer.

use crate::error::{Error, Result};
use crate::manifest::{Info, Volume, VolumeStructure};
use crate::validate::{self, ModelConstraints};

/// Merge installer-supplied volumes into a gadget [`Info`], filling in
/// each `partial:X` attribute from the installer volume of the same
/// name. The gadget's structure order remains authoritative; structures
/// are paired by `name`.
pub fn apply_installer_volumes_to_gadget(installer: &Info, gadget: &Info) -> Result<Info> {
    let mut merged = gadget.clone();
    for (name, volume) in merged.volumes.iter_mut() {
        if !volume.partial.any() {
            continue;
        }
        let installer_volume = installer.volumes.get(name).ok_or_else(|| {
            Error::MissingInstallerData(format!(
                "volume {name:?} is partial but the installer supplied no matching volume"
            ))
        })?;
        merge_volume(volume, installer_volume)?;
    }

    for volume in merged.volumes.values() {
        validate::validate_volume(volume, ModelConstraints::default())
            .map_err(|e| Error::Invalid(format!("merged volume {:?}: {e}", volume.name)))?;
    }
    Ok(merged)
}

fn merge_volume(gadget: &mut Volume, installer: &Volume) -> Result<()> {
    if gadget.partial.schema {
        gadget.schema = installer.schema;
    }
    if gadget.partial.structure {
        merge_structures(gadget, installer)?;
    }
    if gadget.partial.size || gadget.partial.filesystem {
        for s in gadget.structure.iter_mut() {
            let Some(inst_s) = find_structure(installer, s) else {
                return Err(Error::MissingInstallerData(format!(
                    "installer has no structure matching {:?} in volume {:?}",
                    s.name, gadget.name
                )));
            };
            if gadget.partial.size {
                s.size = inst_s.size;
                s.offset = inst_s.offset;
            }
            if gadget.partial.filesystem {
                s.filesystem = inst_s.filesystem;
            }
        }
    }
    Ok(())
}

fn merge_structures(gadget: &mut Volume, installer: &Volume) -> Result<()> {
    for inst_s in &installer.structure {
        let Some(name) = &inst_s.name else { continue };
        if gadget.structure_by_name(name).is_none() {
            let mut appended = inst_s.clone();
            appended.yaml_index = gadget.structure.len();
            gadget.structure.push(appended);
        }
    }
    Ok(())
}

fn find_structure<'a>(volume: &'a Volume, target: &VolumeStructure) -> Option<&'a VolumeStructure> {
    target
        .name
        .as_deref()
        .and_then(|name| volume.structure_by_name(name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{Filesystem, PartialFields, Role, Schema, StructureType, UpdateInfo};
    use crate::quantity::{Offset, Size};
    use std::collections::BTreeMap;

    fn structure(name: &str, size: u64, filesystem: Filesystem) -> VolumeStructure {
        VolumeStructure {
            name: Some(name.into()),
            label: None,
            role: Role::None,
            structure_type: StructureType::Bare,
            id: None,
            filesystem,
            offset: Some(Offset(0)),
            offset_write: None,
            min_size: Size(size),
            size: Size(size),
            content: vec![],
            update: UpdateInfo::default(),
            yaml_index: 0,
        }
    }

    fn info_with(volumes: Vec<Volume>) -> Info {
        let mut map = BTreeMap::new();
        for v in volumes {
            map.insert(v.name.clone(), v);
        }
        Info {
            volumes: map,
            defaults: BTreeMap::new(),
            connections: vec![],
            kernel_cmdline: Default::default(),
        }
    }

    #[test]
    fn test_size_merge_fills_in_zero_size() {
        let mut gadget_structure = structure("data", 0, Filesystem::Ext4);
        gadget_structure.offset = None;
        let gadget = info_with(vec![Volume {
            name: "pc".into(),
            schema: Schema::Gpt,
            bootloader: None,
            id: None,
            partial: PartialFields {
                size: true,
                ..Default::default()
            },
            structure: vec![gadget_structure],
        }]);
        let installer = info_with(vec![Volume {
            name: "pc".into(),
            schema: Schema::Gpt,
            bootloader: None,
            id: None,
            partial: PartialFields::default(),
            structure: vec![structure("data", 4096, Filesystem::Ext4)],
        }]);

        let merged = apply_installer_volumes_to_gadget(&installer, &gadget).unwrap();
        assert_eq!(merged.volumes["pc"].structure[0].size, Size(4096));
    }

    #[test]
    fn test_missing_installer_volume_fails() {
        let gadget = info_with(vec![Volume {
            name: "pc".into(),
            schema: Schema::Gpt,
            bootloader: None,
            id: None,
            partial: PartialFields {
                schema: true,
                ..Default::default()
            },
            structure: vec![],
        }]);
        let installer = info_with(vec![]);
        assert!(apply_installer_volumes_to_gadget(&installer, &gadget).is_err());
    }
}

//! The layout engine (component D): resolves implicit offsets and
//! expands content into absolute, laid-out structures.

use crate::error::{Error, Result};
use crate::manifest::{Volume, VolumeContent, VolumeStructure};
use crate::quantity::{Offset, Size};
use camino::Utf8Path;
use std::fs;

/// 1 MiB, the default start offset of the first non-mbr structure.
pub const NON_MBR_START_OFFSET: Offset = Offset(1 << 20);
const SECTOR_SIZE: u64 = 512;

#[derive(Clone, Copy, Debug, Default)]
pub struct LayoutOptions {
    /// Skip expanding/sizing content (used when only offsets matter).
    pub ignore_content: bool,
    /// Compute `start_offset`s but don't resolve `$kernel:` references.
    pub skip_resolve_content: bool,
}

/// A concrete byte range inside a `bare` structure, after content sizing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LaidOutContent {
    pub image: String,
    pub offset: Offset,
    pub size: Size,
    pub offset_write: Option<crate::quantity::RelativeOffset>,
}

/// A filesystem content entry after `$kernel:` resolution.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedContent {
    pub source: String,
    pub target: String,
    pub kernel_update: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct LaidOutStructure {
    pub structure: VolumeStructure,
    pub start_offset: Offset,
    pub laid_out_content: Vec<LaidOutContent>,
    pub resolved_content: Vec<ResolvedContent>,
    pub yaml_index: usize,
}

#[derive(Clone, Debug, PartialEq)]
pub struct LaidOutVolume {
    pub volume: Volume,
    pub structure: Vec<LaidOutStructure>,
    pub size: Size,
    pub sector_size: Size,
}

fn ceil_to_sector(n: u64, sector_size: u64) -> u64 {
    if sector_size == 0 {
        return n;
    }
    n.div_ceil(sector_size) * sector_size
}

/// Resolve a `$kernel:<asset>/rest` source into a concrete path under
/// `kernel_root`, per §4.3 step 4 / §6.3. Returns `None` (meaning: not
/// a kernel reference) for any other source string.
fn resolve_kernel_source(
    source: &str,
    kernel_root: Option<&Utf8Path>,
) -> Result<Option<(String, bool)>> {
    let Some(rest) = source.strip_prefix("$kernel:") else {
        return Ok(None);
    };
    let (asset, rel) = rest
        .split_once('/')
        .ok_or_else(|| Error::Parse(format!("malformed kernel content reference {source:?}")))?;
    let kernel_root = kernel_root.ok_or_else(|| {
        Error::MissingInstallerData(format!(
            "content {source:?} references a kernel asset but no kernel root was supplied"
        ))
    })?;
    let manifest_path = kernel_root.join("meta/kernel.yaml");
    let text = fs::read_to_string(&manifest_path)
        .map_err(|e| Error::Other(anyhow::anyhow!("reading {manifest_path}: {e}")))?;
    let manifest = crate::kernel::parse_kernel_manifest(&text)?;
    let declared = manifest
        .assets
        .get(asset)
        .ok_or_else(|| Error::Invalid(format!("kernel manifest has no asset {asset:?}")))?;
    let content_dir = declared
        .content
        .first()
        .ok_or_else(|| Error::Invalid(format!("kernel asset {asset:?} declares no content")))?;
    let resolved = kernel_root.join(content_dir).join(rel);
    Ok(Some((resolved.into_string(), declared.update)))
}

/// Lay out a single volume: resolve offsets, expand content.
pub fn layout_volume(
    volume: &Volume,
    gadget_root: &Utf8Path,
    kernel_root: Option<&Utf8Path>,
    opts: LayoutOptions,
) -> Result<LaidOutVolume> {
    let mut out = Vec::with_capacity(volume.structure.len());
    let mut prev_end: Option<Offset> = None;

    for s in &volume.structure {
        let start_offset = match s.offset {
            Some(o) => o,
            None if prev_end.is_none() && !s.is_bare_mbr() => NON_MBR_START_OFFSET,
            None if prev_end.is_none() => Offset(0),
            None => prev_end.unwrap(),
        };

        let mut laid_out_content = Vec::new();
        let mut resolved_content = Vec::new();

        if !opts.ignore_content {
            let mut content_cursor = Offset(0);
            for c in &s.content {
                match c {
                    VolumeContent::Image(img) => {
                        let offset = img.offset.map(|o| Offset(o.0)).unwrap_or(content_cursor);
                        let size = match img.size {
                            Some(sz) => sz,
                            None => {
                                let path = gadget_root.join(&img.image);
                                let len = fs::metadata(&path)
                                    .map_err(|e| {
                                        Error::Other(anyhow::anyhow!("stat {path}: {e}"))
                                    })?
                                    .len();
                                Size(len)
                            }
                        };
                        if offset.0 + size.0 > s.size.0 {
                            return Err(Error::Invalid(format!(
                                "content {:?} at offset {} size {} exceeds structure {:?} size {}",
                                img.image, offset, size, s.name, s.size
                            )));
                        }
                        content_cursor = Offset(offset.0 + size.0);
                        laid_out_content.push(LaidOutContent {
                            image: img.image.clone(),
                            offset,
                            size,
                            offset_write: img.offset_write.clone(),
                        });
                    }
                    VolumeContent::Filesystem(fc) => {
                        if opts.skip_resolve_content {
                            resolved_content.push(ResolvedContent {
                                source: fc.source.clone(),
                                target: fc.target.clone(),
                                kernel_update: false,
                            });
                            continue;
                        }
                        let (source, kernel_update) =
                            match resolve_kernel_source(&fc.source, kernel_root)? {
                                Some((resolved, update)) => (resolved, update),
                                None => (fc.source.clone(), false),
                            };
                        resolved_content.push(ResolvedContent {
                            source,
                            target: fc.target.clone(),
                            kernel_update,
                        });
                    }
                }
            }
        }

        out.push(LaidOutStructure {
            structure: s.clone(),
            start_offset,
            laid_out_content,
            resolved_content,
            yaml_index: s.yaml_index,
        });
        prev_end = Some(Offset(start_offset.0 + s.size.0));
    }

    let sector_size = Size(SECTOR_SIZE);
    let size = match out.last() {
        Some(last) => Size(ceil_to_sector(last.start_offset.0 + last.structure.size.0, SECTOR_SIZE)),
        None => Size(0),
    };

    Ok(LaidOutVolume {
        volume: volume.clone(),
        structure: out,
        size,
        sector_size,
    })
}

impl VolumeStructure {
    fn is_bare_mbr(&self) -> bool {
        self.role == crate::manifest::Role::Mbr
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{Filesystem, PartialFields, Role, Schema, StructureType, UpdateInfo};
    use tempfile::tempdir;

    fn bare_structure(name: &str, offset: Option<u64>, size: u64, role: Role) -> VolumeStructure {
        VolumeStructure {
            name: Some(name.into()),
            label: None,
            role,
            structure_type: StructureType::Bare,
            id: None,
            filesystem: Filesystem::None,
            offset: offset.map(Offset),
            offset_write: None,
            min_size: Size(size),
            size: Size(size),
            content: vec![],
            update: UpdateInfo::default(),
            yaml_index: 0,
        }
    }

    #[test]
    fn test_s1_gpt_two_partition_layout() {
        let dir = tempdir().unwrap();
        let mbr = bare_structure("mbr", Some(0), 440, Role::Mbr);
        let bios = bare_structure("BIOS Boot", Some(1 << 20), 1 << 20, Role::None);
        let mut recovery = bare_structure("Recovery", None, 1200 * (1 << 20), Role::None);
        recovery.structure_type = StructureType::Guid(uuid::Uuid::nil());
        recovery.filesystem = Filesystem::Vfat;

        let volume = Volume {
            name: "pc".into(),
            schema: Schema::Gpt,
            bootloader: None,
            id: None,
            partial: PartialFields::default(),
            structure: vec![mbr, bios, recovery],
        };

        let root = Utf8Path::from_path(dir.path()).unwrap();
        let laid_out = layout_volume(&volume, root, None, LayoutOptions::default()).unwrap();

        assert_eq!(laid_out.structure[0].start_offset, Offset(0));
        assert_eq!(laid_out.structure[1].start_offset, Offset(1 << 20));
        assert_eq!(laid_out.structure[2].start_offset, Offset(2 << 20));
        assert_eq!(laid_out.size, Size(1202 * (1 << 20)));
    }

    #[test]
    fn test_layout_idempotence() {
        let dir = tempdir().unwrap();
        let a = bare_structure("a", None, 1 << 20, Role::None);
        let volume = Volume {
            name: "pc".into(),
            schema: Schema::Gpt,
            bootloader: None,
            id: None,
            partial: PartialFields::default(),
            structure: vec![a],
        };
        let root = Utf8Path::from_path(dir.path()).unwrap();
        let first = layout_volume(&volume, root, None, LayoutOptions::default()).unwrap();
        let second = layout_volume(&volume, root, None, LayoutOptions::default()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_content_overflow_rejected() {
        let dir = tempdir().unwrap();
        let mut s = bare_structure("a", Some(0), 100, Role::None);
        s.content.push(VolumeContent::Image(crate::manifest::ImageContent {
            image: "x.img".into(),
            offset: Some(Size(90)),
            offset_write: None,
            size: Some(Size(50)),
            unpack: false,
        }));
        let volume = Volume {
            name: "pc".into(),
            schema: Schema::Gpt,
            bootloader: None,
            id: None,
            partial: PartialFields::default(),
            structure: vec![s],
        };
        let root = Utf8Path::from_path(dir.path()).unwrap();
        assert!(layout_volume(&volume, root, None, LayoutOptions::default()).is_err());
    }
}

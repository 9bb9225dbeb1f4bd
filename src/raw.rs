//! Raw updater (component H, §4.9): backs up and writes byte ranges
//! inside a block device.

use crate::error::Result;
use crate::layout::LaidOutContent;
use crate::updater::{UpdateOutcome, Updater};
use camino::{Utf8Path, Utf8PathBuf};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};

fn backup_path(rollback_dir: &Utf8Path, vol: &str, idx: usize, content_idx: usize) -> Utf8PathBuf {
    rollback_dir.join(format!("{vol}-{idx}-{content_idx}.backup"))
}

fn same_marker_path(rollback_dir: &Utf8Path, vol: &str, idx: usize, content_idx: usize) -> Utf8PathBuf {
    rollback_dir.join(format!("{vol}-{idx}-{content_idx}.same"))
}

/// Backs up and writes the bare content of one structure. `device` is
/// the path to the block device node (a regular file stands in for it
/// in tests). `structure_offsets` maps structure name to its
/// `start_offset` in bytes within the new layout, used to resolve
/// `offset_write` pointers whose `relative_to` names a sibling
/// structure.
pub struct RawUpdater<'a> {
    pub device: Utf8PathBuf,
    pub gadget_root: &'a Utf8Path,
    pub rollback_dir: &'a Utf8Path,
    pub vol_name: String,
    pub structure_name: Option<String>,
    pub yaml_index: usize,
    pub structure_start_offset: u64,
    pub structure_size: u64,
    pub sector_size: u64,
    pub contents: Vec<LaidOutContent>,
    pub structure_offsets: BTreeMap<String, u64>,
}

impl<'a> RawUpdater<'a> {
    fn device_offset(&self, content: &LaidOutContent) -> u64 {
        self.structure_start_offset + content.offset.0
    }

    fn read_image_bytes(&self, image: &str) -> Result<Vec<u8>> {
        let path = self.gadget_root.join(image);
        Ok(fs::read(&path)?)
    }

    fn read_device_range(&self, offset: u64, len: u64) -> Result<Vec<u8>> {
        let mut f = match File::open(&self.device) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![0u8; len as usize]),
            Err(e) => return Err(e.into()),
        };
        let file_len = f.metadata()?.len();
        if offset >= file_len {
            return Ok(vec![0u8; len as usize]);
        }
        let readable = len.min(file_len - offset);
        f.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; readable as usize];
        f.read_exact(&mut buf)?;
        buf.resize(len as usize, 0);
        Ok(buf)
    }

    fn write_device_range(&self, offset: u64, data: &[u8]) -> Result<()> {
        let mut f = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.device)?;
        f.seek(SeekFrom::Start(offset))?;
        f.write_all(data)?;
        f.sync_all()?;
        Ok(())
    }

    fn write_pointer(&self, content: &LaidOutContent) -> Result<()> {
        let Some(rel) = &content.offset_write else {
            return Ok(());
        };
        let target_start = match &rel.relative_to {
            Some(name) => *self.structure_offsets.get(name).ok_or_else(|| {
                crate::error::Error::Invalid(format!(
                    "offset-write is relative to unknown structure {name:?}"
                ))
            })?,
            None => self.structure_start_offset,
        };
        let lba = target_start / self.sector_size.max(1);
        let pointer_offset = target_start + rel.offset.0;

        let backup = self.read_device_range(pointer_offset, 4)?;
        let backup_file = self
            .rollback_dir
            .join(format!("{}-{}-ptr-{}.backup", self.vol_name, self.yaml_index, target_start));
        fs::write(&backup_file, &backup)?;

        let bytes = (lba as u32).to_le_bytes();
        self.write_device_range(pointer_offset, &bytes)?;
        Ok(())
    }
}

impl<'a> Updater for RawUpdater<'a> {
    fn backup(&mut self) -> Result<()> {
        fs::create_dir_all(self.rollback_dir)?;
        for (content_idx, content) in self.contents.iter().enumerate() {
            let offset = self.device_offset(content);
            if offset + content.size.0 > self.structure_start_offset + self.structure_size {
                return Err(crate::error::Error::Invalid(format!(
                    "content {:?} write would cross structure boundary",
                    content.image
                )));
            }
            let current = self.read_device_range(offset, content.size.0)?;
            let new_bytes = self.read_image_bytes(&content.image)?;
            if current == new_bytes {
                fs::write(
                    same_marker_path(self.rollback_dir, &self.vol_name, self.yaml_index, content_idx),
                    [],
                )?;
            } else {
                fs::write(
                    backup_path(self.rollback_dir, &self.vol_name, self.yaml_index, content_idx),
                    &current,
                )?;
            }
        }
        Ok(())
    }

    fn update(&mut self) -> Result<UpdateOutcome> {
        crate::try_fail_point!("raw_updater::update");
        let mut wrote_any = false;
        for content_idx in 0..self.contents.len() {
            let same_marker = same_marker_path(self.rollback_dir, &self.vol_name, self.yaml_index, content_idx);
            if same_marker.exists() {
                continue;
            }
            let content = self.contents[content_idx].clone();
            let offset = self.device_offset(&content);
            let bytes = self.read_image_bytes(&content.image)?;
            self.write_device_range(offset, &bytes)?;
            self.write_pointer(&content)?;
            wrote_any = true;
        }
        Ok(if wrote_any {
            UpdateOutcome::Updated
        } else {
            UpdateOutcome::NoUpdate
        })
    }

    fn rollback(&mut self) -> Result<()> {
        for (content_idx, content) in self.contents.iter().enumerate() {
            let same_marker = same_marker_path(self.rollback_dir, &self.vol_name, self.yaml_index, content_idx);
            if same_marker.exists() {
                continue;
            }
            let backup = backup_path(self.rollback_dir, &self.vol_name, self.yaml_index, content_idx);
            if !backup.exists() {
                continue;
            }
            let data = fs::read(&backup)?;
            let offset = self.device_offset(content);
            self.write_device_range(offset, &data)?;
        }
        Ok(())
    }
}

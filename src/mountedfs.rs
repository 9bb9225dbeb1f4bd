//! Mounted-filesystem updater (component I, §4.10): backs up and
//! writes file trees rooted at a mount point, respecting preserve
//! lists. Each content entry is replaced through a sibling-temp-file
//! then rename, applied per explicit content entry rather than as a
//! whole-tree diff.

use crate::error::{Error, Result};
use crate::layout::ResolvedContent;
use crate::updater::{UpdateOutcome, Updater};
use camino::{Utf8Path, Utf8PathBuf};
use openssl::hash::{Hasher, MessageDigest};
use std::fs;
use std::io::Write;

fn hash_target(target: &str) -> String {
    let mut hasher = Hasher::new(MessageDigest::sha512()).expect("openssl hasher");
    hasher.update(target.as_bytes()).expect("hash update");
    hex::encode(hasher.finish().expect("hash finish"))
}

fn created_marker(rollback_dir: &Utf8Path, vol: &str, idx: usize, target: &str) -> Utf8PathBuf {
    rollback_dir.join(format!("{vol}-{idx}-{}.created", hash_target(target)))
}

fn backup_path(rollback_dir: &Utf8Path, vol: &str, idx: usize, target: &str) -> Utf8PathBuf {
    rollback_dir
        .join(format!("{vol}-{idx}"))
        .join(hash_target(target))
}

/// `true` if `path` is `entry` or a descendant of it (preserve lists
/// apply recursively, §4.10).
fn is_preserved(path: &str, preserve: &[String]) -> bool {
    preserve
        .iter()
        .any(|p| path == p || path.starts_with(&format!("{p}/")))
}

pub struct MountedFsUpdater<'a> {
    pub mount_point: Utf8PathBuf,
    pub rollback_dir: &'a Utf8Path,
    pub vol_name: String,
    pub yaml_index: usize,
    pub contents: Vec<ResolvedContent>,
    pub preserve: Vec<String>,
}

impl<'a> MountedFsUpdater<'a> {
    fn dest_path(&self, target: &str) -> Utf8PathBuf {
        self.mount_point.join(target.trim_start_matches('/'))
    }

    fn copy_one(&self, src: &Utf8Path, dst: &Utf8Path) -> Result<()> {
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent)?;
        }
        let meta = fs::symlink_metadata(src)?;
        if meta.file_type().is_symlink() {
            let target = fs::read_link(src)?;
            let tmp = sibling_tmp(dst);
            #[cfg(unix)]
            std::os::unix::fs::symlink(&target, &tmp)?;
            fs::rename(&tmp, dst)?;
            return Ok(());
        }
        if meta.is_dir() {
            for entry in fs::read_dir(src)? {
                let entry = entry?;
                let name = entry.file_name();
                let name = name.to_string_lossy();
                self.copy_one(
                    &src.join(name.as_ref()),
                    &dst.join(name.as_ref()),
                )?;
            }
            return Ok(());
        }
        let tmp = sibling_tmp(dst);
        fs::copy(src, &tmp)?;
        let perms = meta.permissions();
        fs::set_permissions(&tmp, perms)?;
        fs::rename(&tmp, dst)?;
        Ok(())
    }
}

fn sibling_tmp(dst: &Utf8Path) -> Utf8PathBuf {
    let name = dst.file_name().unwrap_or("tmp");
    dst.with_file_name(format!(".btmp.{name}"))
}

impl<'a> Updater for MountedFsUpdater<'a> {
    fn backup(&mut self) -> Result<()> {
        fs::create_dir_all(self.rollback_dir)?;
        for content in &self.contents {
            if is_preserved(&content.target, &self.preserve) {
                continue;
            }
            let dst = self.dest_path(&content.target);
            if dst.exists() {
                let backup = backup_path(self.rollback_dir, &self.vol_name, self.yaml_index, &content.target);
                if let Some(parent) = backup.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::rename(&dst, &backup)?;
            } else {
                let marker = created_marker(self.rollback_dir, &self.vol_name, self.yaml_index, &content.target);
                fs::write(&marker, [])?;
            }
        }
        Ok(())
    }

    fn update(&mut self) -> Result<UpdateOutcome> {
        crate::try_fail_point!("mountedfs_updater::update");
        if self.contents.is_empty() {
            return Ok(UpdateOutcome::NoUpdate);
        }
        let mut wrote_any = false;
        for content in &self.contents {
            if is_preserved(&content.target, &self.preserve) {
                continue;
            }
            let src = Utf8Path::new(&content.source);
            let dst = self.dest_path(&content.target);
            if content.source.ends_with('/') {
                for entry in fs::read_dir(src)? {
                    let entry = entry?;
                    let name = entry.file_name();
                    let name = name.to_string_lossy();
                    self.copy_one(&src.join(name.as_ref()), &dst.join(name.as_ref()))?;
                }
            } else {
                self.copy_one(src, &dst)?;
            }
            wrote_any = true;
        }
        Ok(if wrote_any {
            UpdateOutcome::Updated
        } else {
            UpdateOutcome::NoUpdate
        })
    }

    fn rollback(&mut self) -> Result<()> {
        for content in &self.contents {
            if is_preserved(&content.target, &self.preserve) {
                continue;
            }
            let dst = self.dest_path(&content.target);
            let marker = created_marker(self.rollback_dir, &self.vol_name, self.yaml_index, &content.target);
            if marker.exists() {
                if dst.exists() {
                    fs::remove_file(&dst).or_else(|_| fs::remove_dir_all(&dst))?;
                }
                fs::remove_file(&marker)?;
                continue;
            }
            let backup = backup_path(self.rollback_dir, &self.vol_name, self.yaml_index, &content.target);
            if backup.exists() {
                if let Some(parent) = dst.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::rename(&backup, &dst)?;
            }
        }
        Ok(())
    }
}

/// Kernel-policy content filter (§4.8, S6): retains only content whose
/// resolved source is a kernel asset marked `update: true`.
pub fn filter_kernel_update(contents: &[ResolvedContent]) -> Vec<ResolvedContent> {
    contents
        .iter()
        .filter(|c| c.kernel_update)
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write(dir: &Utf8Path, rel: &str, data: &str) {
        let path = dir.join(rel);
        if let Some(p) = path.parent() {
            fs::create_dir_all(p).unwrap();
        }
        let mut f = fs::File::create(&path).unwrap();
        f.write_all(data.as_bytes()).unwrap();
    }

    #[test]
    fn test_backup_update_rollback_round_trip() {
        let src_dir = tempdir().unwrap();
        let src_root = Utf8Path::from_path(src_dir.path()).unwrap();
        write(src_root, "grubx64.efi", "new grub contents");

        let mount_dir = tempdir().unwrap();
        let mount_point = Utf8Path::from_path(mount_dir.path()).unwrap().to_path_buf();
        write(&mount_point, "EFI/boot/grubx64.efi", "old grub contents");

        let rollback_dir = tempdir().unwrap();
        let rollback_root = Utf8Path::from_path(rollback_dir.path()).unwrap();

        let mut updater = MountedFsUpdater {
            mount_point: mount_point.clone(),
            rollback_dir: rollback_root,
            vol_name: "pc".into(),
            yaml_index: 2,
            contents: vec![ResolvedContent {
                source: src_root.join("grubx64.efi").into_string(),
                target: "/EFI/boot/grubx64.efi".into(),
                kernel_update: false,
            }],
            preserve: vec![],
        };

        updater.backup().unwrap();
        let outcome = updater.update().unwrap();
        assert_eq!(outcome, UpdateOutcome::Updated);
        assert_eq!(
            fs::read_to_string(mount_point.join("EFI/boot/grubx64.efi")).unwrap(),
            "new grub contents"
        );

        updater.rollback().unwrap();
        assert_eq!(
            fs::read_to_string(mount_point.join("EFI/boot/grubx64.efi")).unwrap(),
            "old grub contents"
        );
    }

    #[test]
    fn test_preserved_path_untouched() {
        let src_dir = tempdir().unwrap();
        let src_root = Utf8Path::from_path(src_dir.path()).unwrap();
        write(src_root, "new.conf", "new");

        let mount_dir = tempdir().unwrap();
        let mount_point = Utf8Path::from_path(mount_dir.path()).unwrap().to_path_buf();
        write(&mount_point, "etc/keep.conf", "keep me");

        let rollback_dir = tempdir().unwrap();
        let rollback_root = Utf8Path::from_path(rollback_dir.path()).unwrap();

        let mut updater = MountedFsUpdater {
            mount_point: mount_point.clone(),
            rollback_dir: rollback_root,
            vol_name: "pc".into(),
            yaml_index: 0,
            contents: vec![ResolvedContent {
                source: src_root.join("new.conf").into_string(),
                target: "/etc/keep.conf".into(),
                kernel_update: false,
            }],
            preserve: vec!["etc/keep.conf".into()],
        };

        updater.backup().unwrap();
        updater.update().unwrap();
        assert_eq!(
            fs::read_to_string(mount_point.join("etc/keep.conf")).unwrap(),
            "keep me"
        );
    }

    #[test]
    fn test_empty_content_after_filter_is_no_update() {
        let contents = vec![ResolvedContent {
            source: "other".into(),
            target: "/other".into(),
            kernel_update: false,
        }];
        assert!(filter_kernel_update(&contents).is_empty());
    }
}

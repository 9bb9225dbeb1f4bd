//! System capability object (design note §9): the source read
//! `dirs.GlobalRootDir` and mocked shell commands through process
//! globals. Here every environment-touching collaborator is bundled
//! into one struct and passed into public entry points explicitly; the
//! crate holds no mutable global state.

use crate::diskprobe::DiskProvider;
use crate::error::Result;
use crate::locate::MountInfo;
use camino::Utf8PathBuf;

/// Builds a [`DiskProvider`] for a device node. Implementations talk
/// to `/sys/block` and kernel partition ioctls; tests supply a fake
/// that hands back a canned in-memory disk.
pub trait DiskProviderFactory {
    fn provider_for(&self, device: &str) -> Result<Box<dyn DiskProvider>>;
}

/// Stable identifiers sourced from udev properties
/// (`ID_PART_TABLE_UUID`, `ID_FS_UUID`, ...), used to fill in the
/// fields [`crate::matcher::StructureTraits`] leaves as `None` when the
/// disk probe alone can't determine them.
pub trait UdevLookup {
    fn partition_uuid(&self, device: &str) -> Result<Option<String>>;
    fn filesystem_uuid(&self, device: &str) -> Result<Option<String>>;
}

/// Bundles the filesystem root, mount table reader, disk prober and
/// udev lookup that every engine entry point needs.
pub struct System {
    pub root: Utf8PathBuf,
    pub mount_info: Box<dyn MountInfo>,
    pub disks: Box<dyn DiskProviderFactory>,
    pub udev: Box<dyn UdevLookup>,
}

impl System {
    pub fn new(
        root: Utf8PathBuf,
        mount_info: Box<dyn MountInfo>,
        disks: Box<dyn DiskProviderFactory>,
        udev: Box<dyn UdevLookup>,
    ) -> Self {
        Self {
            root,
            mount_info,
            disks,
            udev,
        }
    }
}

//! Disk probe (component E, §4.5): reads partition tables and
//! filesystem metadata from a block device into an [`OnDiskVolume`].

use crate::error::{Error, Result};
use crate::manifest::Schema;
use crate::quantity::{Offset, Size};

/// One partition as reported by the kernel/disk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OnDiskStructure {
    pub name: Option<String>,
    pub partition_type: String,
    pub partition_fs_label: Option<String>,
    pub partition_fs_type: Option<String>,
    pub start_offset: Offset,
    pub size: Size,
    pub node: String,
    /// 1-based, as reported by the kernel.
    pub disk_index: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OnDiskVolume {
    pub schema: Schema,
    pub id: String,
    pub device: String,
    pub size: Size,
    pub usable_sectors_end: Offset,
    pub sector_size: Size,
    pub structure: Vec<OnDiskStructure>,
}

/// Block-device collaborator (§6.2). Implementations talk to the real
/// kernel (via `ioctl`s and `/sys/block`); tests use the in-memory fake
/// below.
pub trait DiskProvider {
    fn partitions(&self) -> Result<Vec<OnDiskStructure>>;
    fn size_in_bytes(&self) -> Result<Size>;
    fn sector_size(&self) -> Result<Size>;
    fn usable_sectors_end(&self) -> Result<Offset>;
    fn schema(&self) -> Result<Schema>;
    fn disk_id(&self) -> Result<String>;
    fn kernel_device_node(&self) -> Result<String>;
}

/// Probe a device through its [`DiskProvider`] and assemble an
/// [`OnDiskVolume`], ordering partitions by `disk_index` and validating
/// sector size (invariant 10).
pub fn probe_disk(provider: &dyn DiskProvider) -> Result<OnDiskVolume> {
    let sector_size = provider.sector_size()?;
    if sector_size.0 == 0 || sector_size.0 % 512 != 0 {
        return Err(Error::Invalid(format!(
            "sector size {} is not a multiple of 512",
            sector_size.0
        )));
    }
    let mut structure = provider.partitions()?;
    structure.sort_by_key(|s| s.disk_index);

    Ok(OnDiskVolume {
        schema: provider.schema()?,
        id: provider.disk_id()?,
        device: provider.kernel_device_node()?,
        size: provider.size_in_bytes()?,
        usable_sectors_end: provider.usable_sectors_end()?,
        sector_size,
        structure,
    })
}


#[cfg(test)]
mod tests {
    use super::fake::FakeDisk;
    use super::*;
    use std::cell::RefCell;

    #[test]
    fn test_probe_orders_by_disk_index() {
        let disk = FakeDisk {
            schema: Schema::Gpt,
            id: "disk-id".into(),
            device: "/dev/sda".into(),
            size: Size(1 << 30),
            usable_sectors_end: Offset((1 << 30) - 512),
            sector_size: Size(512),
            partitions: RefCell::new(vec![
                OnDiskStructure {
                    name: Some("b".into()),
                    partition_type: "83".into(),
                    partition_fs_label: None,
                    partition_fs_type: None,
                    start_offset: Offset(2 << 20),
                    size: Size(1 << 20),
                    node: "/dev/sda2".into(),
                    disk_index: 2,
                },
                OnDiskStructure {
                    name: Some("a".into()),
                    partition_type: "83".into(),
                    partition_fs_label: None,
                    partition_fs_type: None,
                    start_offset: Offset(1 << 20),
                    size: Size(1 << 20),
                    node: "/dev/sda1".into(),
                    disk_index: 1,
                },
            ]),
        };
        let probed = probe_disk(&disk).unwrap();
        assert_eq!(probed.structure[0].node, "/dev/sda1");
        assert_eq!(probed.structure[1].node, "/dev/sda2");
    }

    #[test]
    fn test_probe_rejects_bad_sector_size() {
        let disk = FakeDisk {
            schema: Schema::Gpt,
            id: "disk-id".into(),
            device: "/dev/sda".into(),
            size: Size(1 << 30),
            usable_sectors_end: Offset(0),
            sector_size: Size(511),
            partitions: RefCell::new(vec![]),
        };
        assert!(probe_disk(&disk).is_err());
    }
}

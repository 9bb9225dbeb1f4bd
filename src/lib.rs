/*!
Gadget volume engine.

Lays out partition schemes described by a gadget manifest, matches them
against a physical disk, and drives atomic, rollback-safe updates of
the content living on top — both raw byte ranges and mounted
filesystem trees. Modeled on the install/update machinery a
transactional, image-based OS uses to describe and refresh its boot
partitions, generalized from a single EFI/BIOS bootloader to arbitrary
gadget-declared volumes.

Refs:
 * <https://github.com/coreos/fedora-coreos-tracker/issues/510>
!*/

#![deny(unused_must_use)]
// The style lints are more annoying than useful
#![allow(clippy::style)]

pub mod diskprobe;
pub mod driver;
pub mod error;
pub mod installer;
pub mod kernel;
pub mod layout;
pub mod locate;
pub mod manifest;
pub mod matcher;
pub mod mountedfs;
pub mod quantity;
pub mod raw;
pub mod statefile;
pub mod system;
pub mod updater;
pub mod validate;

/// Wraps `fail::fail_point!` so a configured failpoint can short-circuit
/// the calling `Result`-returning function with an error. Named
/// failpoints are no-ops unless a test configures them with
/// `fail::cfg`.
#[macro_export]
macro_rules! try_fail_point {
    ($name:expr) => {
        fail::fail_point!($name, |_| {
            Err($crate::error::Error::Other(anyhow::anyhow!(
                "failpoint {} triggered",
                $name
            )))
        });
    };
}

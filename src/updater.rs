//! Updater polymorphism (design note in §9): a trait with
//! `backup`/`update`/`rollback`, with two implementations — raw byte
//! ranges ([`crate::raw`]) and mounted filesystem trees
//! ([`crate::mountedfs`]).

use crate::error::Result;

/// Outcome of a call to [`Updater::update`]. `NoUpdate` means the
/// structure had nothing to do (e.g. new content equals what's already
/// on disk, or the resolved content set was empty after filtering) and
/// is treated as a successful no-op: it does not participate in
/// rollback (§4.8).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateOutcome {
    Updated,
    NoUpdate,
}

pub trait Updater {
    /// Stage original content under the rollback directory. Must
    /// succeed for every selected structure before any `update` call is
    /// made (§5 transaction discipline).
    fn backup(&mut self) -> Result<()>;
    /// Write the new content.
    fn update(&mut self) -> Result<UpdateOutcome>;
    /// Restore the content staged by `backup`.
    fn rollback(&mut self) -> Result<()>;
}

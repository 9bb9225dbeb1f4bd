//! The error taxonomy exposed to callers.
//!
//! Every fallible public entry point returns [`Result`]. Sentinels that a
//! caller needs to branch on (`NoUpdate`, `NotCompatible`, ...) are
//! distinguished by variant, never by matching on a formatted message.

use thiserror::Error;

/// The crate's `Result` alias.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// Malformed manifest or quantity literal.
    #[error("parse error: {0}")]
    Parse(String),

    /// Well-formed but violates a structural or cross-structure invariant.
    #[error("invalid gadget: {0}")]
    Invalid(String),

    /// A `partial:` field was never supplied by the installer.
    #[error("missing installer data: {0}")]
    MissingInstallerData(String),

    /// A laid-out volume doesn't match the physical disk.
    #[error("not compatible: {0}")]
    NotCompatible(String),

    /// The old and new manifests are too different to diff structure-by-structure.
    #[error("incompatible manifest: {0}")]
    IncompatibleManifest(String),

    /// A rollback step itself failed. The error that triggered the rollback
    /// is preserved as `source`; this variant is only surfaced when the
    /// rollback failure must additionally be reported (e.g. to logs).
    #[error("rollback failed after original error ({original}): {rollback}")]
    RollbackFailed {
        original: String,
        rollback: String,
    },

    /// No device matching the expected disk id / kernel path could be found.
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    /// No read-write mount backs the given partition.
    #[error("mount not found: {0}")]
    MountNotFound(String),

    /// A structure requires a filesystem but none is declared.
    #[error("no filesystem defined for structure {0:?}")]
    NoFilesystemDefined(String),

    /// Informational: nothing qualified for update under the active policy.
    #[error("no update needed")]
    NoUpdate,

    /// Informational: the caller should proceed with the rest of a refresh
    /// operation without attempting gadget asset writes (ambiguous binding
    /// on a pre-seed system).
    #[error("skipping gadget asset update, proceed with refresh")]
    SkipUpdateProceedRefresh,

    /// Anything else: I/O errors and other internal context chains built
    /// with `anyhow`/`fn-error-context`.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Other(e.into())
    }
}

impl Error {
    /// `true` for the two informational sentinels that are not really
    /// failures from the caller's point of view.
    pub fn is_informational(&self) -> bool {
        matches!(self, Error::NoUpdate | Error::SkipUpdateProceedRefresh)
    }
}

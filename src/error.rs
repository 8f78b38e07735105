//! Error types for skipstore.
//!
//! Every public operation returns [`Result`]. The [`Error`] enum is the full
//! taxonomy a caller can observe: record-level outcomes (`NotFound`,
//! `KeyExists`), validation failures (`MaxKvSize`, `KeyNumValueSize`,
//! `DupValueSize`, `IncompatibleDbMode`), file-layer conditions
//! (`MaxOffset`, `MmapOverlap`, `NotMmaped`, `ResizePolicyFail`,
//! `NotAligned`, `OutOfBounds`, `ReadOnly`) and the fatal `Corrupted`.
//!
//! OS-level failures are carried as [`Error::Io`] with the underlying
//! `std::io::Error` embedded, so the errno is never lost.
//!
//! `Corrupted` is terminal for a store handle: the on-disk structure
//! contradicts its own invariants and further use of the handle is unsafe
//! at the data level (never at the memory level).

use thiserror::Error;

/// Result type alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for all skipstore operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Key (or cursor position) not found.
    #[error("key not found")]
    NotFound,

    /// Key already exists and `NO_OVERWRITE` was requested.
    #[error("key already exists")]
    KeyExists,

    /// Combined key + value size exceeds the 256 MiB - 1 record cap.
    #[error("key+value size exceeds the maximum record size")]
    MaxKvSize,

    /// On-disk structure violates its own invariants.
    #[error("store file is invalid or corrupted: {0}")]
    Corrupted(String),

    /// Element width does not match the database's duplicate-array width.
    #[error("value size is not compatible with the sorted values array")]
    DupValueSize,

    /// Key length does not match the database's fixed integer-key width.
    #[error("key is not compatible with the integer key mode")]
    KeyNumValueSize,

    /// Database re-opened with a flag set differing from its creation flags.
    #[error("incompatible database open mode")]
    IncompatibleDbMode,

    /// Underlying OS I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Mutating call on a store opened read-only.
    #[error("store is opened in read-only mode")]
    ReadOnly,

    /// Growth would exceed the maximum allowed file offset.
    #[error("maximum file offset reached")]
    MaxOffset,

    /// Requested mmap window overlaps an existing one.
    #[error("region is mmaped already, mapping overlaps")]
    MmapOverlap,

    /// No mmap window registered (or currently mapped) at the offset.
    #[error("region is not mmaped")]
    NotMmaped,

    /// Resize policy produced a size below the request or not page-aligned.
    #[error("invalid result of resize policy function")]
    ResizePolicyFail,

    /// Offset is not aligned to the system page size.
    #[error("offset is not page aligned")]
    NotAligned,

    /// Range lies outside the addressable file space.
    #[error("range is out of bounds")]
    OutOfBounds,

    /// Operation is not valid in the current handle state.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
}

impl Error {
    pub(crate) fn corrupted(what: impl Into<String>) -> Self {
        Error::Corrupted(what.into())
    }
}

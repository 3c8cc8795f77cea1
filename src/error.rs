//! The error taxonomy of the storage engine.

use std::path::PathBuf;
use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the storage engine.
///
/// Structural errors ([`Error::StorageFormat`]) are fatal for the operation
/// that raised them: the storage is switched to read-only mode until it is
/// reopened. I/O errors leave the storage state undefined until reopened.
#[derive(Debug, Error)]
pub enum Error {
    /// The on-disk structure does not match expectations: short page, broken
    /// link, wrong page type at a known index.
    #[error("storage format error: {0}")]
    StorageFormat(String),

    /// Version or access-method mismatch discovered while opening.
    #[error("not supported: {0}")]
    NotSupported(String),

    /// The storage is already open.
    ///
    /// Storages are only obtained open, and reopening a locked path surfaces
    /// the lock failure as [`Error::Io`]; this variant completes the taxonomy
    /// for callers that layer an explicit open step on top.
    #[error("storage is already open")]
    AlreadyOpen,

    /// The storage is not open (it was closed, or never opened).
    #[error("storage is not open")]
    NotOpen,

    /// Underlying file failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// `create_new` was invoked on a path that already contains a storage
    /// file set.
    #[error("a storage already exists at {0}")]
    DuplicateStorage(PathBuf),

    /// A lookup that requires the key to exist missed.
    ///
    /// The normal map APIs return absence instead; this variant completes the
    /// taxonomy for callers that layer stricter contracts on top.
    #[error("value not found")]
    ValueNotFound,

    /// The key exceeds the per-storage maximum (an eighth of the page size).
    #[error("key too large: {size} > {max}")]
    KeyTooLarge {
        /// Size of the rejected key in bytes.
        size: usize,
        /// Maximum key size for this storage.
        max: usize,
    },

    /// The value exceeds the maximum supported blob size.
    #[error("value too large: {size} > {max}")]
    ValueTooLarge {
        /// Size of the rejected value in bytes.
        size: usize,
        /// Maximum value size.
        max: usize,
    },
}

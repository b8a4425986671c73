#![forbid(unsafe_code)]
//! Error types for cellfs.
//!
//! A two-layer model: `ParseError` (in `cellfs-types`) covers on-disk format
//! violations found while decoding bytes; `CellError` (this crate) is the
//! user-facing error returned by every engine operation. `cellfs-error`
//! deliberately depends on nothing else in the workspace so the conversion
//! from `ParseError` happens at the boundary that knows the block number
//! involved (see `cellfs-core`).
//!
//! Every variant maps to exactly one POSIX errno via [`CellError::to_errno`].
//! The match is exhaustive, so adding a variant without assigning an errno is
//! a compile error.

use thiserror::Error;

/// Unified error type for all cellfs operations.
#[derive(Debug, Error)]
pub enum CellError {
    /// Operating system I/O error (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// On-disk metadata is invalid at a known block: bad magic, region sizes
    /// that do not fit the device, or a structurally broken metadata block.
    /// Fatal at mount time.
    #[error("corrupt metadata at block {block}: {detail}")]
    Corrupt { block: u32, detail: String },

    /// A bitmap allocator has no free index left.
    #[error("no space left on device")]
    NoSpace,

    /// The file's extent index is full; the file cannot grow further.
    #[error("file too large")]
    FileTooLarge,

    /// The directory is at capacity (all extent-addressable blocks full).
    #[error("directory entry limit reached")]
    DirFull,

    /// Directory entry name exceeds the 255-byte limit.
    #[error("name too long")]
    NameTooLong,

    /// Structurally invalid argument: an empty or reserved-byte name, an
    /// operation on the wrong file type, and similar caller mistakes.
    #[error("invalid argument: {0}")]
    Invalid(String),

    /// Lookup or removal target is absent. Expected control flow, not fatal.
    #[error("not found: {0}")]
    NotFound(String),

    /// Directory entry with this name already exists.
    #[error("file exists: {0}")]
    Exists(String),

    /// An already-free bitmap index was freed again. This is a caller bug;
    /// it is reported rather than silently tolerated.
    #[error("double free of {map} index {index}")]
    DoubleFree { index: u32, map: &'static str },

    /// Write attempted through a device opened read-only.
    #[error("read-only filesystem")]
    ReadOnly,

    /// Directory operation attempted on a non-directory inode.
    #[error("not a directory")]
    NotDirectory,

    /// File data operation attempted on a directory inode.
    #[error("is a directory")]
    IsDirectory,
}

impl CellError {
    /// Convert this error into a POSIX errno suitable for a host
    /// filesystem layer.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Corrupt { .. } | Self::DoubleFree { .. } => libc::EIO,
            Self::NoSpace => libc::ENOSPC,
            Self::FileTooLarge => libc::EFBIG,
            Self::DirFull => libc::EMLINK,
            Self::NameTooLong => libc::ENAMETOOLONG,
            Self::Invalid(_) => libc::EINVAL,
            Self::NotFound(_) => libc::ENOENT,
            Self::Exists(_) => libc::EEXIST,
            Self::ReadOnly => libc::EROFS,
            Self::NotDirectory => libc::ENOTDIR,
            Self::IsDirectory => libc::EISDIR,
        }
    }
}

/// Result alias using `CellError`.
pub type Result<T> = std::result::Result<T, CellError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_covers_all_variants() {
        let cases: Vec<(CellError, libc::c_int)> = vec![
            (CellError::Io(std::io::Error::other("test")), libc::EIO),
            (
                CellError::Corrupt {
                    block: 0,
                    detail: "bad magic".into(),
                },
                libc::EIO,
            ),
            (CellError::NoSpace, libc::ENOSPC),
            (CellError::FileTooLarge, libc::EFBIG),
            (CellError::DirFull, libc::EMLINK),
            (CellError::NameTooLong, libc::ENAMETOOLONG),
            (CellError::Invalid("bad name".into()), libc::EINVAL),
            (CellError::NotFound("a".into()), libc::ENOENT),
            (CellError::Exists("a".into()), libc::EEXIST),
            (
                CellError::DoubleFree {
                    index: 3,
                    map: "block",
                },
                libc::EIO,
            ),
            (CellError::ReadOnly, libc::EROFS),
            (CellError::NotDirectory, libc::ENOTDIR),
            (CellError::IsDirectory, libc::EISDIR),
        ];

        for (error, expected) in &cases {
            assert_eq!(error.to_errno(), *expected, "wrong errno for {error:?}");
        }
    }

    #[test]
    fn io_error_preserves_raw_os_error() {
        let raw = std::io::Error::from_raw_os_error(libc::EACCES);
        assert_eq!(CellError::Io(raw).to_errno(), libc::EACCES);
    }

    #[test]
    fn display_formatting() {
        let err = CellError::Corrupt {
            block: 7,
            detail: "region sizes exceed device".into(),
        };
        assert_eq!(
            err.to_string(),
            "corrupt metadata at block 7: region sizes exceed device"
        );
        assert_eq!(
            CellError::DoubleFree {
                index: 12,
                map: "inode"
            }
            .to_string(),
            "double free of inode index 12"
        );
        assert_eq!(CellError::NoSpace.to_string(), "no space left on device");
    }
}

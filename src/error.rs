//! Error type shared by every layer of the filesystem.

use std::io;
use thiserror::Error;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// An error raised by a filesystem operation.
///
/// Variants map onto the POSIX errno values the host surfaces to the
/// kernel; see [`Error::errno`].
#[derive(Debug, Error)]
pub enum Error {
	/// Path resolution failed at some component.
	#[error("no such file or directory")]
	NoEntry,
	/// An intermediate path component is not a directory.
	#[error("not a directory")]
	NotADirectory,
	/// The destination of a create or link operation already exists.
	#[error("file exists")]
	Exists,
	/// Block or inode allocation failed.
	#[error("no space left on device")]
	NoSpace,
	/// A directory to be removed still has entries.
	#[error("directory not empty")]
	NotEmpty,
	/// A path component does not fit in a directory entry.
	#[error("file name too long")]
	NameTooLong,
	/// An inode or block index is out of bounds.
	#[error("index out of range")]
	OutOfRange,
	/// The backing image could not be opened, sized or mapped.
	#[error("disk image: {0}")]
	Image(#[from] io::Error),
}

impl Error {
	/// Returns the negative errno value for this error.
	///
	/// A path component that is not a directory is reported as `-ENOENT`,
	/// matching the behavior of path resolution which does not distinguish
	/// the two at the host boundary.
	pub fn errno(&self) -> i32 {
		match self {
			Self::NoEntry => -libc::ENOENT,
			Self::NotADirectory => -libc::ENOENT,
			Self::Exists => -libc::EEXIST,
			Self::NoSpace => -libc::ENOSPC,
			Self::NotEmpty => -libc::ENOTEMPTY,
			Self::NameTooLong => -libc::ENAMETOOLONG,
			Self::OutOfRange => -libc::EIO,
			Self::Image(_) => -libc::EIO,
		}
	}
}

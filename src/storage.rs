//! The storage façade: the path-addressed operations a filesystem host
//! calls, composed from the inode and directory layers.
//!
//! Every operation resolves its path (or the parent path) first, then
//! mutates the mapped image directly. Callers are serialized by the
//! host; operations run to completion and never suspend.

use crate::blocks::Blocks;
use crate::blocks::BLOCK_SIZE;
use crate::directory;
use crate::error::Error;
use crate::error::Result;
use crate::inode;
use crate::inode::MAX_FILE_SIZE;
use crate::util;
use std::path::Path;

/// File metadata, as reported by [`Storage::stat`].
#[derive(Clone, Copy, Debug)]
pub struct FileStat {
	/// The inode number.
	pub ino: u32,
	/// Type and permission bits.
	pub mode: u32,
	/// Logical size in bytes.
	pub size: u32,
	/// Number of directory entries referencing the inode.
	pub nlink: u32,
	/// Owner user id.
	pub uid: u32,
	/// Owner group id.
	pub gid: u32,
	/// Last access time, seconds since the epoch.
	pub atime: i64,
	/// Last modification time, seconds since the epoch.
	pub mtime: i64,
	/// Occupied size in 512-byte units.
	pub blocks: u32,
	/// Preferred I/O size.
	pub blksize: u32,
}

/// A mounted filesystem: the handle every operation goes through.
///
/// Owns the mapped image exclusively for the lifetime of the mount.
pub struct Storage {
	blocks: Blocks,
}

impl Storage {
	/// Opens the image at `path` and brings the filesystem up.
	///
	/// On a fresh image this reserves the metadata blocks and creates the
	/// root directory; an already-initialized image is picked up as-is.
	pub fn init(path: &Path) -> Result<Self> {
		log::debug!("storage_init({})", path.display());
		let mut blocks = Blocks::init(path)?;
		inode::init(&mut blocks);
		directory::init_root(&mut blocks)?;
		Ok(Self {
			blocks,
		})
	}

	/// Returns the metadata of the file or directory at `path`.
	pub fn stat(&self, path: &[u8]) -> Result<FileStat> {
		let inum = directory::tree_lookup(&self.blocks, path)?;
		let node = inode::get(&self.blocks, inum)?;
		Ok(FileStat {
			ino: inum,
			mode: node.mode,
			size: node.size,
			nlink: node.refs,
			uid: node.uid,
			gid: node.gid,
			atime: node.atime,
			mtime: node.mtime,
			blocks: (node.size + 511) / 512,
			blksize: BLOCK_SIZE as u32,
		})
	}

	/// Reads from the file at `path` starting at byte `offset`, filling as
	/// much of `buf` as the file provides. Returns the number of bytes
	/// read.
	///
	/// A read at or past the end of the file returns 0 and does not touch
	/// the access time.
	pub fn read(&mut self, path: &[u8], buf: &mut [u8], offset: u64) -> Result<usize> {
		let inum = directory::tree_lookup(&self.blocks, path)?;
		let mut node = inode::get(&self.blocks, inum)?;

		if offset >= node.size as u64 {
			return Ok(0);
		}
		let offset = offset as usize;
		let size = buf.len().min(node.size as usize - offset);

		let mut done = 0;
		while done < size {
			let pos = offset + done;
			let Some(bnum) = inode::bnum(&self.blocks, &node, (pos / BLOCK_SIZE) as u32) else {
				break;
			};
			let block_off = pos % BLOCK_SIZE;
			let chunk = (BLOCK_SIZE - block_off).min(size - done);
			let block = self.blocks.block(bnum);
			buf[done..done + chunk].copy_from_slice(&block[block_off..block_off + chunk]);
			done += chunk;
		}

		node.atime = util::unix_seconds();
		inode::put(&mut self.blocks, inum, &node)?;
		Ok(done)
	}

	/// Writes `data` into the file at `path` starting at byte `offset`,
	/// growing the file as needed. Returns the number of bytes written.
	pub fn write(&mut self, path: &[u8], data: &[u8], offset: u64) -> Result<usize> {
		let inum = directory::tree_lookup(&self.blocks, path)?;
		let mut node = inode::get(&self.blocks, inum)?;

		let end = offset + data.len() as u64;
		if end > node.size as u64 {
			if end > MAX_FILE_SIZE as u64 {
				return Err(Error::NoSpace);
			}
			// grow is not rolled back; persist the record even on failure
			let grown = inode::grow(&mut self.blocks, &mut node, end as u32);
			inode::put(&mut self.blocks, inum, &node)?;
			grown?;
		}

		let offset = offset as usize;
		let mut done = 0;
		while done < data.len() {
			let pos = offset + done;
			let Some(bnum) = inode::bnum(&self.blocks, &node, (pos / BLOCK_SIZE) as u32) else {
				log::warn!("write: no block for file block {}", pos / BLOCK_SIZE);
				break;
			};
			let block_off = pos % BLOCK_SIZE;
			let chunk = (BLOCK_SIZE - block_off).min(data.len() - done);
			let block = self.blocks.block_mut(bnum);
			block[block_off..block_off + chunk].copy_from_slice(&data[done..done + chunk]);
			done += chunk;
		}

		node.mtime = util::unix_seconds();
		inode::put(&mut self.blocks, inum, &node)?;
		Ok(done)
	}

	/// Sets the length of the file at `path` to `size`, growing or
	/// shrinking as needed.
	pub fn truncate(&mut self, path: &[u8], size: u64) -> Result<()> {
		let inum = directory::tree_lookup(&self.blocks, path)?;
		let mut node = inode::get(&self.blocks, inum)?;

		if size > MAX_FILE_SIZE as u64 {
			return Err(Error::NoSpace);
		}
		let size = size as u32;
		if size == node.size {
			return Ok(());
		}
		let resized = if size > node.size {
			inode::grow(&mut self.blocks, &mut node, size)
		} else {
			inode::shrink(&mut self.blocks, &mut node, size)
		};
		inode::put(&mut self.blocks, inum, &node)?;
		resized
	}

	/// Creates a file or directory at `path` with the given `mode`.
	///
	/// The directory bit in `mode` decides which: a new directory gets one
	/// data block for entries up front. The parent directory must exist.
	pub fn mknod(&mut self, path: &[u8], mode: u32) -> Result<()> {
		if directory::tree_lookup(&self.blocks, path).is_ok() {
			return Err(Error::Exists);
		}
		let parent = directory::tree_lookup_parent(&self.blocks, path)?;

		let inum = inode::alloc(&mut self.blocks)?;
		let mut node = inode::get(&self.blocks, inum)?;
		node.mode = mode;
		if mode & libc::S_IFDIR != 0 {
			if let Err(e) = inode::grow(&mut self.blocks, &mut node, BLOCK_SIZE as u32) {
				inode::free(&mut self.blocks, inum)?;
				return Err(e);
			}
		}
		inode::put(&mut self.blocks, inum, &node)?;

		let name = directory::basename(path);
		if let Err(e) = directory::put(&mut self.blocks, parent, name, inum) {
			inode::free(&mut self.blocks, inum)?;
			return Err(e);
		}

		log::debug!("mknod({}, {mode:o}) -> inode {inum}", String::from_utf8_lossy(path));
		Ok(())
	}

	/// Removes the directory entry at `path` and drops one reference from
	/// its inode, freeing the inode and its blocks when no link remains.
	pub fn unlink(&mut self, path: &[u8]) -> Result<()> {
		let inum = directory::tree_lookup(&self.blocks, path)?;
		let parent = directory::tree_lookup_parent(&self.blocks, path)?;

		directory::delete(&mut self.blocks, parent, directory::basename(path))?;

		let mut node = inode::get(&self.blocks, inum)?;
		node.refs = node.refs.saturating_sub(1);
		if node.refs == 0 {
			inode::free(&mut self.blocks, inum)?;
		} else {
			inode::put(&mut self.blocks, inum, &node)?;
		}

		log::debug!("unlink({})", String::from_utf8_lossy(path));
		Ok(())
	}

	/// Creates a hard link: a new entry at `to` referencing the inode of
	/// the existing `from`.
	pub fn link(&mut self, from: &[u8], to: &[u8]) -> Result<()> {
		let inum = directory::tree_lookup(&self.blocks, from)?;
		if directory::tree_lookup(&self.blocks, to).is_ok() {
			return Err(Error::Exists);
		}
		let parent = directory::tree_lookup_parent(&self.blocks, to)?;

		directory::put(&mut self.blocks, parent, directory::basename(to), inum)?;

		let mut node = inode::get(&self.blocks, inum)?;
		node.refs += 1;
		inode::put(&mut self.blocks, inum, &node)?;

		log::debug!(
			"link({} => {})",
			String::from_utf8_lossy(from),
			String::from_utf8_lossy(to)
		);
		Ok(())
	}

	/// Moves the entry at `from` to `to`, replacing `to` if it exists.
	///
	/// When both names already refer to the same inode, nothing is done.
	/// The end state is a single entry at `to` bound to `from`'s inode;
	/// the steps are not atomic.
	pub fn rename(&mut self, from: &[u8], to: &[u8]) -> Result<()> {
		let inum = directory::tree_lookup(&self.blocks, from)?;
		if let Ok(existing) = directory::tree_lookup(&self.blocks, to) {
			if existing == inum {
				return Ok(());
			}
			self.unlink(to)?;
		}

		let from_parent = directory::tree_lookup_parent(&self.blocks, from)?;
		let to_parent = directory::tree_lookup_parent(&self.blocks, to)?;

		directory::put(&mut self.blocks, to_parent, directory::basename(to), inum)?;
		directory::delete(&mut self.blocks, from_parent, directory::basename(from))?;

		log::debug!(
			"rename({} => {})",
			String::from_utf8_lossy(from),
			String::from_utf8_lossy(to)
		);
		Ok(())
	}

	/// Replaces the permission bits of the file at `path`, keeping the
	/// type bits.
	pub fn chmod(&mut self, path: &[u8], mode: u32) -> Result<()> {
		let inum = directory::tree_lookup(&self.blocks, path)?;
		let mut node = inode::get(&self.blocks, inum)?;
		node.mode = (node.mode & libc::S_IFMT) | (mode & !libc::S_IFMT);
		inode::put(&mut self.blocks, inum, &node)
	}

	/// Overwrites the access and modification times of the file at `path`.
	pub fn set_times(&mut self, path: &[u8], atime: i64, mtime: i64) -> Result<()> {
		let inum = directory::tree_lookup(&self.blocks, path)?;
		let mut node = inode::get(&self.blocks, inum)?;
		node.atime = atime;
		node.mtime = mtime;
		inode::put(&mut self.blocks, inum, &node)
	}

	/// Returns the names bound in the directory at `path`, in slot order.
	pub fn list(&self, path: &[u8]) -> Result<Vec<Vec<u8>>> {
		let inum = directory::tree_lookup(&self.blocks, path)?;
		let node = inode::get(&self.blocks, inum)?;
		if !node.is_dir() {
			return Err(Error::NotADirectory);
		}
		Ok(directory::entries(&self.blocks, &node))
	}
}

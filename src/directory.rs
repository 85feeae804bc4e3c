//! The directory layer: directories as ordinary files whose contents are
//! an array of fixed-size name-to-inode entries, plus path traversal.
//!
//! A directory's data is a flat array of 64-byte [`Dirent`] records with
//! no particular order. Deleting an entry zeroes its slot in place and
//! leaves a hole; insertion reuses the first hole and only grows the
//! directory when there is none. There is no on-disk directory type
//! beyond the mode bit on the inode.

use crate::bitmap;
use crate::blocks;
use crate::blocks::Blocks;
use crate::blocks::BLOCK_SIZE;
use crate::error::Error;
use crate::error::Result;
use crate::inode;
use crate::inode::Inode;
use std::mem::size_of;

/// The size of the name field of an entry, terminating NUL included.
pub const NAME_LEN: usize = 48;
/// The number of entries a directory block holds.
pub const ENTRIES_PER_BLOCK: usize = BLOCK_SIZE / size_of::<Dirent>();
/// The inode number of the root directory.
pub const ROOT_INUM: u32 = 0;

/// A directory entry, exactly as stored in a directory's data blocks.
///
/// A slot is empty when `inum` is 0 or the name starts with a NUL byte;
/// inode 0 is the root directory and can never appear as a child, which
/// is what makes 0 usable as the empty marker.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct Dirent {
	/// NUL-terminated name; at most [`NAME_LEN`]` - 1` usable bytes.
	pub name: [u8; NAME_LEN],
	/// The inode the name refers to.
	pub inum: u32,
	/// Pads the record to 64 bytes; always zero on the image.
	_reserved: [u8; 12],
}

impl Dirent {
	/// An all-zero, empty slot.
	const EMPTY: Self = Self {
		name: [0; NAME_LEN],
		inum: 0,
		_reserved: [0; 12],
	};

	/// Builds an entry binding `name` to `inum`.
	///
	/// `name` must have been validated to fit; see [`put`].
	fn new(name: &[u8], inum: u32) -> Self {
		let mut entry = Self::EMPTY;
		entry.name[..name.len()].copy_from_slice(name);
		entry.inum = inum;
		entry
	}

	/// Tells whether the slot is empty.
	pub fn is_empty(&self) -> bool {
		self.inum == 0 || self.name[0] == 0
	}

	/// Returns the name without its NUL padding.
	pub fn name_bytes(&self) -> &[u8] {
		let len = self.name.iter().position(|&b| b == 0).unwrap_or(NAME_LEN);
		&self.name[..len]
	}
}

/// Creates the root directory if the image does not have one yet.
///
/// The root is always inode 0, a directory with mode `0755` and one data
/// block for entries. On an already-initialized image this is a no-op.
pub fn init_root(blocks: &mut Blocks) -> Result<()> {
	if bitmap::get(blocks.inode_bitmap(), ROOT_INUM as usize) {
		log::debug!("init_root: root already exists");
		return Ok(());
	}

	let inum = inode::alloc(blocks)?;
	if inum != ROOT_INUM {
		log::warn!("init_root: expected inode 0, got {inum}");
	}
	let mut root = inode::get(blocks, inum)?;
	root.mode = libc::S_IFDIR | 0o755;
	inode::grow(blocks, &mut root, BLOCK_SIZE as u32)?;
	inode::put(blocks, inum, &root)?;

	log::debug!("init_root: created root directory");
	Ok(())
}

/// Returns the number of entry slots `node` currently addresses.
fn max_entries(node: &Inode) -> usize {
	let num_blocks = match node.size {
		0 => 0,
		size => blocks::bytes_to_blocks(size as usize),
	};
	num_blocks * ENTRIES_PER_BLOCK
}

/// Returns the image byte offset of entry `index` of directory `node`, or
/// `None` when the backing block is not allocated.
fn entry_offset(blocks: &Blocks, node: &Inode, index: usize) -> Option<usize> {
	let bnum = inode::bnum(blocks, node, (index / ENTRIES_PER_BLOCK) as u32)?;
	Some(bnum as usize * BLOCK_SIZE + (index % ENTRIES_PER_BLOCK) * size_of::<Dirent>())
}

/// Reads entry `index` of directory `node`.
fn get_entry(blocks: &Blocks, node: &Inode, index: usize) -> Option<Dirent> {
	let off = entry_offset(blocks, node, index)?;
	Some(unsafe { blocks.read_record(off) })
}

/// Searches directory `node` for `name` and returns the bound inode
/// number.
///
/// The scan runs over every slot up to the directory's capacity: holes
/// left by deletions are skipped, not treated as an end marker.
pub fn lookup(blocks: &Blocks, node: &Inode, name: &[u8]) -> Option<u32> {
	if name.is_empty() {
		return None;
	}
	for i in 0..max_entries(node) {
		let entry = get_entry(blocks, node, i)?;
		if !entry.is_empty() && entry.name_bytes() == name {
			return Some(entry.inum);
		}
	}
	None
}

/// Binds `name` to `inum` in the directory at `dir_inum`.
///
/// The entry goes into the first empty slot; when the directory is full
/// it grows by exactly one block and the entry goes at the old capacity.
/// Duplicate names are not detected; callers check with [`lookup`] first.
pub fn put(blocks: &mut Blocks, dir_inum: u32, name: &[u8], inum: u32) -> Result<()> {
	if name.is_empty() {
		return Err(Error::NoEntry);
	}
	if name.len() >= NAME_LEN {
		return Err(Error::NameTooLong);
	}

	let mut node = inode::get(blocks, dir_inum)?;
	if !node.is_dir() {
		return Err(Error::NotADirectory);
	}
	let capacity = max_entries(&node);
	for i in 0..capacity {
		let Some(off) = entry_offset(blocks, &node, i) else {
			break;
		};
		let entry: Dirent = unsafe { blocks.read_record(off) };
		if entry.is_empty() {
			blocks.write_record(off, &Dirent::new(name, inum));
			log::trace!("directory_put: slot {i}");
			return Ok(());
		}
	}

	// no hole left; extend the directory by one block
	let new_size = node.size + BLOCK_SIZE as u32;
	inode::grow(blocks, &mut node, new_size)?;
	inode::put(blocks, dir_inum, &node)?;

	let off = entry_offset(blocks, &node, capacity).ok_or(Error::OutOfRange)?;
	blocks.write_record(off, &Dirent::new(name, inum));
	log::trace!("directory_put: slot {capacity} (grew directory)");
	Ok(())
}

/// Removes the entry `name` from the directory at `dir_inum`.
///
/// The 64-byte slot is zeroed in place; no compaction happens, so slot
/// positions of other entries are stable.
pub fn delete(blocks: &mut Blocks, dir_inum: u32, name: &[u8]) -> Result<()> {
	if name.is_empty() {
		return Err(Error::NoEntry);
	}

	let node = inode::get(blocks, dir_inum)?;
	for i in 0..max_entries(&node) {
		let Some(off) = entry_offset(blocks, &node, i) else {
			break;
		};
		let entry: Dirent = unsafe { blocks.read_record(off) };
		if !entry.is_empty() && entry.name_bytes() == name {
			blocks.write_record(off, &Dirent::EMPTY);
			return Ok(());
		}
	}
	Err(Error::NoEntry)
}

/// Returns the names bound in directory `node`, in slot order, skipping
/// holes.
///
/// `.` and `..` are not stored and thus not returned; the host
/// synthesizes them.
pub fn entries(blocks: &Blocks, node: &Inode) -> Vec<Vec<u8>> {
	let mut names = Vec::new();
	for i in 0..max_entries(node) {
		let Some(entry) = get_entry(blocks, node, i) else {
			break;
		};
		if !entry.is_empty() {
			names.push(entry.name_bytes().to_vec());
		}
	}
	names
}

/// Returns the last component of `path`.
///
/// With no slash in `path`, the whole path is returned.
pub fn basename(path: &[u8]) -> &[u8] {
	match path.iter().rposition(|&b| b == b'/') {
		Some(pos) => &path[pos + 1..],
		None => path,
	}
}

/// Resolves an absolute `path` to an inode number, walking the tree from
/// the root.
///
/// Empty components (repeated or trailing slashes) are skipped. Walking
/// through a non-directory component fails; the host surfaces that the
/// same way as a missing entry.
pub fn tree_lookup(blocks: &Blocks, path: &[u8]) -> Result<u32> {
	if path.first() != Some(&b'/') {
		return Err(Error::NoEntry);
	}
	if path == b"/" {
		return Ok(ROOT_INUM);
	}

	let mut current = ROOT_INUM;
	for component in path[1..].split(|&b| b == b'/') {
		if component.is_empty() {
			continue;
		}
		let node = inode::get(blocks, current).map_err(|_| Error::NoEntry)?;
		if !node.is_dir() {
			return Err(Error::NotADirectory);
		}
		current = lookup(blocks, &node, component).ok_or(Error::NoEntry)?;
	}
	Ok(current)
}

/// Resolves the parent directory of `path` to an inode number.
pub fn tree_lookup_parent(blocks: &Blocks, path: &[u8]) -> Result<u32> {
	if path.first() != Some(&b'/') {
		return Err(Error::NoEntry);
	}
	match path.iter().rposition(|&b| b == b'/') {
		Some(0) => Ok(ROOT_INUM),
		Some(pos) => tree_lookup(blocks, &path[..pos]),
		None => Err(Error::NoEntry),
	}
}

//! The inode layer: the on-image inode table, inode allocation, and the
//! mapping from a file's logical blocks to physical blocks.
//!
//! Each file or directory owns one direct block pointer and, past the
//! first block, one indirect block holding up to 1024 further block
//! indices. Pointer value `0` means "unallocated": block 0 holds the
//! bitmaps and can never back a file.

use crate::bitmap;
use crate::blocks;
use crate::blocks::Blocks;
use crate::blocks::BLOCK_SIZE;
use crate::error::Error;
use crate::error::Result;
use crate::util;
use std::mem::size_of;

/// The number of inodes in the table.
pub const INODE_COUNT: usize = 128;
/// The first block of the inode table.
const INODE_TABLE_BLOCK: usize = 1;
/// The number of block indices an indirect block holds.
pub const PTRS_PER_BLOCK: usize = BLOCK_SIZE / size_of::<u32>();
/// The largest file the direct + single indirect scheme can address.
pub const MAX_FILE_SIZE: usize = (1 + PTRS_PER_BLOCK) * BLOCK_SIZE;

/// An inode record, exactly as stored in the table.
///
/// The record is 48 bytes: the natural layout of these fields with 4
/// bytes of explicit padding before `atime`. 128 records span blocks 1
/// and 2 of the image.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct Inode {
	/// Hard-link reference count.
	pub refs: u32,
	/// File type and permission bits, POSIX-encoded.
	pub mode: u32,
	/// Logical length in bytes.
	pub size: u32,
	/// Direct data block index, or 0 if unallocated.
	pub block: u32,
	/// Indirect block index, or 0 if absent.
	pub indirect: u32,
	/// Keeps `atime` 8-byte aligned; always zero on the image.
	_pad: u32,
	/// Last access time, seconds since the epoch.
	pub atime: i64,
	/// Last modification time, seconds since the epoch.
	pub mtime: i64,
	/// Owner user id, captured at creation.
	pub uid: u32,
	/// Owner group id, captured at creation.
	pub gid: u32,
}

impl Inode {
	/// Tells whether the inode describes a directory.
	pub fn is_dir(&self) -> bool {
		self.mode & libc::S_IFDIR != 0
	}
}

/// Returns the number of blocks the inode table itself occupies.
fn table_blocks() -> usize {
	(INODE_COUNT * size_of::<Inode>()).div_ceil(BLOCK_SIZE)
}

/// Returns the byte offset of inode `inum` in the image.
fn table_offset(inum: u32) -> usize {
	INODE_TABLE_BLOCK * BLOCK_SIZE + inum as usize * size_of::<Inode>()
}

/// Returns the byte offset of entry `i` of the indirect table at block
/// `indirect`.
fn indirect_offset(indirect: u32, i: usize) -> usize {
	indirect as usize * BLOCK_SIZE + i * size_of::<u32>()
}

/// Marks the blocks holding the inode table as allocated.
///
/// Idempotent; called once per mount before any allocation.
pub fn init(blocks: &mut Blocks) {
	for i in 0..table_blocks() {
		bitmap::set(blocks.block_bitmap_mut(), INODE_TABLE_BLOCK + i, true);
	}
}

/// Reads inode `inum` from the table.
pub fn get(blocks: &Blocks, inum: u32) -> Result<Inode> {
	if inum as usize >= INODE_COUNT {
		return Err(Error::OutOfRange);
	}
	Ok(unsafe { blocks.read_record(table_offset(inum)) })
}

/// Writes `node` back to slot `inum` of the table.
pub fn put(blocks: &mut Blocks, inum: u32, node: &Inode) -> Result<()> {
	if inum as usize >= INODE_COUNT {
		return Err(Error::OutOfRange);
	}
	blocks.write_record(table_offset(inum), node);
	Ok(())
}

/// Allocates a fresh inode.
///
/// Takes the lowest free slot, zero-initializes the record with one
/// reference, and captures the calling process's uid/gid and the current
/// time. Returns the inode number.
pub fn alloc(blocks: &mut Blocks) -> Result<u32> {
	let inum = bitmap::first_clear(blocks.inode_bitmap(), INODE_COUNT)
		.ok_or(Error::NoSpace)? as u32;
	bitmap::set(blocks.inode_bitmap_mut(), inum as usize, true);

	let now = util::unix_seconds();
	let node = Inode {
		refs: 1,
		atime: now,
		mtime: now,
		uid: unsafe { libc::getuid() },
		gid: unsafe { libc::getgid() },
		..Default::default()
	};
	put(blocks, inum, &node)?;

	log::debug!("alloc_inode -> {inum}");
	Ok(inum)
}

/// Frees inode `inum` and every data block it owns.
///
/// Releases the direct block, all populated indirect entries and the
/// indirect block itself, then clears the record and its bitmap bit.
pub fn free(blocks: &mut Blocks, inum: u32) -> Result<()> {
	let node = get(blocks, inum)?;
	log::debug!("free_inode({inum})");

	if node.block != 0 {
		blocks.free_block(node.block);
	}
	if node.indirect != 0 {
		let used = blocks::bytes_to_blocks(node.size as usize)
			.saturating_sub(1)
			.min(PTRS_PER_BLOCK);
		for i in 0..used {
			let entry = blocks.read_u32(indirect_offset(node.indirect, i));
			if entry != 0 {
				blocks.free_block(entry);
			}
		}
		blocks.free_block(node.indirect);
	}

	put(blocks, inum, &Inode::default())?;
	bitmap::set(blocks.inode_bitmap_mut(), inum as usize, false);
	Ok(())
}

/// Translates logical block `file_bnum` of `node` to a physical block.
///
/// Block 0 of a file is the direct pointer; blocks 1 and up live in the
/// indirect table. Returns `None` when the block is not allocated.
pub fn bnum(blocks: &Blocks, node: &Inode, file_bnum: u32) -> Option<u32> {
	if file_bnum == 0 {
		return (node.block != 0).then_some(node.block);
	}
	if node.indirect == 0 {
		return None;
	}
	let i = file_bnum as usize - 1;
	if i >= PTRS_PER_BLOCK {
		return None;
	}
	let entry = blocks.read_u32(indirect_offset(node.indirect, i));
	(entry != 0).then_some(entry)
}

/// Grows `node` to hold `new_size` bytes, allocating data blocks as
/// needed.
///
/// Fresh blocks are zeroed. The indirect block is allocated lazily when
/// the file first extends past one block; if that allocation fails, the
/// data block just taken is released again. On any failure the blocks
/// already added stay in place and `size` is left unchanged; callers do
/// not rely on grow being atomic.
pub fn grow(blocks: &mut Blocks, node: &mut Inode, new_size: u32) -> Result<()> {
	let current = match node.size {
		0 => 0,
		size => blocks::bytes_to_blocks(size as usize),
	};
	let target = match new_size {
		0 => 0,
		size => blocks::bytes_to_blocks(size as usize),
	};
	if target > 1 + PTRS_PER_BLOCK {
		return Err(Error::NoSpace);
	}
	log::trace!("grow_inode: {current} blocks -> {target} blocks");

	for i in current..target {
		let new_block = blocks.alloc_block()?;
		blocks.block_mut(new_block).fill(0);

		if i == 0 {
			node.block = new_block;
		} else {
			if node.indirect == 0 {
				let indirect = match blocks.alloc_block() {
					Ok(b) => b,
					Err(e) => {
						blocks.free_block(new_block);
						return Err(e);
					}
				};
				blocks.block_mut(indirect).fill(0);
				node.indirect = indirect;
			}
			blocks.write_u32(indirect_offset(node.indirect, i - 1), new_block);
		}
	}

	node.size = new_size;
	node.mtime = util::unix_seconds();
	Ok(())
}

/// Shrinks `node` to `new_size` bytes, releasing the blocks past the new
/// end.
///
/// Blocks are freed from the tail down. Once the file fits in at most one
/// block, the indirect block itself is released.
pub fn shrink(blocks: &mut Blocks, node: &mut Inode, new_size: u32) -> Result<()> {
	let current = match node.size {
		0 => 0,
		size => blocks::bytes_to_blocks(size as usize),
	};
	let target = match new_size {
		0 => 0,
		size => blocks::bytes_to_blocks(size as usize),
	};
	log::trace!("shrink_inode: {current} blocks -> {target} blocks");

	for i in (target..current).rev() {
		if i == 0 {
			if node.block != 0 {
				blocks.free_block(node.block);
				node.block = 0;
			}
		} else if node.indirect != 0 {
			let off = indirect_offset(node.indirect, i - 1);
			let entry = blocks.read_u32(off);
			if entry != 0 {
				blocks.free_block(entry);
				blocks.write_u32(off, 0);
			}
		}
	}
	if target <= 1 && node.indirect != 0 {
		blocks.free_block(node.indirect);
		node.indirect = 0;
	}

	node.size = new_size;
	node.mtime = util::unix_seconds();
	Ok(())
}

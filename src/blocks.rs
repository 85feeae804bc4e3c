//! The block layer: the memory-mapped disk image, fixed-size block access
//! and the two on-image allocation bitmaps.
//!
//! The image is the only mutable state of the filesystem. This module owns
//! the mapping exclusively and is the only place where byte ranges of it
//! are reinterpreted as typed records; every other layer goes through the
//! accessors defined here.

use crate::bitmap;
use crate::error::Error;
use crate::error::Result;
use crate::inode::INODE_COUNT;
use std::fs::OpenOptions;
use std::mem::size_of;
use std::path::Path;
use std::ptr;
use std::slice;

use memmap2::MmapMut;

/// The size of a block in bytes.
pub const BLOCK_SIZE: usize = 4096;
/// The number of blocks in the image.
pub const BLOCK_COUNT: usize = 256;
/// The size of the image in bytes.
const IMAGE_SIZE: u64 = (BLOCK_COUNT * BLOCK_SIZE) as u64;

/// Byte offset of the block bitmap inside block 0.
const BLOCK_BITMAP_OFF: usize = 0;
/// Size of the block bitmap in bytes: one bit per block.
const BLOCK_BITMAP_LEN: usize = BLOCK_COUNT / 8;
/// Byte offset of the inode bitmap inside block 0, right after the block
/// bitmap.
const INODE_BITMAP_OFF: usize = BLOCK_BITMAP_OFF + BLOCK_BITMAP_LEN;
/// Size of the inode bitmap in bytes: one bit per inode.
const INODE_BITMAP_LEN: usize = INODE_COUNT / 8;

/// Returns the number of blocks needed to store `bytes` bytes.
pub fn bytes_to_blocks(bytes: usize) -> usize {
	bytes.div_ceil(BLOCK_SIZE)
}

/// The memory-mapped disk image.
///
/// Block 0 holds the two allocation bitmaps and is reserved at
/// initialization, which makes index `0` usable as a "no block" sentinel
/// everywhere a block pointer is stored on the image.
pub struct Blocks {
	/// The mapping of the image file.
	map: MmapMut,
}

impl Blocks {
	/// Opens the image at `path` and maps it read-write.
	///
	/// The file is created if it does not exist and is sized to exactly
	/// [`BLOCK_COUNT`] blocks either way. A freshly created image is
	/// all-zero by construction; block 0 is then marked allocated, which
	/// is idempotent on an image that was already initialized.
	pub fn init(path: &Path) -> Result<Self> {
		let file = OpenOptions::new()
			.read(true)
			.write(true)
			.create(true)
			.open(path)?;
		file.set_len(IMAGE_SIZE)?;
		let map = unsafe { MmapMut::map_mut(&file)? };

		let mut blocks = Self {
			map,
		};
		bitmap::set(blocks.block_bitmap_mut(), 0, true);
		Ok(blocks)
	}

	/// Returns the contents of block `bnum`.
	pub fn block(&self, bnum: u32) -> &[u8] {
		let bnum = bnum as usize;
		assert!(bnum < BLOCK_COUNT, "block index out of range: {bnum}");
		&self.map[bnum * BLOCK_SIZE..(bnum + 1) * BLOCK_SIZE]
	}

	/// Returns the contents of block `bnum` for writing.
	pub fn block_mut(&mut self, bnum: u32) -> &mut [u8] {
		let bnum = bnum as usize;
		assert!(bnum < BLOCK_COUNT, "block index out of range: {bnum}");
		&mut self.map[bnum * BLOCK_SIZE..(bnum + 1) * BLOCK_SIZE]
	}

	/// Returns the block allocation bitmap.
	pub fn block_bitmap(&self) -> &[u8] {
		&self.map[BLOCK_BITMAP_OFF..BLOCK_BITMAP_OFF + BLOCK_BITMAP_LEN]
	}

	/// Returns the block allocation bitmap for writing.
	pub fn block_bitmap_mut(&mut self) -> &mut [u8] {
		&mut self.map[BLOCK_BITMAP_OFF..BLOCK_BITMAP_OFF + BLOCK_BITMAP_LEN]
	}

	/// Returns the inode allocation bitmap.
	pub fn inode_bitmap(&self) -> &[u8] {
		&self.map[INODE_BITMAP_OFF..INODE_BITMAP_OFF + INODE_BITMAP_LEN]
	}

	/// Returns the inode allocation bitmap for writing.
	pub fn inode_bitmap_mut(&mut self) -> &mut [u8] {
		&mut self.map[INODE_BITMAP_OFF..INODE_BITMAP_OFF + INODE_BITMAP_LEN]
	}

	/// Allocates the lowest-numbered free block, marking it in the bitmap.
	///
	/// The contents of the returned block are whatever was last stored
	/// there; callers that need a blank block zero it themselves.
	pub fn alloc_block(&mut self) -> Result<u32> {
		let bnum = bitmap::first_clear(self.block_bitmap(), BLOCK_COUNT)
			.ok_or(Error::NoSpace)?;
		bitmap::set(self.block_bitmap_mut(), bnum, true);
		log::trace!("alloc_block -> {bnum}");
		Ok(bnum as u32)
	}

	/// Releases block `bnum`.
	///
	/// The block's contents are left in place. Freeing an already free
	/// block is a no-op.
	pub fn free_block(&mut self, bnum: u32) {
		log::trace!("free_block({bnum})");
		bitmap::set(self.block_bitmap_mut(), bnum as usize, false);
	}

	/// Reads a `u32` cell at byte offset `off` in the image.
	pub fn read_u32(&self, off: usize) -> u32 {
		let bytes = self.map[off..off + size_of::<u32>()].try_into().unwrap();
		u32::from_le_bytes(bytes)
	}

	/// Writes a `u32` cell at byte offset `off` in the image.
	pub fn write_u32(&mut self, off: usize, val: u32) {
		self.map[off..off + size_of::<u32>()].copy_from_slice(&val.to_le_bytes());
	}

	/// Reads a record of type `T` at byte offset `off` in the image.
	///
	/// The function is marked unsafe because any byte pattern is accepted
	/// as a `T`; it is only used with plain `#[repr(C)]` records for which
	/// every pattern is valid.
	pub(crate) unsafe fn read_record<T: Copy>(&self, off: usize) -> T {
		let bytes = &self.map[off..off + size_of::<T>()];
		ptr::read_unaligned(bytes.as_ptr() as *const T)
	}

	/// Writes the record `rec` at byte offset `off` in the image.
	pub(crate) fn write_record<T: Copy>(&mut self, off: usize, rec: &T) {
		let bytes = unsafe {
			slice::from_raw_parts(rec as *const T as *const u8, size_of::<T>())
		};
		self.map[off..off + size_of::<T>()].copy_from_slice(bytes);
	}
}

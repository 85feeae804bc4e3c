//! A small POSIX-style filesystem stored in a fixed-size disk image.
//!
//! The image is 1 MiB: 256 blocks of 4096 bytes, memory-mapped read-write.
//! Everything lives inside it: a block allocation bitmap and an inode
//! allocation bitmap (block 0), the inode table (blocks 1 and 2), and the
//! data blocks holding file contents and directory entries.
//!
//! The crate is layered bottom-up:
//! - [`blocks`]: the mapped image, block access and the two bitmaps.
//! - [`inode`]: the inode table and per-file block mapping.
//! - [`directory`]: directories as files of fixed-size entries, plus path
//!   traversal.
//! - [`storage`]: the path-addressed operations a filesystem host calls.
//!
//! The engine assumes serialized callers. There is no cache distinct from
//! the mapping; every mutation is a direct store into the mapped region.

pub mod bitmap;
pub mod blocks;
pub mod directory;
pub mod error;
pub mod inode;
pub mod storage;
pub mod util;

pub use error::Error;
pub use error::Result;

//! End-to-end tests driving the storage engine against a scratch image.

use mapfs::blocks::BLOCK_SIZE;
use mapfs::inode::MAX_FILE_SIZE;
use mapfs::storage::Storage;
use mapfs::Error;
use std::path::PathBuf;
use tempfile::TempDir;

fn scratch() -> (TempDir, Storage) {
	let dir = TempDir::new().unwrap();
	let storage = Storage::init(&dir.path().join("disk.img")).unwrap();
	(dir, storage)
}

#[test]
fn fresh_mount_has_root() {
	let (_dir, storage) = scratch();
	let st = storage.stat(b"/").unwrap();
	assert_ne!(st.mode & libc::S_IFDIR, 0);
	assert_eq!(st.ino, 0);
	assert_eq!(st.size, BLOCK_SIZE as u32);
	assert!(st.nlink >= 1);
	assert_eq!(storage.list(b"/").unwrap(), Vec::<Vec<u8>>::new());
}

#[test]
fn write_then_read_round_trip() {
	let (_dir, mut storage) = scratch();
	storage.mknod(b"/hello", libc::S_IFREG | 0o644).unwrap();
	assert_eq!(storage.write(b"/hello", b"world", 0).unwrap(), 5);

	let mut buf = [0; 5];
	assert_eq!(storage.read(b"/hello", &mut buf, 0).unwrap(), 5);
	assert_eq!(&buf, b"world");

	let st = storage.stat(b"/hello").unwrap();
	assert_eq!(st.size, 5);
	assert_eq!(st.blocks, 1);
	assert_eq!(st.blksize, BLOCK_SIZE as u32);
}

#[test]
fn read_past_end_returns_zero() {
	let (_dir, mut storage) = scratch();
	storage.mknod(b"/f", libc::S_IFREG | 0o644).unwrap();
	storage.write(b"/f", b"abc", 0).unwrap();

	let mut buf = [0; 8];
	assert_eq!(storage.read(b"/f", &mut buf, 3).unwrap(), 0);
	assert_eq!(storage.read(b"/f", &mut buf, 100).unwrap(), 0);
	// a short tail read is clamped
	assert_eq!(storage.read(b"/f", &mut buf, 1).unwrap(), 2);
	assert_eq!(&buf[..2], b"bc");
}

#[test]
fn nested_directories() {
	let (_dir, mut storage) = scratch();
	storage.mknod(b"/d", libc::S_IFDIR | 0o755).unwrap();
	storage.mknod(b"/d/a", libc::S_IFREG | 0o644).unwrap();

	assert_eq!(storage.list(b"/d").unwrap(), vec![b"a".to_vec()]);
	assert!(storage.list(b"/").unwrap().contains(&b"d".to_vec()));

	let st = storage.stat(b"/d").unwrap();
	assert_ne!(st.mode & libc::S_IFDIR, 0);
	assert_eq!(st.size, BLOCK_SIZE as u32);
}

#[test]
fn mknod_errors() {
	let (_dir, mut storage) = scratch();
	storage.mknod(b"/x", libc::S_IFREG | 0o644).unwrap();
	assert!(matches!(
		storage.mknod(b"/x", libc::S_IFREG | 0o644),
		Err(Error::Exists)
	));
	assert!(matches!(
		storage.mknod(b"/missing/y", libc::S_IFREG | 0o644),
		Err(Error::NoEntry)
	));

	let long = [b'n'; 48];
	let mut path = b"/".to_vec();
	path.extend_from_slice(&long);
	assert!(matches!(
		storage.mknod(&path, libc::S_IFREG | 0o644),
		Err(Error::NameTooLong)
	));
	// the rejected name must not leak an inode; the next create reuses it
	storage.mknod(b"/ok", libc::S_IFREG | 0o644).unwrap();
	assert_eq!(storage.stat(b"/ok").unwrap().ino, 2);
}

#[test]
fn name_of_47_bytes_works() {
	let (_dir, mut storage) = scratch();
	let name = [b'n'; 47];
	let mut path = b"/".to_vec();
	path.extend_from_slice(&name);
	storage.mknod(&path, libc::S_IFREG | 0o644).unwrap();
	assert_eq!(storage.list(b"/").unwrap(), vec![name.to_vec()]);
	assert!(storage.stat(&path).is_ok());
}

#[test]
fn hard_links_share_the_inode() {
	let (_dir, mut storage) = scratch();
	storage.mknod(b"/x", libc::S_IFREG | 0o644).unwrap();
	storage.write(b"/x", b"payload", 0).unwrap();

	storage.link(b"/x", b"/y").unwrap();
	let x = storage.stat(b"/x").unwrap();
	let y = storage.stat(b"/y").unwrap();
	assert_eq!(x.ino, y.ino);
	assert_eq!(x.nlink, 2);
	assert_eq!(y.nlink, 2);

	storage.unlink(b"/x").unwrap();
	assert!(matches!(storage.stat(b"/x"), Err(Error::NoEntry)));
	let y = storage.stat(b"/y").unwrap();
	assert_eq!(y.nlink, 1);

	let mut buf = [0; 7];
	assert_eq!(storage.read(b"/y", &mut buf, 0).unwrap(), 7);
	assert_eq!(&buf, b"payload");
}

#[test]
fn link_onto_existing_name_fails() {
	let (_dir, mut storage) = scratch();
	storage.mknod(b"/a", libc::S_IFREG | 0o644).unwrap();
	storage.mknod(b"/b", libc::S_IFREG | 0o644).unwrap();
	assert!(matches!(storage.link(b"/a", b"/b"), Err(Error::Exists)));
}

#[test]
fn file_spanning_the_indirect_block() {
	let (_dir, mut storage) = scratch();
	storage.mknod(b"/a", libc::S_IFREG | 0o644).unwrap();

	let data = [0xab; 5000];
	assert_eq!(storage.write(b"/a", &data, 0).unwrap(), 5000);
	assert_eq!(storage.stat(b"/a").unwrap().size, 5000);

	// the range past the first block comes out of the indirect table
	let mut buf = [0; 904];
	assert_eq!(storage.read(b"/a", &mut buf, 4096).unwrap(), 904);
	assert!(buf.iter().all(|&b| b == 0xab));

	let mut all = vec![0; 5000];
	assert_eq!(storage.read(b"/a", &mut all, 0).unwrap(), 5000);
	assert_eq!(all, data);
}

#[test]
fn write_at_unaligned_offsets() {
	let (_dir, mut storage) = scratch();
	storage.mknod(b"/f", libc::S_IFREG | 0o644).unwrap();
	storage.write(b"/f", &[b'a'; 4096], 0).unwrap();
	// overwrite across the direct/indirect boundary
	storage.write(b"/f", b"zz", 4095).unwrap();

	let mut buf = [0; 3];
	assert_eq!(storage.read(b"/f", &mut buf, 4094).unwrap(), 3);
	assert_eq!(&buf, b"azz");
	assert_eq!(storage.stat(b"/f").unwrap().size, 4097);
}

#[test]
fn max_file_size_is_enforced() {
	let (_dir, mut storage) = scratch();
	storage.mknod(b"/big", libc::S_IFREG | 0o644).unwrap();

	// the last addressable byte is fine as far as addressing goes; the
	// tiny image runs out of blocks first
	assert!(matches!(
		storage.write(b"/big", b"x", MAX_FILE_SIZE as u64),
		Err(Error::NoSpace)
	));
	assert!(matches!(
		storage.truncate(b"/big", MAX_FILE_SIZE as u64 + 1),
		Err(Error::NoSpace)
	));
}

#[test]
fn truncate_grows_and_shrinks() {
	let (_dir, mut storage) = scratch();
	storage.mknod(b"/t", libc::S_IFREG | 0o644).unwrap();

	storage.truncate(b"/t", 10000).unwrap();
	assert_eq!(storage.stat(b"/t").unwrap().size, 10000);
	// grown area reads back as zeros
	let mut buf = [1; 16];
	assert_eq!(storage.read(b"/t", &mut buf, 8000).unwrap(), 16);
	assert!(buf.iter().all(|&b| b == 0));

	storage.write(b"/t", b"keep", 0).unwrap();
	storage.truncate(b"/t", 2).unwrap();
	assert_eq!(storage.stat(b"/t").unwrap().size, 2);
	let mut buf = [0; 4];
	assert_eq!(storage.read(b"/t", &mut buf, 0).unwrap(), 2);
	assert_eq!(&buf[..2], b"ke");

	storage.truncate(b"/t", 0).unwrap();
	assert_eq!(storage.stat(b"/t").unwrap().size, 0);
}

#[test]
fn unlink_releases_space() {
	let (_dir, mut storage) = scratch();
	// fill most of the image, free it, then fill it again
	for round in 0..2 {
		let name = format!("/big{round}");
		storage.mknod(name.as_bytes(), libc::S_IFREG | 0o644).unwrap();
		let data = vec![0x5a; 200 * BLOCK_SIZE];
		assert_eq!(
			storage.write(name.as_bytes(), &data, 0).unwrap(),
			data.len()
		);
		storage.unlink(name.as_bytes()).unwrap();
	}
}

#[test]
fn filling_the_image_fails_cleanly() {
	let (_dir, mut storage) = scratch();
	storage.mknod(b"/big", libc::S_IFREG | 0o644).unwrap();
	let data = vec![0x5a; 256 * BLOCK_SIZE];
	assert!(matches!(storage.write(b"/big", &data, 0), Err(Error::NoSpace)));
}

#[test]
fn rename_moves_the_entry() {
	let (_dir, mut storage) = scratch();
	storage.mknod(b"/d", libc::S_IFDIR | 0o755).unwrap();
	storage.mknod(b"/a", libc::S_IFREG | 0o644).unwrap();
	let ino = storage.stat(b"/a").unwrap().ino;

	storage.rename(b"/a", b"/d/b").unwrap();
	assert!(!storage.list(b"/").unwrap().contains(&b"a".to_vec()));
	assert_eq!(storage.list(b"/d").unwrap(), vec![b"b".to_vec()]);
	assert_eq!(storage.stat(b"/d/b").unwrap().ino, ino);
}

#[test]
fn rename_replaces_the_target() {
	let (_dir, mut storage) = scratch();
	storage.mknod(b"/a", libc::S_IFREG | 0o644).unwrap();
	storage.mknod(b"/b", libc::S_IFREG | 0o644).unwrap();
	storage.write(b"/a", b"from a", 0).unwrap();
	let a_ino = storage.stat(b"/a").unwrap().ino;
	let b_ino = storage.stat(b"/b").unwrap().ino;

	storage.rename(b"/a", b"/b").unwrap();
	assert!(matches!(storage.stat(b"/a"), Err(Error::NoEntry)));
	assert_eq!(storage.stat(b"/b").unwrap().ino, a_ino);

	// the replaced inode was freed and is handed out again
	storage.mknod(b"/c", libc::S_IFREG | 0o644).unwrap();
	assert_eq!(storage.stat(b"/c").unwrap().ino, b_ino);

	let mut buf = [0; 6];
	assert_eq!(storage.read(b"/b", &mut buf, 0).unwrap(), 6);
	assert_eq!(&buf, b"from a");
}

#[test]
fn rename_same_inode_is_a_no_op() {
	let (_dir, mut storage) = scratch();
	storage.mknod(b"/a", libc::S_IFREG | 0o644).unwrap();
	storage.link(b"/a", b"/b").unwrap();

	storage.rename(b"/a", b"/b").unwrap();
	assert_eq!(storage.stat(b"/a").unwrap().nlink, 2);
	assert_eq!(storage.stat(b"/b").unwrap().nlink, 2);
}

#[test]
fn chmod_keeps_the_type_bits() {
	let (_dir, mut storage) = scratch();
	storage.mknod(b"/f", libc::S_IFREG | 0o644).unwrap();
	storage.chmod(b"/f", 0o600).unwrap();
	let st = storage.stat(b"/f").unwrap();
	assert_eq!(st.mode, libc::S_IFREG | 0o600);

	// type bits in the requested mode are ignored
	storage.chmod(b"/f", libc::S_IFDIR | 0o755).unwrap();
	let st = storage.stat(b"/f").unwrap();
	assert_eq!(st.mode, libc::S_IFREG | 0o755);
}

#[test]
fn set_times_overwrites_both() {
	let (_dir, mut storage) = scratch();
	storage.mknod(b"/f", libc::S_IFREG | 0o644).unwrap();
	storage.set_times(b"/f", 1000, 2000).unwrap();
	let st = storage.stat(b"/f").unwrap();
	assert_eq!(st.atime, 1000);
	assert_eq!(st.mtime, 2000);
}

#[test]
fn deep_paths_resolve() {
	let (_dir, mut storage) = scratch();
	storage.mknod(b"/a", libc::S_IFDIR | 0o755).unwrap();
	storage.mknod(b"/a/b", libc::S_IFDIR | 0o755).unwrap();
	storage.mknod(b"/a/b/c", libc::S_IFDIR | 0o755).unwrap();
	storage.mknod(b"/a/b/c/f", libc::S_IFREG | 0o644).unwrap();

	storage.write(b"/a/b/c/f", b"deep", 0).unwrap();
	let mut buf = [0; 4];
	assert_eq!(storage.read(b"/a/b/c/f", &mut buf, 0).unwrap(), 4);
	assert_eq!(&buf, b"deep");

	// a file in the middle of the path is not a directory
	assert!(matches!(
		storage.stat(b"/a/b/c/f/under"),
		Err(Error::NotADirectory)
	));
}

#[test]
fn listing_survives_deletion_holes() {
	let (_dir, mut storage) = scratch();
	for name in [&b"/a"[..], b"/b", b"/c", b"/d"] {
		storage.mknod(name, libc::S_IFREG | 0o644).unwrap();
	}
	storage.unlink(b"/b").unwrap();

	assert_eq!(
		storage.list(b"/").unwrap(),
		vec![b"a".to_vec(), b"c".to_vec(), b"d".to_vec()]
	);

	// the freed slot is the first one reused
	storage.mknod(b"/e", libc::S_IFREG | 0o644).unwrap();
	assert_eq!(
		storage.list(b"/").unwrap(),
		vec![b"a".to_vec(), b"e".to_vec(), b"c".to_vec(), b"d".to_vec()]
	);
}

#[test]
fn directory_grows_past_one_block() {
	let (_dir, mut storage) = scratch();
	storage.mknod(b"/d", libc::S_IFDIR | 0o755).unwrap();
	for i in 0..65 {
		let path = format!("/d/f{i}");
		storage.mknod(path.as_bytes(), libc::S_IFREG | 0o644).unwrap();
	}
	assert_eq!(storage.list(b"/d").unwrap().len(), 65);
	assert_eq!(storage.stat(b"/d").unwrap().size, 2 * BLOCK_SIZE as u32);
	assert!(storage.stat(b"/d/f64").is_ok());
}

#[test]
fn contents_persist_across_remount() {
	let dir = TempDir::new().unwrap();
	let image: PathBuf = dir.path().join("disk.img");

	{
		let mut storage = Storage::init(&image).unwrap();
		storage.mknod(b"/d", libc::S_IFDIR | 0o755).unwrap();
		storage.mknod(b"/d/f", libc::S_IFREG | 0o644).unwrap();
		storage.write(b"/d/f", b"durable", 0).unwrap();
		storage.link(b"/d/f", b"/d/g").unwrap();
	}

	let mut storage = Storage::init(&image).unwrap();
	assert_eq!(storage.list(b"/").unwrap(), vec![b"d".to_vec()]);
	let st = storage.stat(b"/d/f").unwrap();
	assert_eq!(st.size, 7);
	assert_eq!(st.nlink, 2);

	let mut buf = [0; 7];
	assert_eq!(storage.read(b"/d/f", &mut buf, 0).unwrap(), 7);
	assert_eq!(&buf, b"durable");

	// the remount must not re-create the root over existing data
	storage.mknod(b"/new", libc::S_IFREG | 0o644).unwrap();
	assert_eq!(
		storage.list(b"/").unwrap(),
		vec![b"d".to_vec(), b"new".to_vec()]
	);
}

#[test]
fn unlink_missing_file_fails() {
	let (_dir, mut storage) = scratch();
	assert!(matches!(storage.unlink(b"/nope"), Err(Error::NoEntry)));
}

#[test]
fn stat_reports_owner() {
	let (_dir, mut storage) = scratch();
	storage.mknod(b"/f", libc::S_IFREG | 0o644).unwrap();
	let st = storage.stat(b"/f").unwrap();
	assert_eq!(st.uid, unsafe { libc::getuid() });
	assert_eq!(st.gid, unsafe { libc::getgid() });
	assert!(st.mtime > 0);
}

//! The `mapfs` tool mounts a disk image as a FUSE filesystem.
//!
//! This binary is the host adapter: it translates kernel filesystem
//! calls into storage operations and maps errors back to errno values.
//! All filesystem semantics live in the library; the only logic added
//! here is what the kernel interface requires: synthesizing `.` and
//! `..` in directory listings, refusing to remove non-empty
//! directories, and keeping a table from kernel inode numbers back to
//! paths, since the storage API is path-addressed.

use fuser::FileAttr;
use fuser::FileType;
use fuser::Filesystem;
use fuser::MountOption;
use fuser::ReplyAttr;
use fuser::ReplyData;
use fuser::ReplyDirectory;
use fuser::ReplyEmpty;
use fuser::ReplyEntry;
use fuser::ReplyWrite;
use fuser::Request;
use fuser::TimeOrNow;
use log::debug;
use mapfs::storage::FileStat;
use mapfs::storage::Storage;
use std::collections::HashMap;
use std::env;
use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;
use std::process::exit;
use std::time::Duration;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

/// How long the kernel may cache attributes and entries.
const TTL: Duration = Duration::from_secs(1);

/// Returns the kernel inode number for a storage inode number.
///
/// The kernel reserves 1 for the mount root; the storage engine's root is
/// inode 0, so every number is shifted by one.
fn fuse_ino(ino: u32) -> u64 {
	ino as u64 + 1
}

/// Converts an inode timestamp to a system time.
fn timestamp(secs: i64) -> SystemTime {
	UNIX_EPOCH + Duration::from_secs(secs.max(0) as u64)
}

/// Returns the kernel file type for a mode.
fn file_kind(mode: u32) -> FileType {
	if mode & libc::S_IFDIR != 0 {
		FileType::Directory
	} else {
		FileType::RegularFile
	}
}

/// Converts storage metadata to kernel attributes.
fn attr(st: &FileStat) -> FileAttr {
	FileAttr {
		ino: fuse_ino(st.ino),
		size: st.size as u64,
		blocks: st.blocks as u64,
		atime: timestamp(st.atime),
		mtime: timestamp(st.mtime),
		ctime: timestamp(st.mtime),
		crtime: timestamp(st.mtime),
		kind: file_kind(st.mode),
		perm: (st.mode & 0o7777) as u16,
		nlink: st.nlink,
		uid: st.uid,
		gid: st.gid,
		rdev: 0,
		blksize: st.blksize,
		flags: 0,
	}
}

/// Returns the parent of `path`, `/` included.
fn parent_path(path: &[u8]) -> &[u8] {
	match path.iter().rposition(|&b| b == b'/') {
		Some(0) | None => b"/",
		Some(pos) => &path[..pos],
	}
}

/// Resolves an optional setattr time against the stored seconds.
fn time_or_now(time: Option<TimeOrNow>, stored: i64) -> i64 {
	match time {
		Some(TimeOrNow::SpecificTime(t)) => t
			.duration_since(UNIX_EPOCH)
			.map(|d| d.as_secs() as i64)
			.unwrap_or(0),
		Some(TimeOrNow::Now) => mapfs::util::unix_seconds(),
		None => stored,
	}
}

/// The FUSE host: the storage engine plus the inode-to-path table the
/// kernel interface requires.
struct Host {
	/// The mounted storage engine.
	storage: Storage,
	/// Paths by kernel inode number, filled in as the kernel looks
	/// entries up.
	paths: HashMap<u64, Vec<u8>>,
}

impl Host {
	fn new(storage: Storage) -> Self {
		Self {
			storage,
			paths: HashMap::from([(fuse_ino(0), b"/".to_vec())]),
		}
	}

	/// Returns the recorded path for kernel inode `ino`.
	fn path_of(&self, ino: u64) -> Option<Vec<u8>> {
		self.paths.get(&ino).cloned()
	}

	/// Returns the path of `name` inside the directory with kernel inode
	/// `parent`.
	fn child_path(&self, parent: u64, name: &OsStr) -> Option<Vec<u8>> {
		let mut path = self.paths.get(&parent)?.clone();
		if path != b"/" {
			path.push(b'/');
		}
		path.extend_from_slice(name.as_bytes());
		Some(path)
	}

	/// Stats `path`, records its inode-to-path binding and replies with a
	/// directory entry.
	fn reply_entry(&mut self, path: Vec<u8>, reply: ReplyEntry) {
		match self.storage.stat(&path) {
			Ok(st) => {
				self.paths.insert(fuse_ino(st.ino), path);
				reply.entry(&TTL, &attr(&st), 0);
			}
			Err(e) => reply.error(-e.errno()),
		}
	}
}

impl Filesystem for Host {
	fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
		let Some(path) = self.child_path(parent, name) else {
			reply.error(libc::ENOENT);
			return;
		};
		debug!("lookup({})", String::from_utf8_lossy(&path));
		self.reply_entry(path, reply);
	}

	fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
		let Some(path) = self.path_of(ino) else {
			reply.error(libc::ENOENT);
			return;
		};
		match self.storage.stat(&path) {
			Ok(st) => reply.attr(&TTL, &attr(&st)),
			Err(e) => reply.error(-e.errno()),
		}
	}

	#[allow(clippy::too_many_arguments)]
	fn setattr(
		&mut self,
		_req: &Request<'_>,
		ino: u64,
		mode: Option<u32>,
		_uid: Option<u32>,
		_gid: Option<u32>,
		size: Option<u64>,
		atime: Option<TimeOrNow>,
		mtime: Option<TimeOrNow>,
		_ctime: Option<SystemTime>,
		_fh: Option<u64>,
		_crtime: Option<SystemTime>,
		_chgtime: Option<SystemTime>,
		_bkuptime: Option<SystemTime>,
		_flags: Option<u32>,
		reply: ReplyAttr,
	) {
		let Some(path) = self.path_of(ino) else {
			reply.error(libc::ENOENT);
			return;
		};
		debug!("setattr({})", String::from_utf8_lossy(&path));

		let result = (|| {
			if let Some(size) = size {
				self.storage.truncate(&path, size)?;
			}
			if let Some(mode) = mode {
				self.storage.chmod(&path, mode)?;
			}
			if atime.is_some() || mtime.is_some() {
				let st = self.storage.stat(&path)?;
				let atime = time_or_now(atime, st.atime);
				let mtime = time_or_now(mtime, st.mtime);
				self.storage.set_times(&path, atime, mtime)?;
			}
			self.storage.stat(&path)
		})();
		match result {
			Ok(st) => reply.attr(&TTL, &attr(&st)),
			Err(e) => reply.error(-e.errno()),
		}
	}

	fn mknod(
		&mut self,
		_req: &Request<'_>,
		parent: u64,
		name: &OsStr,
		mode: u32,
		_umask: u32,
		_rdev: u32,
		reply: ReplyEntry,
	) {
		let Some(path) = self.child_path(parent, name) else {
			reply.error(libc::ENOENT);
			return;
		};
		debug!("mknod({}, {mode:o})", String::from_utf8_lossy(&path));
		if let Err(e) = self.storage.mknod(&path, mode) {
			reply.error(-e.errno());
			return;
		}
		self.reply_entry(path, reply);
	}

	fn mkdir(
		&mut self,
		_req: &Request<'_>,
		parent: u64,
		name: &OsStr,
		mode: u32,
		_umask: u32,
		reply: ReplyEntry,
	) {
		let Some(path) = self.child_path(parent, name) else {
			reply.error(libc::ENOENT);
			return;
		};
		debug!("mkdir({})", String::from_utf8_lossy(&path));
		if let Err(e) = self.storage.mknod(&path, mode | libc::S_IFDIR) {
			reply.error(-e.errno());
			return;
		}
		self.reply_entry(path, reply);
	}

	fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
		let Some(path) = self.child_path(parent, name) else {
			reply.error(libc::ENOENT);
			return;
		};
		debug!("unlink({})", String::from_utf8_lossy(&path));
		match self.storage.unlink(&path) {
			Ok(()) => {
				self.paths.retain(|_, p| *p != path);
				reply.ok();
			}
			Err(e) => reply.error(-e.errno()),
		}
	}

	fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
		let Some(path) = self.child_path(parent, name) else {
			reply.error(libc::ENOENT);
			return;
		};
		debug!("rmdir({})", String::from_utf8_lossy(&path));
		match self.storage.list(&path) {
			Ok(entries) if !entries.is_empty() => {
				reply.error(-mapfs::Error::NotEmpty.errno());
				return;
			}
			Err(e) => {
				reply.error(-e.errno());
				return;
			}
			Ok(_) => {}
		}
		match self.storage.unlink(&path) {
			Ok(()) => {
				self.paths.retain(|_, p| *p != path);
				reply.ok();
			}
			Err(e) => reply.error(-e.errno()),
		}
	}

	fn link(
		&mut self,
		_req: &Request<'_>,
		ino: u64,
		newparent: u64,
		newname: &OsStr,
		reply: ReplyEntry,
	) {
		let (Some(from), Some(to)) = (self.path_of(ino), self.child_path(newparent, newname))
		else {
			reply.error(libc::ENOENT);
			return;
		};
		debug!(
			"link({} => {})",
			String::from_utf8_lossy(&from),
			String::from_utf8_lossy(&to)
		);
		if let Err(e) = self.storage.link(&from, &to) {
			reply.error(-e.errno());
			return;
		}
		self.reply_entry(to, reply);
	}

	fn rename(
		&mut self,
		_req: &Request<'_>,
		parent: u64,
		name: &OsStr,
		newparent: u64,
		newname: &OsStr,
		_flags: u32,
		reply: ReplyEmpty,
	) {
		let (Some(from), Some(to)) = (
			self.child_path(parent, name),
			self.child_path(newparent, newname),
		) else {
			reply.error(libc::ENOENT);
			return;
		};
		debug!(
			"rename({} => {})",
			String::from_utf8_lossy(&from),
			String::from_utf8_lossy(&to)
		);
		match self.storage.rename(&from, &to) {
			Ok(()) => {
				// rebind recorded paths, children of a moved directory included
				let mut prefix = from.clone();
				prefix.push(b'/');
				for path in self.paths.values_mut() {
					if *path == from {
						*path = to.clone();
					} else if path.starts_with(&prefix) {
						let mut moved = to.clone();
						moved.push(b'/');
						moved.extend_from_slice(&path[prefix.len()..]);
						*path = moved;
					}
				}
				reply.ok();
			}
			Err(e) => reply.error(-e.errno()),
		}
	}

	fn read(
		&mut self,
		_req: &Request<'_>,
		ino: u64,
		_fh: u64,
		offset: i64,
		size: u32,
		_flags: i32,
		_lock_owner: Option<u64>,
		reply: ReplyData,
	) {
		let Some(path) = self.path_of(ino) else {
			reply.error(libc::ENOENT);
			return;
		};
		debug!(
			"read({}, {size} bytes, @+{offset})",
			String::from_utf8_lossy(&path)
		);
		let mut buf = vec![0; size as usize];
		match self.storage.read(&path, &mut buf, offset.max(0) as u64) {
			Ok(n) => reply.data(&buf[..n]),
			Err(e) => reply.error(-e.errno()),
		}
	}

	fn write(
		&mut self,
		_req: &Request<'_>,
		ino: u64,
		_fh: u64,
		offset: i64,
		data: &[u8],
		_write_flags: u32,
		_flags: i32,
		_lock_owner: Option<u64>,
		reply: ReplyWrite,
	) {
		let Some(path) = self.path_of(ino) else {
			reply.error(libc::ENOENT);
			return;
		};
		debug!(
			"write({}, {} bytes, @+{offset})",
			String::from_utf8_lossy(&path),
			data.len()
		);
		match self.storage.write(&path, data, offset.max(0) as u64) {
			Ok(n) => reply.written(n as u32),
			Err(e) => reply.error(-e.errno()),
		}
	}

	fn readdir(
		&mut self,
		_req: &Request<'_>,
		ino: u64,
		_fh: u64,
		offset: i64,
		mut reply: ReplyDirectory,
	) {
		let Some(path) = self.path_of(ino) else {
			reply.error(libc::ENOENT);
			return;
		};
		debug!("readdir({})", String::from_utf8_lossy(&path));

		let names = match self.storage.list(&path) {
			Ok(names) => names,
			Err(e) => {
				reply.error(-e.errno());
				return;
			}
		};

		let parent_ino = match self.storage.stat(parent_path(&path)) {
			Ok(st) => fuse_ino(st.ino),
			Err(_) => ino,
		};
		let mut items = vec![
			(ino, FileType::Directory, b".".to_vec()),
			(parent_ino, FileType::Directory, b"..".to_vec()),
		];
		for name in names {
			let mut full = path.clone();
			if full != b"/" {
				full.push(b'/');
			}
			full.extend_from_slice(&name);
			if let Ok(st) = self.storage.stat(&full) {
				items.push((fuse_ino(st.ino), file_kind(st.mode), name));
			}
		}

		for (i, (ino, kind, name)) in items.iter().enumerate().skip(offset.max(0) as usize) {
			if reply.add(*ino, (i + 1) as i64, *kind, OsStr::from_bytes(name)) {
				break;
			}
		}
		reply.ok();
	}

	fn access(&mut self, _req: &Request<'_>, ino: u64, _mask: i32, reply: ReplyEmpty) {
		let Some(path) = self.path_of(ino) else {
			reply.error(libc::ENOENT);
			return;
		};
		match self.storage.stat(&path) {
			Ok(_) => reply.ok(),
			Err(e) => reply.error(-e.errno()),
		}
	}
}

/// Structure storing command line arguments.
#[derive(Default)]
struct Args {
	/// The name of the current program used in command line.
	prog: String,
	/// If true, print command line help.
	help: bool,
	/// The path to the disk image.
	image: Option<PathBuf>,
	/// The directory to mount the filesystem on.
	mountpoint: Option<PathBuf>,
}

/// Prints the command's usage.
///
/// `bin` is the name of the current binary.
fn print_usage(bin: &str) {
	eprintln!("Usage:");
	eprintln!(" {bin} [-h] <image> <mountpoint>");
	eprintln!();
	eprintln!("Options:");
	eprintln!(" -h:\t\tprints usage");
	eprintln!(" image:\t\tthe disk image holding the filesystem, created if absent");
	eprintln!(" mountpoint:\tthe directory on which the filesystem is to be mounted");
}

fn parse_args() -> Args {
	let mut args: Args = Default::default();
	let mut iter = env::args();

	args.prog = iter.next().unwrap_or("mapfs".to_owned());
	for arg in iter {
		match arg.as_str() {
			"-h" | "--help" => args.help = true,

			_ if args.image.is_none() => args.image = Some(PathBuf::from(arg)),
			_ => args.mountpoint = Some(PathBuf::from(arg)),
		}
	}

	args
}

fn main() {
	env_logger::init();

	let args = parse_args();
	if args.help {
		print_usage(&args.prog);
		exit(0);
	}
	let (Some(image), Some(mountpoint)) = (args.image, args.mountpoint) else {
		print_usage(&args.prog);
		exit(1);
	};

	let storage = Storage::init(&image).unwrap_or_else(|e| {
		eprintln!("{}: {}: {}", args.prog, image.display(), e);
		exit(1);
	});

	let options = [MountOption::FSName("mapfs".to_owned())];
	fuser::mount2(Host::new(storage), &mountpoint, &options).unwrap_or_else(|e| {
		eprintln!("{}: {}: {}", args.prog, mountpoint.display(), e);
		exit(1);
	});
}

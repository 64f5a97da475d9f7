use std::{
	fs,
	io::{ErrorKind, Result as IoResult},
	path::{Path, PathBuf},
};

use nix::sys::stat::{major, minor, stat, SFlag};

use crate::iobail;

pub const FS_TYPE: &str = "rlfs";
const MTAB_PATH: &str = "/proc/mounts";

/// One line of the process-visible mount table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
	pub device: PathBuf,
	pub dir: PathBuf,
	pub fstype: String,
	pub options: String,
	pub rw: bool,
}

/// Reverses the octal escapes the kernel applies to mount table fields.
fn unescape(s: &str) -> String {
	let mut out = String::with_capacity(s.len());
	let mut chars = s.chars();
	while let Some(c) = chars.next() {
		if c != '\\' {
			out.push(c);
			continue;
		}
		let digits: String = chars.clone().take(3).collect();
		if digits.len() == 3 {
			if let Ok(code) = u8::from_str_radix(&digits, 8) {
				out.push(code as char);
				chars.nth(2);
				continue;
			}
		}
		out.push(c);
	}
	out
}

pub fn parse_mounts(text: &str) -> Vec<MountEntry> {
	let mut entries = Vec::new();
	for line in text.lines() {
		let mut f = line.split_whitespace();
		let (Some(device), Some(dir), Some(fstype), Some(options)) =
			(f.next(), f.next(), f.next(), f.next())
		else {
			continue;
		};
		let options = options.to_string();
		let rw = options.split(',').any(|o| o == "rw");
		entries.push(MountEntry {
			device: PathBuf::from(unescape(device)),
			dir: PathBuf::from(unescape(dir)),
			fstype: fstype.to_string(),
			options,
			rw,
		});
	}
	entries
}

/// Picks the newest matching mount, preferring a read-write one. `dev` and
/// `dir` must already be canonical.
fn select(entries: &[MountEntry], dev: Option<&Path>, dir: Option<&Path>) -> Option<MountEntry> {
	let matches = |e: &&MountEntry| {
		e.fstype == FS_TYPE
			&& dev.map_or(true, |d| e.device == d)
			&& dir.map_or(true, |d| e.dir == d)
	};
	let rw = entries.iter().rev().filter(matches).find(|e| e.rw);
	rw.or_else(|| entries.iter().rev().find(matches)).cloned()
}

/// Locates the file system in the mount table by device path and/or mount
/// point.
pub fn find_mount(dev: Option<&Path>, dir: Option<&Path>) -> IoResult<MountEntry> {
	let text = fs::read_to_string(MTAB_PATH)?;
	let mut entries = parse_mounts(&text);
	for e in &mut entries {
		if let Ok(p) = fs::canonicalize(&e.device) {
			e.device = p;
		}
	}
	let dev = match dev {
		Some(p) => Some(fs::canonicalize(p)?),
		None => None,
	};
	let dir = match dir {
		Some(p) => Some(fs::canonicalize(p)?),
		None => None,
	};

	match select(&entries, dev.as_deref(), dir.as_deref()) {
		Some(e) => Ok(e),
		None => iobail!(
			ErrorKind::NotFound,
			"no {} file system found for dev={:?} dir={:?}",
			FS_TYPE,
			dev,
			dir
		),
	}
}

/// Identity of a file system instance, used to derive the well-known names
/// of the cleaner lock and the control message queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceId {
	/// Block device, identified by its device number.
	Block { major: u64, minor: u64 },
	/// Image file, identified by the containing device and inode.
	File { dev: u64, ino: u64 },
}

impl DeviceId {
	/// Stable name suffix, e.g. `"8-17"`.
	pub fn suffix(&self) -> String {
		match self {
			Self::Block { major, minor } => format!("{major}-{minor}"),
			Self::File { dev, ino } => format!("{dev}-{ino}"),
		}
	}
}

pub fn device_id(path: &Path) -> IoResult<DeviceId> {
	let st = stat(path)?;
	let id = if SFlag::from_bits_truncate(st.st_mode).contains(SFlag::S_IFBLK) {
		DeviceId::Block {
			major: major(st.st_rdev),
			minor: minor(st.st_rdev),
		}
	} else {
		DeviceId::File {
			dev: st.st_dev,
			ino: st.st_ino,
		}
	};
	Ok(id)
}

#[cfg(test)]
mod t {
	use super::*;

	const TABLE: &str = "\
/dev/sda1 / ext4 rw,relatime 0 0
/dev/sdb1 /mnt/a rlfs ro,relatime 0 0
/dev/sdb1 /mnt/b rlfs rw,relatime 0 0
/dev/sdc1 /mnt/with\\040space rlfs rw 0 0
tmpfs /tmp tmpfs rw 0 0
";

	#[test]
	fn parses_and_unescapes() {
		let entries = parse_mounts(TABLE);
		assert_eq!(entries.len(), 5);
		assert_eq!(entries[3].dir, PathBuf::from("/mnt/with space"));
		assert!(!entries[1].rw);
		assert!(entries[2].rw);
	}

	#[test]
	fn select_prefers_read_write() {
		let entries = parse_mounts(TABLE);
		let e = select(&entries, Some(Path::new("/dev/sdb1")), None).unwrap();
		assert_eq!(e.dir, PathBuf::from("/mnt/b"));
	}

	#[test]
	fn select_by_mount_point() {
		let entries = parse_mounts(TABLE);
		let e = select(&entries, None, Some(Path::new("/mnt/a"))).unwrap();
		assert_eq!(e.device, PathBuf::from("/dev/sdb1"));
		assert!(!e.rw);
	}

	#[test]
	fn select_ignores_foreign_fstypes() {
		let entries = parse_mounts(TABLE);
		assert_eq!(select(&entries, None, Some(Path::new("/tmp"))), None);
	}

	#[test]
	fn suffixes() {
		let b = DeviceId::Block {
			major: 8,
			minor: 17,
		};
		assert_eq!(b.suffix(), "8-17");
		let f = DeviceId::File {
			dev: 42,
			ino: 99,
		};
		assert_eq!(f.suffix(), "42-99");
	}
}

use std::{
	cell::Cell,
	ffi::c_void,
	fs::File,
	io::{ErrorKind, Result as IoResult, Seek, SeekFrom},
	num::NonZeroUsize,
	ops::Deref,
	os::fd::{AsRawFd, RawFd},
	path::{Path, PathBuf},
	ptr::NonNull,
};

use nix::sys::{
	mman::{MapFlags, ProtFlags},
	uio::pread,
};

mod lock;

use crate::{
	data::*,
	decoder, err, iobail,
	ioctl::{self, Argv},
	mount::{self, DeviceId, MountEntry},
	segment::Segment,
};
use lock::CleanerLock;

/// Open the block device itself, enabling segment reads.
pub const OPEN_RAW: u32 = 0x01;
/// Initialize the cleaner lock semaphore.
pub const OPEN_GCLK: u32 = 0x02;

/// Batch size for array-typed kernel requests.
pub const REQUEST_BATCH: usize = 512;

pub(crate) fn ioerr(e: nix::errno::Errno) -> std::io::Error {
	std::io::Error::from_raw_os_error(e as i32)
}

/// Disk layout constants derived from the superblock; immutable from open
/// to close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
	pub block_size: u32,
	pub blocks_per_segment: u32,
	pub nsegments: u64,
	pub first_data_block: u64,
	pub crc_seed: u32,
}

impl Geometry {
	fn new(sb: &Superblock) -> Self {
		Self {
			block_size: sb.block_size(),
			blocks_per_segment: sb.blocks_per_segment,
			nsegments: sb.nsegments,
			first_data_block: sb.first_data_block,
			crc_seed: sb.crc_seed,
		}
	}

	pub fn segment_size(&self) -> u64 {
		self.block_size as u64 * self.blocks_per_segment as u64
	}

	/// Disk block range `(start, nblocks)` of a segment. Segment 0's usable
	/// area begins at `first_data_block`.
	pub fn segment_range(&self, segnum: Segnum) -> (Blocknr, u32) {
		let bps = self.blocks_per_segment as u64;
		let start = (segnum * bps).max(self.first_data_block);
		let end = (segnum + 1) * bps;
		(start, (end - start) as u32)
	}
}

/// Byte offset of the secondary superblock on a device of `devsize` bytes.
pub fn sb2_offset(devsize: u64) -> u64 {
	(devsize / SB2_ALIGN).saturating_sub(1) * SB2_ALIGN
}

fn validate_super(raw: &[u8]) -> IoResult<Superblock> {
	let sb: Superblock = decoder::from_bytes(raw)?;
	if sb.magic != SB_MAGIC {
		iobail!(ErrorKind::InvalidInput, "bad superblock magic {:#x}", sb.magic);
	}
	let bytes = sb.bytes as usize;
	if bytes < SB_BYTES as usize || bytes > raw.len() {
		iobail!(ErrorKind::InvalidInput, "bad superblock size {bytes}");
	}
	let mut sum_area = raw[..bytes].to_vec();
	sum_area[SB_SUM_OFFSET..SB_SUM_OFFSET + 4].fill(0);
	if sb.sum != crc32c::crc32c_append(sb.crc_seed, &sum_area) {
		iobail!(ErrorKind::InvalidInput, "superblock checksum mismatch");
	}
	if sb.log_block_size > 16 {
		iobail!(ErrorKind::InvalidInput, "bad block size shift {}", sb.log_block_size);
	}
	if sb.blocks_per_segment < 16 || !sb.blocks_per_segment.is_power_of_two() {
		iobail!(
			ErrorKind::InvalidInput,
			"bad blocks per segment {}",
			sb.blocks_per_segment
		);
	}
	if sb.nsegments == 0 {
		iobail!(ErrorKind::InvalidInput, "no segments");
	}
	Ok(sb)
}

fn read_super_at(dev: &File, offset: u64) -> IoResult<Superblock> {
	let mut raw = [0u8; SB_BYTES as usize];
	let n = pread(dev, &mut raw, offset as libc::off_t).map_err(ioerr)?;
	if n < raw.len() {
		iobail!(ErrorKind::UnexpectedEof, "short superblock read at {offset}");
	}
	validate_super(&raw)
}

/// Reads both superblock copies and picks a valid one, preferring the one
/// that saw the most recent checkpoint.
fn read_super(dev: &mut File) -> IoResult<Superblock> {
	let devsize = dev.seek(SeekFrom::End(0))?;
	let primary = read_super_at(dev, SB_OFFSET)
		.map_err(|e| {
			log::warn!("primary superblock unusable: {e}");
			e
		})
		.ok();
	let secondary = read_super_at(dev, sb2_offset(devsize))
		.map_err(|e| {
			log::warn!("secondary superblock unusable: {e}");
			e
		})
		.ok();

	let sb = match (primary, secondary) {
		(Some(p), Some(s)) => {
			if cnt64_ge(p.last_cno, s.last_cno) {
				p
			} else {
				s
			}
		}
		(Some(p), None) => p,
		(None, Some(s)) => s,
		(None, None) => iobail!(ErrorKind::InvalidInput, "no valid superblock found"),
	};

	let unknown = sb.feature_incompat & !FEATURE_INCOMPAT_SUPPORTED;
	if unknown != 0 {
		iobail!(
			ErrorKind::InvalidInput,
			"unsupported incompatible features {unknown:#x}"
		);
	}
	Ok(sb)
}

/// Segment contents, either read into an owned buffer or mapped.
pub enum SegmentData {
	Owned(Vec<u8>),
	Mapped(MmapRegion),
}

impl Deref for SegmentData {
	type Target = [u8];

	fn deref(&self) -> &[u8] {
		match self {
			Self::Owned(v) => v,
			Self::Mapped(m) => m.as_slice(),
		}
	}
}

pub struct MmapRegion {
	ptr: NonNull<c_void>,
	maplen: usize,
	/// Offset of the payload inside the mapping (page alignment slack).
	skip: usize,
	len: usize,
}

impl MmapRegion {
	fn as_slice(&self) -> &[u8] {
		unsafe { std::slice::from_raw_parts(self.ptr.as_ptr().cast::<u8>().add(self.skip), self.len) }
	}
}

impl Drop for MmapRegion {
	fn drop(&mut self) {
		unsafe {
			let _ = nix::sys::mman::munmap(self.ptr, self.maplen);
		}
	}
}

/// Handle to one mounted rlfs instance: the raw device, the kernel control
/// endpoint (an fd of the mount root) and the superblock-derived geometry.
pub struct Rlfs {
	device: PathBuf,
	dir: PathBuf,
	devid: DeviceId,
	dev: Option<File>,
	ioc: File,
	sb: Superblock,
	geom: Geometry,
	use_mmap: Cell<bool>,
	opt_set_suinfo: Cell<bool>,
	lock: Option<CleanerLock>,
}

impl Rlfs {
	/// Locates the file system through the mount table and opens it. At
	/// least one of `dev` and `dir` must be given.
	pub fn open(dev: Option<&Path>, dir: Option<&Path>, flags: u32) -> IoResult<Self> {
		if dev.is_none() && dir.is_none() {
			return Err(err!(EINVAL));
		}
		let ent: MountEntry = mount::find_mount(dev, dir)?;
		log::debug!(
			"found {} on {} mounted at {} ({})",
			mount::FS_TYPE,
			ent.device.display(),
			ent.dir.display(),
			if ent.rw { "rw" } else { "ro" }
		);

		let devid = mount::device_id(&ent.device)?;
		let ioc = File::open(&ent.dir)?;
		let mut devfile = File::open(&ent.device)?;
		let sb = read_super(&mut devfile)?;
		let geom = Geometry::new(&sb);

		let lock = if flags & OPEN_GCLK != 0 {
			Some(CleanerLock::new(&devid)?)
		} else {
			None
		};

		Ok(Self {
			device: ent.device,
			dir: ent.dir,
			devid,
			dev: (flags & OPEN_RAW != 0).then_some(devfile),
			ioc,
			sb,
			geom,
			use_mmap: Cell::new(false),
			opt_set_suinfo: Cell::new(true),
			lock,
		})
	}

	pub fn device(&self) -> &Path {
		&self.device
	}

	pub fn dir(&self) -> &Path {
		&self.dir
	}

	pub fn devid(&self) -> &DeviceId {
		&self.devid
	}

	pub fn superblock(&self) -> &Superblock {
		&self.sb
	}

	pub fn geometry(&self) -> &Geometry {
		&self.geom
	}

	pub fn set_use_mmap(&self, on: bool) {
		self.use_mmap.set(on);
	}

	/// Whether the optional `set_suinfo` request is still believed to be
	/// supported by the kernel.
	pub fn opt_set_suinfo(&self) -> bool {
		self.opt_set_suinfo.get()
	}

	fn ioc_fd(&self) -> RawFd {
		self.ioc.as_raw_fd()
	}

	/// Reads a whole segment into memory (or maps it when enabled).
	pub fn read_segment(&self, segnum: Segnum) -> IoResult<SegmentData> {
		if segnum >= self.geom.nsegments {
			return Err(err!(EINVAL));
		}
		let dev = self.dev.as_ref().ok_or_else(|| err!(EBADF))?;
		let (start, nblocks) = self.geom.segment_range(segnum);
		let offset = start * self.geom.block_size as u64;
		let len = nblocks as usize * self.geom.block_size as usize;

		if self.use_mmap.get() {
			let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as u64;
			let skip = (offset % page) as usize;
			let maplen = len + skip;
			let ptr = unsafe {
				nix::sys::mman::mmap(
					None,
					NonZeroUsize::new(maplen).unwrap(),
					ProtFlags::PROT_READ,
					MapFlags::MAP_SHARED,
					dev,
					(offset - skip as u64) as libc::off_t,
				)
			}
			.map_err(ioerr)?;
			return Ok(SegmentData::Mapped(MmapRegion {
				ptr,
				maplen,
				skip,
				len,
			}));
		}

		let mut buf = vec![0u8; len];
		let mut done = 0;
		while done < len {
			match pread(dev, &mut buf[done..], (offset + done as u64) as libc::off_t)
				.map_err(ioerr)?
			{
				0 => iobail!(ErrorKind::UnexpectedEof, "short segment read at {offset}"),
				n => done += n,
			}
		}
		Ok(SegmentData::Owned(buf))
	}

	/// Wraps previously read segment contents with the geometry needed to
	/// iterate its logs.
	pub fn segment<'a>(&self, segnum: Segnum, data: &'a [u8]) -> Segment<'a> {
		let (start, _) = self.geom.segment_range(segnum);
		Segment::new(segnum, start, self.geom.block_size, self.geom.crc_seed, data)
	}

	pub fn sync(&self) -> IoResult<Cno> {
		let mut cno = 0u64;
		unsafe { ioctl::sync_fs(self.ioc_fd(), &mut cno) }.map_err(ioerr)?;
		Ok(cno)
	}

	pub fn get_sustat(&self) -> IoResult<Sustat> {
		let mut st = Sustat::default();
		unsafe { ioctl::get_sustat(self.ioc_fd(), &mut st) }.map_err(ioerr)?;
		Ok(st)
	}

	pub fn get_cpstat(&self) -> IoResult<Cpstat> {
		let mut st = Cpstat::default();
		unsafe { ioctl::get_cpstat(self.ioc_fd(), &mut st) }.map_err(ioerr)?;
		Ok(st)
	}

	/// Fills `buf` with checkpoint records starting at `cno`, returning how
	/// many the kernel produced.
	pub fn get_cpinfo(&self, cno: Cno, mode: u32, buf: &mut [Cpinfo]) -> IoResult<usize> {
		let mut argv = Argv::from_mut_slice(buf);
		argv.index = cno;
		argv.flags = mode as u16;
		let n = unsafe { ioctl::get_cpinfo(self.ioc_fd(), &mut argv) }.map_err(ioerr)?;
		Ok(n as usize)
	}

	pub fn change_cpmode(&self, cno: Cno, mode: u32) -> IoResult<()> {
		let arg = CpMode {
			cno,
			mode,
			pad: 0,
		};
		unsafe { ioctl::change_cpmode(self.ioc_fd(), &arg) }.map_err(ioerr)?;
		Ok(())
	}

	pub fn delete_checkpoint(&self, cno: Cno) -> IoResult<()> {
		unsafe { ioctl::delete_checkpoint(self.ioc_fd(), &cno) }.map_err(ioerr)?;
		Ok(())
	}

	pub fn get_suinfo(&self, segnum: Segnum, buf: &mut [Suinfo]) -> IoResult<usize> {
		let mut argv = Argv::from_mut_slice(buf);
		argv.index = segnum;
		let n = unsafe { ioctl::get_suinfo(self.ioc_fd(), &mut argv) }.map_err(ioerr)?;
		Ok(n as usize)
	}

	/// Optional request; `ENOTTY` disables it for this handle's lifetime.
	pub fn set_suinfo(&self, updates: &[SuinfoUpdate]) -> IoResult<()> {
		let argv = Argv::from_slice(updates);
		match unsafe { ioctl::set_suinfo(self.ioc_fd(), &argv) } {
			Ok(_) => Ok(()),
			Err(nix::errno::Errno::ENOTTY) => {
				self.opt_set_suinfo.set(false);
				Err(err!(ENOTTY))
			}
			Err(e) => Err(ioerr(e)),
		}
	}

	pub fn get_vinfo(&self, buf: &mut [Vinfo]) -> IoResult<usize> {
		let mut argv = Argv::from_mut_slice(buf);
		let n = unsafe { ioctl::get_vinfo(self.ioc_fd(), &mut argv) }.map_err(ioerr)?;
		Ok(n as usize)
	}

	pub fn get_bdescs(&self, buf: &mut [Bdesc]) -> IoResult<usize> {
		let mut argv = Argv::from_mut_slice(buf);
		let n = unsafe { ioctl::get_bdescs(self.ioc_fd(), &mut argv) }.map_err(ioerr)?;
		Ok(n as usize)
	}

	/// Submits the atomic clean-segments transaction.
	pub fn clean_segments(
		&self,
		vdescs: &[Vdesc],
		periods: &[Period],
		vblocknrs: &[Blocknr],
		bdescs: &[Bdesc],
		segnums: &[Segnum],
	) -> IoResult<()> {
		let argv = [
			Argv::from_slice(vdescs),
			Argv::from_slice(periods),
			Argv::from_slice(vblocknrs),
			Argv::from_slice(bdescs),
			Argv::from_slice(segnums),
		];
		unsafe { ioctl::clean_segments(self.ioc_fd(), &argv) }.map_err(ioerr)?;
		Ok(())
	}

	pub fn resize(&self, newsize: u64) -> IoResult<()> {
		unsafe { ioctl::resize(self.ioc_fd(), &newsize) }.map_err(ioerr)?;
		Ok(())
	}

	pub fn set_alloc_range(&self, start: u64, end: u64) -> IoResult<()> {
		let range = [start, end];
		unsafe { ioctl::set_alloc_range(self.ioc_fd(), &range) }.map_err(ioerr)?;
		Ok(())
	}

	pub fn freeze(&self) -> IoResult<()> {
		unsafe { ioctl::freeze(self.ioc_fd()) }.map_err(ioerr)?;
		Ok(())
	}

	pub fn thaw(&self) -> IoResult<()> {
		unsafe { ioctl::thaw(self.ioc_fd()) }.map_err(ioerr)?;
		Ok(())
	}

	/// Takes the file-system-wide cleaner lock. The guard releases it on
	/// drop; a failed release terminates the process, since continuing with
	/// a wedged lock could corrupt segment accounting.
	pub fn lock_cleaner(&self) -> IoResult<CleanerGuard<'_>> {
		let lock = self.lock.as_ref().ok_or_else(|| err!(EINVAL))?;
		lock.lock()?;
		Ok(CleanerGuard {
			lock,
		})
	}
}

pub struct CleanerGuard<'a> {
	lock: &'a CleanerLock,
}

impl Drop for CleanerGuard<'_> {
	fn drop(&mut self) {
		if let Err(e) = self.lock.unlock() {
			log::error!("failed to release the cleaner lock: {e}");
			std::process::exit(1);
		}
	}
}

#[cfg(test)]
mod t {
	use std::io::Write;

	use super::*;
	use crate::decoder::to_bytes;

	fn sample_super(last_cno: Cno) -> Superblock {
		Superblock {
			magic: SB_MAGIC,
			bytes: SB_BYTES,
			flags: 0,
			crc_seed: 0xfeed_f00d,
			sum: 0,
			rev: 1,
			log_block_size: 0,
			nsegments: 16,
			dev_size: 16 << 20,
			first_data_block: 1,
			blocks_per_segment: 64,
			reserved_segments_pct: 5,
			last_cno,
			last_pseg: 64,
			last_seq: 1,
			free_blocks: 512,
			ctime: 0,
			mtime: 0,
			feature_compat: 0,
			feature_incompat: 0,
		}
	}

	fn seal(sb: &mut Superblock) -> Vec<u8> {
		sb.sum = 0;
		let mut raw = to_bytes(sb).unwrap();
		let sum = crc32c::crc32c_append(sb.crc_seed, &raw);
		sb.sum = sum;
		raw[SB_SUM_OFFSET..SB_SUM_OFFSET + 4].copy_from_slice(&sum.to_le_bytes());
		raw
	}

	#[test]
	fn validate_accepts_sealed_super() {
		let mut sb = sample_super(3);
		let raw = seal(&mut sb);
		let got = validate_super(&raw).unwrap();
		assert_eq!(got, sb);
	}

	#[test]
	fn validate_rejects_bad_sum() {
		let mut sb = sample_super(3);
		let mut raw = seal(&mut sb);
		raw[40] ^= 1;
		assert!(validate_super(&raw).is_err());
	}

	#[test]
	fn validate_rejects_unknown_incompat() {
		// An unknown incompat bit passes the checksum but must still be
		// rejected at open time; validate_super only checks structure.
		let mut sb = sample_super(3);
		sb.feature_incompat = 0x8000;
		let raw = seal(&mut sb);
		let got = validate_super(&raw).unwrap();
		assert_eq!(got.feature_incompat & !FEATURE_INCOMPAT_SUPPORTED, 0x8000);
	}

	#[test]
	fn read_super_prefers_newer_copy() {
		let mut f = tempfile::tempfile().unwrap();
		let devsize: u64 = 1 << 20;
		f.set_len(devsize).unwrap();

		let mut old = sample_super(3);
		let mut new = sample_super(9);
		let raw_old = seal(&mut old);
		let raw_new = seal(&mut new);

		f.seek(SeekFrom::Start(SB_OFFSET)).unwrap();
		f.write_all(&raw_old).unwrap();
		f.seek(SeekFrom::Start(sb2_offset(devsize))).unwrap();
		f.write_all(&raw_new).unwrap();

		let sb = read_super(&mut f).unwrap();
		assert_eq!(sb.last_cno, 9);
	}

	#[test]
	fn read_super_falls_back_to_secondary() {
		let mut f = tempfile::tempfile().unwrap();
		let devsize: u64 = 1 << 20;
		f.set_len(devsize).unwrap();

		let mut sb = sample_super(5);
		let raw = seal(&mut sb);
		f.seek(SeekFrom::Start(sb2_offset(devsize))).unwrap();
		f.write_all(&raw).unwrap();

		let got = read_super(&mut f).unwrap();
		assert_eq!(got.last_cno, 5);
	}

	#[test]
	fn geometry_segment_ranges() {
		let sb = sample_super(1);
		let g = Geometry::new(&sb);
		assert_eq!(g.block_size, 1024);
		assert_eq!(g.segment_size(), 64 * 1024);
		// Segment 0 loses the blocks before first_data_block.
		assert_eq!(g.segment_range(0), (1, 63));
		assert_eq!(g.segment_range(1), (64, 64));
		assert_eq!(g.segment_range(2), (128, 64));
	}

	#[test]
	fn sb2_offsets() {
		assert_eq!(sb2_offset(1 << 20), (1 << 20) - 4096);
		assert_eq!(sb2_offset((1 << 20) + 1234), (1 << 20) - 4096);
	}
}

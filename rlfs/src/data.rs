use bincode::{
	de::Decoder,
	enc::Encoder,
	error::{DecodeError, EncodeError},
	Decode, Encode,
};

pub type Ino = u64;
pub type Cno = u64;
pub type Blocknr = u64;
pub type Segnum = u64;

/// First valid checkpoint number.
pub const CNO_MIN: Cno = 1;
/// Sentinel meaning "no end yet" in a block lifetime.
pub const CNO_MAX: Cno = u64::MAX;

pub const DAT_INO: Ino = 3;
pub const CPFILE_INO: Ino = 4;
pub const SUFILE_INO: Ino = 5;
/// Inodes below this are metafiles.
pub const FIRST_USER_INO: Ino = 16;

pub const SB_MAGIC: u32 = 0x3253_464c; // "LFS2"
pub const SB_OFFSET: u64 = 1024;
pub const SB_BYTES: u16 = 120;
/// Byte offset of `sum` inside the superblock.
pub const SB_SUM_OFFSET: usize = 12;
/// The secondary superblock sits in the last 4KiB-aligned block.
pub const SB2_ALIGN: u64 = 4096;

pub const SUMMARY_MAGIC: u32 = 0x5347_4553; // "SEGS"
pub const SUMMARY_HEADER_SIZE: usize = 56;
/// Byte offset of the checksummed area inside a summary (everything after
/// `datasum` and `sumsum`).
pub const SUMMARY_SUM_OFFSET: usize = 8;

/// First log of a segment.
pub const SS_LOGBGN: u16 = 0x0001;
/// Last log of a segment.
pub const SS_LOGEND: u16 = 0x0002;
/// Log carries a super-root.
pub const SS_SR: u16 = 0x0004;

pub const FINFO_SIZE: usize = 24;
pub const BINFO_DAT_DATA_SIZE: usize = 8;
pub const BINFO_DAT_NODE_SIZE: usize = 16;
pub const BINFO_V_DATA_SIZE: usize = 16;
pub const BINFO_V_NODE_SIZE: usize = 8;

pub const FEATURE_COMPAT_SUPPORTED: u64 = 0;
pub const FEATURE_INCOMPAT_SUPPORTED: u64 = 0;

pub const SUINFO_DIRTY: u32 = 0x0001;
pub const SUINFO_ACTIVE: u32 = 0x0002;
pub const SUINFO_ERROR: u32 = 0x0004;

pub const SUINFO_UPDATE_LASTMOD: u32 = 0x0001;
pub const SUINFO_UPDATE_NBLOCKS: u32 = 0x0002;
pub const SUINFO_UPDATE_FLAGS: u32 = 0x0004;

pub const CP_SNAPSHOT: u64 = 0x0001;

pub const CP_MODE_CHECKPOINT: u32 = 0;
pub const CP_MODE_SNAPSHOT: u32 = 1;

pub const VDESC_NODE: u32 = 0x0001;

/// Modular comparison of 64-bit sequence numbers. Valid as long as the two
/// counts are less than 2^63 apart.
pub fn cnt64_gt(a: u64, b: u64) -> bool {
	(a.wrapping_sub(b) as i64) > 0
}

pub fn cnt64_ge(a: u64, b: u64) -> bool {
	(a.wrapping_sub(b) as i64) >= 0
}

pub fn cnt64_lt(a: u64, b: u64) -> bool {
	cnt64_gt(b, a)
}

pub fn cnt64_le(a: u64, b: u64) -> bool {
	cnt64_ge(b, a)
}

/// On-disk superblock. Two copies exist: one at byte 1024 and one in the
/// last 4KiB-aligned block of the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Superblock {
	pub magic: u32,
	pub bytes: u16,
	pub flags: u16,
	pub crc_seed: u32,
	pub sum: u32,
	pub rev: u32,
	pub log_block_size: u32,
	pub nsegments: u64,
	pub dev_size: u64,
	pub first_data_block: u64,
	pub blocks_per_segment: u32,
	pub reserved_segments_pct: u32,
	pub last_cno: u64,
	pub last_pseg: u64,
	pub last_seq: u64,
	pub free_blocks: u64,
	pub ctime: u64,
	pub mtime: u64,
	pub feature_compat: u64,
	pub feature_incompat: u64,
}

impl Superblock {
	pub fn block_size(&self) -> u32 {
		1024 << self.log_block_size
	}

	pub fn segment_size(&self) -> u64 {
		self.block_size() as u64 * self.blocks_per_segment as u64
	}
}

impl Decode for Superblock {
	fn decode<D: Decoder>(d: &mut D) -> Result<Self, DecodeError> {
		Ok(Self {
			magic: u32::decode(d)?,
			bytes: u16::decode(d)?,
			flags: u16::decode(d)?,
			crc_seed: u32::decode(d)?,
			sum: u32::decode(d)?,
			rev: u32::decode(d)?,
			log_block_size: u32::decode(d)?,
			nsegments: u64::decode(d)?,
			dev_size: u64::decode(d)?,
			first_data_block: u64::decode(d)?,
			blocks_per_segment: u32::decode(d)?,
			reserved_segments_pct: u32::decode(d)?,
			last_cno: u64::decode(d)?,
			last_pseg: u64::decode(d)?,
			last_seq: u64::decode(d)?,
			free_blocks: u64::decode(d)?,
			ctime: u64::decode(d)?,
			mtime: u64::decode(d)?,
			feature_compat: u64::decode(d)?,
			feature_incompat: u64::decode(d)?,
		})
	}
}

impl Encode for Superblock {
	fn encode<E: Encoder>(&self, e: &mut E) -> Result<(), EncodeError> {
		self.magic.encode(e)?;
		self.bytes.encode(e)?;
		self.flags.encode(e)?;
		self.crc_seed.encode(e)?;
		self.sum.encode(e)?;
		self.rev.encode(e)?;
		self.log_block_size.encode(e)?;
		self.nsegments.encode(e)?;
		self.dev_size.encode(e)?;
		self.first_data_block.encode(e)?;
		self.blocks_per_segment.encode(e)?;
		self.reserved_segments_pct.encode(e)?;
		self.last_cno.encode(e)?;
		self.last_pseg.encode(e)?;
		self.last_seq.encode(e)?;
		self.free_blocks.encode(e)?;
		self.ctime.encode(e)?;
		self.mtime.encode(e)?;
		self.feature_compat.encode(e)?;
		self.feature_incompat.encode(e)
	}
}

/// Header of a partial segment (log). `sumsum` covers the summary area
/// starting right after the two checksum fields, seeded with the
/// superblock's `crc_seed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummaryHeader {
	pub datasum: u32,
	pub sumsum: u32,
	pub magic: u32,
	pub bytes: u16,
	pub flags: u16,
	pub seq: u64,
	pub created: u64,
	pub next: u64,
	pub nblocks: u32,
	pub nfinfo: u32,
	pub sumbytes: u32,
	pub pad: u32,
}

impl SummaryHeader {
	pub fn has(&self, flag: u16) -> bool {
		self.flags & flag != 0
	}
}

impl Decode for SummaryHeader {
	fn decode<D: Decoder>(d: &mut D) -> Result<Self, DecodeError> {
		Ok(Self {
			datasum: u32::decode(d)?,
			sumsum: u32::decode(d)?,
			magic: u32::decode(d)?,
			bytes: u16::decode(d)?,
			flags: u16::decode(d)?,
			seq: u64::decode(d)?,
			created: u64::decode(d)?,
			next: u64::decode(d)?,
			nblocks: u32::decode(d)?,
			nfinfo: u32::decode(d)?,
			sumbytes: u32::decode(d)?,
			pad: u32::decode(d)?,
		})
	}
}

impl Encode for SummaryHeader {
	fn encode<E: Encoder>(&self, e: &mut E) -> Result<(), EncodeError> {
		self.datasum.encode(e)?;
		self.sumsum.encode(e)?;
		self.magic.encode(e)?;
		self.bytes.encode(e)?;
		self.flags.encode(e)?;
		self.seq.encode(e)?;
		self.created.encode(e)?;
		self.next.encode(e)?;
		self.nblocks.encode(e)?;
		self.nfinfo.encode(e)?;
		self.sumbytes.encode(e)?;
		self.pad.encode(e)
	}
}

/// Per-file record in a summary: followed by `ndatblk` data block infos and
/// `nblocks - ndatblk` node block infos.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Finfo {
	pub ino: Ino,
	pub cno: Cno,
	pub nblocks: u32,
	pub ndatblk: u32,
}

impl Decode for Finfo {
	fn decode<D: Decoder>(d: &mut D) -> Result<Self, DecodeError> {
		Ok(Self {
			ino: u64::decode(d)?,
			cno: u64::decode(d)?,
			nblocks: u32::decode(d)?,
			ndatblk: u32::decode(d)?,
		})
	}
}

impl Encode for Finfo {
	fn encode<E: Encoder>(&self, e: &mut E) -> Result<(), EncodeError> {
		self.ino.encode(e)?;
		self.cno.encode(e)?;
		self.nblocks.encode(e)?;
		self.ndatblk.encode(e)
	}
}

/// Lifetime of a virtual block: the half-open interval of checkpoint
/// numbers during which the block was reachable.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Period {
	pub start: Cno,
	pub end: Cno,
}

/// Descriptor of a virtual (DAT-mapped) block found in a candidate segment.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Vdesc {
	pub ino: Ino,
	pub cno: Cno,
	pub vblocknr: Blocknr,
	pub period: Period,
	pub blocknr: Blocknr,
	pub offset: u64,
	pub flags: u32,
	pub pad: u32,
}

impl Vdesc {
	pub fn is_node(&self) -> bool {
		self.flags & VDESC_NODE != 0
	}
}

/// Query record for `get_vinfo`; the kernel fills `start` and `end`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Vinfo {
	pub vblocknr: Blocknr,
	pub start: Cno,
	pub end: Cno,
}

/// Descriptor of a DAT metafile block. The kernel fills `blocknr` with the
/// block's current disk address; the block is live iff it still equals
/// `oblocknr`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Bdesc {
	pub ino: Ino,
	pub oblocknr: Blocknr,
	pub blocknr: Blocknr,
	pub offset: u64,
	pub level: u32,
	pub pad: u32,
}

/// Segment usage returned by `get_suinfo`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Suinfo {
	pub lastmod: u64,
	pub nblocks: u32,
	pub flags: u32,
}

impl Suinfo {
	pub fn is_dirty(&self) -> bool {
		self.flags & SUINFO_DIRTY != 0
	}

	pub fn is_active(&self) -> bool {
		self.flags & SUINFO_ACTIVE != 0
	}

	pub fn is_error(&self) -> bool {
		self.flags & SUINFO_ERROR != 0
	}

	pub fn is_reclaimable(&self) -> bool {
		self.is_dirty() && !self.is_active() && !self.is_error()
	}
}

/// Update record for the optional `set_suinfo` request. `flags` selects
/// which fields of `suinfo` the kernel applies.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct SuinfoUpdate {
	pub segnum: Segnum,
	pub flags: u32,
	pub pad: u32,
	pub suinfo: Suinfo,
}

/// Segment usage statistics returned by `get_sustat`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct Sustat {
	pub nsegs: u64,
	pub ncleansegs: u64,
	pub ndirtysegs: u64,
	pub ctime: u64,
	pub nongc_ctime: u64,
	pub prot_seq: u64,
}

/// Checkpoint summary returned by `get_cpstat`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct Cpstat {
	pub cno: Cno,
	pub ncheckpoints: u64,
	pub nsnapshots: u64,
}

/// Checkpoint record returned by `get_cpinfo`. In snapshot mode `next`
/// chains to the following snapshot.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct Cpinfo {
	pub cno: Cno,
	pub create: u64,
	pub flags: u64,
	pub next: Cno,
}

impl Cpinfo {
	pub fn is_snapshot(&self) -> bool {
		self.flags & CP_SNAPSHOT != 0
	}
}

/// Argument of `change_cpmode`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct CpMode {
	pub cno: Cno,
	pub mode: u32,
	pub pad: u32,
}

#[cfg(test)]
mod t {
	use super::*;

	#[test]
	fn sequence_ordering() {
		assert!(cnt64_gt(2, 1));
		assert!(!cnt64_gt(1, 2));
		assert!(cnt64_ge(7, 7));
		assert!(cnt64_lt(1, 2));
		assert!(cnt64_le(7, 7));
	}

	#[test]
	fn sequence_ordering_wraps() {
		let a = u64::MAX - 2;
		let b = 3u64; // 6 increments later, across the wrap
		assert!(cnt64_gt(b, a));
		assert!(cnt64_lt(a, b));
		assert!(!cnt64_ge(a, b));
	}

	#[test]
	fn superblock_roundtrip() {
		let sb = Superblock {
			magic: SB_MAGIC,
			bytes: SB_BYTES,
			flags: 0,
			crc_seed: 0xdead_beef,
			sum: 0,
			rev: 1,
			log_block_size: 2,
			nsegments: 64,
			dev_size: 64 << 20,
			first_data_block: 1,
			blocks_per_segment: 256,
			reserved_segments_pct: 5,
			last_cno: 10,
			last_pseg: 512,
			last_seq: 33,
			free_blocks: 1000,
			ctime: 0,
			mtime: 0,
			feature_compat: 0,
			feature_incompat: 0,
		};
		let bytes = crate::decoder::to_bytes(&sb).unwrap();
		assert_eq!(bytes.len(), SB_BYTES as usize);
		let back: Superblock = crate::decoder::from_bytes(&bytes).unwrap();
		assert_eq!(back, sb);
		assert_eq!(back.block_size(), 4096);
		assert_eq!(back.segment_size(), 4096 * 256);
	}

	#[test]
	fn summary_header_size() {
		let hdr = SummaryHeader {
			datasum: 0,
			sumsum: 0,
			magic: SUMMARY_MAGIC,
			bytes: SUMMARY_HEADER_SIZE as u16,
			flags: SS_LOGBGN | SS_LOGEND,
			seq: 1,
			created: 0,
			next: 0,
			nblocks: 1,
			nfinfo: 0,
			sumbytes: SUMMARY_HEADER_SIZE as u32,
			pad: 0,
		};
		let bytes = crate::decoder::to_bytes(&hdr).unwrap();
		assert_eq!(bytes.len(), SUMMARY_HEADER_SIZE);
	}
}

mod buffer;
mod data;
mod decoder;
mod fs;
mod gc;
mod ioctl;
mod liveness;
mod mount;
mod segment;

pub mod cleaner;

/// (INTERNAL) Constructs an [`std::io::Error`] from an `errno`.
#[macro_export]
macro_rules! err {
	($name:ident) => {
		std::io::Error::from_raw_os_error(libc::$name)
	};
}

macro_rules! iobail {
	($kind:expr, $($tk:tt)+) => {
		return Err(std::io::Error::new($kind, format!($($tk)+)))
	};
}

pub(crate) use iobail;

pub use crate::{
	buffer::RecordVec,
	data::{
		cnt64_ge, cnt64_gt, cnt64_le, cnt64_lt, Bdesc, Blocknr, Cno, Cpinfo, Cpstat, Finfo, Ino,
		Period, Segnum, Suinfo, SuinfoUpdate, SummaryHeader, Superblock, Sustat, Vdesc, Vinfo,
		CNO_MAX, CNO_MIN, CPFILE_INO, CP_MODE_CHECKPOINT, CP_MODE_SNAPSHOT, CP_SNAPSHOT, DAT_INO,
		FIRST_USER_INO, SUFILE_INO, SUINFO_ACTIVE, SUINFO_DIRTY, SUINFO_ERROR,
	},
	fs::{sb2_offset, CleanerGuard, Geometry, Rlfs, SegmentData, OPEN_GCLK, OPEN_RAW, REQUEST_BATCH},
	gc::{
		reclaim_segments, GcParams, GcStat, RECLAIM_PARAM_ALL, RECLAIM_PARAM_MIN_RECLAIMABLE_BLKS,
		RECLAIM_PARAM_PROTCNO, RECLAIM_PARAM_PROTSEQ,
	},
	liveness::{coalesce_periods, vdesc_is_live},
	mount::{device_id, find_mount, DeviceId, MountEntry, FS_TYPE},
	segment::{Binfo, BlockInfo, FileRecord, PartialSegment, Segment, SummaryError},
};

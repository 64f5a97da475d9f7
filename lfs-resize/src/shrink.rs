use std::{
	io::{ErrorKind, Result as IoResult},
	thread::sleep,
	time::Duration,
};

use rlfs::{
	reclaim_segments, sb2_offset, GcParams, GcStat, RecordVec, Rlfs, Segnum, Suinfo, CNO_MAX,
	RECLAIM_PARAM_PROTCNO, RECLAIM_PARAM_PROTSEQ, REQUEST_BATCH,
};

use crate::progress::ProgressBar;

/// Floor of the reserve kept after a shrink, independent of size.
const MIN_RESERVED_SEGMENTS: u64 = 8;
/// Segments evacuated per cleaning pass.
const SEGMENTS_PER_PASS: usize = 4;
/// Attempts to wait out an active segment in the doomed range.
const ACTIVE_RETRIES: u32 = 6;
/// Attempts at the final resize transaction when the kernel reports busy.
const RESIZE_RETRIES: u32 = 4;

macro_rules! iobail {
	($kind:expr, $($tk:tt)+) => {
		return Err(std::io::Error::new($kind, format!($($tk)+)))
	};
}

/// Number of segments a device of `newsize` bytes can hold; the tail block
/// holding the secondary superblock is excluded.
pub fn nsegs_for_size(fs: &Rlfs, newsize: u64) -> u64 {
	sb2_offset(newsize) / fs.geometry().segment_size()
}

/// Segments that must stay clean after shrinking to `new_nsegs`.
pub fn reserved_segments(fs: &Rlfs, new_nsegs: u64) -> u64 {
	let pct = fs.superblock().reserved_segments_pct.max(1) as u64;
	MIN_RESERVED_SEGMENTS.max((new_nsegs * pct).div_ceil(100))
}

/// Resizes the file system online. Growing is a single kernel transaction;
/// shrinking first evacuates every live block from the doomed segment range
/// `[new_nsegs, nsegs)`.
pub fn resize(fs: &Rlfs, newsize: u64) -> IoResult<()> {
	let new_nsegs = nsegs_for_size(fs, newsize);
	let sustat = fs.get_sustat()?;

	if new_nsegs >= sustat.nsegs {
		let _lock = fs.lock_cleaner()?;
		fs.resize(newsize)?;
		return Ok(());
	}

	let doomed = sustat.nsegs - new_nsegs;
	let reserved = reserved_segments(fs, new_nsegs);
	if sustat.ncleansegs < doomed + reserved {
		iobail!(
			ErrorKind::Other,
			"not enough free space: {} clean segments, need {}",
			sustat.ncleansegs,
			doomed + reserved
		);
	}

	// Keep the allocator away from the doomed range while we drain it, and
	// put the range back whatever happens.
	fs.set_alloc_range(0, newsize)?;
	let res = shrink(fs, newsize, new_nsegs);
	let final_size = if res.is_ok() {
		newsize
	} else {
		fs.superblock().dev_size
	};
	if let Err(e) = fs.set_alloc_range(0, final_size) {
		log::warn!("cannot restore the allocation range: {e}");
	}
	res
}

fn shrink(fs: &Rlfs, newsize: u64, new_nsegs: u64) -> IoResult<()> {
	for attempt in 0..RESIZE_RETRIES {
		evacuate(fs, new_nsegs)?;

		let lock = fs.lock_cleaner()?;
		match fs.resize(newsize) {
			Ok(()) => return Ok(()),
			Err(e) if e.raw_os_error() == Some(libc::EBUSY) => {
				drop(lock);
				log::info!(
					"resize transaction busy (attempt {}/{RESIZE_RETRIES}), re-evacuating",
					attempt + 1
				);
				sleep(Duration::from_millis(500));
			}
			Err(e) => return Err(e),
		}
	}
	iobail!(ErrorKind::Other, "the file system stayed busy; segments may have been written behind us")
}

#[derive(Default)]
struct DoomedScan {
	active: u64,
	in_use: u64,
	reclaimable: RecordVec<Segnum>,
}

fn scan_doomed(fs: &Rlfs, new_nsegs: u64, nsegs: u64, limit: usize) -> IoResult<DoomedScan> {
	let mut scan = DoomedScan::default();
	let mut buf = vec![Suinfo::default(); REQUEST_BATCH];
	let mut segnum = new_nsegs;

	while segnum < nsegs {
		let want = ((nsegs - segnum) as usize).min(buf.len());
		let n = fs.get_suinfo(segnum, &mut buf[..want])?;
		if n == 0 {
			break;
		}
		for (i, si) in buf[..n].iter().enumerate() {
			if si.is_active() {
				scan.active += 1;
			}
			if si.is_dirty() {
				scan.in_use += 1;
			}
			if si.is_reclaimable() && scan.reclaimable.len() < limit {
				scan.reclaimable.push(segnum + i as u64);
			}
		}
		segnum += n as u64;
	}
	Ok(scan)
}

fn migrate(fs: &Rlfs, segnums: &mut RecordVec<Segnum>) -> IoResult<GcStat> {
	let sustat = fs.get_sustat()?;
	let params = GcParams {
		flags: RECLAIM_PARAM_PROTSEQ | RECLAIM_PARAM_PROTCNO,
		protseq: sustat.prot_seq,
		// No time-based protection during a shrink: live blocks are moved,
		// not dropped, so only the log cursor limits what can go.
		protcno: CNO_MAX,
		min_reclaimable_blks: 0,
		dryrun: false,
	};
	reclaim_segments(fs, segnums, &params)
}

/// Nudges the log cursor forward: relocate a couple of movable segments
/// near the doomed boundary, then force a super-root through freeze/thaw so
/// segments whose only problem was cursor protection become reclaimable.
fn coax_log_cursor(fs: &Rlfs, new_nsegs: u64, nsegs: u64) -> IoResult<()> {
	let lead = new_nsegs.saturating_sub(2);
	let mut scan = scan_doomed(fs, lead, nsegs, 2)?;
	if !scan.reclaimable.is_empty() {
		if let Err(e) = migrate(fs, &mut scan.reclaimable) {
			log::debug!("cursor-coax migration failed: {e}");
		}
	}
	fs.sync()?;
	fs.freeze()?;
	fs.thaw()?;
	Ok(())
}

/// Drains the doomed range: waits out active segments, then migrates the
/// in-use ones batch by batch.
fn evacuate(fs: &Rlfs, new_nsegs: u64) -> IoResult<()> {
	let sustat = fs.get_sustat()?;
	let nsegs = sustat.nsegs;

	let initial = scan_doomed(fs, new_nsegs, nsegs, usize::MAX)?;
	if initial.in_use == 0 && initial.active == 0 {
		return Ok(());
	}
	let mut bar = ProgressBar::new("evacuating segments", initial.in_use);
	bar.update(0);

	let mut retries = 0;
	while scan_doomed(fs, new_nsegs, nsegs, 0)?.active > 0 {
		if retries >= ACTIVE_RETRIES {
			bar.finish();
			iobail!(
				ErrorKind::Other,
				"active segments remain beyond the new device boundary"
			);
		}
		retries += 1;
		// Give the log writer somewhere else to go, then wait a moment.
		let mut scan = scan_doomed(fs, new_nsegs, nsegs, SEGMENTS_PER_PASS)?;
		if !scan.reclaimable.is_empty() {
			let _ = migrate(fs, &mut scan.reclaimable);
		}
		sleep(Duration::from_millis(500));
	}

	let mut stuck = 0;
	loop {
		let scan = scan_doomed(fs, new_nsegs, nsegs, SEGMENTS_PER_PASS)?;
		if scan.in_use == 0 {
			break;
		}
		bar.update(initial.in_use.saturating_sub(scan.in_use));

		let mut victims = scan.reclaimable;
		if victims.is_empty() {
			// Dirty but not reclaimable: only the log cursor stands in the
			// way. Push it forward and rescan.
			bar.interrupt();
			coax_log_cursor(fs, new_nsegs, nsegs)?;
			stuck += 1;
			if stuck > ACTIVE_RETRIES {
				bar.finish();
				iobail!(
					ErrorKind::Other,
					"segments beyond the new boundary stay protected"
				);
			}
			continue;
		}

		let stat = migrate(fs, &mut victims)?;
		if stat.cleaned_segs == 0 && stat.protected_segs > 0 {
			bar.interrupt();
			coax_log_cursor(fs, new_nsegs, nsegs)?;
			stuck += 1;
			if stuck > ACTIVE_RETRIES {
				bar.finish();
				iobail!(
					ErrorKind::Other,
					"segments beyond the new boundary stay protected"
				);
			}
		} else {
			stuck = 0;
		}
	}

	bar.update(initial.in_use);
	bar.finish();
	Ok(())
}

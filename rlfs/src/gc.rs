use std::{
	io::Result as IoResult,
	time::{SystemTime, UNIX_EPOCH},
};

use nix::sys::signal::{SigSet, Signal};

use crate::{
	buffer::RecordVec,
	data::*,
	err,
	fs::{ioerr, Rlfs},
	liveness,
};

pub const RECLAIM_PARAM_PROTSEQ: u32 = 0x01;
pub const RECLAIM_PARAM_PROTCNO: u32 = 0x02;
pub const RECLAIM_PARAM_MIN_RECLAIMABLE_BLKS: u32 = 0x04;
pub const RECLAIM_PARAM_ALL: u32 = 0x07;

/// Parameters of one reclamation pass. `flags` marks which optional fields
/// are meaningful; `protseq` is mandatory.
#[derive(Debug, Clone, Copy)]
pub struct GcParams {
	pub flags: u32,
	/// Smallest log sequence number the kernel still needs for recovery.
	pub protseq: u64,
	/// Smallest checkpoint inside the time-protection window.
	pub protcno: Cno,
	/// Per-segment threshold activating the metadata-only deferral.
	pub min_reclaimable_blks: u64,
	/// Analyse only; do not submit the transaction.
	pub dryrun: bool,
}

impl Default for GcParams {
	fn default() -> Self {
		Self {
			flags: RECLAIM_PARAM_PROTSEQ,
			protseq: 0,
			protcno: CNO_MAX,
			min_reclaimable_blks: 0,
			dryrun: false,
		}
	}
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GcStat {
	pub cleaned_segs: usize,
	pub protected_segs: usize,
	pub deferred_segs: usize,
	pub live_vblks: usize,
	pub defunct_vblks: usize,
	pub freed_vblks: usize,
	pub live_pblks: usize,
	pub defunct_pblks: usize,
}

fn validate_params(params: &GcParams) -> IoResult<()> {
	if params.flags & !RECLAIM_PARAM_ALL != 0 {
		return Err(err!(EINVAL));
	}
	if params.flags & RECLAIM_PARAM_PROTSEQ == 0 {
		return Err(err!(EINVAL));
	}
	Ok(())
}

/// Keeps SIGINT/SIGTERM blocked for the duration of a pass so the
/// transaction is never torn; the previous mask is restored on drop.
struct BlockedSignals {
	set: SigSet,
}

impl BlockedSignals {
	fn new() -> IoResult<Self> {
		let mut set = SigSet::empty();
		set.add(Signal::SIGINT);
		set.add(Signal::SIGTERM);
		set.thread_block().map_err(ioerr)?;
		Ok(Self {
			set,
		})
	}

	fn pending(&self) -> bool {
		unsafe {
			let mut pending: libc::sigset_t = std::mem::zeroed();
			if libc::sigpending(&mut pending) != 0 {
				return false;
			}
			libc::sigismember(&pending, libc::SIGINT) == 1
				|| libc::sigismember(&pending, libc::SIGTERM) == 1
		}
	}
}

impl Drop for BlockedSignals {
	fn drop(&mut self) {
		if let Err(e) = self.set.thread_unblock() {
			log::warn!("failed to restore the signal mask: {e}");
		}
	}
}

fn unixtime() -> u64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map(|d| d.as_secs())
		.unwrap_or(0)
}

/// Runs one reclamation pass over `segnums` under the cleaner lock:
/// inventory the candidates, resolve liveness, then either defer via a
/// metadata-only usage update or submit the atomic `clean_segments`
/// transaction. Candidates that drop out are removed from `segnums`.
pub fn reclaim_segments(
	fs: &Rlfs,
	segnums: &mut RecordVec<Segnum>,
	params: &GcParams,
) -> IoResult<GcStat> {
	validate_params(params)?;

	let mut stat = GcStat::default();
	if segnums.is_empty() {
		return Ok(stat);
	}

	let _lock = fs.lock_cleaner()?;
	let signals = BlockedSignals::new()?;

	let mut acc = liveness::acc_blocks(fs, segnums, params.protseq)?;
	stat.protected_segs = acc.protected_segs;
	if segnums.is_empty() {
		return Ok(stat);
	}

	liveness::fill_vinfo(fs, &mut acc.vdescs)?;
	let snapshots = liveness::snapshot_list(fs)?;

	let protcno = if params.flags & RECLAIM_PARAM_PROTCNO != 0 {
		params.protcno
	} else {
		CNO_MAX
	};

	let mut periods = RecordVec::new();
	let mut vblocknrs = RecordVec::new();
	liveness::toss_vdescs(&mut acc.vdescs, protcno, &snapshots, &mut periods, &mut vblocknrs);
	liveness::coalesce_periods(&mut periods);
	stat.defunct_pblks = liveness::toss_bdescs(fs, &mut acc.bdescs)?;

	stat.live_vblks = acc.vdescs.len();
	stat.defunct_vblks = vblocknrs.len();
	stat.live_pblks = acc.bdescs.len();

	if params.dryrun {
		return Ok(stat);
	}

	if signals.pending() {
		log::info!("interrupted, skipping the clean-segments transaction");
		return Err(err!(EINTR));
	}

	if params.flags & RECLAIM_PARAM_MIN_RECLAIMABLE_BLKS != 0
		&& params.min_reclaimable_blks > 0
		&& fs.opt_set_suinfo()
	{
		let reclaimable = (vblocknrs.len() + stat.defunct_pblks) as u64;
		if reclaimable < params.min_reclaimable_blks * segnums.len() as u64 {
			let now = unixtime();
			let updates: Vec<SuinfoUpdate> = segnums
				.iter()
				.map(|&segnum| SuinfoUpdate {
					segnum,
					flags: SUINFO_UPDATE_LASTMOD,
					pad: 0,
					suinfo: Suinfo {
						lastmod: now,
						nblocks: 0,
						flags: 0,
					},
				})
				.collect();
			match fs.set_suinfo(&updates) {
				Ok(()) => {
					log::debug!(
						"deferred {} segments with only {reclaimable} reclaimable blocks",
						segnums.len()
					);
					stat.deferred_segs = segnums.len();
					return Ok(stat);
				}
				Err(e) if e.raw_os_error() == Some(libc::ENOTTY) => {
					log::warn!("kernel does not support set_suinfo; deferral disabled");
				}
				Err(e) => return Err(e),
			}
		}
	}

	acc.vdescs.sort_unstable_by_key(|v| v.blocknr);
	fs.clean_segments(&acc.vdescs, &periods, &vblocknrs, &acc.bdescs, segnums)?;

	stat.cleaned_segs = segnums.len();
	stat.freed_vblks = vblocknrs.len();
	log::info!(
		"cleaned {} segments: {} live, {} freed virtual blocks",
		stat.cleaned_segs,
		stat.live_vblks,
		stat.freed_vblks
	);
	Ok(stat)
}

#[cfg(test)]
mod t {
	use super::*;

	#[test]
	fn protseq_is_mandatory() {
		let params = GcParams {
			flags: RECLAIM_PARAM_PROTCNO,
			..GcParams::default()
		};
		let e = validate_params(&params).unwrap_err();
		assert_eq!(e.raw_os_error(), Some(libc::EINVAL));
	}

	#[test]
	fn unknown_param_bits_rejected() {
		let params = GcParams {
			flags: RECLAIM_PARAM_ALL | 0x80,
			..GcParams::default()
		};
		assert!(validate_params(&params).is_err());
	}

	#[test]
	fn default_params_validate() {
		assert!(validate_params(&GcParams::default()).is_ok());
	}
}

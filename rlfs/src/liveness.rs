use std::io::{ErrorKind, Result as IoResult};

use crate::{
	buffer::RecordVec,
	data::*,
	fs::{Rlfs, REQUEST_BATCH},
	iobail,
	segment::Binfo,
};

/// Block inventory of the surviving candidate segments.
#[derive(Default)]
pub struct AccResult {
	pub vdescs: RecordVec<Vdesc>,
	pub bdescs: RecordVec<Bdesc>,
	/// Candidates dropped because their sequence number is still inside
	/// the protected suffix of the log.
	pub protected_segs: usize,
}

/// Walks the candidate segments and collects a descriptor per block:
/// `bdesc` for DAT blocks, `vdesc` for everything else. Candidates that
/// turn out to be unreclaimable, protected by the log cursor, or corrupted
/// are removed from `segnums` in place (swap-with-last, so the list stays
/// contiguous).
pub fn acc_blocks(
	fs: &Rlfs,
	segnums: &mut RecordVec<Segnum>,
	prot_seq: u64,
) -> IoResult<AccResult> {
	let mut acc = AccResult::default();
	let mut i = 0;

	'candidates: while i < segnums.len() {
		let segnum = segnums[i];
		let mut si = [Suinfo::default()];
		if fs.get_suinfo(segnum, &mut si)? < 1 || !si[0].is_reclaimable() {
			log::debug!("segment {segnum}: not reclaimable, skipped");
			segnums.swap_remove(i);
			continue;
		}

		let data = fs.read_segment(segnum)?;
		let seg = fs.segment(segnum, &data);
		let mut psegs = seg.partial_segments();
		let Some(first) = psegs.next() else {
			if let Some(e) = psegs.error() {
				log::warn!("segment {segnum}: {e}, skipped");
			}
			segnums.swap_remove(i);
			continue;
		};
		if cnt64_ge(first.header.seq, prot_seq) {
			log::debug!(
				"segment {segnum}: seq {} within protected suffix (prot_seq {prot_seq})",
				first.header.seq
			);
			acc.protected_segs += 1;
			segnums.swap_remove(i);
			continue;
		}

		// Descriptors of a corrupt segment must not reach the transaction,
		// so remember the high-water marks and roll back on error.
		let nv = acc.vdescs.len();
		let nb = acc.bdescs.len();

		for pseg in std::iter::once(first).chain(psegs.by_ref()) {
			let mut files = pseg.files();
			for file in files.by_ref() {
				let mut blocks = file.blocks();
				for b in blocks.by_ref() {
					match b.binfo {
						Binfo::DatData { blkoff } => {
							acc.bdescs.push(Bdesc {
								ino: file.finfo.ino,
								oblocknr: b.blocknr,
								blocknr: 0,
								offset: blkoff,
								level: 0,
								pad: 0,
							});
						}
						Binfo::DatNode { blkoff, level } => {
							acc.bdescs.push(Bdesc {
								ino: file.finfo.ino,
								oblocknr: b.blocknr,
								blocknr: 0,
								offset: blkoff,
								level: level as u32,
								pad: 0,
							});
						}
						Binfo::Data { vblocknr, blkoff } => {
							acc.vdescs.push(Vdesc {
								ino: file.finfo.ino,
								cno: file.finfo.cno,
								vblocknr,
								period: Period::default(),
								blocknr: b.blocknr,
								offset: blkoff,
								flags: 0,
								pad: 0,
							});
						}
						Binfo::Node { vblocknr } => {
							acc.vdescs.push(Vdesc {
								ino: file.finfo.ino,
								cno: file.finfo.cno,
								vblocknr,
								period: Period::default(),
								blocknr: b.blocknr,
								offset: 0,
								flags: VDESC_NODE,
								pad: 0,
							});
						}
					}
				}
				if let Some(e) = blocks.error() {
					log::warn!("segment {segnum}: {e}, skipped");
					acc.vdescs.truncate(nv);
					acc.bdescs.truncate(nb);
					segnums.swap_remove(i);
					continue 'candidates;
				}
			}
			if let Some(e) = files.error() {
				log::warn!("segment {segnum}: {e}, skipped");
				acc.vdescs.truncate(nv);
				acc.bdescs.truncate(nb);
				segnums.swap_remove(i);
				continue 'candidates;
			}
		}
		if let Some(e) = psegs.error() {
			log::warn!("segment {segnum}: {e}, skipped");
			acc.vdescs.truncate(nv);
			acc.bdescs.truncate(nb);
			segnums.swap_remove(i);
			continue;
		}

		i += 1;
	}
	Ok(acc)
}

/// Resolves the lifetime of every collected virtual block. Sorts by
/// `vblocknr` and queries in batches; the kernel preserves order, so
/// replies match positionally.
pub fn fill_vinfo(fs: &Rlfs, vdescs: &mut RecordVec<Vdesc>) -> IoResult<()> {
	vdescs.sort_unstable_by_key(|v| v.vblocknr);
	for chunk in vdescs.chunks_mut(REQUEST_BATCH) {
		let mut query: Vec<Vinfo> = chunk
			.iter()
			.map(|v| Vinfo {
				vblocknr: v.vblocknr,
				start: 0,
				end: 0,
			})
			.collect();
		let n = fs.get_vinfo(&mut query)?;
		if n != query.len() {
			iobail!(ErrorKind::InvalidData, "short get_vinfo reply: {n}/{}", query.len());
		}
		for (v, vi) in chunk.iter_mut().zip(&query) {
			v.period.start = vi.start;
			v.period.end = vi.end;
		}
	}
	Ok(())
}

/// Retrieves the full, strictly increasing list of snapshot checkpoint
/// numbers by following the snapshot chain.
pub fn snapshot_list(fs: &Rlfs) -> IoResult<Vec<Cno>> {
	let cpstat = fs.get_cpstat()?;
	let mut snapshots: Vec<Cno> = Vec::new();
	let mut buf = vec![Cpinfo::default(); REQUEST_BATCH];
	let mut cno = 0;

	loop {
		let n = fs.get_cpinfo(cno, CP_MODE_SNAPSHOT, &mut buf)?;
		if n == 0 {
			break;
		}
		for ci in &buf[..n] {
			if snapshots.last().is_some_and(|&last| ci.cno <= last) {
				iobail!(
					ErrorKind::InvalidData,
					"snapshot list is not strictly increasing at cno {}",
					ci.cno
				);
			}
			snapshots.push(ci.cno);
		}
		let last = buf[n - 1];
		if n < buf.len() || last.next == 0 {
			break;
		}
		cno = last.next;
	}

	if snapshots.len() as u64 != cpstat.nsnapshots {
		log::warn!(
			"snapshot count mismatch: listed {} but cpstat reports {}",
			snapshots.len(),
			cpstat.nsnapshots
		);
	}
	Ok(snapshots)
}

/// Decides whether one virtual block is still reachable.
///
/// A block is reachable if its lifetime is still open, overlaps the
/// time-protection window ending at `protcno`, or contains a snapshot.
/// `last_hit` caches the last snapshot found so runs of blocks from the
/// same era skip the binary search.
pub fn vdesc_is_live(vdesc: &Vdesc, protcno: Cno, snapshots: &[Cno], last_hit: &mut Cno) -> bool {
	if vdesc.cno == 0 {
		// Metafile blocks carry no checkpoint; only the current version is
		// reachable.
		return vdesc.period.end == CNO_MAX;
	}
	if vdesc.period.end == vdesc.cno {
		// Written and superseded within the same checkpoint.
		return false;
	}
	if vdesc.period.end == CNO_MAX || vdesc.period.end > protcno {
		return true;
	}
	if snapshots.is_empty()
		|| vdesc.period.start > *snapshots.last().unwrap()
		|| vdesc.period.end <= snapshots[0]
	{
		return false;
	}
	if *last_hit >= vdesc.period.start && *last_hit < vdesc.period.end {
		return true;
	}
	let i = snapshots.partition_point(|&s| s < vdesc.period.start);
	if i < snapshots.len() && snapshots[i] < vdesc.period.end {
		*last_hit = snapshots[i];
		true
	} else {
		false
	}
}

/// Partitions the vdescs into live ones (kept, to be moved by the kernel)
/// and dead ones, whose `vblocknr`s go to the free list and whose periods
/// (for non-metafile blocks) go to the checkpoint-deletion list.
///
/// Expects `vdescs` sorted by `vblocknr`. The same virtual block may have
/// been copied into several candidate segments by earlier collections;
/// such duplicates share one DAT lifetime and are processed once.
pub fn toss_vdescs(
	vdescs: &mut RecordVec<Vdesc>,
	protcno: Cno,
	snapshots: &[Cno],
	periods: &mut RecordVec<Period>,
	vblocknrs: &mut RecordVec<Blocknr>,
) {
	let mut last_hit: Cno = 0;
	let mut prev: Option<Blocknr> = None;
	let mut keep = 0;

	for i in 0..vdescs.len() {
		let v = vdescs[i];
		if prev == Some(v.vblocknr) {
			continue;
		}
		prev = Some(v.vblocknr);

		if vdesc_is_live(&v, protcno, snapshots, &mut last_hit) {
			vdescs[keep] = v;
			keep += 1;
		} else {
			vblocknrs.push(v.vblocknr);
			if v.cno != 0 {
				periods.push(v.period);
			}
		}
	}
	vdescs.truncate(keep);
}

/// Folds the delete periods into a minimal sorted disjoint cover.
pub fn coalesce_periods(periods: &mut RecordVec<Period>) {
	if periods.is_empty() {
		return;
	}
	periods.sort_unstable_by_key(|p| (p.start, p.end));
	let mut w = 0;
	for i in 1..periods.len() {
		let p = periods[i];
		if p.start <= periods[w].end {
			if p.end > periods[w].end {
				periods[w].end = p.end;
			}
		} else {
			w += 1;
			periods[w] = p;
		}
	}
	periods.truncate(w + 1);
}

/// Resolves DAT block liveness: a block is live iff the kernel still maps
/// it where the segment saw it. Dead entries are dropped; returns how many.
pub fn toss_bdescs(fs: &Rlfs, bdescs: &mut RecordVec<Bdesc>) -> IoResult<usize> {
	bdescs.sort_unstable_by_key(|b| (b.ino, b.level, b.offset));
	for chunk in bdescs.chunks_mut(REQUEST_BATCH) {
		let len = chunk.len();
		let n = fs.get_bdescs(chunk)?;
		if n != len {
			iobail!(ErrorKind::InvalidData, "short get_bdescs reply: {n}/{len}");
		}
	}
	let before = bdescs.len();
	bdescs.retain(|b| b.blocknr == b.oblocknr);
	Ok(before - bdescs.len())
}

#[cfg(test)]
mod t {
	use super::*;

	fn vdesc(cno: Cno, vblocknr: Blocknr, start: Cno, end: Cno) -> Vdesc {
		Vdesc {
			ino: 20,
			cno,
			vblocknr,
			period: Period {
				start,
				end,
			},
			blocknr: 0,
			offset: 0,
			flags: 0,
			pad: 0,
		}
	}

	mod predicate {
		use super::*;

		#[test]
		fn metafile_blocks_live_iff_open() {
			let mut hit = 0;
			assert!(vdesc_is_live(&vdesc(0, 1, 0, CNO_MAX), 10, &[], &mut hit));
			assert!(!vdesc_is_live(&vdesc(0, 1, 0, 7), 10, &[], &mut hit));
		}

		#[test]
		fn same_checkpoint_rewrite_is_dead() {
			let mut hit = 0;
			// Even a snapshot inside the period does not save it.
			assert!(!vdesc_is_live(&vdesc(5, 1, 3, 5), 2, &[4], &mut hit));
		}

		#[test]
		fn open_or_recent_periods_are_live() {
			let mut hit = 0;
			assert!(vdesc_is_live(&vdesc(5, 1, 5, CNO_MAX), 10, &[], &mut hit));
			assert!(vdesc_is_live(&vdesc(5, 1, 5, 12), 10, &[], &mut hit));
		}

		#[test]
		fn old_period_without_snapshot_is_dead() {
			let mut hit = 0;
			assert!(!vdesc_is_live(&vdesc(5, 1, 5, 8), 10, &[], &mut hit));
			// All snapshots outside the period.
			assert!(!vdesc_is_live(&vdesc(5, 1, 5, 8), 10, &[2, 3, 9], &mut hit));
		}

		#[test]
		fn snapshot_inside_period_protects() {
			let mut hit = 0;
			assert!(vdesc_is_live(&vdesc(5, 1, 5, 8), 10, &[2, 6, 20], &mut hit));
			assert_eq!(hit, 6);
		}

		#[test]
		fn last_hit_cache_short_circuits() {
			let mut hit = 6;
			// 6 lies inside [5, 8): no search needed, cache untouched.
			assert!(vdesc_is_live(&vdesc(5, 1, 5, 8), 10, &[9], &mut hit));
			assert_eq!(hit, 6);
		}

		#[test]
		fn boundary_snapshots_do_not_protect() {
			let mut hit = 0;
			// period is half-open: a snapshot at end does not count.
			assert!(!vdesc_is_live(&vdesc(5, 1, 5, 8), 10, &[8], &mut hit));
			// ...but one at start does.
			assert!(vdesc_is_live(&vdesc(5, 1, 5, 8), 10, &[5], &mut hit));
		}
	}

	mod toss {
		use super::*;

		#[test]
		fn partitions_live_and_dead() {
			let mut vdescs = RecordVec::new();
			vdescs.push(vdesc(5, 1, 5, 7)); // dead: old, no snapshot
			vdescs.push(vdesc(5, 2, 5, CNO_MAX)); // live
			vdescs.push(vdesc(0, 3, 0, 9)); // dead metafile: no period entry
			let mut periods = RecordVec::new();
			let mut vblocknrs = RecordVec::new();

			toss_vdescs(&mut vdescs, 10, &[], &mut periods, &mut vblocknrs);

			assert_eq!(vdescs.len(), 1);
			assert_eq!(vdescs[0].vblocknr, 2);
			assert_eq!(&vblocknrs[..], &[1, 3]);
			assert_eq!(
				&periods[..],
				&[Period {
					start: 5,
					end: 7
				}]
			);
		}

		#[test]
		fn duplicate_virtual_blocks_processed_once() {
			let mut vdescs = RecordVec::new();
			vdescs.push(vdesc(5, 1, 5, 7));
			vdescs.push(vdesc(5, 1, 5, 7));
			let mut periods = RecordVec::new();
			let mut vblocknrs = RecordVec::new();

			toss_vdescs(&mut vdescs, 10, &[], &mut periods, &mut vblocknrs);

			assert!(vdescs.is_empty());
			assert_eq!(&vblocknrs[..], &[1]);
			assert_eq!(periods.len(), 1);
		}
	}

	mod periods {
		use super::*;

		fn p(start: Cno, end: Cno) -> Period {
			Period {
				start,
				end,
			}
		}

		#[test]
		fn overlapping_and_touching_periods_fold() {
			let mut v = RecordVec::new();
			v.extend([p(10, 12), p(1, 3), p(2, 5), p(5, 7), p(20, 21)]);
			coalesce_periods(&mut v);
			assert_eq!(&v[..], &[p(1, 7), p(10, 12), p(20, 21)]);
		}

		#[test]
		fn contained_periods_disappear() {
			let mut v = RecordVec::new();
			v.extend([p(1, 10), p(2, 3), p(4, 9)]);
			coalesce_periods(&mut v);
			assert_eq!(&v[..], &[p(1, 10)]);
		}

		#[test]
		fn disjoint_cover_is_preserved() {
			let mut v = RecordVec::new();
			v.extend([p(5, 6), p(1, 2), p(9, 12)]);
			coalesce_periods(&mut v);
			assert_eq!(&v[..], &[p(1, 2), p(5, 6), p(9, 12)]);
		}
	}
}

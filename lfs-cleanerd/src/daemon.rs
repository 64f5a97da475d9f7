use std::{
	collections::VecDeque,
	io::Result as IoResult,
	path::{Path, PathBuf},
	sync::atomic::{AtomicBool, Ordering},
	time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use rlfs::{
	cleaner::msg::{
		CleanerState, RunArgs, TuneArgs, RUN_ARG_NPASSES, RUN_ARG_PROTECTION_PERIOD,
		TUNE_ARG_CLEANING_INTERVAL, TUNE_ARG_MIN_RECLAIMABLE_BLOCKS, TUNE_ARG_NSEGMENTS_PER_CLEAN,
		TUNE_ARG_PROTECTION_PERIOD, TUNE_ARG_RETRY_INTERVAL,
	},
	reclaim_segments, Cno, Cpinfo, GcParams, RecordVec, Rlfs, Segnum, Suinfo, Sustat, CNO_MIN,
	CP_MODE_CHECKPOINT, RECLAIM_PARAM_MIN_RECLAIMABLE_BLKS, RECLAIM_PARAM_PROTCNO,
	RECLAIM_PARAM_PROTSEQ, REQUEST_BATCH,
};

use crate::{
	config::{self, Config, Value},
	server::ControlServer,
};

static RELOAD: AtomicBool = AtomicBool::new(false);
static TERMINATE: AtomicBool = AtomicBool::new(false);
static WAKEUP: AtomicBool = AtomicBool::new(false);

extern "C" fn on_sighup(_: libc::c_int) {
	RELOAD.store(true, Ordering::Relaxed);
}

extern "C" fn on_terminate(_: libc::c_int) {
	TERMINATE.store(true, Ordering::Relaxed);
}

extern "C" fn on_wakeup(_: libc::c_int) {
	WAKEUP.store(true, Ordering::Relaxed);
}

fn ioerr(e: nix::errno::Errno) -> std::io::Error {
	std::io::Error::from_raw_os_error(e as i32)
}

/// Installs flag-setting handlers. No SA_RESTART: the whole point is that
/// a signal interrupts `nanosleep` and the blocking queue reads.
fn install_signal_handlers() -> IoResult<()> {
	let mk = |h: extern "C" fn(libc::c_int)| {
		SigAction::new(SigHandler::Handler(h), SaFlags::empty(), SigSet::empty())
	};
	unsafe {
		sigaction(Signal::SIGHUP, &mk(on_sighup)).map_err(ioerr)?;
		sigaction(Signal::SIGTERM, &mk(on_terminate)).map_err(ioerr)?;
		sigaction(Signal::SIGINT, &mk(on_terminate)).map_err(ioerr)?;
		sigaction(Signal::SIGUSR1, &mk(on_wakeup)).map_err(ioerr)?;
	}
	Ok(())
}

/// Sleeps up to `dur`; true if a signal cut the sleep short.
fn sleep_interruptible(dur: Duration) -> bool {
	let ts = libc::timespec {
		tv_sec: dur.as_secs() as libc::time_t,
		tv_nsec: dur.subsec_nanos() as libc::c_long,
	};
	let mut rem = libc::timespec {
		tv_sec: 0,
		tv_nsec: 0,
	};
	unsafe { libc::nanosleep(&ts, &mut rem) == -1 }
}

fn unixtime() -> u64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map(|d| d.as_secs())
		.unwrap_or(0)
}

/// One queued manual cleaning request.
pub struct Job {
	pub id: u32,
	pub passes_left: u32,
	pub protection_period: Option<Duration>,
}

impl Job {
	pub fn new(id: u32, args: &RunArgs) -> Self {
		let passes = if args.valid & RUN_ARG_NPASSES != 0 {
			args.npasses.max(1)
		} else {
			1
		};
		let protection_period = (args.valid & RUN_ARG_PROTECTION_PERIOD != 0)
			.then(|| Duration::from_secs(args.protection_period));
		Self {
			id,
			passes_left: passes,
			protection_period,
		}
	}
}

/// Control state shared between the daemon loop and the server: everything
/// a client command can change.
#[derive(Default)]
pub struct Ctl {
	pub suspended: bool,
	pub stop: bool,
	pub shutdown: bool,
	pub reload_path: Option<PathBuf>,
	pub tune: Option<TuneArgs>,
	pub jobs: VecDeque<Job>,
	pub waiters: Vec<([u8; 16], u32)>,
	pub active_jobid: u32,
	next_jobid: u32,
}

impl Ctl {
	pub fn new_jobid(&mut self) -> u32 {
		self.next_jobid = self.next_jobid.wrapping_add(1);
		if self.next_jobid == 0 {
			self.next_jobid = 1;
		}
		self.next_jobid
	}

	pub fn job_pending(&self, id: u32) -> bool {
		self.active_jobid == id || self.jobs.iter().any(|j| j.id == id)
	}
}

pub struct Cleanerd {
	fs: Rlfs,
	config: Config,
	conf_path: PathBuf,
	server: ControlServer,
	ctl: Ctl,
	/// Whether the kernel has produced work since the last idle period.
	running: bool,
	/// Below `min_clean_segments`; cleared again above `max_clean_segments`.
	urgent: bool,
	protcno: Cno,
	prottime: u64,
	prev_nongc_ctime: u64,
	/// Wake instant the pacing of step-wise cleaning is anchored to.
	target: Instant,
	fail_streak: u32,
}

impl Cleanerd {
	pub fn new(fs: Rlfs, conf_path: PathBuf, config: Config) -> IoResult<Self> {
		let server = ControlServer::bind(fs.devid())?;
		fs.set_use_mmap(config.use_mmap);
		log::set_max_level(config.log_priority);
		Ok(Self {
			fs,
			config,
			conf_path,
			server,
			ctl: Ctl::default(),
			running: true,
			urgent: false,
			protcno: 0,
			prottime: 0,
			prev_nongc_ctime: 0,
			target: Instant::now(),
			fail_streak: 0,
		})
	}

	fn state(&self) -> CleanerState {
		if self.ctl.suspended {
			CleanerState::Suspended
		} else if self.running || !self.ctl.jobs.is_empty() {
			CleanerState::Running
		} else {
			CleanerState::Idle
		}
	}

	fn reload(&mut self, path: &Path) {
		match config::load(path) {
			Ok(new) => {
				if new == self.config {
					log::info!("configuration unchanged");
					return;
				}
				if new.protection_period > self.config.protection_period {
					// The longer window may protect checkpoints the cursor
					// already moved past; re-derive it from scratch.
					self.protcno = 0;
					self.prottime = 0;
				}
				log::set_max_level(new.log_priority);
				self.fs.set_use_mmap(new.use_mmap);
				self.config = new;
				log::info!("configuration reloaded from {}", path.display());
			}
			Err(e) => log::error!("cannot reload {}: {e}", path.display()),
		}
	}

	fn apply_tune(&mut self, args: &TuneArgs) {
		if args.valid & TUNE_ARG_NSEGMENTS_PER_CLEAN != 0 {
			self.config.nsegments_per_clean = (args.nsegments_per_clean as usize)
				.clamp(1, config::MAX_NSEGMENTS_PER_CLEAN);
		}
		if args.valid & TUNE_ARG_CLEANING_INTERVAL != 0 {
			self.config.cleaning_interval = Duration::from_secs(args.cleaning_interval);
		}
		if args.valid & TUNE_ARG_RETRY_INTERVAL != 0 {
			self.config.retry_interval = Duration::from_secs(args.retry_interval);
		}
		if args.valid & TUNE_ARG_MIN_RECLAIMABLE_BLOCKS != 0 {
			self.config.min_reclaimable_blocks = Value::Count(args.min_reclaimable_blocks);
		}
		if args.valid & TUNE_ARG_PROTECTION_PERIOD != 0 {
			let pp = Duration::from_secs(args.protection_period);
			if pp > self.config.protection_period {
				self.protcno = 0;
				self.prottime = 0;
			}
			self.config.protection_period = pp;
		}
		log::info!("runtime parameters tuned");
	}

	/// Scans segment usage and builds the working set: reclaimable segments
	/// outside the protection window, oldest first, at most `limit`. Also
	/// reports the oldest last-modification time seen among reclaimable
	/// segments, for the idle sleep computation.
	fn select_segments(
		&self,
		sustat: &Sustat,
		protection_period: Duration,
		limit: usize,
	) -> IoResult<(RecordVec<Segnum>, Option<u64>)> {
		let now = unixtime();
		let cutoff = now.saturating_sub(protection_period.as_secs());
		let threshold = self.config.selection_policy.threshold;

		let mut work: Vec<(u64, Segnum)> = Vec::new();
		let mut oldest: Option<u64> = None;
		let mut buf = vec![Suinfo::default(); REQUEST_BATCH];
		let mut segnum: Segnum = 0;

		while segnum < sustat.nsegs {
			let n = self.fs.get_suinfo(segnum, &mut buf)?;
			if n == 0 {
				break;
			}
			for (i, si) in buf[..n].iter().enumerate() {
				if !si.is_reclaimable() {
					continue;
				}
				if oldest.map_or(true, |o| si.lastmod < o) {
					oldest = Some(si.lastmod);
				}
				if si.lastmod >= cutoff {
					continue;
				}
				// timestamp policy: importance is the modification time
				let importance = si.lastmod;
				if threshold != 0 && importance > threshold {
					continue;
				}
				work.push((importance, segnum + i as u64));
			}
			segnum += n as u64;
		}

		work.sort_unstable();
		let mut out = RecordVec::new();
		out.extend(work.into_iter().take(limit).map(|(_, s)| s));
		Ok((out, oldest))
	}

	/// Advances the protection cursor: the smallest checkpoint created at
	/// or after `now - protection_period`. A cursor time moving backwards
	/// resets the scan.
	fn update_protcno(&mut self, protection_period: Duration) -> IoResult<Cno> {
		let now = unixtime();
		let prottime = now.saturating_sub(protection_period.as_secs());
		if prottime < self.prottime {
			log::warn!("protection time moved backwards, rescanning checkpoints");
			self.protcno = 0;
		}
		self.prottime = prottime;

		let mut cno = self.protcno.max(CNO_MIN);
		let mut buf = vec![Cpinfo::default(); REQUEST_BATCH];
		loop {
			let n = self.fs.get_cpinfo(cno, CP_MODE_CHECKPOINT, &mut buf)?;
			if let Some(ci) = buf[..n].iter().find(|ci| ci.create >= prottime) {
				self.protcno = ci.cno;
				break;
			}
			if n < buf.len() {
				// No checkpoint inside the window; nothing is protected.
				let cpstat = self.fs.get_cpstat()?;
				self.protcno = cpstat.cno + 1;
				break;
			}
			cno = buf[n - 1].cno + 1;
		}
		log::debug!("protection cursor: cno {} (prottime {prottime})", self.protcno);
		Ok(self.protcno)
	}

	fn sleep_idle(&self, dur: Duration) {
		sleep_interruptible(dur);
	}

	/// Paces consecutive passes: if the planned wake time already passed,
	/// re-anchor and continue immediately, otherwise sleep the remainder.
	fn pace(&mut self) {
		let interval = if self.urgent {
			self.config.mc_cleaning_interval
		} else {
			self.config.cleaning_interval
		};
		let now = Instant::now();
		let planned = self.target + interval;
		if now >= planned {
			self.target = now;
			return;
		}
		let interrupted = sleep_interruptible(planned - now);
		self.target = planned;
		if interrupted && !RELOAD.load(Ordering::Relaxed) {
			self.running = false;
		}
	}

	fn backoff(&mut self) {
		let mult = 1u32 << self.fail_streak.min(3);
		self.fail_streak = self.fail_streak.saturating_add(1);
		self.sleep_idle(self.config.retry_interval * mult);
	}

	pub fn run(&mut self) -> IoResult<()> {
		install_signal_handlers()?;
		self.server.arm_notify()?;
		log::info!(
			"cleaner daemon started on {} (mounted at {})",
			self.fs.device().display(),
			self.fs.dir().display()
		);

		loop {
			if TERMINATE.swap(false, Ordering::Relaxed) {
				log::info!("caught termination signal, exiting");
				break;
			}
			if RELOAD.swap(false, Ordering::Relaxed) {
				let path = self.conf_path.clone();
				self.reload(&path);
			}
			WAKEUP.store(false, Ordering::Relaxed);

			let state = self.state();
			self.server.poll(&mut self.ctl, state);
			if self.ctl.shutdown {
				log::info!("shutdown requested, exiting");
				break;
			}
			if let Some(path) = self.ctl.reload_path.take() {
				self.reload(&path);
				self.conf_path = path;
			}
			if let Some(args) = self.ctl.tune.take() {
				self.apply_tune(&args);
			}
			if self.ctl.stop {
				self.ctl.stop = false;
				self.running = false;
			}

			let sustat = match self.fs.get_sustat() {
				Ok(s) => s,
				Err(e) => {
					log::error!("cannot read segment usage statistics: {e}");
					self.backoff();
					continue;
				}
			};
			if sustat.nongc_ctime != self.prev_nongc_ctime {
				self.prev_nongc_ctime = sustat.nongc_ctime;
				self.running = true;
			}

			let geom = *self.fs.geometry();
			let segsize = geom.segment_size();
			let min = self.config.min_clean_segments.segments(sustat.nsegs, segsize);
			let max = self.config.max_clean_segments.segments(sustat.nsegs, segsize);
			if sustat.ncleansegs < min {
				if !self.urgent {
					log::info!(
						"free segments low ({} < {min}), accelerating",
						sustat.ncleansegs
					);
				}
				self.urgent = true;
			} else if sustat.ncleansegs >= max {
				self.urgent = false;
			}

			let manual = !self.ctl.jobs.is_empty();
			if self.ctl.suspended || (!self.running && !manual) {
				self.sleep_idle(self.config.clean_check_interval);
				continue;
			}

			let protection_period = self
				.ctl
				.jobs
				.front()
				.and_then(|j| j.protection_period)
				.unwrap_or(self.config.protection_period);
			let limit = if self.urgent {
				self.config.mc_nsegments_per_clean
			} else {
				self.config.nsegments_per_clean
			};

			let (mut victims, oldest) =
				match self.select_segments(&sustat, protection_period, limit) {
					Ok(v) => v,
					Err(e) => {
						log::error!("segment scan failed: {e}");
						self.backoff();
						continue;
					}
				};

			if victims.is_empty() {
				let now = unixtime();
				let dur = match oldest {
					Some(lastmod) => Duration::from_secs(
						(lastmod + protection_period.as_secs() + 1)
							.saturating_sub(now)
							.max(1),
					),
					None => protection_period + Duration::from_secs(1),
				};
				log::debug!("no segment out of protection; sleeping {}s", dur.as_secs());
				self.running = false;
				self.sleep_idle(dur);
				continue;
			}

			let protcno = match self.update_protcno(protection_period) {
				Ok(c) => c,
				Err(e) => {
					log::error!("cannot update the protection cursor: {e}");
					self.backoff();
					continue;
				}
			};

			let min_reclaimable = if self.config.use_set_suinfo && self.fs.opt_set_suinfo() {
				let v = if self.urgent {
					self.config.mc_min_reclaimable_blocks
				} else {
					self.config.min_reclaimable_blocks
				};
				v.blocks(geom.blocks_per_segment as u64, geom.block_size as u64)
			} else {
				0
			};
			let mut flags = RECLAIM_PARAM_PROTSEQ | RECLAIM_PARAM_PROTCNO;
			if min_reclaimable > 0 {
				flags |= RECLAIM_PARAM_MIN_RECLAIMABLE_BLKS;
			}
			let params = GcParams {
				flags,
				protseq: sustat.prot_seq,
				protcno,
				min_reclaimable_blks: min_reclaimable,
				dryrun: false,
			};

			self.ctl.active_jobid = self.ctl.jobs.front().map_or(0, |j| j.id);
			match reclaim_segments(&self.fs, &mut victims, &params) {
				Ok(_stat) => {
					self.fail_streak = 0;
					if let Some(job) = self.ctl.jobs.front_mut() {
						job.passes_left = job.passes_left.saturating_sub(1);
						if job.passes_left == 0 {
							let id = job.id;
							self.ctl.jobs.pop_front();
							self.ctl.active_jobid = 0;
							let state = self.state();
							self.server.complete_job(&mut self.ctl, id, state);
						}
					}
					self.pace();
				}
				Err(e) if e.raw_os_error() == Some(libc::EINTR) => continue,
				Err(e) => {
					log::error!("cleaning pass failed: {e}");
					self.backoff();
				}
			}
		}

		// Unfinished jobs will never complete; let their waiters go.
		let state = self.state();
		while let Some(job) = self.ctl.jobs.pop_front() {
			self.server.complete_job(&mut self.ctl, job.id, state);
		}
		Ok(())
	}
}

#[cfg(test)]
mod t {
	use super::*;

	#[test]
	fn job_defaults_to_one_pass() {
		let job = Job::new(1, &RunArgs::default());
		assert_eq!(job.passes_left, 1);
		assert_eq!(job.protection_period, None);
	}

	#[test]
	fn job_takes_overrides() {
		let args = RunArgs {
			valid: RUN_ARG_NPASSES | RUN_ARG_PROTECTION_PERIOD,
			npasses: 5,
			protection_period: 60,
		};
		let job = Job::new(2, &args);
		assert_eq!(job.passes_left, 5);
		assert_eq!(job.protection_period, Some(Duration::from_secs(60)));
	}

	#[test]
	fn jobids_skip_zero() {
		let mut ctl = Ctl::default();
		assert_eq!(ctl.new_jobid(), 1);
		ctl.next_jobid = u32::MAX;
		assert_eq!(ctl.new_jobid(), 1);
	}

	#[test]
	fn pending_covers_queue_and_active() {
		let mut ctl = Ctl::default();
		let id = ctl.new_jobid();
		ctl.jobs.push_back(Job::new(id, &RunArgs::default()));
		assert!(ctl.job_pending(id));
		assert!(!ctl.job_pending(id + 1));
		ctl.jobs.clear();
		ctl.active_jobid = 7;
		assert!(ctl.job_pending(7));
	}
}

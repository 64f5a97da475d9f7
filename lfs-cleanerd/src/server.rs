use std::{
	ffi::OsString,
	io::Result as IoResult,
	os::unix::ffi::OsStringExt,
	path::PathBuf,
};

use rlfs::cleaner::{
	from_bytes,
	msg::{
		reply_queue_name, request_queue_name, CleanerState, Command, RequestHeader, Response,
		RunArgs, TuneArgs, WaitArgs, HEADER_SIZE, MAX_MESSAGE_SIZE, PRIO_NORMAL, RESULT_ACK,
		RESULT_NACK,
	},
	queue::MessageQueue,
	to_bytes,
};
use rlfs::DeviceId;

use crate::daemon::{Ctl, Job};

/// Server half of the control plane: owns the well-known request queue and
/// translates client commands into control-state changes. Replies go to
/// each client's private queue, looked up by the UUID the request carried.
pub struct ControlServer {
	queue: MessageQueue,
}

impl ControlServer {
	pub fn bind(devid: &DeviceId) -> IoResult<Self> {
		let queue = MessageQueue::create(&request_queue_name(devid), 10, true)?;
		Ok(Self {
			queue,
		})
	}

	/// Re-registers for a SIGUSR1 kick on the next message, so requests
	/// arriving mid-sleep wake the daemon loop.
	pub fn arm_notify(&self) -> IoResult<()> {
		self.queue.notify(libc::SIGUSR1)
	}

	fn reply(&self, uuid: &[u8; 16], resp: &Response) {
		let name = reply_queue_name(uuid);
		let bytes = match to_bytes(resp) {
			Ok(b) => b,
			Err(_) => return,
		};
		// The client may have died or let its queue fill up; either way
		// this is its problem, not the daemon's.
		match MessageQueue::open_send(&name) {
			Ok(q) => {
				if let Err(e) = q.send(&bytes, PRIO_NORMAL) {
					log::warn!("cannot reply to {name}: {e}");
				}
			}
			Err(e) => log::warn!("cannot open reply queue {name}: {e}"),
		}
	}

	/// Drains every pending request, mutating `ctl` accordingly.
	pub fn poll(&self, ctl: &mut Ctl, state: CleanerState) {
		let mut buf = vec![0u8; MAX_MESSAGE_SIZE];
		loop {
			let n = match self.queue.try_receive(&mut buf) {
				Ok(Some((n, _))) => n,
				Ok(None) => break,
				Err(e) => {
					log::error!("control queue receive failed: {e}");
					break;
				}
			};
			if n < HEADER_SIZE {
				log::warn!("runt control message ({n} bytes), dropped");
				continue;
			}
			let Ok(hdr) = from_bytes::<RequestHeader>(&buf[..HEADER_SIZE]) else {
				continue;
			};
			let body_len = (hdr.argsize as usize).min(n - HEADER_SIZE);
			let body = &buf[HEADER_SIZE..HEADER_SIZE + body_len];
			self.dispatch(ctl, state, &hdr, body);
		}
		if let Err(e) = self.arm_notify() {
			log::warn!("cannot arm queue notification: {e}");
		}
	}

	fn dispatch(&self, ctl: &mut Ctl, state: CleanerState, hdr: &RequestHeader, body: &[u8]) {
		let mut resp = Response {
			result: RESULT_ACK,
			status: state as i16,
			err: 0,
			jobid: ctl.active_jobid,
			pad: 0,
		};
		let mut nack = |resp: &mut Response, err: i32| {
			resp.result = RESULT_NACK;
			resp.err = err;
		};

		let cmd = match Command::try_from(hdr.cmd) {
			Ok(c) => c,
			Err(_) => {
				log::warn!("unknown control command {}", hdr.cmd);
				nack(&mut resp, libc::EINVAL);
				self.reply(&hdr.uuid, &resp);
				return;
			}
		};
		log::debug!("control request: {cmd:?}");

		match cmd {
			Command::GetStatus => {}
			Command::Run => match from_bytes::<RunArgs>(body) {
				Ok(args) => {
					let id = ctl.new_jobid();
					ctl.jobs.push_back(Job::new(id, &args));
					resp.jobid = id;
				}
				Err(_) => nack(&mut resp, libc::EINVAL),
			},
			Command::Suspend => ctl.suspended = true,
			Command::Resume => ctl.suspended = false,
			Command::Tune => match from_bytes::<TuneArgs>(body) {
				Ok(args) => ctl.tune = Some(args),
				Err(_) => nack(&mut resp, libc::EINVAL),
			},
			Command::Reload => {
				let path = PathBuf::from(OsString::from_vec(body.to_vec()));
				if path.is_absolute() {
					ctl.reload_path = Some(path);
				} else {
					nack(&mut resp, libc::EINVAL);
				}
			}
			Command::Wait => match from_bytes::<WaitArgs>(body) {
				Ok(args) => {
					if ctl.job_pending(args.jobid) {
						// Reply when the job drains; the client enforces its
						// own deadline.
						ctl.waiters.push((hdr.uuid, args.jobid));
						return;
					}
					resp.jobid = args.jobid;
				}
				Err(_) => nack(&mut resp, libc::EINVAL),
			},
			Command::Stop => ctl.stop = true,
			Command::Shutdown => ctl.shutdown = true,
		}

		self.reply(&hdr.uuid, &resp);
	}

	/// Releases every waiter of a finished job.
	pub fn complete_job(&self, ctl: &mut Ctl, jobid: u32, state: CleanerState) {
		let resp = Response {
			result: RESULT_ACK,
			status: state as i16,
			err: 0,
			jobid,
			pad: 0,
		};
		let mut i = 0;
		while i < ctl.waiters.len() {
			if ctl.waiters[i].1 == jobid {
				let (uuid, _) = ctl.waiters.swap_remove(i);
				self.reply(&uuid, &resp);
			} else {
				i += 1;
			}
		}
	}
}

impl Drop for ControlServer {
	fn drop(&mut self) {
		self.queue.unlink();
	}
}

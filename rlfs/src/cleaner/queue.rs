use std::{
	ffi::CString,
	io::{Error, Result as IoResult},
	mem,
	time::Duration,
};

use super::msg::MAX_MESSAGE_SIZE;

/// Thin wrapper over a POSIX message queue descriptor. nix does not wrap
/// `mq_timedreceive` and `mq_notify`, so this goes through libc directly.
pub struct MessageQueue {
	mqd: libc::mqd_t,
	name: CString,
}

fn cname(name: &str) -> CString {
	CString::new(name).expect("queue name contains NUL")
}

impl MessageQueue {
	/// Creates (or attaches to) a queue for receiving.
	pub fn create(name: &str, maxmsg: usize, nonblock: bool) -> IoResult<Self> {
		let name = cname(name);
		let mut flags = libc::O_CREAT | libc::O_RDWR;
		if nonblock {
			flags |= libc::O_NONBLOCK;
		}
		let mut attr: libc::mq_attr = unsafe { mem::zeroed() };
		attr.mq_maxmsg = maxmsg as libc::c_long;
		attr.mq_msgsize = MAX_MESSAGE_SIZE as libc::c_long;
		let mqd = unsafe {
			libc::mq_open(
				name.as_ptr(),
				flags,
				0o600 as libc::c_uint,
				&attr as *const libc::mq_attr,
			)
		};
		if mqd == -1 as libc::mqd_t {
			return Err(Error::last_os_error());
		}
		Ok(Self {
			mqd,
			name,
		})
	}

	/// Opens an existing queue for sending. Non-blocking, so a peer with a
	/// full or abandoned queue cannot wedge the caller.
	pub fn open_send(name: &str) -> IoResult<Self> {
		let name = cname(name);
		let mqd = unsafe { libc::mq_open(name.as_ptr(), libc::O_WRONLY | libc::O_NONBLOCK) };
		if mqd == -1 as libc::mqd_t {
			return Err(Error::last_os_error());
		}
		Ok(Self {
			mqd,
			name,
		})
	}

	pub fn send(&self, msg: &[u8], prio: u32) -> IoResult<()> {
		let r = unsafe {
			libc::mq_send(self.mqd, msg.as_ptr().cast::<libc::c_char>(), msg.len(), prio)
		};
		if r == -1 {
			return Err(Error::last_os_error());
		}
		Ok(())
	}

	/// Non-blocking receive; `Ok(None)` when the queue is empty. Only valid
	/// on queues created with `nonblock`.
	pub fn try_receive(&self, buf: &mut [u8]) -> IoResult<Option<(usize, u32)>> {
		let mut prio = 0u32;
		loop {
			let n = unsafe {
				libc::mq_receive(
					self.mqd,
					buf.as_mut_ptr().cast::<libc::c_char>(),
					buf.len(),
					&mut prio,
				)
			};
			if n >= 0 {
				return Ok(Some((n as usize, prio)));
			}
			let e = Error::last_os_error();
			match e.raw_os_error() {
				Some(libc::EAGAIN) => return Ok(None),
				Some(libc::EINTR) => continue,
				_ => return Err(e),
			}
		}
	}

	/// Blocking receive with an absolute deadline; `ETIMEDOUT` on expiry.
	pub fn receive_deadline(&self, buf: &mut [u8], timeout: Duration) -> IoResult<(usize, u32)> {
		let mut now: libc::timespec = unsafe { mem::zeroed() };
		unsafe {
			libc::clock_gettime(libc::CLOCK_REALTIME, &mut now);
		}
		let mut abs = now;
		abs.tv_sec += timeout.as_secs() as libc::time_t;
		abs.tv_nsec += timeout.subsec_nanos() as libc::c_long;
		if abs.tv_nsec >= 1_000_000_000 {
			abs.tv_sec += 1;
			abs.tv_nsec -= 1_000_000_000;
		}

		let mut prio = 0u32;
		loop {
			let n = unsafe {
				libc::mq_timedreceive(
					self.mqd,
					buf.as_mut_ptr().cast::<libc::c_char>(),
					buf.len(),
					&mut prio,
					&abs,
				)
			};
			if n >= 0 {
				return Ok((n as usize, prio));
			}
			let e = Error::last_os_error();
			if e.raw_os_error() == Some(libc::EINTR) {
				continue;
			}
			return Err(e);
		}
	}

	/// Discards everything queued, e.g. stale replies from an earlier,
	/// timed-out exchange. Toggles O_NONBLOCK for the duration.
	pub fn drain(&self) -> usize {
		let mut attr: libc::mq_attr = unsafe { mem::zeroed() };
		let mut old: libc::mq_attr = unsafe { mem::zeroed() };
		attr.mq_flags = libc::O_NONBLOCK as libc::c_long;
		if unsafe { libc::mq_setattr(self.mqd, &attr, &mut old) } == -1 {
			return 0;
		}

		let mut buf = vec![0u8; MAX_MESSAGE_SIZE];
		let mut n = 0;
		while let Ok(Some(_)) = self.try_receive(&mut buf) {
			n += 1;
		}

		unsafe {
			libc::mq_setattr(self.mqd, &old, std::ptr::null_mut());
		}
		n
	}

	/// Requests delivery of `signo` when a message arrives on an empty
	/// queue. One-shot; re-arm after each notification.
	pub fn notify(&self, signo: i32) -> IoResult<()> {
		let mut ev: libc::sigevent = unsafe { mem::zeroed() };
		ev.sigev_notify = libc::SIGEV_SIGNAL;
		ev.sigev_signo = signo;
		if unsafe { libc::mq_notify(self.mqd, &ev) } == -1 {
			let e = Error::last_os_error();
			// EBUSY: someone (we) already registered; harmless.
			if e.raw_os_error() != Some(libc::EBUSY) {
				return Err(e);
			}
		}
		Ok(())
	}

	pub fn unlink(&self) {
		unsafe {
			libc::mq_unlink(self.name.as_ptr());
		}
	}
}

impl Drop for MessageQueue {
	fn drop(&mut self) {
		unsafe {
			libc::mq_close(self.mqd);
		}
	}
}

#[cfg(test)]
mod t {
	use super::*;

	fn unique_name(tag: &str) -> String {
		format!("/rlfs-test-{tag}-{}", std::process::id())
	}

	#[test]
	fn send_receive_roundtrip() {
		let name = unique_name("rr");
		let q = MessageQueue::create(&name, 4, true).unwrap();
		q.send(b"hello", 9).unwrap();

		let mut buf = [0u8; MAX_MESSAGE_SIZE];
		let (n, prio) = q.try_receive(&mut buf).unwrap().unwrap();
		assert_eq!(&buf[..n], b"hello");
		assert_eq!(prio, 9);
		assert!(q.try_receive(&mut buf).unwrap().is_none());
		q.unlink();
	}

	#[test]
	fn drain_discards_backlog() {
		let name = unique_name("drain");
		let q = MessageQueue::create(&name, 8, false).unwrap();
		q.send(b"a", 1).unwrap();
		q.send(b"b", 1).unwrap();
		assert_eq!(q.drain(), 2);
		q.unlink();
	}

	#[test]
	fn deadline_expires() {
		let name = unique_name("dl");
		let q = MessageQueue::create(&name, 4, false).unwrap();
		let mut buf = [0u8; MAX_MESSAGE_SIZE];
		let e = q
			.receive_deadline(&mut buf, Duration::from_millis(50))
			.unwrap_err();
		assert_eq!(e.raw_os_error(), Some(libc::ETIMEDOUT));
		q.unlink();
	}
}

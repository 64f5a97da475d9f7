use std::{ffi::CString, io::Error, io::Result as IoResult};

use crate::mount::DeviceId;

/// File-system-wide GC mutex backed by a named POSIX semaphore, so at most
/// one process runs a cleaning or resize transaction against a device at a
/// time.
pub struct CleanerLock {
	sem: *mut libc::sem_t,
}

impl CleanerLock {
	pub fn new(devid: &DeviceId) -> IoResult<Self> {
		let name = CString::new(format!("/rlfs-cleaner-{}", devid.suffix())).unwrap();
		let sem = unsafe {
			libc::sem_open(
				name.as_ptr(),
				libc::O_CREAT,
				0o600 as libc::c_uint,
				1 as libc::c_uint,
			)
		};
		if sem == libc::SEM_FAILED {
			return Err(Error::last_os_error());
		}
		Ok(Self {
			sem,
		})
	}

	pub fn lock(&self) -> IoResult<()> {
		loop {
			if unsafe { libc::sem_wait(self.sem) } == 0 {
				return Ok(());
			}
			let e = Error::last_os_error();
			if e.raw_os_error() != Some(libc::EINTR) {
				return Err(e);
			}
		}
	}

	pub fn unlock(&self) -> IoResult<()> {
		if unsafe { libc::sem_post(self.sem) } == 0 {
			Ok(())
		} else {
			Err(Error::last_os_error())
		}
	}
}

impl Drop for CleanerLock {
	fn drop(&mut self) {
		unsafe {
			libc::sem_close(self.sem);
		}
	}
}

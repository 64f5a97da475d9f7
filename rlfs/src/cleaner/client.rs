use std::{
	fs,
	io::{Error, Result as IoResult},
	path::Path,
	time::Duration,
};

use uuid::Uuid;

use super::{
	msg::{
		reply_queue_name, request_queue_name, CleanerState, Command, RequestHeader, Response,
		RunArgs, TuneArgs, WaitArgs, MAX_MESSAGE_SIZE, MAX_RELOAD_PATH, PRIO_HIGH, PRIO_NORMAL,
		RESULT_NACK,
	},
	queue::MessageQueue,
};
use crate::{decoder, err, mount::DeviceId};

/// How long a client waits for an ordinary acknowledgement.
const REPLY_TIMEOUT: Duration = Duration::from_secs(30);

/// Connection to a running cleaner daemon.
pub struct CleanerClient {
	request: MessageQueue,
	reply: MessageQueue,
	uuid: [u8; 16],
}

impl CleanerClient {
	pub fn connect(devid: &DeviceId) -> IoResult<Self> {
		let uuid = *Uuid::new_v4().as_bytes();
		let reply = MessageQueue::create(&reply_queue_name(&uuid), 8, false)?;
		let request = MessageQueue::open_send(&request_queue_name(devid))?;
		Ok(Self {
			request,
			reply,
			uuid,
		})
	}

	fn call(
		&self,
		cmd: Command,
		body: &[u8],
		prio: u32,
		timeout: Duration,
	) -> IoResult<Response> {
		// Stale replies from an earlier timed-out exchange would otherwise
		// be taken for this one's.
		self.reply.drain();

		let mut msg = decoder::to_bytes(&RequestHeader::new(cmd, body.len(), self.uuid))?;
		msg.extend_from_slice(body);
		assert!(msg.len() <= MAX_MESSAGE_SIZE);
		self.request.send(&msg, prio)?;

		let mut buf = [0u8; MAX_MESSAGE_SIZE];
		let (n, _) = self.reply.receive_deadline(&mut buf, timeout)?;
		let resp: Response = decoder::from_bytes(&buf[..n])?;
		if resp.result == RESULT_NACK {
			return Err(Error::from_raw_os_error(resp.err));
		}
		Ok(resp)
	}

	pub fn status(&self) -> IoResult<(CleanerState, u32)> {
		let resp = self.call(Command::GetStatus, &[], PRIO_NORMAL, REPLY_TIMEOUT)?;
		Ok((CleanerState::try_from(resp.status)?, resp.jobid))
	}

	/// Queues a manual cleaning job; returns its job id.
	pub fn run(&self, args: &RunArgs) -> IoResult<u32> {
		let body = decoder::to_bytes(args)?;
		let resp = self.call(Command::Run, &body, PRIO_NORMAL, REPLY_TIMEOUT)?;
		Ok(resp.jobid)
	}

	pub fn suspend(&self) -> IoResult<()> {
		self.call(Command::Suspend, &[], PRIO_NORMAL, REPLY_TIMEOUT)?;
		Ok(())
	}

	pub fn resume(&self) -> IoResult<()> {
		self.call(Command::Resume, &[], PRIO_NORMAL, REPLY_TIMEOUT)?;
		Ok(())
	}

	pub fn tune(&self, args: &TuneArgs) -> IoResult<()> {
		let body = decoder::to_bytes(args)?;
		self.call(Command::Tune, &body, PRIO_NORMAL, REPLY_TIMEOUT)?;
		Ok(())
	}

	pub fn reload(&self, path: &Path) -> IoResult<()> {
		let path = fs::canonicalize(path)?;
		let bytes = path.as_os_str().as_encoded_bytes();
		if bytes.len() >= MAX_RELOAD_PATH {
			return Err(err!(ENAMETOOLONG));
		}
		self.call(Command::Reload, bytes, PRIO_NORMAL, REPLY_TIMEOUT)?;
		Ok(())
	}

	/// Blocks until job `jobid` finishes or `timeout` elapses
	/// (`ETIMEDOUT`); a timeout leaves the daemon undisturbed.
	pub fn wait(&self, jobid: u32, timeout: Duration) -> IoResult<()> {
		let args = WaitArgs {
			jobid,
			pad: 0,
		};
		let body = decoder::to_bytes(&args)?;
		self.call(Command::Wait, &body, PRIO_NORMAL, timeout)?;
		Ok(())
	}

	pub fn stop(&self) -> IoResult<()> {
		self.call(Command::Stop, &[], PRIO_HIGH, REPLY_TIMEOUT)?;
		Ok(())
	}

	pub fn shutdown(&self) -> IoResult<()> {
		self.call(Command::Shutdown, &[], PRIO_HIGH, REPLY_TIMEOUT)?;
		Ok(())
	}
}

impl Drop for CleanerClient {
	fn drop(&mut self) {
		self.reply.unlink();
	}
}

use std::io::{ErrorKind, Result as IoResult};

use bincode::{
	de::Decoder,
	enc::Encoder,
	error::{DecodeError, EncodeError},
	Decode, Encode,
};
use uuid::Uuid;

use crate::{iobail, mount::DeviceId};

/// Upper bound on a request message, header included.
pub const MAX_MESSAGE_SIZE: usize = 4096;
pub const HEADER_SIZE: usize = 32;
pub const RESPONSE_SIZE: usize = 16;
/// Longest path a reload request may carry.
pub const MAX_RELOAD_PATH: usize = MAX_MESSAGE_SIZE - HEADER_SIZE;

/// Message priority of shutdown-class requests.
pub const PRIO_HIGH: u32 = 1;
pub const PRIO_NORMAL: u32 = 9;

pub fn request_queue_name(devid: &DeviceId) -> String {
	format!("/rlfs-cleanerd-{}", devid.suffix())
}

pub fn reply_queue_name(uuid: &[u8; 16]) -> String {
	format!("/rlfs-cleanerd-{}", Uuid::from_bytes(*uuid).simple())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Command {
	GetStatus = 0,
	Run = 1,
	Suspend = 2,
	Resume = 3,
	Tune = 4,
	Reload = 5,
	Wait = 6,
	Stop = 7,
	Shutdown = 8,
}

impl TryFrom<i32> for Command {
	type Error = std::io::Error;

	fn try_from(v: i32) -> IoResult<Self> {
		let cmd = match v {
			0 => Self::GetStatus,
			1 => Self::Run,
			2 => Self::Suspend,
			3 => Self::Resume,
			4 => Self::Tune,
			5 => Self::Reload,
			6 => Self::Wait,
			7 => Self::Stop,
			8 => Self::Shutdown,
			_ => iobail!(ErrorKind::InvalidData, "unknown command {v}"),
		};
		Ok(cmd)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i16)]
pub enum CleanerState {
	Idle = 0,
	Running = 1,
	Suspended = 2,
}

impl TryFrom<i16> for CleanerState {
	type Error = std::io::Error;

	fn try_from(v: i16) -> IoResult<Self> {
		let st = match v {
			0 => Self::Idle,
			1 => Self::Running,
			2 => Self::Suspended,
			_ => iobail!(ErrorKind::InvalidData, "unknown cleaner state {v}"),
		};
		Ok(st)
	}
}

/// Fixed-width header every request starts with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHeader {
	pub cmd: i32,
	pub argsize: u32,
	pub uuid: [u8; 16],
	pub pad: u64,
}

impl RequestHeader {
	pub fn new(cmd: Command, argsize: usize, uuid: [u8; 16]) -> Self {
		Self {
			cmd: cmd as i32,
			argsize: argsize as u32,
			uuid,
			pad: 0,
		}
	}
}

impl Decode for RequestHeader {
	fn decode<D: Decoder>(d: &mut D) -> Result<Self, DecodeError> {
		Ok(Self {
			cmd: i32::decode(d)?,
			argsize: u32::decode(d)?,
			uuid: <[u8; 16]>::decode(d)?,
			pad: u64::decode(d)?,
		})
	}
}

impl Encode for RequestHeader {
	fn encode<E: Encoder>(&self, e: &mut E) -> Result<(), EncodeError> {
		self.cmd.encode(e)?;
		self.argsize.encode(e)?;
		self.uuid.encode(e)?;
		self.pad.encode(e)
	}
}

pub const RESULT_ACK: i16 = 0;
pub const RESULT_NACK: i16 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Response {
	pub result: i16,
	pub status: i16,
	pub err: i32,
	pub jobid: u32,
	pub pad: u32,
}

impl Decode for Response {
	fn decode<D: Decoder>(d: &mut D) -> Result<Self, DecodeError> {
		Ok(Self {
			result: i16::decode(d)?,
			status: i16::decode(d)?,
			err: i32::decode(d)?,
			jobid: u32::decode(d)?,
			pad: u32::decode(d)?,
		})
	}
}

impl Encode for Response {
	fn encode<E: Encoder>(&self, e: &mut E) -> Result<(), EncodeError> {
		self.result.encode(e)?;
		self.status.encode(e)?;
		self.err.encode(e)?;
		self.jobid.encode(e)?;
		self.pad.encode(e)
	}
}

pub const RUN_ARG_NPASSES: u32 = 0x01;
pub const RUN_ARG_PROTECTION_PERIOD: u32 = 0x02;

/// Body of a `Run` request. `valid` marks which fields override the
/// daemon's configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RunArgs {
	pub valid: u32,
	pub npasses: u32,
	/// Seconds.
	pub protection_period: u64,
}

impl Decode for RunArgs {
	fn decode<D: Decoder>(d: &mut D) -> Result<Self, DecodeError> {
		Ok(Self {
			valid: u32::decode(d)?,
			npasses: u32::decode(d)?,
			protection_period: u64::decode(d)?,
		})
	}
}

impl Encode for RunArgs {
	fn encode<E: Encoder>(&self, e: &mut E) -> Result<(), EncodeError> {
		self.valid.encode(e)?;
		self.npasses.encode(e)?;
		self.protection_period.encode(e)
	}
}

pub const TUNE_ARG_NSEGMENTS_PER_CLEAN: u32 = 0x01;
pub const TUNE_ARG_CLEANING_INTERVAL: u32 = 0x02;
pub const TUNE_ARG_RETRY_INTERVAL: u32 = 0x04;
pub const TUNE_ARG_MIN_RECLAIMABLE_BLOCKS: u32 = 0x08;
pub const TUNE_ARG_PROTECTION_PERIOD: u32 = 0x10;

/// Body of a `Tune` request: runtime overrides of selected configuration
/// values, applied until the next reload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TuneArgs {
	pub valid: u32,
	pub nsegments_per_clean: u32,
	/// Seconds.
	pub cleaning_interval: u64,
	/// Seconds.
	pub retry_interval: u64,
	pub min_reclaimable_blocks: u64,
	/// Seconds.
	pub protection_period: u64,
}

impl Decode for TuneArgs {
	fn decode<D: Decoder>(d: &mut D) -> Result<Self, DecodeError> {
		Ok(Self {
			valid: u32::decode(d)?,
			nsegments_per_clean: u32::decode(d)?,
			cleaning_interval: u64::decode(d)?,
			retry_interval: u64::decode(d)?,
			min_reclaimable_blocks: u64::decode(d)?,
			protection_period: u64::decode(d)?,
		})
	}
}

impl Encode for TuneArgs {
	fn encode<E: Encoder>(&self, e: &mut E) -> Result<(), EncodeError> {
		self.valid.encode(e)?;
		self.nsegments_per_clean.encode(e)?;
		self.cleaning_interval.encode(e)?;
		self.retry_interval.encode(e)?;
		self.min_reclaimable_blocks.encode(e)?;
		self.protection_period.encode(e)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WaitArgs {
	pub jobid: u32,
	pub pad: u32,
}

impl Decode for WaitArgs {
	fn decode<D: Decoder>(d: &mut D) -> Result<Self, DecodeError> {
		Ok(Self {
			jobid: u32::decode(d)?,
			pad: u32::decode(d)?,
		})
	}
}

impl Encode for WaitArgs {
	fn encode<E: Encoder>(&self, e: &mut E) -> Result<(), EncodeError> {
		self.jobid.encode(e)?;
		self.pad.encode(e)
	}
}

#[cfg(test)]
mod t {
	use super::*;
	use crate::decoder::{from_bytes, to_bytes};

	#[test]
	fn header_layout() {
		let hdr = RequestHeader::new(Command::Reload, 12, [7u8; 16]);
		let bytes = to_bytes(&hdr).unwrap();
		assert_eq!(bytes.len(), HEADER_SIZE);
		let back: RequestHeader = from_bytes(&bytes).unwrap();
		assert_eq!(back, hdr);
		assert_eq!(Command::try_from(back.cmd).unwrap(), Command::Reload);
	}

	#[test]
	fn response_layout() {
		let resp = Response {
			result: RESULT_NACK,
			status: CleanerState::Suspended as i16,
			err: libc::EBUSY,
			jobid: 3,
			pad: 0,
		};
		let bytes = to_bytes(&resp).unwrap();
		assert_eq!(bytes.len(), RESPONSE_SIZE);
		let back: Response = from_bytes(&bytes).unwrap();
		assert_eq!(back, resp);
	}

	#[test]
	fn args_roundtrip() {
		let run = RunArgs {
			valid: RUN_ARG_NPASSES,
			npasses: 4,
			protection_period: 0,
		};
		let back: RunArgs = from_bytes(&to_bytes(&run).unwrap()).unwrap();
		assert_eq!(back, run);

		let tune = TuneArgs {
			valid: TUNE_ARG_CLEANING_INTERVAL | TUNE_ARG_PROTECTION_PERIOD,
			cleaning_interval: 5,
			protection_period: 3600,
			..TuneArgs::default()
		};
		let back: TuneArgs = from_bytes(&to_bytes(&tune).unwrap()).unwrap();
		assert_eq!(back, tune);
	}

	#[test]
	fn unknown_command_rejected() {
		assert!(Command::try_from(99).is_err());
	}

	#[test]
	fn queue_names() {
		let devid = DeviceId::Block {
			major: 8,
			minor: 3,
		};
		assert_eq!(request_queue_name(&devid), "/rlfs-cleanerd-8-3");
		let uuid = [0u8; 16];
		assert_eq!(
			reply_queue_name(&uuid),
			"/rlfs-cleanerd-00000000000000000000000000000000"
		);
	}
}

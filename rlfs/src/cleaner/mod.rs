//! Client side of the cleaner daemon's control plane: typed commands over
//! POSIX message queues. The daemon serves the request queue; every client
//! owns a private reply queue named after a freshly generated UUID.

pub mod client;
pub mod msg;
pub mod queue;

pub use crate::decoder::{from_bytes, to_bytes};
pub use client::CleanerClient;
pub use msg::{
	CleanerState, Command, Response, RunArgs, TuneArgs, PRIO_HIGH, PRIO_NORMAL,
	RUN_ARG_NPASSES, RUN_ARG_PROTECTION_PERIOD, TUNE_ARG_CLEANING_INTERVAL,
	TUNE_ARG_MIN_RECLAIMABLE_BLOCKS, TUNE_ARG_NSEGMENTS_PER_CLEAN,
	TUNE_ARG_PROTECTION_PERIOD, TUNE_ARG_RETRY_INTERVAL,
};

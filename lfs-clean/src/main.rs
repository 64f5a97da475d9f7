use std::{path::Path, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;
use rlfs::{
	cleaner::{
		msg::{
			CleanerState, RunArgs, TuneArgs, RUN_ARG_NPASSES, RUN_ARG_PROTECTION_PERIOD,
			TUNE_ARG_CLEANING_INTERVAL, TUNE_ARG_MIN_RECLAIMABLE_BLOCKS,
			TUNE_ARG_NSEGMENTS_PER_CLEAN, TUNE_ARG_PROTECTION_PERIOD, TUNE_ARG_RETRY_INTERVAL,
		},
		CleanerClient,
	},
	device_id, find_mount,
};

use crate::cli::{Cli, Cmd};

mod cli;

/// The argument may name either the device or the mount point.
fn connect(arg: Option<&Path>) -> Result<CleanerClient> {
	let entry = match arg {
		Some(p) => find_mount(Some(p), None).or_else(|_| find_mount(None, Some(p)))?,
		None => find_mount(None, None)?,
	};
	let devid = device_id(&entry.device)?;
	CleanerClient::connect(&devid)
		.with_context(|| format!("no cleaner daemon serving {}", entry.device.display()))
}

fn state_name(state: CleanerState) -> &'static str {
	match state {
		CleanerState::Idle => "idle",
		CleanerState::Running => "running",
		CleanerState::Suspended => "suspended",
	}
}

fn main() -> Result<()> {
	let cli = Cli::parse();

	env_logger::builder()
		.filter_level(cli.verbose.log_level_filter())
		.init();

	let client = connect(cli.device.as_deref())?;

	match cli.command {
		Cmd::Status => {
			let (state, jobid) = client.status()?;
			if jobid != 0 {
				println!("{} (job {jobid})", state_name(state));
			} else {
				println!("{}", state_name(state));
			}
		}
		Cmd::Run {
			passes,
			protection_period,
			wait,
			timeout,
		} => {
			let mut args = RunArgs {
				valid: RUN_ARG_NPASSES,
				npasses: passes,
				protection_period: 0,
			};
			if let Some(pp) = protection_period {
				args.valid |= RUN_ARG_PROTECTION_PERIOD;
				args.protection_period = pp;
			}
			let jobid = client.run(&args)?;
			println!("job {jobid} queued");
			if wait {
				client.wait(jobid, Duration::from_secs(timeout))?;
				println!("job {jobid} done");
			}
		}
		Cmd::Suspend => client.suspend()?,
		Cmd::Resume => client.resume()?,
		Cmd::Tune {
			nsegments_per_clean,
			cleaning_interval,
			retry_interval,
			min_reclaimable_blocks,
			protection_period,
		} => {
			let mut args = TuneArgs::default();
			if let Some(v) = nsegments_per_clean {
				args.valid |= TUNE_ARG_NSEGMENTS_PER_CLEAN;
				args.nsegments_per_clean = v;
			}
			if let Some(v) = cleaning_interval {
				args.valid |= TUNE_ARG_CLEANING_INTERVAL;
				args.cleaning_interval = v;
			}
			if let Some(v) = retry_interval {
				args.valid |= TUNE_ARG_RETRY_INTERVAL;
				args.retry_interval = v;
			}
			if let Some(v) = min_reclaimable_blocks {
				args.valid |= TUNE_ARG_MIN_RECLAIMABLE_BLOCKS;
				args.min_reclaimable_blocks = v;
			}
			if let Some(v) = protection_period {
				args.valid |= TUNE_ARG_PROTECTION_PERIOD;
				args.protection_period = v;
			}
			anyhow::ensure!(args.valid != 0, "nothing to tune");
			client.tune(&args)?;
		}
		Cmd::Reload {
			path,
		} => client.reload(&path)?,
		Cmd::Wait {
			jobid,
			timeout,
		} => {
			client.wait(jobid, Duration::from_secs(timeout))?;
			println!("job {jobid} done");
		}
		Cmd::Stop => client.stop()?,
		Cmd::Shutdown => client.shutdown()?,
	}
	Ok(())
}

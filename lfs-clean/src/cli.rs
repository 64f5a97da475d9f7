use std::path::PathBuf;

use clap::{Parser, Subcommand};
use clap_verbosity_flag::{Verbosity, WarnLevel};

#[derive(Parser)]
#[command(version, about)]
pub struct Cli {
	/// Device or mount point; may be omitted when exactly one rlfs file
	/// system is mounted
	#[arg(short, long, global = true)]
	pub device: Option<PathBuf>,

	#[command(subcommand)]
	pub command: Cmd,

	#[command(flatten)]
	pub verbose: Verbosity<WarnLevel>,
}

#[derive(Subcommand)]
pub enum Cmd {
	/// Report the daemon's state
	Status,
	/// Queue a cleaning job
	Run {
		/// Number of cleaning passes
		#[arg(short = 'n', long, default_value_t = 1)]
		passes: u32,
		/// Protection period in seconds for this job
		#[arg(short, long)]
		protection_period: Option<u64>,
		/// Wait until the job finishes
		#[arg(short, long)]
		wait: bool,
		/// Wait timeout in seconds
		#[arg(long, default_value_t = 60)]
		timeout: u64,
	},
	/// Pause cleaning
	Suspend,
	/// Resume cleaning
	Resume,
	/// Adjust runtime parameters until the next reload
	Tune {
		#[arg(long)]
		nsegments_per_clean: Option<u32>,
		/// Seconds
		#[arg(long)]
		cleaning_interval: Option<u64>,
		/// Seconds
		#[arg(long)]
		retry_interval: Option<u64>,
		#[arg(long)]
		min_reclaimable_blocks: Option<u64>,
		/// Seconds
		#[arg(long)]
		protection_period: Option<u64>,
	},
	/// Make the daemon re-read a configuration file
	Reload {
		path: PathBuf,
	},
	/// Wait for a queued job to finish
	Wait {
		jobid: u32,
		/// Seconds
		#[arg(long, default_value_t = 60)]
		timeout: u64,
	},
	/// Stop cleaning until new writes arrive or a job is queued
	Stop,
	/// Terminate the daemon
	Shutdown,
}

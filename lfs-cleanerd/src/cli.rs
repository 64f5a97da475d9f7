use std::path::PathBuf;

use clap::Parser;
use clap_verbosity_flag::{InfoLevel, Verbosity};

use crate::config;

#[derive(Parser)]
#[command(version, about)]
pub struct Cli {
	/// Path to the cleaner configuration file
	#[arg(short, long, default_value = config::DEFAULT_CONFIG_PATH)]
	pub conffile: PathBuf,

	/// Protection period in seconds, overriding the configuration
	#[arg(short, long)]
	pub protection_period: Option<f64>,

	/// Path to the device
	pub device: PathBuf,
	/// Path to the mount point
	pub mountpoint: Option<PathBuf>,

	#[command(flatten)]
	pub verbose: Verbosity<InfoLevel>,
}

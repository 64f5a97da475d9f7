use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use rlfs::{Rlfs, OPEN_GCLK, OPEN_RAW};

use crate::{cli::Cli, daemon::Cleanerd};

mod cli;
mod config;
mod daemon;
mod server;

fn main() -> Result<()> {
	let cli = Cli::parse();

	env_logger::builder()
		.filter_level(cli.verbose.log_level_filter())
		.init();

	let mut conf = match config::load(&cli.conffile) {
		Ok(c) => c,
		Err(e) => {
			log::warn!(
				"cannot read {}: {e}; using built-in defaults",
				cli.conffile.display()
			);
			config::Config::default()
		}
	};
	if let Some(pp) = cli.protection_period {
		conf.protection_period = Duration::from_secs_f64(pp);
	}

	let fs = Rlfs::open(
		Some(&cli.device),
		cli.mountpoint.as_deref(),
		OPEN_RAW | OPEN_GCLK,
	)?;

	let mut daemon = Cleanerd::new(fs, cli.conffile.clone(), conf)?;
	daemon.run()?;
	Ok(())
}

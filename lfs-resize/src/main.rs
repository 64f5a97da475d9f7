use std::{
	fs::File,
	io::{BufRead, Seek, SeekFrom, Write},
};

use anyhow::{bail, Context, Result};
use clap::Parser;
use rlfs::{Rlfs, OPEN_GCLK, OPEN_RAW};

use crate::cli::Cli;

mod cli;
mod progress;
mod shrink;

fn confirm(prompt: &str) -> Result<bool> {
	print!("{prompt} (y/N) ");
	std::io::stdout().flush()?;
	let mut line = String::new();
	std::io::stdin().lock().read_line(&mut line)?;
	Ok(matches!(line.trim(), "y" | "Y" | "yes"))
}

fn main() -> Result<()> {
	let cli = Cli::parse();

	env_logger::builder()
		.filter_level(cli.verbose.log_level_filter())
		.init();

	let devsize = File::open(&cli.device)
		.and_then(|mut f| f.seek(SeekFrom::End(0)))
		.with_context(|| format!("cannot read the size of {}", cli.device.display()))?;

	let newsize = match &cli.size {
		Some(s) => cli::parse_size(s).with_context(|| format!("invalid size '{s}'"))?,
		None => devsize,
	};
	if newsize > devsize {
		bail!(
			"new size {newsize} exceeds the device ({devsize} bytes)"
		);
	}

	let fs = Rlfs::open(Some(&cli.device), None, OPEN_RAW | OPEN_GCLK)?;
	let oldsize = fs.superblock().dev_size;
	let new_nsegs = shrink::nsegs_for_size(&fs, newsize);

	if !cli.yes {
		let verb = if newsize < oldsize { "Shrink" } else { "Grow" };
		let q = format!(
			"{verb} the file system on {} from {oldsize} to {newsize} bytes ({new_nsegs} segments)?",
			cli.device.display()
		);
		if !confirm(&q)? {
			bail!("aborted");
		}
	}

	shrink::resize(&fs, newsize)?;
	println!(
		"{}: resized to {newsize} bytes ({new_nsegs} segments)",
		cli.device.display()
	);
	Ok(())
}

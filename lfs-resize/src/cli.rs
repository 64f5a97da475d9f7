use std::path::PathBuf;

use clap::Parser;
use clap_verbosity_flag::{Verbosity, WarnLevel};

#[derive(Parser)]
#[command(version, about)]
pub struct Cli {
	/// Answer yes to every question
	#[arg(short, long)]
	pub yes: bool,

	/// Path to the device
	pub device: PathBuf,
	/// New size in bytes, with an optional kB/K/KiB/... suffix; defaults to
	/// the whole device
	pub size: Option<String>,

	#[command(flatten)]
	pub verbose: Verbosity<WarnLevel>,
}

fn size_unit(suffix: &str) -> Option<u64> {
	let mult = match suffix {
		"" => 1,
		"kB" | "KB" => 1000,
		"K" | "KiB" => 1 << 10,
		"MB" => 1000u64.pow(2),
		"M" | "MiB" => 1 << 20,
		"GB" => 1000u64.pow(3),
		"G" | "GiB" => 1 << 30,
		"TB" => 1000u64.pow(4),
		"T" | "TiB" => 1 << 40,
		"PB" => 1000u64.pow(5),
		"P" | "PiB" => 1 << 50,
		"EB" => 1000u64.pow(6),
		"E" | "EiB" => 1 << 60,
		_ => return None,
	};
	Some(mult)
}

/// Parses a byte size like `1073741824`, `4G` or `2.5TiB`.
pub fn parse_size(s: &str) -> Option<u64> {
	let split = s
		.find(|c: char| !(c.is_ascii_digit() || c == '.'))
		.unwrap_or(s.len());
	let (num, suffix) = s.split_at(split);
	let n: f64 = num.parse().ok()?;
	let mult = size_unit(suffix)?;
	if !n.is_finite() || n < 0.0 {
		return None;
	}
	Some((n * mult as f64) as u64)
}

#[cfg(test)]
mod t {
	use super::*;

	#[test]
	fn sizes() {
		assert_eq!(parse_size("1024"), Some(1024));
		assert_eq!(parse_size("4G"), Some(4 << 30));
		assert_eq!(parse_size("1kB"), Some(1000));
		assert_eq!(parse_size("2.5K"), Some(2560));
		assert_eq!(parse_size("1x"), None);
		assert_eq!(parse_size(""), None);
	}
}

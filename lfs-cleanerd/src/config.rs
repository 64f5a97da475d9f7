use std::{io::Result as IoResult, path::Path, time::Duration};

use log::LevelFilter;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/rlfs_cleanerd.conf";

/// Hard upper bound on segments cleaned per pass.
pub const MAX_NSEGMENTS_PER_CLEAN: usize = 32;

/// A keyword takes at most this many arguments.
const MAX_ARGS: usize = 15;

/// A threshold that may be given as a plain count, a byte size, or a
/// percentage of the relevant total.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
	Count(u64),
	Bytes(u64),
	Percent(f64),
}

impl Value {
	/// Resolves to a number of segments.
	pub fn segments(&self, nsegments: u64, segment_size: u64) -> u64 {
		match *self {
			Self::Count(n) => n,
			Self::Bytes(b) => b / segment_size,
			Self::Percent(p) => (nsegments as f64 * p / 100.0) as u64,
		}
	}

	/// Resolves to a number of blocks within one segment.
	pub fn blocks(&self, blocks_per_segment: u64, block_size: u64) -> u64 {
		match *self {
			Self::Count(n) => n,
			Self::Bytes(b) => b / block_size,
			Self::Percent(p) => (blocks_per_segment as f64 * p / 100.0) as u64,
		}
	}
}

/// Victim selection policy. Only `timestamp` exists: importance is the
/// segment's last modification time, oldest first. A non-zero threshold
/// excludes segments whose importance exceeds it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectionPolicy {
	pub threshold: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
	pub protection_period: Duration,
	pub min_clean_segments: Value,
	pub max_clean_segments: Value,
	pub clean_check_interval: Duration,
	pub selection_policy: SelectionPolicy,
	pub nsegments_per_clean: usize,
	pub mc_nsegments_per_clean: usize,
	pub cleaning_interval: Duration,
	pub mc_cleaning_interval: Duration,
	pub retry_interval: Duration,
	pub use_mmap: bool,
	pub use_set_suinfo: bool,
	pub min_reclaimable_blocks: Value,
	pub mc_min_reclaimable_blocks: Value,
	pub log_priority: LevelFilter,
}

impl Default for Config {
	fn default() -> Self {
		Self {
			protection_period: Duration::from_secs(3600),
			min_clean_segments: Value::Percent(10.0),
			max_clean_segments: Value::Percent(20.0),
			clean_check_interval: Duration::from_secs(10),
			selection_policy: SelectionPolicy {
				threshold: 0,
			},
			nsegments_per_clean: 2,
			mc_nsegments_per_clean: 4,
			cleaning_interval: Duration::from_secs(5),
			mc_cleaning_interval: Duration::from_secs(1),
			retry_interval: Duration::from_secs(60),
			use_mmap: false,
			use_set_suinfo: false,
			min_reclaimable_blocks: Value::Percent(10.0),
			mc_min_reclaimable_blocks: Value::Percent(1.0),
			log_priority: LevelFilter::Info,
		}
	}
}

/// Seconds multiplier per duration suffix.
fn duration_unit(suffix: &str) -> Option<f64> {
	let mult = match suffix {
		"" | "s" => 1.0,
		"m" => 60.0,
		"h" => 3600.0,
		"d" => 86400.0,
		"w" => 604800.0,
		"M" => 2_592_000.0,  // 30 days
		"Y" => 31_536_000.0, // 365 days
		_ => return None,
	};
	Some(mult)
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

fn split_suffix(s: &str) -> (&str, &str) {
	let split = s
		.find(|c: char| !(c.is_ascii_digit() || c == '.'))
		.unwrap_or(s.len());
	s.split_at(split)
}

/// Parses a duration: bare (possibly fractional) seconds or a value with a
/// `s|m|h|d|w|M|Y` suffix.
pub fn parse_duration(s: &str) -> Option<Duration> {
	let (num, suffix) = split_suffix(s);
	let secs: f64 = num.parse().ok()?;
	let secs = secs * duration_unit(suffix)?;
	if !secs.is_finite() || secs < 0.0 {
		return None;
	}
	Some(Duration::from_secs_f64(secs))
}

/// Parses a count, a byte size with suffix, or a trailing-`%` percentage.
pub fn parse_size(s: &str) -> Option<Value> {
	if let Some(pct) = s.strip_suffix('%') {
		let p: f64 = pct.parse().ok()?;
		if !p.is_finite() || p < 0.0 {
			return None;
		}
		return Some(Value::Percent(p));
	}
	let (num, suffix) = split_suffix(s);
	if suffix.is_empty() {
		return num.parse().ok().map(Value::Count);
	}
	let n: f64 = num.parse().ok()?;
	let mult = size_unit(suffix)?;
	if !n.is_finite() || n < 0.0 {
		return None;
	}
	Some(Value::Bytes((n * mult as f64) as u64))
}

fn parse_priority(s: &str) -> Option<LevelFilter> {
	let lv = match s {
		"emerg" | "alert" | "crit" | "err" => LevelFilter::Error,
		"warning" => LevelFilter::Warn,
		"notice" | "info" => LevelFilter::Info,
		"debug" => LevelFilter::Debug,
		_ => return None,
	};
	Some(lv)
}

fn parse_bool(s: &str) -> Option<bool> {
	match s {
		"on" | "yes" | "true" | "1" => Some(true),
		"off" | "no" | "false" | "0" => Some(false),
		_ => None,
	}
}

pub fn load(path: &Path) -> IoResult<Config> {
	let text = std::fs::read_to_string(path)?;
	Ok(parse(&text))
}

/// Parses the configuration text. A malformed value keeps the previous
/// (default) setting and is reported, matching reload semantics where a
/// bad line must not take the daemon down.
pub fn parse(text: &str) -> Config {
	let mut c = Config::default();

	for (n, raw) in text.lines().enumerate() {
		let lineno = n + 1;
		let line = raw.split('#').next().unwrap_or("");
		let mut tokens = line.split_whitespace();
		let Some(keyword) = tokens.next() else {
			continue;
		};
		let args: Vec<&str> = tokens.take(MAX_ARGS).collect();
		let arg = args.first().copied().unwrap_or("");

		macro_rules! set {
			($field:ident, $parse:expr) => {
				match $parse {
					Some(v) => c.$field = v,
					None => log::warn!("line {lineno}: bad value '{arg}' for {keyword}"),
				}
			};
		}

		match keyword {
			"protection_period" => set!(protection_period, parse_duration(arg)),
			"min_clean_segments" => set!(min_clean_segments, parse_size(arg)),
			"max_clean_segments" => set!(max_clean_segments, parse_size(arg)),
			"clean_check_interval" => set!(clean_check_interval, parse_duration(arg)),
			"nsegments_per_clean" => set!(
				nsegments_per_clean,
				arg.parse().ok().map(|v: usize| v.min(MAX_NSEGMENTS_PER_CLEAN))
			),
			"mc_nsegments_per_clean" => set!(
				mc_nsegments_per_clean,
				arg.parse().ok().map(|v: usize| v.min(MAX_NSEGMENTS_PER_CLEAN))
			),
			"cleaning_interval" => set!(cleaning_interval, parse_duration(arg)),
			"mc_cleaning_interval" => set!(mc_cleaning_interval, parse_duration(arg)),
			"retry_interval" => set!(retry_interval, parse_duration(arg)),
			"use_mmap" => {
				c.use_mmap = args.is_empty() || parse_bool(arg).unwrap_or(true);
			}
			"use_set_suinfo" => {
				c.use_set_suinfo = args.is_empty() || parse_bool(arg).unwrap_or(true);
			}
			"min_reclaimable_blocks" => set!(min_reclaimable_blocks, parse_size(arg)),
			"mc_min_reclaimable_blocks" => set!(mc_min_reclaimable_blocks, parse_size(arg)),
			"log_priority" => set!(log_priority, parse_priority(arg)),
			"selection_policy" => {
				if arg != "timestamp" {
					log::warn!("line {lineno}: unknown selection policy '{arg}'");
					continue;
				}
				let threshold = match args.get(1) {
					Some(t) => match t.parse() {
						Ok(v) => v,
						Err(_) => {
							log::warn!("line {lineno}: bad policy threshold '{t}'");
							continue;
						}
					},
					None => 0,
				};
				c.selection_policy = SelectionPolicy {
					threshold,
				};
			}
			_ => log::warn!("line {lineno}: unknown keyword '{keyword}'"),
		}
	}
	c
}

#[cfg(test)]
mod t {
	use super::*;

	const SAMPLE: &str = "\
# cleaner configuration
protection_period	1h
min_clean_segments	10%
max_clean_segments	512MiB
clean_check_interval	60
selection_policy	timestamp	# policy
nsegments_per_clean	2
mc_nsegments_per_clean	100
cleaning_interval	0.1
retry_interval		5m
use_mmap
use_set_suinfo		on
min_reclaimable_blocks	10%
mc_min_reclaimable_blocks	1%
log_priority		debug

frobnicate		1	# not a keyword
";

	#[test]
	fn parses_sample() {
		let c = parse(SAMPLE);
		assert_eq!(c.protection_period, Duration::from_secs(3600));
		assert_eq!(c.min_clean_segments, Value::Percent(10.0));
		assert_eq!(c.max_clean_segments, Value::Bytes(512 << 20));
		assert_eq!(c.clean_check_interval, Duration::from_secs(60));
		assert_eq!(c.nsegments_per_clean, 2);
		// over the hard cap
		assert_eq!(c.mc_nsegments_per_clean, MAX_NSEGMENTS_PER_CLEAN);
		assert_eq!(c.cleaning_interval, Duration::from_millis(100));
		assert_eq!(c.retry_interval, Duration::from_secs(300));
		assert!(c.use_mmap);
		assert!(c.use_set_suinfo);
		assert_eq!(c.log_priority, LevelFilter::Debug);
	}

	#[test]
	fn reload_is_idempotent() {
		assert_eq!(parse(SAMPLE), parse(SAMPLE));
	}

	#[test]
	fn empty_input_yields_defaults() {
		assert_eq!(parse(""), Config::default());
		assert_eq!(parse("# only a comment\n\n"), Config::default());
	}

	#[test]
	fn durations() {
		assert_eq!(parse_duration("30"), Some(Duration::from_secs(30)));
		assert_eq!(parse_duration("2.5"), Some(Duration::from_secs_f64(2.5)));
		assert_eq!(parse_duration("10m"), Some(Duration::from_secs(600)));
		assert_eq!(parse_duration("1d"), Some(Duration::from_secs(86400)));
		assert_eq!(parse_duration("1w"), Some(Duration::from_secs(604800)));
		// capital M is months, lower-case m is minutes
		assert_eq!(parse_duration("1M"), Some(Duration::from_secs(2_592_000)));
		assert_eq!(parse_duration("1Y"), Some(Duration::from_secs(31_536_000)));
		assert_eq!(parse_duration("week"), None);
		assert_eq!(parse_duration("-4"), None);
	}

	#[test]
	fn sizes() {
		assert_eq!(parse_size("128"), Some(Value::Count(128)));
		assert_eq!(parse_size("1kB"), Some(Value::Bytes(1000)));
		assert_eq!(parse_size("1K"), Some(Value::Bytes(1024)));
		assert_eq!(parse_size("4MiB"), Some(Value::Bytes(4 << 20)));
		assert_eq!(parse_size("1E"), Some(Value::Bytes(1 << 60)));
		assert_eq!(parse_size("12.5%"), Some(Value::Percent(12.5)));
		assert_eq!(parse_size("12Q"), None);
	}

	#[test]
	fn value_resolution() {
		assert_eq!(Value::Percent(10.0).segments(1000, 1 << 20), 100);
		assert_eq!(Value::Bytes(8 << 20).segments(1000, 1 << 20), 8);
		assert_eq!(Value::Count(7).segments(1000, 1 << 20), 7);
		assert_eq!(Value::Percent(50.0).blocks(2048, 4096), 1024);
	}

	#[test]
	fn bad_values_keep_defaults() {
		let c = parse("protection_period	soon\nnsegments_per_clean many\n");
		assert_eq!(c, Config::default());
	}

	#[test]
	fn load_from_file() {
		use std::io::Write;

		let mut f = tempfile::NamedTempFile::new().unwrap();
		f.write_all(b"protection_period 120\nlog_priority err\n").unwrap();
		let c = load(f.path()).unwrap();
		assert_eq!(c.protection_period, Duration::from_secs(120));
		assert_eq!(c.log_priority, LevelFilter::Error);

		assert!(load(Path::new("/nonexistent/rlfs_cleanerd.conf")).is_err());
	}
}

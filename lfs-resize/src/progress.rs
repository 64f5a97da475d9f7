use std::io::{self, Write};

const CELLS: usize = 10;

/// Text progress bar on standard error: `label |****------| 12/34`.
/// Redrawn in place with backspaces; a log message printed mid-bar marks
/// it interrupted so the next update starts on a fresh line.
pub struct ProgressBar {
	label: String,
	max: u64,
	rendered: usize,
	interrupted: bool,
}

impl ProgressBar {
	pub fn new(label: &str, max: u64) -> Self {
		Self {
			label: label.to_string(),
			max,
			rendered: 0,
			interrupted: false,
		}
	}

	/// Call after writing unrelated output to stderr.
	pub fn interrupt(&mut self) {
		self.interrupted = true;
	}

	pub fn update(&mut self, pos: u64) {
		let pos = pos.min(self.max);
		let filled = if self.max == 0 {
			CELLS
		} else {
			(pos as usize * CELLS) / self.max as usize
		};
		let line = format!(
			"{} |{}{}| {}/{}",
			self.label,
			"*".repeat(filled),
			"-".repeat(CELLS - filled),
			pos,
			self.max
		);

		let mut err = io::stderr();
		if self.interrupted {
			let _ = writeln!(err);
			self.interrupted = false;
			self.rendered = 0;
		}
		let back = "\u{8}".repeat(self.rendered);
		let pad = self.rendered.saturating_sub(line.len());
		let _ = write!(err, "{back}{line}{}", " ".repeat(pad));
		let _ = err.flush();
		self.rendered = line.len().max(self.rendered);
	}

	pub fn finish(&mut self) {
		if self.rendered > 0 || self.interrupted {
			let _ = writeln!(io::stderr());
			self.rendered = 0;
		}
	}
}

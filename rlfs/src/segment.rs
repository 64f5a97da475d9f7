use std::fmt;

use crate::{
	data::*,
	decoder,
};

/// Why a summary walk stopped early. Segment payloads come straight off the
/// disk and may be arbitrarily damaged, so the iterators record the reason
/// and become "at end" instead of panicking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SummaryError {
	BadMagic,
	BadLength,
	BadChecksum,
	BadHeader,
}

impl fmt::Display for SummaryError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let s = match self {
			Self::BadMagic => "bad summary magic",
			Self::BadLength => "bad summary length",
			Self::BadChecksum => "summary checksum mismatch",
			Self::BadHeader => "malformed summary header",
		};
		f.write_str(s)
	}
}

fn read_u64(data: &[u8], off: usize) -> u64 {
	u64::from_le_bytes(data[off..off + 8].try_into().unwrap())
}

/// Byte offset of the next record of `size` bytes: summary records never
/// straddle a block boundary, so a record that would is pushed to the next
/// block.
fn record_offset(offset: usize, size: usize, block_size: usize) -> usize {
	if offset % block_size + size > block_size {
		(offset + block_size - 1) / block_size * block_size
	} else {
		offset
	}
}

/// A segment-sized byte buffer plus the geometry needed to interpret it.
/// `start_blocknr` is the disk block number of `data[0]`; for segment 0 the
/// buffer starts at `first_data_block`, not at block 0.
pub struct Segment<'a> {
	pub segnum: Segnum,
	pub start_blocknr: Blocknr,
	pub block_size: u32,
	pub crc_seed: u32,
	data: &'a [u8],
}

impl<'a> Segment<'a> {
	pub fn new(
		segnum: Segnum,
		start_blocknr: Blocknr,
		block_size: u32,
		crc_seed: u32,
		data: &'a [u8],
	) -> Self {
		assert_eq!(data.len() % block_size as usize, 0);
		Self {
			segnum,
			start_blocknr,
			block_size,
			crc_seed,
			data,
		}
	}

	pub fn nblocks(&self) -> u32 {
		(self.data.len() / self.block_size as usize) as u32
	}

	pub fn partial_segments(&self) -> PartialSegments<'a> {
		PartialSegments {
			data: self.data,
			block_size: self.block_size as usize,
			crc_seed: self.crc_seed,
			offset: 0,
			remaining: self.nblocks(),
			blocknr: self.start_blocknr,
			saw_logend: false,
			error: None,
		}
	}
}

/// Cursor over the logs (partial segments) of one segment.
pub struct PartialSegments<'a> {
	data: &'a [u8],
	block_size: usize,
	crc_seed: u32,
	offset: usize,
	remaining: u32,
	blocknr: Blocknr,
	saw_logend: bool,
	error: Option<SummaryError>,
}

impl<'a> PartialSegments<'a> {
	pub fn error(&self) -> Option<SummaryError> {
		self.error
	}

	fn fail(&mut self, e: SummaryError) -> Option<PartialSegment<'a>> {
		self.error = Some(e);
		self.remaining = 0;
		None
	}
}

impl<'a> Iterator for PartialSegments<'a> {
	type Item = PartialSegment<'a>;

	fn next(&mut self) -> Option<Self::Item> {
		if self.remaining < 1 || self.saw_logend {
			return None;
		}
		debug_assert_eq!(self.offset % self.block_size, 0);

		if self.offset + SUMMARY_HEADER_SIZE > self.data.len() {
			return self.fail(SummaryError::BadLength);
		}
		let header: SummaryHeader =
			match decoder::from_bytes(&self.data[self.offset..self.offset + SUMMARY_HEADER_SIZE]) {
				Ok(h) => h,
				Err(_) => return self.fail(SummaryError::BadHeader),
			};

		if header.magic != SUMMARY_MAGIC {
			return self.fail(SummaryError::BadMagic);
		}
		if header.nblocks < 1 || header.nblocks > self.remaining {
			return self.fail(SummaryError::BadLength);
		}
		let sumbytes = header.sumbytes as usize;
		if (header.bytes as usize) < SUMMARY_HEADER_SIZE
			|| sumbytes < header.bytes as usize
			|| sumbytes > header.nblocks as usize * self.block_size
		{
			return self.fail(SummaryError::BadLength);
		}

		let sum_area = &self.data[self.offset + SUMMARY_SUM_OFFSET..self.offset + sumbytes];
		if header.sumsum != crc32c::crc32c_append(self.crc_seed, sum_area) {
			return self.fail(SummaryError::BadChecksum);
		}

		let pseg = PartialSegment {
			data: self.data,
			block_size: self.block_size,
			offset: self.offset,
			blocknr: self.blocknr,
			header,
		};

		self.saw_logend = pseg.header.has(SS_LOGEND);
		self.offset += pseg.header.nblocks as usize * self.block_size;
		self.blocknr += pseg.header.nblocks as u64;
		self.remaining -= pseg.header.nblocks;
		Some(pseg)
	}
}

/// One log: a summary header plus the payload blocks it describes.
pub struct PartialSegment<'a> {
	data: &'a [u8],
	block_size: usize,
	offset: usize,
	pub blocknr: Blocknr,
	pub header: SummaryHeader,
}

impl<'a> PartialSegment<'a> {
	/// Number of blocks occupied by the summary itself.
	pub fn sum_blocks(&self) -> u32 {
		(self.header.sumbytes as usize).div_ceil(self.block_size) as u32
	}

	pub fn files(&self) -> FileRecords<'a> {
		FileRecords {
			data: self.data,
			block_size: self.block_size,
			offset: self.offset + self.header.bytes as usize,
			end: self.offset + self.header.sumbytes as usize,
			remaining: self.header.nfinfo,
			blocknr: self.blocknr + self.sum_blocks() as u64,
			error: None,
		}
	}
}

/// Cursor over the per-file records of one log.
pub struct FileRecords<'a> {
	data: &'a [u8],
	block_size: usize,
	offset: usize,
	end: usize,
	remaining: u32,
	blocknr: Blocknr,
	error: Option<SummaryError>,
}

impl<'a> FileRecords<'a> {
	pub fn error(&self) -> Option<SummaryError> {
		self.error
	}

	fn fail(&mut self, e: SummaryError) -> Option<FileRecord<'a>> {
		self.error = Some(e);
		self.remaining = 0;
		None
	}
}

impl<'a> Iterator for FileRecords<'a> {
	type Item = FileRecord<'a>;

	fn next(&mut self) -> Option<Self::Item> {
		if self.remaining == 0 {
			return None;
		}

		let offset = record_offset(self.offset, FINFO_SIZE, self.block_size);
		if offset + FINFO_SIZE > self.end {
			return self.fail(SummaryError::BadLength);
		}
		let finfo: Finfo = match decoder::from_bytes(&self.data[offset..offset + FINFO_SIZE]) {
			Ok(f) => f,
			Err(_) => return self.fail(SummaryError::BadHeader),
		};
		if finfo.ndatblk > finfo.nblocks {
			return self.fail(SummaryError::BadHeader);
		}

		let file = FileRecord {
			data: self.data,
			block_size: self.block_size,
			offset: offset + FINFO_SIZE,
			end: self.end,
			blocknr: self.blocknr,
			finfo,
		};

		// Skip over this file's binfo records to find the next finfo.
		let mut next = file.offset;
		for i in 0..finfo.nblocks {
			let size = binfo_size(finfo.ino, i < finfo.ndatblk);
			next = record_offset(next, size, self.block_size) + size;
		}
		if next > self.end {
			return self.fail(SummaryError::BadLength);
		}

		self.offset = next;
		self.blocknr += finfo.nblocks as u64;
		self.remaining -= 1;
		Some(file)
	}
}

fn binfo_size(ino: Ino, is_data: bool) -> usize {
	match (ino == DAT_INO, is_data) {
		(true, true) => BINFO_DAT_DATA_SIZE,
		(true, false) => BINFO_DAT_NODE_SIZE,
		(false, true) => BINFO_V_DATA_SIZE,
		(false, false) => BINFO_V_NODE_SIZE,
	}
}

/// One file's block run inside a log.
pub struct FileRecord<'a> {
	data: &'a [u8],
	block_size: usize,
	offset: usize,
	end: usize,
	/// Disk address of the file's first payload block in this log.
	pub blocknr: Blocknr,
	pub finfo: Finfo,
}

impl<'a> FileRecord<'a> {
	pub fn is_dat(&self) -> bool {
		self.finfo.ino == DAT_INO
	}

	pub fn blocks(&self) -> Blocks<'a> {
		Blocks {
			data: self.data,
			block_size: self.block_size,
			offset: self.offset,
			end: self.end,
			index: 0,
			finfo: self.finfo,
			blocknr: self.blocknr,
			error: None,
		}
	}
}

/// Block info record, decoded according to the owning file's kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Binfo {
	/// DAT data block.
	DatData { blkoff: u64 },
	/// DAT node (B-tree) block.
	DatNode { blkoff: u64, level: u64 },
	/// Data block of a regular file, addressed by virtual block number.
	Data { vblocknr: Blocknr, blkoff: u64 },
	/// Node block of a regular file.
	Node { vblocknr: Blocknr },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
	pub binfo: Binfo,
	/// Disk address of the payload block.
	pub blocknr: Blocknr,
	pub index: u32,
}

impl BlockInfo {
	pub fn is_data(&self) -> bool {
		matches!(self.binfo, Binfo::DatData { .. } | Binfo::Data { .. })
	}
}

/// Cursor over the `nblocks` block infos of one file record.
pub struct Blocks<'a> {
	data: &'a [u8],
	block_size: usize,
	offset: usize,
	end: usize,
	index: u32,
	finfo: Finfo,
	blocknr: Blocknr,
	error: Option<SummaryError>,
}

impl<'a> Blocks<'a> {
	pub fn error(&self) -> Option<SummaryError> {
		self.error
	}
}

impl<'a> Iterator for Blocks<'a> {
	type Item = BlockInfo;

	fn next(&mut self) -> Option<Self::Item> {
		if self.index >= self.finfo.nblocks {
			return None;
		}

		let is_data = self.index < self.finfo.ndatblk;
		let size = binfo_size(self.finfo.ino, is_data);
		let offset = record_offset(self.offset, size, self.block_size);
		if offset + size > self.end {
			self.error = Some(SummaryError::BadLength);
			self.index = self.finfo.nblocks;
			return None;
		}

		let binfo = match (self.finfo.ino == DAT_INO, is_data) {
			(true, true) => Binfo::DatData {
				blkoff: read_u64(self.data, offset),
			},
			(true, false) => Binfo::DatNode {
				blkoff: read_u64(self.data, offset),
				level: read_u64(self.data, offset + 8),
			},
			(false, true) => Binfo::Data {
				vblocknr: read_u64(self.data, offset),
				blkoff: read_u64(self.data, offset + 8),
			},
			(false, false) => Binfo::Node {
				vblocknr: read_u64(self.data, offset),
			},
		};

		let info = BlockInfo {
			binfo,
			blocknr: self.blocknr,
			index: self.index,
		};

		self.offset = offset + size;
		self.index += 1;
		self.blocknr += 1;
		Some(info)
	}
}

#[cfg(test)]
mod t {
	use super::*;
	use crate::decoder;

	const BS: u32 = 1024;
	const SEED: u32 = 0x1234_5678;

	struct FileSpec {
		ino: Ino,
		cno: Cno,
		/// (vblocknr or blkoff, blkoff or level) per block; data blocks first.
		blocks: Vec<(u64, u64)>,
		ndatblk: u32,
	}

	/// Lays out one log the way the segment constructor does: header, then
	/// finfo/binfo records subject to the no-straddle rule, padded to a
	/// whole number of blocks, followed by the payload blocks.
	fn build_log(seq: u64, flags: u16, files: &[FileSpec]) -> Vec<u8> {
		let bs = BS as usize;
		let mut sum = vec![0u8; SUMMARY_HEADER_SIZE];
		let mut npayload = 0u32;

		for f in files {
			let mut off = record_offset(sum.len(), FINFO_SIZE, bs);
			sum.resize(off, 0);
			let finfo = Finfo {
				ino: f.ino,
				cno: f.cno,
				nblocks: f.blocks.len() as u32,
				ndatblk: f.ndatblk,
			};
			sum.extend_from_slice(&decoder::to_bytes(&finfo).unwrap());

			for (i, &(a, b)) in f.blocks.iter().enumerate() {
				let is_data = (i as u32) < f.ndatblk;
				let size = binfo_size(f.ino, is_data);
				off = record_offset(sum.len(), size, bs);
				sum.resize(off, 0);
				sum.extend_from_slice(&a.to_le_bytes());
				if size == 16 {
					sum.extend_from_slice(&b.to_le_bytes());
				}
				npayload += 1;
			}
		}

		let sumbytes = sum.len() as u32;
		let sum_blocks = sum.len().div_ceil(bs) as u32;
		let nblocks = sum_blocks + npayload;
		let header = SummaryHeader {
			datasum: 0,
			sumsum: 0,
			magic: SUMMARY_MAGIC,
			bytes: SUMMARY_HEADER_SIZE as u16,
			flags,
			seq,
			created: 0,
			next: 0,
			nblocks,
			nfinfo: files.len() as u32,
			sumbytes,
			pad: 0,
		};
		sum[..SUMMARY_HEADER_SIZE].copy_from_slice(&decoder::to_bytes(&header).unwrap());
		let crc = crc32c::crc32c_append(SEED, &sum[SUMMARY_SUM_OFFSET..]);
		sum[4..8].copy_from_slice(&crc.to_le_bytes());

		sum.resize(nblocks as usize * bs, 0);
		sum
	}

	fn as_segment(data: &[u8]) -> Segment<'_> {
		Segment::new(7, 1000, BS, SEED, data)
	}

	#[test]
	fn single_log_regular_file() {
		let mut data = build_log(
			5,
			SS_LOGBGN | SS_LOGEND,
			&[FileSpec {
				ino: 20,
				cno: 9,
				blocks: vec![(101, 0), (102, 1), (201, 0)],
				ndatblk: 2,
			}],
		);
		data.resize(8 * BS as usize, 0);

		let seg = as_segment(&data);
		let mut psegs = seg.partial_segments();
		let pseg = psegs.next().unwrap();
		assert_eq!(pseg.header.seq, 5);
		assert_eq!(pseg.header.nblocks, 4); // 1 summary + 3 payload
		assert_eq!(pseg.blocknr, 1000);

		let mut files = pseg.files();
		let file = files.next().unwrap();
		assert!(!file.is_dat());
		assert_eq!(file.blocknr, 1001);

		let blocks: Vec<_> = file.blocks().collect();
		assert_eq!(
			blocks[0],
			BlockInfo {
				binfo: Binfo::Data {
					vblocknr: 101,
					blkoff: 0
				},
				blocknr: 1001,
				index: 0,
			}
		);
		assert!(blocks[1].is_data());
		assert_eq!(
			blocks[2],
			BlockInfo {
				binfo: Binfo::Node {
					vblocknr: 201
				},
				blocknr: 1003,
				index: 2,
			}
		);

		assert!(files.next().is_none());
		assert_eq!(files.error(), None);
		assert!(psegs.next().is_none());
		assert_eq!(psegs.error(), None);
	}

	#[test]
	fn dat_file_binfo_sizes() {
		let mut data = build_log(
			1,
			SS_LOGBGN | SS_LOGEND,
			&[FileSpec {
				ino: DAT_INO,
				cno: 0,
				blocks: vec![(40, 0), (41, 2)],
				ndatblk: 1,
			}],
		);
		data.resize(8 * BS as usize, 0);

		let seg = as_segment(&data);
		let pseg = seg.partial_segments().next().unwrap();
		let file = pseg.files().next().unwrap();
		assert!(file.is_dat());
		let blocks: Vec<_> = file.blocks().collect();
		assert_eq!(
			blocks[0].binfo,
			Binfo::DatData {
				blkoff: 40
			}
		);
		assert_eq!(
			blocks[1].binfo,
			Binfo::DatNode {
				blkoff: 41,
				level: 2
			}
		);
	}

	#[test]
	fn two_logs_then_stale_tail() {
		let log1 = build_log(
			8,
			SS_LOGBGN,
			&[FileSpec {
				ino: 21,
				cno: 3,
				blocks: vec![(11, 0)],
				ndatblk: 1,
			}],
		);
		let log2 = build_log(9, SS_LOGEND | SS_SR, &[]);
		let mut data = log1;
		data.extend_from_slice(&log2);
		// Stale bytes after the final log must not be interpreted.
		data.resize(16 * BS as usize, 0xaa);

		let seg = as_segment(&data);
		let mut psegs = seg.partial_segments();
		let nblocks: Vec<u32> = (&mut psegs).map(|p| p.header.nblocks).collect();
		assert_eq!(nblocks, vec![2, 1]);
		assert_eq!(psegs.error(), None);
	}

	#[test]
	fn checksum_mismatch_ends_iteration() {
		let mut data = build_log(
			1,
			SS_LOGBGN | SS_LOGEND,
			&[FileSpec {
				ino: 20,
				cno: 1,
				blocks: vec![(1, 0)],
				ndatblk: 1,
			}],
		);
		data[SUMMARY_HEADER_SIZE] ^= 0xff; // flip a summary byte past the header
		data.resize(8 * BS as usize, 0);

		let seg = as_segment(&data);
		let mut psegs = seg.partial_segments();
		assert!(psegs.next().is_none());
		assert_eq!(psegs.error(), Some(SummaryError::BadChecksum));
	}

	#[test]
	fn declared_length_beyond_segment() {
		let mut data = build_log(1, SS_LOGBGN | SS_LOGEND, &[]);
		data.resize(4 * BS as usize, 0);
		// Declare more blocks than the segment holds; fix the checksum so
		// only the length check can reject it.
		data[40..44].copy_from_slice(&100u32.to_le_bytes());
		let sumbytes = u32::from_le_bytes(data[48..52].try_into().unwrap()) as usize;
		let crc = crc32c::crc32c_append(SEED, &data[SUMMARY_SUM_OFFSET..sumbytes]);
		data[4..8].copy_from_slice(&crc.to_le_bytes());

		let seg = as_segment(&data);
		let mut psegs = seg.partial_segments();
		assert!(psegs.next().is_none());
		assert_eq!(psegs.error(), Some(SummaryError::BadLength));
	}

	#[test]
	fn summary_records_do_not_straddle_blocks() {
		// 58 16-byte data binfos fill bytes 80..1008 of the summary; the
		// next file's 24-byte finfo would span the first block boundary and
		// must be pushed to offset 1024.
		let blocks: Vec<(u64, u64)> = (0..58).map(|i| (1000 + i, i)).collect();
		let mut data = build_log(
			2,
			SS_LOGBGN | SS_LOGEND,
			&[
				FileSpec {
					ino: 20,
					cno: 4,
					blocks,
					ndatblk: 58,
				},
				FileSpec {
					ino: 21,
					cno: 4,
					blocks: vec![(5000, 0)],
					ndatblk: 1,
				},
			],
		);
		// The skipped tail of the first summary block is zero padding.
		assert!(data[1008..1024].iter().all(|&b| b == 0));
		data.resize(80 * BS as usize, 0);

		let seg = as_segment(&data);
		let pseg = seg.partial_segments().next().unwrap();
		assert_eq!(pseg.header.sumbytes, 1024 + 24 + 16);
		assert_eq!(pseg.sum_blocks(), 2);
		let files: Vec<_> = pseg.files().collect();
		assert_eq!(files.len(), 2);

		let first: Vec<_> = files[0].blocks().collect();
		assert_eq!(first.len(), 58);
		assert_eq!(
			first[57].binfo,
			Binfo::Data {
				vblocknr: 1057,
				blkoff: 57
			}
		);
		// Payload numbering accounts for the two summary blocks.
		assert_eq!(first[0].blocknr, 1000 + 2);

		let second: Vec<_> = files[1].blocks().collect();
		assert_eq!(
			second[0].binfo,
			Binfo::Data {
				vblocknr: 5000,
				blkoff: 0
			}
		);
		assert_eq!(second[0].blocknr, 1000 + 2 + 58);
	}
}

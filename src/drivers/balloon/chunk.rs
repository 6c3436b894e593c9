//! Run-length reporting of page sets.
//!
//! A chunk buffer starts with an optional kind specific prefix, followed by a
//! [`ChunkHeader`] and `chunks` times a [`PageChunk`]. All fields are little
//! endian.

use alloc::collections::TryReserveError;
use alloc::vec::Vec;
use core::ops::Range;

use zerocopy::little_endian::{U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use super::bitmap::{BitmapPool, for_each_run};
use super::range::PfnRange;
use super::unused::{MiscqCmd, MiscqFlags};
use super::vq::{BalloonVq, WaitMode};
use crate::config::{BalloonConfig, CHUNK_BASE_SHIFT, CHUNK_SIZE_SHIFT};
use crate::drivers::virtio::transport::Transport;
use crate::drivers::virtio::virtqueue::error::VirtqError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct ChunkHeader {
	/// Number of valid chunks following the header.
	pub chunks: U64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct PageChunk {
	pub base: U64,
	pub size: U64,
}

impl PageChunk {
	pub fn new(base_pfn: u64, pfns: u64) -> Self {
		Self {
			base: U64::new(base_pfn << CHUNK_BASE_SHIFT),
			size: U64::new(pfns << CHUNK_SIZE_SHIFT),
		}
	}

	pub fn base_pfn(&self) -> u64 {
		self.base.get() >> CHUNK_BASE_SHIFT
	}

	pub fn pfns(&self) -> u64 {
		self.size.get() >> CHUNK_SIZE_SHIFT
	}
}

/// Header of every message on the misc queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct MiscqHeader {
	pub cmd: U16,
	pub flags: U16,
	pub reserved: U32,
}

impl MiscqHeader {
	pub fn new(cmd: MiscqCmd, flags: MiscqFlags) -> Self {
		Self {
			cmd: U16::new(cmd.into()),
			flags: U16::new(flags.bits()),
			reserved: U32::new(0),
		}
	}
}

/// What a chunk buffer describes and what precedes its [`ChunkHeader`].
pub(crate) trait ChunkKind {
	fn write_prefix(&self, buf: &mut Vec<u8>);
}

/// Pages entering or leaving the balloon.
#[derive(Debug, Default)]
pub(crate) struct BalloonChunks;

impl ChunkKind for BalloonChunks {
	fn write_prefix(&self, _buf: &mut Vec<u8>) {}
}

/// Free memory reported in answer to a misc queue inquiry.
#[derive(Debug)]
pub(crate) struct UnusedChunks {
	pub cmd: MiscqCmd,
	pub flags: MiscqFlags,
}

impl ChunkKind for UnusedChunks {
	fn write_prefix(&self, buf: &mut Vec<u8>) {
		buf.extend_from_slice(MiscqHeader::new(self.cmd, self.flags).as_bytes());
	}
}

/// Chunk descriptors collected for one queue, flushed when full.
#[derive(Debug)]
pub(crate) struct ChunkBatch<K> {
	kind: K,
	chunks: Vec<PageChunk>,
	max_chunks: usize,
}

impl<K: ChunkKind> ChunkBatch<K> {
	pub fn try_new(kind: K, max_chunks: usize) -> Result<Self, TryReserveError> {
		let mut chunks = Vec::new();
		chunks.try_reserve_exact(max_chunks)?;

		Ok(Self {
			kind,
			chunks,
			max_chunks,
		})
	}

	pub fn kind_mut(&mut self) -> &mut K {
		&mut self.kind
	}

	pub fn len(&self) -> usize {
		self.chunks.len()
	}

	pub fn is_empty(&self) -> bool {
		self.chunks.is_empty()
	}

	/// Appends a chunk and flushes with [`WaitMode::Blocking`] once the batch
	/// is full.
	pub fn push(
		&mut self,
		vq: &mut BalloonVq,
		transport: &dyn Transport,
		base_pfn: u64,
		pfns: u64,
	) -> Result<(), VirtqError> {
		self.chunks.push(PageChunk::new(base_pfn, pfns));

		if self.chunks.len() >= self.max_chunks {
			trace!("<balloon> Chunk buffer full, flushing {} chunks", self.len());
			self.flush(vq, transport, WaitMode::Blocking)?;
		}

		Ok(())
	}

	/// Sends the collected chunks and starts over.
	///
	/// The chunks are dropped even if the queue is broken.
	pub fn flush(
		&mut self,
		vq: &mut BalloonVq,
		transport: &dyn Transport,
		mode: WaitMode,
	) -> Result<(), VirtqError> {
		let Self { kind, chunks, .. } = self;

		let res = vq.send(
			transport,
			|buf| {
				kind.write_prefix(buf);
				let header = ChunkHeader {
					chunks: U64::new(chunks.len() as u64),
				};
				buf.extend_from_slice(header.as_bytes());
				buf.extend_from_slice(chunks.as_slice().as_bytes());
			},
			mode,
		);
		chunks.clear();

		res
	}
}

/// Reports a batch of pages through bitmap windows and balloon chunks.
#[derive(Debug)]
pub(crate) struct ChunkEncoder {
	range: PfnRange,
	bitmap: BitmapPool,
	batch: ChunkBatch<BalloonChunks>,
}

impl ChunkEncoder {
	pub fn try_new(config: &BalloonConfig) -> Result<Self, TryReserveError> {
		Ok(Self {
			range: PfnRange::new(),
			bitmap: BitmapPool::try_new(config.bitmap_window_bytes, config.max_bitmap_windows)?,
			batch: ChunkBatch::try_new(BalloonChunks, config.max_chunks)?,
		})
	}

	pub fn begin(&mut self) {
		self.range.reset();
	}

	pub fn track(&mut self, first: u64, count: u64) {
		self.range.update(first, count);
	}

	/// Tells the host about every page of the batch.
	///
	/// `pages` holds the first balloon PFN of each page, every page covers
	/// `pfns_per_page` PFNs.
	pub fn report(
		&mut self,
		vq: &mut BalloonVq,
		transport: &dyn Transport,
		pages: &[u64],
		pfns_per_page: u64,
	) -> Result<(), VirtqError> {
		let Some(span) = self.range.aligned(u64::from(u64::BITS)) else {
			return Ok(());
		};

		self.bitmap.extend_for(span.end - span.start);
		trace!(
			"<balloon> Reporting PFNs {:#x}..{:#x} with {} bitmap windows",
			span.start,
			span.end,
			self.bitmap.len()
		);

		let res = self.report_passes(vq, transport, span, pages, pfns_per_page);
		self.bitmap.release_extended();
		res
	}

	fn report_passes(
		&mut self,
		vq: &mut BalloonVq,
		transport: &dyn Transport,
		span: Range<u64>,
		pages: &[u64],
		pfns_per_page: u64,
	) -> Result<(), VirtqError> {
		let mut start = span.start;

		while start < span.end {
			let stop = (start + self.bitmap.pass_bits()).min(span.end);
			self.bitmap.clear();

			let mut found = false;
			for &first in pages {
				let lo = first.max(start);
				let hi = (first + pfns_per_page).min(stop);
				for pfn in lo..hi {
					self.bitmap.set(pfn - start);
					found = true;
				}
			}

			if found {
				let window_bits = self.bitmap.window_bits();
				for (i, window) in self.bitmap.windows().enumerate() {
					let base = start + i as u64 * window_bits;
					for_each_run(window, |run, len| {
						self.batch.push(vq, transport, base + run, len)
					})?;
				}

				if !self.batch.is_empty() {
					self.batch.flush(vq, transport, WaitMode::Blocking)?;
				}
			}

			start = stop;
		}

		Ok(())
	}

	/// Reports a single page immediately.
	pub fn report_one(
		&mut self,
		vq: &mut BalloonVq,
		transport: &dyn Transport,
		first: u64,
		pfns_per_page: u64,
	) -> Result<(), VirtqError> {
		self.batch.push(vq, transport, first, pfns_per_page)?;
		if self.batch.is_empty() {
			return Ok(());
		}
		self.batch.flush(vq, transport, WaitMode::Blocking)
	}
}

#[cfg(test)]
mod tests {
	use alloc::collections::BTreeSet;
	use alloc::vec;

	use super::*;
	use crate::drivers::balloon::test::{MockDevice, decode_chunks, decode_unused};
	use crate::drivers::virtio::virtqueue::VqIndex;

	fn encoder(window_bytes: usize, max_windows: usize, max_chunks: usize) -> ChunkEncoder {
		ChunkEncoder::try_new(&BalloonConfig {
			bitmap_window_bytes: window_bytes,
			max_bitmap_windows: max_windows,
			max_chunks,
			..BalloonConfig::default()
		})
		.unwrap()
	}

	fn report(enc: &mut ChunkEncoder, dev: &MockDevice, pages: &[u64], k: u64) {
		let mut vq = BalloonVq::new(VqIndex::from(0u16), 64);
		enc.begin();
		for &page in pages {
			enc.track(page, k);
		}
		enc.report(&mut vq, dev, pages, k).unwrap();
	}

	fn all_chunks(dev: &MockDevice) -> Vec<(u64, u64)> {
		dev.submissions(0)
			.iter()
			.flat_map(|buf| decode_chunks(buf))
			.collect()
	}

	#[test]
	fn wire_layout() {
		assert_eq!(size_of::<ChunkHeader>(), 8);
		assert_eq!(size_of::<PageChunk>(), 16);
		assert_eq!(size_of::<MiscqHeader>(), 8);

		let chunk = PageChunk::new(0x10, 3);
		assert_eq!(chunk.as_bytes()[..8], (0x10u64 << 12).to_le_bytes());
		assert_eq!(chunk.as_bytes()[8..], (3u64 << 12).to_le_bytes());
		assert_eq!((chunk.base_pfn(), chunk.pfns()), (0x10, 3));
	}

	#[test]
	fn empty_batch_sends_nothing() {
		let dev = MockDevice::new(0);
		let mut enc = encoder(8, 4, 16);
		report(&mut enc, &dev, &[], 1);
		assert!(dev.submissions(0).is_empty());
	}

	#[test]
	fn single_pfn_is_one_chunk() {
		let dev = MockDevice::new(0);
		let mut enc = encoder(8, 4, 16);
		report(&mut enc, &dev, &[77], 1);
		assert_eq!(dev.submissions(0).len(), 1);
		assert_eq!(all_chunks(&dev), [(77, 1)]);
	}

	#[test]
	fn full_window_is_one_chunk() {
		let dev = MockDevice::new(0);
		let mut enc = encoder(8, 4, 16);
		let pages: Vec<u64> = (64..128).collect();
		report(&mut enc, &dev, &pages, 1);
		assert_eq!(all_chunks(&dev), [(64, 64)]);
	}

	#[test]
	fn run_across_windows_splits() {
		let dev = MockDevice::new(0);
		let mut enc = encoder(8, 4, 16);
		// Four pages of K = 2 covering PFNs 60..68
		report(&mut enc, &dev, &[60, 62, 64, 66], 2);
		assert_eq!(dev.submissions(0).len(), 1);
		assert_eq!(all_chunks(&dev), [(60, 4), (64, 4)]);
		assert_eq!(enc.bitmap.len(), 1);
	}

	#[test]
	fn multi_pass_round_trip() {
		let dev = MockDevice::new(0);
		// One window of 64 PFNs, so a span of 1000 PFNs needs many passes.
		let mut enc = encoder(8, 1, 8);
		let pages: Vec<u64> = (0..1000).filter(|pfn| pfn % 7 < 3 || pfn % 64 == 63).collect();
		report(&mut enc, &dev, &pages, 1);

		let mut decoded = BTreeSet::new();
		for (base, size) in all_chunks(&dev) {
			for pfn in base..base + size {
				assert!(decoded.insert(pfn), "PFN {pfn} reported twice");
			}
		}
		assert_eq!(decoded, pages.iter().copied().collect::<BTreeSet<_>>());
		assert!(dev.submissions(0).len() > 1);
	}

	#[test]
	fn multi_page_round_trip_in_one_pass() {
		let dev = MockDevice::new(0);
		let mut enc = encoder(1024, 32, 4096);
		let k = 16;
		let pages = [0x1000, 0x1010, 0x1040, 0x2000, 0x2030];
		report(&mut enc, &dev, &pages, k);

		let expected: BTreeSet<u64> = pages.iter().flat_map(|&p| p..p + k).collect();
		let decoded: BTreeSet<u64> = all_chunks(&dev)
			.into_iter()
			.flat_map(|(base, size)| base..base + size)
			.collect();
		assert_eq!(decoded, expected);
		assert_eq!(dev.submissions(0).len(), 1);
	}

	#[test]
	fn cap_forces_one_mid_scan_flush() {
		let dev = MockDevice::new(0);
		let mut enc = encoder(8, 4, 4);
		report(&mut enc, &dev, &[1, 3, 5, 7, 9], 1);

		let subs = dev.submissions(0);
		assert_eq!(subs.len(), 2);
		assert_eq!(decode_chunks(&subs[0]), [(1, 1), (3, 1), (5, 1), (7, 1)]);
		assert_eq!(decode_chunks(&subs[1]), [(9, 1)]);
		assert!(enc.batch.is_empty());
	}

	#[test]
	fn unused_prefix() {
		let dev = MockDevice::new(0);
		let mut vq = BalloonVq::new(VqIndex::from(3u16), 64);
		let mut batch = ChunkBatch::try_new(
			UnusedChunks {
				cmd: MiscqCmd::InquireUnusedPages,
				flags: MiscqFlags::empty(),
			},
			8,
		)
		.unwrap();
		batch.push(&mut vq, &dev, 0x40, 8).unwrap();
		batch.kind_mut().flags |= MiscqFlags::COMPLETE;
		batch.flush(&mut vq, &dev, WaitMode::Busy).unwrap();

		let subs = dev.submissions(3);
		assert_eq!(subs.len(), 1);
		let (header, chunks) = decode_unused(&subs[0]);
		assert_eq!(header.cmd.get(), 0);
		assert!(MiscqFlags::from_bits_retain(header.flags.get()).contains(MiscqFlags::COMPLETE));
		assert_eq!(chunks, vec![(0x40, 8)]);
	}
}

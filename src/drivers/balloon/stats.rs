//! Guest memory statistics reported on the stats queue.
//!
//! The host drives this queue: it returns the buffer whenever it wants fresh
//! numbers, and the driver answers by sending the buffer again.

use alloc::vec::Vec;

use num_enum::{IntoPrimitive, TryFromPrimitive};
use zerocopy::little_endian::{U16, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use super::vq::BalloonVq;
use crate::drivers::virtio::transport::Transport;
use crate::drivers::virtio::virtqueue::VqIndex;
use crate::drivers::virtio::virtqueue::error::VirtqError;
use crate::mm::PageGeometry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u16)]
pub enum StatTag {
	SwapIn = 0,
	SwapOut = 1,
	MajorFaults = 2,
	MinorFaults = 3,
	MemFree = 4,
	MemTotal = 5,
	Available = 6,
}

pub const NR_STATS: usize = 7;

/// One tagged value on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct BalloonStat {
	pub tag: U16,
	pub val: U64,
}

/// Counters of the guest, page counts in allocator pages.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MemoryStats {
	pub swap_in_pages: u64,
	pub swap_out_pages: u64,
	pub major_faults: u64,
	pub minor_faults: u64,
	pub free_pages: u64,
	pub total_pages: u64,
	pub available_pages: u64,
}

/// Supplies the counters forwarded to the host.
pub trait StatsSource: Send + Sync {
	fn memory_stats(&self) -> MemoryStats;
}

/// A fixed snapshot.
impl StatsSource for MemoryStats {
	fn memory_stats(&self) -> MemoryStats {
		*self
	}
}

fn encode(stats: &MemoryStats, geometry: PageGeometry, buf: &mut Vec<u8>) {
	let bytes = |pages| geometry.pages_to_bytes(pages);
	let entries = [
		(StatTag::SwapIn, bytes(stats.swap_in_pages)),
		(StatTag::SwapOut, bytes(stats.swap_out_pages)),
		(StatTag::MajorFaults, stats.major_faults),
		(StatTag::MinorFaults, stats.minor_faults),
		(StatTag::MemFree, bytes(stats.free_pages)),
		(StatTag::MemTotal, bytes(stats.total_pages)),
		(StatTag::Available, bytes(stats.available_pages)),
	];

	for (tag, val) in entries {
		let stat = BalloonStat {
			tag: U16::new(tag.into()),
			val: U64::new(val),
		};
		buf.extend_from_slice(stat.as_bytes());
	}
}

#[derive(Debug)]
pub(crate) struct StatsQueue {
	vq: BalloonVq,
}

impl StatsQueue {
	pub fn new(index: VqIndex) -> Self {
		Self {
			vq: BalloonVq::new(index, NR_STATS * size_of::<BalloonStat>()),
		}
	}

	/// Sends fresh statistics if the host handed the buffer back.
	///
	/// Returns whether a buffer was sent.
	pub fn refresh(
		&mut self,
		transport: &dyn Transport,
		source: &dyn StatsSource,
		geometry: PageGeometry,
	) -> Result<bool, VirtqError> {
		let stats = source.memory_stats();
		self.vq
			.post(transport, |buf| encode(&stats, geometry, buf))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::drivers::balloon::test::{MockDevice, decode_stats};

	const STATS: MemoryStats = MemoryStats {
		swap_in_pages: 1,
		swap_out_pages: 2,
		major_faults: 3,
		minor_faults: 4,
		free_pages: 5,
		total_pages: 6,
		available_pages: 7,
	};

	#[test]
	fn encodes_seven_tagged_values() {
		let geometry = PageGeometry::new(12).unwrap();
		let mut buf = Vec::new();
		encode(&STATS, geometry, &mut buf);

		assert_eq!(size_of::<BalloonStat>(), 10);
		assert_eq!(buf.len(), NR_STATS * 10);
		assert_eq!(
			decode_stats(&buf),
			[
				(0, 4096),
				(1, 8192),
				(2, 3),
				(3, 4),
				(4, 5 * 4096),
				(5, 6 * 4096),
				(6, 7 * 4096)
			]
		);
		assert!(matches!(StatTag::try_from(6u16), Ok(StatTag::Available)));
		assert!(StatTag::try_from(7u16).is_err());
	}

	#[test]
	fn waits_for_the_host_to_return_the_buffer() {
		let dev = MockDevice::new(0);
		dev.set_auto_ack(2, false);
		let geometry = PageGeometry::new(12).unwrap();
		let mut statsq = StatsQueue::new(VqIndex::from(2u16));

		assert!(statsq.refresh(&dev, &STATS, geometry).unwrap());
		assert!(!statsq.refresh(&dev, &STATS, geometry).unwrap());
		assert_eq!(dev.submissions(2).len(), 1);

		dev.ack_all(2);
		assert!(statsq.refresh(&dev, &STATS, geometry).unwrap());
		assert_eq!(dev.submissions(2).len(), 2);
	}
}

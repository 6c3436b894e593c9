use core::ops::Range;

/// Lowest and highest balloon PFN touched by the current batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PfnRange {
	min: u64,
	/// Exclusive.
	max: u64,
}

impl PfnRange {
	pub const fn new() -> Self {
		Self {
			min: u64::MAX,
			max: 0,
		}
	}

	pub fn reset(&mut self) {
		*self = Self::new();
	}

	/// Widens the range to include `count` PFNs starting at `first`.
	pub fn update(&mut self, first: u64, count: u64) {
		self.min = self.min.min(first);
		self.max = self.max.max(first + count);
	}

	pub fn is_empty(&self) -> bool {
		self.min >= self.max
	}

	/// The touched span with both ends rounded outwards to a multiple of `align`.
	pub fn aligned(&self, align: u64) -> Option<Range<u64>> {
		if self.is_empty() {
			return None;
		}

		let start = self.min - self.min % align;
		let end = self.max.next_multiple_of(align);
		Some(start..end)
	}
}

//! Simulated page allocator for the driver tests.

use alloc::collections::{BTreeMap, BTreeSet};
use alloc::vec::Vec;

use hermit_sync::SpinMutex;

use super::{AllocError, FreeBlockClass, Page, PageAllocator};

pub(crate) struct TestAllocator {
	page_shift: u32,
	zones: usize,
	max_order: u32,
	migrate_types: usize,
	inner: SpinMutex<Inner>,
}

struct Inner {
	next_pfn: u64,
	/// Pages left before allocations fail, `None` for unlimited.
	budget: Option<usize>,
	/// Previously released frames, handed out again first.
	recycled: Vec<u64>,
	outstanding: BTreeSet<u64>,
	released: Vec<u64>,
	managed_delta: i64,
	free_lists: BTreeMap<FreeBlockClass, Vec<u64>>,
}

impl TestAllocator {
	pub fn new(page_shift: u32) -> Self {
		Self {
			page_shift,
			zones: 1,
			max_order: 11,
			migrate_types: 3,
			inner: SpinMutex::new(Inner {
				next_pfn: 0x100,
				budget: None,
				recycled: Vec::new(),
				outstanding: BTreeSet::new(),
				released: Vec::new(),
				managed_delta: 0,
				free_lists: BTreeMap::new(),
			}),
		}
	}

	pub fn with_zones(mut self, zones: usize, max_order: u32, migrate_types: usize) -> Self {
		self.zones = zones;
		self.max_order = max_order;
		self.migrate_types = migrate_types;
		self
	}

	/// First frame handed out by the bump pointer.
	pub fn with_base(self, pfn: u64) -> Self {
		self.inner.lock().next_pfn = pfn;
		self
	}

	pub fn set_budget(&self, budget: Option<usize>) {
		self.inner.lock().budget = budget;
	}

	/// Queues frames that are handed out before the bump pointer is used.
	pub fn push_frames(&self, pfns: &[u64]) {
		let mut inner = self.inner.lock();
		inner.recycled.extend(pfns.iter().rev());
	}

	pub fn add_free_block(&self, class: FreeBlockClass, pfn: u64) {
		let mut inner = self.inner.lock();
		let list = inner.free_lists.entry(class).or_default();
		list.push(pfn);
		list.sort_unstable();
	}

	pub fn outstanding(&self) -> usize {
		self.inner.lock().outstanding.len()
	}

	pub fn released(&self) -> Vec<u64> {
		self.inner.lock().released.clone()
	}

	pub fn managed_delta(&self) -> i64 {
		self.inner.lock().managed_delta
	}

	/// Hands out a page outside the balloon, as compaction would for a
	/// migration target.
	pub fn take_page(&self) -> Page {
		self.allocate_page().unwrap()
	}
}

impl PageAllocator for TestAllocator {
	fn page_shift(&self) -> u32 {
		self.page_shift
	}

	fn allocate_page(&self) -> Result<Page, AllocError> {
		let mut inner = self.inner.lock();
		if let Some(budget) = inner.budget.as_mut() {
			if *budget == 0 {
				return Err(AllocError);
			}
			*budget -= 1;
		}

		let pfn = match inner.recycled.pop() {
			Some(pfn) => pfn,
			None => {
				let pfn = inner.next_pfn;
				inner.next_pfn += 1;
				pfn
			}
		};
		assert!(inner.outstanding.insert(pfn), "frame {pfn:#x} handed out twice");
		Ok(Page::new(pfn))
	}

	fn release_page(&self, page: Page) {
		let mut inner = self.inner.lock();
		assert!(
			inner.outstanding.remove(&page.pfn()),
			"{page:?} was not allocated"
		);
		inner.released.push(page.pfn());
	}

	fn adjust_managed_page_count(&self, _page: &Page, delta: i64) {
		self.inner.lock().managed_delta += delta;
	}

	fn populated_zones(&self) -> usize {
		self.zones
	}

	fn max_order(&self) -> u32 {
		self.max_order
	}

	fn migrate_types(&self) -> usize {
		self.migrate_types
	}

	fn next_free_block(&self, class: FreeBlockClass, after: Option<u64>) -> Option<u64> {
		let inner = self.inner.lock();
		inner
			.free_lists
			.get(&class)?
			.iter()
			.copied()
			.find(|pfn| after.is_none_or(|after| *pfn > after))
	}
}

#[cfg(not(target_os = "none"))]
#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn budget_and_recycling() {
		let alloc = TestAllocator::new(12).with_base(0x10);
		alloc.set_budget(Some(2));
		let a = alloc.allocate_page().unwrap();
		let b = alloc.allocate_page().unwrap();
		assert_eq!((a.pfn(), b.pfn()), (0x10, 0x11));
		assert_eq!(alloc.allocate_page().unwrap_err(), AllocError);

		alloc.release_page(a);
		alloc.set_budget(None);
		alloc.push_frames(&[0x40, 0x41]);
		assert_eq!(alloc.allocate_page().unwrap().pfn(), 0x40);
		assert_eq!(alloc.allocate_page().unwrap().pfn(), 0x41);
		assert_eq!(alloc.outstanding(), 3);
		assert_eq!(alloc.released(), [0x10]);
	}

	#[test]
	fn free_block_cursor() {
		let alloc = TestAllocator::new(12);
		let class = FreeBlockClass {
			zone: 0,
			order: 3,
			migrate_type: 1,
		};
		alloc.add_free_block(class, 0x200);
		alloc.add_free_block(class, 0x100);

		assert_eq!(alloc.next_free_block(class, None), Some(0x100));
		assert_eq!(alloc.next_free_block(class, Some(0x100)), Some(0x200));
		assert_eq!(alloc.next_free_block(class, Some(0x200)), None);
		assert_eq!(
			alloc.next_free_block(
				FreeBlockClass {
					migrate_type: 0,
					..class
				},
				None
			),
			None
		);
	}
}

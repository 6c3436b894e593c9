//! Interface to the kernel's physical page allocator.
//!
//! The balloon never maps or touches the memory it takes. It only needs page
//! frames handed out by the allocator, the ability to give them back, and a
//! read-only view of the allocator's free lists when the host asks which
//! memory is unused.

use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::fmt;

use hermit_sync::SpinMutex;
use thiserror::Error;

#[cfg(test)]
pub(crate) mod test;

/// The device always addresses memory in 4 KiB frames.
pub const BALLOON_PFN_SHIFT: u32 = 12;

/// One page handed out by the [`PageAllocator`].
///
/// A `Page` is an owned token. It cannot be cloned, so a frame is either held
/// by its allocator, by the balloon, or by a compaction caller, never twice.
pub struct Page {
	pfn: u64,
}

impl Page {
	/// Creates the token for the allocator page frame `pfn`.
	///
	/// Only the allocator owning the frame should construct it.
	pub const fn new(pfn: u64) -> Self {
		Self { pfn }
	}

	/// Page frame number in allocator page units.
	pub const fn pfn(&self) -> u64 {
		self.pfn
	}
}

impl fmt::Debug for Page {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "Page({:#x})", self.pfn)
	}
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("page allocator is exhausted")]
pub struct AllocError;

/// Selects one free list of the allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FreeBlockClass {
	pub zone: usize,
	pub order: u32,
	pub migrate_type: usize,
}

/// The kernel's page allocator as seen by the balloon.
pub trait PageAllocator: Send + Sync {
	/// log2 of the allocator page size. Must be at least [`BALLOON_PFN_SHIFT`].
	fn page_shift(&self) -> u32;

	/// Hands out one page without waking any OOM machinery.
	fn allocate_page(&self) -> Result<Page, AllocError>;

	/// Takes back a page previously returned by [`Self::allocate_page`].
	fn release_page(&self, page: Page);

	/// Adds `delta` to the number of pages the allocator considers usable.
	fn adjust_managed_page_count(&self, _page: &Page, _delta: i64) {}

	/// Number of zones that contain memory. Zones are numbered from zero.
	fn populated_zones(&self) -> usize;

	/// Number of block orders, the largest block has order `max_order() - 1`.
	fn max_order(&self) -> u32;

	/// Number of migrate types per zone and order.
	fn migrate_types(&self) -> usize;

	/// Returns the first PFN of the next free block in `class` following the
	/// block starting at `after`, or the first block if `after` is `None`.
	///
	/// The walk is best effort. Blocks may be allocated or freed concurrently.
	fn next_free_block(&self, class: FreeBlockClass, after: Option<u64>) -> Option<u64>;
}

/// Conversion between allocator pages and balloon PFNs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageGeometry {
	page_shift: u32,
}

impl PageGeometry {
	/// Returns `None` if allocator pages are smaller than balloon pages.
	pub const fn new(page_shift: u32) -> Option<Self> {
		if page_shift < BALLOON_PFN_SHIFT || page_shift >= 64 {
			None
		} else {
			Some(Self { page_shift })
		}
	}

	pub const fn page_shift(&self) -> u32 {
		self.page_shift
	}

	/// Balloon PFNs per allocator page, called K throughout the driver.
	pub const fn pfns_per_page(&self) -> u64 {
		1 << (self.page_shift - BALLOON_PFN_SHIFT)
	}

	/// First balloon PFN covered by the allocator frame `pfn`.
	pub const fn balloon_pfn(&self, pfn: u64) -> u64 {
		pfn << (self.page_shift - BALLOON_PFN_SHIFT)
	}

	pub const fn pages_to_bytes(&self, pages: u64) -> u64 {
		pages << self.page_shift
	}
}

/// Something that can give memory back when the system runs out of it.
pub trait OomNotifier: Send + Sync {
	/// Releases memory and returns the number of balloon PFNs freed.
	fn notify_oom(&self) -> u64;
}

/// Prioritized list of OOM callbacks, owned by the embedding kernel.
///
/// Registered notifiers are held weakly, a dropped notifier is skipped.
pub struct OomNotifierChain {
	notifiers: SpinMutex<Vec<(i32, Weak<dyn OomNotifier>)>>,
}

impl OomNotifierChain {
	pub const fn new() -> Self {
		Self {
			notifiers: SpinMutex::new(Vec::new()),
		}
	}

	/// Higher priorities are called first.
	pub fn register(&self, priority: i32, notifier: Weak<dyn OomNotifier>) {
		let mut notifiers = self.notifiers.lock();
		let pos = notifiers
			.iter()
			.position(|(prio, _)| *prio < priority)
			.unwrap_or(notifiers.len());
		notifiers.insert(pos, (priority, notifier));
	}

	/// Returns whether `notifier` was registered.
	pub fn unregister(&self, notifier: &Weak<dyn OomNotifier>) -> bool {
		let mut notifiers = self.notifiers.lock();
		let len = notifiers.len();
		notifiers.retain(|(_, registered)| !Weak::ptr_eq(registered, notifier));
		notifiers.len() != len
	}

	pub fn len(&self) -> usize {
		self.notifiers.lock().len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Runs every live notifier and returns the total number of PFNs freed.
	pub fn call(&self) -> u64 {
		// Notifiers deflate the balloon, which may block on the host.
		let live: Vec<Arc<dyn OomNotifier>> = self
			.notifiers
			.lock()
			.iter()
			.filter_map(|(_, notifier)| notifier.upgrade())
			.collect();

		live.iter().map(|notifier| notifier.notify_oom()).sum()
	}
}

impl Default for OomNotifierChain {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use alloc::sync::Arc;
	use core::sync::atomic::{AtomicU64, Ordering};
	use std::sync::Mutex;

	use super::*;

	struct Recorder {
		id: u64,
		order: Arc<Mutex<Vec<u64>>>,
		calls: AtomicU64,
	}

	impl OomNotifier for Recorder {
		fn notify_oom(&self) -> u64 {
			self.order.lock().unwrap().push(self.id);
			self.calls.fetch_add(1, Ordering::Relaxed);
			self.id
		}
	}

	#[test]
	fn geometry() {
		assert!(PageGeometry::new(11).is_none());
		let small = PageGeometry::new(12).unwrap();
		assert_eq!(small.pfns_per_page(), 1);
		assert_eq!(small.balloon_pfn(0x1234), 0x1234);

		let large = PageGeometry::new(16).unwrap();
		assert_eq!(large.pfns_per_page(), 16);
		assert_eq!(large.balloon_pfn(3), 48);
		assert_eq!(large.pages_to_bytes(2), 2 << 16);
	}

	#[test]
	fn chain_calls_by_priority() {
		let order = Arc::new(Mutex::new(Vec::new()));
		let low = Arc::new(Recorder {
			id: 1,
			order: order.clone(),
			calls: AtomicU64::new(0),
		});
		let high = Arc::new(Recorder {
			id: 2,
			order: order.clone(),
			calls: AtomicU64::new(0),
		});

		let chain = OomNotifierChain::new();
		let low_weak: Weak<dyn OomNotifier> = Arc::downgrade(&low) as Weak<dyn OomNotifier>;
		let high_weak: Weak<dyn OomNotifier> = Arc::downgrade(&high) as Weak<dyn OomNotifier>;
		chain.register(10, low_weak.clone());
		chain.register(80, high_weak);

		assert_eq!(chain.call(), 3);
		assert_eq!(*order.lock().unwrap(), [2, 1]);

		assert!(chain.unregister(&low_weak));
		assert!(!chain.unregister(&low_weak));
		assert_eq!(chain.call(), 2);
		assert_eq!(low.calls.load(Ordering::Relaxed), 1);

		drop(high);
		assert_eq!(chain.call(), 0);
		assert_eq!(chain.len(), 1);
	}
}

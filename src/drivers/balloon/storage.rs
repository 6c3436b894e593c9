use alloc::vec::Vec;

use crate::mm::Page;

/// The pages currently surrendered to the host.
///
/// `num_pages` counts balloon PFNs and always equals
/// `K * (pages.len() + isolated)`.
#[derive(Debug)]
pub(crate) struct BalloonStorage {
	/// A stack of pages, the most recently inflated page leaves first.
	pages: Vec<Page>,
	/// Pages taken out by compaction that have not been migrated or put back.
	isolated: usize,
	num_pages: u64,
	migrated: u64,
}

impl BalloonStorage {
	pub const fn new() -> Self {
		Self {
			pages: Vec::new(),
			isolated: 0,
			num_pages: 0,
			migrated: 0,
		}
	}

	pub fn num_pages(&self) -> u64 {
		self.num_pages
	}

	pub fn isolated(&self) -> usize {
		self.isolated
	}

	pub fn migrated(&self) -> u64 {
		self.migrated
	}

	pub fn enqueue(&mut self, page: Page, pfns_per_page: u64) {
		self.pages.push(page);
		self.num_pages += pfns_per_page;
	}

	pub fn dequeue(&mut self, pfns_per_page: u64) -> Option<Page> {
		let page = self.pages.pop()?;
		self.num_pages -= pfns_per_page;
		Some(page)
	}

	/// Takes the page `pfn` off the list, it stays accounted for.
	pub fn isolate(&mut self, pfn: u64) -> Option<Page> {
		let pos = self.pages.iter().position(|page| page.pfn() == pfn)?;
		self.isolated += 1;
		Some(self.pages.remove(pos))
	}

	pub fn putback(&mut self, page: Page) {
		self.pages.push(page);
		self.isolated = self.isolated.saturating_sub(1);
	}

	/// Replaces an isolated page by `newpage`.
	pub fn insert_migrated(&mut self, newpage: Page) {
		self.pages.push(newpage);
		self.isolated = self.isolated.saturating_sub(1);
		self.migrated += 1;
	}

	pub fn is_consistent(&self, pfns_per_page: u64) -> bool {
		self.num_pages == pfns_per_page * (self.pages.len() + self.isolated) as u64
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn lifo_and_counter() {
		let mut storage = BalloonStorage::new();
		for pfn in 0..4 {
			storage.enqueue(Page::new(pfn), 16);
		}
		assert_eq!(storage.num_pages(), 64);

		assert_eq!(storage.dequeue(16).unwrap().pfn(), 3);
		assert_eq!(storage.dequeue(16).unwrap().pfn(), 2);
		assert_eq!(storage.num_pages(), 32);
		assert!(storage.is_consistent(16));
	}

	#[test]
	fn isolation_keeps_counter() {
		let mut storage = BalloonStorage::new();
		for pfn in 10..13 {
			storage.enqueue(Page::new(pfn), 1);
		}

		let page = storage.isolate(11).unwrap();
		assert!(storage.isolate(11).is_none());
		assert_eq!((storage.isolated(), storage.num_pages()), (1, 3));
		assert!(storage.is_consistent(1));

		storage.putback(page);
		assert_eq!(storage.isolated(), 0);
		assert!(storage.is_consistent(1));

		let _old = storage.isolate(10).unwrap();
		storage.insert_migrated(Page::new(99));
		assert_eq!(storage.num_pages(), 3);
		assert_eq!(storage.migrated(), 1);
		assert!(storage.is_consistent(1));
		assert_eq!(storage.dequeue(1).unwrap().pfn(), 99);
	}
}

//! Page migration for memory compaction.
//!
//! Compaction first isolates a page of the balloon, then either puts it back
//! or asks the driver to replace it by a page of its choice. The host learns
//! about the new page before it learns that the old one is gone.

use thiserror::Error;

use super::{Queue, VirtioBalloonDriver};
use crate::drivers::virtio::virtqueue::error::VirtqError;
use crate::mm::Page;

/// A balloon page taken off the ledger's list by compaction.
///
/// It still counts towards the balloon size until it is migrated or put back.
#[derive(Debug)]
pub struct IsolatedPage {
	page: Page,
}

impl IsolatedPage {
	pub fn pfn(&self) -> u64 {
		self.page.pfn()
	}
}

#[derive(Error, Debug)]
pub enum MigrateError {
	/// The balloon is busy inflating or deflating. Both pages are handed back
	/// unchanged.
	#[error("balloon is busy, try again later")]
	Again { newpage: Page, page: IsolatedPage },
	/// The host could not be told. The ledger holds the new page, the old
	/// page is handed back.
	#[error("failed to tell the host about the migration")]
	Broken { page: Page, source: VirtqError },
}

impl VirtioBalloonDriver {
	/// Takes the balloon page `pfn` off the ledger for compaction.
	pub fn isolate_page(&self, pfn: u64) -> Option<IsolatedPage> {
		let page = self.storage.lock().isolate(pfn)?;
		trace!("<balloon> Isolated {page:?}");
		Some(IsolatedPage { page })
	}

	/// Returns a page that was not migrated to the ledger.
	pub fn putback_page(&self, page: IsolatedPage) {
		trace!("<balloon> Putting back {:?}", page.page);
		self.storage.lock().putback(page.page);
	}

	/// Replaces the isolated `page` by `newpage`.
	///
	/// On success the old page is returned, it no longer belongs to the
	/// balloon.
	pub fn migrate_page(&self, newpage: Page, page: IsolatedPage) -> Result<Page, MigrateError> {
		// Compaction must not wait for a long running inflate or deflate.
		let Some(mut inner) = self.balloon_lock.try_lock() else {
			debug!(
				"<balloon> Balloon is locked, deferring migration of {:?}",
				page.page
			);
			return Err(MigrateError::Again { newpage, page });
		};

		let k = self.geometry.pfns_per_page();
		let new_pfn = self.geometry.balloon_pfn(newpage.pfn());
		let old_pfn = self.geometry.balloon_pfn(page.pfn());

		self.storage.lock().insert_migrated(newpage);

		let res = inner
			.tell_host_one(&*self.transport, Queue::Inflate, new_pfn, k)
			.and_then(|()| inner.tell_host_one(&*self.transport, Queue::Deflate, old_pfn, k));
		drop(inner);

		let IsolatedPage { page } = page;
		match res {
			Ok(()) => {
				debug!("<balloon> Migrated PFN {old_pfn:#x} to {new_pfn:#x}");
				Ok(page)
			}
			Err(source) => {
				error!("<balloon> Failed to migrate PFN {old_pfn:#x} to {new_pfn:#x}: {source}");
				Err(MigrateError::Broken { page, source })
			}
		}
	}
}

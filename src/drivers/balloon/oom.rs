use core::sync::atomic::Ordering;

use super::{F, VirtioBalloonDriver};
use crate::mm::OomNotifier;

/// Out of memory callback that recovers memory previously returned to the
/// host.
///
/// Every notification deflates the balloon by [`VirtioBalloonDriver::oom_pages`]
/// balloon PFNs, or by as many as there are, and publishes the new size. The
/// allocator may call the chain again if the memory freed was not enough.
///
/// The driver only deflates if the host allowed it by offering
/// [`F::DEFLATE_ON_OOM`].
impl OomNotifier for VirtioBalloonDriver {
	fn notify_oom(&self) -> u64 {
		if !self.dev_cfg.features.contains(F::DEFLATE_ON_OOM) {
			return 0;
		}

		let Some(mut inner) = self.balloon_lock.try_lock() else {
			error!(
				"<balloon:oom> Driver was locked while the system ran out of memory. Unable to deflate balloon"
			);
			return 0;
		};

		let num = u64::from(self.oom_pages.load(Ordering::Relaxed));
		warn!("<balloon:oom> Encountered OOM, attempting to deflate {num} PFNs to recover...");

		let freed = match self.leak_balloon(&mut inner, num) {
			Ok(freed) => freed,
			Err(err) => {
				error!("<balloon:oom> Unable to deflate balloon: {err}");
				0
			}
		};
		drop(inner);

		self.update_balloon_size();
		freed
	}
}

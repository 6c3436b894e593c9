use alloc::sync::Arc;
use core::future;
use core::task::Poll;

use crate::drivers::balloon::{VirtioBalloonDriver, WorkStatus};

/// Processes the balloon's queued work until the driver is removed.
///
/// `now_ms` supplies a monotonic clock in milliseconds.
pub async fn balloon_run(driver: Arc<VirtioBalloonDriver>, now_ms: impl Fn() -> u64) {
	future::poll_fn(|cx| {
		driver.register_waker(cx.waker());

		match driver.run_pending_work(now_ms()) {
			WorkStatus::Stopped => Poll::Ready(()),
			WorkStatus::Ran => {
				// More work may be queued, come back soon.
				cx.waker().wake_by_ref();
				Poll::Pending
			}
			WorkStatus::Busy => {
				debug!(
					"Balloon driver was polled while the driver was locked elsewhere, doing nothing"
				);
				Poll::Pending
			}
			WorkStatus::Idle | WorkStatus::Deferred { .. } => Poll::Pending,
		}
	})
	.await;
}

#[cfg(test)]
mod tests {
	use core::pin::pin;
	use core::sync::atomic::{AtomicU64, Ordering};
	use core::task::{Context, Waker};

	use super::*;
	use crate::drivers::balloon::F;
	use crate::drivers::balloon::test::Harness;
	use crate::mm::test::TestAllocator;

	#[test]
	fn runs_until_removed() {
		let h = Harness::new(F::VERSION_1, TestAllocator::new(12));
		let clock = AtomicU64::new(0);
		let mut task = pin!(balloon_run(h.driver.clone(), || clock.load(Ordering::Relaxed)));
		let mut cx = Context::from_waker(Waker::noop());

		assert!(task.as_mut().poll(&mut cx).is_pending());

		h.dev.set_target(64);
		h.driver.config_changed();
		assert!(task.as_mut().poll(&mut cx).is_pending());
		assert_eq!(h.dev.actual(), 64);

		h.alloc.set_budget(Some(0));
		h.dev.set_target(128);
		h.driver.config_changed();
		assert!(task.as_mut().poll(&mut cx).is_pending());
		assert_eq!(
			h.driver.run_pending_work(0),
			WorkStatus::Deferred { until_ms: 200 }
		);

		h.alloc.set_budget(None);
		clock.store(200, Ordering::Relaxed);
		assert!(task.as_mut().poll(&mut cx).is_pending());
		assert_eq!(h.dev.actual(), 128);

		h.driver.remove();
		assert!(task.as_mut().poll(&mut cx).is_ready());
		assert_eq!(h.alloc.outstanding(), 0);
	}
}

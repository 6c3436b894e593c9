//! Virtio traditional memory balloon driver.

use alloc::boxed::Box;
use alloc::collections::TryReserveError;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};
use core::task::Waker;

use bitflags::bitflags;
use hermit_sync::{SpinMutex, TicketMutex};
use thiserror::Error;

use self::chunk::ChunkEncoder;
use self::stats::StatsQueue;
use self::storage::BalloonStorage;
use self::unused::MiscQueue;
use self::vq::BalloonVq;
use super::Driver;
use super::virtio::transport::Transport;
use super::virtio::virtqueue::VqIndex;
use super::virtio::virtqueue::error::VirtqError;
use crate::config::{BalloonConfig, ConfigError, OOM_NOTIFY_PRIORITY};
use crate::mm::{OomNotifier, OomNotifierChain, PageAllocator, PageGeometry};

mod bitmap;
pub mod chunk;
pub mod migrate;
pub mod oom;
mod range;
pub mod stats;
mod storage;
pub mod unused;
pub mod vq;

pub use self::migrate::{IsolatedPage, MigrateError};
pub use self::stats::{MemoryStats, StatTag, StatsSource};
pub use self::vq::WaitMode;

bitflags! {
	/// Feature bits of the balloon device.
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub struct F: u64 {
		/// Deflated pages may only be used after the host was told.
		const MUST_TELL_HOST = 1 << 0;
		const STATS_VQ = 1 << 1;
		/// Deflate on out of memory.
		const DEFLATE_ON_OOM = 1 << 2;
		/// Page sets are reported as chunks instead of PFN arrays.
		const BALLOON_CHUNKS = 1 << 3;
		const MISC_VQ = 1 << 4;
		const VERSION_1 = 1 << 32;
	}
}

const INFLATEQ: u16 = 0;
const DEFLATEQ: u16 = 1;

/// Byte offsets in the device configuration space.
const NUM_PAGES_OFFSET: usize = 0;
const ACTUAL_OFFSET: usize = 4;

/// Errors that can occur during the lifetime and initialization of the [`VirtioBalloonDriver`]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VirtioBalloonError {
	/// The device did not accept the negotiated features at the last step of negotiation.
	#[error("device {device_id:#x} did not accept the negotiated features")]
	FeatureNegotiationFailed { device_id: u16 },
	/// Allocator pages smaller than the 4 KiB device pages.
	#[error("unsupported allocator page shift {page_shift}")]
	UnsupportedPageSize { page_shift: u32 },
	/// The mandatory PFN array could not be allocated.
	#[error("unable to allocate the PFN array: {0}")]
	NoMemory(#[from] TryReserveError),
	#[error(transparent)]
	Queue(#[from] VirtqError),
	#[error(transparent)]
	Config(#[from] ConfigError),
}

/// A wrapper struct for the device configuration space.
///
/// Legacy devices store the fields little endian, modern devices in the
/// byte order of the transport.
#[derive(Debug)]
struct BalloonDevCfg {
	dev_id: u16,
	features: F,
}

impl BalloonDevCfg {
	fn read(&self, transport: &dyn Transport, offset: usize) -> u32 {
		let raw = transport.read_config_u32(offset);
		if self.features.contains(F::VERSION_1) {
			raw
		} else {
			u32::from_le(raw)
		}
	}

	/// Requested balloon size in balloon PFNs.
	fn num_pages(&self, transport: &dyn Transport) -> u32 {
		self.read(transport, NUM_PAGES_OFFSET)
	}

	fn actual(&self, transport: &dyn Transport) -> u32 {
		self.read(transport, ACTUAL_OFFSET)
	}

	fn set_actual(&self, transport: &dyn Transport, num_pages: u32) {
		let raw = if self.features.contains(F::VERSION_1) {
			num_pages
		} else {
			num_pages.to_le()
		};
		transport.write_config_u32(ACTUAL_OFFSET, raw);
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Queue {
	Inflate,
	Deflate,
}

/// Flat array of 32 bit balloon PFNs for devices without chunk support.
#[derive(Debug)]
struct PfnArray {
	pfns: Vec<u32>,
	/// Allocator pages per round.
	max_pages: usize,
}

impl PfnArray {
	fn try_new(max_pages: usize, pfns_per_page: u64) -> Result<Self, TryReserveError> {
		// Saturates so that oversized arrays fail the reservation.
		let len = max_pages.saturating_mul(pfns_per_page as usize);
		let mut pfns = Vec::new();
		pfns.try_reserve_exact(len)?;

		Ok(Self { pfns, max_pages })
	}

	fn push_page(&mut self, first: u64, pfns_per_page: u64) {
		// Legacy PFNs are 32 bit, the balloon can't address memory above 16 TiB.
		self.pfns
			.extend((first..first + pfns_per_page).map(|pfn| pfn as u32));
	}

	fn send(&self, vq: &mut BalloonVq, transport: &dyn Transport) -> Result<(), VirtqError> {
		if self.pfns.is_empty() {
			return Ok(());
		}

		vq.send(
			transport,
			|buf| {
				for pfn in &self.pfns {
					buf.extend_from_slice(&pfn.to_le_bytes());
				}
			},
			WaitMode::Blocking,
		)
	}
}

#[derive(Debug)]
enum PfnEncoder {
	Array(PfnArray),
	Chunks(ChunkEncoder),
}

/// Everything guarded by the balloon lock.
#[derive(Debug)]
struct BalloonInner {
	inflateq: BalloonVq,
	deflateq: BalloonVq,
	encoder: PfnEncoder,
	/// First balloon PFN of every page of the current chunk batch.
	batch: Vec<u64>,
}

impl BalloonInner {
	/// Allocator pages one batch may hold.
	fn max_batch_pages(&self) -> usize {
		match &self.encoder {
			PfnEncoder::Array(array) => array.max_pages,
			PfnEncoder::Chunks(_) => usize::MAX,
		}
	}

	fn begin_batch(&mut self) {
		self.batch.clear();
		match &mut self.encoder {
			PfnEncoder::Array(array) => array.pfns.clear(),
			PfnEncoder::Chunks(chunks) => chunks.begin(),
		}
	}

	fn track(&mut self, first: u64, pfns_per_page: u64) {
		match &mut self.encoder {
			PfnEncoder::Array(array) => array.push_page(first, pfns_per_page),
			PfnEncoder::Chunks(chunks) => {
				chunks.track(first, pfns_per_page);
				self.batch.push(first);
			}
		}
	}

	/// Reports the current batch on `queue` and waits for the host.
	fn tell_host(
		&mut self,
		transport: &dyn Transport,
		queue: Queue,
		pfns_per_page: u64,
	) -> Result<(), VirtqError> {
		let Self {
			inflateq,
			deflateq,
			encoder,
			batch,
		} = self;
		let vq = match queue {
			Queue::Inflate => inflateq,
			Queue::Deflate => deflateq,
		};

		match encoder {
			PfnEncoder::Array(array) => array.send(vq, transport),
			PfnEncoder::Chunks(chunks) => chunks.report(vq, transport, batch, pfns_per_page),
		}
	}

	/// Reports the single page starting at balloon PFN `first`.
	fn tell_host_one(
		&mut self,
		transport: &dyn Transport,
		queue: Queue,
		first: u64,
		pfns_per_page: u64,
	) -> Result<(), VirtqError> {
		let Self {
			inflateq,
			deflateq,
			encoder,
			..
		} = self;
		let vq = match queue {
			Queue::Inflate => inflateq,
			Queue::Deflate => deflateq,
		};

		match encoder {
			PfnEncoder::Array(array) => {
				array.pfns.clear();
				array.push_page(first, pfns_per_page);
				array.send(vq, transport)
			}
			PfnEncoder::Chunks(chunks) => chunks.report_one(vq, transport, first, pfns_per_page),
		}
	}
}

/// Progress of the size negotiation.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum SizeState {
	#[default]
	Idle,
	Growing,
	Shrinking,
}

/// Outcome of [`VirtioBalloonDriver::run_pending_work`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkStatus {
	/// Nothing queued.
	Idle,
	/// One item was processed, more may be queued.
	Ran,
	/// Size work is queued but backs off until the given time.
	Deferred { until_ms: u64 },
	/// Another caller is processing work.
	Busy,
	/// The driver is being removed.
	Stopped,
}

/// Result of one inflate round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FillResult {
	/// Balloon PFNs added.
	pub inflated: u64,
	/// The allocator ran out of pages.
	pub exhausted: bool,
}

#[derive(Debug, Default)]
struct WorkQueue {
	stop_update: bool,
	size_pending: bool,
	stats_pending: bool,
	not_before_ms: u64,
	state: SizeState,
	waker: Option<Waker>,
}

enum Job {
	Stats,
	Size,
}

/// Virtio traditional memory balloon driver.
///
/// The host writes the requested balloon size into the configuration space
/// and signals a configuration change. The driver then inflates by taking
/// pages from the [`PageAllocator`] and reporting them on the inflate queue, or
/// deflates by reporting pages on the deflate queue and handing them back.
/// Size changes are processed as queued work by
/// [`executor::balloon::balloon_run`](crate::executor::balloon::balloon_run),
/// one bounded round at a time.
///
/// The balloon lock serializes inflation, deflation, migration and OOM
/// deflation. Migration and OOM deflation only try the lock.
pub struct VirtioBalloonDriver {
	dev_cfg: BalloonDevCfg,
	transport: Box<dyn Transport>,
	allocator: Arc<dyn PageAllocator>,
	stats_source: Box<dyn StatsSource>,
	geometry: PageGeometry,
	backoff_ms: u64,
	oom_pages: AtomicU32,
	oom_chain: Arc<OomNotifierChain>,
	oom_notifier: SpinMutex<Option<Weak<dyn OomNotifier>>>,

	balloon_lock: TicketMutex<BalloonInner>,
	storage: SpinMutex<BalloonStorage>,
	statsq: SpinMutex<Option<StatsQueue>>,
	miscq: TicketMutex<Option<MiscQueue>>,

	work: SpinMutex<WorkQueue>,
	/// Held while a work item runs.
	worker: TicketMutex<()>,
}

impl VirtioBalloonDriver {
	/// Initializes the device in adherence to specification.
	///
	/// See Virtio specification v1.2. - 3.1.1
	///                      and v1.2. - 5.5.5
	///
	/// The driver registers itself with `oom_chain` and queues size work if
	/// the host already requested a balloon.
	pub fn probe(
		transport: Box<dyn Transport>,
		allocator: Arc<dyn PageAllocator>,
		stats_source: Box<dyn StatsSource>,
		oom_chain: Arc<OomNotifierChain>,
		config: BalloonConfig,
	) -> Result<Arc<Self>, VirtioBalloonError> {
		let page_shift = allocator.page_shift();
		let geometry = PageGeometry::new(page_shift)
			.ok_or(VirtioBalloonError::UnsupportedPageSize { page_shift })?;
		config.validate()?;
		let dev_id = transport.dev_id();

		// Reset
		transport.reset_dev();

		// Indicate device, that OS noticed it
		transport.ack_dev();

		// Indicate device, that driver is able to handle it
		transport.set_drv();

		let mut features = F::from_bits_truncate(transport.dev_features());

		// Features whose buffers cannot be reserved are dropped before FEATURES_OK.
		let k = geometry.pfns_per_page();
		let chunks = features
			.contains(F::BALLOON_CHUNKS)
			.then(|| ChunkEncoder::try_new(&config));
		let encoder = match chunks {
			Some(Ok(chunks)) => PfnEncoder::Chunks(chunks),
			Some(Err(err)) => {
				warn!("<balloon> Unable to allocate chunk buffers ({err}), using PFN arrays");
				features.remove(F::BALLOON_CHUNKS);
				PfnEncoder::Array(PfnArray::try_new(config.array_pages, k)?)
			}
			None => PfnEncoder::Array(PfnArray::try_new(config.array_pages, k)?),
		};

		let mut next_index = DEFLATEQ + 1;
		let mut statsq = None;
		if features.contains(F::STATS_VQ) {
			statsq = Some(StatsQueue::new(VqIndex::from(next_index)));
			next_index += 1;
		}
		let mut miscq = None;
		if features.contains(F::MISC_VQ) {
			match MiscQueue::try_new(VqIndex::from(next_index), &config) {
				Ok(queue) => miscq = Some(queue),
				Err(err) => {
					warn!("<balloon> Unable to allocate misc queue buffers ({err}), disabling it");
					features.remove(F::MISC_VQ);
				}
			}
		}

		transport.set_drv_features(features.bits());

		// Indicates the device, that the current feature set is final for the driver
		// and will not be changed.
		transport.features_ok();

		// Checks if the device has accepted final set. This finishes feature negotiation.
		if transport.check_features() {
			info!(
				"<balloon> Features have been negotiated between device {dev_id:x} and driver: {features:?}"
			);
		} else {
			return Err(VirtioBalloonError::FeatureNegotiationFailed { device_id: dev_id });
		}

		transport.setup_vq(VqIndex::from(INFLATEQ))?;
		transport.setup_vq(VqIndex::from(DEFLATEQ))?;
		if statsq.is_some() {
			transport.setup_vq(VqIndex::from(DEFLATEQ + 1))?;
		}
		if miscq.is_some() {
			transport.setup_vq(VqIndex::from(next_index))?;
		}

		// The host pulls statistics by returning this buffer.
		if let Some(statsq) = statsq.as_mut() {
			statsq.refresh(&*transport, &*stats_source, geometry)?;
		}
		if let Some(queue) = miscq.as_mut() {
			if let Err(err) = queue.post_header(&*transport) {
				warn!("<balloon> Unable to post misc queue buffer ({err}), disabling it");
				features.remove(F::MISC_VQ);
				miscq = None;
			}
		}

		// At this point the device is "live"
		transport.drv_ok();

		infoheader!(" VIRTIO BALLOON ");
		infoentry!("Device", "{:#x}", dev_id);
		infoentry!("Features", "{:?}", features);
		infoentry!("Page size", "{} B, {k} PFNs per page", geometry.pages_to_bytes(1));
		infoentry!(
			"Encoding",
			if features.contains(F::BALLOON_CHUNKS) {
				"chunks"
			} else {
				"PFN arrays"
			}
		);
		infofooter!();

		let driver = Arc::new(Self {
			dev_cfg: BalloonDevCfg { dev_id, features },
			transport,
			allocator,
			stats_source,
			geometry,
			backoff_ms: config.backoff_ms,
			oom_pages: AtomicU32::new(config.oom_pages),
			oom_chain,
			oom_notifier: SpinMutex::new(None),
			balloon_lock: TicketMutex::new(BalloonInner {
				inflateq: BalloonVq::new(VqIndex::from(INFLATEQ), 0),
				deflateq: BalloonVq::new(VqIndex::from(DEFLATEQ), 0),
				encoder,
				batch: Vec::new(),
			}),
			storage: SpinMutex::new(BalloonStorage::new()),
			statsq: SpinMutex::new(statsq),
			miscq: TicketMutex::new(miscq),
			work: SpinMutex::new(WorkQueue::default()),
			worker: TicketMutex::new(()),
		});

		let notifier: Weak<dyn OomNotifier> = Arc::downgrade(&driver) as Weak<dyn OomNotifier>;
		driver
			.oom_chain
			.register(OOM_NOTIFY_PRIORITY, notifier.clone());
		*driver.oom_notifier.lock() = Some(notifier);

		if driver.towards_target() != 0 {
			driver.config_changed();
		}

		Ok(driver)
	}

	pub fn features(&self) -> F {
		self.dev_cfg.features
	}

	pub fn geometry(&self) -> PageGeometry {
		self.geometry
	}

	/// Balloon PFNs currently held, isolated pages included.
	pub fn num_pages(&self) -> u64 {
		self.storage.lock().num_pages()
	}

	pub fn isolated_pages(&self) -> usize {
		self.storage.lock().isolated()
	}

	/// Pages replaced by compaction so far.
	pub fn migrated_pages(&self) -> u64 {
		self.storage.lock().migrated()
	}

	pub fn size_state(&self) -> SizeState {
		self.work.lock().state
	}

	/// Balloon PFNs released per OOM notification.
	pub fn oom_pages(&self) -> u32 {
		self.oom_pages.load(Ordering::Relaxed)
	}

	pub fn set_oom_pages(&self, num: u32) {
		self.oom_pages.store(num, Ordering::Relaxed);
	}

	fn deflate_on_oom(&self) -> bool {
		self.dev_cfg.features.contains(F::DEFLATE_ON_OOM)
	}

	/// Balloon PFNs missing to the host's target, negative if the balloon is
	/// too large.
	///
	/// The target is rounded up to whole allocator pages.
	pub fn towards_target(&self) -> i64 {
		let target = u64::from(self.dev_cfg.num_pages(&*self.transport))
			.next_multiple_of(self.geometry.pfns_per_page());
		let num_pages = self.num_pages();
		target as i64 - num_pages as i64
	}

	/// Publishes the current balloon size to the host.
	pub fn update_balloon_size(&self) {
		let num_pages = u32::try_from(self.num_pages()).unwrap_or(u32::MAX);
		trace!("<balloon> Setting new actual balloon size of {num_pages} PFNs");
		self.dev_cfg.set_actual(&*self.transport, num_pages);
	}

	/// The size last published with [`Self::update_balloon_size`].
	pub fn actual(&self) -> u32 {
		self.dev_cfg.actual(&*self.transport)
	}

	/// Inflates by up to `num` balloon PFNs, rounded down to whole pages.
	pub fn inflate(&self, num: u64) -> Result<FillResult, VirtioBalloonError> {
		let mut inner = self.balloon_lock.lock();
		self.fill_balloon(&mut inner, num)
	}

	/// Deflates by up to `num` balloon PFNs and returns how many were released.
	pub fn deflate(&self, num: u64) -> Result<u64, VirtioBalloonError> {
		let mut inner = self.balloon_lock.lock();
		self.leak_balloon(&mut inner, num)
	}

	fn fill_balloon(
		&self,
		inner: &mut BalloonInner,
		num: u64,
	) -> Result<FillResult, VirtioBalloonError> {
		let k = self.geometry.pfns_per_page();
		let wanted = usize::try_from(num / k)
			.unwrap_or(usize::MAX)
			.min(inner.max_batch_pages());

		trace!("<balloon> Attempting to inflate by {wanted} pages");

		inner.begin_batch();
		let mut inflated = 0;
		let mut exhausted = false;

		for _ in 0..wanted {
			let page = match self.allocator.allocate_page() {
				Ok(page) => page,
				Err(err) => {
					debug!(
						"<balloon> Failed to allocate as many pages as requested ({err}), continuing with {}",
						inflated / k
					);
					exhausted = true;
					break;
				}
			};

			inner.track(self.geometry.balloon_pfn(page.pfn()), k);
			if !self.deflate_on_oom() {
				self.allocator.adjust_managed_page_count(&page, -1);
			}
			self.storage.lock().enqueue(page, k);
			inflated += k;
		}

		if inflated > 0 {
			// On failure the pages stay in the balloon, the host may own them.
			inner.tell_host(&*self.transport, Queue::Inflate, k)?;
		}

		trace!("<balloon> Done inflating {inflated} PFNs");

		Ok(FillResult {
			inflated,
			exhausted,
		})
	}

	fn leak_balloon(&self, inner: &mut BalloonInner, num: u64) -> Result<u64, VirtioBalloonError> {
		let k = self.geometry.pfns_per_page();
		let wanted = usize::try_from(num / k)
			.unwrap_or(usize::MAX)
			.min(inner.max_batch_pages());

		trace!("<balloon> Attempting to deflate by {wanted} pages");

		inner.begin_batch();
		let mut pages = Vec::new();
		{
			let mut storage = self.storage.lock();
			while pages.len() < wanted {
				let Some(page) = storage.dequeue(k) else {
					break;
				};
				inner.track(self.geometry.balloon_pfn(page.pfn()), k);
				pages.push(page);
			}
			debug_assert!(storage.is_consistent(k));
		}

		if pages.is_empty() {
			return Ok(0);
		}

		// The host is told even without MUST_TELL_HOST.
		if let Err(err) = inner.tell_host(&*self.transport, Queue::Deflate, k) {
			error!("<balloon> Failed to deflate {} pages: {err}", pages.len());
			let mut storage = self.storage.lock();
			for page in pages.into_iter().rev() {
				storage.enqueue(page, k);
			}
			return Err(err.into());
		}

		let deflated = pages.len() as u64 * k;
		for page in pages {
			if !self.deflate_on_oom() {
				self.allocator.adjust_managed_page_count(&page, 1);
			}
			self.allocator.release_page(page);
		}

		trace!("<balloon> Done deflating {deflated} PFNs");

		Ok(deflated)
	}

	/// Registers the task to wake when work is queued.
	pub fn register_waker(&self, waker: &Waker) {
		let mut work = self.work.lock();
		if !work
			.waker
			.as_ref()
			.is_some_and(|registered| registered.will_wake(waker))
		{
			work.waker = Some(waker.clone());
		}
	}

	fn queue_work(&self, queue: impl FnOnce(&mut WorkQueue)) {
		let waker = {
			let mut work = self.work.lock();
			if work.stop_update {
				return;
			}
			queue(&mut work);
			work.waker.clone()
		};

		if let Some(waker) = waker {
			waker.wake();
		}
	}

	/// The host changed the configuration space, usually the target size.
	pub fn config_changed(&self) {
		trace!("<balloon> Configuration changed");
		self.queue_work(|work| work.size_pending = true);
	}

	/// The host returned the statistics buffer.
	pub fn stats_request(&self) {
		if !self.dev_cfg.features.contains(F::STATS_VQ) {
			return;
		}
		self.queue_work(|work| work.stats_pending = true);
	}

	/// The host posted a command on the misc queue.
	///
	/// Answers right away, the host waits for the response.
	pub fn handle_misc_command(&self) -> bool {
		let mut miscq = self.miscq.lock();
		let Some(queue) = miscq.as_mut() else {
			return false;
		};

		match queue.handle(&*self.transport, &*self.allocator, self.geometry) {
			Ok(handled) => handled,
			Err(err) => {
				error!("<balloon:miscq> Unable to repost command buffer: {err}");
				false
			}
		}
	}

	/// Runs one queued work item. Statistics are served before size changes.
	pub fn run_pending_work(&self, now_ms: u64) -> WorkStatus {
		let Some(_worker) = self.worker.try_lock() else {
			return WorkStatus::Busy;
		};

		let job = {
			let mut work = self.work.lock();
			if work.stop_update {
				return WorkStatus::Stopped;
			}

			if work.stats_pending {
				work.stats_pending = false;
				Job::Stats
			} else if work.size_pending {
				if now_ms < work.not_before_ms {
					return WorkStatus::Deferred {
						until_ms: work.not_before_ms,
					};
				}
				work.size_pending = false;
				Job::Size
			} else {
				return WorkStatus::Idle;
			}
		};

		match job {
			Job::Stats => self.stats_handle_request(),
			Job::Size => self.update_balloon_size_step(now_ms),
		}

		WorkStatus::Ran
	}

	fn stats_handle_request(&self) {
		let mut statsq = self.statsq.lock();
		let Some(statsq) = statsq.as_mut() else {
			return;
		};

		match statsq.refresh(&*self.transport, &*self.stats_source, self.geometry) {
			Ok(true) => trace!("<balloon> Sent statistics"),
			Ok(false) => debug!("<balloon> Host still holds the statistics buffer"),
			Err(err) => error!("<balloon> Unable to send statistics: {err}"),
		}
	}

	/// One round of the size negotiation.
	fn update_balloon_size_step(&self, now_ms: u64) {
		let diff = self.towards_target();
		if diff == 0 {
			self.work.lock().state = SizeState::Idle;
			return;
		}

		debug!("<balloon> Size change requested: {diff:+} PFNs");

		let mut inner = self.balloon_lock.lock();
		let res = if diff > 0 {
			self.work.lock().state = SizeState::Growing;
			self.fill_balloon(&mut inner, diff.unsigned_abs())
				.map(|fill| (diff - fill.inflated as i64, fill.exhausted))
		} else {
			self.work.lock().state = SizeState::Shrinking;
			self.leak_balloon(&mut inner, diff.unsigned_abs())
				.map(|deflated| (diff + deflated as i64, false))
		};
		drop(inner);

		self.update_balloon_size();

		let mut work = self.work.lock();
		match res {
			Ok((0, _)) => work.state = SizeState::Idle,
			Ok((remaining, exhausted)) => {
				if work.stop_update {
					return;
				}
				work.size_pending = true;
				if exhausted || remaining == diff {
					debug!(
						"<balloon> {remaining:+} PFNs left, retrying in {} ms",
						self.backoff_ms
					);
					work.not_before_ms = now_ms + self.backoff_ms;
				}
			}
			Err(err) => {
				error!("<balloon> Size change failed: {err}");
				work.state = SizeState::Idle;
			}
		}
	}

	/// Detaches the driver from the device.
	///
	/// Stops queued work, waits for a running item, gives every page back to
	/// the allocator and resets the device.
	pub fn remove(&self) {
		if let Some(notifier) = self.oom_notifier.lock().take() {
			self.oom_chain.unregister(&notifier);
		}

		let waker = {
			let mut work = self.work.lock();
			work.stop_update = true;
			work.size_pending = false;
			work.stats_pending = false;
			work.waker.take()
		};
		if let Some(waker) = waker {
			waker.wake();
		}

		let _worker = self.worker.lock();

		let mut inner = self.balloon_lock.lock();
		loop {
			let num = self.num_pages();
			if num == 0 {
				break;
			}
			match self.leak_balloon(&mut inner, num) {
				Ok(0) => break,
				Ok(_) => {}
				Err(err) => {
					error!("<balloon> Unable to deflate while removing: {err}");
					break;
				}
			}
		}
		drop(inner);

		self.update_balloon_size();
		self.transport.reset_dev();

		*self.statsq.lock() = None;
		*self.miscq.lock() = None;

		info!("<balloon> Device {:#x} removed", self.dev_cfg.dev_id);
	}
}

impl Driver for VirtioBalloonDriver {
	fn get_name(&self) -> &'static str {
		"virtio-balloon"
	}
}

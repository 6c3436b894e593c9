use alloc::collections::TryReserveError;
use alloc::vec::Vec;

use crossbeam_utils::Backoff;

use crate::drivers::virtio::transport::Transport;
use crate::drivers::virtio::virtqueue::error::VirtqError;
use crate::drivers::virtio::virtqueue::{AvailBufferToken, VqIndex};

/// How to wait for the device to hand a buffer back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitMode {
	/// Suspend until the transport signals a used buffer.
	Blocking,
	/// Spin, for callers on which the host is waiting synchronously.
	Busy,
}

#[derive(Debug)]
enum VqBuffer {
	Idle(Vec<u8>),
	InFlight,
}

/// One outbound queue with its single reusable buffer.
///
/// The buffer is either owned by us or in flight, so a second request can't
/// be made available before the device returned the first one.
#[derive(Debug)]
pub(crate) struct BalloonVq {
	index: VqIndex,
	buffer: VqBuffer,
}

impl BalloonVq {
	pub fn new(index: VqIndex, capacity: usize) -> Self {
		Self {
			index,
			buffer: VqBuffer::Idle(Vec::with_capacity(capacity)),
		}
	}

	/// Like [`Self::new`], but fails instead of aborting if `capacity` bytes
	/// cannot be reserved.
	pub fn try_new(index: VqIndex, capacity: usize) -> Result<Self, TryReserveError> {
		let mut buf = Vec::new();
		buf.try_reserve_exact(capacity)?;
		Ok(Self {
			index,
			buffer: VqBuffer::Idle(buf),
		})
	}

	pub fn is_in_flight(&self) -> bool {
		matches!(self.buffer, VqBuffer::InFlight)
	}

	/// Fills the buffer, sends it and waits for the device to return it.
	pub fn send(
		&mut self,
		transport: &dyn Transport,
		fill: impl FnOnce(&mut Vec<u8>),
		mode: WaitMode,
	) -> Result<(), VirtqError> {
		self.wait_used(transport, mode)?;
		self.post(transport, fill)?;
		self.wait_used(transport, mode)
	}

	/// Fills the buffer and makes it available without waiting for it.
	///
	/// Returns `Ok(false)` and sends nothing if the previous buffer is
	/// still in flight.
	pub fn post(
		&mut self,
		transport: &dyn Transport,
		fill: impl FnOnce(&mut Vec<u8>),
	) -> Result<bool, VirtqError> {
		if !self.try_reclaim(transport)? {
			return Ok(false);
		}

		let VqBuffer::Idle(mut buf) = core::mem::replace(&mut self.buffer, VqBuffer::InFlight)
		else {
			return Ok(false);
		};

		buf.clear();
		fill(&mut buf);

		let tkn = match AvailBufferToken::new(buf, Vec::new()) {
			Ok(tkn) => tkn,
			Err(err) => {
				self.buffer = VqBuffer::Idle(Vec::new());
				return Err(err);
			}
		};

		trace!("<balloon> Dispatching buffer to queue {:?}", self.index);
		if let Err(err) = transport.dispatch(self.index, tkn) {
			// The token is gone, start over with a fresh buffer.
			self.buffer = VqBuffer::Idle(Vec::new());
			return Err(err);
		}
		transport.notify(self.index);

		Ok(true)
	}

	/// Takes the buffer back if the device returned it.
	///
	/// Returns whether we own the buffer afterwards.
	pub fn try_reclaim(&mut self, transport: &dyn Transport) -> Result<bool, VirtqError> {
		if !self.is_in_flight() {
			return Ok(true);
		}

		match transport.try_recv(self.index) {
			Ok(used) => {
				self.buffer = VqBuffer::Idle(used.send_buff);
				Ok(true)
			}
			Err(VirtqError::NoNewUsed) => Ok(false),
			Err(err) => Err(err),
		}
	}

	/// Waits until the device returned the buffer or the queue broke.
	pub fn wait_used(&mut self, transport: &dyn Transport, mode: WaitMode) -> Result<(), VirtqError> {
		let backoff = Backoff::new();

		loop {
			if self.try_reclaim(transport)? {
				return Ok(());
			}

			if transport.is_broken(self.index) {
				error!("<balloon> Queue {:?} is broken", self.index);
				return Err(VirtqError::Broken(self.index.into()));
			}

			match mode {
				WaitMode::Blocking => transport.wait_for_used(self.index),
				WaitMode::Busy => backoff.snooze(),
			}
		}
	}
}

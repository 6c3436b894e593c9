//! Answers the host's inquiries about unused guest memory.
//!
//! The host posts commands on the misc queue. For an inquiry the driver walks
//! the allocator's free lists and streams every free block back as a chunk,
//! the last buffer of a response carries [`MiscqFlags::COMPLETE`]. The ledger
//! is never touched.

use alloc::collections::TryReserveError;
use alloc::vec::Vec;

use bitflags::bitflags;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use zerocopy::FromBytes;

use super::chunk::{ChunkBatch, ChunkHeader, MiscqHeader, PageChunk, UnusedChunks};
use super::vq::{BalloonVq, WaitMode};
use crate::config::BalloonConfig;
use crate::drivers::virtio::transport::Transport;
use crate::drivers::virtio::virtqueue::error::VirtqError;
use crate::drivers::virtio::virtqueue::{AvailBufferToken, UsedBufferToken, VqIndex};
use crate::mm::{FreeBlockClass, PageAllocator, PageGeometry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u16)]
pub enum MiscqCmd {
	InquireUnusedPages = 0,
}

bitflags! {
	#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
	pub struct MiscqFlags: u16 {
		/// Last buffer of a response.
		const COMPLETE = 1 << 0;
	}
}

/// The misc queue: one receive buffer for commands, one send buffer for
/// responses.
#[derive(Debug)]
pub(crate) struct MiscQueue {
	index: VqIndex,
	/// The command buffer while it is not posted to the device.
	header: Option<Vec<u8>>,
	response: BalloonVq,
	batch: ChunkBatch<UnusedChunks>,
}

impl MiscQueue {
	pub fn try_new(index: VqIndex, config: &BalloonConfig) -> Result<Self, TryReserveError> {
		// Saturates so that oversized batches fail the reservation.
		let capacity = config
			.max_chunks
			.saturating_mul(size_of::<PageChunk>())
			.saturating_add(size_of::<MiscqHeader>() + size_of::<ChunkHeader>());

		Ok(Self {
			index,
			header: Some(Vec::new()),
			response: BalloonVq::try_new(index, capacity)?,
			batch: ChunkBatch::try_new(
				UnusedChunks {
					cmd: MiscqCmd::InquireUnusedPages,
					flags: MiscqFlags::empty(),
				},
				config.max_chunks,
			)?,
		})
	}

	/// Hands the command buffer to the device.
	pub fn post_header(&mut self, transport: &dyn Transport) -> Result<(), VirtqError> {
		let Some(mut buf) = self.header.take() else {
			// Already posted
			return Ok(());
		};
		buf.clear();
		buf.resize(size_of::<MiscqHeader>(), 0);

		let tkn = AvailBufferToken::new(Vec::new(), buf)?;
		transport.dispatch(self.index, tkn)?;
		transport.notify(self.index);

		Ok(())
	}

	/// Processes a command if the host sent one.
	///
	/// Returns whether a command buffer came back. Errors while answering are
	/// logged, the command buffer is posted again in any case.
	pub fn handle(
		&mut self,
		transport: &dyn Transport,
		allocator: &dyn PageAllocator,
		geometry: PageGeometry,
	) -> Result<bool, VirtqError> {
		let used = loop {
			match transport.try_recv(self.index) {
				Ok(used) if used.send_buff.is_empty() => break used,
				Ok(_) => debug!("<balloon:miscq> Dropping a stale response buffer"),
				Err(VirtqError::NoNewUsed) => return Ok(false),
				Err(err) => return Err(err),
			}
		};

		self.dispatch_command(transport, allocator, geometry, &used);

		self.header = Some(used.recv_buff);
		self.post_header(transport)?;

		Ok(true)
	}

	fn dispatch_command(
		&mut self,
		transport: &dyn Transport,
		allocator: &dyn PageAllocator,
		geometry: PageGeometry,
		used: &UsedBufferToken,
	) {
		let header = used
			.recv_buff
			.get(..used.used_len as usize)
			.and_then(|bytes| MiscqHeader::read_from_bytes(bytes).ok());
		let Some(header) = header else {
			warn!(
				"<balloon:miscq> Dropping command of {} bytes, expected {}",
				used.used_len,
				size_of::<MiscqHeader>()
			);
			return;
		};

		match MiscqCmd::try_from(header.cmd.get()) {
			Ok(cmd @ MiscqCmd::InquireUnusedPages) => {
				match self.send_unused(transport, allocator, geometry, cmd) {
					Ok(blocks) => debug!("<balloon:miscq> Reported {blocks} unused blocks"),
					Err(err) => error!("<balloon:miscq> Failed to report unused pages: {err}"),
				}
			}
			Err(_) => warn!(
				"<balloon:miscq> Ignoring unknown command {}",
				header.cmd.get()
			),
		}
	}

	/// Streams every free block of order one and above to the host.
	fn send_unused(
		&mut self,
		transport: &dyn Transport,
		allocator: &dyn PageAllocator,
		geometry: PageGeometry,
		cmd: MiscqCmd,
	) -> Result<u64, VirtqError> {
		let k = geometry.pfns_per_page();
		*self.batch.kind_mut() = UnusedChunks {
			cmd,
			flags: MiscqFlags::empty(),
		};

		let mut blocks = 0;
		for zone in 0..allocator.populated_zones() {
			for order in (1..allocator.max_order()).rev() {
				for migrate_type in 0..allocator.migrate_types() {
					let class = FreeBlockClass {
						zone,
						order,
						migrate_type,
					};

					let mut cursor = None;
					while let Some(pfn) = allocator.next_free_block(class, cursor) {
						self.batch.push(
							&mut self.response,
							transport,
							geometry.balloon_pfn(pfn),
							k << order,
						)?;
						blocks += 1;
						cursor = Some(pfn);
					}
				}
			}
		}

		self.batch.kind_mut().flags |= MiscqFlags::COMPLETE;
		self.batch
			.flush(&mut self.response, transport, WaitMode::Busy)?;

		Ok(blocks)
	}
}

//! This module contains the buffer tokens exchanged with a virtqueue.
//!
//! A token owns its buffers. Handing a token to
//! [`Transport::dispatch`](super::transport::Transport::dispatch) gives the
//! buffers to the device, they come back inside a [`UsedBufferToken`] once the
//! device is done with them.

use alloc::vec::Vec;

use self::error::VirtqError;

/// A u16 newtype. If instantiated via ``VqIndex::from(T)``, the newtype is ensured to be
/// smaller-equal to `min(u16::MAX , T::MAX)`.
///
/// Currently implements `From<u16>` and `From<u32>`.
#[derive(Copy, Clone, Debug, PartialOrd, Ord, PartialEq, Eq, Hash)]
pub struct VqIndex(u16);

impl From<u16> for VqIndex {
	fn from(val: u16) -> Self {
		VqIndex(val)
	}
}

impl From<VqIndex> for u16 {
	fn from(i: VqIndex) -> Self {
		i.0
	}
}

impl From<u32> for VqIndex {
	fn from(val: u32) -> Self {
		VqIndex(u16::try_from(val).unwrap_or(u16::MAX))
	}
}

/// Buffers made available to the device.
///
/// `send_buff` is read by the device, `recv_buff` is written by it.
#[derive(Debug)]
pub struct AvailBufferToken {
	pub send_buff: Vec<u8>,
	pub recv_buff: Vec<u8>,
}

impl AvailBufferToken {
	pub fn new(send_buff: Vec<u8>, recv_buff: Vec<u8>) -> Result<Self, VirtqError> {
		if send_buff.is_empty() && recv_buff.is_empty() {
			return Err(VirtqError::BufferNotSpecified);
		}

		Ok(Self {
			send_buff,
			recv_buff,
		})
	}
}

/// Buffers returned by the device, `used_len` bytes of `recv_buff` were written.
#[derive(Debug)]
pub struct UsedBufferToken {
	pub send_buff: Vec<u8>,
	pub recv_buff: Vec<u8>,
	pub used_len: u32,
}

impl From<AvailBufferToken> for UsedBufferToken {
	fn from(tkn: AvailBufferToken) -> Self {
		Self {
			send_buff: tkn.send_buff,
			recv_buff: tkn.recv_buff,
			used_len: 0,
		}
	}
}

pub mod error {
	use thiserror::Error;

	#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
	pub enum VirtqError {
		/// Call to create a BufferToken without any buffers to be inserted
		#[error("Virtq detected creation of Token, without a buffer")]
		BufferNotSpecified,
		/// No buffer has been returned by the device since the last call.
		#[error("No new used buffers in the virtq")]
		NoNewUsed,
		/// The device will never return buffers on this queue again.
		#[error("Virtq {0} is broken")]
		Broken(u16),
	}
}

#[cfg(test)]
mod tests {
	use alloc::vec;

	use super::*;

	#[test]
	fn index_conversion() {
		assert_eq!(u16::from(VqIndex::from(3u16)), 3);
		assert_eq!(u16::from(VqIndex::from(0x1_0000u32)), u16::MAX);
	}

	#[test]
	fn token_needs_a_buffer() {
		assert_eq!(
			AvailBufferToken::new(Vec::new(), Vec::new()).unwrap_err(),
			VirtqError::BufferNotSpecified
		);
		let used = UsedBufferToken::from(AvailBufferToken::new(vec![1], Vec::new()).unwrap());
		assert_eq!(used.send_buff, [1]);
		assert_eq!(used.used_len, 0);
	}
}

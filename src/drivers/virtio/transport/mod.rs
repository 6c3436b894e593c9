//! A module containing the interface to virtio's transport mechanisms.
//!
//! The kernel implements [`Transport`] for its PCI or MMIO device. The driver
//! only sees the device status handshake, the device specific configuration
//! space and its virtqueues.

use super::virtqueue::error::VirtqError;
use super::virtqueue::{AvailBufferToken, UsedBufferToken, VqIndex};

pub trait Transport: Send + Sync {
	/// Device id used in log messages.
	fn dev_id(&self) -> u16;

	/// Resets the device status field to zero.
	fn reset_dev(&self);

	/// Sets the ACKNOWLEDGE bit, the OS noticed the device.
	fn ack_dev(&self);

	/// Sets the DRIVER bit, the OS knows how to drive the device.
	fn set_drv(&self);

	/// Returns the 64 feature bits offered by the device.
	fn dev_features(&self) -> u64;

	/// Writes the feature bits accepted by the driver.
	fn set_drv_features(&self, features: u64);

	/// Sets the FEATURES_OK bit.
	fn features_ok(&self);

	/// Returns whether the device kept FEATURES_OK set.
	fn check_features(&self) -> bool;

	/// Sets the DRIVER_OK bit. The device is live afterwards.
	fn drv_ok(&self);

	/// Reads the device specific configuration space at byte `offset`.
	fn read_config_u32(&self, offset: usize) -> u32;

	/// Writes the device specific configuration space at byte `offset`.
	fn write_config_u32(&self, offset: usize, val: u32);

	/// Creates the virtqueue `index`.
	fn setup_vq(&self, index: VqIndex) -> Result<(), VirtqError>;

	/// Makes the buffers of `tkn` available to the device.
	///
	/// The token is dropped if it cannot be queued.
	fn dispatch(&self, index: VqIndex, tkn: AvailBufferToken) -> Result<(), VirtqError>;

	/// Notifies the device about new available buffers.
	fn notify(&self, index: VqIndex);

	/// Returns the next buffer the device is done with.
	///
	/// Fails with [`VirtqError::NoNewUsed`] if there is none.
	fn try_recv(&self, index: VqIndex) -> Result<UsedBufferToken, VirtqError>;

	/// Whether the queue stopped working for good.
	fn is_broken(&self, index: VqIndex) -> bool;

	/// Suspends the caller until a buffer was used on `index` or the queue broke.
	///
	/// Spurious returns are allowed.
	fn wait_for_used(&self, index: VqIndex);
}

//! A module containing the balloon driver, the driver trait and the virtio
//! infrastructure it sits on.

pub mod balloon;
pub mod virtio;

/// A trait to determine general driver information
pub trait Driver {
	/// Returns the device driver name
	fn get_name(&self) -> &'static str;
}

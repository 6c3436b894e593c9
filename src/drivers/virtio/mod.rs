//! A module containing the virtio infrastructure the balloon is built on.
//!
//! The kernel supplies the actual transport (PCI or MMIO) through
//! [`transport::Transport`], buffers travel in the tokens of [`virtqueue`].
pub mod transport;
pub mod virtqueue;

// Copyright (c) 2017 Stefan Lankes, RWTH Aachen University
//                    Colin Finck, RWTH Aachen University
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Guest side of the VIRTIO traditional memory balloon.
//!
//! The driver keeps the ledger of pages handed to the hypervisor, reports page
//! sets either as flat PFN arrays or as run-length chunks, swaps pages for the
//! compaction subsystem and answers the hypervisor's inquiries about unused
//! memory. The page allocator, the virtqueue transport and the statistics
//! source are supplied by the embedding kernel through the traits in [`mm`],
//! [`drivers::virtio::transport`] and [`drivers::balloon::stats`].

#![no_std]
#![warn(clippy::all)]
#![allow(clippy::tabs_in_doc_comments)]

extern crate alloc;
#[cfg(test)]
extern crate std;
#[macro_use]
extern crate log;

#[macro_use]
pub mod logging;

pub mod config;
pub mod drivers;
pub mod executor;
pub mod mm;

pub use crate::config::BalloonConfig;
pub use crate::drivers::balloon::{VirtioBalloonDriver, VirtioBalloonError};

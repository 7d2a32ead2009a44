// SPDX-License-Identifier: MPL-2.0

//! A software RAID virtual block device.
//!
//! This crate composes several backing block devices into one logical block
//! device with the standard block I/O contract (READ, WRITE, FLUSH, UNMAP,
//! RESET). RAID personalities (striping, mirroring, concatenation) plug in
//! behind a uniform capability interface, and a superblock persisted on each
//! member device lets an array be reassembled after a restart or on another
//! host.
//!
//! The building blocks:
//!
//! - [`personality`]: the capability interface personalities implement and
//!   the process-wide registry keyed by RAID level.
//! - [`superblock`]: the fixed-layout on-disk metadata record and its codec.
//! - [`array`]: array and slot records, the array registry and the
//!   lifecycle engine (create, assemble, configure, deconfigure, delete).
//! - [`io`]: per-thread I/O channels and the per-request fan-out accounting
//!   that splits one logical I/O across several member I/Os.
//! - [`member`]: adding, removing and growing members at runtime.
//! - [`rpc`]: the JSON control contract.
//!
//! Call [`init`] once before using the crate; it installs the built-in
//! personalities and hooks the examine engine into the block layer so newly
//! registered devices are matched to arrays automatically.

pub mod array;
mod concat;
mod error;
mod examine;
pub mod io;
pub mod member;
pub mod personality;
pub mod rpc;
pub mod superblock;

mod prelude;
mod raid0;
mod raid1;
mod util;

use std::sync::Arc;

use spin::Once;

pub use self::error::{Errno, Error};

static INIT: Once = Once::new();

/// Installs the built-in personalities and the examine hook. Idempotent.
pub fn init() {
    INIT.call_once(|| {
        let builtins: [Arc<dyn personality::Personality>; 3] = [
            Arc::new(raid0::Raid0),
            Arc::new(raid1::Raid1),
            Arc::new(concat::Concat),
        ];
        for builtin in builtins {
            if let Err(e) = personality::register(builtin) {
                log::warn!("built-in personality registration failed: {}", e);
            }
        }
        vraid_block::add_examine_hook(Arc::new(|bdev| examine::examine(bdev)));
    });
}

// SPDX-License-Identifier: MPL-2.0

//! The block-layer contract consumed by virtual block devices.
//!
//! This crate provides a number of base components for block devices: an
//! abstraction of block devices, the registration and lookup of block
//! devices, single-claim ownership, device event listeners, and examine hooks
//! that fire whenever a new device becomes visible.
//!
//! Block devices use a queue-based model for asynchronous I/O operations. The
//! users submit I/O requests and wait for their completion, or attach a
//! completion callback. Drivers implementing block devices complete the
//! submitted bios when the request finishes.
//!
//! ```ignore
//! // Creates a bio request.
//! let bio = Bio::new(BioType::Write, 0..8, segments, None);
//! // Submits to the block device.
//! let bio_waiter = bio.submit(&bdev)?;
//! // Waits for the completion.
//! let Some(status) = bio_waiter.wait() else {
//!     return Err(IoError);
//! };
//! assert!(status == BioStatus::Complete);
//! ```

pub mod bio;
mod mem_bdev;
mod wait;

use core::{
    any::Any,
    fmt::Debug,
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
};
use std::{
    collections::{BTreeMap, VecDeque},
    sync::Arc,
};

use bitflags::bitflags;
use spin::{Mutex as SpinLock, Once};
use uuid::Uuid;

pub use self::{mem_bdev::MemBdev, wait::WaitQueue};
use self::bio::{BioEnqueueError, BioType, SubmittedBio};

/// The interface a block device driver implements.
pub trait BlockDevice: Send + Sync + Any + Debug {
    /// Enqueues a new `SubmittedBio` to the block device.
    fn enqueue(&self, bio: SubmittedBio) -> Result<(), BioEnqueueError>;

    /// Returns the metadata of the block device.
    fn metadata(&self) -> BlockDeviceMeta;

    /// Runs the device's teardown after it left the registry.
    ///
    /// `done` must be invoked exactly once, possibly from a later callback if
    /// teardown suspends.
    fn on_unregister(&self, done: Box<dyn FnOnce() + Send>) {
        done();
    }
}

impl dyn BlockDevice {
    pub fn downcast_ref<T: BlockDevice>(&self) -> Option<&T> {
        (self as &dyn Any).downcast_ref::<T>()
    }
}

bitflags! {
    /// The I/O types a device supports.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DeviceCaps: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const FLUSH = 1 << 2;
        const UNMAP = 1 << 3;
        const RESET = 1 << 4;
    }
}

impl DeviceCaps {
    /// Returns whether the capability set covers the given bio type.
    pub fn supports(&self, type_: BioType) -> bool {
        let needed = match type_ {
            BioType::Read => Self::READ,
            BioType::Write => Self::WRITE,
            BioType::Flush => Self::FLUSH,
            BioType::Unmap => Self::UNMAP,
            BioType::Reset => Self::RESET,
        };
        self.contains(needed)
    }
}

/// The metadata format of a device's per-block metadata region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetadataFormat {
    /// Metadata bytes per block; zero means no metadata.
    pub md_len: u32,
    /// Whether metadata is interleaved with data.
    pub interleaved: bool,
    /// Whether end-to-end data protection (DIF/DIX) is enabled.
    pub dif_enabled: bool,
}

/// Metadata for a block device.
#[derive(Debug, Clone, Copy)]
pub struct BlockDeviceMeta {
    /// The block size in bytes.
    pub block_size: u32,
    /// The total number of blocks of the block device.
    pub num_blocks: u64,
    /// The identity of the device.
    pub uuid: Uuid,
    /// The preferred I/O split boundary in blocks; zero means none.
    pub optimal_io_boundary: u64,
    /// The I/O types the device supports.
    pub caps: DeviceCaps,
    /// The per-block metadata format.
    pub metadata_format: MetadataFormat,
}

/// An event on a registered block device, delivered to open descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceEvent {
    /// The device is being removed.
    Remove,
    /// The device's capacity changed.
    Resize,
}

type EventFn = dyn Fn(DeviceEvent) + Send + Sync;
type ExamineFn = dyn Fn(&Arc<Bdev>) + Send + Sync;
type IoWaiterFn = Box<dyn FnOnce() + Send>;

/// A registered block device.
///
/// Wraps the driver-provided `BlockDevice` with the state the block layer
/// maintains for it: its name, single-claim ownership, event listeners of
/// open descriptors, and the queue of I/O submitters parked on transient
/// resource exhaustion.
pub struct Bdev {
    name: String,
    device: Arc<dyn BlockDevice>,
    claimed: AtomicBool,
    listeners: SpinLock<BTreeMap<u64, Arc<EventFn>>>,
    io_waiters: SpinLock<VecDeque<IoWaiterFn>>,
}

impl Debug for Bdev {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("Bdev")
            .field("name", &self.name)
            .field("claimed", &self.claimed)
            .finish_non_exhaustive()
    }
}

impl Bdev {
    fn new(name: String, device: Arc<dyn BlockDevice>) -> Arc<Self> {
        Arc::new(Self {
            name,
            device,
            claimed: AtomicBool::new(false),
            listeners: SpinLock::new(BTreeMap::new()),
            io_waiters: SpinLock::new(VecDeque::new()),
        })
    }

    /// Returns the registered name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the underlying device.
    pub fn device(&self) -> &Arc<dyn BlockDevice> {
        &self.device
    }

    /// Returns the metadata of the underlying device.
    pub fn metadata(&self) -> BlockDeviceMeta {
        self.device.metadata()
    }

    pub(crate) fn enqueue(&self, bio: SubmittedBio) -> Result<(), BioEnqueueError> {
        self.device.enqueue(bio)
    }

    /// Claims exclusive ownership of the device.
    ///
    /// Returns `false` if the device is already claimed.
    pub fn claim(&self) -> bool {
        self.claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Releases a claim taken with [`Bdev::claim`].
    pub fn release_claim(&self) {
        self.claimed.store(false, Ordering::Release);
    }

    /// Returns whether the device is currently claimed.
    pub fn is_claimed(&self) -> bool {
        self.claimed.load(Ordering::Acquire)
    }

    /// Parks a submitter until the device signals I/O capacity.
    ///
    /// Drivers report transient exhaustion with `BioEnqueueError::IsFull`;
    /// the submitter registers a waiter here and resubmits from it.
    pub fn add_io_waiter(&self, waiter: IoWaiterFn) {
        self.io_waiters.lock().push_back(waiter);
    }

    /// Signals that the device has I/O capacity again, releasing all parked
    /// submitters.
    pub fn notify_io_capacity(&self) {
        let waiters: Vec<_> = {
            let mut queue = self.io_waiters.lock();
            queue.drain(..).collect()
        };
        for waiter in waiters {
            waiter();
        }
    }

    /// Delivers an event to every open descriptor's listener.
    pub fn notify_event(&self, event: DeviceEvent) {
        let listeners: Vec<_> = self.listeners.lock().values().cloned().collect();
        for listener in listeners {
            listener(event);
        }
    }
}

/// An open descriptor to a registered block device.
///
/// Opening attaches an event listener; the listener is detached when the
/// descriptor is closed (or dropped).
pub struct BdevDesc {
    bdev: Arc<Bdev>,
    listener_id: u64,
    closed: AtomicBool,
}

impl Debug for BdevDesc {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("BdevDesc")
            .field("bdev", &self.bdev.name())
            .finish_non_exhaustive()
    }
}

static LISTENER_ID: AtomicU64 = AtomicU64::new(0);

impl BdevDesc {
    /// Opens the device registered under `name`.
    pub fn open(
        name: &str,
        event_cb: impl Fn(DeviceEvent) + Send + Sync + 'static,
    ) -> Option<Arc<Self>> {
        let bdev = get_device(name)?;
        let listener_id = LISTENER_ID.fetch_add(1, Ordering::Relaxed);
        bdev.listeners.lock().insert(listener_id, Arc::new(event_cb));
        Some(Arc::new(Self {
            bdev,
            listener_id,
            closed: AtomicBool::new(false),
        }))
    }

    /// Returns the registered device this descriptor refers to.
    pub fn bdev(&self) -> &Arc<Bdev> {
        &self.bdev
    }

    /// Closes the descriptor, detaching its event listener.
    pub fn close(&self) {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.bdev.listeners.lock().remove(&self.listener_id);
        }
    }
}

impl Drop for BdevDesc {
    fn drop(&mut self) {
        self.close();
    }
}

static COMPONENT: Once<Component> = Once::new();

struct Component {
    bdev_table: SpinLock<BTreeMap<String, Arc<Bdev>>>,
    examine_hooks: SpinLock<Vec<Arc<ExamineFn>>>,
}

fn component() -> &'static Component {
    COMPONENT.call_once(|| Component {
        bdev_table: SpinLock::new(BTreeMap::new()),
        examine_hooks: SpinLock::new(Vec::new()),
    })
}

/// Registers a block device under `name` and fires the examine hooks.
///
/// Returns the registered `Bdev`, or `None` if the name is already in use.
pub fn register_device(name: &str, device: Arc<dyn BlockDevice>) -> Option<Arc<Bdev>> {
    let bdev = {
        let mut table = component().bdev_table.lock();
        if table.contains_key(name) {
            return None;
        }
        let bdev = Bdev::new(name.to_string(), device);
        table.insert(name.to_string(), bdev.clone());
        bdev
    };
    log::debug!("block device {} registered", name);

    let hooks: Vec<_> = component().examine_hooks.lock().clone();
    for hook in hooks {
        hook(&bdev);
    }
    Some(bdev)
}

/// Unregisters the block device named `name`.
///
/// Open descriptors observe a `Remove` event first; the device's own
/// teardown then runs and `done` fires when it finishes.
pub fn unregister_device(name: &str, done: Option<Box<dyn FnOnce() + Send>>) -> bool {
    let Some(bdev) = component().bdev_table.lock().remove(name) else {
        return false;
    };
    log::debug!("block device {} unregistered", name);

    bdev.notify_event(DeviceEvent::Remove);
    bdev.device.on_unregister(Box::new(move || {
        if let Some(done) = done {
            done();
        }
    }));
    true
}

/// Looks up a registered device by name.
pub fn get_device(name: &str) -> Option<Arc<Bdev>> {
    component().bdev_table.lock().get(name).cloned()
}

/// Returns every registered device.
pub fn all_devices() -> Vec<Arc<Bdev>> {
    component().bdev_table.lock().values().cloned().collect()
}

/// Adds a hook invoked for every subsequently registered device.
pub fn add_examine_hook(hook: Arc<ExamineFn>) {
    component().examine_hooks.lock().push(hook);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_rejects_duplicate_names() {
        let mem = MemBdev::create(16, 512);
        assert!(register_device("blk_dup", mem.clone()).is_some());
        assert!(register_device("blk_dup", mem).is_none());
    }

    #[test]
    fn claim_is_exclusive() {
        let mem = MemBdev::create(16, 512);
        let bdev = register_device("blk_claim", mem).unwrap();
        assert!(bdev.claim());
        assert!(!bdev.claim());
        bdev.release_claim();
        assert!(bdev.claim());
    }

    #[test]
    fn descriptor_listener_sees_remove_event() {
        let mem = MemBdev::create(16, 512);
        register_device("blk_ev", mem).unwrap();

        let seen = Arc::new(AtomicBool::new(false));
        let seen2 = seen.clone();
        let _desc = BdevDesc::open("blk_ev", move |event| {
            if event == DeviceEvent::Remove {
                seen2.store(true, Ordering::Relaxed);
            }
        })
        .unwrap();

        assert!(unregister_device("blk_ev", None));
        assert!(seen.load(Ordering::Relaxed));
        assert!(get_device("blk_ev").is_none());
    }
}

// SPDX-License-Identifier: MPL-2.0

//! The data path: per-thread I/O channels, the per-request context with its
//! partial-completion accumulator, the core RESET fan-out, transient-resource
//! retry, the quiesce gate and the block-device front end of an array.

use core::{
    any::Any,
    sync::atomic::{AtomicU64, Ordering},
};

use std::sync::Weak;

use spin::Mutex as SpinLock;
use vraid_block::{
    bio::{Bio, BioEnqueueError, BioSegment, BioStatus, BioType, SubmittedBio},
    BlockDevice, BlockDeviceMeta, DeviceCaps, MetadataFormat,
};

use crate::{
    array::{RaidBdev, RaidState},
    prelude::*,
};

/// The per-thread fan-out holder of one array: one backing descriptor per
/// slot plus one personality-private channel.
///
/// A `None` entry marks an empty or failed slot; member removal nulls the
/// entry in every live channel before the descriptor is released.
pub struct RaidIoChannel {
    pub(crate) base_channels: Vec<Option<Arc<vraid_block::BdevDesc>>>,
    pub(crate) module_channel: Option<Box<dyn Any + Send>>,
}

impl RaidIoChannel {
    pub(crate) fn new(array: &Arc<RaidBdev>) -> Self {
        let base_channels = array
            .slots()
            .iter()
            .map(|slot| slot.desc.clone())
            .collect();
        Self {
            base_channels,
            module_channel: array.personality().create_channel(array),
        }
    }
}

impl Debug for RaidIoChannel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("RaidIoChannel")
            .field(
                "base_channels",
                &self
                    .base_channels
                    .iter()
                    .map(Option::is_some)
                    .collect::<Vec<_>>(),
            )
            .finish_non_exhaustive()
    }
}

/// The outcome of one child-bio submission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildSubmit {
    /// The child was accepted by the backing device.
    Submitted,
    /// Transient resource exhaustion; the request is parked on the device's
    /// wait queue and will be re-dispatched from `submitted`.
    Parked,
    /// Hard submission failure.
    Failed,
}

type CompletionCb = Box<dyn FnOnce(&RaidIo, BioStatus) + Send>;

/// The per-request context of one logical I/O against an array.
pub struct RaidIo {
    self_weak: Weak<RaidIo>,
    array: Arc<RaidBdev>,
    channel: Arc<SpinLock<RaidIoChannel>>,
    type_: BioType,
    offset_blocks: u64,
    num_blocks: u64,
    segments: Vec<BioSegment>,
    /// Outstanding completion deltas; the logical I/O finishes when this
    /// reaches zero.
    remaining: AtomicU64,
    /// Child I/Os dispatched so far; parked submissions resume from here.
    submitted: AtomicU64,
    /// Rolled-up status: success never overwrites a failure.
    status: SpinLock<BioStatus>,
    parent: SubmittedBio,
    completion_cb: SpinLock<Option<CompletionCb>>,
}

impl Debug for RaidIo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("RaidIo")
            .field("array", &self.array.name())
            .field("type", &self.type_)
            .field("offset_blocks", &self.offset_blocks)
            .field("num_blocks", &self.num_blocks)
            .field("remaining", &self.remaining)
            .field("submitted", &self.submitted)
            .finish_non_exhaustive()
    }
}

impl RaidIo {
    pub fn array(&self) -> &Arc<RaidBdev> {
        &self.array
    }

    pub fn type_(&self) -> BioType {
        self.type_
    }

    pub fn offset_blocks(&self) -> u64 {
        self.offset_blocks
    }

    pub fn num_blocks(&self) -> u64 {
        self.num_blocks
    }

    pub fn segments(&self) -> &[BioSegment] {
        &self.segments
    }

    /// Returns the backing descriptor of `slot` in this request's channel, or
    /// `None` for an empty or failed slot.
    pub fn base_channel(&self, slot: usize) -> Option<Arc<vraid_block::BdevDesc>> {
        self.channel.lock().base_channels.get(slot).cloned().flatten()
    }

    /// Runs `f` against the personality-private channel state.
    pub fn with_module_channel<R>(&self, f: impl FnOnce(Option<&mut (dyn Any + Send)>) -> R) -> R {
        let mut channel = self.channel.lock();
        f(channel.module_channel.as_deref_mut())
    }

    /// Sets the number of completion deltas this request waits for.
    ///
    /// Must be called before any child is dispatched.
    pub fn set_remaining(&self, remaining: u64) {
        self.remaining.store(remaining, Ordering::Release);
    }

    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Acquire)
    }

    pub fn inc_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::AcqRel);
    }

    /// Intercepts the final completion; the callback becomes responsible for
    /// completing the logical I/O.
    pub fn set_completion_cb(&self, cb: CompletionCb) {
        *self.completion_cb.lock() = Some(cb);
    }

    /// The partial-completion accumulator.
    ///
    /// Subtracts `delta` from the outstanding count, rolls a non-success
    /// `status` into the request status, and on reaching zero either invokes
    /// the interception callback or completes the logical I/O.
    ///
    /// Returns whether the request finished.
    ///
    /// # Panics
    ///
    /// If `delta` exceeds the outstanding count, this method will panic; the
    /// accumulator never underflows.
    pub fn complete_part(&self, delta: u64, status: BioStatus) -> bool {
        let previous = self.remaining.fetch_sub(delta, Ordering::AcqRel);
        assert!(previous >= delta, "partial completion underflow");

        if status != BioStatus::Complete {
            *self.status.lock() = status;
        }

        if previous != delta {
            return false;
        }

        let rolled_up = *self.status.lock();
        let interception = self.completion_cb.lock().take();
        match interception {
            Some(cb) => cb(self, rolled_up),
            None => self.complete(rolled_up),
        }
        true
    }

    /// Completes the logical I/O with `status`.
    pub fn complete(&self, status: BioStatus) {
        self.parent.complete(status);
        self.array.io_finished();
    }

    /// Submits one child bio to `slot`, with transient-exhaustion parking.
    ///
    /// On `Parked`, `retry` re-enters the submit path once the backing device
    /// signals capacity; submission then resumes from [`RaidIo::submitted`].
    pub fn submit_child(
        &self,
        slot: usize,
        type_: BioType,
        range: core::ops::Range<u64>,
        segments: Vec<BioSegment>,
        retry: fn(&Arc<RaidIo>),
    ) -> ChildSubmit {
        let Some(desc) = self.base_channel(slot) else {
            return ChildSubmit::Failed;
        };
        let Some(this) = self.self_weak.upgrade() else {
            return ChildSubmit::Failed;
        };

        let bio = Bio::new(
            type_,
            range,
            segments,
            Some(Box::new(move |_child, status| {
                this.complete_part(1, status);
            })),
        );

        match bio.submit(desc.bdev()) {
            Ok(_waiter) => ChildSubmit::Submitted,
            Err(BioEnqueueError::IsFull) => match self.self_weak.upgrade() {
                Some(this) => {
                    desc.bdev().add_io_waiter(Box::new(move || retry(&this)));
                    ChildSubmit::Parked
                }
                None => ChildSubmit::Failed,
            },
            Err(_) => ChildSubmit::Failed,
        }
    }
}

/// The core RESET fan-out: one child per slot, where an empty or failed slot
/// counts immediately as success.
fn submit_reset(io: &Arc<RaidIo>) {
    let num_slots = io.array().num_base_bdevs() as u64;
    if io.submitted() == 0 {
        io.set_remaining(num_slots);
    }

    while io.submitted() < num_slots {
        let slot = io.submitted() as usize;
        if io.base_channel(slot).is_none() {
            io.inc_submitted();
            if io.complete_part(1, BioStatus::Complete) {
                return;
            }
            continue;
        }

        match io.submit_child(slot, BioType::Reset, 0..0, Vec::new(), submit_reset) {
            ChildSubmit::Submitted => io.inc_submitted(),
            ChildSubmit::Parked => return,
            ChildSubmit::Failed => {
                let unaccounted = num_slots - io.submitted();
                io.complete_part(unaccounted, BioStatus::IoError);
                return;
            }
        }
    }
}

/// Returns (creating on first use) the calling thread's channel of `array`.
fn current_channel(array: &Arc<RaidBdev>) -> Arc<SpinLock<RaidIoChannel>> {
    let thread_id = std::thread::current().id();
    if let Some(channel) = array.channels.lock().get(&thread_id) {
        return channel.clone();
    }
    // Channel creation scans the slot array, so it happens outside the
    // channel-table lock.
    let channel = Arc::new(SpinLock::new(RaidIoChannel::new(array)));
    array
        .channels
        .lock()
        .entry(thread_id)
        .or_insert(channel)
        .clone()
}

impl RaidBdev {
    /// Updates `slot`'s entry in every live channel.
    ///
    /// Walks the channels one at a time; a removal nulls the entry before the
    /// descriptor itself is released, so data-path threads stop seeing the
    /// slot first.
    pub(crate) fn channels_set_slot(&self, slot: usize, desc: Option<Arc<vraid_block::BdevDesc>>) {
        let channels: Vec<_> = self.channels.lock().values().cloned().collect();
        for channel in channels {
            let mut guard = channel.lock();
            if guard.base_channels.len() <= slot {
                guard.base_channels.resize(slot + 1, None);
            }
            guard.base_channels[slot] = desc.clone();
        }
    }

    pub(crate) fn io_finished(&self) {
        let previous = self.io_inflight.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0);
        if previous == 1 && self.quiesced.load(Ordering::Acquire) {
            self.fire_quiesce_waiters();
        }
    }

    fn fire_quiesce_waiters(&self) {
        let waiters: Vec<_> = self.quiesce_waiters.lock().drain(..).collect();
        for waiter in waiters {
            waiter();
        }
    }

    /// Stalls logical I/O; `done` fires once every accepted I/O has drained.
    pub(crate) fn quiesce(&self, done: Box<dyn FnOnce() + Send>) -> Result<()> {
        if self.quiesced.swap(true, Ordering::AcqRel) {
            return_errno_with_msg!(Busy, "array already quiesced");
        }
        self.quiesce_waiters.lock().push(done);
        if self.io_inflight.load(Ordering::Acquire) == 0 {
            self.fire_quiesce_waiters();
        }
        Ok(())
    }

    /// Resumes logical I/O, re-dispatching everything parked by the gate.
    pub(crate) fn unquiesce(&self) {
        self.quiesced.store(false, Ordering::Release);
        let parked: Vec<_> = self.frozen_ios.lock().drain(..).collect();
        for bio in parked {
            self.dispatch_bio(bio);
        }
    }

    /// Computes whether the array supports `type_`: every configured slot's
    /// backing device must support it, and FLUSH/UNMAP additionally need a
    /// null-payload submitter from the personality.
    pub fn io_type_supported(&self, type_: BioType) -> bool {
        if matches!(type_, BioType::Flush | BioType::Unmap)
            && !self.personality().supports_null_payload()
        {
            return false;
        }

        let slots = self.slots();
        let mut any = false;
        for slot in slots.iter() {
            let Some(desc) = slot.desc.as_ref() else {
                continue;
            };
            any = true;
            if !desc.bdev().metadata().caps.supports(type_) {
                return false;
            }
        }
        any
    }

    fn dispatch_bio(&self, bio: SubmittedBio) {
        let Some(array) = self.self_arc() else {
            bio.complete(BioStatus::IoError);
            return;
        };
        if self.state() != RaidState::Online {
            bio.complete(BioStatus::IoError);
            return;
        }
        if self.quiesced.load(Ordering::Acquire) {
            self.frozen_ios.lock().push(bio);
            return;
        }

        self.io_inflight.fetch_add(1, Ordering::AcqRel);
        let channel = current_channel(&array);
        let type_ = bio.type_();
        let range = bio.range().clone();
        let io = Arc::new_cyclic(|weak| RaidIo {
            self_weak: weak.clone(),
            array,
            channel,
            type_,
            offset_blocks: range.start,
            num_blocks: range.end - range.start,
            segments: bio.segments().to_vec(),
            remaining: AtomicU64::new(0),
            submitted: AtomicU64::new(0),
            status: SpinLock::new(BioStatus::Complete),
            parent: bio,
            completion_cb: SpinLock::new(None),
        });

        match type_ {
            BioType::Read | BioType::Write => self.personality().submit_rw(&io),
            BioType::Flush | BioType::Unmap => {
                if self.personality().supports_null_payload() {
                    self.personality().submit_null_payload(&io);
                } else {
                    io.complete(BioStatus::NotSupported);
                }
            }
            BioType::Reset => submit_reset(&io),
        }
    }
}

impl BlockDevice for RaidBdev {
    fn enqueue(&self, bio: SubmittedBio) -> core::result::Result<(), BioEnqueueError> {
        self.dispatch_bio(bio);
        Ok(())
    }

    fn metadata(&self) -> BlockDeviceMeta {
        let mut caps = DeviceCaps::empty();
        for type_ in [
            BioType::Read,
            BioType::Write,
            BioType::Flush,
            BioType::Unmap,
            BioType::Reset,
        ] {
            if self.io_type_supported(type_) {
                caps |= match type_ {
                    BioType::Read => DeviceCaps::READ,
                    BioType::Write => DeviceCaps::WRITE,
                    BioType::Flush => DeviceCaps::FLUSH,
                    BioType::Unmap => DeviceCaps::UNMAP,
                    BioType::Reset => DeviceCaps::RESET,
                };
            }
        }

        BlockDeviceMeta {
            block_size: self.block_size(),
            num_blocks: self.num_blocks(),
            uuid: self.uuid(),
            optimal_io_boundary: self.strip_size() as u64,
            caps,
            metadata_format: MetadataFormat::default(),
        }
    }

    fn on_unregister(&self, done: Box<dyn FnOnce() + Send>) {
        self.destruct(done);
    }
}

#[cfg(test)]
mod tests {
    use core::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use vraid_block::{
        bio::{Bio, BioSegment, BioStatus, BioType},
        DeviceCaps, MemBdev,
    };

    use crate::test_util::*;

    #[test]
    fn every_logical_io_completes_exactly_once() {
        let _mems = mem_devices("acct", 2, 2048, 4096);
        let _array = build_array("acct_arr", "raid0", 64, &names("acct", 2), false).unwrap();
        let frontend = vraid_block::get_device("acct_arr").unwrap();

        let completions = Arc::new(AtomicUsize::new(0));
        let submissions = 7;
        for index in 0..submissions {
            // Span several strips so each logical I/O fans out to multiple
            // children.
            let nblocks = 40u64;
            let segment = BioSegment::from_slice(&pattern((nblocks << 12) as usize, index as u8));
            let counter = completions.clone();
            let bio = Bio::new(
                BioType::Write,
                (index * 64)..(index * 64 + nblocks),
                vec![segment],
                Some(Box::new(move |_bio, status| {
                    assert_eq!(status, BioStatus::Complete);
                    counter.fetch_add(1, Ordering::Relaxed);
                })),
            );
            let _ = bio.submit(&frontend).unwrap();
        }
        assert_eq!(completions.load(Ordering::Relaxed), submissions as usize);
    }

    #[test]
    fn reset_retries_after_transient_exhaustion() {
        let mems = mem_devices("io6", 2, 8192, 512);
        let _array = build_array("io6_arr", "raid1", 0, &names("io6", 2), false).unwrap();
        let frontend = vraid_block::get_device("io6_arr").unwrap();

        mems[1].set_enqueue_full(true);
        let status = Arc::new(spin::Mutex::new(None));
        let status_in = status.clone();
        let bio = Bio::new(
            BioType::Reset,
            0..0,
            Vec::new(),
            Some(Box::new(move |_bio, status| {
                *status_in.lock() = Some(status);
            })),
        );
        let _waiter = bio.submit(&frontend).unwrap();

        // The second child hit the full queue; the request is parked, not
        // completed and not failed.
        assert_eq!(*status.lock(), None);

        // Capacity returns; submission resumes from the saved index and the
        // aggregated status is success.
        mems[1].set_enqueue_full(false);
        vraid_block::get_device("io6_1").unwrap().notify_io_capacity();
        assert_eq!(*status.lock(), Some(BioStatus::Complete));
    }

    #[test]
    fn reset_counts_missing_slots_as_success() {
        let _mems = mem_devices("rstm", 2, 8192, 512);
        let array = build_array("rstm_arr", "raid1", 0, &names("rstm", 2), false).unwrap();
        let frontend = vraid_block::get_device("rstm_arr").unwrap();

        crate::member::remove_base_bdev("rstm_0", None).unwrap();
        assert_eq!(array.num_base_bdevs_operational(), 1);
        assert_eq!(bdev_reset(&frontend), BioStatus::Complete);
    }

    #[test]
    fn io_type_support_is_the_intersection_of_members() {
        crate::init();
        let full = MemBdev::create(8192, 512);
        vraid_block::register_device("caps_0", full).unwrap();
        let no_unmap =
            MemBdev::create_with_caps(8192, 512, DeviceCaps::all().difference(DeviceCaps::UNMAP));
        vraid_block::register_device("caps_1", no_unmap).unwrap();

        let array = build_array(
            "caps_arr",
            "raid1",
            0,
            &["caps_0".to_string(), "caps_1".to_string()],
            false,
        )
        .unwrap();
        let frontend = vraid_block::get_device("caps_arr").unwrap();

        assert!(array.io_type_supported(BioType::Read));
        assert!(array.io_type_supported(BioType::Write));
        assert!(array.io_type_supported(BioType::Flush));
        assert!(!array.io_type_supported(BioType::Unmap));
        assert!(!frontend.metadata().caps.supports(BioType::Unmap));

        assert_eq!(bdev_flush(&frontend), BioStatus::Complete);
        // The member without unmap support rolls its status into the logical
        // completion.
        assert_eq!(bdev_unmap(&frontend, 0, 8), BioStatus::NotSupported);
    }

    #[test]
    fn quiesce_parks_new_io_until_unquiesce() {
        let _mems = mem_devices("qgate", 2, 8192, 512);
        let array = build_array("qgate_arr", "raid1", 0, &names("qgate", 2), false).unwrap();
        let frontend = vraid_block::get_device("qgate_arr").unwrap();

        let drained = Arc::new(AtomicUsize::new(0));
        let drained_in = drained.clone();
        array
            .quiesce(Box::new(move || {
                drained_in.fetch_add(1, Ordering::Relaxed);
            }))
            .unwrap();
        assert_eq!(drained.load(Ordering::Relaxed), 1);

        let status = Arc::new(spin::Mutex::new(None));
        let status_in = status.clone();
        let segment = BioSegment::from_slice(&pattern(512, 1));
        let bio = Bio::new(
            BioType::Write,
            0..1,
            vec![segment],
            Some(Box::new(move |_bio, status| {
                *status_in.lock() = Some(status);
            })),
        );
        let _waiter = bio.submit(&frontend).unwrap();
        assert_eq!(*status.lock(), None);

        array.unquiesce();
        assert_eq!(*status.lock(), Some(BioStatus::Complete));
    }

    #[test]
    fn offline_arrays_fail_io() {
        let _mems = mem_devices("offl", 2, 8192, 512);
        let array = build_array("offl_arr", "raid1", 0, &names("offl", 2), false).unwrap();
        let frontend = vraid_block::get_device("offl_arr").unwrap();

        array.delete(None).unwrap();
        let segment = BioSegment::from_slice(&pattern(512, 2));
        let bio = Bio::new(BioType::Write, 0..1, vec![segment], None);
        assert_eq!(bio.submit_and_wait(&frontend).unwrap(), BioStatus::IoError);
    }
}
